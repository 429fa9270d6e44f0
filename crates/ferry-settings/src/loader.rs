//! Layered configuration loading.
//!
//! Loads and merges configuration from two locations:
//! 1. Global: `~/.config/ferry/ferry.toml`
//! 2. Project: `<workspace>/.ferry/ferry.toml`
//!
//! Project values take precedence for every field that is explicitly set.

use crate::FerryConfig;
use std::path::{Path, PathBuf};

/// Loads and merges `FerryConfig` from global and project-level files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the merged configuration for the given workspace.
    ///
    /// Reads the global config (`~/.config/ferry/ferry.toml`), then the
    /// project config (`<workspace>/.ferry/ferry.toml`), and merges them.
    /// Missing files are silently skipped. Parse errors emit a warning to
    /// stderr and the file is treated as if absent.
    pub fn load(workspace: &Path) -> FerryConfig {
        let global = Self::load_optional(&Self::global_config_path());
        let project = Self::load_optional(&Self::project_config_path(workspace));
        global.merge(project)
    }

    /// Absolute path to the global config file.
    pub fn global_config_path() -> PathBuf {
        Self::global_config_dir()
            .unwrap_or_else(|| PathBuf::from(".ferry"))
            .join("ferry.toml")
    }

    /// Absolute path to the project config file for the given workspace.
    pub fn project_config_path(workspace: &Path) -> PathBuf {
        Self::project_config_dir(workspace).join("ferry.toml")
    }

    fn global_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("ferry"))
    }

    fn project_config_dir(workspace: &Path) -> PathBuf {
        workspace.join(".ferry")
    }

    fn load_optional(path: &Path) -> FerryConfig {
        if !path.exists() {
            return FerryConfig::default();
        }
        match FerryConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                // Warn but don't fail: a malformed config shouldn't block startup.
                eprintln!("ferry-settings: warning: failed to parse {path:?}: {err}");
                FerryConfig::default()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_missing_workspace_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::load(dir.path());
        assert!(config.server.listen_addr.is_none());
        assert!(config.resolver.ttl_secs.is_none());
    }

    #[test]
    fn test_load_project_config_only() {
        let dir = tempfile::tempdir().unwrap();
        let ferry_dir = dir.path().join(".ferry");
        fs::create_dir_all(&ferry_dir).unwrap();
        fs::write(
            ferry_dir.join("ferry.toml"),
            "[server]\nlisten_addr = \"127.0.0.1:9050\"\n[resolver]\nttl_secs = 120\n",
        )
        .unwrap();

        let config = ConfigLoader::load(dir.path());
        assert_eq!(
            config.server.listen_addr,
            Some("127.0.0.1:9050".parse().unwrap())
        );
        assert_eq!(config.resolver.ttl_secs, Some(120));
    }

    #[test]
    fn test_project_config_path() {
        let path = ConfigLoader::project_config_path(Path::new("/workspace"));
        assert_eq!(path, PathBuf::from("/workspace/.ferry/ferry.toml"));
    }

    #[test]
    fn test_global_config_path_ends_with_ferry_toml() {
        let path = ConfigLoader::global_config_path();
        assert!(path.ends_with("ferry.toml"));
        assert!(path.to_string_lossy().contains("ferry"));
    }

    #[test]
    fn test_load_malformed_config_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let ferry_dir = dir.path().join(".ferry");
        fs::create_dir_all(&ferry_dir).unwrap();
        fs::write(ferry_dir.join("ferry.toml"), "not valid toml :::").unwrap();

        // Should not panic; should return default
        let config = ConfigLoader::load(dir.path());
        assert!(config.server.listen_addr.is_none());
    }

    #[test]
    fn test_load_merges_global_and_project() {
        let global_dir = tempfile::tempdir().unwrap();
        let global_config_path = global_dir.path().join("ferry.toml");
        std::fs::write(
            &global_config_path,
            "[pool]\nmax_connections = 600\n[resolver]\nttl_secs = 1800\n",
        )
        .unwrap();

        let project_dir = tempfile::tempdir().unwrap();
        let ferry_dir = project_dir.path().join(".ferry");
        fs::create_dir_all(&ferry_dir).unwrap();
        fs::write(ferry_dir.join("ferry.toml"), "[resolver]\nttl_secs = 60\n").unwrap();

        // Load global manually then merge with project to test merge logic
        let global = FerryConfig::load(&global_config_path).unwrap();
        let project = FerryConfig::load(&ferry_dir.join("ferry.toml")).unwrap();
        let merged = global.merge(project);

        assert_eq!(merged.pool.max_connections, Some(600));
        assert_eq!(merged.resolver.ttl_secs, Some(60));
    }
}
