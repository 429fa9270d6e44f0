use std::path::PathBuf;
use std::time::Duration;

use ferry_proxy::{ProxyConfig, ProxyServer};
use ferry_settings::{ConfigLoader, FerryConfig};
use tracing::info;

use crate::cli::ServeArgs;
use crate::error::CliError;

pub async fn serve(args: ServeArgs, cwd: PathBuf) -> Result<(), CliError> {
    // 1. Load and merge config.
    // --no-config skips global/project config files but --config <extra> still applies.
    let mut settings = if args.no_config {
        FerryConfig::default()
    } else {
        ConfigLoader::load(&cwd)
    };
    if let Some(ref extra) = args.extra_config {
        let extra_cfg = FerryConfig::load(extra)?;
        settings = settings.merge(extra_cfg);
    }

    // 2. Apply CLI overrides on top of file settings.
    let config = build_proxy_config(&settings, &args);

    // 3. Start the server and block until a termination signal arrives.
    let handle = ProxyServer::new(config)?.start().await?;
    info!(addr = %handle.local_addr(), "SOCKS5 proxy listening");

    wait_for_signal().await?;

    let stats = handle.pool_stats();
    info!(
        created = stats.created,
        reused = stats.reused,
        cached_hosts = handle.cached_hosts(),
        "Termination signal received, shutting down"
    );
    handle.shutdown().await?;
    Ok(())
}

/// Wait for SIGINT, SIGTERM or SIGQUIT.
#[cfg(unix)]
async fn wait_for_signal() -> Result<(), CliError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = term.recv() => {}
        _ = quit.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<(), CliError> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Build the proxy configuration from file settings with CLI flags on top.
///
/// Precedence, lowest to highest: built-in defaults, config files, CLI flags.
fn build_proxy_config(settings: &FerryConfig, args: &ServeArgs) -> ProxyConfig {
    let mut config = ProxyConfig::default();

    if let Some(addr) = settings.server.listen_addr {
        config.listen_addr = addr;
    }
    if let Some(n) = settings.server.max_sessions {
        config.max_sessions = n;
    }
    if let Some(secs) = settings.server.connect_timeout_secs {
        config.connect_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = settings.server.idle_timeout_secs {
        config.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = settings.server.shutdown_grace_secs {
        config.shutdown_grace = Duration::from_secs(secs);
    }
    if let Some(secs) = settings.resolver.ttl_secs {
        config.resolver_ttl = Duration::from_secs(secs);
    }
    if let Some(n) = settings.pool.max_connections {
        config.pool_max_connections = n;
    }
    if let Some(secs) = settings.pool.max_lifetime_secs {
        config.pool_max_lifetime = Duration::from_secs(secs);
    }

    if let Some(addr) = args.listen {
        config.listen_addr = addr;
    }
    if let Some(n) = args.max_sessions {
        config.max_sessions = n;
    }
    if let Some(secs) = args.connect_timeout {
        config.connect_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.idle_timeout {
        config.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.resolver_ttl {
        config.resolver_ttl = Duration::from_secs(secs);
    }
    if let Some(n) = args.pool_max_connections {
        config.pool_max_connections = n;
    }
    if let Some(secs) = args.pool_max_lifetime {
        config.pool_max_lifetime = Duration::from_secs(secs);
    }
    if let Some(secs) = args.shutdown_grace {
        config.shutdown_grace = Duration::from_secs(secs);
    }

    config
}
