//! SOCKS5 CONNECT forwarding proxy engine.
//!
//! `ferry-proxy` accepts SOCKS5 clients, performs the CONNECT handshake,
//! resolves domain targets through a TTL host cache, reuses outbound TCP
//! connections through a keyed pool, and relays bytes in both directions
//! until either side closes.
//!
//! # Connection Flow
//!
//! ```text
//! Client connects to proxy
//!         |
//!         v
//! SOCKS5 greeting / request
//!         |
//!         +-- domain target --> Resolver (host cache, TTL)
//!         |                          |
//!         v                          v
//! ConnectionPool.acquire(addr:port) <-+
//!         |
//!         +-- idle connection --> reuse
//!         +-- under capacity  --> dial new
//!         +-- at capacity     --> evict oldest idle or refuse
//!         |
//!         v
//! Reply, then relay bidirectionally until EOF / error / idle timeout
//! ```
//!
//! # Components
//!
//! - [`Resolver`]: Domain name resolution with a TTL-bounded host cache
//! - [`ConnectionPool`]: Reusable outbound connections keyed by destination
//! - [`SocksProxy`]: Accept loop and per-connection handshake pipeline
//! - [`ProxyServer`]: Lifecycle wrapper with graceful shutdown
//!
//! # Usage
//!
//! ```ignore
//! use ferry_proxy::{ProxyServer, ProxyConfig};
//!
//! let config = ProxyConfig {
//!     listen_addr: "0.0.0.0:1080".parse()?,
//!     ..Default::default()
//! };
//!
//! let handle = ProxyServer::new(config)?.start().await?;
//! // ... later ...
//! handle.shutdown().await?;
//! ```
//!
//! The crate emits structured `tracing` events (accepted connections, cache
//! hits, pool reuse, relay summaries) but never installs a subscriber; the
//! hosting binary decides where logs go.

mod pool;
mod proxy;
mod relay;
mod resolver;
mod server;

pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use proxy::{SocksProxy, SocksProxyConfig};
pub use resolver::{CacheStats, HostCache, Resolver};
pub use server::{ProxyConfig, ProxyHandle, ProxyServer};

use std::net::SocketAddr;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur in proxy operations.
///
/// Every variant except [`ProxyError::Bind`] is scoped to a single client
/// connection; the listener bind failure is the only error that stops the
/// process.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to bind to address.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or truncated SOCKS5 handshake bytes. The connection is
    /// closed without a reply.
    #[error("Malformed SOCKS5 handshake: {0}")]
    Protocol(String),

    /// The client asked for a command other than CONNECT. The client is
    /// sent a "command not supported" reply before the close.
    #[error("Unsupported SOCKS5 command {command} (only CONNECT is supported)")]
    UnsupportedCommand { command: u8 },

    /// Host resolution failed or produced no IPv4 address.
    #[error("Host resolution failed for {domain}: {source}")]
    DnsResolution {
        domain: String,
        #[source]
        source: std::io::Error,
    },

    /// Outbound TCP connection failed.
    #[error("TCP connection to {addr} failed: {source}")]
    TcpConnection {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The connection pool is at its configured capacity with nothing
    /// idle to evict.
    #[error("Connection pool at capacity ({limit} outstanding)")]
    PoolExhausted { limit: usize },

    /// Server shutdown error.
    #[error("Server shutdown error: {0}")]
    Shutdown(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// State shared by every connection task.
///
/// The resolver's host cache and the outbound connection pool are the only
/// cross-connection state in the proxy. Both are safe for concurrent use
/// from arbitrarily many tasks; an error in one connection's pipeline can
/// never corrupt them.
pub struct SharedState {
    /// Domain resolution with TTL caching.
    pub resolver: Resolver,

    /// Reusable outbound connections keyed by destination.
    pub pool: ConnectionPool,
}

impl SharedState {
    /// Create shared state with the given resolver TTL and pool settings.
    pub fn new(resolver_ttl: std::time::Duration, pool_config: PoolConfig) -> Self {
        Self {
            resolver: Resolver::new(resolver_ttl),
            pool: ConnectionPool::new(pool_config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // ProxyError Tests
    // ========================================================================

    #[test]
    fn test_proxy_error_display_bind() {
        let addr: SocketAddr = "0.0.0.0:1080".parse().unwrap();
        let err = ProxyError::Bind {
            addr,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("0.0.0.0:1080"));
    }

    #[test]
    fn test_proxy_error_display_dns_resolution() {
        let err = ProxyError::DnsResolution {
            domain: "example.com".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no address"),
        };
        assert!(err.to_string().contains("example.com"));
        assert!(err.to_string().contains("no address"));
    }

    #[test]
    fn test_proxy_error_display_unsupported_command() {
        let err = ProxyError::UnsupportedCommand { command: 2 };
        assert!(err.to_string().contains('2'));
        assert!(err.to_string().contains("CONNECT"));
    }

    #[test]
    fn test_proxy_error_display_pool_exhausted() {
        let err = ProxyError::PoolExhausted { limit: 600 };
        assert!(err.to_string().contains("600"));
    }

    #[test]
    fn test_proxy_error_source_chains_io_error() {
        use std::error::Error;
        let addr: SocketAddr = "10.0.0.1:443".parse().unwrap();
        let err = ProxyError::TcpConnection {
            addr,
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(err.source().is_some());
    }

    // ========================================================================
    // SharedState Tests
    // ========================================================================

    #[test]
    fn test_shared_state_starts_empty() {
        let state = SharedState::new(
            std::time::Duration::from_secs(1800),
            PoolConfig::default(),
        );
        assert!(state.resolver.cache().is_empty());
        let stats = state.pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn test_shared_state_counters_start_at_zero() {
        let state = SharedState::new(
            std::time::Duration::from_secs(1800),
            PoolConfig::default(),
        );
        assert_eq!(state.resolver.stats().hits(), 0);
        assert_eq!(state.resolver.stats().misses(), 0);
        let stats = state.pool.stats();
        assert_eq!(stats.created, 0);
        assert_eq!(stats.reused, 0);
    }
}
