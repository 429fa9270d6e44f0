//! SOCKS5 proxy server lifecycle.
//!
//! Owns the shared resolver and connection pool, and runs the accept loop
//! with a controllable shutdown path.
//!
//! # Lifecycle
//!
//! ```text
//! ProxyServer::new(config)
//!       |
//!       v
//! ProxyServer::start() --> ProxyHandle
//!       |                       |
//!       v                       |
//! Accept loop + sessions        |
//!       |                       v
//!       |               ProxyHandle::shutdown()
//!       |                       |
//!       v                       v
//! Drain sessions, close pool <--+
//! ```

use crate::{
    PoolConfig, PoolStats, ProxyError, Result, SharedState, SocksProxy, SocksProxyConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Configuration for the proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to listen on.
    /// Default: `0.0.0.0:1080`
    pub listen_addr: SocketAddr,

    /// Timeout for dialing a destination.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Relay idle timeout (session closed if no data flows).
    /// Default: 30 seconds
    pub idle_timeout: Duration,

    /// How long a resolved domain stays in the host cache.
    /// Default: 30 minutes
    pub resolver_ttl: Duration,

    /// Maximum pooled connections, idle plus lent out. 0 = unbounded.
    /// Default: 600
    pub pool_max_connections: usize,

    /// How long a pooled connection may be reused after it was dialed.
    /// Default: 5 minutes
    pub pool_max_lifetime: Duration,

    /// Maximum concurrent client sessions.
    /// Default: 1000
    pub max_sessions: usize,

    /// Grace period for in-flight sessions during shutdown.
    /// Default: 3 seconds
    pub shutdown_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:1080".parse().expect("hardcoded any-interface address"),
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
            resolver_ttl: Duration::from_secs(1800),
            pool_max_connections: 600,
            pool_max_lifetime: Duration::from_secs(300),
            max_sessions: 1000,
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    /// Shutdown signal sender.
    shutdown_tx: Option<oneshot::Sender<()>>,

    /// Join handle for the server task.
    join_handle: Option<tokio::task::JoinHandle<Result<()>>>,

    /// Actual listening address (OS-assigned port resolved).
    local_addr: SocketAddr,

    /// Upper bound on how long `shutdown` waits for the server task.
    shutdown_timeout: Duration,

    /// Shared state, for runtime diagnostics.
    state: Arc<SharedState>,
}

impl ProxyHandle {
    /// Check if the server is still running.
    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Get the actual listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Snapshot the connection pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.state.pool.stats()
    }

    /// Number of entries currently in the host cache.
    pub fn cached_hosts(&self) -> usize {
        self.state.resolver.cache().len()
    }

    /// Shut down the proxy server gracefully.
    ///
    /// Signals the server to stop via the shutdown channel; the server stops
    /// accepting, drains in-flight sessions within its grace period, and
    /// closes the pool. If the shutdown signal cannot be delivered (receiver
    /// dropped), the task is aborted.
    ///
    /// # Errors
    /// * `ProxyError::Shutdown` - The server task panicked.
    /// Any error the server task itself ended with is passed through.
    pub async fn shutdown(mut self) -> Result<()> {
        // Send shutdown signal - this triggers the tokio::select! in the accept loop
        let signal_sent = if let Some(tx) = self.shutdown_tx.take() {
            tx.send(()).is_ok()
        } else {
            false
        };

        if let Some(handle) = self.join_handle.take() {
            if signal_sent {
                // The grace period inside the server bounds the drain; the
                // outer timeout only catches a stuck task.
                let abort_handle = handle.abort_handle();
                match tokio::time::timeout(self.shutdown_timeout, handle).await {
                    Ok(Ok(result)) => return result,
                    Ok(Err(e)) if e.is_cancelled() => {} // Task was cancelled, that's fine
                    Ok(Err(e)) => {
                        return Err(ProxyError::Shutdown(format!("server task panicked: {}", e)))
                    }
                    Err(_) => abort_handle.abort(),
                }
            } else {
                // Shutdown signal couldn't be sent, abort the task
                handle.abort();
            }
        }

        Ok(())
    }
}

/// SOCKS5 proxy server.
///
/// Construction builds the shared resolver and pool; `start`/`run` bind the
/// listener and accept sessions.
pub struct ProxyServer {
    /// Server configuration.
    config: ProxyConfig,

    /// State shared by all sessions.
    state: Arc<SharedState>,
}

impl ProxyServer {
    /// Create a new proxy server.
    ///
    /// # Arguments
    /// * `config` - Server configuration
    ///
    /// # Errors
    /// Currently infallible; always returns `Ok`. The `Result` return type
    /// is present for forward compatibility.
    ///
    /// # Example
    /// ```ignore
    /// let server = ProxyServer::new(ProxyConfig::default())?;
    /// let handle = server.start().await?;
    /// // ... later ...
    /// handle.shutdown().await?;
    /// ```
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let pool_config = PoolConfig {
            max_connections: config.pool_max_connections,
            max_lifetime: config.pool_max_lifetime,
            connect_timeout: config.connect_timeout,
        };
        let state = Arc::new(SharedState::new(config.resolver_ttl, pool_config));
        Ok(Self { config, state })
    }

    /// Start the proxy server in the background.
    ///
    /// Returns a handle for controlling the running server.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - If binding the listener fails (e.g. address
    ///   already in use). This is the only fatal startup condition.
    pub async fn start(self) -> Result<ProxyHandle> {
        use tokio::net::TcpListener;

        // Pre-bind so the actual OS-assigned port is known immediately.
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: self.config.listen_addr,
                source: e,
            })?;
        let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
            addr: self.config.listen_addr,
            source: e,
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state_for_task = Arc::clone(&self.state);
        let state_for_handle = Arc::clone(&self.state);
        let socks_config = self.socks_config(local_addr);
        let shutdown_timeout = self.config.shutdown_grace + Duration::from_secs(2);

        // Spawn the server task on the pre-bound listener.
        let join_handle = tokio::spawn(async move {
            let proxy = SocksProxy::new(socks_config, state_for_task)?;
            proxy.run_on(listener, shutdown_rx).await
        });

        Ok(ProxyHandle {
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
            local_addr,
            shutdown_timeout,
            state: state_for_handle,
        })
    }

    /// Run the proxy server until it fails.
    ///
    /// Alternative to `start()` for blocking operation; there is no shutdown
    /// path besides dropping the future, so callers wanting a graceful stop
    /// should use `start()`.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - If binding to the configured address fails.
    pub async fn run(self) -> Result<()> {
        // Keep the sender alive so the accept loop never sees a shutdown.
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        let socks_config = self.socks_config(self.config.listen_addr);
        let proxy = SocksProxy::new(socks_config, Arc::clone(&self.state))?;
        proxy.run(shutdown_rx).await
    }

    fn socks_config(&self, bind_addr: SocketAddr) -> SocksProxyConfig {
        SocksProxyConfig {
            bind_addr,
            idle_timeout: self.config.idle_timeout,
            max_sessions: self.config.max_sessions,
            shutdown_grace: self.config.shutdown_grace,
        }
    }
}
