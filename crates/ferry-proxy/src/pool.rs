//! Outbound connection pool.
//!
//! Connections to destination servers are borrowed from the pool and, when
//! the client side of a session finishes cleanly, returned for reuse by the
//! next session targeting the same address. Pooling is keyed by resolved
//! `SocketAddr`, so `example.com:443` and its IP literal share connections
//! once resolution has happened.
//!
//! # Capacity
//!
//! The pool tracks every connection it has open, idle and lent out alike,
//! against `max_connections` (0 disables the limit). When a new connection
//! is needed at capacity, the oldest idle connection across all targets is
//! closed to make room; with nothing idle the acquire fails with
//! [`ProxyError::PoolExhausted`].
//!
//! # Lifetime
//!
//! Every connection carries its creation time. Once `max_lifetime` has
//! elapsed it is no longer handed out or accepted back; a periodic sweep
//! (`evict_expired`) closes idle connections that aged out in place.

use crate::{ProxyError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// Connection pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum connections open at once, idle plus lent out. 0 = unbounded.
    pub max_connections: usize,

    /// How long a connection may be used or reused after it was dialed.
    pub max_lifetime: Duration,

    /// Timeout for dialing a destination.
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 600,
            max_lifetime: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// A connection checked out of the pool.
///
/// The caller must hand it back with [`ConnectionPool::release`] (reusable)
/// or [`ConnectionPool::discard`] (spent); dropping it without either leaks
/// a capacity slot until the process exits.
#[derive(Debug)]
pub struct PooledConnection {
    pub stream: TcpStream,
    target: SocketAddr,
    created_at: Instant,
}

impl PooledConnection {
    /// The destination this connection is dialed to.
    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections dialed since the pool was created.
    pub created: u64,

    /// Acquires served from an idle connection.
    pub reused: u64,

    /// Idle connections currently parked in the pool.
    pub idle: usize,

    /// Connections currently lent out (including dials in flight).
    pub outstanding: usize,
}

struct IdleConn {
    stream: TcpStream,
    created_at: Instant,
}

struct PoolInner {
    idle: HashMap<SocketAddr, Vec<IdleConn>>,
    outstanding: usize,
}

impl PoolInner {
    /// Total connections the pool is responsible for right now.
    fn open_count(&self) -> usize {
        self.outstanding + self.idle.values().map(Vec::len).sum::<usize>()
    }

    /// Close the oldest idle connection across all targets.
    ///
    /// Returns `false` when nothing is idle.
    fn evict_oldest_idle(&mut self) -> bool {
        let mut oldest: Option<(SocketAddr, usize, Instant)> = None;
        for (addr, conns) in &self.idle {
            for (i, conn) in conns.iter().enumerate() {
                if oldest.map_or(true, |(_, _, t)| conn.created_at < t) {
                    oldest = Some((*addr, i, conn.created_at));
                }
            }
        }

        let Some((addr, index, _)) = oldest else {
            return false;
        };
        if let Some(conns) = self.idle.get_mut(&addr) {
            conns.remove(index);
            if conns.is_empty() {
                self.idle.remove(&addr);
            }
        }
        debug!(target = %addr, "evicted oldest idle connection to make room");
        true
    }
}

/// Pool of outbound TCP connections keyed by destination address.
pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    config: PoolConfig,
    created: AtomicU64,
    reused: AtomicU64,
}

impl ConnectionPool {
    /// Create an empty pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                idle: HashMap::new(),
                outstanding: 0,
            }),
            config,
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Check out a connection to `target`, reusing an idle one when possible.
    ///
    /// # Errors
    /// * `ProxyError::PoolExhausted` - The pool is at capacity and nothing
    ///   is idle to evict.
    /// * `ProxyError::TcpConnection` - Dialing the destination failed or
    ///   timed out.
    pub async fn acquire(&self, target: SocketAddr) -> Result<PooledConnection> {
        {
            let mut inner = self.lock_inner();

            // Fast path: an idle connection to the same target.
            if let Some(conns) = inner.idle.get_mut(&target) {
                while let Some(idle) = conns.pop() {
                    if idle.created_at.elapsed() < self.config.max_lifetime {
                        if conns.is_empty() {
                            inner.idle.remove(&target);
                        }
                        inner.outstanding += 1;
                        self.reused.fetch_add(1, Ordering::Relaxed);
                        debug!(target = %target, "reusing pooled connection");
                        return Ok(PooledConnection {
                            stream: idle.stream,
                            target,
                            created_at: idle.created_at,
                        });
                    }
                    debug!(target = %target, "closing idle connection past max lifetime");
                }
                inner.idle.remove(&target);
            }

            // Nothing idle for this target: reserve a capacity slot before
            // dialing so concurrent acquires cannot overshoot the limit.
            if self.config.max_connections != 0 {
                while inner.open_count() >= self.config.max_connections {
                    if !inner.evict_oldest_idle() {
                        return Err(ProxyError::PoolExhausted {
                            limit: self.config.max_connections,
                        });
                    }
                }
            }
            inner.outstanding += 1;
        }

        // Dial outside the lock; other sessions keep moving meanwhile.
        match self.connect(target).await {
            Ok(stream) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                debug!(target = %target, "dialed new pooled connection");
                Ok(PooledConnection {
                    stream,
                    target,
                    created_at: Instant::now(),
                })
            }
            Err(e) => {
                // Give the reserved slot back.
                let mut inner = self.lock_inner();
                inner.outstanding = inner.outstanding.saturating_sub(1);
                Err(e)
            }
        }
    }

    /// Return a connection for reuse by later sessions.
    ///
    /// A connection past its lifetime is closed instead of parked.
    pub fn release(&self, conn: PooledConnection) {
        let mut inner = self.lock_inner();
        inner.outstanding = inner.outstanding.saturating_sub(1);

        if conn.created_at.elapsed() >= self.config.max_lifetime {
            debug!(target = %conn.target, "closing returned connection past max lifetime");
            return;
        }

        inner.idle.entry(conn.target).or_default().push(IdleConn {
            stream: conn.stream,
            created_at: conn.created_at,
        });
    }

    /// Close a connection that must not be reused.
    pub fn discard(&self, conn: PooledConnection) {
        let mut inner = self.lock_inner();
        inner.outstanding = inner.outstanding.saturating_sub(1);
        drop(inner);
        drop(conn);
    }

    /// Close idle connections that have outlived `max_lifetime`.
    ///
    /// Returns how many were closed.
    pub fn evict_expired(&self) -> usize {
        let max_lifetime = self.config.max_lifetime;
        let mut inner = self.lock_inner();
        let mut evicted = 0;
        inner.idle.retain(|_, conns| {
            let before = conns.len();
            conns.retain(|c| c.created_at.elapsed() < max_lifetime);
            evicted += before - conns.len();
            !conns.is_empty()
        });
        if evicted > 0 {
            debug!(evicted, "closed idle connections past max lifetime");
        }
        evicted
    }

    /// Close every idle connection. Lent-out connections are unaffected.
    ///
    /// Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let mut inner = self.lock_inner();
        let closed = inner.idle.values().map(Vec::len).sum();
        inner.idle.clear();
        closed
    }

    /// Snapshot the pool counters.
    pub fn stats(&self) -> PoolStats {
        let inner = self.lock_inner();
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            idle: inner.idle.values().map(Vec::len).sum(),
            outstanding: inner.outstanding,
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, PoolInner> {
        // Use unwrap_or_else to recover from poisoned lock - the data is still valid
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Dial a destination with the configured timeout.
    async fn connect(&self, target: SocketAddr) -> Result<TcpStream> {
        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProxyError::TcpConnection {
                addr: target,
                source: e,
            }),
            Err(_) => Err(ProxyError::TcpConnection {
                addr: target,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Start an echo server that keeps accepted sockets open.
    async fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    fn pool_with(max_connections: usize, max_lifetime: Duration) -> ConnectionPool {
        ConnectionPool::new(PoolConfig {
            max_connections,
            max_lifetime,
            connect_timeout: Duration::from_secs(5),
        })
    }

    // ========================================================================
    // PoolConfig Tests
    // ========================================================================

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 600);
        assert_eq!(config.max_lifetime, Duration::from_secs(300));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
    }

    // ========================================================================
    // Acquire / Release Tests
    // ========================================================================

    #[tokio::test]
    async fn test_acquire_dials_new_connection() {
        let addr = spawn_echo_server().await;
        let pool = pool_with(10, Duration::from_secs(300));

        let conn = pool.acquire(addr).await.unwrap();
        assert_eq!(conn.target(), addr);

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 0);
        assert_eq!(stats.outstanding, 1);
        assert_eq!(stats.idle, 0);

        pool.discard(conn);
    }

    #[tokio::test]
    async fn test_release_then_acquire_reuses_connection() {
        let addr = spawn_echo_server().await;
        let pool = pool_with(10, Duration::from_secs(300));

        let conn = pool.acquire(addr).await.unwrap();
        pool.release(conn);
        assert_eq!(pool.stats().idle, 1);

        let conn = pool.acquire(addr).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.created, 1, "second acquire must not dial");
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.outstanding, 1);
        pool.discard(conn);
    }

    #[tokio::test]
    async fn test_held_connection_never_handed_out_twice() {
        let addr = spawn_echo_server().await;
        let pool = pool_with(10, Duration::from_secs(300));

        // Both checkouts overlap, so the second must dial its own socket.
        let first = pool.acquire(addr).await.unwrap();
        let second = pool.acquire(addr).await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.reused, 0);
        assert_eq!(stats.outstanding, 2);
        pool.discard(first);
        pool.discard(second);
    }

    #[tokio::test]
    async fn test_reused_connection_still_works() {
        let addr = spawn_echo_server().await;
        let pool = pool_with(10, Duration::from_secs(300));

        let mut conn = pool.acquire(addr).await.unwrap();
        conn.stream.write_all(b"first").await.unwrap();
        let mut buf = [0u8; 5];
        conn.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first");
        pool.release(conn);

        let mut conn = pool.acquire(addr).await.unwrap();
        conn.stream.write_all(b"again").await.unwrap();
        conn.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"again");
        pool.discard(conn);
    }

    #[tokio::test]
    async fn test_acquire_different_targets_do_not_share() {
        let addr_a = spawn_echo_server().await;
        let addr_b = spawn_echo_server().await;
        let pool = pool_with(10, Duration::from_secs(300));

        let conn = pool.acquire(addr_a).await.unwrap();
        pool.release(conn);

        let conn = pool.acquire(addr_b).await.unwrap();
        assert_eq!(conn.target(), addr_b);
        let stats = pool.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.reused, 0);
        pool.discard(conn);
    }

    #[tokio::test]
    async fn test_discard_frees_slot_without_parking() {
        let addr = spawn_echo_server().await;
        let pool = pool_with(10, Duration::from_secs(300));

        let conn = pool.acquire(addr).await.unwrap();
        pool.discard(conn);

        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.idle, 0);
    }

    // ========================================================================
    // Capacity Tests
    // ========================================================================

    #[tokio::test]
    async fn test_at_capacity_with_nothing_idle_fails() {
        let addr_a = spawn_echo_server().await;
        let addr_b = spawn_echo_server().await;
        let pool = pool_with(1, Duration::from_secs(300));

        let held = pool.acquire(addr_a).await.unwrap();
        let result = pool.acquire(addr_b).await;
        match result {
            Err(ProxyError::PoolExhausted { limit }) => assert_eq!(limit, 1),
            other => panic!("expected PoolExhausted, got {:?}", other.map(|_| ())),
        }

        // The failed acquire must not leak a reservation.
        assert_eq!(pool.stats().outstanding, 1);
        pool.discard(held);
    }

    #[tokio::test]
    async fn test_at_capacity_evicts_oldest_idle() {
        let addr_a = spawn_echo_server().await;
        let addr_b = spawn_echo_server().await;
        let pool = pool_with(1, Duration::from_secs(300));

        let conn = pool.acquire(addr_a).await.unwrap();
        pool.release(conn);
        assert_eq!(pool.stats().idle, 1);

        // Needs a slot for a different target; the idle one gets closed.
        let conn = pool.acquire(addr_b).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.outstanding, 1);
        assert_eq!(stats.created, 2);
        pool.discard(conn);
    }

    #[tokio::test]
    async fn test_zero_max_connections_is_unbounded() {
        let addr = spawn_echo_server().await;
        let pool = pool_with(0, Duration::from_secs(300));

        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(pool.acquire(addr).await.unwrap());
        }
        assert_eq!(pool.stats().outstanding, 5);
        for conn in held {
            pool.discard(conn);
        }
    }

    #[tokio::test]
    async fn test_failed_dial_rolls_back_reservation() {
        // Bind then drop to get a port with nothing listening on it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = pool_with(1, Duration::from_secs(300));
        let result = pool.acquire(dead_addr).await;
        assert!(matches!(result, Err(ProxyError::TcpConnection { .. })));
        assert_eq!(pool.stats().outstanding, 0);

        // The slot is free again for a working target.
        let addr = spawn_echo_server().await;
        let conn = pool.acquire(addr).await.unwrap();
        pool.discard(conn);
    }

    #[tokio::test]
    async fn test_connect_timeout_surfaces_as_connection_error() {
        // RFC 5737 TEST-NET-1 address; nothing routes there.
        let target: SocketAddr = "192.0.2.1:9999".parse().unwrap();
        let pool = ConnectionPool::new(PoolConfig {
            max_connections: 10,
            max_lifetime: Duration::from_secs(300),
            connect_timeout: Duration::from_millis(200),
        });

        let result = pool.acquire(target).await;
        assert!(matches!(result, Err(ProxyError::TcpConnection { .. })));
        assert_eq!(pool.stats().outstanding, 0);
    }

    // ========================================================================
    // Lifetime Tests
    // ========================================================================

    #[tokio::test]
    async fn test_expired_idle_connection_not_reused() {
        let addr = spawn_echo_server().await;
        let pool = pool_with(10, Duration::from_millis(50));

        let conn = pool.acquire(addr).await.unwrap();
        pool.release(conn);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let conn = pool.acquire(addr).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.created, 2, "expired connection must be redialed");
        assert_eq!(stats.reused, 0);
        pool.discard(conn);
    }

    #[tokio::test]
    async fn test_release_drops_connection_past_lifetime() {
        let addr = spawn_echo_server().await;
        let pool = pool_with(10, Duration::from_millis(50));

        let conn = pool.acquire(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.release(conn);

        let stats = pool.stats();
        assert_eq!(stats.idle, 0, "aged-out connection must not be parked");
        assert_eq!(stats.outstanding, 0);
    }

    #[tokio::test]
    async fn test_evict_expired_sweeps_idle_connections() {
        let addr = spawn_echo_server().await;
        let pool = pool_with(10, Duration::from_millis(50));

        let conn = pool.acquire(addr).await.unwrap();
        pool.release(conn);
        assert_eq!(pool.evict_expired(), 0, "fresh connection must survive");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.evict_expired(), 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_close_all_drains_idle() {
        let addr_a = spawn_echo_server().await;
        let addr_b = spawn_echo_server().await;
        let pool = pool_with(10, Duration::from_secs(300));

        let conn_a = pool.acquire(addr_a).await.unwrap();
        let conn_b = pool.acquire(addr_b).await.unwrap();
        pool.release(conn_a);
        pool.release(conn_b);
        assert_eq!(pool.stats().idle, 2);

        assert_eq!(pool.close_all(), 2);
        assert_eq!(pool.stats().idle, 0);
    }
}
