//! SOCKS5 CONNECT proxy.
//!
//! Accepts client connections, performs the SOCKS5 handshake, and relays
//! bytes between the client and the requested destination. Destinations
//! given as domain names are resolved through the shared host cache;
//! outbound connections come from the shared pool and go back to it when
//! a session ends cleanly.
//!
//! # Session Flow
//!
//! ```text
//! Client connects to proxy
//!         |
//!         v
//! Greeting  [05 nmethods methods...] -> [05 00]
//!         |
//!         v
//! Request   [05 cmd 00 atyp addr port]
//!         |
//!         +-- domain --> Resolver.resolve(domain)
//!         |
//!         v
//! Pool.acquire(target) -> reply [05 00 ...], relay data
//!         |
//!         v
//! Relay ends -> connection released (client closed) or discarded
//! ```
//!
//! Only the CONNECT command is supported; BIND and UDP ASSOCIATE receive a
//! "command not supported" reply. Malformed handshake bytes close the
//! connection without a reply.

use crate::relay::{relay, RelayEnd};
use crate::{ProxyError, Result, SharedState};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// How often idle pooled connections are checked for expiry.
const POOL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct SocksProxyConfig {
    /// Address to bind the proxy to.
    /// Default: `0.0.0.0:1080`
    pub bind_addr: SocketAddr,

    /// Idle timeout (relay closed if no data flows in either direction).
    /// Default: 30 seconds
    pub idle_timeout: Duration,

    /// Maximum concurrent client sessions.
    /// Default: 1000
    pub max_sessions: usize,

    /// How long in-flight sessions may keep running after a shutdown
    /// signal before they are aborted.
    /// Default: 3 seconds
    pub shutdown_grace: Duration,
}

impl Default for SocksProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1080".parse().expect("hardcoded any-interface address"),
            idle_timeout: Duration::from_secs(30),
            max_sessions: 1000,
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

/// SOCKS5 proxy that relays CONNECT sessions through pooled connections.
pub struct SocksProxy {
    /// Proxy configuration.
    config: SocksProxyConfig,

    /// Shared state with the host cache and connection pool.
    state: Arc<SharedState>,

    /// Current session count (Arc-wrapped to safely share with spawned tasks).
    session_count: Arc<std::sync::atomic::AtomicUsize>,
}

impl SocksProxy {
    /// Create a new SOCKS5 proxy.
    ///
    /// # Arguments
    /// * `config` - Proxy configuration
    /// * `state` - Shared state containing the resolver and connection pool
    ///
    /// # Errors
    /// Currently infallible; always returns `Ok`. The `Result` return type
    /// is present for forward compatibility.
    pub fn new(config: SocksProxyConfig, state: Arc<SharedState>) -> Result<Self> {
        Ok(Self {
            config,
            state,
            session_count: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        })
    }

    /// Get current session count.
    pub fn session_count(&self) -> usize {
        self.session_count
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Start the proxy.
    ///
    /// Binds to the configured address and accepts connections until the
    /// shutdown receiver fires (or its sender is dropped).
    ///
    /// # Errors
    /// * `ProxyError::Bind` - If binding to `config.bind_addr` fails.
    pub async fn run(&self, shutdown: oneshot::Receiver<()>) -> Result<()> {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: self.config.bind_addr,
                source: e,
            })?;

        self.run_on(listener, shutdown).await
    }

    /// Run the proxy on a pre-bound listener.
    ///
    /// Used by [`crate::ProxyServer::start`] which pre-binds the listener to
    /// obtain the actual OS-assigned port before spawning the server task.
    ///
    /// On shutdown the listener is closed first, in-flight sessions get
    /// `shutdown_grace` to finish, stragglers are aborted, and finally every
    /// idle pooled connection is closed.
    pub async fn run_on(
        &self,
        listener: tokio::net::TcpListener,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<()> {
        let mut sessions = tokio::task::JoinSet::new();
        let mut sweep = tokio::time::interval(POOL_SWEEP_INTERVAL);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (client, client_addr) = match accepted {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(error = %e, "TCP accept error");
                            continue;
                        }
                    };

                    // Check session limit
                    let current = self
                        .session_count
                        .load(std::sync::atomic::Ordering::Relaxed);
                    if current >= self.config.max_sessions {
                        warn!(client = %client_addr, "Session limit reached, rejecting");
                        drop(client);
                        continue;
                    }

                    debug!(client = %client_addr, "SOCKS connection accepted");
                    self.session_count
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

                    // Handle the session in a background task
                    let state = Arc::clone(&self.state);
                    let idle_timeout = self.config.idle_timeout;
                    let session_count = Arc::clone(&self.session_count);

                    sessions.spawn(async move {
                        let mut session = ClientSession::new(client, client_addr);
                        let _ = session.run(&state, idle_timeout).await;
                        session_count.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                    });
                }
                // Reap finished sessions so the set does not accumulate results.
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = sweep.tick() => {
                    self.state.pool.evict_expired();
                }
                _ = &mut shutdown => break,
            }
        }

        // Stop accepting before draining the in-flight sessions.
        drop(listener);
        if !sessions.is_empty() {
            debug!(active = sessions.len(), "draining sessions before shutdown");
            let drain = async {
                while sessions.join_next().await.is_some() {}
            };
            if tokio::time::timeout(self.config.shutdown_grace, drain)
                .await
                .is_err()
            {
                warn!(
                    remaining = sessions.len(),
                    "grace period expired, aborting sessions"
                );
                sessions.shutdown().await;
            }
        }

        let closed = self.state.pool.close_all();
        debug!(closed, "closed idle pooled connections on shutdown");
        Ok(())
    }
}

/// Where a session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    AwaitingGreeting,
    AwaitingRequest,
    Connecting,
    Relaying,
    Closed,
}

/// Target of a CONNECT request, before resolution.
#[derive(Debug)]
enum TargetAddr {
    Ipv4(Ipv4Addr),
    Domain(String),
}

/// Parse result of one request: command, target address, target port.
#[derive(Debug)]
struct ProxyRequest {
    command: u8,
    target: TargetAddr,
    port: u16,
}

/// One accepted client connection and its handshake state.
struct ClientSession {
    stream: TcpStream,
    peer: SocketAddr,
    phase: SessionPhase,
}

impl ClientSession {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            phase: SessionPhase::AwaitingGreeting,
        }
    }

    /// Drive the session to completion and tear it down.
    ///
    /// The client stream is closed when the session is dropped; the phase
    /// records where the handshake got to before the session ended.
    async fn run(&mut self, state: &SharedState, idle_timeout: Duration) -> Result<()> {
        let result = self.drive(state, idle_timeout).await;
        if let Err(e) = &result {
            if matches!(e, ProxyError::Protocol(_)) {
                self.drain_received();
            }
            debug!(client = %self.peer, phase = ?self.phase, error = %e, "Session failed");
        }
        self.phase = SessionPhase::Closed;
        result
    }

    async fn drive(&mut self, state: &SharedState, idle_timeout: Duration) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        // Greeting: no authentication, always. The offered methods are not
        // inspected.
        self.read_greeting().await?;
        self.stream
            .write_all(&[socks5::VERSION, socks5::NO_AUTH])
            .await
            .map_err(|e| ProxyError::Internal(format!("Failed to send greeting reply: {}", e)))?;
        self.phase = SessionPhase::AwaitingRequest;

        let request = self.read_request().await?;

        if request.command != socks5::CMD_CONNECT {
            // Best-effort: if we can't notify the client, it will see a connection drop.
            self.stream
                .write_all(&error_reply(socks5::COMMAND_NOT_SUPPORTED))
                .await
                .ok();
            return Err(ProxyError::UnsupportedCommand {
                command: request.command,
            });
        }
        self.phase = SessionPhase::Connecting;

        // Resolve the target if the client sent a domain name.
        let addr = match &request.target {
            TargetAddr::Ipv4(ip) => *ip,
            TargetAddr::Domain(domain) => match state.resolver.resolve(domain).await {
                Ok(ip) => ip,
                Err(e) => {
                    // Best-effort: if we can't notify the client, it will see a connection drop.
                    self.stream
                        .write_all(&error_reply(socks5::CONNECTION_REFUSED))
                        .await
                        .ok();
                    return Err(e);
                }
            },
        };
        let target = SocketAddr::from((addr, request.port));

        let mut conn = match state.pool.acquire(target).await {
            Ok(conn) => conn,
            Err(e) => {
                // Best-effort: if we can't notify the client, it will see a connection drop.
                self.stream
                    .write_all(&error_reply(socks5::CONNECTION_REFUSED))
                    .await
                    .ok();
                return Err(e);
            }
        };

        // Echo the outbound local address in the success reply.
        let bound = match conn.stream.local_addr() {
            Ok(SocketAddr::V4(v4)) => v4,
            _ => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        };
        if let Err(e) = self
            .stream
            .write_all(&build_reply(socks5::SUCCEEDED, bound))
            .await
        {
            state.pool.discard(conn);
            return Err(ProxyError::Internal(format!(
                "Failed to send success reply: {}",
                e
            )));
        }
        self.phase = SessionPhase::Relaying;
        debug!(client = %self.peer, target = %target, "relay started");

        let outcome = relay(&mut self.stream, &mut conn.stream, idle_timeout).await;
        debug!(
            client = %self.peer,
            target = %target,
            up = outcome.client_to_remote,
            down = outcome.remote_to_client,
            end = ?outcome.end,
            "relay finished"
        );
        if let RelayEnd::Failed(error) = &outcome.end {
            warn!(client = %self.peer, target = %target, error = %error, "relay ended on an I/O error");
        }

        if outcome.remote_reusable() {
            state.pool.release(conn);
        } else {
            state.pool.discard(conn);
        }
        Ok(())
    }

    /// Read the method-negotiation greeting: version, method count, methods.
    async fn read_greeting(&mut self) -> Result<()> {
        use tokio::io::AsyncReadExt;

        let mut header = [0u8; 2];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|e| ProxyError::Protocol(format!("greeting truncated: {}", e)))?;

        if header[0] != socks5::VERSION {
            return Err(ProxyError::Protocol(format!(
                "invalid version byte {:#04x} in greeting",
                header[0]
            )));
        }

        let mut methods = vec![0u8; header[1] as usize];
        self.stream
            .read_exact(&mut methods)
            .await
            .map_err(|e| ProxyError::Protocol(format!("greeting truncated: {}", e)))?;
        Ok(())
    }

    /// Read one request: fixed header, then the address by type, then port.
    ///
    /// Only IPv4 literals and domain names are accepted; any other address
    /// type is a protocol error and the connection is closed without a reply.
    async fn read_request(&mut self) -> Result<ProxyRequest> {
        use tokio::io::AsyncReadExt;

        let mut header = [0u8; 4];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|e| ProxyError::Protocol(format!("request truncated: {}", e)))?;

        if header[0] != socks5::VERSION {
            return Err(ProxyError::Protocol(format!(
                "invalid version byte {:#04x} in request",
                header[0]
            )));
        }

        let target = match header[3] {
            socks5::ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                self.stream
                    .read_exact(&mut octets)
                    .await
                    .map_err(|e| ProxyError::Protocol(format!("request truncated: {}", e)))?;
                TargetAddr::Ipv4(Ipv4Addr::from(octets))
            }
            socks5::ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                self.stream
                    .read_exact(&mut len)
                    .await
                    .map_err(|e| ProxyError::Protocol(format!("request truncated: {}", e)))?;
                if len[0] == 0 {
                    return Err(ProxyError::Protocol("empty domain name".to_string()));
                }

                let mut name = vec![0u8; len[0] as usize];
                self.stream
                    .read_exact(&mut name)
                    .await
                    .map_err(|e| ProxyError::Protocol(format!("request truncated: {}", e)))?;
                let domain = String::from_utf8(name)
                    .map_err(|_| ProxyError::Protocol("domain name is not valid UTF-8".to_string()))?;
                TargetAddr::Domain(domain)
            }
            other => {
                return Err(ProxyError::Protocol(format!(
                    "unsupported address type {}",
                    other
                )));
            }
        };

        let mut port = [0u8; 2];
        self.stream
            .read_exact(&mut port)
            .await
            .map_err(|e| ProxyError::Protocol(format!("request truncated: {}", e)))?;

        Ok(ProxyRequest {
            command: header[1],
            target,
            port: u16::from_be_bytes(port),
        })
    }

    /// Consume whatever the client has already sent, without waiting for more.
    ///
    /// Closing a socket with received bytes still unread makes the kernel
    /// answer with a reset instead of a normal close; a client that sent a
    /// malformed message in one burst would then see a connection reset
    /// rather than the end-of-stream a rejected handshake ends in.
    fn drain_received(&self) {
        let mut scratch = [0u8; 512];
        while let Ok(n) = self.stream.try_read(&mut scratch) {
            if n == 0 {
                break;
            }
        }
    }
}

/// Encode a SOCKS5 reply: version, code, reserved, IPv4 bound address.
fn build_reply(code: u8, bound: SocketAddrV4) -> [u8; 10] {
    let mut reply = [0u8; 10];
    reply[0] = socks5::VERSION;
    reply[1] = code;
    reply[2] = 0x00;
    reply[3] = socks5::ATYP_IPV4;
    reply[4..8].copy_from_slice(&bound.ip().octets());
    reply[8..10].copy_from_slice(&bound.port().to_be_bytes());
    reply
}

/// Encode an error reply with the zero address `0.0.0.0:0`.
fn error_reply(code: u8) -> [u8; 10] {
    build_reply(code, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

/// SOCKS5 protocol constants.
// All RFC 1928 values are defined for completeness; not all are used in the
// current implementation but are present for reference and future use.
#[allow(dead_code)]
mod socks5 {
    pub const VERSION: u8 = 0x05;

    pub const NO_AUTH: u8 = 0x00;

    pub const CMD_CONNECT: u8 = 0x01;
    pub const CMD_BIND: u8 = 0x02;
    pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;

    pub const SUCCEEDED: u8 = 0x00;
    pub const GENERAL_FAILURE: u8 = 0x01;
    pub const CONNECTION_NOT_ALLOWED: u8 = 0x02;
    pub const NETWORK_UNREACHABLE: u8 = 0x03;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const CONNECTION_REFUSED: u8 = 0x05;
    pub const TTL_EXPIRED: u8 = 0x06;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}
