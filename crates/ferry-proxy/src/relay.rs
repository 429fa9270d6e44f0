//! Bidirectional byte relay between a client and its destination.
//!
//! Two pump loops run concurrently, one per direction, each moving data
//! through a fixed-size buffer. The first pump to stop ends the relay:
//! the other direction is cancelled and [`relay`] returns an outcome
//! describing who closed and how many bytes moved each way. An idle
//! watchdog tears the relay down when neither direction has carried data
//! for the configured timeout.
//!
//! Peer resets and broken pipes are ordinary ways for a session to end,
//! not failures; only unexpected I/O errors surface as
//! [`RelayEnd::Failed`]. A reset still spends the destination connection:
//! in-flight bytes may have been lost, so only a clean client close
//! leaves it reusable.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Per-direction copy buffer size in bytes.
pub(crate) const RELAY_BUFFER_SIZE: usize = 4096;

/// Why a relay stopped.
#[derive(Debug)]
pub(crate) enum RelayEnd {
    /// The client finished sending; the destination connection is intact.
    ClientClosed,

    /// The destination closed or refused further data.
    RemoteClosed,

    /// The client went away abruptly, either resetting its side or
    /// vanishing while the destination was still sending.
    ClientAborted,

    /// No data moved in either direction for the idle timeout.
    IdleTimeout,

    /// Unexpected I/O failure on either leg.
    Failed(std::io::Error),
}

/// Result of one relay run.
#[derive(Debug)]
pub(crate) struct RelayOutcome {
    /// Bytes delivered from the client to the destination.
    pub client_to_remote: u64,

    /// Bytes delivered from the destination to the client.
    pub remote_to_client: u64,

    pub end: RelayEnd,
}

impl RelayOutcome {
    /// Whether the destination connection survived the session untouched
    /// and can be handed out again. Only a clean client close qualifies;
    /// every other ending may leave undelivered bytes on the connection.
    pub fn remote_reusable(&self) -> bool {
        matches!(self.end, RelayEnd::ClientClosed)
    }
}

enum PumpEnd {
    /// Read returned end-of-stream.
    SourceEof,

    /// Read reported the source reset its side of the connection.
    SourceReset,

    /// The write side reported the peer gone.
    SinkClosed,
}

/// Pump bytes between the client and the destination until either side
/// closes, an error occurs, or the idle timeout fires.
pub(crate) async fn relay(
    client: &mut TcpStream,
    remote: &mut TcpStream,
    idle_timeout: Duration,
) -> RelayOutcome {
    let started = Instant::now();
    let last_activity = AtomicU64::new(0);
    let up_bytes = AtomicU64::new(0);
    let down_bytes = AtomicU64::new(0);

    let (client_rd, client_wr) = client.split();
    let (remote_rd, remote_wr) = remote.split();

    let upload = pump(client_rd, remote_wr, &up_bytes, started, &last_activity);
    let download = pump(remote_rd, client_wr, &down_bytes, started, &last_activity);

    let end = tokio::select! {
        result = upload => match result {
            Ok(PumpEnd::SourceEof) => RelayEnd::ClientClosed,
            Ok(PumpEnd::SourceReset) => RelayEnd::ClientAborted,
            Ok(PumpEnd::SinkClosed) => RelayEnd::RemoteClosed,
            Err(e) => RelayEnd::Failed(e),
        },
        result = download => match result {
            Ok(PumpEnd::SourceEof | PumpEnd::SourceReset) => RelayEnd::RemoteClosed,
            Ok(PumpEnd::SinkClosed) => RelayEnd::ClientAborted,
            Err(e) => RelayEnd::Failed(e),
        },
        _ = idle_watchdog(started, &last_activity, idle_timeout) => RelayEnd::IdleTimeout,
    };

    RelayOutcome {
        client_to_remote: up_bytes.load(Ordering::Relaxed),
        remote_to_client: down_bytes.load(Ordering::Relaxed),
        end,
    }
}

/// Copy from `reader` to `writer` until the source ends or the sink closes.
///
/// Every chunk read is attempted in full before the next read; partial
/// progress is recorded in `bytes` and stamps `last_activity`.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    bytes: &AtomicU64,
    started: Instant,
    last_activity: &AtomicU64,
) -> std::io::Result<PumpEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            // A reset peer is a close, not a failure.
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                return Ok(PumpEnd::SourceReset);
            }
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Ok(PumpEnd::SourceEof);
        }

        match writer.write_all(&buf[..n]).await {
            Ok(()) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WriteZero | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset
                ) =>
            {
                return Ok(PumpEnd::SinkClosed);
            }
            Err(e) => return Err(e),
        }

        bytes.fetch_add(n as u64, Ordering::Relaxed);
        last_activity.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

/// Resolve once no data has moved for `idle_timeout`.
///
/// The pumps stamp `last_activity` with milliseconds since `started`; the
/// watchdog sleeps to the stamp's deadline and re-checks, so it wakes at
/// most once per quiet period instead of polling.
async fn idle_watchdog(started: Instant, last_activity: &AtomicU64, idle_timeout: Duration) {
    loop {
        let observed = last_activity.load(Ordering::Relaxed);
        let deadline = started + Duration::from_millis(observed) + idle_timeout;
        tokio::time::sleep_until(deadline).await;
        if last_activity.load(Ordering::Relaxed) == observed {
            return;
        }
    }
}
