//! Per-connection socket wrapper and the shared receive loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::error::{Result, TcpError, is_routine_reset};
use crate::provider::ServiceProvider;

/// How long `write` waits for the socket to report write readiness before
/// giving up and returning 0.
const WRITE_READY_TIMEOUT: Duration = Duration::from_secs(1);

/// Probe buffer size for `available_data`.
const PEEK_PROBE_LEN: usize = 4096;

/// Pace between repeat `data_ready` notifications while the provider has
/// left a previous event undrained. Readiness stays asserted until the
/// provider reads, so renotification must not be driven by readiness alone.
const UNDRAINED_RENOTIFY_PACE: Duration = Duration::from_millis(10);

/// Unique identifier for a TCP connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new connection ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A single connected TCP socket.
///
/// A `TcpConnection` is created by the server when it accepts a connection
/// and by the client when a connect succeeds. It owns the socket handle and
/// layers the library's read/write semantics on top of it:
///
/// - The receive loop pre-reads exactly one byte (the *lookahead* byte) to
///   detect data arrival and peer closure before the provider decides how
///   much to consume. [`read`](Self::read) transparently splices that byte
///   back in front of whatever else the socket has, so providers never see
///   it as anything but the start of the stream.
/// - [`write`](Self::write) waits a bounded time for write readiness and
///   reports a timeout by returning 0 rather than failing; that is a
///   backpressure signal, and callers that need delivery must retry.
///
/// All methods take `&self`; the wrapper is safe to share across tasks.
/// [`close`](Self::close) is idempotent, and every read or write racing a
/// close either completes normally or reports [`TcpError::Closed`].
pub struct TcpConnection {
    id: ConnectionId,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    stream: Mutex<Option<Arc<TcpStream>>>,
    /// One pre-read byte not yet consumed by `read`. The mutex also
    /// serializes concurrent `read` calls against each other, so the
    /// lookahead byte and the bytes behind it stay in order.
    lookahead: Mutex<Option<u8>>,
    closed: AtomicBool,
    /// Single-claim token deciding which teardown path runs the provider's
    /// closing callback. Late completions that lose the claim exit quietly.
    close_claimed: AtomicBool,
    close_notify: Notify,
}

impl TcpConnection {
    /// Wrap a freshly connected stream.
    pub(crate) fn new(stream: TcpStream) -> Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        Ok(Arc::new(Self {
            id: ConnectionId::new(),
            local_addr,
            peer_addr,
            stream: Mutex::new(Some(Arc::new(stream))),
            lookahead: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_claimed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }))
    }

    /// Get the unique connection ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the peer socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read up to `count` bytes into `buffer[offset..offset + count]`.
    ///
    /// The pending lookahead byte, if any, is copied first; any remaining
    /// capacity is filled by a single non-blocking read from the socket.
    /// Returns the number of bytes copied, which is 0 when no data is
    /// currently available. This call never blocks; it is meant to be made
    /// from a `data_ready` callback, where at least the lookahead byte is
    /// known to exist.
    ///
    /// Fails with [`TcpError::EmptyBuffer`] or [`TcpError::OutOfRange`] when
    /// the buffer region is invalid, and with [`TcpError::Closed`] once the
    /// connection has been closed, all before touching the socket.
    pub fn read(&self, buffer: &mut [u8], offset: usize, count: usize) -> Result<usize> {
        check_range(buffer.len(), offset, count)?;
        let stream = self.stream()?;
        if count == 0 {
            return Ok(0);
        }

        // Hold the lookahead slot for the whole call so concurrent reads
        // cannot reorder the spliced byte against the bytes behind it.
        let mut lookahead = self.lookahead.lock();
        let mut copied = 0;
        if let Some(byte) = lookahead.take() {
            buffer[offset] = byte;
            copied = 1;
            if copied == count {
                return Ok(copied);
            }
        }

        match stream.try_read(&mut buffer[offset + copied..offset + count]) {
            Ok(n) => Ok(copied + n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(copied),
            // With bytes already copied the bytes win; the failure will
            // surface again on the next call.
            Err(_) if copied > 0 => Ok(copied),
            Err(err) => Err(err.into()),
        }
    }

    /// Write `count` bytes from `buffer[offset..offset + count]` to the peer.
    ///
    /// Waits up to one second for the socket to become writable. If it does,
    /// all `count` bytes are written and `count` is returned; if it does not,
    /// 0 is returned. The 0 return is deliberate backpressure, not a failure:
    /// callers that need reliable delivery must retry.
    ///
    /// Argument validation matches [`read`](Self::read).
    pub async fn write(&self, buffer: &[u8], offset: usize, count: usize) -> Result<usize> {
        check_range(buffer.len(), offset, count)?;
        let stream = self.stream()?;
        if count == 0 {
            return Ok(0);
        }

        let ready = tokio::select! {
            _ = self.wait_close() => return Err(TcpError::Closed),
            ready = timeout(WRITE_READY_TIMEOUT, stream.writable()) => ready,
        };
        match ready {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Ok(0),
        }

        let mut written = 0;
        while written < count {
            match stream.try_write(&buffer[offset + written..offset + count]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    tokio::select! {
                        _ = self.wait_close() => return Err(TcpError::Closed),
                        ready = stream.writable() => ready?,
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(count)
    }

    /// Probe whether the connection is still alive.
    ///
    /// Attempts a zero-length send: success or a would-block result means
    /// connected, any other socket error means not connected. A closed
    /// wrapper is never connected.
    pub fn is_connected(&self) -> bool {
        let Ok(stream) = self.stream() else {
            return false;
        };
        match stream.try_write(&[]) {
            Ok(_) => true,
            Err(err) => err.kind() == io::ErrorKind::WouldBlock,
        }
    }

    /// Number of bytes that can be read right now.
    ///
    /// Counts the pending lookahead byte plus whatever a non-blocking peek
    /// sees queued at the OS level, capped at the 4 KiB probe buffer. The
    /// peek only resolves against readiness the runtime has already
    /// observed, so the count can briefly lag an arrival nothing has
    /// awaited yet. Treat it as a lower bound; data arrival is signalled
    /// through the provider's `data_ready` callback, not by polling this.
    pub fn available_data(&self) -> usize {
        let pending = usize::from(self.lookahead.lock().is_some());
        let Ok(stream) = self.stream() else {
            return pending;
        };
        let mut probe = [0u8; PEEK_PROBE_LEN];
        match stream.peek(&mut probe).now_or_never() {
            Some(Ok(n)) => pending + n,
            _ => pending,
        }
    }

    /// Close the connection.
    ///
    /// Idempotent: the first call releases the socket handle, clears the
    /// lookahead state, and wakes the receive loop; later calls do nothing.
    /// The OS handle is freed once in-flight operations drop their reference.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stream.lock().take();
        self.lookahead.lock().take();
        self.close_notify.notify_waiters();
        tracing::debug!(target: "tcplink::connection", "Closed {}", self.id);
    }

    /// Whether `close` has run.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Claim the right to run the closing callback. Exactly one caller per
    /// connection gets `true`.
    pub(crate) fn claim_close(&self) -> bool {
        !self.close_claimed.swap(true, Ordering::SeqCst)
    }

    /// Resolve once the connection has been closed.
    pub(crate) async fn wait_close(&self) {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a close landing in between
        // cannot be missed.
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Store the pre-read byte. Only the receive loop calls this, and only
    /// when the slot is empty.
    fn set_lookahead(&self, byte: u8) {
        *self.lookahead.lock() = Some(byte);
    }

    /// Whether a pre-read byte is waiting to be consumed.
    fn lookahead_pending(&self) -> bool {
        self.lookahead.lock().is_some()
    }

    /// Clone the stream handle out of the slot, or fail if closed.
    fn stream(&self) -> Result<Arc<TcpStream>> {
        self.stream.lock().clone().ok_or(TcpError::Closed)
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The side that owns a connection's bookkeeping entry: the server's
/// registry or the client's single slot.
pub(crate) trait ConnectionHost: Send + Sync + 'static {
    /// Remove the connection from the host's bookkeeping; a no-op when the
    /// connection is already gone.
    fn detach(&self, id: ConnectionId);
}

/// Arm the receive loop for a connection.
pub(crate) fn spawn_receive_loop(
    conn: Arc<TcpConnection>,
    provider: Arc<dyn ServiceProvider>,
    host: Arc<dyn ConnectionHost>,
) {
    tokio::spawn(run_receive_loop(conn, provider, host));
}

/// Per-connection receive loop, shared by the server and the client.
///
/// Each iteration waits for readability, pre-reads one byte into the
/// lookahead slot, and delivers `data_ready`. Re-arming only happens after
/// the callback returns, which is what keeps callbacks sequential per
/// connection. Zero bytes on the pre-read is an orderly remote closure;
/// reset-class errors are routine closures; anything else is reported
/// through the exception callback before the connection is dropped.
async fn run_receive_loop(
    conn: Arc<TcpConnection>,
    provider: Arc<dyn ServiceProvider>,
    host: Arc<dyn ConnectionHost>,
) {
    loop {
        let Ok(stream) = conn.stream() else {
            break;
        };

        let ready = tokio::select! {
            _ = conn.wait_close() => break,
            ready = stream.readable() => ready,
        };

        if let Err(err) = ready {
            if !is_routine_reset(err.kind()) {
                tracing::warn!(
                    target: "tcplink::connection",
                    "Receive fault on {}: {}", conn.id(), err
                );
                let err = TcpError::from(err);
                provider.exception(Some(&conn), &err).await;
            }
            break;
        }

        if conn.is_closed() {
            break;
        }

        if conn.lookahead_pending() {
            // The previous event was not fully drained. Renotify instead of
            // pre-reading again so the undrained byte is not lost, pacing
            // the repeats because readiness stays asserted until a read
            // drains the socket.
            tokio::select! {
                _ = conn.wait_close() => break,
                _ = tokio::time::sleep(UNDRAINED_RENOTIFY_PACE) => {}
            }
            provider.data_ready(&conn).await;
            continue;
        }

        let mut probe = [0u8; 1];
        let result = stream.try_read(&mut probe);
        match classify_probe(result, probe[0]) {
            ProbeDisposition::Data(byte) => {
                conn.set_lookahead(byte);
                provider.data_ready(&conn).await;
            }
            // Spurious readiness; re-arm.
            ProbeDisposition::Rearm => {}
            ProbeDisposition::PeerClosed => {
                tracing::debug!(
                    target: "tcplink::connection",
                    "Peer closed {}", conn.id()
                );
                break;
            }
            ProbeDisposition::PeerReset => {
                tracing::debug!(
                    target: "tcplink::connection",
                    "Peer reset {}", conn.id()
                );
                break;
            }
            ProbeDisposition::Fault(err) => {
                tracing::warn!(
                    target: "tcplink::connection",
                    "Receive fault on {}: {}", conn.id(), err
                );
                let err = TcpError::from(err);
                provider.exception(Some(&conn), &err).await;
                break;
            }
        }
    }

    host.detach(conn.id());
    if conn.claim_close() {
        provider.closing(&conn).await;
        conn.close();
    }
    // If the close was claimed elsewhere (stop or disconnect), this is a
    // completion racing its own teardown; exit without another callback.
}

/// What the receive loop does with the outcome of a one-byte lookahead
/// probe.
#[derive(Debug)]
enum ProbeDisposition {
    /// One byte was pre-read; store it and notify the provider.
    Data(u8),
    /// Spurious readiness; re-arm without notifying.
    Rearm,
    /// Orderly remote closure; drop the connection quietly.
    PeerClosed,
    /// Routine peer reset; drop the connection quietly.
    PeerReset,
    /// Transport fault; report through the exception callback, then drop.
    Fault(io::Error),
}

/// Classify a lookahead probe result. `byte` is the probe buffer's content,
/// meaningful only when the result read one byte.
fn classify_probe(result: io::Result<usize>, byte: u8) -> ProbeDisposition {
    match result {
        Ok(0) => ProbeDisposition::PeerClosed,
        Ok(_) => ProbeDisposition::Data(byte),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => ProbeDisposition::Rearm,
        Err(err) if is_routine_reset(err.kind()) => ProbeDisposition::PeerReset,
        Err(err) => ProbeDisposition::Fault(err),
    }
}

/// Validate a `(buffer, offset, count)` triple before any I/O.
fn check_range(len: usize, offset: usize, count: usize) -> Result<()> {
    if len == 0 {
        return Err(TcpError::EmptyBuffer);
    }
    if offset >= len || count > len - offset {
        return Err(TcpError::OutOfRange { offset, count, len });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_is_rejected() {
        assert!(matches!(check_range(0, 0, 0), Err(TcpError::EmptyBuffer)));
    }

    #[test]
    fn offset_must_lie_inside_the_buffer() {
        assert!(check_range(10, 9, 0).is_ok());
        assert!(matches!(
            check_range(10, 10, 0),
            Err(TcpError::OutOfRange { .. })
        ));
        assert!(matches!(
            check_range(10, 12, 1),
            Err(TcpError::OutOfRange { .. })
        ));
    }

    #[test]
    fn count_must_fit_behind_the_offset() {
        assert!(check_range(10, 0, 10).is_ok());
        assert!(check_range(10, 5, 5).is_ok());
        assert!(matches!(
            check_range(10, 5, 6),
            Err(TcpError::OutOfRange { .. })
        ));
        assert!(matches!(
            check_range(10, 0, 11),
            Err(TcpError::OutOfRange { .. })
        ));
    }

    #[test]
    fn reported_range_carries_the_arguments() {
        match check_range(10, 5, 6) {
            Err(TcpError::OutOfRange { offset, count, len }) => {
                assert_eq!((offset, count, len), (5, 6, 10));
            }
            other => panic!("expected range error, got {other:?}"),
        }
    }

    #[test]
    fn probe_data_and_closure_dispositions() {
        assert!(matches!(
            classify_probe(Ok(1), b'a'),
            ProbeDisposition::Data(b'a')
        ));
        assert!(matches!(classify_probe(Ok(0), 0), ProbeDisposition::PeerClosed));
        assert!(matches!(
            classify_probe(Err(io::ErrorKind::WouldBlock.into()), 0),
            ProbeDisposition::Rearm
        ));
    }

    #[test]
    fn probe_resets_drop_quietly_and_other_faults_report() {
        assert!(matches!(
            classify_probe(Err(io::ErrorKind::ConnectionReset.into()), 0),
            ProbeDisposition::PeerReset
        ));
        assert!(matches!(
            classify_probe(Err(io::ErrorKind::BrokenPipe.into()), 0),
            ProbeDisposition::PeerReset
        ));
        // Anything outside the reset class goes to the exception callback.
        assert!(matches!(
            classify_probe(Err(io::ErrorKind::TimedOut.into()), 0),
            ProbeDisposition::Fault(_)
        ));
        assert!(matches!(
            classify_probe(Err(io::ErrorKind::InvalidData.into()), 0),
            ProbeDisposition::Fault(_)
        ));
    }

    #[test]
    fn connection_ids_are_unique_and_ascending() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert!(b.as_u64() > a.as_u64());
        assert_eq!(a.to_string(), format!("conn-{}", a.as_u64()));
    }
}
