//! Behaviour shared by the RTMP, RTSP and SRT publish sessions.

use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use publisher_ipc::{ConnectEvent, EventEmitter, SessionState};
use publisher_media::{AccessUnit, AudioFormat, VideoFormat};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::sender::MediaSender;
use crate::TransportResult;

/// A client-side publish session for one protocol.
///
/// Control operations block on socket I/O and must be called off any
/// latency-sensitive thread. [`send`](Self::send) never blocks.
pub trait PublishSession: Send + Sync {
    /// Protocol name used in logs.
    fn protocol(&self) -> &'static str;

    /// Set the video track format. Takes effect on the next connect.
    fn set_video_format(&self, format: VideoFormat);

    /// Set the audio track format. Takes effect on the next connect.
    fn set_audio_format(&self, format: AudioFormat);

    /// Connect to `url` and start publishing.
    ///
    /// Reports `Started`, then `Connected` or a failure event.
    fn connect(&self, url: &str) -> TransportResult<()>;

    /// Packetize an access unit and enqueue it for the sender thread.
    fn send(&self, unit: &AccessUnit) -> TransportResult<()>;

    /// Stop publishing and close the connection. Reports `Disconnected`.
    fn stop(&self);

    /// Current session state.
    fn state(&self) -> SessionState;

    /// The sender owning the frame queue.
    fn sender(&self) -> &MediaSender;
}

/// Session state shared between the control thread and the sender thread.
#[derive(Debug, Clone, Default)]
pub struct SharedState(Arc<RwLock<SessionState>>);

impl SharedState {
    /// Current state.
    pub fn get(&self) -> SessionState {
        *self.0.read()
    }

    /// Move to `next`, logging the transition.
    pub fn set(&self, next: SessionState) {
        let mut state = self.0.write();
        if *state != next {
            debug!(previous = state.name(), current = next.name(), "Session state changed");
            *state = next;
        }
    }

    /// Move to `Handshaking` if a connect may start.
    pub fn begin_connect(&self) -> TransportResult<()> {
        let mut state = self.0.write();
        if !state.can_connect() {
            return Err(TransportError::AlreadyConnected);
        }
        debug!(previous = state.name(), current = "Handshaking", "Session state changed");
        *state = SessionState::Handshaking;
        Ok(())
    }
}

/// Write half of a TCP connection, shared by the control thread and the sender.
pub(crate) type SharedStream = Arc<Mutex<TcpStream>>;

/// Open a TCP connection with connect, read and write timeouts applied.
pub(crate) fn connect_tcp(host: &str, port: u16, timeout: Duration) -> TransportResult<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Connection(format!("cannot resolve {host}: {e}")))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                debug!(%addr, "TCP connected");
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(TransportError::Connection(match last_error {
        Some(e) => format!("{host}:{port}: {e}"),
        None => format!("{host}:{port}: no address"),
    }))
}

/// Read whatever is available, returning 0 when the read timeout expires.
///
/// End of stream is an error: the server closed the connection.
pub(crate) fn read_available(stream: &mut TcpStream, buf: &mut [u8]) -> TransportResult<usize> {
    match stream.read(buf) {
        Ok(0) => Err(TransportError::Connection("connection closed by server".to_string())),
        Ok(n) => Ok(n),
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(0),
        Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Report a failed connect attempt and close the session.
pub(crate) fn report_connect_error(
    protocol: &str,
    state: &SharedState,
    events: &EventEmitter,
    err: &TransportError,
) {
    warn!(protocol, error = %err, "Connect failed");
    state.set(SessionState::Closed);
    match err {
        TransportError::AuthenticationFailed(_) => events.emit(ConnectEvent::AuthError),
        _ => events.emit(ConnectEvent::Failed {
            reason: err.to_string(),
        }),
    }
}

/// Failure callback for the sender thread: close the session and report.
pub(crate) fn sender_failure(
    state: SharedState,
    events: EventEmitter,
) -> impl FnOnce(TransportError) + Send + 'static {
    move |err| {
        state.set(SessionState::Closed);
        events.emit(ConnectEvent::Failed {
            reason: err.to_string(),
        });
    }
}
