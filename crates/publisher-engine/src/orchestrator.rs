//! Stream client: one publish session plus the local recorder.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use publisher_ipc::{
    ConnectEvent, EventEmitter, PublishConfig, RecordEvent, RecordState, SessionState,
};
use publisher_media::{AccessUnit, AudioFormat, VideoFormat};
use publisher_transport::rtmp::RtmpClient;
use publisher_transport::rtsp::RtspClient;
use publisher_transport::srt::SrtClient;
use publisher_transport::{PublishSession, ReconnectPolicy, TransportError};

use crate::error::{ClientResult, RecordResult};
use crate::metrics::{check_warnings, ClientMetrics, MetricsCollector, MetricsWarning};
use crate::record::{RecordController, RecordTarget};

#[derive(Debug, Default, Clone)]
struct Formats {
    video: Option<VideoFormat>,
    audio: Option<AudioFormat>,
}

/// Protocol selected by the URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Rtmp,
    Rtsp,
    Srt,
}

impl Protocol {
    /// Protocol for `url`, from its scheme.
    pub fn from_url(url: &str) -> Result<Self, TransportError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| TransportError::InvalidUrl(format!("missing scheme in {url}")))?;
        if rest.is_empty() {
            return Err(TransportError::InvalidUrl("missing host".to_string()));
        }
        match scheme.to_ascii_lowercase().as_str() {
            "rtmp" | "rtmps" | "rtmpt" | "rtmpts" => Ok(Self::Rtmp),
            "rtsp" | "rtsps" => Ok(Self::Rtsp),
            "srt" => Ok(Self::Srt),
            other => Err(TransportError::InvalidUrl(format!(
                "unsupported scheme {other}"
            ))),
        }
    }
}

/// Publishes access units to a server and, independently, to a recording.
pub struct StreamClient {
    config: RwLock<PublishConfig>,
    events: EventEmitter,
    session: RwLock<Option<Arc<dyn PublishSession>>>,
    formats: Mutex<Formats>,
    recorder: RecordController,
    last_url: Mutex<Option<String>>,
    reconnect: ReconnectPolicy,
    attempts: AtomicU32,
    metrics: MetricsCollector,
}

impl StreamClient {
    pub fn new(
        config: PublishConfig,
        events: EventEmitter,
        record_events: EventEmitter<RecordEvent>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            events,
            session: RwLock::new(None),
            formats: Mutex::new(Formats::default()),
            recorder: RecordController::new(record_events),
            last_url: Mutex::new(None),
            reconnect: ReconnectPolicy::default(),
            attempts: AtomicU32::new(0),
            metrics: MetricsCollector::new(),
        }
    }

    /// Replace the reconnection policy.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the video format for the session and the recorder.
    pub fn set_video_format(&self, format: VideoFormat) {
        if let Some(session) = self.session() {
            session.set_video_format(format.clone());
        }
        self.recorder.set_video_format(format.clone());
        self.formats.lock().video = Some(format);
    }

    /// Set the audio format for the session and the recorder.
    pub fn set_audio_format(&self, format: AudioFormat) {
        if let Some(session) = self.session() {
            session.set_audio_format(format);
        }
        self.recorder.set_audio_format(format);
        self.formats.lock().audio = Some(format);
    }

    /// Connect to `url` and start publishing. Blocks until the session publishes or fails.
    #[instrument(name = "client_connect", skip(self))]
    pub fn connect(&self, url: &str) -> ClientResult<()> {
        *self.last_url.lock() = Some(url.to_string());
        self.attempts.store(0, Ordering::SeqCst);
        self.open_session(url)
    }

    fn open_session(&self, url: &str) -> ClientResult<()> {
        let session = {
            let mut slot = self.session.write();
            if slot.as_ref().is_some_and(|s| !s.state().can_connect()) {
                return Err(TransportError::AlreadyConnected.into());
            }

            let session = self.create_session(url).inspect_err(|e| {
                warn!(error = %e, "Cannot publish to endpoint");
                self.events.emit(ConnectEvent::Failed {
                    reason: e.to_string(),
                });
            })?;
            *slot = Some(Arc::clone(&session));
            session
        };

        session.connect(url)?;
        self.attempts.store(0, Ordering::SeqCst);
        self.metrics.start();
        info!(protocol = session.protocol(), "Client publishing");
        Ok(())
    }

    fn create_session(&self, url: &str) -> Result<Arc<dyn PublishSession>, TransportError> {
        let config = self.config.read().clone();
        let events = self.events.clone();
        let session: Arc<dyn PublishSession> = match Protocol::from_url(url)? {
            Protocol::Rtmp => Arc::new(RtmpClient::new(config, events)),
            Protocol::Rtsp => Arc::new(RtspClient::new(config, events)),
            Protocol::Srt => Arc::new(SrtClient::new(config, events)),
        };

        let formats = self.formats.lock().clone();
        if let Some(video) = formats.video {
            session.set_video_format(video);
        }
        if let Some(audio) = formats.audio {
            session.set_audio_format(audio);
        }
        debug!(protocol = session.protocol(), "Created publish session");
        Ok(session)
    }

    /// Whether a failed session ending with `reason` should be retried.
    pub fn should_retry(&self, reason: &str) -> bool {
        self.last_url.lock().is_some()
            && self
                .reconnect
                .should_retry(self.attempts.load(Ordering::SeqCst), reason)
    }

    /// Suggested delay before the next [`retry`](Self::retry).
    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect
            .delay_for_attempt(self.attempts.load(Ordering::SeqCst) + 1)
    }

    /// Wait `delay`, then reconnect to the last URL.
    #[instrument(name = "client_retry", skip(self))]
    pub fn retry(&self, delay: Duration) -> ClientResult<()> {
        let url = self
            .last_url
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            attempt,
            max_attempts = self.reconnect.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting"
        );

        if let Some(session) = self.session() {
            if !session.state().can_connect() {
                session.stop();
            }
        }
        thread::sleep(delay);
        self.open_session(&url)
    }

    /// Hand one access unit to the session and the recorder.
    ///
    /// A full frame queue drops the frame without failing the call.
    pub fn send(&self, unit: &AccessUnit) -> ClientResult<()> {
        self.metrics.record_unit(unit.kind);

        let sent = match self.session() {
            Some(session) if session.state().is_publishing() => match session.send(unit) {
                Err(TransportError::QueueFull) => Ok(()),
                other => other,
            },
            _ => Ok(()),
        };

        let recorded = self.recorder.write(unit);
        if recorded.is_err() {
            self.metrics.record_error();
        }

        sent?;
        recorded?;
        Ok(())
    }

    /// Stop publishing. Recording is not affected.
    #[instrument(name = "client_stop", skip(self))]
    pub fn stop(&self) {
        if let Some(session) = self.session() {
            session.stop();
        }
        self.metrics.stop();
    }

    /// State of the current session, `Idle` before the first connect.
    pub fn state(&self) -> SessionState {
        self.session()
            .map(|s| s.state())
            .unwrap_or(SessionState::Idle)
    }

    /// Protocol of the current session.
    pub fn protocol(&self) -> Option<&'static str> {
        self.session().map(|s| s.protocol())
    }

    fn session(&self) -> Option<Arc<dyn PublishSession>> {
        self.session.read().clone()
    }

    pub fn start_record(&self, target: RecordTarget) -> RecordResult<()> {
        self.recorder.start_record(target)
    }

    pub fn pause_record(&self) -> RecordResult<()> {
        self.recorder.pause_record()
    }

    pub fn resume_record(&self) -> RecordResult<()> {
        self.recorder.resume_record()
    }

    pub fn stop_record(&self) -> RecordResult<()> {
        self.recorder.stop_record()
    }

    pub fn record_state(&self) -> RecordState {
        self.recorder.state()
    }

    /// Frames currently queued for the network.
    pub fn items_in_cache(&self) -> usize {
        self.session()
            .map(|s| s.sender().items_in_cache())
            .unwrap_or(0)
    }

    /// Frame queue capacity.
    pub fn cache_size(&self) -> usize {
        self.session()
            .map(|s| s.sender().cache_size())
            .unwrap_or_else(|| self.config.read().queue_capacity)
    }

    pub fn clear_cache(&self) {
        if let Some(session) = self.session() {
            session.sender().clear_cache();
        }
    }

    /// Resize the frame queue of the current session and of future ones.
    pub fn resize_cache(&self, capacity: usize) -> ClientResult<()> {
        if let Some(session) = self.session() {
            session.sender().resize_cache(capacity)?;
        }
        self.config.write().queue_capacity = capacity;
        Ok(())
    }

    /// Returns true when the frame queue is at least `percent_used` full.
    pub fn has_congestion(&self, percent_used: u8) -> bool {
        self.session()
            .is_some_and(|s| s.sender().has_congestion(percent_used))
    }

    /// Reset the per-track sent and dropped frame counters.
    pub fn reset_statistics(&self) {
        if let Some(session) = self.session() {
            let stats = session.sender().statistics();
            stats.reset_sent_video_frames();
            stats.reset_sent_audio_frames();
            stats.reset_dropped_video_frames();
            stats.reset_dropped_audio_frames();
        }
        self.metrics.reset();
    }

    pub fn metrics(&self) -> ClientMetrics {
        let stream = self.session().map(|s| s.sender().metrics());
        self.metrics
            .snapshot(stream, self.recorder.samples_written())
    }

    /// Warnings for the current metrics, logged as they are found.
    pub fn check_warnings(&self) -> Vec<MetricsWarning> {
        let warnings = check_warnings(&self.metrics());
        for warning in &warnings {
            warn!(?warning, "Stream warning");
        }
        warnings
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            if !session.state().can_connect() {
                session.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    use bytes::Bytes;
    use crossbeam_channel::Receiver;

    use super::*;
    use crate::error::ClientError;
    use crate::record::RecordContainer;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn header(head: &str, name: &str) -> Option<String> {
        head.lines().find_map(|line| {
            let (n, v) = line.split_once(':')?;
            n.trim().eq_ignore_ascii_case(name).then(|| v.trim().to_string())
        })
    }

    /// Answers every RTSP request with 200 and records the interleaved channels it sees.
    fn serve_rtsp(mut stream: TcpStream) -> Vec<u8> {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut pending = Vec::new();
        let mut channels = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            loop {
                if pending.first() == Some(&b'$') {
                    if pending.len() < 4 {
                        break;
                    }
                    let len = u16::from_be_bytes([pending[2], pending[3]]) as usize;
                    if pending.len() < 4 + len {
                        break;
                    }
                    channels.push(pending[1]);
                    pending.drain(..4 + len);
                    continue;
                }

                let Some(end) = pending.windows(4).position(|w| w == b"\r\n\r\n") else {
                    break;
                };
                let head = String::from_utf8_lossy(&pending[..end]).into_owned();
                let length = header(&head, "Content-Length")
                    .map(|v| v.parse::<usize>().unwrap())
                    .unwrap_or(0);
                if pending.len() < end + 4 + length {
                    break;
                }
                pending.drain(..end + 4 + length);

                let method = head.split(' ').next().unwrap_or_default().to_string();
                let mut reply = format!(
                    "RTSP/1.0 200 OK\r\nCSeq: {}\r\nSession: 5C1D\r\n",
                    header(&head, "CSeq").unwrap()
                );
                if let Some(transport) = header(&head, "Transport") {
                    reply.push_str(&format!("Transport: {transport}\r\n"));
                }
                reply.push_str("\r\n");
                stream.write_all(reply.as_bytes()).unwrap();
                if method == "TEARDOWN" {
                    return channels;
                }
            }
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return channels,
                Ok(n) => pending.extend_from_slice(&buf[..n]),
            }
        }
    }

    fn video_format() -> VideoFormat {
        VideoFormat::h264(
            640,
            360,
            25,
            Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1E, 0x8C, 0x8D, 0x40]),
            Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]),
        )
    }

    fn idr(pts_us: u64) -> AccessUnit {
        AccessUnit::video(vec![0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x21], pts_us, true)
    }

    fn non_idr(pts_us: u64) -> AccessUnit {
        AccessUnit::video(vec![0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x02], pts_us, false)
    }

    fn client() -> (StreamClient, Receiver<ConnectEvent>, Receiver<RecordEvent>) {
        let (tx, rx) = publisher_ipc::event_channel();
        let (record_tx, record_rx) = publisher_ipc::record_event_channel();
        let client = StreamClient::new(
            PublishConfig::default(),
            EventEmitter::new(tx),
            EventEmitter::new(record_tx),
        );
        (client, rx, record_rx)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_protocol_from_scheme() {
        assert_eq!(Protocol::from_url("rtmp://h/app/key").unwrap(), Protocol::Rtmp);
        assert_eq!(Protocol::from_url("RTMPS://h/app/key").unwrap(), Protocol::Rtmp);
        assert_eq!(Protocol::from_url("rtsp://h/live").unwrap(), Protocol::Rtsp);
        assert_eq!(Protocol::from_url("srt://h:9000").unwrap(), Protocol::Srt);
        assert!(Protocol::from_url("http://h/x").is_err());
        assert!(Protocol::from_url("rtmp://").is_err());
        assert!(Protocol::from_url("no-scheme").is_err());
    }

    #[test]
    fn test_malformed_endpoint_fails_without_retry() {
        let (client, rx, _) = client();
        let result = client.connect("http://example.com/live");
        assert!(matches!(
            result,
            Err(ClientError::Transport(TransportError::InvalidUrl(_)))
        ));
        assert!(matches!(rx.try_recv(), Ok(ConnectEvent::Failed { .. })));
        assert!(!client.should_retry(&result.unwrap_err().to_string()));
        assert_eq!(client.state(), SessionState::Idle);
    }

    #[test]
    fn test_publish_and_record_together() {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || serve_rtsp(listener.accept().unwrap().0));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.flv");
        let (client, rx, record_rx) = client();
        client.set_video_format(video_format());
        client.start_record(RecordTarget::path(&path)).unwrap();

        client
            .connect(&format!("rtsp://127.0.0.1:{port}/live/cam"))
            .unwrap();
        assert_eq!(client.state(), SessionState::Publishing);
        assert_eq!(client.protocol(), Some("rtsp"));
        assert!(matches!(
            client.connect(&format!("rtsp://127.0.0.1:{port}/live/cam")),
            Err(ClientError::Transport(TransportError::AlreadyConnected))
        ));

        client.send(&non_idr(0)).unwrap();
        client.send(&idr(40_000)).unwrap();
        client.send(&non_idr(80_000)).unwrap();
        wait_until(|| {
            let metrics = client.metrics();
            metrics.stream.sent_video_frames >= 3 && metrics.stream.items_in_cache == 0
        });

        let metrics = client.metrics();
        assert_eq!(metrics.video_units, 3);
        assert_eq!(metrics.recorded_samples, 2);
        assert!(!client.has_congestion(80));
        assert!(client.check_warnings().is_empty());

        client.stop();
        client.stop_record().unwrap();
        assert_eq!(client.state(), SessionState::Closed);

        let channels = server.join().unwrap();
        assert!(channels.iter().filter(|c| **c == 0).count() >= 3);

        let events: Vec<_> = rx.try_iter().collect();
        assert!(events.contains(&ConnectEvent::Connected));
        assert_eq!(events.last(), Some(&ConnectEvent::Disconnected));

        let record_events: Vec<_> = record_rx.try_iter().collect();
        assert_eq!(
            record_events.last(),
            Some(&RecordEvent::StatusChanged(RecordState::Stopped))
        );
        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[..3], b"FLV");
    }

    #[test]
    fn test_retry_reconnects_to_last_url() {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            // First attempt: hang up before answering OPTIONS.
            drop(listener.accept().unwrap().0);
            serve_rtsp(listener.accept().unwrap().0)
        });

        let (client, _rx, _) = client();
        let client = client.with_reconnect_policy(ReconnectPolicy::with_max_attempts(1));
        client.set_video_format(video_format());

        let error = client
            .connect(&format!("rtsp://127.0.0.1:{port}/live"))
            .unwrap_err();
        assert_eq!(client.state(), SessionState::Closed);
        assert!(client.should_retry(&error.to_string()));
        assert_eq!(client.reconnect_delay(), Duration::from_millis(1000));

        client.retry(Duration::ZERO).unwrap();
        assert_eq!(client.state(), SessionState::Publishing);

        client.stop();
        server.join().unwrap();
    }

    #[test]
    fn test_retry_budget_is_exhausted() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            drop(listener.accept().unwrap().0);
            drop(listener.accept().unwrap().0);
        });

        let (client, _rx, _) = client();
        let client = client.with_reconnect_policy(ReconnectPolicy::with_max_attempts(1));
        client.set_video_format(video_format());

        let error = client
            .connect(&format!("rtsp://127.0.0.1:{port}/live"))
            .unwrap_err();
        assert!(client.should_retry(&error.to_string()));
        let error = client.retry(Duration::ZERO).unwrap_err();
        assert!(!client.should_retry(&error.to_string()));
        server.join().unwrap();
    }

    #[test]
    fn test_recording_without_session() {
        let (client, _rx, _) = client();
        client.set_video_format(video_format());
        client
            .start_record(RecordTarget::writer(Vec::new(), RecordContainer::Flv))
            .unwrap();

        client.send(&idr(0)).unwrap();
        client.send(&non_idr(40_000)).unwrap();
        client.pause_record().unwrap();
        client.send(&non_idr(80_000)).unwrap();
        assert_eq!(client.record_state(), RecordState::Paused);
        client.resume_record().unwrap();
        client.send(&non_idr(120_000)).unwrap();
        assert_eq!(client.record_state(), RecordState::Resumed);
        client.send(&idr(160_000)).unwrap();

        assert_eq!(client.record_state(), RecordState::Recording);
        assert_eq!(client.metrics().recorded_samples, 3);
        assert_eq!(client.state(), SessionState::Idle);
        assert_eq!(client.cache_size(), PublishConfig::default().queue_capacity);
        client.resize_cache(32).unwrap();
        assert_eq!(client.cache_size(), 32);
    }
}
