//! RTSP publish session.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use publisher_ipc::{
    ConnectEvent, Credentials, EventEmitter, PublishConfig, RtspTransportMode, SessionState,
};
use publisher_media::{AccessUnit, AudioFormat, TrackKind, VideoCodec, VideoFormat};
use tracing::{debug, info, instrument, trace, warn};

use super::request::{Challenge, Method, Request, Response};
use super::rtcp::RtcpReporter;
use super::rtp::{AacPacketizer, H264Packetizer, Packetizer, RTP_HEADER_SIZE};
use super::{rtp_channel, sdp, RtspUrl};
use crate::error::TransportError;
use crate::queue::WireFrame;
use crate::sender::{MediaSender, Transport};
use crate::session::{self, PublishSession, SharedState, SharedStream};
use crate::TransportResult;

/// Socket read timeout once the sender thread owns the connection.
const SERVICE_READ_TIMEOUT: Duration = Duration::from_millis(5);

/// Write timeout for the closing commands sent by `stop`.
const GOODBYE_WRITE_TIMEOUT: Duration = Duration::from_millis(250);

/// Preferred local UDP port pairs.
const AUDIO_CLIENT_PORT: u16 = 5000;
const VIDEO_CLIENT_PORT: u16 = 5002;

/// The RTSP control connection.
struct Control {
    output: SharedStream,
    input: TcpStream,
    credentials: Option<Credentials>,
    challenge: Option<Challenge>,
    session: Option<String>,
    cseq: u32,
    timeout: Duration,
    pending: Vec<u8>,
    read_buf: Vec<u8>,
}

impl Control {
    fn new(stream: TcpStream, credentials: Option<Credentials>, timeout: Duration) -> TransportResult<Self> {
        Ok(Self {
            input: stream.try_clone()?,
            output: Arc::new(Mutex::new(stream)),
            credentials,
            challenge: None,
            session: None,
            cseq: 0,
            timeout,
            pending: Vec::new(),
            read_buf: vec![0; 4096],
        })
    }

    fn write_request(&mut self, request: &Request) -> TransportResult<()> {
        self.cseq += 1;
        let authorization = match (&self.challenge, &self.credentials) {
            (Some(challenge), Some(credentials)) => {
                Some(challenge.authorization(credentials, request.method, &request.uri))
            }
            _ => None,
        };
        let text = request.encode(self.cseq, self.session.as_deref(), authorization.as_deref());
        trace!(method = request.method.as_str(), cseq = self.cseq, "RTSP request");

        let mut stream = self.output.lock();
        stream.write_all(text.as_bytes())?;
        stream.flush()?;
        Ok(())
    }

    fn read_response(&mut self, method: Method) -> TransportResult<Response> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some((response, used)) = Response::parse(&self.pending)? {
                self.pending.drain(..used);
                if response.cseq().is_some_and(|cseq| cseq != self.cseq) {
                    debug!(cseq = ?response.cseq(), "Skipping stale response");
                    continue;
                }
                return Ok(response);
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout(format!("{} reply", method.as_str())));
            }
            let n = session::read_available(&mut self.input, &mut self.read_buf)?;
            self.pending.extend_from_slice(&self.read_buf[..n]);
        }
    }

    /// Send a request and wait for a success reply, answering one `401`
    /// with credentials.
    fn request(&mut self, request: &Request, events: &EventEmitter) -> TransportResult<Response> {
        let method = request.method;
        let mut retried = false;
        loop {
            self.write_request(request)?;
            let response = self.read_response(method)?;
            match response.status {
                200..=299 => {
                    if retried {
                        info!(method = method.as_str(), "Authentication accepted");
                        events.emit(ConnectEvent::AuthSuccess);
                    }
                    return Ok(response);
                }
                401 => {
                    if self.credentials.is_none() {
                        return Err(TransportError::AuthenticationFailed(
                            "server requires credentials".to_string(),
                        ));
                    }
                    if retried {
                        return Err(TransportError::AuthenticationFailed(format!(
                            "{} rejected the credentials",
                            method.as_str()
                        )));
                    }
                    let challenge = response
                        .headers
                        .iter()
                        .filter(|(name, _)| name.eq_ignore_ascii_case("WWW-Authenticate"))
                        .filter_map(|(_, value)| Challenge::parse(value))
                        .max_by_key(|c| matches!(c, Challenge::Digest { .. }))
                        .ok_or_else(|| {
                            TransportError::Protocol("401 without a supported challenge".to_string())
                        })?;
                    debug!(?challenge, "Server requested authentication");
                    self.challenge = Some(challenge);
                    retried = true;
                }
                403 => return Err(TransportError::Connection("access denied".to_string())),
                status => {
                    return Err(TransportError::Protocol(format!(
                        "{} answered {} {}",
                        method.as_str(),
                        status,
                        response.reason
                    )));
                }
            }
        }
    }

    fn shutdown(&self) {
        if let Err(e) = self.output.lock().shutdown(Shutdown::Both) {
            trace!(error = %e, "Socket shutdown");
        }
    }

    /// Close the socket without the output lock, failing any write in flight.
    fn abort(&self) {
        if let Err(e) = self.input.shutdown(Shutdown::Both) {
            trace!(error = %e, "Socket shutdown");
        }
    }
}

/// Local RTP/RTCP sockets of one track in UDP mode.
struct UdpPair {
    rtp: UdpSocket,
    rtcp: UdpSocket,
}

impl UdpPair {
    fn bind(preferred: u16) -> TransportResult<Self> {
        if let (Ok(rtp), Ok(rtcp)) = (
            UdpSocket::bind(("0.0.0.0", preferred)),
            UdpSocket::bind(("0.0.0.0", preferred + 1)),
        ) {
            return Ok(Self { rtp, rtcp });
        }
        warn!(port = preferred, "Client ports busy, using ephemeral ports");
        Ok(Self {
            rtp: UdpSocket::bind("0.0.0.0:0")?,
            rtcp: UdpSocket::bind("0.0.0.0:0")?,
        })
    }

    fn ports(&self) -> TransportResult<(u16, u16)> {
        Ok((self.rtp.local_addr()?.port(), self.rtcp.local_addr()?.port()))
    }
}

/// Where a channel's datagrams go in UDP mode.
struct UdpRoute {
    channel: u8,
    socket: UdpSocket,
    destination: SocketAddr,
}

enum MediaPath {
    Interleaved(SharedStream),
    Udp(Vec<UdpRoute>),
}

/// Socket owner moved into the sender thread once recording.
struct RtspTransport {
    path: MediaPath,
    control: TcpStream,
    read_buf: Vec<u8>,
}

impl Transport for RtspTransport {
    fn write_frame(&mut self, frame: &WireFrame) -> TransportResult<usize> {
        match &self.path {
            MediaPath::Interleaved(stream) => {
                let len = u16::try_from(frame.len()).map_err(|_| {
                    TransportError::Protocol(format!("{} byte packet cannot be interleaved", frame.len()))
                })?;
                let [hi, lo] = len.to_be_bytes();
                let mut stream = stream.lock();
                stream.write_all(&[b'$', frame.channel, hi, lo])?;
                stream.write_all(&frame.data)?;
                Ok(frame.len() + 4)
            }
            MediaPath::Udp(routes) => {
                let route = routes
                    .iter()
                    .find(|r| r.channel == frame.channel)
                    .ok_or_else(|| {
                        TransportError::Protocol(format!("no UDP route for channel {}", frame.channel))
                    })?;
                Ok(route.socket.send_to(&frame.data, route.destination)?)
            }
        }
    }

    fn service(&mut self) -> TransportResult<()> {
        // Receiver reports and keepalive replies are not acted on.
        loop {
            let n = session::read_available(&mut self.control, &mut self.read_buf)?;
            if n == 0 {
                return Ok(());
            }
            trace!(bytes = n, "Discarding server data");
        }
    }
}

/// Packetizer and report state of one announced track.
struct TrackOutput {
    packetizer: Box<dyn Packetizer>,
    reporter: RtcpReporter,
    channel: u8,
}

impl TrackOutput {
    fn new(packetizer: Box<dyn Packetizer>, kind: TrackKind, rtcp_interval: Duration) -> Self {
        let reporter = RtcpReporter::new(packetizer.stream().ssrc(), rtcp_interval);
        Self {
            packetizer,
            reporter,
            channel: rtp_channel(kind),
        }
    }
}

struct Publication {
    control: Control,
    uri: String,
    video: Option<TrackOutput>,
    audio: Option<TrackOutput>,
}

#[derive(Debug, Clone, Default)]
struct Formats {
    video: Option<VideoFormat>,
    audio: Option<AudioFormat>,
}

/// RTSP publisher.
pub struct RtspClient {
    config: PublishConfig,
    events: EventEmitter,
    state: SharedState,
    sender: MediaSender,
    formats: Mutex<Formats>,
    publication: Mutex<Option<Publication>>,
}

impl RtspClient {
    /// Create an idle client.
    pub fn new(config: PublishConfig, events: EventEmitter) -> Self {
        let sender = MediaSender::new(&config, events.clone());
        Self {
            config,
            events,
            state: SharedState::default(),
            sender,
            formats: Mutex::new(Formats::default()),
            publication: Mutex::new(None),
        }
    }

    fn establish(&self, url: &str) -> TransportResult<()> {
        let url = RtspUrl::parse(url)?;
        let Formats { video, audio } = self.formats.lock().clone();
        if video.is_none() && audio.is_none() {
            return Err(TransportError::Protocol("no track to announce".to_string()));
        }
        if let Some(video) = &video {
            if video.codec != VideoCodec::H264 {
                return Err(TransportError::Protocol(format!(
                    "{:?} cannot be published over RTSP",
                    video.codec
                )));
            }
        }

        let credentials = self
            .config
            .credentials
            .clone()
            .or_else(|| url.credentials.clone());
        let timeout = Duration::from_millis(self.config.io_timeout_ms);
        let stream = session::connect_tcp(&url.host, url.port, timeout)?;
        let server_ip = stream.peer_addr()?.ip();
        let mut control = Control::new(stream, credentials, timeout)?;

        control.request(&Request::new(Method::Options, url.uri.as_str()), &self.events)?;
        let description = sdp::describe(&url.host, video.as_ref(), audio.as_ref())?;
        control.request(
            &Request::new(Method::Announce, url.uri.as_str()).body("application/sdp", description),
            &self.events,
        )?;
        self.state.set(SessionState::ControlNegotiated);

        let mode = self.config.rtsp_transport;
        let rtcp_interval = Duration::from_millis(self.config.rtcp_interval_ms);
        let mut routes = Vec::new();
        let mut video_output = None;
        let mut audio_output = None;

        let tracks = [
            video.as_ref().map(|_| TrackKind::Video),
            audio.as_ref().map(|_| TrackKind::Audio),
        ];
        for kind in tracks.into_iter().flatten() {
            let channel = rtp_channel(kind);
            let udp = match mode {
                RtspTransportMode::Tcp => None,
                RtspTransportMode::Udp => Some(UdpPair::bind(match kind {
                    TrackKind::Video => VIDEO_CLIENT_PORT,
                    TrackKind::Audio => AUDIO_CLIENT_PORT,
                })?),
            };
            let transport = match &udp {
                None => format!(
                    "RTP/AVP/TCP;unicast;interleaved={}-{};mode=record",
                    channel,
                    channel + 1
                ),
                Some(pair) => {
                    let (rtp, rtcp) = pair.ports()?;
                    format!("RTP/AVP;unicast;client_port={rtp}-{rtcp};mode=record")
                }
            };

            let response = control.request(
                &Request::new(Method::Setup, url.track_uri(kind)).header("Transport", transport),
                &self.events,
            )?;
            if control.session.is_none() {
                control.session = response.session().map(str::to_string);
            }
            if let Some(pair) = udp {
                let (rtp_port, rtcp_port) = response.server_ports().ok_or_else(|| {
                    TransportError::Protocol("SETUP reply without server_port".to_string())
                })?;
                debug!(track = kind.name(), rtp_port, rtcp_port, "UDP transport negotiated");
                routes.push(UdpRoute {
                    channel,
                    socket: pair.rtp,
                    destination: SocketAddr::new(server_ip, rtp_port),
                });
                routes.push(UdpRoute {
                    channel: channel + 1,
                    socket: pair.rtcp,
                    destination: SocketAddr::new(server_ip, rtcp_port),
                });
            }

            match (kind, &video, &audio) {
                (TrackKind::Video, Some(format), _) => {
                    let packetizer =
                        H264Packetizer::new(format, sdp::payload_type(kind), self.config.mtu);
                    video_output = Some(TrackOutput::new(Box::new(packetizer), kind, rtcp_interval));
                }
                (TrackKind::Audio, _, Some(format)) => {
                    let packetizer = AacPacketizer::new(format, sdp::payload_type(kind));
                    audio_output = Some(TrackOutput::new(Box::new(packetizer), kind, rtcp_interval));
                }
                _ => {}
            }
        }

        control.request(
            &Request::new(Method::Record, url.uri.as_str()).header("Range", "npt=0.000-"),
            &self.events,
        )?;

        let path = match mode {
            RtspTransportMode::Tcp => MediaPath::Interleaved(Arc::clone(&control.output)),
            RtspTransportMode::Udp => MediaPath::Udp(routes),
        };
        control.input.set_read_timeout(Some(SERVICE_READ_TIMEOUT))?;
        let transport = RtspTransport {
            path,
            control: control.input.try_clone()?,
            read_buf: vec![0; 4096],
        };
        self.sender.start(
            Box::new(transport),
            session::sender_failure(self.state.clone(), self.events.clone()),
        )?;

        *self.publication.lock() = Some(Publication {
            control,
            uri: url.uri.clone(),
            video: video_output,
            audio: audio_output,
        });
        self.state.set(SessionState::Publishing);
        self.events.emit(ConnectEvent::Connected);
        info!(uri = %url.uri, ?mode, "Recording");
        Ok(())
    }
}

impl PublishSession for RtspClient {
    fn protocol(&self) -> &'static str {
        "rtsp"
    }

    fn set_video_format(&self, format: VideoFormat) {
        self.formats.lock().video = Some(format);
    }

    fn set_audio_format(&self, format: AudioFormat) {
        self.formats.lock().audio = Some(format);
    }

    #[instrument(name = "rtsp_connect", skip(self))]
    fn connect(&self, url: &str) -> TransportResult<()> {
        self.state.begin_connect()?;
        self.events.emit(ConnectEvent::Started {
            url: url.to_string(),
        });

        self.establish(url).inspect_err(|e| {
            session::report_connect_error(self.protocol(), &self.state, &self.events, e);
        })
    }

    fn send(&self, unit: &AccessUnit) -> TransportResult<()> {
        let mut publication = self.publication.lock();
        let Some(publication) = publication.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        if !self.state.get().is_publishing() {
            return Err(TransportError::NotConnected);
        }

        let track = match unit.kind {
            TrackKind::Video => publication.video.as_mut(),
            TrackKind::Audio => publication.audio.as_mut(),
        }
        .ok_or_else(|| TransportError::Protocol(format!("no {} track announced", unit.kind.name())))?;

        let rtp_timestamp = track.packetizer.stream().timestamp(unit.pts_us);
        let frames: Vec<WireFrame> = track
            .packetizer
            .packetize(unit)
            .into_iter()
            .map(|packet| WireFrame::new(unit.kind, track.channel, unit.pts_us, packet))
            .collect();
        let payloads: Vec<usize> = frames.iter().map(|f| f.len() - RTP_HEADER_SIZE).collect();

        // A dropped unit leaves a sequence gap, which receivers treat as loss.
        let queued = self.sender.push_all(frames);
        if queued.is_ok() {
            for payload_len in payloads {
                track.reporter.on_packet_sent(payload_len, rtp_timestamp);
            }
        }

        if let Some(report) = track.reporter.poll(Instant::now()) {
            let frame = WireFrame::new(unit.kind, track.channel + 1, unit.pts_us, report);
            if let Err(e) = self.sender.push(frame) {
                debug!(error = %e, "Sender report dropped");
            }
        }
        queued
    }

    #[instrument(name = "rtsp_stop", skip(self))]
    fn stop(&self) {
        let joined = self.sender.stop();

        if let Some(mut publication) = self.publication.lock().take() {
            if joined {
                let bounded = publication.control.input.set_write_timeout(Some(GOODBYE_WRITE_TIMEOUT));
                if let Err(e) = bounded {
                    trace!(error = %e, "Socket write timeout");
                }
                let teardown = Request::new(Method::Teardown, publication.uri.as_str());
                if let Err(e) = publication.control.write_request(&teardown) {
                    warn!(error = %e, "Failed to send TEARDOWN");
                }
                publication.control.shutdown();
            } else {
                // The detached sender may still hold the socket mid-write.
                publication.control.abort();
            }
        }

        let previous = self.state.get();
        self.state.set(SessionState::Closed);
        if previous != SessionState::Idle {
            self.events.emit(ConnectEvent::Disconnected);
        }
        info!(joined, "RTSP session stopped");
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    fn sender(&self) -> &MediaSender {
        &self.sender
    }
}
