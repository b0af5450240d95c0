//! SRT caller session.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{IpAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use publisher_ipc::{ConnectEvent, EventEmitter, PublishConfig, SessionState};
use publisher_media::mpegts::TsMuxer;
use publisher_media::{AccessUnit, AudioFormat, VideoFormat};
use tracing::{debug, info, instrument, trace, warn};

use super::packet::{
    handshake_type, next_sequence, ControlPacket, ControlType, DataPacket, Handshake, Packet,
    MAX_SEQUENCE, SRT_MAGIC,
};
use super::{SrtUrl, MAX_PAYLOAD_SIZE};
use crate::error::TransportError;
use crate::queue::WireFrame;
use crate::sender::{MediaSender, Transport};
use crate::session::{self, PublishSession, SharedState};
use crate::TransportResult;

/// Handshake requests are repeated until answered.
const HANDSHAKE_RETRY: Duration = Duration::from_millis(250);

/// Socket read timeout once the sender thread owns the socket.
const SERVICE_READ_TIMEOUT: Duration = Duration::from_millis(5);

/// Idle time after which a keepalive is sent.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Data packets kept for retransmission.
const SEND_HISTORY: usize = 8192;

const LATENCY_MS: u16 = 120;

const MAX_MESSAGE_NUMBER: u32 = 0x03FF_FFFF;

/// A connected UDP socket and the ids on either end.
struct Link {
    socket: UdpSocket,
    peer_socket_id: u32,
    started: Instant,
}

impl Link {
    /// Microseconds since the socket was opened, wrapping at 32 bits.
    fn timestamp(&self) -> u32 {
        self.started.elapsed().as_micros() as u32
    }

    fn send_control(&self, control_type: ControlType, info: u32, body: Bytes) -> TransportResult<()> {
        let packet = ControlPacket::new(control_type, info, self.timestamp(), self.peer_socket_id, body);
        self.socket.send(&packet.encode())?;
        Ok(())
    }

    fn try_clone(&self) -> TransportResult<Self> {
        Ok(Self {
            socket: self.socket.try_clone()?,
            peer_socket_id: self.peer_socket_id,
            started: self.started,
        })
    }
}

/// Next packet on the socket, or `None` if the read timed out.
fn recv_packet(socket: &UdpSocket, buf: &mut [u8]) -> TransportResult<Option<Packet>> {
    match socket.recv(buf) {
        Ok(n) => match Packet::parse(&buf[..n]) {
            Ok(packet) => Ok(Some(packet)),
            Err(e) => {
                trace!(error = %e, "Ignoring malformed datagram");
                Ok(None)
            }
        },
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
            Ok(None)
        }
        Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
            Err(TransportError::Connection("peer unreachable".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn rejection(code: u32) -> TransportError {
    if code == handshake_type::REJECT_BAD_SECRET {
        TransportError::AuthenticationFailed("peer rejected the passphrase".to_string())
    } else {
        TransportError::Connection(format!("handshake rejected with reason {code}"))
    }
}

/// Send `request` until a handshake of type `expected` (or a rejection) comes back.
fn exchange(link: &Link, request: &Handshake, expected: u32, deadline: Instant) -> TransportResult<Handshake> {
    let mut buf = vec![0u8; 1500];
    let mut last_sent: Option<Instant> = None;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(TransportError::Timeout("SRT handshake".to_string()));
        }
        if last_sent.map_or(true, |t| now.duration_since(t) >= HANDSHAKE_RETRY) {
            let packet = ControlPacket::new(ControlType::Handshake, 0, link.timestamp(), 0, request.encode());
            link.socket.send(&packet.encode())?;
            last_sent = Some(now);
        }

        let Some(Packet::Control(packet)) = recv_packet(&link.socket, &mut buf)? else {
            continue;
        };
        if packet.control_type != ControlType::Handshake {
            continue;
        }
        let response = Handshake::parse(&packet.body)?;
        if response.is_rejection() {
            return Err(rejection(response.handshake_type));
        }
        if response.handshake_type == expected {
            return Ok(response);
        }
        trace!(handshake_type = response.handshake_type, "Ignoring handshake");
    }
}

/// Socket owner moved into the sender thread once connected.
struct SrtTransport {
    link: Link,
    next_sequence: u32,
    next_message: u32,
    history: VecDeque<DataPacket>,
    last_sent: Instant,
    read_buf: Vec<u8>,
}

impl SrtTransport {
    fn new(link: Link, initial_sequence: u32) -> Self {
        Self {
            link,
            next_sequence: initial_sequence,
            next_message: 1,
            history: VecDeque::with_capacity(SEND_HISTORY),
            last_sent: Instant::now(),
            read_buf: vec![0; 1500],
        }
    }

    fn retransmit(&mut self, start: u32, end: u32) -> TransportResult<()> {
        let span = end.wrapping_sub(start) & MAX_SEQUENCE;
        let mut resent = 0;
        for packet in &self.history {
            if packet.sequence.wrapping_sub(start) & MAX_SEQUENCE <= span {
                let packet = DataPacket {
                    retransmitted: true,
                    ..packet.clone()
                };
                self.link.socket.send(&packet.encode())?;
                resent += 1;
            }
        }
        debug!(start, end, resent, "Retransmitted lost packets");
        Ok(())
    }

    fn handle_control(&mut self, packet: ControlPacket) -> TransportResult<()> {
        match packet.control_type {
            ControlType::Ack if packet.info != 0 => {
                self.link.send_control(ControlType::AckAck, packet.info, Bytes::new())?;
            }
            ControlType::Nak => {
                for (start, end) in packet.loss_list() {
                    self.retransmit(start, end)?;
                }
            }
            ControlType::Shutdown => {
                return Err(TransportError::Connection("peer shut down the connection".to_string()));
            }
            ControlType::PeerError => {
                return Err(TransportError::Protocol(format!("peer error {}", packet.info)));
            }
            other => trace!(control_type = ?other, "Control packet"),
        }
        Ok(())
    }
}

impl Transport for SrtTransport {
    fn write_frame(&mut self, frame: &WireFrame) -> TransportResult<usize> {
        let packet = DataPacket {
            sequence: self.next_sequence,
            message_number: self.next_message,
            retransmitted: false,
            timestamp: self.link.timestamp(),
            destination: self.link.peer_socket_id,
            payload: frame.data.clone(),
        };
        let bytes = packet.encode();
        self.link.socket.send(&bytes)?;

        self.next_sequence = next_sequence(self.next_sequence);
        self.next_message = if self.next_message >= MAX_MESSAGE_NUMBER {
            1
        } else {
            self.next_message + 1
        };
        if self.history.len() == SEND_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(packet);
        self.last_sent = Instant::now();
        Ok(bytes.len())
    }

    fn service(&mut self) -> TransportResult<()> {
        while let Some(packet) = recv_packet(&self.link.socket, &mut self.read_buf)? {
            if let Packet::Control(control) = packet {
                self.handle_control(control)?;
            }
        }
        if self.last_sent.elapsed() >= KEEPALIVE_INTERVAL {
            self.link.send_control(ControlType::KeepAlive, 0, Bytes::new())?;
            self.last_sent = Instant::now();
        }
        Ok(())
    }
}

struct Publication {
    link: Link,
    muxer: TsMuxer,
}

#[derive(Debug, Clone, Default)]
struct Formats {
    video: Option<VideoFormat>,
    audio: Option<AudioFormat>,
}

/// SRT publisher.
pub struct SrtClient {
    config: PublishConfig,
    events: EventEmitter,
    state: SharedState,
    sender: MediaSender,
    formats: Mutex<Formats>,
    publication: Mutex<Option<Publication>>,
}

impl SrtClient {
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
        let url = SrtUrl::parse(url)?;
        let Formats { video, audio } = self.formats.lock().clone();
        if video.is_none() && audio.is_none() {
            return Err(TransportError::Protocol("no track to publish".to_string()));
        }

        let addr = (url.host.as_str(), url.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Connection(format!("cannot resolve {}: {e}", url.host)))?
            .next()
            .ok_or_else(|| TransportError::Connection(format!("{}: no address", url.host)))?;
        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(addr)?;
        socket.set_read_timeout(Some(HANDSHAKE_RETRY / 5))?;

        let mut peer_ip = [0u8; 16];
        match addr.ip() {
            IpAddr::V4(ip) => peer_ip[..4].copy_from_slice(&ip.octets()),
            IpAddr::V6(ip) => peer_ip.copy_from_slice(&ip.octets()),
        }
        let mut link = Link {
            socket,
            peer_socket_id: 0,
            started: Instant::now(),
        };
        let socket_id = fastrand::u32(1..=MAX_SEQUENCE);
        let initial_sequence = fastrand::u32(..=MAX_SEQUENCE);
        let deadline = Instant::now() + Duration::from_millis(self.config.io_timeout_ms);

        let induction = Handshake::induction(socket_id, initial_sequence, self.config.mtu as u32, peer_ip);
        let response = exchange(&link, &induction, handshake_type::INDUCTION, deadline)?;
        if response.version < 5 || response.extension_field != SRT_MAGIC {
            return Err(TransportError::Protocol(format!(
                "peer answered handshake version {}",
                response.version
            )));
        }
        debug!(cookie = response.cookie, "Induction done");

        let conclusion = Handshake::conclusion(&induction, &response, url.stream_id.as_deref(), LATENCY_MS);
        let response = exchange(&link, &conclusion, handshake_type::CONCLUSION, deadline)?;
        link.peer_socket_id = response.socket_id;
        self.state.set(SessionState::ControlNegotiated);

        link.socket.set_read_timeout(Some(SERVICE_READ_TIMEOUT))?;
        let transport = SrtTransport::new(link.try_clone()?, initial_sequence);
        self.sender.start(
            Box::new(transport),
            session::sender_failure(self.state.clone(), self.events.clone()),
        )?;

        let peer_socket_id = link.peer_socket_id;
        *self.publication.lock() = Some(Publication {
            link,
            muxer: TsMuxer::new(video, audio),
        });
        self.state.set(SessionState::Publishing);
        self.events.emit(ConnectEvent::Connected);
        info!(%addr, peer_socket_id, stream_id = ?url.stream_id, "Publishing");
        Ok(())
    }
}

impl PublishSession for SrtClient {
    fn protocol(&self) -> &'static str {
        "srt"
    }

    fn set_video_format(&self, format: VideoFormat) {
        self.formats.lock().video = Some(format);
    }

    fn set_audio_format(&self, format: AudioFormat) {
        self.formats.lock().audio = Some(format);
    }

    #[instrument(name = "srt_connect", skip(self))]
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

        let ts = publication.muxer.write_unit(unit)?;
        let frames = (0..ts.len())
            .step_by(MAX_PAYLOAD_SIZE)
            .map(|offset| {
                let end = (offset + MAX_PAYLOAD_SIZE).min(ts.len());
                WireFrame::new(unit.kind, 0, unit.pts_us, ts.slice(offset..end))
            })
            .collect();
        self.sender.push_all(frames)
    }

    #[instrument(name = "srt_stop", skip(self))]
    fn stop(&self) {
        let joined = self.sender.stop();

        if let Some(publication) = self.publication.lock().take() {
            let body = Bytes::from_static(&[0; 4]);
            if let Err(e) = publication.link.send_control(ControlType::Shutdown, 0, body) {
                warn!(error = %e, "Failed to send shutdown");
            }
        }

        let previous = self.state.get();
        self.state.set(SessionState::Closed);
        if previous != SessionState::Idle {
            self.events.emit(ConnectEvent::Disconnected);
        }
        info!(joined, "SRT session stopped");
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    fn sender(&self) -> &MediaSender {
        &self.sender
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srt::packet::encode_loss_list;
    use crossbeam_channel::Receiver;
    use publisher_media::mpegts::TS_PACKET_SIZE;
    use std::net::SocketAddr;
    use std::thread;

    const PEER_SOCKET_ID: u32 = 0x00C0_FFEE;

    struct FakePeer {
        socket: UdpSocket,
        client: Option<SocketAddr>,
    }

    impl FakePeer {
        fn bind() -> (Self, u16) {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let port = socket.local_addr().unwrap().port();
            (Self { socket, client: None }, port)
        }

        fn recv(&mut self) -> Packet {
            let mut buf = [0u8; 1500];
            let (n, from) = self.socket.recv_from(&mut buf).unwrap();
            self.client = Some(from);
            Packet::parse(&buf[..n]).unwrap()
        }

        fn recv_control(&mut self, control_type: ControlType) -> ControlPacket {
            loop {
                if let Packet::Control(packet) = self.recv() {
                    if packet.control_type == control_type {
                        return packet;
                    }
                }
            }
        }

        fn recv_data(&mut self) -> DataPacket {
            loop {
                if let Packet::Data(packet) = self.recv() {
                    return packet;
                }
            }
        }

        fn send(&self, packet: ControlPacket) {
            self.socket
                .send_to(&packet.encode(), self.client.unwrap())
                .unwrap();
        }

        fn reply(&self, destination: u32, handshake: &Handshake) {
            self.send(ControlPacket::new(ControlType::Handshake, 0, 0, destination, handshake.encode()));
        }

        /// Answer induction and conclusion, returning the conclusion.
        fn accept(&mut self, reject: Option<u32>) -> Handshake {
            let request = self.recv_control(ControlType::Handshake);
            assert_eq!(request.destination, 0);
            let induction = Handshake::parse(&request.body).unwrap();
            assert_eq!(induction.version, 4);
            assert_eq!(induction.handshake_type, handshake_type::INDUCTION);
            self.reply(
                induction.socket_id,
                &Handshake {
                    version: 5,
                    extension_field: SRT_MAGIC,
                    cookie: 0x5EED,
                    socket_id: PEER_SOCKET_ID,
                    ..induction.clone()
                },
            );

            let conclusion = loop {
                let request = self.recv_control(ControlType::Handshake);
                let handshake = Handshake::parse(&request.body).unwrap();
                if handshake.handshake_type == handshake_type::CONCLUSION {
                    break handshake;
                }
            };
            assert_eq!(conclusion.cookie, 0x5EED);
            self.reply(
                conclusion.socket_id,
                &Handshake {
                    handshake_type: reject.unwrap_or(handshake_type::CONCLUSION),
                    socket_id: PEER_SOCKET_ID,
                    extensions: Vec::new(),
                    ..conclusion.clone()
                },
            );
            conclusion
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

    fn config() -> PublishConfig {
        PublishConfig {
            io_timeout_ms: 2000,
            ..PublishConfig::default()
        }
    }

    fn wait_for_failure(rx: &Receiver<ConnectEvent>) -> Option<String> {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if let Ok(ConnectEvent::Failed { reason }) = rx.recv_timeout(Duration::from_millis(100)) {
                return Some(reason);
            }
        }
        None
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    #[test]
    fn test_publish_ts_over_srt() {
        init_tracing();
        let (mut peer, port) = FakePeer::bind();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let server = thread::spawn(move || {
            let conclusion = peer.accept(None);
            assert_eq!(conclusion.stream_id(), Some("live/feed"));

            let first = peer.recv_data();
            let second = peer.recv_data();
            for packet in [&first, &second] {
                assert_eq!(packet.destination, PEER_SOCKET_ID);
                assert_eq!(packet.payload[0], 0x47);
                assert_eq!(packet.payload.len() % TS_PACKET_SIZE, 0);
            }
            assert_eq!(first.payload.len(), MAX_PAYLOAD_SIZE);
            assert_eq!(second.sequence, next_sequence(first.sequence));
            assert_eq!(second.message_number, first.message_number + 1);

            peer.send(ControlPacket::new(
                ControlType::Ack,
                1,
                0,
                conclusion.socket_id,
                Bytes::copy_from_slice(&next_sequence(second.sequence).to_be_bytes()),
            ));
            assert_eq!(peer.recv_control(ControlType::AckAck).info, 1);

            peer.send(ControlPacket::new(
                ControlType::Nak,
                0,
                0,
                conclusion.socket_id,
                encode_loss_list(&[(first.sequence, first.sequence)]),
            ));
            let resent = peer.recv_data();
            assert!(resent.retransmitted);
            assert_eq!(resent.sequence, first.sequence);
            assert_eq!(resent.payload, first.payload);

            done_tx.send(()).unwrap();
            let shutdown = peer.recv_control(ControlType::Shutdown);
            assert_eq!(shutdown.destination, PEER_SOCKET_ID);
        });

        let (tx, rx) = crossbeam_channel::bounded(64);
        let client = SrtClient::new(config(), EventEmitter::new(tx));
        client.set_video_format(video_format());
        client
            .connect(&format!("srt://127.0.0.1:{port}/live/feed"))
            .unwrap();
        assert_eq!(client.state(), SessionState::Publishing);

        let mut frame = vec![0, 0, 0, 1, 0x65];
        frame.resize(2000, 0xAB);
        client.send(&AccessUnit::video(frame, 0, true)).unwrap();

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        client.stop();
        server.join().unwrap();

        let events: Vec<ConnectEvent> = rx
            .try_iter()
            .filter(|e| !matches!(e, ConnectEvent::NewBitrate { .. }))
            .collect();
        assert_eq!(events.last(), Some(&ConnectEvent::Disconnected));
        assert!(events.contains(&ConnectEvent::Connected));
    }

    #[test]
    fn test_rejected_handshake_fails_connect() {
        let (mut peer, port) = FakePeer::bind();
        let server = thread::spawn(move || {
            peer.accept(Some(1003));
        });

        let (tx, rx) = crossbeam_channel::bounded(64);
        let client = SrtClient::new(config(), EventEmitter::new(tx));
        client.set_video_format(video_format());
        let result = client.connect(&format!("srt://127.0.0.1:{port}?streamid=cam"));
        server.join().unwrap();

        assert!(matches!(result, Err(TransportError::Connection(_))));
        assert_eq!(client.state(), SessionState::Closed);
        assert!(wait_for_failure(&rx).is_some_and(|reason| reason.contains("1003")));
    }

    #[test]
    fn test_bad_passphrase_reports_auth_error() {
        let (mut peer, port) = FakePeer::bind();
        let server = thread::spawn(move || {
            peer.accept(Some(handshake_type::REJECT_BAD_SECRET));
        });

        let (tx, rx) = crossbeam_channel::bounded(64);
        let client = SrtClient::new(config(), EventEmitter::new(tx));
        client.set_audio_format(AudioFormat::aac(48000, 2));
        let result = client.connect(&format!("srt://127.0.0.1:{port}/cam"));
        server.join().unwrap();

        assert!(matches!(result, Err(TransportError::AuthenticationFailed(_))));
        assert!(rx.try_iter().any(|e| e == ConnectEvent::AuthError));
    }

    #[test]
    fn test_peer_shutdown_closes_session() {
        let (mut peer, port) = FakePeer::bind();
        let server = thread::spawn(move || {
            let conclusion = peer.accept(None);
            peer.send(ControlPacket::new(
                ControlType::Shutdown,
                0,
                0,
                conclusion.socket_id,
                Bytes::from_static(&[0; 4]),
            ));
        });

        let (tx, rx) = crossbeam_channel::bounded(64);
        let client = SrtClient::new(config(), EventEmitter::new(tx));
        client.set_video_format(video_format());
        client
            .connect(&format!("srt://127.0.0.1:{port}/live"))
            .unwrap();
        server.join().unwrap();

        let reason = wait_for_failure(&rx).unwrap();
        assert!(reason.contains("shut down"));
        assert_eq!(client.state(), SessionState::Closed);
        client.stop();
    }

    #[test]
    fn test_handshake_times_out_without_peer() {
        let (peer, port) = FakePeer::bind();
        let client = SrtClient::new(
            PublishConfig {
                io_timeout_ms: 300,
                ..PublishConfig::default()
            },
            EventEmitter::disabled(),
        );
        client.set_video_format(video_format());
        assert!(matches!(
            client.connect(&format!("srt://127.0.0.1:{port}/live")),
            Err(TransportError::Timeout(_))
        ));
        drop(peer);
    }
}
