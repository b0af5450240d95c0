//! RTMP publish session.

use std::collections::HashMap;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use publisher_ipc::{ConnectEvent, Credentials, EventEmitter, PublishConfig, SessionState};
use publisher_media::amf::Amf0Value;
use publisher_media::{flv, AccessUnit, AudioFormat, TrackKind, VideoCodec, VideoFormat};
use tracing::{debug, info, instrument, trace, warn};

use super::auth::{self, AuthReply};
use super::chunk::{ChunkReader, ChunkWriter, RtmpMessage};
use super::handshake;
use super::message::{self, user_control, Command, MessageType, UserControlEvent};
use super::{csid, RtmpUrl};
use crate::error::TransportError;
use crate::queue::WireFrame;
use crate::sender::{MediaSender, Transport};
use crate::session::{self, PublishSession, SharedState, SharedStream};
use crate::TransportResult;

/// Connect rounds per attempt: plain, `authmod` announcement, computed response.
const MAX_AUTH_ROUNDS: usize = 3;

/// Socket read timeout once the sender thread owns the connection.
const SERVICE_READ_TIMEOUT: Duration = Duration::from_millis(5);

/// Write timeout for the closing commands sent by `stop`.
const GOODBYE_WRITE_TIMEOUT: Duration = Duration::from_millis(250);

const FLASH_VERSION: &str = "FMLE/3.0 (compatible; FMSc/1.0)";

/// Outgoing half of a connection: chunk header state and the socket.
#[derive(Clone)]
struct Output {
    stream: SharedStream,
    chunks: Arc<Mutex<ChunkWriter>>,

    /// Unlocked handle used to unblock a write stuck on the locked stream.
    socket: Arc<TcpStream>,
}

impl Output {
    fn send(&self, chunk_stream: u32, msg: &RtmpMessage) -> TransportResult<()> {
        let bytes = self.chunks.lock().write_message(chunk_stream, msg);
        let mut stream = self.stream.lock();
        stream.write_all(&bytes)?;
        stream.flush()?;
        Ok(())
    }

    fn shutdown(&self) {
        if let Err(e) = self.stream.lock().shutdown(Shutdown::Both) {
            trace!(error = %e, "Socket shutdown");
        }
        self.chunks.lock().reset();
    }

    /// Close the socket without the stream lock, failing any write in flight.
    fn abort(&self) {
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            trace!(error = %e, "Socket shutdown");
        }
    }
}

/// Transaction ids of commands awaiting a reply.
#[derive(Debug, Default)]
struct Transactions {
    next: u32,
    pending: HashMap<u32, &'static str>,
}

impl Transactions {
    fn begin(&mut self, name: &'static str) -> u32 {
        self.next += 1;
        self.pending.insert(self.next, name);
        self.next
    }

    fn complete(&mut self, id: u32) -> Option<&'static str> {
        self.pending.remove(&id)
    }
}

/// Credentials state for one connect round.
struct AuthRound<'a> {
    credentials: Option<&'a Credentials>,
    query: &'a str,
    responded: bool,
}

enum Negotiated {
    Publishing { stream_id: u32 },
    Reconnect { query: String, responded: bool },
}

/// One TCP connection after the handshake.
struct Connection {
    input: TcpStream,
    output: Output,
    reader: ChunkReader,
    transactions: Transactions,
    window_ack_size: u32,
    acknowledged: u64,
    read_buf: Vec<u8>,
}

impl Connection {
    fn open(url: &RtmpUrl, config: &PublishConfig) -> TransportResult<Self> {
        let timeout = Duration::from_millis(config.io_timeout_ms);
        let mut stream = session::connect_tcp(&url.host, url.port, timeout)?;
        let outcome = handshake::perform(&mut stream, config.rtmp_handshake)?;
        debug!(digest = outcome.digest_validated, "RTMP handshake done");

        let chunk_size = config.rtmp_chunk_size.clamp(1, 0xFF_FFFF);
        let connection = Self {
            input: stream.try_clone()?,
            output: Output {
                socket: Arc::new(stream.try_clone()?),
                stream: Arc::new(Mutex::new(stream)),
                chunks: Arc::new(Mutex::new(ChunkWriter::new(chunk_size))),
            },
            reader: ChunkReader::new(),
            transactions: Transactions::default(),
            window_ack_size: 0,
            acknowledged: 0,
            read_buf: vec![0; 4096],
        };
        connection
            .output
            .send(csid::PROTOCOL_CONTROL, &message::set_chunk_size(chunk_size))?;
        Ok(connection)
    }

    /// Next message from the server, or `None` if the read timed out.
    fn poll(&mut self) -> TransportResult<Option<RtmpMessage>> {
        loop {
            if let Some(msg) = self.reader.next_message()? {
                return Ok(Some(msg));
            }
            let n = session::read_available(&mut self.input, &mut self.read_buf)?;
            if n == 0 {
                return Ok(None);
            }
            self.reader.feed(&self.read_buf[..n]);
            self.acknowledge()?;
        }
    }

    fn acknowledge(&mut self) -> TransportResult<()> {
        let received = self.reader.bytes_received();
        if self.window_ack_size > 0 && received - self.acknowledged >= self.window_ack_size as u64 {
            self.acknowledged = received;
            self.output.send(
                csid::PROTOCOL_CONTROL,
                &message::acknowledgement(received as u32),
            )?;
        }
        Ok(())
    }

    /// Handle protocol control messages, passing anything else back.
    fn handle_control(&mut self, msg: RtmpMessage) -> TransportResult<Option<RtmpMessage>> {
        match MessageType::from(msg.type_id) {
            MessageType::SetChunkSize => {
                let size = message::control_value(&msg)?;
                debug!(size, "Server chunk size");
                self.reader.set_chunk_size(size);
            }
            MessageType::WindowAckSize => {
                self.window_ack_size = message::control_value(&msg)?;
                debug!(size = self.window_ack_size, "Server acknowledgement window");
            }
            MessageType::SetPeerBandwidth => {
                let size = message::control_value(&msg)?;
                self.output
                    .send(csid::PROTOCOL_CONTROL, &message::window_ack_size(size))?;
            }
            MessageType::UserControl => {
                let event = UserControlEvent::parse(&msg)?;
                if event.event_type == user_control::PING_REQUEST {
                    self.output
                        .send(csid::PROTOCOL_CONTROL, &message::ping_response(event.value))?;
                } else {
                    trace!(event_type = event.event_type, value = event.value, "User control event");
                }
            }
            MessageType::Acknowledgement | MessageType::Abort => {}
            _ => return Ok(Some(msg)),
        }
        Ok(None)
    }

    fn command(&mut self, msg: &RtmpMessage) -> TransportResult<Option<Command>> {
        match MessageType::from(msg.type_id) {
            MessageType::CommandAmf0 | MessageType::CommandAmf3 => Command::parse(msg).map(Some),
            other => {
                trace!(message_type = ?other, "Ignoring message");
                Ok(None)
            }
        }
    }

    fn send_connect(&mut self, url: &RtmpUrl, auth_query: &str) -> TransportResult<()> {
        let transaction = self.transactions.begin("connect");
        let object = Amf0Value::object([
            ("app", Amf0Value::string(format!("{}{}", url.app, auth_query))),
            ("type", Amf0Value::string("nonprivate")),
            ("flashVer", Amf0Value::string(FLASH_VERSION)),
            ("swfUrl", Amf0Value::string(url.tc_url.clone())),
            ("tcUrl", Amf0Value::string(format!("{}{}", url.tc_url, auth_query))),
            ("objectEncoding", Amf0Value::Number(0.0)),
        ]);
        self.output.send(
            csid::OVER_CONNECTION,
            &message::command("connect", transaction, object, [], 0),
        )
    }

    fn send_publish_prelude(&mut self, stream: &str) -> TransportResult<()> {
        for name in ["releaseStream", "FCPublish"] {
            let transaction = self.transactions.begin(name);
            self.output.send(
                csid::OVER_STREAM,
                &message::command(name, transaction, Amf0Value::Null, [Amf0Value::string(stream)], 0),
            )?;
        }
        let transaction = self.transactions.begin("createStream");
        self.output.send(
            csid::OVER_CONNECTION,
            &message::command("createStream", transaction, Amf0Value::Null, [], 0),
        )
    }

    /// Drive `connect` → `createStream` → `publish` until publishing starts
    /// or the server asks for a reconnect with credentials.
    fn negotiate(
        &mut self,
        url: &RtmpUrl,
        auth: &AuthRound<'_>,
        state: &SharedState,
        events: &EventEmitter,
        timeout: Duration,
    ) -> TransportResult<Negotiated> {
        let deadline = Instant::now() + timeout;
        let mut stream_id = None;

        loop {
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout("publish negotiation".to_string()));
            }
            let Some(msg) = self.poll()? else { continue };
            let Some(msg) = self.handle_control(msg)? else { continue };
            let Some(command) = self.command(&msg)? else { continue };

            match command.name.as_str() {
                "_result" => match self.transactions.complete(command.transaction_id) {
                    Some("connect") => {
                        if !auth.query.is_empty() {
                            info!("Authentication accepted");
                            events.emit(ConnectEvent::AuthSuccess);
                        }
                        state.set(SessionState::ControlNegotiated);
                        self.send_publish_prelude(&url.stream)?;
                    }
                    Some("createStream") => {
                        let id = command.stream_id().ok_or_else(|| {
                            TransportError::Protocol("createStream result without a stream id".to_string())
                        })?;
                        debug!(stream_id = id, "Stream created");
                        self.output.send(
                            csid::OVER_STREAM,
                            &message::command(
                                "publish",
                                0,
                                Amf0Value::Null,
                                [Amf0Value::string(url.stream.as_str()), Amf0Value::string("live")],
                                id,
                            ),
                        )?;
                        stream_id = Some(id);
                    }
                    origin => trace!(?origin, "Result"),
                },
                "_error" => {
                    let description = command.description().unwrap_or_default().to_string();
                    match self.transactions.complete(command.transaction_id) {
                        Some("connect") => {
                            return match auth::handle_connect_error(
                                &description,
                                auth.credentials,
                                &url.app,
                                auth.responded,
                            ) {
                                AuthReply::Respond { query } => Ok(Negotiated::Reconnect {
                                    query,
                                    responded: true,
                                }),
                                AuthReply::RequestChallenge { query } => Ok(Negotiated::Reconnect {
                                    query,
                                    responded: false,
                                }),
                                AuthReply::Rejected => Err(TransportError::AuthenticationFailed(description)),
                            };
                        }
                        // Not every server implements these.
                        Some(origin @ ("releaseStream" | "FCPublish")) => {
                            debug!(origin, description = %description, "Ignoring error");
                        }
                        _ => return Err(TransportError::Protocol(description)),
                    }
                }
                "onStatus" => {
                    let code = command.code().unwrap_or_default();
                    match code {
                        "NetStream.Publish.Start" => {
                            let stream_id = stream_id.ok_or_else(|| {
                                TransportError::Protocol("publish started before createStream".to_string())
                            })?;
                            return Ok(Negotiated::Publishing { stream_id });
                        }
                        "NetConnection.Connect.Rejected" | "NetStream.Publish.BadName" => {
                            return Err(TransportError::Protocol(format!("onStatus: {code}")));
                        }
                        _ if command.level() == Some("error") => {
                            return Err(TransportError::Protocol(format!("onStatus: {code}")));
                        }
                        _ => debug!(code, "onStatus"),
                    }
                }
                other => trace!(command = other, "Ignoring server command"),
            }
        }
    }
}

/// Socket owner moved into the sender thread once publishing.
struct RtmpTransport {
    connection: Connection,
}

impl Transport for RtmpTransport {
    fn write_frame(&mut self, frame: &WireFrame) -> TransportResult<usize> {
        let mut stream = self.connection.output.stream.lock();
        stream.write_all(&frame.data)?;
        Ok(frame.len())
    }

    fn service(&mut self) -> TransportResult<()> {
        while let Some(msg) = self.connection.poll()? {
            let Some(msg) = self.connection.handle_control(msg)? else { continue };
            let Some(command) = self.connection.command(&msg)? else { continue };
            match command.name.as_str() {
                "_error" => {
                    return Err(TransportError::Protocol(
                        command.description().unwrap_or("_error").to_string(),
                    ));
                }
                "onStatus" if command.level() == Some("error") => {
                    return Err(TransportError::Protocol(format!(
                        "onStatus: {}",
                        command.code().unwrap_or_default()
                    )));
                }
                name => debug!(command = name, code = ?command.code(), "Server command while publishing"),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct Formats {
    video: Option<VideoFormat>,
    audio: Option<AudioFormat>,
}

struct Publication {
    output: Output,
    stream_id: u32,
    stream_name: String,
    audio: Option<AudioFormat>,
}

impl Publication {
    fn unpublish(&self) {
        let unpublish = message::command(
            "FCUnpublish",
            0,
            Amf0Value::Null,
            [Amf0Value::string(self.stream_name.as_str())],
            0,
        );
        let delete = message::command(
            "deleteStream",
            0,
            Amf0Value::Null,
            [Amf0Value::Number(self.stream_id as f64)],
            0,
        );
        let result = self
            .output
            .send(csid::OVER_CONNECTION, &unpublish)
            .and_then(|()| self.output.send(csid::OVER_CONNECTION, &delete));
        if let Err(e) = result {
            warn!(error = %e, "Failed to unpublish");
        }
    }
}

/// RTMP publisher.
pub struct RtmpClient {
    config: PublishConfig,
    events: EventEmitter,
    state: SharedState,
    sender: MediaSender,
    formats: Mutex<Formats>,
    publication: Mutex<Option<Publication>>,
}

impl RtmpClient {
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
        let url = RtmpUrl::parse(url)?;
        if url.scheme.is_tls() || url.scheme.is_tunneled() {
            return Err(TransportError::Connection(format!(
                "{} is not supported",
                url.scheme.as_str()
            )));
        }
        let Formats { video, audio } = self.formats.lock().clone();
        if let Some(video) = &video {
            if video.codec != VideoCodec::H264 {
                return Err(TransportError::Protocol(format!(
                    "{:?} cannot be published over RTMP",
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
        let mut query = String::new();
        let mut responded = false;

        for round in 0..MAX_AUTH_ROUNDS {
            self.state.set(SessionState::Handshaking);
            let mut connection = Connection::open(&url, &self.config)?;
            connection.send_connect(&url, &query)?;

            let auth = AuthRound {
                credentials: credentials.as_ref(),
                query: &query,
                responded,
            };
            match connection.negotiate(&url, &auth, &self.state, &self.events, timeout)? {
                Negotiated::Publishing { stream_id } => {
                    return self.begin_publishing(connection, &url, stream_id, video.as_ref(), audio);
                }
                Negotiated::Reconnect {
                    query: next,
                    responded: sent_response,
                } => {
                    info!(round, responded = sent_response, "Server requested authentication, reconnecting");
                    connection.output.shutdown();
                    query = next;
                    responded = sent_response;
                }
            }
        }

        Err(TransportError::AuthenticationFailed(
            "authentication did not complete".to_string(),
        ))
    }

    fn begin_publishing(
        &self,
        connection: Connection,
        url: &RtmpUrl,
        stream_id: u32,
        video: Option<&VideoFormat>,
        audio: Option<AudioFormat>,
    ) -> TransportResult<()> {
        let output = connection.output.clone();

        let metadata = message::data(
            &[
                Amf0Value::string("@setDataFrame"),
                Amf0Value::string("onMetaData"),
                flv::metadata(video, audio.as_ref()),
            ],
            stream_id,
        );
        output.send(csid::OVER_STREAM, &metadata)?;
        if let Some(video) = video {
            let header = flv::avc_sequence_header(video)?;
            output.send(
                csid::VIDEO,
                &RtmpMessage::new(MessageType::Video.id(), 0, stream_id, header),
            )?;
        }
        if let Some(audio) = &audio {
            let header = flv::aac_sequence_header(audio)?;
            output.send(
                csid::AUDIO,
                &RtmpMessage::new(MessageType::Audio.id(), 0, stream_id, header),
            )?;
        }

        connection.input.set_read_timeout(Some(SERVICE_READ_TIMEOUT))?;
        self.sender.start(
            Box::new(RtmpTransport { connection }),
            session::sender_failure(self.state.clone(), self.events.clone()),
        )?;

        *self.publication.lock() = Some(Publication {
            output,
            stream_id,
            stream_name: url.stream.clone(),
            audio,
        });
        self.state.set(SessionState::Publishing);
        self.events.emit(ConnectEvent::Connected);
        info!(stream_id, stream = %url.stream, "Publishing");
        Ok(())
    }
}

impl PublishSession for RtmpClient {
    fn protocol(&self) -> &'static str {
        "rtmp"
    }

    fn set_video_format(&self, format: VideoFormat) {
        self.formats.lock().video = Some(format);
    }

    fn set_audio_format(&self, format: AudioFormat) {
        self.formats.lock().audio = Some(format);
    }

    #[instrument(name = "rtmp_connect", skip(self))]
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
        let publication = self.publication.lock();
        let Some(publication) = publication.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        if !self.state.get().is_publishing() {
            return Err(TransportError::NotConnected);
        }

        let (chunk_stream, message_type, body) = match unit.kind {
            TrackKind::Video => match flv::avc_frame_tag(unit) {
                Some(body) => (csid::VIDEO, MessageType::Video, body),
                None => return Ok(()),
            },
            TrackKind::Audio => {
                let format = publication
                    .audio
                    .ok_or_else(|| TransportError::Protocol("audio format not set".to_string()))?;
                (csid::AUDIO, MessageType::Audio, flv::aac_frame_tag(&format, &unit.data))
            }
        };

        let msg = RtmpMessage::new(
            message_type.id(),
            unit.pts_ms() as u32,
            publication.stream_id,
            body,
        );
        let mut chunks = publication.output.chunks.lock();
        let bytes = chunks.write_message(chunk_stream, &msg);
        let result = self
            .sender
            .push(WireFrame::new(unit.kind, chunk_stream as u8, unit.pts_us, bytes));
        if result.is_err() {
            // The dropped message never reaches the wire, so the next one needs a full header.
            chunks.invalidate(chunk_stream);
        }
        result
    }

    #[instrument(name = "rtmp_stop", skip(self))]
    fn stop(&self) {
        let joined = self.sender.stop();

        if let Some(publication) = self.publication.lock().take() {
            if joined {
                let bounded = publication.output.socket.set_write_timeout(Some(GOODBYE_WRITE_TIMEOUT));
                if let Err(e) = bounded {
                    trace!(error = %e, "Socket write timeout");
                }
                publication.unpublish();
                publication.output.shutdown();
            } else {
                // The detached sender may still hold the stream lock mid-write.
                publication.output.abort();
            }
        }

        let previous = self.state.get();
        self.state.set(SessionState::Closed);
        if previous != SessionState::Idle {
            self.events.emit(ConnectEvent::Disconnected);
        }
        info!(joined, "RTMP session stopped");
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    fn sender(&self) -> &MediaSender {
        &self.sender
    }
}
