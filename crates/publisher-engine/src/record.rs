//! Local recording of the published access units.
//!
//! The controller is fed from the same thread that hands access units to
//! the session. Nothing is muxed before the first key frame when a video
//! track exists; timestamps are rebased onto the recording start and the
//! time spent paused is cut out of the timeline.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use publisher_ipc::{EventEmitter, RecordConfig, RecordEvent, RecordState};
use publisher_media::flv::{self, TagType};
use publisher_media::mpegts::TsMuxer;
use publisher_media::{nal, AccessUnit, AudioFormat, TrackKind, VideoFormat};

use crate::error::{RecordError, RecordResult};

/// A container the recorder can write samples into.
pub trait Muxer: Send {
    /// Write one sample at `timestamp_us` from the recording start.
    fn write_sample(&mut self, unit: &AccessUnit, timestamp_us: u64) -> RecordResult<()>;

    /// Flush buffered data and close the container.
    fn finish(&mut self) -> RecordResult<()>;
}

/// FLV file muxer.
///
/// The file header, an `onMetaData` script tag and the AVC/AAC sequence
/// headers are written when the muxer is created.
pub struct FlvMuxer<W: Write> {
    out: W,
    audio: Option<AudioFormat>,
}

impl<W: Write> FlvMuxer<W> {
    pub fn create(
        mut out: W,
        video: Option<&VideoFormat>,
        audio: Option<&AudioFormat>,
    ) -> RecordResult<Self> {
        out.write_all(&flv::file_header(video.is_some(), audio.is_some()))?;

        let metadata = flv::metadata_body(&flv::metadata(video, audio));
        out.write_all(&flv::build_tag(TagType::Script, 0, &metadata))?;

        if let Some(video) = video {
            let header = flv::avc_sequence_header(video)?;
            out.write_all(&flv::build_tag(TagType::Video, 0, &header))?;
        }
        if let Some(audio) = audio {
            let header = flv::aac_sequence_header(audio)?;
            out.write_all(&flv::build_tag(TagType::Audio, 0, &header))?;
        }

        Ok(Self {
            out,
            audio: audio.copied(),
        })
    }
}

impl<W: Write + Send> Muxer for FlvMuxer<W> {
    fn write_sample(&mut self, unit: &AccessUnit, timestamp_us: u64) -> RecordResult<()> {
        // FLV timestamps are 32-bit milliseconds and wrap.
        let timestamp_ms = (timestamp_us / 1000) as u32;
        let tag = match unit.kind {
            TrackKind::Video => match flv::avc_frame_tag(unit) {
                Some(body) => flv::build_tag(TagType::Video, timestamp_ms, &body),
                None => return Ok(()),
            },
            TrackKind::Audio => {
                let format = self
                    .audio
                    .as_ref()
                    .ok_or_else(|| RecordError::MissingFormat("audio".to_string()))?;
                let body = flv::aac_frame_tag(format, &unit.data);
                flv::build_tag(TagType::Audio, timestamp_ms, &body)
            }
        };
        self.out.write_all(&tag)?;
        Ok(())
    }

    fn finish(&mut self) -> RecordResult<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// MPEG-TS file muxer. Carries H265 as well as H264.
pub struct TsFileMuxer<W: Write> {
    out: W,
    muxer: TsMuxer,
}

impl<W: Write> TsFileMuxer<W> {
    pub fn create(out: W, video: Option<&VideoFormat>, audio: Option<&AudioFormat>) -> Self {
        Self {
            out,
            muxer: TsMuxer::new(video.cloned(), audio.copied()),
        }
    }
}

impl<W: Write + Send> Muxer for TsFileMuxer<W> {
    fn write_sample(&mut self, unit: &AccessUnit, timestamp_us: u64) -> RecordResult<()> {
        let rebased = AccessUnit {
            pts_us: timestamp_us,
            ..unit.clone()
        };
        let packets = self.muxer.write_unit(&rebased)?;
        self.out.write_all(&packets)?;
        Ok(())
    }

    fn finish(&mut self) -> RecordResult<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Container format of a recording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordContainer {
    #[default]
    Flv,
    MpegTs,
}

impl RecordContainer {
    /// Container implied by a file extension; FLV unless `.ts`/`.m2ts`.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("ts") || ext.eq_ignore_ascii_case("m2ts") => {
                Self::MpegTs
            }
            _ => Self::Flv,
        }
    }
}

/// Where a recording is written.
pub enum RecordTarget {
    /// A file created (or truncated) at the path.
    Path(PathBuf),

    /// An already open writer, such as a caller-owned file descriptor.
    Writer {
        writer: Box<dyn Write + Send>,
        container: RecordContainer,
    },
}

impl RecordTarget {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn writer(writer: impl Write + Send + 'static, container: RecordContainer) -> Self {
        Self::Writer {
            writer: Box::new(writer),
            container,
        }
    }

    fn open(
        self,
        video: Option<&VideoFormat>,
        audio: Option<&AudioFormat>,
    ) -> RecordResult<Box<dyn Muxer>> {
        let (writer, container): (Box<dyn Write + Send>, _) = match self {
            Self::Path(path) => {
                let container = RecordContainer::from_path(&path);
                let file = File::create(&path)?;
                debug!(path = %path.display(), ?container, "Created recording file");
                (Box::new(BufWriter::new(file)), container)
            }
            Self::Writer { writer, container } => (writer, container),
        };

        let muxer: Box<dyn Muxer> = match container {
            RecordContainer::Flv => Box::new(FlvMuxer::create(writer, video, audio)?),
            RecordContainer::MpegTs => Box::new(TsFileMuxer::create(writer, video, audio)),
        };
        Ok(muxer)
    }
}

impl From<&RecordConfig> for RecordTarget {
    fn from(config: &RecordConfig) -> Self {
        Self::path(&config.path)
    }
}

impl std::fmt::Debug for RecordTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Writer { container, .. } => f
                .debug_struct("Writer")
                .field("container", container)
                .finish_non_exhaustive(),
        }
    }
}

struct Inner {
    state: RecordState,
    video: Option<VideoFormat>,
    audio: Option<AudioFormat>,
    muxer: Option<Box<dyn Muxer>>,
    start_pts_us: Option<u64>,
    pause_started_us: Option<u64>,
    paused_total_us: u64,
    samples: u64,
}

impl Inner {
    /// Whether `unit` may open the recording or follow a pause.
    fn is_start_sample(&self, unit: &AccessUnit) -> bool {
        match &self.video {
            Some(video) => {
                unit.kind == TrackKind::Video && nal::is_key_frame(video.codec, &unit.data)
            }
            None => true,
        }
    }

    fn rebase(&self, pts_us: u64) -> u64 {
        let start = self.start_pts_us.unwrap_or(pts_us);
        pts_us
            .saturating_sub(start)
            .saturating_sub(self.paused_total_us)
    }

    fn reset_timeline(&mut self) {
        self.start_pts_us = None;
        self.pause_started_us = None;
        self.paused_total_us = 0;
        self.samples = 0;
    }
}

/// Records the access unit stream into a local container.
///
/// Sample delivery and the pause/resume/stop calls may come from different
/// threads; a single lock serialises them.
pub struct RecordController {
    inner: Mutex<Inner>,
    events: EventEmitter<RecordEvent>,
    clock: Instant,
}

impl RecordController {
    pub fn new(events: EventEmitter<RecordEvent>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: RecordState::Stopped,
                video: None,
                audio: None,
                muxer: None,
                start_pts_us: None,
                pause_started_us: None,
                paused_total_us: 0,
                samples: 0,
            }),
            events,
            clock: Instant::now(),
        }
    }

    /// Set the video track format used for the next recording.
    pub fn set_video_format(&self, format: VideoFormat) {
        self.inner.lock().video = Some(format);
    }

    /// Set the audio track format used for the next recording.
    pub fn set_audio_format(&self, format: AudioFormat) {
        self.inner.lock().audio = Some(format);
    }

    /// Current record state.
    pub fn state(&self) -> RecordState {
        self.inner.lock().state
    }

    /// Samples written since the recording started.
    pub fn samples_written(&self) -> u64 {
        self.inner.lock().samples
    }

    /// Open `target` and wait for the first key frame.
    #[instrument(name = "start_record", skip(self))]
    pub fn start_record(&self, target: RecordTarget) -> RecordResult<()> {
        let mut inner = self.inner.lock();
        ensure_state(&inner, "start recording", &[RecordState::Stopped])?;
        if inner.video.is_none() && inner.audio.is_none() {
            return Err(RecordError::MissingFormat(
                "no track format has been set".to_string(),
            ));
        }

        let muxer = target
            .open(inner.video.as_ref(), inner.audio.as_ref())
            .inspect_err(|e| self.report_error(e))?;
        self.begin(&mut inner, muxer);
        Ok(())
    }

    /// Start recording into a caller-provided container.
    pub fn start_with_muxer(&self, muxer: Box<dyn Muxer>) -> RecordResult<()> {
        let mut inner = self.inner.lock();
        ensure_state(&inner, "start recording", &[RecordState::Stopped])?;
        self.begin(&mut inner, muxer);
        Ok(())
    }

    fn begin(&self, inner: &mut Inner, muxer: Box<dyn Muxer>) {
        inner.muxer = Some(muxer);
        inner.reset_timeline();
        self.transition_to(inner, RecordState::Started);
        info!("Recording started, waiting for the first key frame");
    }

    /// Deliver one access unit.
    ///
    /// With a video track, nothing is muxed after start or resume until a
    /// key frame arrives.
    ///
    /// A container write failure is reported as a [`RecordEvent::Error`] and
    /// returned; the record state is left unchanged.
    pub fn write(&self, unit: &AccessUnit) -> RecordResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            RecordState::Stopped | RecordState::Paused => return Ok(()),
            RecordState::Started => {
                if !inner.is_start_sample(unit) {
                    trace!(kind = unit.kind.name(), "Waiting for key frame");
                    return Ok(());
                }
                inner.start_pts_us = Some(unit.pts_us);
                self.transition_to(&mut inner, RecordState::Recording);
            }
            RecordState::Resumed => {
                // Frames before the pause are gone, so video restarts on a key frame.
                if !inner.is_start_sample(unit) {
                    trace!(kind = unit.kind.name(), "Waiting for key frame after resume");
                    return Ok(());
                }
                self.transition_to(&mut inner, RecordState::Recording);
            }
            RecordState::Recording => {}
        }

        let timestamp_us = inner.rebase(unit.pts_us);
        let Some(muxer) = inner.muxer.as_mut() else {
            return Ok(());
        };
        if let Err(e) = muxer.write_sample(unit, timestamp_us) {
            self.report_error(&e);
            return Err(e);
        }
        inner.samples += 1;
        Ok(())
    }

    /// Pause at the controller's own clock.
    pub fn pause_record(&self) -> RecordResult<()> {
        self.pause_at(self.now_us())
    }

    /// Resume at the controller's own clock.
    pub fn resume_record(&self) -> RecordResult<()> {
        self.resume_at(self.now_us())
    }

    /// Pause at `time_us`. Samples are discarded until resumed.
    pub fn pause_at(&self, time_us: u64) -> RecordResult<()> {
        let mut inner = self.inner.lock();
        ensure_state(
            &inner,
            "pause recording",
            &[RecordState::Recording, RecordState::Resumed],
        )?;
        inner.pause_started_us = Some(time_us);
        self.transition_to(&mut inner, RecordState::Paused);
        Ok(())
    }

    /// Resume at `time_us`. The paused span is removed from later timestamps.
    pub fn resume_at(&self, time_us: u64) -> RecordResult<()> {
        let mut inner = self.inner.lock();
        ensure_state(&inner, "resume recording", &[RecordState::Paused])?;
        if let Some(paused_at) = inner.pause_started_us.take() {
            let paused = time_us.saturating_sub(paused_at);
            inner.paused_total_us += paused;
            debug!(
                paused_us = paused,
                total_us = inner.paused_total_us,
                "Recording resumed"
            );
        }
        self.transition_to(&mut inner, RecordState::Resumed);
        Ok(())
    }

    /// Flush and close the container. Stopping an idle controller is a no-op.
    #[instrument(name = "stop_record", skip(self))]
    pub fn stop_record(&self) -> RecordResult<()> {
        let mut inner = self.inner.lock();
        if inner.state == RecordState::Stopped {
            return Ok(());
        }

        let result = match inner.muxer.take() {
            Some(mut muxer) => muxer.finish(),
            None => Ok(()),
        };
        let samples = inner.samples;
        inner.reset_timeline();
        self.transition_to(&mut inner, RecordState::Stopped);
        info!(samples, "Recording stopped");

        result.inspect_err(|e| self.report_error(e))
    }

    fn transition_to(&self, inner: &mut Inner, state: RecordState) {
        let previous = std::mem::replace(&mut inner.state, state);
        debug!(
            previous = previous.name(),
            current = state.name(),
            "Record state transition"
        );
        self.events.emit(RecordEvent::StatusChanged(state));
    }

    fn report_error(&self, error: &RecordError) {
        warn!(error = %error, "Recording error");
        self.events.emit(RecordEvent::Error {
            message: error.to_string(),
        });
    }

    fn now_us(&self) -> u64 {
        self.clock.elapsed().as_micros() as u64
    }
}

impl Drop for RecordController {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(mut muxer) = inner.muxer.take() {
            if let Err(e) = muxer.finish() {
                warn!(error = %e, "Failed to finish recording on drop");
            }
        }
    }
}

fn ensure_state(inner: &Inner, operation: &'static str, allowed: &[RecordState]) -> RecordResult<()> {
    if allowed.contains(&inner.state) {
        Ok(())
    } else {
        Err(RecordError::InvalidState {
            operation,
            state: inner.state.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;
    use crossbeam_channel::Receiver;

    use super::*;

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1E, 0xAB];
    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];

    fn video_format() -> VideoFormat {
        VideoFormat::h264(
            640,
            360,
            30,
            Bytes::from_static(SPS),
            Bytes::from_static(PPS),
        )
    }

    fn idr(pts_us: u64) -> AccessUnit {
        AccessUnit::video(vec![0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84], pts_us, true)
    }

    fn non_idr(pts_us: u64) -> AccessUnit {
        AccessUnit::video(vec![0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x02], pts_us, false)
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<parking_lot::Mutex<Vec<(TrackKind, u64)>>>);

    impl Muxer for Captured {
        fn write_sample(&mut self, unit: &AccessUnit, timestamp_us: u64) -> RecordResult<()> {
            self.0.lock().push((unit.kind, timestamp_us));
            Ok(())
        }

        fn finish(&mut self) -> RecordResult<()> {
            Ok(())
        }
    }

    impl Captured {
        fn timestamps(&self) -> Vec<u64> {
            self.0.lock().iter().map(|(_, ts)| *ts).collect()
        }
    }

    /// Accepts writes until `fail` is set.
    #[derive(Clone, Default)]
    struct SwitchableWriter {
        fail: Arc<AtomicBool>,
    }

    impl Write for SwitchableWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn controller() -> (RecordController, Receiver<RecordEvent>) {
        let (tx, rx) = publisher_ipc::record_event_channel();
        let controller = RecordController::new(EventEmitter::new(tx));
        controller.set_video_format(video_format());
        controller.set_audio_format(AudioFormat::aac(44100, 2));
        (controller, rx)
    }

    #[test]
    fn test_nothing_is_muxed_before_key_frame() {
        let (controller, rx) = controller();
        let muxer = Captured::default();
        controller.start_with_muxer(Box::new(muxer.clone())).unwrap();
        assert_eq!(controller.state(), RecordState::Started);

        controller.write(&non_idr(10_000)).unwrap();
        controller.write(&AccessUnit::audio(vec![0x21, 0x10], 15_000)).unwrap();
        assert!(muxer.timestamps().is_empty());
        assert_eq!(controller.state(), RecordState::Started);

        controller.write(&idr(40_000)).unwrap();
        controller.write(&AccessUnit::audio(vec![0x21, 0x10], 45_000)).unwrap();
        controller.write(&non_idr(73_000)).unwrap();

        assert_eq!(controller.state(), RecordState::Recording);
        assert_eq!(muxer.timestamps(), vec![0, 5_000, 33_000]);
        assert_eq!(controller.samples_written(), 3);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                RecordEvent::StatusChanged(RecordState::Started),
                RecordEvent::StatusChanged(RecordState::Recording),
            ]
        );
    }

    #[test]
    fn test_key_frame_flag_alone_does_not_open_recording() {
        let (controller, _rx) = controller();
        let muxer = Captured::default();
        controller.start_with_muxer(Box::new(muxer.clone())).unwrap();

        // Flagged as key frame but the payload is a non-IDR slice.
        let mislabelled = AccessUnit::video(vec![0x00, 0x00, 0x01, 0x41, 0x9A], 0, true);
        controller.write(&mislabelled).unwrap();
        assert_eq!(controller.state(), RecordState::Started);
        assert!(muxer.timestamps().is_empty());
    }

    #[test]
    fn test_audio_only_starts_on_first_sample() {
        let (tx, _rx) = publisher_ipc::record_event_channel();
        let controller = RecordController::new(EventEmitter::new(tx));
        controller.set_audio_format(AudioFormat::aac(48000, 1));
        let muxer = Captured::default();
        controller.start_with_muxer(Box::new(muxer.clone())).unwrap();

        controller.write(&AccessUnit::audio(vec![1, 2], 500_000)).unwrap();
        controller.write(&AccessUnit::audio(vec![1, 2], 521_333)).unwrap();
        assert_eq!(muxer.timestamps(), vec![0, 21_333]);
    }

    #[test]
    fn test_pause_removes_paused_span() {
        let (controller, _rx) = controller();
        let muxer = Captured::default();
        controller.start_with_muxer(Box::new(muxer.clone())).unwrap();

        let t0 = 1_000_000;
        controller.write(&idr(t0)).unwrap();
        controller.pause_at(1_100_000).unwrap();
        controller.write(&non_idr(1_500_000)).unwrap();
        controller.write(&non_idr(2_500_000)).unwrap();
        let delta = 2_000_000;
        controller.resume_at(1_100_000 + delta).unwrap();
        assert_eq!(controller.state(), RecordState::Resumed);

        controller.write(&non_idr(3_100_000)).unwrap();
        controller.write(&AccessUnit::audio(vec![0x21, 0x10], 3_110_000)).unwrap();
        assert_eq!(controller.state(), RecordState::Resumed);

        let t1 = 3_133_000;
        controller.write(&idr(t1)).unwrap();
        assert_eq!(controller.state(), RecordState::Recording);

        let out = muxer.timestamps();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1] - out[0], (t1 - t0) - delta);
    }

    #[test]
    fn test_rebased_timestamps_never_negative() {
        let (controller, _rx) = controller();
        let muxer = Captured::default();
        controller.start_with_muxer(Box::new(muxer.clone())).unwrap();

        controller.write(&idr(5_000_000)).unwrap();
        controller.pause_at(5_000_000).unwrap();
        // Pause reported longer than the media gap.
        controller.resume_at(9_000_000).unwrap();
        controller.write(&idr(5_100_000)).unwrap();
        // Audio slightly older than the opening key frame.
        controller.write(&AccessUnit::audio(vec![1], 4_990_000)).unwrap();

        assert_eq!(muxer.timestamps(), vec![0, 0, 0]);
    }

    #[test]
    fn test_invalid_transitions() {
        let (controller, _rx) = controller();
        assert!(matches!(
            controller.pause_record(),
            Err(RecordError::InvalidState { .. })
        ));
        assert!(controller.resume_record().is_err());
        assert!(controller.stop_record().is_ok());

        controller
            .start_with_muxer(Box::new(Captured::default()))
            .unwrap();
        // Still waiting for the key frame.
        assert!(controller.pause_record().is_err());
        assert!(controller
            .start_with_muxer(Box::new(Captured::default()))
            .is_err());

        controller.write(&idr(0)).unwrap();
        controller.pause_record().unwrap();
        assert!(controller.pause_record().is_err());
        controller.resume_record().unwrap();
        controller.pause_record().unwrap();
        controller.stop_record().unwrap();
        assert_eq!(controller.state(), RecordState::Stopped);
    }

    #[test]
    fn test_start_requires_a_format() {
        let (tx, _rx) = publisher_ipc::record_event_channel();
        let controller = RecordController::new(EventEmitter::new(tx));
        let result = controller.start_record(RecordTarget::writer(io::sink(), RecordContainer::Flv));
        assert!(matches!(result, Err(RecordError::MissingFormat(_))));
        assert_eq!(controller.state(), RecordState::Stopped);
    }

    #[test]
    fn test_write_error_is_reported_and_state_kept() {
        let (controller, rx) = controller();
        let writer = SwitchableWriter::default();
        let fail = Arc::clone(&writer.fail);
        controller
            .start_record(RecordTarget::writer(writer, RecordContainer::Flv))
            .unwrap();
        controller.write(&idr(0)).unwrap();

        fail.store(true, Ordering::SeqCst);
        let result = controller.write(&non_idr(33_000));
        assert!(matches!(result, Err(RecordError::Io(_))));
        assert_eq!(controller.state(), RecordState::Recording);

        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(events.last(), Some(RecordEvent::Error { .. })));

        fail.store(false, Ordering::SeqCst);
        controller.write(&non_idr(66_000)).unwrap();
        controller.stop_record().unwrap();
    }

    #[test]
    fn test_flv_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.flv");
        let (controller, _rx) = controller();

        controller.start_record(RecordTarget::path(&path)).unwrap();
        controller.write(&idr(2_000_000)).unwrap();
        controller.write(&non_idr(2_033_000)).unwrap();
        controller.stop_record().unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[..3], b"FLV");
        assert_eq!(data[4], 0x05);
        assert_eq!(&data[9..13], &[0, 0, 0, 0]);
        // First tag after the header is onMetaData.
        assert_eq!(data[13], TagType::Script as u8);

        // Walk the tags and collect (type, timestamp).
        let mut tags = Vec::new();
        let mut pos = 13;
        while pos + 11 <= data.len() {
            let size = u32::from_be_bytes([0, data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
            let ts = u32::from_be_bytes([data[pos + 7], data[pos + 4], data[pos + 5], data[pos + 6]]);
            let prev = &data[pos + 11 + size..pos + 15 + size];
            assert_eq!(u32::from_be_bytes(prev.try_into().unwrap()) as usize, 11 + size);
            tags.push((data[pos], ts));
            pos += 15 + size;
        }
        assert_eq!(pos, data.len());
        assert_eq!(
            tags,
            vec![(0x12, 0), (9, 0), (8, 0), (9, 0), (9, 33)]
        );
    }

    #[test]
    fn test_ts_container_from_extension() {
        assert_eq!(
            RecordContainer::from_path(Path::new("/tmp/a.TS")),
            RecordContainer::MpegTs
        );
        assert_eq!(
            RecordContainer::from_path(Path::new("/tmp/a.flv")),
            RecordContainer::Flv
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.ts");
        let (controller, _rx) = controller();
        controller
            .start_record(RecordTarget::from(&RecordConfig {
                path: path.to_string_lossy().into_owned(),
            }))
            .unwrap();
        controller.write(&idr(0)).unwrap();
        controller.stop_record().unwrap();

        let data = std::fs::read(&path).unwrap();
        assert!(!data.is_empty());
        assert_eq!(data.len() % 188, 0);
        assert_eq!(data[0], 0x47);
    }
}
