//! The per-session sender thread.
//!
//! A [`MediaSender`] owns the frame queue, the throughput estimator and the
//! single consumer thread that drains the queue into a [`Transport`]. The
//! producer (the encoder callback thread) only ever calls [`MediaSender::push`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use publisher_ipc::{EventEmitter, PublishConfig, StreamMetrics};
use publisher_media::TrackKind;
use tracing::{debug, info, warn};

use crate::bitrate::BitrateManager;
use crate::error::TransportError;
use crate::queue::{FrameQueue, WireFrame};
use crate::TransportResult;

/// How long the sender waits on an empty queue before checking for stop.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often the transport is given a chance to handle incoming control traffic.
const SERVICE_INTERVAL: Duration = Duration::from_millis(50);

/// Writes wire frames to the network.
///
/// Implemented by each protocol's socket owner and moved into the sender thread.
pub trait Transport: Send {
    /// Write one frame, returning the bytes put on the wire.
    fn write_frame(&mut self, frame: &WireFrame) -> TransportResult<usize>;

    /// Handle pending incoming control traffic without blocking for long.
    fn service(&mut self) -> TransportResult<()> {
        Ok(())
    }

    /// Release the socket.
    fn close(&mut self) {}
}

/// Per-track frame counters.
#[derive(Debug, Default)]
pub struct SenderStatistics {
    sent_video: AtomicU64,
    sent_audio: AtomicU64,
    dropped_video: AtomicU64,
    dropped_audio: AtomicU64,
}

impl SenderStatistics {
    fn record_sent(&self, track: TrackKind) {
        match track {
            TrackKind::Video => self.sent_video.fetch_add(1, Ordering::Relaxed),
            TrackKind::Audio => self.sent_audio.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn record_dropped(&self, track: TrackKind) -> u64 {
        let counter = match track {
            TrackKind::Video => &self.dropped_video,
            TrackKind::Audio => &self.dropped_audio,
        };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Video frames written.
    pub fn sent_video_frames(&self) -> u64 {
        self.sent_video.load(Ordering::Relaxed)
    }

    /// Audio frames written.
    pub fn sent_audio_frames(&self) -> u64 {
        self.sent_audio.load(Ordering::Relaxed)
    }

    /// Video frames dropped on a full queue.
    pub fn dropped_video_frames(&self) -> u64 {
        self.dropped_video.load(Ordering::Relaxed)
    }

    /// Audio frames dropped on a full queue.
    pub fn dropped_audio_frames(&self) -> u64 {
        self.dropped_audio.load(Ordering::Relaxed)
    }

    pub fn reset_sent_video_frames(&self) {
        self.sent_video.store(0, Ordering::Relaxed);
    }

    pub fn reset_sent_audio_frames(&self) {
        self.sent_audio.store(0, Ordering::Relaxed);
    }

    pub fn reset_dropped_video_frames(&self) {
        self.dropped_video.store(0, Ordering::Relaxed);
    }

    pub fn reset_dropped_audio_frames(&self) {
        self.dropped_audio.store(0, Ordering::Relaxed);
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

/// Frame queue plus the one consumer thread that drains it.
pub struct MediaSender {
    queue: Arc<FrameQueue>,
    stats: Arc<SenderStatistics>,
    bitrate: Arc<BitrateManager>,
    worker: Mutex<Option<Worker>>,
    join_timeout: Duration,
}

impl MediaSender {
    /// Create a stopped sender sized from `config`.
    pub fn new(config: &PublishConfig, events: EventEmitter) -> Self {
        Self {
            queue: Arc::new(FrameQueue::with_byte_limit(
                config.queue_capacity,
                config.queue_max_bytes,
            )),
            stats: Arc::new(SenderStatistics::default()),
            bitrate: Arc::new(BitrateManager::new(
                Duration::from_millis(config.bitrate_window_ms),
                config.bitrate_min_sample_bytes,
                events,
            )),
            worker: Mutex::new(None),
            join_timeout: Duration::from_millis(config.sender_join_timeout_ms),
        }
    }

    /// Enqueue a frame without blocking. A full queue drops the frame.
    pub fn push(&self, frame: WireFrame) -> TransportResult<()> {
        let track = frame.track;
        match self.queue.push(frame) {
            Err(TransportError::QueueFull) => {
                let dropped = self.stats.record_dropped(track);
                debug!(track = track.name(), dropped, "Frame queue full, dropping frame");
                Err(TransportError::QueueFull)
            }
            other => other,
        }
    }

    /// Enqueue the wire frames of one access unit, or drop all of them.
    pub fn push_all(&self, frames: Vec<WireFrame>) -> TransportResult<()> {
        let Some(track) = frames.first().map(|f| f.track) else {
            return Ok(());
        };
        let count = frames.len();
        match self.queue.push_all(frames) {
            Err(TransportError::QueueFull) => {
                let mut dropped = 0;
                for _ in 0..count {
                    dropped = self.stats.record_dropped(track);
                }
                debug!(track = track.name(), frames = count, dropped, "Frame queue full, dropping unit");
                Err(TransportError::QueueFull)
            }
            other => other,
        }
    }

    /// Spawn the sender thread over `transport`.
    ///
    /// `on_failure` runs on the sender thread if a write or control read fails
    /// before [`stop`](Self::stop) was requested.
    pub fn start<F>(&self, transport: Box<dyn Transport>, on_failure: F) -> TransportResult<()>
    where
        F: FnOnce(TransportError) + Send + 'static,
    {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        self.queue.open();
        self.bitrate.reset();

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let queue = Arc::clone(&self.queue);
        let stats = Arc::clone(&self.stats);
        let bitrate = Arc::clone(&self.bitrate);
        let thread_stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("media-sender".to_string())
            .spawn(move || {
                run_sender(transport, &queue, &stats, &bitrate, &thread_stop, on_failure);
                let _ = done_tx.send(());
            })?;

        info!("Sender thread started");
        *worker = Some(Worker {
            stop,
            done_rx,
            handle,
        });
        Ok(())
    }

    /// Interrupt the sender thread and wait up to the join timeout.
    ///
    /// Returns false if the thread had to be detached. The queue is cleared
    /// either way.
    pub fn stop(&self) -> bool {
        let worker = self.worker.lock().take();
        self.queue.close();

        let joined = match worker {
            None => true,
            Some(worker) => {
                worker.stop.store(true, Ordering::Release);
                match worker.done_rx.recv_timeout(self.join_timeout) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        let _ = worker.handle.join();
                        info!("Sender thread stopped");
                        true
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(
                            timeout_ms = self.join_timeout.as_millis() as u64,
                            "Sender thread did not stop in time, detaching"
                        );
                        false
                    }
                }
            }
        };

        self.queue.clear();
        joined
    }

    /// Returns true while the sender thread is running.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Frame counters.
    pub fn statistics(&self) -> &SenderStatistics {
        &self.stats
    }

    /// Throughput estimator.
    pub fn bitrate(&self) -> &BitrateManager {
        &self.bitrate
    }

    /// Bytes held by queued frames.
    pub fn bytes_in_cache(&self) -> usize {
        self.queue.queued_bytes()
    }

    /// Frames currently queued.
    pub fn items_in_cache(&self) -> usize {
        self.queue.len()
    }

    /// Queue capacity in frames.
    pub fn cache_size(&self) -> usize {
        self.queue.capacity()
    }

    /// Drop every queued frame.
    pub fn clear_cache(&self) {
        self.queue.clear();
    }

    /// Change the queue capacity.
    pub fn resize_cache(&self, capacity: usize) -> TransportResult<()> {
        self.queue.resize(capacity)
    }

    /// See [`FrameQueue::has_congestion`].
    pub fn has_congestion(&self, percent_used: u8) -> bool {
        self.queue.has_congestion(percent_used)
    }

    /// Snapshot of the counters.
    pub fn metrics(&self) -> StreamMetrics {
        StreamMetrics {
            sent_video_frames: self.stats.sent_video_frames(),
            sent_audio_frames: self.stats.sent_audio_frames(),
            dropped_video_frames: self.stats.dropped_video_frames(),
            dropped_audio_frames: self.stats.dropped_audio_frames(),
            items_in_cache: self.queue.len(),
            cache_size: self.queue.capacity(),
            bitrate_bps: self.bitrate.last_bitrate(),
        }
    }
}

impl Drop for MediaSender {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_sender<F>(
    mut transport: Box<dyn Transport>,
    queue: &FrameQueue,
    stats: &SenderStatistics,
    bitrate: &BitrateManager,
    stop: &AtomicBool,
    on_failure: F,
) where
    F: FnOnce(TransportError),
{
    let mut last_service = Instant::now();

    let result = loop {
        if stop.load(Ordering::Acquire) {
            break Ok(());
        }

        if let Some(frame) = queue.pop_timeout(POLL_INTERVAL) {
            match transport.write_frame(&frame) {
                Ok(written) => {
                    stats.record_sent(frame.track);
                    bitrate.record(written as u64);
                }
                Err(e) => break Err(e),
            }
        }

        if last_service.elapsed() >= SERVICE_INTERVAL {
            if let Err(e) = transport.service() {
                break Err(e);
            }
            last_service = Instant::now();
        }
    };

    transport.close();

    if let Err(e) = result {
        queue.close();
        if stop.load(Ordering::Acquire) {
            debug!(error = %e, "Sender error after stop requested");
        } else {
            warn!(error = %e, "Sender failed");
            on_failure(e);
        }
    }
}
