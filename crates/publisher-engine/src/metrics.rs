//! Client-side metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use publisher_ipc::StreamMetrics;
use publisher_media::TrackKind;

/// Queue fill level, in percent, at which congestion is reported.
pub const CONGESTION_PERCENT: u8 = 80;

/// Warnings derived from a metrics snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsWarning {
    /// The frame queue is filling up faster than the network drains it.
    NetworkCongestion { items_in_cache: usize, cache_size: usize },

    /// Frames were dropped because the queue was full.
    FramesDropped { dropped: u64 },

    /// The recording container reported write errors.
    RecordErrors { errors: u64 },
}

/// Snapshot of everything the client knows about its stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientMetrics {
    /// Counters of the active session, zero when there is none.
    pub stream: StreamMetrics,

    /// Video access units handed to the client.
    pub video_units: u64,

    /// Audio access units handed to the client.
    pub audio_units: u64,

    /// Samples written to the recording.
    pub recorded_samples: u64,

    /// Recording write errors.
    pub record_errors: u64,

    /// Seconds since the current session started publishing.
    pub uptime_seconds: u64,
}

/// Collects client counters.
pub struct MetricsCollector {
    start_time: RwLock<Option<Instant>>,
    video_units: AtomicU64,
    audio_units: AtomicU64,
    record_errors: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: RwLock::new(None),
            video_units: AtomicU64::new(0),
            audio_units: AtomicU64::new(0),
            record_errors: AtomicU64::new(0),
        }
    }

    /// Start the uptime clock.
    pub fn start(&self) {
        *self.start_time.write() = Some(Instant::now());
    }

    /// Stop the uptime clock.
    pub fn stop(&self) {
        *self.start_time.write() = None;
    }

    pub fn record_unit(&self, kind: TrackKind) {
        let counter = match kind {
            TrackKind::Video => &self.video_units,
            TrackKind::Audio => &self.audio_units,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.record_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset all counters.
    pub fn reset(&self) {
        self.video_units.store(0, Ordering::Relaxed);
        self.audio_units.store(0, Ordering::Relaxed);
        self.record_errors.store(0, Ordering::Relaxed);
    }

    /// Merge the client counters with the session's and the recorder's.
    pub fn snapshot(&self, stream: Option<StreamMetrics>, recorded_samples: u64) -> ClientMetrics {
        let uptime_seconds = self
            .start_time
            .read()
            .map(|s| s.elapsed().as_secs())
            .unwrap_or(0);

        ClientMetrics {
            stream: stream.unwrap_or_default(),
            video_units: self.video_units.load(Ordering::Relaxed),
            audio_units: self.audio_units.load(Ordering::Relaxed),
            recorded_samples,
            record_errors: self.record_errors.load(Ordering::Relaxed),
            uptime_seconds,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a snapshot for conditions worth surfacing to the user.
pub fn check_warnings(metrics: &ClientMetrics) -> Vec<MetricsWarning> {
    let mut warnings = Vec::new();

    let stream = &metrics.stream;
    if stream.cache_size > 0
        && stream.items_in_cache * 100 >= stream.cache_size * CONGESTION_PERCENT as usize
    {
        warnings.push(MetricsWarning::NetworkCongestion {
            items_in_cache: stream.items_in_cache,
            cache_size: stream.cache_size,
        });
    }

    let dropped = stream.dropped_video_frames + stream.dropped_audio_frames;
    if dropped > 0 {
        warnings.push(MetricsWarning::FramesDropped { dropped });
    }

    if metrics.record_errors > 0 {
        warnings.push(MetricsWarning::RecordErrors {
            errors: metrics.record_errors,
        });
    }

    warnings
}
