//! Sliding-window throughput estimator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use publisher_ipc::{ConnectEvent, EventEmitter};
use tracing::trace;

#[derive(Debug)]
struct Window {
    bytes: u64,
    start: Instant,
}

/// Accumulates bytes written and emits a `NewBitrate` event once per window.
///
/// The sender thread records; any thread may read or reset.
#[derive(Debug)]
pub struct BitrateManager {
    window: Mutex<Window>,
    length: Duration,
    min_sample_bytes: u64,
    last_bps: AtomicU64,
    events: EventEmitter,
}

impl BitrateManager {
    /// Create an estimator with the given window length and noise floor.
    pub fn new(length: Duration, min_sample_bytes: u64, events: EventEmitter) -> Self {
        Self {
            window: Mutex::new(Window {
                bytes: 0,
                start: Instant::now(),
            }),
            length,
            min_sample_bytes,
            last_bps: AtomicU64::new(0),
            events,
        }
    }

    /// Record `bytes` written now. Returns the estimate if a window closed.
    pub fn record(&self, bytes: u64) -> Option<u64> {
        self.record_at(bytes, Instant::now())
    }

    fn record_at(&self, bytes: u64, now: Instant) -> Option<u64> {
        if bytes < self.min_sample_bytes {
            return None;
        }

        let bps = {
            let mut window = self.window.lock();
            window.bytes += bytes;
            let elapsed = now.saturating_duration_since(window.start);
            if elapsed < self.length {
                return None;
            }
            let elapsed_ms = (elapsed.as_millis() as u64).max(1);
            let bps = window.bytes * 8 * 1000 / elapsed_ms;
            window.bytes = 0;
            window.start = now;
            bps
        };

        trace!(bits_per_second = bps, "Bitrate window closed");
        self.last_bps.store(bps, Ordering::Relaxed);
        self.events.emit(ConnectEvent::NewBitrate {
            bits_per_second: bps,
        });
        Some(bps)
    }

    /// Restart the window and forget accumulated bytes.
    pub fn reset(&self) {
        self.reset_at(Instant::now());
    }

    fn reset_at(&self, now: Instant) {
        let mut window = self.window.lock();
        window.bytes = 0;
        window.start = now;
        self.last_bps.store(0, Ordering::Relaxed);
    }

    /// Most recent estimate in bits per second.
    pub fn last_bitrate(&self) -> u64 {
        self.last_bps.load(Ordering::Relaxed)
    }
}
