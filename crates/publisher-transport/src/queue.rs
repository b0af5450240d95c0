//! Bounded frame queue between the packetizing producer and the sender thread.
//!
//! `push` never blocks: when the queue is full, by frame count or by queued
//! bytes, the newest frame is rejected and the producer carries on. `pop_timeout` blocks the consumer until a
//! frame arrives. Frames come out in the order they were accepted.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;
use publisher_media::TrackKind;
use tracing::debug;

use crate::error::TransportError;
use crate::TransportResult;

/// A ready-to-send protocol unit: one RTMP message in chunks, one RTP/RTCP
/// packet, or one SRT payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    /// Track the frame was produced from.
    pub track: TrackKind,

    /// Transport channel: RTMP chunk stream id, RTSP interleaved channel, or 0.
    pub channel: u8,

    /// Presentation timestamp of the source access unit in microseconds.
    pub pts_us: u64,

    /// Bytes to write.
    pub data: Bytes,
}

impl WireFrame {
    /// Create a wire frame.
    pub fn new(track: TrackKind, channel: u8, pts_us: u64, data: impl Into<Bytes>) -> Self {
        Self {
            track,
            channel,
            pts_us,
            data: data.into(),
        }
    }

    /// Frame length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the frame carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

struct Channel {
    tx: Sender<WireFrame>,
    rx: Receiver<WireFrame>,
    capacity: usize,
}

impl Channel {
    fn bounded(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx, capacity }
    }
}

/// Single-producer, single-consumer bounded FIFO of wire frames.
///
/// Bounded twice: by frame count, which callers can resize, and by the bytes
/// the queued frames hold. A frame larger than the byte limit is still
/// accepted into an empty queue.
pub struct FrameQueue {
    channel: RwLock<Channel>,
    queued_bytes: AtomicUsize,
    max_bytes: usize,
    closed: AtomicBool,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames of any size.
    pub fn new(capacity: usize) -> Self {
        Self::with_byte_limit(capacity, usize::MAX)
    }

    /// Create a queue holding at most `capacity` frames and about `max_bytes` bytes.
    pub fn with_byte_limit(capacity: usize, max_bytes: usize) -> Self {
        Self {
            channel: RwLock::new(Channel::bounded(capacity)),
            queued_bytes: AtomicUsize::new(0),
            max_bytes: max_bytes.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a frame without blocking.
    ///
    /// Fails with [`TransportError::QueueFull`] when at capacity (the frame is
    /// dropped) and with [`TransportError::QueueClosed`] after [`close`](Self::close).
    pub fn push(&self, frame: WireFrame) -> TransportResult<()> {
        let channel = self.channel.read();
        self.reserve(&channel, 1, frame.len())?;
        self.send(&channel, frame)
    }

    /// Enqueue every frame of `frames`, or none of them.
    ///
    /// Used for the fragments of one access unit so a full queue never keeps a
    /// unit's head while dropping its tail.
    pub fn push_all(&self, frames: Vec<WireFrame>) -> TransportResult<()> {
        let channel = self.channel.read();
        let bytes = frames.iter().map(WireFrame::len).sum();
        self.reserve(&channel, frames.len(), bytes)?;
        // Only this producer adds frames, so the reserved room cannot shrink.
        frames
            .into_iter()
            .try_for_each(|frame| self.send(&channel, frame))
    }

    fn reserve(&self, channel: &Channel, count: usize, bytes: usize) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::QueueClosed);
        }
        if channel.rx.len() + count > channel.capacity {
            return Err(TransportError::QueueFull);
        }
        let queued = self.queued_bytes.load(Ordering::Acquire);
        if queued > 0 && queued.saturating_add(bytes) > self.max_bytes {
            return Err(TransportError::QueueFull);
        }
        Ok(())
    }

    fn send(&self, channel: &Channel, frame: WireFrame) -> TransportResult<()> {
        let len = frame.len();
        // Counted before the send so the consumer never subtracts first.
        self.queued_bytes.fetch_add(len, Ordering::AcqRel);
        channel.tx.try_send(frame).map_err(|e| {
            self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
            match e {
                TrySendError::Full(_) => TransportError::QueueFull,
                TrySendError::Disconnected(_) => TransportError::QueueClosed,
            }
        })
    }

    /// Dequeue the oldest frame, waiting up to `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<WireFrame> {
        // Wait on a cloned receiver so `resize` can take the write lock meanwhile.
        let rx = self.channel.read().rx.clone();
        match rx.recv_timeout(timeout) {
            Ok(frame) => {
                self.queued_bytes.fetch_sub(frame.len(), Ordering::AcqRel);
                Some(frame)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Bytes held by queued frames.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Acquire)
    }

    /// Byte limit.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Frames currently queued.
    pub fn len(&self) -> usize {
        self.channel.read().rx.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum frames held.
    pub fn capacity(&self) -> usize {
        self.channel.read().capacity
    }

    /// Drop every queued frame, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let channel = self.channel.read();
        let discarded = channel
            .rx
            .try_iter()
            .map(|frame| self.queued_bytes.fetch_sub(frame.len(), Ordering::AcqRel))
            .count();
        if discarded > 0 {
            debug!(discarded, "Cleared frame queue");
        }
        discarded
    }

    /// Change the capacity, keeping queued frames in order.
    ///
    /// Fails if more frames are queued than the new capacity can hold.
    pub fn resize(&self, capacity: usize) -> TransportResult<()> {
        let mut channel = self.channel.write();
        let queued = channel.rx.len();
        if queued > capacity {
            return Err(TransportError::Protocol(format!(
                "cannot resize frame queue to {capacity}: {queued} frames queued"
            )));
        }

        let resized = Channel::bounded(capacity);
        for frame in channel.rx.try_iter() {
            if resized.tx.try_send(frame).is_err() {
                break;
            }
        }
        debug!(previous = channel.capacity, current = resized.capacity, "Resized frame queue");
        *channel = resized;
        Ok(())
    }

    /// Returns true when at least `percent_used` percent (clamped to 100) of
    /// the frame capacity or of the byte limit is occupied.
    pub fn has_congestion(&self, percent_used: u8) -> bool {
        let percent = percent_used.min(100) as usize;
        let channel = self.channel.read();
        channel.rx.len() * 100 >= channel.capacity * percent
            || self.queued_bytes().saturating_mul(100) >= self.max_bytes.saturating_mul(percent)
    }

    /// Refuse further frames.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Accept frames again.
    pub fn open(&self) {
        self.closed.store(false, Ordering::Release);
    }

    /// Returns true if the queue refuses frames.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u8) -> WireFrame {
        WireFrame::new(TrackKind::Video, 6, n as u64, vec![n])
    }

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new(8);
        for n in 0..5 {
            queue.push(frame(n)).unwrap();
        }
        let popped: Vec<u8> = (0..5)
            .filter_map(|_| queue.pop_timeout(Duration::from_millis(10)))
            .map(|f| f.data[0])
            .collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_drop_newest_when_full() {
        let queue = FrameQueue::new(3);
        for n in 0..3 {
            queue.push(frame(n)).unwrap();
        }
        assert!(matches!(queue.push(frame(3)), Err(TransportError::QueueFull)));
        assert_eq!(queue.len(), 3);

        let kept: Vec<u8> = std::iter::from_fn(|| queue.pop_timeout(Duration::from_millis(1)))
            .map(|f| f.data[0])
            .collect();
        assert_eq!(kept, vec![0, 1, 2]);
    }

    #[test]
    fn test_pop_times_out_when_empty() {
        let queue = FrameQueue::new(1);
        assert!(queue.pop_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn test_closed_queue_rejects() {
        let queue = FrameQueue::new(2);
        queue.close();
        assert!(matches!(queue.push(frame(0)), Err(TransportError::QueueClosed)));
        queue.open();
        assert!(queue.push(frame(0)).is_ok());
    }

    #[test]
    fn test_resize_keeps_order() {
        let queue = FrameQueue::new(4);
        queue.push(frame(1)).unwrap();
        queue.push(frame(2)).unwrap();

        assert!(queue.resize(1).is_err());
        queue.resize(10).unwrap();
        assert_eq!(queue.capacity(), 10);
        assert_eq!(queue.pop_timeout(Duration::from_millis(1)).unwrap().data[0], 1);
        assert_eq!(queue.pop_timeout(Duration::from_millis(1)).unwrap().data[0], 2);
    }

    #[test]
    fn test_congestion_and_clear() {
        let queue = FrameQueue::new(10);
        for n in 0..5 {
            queue.push(frame(n)).unwrap();
        }
        assert!(queue.has_congestion(50));
        assert!(!queue.has_congestion(60));
        assert!(queue.has_congestion(0));

        assert_eq!(queue.clear(), 5);
        assert!(queue.is_empty());
        assert_eq!(queue.queued_bytes(), 0);
    }

    fn sized(n: u8, len: usize) -> WireFrame {
        WireFrame::new(TrackKind::Video, 6, n as u64, vec![n; len])
    }

    #[test]
    fn test_byte_limit_drops_newest() {
        let queue = FrameQueue::with_byte_limit(1000, 250);
        queue.push(sized(0, 100)).unwrap();
        queue.push(sized(1, 100)).unwrap();
        assert!(matches!(queue.push(sized(2, 100)), Err(TransportError::QueueFull)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.queued_bytes(), 200);
        assert!(queue.has_congestion(80));

        assert_eq!(queue.pop_timeout(Duration::from_millis(1)).unwrap().data[0], 0);
        assert_eq!(queue.queued_bytes(), 100);
        queue.push(sized(3, 100)).unwrap();
        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.queued_bytes(), 0);
    }

    #[test]
    fn test_oversized_frame_accepted_when_empty() {
        let queue = FrameQueue::with_byte_limit(10, 50);
        queue.push(sized(0, 500)).unwrap();
        assert!(matches!(queue.push(sized(1, 1)), Err(TransportError::QueueFull)));
        queue.pop_timeout(Duration::from_millis(1)).unwrap();
        queue.push(sized(2, 1)).unwrap();
    }

    #[test]
    fn test_push_all_is_all_or_nothing() {
        let queue = FrameQueue::new(4);
        queue.push(frame(0)).unwrap();
        queue.push(frame(1)).unwrap();

        let unit = vec![frame(2), frame(3), frame(4)];
        assert!(matches!(queue.push_all(unit), Err(TransportError::QueueFull)));
        assert_eq!(queue.len(), 2);

        queue.push_all(vec![frame(5), frame(6)]).unwrap();
        let kept: Vec<u8> = std::iter::from_fn(|| queue.pop_timeout(Duration::from_millis(1)))
            .map(|f| f.data[0])
            .collect();
        assert_eq!(kept, vec![0, 1, 5, 6]);

        queue.close();
        assert!(matches!(queue.push_all(vec![frame(7)]), Err(TransportError::QueueClosed)));
    }
}
