//! Typed caller<->publisher contract.
//!
//! This crate defines the event surface the publishing engine reports
//! through, the session/record state machines observed by callers, and
//! the configuration types used to start a session.

mod events;
mod state;
mod types;

pub use events::{ConnectEvent, EventEmitter, RecordEvent};
pub use state::{RecordState, SessionState};
pub use types::{
    Credentials, HandshakeMode, PublishConfig, RecordConfig, RtspTransportMode, StreamMetrics,
};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for connection events (engine → caller).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Channel capacity for recording events (engine → caller).
pub const RECORD_EVENT_CHANNEL_CAPACITY: usize = 64;

/// Creates a bounded connection event channel.
pub fn event_channel() -> (Sender<ConnectEvent>, Receiver<ConnectEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}

/// Creates a bounded recording event channel.
pub fn record_event_channel() -> (Sender<RecordEvent>, Receiver<RecordEvent>) {
    crossbeam_channel::bounded(RECORD_EVENT_CHANNEL_CAPACITY)
}
