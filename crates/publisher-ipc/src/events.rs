//! Events sent from the publishing engine to the caller.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::state::RecordState;

/// Connection events reported by a publish session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectEvent {
    /// A connection attempt to `url` has begun.
    Started {
        /// Endpoint being connected to.
        url: String,
    },

    /// The session is publishing.
    Connected,

    /// The session failed and is closed.
    Failed {
        /// Human readable failure reason.
        reason: String,
    },

    /// A new throughput estimate.
    NewBitrate {
        /// Estimated bits per second over the last window.
        bits_per_second: u64,
    },

    /// The session was closed by the caller.
    Disconnected,

    /// The server rejected the credentials, or demanded credentials that were not provided.
    AuthError,

    /// The server accepted the credentials.
    AuthSuccess,
}

impl ConnectEvent {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "STARTED",
            Self::Connected => "CONNECTED",
            Self::Failed { .. } => "FAILED",
            Self::NewBitrate { .. } => "NEW_BITRATE",
            Self::Disconnected => "DISCONNECTED",
            Self::AuthError => "AUTH_ERROR",
            Self::AuthSuccess => "AUTH_SUCCESS",
        }
    }

    /// Returns true for events after which the session no longer publishes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Disconnected | Self::AuthError)
    }
}

/// Events reported by the record controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordEvent {
    /// The record state changed.
    StatusChanged(RecordState),

    /// Writing to the container failed. The record state is left unchanged.
    Error {
        /// Error message.
        message: String,
    },
}

/// Cloneable non-blocking handle for publishing events.
///
/// Events are never allowed to stall the thread reporting them: when the
/// caller stops draining the channel, new events are dropped with a warning.
#[derive(Debug, Clone)]
pub struct EventEmitter<E = ConnectEvent> {
    tx: Option<Sender<E>>,
}

impl<E> EventEmitter<E> {
    /// Wrap a channel sender.
    pub fn new(tx: Sender<E>) -> Self {
        Self { tx: Some(tx) }
    }

    /// An emitter that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }
}

impl<E: std::fmt::Debug> EventEmitter<E> {
    /// Send an event without blocking.
    pub fn emit(&self, event: E) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(event) {
                warn!("Failed to send event: {:?}", e.into_inner());
            }
        }
    }
}
