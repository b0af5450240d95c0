//! Session and recording state machine types.

use serde::{Deserialize, Serialize};

/// Protocol-independent state of a publish session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Not connected.
    #[default]
    Idle,

    /// Transport is connected and the protocol handshake is running.
    Handshaking,

    /// Control negotiation (connect/announce/setup) completed.
    ControlNegotiated,

    /// Media is flowing.
    Publishing,

    /// Session is closed. No further frames are accepted.
    Closed,
}

impl SessionState {
    /// Returns true if the session is publishing.
    pub fn is_publishing(&self) -> bool {
        matches!(self, Self::Publishing)
    }

    /// Returns true while a connect is in progress.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Handshaking | Self::ControlNegotiated)
    }

    /// Returns true if the session is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns true if a new connect may be started.
    pub fn can_connect(&self) -> bool {
        matches!(self, Self::Idle | Self::Closed)
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Handshaking => "Handshaking",
            Self::ControlNegotiated => "ControlNegotiated",
            Self::Publishing => "Publishing",
            Self::Closed => "Closed",
        }
    }
}

/// State of the local recording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    /// No container is open.
    #[default]
    Stopped,

    /// Container is open, waiting for the first key frame.
    Started,

    /// Samples are being muxed.
    Recording,

    /// Samples are discarded until resumed.
    Paused,

    /// Resumed; switches back to `Recording` on the next sample.
    Resumed,
}

impl RecordState {
    /// Returns true when a container is open.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Stopped)
    }

    /// Returns true if incoming samples are written to the container.
    pub fn accepts_samples(&self) -> bool {
        matches!(self, Self::Recording | Self::Resumed)
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Started => "Started",
            Self::Recording => "Recording",
            Self::Paused => "Paused",
            Self::Resumed => "Resumed",
        }
    }
}
