//! Events sent from the engine to observers.

use serde::{Deserialize, Serialize};

use crate::state::SessionState;
use crate::types::{CaptureMetrics, SessionId};

/// Events that the engine can send to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// A session was added to the engine.
    SessionAdded {
        session: SessionId,
        /// Description of the capture target.
        target: String,
    },

    /// A session moved between lifecycle states.
    SessionStateChanged {
        session: SessionId,
        previous: SessionState,
        current: SessionState,
    },

    /// A session's sequence ended with an error.
    SessionFailed { session: SessionId, message: String },

    /// A configuration change was partially or fully rejected. Non-fatal.
    UpdateFailed { session: SessionId, message: String },

    /// The native layer did not acknowledge a stop. Treated as stopped.
    StopFailed { session: SessionId, message: String },

    /// A session was removed from the engine.
    SessionRemoved { session: SessionId },

    /// Snapshot of engine metrics.
    Metrics(CaptureMetrics),
}

impl EngineEvent {
    /// The session this event concerns, if any.
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::SessionAdded { session, .. }
            | Self::SessionStateChanged { session, .. }
            | Self::SessionFailed { session, .. }
            | Self::UpdateFailed { session, .. }
            | Self::StopFailed { session, .. }
            | Self::SessionRemoved { session } => Some(*session),
            Self::Metrics(_) => None,
        }
    }
}
