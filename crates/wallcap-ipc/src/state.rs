//! Capture session state machine types.

use serde::{Deserialize, Serialize};

/// Lifecycle of one capture session.
///
/// ```text
/// Created → Running → Stopped ⇄ Running
///    │         │         │
///    └─────────┴─────────┴──→ Released (terminal)
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Native stream constructed, not yet started.
    #[default]
    Created,

    /// Native stream is delivering buffers.
    Running,

    /// Native stream stopped but retained for a later resume.
    Stopped,

    /// Native stream handle dropped. Terminal.
    Released,
}

impl SessionState {
    /// Returns true if the session is running.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if the session can be resumed.
    pub fn is_stopped(self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Returns true once the native handle is gone.
    pub fn is_released(self) -> bool {
        matches!(self, Self::Released)
    }

    /// Returns a simple string representation of the state.
    pub fn name(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Released => "Released",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Stopped)
                | (Running, Stopped)
                | (Stopped, Running)
                | (Created | Running | Stopped, Released)
        )
    }
}
