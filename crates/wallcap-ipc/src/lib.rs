//! Typed messages shared between the wall UI and the capture engine.
//!
//! This crate defines the configuration values the settings layer hands to
//! the engine, the session lifecycle state, and the events the engine emits.

mod events;
mod state;
mod types;

pub use events::EngineEvent;
pub use state::SessionState;
pub use types::{
    CaptureMetrics, ConfigError, ContentFilter, EngineConfig, PixelFormat, SessionConfig,
    SessionId, SessionMetrics, StreamParameters, MAX_FRAME_RATE, MAX_QUEUE_DEPTH,
};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for events (Engine → UI).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<EngineEvent>, Receiver<EngineEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
