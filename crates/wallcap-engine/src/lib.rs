//! Capture engine for the video wall.
//!
//! This crate owns the collection of capture sessions and coordinates their
//! lifecycle: starting new tiles, stopping and resuming the whole wall,
//! pushing configuration changes, and reporting metrics.

mod engine;
mod metrics;

pub use engine::CaptureEngine;
pub use metrics::MetricsCollector;

use std::sync::Arc;

use wallcap_capture::{CaptureBackend, CaptureResult};
use wallcap_ipc::{EngineConfig, EngineEvent};

use crossbeam_channel::Sender;

/// Create an engine that reports lifecycle events on `event_tx`.
pub fn create_engine(
    backend: Arc<dyn CaptureBackend>,
    config: EngineConfig,
    event_tx: Sender<EngineEvent>,
) -> CaptureResult<CaptureEngine> {
    Ok(CaptureEngine::new(backend, config)?.with_events(event_tx))
}
