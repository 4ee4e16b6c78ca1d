//! Test pattern feed for synthetic streams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use wallcap_capture::synthetic::{
    complete_sample, sample_with_status, SyntheticStream, SyntheticSurface,
};
use wallcap_capture::{FrameStatus, Rect};

/// Every n-th tick is an idle sample instead of a frame.
const IDLE_EVERY: u64 = 10;

/// Feeds one synthetic stream at its configured frame rate until stopped.
pub struct PatternFeed {
    running: Arc<AtomicBool>,
    task: JoinHandle<u64>,
}

impl PatternFeed {
    /// Start feeding `stream`. Frames are only delivered while it runs.
    pub fn spawn(stream: Arc<SyntheticStream>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let task = tokio::spawn(async move {
            let mut frame_rate = stream.parameters().frame_rate;
            let mut ticker = frame_ticker(stream.parameters().minimum_frame_interval());
            let mut tick = 0u64;
            let mut delivered = 0u64;

            while flag.load(Ordering::Relaxed) {
                ticker.tick().await;

                let parameters = stream.parameters();
                if parameters.frame_rate != frame_rate {
                    debug!(from = frame_rate, to = parameters.frame_rate, "Pattern rate changed");
                    frame_rate = parameters.frame_rate;
                    ticker = frame_ticker(parameters.minimum_frame_interval());
                }

                let surface = SyntheticSurface::solid(
                    tick,
                    parameters.width,
                    parameters.height,
                    (tick % 256) as u8,
                );
                let sample = if tick % IDLE_EVERY == IDLE_EVERY - 1 {
                    sample_with_status(surface, FrameStatus::Idle as i64)
                } else {
                    let rect = Rect::new(
                        0.0,
                        0.0,
                        parameters.width as f64,
                        parameters.height as f64,
                    );
                    complete_sample(surface, rect, 1.0, 2.0)
                };

                if stream.emit(sample) {
                    delivered += 1;
                }
                tick += 1;
            }
            delivered
        });

        Self { running, task }
    }

    /// Stop feeding and return how many samples the stream accepted.
    pub async fn stop(self) -> u64 {
        self.running.store(false, Ordering::Relaxed);
        self.task.await.unwrap_or(0)
    }
}

fn frame_ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}
