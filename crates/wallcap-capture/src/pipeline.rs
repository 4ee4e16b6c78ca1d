//! Sample handling for one session: validate, retain, push.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;
use wallcap_ipc::{SessionId, SessionMetrics};

use crate::channel::{FrameSender, PushOutcome};
use crate::validate::{FrameValidator, OutputType, RawSample};

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    rejected: AtomicU64,
    overwritten: AtomicU64,
    discarded: AtomicU64,
    audio_ignored: AtomicU64,
}

/// Turns raw samples into frames on the session's channel.
///
/// Runs on the sample queue only, so frames of one session are numbered
/// and pushed in arrival order.
pub(crate) struct FramePipeline {
    session: SessionId,
    sender: FrameSender,
    sequence: AtomicU64,
    counters: Counters,
}

impl FramePipeline {
    pub(crate) fn new(session: SessionId, sender: FrameSender) -> Self {
        Self {
            session,
            sender,
            sequence: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub(crate) fn sender(&self) -> &FrameSender {
        &self.sender
    }

    pub(crate) fn handle_sample(&self, sample: RawSample, output_type: OutputType) {
        if output_type != OutputType::Screen {
            // Audio extraction is not implemented.
            self.counters.audio_ignored.fetch_add(1, Ordering::Relaxed);
            trace!(session = %self.session, ?output_type, "Ignoring audio sample");
            return;
        }

        if self.sender.is_closed() {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let Some(descriptor) = FrameValidator::decode(&sample) else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let frame = descriptor.retain(sequence, sample.presentation_time);

        match self.sender.push(frame) {
            PushOutcome::Queued => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::Overwrote => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                self.counters.overwritten.fetch_add(1, Ordering::Relaxed);
                trace!(session = %self.session, sequence, "Consumer behind, replaced oldest frame");
            }
            PushOutcome::Discarded => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn metrics(&self) -> SessionMetrics {
        SessionMetrics {
            session: Some(self.session),
            frames_delivered: self.counters.delivered.load(Ordering::Relaxed),
            frames_rejected: self.counters.rejected.load(Ordering::Relaxed),
            frames_overwritten: self.counters.overwritten.load(Ordering::Relaxed),
            frames_discarded: self.counters.discarded.load(Ordering::Relaxed),
            audio_samples_ignored: self.counters.audio_ignored.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::session_channel;
    use crate::frame::Rect;
    use crate::synthetic::{complete_sample, sample_with_status, SyntheticSurface};
    use crate::validate::FrameStatus;

    #[test]
    fn test_pipeline_counts_outcomes() {
        let (tx, mut rx) = session_channel(1);
        let pipeline = FramePipeline::new(SessionId(1), tx);
        let surface = SyntheticSurface::solid(1, 8, 8, 0);
        let rect = Rect::new(0.0, 0.0, 8.0, 8.0);

        for _ in 0..2 {
            pipeline.handle_sample(
                complete_sample(surface.clone(), rect, 1.0, 1.0),
                OutputType::Screen,
            );
        }
        pipeline.handle_sample(
            sample_with_status(surface.clone(), FrameStatus::Idle as i64),
            OutputType::Screen,
        );
        pipeline.handle_sample(complete_sample(surface.clone(), rect, 1.0, 1.0), OutputType::Audio);

        let metrics = pipeline.metrics();
        assert_eq!(metrics.frames_delivered, 2);
        assert_eq!(metrics.frames_overwritten, 1);
        assert_eq!(metrics.frames_rejected, 1);
        assert_eq!(metrics.audio_samples_ignored, 1);

        // Only the newest frame survives a capacity of one.
        assert_eq!(rx.try_recv().unwrap().unwrap().sequence, 1);

        rx.cancel();
        let late = complete_sample(surface.clone(), rect, 1.0, 1.0);
        pipeline.handle_sample(late, OutputType::Screen);
        assert_eq!(pipeline.metrics().frames_discarded, 1);

        // A closed channel consumes no sequence number, even for a bad sample.
        pipeline.handle_sample(
            sample_with_status(surface, FrameStatus::Idle as i64),
            OutputType::Screen,
        );
        let metrics = pipeline.metrics();
        assert_eq!(metrics.frames_discarded, 2);
        assert_eq!(metrics.frames_rejected, 1);
        assert_eq!(pipeline.sequence.load(Ordering::Relaxed), 2);
    }
}
