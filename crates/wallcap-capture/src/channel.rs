//! Per-session frame channel.
//!
//! Bridges the sample handler (producer) to whoever pulls the session's
//! frames (consumer). The producer side never blocks: the buffer holds at
//! most `capacity` unread frames and, when full, the oldest unread frame is
//! replaced by the newest. Stale video is worse than lost video.
//!
//! ```text
//! Open ──finish()──────────→ Finished
//!   ├──finish_with_error()─→ Failed
//!   └──cancel()────────────→ Cancelled   (consumer side only)
//! ```
//!
//! After `Finished` or `Failed` the consumer still drains frames that were
//! queued before the terminal signal, then sees the end of the sequence.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::error::CaptureError;
use crate::frame::CapturedFrame;

/// Observable state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Finished,
    Failed,
    Cancelled,
}

impl ChannelState {
    /// Returns true for every state except `Open`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// What happened to a pushed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame queued.
    Queued,
    /// Frame queued; the oldest unread frame was dropped to make room.
    Overwrote,
    /// Frame dropped: channel closed, cancelled, or frame invalid.
    Discarded,
}

struct Inner {
    queue: VecDeque<CapturedFrame>,
    capacity: usize,
    state: ChannelState,
    error: Option<CaptureError>,
}

struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
}

/// Create a channel holding at most `capacity` unread frames.
pub fn session_channel(capacity: usize) -> (FrameSender, FrameStream) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            state: ChannelState::Open,
            error: None,
        }),
        notify: Notify::new(),
    });

    (
        FrameSender {
            shared: Arc::clone(&shared),
        },
        FrameStream {
            shared,
            exhausted: false,
        },
    )
}

/// Producer half of a session channel.
#[derive(Clone)]
pub struct FrameSender {
    shared: Arc<Shared>,
}

impl FrameSender {
    /// Queue a frame without blocking.
    pub fn push(&self, frame: CapturedFrame) -> PushOutcome {
        if !frame.is_valid() {
            trace!("Refusing to queue invalid frame placeholder");
            return PushOutcome::Discarded;
        }

        let outcome = {
            let mut inner = self.shared.inner.lock();
            if inner.state != ChannelState::Open {
                return PushOutcome::Discarded;
            }

            let outcome = if inner.queue.len() >= inner.capacity {
                inner.queue.pop_front();
                PushOutcome::Overwrote
            } else {
                PushOutcome::Queued
            };
            inner.queue.push_back(frame);
            outcome
        };
        self.shared.notify.notify_one();
        outcome
    }

    /// End the sequence normally. Returns false if it had already ended.
    pub fn finish(&self) -> bool {
        self.close(ChannelState::Finished, None)
    }

    /// End the sequence with an error. Returns false if it had already ended.
    pub fn finish_with_error(&self, error: CaptureError) -> bool {
        self.close(ChannelState::Failed, Some(error))
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.shared.inner.lock().state
    }

    /// True once the channel no longer accepts frames.
    pub fn is_closed(&self) -> bool {
        self.state().is_terminal()
    }

    fn close(&self, state: ChannelState, error: Option<CaptureError>) -> bool {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state != ChannelState::Open {
                return false;
            }
            inner.state = state;
            inner.error = error;
        }
        self.shared.notify.notify_one();
        true
    }
}

impl std::fmt::Debug for FrameSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSender")
            .field("state", &self.state())
            .finish()
    }
}

/// Consumer half of a session channel.
///
/// Yields `Ok(frame)` in arrival order, at most one `Err` as the final item
/// of a failed sequence, then `None` forever. Dropping the receiver cancels it.
pub struct FrameStream {
    shared: Arc<Shared>,
    exhausted: bool,
}

impl FrameStream {
    /// Wait for the next frame or the end of the sequence.
    pub async fn recv(&mut self) -> Option<Result<CapturedFrame, CaptureError>> {
        loop {
            if let Some(item) = self.try_recv() {
                return Some(item);
            }
            if self.exhausted {
                return None;
            }
            // A notification sent since the check above is kept as a permit.
            self.shared.notify.notified().await;
        }
    }

    /// Take the next item if one is ready, without waiting.
    ///
    /// `None` means either nothing is queued yet or the sequence ended; use
    /// [`FrameStream::is_terminated`] to tell them apart.
    pub fn try_recv(&mut self) -> Option<Result<CapturedFrame, CaptureError>> {
        if self.exhausted {
            return None;
        }

        let mut inner = self.shared.inner.lock();
        if let Some(frame) = inner.queue.pop_front() {
            return Some(Ok(frame));
        }
        match inner.state {
            ChannelState::Open => None,
            ChannelState::Finished | ChannelState::Cancelled => {
                self.exhausted = true;
                None
            }
            ChannelState::Failed => {
                self.exhausted = true;
                inner.error.take().map(Err)
            }
        }
    }

    /// Turn the receiver into a [`Stream`] of the same items.
    pub fn into_stream(self) -> impl Stream<Item = Result<CapturedFrame, CaptureError>> {
        futures::stream::unfold(self, |mut frames| async move {
            frames.recv().await.map(|item| (item, frames))
        })
    }

    /// Stop receiving. Frames pushed afterwards are dropped by the producer.
    ///
    /// This does not stop the native stream; that stays with the session.
    pub fn cancel(&mut self) {
        let mut inner = self.shared.inner.lock();
        if inner.state == ChannelState::Open {
            inner.state = ChannelState::Cancelled;
        }
        inner.queue.clear();
        self.exhausted = true;
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.shared.inner.lock().state
    }

    /// True once every item, including the terminal one, has been taken.
    pub fn is_terminated(&self) -> bool {
        self.exhausted
    }

    /// Number of frames waiting to be received.
    pub fn pending(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for FrameStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStream")
            .field("state", &self.state())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::frame::Rect;
    use crate::synthetic::SyntheticSurface;

    fn frame(sequence: u64) -> CapturedFrame {
        CapturedFrame {
            surface: Some(SyntheticSurface::solid(sequence, 2, 2, 0)),
            content_rect: Rect::new(0.0, 0.0, 2.0, 2.0),
            content_scale: 1.0,
            scale_factor: 1.0,
            sequence,
            presentation_time: Duration::ZERO,
        }
    }

    fn sequences(stream: &mut FrameStream) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(Ok(frame)) = stream.try_recv() {
            out.push(frame.sequence);
        }
        out
    }

    #[test]
    fn test_frames_arrive_in_order() {
        let (tx, mut rx) = session_channel(8);
        for i in 0..5 {
            assert_eq!(tx.push(frame(i)), PushOutcome::Queued);
        }
        assert_eq!(sequences(&mut rx), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_overflow_keeps_newest() {
        let (tx, mut rx) = session_channel(2);
        tx.push(frame(1));
        tx.push(frame(2));
        assert_eq!(tx.push(frame(3)), PushOutcome::Overwrote);

        assert_eq!(sequences(&mut rx), vec![2, 3]);
    }

    #[test]
    fn test_invalid_placeholder_is_never_queued() {
        let (tx, rx) = session_channel(2);
        assert_eq!(tx.push(CapturedFrame::INVALID), PushOutcome::Discarded);
        assert_eq!(rx.pending(), 0);
    }

    #[test]
    fn test_finish_drains_then_ends() {
        let (tx, mut rx) = session_channel(4);
        tx.push(frame(1));
        assert!(tx.finish());
        assert_eq!(tx.push(frame(2)), PushOutcome::Discarded);
        assert!(!tx.finish_with_error(CaptureError::StreamFailed("late".into())));

        assert_eq!(rx.try_recv().unwrap().unwrap().sequence, 1);
        assert!(rx.try_recv().is_none());
        assert!(rx.is_terminated());
        assert_eq!(rx.state(), ChannelState::Finished);
    }

    #[test]
    fn test_error_is_delivered_once() {
        let (tx, mut rx) = session_channel(4);
        tx.finish_with_error(CaptureError::StreamFailed("display lost".into()));

        let error = rx.try_recv().expect("terminal item").unwrap_err();
        assert_eq!(error, CaptureError::StreamFailed("display lost".into()));
        assert!(rx.try_recv().is_none());
        assert!(rx.is_terminated());
    }

    #[test]
    fn test_cancel_drops_later_pushes() {
        let (tx, mut rx) = session_channel(4);
        tx.push(frame(1));
        rx.cancel();

        assert_eq!(tx.state(), ChannelState::Cancelled);
        assert_eq!(tx.push(frame(2)), PushOutcome::Discarded);
        assert!(!tx.finish());
        assert!(rx.try_recv().is_none());
        assert!(rx.is_terminated());
    }

    #[test]
    fn test_dropping_consumer_cancels() {
        let (tx, rx) = session_channel(4);
        drop(rx);
        assert_eq!(tx.push(frame(1)), PushOutcome::Discarded);
        assert_eq!(tx.state(), ChannelState::Cancelled);
    }

    #[tokio::test]
    async fn test_recv_waits_for_producer_thread() {
        let (tx, mut rx) = session_channel(16);

        let producer = std::thread::spawn(move || {
            for i in 0..10 {
                tx.push(frame(i));
                std::thread::sleep(Duration::from_millis(1));
            }
            tx.finish();
        });

        let mut seen = Vec::new();
        while let Some(item) = rx.recv().await {
            seen.push(item.unwrap().sequence);
        }
        producer.join().unwrap();

        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_stream_yields_error_then_none() {
        let (tx, rx) = session_channel(4);
        tx.push(frame(1));
        tx.finish_with_error(CaptureError::StreamFailed("gone".into()));

        let stream = rx.into_stream();
        futures::pin_mut!(stream);
        assert!(stream.next().await.unwrap().is_ok());
        assert!(matches!(
            stream.next().await,
            Some(Err(CaptureError::StreamFailed(_)))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_finish() {
        let (tx, mut rx) = session_channel(4);

        let waiter = tokio::spawn(async move { rx.recv().await.is_none() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.finish();

        assert!(tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("receiver was not woken")
            .unwrap());
    }
}
