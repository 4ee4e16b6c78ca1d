//! Capture session management.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};
use wallcap_ipc::{
    ContentFilter, EngineConfig, EngineEvent, SessionConfig, SessionId, SessionMetrics,
    SessionState, StreamParameters,
};

use crate::channel::{session_channel, FrameStream};
use crate::error::{CaptureError, NativeError};
use crate::native::{CaptureBackend, NativeStream, StreamOutput};
use crate::pipeline::FramePipeline;
use crate::queue::SampleQueue;
use crate::validate::{OutputType, RawSample};
use crate::CaptureResult;

/// Per-session tuning handed down by the engine.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Frames buffered before the oldest unread one is replaced.
    pub channel_capacity: usize,

    /// How long to wait for the native layer to acknowledge a stop.
    pub stop_timeout: Duration,

    /// Where lifecycle events go, if anywhere.
    pub events: Option<Sender<EngineEvent>>,
}

impl SessionOptions {
    /// Options derived from the engine configuration.
    pub fn from_config(config: &EngineConfig, events: Option<Sender<EngineEvent>>) -> Self {
        Self {
            channel_capacity: config.channel_capacity,
            stop_timeout: config.stop_timeout(),
            events,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default(), None)
    }
}

/// Mutable session fields. Never held across an await.
struct SessionShared {
    state: SessionState,
    stream: Option<Arc<dyn NativeStream>>,
    config: SessionConfig,
}

/// The part of a session the sample queue can reach.
struct SessionCore {
    id: SessionId,
    pipeline: FramePipeline,
    shared: Mutex<SessionShared>,
    events: Option<Sender<EngineEvent>>,
}

impl SessionCore {
    /// Move to `next` if the lifecycle allows it.
    fn transition(&self, shared: &mut SessionShared, next: SessionState) -> bool {
        let previous = shared.state;
        if !previous.can_transition_to(next) {
            return false;
        }
        shared.state = next;

        debug!(
            session = %self.id,
            previous = previous.name(),
            current = next.name(),
            "State transition"
        );
        self.send_event(EngineEvent::SessionStateChanged {
            session: self.id,
            previous,
            current: next,
        });
        true
    }

    /// Move to `Released` and drop the native handle. False if already released.
    fn release(&self) -> bool {
        let stream = {
            let mut shared = self.shared.lock();
            if !self.transition(&mut shared, SessionState::Released) {
                return false;
            }
            shared.stream.take()
        };
        drop(stream);
        true
    }

    /// End the session with a consumer-visible error.
    fn fail(&self, error: CaptureError) {
        if self.release() {
            self.report_failure(error);
        }
    }

    /// Log, announce and deliver the error of a session already released.
    fn report_failure(&self, error: CaptureError) {
        error!(session = %self.id, %error, "Capture session failed");
        self.send_event(EngineEvent::SessionFailed {
            session: self.id,
            message: error.to_string(),
        });
        self.pipeline.sender().finish_with_error(error);
    }

    fn send_event(&self, event: EngineEvent) {
        if let Some(ref tx) = self.events {
            if let Err(e) = tx.try_send(event) {
                warn!("Failed to send event: {}", e);
            }
        }
    }
}

/// Native callbacks of one session, forwarded onto the sample queue.
struct SessionOutput {
    core: Weak<SessionCore>,
    queue: SampleQueue,
}

impl StreamOutput for SessionOutput {
    fn did_output_sample(&self, sample: RawSample, output_type: OutputType) {
        let core = Weak::clone(&self.core);
        self.queue.dispatch(move || {
            if let Some(core) = core.upgrade() {
                core.pipeline.handle_sample(sample, output_type);
            }
        });
    }

    fn did_stop_with_error(&self, error: NativeError) {
        let core = Weak::clone(&self.core);
        self.queue.dispatch(move || {
            if let Some(core) = core.upgrade() {
                core.fail(CaptureError::StreamFailed(error.to_string()));
            }
        });
    }
}

/// One native capture stream, its frame channel and its configuration.
///
/// Lifecycle calls on the same session are serialized; sessions never share
/// a lock with each other.
pub struct CaptureSession {
    core: Arc<SessionCore>,
    queue: SampleQueue,
    ops: tokio::sync::Mutex<()>,
    stop_timeout: Duration,
}

impl CaptureSession {
    /// Create a session and start its native stream.
    ///
    /// Never fails: if the stream cannot be built or started, the returned
    /// sequence ends with [`CaptureError::Creation`] and the session is
    /// released.
    #[instrument(
        name = "session_start",
        skip_all,
        fields(session = %id, target = %filter.describe())
    )]
    pub async fn start(
        id: SessionId,
        backend: &dyn CaptureBackend,
        queue: &SampleQueue,
        parameters: StreamParameters,
        filter: ContentFilter,
        options: SessionOptions,
    ) -> (Arc<Self>, FrameStream) {
        let (session, frames) = Self::create(id, backend, queue, parameters, filter, options);
        session.begin().await;
        (session, frames)
    }

    /// Build the session and its native stream without starting it.
    ///
    /// The sequence is available immediately; a construction failure is its
    /// terminal error.
    pub fn create(
        id: SessionId,
        backend: &dyn CaptureBackend,
        queue: &SampleQueue,
        parameters: StreamParameters,
        filter: ContentFilter,
        options: SessionOptions,
    ) -> (Arc<Self>, FrameStream) {
        let (sender, frames) = session_channel(options.channel_capacity);
        let config = SessionConfig::new(parameters, filter);

        let core = Arc::new(SessionCore {
            id,
            pipeline: FramePipeline::new(id, sender),
            shared: Mutex::new(SessionShared {
                state: SessionState::Created,
                stream: None,
                config: config.clone(),
            }),
            events: options.events,
        });

        let created = config
            .validate()
            .map_err(|e| CaptureError::Creation(CaptureError::from(e).to_string()))
            .and_then(|()| {
                let output: Arc<dyn StreamOutput> = Arc::new(SessionOutput {
                    core: Arc::downgrade(&core),
                    queue: queue.clone(),
                });
                backend
                    .create_stream(&config.filter, &config.parameters, output)
                    .map_err(|e| CaptureError::Creation(e.to_string()))
            });

        match created {
            Ok(stream) => {
                core.shared.lock().stream = Some(stream);
                debug!(session = %id, "Native stream created");
            }
            Err(error) => core.fail(error),
        }

        let session = Arc::new(Self {
            core,
            queue: queue.clone(),
            ops: tokio::sync::Mutex::new(()),
            stop_timeout: options.stop_timeout,
        });
        (session, frames)
    }

    /// Start the native stream of a freshly created session.
    pub async fn begin(&self) {
        let _op = self.ops.lock().await;

        let stream = {
            let shared = self.core.shared.lock();
            if shared.state != SessionState::Created {
                return;
            }
            shared.stream.clone()
        };
        let Some(stream) = stream else {
            return;
        };

        match stream.start_capture().await {
            Ok(()) => {
                let mut shared = self.core.shared.lock();
                if shared.state == SessionState::Created {
                    self.core.transition(&mut shared, SessionState::Running);
                    info!(session = %self.core.id, "Capture started");
                }
            }
            Err(e) => self.fail_behind_queue(CaptureError::Creation(e.to_string())),
        }
    }

    /// Release now, but deliver the error after samples already queued.
    fn fail_behind_queue(&self, error: CaptureError) {
        if !self.core.release() {
            return;
        }
        let core = Arc::clone(&self.core);
        let fallback = error.clone();
        if !self.queue.dispatch(move || core.report_failure(error)) {
            self.core.report_failure(fallback);
        }
    }

    /// Stop the native stream. Best effort: failures are logged, never returned.
    ///
    /// With `release_resources` the native handle is dropped and the sequence
    /// ends normally once frames already handed over have been delivered.
    /// Otherwise the handle is kept for [`CaptureSession::resume`].
    #[instrument(name = "session_stop", skip(self), fields(session = %self.core.id))]
    pub async fn stop(&self, release_resources: bool) {
        let _op = self.ops.lock().await;

        let (state, stream) = {
            let shared = self.core.shared.lock();
            (shared.state, shared.stream.clone())
        };
        if state.is_released() {
            debug!("Already released");
            return;
        }

        if state.is_running() {
            if let Some(stream) = stream {
                self.stop_native(stream.as_ref()).await;
            }
        }

        if release_resources {
            if self.core.release() {
                let sender = self.core.pipeline.sender().clone();
                if !self.queue.dispatch(move || {
                    sender.finish();
                }) {
                    self.core.pipeline.sender().finish();
                }
                info!("Capture stopped and released");
            }
        } else {
            let mut shared = self.core.shared.lock();
            if self.core.transition(&mut shared, SessionState::Stopped) {
                info!("Capture stopped");
            }
        }
    }

    async fn stop_native(&self, stream: &dyn NativeStream) {
        let message = match tokio::time::timeout(self.stop_timeout, stream.stop_capture()).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no acknowledgement within {:?}", self.stop_timeout),
        };

        let error = CaptureError::StopFailed(message);
        warn!(%error, "Treating session as stopped");
        self.core.send_event(EngineEvent::StopFailed {
            session: self.core.id,
            message: error.to_string(),
        });
    }

    /// Restart a stopped session on the same channel.
    ///
    /// No-op unless the session is `Stopped`. A native restart failure ends
    /// the sequence with [`CaptureError::StreamFailed`].
    #[instrument(name = "session_resume", skip(self), fields(session = %self.core.id))]
    pub async fn resume(&self) {
        let _op = self.ops.lock().await;

        let stream = {
            let shared = self.core.shared.lock();
            if !shared.state.is_stopped() {
                debug!(state = shared.state.name(), "Nothing to resume");
                return;
            }
            shared.stream.clone()
        };
        let Some(stream) = stream else {
            return;
        };

        match stream.start_capture().await {
            Ok(()) => {
                let mut shared = self.core.shared.lock();
                if shared.state.is_stopped() {
                    self.core.transition(&mut shared, SessionState::Running);
                    info!("Capture resumed");
                }
            }
            Err(e) => self.fail_behind_queue(CaptureError::StreamFailed(e.to_string())),
        }
    }

    /// Apply new parameters and filter to the native stream.
    ///
    /// Each half is applied independently and only the accepted half
    /// replaces the stored configuration. Never ends the sequence.
    #[instrument(name = "session_update", skip_all, fields(session = %self.core.id))]
    pub async fn update(
        &self,
        parameters: StreamParameters,
        filter: ContentFilter,
    ) -> CaptureResult<()> {
        let _op = self.ops.lock().await;

        let stream = {
            let shared = self.core.shared.lock();
            if shared.state.is_released() {
                debug!("Released, skipping update");
                return Ok(());
            }
            shared.stream.clone()
        };
        let Some(stream) = stream else {
            return Ok(());
        };

        let config = SessionConfig::new(parameters, filter);
        if let Err(e) = config.validate() {
            let error = CaptureError::from(e);
            self.report_update_failure(&error);
            return Err(error);
        }

        let mut failures = Vec::new();

        match stream.update_configuration(&config.parameters).await {
            Ok(()) => self.core.shared.lock().config.parameters = config.parameters,
            Err(e) => failures.push(format!("parameters: {e}")),
        }
        match stream.update_content_filter(&config.filter).await {
            Ok(()) => self.core.shared.lock().config.filter = config.filter,
            Err(e) => failures.push(format!("filter: {e}")),
        }

        if failures.is_empty() {
            debug!("Configuration updated");
            return Ok(());
        }

        let error = CaptureError::UpdateFailed(failures.join("; "));
        self.report_update_failure(&error);
        Err(error)
    }

    fn report_update_failure(&self, error: &CaptureError) {
        warn!(session = %self.core.id, %error, "Continuing with previous configuration");
        self.core.send_event(EngineEvent::UpdateFailed {
            session: self.core.id,
            message: error.to_string(),
        });
    }

    /// Session identity.
    pub fn id(&self) -> SessionId {
        self.core.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.core.shared.lock().state
    }

    /// Configuration the native layer last accepted.
    pub fn config(&self) -> SessionConfig {
        self.core.shared.lock().config.clone()
    }

    /// True while a native handle is held.
    pub fn has_native_stream(&self) -> bool {
        self.core.shared.lock().stream.is_some()
    }

    /// Frame counters.
    pub fn metrics(&self) -> SessionMetrics {
        self.core.pipeline.metrics()
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("id", &self.core.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::ChannelState;
    use crate::frame::Rect;
    use crate::synthetic::{complete_sample, sample_with_status, SyntheticBackend, SyntheticSurface};
    use crate::validate::FrameStatus;

    const WAIT: Duration = Duration::from_secs(2);

    fn queue() -> SampleQueue {
        SampleQueue::new("test.session-queue").unwrap()
    }

    fn hd_sample(id: u64) -> RawSample {
        complete_sample(
            SyntheticSurface::solid(id, 16, 9, 0),
            Rect::new(0.0, 0.0, 1920.0, 1080.0),
            2.0,
            1.0,
        )
    }

    /// Wait until every job enqueued so far has run.
    fn flush(queue: &SampleQueue) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        queue.dispatch(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(WAIT).unwrap();
    }

    async fn next(frames: &mut FrameStream) -> Option<Result<crate::CapturedFrame, CaptureError>> {
        tokio::time::timeout(WAIT, frames.recv())
            .await
            .expect("timed out waiting for the sequence")
    }

    async fn start(
        backend: &SyntheticBackend,
        queue: &SampleQueue,
    ) -> (Arc<CaptureSession>, FrameStream) {
        CaptureSession::start(
            SessionId(1),
            backend,
            queue,
            StreamParameters::default(),
            ContentFilter::Window { window_id: 7 },
            SessionOptions::default(),
        )
        .await
    }

    #[tokio::test]
    async fn test_complete_sample_reaches_consumer() {
        let backend = SyntheticBackend::new();
        let queue = queue();
        let (session, mut frames) = start(&backend, &queue).await;
        assert_eq!(session.state(), SessionState::Running);

        backend.stream(0).unwrap().emit(hd_sample(1));

        let frame = next(&mut frames).await.unwrap().unwrap();
        assert_eq!(frame.content_rect, Rect::new(0.0, 0.0, 1920.0, 1080.0));
        assert_eq!(frame.content_scale, 2.0);
        assert_eq!(frame.scale_factor, 1.0);
        assert_eq!(frame.sequence, 0);
    }

    #[tokio::test]
    async fn test_creation_failure_is_terminal_error() {
        let backend = SyntheticBackend::new();
        backend.fail_next_creation(NativeError::new(-3801, "user declined"));
        let queue = queue();

        let (session, mut frames) = start(&backend, &queue).await;

        assert_eq!(session.state(), SessionState::Released);
        assert!(!session.has_native_stream());
        assert!(matches!(next(&mut frames).await, Some(Err(CaptureError::Creation(_)))));
        assert!(next(&mut frames).await.is_none());
    }

    #[tokio::test]
    async fn test_start_failure_is_terminal_error() {
        let backend = SyntheticBackend::new();
        backend.fail_next_start(NativeError::new(-3805, "no display"));
        let queue = queue();

        let (session, mut frames) = start(&backend, &queue).await;

        assert_eq!(session.state(), SessionState::Released);
        assert!(matches!(next(&mut frames).await, Some(Err(CaptureError::Creation(_)))));
    }

    #[tokio::test]
    async fn test_invalid_parameters_fail_creation() {
        let backend = SyntheticBackend::new();
        let queue = queue();

        let (session, mut frames) = CaptureSession::start(
            SessionId(2),
            &backend,
            &queue,
            StreamParameters {
                frame_rate: 0,
                ..Default::default()
            },
            ContentFilter::default(),
            SessionOptions::default(),
        )
        .await;

        assert_eq!(session.state(), SessionState::Released);
        assert_eq!(backend.stream_count(), 0);
        assert!(matches!(next(&mut frames).await, Some(Err(CaptureError::Creation(_)))));
    }

    #[tokio::test]
    async fn test_partial_status_yields_nothing() {
        let backend = SyntheticBackend::new();
        let queue = queue();
        let (session, mut frames) = start(&backend, &queue).await;

        let native = backend.stream(0).unwrap();
        native.emit(sample_with_status(
            SyntheticSurface::solid(1, 4, 4, 0),
            FrameStatus::Idle as i64,
        ));
        let mut invalid = hd_sample(2);
        invalid.is_valid = false;
        native.emit(invalid);

        session.stop(true).await;

        assert!(next(&mut frames).await.is_none());
        assert_eq!(session.metrics().frames_rejected, 2);
        assert_eq!(session.metrics().frames_delivered, 0);
    }

    #[tokio::test]
    async fn test_stop_then_resume_keeps_sequence() {
        let backend = SyntheticBackend::new();
        let queue = queue();
        let (session, mut frames) = start(&backend, &queue).await;
        let native = backend.stream(0).unwrap();

        native.emit(hd_sample(1));
        assert!(next(&mut frames).await.unwrap().is_ok());

        session.stop(false).await;
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!native.is_running());
        assert!(session.has_native_stream());

        // Delivered while stopped: the synthetic stream drops it like the OS would.
        native.emit(hd_sample(2));

        session.resume().await;
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(native.start_count(), 2);

        native.emit(hd_sample(3));
        let frame = next(&mut frames).await.unwrap().unwrap();
        assert_eq!(frame.surface.as_ref().unwrap().id(), 3);
        assert_eq!(frame.sequence, 1);
    }

    #[tokio::test]
    async fn test_failed_resume_ends_sequence() {
        let backend = SyntheticBackend::new();
        let queue = queue();
        let (session, mut frames) = start(&backend, &queue).await;
        let native = backend.stream(0).unwrap();

        session.stop(false).await;
        native.fail_start(Some(NativeError::new(-3805, "display asleep")));
        session.resume().await;

        assert_eq!(session.state(), SessionState::Released);
        assert!(matches!(
            next(&mut frames).await,
            Some(Err(CaptureError::StreamFailed(_)))
        ));
        assert!(next(&mut frames).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_resume_delivers_queued_frames_first() {
        let backend = SyntheticBackend::new();
        let queue = queue();
        let (session, mut frames) = start(&backend, &queue).await;
        let native = backend.stream(0).unwrap();

        // Hold the queue so the frame is still pending when resume fails.
        queue.dispatch(|| std::thread::sleep(Duration::from_millis(200)));
        assert!(native.emit(hd_sample(1)));
        session.stop(false).await;
        native.fail_start(Some(NativeError::new(-3805, "display asleep")));
        session.resume().await;
        assert_eq!(session.state(), SessionState::Released);

        let frame = next(&mut frames).await.unwrap().unwrap();
        assert_eq!(frame.sequence, 0);
        assert!(matches!(
            next(&mut frames).await,
            Some(Err(CaptureError::StreamFailed(_)))
        ));
        assert!(next(&mut frames).await.is_none());
    }

    #[tokio::test]
    async fn test_resume_is_noop_unless_stopped() {
        let backend = SyntheticBackend::new();
        let queue = queue();
        let (session, mut frames) = start(&backend, &queue).await;
        let native = backend.stream(0).unwrap();

        session.resume().await;
        assert_eq!(native.start_count(), 1);

        session.stop(true).await;
        session.resume().await;
        assert_eq!(session.state(), SessionState::Released);
        assert_eq!(native.start_count(), 1);
        assert!(next(&mut frames).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_stop_is_treated_as_stopped() {
        let backend = SyntheticBackend::new();
        let queue = queue();
        let (session, _frames) = start(&backend, &queue).await;

        backend
            .stream(0)
            .unwrap()
            .fail_stop(Some(NativeError::new(-1, "busy")));
        session.stop(false).await;

        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_timeout_is_treated_as_stopped() {
        let backend = SyntheticBackend::new();
        let queue = queue();
        let options = SessionOptions {
            stop_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (session, _frames) = CaptureSession::start(
            SessionId(3),
            &backend,
            &queue,
            StreamParameters::default(),
            ContentFilter::default(),
            options,
        )
        .await;

        backend.stream(0).unwrap().set_stop_delay(Duration::from_secs(5));
        session.stop(true).await;

        assert_eq!(session.state(), SessionState::Released);
    }

    #[tokio::test]
    async fn test_native_failure_releases_session() {
        let backend = SyntheticBackend::new();
        let queue = queue();
        let (session, mut frames) = start(&backend, &queue).await;
        let native = backend.stream(0).unwrap();

        native.emit(hd_sample(1));
        native.fail(NativeError::new(-3821, "display disconnected"));

        assert!(next(&mut frames).await.unwrap().is_ok());
        let error = next(&mut frames).await.unwrap().unwrap_err();
        assert!(matches!(error, CaptureError::StreamFailed(_)));
        assert!(next(&mut frames).await.is_none());
        assert_eq!(session.state(), SessionState::Released);
        assert!(!session.has_native_stream());
    }

    #[tokio::test]
    async fn test_partial_update_keeps_session_running() {
        let backend = SyntheticBackend::new();
        let queue = queue();
        let (session, frames) = start(&backend, &queue).await;
        let native = backend.stream(0).unwrap();
        native.reject_parameters(true);

        let parameters = StreamParameters {
            frame_rate: 30,
            ..Default::default()
        };
        let filter = ContentFilter::Window { window_id: 9 };
        let result = session.update(parameters, filter.clone()).await;

        assert!(matches!(result, Err(CaptureError::UpdateFailed(_))));
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(frames.state(), ChannelState::Open);

        let config = session.config();
        assert_eq!(config.filter, filter);
        assert_eq!(config.parameters.frame_rate, 60);
        assert_eq!(native.filter(), filter);
    }

    #[tokio::test]
    async fn test_update_on_released_session_is_skipped() {
        let backend = SyntheticBackend::new();
        let queue = queue();
        let (session, _frames) = start(&backend, &queue).await;
        session.stop(true).await;

        let result = session
            .update(StreamParameters::default(), ContentFilter::default())
            .await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_cancelled_consumer_leaves_native_running() {
        let backend = SyntheticBackend::new();
        let queue = queue();
        let (session, frames) = start(&backend, &queue).await;
        drop(frames);

        let native = backend.stream(0).unwrap();
        native.emit(hd_sample(1));

        flush(&queue);

        assert!(native.is_running());
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.metrics().frames_discarded, 1);
        session.stop(true).await;
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let backend = SyntheticBackend::new();
        let queue = queue();
        let (tx, rx) = crossbeam_channel::unbounded();
        let options = SessionOptions {
            events: Some(tx),
            ..Default::default()
        };

        let (session, _frames) = CaptureSession::start(
            SessionId(5),
            &backend,
            &queue,
            StreamParameters::default(),
            ContentFilter::default(),
            options,
        )
        .await;
        session.stop(false).await;

        let transitions: Vec<_> = rx
            .try_iter()
            .filter_map(|event| match event {
                EngineEvent::SessionStateChanged { current, .. } => Some(current),
                _ => None,
            })
            .collect();
        assert_eq!(transitions, vec![SessionState::Running, SessionState::Stopped]);
    }
}
