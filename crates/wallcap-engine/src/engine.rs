//! Capture engine: the collection of sessions behind the video wall.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use wallcap_capture::{
    CaptureBackend, CaptureResult, CaptureSession, FrameStream, SampleQueue, SessionOptions,
};
use wallcap_ipc::{
    CaptureMetrics, ContentFilter, EngineConfig, EngineEvent, SessionConfig, SessionId,
    SessionState, StreamParameters,
};

use crate::metrics::MetricsCollector;

/// Owns every capture session and fans lifecycle calls out to them.
///
/// Engine operations are serialized with each other, so sessions are never
/// added or removed while an operation iterates them. Within one operation
/// sessions are handled concurrently and independently: one session failing
/// never stops the others.
pub struct CaptureEngine {
    backend: Arc<dyn CaptureBackend>,
    config: EngineConfig,
    queue: SampleQueue,
    sessions: Mutex<BTreeMap<SessionId, Arc<CaptureSession>>>,
    lifecycle: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
    events: Option<Sender<EngineEvent>>,
    metrics: MetricsCollector,
}

impl CaptureEngine {
    /// Create an engine on top of `backend`.
    ///
    /// Fails if the configuration is invalid or the sample queue thread
    /// cannot be spawned.
    pub fn new(backend: Arc<dyn CaptureBackend>, config: EngineConfig) -> CaptureResult<Self> {
        config.validate()?;
        let queue = SampleQueue::new(&config.sample_queue_label)?;

        info!(
            channel_capacity = config.channel_capacity,
            stop_timeout_ms = config.stop_timeout_ms,
            "Capture engine created"
        );

        Ok(Self {
            backend,
            config,
            queue,
            sessions: Mutex::new(BTreeMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
            events: None,
            metrics: MetricsCollector::new(),
        })
    }

    /// Send lifecycle events to `event_tx`.
    pub fn with_events(mut self, event_tx: Sender<EngineEvent>) -> Self {
        self.events = Some(event_tx);
        self
    }

    /// Start capturing `filter` with `parameters` and return its frames.
    ///
    /// Always returns a sequence. If the stream cannot be created or started
    /// the sequence's only item is the error.
    pub async fn start_capture(
        &self,
        parameters: StreamParameters,
        filter: ContentFilter,
    ) -> FrameStream {
        self.start_session(parameters, filter).await.1
    }

    /// Like [`CaptureEngine::start_capture`], also returning the session id.
    pub async fn start_session(
        &self,
        parameters: StreamParameters,
        filter: ContentFilter,
    ) -> (SessionId, FrameStream) {
        let _gate = self.lifecycle.lock().await;
        self.add_session(parameters, filter).await
    }

    async fn add_session(
        &self,
        parameters: StreamParameters,
        filter: ContentFilter,
    ) -> (SessionId, FrameStream) {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let target = filter.describe();
        debug!(
            session = %id,
            width = parameters.width,
            height = parameters.height,
            frame_bytes = parameters.frame_size_bytes(),
            "Adding session"
        );
        let options = SessionOptions::from_config(&self.config, self.events.clone());

        let (session, frames) = CaptureSession::start(
            id,
            self.backend.as_ref(),
            &self.queue,
            parameters,
            filter,
            options,
        )
        .await;

        if session.state().is_released() {
            self.metrics.record_session_failed();
        } else {
            self.metrics.record_session_started();
        }

        self.sessions.lock().insert(id, session);
        info!(session = %id, %target, "Session added");
        self.send_event(EngineEvent::SessionAdded {
            session: id,
            target,
        });

        (id, frames)
    }

    /// Stop every session.
    ///
    /// With `remove_sessions` each native stream is released, each sequence
    /// ends, and the collection is emptied once all stops have settled.
    /// Otherwise sessions stay resumable.
    #[instrument(name = "engine_stop", skip(self))]
    pub async fn stop_capture(&self, remove_sessions: bool) {
        let _gate = self.lifecycle.lock().await;
        self.stop_all(remove_sessions).await;
    }

    async fn stop_all(&self, remove_sessions: bool) {
        let sessions = self.snapshot();
        join_all(sessions.iter().map(|s| s.stop(remove_sessions))).await;

        if remove_sessions {
            let removed = std::mem::take(&mut *self.sessions.lock());
            for id in removed.keys() {
                self.send_event(EngineEvent::SessionRemoved { session: *id });
            }
            info!(count = removed.len(), "Sessions stopped and removed");
        } else {
            info!(count = sessions.len(), "Sessions stopped");
        }
    }

    /// Resume every stopped session. Sessions in any other state are skipped.
    #[instrument(name = "engine_resume", skip(self))]
    pub async fn resume_capture(&self) {
        let _gate = self.lifecycle.lock().await;

        let sessions = self.snapshot();
        join_all(sessions.iter().map(|s| s.resume())).await;

        let running = sessions.iter().filter(|s| s.state().is_running()).count();
        info!(running, total = sessions.len(), "Sessions resumed");
    }

    /// Apply new parameters and filter to every session.
    ///
    /// Rejections are collected and logged together; no session's failure
    /// keeps the update from reaching the rest.
    #[instrument(name = "engine_update", skip_all)]
    pub async fn update_configuration(&self, parameters: StreamParameters, filter: ContentFilter) {
        let _gate = self.lifecycle.lock().await;

        let sessions = self.snapshot();
        let results = join_all(
            sessions
                .iter()
                .map(|s| s.update(parameters.clone(), filter.clone())),
        )
        .await;

        let failures: Vec<String> = sessions
            .iter()
            .zip(results)
            .filter_map(|(session, result)| {
                result.err().map(|e| format!("{}: {}", session.id(), e))
            })
            .collect();

        if failures.is_empty() {
            debug!(count = sessions.len(), "Configuration applied");
        } else {
            warn!(
                failed = failures.len(),
                total = sessions.len(),
                "Configuration update rejected: {}",
                failures.join(", ")
            );
        }
    }

    /// Stop, release and forget one session. Returns false if it was unknown.
    #[instrument(name = "engine_remove", skip(self))]
    pub async fn remove_session(&self, id: SessionId) -> bool {
        let _gate = self.lifecycle.lock().await;

        let removed = self.sessions.lock().remove(&id);
        let Some(session) = removed else {
            debug!(session = %id, "Unknown session");
            return false;
        };
        session.stop(true).await;

        info!(session = %id, "Session removed");
        self.send_event(EngineEvent::SessionRemoved { session: id });
        true
    }

    /// Tear every session down and start `configs` from scratch.
    ///
    /// Used when the wall switches mode and every tile is rebuilt. Returns one
    /// sequence per config, in order.
    #[instrument(name = "engine_reset", skip_all, fields(count = configs.len()))]
    pub async fn reset_capture(&self, configs: Vec<SessionConfig>) -> Vec<FrameStream> {
        let _gate = self.lifecycle.lock().await;

        self.stop_all(true).await;

        let mut streams = Vec::with_capacity(configs.len());
        for config in configs {
            let (_, frames) = self.add_session(config.parameters, config.filter).await;
            streams.push(frames);
        }
        streams
    }

    /// Ids of every session in the collection, in creation order.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.lock().keys().copied().collect()
    }

    /// Number of sessions in the collection, released ones included.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// State of one session.
    pub fn session_state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.lock().get(&id).map(|s| s.state())
    }

    /// Configuration one session is currently running with.
    pub fn session_config(&self, id: SessionId) -> Option<SessionConfig> {
        self.sessions.lock().get(&id).map(|s| s.config())
    }

    /// Snapshot of every session's counters.
    pub fn metrics(&self) -> CaptureMetrics {
        self.metrics
            .snapshot(self.snapshot().iter().map(|s| (s.state(), s.metrics())))
    }

    /// Publish a metrics snapshot on the event channel.
    pub fn emit_metrics(&self) {
        self.send_event(EngineEvent::Metrics(self.metrics()));
    }

    /// Engine-wide counters.
    pub fn collector(&self) -> &MetricsCollector {
        &self.metrics
    }

    fn snapshot(&self) -> Vec<Arc<CaptureSession>> {
        self.sessions.lock().values().cloned().collect()
    }

    fn send_event(&self, event: EngineEvent) {
        if let Some(ref tx) = self.events {
            if let Err(e) = tx.try_send(event) {
                warn!("Failed to send event: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for CaptureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureEngine")
            .field("config", &self.config)
            .field("sessions", &self.session_ids())
            .finish()
    }
}
