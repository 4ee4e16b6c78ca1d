//! In-process capture backend.
//!
//! Streams produced here deliver only what the caller feeds them, which makes
//! them useful for driving sessions without a display server: the demo binary
//! generates test patterns through them and the test suites script native
//! behavior (failed starts, slow stops, rejected updates) with them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;
use wallcap_ipc::{ContentFilter, StreamParameters};

use crate::error::NativeError;
use crate::frame::{Rect, Surface, SurfaceHandle};
use crate::native::{CaptureBackend, NativeStream, StreamOutput};
use crate::validate::{
    AttachmentValue, Attachments, FrameInfoKey, FrameStatus, ImageBuffer, OutputType, RawSample,
};

/// A BGRA surface filled with a single byte value.
///
/// Pixels are generated on copy, so large surfaces cost nothing until read.
#[derive(Debug, Clone)]
pub struct SyntheticSurface {
    id: u64,
    width: u32,
    height: u32,
    fill: u8,
}

impl SyntheticSurface {
    /// Surface of `width` x `height` pixels, every byte set to `fill`.
    pub fn solid(id: u64, width: u32, height: u32, fill: u8) -> SurfaceHandle {
        Arc::new(Self {
            id,
            width,
            height,
            fill,
        })
    }
}

impl Surface for SyntheticSurface {
    fn id(&self) -> u64 {
        self.id
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn copy_pixels(&self) -> Bytes {
        let len = self.width as usize * self.height as usize * 4;
        Bytes::from(vec![self.fill; len])
    }
}

/// A screen sample with complete status and the given geometry.
pub fn complete_sample(
    surface: SurfaceHandle,
    content_rect: Rect,
    content_scale: f64,
    scale_factor: f64,
) -> RawSample {
    let attachments: Attachments = HashMap::from([
        (
            FrameInfoKey::Status,
            AttachmentValue::Int(FrameStatus::Complete as i64),
        ),
        (FrameInfoKey::ContentRect, AttachmentValue::rect(content_rect)),
        (FrameInfoKey::ContentScale, AttachmentValue::Float(content_scale)),
        (FrameInfoKey::ScaleFactor, AttachmentValue::Float(scale_factor)),
    ]);

    RawSample {
        is_valid: true,
        attachments: vec![attachments],
        image_buffer: Some(ImageBuffer {
            surface: Some(surface),
        }),
        presentation_time: Duration::ZERO,
    }
}

/// A sample whose status attachment carries `raw_status`; otherwise complete.
pub fn sample_with_status(surface: SurfaceHandle, raw_status: i64) -> RawSample {
    let (width, height) = (surface.width() as f64, surface.height() as f64);
    let mut sample = complete_sample(surface, Rect::new(0.0, 0.0, width, height), 1.0, 1.0);
    if let Some(first) = sample.attachments.first_mut() {
        first.insert(FrameInfoKey::Status, AttachmentValue::Int(raw_status));
    }
    sample
}

#[derive(Debug)]
struct StreamState {
    running: bool,
    start_count: u32,
    parameters: StreamParameters,
    filter: ContentFilter,
    fail_start: Option<NativeError>,
    fail_stop: Option<NativeError>,
    stop_delay: Duration,
    reject_parameters: bool,
    reject_filter: bool,
}

/// A scripted native stream.
pub struct SyntheticStream {
    index: usize,
    output: Arc<dyn StreamOutput>,
    state: Mutex<StreamState>,
}

impl SyntheticStream {
    /// Deliver a screen sample. Dropped unless the stream is running.
    pub fn emit(&self, sample: RawSample) -> bool {
        self.deliver(sample, OutputType::Screen)
    }

    /// Deliver an audio sample. Dropped unless the stream is running.
    pub fn emit_audio(&self, sample: RawSample) -> bool {
        self.deliver(sample, OutputType::Audio)
    }

    fn deliver(&self, sample: RawSample, output_type: OutputType) -> bool {
        if !self.state.lock().running {
            return false;
        }
        self.output.did_output_sample(sample, output_type);
        true
    }

    /// Stop with a fatal error, as if the captured display went away.
    pub fn fail(&self, error: NativeError) {
        self.state.lock().running = false;
        self.output.did_stop_with_error(error);
    }

    /// Make every following start fail with `error`, or succeed again with `None`.
    pub fn fail_start(&self, error: Option<NativeError>) {
        self.state.lock().fail_start = error;
    }

    /// Make every following stop fail with `error`, or succeed again with `None`.
    pub fn fail_stop(&self, error: Option<NativeError>) {
        self.state.lock().fail_stop = error;
    }

    /// Delay stop acknowledgements.
    pub fn set_stop_delay(&self, delay: Duration) {
        self.state.lock().stop_delay = delay;
    }

    /// Reject parameter updates.
    pub fn reject_parameters(&self, reject: bool) {
        self.state.lock().reject_parameters = reject;
    }

    /// Reject content filter updates.
    pub fn reject_filter(&self, reject: bool) {
        self.state.lock().reject_filter = reject;
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn start_count(&self) -> u32 {
        self.state.lock().start_count
    }

    pub fn parameters(&self) -> StreamParameters {
        self.state.lock().parameters.clone()
    }

    pub fn filter(&self) -> ContentFilter {
        self.state.lock().filter.clone()
    }
}

#[async_trait]
impl NativeStream for SyntheticStream {
    async fn start_capture(&self) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        if let Some(ref error) = state.fail_start {
            return Err(error.clone());
        }
        state.running = true;
        state.start_count += 1;
        debug!(stream = self.index, "Synthetic stream started");
        Ok(())
    }

    async fn stop_capture(&self) -> Result<(), NativeError> {
        let delay = self.state.lock().stop_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(ref error) = state.fail_stop {
            return Err(error.clone());
        }
        state.running = false;
        debug!(stream = self.index, "Synthetic stream stopped");
        Ok(())
    }

    async fn update_configuration(&self, parameters: &StreamParameters) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        if state.reject_parameters {
            return Err(NativeError::new(-3802, "invalid stream parameters"));
        }
        state.parameters = parameters.clone();
        Ok(())
    }

    async fn update_content_filter(&self, filter: &ContentFilter) -> Result<(), NativeError> {
        let mut state = self.state.lock();
        if state.reject_filter {
            return Err(NativeError::new(-3815, "content filter target unavailable"));
        }
        state.filter = filter.clone();
        Ok(())
    }
}

impl std::fmt::Debug for SyntheticStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticStream")
            .field("index", &self.index)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[derive(Default)]
struct BackendState {
    streams: Vec<Arc<SyntheticStream>>,
    fail_next_creation: Option<NativeError>,
    fail_next_start: Option<NativeError>,
}

/// Backend handing out [`SyntheticStream`]s and keeping a handle to each.
#[derive(Default)]
pub struct SyntheticBackend {
    state: Mutex<BackendState>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `create_stream` call with `error`.
    pub fn fail_next_creation(&self, error: NativeError) {
        self.state.lock().fail_next_creation = Some(error);
    }

    /// Make the next created stream refuse to start.
    pub fn fail_next_start(&self, error: NativeError) {
        self.state.lock().fail_next_start = Some(error);
    }

    /// Every stream created so far, in creation order.
    pub fn streams(&self) -> Vec<Arc<SyntheticStream>> {
        self.state.lock().streams.clone()
    }

    /// The `index`-th created stream.
    pub fn stream(&self, index: usize) -> Option<Arc<SyntheticStream>> {
        self.state.lock().streams.get(index).cloned()
    }

    pub fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }
}

impl CaptureBackend for SyntheticBackend {
    fn create_stream(
        &self,
        filter: &ContentFilter,
        parameters: &StreamParameters,
        output: Arc<dyn StreamOutput>,
    ) -> Result<Arc<dyn NativeStream>, NativeError> {
        let mut state = self.state.lock();
        if let Some(error) = state.fail_next_creation.take() {
            return Err(error);
        }

        let index = state.streams.len();
        let stream = Arc::new(SyntheticStream {
            index,
            output,
            state: Mutex::new(StreamState {
                running: false,
                start_count: 0,
                parameters: parameters.clone(),
                filter: filter.clone(),
                fail_start: state.fail_next_start.take(),
                fail_stop: None,
                stop_delay: Duration::ZERO,
                reject_parameters: false,
                reject_filter: false,
            }),
        });
        state.streams.push(Arc::clone(&stream));

        debug!(stream = index, target = %filter.describe(), "Synthetic stream created");
        Ok(stream)
    }
}

impl std::fmt::Debug for SyntheticBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticBackend")
            .field("streams", &self.stream_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sink(Mutex<Vec<OutputType>>);

    impl StreamOutput for Sink {
        fn did_output_sample(&self, _sample: RawSample, output_type: OutputType) {
            self.0.lock().push(output_type);
        }

        fn did_stop_with_error(&self, _error: NativeError) {}
    }

    #[tokio::test]
    async fn test_stream_delivers_only_while_running() {
        let backend = SyntheticBackend::new();
        let sink = Arc::new(Sink(Mutex::new(Vec::new())));
        let native = backend
            .create_stream(
                &ContentFilter::default(),
                &StreamParameters::default(),
                sink.clone(),
            )
            .unwrap();
        let stream = backend.stream(0).unwrap();
        let sample = || sample_with_status(SyntheticSurface::solid(1, 2, 2, 0), 0);

        assert!(!stream.emit(sample()));
        native.start_capture().await.unwrap();
        assert!(stream.emit(sample()));
        assert!(stream.emit_audio(sample()));
        native.stop_capture().await.unwrap();
        assert!(!stream.emit(sample()));

        assert_eq!(*sink.0.lock(), vec![OutputType::Screen, OutputType::Audio]);
    }

    #[test]
    fn test_surface_pixels_are_generated_on_copy() {
        let surface = SyntheticSurface::solid(3, 2, 2, 0xab);
        let pixels = surface.copy_pixels();
        assert_eq!(pixels.len(), 16);
        assert!(pixels.iter().all(|b| *b == 0xab));
    }
}
