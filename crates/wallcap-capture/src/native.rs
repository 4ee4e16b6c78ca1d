//! Boundary to the platform capture layer.
//!
//! A [`CaptureBackend`] builds one [`NativeStream`] per session. The stream
//! reports buffers and fatal errors through the [`StreamOutput`] it was
//! created with, from whatever thread the platform uses.

use std::sync::Arc;

use async_trait::async_trait;
use wallcap_ipc::{ContentFilter, StreamParameters};

use crate::error::NativeError;
use crate::validate::{OutputType, RawSample};

/// Callback sink the native layer delivers into.
///
/// Implementations must return quickly and never block on consumers.
pub trait StreamOutput: Send + Sync {
    /// A buffer is available.
    fn did_output_sample(&self, sample: RawSample, output_type: OutputType);

    /// The stream stopped on its own because of a fatal error.
    fn did_stop_with_error(&self, error: NativeError);
}

/// One platform capture stream.
///
/// Every call resolves once the native layer has acknowledged it.
#[async_trait]
pub trait NativeStream: Send + Sync {
    /// Begin delivering buffers.
    async fn start_capture(&self) -> Result<(), NativeError>;

    /// Stop delivering buffers. The stream may be started again later.
    async fn stop_capture(&self) -> Result<(), NativeError>;

    /// Apply new stream parameters to the live stream.
    async fn update_configuration(&self, parameters: &StreamParameters) -> Result<(), NativeError>;

    /// Point the live stream at a different target.
    async fn update_content_filter(&self, filter: &ContentFilter) -> Result<(), NativeError>;
}

/// Factory for native streams.
pub trait CaptureBackend: Send + Sync {
    /// Construct a stream. It does not deliver anything until started.
    fn create_stream(
        &self,
        filter: &ContentFilter,
        parameters: &StreamParameters,
        output: Arc<dyn StreamOutput>,
    ) -> Result<Arc<dyn NativeStream>, NativeError>;
}
