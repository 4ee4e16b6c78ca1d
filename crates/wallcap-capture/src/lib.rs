//! Capture sessions for the video wall.
//!
//! This crate turns native capture streams into per-session frame sequences:
//!
//! - [`native`] is the boundary to the platform capture layer.
//! - [`FrameValidator`] decides which raw samples carry a displayable frame.
//! - [`session_channel`] buffers frames for a consumer, keeping the newest.
//! - [`CaptureSession`] owns one native stream and its lifecycle.
//! - [`SampleQueue`] serializes every native delivery of an engine.

mod channel;
mod error;
mod frame;
pub mod native;
mod pipeline;
mod queue;
mod session;
pub mod synthetic;
mod validate;

pub use channel::{session_channel, ChannelState, FrameSender, FrameStream, PushOutcome};
pub use error::{CaptureError, NativeError};
pub use frame::{CapturedFrame, FrameDescriptor, Rect, Surface, SurfaceHandle};
pub use native::{CaptureBackend, NativeStream, StreamOutput};
pub use queue::SampleQueue;
pub use session::{CaptureSession, SessionOptions};
pub use validate::{
    AttachmentValue, Attachments, FrameInfoKey, FrameStatus, FrameValidator, ImageBuffer,
    OutputType, RawSample, Rejection,
};

/// Result type for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;
