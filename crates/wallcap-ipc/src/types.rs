//! Common types shared by the engine and its callers.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest frame rate a stream may request.
pub const MAX_FRAME_RATE: u32 = 240;

/// Largest number of surfaces the native layer may keep in flight per stream.
pub const MAX_QUEUE_DEPTH: u32 = 8;

/// Engine-assigned identity of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// A configuration value failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Width or height is zero.
    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Frame rate outside `1..=MAX_FRAME_RATE`.
    #[error("unsupported frame rate: {0}")]
    InvalidFrameRate(u32),

    /// Queue depth outside `1..=MAX_QUEUE_DEPTH`.
    #[error("unsupported queue depth: {0}")]
    InvalidQueueDepth(u32),

    /// Application filter without an identifier.
    #[error("application filter requires a bundle identifier")]
    EmptyApplication,

    /// Engine channel capacity of zero.
    #[error("channel capacity must be at least 1")]
    InvalidChannelCapacity,
}

/// Which on-screen target a session captures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentFilter {
    /// A whole display, optionally excluding some windows.
    Display {
        display_id: u32,
        #[serde(default)]
        excluded_windows: Vec<u32>,
    },

    /// A single window, independent of the display it sits on.
    Window { window_id: u32 },

    /// Every window of one application on one display.
    Application { display_id: u32, bundle_id: String },
}

impl ContentFilter {
    /// Check the filter is well formed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Application { bundle_id, .. } if bundle_id.trim().is_empty() => {
                Err(ConfigError::EmptyApplication)
            }
            _ => Ok(()),
        }
    }

    /// Short human readable description for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Display {
                display_id,
                excluded_windows,
            } if excluded_windows.is_empty() => format!("display:{display_id}"),
            Self::Display {
                display_id,
                excluded_windows,
            } => format!(
                "display:{display_id} (excluding {} windows)",
                excluded_windows.len()
            ),
            Self::Window { window_id } => format!("window:{window_id}"),
            Self::Application {
                display_id,
                bundle_id,
            } => format!("app:{bundle_id}@display:{display_id}"),
        }
    }
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self::Display {
            display_id: 0,
            excluded_windows: Vec::new(),
        }
    }
}

/// Pixel layout requested from the native layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 8-bit BGRA, 4 bytes per pixel.
    #[default]
    Bgra,

    /// Bi-planar 4:2:0 YCbCr, video range.
    YCbCr420Video,

    /// Bi-planar 4:2:0 YCbCr, full range.
    YCbCr420Full,

    /// 10-bit packed RGB with 2-bit alpha.
    Rgb10a2,
}

impl PixelFormat {
    /// Average bytes per pixel across all planes.
    pub fn bytes_per_pixel(self) -> f32 {
        match self {
            Self::Bgra | Self::Rgb10a2 => 4.0,
            Self::YCbCr420Video | Self::YCbCr420Full => 1.5,
        }
    }
}

/// Native stream parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamParameters {
    /// Output width in pixels.
    pub width: u32,

    /// Output height in pixels.
    pub height: u32,

    /// Target frames per second.
    pub frame_rate: u32,

    /// Requested pixel layout.
    pub pixel_format: PixelFormat,

    /// Surfaces the native layer may keep in flight.
    pub queue_depth: u32,

    /// Draw the cursor into captured frames.
    pub shows_cursor: bool,

    /// Scale content to fit the output size.
    pub scales_to_fit: bool,

    /// Request audio. Audio samples are accepted from the native layer but ignored.
    pub captures_audio: bool,
}

impl StreamParameters {
    /// Check the parameters are within what the native layer accepts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if !(1..=MAX_FRAME_RATE).contains(&self.frame_rate) {
            return Err(ConfigError::InvalidFrameRate(self.frame_rate));
        }
        if !(1..=MAX_QUEUE_DEPTH).contains(&self.queue_depth) {
            return Err(ConfigError::InvalidQueueDepth(self.queue_depth));
        }
        Ok(())
    }

    /// Minimum interval between two frames.
    pub fn minimum_frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.frame_rate.max(1)))
    }

    /// Expected size in bytes of one frame's pixel data.
    pub fn frame_size_bytes(&self) -> usize {
        let pixels = self.width as f32 * self.height as f32;
        (pixels * self.pixel_format.bytes_per_pixel()) as usize
    }
}

impl Default for StreamParameters {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            frame_rate: 60,
            pixel_format: PixelFormat::Bgra,
            queue_depth: 3,
            shows_cursor: false,
            scales_to_fit: true,
            captures_audio: false,
        }
    }
}

/// Everything a session needs to run: what to capture and how.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Capture target.
    #[serde(default)]
    pub filter: ContentFilter,

    /// Native stream parameters.
    #[serde(default)]
    pub parameters: StreamParameters,
}

impl SessionConfig {
    /// Create a config from its two halves.
    pub fn new(parameters: StreamParameters, filter: ContentFilter) -> Self {
        Self { filter, parameters }
    }

    /// Validate both halves.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.filter.validate()?;
        self.parameters.validate()
    }
}

/// Engine-wide tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Frames buffered per session before the oldest unread frame is dropped.
    pub channel_capacity: usize,

    /// How long a session waits for the native layer to acknowledge a stop.
    pub stop_timeout_ms: u64,

    /// Thread name of the engine's sample handler queue.
    pub sample_queue_label: String,
}

impl EngineConfig {
    /// Validate the engine tuning.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidChannelCapacity);
        }
        Ok(())
    }

    /// Stop acknowledgement timeout.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 3,
            stop_timeout_ms: 2_000,
            sample_queue_label: "wallcap.sample-queue".to_string(),
        }
    }
}

/// Counters for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// Session the counters belong to.
    pub session: Option<SessionId>,

    /// Frames accepted by the validator and pushed to the channel.
    pub frames_delivered: u64,

    /// Raw buffers the validator discarded.
    pub frames_rejected: u64,

    /// Unread frames replaced by newer ones because the consumer fell behind.
    pub frames_overwritten: u64,

    /// Frames dropped because the channel was already closed or cancelled.
    pub frames_discarded: u64,

    /// Audio and microphone samples ignored.
    pub audio_samples_ignored: u64,
}

/// Engine-wide snapshot of every session's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMetrics {
    /// Number of sessions in the collection.
    pub session_count: usize,

    /// Sessions currently running.
    pub running_sessions: usize,

    /// Sum of delivered frames across sessions.
    pub total_frames_delivered: u64,

    /// Sum of rejected buffers across sessions.
    pub total_frames_rejected: u64,

    /// Per-session counters, in session order.
    pub sessions: Vec<SessionMetrics>,

    /// Seconds since the engine was created.
    pub uptime_seconds: u64,
}
