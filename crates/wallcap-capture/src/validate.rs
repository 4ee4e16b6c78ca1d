//! Raw sample decoding.
//!
//! The native layer hands over a [`RawSample`] for every buffer it produces.
//! [`FrameValidator`] runs an ordered chain of checks over it; the first
//! failing check discards the sample. Discards are routine (idle or blank
//! frames arrive whenever the captured content does not change) and are
//! never surfaced as errors.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tracing::trace;

use crate::frame::{FrameDescriptor, Rect, SurfaceHandle};

/// Kind of output a native sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputType {
    Screen,
    Audio,
    Microphone,
}

/// Frame status reported in the first attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum FrameStatus {
    /// A new frame was generated.
    Complete = 0,
    /// Content did not change; no new frame.
    Idle = 1,
    /// The frame is blank.
    Blank = 2,
    /// Capture is suspended.
    Suspended = 3,
    /// First frame after start; carries no content.
    Started = 4,
    /// Last frame before stop; carries no content.
    Stopped = 5,
}

impl FrameStatus {
    /// Map a native raw value, `None` for values this crate does not know.
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(Self::Complete),
            1 => Some(Self::Idle),
            2 => Some(Self::Blank),
            3 => Some(Self::Suspended),
            4 => Some(Self::Started),
            5 => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// Keys of the per-frame attachment dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameInfoKey {
    Status,
    ContentRect,
    ContentScale,
    ScaleFactor,
    DisplayTime,
}

/// Dictionary keys of a serialized rectangle.
pub const RECT_X: &str = "X";
pub const RECT_Y: &str = "Y";
pub const RECT_WIDTH: &str = "Width";
pub const RECT_HEIGHT: &str = "Height";

/// A loosely typed attachment value, as the native layer stores it.
#[derive(Debug, Clone, PartialEq)]
pub enum AttachmentValue {
    Int(i64),
    Float(f64),
    Dictionary(HashMap<String, f64>),
}

impl AttachmentValue {
    /// Numeric view; integers widen to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Dictionary(_) => None,
        }
    }

    /// Integer view; floats are not truncated.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Rectangle from its dictionary representation.
    pub fn as_rect(&self) -> Option<Rect> {
        let Self::Dictionary(dict) = self else {
            return None;
        };
        Some(Rect::new(
            *dict.get(RECT_X)?,
            *dict.get(RECT_Y)?,
            *dict.get(RECT_WIDTH)?,
            *dict.get(RECT_HEIGHT)?,
        ))
    }

    /// Dictionary representation of a rectangle.
    pub fn rect(rect: Rect) -> Self {
        Self::Dictionary(HashMap::from([
            (RECT_X.to_string(), rect.x),
            (RECT_Y.to_string(), rect.y),
            (RECT_WIDTH.to_string(), rect.width),
            (RECT_HEIGHT.to_string(), rect.height),
        ]))
    }
}

/// One attachment dictionary.
pub type Attachments = HashMap<FrameInfoKey, AttachmentValue>;

/// Pixel buffer of a sample. Not every buffer is backed by a shareable surface.
#[derive(Debug, Clone)]
pub struct ImageBuffer {
    pub surface: Option<SurfaceHandle>,
}

/// A raw buffer as delivered by the native stream.
#[derive(Debug, Clone)]
pub struct RawSample {
    /// Whether the native layer considers the buffer usable at all.
    pub is_valid: bool,

    /// Per-sample attachment dictionaries; the first one describes the frame.
    pub attachments: Vec<Attachments>,

    /// Pixel buffer, absent for audio and for some status-only samples.
    pub image_buffer: Option<ImageBuffer>,

    /// Presentation time stamp.
    pub presentation_time: Duration,
}

/// Why a sample was discarded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("sample buffer marked invalid")]
    InvalidBuffer,

    #[error("sample carries no attachments")]
    MissingAttachments,

    #[error("frame status missing or unreadable")]
    MissingStatus,

    #[error("frame status is {0:?}")]
    Incomplete(FrameStatus),

    #[error("unknown frame status {0}")]
    UnknownStatus(i64),

    #[error("sample has no image buffer")]
    MissingImageBuffer,

    #[error("image buffer is not backed by a surface")]
    MissingSurface,

    #[error("missing or malformed {0:?} attachment")]
    Geometry(FrameInfoKey),
}

/// Stateless decoder from raw samples to frame descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameValidator;

impl FrameValidator {
    /// Decode a sample, discarding it silently when any check fails.
    pub fn decode(sample: &RawSample) -> Option<FrameDescriptor<'_>> {
        match Self::check(sample) {
            Ok(frame) => Some(frame),
            Err(rejection) => {
                trace!(%rejection, "Discarding sample");
                None
            }
        }
    }

    /// Run every check in order and report the first failure.
    pub fn check(sample: &RawSample) -> Result<FrameDescriptor<'_>, Rejection> {
        if !sample.is_valid {
            return Err(Rejection::InvalidBuffer);
        }

        let attachments = sample
            .attachments
            .first()
            .ok_or(Rejection::MissingAttachments)?;

        Self::check_status(attachments)?;

        let surface = sample
            .image_buffer
            .as_ref()
            .ok_or(Rejection::MissingImageBuffer)?
            .surface
            .as_ref()
            .ok_or(Rejection::MissingSurface)?;

        let content_rect = attachments
            .get(&FrameInfoKey::ContentRect)
            .and_then(AttachmentValue::as_rect)
            .filter(Rect::is_well_formed)
            .ok_or(Rejection::Geometry(FrameInfoKey::ContentRect))?;
        let content_scale = Self::positive(attachments, FrameInfoKey::ContentScale)?;
        let scale_factor = Self::positive(attachments, FrameInfoKey::ScaleFactor)?;

        Ok(FrameDescriptor {
            surface,
            content_rect,
            content_scale,
            scale_factor,
        })
    }

    fn check_status(attachments: &Attachments) -> Result<(), Rejection> {
        let raw = attachments
            .get(&FrameInfoKey::Status)
            .and_then(AttachmentValue::as_i64)
            .ok_or(Rejection::MissingStatus)?;

        match FrameStatus::from_raw(raw) {
            Some(FrameStatus::Complete) => Ok(()),
            Some(status) => Err(Rejection::Incomplete(status)),
            None => Err(Rejection::UnknownStatus(raw)),
        }
    }

    fn positive(attachments: &Attachments, key: FrameInfoKey) -> Result<f64, Rejection> {
        attachments
            .get(&key)
            .and_then(AttachmentValue::as_f64)
            .filter(|v| v.is_finite() && *v > 0.0)
            .ok_or(Rejection::Geometry(key))
    }
}
