//! Captured frame types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

/// Axis-aligned rectangle in points.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    /// The empty rectangle at the origin.
    pub const ZERO: Rect = Rect {
        x: 0.0,
        y: 0.0,
        width: 0.0,
        height: 0.0,
    };

    /// Create a new rectangle.
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Width and height.
    pub fn size(&self) -> (f64, f64) {
        (self.width, self.height)
    }

    /// True when every component is finite and non-negative.
    pub fn is_well_formed(&self) -> bool {
        [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    }
}

/// Image memory owned by the native capture layer.
///
/// The native layer may recycle a surface for a later frame once the
/// callback that delivered it has returned, so pixel contents read after
/// that point can belong to a newer frame. Use [`Surface::copy_pixels`]
/// while the frame is current when the data must outlive it.
pub trait Surface: Send + Sync + fmt::Debug {
    /// Stable identifier of the surface within its pool.
    fn id(&self) -> u64;

    /// Width in pixels.
    fn width(&self) -> u32;

    /// Height in pixels.
    fn height(&self) -> u32;

    /// Copy the current pixel contents out of the surface.
    fn copy_pixels(&self) -> Bytes;
}

/// A retained reference to a native surface.
pub type SurfaceHandle = Arc<dyn Surface>;

/// A validated frame borrowing its surface from the raw sample.
///
/// Valid only while the sample it came from is alive, which in practice
/// means inside the sample handler. Call [`FrameDescriptor::retain`] to
/// produce a [`CapturedFrame`] that can cross threads.
#[derive(Debug, Clone, Copy)]
pub struct FrameDescriptor<'a> {
    pub surface: &'a SurfaceHandle,
    pub content_rect: Rect,
    pub content_scale: f64,
    pub scale_factor: f64,
}

impl FrameDescriptor<'_> {
    /// Take a new reference on the surface and produce an owned frame.
    pub fn retain(&self, sequence: u64, presentation_time: Duration) -> CapturedFrame {
        CapturedFrame {
            surface: Some(Arc::clone(self.surface)),
            content_rect: self.content_rect,
            content_scale: self.content_scale,
            scale_factor: self.scale_factor,
            sequence,
            presentation_time,
        }
    }
}

/// A captured video frame, as delivered to consumers.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Retained surface. `None` only for [`CapturedFrame::INVALID`].
    pub surface: Option<SurfaceHandle>,

    /// Region of the surface holding captured content.
    pub content_rect: Rect,

    /// Scale of the content relative to its source.
    pub content_scale: f64,

    /// Backing scale factor of the source display.
    pub scale_factor: f64,

    /// Per-session, monotonically increasing sequence number.
    pub sequence: u64,

    /// Presentation time reported by the native layer.
    pub presentation_time: Duration,
}

impl CapturedFrame {
    /// Placeholder meaning "no frame available". Never delivered through a channel.
    pub const INVALID: CapturedFrame = CapturedFrame {
        surface: None,
        content_rect: Rect::ZERO,
        content_scale: 0.0,
        scale_factor: 0.0,
        sequence: 0,
        presentation_time: Duration::ZERO,
    };

    /// False for the invalid placeholder.
    pub fn is_valid(&self) -> bool {
        self.surface.is_some() && self.content_scale > 0.0 && self.scale_factor > 0.0
    }

    /// Size of the content rectangle.
    pub fn size(&self) -> (f64, f64) {
        self.content_rect.size()
    }

    /// Copy the pixel data out of the surface.
    pub fn copy_pixels(&self) -> Option<Bytes> {
        self.surface.as_ref().map(|surface| surface.copy_pixels())
    }
}

impl Default for CapturedFrame {
    fn default() -> Self {
        Self::INVALID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Plain(Bytes);

    impl Surface for Plain {
        fn id(&self) -> u64 {
            1
        }
        fn width(&self) -> u32 {
            2
        }
        fn height(&self) -> u32 {
            1
        }
        fn copy_pixels(&self) -> Bytes {
            self.0.clone()
        }
    }

    #[test]
    fn test_invalid_placeholder() {
        let frame = CapturedFrame::default();
        assert!(!frame.is_valid());
        assert!(frame.copy_pixels().is_none());
        assert_eq!(frame.size(), (0.0, 0.0));
    }

    #[test]
    fn test_retain_keeps_surface_alive() {
        let surface: SurfaceHandle = Arc::new(Plain(Bytes::from_static(&[1, 2, 3, 4])));
        let descriptor = FrameDescriptor {
            surface: &surface,
            content_rect: Rect::new(0.0, 0.0, 2.0, 1.0),
            content_scale: 1.0,
            scale_factor: 2.0,
        };

        let frame = descriptor.retain(7, Duration::from_millis(16));
        drop(surface);

        assert!(frame.is_valid());
        assert_eq!(frame.sequence, 7);
        assert_eq!(frame.copy_pixels().unwrap().as_ref(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_rect_well_formed() {
        assert!(Rect::new(0.0, 0.0, 1920.0, 1080.0).is_well_formed());
        assert!(!Rect::new(-1.0, 0.0, 10.0, 10.0).is_well_formed());
        assert!(!Rect::new(0.0, 0.0, f64::NAN, 10.0).is_well_formed());
    }
}
