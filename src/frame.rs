use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

/// Pixel memory layouts understood by the pipeline.
///
/// The camera delivers planar NV12; the composited output is negotiated
/// down to a packed 32-bit layout with a 24-bit fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    /// 4:2:0 planar, 12 bits per pixel. Camera-side format.
    Nv12,
    /// Packed 32-bit, 8 bits per channel plus padding. Primary output format.
    Bgrx,
    /// Packed 24-bit. Output fallback when the sink cannot take BGRx.
    Rgb,
}

impl PixelLayout {
    /// Bytes needed for a full frame of `width` x `height` in this layout.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelLayout::Nv12 => pixels * 3 / 2,
            PixelLayout::Bgrx => pixels * 4,
            PixelLayout::Rgb => pixels * 3,
        }
    }
}

impl fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelLayout::Nv12 => write!(f, "NV12"),
            PixelLayout::Bgrx => write!(f, "BGRx"),
            PixelLayout::Rgb => write!(f, "RGB"),
        }
    }
}

/// A camera mode: resolution, framerate and pixel layout.
///
/// Candidates are evaluated in a fixed preference order during negotiation;
/// the negotiated format is immutable for the rest of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraFormat {
    pub width: u32,
    pub height: u32,
    pub framerate_numer: u32,
    pub framerate_denom: u32,
    pub pixel_layout: PixelLayout,
}

impl CameraFormat {
    pub const fn new(width: u32, height: u32, fps: u32, pixel_layout: PixelLayout) -> Self {
        CameraFormat {
            width,
            height,
            framerate_numer: fps,
            framerate_denom: 1,
            pixel_layout,
        }
    }

    /// Nominal interval between captured frames.
    pub fn frame_interval(&self) -> Duration {
        let nanos =
            1_000_000_000u64 * self.framerate_denom as u64 / self.framerate_numer.max(1) as u64;
        Duration::from_nanos(nanos)
    }

    /// Size of one frame payload in bytes.
    pub fn frame_size(&self) -> usize {
        self.pixel_layout.frame_size(self.width, self.height)
    }

    pub fn descriptor(&self) -> FrameFormat {
        FrameFormat {
            width: self.width,
            height: self.height,
            layout: self.pixel_layout,
        }
    }
}

impl fmt::Display for CameraFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{}/{} {}",
            self.width, self.height, self.framerate_numer, self.framerate_denom, self.pixel_layout
        )
    }
}

/// Format descriptor carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
}

struct FrameInner {
    /// Presentation timestamp, nanoseconds on the pipeline clock.
    pts: u64,
    /// Capture sequence number, monotonically increasing per source.
    seq: u64,
    format: FrameFormat,
    pixels: Bytes,
}

/// An immutable, reference-counted video frame.
///
/// Cloning bumps a refcount; the pixel payload is never duplicated when a
/// frame is shared between the tee, a ring buffer and the compositor. The
/// last clone to drop releases the payload, on whichever thread that is.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameInner>,
}

impl Frame {
    pub fn new(pts: u64, seq: u64, format: FrameFormat, pixels: Bytes) -> Self {
        Frame {
            inner: Arc::new(FrameInner {
                pts,
                seq,
                format,
                pixels,
            }),
        }
    }

    pub fn pts(&self) -> u64 {
        self.inner.pts
    }

    pub fn seq(&self) -> u64 {
        self.inner.seq
    }

    pub fn format(&self) -> FrameFormat {
        self.inner.format
    }

    pub fn pixels(&self) -> &Bytes {
        &self.inner.pixels
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.pixels.len()
    }

    /// A copy of this frame re-stamped with a new presentation timestamp.
    ///
    /// The pixel payload is shared, not copied. Playback bins use this to
    /// put looped frames on the common pipeline timeline.
    pub fn retimed(&self, pts: u64) -> Frame {
        Frame {
            inner: Arc::new(FrameInner {
                pts,
                seq: self.inner.seq,
                format: self.inner.format,
                pixels: self.inner.pixels.clone(),
            }),
        }
    }

    /// Identity comparison: do both handles refer to the same capture?
    ///
    /// Frame equality is by identity, not pixel value; a retimed copy still
    /// counts as the same capture.
    pub fn same_capture(&self, other: &Frame) -> bool {
        self.inner.seq == other.inner.seq
            && self.inner.pixels.as_ptr() == other.inner.pixels.as_ptr()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("pts", &self.inner.pts)
            .field("seq", &self.inner.seq)
            .field("format", &self.inner.format)
            .field("bytes", &self.inner.pixels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_frame(pts: u64, seq: u64) -> Frame {
        let format = FrameFormat {
            width: 4,
            height: 2,
            layout: PixelLayout::Rgb,
        };
        Frame::new(pts, seq, format, Bytes::from(vec![seq as u8; 24]))
    }

    #[test]
    fn retimed_shares_pixels() {
        let frame = test_frame(100, 7);
        let retimed = frame.retimed(9_999);

        assert_eq!(retimed.pts(), 9_999);
        assert_eq!(retimed.seq(), 7);
        assert!(frame.same_capture(&retimed));
        // Zero-copy: both handles point at the same allocation.
        assert_eq!(frame.pixels().as_ptr(), retimed.pixels().as_ptr());
    }

    #[test]
    fn identity_not_value_equality() {
        let a = test_frame(0, 1);
        let b = test_frame(0, 1);
        // Same bytes, different captures.
        assert_eq!(a.pixels(), b.pixels());
        assert!(!a.same_capture(&b));
    }

    #[test]
    fn frame_sizes_per_layout() {
        assert_eq!(PixelLayout::Nv12.frame_size(1920, 1080), 3_110_400);
        assert_eq!(PixelLayout::Bgrx.frame_size(3200, 180), 2_304_000);
        assert_eq!(PixelLayout::Rgb.frame_size(3200, 180), 1_728_000);
    }

    #[test]
    fn frame_interval_is_exact_for_30fps() {
        let format = CameraFormat::new(1280, 720, 30, PixelLayout::Nv12);
        assert_eq!(format.frame_interval(), Duration::from_nanos(33_333_333));
    }
}
