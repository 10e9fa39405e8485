use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::EngineError;
use crate::frame::{CameraFormat, PixelLayout};

/// Deterministic 30 fps test source.
///
/// Synthesizes a colour ramp: every frame is filled with a value derived
/// from its sequence number, so any two frames from one session are
/// distinguishable by payload as well as by sequence. The stand-in for a
/// hardware backend in headless runs and in every pipeline test.
pub struct SyntheticCamera {
    connected: Arc<AtomicBool>,
    max_width: Option<u32>,
    frames_produced: u64,
}

impl SyntheticCamera {
    pub fn new() -> Self {
        SyntheticCamera {
            connected: Arc::new(AtomicBool::new(true)),
            max_width: None,
            frames_produced: 0,
        }
    }

    /// Device that only supports modes up to `width` pixels wide, for
    /// exercising negotiation fallback to the smaller candidates.
    pub fn with_max_width(width: u32) -> Self {
        SyntheticCamera {
            connected: Arc::new(AtomicBool::new(true)),
            max_width: Some(width),
            frames_produced: 0,
        }
    }

    /// Handle for simulating cable pulls from a test.
    pub fn plug(&self) -> CameraPlug {
        CameraPlug {
            connected: Arc::clone(&self.connected),
        }
    }
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl super::CameraDevice for SyntheticCamera {
    fn name(&self) -> &str {
        "synthetic-ramp"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn supports(&self, format: &CameraFormat) -> bool {
        // Any NV12 mode can be synthesized, subject to the width cap.
        format.pixel_layout == PixelLayout::Nv12
            && self.max_width.map_or(true, |max| format.width <= max)
    }

    fn reopen(&mut self) -> Result<(), EngineError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(EngineError::CameraDisconnected(
                "synthetic device is unplugged".into(),
            ))
        }
    }

    fn read_frame(&mut self, format: &CameraFormat) -> Result<Bytes, EngineError> {
        if !self.is_connected() {
            return Err(EngineError::CameraDisconnected(
                "synthetic device is unplugged".into(),
            ));
        }

        // Ramp value cycles through the byte range; uniqueness across a
        // session comes from the sequence number stamped by the source.
        let ramp = (self.frames_produced % 251) as u8;
        self.frames_produced += 1;
        Ok(Bytes::from(vec![ramp; format.frame_size()]))
    }
}

/// Clonable connect/disconnect switch for a synthetic camera.
#[derive(Clone)]
pub struct CameraPlug {
    connected: Arc<AtomicBool>,
}

impl CameraPlug {
    pub fn unplug(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn replug(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraDevice;

    #[test]
    fn ramp_varies_across_frames() {
        let mut camera = SyntheticCamera::new();
        let format = CameraFormat::new(16, 8, 30, PixelLayout::Nv12);

        let a = camera.read_frame(&format).unwrap();
        let b = camera.read_frame(&format).unwrap();
        assert_eq!(a.len(), format.frame_size());
        assert_ne!(a[0], b[0]);
    }

    #[test]
    fn unplugged_camera_refuses_frames() {
        let mut camera = SyntheticCamera::new();
        let plug = camera.plug();
        let format = CameraFormat::new(16, 8, 30, PixelLayout::Nv12);

        plug.unplug();
        assert!(!camera.is_connected());
        assert!(camera.read_frame(&format).is_err());
        assert!(camera.reopen().is_err());

        plug.replug();
        assert!(camera.reopen().is_ok());
        assert!(camera.read_frame(&format).is_ok());
    }
}
