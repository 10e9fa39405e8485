pub mod synthetic;

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::frame::{CameraFormat, Frame, PixelLayout};

/// Candidate camera modes, in preference order. First supported wins.
pub static CANDIDATE_FORMATS: Lazy<Vec<CameraFormat>> = Lazy::new(|| {
    vec![
        CameraFormat::new(1920, 1080, 30, PixelLayout::Nv12),
        CameraFormat::new(1280, 720, 30, PixelLayout::Nv12),
    ]
});

/// Outcome of a camera-access prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Granted,
    Denied,
    /// The prompt is still unresolved. Treated as denied once the wait
    /// budget runs out.
    Undetermined,
}

/// Host permission prompt. `request_access` may block while the user
/// decides; the engine bounds the wait and treats expiry as denied.
pub trait PermissionService: Send + Sync {
    fn request_access(&self) -> PermissionDecision;
}

/// Permission service that grants immediately (headless and test runs).
pub struct AlwaysGranted;

impl PermissionService for AlwaysGranted {
    fn request_access(&self) -> PermissionDecision {
        PermissionDecision::Granted
    }
}

/// Await the permission prompt once, with a hard timeout.
///
/// The only code path in the process that asks for camera access.
pub async fn request_permission(
    service: Arc<dyn PermissionService>,
    timeout: Duration,
) -> Result<(), EngineError> {
    let prompt = tokio::task::spawn_blocking(move || service.request_access());

    match tokio::time::timeout(timeout, prompt).await {
        Ok(Ok(PermissionDecision::Granted)) => {
            info!("camera access granted");
            Ok(())
        }
        Ok(Ok(decision)) => {
            warn!(?decision, "camera access not granted");
            Err(EngineError::PermissionDenied)
        }
        Ok(Err(join_err)) => Err(EngineError::Internal(format!(
            "permission prompt panicked: {join_err}"
        ))),
        Err(_) => {
            warn!(?timeout, "permission prompt timed out, treating as denied");
            Err(EngineError::PermissionDenied)
        }
    }
}

/// A physical or synthetic capture device behind one narrow interface.
///
/// The engine never talks to camera hardware directly; production backends
/// and the deterministic test source both live behind this trait.
pub trait CameraDevice: Send {
    fn name(&self) -> &str;

    /// Is the device currently present and usable?
    fn is_connected(&self) -> bool;

    /// Does the device support this exact mode?
    fn supports(&self, format: &CameraFormat) -> bool;

    /// Re-open the device handle after a disconnect.
    fn reopen(&mut self) -> Result<(), EngineError>;

    /// Synthesize or fetch the next frame payload in the given mode.
    /// Pacing is the capture loop's job, not the device's.
    fn read_frame(&mut self, format: &CameraFormat) -> Result<bytes::Bytes, EngineError>;
}

/// The frame-producing element at the head of the graph.
///
/// Owns the device, the negotiated format (acting as the downstream caps
/// pin) and the capture sequence counter.
pub struct CameraSource {
    device: Box<dyn CameraDevice>,
    permission: Arc<dyn PermissionService>,
    format: Option<CameraFormat>,
    seq: u64,
}

impl CameraSource {
    pub fn new(device: Box<dyn CameraDevice>, permission: Arc<dyn PermissionService>) -> Self {
        CameraSource {
            device,
            permission,
            format: None,
            seq: 0,
        }
    }

    /// Walk the candidate list and pin the first mode the device reports
    /// as supported.
    pub fn negotiate_format(&mut self) -> Result<CameraFormat, EngineError> {
        if !self.device.is_connected() {
            return Err(EngineError::CameraNotFound);
        }

        for candidate in CANDIDATE_FORMATS.iter() {
            if self.device.supports(candidate) {
                info!(device = %self.device.name(), format = %candidate, "camera format negotiated");
                self.format = Some(*candidate);
                return Ok(*candidate);
            }
        }

        warn!(device = %self.device.name(), "no candidate format supported");
        Err(EngineError::NegotiationFailed)
    }

    pub fn negotiated(&self) -> Option<CameraFormat> {
        self.format
    }

    pub fn is_connected(&self) -> bool {
        self.device.is_connected()
    }

    /// Produce the next frame, stamped with the given pipeline timestamp.
    pub fn capture_frame(&mut self, pts: u64) -> Result<Frame, EngineError> {
        let format = self
            .format
            .ok_or_else(|| EngineError::Internal("capture before negotiation".into()))?;

        let pixels = self.device.read_frame(&format)?;
        let frame = Frame::new(pts, self.seq, format.descriptor(), pixels);
        self.seq += 1;
        Ok(frame)
    }

    /// Recovery path: recheck permission, reopen the device, renegotiate.
    ///
    /// The negotiated format may legitimately change across a reconnect
    /// (a different mode may win), though with a fixed candidate table it
    /// rarely does.
    pub fn reinitialise(&mut self) -> Result<CameraFormat, EngineError> {
        match self.permission.request_access() {
            PermissionDecision::Granted => {}
            _ => return Err(EngineError::PermissionDenied),
        }

        self.device.reopen()?;
        debug!(device = %self.device.name(), "device reopened, renegotiating");
        self.negotiate_format()
    }
}

#[cfg(test)]
mod tests {
    use super::synthetic::SyntheticCamera;
    use super::*;

    #[test]
    fn negotiation_prefers_first_candidate() {
        let mut source = CameraSource::new(
            Box::new(SyntheticCamera::new()),
            Arc::new(AlwaysGranted),
        );
        let format = source.negotiate_format().unwrap();
        assert_eq!(format, CANDIDATE_FORMATS[0]);
    }

    #[test]
    fn negotiation_falls_back_to_smaller_mode() {
        let mut source = CameraSource::new(
            Box::new(SyntheticCamera::with_max_width(1280)),
            Arc::new(AlwaysGranted),
        );
        let format = source.negotiate_format().unwrap();
        assert_eq!(format, CANDIDATE_FORMATS[1]);
        assert_eq!(format.width, 1280);
    }

    #[test]
    fn disconnected_device_reports_not_found() {
        let camera = SyntheticCamera::new();
        let plug = camera.plug();
        plug.unplug();

        let mut source = CameraSource::new(Box::new(camera), Arc::new(AlwaysGranted));
        assert!(matches!(
            source.negotiate_format(),
            Err(EngineError::CameraNotFound)
        ));
    }

    #[test]
    fn capture_stamps_sequence_and_pts() {
        let mut source = CameraSource::new(
            Box::new(SyntheticCamera::new()),
            Arc::new(AlwaysGranted),
        );
        source.negotiate_format().unwrap();

        let a = source.capture_frame(100).unwrap();
        let b = source.capture_frame(200).unwrap();
        assert_eq!(a.seq(), 0);
        assert_eq!(b.seq(), 1);
        assert_eq!(b.pts(), 200);
        assert!(!a.same_capture(&b));
    }

    #[tokio::test]
    async fn permission_timeout_is_denied() {
        struct NeverAnswers;
        impl PermissionService for NeverAnswers {
            fn request_access(&self) -> PermissionDecision {
                std::thread::sleep(Duration::from_secs(5));
                PermissionDecision::Undetermined
            }
        }

        let result = request_permission(Arc::new(NeverAnswers), Duration::from_millis(50)).await;
        assert!(matches!(result, Err(EngineError::PermissionDenied)));
    }
}
