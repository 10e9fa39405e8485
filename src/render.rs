use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::clock::PipelineClock;
use crate::compositor::{CompositeFrame, Compositor};
use crate::config::GRID_CELLS;
use crate::error::{EngineError, ErrorRecord};
use crate::event::EventBus;
use crate::frame::PixelLayout;
use crate::monitor::FrameMonitor;
use crate::tee::CaptureTee;

/// Opaque host window surface. Bound once at startup and never resized or
/// touched by anything but the renderer's presentation thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceHandle(u64);

impl SurfaceHandle {
    pub fn new(raw: u64) -> Self {
        SurfaceHandle(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Clock-synchronised sink presenting composited frames to the surface.
///
/// Implementations run entirely on the presentation thread once the
/// pipeline is playing. The offscreen implementation below keeps the
/// whole engine testable without a display.
pub trait Renderer: Send {
    fn name(&self) -> &'static str;

    /// Pixel layouts this sink can take, for output caps negotiation.
    fn supported_layouts(&self) -> Vec<PixelLayout>;

    fn bind_surface(&mut self, surface: &SurfaceHandle) -> Result<(), EngineError>;

    fn present(&mut self, frame: &CompositeFrame) -> Result<(), EngineError>;
}

/// Per-tick record of which capture ended up in each slot.
pub type SlotSnapshot = [Option<u64>; GRID_CELLS];

/// Shared observation point on an offscreen renderer.
#[derive(Clone)]
pub struct RenderTap {
    presented: Arc<AtomicU64>,
    history: Arc<Mutex<Vec<SlotSnapshot>>>,
}

impl RenderTap {
    pub fn presented(&self) -> u64 {
        self.presented.load(Ordering::SeqCst)
    }

    /// Slot history recorded so far (capture sequence numbers).
    pub fn history(&self) -> Vec<SlotSnapshot> {
        self.history.lock().clone()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }
}

/// Headless sink: accepts BGRx and RGB, counts presentations, and when
/// tapped records which capture each slot showed on every tick.
pub struct OffscreenRenderer {
    bound: bool,
    presented: Arc<AtomicU64>,
    tap: Option<Arc<Mutex<Vec<SlotSnapshot>>>>,
}

impl OffscreenRenderer {
    pub fn new() -> Self {
        OffscreenRenderer {
            bound: false,
            presented: Arc::new(AtomicU64::new(0)),
            tap: None,
        }
    }

    /// Enable slot recording and return the observation handle.
    pub fn tapped(mut self) -> (Self, RenderTap) {
        let history = Arc::new(Mutex::new(Vec::new()));
        self.tap = Some(Arc::clone(&history));
        let tap = RenderTap {
            presented: Arc::clone(&self.presented),
            history,
        };
        (self, tap)
    }
}

impl Default for OffscreenRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for OffscreenRenderer {
    fn name(&self) -> &'static str {
        "offscreen"
    }

    fn supported_layouts(&self) -> Vec<PixelLayout> {
        vec![PixelLayout::Bgrx, PixelLayout::Rgb]
    }

    fn bind_surface(&mut self, surface: &SurfaceHandle) -> Result<(), EngineError> {
        debug!(raw = surface.raw(), "offscreen renderer bound to surface");
        self.bound = true;
        Ok(())
    }

    fn present(&mut self, frame: &CompositeFrame) -> Result<(), EngineError> {
        if !self.bound {
            return Err(EngineError::SurfaceUnavailable(
                "present before surface bind".into(),
            ));
        }

        self.presented.fetch_add(1, Ordering::SeqCst);
        if let Some(history) = &self.tap {
            let snapshot: SlotSnapshot =
                std::array::from_fn(|i| frame.slots[i].as_ref().map(|f| f.seq()));
            history.lock().push(snapshot);
        }
        trace!(pts = frame.pts, "frame presented offscreen");
        Ok(())
    }
}

/// Spawn the presentation thread.
///
/// Drives the render cadence from the pipeline clock: wait for the tick's
/// timestamp, pull the newest live frame, compose, present, then notify
/// the monitor exactly once. A late tick is still rendered; the monitor
/// infers the drop from the timestamp gap. The renderer travels into the
/// thread and comes back out through the join handle so a stopped
/// pipeline can restart without rebuilding its sink.
pub fn spawn_presentation(
    clock: Arc<PipelineClock>,
    interval_ns: u64,
    tee: Arc<CaptureTee>,
    compositor: Arc<Mutex<Compositor>>,
    monitor: Arc<FrameMonitor>,
    mut renderer: Box<dyn Renderer>,
    stop: Arc<AtomicBool>,
    bus: EventBus,
) -> std::io::Result<JoinHandle<Box<dyn Renderer>>> {
    thread::Builder::new()
        .name("presentation".into())
        .spawn(move || {
            info!(interval_ns, "presentation thread running");
            let mut next_pts = clock.now() + interval_ns;

            while !stop.load(Ordering::SeqCst) {
                clock.wait_until(next_pts);

                let live = tee.poll_live();
                let composed = compositor.lock().compose(next_pts, live);
                match composed {
                    Ok(frame) => match renderer.present(&frame) {
                        Ok(()) => monitor.on_rendered(clock.now()),
                        Err(err) => {
                            error!(error = %err, "renderer failed, stopping presentation");
                            bus.error(ErrorRecord::from_error(&err, "renderer"));
                            break;
                        }
                    },
                    Err(err) => {
                        // A compose failure is a programming error in the
                        // playback path; surface it and skip the tick.
                        bus.error(ErrorRecord::from_error(&err, "compositor"));
                    }
                }

                next_pts += interval_ns;
                let now = clock.now();
                if next_pts < now {
                    // Fell behind; present the next frame immediately
                    // rather than burning ticks catching up one by one.
                    next_pts = now;
                }
            }

            info!("presentation thread stopped");
            renderer
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::{negotiate_output, GridLayout};
    use crate::frame::{Frame, FrameFormat};
    use bytes::Bytes;

    fn composite(pts: u64, seq: u64) -> CompositeFrame {
        let layout = GridLayout::new(4, 16, 8);
        let caps = negotiate_output(&layout, 120, &[PixelLayout::Bgrx]).unwrap();
        let format = FrameFormat {
            width: 4,
            height: 2,
            layout: PixelLayout::Nv12,
        };
        let mut compositor = Compositor::new(layout, caps);
        compositor
            .compose(pts, Some(Frame::new(pts, seq, format, Bytes::from(vec![0u8; 12]))))
            .unwrap()
    }

    #[test]
    fn present_requires_bound_surface() {
        let mut renderer = OffscreenRenderer::new();
        let frame = composite(0, 0);
        assert!(renderer.present(&frame).is_err());

        renderer.bind_surface(&SurfaceHandle::new(1)).unwrap();
        assert!(renderer.present(&frame).is_ok());
    }

    #[test]
    fn tap_records_slot_contents() {
        let (mut renderer, tap) = OffscreenRenderer::new().tapped();
        renderer.bind_surface(&SurfaceHandle::new(1)).unwrap();

        renderer.present(&composite(0, 5)).unwrap();
        renderer.present(&composite(100, 6)).unwrap();

        assert_eq!(tap.presented(), 2);
        let history = tap.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0][0], Some(5));
        assert_eq!(history[1][0], Some(6));
        // Nothing bound to the recordable slots.
        assert!(history[0][1..].iter().all(Option::is_none));
    }
}
