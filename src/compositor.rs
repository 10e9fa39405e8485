use std::sync::Arc;

use tracing::{debug, info};

use crate::cell::CellId;
use crate::config::GRID_CELLS;
use crate::error::EngineError;
use crate::frame::{Frame, PixelLayout};
use crate::playback::PlaybackBin;

/// Composited output format, pinned before the renderer starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputCaps {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub fps_numer: u32,
    pub fps_denom: u32,
}

/// Fixed placement of one slot inside the output strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRect {
    pub xpos: u32,
    pub ypos: u32,
    pub width: u32,
    pub height: u32,
    pub zorder: u32,
}

/// The grid's geometry: ten equal cells side by side, cell height chosen
/// so the camera aspect ratio is preserved across the strip.
#[derive(Debug, Clone)]
pub struct GridLayout {
    pub cell_width: u32,
    pub cell_height: u32,
    pub rects: [SlotRect; GRID_CELLS],
}

impl GridLayout {
    pub fn new(cell_width: u32, camera_width: u32, camera_height: u32) -> Self {
        let cell_height = (cell_width as u64 * camera_height as u64 / camera_width.max(1) as u64)
            .max(1) as u32;
        let rects = std::array::from_fn(|slot| SlotRect {
            xpos: slot as u32 * cell_width,
            ypos: 0,
            width: cell_width,
            height: cell_height,
            zorder: slot as u32,
        });
        GridLayout {
            cell_width,
            cell_height,
            rects,
        }
    }

    pub fn strip_width(&self) -> u32 {
        self.cell_width * GRID_CELLS as u32
    }
}

/// Pick the output pixel layout the renderer can take, preferring the
/// packed 32-bit layout and falling back to 24-bit RGB.
pub fn negotiate_output(
    layout: &GridLayout,
    target_fps: u32,
    renderer_layouts: &[PixelLayout],
) -> Result<OutputCaps, EngineError> {
    let pixel_layout = [PixelLayout::Bgrx, PixelLayout::Rgb]
        .into_iter()
        .find(|candidate| renderer_layouts.contains(candidate))
        .ok_or(EngineError::NegotiationFailed)?;

    let caps = OutputCaps {
        width: layout.strip_width(),
        height: layout.cell_height,
        layout: pixel_layout,
        fps_numer: target_fps,
        fps_denom: 1,
    };
    info!(
        width = caps.width,
        height = caps.height,
        layout = %caps.layout,
        fps = caps.fps_numer,
        "output caps negotiated"
    );
    Ok(caps)
}

/// One composited output frame: per-slot source frames plus the fixed
/// geometry. Pixel payloads are shared with the originating buffers; a
/// renderer blits them into its own target.
#[derive(Debug)]
pub struct CompositeFrame {
    pub pts: u64,
    pub caps: OutputCaps,
    pub layout: Arc<GridLayout>,
    pub slots: [Option<Frame>; GRID_CELLS],
}

impl CompositeFrame {
    pub fn slot(&self, cell: CellId) -> Option<&Frame> {
        self.slots[cell.slot()].as_ref()
    }
}

struct Slot {
    bin: Option<Arc<PlaybackBin>>,
    held: Option<Frame>,
}

/// Ten-slot mixer.
///
/// Slot 1 is fed the latest live frame; slots 2..10 pull from their bound
/// playback bins. A slot with no input this tick holds its last frame, so
/// a cell mid-reset keeps showing something instead of flickering.
pub struct Compositor {
    layout: Arc<GridLayout>,
    caps: OutputCaps,
    slots: [Slot; GRID_CELLS],
}

impl Compositor {
    pub fn new(layout: GridLayout, caps: OutputCaps) -> Self {
        Compositor {
            layout: Arc::new(layout),
            caps,
            slots: std::array::from_fn(|_| Slot {
                bin: None,
                held: None,
            }),
        }
    }

    pub fn caps(&self) -> OutputCaps {
        self.caps
    }

    /// Bind a playback bin to its cell's slot. The live slot is never a
    /// valid target; the live feed has no bin by construction.
    pub fn bind(&mut self, bin: Arc<PlaybackBin>) -> Result<(), EngineError> {
        let cell = bin.cell();
        if !cell.is_recordable() {
            return Err(EngineError::Internal(
                "attempted to bind playback to the live slot".into(),
            ));
        }
        debug!(cell = %cell, "compositor slot bound to playback");
        self.slots[cell.slot()].bin = Some(bin);
        Ok(())
    }

    /// Unbind a cell's slot, keeping the held frame so the slot shows the
    /// last rendered image during the gap.
    pub fn unbind(&mut self, cell: CellId) {
        if self.slots[cell.slot()].bin.take().is_some() {
            debug!(cell = %cell, "compositor slot unbound, holding last frame");
        }
    }

    /// Drop everything a slot holds, including the held frame. Used on
    /// cell teardown so no stale payload outlives its buffer.
    pub fn clear(&mut self, cell: CellId) {
        let slot = &mut self.slots[cell.slot()];
        slot.bin = None;
        slot.held = None;
    }

    pub fn is_bound(&self, cell: CellId) -> bool {
        self.slots[cell.slot()].bin.is_some()
    }

    /// Produce the composited frame for one presentation tick.
    ///
    /// `live` is the newest camera frame since the previous tick, if any;
    /// at 120 fps output over a 30 fps source most ticks re-present held
    /// frames, which is exactly the interpolation contract.
    pub fn compose(
        &mut self,
        pts: u64,
        live: Option<Frame>,
    ) -> Result<CompositeFrame, EngineError> {
        if let Some(frame) = live {
            self.slots[CellId::LIVE.slot()].held = Some(frame);
        }

        for slot in self.slots.iter_mut().skip(1) {
            if let Some(bin) = &slot.bin {
                slot.held = Some(bin.next_frame(pts)?);
            }
        }

        Ok(CompositeFrame {
            pts,
            caps: self.caps,
            layout: Arc::clone(&self.layout),
            slots: std::array::from_fn(|i| self.slots[i].held.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameFormat;
    use crate::record::RingBuffer;
    use bytes::Bytes;

    fn frame(seq: u64) -> Frame {
        let format = FrameFormat {
            width: 2,
            height: 2,
            layout: PixelLayout::Nv12,
        };
        Frame::new(seq, seq, format, Bytes::from(vec![0u8; 6]))
    }

    fn playback_over(cell: CellId, len: usize) -> Arc<PlaybackBin> {
        let mut ring = RingBuffer::unbudgeted(len);
        for seq in 0..len as u64 {
            ring.append(frame(seq));
        }
        PlaybackBin::new(cell, Arc::new(ring)).unwrap()
    }

    fn test_compositor() -> Compositor {
        let layout = GridLayout::new(320, 1920, 1080);
        let caps = negotiate_output(&layout, 120, &[PixelLayout::Bgrx]).unwrap();
        Compositor::new(layout, caps)
    }

    #[test]
    fn layout_preserves_aspect_and_positions() {
        let layout = GridLayout::new(320, 1920, 1080);
        assert_eq!(layout.cell_height, 180);
        assert_eq!(layout.strip_width(), 3200);
        assert_eq!(layout.rects[0].xpos, 0);
        assert_eq!(layout.rects[9].xpos, 9 * 320);
        assert_eq!(layout.rects[9].zorder, 9);
    }

    #[test]
    fn negotiation_prefers_bgrx_over_rgb() {
        let layout = GridLayout::new(320, 1920, 1080);
        let caps =
            negotiate_output(&layout, 120, &[PixelLayout::Rgb, PixelLayout::Bgrx]).unwrap();
        assert_eq!(caps.layout, PixelLayout::Bgrx);

        let fallback = negotiate_output(&layout, 120, &[PixelLayout::Rgb]).unwrap();
        assert_eq!(fallback.layout, PixelLayout::Rgb);

        assert!(negotiate_output(&layout, 120, &[PixelLayout::Nv12]).is_err());
    }

    #[test]
    fn live_slot_holds_last_frame_between_captures() {
        let mut compositor = test_compositor();

        let out = compositor.compose(0, Some(frame(1))).unwrap();
        assert_eq!(out.slot(CellId::LIVE).unwrap().seq(), 1);

        // No new capture this tick: the held frame is re-presented.
        let out = compositor.compose(100, None).unwrap();
        assert_eq!(out.slot(CellId::LIVE).unwrap().seq(), 1);
    }

    #[test]
    fn bound_slot_advances_and_unbound_slot_holds() {
        let mut compositor = test_compositor();
        let cell = CellId::new(3).unwrap();
        compositor.bind(playback_over(cell, 3)).unwrap();

        let first = compositor.compose(0, None).unwrap();
        let second = compositor.compose(100, None).unwrap();
        assert_eq!(first.slot(cell).unwrap().seq(), 0);
        assert_eq!(second.slot(cell).unwrap().seq(), 1);

        compositor.unbind(cell);
        let held = compositor.compose(200, None).unwrap();
        // Holds the last rendered frame, does not keep advancing.
        assert_eq!(held.slot(cell).unwrap().seq(), 1);

        compositor.clear(cell);
        let cleared = compositor.compose(300, None).unwrap();
        assert!(cleared.slot(cell).is_none());
    }

    #[test]
    fn live_slot_refuses_playback_binding() {
        let mut compositor = test_compositor();
        let result = compositor.bind(playback_over(CellId::LIVE, 2));
        assert!(result.is_err());
    }

    #[test]
    fn composited_frames_are_retimed_to_the_tick() {
        let mut compositor = test_compositor();
        let cell = CellId::new(2).unwrap();
        compositor.bind(playback_over(cell, 2)).unwrap();

        let out = compositor.compose(7_777, None).unwrap();
        assert_eq!(out.slot(cell).unwrap().pts(), 7_777);
    }
}
