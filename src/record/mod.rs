mod ring_buffer;

pub use ring_buffer::RingBuffer;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::budget::MemoryBudget;
use crate::cell::CellId;
use crate::error::{EngineError, ErrorCategory};
use crate::event::{EventBus, PipelineEvent};
use crate::tee::CaptureTee;

/// A live recording branch for one cell.
///
/// Created on key-down: reserves the ring buffer's worst case against the
/// memory budget, attaches a branch to the tee and drains it into the ring
/// from a dedicated thread. On key-up the branch is detached; the drain
/// thread finishes appending whatever was already queued, then publishes
/// the frozen buffer as a RecordDrained event. The controller never waits
/// on any of this.
#[derive(Debug)]
pub struct RecordBin {
    cell: CellId,
    generation: u64,
    worker: Option<JoinHandle<()>>,
    detached: bool,
}

impl RecordBin {
    pub fn start(
        cell: CellId,
        generation: u64,
        capacity: usize,
        frame_bytes: usize,
        tee: &CaptureTee,
        budget: &Arc<MemoryBudget>,
        bus: EventBus,
    ) -> Result<RecordBin, EngineError> {
        // Reserve before touching the tee so a refused start leaves no
        // branch behind.
        let reservation = MemoryBudget::reserve(budget, capacity as u64 * frame_bytes as u64)?;
        let rx = tee.attach(cell, capacity)?;

        let worker = thread::Builder::new()
            .name(format!("record-cell-{cell}"))
            .spawn(move || {
                let mut ring = RingBuffer::with_reservation(capacity, reservation);
                let mut warned = false;

                // Runs until the tee drops our sender on detach; every
                // frame accepted before that is appended first.
                while let Ok(frame) = rx.recv() {
                    if ring.append(frame) && !warned {
                        warned = true;
                        bus.warning(
                            ErrorCategory::RecordingBufferFull,
                            "record-bin",
                            format!("cell {cell} recording exceeded {capacity} frames, dropping oldest"),
                        );
                    }
                }

                if ring.overflow_count() > 0 {
                    warn!(
                        cell = %cell,
                        overflow = ring.overflow_count(),
                        retained = ring.len(),
                        "recording overflowed, retained most recent frames"
                    );
                }
                debug!(cell = %cell, frames = ring.len(), "record branch drained");

                bus.post(PipelineEvent::RecordDrained {
                    cell,
                    generation,
                    buffer: Arc::new(ring),
                });
            })
            .map_err(|e| EngineError::Internal(format!("failed to spawn record drain: {e}")))?;

        info!(cell = %cell, generation, capacity, "recording started");
        Ok(RecordBin {
            cell,
            generation,
            worker: Some(worker),
            detached: false,
        })
    }

    pub fn cell(&self) -> CellId {
        self.cell
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Detach the branch from the tee. Non-blocking: the drain thread
    /// finishes appending queued frames and posts RecordDrained when done.
    pub fn stop(&mut self, tee: &CaptureTee) {
        if !self.detached {
            self.detached = true;
            tee.detach(self.cell);
            info!(cell = %self.cell, generation = self.generation, "recording stopping");
        }
    }

    /// Detach and discard. The drain thread still posts its terminal
    /// event; the controller drops it on the generation mismatch.
    pub fn abort(mut self, tee: &CaptureTee) {
        self.stop(tee);
        debug!(cell = %self.cell, "recording aborted");
    }
}

impl Drop for RecordBin {
    fn drop(&mut self) {
        // The drain thread exits on its own once the tee sender is gone;
        // detach from the tee must already have happened via stop/abort.
        if let Some(worker) = self.worker.take() {
            if !self.detached {
                warn!(cell = %self.cell, "record bin dropped while still attached");
            }
            drop(worker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::frame::{Frame, FrameFormat, PixelLayout};
    use bytes::Bytes;
    use std::time::Duration;

    fn frame(seq: u64) -> Frame {
        let format = FrameFormat {
            width: 2,
            height: 2,
            layout: PixelLayout::Rgb,
        };
        Frame::new(seq * 33, seq, format, Bytes::from(vec![0u8; 12]))
    }

    async fn wait_for_drained(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<PipelineEvent>,
    ) -> (CellId, u64, Arc<RingBuffer>) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for RecordDrained")
                .expect("bus closed");
            if let PipelineEvent::RecordDrained {
                cell,
                generation,
                buffer,
            } = event
            {
                return (cell, generation, buffer);
            }
        }
    }

    #[tokio::test]
    async fn frames_before_stop_all_reach_the_buffer() {
        let (bus, mut rx) = EventBus::channel();
        let budget = MemoryBudget::new(1 << 20, bus.clone());
        let tee = CaptureTee::new(4);
        let cell = CellId::new(5).unwrap();

        let mut bin = RecordBin::start(cell, 1, 16, 12, &tee, &budget, bus).unwrap();
        for seq in 0..10 {
            tee.publish(frame(seq));
        }
        bin.stop(&tee);

        let (drained_cell, generation, buffer) = wait_for_drained(&mut rx).await;
        assert_eq!(drained_cell, cell);
        assert_eq!(generation, 1);
        assert_eq!(buffer.sequences(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn overflow_retains_tail_and_warns_once() {
        let (bus, mut rx) = EventBus::channel();
        let budget = MemoryBudget::new(1 << 20, bus.clone());
        let tee = CaptureTee::new(4);
        let cell = CellId::new(2).unwrap();

        let mut bin = RecordBin::start(cell, 1, 3, 12, &tee, &budget, bus).unwrap();
        for seq in 0..9 {
            tee.publish(frame(seq));
            // Let the drain keep up so the branch queue itself never fills.
            std::thread::sleep(Duration::from_millis(2));
        }
        bin.stop(&tee);

        let mut warnings = 0;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out")
                .expect("bus closed");
            match event {
                PipelineEvent::Error(record) => {
                    assert_eq!(record.category, ErrorCategory::RecordingBufferFull);
                    warnings += 1;
                }
                PipelineEvent::RecordDrained { buffer, .. } => {
                    assert_eq!(buffer.sequences(), vec![6, 7, 8]);
                    assert_eq!(buffer.overflow_count(), 6);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn refused_start_leaves_no_branch_on_the_tee() {
        let (bus, _rx) = EventBus::channel();
        let budget = MemoryBudget::new(10, bus.clone());
        let tee = CaptureTee::new(4);
        let cell = CellId::new(7).unwrap();

        let err = RecordBin::start(cell, 1, 16, 12, &tee, &budget, bus).unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted { .. }));

        // The cell can attach later once budget frees up.
        assert!(tee.attach(cell, 4).is_ok());
        assert_eq!(budget.reserved_bytes(), 0);
    }
}
