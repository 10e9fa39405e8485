use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::cell::CellId;
use crate::error::EngineError;
use crate::frame::Frame;

/// Fan-out point between the camera and everything downstream.
///
/// Every captured frame goes to the live branch (a small leaky-downstream
/// queue the presentation thread drains) and to each attached record
/// branch (never-drop, bounded). Publishing only bumps refcounts; pixel
/// data is shared, never copied.
///
/// One lock covers branch membership and the live queue, so attaching or
/// detaching a record branch is atomic with respect to frame flow and can
/// never cost the live branch a frame.
pub struct CaptureTee {
    inner: Mutex<TeeInner>,
    live_capacity: usize,
}

struct TeeInner {
    live: VecDeque<Frame>,
    live_dropped: u64,
    branches: HashMap<CellId, RecordBranch>,
}

struct RecordBranch {
    tx: SyncSender<Frame>,
    overruns: u64,
}

/// Counters for the periodic stats line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TeeStats {
    pub live_dropped: u64,
    pub active_branches: usize,
}

impl CaptureTee {
    pub fn new(live_capacity: usize) -> Self {
        CaptureTee {
            inner: Mutex::new(TeeInner {
                live: VecDeque::with_capacity(live_capacity + 1),
                live_dropped: 0,
                branches: HashMap::new(),
            }),
            live_capacity,
        }
    }

    /// Broadcast one captured frame. Called only by the capture thread and
    /// guaranteed not to block: the live queue drops its oldest entry when
    /// full, and a full record branch is counted as an overrun rather than
    /// waited on.
    pub fn publish(&self, frame: Frame) {
        let mut inner = self.inner.lock();

        for (cell, branch) in inner.branches.iter_mut() {
            match branch.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    branch.overruns += 1;
                    if branch.overruns == 1 {
                        warn!(cell = %cell, "record branch queue full, frame missed");
                    } else {
                        trace!(cell = %cell, overruns = branch.overruns, "record branch overrun");
                    }
                }
                // Drain side is gone; the branch will be detached by the
                // controller shortly. Nothing to do here.
                Err(TrySendError::Disconnected(_)) => {}
            }
        }

        if inner.live.len() == self.live_capacity {
            inner.live.pop_front();
            inner.live_dropped += 1;
        }
        inner.live.push_back(frame);
    }

    /// Most recent live frame, discarding anything older queued behind it.
    /// Returns None when no new frame arrived since the last poll.
    pub fn poll_live(&self) -> Option<Frame> {
        let mut inner = self.inner.lock();
        let latest = inner.live.pop_back();
        inner.live.clear();
        latest
    }

    /// Attach a record branch for `cell`. The receiver is handed to the
    /// record bin's drain thread; the queue never drops on the consumer
    /// side and is sized for the full ring-buffer target.
    pub fn attach(&self, cell: CellId, queue_capacity: usize) -> Result<Receiver<Frame>, EngineError> {
        let mut inner = self.inner.lock();
        if inner.branches.contains_key(&cell) {
            return Err(EngineError::Internal(format!(
                "record branch for cell {cell} already attached"
            )));
        }

        let (tx, rx) = sync_channel(queue_capacity);
        inner.branches.insert(cell, RecordBranch { tx, overruns: 0 });
        debug!(cell = %cell, queue_capacity, "record branch attached");
        Ok(rx)
    }

    /// Detach the record branch for `cell`. Dropping the sender lets the
    /// drain side consume whatever is still queued and then observe
    /// end-of-branch; frames already accepted are never lost.
    pub fn detach(&self, cell: CellId) -> bool {
        let mut inner = self.inner.lock();
        match inner.branches.remove(&cell) {
            Some(branch) => {
                debug!(cell = %cell, overruns = branch.overruns, "record branch detached");
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> TeeStats {
        let inner = self.inner.lock();
        TeeStats {
            live_dropped: inner.live_dropped,
            active_branches: inner.branches.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameFormat, PixelLayout};
    use bytes::Bytes;

    fn frame(seq: u64) -> Frame {
        let format = FrameFormat {
            width: 2,
            height: 2,
            layout: PixelLayout::Rgb,
        };
        Frame::new(seq * 100, seq, format, Bytes::from(vec![0u8; 12]))
    }

    #[test]
    fn live_queue_drops_oldest_when_full() {
        let tee = CaptureTee::new(3);
        for seq in 0..5 {
            tee.publish(frame(seq));
        }

        // Latest survives; seq 0 and 1 were dropped.
        let latest = tee.poll_live().unwrap();
        assert_eq!(latest.seq(), 4);
        assert_eq!(tee.stats().live_dropped, 2);

        // Queue fully drained by the poll.
        assert!(tee.poll_live().is_none());
    }

    #[test]
    fn record_branch_receives_every_frame_in_order() {
        let tee = CaptureTee::new(3);
        let cell = CellId::new(4).unwrap();
        let rx = tee.attach(cell, 16).unwrap();

        for seq in 0..6 {
            tee.publish(frame(seq));
        }
        tee.detach(cell);

        let received: Vec<u64> = rx.iter().map(|f| f.seq()).collect();
        assert_eq!(received, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn duplicate_attach_is_refused() {
        let tee = CaptureTee::new(3);
        let cell = CellId::new(2).unwrap();
        let _rx = tee.attach(cell, 4).unwrap();
        assert!(tee.attach(cell, 4).is_err());
    }

    #[test]
    fn full_record_branch_never_blocks_publish_or_live() {
        let tee = CaptureTee::new(8);
        let cell = CellId::new(3).unwrap();
        // Tiny queue, no consumer: fills immediately.
        let _rx = tee.attach(cell, 2).unwrap();

        for seq in 0..5 {
            tee.publish(frame(seq));
        }

        // Live branch unaffected by the stalled record branch.
        assert_eq!(tee.poll_live().unwrap().seq(), 4);
    }

    #[test]
    fn detach_of_unknown_cell_is_a_noop() {
        let tee = CaptureTee::new(3);
        assert!(!tee.detach(CellId::new(9).unwrap()));
    }
}
