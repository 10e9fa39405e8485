use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cell::CellId;
use crate::error::EngineError;
use crate::frame::Frame;
use crate::record::RingBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Stateful position walking a ring buffer forward then backward.
///
/// For N frames the emitted index sequence is 0,1,..,N-1,N-2,..,1,0,1,..;
/// the terminal indices appear exactly once per half-cycle. For N = 1 the
/// cursor is constant.
#[derive(Debug)]
pub struct PalindromeCursor {
    len: usize,
    index: usize,
    direction: Direction,
}

impl PalindromeCursor {
    /// Cursor over a buffer of `len` frames. `len` must be non-zero: a
    /// playback bin is never instantiated over an empty buffer.
    pub fn new(len: usize) -> Result<Self, EngineError> {
        if len == 0 {
            return Err(EngineError::Internal(
                "palindrome cursor over empty buffer".into(),
            ));
        }
        Ok(PalindromeCursor {
            len,
            index: 0,
            direction: Direction::Forward,
        })
    }

    /// Index to emit this tick; the cursor then advances.
    pub fn step(&mut self) -> usize {
        let emitted = self.index;
        self.advance();
        emitted
    }

    fn advance(&mut self) {
        if self.len == 1 {
            return;
        }
        match self.direction {
            Direction::Forward => {
                if self.index + 1 == self.len {
                    self.direction = Direction::Reverse;
                    self.index -= 1;
                } else {
                    self.index += 1;
                }
            }
            Direction::Reverse => {
                if self.index == 0 {
                    self.direction = Direction::Forward;
                    self.index = 1;
                } else {
                    self.index -= 1;
                }
            }
        }
    }
}

/// Drives one cell's compositor slot from its frozen ring buffer.
///
/// Each render tick pulls the cursor's frame and re-stamps it with the
/// pipeline-clock timestamp, so loops and the live feed share one
/// timeline. Tearing a bin down does not touch the buffer; a new bin over
/// the same buffer starts the palindrome from the beginning.
pub struct PlaybackBin {
    cell: CellId,
    buffer: Arc<RingBuffer>,
    cursor: Mutex<PalindromeCursor>,
}

impl PlaybackBin {
    pub fn new(cell: CellId, buffer: Arc<RingBuffer>) -> Result<Arc<Self>, EngineError> {
        let cursor = PalindromeCursor::new(buffer.len())?;
        debug!(cell = %cell, frames = buffer.len(), "playback bin created");
        Ok(Arc::new(PlaybackBin {
            cell,
            buffer,
            cursor: Mutex::new(cursor),
        }))
    }

    pub fn cell(&self) -> CellId {
        self.cell
    }

    pub fn buffer(&self) -> &Arc<RingBuffer> {
        &self.buffer
    }

    /// Frame for one render tick, restamped to `pts`.
    pub fn next_frame(&self, pts: u64) -> Result<Frame, EngineError> {
        let index = self.cursor.lock().step();
        let frame = self.buffer.get(index).ok_or_else(|| {
            EngineError::Internal(format!(
                "cursor index {index} out of range for cell {} buffer of {}",
                self.cell,
                self.buffer.len()
            ))
        })?;
        Ok(frame.retimed(pts))
    }

    /// Presentation ticks for one full loop of a buffer of `len` frames:
    /// every frame twice per cycle except the two ends.
    pub fn period_ticks(len: usize) -> usize {
        if len < 2 {
            1
        } else {
            2 * (len - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameFormat, PixelLayout};
    use bytes::Bytes;
    use rstest::rstest;

    fn buffer_of(len: usize) -> Arc<RingBuffer> {
        let format = FrameFormat {
            width: 2,
            height: 2,
            layout: PixelLayout::Rgb,
        };
        let mut ring = RingBuffer::unbudgeted(len);
        for seq in 0..len as u64 {
            ring.append(Frame::new(seq, seq, format, Bytes::from(vec![0u8; 12])));
        }
        Arc::new(ring)
    }

    #[test]
    fn cursor_walks_palindrome_without_repeating_ends() {
        let mut cursor = PalindromeCursor::new(4).unwrap();
        let emitted: Vec<usize> = (0..12).map(|_| cursor.step()).collect();
        assert_eq!(emitted, vec![0, 1, 2, 3, 2, 1, 0, 1, 2, 3, 2, 1]);
    }

    #[test]
    fn single_frame_cursor_is_constant() {
        let mut cursor = PalindromeCursor::new(1).unwrap();
        assert!((0..5).all(|_| cursor.step() == 0));
    }

    #[test]
    fn empty_buffer_is_rejected() {
        assert!(PalindromeCursor::new(0).is_err());
    }

    #[rstest]
    #[case(2)]
    #[case(3)]
    #[case(7)]
    fn terminal_indices_once_per_half_cycle(#[case] len: usize) {
        let mut cursor = PalindromeCursor::new(len).unwrap();
        let period = PlaybackBin::period_ticks(len);

        // Two full cycles: bounds hold throughout, ends are not doubled.
        let emitted: Vec<usize> = (0..period * 2).map(|_| cursor.step()).collect();
        assert!(emitted.iter().all(|&i| i < len));

        for cycle in emitted.chunks(period) {
            assert_eq!(cycle.iter().filter(|&&i| i == 0).count(), 1);
            assert_eq!(cycle.iter().filter(|&&i| i == len - 1).count(), 1);
        }
    }

    #[test]
    fn playback_restamps_without_copying() {
        let buffer = buffer_of(3);
        let bin = PlaybackBin::new(CellId::new(6).unwrap(), Arc::clone(&buffer)).unwrap();

        let first = bin.next_frame(5_000).unwrap();
        assert_eq!(first.pts(), 5_000);
        assert_eq!(first.seq(), 0);
        assert!(first.same_capture(buffer.get(0).unwrap()));

        let second = bin.next_frame(5_100).unwrap();
        assert_eq!(second.seq(), 1);
    }

    #[test]
    fn one_period_covers_every_buffered_frame() {
        let buffer = buffer_of(5);
        let bin = PlaybackBin::new(CellId::new(2).unwrap(), Arc::clone(&buffer)).unwrap();

        let mut seen = std::collections::HashSet::new();
        for tick in 0..PlaybackBin::period_ticks(5) {
            let frame = bin.next_frame(tick as u64 * 100).unwrap();
            seen.insert(frame.seq());
        }
        assert_eq!(seen.len(), 5);
    }
}
