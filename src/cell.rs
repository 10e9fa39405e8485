use std::fmt;

/// Identifier of one grid cell, 1..=10. Cell 1 is the live feed; cells
/// 2..=10 are recordable and map to keys 1..=9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u8);

impl CellId {
    pub const LIVE: CellId = CellId(1);

    pub fn new(index: u8) -> Option<CellId> {
        (1..=10).contains(&index).then_some(CellId(index))
    }

    /// Cell owning key `key` (1..=9), or None for out-of-range codes.
    pub fn from_key(key: u8) -> Option<CellId> {
        (1..=9).contains(&key).then(|| CellId(key + 1))
    }

    pub fn index(&self) -> u8 {
        self.0
    }

    /// Compositor slot, zero-based left to right.
    pub fn slot(&self) -> usize {
        self.0 as usize - 1
    }

    pub fn is_recordable(&self) -> bool {
        self.0 >= 2
    }

    /// All recordable cells, left to right.
    pub fn recordable() -> impl Iterator<Item = CellId> {
        (2..=10).map(CellId)
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key press/release from the host input source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    Down(u8),
    Up(u8),
}

/// Phase of a recordable cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellPhase {
    Empty,
    Recording,
    Stopping,
    Playing,
}

/// Input to the per-cell transition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellEvent {
    KeyDown,
    KeyUp,
    DrainComplete,
    Fatal,
}

/// Side effect the controller must perform for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellAction {
    /// Allocate a ring buffer and attach a record branch.
    StartRecording,
    /// Detach the record branch and let it drain.
    StopRecording,
    /// Tear down playback and the old buffer, then start recording.
    ResetThenRecord,
    /// Bind the drained buffer to a fresh playback bin.
    StartPlayback,
    /// Free whatever the cell holds.
    Teardown,
    /// Idempotent event; no work.
    Ignore,
}

/// The allowed-transition table for cells 2..=10, as a pure function.
///
/// Auto-repeat key-downs while recording and key-ups on idle cells fall
/// out as Ignore rows rather than special cases in the controller.
pub fn transition(phase: CellPhase, event: CellEvent) -> (CellPhase, CellAction) {
    use CellAction::*;
    use CellEvent::*;
    use CellPhase::*;

    match (phase, event) {
        (Empty, KeyDown) => (Recording, StartRecording),
        (Empty, KeyUp) => (Empty, Ignore),
        (Empty, DrainComplete) => (Empty, Ignore),

        (Recording, KeyDown) => (Recording, Ignore),
        (Recording, KeyUp) => (Stopping, StopRecording),
        (Recording, DrainComplete) => (Recording, Ignore),

        (Stopping, KeyDown) => (Stopping, Ignore),
        (Stopping, KeyUp) => (Stopping, Ignore),
        (Stopping, DrainComplete) => (Playing, StartPlayback),

        (Playing, KeyDown) => (Recording, ResetThenRecord),
        (Playing, KeyUp) => (Playing, Ignore),
        (Playing, DrainComplete) => (Playing, Ignore),

        (_, Fatal) => (Empty, Teardown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn key_to_cell_mapping() {
        assert_eq!(CellId::from_key(1), CellId::new(2));
        assert_eq!(CellId::from_key(9), CellId::new(10));
        assert_eq!(CellId::from_key(0), None);
        assert_eq!(CellId::from_key(10), None);
    }

    #[test]
    fn live_cell_is_not_recordable() {
        assert!(!CellId::LIVE.is_recordable());
        assert_eq!(CellId::recordable().count(), 9);
        assert!(CellId::recordable().all(|c| c.is_recordable()));
    }

    #[rstest]
    #[case(CellPhase::Empty, CellEvent::KeyDown, CellPhase::Recording, CellAction::StartRecording)]
    #[case(CellPhase::Recording, CellEvent::KeyUp, CellPhase::Stopping, CellAction::StopRecording)]
    #[case(CellPhase::Stopping, CellEvent::DrainComplete, CellPhase::Playing, CellAction::StartPlayback)]
    #[case(CellPhase::Playing, CellEvent::KeyDown, CellPhase::Recording, CellAction::ResetThenRecord)]
    fn happy_path_transitions(
        #[case] phase: CellPhase,
        #[case] event: CellEvent,
        #[case] want_phase: CellPhase,
        #[case] want_action: CellAction,
    ) {
        assert_eq!(transition(phase, event), (want_phase, want_action));
    }

    #[rstest]
    #[case(CellPhase::Empty, CellEvent::KeyUp)]
    #[case(CellPhase::Recording, CellEvent::KeyDown)] // auto-repeat suppression
    #[case(CellPhase::Playing, CellEvent::KeyUp)]
    #[case(CellPhase::Stopping, CellEvent::KeyDown)]
    fn ignored_events_leave_phase_unchanged(#[case] phase: CellPhase, #[case] event: CellEvent) {
        let (next, action) = transition(phase, event);
        assert_eq!(next, phase);
        assert_eq!(action, CellAction::Ignore);
    }

    #[rstest]
    #[case(CellPhase::Empty)]
    #[case(CellPhase::Recording)]
    #[case(CellPhase::Stopping)]
    #[case(CellPhase::Playing)]
    fn fatal_always_returns_to_empty(#[case] phase: CellPhase) {
        assert_eq!(
            transition(phase, CellEvent::Fatal),
            (CellPhase::Empty, CellAction::Teardown)
        );
    }
}
