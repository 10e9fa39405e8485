use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{EngineError, ErrorCategory};
use crate::event::EventBus;

/// Fraction of the budget at which a HighMemoryUsage warning is raised.
const WARN_WATERMARK: f64 = 0.8;

/// Process-wide cap on retained frame memory.
///
/// Ring buffers reserve their worst case up front, at recording start; a
/// reservation that would cross the cap is refused with ResourceExhausted
/// so an over-long recording can never degrade the other cells.
pub struct MemoryBudget {
    limit: u64,
    reserved: Mutex<u64>,
    bus: EventBus,
}

impl MemoryBudget {
    pub fn new(limit: u64, bus: EventBus) -> Arc<Self> {
        Arc::new(MemoryBudget {
            limit,
            reserved: Mutex::new(0),
            bus,
        })
    }

    /// Reserve `bytes` against the budget, or fail without reserving.
    pub fn reserve(budget: &Arc<MemoryBudget>, bytes: u64) -> Result<Reservation, EngineError> {
        let mut reserved = budget.reserved.lock();
        let available = budget.limit.saturating_sub(*reserved);
        if bytes > available {
            warn!(
                requested = bytes,
                available, "memory budget exhausted, refusing reservation"
            );
            return Err(EngineError::ResourceExhausted {
                requested: bytes,
                available,
            });
        }

        *reserved += bytes;
        let in_use = *reserved;
        drop(reserved);

        debug!(bytes, in_use, limit = budget.limit, "reserved frame memory");
        if in_use as f64 > budget.limit as f64 * WARN_WATERMARK {
            budget.bus.warning(
                ErrorCategory::HighMemoryUsage,
                "memory-budget",
                format!("{in_use} of {} budget bytes retained", budget.limit),
            );
        }

        Ok(Reservation {
            budget: Arc::clone(budget),
            bytes,
        })
    }

    pub fn reserved_bytes(&self) -> u64 {
        *self.reserved.lock()
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn release(&self, bytes: u64) {
        let mut reserved = self.reserved.lock();
        *reserved = reserved.saturating_sub(bytes);
        debug!(bytes, in_use = *reserved, "released frame memory");
    }
}

/// RAII handle for one reservation; releases its bytes when dropped.
///
/// A ring buffer holds its reservation for as long as it lives, so the
/// budget is returned exactly when the last consumer lets the buffer go.
pub struct Reservation {
    budget: Arc<MemoryBudget>,
    bytes: u64,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.budget.release(self.bytes);
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation").field("bytes", &self.bytes).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBus, PipelineEvent};
    use assert_matches::assert_matches;

    #[test]
    fn reservations_release_on_drop() {
        let (bus, _rx) = EventBus::channel();
        let budget = MemoryBudget::new(1000, bus);

        let first = MemoryBudget::reserve(&budget, 600).unwrap();
        assert_eq!(budget.reserved_bytes(), 600);

        drop(first);
        assert_eq!(budget.reserved_bytes(), 0);
    }

    #[test]
    fn over_budget_reservation_is_refused() {
        let (bus, _rx) = EventBus::channel();
        let budget = MemoryBudget::new(1000, bus);

        let _held = MemoryBudget::reserve(&budget, 900).unwrap();
        let err = MemoryBudget::reserve(&budget, 200).unwrap_err();
        assert_matches!(
            err,
            EngineError::ResourceExhausted {
                requested: 200,
                available: 100
            }
        );
        // Failed reservation must not leak partial accounting.
        assert_eq!(budget.reserved_bytes(), 900);
    }

    #[test]
    fn high_watermark_posts_warning() {
        let (bus, mut rx) = EventBus::channel();
        let budget = MemoryBudget::new(1000, bus);

        let _held = MemoryBudget::reserve(&budget, 850).unwrap();
        match rx.try_recv().unwrap() {
            PipelineEvent::Error(record) => {
                assert_eq!(record.category, ErrorCategory::HighMemoryUsage);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
