use std::sync::atomic::{AtomicU16, Ordering};

/// Hands out unit ids that are unique across every sorter sharing the
/// registry. Ids start at 1 and are never reused within a run.
#[derive(Debug)]
pub struct UnitIdRegistry {
    next: AtomicU16,
}

impl Default for UnitIdRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitIdRegistry {
    pub fn new() -> Self {
        Self {
            next: AtomicU16::new(1),
        }
    }

    /// Next free id. Once the `u16` space is used up, `u16::MAX` becomes a
    /// sticky sentinel: every later call returns it again and logs a warning.
    pub fn next_id(&self) -> u16 {
        match self
            .next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
        {
            Ok(id) => id,
            Err(id) => {
                log::warn!("unit id space exhausted, reusing {id}");
                id
            }
        }
    }

    /// Id the next call to [`next_id`](Self::next_id) returns.
    pub fn peek_next(&self) -> u16 {
        self.next.load(Ordering::SeqCst)
    }

    /// Makes sure future ids are larger than `existing`, e.g. after loading units.
    pub fn observe(&self, existing: u16) {
        self.next
            .fetch_max(existing.saturating_add(1), Ordering::SeqCst);
    }
}
