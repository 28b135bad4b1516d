use crate::sorting::spike::SpikeHandle;

/// Fixed-capacity circular store of the most recent spikes, used as the PCA
/// training batch. Writing past the end overwrites the oldest slot.
#[derive(Clone, Debug)]
pub struct SpikeRing {
    slots: Vec<Option<SpikeHandle>>,
    last_written: Option<usize>,
}

impl SpikeRing {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            last_written: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.last_written.is_none()
    }

    /// Slot the next push writes to.
    pub fn next_slot(&self) -> usize {
        self.last_written
            .map_or(0, |idx| (idx + 1) % self.slots.len())
    }

    /// Stores `spike` and returns the slot it landed in.
    pub fn push(&mut self, spike: SpikeHandle) -> usize {
        let idx = self.next_slot();
        self.slots[idx] = Some(spike);
        self.last_written = Some(idx);
        idx
    }

    /// True right after a write to the final slot, i.e. once per lap.
    pub fn just_filled_last_slot(&self) -> bool {
        self.last_written == Some(self.slots.len() - 1)
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.last_written = None;
    }

    /// Occupied slots in slot order; handles are shared, not copied.
    pub fn snapshot(&self) -> Vec<SpikeHandle> {
        self.slots.iter().flatten().cloned().collect()
    }
}
