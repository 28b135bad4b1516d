use std::collections::VecDeque;

use crate::sorting::error::SpikeError;
use crate::sorting::spike::{Spike, SpikeChannel, SpikeHandle};

/// One detected spike as handed over by acquisition.
#[derive(Clone, Debug)]
pub struct SpikeEvent {
    pub electrode: usize,
    pub channel: SpikeChannel,
    /// Channel-major voltages in µV.
    pub data: Vec<f32>,
    /// Capture time in samples.
    pub timestamp: i64,
    /// Id already carried by the event, 0 when unsorted.
    pub sorted_id: u16,
}

impl SpikeEvent {
    pub fn validate(&self) -> Result<(), SpikeError> {
        self.channel.validate()?;
        let expected = self.channel.dimension();
        if self.data.len() != expected {
            return Err(SpikeError::BufferLength {
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    pub fn into_spike(self) -> Result<SpikeHandle, SpikeError> {
        Spike::new(self.channel, self.sorted_id, self.timestamp, self.data).map(Spike::into_handle)
    }
}

/// Anything that can yield detected spikes on demand.
pub trait SpikeSource {
    fn next_spike(&mut self) -> Result<Option<SpikeEvent>, SpikeError>;
}

/// In-memory source for tests and deterministic playback.
pub struct ManualSource {
    queue: VecDeque<SpikeEvent>,
}

impl ManualSource {
    pub fn new(events: impl IntoIterator<Item = SpikeEvent>) -> Self {
        Self {
            queue: events.into_iter().collect(),
        }
    }

    pub fn push(&mut self, event: SpikeEvent) {
        self.queue.push_back(event);
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl SpikeSource for ManualSource {
    fn next_spike(&mut self) -> Result<Option<SpikeEvent>, SpikeError> {
        Ok(self.queue.pop_front())
    }
}
