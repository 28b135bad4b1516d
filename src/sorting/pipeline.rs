use crate::recorder::SortRecorder;
use crate::sorting::electrode::{SortedSpike, SpikeSorter};
use crate::sorting::error::SortError;
use crate::sorting::source::SpikeSource;

/// Running totals over everything a pipeline has pumped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub received: usize,
    pub gated: usize,
    pub sorted: usize,
}

/// Pulls spikes from a source and pushes them through a [`SpikeSorter`],
/// optionally recording every classified spike.
pub struct SortingPipeline<S: SpikeSource> {
    source: S,
    sorter: SpikeSorter,
    recorder: Option<SortRecorder>,
    stats: PipelineStats,
}

impl<S: SpikeSource> SortingPipeline<S> {
    pub fn new(source: S, sorter: SpikeSorter) -> Self {
        Self {
            source,
            sorter,
            recorder: None,
            stats: PipelineStats::default(),
        }
    }

    pub fn with_recorder(mut self, recorder: SortRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Handles one event. `Ok(None)` means the source is exhausted;
    /// `Ok(Some(None))` that the spike was gated out.
    pub fn pump_once(&mut self) -> Result<Option<Option<SortedSpike>>, SortError> {
        let Some(event) = self.source.next_spike()? else {
            return Ok(None);
        };
        self.stats.received += 1;
        let Some(sorted) = self.sorter.process(event)? else {
            self.stats.gated += 1;
            return Ok(Some(None));
        };
        if sorted.sorted_id.is_some() {
            self.stats.sorted += 1;
        }
        if let Some(recorder) = &mut self.recorder {
            recorder.write_spike(&sorted)?;
        }
        Ok(Some(Some(sorted)))
    }

    /// Pumps until the source runs dry.
    pub fn run_to_end(&mut self) -> Result<PipelineStats, SortError> {
        while self.pump_once()?.is_some() {}
        if let Some(recorder) = &mut self.recorder {
            recorder.flush()?;
        }
        Ok(self.stats)
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn sorter(&self) -> &SpikeSorter {
        &self.sorter
    }

    pub fn sorter_mut(&mut self) -> &mut SpikeSorter {
        &mut self.sorter
    }

    pub fn into_parts(self) -> (S, SpikeSorter, Option<SortRecorder>) {
        (self.source, self.sorter, self.recorder)
    }
}
