// src/sorting/electrode.rs
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::config::SorterConfig;
use crate::sorting::error::SortError;
use crate::sorting::pca::PcaRange;
use crate::sorting::persist::SorterSnapshot;
use crate::sorting::registry::UnitIdRegistry;
use crate::sorting::sorter::Sorter;
use crate::sorting::source::SpikeEvent;
use crate::sorting::spike::SpikeHandle;
use crate::sorting::worker::PcaWorker;

/// A sorter plus the per-channel threshold gate in front of it.
#[derive(Debug)]
pub struct Electrode {
    id: usize,
    sorter: Sorter,
    thresholds: Vec<f32>,
}

impl Electrode {
    pub fn new(
        id: usize,
        num_channels: usize,
        samples_per_channel: usize,
        config: SorterConfig,
        registry: Arc<UnitIdRegistry>,
        worker: Arc<PcaWorker>,
    ) -> Self {
        let thresholds = vec![config.default_threshold_uv; num_channels];
        let sorter = Sorter::new(
            format!("electrode {id}"),
            num_channels,
            samples_per_channel,
            config,
            registry,
            worker,
        );
        Self {
            id,
            sorter,
            thresholds,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn sorter(&self) -> &Sorter {
        &self.sorter
    }

    pub fn thresholds(&self) -> &[f32] {
        &self.thresholds
    }

    pub fn set_threshold(&mut self, channel: usize, threshold_uv: f32) -> bool {
        match self.thresholds.get_mut(channel) {
            Some(slot) => {
                *slot = threshold_uv;
                true
            }
            None => false,
        }
    }
}

/// Result of pushing one event through [`SpikeSorter::process`].
#[derive(Clone, Debug)]
pub struct SortedSpike {
    pub electrode: usize,
    pub spike: SpikeHandle,
    /// Unit that claimed the spike, if any.
    pub sorted_id: Option<u16>,
    /// Set once, right after a PCA job for this electrode has landed.
    pub range_update: Option<PcaRange>,
}

/// Front-end owning one [`Electrode`] per electrode id. Every electrode
/// shares the same unit id registry and PCA worker.
#[derive(Debug)]
pub struct SpikeSorter {
    config: SorterConfig,
    registry: Arc<UnitIdRegistry>,
    worker: Arc<PcaWorker>,
    electrodes: BTreeMap<usize, Electrode>,
}

impl SpikeSorter {
    /// Uses the process-wide PCA worker.
    pub fn new(config: SorterConfig) -> Result<Self, SortError> {
        config.validate()?;
        Ok(Self::with_parts(
            config,
            Arc::new(UnitIdRegistry::new()),
            PcaWorker::shared()?,
        ))
    }

    pub fn with_parts(
        config: SorterConfig,
        registry: Arc<UnitIdRegistry>,
        worker: Arc<PcaWorker>,
    ) -> Self {
        Self {
            config,
            registry,
            worker,
            electrodes: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &SorterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<UnitIdRegistry> {
        &self.registry
    }

    pub fn electrode(&self, id: usize) -> Option<&Electrode> {
        self.electrodes.get(&id)
    }

    pub fn electrode_mut(&mut self, id: usize) -> Option<&mut Electrode> {
        self.electrodes.get_mut(&id)
    }

    pub fn electrodes(&self) -> impl Iterator<Item = &Electrode> {
        self.electrodes.values()
    }

    /// Returns the electrode for `id`, creating it for the given layout if
    /// needed. A known electrode whose waveform length changed is resized;
    /// one whose channel count changed is rebuilt.
    pub fn ensure_electrode(
        &mut self,
        id: usize,
        num_channels: usize,
        samples_per_channel: usize,
    ) -> &mut Electrode {
        let fresh = || {
            Electrode::new(
                id,
                num_channels,
                samples_per_channel,
                self.config.clone(),
                Arc::clone(&self.registry),
                Arc::clone(&self.worker),
            )
        };
        let electrode = match self.electrodes.entry(id) {
            Entry::Vacant(slot) => slot.insert(fresh()),
            Entry::Occupied(slot) if slot.get().sorter.num_channels() != num_channels => {
                log::warn!("electrode {id}: channel count changed, discarding its units");
                let electrode = slot.into_mut();
                *electrode = fresh();
                electrode
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };
        if electrode.sorter.samples_per_channel() != samples_per_channel {
            electrode.sorter.resize_waveform(samples_per_channel);
        }
        electrode
    }

    /// Gates, projects and classifies one event. Returns `None` when the
    /// spike does not pass its electrode's thresholds.
    pub fn process(&mut self, event: SpikeEvent) -> Result<Option<SortedSpike>, SortError> {
        event.validate()?;
        let pca_first = self.config.pca_first;
        let electrode_id = event.electrode;
        let electrode = self.ensure_electrode(
            electrode_id,
            event.channel.num_channels,
            event.channel.samples_per_channel,
        );
        let spike = event.into_spike()?;
        if !spike.check_thresholds(&electrode.thresholds) {
            return Ok(None);
        }

        let sorter = &electrode.sorter;
        sorter.project_on_principal_components(&spike);
        let sorted_id = sorter.sort_spike(&spike, pca_first);
        let range_update = sorter.take_pca_range_update();
        if let Some(range) = range_update {
            log::debug!("electrode {electrode_id}: new PC display range {range:?}");
        }
        Ok(Some(SortedSpike {
            electrode: electrode_id,
            spike,
            sorted_id,
            range_update,
        }))
    }

    pub fn snapshots(&self) -> BTreeMap<usize, SorterSnapshot> {
        self.electrodes
            .iter()
            .map(|(id, e)| (*id, e.sorter.snapshot()))
            .collect()
    }

    /// Restores each electrode from its snapshot, creating missing ones.
    pub fn restore(&mut self, snapshots: BTreeMap<usize, SorterSnapshot>) -> Result<(), SortError> {
        for (id, snapshot) in snapshots {
            let electrode = self.ensure_electrode(
                id,
                snapshot.pca.num_channels,
                snapshot.pca.waveform_length,
            );
            electrode.sorter.restore(snapshot)?;
        }
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SortError> {
        let text = serde_json::to_string_pretty(&self.snapshots())?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<(), SortError> {
        let text = fs::read_to_string(path)?;
        let snapshots: BTreeMap<usize, SorterSnapshot> = serde_json::from_str(&text)?;
        self.restore(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sorting::box_unit::SortBox;
    use crate::sorting::spike::SpikeChannel;

    fn front_end() -> SpikeSorter {
        SpikeSorter::with_parts(
            SorterConfig::default(),
            Arc::new(UnitIdRegistry::new()),
            Arc::new(PcaWorker::spawn().unwrap()),
        )
    }

    fn event(electrode: usize, data: Vec<f32>) -> SpikeEvent {
        SpikeEvent {
            electrode,
            channel: SpikeChannel::new(1, data.len(), 40_000.0).unwrap(),
            data,
            timestamp: 0,
            sorted_id: 0,
        }
    }

    #[test]
    fn spikes_above_threshold_are_dropped() {
        let mut sorter = front_end();
        assert!(sorter.process(event(0, vec![0.0, -10.0, 0.0])).unwrap().is_none());
        let passed = sorter.process(event(0, vec![0.0, -80.0, 0.0])).unwrap();
        assert!(passed.is_some());
    }

    #[test]
    fn electrodes_are_created_lazily_and_share_ids() {
        let mut sorter = front_end();
        sorter.process(event(3, vec![-60.0; 4])).unwrap();
        sorter.process(event(5, vec![-60.0; 4])).unwrap();
        let a = sorter.electrode(3).unwrap().sorter().add_box_unit(0);
        let b = sorter.electrode(5).unwrap().sorter().add_box_unit(0);
        assert_ne!(a, b);
        assert_eq!(sorter.electrodes().count(), 2);
    }

    #[test]
    fn waveform_length_change_resizes() {
        let mut sorter = front_end();
        sorter.process(event(0, vec![-60.0; 4])).unwrap();
        let id = sorter.electrode(0).unwrap().sorter().add_box_unit(0);
        sorter.process(event(0, vec![-60.0; 6])).unwrap();
        let electrode = sorter.electrode(0).unwrap();
        assert_eq!(electrode.sorter().samples_per_channel(), 6);
        assert_eq!(electrode.sorter().num_boxes(id), Some(1));
    }

    #[test]
    fn sorted_id_is_reported() {
        let mut sorter = front_end();
        sorter.ensure_electrode(0, 1, 4);
        let unit = sorter
            .electrode(0)
            .unwrap()
            .sorter()
            .add_box_unit_with_box(SortBox::new(0.0, -40.0, 100.0, 40.0, 0));
        let out = sorter
            .process(event(0, vec![0.0, -60.0, 0.0, 0.0]))
            .unwrap()
            .unwrap();
        assert_eq!(out.sorted_id, Some(unit));
        assert_eq!(out.spike.sorted_id(), unit);
    }

    #[test]
    fn thresholds_are_per_channel() {
        let mut sorter = front_end();
        let electrode = sorter.ensure_electrode(0, 2, 4);
        assert_eq!(electrode.thresholds(), &[-50.0, -50.0]);
        assert!(electrode.set_threshold(1, -10.0));
        assert!(!electrode.set_threshold(2, -10.0));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sorters.json");
        let mut sorter = front_end();
        sorter.ensure_electrode(2, 1, 4);
        let unit = sorter.electrode(2).unwrap().sorter().add_box_unit(0);
        sorter.save(&path).unwrap();

        let mut loaded = front_end();
        loaded.load(&path).unwrap();
        let restored = loaded.electrode(2).unwrap().sorter();
        assert_eq!(restored.num_boxes(unit), Some(1));
        assert!(loaded.registry().peek_next() > unit);
    }
}
