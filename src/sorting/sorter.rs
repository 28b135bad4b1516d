// src/sorting/sorter.rs
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::SorterConfig;
use crate::sorting::box_unit::{BoxUnit, SortBox};
use crate::sorting::buffer::SpikeRing;
use crate::sorting::error::SortError;
use crate::sorting::geometry::{Point, Polygon};
use crate::sorting::palette::Rgb;
use crate::sorting::pca::{CompletionPoll, PcaCompletion, PcaJob, PcaRange, PrincipalComponents};
use crate::sorting::pca_unit::PcaUnit;
use crate::sorting::persist::{BoxUnitNode, PcDim, PcaNode, PcaUnitNode, SorterSnapshot};
use crate::sorting::registry::UnitIdRegistry;
use crate::sorting::spike::{Spike, SpikeHandle};
use crate::sorting::worker::PcaWorker;

/// Offset applied to the last box when a box is appended without geometry.
const NEXT_BOX_SHIFT_US: f32 = 100.0;
const NEXT_BOX_SHIFT_UV: f32 = 30.0;

/// Where the PCA pipeline of a sorter stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcaPhase {
    /// Collecting spikes; a job goes out once the ring completes a lap or a
    /// re-PCA was requested.
    AwaitingBatch { repca_requested: bool },
    /// A job is on the worker queue. A re-PCA request made now is honoured
    /// once the job finishes.
    JobQueued { repca_requested: bool },
    /// Components are installed and every new spike is projected.
    Ready,
}

#[derive(Debug)]
enum PcaState {
    AwaitingBatch {
        repca_requested: bool,
    },
    JobQueued {
        completion: PcaCompletion,
        repca_requested: bool,
    },
    Ready,
}

impl PcaState {
    fn phase(&self) -> PcaPhase {
        match self {
            PcaState::AwaitingBatch { repca_requested } => PcaPhase::AwaitingBatch {
                repca_requested: *repca_requested,
            },
            PcaState::JobQueued {
                repca_requested, ..
            } => PcaPhase::JobQueued {
                repca_requested: *repca_requested,
            },
            PcaState::Ready => PcaPhase::Ready,
        }
    }
}

/// Unit and box the user currently has selected in the display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Selection {
    pub unit: Option<u16>,
    pub box_index: Option<usize>,
}

#[derive(Debug)]
struct SorterInner {
    num_channels: usize,
    samples_per_channel: usize,
    box_units: Vec<BoxUnit>,
    pca_units: Vec<PcaUnit>,
    ring: SpikeRing,
    pc1: Vec<f32>,
    pc2: Vec<f32>,
    range: PcaRange,
    range_update_pending: bool,
    state: PcaState,
    selection: Selection,
}

impl SorterInner {
    fn dimension(&self) -> usize {
        self.num_channels * self.samples_per_channel
    }

    fn reset_pca(&mut self) {
        let dim = self.dimension();
        self.pc1 = vec![0.0; dim];
        self.pc2 = vec![0.0; dim];
        self.ring.clear();
        self.range = PcaRange::default();
        self.range_update_pending = false;
        self.state = PcaState::AwaitingBatch {
            repca_requested: false,
        };
    }

    /// Smallest local id not used by any unit of either family.
    fn generate_local_id(&self) -> u16 {
        let used = |id: u16| {
            self.box_units.iter().any(|u| u.local_id() == id)
                || self.pca_units.iter().any(|u| u.local_id() == id)
        };
        (1..=u16::MAX).find(|id| !used(*id)).unwrap_or(u16::MAX)
    }

    fn box_unit_mut(&mut self, unit_id: u16) -> Option<&mut BoxUnit> {
        self.box_units.iter_mut().find(|u| u.unit_id() == unit_id)
    }

    /// Picks up the result of a queued job, if there is one.
    fn poll_job(&mut self, name: &str) {
        let PcaState::JobQueued {
            completion,
            repca_requested,
        } = &self.state
        else {
            return;
        };
        let repca_requested = *repca_requested;
        match completion.poll() {
            CompletionPoll::Pending => {}
            CompletionPoll::Finished(components) => {
                if self.install(components) {
                    log::debug!("{name}: principal components ready");
                    self.state = if repca_requested {
                        PcaState::AwaitingBatch {
                            repca_requested: true,
                        }
                    } else {
                        PcaState::Ready
                    };
                } else {
                    log::warn!("{name}: discarding PCA result with stale dimension");
                    self.state = PcaState::AwaitingBatch { repca_requested };
                }
            }
            CompletionPoll::Failed => {
                log::warn!("{name}: PCA job ended without a result");
                self.state = PcaState::AwaitingBatch { repca_requested };
            }
        }
    }

    fn install(&mut self, components: PrincipalComponents) -> bool {
        let dim = self.dimension();
        if components.pc1.len() != dim || components.pc2.len() != dim {
            return false;
        }
        self.pc1 = components.pc1;
        self.pc2 = components.pc2;
        self.range = components.range;
        self.range_update_pending = true;
        true
    }

    fn match_pca(&mut self, spike: &Spike) -> Option<u16> {
        let unit = self
            .pca_units
            .iter_mut()
            .find(|u| u.is_waveform_inside_polygon(spike))?;
        spike.assign(unit.unit_id(), unit.color());
        unit.update_waveform(spike);
        Some(unit.unit_id())
    }

    fn match_box(&mut self, spike: &Spike) -> Option<u16> {
        let unit = self
            .box_units
            .iter_mut()
            .find(|u| u.is_waveform_inside_all_boxes(spike))?;
        spike.assign(unit.unit_id(), unit.color());
        unit.update_waveform(spike);
        Some(unit.unit_id())
    }
}

/// Per-electrode classifier: owns the units, the spike ring and the PCA
/// state, and serialises every mutation behind one lock.
#[derive(Debug)]
pub struct Sorter {
    name: String,
    config: SorterConfig,
    registry: Arc<UnitIdRegistry>,
    worker: Arc<PcaWorker>,
    inner: Mutex<SorterInner>,
}

impl Sorter {
    pub fn new(
        name: impl Into<String>,
        num_channels: usize,
        samples_per_channel: usize,
        config: SorterConfig,
        registry: Arc<UnitIdRegistry>,
        worker: Arc<PcaWorker>,
    ) -> Self {
        let dim = num_channels * samples_per_channel;
        let inner = SorterInner {
            num_channels,
            samples_per_channel,
            box_units: Vec::new(),
            pca_units: Vec::new(),
            ring: SpikeRing::with_capacity(config.buffer_size),
            pc1: vec![0.0; dim],
            pc2: vec![0.0; dim],
            range: PcaRange::default(),
            range_update_pending: false,
            state: PcaState::AwaitingBatch {
                repca_requested: false,
            },
            selection: Selection::default(),
        };
        Self {
            name: name.into(),
            config,
            registry,
            worker,
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SorterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SorterConfig {
        &self.config
    }

    pub fn num_channels(&self) -> usize {
        self.lock().num_channels
    }

    pub fn samples_per_channel(&self) -> usize {
        self.lock().samples_per_channel
    }

    // ---------------------------------------------------------------
    // PCA pipeline
    // ---------------------------------------------------------------

    /// Feeds `spike` into the ring and, once components exist, stores its
    /// (pc1, pc2) projection on it. Never blocks on the worker.
    pub fn project_on_principal_components(&self, spike: &SpikeHandle) {
        let mut inner = self.lock();
        let dim = spike.channel().dimension();
        if dim != inner.dimension() {
            log::debug!(
                "{}: ignoring spike of dimension {dim}, expected {}",
                self.name,
                inner.dimension()
            );
            return;
        }
        inner.ring.push(Arc::clone(spike));
        inner.poll_job(&self.name);

        let repca_requested = match inner.state {
            PcaState::Ready => {
                let projection = Point::new(spike.project(&inner.pc1), spike.project(&inner.pc2));
                spike.set_projection(projection);
                return;
            }
            PcaState::AwaitingBatch { repca_requested } => repca_requested,
            PcaState::JobQueued { .. } => return,
        };
        if repca_requested || inner.ring.just_filled_last_slot() {
            self.submit_job(&mut inner);
        }
    }

    fn submit_job(&self, inner: &mut SorterInner) {
        // A failed submission waits for the next lap instead of retrying per spike.
        inner.state = PcaState::AwaitingBatch {
            repca_requested: false,
        };
        let mut job = match PcaJob::new(inner.ring.snapshot()) {
            Ok(job) => job
                .with_padding(self.config.range_padding)
                .with_order(self.config.component_order)
                .with_label(self.name.clone()),
            Err(err) => {
                log::warn!("{}: cannot build PCA job: {err}", self.name);
                return;
            }
        };
        let batch = job.batch_size();
        let completion = job.subscribe();
        if self.worker.submit(job) {
            log::debug!("{}: queued PCA job over {batch} spikes", self.name);
            inner.state = PcaState::JobQueued {
                completion,
                repca_requested: false,
            };
        } else {
            log::warn!("{}: PCA worker unavailable", self.name);
        }
    }

    /// Classifies `spike` against one unit family, then the other. The first
    /// match labels the spike, feeds that unit's statistics and is returned.
    pub fn sort_spike(&self, spike: &Spike, pca_first: bool) -> Option<u16> {
        let mut inner = self.lock();
        if pca_first {
            inner.match_pca(spike).or_else(|| inner.match_box(spike))
        } else {
            inner.match_box(spike).or_else(|| inner.match_pca(spike))
        }
    }

    /// Asks for fresh components. While a job is in flight the request is
    /// kept and served after that job lands.
    pub fn request_repca(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match &mut inner.state {
            PcaState::AwaitingBatch { repca_requested }
            | PcaState::JobQueued {
                repca_requested, ..
            } => *repca_requested = true,
            PcaState::Ready => {
                inner.state = PcaState::AwaitingBatch {
                    repca_requested: true,
                }
            }
        }
        log::debug!("{}: re-PCA requested", self.name);
    }

    /// Drops all PCA state for a new waveform length and resets the
    /// selection and unit statistics.
    pub fn resize_waveform(&self, samples_per_channel: usize) {
        let mut inner = self.lock();
        inner.samples_per_channel = samples_per_channel;
        inner.reset_pca();
        inner.selection = Selection::default();
        for unit in &mut inner.box_units {
            unit.resize_waveform(samples_per_channel);
        }
        for unit in &mut inner.pca_units {
            unit.resize_waveform(samples_per_channel);
        }
        log::info!(
            "{}: waveform resized to {samples_per_channel} samples per channel",
            self.name
        );
    }

    pub fn phase(&self) -> PcaPhase {
        self.lock().state.phase()
    }

    pub fn is_pca_ready(&self) -> bool {
        matches!(self.lock().state, PcaState::Ready)
    }

    /// Current (pc1, pc2). All zeros until a job has finished.
    pub fn components(&self) -> (Vec<f32>, Vec<f32>) {
        let inner = self.lock();
        (inner.pc1.clone(), inner.pc2.clone())
    }

    pub fn pca_range(&self) -> PcaRange {
        self.lock().range
    }

    pub fn set_pca_range(&self, range: PcaRange) {
        self.lock().range = range;
    }

    /// Returns the range of a newly finished job exactly once.
    pub fn take_pca_range_update(&self) -> Option<PcaRange> {
        let mut inner = self.lock();
        if inner.range_update_pending {
            inner.range_update_pending = false;
            Some(inner.range)
        } else {
            None
        }
    }

    // ---------------------------------------------------------------
    // Units
    // ---------------------------------------------------------------

    /// New box unit with the default box on `channel`; selects it.
    pub fn add_box_unit(&self, channel: usize) -> u16 {
        self.add_box_unit_with_box(SortBox::on_channel(channel))
    }

    pub fn add_box_unit_with_box(&self, sort_box: SortBox) -> u16 {
        let mut inner = self.lock();
        let unit_id = self.registry.next_id();
        let local_id = inner.generate_local_id();
        inner
            .box_units
            .push(BoxUnit::with_box(sort_box, unit_id, local_id));
        inner.selection = Selection {
            unit: Some(unit_id),
            box_index: Some(0),
        };
        log::info!("{}: added box unit {unit_id}", self.name);
        unit_id
    }

    pub fn add_pca_unit(&self, polygon: Polygon) -> u16 {
        let mut inner = self.lock();
        let unit_id = self.registry.next_id();
        let local_id = inner.generate_local_id();
        inner
            .pca_units
            .push(PcaUnit::new(polygon, unit_id, local_id));
        inner.selection = Selection {
            unit: Some(unit_id),
            box_index: None,
        };
        log::info!("{}: added PCA unit {unit_id}", self.name);
        unit_id
    }

    /// Appends a copy of the unit's last box, shifted right and down, on
    /// `channel`. A unit without boxes gets the default box.
    pub fn add_box_to_unit(&self, channel: usize, unit_id: u16) -> bool {
        let mut inner = self.lock();
        let Some(unit) = inner.box_unit_mut(unit_id) else {
            return false;
        };
        let sort_box = match unit.last_box() {
            Some(last) => SortBox {
                x: last.x + NEXT_BOX_SHIFT_US,
                y: last.y - NEXT_BOX_SHIFT_UV,
                channel,
                ..*last
            },
            None => SortBox::on_channel(channel),
        };
        unit.add_box(sort_box);
        let box_index = unit.num_boxes() - 1;
        inner.selection = Selection {
            unit: Some(unit_id),
            box_index: Some(box_index),
        };
        true
    }

    pub fn add_box_to_unit_with_box(&self, unit_id: u16, sort_box: SortBox) -> bool {
        let mut inner = self.lock();
        let Some(unit) = inner.box_unit_mut(unit_id) else {
            return false;
        };
        unit.add_box(sort_box);
        let box_index = unit.num_boxes() - 1;
        inner.selection = Selection {
            unit: Some(unit_id),
            box_index: Some(box_index),
        };
        true
    }

    /// Removes one box and clears the selection.
    pub fn remove_box_from_unit(&self, unit_id: u16, box_index: usize) -> bool {
        let mut inner = self.lock();
        let Some(unit) = inner.box_unit_mut(unit_id) else {
            return false;
        };
        let removed = unit.delete_box(box_index);
        inner.selection = Selection::default();
        removed
    }

    pub fn num_boxes(&self, unit_id: u16) -> Option<usize> {
        let inner = self.lock();
        inner
            .box_units
            .iter()
            .find(|u| u.unit_id() == unit_id)
            .map(BoxUnit::num_boxes)
    }

    pub fn unit_boxes(&self, unit_id: u16) -> Option<Vec<SortBox>> {
        let inner = self.lock();
        inner
            .box_units
            .iter()
            .find(|u| u.unit_id() == unit_id)
            .map(|u| u.boxes().to_vec())
    }

    /// Removes the unit with `unit_id` from whichever family holds it.
    pub fn remove_unit(&self, unit_id: u16) -> bool {
        let mut inner = self.lock();
        let before = inner.box_units.len() + inner.pca_units.len();
        inner.box_units.retain(|u| u.unit_id() != unit_id);
        inner.pca_units.retain(|u| u.unit_id() != unit_id);
        let removed = inner.box_units.len() + inner.pca_units.len() < before;
        if removed {
            if inner.selection.unit == Some(unit_id) {
                inner.selection = Selection::default();
            }
            log::info!("{}: removed unit {unit_id}", self.name);
        }
        removed
    }

    pub fn remove_all_units(&self) {
        let mut inner = self.lock();
        inner.box_units.clear();
        inner.pca_units.clear();
        inner.selection = Selection::default();
    }

    /// Point-in-time copy of the box units.
    pub fn box_units(&self) -> Vec<BoxUnit> {
        self.lock().box_units.clone()
    }

    pub fn pca_units(&self) -> Vec<PcaUnit> {
        self.lock().pca_units.clone()
    }

    /// Replaces the box units wholesale, e.g. after editing in the display.
    pub fn update_box_units(&self, units: Vec<BoxUnit>) {
        for unit in &units {
            self.registry.observe(unit.unit_id());
        }
        self.lock().box_units = units;
    }

    pub fn update_pca_units(&self, units: Vec<PcaUnit>) {
        for unit in &units {
            self.registry.observe(unit.unit_id());
        }
        self.lock().pca_units = units;
    }

    pub fn unit_color(&self, unit_id: u16) -> Option<Rgb> {
        let inner = self.lock();
        inner
            .box_units
            .iter()
            .find(|u| u.unit_id() == unit_id)
            .map(BoxUnit::color)
            .or_else(|| {
                inner
                    .pca_units
                    .iter()
                    .find(|u| u.unit_id() == unit_id)
                    .map(PcaUnit::color)
            })
    }

    /// Gives every unit a fresh id and the matching palette color.
    pub fn generate_new_ids(&self) {
        let mut inner = self.lock();
        for unit in &mut inner.box_units {
            unit.reassign_id(self.registry.next_id());
        }
        for unit in &mut inner.pca_units {
            unit.reassign_id(self.registry.next_id());
        }
        inner.selection = Selection::default();
    }

    /// Activates a box unit; see [`BoxUnit::activate`].
    pub fn set_unit_active(&self, unit_id: u16, active: bool) -> bool {
        let mut inner = self.lock();
        match inner.box_unit_mut(unit_id) {
            Some(unit) => {
                if active {
                    unit.activate();
                } else {
                    unit.deactivate();
                }
                true
            }
            None => false,
        }
    }

    /// Whether a unit has classified spikes since the last call; `None` for
    /// an unknown id.
    pub fn take_unit_new_data(&self, unit_id: u16) -> Option<bool> {
        let mut inner = self.lock();
        if let Some(unit) = inner.box_unit_mut(unit_id) {
            return Some(unit.stats_mut().take_new_data());
        }
        inner
            .pca_units
            .iter_mut()
            .find(|u| u.unit_id() == unit_id)
            .map(|u| u.stats_mut().take_new_data())
    }

    pub fn selection(&self) -> Selection {
        self.lock().selection
    }

    pub fn set_selection(&self, unit: Option<u16>, box_index: Option<usize>) {
        self.lock().selection = Selection { unit, box_index };
    }

    // ---------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------

    pub fn snapshot(&self) -> SorterSnapshot {
        let inner = self.lock();
        let computed = matches!(inner.state, PcaState::Ready);
        let dims = if computed {
            inner
                .pc1
                .iter()
                .zip(&inner.pc2)
                .map(|(pc1, pc2)| PcDim {
                    pc1: *pc1,
                    pc2: *pc2,
                })
                .collect()
        } else {
            Vec::new()
        };
        SorterSnapshot {
            selected_unit: inner.selection.unit,
            selected_box: inner.selection.box_index,
            pca: PcaNode {
                num_channels: inner.num_channels,
                waveform_length: inner.samples_per_channel,
                pc1_min: inner.range.pc1_min,
                pc2_min: inner.range.pc2_min,
                pc1_max: inner.range.pc1_max,
                pc2_max: inner.range.pc2_max,
                job_finished: computed,
                computed,
                dims,
            },
            box_units: inner.box_units.iter().map(BoxUnitNode::from).collect(),
            pca_units: inner.pca_units.iter().map(PcaUnitNode::from).collect(),
        }
    }

    /// Replaces the whole sorter state with `snapshot`. Components are only
    /// trusted when the snapshot says they were computed and their length
    /// matches its waveform layout.
    pub fn restore(&self, snapshot: SorterSnapshot) -> Result<(), SortError> {
        let pca = &snapshot.pca;
        let expected = pca.num_channels * pca.waveform_length;
        if pca.computed && pca.dims.len() != expected {
            log::warn!("{}: rejecting snapshot with bad PCA dimensions", self.name);
            return Err(SortError::SnapshotDimensions {
                expected,
                actual: pca.dims.len(),
            });
        }
        if let Some(max) = snapshot.max_unit_id() {
            self.registry.observe(max);
        }

        let mut inner = self.lock();
        inner.num_channels = pca.num_channels;
        inner.samples_per_channel = pca.waveform_length;
        inner.reset_pca();
        inner.range = pca.range();
        if pca.computed && expected > 0 {
            let (pc1, pc2) = pca.components();
            inner.pc1 = pc1;
            inner.pc2 = pc2;
            inner.state = PcaState::Ready;
            inner.range_update_pending = true;
        }

        inner.box_units.clear();
        inner.pca_units.clear();
        for node in snapshot.box_units {
            let local_id = inner.generate_local_id();
            inner.box_units.push(node.into_unit(local_id));
        }
        for node in snapshot.pca_units {
            let local_id = inner.generate_local_id();
            inner.pca_units.push(node.into_unit(local_id));
        }
        inner.selection = Selection {
            unit: snapshot.selected_unit,
            box_index: snapshot.selected_box,
        };
        log::info!(
            "{}: restored {} box units and {} PCA units",
            self.name,
            inner.box_units.len(),
            inner.pca_units.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sorting::spike::SpikeChannel;
    use std::time::{Duration, Instant};

    fn sorter_with(buffer_size: usize, samples: usize) -> Sorter {
        let config = SorterConfig {
            buffer_size,
            ..SorterConfig::default()
        };
        Sorter::new(
            "test",
            1,
            samples,
            config,
            Arc::new(UnitIdRegistry::new()),
            Arc::new(PcaWorker::spawn().unwrap()),
        )
    }

    fn spike(values: Vec<f32>) -> SpikeHandle {
        let channel = SpikeChannel::new(1, values.len(), 40_000.0).unwrap();
        Spike::new(channel, 0, 0, values).unwrap().into_handle()
    }

    fn varied(i: usize) -> SpikeHandle {
        let v = i as f32;
        spike(vec![v.sin() * 20.0, -v, v.cos() * 5.0, 0.5 * v])
    }

    /// Feeds spikes until the pending job has landed and the sorter projects.
    fn drive_to_ready(sorter: &Sorter, mut next: impl FnMut() -> SpikeHandle) -> SpikeHandle {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let s = next();
            sorter.project_on_principal_components(&s);
            if sorter.is_pca_ready() {
                return s;
            }
            assert!(Instant::now() < deadline, "PCA job never finished");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn job_is_queued_when_ring_completes_a_lap() {
        let sorter = sorter_with(4, 4);
        for i in 0..3 {
            sorter.project_on_principal_components(&varied(i));
            assert_eq!(
                sorter.phase(),
                PcaPhase::AwaitingBatch {
                    repca_requested: false
                }
            );
        }
        sorter.project_on_principal_components(&varied(3));
        assert_eq!(
            sorter.phase(),
            PcaPhase::JobQueued {
                repca_requested: false
            }
        );
    }

    #[test]
    fn spikes_are_projected_once_ready() {
        let sorter = sorter_with(8, 4);
        for i in 0..8 {
            sorter.project_on_principal_components(&varied(i));
        }
        let mut i = 8;
        let first_projected = drive_to_ready(&sorter, || {
            i += 1;
            varied(i)
        });
        let (pc1, pc2) = sorter.components();
        assert_eq!(pc1.len(), 4);
        let expected = Point::new(first_projected.project(&pc1), first_projected.project(&pc2));
        assert_eq!(first_projected.projection(), expected);
        assert!(sorter.take_pca_range_update().is_some());
        assert!(sorter.take_pca_range_update().is_none());
    }

    #[test]
    fn spikes_before_completion_keep_origin_projection() {
        let sorter = sorter_with(4, 4);
        let early = varied(1);
        sorter.project_on_principal_components(&early);
        for i in 2..5 {
            sorter.project_on_principal_components(&varied(i));
        }
        drive_to_ready(&sorter, || varied(7));
        assert_eq!(early.projection(), Point::ORIGIN);
    }

    #[test]
    fn repca_from_ready_submits_on_next_spike() {
        let sorter = sorter_with(4, 4);
        for i in 0..4 {
            sorter.project_on_principal_components(&varied(i));
        }
        drive_to_ready(&sorter, || varied(9));
        sorter.request_repca();
        assert_eq!(
            sorter.phase(),
            PcaPhase::AwaitingBatch {
                repca_requested: true
            }
        );
        sorter.project_on_principal_components(&varied(10));
        assert_eq!(
            sorter.phase(),
            PcaPhase::JobQueued {
                repca_requested: false
            }
        );
    }

    #[test]
    fn repca_while_queued_is_remembered() {
        let sorter = sorter_with(4, 4);
        for i in 0..4 {
            sorter.project_on_principal_components(&varied(i));
        }
        sorter.request_repca();
        assert_eq!(
            sorter.phase(),
            PcaPhase::JobQueued {
                repca_requested: true
            }
        );
        // When the first job lands the deferred request is submitted straight away.
        let deadline = Instant::now() + Duration::from_secs(10);
        while sorter.phase()
            == (PcaPhase::JobQueued {
                repca_requested: true,
            })
        {
            sorter.project_on_principal_components(&varied(5));
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(
            sorter.phase(),
            PcaPhase::JobQueued {
                repca_requested: false
            }
        );
    }

    #[test]
    fn failed_job_falls_back_to_collecting() {
        let sorter = sorter_with(2, 2);
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut saw_queued = false;
        loop {
            sorter.project_on_principal_components(&spike(vec![f32::NAN, 1.0]));
            match sorter.phase() {
                PcaPhase::JobQueued { .. } => saw_queued = true,
                PcaPhase::AwaitingBatch { .. } if saw_queued => break,
                _ => {}
            }
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!sorter.is_pca_ready());
        assert!(sorter.take_pca_range_update().is_none());
    }

    #[test]
    fn stopped_worker_leaves_sorter_collecting() {
        let worker = Arc::new(PcaWorker::spawn().unwrap());
        worker.shutdown();
        let sorter = Sorter::new(
            "stopped",
            1,
            4,
            SorterConfig {
                buffer_size: 2,
                ..SorterConfig::default()
            },
            Arc::new(UnitIdRegistry::new()),
            worker,
        );
        sorter.project_on_principal_components(&varied(0));
        sorter.project_on_principal_components(&varied(1));
        assert_eq!(
            sorter.phase(),
            PcaPhase::AwaitingBatch {
                repca_requested: false
            }
        );
    }

    #[test]
    fn mismatched_dimension_is_ignored() {
        let sorter = sorter_with(1, 4);
        sorter.project_on_principal_components(&spike(vec![0.0; 3]));
        assert_eq!(
            sorter.phase(),
            PcaPhase::AwaitingBatch {
                repca_requested: false
            }
        );
    }

    #[test]
    fn resize_resets_pca_and_selection() {
        let sorter = sorter_with(4, 4);
        sorter.add_box_unit(0);
        for i in 0..4 {
            sorter.project_on_principal_components(&varied(i));
        }
        sorter.set_pca_range(PcaRange {
            pc1_min: -5.0,
            pc2_min: -5.0,
            pc1_max: 5.0,
            pc2_max: 5.0,
        });
        sorter.resize_waveform(6);
        assert_eq!(
            sorter.phase(),
            PcaPhase::AwaitingBatch {
                repca_requested: false
            }
        );
        assert_eq!(sorter.pca_range(), PcaRange::default());
        assert_eq!(sorter.selection(), Selection::default());
        assert_eq!(sorter.components().0, vec![0.0; 6]);
        assert_eq!(sorter.box_units().len(), 1);
    }

    #[test]
    fn unit_ids_are_distinct_and_increasing() {
        let sorter = sorter_with(4, 4);
        let a = sorter.add_box_unit(0);
        let b = sorter.add_pca_unit(Polygon::default());
        let c = sorter.add_box_unit(0);
        assert!(a < b && b < c);
        assert_eq!(sorter.selection().unit, Some(c));
    }

    #[test]
    fn local_ids_reuse_the_smallest_gap() {
        let sorter = sorter_with(4, 4);
        let a = sorter.add_box_unit(0);
        sorter.add_box_unit(0);
        sorter.remove_unit(a);
        sorter.add_pca_unit(Polygon::default());
        let locals: Vec<u16> = sorter
            .pca_units()
            .iter()
            .map(PcaUnit::local_id)
            .chain(sorter.box_units().iter().map(BoxUnit::local_id))
            .collect();
        assert_eq!(locals, vec![1, 2]);
    }

    #[test]
    fn add_box_to_unit_offsets_the_last_box() {
        let sorter = sorter_with(4, 4);
        let id = sorter.add_box_unit(0);
        assert!(sorter.add_box_to_unit(1, id));
        let boxes = sorter.unit_boxes(id).unwrap();
        assert_eq!(boxes[1], SortBox::new(150.0, -50.0, 300.0, 40.0, 1));
        assert_eq!(
            sorter.selection(),
            Selection {
                unit: Some(id),
                box_index: Some(1)
            }
        );
        assert!(!sorter.add_box_to_unit(0, id + 100));
    }

    #[test]
    fn add_box_to_empty_unit_uses_default_box() {
        let sorter = sorter_with(4, 4);
        let id = sorter.add_box_unit(0);
        assert!(sorter.remove_box_from_unit(id, 0));
        assert_eq!(sorter.num_boxes(id), Some(0));
        assert!(sorter.add_box_to_unit(2, id));
        assert_eq!(sorter.unit_boxes(id).unwrap(), vec![SortBox::on_channel(2)]);
    }

    #[test]
    fn remove_box_clears_selection() {
        let sorter = sorter_with(4, 4);
        let id = sorter.add_box_unit(0);
        assert!(!sorter.remove_box_from_unit(id, 5));
        assert_eq!(sorter.selection(), Selection::default());
        assert!(!sorter.remove_box_from_unit(id + 1, 0));
        assert_eq!(sorter.num_boxes(id + 1), None);
    }

    #[test]
    fn remove_unit_and_remove_all() {
        let sorter = sorter_with(4, 4);
        let a = sorter.add_box_unit(0);
        let b = sorter.add_pca_unit(Polygon::default());
        assert!(sorter.remove_unit(b));
        assert!(!sorter.remove_unit(b));
        assert_eq!(sorter.unit_color(a), Some(crate::sorting::palette::unit_color(a)));
        sorter.remove_all_units();
        assert!(sorter.box_units().is_empty());
        assert!(sorter.pca_units().is_empty());
        assert_eq!(sorter.unit_color(a), None);
    }

    #[test]
    fn sort_order_decides_overlapping_units() {
        let sorter = sorter_with(4, 4);
        let triangle = Polygon::new(vec![
            Point::new(-1.0, -1.0),
            Point::new(1.0, -1.0),
            Point::new(0.0, 1.0),
        ]);
        let box_id = sorter.add_box_unit_with_box(SortBox::new(0.0, 10.0, 100.0, 20.0, 0));
        let pca_id = sorter.add_pca_unit(triangle);
        // Crosses the box top edge; its projection stays at the origin.
        let s = spike(vec![20.0, 0.0, 0.0, 0.0]);
        assert_eq!(sorter.sort_spike(&s, true), Some(pca_id));
        assert_eq!(s.sorted_id(), pca_id);
        assert_eq!(sorter.sort_spike(&s, false), Some(box_id));
        assert_eq!(s.sorted_id(), box_id);
        assert_eq!(sorter.box_units()[0].stats().num_samples(), 1);
        assert_eq!(sorter.pca_units()[0].stats().num_samples(), 1);
    }

    #[test]
    fn new_data_flag_is_cleared_through_sorter() {
        let sorter = sorter_with(4, 4);
        let box_id = sorter.add_box_unit_with_box(SortBox::new(0.0, 10.0, 100.0, 20.0, 0));
        let pca_id = sorter.add_pca_unit(Polygon::default());
        assert_eq!(sorter.take_unit_new_data(box_id), Some(false));
        sorter.sort_spike(&spike(vec![20.0, 0.0, 0.0, 0.0]), false);
        assert_eq!(sorter.take_unit_new_data(box_id), Some(true));
        assert_eq!(sorter.take_unit_new_data(box_id), Some(false));
        assert_eq!(sorter.take_unit_new_data(pca_id), Some(false));
        assert_eq!(sorter.take_unit_new_data(999), None);
    }

    #[test]
    fn unmatched_spike_keeps_its_label() {
        let sorter = sorter_with(4, 4);
        sorter.add_box_unit(0);
        let s = spike(vec![0.0; 4]);
        assert_eq!(sorter.sort_spike(&s, true), None);
        assert_eq!(s.sorted_id(), 0);
        assert_eq!(s.color(), Rgb::UNSORTED);
    }

    #[test]
    fn generate_new_ids_recolors_units() {
        let registry = Arc::new(UnitIdRegistry::new());
        let sorter = Sorter::new(
            "a",
            1,
            4,
            SorterConfig::default(),
            Arc::clone(&registry),
            Arc::new(PcaWorker::spawn().unwrap()),
        );
        let old = sorter.add_box_unit(0);
        sorter.generate_new_ids();
        let unit = &sorter.box_units()[0];
        assert_ne!(unit.unit_id(), old);
        assert_eq!(unit.color(), crate::sorting::palette::unit_color(unit.unit_id()));
        assert_eq!(registry.peek_next(), unit.unit_id() + 1);
    }

    #[test]
    fn update_units_bumps_registry() {
        let registry = Arc::new(UnitIdRegistry::new());
        let sorter = Sorter::new(
            "a",
            1,
            4,
            SorterConfig::default(),
            Arc::clone(&registry),
            Arc::new(PcaWorker::spawn().unwrap()),
        );
        sorter.update_box_units(vec![BoxUnit::new(40, 1)]);
        assert_eq!(registry.next_id(), 41);
    }

    #[test]
    fn activation_is_forwarded() {
        let sorter = sorter_with(4, 4);
        let id = sorter.add_box_unit(0);
        assert!(sorter.set_unit_active(id, true));
        assert!(sorter.box_units()[0].is_active());
        assert!(!sorter.set_unit_active(id + 1, true));
    }

    #[test]
    fn snapshot_restore_keeps_units_and_components() {
        let sorter = sorter_with(4, 4);
        for i in 0..4 {
            sorter.project_on_principal_components(&varied(i));
        }
        drive_to_ready(&sorter, || varied(11));
        let box_id = sorter.add_box_unit_with_box(SortBox::new(10.5, -3.25, 80.0, 12.0, 0));
        sorter.add_pca_unit(Polygon::with_offset(
            vec![Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(0.0, 1.0)],
            Point::new(0.5, 0.5),
        ));
        let snapshot = sorter.snapshot();
        assert!(snapshot.pca.computed);
        assert_eq!(snapshot.pca.dims.len(), 4);

        let restored = sorter_with(4, 2);
        restored.restore(snapshot.clone()).unwrap();
        assert!(restored.is_pca_ready());
        assert_eq!(restored.samples_per_channel(), 4);
        assert_eq!(restored.components(), sorter.components());
        assert_eq!(restored.pca_range(), sorter.pca_range());
        assert_eq!(restored.unit_boxes(box_id), sorter.unit_boxes(box_id));
        assert_eq!(restored.pca_units()[0].polygon(), sorter.pca_units()[0].polygon());
        assert_eq!(restored.snapshot(), snapshot);
    }

    #[test]
    fn restore_rejects_bad_dimensions() {
        let sorter = sorter_with(4, 4);
        let mut snapshot = sorter.snapshot();
        snapshot.pca.computed = true;
        snapshot.pca.dims = vec![PcDim { pc1: 0.0, pc2: 0.0 }; 3];
        assert!(matches!(
            sorter.restore(snapshot),
            Err(SortError::SnapshotDimensions {
                expected: 4,
                actual: 3
            })
        ));
    }
}
