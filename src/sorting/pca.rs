use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::sorting::error::PcaError;
use crate::sorting::spike::SpikeHandle;
use crate::sorting::svd::svdcmp;

/// Display bounds of the PC plane.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PcaRange {
    pub pc1_min: f32,
    pub pc2_min: f32,
    pub pc1_max: f32,
    pub pc2_max: f32,
}

impl Default for PcaRange {
    fn default() -> Self {
        Self {
            pc1_min: -1.0,
            pc2_min: -1.0,
            pc1_max: 1.0,
            pc2_max: 1.0,
        }
    }
}

/// Which singular vectors become pc1 and pc2.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentOrder {
    /// Columns 0 and 1 of V, in the order the decomposition leaves them.
    #[default]
    Index,
    /// The two largest singular values.
    DescendingMagnitude,
}

impl ComponentOrder {
    /// Column indices of V ranked according to `self`.
    pub fn rank(self, singular_values: &[f64]) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..singular_values.len()).collect();
        if self == ComponentOrder::DescendingMagnitude {
            idx.sort_by(|a, b| singular_values[*b].total_cmp(&singular_values[*a]));
        }
        idx
    }
}

/// Output of one finished job.
#[derive(Clone, Debug, PartialEq)]
pub struct PrincipalComponents {
    pub pc1: Vec<f32>,
    pub pc2: Vec<f32>,
    pub range: PcaRange,
    pub singular_values: Vec<f64>,
}

/// Pads the observed extent of the projections by `padding` times its width
/// on both sides of each axis.
pub fn padded_range(projections: impl IntoIterator<Item = (f32, f32)>, padding: f32) -> PcaRange {
    let (mut min1, mut min2) = (f32::INFINITY, f32::INFINITY);
    let (mut max1, mut max2) = (f32::NEG_INFINITY, f32::NEG_INFINITY);
    let mut seen = false;
    for (p1, p2) in projections {
        seen = true;
        min1 = min1.min(p1);
        min2 = min2.min(p2);
        max1 = max1.max(p1);
        max2 = max2.max(p2);
    }
    if !seen {
        return PcaRange::default();
    }
    PcaRange {
        pc1_min: min1 - padding * (max1 - min1),
        pc2_min: min2 - padding * (max2 - min2),
        pc1_max: max1 + padding * (max1 - min1),
        pc2_max: max2 + padding * (max2 - min2),
    }
}

/// Receiving half of a job's one-shot completion signal.
#[derive(Debug)]
pub struct PcaCompletion {
    rx: Receiver<PrincipalComponents>,
}

#[derive(Debug)]
pub enum CompletionPoll {
    Pending,
    Finished(PrincipalComponents),
    /// The job ended without publishing anything.
    Failed,
}

impl PcaCompletion {
    /// Never blocks.
    pub fn poll(&self) -> CompletionPoll {
        match self.rx.try_recv() {
            Ok(components) => CompletionPoll::Finished(components),
            Err(TryRecvError::Empty) => CompletionPoll::Pending,
            Err(TryRecvError::Disconnected) => CompletionPoll::Failed,
        }
    }

    /// Blocks until the job is done. Meant for tests and shutdown paths.
    pub fn wait(self) -> Option<PrincipalComponents> {
        self.rx.recv().ok()
    }
}

/// One covariance + SVD computation over a snapshot of recent spikes.
pub struct PcaJob {
    spikes: Vec<SpikeHandle>,
    dim: usize,
    padding: f32,
    order: ComponentOrder,
    label: String,
    notify: Option<Sender<PrincipalComponents>>,
}

impl std::fmt::Debug for PcaJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcaJob")
            .field("label", &self.label)
            .field("spikes", &self.spikes.len())
            .field("dim", &self.dim)
            .finish()
    }
}

impl PcaJob {
    pub fn new(spikes: Vec<SpikeHandle>) -> Result<Self, PcaError> {
        let first = spikes.first().ok_or(PcaError::EmptyBatch)?;
        let dim = first.channel().dimension();
        if dim < 2 {
            return Err(PcaError::DimensionTooSmall(dim));
        }
        if let Some(other) = spikes.iter().find(|s| s.data().len() != dim) {
            return Err(PcaError::DimensionMismatch {
                expected: dim,
                actual: other.data().len(),
            });
        }
        Ok(Self {
            spikes,
            dim,
            padding: 1.5,
            order: ComponentOrder::default(),
            label: String::new(),
            notify: None,
        })
    }

    pub fn with_padding(mut self, padding: f32) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_order(mut self, order: ComponentOrder) -> Self {
        self.order = order;
        self
    }

    /// Name used in log lines, usually the electrode.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Creates the completion signal. Only the most recent subscriber is notified.
    pub fn subscribe(&mut self) -> PcaCompletion {
        let (tx, rx) = mpsc::channel();
        self.notify = Some(tx);
        PcaCompletion { rx }
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn batch_size(&self) -> usize {
        self.spikes.len()
    }

    /// Sample covariance of every feature pair, normalised by `dim - 1`.
    pub fn compute_covariance(&self) -> Result<Array2<f64>, PcaError> {
        let n = self.spikes.len();
        let mut centered = Array2::<f64>::zeros((n, self.dim));
        for (mut row, spike) in centered.rows_mut().into_iter().zip(&self.spikes) {
            for (dst, v) in row.iter_mut().zip(spike.data()) {
                *dst = f64::from(*v);
            }
        }
        if let Some(index) = centered.iter().position(|v| !v.is_finite()) {
            return Err(PcaError::NonFinite {
                index: index % self.dim,
            });
        }
        for mut column in centered.columns_mut() {
            let mean = column.sum() / n as f64;
            column.mapv_inplace(|v| v - mean);
        }

        let mut cov = centered.t().dot(&centered);
        let denom = (self.dim - 1) as f64;
        for i in 0..self.dim {
            for j in i..self.dim {
                let c = cov[[i, j]] / denom;
                cov[[i, j]] = c;
                cov[[j, i]] = c;
            }
        }
        Ok(cov)
    }

    /// Covariance, SVD, component selection and display range.
    pub fn compute(&self) -> Result<PrincipalComponents, PcaError> {
        let cov = self.compute_covariance()?;
        let svd = svdcmp(cov)?;
        let ranked = self.order.rank(&svd.w);
        let pc1: Vec<f32> = svd.v.column(ranked[0]).iter().map(|v| *v as f32).collect();
        let pc2: Vec<f32> = svd.v.column(ranked[1]).iter().map(|v| *v as f32).collect();

        let range = padded_range(
            self.spikes.iter().map(|s| (s.project(&pc1), s.project(&pc2))),
            self.padding,
        );
        Ok(PrincipalComponents {
            pc1,
            pc2,
            range,
            singular_values: svd.w,
        })
    }

    /// Runs the job and publishes the result. A failed job drops its sender
    /// without sending, which the subscriber observes as a failure.
    pub fn run(mut self) -> Result<(), PcaError> {
        let notify = self.notify.take();
        let started = std::time::Instant::now();
        match self.compute() {
            Ok(components) => {
                log::info!(
                    "PCA finished for {} ({} spikes, dim {}) in {:?}",
                    self.label,
                    self.spikes.len(),
                    self.dim,
                    started.elapsed()
                );
                if let Some(tx) = notify {
                    // The sorter may have been reset in the meantime.
                    let _ = tx.send(components);
                }
                Ok(())
            }
            Err(err) => {
                log::warn!("PCA job for {} failed: {err}", self.label);
                Err(err)
            }
        }
    }
}
