use ndarray::Array2;

use crate::sorting::spike::Spike;

/// Running per-sample mean and variance of the waveforms assigned to a unit
/// (Welford's method, channels x samples).
#[derive(Clone, Debug, Default)]
pub struct WaveformStats {
    mean: Option<Array2<f64>>,
    m2: Option<Array2<f64>>,
    num_samples: u64,
    last_spike_time_s: f64,
    new_data: bool,
}

impl WaveformStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.mean = None;
        self.m2 = None;
        self.num_samples = 0;
        self.new_data = false;
    }

    /// The next update reallocates for whatever length that spike has.
    pub fn resize_waveform(&mut self, _new_length: usize) {
        self.reset();
    }

    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    /// Timestamp of the most recent spike, in seconds.
    pub fn last_spike_time_s(&self) -> f64 {
        self.last_spike_time_s
    }

    pub fn update(&mut self, spike: &Spike) {
        let channel = spike.channel();
        let shape = (channel.num_channels, channel.samples_per_channel);
        self.last_spike_time_s = spike.timestamp() as f64 / f64::from(channel.sample_rate_hz);
        self.new_data = true;

        let reallocate = self.mean.as_ref().map_or(true, |m| m.dim() != shape);
        if reallocate {
            self.mean = Some(Array2::zeros(shape));
            self.m2 = Some(Array2::zeros(shape));
            self.num_samples = 0;
        }
        let (Some(mean), Some(m2)) = (self.mean.as_mut(), self.m2.as_mut()) else {
            return;
        };

        self.num_samples += 1;
        let n = self.num_samples as f64;
        for ((ch, bin), mu) in mean.indexed_iter_mut() {
            let x = f64::from(spike.bin_to_microvolts(bin, ch));
            let delta = x - *mu;
            *mu += delta / n;
            m2[[ch, bin]] += delta * (x - *mu);
        }
    }

    /// Mean waveform of one channel; empty before the first update.
    pub fn mean(&self, ch: usize) -> Vec<f64> {
        match &self.mean {
            Some(mean) if self.num_samples > 0 && ch < mean.nrows() => mean.row(ch).to_vec(),
            _ => Vec::new(),
        }
    }

    /// Sample standard deviation of one channel; zeros after a single spike.
    pub fn standard_deviation(&self, ch: usize) -> Vec<f64> {
        match &self.m2 {
            Some(m2) if self.num_samples > 0 && ch < m2.nrows() => {
                if self.num_samples < 2 {
                    return vec![0.0; m2.ncols()];
                }
                let denom = (self.num_samples - 1) as f64;
                m2.row(ch).iter().map(|s| (s / denom).sqrt()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Returns true once per batch of updates.
    pub fn take_new_data(&mut self) -> bool {
        std::mem::take(&mut self.new_data)
    }
}
