use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::sorting::error::SpikeError;
use crate::sorting::geometry::Point;
use crate::sorting::palette::Rgb;

/// Shape of the spikes an electrode produces.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpikeChannel {
    pub num_channels: usize,
    pub samples_per_channel: usize,
    pub sample_rate_hz: f32,
}

impl SpikeChannel {
    pub fn new(
        num_channels: usize,
        samples_per_channel: usize,
        sample_rate_hz: f32,
    ) -> Result<Self, SpikeError> {
        let channel = Self {
            num_channels,
            samples_per_channel,
            sample_rate_hz,
        };
        channel.validate()?;
        Ok(channel)
    }

    pub fn validate(&self) -> Result<(), SpikeError> {
        if self.num_channels == 0 {
            return Err(SpikeError::NoChannels);
        }
        if self.samples_per_channel < 2 {
            return Err(SpikeError::TooFewSamples(self.samples_per_channel));
        }
        if self.sample_rate_hz.is_nan() || self.sample_rate_hz <= 0.0 {
            return Err(SpikeError::InvalidSampleRate);
        }
        Ok(())
    }

    /// Number of PCA features: every sample of every channel.
    pub fn dimension(&self) -> usize {
        self.num_channels * self.samples_per_channel
    }

    /// Duration covered by one waveform, in microseconds.
    pub fn span_microseconds(&self) -> f32 {
        1.0 / self.sample_rate_hz * self.samples_per_channel as f32 * 1e6
    }
}

/// Per-event classification result, written by the sorter and read by display code.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpikeLabel {
    /// `0` means unclassified; unit ids start at 1.
    pub sorted_id: u16,
    pub color: Rgb,
    pub projection: Point,
}

impl Default for SpikeLabel {
    fn default() -> Self {
        Self {
            sorted_id: 0,
            color: Rgb::UNSORTED,
            projection: Point::ORIGIN,
        }
    }
}

/// One detected spike: immutable waveform plus a mutable label.
#[derive(Debug)]
pub struct Spike {
    channel: SpikeChannel,
    timestamp: i64,
    data: Box<[f32]>, // channel-major: data[bin + ch * samples_per_channel]
    label: Mutex<SpikeLabel>,
}

/// Spikes are shared between the ring buffer, the classifier and display code.
pub type SpikeHandle = Arc<Spike>;

impl Spike {
    pub fn new(
        channel: SpikeChannel,
        sorted_id: u16,
        timestamp: i64,
        data: Vec<f32>,
    ) -> Result<Self, SpikeError> {
        channel.validate()?;
        let expected = channel.dimension();
        if data.len() != expected {
            return Err(SpikeError::BufferLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            channel,
            timestamp,
            data: data.into_boxed_slice(),
            label: Mutex::new(SpikeLabel {
                sorted_id,
                ..SpikeLabel::default()
            }),
        })
    }

    pub fn into_handle(self) -> SpikeHandle {
        Arc::new(self)
    }

    pub fn channel(&self) -> &SpikeChannel {
        &self.channel
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Samples of a single channel, or `None` for an invalid channel.
    pub fn channel_data(&self, ch: usize) -> Option<&[f32]> {
        if ch >= self.channel.num_channels {
            return None;
        }
        let n = self.channel.samples_per_channel;
        Some(&self.data[ch * n..(ch + 1) * n])
    }

    pub fn index_to_microvolts(&self, index: usize) -> f32 {
        self.data[index]
    }

    pub fn bin_to_microvolts(&self, bin: usize, ch: usize) -> f32 {
        debug_assert!(ch < self.channel.num_channels);
        debug_assert!(bin < self.channel.samples_per_channel);
        self.data[bin + ch * self.channel.samples_per_channel]
    }

    pub fn time_bin_to_microseconds(&self, bin: usize) -> f32 {
        let last = (self.channel.samples_per_channel - 1) as f32;
        bin as f32 / last * self.channel.span_microseconds()
    }

    /// `t = 0` is the left-most bin; results are clamped to the waveform.
    pub fn microseconds_to_time_bin(&self, t: f32) -> usize {
        let last = (self.channel.samples_per_channel - 1) as f32;
        let bin = t / self.channel.span_microseconds() * last;
        bin.clamp(0.0, last) as usize
    }

    pub fn minimum(&self, ch: usize) -> Option<f32> {
        self.channel_data(ch)
            .map(|samples| samples.iter().copied().fold(f32::INFINITY, f32::min))
    }

    pub fn maximum(&self, ch: usize) -> Option<f32> {
        self.channel_data(ch)
            .map(|samples| samples.iter().copied().fold(f32::NEG_INFINITY, f32::max))
    }

    /// True when the minimum on every channel lies below that channel's threshold.
    /// Channels without a threshold entry are not gated.
    pub fn check_thresholds(&self, thresholds: &[f32]) -> bool {
        thresholds
            .iter()
            .take(self.channel.num_channels)
            .enumerate()
            .all(|(ch, threshold)| self.minimum(ch).is_some_and(|min| min < *threshold))
    }

    /// Dot product of the waveform with a projection vector.
    pub fn project(&self, component: &[f32]) -> f32 {
        self.data
            .iter()
            .zip(component)
            .map(|(v, pc)| v * pc)
            .sum()
    }

    fn lock_label(&self) -> MutexGuard<'_, SpikeLabel> {
        self.label.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn label(&self) -> SpikeLabel {
        *self.lock_label()
    }

    pub fn sorted_id(&self) -> u16 {
        self.lock_label().sorted_id
    }

    pub fn color(&self) -> Rgb {
        self.lock_label().color
    }

    pub fn projection(&self) -> Point {
        self.lock_label().projection
    }

    pub fn set_projection(&self, projection: Point) {
        self.lock_label().projection = projection;
    }

    pub fn assign(&self, sorted_id: u16, color: Rgb) {
        let mut label = self.lock_label();
        label.sorted_id = sorted_id;
        label.color = color;
    }
}
