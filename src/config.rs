use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::sorting::error::SortError;
use crate::sorting::pca::ComponentOrder;

/// Tunables shared by every electrode's sorter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterConfig {
    /// Spikes kept in the ring buffer; a full lap triggers the first PCA job.
    pub buffer_size: usize,
    /// Check PCA units before box units when classifying.
    pub pca_first: bool,
    /// Display range headroom, in multiples of the observed projection range.
    pub range_padding: f32,
    pub component_order: ComponentOrder,
    /// Per-channel gate applied before a spike reaches the sorter (µV).
    pub default_threshold_uv: f32,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            buffer_size: 200,
            pca_first: true,
            range_padding: 1.5,
            component_order: ComponentOrder::Index,
            default_threshold_uv: -50.0,
        }
    }
}

impl SorterConfig {
    pub fn validate(&self) -> Result<(), SortError> {
        if self.buffer_size == 0 {
            return Err(SortError::Config("buffer_size must be at least 1".into()));
        }
        if !self.range_padding.is_finite() || self.range_padding < 0.0 {
            return Err(SortError::Config(format!(
                "range_padding must be a finite, non-negative number, got {}",
                self.range_padding
            )));
        }
        Ok(())
    }

    pub fn from_json_str(text: &str) -> Result<Self, SortError> {
        let config: SorterConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SortError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
