use thiserror::Error;

/// Problems building a spike container from raw acquisition data.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SpikeError {
    #[error("spike channel must have at least one channel")]
    NoChannels,
    #[error("spike channel must have at least two samples per channel, got {0}")]
    TooFewSamples(usize),
    #[error("sample rate must be greater than zero")]
    InvalidSampleRate,
    #[error("waveform buffer length mismatch: expected {expected}, got {actual}")]
    BufferLength { expected: usize, actual: usize },
}

/// Failure of a single PCA job. A failed job never publishes components.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PcaError {
    #[error("PCA batch is empty")]
    EmptyBatch,
    #[error("PCA batch needs at least two feature dimensions, got {0}")]
    DimensionTooSmall(usize),
    #[error("spike dimension mismatch inside PCA batch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("non-finite sample at feature {index} of the PCA batch")]
    NonFinite { index: usize },
    #[error("SVD did not converge for singular value {index} after {iterations} iterations")]
    NoConvergence { index: usize, iterations: usize },
}

/// Crate level error for everything outside the classification hot path.
#[derive(Debug, Error)]
pub enum SortError {
    #[error(transparent)]
    Spike(#[from] SpikeError),
    #[error(transparent)]
    Pca(#[from] PcaError),
    #[error("failed to (de)serialize sorter state: {0}")]
    Persist(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("snapshot describes {expected} PCA dimensions but carries {actual}")]
    SnapshotDimensions { expected: usize, actual: usize },
}
