// src/lib.rs
pub mod config;
pub mod recorder;
pub mod sorting;

pub use config::SorterConfig;
pub use recorder::SortRecorder;
