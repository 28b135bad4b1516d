// src/sorting/mod.rs
// 声明同级目录下的子模块文件
pub mod box_unit;
pub mod buffer;
pub mod electrode;
pub mod error;
pub mod geometry;
pub mod palette;
pub mod pca;
pub mod pca_unit;
pub mod persist;
pub mod pipeline;
pub mod registry;
pub mod sorter;
pub mod source;
pub mod spike;
pub mod stats;
pub mod svd;
pub mod worker;
// 公开导出这些模块里的结构体，方便外部调用
pub use box_unit::{BoxUnit, SortBox};
pub use buffer::SpikeRing;
pub use electrode::{Electrode, SortedSpike, SpikeSorter};
pub use error::{PcaError, SortError, SpikeError};
pub use geometry::{segments_intersect, Point, Polygon};
pub use palette::{unit_color, Rgb};
pub use pca::{ComponentOrder, PcaJob, PcaRange, PrincipalComponents};
pub use pca_unit::PcaUnit;
pub use persist::SorterSnapshot;
pub use pipeline::{PipelineStats, SortingPipeline};
pub use registry::UnitIdRegistry;
pub use sorter::{PcaPhase, Selection, Sorter};
pub use source::{ManualSource, SpikeEvent, SpikeSource};
pub use spike::{Spike, SpikeChannel, SpikeHandle, SpikeLabel};
pub use stats::WaveformStats;
pub use worker::PcaWorker;
