use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::sorting::electrode::SortedSpike;
use crate::sorting::error::SortError;

const HEADER: &str = "timestamp,electrode,sorted_id,pc1,pc2";

/// CSV log of classified spikes, one row per spike.
pub struct SortRecorder {
    writer: BufWriter<File>,
    path: PathBuf,
    rows: usize,
}

impl SortRecorder {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SortError> {
        let path = path.as_ref().to_path_buf();
        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "{HEADER}")?;
        log::info!("recording sorted spikes to {}", path.display());
        Ok(Self {
            writer,
            path,
            rows: 0,
        })
    }

    /// Opens `sorted_spikes_<label>_<unix seconds>.csv` inside `dir`.
    pub fn start(dir: impl AsRef<Path>, label: &str) -> Result<Self, SortError> {
        // 文件名带时间戳和标签，方便区分多次录制
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let filename = format!("sorted_spikes_{label}_{timestamp}.csv");
        Self::create(dir.as_ref().join(filename))
    }

    pub fn write_spike(&mut self, sorted: &SortedSpike) -> Result<(), SortError> {
        let projection = sorted.spike.projection();
        writeln!(
            self.writer,
            "{},{},{},{:.4},{:.4}",
            sorted.spike.timestamp(),
            sorted.electrode,
            sorted.sorted_id.unwrap_or(0),
            projection.x,
            projection.y
        )?;
        self.rows += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SortError> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stop(mut self) -> Result<PathBuf, SortError> {
        self.flush()?;
        log::info!("saved {} sorted spikes to {}", self.rows, self.path.display());
        Ok(self.path)
    }
}
