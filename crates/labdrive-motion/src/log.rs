//! Timestamped CSV log of trajectory executions.

use labdrive_core::InstrResult;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::info;

/// `time,position` rows appended to `<dir>/<prefix>_<YYYYmmdd_HHMMSS>.csv`.
pub struct TrajectoryLog {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl TrajectoryLog {
    pub fn create(dir: &Path, prefix: &str) -> InstrResult<Self> {
        fs::create_dir_all(dir)?;
        let file_name = format!("{}_{}.csv", prefix, chrono::Local::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(file_name);
        let mut writer = csv::Writer::from_path(&path).map_err(std::io::Error::from)?;
        writer
            .write_record(["time", "position"])
            .map_err(std::io::Error::from)?;
        info!(path = %path.display(), "trajectory log created");
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, time: f64, position: f64) -> InstrResult<()> {
        self.writer
            .write_record([format!("{:.4}", time), format!("{:.6}", position)])
            .map_err(std::io::Error::from)?;
        Ok(())
    }

    pub fn extend(&mut self, samples: &[(f64, f64)]) -> InstrResult<()> {
        for (time, position) in samples {
            self.append(*time, *position)?;
        }
        self.flush()
    }

    pub fn flush(&mut self) -> InstrResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}
