use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const SCALARS_FILE: &str = "scalars.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub tag: String,
    pub step: usize,
    pub value: f64,
    pub wall_time: f64,
}

/// Appends scalar metrics as JSON lines under a log directory, one event
/// per line, for plotting by external tools.
pub struct ScalarWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ScalarWriter {
    pub fn create(log_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed creating log directory: {}", log_dir.display()))?;
        let path = log_dir.join(SCALARS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed opening scalar log: {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> anyhow::Result<()> {
        let event = ScalarEvent {
            tag: tag.to_string(),
            step,
            value,
            wall_time: Utc::now().timestamp_millis() as f64 / 1000.0,
        };
        serde_json::to_writer(&mut self.writer, &event)?;
        self.writer
            .write_all(b"\n")
            .with_context(|| format!("Failed writing scalar log: {}", self.path.display()))
    }

    /// Flushes buffered events; called once per epoch.
    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("Failed flushing scalar log: {}", self.path.display()))
    }
}

impl Drop for ScalarWriter {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

#[cfg(test)]
pub fn read_scalars(path: &Path) -> anyhow::Result<Vec<ScalarEvent>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed reading scalar log: {}", path.display()))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).context("Malformed scalar event"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        {
            let mut writer = ScalarWriter::create(&log_dir).unwrap();
            writer.add_scalar("loss/train_loss", 0.5, 0).unwrap();
            writer.add_scalar("loss/IOU", 0.25, 0).unwrap();
            writer.flush().unwrap();
        }
        {
            let mut writer = ScalarWriter::create(&log_dir).unwrap();
            writer.add_scalar("loss/train_loss", 0.4, 1).unwrap();
        }

        let events = read_scalars(&log_dir.join(SCALARS_FILE)).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].tag, "loss/IOU");
        assert_eq!(events[2].step, 1);
        assert!((events[2].value - 0.4).abs() < 1e-12);
        assert!(events[0].wall_time > 0.0);
    }
}
