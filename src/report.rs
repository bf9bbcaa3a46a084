use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::progress::ProgressSink;
use crate::work::{FileOutcome, ItemState};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Downloaded,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub timestamp: String,
    pub name: String,
    pub status: TransferStatus,
    pub attempts: u32,
    pub bytes: u64,
    pub error: Option<String>,
}

/// Append-only JSON Lines record of every file a sync run settled
pub struct TransferReport {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl TransferReport {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create report directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open transfer report {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn add_record(&mut self, record: &TransferRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Vec<TransferRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path).context("Failed to open transfer report for reading")?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

impl ProgressSink for TransferReport {
    fn file_finished(&mut self, outcome: &FileOutcome) {
        let status = match outcome.state {
            ItemState::Success => TransferStatus::Downloaded,
            _ => TransferStatus::Failed,
        };
        let record = TransferRecord {
            timestamp: Utc::now().to_rfc3339(),
            name: outcome.name.clone(),
            status,
            attempts: outcome.attempts,
            bytes: outcome.bytes,
            error: outcome.error.clone(),
        };
        if let Err(e) = self.add_record(&record) {
            warn!(report = %self.path.display(), error = %e, "cannot append to transfer report");
        }
    }
}
