use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeLogEntry {
    pub filename: String,
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Cumulative upload attempts for this file across runs.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: String,
}

impl ResumeLogEntry {
    pub fn success(filename: impl Into<String>, url: impl Into<String>, attempts: u32) -> Self {
        Self {
            filename: filename.into(),
            status: EntryStatus::Success,
            url: Some(url.into()),
            attempts,
            last_error: None,
            updated_at: timestamp(),
        }
    }

    pub fn failed(filename: impl Into<String>, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            filename: filename.into(),
            status: EntryStatus::Failed,
            url: None,
            attempts,
            last_error: Some(error.into()),
            updated_at: timestamp(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == EntryStatus::Success
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Merged view of a resume log, keyed by filename.
pub type ResumeState = BTreeMap<String, ResumeLogEntry>;

/// Reads and merges a resume log. A missing file is an empty log; lines
/// that do not parse are skipped.
pub fn load_resume_log(path: &Path) -> Result<ResumeState> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ResumeState::new()),
        Err(e) => return Err(e.into()),
    };

    let mut state = ResumeState::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: ResumeLogEntry = match serde_json::from_str(&line) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(
                    event = "resume_log.corrupt_line",
                    path = %path.display(),
                    line = idx + 1,
                    error = %e,
                    "resume_log.corrupt_line"
                );
                continue;
            }
        };
        merge_entry(&mut state, entry);
    }
    Ok(state)
}

/// Last entry wins, except that the attempt count never goes down.
pub fn merge_entry(state: &mut ResumeState, mut entry: ResumeLogEntry) {
    if let Some(prev) = state.get(&entry.filename) {
        entry.attempts = entry.attempts.max(prev.attempts);
    }
    state.insert(entry.filename.clone(), entry);
}

/// Single-writer appender. Each entry is flushed before `append` returns.
pub struct ResumeLog {
    file: File,
}

impl ResumeLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    pub fn append(&mut self, entry: &ResumeLogEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}
