use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::stage::StageName;

/// Status words written to the journal.
pub mod status {
    pub const STARTED: &str = "started";
    pub const PASSED: &str = "passed";
    pub const FAILED: &str = "failed";
    pub const INTERRUPTED: &str = "interrupted";
    pub const DECLINED: &str = "declined";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub run_id: String,
    pub stage: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl JournalEntry {
    fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() != 4 {
            return None;
        }
        Some(Self {
            run_id: parts[0].to_string(),
            stage: parts[1].to_string(),
            status: parts[2].to_string(),
            timestamp: DateTime::parse_from_rfc3339(parts[3])
                .ok()?
                .with_timezone(&Utc),
        })
    }
}

/// Local, append-only record of stage transitions.
///
/// Only ever read back for display; the backend decides where a run resumes.
pub struct RunJournal {
    path: PathBuf,
    run_id: String,
}

impl RunJournal {
    /// Open a journal for a new run with a fresh id.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            run_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, stage: &str, status: &str) -> Result<()> {
        let entry = format!(
            "{}|{}|{}|{}\n",
            self.run_id,
            stage,
            status,
            Utc::now().to_rfc3339()
        );

        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open run journal")?
            .write_all(entry.as_bytes())
            .context("Failed to write run journal entry")?;

        Ok(())
    }

    pub fn record_stage(&self, stage: StageName, status: &str) -> Result<()> {
        self.record(stage.as_str(), status)
    }

    /// All parseable entries; malformed lines are skipped.
    pub fn entries(path: &Path) -> Result<Vec<JournalEntry>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path).context("Failed to read run journal")?;
        Ok(content.lines().filter_map(JournalEntry::parse).collect())
    }

    /// Entries of the most recent run in the file.
    pub fn last_run(path: &Path) -> Result<Vec<JournalEntry>> {
        let entries = Self::entries(path)?;
        let Some(last_id) = entries.last().map(|e| e.run_id.clone()) else {
            return Ok(Vec::new());
        };
        Ok(entries.into_iter().filter(|e| e.run_id == last_id).collect())
    }

    pub fn reset(path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_file(path).context("Failed to remove run journal")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_journal_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("qarun.journal");
        assert!(RunJournal::entries(&path).unwrap().is_empty());
        assert!(RunJournal::last_run(&path).unwrap().is_empty());
    }

    #[test]
    fn test_record_and_read_back() {
        let dir = tempdir().unwrap();
        let journal = RunJournal::new(dir.path().join("qarun.journal"));
        journal.record_stage(StageName::Led, status::STARTED).unwrap();
        journal.record_stage(StageName::Led, status::PASSED).unwrap();

        let entries = RunJournal::entries(journal.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].stage, "led");
        assert_eq!(entries[1].status, "passed");
        assert!(entries.iter().all(|e| e.run_id == journal.run_id()));
    }

    #[test]
    fn test_last_run_only_returns_latest_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("qarun.journal");
        let first = RunJournal::new(&path);
        first.record_stage(StageName::Setup, status::FAILED).unwrap();
        let second = RunJournal::new(&path);
        second.record_stage(StageName::Setup, status::PASSED).unwrap();
        second.record_stage(StageName::Gpu, status::STARTED).unwrap();

        let last = RunJournal::last_run(&path).unwrap();
        assert_eq!(last.len(), 2);
        assert!(last.iter().all(|e| e.run_id == second.run_id()));
        assert_ne!(first.run_id(), second.run_id());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("qarun.journal");
        std::fs::write(
            &path,
            "garbage\nabc|setup|passed|2026-01-01T00:00:00+00:00\nabc|led|passed|not-a-time\n",
        )
        .unwrap();
        let entries = RunJournal::entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stage, "setup");
    }

    #[test]
    fn test_reset_removes_file() {
        let dir = tempdir().unwrap();
        let journal = RunJournal::new(dir.path().join("qarun.journal"));
        journal.record("final", status::INTERRUPTED).unwrap();
        RunJournal::reset(journal.path()).unwrap();
        assert!(!journal.path().exists());
        RunJournal::reset(journal.path()).unwrap();
    }
}
