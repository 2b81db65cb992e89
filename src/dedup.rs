//! Per-task ledger of processed listings.
//!
//! The ledger is append-only NDJSON. Each line is written and synced before the
//! listing's key enters the seen set, so a crash before `record` returns means
//! the listing is processed again next run and never lost.

use crate::models::{LedgerEntry, ListingKey};
use serde_json::Value;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unreadable at {path}: {message}")]
    Unreadable { path: String, message: String },
    #[error("ledger write failed: {0}")]
    Write(String),
    #[error("ledger entry not serializable: {0}")]
    Encode(String),
}

pub struct DedupStore {
    path: PathBuf,
    seen: HashSet<ListingKey>,
}

pub fn ledger_file_name(keyword: &str) -> String {
    format!("{}_full_data.jsonl", keyword.replace(' ', "_"))
}

impl DedupStore {
    /// Replays the ledger for `keyword`. A missing file is an empty history;
    /// an unreadable one is fatal for the task.
    pub async fn load(dir: &Path, keyword: &str) -> Result<Self, LedgerError> {
        let path = dir.join(ledger_file_name(keyword));
        let mut seen = HashSet::new();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(LedgerError::Unreadable {
                    path: path.display().to_string(),
                    message: err.to_string(),
                });
            }
        };

        let mut skipped = 0usize;
        for (line_no, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match key_from_line(line) {
                Some(key) => {
                    seen.insert(key);
                }
                None => {
                    skipped += 1;
                    warn!(
                        target = "argus.ledger",
                        path = %path.display(),
                        line = line_no + 1,
                        "ledger_line_skipped"
                    );
                }
            }
        }
        info!(
            target = "argus.ledger",
            path = %path.display(),
            seen = seen.len(),
            skipped,
            "ledger_loaded"
        );
        Ok(Self { path, seen })
    }

    pub fn is_new(&self, key: &ListingKey) -> bool {
        !self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line, syncs it to disk, then marks the key seen.
    pub async fn record(&mut self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let mut line =
            serde_json::to_string(entry).map_err(|err| LedgerError::Encode(err.to_string()))?;
        line.push('\n');

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| LedgerError::Write(err.to_string()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| LedgerError::Write(err.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|err| LedgerError::Write(err.to_string()))?;
        file.sync_data()
            .await
            .map_err(|err| LedgerError::Write(err.to_string()))?;

        self.seen.insert(entry.key());
        Ok(())
    }
}

/// Only the link matters for replay, so older or partially-shaped lines still count.
fn key_from_line(line: &str) -> Option<ListingKey> {
    let value: Value = serde_json::from_str(line).ok()?;
    let link = crate::safe_path::lookup(&value, crate::path!["listing", "link"])?.as_str()?;
    Some(ListingKey::from_link(link))
}
