use std::{
    collections::{HashSet, VecDeque},
    path::PathBuf,
};

use anyhow::{Context, Result};
use pipebot_core::{load_state, save_state, VersionedState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    schema_version: u32,
    #[serde(default, rename = "processed_event_keys")]
    keys: VecDeque<String>,
}

impl Default for LedgerFile {
    fn default() -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION,
            keys: VecDeque::new(),
        }
    }
}

impl VersionedState for LedgerFile {
    const SCHEMA_VERSION: u32 = 1;

    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

/// Most recent `cap` event keys the bridge has acted on, oldest first.
/// Slack redelivers envelopes it considers unacknowledged, and a channel
/// mention arrives both as `app_mention` and as `message`.
pub(super) struct ProcessedEventLedger {
    path: PathBuf,
    cap: usize,
    file: LedgerFile,
    seen: HashSet<String>,
}

impl ProcessedEventLedger {
    pub(super) fn open(path: PathBuf, cap: usize) -> Result<Self> {
        let file = load_state::<LedgerFile>(&path)
            .with_context(|| format!("failed to open slack event ledger {}", path.display()))?;
        let seen = file.keys.iter().cloned().collect();
        let mut ledger = Self {
            path,
            cap: cap.max(1),
            file,
            seen,
        };
        ledger.evict_overflow();
        Ok(ledger)
    }

    /// Records `key`; false means it was already there.
    pub(super) fn record(&mut self, key: &str) -> bool {
        if !self.seen.insert(key.to_string()) {
            return false;
        }
        self.file.keys.push_back(key.to_string());
        self.evict_overflow();
        true
    }

    pub(super) fn persist(&self) -> Result<()> {
        save_state(&self.path, &self.file).context("failed to persist slack event ledger")
    }

    fn evict_overflow(&mut self) {
        while self.file.keys.len() > self.cap {
            if let Some(evicted) = self.file.keys.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}
