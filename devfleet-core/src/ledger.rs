//! Recent automation failures, used to back off expensive retries.

use std::{fmt, path::Path, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{config::Timing, error::Result, store::DocumentStore};

const ENTRIES: &str = "Errors";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// An install stopped making progress.
    Stalled,
    /// An install raised an alert no rule could answer.
    Alert,
    /// An external tool call failed outright.
    Execution,
    /// Verification found devices still missing required apps.
    Verification,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Stalled => "stalled",
            FailureKind::Alert => "alert",
            FailureKind::Execution => "execution",
            FailureKind::Verification => "verification",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub kind: FailureKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Append/trim log stored as `<id>.errors`.
#[derive(Debug)]
pub struct ErrorLedger {
    store: DocumentStore,
    threshold: usize,
    cooldown: Duration,
}

impl ErrorLedger {
    pub fn open(dir: &Path, id: &str, timing: &Timing) -> Self {
        Self {
            store: DocumentStore::new(
                dir,
                &format!("{id}.errors"),
                Some(timing.lock_timeout),
                timing.lock_poll,
            ),
            threshold: timing.error_threshold,
            cooldown: timing.error_cooldown,
        }
    }

    pub fn entries(&self) -> Result<Vec<FailureEntry>> {
        Ok(self.store.get_as(ENTRIES)?.unwrap_or_default())
    }

    pub fn add(
        &self,
        kind: FailureKind,
        detail: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.store.lock()?;
        let mut entries = self.entries()?;
        entries.push(FailureEntry {
            kind,
            timestamp: at,
            detail,
        });
        // Only the most recent run of failures matters for backoff.
        let keep = self.threshold.max(1) * 4;
        if entries.len() > keep {
            entries.drain(..entries.len() - keep);
        }
        self.store.set(ENTRIES, &entries)?;
        debug!(kind = %kind, count = entries.len(), "recorded failure");
        Ok(())
    }

    pub fn last(&self) -> Result<Option<FailureEntry>> {
        Ok(self.entries()?.pop())
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.entries()?.len())
    }

    pub fn clear(&self) -> Result<()> {
        let empty: Vec<FailureEntry> = Vec::new();
        self.store.set(ENTRIES, empty)?;
        Ok(())
    }

    /// True when at least `threshold` failures are recorded and the most
    /// recent is younger than the cooldown.
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> Result<bool> {
        let entries = self.entries()?;
        if entries.len() < self.threshold.max(1) {
            return Ok(false);
        }
        let Some(last) = entries.last() else {
            return Ok(false);
        };
        let cooldown = chrono::Duration::from_std(self.cooldown)
            .unwrap_or(chrono::Duration::MAX);
        Ok(now.signed_duration_since(last.timestamp) < cooldown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger(dir: &TempDir) -> ErrorLedger {
        ErrorLedger::open(dir.path(), "edu.example.test", &Timing::default())
    }

    #[test]
    fn cooldown_needs_threshold_failures() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let now = Utc::now();

        ledger.add(FailureKind::Stalled, None, now).unwrap();
        ledger.add(FailureKind::Alert, Some("Cannot connect".into()), now).unwrap();
        assert!(!ledger.in_cooldown(now).unwrap());

        ledger.add(FailureKind::Verification, None, now).unwrap();
        assert!(ledger.in_cooldown(now).unwrap());
        assert!(!ledger.in_cooldown(now + chrono::Duration::hours(2)).unwrap());
    }

    #[test]
    fn clear_resets_the_ledger() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        for _ in 0..5 {
            ledger.add(FailureKind::Execution, None, Utc::now()).unwrap();
        }
        assert_eq!(ledger.count().unwrap(), 5);
        assert_eq!(ledger.last().unwrap().unwrap().kind, FailureKind::Execution);

        ledger.clear().unwrap();
        assert_eq!(ledger.count().unwrap(), 0);
        assert!(ledger.last().unwrap().is_none());
    }

    #[test]
    fn ledger_is_trimmed_to_recent_failures() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        for _ in 0..20 {
            ledger.add(FailureKind::Stalled, None, Utc::now()).unwrap();
        }
        assert_eq!(ledger.count().unwrap(), 12);
    }
}
