use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::persist;
use crate::scheduler::EventId;

/// Terminal outcome of a verification case, keyed by its deadline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    Expired,
    Verified,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub event_id: EventId,
    pub outcome: LogOutcome,
    pub timestamp: DateTime<Utc>,
}

/// Append-only outcome ledger. `append` is a compare-and-insert: the first
/// writer for an event id wins, every later attempt is a no-op. Handlers
/// retried after a crash consult this before acting, which is what makes
/// the removal action at-most-once.
pub struct EventLog {
    path: PathBuf,
    entries: Mutex<BTreeMap<EventId, LogEntry>>,
}

impl EventLog {
    pub fn open(path: PathBuf) -> Result<Self> {
        let stored: Vec<LogEntry> = persist::load_snapshot(&path)?.unwrap_or_default();
        let entries = stored.into_iter().map(|e| (e.event_id, e)).collect();
        Ok(EventLog {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Returns false (and writes nothing) if an entry for `event_id`
    /// already exists.
    pub fn append(
        &self,
        event_id: EventId,
        outcome: LogOutcome,
        timestamp: DateTime<Utc>,
    ) -> Result<bool> {
        let mut entries = self.lock();
        if entries.contains_key(&event_id) {
            debug!("event {} already in the outcome ledger, append is a no-op", event_id);
            return Ok(false);
        }
        entries.insert(
            event_id,
            LogEntry {
                event_id,
                outcome,
                timestamp,
            },
        );
        let stored: Vec<LogEntry> = entries.values().copied().collect();
        persist::save_snapshot(&self.path, &stored)?;
        Ok(true)
    }

    pub fn contains(&self, event_id: EventId) -> bool {
        self.lock().contains_key(&event_id)
    }

    pub fn get(&self, event_id: EventId) -> Option<LogEntry> {
        self.lock().get(&event_id).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<EventId, LogEntry>> {
        self.entries.lock().expect("event log poisoned")
    }
}
