//! Membership verification lifecycle: `Pending` resolves to exactly one of
//! `Verified`, `Expired`, or `Cancelled`, and resolved cases are archived.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{format_iso8601_duration, parse_iso8601_duration};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::event_log::{EventLog, LogOutcome};
use crate::model::{ChatEvent, ChatId, UserChatKey, UserId};
use crate::persist;
use crate::scheduler::{ActionKind, EventId, EventPayload, ScheduledEvent, Scheduler};
use crate::settings::{SettingsPatch, SettingsStore};

/// Tag a new member must send to pass the check.
const INTRODUCTION_TAG: &str = "#ichbin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingVerification {
    pub key: UserChatKey,
    pub join_time: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub status: VerificationStatus,
    pub scheduled_event_id: EventId,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VerificationSnapshot {
    active: Vec<PendingVerification>,
    archive: Vec<PendingVerification>,
}

/// At most one active case per (chat, user); resolved cases move to the
/// archive until pruned.
pub struct VerificationStore {
    path: PathBuf,
    active: HashMap<UserChatKey, PendingVerification>,
    archive: Vec<PendingVerification>,
}

impl VerificationStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let snapshot: VerificationSnapshot = persist::load_snapshot(&path)?.unwrap_or_default();
        Ok(VerificationStore {
            path,
            active: snapshot.active.into_iter().map(|c| (c.key, c)).collect(),
            archive: snapshot.archive,
        })
    }

    pub fn get(&self, key: UserChatKey) -> Option<PendingVerification> {
        self.active.get(&key).copied()
    }

    pub fn pending_count(&self, chat_id: ChatId) -> usize {
        self.active.keys().filter(|k| k.chat_id == chat_id).count()
    }

    pub fn archived(&self) -> &[PendingVerification] {
        &self.archive
    }

    fn insert(&mut self, case: PendingVerification) {
        self.active.insert(case.key, case);
    }

    fn resolve(&mut self, key: UserChatKey, status: VerificationStatus) {
        if let Some(mut case) = self.active.remove(&key) {
            case.status = status;
            self.archive.push(case);
        }
    }

    fn persist(&self) -> Result<()> {
        let mut active: Vec<PendingVerification> = self.active.values().copied().collect();
        active.sort_by_key(|c| c.scheduled_event_id);
        persist::save_snapshot(
            &self.path,
            &VerificationSnapshot {
                active,
                archive: self.archive.clone(),
            },
        )
    }

    pub fn prune_archive(&mut self, older_than: DateTime<Utc>) -> Result<usize> {
        let before = self.archive.len();
        self.archive.retain(|c| c.deadline >= older_than);
        let removed = before - self.archive.len();
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }
}

pub struct Processor {
    settings: Arc<SettingsStore>,
    scheduler: Arc<Scheduler>,
    log: Arc<EventLog>,
    dispatcher: Arc<Dispatcher>,
    store: VerificationStore,
    admin_user_ids: Vec<UserId>,
    command_prefix: String,
}

impl Processor {
    pub fn new(
        settings: Arc<SettingsStore>,
        scheduler: Arc<Scheduler>,
        log: Arc<EventLog>,
        dispatcher: Arc<Dispatcher>,
        store: VerificationStore,
        admin_user_ids: Vec<UserId>,
        command_prefix: String,
    ) -> Self {
        Processor {
            settings,
            scheduler,
            log,
            dispatcher,
            store,
            admin_user_ids,
            command_prefix,
        }
    }

    pub fn store(&self) -> &VerificationStore {
        &self.store
    }

    pub fn prune_archive(&mut self, older_than: DateTime<Utc>) -> Result<usize> {
        self.store.prune_archive(older_than)
    }

    pub async fn handle_event(&mut self, event: ChatEvent) -> Result<()> {
        match event {
            ChatEvent::Join { key, timestamp } => self.on_join(key, timestamp),
            ChatEvent::Message {
                key,
                timestamp,
                text,
            } => self.on_message(key, timestamp, &text),
            ChatEvent::Leave { key, timestamp } => self.on_leave(key, timestamp),
        }
    }

    fn on_join(&mut self, key: UserChatKey, timestamp: DateTime<Utc>) -> Result<()> {
        let settings = self.settings.get(key.chat_id);
        if !settings.ichbin_enabled {
            debug!("chat {} has ichbin disabled, {} joins unverified", key.chat_id, key);
            return Ok(());
        }
        let waiting_time = chrono::Duration::from_std(settings.ichbin_waiting_time)
            .map_err(|e| Error::config(format!("ichbin_waiting_time out of range: {}", e)))?;
        let deadline = timestamp + waiting_time;

        // A re-join while a case is pending replaces the prior deadline
        // instead of stacking a second one.
        if let Some(prev) = self.store.get(key) {
            if self.scheduler.cancel(prev.scheduled_event_id)? {
                info!(
                    "{} rejoined, replacing deadline event {}",
                    key, prev.scheduled_event_id
                );
            }
        }

        let event_id = self.scheduler.enqueue(
            deadline,
            EventPayload {
                case: key,
                action: ActionKind::RemoveMember,
            },
        )?;
        self.store.insert(PendingVerification {
            key,
            join_time: timestamp,
            deadline,
            status: VerificationStatus::Pending,
            scheduled_event_id: event_id,
        });
        self.store.persist()?;
        info!("{} joined, ichbin deadline {} (event {})", key, deadline, event_id);
        Ok(())
    }

    fn on_message(&mut self, key: UserChatKey, timestamp: DateTime<Utc>, text: &str) -> Result<()> {
        if text.starts_with(&self.command_prefix) {
            return self.on_command(key, text);
        }
        if !text.contains(INTRODUCTION_TAG) {
            return Ok(());
        }
        let Some(case) = self.store.get(key) else {
            debug!("{} sent {} without a pending case, ignoring", key, INTRODUCTION_TAG);
            return Ok(());
        };
        if !self.scheduler.cancel(case.scheduled_event_id)? {
            // The deadline is already firing; expiry wins.
            warn!(
                "ichbin from {} raced deadline event {}, too late",
                key, case.scheduled_event_id
            );
            return Ok(());
        }
        self.log
            .append(case.scheduled_event_id, LogOutcome::Verified, timestamp)?;
        self.store.resolve(key, VerificationStatus::Verified);
        self.store.persist()?;
        info!("{} verified", key);
        Ok(())
    }

    fn on_leave(&mut self, key: UserChatKey, timestamp: DateTime<Utc>) -> Result<()> {
        let Some(case) = self.store.get(key) else {
            return Ok(());
        };
        if !self.scheduler.cancel(case.scheduled_event_id)? {
            return Ok(());
        }
        self.log
            .append(case.scheduled_event_id, LogOutcome::Cancelled, timestamp)?;
        self.store.resolve(key, VerificationStatus::Cancelled);
        self.store.persist()?;
        info!("{} left before resolving, case cancelled", key);
        Ok(())
    }

    /// Deadline handler registered with the scheduler. Claims the event in
    /// the outcome ledger before touching the network, so a crash-retried
    /// invocation never removes a member twice.
    pub async fn on_deadline(&mut self, event: ScheduledEvent) -> Result<()> {
        let key = event.payload.case;
        let Some(case) = self.store.get(key) else {
            debug!("deadline event {} has no active case, skipping", event.event_id);
            return Ok(());
        };
        if case.scheduled_event_id != event.event_id {
            debug!(
                "deadline event {} superseded by event {}, skipping",
                event.event_id, case.scheduled_event_id
            );
            return Ok(());
        }
        let claimed = self
            .log
            .append(event.event_id, LogOutcome::Expired, Utc::now())?;
        if claimed {
            match event.payload.action {
                ActionKind::RemoveMember => {
                    match self.dispatcher.remove_member(key.chat_id, key.user_id).await {
                        Ok(()) => info!("removed {}: no {} before deadline", key, INTRODUCTION_TAG),
                        // Recovered locally: the case still expires, the
                        // failure goes to the operational log for follow-up.
                        Err(e) => warn!("failed to remove {}: {}", key, e),
                    }
                }
            }
        } else {
            info!(
                "deadline event {} already in the ledger, skipping removal of {}",
                event.event_id, key
            );
        }
        self.store.resolve(key, VerificationStatus::Expired);
        self.store.persist()?;
        Ok(())
    }

    fn on_command(&mut self, key: UserChatKey, text: &str) -> Result<()> {
        if !self.admin_user_ids.contains(&key.user_id) {
            warn!("{} sent admin command without privilege: {:?}", key, text);
            return Ok(());
        }
        let rest = &text[self.command_prefix.len()..];
        let (command, args) = match rest.split_once(' ') {
            Some((command, args)) => (command, args.trim()),
            None => (rest, ""),
        };
        match command {
            "enable" => {
                self.settings.set(
                    key.chat_id,
                    SettingsPatch {
                        ichbin_enabled: Some(true),
                        ..Default::default()
                    },
                )?;
            }
            "disable" => {
                self.settings.set(
                    key.chat_id,
                    SettingsPatch {
                        ichbin_enabled: Some(false),
                        ..Default::default()
                    },
                )?;
            }
            "wait" => match parse_iso8601_duration(args) {
                Some(waiting_time) if !waiting_time.is_zero() => {
                    // Applies to future joins only; pending deadlines keep
                    // the waiting time they were created with.
                    self.settings.set(
                        key.chat_id,
                        SettingsPatch {
                            ichbin_waiting_time: Some(waiting_time),
                            ..Default::default()
                        },
                    )?;
                }
                _ => warn!(
                    "{} sent invalid waiting time {:?}, expected ISO-8601 like PT30S",
                    key, args
                ),
            },
            "status" => {
                let settings = self.settings.get(key.chat_id);
                info!(
                    "chat {}: ichbin_enabled={} ichbin_waiting_time={} pending_cases={}",
                    key.chat_id,
                    settings.ichbin_enabled,
                    format_iso8601_duration(settings.ichbin_waiting_time),
                    self.store.pending_count(key.chat_id)
                );
            }
            _ => warn!("{} sent unknown admin command {:?}", key, text),
        }
        Ok(())
    }
}
