use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ResolvedDefaults;
use crate::error::Result;
use crate::model::ChatId;
use crate::persist;

/// Effective per-chat policy: the stored override merged onto the
/// process-wide defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatSettings {
    pub chat_id: ChatId,
    pub ichbin_enabled: bool,
    pub ichbin_waiting_time: Duration,
}

/// Sparse override. Fields left `None` keep following the process defaults,
/// including defaults from future process starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ichbin_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ichbin_waiting_time: Option<Duration>,
}

impl SettingsPatch {
    fn merge(&mut self, patch: &SettingsPatch) {
        if let Some(enabled) = patch.ichbin_enabled {
            self.ichbin_enabled = Some(enabled);
        }
        if let Some(waiting_time) = patch.ichbin_waiting_time {
            self.ichbin_waiting_time = Some(waiting_time);
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    defaults: ResolvedDefaults,
    overrides: Mutex<HashMap<ChatId, SettingsPatch>>,
    // Materialized per-chat view, filled lazily on first lookup.
    merged: DashMap<ChatId, ChatSettings>,
}

impl SettingsStore {
    pub fn open(path: PathBuf, defaults: ResolvedDefaults) -> Result<Self> {
        let overrides: HashMap<ChatId, SettingsPatch> =
            persist::load_snapshot(&path)?.unwrap_or_default();
        Ok(SettingsStore {
            path,
            defaults,
            overrides: Mutex::new(overrides),
            merged: DashMap::new(),
        })
    }

    pub fn get(&self, chat_id: ChatId) -> ChatSettings {
        if let Some(settings) = self.merged.get(&chat_id) {
            return *settings;
        }
        let overrides = self.overrides.lock().expect("settings store poisoned");
        let merged = self.merge(chat_id, overrides.get(&chat_id));
        drop(overrides);
        self.merged.insert(chat_id, merged);
        merged
    }

    pub fn set(&self, chat_id: ChatId, patch: SettingsPatch) -> Result<()> {
        let mut overrides = self.overrides.lock().expect("settings store poisoned");
        overrides.entry(chat_id).or_default().merge(&patch);
        persist::save_snapshot(&self.path, &*overrides)?;
        let merged = self.merge(chat_id, overrides.get(&chat_id));
        drop(overrides);
        self.merged.insert(chat_id, merged);
        info!(
            "settings updated for chat {}: enabled={} waiting_time={:?}",
            chat_id, merged.ichbin_enabled, merged.ichbin_waiting_time
        );
        Ok(())
    }

    fn merge(&self, chat_id: ChatId, patch: Option<&SettingsPatch>) -> ChatSettings {
        let patch = patch.copied().unwrap_or_default();
        ChatSettings {
            chat_id,
            ichbin_enabled: patch.ichbin_enabled.unwrap_or(self.defaults.ichbin_enabled),
            ichbin_waiting_time: patch
                .ichbin_waiting_time
                .unwrap_or(self.defaults.ichbin_waiting_time),
        }
    }
}
