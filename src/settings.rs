use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration as StdDuration,
};

use crate::{
    background::WakeHorizons, db::models::profile::clamp_pause_minutes, strategy::EngineOptions,
};

pub const VALIDATOR_URL_ENV: &str = "FOCUSLOCK_VALIDATOR_URL";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FocusSettings {
    /// Cap for recovery wakes chained from inside a wake.
    pub recovery_horizon_secs: u32,
    /// Cap for the wake requested when a pause starts or the app is
    /// backgrounded.
    pub background_horizon_secs: u32,
    pub token_timeout_secs: u32,
    pub validator_base_url: Option<String>,
    pub suggested_pause_minutes: u32,
    pub suggested_timer_minutes: u32,
}

impl Default for FocusSettings {
    fn default() -> Self {
        Self {
            recovery_horizon_secs: 60,
            background_horizon_secs: 30,
            token_timeout_secs: 10,
            validator_base_url: None,
            suggested_pause_minutes: 15,
            suggested_timer_minutes: 25,
        }
    }
}

impl FocusSettings {
    pub fn horizons(&self) -> WakeHorizons {
        WakeHorizons {
            recovery: Duration::seconds(i64::from(self.recovery_horizon_secs.max(1))),
            background: Duration::seconds(i64::from(self.background_horizon_secs.max(1))),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            token_timeout: StdDuration::from_secs(u64::from(self.token_timeout_secs.max(1))),
            suggested_pause_minutes: clamp_pause_minutes(self.suggested_pause_minutes),
            suggested_timer_minutes: self.suggested_timer_minutes.max(1),
        }
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(VALIDATOR_URL_ENV) {
            let url = url.trim();
            if !url.is_empty() {
                self.validator_base_url = Some(url.to_string());
            }
        }
        self
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<FocusSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!("Ignoring unreadable settings at {}: {err}", path.display());
                FocusSettings::default()
            })
        } else {
            FocusSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, FocusSettings> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, FocusSettings> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Effective settings: the file contents with environment overrides
    /// applied on top.
    pub fn settings(&self) -> FocusSettings {
        self.read_guard().clone().with_env_overrides()
    }

    pub fn update(&self, settings: FocusSettings) -> Result<()> {
        let mut guard = self.write_guard();
        *guard = settings;
        self.persist(&guard)
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings from {}", self.path.display()))?;
        let data: FocusSettings = serde_json::from_str(&contents)?;
        *self.write_guard() = data;
        Ok(())
    }

    fn persist(&self, data: &FocusSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
