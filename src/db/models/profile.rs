//! Profile data models.
//!
//! A profile names the set of applications to restrict and the strategy
//! that governs how a session for it starts and stops. Strategy-specific
//! parameters live in an opaque JSON blob so new strategies do not need a
//! schema migration.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::strategy::StrategyKind;

/// Pause length used when a profile has never recorded one.
pub const DEFAULT_PAUSE_MINUTES: u32 = 5;
pub const MIN_PAUSE_MINUTES: u32 = 5;
pub const MAX_PAUSE_MINUTES: u32 = 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub restricted_apps: BTreeSet<String>,
    pub live_status_enabled: bool,
    pub strategy: StrategyKind,
    pub strategy_data: Option<String>, // JSON-serialized StrategyConfig
    pub required_token_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(name: impl Into<String>, strategy: StrategyKind, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            restricted_apps: BTreeSet::new(),
            live_status_enabled: true,
            strategy,
            strategy_data: None,
            required_token_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn strategy_config(&self) -> StrategyConfig {
        StrategyConfig::decode(self.strategy_data.as_deref())
    }

    pub fn set_strategy_config(
        &mut self,
        config: &StrategyConfig,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.strategy_data = Some(config.encode()?);
        self.updated_at = now;
        Ok(())
    }
}

/// Strategy parameters remembered between sessions so the next start can
/// reuse the last choice.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StrategyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_duration_in_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_duration_in_minutes: Option<u32>,
}

impl StrategyConfig {
    /// Missing or unreadable blobs fall back to the defaults instead of
    /// failing the caller.
    pub fn decode(blob: Option<&str>) -> Self {
        match blob {
            None => Self::default(),
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|err| {
                warn!("Discarding unreadable strategy data: {err}");
                Self::default()
            }),
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to encode strategy data")
    }

    pub fn pause_minutes(&self) -> u32 {
        self.pause_duration_in_minutes
            .unwrap_or(DEFAULT_PAUSE_MINUTES)
    }

    pub fn with_pause_minutes(mut self, minutes: u32) -> Self {
        self.pause_duration_in_minutes = Some(clamp_pause_minutes(minutes));
        self
    }

    pub fn with_timer_minutes(mut self, minutes: u32) -> Self {
        self.timer_duration_in_minutes = Some(minutes.max(1));
        self
    }
}

pub fn clamp_pause_minutes(minutes: u32) -> u32 {
    minutes.clamp(MIN_PAUSE_MINUTES, MAX_PAUSE_MINUTES)
}

/// Enforcement-relevant copy of a profile. The background context cannot
/// open the database, so this is everything it needs to re-apply
/// restrictions on its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSnapshot {
    pub profile_id: String,
    pub name: String,
    pub restricted_apps: BTreeSet<String>,
    pub required_token_id: Option<String>,
    pub pause_duration_minutes: u32,
    pub captured_at: DateTime<Utc>,
}

impl ProfileSnapshot {
    pub fn capture(profile: &Profile, now: DateTime<Utc>) -> Self {
        Self {
            profile_id: profile.id.clone(),
            name: profile.name.clone(),
            restricted_apps: profile.restricted_apps.clone(),
            required_token_id: profile.required_token_id.clone(),
            pause_duration_minutes: profile.strategy_config().pause_minutes(),
            captured_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_config_survives_blob_round_trip() {
        let config = StrategyConfig::default()
            .with_pause_minutes(15)
            .with_timer_minutes(45);

        let blob = config.encode().unwrap();
        assert_eq!(StrategyConfig::decode(Some(&blob)), config);
        assert_eq!(blob, r#"{"pauseDurationInMinutes":15,"timerDurationInMinutes":45}"#);
    }

    #[test]
    fn unreadable_blob_decodes_to_default_pause() {
        let config = StrategyConfig::decode(Some("not json"));
        assert_eq!(config, StrategyConfig::default());
        assert_eq!(config.pause_minutes(), DEFAULT_PAUSE_MINUTES);
        assert_eq!(StrategyConfig::decode(None).pause_minutes(), 5);
    }

    #[test]
    fn pause_minutes_are_clamped_to_selectable_range() {
        assert_eq!(StrategyConfig::default().with_pause_minutes(1).pause_minutes(), 5);
        assert_eq!(StrategyConfig::default().with_pause_minutes(90).pause_minutes(), 60);
        assert_eq!(StrategyConfig::default().with_pause_minutes(20).pause_minutes(), 20);
    }

    #[test]
    fn snapshot_carries_enforcement_fields() {
        let now = Utc::now();
        let mut profile = Profile::new("Deep work", StrategyKind::TokenPauseResume, now);
        profile.restricted_apps.insert("com.example.social".into());
        profile.required_token_id = Some("tag-1".into());
        profile
            .set_strategy_config(&StrategyConfig::default().with_pause_minutes(30), now)
            .unwrap();

        let snapshot = ProfileSnapshot::capture(&profile, now);
        assert_eq!(snapshot.profile_id, profile.id);
        assert_eq!(snapshot.pause_duration_minutes, 30);
        assert_eq!(snapshot.required_token_id.as_deref(), Some("tag-1"));
        assert!(snapshot.restricted_apps.contains("com.example.social"));
    }
}
