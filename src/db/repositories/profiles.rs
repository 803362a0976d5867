use std::collections::BTreeSet;

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    helpers::{from_flag, parse_datetime, to_flag},
    models::Profile,
    Database,
};
use crate::strategy::StrategyKind;

const PROFILE_COLUMNS: &str = "id, name, restricted_apps, live_status_enabled, strategy_id, strategy_data, required_token_id, created_at, updated_at";

fn row_to_profile(row: &Row) -> Result<Profile> {
    let restricted_apps: String = row.get("restricted_apps")?;
    let strategy_id: String = row.get("strategy_id")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Profile {
        id: row.get("id")?,
        name: row.get("name")?,
        restricted_apps: serde_json::from_str::<BTreeSet<String>>(&restricted_apps)
            .context("failed to parse restricted_apps")?,
        live_status_enabled: from_flag(row.get("live_status_enabled")?),
        strategy: StrategyKind::from_id(&strategy_id)?,
        strategy_data: row.get("strategy_data")?,
        required_token_id: row.get("required_token_id")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

impl Database {
    /// Insert or replace a profile.
    pub async fn save_profile(&self, profile: &Profile) -> Result<()> {
        let record = profile.clone();
        self.execute(move |conn| {
            let restricted_apps = serde_json::to_string(&record.restricted_apps)?;
            conn.execute(
                "INSERT INTO profiles (id, name, restricted_apps, live_status_enabled, strategy_id, strategy_data, required_token_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     restricted_apps = excluded.restricted_apps,
                     live_status_enabled = excluded.live_status_enabled,
                     strategy_id = excluded.strategy_id,
                     strategy_data = excluded.strategy_data,
                     required_token_id = excluded.required_token_id,
                     updated_at = excluded.updated_at",
                params![
                    record.id,
                    record.name,
                    restricted_apps,
                    to_flag(record.live_status_enabled),
                    record.strategy.id(),
                    record.strategy_data,
                    record.required_token_id,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .context("failed to save profile")?;
            Ok(())
        })
        .await
    }

    pub async fn get_profile(&self, profile_id: &str) -> Result<Option<Profile>> {
        let profile_id = profile_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = ?1"
            ))?;

            stmt.query_row(params![profile_id], |row| Ok(row_to_profile(row)))
                .optional()?
                .transpose()
        })
        .await
    }

    pub async fn list_profiles(&self) -> Result<Vec<Profile>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROFILE_COLUMNS} FROM profiles ORDER BY created_at ASC"
            ))?;

            let mut rows = stmt.query([])?;
            let mut profiles = Vec::new();
            while let Some(row) = rows.next()? {
                profiles.push(row_to_profile(row)?);
            }

            Ok(profiles)
        })
        .await
    }
}
