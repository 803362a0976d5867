use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

use crate::db::{
    helpers::{format_optional, from_flag, parse_datetime, parse_optional_datetime, to_flag},
    models::Session,
    Database, StoreError,
};

const SESSION_COLUMNS: &str = "id, profile_id, started_at, ended_at, token_id, force_started, pause_started_at, pause_ended_at, break_started_at, break_ended_at";

fn row_to_session(row: &Row) -> Result<Session> {
    let started_at: String = row.get("started_at")?;

    Ok(Session {
        id: row.get("id")?,
        profile_id: row.get("profile_id")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        ended_at: parse_optional_datetime(row.get("ended_at")?, "ended_at")?,
        token_id: row.get("token_id")?,
        force_started: from_flag(row.get("force_started")?),
        pause_started_at: parse_optional_datetime(
            row.get("pause_started_at")?,
            "pause_started_at",
        )?,
        pause_ended_at: parse_optional_datetime(row.get("pause_ended_at")?, "pause_ended_at")?,
        break_started_at: parse_optional_datetime(
            row.get("break_started_at")?,
            "break_started_at",
        )?,
        break_ended_at: parse_optional_datetime(row.get("break_ended_at")?, "break_ended_at")?,
    })
}

impl Database {
    /// Insert a new active session. Fails with
    /// [`StoreError::SessionAlreadyActive`] when another session is open.
    pub async fn insert_session(&self, session: &Session) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM sessions WHERE ended_at IS NULL LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing) = existing {
                return Err(StoreError::SessionAlreadyActive(existing).into());
            }

            tx.execute(
                "INSERT INTO sessions (id, profile_id, started_at, ended_at, token_id, force_started, pause_started_at, pause_ended_at, break_started_at, break_ended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id,
                    record.profile_id,
                    record.started_at.to_rfc3339(),
                    format_optional(record.ended_at),
                    record.token_id,
                    to_flag(record.force_started),
                    format_optional(record.pause_started_at),
                    format_optional(record.pause_ended_at),
                    format_optional(record.break_started_at),
                    format_optional(record.break_ended_at),
                ],
            )
            .context("failed to insert session")?;

            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Persist pause and break fields of an active session.
    pub async fn update_session_marks(&self, session: &Session) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            let rows_affected = conn
                .execute(
                    "UPDATE sessions
                     SET pause_started_at = ?1,
                         pause_ended_at = ?2,
                         break_started_at = ?3,
                         break_ended_at = ?4
                     WHERE id = ?5 AND ended_at IS NULL",
                    params![
                        format_optional(record.pause_started_at),
                        format_optional(record.pause_ended_at),
                        format_optional(record.break_started_at),
                        format_optional(record.break_ended_at),
                        record.id,
                    ],
                )
                .context("failed to update session")?;

            if rows_affected == 0 {
                return Err(StoreError::SessionEnded(record.id).into());
            }
            Ok(())
        })
        .await
    }

    /// Close a session. Returns `false` when it had already ended, which
    /// leaves the stored end time untouched.
    pub async fn end_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<bool> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let rows_affected = conn
                .execute(
                    "UPDATE sessions SET ended_at = ?1 WHERE id = ?2 AND ended_at IS NULL",
                    params![ended_at.to_rfc3339(), session_id],
                )
                .context("failed to end session")?;
            Ok(rows_affected > 0)
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
            ))?;

            stmt.query_row(params![session_id], |row| Ok(row_to_session(row)))
                .optional()?
                .transpose()
        })
        .await
    }

    pub async fn get_active_session(&self) -> Result<Option<Session>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE ended_at IS NULL
                 ORDER BY started_at DESC
                 LIMIT 1"
            ))?;

            let mut rows = stmt.query([])?;
            let session = match rows.next()? {
                Some(row) => Some(row_to_session(row)?),
                None => None,
            };
            Ok(session)
        })
        .await
    }

    pub async fn list_sessions_for_profile(&self, profile_id: &str) -> Result<Vec<Session>> {
        let profile_id = profile_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE profile_id = ?1
                 ORDER BY started_at DESC"
            ))?;

            let mut rows = stmt.query(params![profile_id])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }

            Ok(sessions)
        })
        .await
    }

    pub async fn count_active_sessions(&self) -> Result<i64> {
        self.execute(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE ended_at IS NULL",
                [],
                |row| row.get(0),
            )?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use crate::db::models::Profile;
    use crate::strategy::StrategyKind;

    use super::*;

    async fn database_with_profile() -> (tempfile::TempDir, Database, Profile) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("focuslock.sqlite3")).unwrap();
        let profile = Profile::new("Study", StrategyKind::TokenOnly, Utc::now());
        db.save_profile(&profile).await.unwrap();
        (dir, db, profile)
    }

    #[tokio::test]
    async fn second_active_session_is_rejected() {
        let (_dir, db, profile) = database_with_profile().await;
        let now = Utc::now();

        let first = Session::new(&profile.id, "tag-a", false, now);
        db.insert_session(&first).await.unwrap();

        let second = Session::new(&profile.id, "tag-b", false, now);
        let err = db.insert_session(&second).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::SessionAlreadyActive(id)) if *id == first.id
        ));
        assert_eq!(db.count_active_sessions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ended_session_is_immutable() {
        let (_dir, db, profile) = database_with_profile().await;
        let now = Utc::now();

        let mut session = Session::new(&profile.id, "tag-a", true, now);
        db.insert_session(&session).await.unwrap();

        let end = now + Duration::minutes(30);
        assert!(db.end_session(&session.id, end).await.unwrap());
        assert!(!db.end_session(&session.id, end + Duration::minutes(5)).await.unwrap());

        session.pause_started_at = Some(end);
        let err = db.update_session_marks(&session).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::SessionEnded(_))));

        let stored = db.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.ended_at.map(|t| t.timestamp()), Some(end.timestamp()));
        assert_eq!(stored.pause_started_at, None);
        assert!(stored.force_started);
        assert!(db.get_active_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn history_is_kept_per_profile() {
        let (_dir, db, profile) = database_with_profile().await;
        let now = Utc::now();

        for offset in 0..3 {
            let started = now + Duration::hours(offset);
            let session = Session::new(&profile.id, "tag-a", false, started);
            db.insert_session(&session).await.unwrap();
            db.end_session(&session.id, started + Duration::minutes(20))
                .await
                .unwrap();
        }

        let history = db.list_sessions_for_profile(&profile.id).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|s| !s.is_active()));
        assert!(history[0].started_at > history[2].started_at);
    }
}
