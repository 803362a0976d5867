//! Durable session state plus its shared-area projection.
//!
//! Every mutation is written to the database first and then mirrored, so
//! the background context always sees the last committed state. If the
//! process dies between the two writes the mirror is stale, and the next
//! foreground reconciliation re-projects it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::{
    db::{Database, Profile, ProfileSnapshot, Session, StoreError},
    error::StartError,
    shared::{SharedSession, SharedStateMirror},
};

#[derive(Clone)]
pub struct SessionStore {
    db: Database,
    mirror: SharedStateMirror,
}

impl SessionStore {
    pub fn new(db: Database, mirror: SharedStateMirror) -> Self {
        Self { db, mirror }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn mirror(&self) -> &SharedStateMirror {
        &self.mirror
    }

    /// Persist `profile` and refresh the snapshot the background context
    /// enforces from.
    pub async fn save_profile(&self, profile: &Profile) -> Result<()> {
        self.db.save_profile(profile).await?;
        self.mirror
            .set_snapshot(&ProfileSnapshot::capture(profile, Utc::now()))
    }

    pub async fn profile(&self, profile_id: &str) -> Result<Profile> {
        self.db
            .get_profile(profile_id)
            .await?
            .ok_or_else(|| StoreError::ProfileNotFound(profile_id.to_string()).into())
    }

    pub async fn profiles(&self) -> Result<Vec<Profile>> {
        self.db.list_profiles().await
    }

    pub async fn active_session(&self) -> Result<Option<Session>> {
        self.db.get_active_session().await
    }

    pub async fn session(&self, session_id: &str) -> Result<Session> {
        self.db
            .get_session(session_id)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()).into())
    }

    pub async fn sessions_for_profile(&self, profile_id: &str) -> Result<Vec<Session>> {
        self.db.list_sessions_for_profile(profile_id).await
    }

    /// Open a session for `profile`. Fails with
    /// [`StartError::SessionAlreadyActive`] while another one is open.
    pub async fn create_session(
        &self,
        profile: &Profile,
        token_id: &str,
        force_started: bool,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        if let Some(active) = self.db.get_active_session().await? {
            return Err(StartError::SessionAlreadyActive {
                session_id: active.id,
            }
            .into());
        }

        let session = Session::new(&profile.id, token_id, force_started, now);
        if let Err(err) = self.db.insert_session(&session).await {
            let err: anyhow::Error = match err.downcast::<StoreError>() {
                Ok(StoreError::SessionAlreadyActive(session_id)) => {
                    StartError::SessionAlreadyActive { session_id }.into()
                }
                Ok(other) => other.into(),
                Err(err) => err,
            };
            return Err(err);
        }

        self.mirror
            .set_snapshot(&ProfileSnapshot::capture(profile, now))?;
        self.mirror
            .set_active_session(&SharedSession::from(&session))?;
        info!("Session {} started for profile {}", session.id, profile.name);
        Ok(session)
    }

    async fn commit_marks(&self, session: Session) -> Result<Session> {
        self.db
            .update_session_marks(&session)
            .await
            .with_context(|| format!("failed to persist marks for session {}", session.id))?;
        self.project(&session)?;
        Ok(session)
    }

    fn project(&self, session: &Session) -> Result<()> {
        if let Some(shared) = self.mirror.active_session()? {
            if shared.id != session.id {
                warn!(
                    "Mirror tracked session {} while {} changed; re-projecting",
                    shared.id, session.id
                );
            }
        }
        self.mirror.set_active_session(&SharedSession::from(session))
    }

    /// Start a new pause, clearing any earlier pause marks.
    pub async fn begin_pause(&self, session: &Session, now: DateTime<Utc>) -> Result<Session> {
        let mut updated = session.clone();
        updated.pause_started_at = Some(now);
        updated.pause_ended_at = None;
        self.commit_marks(updated).await
    }

    pub async fn finish_pause(&self, session: &Session, at: DateTime<Utc>) -> Result<Session> {
        let mut updated = session.clone();
        if updated.pause_started_at.is_none() {
            updated.pause_started_at = Some(at);
        }
        updated.pause_ended_at = Some(at);
        self.commit_marks(updated).await
    }

    pub async fn start_break(&self, session: &Session, now: DateTime<Utc>) -> Result<Session> {
        let mut updated = session.clone();
        updated.break_started_at = Some(now);
        updated.break_ended_at = None;
        self.commit_marks(updated).await
    }

    pub async fn end_break(&self, session: &Session, now: DateTime<Utc>) -> Result<Session> {
        let mut updated = session.clone();
        updated.break_ended_at = Some(now);
        self.commit_marks(updated).await
    }

    /// Copy the pause marks the background context stamped into the durable
    /// row. Durable values already present win.
    pub async fn absorb_pause_marks(
        &self,
        session: &Session,
        shared: &SharedSession,
    ) -> Result<Session> {
        let mut updated = session.clone();
        let mut changed = false;
        if updated.pause_started_at.is_none() && shared.pause_started_at.is_some() {
            updated.pause_started_at = shared.pause_started_at;
            changed = true;
        }
        if updated.pause_ended_at.is_none() && shared.pause_ended_at.is_some() {
            updated.pause_ended_at = shared.pause_ended_at;
            changed = true;
        }
        if !changed {
            return Ok(updated);
        }
        self.commit_marks(updated).await
    }

    /// Close `session` at `at` and drop its projection. Ending an already
    /// ended session is a no-op that returns the stored row.
    pub async fn end_session(&self, session: &Session, at: DateTime<Utc>) -> Result<Session> {
        let closed = self.db.end_session(&session.id, at).await?;
        if !closed {
            info!("Session {} was already ended", session.id);
        }

        if let Some(shared) = self.mirror.active_session()? {
            if shared.id == session.id {
                self.mirror.clear_active_session()?;
            }
        }
        self.session(&session.id).await
    }

    /// Overwrite the projection with the durable active session, or clear
    /// it when none is open.
    pub async fn reproject(&self) -> Result<Option<Session>> {
        let active = self.db.get_active_session().await?;
        match &active {
            Some(session) => {
                self.mirror
                    .set_active_session(&SharedSession::from(session))?;
                let profile = self.profile(&session.profile_id).await?;
                self.mirror
                    .set_snapshot(&ProfileSnapshot::capture(&profile, Utc::now()))?;
            }
            None => self.mirror.clear_active_session()?,
        }
        Ok(active)
    }
}
