//! Cross-context state.
//!
//! The foreground and background contexts share nothing but a small
//! key/value area. [`SharedStateMirror`] fixes the keys and value shapes
//! used there; the durable store stays authoritative whenever it can be
//! reached.

mod area;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub use area::{FileSharedArea, MemorySharedArea, SharedArea};

use crate::db::{ProfileSnapshot, Session};

const ACTIVE_SESSION_KEY: &str = "activeSession";
const SNAPSHOT_KEY_PREFIX: &str = "profileSnapshot:";
pub(crate) const BACKGROUND_TASKS_KEY: &str = "backgroundTasks";
pub(crate) const STATUS_SURFACE_KEY: &str = "currentStatusSurfaceId";

/// Mirror of the single active session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SharedSession {
    pub id: String,
    pub profile_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pause_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pause_ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub break_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub break_ended_at: Option<DateTime<Utc>>,
}

impl SharedSession {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn is_pause_active(&self) -> bool {
        self.pause_started_at.is_some() && self.pause_ended_at.is_none()
    }
}

impl From<&Session> for SharedSession {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            profile_id: session.profile_id.clone(),
            started_at: session.started_at,
            ended_at: session.ended_at,
            pause_started_at: session.pause_started_at,
            pause_ended_at: session.pause_ended_at,
            break_started_at: session.break_started_at,
            break_ended_at: session.break_ended_at,
        }
    }
}

/// Why a handler declined to act. Never surfaced as an error: a skip means
/// another path already did the work or the work no longer applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoActiveSession,
    ProfileMismatch,
    SessionEnded,
    PauseAlreadyResolved,
    SnapshotMissing,
}

/// Result of a background-side handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Applied,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMatch {
    Active(SharedSession),
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseEndCheck {
    /// The pause is still open for this profile; re-apply with this snapshot.
    Due(ProfileSnapshot),
    Skip(SkipReason),
}

#[derive(Clone)]
pub struct SharedStateMirror {
    area: Arc<dyn SharedArea>,
}

impl SharedStateMirror {
    pub fn new(area: Arc<dyn SharedArea>) -> Self {
        Self { area }
    }

    pub(crate) fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.area.read(key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .with_context(|| format!("shared value '{key}' has an unexpected shape")),
            None => Ok(None),
        }
    }

    pub(crate) fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("failed to encode shared value '{key}'"))?;
        self.area.write(key, value)
    }

    pub(crate) fn remove(&self, key: &str) -> Result<()> {
        self.area.remove(key)
    }

    pub fn active_session(&self) -> Result<Option<SharedSession>> {
        self.load(ACTIVE_SESSION_KEY)
    }

    pub fn set_active_session(&self, session: &SharedSession) -> Result<()> {
        self.store(ACTIVE_SESSION_KEY, session)
    }

    pub fn clear_active_session(&self) -> Result<()> {
        self.remove(ACTIVE_SESSION_KEY)
    }

    /// Read-modify-write of the mirrored session. A no-op returning `None`
    /// when nothing is mirrored.
    fn update_active_session(
        &self,
        apply: impl FnOnce(&mut SharedSession),
    ) -> Result<Option<SharedSession>> {
        let Some(mut session) = self.active_session()? else {
            return Ok(None);
        };
        apply(&mut session);
        self.set_active_session(&session)?;
        Ok(Some(session))
    }

    pub fn reset_pause(&self) -> Result<Option<SharedSession>> {
        self.update_active_session(|session| {
            session.pause_started_at = None;
            session.pause_ended_at = None;
        })
    }

    pub fn set_pause_start(&self, at: DateTime<Utc>) -> Result<Option<SharedSession>> {
        self.update_active_session(|session| session.pause_started_at = Some(at))
    }

    pub fn set_pause_end(&self, at: DateTime<Utc>) -> Result<Option<SharedSession>> {
        self.update_active_session(|session| session.pause_ended_at = Some(at))
    }

    pub fn mark_ended(&self, at: DateTime<Utc>) -> Result<Option<SharedSession>> {
        self.update_active_session(|session| {
            if session.ended_at.is_none() {
                session.ended_at = Some(at);
            }
        })
    }

    pub fn snapshot(&self, profile_id: &str) -> Result<Option<ProfileSnapshot>> {
        self.load(&snapshot_key(profile_id))
    }

    pub fn set_snapshot(&self, snapshot: &ProfileSnapshot) -> Result<()> {
        self.store(&snapshot_key(&snapshot.profile_id), snapshot)
    }

    pub fn remove_snapshot(&self, profile_id: &str) -> Result<()> {
        self.remove(&snapshot_key(profile_id))
    }

    /// Re-check that the mirrored session is still the active one for
    /// `profile_id`. Every background-side handler calls this immediately
    /// before acting.
    pub fn match_active(&self, profile_id: &str) -> Result<SessionMatch> {
        let Some(session) = self.active_session()? else {
            return Ok(SessionMatch::Skip(SkipReason::NoActiveSession));
        };
        if session.profile_id != profile_id {
            return Ok(SessionMatch::Skip(SkipReason::ProfileMismatch));
        }
        if !session.is_active() {
            return Ok(SessionMatch::Skip(SkipReason::SessionEnded));
        }
        Ok(SessionMatch::Active(session))
    }

    /// Shared guard for every pause-end path: schedule callback, recovery
    /// wake and foreground reconciliation.
    pub fn check_pause_end(&self, profile_id: &str) -> Result<PauseEndCheck> {
        let session = match self.match_active(profile_id)? {
            SessionMatch::Active(session) => session,
            SessionMatch::Skip(reason) => return Ok(PauseEndCheck::Skip(reason)),
        };
        if session.pause_ended_at.is_some() {
            return Ok(PauseEndCheck::Skip(SkipReason::PauseAlreadyResolved));
        }
        match self.snapshot(profile_id)? {
            Some(snapshot) => Ok(PauseEndCheck::Due(snapshot)),
            None => Ok(PauseEndCheck::Skip(SkipReason::SnapshotMissing)),
        }
    }
}

fn snapshot_key(profile_id: &str) -> String {
    format!("{SNAPSHOT_KEY_PREFIX}{profile_id}")
}
