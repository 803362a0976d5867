//! Session data model.
//!
//! A session with `ended_at == None` is active. Once `ended_at` is set the
//! row is history and is never modified again.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub profile_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Token that started the session, or the strategy id when none did.
    pub token_id: String,
    pub force_started: bool,
    pub pause_started_at: Option<DateTime<Utc>>,
    pub pause_ended_at: Option<DateTime<Utc>>,
    pub break_started_at: Option<DateTime<Utc>>,
    pub break_ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(
        profile_id: impl Into<String>,
        token_id: impl Into<String>,
        force_started: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            profile_id: profile_id.into(),
            started_at,
            ended_at: None,
            token_id: token_id.into(),
            force_started,
            pause_started_at: None,
            pause_ended_at: None,
            break_started_at: None,
            break_ended_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn is_pause_active(&self) -> bool {
        self.pause_started_at.is_some() && self.pause_ended_at.is_none()
    }

    pub fn is_break_active(&self) -> bool {
        self.break_started_at.is_some() && self.break_ended_at.is_none()
    }

    /// When the running pause is due to end, if one is running.
    pub fn pause_deadline(&self, pause_minutes: u32) -> Option<DateTime<Utc>> {
        if !self.is_pause_active() {
            return None;
        }
        self.pause_started_at
            .map(|start| start + Duration::minutes(i64::from(pause_minutes)))
    }

    /// Length of the last completed break; an open break counts as zero.
    pub fn completed_break(&self) -> Duration {
        match (self.break_started_at, self.break_ended_at) {
            (Some(start), Some(end)) if end > start => end - start,
            _ => Duration::zero(),
        }
    }
}
