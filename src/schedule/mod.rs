//! OS time-window monitors for pauses and focus timers.
//!
//! Windows are keyed `<kind>:<profileId>`. The OS delivers start/end
//! callbacks late, repeatedly, or in a context that cannot open the
//! database, so both handlers work off the shared mirror only and re-check
//! it right before acting.

use std::{fmt, str::FromStr, sync::Arc};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

use crate::{
    events::{DomainEvent, EventBus, EventSource},
    restriction::RestrictionEngine,
    shared::{HandlerOutcome, PauseEndCheck, SessionMatch, SharedStateMirror, SkipReason},
};

// Set to false to silence window callback logging.
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Pause,
    StrategyTimer,
}

impl ActivityKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ActivityKind::Pause => "PauseScheduleActivity",
            ActivityKind::StrategyTimer => "StrategyTimerActivity",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActivityKey {
    pub kind: ActivityKind,
    pub profile_id: String,
}

impl ActivityKey {
    pub fn new(kind: ActivityKind, profile_id: impl Into<String>) -> Self {
        Self {
            kind,
            profile_id: profile_id.into(),
        }
    }

    pub fn pause(profile_id: impl Into<String>) -> Self {
        Self::new(ActivityKind::Pause, profile_id)
    }

    pub fn timer(profile_id: impl Into<String>) -> Self {
        Self::new(ActivityKind::StrategyTimer, profile_id)
    }
}

impl fmt::Display for ActivityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.profile_id)
    }
}

impl FromStr for ActivityKey {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let (prefix, profile_id) = value
            .split_once(':')
            .ok_or_else(|| anyhow!("activity key '{value}' has no profile id"))?;
        let kind = [ActivityKind::Pause, ActivityKind::StrategyTimer]
            .into_iter()
            .find(|kind| kind.prefix() == prefix)
            .ok_or_else(|| anyhow!("unknown activity kind '{prefix}'"))?;
        if profile_id.is_empty() {
            return Err(anyhow!("activity key '{value}' has an empty profile id"));
        }
        Ok(Self::new(kind, profile_id))
    }
}

/// OS primitive: best-effort interval monitoring with start/end callbacks
/// delivered back through [`ScheduleCoordinator::handle_window_start`] and
/// [`ScheduleCoordinator::handle_window_end`].
pub trait WindowScheduler: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the OS declines the registration.
    fn register_window(
        &self,
        key: &ActivityKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()>;

    /// Stop monitoring `key`. Unknown keys are ignored.
    fn remove_window(&self, key: &ActivityKey);
}

#[derive(Clone)]
pub struct ScheduleCoordinator {
    windows: Arc<dyn WindowScheduler>,
    mirror: SharedStateMirror,
    restrictions: Arc<dyn RestrictionEngine>,
    events: EventBus,
}

impl ScheduleCoordinator {
    pub fn new(
        windows: Arc<dyn WindowScheduler>,
        mirror: SharedStateMirror,
        restrictions: Arc<dyn RestrictionEngine>,
        events: EventBus,
    ) -> Self {
        Self {
            windows,
            mirror,
            restrictions,
            events,
        }
    }

    /// Replace any existing window for `key`. Returns `false` when the OS
    /// declined; the recovery wake and foreground reconciliation cover that.
    pub fn register(&self, key: &ActivityKey, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.windows.remove_window(key);
        match self.windows.register_window(key, start, end) {
            Ok(()) => {
                log_info!("Registered window {key} [{start} .. {end}]");
                true
            }
            Err(err) => {
                log_warn!("OS declined window {key}: {err:#}");
                false
            }
        }
    }

    pub fn remove(&self, key: &ActivityKey) {
        self.windows.remove_window(key);
        log_info!("Removed window {key}");
    }

    pub fn handle_window_start(
        &self,
        key: &ActivityKey,
        now: DateTime<Utc>,
    ) -> Result<HandlerOutcome> {
        let outcome = match key.kind {
            ActivityKind::Pause => self.pause_window_started(&key.profile_id, now)?,
            ActivityKind::StrategyTimer => self.timer_window_started(&key.profile_id)?,
        };
        log_info!("Window start {key}: {outcome:?}");
        Ok(outcome)
    }

    pub fn handle_window_end(
        &self,
        key: &ActivityKey,
        now: DateTime<Utc>,
    ) -> Result<HandlerOutcome> {
        let outcome = match key.kind {
            ActivityKind::Pause => self.pause_window_ended(&key.profile_id, now)?,
            ActivityKind::StrategyTimer => self.timer_window_ended(&key.profile_id, now)?,
        };
        log_info!("Window end {key}: {outcome:?}");
        Ok(outcome)
    }

    fn pause_window_started(&self, profile_id: &str, now: DateTime<Utc>) -> Result<HandlerOutcome> {
        let session = match self.mirror.match_active(profile_id)? {
            SessionMatch::Active(session) => session,
            SessionMatch::Skip(reason) => return Ok(HandlerOutcome::Skipped(reason)),
        };
        // A start delivered after the pause already closed is stale.
        if session.pause_ended_at.is_some() {
            return Ok(HandlerOutcome::Skipped(SkipReason::PauseAlreadyResolved));
        }

        self.restrictions.deactivate_restrictions();
        if !session.is_pause_active() {
            self.mirror.reset_pause()?;
            self.mirror.set_pause_start(now)?;
        }
        Ok(HandlerOutcome::Applied)
    }

    /// The schedule is authoritative for the end of a pause: re-block even
    /// if the mirror never saw the pause start, unless the mirror already
    /// shows the pause closed for this profile.
    fn pause_window_ended(&self, profile_id: &str, now: DateTime<Utc>) -> Result<HandlerOutcome> {
        let snapshot = match self.mirror.check_pause_end(profile_id)? {
            PauseEndCheck::Due(snapshot) => snapshot,
            PauseEndCheck::Skip(reason) => return Ok(HandlerOutcome::Skipped(reason)),
        };

        self.restrictions.activate_restrictions(&snapshot);
        self.mirror.set_pause_end(now)?;
        self.events.publish(DomainEvent::PauseEnded {
            profile_id: profile_id.to_string(),
            source: EventSource::Schedule,
        });
        Ok(HandlerOutcome::Applied)
    }

    fn timer_window_started(&self, profile_id: &str) -> Result<HandlerOutcome> {
        if let SessionMatch::Skip(reason) = self.mirror.match_active(profile_id)? {
            return Ok(HandlerOutcome::Skipped(reason));
        }
        let Some(snapshot) = self.mirror.snapshot(profile_id)? else {
            return Ok(HandlerOutcome::Skipped(SkipReason::SnapshotMissing));
        };
        self.restrictions.activate_restrictions(&snapshot);
        Ok(HandlerOutcome::Applied)
    }

    fn timer_window_ended(&self, profile_id: &str, now: DateTime<Utc>) -> Result<HandlerOutcome> {
        if let SessionMatch::Skip(reason) = self.mirror.match_active(profile_id)? {
            return Ok(HandlerOutcome::Skipped(reason));
        }

        self.restrictions.deactivate_restrictions();
        self.mirror.mark_ended(now)?;
        self.events.publish(DomainEvent::SessionEnded {
            profile_id: profile_id.to_string(),
            source: EventSource::Schedule,
        });
        Ok(HandlerOutcome::Applied)
    }
}
