//! Session start and stop rules for each blocking strategy.
//!
//! Strategies form a closed set dispatched by one match over
//! [`StrategyKind`]. Every request returns a typed outcome; refusals leave
//! the session and the restrictions exactly as they were.

mod kind;

use std::{sync::Arc, time::Duration as StdDuration};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};

pub use kind::{Capabilities, StrategyKind};

use crate::{
    background::BackgroundTaskScheduler,
    db::{Profile, ProfileSnapshot, Session},
    error::{Refusal, StartError},
    events::{DomainEvent, EventBus, EventSource},
    restriction::RestrictionEngine,
    schedule::{ActivityKey, ScheduleCoordinator},
    status::StatusPublisher,
    store::SessionStore,
    token::{verify_token, ScannedToken, TokenValidator},
};

/// Values pre-selected by the duration prompts when a profile has no
/// remembered choice, and the token validation deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub token_timeout: StdDuration,
    pub suggested_pause_minutes: u32,
    pub suggested_timer_minutes: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            token_timeout: StdDuration::from_secs(10),
            suggested_pause_minutes: 15,
            suggested_timer_minutes: 25,
        }
    }
}

/// A start that needs one more user step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStart {
    pub profile_id: String,
    pub profile_name: String,
    pub strategy: StrategyKind,
    pub force_start: bool,
    /// Pre-selected value for duration prompts.
    pub suggested_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartInput {
    Scan(ScannedToken),
    Duration { minutes: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(Session),
    AwaitingScan(PendingStart),
    AwaitingDuration(PendingStart),
    Refused(Refusal),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Ended(Session),
    /// First scan of the pause strategy: restrictions lifted until the
    /// pause runs out.
    Paused(Session),
    Refused(Refusal),
    NotActive,
}

#[derive(Clone)]
pub struct StrategyEngine {
    store: SessionStore,
    schedule: ScheduleCoordinator,
    background: BackgroundTaskScheduler,
    restrictions: Arc<dyn RestrictionEngine>,
    validator: Arc<dyn TokenValidator>,
    status: StatusPublisher,
    events: EventBus,
    options: EngineOptions,
}

impl StrategyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SessionStore,
        schedule: ScheduleCoordinator,
        background: BackgroundTaskScheduler,
        restrictions: Arc<dyn RestrictionEngine>,
        validator: Arc<dyn TokenValidator>,
        status: StatusPublisher,
        events: EventBus,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            schedule,
            background,
            restrictions,
            validator,
            status,
            events,
            options,
        }
    }

    /// Begin starting a session for `profile_id`. Manual profiles start
    /// right away; the others hand back the step they still need.
    pub async fn start(
        &self,
        profile_id: &str,
        force_start: bool,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome> {
        let profile = self.load_profile(profile_id).await?;
        if let Some(active) = self.store.active_session().await? {
            return Err(StartError::SessionAlreadyActive {
                session_id: active.id,
            }
            .into());
        }

        let config = profile.strategy_config();
        let pending = |suggested_minutes| PendingStart {
            profile_id: profile.id.clone(),
            profile_name: profile.name.clone(),
            strategy: profile.strategy,
            force_start,
            suggested_minutes,
        };

        let outcome = match profile.strategy {
            StrategyKind::TokenOnly => StartOutcome::AwaitingScan(pending(None)),
            StrategyKind::TimerThenTokenStop => StartOutcome::AwaitingDuration(pending(Some(
                config
                    .timer_duration_in_minutes
                    .unwrap_or(self.options.suggested_timer_minutes),
            ))),
            StrategyKind::TokenPauseResume => StartOutcome::AwaitingDuration(pending(Some(
                config
                    .pause_duration_in_minutes
                    .unwrap_or(self.options.suggested_pause_minutes),
            ))),
            StrategyKind::Manual => {
                let session = self
                    .begin(&profile, profile.strategy.id(), force_start, now)
                    .await?;
                StartOutcome::Started(session)
            }
        };
        Ok(outcome)
    }

    /// Finish a start that returned `AwaitingScan` or `AwaitingDuration`.
    pub async fn complete_start(
        &self,
        pending: &PendingStart,
        input: StartInput,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome> {
        let mut profile = self.load_profile(&pending.profile_id).await?;
        if profile.strategy != pending.strategy {
            warn!(
                "Profile {} switched strategy from {} to {} mid-start",
                profile.name,
                pending.strategy.id(),
                profile.strategy.id()
            );
        }

        match (pending.strategy, input) {
            (StrategyKind::TokenOnly, StartInput::Scan(token)) => {
                if let Err(refusal) =
                    verify_token(self.validator.as_ref(), &token, self.options.token_timeout).await
                {
                    return Ok(StartOutcome::Refused(refusal));
                }
                let session = self
                    .begin(&profile, token.id(), pending.force_start, now)
                    .await?;
                Ok(StartOutcome::Started(session))
            }
            (StrategyKind::TimerThenTokenStop, StartInput::Duration { minutes }) => {
                let config = profile.strategy_config().with_timer_minutes(minutes);
                let minutes = config.timer_duration_in_minutes.unwrap_or(minutes);
                profile.set_strategy_config(&config, now)?;
                self.store.save_profile(&profile).await?;

                let session = self
                    .begin(&profile, profile.strategy.id(), pending.force_start, now)
                    .await?;
                self.schedule.register(
                    &ActivityKey::timer(&profile.id),
                    now,
                    now + Duration::minutes(i64::from(minutes)),
                );
                Ok(StartOutcome::Started(session))
            }
            (StrategyKind::TokenPauseResume, StartInput::Duration { minutes }) => {
                let config = profile.strategy_config().with_pause_minutes(minutes);
                profile.set_strategy_config(&config, now)?;
                self.store.save_profile(&profile).await?;

                let session = self
                    .begin(&profile, profile.strategy.id(), pending.force_start, now)
                    .await?;
                Ok(StartOutcome::Started(session))
            }
            (strategy, _) => Err(StartError::UnexpectedInput {
                strategy: strategy.id(),
                expected: match strategy {
                    StrategyKind::TokenOnly => "a token scan",
                    StrategyKind::TimerThenTokenStop | StrategyKind::TokenPauseResume => {
                        "a duration"
                    }
                    StrategyKind::Manual => "no input",
                },
            }
            .into()),
        }
    }

    async fn load_profile(&self, profile_id: &str) -> Result<Profile> {
        match self.store.database().get_profile(profile_id).await? {
            Some(profile) => Ok(profile),
            None => Err(StartError::ProfileNotFound(profile_id.to_string()).into()),
        }
    }

    async fn begin(
        &self,
        profile: &Profile,
        token_id: &str,
        force_start: bool,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        let session = self
            .store
            .create_session(profile, token_id, force_start, now)
            .await?;
        self.restrictions
            .activate_restrictions(&ProfileSnapshot::capture(profile, now));
        self.status.session_started(&session, profile);
        self.events.publish(DomainEvent::SessionStarted {
            session_id: session.id.clone(),
            profile_id: profile.id.clone(),
        });
        Ok(session)
    }

    /// Stop request for `session_id`. Token strategies need `scan`; the
    /// pause strategy pauses on the first accepted scan and ends on the
    /// second.
    pub async fn stop(
        &self,
        session_id: &str,
        scan: Option<ScannedToken>,
        now: DateTime<Utc>,
    ) -> Result<StopOutcome> {
        let session = self.store.session(session_id).await?;
        if !session.is_active() {
            return Ok(StopOutcome::NotActive);
        }
        let profile = self.store.profile(&session.profile_id).await?;

        if profile.strategy.capabilities().uses_token {
            let Some(token) = scan else {
                return Ok(StopOutcome::Refused(Refusal::empty_scan()));
            };
            if let Err(refusal) =
                verify_token(self.validator.as_ref(), &token, self.options.token_timeout).await
            {
                return Ok(StopOutcome::Refused(refusal));
            }
            if let Err(refusal) = authorize_stop(&profile, &session, &token) {
                info!("Stop of session {} refused: {}", session.id, refusal);
                return Ok(StopOutcome::Refused(refusal));
            }
        }

        match profile.strategy {
            StrategyKind::TokenOnly | StrategyKind::Manual => {
                self.end(&session, now).await.map(StopOutcome::Ended)
            }
            StrategyKind::TimerThenTokenStop => {
                self.schedule.remove(&ActivityKey::timer(&profile.id));
                self.end(&session, now).await.map(StopOutcome::Ended)
            }
            StrategyKind::TokenPauseResume => self.pause_or_end(&session, &profile, now).await,
        }
    }

    async fn pause_or_end(
        &self,
        session: &Session,
        profile: &Profile,
        now: DateTime<Utc>,
    ) -> Result<StopOutcome> {
        // The background side may have closed the pause since this row was
        // read; its stamps decide which phase this scan is.
        let mut session = session.clone();
        if let Some(shared) = self.store.mirror().active_session()? {
            if shared.id == session.id {
                session = self.store.absorb_pause_marks(&session, &shared).await?;
            }
        }

        if session.is_pause_active() {
            self.background.cancel(&profile.id, now)?;
            self.schedule.remove(&ActivityKey::pause(&profile.id));
            return self.end(&session, now).await.map(StopOutcome::Ended);
        }

        let pause_minutes = profile.strategy_config().pause_minutes();
        let end = now + Duration::minutes(i64::from(pause_minutes));

        self.store
            .mirror()
            .set_snapshot(&ProfileSnapshot::capture(profile, now))?;
        let paused = self.store.begin_pause(&session, now).await?;
        self.restrictions.deactivate_restrictions();
        self.schedule
            .register(&ActivityKey::pause(&profile.id), now, end);
        self.background
            .schedule_pause_end(&profile.id, &profile.name, end, now)?;

        info!("Session {} paused until {end}", paused.id);
        self.status.publish(&paused, profile);
        self.events.publish(DomainEvent::Paused {
            session_id: paused.id.clone(),
            profile_id: profile.id.clone(),
        });
        Ok(StopOutcome::Paused(paused))
    }

    async fn end(&self, session: &Session, now: DateTime<Utc>) -> Result<Session> {
        let ended = self.store.end_session(session, now).await?;
        self.restrictions.deactivate_restrictions();
        self.status.session_ended(now);
        self.events.publish(DomainEvent::SessionEnded {
            profile_id: ended.profile_id.clone(),
            source: EventSource::Foreground,
        });
        info!("Session {} ended", ended.id);
        Ok(ended)
    }

    /// Record a break. Starting a break while one is open keeps the
    /// original start.
    pub async fn start_break(&self, session_id: &str, now: DateTime<Utc>) -> Result<Session> {
        let session = self.store.session(session_id).await?;
        if session.is_break_active() {
            return Ok(session);
        }
        let profile = self.store.profile(&session.profile_id).await?;
        let updated = self.store.start_break(&session, now).await?;
        self.status.publish(&updated, &profile);
        self.events.publish(DomainEvent::BreakStarted {
            session_id: updated.id.clone(),
        });
        Ok(updated)
    }

    pub async fn end_break(&self, session_id: &str, now: DateTime<Utc>) -> Result<Session> {
        let session = self.store.session(session_id).await?;
        if !session.is_break_active() {
            return Ok(session);
        }
        let profile = self.store.profile(&session.profile_id).await?;
        let updated = self.store.end_break(&session, now).await?;
        self.status.publish(&updated, &profile);
        self.events.publish(DomainEvent::BreakEnded {
            session_id: updated.id.clone(),
        });
        Ok(updated)
    }
}

/// Token rules for stopping: a configured unlock token must match; without
/// one, the scan must match the token that started the session. A forced
/// start waives both. Either identifier reported by the scan may match.
fn authorize_stop(
    profile: &Profile,
    session: &Session,
    token: &ScannedToken,
) -> Result<(), Refusal> {
    if session.force_started {
        return Ok(());
    }
    if let Some(required) = profile.required_token_id.as_deref() {
        if token.matches(required) {
            return Ok(());
        }
        return Err(Refusal::required_token());
    }
    // Timer and pause sessions record the strategy id, not a token.
    if session.token_id == profile.strategy.id() || token.matches(&session.token_id) {
        return Ok(());
    }
    Err(Refusal::original_token())
}
