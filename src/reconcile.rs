//! Foreground reconciliation.
//!
//! Runs at launch and whenever the app returns to the foreground. Folds
//! whatever the background context did into the durable store, then
//! catches deadlines the OS never woke us for.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};

use crate::{
    background::BackgroundTaskScheduler,
    db::{Profile, ProfileSnapshot, Session},
    events::{DomainEvent, EventBus, EventSource},
    restriction::RestrictionEngine,
    schedule::{ActivityKey, ScheduleCoordinator},
    shared::{HandlerOutcome, SkipReason},
    status::StatusPublisher,
    store::SessionStore,
    strategy::StrategyKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// The mirror did not match the durable active session and was rewritten.
    MirrorRepaired,
    /// Pause marks stamped in the background were copied to the store.
    PauseMarksAbsorbed,
    /// A pause outlived its deadline with no wake; restrictions re-applied here.
    PauseEndRecovered,
    /// The timer window ended the session in the background.
    EndedInBackground,
    /// The focus timer ran out with no window callback.
    TimerExpired,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// The durable active session after reconciliation, if still open.
    pub session: Option<Session>,
    pub actions: Vec<ReconcileAction>,
}

#[derive(Clone)]
pub struct Reconciler {
    store: SessionStore,
    schedule: ScheduleCoordinator,
    background: BackgroundTaskScheduler,
    restrictions: Arc<dyn RestrictionEngine>,
    status: StatusPublisher,
    events: EventBus,
}

impl Reconciler {
    pub fn new(
        store: SessionStore,
        schedule: ScheduleCoordinator,
        background: BackgroundTaskScheduler,
        restrictions: Arc<dyn RestrictionEngine>,
        status: StatusPublisher,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            schedule,
            background,
            restrictions,
            status,
            events,
        }
    }

    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mirror = self.store.mirror();

        let Some(mut session) = self.store.active_session().await? else {
            if mirror.active_session()?.is_some() {
                mirror.clear_active_session()?;
                report.actions.push(ReconcileAction::MirrorRepaired);
            }
            return Ok(report);
        };
        let profile = self.store.profile(&session.profile_id).await?;

        match mirror.active_session()? {
            Some(shared) if shared.id == session.id => {
                if let Some(ended_at) = shared.ended_at {
                    self.finish(&session, &profile, ended_at, now).await?;
                    report.actions.push(ReconcileAction::EndedInBackground);
                    return Ok(report);
                }
                let merged = self.store.absorb_pause_marks(&session, &shared).await?;
                if merged != session {
                    report.actions.push(ReconcileAction::PauseMarksAbsorbed);
                    self.status.publish(&merged, &profile);
                    session = merged;
                }
            }
            _ => {
                self.store.reproject().await?;
                report.actions.push(ReconcileAction::MirrorRepaired);
            }
        }

        let config = profile.strategy_config();
        if profile.strategy.capabilities().has_pause {
            if let Some(deadline) = session.pause_deadline(config.pause_minutes()) {
                if deadline <= now {
                    if let Some(resumed) = self.recover_pause_end(&session, &profile, now).await? {
                        session = resumed;
                        report.actions.push(ReconcileAction::PauseEndRecovered);
                    }
                }
            }
        }

        if profile.strategy == StrategyKind::TimerThenTokenStop {
            if let Some(minutes) = config.timer_duration_in_minutes {
                let expires_at = session.started_at + Duration::minutes(i64::from(minutes));
                if expires_at <= now {
                    self.finish(&session, &profile, expires_at, now).await?;
                    report.actions.push(ReconcileAction::TimerExpired);
                    return Ok(report);
                }
            }
        }

        if !report.actions.is_empty() {
            info!("Reconciled session {}: {:?}", session.id, report.actions);
        }
        report.session = Some(session);
        Ok(report)
    }

    /// Re-block through the same path the wake uses. Returns `None` when
    /// the pause could not be closed, so the durable marks stay open for
    /// the next pass.
    async fn recover_pause_end(
        &self,
        session: &Session,
        profile: &Profile,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let mirror = self.store.mirror();
        if mirror.snapshot(&profile.id)?.is_none() {
            mirror.set_snapshot(&ProfileSnapshot::capture(profile, now))?;
        }

        match self
            .background
            .resolve_pause_end(&profile.id, now, EventSource::Reconciliation)?
        {
            HandlerOutcome::Applied => {}
            HandlerOutcome::Skipped(SkipReason::PauseAlreadyResolved) => {
                info!("Overdue pause for {} already resolved", profile.name);
            }
            HandlerOutcome::Skipped(reason) => {
                warn!("Overdue pause for {} left open: {reason:?}", profile.name);
                return Ok(None);
            }
        }
        self.background.cancel(&profile.id, now)?;

        let resumed = self.store.finish_pause(session, now).await?;
        self.status.publish(&resumed, profile);
        Ok(Some(resumed))
    }

    async fn finish(
        &self,
        session: &Session,
        profile: &Profile,
        ended_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store.end_session(session, ended_at).await?;
        self.schedule.remove(&ActivityKey::timer(&profile.id));
        self.background.cancel(&profile.id, now)?;
        self.restrictions.deactivate_restrictions();
        self.status.session_ended(now);
        self.events.publish(DomainEvent::SessionEnded {
            profile_id: profile.id.clone(),
            source: EventSource::Reconciliation,
        });
        info!("Session {} closed during reconciliation at {ended_at}", session.id);
        Ok(())
    }
}
