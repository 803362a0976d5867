//! Recovery wakes for work that must happen while the app is suspended.
//!
//! OS time windows are best effort, so every pending pause end is also
//! recorded as a [`BackgroundTask`] in the shared area and backed by an
//! earliest-begin wake request. Whichever path fires first re-applies the
//! restrictions; the others find the pause already resolved and do nothing.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    events::{DomainEvent, EventBus, EventSource},
    restriction::RestrictionEngine,
    schedule::{ActivityKey, WindowScheduler},
    shared::{HandlerOutcome, PauseEndCheck, SharedStateMirror, BACKGROUND_TASKS_KEY},
};

// Set to false to silence wake logging.
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const PAUSE_END_TASK_PREFIX: &str = "pauseEnd:";
const PAUSE_END_NOTIFICATION_PREFIX: &str = "pauseEndNotification:";
const PAUSE_END_TITLE: &str = "Break is over";

pub const DEFAULT_RECOVERY_HORIZON_SECS: i64 = 60;
pub const DEFAULT_BACKGROUND_HORIZON_SECS: i64 = 30;

pub fn pause_end_task_id(profile_id: &str) -> String {
    format!("{PAUSE_END_TASK_PREFIX}{profile_id}")
}

pub fn pause_end_notification_id(profile_id: &str) -> String {
    format!("{PAUSE_END_NOTIFICATION_PREFIX}{profile_id}")
}

/// A pending unit of background work, keyed by task id in the shared area.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundTask {
    pub execution_time: DateTime<Utc>,
    #[serde(flatten)]
    pub target: TaskTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TaskTarget {
    PauseEnd {
        #[serde(rename = "pauseProfileId")]
        pause_profile_id: String,
    },
    Notification {
        #[serde(rename = "notificationId")]
        notification_id: String,
    },
}

pub type TaskTable = BTreeMap<String, BackgroundTask>;

/// OS primitive: a single generic "wake me no earlier than" request.
pub trait WakeScheduler: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the OS refuses the request.
    fn submit(&self, earliest_begin: DateTime<Utc>) -> Result<()>;

    /// Withdraw any outstanding request.
    fn cancel(&self);
}

/// OS primitive: local notifications shown to the user.
pub trait NotificationSink: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the notification could not be scheduled.
    fn schedule(&self, id: &str, title: &str, body: &str, at: DateTime<Utc>) -> Result<()>;

    fn cancel(&self, id: &str);
}

/// Caps on how far out a wake request may be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeHorizons {
    /// Cap for wakes chained from inside a wake.
    pub recovery: Duration,
    /// Cap applied when a pause is scheduled or the app leaves the
    /// foreground.
    pub background: Duration,
}

impl Default for WakeHorizons {
    fn default() -> Self {
        Self {
            recovery: Duration::seconds(DEFAULT_RECOVERY_HORIZON_SECS),
            background: Duration::seconds(DEFAULT_BACKGROUND_HORIZON_SECS),
        }
    }
}

/// What one wake did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WakeReport {
    /// Profiles whose restrictions this wake re-applied.
    pub reblocked: Vec<String>,
    /// Pause-end tasks that were already handled elsewhere.
    pub already_resolved: Vec<String>,
    pub expired_notifications: Vec<String>,
    pub next_wake: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct BackgroundTaskScheduler {
    mirror: SharedStateMirror,
    wakes: Arc<dyn WakeScheduler>,
    notifications: Arc<dyn NotificationSink>,
    windows: Arc<dyn WindowScheduler>,
    restrictions: Arc<dyn RestrictionEngine>,
    events: EventBus,
    horizons: WakeHorizons,
}

impl BackgroundTaskScheduler {
    pub fn new(
        mirror: SharedStateMirror,
        wakes: Arc<dyn WakeScheduler>,
        notifications: Arc<dyn NotificationSink>,
        windows: Arc<dyn WindowScheduler>,
        restrictions: Arc<dyn RestrictionEngine>,
        events: EventBus,
        horizons: WakeHorizons,
    ) -> Self {
        Self {
            mirror,
            wakes,
            notifications,
            windows,
            restrictions,
            events,
            horizons,
        }
    }

    pub fn tasks(&self) -> Result<TaskTable> {
        Ok(self
            .mirror
            .load::<TaskTable>(BACKGROUND_TASKS_KEY)?
            .unwrap_or_default())
    }

    fn save_tasks(&self, tasks: &TaskTable) -> Result<()> {
        if tasks.is_empty() {
            self.mirror.remove(BACKGROUND_TASKS_KEY)
        } else {
            self.mirror.store(BACKGROUND_TASKS_KEY, tasks)
        }
    }

    fn submit_wake(&self, at: DateTime<Utc>) -> bool {
        match self.wakes.submit(at) {
            Ok(()) => {
                log_info!("Requested recovery wake at {at}");
                true
            }
            Err(err) => {
                log_warn!("OS declined recovery wake at {at}: {err:#}");
                false
            }
        }
    }

    /// Record the pause end for `profile_id`, schedule the "break is over"
    /// notification and request the first wake.
    pub fn schedule_pause_end(
        &self,
        profile_id: &str,
        profile_name: &str,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tasks = self.tasks()?;
        tasks.insert(
            pause_end_task_id(profile_id),
            BackgroundTask {
                execution_time: end,
                target: TaskTarget::PauseEnd {
                    pause_profile_id: profile_id.to_string(),
                },
            },
        );
        self.save_tasks(&tasks)?;

        let body = format!("{profile_name} is blocking again.");
        if let Err(err) = self.notifications.schedule(
            &pause_end_notification_id(profile_id),
            PAUSE_END_TITLE,
            &body,
            end,
        ) {
            log_warn!("Failed to schedule pause-end notification: {err:#}");
        }

        self.submit_wake(end.min(now + self.horizons.background));
        Ok(())
    }

    /// Show a notification after `after` and remember it so a later wake
    /// can clear it once it is stale. Returns the notification id.
    pub fn schedule_notification(
        &self,
        title: &str,
        body: &str,
        after: Duration,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let notification_id = Uuid::new_v4().to_string();
        let at = now + after;
        self.notifications
            .schedule(&notification_id, title, body, at)?;

        let mut tasks = self.tasks()?;
        tasks.insert(
            notification_id.clone(),
            BackgroundTask {
                execution_time: at,
                target: TaskTarget::Notification {
                    notification_id: notification_id.clone(),
                },
            },
        );
        self.save_tasks(&tasks)?;
        Ok(notification_id)
    }

    /// Run every due task. Tasks that are not due yet stay pending and a
    /// new wake is chained for the earliest of them.
    pub fn handle_wake(&self, now: DateTime<Utc>) -> Result<WakeReport> {
        let tasks = self.tasks()?;
        let mut report = WakeReport::default();
        let mut finished = Vec::new();

        for (task_id, task) in tasks.iter().filter(|(_, task)| task.execution_time <= now) {
            log_debug!("Running task {task_id} due at {}", task.execution_time);
            match &task.target {
                TaskTarget::PauseEnd { pause_profile_id } => {
                    match self.resolve_pause_end(pause_profile_id, now, EventSource::Recovery) {
                        Ok(HandlerOutcome::Applied) => {
                            report.reblocked.push(pause_profile_id.clone())
                        }
                        Ok(HandlerOutcome::Skipped(reason)) => {
                            log_info!(
                                "Pause end for {pause_profile_id} already handled: {reason:?}"
                            );
                            report.already_resolved.push(pause_profile_id.clone());
                        }
                        Err(err) => {
                            // Left in the table; the chained wake retries it.
                            log_error!(
                                "Failed to resolve pause end for {pause_profile_id}: {err:#}"
                            );
                            continue;
                        }
                    }
                }
                TaskTarget::Notification { notification_id } => {
                    self.notifications.cancel(notification_id);
                    report.expired_notifications.push(notification_id.clone());
                }
            }
            finished.push((task_id, task));
        }

        // Re-read so a cancel or a fresh schedule from the foreground
        // between the two reads is kept. Pause-end ids are reused per
        // profile, so only drop an entry that is still the one we ran.
        let mut remaining = self.tasks()?;
        for (task_id, task) in finished {
            if remaining.get(task_id) == Some(task) {
                remaining.remove(task_id);
            }
        }
        self.save_tasks(&remaining)?;

        if let Some(earliest) = remaining.values().map(|task| task.execution_time).min() {
            let at = earliest.min(now + self.horizons.recovery);
            if self.submit_wake(at) {
                report.next_wake = Some(at);
            }
        }

        log_info!(
            "Wake at {now}: reblocked={:?} resolved={:?} notifications={}",
            report.reblocked,
            report.already_resolved,
            report.expired_notifications.len()
        );
        Ok(report)
    }

    /// Shared pause-end action for the recovery wake and foreground
    /// reconciliation. Re-checks the mirror first; re-applies restrictions,
    /// stamps the pause end and removes the pause window when still due.
    pub fn resolve_pause_end(
        &self,
        profile_id: &str,
        now: DateTime<Utc>,
        source: EventSource,
    ) -> Result<HandlerOutcome> {
        let snapshot = match self.mirror.check_pause_end(profile_id)? {
            PauseEndCheck::Due(snapshot) => snapshot,
            PauseEndCheck::Skip(reason) => return Ok(HandlerOutcome::Skipped(reason)),
        };

        self.restrictions.activate_restrictions(&snapshot);
        self.mirror.set_pause_end(now)?;
        self.windows.remove_window(&ActivityKey::pause(profile_id));
        self.events.publish(DomainEvent::PauseEnded {
            profile_id: profile_id.to_string(),
            source,
        });
        Ok(HandlerOutcome::Applied)
    }

    /// Tighten the wake before the app is suspended. Returns the requested
    /// time, if any pause end is still pending.
    pub fn reschedule_on_background(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let earliest = self
            .tasks()?
            .values()
            .filter(|task| matches!(task.target, TaskTarget::PauseEnd { .. }))
            .map(|task| task.execution_time)
            .min();

        let Some(earliest) = earliest else {
            return Ok(None);
        };
        let at = earliest.min(now + self.horizons.background);
        Ok(self.submit_wake(at).then_some(at))
    }

    /// Drop the pause-end work for `profile_id`. Safe to call when nothing
    /// is pending.
    pub fn cancel(&self, profile_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut tasks = self.tasks()?;
        if tasks.remove(&pause_end_task_id(profile_id)).is_some() {
            self.save_tasks(&tasks)?;
            log_info!("Cancelled pause-end task for {profile_id}");
        }
        self.notifications
            .cancel(&pause_end_notification_id(profile_id));
        self.wakes.cancel();

        // Keep the chain alive for anything else still waiting.
        if let Some(earliest) = tasks.values().map(|task| task.execution_time).min() {
            self.submit_wake(earliest.min(now + self.horizons.recovery));
        }
        Ok(())
    }

    pub fn cancel_all(&self) -> Result<()> {
        for (task_id, task) in self.tasks()? {
            match task.target {
                TaskTarget::PauseEnd { pause_profile_id } => self
                    .notifications
                    .cancel(&pause_end_notification_id(&pause_profile_id)),
                TaskTarget::Notification { notification_id } => {
                    self.notifications.cancel(&notification_id)
                }
            }
            log_info!("Cancelled background task {task_id}");
        }
        self.save_tasks(&TaskTable::new())?;
        self.wakes.cancel();
        Ok(())
    }
}
