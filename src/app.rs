//! Process wiring for the two execution contexts.
//!
//! [`FocusApp`] is the interactive foreground: it owns the database, the
//! strategy engine and the status surface. [`BackgroundContext`] is what the
//! OS spins up for window callbacks and recovery wakes; it only ever touches
//! the shared area. The two meet nowhere else.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    background::{
        BackgroundTaskScheduler, NotificationSink, WakeHorizons, WakeReport, WakeScheduler,
    },
    db::Database,
    events::{DomainEvent, EventBus, EventSource},
    reconcile::{ReconcileReport, Reconciler},
    restriction::RestrictionEngine,
    schedule::{ActivityKey, ScheduleCoordinator, WindowScheduler},
    settings::SettingsStore,
    shared::{FileSharedArea, HandlerOutcome, SharedArea, SharedStateMirror},
    status::{StatusPublisher, StatusSurface},
    store::SessionStore,
    strategy::StrategyEngine,
    token::{HttpTokenValidator, TokenValidator},
};

const DB_FILE: &str = "focuslock.sqlite3";
const SHARED_DIR: &str = "shared";
const SETTINGS_FILE: &str = "settings.json";

/// OS primitives both contexts need.
#[derive(Clone)]
pub struct OsServices {
    pub restrictions: Arc<dyn RestrictionEngine>,
    pub windows: Arc<dyn WindowScheduler>,
    pub wakes: Arc<dyn WakeScheduler>,
    pub notifications: Arc<dyn NotificationSink>,
}

pub fn shared_area_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SHARED_DIR)
}

fn background_scheduler(
    mirror: &SharedStateMirror,
    os: &OsServices,
    events: &EventBus,
    horizons: WakeHorizons,
) -> BackgroundTaskScheduler {
    BackgroundTaskScheduler::new(
        mirror.clone(),
        os.wakes.clone(),
        os.notifications.clone(),
        os.windows.clone(),
        os.restrictions.clone(),
        events.clone(),
        horizons,
    )
}

pub struct FocusApp {
    settings: SettingsStore,
    store: SessionStore,
    engine: StrategyEngine,
    schedule: ScheduleCoordinator,
    background: BackgroundTaskScheduler,
    reconciler: Reconciler,
    status: StatusPublisher,
    events: EventBus,
    listener: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl FocusApp {
    /// Open every store under `data_dir`, re-attach to a surviving status
    /// surface and reconcile whatever happened while the app was gone.
    ///
    /// Without an explicit `validator`, the HTTP validator is built from
    /// the configured base URL.
    pub async fn open(
        data_dir: &Path,
        os: OsServices,
        surface: Arc<dyn StatusSurface>,
        validator: Option<Arc<dyn TokenValidator>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let settings = SettingsStore::new(data_dir.join(SETTINGS_FILE))?;
        let config = settings.settings();

        let validator: Arc<dyn TokenValidator> = match validator {
            Some(validator) => validator,
            None => {
                let base_url = config
                    .validator_base_url
                    .as_deref()
                    .ok_or_else(|| anyhow!("no token validator URL configured"))?;
                Arc::new(HttpTokenValidator::new(
                    base_url,
                    config.engine_options().token_timeout,
                )?)
            }
        };

        let database = Database::new(data_dir.join(DB_FILE))?;
        let area: Arc<dyn SharedArea> = Arc::new(FileSharedArea::new(shared_area_path(data_dir))?);
        let mirror = SharedStateMirror::new(area);
        let events = EventBus::new();

        let store = SessionStore::new(database, mirror.clone());
        let schedule = ScheduleCoordinator::new(
            os.windows.clone(),
            mirror.clone(),
            os.restrictions.clone(),
            events.clone(),
        );
        let background = background_scheduler(&mirror, &os, &events, config.horizons());
        let status = StatusPublisher::new(surface, mirror);
        let engine = StrategyEngine::new(
            store.clone(),
            schedule.clone(),
            background.clone(),
            os.restrictions.clone(),
            validator,
            status.clone(),
            events.clone(),
            config.engine_options(),
        );
        let reconciler = Reconciler::new(
            store.clone(),
            schedule.clone(),
            background.clone(),
            os.restrictions.clone(),
            status.clone(),
            events.clone(),
        );

        status.restore();
        // Finalize whatever ran out while the app was not running.
        if let Err(err) = reconciler.reconcile(Utc::now()).await {
            error!("Startup reconciliation failed: {err:#}");
        }

        let cancel_token = CancellationToken::new();
        let listener = tokio::spawn(event_loop(
            reconciler.clone(),
            events.subscribe(),
            cancel_token.clone(),
        ));

        info!("Focus app opened at {}", data_dir.display());
        Ok(Self {
            settings,
            store,
            engine,
            schedule,
            background,
            reconciler,
            status,
            events,
            listener: Some(listener),
            cancel_token: Some(cancel_token),
        })
    }

    pub fn engine(&self) -> &StrategyEngine {
        &self.engine
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn schedule(&self) -> &ScheduleCoordinator {
        &self.schedule
    }

    pub fn background(&self) -> &BackgroundTaskScheduler {
        &self.background
    }

    pub fn status(&self) -> &StatusPublisher {
        &self.status
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    pub async fn on_foreground_resume(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        self.reconciler.reconcile(now).await
    }

    /// Tighten the recovery wake before the OS suspends the app.
    pub fn on_enter_background(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        self.background.reschedule_on_background(now)
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        if let Some(handle) = self.listener.take() {
            handle.await?;
        }
        Ok(())
    }
}

impl Drop for FocusApp {
    fn drop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
    }
}

/// Fold in-process background transitions (window callbacks or wakes
/// delivered to the foreground process) into the durable store.
async fn event_loop(
    reconciler: Reconciler,
    mut events: broadcast::Receiver<DomainEvent>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    if needs_reconcile(&event) {
                        if let Err(err) = reconciler.reconcile(Utc::now()).await {
                            error!("Reconciliation after {event:?} failed: {err:#}");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Event listener missed {missed} events; reconciling");
                    if let Err(err) = reconciler.reconcile(Utc::now()).await {
                        error!("Reconciliation after lag failed: {err:#}");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = cancel_token.cancelled() => {
                info!("Event listener shutting down");
                break;
            }
        }
    }
}

fn needs_reconcile(event: &DomainEvent) -> bool {
    matches!(
        event,
        DomainEvent::PauseEnded {
            source: EventSource::Schedule | EventSource::Recovery,
            ..
        } | DomainEvent::SessionEnded {
            source: EventSource::Schedule | EventSource::Recovery,
            ..
        }
    )
}

/// Entry points the OS invokes while the app is suspended.
#[derive(Clone)]
pub struct BackgroundContext {
    schedule: ScheduleCoordinator,
    background: BackgroundTaskScheduler,
    events: EventBus,
}

impl BackgroundContext {
    pub fn open(data_dir: &Path, os: OsServices) -> Result<Self> {
        let horizons = SettingsStore::new(data_dir.join(SETTINGS_FILE))?
            .settings()
            .horizons();
        let area: Arc<dyn SharedArea> = Arc::new(FileSharedArea::new(shared_area_path(data_dir))?);
        Ok(Self::new(area, os, horizons))
    }

    pub fn new(area: Arc<dyn SharedArea>, os: OsServices, horizons: WakeHorizons) -> Self {
        let mirror = SharedStateMirror::new(area);
        let events = EventBus::new();
        let schedule = ScheduleCoordinator::new(
            os.windows.clone(),
            mirror.clone(),
            os.restrictions.clone(),
            events.clone(),
        );
        let background = background_scheduler(&mirror, &os, &events, horizons);
        Self {
            schedule,
            background,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    pub fn handle_window_start(&self, key: &str, now: DateTime<Utc>) -> Result<HandlerOutcome> {
        self.schedule
            .handle_window_start(&key.parse::<ActivityKey>()?, now)
    }

    pub fn handle_window_end(&self, key: &str, now: DateTime<Utc>) -> Result<HandlerOutcome> {
        self.schedule
            .handle_window_end(&key.parse::<ActivityKey>()?, now)
    }

    pub fn handle_wake(&self, now: DateTime<Utc>) -> Result<WakeReport> {
        self.background.handle_wake(now)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use chrono::Duration;

    use crate::{
        db::Profile,
        reconcile::ReconcileAction,
        shared::SkipReason,
        strategy::{StartInput, StartOutcome, StopOutcome, StrategyKind},
        test_support::{
            drain_events, FakeNotifications, FakeSurface, FakeValidator, FakeWakes, FakeWindows,
            RecordingRestrictions,
        },
        token::ScannedToken,
    };

    use super::*;

    const TOKEN: &str = "box-1";

    struct World {
        app: FocusApp,
        bg: BackgroundContext,
        restrictions: Arc<RecordingRestrictions>,
        windows: Arc<FakeWindows>,
        wakes: Arc<FakeWakes>,
        surface: Arc<FakeSurface>,
        dir: tempfile::TempDir,
        os: OsServices,
    }

    async fn world() -> World {
        let dir = tempfile::tempdir().unwrap();
        let restrictions = Arc::new(RecordingRestrictions::default());
        let windows = Arc::new(FakeWindows::default());
        let wakes = Arc::new(FakeWakes::default());
        let os = OsServices {
            restrictions: restrictions.clone(),
            windows: windows.clone(),
            wakes: wakes.clone(),
            notifications: Arc::new(FakeNotifications::default()),
        };
        let surface = Arc::new(FakeSurface::default());
        let validator = Arc::new(FakeValidator::accepting([TOKEN]));

        let app = FocusApp::open(dir.path(), os.clone(), surface.clone(), Some(validator))
            .await
            .unwrap();
        let bg = BackgroundContext::open(dir.path(), os.clone()).unwrap();

        World {
            app,
            bg,
            restrictions,
            windows,
            wakes,
            surface,
            dir,
            os,
        }
    }

    fn scan() -> Option<ScannedToken> {
        Some(ScannedToken::single(TOKEN))
    }

    /// Start a 15 minute pause profile at `t0` and take the first scan.
    async fn paused_session(w: &World, t0: DateTime<Utc>) -> (Profile, String) {
        let profile = Profile::new("Evenings", StrategyKind::TokenPauseResume, t0);
        w.app.store().save_profile(&profile).await.unwrap();

        let StartOutcome::AwaitingDuration(pending) =
            w.app.engine().start(&profile.id, false, t0).await.unwrap()
        else {
            panic!("pause profile should ask for a duration");
        };
        let StartOutcome::Started(session) = w
            .app
            .engine()
            .complete_start(&pending, StartInput::Duration { minutes: 15 }, t0)
            .await
            .unwrap()
        else {
            panic!("duration should start the session");
        };

        let paused = w.app.engine().stop(&session.id, scan(), t0).await.unwrap();
        let StopOutcome::Paused(paused) = paused else {
            panic!("first scan should pause, got {paused:?}");
        };
        assert_eq!(paused.pause_started_at, Some(t0));
        assert_eq!(paused.pause_ended_at, None);
        (profile, session.id)
    }

    fn count_pause_ended(events: &[DomainEvent]) -> usize {
        events
            .iter()
            .filter(|event| matches!(event, DomainEvent::PauseEnded { .. }))
            .count()
    }

    #[tokio::test]
    async fn second_scan_during_pause_ends_without_reblock() {
        let w = world().await;
        let t0 = Utc::now();
        let (profile, session_id) = paused_session(&w, t0).await;
        let pause_key = ActivityKey::pause(&profile.id);

        assert!(!w.restrictions.is_active());
        assert_eq!(w.windows.window(&pause_key), Some((t0, t0 + Duration::minutes(15))));

        let stopped = w
            .app
            .engine()
            .stop(&session_id, scan(), t0 + Duration::minutes(5))
            .await
            .unwrap();
        assert!(matches!(stopped, StopOutcome::Ended(_)));
        assert_eq!(w.windows.window(&pause_key), None);
        assert!(w.app.background().tasks().unwrap().is_empty());
        assert!(w.wakes.cancels() >= 1);

        // The OS may still deliver what was cancelled.
        let end = t0 + Duration::minutes(15);
        assert_eq!(
            w.bg.handle_window_end(&pause_key.to_string(), end).unwrap(),
            HandlerOutcome::Skipped(SkipReason::NoActiveSession)
        );
        let report = w.bg.handle_wake(end + Duration::seconds(30)).unwrap();
        assert!(report.reblocked.is_empty());

        assert_eq!(w.restrictions.activations(), 1);
        assert!(!w.restrictions.is_active());
    }

    #[tokio::test]
    async fn pause_expiry_reblocks_exactly_once() {
        let w = world().await;
        let t0 = Utc::now() - Duration::minutes(20);
        let (profile, session_id) = paused_session(&w, t0).await;
        let key = ActivityKey::pause(&profile.id).to_string();
        let mut bg_events = w.bg.subscribe();
        let end = t0 + Duration::minutes(15);

        w.bg.handle_window_start(&key, t0 + Duration::seconds(2)).unwrap();
        assert_eq!(w.bg.handle_window_end(&key, end).unwrap(), HandlerOutcome::Applied);
        let first = w.bg.handle_wake(end + Duration::seconds(20)).unwrap();
        let second = w.bg.handle_wake(end + Duration::seconds(45)).unwrap();
        assert!(first.reblocked.is_empty() && second.reblocked.is_empty());

        let report = w.app.on_foreground_resume(end + Duration::minutes(1)).await.unwrap();
        assert_eq!(report.actions, vec![ReconcileAction::PauseMarksAbsorbed]);

        // Start plus one re-block.
        assert_eq!(w.restrictions.activations(), 2);
        assert!(w.restrictions.is_active());
        assert_eq!(count_pause_ended(&drain_events(&mut bg_events)), 1);

        let stored = w.app.store().session(&session_id).await.unwrap();
        assert_eq!(stored.pause_started_at, Some(t0));
        assert_eq!(stored.pause_ended_at, Some(end));
    }

    #[tokio::test]
    async fn recovery_wake_covers_dropped_window_callback() {
        let w = world().await;
        let t0 = Utc::now() - Duration::minutes(20);
        let (profile, _) = paused_session(&w, t0).await;
        let mut bg_events = w.bg.subscribe();
        let end = t0 + Duration::minutes(15);

        let early = w.bg.handle_wake(end - Duration::minutes(1)).unwrap();
        assert_eq!(early.next_wake, Some(end));
        let due = w.bg.handle_wake(end + Duration::seconds(5)).unwrap();
        assert_eq!(due.reblocked, vec![profile.id.clone()]);

        // The late window callback finds the pause already closed.
        let key = ActivityKey::pause(&profile.id).to_string();
        assert_eq!(
            w.bg.handle_window_end(&key, end + Duration::seconds(40)).unwrap(),
            HandlerOutcome::Skipped(SkipReason::PauseAlreadyResolved)
        );
        assert_eq!(w.restrictions.activations(), 2);
        assert_eq!(count_pause_ended(&drain_events(&mut bg_events)), 1);
    }

    #[tokio::test]
    async fn reconcile_catches_fully_dropped_pause_end() {
        let w = world().await;
        let t0 = Utc::now() - Duration::minutes(40);
        let (_, session_id) = paused_session(&w, t0).await;

        let report = w.app.on_foreground_resume(Utc::now()).await.unwrap();
        assert_eq!(report.actions, vec![ReconcileAction::PauseEndRecovered]);
        assert!(w.restrictions.is_active());
        assert!(!w.app.store().session(&session_id).await.unwrap().is_pause_active());

        let again = w.app.on_foreground_resume(Utc::now()).await.unwrap();
        assert!(again.actions.is_empty());
        assert_eq!(w.restrictions.activations(), 2);
    }

    #[tokio::test]
    async fn backgrounding_tightens_wake_to_pause_end() {
        let w = world().await;
        let t0 = Utc::now();
        paused_session(&w, t0).await;
        let end = t0 + Duration::minutes(15);

        let near_end = end - Duration::seconds(10);
        assert_eq!(w.app.on_enter_background(near_end).unwrap(), Some(end));
        let far = t0 + Duration::minutes(1);
        assert_eq!(
            w.app.on_enter_background(far).unwrap(),
            Some(far + Duration::seconds(30))
        );
    }

    #[tokio::test]
    async fn in_process_window_end_is_folded_into_store() {
        let w = world().await;
        let t0 = Utc::now();
        let (profile, session_id) = paused_session(&w, t0).await;

        w.app
            .schedule()
            .handle_window_end(&ActivityKey::pause(&profile.id), t0 + Duration::seconds(1))
            .unwrap();

        let mut stored = None;
        for _ in 0..50 {
            let session = w.app.store().session(&session_id).await.unwrap();
            if session.pause_ended_at.is_some() {
                stored = Some(session);
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        let stored = stored.expect("listener should absorb the pause end");
        assert_eq!(stored.pause_ended_at, Some(t0 + Duration::seconds(1)));
    }

    #[tokio::test]
    async fn at_most_one_active_session_across_operations() {
        let w = world().await;
        let t0 = Utc::now();
        let manual = Profile::new("Manual", StrategyKind::Manual, t0);
        w.app.store().save_profile(&manual).await.unwrap();

        let (_, paused_id) = paused_session(&w, t0).await;
        assert!(w.app.engine().start(&manual.id, false, t0).await.is_err());
        assert_eq!(w.app.store().database().count_active_sessions().await.unwrap(), 1);

        w.app
            .engine()
            .stop(&paused_id, scan(), t0 + Duration::minutes(1))
            .await
            .unwrap();
        let started = w.app.engine().start(&manual.id, false, t0).await.unwrap();
        assert!(matches!(started, StartOutcome::Started(_)));
        assert_eq!(w.app.store().database().count_active_sessions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn force_started_session_stops_with_any_valid_token() {
        let w = world().await;
        let t0 = Utc::now();
        let mut profile = Profile::new("Locked", StrategyKind::TimerThenTokenStop, t0);
        profile.required_token_id = Some("box-9".into());
        w.app.store().save_profile(&profile).await.unwrap();

        for force_start in [false, true] {
            let StartOutcome::AwaitingDuration(pending) =
                w.app.engine().start(&profile.id, force_start, t0).await.unwrap()
            else {
                panic!("timer profile should ask for a duration");
            };
            let StartOutcome::Started(session) = w
                .app
                .engine()
                .complete_start(&pending, StartInput::Duration { minutes: 30 }, t0)
                .await
                .unwrap()
            else {
                panic!("duration should start the session");
            };

            let outcome = w.app.engine().stop(&session.id, scan(), t0).await.unwrap();
            if force_start {
                assert!(matches!(outcome, StopOutcome::Ended(_)));
            } else {
                assert!(matches!(outcome, StopOutcome::Refused(_)));
                assert!(w.app.store().session(&session.id).await.unwrap().is_active());
                w.app.store().end_session(&session, t0).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn reopening_restores_status_surface() {
        let mut w = world().await;
        let t0 = Utc::now();
        paused_session(&w, t0).await;
        assert_eq!(w.surface.started(), 1);
        let handle = w.app.status().current_handle();
        w.app.shutdown().await.unwrap();

        let validator = Arc::new(FakeValidator::accepting([TOKEN]));
        let reopened = FocusApp::open(
            w.dir.path(),
            w.os.clone(),
            w.surface.clone(),
            Some(validator),
        )
        .await
        .unwrap();
        assert_eq!(reopened.status().current_handle(), handle);
        assert_eq!(w.surface.started(), 1);
    }

    #[tokio::test]
    async fn bad_window_key_is_an_error() {
        let w = world().await;
        assert!(w.bg.handle_window_end("garbage", Utc::now()).is_err());
    }
}
