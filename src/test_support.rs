//! Recording fakes for the OS and network collaborators, plus a fully
//! wired in-memory harness.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration as StdDuration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::{
    background::{BackgroundTaskScheduler, NotificationSink, WakeHorizons, WakeScheduler},
    db::{Database, Profile, ProfileSnapshot, Session},
    events::{DomainEvent, EventBus},
    reconcile::Reconciler,
    restriction::RestrictionEngine,
    schedule::{ActivityKey, ScheduleCoordinator, WindowScheduler},
    shared::{MemorySharedArea, SharedStateMirror},
    status::{StatusAttributes, StatusContent, StatusPublisher, StatusSurface},
    store::SessionStore,
    strategy::{EngineOptions, StartInput, StartOutcome, StopOutcome, StrategyEngine, StrategyKind},
    token::{ScannedToken, TokenValidator},
};

pub(crate) fn drain_events(rx: &mut broadcast::Receiver<DomainEvent>) -> Vec<DomainEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[derive(Default)]
struct RestrictionState {
    active: bool,
    activations: usize,
    deactivations: usize,
}

#[derive(Default)]
pub(crate) struct RecordingRestrictions {
    state: Mutex<RestrictionState>,
}

impl RecordingRestrictions {
    pub(crate) fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    pub(crate) fn activations(&self) -> usize {
        self.state.lock().unwrap().activations
    }

    pub(crate) fn deactivations(&self) -> usize {
        self.state.lock().unwrap().deactivations
    }
}

impl RestrictionEngine for RecordingRestrictions {
    fn activate_restrictions(&self, _snapshot: &ProfileSnapshot) {
        let mut state = self.state.lock().unwrap();
        state.active = true;
        state.activations += 1;
    }

    fn deactivate_restrictions(&self) {
        let mut state = self.state.lock().unwrap();
        state.active = false;
        state.deactivations += 1;
    }
}

#[derive(Default)]
pub(crate) struct FakeValidator {
    accepted: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Option<StdDuration>,
}

impl FakeValidator {
    pub(crate) fn accepting<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        let validator = Self::default();
        for id in ids {
            validator.accept(id);
        }
        validator
    }

    pub(crate) fn with_delay(mut self, delay: StdDuration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn accept(&self, id: &str) {
        self.accepted.lock().unwrap().insert(id.to_string());
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenValidator for FakeValidator {
    async fn verify(&self, token_id: &str) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            bail!("validator unreachable");
        }
        Ok(self.accepted.lock().unwrap().contains(token_id))
    }
}

#[derive(Default)]
pub(crate) struct FakeWindows {
    windows: Mutex<HashMap<ActivityKey, (DateTime<Utc>, DateTime<Utc>)>>,
    removed: Mutex<Vec<ActivityKey>>,
    declining: AtomicBool,
}

impl FakeWindows {
    pub(crate) fn window(&self, key: &ActivityKey) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.windows.lock().unwrap().get(key).copied()
    }

    pub(crate) fn removed(&self, key: &ActivityKey) -> bool {
        self.removed.lock().unwrap().contains(key)
    }

    pub(crate) fn set_declining(&self, declining: bool) {
        self.declining.store(declining, Ordering::SeqCst);
    }
}

impl WindowScheduler for FakeWindows {
    fn register_window(
        &self,
        key: &ActivityKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        if self.declining.load(Ordering::SeqCst) {
            bail!("monitoring limit reached");
        }
        self.windows.lock().unwrap().insert(key.clone(), (start, end));
        Ok(())
    }

    fn remove_window(&self, key: &ActivityKey) {
        self.windows.lock().unwrap().remove(key);
        self.removed.lock().unwrap().push(key.clone());
    }
}

#[derive(Default)]
pub(crate) struct FakeWakes {
    submitted: Mutex<Vec<DateTime<Utc>>>,
    cancels: AtomicUsize,
    declining: AtomicBool,
}

impl FakeWakes {
    pub(crate) fn last_submitted(&self) -> Option<DateTime<Utc>> {
        self.submitted.lock().unwrap().last().copied()
    }

    pub(crate) fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub(crate) fn set_declining(&self, declining: bool) {
        self.declining.store(declining, Ordering::SeqCst);
    }
}

impl WakeScheduler for FakeWakes {
    fn submit(&self, earliest_begin: DateTime<Utc>) -> Result<()> {
        if self.declining.load(Ordering::SeqCst) {
            bail!("too many pending requests");
        }
        self.submitted.lock().unwrap().push(earliest_begin);
        Ok(())
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct FakeNotifications {
    scheduled: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl FakeNotifications {
    pub(crate) fn is_scheduled(&self, id: &str) -> bool {
        self.scheduled.lock().unwrap().contains_key(id)
    }
}

impl NotificationSink for FakeNotifications {
    fn schedule(&self, id: &str, _title: &str, _body: &str, at: DateTime<Utc>) -> Result<()> {
        self.scheduled.lock().unwrap().insert(id.to_string(), at);
        Ok(())
    }

    fn cancel(&self, id: &str) {
        self.scheduled.lock().unwrap().remove(id);
    }
}

#[derive(Default)]
struct SurfaceState {
    live: HashSet<String>,
    started: usize,
    updates: Vec<StatusContent>,
}

#[derive(Default)]
pub(crate) struct FakeSurface {
    state: Mutex<SurfaceState>,
    failing: AtomicBool,
}

impl FakeSurface {
    pub(crate) fn started(&self) -> usize {
        self.state.lock().unwrap().started
    }

    pub(crate) fn updates(&self) -> Vec<StatusContent> {
        self.state.lock().unwrap().updates.clone()
    }

    pub(crate) fn kill(&self, handle: &str) {
        self.state.lock().unwrap().live.remove(handle);
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("surface unavailable");
        }
        Ok(())
    }
}

impl StatusSurface for FakeSurface {
    fn is_live(&self, handle: &str) -> bool {
        self.state.lock().unwrap().live.contains(handle)
    }

    fn start(&self, _attributes: &StatusAttributes, _content: &StatusContent) -> Result<String> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.started += 1;
        let handle = format!("surface-{}", state.started);
        state.live.insert(handle.clone());
        Ok(handle)
    }

    fn update(&self, handle: &str, content: &StatusContent) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if !state.live.contains(handle) {
            bail!("surface {handle} is gone");
        }
        state.updates.push(content.clone());
        Ok(())
    }

    fn end(&self, handle: &str, _content: &StatusContent) -> Result<()> {
        self.state.lock().unwrap().live.remove(handle);
        self.check()
    }
}

pub(crate) const HARNESS_TOKEN: &str = "box-1";

/// Every component wired against fakes, an in-memory shared area and a
/// temporary database.
pub(crate) struct Harness {
    pub(crate) store: SessionStore,
    pub(crate) schedule: ScheduleCoordinator,
    pub(crate) background: BackgroundTaskScheduler,
    pub(crate) engine: StrategyEngine,
    pub(crate) reconciler: Reconciler,
    pub(crate) restrictions: Arc<RecordingRestrictions>,
    pub(crate) validator: Arc<FakeValidator>,
    pub(crate) windows: Arc<FakeWindows>,
    pub(crate) surface: Arc<FakeSurface>,
    pub(crate) events: EventBus,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub(crate) async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("focuslock.sqlite3")).unwrap();
        let mirror = SharedStateMirror::new(Arc::new(MemorySharedArea::new()));
        let events = EventBus::new();

        let restrictions = Arc::new(RecordingRestrictions::default());
        let validator = Arc::new(FakeValidator::default());
        let windows = Arc::new(FakeWindows::default());
        let surface = Arc::new(FakeSurface::default());

        let store = SessionStore::new(db, mirror.clone());
        let schedule = ScheduleCoordinator::new(
            windows.clone(),
            mirror.clone(),
            restrictions.clone(),
            events.clone(),
        );
        let background = BackgroundTaskScheduler::new(
            mirror.clone(),
            Arc::new(FakeWakes::default()),
            Arc::new(FakeNotifications::default()),
            windows.clone(),
            restrictions.clone(),
            events.clone(),
            WakeHorizons::default(),
        );
        let status = StatusPublisher::new(surface.clone(), mirror);
        let engine = StrategyEngine::new(
            store.clone(),
            schedule.clone(),
            background.clone(),
            restrictions.clone(),
            validator.clone(),
            status.clone(),
            events.clone(),
            EngineOptions::default(),
        );
        let reconciler = Reconciler::new(
            store.clone(),
            schedule.clone(),
            background.clone(),
            restrictions.clone(),
            status,
            events.clone(),
        );

        Self {
            store,
            schedule,
            background,
            engine,
            reconciler,
            restrictions,
            validator,
            windows,
            surface,
            events,
            _dir: dir,
        }
    }

    pub(crate) async fn profile(&self, strategy: StrategyKind) -> Profile {
        let profile = Profile::new("Focus", strategy, Utc::now());
        self.store.save_profile(&profile).await.unwrap();
        profile
    }

    pub(crate) async fn start_token_session(&self, token: &str, force_start: bool) -> Session {
        let profile = self.profile(StrategyKind::TokenOnly).await;
        let now = Utc::now();
        let StartOutcome::AwaitingScan(pending) =
            self.engine.start(&profile.id, force_start, now).await.unwrap()
        else {
            panic!("token profile should wait for a scan");
        };
        match self
            .engine
            .complete_start(&pending, StartInput::Scan(ScannedToken::single(token)), now)
            .await
            .unwrap()
        {
            StartOutcome::Started(session) => session,
            other => panic!("token start failed: {other:?}"),
        }
    }

    async fn start_with_duration(
        &self,
        strategy: StrategyKind,
        minutes: u32,
        at: DateTime<Utc>,
    ) -> Session {
        let profile = self.profile(strategy).await;
        let StartOutcome::AwaitingDuration(pending) =
            self.engine.start(&profile.id, false, at).await.unwrap()
        else {
            panic!("{strategy:?} should ask for a duration");
        };
        match self
            .engine
            .complete_start(&pending, StartInput::Duration { minutes }, at)
            .await
            .unwrap()
        {
            StartOutcome::Started(session) => session,
            other => panic!("duration start failed: {other:?}"),
        }
    }

    pub(crate) async fn start_pause_session(&self, minutes: u32, at: DateTime<Utc>) -> Session {
        self.start_with_duration(StrategyKind::TokenPauseResume, minutes, at)
            .await
    }

    pub(crate) async fn start_timer_session(&self, minutes: u32, at: DateTime<Utc>) -> Session {
        self.start_with_duration(StrategyKind::TimerThenTokenStop, minutes, at)
            .await
    }

    /// First scan on a pause session.
    pub(crate) async fn pause(&self, session: &Session, at: DateTime<Utc>) -> Session {
        self.validator.accept(HARNESS_TOKEN);
        match self
            .engine
            .stop(&session.id, Some(ScannedToken::single(HARNESS_TOKEN)), at)
            .await
            .unwrap()
        {
            StopOutcome::Paused(session) => session,
            other => panic!("expected a pause, got {other:?}"),
        }
    }
}
