pub mod app;
pub mod background;
pub mod db;
pub mod error;
pub mod events;
pub mod reconcile;
pub mod restriction;
pub mod schedule;
pub mod settings;
pub mod shared;
pub mod status;
pub mod store;
pub mod strategy;
pub mod token;
mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use app::{BackgroundContext, FocusApp, OsServices};
pub use background::{BackgroundTaskScheduler, NotificationSink, WakeReport, WakeScheduler};
pub use db::{Database, Profile, ProfileSnapshot, Session, StrategyConfig};
pub use error::{Refusal, StartError};
pub use events::{DomainEvent, EventBus, EventSource};
pub use reconcile::{ReconcileAction, ReconcileReport, Reconciler};
pub use restriction::RestrictionEngine;
pub use schedule::{ActivityKey, ActivityKind, ScheduleCoordinator, WindowScheduler};
pub use settings::{FocusSettings, SettingsStore};
pub use shared::{
    FileSharedArea, HandlerOutcome, MemorySharedArea, SharedArea, SharedSession,
    SharedStateMirror, SkipReason,
};
pub use status::{StatusContent, StatusPublisher, StatusSurface};
pub use store::SessionStore;
pub use strategy::{
    PendingStart, StartInput, StartOutcome, StopOutcome, StrategyEngine, StrategyKind,
};
pub use token::{HttpTokenValidator, ScannedToken, TokenValidator};

/// Initialise `env_logger` (reads `RUST_LOG`). Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();
    log::info!("focuslock logging initialised");
}
