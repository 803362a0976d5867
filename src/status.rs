//! Live status surface projection.
//!
//! At most one surface is live per device. Its handle is saved in the
//! shared area so a restarted foreground process picks the existing surface
//! back up instead of starting a second one. Every failure here is logged
//! and swallowed: presentation never affects session state.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{info, warn};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::{
    db::{Profile, Session},
    shared::{SharedStateMirror, STATUS_SURFACE_KEY},
};

const FOCUS_MESSAGES: &[&str] = &[
    "One thing at a time.",
    "Deep work in progress.",
    "Your future self says thanks.",
    "Stay with it.",
    "Distractions can wait.",
];

/// Fixed for the lifetime of a surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusAttributes {
    pub profile_name: String,
    pub message: String,
}

/// Presentation snapshot pushed on every tracked transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusContent {
    /// Session start shifted forward by the completed break, so the surface
    /// can count elapsed focus time from it.
    pub elapsed_origin: DateTime<Utc>,
    pub is_break_active: bool,
    pub break_started_at: Option<DateTime<Utc>>,
    pub break_ended_at: Option<DateTime<Utc>>,
    pub is_pause_active: bool,
    pub pause_started_at: Option<DateTime<Utc>>,
    pub pause_duration_minutes: Option<u32>,
}

impl StatusContent {
    pub fn project(session: &Session, profile: &Profile) -> Self {
        let pause_duration_minutes = profile
            .strategy
            .capabilities()
            .has_pause
            .then(|| profile.strategy_config().pause_minutes());

        Self {
            elapsed_origin: session.started_at + session.completed_break(),
            is_break_active: session.is_break_active(),
            break_started_at: session.break_started_at,
            break_ended_at: session.break_ended_at,
            is_pause_active: session.is_pause_active(),
            pause_started_at: session.pause_started_at,
            pause_duration_minutes,
        }
    }

    /// Final content shown while the surface is dismissed.
    pub fn ended(now: DateTime<Utc>) -> Self {
        Self {
            elapsed_origin: now,
            is_break_active: false,
            break_started_at: None,
            break_ended_at: None,
            is_pause_active: false,
            pause_started_at: None,
            pause_duration_minutes: None,
        }
    }
}

/// Host primitive for the on-screen status surface.
pub trait StatusSurface: Send + Sync {
    /// Whether the surface behind `handle` still exists.
    fn is_live(&self, handle: &str) -> bool;

    /// # Errors
    ///
    /// Returns an error when the host refuses to show a surface.
    fn start(&self, attributes: &StatusAttributes, content: &StatusContent) -> Result<String>;

    fn update(&self, handle: &str, content: &StatusContent) -> Result<()>;

    fn end(&self, handle: &str, content: &StatusContent) -> Result<()>;
}

#[derive(Clone)]
pub struct StatusPublisher {
    surface: Arc<dyn StatusSurface>,
    mirror: SharedStateMirror,
    current: Arc<Mutex<Option<String>>>,
}

impl StatusPublisher {
    pub fn new(surface: Arc<dyn StatusSurface>, mirror: SharedStateMirror) -> Self {
        Self {
            surface,
            mirror,
            current: Arc::new(Mutex::new(None)),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<String>> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn current_handle(&self) -> Option<String> {
        self.slot().clone()
    }

    /// Re-attach to a surface that outlived the previous process. A saved
    /// handle whose surface is gone is discarded.
    pub fn restore(&self) -> Option<String> {
        let mut slot = self.slot();
        if slot.is_some() {
            return slot.clone();
        }

        let saved: Option<String> = match self.mirror.load(STATUS_SURFACE_KEY) {
            Ok(saved) => saved,
            Err(err) => {
                warn!("Failed to read saved status surface handle: {err:#}");
                return None;
            }
        };
        let handle = saved?;

        if self.surface.is_live(&handle) {
            info!("Restored live status surface {handle}");
            *slot = Some(handle);
        } else {
            info!("Saved status surface {handle} is gone; forgetting it");
            self.forget_saved_handle();
        }
        slot.clone()
    }

    pub fn session_started(&self, session: &Session, profile: &Profile) {
        self.restore();

        if let Some(handle) = self.current_handle() {
            if self.surface.is_live(&handle) {
                info!("Status surface already live; updating instead of starting another");
                self.publish(session, profile);
                return;
            }
            *self.slot() = None;
        }

        if !profile.live_status_enabled {
            info!("Live status disabled for profile {}", profile.name);
            return;
        }

        let attributes = StatusAttributes {
            profile_name: profile.name.clone(),
            message: FOCUS_MESSAGES
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or_default()
                .to_string(),
        };
        let content = StatusContent::project(session, profile);

        match self.surface.start(&attributes, &content) {
            Ok(handle) => {
                if let Err(err) = self.mirror.store(STATUS_SURFACE_KEY, &handle) {
                    warn!("Failed to save status surface handle: {err:#}");
                }
                info!("Started status surface {handle} for {}", profile.name);
                *self.slot() = Some(handle);
            }
            Err(err) => warn!("Failed to start status surface: {err:#}"),
        }
    }

    /// Push the current state of `session` to the live surface, if any.
    pub fn publish(&self, session: &Session, profile: &Profile) {
        let Some(handle) = self.current_handle() else {
            info!("No live status surface to update");
            return;
        };
        let content = StatusContent::project(session, profile);
        if let Err(err) = self.surface.update(&handle, &content) {
            warn!("Failed to update status surface {handle}: {err:#}");
        }
    }

    pub fn session_ended(&self, now: DateTime<Utc>) {
        if let Some(handle) = self.slot().take() {
            if let Err(err) = self.surface.end(&handle, &StatusContent::ended(now)) {
                warn!("Failed to end status surface {handle}: {err:#}");
            }
            info!("Ended status surface {handle}");
        }
        self.forget_saved_handle();
    }

    fn forget_saved_handle(&self) {
        if let Err(err) = self.mirror.remove(STATUS_SURFACE_KEY) {
            warn!("Failed to clear saved status surface handle: {err:#}");
        }
    }
}
