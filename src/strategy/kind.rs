use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// The closed set of blocking strategies. Adding behaviour means adding a
/// variant here and handling it in every `match` the compiler points at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum StrategyKind {
    /// Start and stop by scanning the same token.
    TokenOnly,
    /// Pick a focus duration; the timer ends it, a token scan ends it early.
    TimerThenTokenStop,
    /// First scan pauses for a fixed duration, second scan ends the session.
    TokenPauseResume,
    /// Start and stop from the app, no token involved.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub uses_token: bool,
    pub has_timer: bool,
    pub has_pause: bool,
    pub has_manual: bool,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::TokenOnly,
        StrategyKind::TimerThenTokenStop,
        StrategyKind::TokenPauseResume,
        StrategyKind::Manual,
    ];

    /// Stable identifier stored in the database.
    pub fn id(&self) -> &'static str {
        match self {
            StrategyKind::TokenOnly => "TokenBlockingStrategy",
            StrategyKind::TimerThenTokenStop => "TokenTimerBlockingStrategy",
            StrategyKind::TokenPauseResume => "TokenPauseTimerBlockingStrategy",
            StrategyKind::Manual => "ManualBlockingStrategy",
        }
    }

    pub fn from_id(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.id() == value)
            .ok_or_else(|| anyhow!("unknown strategy id '{value}'"))
    }

    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::TokenOnly => "Device",
            StrategyKind::TimerThenTokenStop => "Focus Session",
            StrategyKind::TokenPauseResume => "Focus session with Break",
            StrategyKind::Manual => "Manual",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StrategyKind::TokenOnly => "Block and unblock profiles by using the exact same token",
            StrategyKind::TimerThenTokenStop => {
                "Set a focus duration, then scan the device to end early."
            }
            StrategyKind::TokenPauseResume => {
                "Set a break duration, scan once for break, and scan again to fully stop."
            }
            StrategyKind::Manual => "Start and stop blocking from the app",
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            StrategyKind::TokenOnly => Capabilities {
                uses_token: true,
                ..Capabilities::default()
            },
            StrategyKind::TimerThenTokenStop => Capabilities {
                uses_token: true,
                has_timer: true,
                ..Capabilities::default()
            },
            StrategyKind::TokenPauseResume => Capabilities {
                uses_token: true,
                has_timer: true,
                has_pause: true,
                ..Capabilities::default()
            },
            StrategyKind::Manual => Capabilities {
                has_manual: true,
                ..Capabilities::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_parse_back() {
        for kind in StrategyKind::ALL {
            assert_eq!(StrategyKind::from_id(kind.id()).unwrap(), kind);
        }
        assert!(StrategyKind::from_id("NFCBlockingStrategy").is_err());
    }

    #[test]
    fn only_pause_strategy_can_pause() {
        let pausing: Vec<_> = StrategyKind::ALL
            .into_iter()
            .filter(|kind| kind.capabilities().has_pause)
            .collect();
        assert_eq!(pausing, vec![StrategyKind::TokenPauseResume]);
        assert!(!StrategyKind::Manual.capabilities().uses_token);
    }
}
