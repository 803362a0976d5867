//! User-facing refusals and start errors.
//!
//! A [`Refusal`] is an expected outcome of a start/stop request: the
//! session is left exactly as it was and the message is shown to the user.
//! Plumbing failures (database, shared area) travel as `anyhow::Error`.

use thiserror::Error;

pub const UNREGISTERED_TOKEN_MESSAGE: &str =
    "Unregistered device detected. Please switch to a registered device.";
pub const VALIDATION_UNAVAILABLE_MESSAGE: &str =
    "Could not verify this device right now. Blocking stays on; try again.";
pub const EMPTY_SCAN_MESSAGE: &str = "No device identifier was read. Please scan again.";
pub const REQUIRED_TOKEN_MESSAGE: &str =
    "This device is not allowed to unblock this profile. Physical unblock setting is on for this profile";
pub const ORIGINAL_TOKEN_MESSAGE: &str = "You must scan the original device to stop focus";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Refusal {
    /// The validator did not confirm the token: unknown, unreachable or too slow.
    #[error("{0}")]
    ValidationFailure(String),
    /// The token is genuine but not the one this session or profile demands.
    #[error("{0}")]
    AuthorizationMismatch(String),
}

impl Refusal {
    pub fn unregistered() -> Self {
        Self::ValidationFailure(UNREGISTERED_TOKEN_MESSAGE.into())
    }

    pub fn unavailable() -> Self {
        Self::ValidationFailure(VALIDATION_UNAVAILABLE_MESSAGE.into())
    }

    pub fn empty_scan() -> Self {
        Self::ValidationFailure(EMPTY_SCAN_MESSAGE.into())
    }

    pub fn required_token() -> Self {
        Self::AuthorizationMismatch(REQUIRED_TOKEN_MESSAGE.into())
    }

    pub fn original_token() -> Self {
        Self::AuthorizationMismatch(ORIGINAL_TOKEN_MESSAGE.into())
    }

    pub fn message(&self) -> &str {
        match self {
            Refusal::ValidationFailure(message) | Refusal::AuthorizationMismatch(message) => {
                message
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("a focus session is already active ({session_id})")]
    SessionAlreadyActive { session_id: String },
    #[error("profile {0} not found")]
    ProfileNotFound(String),
    #[error("{strategy} expects {expected}")]
    UnexpectedInput {
        strategy: &'static str,
        expected: &'static str,
    },
}
