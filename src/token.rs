use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Refusal;

/// Identifiers read from one physical token scan. Some hardware reports
/// two identifiers (e.g. an encoded URL and the chip serial); either may
/// be the one a profile was bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedToken {
    primary: String,
    secondary: Option<String>,
}

impl ScannedToken {
    pub fn new(primary: impl AsRef<str>, secondary: Option<&str>) -> Self {
        let primary = primary.as_ref().trim().to_string();
        let secondary = secondary
            .map(str::trim)
            .filter(|value| !value.is_empty() && *value != primary)
            .map(str::to_string);
        Self { primary, secondary }
    }

    pub fn single(id: impl AsRef<str>) -> Self {
        Self::new(id, None)
    }

    pub fn id(&self) -> &str {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&str> {
        self.secondary.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    /// True when either reported identifier equals `expected`.
    pub fn matches(&self, expected: &str) -> bool {
        let expected = expected.trim();
        self.primary == expected || self.secondary.as_deref() == Some(expected)
    }
}

/// Network-backed check that a token is registered and active.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the validator could not be reached or answered
    /// with something unreadable. Callers treat that as "not valid".
    async fn verify(&self, token_id: &str) -> Result<bool>;
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    #[serde(rename = "tagId")]
    tag_id: &'a str,
}

#[derive(Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    valid: bool,
}

/// Validator backed by the account service's `POST /api/nfc/verify`.
pub struct HttpTokenValidator {
    client: reqwest::Client,
    verify_url: String,
}

impl HttpTokenValidator {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build token validator client")?;
        Ok(Self {
            client,
            verify_url: format!("{}/api/nfc/verify", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl TokenValidator for HttpTokenValidator {
    async fn verify(&self, token_id: &str) -> Result<bool> {
        let response = self
            .client
            .post(&self.verify_url)
            .json(&VerifyRequest { tag_id: token_id })
            .send()
            .await
            .context("token validator request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("token validator error ({status}): {body}");
        }

        let body: VerifyResponse = response
            .json()
            .await
            .context("token validator returned an unreadable body")?;
        Ok(body.success && body.valid)
    }
}

/// Validate a scan, failing closed: an empty scan, a negative answer, an
/// error or a timeout all refuse.
pub async fn verify_token(
    validator: &dyn TokenValidator,
    token: &ScannedToken,
    timeout: Duration,
) -> Result<(), Refusal> {
    if token.is_empty() {
        return Err(Refusal::empty_scan());
    }

    match tokio::time::timeout(timeout, validator.verify(token.id())).await {
        Ok(Ok(true)) => {
            info!("Token {} verified", token.id());
            Ok(())
        }
        Ok(Ok(false)) => {
            info!("Token {} rejected by validator", token.id());
            Err(Refusal::unregistered())
        }
        Ok(Err(err)) => {
            warn!("Token validation failed for {}: {err:#}", token.id());
            Err(Refusal::unavailable())
        }
        Err(_) => {
            warn!("Token validation timed out after {timeout:?} for {}", token.id());
            Err(Refusal::unavailable())
        }
    }
}
