use crate::abuse_gate::{AbuseGate, GateSession};
use crate::api::Redirect;
use crate::config::CaptchaConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CaptchaError {
    #[error("No response for captcha")]
    MissingToken,
    #[error("Captcha verification request failed: {0}")]
    Network(String),
    #[error("Captcha verification returned an unreadable answer: {0}")]
    InvalidResponse(String),
    #[error("Captcha verification failed")]
    Rejected { error_codes: Vec<String> },
}

/// Third-party challenge verification.
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<(), CaptchaError>;
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    success: bool,
    #[serde(rename = "error-codes", default)]
    error_codes: Vec<String>,
}

pub struct HCaptchaClient {
    client: Client,
    secret_key: String,
    verify_url: String,
}

impl HCaptchaClient {
    pub fn new(config: &CaptchaConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("pr-gatekeeper/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            secret_key: config.secret_key.clone(),
            verify_url: config.verify_url.clone(),
        })
    }
}

#[async_trait]
impl CaptchaVerifier for HCaptchaClient {
    async fn verify(&self, token: &str) -> Result<(), CaptchaError> {
        if token.is_empty() {
            return Err(CaptchaError::MissingToken);
        }
        let response = self
            .client
            .post(&self.verify_url)
            .json(&json!({ "secret": self.secret_key, "response": token }))
            .send()
            .await
            .map_err(|e| CaptchaError::Network(e.to_string()))?;
        let answer: VerifyResponse = response
            .json()
            .await
            .map_err(|e| CaptchaError::InvalidResponse(e.to_string()))?;
        if !answer.success {
            log::info!("Captcha rejected: {:?}", answer.error_codes);
            return Err(CaptchaError::Rejected {
                error_codes: answer.error_codes,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptchaSubmission {
    Solved(Redirect),
    /// Render the challenge again with this data.
    Redisplay(Value),
}

/// The challenge page: `GET` renders, `POST` verifies and seeds the score.
pub struct CaptchaPage {
    site_key: String,
    verifier: Arc<dyn CaptchaVerifier>,
    gate: AbuseGate,
}

impl CaptchaPage {
    pub fn new(site_key: impl Into<String>, verifier: Arc<dyn CaptchaVerifier>, gate: AbuseGate) -> Self {
        Self {
            site_key: site_key.into(),
            verifier,
            gate,
        }
    }

    pub fn render_data(&self, error: Option<&str>) -> Value {
        let mut data = json!({ "sitekey": self.site_key });
        if let Some(error) = error {
            data["error"] = json!(error);
        }
        data
    }

    pub async fn submit(
        &self,
        session: &mut GateSession,
        token: &str,
        return_to: Option<&str>,
        now: u64,
    ) -> CaptchaSubmission {
        match self.verifier.verify(token).await {
            Ok(()) => CaptchaSubmission::Solved(self.gate.solve(session, return_to, now)),
            Err(e) => {
                log::debug!("Captcha not solved: {e}");
                CaptchaSubmission::Redisplay(self.render_data(Some(&e.to_string())))
            }
        }
    }
}
