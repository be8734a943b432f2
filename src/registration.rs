//! Registration request state machine.
//!
//! Three admission paths share one shape: `check` on every registration
//! step, `commit` once on the final confirmation step, `abort` when the
//! applicant cancels after committing. Path precedence is invite, then DKIM
//! uuid, then the raw email/password claim.

use crate::api::{secret_matches, ApiResponse};
use crate::dkim::{record_key, DkimStatus};
use crate::error::{GatekeeperError, Result};
use crate::lock::{release_logged, LockError, LockManager, LockNamespace};
use crate::store::{Object, RecordStore};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

pub const REGREQ_KEY: &str = "pr:regreq";
pub const REGREQ_DONE_KEY: &str = "pr:regreq_done";
pub const REGREQ_TYPES_KEY: &str = "pr:regreq:types";
pub const COMMIT_ROUTE: &str = "/register/complete";

pub fn invite_key(code: &str) -> String {
    format!("pr:invite:{code}")
}

/// Form posts carry `noscript` as the string `"true"`.
fn bool_or_string<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::String(s) => s == "true",
        _ => false,
    })
}

/// Registration data the host keeps in the session between steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationPayload {
    #[serde(default, deserialize_with = "bool_or_string")]
    pub noscript: bool,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub invite: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(rename = "pr_interstitial_done", default)]
    pub interstitial_done: bool,
}

impl RegistrationPayload {
    pub fn claim(&self) -> RegistrationClaim {
        let present = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_string);
        if let Some(code) = present(&self.invite) {
            RegistrationClaim::Invite(code)
        } else if let Some(uuid) = present(&self.uuid) {
            RegistrationClaim::Dkim(uuid)
        } else {
            RegistrationClaim::RawEmail(RegReqClaim::new(&self.username, &self.password))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationClaim {
    Invite(String),
    Dkim(String),
    RawEmail(RegReqClaim),
}

/// Credentials an applicant mailed in ahead of registering. Stored as a JSON
/// array so that no username or password can collide with another pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegReqClaim {
    pub username: String,
    pub password: String,
}

impl RegReqClaim {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    /// Decrypted envelope body: `username`, newline, `password`. The password
    /// may itself contain newlines.
    pub fn parse(envelope: &str) -> Option<Self> {
        let (username, password) = envelope.split_once('\n')?;
        if username.is_empty() {
            return None;
        }
        Some(Self::new(username, password))
    }

    /// Set member under `pr:regreq` / `pr:regreq_done`, also the lock value.
    pub fn member(&self) -> String {
        json!([self.username, self.password]).to_string()
    }
}

impl fmt::Display for RegReqClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Passwords never reach logs or responses.
        write!(f, "{} (password withheld)", self.username)
    }
}

fn field_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `check` / `commit` / `abort` over the shared store.
pub struct RegistrationFlow {
    store: Arc<dyn RecordStore>,
    locks: Arc<dyn LockManager>,
}

impl RegistrationFlow {
    pub fn new(store: Arc<dyn RecordStore>, locks: Arc<dyn LockManager>) -> Self {
        Self { store, locks }
    }

    /// Only an anonymous `POST` to the confirmation route commits.
    pub fn is_commit_step(method: &str, route_path: &str, uid: u64) -> bool {
        method.eq_ignore_ascii_case("POST") && uid == 0 && route_path == COMMIT_ROUTE
    }

    pub async fn check(&self, payload: &RegistrationPayload) -> Result<()> {
        match payload.claim() {
            RegistrationClaim::Invite(code) => {
                let invite = self
                    .store
                    .get_object(&invite_key(&code))
                    .await?
                    .ok_or_else(|| GatekeeperError::Validation("Invalid invite code".to_string()))?;
                let count = invite.get("count").and_then(field_as_i64).unwrap_or(0);
                if count <= 0 {
                    return Err(GatekeeperError::Validation(
                        "This invite code has been used up".to_string(),
                    ));
                }
            }
            RegistrationClaim::Dkim(uuid) => {
                let status = self
                    .store
                    .get_object_field(&record_key(&uuid), "status")
                    .await?
                    .and_then(|s| s.as_str().and_then(DkimStatus::parse));
                match status {
                    None => {
                        return Err(GatekeeperError::Validation(
                            "Invalid register UUID".to_string(),
                        ))
                    }
                    Some(DkimStatus::Success) => {}
                    Some(DkimStatus::Pending) => {
                        return Err(GatekeeperError::Validation(
                            "Your DKIM register request is waiting for admin approval. Please try again later".to_string(),
                        ))
                    }
                    Some(DkimStatus::Done) => {
                        return Err(GatekeeperError::Validation(
                            "Your DKIM register request has already been completed.".to_string(),
                        ))
                    }
                    Some(DkimStatus::Rejected) => {
                        let reason = self
                            .store
                            .get_object_field(&record_key(&uuid), "reason")
                            .await?
                            .and_then(|r| r.as_str().map(str::to_string))
                            .unwrap_or_default();
                        return Err(GatekeeperError::Validation(format!(
                            "Your DKIM register request is rejected, reason: {reason}"
                        )));
                    }
                    Some(DkimStatus::Failed) => {
                        return Err(GatekeeperError::Internal(format!(
                            "DKIM record {uuid} persisted with status failed"
                        )))
                    }
                }
            }
            RegistrationClaim::RawEmail(claim) => {
                if payload.noscript {
                    return Err(GatekeeperError::Validation(
                        "Registeration requires JavaScript.".to_string(),
                    ));
                }
                let member = claim.member();
                if !self.store.is_set_member(REGREQ_KEY, &member).await? {
                    return Err(GatekeeperError::Validation(
                        "The Server has not received your register request.".to_string(),
                    ));
                }
                if self.store.is_set_member(REGREQ_DONE_KEY, &member).await? {
                    return Err(GatekeeperError::Validation(
                        "This register request has already been completed.".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Make the claim irreversible. A payload already marked committed is
    /// left alone, so a repeated confirmation post cannot consume twice.
    pub async fn commit(&self, payload: &mut RegistrationPayload) -> Result<()> {
        if payload.interstitial_done {
            log::debug!("Registration already committed for this flow");
            return Ok(());
        }
        match payload.claim() {
            RegistrationClaim::Invite(code) => self.commit_invite(&code).await?,
            RegistrationClaim::Dkim(uuid) => self.commit_dkim(&uuid).await?,
            RegistrationClaim::RawEmail(claim) => self.commit_regreq(&claim).await?,
        }
        payload.interstitial_done = true;
        Ok(())
    }

    async fn commit_invite(&self, code: &str) -> Result<()> {
        let key = invite_key(code);
        if self.store.get_object(&key).await?.is_none() {
            return Err(GatekeeperError::Validation("Invalid invite code".to_string()));
        }
        // Invites are shared by many applicants, so no lock: the decrement
        // itself is the exclusion.
        let count = self.store.increment_object_field_by(&key, "count", -1).await?;
        if count < 0 {
            self.store.increment_object_field_by(&key, "count", 1).await?;
            return Err(GatekeeperError::conflict(
                409,
                "This invite code has been used up",
            ));
        }
        log::info!("Invite {code} consumed, {count} left");
        Ok(())
    }

    async fn commit_dkim(&self, uuid: &str) -> Result<()> {
        match self.locks.acquire(LockNamespace::DkimUuid, uuid).await {
            Ok(()) => {}
            Err(LockError::AlreadyHeld { .. }) => {
                return Err(GatekeeperError::conflict(409, format!("Cannot lock uuid {uuid}.")))
            }
            Err(LockError::Store(e)) => return Err(e.into()),
        }
        let result = async {
            let key = record_key(uuid);
            let status = self.store.get_object_field(&key, "status").await?;
            let status = status.as_ref().and_then(Value::as_str);
            if status != Some(DkimStatus::Success.as_str()) {
                return Err(GatekeeperError::conflict(
                    409,
                    format!(
                        "Your DKIM register request has invalid status: {}.",
                        status.unwrap_or("none")
                    ),
                ));
            }
            self.store
                .set_object_field(&key, "status", json!(DkimStatus::Done.as_str()))
                .await?;
            log::info!("DKIM request {uuid} committed");
            Ok(())
        }
        .await;
        release_logged(self.locks.as_ref(), LockNamespace::DkimUuid, uuid).await;
        result
    }

    async fn commit_regreq(&self, claim: &RegReqClaim) -> Result<()> {
        let member = claim.member();
        match self.locks.acquire(LockNamespace::RegReq, &member).await {
            Ok(()) => {}
            Err(LockError::AlreadyHeld { .. }) => {
                return Err(GatekeeperError::conflict(
                    409,
                    format!("Cannot lock register request of {}.", claim.username),
                ))
            }
            Err(LockError::Store(e)) => return Err(e.into()),
        }
        let result = async {
            if self.store.is_set_member(REGREQ_DONE_KEY, &member).await? {
                return Err(GatekeeperError::conflict(
                    409,
                    "This register request has already been completed.",
                ));
            }
            self.store.set_add(REGREQ_DONE_KEY, &member).await?;
            log::info!("Register request of {} committed", claim.username);
            Ok(())
        }
        .await;
        release_logged(self.locks.as_ref(), LockNamespace::RegReq, &member).await;
        result
    }

    /// Undo a commit when the applicant cancels. Nothing can be reported to
    /// the caller here, so failures are only logged.
    pub async fn abort(&self, payload: Option<&RegistrationPayload>) {
        let Some(payload) = payload else {
            log::warn!("Registration abort without session payload");
            return;
        };
        if !payload.interstitial_done {
            return;
        }
        let result = match payload.claim() {
            RegistrationClaim::Invite(code) => self
                .store
                .increment_object_field_by(&invite_key(&code), "count", 1)
                .await
                .map(|_| ()),
            RegistrationClaim::Dkim(uuid) => {
                self.store
                    .set_object_field(
                        &record_key(&uuid),
                        "status",
                        json!(DkimStatus::Success.as_str()),
                    )
                    .await
            }
            RegistrationClaim::RawEmail(claim) => {
                self.store
                    .set_remove(REGREQ_DONE_KEY, &claim.member())
                    .await
            }
        };
        match result {
            Ok(()) => log::info!("Registration aborted, claim released"),
            Err(e) => log::error!("Failed to release claim on registration abort: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteSpec {
    pub invite: String,
    pub count: i64,
    #[serde(rename = "type", default)]
    pub user_type: Option<i64>,
}

/// Issues invite codes.
pub struct InviteAdmin {
    store: Arc<dyn RecordStore>,
    admin_token: String,
}

impl InviteAdmin {
    pub fn new(store: Arc<dyn RecordStore>, admin_token: impl Into<String>) -> Self {
        Self {
            store,
            admin_token: admin_token.into(),
        }
    }

    pub async fn set_invite(&self, spec: &InviteSpec) -> Result<InviteSpec> {
        if spec.invite.trim().is_empty() {
            return Err(GatekeeperError::Validation("Invite code is empty".to_string()));
        }
        let mut object = Object::new();
        object.insert("invite".to_string(), json!(spec.invite));
        object.insert("count".to_string(), json!(spec.count));
        if let Some(user_type) = spec.user_type {
            object.insert("type".to_string(), json!(user_type));
        }
        self.store.set_object(&invite_key(&spec.invite), object).await?;
        log::info!("Invite {} set to count {}", spec.invite, spec.count);
        Ok(spec.clone())
    }

    pub async fn handle_set_invite(&self, secret: &str, spec: &InviteSpec) -> ApiResponse {
        if !secret_matches(&self.admin_token, secret) {
            return ApiResponse::opaque_not_found();
        }
        match self.set_invite(spec).await {
            Ok(spec) => ApiResponse::ok(&spec),
            Err(e) => ApiResponse::from_error(&e),
        }
    }
}
