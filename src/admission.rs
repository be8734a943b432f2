//! Email send-request admission.
//!
//! Applicants who cannot produce a DKIM-signed message mail an encrypted
//! `username\npassword` envelope from their organisation address. The mail
//! ingestion side forwards the sender and the candidate fields here; a valid
//! envelope claims both the address and the credential pair.

use crate::api::{secret_matches, ApiResponse};
use crate::dkim::EMAIL_USED_KEY;
use crate::domain_utils::DomainUtils;
use crate::error::{GatekeeperError, Result};
use crate::lock::{release_logged, LockError, LockManager, LockNamespace};
use crate::registration::{RegReqClaim, REGREQ_KEY, REGREQ_TYPES_KEY};
use crate::store::RecordStore;
use crate::user_type::EmailClassifier;
use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;

pub const ENVELOPE_PREFIX: &str = "USeRnaMe\n";

lazy_static! {
    static ref SPF_ACCEPTED: Regex = Regex::new(r"(?i)^(pass|neutral|softfail)").unwrap();
}

fn decode_base64(text: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    general_purpose::STANDARD.decode(compact)
}

/// Private key for registration envelopes (RSA-OAEP, SHA-256).
pub struct RegistrationKey {
    key: RsaPrivateKey,
}

impl RegistrationKey {
    /// Accepts base64 of a PEM (PKCS#8 or PKCS#1) or DER (PKCS#8 or PKCS#1)
    /// private key. Any failure here is a server configuration problem.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        if encoded.trim().is_empty() {
            return Err(GatekeeperError::Configuration(
                "register_sk is not configured".to_string(),
            ));
        }
        let bytes = decode_base64(encoded).map_err(|e| {
            GatekeeperError::Configuration(format!("register_sk is not valid base64: {e}"))
        })?;
        let key = match std::str::from_utf8(&bytes) {
            Ok(pem) if pem.trim_start().starts_with("-----BEGIN") => {
                RsaPrivateKey::from_pkcs8_pem(pem).or_else(|pkcs8_err| {
                    RsaPrivateKey::from_pkcs1_pem(pem).map_err(|pkcs1_err| {
                        GatekeeperError::Configuration(format!(
                            "register_sk PEM is neither PKCS#8 ({pkcs8_err}) nor PKCS#1 ({pkcs1_err})"
                        ))
                    })
                })?
            }
            _ => RsaPrivateKey::from_pkcs8_der(&bytes).or_else(|pkcs8_err| {
                RsaPrivateKey::from_pkcs1_der(&bytes).map_err(|pkcs1_err| {
                    GatekeeperError::Configuration(format!(
                        "register_sk DER is neither PKCS#8 ({pkcs8_err}) nor PKCS#1 ({pkcs1_err})"
                    ))
                })
            })?,
        };
        Ok(Self { key })
    }

    pub fn public_key(&self) -> RsaPublicKey {
        RsaPublicKey::from(&self.key)
    }

    pub fn public_key_pem(&self) -> Result<String> {
        self.public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| GatekeeperError::Internal(format!("Cannot encode public key: {e}")))
    }

    /// Claim string of one field, or `None` when the field does not decrypt
    /// or lacks the prefix.
    pub fn open_envelope(&self, field: &str) -> Option<String> {
        let ciphertext = decode_base64(field).ok()?;
        let plaintext = match self.key.decrypt(Oaep::new::<Sha256>(), &ciphertext) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                log::debug!("Envelope did not decrypt: {e}");
                return None;
            }
        };
        let text = String::from_utf8(plaintext).ok()?;
        text.strip_prefix(ENVELOPE_PREFIX).map(str::to_string)
    }

    /// First candidate field that opens. None opening is a 403.
    pub fn decrypt_envelope<'a, I>(&self, fields: I) -> Result<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        fields
            .into_iter()
            .find_map(|field| self.open_envelope(field))
            .ok_or_else(|| GatekeeperError::conflict(403, "Invalid register request"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionReceipt {
    pub email_used: String,
}

/// Body of the direct send-request endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmailAddRequest {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub plain: String,
    #[serde(default)]
    pub subject: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PostmarkHeader {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Inbound webhook body in the Postmark format.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PostmarkInbound {
    #[serde(default)]
    pub headers: Option<Vec<PostmarkHeader>>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub text_body: Option<String>,
}

pub struct EmailAdmission {
    store: Arc<dyn RecordStore>,
    locks: Arc<dyn LockManager>,
    classifier: Arc<dyn EmailClassifier>,
    register_sk: String,
    register_token: String,
    register_email: String,
}

impl EmailAdmission {
    pub fn new(
        store: Arc<dyn RecordStore>,
        locks: Arc<dyn LockManager>,
        classifier: Arc<dyn EmailClassifier>,
        register_sk: impl Into<String>,
        register_token: impl Into<String>,
        register_email: impl Into<String>,
    ) -> Self {
        Self {
            store,
            locks,
            classifier,
            register_sk: register_sk.into(),
            register_token: register_token.into(),
            register_email: register_email.into(),
        }
    }

    /// Address applicants send their envelope to.
    pub fn register_email(&self) -> &str {
        &self.register_email
    }

    pub fn public_key_pem(&self) -> Result<String> {
        RegistrationKey::from_base64(&self.register_sk)?.public_key_pem()
    }

    fn decrypt_claim<'a, I>(&self, fields: I) -> Result<RegReqClaim>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let key = RegistrationKey::from_base64(&self.register_sk)?;
        let envelope = key.decrypt_envelope(fields)?;
        RegReqClaim::parse(&envelope)
            .ok_or_else(|| GatekeeperError::conflict(403, "Invalid register request"))
    }

    /// Claim `from` and the credential pair. Both locks are released on
    /// every path, regreq first.
    pub async fn admit(&self, from: &str, claim: &RegReqClaim) -> Result<AdmissionReceipt> {
        let from = DomainUtils::email_get_raw(from);
        let user_type = self.classifier.classify_user_type(&from).ok_or_else(|| {
            GatekeeperError::Validation(format!("Email {from} is not allowed to register"))
        })?;
        let member = claim.member();
        let email_used = || GatekeeperError::conflict(401, format!("Email Already used: {from}"));
        let already_submitted = || {
            GatekeeperError::conflict(
                400,
                format!("This register request: {claim} is already submitted"),
            )
        };

        if self.store.is_set_member(EMAIL_USED_KEY, &from).await? {
            return Err(email_used());
        }
        if self.store.is_set_member(REGREQ_KEY, &member).await? {
            return Err(already_submitted());
        }
        match self.locks.acquire(LockNamespace::Email, &from).await {
            Ok(()) => {}
            Err(LockError::AlreadyHeld { .. }) => return Err(email_used()),
            Err(LockError::Store(e)) => return Err(e.into()),
        }
        if let Err(e) = self.locks.acquire(LockNamespace::RegReq, &member).await {
            release_logged(self.locks.as_ref(), LockNamespace::Email, &from).await;
            return Err(match e {
                LockError::AlreadyHeld { .. } => already_submitted(),
                LockError::Store(e) => e.into(),
            });
        }

        let result = async {
            self.store.set_add(EMAIL_USED_KEY, &from).await?;
            self.store.set_add(REGREQ_KEY, &member).await?;
            self.store
                .sorted_set_add(REGREQ_TYPES_KEY, user_type.code, &member)
                .await?;
            Ok::<_, GatekeeperError>(())
        }
        .await;
        release_logged(self.locks.as_ref(), LockNamespace::RegReq, &member).await;
        release_logged(self.locks.as_ref(), LockNamespace::Email, &from).await;
        result?;

        log::info!(
            "Register request admitted for {from} ({}), user {}",
            user_type.name,
            claim.username
        );
        Ok(AdmissionReceipt { email_used: from })
    }

    /// Decrypt (plain body, then subject) and admit.
    pub async fn email_add(&self, request: &EmailAddRequest) -> Result<AdmissionReceipt> {
        let claim = self.decrypt_claim([request.plain.as_str(), request.subject.as_str()])?;
        self.admit(&request.from, &claim).await
    }

    pub async fn handle_email_add(&self, secret: &str, request: &EmailAddRequest) -> ApiResponse {
        if !secret_matches(&self.register_token, secret) {
            return ApiResponse::opaque_not_found();
        }
        match self.email_add(request).await {
            Ok(receipt) => ApiResponse::ok(&receipt),
            Err(e) => ApiResponse::from_error(&e),
        }
    }

    /// Webhook variant. The sender retries anything but 200, so the outcome
    /// travels in the body as `{status, msg, result}`.
    pub async fn email_postmark(&self, secret: &str, inbound: &PostmarkInbound) -> ApiResponse {
        if !secret_matches(&self.register_token, secret) {
            return ApiResponse::opaque_not_found();
        }
        let outcome = |status: u16, msg: &str| {
            ApiResponse::ok(&json!({ "status": status, "msg": msg }))
        };
        let (Some(headers), Some(from), Some(subject), Some(text_body)) = (
            inbound.headers.as_ref(),
            inbound.from.as_deref().filter(|s| !s.is_empty()),
            inbound.subject.as_deref().filter(|s| !s.is_empty()),
            inbound.text_body.as_deref().filter(|s| !s.is_empty()),
        ) else {
            return outcome(400, "Invalid Postmark Format");
        };
        let Some(spf) = headers.iter().find(|h| h.name == "Received-SPF") else {
            return outcome(400, "No SPF result");
        };
        if !SPF_ACCEPTED.is_match(&spf.value) {
            log::info!("Postmark request from {from} rejected, SPF: {}", spf.value);
            return outcome(400, "SPF failed");
        }
        let claim = match self.decrypt_claim([subject, text_body]) {
            Ok(claim) => claim,
            Err(GatekeeperError::Configuration(detail)) => {
                log::error!("Configuration error: {detail}");
                return outcome(500, "Cannot get register privatekey");
            }
            Err(_) => return outcome(400, "Cannot decrypt register request"),
        };
        match self.admit(from, &claim).await {
            Ok(receipt) => ApiResponse::ok(&json!({ "status": 200, "result": receipt })),
            Err(e) => {
                let status = e.status_code();
                if status >= 500 {
                    log::error!("Postmark admission failed: {e:?}");
                }
                outcome(status, &e.public_message())
            }
        }
    }
}
