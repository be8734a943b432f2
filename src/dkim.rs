//! DKIM registration pipeline.
//!
//! An applicant uploads an email the forum's registration address received
//! from them. When a passing DKIM signature covers the `To` header and the
//! recipient belongs to a registered organisation, the address is claimed and
//! a verification record keyed by a fresh uuid is stored. The record is later
//! consumed by the registration commit (see `registration`).

use crate::api::{secret_matches, ApiResponse, Redirect};
use crate::dkim_verification::{DkimResult, DkimVerifier, SignatureCheck};
use crate::domain_utils::DomainUtils;
use crate::error::{GatekeeperError, Result};
use crate::lock::{release_logged, LockError, LockManager, LockNamespace};
use crate::statistics::{DkimStatEvent, DkimStatistics};
use crate::store::{Object, RecordStore};
use crate::upload::{RawEmailArchive, UploadRequest};
use crate::user_type::EmailClassifier;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

pub const EMAIL_USED_KEY: &str = "pr:emailused";
pub const BAD_SIGNATURE_UUID: &str = "bad-dkim-signature";
const NO_TO_SIGNATURE_REASON: &str =
    "This email doesn't have DKIM 'To: ' signature. Please retry with another one.";

pub fn record_key(uuid: &str) -> String {
    format!("pr:dkim:uuid:{uuid}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DkimStatus {
    Pending,
    Success,
    Rejected,
    Done,
    Failed,
}

impl DkimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DkimStatus::Pending => "pending",
            DkimStatus::Success => "success",
            DkimStatus::Rejected => "rejected",
            DkimStatus::Done => "done",
            DkimStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DkimStatus::Pending),
            "success" => Some(DkimStatus::Success),
            "rejected" => Some(DkimStatus::Rejected),
            "done" => Some(DkimStatus::Done),
            "failed" => Some(DkimStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for DkimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evidence for one signature. An empty report (no `result`) stands for a
/// signature without a covered-header list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<DkimResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_domain: Option<String>,
    #[serde(default)]
    pub to: String,
}

impl SignatureReport {
    pub fn is_empty(&self) -> bool {
        self.result.is_none()
    }

    /// Carries a recipient usable for classification.
    pub fn has_recipient(&self) -> bool {
        !self.to.is_empty()
    }
}

/// Persisted verification record, `pr:dkim:uuid:<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkimRecord {
    pub status: DkimStatus,
    #[serde(default)]
    pub emailaddress: String,
    #[serde(rename = "toArray", default)]
    pub to_array: Vec<SignatureReport>,
    #[serde(default)]
    pub reason: String,
}

impl DkimRecord {
    pub fn to_object(&self) -> Result<Object> {
        match serde_json::to_value(self) {
            Ok(Value::Object(object)) => Ok(object),
            Ok(_) => Err(GatekeeperError::Internal(
                "DKIM record did not serialize to an object".to_string(),
            )),
            Err(e) => Err(GatekeeperError::Internal(e.to_string())),
        }
    }

    pub fn from_object(object: Object) -> Result<Self> {
        serde_json::from_value(Value::Object(object))
            .map_err(|e| GatekeeperError::Internal(format!("Malformed DKIM record: {e}")))
    }
}

pub async fn load_record(store: &dyn RecordStore, uuid: &str) -> Result<Option<DkimRecord>> {
    match store.get_object(&record_key(uuid)).await? {
        Some(object) => Ok(Some(DkimRecord::from_object(object)?)),
        None => Ok(None),
    }
}

/// Reduce the verifier's output to one report per signature. The recipient
/// comes from the first covered header named `To`; signatures that do not
/// cover it are still reported for the statistics.
pub fn extract_signature_reports(checks: &[SignatureCheck]) -> Vec<SignatureReport> {
    checks
        .iter()
        .map(|check| {
            let Some(signing) = &check.signing_headers else {
                return SignatureReport::default();
            };
            if signing.keys.is_empty() || signing.headers.is_empty() {
                return SignatureReport::default();
            }
            let to = signing
                .keys
                .iter()
                .zip(signing.headers.iter())
                .find(|(key, header)| key.starts_with("To") && header.starts_with("To: "))
                .map(|(_, header)| {
                    DomainUtils::string_remove_starts_with(header, "To: ").to_string()
                })
                .unwrap_or_default();
            SignatureReport {
                result: Some(check.result),
                comment: check.comment.clone(),
                signing_domain: Some(check.signing_domain.clone()),
                to,
            }
        })
        .collect()
}

/// Result of a successful upload evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimOutcome {
    pub uuid: String,
    pub status: DkimStatus,
    pub emailaddress: String,
    pub next: String,
}

/// What the status page shows for a uuid. Evidence is a private copy with
/// HTML-escaped recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DkimStatusView {
    pub uuid: String,
    pub status: Option<DkimStatus>,
    pub reason: String,
    #[serde(rename = "toArray")]
    pub to_array: Vec<SignatureReport>,
}

impl DkimStatusView {
    pub fn is_success(&self) -> bool {
        self.status == Some(DkimStatus::Success)
    }

    pub fn is_pending(&self) -> bool {
        self.status == Some(DkimStatus::Pending)
    }

    pub fn is_rejected(&self) -> bool {
        self.status == Some(DkimStatus::Rejected)
    }
}

/// Outcome of claiming an address in `pr:emailused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmailClaim {
    Claimed,
    AlreadyUsed,
}

/// Lock the address, check membership, add. The lock is released on every
/// path.
async fn claim_email(
    store: &dyn RecordStore,
    locks: &dyn LockManager,
    email: &str,
) -> Result<EmailClaim> {
    match locks.acquire(LockNamespace::Email, email).await {
        Ok(()) => {}
        Err(LockError::AlreadyHeld { .. }) => {
            return Err(GatekeeperError::conflict(
                500,
                format!("Conflicting register request for {email} found. Please try again."),
            ))
        }
        Err(LockError::Store(e)) => return Err(e.into()),
    }
    let claimed = async {
        if store.is_set_member(EMAIL_USED_KEY, email).await? {
            return Ok(EmailClaim::AlreadyUsed);
        }
        store.set_add(EMAIL_USED_KEY, email).await?;
        Ok::<_, GatekeeperError>(EmailClaim::Claimed)
    }
    .await;
    release_logged(locks, LockNamespace::Email, email).await;
    claimed
}

pub struct DkimPipeline {
    store: Arc<dyn RecordStore>,
    locks: Arc<dyn LockManager>,
    classifier: Arc<dyn EmailClassifier>,
    verifier: Arc<dyn DkimVerifier>,
    archive: RawEmailArchive,
    statistics: DkimStatistics,
    relative_path: String,
}

impl DkimPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        locks: Arc<dyn LockManager>,
        classifier: Arc<dyn EmailClassifier>,
        verifier: Arc<dyn DkimVerifier>,
        archive: RawEmailArchive,
        relative_path: impl Into<String>,
    ) -> Self {
        let statistics = DkimStatistics::new(store.clone());
        Self {
            store,
            locks,
            classifier,
            verifier,
            archive,
            statistics,
            relative_path: relative_path.into(),
        }
    }

    pub fn next_url(&self, uuid: &str) -> String {
        format!("{}/pr_dkim_register?&uuid={uuid}", self.relative_path)
    }

    /// Evaluate one raw email and persist the evidence.
    pub async fn verify(&self, raw_email: &[u8]) -> Result<DkimOutcome> {
        let checks = self.verifier.verify(raw_email).await?;
        let reports = extract_signature_reports(&checks);
        log::debug!("DKIM signature reports: {reports:?}");

        let mut status = DkimStatus::Failed;
        let mut emailaddress: Option<String> = None;
        let mut find_to_signature = false;
        let mut find_dkim_pass = false;
        let mut fail_reasons: Vec<String> = Vec::new();

        for report in &reports {
            if report.is_empty() || !report.has_recipient() {
                continue;
            }
            let signing_domain = report.signing_domain.as_deref().unwrap_or_default();
            let to = report.to.as_str();
            find_to_signature = true;
            if report.result != Some(DkimResult::Pass) {
                fail_reasons.push(format!(
                    "DKIM signature verify failed for signingDomain {signing_domain} and address {to}, reason: {}",
                    report.comment.as_deref().unwrap_or_default()
                ));
                continue;
            }
            find_dkim_pass = true;
            // Group delivery is not an address the applicant controls.
            if DomainUtils::count_at_symbols(to) != 1 {
                fail_reasons.push("group email not allowed".to_string());
                continue;
            }
            let domain = DomainUtils::email_get_domain(to);
            if self.classifier.classify_user_type(&domain).is_none() {
                fail_reasons.push(format!(
                    "At least one DKIM 'To: ' signature found, but its email domain: {domain} is not authorized to register"
                ));
                continue;
            }
            emailaddress = Some(DomainUtils::email_get_raw(to));
            if self.classifier.is_trusted_signer(signing_domain).await {
                status = DkimStatus::Success;
                break;
            }
            status = DkimStatus::Pending;
        }

        self.statistics
            .record_event(DkimStatEvent {
                reports: &reports,
                status,
                find_to_signature,
                find_dkim_pass,
            })
            .await;

        if !find_to_signature {
            status = DkimStatus::Failed;
            fail_reasons = vec![NO_TO_SIGNATURE_REASON.to_string()];
        } else if emailaddress.is_none() {
            status = DkimStatus::Failed;
        }
        let emailaddress = emailaddress.unwrap_or_default();

        match status {
            DkimStatus::Success => {
                if claim_email(self.store.as_ref(), self.locks.as_ref(), &emailaddress).await?
                    == EmailClaim::AlreadyUsed
                {
                    status = DkimStatus::Failed;
                    fail_reasons.push(format!(
                        "This email address is already used: {emailaddress}"
                    ));
                }
            }
            DkimStatus::Pending => {
                if self.store.is_set_member(EMAIL_USED_KEY, &emailaddress).await? {
                    status = DkimStatus::Failed;
                    fail_reasons.push(format!(
                        "This email address is already used: {emailaddress}"
                    ));
                }
            }
            _ => {}
        }

        // Only plausibly legitimate mail is kept.
        let uuid = if find_dkim_pass {
            let uuid = uuid::Uuid::new_v4().to_string();
            self.archive.save(&uuid, status.as_str(), raw_email).await?;
            uuid
        } else {
            BAD_SIGNATURE_UUID.to_string()
        };

        if status == DkimStatus::Failed {
            log::info!("DKIM request {uuid} failed: {}", fail_reasons.join("; "));
            return Err(GatekeeperError::Rejected {
                message: format!(
                    "Request UUID={uuid} failed, reason: {}",
                    fail_reasons.join("; ")
                ),
                evidence: reports,
            });
        }

        let record = DkimRecord {
            status,
            emailaddress: emailaddress.clone(),
            to_array: reports,
            reason: String::new(),
        };
        self.store
            .set_object(&record_key(&uuid), record.to_object()?)
            .await?;
        log::info!("DKIM request {uuid} for {emailaddress}: {status}");

        Ok(DkimOutcome {
            next: self.next_url(&uuid),
            uuid,
            status,
            emailaddress,
        })
    }

    /// Upload endpoint: validate the form, evaluate, answer with a redirect
    /// (no JavaScript) or `{next}`. The temp file is deleted on every path.
    pub async fn handle_upload(&self, request: UploadRequest) -> ApiResponse {
        let noscript = request.noscript;
        let upload = match request.into_single_file() {
            Ok(upload) => upload,
            Err(e) => return ApiResponse::from_error(&e),
        };
        let result = async {
            let raw_email = upload.read().await?;
            self.verify(&raw_email).await
        }
        .await;
        drop(upload);

        match result {
            Ok(outcome) if noscript => Redirect::new(outcome.next).into_response(false),
            Ok(outcome) => ApiResponse {
                status: 200,
                headers: vec![("Content-Type".to_string(), "application/json".to_string())],
                body: json!({ "next": outcome.next }),
            },
            Err(e) => ApiResponse::from_error(&e),
        }
    }

    /// Status page data. Unknown uuids produce an empty view.
    pub async fn status_view(&self, uuid: &str) -> Result<DkimStatusView> {
        let mut view = DkimStatusView {
            uuid: uuid.to_string(),
            status: None,
            reason: String::new(),
            to_array: Vec::new(),
        };
        if uuid.is_empty() {
            return Ok(view);
        }
        if let Some(record) = load_record(self.store.as_ref(), uuid).await? {
            view.status = Some(record.status);
            view.reason = record.reason;
            view.to_array = record.to_array;
        }
        for report in &mut view.to_array {
            report.to = DomainUtils::escape_html(&report.to);
        }
        Ok(view)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminDecision {
    Success,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkimStatusUpdate {
    pub status: AdminDecision,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Manual decisions on pending DKIM requests.
pub struct DkimAdmin {
    store: Arc<dyn RecordStore>,
    locks: Arc<dyn LockManager>,
    admin_token: String,
}

impl DkimAdmin {
    pub fn new(
        store: Arc<dyn RecordStore>,
        locks: Arc<dyn LockManager>,
        admin_token: impl Into<String>,
    ) -> Self {
        Self {
            store,
            locks,
            admin_token: admin_token.into(),
        }
    }

    pub async fn update_status(&self, uuid: &str, update: &DkimStatusUpdate) -> Result<DkimRecord> {
        let key = record_key(uuid);
        let mut record = load_record(self.store.as_ref(), uuid)
            .await?
            .ok_or_else(|| GatekeeperError::NotFound(format!("Cannot find UUID: {uuid}")))?;

        match (record.status, update.status) {
            (DkimStatus::Success, _) | (DkimStatus::Done, _) => {
                log::debug!("DKIM request {uuid} is already {}, nothing to do", record.status);
                Ok(record)
            }
            (DkimStatus::Rejected, AdminDecision::Success) => Err(GatekeeperError::conflict(
                409,
                format!("DKIM request {uuid} is already rejected"),
            )),
            (_, AdminDecision::Rejected) => {
                record.status = DkimStatus::Rejected;
                record.reason = update.reason.clone().unwrap_or_default();
                self.store.set_object(&key, record.to_object()?).await?;
                log::info!("DKIM request {uuid} rejected by admin: {}", record.reason);
                Ok(record)
            }
            (_, AdminDecision::Success) => {
                if record.emailaddress.is_empty() {
                    return Err(GatekeeperError::NotFound(format!(
                        "Cannot find emailaddress for UUID: {uuid}"
                    )));
                }
                let claim =
                    claim_email(self.store.as_ref(), self.locks.as_ref(), &record.emailaddress)
                        .await?;
                match claim {
                    EmailClaim::AlreadyUsed => {
                        record.status = DkimStatus::Rejected;
                        record.reason =
                            format!("This email address is already used: {}", record.emailaddress);
                        self.store.set_object(&key, record.to_object()?).await?;
                        log::info!("DKIM request {uuid} rejected: {}", record.reason);
                    }
                    EmailClaim::Claimed => {
                        record.status = DkimStatus::Success;
                        self.store
                            .set_object_field(&key, "status", json!(DkimStatus::Success.as_str()))
                            .await?;
                        log::info!("DKIM request {uuid} approved by admin");
                    }
                }
                Ok(record)
            }
        }
    }

    /// Admin endpoint keyed by a shared secret path segment.
    pub async fn handle_update(
        &self,
        secret: &str,
        uuid: &str,
        update: &DkimStatusUpdate,
    ) -> ApiResponse {
        if !secret_matches(&self.admin_token, secret) {
            return ApiResponse::opaque_not_found();
        }
        match self.update_status(uuid, update).await {
            Ok(record) => ApiResponse::ok(&record),
            Err(e) => ApiResponse::from_error(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dkim_verification::SigningHeaders;
    use crate::lock::StoreLockManager;
    use crate::store::MemoryStore;
    use crate::user_type::{DomainTrustClassifier, UserTypeTable};
    use crate::config::GatekeeperConfig;
    use async_trait::async_trait;
    use std::path::Path;

    struct FixedVerifier(Vec<SignatureCheck>);

    #[async_trait]
    impl DkimVerifier for FixedVerifier {
        async fn verify(&self, _raw_email: &[u8]) -> Result<Vec<SignatureCheck>> {
            Ok(self.0.clone())
        }
    }

    fn check(domain: &str, result: DkimResult, to: Option<&str>) -> SignatureCheck {
        let mut signing = SigningHeaders::default();
        signing.keys.push("From".into());
        signing.headers.push("From: someone".into());
        if let Some(to) = to {
            signing.keys.push("To".into());
            signing.headers.push(format!("To: {to}"));
        }
        SignatureCheck {
            signing_domain: domain.to_string(),
            result,
            comment: (result != DkimResult::Pass).then(|| "body hash did not verify".to_string()),
            signing_headers: Some(signing),
        }
    }

    struct Fixture {
        store: MemoryStore,
        pipeline: DkimPipeline,
        admin: DkimAdmin,
        _dir: tempfile::TempDir,
        archive_dir: std::path::PathBuf,
    }

    fn fixture(checks: Vec<SignatureCheck>) -> Fixture {
        let store = MemoryStore::new();
        let shared: Arc<dyn RecordStore> = Arc::new(store.clone());
        let locks: Arc<dyn LockManager> = Arc::new(StoreLockManager::new(shared.clone()));
        let config = GatekeeperConfig::default();
        let classifier = DomainTrustClassifier::new(
            UserTypeTable::new(&config.user_types),
            vec!["pku.edu.cn".to_string()],
        );
        let dir = tempfile::tempdir().unwrap();
        let archive_dir = dir.path().to_path_buf();
        let pipeline = DkimPipeline::new(
            shared.clone(),
            locks.clone(),
            Arc::new(classifier),
            Arc::new(FixedVerifier(checks)),
            RawEmailArchive::new(dir.path()),
            "/forum",
        );
        let admin = DkimAdmin::new(shared, locks, "admin-secret");
        Fixture {
            store,
            pipeline,
            admin,
            _dir: dir,
            archive_dir,
        }
    }

    fn archived(dir: &Path, status: &str, uuid: &str) -> bool {
        dir.join(status).join(uuid).exists()
    }

    #[test]
    fn test_extract_reports() {
        let mut no_headers = check("a.example", DkimResult::Pass, None);
        no_headers.signing_headers = None;
        let reports = extract_signature_reports(&[
            check("pku.edu.cn", DkimResult::Pass, Some("Alice <alice@pku.edu.cn>")),
            check("b.example", DkimResult::Fail, None),
            no_headers,
        ]);
        assert_eq!(reports[0].to, "Alice <alice@pku.edu.cn>");
        assert_eq!(reports[0].signing_domain.as_deref(), Some("pku.edu.cn"));
        assert!(!reports[1].is_empty());
        assert_eq!(reports[1].to, "");
        assert!(reports[2].is_empty());
    }

    #[tokio::test]
    async fn test_trusted_signer_succeeds_and_claims_email() {
        let f = fixture(vec![check(
            "pku.edu.cn",
            DkimResult::Pass,
            Some("Alice <alice@pku.edu.cn>"),
        )]);
        let outcome = f.pipeline.verify(b"raw message").await.unwrap();
        assert_eq!(outcome.status, DkimStatus::Success);
        assert_eq!(outcome.emailaddress, "alice@pku.edu.cn");
        assert_eq!(
            outcome.next,
            format!("/forum/pr_dkim_register?&uuid={}", outcome.uuid)
        );
        assert!(f
            .store
            .is_set_member(EMAIL_USED_KEY, "alice@pku.edu.cn")
            .await
            .unwrap());
        assert!(archived(&f.archive_dir, "success", &outcome.uuid));
        let record = load_record(&f.store, &outcome.uuid).await.unwrap().unwrap();
        assert_eq!(record.status, DkimStatus::Success);
        assert_eq!(record.to_array.len(), 1);
    }

    #[tokio::test]
    async fn test_untrusted_signer_is_pending() {
        let f = fixture(vec![check(
            "relay.example",
            DkimResult::Pass,
            Some("alice@pku.edu.cn"),
        )]);
        let outcome = f.pipeline.verify(b"raw").await.unwrap();
        assert_eq!(outcome.status, DkimStatus::Pending);
        assert!(!f
            .store
            .is_set_member(EMAIL_USED_KEY, "alice@pku.edu.cn")
            .await
            .unwrap());
        assert!(archived(&f.archive_dir, "pending", &outcome.uuid));
    }

    #[tokio::test]
    async fn test_later_trusted_signature_upgrades_pending() {
        let f = fixture(vec![
            check("relay.example", DkimResult::Pass, Some("alice@pku.edu.cn")),
            check("pku.edu.cn", DkimResult::Pass, Some("alice@pku.edu.cn")),
        ]);
        let outcome = f.pipeline.verify(b"raw").await.unwrap();
        assert_eq!(outcome.status, DkimStatus::Success);
    }

    #[tokio::test]
    async fn test_failed_signature_reports_domain() {
        let f = fixture(vec![check(
            "pku.edu.cn",
            DkimResult::Fail,
            Some("alice@pku.edu.cn"),
        )]);
        match f.pipeline.verify(b"raw").await {
            Err(GatekeeperError::Rejected { message, evidence }) => {
                assert!(message.contains("signingDomain pku.edu.cn"));
                assert!(message.starts_with("Request UUID=bad-dkim-signature failed"));
                assert_eq!(evidence.len(), 1);
            }
            other => panic!("Expected rejection, got {other:?}"),
        }
        assert!(!f.archive_dir.join("failed").exists());
    }

    #[tokio::test]
    async fn test_no_to_signature() {
        let f = fixture(vec![
            check("pku.edu.cn", DkimResult::Pass, None),
            check("other.example", DkimResult::Pass, None),
        ]);
        let err = f.pipeline.verify(b"raw").await.unwrap_err();
        assert!(err.to_string().ends_with(NO_TO_SIGNATURE_REASON));
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn test_group_and_unauthorized_domains() {
        let f = fixture(vec![
            check("pku.edu.cn", DkimResult::Pass, Some("a@pku.edu.cn, b@pku.edu.cn")),
            check("gmail.com", DkimResult::Pass, Some("c@gmail.com")),
        ]);
        let err = f.pipeline.verify(b"raw").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("group email not allowed"));
        assert!(message.contains("email domain: gmail.com is not authorized"));
        // A signature passed, so the raw email is kept under failed/.
        let uuid = message
            .trim_start_matches("Request UUID=")
            .split(' ')
            .next()
            .unwrap()
            .to_string();
        assert!(archived(&f.archive_dir, "failed", &uuid));
        assert!(load_record(&f.store, &uuid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_used_email_fails() {
        let f = fixture(vec![check(
            "pku.edu.cn",
            DkimResult::Pass,
            Some("alice@pku.edu.cn"),
        )]);
        f.store
            .set_add(EMAIL_USED_KEY, "alice@pku.edu.cn")
            .await
            .unwrap();
        let err = f.pipeline.verify(b"raw").await.unwrap_err();
        assert!(err
            .to_string()
            .contains("This email address is already used: alice@pku.edu.cn"));
    }

    #[tokio::test]
    async fn test_email_lock_contention_is_conflict() {
        let f = fixture(vec![check(
            "pku.edu.cn",
            DkimResult::Pass,
            Some("alice@pku.edu.cn"),
        )]);
        let locks = StoreLockManager::new(Arc::new(f.store.clone()));
        locks
            .acquire(LockNamespace::Email, "alice@pku.edu.cn")
            .await
            .unwrap();
        let err = f.pipeline.verify(b"raw").await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert!(err.to_string().starts_with("Conflicting register request"));
        assert!(f.store.set_members(EMAIL_USED_KEY).await.is_empty());
    }

    #[tokio::test]
    async fn test_admin_approves_pending_and_is_idempotent() {
        let f = fixture(vec![check(
            "relay.example",
            DkimResult::Pass,
            Some("alice@pku.edu.cn"),
        )]);
        let outcome = f.pipeline.verify(b"raw").await.unwrap();
        let update = DkimStatusUpdate {
            status: AdminDecision::Success,
            reason: None,
        };
        let first = f.admin.update_status(&outcome.uuid, &update).await.unwrap();
        assert_eq!(first.status, DkimStatus::Success);
        assert!(f
            .store
            .is_set_member(EMAIL_USED_KEY, "alice@pku.edu.cn")
            .await
            .unwrap());
        let second = f.admin.update_status(&outcome.uuid, &update).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_admin_approval_of_used_email_rejects() {
        let f = fixture(vec![check(
            "relay.example",
            DkimResult::Pass,
            Some("alice@pku.edu.cn"),
        )]);
        let outcome = f.pipeline.verify(b"raw").await.unwrap();
        f.store
            .set_add(EMAIL_USED_KEY, "alice@pku.edu.cn")
            .await
            .unwrap();
        let record = f
            .admin
            .update_status(
                &outcome.uuid,
                &DkimStatusUpdate {
                    status: AdminDecision::Success,
                    reason: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(record.status, DkimStatus::Rejected);
        assert!(record.reason.contains("already used"));

        let again = f
            .admin
            .update_status(
                &outcome.uuid,
                &DkimStatusUpdate {
                    status: AdminDecision::Success,
                    reason: None,
                },
            )
            .await;
        assert_eq!(again.unwrap_err().status_code(), 409);
    }

    #[tokio::test]
    async fn test_admin_endpoint_guards() {
        let f = fixture(vec![]);
        let update = DkimStatusUpdate {
            status: AdminDecision::Rejected,
            reason: Some("spam".into()),
        };
        assert_eq!(
            f.admin.handle_update("wrong", "u", &update).await.status,
            404
        );
        let response = f.admin.handle_update("admin-secret", "missing", &update).await;
        assert_eq!(response.status, 404);
        assert_eq!(response.message(), Some("Cannot find UUID: missing"));
    }

    #[tokio::test]
    async fn test_status_view_escapes_and_copies() {
        let f = fixture(vec![check(
            "relay.example",
            DkimResult::Pass,
            Some("Alice <alice@pku.edu.cn>"),
        )]);
        let outcome = f.pipeline.verify(b"raw").await.unwrap();
        let view = f.pipeline.status_view(&outcome.uuid).await.unwrap();
        assert!(view.is_pending());
        assert_eq!(view.to_array[0].to, "Alice &lt;alice@pku.edu.cn&gt;");
        let record = load_record(&f.store, &outcome.uuid).await.unwrap().unwrap();
        assert_eq!(record.to_array[0].to, "Alice <alice@pku.edu.cn>");

        let unknown = f.pipeline.status_view("nope").await.unwrap();
        assert!(unknown.status.is_none());
    }

    #[tokio::test]
    async fn test_handle_upload_responses() {
        let f = fixture(vec![check(
            "pku.edu.cn",
            DkimResult::Pass,
            Some("alice@pku.edu.cn"),
        )]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.eml");
        std::fs::write(&path, b"raw").unwrap();
        let response = f
            .pipeline
            .handle_upload(UploadRequest {
                content_type: "multipart/form-data; boundary=b".into(),
                files: vec![crate::upload::UploadedFile {
                    path: path.clone(),
                    size: 3,
                }],
                noscript: true,
            })
            .await;
        assert_eq!(response.status, 302);
        assert!(response
            .header("Location")
            .unwrap()
            .starts_with("/forum/pr_dkim_register?&uuid="));
        assert!(!path.exists());

        // Same address again: rejected with evidence, temp file still removed.
        std::fs::write(&path, b"raw").unwrap();
        let response = f
            .pipeline
            .handle_upload(UploadRequest {
                content_type: "multipart/form-data".into(),
                files: vec![crate::upload::UploadedFile {
                    path: path.clone(),
                    size: 3,
                }],
                noscript: false,
            })
            .await;
        assert_eq!(response.status, 403);
        assert_eq!(response.body["response"]["toArray"][0]["signingDomain"], "pku.edu.cn");
        assert!(!path.exists());
    }
}
