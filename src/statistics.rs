use crate::dkim::{DkimStatus, SignatureReport};
use crate::store::RecordStore;
use std::sync::Arc;

pub const SIGNING_DOMAIN_ALL_KEY: &str = "pr:dkim:stat:signingdomainAll";

pub fn signing_domain_key(domain: &str) -> String {
    format!("pr:dkim:stat:signingdomain:{domain}")
}

/// One evaluated upload, as seen by the statistics.
#[derive(Debug, Clone)]
pub struct DkimStatEvent<'a> {
    pub reports: &'a [SignatureReport],
    pub status: DkimStatus,
    pub find_to_signature: bool,
    pub find_dkim_pass: bool,
}

/// Per signing-domain counters. Recording is a side effect of verification
/// and never changes its outcome.
pub struct DkimStatistics {
    store: Arc<dyn RecordStore>,
}

impl DkimStatistics {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Field increments for one event, grouped by signing-domain key.
    pub fn counters(event: &DkimStatEvent<'_>) -> Vec<(String, Vec<(String, i64)>)> {
        let reports: Vec<&SignatureReport> =
            event.reports.iter().filter(|r| !r.is_empty()).collect();
        let mut signers: Vec<&str> = reports
            .iter()
            .map(|r| r.signing_domain.as_deref().unwrap_or_default())
            .collect();
        signers.sort_unstable();
        // Dots are not allowed in object field names.
        let signers = signers.join("--").replace('.', "_-");

        reports
            .iter()
            .map(|report| {
                let domain = report.signing_domain.as_deref().unwrap_or_default();
                let mut fields = vec![("count".to_string(), 1)];
                if let Some(result) = report.result {
                    fields.push((format!("dkim_result--{result}"), 1));
                }
                fields.push((event.status.as_str().to_string(), 1));
                if let Some(comment) = report.comment.as_deref().filter(|c| !c.is_empty()) {
                    fields.push((format!("comment--{comment}"), 1));
                }
                fields.push((format!("signer--{signers}"), 1));
                fields.push((
                    "find_to_signature".to_string(),
                    i64::from(event.find_to_signature),
                ));
                fields.push(("find_dkim_pass".to_string(), i64::from(event.find_dkim_pass)));
                (signing_domain_key(domain), fields)
            })
            .collect()
    }

    pub async fn record_event(&self, event: DkimStatEvent<'_>) {
        let domains: Vec<String> = event
            .reports
            .iter()
            .filter(|r| !r.is_empty())
            .filter_map(|r| r.signing_domain.clone())
            .collect();
        let counters = Self::counters(&event);
        if let Err(e) = self
            .store
            .set_add_many(SIGNING_DOMAIN_ALL_KEY, &domains)
            .await
        {
            log::warn!("Failed to record DKIM signing domains: {e}");
        }
        if let Err(e) = self.store.increment_object_fields_bulk(counters).await {
            log::warn!("Failed to record DKIM statistics: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dkim_verification::DkimResult;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn report(domain: &str, result: DkimResult, comment: Option<&str>) -> SignatureReport {
        SignatureReport {
            result: Some(result),
            comment: comment.map(str::to_string),
            signing_domain: Some(domain.to_string()),
            to: String::new(),
        }
    }

    #[tokio::test]
    async fn test_record_event_counts_by_domain() {
        let store = MemoryStore::new();
        let stats = DkimStatistics::new(Arc::new(store.clone()));
        let reports = vec![
            report("pku.edu.cn", DkimResult::Pass, None),
            SignatureReport::default(),
            report("relay.example", DkimResult::Fail, Some("bad sig")),
        ];
        stats
            .record_event(DkimStatEvent {
                reports: &reports,
                status: DkimStatus::Pending,
                find_to_signature: true,
                find_dkim_pass: false,
            })
            .await;

        let pku = store
            .get_object(&signing_domain_key("pku.edu.cn"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pku["count"], json!(1));
        assert_eq!(pku["dkim_result--pass"], json!(1));
        assert_eq!(pku["pending"], json!(1));
        assert_eq!(pku["signer--pku_-edu_-cn--relay_-example"], json!(1));
        assert_eq!(pku["find_to_signature"], json!(1));
        assert_eq!(pku["find_dkim_pass"], json!(0));

        let relay = store
            .get_object(&signing_domain_key("relay.example"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relay["comment--bad sig"], json!(1));
        assert_eq!(
            store.set_members(SIGNING_DOMAIN_ALL_KEY).await,
            vec!["pku.edu.cn", "relay.example"]
        );
    }
}
