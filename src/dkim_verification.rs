use crate::error::{GatekeeperError, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref DKIM_RESULT: Regex = Regex::new(r"(?i)\bdkim\s*=\s*([a-z]+)").unwrap();
    static ref HEADER_D: Regex = Regex::new(r"(?i)\bheader\.d\s*=\s*([^\s;()]+)").unwrap();
    static ref HEADER_B: Regex = Regex::new(r"(?i)\bheader\.b\s*=\s*([^\s;()]+)").unwrap();
    static ref COMMENT: Regex = Regex::new(r"\(([^)]*)\)").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DkimResult {
    Pass,
    Fail,
    Neutral,
    Policy,
    TempError,
    PermError,
    None,
}

impl DkimResult {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "pass" => DkimResult::Pass,
            "fail" => DkimResult::Fail,
            "policy" => DkimResult::Policy,
            "temperror" => DkimResult::TempError,
            "permerror" => DkimResult::PermError,
            "none" => DkimResult::None,
            _ => DkimResult::Neutral,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DkimResult::Pass => "pass",
            DkimResult::Fail => "fail",
            DkimResult::Neutral => "neutral",
            DkimResult::Policy => "policy",
            DkimResult::TempError => "temperror",
            DkimResult::PermError => "permerror",
            DkimResult::None => "none",
        }
    }
}

impl fmt::Display for DkimResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Headers covered by one signature: `keys[i]` is the header name and
/// `headers[i]` the raw `Name: value` line it was computed over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigningHeaders {
    pub keys: Vec<String>,
    pub headers: Vec<String>,
}

/// One verified signature as reported by the verification capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureCheck {
    pub signing_domain: String,
    pub result: DkimResult,
    pub comment: Option<String>,
    pub signing_headers: Option<SigningHeaders>,
}

/// The external DKIM capability: one entry per detected signature.
#[async_trait]
pub trait DkimVerifier: Send + Sync {
    async fn verify(&self, raw_email: &[u8]) -> Result<Vec<SignatureCheck>>;
}

/// Verifier that relies on the receiving MTA's `Authentication-Results`
/// instead of doing the cryptography itself. Covered headers are rebuilt from
/// each `DKIM-Signature`'s `h=` tag.
///
/// Only use it on messages whose `Authentication-Results` were written by an
/// MTA you operate.
pub struct HeaderDkimVerifier;

#[derive(Debug, Clone)]
struct AuthResultEntry {
    result: DkimResult,
    domain: Option<String>,
    b_prefix: Option<String>,
    comment: Option<String>,
}

impl HeaderDkimVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Split the header block into unfolded `(name, raw line)` pairs.
    pub fn parse_headers(raw_email: &[u8]) -> Vec<(String, String)> {
        let text = String::from_utf8_lossy(raw_email);
        let mut headers: Vec<(String, String)> = Vec::new();
        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                break;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some((_, raw)) = headers.last_mut() {
                    raw.push(' ');
                    raw.push_str(line.trim_start());
                }
                continue;
            }
            if let Some(colon) = line.find(':') {
                headers.push((line[..colon].trim().to_string(), line.to_string()));
            }
        }
        headers
    }

    /// Tag list of a `DKIM-Signature` value, e.g. `d=` and `h=`.
    fn signature_tag<'a>(value: &'a str, tag: &str) -> Option<&'a str> {
        value.split(';').find_map(|part| {
            let (name, tag_value) = part.split_once('=')?;
            (name.trim().eq_ignore_ascii_case(tag)).then(|| tag_value.trim())
        })
    }

    fn header_value(raw_line: &str) -> &str {
        raw_line.split_once(':').map(|(_, v)| v.trim()).unwrap_or("")
    }

    /// Covered headers selected bottom-up, each instance used at most once.
    fn covered_headers(headers: &[(String, String)], h_tag: &str) -> SigningHeaders {
        let mut used = vec![false; headers.len()];
        let mut signing = SigningHeaders::default();
        for name in h_tag.split(':').map(str::trim).filter(|n| !n.is_empty()) {
            let found = headers
                .iter()
                .enumerate()
                .rev()
                .find(|(i, (header_name, _))| !used[*i] && header_name.eq_ignore_ascii_case(name));
            if let Some((i, (header_name, raw))) = found {
                used[i] = true;
                signing.keys.push(header_name.clone());
                signing.headers.push(raw.clone());
            }
        }
        signing
    }

    fn auth_results(headers: &[(String, String)]) -> Vec<AuthResultEntry> {
        let mut entries = Vec::new();
        for (name, raw) in headers {
            if !name.eq_ignore_ascii_case("authentication-results") {
                continue;
            }
            for part in Self::header_value(raw).split(';') {
                let Some(result) = DKIM_RESULT.captures(part) else {
                    continue;
                };
                entries.push(AuthResultEntry {
                    result: DkimResult::parse(&result[1]),
                    domain: HEADER_D.captures(part).map(|c| c[1].to_lowercase()),
                    b_prefix: HEADER_B.captures(part).map(|c| c[1].to_string()),
                    comment: COMMENT
                        .captures(part)
                        .map(|c| c[1].trim().to_string())
                        .filter(|c| !c.is_empty()),
                });
            }
        }
        entries
    }
}

impl Default for HeaderDkimVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DkimVerifier for HeaderDkimVerifier {
    async fn verify(&self, raw_email: &[u8]) -> Result<Vec<SignatureCheck>> {
        let headers = Self::parse_headers(raw_email);
        if headers.is_empty() {
            return Err(GatekeeperError::Validation(
                "No message headers found".to_string(),
            ));
        }
        let auth_results = Self::auth_results(&headers);
        let mut used_results = vec![false; auth_results.len()];
        let mut checks = Vec::new();

        for (name, raw) in &headers {
            if !name.eq_ignore_ascii_case("dkim-signature") {
                continue;
            }
            let value = Self::header_value(raw);
            let signing_domain = Self::signature_tag(value, "d")
                .unwrap_or_default()
                .to_lowercase();
            let b_value: String = Self::signature_tag(value, "b")
                .unwrap_or_default()
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            let signing_headers = Self::signature_tag(value, "h")
                .map(|h_tag| Self::covered_headers(&headers, h_tag));

            let matched = auth_results.iter().enumerate().find(|(i, entry)| {
                !used_results[*i]
                    && entry.domain.as_deref() == Some(signing_domain.as_str())
                    && entry
                        .b_prefix
                        .as_deref()
                        .map_or(true, |prefix| b_value.starts_with(prefix))
            });
            let (result, comment) = match matched {
                Some((i, entry)) => {
                    used_results[i] = true;
                    (entry.result, entry.comment.clone())
                }
                None => (
                    DkimResult::Neutral,
                    Some("no authentication result for signature".to_string()),
                ),
            };
            log::debug!("DKIM signature d={signing_domain}: {result}");
            checks.push(SignatureCheck {
                signing_domain,
                result,
                comment,
                signing_headers,
            });
        }
        Ok(checks)
    }
}
