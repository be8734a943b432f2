//! Framework-agnostic response values. The host maps an [`ApiResponse`] onto
//! its own HTTP response type.

use crate::error::GatekeeperError;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

fn status_code_name(status: u16) -> (&'static str, &'static str) {
    match status {
        200 => ("ok", "OK"),
        302 => ("found", "Found"),
        400 => ("bad-request", "Bad Request"),
        401 => ("not-authorised", "Not Authorised"),
        403 => ("forbidden", "Forbidden"),
        404 => ("not-found", "Not Found"),
        409 => ("conflict", "Conflict"),
        502 => ("bad-gateway", "Bad Gateway"),
        _ => ("internal-server-error", "Internal Server Error"),
    }
}

impl ApiResponse {
    pub fn ok<T: Serialize>(payload: &T) -> Self {
        let response = serde_json::to_value(payload).unwrap_or(Value::Null);
        Self::with_status(200, None, response)
    }

    /// Error body. `message` replaces the generic status text when present.
    pub fn error(status: u16, message: Option<&str>, response: Value) -> Self {
        Self::with_status(status, message, response)
    }

    /// Structured response for any gatekeeper error. Internal details are
    /// logged here and never returned.
    pub fn from_error(err: &GatekeeperError) -> Self {
        let status = err.status_code();
        match err {
            GatekeeperError::Configuration(detail) => {
                log::error!("Configuration error: {detail}");
                Self::error(status, None, json!({}))
            }
            GatekeeperError::Store(_) | GatekeeperError::Io(_) | GatekeeperError::Internal(_) => {
                log::error!("Request failed: {err:?}");
                Self::error(status, None, json!({}))
            }
            GatekeeperError::Rejected { message, evidence } => Self::error(
                status,
                Some(message),
                json!({ "toArray": evidence }),
            ),
            other => Self::error(status, Some(&other.public_message()), json!({})),
        }
    }

    /// 404 with no message, for secret mismatches.
    pub fn opaque_not_found() -> Self {
        Self::error(404, None, Value::Null)
    }

    fn with_status(status: u16, message: Option<&str>, response: Value) -> Self {
        let (code, default_message) = status_code_name(status);
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: json!({
                "status": {
                    "code": code,
                    "message": message.unwrap_or(default_message),
                },
                "response": response,
            }),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn message(&self) -> Option<&str> {
        self.body["status"]["message"].as_str()
    }
}

/// A redirect that works for both browser navigation and XHR clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub url: String,
}

impl Redirect {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Browser requests get a plain 302. API requests get a 200 carrying the
    /// target in `X-Redirect` and `{"external": url}`, since XHR layers
    /// follow 3xx transparently.
    pub fn into_response(self, is_api: bool) -> ApiResponse {
        if is_api {
            ApiResponse {
                status: 200,
                headers: vec![
                    ("X-Redirect".to_string(), self.url.clone()),
                    ("Content-Type".to_string(), "application/json".to_string()),
                ],
                body: json!({ "external": self.url }),
            }
        } else {
            ApiResponse {
                status: 302,
                headers: vec![("Location".to_string(), self.url)],
                body: Value::Null,
            }
        }
    }
}

/// Compare a path secret against the configured one. An empty configured
/// secret disables the endpoint.
pub fn secret_matches(configured: &str, provided: &str) -> bool {
    if configured.is_empty() {
        return false;
    }
    Sha256::digest(configured.as_bytes()) == Sha256::digest(provided.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_shape() {
        let response = ApiResponse::ok(&json!({ "email_used": "a@pku.edu.cn" }));
        assert_eq!(response.status, 200);
        assert_eq!(response.body["status"]["code"], "ok");
        assert_eq!(response.body["response"]["email_used"], "a@pku.edu.cn");
    }

    #[test]
    fn test_configuration_error_hides_detail() {
        let err = GatekeeperError::Configuration("pkcs8 parse error at byte 3".into());
        let response = ApiResponse::from_error(&err);
        assert_eq!(response.status, 502);
        assert_eq!(response.message(), Some("Bad Gateway"));
    }

    #[test]
    fn test_redirect_delivery() {
        let browser = Redirect::new("/captcha?returnTo=%2Frecent").into_response(false);
        assert_eq!(browser.status, 302);
        assert_eq!(browser.header("location"), Some("/captcha?returnTo=%2Frecent"));

        let api = Redirect::new("/captcha").into_response(true);
        assert_eq!(api.status, 200);
        assert_eq!(api.header("X-Redirect"), Some("/captcha"));
        assert_eq!(api.body["external"], "/captcha");
    }

    #[test]
    fn test_secret_matches() {
        assert!(secret_matches("s3cret", "s3cret"));
        assert!(!secret_matches("s3cret", "guess"));
        assert!(!secret_matches("", ""));
    }
}
