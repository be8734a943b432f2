//! Anti-abuse score gate for anonymous traffic.
//!
//! Each guest session carries a score that recovers over time and is charged
//! per request according to [`path_score`]. A session that cannot afford a
//! request is sent to the captcha challenge; solving it seeds the score.

use crate::api::{ApiResponse, Redirect};
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

pub const INIT_SCORE: f64 = 500.0;
pub const MAX_SCORE: f64 = 2000.0;
/// Full recovery from `INIT_SCORE` to `MAX_SCORE` takes 24 hours.
pub const RECOVERY_RATE: f64 = (MAX_SCORE - INIT_SCORE) / 86400.0;

pub const CAPTCHA_ROUTE: &str = "/captcha";
const ASSET_PREFIXES: &[&str] = &[
    "/assets/",
    "/plugins/",
    "/uploads/",
    "/favicon.ico",
    "/manifest.webmanifest",
    "/apple-touch-icon",
];

/// Cost of one request. Unlisted routes are free.
pub fn path_score(method: &str, path: &str) -> f64 {
    match (method.to_ascii_uppercase().as_str(), path) {
        ("POST", "/login") => 500.0,
        ("GET", "/login") => 1.0,
        ("POST", "/api/v3/topics") => 100.0,
        _ => 0.0,
    }
}

/// Gate state kept in the host's session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateSession {
    #[serde(default)]
    pub captcha: bool,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(rename = "lastUpdateSecond", default)]
    pub last_update_second: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: String,
    /// Original URL including the mount prefix and query string.
    pub url: String,
    pub authenticated: bool,
    pub is_spider: bool,
    /// XHR / API client: redirects are delivered out of band.
    pub is_api: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Request was charged (or was free) and may proceed.
    Allow,
    /// Asset or challenge page, never scored.
    Bypass,
    /// Send the client to the challenge. The host destroys and recreates
    /// the session first when `regenerate_session` is set.
    Challenge {
        redirect: Redirect,
        regenerate_session: bool,
    },
}

impl GateDecision {
    /// Response to send instead of handling the request, if any.
    pub fn into_response(self, request: &RequestInfo) -> Option<ApiResponse> {
        match self {
            GateDecision::Challenge { redirect, .. } => Some(redirect.into_response(request.is_api)),
            GateDecision::Allow | GateDecision::Bypass => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AbuseGate {
    relative_path: String,
}

impl AbuseGate {
    pub fn new(relative_path: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn captcha_path(&self) -> String {
        format!("{}{CAPTCHA_ROUTE}", self.relative_path)
    }

    pub fn home_path(&self) -> String {
        format!("{}/", self.relative_path)
    }

    /// Route path without mount prefix and query.
    pub fn route_path<'a>(&self, url: &'a str) -> &'a str {
        let path = url.split(['?', '#']).next().unwrap_or_default();
        let path = path.strip_prefix(self.relative_path.as_str()).unwrap_or(path);
        if path.is_empty() {
            "/"
        } else {
            path
        }
    }

    fn is_bypassed(path: &str) -> bool {
        path == CAPTCHA_ROUTE || ASSET_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
    }

    /// Challenge URL carrying the original destination as `returnTo`.
    pub fn challenge_url(&self, original_url: &str) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("returnTo", original_url)
            .finish();
        format!("{}?{query}", self.captcha_path())
    }

    pub fn check(&self, request: &RequestInfo, session: &mut GateSession, now: u64) -> GateDecision {
        if request.authenticated || request.is_spider || session.captcha {
            return GateDecision::Allow;
        }
        let path = self.route_path(&request.url);
        if Self::is_bypassed(path) {
            return GateDecision::Bypass;
        }
        let cost = path_score(&request.method, path);
        let challenge = |regenerate_session: bool| GateDecision::Challenge {
            redirect: Redirect::new(self.challenge_url(&request.url)),
            regenerate_session,
        };

        let Some(score) = session.score else {
            // Free browsing does not create gate state.
            if cost > 0.0 {
                log::debug!("Uninitialised session requested {path}, challenging");
                return challenge(false);
            }
            return GateDecision::Allow;
        };
        if score < 0.0 {
            log::info!("Session with negative score {score} requested {path}, regenerating");
            return challenge(true);
        }

        let elapsed = now.saturating_sub(session.last_update_second.unwrap_or(now));
        let recovered = (score + elapsed as f64 * RECOVERY_RATE).min(MAX_SCORE);
        session.last_update_second = Some(now);
        if recovered - cost < 0.0 {
            // Not charged: the challenge is the price.
            session.score = Some(recovered);
            log::debug!("Score {recovered:.1} cannot cover {path} ({cost}), challenging");
            return challenge(false);
        }
        session.score = Some(recovered - cost);
        GateDecision::Allow
    }

    /// Only same-site relative paths are followed after solving.
    pub fn sanitize_return_to(&self, return_to: Option<&str>) -> String {
        match return_to {
            Some(url)
                if url.starts_with('/')
                    && !url.starts_with("//")
                    && !url.contains('\\')
                    && self.route_path(url) != CAPTCHA_ROUTE =>
            {
                url.to_string()
            }
            _ => self.home_path(),
        }
    }

    /// `returnTo` out of the challenge page's query string.
    pub fn return_to_from_query(query: &str) -> Option<String> {
        form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
            .find(|(key, _)| key == "returnTo")
            .map(|(_, value)| value.into_owned())
    }

    /// Seed the score after a solved challenge.
    pub fn solve(&self, session: &mut GateSession, return_to: Option<&str>, now: u64) -> Redirect {
        session.score = Some(INIT_SCORE);
        session.last_update_second = Some(now);
        Redirect::new(self.sanitize_return_to(return_to))
    }

    /// A session that just logged out belongs to a human.
    pub fn logged_out(&self, session: &mut GateSession) {
        session.captcha = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, url: &str) -> RequestInfo {
        RequestInfo {
            method: method.to_string(),
            url: url.to_string(),
            authenticated: false,
            is_spider: false,
            is_api: false,
        }
    }

    fn seeded(now: u64) -> GateSession {
        let mut session = GateSession::default();
        AbuseGate::new("").solve(&mut session, None, now);
        session
    }

    #[test]
    fn test_path_score_table() {
        assert_eq!(path_score("POST", "/login"), 500.0);
        assert_eq!(path_score("get", "/login"), 1.0);
        assert_eq!(path_score("POST", "/api/v3/topics"), 100.0);
        assert_eq!(path_score("GET", "/recent"), 0.0);
    }

    #[test]
    fn test_recovery_after_idle() {
        let gate = AbuseGate::new("");
        for idle in [0u64, 60, 3600, 86400, 200_000] {
            let mut session = seeded(1000);
            assert_eq!(
                gate.check(&request("GET", "/recent"), &mut session, 1000 + idle),
                GateDecision::Allow
            );
            let expected = (INIT_SCORE + idle as f64 * RECOVERY_RATE).min(MAX_SCORE);
            assert!((session.score.unwrap() - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_login_drains_then_challenges() {
        let gate = AbuseGate::new("/forum");
        let mut session = seeded(50);
        assert_eq!(
            gate.check(&request("POST", "/forum/login"), &mut session, 50),
            GateDecision::Allow
        );
        assert_eq!(session.score, Some(0.0));

        // Free requests still pass at zero.
        assert_eq!(
            gate.check(&request("GET", "/forum/recent"), &mut session, 50),
            GateDecision::Allow
        );
        match gate.check(&request("POST", "/forum/login"), &mut session, 50) {
            GateDecision::Challenge {
                redirect,
                regenerate_session,
            } => {
                assert!(!regenerate_session);
                assert_eq!(redirect.url, "/forum/captcha?returnTo=%2Fforum%2Flogin");
            }
            other => panic!("Expected challenge, got {other:?}"),
        }
        assert_eq!(session.score, Some(0.0));

        // Enough idle time to afford the login again.
        let idle = (500.0 / RECOVERY_RATE).ceil() as u64;
        assert_eq!(
            gate.check(&request("POST", "/forum/login"), &mut session, 50 + idle),
            GateDecision::Allow
        );
    }

    #[test]
    fn test_uninitialised_session() {
        let gate = AbuseGate::new("");
        let mut session = GateSession::default();
        assert_eq!(
            gate.check(&request("GET", "/topic/1"), &mut session, 1),
            GateDecision::Allow
        );
        assert_eq!(session, GateSession::default());
        assert!(matches!(
            gate.check(&request("GET", "/login?local=1"), &mut session, 1),
            GateDecision::Challenge { regenerate_session: false, .. }
        ));
    }

    #[test]
    fn test_negative_score_regenerates() {
        let gate = AbuseGate::new("");
        let mut session = GateSession {
            captcha: false,
            score: Some(-1.0),
            last_update_second: Some(0),
        };
        assert!(matches!(
            gate.check(&request("GET", "/recent"), &mut session, 10),
            GateDecision::Challenge { regenerate_session: true, .. }
        ));
    }

    #[test]
    fn test_challenge_delivery_for_api_clients() {
        let gate = AbuseGate::new("");
        let mut api = request("POST", "/login");
        api.is_api = true;
        let response = gate
            .check(&api, &mut GateSession::default(), 0)
            .into_response(&api)
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("X-Redirect"), Some("/captcha?returnTo=%2Flogin"));
        assert!(GateDecision::Allow.into_response(&api).is_none());
    }

    #[test]
    fn test_bypass_and_exempt_requests() {
        let gate = AbuseGate::new("/forum");
        let mut session = GateSession::default();
        assert_eq!(
            gate.check(&request("GET", "/forum/assets/client.js"), &mut session, 0),
            GateDecision::Bypass
        );
        assert_eq!(
            gate.check(&request("POST", "/forum/captcha"), &mut session, 0),
            GateDecision::Bypass
        );
        let mut authed = request("POST", "/forum/login");
        authed.authenticated = true;
        assert_eq!(gate.check(&authed, &mut session, 0), GateDecision::Allow);

        gate.logged_out(&mut session);
        assert_eq!(
            gate.check(&request("POST", "/forum/login"), &mut session, 0),
            GateDecision::Allow
        );
    }

    #[test]
    fn test_return_to_is_sanitized() {
        let gate = AbuseGate::new("/forum");
        assert_eq!(gate.sanitize_return_to(Some("/forum/recent")), "/forum/recent");
        assert_eq!(gate.sanitize_return_to(Some("//evil.example/")), "/forum/");
        assert_eq!(gate.sanitize_return_to(Some("https://evil.example/")), "/forum/");
        assert_eq!(gate.sanitize_return_to(Some("/forum/captcha")), "/forum/");
        assert_eq!(gate.sanitize_return_to(None), "/forum/");
        assert_eq!(
            AbuseGate::return_to_from_query("?returnTo=%2Fforum%2Flogin&x=1").as_deref(),
            Some("/forum/login")
        );
    }
}
