use crate::dkim::SignatureReport;
use crate::store::StoreError;

/// Errors surfaced by the gatekeeper. Every variant maps onto an HTTP status
/// through [`GatekeeperError::status_code`]; callers never see internals for
/// configuration or storage failures.
#[derive(Debug, thiserror::Error)]
pub enum GatekeeperError {
    /// Malformed input. Safe to describe precisely.
    #[error("{0}")]
    Validation(String),
    /// Resource already claimed or lock contention.
    #[error("{message}")]
    Conflict { status: u16, message: String },
    #[error("{0}")]
    NotFound(String),
    /// Bad stored key material or missing settings.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// A DKIM upload that was evaluated and refused. Carries the
    /// per-signature evidence for caller-side diagnostics.
    #[error("{message}")]
    Rejected {
        message: String,
        evidence: Vec<SignatureReport>,
    },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatekeeperError {
    pub fn conflict(status: u16, message: impl Into<String>) -> Self {
        GatekeeperError::Conflict {
            status,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            GatekeeperError::Validation(_) => 400,
            GatekeeperError::Conflict { status, .. } => *status,
            GatekeeperError::NotFound(_) => 404,
            GatekeeperError::Configuration(_) => 502,
            GatekeeperError::Rejected { .. } => 403,
            GatekeeperError::Store(_) | GatekeeperError::Io(_) | GatekeeperError::Internal(_) => {
                500
            }
        }
    }

    /// Message that may be shown to the caller.
    pub fn public_message(&self) -> String {
        match self {
            GatekeeperError::Configuration(_)
            | GatekeeperError::Store(_)
            | GatekeeperError::Io(_)
            | GatekeeperError::Internal(_) => String::new(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatekeeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GatekeeperError::Validation("x".into()).status_code(), 400);
        assert_eq!(GatekeeperError::conflict(401, "x").status_code(), 401);
        assert_eq!(GatekeeperError::NotFound("x".into()).status_code(), 404);
        assert_eq!(GatekeeperError::Configuration("x".into()).status_code(), 502);
        assert_eq!(
            GatekeeperError::Rejected {
                message: "x".into(),
                evidence: vec![]
            }
            .status_code(),
            403
        );
    }

    #[test]
    fn test_internal_details_are_hidden() {
        let err = GatekeeperError::Configuration("bad pkcs8 blob".into());
        assert_eq!(err.public_message(), "");
        let err = GatekeeperError::Validation("Empty file received".into());
        assert_eq!(err.public_message(), "Empty file received");
    }
}
