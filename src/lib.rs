pub mod abuse_gate;
pub mod admission;
pub mod api;
pub mod captcha;
pub mod config;
pub mod dkim;
pub mod dkim_verification;
pub mod dnswl;
pub mod domain_utils;
pub mod error;
pub mod lock;
pub mod registration;
pub mod statistics;
pub mod store;
pub mod upload;
pub mod user_type;

pub use abuse_gate::{AbuseGate, GateDecision, GateSession};
pub use admission::{EmailAdmission, RegistrationKey};
pub use api::{ApiResponse, Redirect};
pub use config::GatekeeperConfig;
pub use dkim::{DkimAdmin, DkimPipeline, DkimStatus};
pub use error::{GatekeeperError, Result};
pub use lock::{LockManager, StoreLockManager};
pub use registration::{InviteAdmin, RegistrationFlow, RegistrationPayload};
pub use store::{MemoryStore, RecordStore};
pub use user_type::{DomainTrustClassifier, EmailClassifier};
