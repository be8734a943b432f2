//! Advisory locks over the shared store.
//!
//! A lock is a counter field in the `pr:locks` object. Acquiring increments
//! it; the caller holds the lock only when the increment returned exactly
//! `1`. Every increment is paired with one decrement (release for the holder,
//! roll back for a contender) and the field is pruned once it drops to zero,
//! so the counter never goes negative. There is no owner token and no
//! expiry: a holder that crashes between acquire and release leaks the lock
//! until an operator deletes the field.
//!
//! Callers taking more than one lock acquire them in the order
//! `Email`, `RegReq`, `DkimUuid` and release everything they hold before
//! returning an error.

use crate::store::{RecordStore, StoreError};
use async_trait::async_trait;
use std::sync::Arc;

pub const LOCKS_KEY: &str = "pr:locks";
const PREFIX_MAX_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockNamespace {
    Email,
    RegReq,
    DkimUuid,
}

impl LockNamespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            LockNamespace::Email => "email:",
            LockNamespace::RegReq => "regreq:",
            LockNamespace::DkimUuid => "uuid:",
        }
    }

    /// Fixed-width field name: the prefix left-padded with `0` to 15 chars,
    /// followed by the locked value.
    pub fn field_for(&self, value: &str) -> String {
        format!("{:0>width$}{value}", self.prefix(), width = PREFIX_MAX_LEN)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock {namespace:?} for {value} is already held")]
    AlreadyHeld {
        namespace: LockNamespace,
        value: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire(&self, namespace: LockNamespace, value: &str) -> Result<(), LockError>;
    async fn release(&self, namespace: LockNamespace, value: &str) -> Result<(), StoreError>;
}

pub struct StoreLockManager {
    store: Arc<dyn RecordStore>,
}

impl StoreLockManager {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LockManager for StoreLockManager {
    async fn acquire(&self, namespace: LockNamespace, value: &str) -> Result<(), LockError> {
        let field = namespace.field_for(value);
        let count = self
            .store
            .increment_object_field_by(LOCKS_KEY, &field, 1)
            .await?;
        if count != 1 {
            log::warn!("Lock contention on {field} (count {count})");
            // Roll back our own increment only; the holder keeps its mark.
            // A failure here is the same leak an abandoned holder causes.
            if let Err(e) = self
                .store
                .decrement_object_field_and_prune(LOCKS_KEY, &field)
                .await
            {
                log::error!("Failed to roll back lock {field}: {e}");
            }
            return Err(LockError::AlreadyHeld {
                namespace,
                value: value.to_string(),
            });
        }
        log::debug!("Acquired lock {field}");
        Ok(())
    }

    async fn release(&self, namespace: LockNamespace, value: &str) -> Result<(), StoreError> {
        let field = namespace.field_for(value);
        log::debug!("Releasing lock {field}");
        self.store
            .decrement_object_field_and_prune(LOCKS_KEY, &field)
            .await
            .map(|_| ())
    }
}

/// Release a lock on an exit path where the release outcome cannot change
/// the response any more.
pub async fn release_logged(locks: &dyn LockManager, namespace: LockNamespace, value: &str) {
    if let Err(e) = locks.release(namespace, value).await {
        log::error!("Failed to release lock {namespace:?} for {value}: {e}");
    }
}
