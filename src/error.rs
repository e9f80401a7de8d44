//! # Errors
//!
//! Typed failures surfaced by the reconciliation core. Validation failures are
//! raised before any store access; store failures are never recovered inside
//! the engine and always leave the store as it was before the call.

use crate::model::ContactId;
use thiserror::Error;

/// Rejection of an inbound observation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Neither an email nor a phone number was supplied.
    #[error("email or phoneNumber required")]
    MissingIdentifier,
}

/// Failure of the underlying record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(#[from] rocksdb::Error),
    #[error("contact encoding failure: {0}")]
    Codec(#[from] bincode::Error),
    /// Persisted data violates a cluster invariant or the storage layout.
    #[error("corrupt contact data: {0}")]
    Corrupt(String),
    #[error("unknown contact {0}")]
    UnknownContact(ContactId),
    /// Concurrent bridges kept widening the lock scope.
    #[error("lock scope did not settle after {attempts} attempts")]
    ScopeUnstable { attempts: usize },
    #[error("injected store failure: {0}")]
    Injected(String),
}

/// Error returned by [`crate::Unicontact::identify`].
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type StoreResult<T> = Result<T, StoreError>;
