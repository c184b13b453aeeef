//! Store-level error type.

use thiserror::Error;

/// Errors raised by the data model and by [`EntitySet`](crate::EntitySet)
/// backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A url, hash, id or name did not resolve to a registered def.
    #[error("component def not found: {0}")]
    DefNotFound(String),

    #[error("invalid component def: {0}")]
    InvalidDef(String),

    #[error("invalid component: {0}")]
    InvalidComponent(String),

    #[error("invalid component id: {0}")]
    InvalidComponentId(String),

    /// The argument is not a recognised entity.
    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    #[error("failed to encode component def: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Opaque failure reported by a storage backend. Passed through untouched.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
