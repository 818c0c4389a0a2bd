//! Crate error types.

use thiserror::Error;

use crate::backend::BackendError;
use crate::catalog::CatalogError;
use crate::store::StoreError;

/// Errors surfaced by the router and DHCP reconciliation operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Required settings are missing or contradict each other.
    #[error("configuration error: {0}")]
    Config(String),

    /// The request cannot be satisfied as given; never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A record the operation depends on does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend: {0}")]
    Backend(#[from] BackendError),

    #[error("mapping store: {0}")]
    Store(#[from] StoreError),

    #[error("catalog: {0}")]
    Catalog(#[from] CatalogError),
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, Error>;
