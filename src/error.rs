//! Error types for the CA control plane

use thiserror::Error;

use crate::pki::external::ExternalCaError;
use crate::pki::PkiError;
use crate::store::StoreError;

/// Main error type for CA server operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// PKI error
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// Store transaction error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// External signer error
    #[error("external CA error: {0}")]
    ExternalCa(#[from] ExternalCaError),

    /// Filesystem error (e.g. persisting the trust root)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input or cluster state
    #[error("validation error: {0}")]
    Validation(String),

    /// `run` was called while the server is already running
    #[error("CA server is already running")]
    AlreadyRunning,

    /// The store has no cluster object to serve from
    #[error("cluster not found in store")]
    ClusterNotFound,
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
