//! Process-local security configuration
//!
//! [`SecurityConfig`] holds the currently-active [`RootCa`] and
//! [`ExternalCa`] behind an atomically swappable handle. Readers take an
//! immutable snapshot, do their work against it, and drop it; writers build
//! a complete replacement and swap it in, then notify subscribers. Nothing
//! ever mutates a published snapshot.

use std::sync::Arc;

use tokio::sync::{watch, RwLock};

use crate::pki::external::ExternalCa;
use crate::pki::RootCa;

/// An immutable snapshot of the active signing configuration.
#[derive(Clone)]
pub struct SecurityState {
    /// The active root CA: trust bundle and (optionally) local signer.
    pub root_ca: RootCa,
    /// External signers for the active signing root.
    pub external_ca: ExternalCa,
}

/// Holder of the active [`SecurityState`], swappable without disturbing
/// in-flight readers.
pub struct SecurityConfig {
    /// The cluster organization; every certificate issued in this cluster
    /// carries it, and it never changes for the lifetime of the process.
    organization: String,
    state: RwLock<Arc<SecurityState>>,
    /// Bumped on every swap so subscribers can re-read.
    generation: watch::Sender<u64>,
}

impl SecurityConfig {
    /// Create a configuration serving the given material for a cluster.
    pub fn new(organization: impl Into<String>, root_ca: RootCa, external_ca: ExternalCa) -> Self {
        let (generation, _) = watch::channel(0);
        SecurityConfig {
            organization: organization.into(),
            state: RwLock::new(Arc::new(SecurityState {
                root_ca,
                external_ca,
            })),
            generation,
        }
    }

    /// The cluster organization.
    pub fn organization(&self) -> &str {
        &self.organization
    }

    /// Take a snapshot of the active configuration.
    pub async fn snapshot(&self) -> Arc<SecurityState> {
        self.state.read().await.clone()
    }

    /// Atomically replace the active configuration and notify subscribers.
    pub async fn swap(&self, root_ca: RootCa, external_ca: ExternalCa) {
        {
            let mut guard = self.state.write().await;
            *guard = Arc::new(SecurityState {
                root_ca,
                external_ca,
            });
        }
        self.generation.send_modify(|g| *g += 1);
    }

    /// Subscribe to configuration swaps. The receiver yields whenever a new
    /// snapshot has been published; take a fresh [`SecurityConfig::snapshot`]
    /// on each notification.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}
