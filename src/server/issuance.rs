//! Signing worker pool and node reconciliation
//!
//! The pool consumes accepted nodes whose certificate is waiting to be
//! signed (`Pending`, `Renew`, or `Rotate` with a CSR present) and produces
//! issued certificates. Work arrives from two directions: store events
//! observed by the server's event loop, and a periodic rescan that
//! re-queues nodes a transient signer failure left behind.
//!
//! `Rotate` is treated like `Renew` once a CSR is there to sign. A node in
//! `Rotate` with no CSR is left alone (the agent owns submitting one), and
//! a stored CSR that was already fulfilled under the active signing root is
//! not re-signed, so flipping an issued node to `Rotate` changes nothing
//! about its certificate until a fresh CSR arrives or the signing root
//! moves.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::model::{IssuanceState, IssuanceStatus, Membership, Node};
use crate::pki;
use crate::pki::external::PreparedCsr;
use crate::security::SecurityConfig;
use crate::store::{MemoryStore, NodeFilter};

/// Number of signing jobs processed concurrently.
pub const SIGNING_WORKERS: usize = 4;

/// Bounded-concurrency signing pool, deduplicating jobs by node ID.
pub struct SigningPool {
    store: MemoryStore,
    security: Arc<SecurityConfig>,
    queue_tx: mpsc::UnboundedSender<String>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    /// Node IDs currently being processed; concurrent events for the same
    /// node collapse into one job.
    in_flight: DashMap<String, ()>,
    workers: Arc<Semaphore>,
}

impl SigningPool {
    /// Create a pool over the store, signing with whatever the security
    /// configuration holds at the time each job runs.
    pub fn new(store: MemoryStore, security: Arc<SecurityConfig>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        SigningPool {
            store,
            security,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            in_flight: DashMap::new(),
            workers: Arc::new(Semaphore::new(SIGNING_WORKERS)),
        }
    }

    /// Whether the node is waiting for this pool: an accepted member in a
    /// non-terminal issuance state with a CSR to sign.
    fn wants_signing(node: &Node) -> bool {
        node.spec.membership == Membership::Accepted
            && matches!(
                node.certificate.status.state,
                IssuanceState::Pending | IssuanceState::Renew | IssuanceState::Rotate
            )
            && !node.certificate.csr.is_empty()
    }

    /// Queue the node if it is waiting to be signed.
    pub fn enqueue_if_eligible(&self, node: &Node) {
        if Self::wants_signing(node) {
            // Receiver gone means the pool is shut down; drop the job.
            let _ = self.queue_tx.send(node.id.clone());
        }
    }

    /// Re-queue every eligible node from a store snapshot. Covers nodes
    /// whose events predate the pool and nodes left behind by transient
    /// signer failures.
    pub async fn rescan(&self) {
        let nodes = self
            .store
            .view(|tx| tx.find_nodes(NodeFilter::ByMembership(Membership::Accepted)))
            .await;
        for node in &nodes {
            self.enqueue_if_eligible(node);
        }
    }

    /// Dispatch queued jobs to bounded workers until shutdown. In-flight
    /// signings abort at their next suspension point when the signal flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut queue = match self.queue_rx.lock().await.take() {
            Some(queue) => queue,
            // A previous run still owns the receiver (it is restored on
            // shutdown); nothing to do.
            None => return,
        };

        loop {
            let job_shutdown_template = shutdown.clone();
            tokio::select! {
                _ = shutdown.wait_for(|stopped| *stopped) => break,
                node_id = queue.recv() => {
                    let Some(node_id) = node_id else { break };
                    if self.in_flight.insert(node_id.clone(), ()).is_some() {
                        continue;
                    }
                    let permit = match self.workers.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let pool = self.clone();
                    let mut job_shutdown = job_shutdown_template.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = job_shutdown.wait_for(|stopped| *stopped) => {
                                debug!(node_id = %node_id, "signing job cancelled");
                            }
                            _ = pool.process(&node_id) => {}
                        }
                        pool.in_flight.remove(&node_id);
                        drop(permit);
                    });
                }
            }
        }

        *self.queue_rx.lock().await = Some(queue);
    }

    /// Sign one node's pending CSR and commit the result.
    async fn process(&self, node_id: &str) {
        let Some(node) = self.store.view(|tx| tx.get_node(node_id)).await else {
            return;
        };
        if !Self::wants_signing(&node) {
            return;
        }

        let security = self.security.snapshot().await;
        let organization = self.security.organization().to_string();
        // Renewals pick up the operator's desired role; demotion and
        // promotion are applied here, at issuance.
        let role = node.spec.desired_role;
        let csr = node.certificate.csr.clone();

        // A rotate command alone does not re-issue: if the stored CSR was
        // already fulfilled under the active signing root, wait for the
        // agent's fresh one.
        if node.certificate.status.state == IssuanceState::Rotate
            && !node.certificate.certificate.is_empty()
        {
            if let Ok(issuer) = pki::certificate_issuer_subject(&node.certificate.certificate) {
                if issuer == security.root_ca.issuer_info().subject {
                    debug!(node_id = %node_id, "certificate already issued under the active root");
                    return;
                }
            }
        }

        if let Err(e) = pki::parse_csr(&csr) {
            if node.certificate.status.state == IssuanceState::Rotate {
                // The stored CSR was already judged when it first arrived;
                // the agent has to submit a usable one.
                debug!(node_id = %node_id, "stored CSR is unusable; waiting for the agent");
                return;
            }
            self.fail_issuance(node_id, &csr, format!("CSR Decode failed: {}", e))
                .await;
            return;
        }

        let certificate = if security.external_ca.is_configured() {
            let prepared = PreparedCsr {
                csr_pem: csr.clone(),
                node_id: node_id.to_string(),
                role,
                organization: organization.clone(),
            };
            match security.external_ca.sign(&prepared).await {
                Ok(leaf) => security.root_ca.append_intermediates(leaf),
                Err(e) => {
                    // Transient: the node stays in its current state and is
                    // re-queued by the next rescan.
                    warn!(node_id = %node_id, error = %e, "external signing failed; will retry");
                    return;
                }
            }
        } else if security.root_ca.has_signer() {
            match security.root_ca.sign_csr(&csr, node_id, role, &organization) {
                Ok(cert) => cert,
                Err(pki::PkiError::InvalidCsr(e)) => {
                    self.fail_issuance(node_id, &csr, format!("CSR Decode failed: {}", e))
                        .await;
                    return;
                }
                Err(e) => {
                    warn!(node_id = %node_id, error = %e, "local signing failed; will retry");
                    return;
                }
            }
        } else {
            // No signer at all right now (e.g. mid-swap); leave the node
            // queued.
            debug!(node_id = %node_id, "no signer available; leaving node queued");
            return;
        };

        let committed = self
            .store
            .update(|tx| {
                let Some(mut node) = tx.get_node(node_id) else {
                    return Ok(false);
                };
                // The CSR may have been replaced while we were signing; let
                // the newer job handle it.
                if node.certificate.csr != csr || !Self::wants_signing(&node) {
                    return Ok(false);
                }
                node.certificate.certificate = certificate.clone();
                node.certificate.role = role;
                node.certificate.status = IssuanceStatus::issued();
                tx.update_node(node)?;
                Ok(true)
            })
            .await;

        match committed {
            Ok(true) => {
                info!(node_id = %node_id, role = ?role, "certificate issued");
            }
            Ok(false) => {
                debug!(node_id = %node_id, "issuance superseded; not committed");
            }
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "failed to commit issued certificate");
            }
        }
    }

    /// Record a permanent issuance failure for the stored CSR.
    async fn fail_issuance(&self, node_id: &str, csr: &str, reason: String) {
        info!(node_id = %node_id, reason = %reason, "issuance failed");
        let result = self
            .store
            .update(|tx| {
                let Some(mut node) = tx.get_node(node_id) else {
                    return Ok(());
                };
                if node.certificate.csr != csr {
                    return Ok(());
                }
                node.certificate.status = IssuanceStatus::failed(reason.clone());
                tx.update_node(node)
            })
            .await;
        if let Err(e) = result {
            warn!(node_id = %node_id, error = %e, "failed to record issuance failure");
        }
    }
}
