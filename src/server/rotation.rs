//! Root rotation reconciliation
//!
//! A periodic, idempotent fixed-point loop that drives every accepted
//! node's TLS issuer from the old root to the rotation target. Each pass:
//!
//! 1. snapshots the accepted nodes,
//! 2. tells up to [`crate::ISSUANCE_STATE_ROTATE_MAX_BATCH_SIZE`] of the
//!    ones still presenting the wrong issuer to rotate,
//! 3. and, once nothing is left to command and every member has converged,
//!    commits completion: the cluster root is swapped to the rotation
//!    certificate, join tokens are regenerated, and the rotation is
//!    cleared.
//!
//! Completion re-reads the cluster and the nodes inside the commit
//! transaction, so competing reconcilers (e.g. across a leadership
//! handoff) can only complete the rotation they actually observed.
//! Mutations are resumable: a reconciler that restarts mid-rotation picks
//! the work back up from store state alone.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::model::{
    IssuanceState, IssuanceStatus, JoinTokens, Membership, Node, RootRotation,
    ClusterRootCa,
};
use crate::pki::{self, IssuerInfo, RootCa};
use crate::store::{MemoryStore, NodeFilter, StoreError};
use crate::ISSUANCE_STATE_ROTATE_MAX_BATCH_SIZE;

/// An in-progress rotation as this reconciler last observed it.
#[derive(Clone, Debug)]
struct ActiveRotation {
    rotation: RootRotation,
    /// Issuer identity every node must converge to.
    target: IssuerInfo,
}

/// The root rotation reconciler. One per CA server; multiple servers over
/// the same store converge because every mutation is a store-checked step
/// toward the same fixed point.
pub struct RotationReconciler {
    store: MemoryStore,
    state: Mutex<Option<ActiveRotation>>,
    /// Reconciliation only acts while the owning server runs; a stopped
    /// server still tracks the rotation so a restart resumes it.
    running: AtomicBool,
}

impl RotationReconciler {
    /// Create a reconciler over the store, initially tracking no rotation.
    pub fn new(store: MemoryStore) -> Self {
        RotationReconciler {
            store,
            state: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Gate reconciliation on the owning server's lifecycle.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Track the rotation (or its absence) on the cluster. A *changed*
    /// rotation triggers an immediate pass so nodes start moving without
    /// waiting out the reconciliation interval.
    pub async fn observe_rotation(&self, root_ca: &ClusterRootCa) {
        let desired = match &root_ca.root_rotation {
            Some(rotation) => match pki::issuer_info_of_cert(&rotation.ca_cert) {
                Ok(target) => Some(ActiveRotation {
                    rotation: rotation.clone(),
                    target,
                }),
                Err(e) => {
                    // Unusable rotation material; leave the current state
                    // alone rather than acting on a target we can't parse.
                    error!(error = %e, "root rotation certificate does not parse");
                    return;
                }
            },
            None => None,
        };

        let changed = {
            let mut state = self.state.lock().await;
            let changed = match (&*state, &desired) {
                (Some(current), Some(next)) => current.rotation != next.rotation,
                (None, None) => false,
                _ => true,
            };
            if changed {
                match &desired {
                    Some(next) => {
                        info!(
                            ca_cert_hash = %pki::ca_cert_hash(&next.rotation.ca_cert),
                            "root rotation in progress"
                        );
                    }
                    None => debug!("no root rotation in progress"),
                }
                *state = desired.clone();
            }
            changed
        };

        if changed && desired.is_some() && self.is_running() {
            self.pass().await;
        }
    }

    /// One reconciliation pass: classify the accepted nodes, command a
    /// bounded batch to rotate, or commit completion when fully converged.
    #[instrument(skip(self))]
    pub async fn pass(&self) {
        let Some(active) = self.state.lock().await.clone() else {
            return;
        };

        let members = self
            .store
            .view(|tx| tx.find_nodes(NodeFilter::ByMembership(Membership::Accepted)))
            .await;

        let needs_rotate: Vec<&Node> = members
            .iter()
            .filter(|n| wants_rotation(n, &active.target))
            .collect();

        if needs_rotate.is_empty() {
            if members.iter().all(|n| converged(n, &active.target)) {
                self.complete(&active).await;
            }
            // Otherwise nodes are mid-rotation; wait for their agents.
            return;
        }

        let batch: Vec<(String, IssuerInfo)> = needs_rotate
            .iter()
            .take(ISSUANCE_STATE_ROTATE_MAX_BATCH_SIZE)
            .map(|n| (n.id.clone(), active.target.clone()))
            .collect();
        let commanded = batch.len();

        let result = self
            .store
            .batch(|b| {
                for (node_id, target) in batch {
                    b.update(move |tx| {
                        let Some(mut node) = tx.get_node(&node_id) else {
                            return Ok(());
                        };
                        // Re-check inside the transaction; another
                        // reconciler may have gotten here first.
                        if !wants_rotation(&node, &target) {
                            return Ok(());
                        }
                        node.certificate.status = IssuanceStatus {
                            state: IssuanceState::Rotate,
                            err: String::new(),
                        };
                        tx.update_node(node)
                    });
                }
            })
            .await;

        match result {
            Ok(applied) => {
                info!(
                    commanded,
                    applied,
                    remaining = needs_rotate.len() - commanded,
                    "told nodes to rotate their certificates"
                );
            }
            Err(e) => warn!(error = %e, "rotation batch failed; will retry next pass"),
        }
    }

    /// Cheap convergence check run on node events: commits completion when
    /// the last member converges, without waiting for the next pass. Never
    /// commands additional rotations, so the per-pass batch bound holds.
    pub async fn maybe_complete(&self) {
        let Some(active) = self.state.lock().await.clone() else {
            return;
        };

        let members = self
            .store
            .view(|tx| tx.find_nodes(NodeFilter::ByMembership(Membership::Accepted)))
            .await;
        if members.iter().all(|n| converged(n, &active.target))
            && !members
                .iter()
                .any(|n| wants_rotation(n, &active.target))
        {
            self.complete(&active).await;
        }
    }

    /// Commit rotation completion. The transaction re-reads the cluster
    /// and nodes: it only applies if the rotation is still the one this
    /// reconciler observed and every member has truly converged.
    async fn complete(&self, active: &ActiveRotation) {
        // Fresh tokens are minted against the new root; wasted if the
        // commit loses the race, which is fine.
        let new_root_tokens = match RootCa::new(&active.rotation.ca_cert, None, "") {
            Ok(root) => JoinTokens {
                worker: root.generate_join_token(),
                manager: root.generate_join_token(),
            },
            Err(e) => {
                error!(error = %e, "cannot build rotation root to mint join tokens");
                return;
            }
        };

        let expected = active.rotation.clone();
        let target = active.target.clone();
        let committed = self
            .store
            .update(move |tx| {
                let mut cluster = tx
                    .get_cluster()
                    .ok_or_else(|| StoreError::NotExist("cluster".into()))?;

                // Fixed point: only complete the rotation we observed.
                if cluster.root_ca.root_rotation.as_ref() != Some(&expected) {
                    return Ok(false);
                }
                let members = tx.find_nodes(NodeFilter::ByMembership(Membership::Accepted));
                if !members.iter().all(|n| converged(n, &target)) {
                    return Ok(false);
                }

                cluster.root_ca = ClusterRootCa {
                    ca_cert_hash: pki::ca_cert_hash(&expected.ca_cert),
                    ca_cert: expected.ca_cert,
                    ca_key: expected.ca_key,
                    join_tokens: new_root_tokens,
                    root_rotation: None,
                };
                tx.update_cluster(cluster)?;
                Ok(true)
            })
            .await;

        match committed {
            Ok(true) => {
                info!(
                    ca_cert_hash = %pki::ca_cert_hash(&active.rotation.ca_cert),
                    "root rotation complete"
                );
                // Clear our view immediately; the cluster event confirms it
                // for everyone else.
                let mut state = self.state.lock().await;
                if state
                    .as_ref()
                    .is_some_and(|s| s.rotation == active.rotation)
                {
                    *state = None;
                }
            }
            Ok(false) => {
                debug!("rotation completion superseded by a newer cluster state");
            }
            Err(e) => warn!(error = %e, "rotation completion failed; will retry"),
        }
    }
}

/// Whether a node still needs to be told to rotate: an accepted member,
/// not already commanded, whose presented issuer is not the target (or has
/// reported no issuer at all).
fn wants_rotation(node: &Node, target: &IssuerInfo) -> bool {
    node.spec.membership == Membership::Accepted
        && node.certificate.status.state != IssuanceState::Rotate
        && !tls_info_matches(node, target)
}

/// Whether a node is done rotating: issued, and presenting the target
/// issuer.
fn converged(node: &Node, target: &IssuerInfo) -> bool {
    node.certificate.status.state == IssuanceState::Issued && tls_info_matches(node, target)
}

fn tls_info_matches(node: &Node, target: &IssuerInfo) -> bool {
    match node.tls_info() {
        Some(info) => {
            info.cert_issuer_public_key == target.public_key
                && info.cert_issuer_subject == target.subject
        }
        None => false,
    }
}
