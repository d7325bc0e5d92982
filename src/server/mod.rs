//! The CA server: RPC surface and control-loop lifecycle
//!
//! [`CaServer`] owns the background machinery (the signing worker pool,
//! the node reconciler and the root rotation reconciler) and implements
//! the `CA`/`NodeCA` gRPC services on top of the store.
//!
//! # Lifecycle
//!
//! `run` subscribes to store events, loads the current cluster, boots the
//! child tasks and then parks until `stop` is called. `ready` resolves once
//! per run, after the initial snapshot and subscriptions are in place, so
//! callers can sequence against startup. After `stop`, a subsequent `run`
//! restarts the task tree from current store state.
//!
//! # Caller identity
//!
//! Handlers that need the caller's TLS identity read a [`CallerIdentity`]
//! request extension. In production the extension is populated from the
//! mTLS peer certificate; tests inject it directly.

pub mod issuance;
pub mod rotation;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument, warn};

use crate::error::Error;
use crate::model::{
    Cluster, ClusterRootCa, ExternalCaProtocol, ExternalCaSpec, IssuanceState, IssuanceStatus,
    Membership, Node, NodeCertificate, NodeRole, NodeSpec,
};
use crate::pki::external::ExternalCa;
use crate::pki::{self, RootCa};
use crate::proto;
use crate::security::SecurityConfig;
use crate::store::{MemoryStore, StoreError, StoreEvent};
use issuance::SigningPool;
use rotation::RotationReconciler;

/// File name of the persisted trust root.
pub const ROOT_CA_CERT_FILENAME: &str = "swarm-root-ca.crt";

/// Default interval between root-rotation reconciliation passes.
pub const DEFAULT_ROOT_RECONCILIATION_INTERVAL: Duration = Duration::from_secs(3);

/// How long `NodeCertificateStatus` long-polls for issuance to leave a
/// pending state before answering with the current one.
const STATUS_LONG_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Rejection message for admission attempts without a usable join token.
const INVALID_JOIN_TOKEN_MSG: &str = "A valid join token is necessary to join this cluster";

/// The path where the trust root is persisted under a state directory.
pub fn root_ca_cert_path(state_dir: &Path) -> PathBuf {
    state_dir.join("certificates").join(ROOT_CA_CERT_FILENAME)
}

/// TLS identity of an RPC caller, as parsed from its client certificate.
#[derive(Clone, Debug)]
pub struct CallerIdentity {
    /// Node ID from the certificate common name.
    pub node_id: String,
    /// Cluster organization the certificate was issued in.
    pub organization: String,
    /// Role from the certificate organizational unit.
    pub role: NodeRole,
}

struct Lifecycle {
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

/// The certificate authority server.
pub struct CaServer {
    store: MemoryStore,
    security: Arc<SecurityConfig>,
    root_ca_path: PathBuf,
    root_reconciliation_interval: StdMutex<Duration>,
    lifecycle: Mutex<Lifecycle>,
    ready: watch::Sender<bool>,
    /// Last cluster CA material applied by `update_root_ca`; unchanged
    /// clusters are skipped without touching disk or the live config.
    last_seen: Mutex<Option<(ClusterRootCa, Vec<ExternalCaSpec>)>>,
    /// Guards writes of the trust-root file.
    root_ca_file_lock: Mutex<()>,
    signing: Arc<SigningPool>,
    rotation: Arc<RotationReconciler>,
    /// Distinguishes ready signals across run/stop cycles.
    run_generation: AtomicU64,
}

impl CaServer {
    /// Create a CA server over the given store and security configuration.
    /// `root_ca_path` is where the trust root is persisted on every root
    /// change (see [`root_ca_cert_path`]).
    pub fn new(
        store: MemoryStore,
        security: Arc<SecurityConfig>,
        root_ca_path: PathBuf,
    ) -> Arc<Self> {
        let signing = Arc::new(SigningPool::new(store.clone(), security.clone()));
        let rotation = Arc::new(RotationReconciler::new(store.clone()));
        let (ready, _) = watch::channel(false);
        Arc::new(CaServer {
            store,
            security,
            root_ca_path,
            root_reconciliation_interval: StdMutex::new(DEFAULT_ROOT_RECONCILIATION_INTERVAL),
            lifecycle: Mutex::new(Lifecycle {
                shutdown: None,
                tasks: Vec::new(),
            }),
            ready,
            last_seen: Mutex::new(None),
            root_ca_file_lock: Mutex::new(()),
            signing,
            rotation,
            run_generation: AtomicU64::new(0),
        })
    }

    /// The security configuration this server serves from.
    pub fn security(&self) -> &Arc<SecurityConfig> {
        &self.security
    }

    /// Override the reconciliation pass interval. Takes effect on the next
    /// `run`.
    pub fn set_root_reconciliation_interval(&self, interval: Duration) {
        *self
            .root_reconciliation_interval
            .lock()
            .expect("interval lock poisoned") = interval;
    }

    fn reconciliation_interval(&self) -> Duration {
        *self
            .root_reconciliation_interval
            .lock()
            .expect("interval lock poisoned")
    }

    /// Run the CA server until [`CaServer::stop`] is called. Fails with
    /// [`Error::AlreadyRunning`] if a previous run is still active.
    pub async fn run(self: Arc<Self>) -> Result<(), Error> {
        // Subscribe before the initial snapshot so no commit is missed in
        // between.
        let events = self.store.subscribe();

        let cluster = self
            .store
            .view(|tx| tx.get_cluster())
            .await
            .ok_or(Error::ClusterNotFound)?;

        let shutdown_rx = {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.shutdown.is_some() {
                return Err(Error::AlreadyRunning);
            }
            let (tx, rx) = watch::channel(false);
            lifecycle.shutdown = Some(tx);
            rx
        };

        self.rotation.set_running(true);
        if let Err(e) = self.update_root_ca(&cluster).await {
            // Serve from the previous configuration; the next cluster
            // event retries.
            error!(error = %e, "failed to apply cluster CA configuration at startup");
        }

        let event_loop = tokio::spawn(Self::event_loop(
            self.clone(),
            events,
            shutdown_rx.clone(),
            self.reconciliation_interval(),
        ));
        let signing_loop = tokio::spawn(self.signing.clone().run(shutdown_rx.clone()));

        {
            let mut lifecycle = self.lifecycle.lock().await;
            lifecycle.tasks.push(event_loop);
            lifecycle.tasks.push(signing_loop);
        }

        let generation = self.run_generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, "CA server ready");
        self.ready.send_replace(true);

        // Park until stop flips the shutdown signal.
        let mut shutdown = shutdown_rx;
        let _ = shutdown.wait_for(|stopped| *stopped).await;
        Ok(())
    }

    /// Resolve once the current run has finished its initial snapshot and
    /// subscriptions.
    pub async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as self, so changed() cannot fail while
        // we hold &self.
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop the running server: cancel all child tasks and wait for them
    /// to exit. A stopped server keeps serving RPCs from store state; only
    /// the background reconciliation stops. No-op when not running.
    pub async fn stop(&self) {
        let (shutdown, tasks) = {
            let mut lifecycle = self.lifecycle.lock().await;
            let Some(shutdown) = lifecycle.shutdown.take() else {
                return;
            };
            (shutdown, std::mem::take(&mut lifecycle.tasks))
        };

        self.ready.send_replace(false);
        self.rotation.set_running(false);
        let _ = shutdown.send(true);
        for task in tasks {
            let _ = task.await;
        }
        info!("CA server stopped");
    }

    async fn event_loop(
        server: Arc<CaServer>,
        mut events: tokio::sync::broadcast::Receiver<StoreEvent>,
        mut shutdown: watch::Receiver<bool>,
        reconciliation_interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(reconciliation_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stopped| *stopped).await; } => return,
                event = events.recv() => match event {
                    Ok(StoreEvent::CreateNode(node)) | Ok(StoreEvent::UpdateNode(node)) => {
                        server.signing.enqueue_if_eligible(&node);
                        server.rotation.maybe_complete().await;
                    }
                    Ok(StoreEvent::DeleteNode(_)) => {
                        // A departing node can be the last unconverged one.
                        server.rotation.maybe_complete().await;
                    }
                    Ok(StoreEvent::UpdateCluster(cluster))
                    | Ok(StoreEvent::CreateCluster(cluster)) => {
                        if let Err(e) = server.update_root_ca(&cluster).await {
                            error!(error = %e, "failed to apply cluster CA configuration");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "store event stream lagged; rescanning");
                        server.signing.rescan().await;
                        server.rotation.maybe_complete().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
                _ = ticker.tick() => {
                    server.signing.rescan().await;
                    server.rotation.pass().await;
                }
            }
        }
    }

    /// Apply the cluster's CA material to this server: rebuild the root CA
    /// and external signer pool, persist the trust root, and swap the live
    /// security configuration. Called on every cluster update; unchanged
    /// material is a no-op.
    ///
    /// A failure at any step (unparseable material, unwritable trust root)
    /// leaves the live configuration untouched.
    #[instrument(skip_all, fields(cluster = %cluster.id))]
    pub async fn update_root_ca(&self, cluster: &Cluster) -> Result<(), Error> {
        let external_specs = cluster.spec.ca_config.external_cas.clone();

        let mut last_seen = self.last_seen.lock().await;
        if last_seen
            .as_ref()
            .is_some_and(|(rc, ext)| *rc == cluster.root_ca && *ext == external_specs)
        {
            return Ok(());
        }

        let root_ca = build_root_ca(&cluster.root_ca)?;

        {
            let _guard = self.root_ca_file_lock.lock().await;
            write_trust_root(&self.root_ca_path, root_ca.certs_pem()).await?;
        }

        let external_ca = build_external_ca(&cluster.root_ca, &external_specs);

        info!(
            rotation_in_progress = cluster.root_ca.root_rotation.is_some(),
            external_urls = external_ca.urls().len(),
            "root CA configuration updated"
        );
        self.security.swap(root_ca, external_ca).await;
        *last_seen = Some((cluster.root_ca.clone(), external_specs));
        drop(last_seen);

        self.rotation.observe_rotation(&cluster.root_ca).await;
        Ok(())
    }

    /// Parse the caller's TLS identity: an injected extension first, then
    /// the mTLS peer certificate validated against the active root.
    fn caller_identity<T>(
        &self,
        root_ca: &RootCa,
        request: &Request<T>,
    ) -> Option<CallerIdentity> {
        if let Some(identity) = request.extensions().get::<CallerIdentity>() {
            return Some(identity.clone());
        }

        let certs = request.peer_certs()?;
        let leaf = certs.first()?;
        let leaf_pem = ::pem::encode(&::pem::Pem::new("CERTIFICATE", leaf.as_ref().to_vec()));
        match root_ca.parse_validate(&leaf_pem) {
            Ok(parsed) => Some(CallerIdentity {
                node_id: parsed.node_id,
                organization: parsed.organization,
                role: parsed.role,
            }),
            Err(e) => {
                debug!(error = %e, "peer certificate did not validate against the active root");
                None
            }
        }
    }

    async fn handle_get_root_ca_certificate(
        &self,
    ) -> Result<proto::GetRootCaCertificateResponse, Status> {
        let security = self.security.snapshot().await;
        Ok(proto::GetRootCaCertificateResponse {
            certificate: security.root_ca.certs_pem().as_bytes().to_vec(),
        })
    }

    async fn handle_get_unlock_key<T>(
        &self,
        request: &Request<T>,
    ) -> Result<proto::GetUnlockKeyResponse, Status> {
        let security = self.security.snapshot().await;
        let identity = self.caller_identity(&security.root_ca, request);
        match identity {
            Some(identity)
                if identity.role == NodeRole::Manager
                    && identity.organization == self.security.organization() => {}
            _ => {
                return Err(Status::permission_denied(
                    "Permission denied: only cluster managers may read the unlock key",
                ))
            }
        }

        let cluster = self
            .store
            .view(|tx| tx.get_cluster())
            .await
            .ok_or_else(|| Status::not_found("cluster not found"))?;

        let unlock_key = if cluster.spec.encryption_config.auto_lock_managers {
            cluster
                .unlock_key(NodeRole::Manager.organizational_unit())
                .map(|k| k.key.clone())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        Ok(proto::GetUnlockKeyResponse {
            unlock_key,
            version: Some(proto::Version {
                index: cluster.meta.version,
            }),
        })
    }

    async fn handle_issue_node_certificate(
        &self,
        request: Request<proto::IssueNodeCertificateRequest>,
    ) -> Result<proto::IssueNodeCertificateResponse, Status> {
        let security = self.security.snapshot().await;
        let identity = self.caller_identity(&security.root_ca, &request);
        let req = request.into_inner();

        if req.csr.is_empty() {
            return Err(Status::invalid_argument("request must include a valid CSR"));
        }
        let csr = String::from_utf8_lossy(&req.csr).into_owned();
        let requested_role = node_role_from_proto(req.role)?;

        // A caller presenting a certificate from this cluster's root is
        // renewing; everyone else must hold a join token.
        if let Some(identity) = &identity {
            if identity.organization == self.security.organization() {
                return self.renew_certificate(identity, csr, requested_role).await;
            }
        }

        let token = req.token;
        let created = self
            .store
            .update(|tx| {
                let cluster = tx
                    .get_cluster()
                    .ok_or_else(|| StoreError::NotExist("cluster".into()))?;
                if token.is_empty()
                    || token != cluster.root_ca.join_tokens.for_role(requested_role)
                {
                    // Reported below; nothing was mutated.
                    return Ok(None);
                }

                let mut node_id = pki::generate_id();
                while tx.get_node(&node_id).is_some() {
                    node_id = pki::generate_id();
                }

                let node = Node {
                    id: node_id.clone(),
                    spec: NodeSpec {
                        membership: Membership::Accepted,
                        desired_role: requested_role,
                    },
                    certificate: NodeCertificate {
                        csr,
                        certificate: String::new(),
                        role: requested_role,
                        status: IssuanceStatus::pending(),
                    },
                    ..Default::default()
                };
                tx.create_node(node)?;
                Ok(Some(node_id))
            })
            .await
            .map_err(store_error_to_status)?;

        match created {
            Some(node_id) => {
                info!(node_id = %node_id, role = ?requested_role, "node admitted to cluster");
                Ok(proto::IssueNodeCertificateResponse {
                    node_id,
                    node_membership: proto::NodeMembership::Accepted as i32,
                })
            }
            None if identity.is_some() => Err(Status::permission_denied(
                "Permission denied: cross-organization certificate renewals require a join token",
            )),
            None => Err(Status::unauthenticated(INVALID_JOIN_TOKEN_MSG)),
        }
    }

    async fn renew_certificate(
        &self,
        identity: &CallerIdentity,
        csr: String,
        requested_role: NodeRole,
    ) -> Result<proto::IssueNodeCertificateResponse, Status> {
        // Only managers may request a role other than the one on their
        // current certificate.
        if requested_role != identity.role && identity.role != NodeRole::Manager {
            return Err(Status::permission_denied(format!(
                "Permission denied: a {} is not allowed to request a {} certificate",
                identity.role.organizational_unit(),
                requested_role.organizational_unit(),
            )));
        }

        let node_id = identity.node_id.clone();
        let membership = self
            .store
            .update(|tx| {
                match tx.get_node(&node_id) {
                    Some(mut node) => {
                        node.certificate.csr = csr;
                        node.certificate.role = requested_role;
                        node.certificate.status = IssuanceStatus {
                            state: IssuanceState::Renew,
                            err: String::new(),
                        };
                        let membership = node.spec.membership;
                        tx.update_node(node)?;
                        Ok(membership)
                    }
                    None => {
                        // The caller holds a valid identity but the store
                        // lost its record (e.g. a manager re-joining after
                        // state restore); recreate it.
                        let node = Node {
                            id: node_id.clone(),
                            spec: NodeSpec {
                                membership: Membership::Accepted,
                                desired_role: requested_role,
                            },
                            certificate: NodeCertificate {
                                csr,
                                certificate: String::new(),
                                role: requested_role,
                                status: IssuanceStatus {
                                    state: IssuanceState::Renew,
                                    err: String::new(),
                                },
                            },
                            ..Default::default()
                        };
                        tx.create_node(node)?;
                        Ok(Membership::Accepted)
                    }
                }
            })
            .await
            .map_err(store_error_to_status)?;

        debug!(node_id = %node_id, role = ?requested_role, "certificate renewal accepted");
        Ok(proto::IssueNodeCertificateResponse {
            node_id,
            node_membership: membership_to_proto(membership) as i32,
        })
    }

    async fn handle_node_certificate_status(
        &self,
        req: proto::NodeCertificateStatusRequest,
    ) -> Result<proto::NodeCertificateStatusResponse, Status> {
        if req.node_id.is_empty() {
            return Err(Status::invalid_argument("node ID is required"));
        }

        // Subscribe before reading so no transition is missed in between.
        let mut events = self.store.subscribe();
        let mut node = self
            .store
            .view(|tx| tx.get_node(&req.node_id))
            .await
            .ok_or_else(|| Status::not_found(format!("node {} not found", req.node_id)))?;

        let deadline = Instant::now() + STATUS_LONG_POLL_TIMEOUT;
        while matches!(
            node.certificate.status.state,
            IssuanceState::Pending | IssuanceState::Renew
        ) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, events.recv()).await {
                Ok(Ok(StoreEvent::UpdateNode(updated))) if updated.id == req.node_id => {
                    node = updated;
                }
                Ok(Ok(StoreEvent::DeleteNode(deleted))) if deleted.id == req.node_id => {
                    return Err(Status::not_found(format!(
                        "node {} not found",
                        req.node_id
                    )));
                }
                Ok(Ok(_)) => {}
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => {
                    // Catch up from the store and keep waiting.
                    match self.store.view(|tx| tx.get_node(&req.node_id)).await {
                        Some(n) => node = n,
                        None => {
                            return Err(Status::not_found(format!(
                                "node {} not found",
                                req.node_id
                            )))
                        }
                    }
                }
                Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => break,
                Err(_) => break, // deadline reached
            }
        }

        Ok(proto::NodeCertificateStatusResponse {
            status: Some(issuance_status_to_proto(&node.certificate.status)),
            certificate: Some(proto::Certificate {
                csr: node.certificate.csr.into_bytes(),
                certificate: node.certificate.certificate.into_bytes(),
                role: node_role_to_proto(node.certificate.role) as i32,
                status: Some(issuance_status_to_proto(&node.certificate.status)),
            }),
        })
    }
}

/// Build the candidate root CA for a cluster. During a rotation the
/// cross-signed new root signs and travels as an intermediate, while the
/// served trust root stays the old certificate.
fn build_root_ca(root_ca: &ClusterRootCa) -> Result<RootCa, Error> {
    let candidate = match &root_ca.root_rotation {
        Some(rotation) => {
            let signer = (!rotation.ca_key.is_empty())
                .then_some((rotation.cross_signed_ca_cert.as_str(), rotation.ca_key.as_str()));
            RootCa::new(&root_ca.ca_cert, signer, &rotation.cross_signed_ca_cert)
        }
        None => {
            let signer = (!root_ca.ca_key.is_empty())
                .then_some((root_ca.ca_cert.as_str(), root_ca.ca_key.as_str()));
            RootCa::new(&root_ca.ca_cert, signer, "")
        }
    };
    Ok(candidate?)
}

/// Group the configured external CAs by the root they sign under and keep
/// the URLs matching the *active signing root*. An entry with no CA cert
/// counts as the old (non-rotation) root, so it drops out while a rotation
/// is in progress.
fn build_external_ca(root_ca: &ClusterRootCa, specs: &[ExternalCaSpec]) -> ExternalCa {
    let signing_root = root_ca
        .root_rotation
        .as_ref()
        .map(|r| r.ca_cert.as_str())
        .unwrap_or(root_ca.ca_cert.as_str());

    let urls: Vec<String> = specs
        .iter()
        .filter(|spec| spec.protocol == ExternalCaProtocol::Cfssl)
        .filter(|spec| {
            if spec.ca_cert.trim().is_empty() {
                root_ca.root_rotation.is_none()
            } else {
                spec.ca_cert.trim() == signing_root.trim()
            }
        })
        .map(|spec| spec.url.clone())
        .collect();

    ExternalCa::new(urls)
}

/// Atomically replace the trust-root file: write to a temporary sibling,
/// then rename over the target.
async fn write_trust_root(path: &Path, certs_pem: &str) -> Result<(), Error> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::validation("trust root path has no parent directory"))?;
    tokio::fs::create_dir_all(parent).await?;

    let tmp = path.with_extension("crt.tmp");
    tokio::fs::write(&tmp, certs_pem.as_bytes()).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn store_error_to_status(err: StoreError) -> Status {
    match err {
        StoreError::NotExist(what) => Status::not_found(what),
        other => Status::unavailable(other.to_string()),
    }
}

fn node_role_from_proto(role: i32) -> Result<NodeRole, Status> {
    match proto::NodeRole::try_from(role) {
        Ok(proto::NodeRole::Worker) => Ok(NodeRole::Worker),
        Ok(proto::NodeRole::Manager) => Ok(NodeRole::Manager),
        Err(_) => Err(Status::invalid_argument("unknown node role")),
    }
}

fn node_role_to_proto(role: NodeRole) -> proto::NodeRole {
    match role {
        NodeRole::Worker => proto::NodeRole::Worker,
        NodeRole::Manager => proto::NodeRole::Manager,
    }
}

fn membership_to_proto(membership: Membership) -> proto::NodeMembership {
    match membership {
        Membership::Pending => proto::NodeMembership::Pending,
        Membership::Accepted => proto::NodeMembership::Accepted,
        Membership::Rejected => proto::NodeMembership::Rejected,
    }
}

fn issuance_state_to_proto(state: IssuanceState) -> proto::IssuanceState {
    match state {
        IssuanceState::Pending => proto::IssuanceState::Pending,
        IssuanceState::Renew => proto::IssuanceState::Renew,
        IssuanceState::Rotate => proto::IssuanceState::Rotate,
        IssuanceState::Issued => proto::IssuanceState::Issued,
        IssuanceState::Failed => proto::IssuanceState::Failed,
    }
}

fn issuance_status_to_proto(status: &IssuanceStatus) -> proto::IssuanceStatus {
    proto::IssuanceStatus {
        state: issuance_state_to_proto(status.state) as i32,
        err: status.err.clone(),
    }
}

/// gRPC service facade over a shared [`CaServer`].
#[derive(Clone)]
pub struct CaService {
    server: Arc<CaServer>,
}

impl CaService {
    /// Wrap a server for registration with tonic.
    pub fn new(server: Arc<CaServer>) -> Self {
        CaService { server }
    }
}

#[tonic::async_trait]
impl proto::ca_server::Ca for CaService {
    async fn get_root_ca_certificate(
        &self,
        _request: Request<proto::GetRootCaCertificateRequest>,
    ) -> Result<Response<proto::GetRootCaCertificateResponse>, Status> {
        self.server
            .handle_get_root_ca_certificate()
            .await
            .map(Response::new)
    }

    async fn get_unlock_key(
        &self,
        request: Request<proto::GetUnlockKeyRequest>,
    ) -> Result<Response<proto::GetUnlockKeyResponse>, Status> {
        self.server
            .handle_get_unlock_key(&request)
            .await
            .map(Response::new)
    }
}

#[tonic::async_trait]
impl proto::node_ca_server::NodeCa for CaService {
    async fn issue_node_certificate(
        &self,
        request: Request<proto::IssueNodeCertificateRequest>,
    ) -> Result<Response<proto::IssueNodeCertificateResponse>, Status> {
        self.server
            .handle_issue_node_certificate(request)
            .await
            .map(Response::new)
    }

    async fn node_certificate_status(
        &self,
        request: Request<proto::NodeCertificateStatusRequest>,
    ) -> Result<Response<proto::NodeCertificateStatusResponse>, Status> {
        self.server
            .handle_node_certificate_status(request.into_inner())
            .await
            .map(Response::new)
    }
}
