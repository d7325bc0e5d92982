//! Shared test harness: an in-process CA with a seeded cluster, plus a
//! fake flakeable external signing server.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tonic::Request;

use swarm_ca::model::{
    Cluster, ClusterRootCa, JoinTokens, Membership, Node, NodeRole, NodeTlsInfo, RootRotation,
};
use swarm_ca::pki::{self, external::ExternalCa, IssuerInfo, RootCa};
use swarm_ca::security::SecurityConfig;
use swarm_ca::server::{root_ca_cert_path, CaServer, CaService, CallerIdentity};
use swarm_ca::store::MemoryStore;

/// Reconciliation interval used by tests unless overridden: fast enough
/// that polls converge quickly.
pub const TEST_RECONCILIATION_INTERVAL: Duration = Duration::from_millis(50);

/// An in-process CA server over a seeded single-cluster store.
pub struct TestCa {
    pub store: MemoryStore,
    pub server: Arc<CaServer>,
    pub service: CaService,
    pub security: Arc<SecurityConfig>,
    pub root_ca: RootCa,
    pub organization: String,
    pub worker_token: String,
    pub manager_token: String,
    pub state_dir: TempDir,
    run_handle: Option<JoinHandle<()>>,
}

impl TestCa {
    pub async fn new() -> TestCa {
        let root_ca = RootCa::generate("swarm-test-CA").unwrap();
        let organization = pki::generate_id();
        let worker_token = root_ca.generate_join_token();
        let manager_token = root_ca.generate_join_token();

        let store = MemoryStore::new();
        {
            let root_ca = root_ca.clone();
            let organization = organization.clone();
            let worker_token = worker_token.clone();
            let manager_token = manager_token.clone();
            store
                .update(move |tx| {
                    tx.create_cluster(Cluster {
                        id: organization,
                        root_ca: ClusterRootCa {
                            ca_cert: root_ca.certs_pem().to_string(),
                            ca_key: root_ca.signer().unwrap().key_pem().to_string(),
                            ca_cert_hash: pki::ca_cert_hash(root_ca.certs_pem()),
                            join_tokens: JoinTokens {
                                worker: worker_token,
                                manager: manager_token,
                            },
                            root_rotation: None,
                        },
                        ..Default::default()
                    })
                })
                .await
                .unwrap();
        }

        let security = Arc::new(SecurityConfig::new(
            organization.clone(),
            root_ca.clone(),
            ExternalCa::empty(),
        ));

        let state_dir = tempfile::tempdir().unwrap();
        let server = CaServer::new(
            store.clone(),
            security.clone(),
            root_ca_cert_path(state_dir.path()),
        );
        server.set_root_reconciliation_interval(TEST_RECONCILIATION_INTERVAL);

        let mut tc = TestCa {
            store,
            service: CaService::new(server.clone()),
            security,
            root_ca,
            organization,
            worker_token,
            manager_token,
            state_dir,
            server,
            run_handle: None,
        };
        tc.start().await;
        tc
    }

    /// Start (or restart) the CA server and wait for it to be ready.
    pub async fn start(&mut self) {
        let server = self.server.clone();
        self.run_handle = Some(tokio::spawn(async move {
            let _ = server.run().await;
        }));
        self.server.ready().await;
    }

    /// Stop the CA server and wait for its tasks to exit.
    pub async fn stop(&mut self) {
        self.server.stop().await;
        if let Some(handle) = self.run_handle.take() {
            let _ = handle.await;
        }
    }

    /// A request carrying a worker TLS identity for the given node.
    pub fn worker_identity(&self, node_id: &str) -> CallerIdentity {
        CallerIdentity {
            node_id: node_id.to_string(),
            organization: self.organization.clone(),
            role: NodeRole::Worker,
        }
    }

    /// A request carrying a manager TLS identity for the given node.
    pub fn manager_identity(&self, node_id: &str) -> CallerIdentity {
        CallerIdentity {
            node_id: node_id.to_string(),
            organization: self.organization.clone(),
            role: NodeRole::Manager,
        }
    }

    /// The TLS info a node signed under the current (pre-rotation) root
    /// would report.
    pub fn current_tls_info(&self) -> NodeTlsInfo {
        tls_info_for(self.root_ca.certs_pem(), self.root_ca.issuer_info().clone())
    }
}

impl Drop for TestCa {
    fn drop(&mut self) {
        if let Some(handle) = &self.run_handle {
            handle.abort();
        }
    }
}

/// Build a request with an injected caller identity.
pub fn request_as<T>(payload: T, identity: CallerIdentity) -> Request<T> {
    let mut request = Request::new(payload);
    request.extensions_mut().insert(identity);
    request
}

/// TLS info for nodes whose issuer is the given certificate.
pub fn tls_info_for(trust_root_pem: &str, issuer: IssuerInfo) -> NodeTlsInfo {
    NodeTlsInfo {
        trust_root: trust_root_pem.to_string(),
        cert_issuer_public_key: issuer.public_key,
        cert_issuer_subject: issuer.subject,
    }
}

/// Cross-sign `rotation_root` with the cluster's current root and return
/// the rotation record plus the TLS info converged nodes will report.
pub fn rotation_for(current_root: &RootCa, rotation_root: &RootCa) -> (RootRotation, NodeTlsInfo) {
    let cross_signed = current_root
        .cross_sign_ca_certificate(rotation_root.certs_pem())
        .unwrap();
    let rotation = RootRotation {
        ca_cert: rotation_root.certs_pem().to_string(),
        ca_key: rotation_root.signer().unwrap().key_pem().to_string(),
        cross_signed_ca_cert: cross_signed,
    };
    let info = tls_info_for(
        current_root.certs_pem(),
        pki::issuer_info_of_cert(rotation_root.certs_pem()).unwrap(),
    );
    (rotation, info)
}

/// Install a root rotation on the cluster object.
pub async fn set_cluster_rotation(store: &MemoryStore, rotation: Option<RootRotation>) {
    store
        .update(move |tx| {
            let mut cluster = tx.get_cluster().unwrap();
            cluster.root_ca.root_rotation = rotation;
            tx.update_cluster(cluster)
        })
        .await
        .unwrap();
}

/// Create or replace a node in the store.
pub async fn put_node(store: &MemoryStore, node: Node) {
    store
        .update(move |tx| match tx.get_node(&node.id) {
            Some(existing) => {
                let mut node = node;
                node.meta = existing.meta;
                tx.update_node(node)
            }
            None => tx.create_node(node),
        })
        .await
        .unwrap();
}

/// Poll `check` every 25 ms until it returns `Ok`, or fail the test with
/// the last error once `timeout` elapses.
pub async fn poll_until<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_err = String::from("never polled");
    while tokio::time::Instant::now() < deadline {
        match check().await {
            Ok(()) => return,
            Err(e) => last_err = e,
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within {timeout:?}: {last_err}");
}

// ── Fake external signing server ────────────────────────────────────

#[derive(Deserialize)]
struct CfsslSignRequest {
    certificate_request: String,
    #[serde(default)]
    subject: Option<CfsslSubject>,
}

#[derive(Deserialize)]
struct CfsslSubject {
    #[serde(rename = "CN")]
    common_name: String,
    #[serde(default)]
    names: Vec<CfsslSubjectName>,
}

#[derive(Deserialize, Default)]
struct CfsslSubjectName {
    #[serde(rename = "O", default)]
    organization: String,
    #[serde(rename = "OU", default)]
    organizational_unit: String,
}

#[derive(Serialize)]
struct CfsslSignResponse {
    success: bool,
    result: Option<CfsslResult>,
    errors: Vec<CfsslError>,
}

#[derive(Serialize)]
struct CfsslResult {
    certificate: String,
}

#[derive(Serialize)]
struct CfsslError {
    message: String,
}

struct SignerState {
    root: RootCa,
    flaky: Arc<AtomicBool>,
}

/// An in-process cfssl-shaped signing server backed by a real root CA,
/// with a switch to simulate outages.
pub struct ExternalSigningServer {
    pub url: String,
    flaky: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ExternalSigningServer {
    /// Serve a signer for `root` on an ephemeral local port.
    pub async fn new(root: RootCa) -> ExternalSigningServer {
        let flaky = Arc::new(AtomicBool::new(false));
        let state = Arc::new(SignerState {
            root,
            flaky: flaky.clone(),
        });

        let app = Router::new()
            .route("/api/v1/cfssl/sign", post(sign_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/v1/cfssl/sign", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        ExternalSigningServer { url, flaky, handle }
    }

    /// Make every request fail with a server error.
    pub fn flake(&self) {
        self.flaky.store(true, Ordering::SeqCst);
    }

    /// Restore normal signing.
    pub fn deflake(&self) {
        self.flaky.store(false, Ordering::SeqCst);
    }

    /// Handle to the outage switch, for flipping from a spawned task.
    pub fn flake_switch(&self) -> Arc<AtomicBool> {
        self.flaky.clone()
    }
}

impl Drop for ExternalSigningServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn sign_handler(
    State(state): State<Arc<SignerState>>,
    Json(req): Json<CfsslSignRequest>,
) -> axum::response::Response {
    if state.flaky.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "signer outage").into_response();
    }

    // Issue under the subject the control plane prepared, like a real
    // cfssl signer with a subject override.
    let (common_name, role, organization) = match &req.subject {
        Some(subject) => {
            let name = subject.names.first();
            (
                subject.common_name.clone(),
                name.and_then(|n| NodeRole::from_organizational_unit(&n.organizational_unit))
                    .unwrap_or(NodeRole::Worker),
                name.map(|n| n.organization.clone()).unwrap_or_default(),
            )
        }
        None => (
            "external-node".to_string(),
            NodeRole::Worker,
            "external-org".to_string(),
        ),
    };

    match state
        .root
        .sign_csr(&req.certificate_request, &common_name, role, &organization)
    {
        Ok(certificate) => Json(CfsslSignResponse {
            success: true,
            result: Some(CfsslResult { certificate }),
            errors: Vec::new(),
        })
        .into_response(),
        Err(e) => Json(CfsslSignResponse {
            success: false,
            result: None,
            errors: vec![CfsslError {
                message: e.to_string(),
            }],
        })
        .into_response(),
    }
}

/// Make a fake node record for reconciliation tests. Nodes entering in
/// `Pending` or `Renew` carry a real CSR so the signing pool can pick
/// them up immediately.
pub fn fake_node(
    id: &str,
    state: swarm_ca::model::IssuanceState,
    tls_info: Option<NodeTlsInfo>,
    member: bool,
) -> Node {
    use swarm_ca::model::{
        IssuanceState, IssuanceStatus, NodeCertificate, NodeDescription, NodeSpec,
    };

    let csr = if matches!(state, IssuanceState::Pending | IssuanceState::Renew) {
        pki::generate_csr().unwrap().0
    } else {
        String::new()
    };

    Node {
        id: id.to_string(),
        spec: NodeSpec {
            membership: if member {
                Membership::Accepted
            } else {
                Membership::Pending
            },
            desired_role: NodeRole::Worker,
        },
        description: tls_info.map(|info| NodeDescription {
            tls_info: Some(info),
        }),
        certificate: NodeCertificate {
            csr,
            certificate: String::new(),
            role: NodeRole::Worker,
            status: IssuanceStatus {
                state,
                err: String::new(),
            },
        },
        ..Default::default()
    }
}
