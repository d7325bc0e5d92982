//! Integration tests for the CA RPC surface and server lifecycle.

mod common;

use std::time::Duration;

use tonic::{Code, Request};

use common::*;
use swarm_ca::model::{EncryptionKey, ExternalCaProtocol, ExternalCaSpec, NodeRole};
use swarm_ca::pki;
use swarm_ca::proto;
use swarm_ca::proto::ca_server::Ca;
use swarm_ca::proto::node_ca_server::NodeCa;
use swarm_ca::store::NodeFilter;

const INVALID_TOKEN_MSG: &str = "A valid join token is necessary to join this cluster";

fn issue_request(csr: &str, role: proto::NodeRole, token: &str) -> proto::IssueNodeCertificateRequest {
    proto::IssueNodeCertificateRequest {
        csr: csr.as_bytes().to_vec(),
        role: role as i32,
        token: token.to_string(),
    }
}

fn status_request(node_id: &str) -> proto::NodeCertificateStatusRequest {
    proto::NodeCertificateStatusRequest {
        node_id: node_id.to_string(),
    }
}

/// Issue a certificate with the worker token and wait for it to be signed.
async fn issue_and_wait(tc: &TestCa) -> (String, proto::NodeCertificateStatusResponse) {
    let (csr, _key) = pki::generate_csr().unwrap();
    let issued = tc
        .service
        .issue_node_certificate(Request::new(issue_request(
            &csr,
            proto::NodeRole::Worker,
            &tc.worker_token,
        )))
        .await
        .unwrap()
        .into_inner();
    assert!(!issued.node_id.is_empty());
    assert_eq!(issued.node_membership, proto::NodeMembership::Accepted as i32);

    let status = tc
        .service
        .node_certificate_status(Request::new(status_request(&issued.node_id)))
        .await
        .unwrap()
        .into_inner();
    (issued.node_id, status)
}

#[tokio::test]
async fn test_get_root_ca_certificate() {
    let tc = TestCa::new().await;

    let resp = tc
        .service
        .get_root_ca_certificate(Request::new(proto::GetRootCaCertificateRequest {}))
        .await
        .unwrap()
        .into_inner();

    assert!(!resp.certificate.is_empty());
    assert_eq!(
        String::from_utf8(resp.certificate).unwrap(),
        tc.root_ca.certs_pem()
    );
}

#[tokio::test]
async fn test_restart_root_ca() {
    let mut tc = TestCa::new().await;

    let err = tc
        .service
        .node_certificate_status(Request::new(status_request("foo")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    tc.stop().await;
    tc.start().await;

    let err = tc
        .service
        .node_certificate_status(Request::new(status_request("foo")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_issue_node_certificate() {
    let tc = TestCa::new().await;

    let (node_id, status) = issue_and_wait(&tc).await;

    let cert = status.certificate.unwrap();
    assert_eq!(
        status.status.unwrap().state,
        proto::IssuanceState::Issued as i32
    );
    assert!(!cert.certificate.is_empty());
    assert_eq!(cert.role, proto::NodeRole::Worker as i32);

    // Exactly one node record was created for the call.
    let nodes = tc.store.view(|tx| tx.find_nodes(NodeFilter::All)).await;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].id, node_id);

    // The issued certificate chains to the serving root and carries the
    // node identity.
    let issued_pem = String::from_utf8(cert.certificate).unwrap();
    let parsed = tc.root_ca.parse_validate(&issued_pem).unwrap();
    assert_eq!(parsed.node_id, node_id);
    assert_eq!(parsed.organization, tc.organization);
    assert_eq!(parsed.role, NodeRole::Worker);
}

#[tokio::test]
async fn test_issue_node_certificate_with_invalid_csr() {
    let tc = TestCa::new().await;

    let issued = tc
        .service
        .issue_node_certificate(Request::new(issue_request(
            "random garbage",
            proto::NodeRole::Worker,
            &tc.worker_token,
        )))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(issued.node_membership, proto::NodeMembership::Accepted as i32);

    let status = tc
        .service
        .node_certificate_status(Request::new(status_request(&issued.node_id)))
        .await
        .unwrap()
        .into_inner();

    let cert = status.certificate.unwrap();
    let status = status.status.unwrap();
    assert_eq!(status.state, proto::IssuanceState::Failed as i32);
    assert!(
        status.err.contains("CSR Decode failed"),
        "unexpected failure message: {}",
        status.err
    );
    assert!(cert.certificate.is_empty());
}

#[tokio::test]
async fn test_issue_node_certificate_with_empty_csr() {
    let tc = TestCa::new().await;

    let err = tc
        .service
        .issue_node_certificate(Request::new(issue_request(
            "",
            proto::NodeRole::Worker,
            &tc.worker_token,
        )))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_force_rotation_is_noop() {
    let tc = TestCa::new().await;

    let (node_id, status) = issue_and_wait(&tc).await;
    let original_cert = status.certificate.unwrap().certificate;
    assert!(!original_cert.is_empty());

    // Externally flip the node to Rotate without a new CSR; the server
    // must not re-issue anything.
    {
        let node_id = node_id.clone();
        tc.store
            .update(move |tx| {
                let mut node = tx.get_node(&node_id).unwrap();
                node.certificate.status.state = swarm_ca::model::IssuanceState::Rotate;
                tx.update_node(node)
            })
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(250)).await;

    let status = tc
        .service
        .node_certificate_status(Request::new(status_request(&node_id)))
        .await
        .unwrap()
        .into_inner();
    let cert = status.certificate.unwrap();
    assert_eq!(cert.certificate, original_cert);
    assert_eq!(
        status.status.unwrap().state,
        proto::IssuanceState::Rotate as i32
    );
    assert_eq!(cert.role, proto::NodeRole::Worker as i32);
}

#[tokio::test]
async fn test_worker_renewal() {
    let tc = TestCa::new().await;
    let (node_id, _) = issue_and_wait(&tc).await;

    let (csr, _key) = pki::generate_csr().unwrap();
    let renewed = tc
        .service
        .issue_node_certificate(request_as(
            issue_request(&csr, proto::NodeRole::Worker, ""),
            tc.worker_identity(&node_id),
        ))
        .await
        .unwrap()
        .into_inner();
    // Renewal reuses the existing node ID.
    assert_eq!(renewed.node_id, node_id);

    let status = tc
        .service
        .node_certificate_status(Request::new(status_request(&node_id)))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        status.status.unwrap().state,
        proto::IssuanceState::Issued as i32
    );
    assert_eq!(
        status.certificate.unwrap().role,
        proto::NodeRole::Worker as i32
    );
}

#[tokio::test]
async fn test_manager_renewal_without_token() {
    let tc = TestCa::new().await;

    // Admit a manager first.
    let (csr, _key) = pki::generate_csr().unwrap();
    let issued = tc
        .service
        .issue_node_certificate(Request::new(issue_request(
            &csr,
            proto::NodeRole::Manager,
            &tc.manager_token,
        )))
        .await
        .unwrap()
        .into_inner();

    // Renew with the manager identity and no token.
    let (csr, _key) = pki::generate_csr().unwrap();
    let renewed = tc
        .service
        .issue_node_certificate(request_as(
            issue_request(&csr, proto::NodeRole::Manager, ""),
            tc.manager_identity(&issued.node_id),
        ))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(renewed.node_id, issued.node_id);

    let status = tc
        .service
        .node_certificate_status(Request::new(status_request(&issued.node_id)))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        status.status.unwrap().state,
        proto::IssuanceState::Issued as i32
    );
    assert_eq!(
        status.certificate.unwrap().role,
        proto::NodeRole::Manager as i32
    );
}

#[tokio::test]
async fn test_renewal_applies_desired_role() {
    let tc = TestCa::new().await;

    let (csr, _key) = pki::generate_csr().unwrap();
    let issued = tc
        .service
        .issue_node_certificate(Request::new(issue_request(
            &csr,
            proto::NodeRole::Manager,
            &tc.manager_token,
        )))
        .await
        .unwrap()
        .into_inner();
    let node_id = issued.node_id;

    // Operator demotes the node; the change lands on the next renewal.
    {
        let node_id = node_id.clone();
        tc.store
            .update(move |tx| {
                let mut node = tx.get_node(&node_id).unwrap();
                node.spec.desired_role = NodeRole::Worker;
                tx.update_node(node)
            })
            .await
            .unwrap();
    }

    let (csr, _key) = pki::generate_csr().unwrap();
    tc.service
        .issue_node_certificate(request_as(
            issue_request(&csr, proto::NodeRole::Manager, ""),
            tc.manager_identity(&node_id),
        ))
        .await
        .unwrap();

    poll_until(Duration::from_secs(5), || {
        let service = tc.service.clone();
        let node_id = node_id.clone();
        async move {
            let status = service
                .node_certificate_status(Request::new(status_request(&node_id)))
                .await
                .map_err(|e| e.to_string())?
                .into_inner();
            let cert = status.certificate.unwrap();
            if status.status.unwrap().state != proto::IssuanceState::Issued as i32 {
                return Err("not issued yet".into());
            }
            if cert.role != proto::NodeRole::Worker as i32 {
                return Err(format!("role not demoted yet: {}", cert.role));
            }
            Ok(())
        }
    })
    .await;
}

#[tokio::test]
async fn test_worker_cannot_renew_into_manager() {
    let tc = TestCa::new().await;
    let (node_id, _) = issue_and_wait(&tc).await;

    let (csr, _key) = pki::generate_csr().unwrap();
    let err = tc
        .service
        .issue_node_certificate(request_as(
            issue_request(&csr, proto::NodeRole::Manager, ""),
            tc.worker_identity(&node_id),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
}

#[tokio::test]
async fn test_cross_org_renewal_requires_token() {
    let tc = TestCa::new().await;
    let (csr, _key) = pki::generate_csr().unwrap();

    let foreign = CallerIdentityForeign::new();

    // Without a token the request fails and nothing is persisted.
    let err = tc
        .service
        .issue_node_certificate(request_as(
            issue_request(&csr, proto::NodeRole::Worker, ""),
            foreign.identity.clone(),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
    let nodes = tc.store.view(|tx| tx.find_nodes(NodeFilter::All)).await;
    assert!(nodes.is_empty());

    // With a valid join token the caller is admitted as a new node.
    let issued = tc
        .service
        .issue_node_certificate(request_as(
            issue_request(&csr, proto::NodeRole::Worker, &tc.worker_token),
            foreign.identity,
        ))
        .await
        .unwrap()
        .into_inner();
    assert_ne!(issued.node_id, foreign.node_id);
}

/// A TLS identity from some other cluster.
struct CallerIdentityForeign {
    node_id: String,
    identity: swarm_ca::server::CallerIdentity,
}

impl CallerIdentityForeign {
    fn new() -> Self {
        let node_id = pki::generate_id();
        CallerIdentityForeign {
            identity: swarm_ca::server::CallerIdentity {
                node_id: node_id.clone(),
                organization: "some-other-cluster".to_string(),
                role: NodeRole::Worker,
            },
            node_id,
        }
    }
}

#[tokio::test]
async fn test_new_node_certificate_requires_token() {
    let tc = TestCa::new().await;
    let (csr, _key) = pki::generate_csr().unwrap();

    // No token.
    for role in [proto::NodeRole::Manager, proto::NodeRole::Worker] {
        let err = tc
            .service
            .issue_node_certificate(Request::new(issue_request(&csr, role, "")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
        assert_eq!(err.message(), INVALID_TOKEN_MSG);
    }

    // Wrong token.
    for role in [proto::NodeRole::Manager, proto::NodeRole::Worker] {
        let err = tc
            .service
            .issue_node_certificate(Request::new(issue_request(&csr, role, "invalid-secret")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
        assert_eq!(err.message(), INVALID_TOKEN_MSG);
    }

    // Correct tokens.
    tc.service
        .issue_node_certificate(Request::new(issue_request(
            &csr,
            proto::NodeRole::Manager,
            &tc.manager_token,
        )))
        .await
        .unwrap();
    tc.service
        .issue_node_certificate(Request::new(issue_request(
            &csr,
            proto::NodeRole::Worker,
            &tc.worker_token,
        )))
        .await
        .unwrap();

    // Rotate both join tokens.
    let new_worker_token = tc.root_ca.generate_join_token();
    let new_manager_token = tc.root_ca.generate_join_token();
    {
        let (worker, manager) = (new_worker_token.clone(), new_manager_token.clone());
        tc.store
            .update(move |tx| {
                let mut cluster = tx.get_cluster().unwrap();
                cluster.root_ca.join_tokens.worker = worker;
                cluster.root_ca.join_tokens.manager = manager;
                tx.update_cluster(cluster)
            })
            .await
            .unwrap();
    }

    // Old tokens are rejected within a bounded delay; new ones accepted.
    poll_until(Duration::from_secs(5), || {
        let service = tc.service.clone();
        let csr = csr.clone();
        let old_token = tc.manager_token.clone();
        async move {
            match service
                .issue_node_certificate(Request::new(issue_request(
                    &csr,
                    proto::NodeRole::Manager,
                    &old_token,
                )))
                .await
            {
                Err(status) if status.code() == Code::Unauthenticated => Ok(()),
                Err(status) => Err(format!("unexpected error: {status}")),
                Ok(_) => Err("join token not updated yet".to_string()),
            }
        }
    })
    .await;

    let err = tc
        .service
        .issue_node_certificate(Request::new(issue_request(
            &csr,
            proto::NodeRole::Worker,
            &tc.worker_token,
        )))
        .await
        .unwrap_err();
    assert_eq!(err.message(), INVALID_TOKEN_MSG);

    tc.service
        .issue_node_certificate(Request::new(issue_request(
            &csr,
            proto::NodeRole::Manager,
            &new_manager_token,
        )))
        .await
        .unwrap();
    tc.service
        .issue_node_certificate(Request::new(issue_request(
            &csr,
            proto::NodeRole::Worker,
            &new_worker_token,
        )))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_get_unlock_key() {
    let tc = TestCa::new().await;

    // Requires a manager identity.
    let err = tc
        .service
        .get_unlock_key(request_as(
            proto::GetUnlockKeyRequest {},
            tc.worker_identity("w1"),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    // Auto-lock disabled: no key, but the cluster version is reported.
    let cluster = tc.store.view(|tx| tx.get_cluster()).await.unwrap();
    let resp = tc
        .service
        .get_unlock_key(request_as(
            proto::GetUnlockKeyRequest {},
            tc.manager_identity("m1"),
        ))
        .await
        .unwrap()
        .into_inner();
    assert!(resp.unlock_key.is_empty());
    assert_eq!(resp.version.unwrap().index, cluster.meta.version);

    // Turn on auto-lock with a key.
    tc.store
        .update(|tx| {
            let mut cluster = tx.get_cluster().unwrap();
            cluster.spec.encryption_config.auto_lock_managers = true;
            cluster.unlock_keys = vec![EncryptionKey {
                subsystem: NodeRole::Manager.organizational_unit().to_string(),
                key: b"secret".to_vec(),
            }];
            tx.update_cluster(cluster)
        })
        .await
        .unwrap();
    let cluster = tc.store.view(|tx| tx.get_cluster()).await.unwrap();

    poll_until(Duration::from_millis(250), || {
        let service = tc.service.clone();
        let identity = tc.manager_identity("m1");
        let expected_version = cluster.meta.version;
        async move {
            let resp = service
                .get_unlock_key(request_as(proto::GetUnlockKeyRequest {}, identity))
                .await
                .map_err(|e| format!("get unlock key: {e}"))?
                .into_inner();
            if resp.unlock_key != b"secret" {
                return Err("secret hasn't rotated yet".to_string());
            }
            if resp.version.unwrap().index < expected_version {
                return Err("hasn't updated to the right version yet".to_string());
            }
            Ok(())
        }
    })
    .await;
}

#[tokio::test]
async fn test_update_root_ca_aborts_without_swap_when_persistence_fails() {
    let mut tc = TestCa::new().await;
    tc.stop().await;

    // Replace the certificates directory with a plain file so the trust
    // root can no longer be persisted.
    let certs_dir = tc.state_dir.path().join("certificates");
    if tokio::fs::metadata(&certs_dir).await.is_ok() {
        tokio::fs::remove_dir_all(&certs_dir).await.unwrap();
    }
    tokio::fs::write(&certs_dir, b"not a directory").await.unwrap();

    // An otherwise valid new root arrives on the cluster.
    let new_root = pki::RootCa::generate("would-be root").unwrap();
    let mut cluster = tc.store.view(|tx| tx.get_cluster()).await.unwrap();
    cluster.root_ca.ca_cert = new_root.certs_pem().to_string();
    cluster.root_ca.ca_key = new_root.signer().unwrap().key_pem().to_string();

    let result = tc.server.update_root_ca(&cluster).await;
    assert!(result.is_err(), "persistence failure must surface an error");

    // The live configuration still serves the previous root.
    let snapshot = tc.security.snapshot().await;
    assert_eq!(snapshot.root_ca.certs_pem(), tc.root_ca.certs_pem());
}

#[tokio::test]
async fn test_issue_node_certificate_broken_external_ca() {
    let tc = TestCa::new().await;
    let external = ExternalSigningServer::new(tc.root_ca.clone()).await;

    // Point the cluster at the external signer.
    {
        let url = external.url.clone();
        tc.store
            .update(move |tx| {
                let mut cluster = tx.get_cluster().unwrap();
                cluster.spec.ca_config.external_cas = vec![ExternalCaSpec {
                    protocol: ExternalCaProtocol::Cfssl,
                    url,
                    ca_cert: String::new(),
                }];
                tx.update_cluster(cluster)
            })
            .await
            .unwrap();
    }

    // Break the signer, then restore it shortly after; issuance must ride
    // out the outage without ever reporting failure.
    external.flake();
    let switch = external.flake_switch();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        switch.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    let (csr, _key) = pki::generate_csr().unwrap();
    let issued = tc
        .service
        .issue_node_certificate(Request::new(issue_request(
            &csr,
            proto::NodeRole::Worker,
            &tc.worker_token,
        )))
        .await
        .unwrap()
        .into_inner();

    poll_until(Duration::from_secs(5), || {
        let service = tc.service.clone();
        let node_id = issued.node_id.clone();
        async move {
            let status = service
                .node_certificate_status(Request::new(status_request(&node_id)))
                .await
                .map_err(|e| e.to_string())?
                .into_inner();
            let state = status.status.unwrap();
            if state.state == proto::IssuanceState::Failed as i32 {
                return Err(format!("transient outage became permanent: {}", state.err));
            }
            if state.state != proto::IssuanceState::Issued as i32 {
                return Err("not issued yet".to_string());
            }
            Ok(())
        }
    })
    .await;

    // The externally issued certificate carries the prepared node identity
    // just like a locally signed one.
    let status = tc
        .service
        .node_certificate_status(Request::new(status_request(&issued.node_id)))
        .await
        .unwrap()
        .into_inner();
    let issued_pem = String::from_utf8(status.certificate.unwrap().certificate).unwrap();
    let parsed = tc.root_ca.parse_validate(&issued_pem).unwrap();
    assert_eq!(parsed.node_id, issued.node_id);
    assert_eq!(parsed.organization, tc.organization);
    assert_eq!(parsed.role, NodeRole::Worker);
}

#[tokio::test]
async fn test_rotate_node_with_fresh_csr_is_signed() {
    let tc = TestCa::new().await;

    // An agent answering a rotate command has written its fresh CSR while
    // the node is still in the Rotate state.
    let (csr, _key) = pki::generate_csr().unwrap();
    let mut node = fake_node(
        "rotating-node",
        swarm_ca::model::IssuanceState::Rotate,
        None,
        true,
    );
    node.certificate.csr = csr;
    put_node(&tc.store, node).await;

    poll_until(Duration::from_secs(5), || {
        let store = tc.store.clone();
        async move {
            let node = store
                .view(|tx| tx.get_node("rotating-node"))
                .await
                .ok_or_else(|| "node missing".to_string())?;
            if node.certificate.status.state != swarm_ca::model::IssuanceState::Issued {
                return Err(format!(
                    "not issued yet: {:?}",
                    node.certificate.status.state
                ));
            }
            if node.certificate.certificate.is_empty() {
                return Err("no certificate recorded".to_string());
            }
            Ok(())
        }
    })
    .await;

    let node = tc
        .store
        .view(|tx| tx.get_node("rotating-node"))
        .await
        .unwrap();
    let parsed = tc.root_ca.parse_validate(&node.certificate.certificate).unwrap();
    assert_eq!(parsed.node_id, "rotating-node");
    assert_eq!(parsed.role, NodeRole::Worker);
}
