//! Data model for the CA control plane
//!
//! These are the objects held in the replicated store: `Node` and `Cluster`.
//! Ownership of their fields is split between components:
//!
//! - `Node.certificate.status` is mutated only by the CA control plane
//!   (signing pool and reconcilers).
//! - `Node.description.tls_info` is reported only by the node agent and is
//!   the authoritative signal of which issuer the node currently presents.
//! - `Node.spec.membership` is changed only by operator RPCs.

use serde::{Deserialize, Serialize};

/// Role a node holds within the cluster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    /// Worker nodes run tasks.
    #[default]
    Worker,
    /// Manager nodes participate in the control plane.
    Manager,
}

impl NodeRole {
    /// The organizational unit recorded in certificates issued for this role.
    pub fn organizational_unit(self) -> &'static str {
        match self {
            NodeRole::Worker => "swarm-worker",
            NodeRole::Manager => "swarm-manager",
        }
    }

    /// Parse a role back out of a certificate OU field.
    pub fn from_organizational_unit(ou: &str) -> Option<Self> {
        match ou {
            "swarm-worker" => Some(NodeRole::Worker),
            "swarm-manager" => Some(NodeRole::Manager),
            _ => None,
        }
    }
}

/// Whether a node has been admitted to the cluster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Membership {
    /// Awaiting operator approval.
    #[default]
    Pending,
    /// Full cluster member.
    Accepted,
    /// Refused by an operator.
    Rejected,
}

/// Certificate issuance state for a node.
///
/// `Issued` and `Failed` are terminal for the issuance loop. During a root
/// rotation a node is only done once it is `Issued` *and* its reported TLS
/// info matches the rotation target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssuanceState {
    /// Waiting for the signing pool to pick the node up.
    #[default]
    Pending,
    /// A renewal CSR is waiting to be signed.
    Renew,
    /// The node has been told to rotate; the agent must submit a fresh CSR.
    Rotate,
    /// A certificate has been issued for the stored CSR.
    Issued,
    /// Issuance failed permanently (e.g. undecodable CSR).
    Failed,
}

/// Issuance state plus a human-readable failure reason.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceStatus {
    /// Current issuance state.
    pub state: IssuanceState,
    /// Set only when `state` is [`IssuanceState::Failed`].
    pub err: String,
}

impl IssuanceStatus {
    /// Status for a fresh, unprocessed CSR.
    pub fn pending() -> Self {
        IssuanceStatus::default()
    }

    /// Status for a successfully issued certificate.
    pub fn issued() -> Self {
        IssuanceStatus {
            state: IssuanceState::Issued,
            err: String::new(),
        }
    }

    /// Status for a permanent failure with the given reason.
    pub fn failed(err: impl Into<String>) -> Self {
        IssuanceStatus {
            state: IssuanceState::Failed,
            err: err.into(),
        }
    }
}

/// The certificate material tracked for a node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCertificate {
    /// PEM-encoded certificate signing request submitted by the node.
    pub csr: String,
    /// PEM-encoded issued certificate (leaf plus any intermediates).
    pub certificate: String,
    /// Role the certificate was (or will be) issued for.
    pub role: NodeRole,
    /// Where the certificate is in its issuance lifecycle.
    pub status: IssuanceStatus,
}

/// Issuer information observed from the certificate chain a node presents.
///
/// Reported by the node agent; ground truth for "which CA currently signs
/// this node".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTlsInfo {
    /// PEM bundle the node currently trusts.
    pub trust_root: String,
    /// Raw DER subject public key info of the node's certificate issuer.
    pub cert_issuer_public_key: Vec<u8>,
    /// Raw DER subject of the node's certificate issuer.
    pub cert_issuer_subject: Vec<u8>,
}

/// Agent-reported node description.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescription {
    /// Issuer info from the chain the node presents; absent until the
    /// agent first reports in.
    pub tls_info: Option<NodeTlsInfo>,
}

/// Operator-owned node configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Whether the node is admitted to the cluster.
    pub membership: Membership,
    /// Role the node should hold; applied to the certificate at the next
    /// issuance.
    pub desired_role: NodeRole,
}

/// Object version metadata, bumped by the store on every commit that
/// touches the object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Store commit index at which the object was last written.
    pub version: u64,
}

/// A cluster member (or membership candidate).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Opaque, server-assigned identity.
    pub id: String,
    /// Store versioning metadata.
    pub meta: Meta,
    /// Operator-owned configuration.
    pub spec: NodeSpec,
    /// Agent-reported state; absent until the agent first reports in.
    pub description: Option<NodeDescription>,
    /// Certificate material and issuance state.
    pub certificate: NodeCertificate,
}

impl Node {
    /// The TLS info the agent last reported, if any.
    pub fn tls_info(&self) -> Option<&NodeTlsInfo> {
        self.description.as_ref().and_then(|d| d.tls_info.as_ref())
    }
}

/// Join tokens for the two admission roles. Rotation replaces both
/// atomically.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTokens {
    /// Token admitting workers.
    pub worker: String,
    /// Token admitting managers.
    pub manager: String,
}

impl JoinTokens {
    /// The token admitting nodes with the given role.
    pub fn for_role(&self, role: NodeRole) -> &str {
        match role {
            NodeRole::Worker => &self.worker,
            NodeRole::Manager => &self.manager,
        }
    }
}

/// An in-progress root rotation. Present on the cluster iff a rotation is
/// underway; cleared by the rotation reconciler on completion.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRotation {
    /// PEM certificate of the root being rotated to.
    pub ca_cert: String,
    /// PEM key for the new root; empty when signing is external-only.
    pub ca_key: String,
    /// `ca_cert` cross-signed by the current root, so chains issued under
    /// the new root still validate for peers trusting only the old one.
    pub cross_signed_ca_cert: String,
}

/// The cluster's certificate authority material.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRootCa {
    /// PEM trust root served to nodes.
    pub ca_cert: String,
    /// PEM signing key; empty when signing is external-only.
    pub ca_key: String,
    /// Digest of `ca_cert`, in `sha256:<hex>` form.
    pub ca_cert_hash: String,
    /// Current admission tokens; replaced atomically on rotation.
    pub join_tokens: JoinTokens,
    /// The in-progress root rotation, if any.
    pub root_rotation: Option<RootRotation>,
}

/// Supported external signer protocols.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternalCaProtocol {
    /// The cfssl JSON signing API.
    #[default]
    Cfssl,
}

/// One external signer endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalCaSpec {
    /// Wire protocol the signer speaks.
    pub protocol: ExternalCaProtocol,
    /// Signing endpoint URL.
    pub url: String,
    /// PEM certificate of the root this signer issues under. Empty means
    /// the cluster's current (non-rotation) root.
    pub ca_cert: String,
}

/// Operator CA configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaConfig {
    /// External signers, grouped by the root they issue under.
    pub external_cas: Vec<ExternalCaSpec>,
}

/// Manager auto-lock configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Whether manager state is locked at rest behind an unlock key.
    pub auto_lock_managers: bool,
}

/// An at-rest encryption key for a cluster subsystem.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey {
    /// Subsystem the key belongs to, e.g. `swarm-manager`.
    pub subsystem: String,
    /// The key material.
    pub key: Vec<u8>,
}

/// Operator-owned cluster configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Certificate authority configuration.
    pub ca_config: CaConfig,
    /// Manager auto-lock configuration.
    pub encryption_config: EncryptionConfig,
}

/// The cluster object. The cluster ID doubles as the certificate
/// organization for every identity issued in it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster identity, also used as the certificate organization.
    pub id: String,
    /// Store versioning metadata.
    pub meta: Meta,
    /// Operator-owned configuration.
    pub spec: ClusterSpec,
    /// Certificate authority material.
    pub root_ca: ClusterRootCa,
    /// At-rest encryption keys, keyed by subsystem.
    pub unlock_keys: Vec<EncryptionKey>,
}

impl Cluster {
    /// The unlock key for the given subsystem, if one is set.
    pub fn unlock_key(&self, subsystem: &str) -> Option<&EncryptionKey> {
        self.unlock_keys.iter().find(|k| k.subsystem == subsystem)
    }
}
