//! swarm-ca - Certificate authority control plane for the Swarm cluster
//! orchestrator
//!
//! The CA control plane issues, renews and rotates X.509 identities for
//! cluster members, and drives root CA rotation as an online, cluster-wide
//! background process.
//!
//! # Architecture
//!
//! All durable state lives in the replicated store façade; the CA server
//! and its reconcilers are written as idempotent operators over that state,
//! so several servers (e.g. across a leadership handoff) converge instead
//! of conflicting:
//!
//! - Nodes join with a role-specific join token; a bounded signing pool
//!   turns their CSRs into certificates.
//! - Renewals reuse the caller's TLS identity, with no token required.
//! - A root rotation is recorded on the cluster object; a reconciliation
//!   loop tells members to rotate in bounded batches and swaps the cluster
//!   root once every member presents the new issuer.
//!
//! # Modules
//!
//! - [`model`] - Node and cluster objects held in the store
//! - [`store`] - In-memory store façade with transactions and events
//! - [`pki`] - Root CA operations: signing, cross-signing, join tokens
//! - [`security`] - Hot-swappable holder of the active signing material
//! - [`server`] - The CA gRPC surface, signing pool and reconcilers
//! - [`proto`] - Generated gRPC definitions
//! - [`error`] - Error types for the control plane

#![deny(missing_docs)]

pub mod error;
pub mod model;
pub mod pki;
pub mod proto;
pub mod security;
pub mod server;
pub mod store;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Upper bound on the number of nodes one root-rotation reconciliation
/// pass newly transitions to the `Rotate` state. Remaining nodes are
/// commanded on later passes as earlier ones converge.
pub const ISSUANCE_STATE_ROTATE_MAX_BATCH_SIZE: usize = 64;

/// Validity period for issued node certificates, in days.
pub const DEFAULT_NODE_CERT_EXPIRATION_DAYS: i64 = pki::NODE_CERT_VALIDITY_DAYS;
