//! gRPC protocol definitions for the CA control plane
//!
//! Generated Protobuf and gRPC code for the `CA` and `NodeCA` services.
//! Nodes call `NodeCA` to join the cluster and renew their certificates;
//! `CA` serves cluster-level trust material.

#![allow(missing_docs)] // Generated code doesn't have docs

/// Generated protobuf and gRPC code for certificate issuance
pub mod ca {
    /// Version 1 of the CA protocol
    pub mod v1 {
        tonic::include_proto!("swarm.ca.v1");
    }
}

// Re-export commonly used types at the module level for convenience
pub use ca::v1::*;
