//! gRPC protocol definitions for device registration.
//!
//! Devices call the unary `Registrar/Register` method with their persisted
//! id (empty on first boot) and the shared fleet token, and receive the
//! wireguard identity and cluster join credentials in return.

#![allow(missing_docs)] // Generated code doesn't have docs

/// Generated protobuf and gRPC code for the registration protocol.
pub mod v1 {
    tonic::include_proto!("fleetwire.v1");
}

pub use v1::*;
