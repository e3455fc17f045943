//! The fleetwire control plane server.
//!
//! Devices call one gRPC method, `Registrar/Register`, and get back a full
//! mesh identity: an address from the active pool, a wireguard keypair, the
//! server's public key and a cluster join token. State lives in the cluster
//! store as custom resources, so a restarted server rebuilds the entire
//! mesh from what it finds there.

pub mod alloc;
pub mod config;
pub mod mesh;
pub mod registry;
pub mod rpc;
pub mod runner;
pub mod store;
pub mod tokens;
