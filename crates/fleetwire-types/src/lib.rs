//! fleetwire-types: Shared type definitions for the fleetwire control plane.
//!
//! This crate contains the custom resource kinds persisted in the cluster
//! store and the wireguard key material types shared between the server and
//! the device agent.

#![warn(missing_docs)]

pub mod key;
pub mod resources;

pub use key::{KeyError, PrivateKey, PublicKey};
pub use resources::{
    Device, DeviceSpec, DeviceStatus, WireguardIp, WireguardIpPool, WireguardIpPoolSpec,
    WireguardIpPoolStatus, WireguardIpSpec, WireguardIpStatus, ip_object_name,
};
