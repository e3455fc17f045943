// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Custom resource kinds persisted in the cluster store.
//!
//! Three kinds model the mesh: a [`Device`] is a registered machine, a
//! [`WireguardIp`] is one allocated mesh address, and a [`WireguardIpPool`]
//! is the CIDR range addresses are allocated from. Private keys live in
//! plain `Secret` objects referenced by name.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A machine registered into the mesh.
///
/// The object name is the device id. `secret_ref` and `wireguard_ip_ref`
/// are set once at creation and never change afterwards.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleetwire.dev",
    version = "v1alpha1",
    kind = "Device",
    plural = "devices",
    status = "DeviceStatus",
    namespaced,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    /// Name of the secret holding this device's wireguard private key.
    pub secret_ref: String,
    /// Name of the [`WireguardIp`] assigned to this device.
    pub wireguard_ip_ref: String,
}

/// Observed state of a [`Device`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Whether the device has completed registration.
    pub registered: bool,
    /// Base64 wireguard public key of the device.
    pub public_key: String,
}

/// One allocated mesh address.
///
/// Named deterministically from the address itself (see
/// [`ip_object_name`]), which makes creation idempotent.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleetwire.dev",
    version = "v1alpha1",
    kind = "WireguardIp",
    plural = "wireguardips",
    status = "WireguardIpStatus",
    namespaced,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct WireguardIpSpec {
    /// Id of the device holding this address.
    pub device_ref: String,
    /// Name of the pool this address was allocated from.
    pub pool_ref: String,
    /// The address itself, in textual form.
    pub ip_address: String,
}

/// Observed state of a [`WireguardIp`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireguardIpStatus {
    /// Whether the address is live in the mesh.
    pub active: bool,
}

/// A CIDR range mesh addresses are allocated from.
///
/// One pool is active per namespace. The server derives its own identity
/// from the pool: the address part of the CIDR becomes the server's mesh
/// address and the pool secret holds the server's private key.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleetwire.dev",
    version = "v1alpha1",
    kind = "WireguardIpPool",
    plural = "wireguardippools",
    status = "WireguardIpPoolStatus",
    namespaced,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct WireguardIpPoolSpec {
    /// Pool range as `address/prefix`, e.g. `10.0.0.1/24`. The address part
    /// is the server's own mesh address.
    pub cidr: String,
}

/// Observed state of a [`WireguardIpPool`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireguardIpPoolStatus {
    /// Whether the server has bootstrapped this pool.
    pub created: bool,
    /// Name of the secret holding the server's private key.
    pub secret_ref: String,
    /// Base64 wireguard public key of the server.
    pub public_key: String,
    /// Count of addresses handed out so far. Monotonic; addresses are
    /// never reclaimed.
    pub used_addresses: u32,
}

/// Deterministic store object name for an address.
///
/// Replaces the separators of the textual form with `-` so the result is a
/// valid object name. `10.0.0.3` becomes `10-0-0-3`.
pub fn ip_object_name(ip: &str) -> String {
    ip.chars()
        .map(|c| match c {
            '.' | ':' => '-',
            c => c,
        })
        .collect()
}
