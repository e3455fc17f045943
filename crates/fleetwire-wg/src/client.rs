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

//! Client-mode interface configuration, used on devices after they have
//! registered with the mesh server.

use std::net::{IpAddr, SocketAddr};

use tracing::info;

use fleetwire_types::{PrivateKey, PublicKey};

use crate::platform::{PeerSpec, WgApi, ensure_interface};

/// Everything a device needs to join the mesh as a client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub private_key: PrivateKey,
    pub address: IpAddr,
    pub server_public_key: PublicKey,
    pub server_endpoint: SocketAddr,
}

/// Configure the local interface as a mesh client.
///
/// The server becomes the only peer and routes the whole mesh
/// (allowed IPs `0.0.0.0/0`); the device holds its assigned address as a
/// host route. Returns the interface name that was configured.
pub async fn start_client<W: WgApi>(wg: &W, config: &ClientConfig) -> Result<String, crate::WgError> {
    let interface = ensure_interface(wg).await?;

    wg.set_device_config(&interface, &config.private_key, None).await?;

    let server_peer = PeerSpec {
        public_key: config.server_public_key,
        allowed_ips: vec![(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)],
        endpoint: Some(config.server_endpoint),
        persistent_keepalive: crate::PERSISTENT_KEEPALIVE,
    };
    wg.replace_peers(&interface, std::slice::from_ref(&server_peer)).await?;

    wg.assign_address(&interface, config.address, host_prefix(config.address)).await?;
    wg.link_up(&interface).await?;

    info!(interface = %interface, endpoint = %config.server_endpoint, "client configuration applied");
    Ok(interface)
}

fn host_prefix(addr: IpAddr) -> u8 {
    if addr.is_ipv4() { 32 } else { 128 }
}
