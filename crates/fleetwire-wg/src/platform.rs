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

use std::future::Future;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;
use tracing::{info, warn};

use fleetwire_types::{KeyError, PrivateKey, PublicKey};

#[derive(Debug, Error)]
pub enum WgError {
    #[error("not supported on this platform")]
    Unsupported,

    #[error("wireguard interface error: {0}")]
    Interface(String),

    #[error("found {0} wireguard interfaces, only one is supported")]
    MultipleInterfaces(usize),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("IP address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One wireguard peer as handed to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    pub public_key: PublicKey,
    pub allowed_ips: Vec<(IpAddr, u8)>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: u16,
}

/// Handle on one kernel's wireguard state.
///
/// `add_peer` issues a single additive configure call per peer, so
/// concurrent adds for distinct peers never clobber each other; only
/// `replace_peers` and `flush_peers` rewrite the whole set.
pub trait WgApi: Send + Sync {
    fn list_interfaces(&self) -> impl Future<Output = Result<Vec<String>, WgError>> + Send;
    fn create_interface(&self, name: &str) -> impl Future<Output = Result<(), WgError>> + Send;
    fn private_key(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<PrivateKey>, WgError>> + Send;
    fn set_device_config(
        &self,
        name: &str,
        key: &PrivateKey,
        listen_port: Option<u16>,
    ) -> impl Future<Output = Result<(), WgError>> + Send;
    fn add_peer(
        &self,
        name: &str,
        peer: &PeerSpec,
    ) -> impl Future<Output = Result<(), WgError>> + Send;
    fn replace_peers(
        &self,
        name: &str,
        peers: &[PeerSpec],
    ) -> impl Future<Output = Result<(), WgError>> + Send;
    fn flush_peers(&self, name: &str) -> impl Future<Output = Result<(), WgError>> + Send;
    fn assign_address(
        &self,
        name: &str,
        addr: IpAddr,
        prefix: u8,
    ) -> impl Future<Output = Result<(), WgError>> + Send;
    fn remove_address(
        &self,
        name: &str,
        addr: IpAddr,
    ) -> impl Future<Output = Result<(), WgError>> + Send;
    fn link_up(&self, name: &str) -> impl Future<Output = Result<(), WgError>> + Send;
}

#[cfg(target_os = "linux")]
pub type CurrentWg = linux::LinuxWg;

#[cfg(not(target_os = "linux"))]
pub type CurrentWg = StubWg;

/// Adopt the host's wireguard interface, creating one when none exists.
///
/// More than one interface is refused rather than guessed at.
pub async fn ensure_interface<W: WgApi>(wg: &W) -> Result<String, WgError> {
    let mut names = wg.list_interfaces().await?;
    match names.len() {
        0 => {
            info!(interface = crate::DEFAULT_INTERFACE, "creating wireguard interface");
            wg.create_interface(crate::DEFAULT_INTERFACE).await?;
            Ok(crate::DEFAULT_INTERFACE.to_string())
        }
        1 => Ok(names.remove(0)),
        n => {
            warn!(count = n, "refusing to pick between wireguard interfaces");
            Err(WgError::MultipleInterfaces(n))
        }
    }
}

// -- Stub for non-Linux --

#[derive(Debug, Default)]
pub struct StubWg;

impl WgApi for StubWg {
    async fn list_interfaces(&self) -> Result<Vec<String>, WgError> {
        Err(WgError::Unsupported)
    }

    async fn create_interface(&self, _name: &str) -> Result<(), WgError> {
        Err(WgError::Unsupported)
    }

    async fn private_key(&self, _name: &str) -> Result<Option<PrivateKey>, WgError> {
        Err(WgError::Unsupported)
    }

    async fn set_device_config(
        &self,
        _name: &str,
        _key: &PrivateKey,
        _listen_port: Option<u16>,
    ) -> Result<(), WgError> {
        Err(WgError::Unsupported)
    }

    async fn add_peer(&self, _name: &str, _peer: &PeerSpec) -> Result<(), WgError> {
        Err(WgError::Unsupported)
    }

    async fn replace_peers(&self, _name: &str, _peers: &[PeerSpec]) -> Result<(), WgError> {
        Err(WgError::Unsupported)
    }

    async fn flush_peers(&self, _name: &str) -> Result<(), WgError> {
        Err(WgError::Unsupported)
    }

    async fn assign_address(&self, _name: &str, _addr: IpAddr, _prefix: u8) -> Result<(), WgError> {
        Err(WgError::Unsupported)
    }

    async fn remove_address(&self, _name: &str, _addr: IpAddr) -> Result<(), WgError> {
        Err(WgError::Unsupported)
    }

    async fn link_up(&self, _name: &str) -> Result<(), WgError> {
        Err(WgError::Unsupported)
    }
}

// -- Linux implementation --

#[cfg(target_os = "linux")]
pub mod linux {
    use std::net::IpAddr;

    use futures::TryStreamExt;
    use tracing::{debug, info};
    use wireguard_uapi::{DeviceInterface, RouteSocket, WgSocket, set};

    use fleetwire_types::PrivateKey;

    use super::{PeerSpec, WgApi, WgError};

    #[derive(Debug, Default)]
    pub struct LinuxWg;

    impl WgApi for LinuxWg {
        async fn list_interfaces(&self) -> Result<Vec<String>, WgError> {
            let mut route = RouteSocket::connect()
                .map_err(|e| WgError::Interface(e.to_string()))?;
            route.list_device_names()
                .map_err(|e| WgError::Interface(e.to_string()))
        }

        async fn create_interface(&self, name: &str) -> Result<(), WgError> {
            let mut route = RouteSocket::connect()
                .map_err(|e| WgError::Interface(e.to_string()))?;
            route.add_device(name)
                .map_err(|e| WgError::Interface(e.to_string()))?;
            info!(interface = name, "created wireguard interface");
            Ok(())
        }

        async fn private_key(&self, name: &str) -> Result<Option<PrivateKey>, WgError> {
            let mut wg = WgSocket::connect()
                .map_err(|e| WgError::Interface(e.to_string()))?;
            let device = wg.get_device(DeviceInterface::from_name(name))
                .map_err(|e| WgError::Interface(e.to_string()))?;
            Ok(device.private_key.map(PrivateKey::from))
        }

        async fn set_device_config(
            &self,
            name: &str,
            key: &PrivateKey,
            listen_port: Option<u16>,
        ) -> Result<(), WgError> {
            let mut dev = set::Device::from_ifname(name).private_key(key.as_bytes());
            if let Some(port) = listen_port {
                dev = dev.listen_port(port);
            }

            let mut wg = WgSocket::connect()
                .map_err(|e| WgError::Interface(e.to_string()))?;
            wg.set_device(dev)
                .map_err(|e| WgError::Interface(e.to_string()))?;

            debug!(interface = name, listen_port, "applied device key config");
            Ok(())
        }

        async fn add_peer(&self, name: &str, peer: &PeerSpec) -> Result<(), WgError> {
            // No ReplacePeers flag on the device: this is an additive update.
            let dev = set::Device::from_ifname(name).peers(vec![build_peer(peer)]);

            let mut wg = WgSocket::connect()
                .map_err(|e| WgError::Interface(e.to_string()))?;
            wg.set_device(dev)
                .map_err(|e| WgError::Interface(e.to_string()))?;

            debug!(interface = name, peer = %peer.public_key, "added peer");
            Ok(())
        }

        async fn replace_peers(&self, name: &str, peers: &[PeerSpec]) -> Result<(), WgError> {
            let set_peers: Vec<set::Peer<'_>> = peers.iter().map(build_peer).collect();
            let dev = set::Device::from_ifname(name)
                .flags(vec![set::WgDeviceF::ReplacePeers])
                .peers(set_peers);

            let mut wg = WgSocket::connect()
                .map_err(|e| WgError::Interface(e.to_string()))?;
            wg.set_device(dev)
                .map_err(|e| WgError::Interface(e.to_string()))?;

            debug!(interface = name, peer_count = peers.len(), "replaced peer set");
            Ok(())
        }

        async fn flush_peers(&self, name: &str) -> Result<(), WgError> {
            self.replace_peers(name, &[]).await?;
            info!(interface = name, "flushed peers");
            Ok(())
        }

        async fn assign_address(&self, name: &str, addr: IpAddr, prefix: u8) -> Result<(), WgError> {
            let (conn, handle, _) = rtnetlink::new_connection()
                .map_err(WgError::Io)?;
            tokio::spawn(conn);

            let index = get_link_index(&handle, name).await?;

            // Flush existing addresses
            let existing: Vec<_> = handle
                .address()
                .get()
                .set_link_index_filter(index)
                .execute()
                .try_collect()
                .await
                .map_err(|e| WgError::Interface(e.to_string()))?;

            for addr_msg in existing {
                handle
                    .address()
                    .del(addr_msg)
                    .execute()
                    .await
                    .map_err(|e| WgError::Interface(e.to_string()))?;
            }
            debug!(interface = name, "flushed existing addresses");

            // Add new address
            handle
                .address()
                .add(index, addr, prefix)
                .execute()
                .await
                .map_err(|e| WgError::Interface(e.to_string()))?;

            info!(interface = name, %addr, prefix, "assigned address via netlink");
            Ok(())
        }

        async fn remove_address(&self, name: &str, addr: IpAddr) -> Result<(), WgError> {
            use rtnetlink::packet_route::address::AddressAttribute;

            let (conn, handle, _) = rtnetlink::new_connection()
                .map_err(WgError::Io)?;
            tokio::spawn(conn);

            let index = get_link_index(&handle, name).await?;

            let existing: Vec<_> = handle
                .address()
                .get()
                .set_link_index_filter(index)
                .execute()
                .try_collect()
                .await
                .map_err(|e| WgError::Interface(e.to_string()))?;

            for addr_msg in existing {
                let matches = addr_msg
                    .attributes
                    .iter()
                    .any(|attr| matches!(attr, AddressAttribute::Address(a) if *a == addr));
                if matches {
                    handle
                        .address()
                        .del(addr_msg)
                        .execute()
                        .await
                        .map_err(|e| WgError::Interface(e.to_string()))?;
                    info!(interface = name, %addr, "removed address via netlink");
                }
            }
            Ok(())
        }

        async fn link_up(&self, name: &str) -> Result<(), WgError> {
            let (conn, handle, _) = rtnetlink::new_connection()
                .map_err(WgError::Io)?;
            tokio::spawn(conn);

            let index = get_link_index(&handle, name).await?;

            let msg = rtnetlink::LinkUnspec::new_with_index(index)
                .up()
                .build();
            handle
                .link()
                .set(msg)
                .execute()
                .await
                .map_err(|e| WgError::Interface(e.to_string()))?;

            info!(interface = name, "set link up via netlink");
            Ok(())
        }
    }

    fn build_peer(p: &PeerSpec) -> set::Peer<'_> {
        let mut peer = set::Peer::from_public_key(p.public_key.as_bytes())
            .flags(vec![set::WgPeerF::ReplaceAllowedIps]);

        if let Some(ref ep) = p.endpoint {
            peer = peer.endpoint(ep);
        }

        if p.persistent_keepalive > 0 {
            peer = peer.persistent_keepalive_interval(p.persistent_keepalive);
        }

        let allowed: Vec<set::AllowedIp<'_>> = p
            .allowed_ips
            .iter()
            .map(|(addr, cidr)| {
                let mut aip = set::AllowedIp::from_ipaddr(addr);
                aip.cidr_mask = Some(*cidr);
                aip
            })
            .collect();

        peer.allowed_ips(allowed)
    }

    /// Resolve interface name to its index via rtnetlink.
    async fn get_link_index(
        handle: &rtnetlink::Handle,
        name: &str,
    ) -> Result<u32, WgError> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        let link = links
            .try_next()
            .await
            .map_err(|e| WgError::Interface(e.to_string()))?
            .ok_or_else(|| WgError::Interface(format!("interface {name} not found")))?;
        Ok(link.header.index)
    }
}
