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

//! Server-side mesh management: interface bootstrap, peer registration and
//! startup reconciliation.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use fleetwire_types::{Device, PrivateKey, WireguardIp, WireguardIpPool};
use fleetwire_wg::{LISTEN_PORT, PERSISTENT_KEEPALIVE, PeerSpec, WgApi, WgError, ensure_interface};

use crate::alloc::{self, AllocError};
use crate::store::{ObjectStore, StoreError};

/// Key under which a device secret stores the wireguard private key.
pub const DEVICE_SECRET_KEY: &str = "wireguard-key";

/// Key under which the pool secret stores the server's private key.
pub const POOL_SECRET_KEY: &str = "private-key";

#[derive(Debug, Error)]
pub enum MeshError {
    #[error(transparent)]
    Platform(#[from] WgError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Key(#[from] fleetwire_types::KeyError),

    #[error("secret {secret} is missing key {key:?}")]
    MalformedSecret { secret: String, key: &'static str },
}

/// Identity of a registered peer: the private key backing it and the peer
/// as it went into the kernel.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub private_key: PrivateKey,
    pub peer: PeerSpec,
}

/// Owns the server's wireguard interface and keeps the kernel's peer set in
/// step with the store.
pub struct MeshManager<S, W> {
    store: S,
    wg: W,
    interface: String,
}

impl<S: ObjectStore, W: WgApi> MeshManager<S, W> {
    /// Adopt the host's wireguard interface and wrap it in a manager.
    pub async fn new(store: S, wg: W) -> Result<Self, MeshError> {
        let interface = ensure_interface(&wg).await?;
        Ok(Self {
            store,
            wg,
            interface,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Bring the server side of the mesh up for this pool.
    ///
    /// Keys the device on first start (persisting the keypair via the pool),
    /// then binds the pool's server address and raises the link. Safe to
    /// call again on a device that is already keyed.
    #[tracing::instrument(skip_all, fields(interface = %self.interface, pool = %pool.name_any()))]
    pub async fn start_server(&self, pool: &WireguardIpPool) -> Result<(), MeshError> {
        let network = alloc::pool_network(pool)?;

        let current = self.wg.private_key(&self.interface).await?;
        match current {
            Some(key) if !key.is_zero() => debug!("device already keyed"),
            _ => self.init_server(pool).await?,
        }

        let addr = IpAddr::V4(network.ip());

        // A provisioning step may have parked the server address on loopback
        // before the wireguard interface existed. Clearing it is optional.
        if let Err(e) = self.wg.remove_address("lo", addr).await {
            warn!(%addr, error = %e, "could not clear loopback placeholder");
        }

        self.wg
            .assign_address(&self.interface, addr, network.prefix())
            .await?;
        self.wg.link_up(&self.interface).await?;

        info!(%addr, "mesh server started");
        Ok(())
    }

    /// Drop every peer from the kernel device. Used once at startup before
    /// reconciliation rebuilds the set from the store.
    pub async fn flush(&self) -> Result<(), MeshError> {
        self.wg.flush_peers(&self.interface).await?;
        Ok(())
    }

    /// Re-register every stored address as a kernel peer.
    ///
    /// Failures are logged and skipped so one broken record cannot keep the
    /// rest of the fleet offline. Returns the number of peers restored.
    #[tracing::instrument(skip_all, fields(interface = %self.interface))]
    pub async fn reconcile(&self) -> Result<usize, MeshError> {
        let ips = self.store.list::<WireguardIp>().await?;
        let total = ips.len();
        info!(total, "starting peer reconciliation");

        let mut restored = 0;
        for ip in &ips {
            match self.register_peer(ip).await {
                Ok(_) => restored += 1,
                Err(e) => {
                    error!(ip = %ip.name_any(), error = %e, "failed to re-register peer, skipping");
                }
            }
        }

        info!(restored, total, "peer reconciliation complete");
        Ok(restored)
    }

    /// Register one stored address as a live kernel peer.
    ///
    /// When the owning device already exists its stored key is reused, so
    /// re-registration keeps the same identity; otherwise a fresh key is
    /// generated for the caller to persist.
    pub async fn register_peer(&self, ip: &WireguardIp) -> Result<PeerIdentity, MeshError> {
        let key = match self.store.get::<Device>(&ip.spec.device_ref).await {
            Ok(device) => {
                let secret: Secret = self.store.get(&device.spec.secret_ref).await?;
                secret_key(&secret, DEVICE_SECRET_KEY)?
            }
            Err(StoreError::NotFound(_)) => PrivateKey::generate(),
            Err(e) => return Err(e.into()),
        };

        let addr: IpAddr = ip.spec.ip_address.parse().map_err(WgError::from)?;
        let peer = PeerSpec {
            public_key: key.public_key(),
            allowed_ips: vec![(addr, host_prefix(addr))],
            endpoint: None,
            persistent_keepalive: PERSISTENT_KEEPALIVE,
        };

        self.wg.add_peer(&self.interface, &peer).await?;
        debug!(ip = %ip.spec.ip_address, peer = %peer.public_key, "registered peer");

        Ok(PeerIdentity {
            private_key: key,
            peer,
        })
    }

    async fn init_server(&self, pool: &WireguardIpPool) -> Result<(), MeshError> {
        let pool = self.sync_pool_key(pool).await?;

        let status = pool.status.unwrap_or_default();
        let secret: Secret = self.store.get(&status.secret_ref).await?;
        let key = secret_key(&secret, POOL_SECRET_KEY)?;

        self.wg
            .set_device_config(&self.interface, &key, Some(LISTEN_PORT))
            .await?;
        info!(listen_port = LISTEN_PORT, "configured server device key");
        Ok(())
    }

    /// Make sure the pool owns a keypair, generating and persisting one the
    /// first time the server starts against it.
    async fn sync_pool_key(&self, pool: &WireguardIpPool) -> Result<WireguardIpPool, MeshError> {
        let secret_name = format!("wgpool-{}", pool.name_any());

        let key = match self.store.get::<Secret>(&secret_name).await {
            Ok(secret) => secret_key(&secret, POOL_SECRET_KEY)?,
            Err(StoreError::NotFound(_)) => {
                let key = PrivateKey::generate();
                self.store
                    .create(&key_secret(&secret_name, POOL_SECRET_KEY, &key))
                    .await?;
                info!(secret = %secret_name, "generated server keypair");
                key
            }
            Err(e) => return Err(e.into()),
        };

        let mut pool = pool.clone();
        let mut status = pool.status.take().unwrap_or_default();
        status.secret_ref = secret_name;
        status.public_key = key.public_key().to_base64();
        status.created = true;
        pool.status = Some(status);

        Ok(self.store.update(&pool).await?)
    }
}

/// Build a secret holding one base64 key under the given field.
pub(crate) fn key_secret(name: &str, field: &str, key: &PrivateKey) -> Secret {
    let mut data = BTreeMap::new();
    data.insert(field.to_string(), ByteString(key.to_base64().into_bytes()));
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Read a base64 key out of a secret.
pub(crate) fn secret_key(secret: &Secret, field: &'static str) -> Result<PrivateKey, MeshError> {
    let Some(data) = secret.data.as_ref().and_then(|d| d.get(field)) else {
        return Err(MeshError::MalformedSecret {
            secret: secret.name_any(),
            key: field,
        });
    };
    let encoded = std::str::from_utf8(&data.0).map_err(|_| MeshError::MalformedSecret {
        secret: secret.name_any(),
        key: field,
    })?;
    Ok(PrivateKey::from_base64(encoded.trim())?)
}

fn host_prefix(addr: IpAddr) -> u8 {
    if addr.is_ipv4() { 32 } else { 128 }
}
