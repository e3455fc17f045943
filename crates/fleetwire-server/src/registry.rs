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

//! The registration engine.
//!
//! [`Registry::register`] is the one entry point devices hit to join the
//! fleet: it authenticates the caller, allocates a mesh address, installs
//! the kernel peer and persists the device's records, then answers with
//! everything the device needs to bring its own tunnel up. Registration is
//! idempotent per device id.

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fleetwire_proto::{RegisterRequest, RegisterResponse};
use fleetwire_types::{
    Device, DeviceSpec, DeviceStatus, PrivateKey, WireguardIp, WireguardIpPool, WireguardIpSpec,
    WireguardIpStatus, ip_object_name,
};
use fleetwire_wg::WgApi;

use crate::alloc::{self, AllocError};
use crate::mesh::{self, DEVICE_SECRET_KEY, MeshError, MeshManager};
use crate::store::{ObjectStore, StoreError};
use crate::tokens::{self, TokenError, TokenIssuer};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid auth token")]
    AuthenticationFailed,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] StoreError),

    #[error("no active pools, retry later")]
    NoActivePool,

    #[error("address allocation kept conflicting: {0}")]
    AllocationConflict(#[source] AllocError),

    #[error("address allocation failed: {0}")]
    Allocation(#[source] AllocError),

    #[error("device partially registered, failed at {step}: {source}")]
    PartialRegistration {
        step: &'static str,
        #[source]
        source: Box<RegistryError>,
    },

    #[error("issuer returned no registration token")]
    NoRegistrationToken,

    #[error("token issuer unavailable: {0}")]
    IssuerUnavailable(#[from] TokenError),

    #[error(transparent)]
    Mesh(#[from] MeshError),
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        Self::StorageUnavailable(err)
    }
}

impl From<AllocError> for RegistryError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::NoActivePool => Self::NoActivePool,
            AllocError::Store(e) => Self::StorageUnavailable(e),
            e @ AllocError::UpdateConflict(_) => Self::AllocationConflict(e),
            e => Self::Allocation(e),
        }
    }
}

/// Wrap a mid-registration failure with the step it happened at. Earlier
/// steps are not rolled back; the error names where the state was left.
fn partial<E: Into<RegistryError>>(step: &'static str) -> impl FnOnce(E) -> RegistryError {
    move |source| RegistryError::PartialRegistration {
        step,
        source: Box::new(source.into()),
    }
}

/// Compare a presented token against the configured one without leaking
/// where they differ. Slice `ct_eq` short-circuits on length, so lengths
/// are compared on their own first.
fn token_matches(expected: &[u8], provided: &[u8]) -> bool {
    if !bool::from(provided.len().ct_eq(&expected.len())) {
        return false;
    }
    bool::from(provided.ct_eq(expected))
}

/// The fleet registration engine.
///
/// Generic over the store, the wireguard platform and the token issuer so
/// tests can swap in in-memory fakes.
pub struct Registry<S, W, T> {
    store: S,
    mesh: MeshManager<S, W>,
    issuer: T,
    auth_token: String,
}

impl<S: ObjectStore, W: WgApi, T: TokenIssuer> Registry<S, W, T> {
    pub fn new(store: S, mesh: MeshManager<S, W>, issuer: T, auth_token: String) -> Self {
        Self {
            store,
            mesh,
            issuer,
            auth_token,
        }
    }

    /// Bring up the mesh server and rebuild its peers from the store, then
    /// hand back a registry ready to serve.
    ///
    /// The kernel peer set is flushed first so peers deleted from the store
    /// while the server was down do not linger.
    #[tracing::instrument(skip_all)]
    pub async fn bootstrap(
        store: S,
        wg: W,
        issuer: T,
        auth_token: String,
    ) -> Result<Self, RegistryError>
    where
        S: Clone,
    {
        let mesh = MeshManager::new(store.clone(), wg).await?;

        let pool = alloc::active_pool(&store).await?;
        mesh.start_server(&pool).await?;
        mesh.flush().await?;
        let restored = mesh.reconcile().await?;
        info!(restored, pool = %pool.name_any(), "mesh restored from store");

        Ok(Self::new(store, mesh, issuer, auth_token))
    }

    /// Register a device, or return its existing registration.
    #[tracing::instrument(skip_all)]
    pub async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse, RegistryError> {
        self.authenticate(&req.auth_token)?;

        let id = if req.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            req.id
        };

        match self.store.get::<Device>(&id).await {
            Ok(_) => debug!(device = %id, "device already registered"),
            Err(StoreError::NotFound(_)) => self.create_device(&id).await?,
            Err(e) => return Err(e.into()),
        }

        self.assemble_response(&id).await
    }

    fn authenticate(&self, token: &str) -> Result<(), RegistryError> {
        if token_matches(self.auth_token.as_bytes(), token.as_bytes()) {
            Ok(())
        } else {
            Err(RegistryError::AuthenticationFailed)
        }
    }

    #[tracing::instrument(skip(self))]
    async fn create_device(&self, id: &str) -> Result<(), RegistryError> {
        let (addr, pool) = alloc::allocate(&self.store).await?;

        let ip_name = ip_object_name(&addr.to_string());
        let mut ip = WireguardIp::new(
            &ip_name,
            WireguardIpSpec {
                device_ref: id.to_string(),
                pool_ref: pool.name_any(),
                ip_address: addr.to_string(),
            },
        );
        ip.status = Some(WireguardIpStatus { active: true });

        // The peer goes live in the kernel before anything is persisted. If
        // a later step fails, retrying the registration re-adds the same
        // address with a fresh key and the stale peer is dropped on the next
        // restart's flush.
        let identity = self
            .mesh
            .register_peer(&ip)
            .await
            .map_err(partial("register mesh peer"))?;

        self.put_secret(id, &identity.private_key)
            .await
            .map_err(partial("create device secret"))?;

        let mut device = Device::new(
            id,
            DeviceSpec {
                secret_ref: id.to_string(),
                wireguard_ip_ref: ip_name.clone(),
            },
        );
        device.status = Some(DeviceStatus {
            registered: true,
            public_key: identity.peer.public_key.to_base64(),
        });
        match self.store.create(&device).await {
            Ok(_) => {}
            Err(StoreError::AlreadyExists(_)) => {
                // Lost the race with a concurrent registration of the same
                // id. The winner's records are authoritative.
                debug!(device = %id, "device created concurrently");
                return Ok(());
            }
            Err(e) => return Err(partial("create device")(e)),
        }

        match self.store.create(&ip).await {
            Ok(_) => {}
            Err(StoreError::AlreadyExists(_)) => {
                debug!(ip = %ip_name, "address record already present")
            }
            Err(e) => return Err(partial("create address record")(e)),
        }

        info!(device = %id, ip = %addr, "registered new device");
        Ok(())
    }

    /// Store the device's private key, overwriting any leftover from an
    /// earlier partial registration.
    async fn put_secret(&self, id: &str, key: &PrivateKey) -> Result<(), StoreError> {
        let secret = mesh::key_secret(id, DEVICE_SECRET_KEY, key);
        match self.store.create(&secret).await {
            Ok(_) => Ok(()),
            Err(StoreError::AlreadyExists(_)) => {
                let mut existing: Secret = self.store.get(id).await?;
                existing.data = secret.data;
                self.store.update(&existing).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Build the response from what the store holds for this device. Always
    /// read back rather than assembled from in-flight state, so a replayed
    /// registration answers exactly like the first.
    async fn assemble_response(&self, id: &str) -> Result<RegisterResponse, RegistryError> {
        let device: Device = self.store.get(id).await?;
        let secret: Secret = self.store.get(&device.spec.secret_ref).await?;
        let key = mesh::secret_key(&secret, DEVICE_SECRET_KEY)?;
        let ip: WireguardIp = self.store.get(&device.spec.wireguard_ip_ref).await?;
        let pool: WireguardIpPool = self.store.get(&ip.spec.pool_ref).await?;
        let pool_status = pool.status.unwrap_or_default();

        let tokens = self.issuer.fetch_tokens().await?;
        let Some(cluster_token) = tokens::first_token(&tokens) else {
            warn!(device = %id, "issuer returned no usable registration token");
            return Err(RegistryError::NoRegistrationToken);
        };

        Ok(RegisterResponse {
            id: id.to_string(),
            key: key.to_base64(),
            cluster_token: cluster_token.to_string(),
            ip_address: ip.spec.ip_address,
            server_public_key: pool_status.public_key,
        })
    }
}
