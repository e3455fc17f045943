//! Mesh address allocation from the active pool.
//!
//! Addresses are handed out sequentially by advancing the pool's
//! `used_addresses` counter; nothing is ever reclaimed, so a counter value
//! maps to one address forever.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, warn};

use fleetwire_types::WireguardIpPool;

use crate::store::{ObjectStore, StoreError};

/// Skips the network address and the server's own address.
const HOST_OFFSET: u32 = 2;

/// Attempts before a conflicted pool update is given up on.
const MAX_UPDATE_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("no active pools, retry later")]
    NoActivePool,

    #[error("pool {pool} has an invalid cidr {cidr:?}: {reason}")]
    InvalidCidr {
        pool: String,
        cidr: String,
        reason: String,
    },

    #[error("pool {pool} is exhausted after {used} addresses")]
    AddressSpaceExhausted { pool: String, used: u32 },

    #[error("pool update conflicted {0} times, giving up")]
    UpdateConflict(u32),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Pick the active pool for this namespace.
pub async fn active_pool<S: ObjectStore>(store: &S) -> Result<WireguardIpPool, AllocError> {
    let mut pools = store.list::<WireguardIpPool>().await?;
    if pools.is_empty() {
        return Err(AllocError::NoActivePool);
    }
    if pools.len() > 1 {
        warn!(
            count = pools.len(),
            pool = %pools[0].name_any(),
            "found more than one pool, only one is supported, using the first"
        );
    }
    Ok(pools.remove(0))
}

/// Parse a pool's CIDR. The address part is the server's own address, so
/// `10.0.0.1/24` is valid and distinct from `10.0.0.0/24`.
pub(crate) fn pool_network(pool: &WireguardIpPool) -> Result<Ipv4Network, AllocError> {
    pool.spec
        .cidr
        .parse()
        .map_err(|e: ipnetwork::IpNetworkError| AllocError::InvalidCidr {
            pool: pool.name_any(),
            cidr: pool.spec.cidr.clone(),
            reason: e.to_string(),
        })
}

/// Address for a given counter value, or `None` past the end of the pool.
fn host_at(network: Ipv4Network, counter: u32) -> Option<Ipv4Addr> {
    counter.checked_add(HOST_OFFSET).and_then(|n| network.nth(n))
}

/// Allocate the next address, persisting the advanced counter.
///
/// The pool update relies on the store's optimistic concurrency: a conflict
/// means another registration advanced the counter first, so the allocation
/// is recomputed from the fresh pool and retried, a bounded number of times.
#[tracing::instrument(skip(store))]
pub async fn allocate<S: ObjectStore>(
    store: &S,
) -> Result<(Ipv4Addr, WireguardIpPool), AllocError> {
    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let mut pool = active_pool(store).await?;
        let network = pool_network(&pool)?;

        let mut status = pool.status.take().unwrap_or_default();
        let counter = status
            .used_addresses
            .checked_add(1)
            .ok_or_else(|| AllocError::AddressSpaceExhausted {
                pool: pool.name_any(),
                used: status.used_addresses,
            })?;
        let Some(addr) = host_at(network, counter) else {
            return Err(AllocError::AddressSpaceExhausted {
                pool: pool.name_any(),
                used: status.used_addresses,
            });
        };

        status.used_addresses = counter;
        pool.status = Some(status);

        match store.update(&pool).await {
            Ok(updated) => {
                debug!(%addr, pool = %updated.name_any(), counter, "allocated address");
                return Ok((addr, updated));
            }
            Err(StoreError::Conflict(_)) => {
                debug!(attempt, "pool update conflicted, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(AllocError::UpdateConflict(MAX_UPDATE_ATTEMPTS))
}
