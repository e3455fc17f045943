//! In-memory doubles for the store, the wireguard platform and the token
//! issuer, plus small builders shared by the integration tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use tokio::sync::broadcast;

use fleetwire_proto::RegisterRequest;
use fleetwire_server::store::{ObjectStore, StoreError, StoreEvent, StoreKind, WatchStream};
use fleetwire_server::tokens::{JoinToken, TokenError, TokenIssuer};
use fleetwire_types::{PrivateKey, WireguardIpPool, WireguardIpPoolSpec};
use fleetwire_wg::{PeerSpec, WgApi, WgError};

// -- In-memory object store --

#[derive(Clone)]
struct WatchNotice {
    kind: String,
    value: serde_json::Value,
    deleted: bool,
}

struct Stored {
    resource_version: u64,
    value: serde_json::Value,
}

#[derive(Default)]
struct Inner {
    // kind -> name -> object
    objects: HashMap<String, BTreeMap<String, Stored>>,
    // kind -> forced update conflicts still to serve
    conflicts: HashMap<String, u32>,
}

/// Store double with the same optimistic-concurrency behavior as the real
/// one: updates must present the current resource version or they conflict.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<WatchNotice>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }
}

fn kind_of<K: StoreKind>() -> String {
    K::kind(&()).to_string()
}

fn to_stored<K: StoreKind>(obj: &K, resource_version: u64) -> Result<Stored, StoreError> {
    let mut obj = obj.clone();
    obj.meta_mut().resource_version = Some(resource_version.to_string());
    let value = serde_json::to_value(&obj).map_err(|e| StoreError::Unavailable(e.to_string()))?;
    Ok(Stored {
        resource_version,
        value,
    })
}

fn from_stored<K: StoreKind>(value: &serde_json::Value) -> Result<K, StoreError> {
    serde_json::from_value(value.clone()).map_err(|e| StoreError::Unavailable(e.to_string()))
}

impl MemoryStore {
    /// Make the next `count` updates of kind `K` fail with a conflict, the
    /// way a racing writer would.
    pub fn inject_update_conflicts<K: StoreKind>(&self, count: u32) {
        self.inner
            .lock()
            .unwrap()
            .conflicts
            .insert(kind_of::<K>(), count);
    }

    pub fn len<K: StoreKind>(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&kind_of::<K>())
            .map_or(0, |objs| objs.len())
    }

    fn notify(&self, kind: &str, value: serde_json::Value, deleted: bool) {
        // No receivers is fine.
        let _ = self.events.send(WatchNotice {
            kind: kind.to_string(),
            value,
            deleted,
        });
    }
}

impl ObjectStore for MemoryStore {
    async fn get<K: StoreKind>(&self, name: &str) -> Result<K, StoreError> {
        let inner = self.inner.lock().unwrap();
        let stored = inner
            .objects
            .get(&kind_of::<K>())
            .and_then(|objs| objs.get(name))
            .ok_or_else(|| StoreError::NotFound(format!("{} {name:?}", K::kind(&()))))?;
        from_stored(&stored.value)
    }

    async fn list<K: StoreKind>(&self) -> Result<Vec<K>, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&kind_of::<K>())
            .into_iter()
            .flat_map(|objs| objs.values())
            .map(|stored| from_stored(&stored.value))
            .collect()
    }

    async fn create<K: StoreKind>(&self, obj: &K) -> Result<K, StoreError> {
        let name = obj.meta().name.clone().ok_or(StoreError::Unnamed)?;
        let kind = kind_of::<K>();
        let stored = to_stored(obj, 1)?;
        let value = stored.value.clone();

        {
            let mut inner = self.inner.lock().unwrap();
            let objs = inner.objects.entry(kind.clone()).or_default();
            if objs.contains_key(&name) {
                return Err(StoreError::AlreadyExists(format!(
                    "{} {name:?}",
                    K::kind(&())
                )));
            }
            objs.insert(name, stored);
        }

        self.notify(&kind, value.clone(), false);
        from_stored(&value)
    }

    async fn update<K: StoreKind>(&self, obj: &K) -> Result<K, StoreError> {
        let name = obj.meta().name.clone().ok_or(StoreError::Unnamed)?;
        let kind = kind_of::<K>();
        let described = format!("{} {name:?}", K::kind(&()));

        let value = {
            let mut inner = self.inner.lock().unwrap();

            if let Some(remaining) = inner.conflicts.get_mut(&kind) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Conflict(described));
                }
            }

            let objs = inner.objects.entry(kind.clone()).or_default();
            let current_rv = objs
                .get(&name)
                .ok_or_else(|| StoreError::NotFound(described.clone()))?
                .resource_version;

            if let Some(rv) = &obj.meta().resource_version {
                if *rv != current_rv.to_string() {
                    return Err(StoreError::Conflict(described));
                }
            }

            let stored = to_stored(obj, current_rv + 1)?;
            let value = stored.value.clone();
            objs.insert(name, stored);
            value
        };

        self.notify(&kind, value.clone(), false);
        from_stored(&value)
    }

    async fn delete<K: StoreKind>(&self, name: &str) -> Result<(), StoreError> {
        let kind = kind_of::<K>();
        let removed = self
            .inner
            .lock()
            .unwrap()
            .objects
            .entry(kind.clone())
            .or_default()
            .remove(name)
            .ok_or_else(|| StoreError::NotFound(format!("{} {name:?}", K::kind(&()))))?;
        self.notify(&kind, removed.value, true);
        Ok(())
    }

    async fn delete_collection<K: StoreKind>(&self) -> Result<(), StoreError> {
        let kind = kind_of::<K>();
        let removed: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            let objs = inner.objects.entry(kind.clone()).or_default();
            std::mem::take(objs).into_values().collect()
        };
        for stored in removed {
            self.notify(&kind, stored.value, true);
        }
        Ok(())
    }

    async fn watch<K: StoreKind>(&self) -> Result<WatchStream<K>, StoreError> {
        let rx = self.events.subscribe();
        let kind = kind_of::<K>();
        let stream = futures::stream::unfold((rx, kind), |(mut rx, kind)| async move {
            loop {
                match rx.recv().await {
                    Ok(notice) if notice.kind == kind => {
                        let event = from_stored::<K>(&notice.value).map(|obj| {
                            if notice.deleted {
                                StoreEvent::Deleted(obj)
                            } else {
                                StoreEvent::Applied(obj)
                            }
                        });
                        return Some((event, (rx, kind)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed();
        Ok(stream)
    }
}

// -- In-memory wireguard platform --

#[derive(Default)]
pub struct WgState {
    pub interfaces: Vec<String>,
    pub device_keys: HashMap<String, PrivateKey>,
    pub listen_ports: HashMap<String, u16>,
    pub peers: HashMap<String, Vec<PeerSpec>>,
    pub addresses: HashMap<String, Vec<(IpAddr, u8)>>,
    pub links_up: HashSet<String>,
}

/// Platform double that records everything a kernel would be told.
#[derive(Clone, Default)]
pub struct MockWg {
    state: Arc<Mutex<WgState>>,
}

impl MockWg {
    pub fn state(&self) -> MutexGuard<'_, WgState> {
        self.state.lock().unwrap()
    }

    pub fn peers(&self, interface: &str) -> Vec<PeerSpec> {
        self.state()
            .peers
            .get(interface)
            .cloned()
            .unwrap_or_default()
    }
}

impl WgApi for MockWg {
    async fn list_interfaces(&self) -> Result<Vec<String>, WgError> {
        Ok(self.state().interfaces.clone())
    }

    async fn create_interface(&self, name: &str) -> Result<(), WgError> {
        self.state().interfaces.push(name.to_string());
        Ok(())
    }

    async fn private_key(&self, name: &str) -> Result<Option<PrivateKey>, WgError> {
        Ok(self.state().device_keys.get(name).cloned())
    }

    async fn set_device_config(
        &self,
        name: &str,
        key: &PrivateKey,
        listen_port: Option<u16>,
    ) -> Result<(), WgError> {
        let mut state = self.state();
        state.device_keys.insert(name.to_string(), key.clone());
        if let Some(port) = listen_port {
            state.listen_ports.insert(name.to_string(), port);
        }
        Ok(())
    }

    async fn add_peer(&self, name: &str, peer: &PeerSpec) -> Result<(), WgError> {
        let mut state = self.state();
        let peers = state.peers.entry(name.to_string()).or_default();
        // Same public key updates the existing peer, as the kernel does.
        if let Some(existing) = peers.iter_mut().find(|p| p.public_key == peer.public_key) {
            *existing = peer.clone();
        } else {
            peers.push(peer.clone());
        }
        Ok(())
    }

    async fn replace_peers(&self, name: &str, peers: &[PeerSpec]) -> Result<(), WgError> {
        self.state().peers.insert(name.to_string(), peers.to_vec());
        Ok(())
    }

    async fn flush_peers(&self, name: &str) -> Result<(), WgError> {
        self.state().peers.insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn assign_address(&self, name: &str, addr: IpAddr, prefix: u8) -> Result<(), WgError> {
        self.state()
            .addresses
            .insert(name.to_string(), vec![(addr, prefix)]);
        Ok(())
    }

    async fn remove_address(&self, name: &str, addr: IpAddr) -> Result<(), WgError> {
        self.state()
            .addresses
            .entry(name.to_string())
            .or_default()
            .retain(|(a, _)| *a != addr);
        Ok(())
    }

    async fn link_up(&self, name: &str) -> Result<(), WgError> {
        self.state().links_up.insert(name.to_string());
        Ok(())
    }
}

// -- Static token issuer --

pub struct StaticIssuer {
    tokens: Vec<JoinToken>,
}

impl StaticIssuer {
    pub fn single(cluster_id: &str, token: &str) -> Self {
        Self {
            tokens: vec![JoinToken {
                cluster_id: cluster_id.to_string(),
                token: token.to_string(),
            }],
        }
    }

    pub fn empty() -> Self {
        Self { tokens: Vec::new() }
    }
}

impl TokenIssuer for StaticIssuer {
    async fn fetch_tokens(&self) -> Result<Vec<JoinToken>, TokenError> {
        Ok(self.tokens.clone())
    }
}

// -- Builders --

pub fn pool(name: &str, cidr: &str) -> WireguardIpPool {
    WireguardIpPool::new(
        name,
        WireguardIpPoolSpec {
            cidr: cidr.to_string(),
        },
    )
}

pub fn register_request(id: &str, auth_token: &str) -> RegisterRequest {
    RegisterRequest {
        id: id.to_string(),
        auth_token: auth_token.to_string(),
    }
}
