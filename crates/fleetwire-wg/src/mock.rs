//! In-memory [`WgApi`] used by this crate's tests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use fleetwire_types::PrivateKey;

use crate::platform::{PeerSpec, WgApi, WgError};

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub(crate) interfaces: Vec<String>,
    pub(crate) device_keys: HashMap<String, PrivateKey>,
    pub(crate) listen_ports: HashMap<String, u16>,
    pub(crate) peers: HashMap<String, Vec<PeerSpec>>,
    pub(crate) addresses: HashMap<String, Vec<(IpAddr, u8)>>,
    pub(crate) links_up: Vec<String>,
}

#[derive(Debug, Default)]
pub(crate) struct MockWg {
    state: Mutex<MockState>,
}

impl MockWg {
    pub(crate) fn with_interfaces(names: &[&str]) -> Self {
        let wg = Self::default();
        wg.state.lock().unwrap().interfaces = names.iter().map(|n| n.to_string()).collect();
        wg
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
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
        self.state()
            .peers
            .entry(name.to_string())
            .or_default()
            .push(peer.clone());
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
        if let Some(addrs) = self.state().addresses.get_mut(name) {
            addrs.retain(|(a, _)| *a != addr);
        }
        Ok(())
    }

    async fn link_up(&self, name: &str) -> Result<(), WgError> {
        self.state().links_up.push(name.to_string());
        Ok(())
    }
}
