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

//! Typed access to the declarative object store.
//!
//! Everything the server persists goes through [`ObjectStore`], one
//! namespace-scoped client usable with any of the stored kinds. The real
//! implementation is [`KubeStore`]; tests substitute an in-memory double.

use std::fmt::Debug;
use std::future::Future;

use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams, WatchEvent, WatchParams};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("resource version conflict on {0}")]
    Conflict(String),

    #[error("object has no name")]
    Unnamed,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store request failed: {0}")]
    Request(#[from] kube::Error),
}

/// Bound for kinds the store holds: the custom kinds plus core secrets.
pub trait StoreKind:
    kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreKind for K where
    K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// One change reported by [`ObjectStore::watch`].
#[derive(Debug, Clone)]
pub enum StoreEvent<K> {
    Applied(K),
    Deleted(K),
}

pub type WatchStream<K> = BoxStream<'static, Result<StoreEvent<K>, StoreError>>;

/// Namespace-scoped typed client over the stored kinds.
///
/// `update` uses optimistic concurrency: the object's resource version must
/// still match the stored one or the call fails with
/// [`StoreError::Conflict`].
pub trait ObjectStore: Send + Sync {
    fn get<K: StoreKind>(&self, name: &str)
    -> impl Future<Output = Result<K, StoreError>> + Send;
    fn list<K: StoreKind>(&self) -> impl Future<Output = Result<Vec<K>, StoreError>> + Send;
    fn create<K: StoreKind>(&self, obj: &K)
    -> impl Future<Output = Result<K, StoreError>> + Send;
    fn update<K: StoreKind>(&self, obj: &K)
    -> impl Future<Output = Result<K, StoreError>> + Send;
    fn delete<K: StoreKind>(&self, name: &str)
    -> impl Future<Output = Result<(), StoreError>> + Send;
    fn delete_collection<K: StoreKind>(&self)
    -> impl Future<Output = Result<(), StoreError>> + Send;
    fn watch<K: StoreKind>(&self)
    -> impl Future<Output = Result<WatchStream<K>, StoreError>> + Send;
}

fn describe<K: StoreKind>(name: &str) -> String {
    format!("{} {name:?}", K::kind(&()))
}

fn classify<K: StoreKind>(err: kube::Error, name: &str) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(describe::<K>(name)),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StoreError::AlreadyExists(describe::<K>(name))
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(describe::<K>(name)),
        err => StoreError::Request(err),
    }
}

fn require_name<K: StoreKind>(obj: &K) -> Result<String, StoreError> {
    obj.meta().name.clone().ok_or(StoreError::Unnamed)
}

/// Store client backed by a real API server.
#[derive(Clone)]
pub struct KubeStore {
    client: kube::Client,
    namespace: String,
}

impl KubeStore {
    pub fn new(client: kube::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api<K: StoreKind>(&self) -> Api<K> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

impl ObjectStore for KubeStore {
    async fn get<K: StoreKind>(&self, name: &str) -> Result<K, StoreError> {
        self.api::<K>()
            .get(name)
            .await
            .map_err(|e| classify::<K>(e, name))
    }

    async fn list<K: StoreKind>(&self) -> Result<Vec<K>, StoreError> {
        let list = self
            .api::<K>()
            .list(&ListParams::default())
            .await
            .map_err(StoreError::Request)?;
        Ok(list.items)
    }

    async fn create<K: StoreKind>(&self, obj: &K) -> Result<K, StoreError> {
        let name = require_name(obj)?;
        self.api::<K>()
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify::<K>(e, &name))
    }

    async fn update<K: StoreKind>(&self, obj: &K) -> Result<K, StoreError> {
        let name = require_name(obj)?;
        self.api::<K>()
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| classify::<K>(e, &name))
    }

    async fn delete<K: StoreKind>(&self, name: &str) -> Result<(), StoreError> {
        self.api::<K>()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| classify::<K>(e, name))?;
        Ok(())
    }

    async fn delete_collection<K: StoreKind>(&self) -> Result<(), StoreError> {
        self.api::<K>()
            .delete_collection(&DeleteParams::default(), &ListParams::default())
            .await
            .map_err(StoreError::Request)?;
        Ok(())
    }

    async fn watch<K: StoreKind>(&self) -> Result<WatchStream<K>, StoreError> {
        let events = self
            .api::<K>()
            .watch(&WatchParams::default(), "0")
            .await
            .map_err(StoreError::Request)?;

        Ok(events
            .filter_map(|event| async move {
                match event {
                    Ok(WatchEvent::Added(obj) | WatchEvent::Modified(obj)) => {
                        Some(Ok(StoreEvent::Applied(obj)))
                    }
                    Ok(WatchEvent::Deleted(obj)) => Some(Ok(StoreEvent::Deleted(obj))),
                    Ok(WatchEvent::Bookmark(_)) => None,
                    Ok(WatchEvent::Error(e)) => {
                        Some(Err(StoreError::Request(kube::Error::Api(e))))
                    }
                    Err(e) => Some(Err(StoreError::Request(e))),
                }
            })
            .boxed())
    }
}
