//! Store backends.
//!
//! A store is the shared source of truth for the cluster: membership,
//! resources and the admin config. Watches run as background tasks and push
//! [`ReconcileEvent`]s into a channel owned by the sync manager; writes go
//! straight through to the backing system.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    config::{StoreConfig, StoreKind, SyncConfig},
    error::SyncResult,
    health::HealthHandle,
    model::{AdminConfig, ClusterConfig},
    resource::{EventKind, ResourceId},
    services::ScServices,
};

pub mod consul;
pub mod etcd;
pub mod kube;
pub mod local;
pub mod postgres;

pub use consul::ConsulStore;
pub use etcd::EtcdStore;
pub use kube::KubeStore;
pub use local::LocalStore;
pub use postgres::PostgresStore;

/// A single resource change.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEvent {
    pub kind: EventKind,
    pub id: ResourceId,
    /// `None` for deletes.
    pub payload: Option<Value>,
}

impl ResourceEvent {
    pub fn upsert(kind: EventKind, id: ResourceId, payload: Value) -> Self {
        Self {
            kind,
            id,
            payload: Some(payload),
        }
    }

    pub fn delete(id: ResourceId) -> Self {
        Self {
            kind: EventKind::Delete,
            id,
            payload: None,
        }
    }
}

/// Full resource listing of a store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSnapshot {
    pub resources: Vec<(ResourceId, Value)>,
    /// Keys present in the store whose payload could not be decoded.
    pub unreadable: Vec<ResourceId>,
}

impl ResourceSnapshot {
    pub fn push(&mut self, id: ResourceId, payload: Option<Value>) {
        match payload {
            Some(value) => self.resources.push((id, value)),
            None => self.unreadable.push(id),
        }
    }

    /// Every key the store holds, readable or not.
    pub fn ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.resources.iter().map(|(id, _)| id).chain(&self.unreadable)
    }
}

impl From<Vec<(ResourceId, Value)>> for ResourceSnapshot {
    fn from(resources: Vec<(ResourceId, Value)>) -> Self {
        Self {
            resources,
            unreadable: Vec::new(),
        }
    }
}

impl FromIterator<(ResourceId, Option<Value>)> for ResourceSnapshot {
    fn from_iter<I: IntoIterator<Item = (ResourceId, Option<Value>)>>(iter: I) -> Self {
        let mut snapshot = Self::default();
        for (id, payload) in iter {
            snapshot.push(id, payload);
        }
        snapshot
    }
}

/// Message from a store watch to the sync manager's dispatch loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileEvent {
    /// Full, sorted membership list.
    Services(ScServices),
    /// Incremental change to one resource.
    Resource(ResourceEvent),
    /// Full resource state; a key absent from both lists has been deleted.
    ResourceSnapshot(ResourceSnapshot),
    AdminConfig(AdminConfig),
}

impl ReconcileEvent {
    pub fn kind_str(&self) -> &'static str {
        match self {
            ReconcileEvent::Services(_) => "services",
            ReconcileEvent::Resource(_) => "resource",
            ReconcileEvent::ResourceSnapshot(_) => "resource_snapshot",
            ReconcileEvent::AdminConfig(_) => "admin_config",
        }
    }
}

pub type EventSender = mpsc::Sender<ReconcileEvent>;

#[async_trait]
pub trait Store: Send + Sync + 'static {
    fn kind(&self) -> StoreKind;

    /// Announce this node to the cluster and keep the announcement alive.
    async fn register(&self) -> SyncResult<()>;

    /// Emit the current membership, then every change to it.
    async fn watch_services(&self, events: EventSender) -> SyncResult<()>;

    async fn watch_resources(&self, events: EventSender) -> SyncResult<()>;

    async fn watch_admin_config(&self, events: EventSender) -> SyncResult<()>;

    async fn set_resource(&self, id: &ResourceId, payload: &Value) -> SyncResult<()>;

    async fn delete_resource(&self, id: &ResourceId) -> SyncResult<()>;

    async fn set_admin_config(&self, admin: &AdminConfig) -> SyncResult<()>;

    /// One-shot baseline read of the whole configuration.
    async fn get_global_config(&self) -> SyncResult<ClusterConfig>;

    /// Persist a full snapshot. Only stores without per-resource storage need this.
    async fn persist_snapshot(&self, _config: &ClusterConfig) -> SyncResult<()> {
        Ok(())
    }

    /// Stop every background task the store started.
    async fn close(&self) {}
}

/// Build the store selected by `config.store`.
pub async fn create_store(config: &SyncConfig, health: HealthHandle) -> SyncResult<Arc<dyn Store>> {
    debug!(store = config.store.kind().as_str(), "Creating store");
    let store: Arc<dyn Store> = match &config.store {
        StoreConfig::Local(local) => Arc::new(LocalStore::new(config, local.clone())?),
        StoreConfig::Kube(kube) => Arc::new(KubeStore::new(config, kube.clone()).await?),
        StoreConfig::Consul(consul) => Arc::new(ConsulStore::new(config, consul.clone(), health)?),
        StoreConfig::Etcd(etcd) => Arc::new(EtcdStore::new(config, etcd.clone(), health)?),
        StoreConfig::Postgres(pg) => Arc::new(PostgresStore::new(config, pg.clone()).await?),
    };
    Ok(store)
}

// ============================================================================
// Key layout shared by the key/value stores (etcd, Consul)
// ============================================================================

pub(crate) fn instances_prefix(cluster_id: &str) -> String {
    format!("sc/instances/{cluster_id}/")
}

pub(crate) fn instance_key(cluster_id: &str, node_id: &str) -> String {
    format!("sc/instances/{cluster_id}/{node_id}")
}

pub(crate) fn projects_prefix(cluster_id: &str) -> String {
    format!("sc/projects/{cluster_id}/")
}

pub(crate) fn resource_key(cluster_id: &str, id: &ResourceId) -> String {
    format!("sc/projects/{cluster_id}/{id}")
}

pub(crate) fn admin_key(cluster_id: &str) -> String {
    format!("sc/admin-config/{cluster_id}")
}

/// Last path segment of `key` if it sits directly under `prefix`.
pub(crate) fn key_suffix<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    Some(rest)
}
