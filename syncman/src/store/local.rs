//! Single-node store backed by a config file on disk.
//!
//! There is no shared state to watch: membership is just this node, and the
//! whole snapshot is rewritten on every change.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use super::{EventSender, ReconcileEvent, Store};
use crate::{
    config::{LocalConfig, StoreKind, SyncConfig},
    error::{SyncError, SyncResult},
    model::{AdminConfig, ClusterConfig},
    resource::ResourceId,
    services::{ScServices, Service},
};

pub struct LocalStore {
    path: PathBuf,
    node_id: String,
    advertise_addr: String,
}

impl LocalStore {
    pub fn new(sync: &SyncConfig, config: LocalConfig) -> SyncResult<Self> {
        Ok(Self {
            path: config.path,
            node_id: sync.node_id.clone(),
            advertise_addr: sync.advertise_addr.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_json(&self) -> bool {
        self.path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
    }

    fn decode(&self, raw: &str) -> SyncResult<ClusterConfig> {
        if raw.trim().is_empty() {
            return Ok(ClusterConfig::default());
        }
        if self.is_json() {
            Ok(serde_json::from_str(raw)?)
        } else {
            Ok(serde_yaml::from_str(raw)?)
        }
    }

    fn encode(&self, config: &ClusterConfig) -> SyncResult<String> {
        if self.is_json() {
            Ok(serde_json::to_string_pretty(config)?)
        } else {
            Ok(serde_yaml::to_string(config)?)
        }
    }
}

#[async_trait]
impl Store for LocalStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Local
    }

    async fn register(&self) -> SyncResult<()> {
        Ok(())
    }

    async fn watch_services(&self, events: EventSender) -> SyncResult<()> {
        let services = ScServices::new([Service::new(&self.node_id, &self.advertise_addr)]);
        events
            .send(ReconcileEvent::Services(services))
            .await
            .map_err(|_| SyncError::NotRunning)
    }

    async fn watch_resources(&self, _events: EventSender) -> SyncResult<()> {
        Ok(())
    }

    async fn watch_admin_config(&self, _events: EventSender) -> SyncResult<()> {
        Ok(())
    }

    async fn set_resource(&self, id: &ResourceId, _payload: &Value) -> SyncResult<()> {
        debug!(resource_id = %id, "Resource kept in snapshot, written on persist");
        Ok(())
    }

    async fn delete_resource(&self, id: &ResourceId) -> SyncResult<()> {
        debug!(resource_id = %id, "Resource removed from snapshot, written on persist");
        Ok(())
    }

    async fn set_admin_config(&self, _admin: &AdminConfig) -> SyncResult<()> {
        Ok(())
    }

    async fn get_global_config(&self) -> SyncResult<ClusterConfig> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => self.decode(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "Config file not found, starting empty");
                Ok(ClusterConfig::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn persist_snapshot(&self, config: &ClusterConfig) -> SyncResult<()> {
        let data = self.encode(config)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so readers never see a half-written file.
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "Persisted config snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        config::StoreConfig,
        model::{Project, ProjectConfig},
    };

    fn store(path: PathBuf) -> LocalStore {
        let sync = SyncConfig::new(
            "node-0",
            "c1",
            "10.0.0.1:4122",
            StoreConfig::Local(LocalConfig { path: path.clone() }),
        );
        LocalStore::new(&sync, LocalConfig { path }).unwrap()
    }

    #[tokio::test]
    async fn test_missing_file_yields_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path().join("config.yaml"));
        assert_eq!(store.get_global_config().await.unwrap(), ClusterConfig::default());
    }

    #[tokio::test]
    async fn test_persist_and_reload_yaml_and_json() {
        for name in ["config.yaml", "config.json"] {
            let dir = tempfile::tempdir().unwrap();
            let store = store(dir.path().join("nested").join(name));

            let mut config = ClusterConfig::default();
            let mut project = Project::new(ProjectConfig::new("p1"));
            project
                .remote_services
                .insert("c1--p1--remote-service--svc".into(), json!({"url": "http://svc"}));
            config.projects.insert("p1".into(), project);

            store.persist_snapshot(&config).await.unwrap();
            assert_eq!(store.get_global_config().await.unwrap(), config);
        }
    }

    #[tokio::test]
    async fn test_watch_services_reports_only_self() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path().join("config.yaml"));
        let (tx, mut rx) = mpsc::channel(4);
        store.watch_services(tx).await.unwrap();
        match rx.recv().await.unwrap() {
            ReconcileEvent::Services(services) => {
                assert_eq!(services.len(), 1);
                assert_eq!(services.get("node-0").unwrap().addr, "10.0.0.1:4122");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
