use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    config::{LocalConfig, StoreConfig, StoreKind, SyncConfig},
    error::{SyncError, SyncResult},
    health::HealthHandle,
    manager::{NoopHooks, SyncManager},
    model::{AdminConfig, ClusterConfig, ProjectConfig},
    pubsub::{ControlChannel, LicenseHandler, LicenseOperation, MemoryPubSub, PubSub},
    resource::{ResourceId, ResourceType},
    services::{ScServices, Service},
    store::{EventSender, ReconcileEvent, Store},
    tokens::{calc_index, calc_tokens},
};

/// Store with a fixed membership list and nothing else.
struct FixedMembershipStore {
    services: ScServices,
}

#[async_trait]
impl Store for FixedMembershipStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Local
    }

    async fn register(&self) -> SyncResult<()> {
        Ok(())
    }

    async fn watch_services(&self, events: EventSender) -> SyncResult<()> {
        events
            .send(ReconcileEvent::Services(self.services.clone()))
            .await
            .map_err(|_| SyncError::NotRunning)
    }

    async fn watch_resources(&self, _events: EventSender) -> SyncResult<()> {
        Ok(())
    }

    async fn watch_admin_config(&self, _events: EventSender) -> SyncResult<()> {
        Ok(())
    }

    async fn set_resource(&self, _id: &ResourceId, _payload: &Value) -> SyncResult<()> {
        Ok(())
    }

    async fn delete_resource(&self, _id: &ResourceId) -> SyncResult<()> {
        Ok(())
    }

    async fn set_admin_config(&self, _admin: &AdminConfig) -> SyncResult<()> {
        Ok(())
    }

    async fn get_global_config(&self) -> SyncResult<ClusterConfig> {
        Ok(ClusterConfig::default())
    }
}

fn local_config(node_id: &str, path: &Path) -> SyncConfig {
    let mut config = SyncConfig::new(
        node_id,
        "c1",
        "127.0.0.1:4122",
        StoreConfig::Local(LocalConfig {
            path: path.to_path_buf(),
        }),
    );
    config.registration.service_wait_attempts = 3;
    config.registration.service_wait_step_ms = 10;
    config
}

#[tokio::test]
async fn test_three_node_cluster_splits_tokens() {
    super::init_test_logging();
    let services = ScServices::new(
        ["2", "0", "1"]
            .into_iter()
            .map(|id| Service::new(id, format!("10.0.0.{id}:4122"))),
    );

    let mut ranges = Vec::new();
    for node in ["0", "1", "2"] {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(node, &dir.path().join("config.yaml"));
        let store = Arc::new(FixedMembershipStore {
            services: services.clone(),
        });
        let manager =
            SyncManager::with_store(&config, store, Arc::new(NoopHooks), HealthHandle::default());
        manager.start().await.unwrap();
        ranges.push(manager.get_assigned_tokens().await);
        assert_eq!(manager.is_leader().await, node == "0");
        manager.stop().await;
    }

    assert_eq!(ranges, vec![(0, 33), (34, 67), (68, 99)]);
    assert_eq!(calc_tokens(3, 100, 1), (34, 67));
    // Reverse lookup rounds the bucket down, so the last token lands one
    // past the last member even though forward assignment covers it.
    assert_eq!(calc_index(99, 100, 3), 3);
}

#[tokio::test]
async fn test_local_store_survives_restart() {
    super::init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");

    let manager = SyncManager::new(local_config("gateway-0", &path), Arc::new(NoopHooks))
        .await
        .unwrap();
    manager.start().await.unwrap();
    assert_eq!(manager.get_cluster_size().await, 1);
    assert!(manager.is_leader().await);
    assert_eq!(manager.get_assigned_tokens().await, (0, 99));

    manager
        .set_project_config(ProjectConfig::new("todo"))
        .await
        .unwrap();
    manager
        .set_resource(
            "todo",
            ResourceType::DatabaseRule,
            &["users"],
            json!({"rules": {"read": "allow"}}),
        )
        .await
        .unwrap();
    let mut admin = AdminConfig::default();
    admin.cluster.enable_telemetry = true;
    manager.set_admin_config(admin).await.unwrap();
    manager.stop().await;

    assert!(path.exists());

    let restarted = SyncManager::new(local_config("gateway-0", &path), Arc::new(NoopHooks))
        .await
        .unwrap();
    restarted.start().await.unwrap();
    let project = restarted.get_config("todo").await.unwrap();
    assert_eq!(project.project_config.context_time, 10);
    let rule_id = ResourceId::new("c1", "todo", ResourceType::DatabaseRule, &["users"]).unwrap();
    assert_eq!(
        project.database_rules.get(rule_id.as_str()),
        Some(&json!({"rules": {"read": "allow"}}))
    );
    assert!(restarted.get_global_config().await.admin.cluster.enable_telemetry);
    restarted.stop().await;
}

#[derive(Default)]
struct RecordingLicenses {
    upgrades: AtomicUsize,
}

#[async_trait]
impl LicenseHandler for RecordingLicenses {
    async fn upgrade(&self, _payload: Value) -> SyncResult<()> {
        self.upgrades.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn renew(&self, _payload: Value) -> SyncResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_only_the_leading_manager_runs_license_commands() {
    super::init_test_logging();
    let services = ScServices::new([
        Service::new("gateway-0", "10.0.0.1:4122"),
        Service::new("gateway-1", "10.0.0.2:4122"),
    ]);
    let bus: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new());
    let licenses = Arc::new(RecordingLicenses::default());

    let mut channels = Vec::new();
    let mut managers = Vec::new();
    for node in ["gateway-0", "gateway-1"] {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(node, &dir.path().join("config.yaml"));
        let store = Arc::new(FixedMembershipStore {
            services: services.clone(),
        });
        let manager =
            SyncManager::with_store(&config, store, Arc::new(NoopHooks), HealthHandle::default());
        manager.start().await.unwrap();

        let channel = ControlChannel::new(
            node,
            bus.clone(),
            Arc::new(manager.clone()),
            licenses.clone(),
        );
        channel.start().await.unwrap();
        channels.push(channel);
        managers.push(manager);
    }

    let sender = &channels[1];
    sender
        .send_command(
            "gateway-0",
            LicenseOperation::Upgrade,
            &json!({"license": "abc"}),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    let rejected = sender
        .send_command(
            "gateway-1",
            LicenseOperation::Upgrade,
            &json!({"license": "abc"}),
            Duration::from_secs(2),
        )
        .await;
    assert!(matches!(rejected, Err(SyncError::PubSub(_))));
    assert_eq!(licenses.upgrades.load(Ordering::SeqCst), 1);

    for channel in &channels {
        channel.stop().await;
    }
    for manager in &managers {
        manager.stop().await;
    }
}
