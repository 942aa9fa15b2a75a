//! Kubernetes store.
//!
//! Membership comes from the gateway pods of the cluster; resources and the
//! admin config live in labelled ConfigMaps. Kubernetes itself tracks pod
//! liveness, so `register` has nothing to do.

use std::{
    collections::{BTreeMap, HashSet},
    fmt::Debug,
};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::{
    api::core::v1::{ConfigMap, Pod},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    runtime::{
        watcher::{self, watcher, Event},
        WatchStreamExt,
    },
    Client, ResourceExt,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{EventSender, ReconcileEvent, ResourceEvent, ResourceSnapshot, Store};
use crate::{
    config::{KubeConfig, StoreKind, SyncConfig},
    error::{SyncError, SyncResult},
    metrics::SyncMetrics,
    model::{AdminConfig, ClusterConfig},
    resource::{EventKind, ResourceId},
    services::{ScServices, Service},
};

const FIELD_MANAGER: &str = "sc-syncman";
const STORE: &str = "kube";

pub struct KubeStore {
    client: Client,
    namespace: String,
    cluster_id: String,
    gateway_port: u16,
    shutdown: watch::Sender<bool>,
}

impl KubeStore {
    pub async fn new(sync: &SyncConfig, config: KubeConfig) -> SyncResult<Self> {
        let client = Client::try_default().await?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            client,
            namespace: config.namespace,
            cluster_id: sync.cluster_id.clone(),
            gateway_port: config.gateway_port,
            shutdown,
        })
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn resource_selector(&self) -> String {
        format!("clusterId={},kind", self.cluster_id)
    }

    fn admin_selector(&self) -> String {
        format!("adminConfig=adminConfig,clusterId={}", self.cluster_id)
    }

    fn admin_config_map_name(&self) -> String {
        format!("sc-admin-config-{}", self.cluster_id).to_lowercase()
    }

    async fn apply_config_map(&self, name: &str, config_map: &ConfigMap) -> SyncResult<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.config_maps()
            .patch(name, &params, &Patch::Apply(config_map))
            .await?;
        Ok(())
    }
}

// ============================================================================
// Pure mapping helpers
// ============================================================================

/// Name of the ConfigMap holding `id`: lower-cased with `_` replaced by `-`.
pub fn config_map_name(id: &ResourceId) -> String {
    id.as_str().to_lowercase().replace('_', "-")
}

/// Service entry for a gateway pod, or `None` while it is not Running with an IP.
pub fn pod_service(pod: &Pod, namespace: &str, port: u16) -> Option<Service> {
    let status = pod.status.as_ref()?;
    if status.phase.as_deref() != Some("Running") {
        return None;
    }
    status.pod_ip.as_deref().filter(|ip| !ip.is_empty())?;
    let name = pod.name_any();
    let addr = format!("{name}.gateway.{namespace}.svc.cluster.local:{port}");
    Some(Service::new(name, addr))
}

pub fn resource_config_map(
    cluster_id: &str,
    namespace: &str,
    id: &ResourceId,
    payload: &Value,
) -> SyncResult<ConfigMap> {
    let labels = BTreeMap::from([
        ("clusterId".to_string(), cluster_id.to_string()),
        ("kind".to_string(), id.resource_type().as_str().to_string()),
        ("projectId".to_string(), id.project_id().to_string()),
    ]);
    let data = BTreeMap::from([
        ("id".to_string(), id.to_string()),
        ("data".to_string(), serde_json::to_string(payload)?),
    ]);
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(id)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

/// Resource ID recorded in the `id` field of a resource ConfigMap.
pub fn config_map_id(config_map: &ConfigMap) -> SyncResult<ResourceId> {
    let name = config_map.name_any();
    let raw_id = config_map
        .data
        .as_ref()
        .and_then(|d| d.get("id"))
        .ok_or_else(|| SyncError::store(STORE, format!("config map ({name}) has no id field")))?;
    ResourceId::parse(raw_id)
}

/// Decode the `{id, data}` pair stored in a resource ConfigMap.
pub fn config_map_resource(config_map: &ConfigMap) -> SyncResult<(ResourceId, Value)> {
    let id = config_map_id(config_map)?;
    let payload = match config_map.data.as_ref().and_then(|d| d.get("data")) {
        Some(raw) => serde_json::from_str(raw)?,
        None => Value::Null,
    };
    Ok((id, payload))
}

/// Add a listed ConfigMap to `snapshot`. One whose payload cannot be decoded
/// is kept by ID so the listing does not read as a delete.
fn collect_config_map(snapshot: &mut ResourceSnapshot, config_map: &ConfigMap) {
    match config_map_resource(config_map) {
        Ok((id, payload)) => snapshot.push(id, Some(payload)),
        Err(e) => {
            warn!(config_map = %config_map.name_any(), error = %e, "Skipping config map");
            if let Ok(id) = config_map_id(config_map) {
                snapshot.push(id, None);
            }
        }
    }
}

fn config_map_admin(config_map: &ConfigMap) -> SyncResult<AdminConfig> {
    let raw = config_map
        .data
        .as_ref()
        .and_then(|d| d.get("cluster"))
        .ok_or_else(|| {
            SyncError::store(STORE, "field (cluster) not found in admin config map")
        })?;
    Ok(serde_json::from_str(raw)?)
}

fn default_admin(cluster_id: &str) -> AdminConfig {
    let mut admin = AdminConfig {
        cluster_id: cluster_id.to_string(),
        ..Default::default()
    };
    admin.cluster.enable_telemetry = true;
    admin
}

/// Returns true when the registry changed.
fn apply_pod(services: &mut ScServices, pod: &Pod, namespace: &str, port: u16) -> bool {
    match pod_service(pod, namespace, port) {
        Some(service) => services.upsert(service),
        None => {
            debug!(pod = %pod.name_any(), "Pod isn't running yet");
            services.remove(&pod.name_any()).is_some()
        }
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Drive a kube watcher until shutdown, forwarding whatever `handle` maps
/// each event to.
async fn run_watcher<K, F>(
    name: &'static str,
    api: Api<K>,
    labels: String,
    events: EventSender,
    mut shutdown: watch::Receiver<bool>,
    mut handle: F,
) where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    F: FnMut(Event<K>) -> Option<ReconcileEvent> + Send + 'static,
{
    let mut stream = watcher(api, watcher::Config::default().labels(&labels))
        .default_backoff()
        .boxed();
    info!(watch = name, labels = %labels, "Kubernetes watcher started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!(watch = name, "Kubernetes watcher stopped");
                return;
            }
            next = stream.next() => {
                let event = match next {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => {
                        warn!(watch = name, error = %e, "Kubernetes watch error");
                        continue;
                    }
                    None => {
                        warn!(watch = name, "Kubernetes watch stream ended");
                        return;
                    }
                };
                if let Some(out) = handle(event) {
                    if events.send(out).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Store for KubeStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Kube
    }

    async fn register(&self) -> SyncResult<()> {
        Ok(())
    }

    async fn watch_services(&self, events: EventSender) -> SyncResult<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let labels = format!("app=gateway,clusterId={}", self.cluster_id);
        let namespace = self.namespace.clone();
        let port = self.gateway_port;

        let mut services = ScServices::default();
        let mut pending: Option<ScServices> = None;
        let handle = move |event: Event<Pod>| match event {
            Event::Init => {
                pending = Some(ScServices::default());
                None
            }
            Event::InitApply(pod) => {
                if let Some(p) = pending.as_mut() {
                    apply_pod(p, &pod, &namespace, port);
                }
                None
            }
            Event::InitDone => {
                if let Some(p) = pending.take() {
                    services = p;
                }
                Some(ReconcileEvent::Services(services.clone()))
            }
            Event::Apply(pod) => apply_pod(&mut services, &pod, &namespace, port)
                .then(|| ReconcileEvent::Services(services.clone())),
            Event::Delete(pod) => services
                .remove(&pod.name_any())
                .map(|_| ReconcileEvent::Services(services.clone())),
        };

        tokio::spawn(run_watcher(
            "services",
            pods,
            labels,
            events,
            self.shutdown.subscribe(),
            handle,
        ));
        Ok(())
    }

    async fn watch_resources(&self, events: EventSender) -> SyncResult<()> {
        let mut known: HashSet<ResourceId> = HashSet::new();
        let mut pending = ResourceSnapshot::default();
        let handle = move |event: Event<ConfigMap>| match event {
            Event::Init => {
                pending = ResourceSnapshot::default();
                None
            }
            Event::InitApply(cm) => {
                collect_config_map(&mut pending, &cm);
                None
            }
            Event::InitDone => {
                let snapshot = std::mem::take(&mut pending);
                known = snapshot.ids().cloned().collect();
                Some(ReconcileEvent::ResourceSnapshot(snapshot))
            }
            Event::Apply(cm) => match config_map_resource(&cm) {
                Ok((id, payload)) => {
                    let kind = if known.insert(id.clone()) {
                        EventKind::Add
                    } else {
                        EventKind::Update
                    };
                    Some(ReconcileEvent::Resource(ResourceEvent::upsert(
                        kind, id, payload,
                    )))
                }
                Err(e) => {
                    warn!(config_map = %cm.name_any(), error = %e, "Skipping config map");
                    None
                }
            },
            Event::Delete(cm) => match config_map_resource(&cm) {
                Ok((id, _)) => {
                    known.remove(&id);
                    Some(ReconcileEvent::Resource(ResourceEvent::delete(id)))
                }
                Err(e) => {
                    warn!(config_map = %cm.name_any(), error = %e, "Cannot resolve deleted config map");
                    None
                }
            },
        };

        tokio::spawn(run_watcher(
            "resources",
            self.config_maps(),
            self.resource_selector(),
            events,
            self.shutdown.subscribe(),
            handle,
        ));
        Ok(())
    }

    async fn watch_admin_config(&self, events: EventSender) -> SyncResult<()> {
        let cluster_id = self.cluster_id.clone();
        let mut seen = false;
        let handle = move |event: Event<ConfigMap>| match event {
            Event::Init => {
                seen = false;
                None
            }
            Event::InitApply(cm) | Event::Apply(cm) => match config_map_admin(&cm) {
                Ok(admin) => {
                    seen = true;
                    Some(ReconcileEvent::AdminConfig(admin))
                }
                Err(e) => {
                    error!(error = %e, "Unable to decode admin config map");
                    None
                }
            },
            Event::InitDone => {
                (!seen).then(|| ReconcileEvent::AdminConfig(default_admin(&cluster_id)))
            }
            Event::Delete(_) => Some(ReconcileEvent::AdminConfig(default_admin(&cluster_id))),
        };

        tokio::spawn(run_watcher(
            "admin_config",
            self.config_maps(),
            self.admin_selector(),
            events,
            self.shutdown.subscribe(),
            handle,
        ));
        Ok(())
    }

    async fn set_resource(&self, id: &ResourceId, payload: &Value) -> SyncResult<()> {
        let config_map = resource_config_map(&self.cluster_id, &self.namespace, id, payload)?;
        let result = self.apply_config_map(&config_map_name(id), &config_map).await;
        SyncMetrics::record_store_write(STORE, "set", if result.is_ok() { "success" } else { "error" });
        result
    }

    async fn delete_resource(&self, id: &ResourceId) -> SyncResult<()> {
        let name = config_map_name(id);
        let result = match self.config_maps().delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        };
        SyncMetrics::record_store_write(STORE, "delete", if result.is_ok() { "success" } else { "error" });
        result
    }

    async fn set_admin_config(&self, admin: &AdminConfig) -> SyncResult<()> {
        let name = self.admin_config_map_name();
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([
                    ("adminConfig".to_string(), "adminConfig".to_string()),
                    ("clusterId".to_string(), self.cluster_id.clone()),
                ])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "cluster".to_string(),
                serde_json::to_string(admin)?,
            )])),
            ..Default::default()
        };
        let result = self.apply_config_map(&name, &config_map).await;
        SyncMetrics::record_store_write(STORE, "set_admin", if result.is_ok() { "success" } else { "error" });
        result
    }

    async fn get_global_config(&self) -> SyncResult<ClusterConfig> {
        let api = self.config_maps();

        let admin = match api.get_opt(&self.admin_config_map_name()).await? {
            Some(cm) => config_map_admin(&cm)?,
            None => default_admin(&self.cluster_id),
        };

        let list = api
            .list(&ListParams::default().labels(&self.resource_selector()))
            .await?;
        let mut snapshot = ResourceSnapshot::default();
        for cm in &list.items {
            collect_config_map(&mut snapshot, cm);
        }

        let (config, errors) = ClusterConfig::from_resources(admin, &snapshot.resources);
        for e in errors {
            warn!(error = %e, "Skipping resource while loading kube config");
        }
        Ok(config)
    }

    async fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::PodStatus;
    use serde_json::json;

    use super::*;
    use crate::resource::ResourceType;

    fn pod(name: &str, phase: &str, ip: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: ip.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_map_name() {
        let id = ResourceId::new("Prod", "my_app", ResourceType::DatabaseRule, &["db", "Users"])
            .unwrap();
        assert_eq!(config_map_name(&id), "prod--my-app--db-rule--db--users");
    }

    #[test]
    fn test_pod_excluded_until_running_with_ip() {
        assert!(pod_service(&pod("gateway-0", "Pending", Some("10.0.0.1")), "sc", 4122).is_none());
        assert!(pod_service(&pod("gateway-0", "Running", None), "sc", 4122).is_none());
        assert!(pod_service(&pod("gateway-0", "Running", Some("")), "sc", 4122).is_none());

        let svc = pod_service(&pod("gateway-0", "Running", Some("10.0.0.1")), "sc", 4122).unwrap();
        assert_eq!(svc.id, "gateway-0");
        assert_eq!(svc.addr, "gateway-0.gateway.sc.svc.cluster.local:4122");
    }

    #[test]
    fn test_apply_pod_removes_pod_that_stops_running() {
        let mut services = ScServices::default();
        assert!(apply_pod(&mut services, &pod("gateway-1", "Running", Some("10.0.0.2")), "sc", 4122));
        assert!(!apply_pod(&mut services, &pod("gateway-1", "Running", Some("10.0.0.2")), "sc", 4122));
        assert!(apply_pod(&mut services, &pod("gateway-1", "Failed", Some("10.0.0.2")), "sc", 4122));
        assert!(services.is_empty());
    }

    #[test]
    fn test_resource_config_map_round_trip() {
        let id = ResourceId::new("c1", "p1", ResourceType::IngressRoute, &["r1"]).unwrap();
        let payload = json!({"source": {"hosts": ["example.com"]}});
        let cm = resource_config_map("c1", "sc", &id, &payload).unwrap();

        let labels = cm.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["clusterId"], "c1");
        assert_eq!(labels["kind"], "ingress-route");
        assert_eq!(labels["projectId"], "p1");

        let (back_id, back_payload) = config_map_resource(&cm).unwrap();
        assert_eq!(back_id, id);
        assert_eq!(back_payload, payload);
    }

    #[test]
    fn test_config_map_without_id_is_rejected() {
        let cm = ConfigMap {
            data: Some(BTreeMap::from([("data".to_string(), "{}".to_string())])),
            ..Default::default()
        };
        assert!(config_map_resource(&cm).is_err());
    }

    #[test]
    fn test_unparsable_config_map_is_listed_as_unreadable() {
        let good = ResourceId::project("c1", "p1").unwrap();
        let bad = ResourceId::project("c1", "p2").unwrap();
        let mut broken = resource_config_map("c1", "sc", &bad, &json!({})).unwrap();
        broken
            .data
            .as_mut()
            .unwrap()
            .insert("data".to_string(), "{not json".to_string());

        let mut snapshot = ResourceSnapshot::default();
        collect_config_map(
            &mut snapshot,
            &resource_config_map("c1", "sc", &good, &json!({"id": "p1"})).unwrap(),
        );
        collect_config_map(&mut snapshot, &broken);
        collect_config_map(&mut snapshot, &ConfigMap::default());

        assert_eq!(snapshot.resources, vec![(good, json!({"id": "p1"}))]);
        assert_eq!(snapshot.unreadable, vec![bad]);
    }

    #[test]
    fn test_default_admin_enables_telemetry() {
        let admin = default_admin("c1");
        assert!(admin.cluster.enable_telemetry);
        assert_eq!(admin.cluster_id, "c1");
    }
}
