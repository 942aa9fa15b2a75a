//! Consul store, spoken over the Consul HTTP API.
//!
//! Each node holds its instance key through a session with a TTL and renews
//! the session on a ticker. Watches are blocking `recurse` queries keyed on
//! `X-Consul-Index`; every wake-up re-reads the whole prefix.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{
    admin_key, instance_key, instances_prefix, key_suffix, projects_prefix, resource_key,
    EventSender, ReconcileEvent, ResourceSnapshot, Store,
};
use crate::{
    config::{ConsulConfig, StoreKind, SyncConfig},
    error::{SyncError, SyncResult},
    health::{HealthHandle, Registrar},
    metrics::SyncMetrics,
    model::{AdminConfig, ClusterConfig},
    resource::ResourceId,
    services::{ScServices, Service},
};

const STORE: &str = "consul";
const BLOCKING_WAIT: &str = "5m";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KvPair {
    pub key: String,
    /// Base64 encoded, `null` for empty values.
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub modify_index: u64,
}

impl KvPair {
    pub fn bytes(&self) -> SyncResult<Vec<u8>> {
        match &self.value {
            Some(v) => STANDARD
                .decode(v)
                .map_err(|e| SyncError::store(STORE, format!("invalid base64 value: {e}"))),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    #[serde(rename = "ID")]
    id: String,
}

// ============================================================================
// Prefix parsers
// ============================================================================

pub fn parse_services(cluster_id: &str, pairs: &[KvPair]) -> ScServices {
    let prefix = instances_prefix(cluster_id);
    pairs
        .iter()
        .filter_map(|kv| {
            let id = key_suffix(&kv.key, &prefix)?;
            let addr = String::from_utf8(kv.bytes().ok()?).ok()?;
            Some(Service::new(id, addr))
        })
        .collect()
}

pub fn parse_resources(cluster_id: &str, pairs: &[KvPair]) -> ResourceSnapshot {
    let prefix = projects_prefix(cluster_id);
    let mut snapshot = ResourceSnapshot::default();
    for kv in pairs {
        let Some(raw_id) = key_suffix(&kv.key, &prefix) else {
            continue;
        };
        let id = match ResourceId::parse(raw_id) {
            Ok(id) => id,
            Err(e) => {
                warn!(key = %kv.key, error = %e, "Sync manager: could not parse resource received");
                continue;
            }
        };
        let payload = kv
            .bytes()
            .and_then(|b| Ok(serde_json::from_slice::<Value>(&b)?));
        match payload {
            Ok(value) => snapshot.push(id, Some(value)),
            Err(e) => {
                warn!(resource_id = %id, error = %e, "Sync manager: could not parse resource received");
                snapshot.push(id, None);
            }
        }
    }
    snapshot
}

pub fn parse_admin(cluster_id: &str, pairs: &[KvPair]) -> AdminConfig {
    let key = admin_key(cluster_id);
    pairs
        .iter()
        .filter(|kv| kv.key == key)
        .find_map(|kv| match kv.bytes().and_then(|b| Ok(serde_json::from_slice::<AdminConfig>(&b)?)) {
            Ok(admin) => Some(admin),
            Err(e) => {
                warn!(error = %e, "Sync manager: could not parse admin config received");
                None
            }
        })
        .unwrap_or_default()
}

// ============================================================================
// HTTP client
// ============================================================================

#[derive(Clone)]
struct ConsulClient {
    http: reqwest::Client,
    address: String,
    token: Option<String>,
}

impl ConsulClient {
    fn new(config: &ConsulConfig) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            address: config.address.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.http.request(method, format!("{}{}", self.address, path));
        match &self.token {
            Some(token) => req.header("X-Consul-Token", token),
            None => req,
        }
    }

    async fn check(resp: reqwest::Response, what: &str) -> SyncResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(SyncError::store(STORE, format!("{what} returned {status}: {text}")))
    }

    async fn create_session(&self, name: &str, ttl_secs: u64) -> SyncResult<String> {
        let resp = self
            .request(reqwest::Method::PUT, "/v1/session/create")
            .json(&json!({"Name": name, "Behavior": "delete", "TTL": format!("{ttl_secs}s")}))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        let session: SessionResponse = Self::check(resp, "session create").await?.json().await?;
        Ok(session.id)
    }

    async fn renew_session(&self, session: &str) -> SyncResult<()> {
        let resp = self
            .request(reqwest::Method::PUT, &format!("/v1/session/renew/{session}"))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        Self::check(resp, "session renew").await?;
        Ok(())
    }

    async fn acquire(&self, key: &str, value: &[u8], session: &str) -> SyncResult<bool> {
        let resp = self
            .request(reqwest::Method::PUT, &format!("/v1/kv/{key}"))
            .query(&[("acquire", session)])
            .body(value.to_vec())
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        Ok(Self::check(resp, "kv acquire").await?.json().await?)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> SyncResult<()> {
        let resp = self
            .request(reqwest::Method::PUT, &format!("/v1/kv/{key}"))
            .body(value)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        Self::check(resp, "kv put").await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/v1/kv/{key}"))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        Self::check(resp, "kv delete").await?;
        Ok(())
    }

    /// Recursive read of `prefix`. With a non-zero `index` this blocks until
    /// the prefix changes or the wait expires. Returns the pairs and the new index.
    async fn list(&self, prefix: &str, index: u64) -> SyncResult<(Vec<KvPair>, u64)> {
        let mut req = self
            .request(reqwest::Method::GET, &format!("/v1/kv/{prefix}"))
            .query(&[("recurse", "true")]);
        if index > 0 {
            req = req
                .query(&[("index", index.to_string()), ("wait", BLOCKING_WAIT.to_string())])
                .timeout(Duration::from_secs(330));
        } else {
            req = req.timeout(Duration::from_secs(10));
        }
        let resp = req.send().await?;
        let new_index = resp
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok((Vec::new(), new_index));
        }
        let pairs: Vec<KvPair> = Self::check(resp, "kv list").await?.json().await?;
        Ok((pairs, new_index))
    }
}

/// Next index to block on, following Consul's reset rules.
fn next_index(previous: u64, returned: u64) -> u64 {
    if returned < previous {
        0
    } else {
        returned.max(1)
    }
}

// ============================================================================
// Store
// ============================================================================

pub struct ConsulStore {
    client: ConsulClient,
    cluster_id: String,
    node_id: String,
    advertise_addr: String,
    session_ttl_secs: u64,
    renew_interval: Duration,
    registrar: Registrar,
    shutdown: watch::Sender<bool>,
}

async fn acquire_instance(
    client: &ConsulClient,
    node_id: &str,
    key: &str,
    addr: &str,
    ttl_secs: u64,
) -> SyncResult<String> {
    let session = client.create_session(node_id, ttl_secs).await?;
    if !client.acquire(key, addr.as_bytes(), &session).await? {
        return Err(SyncError::Registration(format!(
            "instance key ({key}) is held by another session"
        )));
    }
    Ok(session)
}

impl ConsulStore {
    pub fn new(sync: &SyncConfig, config: ConsulConfig, health: HealthHandle) -> SyncResult<Self> {
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            client: ConsulClient::new(&config)?,
            cluster_id: sync.cluster_id.clone(),
            node_id: sync.node_id.clone(),
            advertise_addr: sync.advertise_addr.clone(),
            session_ttl_secs: config.session_ttl_secs,
            renew_interval: Duration::from_secs(config.renew_interval_secs),
            registrar: Registrar::new(STORE, &sync.registration, health),
            shutdown,
        })
    }

    /// First read of `prefix`, then a background blocking-query loop that
    /// re-emits `parse(pairs)` on every index change.
    async fn watch_prefix(
        &self,
        name: &'static str,
        prefix: String,
        events: EventSender,
        parse: fn(&str, &[KvPair]) -> ReconcileEvent,
    ) -> SyncResult<()> {
        let (pairs, index) = self.client.list(&prefix, 0).await?;
        events
            .send(parse(&self.cluster_id, &pairs))
            .await
            .map_err(|_| SyncError::NotRunning)?;

        let client = self.client.clone();
        let cluster_id = self.cluster_id.clone();
        let mut shutdown = self.shutdown.subscribe();
        let mut index = next_index(0, index);

        tokio::spawn(async move {
            let mut failures: u32 = 0;
            loop {
                let result = tokio::select! {
                    _ = shutdown.changed() => return,
                    r = client.list(&prefix, index) => r,
                };
                match result {
                    Ok((pairs, new_index)) => {
                        failures = 0;
                        if new_index == index {
                            continue;
                        }
                        index = next_index(index, new_index);
                        debug!(watch = name, index, "Consul prefix changed");
                        if events.send(parse(&cluster_id, &pairs)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let delay = Duration::from_millis(500u64.saturating_mul(1 << failures.min(6)));
                        warn!(watch = name, error = %e, "Consul watch failed, retrying in {:?}", delay);
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Store for ConsulStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Consul
    }

    async fn register(&self) -> SyncResult<()> {
        let key = instance_key(&self.cluster_id, &self.node_id);
        let ttl = self.session_ttl_secs;
        let mut session = self
            .registrar
            .join(|| acquire_instance(&self.client, &self.node_id, &key, &self.advertise_addr, ttl))
            .await?;
        info!(node_id = %self.node_id, session = %session, "Registered with consul");

        let client = self.client.clone();
        let node_id = self.node_id.clone();
        let addr = self.advertise_addr.clone();
        let registrar = self.registrar.clone();
        let interval = self.renew_interval;
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => {}
                }
                let Err(e) = client.renew_session(&session).await else {
                    continue;
                };
                warn!(error = %e, "Could not renew consul session");
                match registrar
                    .rejoin(|| acquire_instance(&client, &node_id, &key, &addr, ttl))
                    .await
                {
                    Ok(new_session) => {
                        info!(session = %new_session, "Re-registered with consul");
                        session = new_session;
                    }
                    Err(e) => error!(error = %e, "Could not re-register with consul"),
                }
            }
        });
        Ok(())
    }

    async fn watch_services(&self, events: EventSender) -> SyncResult<()> {
        self.watch_prefix(
            "services",
            instances_prefix(&self.cluster_id),
            events,
            |cluster_id, pairs| ReconcileEvent::Services(parse_services(cluster_id, pairs)),
        )
        .await
    }

    async fn watch_resources(&self, events: EventSender) -> SyncResult<()> {
        self.watch_prefix(
            "resources",
            projects_prefix(&self.cluster_id),
            events,
            |cluster_id, pairs| ReconcileEvent::ResourceSnapshot(parse_resources(cluster_id, pairs)),
        )
        .await
    }

    async fn watch_admin_config(&self, events: EventSender) -> SyncResult<()> {
        self.watch_prefix(
            "admin_config",
            admin_key(&self.cluster_id),
            events,
            |cluster_id, pairs| ReconcileEvent::AdminConfig(parse_admin(cluster_id, pairs)),
        )
        .await
    }

    async fn set_resource(&self, id: &ResourceId, payload: &Value) -> SyncResult<()> {
        let data = serde_json::to_vec(payload)?;
        let result = self.client.put(&resource_key(&self.cluster_id, id), data).await;
        SyncMetrics::record_store_write(STORE, "set", if result.is_ok() { "success" } else { "error" });
        result
    }

    async fn delete_resource(&self, id: &ResourceId) -> SyncResult<()> {
        let result = self.client.delete(&resource_key(&self.cluster_id, id)).await;
        SyncMetrics::record_store_write(STORE, "delete", if result.is_ok() { "success" } else { "error" });
        result
    }

    async fn set_admin_config(&self, admin: &AdminConfig) -> SyncResult<()> {
        let data = serde_json::to_vec(admin)?;
        let result = self.client.put(&admin_key(&self.cluster_id), data).await;
        SyncMetrics::record_store_write(STORE, "set_admin", if result.is_ok() { "success" } else { "error" });
        result
    }

    async fn get_global_config(&self) -> SyncResult<ClusterConfig> {
        let (admin_pairs, _) = self.client.list(&admin_key(&self.cluster_id), 0).await?;
        let admin = parse_admin(&self.cluster_id, &admin_pairs);
        let (pairs, _) = self.client.list(&projects_prefix(&self.cluster_id), 0).await?;
        let snapshot = parse_resources(&self.cluster_id, &pairs);

        let (config, errors) = ClusterConfig::from_resources(admin, &snapshot.resources);
        for e in errors {
            warn!(error = %e, "Skipping resource while loading consul config");
        }
        Ok(config)
    }

    async fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(key: &str, value: &[u8]) -> KvPair {
        KvPair {
            key: key.to_string(),
            value: Some(STANDARD.encode(value)),
            modify_index: 1,
        }
    }

    #[test]
    fn test_kv_pair_decodes_consul_json() {
        let raw = r#"[{"LockIndex":1,"Key":"sc/instances/c1/n1","Flags":0,"Value":"MTAuMC4wLjE6NDEyMg==","CreateIndex":5,"ModifyIndex":7,"Session":"abc"}]"#;
        let pairs: Vec<KvPair> = serde_json::from_str(raw).unwrap();
        assert_eq!(pairs[0].modify_index, 7);
        assert_eq!(pairs[0].bytes().unwrap(), b"10.0.0.1:4122");

        let empty: Vec<KvPair> = serde_json::from_str(r#"[{"Key":"k","Value":null}]"#).unwrap();
        assert!(empty[0].bytes().unwrap().is_empty());
    }

    #[test]
    fn test_parse_services_sorted_and_scoped() {
        let pairs = vec![
            kv("sc/instances/c1/node-b", b"10.0.0.2:4122"),
            kv("sc/instances/c10/node-z", b"10.0.0.9:4122"),
            kv("sc/instances/c1/node-a", b"10.0.0.1:4122"),
        ];
        let services = parse_services("c1", &pairs);
        let ids: Vec<_> = services.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["node-a", "node-b"]);
    }

    #[test]
    fn test_parse_resources_skips_malformed() {
        let good = ResourceId::project("c1", "p1").unwrap();
        let pairs = vec![
            kv(&resource_key("c1", &good), br#"{"id":"p1"}"#),
            kv("sc/projects/c1/not-an-id", b"{}"),
            kv(
                &resource_key("c1", &ResourceId::project("c1", "p2").unwrap()),
                b"not json",
            ),
        ];
        let snapshot = parse_resources("c1", &pairs);
        assert_eq!(snapshot.resources.len(), 1);
        assert_eq!(snapshot.resources[0].0, good);
        // The unparsable payload keeps its key so it is not read as a delete.
        assert_eq!(
            snapshot.unreadable,
            vec![ResourceId::project("c1", "p2").unwrap()]
        );
    }

    #[test]
    fn test_parse_admin_defaults_when_absent() {
        assert_eq!(parse_admin("c1", &[]), AdminConfig::default());
        let pairs = vec![kv("sc/admin-config/c1", br#"{"clusterId":"c1","licenseKey":"k"}"#)];
        let admin = parse_admin("c1", &pairs);
        assert_eq!(admin.license_key, "k");
    }

    #[test]
    fn test_next_index_resets_when_going_backwards() {
        assert_eq!(next_index(10, 12), 12);
        assert_eq!(next_index(12, 5), 0);
        assert_eq!(next_index(0, 0), 1);
    }
}
