//! etcd store, spoken over the etcd v3 JSON gateway.
//!
//! Membership is a leased key per node kept alive by a renewal task.
//! Watches track `(create_revision, mod_revision)` per key so that events
//! delivered out of order never roll state back.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{
    admin_key, instance_key, instances_prefix, key_suffix, projects_prefix, resource_key,
    EventSender, ReconcileEvent, ResourceSnapshot, Store,
};
use crate::{
    config::{EtcdConfig, StoreKind, SyncConfig},
    error::{SyncError, SyncResult},
    health::{HealthHandle, Registrar},
    metrics::SyncMetrics,
    model::{AdminConfig, ClusterConfig},
    resource::ResourceId,
    services::{ScServices, Service},
};

const STORE: &str = "etcd";

// ============================================================================
// Revision tracking
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedItemMeta<T> {
    pub create_revision: i64,
    pub mod_revision: i64,
    pub payload: T,
}

/// Per-key revision bookkeeping for one watched prefix.
#[derive(Debug, Clone)]
pub struct RevisionTracker<T> {
    items: BTreeMap<String, TrackedItemMeta<T>>,
}

impl<T> Default for RevisionTracker<T> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<T> RevisionTracker<T> {
    pub fn seed(&mut self, key: impl Into<String>, create_revision: i64, mod_revision: i64, payload: T) {
        self.items.insert(
            key.into(),
            TrackedItemMeta {
                create_revision,
                mod_revision,
                payload,
            },
        );
    }

    /// Returns true when the put changed tracked state.
    pub fn apply_put(
        &mut self,
        key: &str,
        create_revision: i64,
        mod_revision: i64,
        payload: T,
    ) -> bool {
        let Some(meta) = self.items.get_mut(key) else {
            self.seed(key, create_revision, mod_revision, payload);
            return true;
        };
        if create_revision < meta.create_revision {
            return false;
        }
        if create_revision > meta.create_revision || mod_revision > meta.mod_revision {
            meta.create_revision = create_revision;
            meta.mod_revision = mod_revision;
            meta.payload = payload;
            return true;
        }
        false
    }

    /// Returns true when the delete removed a tracked key.
    pub fn apply_delete(&mut self, key: &str, mod_revision: i64) -> bool {
        match self.items.get(key) {
            Some(meta) if mod_revision > meta.mod_revision => {
                self.items.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&TrackedItemMeta<T>> {
        self.items.get(key)
    }

    pub fn payloads(&self) -> impl Iterator<Item = &T> {
        self.items.values().map(|m| &m.payload)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ============================================================================
// Gateway wire types
// ============================================================================

/// The JSON gateway encodes int64 fields as strings.
fn de_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Num {
        Str(String),
        Int(i64),
    }
    match Num::deserialize(d)? {
        Num::Int(i) => Ok(i),
        Num::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResponseHeader {
    #[serde(default, deserialize_with = "de_i64")]
    revision: i64,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "de_i64")]
    create_revision: i64,
    #[serde(default, deserialize_with = "de_i64")]
    mod_revision: i64,
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    header: ResponseHeader,
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct LeaseGrantResponse {
    #[serde(rename = "ID", deserialize_with = "de_i64")]
    id: i64,
}

#[derive(Debug, Deserialize)]
struct KeepAliveResponse {
    result: Option<KeepAliveResult>,
}

#[derive(Debug, Deserialize)]
struct KeepAliveResult {
    #[serde(rename = "TTL", default, deserialize_with = "de_i64")]
    ttl: i64,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct WatchLine {
    result: Option<WatchResult>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WatchResult {
    #[serde(default)]
    events: Vec<WatchEvent>,
    #[serde(default)]
    canceled: bool,
}

#[derive(Debug, Deserialize)]
struct WatchEvent {
    /// PUT is the enum default and is omitted on the wire.
    #[serde(rename = "type", default)]
    kind: Option<String>,
    kv: KeyValue,
}

impl WatchEvent {
    fn is_delete(&self) -> bool {
        self.kind.as_deref() == Some("DELETE")
    }
}

fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn decode(raw: &str) -> SyncResult<Vec<u8>> {
    STANDARD
        .decode(raw)
        .map_err(|e| SyncError::store(STORE, format!("invalid base64 from etcd: {e}")))
}

fn decode_string(raw: &str) -> SyncResult<String> {
    String::from_utf8(decode(raw)?)
        .map_err(|e| SyncError::store(STORE, format!("non utf-8 key or value: {e}")))
}

/// Smallest key greater than every key starting with `prefix`.
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // All 0xff: range to the end of the keyspace.
    vec![0]
}

// ============================================================================
// Gateway client
// ============================================================================

#[derive(Clone)]
struct EtcdClient {
    http: reqwest::Client,
    endpoints: Arc<Vec<String>>,
    credentials: Option<(String, String)>,
    token: Arc<RwLock<Option<String>>>,
}

impl EtcdClient {
    fn new(config: &EtcdConfig) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        let credentials = match (&config.username, &config.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        };
        Ok(Self {
            http,
            endpoints: Arc::new(
                config
                    .endpoints
                    .iter()
                    .map(|e| e.trim_end_matches('/').to_string())
                    .collect(),
            ),
            credentials,
            token: Arc::new(RwLock::new(None)),
        })
    }

    async fn ensure_token(&self) -> SyncResult<()> {
        let Some((name, password)) = &self.credentials else {
            return Ok(());
        };
        if self.token.read().is_some() {
            return Ok(());
        }
        let resp = self
            .send("/v3/auth/authenticate", &json!({"name": name, "password": password}), None)
            .await?;
        let auth: AuthResponse = resp.json().await?;
        *self.token.write() = Some(auth.token);
        Ok(())
    }

    /// POST to the first endpoint that answers.
    async fn send(
        &self,
        path: &str,
        body: &Value,
        timeout: Option<Duration>,
    ) -> SyncResult<reqwest::Response> {
        let token = self.token.read().clone();
        let mut last_err = None;
        for endpoint in self.endpoints.iter() {
            let mut req = self.http.post(format!("{endpoint}{path}")).json(body);
            if let Some(token) = &token {
                req = req.header("Authorization", token);
            }
            if let Some(timeout) = timeout {
                req = req.timeout(timeout);
            }
            match req.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    if status == reqwest::StatusCode::UNAUTHORIZED {
                        *self.token.write() = None;
                    }
                    let text = resp.text().await.unwrap_or_default();
                    return Err(SyncError::store(
                        STORE,
                        format!("{path} returned {status}: {text}"),
                    ));
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "etcd endpoint unreachable");
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => e.into(),
            None => SyncError::store(STORE, "no endpoints configured"),
        })
    }

    async fn call<T: DeserializeOwned>(&self, path: &str, body: Value) -> SyncResult<T> {
        self.ensure_token().await?;
        let resp = self.send(path, &body, Some(Duration::from_secs(5))).await?;
        Ok(resp.json().await?)
    }

    async fn range(&self, key: &str, prefix: bool) -> SyncResult<RangeResponse> {
        let mut body = json!({"key": encode(key.as_bytes())});
        if prefix {
            body["range_end"] = json!(encode(&prefix_range_end(key.as_bytes())));
        }
        self.call("/v3/kv/range", body).await
    }

    async fn put(&self, key: &str, value: &[u8], lease: Option<i64>) -> SyncResult<()> {
        let mut body = json!({"key": encode(key.as_bytes()), "value": encode(value)});
        if let Some(lease) = lease {
            body["lease"] = json!(lease.to_string());
        }
        let _: Value = self.call("/v3/kv/put", body).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        let _: Value = self
            .call("/v3/kv/deleterange", json!({"key": encode(key.as_bytes())}))
            .await?;
        Ok(())
    }

    async fn grant_lease(&self, ttl: i64) -> SyncResult<i64> {
        let resp: LeaseGrantResponse = self.call("/v3/lease/grant", json!({"TTL": ttl})).await?;
        Ok(resp.id)
    }

    /// Returns false once the lease has expired.
    async fn keep_alive(&self, lease: i64) -> SyncResult<bool> {
        let resp: KeepAliveResponse = self
            .call("/v3/lease/keepalive", json!({"ID": lease.to_string()}))
            .await?;
        Ok(resp.result.is_some_and(|r| r.ttl > 0))
    }

    async fn open_watch(&self, key: &str, prefix: bool, start_revision: i64) -> SyncResult<reqwest::Response> {
        self.ensure_token().await?;
        let mut create = json!({
            "key": encode(key.as_bytes()),
            "start_revision": start_revision.to_string(),
        });
        if prefix {
            create["range_end"] = json!(encode(&prefix_range_end(key.as_bytes())));
        }
        self.send("/v3/watch", &json!({"create_request": create}), None)
            .await
    }
}

// ============================================================================
// Watches
// ============================================================================

/// A watched key range and how its entries map to reconcile events.
struct KeyWatch<T> {
    name: &'static str,
    key: String,
    prefix: bool,
    decode: fn(&str, &[u8]) -> SyncResult<T>,
    emit: fn(&RevisionTracker<T>) -> ReconcileEvent,
}

impl<T: Send + 'static> KeyWatch<T> {
    fn entry_name<'a>(&self, key: &'a str) -> Option<&'a str> {
        if self.prefix {
            key_suffix(key, &self.key)
        } else {
            (key == self.key).then_some(key)
        }
    }

    /// Range read into a fresh tracker. Returns the tracker and the store revision.
    async fn seed(&self, client: &EtcdClient) -> SyncResult<(RevisionTracker<T>, i64)> {
        let resp = client.range(&self.key, self.prefix).await?;
        let mut tracker = RevisionTracker::default();
        for kv in resp.kvs {
            let key = decode_string(&kv.key)?;
            let Some(name) = self.entry_name(&key) else {
                continue;
            };
            match (self.decode)(name, &decode(&kv.value)?) {
                Ok(item) => tracker.seed(key.clone(), kv.create_revision, kv.mod_revision, item),
                Err(e) => warn!(watch = self.name, key = %key, error = %e, "Skipping unparsable entry"),
            }
        }
        Ok((tracker, resp.header.revision))
    }

    /// Apply one watch event. Returns true when state changed.
    fn apply(&self, tracker: &mut RevisionTracker<T>, event: WatchEvent) -> SyncResult<bool> {
        let key = decode_string(&event.kv.key)?;
        let Some(name) = self.entry_name(&key) else {
            return Ok(false);
        };
        if event.is_delete() {
            return Ok(tracker.apply_delete(&key, event.kv.mod_revision));
        }
        match (self.decode)(name, &decode(&event.kv.value)?) {
            Ok(item) => Ok(tracker.apply_put(&key, event.kv.create_revision, event.kv.mod_revision, item)),
            Err(e) => {
                warn!(watch = self.name, key = %key, error = %e, "Skipping unparsable entry");
                Ok(false)
            }
        }
    }

    /// Follow the watch stream until it breaks. Returns the last revision seen.
    async fn follow(
        &self,
        client: &EtcdClient,
        tracker: &mut RevisionTracker<T>,
        mut revision: i64,
        events: &EventSender,
    ) -> SyncResult<i64> {
        let resp = client.open_watch(&self.key, self.prefix, revision + 1).await?;
        let mut body = resp.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();

        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let line: WatchLine = serde_json::from_slice(&line)?;
                if let Some(err) = line.error {
                    return Err(SyncError::store(STORE, format!("watch error: {err}")));
                }
                let Some(result) = line.result else {
                    continue;
                };
                if result.canceled {
                    return Err(SyncError::store(STORE, "watch canceled by server"));
                }

                let mut changed = false;
                for event in result.events {
                    revision = revision.max(event.kv.mod_revision);
                    changed |= self.apply(tracker, event)?;
                }
                if changed && events.send((self.emit)(tracker)).await.is_err() {
                    return Err(SyncError::NotRunning);
                }
            }
        }
        Ok(revision)
    }

    /// Seed, emit, then keep the range in sync until shutdown.
    async fn start(
        self,
        client: EtcdClient,
        events: EventSender,
        mut shutdown: watch::Receiver<bool>,
    ) -> SyncResult<()> {
        let (mut tracker, mut revision) = self.seed(&client).await?;
        events
            .send((self.emit)(&tracker))
            .await
            .map_err(|_| SyncError::NotRunning)?;

        tokio::spawn(async move {
            let mut failures: u32 = 0;
            loop {
                let result = tokio::select! {
                    _ = shutdown.changed() => return,
                    r = self.follow(&client, &mut tracker, revision, &events) => r,
                };
                match result {
                    Err(SyncError::NotRunning) => return,
                    Ok(rev) => {
                        revision = rev;
                        failures = 0;
                        debug!(watch = self.name, revision, "etcd watch stream closed, reopening");
                        continue;
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let delay = Duration::from_millis(500u64.saturating_mul(1 << failures.min(6)));
                        warn!(watch = self.name, error = %e, "etcd watch failed, resyncing in {:?}", delay);
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }

                // Resync after a failure: the revision may have been compacted.
                match self.seed(&client).await {
                    Ok((fresh, rev)) => {
                        tracker = fresh;
                        revision = rev;
                        if events.send((self.emit)(&tracker)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(watch = self.name, error = %e, "etcd resync failed"),
                }
            }
        });
        Ok(())
    }
}

fn decode_service(name: &str, value: &[u8]) -> SyncResult<Service> {
    let addr = String::from_utf8(value.to_vec())
        .map_err(|e| SyncError::store(STORE, format!("invalid address: {e}")))?;
    Ok(Service::new(name, addr))
}

/// Resolve the resource ID from the key. An unreadable payload keeps the
/// key tracked with no value so it is never mistaken for a delete.
fn decode_resource(name: &str, value: &[u8]) -> SyncResult<(ResourceId, Option<Value>)> {
    let id = ResourceId::parse(name)?;
    match serde_json::from_slice(value) {
        Ok(payload) => Ok((id, Some(payload))),
        Err(e) => {
            warn!(resource_id = %id, error = %e, "Sync manager: could not parse resource received");
            Ok((id, None))
        }
    }
}

fn decode_admin(_name: &str, value: &[u8]) -> SyncResult<AdminConfig> {
    Ok(serde_json::from_slice(value)?)
}

fn emit_services(tracker: &RevisionTracker<Service>) -> ReconcileEvent {
    ReconcileEvent::Services(ScServices::new(tracker.payloads().cloned()))
}

fn emit_resources(tracker: &RevisionTracker<(ResourceId, Option<Value>)>) -> ReconcileEvent {
    ReconcileEvent::ResourceSnapshot(tracker.payloads().cloned().collect::<ResourceSnapshot>())
}

fn emit_admin(tracker: &RevisionTracker<AdminConfig>) -> ReconcileEvent {
    ReconcileEvent::AdminConfig(tracker.payloads().next().cloned().unwrap_or_default())
}

// ============================================================================
// Store
// ============================================================================

pub struct EtcdStore {
    client: EtcdClient,
    cluster_id: String,
    node_id: String,
    advertise_addr: String,
    lease_ttl: i64,
    registrar: Registrar,
    shutdown: watch::Sender<bool>,
}

impl EtcdStore {
    pub fn new(sync: &SyncConfig, config: EtcdConfig, health: HealthHandle) -> SyncResult<Self> {
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            client: EtcdClient::new(&config)?,
            cluster_id: sync.cluster_id.clone(),
            node_id: sync.node_id.clone(),
            advertise_addr: sync.advertise_addr.clone(),
            lease_ttl: config.lease_ttl_secs,
            registrar: Registrar::new(STORE, &sync.registration, health),
            shutdown,
        })
    }
}

async fn register_instance(client: &EtcdClient, key: &str, addr: &str, ttl: i64) -> SyncResult<i64> {
    let lease = client.grant_lease(ttl).await?;
    client.put(key, addr.as_bytes(), Some(lease)).await?;
    Ok(lease)
}

#[async_trait]
impl Store for EtcdStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Etcd
    }

    async fn register(&self) -> SyncResult<()> {
        let key = instance_key(&self.cluster_id, &self.node_id);
        let mut lease = self
            .registrar
            .join(|| register_instance(&self.client, &key, &self.advertise_addr, self.lease_ttl))
            .await?;
        info!(node_id = %self.node_id, lease, "Registered with etcd");

        let client = self.client.clone();
        let addr = self.advertise_addr.clone();
        let ttl = self.lease_ttl;
        let registrar = self.registrar.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval = Duration::from_secs((ttl / 3).max(1) as u64);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => {}
                }
                let alive = match client.keep_alive(lease).await {
                    Ok(alive) => alive,
                    Err(e) => {
                        warn!(lease, error = %e, "Could not renew etcd lease");
                        false
                    }
                };
                if alive {
                    continue;
                }
                match registrar
                    .rejoin(|| register_instance(&client, &key, &addr, ttl))
                    .await
                {
                    Ok(new_lease) => {
                        info!(lease = new_lease, "Re-registered with etcd");
                        lease = new_lease;
                    }
                    Err(e) => error!(error = %e, "Could not re-register with etcd"),
                }
            }
        });
        Ok(())
    }

    async fn watch_services(&self, events: EventSender) -> SyncResult<()> {
        KeyWatch {
            name: "services",
            key: instances_prefix(&self.cluster_id),
            prefix: true,
            decode: decode_service,
            emit: emit_services,
        }
        .start(self.client.clone(), events, self.shutdown.subscribe())
        .await
    }

    async fn watch_resources(&self, events: EventSender) -> SyncResult<()> {
        KeyWatch {
            name: "resources",
            key: projects_prefix(&self.cluster_id),
            prefix: true,
            decode: decode_resource,
            emit: emit_resources,
        }
        .start(self.client.clone(), events, self.shutdown.subscribe())
        .await
    }

    async fn watch_admin_config(&self, events: EventSender) -> SyncResult<()> {
        KeyWatch {
            name: "admin_config",
            key: admin_key(&self.cluster_id),
            prefix: false,
            decode: decode_admin,
            emit: emit_admin,
        }
        .start(self.client.clone(), events, self.shutdown.subscribe())
        .await
    }

    async fn set_resource(&self, id: &ResourceId, payload: &Value) -> SyncResult<()> {
        let data = serde_json::to_vec(payload)?;
        let result = self
            .client
            .put(&resource_key(&self.cluster_id, id), &data, None)
            .await;
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
        let result = self.client.put(&admin_key(&self.cluster_id), &data, None).await;
        SyncMetrics::record_store_write(STORE, "set_admin", if result.is_ok() { "success" } else { "error" });
        result
    }

    async fn get_global_config(&self) -> SyncResult<ClusterConfig> {
        let admin_resp = self.client.range(&admin_key(&self.cluster_id), false).await?;
        let admin = match admin_resp.kvs.first() {
            Some(kv) => serde_json::from_slice(&decode(&kv.value)?)?,
            None => AdminConfig::default(),
        };

        let prefix = projects_prefix(&self.cluster_id);
        let resp = self.client.range(&prefix, true).await?;
        let mut resources = Vec::with_capacity(resp.kvs.len());
        for kv in resp.kvs {
            let key = decode_string(&kv.key)?;
            let Some(name) = key_suffix(&key, &prefix) else {
                continue;
            };
            match decode_resource(name, &decode(&kv.value)?) {
                Ok((id, Some(payload))) => resources.push((id, payload)),
                Ok((_, None)) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping unparsable resource"),
            }
        }

        let (config, errors) = ClusterConfig::from_resources(admin, &resources);
        for e in errors {
            warn!(error = %e, "Skipping resource while loading etcd config");
        }
        Ok(config)
    }

    async fn close(&self) {
        self.shutdown.send_replace(true);
    }
}
