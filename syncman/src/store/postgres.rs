//! Postgres store.
//!
//! Resources are rows of `<schema>.sc_config` scoped by cluster id. There
//! is no change feed: a ticker re-reads the cluster's rows and a
//! [`ChangeTracker`] turns the difference into add/update/delete events.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use deadpool_postgres::{Pool, Runtime};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

use super::{EventSender, ReconcileEvent, ResourceEvent, ResourceSnapshot, Store};
use crate::{
    config::{PostgresConfig, StoreKind, SyncConfig},
    error::{SyncError, SyncResult},
    metrics::SyncMetrics,
    model::{AdminConfig, ClusterConfig},
    resource::{EventKind, ResourceId},
    services::{ScServices, Service},
};

const STORE: &str = "postgres";
const ADMIN_RESOURCE_TYPE: &str = "admin-config";

fn content_hash(value: &Value) -> SyncResult<blake3::Hash> {
    // serde_json maps are ordered, so equal values serialize to equal bytes.
    Ok(blake3::hash(&serde_json::to_vec(value)?))
}

fn admin_hash(admin: &AdminConfig) -> SyncResult<blake3::Hash> {
    content_hash(&serde_json::to_value(admin)?)
}

/// Content hashes of the last rows seen, keyed by resource id.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    hashes: BTreeMap<ResourceId, blake3::Hash>,
}

impl ChangeTracker {
    /// Tracker that treats `snapshot` as already delivered.
    pub fn seeded(snapshot: impl Into<ResourceSnapshot>) -> SyncResult<Self> {
        let mut tracker = Self::default();
        tracker.diff(snapshot)?;
        Ok(tracker)
    }

    /// Compare a full read against the previous one and return the events
    /// that take a reader from the old state to the new. Unreadable rows
    /// keep their previous hash and never produce an event.
    pub fn diff(&mut self, snapshot: impl Into<ResourceSnapshot>) -> SyncResult<Vec<ResourceEvent>> {
        let ResourceSnapshot {
            resources,
            unreadable,
        } = snapshot.into();
        let mut next = BTreeMap::new();
        let mut events = Vec::new();

        for id in unreadable {
            if let Some(prev) = self.hashes.get(&id) {
                next.insert(id, *prev);
            }
        }

        for (id, payload) in resources {
            let hash = content_hash(&payload)?;
            match self.hashes.get(&id) {
                None => events.push(ResourceEvent::upsert(EventKind::Add, id.clone(), payload)),
                Some(prev) if *prev != hash => {
                    events.push(ResourceEvent::upsert(EventKind::Update, id.clone(), payload))
                }
                Some(_) => {}
            }
            next.insert(id, hash);
        }

        for id in self.hashes.keys() {
            if !next.contains_key(id) {
                events.push(ResourceEvent::delete(id.clone()));
            }
        }

        self.hashes = next;
        Ok(events)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// Owned read handle, cloned into the polling tasks.
#[derive(Clone)]
struct PostgresReader {
    pool: Pool,
    table: String,
    cluster_id: String,
    admin_row_id: String,
}

impl PostgresReader {
    async fn read_resources(&self) -> SyncResult<ResourceSnapshot> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT resource_id, resource FROM {} WHERE cluster_id = $1 AND resource_type <> $2",
                    self.table
                ),
                &[&self.cluster_id, &ADMIN_RESOURCE_TYPE],
            )
            .await?;

        let mut snapshot = ResourceSnapshot::default();
        for row in rows {
            let raw_id: String = row.get(0);
            let raw: String = row.get(1);
            let id = match ResourceId::parse(&raw_id) {
                Ok(id) => id,
                Err(e) => {
                    warn!(resource_id = %raw_id, error = %e, "Unable to parse resource id from database");
                    continue;
                }
            };
            match serde_json::from_str::<Value>(&raw) {
                Ok(payload) => snapshot.push(id, Some(payload)),
                Err(e) => {
                    warn!(resource_id = %raw_id, error = %e, "Unable to parse resource from database");
                    snapshot.push(id, None);
                }
            }
        }
        Ok(snapshot)
    }

    async fn read_admin(&self) -> SyncResult<AdminConfig> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT resource FROM {} WHERE resource_id = $1", self.table),
                &[&self.admin_row_id],
            )
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.get(0);
                Ok(serde_json::from_str(&raw)?)
            }
            None => Ok(AdminConfig::default()),
        }
    }
}

pub struct PostgresStore {
    reader: PostgresReader,
    /// Rows and admin config handed out by the last `get_global_config`,
    /// used as the starting point of the watches.
    baseline: Mutex<Option<(AdminConfig, ResourceSnapshot)>>,
    node_id: String,
    advertise_addr: String,
    poll_interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl PostgresStore {
    pub async fn new(sync: &SyncConfig, config: PostgresConfig) -> SyncResult<Self> {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.url = Some(config.db_url.clone());
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.pool_max));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| SyncError::store(STORE, format!("failed to create pool: {e}")))?;

        let (shutdown, _) = watch::channel(false);
        let store = Self {
            reader: PostgresReader {
                pool,
                table: format!("{}.sc_config", config.schema),
                cluster_id: sync.cluster_id.clone(),
                admin_row_id: format!("sc-admin-config-{}", sync.cluster_id),
            },
            baseline: Mutex::new(None),
            node_id: sync.node_id.clone(),
            advertise_addr: sync.advertise_addr.clone(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            shutdown,
        };
        store.ensure_table().await?;
        info!(table = %store.reader.table, "Postgres store ready");
        Ok(store)
    }

    async fn ensure_table(&self) -> SyncResult<()> {
        let client = self.reader.pool.get().await?;
        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    resource_id TEXT PRIMARY KEY,
                    resource_type TEXT NOT NULL,
                    resource TEXT NOT NULL,
                    project TEXT NOT NULL,
                    cluster_id TEXT NOT NULL
                )",
                self.reader.table
            ))
            .await?;
        Ok(())
    }

    async fn upsert(
        &self,
        resource_id: &str,
        resource_type: &str,
        project: &str,
        resource: &str,
    ) -> SyncResult<()> {
        let client = self.reader.pool.get().await?;
        client
            .execute(
                &format!(
                    "INSERT INTO {} (resource_id, resource_type, resource, project, cluster_id)
                     VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (resource_id) DO UPDATE SET
                        resource_type = EXCLUDED.resource_type,
                        resource = EXCLUDED.resource,
                        project = EXCLUDED.project,
                        cluster_id = EXCLUDED.cluster_id",
                    self.reader.table
                ),
                &[
                    &resource_id,
                    &resource_type,
                    &resource,
                    &project,
                    &self.reader.cluster_id,
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete_row(&self, resource_id: &str) -> SyncResult<()> {
        let client = self.reader.pool.get().await?;
        client
            .execute(
                &format!("DELETE FROM {} WHERE resource_id = $1", self.reader.table),
                &[&resource_id],
            )
            .await?;
        Ok(())
    }

    /// Re-read on every tick and forward whatever `on_read` maps the result to.
    fn spawn_poller<T, R, Fut, F>(&self, name: &'static str, read: R, mut on_read: F, events: EventSender)
    where
        T: Send + 'static,
        R: Fn(PostgresReader) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = SyncResult<T>> + Send,
        F: FnMut(T) -> Vec<ReconcileEvent> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let reader = self.reader.clone();
        let interval = self.poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => {}
                }
                let value = match read(reader.clone()).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(watch = name, error = %e, "Unable to poll postgres store");
                        continue;
                    }
                };
                for event in on_read(value) {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });
    }
}

fn write_outcome<T>(result: &SyncResult<T>) -> &'static str {
    if result.is_ok() {
        "success"
    } else {
        "error"
    }
}

#[async_trait]
impl Store for PostgresStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Postgres
    }

    async fn register(&self) -> SyncResult<()> {
        Ok(())
    }

    /// Postgres holds no membership; this node is the whole registry.
    async fn watch_services(&self, events: EventSender) -> SyncResult<()> {
        let services = ScServices::new([Service::new(&self.node_id, &self.advertise_addr)]);
        events
            .send(ReconcileEvent::Services(services))
            .await
            .map_err(|_| SyncError::NotRunning)
    }

    async fn watch_resources(&self, events: EventSender) -> SyncResult<()> {
        // Diff against the rows the manager loaded, so changes made since
        // then show up on the first poll.
        let baseline = self.baseline.lock().as_ref().map(|(_, rows)| rows.clone());
        let rows = match baseline {
            Some(rows) => rows,
            None => self.reader.read_resources().await?,
        };
        let mut tracker = ChangeTracker::seeded(rows)?;

        self.spawn_poller(
            "resources",
            |reader| async move { reader.read_resources().await },
            move |rows| match tracker.diff(rows) {
                Ok(changes) => {
                    if !changes.is_empty() {
                        debug!(changes = changes.len(), "Postgres resources changed");
                    }
                    changes.into_iter().map(ReconcileEvent::Resource).collect()
                }
                Err(e) => {
                    warn!(error = %e, "Unable to diff postgres resources");
                    Vec::new()
                }
            },
            events,
        );
        Ok(())
    }

    async fn watch_admin_config(&self, events: EventSender) -> SyncResult<()> {
        let baseline = self.baseline.lock().as_ref().map(|(admin, _)| admin.clone());
        let admin = match baseline {
            Some(admin) => admin,
            None => self.reader.read_admin().await?,
        };
        let mut last = admin_hash(&admin)?;
        self.spawn_poller(
            "admin_config",
            |reader| async move { reader.read_admin().await },
            move |admin: AdminConfig| {
                match admin_hash(&admin) {
                    Ok(hash) if hash != last => {
                        last = hash;
                        vec![ReconcileEvent::AdminConfig(admin)]
                    }
                    Ok(_) => Vec::new(),
                    Err(e) => {
                        warn!(error = %e, "Unable to hash admin config");
                        Vec::new()
                    }
                }
            },
            events,
        );
        Ok(())
    }

    async fn set_resource(&self, id: &ResourceId, payload: &Value) -> SyncResult<()> {
        let resource = serde_json::to_string(payload)?;
        let result = self
            .upsert(id.as_str(), id.resource_type().as_str(), id.project_id(), &resource)
            .await;
        SyncMetrics::record_store_write(STORE, "set", write_outcome(&result));
        result
    }

    async fn delete_resource(&self, id: &ResourceId) -> SyncResult<()> {
        let result = self.delete_row(id.as_str()).await;
        SyncMetrics::record_store_write(STORE, "delete", write_outcome(&result));
        result
    }

    async fn set_admin_config(&self, admin: &AdminConfig) -> SyncResult<()> {
        let resource = serde_json::to_string(admin)?;
        let result = self
            .upsert(&self.reader.admin_row_id, ADMIN_RESOURCE_TYPE, "", &resource)
            .await;
        SyncMetrics::record_store_write(STORE, "set_admin", write_outcome(&result));
        result
    }

    async fn get_global_config(&self) -> SyncResult<ClusterConfig> {
        let admin = self.reader.read_admin().await?;
        let snapshot = self.reader.read_resources().await?;
        let (config, errors) = ClusterConfig::from_resources(admin.clone(), &snapshot.resources);
        *self.baseline.lock() = Some((admin, snapshot));
        for e in errors {
            warn!(error = %e, "Skipping resource while loading postgres config");
        }
        Ok(config)
    }

    async fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::resource::ResourceType;

    fn rule(name: &str) -> ResourceId {
        ResourceId::new("c1", "p1", ResourceType::DatabaseRule, &[name]).unwrap()
    }

    fn kinds(events: &[ResourceEvent]) -> Vec<(EventKind, String)> {
        events
            .iter()
            .map(|e| (e.kind, e.id.names()[0].clone()))
            .collect()
    }

    #[test]
    fn test_first_read_adds_everything() {
        let mut t = ChangeTracker::default();
        let events = t
            .diff(vec![(rule("a"), json!({"x": 1})), (rule("b"), json!({"x": 2}))])
            .unwrap();
        assert_eq!(
            kinds(&events),
            vec![(EventKind::Add, "a".into()), (EventKind::Add, "b".into())]
        );
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_unchanged_rows_emit_nothing() {
        let mut t = ChangeTracker::default();
        t.diff(vec![(rule("a"), json!({"x": 1, "y": [1, 2]}))]).unwrap();
        let events = t.diff(vec![(rule("a"), json!({"y": [1, 2], "x": 1}))]).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_changed_payload_emits_update() {
        let mut t = ChangeTracker::default();
        t.diff(vec![(rule("a"), json!({"x": 1}))]).unwrap();
        let events = t.diff(vec![(rule("a"), json!({"x": 2}))]).unwrap();
        assert_eq!(kinds(&events), vec![(EventKind::Update, "a".into())]);
        assert_eq!(events[0].payload, Some(json!({"x": 2})));
    }

    #[test]
    fn test_rows_changed_after_baseline_are_emitted() {
        let mut t = ChangeTracker::seeded(vec![
            (rule("a"), json!({"x": 1})),
            (rule("b"), json!({"x": 1})),
        ])
        .unwrap();
        // A peer adds c, edits b and drops a before the first poll.
        let events = t
            .diff(vec![(rule("b"), json!({"x": 2})), (rule("c"), json!({}))])
            .unwrap();
        assert_eq!(
            kinds(&events),
            vec![
                (EventKind::Update, "b".into()),
                (EventKind::Add, "c".into()),
                (EventKind::Delete, "a".into()),
            ]
        );
    }

    #[test]
    fn test_unreadable_row_is_not_a_delete() {
        let mut t = ChangeTracker::seeded(vec![(rule("a"), json!({"x": 1}))]).unwrap();
        let events = t
            .diff(ResourceSnapshot {
                resources: Vec::new(),
                unreadable: vec![rule("a")],
            })
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(t.len(), 1);

        let events = t.diff(vec![(rule("a"), json!({"x": 1}))]).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_delete_then_re_add_emits_once_each() {
        let mut t = ChangeTracker::default();
        t.diff(vec![(rule("a"), json!({"x": 1})), (rule("b"), json!({}))]).unwrap();

        let deleted = t.diff(vec![(rule("b"), json!({}))]).unwrap();
        assert_eq!(kinds(&deleted), vec![(EventKind::Delete, "a".into())]);
        assert!(t.diff(vec![(rule("b"), json!({}))]).unwrap().is_empty());

        let re_added = t
            .diff(vec![(rule("a"), json!({"x": 1})), (rule("b"), json!({}))])
            .unwrap();
        assert_eq!(kinds(&re_added), vec![(EventKind::Add, "a".into())]);
        assert!(t
            .diff(vec![(rule("a"), json!({"x": 1})), (rule("b"), json!({}))])
            .unwrap()
            .is_empty());
    }
}
