//! Sync manager.
//!
//! Owns the node's view of the cluster: the configuration snapshot and the
//! service registry, both behind one lock. Store watches feed a bounded
//! channel; a single dispatch task drains it and applies each event under
//! the write lock. Writers hold the same lock across the store write so two
//! writers never interleave on the snapshot.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    sync::{mpsc, watch, Notify, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::{RegistrationConfig, SyncConfig},
    error::{SyncError, SyncResult},
    health::{HealthHandle, NodeHealth},
    metrics::SyncMetrics,
    model::{AdminConfig, AppliedChange, ClusterConfig, ClusterSettings, Project, ProjectConfig},
    pubsub::LeaderElector,
    resource::{EventKind, ResourceId, ResourceType},
    services::ScServices,
    store::{create_store, ReconcileEvent, ResourceEvent, ResourceSnapshot, Store},
    tokens::{calc_index, calc_tokens},
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Hooks
// ============================================================================

/// Callbacks into the modules that consume the configuration.
///
/// Hooks run while the manager holds its write lock, so they must not call
/// back into the manager.
pub trait SyncHooks: Send + Sync + 'static {
    fn on_services(&self, _services: &ScServices) {}

    fn on_admin_config(&self, _admin: &AdminConfig) {}

    /// Telemetry flag and Let's Encrypt email.
    fn on_cluster_settings(&self, _settings: &ClusterSettings) {}

    fn on_project_config(&self, _config: &ProjectConfig) {}

    fn on_project_deleted(&self, _project_id: &str) {}

    fn on_project_resource(
        &self,
        _project_id: &str,
        _resource_type: ResourceType,
        _project: &Project,
    ) {
    }

    fn on_integrations(
        &self,
        _integrations: &BTreeMap<String, Value>,
        _integration_hooks: &BTreeMap<String, Value>,
    ) {
    }

    fn on_cache_config(&self, _cache: Option<&Value>) {}
}

/// Hooks that ignore every change.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl SyncHooks for NoopHooks {}

fn notify(hooks: &dyn SyncHooks, config: &ClusterConfig, change: &AppliedChange) {
    match change {
        AppliedChange::ProjectConfig { project_id } => {
            if let Some(project) = config.projects.get(project_id) {
                hooks.on_project_config(&project.project_config);
            }
        }
        AppliedChange::ProjectDeleted { project_id } => hooks.on_project_deleted(project_id),
        AppliedChange::ProjectResource {
            project_id,
            resource_type,
        } => {
            if let Some(project) = config.projects.get(project_id) {
                hooks.on_project_resource(project_id, *resource_type, project);
            }
        }
        AppliedChange::ClusterSettings => hooks.on_cluster_settings(&config.admin.cluster),
        AppliedChange::License => hooks.on_admin_config(&config.admin),
        AppliedChange::Integrations => {
            hooks.on_integrations(&config.integrations, &config.integration_hooks)
        }
        AppliedChange::CacheConfig => {
            hooks.on_cache_config(config.cache_config.as_ref().map(|c| &c.payload))
        }
        AppliedChange::UnknownProject { .. } => {}
    }
}

/// Push every resource of the snapshot to the hooks.
fn notify_resources(hooks: &dyn SyncHooks, config: &ClusterConfig) {
    hooks.on_integrations(&config.integrations, &config.integration_hooks);
    hooks.on_cache_config(config.cache_config.as_ref().map(|c| &c.payload));
    for (project_id, project) in &config.projects {
        hooks.on_project_config(&project.project_config);
        for resource_type in ResourceType::ALL
            .into_iter()
            .filter(|t| !t.is_cluster_scoped() && *t != ResourceType::Project)
        {
            hooks.on_project_resource(project_id, resource_type, project);
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

#[derive(Debug, Default)]
struct SyncState {
    config: ClusterConfig,
    services: ScServices,
}

struct Inner {
    node_id: String,
    cluster_id: String,
    total_tokens: usize,
    registration: RegistrationConfig,
    store: Arc<dyn Store>,
    hooks: Arc<dyn SyncHooks>,
    health: HealthHandle,
    state: RwLock<SyncState>,
    services_ready: Notify,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    dispatch: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Cheaply clonable handle on the node's sync manager.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("node_id", &self.inner.node_id)
            .field("cluster_id", &self.inner.cluster_id)
            .field("store", &self.inner.store.kind())
            .finish()
    }
}

impl SyncManager {
    /// Validate `config` and connect to the configured store.
    pub async fn new(config: SyncConfig, hooks: Arc<dyn SyncHooks>) -> SyncResult<Self> {
        config.validate()?;
        let health = HealthHandle::default();
        let store = create_store(&config, health.clone()).await?;
        Ok(Self::with_store(&config, store, hooks, health))
    }

    /// Build a manager over an already constructed store.
    pub fn with_store(
        config: &SyncConfig,
        store: Arc<dyn Store>,
        hooks: Arc<dyn SyncHooks>,
        health: HealthHandle,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                node_id: config.node_id.clone(),
                cluster_id: config.cluster_id.clone(),
                total_tokens: config.total_tokens,
                registration: config.registration.clone(),
                store,
                hooks,
                health,
                state: RwLock::new(SyncState::default()),
                services_ready: Notify::new(),
                started: AtomicBool::new(false),
                shutdown,
                dispatch: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Load the baseline, register with the store and arm every watch.
    ///
    /// A failed start tears down whatever it spawned; the manager cannot be
    /// started again.
    pub async fn start(&self) -> SyncResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Config("sync manager already started".to_string()));
        }
        info!(
            node_id = %self.inner.node_id,
            cluster_id = %self.inner.cluster_id,
            store = self.inner.store.kind().as_str(),
            "Starting sync manager"
        );

        if let Err(e) = self.start_inner().await {
            warn!(error = %e, "Sync manager failed to start");
            self.stop().await;
            return Err(e);
        }

        info!(node_id = %self.inner.node_id, "Sync manager started");
        Ok(())
    }

    async fn start_inner(&self) -> SyncResult<()> {
        let inner = &self.inner;

        let baseline = inner.store.get_global_config().await?;
        {
            let mut state = inner.state.write().await;
            state.config = baseline;
            inner.hooks.on_admin_config(&state.config.admin);
            inner.hooks.on_cluster_settings(&state.config.admin.cluster);
            notify_resources(inner.hooks.as_ref(), &state.config);
            debug!(
                projects = state.config.projects.len(),
                "Loaded initial copy of config"
            );
        }

        inner.store.register().await?;
        inner.health.set(NodeHealth::Registered);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = tokio::spawn(dispatch_loop(
            self.inner.clone(),
            rx,
            inner.shutdown.subscribe(),
        ));
        *inner.dispatch.lock() = Some(handle);

        inner.store.watch_services(tx.clone()).await?;
        self.wait_for_services().await?;

        inner.store.watch_resources(tx.clone()).await?;
        inner.store.watch_admin_config(tx).await?;
        Ok(())
    }

    /// Poll for a non-empty registry, waiting `attempt * step` between polls.
    async fn wait_for_services(&self) -> SyncResult<()> {
        let attempts = self.inner.registration.service_wait_attempts.max(1);
        let step = self.inner.registration.service_wait_step_ms;
        for attempt in 1..=attempts {
            if !self.inner.state.read().await.services.is_empty() {
                return Ok(());
            }
            let delay = Duration::from_millis(step.saturating_mul(u64::from(attempt)));
            debug!(attempt, "Waiting for gateway services to register, next check in {:?}", delay);
            let _ = tokio::time::timeout(delay, self.inner.services_ready.notified()).await;
        }
        if !self.inner.state.read().await.services.is_empty() {
            return Ok(());
        }
        self.inner.health.set(NodeHealth::Degraded);
        Err(SyncError::Registration(
            "gateway service not registered".to_string(),
        ))
    }

    /// Stop the dispatch loop and every store task.
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.store.close().await;
        let handle = self.inner.dispatch.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Dispatch loop ended abnormally");
            }
        }
        info!(node_id = %self.inner.node_id, "Sync manager stopped");
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub async fn get_config(&self, project_id: &str) -> SyncResult<Project> {
        self.inner
            .state
            .read()
            .await
            .config
            .projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| SyncError::ProjectNotFound(project_id.to_string()))
    }

    pub async fn get_global_config(&self) -> ClusterConfig {
        self.inner.state.read().await.config.clone()
    }

    pub async fn get_project_ids(&self) -> Vec<String> {
        self.inner.state.read().await.config.project_ids()
    }

    pub async fn get_services(&self) -> ScServices {
        self.inner.state.read().await.services.clone()
    }

    pub async fn get_cluster_size(&self) -> usize {
        self.inner.state.read().await.services.len()
    }

    /// Position of this node in the sorted registry, `0` when absent.
    pub async fn get_gateway_index(&self) -> usize {
        self.inner
            .state
            .read()
            .await
            .services
            .index_of(&self.inner.node_id)
            .unwrap_or(0)
    }

    /// Inclusive token range this node is responsible for.
    pub async fn get_assigned_tokens(&self) -> (usize, usize) {
        let state = self.inner.state.read().await;
        let index = state.services.index_of(&self.inner.node_id).unwrap_or(0);
        calc_tokens(state.services.len(), self.inner.total_tokens, index)
    }

    /// Address of the node that owns `token`.
    pub async fn get_assigned_gateway_addr(&self, token: usize) -> SyncResult<String> {
        let state = self.inner.state.read().await;
        let index = calc_index(token, self.inner.total_tokens, state.services.len());
        state
            .services
            .at(index)
            .map(|s| s.addr.clone())
            .ok_or_else(|| SyncError::ServiceNotFound(format!("token {token}")))
    }

    pub async fn get_gateway_addr(&self, node_id: &str) -> SyncResult<String> {
        self.inner
            .state
            .read()
            .await
            .services
            .get(node_id)
            .map(|s| s.addr.clone())
            .ok_or_else(|| SyncError::ServiceNotFound(node_id.to_string()))
    }

    pub fn get_node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn get_cluster_id(&self) -> &str {
        &self.inner.cluster_id
    }

    /// Source tag stamped on events this node emits.
    pub fn get_event_source(&self) -> String {
        format!("sc-{}", self.inner.node_id)
    }

    pub async fn is_leader(&self) -> bool {
        self.inner
            .state
            .read()
            .await
            .services
            .leader()
            .is_some_and(|s| s.id == self.inner.node_id)
    }

    pub fn health(&self) -> NodeHealth {
        self.inner.health.get()
    }

    // ------------------------------------------------------------------------
    // Writers
    // ------------------------------------------------------------------------
    //
    // The snapshot is mutated before the store write. A failed store write is
    // returned to the caller and the snapshot stays ahead of the store until
    // the next watch event reconciles it.

    async fn write_resource(
        &self,
        state: &mut SyncState,
        kind: EventKind,
        id: ResourceId,
        payload: Option<Value>,
    ) -> SyncResult<()> {
        let change = state.config.apply_resource(kind, &id, payload.as_ref())?;
        if let AppliedChange::UnknownProject { project_id } = change {
            return Err(SyncError::ProjectNotFound(project_id));
        }
        notify(self.inner.hooks.as_ref(), &state.config, &change);

        match &payload {
            Some(value) => self.inner.store.set_resource(&id, value).await?,
            None => self.inner.store.delete_resource(&id).await?,
        }
        self.inner.store.persist_snapshot(&state.config).await
    }

    /// Create or update a project header. `context_time` defaults to 10.
    pub async fn set_project_config(&self, mut project_config: ProjectConfig) -> SyncResult<()> {
        if project_config.id.is_empty() {
            return Err(SyncError::InvalidResource {
                resource_type: ResourceType::Project.to_string(),
                message: "project id is required".to_string(),
            });
        }
        project_config.normalize();
        let id = ResourceId::project(&self.inner.cluster_id, &project_config.id)?;
        let payload = serde_json::to_value(&project_config)?;

        let mut state = self.inner.state.write().await;
        let kind = if state.config.projects.contains_key(&project_config.id) {
            EventKind::Update
        } else {
            EventKind::Add
        };
        debug!(project_id = %project_config.id, event = kind.as_str(), "Setting project config");
        self.write_resource(&mut state, kind, id, Some(payload)).await
    }

    /// Remove a project and every resource it owns.
    pub async fn delete_project(&self, project_id: &str) -> SyncResult<()> {
        let project_rid = ResourceId::project(&self.inner.cluster_id, project_id)?;

        let mut state = self.inner.state.write().await;
        if !state.config.projects.contains_key(project_id) {
            return Err(SyncError::ProjectNotFound(project_id.to_string()));
        }
        let owned: Vec<ResourceId> = state
            .config
            .to_resources(&self.inner.cluster_id)?
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| id.project_id() == project_id && id.resource_type() != ResourceType::Project)
            .collect();

        state
            .config
            .apply_resource(EventKind::Delete, &project_rid, None)?;
        self.inner.hooks.on_project_deleted(project_id);
        info!(project_id, resources = owned.len(), "Deleting project");

        for id in &owned {
            self.inner.store.delete_resource(id).await?;
        }
        self.inner.store.delete_resource(&project_rid).await?;
        self.inner.store.persist_snapshot(&state.config).await
    }

    fn resource_id<S: AsRef<str>>(
        &self,
        project_id: &str,
        resource_type: ResourceType,
        names: &[S],
    ) -> SyncResult<ResourceId> {
        if resource_type.is_cluster_scoped() {
            ResourceId::cluster_level(&self.inner.cluster_id, resource_type, names)
        } else {
            ResourceId::new(&self.inner.cluster_id, project_id, resource_type, names)
        }
    }

    /// Create or update one resource. Cluster-scoped types ignore `project_id`.
    pub async fn set_resource<S: AsRef<str>>(
        &self,
        project_id: &str,
        resource_type: ResourceType,
        names: &[S],
        payload: Value,
    ) -> SyncResult<()> {
        if resource_type == ResourceType::Project {
            return Err(SyncError::InvalidResource {
                resource_type: resource_type.to_string(),
                message: "project headers are written with set_project_config".to_string(),
            });
        }
        let id = self.resource_id(project_id, resource_type, names)?;

        let mut state = self.inner.state.write().await;
        if !resource_type.is_cluster_scoped() && !state.config.projects.contains_key(project_id) {
            return Err(SyncError::ProjectNotFound(project_id.to_string()));
        }
        let kind = if state.config.resource(&id).is_some() {
            EventKind::Update
        } else {
            EventKind::Add
        };
        // A singleton written under a new ID replaces the key it was held under.
        let replaced = state
            .config
            .singleton_id(&id)
            .filter(|current| **current != id)
            .cloned();
        debug!(resource_id = %id, event = kind.as_str(), "Setting resource");
        self.write_resource(&mut state, kind, id, Some(payload)).await?;

        if let Some(old) = replaced {
            debug!(resource_id = %old, "Removing replaced singleton resource");
            self.inner.store.delete_resource(&old).await?;
        }
        Ok(())
    }

    pub async fn delete_resource<S: AsRef<str>>(
        &self,
        project_id: &str,
        resource_type: ResourceType,
        names: &[S],
    ) -> SyncResult<()> {
        if resource_type == ResourceType::Project {
            return self.delete_project(project_id).await;
        }
        let id = self.resource_id(project_id, resource_type, names)?;

        let mut state = self.inner.state.write().await;
        if !resource_type.is_cluster_scoped() && !state.config.projects.contains_key(project_id) {
            return Err(SyncError::ProjectNotFound(project_id.to_string()));
        }
        if state.config.resource(&id).is_none() {
            return Err(SyncError::ResourceNotFound(id.to_string()));
        }
        debug!(resource_id = %id, "Deleting resource");
        self.write_resource(&mut state, EventKind::Delete, id, None).await
    }

    pub async fn set_admin_config(&self, admin: AdminConfig) -> SyncResult<()> {
        let mut state = self.inner.state.write().await;
        state.config.admin = admin;
        self.inner.hooks.on_admin_config(&state.config.admin);
        self.inner.hooks.on_cluster_settings(&state.config.admin.cluster);

        self.inner.store.set_admin_config(&state.config.admin).await?;
        self.inner.store.persist_snapshot(&state.config).await
    }

    /// Replace the whole configuration. Only allowed before [`SyncManager::start`].
    pub async fn set_global_config(&self, config: ClusterConfig) -> SyncResult<()> {
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(SyncError::Config(
                "global config can only be replaced before start".to_string(),
            ));
        }
        let mut state = self.inner.state.write().await;
        state.config = config;

        self.inner.store.set_admin_config(&state.config.admin).await?;
        for (id, payload) in state.config.to_resources(&self.inner.cluster_id)? {
            self.inner.store.set_resource(&id, &payload).await?;
        }
        self.inner.store.persist_snapshot(&state.config).await
    }
}

#[async_trait]
impl LeaderElector for SyncManager {
    async fn check_leader(&self) -> SyncResult<bool> {
        let state = self.inner.state.read().await;
        match state.services.leader() {
            Some(leader) => Ok(leader.id == self.inner.node_id),
            None => Err(SyncError::ServiceNotFound(self.inner.node_id.clone())),
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

async fn dispatch_loop(
    inner: Arc<Inner>,
    mut events: mpsc::Receiver<ReconcileEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        inner.handle_event(event).await;
    }
    debug!(node_id = %inner.node_id, "Dispatch loop stopped");
}

impl Inner {
    async fn handle_event(&self, event: ReconcileEvent) {
        let kind = event.kind_str();
        let outcome = match event {
            ReconcileEvent::Services(services) => self.apply_services(services).await,
            ReconcileEvent::Resource(event) => self.apply_resource_event(event).await,
            ReconcileEvent::ResourceSnapshot(snapshot) => self.apply_snapshot(snapshot).await,
            ReconcileEvent::AdminConfig(admin) => self.apply_admin(admin).await,
        };
        SyncMetrics::record_reconcile(kind, outcome);
    }

    async fn apply_services(&self, services: ScServices) -> &'static str {
        {
            let mut state = self.state.write().await;
            debug!(services = services.len(), "Updating services");
            SyncMetrics::set_cluster_size(services.len());
            state.services = services;
            self.hooks.on_services(&state.services);
        }
        self.services_ready.notify_one();
        "applied"
    }

    async fn apply_resource_event(&self, event: ResourceEvent) -> &'static str {
        if event.id.cluster_id() != self.cluster_id {
            debug!(resource_id = %event.id, "Ignoring resource of another cluster");
            return "skipped";
        }

        let mut state = self.state.write().await;
        let current = state.config.resource(&event.id);
        let duplicate = match event.kind {
            EventKind::Delete => current.is_none(),
            EventKind::Add | EventKind::Update => current.as_ref() == event.payload.as_ref(),
        };
        if duplicate {
            debug!(resource_id = %event.id, event = event.kind.as_str(), "Found duplicate resource, skipping");
            return "skipped";
        }

        match state
            .config
            .apply_resource(event.kind, &event.id, event.payload.as_ref())
        {
            Ok(AppliedChange::UnknownProject { project_id }) => {
                warn!(resource_id = %event.id, project_id, "Resource for unknown project, skipping");
                "skipped"
            }
            Ok(change) => {
                debug!(resource_id = %event.id, event = event.kind.as_str(), "Updated resource");
                notify(self.hooks.as_ref(), &state.config, &change);
                "applied"
            }
            Err(e) => {
                warn!(resource_id = %event.id, error = %e, "Unable to update resource");
                "invalid"
            }
        }
    }

    /// Replace every resource with a full listing. Projects whose header is
    /// gone from the store are deleted from it before the snapshot is
    /// swapped. Keys whose payload could not be read keep their last known
    /// value.
    async fn apply_snapshot(&self, snapshot: ResourceSnapshot) -> &'static str {
        let ResourceSnapshot {
            resources,
            mut unreadable,
        } = snapshot;
        unreadable.retain(|id| id.cluster_id() == self.cluster_id);

        let mut rows = Vec::with_capacity(resources.len());
        for (id, payload) in resources {
            if id.cluster_id() != self.cluster_id {
                continue;
            }
            if id.resource_type() == ResourceType::Project
                && serde_json::from_value::<ProjectConfig>(payload.clone()).is_err()
            {
                warn!(resource_id = %id, "Sync manager: could not parse project config received");
                unreadable.push(id);
                continue;
            }
            rows.push((id, payload));
        }

        let present: BTreeSet<String> = rows
            .iter()
            .map(|(id, _)| id)
            .chain(&unreadable)
            .filter(|id| id.resource_type() == ResourceType::Project)
            .map(|id| id.project_id().to_string())
            .collect();

        let mut state = self.state.write().await;
        let removed: Vec<String> = state
            .config
            .projects
            .keys()
            .filter(|p| !present.contains(p.as_str()))
            .cloned()
            .collect();

        for project_id in &removed {
            info!(project_id, "Project removed from store, deleting");
            match ResourceId::project(&self.cluster_id, project_id) {
                Ok(id) => {
                    if let Err(e) = self.store.delete_resource(&id).await {
                        warn!(project_id, error = %e, "Unable to delete removed project from store");
                    }
                }
                Err(e) => warn!(project_id, error = %e, "Invalid project id in snapshot"),
            }
            self.hooks.on_project_deleted(project_id);
        }

        for id in unreadable {
            match state.config.resource(&id) {
                Some(current) => {
                    debug!(resource_id = %id, "Keeping last known copy of unreadable resource");
                    rows.push((id, current));
                }
                None => warn!(resource_id = %id, "Skipping unreadable resource in snapshot"),
            }
        }

        for e in state.config.replace_resources(&rows) {
            warn!(error = %e, "Skipping resource in snapshot");
        }
        notify_resources(self.hooks.as_ref(), &state.config);
        "applied"
    }

    async fn apply_admin(&self, admin: AdminConfig) -> &'static str {
        let mut state = self.state.write().await;
        if state.config.admin == admin {
            return "skipped";
        }
        state.config.admin = admin;
        self.hooks.on_admin_config(&state.config.admin);
        self.hooks.on_cluster_settings(&state.config.admin.cluster);
        "applied"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::{
        config::{LocalConfig, StoreConfig, StoreKind},
        services::Service,
        store::EventSender,
    };

    #[derive(Default)]
    struct MemoryStore {
        baseline: ClusterConfig,
        services: ScServices,
        writes: Mutex<Vec<String>>,
        fail_writes: AtomicBool,
        resource_tx: Mutex<Option<EventSender>>,
        closed: AtomicBool,
    }

    impl MemoryStore {
        fn write(&self, entry: String) -> SyncResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(SyncError::store("memory", "unavailable"));
            }
            self.writes.lock().push(entry);
            Ok(())
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        fn kind(&self) -> StoreKind {
            StoreKind::Local
        }

        async fn register(&self) -> SyncResult<()> {
            Ok(())
        }

        async fn watch_services(&self, events: EventSender) -> SyncResult<()> {
            if !self.services.is_empty() {
                events
                    .send(ReconcileEvent::Services(self.services.clone()))
                    .await
                    .map_err(|_| SyncError::NotRunning)?;
            }
            Ok(())
        }

        async fn watch_resources(&self, events: EventSender) -> SyncResult<()> {
            *self.resource_tx.lock() = Some(events);
            Ok(())
        }

        async fn watch_admin_config(&self, _events: EventSender) -> SyncResult<()> {
            Ok(())
        }

        async fn set_resource(&self, id: &ResourceId, _payload: &Value) -> SyncResult<()> {
            self.write(format!("set:{id}"))
        }

        async fn delete_resource(&self, id: &ResourceId) -> SyncResult<()> {
            self.write(format!("delete:{id}"))
        }

        async fn set_admin_config(&self, _admin: &AdminConfig) -> SyncResult<()> {
            self.write("admin".to_string())
        }

        async fn get_global_config(&self) -> SyncResult<ClusterConfig> {
            Ok(self.baseline.clone())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        calls: Mutex<Vec<String>>,
        telemetry: AtomicUsize,
    }

    impl SyncHooks for RecordingHooks {
        fn on_services(&self, services: &ScServices) {
            self.calls.lock().push(format!("services:{}", services.len()));
        }

        fn on_cluster_settings(&self, settings: &ClusterSettings) {
            if settings.enable_telemetry {
                self.telemetry.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn on_project_config(&self, config: &ProjectConfig) {
            self.calls.lock().push(format!("project:{}", config.id));
        }

        fn on_project_deleted(&self, project_id: &str) {
            self.calls.lock().push(format!("deleted:{project_id}"));
        }
    }

    impl RecordingHooks {
        fn count(&self, call: &str) -> usize {
            self.calls.lock().iter().filter(|c| *c == call).count()
        }
    }

    fn sync_config(node_id: &str) -> SyncConfig {
        let mut config = SyncConfig::new(
            node_id,
            "c1",
            "10.0.0.1:4122",
            StoreConfig::Local(LocalConfig {
                path: "unused.yaml".into(),
            }),
        );
        config.registration.service_wait_attempts = 3;
        config.registration.service_wait_step_ms = 5;
        config
    }

    fn three_nodes() -> ScServices {
        ScServices::new([
            Service::new("gateway-2", "10.0.0.3:4122"),
            Service::new("gateway-0", "10.0.0.1:4122"),
            Service::new("gateway-1", "10.0.0.2:4122"),
        ])
    }

    fn baseline_with(projects: &[&str]) -> ClusterConfig {
        let mut config = ClusterConfig::default();
        config.admin.cluster.enable_telemetry = true;
        for p in projects {
            config
                .projects
                .insert(p.to_string(), Project::new(ProjectConfig::new(*p)));
        }
        config
    }

    fn manager(
        node_id: &str,
        store: Arc<MemoryStore>,
        hooks: Arc<RecordingHooks>,
    ) -> SyncManager {
        SyncManager::with_store(&sync_config(node_id), store, hooks, HealthHandle::default())
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn resource_sender(store: &MemoryStore) -> EventSender {
        store
            .resource_tx
            .lock()
            .clone()
            .expect("resource watch armed")
    }

    #[tokio::test]
    async fn test_start_loads_baseline_and_membership() {
        let store = Arc::new(MemoryStore {
            baseline: baseline_with(&["p1"]),
            services: three_nodes(),
            ..Default::default()
        });
        let hooks = Arc::new(RecordingHooks::default());
        let m = manager("gateway-1", store.clone(), hooks.clone());
        m.start().await.unwrap();

        assert_eq!(m.get_project_ids().await, vec!["p1".to_string()]);
        assert_eq!(hooks.count("project:p1"), 1);
        assert_eq!(hooks.telemetry.load(Ordering::SeqCst), 1);
        assert_eq!(m.get_cluster_size().await, 3);
        assert_eq!(m.get_gateway_index().await, 1);
        assert_eq!(m.get_assigned_tokens().await, (34, 67));
        assert_eq!(m.get_assigned_gateway_addr(70).await.unwrap(), "10.0.0.3:4122");
        // The last bucket spills past the member count and resolves to nobody.
        assert!(matches!(
            m.get_assigned_gateway_addr(99).await,
            Err(SyncError::ServiceNotFound(_))
        ));
        assert_eq!(m.get_gateway_addr("gateway-0").await.unwrap(), "10.0.0.1:4122");
        assert!(matches!(
            m.get_gateway_addr("gateway-9").await,
            Err(SyncError::ServiceNotFound(_))
        ));
        assert!(!m.is_leader().await);
        assert!(!m.check_leader().await.unwrap());
        assert_eq!(m.get_event_source(), "sc-gateway-1");
        assert_eq!(m.health(), NodeHealth::Registered);

        m.stop().await;
        assert!(store.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_start_fails_without_services() {
        let store = Arc::new(MemoryStore::default());
        let m = manager("gateway-0", store.clone(), Arc::new(RecordingHooks::default()));

        let err = m.start().await.unwrap_err();
        assert!(matches!(err, SyncError::Registration(_)));
        assert_eq!(m.health(), NodeHealth::Degraded);
        assert!(store.closed.load(Ordering::SeqCst));
        assert!(matches!(m.start().await, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_snapshot_deletes_vanished_projects() {
        let store = Arc::new(MemoryStore {
            baseline: baseline_with(&["p1", "p2"]),
            services: three_nodes(),
            ..Default::default()
        });
        let hooks = Arc::new(RecordingHooks::default());
        let m = manager("gateway-0", store.clone(), hooks.clone());
        m.start().await.unwrap();

        let tx = resource_sender(&store);
        let p1 = ResourceId::project("c1", "p1").unwrap();
        tx.send(ReconcileEvent::ResourceSnapshot(
            vec![(p1, json!({"id": "p1"}))].into(),
        ))
        .await
        .unwrap();

        eventually(|| hooks.count("deleted:p2") == 1).await;
        assert_eq!(m.get_project_ids().await, vec!["p1".to_string()]);
        assert_eq!(
            store.writes.lock().clone(),
            vec!["delete:c1--p2--project--p2".to_string()]
        );
        m.stop().await;
    }

    #[tokio::test]
    async fn test_snapshot_keeps_projects_with_unreadable_payloads() {
        let store = Arc::new(MemoryStore {
            baseline: baseline_with(&["p1", "p2", "p3"]),
            services: three_nodes(),
            ..Default::default()
        });
        let hooks = Arc::new(RecordingHooks::default());
        let m = manager("gateway-0", store.clone(), hooks.clone());
        m.start().await.unwrap();

        let tx = resource_sender(&store);
        let p1 = ResourceId::project("c1", "p1").unwrap();
        let p2 = ResourceId::project("c1", "p2").unwrap();
        let p3 = ResourceId::project("c1", "p3").unwrap();
        tx.send(ReconcileEvent::ResourceSnapshot(ResourceSnapshot {
            resources: vec![
                (p1, json!({"id": "p1", "contextTime": 20})),
                // Valid JSON that is not a project config.
                (p3, json!("{not json")),
            ],
            unreadable: vec![p2],
        }))
        .await
        .unwrap();

        eventually(|| hooks.count("project:p1") == 2).await;
        assert_eq!(m.get_config("p1").await.unwrap().project_config.context_time, 20);
        assert_eq!(
            m.get_project_ids().await,
            vec!["p1".to_string(), "p2".to_string(), "p3".to_string()]
        );
        assert!(store.writes.lock().is_empty());
        assert_eq!(hooks.count("deleted:p2") + hooks.count("deleted:p3"), 0);
        m.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_resource_event_is_skipped() {
        let store = Arc::new(MemoryStore {
            baseline: baseline_with(&["p1"]),
            services: three_nodes(),
            ..Default::default()
        });
        let hooks = Arc::new(RecordingHooks::default());
        let m = manager("gateway-0", store.clone(), hooks.clone());
        m.start().await.unwrap();

        let tx = resource_sender(&store);
        let id = ResourceId::new("c1", "p2", ResourceType::Project, &["p2"]).unwrap();
        let payload = serde_json::to_value(ProjectConfig::new("p2")).unwrap();
        for _ in 0..3 {
            tx.send(ReconcileEvent::Resource(ResourceEvent::upsert(
                EventKind::Add,
                id.clone(),
                payload.clone(),
            )))
            .await
            .unwrap();
        }
        // Foreign cluster events never land in the snapshot.
        let foreign = ResourceId::project("c2", "p3").unwrap();
        tx.send(ReconcileEvent::Resource(ResourceEvent::upsert(
            EventKind::Add,
            foreign,
            json!({"id": "p3"}),
        )))
        .await
        .unwrap();

        eventually(|| hooks.count("project:p2") >= 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(hooks.count("project:p2"), 1);
        assert_eq!(m.get_project_ids().await, vec!["p1".to_string(), "p2".to_string()]);
        m.stop().await;
    }

    #[tokio::test]
    async fn test_writers_persist_through_store() {
        let store = Arc::new(MemoryStore {
            services: three_nodes(),
            ..Default::default()
        });
        let m = manager("gateway-0", store.clone(), Arc::new(RecordingHooks::default()));
        m.start().await.unwrap();
        assert!(m.is_leader().await);

        m.set_project_config(ProjectConfig::new("p1")).await.unwrap();
        assert_eq!(m.get_config("p1").await.unwrap().project_config.context_time, 10);

        m.set_resource("p1", ResourceType::RemoteService, &["svc"], json!({"url": "http://svc"}))
            .await
            .unwrap();
        assert!(matches!(
            m.set_resource("ghost", ResourceType::RemoteService, &["svc"], json!({}))
                .await,
            Err(SyncError::ProjectNotFound(_))
        ));
        assert!(matches!(
            m.delete_resource("p1", ResourceType::DatabaseRule, &["missing"]).await,
            Err(SyncError::ResourceNotFound(_))
        ));

        m.delete_project("p1").await.unwrap();
        assert!(matches!(
            m.get_config("p1").await,
            Err(SyncError::ProjectNotFound(_))
        ));
        assert_eq!(
            store.writes.lock().clone(),
            vec![
                "set:c1--p1--project--p1".to_string(),
                "set:c1--p1--remote-service--svc".to_string(),
                "delete:c1--p1--remote-service--svc".to_string(),
                "delete:c1--p1--project--p1".to_string(),
            ]
        );
        m.stop().await;
    }

    #[tokio::test]
    async fn test_singleton_keys_follow_the_written_name() {
        let store = Arc::new(MemoryStore {
            services: three_nodes(),
            ..Default::default()
        });
        let m = manager("gateway-0", store.clone(), Arc::new(RecordingHooks::default()));
        m.start().await.unwrap();

        m.set_project_config(ProjectConfig::new("p1")).await.unwrap();
        m.set_resource("p1", ResourceType::EventingConfig, &["main"], json!({"enabled": true}))
            .await
            .unwrap();
        m.set_resource("p1", ResourceType::EventingConfig, &["eventing"], json!({"enabled": false}))
            .await
            .unwrap();
        m.delete_project("p1").await.unwrap();

        assert_eq!(
            store.writes.lock().clone(),
            vec![
                "set:c1--p1--project--p1".to_string(),
                "set:c1--p1--eventing-config--main".to_string(),
                "set:c1--p1--eventing-config--eventing".to_string(),
                "delete:c1--p1--eventing-config--main".to_string(),
                "delete:c1--p1--eventing-config--eventing".to_string(),
                "delete:c1--p1--project--p1".to_string(),
            ]
        );
        m.stop().await;
    }

    #[tokio::test]
    async fn test_failed_persist_is_returned_without_rollback() {
        let store = Arc::new(MemoryStore {
            services: three_nodes(),
            ..Default::default()
        });
        let m = manager("gateway-0", store.clone(), Arc::new(RecordingHooks::default()));
        m.start().await.unwrap();

        store.fail_writes.store(true, Ordering::SeqCst);
        let err = m.set_project_config(ProjectConfig::new("p1")).await.unwrap_err();
        assert!(matches!(err, SyncError::Store { .. }));
        assert!(m.get_config("p1").await.is_ok());
        m.stop().await;
    }

    #[tokio::test]
    async fn test_global_config_only_before_start() {
        let store = Arc::new(MemoryStore {
            services: three_nodes(),
            ..Default::default()
        });
        let m = manager("gateway-0", store.clone(), Arc::new(RecordingHooks::default()));

        m.set_global_config(baseline_with(&["p1"])).await.unwrap();
        assert!(store.writes.lock().contains(&"admin".to_string()));
        assert!(store
            .writes
            .lock()
            .contains(&"set:c1--p1--project--p1".to_string()));

        m.start().await.unwrap();
        assert!(matches!(
            m.set_global_config(ClusterConfig::default()).await,
            Err(SyncError::Config(_))
        ));
        m.stop().await;
    }
}
