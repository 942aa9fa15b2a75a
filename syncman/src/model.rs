//! In-memory cluster configuration snapshot.
//!
//! Resource payloads are kept as loosely typed JSON: the sync core routes
//! them to dependent modules, it does not interpret them. Only the project
//! header and the admin config are typed.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{SyncError, SyncResult},
    resource::{EventKind, ResourceId, ResourceType},
};

/// Query timeout applied to projects that do not set one.
pub const DEFAULT_CONTEXT_TIME: u32 = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSettings {
    pub lets_encrypt_email: String,
    pub enable_telemetry: bool,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdminConfig {
    pub cluster_id: String,
    pub cluster_key: String,
    pub license_key: String,
    pub license_value: String,
    pub license: String,
    pub cluster: ClusterSettings,
}

impl fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminConfig")
            .field("cluster_id", &self.cluster_id)
            .field("cluster_key", &"<redacted>")
            .field("license_key", &self.license_key)
            .field("license_value", &"<redacted>")
            .field("license", &"<redacted>")
            .field("cluster", &self.cluster)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LicensePayload {
    #[serde(default)]
    license_key: String,
    #[serde(default)]
    license_value: String,
    #[serde(default)]
    license: String,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Secret {
    pub is_primary: bool,
    pub secret: String,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("is_primary", &self.is_primary)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    pub id: String,
    pub name: String,
    pub secrets: Vec<Secret>,
    pub aes_key: String,
    pub docker_registry: String,
    pub context_time: u32,
}

impl ProjectConfig {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            context_time: DEFAULT_CONTEXT_TIME,
            ..Default::default()
        }
    }

    /// Fill defaults the rest of the system relies on.
    pub fn normalize(&mut self) {
        if self.context_time == 0 {
            self.context_time = DEFAULT_CONTEXT_TIME;
        }
        if self.name.is_empty() {
            self.name = self.id.clone();
        }
    }
}

type ResourceMap = BTreeMap<String, Value>;

/// A resource held at most once per owner, kept with the ID it was written under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingletonResource {
    pub id: ResourceId,
    pub payload: Value,
}

impl SingletonResource {
    pub fn new(id: ResourceId, payload: Value) -> Self {
        Self { id, payload }
    }
}

pub type Singleton = Option<SingletonResource>;

/// Write `payload` into a singleton slot. A delete only clears the slot when
/// it names the ID the slot currently holds.
fn apply_singleton(slot: &mut Singleton, id: &ResourceId, payload: Option<&Value>) {
    match payload {
        Some(value) => *slot = Some(SingletonResource::new(id.clone(), value.clone())),
        None => {
            if slot.as_ref().is_some_and(|s| s.id == *id) {
                *slot = None;
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Project {
    pub project_config: ProjectConfig,
    pub database_configs: ResourceMap,
    pub database_schemas: ResourceMap,
    pub database_rules: ResourceMap,
    pub database_prepared_queries: ResourceMap,
    pub eventing_config: Singleton,
    pub eventing_schemas: ResourceMap,
    pub eventing_rules: ResourceMap,
    pub eventing_triggers: ResourceMap,
    pub file_store_config: Singleton,
    pub file_store_rules: ResourceMap,
    pub auths: ResourceMap,
    pub lets_encrypt: Singleton,
    pub ingress_routes: ResourceMap,
    pub ingress_global: Singleton,
    pub remote_services: ResourceMap,
}

impl Project {
    pub fn new(project_config: ProjectConfig) -> Self {
        Self {
            project_config,
            ..Default::default()
        }
    }

    fn map_mut(&mut self, resource_type: ResourceType) -> Option<&mut ResourceMap> {
        match resource_type {
            ResourceType::DatabaseConfig => Some(&mut self.database_configs),
            ResourceType::DatabaseSchema => Some(&mut self.database_schemas),
            ResourceType::DatabaseRule => Some(&mut self.database_rules),
            ResourceType::DatabasePreparedQuery => Some(&mut self.database_prepared_queries),
            ResourceType::EventingSchema => Some(&mut self.eventing_schemas),
            ResourceType::EventingRule => Some(&mut self.eventing_rules),
            ResourceType::EventingTrigger => Some(&mut self.eventing_triggers),
            ResourceType::FileStoreRule => Some(&mut self.file_store_rules),
            ResourceType::AuthProvider => Some(&mut self.auths),
            ResourceType::IngressRoute => Some(&mut self.ingress_routes),
            ResourceType::RemoteService => Some(&mut self.remote_services),
            _ => None,
        }
    }

    fn singleton_mut(&mut self, resource_type: ResourceType) -> Option<&mut Singleton> {
        match resource_type {
            ResourceType::EventingConfig => Some(&mut self.eventing_config),
            ResourceType::FileStoreConfig => Some(&mut self.file_store_config),
            ResourceType::ProjectLetsEncrypt => Some(&mut self.lets_encrypt),
            ResourceType::IngressGlobal => Some(&mut self.ingress_global),
            _ => None,
        }
    }

    fn maps(&self) -> [(ResourceType, &ResourceMap); 11] {
        [
            (ResourceType::DatabaseConfig, &self.database_configs),
            (ResourceType::DatabaseSchema, &self.database_schemas),
            (ResourceType::DatabaseRule, &self.database_rules),
            (ResourceType::DatabasePreparedQuery, &self.database_prepared_queries),
            (ResourceType::EventingSchema, &self.eventing_schemas),
            (ResourceType::EventingRule, &self.eventing_rules),
            (ResourceType::EventingTrigger, &self.eventing_triggers),
            (ResourceType::FileStoreRule, &self.file_store_rules),
            (ResourceType::AuthProvider, &self.auths),
            (ResourceType::IngressRoute, &self.ingress_routes),
            (ResourceType::RemoteService, &self.remote_services),
        ]
    }

    fn singletons(&self) -> [(ResourceType, &Singleton); 4] {
        [
            (ResourceType::EventingConfig, &self.eventing_config),
            (ResourceType::FileStoreConfig, &self.file_store_config),
            (ResourceType::ProjectLetsEncrypt, &self.lets_encrypt),
            (ResourceType::IngressGlobal, &self.ingress_global),
        ]
    }

    /// Current occupant of the singleton slot for `resource_type`.
    pub fn singleton(&self, resource_type: ResourceType) -> Option<&SingletonResource> {
        self.singletons()
            .into_iter()
            .find(|(t, _)| *t == resource_type)
            .and_then(|(_, slot)| slot.as_ref())
    }
}

/// What a single `apply_resource` call changed, used to pick the hook to notify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedChange {
    ProjectConfig { project_id: String },
    ProjectDeleted { project_id: String },
    ProjectResource {
        project_id: String,
        resource_type: ResourceType,
    },
    ClusterSettings,
    License,
    Integrations,
    CacheConfig,
    /// Project-level resource for a project this node does not know.
    UnknownProject { project_id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    pub admin: AdminConfig,
    pub projects: BTreeMap<String, Project>,
    pub cache_config: Singleton,
    pub integrations: ResourceMap,
    pub integration_hooks: ResourceMap,
}

impl ClusterConfig {
    /// Build a snapshot from a flat resource listing as stores return it.
    ///
    /// Malformed entries are returned alongside the snapshot rather than
    /// failing the whole load.
    pub fn from_resources(
        admin: AdminConfig,
        resources: &[(ResourceId, Value)],
    ) -> (Self, Vec<SyncError>) {
        let mut config = ClusterConfig {
            admin,
            ..Default::default()
        };
        let errors = config.replace_resources(resources);
        (config, errors)
    }

    /// Replace every resource in the snapshot with `resources`, keeping the admin config.
    pub fn replace_resources(&mut self, resources: &[(ResourceId, Value)]) -> Vec<SyncError> {
        self.projects.clear();
        self.cache_config = None;
        self.integrations.clear();
        self.integration_hooks.clear();

        let mut errors = Vec::new();
        // Project headers first so their resources find an owner.
        let (headers, rest): (Vec<_>, Vec<_>) = resources
            .iter()
            .partition(|(id, _)| id.resource_type() == ResourceType::Project);
        for (id, payload) in headers.into_iter().chain(rest) {
            match self.apply_resource(EventKind::Add, id, Some(payload)) {
                Ok(AppliedChange::UnknownProject { project_id }) => {
                    errors.push(SyncError::ProjectNotFound(project_id));
                }
                Ok(_) => {}
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    /// Apply one resource event to the snapshot.
    pub fn apply_resource(
        &mut self,
        kind: EventKind,
        id: &ResourceId,
        payload: Option<&Value>,
    ) -> SyncResult<AppliedChange> {
        let resource_type = id.resource_type();
        let payload = match kind {
            EventKind::Delete => None,
            EventKind::Add | EventKind::Update => Some(payload.ok_or_else(|| {
                SyncError::InvalidResource {
                    resource_type: resource_type.to_string(),
                    message: format!("missing payload for {}", id),
                }
            })?),
        };

        if resource_type.is_cluster_scoped() {
            return self.apply_cluster_resource(id, payload);
        }

        let project_id = id.project_id().to_string();
        if resource_type == ResourceType::Project {
            return match payload {
                None => {
                    self.projects.remove(&project_id);
                    Ok(AppliedChange::ProjectDeleted { project_id })
                }
                Some(value) => {
                    let mut project_config: ProjectConfig = decode(resource_type, value)?;
                    if project_config.id.is_empty() {
                        project_config.id = project_id.clone();
                    }
                    project_config.normalize();
                    self.projects
                        .entry(project_id.clone())
                        .and_modify(|p| p.project_config = project_config.clone())
                        .or_insert_with(|| Project::new(project_config));
                    Ok(AppliedChange::ProjectConfig { project_id })
                }
            };
        }

        let Some(project) = self.projects.get_mut(&project_id) else {
            return Ok(AppliedChange::UnknownProject { project_id });
        };

        if let Some(map) = project.map_mut(resource_type) {
            match payload {
                Some(value) => {
                    map.insert(id.to_string(), value.clone());
                }
                None => {
                    map.remove(id.as_str());
                }
            }
        } else if let Some(slot) = project.singleton_mut(resource_type) {
            apply_singleton(slot, id, payload);
        } else {
            return Err(SyncError::UnknownResourceType(resource_type.to_string()));
        }

        Ok(AppliedChange::ProjectResource {
            project_id,
            resource_type,
        })
    }

    fn apply_cluster_resource(
        &mut self,
        id: &ResourceId,
        payload: Option<&Value>,
    ) -> SyncResult<AppliedChange> {
        let resource_type = id.resource_type();
        match resource_type {
            ResourceType::Cluster => {
                self.admin.cluster = match payload {
                    Some(value) => decode(resource_type, value)?,
                    None => ClusterSettings::default(),
                };
                Ok(AppliedChange::ClusterSettings)
            }
            ResourceType::License => {
                let license: LicensePayload = match payload {
                    Some(value) => decode(resource_type, value)?,
                    None => LicensePayload::default(),
                };
                self.admin.license_key = license.license_key;
                self.admin.license_value = license.license_value;
                self.admin.license = license.license;
                Ok(AppliedChange::License)
            }
            ResourceType::CacheConfig => {
                apply_singleton(&mut self.cache_config, id, payload);
                Ok(AppliedChange::CacheConfig)
            }
            ResourceType::Integration | ResourceType::IntegrationHook => {
                let map = if resource_type == ResourceType::Integration {
                    &mut self.integrations
                } else {
                    &mut self.integration_hooks
                };
                match payload {
                    Some(value) => {
                        map.insert(id.to_string(), value.clone());
                    }
                    None => {
                        map.remove(id.as_str());
                    }
                }
                Ok(AppliedChange::Integrations)
            }
            other => Err(SyncError::UnknownResourceType(other.to_string())),
        }
    }

    /// Flatten the snapshot back into `(resource id, payload)` pairs.
    pub fn to_resources(&self, cluster_id: &str) -> SyncResult<Vec<(ResourceId, Value)>> {
        let mut out = Vec::new();

        if self.admin.cluster != ClusterSettings::default() {
            out.push((
                ResourceId::cluster_level(cluster_id, ResourceType::Cluster, &["cluster"])?,
                serde_json::to_value(&self.admin.cluster)?,
            ));
        }
        if let Some(cache) = &self.cache_config {
            out.push((cache.id.clone(), cache.payload.clone()));
        }
        for (raw, value) in self.integrations.iter().chain(&self.integration_hooks) {
            out.push((ResourceId::parse(raw)?, value.clone()));
        }

        for (project_id, project) in &self.projects {
            out.push((
                ResourceId::project(cluster_id, project_id)?,
                serde_json::to_value(&project.project_config)?,
            ));
            for (_, slot) in project.singletons() {
                if let Some(singleton) = slot {
                    out.push((singleton.id.clone(), singleton.payload.clone()));
                }
            }
            for (_, map) in project.maps() {
                for (raw, value) in map {
                    out.push((ResourceId::parse(raw)?, value.clone()));
                }
            }
        }

        Ok(out)
    }

    /// ID currently held in the singleton slot that `id` would occupy.
    pub fn singleton_id(&self, id: &ResourceId) -> Option<&ResourceId> {
        let resource_type = id.resource_type();
        let slot = match resource_type {
            ResourceType::CacheConfig => self.cache_config.as_ref(),
            t if t.is_singleton() && !t.is_cluster_scoped() && t != ResourceType::Project => {
                self.projects.get(id.project_id())?.singleton(t)
            }
            _ => None,
        };
        slot.map(|s| &s.id)
    }

    pub fn project_ids(&self) -> Vec<String> {
        self.projects.keys().cloned().collect()
    }

    /// Current payload stored under `id`, if any.
    pub fn resource(&self, id: &ResourceId) -> Option<Value> {
        let resource_type = id.resource_type();
        match resource_type {
            ResourceType::Cluster => serde_json::to_value(&self.admin.cluster).ok(),
            ResourceType::License => serde_json::to_value(LicensePayload {
                license_key: self.admin.license_key.clone(),
                license_value: self.admin.license_value.clone(),
                license: self.admin.license.clone(),
            })
            .ok(),
            ResourceType::CacheConfig => self
                .cache_config
                .as_ref()
                .filter(|s| s.id == *id)
                .map(|s| s.payload.clone()),
            ResourceType::Integration => self.integrations.get(id.as_str()).cloned(),
            ResourceType::IntegrationHook => self.integration_hooks.get(id.as_str()).cloned(),
            _ => {
                let project = self.projects.get(id.project_id())?;
                if resource_type == ResourceType::Project {
                    return serde_json::to_value(&project.project_config).ok();
                }
                if resource_type.is_singleton() {
                    return project
                        .singleton(resource_type)
                        .filter(|s| s.id == *id)
                        .map(|s| s.payload.clone());
                }
                project
                    .maps()
                    .into_iter()
                    .find(|(t, _)| *t == resource_type)
                    .and_then(|(_, map)| map.get(id.as_str()).cloned())
            }
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    resource_type: ResourceType,
    value: &Value,
) -> SyncResult<T> {
    serde_json::from_value(value.clone()).map_err(|e| SyncError::InvalidResource {
        resource_type: resource_type.to_string(),
        message: e.to_string(),
    })
}
