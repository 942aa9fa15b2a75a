//! Resource identity: resource kinds, change kinds and the resource ID codec.
//!
//! A resource ID is the single coordinate every store keys its storage on:
//!
//! ```text
//! <cluster>--<project>--<resource-type>--<name>[--<name>...]
//! ```
//!
//! Cluster-level resources use the reserved project segment `noproject`.
//! Encoding the same tuple always yields the same bytes, and parsing an
//! encoded ID recovers the tuple exactly.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

const SEPARATOR: &str = "--";

/// Project segment used by resources that do not belong to a project.
pub const NO_PROJECT: &str = "noproject";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceType {
    Project,
    #[serde(rename = "db-config")]
    DatabaseConfig,
    #[serde(rename = "db-schema")]
    DatabaseSchema,
    #[serde(rename = "db-rule")]
    DatabaseRule,
    #[serde(rename = "db-prepared-query")]
    DatabasePreparedQuery,
    EventingConfig,
    EventingSchema,
    EventingRule,
    EventingTrigger,
    #[serde(rename = "filestore-config")]
    FileStoreConfig,
    #[serde(rename = "filestore-rule")]
    FileStoreRule,
    AuthProvider,
    #[serde(rename = "letsencrypt")]
    ProjectLetsEncrypt,
    IngressRoute,
    IngressGlobal,
    RemoteService,
    Cluster,
    Integration,
    IntegrationHook,
    CacheConfig,
    License,
}

impl ResourceType {
    pub const ALL: [ResourceType; 21] = [
        ResourceType::Project,
        ResourceType::DatabaseConfig,
        ResourceType::DatabaseSchema,
        ResourceType::DatabaseRule,
        ResourceType::DatabasePreparedQuery,
        ResourceType::EventingConfig,
        ResourceType::EventingSchema,
        ResourceType::EventingRule,
        ResourceType::EventingTrigger,
        ResourceType::FileStoreConfig,
        ResourceType::FileStoreRule,
        ResourceType::AuthProvider,
        ResourceType::ProjectLetsEncrypt,
        ResourceType::IngressRoute,
        ResourceType::IngressGlobal,
        ResourceType::RemoteService,
        ResourceType::Cluster,
        ResourceType::Integration,
        ResourceType::IntegrationHook,
        ResourceType::CacheConfig,
        ResourceType::License,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Project => "project",
            ResourceType::DatabaseConfig => "db-config",
            ResourceType::DatabaseSchema => "db-schema",
            ResourceType::DatabaseRule => "db-rule",
            ResourceType::DatabasePreparedQuery => "db-prepared-query",
            ResourceType::EventingConfig => "eventing-config",
            ResourceType::EventingSchema => "eventing-schema",
            ResourceType::EventingRule => "eventing-rule",
            ResourceType::EventingTrigger => "eventing-trigger",
            ResourceType::FileStoreConfig => "filestore-config",
            ResourceType::FileStoreRule => "filestore-rule",
            ResourceType::AuthProvider => "auth-provider",
            ResourceType::ProjectLetsEncrypt => "letsencrypt",
            ResourceType::IngressRoute => "ingress-route",
            ResourceType::IngressGlobal => "ingress-global",
            ResourceType::RemoteService => "remote-service",
            ResourceType::Cluster => "cluster",
            ResourceType::Integration => "integration",
            ResourceType::IntegrationHook => "integration-hook",
            ResourceType::CacheConfig => "cache-config",
            ResourceType::License => "license",
        }
    }

    /// Cluster-wide resources live outside any project.
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(
            self,
            ResourceType::Cluster
                | ResourceType::Integration
                | ResourceType::IntegrationHook
                | ResourceType::CacheConfig
                | ResourceType::License
        )
    }

    /// Resources held as a single value rather than a map keyed by resource ID.
    pub fn is_singleton(&self) -> bool {
        matches!(
            self,
            ResourceType::Project
                | ResourceType::EventingConfig
                | ResourceType::FileStoreConfig
                | ResourceType::ProjectLetsEncrypt
                | ResourceType::IngressGlobal
                | ResourceType::Cluster
                | ResourceType::CacheConfig
                | ResourceType::License
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SyncError::UnknownResourceType(s.to_string()))
    }
}

/// Kind of change a reconcile event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Add => "add",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Resource ID codec
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    raw: String,
    cluster_id: String,
    project_id: String,
    resource_type: ResourceType,
    names: Vec<String>,
}

impl ResourceId {
    /// Encode `(cluster, project, type, names...)` into a resource ID.
    pub fn new<S: AsRef<str>>(
        cluster_id: &str,
        project_id: &str,
        resource_type: ResourceType,
        names: &[S],
    ) -> SyncResult<Self> {
        let names: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        if names.is_empty() {
            return Err(SyncError::InvalidResourceId(format!(
                "{cluster_id}{SEPARATOR}{project_id}{SEPARATOR}{resource_type}"
            )));
        }

        let mut raw = String::new();
        for part in [cluster_id, project_id, resource_type.as_str()]
            .into_iter()
            .chain(names.iter().map(String::as_str))
        {
            if !is_valid_component(part) {
                return Err(SyncError::InvalidResourceId(format!(
                    "component ({part}) must be non-empty and must not contain '--', '/' or leading/trailing '-'"
                )));
            }
            if !raw.is_empty() {
                raw.push_str(SEPARATOR);
            }
            raw.push_str(part);
        }

        Ok(Self {
            raw,
            cluster_id: cluster_id.to_string(),
            project_id: project_id.to_string(),
            resource_type,
            names,
        })
    }

    /// Resource ID of a cluster-level resource (no owning project).
    pub fn cluster_level<S: AsRef<str>>(
        cluster_id: &str,
        resource_type: ResourceType,
        names: &[S],
    ) -> SyncResult<Self> {
        Self::new(cluster_id, NO_PROJECT, resource_type, names)
    }

    /// Resource ID under which a project's own config is stored.
    pub fn project(cluster_id: &str, project_id: &str) -> SyncResult<Self> {
        Self::new(cluster_id, project_id, ResourceType::Project, &[project_id])
    }

    pub fn parse(raw: &str) -> SyncResult<Self> {
        let parts: Vec<&str> = raw.split(SEPARATOR).collect();
        if parts.len() < 4 {
            return Err(SyncError::InvalidResourceId(raw.to_string()));
        }
        let resource_type = parts[2]
            .parse::<ResourceType>()
            .map_err(|_| SyncError::InvalidResourceId(raw.to_string()))?;
        let id = Self::new(parts[0], parts[1], resource_type, &parts[3..])
            .map_err(|_| SyncError::InvalidResourceId(raw.to_string()))?;
        // Rejects inputs like "a---b" whose re-encoding differs from the input.
        if id.raw != raw {
            return Err(SyncError::InvalidResourceId(raw.to_string()));
        }
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_cluster_level(&self) -> bool {
        self.project_id == NO_PROJECT
    }
}

pub(crate) fn is_valid_component(part: &str) -> bool {
    !part.is_empty()
        && !part.contains(SEPARATOR)
        && !part.contains('/')
        && !part.starts_with('-')
        && !part.ends_with('-')
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for ResourceId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceId> for String {
    fn from(value: ResourceId) -> Self {
        value.raw
    }
}

impl AsRef<str> for ResourceId {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_reproducible() {
        let a = ResourceId::new("c1", "p1", ResourceType::DatabaseRule, &["db", "users"]).unwrap();
        let b = ResourceId::new("c1", "p1", ResourceType::DatabaseRule, &["db", "users"]).unwrap();
        assert_eq!(a.as_str(), "c1--p1--db-rule--db--users");
        assert_eq!(a.as_str().as_bytes(), b.as_str().as_bytes());
    }

    #[test]
    fn test_round_trip_recovers_tuple() {
        let id = ResourceId::new("cluster-a", "todo_app", ResourceType::AuthProvider, &["email"])
            .unwrap();
        let parsed = ResourceId::parse(id.as_str()).unwrap();
        assert_eq!(parsed.cluster_id(), "cluster-a");
        assert_eq!(parsed.project_id(), "todo_app");
        assert_eq!(parsed.resource_type(), ResourceType::AuthProvider);
        assert_eq!(parsed.names(), ["email".to_string()]);
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_cluster_level_ids() {
        let id = ResourceId::cluster_level("c1", ResourceType::License, &["license"]).unwrap();
        assert_eq!(id.as_str(), "c1--noproject--license--license");
        assert!(id.is_cluster_level());
        assert!(id.resource_type().is_cluster_scoped());
    }

    #[test]
    fn test_project_id_helper() {
        let id = ResourceId::project("c1", "myproject").unwrap();
        assert_eq!(id.as_str(), "c1--myproject--project--myproject");
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        assert!(ResourceId::parse("c1--p1--db-rule").is_err());
        assert!(ResourceId::parse("c1--p1--not-a-type--x").is_err());
        assert!(ResourceId::parse("c1---p1--project--p1").is_err());
        assert!(ResourceId::parse("c1--p1--project--").is_err());
    }

    #[test]
    fn test_new_rejects_ambiguous_components() {
        assert!(ResourceId::new("c1", "p--1", ResourceType::Project, &["p"]).is_err());
        assert!(ResourceId::new("c1", "p1", ResourceType::Project, &["a/b"]).is_err());
        let empty: [&str; 0] = [];
        assert!(ResourceId::new("c1", "p1", ResourceType::Project, &empty).is_err());
    }

    #[test]
    fn test_resource_type_strings_round_trip() {
        for t in ResourceType::ALL {
            assert_eq!(t.as_str().parse::<ResourceType>().unwrap(), t);
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
    }

    #[test]
    fn test_resource_id_serde_as_string() {
        let id = ResourceId::new("c1", "p1", ResourceType::IngressRoute, &["r1"]).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"c1--p1--ingress-route--r1\"");
        let back: ResourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<ResourceId>("\"bogus\"").is_err());
    }
}
