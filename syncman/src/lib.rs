//! Cluster sync core for multi-node gateways.
//!
//! Keeps every gateway in a cluster agreeing on one configuration and one
//! membership list while each node serves traffic on its own.
//!
//! Provides:
//! - [`SyncManager`]: configuration snapshot, membership and token assignment
//! - Store backends: local file, Kubernetes, Consul, etcd, Postgres
//! - Resource id codec
//! - Token partitioner
//! - Leader-gated license control channel over pub/sub

pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod model;
pub mod pubsub;
pub mod resource;
pub mod services;
pub mod store;
pub mod tokens;

#[cfg(test)]
mod tests;

pub use config::{StoreConfig, StoreKind, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use health::{HealthHandle, NodeHealth};
pub use manager::{NoopHooks, SyncHooks, SyncManager};
pub use model::{AdminConfig, ClusterConfig, Project, ProjectConfig};
pub use pubsub::{
    generate_pubsub_topic, ControlChannel, LeaderElector, LicenseHandler, LicenseOperation,
    MemoryPubSub, PubSub, RedisPubSub,
};
pub use resource::{EventKind, ResourceId, ResourceType};
pub use services::{ScServices, Service};
pub use store::{create_store, ReconcileEvent, ResourceEvent, ResourceSnapshot, Store};
pub use tokens::{calc_index, calc_tokens};
