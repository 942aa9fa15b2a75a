//! Error types for the sync manager and its store backends.

use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Unknown project ({0}) provided")]
    ProjectNotFound(String),

    #[error("Gateway service with node id ({0}) doesn't exist")]
    ServiceNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Invalid resource id ({0}) provided")]
    InvalidResourceId(String),

    #[error("Invalid payload for resource ({resource_type}): {message}")]
    InvalidResource {
        resource_type: String,
        message: String,
    },

    #[error("Unknown resource type ({0}) provided")]
    UnknownResourceType(String),

    #[error("{store} store error: {message}")]
    Store {
        store: &'static str,
        message: String,
    },

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pub/sub error: {0}")]
    PubSub(String),

    #[error("Node ({0}) is not the cluster leader")]
    NotLeader(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Sync manager is not running")]
    NotRunning,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

impl SyncError {
    pub fn store(store: &'static str, message: impl Into<String>) -> Self {
        SyncError::Store {
            store,
            message: message.into(),
        }
    }

    /// True for lookups that missed, as opposed to infrastructure failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SyncError::ProjectNotFound(_)
                | SyncError::ServiceNotFound(_)
                | SyncError::ResourceNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(SyncError::ProjectNotFound("p1".into()).is_not_found());
        assert!(SyncError::ServiceNotFound("n1".into()).is_not_found());
        assert!(!SyncError::store("etcd", "boom").is_not_found());
    }

    #[test]
    fn test_store_error_message() {
        let err = SyncError::store("consul", "session expired");
        assert_eq!(err.to_string(), "consul store error: session expired");
    }
}
