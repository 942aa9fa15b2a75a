//! Node health and registration retry.
//!
//! A failed registration or lease renewal is retried with exponential
//! backoff. Exhausting the retries marks the node `Degraded` and reports the
//! error to the caller; the process keeps running.

use std::{future::Future, sync::Arc, time::Duration};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    config::RegistrationConfig,
    error::{SyncError, SyncResult},
    metrics::SyncMetrics,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    /// First registration in progress.
    Joining,
    Registered,
    /// Registration retries exhausted.
    Degraded,
    /// Lost the registration and trying to get it back.
    Rejoining,
}

impl NodeHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeHealth::Joining => "joining",
            NodeHealth::Registered => "registered",
            NodeHealth::Degraded => "degraded",
            NodeHealth::Rejoining => "rejoining",
        }
    }

    /// Numeric form exported as the `syncman_node_health` gauge.
    pub fn as_gauge(&self) -> f64 {
        match self {
            NodeHealth::Registered => 1.0,
            NodeHealth::Joining | NodeHealth::Rejoining => 0.5,
            NodeHealth::Degraded => 0.0,
        }
    }
}

/// Shared, cheaply clonable handle on the node's health.
#[derive(Debug, Clone)]
pub struct HealthHandle {
    inner: Arc<RwLock<NodeHealth>>,
}

impl Default for HealthHandle {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(NodeHealth::Joining)),
        }
    }
}

impl HealthHandle {
    pub fn get(&self) -> NodeHealth {
        *self.inner.read()
    }

    pub fn set(&self, health: NodeHealth) {
        let mut current = self.inner.write();
        if *current != health {
            info!(from = current.as_str(), to = health.as_str(), "Node health changed");
            *current = health;
        }
        SyncMetrics::set_node_health(health);
    }
}

/// Runs a registration closure with exponential backoff and keeps the
/// health handle in step with the outcome.
#[derive(Debug, Clone)]
pub struct Registrar {
    store: &'static str,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    health: HealthHandle,
}

impl Registrar {
    pub fn new(store: &'static str, config: &RegistrationConfig, health: HealthHandle) -> Self {
        Self {
            store,
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            health,
        }
    }

    pub fn health(&self) -> &HealthHandle {
        &self.health
    }

    /// delay = min(base_delay * 2^(attempt-1), max_delay)
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 2u64.saturating_pow(exponent);
        let delay = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay.as_millis() as u64))
    }

    /// First registration of this node.
    pub async fn join<F, Fut, T>(&self, register_fn: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        self.health.set(NodeHealth::Joining);
        self.run(register_fn).await
    }

    /// Registration after a lost lease or session.
    pub async fn rejoin<F, Fut, T>(&self, register_fn: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        self.health.set(NodeHealth::Rejoining);
        self.run(register_fn).await
    }

    async fn run<F, Fut, T>(&self, mut register_fn: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        for attempt in 1..=self.max_attempts {
            match register_fn().await {
                Ok(val) => {
                    SyncMetrics::record_registration(self.store, "success");
                    self.health.set(NodeHealth::Registered);
                    return Ok(val);
                }
                Err(e) => {
                    SyncMetrics::record_registration(self.store, "error");
                    if attempt >= self.max_attempts {
                        error!(
                            store = self.store,
                            attempt,
                            error = %e,
                            "Registration failed, giving up"
                        );
                        break;
                    }
                    let delay = self.calculate_backoff(attempt);
                    warn!(
                        store = self.store,
                        attempt,
                        error = %e,
                        "Registration attempt failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.health.set(NodeHealth::Degraded);
        Err(SyncError::Registration(format!(
            "{} registration failed after {} attempts",
            self.store, self.max_attempts
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn registrar(max_attempts: u32) -> Registrar {
        let config = RegistrationConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 4,
            ..Default::default()
        };
        Registrar::new("test", &config, HealthHandle::default())
    }

    #[test]
    fn test_backoff_calculation() {
        let r = Registrar::new(
            "test",
            &RegistrationConfig::default(),
            HealthHandle::default(),
        );
        assert_eq!(r.calculate_backoff(0), Duration::ZERO);
        assert_eq!(r.calculate_backoff(1), Duration::from_millis(500));
        assert_eq!(r.calculate_backoff(2), Duration::from_millis(1000));
        assert_eq!(r.calculate_backoff(5), Duration::from_millis(8000));
        assert_eq!(r.calculate_backoff(20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_join_succeeds_after_retries() {
        let r = registrar(5);
        let calls = AtomicU32::new(0);
        let out = r
            .join(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::store("test", "not yet"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(r.health().get(), NodeHealth::Registered);
    }

    #[tokio::test]
    async fn test_exhausted_retries_degrade_without_panicking() {
        let r = registrar(3);
        let err = r
            .rejoin(|| async { Err::<(), _>(SyncError::store("test", "down")) })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Registration(_)));
        assert_eq!(r.health().get(), NodeHealth::Degraded);
    }
}
