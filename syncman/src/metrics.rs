//! Metric names and recording helpers.
//!
//! Recording goes through the `metrics` facade; the embedding process picks
//! the exporter. Without an installed recorder every call is a no-op.

use metrics::{counter, describe_counter, describe_gauge, gauge};

use crate::health::NodeHealth;

pub const RECONCILE_EVENTS_TOTAL: &str = "syncman_reconcile_events_total";
pub const STORE_WRITES_TOTAL: &str = "syncman_store_writes_total";
pub const REGISTRATION_ATTEMPTS_TOTAL: &str = "syncman_registration_attempts_total";
pub const PUBSUB_COMMANDS_TOTAL: &str = "syncman_pubsub_commands_total";
pub const CLUSTER_SIZE: &str = "syncman_cluster_size";
pub const NODE_HEALTH: &str = "syncman_node_health";

/// Register metric descriptions with the installed recorder.
pub fn init_metrics() {
    describe_counter!(
        RECONCILE_EVENTS_TOTAL,
        "Reconcile events applied by the dispatch loop"
    );
    describe_counter!(STORE_WRITES_TOTAL, "Write-through operations against the store");
    describe_counter!(
        REGISTRATION_ATTEMPTS_TOTAL,
        "Registration and renewal attempts against the store"
    );
    describe_counter!(
        PUBSUB_COMMANDS_TOTAL,
        "Control channel commands handled by this node"
    );
    describe_gauge!(CLUSTER_SIZE, "Gateway nodes in the service registry");
    describe_gauge!(
        NODE_HEALTH,
        "Node health: 1 registered, 0.5 joining or rejoining, 0 degraded"
    );
}

pub struct SyncMetrics;

impl SyncMetrics {
    pub fn record_reconcile(kind: &'static str, outcome: &'static str) {
        counter!(RECONCILE_EVENTS_TOTAL, "kind" => kind, "outcome" => outcome).increment(1);
    }

    pub fn record_store_write(store: &'static str, op: &'static str, outcome: &'static str) {
        counter!(STORE_WRITES_TOTAL, "store" => store, "op" => op, "outcome" => outcome)
            .increment(1);
    }

    pub fn record_registration(store: &'static str, outcome: &'static str) {
        counter!(REGISTRATION_ATTEMPTS_TOTAL, "store" => store, "outcome" => outcome).increment(1);
    }

    pub fn record_pubsub_command(operation: &'static str, outcome: &'static str) {
        counter!(PUBSUB_COMMANDS_TOTAL, "operation" => operation, "outcome" => outcome)
            .increment(1);
    }

    pub fn set_cluster_size(size: usize) {
        gauge!(CLUSTER_SIZE).set(size as f64);
    }

    pub fn set_node_health(health: NodeHealth) {
        gauge!(NODE_HEALTH).set(health.as_gauge());
    }
}
