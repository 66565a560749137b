//! Metric names and recorders for the delivery path.
//!
//! The server installs the exporter and describes these metrics; this crate
//! only records them.

use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    pub const MESSAGES_TOTAL: &str = "parley_messages_total";
    pub const MESSAGES_PUBLISHED: &str = "parley_messages_published_total";
    pub const EVICTIONS_TOTAL: &str = "parley_evictions_total";
    pub const ROOMS_ACTIVE: &str = "parley_rooms_active";
    pub const FANOUT_SECONDS: &str = "parley_fanout_seconds";
    pub const COLLABORATOR_FAILURES: &str = "parley_collaborator_failures_total";
    pub const DISCONNECTS_TOTAL: &str = "parley_disconnects_total";
}

/// Record a message passing through a connection.
pub fn record_message(direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
}

/// Record a message accepted by the broker and its fan-out time.
pub fn record_published(seconds: f64) {
    counter!(names::MESSAGES_PUBLISHED).increment(1);
    histogram!(names::FANOUT_SECONDS).record(seconds);
}

/// Record a slow-consumer eviction.
pub fn record_eviction() {
    counter!(names::EVICTIONS_TOTAL).increment(1);
}

/// Update the active room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record a failed collaborator call, or a message the dispatcher had to drop.
pub fn record_collaborator_failure(collaborator: &'static str) {
    counter!(names::COLLABORATOR_FAILURES, "collaborator" => collaborator).increment(1);
}

/// Record why a connection ended.
pub fn record_disconnect(reason: &'static str) {
    counter!(names::DISCONNECTS_TOTAL, "reason" => reason).increment(1);
}
