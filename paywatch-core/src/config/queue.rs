use std::time::Duration;

pub const QUEUE_CRITICAL: &str = "critical";
pub const QUEUE_DEFAULT: &str = "default";
pub const QUEUE_LOW: &str = "low";

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// One worker is spawned per name.
    pub names: Vec<String>,
    pub poll_interval: Duration,
    /// Retry `n` is scheduled `n * backoff_unit` after the failure.
    pub backoff_unit: Duration,
    pub default_max_retry: i32,
    /// Processing jobs untouched for this long are handed back to Pending.
    pub stale_after: Duration,
    /// Completed and Failed jobs older than this are purged.
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            names: vec![
                QUEUE_CRITICAL.to_string(),
                QUEUE_DEFAULT.to_string(),
                QUEUE_LOW.to_string(),
            ],
            poll_interval: Duration::from_secs(1),
            backoff_unit: Duration::from_secs(10),
            default_max_retry: 3,
            stale_after: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Covers expired reservations and stale Processing jobs.
    pub reservation_sweep: Duration,
    pub queue_purge: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            reservation_sweep: Duration::from_secs(5 * 60),
            queue_purge: Duration::from_secs(6 * 60 * 60),
        }
    }
}
