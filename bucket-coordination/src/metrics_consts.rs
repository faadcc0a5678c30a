pub const TICKS: &str = "bucket_worker_ticks_total";
pub const TICK_DURATION_MS: &str = "bucket_worker_tick_duration_ms";

pub const ACTION_OUTCOMES: &str = "bucket_worker_action_outcomes_total";
pub const KNOWN_ITEMS: &str = "bucket_worker_known_items";
pub const MISPLACED_ITEMS: &str = "bucket_worker_misplaced_items_total";

pub const OWNED_BUCKETS: &str = "bucket_manager_owned_buckets";
pub const OWNERSHIP_CLAIMS: &str = "bucket_manager_ownership_claims_total";
pub const OWNERSHIP_LOST: &str = "bucket_manager_ownership_lost_total";
pub const WORKER_RESTARTS: &str = "bucket_manager_worker_restarts_total";

// Retries of transient store failures, labelled by operation
pub const STORE_RETRIES: &str = "bucket_store_retries_total";
