use std::time::Duration;

use bucket_coordination::store::EtcdStoreConfig;
use bucket_coordination::{BucketServiceConfig, RetryPolicy};
use envconfig::Envconfig;
use uuid::Uuid;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // ── HTTP server ─────────────────────────────────────────────────
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3312")]
    pub port: u16,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    // ── etcd ────────────────────────────────────────────────────────
    #[envconfig(default = "http://localhost:2379")]
    pub etcd_endpoints: String,

    #[envconfig(default = "/bucket-scheduler/")]
    pub etcd_prefix: String,

    #[envconfig(default = "30")]
    pub session_lease_ttl_secs: i64,

    #[envconfig(default = "10")]
    pub session_keepalive_interval_secs: u64,

    // Stable across restarts so a restarted host takes its buckets straight back.
    pub host_id: Option<String>,

    // ── Services ────────────────────────────────────────────────────
    #[envconfig(default = "16")]
    pub retention_bucket_count: u32,

    #[envconfig(default = "60000")]
    pub retention_tick_period_ms: u64,

    // 0 disables the watermarking service.
    #[envconfig(default = "0")]
    pub watermarking_bucket_count: u32,

    #[envconfig(default = "10000")]
    pub watermarking_tick_period_ms: u64,

    #[envconfig(default = "10000")]
    pub convergence_poll_interval_ms: u64,

    #[envconfig(default = "30")]
    pub ownership_check_interval_secs: u64,

    #[envconfig(default = "30")]
    pub graceful_shutdown_secs: u64,

    #[envconfig(default = "1")]
    pub max_concurrent_actions: usize,

    // ── Store retries ───────────────────────────────────────────────
    #[envconfig(default = "2")]
    pub store_retry_backoff_coefficient: u32,

    #[envconfig(default = "100")]
    pub store_retry_initial_interval_ms: u64,

    #[envconfig(default = "5000")]
    pub store_retry_maximum_interval_ms: u64,

    #[envconfig(default = "5")]
    pub store_retry_max_attempts: u32,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn etcd_endpoint_list(&self) -> Vec<String> {
        self.etcd_endpoints
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn resolve_host_id(&self) -> String {
        self.host_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::now_v7().to_string())
    }

    pub fn store_config(&self) -> EtcdStoreConfig {
        EtcdStoreConfig {
            endpoints: self.etcd_endpoint_list(),
            prefix: self.etcd_prefix.clone(),
            session_lease_ttl: self.session_lease_ttl_secs,
            keepalive_interval: Duration::from_secs(self.session_keepalive_interval_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(
            self.store_retry_backoff_coefficient,
            Duration::from_millis(self.store_retry_initial_interval_ms),
        )
        .maximum_interval(Duration::from_millis(self.store_retry_maximum_interval_ms))
        .max_attempts(self.store_retry_max_attempts)
        .provide()
    }

    /// Settings shared by every service this host runs.
    pub fn service_defaults(&self, host_id: &str) -> BucketServiceConfig {
        BucketServiceConfig {
            host_id: host_id.to_string(),
            convergence_poll_interval: Duration::from_millis(self.convergence_poll_interval_ms),
            ownership_check_interval: Duration::from_secs(self.ownership_check_interval_secs),
            graceful_shutdown: Duration::from_secs(self.graceful_shutdown_secs),
            max_concurrent_actions: self.max_concurrent_actions,
            retry: self.retry_policy(),
            ..Default::default()
        }
    }

    pub fn retention_tick_period(&self) -> Duration {
        Duration::from_millis(self.retention_tick_period_ms)
    }

    pub fn watermarking_tick_period(&self) -> Duration {
        Duration::from_millis(self.watermarking_tick_period_ms)
    }
}
