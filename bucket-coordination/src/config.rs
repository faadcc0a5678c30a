use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::types::ServiceType;

/// Settings for one [`BucketOwnershipManager`](crate::BucketOwnershipManager).
#[derive(Debug, Clone)]
pub struct BucketServiceConfig {
    pub service_type: ServiceType,
    /// Total buckets for this service type. Fixed for the lifetime of a deployment.
    pub bucket_count: u32,
    /// Stable identity this process claims bucket leases under.
    pub host_id: String,
    /// Delay between the end of one tick and the start of the next.
    pub tick_period: Duration,
    /// Upper bound on how stale a worker's known items may get.
    pub convergence_poll_interval: Duration,
    /// How often the manager re-checks ownership and re-claims free buckets.
    pub ownership_check_interval: Duration,
    /// How long a stopping worker waits for an in-flight tick.
    pub graceful_shutdown: Duration,
    /// Item actions allowed to run at once within one tick.
    pub max_concurrent_actions: usize,
    pub retry: RetryPolicy,
}

impl Default for BucketServiceConfig {
    fn default() -> Self {
        Self {
            service_type: ServiceType::RetentionService,
            bucket_count: 1,
            host_id: "host-0".to_string(),
            tick_period: Duration::from_secs(60),
            convergence_poll_interval: Duration::from_secs(10),
            ownership_check_interval: Duration::from_secs(30),
            graceful_shutdown: Duration::from_secs(30),
            max_concurrent_actions: 1,
            retry: RetryPolicy::default(),
        }
    }
}

impl BucketServiceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 {
            return Err(Error::InvalidArgument(
                "bucket_count must be positive".to_string(),
            ));
        }
        if self.host_id.trim().is_empty() {
            return Err(Error::InvalidArgument("host_id must not be empty".to_string()));
        }
        if self.max_concurrent_actions == 0 {
            return Err(Error::InvalidArgument(
                "max_concurrent_actions must be positive".to_string(),
            ));
        }
        for (name, interval) in [
            ("tick_period", self.tick_period),
            ("convergence_poll_interval", self.convergence_poll_interval),
            ("ownership_check_interval", self.ownership_check_interval),
        ] {
            if interval.is_zero() {
                return Err(Error::InvalidArgument(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(BucketServiceConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_buckets() {
        let config = BucketServiceConfig {
            bucket_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn rejects_blank_host() {
        let config = BucketServiceConfig {
            host_id: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_intervals() {
        let config = BucketServiceConfig {
            tick_period: Duration::ZERO,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tick_period"));
    }
}
