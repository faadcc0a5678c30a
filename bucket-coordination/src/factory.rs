use std::sync::Arc;
use std::time::Duration;

use crate::action::BucketAction;
use crate::config::BucketServiceConfig;
use crate::error::Result;
use crate::manager::BucketOwnershipManager;
use crate::store::BucketStore;
use crate::types::ServiceType;

/// Builds one [`BucketOwnershipManager`] per service type, all sharing the
/// host identity, the store and the settings in `defaults`.
pub struct BucketServiceFactory {
    store: Arc<dyn BucketStore>,
    defaults: BucketServiceConfig,
}

impl BucketServiceFactory {
    pub fn new(host_id: impl Into<String>, store: Arc<dyn BucketStore>) -> Self {
        Self::with_defaults(
            store,
            BucketServiceConfig {
                host_id: host_id.into(),
                ..Default::default()
            },
        )
    }

    /// `defaults.service_type`, `bucket_count` and `tick_period` are replaced
    /// per created service.
    pub fn with_defaults(store: Arc<dyn BucketStore>, defaults: BucketServiceConfig) -> Self {
        Self { store, defaults }
    }

    pub fn host_id(&self) -> &str {
        &self.defaults.host_id
    }

    pub fn create_retention_service(
        &self,
        bucket_count: u32,
        tick_period: Duration,
        action: Arc<dyn BucketAction>,
    ) -> Result<BucketOwnershipManager> {
        self.create(ServiceType::RetentionService, bucket_count, tick_period, action)
    }

    pub fn create_watermarking_service(
        &self,
        bucket_count: u32,
        tick_period: Duration,
        action: Arc<dyn BucketAction>,
    ) -> Result<BucketOwnershipManager> {
        self.create(ServiceType::WatermarkingService, bucket_count, tick_period, action)
    }

    fn create(
        &self,
        service_type: ServiceType,
        bucket_count: u32,
        tick_period: Duration,
        action: Arc<dyn BucketAction>,
    ) -> Result<BucketOwnershipManager> {
        let config = BucketServiceConfig {
            service_type,
            bucket_count,
            tick_period,
            ..self.defaults.clone()
        };
        BucketOwnershipManager::new(config, Arc::clone(&self.store), action)
    }
}
