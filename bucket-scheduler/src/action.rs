use std::sync::Arc;

use async_trait::async_trait;
use bucket_coordination::{BucketAction, ServiceType, WorkItem};

const ITEMS_VISITED: &str = "bucket_scheduler_items_visited_total";

/// Records every visit to a work item. Bound to each service until its
/// stream backend provides the real per-item operation.
pub struct VisitLogger {
    service_type: ServiceType,
}

impl VisitLogger {
    pub fn new(service_type: ServiceType) -> Arc<dyn BucketAction> {
        Arc::new(Self { service_type })
    }
}

#[async_trait]
impl BucketAction for VisitLogger {
    async fn apply(&self, item: &WorkItem) -> anyhow::Result<()> {
        tracing::debug!(service = %self.service_type, item = %item, "visiting work item");
        metrics::counter!(ITEMS_VISITED, "service" => self.service_type.as_str()).increment(1);
        Ok(())
    }
}
