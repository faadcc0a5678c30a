#![allow(dead_code)]

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use bucket_coordination::store::{EtcdBucketStore, EtcdStoreConfig, MemoryBucketStore};
use bucket_coordination::{
    BucketAction, BucketId, BucketOwnershipManager, BucketServiceConfig, BucketStore,
    Result, RetryPolicy, ServiceType, WorkItem,
};

pub const ETCD_ENDPOINT: &str = "http://localhost:2379";
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);
pub const SERVICE: ServiceType = ServiceType::RetentionService;

pub async fn wait_for_condition<F, Fut>(timeout: Duration, interval: Duration, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
    panic!("condition not met within {timeout:?}");
}

/// [`wait_for_condition`] for checks that need no await.
pub async fn wait_until(timeout: Duration, interval: Duration, f: impl Fn() -> bool) {
    wait_for_condition(timeout, interval, || std::future::ready(f())).await
}

pub async fn test_etcd_store(test_name: &str) -> Arc<EtcdBucketStore> {
    test_etcd_store_with_prefix(&unique_prefix(test_name)).await
}

pub fn unique_prefix(test_name: &str) -> String {
    format!("/test-{}-{}/", test_name, uuid::Uuid::new_v4())
}

/// Separate sessions over the same keys, e.g. a holder and an observer.
pub async fn test_etcd_store_with_prefix(prefix: &str) -> Arc<EtcdBucketStore> {
    let config = EtcdStoreConfig {
        endpoints: vec![ETCD_ENDPOINT.to_string()],
        prefix: prefix.to_string(),
        session_lease_ttl: 5,
        keepalive_interval: Duration::from_secs(1),
    };
    Arc::new(
        EtcdBucketStore::connect(config)
            .await
            .expect("failed to connect to etcd"),
    )
}

/// Millisecond-scale timings so convergence, ticks and sweeps all happen
/// several times within a test.
pub fn fast_config(host_id: &str, bucket_count: u32) -> BucketServiceConfig {
    BucketServiceConfig {
        service_type: SERVICE,
        bucket_count,
        host_id: host_id.to_string(),
        tick_period: Duration::from_millis(20),
        convergence_poll_interval: Duration::from_millis(30),
        ownership_check_interval: Duration::from_millis(50),
        graceful_shutdown: Duration::from_secs(2),
        max_concurrent_actions: 2,
        retry: RetryPolicy::build(2, Duration::from_millis(5))
            .maximum_interval(Duration::from_millis(20))
            .max_attempts(3)
            .provide(),
    }
}

pub async fn start_manager(
    config: BucketServiceConfig,
    store: Arc<dyn BucketStore>,
    action: Arc<dyn BucketAction>,
) -> BucketOwnershipManager {
    let manager = BucketOwnershipManager::new(config, store, action).expect("valid config");
    manager.start().expect("manager starts once");
    manager.await_running().await.expect("manager reaches running");
    manager
}

pub async fn stop_manager(manager: &BucketOwnershipManager) {
    manager.stop();
    tokio::time::timeout(WAIT_TIMEOUT, manager.await_terminated())
        .await
        .expect("manager terminates");
}

/// First `count` stream names that map to `bucket_id`.
pub fn items_in_bucket(bucket_id: BucketId, bucket_count: u32, count: usize) -> Vec<WorkItem> {
    (0..)
        .map(|i| WorkItem::new("scope", format!("stream-{i}")))
        .filter(|item| item.bucket(bucket_count).unwrap() == bucket_id)
        .take(count)
        .collect()
}

pub async fn add_items(store: &MemoryBucketStore, bucket_id: BucketId, items: &[WorkItem]) {
    for item in items {
        store.add_work_item(SERVICE, bucket_id, item).await.unwrap();
    }
}

pub fn owned_buckets(manager: &BucketOwnershipManager) -> Vec<BucketId> {
    let mut owned: Vec<BucketId> = manager.bucket_services().into_keys().collect();
    owned.sort_unstable();
    owned
}

/// Records every invocation. Fails or panics for the configured items.
#[derive(Default)]
pub struct RecordingAction {
    calls: Mutex<Vec<WorkItem>>,
    failing: HashSet<WorkItem>,
    panicking: HashSet<WorkItem>,
    delay: Option<Duration>,
}

impl RecordingAction {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_for(items: impl IntoIterator<Item = WorkItem>) -> Arc<Self> {
        Arc::new(Self {
            failing: items.into_iter().collect(),
            ..Default::default()
        })
    }

    pub fn panicking_for(items: impl IntoIterator<Item = WorkItem>) -> Arc<Self> {
        Arc::new(Self {
            panicking: items.into_iter().collect(),
            ..Default::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn call_count(&self, item: &WorkItem) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|called| *called == item)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl BucketAction for RecordingAction {
    async fn apply(&self, item: &WorkItem) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(item.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panicking.contains(item) {
            panic!("action panicked for {item}");
        }
        if self.failing.contains(item) {
            anyhow::bail!("action failed for {item}");
        }
        Ok(())
    }
}

/// Memory store without membership hints, so workers only see changes on
/// their poll interval.
pub struct PollOnlyStore(pub Arc<MemoryBucketStore>);

#[async_trait]
impl BucketStore for PollOnlyStore {
    async fn add_work_item(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
        item: &WorkItem,
    ) -> Result<()> {
        self.0.add_work_item(service_type, bucket_id, item).await
    }

    async fn remove_work_item(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
        item: &WorkItem,
    ) -> Result<()> {
        self.0.remove_work_item(service_type, bucket_id, item).await
    }

    async fn list_work_items(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
    ) -> Result<BTreeSet<WorkItem>> {
        self.0.list_work_items(service_type, bucket_id).await
    }

    async fn try_claim(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
        host_id: &str,
    ) -> Result<bool> {
        self.0.try_claim(service_type, bucket_id, host_id).await
    }

    async fn release(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
        host_id: &str,
    ) -> Result<()> {
        self.0.release(service_type, bucket_id, host_id).await
    }

    async fn owner(&self, service_type: ServiceType, bucket_id: BucketId) -> Result<Option<String>> {
        self.0.owner(service_type, bucket_id).await
    }
}
