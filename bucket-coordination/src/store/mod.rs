//! Durable bucket membership and ownership, as required by the bucket engine.

use std::collections::BTreeSet;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::{BucketId, ServiceType, WorkItem};

pub mod etcd;
pub mod memory;

pub use etcd::{EtcdBucketStore, EtcdStoreConfig};
pub use memory::MemoryBucketStore;

/// Push notifications that a bucket's membership may have changed.
///
/// Hints carry no data: the receiver re-reads the membership from the store.
/// The stream ends when the store stops delivering notifications.
pub type MembershipHints = BoxStream<'static, ()>;

/// Store contract consumed by the bucket engine.
///
/// Every operation may fail with a retryable error (see
/// [`Error::is_retryable`](crate::Error::is_retryable)) when the store is
/// temporarily unreachable.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn add_work_item(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
        item: &WorkItem,
    ) -> Result<()>;

    async fn remove_work_item(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
        item: &WorkItem,
    ) -> Result<()>;

    async fn list_work_items(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
    ) -> Result<BTreeSet<WorkItem>>;

    /// Atomically claim the ownership lease of a bucket for `host_id`.
    ///
    /// Returns `true` if `host_id` holds the bucket afterwards (including when it
    /// already did), `false` if another host holds it.
    async fn try_claim(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
        host_id: &str,
    ) -> Result<bool>;

    /// Release the ownership of a bucket if, and only if, `host_id` holds it.
    async fn release(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
        host_id: &str,
    ) -> Result<()>;

    /// Current holder of a bucket, if any.
    async fn owner(&self, service_type: ServiceType, bucket_id: BucketId)
        -> Result<Option<String>>;

    /// Subscribe to change hints for one bucket's membership. Stores without
    /// push support return `None` and are polled.
    async fn watch_work_items(
        &self,
        _service_type: ServiceType,
        _bucket_id: BucketId,
    ) -> Result<Option<MembershipHints>> {
        Ok(None)
    }
}
