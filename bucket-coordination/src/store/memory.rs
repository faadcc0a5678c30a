use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::store::{BucketStore, MembershipHints};
use crate::types::{now_seconds, BucketId, OwnershipRecord, ServiceType, WorkItem};

type BucketKey = (ServiceType, BucketId);

#[derive(Default)]
struct MemoryState {
    items: HashMap<BucketKey, BTreeSet<WorkItem>>,
    owners: HashMap<BucketKey, OwnershipRecord>,
}

/// In-process [`BucketStore`] for tests and single-node deployments.
///
/// Ownership records never expire on their own; [`expire_owner`](Self::expire_owner)
/// simulates a lapsed lease. Transient failures can be injected with
/// [`set_unavailable`](Self::set_unavailable) and [`fail_next`](Self::fail_next).
pub struct MemoryBucketStore {
    state: Mutex<MemoryState>,
    changes: broadcast::Sender<BucketKey>,
    unavailable: AtomicBool,
    failures_remaining: AtomicU32,
    next_lease: AtomicI64,
}

impl Default for MemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(MemoryState::default()),
            changes,
            unavailable: AtomicBool::new(false),
            failures_remaining: AtomicU32::new(0),
            next_lease: AtomicI64::new(1),
        }
    }

    /// Fail every operation with a retryable error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` operations with a retryable error.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Hand a bucket to `host_id`, replacing any current holder.
    pub fn force_owner(&self, service_type: ServiceType, bucket_id: BucketId, host_id: &str) {
        let record = self.new_record(host_id);
        self.lock()
            .owners
            .insert((service_type, bucket_id), record);
    }

    /// Drop a bucket's ownership record as if its lease had lapsed.
    pub fn expire_owner(&self, service_type: ServiceType, bucket_id: BucketId) {
        self.lock().owners.remove(&(service_type, bucket_id));
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_record(&self, host_id: &str) -> OwnershipRecord {
        OwnershipRecord {
            host_id: host_id.to_string(),
            lease_id: self.next_lease.fetch_add(1, Ordering::SeqCst),
            claimed_at: now_seconds(),
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::unavailable("memory store marked unavailable"));
        }
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::unavailable("injected memory store failure"));
        }
        Ok(())
    }

    fn notify(&self, key: BucketKey) {
        // No subscribers is fine: workers fall back to polling.
        self.changes.send(key).ok();
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn add_work_item(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
        item: &WorkItem,
    ) -> Result<()> {
        self.check_available()?;
        let inserted = self
            .lock()
            .items
            .entry((service_type, bucket_id))
            .or_default()
            .insert(item.clone());
        if inserted {
            self.notify((service_type, bucket_id));
        }
        Ok(())
    }

    async fn remove_work_item(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
        item: &WorkItem,
    ) -> Result<()> {
        self.check_available()?;
        let removed = self
            .lock()
            .items
            .get_mut(&(service_type, bucket_id))
            .is_some_and(|items| items.remove(item));
        if removed {
            self.notify((service_type, bucket_id));
        }
        Ok(())
    }

    async fn list_work_items(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
    ) -> Result<BTreeSet<WorkItem>> {
        self.check_available()?;
        Ok(self
            .lock()
            .items
            .get(&(service_type, bucket_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn try_claim(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
        host_id: &str,
    ) -> Result<bool> {
        self.check_available()?;
        let mut state = self.lock();
        match state.owners.get(&(service_type, bucket_id)) {
            Some(record) => Ok(record.host_id == host_id),
            None => {
                let record = self.new_record(host_id);
                state.owners.insert((service_type, bucket_id), record);
                Ok(true)
            }
        }
    }

    async fn release(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
        host_id: &str,
    ) -> Result<()> {
        self.check_available()?;
        let mut state = self.lock();
        let held = state
            .owners
            .get(&(service_type, bucket_id))
            .is_some_and(|record| record.host_id == host_id);
        if held {
            state.owners.remove(&(service_type, bucket_id));
        }
        Ok(())
    }

    async fn owner(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
    ) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self
            .lock()
            .owners
            .get(&(service_type, bucket_id))
            .map(|record| record.host_id.clone()))
    }

    async fn watch_work_items(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
    ) -> Result<Option<MembershipHints>> {
        self.check_available()?;
        let rx = self.changes.subscribe();
        let hints = futures::stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(key) if key == (service_type, bucket_id) => return Some(((), rx)),
                    Ok(_) => continue,
                    // Missed some notifications; a reconcile covers all of them.
                    Err(broadcast::error::RecvError::Lagged(_)) => return Some(((), rx)),
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Some(hints.boxed()))
    }
}
