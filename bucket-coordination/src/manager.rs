use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::{join_all, BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::action::BucketAction;
use crate::config::BucketServiceConfig;
use crate::error::{Error, Result};
use crate::metrics_consts::{OWNED_BUCKETS, OWNERSHIP_CLAIMS, OWNERSHIP_LOST, WORKER_RESTARTS};
use crate::retry;
use crate::store::BucketStore;
use crate::types::{validate_bucket, BucketId, ServiceType};
use crate::worker::{BucketWorker, WorkerContext};

/// Store calls issued at once by the claim pass and the ownership sweep.
const SWEEP_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    New,
    /// Running the initial claim pass.
    Starting,
    Running,
    Stopping,
    Terminated,
}

/// Claims buckets of one service type for the local host and supervises one
/// [`BucketWorker`] per owned bucket.
///
/// Cloning is cheap; clones share the same manager.
#[derive(Clone)]
pub struct BucketOwnershipManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: BucketServiceConfig,
    ctx: Arc<WorkerContext>,
    workers: RwLock<HashMap<BucketId, Arc<BucketWorker>>>,
    state: watch::Sender<ManagerState>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for BucketOwnershipManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketOwnershipManager")
            .field("service_type", &self.inner.config.service_type)
            .field("bucket_count", &self.inner.config.bucket_count)
            .field("host_id", &self.inner.config.host_id)
            .field("state", &self.state())
            .finish()
    }
}

impl BucketOwnershipManager {
    pub fn new(
        config: BucketServiceConfig,
        store: Arc<dyn BucketStore>,
        action: Arc<dyn BucketAction>,
    ) -> Result<Self> {
        config.validate()?;
        let ctx = Arc::new(WorkerContext::new(&config, store, action));
        let (state, _) = watch::channel(ManagerState::New);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                ctx,
                workers: RwLock::new(HashMap::new()),
                state,
                cancel: CancellationToken::new(),
                supervisor: Mutex::new(None),
            }),
        })
    }

    pub fn service_type(&self) -> ServiceType {
        self.inner.config.service_type
    }

    pub fn bucket_count(&self) -> u32 {
        self.inner.config.bucket_count
    }

    pub fn host_id(&self) -> &str {
        &self.inner.config.host_id
    }

    pub fn state(&self) -> ManagerState {
        *self.inner.state.borrow()
    }

    /// Begin claiming every configured bucket. Returns immediately; use
    /// [`await_running`](Self::await_running) to wait for the claim pass.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let started = inner.state.send_if_modified(|state| {
            if *state == ManagerState::New {
                *state = ManagerState::Starting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(Error::invalid_state(format!(
                "cannot start {} bucket service in state {:?}",
                inner.config.service_type,
                self.state()
            )));
        }

        tracing::info!(
            service = %inner.config.service_type,
            host = %inner.config.host_id,
            bucket_count = inner.config.bucket_count,
            "starting bucket service"
        );

        let handle = tokio::spawn(self.clone().supervise());
        *inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Wait until the initial claim pass has settled. Fails if the manager
    /// stops before it ever runs.
    pub async fn await_running(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, ManagerState::New | ManagerState::Starting))
            .await
            .map(|state| *state)
            .map_err(|_| Error::invalid_state("bucket service state channel closed"))?;

        match state {
            ManagerState::Running => Ok(()),
            other => Err(Error::invalid_state(format!(
                "bucket service is {other:?}, not running"
            ))),
        }
    }

    /// Stop every worker, then release every lease held by this host.
    /// Idempotent. Must be called from within a Tokio runtime.
    pub fn stop(&self) {
        let inner = &self.inner;
        let mut stopping = false;
        inner.state.send_if_modified(|state| match state {
            ManagerState::Stopping | ManagerState::Terminated => false,
            _ => {
                *state = ManagerState::Stopping;
                stopping = true;
                true
            }
        });
        if !stopping {
            return;
        }

        tracing::info!(
            service = %inner.config.service_type,
            host = %inner.config.host_id,
            "stopping bucket service"
        );
        inner.cancel.cancel();
        tokio::spawn(self.clone().shutdown());
    }

    pub async fn await_terminated(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender is owned by `self`, so this only returns once terminated.
        rx.wait_for(|state| *state == ManagerState::Terminated)
            .await
            .ok();
    }

    /// Claim `bucket_id` on behalf of `host_id`.
    ///
    /// An out-of-range bucket fails here, before anything is sent to the store.
    /// The returned future resolves `false` when another host holds the bucket.
    /// When `host_id` is the local host, a successful claim also starts the
    /// bucket's worker unless one is already running.
    pub fn take_bucket_ownership(
        &self,
        bucket_id: BucketId,
        host_id: &str,
    ) -> Result<BoxFuture<'static, Result<bool>>> {
        validate_bucket(bucket_id, self.inner.config.bucket_count)?;

        let manager = self.clone();
        let host_id = host_id.to_string();
        Ok(async move { manager.claim(bucket_id, &host_id).await }.boxed())
    }

    /// Claim `bucket_id` for the local host, retrying transient store failures.
    /// Losing to another host is a normal outcome and yields `Ok(())`.
    pub async fn try_take_ownership(&self, bucket_id: BucketId) -> Result<()> {
        validate_bucket(bucket_id, self.inner.config.bucket_count)?;

        if !self.claim_with_retry(bucket_id).await? {
            tracing::debug!(
                service = %self.inner.config.service_type,
                bucket = bucket_id,
                "bucket owned by another host"
            );
        }
        Ok(())
    }

    /// Snapshot of the workers for buckets this host currently owns and runs.
    pub fn bucket_services(&self) -> HashMap<BucketId, Arc<BucketWorker>> {
        self.read_workers()
            .iter()
            .filter(|(_, worker)| is_live(worker))
            .map(|(bucket_id, worker)| (*bucket_id, Arc::clone(worker)))
            .collect()
    }

    /// Number of buckets with a live worker, as reported by the owned-buckets gauge.
    pub fn owned_bucket_count(&self) -> usize {
        count_live(&self.read_workers())
    }

    async fn claim_with_retry(&self, bucket_id: BucketId) -> Result<bool> {
        let inner = &self.inner;
        let host_id = inner.config.host_id.as_str();
        retry::retry_with_backoff(&inner.config.retry, "try_claim", &inner.cancel, || {
            self.claim(bucket_id, host_id)
        })
        .await
    }

    async fn claim(&self, bucket_id: BucketId, host_id: &str) -> Result<bool> {
        let inner = &self.inner;
        let service_type = inner.config.service_type;

        let claimed = inner
            .ctx
            .store
            .try_claim(service_type, bucket_id, host_id)
            .await?;

        let outcome = if claimed { "claimed" } else { "contended" };
        metrics::counter!(OWNERSHIP_CLAIMS, "service" => service_type.as_str(), "outcome" => outcome)
            .increment(1);

        if !claimed {
            tracing::debug!(
                service = %service_type,
                bucket = bucket_id,
                host = host_id,
                "bucket claim lost to another host"
            );
            return Ok(false);
        }

        if host_id == inner.config.host_id {
            if let Err(e) = self.ensure_worker(bucket_id) {
                // The shutdown path has already collected the buckets it will
                // release, so this claim has to be given back here.
                if let Err(release_err) = inner
                    .ctx
                    .store
                    .release(service_type, bucket_id, host_id)
                    .await
                {
                    tracing::warn!(
                        service = %service_type,
                        bucket = bucket_id,
                        error = %release_err,
                        "failed to release bucket claimed during shutdown"
                    );
                }
                return Err(e);
            }
        }
        Ok(true)
    }

    fn ensure_worker(&self, bucket_id: BucketId) -> Result<Arc<BucketWorker>> {
        let inner = &self.inner;
        let mut workers = self.write_workers();
        if inner.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        if let Some(existing) = workers.get(&bucket_id) {
            if is_live(existing) {
                return Ok(Arc::clone(existing));
            }
        }

        let worker = BucketWorker::spawn(
            Arc::clone(&inner.ctx),
            bucket_id,
            inner.cancel.child_token(),
        );
        workers.insert(bucket_id, Arc::clone(&worker));
        let owned = count_live(&workers);
        drop(workers);

        self.record_owned(owned);
        tracing::info!(
            service = %inner.config.service_type,
            bucket = bucket_id,
            host = %inner.config.host_id,
            "bucket claimed, worker started"
        );
        Ok(worker)
    }

    fn remove_worker(&self, bucket_id: BucketId, worker: &Arc<BucketWorker>) {
        let mut workers = self.write_workers();
        if workers
            .get(&bucket_id)
            .is_some_and(|current| Arc::ptr_eq(current, worker))
        {
            workers.remove(&bucket_id);
        }
        let owned = count_live(&workers);
        drop(workers);
        self.record_owned(owned);
    }

    fn record_owned(&self, owned: usize) {
        metrics::gauge!(OWNED_BUCKETS, "service" => self.inner.config.service_type.as_str())
            .set(owned as f64);
    }

    fn read_workers(&self) -> RwLockReadGuard<'_, HashMap<BucketId, Arc<BucketWorker>>> {
        self.inner
            .workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_workers(&self) -> RwLockWriteGuard<'_, HashMap<BucketId, Arc<BucketWorker>>> {
        self.inner
            .workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn supervise(self) {
        let inner = &self.inner;
        let service_type = inner.config.service_type;

        let manager = &self;
        let failed: Vec<(BucketId, Error)> = stream::iter(0..inner.config.bucket_count)
            .map(|bucket_id| async move { (bucket_id, manager.try_take_ownership(bucket_id).await) })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .filter_map(|(bucket_id, result)| async move {
                match result {
                    Ok(()) | Err(Error::Cancelled) | Err(Error::ShuttingDown) => None,
                    Err(e) => Some((bucket_id, e)),
                }
            })
            .collect()
            .await;

        for (bucket_id, e) in &failed {
            tracing::warn!(
                service = %service_type,
                bucket = bucket_id,
                error = %e,
                "initial bucket claim failed, will retry on next sweep"
            );
        }

        let running = inner.state.send_if_modified(|state| {
            if *state == ManagerState::Starting {
                *state = ManagerState::Running;
                true
            } else {
                false
            }
        });
        if !running {
            return;
        }
        tracing::info!(
            service = %service_type,
            host = %inner.config.host_id,
            owned = self.owned_bucket_count(),
            "bucket service running"
        );

        let interval = inner.config.ownership_check_interval;
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let result =
            retry::loop_with_delay(|| true, || self.sweep(), interval, &inner.cancel).await;
        match result {
            Ok(()) | Err(Error::Cancelled) => {}
            Err(e) => tracing::error!(
                service = %service_type,
                error = %e,
                "ownership sweep stopped unexpectedly"
            ),
        }
    }

    /// One failover pass over every bucket: restart crashed workers, stop
    /// workers whose lease moved to another host and pick up free buckets.
    async fn sweep(&self) -> Result<()> {
        stream::iter(0..self.inner.config.bucket_count)
            .for_each_concurrent(SWEEP_CONCURRENCY, |bucket_id| self.sweep_bucket(bucket_id))
            .await;
        Ok(())
    }

    async fn sweep_bucket(&self, bucket_id: BucketId) {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return;
        }
        let service_type = inner.config.service_type;
        let worker = self.read_workers().get(&bucket_id).cloned();

        match worker {
            Some(worker) if worker.state().is_terminal() => {
                tracing::warn!(
                    service = %service_type,
                    bucket = bucket_id,
                    state = ?worker.state(),
                    "bucket worker terminated unexpectedly, restarting"
                );
                metrics::counter!(WORKER_RESTARTS, "service" => service_type.as_str())
                    .increment(1);
                self.remove_worker(bucket_id, &worker);
                self.reclaim(bucket_id).await;
            }
            Some(worker) => {
                let owner = retry::retry_with_backoff(
                    &inner.config.retry,
                    "owner",
                    &inner.cancel,
                    || inner.ctx.store.owner(service_type, bucket_id),
                )
                .await;

                match owner {
                    Ok(Some(owner)) if owner == inner.config.host_id => {}
                    Ok(Some(owner)) => {
                        tracing::info!(
                            service = %service_type,
                            bucket = bucket_id,
                            owner = %owner,
                            "bucket taken over by another host"
                        );
                        self.drop_worker(bucket_id, &worker).await;
                    }
                    Ok(None) => {
                        // Lease lapsed with nobody else holding it yet; keep
                        // the worker if the bucket can be claimed back.
                        tracing::info!(
                            service = %service_type,
                            bucket = bucket_id,
                            "bucket lease lapsed, re-claiming"
                        );
                        match self.claim_with_retry(bucket_id).await {
                            Ok(true) | Err(Error::Cancelled) | Err(Error::ShuttingDown) => {}
                            Ok(false) => self.drop_worker(bucket_id, &worker).await,
                            Err(e) => tracing::warn!(
                                service = %service_type,
                                bucket = bucket_id,
                                error = %e,
                                "failed to re-claim lapsed bucket"
                            ),
                        }
                    }
                    Err(Error::Cancelled) => {}
                    Err(e) => tracing::warn!(
                        service = %service_type,
                        bucket = bucket_id,
                        error = %e,
                        "bucket ownership check failed"
                    ),
                }
            }
            None => self.reclaim(bucket_id).await,
        }
    }

    async fn drop_worker(&self, bucket_id: BucketId, worker: &Arc<BucketWorker>) {
        tracing::info!(
            service = %self.inner.config.service_type,
            bucket = bucket_id,
            "lost bucket ownership, stopping worker"
        );
        metrics::counter!(OWNERSHIP_LOST, "service" => self.inner.config.service_type.as_str())
            .increment(1);
        worker.stop();
        worker.await_terminated().await;
        self.remove_worker(bucket_id, worker);
    }

    async fn reclaim(&self, bucket_id: BucketId) {
        match self.try_take_ownership(bucket_id).await {
            Ok(()) | Err(Error::Cancelled) | Err(Error::ShuttingDown) => {}
            Err(e) => tracing::warn!(
                service = %self.inner.config.service_type,
                bucket = bucket_id,
                error = %e,
                "bucket claim failed, will retry on next sweep"
            ),
        }
    }

    async fn shutdown(self) {
        let inner = &self.inner;
        let service_type = inner.config.service_type;

        let supervisor = inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                tracing::error!(service = %service_type, error = %e, "bucket supervisor panicked");
            }
        }

        let workers: Vec<(BucketId, Arc<BucketWorker>)> = self.write_workers().drain().collect();
        for (_, worker) in &workers {
            worker.stop();
        }
        join_all(workers.iter().map(|(_, worker)| worker.await_terminated())).await;

        // Every bucket, not only those with a worker: a bucket whose worker
        // failed may still be held by this host while its re-claim is pending.
        // Release is a no-op for buckets held elsewhere or by nobody.
        let release_cancel = CancellationToken::new();
        let host_id = inner.config.host_id.as_str();
        let release_cancel = &release_cancel;
        let failed_releases: Vec<(BucketId, Error)> = stream::iter(0..inner.config.bucket_count)
            .map(|bucket_id| async move {
                let released = retry::retry_with_backoff(
                    &inner.config.retry,
                    "release",
                    release_cancel,
                    || inner.ctx.store.release(service_type, bucket_id, host_id),
                )
                .await;
                (bucket_id, released)
            })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .filter_map(|(bucket_id, released)| async move { released.err().map(|e| (bucket_id, e)) })
            .collect()
            .await;
        for (bucket_id, e) in failed_releases {
            tracing::warn!(
                service = %service_type,
                bucket = bucket_id,
                error = %e,
                "failed to release bucket lease"
            );
        }

        self.record_owned(0);
        inner.state.send_replace(ManagerState::Terminated);
        tracing::info!(
            service = %service_type,
            host = %host_id,
            stopped_workers = workers.len(),
            "bucket service terminated"
        );
    }
}

fn is_live(worker: &BucketWorker) -> bool {
    !worker.state().is_terminal() && !worker.is_stop_requested()
}

fn count_live(workers: &HashMap<BucketId, Arc<BucketWorker>>) -> usize {
    workers.values().filter(|worker| is_live(worker)).count()
}
