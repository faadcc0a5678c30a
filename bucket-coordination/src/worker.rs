//! Per-bucket worker: keeps the bucket's known work items in sync with the
//! store and runs the bound action over them on a fixed period.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::action::BucketAction;
use crate::config::BucketServiceConfig;
use crate::error::{Error, Result};
use crate::metrics_consts::{
    ACTION_OUTCOMES, KNOWN_ITEMS, MISPLACED_ITEMS, TICKS, TICK_DURATION_MS,
};
use crate::retry::{self, RetryPolicy};
use crate::store::{BucketStore, MembershipHints};
use crate::types::{BucketId, ServiceType, WorkItem};

/// Lifecycle of a [`BucketWorker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    /// Seeding known items from the store.
    Starting,
    /// Converging membership and ticking.
    Running,
    Stopping,
    Stopped,
    /// Terminated by an internal fault rather than a stop request.
    Failed,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub item: WorkItem,
    pub error: String,
    pub panicked: bool,
}

/// Outcome of one pass of the action over a snapshot of known items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<ItemFailure>,
    pub duration: Duration,
}

/// Everything a worker needs from its manager. Shared by all workers of one
/// service type.
pub(crate) struct WorkerContext {
    pub service_type: ServiceType,
    pub bucket_count: u32,
    pub store: Arc<dyn BucketStore>,
    pub action: Arc<dyn BucketAction>,
    pub tick_period: Duration,
    pub convergence_poll_interval: Duration,
    pub graceful_shutdown: Duration,
    pub max_concurrent_actions: usize,
    pub retry: RetryPolicy,
}

impl WorkerContext {
    pub fn new(
        config: &BucketServiceConfig,
        store: Arc<dyn BucketStore>,
        action: Arc<dyn BucketAction>,
    ) -> Self {
        Self {
            service_type: config.service_type,
            bucket_count: config.bucket_count,
            store,
            action,
            tick_period: config.tick_period,
            convergence_poll_interval: config.convergence_poll_interval,
            graceful_shutdown: config.graceful_shutdown,
            max_concurrent_actions: config.max_concurrent_actions,
            retry: config.retry.clone(),
        }
    }
}

/// Runs one owned bucket. Created by the manager after a successful claim and
/// stopped when ownership is lost or the manager shuts down.
///
/// Two activities run concurrently while the worker is up:
/// - convergence re-reads the bucket's membership from the store on every poll
///   interval (or earlier, on a store hint) and replaces the known items with it;
/// - ticks run the action once per known item, strictly one tick at a time.
pub struct BucketWorker {
    ctx: Arc<WorkerContext>,
    bucket_id: BucketId,
    known_items: RwLock<BTreeSet<WorkItem>>,
    state: watch::Sender<WorkerState>,
    cancel: CancellationToken,
    ticks_completed: AtomicU64,
    last_tick: Mutex<Option<TickReport>>,
}

impl fmt::Debug for BucketWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketWorker")
            .field("service_type", &self.ctx.service_type)
            .field("bucket_id", &self.bucket_id)
            .field("state", &self.state())
            .finish()
    }
}

impl BucketWorker {
    pub(crate) fn new(
        ctx: Arc<WorkerContext>,
        bucket_id: BucketId,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(WorkerState::Created);
        Arc::new(Self {
            ctx,
            bucket_id,
            known_items: RwLock::new(BTreeSet::new()),
            state,
            cancel,
            ticks_completed: AtomicU64::new(0),
            last_tick: Mutex::new(None),
        })
    }

    /// Create a worker and start it on the current runtime.
    pub(crate) fn spawn(
        ctx: Arc<WorkerContext>,
        bucket_id: BucketId,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let worker = Self::new(ctx, bucket_id, cancel);
        tokio::spawn(Arc::clone(&worker).run());
        worker
    }

    pub fn bucket_id(&self) -> BucketId {
        self.bucket_id
    }

    pub fn service_type(&self) -> ServiceType {
        self.ctx.service_type
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Point-in-time copy of the work items this worker currently runs.
    pub fn known_items(&self) -> BTreeSet<WorkItem> {
        self.known_items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn ticks_completed(&self) -> u64 {
        self.ticks_completed.load(Ordering::SeqCst)
    }

    pub fn last_tick_report(&self) -> Option<TickReport> {
        self.last_tick
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Request a stop. Convergence is cancelled right away; a tick in flight
    /// finishes, but no further tick starts.
    pub fn stop(&self) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == WorkerState::Stopping {
                false
            } else {
                *state = WorkerState::Stopping;
                true
            }
        });
        self.cancel.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the worker has finished seeding, or has terminated.
    pub async fn await_running(&self) -> WorkerState {
        self.wait_for(|state| *state == WorkerState::Running || state.is_terminal())
            .await
    }

    /// Wait until the worker has stopped or failed.
    pub async fn await_terminated(&self) -> WorkerState {
        self.wait_for(WorkerState::is_terminal).await
    }

    async fn wait_for(&self, condition: impl FnMut(&WorkerState) -> bool) -> WorkerState {
        let mut rx = self.state.subscribe();
        let reached = rx.wait_for(condition).await.map(|state| *state);
        // The sender lives as long as `self`, so the channel cannot close here.
        reached.unwrap_or_else(|_| self.state())
    }

    fn transition(&self, from: WorkerState, to: WorkerState) {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
    }

    async fn run(self: Arc<Self>) {
        let result = self.run_inner().await;

        let final_state = match result {
            Ok(()) | Err(Error::Cancelled) => WorkerState::Stopped,
            Err(e) => {
                tracing::error!(
                    service = %self.ctx.service_type,
                    bucket = self.bucket_id,
                    error = %e,
                    "bucket worker failed"
                );
                WorkerState::Failed
            }
        };
        self.state.send_replace(final_state);

        tracing::info!(
            service = %self.ctx.service_type,
            bucket = self.bucket_id,
            state = ?final_state,
            "bucket worker terminated"
        );
    }

    async fn run_inner(self: &Arc<Self>) -> Result<()> {
        self.transition(WorkerState::Created, WorkerState::Starting);

        let ctx = &self.ctx;
        let initial = retry::retry_with_backoff(&ctx.retry, "list_work_items", &self.cancel, || {
            ctx.store.list_work_items(ctx.service_type, self.bucket_id)
        })
        .await?;
        self.reconcile(initial);

        self.transition(WorkerState::Starting, WorkerState::Running);
        tracing::info!(
            service = %ctx.service_type,
            bucket = self.bucket_id,
            known_items = self.known_items().len(),
            "bucket worker running"
        );

        // Loops get their own token so a fault in one also stops the other
        // without being mistaken for a stop request.
        let loops = self.cancel.child_token();
        let mut tasks = JoinSet::new();
        tasks.spawn(Arc::clone(self).convergence_loop(loops.clone()));
        tasks.spawn(Arc::clone(self).tick_loop(loops.clone()));

        let mut fault = match tasks.join_next().await {
            Some(Ok(Ok(()))) | None => None,
            Some(Ok(Err(e))) => Some(e),
            Some(Err(e)) => Some(Error::invalid_state(format!("worker task panicked: {e}"))),
        };
        loops.cancel();

        let drained = tokio::time::timeout(ctx.graceful_shutdown, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        fault.get_or_insert(e);
                    }
                    Err(e) => {
                        fault.get_or_insert(Error::invalid_state(format!(
                            "worker task panicked: {e}"
                        )));
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                service = %ctx.service_type,
                bucket = self.bucket_id,
                timeout_ms = ctx.graceful_shutdown.as_millis() as u64,
                "in-flight tick did not finish in time, aborting it"
            );
            tasks.shutdown().await;
        }

        match fault {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Re-read membership whenever the poll interval elapses or the store hints
    /// at a change. The store is the ground truth: every read replaces the
    /// known items wholesale, so missed or duplicated hints are harmless.
    async fn convergence_loop(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let ctx = &self.ctx;
        let mut hints = match ctx
            .store
            .watch_work_items(ctx.service_type, self.bucket_id)
            .await
        {
            Ok(hints) => hints,
            Err(e) => {
                tracing::warn!(
                    service = %ctx.service_type,
                    bucket = self.bucket_id,
                    error = %e,
                    "membership watch unavailable, polling only"
                );
                None
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(ctx.convergence_poll_interval) => {}
                _ = next_hint(&mut hints) => {}
            }

            let fresh = retry::retry_with_backoff(&ctx.retry, "list_work_items", &cancel, || {
                ctx.store.list_work_items(ctx.service_type, self.bucket_id)
            })
            .await;

            match fresh {
                Ok(items) => {
                    self.reconcile(items);
                }
                Err(Error::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    async fn tick_loop(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let result = retry::loop_with_delay(
            || true,
            || {
                let worker = Arc::clone(&self);
                async move {
                    let report = worker.run_tick().await;
                    worker.record_tick(report);
                    Ok(())
                }
            },
            self.ctx.tick_period,
            &cancel,
        )
        .await;

        match result {
            Err(Error::Cancelled) => Ok(()),
            other => other,
        }
    }

    /// Replace the known items with the store's view, keeping only items that
    /// map to this bucket. Returns the number of items added and removed.
    pub(crate) fn reconcile(&self, fresh: BTreeSet<WorkItem>) -> (usize, usize) {
        let ctx = &self.ctx;
        let (accepted, misplaced): (BTreeSet<WorkItem>, BTreeSet<WorkItem>) = fresh
            .into_iter()
            .partition(|item| item.bucket(ctx.bucket_count).ok() == Some(self.bucket_id));

        for item in &misplaced {
            tracing::warn!(
                service = %ctx.service_type,
                bucket = self.bucket_id,
                item = %item,
                "ignoring work item that maps to another bucket"
            );
        }
        if !misplaced.is_empty() {
            metrics::counter!(MISPLACED_ITEMS, "service" => ctx.service_type.as_str())
                .increment(misplaced.len() as u64);
        }

        let mut known = self
            .known_items
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let added = accepted.difference(&known).count();
        let removed = known.difference(&accepted).count();
        *known = accepted;
        let total = known.len();
        drop(known);

        if added > 0 || removed > 0 {
            tracing::debug!(
                service = %ctx.service_type,
                bucket = self.bucket_id,
                added,
                removed,
                total,
                "reconciled known work items"
            );
        }
        metrics::gauge!(
            KNOWN_ITEMS,
            "service" => ctx.service_type.as_str(),
            "bucket" => self.bucket_id.to_string()
        )
        .set(total as f64);

        (added, removed)
    }

    /// Run the action once for every item of a snapshot of the known items.
    /// Items added after the snapshot are picked up by the next tick.
    pub(crate) async fn run_tick(&self) -> TickReport {
        let ctx = &self.ctx;
        let snapshot: Vec<WorkItem> = self.known_items().into_iter().collect();
        let attempted = snapshot.len();
        let started = Instant::now();

        let outcomes: Vec<(WorkItem, std::result::Result<(), (String, bool)>)> =
            stream::iter(snapshot)
                .map(|item| {
                    let action = Arc::clone(&ctx.action);
                    async move {
                        let outcome = apply_isolated(action.as_ref(), &item).await;
                        (item, outcome)
                    }
                })
                .buffer_unordered(ctx.max_concurrent_actions.max(1))
                .collect()
                .await;

        let mut report = TickReport {
            attempted,
            ..Default::default()
        };
        for (item, outcome) in outcomes {
            match outcome {
                Ok(()) => report.succeeded += 1,
                Err((error, panicked)) => report.failures.push(ItemFailure {
                    item,
                    error,
                    panicked,
                }),
            }
        }
        report.failures.sort_by(|a, b| a.item.cmp(&b.item));
        report.duration = started.elapsed();
        report
    }

    fn record_tick(&self, report: TickReport) {
        let ctx = &self.ctx;
        let service = ctx.service_type.as_str();

        metrics::counter!(TICKS, "service" => service).increment(1);
        metrics::histogram!(TICK_DURATION_MS, "service" => service)
            .record(report.duration.as_secs_f64() * 1000.0);
        metrics::counter!(ACTION_OUTCOMES, "service" => service, "outcome" => "success")
            .increment(report.succeeded as u64);

        for failure in &report.failures {
            let outcome = if failure.panicked { "panic" } else { "failure" };
            metrics::counter!(ACTION_OUTCOMES, "service" => service, "outcome" => outcome)
                .increment(1);
            tracing::warn!(
                service,
                bucket = self.bucket_id,
                item = %failure.item,
                error = %failure.error,
                "action failed for work item"
            );
        }

        if report.failures.is_empty() {
            tracing::debug!(
                service,
                bucket = self.bucket_id,
                attempted = report.attempted,
                duration_ms = report.duration.as_millis() as u64,
                "tick complete"
            );
        } else {
            tracing::warn!(
                service,
                bucket = self.bucket_id,
                attempted = report.attempted,
                failed = report.failures.len(),
                "tick complete with failures"
            );
        }

        self.ticks_completed.fetch_add(1, Ordering::SeqCst);
        *self
            .last_tick
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(report);
    }
}

/// Per-item error boundary: action errors and panics both become a failure
/// for this item only.
async fn apply_isolated(
    action: &dyn BucketAction,
    item: &WorkItem,
) -> std::result::Result<(), (String, bool)> {
    // The call itself sits inside the boundary: an action may panic before
    // handing back its future.
    match AssertUnwindSafe(async { action.apply(item).await })
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err((format!("{e:#}"), false)),
        Err(panic) => Err((format!("action panicked: {}", panic_message(panic.as_ref())), true)),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Resolves on the next membership hint. Once the hint stream ends it is
/// dropped and this never resolves again, leaving the poll interval in charge.
async fn next_hint(hints: &mut Option<MembershipHints>) {
    if let Some(stream) = hints.as_mut() {
        if stream.next().await.is_some() {
            return;
        }
        tracing::debug!("membership hint stream ended, polling only");
        *hints = None;
    }
    std::future::pending::<()>().await
}
