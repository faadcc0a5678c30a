use std::collections::BTreeMap;
use std::future::ready;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use bucket_coordination::{BucketId, BucketOwnershipManager, ManagerState};
use metrics_exporter_prometheus::PrometheusHandle;

#[derive(Clone)]
pub struct AppState {
    managers: Arc<Vec<BucketOwnershipManager>>,
}

impl AppState {
    pub fn new(managers: Vec<BucketOwnershipManager>) -> Self {
        Self {
            managers: Arc::new(managers),
        }
    }
}

pub fn router(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(liveness))
        .route("/buckets", get(buckets))
        .with_state(state);

    match metrics {
        Some(handle) => router.route("/metrics", get(move || ready(handle.render()))),
        None => router,
    }
}

pub async fn index() -> &'static str {
    "bucket scheduler"
}

pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    let ready = state
        .managers
        .iter()
        .all(|manager| manager.state() == ManagerState::Running);
    if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Work items known to each locally owned bucket, per service.
pub async fn buckets(
    State(state): State<AppState>,
) -> Json<BTreeMap<String, BTreeMap<BucketId, Vec<String>>>> {
    let listing = state
        .managers
        .iter()
        .map(|manager| {
            let owned = manager
                .bucket_services()
                .into_iter()
                .map(|(bucket_id, worker)| {
                    let items = worker
                        .known_items()
                        .iter()
                        .map(|item| item.scoped_name())
                        .collect();
                    (bucket_id, items)
                })
                .collect();
            (manager.service_type().as_str().to_string(), owned)
        })
        .collect();
    Json(listing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucket_coordination::store::MemoryBucketStore;
    use bucket_coordination::{action_fn, BucketServiceFactory, WorkItem};
    use std::time::Duration;

    fn manager() -> BucketOwnershipManager {
        BucketServiceFactory::new("scheduler-0", Arc::new(MemoryBucketStore::new()))
            .create_retention_service(
                2,
                Duration::from_secs(60),
                action_fn(|_item: WorkItem| async { Ok(()) }),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn readiness_follows_manager_state() {
        let manager = manager();
        let state = AppState::new(vec![manager.clone()]);
        assert_eq!(
            readiness(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        manager.start().unwrap();
        manager.await_running().await.unwrap();
        assert_eq!(readiness(State(state.clone())).await, StatusCode::OK);

        manager.stop();
        manager.await_terminated().await;
        assert_eq!(
            readiness(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn buckets_lists_owned_buckets_per_service() {
        let manager = manager();
        manager.start().unwrap();
        manager.await_running().await.unwrap();

        let Json(listing) = buckets(State(AppState::new(vec![manager.clone()]))).await;
        let retention = listing.get("retention").unwrap();
        assert_eq!(retention.keys().copied().collect::<Vec<_>>(), vec![0, 1]);

        manager.stop();
        manager.await_terminated().await;
    }
}
