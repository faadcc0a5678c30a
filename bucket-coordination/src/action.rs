use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::WorkItem;

/// The domain operation run for every known work item on every tick, e.g.
/// enforcing the retention policy of one stream.
///
/// Failures are opaque to the bucket engine: they are logged and counted for
/// the item, and never stop the tick or the worker.
#[async_trait]
pub trait BucketAction: Send + Sync {
    async fn apply(&self, item: &WorkItem) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`BucketAction`].
pub struct FnAction<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> BucketAction for FnAction<F, Fut>
where
    F: Fn(WorkItem) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn apply(&self, item: &WorkItem) -> anyhow::Result<()> {
        (self.f)(item.clone()).await
    }
}

/// Bind a closure as the per-item action of a bucket service.
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn BucketAction>
where
    F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnAction {
        f,
        _fut: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn closure_action_receives_item() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        let action = action_fn(move |item: WorkItem| {
            let recorded = Arc::clone(&recorded);
            async move {
                recorded.lock().unwrap().push(item);
                Ok(())
            }
        });

        action.apply(&WorkItem::new("scope", "stream")).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![WorkItem::new("scope", "stream")]
        );
    }

    #[tokio::test]
    async fn closure_action_surfaces_errors() {
        let action = action_fn(|item: WorkItem| async move {
            anyhow::bail!("retention failed for {item}")
        });

        let err = action
            .apply(&WorkItem::new("scope", "stream"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "retention failed for scope/stream");
    }
}
