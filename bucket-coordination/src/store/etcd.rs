use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp, TxnOpResponse, WatchOptions,
};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::store::{BucketStore, MembershipHints};
use crate::types::{now_seconds, BucketId, OwnershipRecord, ServiceType, WorkItem};

#[derive(Debug, Clone)]
pub struct EtcdStoreConfig {
    pub endpoints: Vec<String>,
    /// Key prefix for all operations (e.g., "/buckets/" or "/test-{uuid}/").
    pub prefix: String,
    /// TTL of the session lease that ownership records are attached to.
    pub session_lease_ttl: i64,
    pub keepalive_interval: Duration,
}

impl Default for EtcdStoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:2379".to_string()],
            prefix: "/buckets/".to_string(),
            session_lease_ttl: 30,
            keepalive_interval: Duration::from_secs(10),
        }
    }
}

/// All etcd key patterns used by the store.
enum StoreKey<'a> {
    Item {
        service: ServiceType,
        bucket: BucketId,
        item: &'a WorkItem,
    },
    ItemsPrefix {
        service: ServiceType,
        bucket: BucketId,
    },
    Owner {
        service: ServiceType,
        bucket: BucketId,
    },
}

impl StoreKey<'_> {
    fn resolve(&self, prefix: &str) -> String {
        match self {
            StoreKey::Item {
                service,
                bucket,
                item,
            } => format!(
                "{prefix}{service}/buckets/{bucket}/items/{}/{}",
                item.scope, item.name
            ),
            StoreKey::ItemsPrefix { service, bucket } => {
                format!("{prefix}{service}/buckets/{bucket}/items/")
            }
            StoreKey::Owner { service, bucket } => format!("{prefix}{service}/owners/{bucket}"),
        }
    }
}

/// Validate that a scope or stream name is safe for use in an etcd key path.
///
/// Names are interpolated into key paths; a `/` would let one stream's key
/// alias another's.
pub fn validate_segment(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(Error::InvalidArgument(format!(
            "name must be 1-255 characters, got {}",
            name.len()
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::InvalidArgument(format!(
            "name {name:?} contains invalid characters (only alphanumeric, dash, underscore, dot allowed)"
        )));
    }
    Ok(())
}

/// etcd-backed [`BucketStore`].
///
/// Ownership records are attached to one session lease per store instance. The
/// lease is kept alive in the background; if the process dies the records
/// expire with it and other hosts can claim the buckets.
///
/// `Client` is `Clone` (it wraps an inner `Arc`), so each method clones it.
pub struct EtcdBucketStore {
    client: Client,
    config: EtcdStoreConfig,
    session_lease: Arc<AtomicI64>,
    session_cancel: CancellationToken,
}

impl EtcdBucketStore {
    pub async fn connect(config: EtcdStoreConfig) -> Result<Self> {
        let client = Client::connect(&config.endpoints, None).await?;
        let lease_id = client
            .clone()
            .lease_grant(config.session_lease_ttl, None)
            .await?
            .id();

        let session_lease = Arc::new(AtomicI64::new(lease_id));
        let session_cancel = CancellationToken::new();
        tokio::spawn(run_session(
            client.clone(),
            config.clone(),
            Arc::clone(&session_lease),
            session_cancel.clone(),
        ));

        tracing::info!(lease_id, prefix = %config.prefix, "etcd bucket store session established");

        Ok(Self {
            client,
            config,
            session_lease,
            session_cancel,
        })
    }

    pub fn session_lease(&self) -> i64 {
        self.session_lease.load(Ordering::SeqCst)
    }

    /// Stop the session keepalive and revoke the lease, dropping every
    /// ownership record this store still holds.
    pub async fn close(&self) -> Result<()> {
        self.session_cancel.cancel();
        self.client
            .clone()
            .lease_revoke(self.session_lease())
            .await?;
        Ok(())
    }

    fn key(&self, k: StoreKey<'_>) -> String {
        k.resolve(&self.config.prefix)
    }

    fn item_key(
        &self,
        service: ServiceType,
        bucket: BucketId,
        item: &WorkItem,
    ) -> Result<String> {
        validate_segment(&item.scope)?;
        validate_segment(&item.name)?;
        Ok(self.key(StoreKey::Item {
            service,
            bucket,
            item,
        }))
    }

    async fn get_with_revision<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(T, i64)>> {
        let resp = self.client.clone().get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some((serde_json::from_slice(kv.value())?, kv.mod_revision()))),
            None => Ok(None),
        }
    }

    async fn list_json<T: DeserializeOwned>(&self, prefix: String) -> Result<Vec<T>> {
        let options = GetOptions::new().with_prefix();
        let resp = self.client.clone().get(prefix, Some(options)).await?;
        resp.kvs()
            .iter()
            .map(|kv| serde_json::from_slice(kv.value()).map_err(Error::from))
            .collect()
    }

    /// Point an ownership record this host already holds at the current
    /// session lease, e.g. after a restart with the same host id.
    async fn rebind_claim(&self, key: String, mod_revision: i64, value: Vec<u8>) -> Result<bool> {
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                key.clone(),
                CompareOp::Equal,
                mod_revision,
            )])
            .and_then(vec![TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(self.session_lease())),
            )]);
        let resp = self.client.clone().txn(txn).await?;
        Ok(resp.succeeded())
    }
}

impl Drop for EtcdBucketStore {
    fn drop(&mut self) {
        self.session_cancel.cancel();
    }
}

#[async_trait]
impl BucketStore for EtcdBucketStore {
    async fn add_work_item(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
        item: &WorkItem,
    ) -> Result<()> {
        let key = self.item_key(service_type, bucket_id, item)?;
        let value = serde_json::to_string(item)?;
        self.client.clone().put(key, value, None).await?;
        Ok(())
    }

    async fn remove_work_item(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
        item: &WorkItem,
    ) -> Result<()> {
        let key = self.item_key(service_type, bucket_id, item)?;
        self.client.clone().delete(key, None).await?;
        Ok(())
    }

    async fn list_work_items(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
    ) -> Result<BTreeSet<WorkItem>> {
        let prefix = self.key(StoreKey::ItemsPrefix {
            service: service_type,
            bucket: bucket_id,
        });
        let items: Vec<WorkItem> = self.list_json(prefix).await?;
        Ok(items.into_iter().collect())
    }

    /// CAS: succeed if the owner key does not exist (version == 0), or if it is
    /// already held by `host_id`.
    async fn try_claim(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
        host_id: &str,
    ) -> Result<bool> {
        let key = self.key(StoreKey::Owner {
            service: service_type,
            bucket: bucket_id,
        });
        let lease_id = self.session_lease();
        let record = OwnershipRecord {
            host_id: host_id.to_string(),
            lease_id,
            claimed_at: now_seconds(),
        };
        let value = serde_json::to_vec(&record)?;

        let txn = Txn::new()
            .when(vec![Compare::version(key.clone(), CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key.clone(),
                value.clone(),
                Some(PutOptions::new().with_lease(lease_id)),
            )])
            .or_else(vec![TxnOp::get(key.clone(), None)]);

        let resp = self.client.clone().txn(txn).await?;
        if resp.succeeded() {
            return Ok(true);
        }

        let current = resp.op_responses().into_iter().find_map(|op| match op {
            TxnOpResponse::Get(get) => get
                .kvs()
                .first()
                .map(|kv| (kv.value().to_vec(), kv.mod_revision())),
            _ => None,
        });
        let Some((current_value, mod_revision)) = current else {
            // Deleted between compare and get; the next attempt will settle it.
            return Err(Error::unavailable(format!(
                "ownership of {service_type} bucket {bucket_id} changed during claim"
            )));
        };

        let holder: OwnershipRecord = serde_json::from_slice(&current_value)?;
        if holder.host_id != host_id {
            return Ok(false);
        }
        if holder.lease_id == lease_id {
            return Ok(true);
        }
        self.rebind_claim(key, mod_revision, value).await
    }

    async fn release(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
        host_id: &str,
    ) -> Result<()> {
        let key = self.key(StoreKey::Owner {
            service: service_type,
            bucket: bucket_id,
        });
        let Some((holder, mod_revision)) = self.get_with_revision::<OwnershipRecord>(&key).await?
        else {
            return Ok(());
        };
        if holder.host_id != host_id {
            return Ok(());
        }

        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                key.clone(),
                CompareOp::Equal,
                mod_revision,
            )])
            .and_then(vec![TxnOp::delete(key, None)]);
        self.client.clone().txn(txn).await?;
        Ok(())
    }

    async fn owner(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
    ) -> Result<Option<String>> {
        let key = self.key(StoreKey::Owner {
            service: service_type,
            bucket: bucket_id,
        });
        Ok(self
            .get_with_revision::<OwnershipRecord>(&key)
            .await?
            .map(|(record, _)| record.host_id))
    }

    async fn watch_work_items(
        &self,
        service_type: ServiceType,
        bucket_id: BucketId,
    ) -> Result<Option<MembershipHints>> {
        let prefix = self.key(StoreKey::ItemsPrefix {
            service: service_type,
            bucket: bucket_id,
        });
        let options = WatchOptions::new().with_prefix();
        let stream = self.client.clone().watch(prefix, Some(options)).await?;

        let hints = futures::stream::unfold(stream, |mut stream| async move {
            match stream.message().await {
                Ok(Some(_)) => Some(((), stream)),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "bucket membership watch failed, falling back to polling");
                    None
                }
            }
        });
        Ok(Some(hints.boxed()))
    }
}

/// Keep the session lease alive until cancelled, granting a fresh lease
/// whenever the current one is lost.
async fn run_session(
    client: Client,
    config: EtcdStoreConfig,
    lease: Arc<AtomicI64>,
    cancel: CancellationToken,
) {
    loop {
        let lease_id = lease.load(Ordering::SeqCst);
        match run_lease_keepalive(
            client.clone(),
            lease_id,
            config.keepalive_interval,
            cancel.clone(),
        )
        .await
        {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!(lease_id, error = %e, "session keepalive failed, granting a new lease");
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(config.keepalive_interval) => {}
            }
            match client
                .clone()
                .lease_grant(config.session_lease_ttl, None)
                .await
            {
                Ok(resp) => {
                    lease.store(resp.id(), Ordering::SeqCst);
                    tracing::info!(lease_id = resp.id(), "etcd bucket store session re-established");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to grant session lease");
                }
            }
        }
    }
}

async fn run_lease_keepalive(
    mut client: Client,
    lease_id: i64,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {
                keeper.keep_alive().await?;
                match stream.message().await? {
                    Some(resp) if resp.ttl() > 0 => {}
                    _ => return Err(Error::invalid_state(format!("session lease {lease_id} expired"))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_service_and_bucket() {
        let item = WorkItem::new("scope", "stream");
        let prefix = "/test/";

        assert_eq!(
            StoreKey::Item {
                service: ServiceType::RetentionService,
                bucket: 2,
                item: &item,
            }
            .resolve(prefix),
            "/test/retention/buckets/2/items/scope/stream"
        );
        assert_eq!(
            StoreKey::ItemsPrefix {
                service: ServiceType::WatermarkingService,
                bucket: 0,
            }
            .resolve(prefix),
            "/test/watermarking/buckets/0/items/"
        );
        assert_eq!(
            StoreKey::Owner {
                service: ServiceType::RetentionService,
                bucket: 7,
            }
            .resolve(prefix),
            "/test/retention/owners/7"
        );
    }

    #[test]
    fn bucket_prefixes_do_not_overlap() {
        let one = StoreKey::ItemsPrefix {
            service: ServiceType::RetentionService,
            bucket: 1,
        }
        .resolve("/");
        let ten = StoreKey::ItemsPrefix {
            service: ServiceType::RetentionService,
            bucket: 10,
        }
        .resolve("/");
        assert!(!ten.starts_with(&one));
    }

    #[test]
    fn validate_segment_accepts_stream_names() {
        for name in ["scope", "stream-1", "my_stream", "v1.2", "A-B_C.123"] {
            assert!(validate_segment(name).is_ok(), "should accept: {name}");
        }
    }

    #[test]
    fn validate_segment_rejects_path_traversal() {
        for name in ["", "../../owners", "foo/bar", "hello world"] {
            assert!(
                matches!(validate_segment(name), Err(Error::InvalidArgument(_))),
                "should reject: {name:?}"
            );
        }
        assert!(validate_segment(&"a".repeat(256)).is_err());
    }
}
