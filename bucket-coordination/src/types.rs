use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash;

pub type BucketId = u32;

/// A periodic facility with its own independent bucket space and store namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceType {
    RetentionService,
    WatermarkingService,
}

impl ServiceType {
    /// Key segment used to namespace this service's buckets in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::RetentionService => "retention",
            ServiceType::WatermarkingService => "watermarking",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of scheduled work: one stream, identified by its scope and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItem {
    pub scope: String,
    pub name: String,
}

impl WorkItem {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }

    pub fn scoped_name(&self) -> String {
        format!("{}/{}", self.scope, self.name)
    }

    /// The bucket this item belongs to. Every host and every writer of bucket
    /// membership must use this mapping.
    pub fn bucket(&self, bucket_count: u32) -> Result<BucketId> {
        if bucket_count == 0 {
            return Err(Error::InvalidArgument(
                "bucket count must be positive".to_string(),
            ));
        }
        let key = hash::stable_hash(&self.scoped_name());
        Ok(hash::jump_consistent_hash(key, bucket_count))
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.name)
    }
}

/// Current holder of a bucket, as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub host_id: String,
    pub lease_id: i64,
    pub claimed_at: i64,
}

pub fn validate_bucket(bucket_id: BucketId, bucket_count: u32) -> Result<()> {
    if bucket_id >= bucket_count {
        return Err(Error::InvalidBucket {
            bucket_id,
            bucket_count,
        });
    }
    Ok(())
}

pub fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_item_bucket_is_deterministic_and_in_range() {
        let item = WorkItem::new("scope", "stream");
        let bucket = item.bucket(3).unwrap();
        assert!(bucket < 3);
        for _ in 0..10 {
            assert_eq!(item.bucket(3).unwrap(), bucket);
        }
    }

    #[test]
    fn work_item_bucket_rejects_zero_count() {
        let item = WorkItem::new("scope", "stream");
        assert!(matches!(item.bucket(0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn scoped_name_joins_scope_and_name() {
        let item = WorkItem::new("scope", "stream");
        assert_eq!(item.scoped_name(), "scope/stream");
        assert_eq!(item.to_string(), "scope/stream");
    }

    #[test]
    fn validate_bucket_checks_upper_bound() {
        assert!(validate_bucket(0, 3).is_ok());
        assert!(validate_bucket(2, 3).is_ok());
        assert!(matches!(
            validate_bucket(3, 3),
            Err(Error::InvalidBucket {
                bucket_id: 3,
                bucket_count: 3
            })
        ));
        assert!(validate_bucket(0, 0).is_err());
    }

    #[test]
    fn service_types_have_distinct_namespaces() {
        assert_eq!(ServiceType::RetentionService.as_str(), "retention");
        assert_eq!(ServiceType::WatermarkingService.as_str(), "watermarking");
    }

    #[test]
    fn work_items_order_by_scope_then_name() {
        let mut items = vec![
            WorkItem::new("b", "a"),
            WorkItem::new("a", "z"),
            WorkItem::new("a", "b"),
        ];
        items.sort();
        assert_eq!(
            items,
            vec![
                WorkItem::new("a", "b"),
                WorkItem::new("a", "z"),
                WorkItem::new("b", "a"),
            ]
        );
    }
}
