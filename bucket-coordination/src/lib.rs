//! Sharded background scheduling: a fixed number of buckets per service type,
//! exclusive per-host bucket ownership through a store lease, and one worker per
//! owned bucket that keeps its work items in sync with the store and runs a
//! periodic action over them.

pub mod action;
pub mod config;
pub mod error;
pub mod factory;
pub mod hash;
pub mod manager;
pub mod metrics_consts;
pub mod retry;
pub mod store;
pub mod types;
pub mod worker;

pub use action::{action_fn, BucketAction};
pub use config::BucketServiceConfig;
pub use error::{Error, Result};
pub use factory::BucketServiceFactory;
pub use manager::{BucketOwnershipManager, ManagerState};
pub use retry::RetryPolicy;
pub use store::{BucketStore, EtcdBucketStore, EtcdStoreConfig, MemoryBucketStore};
pub use types::{BucketId, OwnershipRecord, ServiceType, WorkItem};
pub use worker::{BucketWorker, ItemFailure, TickReport, WorkerState};
