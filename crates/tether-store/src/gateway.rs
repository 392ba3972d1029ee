//! The capability surface consumed by the coordination layer

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::model::{
    GetResponse, KeepAliveResponse, LeaseGrant, LeaseId, Revision, WatchOptions, WatchResponse,
};
use crate::txn::{Txn, TxnResponse};

/// Ordered event feed for one watched key or prefix. The stream ends when the
/// store closes the watch; an `Err` item means the watch broke.
pub type WatchStream = BoxStream<'static, Result<WatchResponse>>;

/// Keep-alive answers for one lease. Renewal continues while the stream is
/// held; dropping it stops renewal. The stream ending means the lease expired.
pub type KeepAliveStream = BoxStream<'static, KeepAliveResponse>;

/// A linearizable key-value store with leases, transactions and watches.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    /// Write `value` under `key`, optionally attached to a lease.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<Revision>;

    /// Delete a key, or every key under a prefix. Returns the number deleted.
    async fn delete(&self, key: &str, prefix: bool) -> Result<i64>;

    /// Read a key, or every key under a prefix, ordered by key.
    async fn get(&self, key: &str, prefix: bool) -> Result<GetResponse>;

    /// Commit a conditional transaction atomically.
    async fn txn(&self, txn: Txn) -> Result<TxnResponse>;

    /// Grant a lease with the given TTL in seconds.
    async fn lease_grant(&self, ttl: i64) -> Result<LeaseGrant>;

    /// Start renewing a lease in the background.
    async fn lease_keep_alive(&self, id: LeaseId) -> Result<KeepAliveStream>;

    /// Revoke a lease, deleting every key attached to it.
    async fn lease_revoke(&self, id: LeaseId) -> Result<()>;

    /// Watch a key or prefix.
    async fn watch(&self, key: &str, options: WatchOptions) -> Result<WatchStream>;
}
