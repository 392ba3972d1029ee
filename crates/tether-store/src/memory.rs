//! In-process store with the gateway's semantics
//!
//! Keeps a global revision, per-key create/mod revisions and versions, leases
//! with attached keys, and a bounded event history so watches can resume from
//! a past revision. Leases expire lazily on every operation, and optionally
//! from a background reaper task.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval};
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::gateway::{KeepAliveStream, StoreGateway, WatchStream};
use crate::model::{
    EventType, GetResponse, KeepAliveResponse, KeyValue, LeaseGrant, LeaseId, Revision,
    WatchEvent, WatchOptions, WatchResponse,
};
use crate::txn::{Txn, TxnOp, TxnOpResponse, TxnResponse};

/// Number of revisions kept for watch replay
const HISTORY_LIMIT: usize = 10_000;
const FIRST_LEASE_ID: LeaseId = 0x7e57_0000_0001;
const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(50);

struct LeaseEntry {
    ttl: i64,
    deadline: Instant,
    keys: HashSet<String>,
    /// Flipped to true when the lease is revoked or expires
    gone: watch::Sender<bool>,
}

struct Watcher {
    key: String,
    options: WatchOptions,
    tx: mpsc::UnboundedSender<Result<WatchResponse>>,
}

impl Watcher {
    fn filter(&self, resp: &WatchResponse) -> Option<WatchResponse> {
        let events: Vec<WatchEvent> = resp
            .events
            .iter()
            .filter(|e| self.options.matches(&self.key, &e.kv.key))
            .cloned()
            .collect();
        if events.is_empty() {
            None
        } else {
            Some(WatchResponse {
                revision: resp.revision,
                events,
            })
        }
    }
}

struct State {
    revision: Revision,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    next_lease_id: LeaseId,
    watchers: Vec<Watcher>,
    history: VecDeque<WatchResponse>,
    /// Highest revision no longer available for replay
    compacted: Revision,
}

impl State {
    fn new() -> Self {
        Self {
            revision: 1,
            kvs: BTreeMap::new(),
            leases: HashMap::new(),
            next_lease_id: FIRST_LEASE_ID,
            watchers: Vec::new(),
            history: VecDeque::new(),
            compacted: 0,
        }
    }

    fn expire_due(&mut self, now: Instant) {
        let due: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            info!(lease = %format_args!("{:x}", id), "Lease expired");
            self.remove_lease(id);
        }
    }

    fn renew(&mut self, id: LeaseId, now: Instant) -> Option<i64> {
        self.expire_due(now);
        let lease = self.leases.get_mut(&id)?;
        lease.deadline = now + ttl_duration(lease.ttl);
        Some(lease.ttl)
    }

    /// Drop a lease and delete its keys in a single revision.
    fn remove_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        lease.gone.send_replace(true);

        let mut keys: Vec<String> = lease.keys.into_iter().collect();
        keys.sort();
        let rev = self.revision + 1;
        let events: Vec<WatchEvent> = keys
            .into_iter()
            .filter(|key| self.kvs.remove(key).is_some())
            .map(|key| delete_event(key, rev))
            .collect();

        if !events.is_empty() {
            self.revision = rev;
            self.publish(WatchResponse {
                revision: rev,
                events,
            });
        }
        true
    }

    fn check_lease(&self, lease: Option<LeaseId>) -> Result<LeaseId> {
        match lease {
            None | Some(0) => Ok(0),
            Some(id) if self.leases.contains_key(&id) => Ok(id),
            Some(id) => Err(StoreError::LeaseNotFound(id)),
        }
    }

    fn put_kv(&mut self, rev: Revision, key: &str, value: &str, lease: LeaseId) -> WatchEvent {
        let previous_lease = self.kvs.get(key).map_or(0, |kv| kv.lease);
        if previous_lease != 0
            && previous_lease != lease
            && let Some(entry) = self.leases.get_mut(&previous_lease)
        {
            entry.keys.remove(key);
        }
        if lease != 0
            && let Some(entry) = self.leases.get_mut(&lease)
        {
            entry.keys.insert(key.to_string());
        }

        let kv = self
            .kvs
            .entry(key.to_string())
            .or_insert_with(|| KeyValue {
                key: key.to_string(),
                create_revision: rev,
                ..Default::default()
            });
        kv.value = value.to_string();
        kv.mod_revision = rev;
        kv.version += 1;
        kv.lease = lease;

        WatchEvent {
            event_type: EventType::Put,
            kv: kv.clone(),
        }
    }

    fn matching_keys(&self, key: &str, prefix: bool) -> Vec<String> {
        if prefix {
            self.kvs
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(k, _)| k.clone())
                .collect()
        } else if self.kvs.contains_key(key) {
            vec![key.to_string()]
        } else {
            Vec::new()
        }
    }

    fn range(&self, key: &str, prefix: bool) -> Vec<KeyValue> {
        self.matching_keys(key, prefix)
            .iter()
            .filter_map(|k| self.kvs.get(k).cloned())
            .collect()
    }

    fn delete_range(&mut self, rev: Revision, key: &str, prefix: bool) -> Vec<WatchEvent> {
        let mut events = Vec::new();
        for k in self.matching_keys(key, prefix) {
            if let Some(kv) = self.kvs.remove(&k) {
                if kv.lease != 0
                    && let Some(entry) = self.leases.get_mut(&kv.lease)
                {
                    entry.keys.remove(&k);
                }
                events.push(delete_event(k, rev));
            }
        }
        events
    }

    fn apply_txn(&mut self, txn: &Txn) -> Result<TxnResponse> {
        let succeeded = txn
            .compare
            .iter()
            .all(|cmp| cmp.evaluate(self.kvs.get(&cmp.key)));
        let ops = if succeeded { &txn.success } else { &txn.failure };

        for op in ops {
            if let TxnOp::Put { lease, .. } = op {
                self.check_lease(*lease)?;
            }
        }

        let next = self.revision + 1;
        let mut events = Vec::new();
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    events.push(self.put_kv(next, key, value, lease.unwrap_or(0)));
                    responses.push(TxnOpResponse::Put { revision: next });
                }
                TxnOp::Get { key, prefix } => {
                    responses.push(TxnOpResponse::Range(self.range(key, *prefix)));
                }
                TxnOp::Delete { key, prefix } => {
                    let deleted = self.delete_range(next, key, *prefix);
                    responses.push(TxnOpResponse::Delete {
                        deleted: deleted.len() as i64,
                    });
                    events.extend(deleted);
                }
            }
        }

        // The revision only moves when something changed.
        let rev = if events.is_empty() {
            self.revision
        } else {
            next
        };
        self.revision = rev;
        if !events.is_empty() {
            self.publish(WatchResponse {
                revision: rev,
                events,
            });
        }

        Ok(TxnResponse {
            succeeded,
            revision: rev,
            responses,
        })
    }

    fn publish(&mut self, resp: WatchResponse) {
        self.watchers.retain(|watcher| match watcher.filter(&resp) {
            Some(filtered) => watcher.tx.send(Ok(filtered)).is_ok(),
            None => !watcher.tx.is_closed(),
        });

        self.history.push_back(resp);
        while self.history.len() > HISTORY_LIMIT {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.revision;
            }
        }
    }

    fn open_watch(
        &mut self,
        key: &str,
        options: WatchOptions,
    ) -> Result<mpsc::UnboundedReceiver<Result<WatchResponse>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Watcher {
            key: key.to_string(),
            options,
            tx,
        };

        if let Some(start) = options.start_revision.filter(|rev| *rev > 0) {
            if start <= self.compacted {
                return Err(StoreError::Compacted {
                    requested: start,
                    compacted: self.compacted,
                });
            }
            for past in self.history.iter().filter(|r| r.revision >= start) {
                if let Some(filtered) = watcher.filter(past) {
                    let _ = watcher.tx.send(Ok(filtered));
                }
            }
        }

        self.watchers.push(watcher);
        Ok(rx)
    }
}

fn delete_event(key: String, rev: Revision) -> WatchEvent {
    WatchEvent {
        event_type: EventType::Delete,
        kv: KeyValue {
            key,
            mod_revision: rev,
            ..Default::default()
        },
    }
}

fn ttl_duration(ttl: i64) -> Duration {
    Duration::from_secs(ttl.max(1) as u64)
}

fn keepalive_interval(ttl: i64) -> Duration {
    (ttl_duration(ttl) / 3).max(MIN_KEEPALIVE_INTERVAL)
}

/// In-memory implementation of [`StoreGateway`].
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    reaper: Option<JoinHandle<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new())),
            reaper: None,
        }
    }

    /// Expire leases from a background task so watchers see lease-bound keys
    /// disappear without further traffic. Must be called inside a runtime.
    pub fn with_reaper(mut self, period: Duration) -> Self {
        let state = self.state.clone();
        self.reaper = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                state.lock().expire_due(Instant::now());
            }
        }));
        self
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock();
        state.expire_due(Instant::now());
        f(&mut state)
    }

    /// Current store revision.
    pub fn revision(&self) -> Revision {
        self.with_state(|state| state.revision)
    }

    /// Granted TTL of a live lease.
    pub fn lease_ttl(&self, id: LeaseId) -> Option<i64> {
        self.with_state(|state| state.leases.get(&id).map(|lease| lease.ttl))
    }

    /// Forcibly expire a lease as if its keep-alive had starved past the TTL.
    pub fn expire_lease(&self, id: LeaseId) -> bool {
        self.with_state(|state| state.remove_lease(id))
    }

    /// End every open watch stream, as a backend restart would.
    pub fn close_watches(&self) -> usize {
        self.with_state(|state| {
            let closed = state.watchers.len();
            state.watchers.clear();
            closed
        })
    }

    pub fn watcher_count(&self) -> usize {
        self.with_state(|state| {
            state.watchers.retain(|w| !w.tx.is_closed());
            state.watchers.len()
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
    }
}

#[async_trait]
impl StoreGateway for MemoryStore {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<Revision> {
        self.with_state(|state| {
            let lease = state.check_lease(lease)?;
            let rev = state.revision + 1;
            let event = state.put_kv(rev, key, value, lease);
            state.revision = rev;
            state.publish(WatchResponse {
                revision: rev,
                events: vec![event],
            });
            Ok(rev)
        })
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<i64> {
        self.with_state(|state| {
            let rev = state.revision + 1;
            let events = state.delete_range(rev, key, prefix);
            let deleted = events.len() as i64;
            if !events.is_empty() {
                state.revision = rev;
                state.publish(WatchResponse {
                    revision: rev,
                    events,
                });
            }
            Ok(deleted)
        })
    }

    async fn get(&self, key: &str, prefix: bool) -> Result<GetResponse> {
        self.with_state(|state| {
            Ok(GetResponse {
                revision: state.revision,
                kvs: state.range(key, prefix),
            })
        })
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        self.with_state(|state| state.apply_txn(&txn))
    }

    async fn lease_grant(&self, ttl: i64) -> Result<LeaseGrant> {
        if ttl <= 0 {
            return Err(StoreError::InvalidTtl(ttl));
        }
        self.with_state(|state| {
            let id = state.next_lease_id;
            state.next_lease_id += 1;
            let (gone, _) = watch::channel(false);
            state.leases.insert(
                id,
                LeaseEntry {
                    ttl,
                    deadline: Instant::now() + ttl_duration(ttl),
                    keys: HashSet::new(),
                    gone,
                },
            );
            debug!(lease = %format_args!("{:x}", id), ttl, "Lease granted");
            Ok(LeaseGrant { id, ttl })
        })
    }

    async fn lease_keep_alive(&self, id: LeaseId) -> Result<KeepAliveStream> {
        let (ttl, mut gone) = self.with_state(|state| {
            state
                .leases
                .get(&id)
                .map(|lease| (lease.ttl, lease.gone.subscribe()))
                .ok_or(StoreError::LeaseNotFound(id))
        })?;

        let (tx, rx) = mpsc::channel(16);
        let state = self.state.clone();
        let period = keepalive_interval(ttl);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let renewed = state.lock().renew(id, Instant::now());
                        match renewed {
                            Some(ttl) => {
                                if tx.send(KeepAliveResponse { id, ttl }).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = gone.changed() => break,
                    _ = tx.closed() => break,
                }
            }
            debug!(lease = %format_args!("{:x}", id), "Keep-alive loop stopped");
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn lease_revoke(&self, id: LeaseId) -> Result<()> {
        self.with_state(|state| {
            if state.remove_lease(id) {
                Ok(())
            } else {
                Err(StoreError::LeaseNotFound(id))
            }
        })
    }

    async fn watch(&self, key: &str, options: WatchOptions) -> Result<WatchStream> {
        let rx = self.with_state(|state| state.open_watch(key, options))?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::Txn;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_put_get_prefix() {
        let store = MemoryStore::new();
        store.put("/svc/a", "1", None).await.unwrap();
        store.put("/svc/b", "2", None).await.unwrap();
        store.put("/svcx", "3", None).await.unwrap();

        let resp = store.get("/svc/", true).await.unwrap();
        assert_eq!(resp.kvs.len(), 2);
        assert_eq!(resp.kvs[0].key, "/svc/a");
        assert_eq!(resp.revision, store.revision());

        let single = store.get("/svcx", false).await.unwrap();
        assert_eq!(single.first().map(|kv| kv.value.as_str()), Some("3"));
    }

    #[tokio::test]
    async fn test_revisions_and_versions() {
        let store = MemoryStore::new();
        let r1 = store.put("k", "a", None).await.unwrap();
        let r2 = store.put("k", "b", None).await.unwrap();
        assert_eq!(r2, r1 + 1);

        let kv = store.get("k", false).await.unwrap().kvs.remove(0);
        assert_eq!(kv.create_revision, r1);
        assert_eq!(kv.mod_revision, r2);
        assert_eq!(kv.version, 2);
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let store = MemoryStore::new();
        store.put("/x/1", "a", None).await.unwrap();
        store.put("/x/2", "b", None).await.unwrap();
        store.put("/y", "c", None).await.unwrap();

        assert_eq!(store.delete("/x/", true).await.unwrap(), 2);
        assert_eq!(store.delete("/x/", true).await.unwrap(), 0);
        assert_eq!(store.get("", true).await.unwrap().kvs.len(), 1);
    }

    #[tokio::test]
    async fn test_txn_create_if_absent() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(5).await.unwrap();

        let first = store
            .txn(Txn::create_if_absent("/lock", "one", lease.id))
            .await
            .unwrap();
        assert!(first.succeeded);

        let second = store
            .txn(Txn::create_if_absent("/lock", "two", lease.id))
            .await
            .unwrap();
        assert!(!second.succeeded);
        assert_eq!(second.first_kv(0).map(|kv| kv.value.as_str()), Some("one"));
    }

    #[tokio::test]
    async fn test_lease_grant_rejects_non_positive_ttl() {
        let store = MemoryStore::new();
        for ttl in [0, -5] {
            let err = store.lease_grant(ttl).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidTtl(t) if t == ttl));
        }
        assert_eq!(store.lease_grant(1).await.unwrap().ttl, 1);
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = MemoryStore::new();
        let err = store.put("k", "v", Some(99)).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseNotFound(99)));

        let err = store
            .txn(Txn::create_if_absent("k", "v", 99))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseNotFound(99)));
        assert!(store.get("k", false).await.unwrap().kvs.is_empty());
    }

    #[tokio::test]
    async fn test_revoke_deletes_attached_keys() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(5).await.unwrap();
        store.put("/a", "1", Some(lease.id)).await.unwrap();
        store.put("/b", "2", Some(lease.id)).await.unwrap();
        store.put("/c", "3", None).await.unwrap();

        let mut watch = store.watch("/", WatchOptions::prefix()).await.unwrap();
        store.lease_revoke(lease.id).await.unwrap();

        let resp = watch.next().await.unwrap().unwrap();
        assert_eq!(resp.events.len(), 2);
        assert!(resp.events.iter().all(|e| e.event_type == EventType::Delete));
        assert_eq!(store.get("/", true).await.unwrap().kvs.len(), 1);
        assert!(store.lease_ttl(lease.id).is_none());
        assert!(matches!(
            store.lease_revoke(lease.id).await,
            Err(StoreError::LeaseNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_keepalive() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(2).await.unwrap();
        store.put("/ephemeral", "x", Some(lease.id)).await.unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.get("/ephemeral", false).await.unwrap().kvs.is_empty());
        assert!(store.lease_ttl(lease.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_holds_lease() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(3).await.unwrap();
        let mut keepalive = store.lease_keep_alive(lease.id).await.unwrap();

        for _ in 0..10 {
            let resp = keepalive.next().await.unwrap();
            assert_eq!(resp.ttl, 3);
        }
        assert_eq!(store.lease_ttl(lease.id), Some(3));
    }

    #[tokio::test]
    async fn test_keepalive_stream_ends_on_expiry() {
        let store = MemoryStore::new();
        let lease = store.lease_grant(60).await.unwrap();
        let mut keepalive = store.lease_keep_alive(lease.id).await.unwrap();
        assert!(keepalive.next().await.is_some());

        assert!(store.expire_lease(lease.id));
        let end = tokio::time::timeout(Duration::from_secs(1), async {
            while keepalive.next().await.is_some() {}
        })
        .await;
        assert!(end.is_ok());
    }

    #[tokio::test]
    async fn test_watch_replay_from_revision() {
        let store = MemoryStore::new();
        let r1 = store.put("/w/1", "a", None).await.unwrap();
        store.put("/other", "b", None).await.unwrap();
        store.delete("/w/1", false).await.unwrap();

        let mut watch = store
            .watch("/w/", WatchOptions::prefix().from_revision(Some(r1)))
            .await
            .unwrap();

        let put = watch.next().await.unwrap().unwrap();
        assert_eq!(put.events[0].event_type, EventType::Put);
        assert_eq!(put.events[0].kv.value, "a");
        let del = watch.next().await.unwrap().unwrap();
        assert_eq!(del.events[0].event_type, EventType::Delete);
        assert_eq!(del.events[0].kv.key, "/w/1");
    }

    #[tokio::test]
    async fn test_close_watches_ends_streams() {
        let store = MemoryStore::new();
        let mut watch = store.watch("/k", WatchOptions::key()).await.unwrap();
        assert_eq!(store.watcher_count(), 1);
        assert_eq!(store.close_watches(), 1);
        assert!(watch.next().await.is_none());
    }

    #[test]
    fn test_keepalive_interval() {
        assert_eq!(keepalive_interval(3), Duration::from_secs(1));
        assert_eq!(keepalive_interval(0), Duration::from_secs(1) / 3);
        assert_eq!(keepalive_interval(-5), Duration::from_secs(1) / 3);
    }
}
