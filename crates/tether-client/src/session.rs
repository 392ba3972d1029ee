//! Sessions and session-scoped mutexes
//!
//! A session is a lease kept alive in the background for as long as the
//! session lives. A [`SessionMutex`] is a FIFO queue of keys attached to the
//! session lease under a common prefix: each contender creates
//! `<prefix>/<lease-hex>` and waits until every key created before it is gone.

use std::sync::Arc;

use futures::StreamExt;
use tether_store::{
    EventType, LeaseId, Revision, StoreError, StoreGateway, Txn, WatchOptions,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{ClientError, Result};

/// A lease kept alive by a background task.
pub struct Session {
    gateway: Arc<dyn StoreGateway>,
    lease: LeaseId,
    ttl: i64,
    keepalive: JoinHandle<()>,
    alive: watch::Receiver<bool>,
}

impl Session {
    /// Grant a lease with `ttl` seconds and start renewing it.
    pub async fn new(gateway: Arc<dyn StoreGateway>, ttl: i64) -> Result<Self> {
        let grant = gateway.lease_grant(ttl).await?;
        let mut stream = match gateway.lease_keep_alive(grant.id).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = gateway.lease_revoke(grant.id).await;
                return Err(e.into());
            }
        };

        let (alive_tx, alive) = watch::channel(true);
        let lease = grant.id;
        let keepalive = tokio::spawn(async move {
            while let Some(resp) = stream.next().await {
                if resp.is_expired() {
                    break;
                }
                trace!(lease = %format_args!("{:x}", lease), ttl = resp.ttl, "Session lease renewed");
            }
            warn!(lease = %format_args!("{:x}", lease), "Session keep-alive ended");
            alive_tx.send_replace(false);
        });

        info!(lease = %format_args!("{:x}", lease), ttl = grant.ttl, "Session opened");

        Ok(Self {
            gateway,
            lease,
            ttl: grant.ttl,
            keepalive,
            alive,
        })
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    /// Whether the keep-alive is still renewing the lease.
    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    /// Stop renewing and revoke the lease, deleting every key attached to it.
    pub async fn close(self) -> Result<()> {
        self.keepalive.abort();
        match self.gateway.lease_revoke(self.lease).await {
            Ok(()) | Err(StoreError::LeaseNotFound(_)) => {
                info!(lease = %format_args!("{:x}", self.lease), "Session closed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.keepalive.abort();
    }
}

/// Advisory mutex shared by every session locking the same prefix.
pub struct SessionMutex {
    gateway: Arc<dyn StoreGateway>,
    prefix: String,
    lease: LeaseId,
    my_key: Option<String>,
    my_revision: Revision,
}

impl SessionMutex {
    pub fn new(gateway: Arc<dyn StoreGateway>, prefix: &str, session: &Session) -> Self {
        Self {
            gateway,
            prefix: format!("{}/", prefix),
            lease: session.lease(),
            my_key: None,
            my_revision: 0,
        }
    }

    /// Key this mutex holds or waits on, once `lock` has been called.
    pub fn key(&self) -> Option<&str> {
        self.my_key.as_deref()
    }

    pub fn is_locked(&self) -> bool {
        self.my_key.is_some()
    }

    /// Queue up and block until every earlier contender has released.
    pub async fn lock(&mut self) -> Result<()> {
        let key = format!("{}{:x}", self.prefix, self.lease);
        let resp = self
            .gateway
            .txn(Txn::create_if_absent(&key, "", self.lease))
            .await?;
        self.my_revision = if resp.succeeded {
            resp.revision
        } else {
            resp.first_kv(0)
                .map_or(resp.revision, |kv| kv.create_revision)
        };
        self.my_key = Some(key.clone());

        if let Err(e) = self.wait_predecessors(&key).await {
            let _ = self.gateway.delete(&key, false).await;
            self.my_key = None;
            return Err(e);
        }

        debug!(key = %key, revision = self.my_revision, "Session mutex acquired");
        Ok(())
    }

    /// Release the mutex by deleting our queue key.
    pub async fn unlock(&mut self) -> Result<()> {
        if let Some(key) = self.my_key.take() {
            self.gateway.delete(&key, false).await?;
            debug!(key = %key, "Session mutex released");
        }
        Ok(())
    }

    async fn wait_predecessors(&self, key: &str) -> Result<()> {
        loop {
            let resp = self.gateway.get(&self.prefix, true).await?;
            if !resp.kvs.iter().any(|kv| kv.key == key) {
                return Err(ClientError::LeaseLost(self.lease));
            }

            let predecessor = resp
                .kvs
                .iter()
                .filter(|kv| kv.create_revision < self.my_revision)
                .max_by_key(|kv| kv.create_revision);
            let Some(predecessor) = predecessor else {
                return Ok(());
            };

            debug!(key = %key, waiting_on = %predecessor.key, "Waiting for session mutex");
            wait_deleted(self.gateway.as_ref(), &predecessor.key, resp.revision + 1).await?;
        }
    }
}

/// Return once `key` has been deleted at or after revision `from`, or once
/// the watch ends and the caller should re-check.
async fn wait_deleted(gateway: &dyn StoreGateway, key: &str, from: Revision) -> Result<()> {
    let options = WatchOptions::key().from_revision(Some(from));
    let mut stream = match gateway.watch(key, options).await {
        Ok(stream) => stream,
        Err(StoreError::Compacted { .. }) => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    while let Some(resp) = stream.next().await {
        match resp {
            Ok(resp) => {
                if resp
                    .events
                    .iter()
                    .any(|e| e.event_type == EventType::Delete)
                {
                    return Ok(());
                }
            }
            Err(StoreError::Compacted { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
