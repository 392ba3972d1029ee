//! Distributed lock strategies
//!
//! - [`SessionLock`]: blocking FIFO mutex on `<name>.sync`, backed by a session
//! - [`LeaseLock`]: campaign for `<name>.lease` with a transaction, retried on
//!   a fixed interval, backed by a guarded short-TTL lease

use std::fmt;
use std::sync::Arc;

use tether_common::{CampaignSettings, DEBUG_LEASE_TTL, DEFAULT_LEASE_TTL, RetryPolicy};
use tether_store::{LeaseId, StoreError, StoreGateway, Txn};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::guardian::{GuardianHandle, GuardianState, LeaseGuardian, Terminator};
use crate::session::{Session, SessionMutex};

/// Lease TTL actually granted for a requested one: only the debug TTL is
/// honored, everything else gets the default.
pub fn effective_lease_ttl(requested: i64) -> i64 {
    if requested == DEBUG_LEASE_TTL {
        DEBUG_LEASE_TTL
    } else {
        DEFAULT_LEASE_TTL
    }
}

/// Whether campaign attempt `attempts` (1-based) should log a contention
/// warning: the first attempt and every `warn_every` after it.
fn should_warn(attempts: u64, warn_every: u64) -> bool {
    warn_every > 0 && attempts > 0 && (attempts - 1) % warn_every == 0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    Session,
    Lease,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Session => write!(f, "session"),
            LockKind::Lease => write!(f, "lease"),
        }
    }
}

/// Mutex scoped to a session.
pub struct SessionLock {
    name: String,
    session: Session,
    mutex: SessionMutex,
}

impl SessionLock {
    pub async fn create(gateway: Arc<dyn StoreGateway>, name: &str, session_ttl: i64) -> Result<Self> {
        let session = Session::new(gateway.clone(), session_ttl).await?;
        let mutex = SessionMutex::new(gateway, &format!("{}.sync", name), &session);
        Ok(Self {
            name: name.to_string(),
            session,
            mutex,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_locked(&self) -> bool {
        self.mutex.is_locked()
    }

    pub async fn lock(&mut self) -> Result<()> {
        self.mutex.lock().await?;
        info!(name = %self.name, "Session lock acquired");
        Ok(())
    }

    pub async fn unlock(&mut self) -> Result<()> {
        self.mutex.unlock().await?;
        info!(name = %self.name, "Session lock released");
        Ok(())
    }

    /// Release the mutex if held and close the session.
    pub async fn close(mut self) -> Result<()> {
        let unlocked = self.mutex.unlock().await;
        self.session.close().await?;
        unlocked
    }
}

/// Lock held by owning a key attached to a guarded lease.
pub struct LeaseLock {
    gateway: Arc<dyn StoreGateway>,
    name: String,
    key: String,
    value: String,
    ttl: i64,
    guardian: LeaseGuardian,
    campaign: RetryPolicy,
    warn_every: u64,
}

impl LeaseLock {
    /// Grant a lease with the effective TTL and start guarding it. An empty
    /// `value` defaults to `"<name>.lease.value"`.
    pub async fn create(
        gateway: Arc<dyn StoreGateway>,
        name: &str,
        value: &str,
        ttl: i64,
        campaign: &CampaignSettings,
        terminator: Arc<dyn Terminator>,
    ) -> Result<Self> {
        let ttl = effective_lease_ttl(ttl);
        let grant = gateway.lease_grant(ttl).await?;
        let keepalive = match gateway.lease_keep_alive(grant.id).await {
            Ok(keepalive) => keepalive,
            Err(e) => {
                let _ = gateway.lease_revoke(grant.id).await;
                return Err(e.into());
            }
        };
        let guardian = LeaseGuardian::spawn(gateway.clone(), grant.id, keepalive, terminator);

        let key = format!("{}.lease", name);
        let value = if value.is_empty() {
            format!("{}.value", key)
        } else {
            value.to_string()
        };

        info!(
            name = %name,
            lease = %format_args!("{:x}", grant.id),
            ttl = grant.ttl,
            "Lease locker created"
        );

        Ok(Self {
            gateway,
            name: name.to_string(),
            key,
            value,
            ttl: grant.ttl,
            guardian,
            campaign: campaign.policy(),
            warn_every: campaign.warn_every,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    pub fn lease(&self) -> LeaseId {
        self.guardian.lease()
    }

    pub fn guardian(&self) -> GuardianHandle {
        self.guardian.handle()
    }

    /// Campaign until the lock key is ours.
    pub async fn lock(&self) -> Result<()> {
        let lease = self.lease();
        let started = Instant::now();
        let mut attempts: u64 = 0;

        loop {
            if self.guardian.state() != GuardianState::Active {
                return Err(ClientError::LeaseLost(lease));
            }

            let resp = self
                .gateway
                .txn(Txn::create_if_absent(&self.key, &self.value, lease))
                .await
                .map_err(|e| match e {
                    StoreError::LeaseNotFound(id) => ClientError::LeaseLost(id),
                    e => e.into(),
                })?;
            attempts += 1;

            if resp.succeeded {
                info!(key = %self.key, attempts, "Lease lock acquired");
                return Ok(());
            }

            let holder = resp.first_kv(0);
            if holder.is_some_and(|kv| kv.lease == lease) {
                debug!(key = %self.key, "Lease lock already held by this lease");
                return Ok(());
            }
            let holder = holder.map(|kv| kv.value.clone()).unwrap_or_default();

            if should_warn(attempts, self.warn_every) {
                warn!(
                    key = %self.key,
                    holder = %holder,
                    attempts,
                    "Lease lock is held by another owner, retrying"
                );
            }

            if self.campaign.exhausted(attempts, started.elapsed()) {
                return Err(ClientError::Contended {
                    key: self.key.clone(),
                    holder,
                    attempts,
                });
            }
            tokio::time::sleep(self.campaign.interval).await;
        }
    }

    /// Revoke the lease, which deletes the lock key. The lease cannot be
    /// reused afterwards.
    pub async fn unlock(&self) -> Result<()> {
        match self.guardian.cancel_and_wait().await {
            GuardianState::Expired => Err(ClientError::LeaseLost(self.lease())),
            _ => {
                info!(key = %self.key, "Lease lock released");
                Ok(())
            }
        }
    }
}

/// The lock handle owned by a coordinator.
pub enum Locker {
    Session(SessionLock),
    Lease(LeaseLock),
}

impl Locker {
    pub fn name(&self) -> &str {
        match self {
            Locker::Session(lock) => lock.name(),
            Locker::Lease(lock) => lock.name(),
        }
    }

    pub fn kind(&self) -> LockKind {
        match self {
            Locker::Session(_) => LockKind::Session,
            Locker::Lease(_) => LockKind::Lease,
        }
    }

    pub async fn lock(&mut self) -> Result<()> {
        match self {
            Locker::Session(lock) => lock.lock().await,
            Locker::Lease(lock) => lock.lock().await,
        }
    }

    pub async fn unlock(&mut self) -> Result<()> {
        match self {
            Locker::Session(lock) => lock.unlock().await,
            Locker::Lease(lock) => lock.unlock().await,
        }
    }

    /// Release everything the locker holds.
    pub async fn close(self) -> Result<()> {
        match self {
            Locker::Session(lock) => lock.close().await,
            Locker::Lease(lock) => lock.unlock().await,
        }
    }
}
