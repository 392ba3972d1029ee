//! Coordinator: the entry point tying the store gateway, the lock handle,
//! the watch router and the exit chain together.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tether_common::{ClientConfig, ExitChain};
use tether_store::{EtcdGateway, Revision, StoreGateway};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{ClientError, Result};
use crate::guardian::{GuardianState, ProcessTerminator, Terminator};
use crate::locker::{LeaseLock, LockKind, Locker, SessionLock};
use crate::router::{ChangeHandler, WatchRouter, WatchTasks};

/// Run `fut` on its own task and give up after `timeout`.
pub async fn run_with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut task = tokio::spawn(fut);
    tokio::select! {
        joined = &mut task => match joined {
            Ok(result) => result,
            Err(e) => Err(ClientError::Other(anyhow::anyhow!("task failed: {}", e))),
        },
        _ = tokio::time::sleep(timeout) => {
            task.abort();
            Err(ClientError::Timeout(timeout))
        }
    }
}

/// Coordination client bound to one store.
pub struct Coordinator {
    config: ClientConfig,
    gateway: Arc<dyn StoreGateway>,
    locker: Arc<Mutex<Option<Locker>>>,
    router: parking_lot::Mutex<WatchRouter>,
    exit_chain: ExitChain,
    terminator: Arc<dyn Terminator>,
}

impl Coordinator {
    /// Connect to the configured endpoints and check the store answers.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let config = config.normalized().inspect_err(|e| {
            error!("Invalid client configuration: {}", e);
        })?;
        let gateway = EtcdGateway::new(
            config.endpoints.clone(),
            config.dial_timeout(),
            config.request_timeout(),
        )?;

        let coordinator = Self::with_gateway(config, Arc::new(gateway));
        coordinator.init().await?;
        Ok(coordinator)
    }

    /// Build a coordinator over an existing gateway. No I/O is performed.
    pub fn with_gateway(config: ClientConfig, gateway: Arc<dyn StoreGateway>) -> Self {
        let terminator = Arc::new(ProcessTerminator::new(config.exit_grace()));
        let router = WatchRouter::with_reconnect(config.watch_reconnect.policy());
        Self {
            config,
            gateway,
            locker: Arc::new(Mutex::new(None)),
            router: parking_lot::Mutex::new(router),
            exit_chain: ExitChain::new(),
            terminator,
        }
    }

    /// Replace the reaction to losing a held lease.
    pub fn with_terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = terminator;
        self
    }

    /// Share an exit chain with the host.
    pub fn with_exit_chain(mut self, exit_chain: ExitChain) -> Self {
        self.exit_chain = exit_chain;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn gateway(&self) -> Arc<dyn StoreGateway> {
        self.gateway.clone()
    }

    pub fn exit_chain(&self) -> &ExitChain {
        &self.exit_chain
    }

    /// Ping the store, logging failures.
    pub async fn init(&self) -> Result<()> {
        match self.ping().await {
            Ok(()) => {
                info!("Connected to store");
                Ok(())
            }
            Err(e) => {
                error!("Store is not reachable: {}", e);
                Err(e)
            }
        }
    }

    /// Write the local time to the ping key within the ping timeout.
    pub async fn ping(&self) -> Result<()> {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let gateway = self.gateway.clone();
        let path = self.config.ping_path.clone();

        run_with_timeout(self.config.ping_timeout(), async move {
            gateway.put(&path, &now, None).await?;
            Ok::<_, ClientError>(())
        })
        .await
    }

    // ---- Locking ----

    /// Create a session-backed locker for `name`, replacing any previous one.
    pub async fn create_session_locker(&self, name: &str) -> bool {
        match SessionLock::create(self.gateway.clone(), name, self.config.session_ttl).await {
            Ok(lock) => {
                self.replace_locker(Locker::Session(lock)).await;
                true
            }
            Err(e) => {
                error!(name = %name, "Failed to create session locker: {}", e);
                false
            }
        }
    }

    /// Create a lease-backed locker for `name`, replacing any previous one.
    /// The lease is revoked by the exit chain on shutdown.
    pub async fn create_lease_locker(&self, name: &str, value: &str, ttl: i64) -> bool {
        let lock = match LeaseLock::create(
            self.gateway.clone(),
            name,
            value,
            ttl,
            &self.config.campaign,
            self.terminator.clone(),
        )
        .await
        {
            Ok(lock) => lock,
            Err(e) => {
                error!(name = %name, "Failed to create lease locker: {}", e);
                return false;
            }
        };

        let guardian = lock.guardian();
        self.exit_chain
            .add(format!("revoke {}", lock.key()), move || async move {
                guardian.cancel();
                guardian.wait_terminal().await == GuardianState::Revoked
            });

        self.replace_locker(Locker::Lease(lock)).await;
        true
    }

    async fn replace_locker(&self, locker: Locker) {
        let previous = self.locker.lock().await.replace(locker);
        if let Some(previous) = previous {
            info!(name = %previous.name(), kind = %previous.kind(), "Releasing previous locker");
            if let Err(e) = previous.close().await {
                warn!("Failed to release previous locker: {}", e);
            }
        }
    }

    pub async fn locker_kind(&self) -> Option<LockKind> {
        self.locker.lock().await.as_ref().map(Locker::kind)
    }

    /// Acquire the current locker.
    pub async fn lock(&self) -> Result<()> {
        let mut locker = self.locker.lock().await;
        match locker.as_mut() {
            Some(locker) => locker.lock().await,
            None => Err(ClientError::NoLocker),
        }
    }

    /// Release the current locker.
    pub async fn unlock(&self) -> Result<()> {
        let mut locker = self.locker.lock().await;
        match locker.as_mut() {
            Some(locker) => locker.unlock().await,
            None => Err(ClientError::NoLocker),
        }
    }

    /// Unlock whatever locker is held when the exit chain runs. Skipped if a
    /// lock call is still in progress at that point.
    pub fn add_exit_unlock(&self) {
        let locker = self.locker.clone();
        self.exit_chain.add("unlock locker", move || async move {
            let Ok(mut guard) = locker.try_lock() else {
                warn!("Locker busy at shutdown, skipping unlock");
                return false;
            };
            match guard.as_mut() {
                Some(locker) => match locker.unlock().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(name = %locker.name(), "Unlock on exit failed: {}", e);
                        false
                    }
                },
                None => true,
            }
        });
    }

    // ---- Watching ----

    /// Bind `handler` to changes under `prefix`. Takes effect at the next
    /// `do_watch`.
    pub fn watch_register(&self, prefix: impl Into<String>, handler: impl ChangeHandler) {
        self.router.lock().register(prefix, handler);
    }

    /// Start watching every registered prefix. Bindings registered so far are
    /// handed to the running loops.
    pub fn do_watch(&self) -> WatchTasks {
        let fresh = WatchRouter::with_reconnect(self.config.watch_reconnect.policy());
        let router = std::mem::replace(&mut *self.router.lock(), fresh);
        info!(prefixes = ?router.watch_paths(), "Starting watches");
        router.start(self.gateway.clone())
    }

    // ---- Plain key-value access ----

    pub async fn put(&self, key: &str, value: &str) -> Result<Revision> {
        Ok(self.gateway.put(key, value, None).await?)
    }

    /// Read a key or prefix as `key -> value` along with the store revision.
    pub async fn get(&self, key: &str, prefix: bool) -> Result<(Revision, HashMap<String, String>)> {
        let resp = self.gateway.get(key, prefix).await?;
        Ok((resp.revision, resp.to_map()))
    }

    pub async fn delete(&self, key: &str, prefix: bool) -> Result<i64> {
        Ok(self.gateway.delete(key, prefix).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_store::MemoryStore;

    fn coordinator() -> (Arc<MemoryStore>, Coordinator) {
        let store = Arc::new(MemoryStore::new());
        let config = ClientConfig::from_endpoints("127.0.0.1:2379").unwrap();
        (store.clone(), Coordinator::with_gateway(config, store))
    }

    #[tokio::test]
    async fn test_run_with_timeout() {
        let ok = run_with_timeout(Duration::from_secs(1), async { Ok::<_, ClientError>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let slow = run_with_timeout(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, ClientError>(())
        })
        .await;
        assert!(matches!(slow, Err(ClientError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_ping_writes_timestamp() {
        let (store, coordinator) = coordinator();
        coordinator.init().await.unwrap();

        let (_, kvs) = coordinator.get(tether_common::SERVICE_PING_PATH, false).await.unwrap();
        let stamp = &kvs[tether_common::SERVICE_PING_PATH];
        assert!(chrono::NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S").is_ok());
        assert!(store.revision() > 1);
    }

    #[tokio::test]
    async fn test_lock_without_locker() {
        let (_, coordinator) = coordinator();
        assert!(matches!(coordinator.lock().await, Err(ClientError::NoLocker)));
        assert!(matches!(coordinator.unlock().await, Err(ClientError::NoLocker)));
        assert!(coordinator.locker_kind().await.is_none());
    }

    #[tokio::test]
    async fn test_kv_helpers() {
        let (_, coordinator) = coordinator();
        coordinator.put("/cfg/a", "1").await.unwrap();
        coordinator.put("/cfg/b", "2").await.unwrap();

        let (revision, kvs) = coordinator.get("/cfg/", true).await.unwrap();
        assert!(revision > 0);
        assert_eq!(kvs.len(), 2);
        assert_eq!(coordinator.delete("/cfg/", true).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_replacing_locker_releases_previous() {
        let (store, coordinator) = coordinator();
        assert!(coordinator.create_lease_locker("/old", "v", 5).await);
        coordinator.lock().await.unwrap();
        assert_eq!(store.get("/old.lease", false).await.unwrap().kvs.len(), 1);

        assert!(coordinator.create_session_locker("/new").await);
        assert_eq!(coordinator.locker_kind().await, Some(LockKind::Session));
        assert!(store.get("/old.lease", false).await.unwrap().kvs.is_empty());
    }
}
