//! Lease guardian
//!
//! Owns the keep-alive stream of a lease lock. Cancelling the guardian revokes
//! the lease. If the keep-alive ends on its own the lease is gone, the lock is
//! no longer held, and the process is terminated through a [`Terminator`]
//! rather than carrying on as if it still held the lock.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tether_store::{KeepAliveStream, LeaseId, StoreError, StoreGateway};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

/// Lifecycle of a guarded lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardianState {
    Active,
    Revoking,
    Revoked,
    Expired,
}

impl GuardianState {
    pub fn is_terminal(self) -> bool {
        matches!(self, GuardianState::Revoked | GuardianState::Expired)
    }
}

/// Reaction to losing a lease that was never released.
pub trait Terminator: Send + Sync + 'static {
    fn terminate(&self, lease: LeaseId);
}

/// Sends SIGTERM to the current process, then force-exits with status 1
/// once the grace period has passed.
#[derive(Clone, Copy, Debug)]
pub struct ProcessTerminator {
    grace: Duration,
}

impl ProcessTerminator {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

impl Default for ProcessTerminator {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Terminator for ProcessTerminator {
    fn terminate(&self, lease: LeaseId) {
        error!(
            lease = %format_args!("{:x}", lease),
            "Lease lost while holding the lock, terminating process"
        );

        #[cfg(unix)]
        {
            // SAFETY: kill(2) on our own pid with a valid signal number has no
            // memory-safety preconditions.
            let rc = unsafe { libc::kill(std::process::id() as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                error!("Failed to send SIGTERM: {}", std::io::Error::last_os_error());
            }
        }

        let grace = self.grace;
        std::thread::spawn(move || {
            std::thread::sleep(grace);
            error!("Shutdown grace period of {:?} elapsed, exiting", grace);
            std::process::exit(1);
        });
    }
}

/// Clonable view of a guardian, used by exit hooks and callers that do not
/// own the lock.
#[derive(Clone)]
pub struct GuardianHandle {
    lease: LeaseId,
    cancel: Arc<watch::Sender<bool>>,
    state: watch::Receiver<GuardianState>,
}

impl GuardianHandle {
    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    pub fn state(&self) -> GuardianState {
        *self.state.borrow()
    }

    /// Ask the guardian to revoke the lease. No-op once terminal.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Wait until the guardian reached `Revoked` or `Expired`.
    pub async fn wait_terminal(&self) -> GuardianState {
        let mut state = self.state.clone();
        let res = state.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        match res {
            Ok(s) => s,
            Err(_) => *state.borrow(),
        }
    }
}

enum Outcome {
    Cancelled,
    Expired,
}

/// Background task keeping one lease alive.
pub struct LeaseGuardian {
    handle: GuardianHandle,
    task: JoinHandle<()>,
}

impl LeaseGuardian {
    pub fn spawn(
        gateway: Arc<dyn StoreGateway>,
        lease: LeaseId,
        mut keepalive: KeepAliveStream,
        terminator: Arc<dyn Terminator>,
    ) -> Self {
        let (state_tx, state) = watch::channel(GuardianState::Active);
        let (cancel, mut cancelled) = watch::channel(false);

        let task = tokio::spawn(async move {
            let outcome = loop {
                tokio::select! {
                    biased;
                    _ = cancelled.changed() => break Outcome::Cancelled,
                    resp = keepalive.next() => match resp {
                        Some(resp) if !resp.is_expired() => {
                            trace!(lease = %format_args!("{:x}", lease), ttl = resp.ttl, "Lease renewed");
                        }
                        _ => break Outcome::Expired,
                    },
                }
            };
            drop(keepalive);

            match outcome {
                Outcome::Cancelled => {
                    state_tx.send_replace(GuardianState::Revoking);
                    match gateway.lease_revoke(lease).await {
                        Ok(()) => info!(lease = %format_args!("{:x}", lease), "Lease revoked"),
                        Err(StoreError::LeaseNotFound(_)) => {
                            info!(lease = %format_args!("{:x}", lease), "Lease already gone")
                        }
                        Err(e) => warn!(
                            lease = %format_args!("{:x}", lease),
                            "Failed to revoke lease: {}", e
                        ),
                    }
                    state_tx.send_replace(GuardianState::Revoked);
                }
                Outcome::Expired => {
                    error!(lease = %format_args!("{:x}", lease), "Lease keep-alive ended unexpectedly");
                    state_tx.send_replace(GuardianState::Expired);
                    terminator.terminate(lease);
                }
            }
        });

        Self {
            handle: GuardianHandle {
                lease,
                cancel: Arc::new(cancel),
                state,
            },
            task,
        }
    }

    pub fn handle(&self) -> GuardianHandle {
        self.handle.clone()
    }

    pub fn lease(&self) -> LeaseId {
        self.handle.lease
    }

    pub fn state(&self) -> GuardianState {
        self.handle.state()
    }

    /// Revoke the lease and wait for the guardian to finish.
    pub async fn cancel_and_wait(&self) -> GuardianState {
        self.handle.cancel();
        self.handle.wait_terminal().await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for LeaseGuardian {
    fn drop(&mut self) {
        if self.handle.state() == GuardianState::Active {
            self.handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tether_store::MemoryStore;

    #[derive(Default)]
    struct RecordingTerminator {
        calls: Mutex<Vec<LeaseId>>,
    }

    impl Terminator for RecordingTerminator {
        fn terminate(&self, lease: LeaseId) {
            self.calls.lock().push(lease);
        }
    }

    async fn guarded(
        store: &Arc<MemoryStore>,
        terminator: Arc<RecordingTerminator>,
    ) -> LeaseGuardian {
        let gateway: Arc<dyn StoreGateway> = store.clone();
        let grant = gateway.lease_grant(5).await.unwrap();
        let keepalive = gateway.lease_keep_alive(grant.id).await.unwrap();
        LeaseGuardian::spawn(gateway, grant.id, keepalive, terminator)
    }

    #[test]
    fn test_terminal_states() {
        assert!(!GuardianState::Active.is_terminal());
        assert!(!GuardianState::Revoking.is_terminal());
        assert!(GuardianState::Revoked.is_terminal());
        assert!(GuardianState::Expired.is_terminal());
    }

    #[tokio::test]
    async fn test_cancel_revokes_without_terminating() {
        let store = Arc::new(MemoryStore::new());
        let terminator = Arc::new(RecordingTerminator::default());
        let guardian = guarded(&store, terminator.clone()).await;
        assert_eq!(guardian.state(), GuardianState::Active);

        assert_eq!(guardian.cancel_and_wait().await, GuardianState::Revoked);
        assert!(store.lease_ttl(guardian.lease()).is_none());
        assert!(terminator.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_expiry_invokes_terminator() {
        let store = Arc::new(MemoryStore::new());
        let terminator = Arc::new(RecordingTerminator::default());
        let guardian = guarded(&store, terminator.clone()).await;

        store.expire_lease(guardian.lease());
        assert_eq!(guardian.handle().wait_terminal().await, GuardianState::Expired);
        assert_eq!(*terminator.calls.lock(), vec![guardian.lease()]);

        // Cancelling a lost lease changes nothing.
        assert_eq!(guardian.cancel_and_wait().await, GuardianState::Expired);
        assert_eq!(terminator.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_revokes_active_lease() {
        let store = Arc::new(MemoryStore::new());
        let terminator = Arc::new(RecordingTerminator::default());
        let guardian = guarded(&store, terminator.clone()).await;
        let handle = guardian.handle();
        let lease = guardian.lease();

        drop(guardian);
        assert_eq!(handle.wait_terminal().await, GuardianState::Revoked);
        assert!(store.lease_ttl(lease).is_none());
        assert!(terminator.calls.lock().is_empty());
    }
}
