//! Tether Client - distributed coordination over a key-value store
//!
//! This crate provides:
//! - Session locks: blocking FIFO mutex backed by a kept-alive session
//! - Lease locks: campaign-based lock backed by a guarded short-TTL lease
//! - Lease guardian with revoke-on-unlock and fail-fast on lease loss
//! - Prefix watch router with reconnecting, resuming watch loops
//! - A `Coordinator` tying them to one store and an exit chain
//!
//! # Example
//!
//! ```ignore
//! use tether_client::Coordinator;
//! use tether_common::ClientConfig;
//!
//! let config = ClientConfig::from_endpoints("127.0.0.1:2379")?;
//! let coordinator = Coordinator::connect(config).await?;
//!
//! if coordinator.create_lease_locker("/jobs/reindex", "", 5).await {
//!     coordinator.lock().await?;
//!     // ... critical section ...
//!     coordinator.unlock().await?;
//! }
//!
//! coordinator.watch_register("/config/", |op, key: &str, value: &str| {
//!     println!("{} {} = {}", op, key, value);
//!     true
//! });
//! let tasks = coordinator.do_watch();
//! ```

pub mod coordinator;
pub mod error;
pub mod guardian;
pub mod locker;
pub mod router;
pub mod session;

pub use coordinator::{Coordinator, run_with_timeout};
pub use error::{ClientError, Result};
pub use guardian::{GuardianHandle, GuardianState, LeaseGuardian, ProcessTerminator, Terminator};
pub use locker::{LeaseLock, LockKind, Locker, SessionLock, effective_lease_ttl};
pub use router::{ChangeHandler, WatchRouter, WatchTasks};
pub use session::{Session, SessionMutex};
