//! Tether Common - shared plumbing for the Tether crates
//!
//! This crate provides:
//! - Client configuration loading (file, environment, overrides)
//! - Retry policies shared by lock campaigns and watch reconnects
//! - Logging initialization for host processes
//! - Ordered exit-handler chain and shutdown signal handling

pub mod config;
pub mod error;
pub mod exit;
pub mod logging;
pub mod retry;

pub use config::{
    CampaignSettings, ClientConfig, DEBUG_LEASE_TTL, DEFAULT_LEASE_TTL, DEFAULT_SESSION_TTL,
    ReconnectSettings, SERVICE_PING_PATH,
};
pub use error::ConfigError;
pub use exit::{ExitChain, wait_for_shutdown_signal};
pub use logging::{LoggingConfig, LoggingGuard, init_logging};
pub use retry::RetryPolicy;
