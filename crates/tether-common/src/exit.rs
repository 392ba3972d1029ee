//! Ordered exit-handler chain
//!
//! Components register cleanup hooks (releasing locks, revoking leases) that
//! the host runs once when the process shuts down.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{error, info, warn};

type ExitHook = Box<dyn FnOnce() -> BoxFuture<'static, bool> + Send>;

/// Chain of async cleanup callbacks, invoked in registration order.
///
/// Cloning yields another handle to the same chain.
#[derive(Clone, Default)]
pub struct ExitChain {
    hooks: Arc<Mutex<Vec<(String, ExitHook)>>>,
}

impl ExitChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook. The returned bool reports whether cleanup succeeded.
    pub fn add<F, Fut>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let hook: ExitHook = Box::new(move || hook().boxed());
        self.hooks.lock().push((name.into(), hook));
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.lock().is_empty()
    }

    /// Run and drain every registered hook. Returns how many succeeded.
    pub async fn run(&self) -> usize {
        let hooks = std::mem::take(&mut *self.hooks.lock());
        let total = hooks.len();
        let mut succeeded = 0;

        for (name, hook) in hooks {
            if hook().await {
                succeeded += 1;
                info!(hook = %name, "Exit hook completed");
            } else {
                warn!(hook = %name, "Exit hook reported failure");
            }
        }

        info!("Exit chain finished: {}/{} hooks succeeded", succeeded, total);
        succeeded
    }
}

/// Wait for Ctrl+C or SIGTERM and return the name of the signal received.
pub async fn wait_for_shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, running exit chain...");
            "SIGINT"
        }
        _ = terminate => {
            info!("Received SIGTERM, running exit chain...");
            "SIGTERM"
        }
    }
}
