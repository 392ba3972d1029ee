//! Prefix watch dispatch
//!
//! Handlers are bound to key prefixes. Once started, the router keeps one
//! watch per root prefix (a registered prefix not covered by another one) and
//! hands every event to each binding whose prefix matches the key, in
//! registration order. Each event therefore reaches a matching handler once,
//! even when registered prefixes overlap.

use std::sync::Arc;

use futures::StreamExt;
use tether_common::{ReconnectSettings, RetryPolicy};
use tether_store::{EventType, Revision, StoreError, StoreGateway, WatchEvent, WatchOptions};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Callback invoked for each change under a registered prefix.
///
/// The return value reports whether the change was handled; `false` is
/// logged and otherwise ignored.
pub trait ChangeHandler: Send + Sync + 'static {
    fn on_change(&self, op: EventType, key: &str, value: &str) -> bool;
}

impl<F> ChangeHandler for F
where
    F: Fn(EventType, &str, &str) -> bool + Send + Sync + 'static,
{
    fn on_change(&self, op: EventType, key: &str, value: &str) -> bool {
        self(op, key, value)
    }
}

struct WatchBinding {
    prefix: String,
    handler: Arc<dyn ChangeHandler>,
}

/// Registry of prefix bindings.
pub struct WatchRouter {
    bindings: Vec<WatchBinding>,
    reconnect: RetryPolicy,
}

impl Default for WatchRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchRouter {
    pub fn new() -> Self {
        Self::with_reconnect(ReconnectSettings::default().policy())
    }

    pub fn with_reconnect(reconnect: RetryPolicy) -> Self {
        Self {
            bindings: Vec::new(),
            reconnect,
        }
    }

    /// Bind `handler` to every key starting with `prefix`.
    pub fn register(&mut self, prefix: impl Into<String>, handler: impl ChangeHandler) {
        let prefix = prefix.into();
        debug!(prefix = %prefix, "Registered watch handler");
        self.bindings.push(WatchBinding {
            prefix,
            handler: Arc::new(handler),
        });
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Distinct registered prefixes, in registration order.
    pub fn watch_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        for binding in &self.bindings {
            if !paths.contains(&binding.prefix) {
                paths.push(binding.prefix.clone());
            }
        }
        paths
    }

    /// Registered prefixes not covered by a shorter registered prefix.
    pub fn watch_roots(&self) -> Vec<String> {
        let paths = self.watch_paths();
        paths
            .iter()
            .filter(|path| {
                !paths
                    .iter()
                    .any(|other| other != *path && path.starts_with(other.as_str()))
            })
            .cloned()
            .collect()
    }

    /// Hand one event to every matching binding. Returns how many handlers ran.
    pub fn dispatch(&self, event: &WatchEvent) -> usize {
        let key = event.kv.key.as_str();
        let value = event.kv.value.as_str();
        let mut invoked = 0;

        for binding in self.bindings.iter().filter(|b| key.starts_with(&b.prefix)) {
            invoked += 1;
            debug!(
                prefix = %binding.prefix,
                key = %key,
                op = event.event_type.code(),
                "Dispatching change"
            );
            if !binding.handler.on_change(event.event_type, key, value) {
                warn!(
                    prefix = %binding.prefix,
                    key = %key,
                    op = %event.event_type,
                    "Change handler reported failure"
                );
            }
        }
        invoked
    }

    /// Start one watch loop per root prefix.
    pub fn start(self, gateway: Arc<dyn StoreGateway>) -> WatchTasks {
        let roots = self.watch_roots();
        let router = Arc::new(self);

        let handles = roots
            .into_iter()
            .map(|root| {
                let task = tokio::spawn(watch_loop(router.clone(), gateway.clone(), root.clone()));
                (root, task)
            })
            .collect();

        WatchTasks { handles }
    }
}

/// Running watch loops, one per root prefix.
pub struct WatchTasks {
    handles: Vec<(String, JoinHandle<()>)>,
}

impl WatchTasks {
    pub fn roots(&self) -> Vec<&str> {
        self.handles.iter().map(|(root, _)| root.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop every watch loop.
    pub fn abort(&self) {
        for (_, handle) in &self.handles {
            handle.abort();
        }
    }

    /// Wait for every loop to end. Loops only end when their reconnect
    /// policy gives up or they are aborted.
    pub async fn join(self) {
        for (root, handle) in self.handles {
            if let Err(e) = handle.await
                && !e.is_cancelled()
            {
                error!(prefix = %root, "Watch task failed: {}", e);
            }
        }
    }
}

/// Revision to resume from after a response: one past its newest event.
fn resume_after(revision: Revision, events: &[WatchEvent]) -> Revision {
    events
        .iter()
        .map(|e| e.kv.mod_revision)
        .max()
        .unwrap_or(revision)
        + 1
}

async fn watch_loop(router: Arc<WatchRouter>, gateway: Arc<dyn StoreGateway>, root: String) {
    let reconnect = router.reconnect;
    let mut next_revision: Option<Revision> = None;
    let mut failures: u64 = 0;
    let mut failing_since: Option<Instant> = None;

    loop {
        if next_revision.is_none() {
            match gateway.get(&root, false).await {
                Ok(resp) => next_revision = Some(resp.revision + 1),
                Err(e) => warn!(prefix = %root, "Failed to read current revision: {}", e),
            }
        }

        let options = WatchOptions::prefix().from_revision(next_revision);
        match gateway.watch(&root, options).await {
            Ok(mut stream) => {
                info!(prefix = %root, revision = ?next_revision, "Watch started");
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(resp) => {
                            failures = 0;
                            failing_since = None;
                            for event in &resp.events {
                                router.dispatch(event);
                            }
                            next_revision = Some(resume_after(resp.revision, &resp.events));
                        }
                        Err(StoreError::Compacted { compacted, .. }) => {
                            warn!(prefix = %root, compacted, "Watch revision compacted, resuming from now");
                            next_revision = None;
                            break;
                        }
                        Err(e) => {
                            warn!(prefix = %root, "Watch stream failed: {}", e);
                            break;
                        }
                    }
                }
            }
            Err(StoreError::Compacted { compacted, .. }) => {
                warn!(prefix = %root, compacted, "Watch revision compacted, resuming from now");
                next_revision = None;
            }
            Err(e) => {
                warn!(prefix = %root, "Failed to open watch: {}", e);
            }
        }

        failures += 1;
        let since = *failing_since.get_or_insert_with(Instant::now);
        if reconnect.exhausted(failures, since.elapsed()) {
            error!(prefix = %root, failures, "Giving up on watch");
            return;
        }

        warn!(prefix = %root, "Watch ended, reconnecting in {:?}", reconnect.interval);
        tokio::time::sleep(reconnect.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tether_store::KeyValue;

    fn put(key: &str, value: &str) -> WatchEvent {
        WatchEvent {
            event_type: EventType::Put,
            kv: KeyValue {
                key: key.to_string(),
                value: value.to_string(),
                mod_revision: 4,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_watch_paths_and_roots() {
        let mut router = WatchRouter::new();
        router.register("/a", |_: EventType, _: &str, _: &str| true);
        router.register("/b/c", |_: EventType, _: &str, _: &str| true);
        router.register("/a/b", |_: EventType, _: &str, _: &str| true);
        router.register("/a", |_: EventType, _: &str, _: &str| true);
        router.register("/b", |_: EventType, _: &str, _: &str| true);

        assert_eq!(router.len(), 5);
        assert_eq!(router.watch_paths(), vec!["/a", "/b/c", "/a/b", "/b"]);
        assert_eq!(router.watch_roots(), vec!["/a", "/b"]);
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut router = WatchRouter::new();

        for prefix in ["/a", "/a/b", "/x"] {
            let calls = calls.clone();
            router.register(prefix, move |op: EventType, key: &str, value: &str| {
                calls.lock().push(format!("{}:{}:{}:{}", prefix, op.code(), key, value));
                true
            });
        }

        assert_eq!(router.dispatch(&put("/a/b/c", "v")), 2);
        assert_eq!(
            *calls.lock(),
            vec!["/a:0:/a/b/c:v".to_string(), "/a/b:0:/a/b/c:v".to_string()]
        );
    }

    #[test]
    fn test_failing_handler_is_soft() {
        let mut router = WatchRouter::new();
        router.register("/k", |_: EventType, _: &str, _: &str| false);
        assert_eq!(router.dispatch(&put("/k/1", "v")), 1);
        assert_eq!(router.dispatch(&put("/other", "v")), 0);
    }

    #[test]
    fn test_resume_after() {
        assert_eq!(resume_after(10, &[put("/a", "1")]), 5);
        assert_eq!(resume_after(10, &[]), 11);
    }
}
