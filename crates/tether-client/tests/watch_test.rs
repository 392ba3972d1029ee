//! Watch router integration tests against the in-memory store

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_client::{Coordinator, WatchRouter};
use tether_common::{ClientConfig, RetryPolicy};
use tether_store::{EventType, MemoryStore, StoreGateway};

type Seen = Arc<Mutex<Vec<String>>>;

fn recorder(label: &'static str, seen: Seen) -> impl Fn(EventType, &str, &str) -> bool + Send + Sync + 'static {
    move |op: EventType, key: &str, value: &str| {
        seen.lock()
            .push(format!("{} {} {} {}", label, op.code(), key, value));
        true
    }
}

async fn wait_for_len(seen: &Seen, len: usize) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while seen.lock().len() < len {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {} events, got {:?}", len, seen.lock()));
}

#[tokio::test]
async fn test_overlapping_prefixes_deliver_once_in_order() {
    let store = Arc::new(MemoryStore::new());
    let seen: Seen = Arc::default();

    let mut router = WatchRouter::new();
    router.register("/a", recorder("first", seen.clone()));
    router.register("/a/b", recorder("second", seen.clone()));
    let tasks = router.start(store.clone());
    assert_eq!(tasks.roots(), vec!["/a"]);

    while store.watcher_count() < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    store.put("/a/b/c", "v1", None).await.unwrap();
    wait_for_len(&seen, 2).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        *seen.lock(),
        vec!["first 0 /a/b/c v1".to_string(), "second 0 /a/b/c v1".to_string()]
    );
    tasks.abort();
}

#[tokio::test]
async fn test_delete_events_carry_op_code() {
    let store = Arc::new(MemoryStore::new());
    let seen: Seen = Arc::default();

    let mut router = WatchRouter::new();
    router.register("/svc/", recorder("svc", seen.clone()));
    let tasks = router.start(store.clone());
    while store.watcher_count() < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    store.put("/svc/node", "up", None).await.unwrap();
    store.delete("/svc/node", false).await.unwrap();
    store.put("/other", "ignored", None).await.unwrap();
    wait_for_len(&seen, 2).await;

    assert_eq!(
        *seen.lock(),
        vec!["svc 0 /svc/node up".to_string(), "svc 1 /svc/node ".to_string()]
    );
    tasks.abort();
}

#[tokio::test]
async fn test_reconnect_does_not_lose_events() {
    let store = Arc::new(MemoryStore::new());
    let seen: Seen = Arc::default();

    let mut router = WatchRouter::with_reconnect(RetryPolicy::unbounded(Duration::from_millis(100)));
    router.register("/r/", recorder("r", seen.clone()));
    let tasks = router.start(store.clone());
    while store.watcher_count() < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    store.put("/r/1", "before", None).await.unwrap();
    wait_for_len(&seen, 1).await;

    assert_eq!(store.close_watches(), 1);
    store.put("/r/2", "during", None).await.unwrap();
    wait_for_len(&seen, 2).await;

    while store.watcher_count() < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    store.put("/r/3", "after", None).await.unwrap();
    wait_for_len(&seen, 3).await;

    assert_eq!(
        *seen.lock(),
        vec![
            "r 0 /r/1 before".to_string(),
            "r 0 /r/2 during".to_string(),
            "r 0 /r/3 after".to_string(),
        ]
    );
    tasks.abort();
}

#[tokio::test]
async fn test_bounded_reconnect_gives_up() {
    let store = Arc::new(MemoryStore::new());
    let seen: Seen = Arc::default();

    let mut router = WatchRouter::with_reconnect(
        RetryPolicy::unbounded(Duration::from_millis(10)).with_max_attempts(1),
    );
    router.register("/g/", recorder("g", seen.clone()));
    let tasks = router.start(store.clone());
    while store.watcher_count() < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    store.close_watches();
    tokio::time::timeout(Duration::from_secs(1), tasks.join())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_coordinator_register_and_watch() {
    let store = Arc::new(MemoryStore::new());
    let seen: Seen = Arc::default();
    let config = ClientConfig::from_endpoints("127.0.0.1:2379").unwrap();
    let coordinator = Coordinator::with_gateway(config, store.clone());

    coordinator.watch_register("/cfg/", recorder("cfg", seen.clone()));
    coordinator.watch_register("/cfg/db/", recorder("db", seen.clone()));
    coordinator.watch_register("/flags/", recorder("flags", seen.clone()));
    let tasks = coordinator.do_watch();
    assert_eq!(tasks.len(), 2);

    while store.watcher_count() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    coordinator.put("/cfg/db/url", "pg").await.unwrap();
    wait_for_len(&seen, 2).await;
    coordinator.put("/flags/x", "on").await.unwrap();
    wait_for_len(&seen, 3).await;

    let seen = seen.lock().clone();
    assert_eq!(&seen[..2], &["cfg 0 /cfg/db/url pg", "db 0 /cfg/db/url pg"]);
    assert_eq!(seen[2], "flags 0 /flags/x on");
    tasks.abort();
}
