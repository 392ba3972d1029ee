//! Coordinator bootstrap tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tether_client::{ClientError, Coordinator};
use tether_common::ClientConfig;
use tether_store::{
    GetResponse, KeepAliveStream, LeaseGrant, LeaseId, MemoryStore, Revision, StoreError,
    StoreGateway, Txn, TxnResponse, WatchOptions, WatchStream,
};

/// Gateway whose writes never complete.
struct StalledGateway;

#[async_trait]
impl StoreGateway for StalledGateway {
    async fn put(&self, _key: &str, _value: &str, _lease: Option<LeaseId>) -> tether_store::error::Result<Revision> {
        std::future::pending().await
    }

    async fn delete(&self, _key: &str, _prefix: bool) -> tether_store::error::Result<i64> {
        std::future::pending().await
    }

    async fn get(&self, _key: &str, _prefix: bool) -> tether_store::error::Result<GetResponse> {
        std::future::pending().await
    }

    async fn txn(&self, _txn: Txn) -> tether_store::error::Result<TxnResponse> {
        std::future::pending().await
    }

    async fn lease_grant(&self, _ttl: i64) -> tether_store::error::Result<LeaseGrant> {
        Err(StoreError::Unavailable("stalled".to_string()))
    }

    async fn lease_keep_alive(&self, id: LeaseId) -> tether_store::error::Result<KeepAliveStream> {
        Err(StoreError::LeaseNotFound(id))
    }

    async fn lease_revoke(&self, id: LeaseId) -> tether_store::error::Result<()> {
        Err(StoreError::LeaseNotFound(id))
    }

    async fn watch(&self, _key: &str, _options: WatchOptions) -> tether_store::error::Result<WatchStream> {
        Err(StoreError::Closed)
    }
}

fn config() -> ClientConfig {
    let mut config = ClientConfig::from_endpoints("127.0.0.1:2379").unwrap();
    config.ping_timeout_ms = 100;
    config
}

#[tokio::test]
async fn test_init_succeeds_when_store_answers() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::with_gateway(config(), store.clone());
    coordinator.init().await.unwrap();

    let ping = store.get("/etc/service/ping", false).await.unwrap();
    assert_eq!(ping.kvs.len(), 1);
}

#[tokio::test]
async fn test_init_times_out_on_stalled_store() {
    let coordinator = Coordinator::with_gateway(config(), Arc::new(StalledGateway));
    let started = std::time::Instant::now();

    let err = coordinator.init().await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(d) if d == Duration::from_millis(100)));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_connect_rejects_empty_endpoints() {
    let err = Coordinator::connect(ClientConfig::default()).await.err().unwrap();
    assert!(matches!(err, ClientError::Config(_)));
}

#[tokio::test]
async fn test_connect_fails_on_unreachable_store() {
    let mut config = ClientConfig::from_endpoints("127.0.0.1:1").unwrap();
    config.dial_timeout_ms = 200;
    config.ping_timeout_ms = 1000;

    let err = Coordinator::connect(config).await.err().unwrap();
    assert!(matches!(
        err,
        ClientError::Backend(_) | ClientError::Timeout(_)
    ));
}

#[tokio::test]
async fn test_custom_ping_path() {
    let store = Arc::new(MemoryStore::new());
    let mut config = config();
    config.ping_path = "/health/node-1".to_string();

    let coordinator = Coordinator::with_gateway(config, store.clone());
    coordinator.ping().await.unwrap();
    assert_eq!(store.get("/health/node-1", false).await.unwrap().kvs.len(), 1);
}
