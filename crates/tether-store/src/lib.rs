//! Tether Store - gateway to the backing key-value store
//!
//! This crate provides:
//! - The `StoreGateway` trait: KV, lease, transaction and watch primitives
//! - An etcd v3 gateway speaking the JSON/HTTP API with endpoint failover
//! - An in-process `MemoryStore` with the same semantics, for tests and local runs

pub mod error;
pub mod etcd;
pub mod gateway;
pub mod memory;
pub mod model;
pub mod txn;

pub use error::StoreError;
pub use etcd::EtcdGateway;
pub use gateway::{KeepAliveStream, StoreGateway, WatchStream};
pub use memory::MemoryStore;
pub use model::*;
pub use txn::{Compare, CompareResult, CompareTarget, Txn, TxnOp, TxnOpResponse, TxnResponse};
