//! Data types exchanged with the backing store

use std::collections::HashMap;
use std::fmt;

/// Store-wide modification counter
pub type Revision = i64;

/// Lease identifier, 0 means "no lease"
pub type LeaseId = i64;

/// A stored key with its revision metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Revision of the write that created the key
    pub create_revision: Revision,
    /// Revision of the last write to the key
    pub mod_revision: Revision,
    /// Number of writes since creation
    pub version: i64,
    pub lease: LeaseId,
}

/// Result of a range read.
#[derive(Clone, Debug, Default)]
pub struct GetResponse {
    /// Store revision at the time of the read
    pub revision: Revision,
    pub kvs: Vec<KeyValue>,
}

impl GetResponse {
    /// Flatten to `key -> value`.
    pub fn to_map(&self) -> HashMap<String, String> {
        self.kvs
            .iter()
            .map(|kv| (kv.key.clone(), kv.value.clone()))
            .collect()
    }

    pub fn first(&self) -> Option<&KeyValue> {
        self.kvs.first()
    }
}

/// A granted lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: LeaseId,
    /// Granted TTL in seconds
    pub ttl: i64,
}

/// One keep-alive answer. A non-positive TTL means the lease is gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub id: LeaseId,
    pub ttl: i64,
}

impl KeepAliveResponse {
    pub fn is_expired(&self) -> bool {
        self.ttl <= 0
    }
}

/// Kind of change carried by a watch event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Put,
    Delete,
}

impl EventType {
    /// Numeric operation code handed to change handlers: Put=0, Delete=1.
    pub fn code(self) -> i32 {
        match self {
            EventType::Put => 0,
            EventType::Delete => 1,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Put => write!(f, "PUT"),
            EventType::Delete => write!(f, "DELETE"),
        }
    }
}

/// A single key mutation observed by a watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: EventType,
    /// For deletes only `key` and `mod_revision` are meaningful
    pub kv: KeyValue,
}

/// A batch of events sharing a store revision.
#[derive(Clone, Debug, Default)]
pub struct WatchResponse {
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
}

/// Options for opening a watch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Watch every key starting with the given key
    pub prefix: bool,
    /// Replay events from this revision on; `None` watches from now
    pub start_revision: Option<Revision>,
}

impl WatchOptions {
    pub fn key() -> Self {
        Self::default()
    }

    pub fn prefix() -> Self {
        Self {
            prefix: true,
            start_revision: None,
        }
    }

    pub fn from_revision(mut self, revision: Option<Revision>) -> Self {
        self.start_revision = revision;
        self
    }

    /// Whether `key` falls in the watched range of `watched`.
    pub fn matches(&self, watched: &str, key: &str) -> bool {
        if self.prefix {
            key.starts_with(watched)
        } else {
            key == watched
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_codes() {
        assert_eq!(EventType::Put.code(), 0);
        assert_eq!(EventType::Delete.code(), 1);
        assert_eq!(EventType::Delete.to_string(), "DELETE");
    }

    #[test]
    fn test_get_response_to_map() {
        let resp = GetResponse {
            revision: 7,
            kvs: vec![
                KeyValue {
                    key: "/svc/a".to_string(),
                    value: "1".to_string(),
                    ..Default::default()
                },
                KeyValue {
                    key: "/svc/b".to_string(),
                    value: "2".to_string(),
                    ..Default::default()
                },
            ],
        };
        let map = resp.to_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map["/svc/b"], "2");
        assert_eq!(resp.first().map(|kv| kv.key.as_str()), Some("/svc/a"));
    }

    #[test]
    fn test_watch_options_matching() {
        let prefix = WatchOptions::prefix().from_revision(Some(4));
        assert_eq!(prefix.start_revision, Some(4));
        assert!(prefix.matches("/a", "/a/b"));
        assert!(prefix.matches("/a", "/ab"));
        assert!(!prefix.matches("/a/b", "/a"));

        let exact = WatchOptions::key();
        assert!(exact.matches("/a", "/a"));
        assert!(!exact.matches("/a", "/a/b"));
    }

    #[test]
    fn test_keep_alive_expiry() {
        assert!(KeepAliveResponse { id: 1, ttl: 0 }.is_expired());
        assert!(!KeepAliveResponse { id: 1, ttl: 5 }.is_expired());
    }
}
