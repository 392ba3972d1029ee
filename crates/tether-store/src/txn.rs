//! Conditional transactions: `If(compares) Then(ops) Else(ops)`

use crate::model::{KeyValue, LeaseId, Revision};

/// What a [`Compare`] looks at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompareTarget {
    CreateRevision(Revision),
    ModRevision(Revision),
    Version(i64),
    Value(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareResult {
    Equal,
    NotEqual,
    Greater,
    Less,
}

impl CompareResult {
    fn holds<T: Ord>(self, actual: T, expected: T) -> bool {
        match self {
            CompareResult::Equal => actual == expected,
            CompareResult::NotEqual => actual != expected,
            CompareResult::Greater => actual > expected,
            CompareResult::Less => actual < expected,
        }
    }
}

/// A guard evaluated against the current state of one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub result: CompareResult,
    pub target: CompareTarget,
}

impl Compare {
    pub fn create_revision(key: impl Into<String>, result: CompareResult, revision: Revision) -> Self {
        Self {
            key: key.into(),
            result,
            target: CompareTarget::CreateRevision(revision),
        }
    }

    pub fn mod_revision(key: impl Into<String>, result: CompareResult, revision: Revision) -> Self {
        Self {
            key: key.into(),
            result,
            target: CompareTarget::ModRevision(revision),
        }
    }

    pub fn version(key: impl Into<String>, result: CompareResult, version: i64) -> Self {
        Self {
            key: key.into(),
            result,
            target: CompareTarget::Version(version),
        }
    }

    pub fn value(key: impl Into<String>, result: CompareResult, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            result,
            target: CompareTarget::Value(value.into()),
        }
    }

    /// Evaluate against the key's current state. A missing key has zero
    /// revisions and version; value comparisons on a missing key fail.
    pub fn evaluate(&self, current: Option<&KeyValue>) -> bool {
        match &self.target {
            CompareTarget::CreateRevision(rev) => self
                .result
                .holds(current.map_or(0, |kv| kv.create_revision), *rev),
            CompareTarget::ModRevision(rev) => self
                .result
                .holds(current.map_or(0, |kv| kv.mod_revision), *rev),
            CompareTarget::Version(version) => self
                .result
                .holds(current.map_or(0, |kv| kv.version), *version),
            CompareTarget::Value(value) => match current {
                Some(kv) => self.result.holds(kv.value.as_str(), value.as_str()),
                None => false,
            },
        }
    }
}

/// An operation executed by a transaction branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: String,
        lease: Option<LeaseId>,
    },
    Get {
        key: String,
        prefix: bool,
    },
    Delete {
        key: String,
        prefix: bool,
    },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<String>, lease: Option<LeaseId>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease,
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        TxnOp::Get {
            key: key.into(),
            prefix: false,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete {
            key: key.into(),
            prefix: false,
        }
    }
}

/// A transaction request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Txn {
    pub compare: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: impl IntoIterator<Item = Compare>) -> Self {
        self.compare.extend(compare);
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.failure.extend(ops);
        self
    }

    /// Create `key` under `lease` unless it exists; otherwise read it back.
    pub fn create_if_absent(key: &str, value: &str, lease: LeaseId) -> Self {
        Txn::new()
            .when([Compare::create_revision(key, CompareResult::Equal, 0)])
            .and_then([TxnOp::put(key, value, Some(lease))])
            .or_else([TxnOp::get(key)])
    }
}

/// Result of one branch operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnOpResponse {
    Put { revision: Revision },
    Range(Vec<KeyValue>),
    Delete { deleted: i64 },
}

/// Result of a committed transaction.
#[derive(Clone, Debug, Default)]
pub struct TxnResponse {
    /// Whether every compare held and the success branch ran
    pub succeeded: bool,
    pub revision: Revision,
    pub responses: Vec<TxnOpResponse>,
}

impl TxnResponse {
    /// Key-values returned by the range operation at `index`, if it was one.
    pub fn range(&self, index: usize) -> Option<&[KeyValue]> {
        match self.responses.get(index) {
            Some(TxnOpResponse::Range(kvs)) => Some(kvs.as_slice()),
            _ => None,
        }
    }

    /// First key-value returned by the range operation at `index`.
    pub fn first_kv(&self, index: usize) -> Option<&KeyValue> {
        self.range(index).and_then(|kvs| kvs.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(create: Revision, modr: Revision, version: i64, value: &str) -> KeyValue {
        KeyValue {
            key: "k".to_string(),
            value: value.to_string(),
            create_revision: create,
            mod_revision: modr,
            version,
            lease: 0,
        }
    }

    #[test]
    fn test_create_revision_on_missing_key() {
        let cmp = Compare::create_revision("k", CompareResult::Equal, 0);
        assert!(cmp.evaluate(None));
        assert!(!cmp.evaluate(Some(&kv(3, 3, 1, "v"))));
    }

    #[test]
    fn test_ordering_compares() {
        let current = kv(3, 8, 2, "b");
        assert!(Compare::mod_revision("k", CompareResult::Greater, 5).evaluate(Some(&current)));
        assert!(Compare::version("k", CompareResult::Less, 3).evaluate(Some(&current)));
        assert!(Compare::value("k", CompareResult::NotEqual, "a").evaluate(Some(&current)));
        assert!(!Compare::value("k", CompareResult::Equal, "a").evaluate(None));
    }

    #[test]
    fn test_create_if_absent_shape() {
        let txn = Txn::create_if_absent("/lock.lease", "holder-1", 42);
        assert_eq!(txn.compare.len(), 1);
        assert_eq!(
            txn.success,
            vec![TxnOp::put("/lock.lease", "holder-1", Some(42))]
        );
        assert_eq!(txn.failure, vec![TxnOp::get("/lock.lease")]);
    }

    #[test]
    fn test_response_range_accessors() {
        let resp = TxnResponse {
            succeeded: false,
            revision: 9,
            responses: vec![TxnOpResponse::Range(vec![kv(2, 2, 1, "holder")])],
        };
        assert_eq!(resp.first_kv(0).map(|kv| kv.value.as_str()), Some("holder"));
        assert!(resp.range(1).is_none());
    }
}
