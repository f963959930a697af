//! Shared document store abstraction
//!
//! The core never talks to a concrete cloud backend; it goes through the
//! capability set `{create, read, transact, delete, watch}` with server
//! timestamps. `ackSet` and `keyStatusPerPeer` updates are only legal through
//! `transact`. The in-memory backend in [`memory`] is the reference
//! implementation used by every test; hosts bind the trait to a real
//! document database.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;

/// Collection path helpers for the document layout
pub mod paths {
    pub const CONVERSATIONS: &str = "conversations";
    pub const KEX: &str = "kex";
    pub const LOCK_DOC_ID: &str = "global";

    pub fn messages(conversation_id: &str) -> String {
        format!("conversations/{}/messages", conversation_id)
    }

    pub fn locks(conversation_id: &str) -> String {
        format!("conversations/{}/locks", conversation_id)
    }
}

/// A stored document plus its server-assigned write timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct Doc {
    pub id: String,
    pub data: Value,
    /// Milliseconds; strictly monotone per backend, assigned on every write
    pub server_ts: u64,
}

/// Decision returned by a transaction closure
pub enum TxnVerdict {
    Write(Value),
    Delete,
    Abort,
}

/// Result of a committed or aborted transaction
#[derive(Debug, Clone, PartialEq)]
pub enum TxnOutcome {
    /// The write (or `None` for a delete) committed
    Committed(Option<Doc>),
    Aborted,
}

impl TxnOutcome {
    pub fn committed(&self) -> bool {
        matches!(self, TxnOutcome::Committed(_))
    }
}

/// One ordered view of a collection, emitted after every mutation
#[derive(Debug, Clone)]
pub struct CollectionSnapshot {
    pub collection: String,
    /// Ascending by `server_ts`
    pub docs: Vec<Doc>,
}

/// Transaction closure: observes the current document (with its server
/// timestamp) and decides the outcome. May run more than once if the backend
/// retries on contention.
pub type TxnFn<'a> = &'a mut (dyn FnMut(Option<&Doc>) -> TxnVerdict + Send);

/// Backend capability set for the shared document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Atomic create; fails if the document already exists
    async fn create(&self, collection: &str, id: &str, data: Value) -> Result<Doc>;

    async fn read(&self, collection: &str, id: &str) -> Result<Option<Doc>>;

    /// Transactional read-modify-write of one document
    async fn transact(&self, collection: &str, id: &str, op: TxnFn<'_>) -> Result<TxnOutcome>;

    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    /// All documents of a collection, ascending by server timestamp
    async fn list(&self, collection: &str) -> Result<Vec<Doc>>;

    /// Subscribe to snapshot updates for a collection
    fn watch(&self, collection: &str) -> broadcast::Receiver<CollectionSnapshot>;
}
