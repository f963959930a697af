//! In-memory document store backend
//!
//! Reference implementation of [`DocumentStore`]: collections under a single
//! mutex, a strictly monotone logical clock standing in for server time, and
//! broadcast snapshot fan-out after every mutation. Good enough for tests
//! and for several devices sharing one process.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::store::{CollectionSnapshot, Doc, DocumentStore, TxnFn, TxnOutcome, TxnVerdict};
use crate::utils::now_ms;

const WATCH_CAPACITY: usize = 256;

#[derive(Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<String, Doc>>,
    watchers: HashMap<String, broadcast::Sender<CollectionSnapshot>>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    clock: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock: AtomicU64::new(0),
        }
    }

    /// Server timestamp: wall clock clamped to be strictly monotone
    fn next_ts(&self) -> u64 {
        let now = now_ms();
        let mut current = self.clock.load(Ordering::SeqCst);
        loop {
            let next = current.max(now.saturating_sub(1)) + 1;
            match self
                .clock
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    fn snapshot_locked(inner: &Inner, collection: &str) -> CollectionSnapshot {
        let mut docs: Vec<Doc> = inner
            .collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();
        docs.sort_by(|a, b| (a.server_ts, &a.id).cmp(&(b.server_ts, &b.id)));
        CollectionSnapshot {
            collection: collection.to_string(),
            docs,
        }
    }

    fn notify_locked(inner: &mut Inner, collection: &str) {
        if let Some(sender) = inner.watchers.get(collection) {
            // nobody listening is fine
            let _ = sender.send(Self::snapshot_locked(inner, collection));
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create(&self, collection: &str, id: &str, data: Value) -> Result<Doc> {
        let ts = self.next_ts();
        let mut inner = self.inner.lock();
        let docs = inner.collections.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            return Err(Error::StorePermanent(format!(
                "document {}/{} already exists",
                collection, id
            )));
        }
        let doc = Doc {
            id: id.to_string(),
            data,
            server_ts: ts,
        };
        docs.insert(id.to_string(), doc.clone());
        Self::notify_locked(&mut inner, collection);
        Ok(doc)
    }

    async fn read(&self, collection: &str, id: &str) -> Result<Option<Doc>> {
        let inner = self.inner.lock();
        Ok(inner
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn transact(&self, collection: &str, id: &str, op: TxnFn<'_>) -> Result<TxnOutcome> {
        let ts = self.next_ts();
        let mut inner = self.inner.lock();
        let current = inner
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned();

        match op(current.as_ref()) {
            TxnVerdict::Abort => Ok(TxnOutcome::Aborted),
            TxnVerdict::Delete => {
                if let Some(c) = inner.collections.get_mut(collection) {
                    c.remove(id);
                }
                Self::notify_locked(&mut inner, collection);
                Ok(TxnOutcome::Committed(None))
            }
            TxnVerdict::Write(data) => {
                let doc = Doc {
                    id: id.to_string(),
                    data,
                    server_ts: ts,
                };
                inner
                    .collections
                    .entry(collection.to_string())
                    .or_default()
                    .insert(id.to_string(), doc.clone());
                Self::notify_locked(&mut inner, collection);
                Ok(TxnOutcome::Committed(Some(doc)))
            }
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(c) = inner.collections.get_mut(collection) {
            c.remove(id);
        }
        Self::notify_locked(&mut inner, collection);
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<Doc>> {
        let inner = self.inner.lock();
        Ok(Self::snapshot_locked(&inner, collection).docs)
    }

    fn watch(&self, collection: &str) -> broadcast::Receiver<CollectionSnapshot> {
        let mut inner = self.inner.lock();
        inner
            .watchers
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CAPACITY).0)
            .subscribe()
    }
}
