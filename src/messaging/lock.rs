//! Per-conversation send lock
//!
//! A single advisory lock document serializes all byte allocation for a
//! conversation across every device. Acquisition is a transaction: create if
//! absent, steal if the holder's lease is older than the TTL, otherwise back
//! off. A crashed holder therefore blocks sends for at most the TTL.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{paths, DocumentStore, TxnVerdict};
use crate::utils::now_ms;
use crate::PeerId;

/// Lock document body; its creation time is the server timestamp of the write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDoc {
    pub locker_id: PeerId,
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease age after which a lock may be stolen
    pub ttl: Duration,
    /// Back-off before each retry; attempts = delays + 1
    pub retry_delays: Vec<Duration>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(10),
            ],
        }
    }
}

#[derive(Clone)]
pub struct SendLock {
    store: Arc<dyn DocumentStore>,
    config: LockConfig,
}

impl SendLock {
    pub fn new(store: Arc<dyn DocumentStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Acquire the lock, retrying on the configured schedule
    pub async fn acquire(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        let attempts = self.config.retry_delays.len() + 1;
        for attempt in 0..attempts {
            if self.try_acquire(conversation_id, user_id).await? {
                debug!(conversation_id, attempt, "send lock acquired");
                return Ok(());
            }
            if attempt < self.config.retry_delays.len() {
                tokio::time::sleep(self.config.retry_delays[attempt]).await;
            }
        }
        warn!(conversation_id, "send lock exhausted all attempts");
        Err(Error::LockAcquisition(format!(
            "conversation {} is locked by another participant",
            conversation_id
        )))
    }

    /// One transactional attempt: create, steal an expired lease, or fail
    pub async fn try_acquire(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        let ttl_ms = self.config.ttl.as_millis() as u64;
        let outcome = self
            .store
            .transact(
                &paths::locks(conversation_id),
                paths::LOCK_DOC_ID,
                &mut |cur| match cur {
                    None => match serde_json::to_value(LockDoc {
                        locker_id: user_id.to_string(),
                    }) {
                        Ok(v) => TxnVerdict::Write(v),
                        Err(_) => TxnVerdict::Abort,
                    },
                    Some(doc) => {
                        if now_ms().saturating_sub(doc.server_ts) >= ttl_ms {
                            // stale holder; steal the lease
                            match serde_json::to_value(LockDoc {
                                locker_id: user_id.to_string(),
                            }) {
                                Ok(v) => TxnVerdict::Write(v),
                                Err(_) => TxnVerdict::Abort,
                            }
                        } else {
                            TxnVerdict::Abort
                        }
                    }
                },
            )
            .await?;
        Ok(outcome.committed())
    }

    /// Delete the lock iff this user still holds it
    pub async fn release(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.store
            .transact(
                &paths::locks(conversation_id),
                paths::LOCK_DOC_ID,
                &mut |cur| {
                    let Some(doc) = cur else {
                        return TxnVerdict::Abort;
                    };
                    let held_by_us = serde_json::from_value::<LockDoc>(doc.data.clone())
                        .map(|lock| lock.locker_id == user_id)
                        .unwrap_or(false);
                    if held_by_us {
                        TxnVerdict::Delete
                    } else {
                        TxnVerdict::Abort
                    }
                },
            )
            .await?;
        debug!(conversation_id, "send lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn quick_config() -> LockConfig {
        LockConfig {
            ttl: Duration::from_millis(100),
            retry_delays: vec![Duration::from_millis(5), Duration::from_millis(5)],
        }
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let lock = SendLock::new(store.clone(), quick_config());

        lock.acquire("c1", "alice").await.unwrap();
        // holder can release, others cannot
        lock.release("c1", "bob").await.unwrap();
        assert!(store
            .read(&paths::locks("c1"), paths::LOCK_DOC_ID)
            .await
            .unwrap()
            .is_some());
        lock.release("c1", "alice").await.unwrap();
        assert!(store
            .read(&paths::locks("c1"), paths::LOCK_DOC_ID)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_contention_exhausts_retries() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let lock = SendLock::new(store, quick_config());

        lock.acquire("c1", "alice").await.unwrap();
        let err = lock.acquire("c1", "bob").await.unwrap_err();
        assert!(matches!(err, Error::LockAcquisition(_)));
    }

    #[tokio::test]
    async fn test_stale_lock_is_stolen() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let lock = SendLock::new(store, quick_config());

        lock.acquire("c1", "alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        // alice's lease has expired; bob steals it on the first attempt
        assert!(lock.try_acquire("c1", "bob").await.unwrap());
    }

    #[tokio::test]
    async fn test_locks_are_per_conversation() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let lock = SendLock::new(store, quick_config());

        lock.acquire("c1", "alice").await.unwrap();
        lock.acquire("c2", "bob").await.unwrap();
    }
}
