//! Key lifecycle engine
//!
//! The single owner of on-disk keystream state. Loads and saves the
//! bytes/metadata/history triple, and performs the consume-and-truncate step
//! that erases spent key material from the device.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::key::history::KeyHistory;
use crate::key::SharedKey;
use crate::storage::{KeyMeta, LocalStore};

pub struct KeyLifecycle {
    store: Arc<LocalStore>,
}

impl KeyLifecycle {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// Persist bytes, history and metadata. The metadata write lands last and
    /// acts as the commit point for readers.
    pub async fn save_key(&self, key: &SharedKey) -> Result<()> {
        key.validate_state()?;
        self.store.write_key_bytes(key.id(), key.bytes()).await?;
        self.store.write_history(key.id(), key.history()).await?;
        self.store
            .write_key_meta(
                key.id(),
                &KeyMeta {
                    id: key.id().to_string(),
                    peer_ids: key.peer_ids().to_vec(),
                    created_at: key.created_at(),
                    next_available_byte: key.next_available_byte(),
                },
            )
            .await?;
        info!(
            conversation_id = key.id(),
            available = key.available_len(),
            next = key.next_available_byte(),
            "key saved"
        );
        Ok(())
    }

    /// Load and validate the key for a conversation
    pub async fn get_key(&self, conversation_id: &str) -> Result<SharedKey> {
        let meta = self
            .store
            .read_key_meta(conversation_id)
            .await?
            .ok_or_else(|| Error::KeyNotFound(conversation_id.to_string()))?;
        let history = self
            .store
            .read_history(conversation_id)
            .await?
            .unwrap_or_else(|| KeyHistory::new(conversation_id));
        let bytes = self
            .store
            .read_key_bytes(conversation_id)
            .await?
            .unwrap_or_default();

        let key = SharedKey::new(
            meta.id,
            bytes,
            meta.peer_ids,
            meta.created_at,
            history,
            meta.next_available_byte,
        )?;
        key.validate_state()?;
        Ok(key)
    }

    pub async fn has_key(&self, conversation_id: &str) -> bool {
        matches!(self.store.read_key_meta(conversation_id).await, Ok(Some(_)))
    }

    /// Record consumption of `[start, end)`, truncate the keystream file by
    /// the newly consumed amount, and persist the updated sidecars.
    pub async fn update_used_bytes(
        &self,
        conversation_id: &str,
        start: u64,
        end: u64,
        reason: &str,
        ref_id: Option<String>,
    ) -> Result<SharedKey> {
        let mut key = self.get_key(conversation_id).await?;
        let removed = key.mark_bytes_as_used(start, end, reason, ref_id)?;
        if removed == 0 {
            debug!(conversation_id, start, end, "range already consumed");
            return Ok(key);
        }

        self.store
            .truncate_key_prefix(conversation_id, removed)
            .await?;
        self.store.write_history(conversation_id, key.history()).await?;
        self.store
            .write_key_meta(
                conversation_id,
                &KeyMeta {
                    id: key.id().to_string(),
                    peer_ids: key.peer_ids().to_vec(),
                    created_at: key.created_at(),
                    next_available_byte: key.next_available_byte(),
                },
            )
            .await?;

        debug!(
            conversation_id,
            removed,
            next = key.next_available_byte(),
            reason,
            "key bytes consumed"
        );
        Ok(key)
    }

    /// Remove the key triple from disk (conversation teardown)
    pub async fn delete_key(&self, conversation_id: &str) -> Result<()> {
        self.store.delete_key_files(conversation_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn engine() -> (TempDir, KeyLifecycle) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).await.unwrap());
        (dir, KeyLifecycle::new(store))
    }

    fn fresh_key(n: usize) -> SharedKey {
        SharedKey::from_kex(
            "conv",
            (0..n).map(|i| i as u8).collect(),
            vec!["p1".into(), "p2".into()],
            "kex-1",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (_dir, engine) = engine().await;
        engine.save_key(&fresh_key(128)).await.unwrap();

        let loaded = engine.get_key("conv").await.unwrap();
        assert_eq!(loaded.available_len(), 128);
        assert_eq!(loaded.next_available_byte(), 0);
        assert_eq!(loaded.peer_ids(), &["p1".to_string(), "p2".to_string()]);
        assert_eq!(loaded.history().operations().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_key() {
        let (_dir, engine) = engine().await;
        assert!(matches!(
            engine.get_key("nope").await,
            Err(Error::KeyNotFound(_))
        ));
        assert!(!engine.has_key("nope").await);
    }

    #[tokio::test]
    async fn test_update_used_bytes_truncates_prefix() {
        let (dir, engine) = engine().await;
        engine.save_key(&fresh_key(128)).await.unwrap();

        let key = engine
            .update_used_bytes("conv", 0, 48, "send", Some("0-48".into()))
            .await
            .unwrap();
        assert_eq!(key.next_available_byte(), 48);
        assert_eq!(key.available_len(), 80);

        // prefix truncation is visible on disk
        let store = LocalStore::open(dir.path()).await.unwrap();
        let bytes = store.read_key_bytes("conv").await.unwrap().unwrap();
        assert_eq!(bytes.len(), 80);
        assert_eq!(bytes[0], 48);

        // a reload agrees with the in-memory result
        let reloaded = engine.get_key("conv").await.unwrap();
        assert_eq!(reloaded.next_available_byte(), 48);
        reloaded.validate_state().unwrap();
    }

    #[tokio::test]
    async fn test_consume_everything_removes_file() {
        let (dir, engine) = engine().await;
        engine.save_key(&fresh_key(64)).await.unwrap();
        engine
            .update_used_bytes("conv", 0, 64, "send", None)
            .await
            .unwrap();

        let store = LocalStore::open(dir.path()).await.unwrap();
        assert!(store.read_key_bytes("conv").await.unwrap().is_none());

        let key = engine.get_key("conv").await.unwrap();
        assert_eq!(key.available_len(), 0);
        assert_eq!(key.next_available_byte(), 64);
    }

    #[tokio::test]
    async fn test_corrupted_frontier_detected_on_load() {
        let (dir, engine) = engine().await;
        engine.save_key(&fresh_key(64)).await.unwrap();

        // tamper with the frontier behind the engine's back
        let store = LocalStore::open(dir.path()).await.unwrap();
        let mut meta = store.read_key_meta("conv").await.unwrap().unwrap();
        meta.next_available_byte = 10;
        store.write_key_meta("conv", &meta).await.unwrap();

        assert!(matches!(
            engine.get_key("conv").await,
            Err(Error::KeyCorrupted(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_key() {
        let (_dir, engine) = engine().await;
        engine.save_key(&fresh_key(16)).await.unwrap();
        engine.delete_key("conv").await.unwrap();
        assert!(!engine.has_key("conv").await);
    }
}
