//! On-device persistent state
//!
//! Per conversation, a directory holding the raw keystream prefix plus JSON
//! sidecars for metadata, history, decrypted messages, ack ids and the
//! read-set. Every write is atomic: write to a temp file, fsync, rename.
//! The keystream file only ever shrinks from the front.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::messaging::LocalMessage;
use crate::{ConversationId, MessageId, PeerId};

const KEY_FILE: &str = "key.bin";
const KEY_META_FILE: &str = "key_meta.json";
const HISTORY_FILE: &str = "history.json";
const MESSAGES_DIR: &str = "messages";
const ACKS_FILE: &str = "acks.json";
const READ_MESSAGES_FILE: &str = "read_messages.json";

/// Sidecar for the keystream file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMeta {
    pub id: ConversationId,
    pub peer_ids: Vec<PeerId>,
    pub created_at: u64,
    pub next_available_byte: u64,
}

/// Root of the local state tree: `<root>/conversations/{id}/...`
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open (creating if needed) a local store rooted at `root`
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;

        // Keystream material is secret; keep the tree private (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700)).await?;
        }

        Ok(Self { root })
    }

    fn conversation_dir(&self, conversation_id: &str) -> PathBuf {
        self.root.join("conversations").join(conversation_id)
    }

    async fn ensure_conversation_dir(&self, conversation_id: &str) -> Result<PathBuf> {
        let dir = self.conversation_dir(conversation_id);
        tokio::fs::create_dir_all(dir.join(MESSAGES_DIR)).await?;
        Ok(dir)
    }

    // ---- keystream bytes ----

    pub async fn write_key_bytes(&self, conversation_id: &str, bytes: &[u8]) -> Result<()> {
        let dir = self.ensure_conversation_dir(conversation_id).await?;
        atomic_write(&dir.join(KEY_FILE), bytes).await
    }

    pub async fn read_key_bytes(&self, conversation_id: &str) -> Result<Option<Vec<u8>>> {
        read_optional(&self.conversation_dir(conversation_id).join(KEY_FILE)).await
    }

    /// Drop the first `n` bytes of the keystream file; delete it when `n`
    /// covers the whole file.
    pub async fn truncate_key_prefix(&self, conversation_id: &str, n: u64) -> Result<()> {
        let path = self.conversation_dir(conversation_id).join(KEY_FILE);
        let Some(bytes) = read_optional(&path).await? else {
            return Ok(());
        };
        if n >= bytes.len() as u64 {
            tokio::fs::remove_file(&path).await?;
            debug!(conversation_id, "keystream exhausted, file removed");
            return Ok(());
        }
        atomic_write(&path, &bytes[n as usize..]).await
    }

    pub async fn key_len(&self, conversation_id: &str) -> Result<u64> {
        let path = self.conversation_dir(conversation_id).join(KEY_FILE);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    // ---- sidecars ----

    pub async fn write_key_meta(&self, conversation_id: &str, meta: &KeyMeta) -> Result<()> {
        let dir = self.ensure_conversation_dir(conversation_id).await?;
        write_json(&dir.join(KEY_META_FILE), meta).await
    }

    pub async fn read_key_meta(&self, conversation_id: &str) -> Result<Option<KeyMeta>> {
        read_json(&self.conversation_dir(conversation_id).join(KEY_META_FILE)).await
    }

    pub async fn write_history(
        &self,
        conversation_id: &str,
        history: &crate::key::history::KeyHistory,
    ) -> Result<()> {
        let dir = self.ensure_conversation_dir(conversation_id).await?;
        write_json(&dir.join(HISTORY_FILE), history).await
    }

    pub async fn read_history(
        &self,
        conversation_id: &str,
    ) -> Result<Option<crate::key::history::KeyHistory>> {
        read_json(&self.conversation_dir(conversation_id).join(HISTORY_FILE)).await
    }

    pub async fn delete_key_files(&self, conversation_id: &str) -> Result<()> {
        let dir = self.conversation_dir(conversation_id);
        for name in [KEY_FILE, KEY_META_FILE, HISTORY_FILE] {
            match tokio::fs::remove_file(dir.join(name)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // ---- messages ----

    pub async fn write_message(&self, conversation_id: &str, message: &LocalMessage) -> Result<()> {
        let dir = self.ensure_conversation_dir(conversation_id).await?;
        let path = dir.join(MESSAGES_DIR).join(format!("{}.json", message.id));
        write_json(&path, message).await
    }

    pub async fn read_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Option<LocalMessage>> {
        let path = self
            .conversation_dir(conversation_id)
            .join(MESSAGES_DIR)
            .join(format!("{}.json", message_id));
        read_json(&path).await
    }

    pub async fn has_message(&self, conversation_id: &str, message_id: &str) -> bool {
        self.conversation_dir(conversation_id)
            .join(MESSAGES_DIR)
            .join(format!("{}.json", message_id))
            .exists()
    }

    pub async fn list_message_ids(&self, conversation_id: &str) -> Result<Vec<MessageId>> {
        let dir = self.conversation_dir(conversation_id).join(MESSAGES_DIR);
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    // ---- acks and read-set ----

    pub async fn read_acks(&self, conversation_id: &str) -> Result<BTreeMap<MessageId, String>> {
        Ok(
            read_json(&self.conversation_dir(conversation_id).join(ACKS_FILE))
                .await?
                .unwrap_or_default(),
        )
    }

    pub async fn record_ack(
        &self,
        conversation_id: &str,
        message_id: &str,
        ack_id: &str,
    ) -> Result<()> {
        let dir = self.ensure_conversation_dir(conversation_id).await?;
        let mut acks = self.read_acks(conversation_id).await?;
        acks.insert(message_id.to_string(), ack_id.to_string());
        write_json(&dir.join(ACKS_FILE), &acks).await
    }

    pub async fn read_read_messages(&self, conversation_id: &str) -> Result<Vec<MessageId>> {
        Ok(
            read_json(&self.conversation_dir(conversation_id).join(READ_MESSAGES_FILE))
                .await?
                .unwrap_or_default(),
        )
    }

    /// Add a message id to the read-set; returns false if it was already there
    pub async fn mark_message_read(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<bool> {
        let dir = self.ensure_conversation_dir(conversation_id).await?;
        let mut read = self.read_read_messages(conversation_id).await?;
        if read.iter().any(|id| id == message_id) {
            return Ok(false);
        }
        read.push(message_id.to_string());
        write_json(&dir.join(READ_MESSAGES_FILE), &read).await?;
        Ok(true)
    }

    /// Remove everything this device holds for a conversation
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let dir = self.conversation_dir(conversation_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes).await
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match read_optional(path).await? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| {
                Error::KeyCorrupted(format!("unreadable state file {}: {}", path.display(), e))
            })?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}
