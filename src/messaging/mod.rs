//! Messaging types and pipelines
//!
//! The only object ever published to the shared store is the
//! [`EncryptedMessage`]: a key segment, an opaque ciphertext and a set of
//! anonymous ack markers. Everything else — sender, timestamps, content type,
//! file names — travels inside the encrypted envelope. Decrypted state lives
//! in per-device [`LocalMessage`] records.

pub mod coordinator;
pub mod envelope;
pub mod lock;
pub mod pipeline;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::crypto::ack::{count_kind, AckKind};
use crate::error::{Error, Result};
use crate::key::interval::Interval;
use crate::store::{paths, CollectionSnapshot, Doc, DocumentStore, TxnVerdict};
use crate::{ConversationId, MessageId, PeerId};

/// Decoded message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Image {
        #[serde(with = "crate::utils::base64_bytes")]
        bytes: Vec<u8>,
        file_name: String,
        mime_type: String,
    },
    File {
        #[serde(with = "crate::utils::base64_bytes")]
        bytes: Vec<u8>,
        file_name: String,
        mime_type: String,
    },
    /// Envelope failed to parse after decryption; kept, never acked
    Corrupted,
}

/// Per-device message lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageStatus {
    Observed,
    Decrypted,
    TransferAcked,
    ReadAcked,
    Corrupted,
}

/// Absolute keystream range a message consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySegment {
    pub start_byte: u64,
    pub length_bytes: u64,
}

impl KeySegment {
    pub fn end_byte(&self) -> u64 {
        self.start_byte + self.length_bytes
    }

    /// Message document id: `"{start}-{end}"`
    pub fn doc_id(&self) -> MessageId {
        format!("{}-{}", self.start_byte, self.end_byte())
    }

    pub fn interval(&self, conversation_id: &str) -> Interval {
        Interval {
            conversation_id: conversation_id.to_string(),
            start: self.start_byte,
            end: self.end_byte(),
        }
    }
}

/// The shared-store message document. Sender identity, creation time and
/// content type are all inside `ciphertext`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessage {
    pub key_segment: KeySegment,
    #[serde(with = "crate::utils::base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(default)]
    pub ack_set: BTreeSet<String>,
}

impl EncryptedMessage {
    pub fn doc_id(&self) -> MessageId {
        self.key_segment.doc_id()
    }
}

/// Per-device plaintext record of one message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: PeerId,
    pub created_at_ms: u64,
    pub received_at_ms: u64,
    pub content: MessageContent,
    pub key_segment_start: u64,
    pub key_segment_end: u64,
    pub is_compressed: bool,
    pub status: MessageStatus,
    // cloud mirror
    pub exists_in_cloud: bool,
    pub has_cloud_content: bool,
    pub all_read: bool,
    // this device's anonymous markers on the public ack set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub my_transfer_ack_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub my_read_ack_id: Option<String>,
}

/// What an ack transaction did to the shared document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Ack recorded; flags say whether the cleanup predicates fired
    Applied {
        ciphertext_cleared: bool,
        document_removed: bool,
    },
    /// The document was already deleted; nothing to acknowledge
    AlreadyGone,
}

/// Typed adapter over a conversation's `messages` collection
#[derive(Clone)]
pub struct MessageStore {
    store: Arc<dyn DocumentStore>,
}

impl MessageStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Publish a freshly encrypted message; the id is derived from its segment
    pub async fn publish(
        &self,
        conversation_id: &str,
        message: &EncryptedMessage,
    ) -> Result<()> {
        self.store
            .create(
                &paths::messages(conversation_id),
                &message.doc_id(),
                serde_json::to_value(message)?,
            )
            .await?;
        Ok(())
    }

    pub async fn get(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Option<EncryptedMessage>> {
        match self
            .store
            .read(&paths::messages(conversation_id), message_id)
            .await?
        {
            Some(doc) => Ok(Some(decode_message(&doc)?)),
            None => Ok(None),
        }
    }

    /// All current messages, oldest server timestamp first
    pub async fn list(&self, conversation_id: &str) -> Result<Vec<(EncryptedMessage, u64)>> {
        let docs = self.store.list(&paths::messages(conversation_id)).await?;
        docs.iter()
            .map(|doc| Ok((decode_message(doc)?, doc.server_ts)))
            .collect()
    }

    pub fn watch(&self, conversation_id: &str) -> broadcast::Receiver<CollectionSnapshot> {
        self.store.watch(&paths::messages(conversation_id))
    }

    /// Transactionally add an ack marker and evaluate the cleanup predicates:
    /// a transfer-ack from every participant clears the ciphertext in the
    /// same transaction; a read-ack from every participant deletes the
    /// document.
    pub async fn add_ack(
        &self,
        conversation_id: &str,
        message_id: &str,
        ack_id: &str,
        participants: usize,
    ) -> Result<AckOutcome> {
        let mut fault: Option<Error> = None;
        let mut result = AckOutcome::AlreadyGone;

        self.store
            .transact(&paths::messages(conversation_id), message_id, &mut |cur| {
                let Some(doc) = cur else {
                    result = AckOutcome::AlreadyGone;
                    return TxnVerdict::Abort;
                };
                let mut message: EncryptedMessage = match serde_json::from_value(doc.data.clone())
                {
                    Ok(m) => m,
                    Err(e) => {
                        fault = Some(Error::StorePermanent(format!(
                            "malformed message doc: {}",
                            e
                        )));
                        return TxnVerdict::Abort;
                    }
                };
                message.ack_set.insert(ack_id.to_string());

                let transfers = count_kind(&message.ack_set, AckKind::Transfer);
                let reads = count_kind(&message.ack_set, AckKind::Read);

                if reads >= participants {
                    result = AckOutcome::Applied {
                        ciphertext_cleared: true,
                        document_removed: true,
                    };
                    return TxnVerdict::Delete;
                }

                let cleared = transfers >= participants;
                if cleared {
                    message.ciphertext.clear();
                }
                result = AckOutcome::Applied {
                    ciphertext_cleared: cleared,
                    document_removed: false,
                };
                match serde_json::to_value(&message) {
                    Ok(v) => TxnVerdict::Write(v),
                    Err(e) => {
                        fault = Some(e.into());
                        TxnVerdict::Abort
                    }
                }
            })
            .await?;

        match fault {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }
}

pub(crate) fn decode_message(doc: &Doc) -> Result<EncryptedMessage> {
    serde_json::from_value(doc.data.clone())
        .map_err(|e| Error::StorePermanent(format!("malformed message doc: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ack::generate_ack_id;
    use crate::store::memory::MemoryStore;

    fn message(start: u64, len: u64) -> EncryptedMessage {
        EncryptedMessage {
            key_segment: KeySegment {
                start_byte: start,
                length_bytes: len,
            },
            ciphertext: vec![0xAB; len as usize],
            ack_set: BTreeSet::new(),
        }
    }

    #[test]
    fn test_doc_id_from_segment() {
        assert_eq!(message(0, 48).doc_id(), "0-48");
        assert_eq!(message(48, 100).doc_id(), "48-148");
    }

    #[tokio::test]
    async fn test_publish_and_list_ordered() {
        let store = MessageStore::new(Arc::new(MemoryStore::new()));
        store.publish("c1", &message(0, 10)).await.unwrap();
        store.publish("c1", &message(10, 10)).await.unwrap();

        let listed = store.list("c1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].1 < listed[1].1);
        assert_eq!(listed[0].0.doc_id(), "0-10");

        // duplicate publication of the same segment is refused
        assert!(store.publish("c1", &message(0, 10)).await.is_err());
    }

    #[tokio::test]
    async fn test_ack_cleanup_predicates() {
        let store = MessageStore::new(Arc::new(MemoryStore::new()));
        let mut msg = message(0, 10);
        // sender pre-attaches its own markers
        msg.ack_set.insert(generate_ack_id(AckKind::Transfer));
        msg.ack_set.insert(generate_ack_id(AckKind::Read));
        store.publish("c1", &msg).await.unwrap();
        let id = msg.doc_id();

        // second of three participants transfers: content stays
        let out = store
            .add_ack("c1", &id, &generate_ack_id(AckKind::Transfer), 3)
            .await
            .unwrap();
        assert_eq!(
            out,
            AckOutcome::Applied {
                ciphertext_cleared: false,
                document_removed: false
            }
        );

        // third transfer-ack clears the ciphertext in the same transaction
        let out = store
            .add_ack("c1", &id, &generate_ack_id(AckKind::Transfer), 3)
            .await
            .unwrap();
        assert_eq!(
            out,
            AckOutcome::Applied {
                ciphertext_cleared: true,
                document_removed: false
            }
        );
        let stored = store.get("c1", &id).await.unwrap().unwrap();
        assert!(stored.ciphertext.is_empty());
        assert_eq!(stored.key_segment.doc_id(), id);

        // read-acks from everyone delete the document
        store
            .add_ack("c1", &id, &generate_ack_id(AckKind::Read), 3)
            .await
            .unwrap();
        let out = store
            .add_ack("c1", &id, &generate_ack_id(AckKind::Read), 3)
            .await
            .unwrap();
        assert_eq!(
            out,
            AckOutcome::Applied {
                ciphertext_cleared: true,
                document_removed: true
            }
        );
        assert!(store.get("c1", &id).await.unwrap().is_none());

        // acking a deleted document reports it gone
        let out = store
            .add_ack("c1", &id, &generate_ack_id(AckKind::Read), 3)
            .await
            .unwrap();
        assert_eq!(out, AckOutcome::AlreadyGone);
    }
}
