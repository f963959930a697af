//! Conversation model and shared-document adapter
//!
//! A conversation is a set of peers plus the lifecycle state of their shared
//! pad. The `keyStatusPerPeer` map is advisory metadata senders use to avoid
//! allocating a byte some peer has already consumed.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::store::{paths, CollectionSnapshot, Doc, DocumentStore, TxnVerdict};
use crate::utils::now_ms;
use crate::{ConversationId, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConversationState {
    Joining,
    Exchanging,
    Ready,
}

impl ConversationState {
    /// Forward-only state machine; staying put is always allowed
    pub fn can_transition_to(self, next: ConversationState) -> bool {
        use ConversationState::*;
        matches!(
            (self, next),
            (Joining, Joining)
                | (Joining, Exchanging)
                | (Exchanging, Exchanging)
                | (Exchanging, Ready)
                | (Ready, Ready)
        )
    }
}

/// Advisory per-peer view of the key: `[start_byte, end_byte)` still held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStatus {
    pub start_byte: u64,
    pub end_byte: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub peer_ids: Vec<PeerId>,
    pub state: ConversationState,
    pub created_at: u64,
    #[serde(default)]
    pub key_status_per_peer: BTreeMap<PeerId, KeyStatus>,
}

impl Conversation {
    pub fn new(id: impl Into<ConversationId>, peer_ids: Vec<PeerId>) -> Self {
        let mut peer_ids = peer_ids;
        peer_ids.sort();
        peer_ids.dedup();
        Self {
            id: id.into(),
            peer_ids,
            state: ConversationState::Joining,
            created_at: now_ms(),
            key_status_per_peer: BTreeMap::new(),
        }
    }

    pub fn includes(&self, peer_id: &str) -> bool {
        self.peer_ids.iter().any(|p| p == peer_id)
    }

    /// Highest consumption frontier any peer has advertised
    pub fn max_peer_frontier(&self) -> u64 {
        self.key_status_per_peer
            .values()
            .map(|s| s.start_byte)
            .max()
            .unwrap_or(0)
    }
}

/// Typed adapter over the `conversations` collection
#[derive(Clone)]
pub struct ConversationStore {
    store: Arc<dyn DocumentStore>,
}

impl ConversationStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, conversation: &Conversation) -> Result<()> {
        self.store
            .create(
                paths::CONVERSATIONS,
                &conversation.id,
                serde_json::to_value(conversation)?,
            )
            .await?;
        Ok(())
    }

    pub async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        match self.store.read(paths::CONVERSATIONS, conversation_id).await? {
            Some(doc) => Ok(Some(parse(&doc)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<Conversation>> {
        let docs = self.store.list(paths::CONVERSATIONS).await?;
        docs.iter().map(parse).collect()
    }

    pub fn watch(&self) -> broadcast::Receiver<CollectionSnapshot> {
        self.store.watch(paths::CONVERSATIONS)
    }

    /// Advance the conversation state; backwards transitions are rejected
    pub async fn set_state(
        &self,
        conversation_id: &str,
        next: ConversationState,
    ) -> Result<()> {
        let mut fault: Option<Error> = None;
        self.store
            .transact(paths::CONVERSATIONS, conversation_id, &mut |cur| {
                let Some(doc) = cur else {
                    fault = Some(Error::NotFound(format!(
                        "conversation {}",
                        conversation_id
                    )));
                    return TxnVerdict::Abort;
                };
                let mut conversation: Conversation = match serde_json::from_value(doc.data.clone())
                {
                    Ok(c) => c,
                    Err(e) => {
                        fault = Some(Error::StorePermanent(format!(
                            "malformed conversation doc: {}",
                            e
                        )));
                        return TxnVerdict::Abort;
                    }
                };
                if conversation.state == next {
                    return TxnVerdict::Abort; // already there
                }
                if !conversation.state.can_transition_to(next) {
                    fault = Some(Error::InvalidState(format!(
                        "conversation {} cannot go {:?} -> {:?}",
                        conversation_id, conversation.state, next
                    )));
                    return TxnVerdict::Abort;
                }
                conversation.state = next;
                match serde_json::to_value(&conversation) {
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
            None => Ok(()),
        }
    }

    /// Transactionally publish this device's key view
    pub async fn update_key_status(
        &self,
        conversation_id: &str,
        peer_id: &str,
        status: KeyStatus,
    ) -> Result<()> {
        let mut fault: Option<Error> = None;
        self.store
            .transact(paths::CONVERSATIONS, conversation_id, &mut |cur| {
                let Some(doc) = cur else {
                    fault = Some(Error::NotFound(format!(
                        "conversation {}",
                        conversation_id
                    )));
                    return TxnVerdict::Abort;
                };
                let mut conversation: Conversation = match serde_json::from_value(doc.data.clone())
                {
                    Ok(c) => c,
                    Err(e) => {
                        fault = Some(Error::StorePermanent(format!(
                            "malformed conversation doc: {}",
                            e
                        )));
                        return TxnVerdict::Abort;
                    }
                };
                conversation
                    .key_status_per_peer
                    .insert(peer_id.to_string(), status);
                match serde_json::to_value(&conversation) {
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
            None => Ok(()),
        }
    }
}

fn parse(doc: &Doc) -> Result<Conversation> {
    serde_json::from_value(doc.data.clone())
        .map_err(|e| Error::StorePermanent(format!("malformed conversation doc: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn adapter() -> ConversationStore {
        ConversationStore::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_transitions() {
        use ConversationState::*;
        assert!(Joining.can_transition_to(Exchanging));
        assert!(Exchanging.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Exchanging));
        assert!(!Exchanging.can_transition_to(Joining));
        assert!(!Joining.can_transition_to(Ready));
    }

    #[test]
    fn test_peer_ids_sorted() {
        let c = Conversation::new("c1", vec!["zeta".into(), "alpha".into(), "alpha".into()]);
        assert_eq!(c.peer_ids, vec!["alpha".to_string(), "zeta".to_string()]);
        assert!(c.includes("alpha"));
        assert!(!c.includes("beta"));
    }

    #[tokio::test]
    async fn test_create_and_state_walk() {
        let store = adapter();
        let c = Conversation::new("c1", vec!["p1".into(), "p2".into()]);
        store.create(&c).await.unwrap();

        store
            .set_state("c1", ConversationState::Exchanging)
            .await
            .unwrap();
        store.set_state("c1", ConversationState::Ready).await.unwrap();
        // extension while ready: staying at Ready is fine
        store.set_state("c1", ConversationState::Ready).await.unwrap();

        // backwards is rejected
        assert!(matches!(
            store.set_state("c1", ConversationState::Exchanging).await,
            Err(Error::InvalidState(_))
        ));

        let loaded = store.get("c1").await.unwrap().unwrap();
        assert_eq!(loaded.state, ConversationState::Ready);
    }

    #[tokio::test]
    async fn test_key_status_update() {
        let store = adapter();
        let c = Conversation::new("c1", vec!["p1".into(), "p2".into()]);
        store.create(&c).await.unwrap();

        store
            .update_key_status(
                "c1",
                "p1",
                KeyStatus {
                    start_byte: 48,
                    end_byte: 1024,
                },
            )
            .await
            .unwrap();

        let loaded = store.get("c1").await.unwrap().unwrap();
        assert_eq!(loaded.key_status_per_peer["p1"].start_byte, 48);
        assert_eq!(loaded.max_peer_frontier(), 48);

        assert!(matches!(
            store
                .update_key_status("missing", "p1", KeyStatus { start_byte: 0, end_byte: 0 })
                .await,
            Err(Error::NotFound(_))
        ));
    }
}
