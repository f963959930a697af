//! Per-conversation reactive message coordinator
//!
//! Watches the shared store: one task per active conversation ingests
//! ciphertext snapshots and hands unseen documents to the receive pipeline,
//! and a membership task auto-starts and auto-stops those per-conversation
//! tasks as the user's conversation list changes. Per-message failures are
//! contained so one bad document never stalls a stream.
//!
//! The host keeps one coordinator per signed-in identity and tears it down
//! on identity rotation.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::conversation::Conversation;
use crate::error::Result;
use crate::messaging::pipeline::MessagePipeline;
use crate::messaging::decode_message;
use crate::store::{paths, Doc, DocumentStore};
use crate::{ConversationId, PeerId};

pub struct MessageCoordinator {
    user_id: PeerId,
    shared: Arc<dyn DocumentStore>,
    pipeline: Arc<MessagePipeline>,
    tasks: DashMap<ConversationId, JoinHandle<()>>,
    membership_task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageCoordinator {
    pub fn new(
        user_id: impl Into<PeerId>,
        shared: Arc<dyn DocumentStore>,
        pipeline: Arc<MessagePipeline>,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.into(),
            shared,
            pipeline,
            tasks: DashMap::new(),
            membership_task: Mutex::new(None),
        })
    }

    pub fn pipeline(&self) -> &Arc<MessagePipeline> {
        &self.pipeline
    }

    pub fn active_conversations(&self) -> Vec<ConversationId> {
        self.tasks.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Subscribe to one conversation's message stream (idempotent)
    pub fn start_for_conversation(&self, conversation_id: &str) {
        use dashmap::mapref::entry::Entry;
        match self.tasks.entry(conversation_id.to_string()) {
            Entry::Occupied(_) => {}
            Entry::Vacant(vacant) => {
                let pipeline = self.pipeline.clone();
                let shared = self.shared.clone();
                let conversation_id = conversation_id.to_string();
                info!(conversation_id, "starting message stream");
                let handle = tokio::spawn(conversation_loop(pipeline, shared, conversation_id));
                vacant.insert(handle);
            }
        }
    }

    /// Cancel one conversation's subscription and drop its resources
    pub fn stop_for_conversation(&self, conversation_id: &str) {
        if let Some((_, handle)) = self.tasks.remove(conversation_id) {
            handle.abort();
            info!(conversation_id, "stopped message stream");
        }
    }

    /// One-shot pass over everything currently published (oldest first)
    pub async fn rescan_conversation(&self, conversation_id: &str) -> Result<usize> {
        self.pipeline.rescan_conversation(conversation_id).await
    }

    /// Watch the user's conversation list and keep per-conversation
    /// subscriptions in sync with membership
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let mut rx = shared.watch(paths::CONVERSATIONS);

            // seed from the current list before waiting on the stream
            if let Some(coordinator) = weak.upgrade() {
                match shared.list(paths::CONVERSATIONS).await {
                    Ok(docs) => coordinator.sync_memberships(&docs),
                    Err(e) => warn!(error = %e, "initial conversation list failed"),
                }
            } else {
                return;
            }

            loop {
                match rx.recv().await {
                    Ok(snapshot) => {
                        let Some(coordinator) = weak.upgrade() else { break };
                        coordinator.sync_memberships(&snapshot.docs);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "conversation stream lagged, resyncing");
                        let Some(coordinator) = weak.upgrade() else { break };
                        if let Ok(docs) = shared.list(paths::CONVERSATIONS).await {
                            coordinator.sync_memberships(&docs);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *self.membership_task.lock() = Some(handle);
    }

    /// Stop every subscription; used on identity rotation
    pub fn shutdown(&self) {
        if let Some(handle) = self.membership_task.lock().take() {
            handle.abort();
        }
        let ids: Vec<ConversationId> = self.active_conversations();
        for id in ids {
            self.stop_for_conversation(&id);
        }
    }

    fn sync_memberships(&self, docs: &[Doc]) {
        let conversations: Vec<Conversation> = docs
            .iter()
            .filter_map(|doc| serde_json::from_value(doc.data.clone()).ok())
            .collect();
        let mine: HashSet<&str> = conversations
            .iter()
            .filter(|c| c.includes(&self.user_id))
            .map(|c| c.id.as_str())
            .collect();

        for id in &mine {
            self.start_for_conversation(id);
        }
        let stale: Vec<ConversationId> = self
            .tasks
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !mine.contains(id.as_str()))
            .collect();
        for id in stale {
            self.stop_for_conversation(&id);
        }
    }
}

impl Drop for MessageCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn conversation_loop(
    pipeline: Arc<MessagePipeline>,
    shared: Arc<dyn DocumentStore>,
    conversation_id: ConversationId,
) {
    let mut rx = shared.watch(&paths::messages(&conversation_id));

    // catch up on anything published before we subscribed
    if let Err(e) = pipeline.rescan_conversation(&conversation_id).await {
        warn!(conversation_id, error = %e, "initial rescan failed");
    }

    loop {
        match rx.recv().await {
            Ok(snapshot) => {
                for doc in &snapshot.docs {
                    let message = match decode_message(doc) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(conversation_id, doc_id = doc.id, error = %e, "undecodable message doc");
                            continue;
                        }
                    };
                    // one bad message must not stall the stream
                    if let Err(e) = pipeline.process_message(&conversation_id, &message).await {
                        warn!(
                            conversation_id,
                            message_id = message.doc_id(),
                            error = %e,
                            "message processing failed"
                        );
                    }
                }
                if let Err(e) = pipeline
                    .reconcile_cloud_flags(&conversation_id, &snapshot.docs)
                    .await
                {
                    warn!(conversation_id, error = %e, "cloud flag reconcile failed");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!(conversation_id, skipped, "message stream lagged, rescanning");
                if let Err(e) = pipeline.rescan_conversation(&conversation_id).await {
                    warn!(conversation_id, error = %e, "rescan after lag failed");
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Conversation;
    use crate::key::SharedKey;
    use crate::messaging::lock::LockConfig;
    use crate::messaging::{MessageContent, MessageStatus};
    use crate::storage::LocalStore;
    use crate::store::memory::MemoryStore;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn wait_until<F: Fn() -> bool>(predicate: F) {
        for _ in 0..100 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within a second");
    }

    struct Device {
        _dir: TempDir,
        pipeline: Arc<MessagePipeline>,
        coordinator: Arc<MessageCoordinator>,
    }

    async fn device(user: &str, shared: &Arc<MemoryStore>) -> Device {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(LocalStore::open(dir.path()).await.unwrap());
        let pipeline = Arc::new(MessagePipeline::new(
            user,
            shared.clone() as Arc<dyn DocumentStore>,
            local,
            LockConfig {
                ttl: Duration::from_millis(200),
                retry_delays: vec![Duration::from_millis(2)],
            },
        ));
        let coordinator = MessageCoordinator::new(
            user,
            shared.clone() as Arc<dyn DocumentStore>,
            pipeline.clone(),
        );
        Device {
            _dir: dir,
            pipeline,
            coordinator,
        }
    }

    async fn seed_keys(devices: &[&Device], conversation_id: &str, peers: Vec<String>) {
        let pad: Vec<u8> = (0..2048u32).map(|i| (i.wrapping_mul(31) % 256) as u8).collect();
        for d in devices {
            let key =
                SharedKey::from_kex(conversation_id, pad.clone(), peers.clone(), "kex-1").unwrap();
            d.pipeline.lifecycle().save_key(&key).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_membership_driven_receive() {
        let shared = Arc::new(MemoryStore::new());
        let alice = device("alice", &shared).await;
        let bob = device("bob", &shared).await;
        seed_keys(&[&alice, &bob], "c1", vec!["alice".into(), "bob".into()]).await;

        bob.coordinator.start();

        let conversation = Conversation::new("c1", vec!["alice".into(), "bob".into()]);
        alice.pipeline.conversations().create(&conversation).await.unwrap();

        // bob's coordinator notices the membership and subscribes
        let bob_coordinator = bob.coordinator.clone();
        wait_until(|| !bob_coordinator.active_conversations().is_empty()).await;

        let sent = alice
            .pipeline
            .send("c1", MessageContent::Text { text: "auto".into() })
            .await
            .unwrap();

        // the stream delivers it to bob without an explicit rescan
        let bob_local = bob.pipeline.local().clone();
        let id = sent.id.clone();
        for _ in 0..100 {
            if bob_local.read_message("c1", &id).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let received = bob_local.read_message("c1", &id).await.unwrap().unwrap();
        assert_eq!(received.status, MessageStatus::TransferAcked);

        bob.coordinator.shutdown();
    }

    #[tokio::test]
    async fn test_stop_for_conversation() {
        let shared = Arc::new(MemoryStore::new());
        let bob = device("bob", &shared).await;
        bob.coordinator.start_for_conversation("c1");
        assert_eq!(bob.coordinator.active_conversations(), vec!["c1"]);
        // idempotent start
        bob.coordinator.start_for_conversation("c1");
        assert_eq!(bob.coordinator.active_conversations().len(), 1);

        bob.coordinator.stop_for_conversation("c1");
        assert!(bob.coordinator.active_conversations().is_empty());
    }

    #[tokio::test]
    async fn test_membership_removal_stops_stream() {
        let shared = Arc::new(MemoryStore::new());
        let bob = device("bob", &shared).await;
        bob.coordinator.start();

        let conversation = Conversation::new("c1", vec!["alice".into(), "bob".into()]);
        bob.pipeline.conversations().create(&conversation).await.unwrap();
        let coordinator = bob.coordinator.clone();
        wait_until(|| !coordinator.active_conversations().is_empty()).await;

        // bob is removed from the conversation
        shared
            .transact(paths::CONVERSATIONS, "c1", &mut |cur| {
                let mut data = cur.unwrap().data.clone();
                data["peerIds"] = serde_json::json!(["alice"]);
                crate::store::TxnVerdict::Write(data)
            })
            .await
            .unwrap();

        let coordinator = bob.coordinator.clone();
        wait_until(move || coordinator.active_conversations().is_empty()).await;
        bob.coordinator.shutdown();
    }
}
