//! KEX coordination over the shared document store
//!
//! One document per session under `kex/{sessionId}` records which peer has
//! received which segment. Scans are recorded with transactional
//! sorted-inserts; the source watches the document, treats "everyone has
//! everything" as completion, and finalizes by deleting the session. The
//! service layer also turns a finished exchange into a saved key and flips
//! the conversation state forward.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::conversation::{ConversationState, ConversationStore};
use crate::error::{Error, Result};
use crate::kex::session::{KexReader, KexSource};
use crate::kex::{KexSessionDoc, KexStatus, QrPayload, SEGMENT_SIZE};
use crate::key::lifecycle::KeyLifecycle;
use crate::key::SharedKey;
use crate::store::{paths, CollectionSnapshot, DocumentStore, TxnVerdict};
use crate::utils::now_ms;
use crate::PeerId;

#[derive(Debug, Clone)]
pub struct KexConfig {
    /// How long each payload stays on screen before rotating
    pub rotation_interval: Duration,
    /// Added to the rotation interval after a stalled rotation
    pub stall_increment: Duration,
    /// Overall deadline for a session; `None` waits forever
    pub session_timeout: Option<Duration>,
    /// Age after which a source's own `InProgress` sessions are swept
    pub stale_age: Duration,
}

impl Default for KexConfig {
    fn default() -> Self {
        Self {
            rotation_interval: Duration::from_millis(600),
            stall_increment: Duration::from_millis(1000),
            session_timeout: Some(Duration::from_secs(3600)),
            stale_age: Duration::from_secs(3600),
        }
    }
}

/// Typed adapter over the `kex` collection
#[derive(Clone)]
pub struct KexStore {
    store: Arc<dyn DocumentStore>,
}

impl KexStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn create_session(&self, doc: &KexSessionDoc) -> Result<()> {
        self.store
            .create(paths::KEX, &doc.id, serde_json::to_value(doc)?)
            .await?;
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<KexSessionDoc>> {
        match self.store.read(paths::KEX, session_id).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc.data).map_err(|e| {
                Error::StorePermanent(format!("malformed kex doc: {}", e))
            })?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<KexSessionDoc>> {
        let docs = self.store.list(paths::KEX).await?;
        docs.into_iter()
            .map(|doc| {
                serde_json::from_value(doc.data)
                    .map_err(|e| Error::StorePermanent(format!("malformed kex doc: {}", e)))
            })
            .collect()
    }

    pub fn watch(&self) -> broadcast::Receiver<CollectionSnapshot> {
        self.store.watch(paths::KEX)
    }

    /// Transactional sorted-insert of one scanned segment index
    pub async fn mark_segment_scanned(
        &self,
        session_id: &str,
        peer_id: &str,
        index: u32,
    ) -> Result<()> {
        let mut fault: Option<Error> = None;
        self.store
            .transact(paths::KEX, session_id, &mut |cur| {
                let Some(doc) = cur else {
                    fault = Some(Error::NotFound(format!("kex session {}", session_id)));
                    return TxnVerdict::Abort;
                };
                let mut session: KexSessionDoc = match serde_json::from_value(doc.data.clone()) {
                    Ok(s) => s,
                    Err(e) => {
                        fault = Some(Error::StorePermanent(format!("malformed kex doc: {}", e)));
                        return TxnVerdict::Abort;
                    }
                };
                let indices = session
                    .segments_by_peer
                    .entry(peer_id.to_string())
                    .or_default();
                if indices.binary_search(&index).is_ok() {
                    return TxnVerdict::Abort; // already recorded
                }
                indices.push(index);
                indices.sort_unstable();
                match serde_json::to_value(&session) {
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

    pub async fn update_totals(
        &self,
        session_id: &str,
        total_segments: u32,
        total_key_bytes: u64,
    ) -> Result<()> {
        self.mutate(session_id, move |session| {
            session.total_segments = total_segments;
            session.total_key_bytes = total_key_bytes;
            session.end_index = total_segments;
        })
        .await
    }

    pub async fn set_status(&self, session_id: &str, status: KexStatus) -> Result<()> {
        self.mutate(session_id, move |session| session.status = status)
            .await
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        self.store.delete(paths::KEX, session_id).await
    }

    async fn mutate(
        &self,
        session_id: &str,
        apply: impl Fn(&mut KexSessionDoc) + Send + Sync,
    ) -> Result<()> {
        let mut fault: Option<Error> = None;
        self.store
            .transact(paths::KEX, session_id, &mut |cur| {
                let Some(doc) = cur else {
                    fault = Some(Error::NotFound(format!("kex session {}", session_id)));
                    return TxnVerdict::Abort;
                };
                let mut session: KexSessionDoc = match serde_json::from_value(doc.data.clone()) {
                    Ok(s) => s,
                    Err(e) => {
                        fault = Some(Error::StorePermanent(format!("malformed kex doc: {}", e)));
                        return TxnVerdict::Abort;
                    }
                };
                apply(&mut session);
                match serde_json::to_value(&session) {
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

/// How a source rotation run ended
pub enum SourceRun {
    /// Everyone received everything; the key is saved locally
    Completed(SharedKey),
    /// The stop signal fired; the session stays `InProgress`
    Stopped,
}

/// Drives key exchanges end to end: session documents, the rotation loop,
/// finalization into a saved key, and conversation state transitions.
pub struct KexService {
    user_id: PeerId,
    store: KexStore,
    lifecycle: Arc<KeyLifecycle>,
    conversations: ConversationStore,
    config: KexConfig,
}

impl KexService {
    pub fn new(
        user_id: impl Into<PeerId>,
        shared: Arc<dyn DocumentStore>,
        lifecycle: Arc<KeyLifecycle>,
        config: KexConfig,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            store: KexStore::new(shared.clone()),
            lifecycle,
            conversations: ConversationStore::new(shared),
            config,
        }
    }

    pub fn store(&self) -> &KexStore {
        &self.store
    }

    /// Open a session as the source: publish the coordination document with
    /// this device's full coverage and move the conversation to `Exchanging`.
    pub async fn start_source(
        &self,
        conversation_id: &str,
        peers: Vec<PeerId>,
        total_bytes: u64,
    ) -> Result<KexSource> {
        if let Err(e) = self.cleanup_stale_sessions().await {
            warn!(error = %e, "stale session sweep failed");
        }

        let source = KexSource::new(
            self.user_id.clone(),
            peers,
            total_bytes,
            self.config.rotation_interval,
            self.config.stall_increment,
        )?;

        let mut doc = KexSessionDoc {
            id: source.session_id().to_string(),
            source_id: self.user_id.clone(),
            participants: source.participants().to_vec(),
            segments_by_peer: Default::default(),
            start_index: 0,
            end_index: source.total_segments(),
            total_segments: source.total_segments(),
            total_key_bytes: source.total_bytes(),
            status: KexStatus::InProgress,
            created_at: now_ms(),
        };
        // the source publishes its own full coverage up front
        doc.segments_by_peer.insert(
            self.user_id.clone(),
            (0..source.total_segments()).collect(),
        );
        self.store.create_session(&doc).await?;

        // a first exchange moves Joining -> Exchanging; extensions stay Ready
        if let Some(conversation) = self.conversations.get(conversation_id).await? {
            if conversation.state == ConversationState::Joining {
                self.conversations
                    .set_state(conversation_id, ConversationState::Exchanging)
                    .await?;
            }
        }

        info!(
            session_id = source.session_id(),
            conversation_id,
            total_bytes,
            segments = source.total_segments(),
            "kex session opened"
        );
        Ok(source)
    }

    /// Rotate payloads until everyone has everything, the stop signal fires,
    /// or the session deadline passes. Payloads go to `display` for the host
    /// to render.
    pub async fn run_source(
        &self,
        source: &mut KexSource,
        conversation_id: &str,
        display: mpsc::Sender<QrPayload>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<SourceRun> {
        let mut updates = self.store.watch();
        let deadline = self.config.session_timeout.map(|t| tokio::time::Instant::now() + t);

        // scans recorded before we subscribed
        if let Some(doc) = self.store.get(source.session_id()).await? {
            source.apply_doc(&doc);
        }

        loop {
            // fold in whatever the readers have reported
            self.drain_updates(source, &mut updates).await?;

            if source.is_complete() {
                let key = self
                    .finalize_source(
                        source,
                        conversation_id,
                        source.total_segments(),
                        source.total_bytes(),
                    )
                    .await?;
                return Ok(SourceRun::Completed(key));
            }
            if *stop.borrow() {
                return Ok(SourceRun::Stopped);
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return Err(Error::KexTimeout(format!(
                        "session {} still incomplete",
                        source.session_id()
                    )));
                }
            }

            if let Some(payload) = source.next_payload()? {
                if display.send(payload).await.is_err() {
                    // host went away; leave the session resumable
                    return Ok(SourceRun::Stopped);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(source.rotation_interval()) => {}
                _ = stop.changed() => {}
            }
        }
    }

    /// Commit only the prefix every other participant has scanned, shrinking
    /// the session to `L + 1` segments, then finalize.
    pub async fn terminate_early(
        &self,
        source: &mut KexSource,
        conversation_id: &str,
    ) -> Result<SharedKey> {
        if let Some(doc) = self.store.get(source.session_id()).await? {
            source.apply_doc(&doc);
        }
        let last = source
            .last_universal_prefix()
            .ok_or(Error::KexNoCompleteSegment)?;
        let total_segments = last + 1;
        let total_bytes = (total_segments as u64 * SEGMENT_SIZE as u64).min(source.total_bytes());

        self.store
            .update_totals(source.session_id(), total_segments, total_bytes)
            .await?;
        info!(
            session_id = source.session_id(),
            total_segments, total_bytes, "kex terminated early"
        );
        self.finalize_source(source, conversation_id, total_segments, total_bytes)
            .await
    }

    /// Any participant may cancel; the document stays for the source to sweep
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        self.store.set_status(session_id, KexStatus::Cancelled).await
    }

    /// Sweep this source's own abandoned sessions
    pub async fn cleanup_stale_sessions(&self) -> Result<usize> {
        let stale_ms = self.config.stale_age.as_millis() as u64;
        let now = now_ms();
        let mut removed = 0;
        for session in self.store.list().await? {
            if session.source_id == self.user_id
                && session.status == KexStatus::InProgress
                && now.saturating_sub(session.created_at) > stale_ms
            {
                self.store.delete(&session.id).await?;
                removed += 1;
                debug!(session_id = session.id, "stale kex session removed");
            }
        }
        Ok(removed)
    }

    // ---- reader side ----

    /// Join an announced session as a reader
    pub async fn join_session(&self, session_id: &str) -> Result<KexReader> {
        let doc = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("kex session {}", session_id)))?;
        Ok(KexReader::new(&doc, self.user_id.clone()))
    }

    /// Record one scanned payload locally and in the coordination document
    pub async fn record_scanned(
        &self,
        reader: &mut KexReader,
        payload: &QrPayload,
    ) -> Result<u32> {
        let index = reader.record_read_segment(payload)?;
        self.store
            .mark_segment_scanned(reader.session_id(), &self.user_id, index)
            .await?;
        Ok(index)
    }

    /// Wait for the source to finalize (session document deleted), then
    /// build and save the key. `None` when the session was cancelled.
    ///
    /// Totals are tracked from snapshot contents so an early-termination
    /// shrink is applied even when the deletion follows immediately.
    pub async fn wait_for_completion(
        &self,
        reader: &mut KexReader,
        conversation_id: &str,
    ) -> Result<Option<SharedKey>> {
        let mut updates = self.store.watch();
        let deadline = self.config.session_timeout.map(|t| tokio::time::Instant::now() + t);

        match self.store.get(reader.session_id()).await? {
            Some(doc) => {
                reader.apply_doc(&doc);
                if doc.status == KexStatus::Cancelled {
                    info!(session_id = reader.session_id(), "kex session cancelled");
                    return Ok(None);
                }
            }
            // already finalized before we started waiting
            None => return self.finish_reader(reader, conversation_id).await.map(Some),
        }

        loop {
            let recv = async {
                match updates.recv().await {
                    Ok(snapshot) => Ok(Some(snapshot)),
                    Err(broadcast::error::RecvError::Lagged(_)) => Ok(None),
                    Err(broadcast::error::RecvError::Closed) => {
                        Err(Error::StoreTransient("kex stream closed".into()))
                    }
                }
            };
            let snapshot = match deadline {
                Some(deadline) => {
                    tokio::select! {
                        result = recv => result?,
                        _ = tokio::time::sleep_until(deadline) => {
                            return Err(Error::KexTimeout(format!(
                                "session {} never finalized",
                                reader.session_id()
                            )));
                        }
                    }
                }
                None => recv.await?,
            };

            match snapshot {
                Some(snapshot) => {
                    let doc = snapshot
                        .docs
                        .iter()
                        .find(|doc| doc.id == reader.session_id());
                    match doc {
                        Some(doc) => {
                            if let Ok(session) =
                                serde_json::from_value::<KexSessionDoc>(doc.data.clone())
                            {
                                reader.apply_doc(&session);
                                if session.status == KexStatus::Cancelled {
                                    info!(
                                        session_id = reader.session_id(),
                                        "kex session cancelled"
                                    );
                                    return Ok(None);
                                }
                            }
                        }
                        // deletion is the finalization signal
                        None => break,
                    }
                }
                // lagged; fall back to a direct read
                None => match self.store.get(reader.session_id()).await? {
                    Some(doc) => {
                        reader.apply_doc(&doc);
                        if doc.status == KexStatus::Cancelled {
                            return Ok(None);
                        }
                    }
                    None => break,
                },
            }
        }

        self.finish_reader(reader, conversation_id).await.map(Some)
    }

    async fn finish_reader(
        &self,
        reader: &KexReader,
        conversation_id: &str,
    ) -> Result<SharedKey> {
        let bytes = reader.build_key_bytes()?;
        self.finalize_key(
            conversation_id,
            reader.participants().to_vec(),
            bytes,
            reader.session_id().to_string(),
        )
        .await
    }

    // ---- shared finalization ----

    async fn finalize_source(
        &self,
        source: &KexSource,
        conversation_id: &str,
        total_segments: u32,
        total_bytes: u64,
    ) -> Result<SharedKey> {
        let bytes = source.build_key_bytes(total_segments, total_bytes)?;
        self.store
            .set_status(source.session_id(), KexStatus::Completed)
            .await?;
        self.store.delete(source.session_id()).await?;

        let key = self
            .finalize_key(
                conversation_id,
                source.participants().to_vec(),
                bytes,
                source.session_id().to_string(),
            )
            .await?;
        info!(
            session_id = source.session_id(),
            conversation_id,
            key_bytes = total_bytes,
            "kex session finalized"
        );
        Ok(key)
    }

    /// Turn exchanged bytes into a saved key: extend the existing pad when
    /// one exists, otherwise start a fresh one at frontier zero. The
    /// conversation moves to `Ready` on its first successful exchange.
    async fn finalize_key(
        &self,
        conversation_id: &str,
        peers: Vec<PeerId>,
        bytes: Vec<u8>,
        kex_id: String,
    ) -> Result<SharedKey> {
        let key = match self.lifecycle.get_key(conversation_id).await {
            Ok(existing) => existing.extend(bytes, Some(kex_id))?,
            Err(Error::KeyNotFound(_)) => {
                SharedKey::from_kex(conversation_id, bytes, peers, kex_id)?
            }
            Err(e) => return Err(e),
        };
        self.lifecycle.save_key(&key).await?;

        if let Some(conversation) = self.conversations.get(conversation_id).await? {
            if conversation.state == ConversationState::Exchanging {
                self.conversations
                    .set_state(conversation_id, ConversationState::Ready)
                    .await?;
            }
        }
        Ok(key)
    }

    async fn drain_updates(
        &self,
        source: &mut KexSource,
        updates: &mut broadcast::Receiver<CollectionSnapshot>,
    ) -> Result<()> {
        let mut behind = false;
        loop {
            match updates.try_recv() {
                Ok(snapshot) => {
                    for doc in &snapshot.docs {
                        if doc.id == source.session_id() {
                            if let Ok(session) =
                                serde_json::from_value::<KexSessionDoc>(doc.data.clone())
                            {
                                source.apply_doc(&session);
                            }
                        }
                    }
                }
                Err(TryRecvError::Lagged(_)) => behind = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        if behind {
            // missed snapshots; read the document directly
            if let Some(doc) = self.store.get(source.session_id()).await? {
                source.apply_doc(&doc);
            }
        }
        Ok(())
    }
}
