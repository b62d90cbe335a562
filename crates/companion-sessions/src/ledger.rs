//! Ledger backends: sessions, conversation records, and the emotion trend log.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use companion_protocol::{
    CompanionError, CompanionResult, ConversationId, ConversationRecord, EmotionTrendEvent,
    LedgerPort, NewConversation, Session, SessionId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

/// One line of `ledger.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LedgerEntry {
    Session(Session),
    Conversation(ConversationRecord),
    Feedback {
        conversation_id: ConversationId,
        score: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Emotion(EmotionTrendEvent),
}

#[derive(Debug, Default)]
struct LedgerState {
    sessions: HashMap<SessionId, Session>,
    /// Ordered by id.
    conversations: Vec<ConversationRecord>,
    emotions: Vec<EmotionTrendEvent>,
}

impl LedgerState {
    fn apply(&mut self, entry: LedgerEntry) -> CompanionResult<()> {
        match entry {
            LedgerEntry::Session(session) => {
                self.sessions.insert(session.id.clone(), session);
            }
            LedgerEntry::Conversation(record) => {
                if record.id != self.next_conversation_id() {
                    return Err(CompanionError::invalid_input(format!(
                        "conversation id {} out of sequence",
                        record.id
                    )));
                }
                self.conversations.push(record);
            }
            LedgerEntry::Feedback {
                conversation_id,
                score,
                text,
            } => {
                let record = self.conversation_mut(conversation_id)?;
                record.feedback_score = Some(score);
                record.feedback_text = text;
            }
            LedgerEntry::Emotion(event) => self.emotions.push(event),
        }
        Ok(())
    }

    fn next_conversation_id(&self) -> ConversationId {
        self.conversations
            .last()
            .map(|record| record.id.next())
            .unwrap_or(ConversationId::FIRST)
    }

    fn position(&self, conversation_id: ConversationId) -> Option<usize> {
        self.conversations
            .binary_search_by_key(&conversation_id, |record| record.id)
            .ok()
    }

    fn conversation(&self, conversation_id: ConversationId) -> Option<&ConversationRecord> {
        self.position(conversation_id)
            .map(|position| &self.conversations[position])
    }

    fn conversation_mut(
        &mut self,
        conversation_id: ConversationId,
    ) -> CompanionResult<&mut ConversationRecord> {
        match self.position(conversation_id) {
            Some(position) => Ok(&mut self.conversations[position]),
            None => Err(CompanionError::not_found(format!(
                "conversation {conversation_id}"
            ))),
        }
    }

    fn session_scores(&self, session_id: &SessionId) -> Vec<f64> {
        self.conversations
            .iter()
            .filter(|record| &record.session_id == session_id)
            .filter_map(|record| record.feedback_score)
            .collect()
    }

    fn recent_conversations(&self, session_id: &SessionId, limit: usize) -> Vec<ConversationRecord> {
        let mut recent: Vec<ConversationRecord> = self
            .conversations
            .iter()
            .rev()
            .filter(|record| &record.session_id == session_id)
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    fn conversations_with_min_score(&self, min_score: f64) -> Vec<ConversationRecord> {
        self.conversations
            .iter()
            .rev()
            .filter(|record| record.feedback_score.is_some_and(|score| score >= min_score))
            .cloned()
            .collect()
    }

    fn session_emotions(&self, session_id: &SessionId) -> Vec<EmotionTrendEvent> {
        self.emotions
            .iter()
            .filter(|event| &event.session_id == session_id)
            .cloned()
            .collect()
    }
}

/// In-process ledger.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerPort for MemoryLedger {
    async fn put_session(&self, session: &Session) -> CompanionResult<()> {
        self.state.lock().apply(LedgerEntry::Session(session.clone()))
    }

    async fn session(&self, session_id: &SessionId) -> CompanionResult<Option<Session>> {
        Ok(self.state.lock().sessions.get(session_id).cloned())
    }

    async fn append_conversation(
        &self,
        conversation: NewConversation,
    ) -> CompanionResult<ConversationRecord> {
        let mut state = self.state.lock();
        let record = ConversationRecord::from_new(state.next_conversation_id(), conversation);
        state.apply(LedgerEntry::Conversation(record.clone()))?;
        Ok(record)
    }

    async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> CompanionResult<Option<ConversationRecord>> {
        Ok(self.state.lock().conversation(conversation_id).cloned())
    }

    async fn set_feedback(
        &self,
        conversation_id: ConversationId,
        score: f64,
        text: Option<String>,
    ) -> CompanionResult<ConversationRecord> {
        let mut state = self.state.lock();
        state.apply(LedgerEntry::Feedback {
            conversation_id,
            score,
            text,
        })?;
        Ok(state.conversation_mut(conversation_id)?.clone())
    }

    async fn session_scores(&self, session_id: &SessionId) -> CompanionResult<Vec<f64>> {
        Ok(self.state.lock().session_scores(session_id))
    }

    async fn recent_conversations(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> CompanionResult<Vec<ConversationRecord>> {
        Ok(self.state.lock().recent_conversations(session_id, limit))
    }

    async fn conversations_with_min_score(
        &self,
        min_score: f64,
    ) -> CompanionResult<Vec<ConversationRecord>> {
        Ok(self.state.lock().conversations_with_min_score(min_score))
    }

    async fn append_emotion(&self, event: EmotionTrendEvent) -> CompanionResult<()> {
        self.state.lock().apply(LedgerEntry::Emotion(event))
    }

    async fn session_emotions(
        &self,
        session_id: &SessionId,
    ) -> CompanionResult<Vec<EmotionTrendEvent>> {
        Ok(self.state.lock().session_emotions(session_id))
    }
}

/// JSONL ledger: every mutation is one line of `ledger.jsonl`, replayed on
/// open. Later session and feedback lines win over earlier ones.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileLedger {
    #[instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub async fn open(root: impl AsRef<Path>) -> CompanionResult<Self> {
        let path = root.as_ref().join("ledger.jsonl");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let state = Self::replay(&path).await?;
        debug!(
            sessions = state.sessions.len(),
            conversations = state.conversations.len(),
            "ledger replayed"
        );
        Ok(Self {
            path,
            state: Mutex::new(state),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays the log. A torn final line is cut off the file so the next
    /// commit starts on a clean line.
    async fn replay(path: &Path) -> CompanionResult<LedgerState> {
        let mut state = LedgerState::default();
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(state);
        }

        let raw = fs::read(path).await?;
        let segments: Vec<&[u8]> = raw.split_inclusive(|byte| *byte == b'\n').collect();
        let mut offset = 0;
        let mut good_len = 0;
        let mut torn = false;

        for (position, segment) in segments.iter().enumerate() {
            offset += segment.len();
            let line = segment.trim_ascii();
            if line.is_empty() {
                good_len = offset;
                continue;
            }
            let entry = match serde_json::from_slice::<LedgerEntry>(line) {
                Ok(entry) => entry,
                Err(error) if position + 1 == segments.len() => {
                    warn!(%error, path = %path.display(), "dropping torn trailing ledger line");
                    torn = true;
                    continue;
                }
                Err(error) => {
                    return Err(CompanionError::Serialization(format!(
                        "corrupt ledger line {} in {}: {error}",
                        position + 1,
                        path.display()
                    )));
                }
            };
            state.apply(entry)?;
            good_len = offset;
        }

        let unterminated = good_len > 0 && raw[good_len - 1] != b'\n';
        if torn || unterminated {
            let mut file = OpenOptions::new().write(true).open(path).await?;
            file.set_len(good_len as u64).await?;
            if unterminated {
                file.seek(SeekFrom::Start(good_len as u64)).await?;
                file.write_all(b"\n").await?;
            }
            file.flush().await?;
            file.sync_all().await?;
            debug!(good_len, "ledger tail repaired");
        }
        Ok(state)
    }

    /// Write one entry, then apply it to the cached state. Callers hold
    /// `write_lock`.
    async fn commit(&self, entry: LedgerEntry) -> CompanionResult<()> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        self.state.lock().apply(entry)
    }
}

#[async_trait]
impl LedgerPort for FileLedger {
    async fn put_session(&self, session: &Session) -> CompanionResult<()> {
        let _guard = self.write_lock.lock().await;
        self.commit(LedgerEntry::Session(session.clone())).await
    }

    async fn session(&self, session_id: &SessionId) -> CompanionResult<Option<Session>> {
        Ok(self.state.lock().sessions.get(session_id).cloned())
    }

    #[instrument(skip(self, conversation), fields(session_id = %conversation.session_id))]
    async fn append_conversation(
        &self,
        conversation: NewConversation,
    ) -> CompanionResult<ConversationRecord> {
        let _guard = self.write_lock.lock().await;
        let id = self.state.lock().next_conversation_id();
        let record = ConversationRecord::from_new(id, conversation);
        self.commit(LedgerEntry::Conversation(record.clone())).await?;
        Ok(record)
    }

    async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> CompanionResult<Option<ConversationRecord>> {
        Ok(self.state.lock().conversation(conversation_id).cloned())
    }

    #[instrument(skip(self, text))]
    async fn set_feedback(
        &self,
        conversation_id: ConversationId,
        score: f64,
        text: Option<String>,
    ) -> CompanionResult<ConversationRecord> {
        let _guard = self.write_lock.lock().await;
        if self.state.lock().conversation(conversation_id).is_none() {
            return Err(CompanionError::not_found(format!(
                "conversation {conversation_id}"
            )));
        }
        self.commit(LedgerEntry::Feedback {
            conversation_id,
            score,
            text,
        })
        .await?;
        Ok(self.state.lock().conversation_mut(conversation_id)?.clone())
    }

    async fn session_scores(&self, session_id: &SessionId) -> CompanionResult<Vec<f64>> {
        Ok(self.state.lock().session_scores(session_id))
    }

    async fn recent_conversations(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> CompanionResult<Vec<ConversationRecord>> {
        Ok(self.state.lock().recent_conversations(session_id, limit))
    }

    async fn conversations_with_min_score(
        &self,
        min_score: f64,
    ) -> CompanionResult<Vec<ConversationRecord>> {
        Ok(self.state.lock().conversations_with_min_score(min_score))
    }

    async fn append_emotion(&self, event: EmotionTrendEvent) -> CompanionResult<()> {
        let _guard = self.write_lock.lock().await;
        self.commit(LedgerEntry::Emotion(event)).await
    }

    async fn session_emotions(
        &self,
        session_id: &SessionId,
    ) -> CompanionResult<Vec<EmotionTrendEvent>> {
        Ok(self.state.lock().session_emotions(session_id))
    }
}
