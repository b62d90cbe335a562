//! Runtime ports for the knowledge subsystem.
//!
//! These traits are the only boundary between the core services and the
//! outside world: the embedding function, the completion service, the vector
//! index, and the relational ledger.
//!
//! Object-safety note: traits use `async-trait` for async dyn-dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::emotion::EmotionTrendEvent;
use crate::error::CompanionResult;
use crate::ids::{ConversationId, SessionId};
use crate::knowledge::Document;
use crate::session::{ConversationRecord, NewConversation, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Text to fixed-length vector. Deterministic for a given model version.
#[async_trait]
pub trait EmbeddingPort: Send + Sync {
    fn model(&self) -> &str;
    fn dimension(&self) -> usize;
    async fn embed(&self, text: &str) -> CompanionResult<Vec<f32>>;
}

/// Opaque chat completion service.
#[async_trait]
pub trait CompletionPort: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> CompanionResult<String>;
}

/// Persistence primitive for documents and their vectors.
///
/// `append` is atomic per document: after it returns, the document is either
/// fully stored or absent. Readers may observe a slightly stale snapshot but
/// never a partially written document.
#[async_trait]
pub trait VectorIndexPort: Send + Sync {
    async fn append(&self, document: Document) -> CompanionResult<()>;
    /// Every live document, ordered by id.
    async fn documents(&self) -> CompanionResult<Arc<Vec<Arc<Document>>>>;
    /// Highest id ever appended since the last clear, 0 when empty.
    async fn last_id(&self) -> CompanionResult<u64>;
    async fn count(&self) -> CompanionResult<usize>;
    async fn clear(&self) -> CompanionResult<()>;
}

/// Persistence primitive for sessions, conversation records, and the
/// emotion trend log.
#[async_trait]
pub trait LedgerPort: Send + Sync {
    async fn put_session(&self, session: &Session) -> CompanionResult<()>;
    async fn session(&self, session_id: &SessionId) -> CompanionResult<Option<Session>>;

    /// Persist a record, assigning the next conversation id.
    async fn append_conversation(
        &self,
        conversation: NewConversation,
    ) -> CompanionResult<ConversationRecord>;
    async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> CompanionResult<Option<ConversationRecord>>;
    /// Overwrite the feedback on a record (last write wins).
    async fn set_feedback(
        &self,
        conversation_id: ConversationId,
        score: f64,
        text: Option<String>,
    ) -> CompanionResult<ConversationRecord>;
    /// Non-null feedback scores of every record in the session.
    async fn session_scores(&self, session_id: &SessionId) -> CompanionResult<Vec<f64>>;
    /// Newest `limit` records of a session, returned oldest first.
    async fn recent_conversations(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> CompanionResult<Vec<ConversationRecord>>;
    /// Every record across all sessions with `feedback_score >= min_score`,
    /// newest first.
    async fn conversations_with_min_score(
        &self,
        min_score: f64,
    ) -> CompanionResult<Vec<ConversationRecord>>;

    async fn append_emotion(&self, event: EmotionTrendEvent) -> CompanionResult<()>;
    async fn session_emotions(
        &self,
        session_id: &SessionId,
    ) -> CompanionResult<Vec<EmotionTrendEvent>>;
}
