//! Chat orchestration.
//!
//! [`ChatOrchestrator`] is cheap to clone and shared across sessions. Each
//! conversation runs through a [`ChatSession`], which owns the current
//! session id and the bounded history window. Callers must not run two
//! `chat` calls for one session concurrently; `&mut self` enforces that for
//! a single handle.

pub mod config;
pub mod prompt;

use std::collections::VecDeque;
use std::sync::Arc;

use companion_emotion::EmotionTagger;
use companion_knowledge::KnowledgeStore;
use companion_learning::{Exchange, LearningEngine};
use companion_protocol::{
    ChatMessage, CompanionError, CompanionResult, CompletionPort, CompletionRequest,
    ConversationId, Emotion, EmotionPattern, NewConversation, RetrievedDocument, SessionId,
    SessionStatistics, UserId,
};
use companion_sessions::SessionAggregator;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

pub use companion_knowledge::KnowledgeInfo;
pub use config::RuntimeConfig;

/// Result of one chat turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub response: String,
    pub detected_emotions: Vec<Emotion>,
    pub rag_docs_count: usize,
    pub conversation_id: ConversationId,
    pub session_id: SessionId,
}

#[derive(Clone)]
pub struct ChatOrchestrator {
    config: RuntimeConfig,
    tagger: EmotionTagger,
    knowledge: Arc<KnowledgeStore>,
    sessions: Arc<SessionAggregator>,
    learning: Arc<LearningEngine>,
    completion: Arc<dyn CompletionPort>,
}

impl std::fmt::Debug for ChatOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatOrchestrator")
            .field("config", &self.config)
            .field("knowledge", &self.knowledge)
            .field("learning", &self.learning)
            .finish_non_exhaustive()
    }
}

impl ChatOrchestrator {
    pub fn new(
        config: RuntimeConfig,
        knowledge: Arc<KnowledgeStore>,
        sessions: Arc<SessionAggregator>,
        learning: Arc<LearningEngine>,
        completion: Arc<dyn CompletionPort>,
    ) -> CompanionResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            tagger: EmotionTagger::new(),
            knowledge,
            sessions,
            learning,
            completion,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeStore> {
        &self.knowledge
    }

    pub fn sessions(&self) -> &Arc<SessionAggregator> {
        &self.sessions
    }

    pub fn learning(&self) -> &Arc<LearningEngine> {
        &self.learning
    }

    /// A conversation handle with no session yet; one is created on the
    /// first message.
    pub fn open(&self, user_id: Option<UserId>) -> ChatSession {
        ChatSession {
            orchestrator: self.clone(),
            session_id: None,
            user_id,
            history: VecDeque::new(),
        }
    }

    /// A conversation handle with its session created up front.
    pub async fn start_session(&self, user_id: Option<UserId>) -> CompanionResult<ChatSession> {
        let mut chat = self.open(user_id);
        chat.reset_with_current_user().await?;
        Ok(chat)
    }

    /// Reattach to a persisted session, rebuilding the history window from
    /// its newest exchanges.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn resume(&self, session_id: &SessionId) -> CompanionResult<ChatSession> {
        let session = self
            .sessions
            .session(session_id)
            .await?
            .ok_or_else(|| CompanionError::not_found(format!("session {session_id}")))?;

        let records = self
            .sessions
            .history(session_id, self.config.history_window)
            .await?;
        let mut history = VecDeque::with_capacity(records.len() * 2);
        for record in records {
            history.push_back(ChatMessage::user(record.user_message));
            history.push_back(ChatMessage::assistant(record.ai_response));
        }
        debug!(messages = history.len(), "history window rebuilt");

        Ok(ChatSession {
            orchestrator: self.clone(),
            session_id: Some(session.id),
            user_id: session.user_id,
            history,
        })
    }

    /// Record feedback, offer the exchange to the learning buffer, and
    /// promote the buffer once it is full.
    ///
    /// Out-of-range scores and unknown conversations are errors. A failed
    /// promotion is logged; the feedback itself stays recorded.
    #[instrument(skip(self, text), fields(conversation_id = %conversation_id))]
    pub async fn add_feedback(
        &self,
        conversation_id: ConversationId,
        score: f64,
        text: Option<String>,
    ) -> CompanionResult<bool> {
        let record = self
            .sessions
            .record_feedback(conversation_id, score, text)
            .await?;

        let buffered = self.learning.consider_exchange(Exchange {
            user_message: record.user_message,
            ai_response: record.ai_response,
            feedback_score: score,
            emotions: record.detected_emotions,
        });
        if buffered {
            match self.learning.promote(self.config.min_buffer_size).await {
                Ok(0) => {}
                Ok(promoted) => info!(promoted, "learning buffer promoted after feedback"),
                Err(error) => warn!(%error, "learning promotion after feedback failed"),
            }
        }
        Ok(true)
    }

    pub async fn session_statistics(
        &self,
        session_id: &SessionId,
    ) -> CompanionResult<Option<SessionStatistics>> {
        self.sessions.get_statistics(session_id).await
    }

    pub async fn emotion_pattern(&self, session_id: &SessionId) -> CompanionResult<EmotionPattern> {
        self.sessions.emotion_pattern(session_id).await
    }

    /// Re-mine persisted history, then flush the live buffer. Returns the
    /// combined count.
    #[instrument(skip(self))]
    pub async fn trigger_learning(&self, min_score: f64) -> CompanionResult<usize> {
        let relearned = self
            .learning
            .relearn_from_history(self.sessions.ledger().as_ref(), min_score)
            .await?;
        let promoted = self
            .learning
            .promote(self.config.trigger_buffer_size)
            .await?;
        info!(relearned, promoted, "learning triggered");
        Ok(relearned + promoted)
    }

    pub async fn knowledge_count(&self) -> CompanionResult<usize> {
        self.knowledge.count().await
    }

    pub async fn knowledge_info(&self) -> CompanionResult<KnowledgeInfo> {
        self.knowledge.info().await
    }

    async fn retrieve_for_turn(&self, message: &str) -> Vec<RetrievedDocument> {
        if !self.config.rag_enabled {
            return Vec::new();
        }

        let mut documents = match self.knowledge.retrieve(message, Some(self.config.top_k)).await {
            Ok(documents) => documents,
            Err(error) => {
                warn!(%error, "retrieval failed, continuing without knowledge");
                return Vec::new();
            }
        };

        if self.config.enforce_similarity_threshold {
            let threshold = self.config.similarity_threshold;
            documents.retain(|document| document.similarity() >= threshold);
        }
        documents
    }

    async fn complete_or_apologize(&self, messages: Vec<ChatMessage>) -> String {
        let request = CompletionRequest {
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        match self.completion.complete(request).await {
            Ok(text) => text,
            Err(error) => {
                warn!(%error, "completion failed, substituting apology");
                prompt::apology(&error.to_string())
            }
        }
    }
}

/// One user's conversation: the current session and its history window.
#[derive(Debug)]
pub struct ChatSession {
    orchestrator: ChatOrchestrator,
    session_id: Option<SessionId>,
    user_id: Option<UserId>,
    history: VecDeque<ChatMessage>,
}

impl ChatSession {
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    /// Messages in the prompt window, oldest first.
    pub fn history(&self) -> &VecDeque<ChatMessage> {
        &self.history
    }

    /// Run one turn. Retrieval and completion failures degrade; ledger
    /// failures and empty messages are errors.
    #[instrument(skip(self, message), fields(session_id = ?self.session_id))]
    pub async fn chat(&mut self, message: &str) -> CompanionResult<ChatReply> {
        if message.trim().is_empty() {
            return Err(CompanionError::invalid_input("message is empty"));
        }

        let session_id = match &self.session_id {
            Some(session_id) => session_id.clone(),
            None => self.reset_with_current_user().await?,
        };
        let orchestrator = &self.orchestrator;

        let detected_emotions = orchestrator.tagger.detect(message);
        orchestrator
            .sessions
            .record_emotions(&session_id, &detected_emotions)
            .await?;

        let documents = orchestrator.retrieve_for_turn(message).await;
        let messages = prompt::build_messages(&self.history, message, &documents);
        let response = orchestrator.complete_or_apologize(messages).await;

        let record = orchestrator
            .sessions
            .ledger()
            .append_conversation(NewConversation {
                session_id: session_id.clone(),
                user_message: message.to_owned(),
                ai_response: response.clone(),
                detected_emotions: detected_emotions.clone(),
                rag_docs_used: documents.iter().map(RetrievedDocument::snapshot).collect(),
            })
            .await?;

        if !orchestrator.sessions.record_message(&session_id).await? {
            error!(session_id = %session_id, "message recorded against unknown session");
        }

        self.push_history(message, &response);
        debug!(
            conversation_id = %record.id,
            rag_docs = documents.len(),
            "chat turn complete"
        );

        Ok(ChatReply {
            response,
            detected_emotions,
            rag_docs_count: documents.len(),
            conversation_id: record.id,
            session_id,
        })
    }

    /// Start a new session and clear the window. The old session is kept.
    pub async fn reset(&mut self, user_id: Option<UserId>) -> CompanionResult<SessionId> {
        self.user_id = user_id;
        self.reset_with_current_user().await
    }

    async fn reset_with_current_user(&mut self) -> CompanionResult<SessionId> {
        let session = self
            .orchestrator
            .sessions
            .create_session(self.user_id.clone())
            .await?;
        self.session_id = Some(session.id.clone());
        self.history.clear();
        Ok(session.id)
    }

    fn push_history(&mut self, user_message: &str, response: &str) {
        self.history.push_back(ChatMessage::user(user_message));
        self.history.push_back(ChatMessage::assistant(response));
        let limit = self.orchestrator.config.history_window * 2;
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}
