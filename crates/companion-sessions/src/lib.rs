//! Session aggregates over a [`LedgerPort`].
//!
//! Read-modify-write of a session's aggregate fields (message count,
//! feedback average) is serialized per session id. Different sessions never
//! contend.

pub mod ledger;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use companion_protocol::{
    CompanionError, CompanionResult, ConversationId, ConversationRecord, Emotion, EmotionPattern,
    EmotionTrendEvent, LedgerPort, Session, SessionId, SessionStatistics, UserId,
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

pub use ledger::{FileLedger, MemoryLedger};

pub const MIN_FEEDBACK_SCORE: f64 = 1.0;
pub const MAX_FEEDBACK_SCORE: f64 = 5.0;

pub fn validate_feedback_score(score: f64) -> CompanionResult<()> {
    if score.is_finite() && (MIN_FEEDBACK_SCORE..=MAX_FEEDBACK_SCORE).contains(&score) {
        Ok(())
    } else {
        Err(CompanionError::invalid_input(format!(
            "feedback score {score} outside [{MIN_FEEDBACK_SCORE}, {MAX_FEEDBACK_SCORE}]"
        )))
    }
}

pub struct SessionAggregator {
    ledger: Arc<dyn LedgerPort>,
    locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for SessionAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAggregator")
            .field("tracked_sessions", &self.locks.lock().len())
            .finish_non_exhaustive()
    }
}

impl SessionAggregator {
    pub fn new(ledger: Arc<dyn LedgerPort>) -> Self {
        Self {
            ledger,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerPort> {
        &self.ledger
    }

    fn lock_for(&self, session_id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.locks.lock();
        guard
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    #[instrument(skip(self))]
    pub async fn create_session(&self, user_id: Option<UserId>) -> CompanionResult<Session> {
        let session = Session::start(user_id);
        self.ledger.put_session(&session).await?;
        info!(session_id = %session.id, "session created");
        Ok(session)
    }

    pub async fn session(&self, session_id: &SessionId) -> CompanionResult<Option<Session>> {
        self.ledger.session(session_id).await
    }

    /// Bump the message counter and activity time. Returns `false` for an
    /// unknown session; sessions are always created before first use, so
    /// callers treat that as a bug.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn record_message(&self, session_id: &SessionId) -> CompanionResult<bool> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let Some(mut session) = self.ledger.session(session_id).await? else {
            return Ok(false);
        };
        session.message_count += 1;
        session.last_active_time = Utc::now();
        self.ledger.put_session(&session).await?;
        debug!(message_count = session.message_count, "message recorded");
        Ok(true)
    }

    /// Append one trend event per tag.
    pub async fn record_emotions(
        &self,
        session_id: &SessionId,
        emotions: &[Emotion],
    ) -> CompanionResult<()> {
        for emotion in emotions {
            self.ledger
                .append_emotion(EmotionTrendEvent::new(session_id.clone(), *emotion))
                .await?;
        }
        Ok(())
    }

    /// Set feedback on a record and recompute the owning session's average
    /// from every score currently attached to it.
    ///
    /// The score is checked before anything is read or written, so a
    /// rejected call leaves the ledger unchanged.
    #[instrument(skip(self, text), fields(conversation_id = %conversation_id))]
    pub async fn record_feedback(
        &self,
        conversation_id: ConversationId,
        score: f64,
        text: Option<String>,
    ) -> CompanionResult<ConversationRecord> {
        validate_feedback_score(score)?;

        let record = self
            .ledger
            .conversation(conversation_id)
            .await?
            .ok_or_else(|| CompanionError::not_found(format!("conversation {conversation_id}")))?;
        let session_id = record.session_id;

        let lock = self.lock_for(&session_id);
        let _guard = lock.lock().await;

        let mut session = self
            .ledger
            .session(&session_id)
            .await?
            .ok_or_else(|| CompanionError::not_found(format!("session {session_id}")))?;

        let updated = self.ledger.set_feedback(conversation_id, score, text).await?;
        let scores = self.ledger.session_scores(&session_id).await?;
        session.avg_feedback_score = mean(&scores);
        self.ledger.put_session(&session).await?;

        info!(
            session_id = %session_id,
            score,
            avg = ?session.avg_feedback_score,
            "feedback recorded"
        );
        Ok(updated)
    }

    /// The average is recomputed from the stored scores rather than read
    /// from the session row, so it holds even if the session write that
    /// follows a feedback write failed.
    pub async fn get_statistics(
        &self,
        session_id: &SessionId,
    ) -> CompanionResult<Option<SessionStatistics>> {
        let Some(session) = self.ledger.session(session_id).await? else {
            return Ok(None);
        };

        let mut emotion_distribution: IndexMap<Emotion, u64> = IndexMap::new();
        for event in self.ledger.session_emotions(session_id).await? {
            *emotion_distribution.entry(event.emotion).or_insert(0) += 1;
        }

        Ok(Some(SessionStatistics {
            session_id: session.id,
            message_count: session.message_count,
            avg_feedback_score: mean(&self.ledger.session_scores(session_id).await?),
            emotion_distribution,
            start_time: session.start_time,
            last_active_time: session.last_active_time,
        }))
    }

    /// Most frequent tag of the session; ties go to the tag seen first.
    pub async fn emotion_pattern(&self, session_id: &SessionId) -> CompanionResult<EmotionPattern> {
        let Some(stats) = self.get_statistics(session_id).await? else {
            return Ok(EmotionPattern::InsufficientData);
        };

        let mut dominant: Option<(Emotion, u64)> = None;
        for (emotion, count) in &stats.emotion_distribution {
            if dominant.is_none_or(|(_, best)| *count > best) {
                dominant = Some((*emotion, *count));
            }
        }

        Ok(match dominant {
            None => EmotionPattern::InsufficientData,
            Some((main_emotion, emotion_frequency)) => EmotionPattern::Dominant {
                main_emotion,
                emotion_frequency,
                total_messages: stats.message_count,
                avg_satisfaction: stats.avg_feedback_score,
            },
        })
    }

    /// Newest `limit` records of the session, oldest first.
    pub async fn history(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> CompanionResult<Vec<ConversationRecord>> {
        self.ledger.recent_conversations(session_id, limit).await
    }
}

fn mean(scores: &[f64]) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    Some(scores.iter().sum::<f64>() / scores.len() as f64)
}
