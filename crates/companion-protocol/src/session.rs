//! Sessions, conversation records, and aggregate statistics.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::emotion::Emotion;
use crate::ids::{ConversationId, SessionId, UserId};
use crate::knowledge::DocumentSnapshot;

/// One user interaction context with its aggregate fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub start_time: DateTime<Utc>,
    pub last_active_time: DateTime<Utc>,
    pub message_count: u64,
    /// Exact mean of the non-null feedback scores of this session's records.
    pub avg_feedback_score: Option<f64>,
}

impl Session {
    pub fn start(user_id: Option<UserId>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new_uuid(),
            user_id,
            start_time: now,
            last_active_time: now,
            message_count: 0,
            avg_feedback_score: None,
        }
    }
}

/// Fields of a conversation record before the store assigns its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConversation {
    pub session_id: SessionId,
    pub user_message: String,
    pub ai_response: String,
    pub detected_emotions: Vec<Emotion>,
    pub rag_docs_used: Vec<DocumentSnapshot>,
}

/// One persisted request/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub user_message: String,
    pub ai_response: String,
    pub detected_emotions: Vec<Emotion>,
    pub rag_docs_used: Vec<DocumentSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_text: Option<String>,
}

impl ConversationRecord {
    pub fn from_new(id: ConversationId, new: NewConversation) -> Self {
        Self {
            id,
            session_id: new.session_id,
            timestamp: Utc::now(),
            user_message: new.user_message,
            ai_response: new.ai_response,
            detected_emotions: new.detected_emotions,
            rag_docs_used: new.rag_docs_used,
            feedback_score: None,
            feedback_text: None,
        }
    }
}

/// Snapshot returned by `get_statistics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub session_id: SessionId,
    pub message_count: u64,
    pub avg_feedback_score: Option<f64>,
    /// Count per tag over every trend event of the session, in order of
    /// first appearance.
    pub emotion_distribution: IndexMap<Emotion, u64>,
    pub start_time: DateTime<Utc>,
    pub last_active_time: DateTime<Utc>,
}

/// Dominant-emotion summary of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EmotionPattern {
    InsufficientData,
    Dominant {
        main_emotion: Emotion,
        emotion_frequency: u64,
        total_messages: u64,
        avg_satisfaction: Option<f64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_session_is_empty() {
        let session = Session::start(Some(UserId::from_string("student_001")));
        assert_eq!(session.message_count, 0);
        assert!(session.avg_feedback_score.is_none());
        assert_eq!(session.start_time, session.last_active_time);
    }

    #[test]
    fn new_records_carry_no_feedback() {
        let record = ConversationRecord::from_new(
            ConversationId::FIRST,
            NewConversation {
                session_id: SessionId::from_string("s1"),
                user_message: "我很焦虑".into(),
                ai_response: "深呼吸试试".into(),
                detected_emotions: vec![Emotion::Anxiety],
                rag_docs_used: vec![],
            },
        );
        assert!(record.feedback_score.is_none());
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("feedback_score").is_none());
        assert_eq!(json["detected_emotions"][0], "焦虑");
    }

    #[test]
    fn emotion_pattern_is_tagged() {
        let json = serde_json::to_value(EmotionPattern::InsufficientData).unwrap();
        assert_eq!(json["status"], "insufficient_data");
    }
}
