//! Knowledge documents, their metadata, and retrieval results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::emotion::Emotion;
use crate::error::{CompanionError, CompanionResult};
use crate::ids::DocumentId;

/// `type` tag of documents promoted from the live learning buffer.
pub const SOURCE_ACCEPTED_EXCHANGE: &str = "accepted-exchange";
/// `type` tag of documents re-mined from persisted history.
pub const SOURCE_HISTORICAL_SUCCESS: &str = "historical-success";

const RESERVED_KEYS: [&str; 4] = ["category", "type", "feedback_score", "emotions"];

/// Typed document metadata with a residual string map for forward
/// compatibility. Unknown keys land in `extra` when deserializing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emotions: Vec<Emotion>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl DocumentMetadata {
    pub fn categorized(category: impl Into<String>, source_type: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            source_type: Some(source_type.into()),
            ..Self::default()
        }
    }

    pub fn learned(source_type: &str, feedback_score: f64, emotions: Vec<Emotion>) -> Self {
        Self {
            source_type: Some(source_type.to_owned()),
            feedback_score: Some(feedback_score),
            emotions,
            ..Self::default()
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Boundary check applied before a document is persisted.
    pub fn validate(&self) -> CompanionResult<()> {
        if let Some(score) = self.feedback_score
            && !(score.is_finite() && (1.0..=5.0).contains(&score))
        {
            return Err(CompanionError::invalid_input(format!(
                "metadata feedback_score {score} outside [1, 5]"
            )));
        }
        for key in self.extra.keys() {
            if key.trim().is_empty() {
                return Err(CompanionError::invalid_input("empty metadata key"));
            }
            if RESERVED_KEYS.contains(&key.as_str()) {
                return Err(CompanionError::invalid_input(format!(
                    "metadata key `{key}` must use its typed field"
                )));
            }
        }
        Ok(())
    }
}

/// Content waiting to be embedded and inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDocument {
    pub content: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

impl NewDocument {
    pub fn new(content: impl Into<String>, metadata: DocumentMetadata) -> Self {
        Self {
            content: content.into(),
            metadata,
        }
    }
}

/// A persisted knowledge entry. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: DocumentMetadata,
    pub created_at: DateTime<Utc>,
}

/// Nearest-neighbor hit returned by retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: DocumentId,
    pub content: String,
    pub metadata: DocumentMetadata,
    /// Cosine distance to the query, in `[0, 2]`.
    pub distance: f32,
}

impl RetrievedDocument {
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            content: self.content.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Copy of a retrieved document kept on a conversation record. Not a live
/// reference: the source document may be gone after a reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub content: String,
    pub metadata: DocumentMetadata,
}

/// Outcome of a batch insert once writing has started.
///
/// Batches are not atomic as a whole: `inserted` is the prefix that was
/// persisted, and `failure` names the first item that was not. Items after
/// the failed one were not attempted.
#[derive(Debug)]
pub struct BatchInsertReport {
    pub inserted: Vec<DocumentId>,
    pub failure: Option<BatchFailure>,
}

impl BatchInsertReport {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug)]
pub struct BatchFailure {
    /// Position of the failed item in the submitted batch.
    pub index: usize,
    pub error: CompanionError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_roundtrip_keeps_every_key() {
        let metadata = DocumentMetadata::categorized("焦虑", "应对策略")
            .with_extra("source", "counseling-handbook");
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["type"], "应对策略");
        assert_eq!(json["source"], "counseling-handbook");
        let back: DocumentMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, metadata);
    }

    #[test]
    fn unknown_keys_land_in_extra() {
        let back: DocumentMetadata =
            serde_json::from_str(r#"{"category":"压力","author":"counselor"}"#).unwrap();
        assert_eq!(back.category.as_deref(), Some("压力"));
        assert_eq!(back.extra.get("author").map(String::as_str), Some("counselor"));
    }

    #[test]
    fn validate_rejects_out_of_range_score() {
        let metadata = DocumentMetadata::learned(SOURCE_ACCEPTED_EXCHANGE, 5.5, vec![]);
        assert!(metadata.validate().is_err());
        let metadata = DocumentMetadata::learned(SOURCE_ACCEPTED_EXCHANGE, 4.0, vec![]);
        assert!(metadata.validate().is_ok());
    }

    #[test]
    fn validate_rejects_reserved_extra_keys() {
        let metadata = DocumentMetadata::default().with_extra("category", "x");
        assert!(metadata.validate().is_err());
        let metadata = DocumentMetadata::default().with_extra(" ", "x");
        assert!(metadata.validate().is_err());
    }
}
