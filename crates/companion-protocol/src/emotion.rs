//! Emotion tags and trend events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::SessionId;

/// Closed set of emotion categories. Serialized by their user-facing label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Emotion {
    #[serde(rename = "焦虑")]
    Anxiety,
    #[serde(rename = "压力")]
    Stress,
    #[serde(rename = "困惑")]
    Confusion,
    #[serde(rename = "沮丧")]
    Frustration,
    #[serde(rename = "孤独")]
    Loneliness,
    #[serde(rename = "疲惫")]
    Fatigue,
    #[serde(rename = "积极")]
    Positive,
    #[serde(rename = "中性")]
    Neutral,
}

impl Emotion {
    pub const ALL: [Emotion; 8] = [
        Emotion::Anxiety,
        Emotion::Stress,
        Emotion::Confusion,
        Emotion::Frustration,
        Emotion::Loneliness,
        Emotion::Fatigue,
        Emotion::Positive,
        Emotion::Neutral,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Emotion::Anxiety => "焦虑",
            Emotion::Stress => "压力",
            Emotion::Confusion => "困惑",
            Emotion::Frustration => "沮丧",
            Emotion::Loneliness => "孤独",
            Emotion::Fatigue => "疲惫",
            Emotion::Positive => "积极",
            Emotion::Neutral => "中性",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|emotion| emotion.label() == label)
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Three-level intensity schema. Only `Medium` is recorded today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    Low,
    #[default]
    Medium,
    High,
}

/// Append-only log entry: one per detected emotion per exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionTrendEvent {
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub emotion: Emotion,
    pub intensity: Intensity,
}

impl EmotionTrendEvent {
    pub fn new(session_id: SessionId, emotion: Emotion) -> Self {
        Self {
            session_id,
            timestamp: Utc::now(),
            emotion,
            intensity: Intensity::Medium,
        }
    }
}
