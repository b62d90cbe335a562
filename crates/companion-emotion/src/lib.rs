//! Keyword emotion tagging.
//!
//! [`EmotionTagger::detect`] maps a message to the emotion categories whose
//! keywords it contains, or to `中性` when none match. Pure and infallible.

use companion_protocol::Emotion;

/// Keyword table: a category is emitted when any of its substrings occurs in
/// the lowercased message. Containment, not word match: `累` also matches
/// inside `太累了`.
const KEYWORDS: [(Emotion, &[&str]); 7] = [
    (
        Emotion::Anxiety,
        &["焦虑", "紧张", "担心", "害怕", "恐慌", "不安"],
    ),
    (
        Emotion::Stress,
        &["压力", "压力大", "负担", "承受不了", "太累了"],
    ),
    (
        Emotion::Confusion,
        &["困惑", "迷茫", "不知道", "怎么办", "纠结"],
    ),
    (
        Emotion::Frustration,
        &["沮丧", "难过", "失落", "失望", "挫败", "痛苦"],
    ),
    (
        Emotion::Loneliness,
        &["孤独", "寂寞", "孤单", "没人", "独自"],
    ),
    (Emotion::Fatigue, &["疲惫", "累", "疲劳", "困", "精疲力竭"]),
    (
        Emotion::Positive,
        &["开心", "高兴", "好", "棒", "感谢", "进步"],
    ),
];

/// Pure keyword classifier over a fixed table.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmotionTagger;

impl EmotionTagger {
    pub fn new() -> Self {
        Self
    }

    /// Tags in table order, or `[Neutral]` when nothing matches.
    pub fn detect(&self, message: &str) -> Vec<Emotion> {
        let message = message.to_lowercase();
        let detected: Vec<Emotion> = KEYWORDS
            .iter()
            .filter(|(_, keywords)| keywords.iter().any(|keyword| message.contains(keyword)))
            .map(|(emotion, _)| *emotion)
            .collect();

        if detected.is_empty() {
            vec![Emotion::Neutral]
        } else {
            detected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_two_categories_in_one_message() {
        let tags = EmotionTagger::new().detect("我很焦虑，压力很大");
        assert!(tags.contains(&Emotion::Anxiety));
        assert!(tags.contains(&Emotion::Stress));
    }

    #[test]
    fn falls_back_to_neutral() {
        assert_eq!(
            EmotionTagger::new().detect("今天下午去图书馆"),
            vec![Emotion::Neutral]
        );
        assert_eq!(EmotionTagger::new().detect(""), vec![Emotion::Neutral]);
    }

    #[test]
    fn substring_matches_inside_larger_words() {
        // `困` (sleepy) sits inside `困难`, so fatigue is tagged too.
        let tags = EmotionTagger::new().detect("遇到困难");
        assert_eq!(tags, vec![Emotion::Fatigue]);
    }

    #[test]
    fn output_follows_table_order_without_duplicates() {
        let tags = EmotionTagger::new().detect("太累了，好累，好孤单");
        assert_eq!(
            tags,
            vec![
                Emotion::Stress,
                Emotion::Loneliness,
                Emotion::Fatigue,
                Emotion::Positive
            ]
        );
    }

    #[test]
    fn mixed_script_messages_still_match() {
        let tags = EmotionTagger::new().detect("Final EXAM 让我很紧张");
        assert_eq!(tags, vec![Emotion::Anxiety]);
    }
}
