use companion_protocol::{CompanionError, CompanionResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Exchanges (user + assistant pairs) kept in the prompt context.
    pub history_window: usize,
    pub top_k: usize,
    /// Declared minimum similarity. Only applied when
    /// `enforce_similarity_threshold` is set.
    pub similarity_threshold: f32,
    pub enforce_similarity_threshold: bool,
    /// Minimum feedback score for an exchange to become a learning candidate.
    pub quality_threshold: f64,
    /// Buffer size at which feedback promotes the learning buffer.
    pub min_buffer_size: usize,
    /// Buffer size flushed by an explicit learning trigger.
    pub trigger_buffer_size: usize,
    pub rag_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1000,
            history_window: 10,
            top_k: 3,
            similarity_threshold: 0.7,
            enforce_similarity_threshold: false,
            quality_threshold: 4.0,
            min_buffer_size: 5,
            trigger_buffer_size: 1,
            rag_enabled: true,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> CompanionResult<()> {
        if self.history_window == 0 {
            return Err(CompanionError::invalid_input("history window must be positive"));
        }
        if self.top_k == 0 {
            return Err(CompanionError::invalid_input("top_k must be positive"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(CompanionError::invalid_input(format!(
                "temperature {} outside [0, 2]",
                self.temperature
            )));
        }
        if !(1.0..=5.0).contains(&self.quality_threshold) {
            return Err(CompanionError::invalid_input(format!(
                "quality threshold {} outside [1, 5]",
                self.quality_threshold
            )));
        }
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(CompanionError::invalid_input(format!(
                "similarity threshold {} outside [-1, 1]",
                self.similarity_threshold
            )));
        }
        if self.max_tokens == 0 {
            return Err(CompanionError::invalid_input("max_tokens must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.history_window, 10);
        assert!(!config.enforce_similarity_threshold);
    }

    #[test]
    fn nonsense_values_are_rejected() {
        let cases = [
            RuntimeConfig {
                history_window: 0,
                ..RuntimeConfig::default()
            },
            RuntimeConfig {
                top_k: 0,
                ..RuntimeConfig::default()
            },
            RuntimeConfig {
                temperature: 2.5,
                ..RuntimeConfig::default()
            },
            RuntimeConfig {
                quality_threshold: 0.0,
                ..RuntimeConfig::default()
            },
            RuntimeConfig {
                temperature: f32::NAN,
                ..RuntimeConfig::default()
            },
        ];
        for config in cases {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: RuntimeConfig = serde_json::from_str(r#"{"top_k":5}"#).unwrap();
        assert_eq!(config.top_k, 5);
        assert_eq!(config.max_tokens, 1000);
    }
}
