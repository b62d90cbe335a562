//! OpenAI-compatible HTTP providers (`/chat/completions`, `/embeddings`).
//!
//! Any server speaking the same wire format works: set `base_url` to its
//! `/v1` root.

use std::time::Duration;

use async_trait::async_trait;
use companion_protocol::{
    ChatMessage, CompanionError, CompanionResult, CompletionPort, CompletionRequest, EmbeddingPort,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection settings shared by both clients.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            api_key: None,
            model: model.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(api_key.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }

    fn client(&self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder().timeout(self.timeout).build()
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key.expose_secret()),
            None => request,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatCompletionResponse {
    fn into_text(self) -> CompanionResult<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| CompanionError::CompletionFailure("response had no choices".into()))
    }
}

/// `/chat/completions` client.
#[derive(Debug, Clone)]
pub struct OpenAiCompletion {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiCompletion {
    pub fn new(config: OpenAiConfig) -> CompanionResult<Self> {
        let client = config
            .client()
            .map_err(|e| CompanionError::CompletionFailure(format!("http client: {e}")))?;
        Ok(Self { config, client })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl CompletionPort for OpenAiCompletion {
    #[instrument(skip(self, request), fields(model = %self.config.model, messages = request.messages.len()))]
    async fn complete(&self, request: CompletionRequest) -> CompanionResult<String> {
        let failure = |e: reqwest::Error| CompanionError::CompletionFailure(e.to_string());
        let body = ChatCompletionBody {
            model: &self.config.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .config
            .authorize(self.client.post(self.config.endpoint("chat/completions")))
            .json(&body)
            .send()
            .await
            .map_err(failure)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(CompanionError::CompletionFailure(format!(
                "completion endpoint returned {status}: {detail}"
            )));
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(failure)?;
        let text = parsed.into_text()?;
        debug!(chars = text.chars().count(), "completion received");
        Ok(text)
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingBody<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// `/embeddings` client. Requests `dimension` outputs and rejects any
/// response of another length.
#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    config: OpenAiConfig,
    client: reqwest::Client,
    dimension: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: OpenAiConfig, dimension: usize) -> CompanionResult<Self> {
        if dimension == 0 {
            return Err(CompanionError::invalid_input(
                "embedding dimension must be positive",
            ));
        }
        let client = config
            .client()
            .map_err(|e| CompanionError::EmbeddingUnavailable(format!("http client: {e}")))?;
        Ok(Self {
            config,
            client,
            dimension,
        })
    }
}

fn first_embedding(response: EmbeddingResponse, expected: usize) -> CompanionResult<Vec<f32>> {
    let embedding = response
        .data
        .into_iter()
        .next()
        .map(|datum| datum.embedding)
        .ok_or_else(|| CompanionError::EmbeddingUnavailable("response had no data".into()))?;
    if embedding.len() != expected {
        return Err(CompanionError::EmbeddingUnavailable(format!(
            "endpoint returned {} dimensions, expected {expected}",
            embedding.len()
        )));
    }
    Ok(embedding)
}

#[async_trait]
impl EmbeddingPort for OpenAiEmbedder {
    fn model(&self) -> &str {
        &self.config.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    #[instrument(skip(self, text), fields(model = %self.config.model))]
    async fn embed(&self, text: &str) -> CompanionResult<Vec<f32>> {
        let unavailable = |e: reqwest::Error| CompanionError::EmbeddingUnavailable(e.to_string());
        let body = EmbeddingBody {
            model: &self.config.model,
            input: text,
            dimensions: self.dimension,
        };

        let response = self
            .config
            .authorize(self.client.post(self.config.endpoint("embeddings")))
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if !status.is_success() {
            return Err(CompanionError::EmbeddingUnavailable(format!(
                "embedding endpoint returned {status}"
            )));
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(unavailable)?;
        first_embedding(parsed, self.dimension)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use companion_protocol::ErrorKind;

    use super::*;

    #[test]
    fn endpoint_joins_without_double_slash() {
        let config = OpenAiConfig::new(DEFAULT_CHAT_MODEL).with_base_url("http://localhost:8080/v1/");
        assert_eq!(
            config.endpoint("chat/completions"),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[test]
    fn api_key_is_redacted_in_debug() {
        let config = OpenAiConfig::new(DEFAULT_CHAT_MODEL).with_api_key("sk-live-secret");
        assert!(!format!("{config:?}").contains("sk-live-secret"));
    }

    #[test]
    fn chat_body_matches_wire_format() -> Result<()> {
        let messages = vec![ChatMessage::system("你是助手"), ChatMessage::user("你好")];
        let body = ChatCompletionBody {
            model: DEFAULT_CHAT_MODEL,
            messages: &messages,
            temperature: 0.5,
            max_tokens: 1000,
        };
        let json = serde_json::to_value(&body)?;
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "你好");
        assert_eq!(json["max_tokens"], 1000);
        Ok(())
    }

    #[test]
    fn completion_response_takes_first_choice() -> Result<()> {
        let parsed: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"深呼吸"}}]}"#,
        )?;
        assert_eq!(parsed.into_text()?, "深呼吸");

        let empty: ChatCompletionResponse = serde_json::from_str(r#"{"choices":[]}"#)?;
        assert_eq!(empty.into_text().unwrap_err().kind(), ErrorKind::CompletionFailure);
        Ok(())
    }

    #[test]
    fn embedding_response_of_wrong_length_is_rejected() -> Result<()> {
        let parsed: EmbeddingResponse =
            serde_json::from_str(r#"{"data":[{"embedding":[0.1,0.2,0.3]}]}"#)?;
        let err = first_embedding(parsed, 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmbeddingUnavailable);

        let parsed: EmbeddingResponse =
            serde_json::from_str(r#"{"data":[{"embedding":[0.1,0.2,0.3]}]}"#)?;
        assert_eq!(first_embedding(parsed, 3)?.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_endpoint_maps_to_completion_failure() -> Result<()> {
        let config = OpenAiConfig::new(DEFAULT_CHAT_MODEL)
            .with_base_url("http://127.0.0.1:9/v1")
            .with_timeout(Duration::from_secs(2));
        let completion = OpenAiCompletion::new(config)?;
        let err = completion
            .complete(CompletionRequest {
                messages: vec![ChatMessage::user("你好")],
                temperature: 0.7,
                max_tokens: 16,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CompletionFailure);
        Ok(())
    }
}
