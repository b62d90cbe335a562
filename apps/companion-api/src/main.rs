use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Args, Parser};
use companion_kernel::{CompanionBuilder, CompanionKernel, CompletionBackend, EmbeddingBackend};
use companion_protocol::{
    CompanionError, ConversationId, EmotionPattern, ErrorKind, SessionId, SessionStatistics,
    UserId,
};
use companion_providers::{
    DEFAULT_BASE_URL, DEFAULT_CHAT_MODEL, DEFAULT_DIMENSION, DEFAULT_EMBEDDING_MODEL, OpenAiConfig,
};
use companion_runtime::{ChatReply, ChatSession, KnowledgeInfo, RuntimeConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

mod openapi;

use crate::openapi::{openapi_spec, scalar_docs_html};

#[derive(Debug, Parser)]
#[command(name = "companion-api")]
#[command(about = "Student companion HTTP API")]
struct Cli {
    #[arg(long, env = "COMPANION_ROOT", default_value = ".companion")]
    root: PathBuf,
    #[arg(long, env = "COMPANION_LISTEN", default_value = "127.0.0.1:8787")]
    listen: SocketAddr,
    #[command(flatten)]
    providers: ProviderArgs,
}

#[derive(Debug, Args)]
struct ProviderArgs {
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,
    #[arg(long, env = "OPENAI_MODEL", default_value = DEFAULT_CHAT_MODEL)]
    model: String,
    #[arg(long, env = "TEMPERATURE", default_value_t = 0.7)]
    temperature: f32,
    #[arg(long, env = "MAX_TOKENS", default_value_t = 1000)]
    max_tokens: u32,
    #[arg(long, env = "MAX_CONVERSATION_HISTORY", default_value_t = 10)]
    history_window: usize,
    #[arg(long, default_value_t = 3)]
    top_k: usize,
    #[arg(long)]
    remote_embeddings: bool,
    #[arg(long, env = "EMBEDDING_MODEL", default_value = DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,
    #[arg(long, env = "EMBEDDING_DIMENSION", default_value_t = DEFAULT_DIMENSION)]
    embedding_dimension: usize,
}

impl ProviderArgs {
    fn openai(&self, model: &str) -> OpenAiConfig {
        let config = OpenAiConfig::new(model).with_base_url(&self.base_url);
        match &self.api_key {
            Some(key) => config.with_api_key(key.clone()),
            None => config,
        }
    }

    fn builder(&self, root: PathBuf) -> CompanionBuilder {
        let embedding = if self.remote_embeddings {
            EmbeddingBackend::OpenAi {
                config: self.openai(&self.embedding_model),
                dimension: self.embedding_dimension,
            }
        } else {
            EmbeddingBackend::Hashing {
                dimension: self.embedding_dimension,
            }
        };
        CompanionBuilder::new(root)
            .runtime_config(RuntimeConfig {
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                history_window: self.history_window,
                top_k: self.top_k,
                ..RuntimeConfig::default()
            })
            .embedding(embedding)
            .completion(CompletionBackend::OpenAi(self.openai(&self.model)))
    }
}

type ChatHandle = Arc<Mutex<ChatSession>>;

/// Live chat handles keyed by session. A session missing here is resumed
/// from the ledger on first use.
#[derive(Clone)]
struct AppState {
    kernel: CompanionKernel,
    chats: Arc<RwLock<HashMap<SessionId, ChatHandle>>>,
}

impl AppState {
    fn new(kernel: CompanionKernel) -> Self {
        Self {
            kernel,
            chats: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn chat_handle(&self, session_id: &SessionId) -> ApiResult<ChatHandle> {
        if let Some(handle) = self.chats.read().await.get(session_id) {
            return Ok(Arc::clone(handle));
        }
        let chat = self.kernel.orchestrator().resume(session_id).await?;
        let mut chats = self.chats.write().await;
        let handle = chats
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(chat)));
        Ok(Arc::clone(handle))
    }

    /// Persists a new session and registers its handle.
    async fn start_chat(&self, user_id: Option<UserId>) -> ApiResult<SessionCreated> {
        let chat = self.kernel.orchestrator().start_session(user_id).await?;
        let Some(session_id) = chat.session_id().cloned() else {
            return Err(CompanionError::store_unavailable("session was not persisted").into());
        };
        let user_id = chat.user_id().cloned();

        self.chats
            .write()
            .await
            .insert(session_id.clone(), Arc::new(Mutex::new(chat)));
        Ok(SessionCreated {
            session_id,
            user_id,
        })
    }
}

#[derive(Debug, Deserialize, Default)]
struct CreateSessionRequest {
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SessionCreated {
    session_id: SessionId,
    user_id: Option<UserId>,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    score: f64,
    text: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LearnRequest {
    min_score: Option<f64>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<CompanionError> for ApiError {
    fn from(error: CompanionError) -> Self {
        let status = match error.kind() {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::StoreUnavailable | ErrorKind::EmbeddingUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::CompletionFailure => StatusCode::BAD_GATEWAY,
            ErrorKind::Serialization => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(docs))
        .route("/sessions", post(create_session))
        .route("/sessions/{session_id}/chat", post(chat))
        .route("/sessions/{session_id}/reset", post(reset_session))
        .route("/sessions/{session_id}/stats", get(session_stats))
        .route(
            "/sessions/{session_id}/emotion-pattern",
            get(emotion_pattern),
        )
        .route(
            "/conversations/{conversation_id}/feedback",
            post(add_feedback),
        )
        .route("/learning/trigger", post(trigger_learning))
        .route("/knowledge", get(knowledge_info))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let kernel = cli.providers.builder(cli.root.clone()).build().await?;
    let app = router(AppState::new(kernel));

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(listen = %cli.listen, root = %cli.root.display(), "companion-api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "companion-api"
    }))
}

async fn openapi_json() -> Json<serde_json::Value> {
    Json(openapi_spec())
}

async fn docs() -> Html<String> {
    Html(scalar_docs_html("/openapi.json"))
}

async fn create_session(
    State(state): State<AppState>,
    request: Option<Json<CreateSessionRequest>>,
) -> ApiResult<Json<SessionCreated>> {
    let request = request.map(|Json(request)| request).unwrap_or_default();
    let created = state
        .start_chat(request.user_id.map(UserId::from_string))
        .await?;
    Ok(Json(created))
}

async fn chat(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Json<ChatReply>> {
    let session_id = SessionId::from_string(session_id);
    let handle = state.chat_handle(&session_id).await?;
    let reply = handle.lock().await.chat(&request.message).await?;
    Ok(Json(reply))
}

/// Starts a fresh session for the same user. The old session keeps its own
/// handle, so a request already queued on it still lands there.
async fn reset_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<SessionCreated>> {
    let session_id = SessionId::from_string(session_id);
    let handle = state.chat_handle(&session_id).await?;
    let user_id = handle.lock().await.user_id().cloned();

    let created = state.start_chat(user_id).await?;
    info!(from = %session_id, to = %created.session_id, "session reset");
    Ok(Json(created))
}

async fn session_stats(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<SessionStatistics>> {
    let session_id = SessionId::from_string(session_id);
    state
        .kernel
        .orchestrator()
        .session_statistics(&session_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("unknown session {session_id}")))
}

async fn emotion_pattern(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<EmotionPattern>> {
    let session_id = SessionId::from_string(session_id);
    let pattern = state
        .kernel
        .orchestrator()
        .emotion_pattern(&session_id)
        .await?;
    Ok(Json(pattern))
}

async fn add_feedback(
    Path(conversation_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<FeedbackRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let conversation_id = parse_conversation_id(&conversation_id)?;
    let success = state
        .kernel
        .orchestrator()
        .add_feedback(conversation_id, request.score, request.text)
        .await?;
    Ok(Json(json!({ "success": success })))
}

async fn trigger_learning(
    State(state): State<AppState>,
    request: Option<Json<LearnRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    let request = request.map(|Json(request)| request).unwrap_or_default();
    let orchestrator = state.kernel.orchestrator();
    let min_score = request
        .min_score
        .unwrap_or(orchestrator.config().quality_threshold);
    let learned = orchestrator.trigger_learning(min_score).await?;
    Ok(Json(json!({ "learned": learned })))
}

async fn knowledge_info(
    State(state): State<AppState>,
) -> ApiResult<Json<KnowledgeInfo>> {
    let info = state.kernel.orchestrator().knowledge_info().await?;
    Ok(Json(info))
}

fn parse_conversation_id(raw: &str) -> ApiResult<ConversationId> {
    match raw.parse::<u64>() {
        Ok(value) if value > 0 => Ok(ConversationId::new(value)),
        _ => Err(ApiError::bad_request(format!(
            "invalid conversation id: {raw}"
        ))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use companion_protocol::{CompanionResult, CompletionPort, CompletionRequest};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    struct EchoCompletion;

    #[async_trait]
    impl CompletionPort for EchoCompletion {
        async fn complete(&self, request: CompletionRequest) -> CompanionResult<String> {
            Ok(format!("收到{}条消息", request.messages.len()))
        }
    }

    async fn test_state() -> Result<AppState> {
        let kernel = CompanionBuilder::in_memory()
            .embedding(EmbeddingBackend::Hashing { dimension: 64 })
            .completion(CompletionBackend::Custom(Arc::new(EchoCompletion)))
            .build()
            .await?;
        Ok(AppState::new(kernel))
    }

    async fn test_app() -> Result<Router> {
        Ok(router(test_state().await?))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> Result<(StatusCode, Value)> {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?,
            None => request.body(Body::empty())?,
        };
        let response = app.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((status, value))
    }

    #[tokio::test]
    async fn chat_feedback_and_stats_round() -> Result<()> {
        let app = test_app().await?;
        let (status, created) = send(&app, Method::POST, "/sessions", Some(json!({"user_id": "u1"}))).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["user_id"], "u1");
        let session_id = created["session_id"].as_str().unwrap_or_default().to_owned();

        let (status, reply) = send(
            &app,
            Method::POST,
            &format!("/sessions/{session_id}/chat"),
            Some(json!({"message": "考试前我很焦虑"})),
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["session_id"], session_id.as_str());
        assert_eq!(reply["detected_emotions"], json!(["焦虑"]));
        let conversation_id = reply["conversation_id"].as_u64().unwrap_or_default();

        let (status, body) = send(
            &app,
            Method::POST,
            &format!("/conversations/{conversation_id}/feedback"),
            Some(json!({"score": 4.0, "text": "有用"})),
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, stats) = send(&app, Method::GET, &format!("/sessions/{session_id}/stats"), None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["message_count"], 1);
        assert_eq!(stats["avg_feedback_score"], 4.0);

        let (status, pattern) = send(
            &app,
            Method::GET,
            &format!("/sessions/{session_id}/emotion-pattern"),
            None,
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pattern["status"], "dominant");
        Ok(())
    }

    #[tokio::test]
    async fn errors_map_to_statuses() -> Result<()> {
        let app = test_app().await?;

        let (status, body) = send(&app, Method::POST, "/sessions/nope/chat", Some(json!({"message": "你好"}))).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());

        let (status, _) = send(&app, Method::POST, "/conversations/abc/feedback", Some(json!({"score": 3.0}))).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::POST, "/conversations/99/feedback", Some(json!({"score": 3.0}))).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, Method::GET, "/sessions/nope/stats", None).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn out_of_range_score_is_rejected() -> Result<()> {
        let app = test_app().await?;
        let (_, created) = send(&app, Method::POST, "/sessions", None).await?;
        let session_id = created["session_id"].as_str().unwrap_or_default().to_owned();
        let (_, reply) = send(
            &app,
            Method::POST,
            &format!("/sessions/{session_id}/chat"),
            Some(json!({"message": "你好"})),
        )
        .await?;
        let conversation_id = reply["conversation_id"].as_u64().unwrap_or_default();

        let (status, _) = send(
            &app,
            Method::POST,
            &format!("/conversations/{conversation_id}/feedback"),
            Some(json!({"score": 6.0})),
        )
        .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, stats) = send(&app, Method::GET, &format!("/sessions/{session_id}/stats"), None).await?;
        assert_eq!(stats["avg_feedback_score"], Value::Null);
        Ok(())
    }

    #[tokio::test]
    async fn reset_starts_a_fresh_session() -> Result<()> {
        let app = test_app().await?;
        let (_, created) = send(&app, Method::POST, "/sessions", None).await?;
        let old_id = created["session_id"].as_str().unwrap_or_default().to_owned();

        let (status, reset) = send(&app, Method::POST, &format!("/sessions/{old_id}/reset"), None).await?;
        assert_eq!(status, StatusCode::OK);
        let new_id = reset["session_id"].as_str().unwrap_or_default().to_owned();
        assert_ne!(new_id, old_id);

        let (status, reply) = send(
            &app,
            Method::POST,
            &format!("/sessions/{new_id}/chat"),
            Some(json!({"message": "你好"})),
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["session_id"], new_id.as_str());
        Ok(())
    }

    #[tokio::test]
    async fn reset_leaves_the_old_handle_on_its_session() -> Result<()> {
        let state = test_state().await?;
        let app = router(state.clone());
        let (_, created) = send(&app, Method::POST, "/sessions", None).await?;
        let old_id = SessionId::from_string(created["session_id"].as_str().unwrap_or_default());
        let old_handle = state
            .chat_handle(&old_id)
            .await
            .map_err(|error| anyhow::anyhow!(error.message))?;

        let (status, reset) = send(&app, Method::POST, &format!("/sessions/{old_id}/reset"), None).await?;
        assert_eq!(status, StatusCode::OK);
        let new_id = SessionId::from_string(reset["session_id"].as_str().unwrap_or_default());

        assert_eq!(old_handle.lock().await.session_id(), Some(&old_id));
        let new_handle = state
            .chat_handle(&new_id)
            .await
            .map_err(|error| anyhow::anyhow!(error.message))?;
        assert!(!Arc::ptr_eq(&old_handle, &new_handle));

        let (status, reply) = send(
            &app,
            Method::POST,
            &format!("/sessions/{old_id}/chat"),
            Some(json!({"message": "你好"})),
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["session_id"], old_id.as_str());
        Ok(())
    }

    #[tokio::test]
    async fn knowledge_and_learning_endpoints() -> Result<()> {
        let app = test_app().await?;
        let (status, info) = send(&app, Method::GET, "/knowledge", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["document_count"], 8);
        assert_eq!(info["dimension"], 64);

        let (status, learned) = send(&app, Method::POST, "/learning/trigger", Some(json!({}))).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(learned["learned"], 0);

        let (status, health) = send(&app, Method::GET, "/healthz", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["service"], "companion-api");
        Ok(())
    }

    #[test]
    fn conversation_ids_must_be_positive_integers() {
        assert!(parse_conversation_id("0").is_err());
        assert!(parse_conversation_id("-3").is_err());
        assert_eq!(
            parse_conversation_id("7").map(ConversationId::get).ok(),
            Some(7)
        );
    }
}
