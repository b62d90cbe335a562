//! Concrete [`EmbeddingPort`](companion_protocol::EmbeddingPort) and
//! [`CompletionPort`](companion_protocol::CompletionPort) implementations.

pub mod hashing;
pub mod openai;

pub use hashing::{DEFAULT_DIMENSION, HashingEmbedder};
pub use openai::{
    DEFAULT_BASE_URL, DEFAULT_CHAT_MODEL, DEFAULT_EMBEDDING_MODEL, OpenAiCompletion,
    OpenAiConfig, OpenAiEmbedder,
};
