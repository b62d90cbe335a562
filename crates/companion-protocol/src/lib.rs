//! # companion-protocol: shared contract of the knowledge subsystem
//!
//! Types, error taxonomy, and trait interfaces that every companion crate
//! depends on. Dependency-light on purpose (no tokio, no HTTP client) so it
//! can be used as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`]: SessionId, UserId, DocumentId, ConversationId
//! - [`emotion`]: Emotion tags, Intensity, EmotionTrendEvent
//! - [`knowledge`]: Document, DocumentMetadata, RetrievedDocument, batch reports
//! - [`session`]: Session, ConversationRecord, SessionStatistics, EmotionPattern
//! - [`ports`]: embedding, completion, vector index, and ledger ports
//! - [`error`]: CompanionError, CompanionResult

pub mod emotion;
pub mod error;
pub mod ids;
pub mod knowledge;
pub mod ports;
pub mod session;

pub use emotion::{Emotion, EmotionTrendEvent, Intensity};
pub use error::{CompanionError, CompanionResult, ErrorKind};
pub use ids::{ConversationId, DocumentId, SessionId, UserId};
pub use knowledge::{
    BatchFailure, BatchInsertReport, Document, DocumentMetadata, DocumentSnapshot, NewDocument,
    RetrievedDocument, SOURCE_ACCEPTED_EXCHANGE, SOURCE_HISTORICAL_SUCCESS,
};
pub use ports::{
    ChatMessage, ChatRole, CompletionPort, CompletionRequest, EmbeddingPort, LedgerPort,
    VectorIndexPort,
};
pub use session::{
    ConversationRecord, EmotionPattern, NewConversation, Session, SessionStatistics,
};
