//! Vector knowledge store.
//!
//! [`KnowledgeStore`] owns documents and their vectors behind a
//! [`VectorIndexPort`]. Id assignment is serialized by a single writer lock;
//! embedding calls never run under it. Retrieval scores an `Arc` snapshot of
//! the index and takes no lock at all.

pub mod index;
pub mod seed;

use std::sync::Arc;

use chrono::Utc;
use companion_protocol::{
    BatchFailure, BatchInsertReport, CompanionError, CompanionResult, Document, DocumentId,
    DocumentMetadata, EmbeddingPort, NewDocument, RetrievedDocument, VectorIndexPort,
};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

pub use index::{FileVectorIndex, MemoryVectorIndex};

pub const DEFAULT_TOP_K: usize = 3;

/// Cosine distance `1 - cos(a, b)`, clamped to `[0, 2]`. A zero vector is at
/// distance 1 from everything.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 2.0)
}

/// Document count and embedding model, for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnowledgeInfo {
    pub document_count: usize,
    pub embedding_model: String,
    pub dimension: usize,
}

pub struct KnowledgeStore {
    embedder: Arc<dyn EmbeddingPort>,
    index: Arc<dyn VectorIndexPort>,
    default_top_k: usize,
    writer: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for KnowledgeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeStore")
            .field("embedding_model", &self.embedder.model())
            .field("dimension", &self.embedder.dimension())
            .field("default_top_k", &self.default_top_k)
            .finish_non_exhaustive()
    }
}

impl KnowledgeStore {
    pub fn new(embedder: Arc<dyn EmbeddingPort>, index: Arc<dyn VectorIndexPort>) -> Self {
        Self {
            embedder,
            index,
            default_top_k: DEFAULT_TOP_K,
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_default_top_k(mut self, top_k: usize) -> Self {
        self.default_top_k = top_k;
        self
    }

    /// Configured dimensionality; every stored vector has this length.
    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    pub fn default_top_k(&self) -> usize {
        self.default_top_k
    }

    /// Embed, assign the next id, and persist as one unit.
    #[instrument(skip_all)]
    pub async fn insert(
        &self,
        content: impl Into<String>,
        metadata: DocumentMetadata,
    ) -> CompanionResult<DocumentId> {
        let item = NewDocument::new(content, metadata);
        validate_item(&item)?;
        let embedding = self.embed_checked(&item.content).await?;

        let _writer = self.writer.lock().await;
        let id = self.next_id().await?;
        self.index
            .append(Document {
                id,
                content: item.content,
                embedding,
                metadata: item.metadata,
                created_at: Utc::now(),
            })
            .await?;
        info!(document_id = %id, "knowledge document inserted");
        Ok(id)
    }

    /// Insert several documents.
    ///
    /// Not atomic across the batch. Validation and embedding happen for every
    /// item before anything is written; a failure there returns `Err` and the
    /// store is untouched. Once writing starts, the first failing append stops
    /// the batch: the report lists the persisted prefix and the failure, and
    /// later items are not attempted.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn insert_batch(&self, items: Vec<NewDocument>) -> CompanionResult<BatchInsertReport> {
        for item in &items {
            validate_item(item)?;
        }

        let mut embedded = Vec::with_capacity(items.len());
        for item in items {
            let embedding = self.embed_checked(&item.content).await?;
            embedded.push((item, embedding));
        }

        let _writer = self.writer.lock().await;
        let mut inserted = Vec::with_capacity(embedded.len());
        for (position, (item, embedding)) in embedded.into_iter().enumerate() {
            let appended = match self.next_id().await {
                Ok(id) => self
                    .index
                    .append(Document {
                        id,
                        content: item.content,
                        embedding,
                        metadata: item.metadata,
                        created_at: Utc::now(),
                    })
                    .await
                    .map(|()| id),
                Err(error) => Err(error),
            };

            match appended {
                Ok(id) => inserted.push(id),
                Err(error) => {
                    warn!(index = position, inserted = inserted.len(), %error, "batch insert stopped");
                    return Ok(BatchInsertReport {
                        inserted,
                        failure: Some(BatchFailure {
                            index: position,
                            error,
                        }),
                    });
                }
            }
        }

        info!(inserted = inserted.len(), "knowledge batch inserted");
        Ok(BatchInsertReport {
            inserted,
            failure: None,
        })
    }

    /// Up to `top_k` nearest documents by ascending distance, ties by lower
    /// id. No similarity cutoff is applied here.
    #[instrument(skip(self, query))]
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: Option<usize>,
    ) -> CompanionResult<Vec<RetrievedDocument>> {
        let k = top_k.unwrap_or(self.default_top_k);
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embed_checked(query).await?;
        let snapshot = self.index.documents().await?;
        let dimension = self.dimension();

        let mut scored: Vec<(f32, &Arc<Document>)> = snapshot
            .iter()
            .filter(|document| document.embedding.len() == dimension)
            .map(|document| (cosine_distance(&query_vector, &document.embedding), document))
            .collect();
        scored.sort_by(|(da, a), (db, b)| {
            da.total_cmp(db).then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(k);

        debug!(candidates = snapshot.len(), returned = scored.len(), "retrieval scored");
        Ok(scored
            .into_iter()
            .map(|(distance, document)| RetrievedDocument {
                id: document.id,
                content: document.content.clone(),
                metadata: document.metadata.clone(),
                distance,
            })
            .collect())
    }

    pub async fn count(&self) -> CompanionResult<usize> {
        self.index.count().await
    }

    pub async fn info(&self) -> CompanionResult<KnowledgeInfo> {
        Ok(KnowledgeInfo {
            document_count: self.count().await?,
            embedding_model: self.embedder.model().to_owned(),
            dimension: self.dimension(),
        })
    }

    /// Destroy every document. Ids restart at 1. No confirmation here.
    #[instrument(skip(self))]
    pub async fn reset(&self) -> CompanionResult<()> {
        let _writer = self.writer.lock().await;
        let removed = self.index.count().await?;
        self.index.clear().await?;
        warn!(removed, "knowledge store reset");
        Ok(())
    }

    /// Batch-insert `items` only when the store holds no documents.
    /// Returns the number inserted.
    pub async fn seed_if_empty(&self, items: Vec<NewDocument>) -> CompanionResult<usize> {
        if self.count().await? > 0 {
            return Ok(0);
        }
        let report = self.insert_batch(items).await?;
        match report.failure {
            None => Ok(report.inserted.len()),
            Some(failure) => Err(failure.error),
        }
    }

    async fn next_id(&self) -> CompanionResult<DocumentId> {
        Ok(DocumentId::new(self.index.last_id().await? + 1))
    }

    async fn embed_checked(&self, text: &str) -> CompanionResult<Vec<f32>> {
        let embedding = self.embedder.embed(text).await?;
        let expected = self.dimension();
        if embedding.len() != expected {
            return Err(CompanionError::EmbeddingUnavailable(format!(
                "model {} returned {} dimensions, expected {expected}",
                self.embedder.model(),
                embedding.len()
            )));
        }
        if embedding.iter().any(|value| !value.is_finite()) {
            return Err(CompanionError::EmbeddingUnavailable(format!(
                "model {} returned a non-finite component",
                self.embedder.model()
            )));
        }
        Ok(embedding)
    }
}

fn validate_item(item: &NewDocument) -> CompanionResult<()> {
    if item.content.trim().is_empty() {
        return Err(CompanionError::invalid_input("document content is empty"));
    }
    item.metadata.validate()
}
