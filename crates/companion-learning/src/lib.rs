//! Continuous learning.
//!
//! Two independent promotion paths feed the knowledge store:
//! the live buffer of well-rated exchanges ([`LearningEngine::consider_exchange`]
//! then [`LearningEngine::promote`]) and a scan of persisted history
//! ([`LearningEngine::relearn_from_history`]).

use std::sync::Arc;

use companion_knowledge::KnowledgeStore;
use companion_protocol::{
    CompanionResult, DocumentMetadata, Emotion, LedgerPort, NewDocument,
    SOURCE_ACCEPTED_EXCHANGE, SOURCE_HISTORICAL_SUCCESS,
};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_QUALITY_THRESHOLD: f64 = 4.0;

/// Knowledge text for an accepted exchange.
pub fn exchange_content(user_message: &str, ai_response: &str) -> String {
    format!("用户问题：{user_message}\n有效回复：{ai_response}")
}

/// A rated exchange offered to the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub user_message: String,
    pub ai_response: String,
    pub feedback_score: f64,
    pub emotions: Vec<Emotion>,
}

pub struct LearningEngine {
    store: Arc<KnowledgeStore>,
    buffer: Mutex<Vec<NewDocument>>,
    quality_threshold: f64,
}

impl std::fmt::Debug for LearningEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearningEngine")
            .field("buffered", &self.buffered_len())
            .field("quality_threshold", &self.quality_threshold)
            .finish_non_exhaustive()
    }
}

impl LearningEngine {
    pub fn new(store: Arc<KnowledgeStore>) -> Self {
        Self {
            store,
            buffer: Mutex::new(Vec::new()),
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
        }
    }

    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    pub fn quality_threshold(&self) -> f64 {
        self.quality_threshold
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Buffer the exchange when its score reaches the quality threshold.
    /// Lower-rated exchanges are dropped. Returns whether it was buffered.
    pub fn consider_exchange(&self, exchange: Exchange) -> bool {
        if exchange.feedback_score.is_nan() || exchange.feedback_score < self.quality_threshold {
            debug!(score = exchange.feedback_score, "exchange below quality threshold");
            return false;
        }

        let candidate = NewDocument::new(
            exchange_content(&exchange.user_message, &exchange.ai_response),
            DocumentMetadata::learned(
                SOURCE_ACCEPTED_EXCHANGE,
                exchange.feedback_score,
                exchange.emotions,
            ),
        );
        let mut buffer = self.buffer.lock();
        buffer.push(candidate);
        debug!(buffered = buffer.len(), "exchange buffered for learning");
        true
    }

    /// Submit the whole buffer once it holds at least `min_buffer_size`
    /// candidates. Returns the number submitted, 0 below the threshold.
    ///
    /// The buffer is taken before the batch call, so concurrent callers never
    /// submit the same candidate twice. A fatal batch error puts the
    /// candidates back in front of anything buffered meanwhile. A partial
    /// batch still clears them: candidates after the failed item are lost.
    #[instrument(skip(self))]
    pub async fn promote(&self, min_buffer_size: usize) -> CompanionResult<usize> {
        let submitted = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() || buffer.len() < min_buffer_size {
                return Ok(0);
            }
            std::mem::take(&mut *buffer)
        };
        let count = submitted.len();

        let report = match self.store.insert_batch(submitted.clone()).await {
            Ok(report) => report,
            Err(error) => {
                let mut buffer = self.buffer.lock();
                let newer = std::mem::replace(&mut *buffer, submitted);
                buffer.extend(newer);
                warn!(%error, requeued = count, "promotion failed, candidates requeued");
                return Err(error);
            }
        };

        match &report.failure {
            None => info!(promoted = count, "learning buffer promoted"),
            Some(failure) => warn!(
                submitted = count,
                inserted = report.inserted.len(),
                lost = count - report.inserted.len(),
                error = %failure.error,
                "learning buffer partially promoted"
            ),
        }
        Ok(count)
    }

    /// Insert one document per persisted record scoring at least
    /// `min_score`, one at a time. Failed inserts are logged and skipped.
    /// Returns the number inserted.
    #[instrument(skip(self, ledger))]
    pub async fn relearn_from_history(
        &self,
        ledger: &dyn LedgerPort,
        min_score: f64,
    ) -> CompanionResult<usize> {
        let records = ledger.conversations_with_min_score(min_score).await?;
        let mut learned = 0;

        for record in records {
            let Some(score) = record.feedback_score else {
                continue;
            };
            let metadata = DocumentMetadata::learned(
                SOURCE_HISTORICAL_SUCCESS,
                score,
                record.detected_emotions.clone(),
            );
            let content = exchange_content(&record.user_message, &record.ai_response);
            match self.store.insert(content, metadata).await {
                Ok(_) => learned += 1,
                Err(error) => {
                    warn!(conversation_id = %record.id, %error, "skipping record during relearn");
                }
            }
        }

        info!(learned, "relearned from history");
        Ok(learned)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;
    use companion_knowledge::MemoryVectorIndex;
    use companion_protocol::{
        CompanionError, Document, EmbeddingPort, ErrorKind, NewConversation, SessionId,
        VectorIndexPort,
    };
    use companion_sessions::MemoryLedger;

    use super::*;

    /// Embeds by text length; can be switched offline.
    #[derive(Default)]
    struct LengthEmbedder {
        offline: AtomicBool,
    }

    #[async_trait]
    impl EmbeddingPort for LengthEmbedder {
        fn model(&self) -> &str {
            "length-test"
        }

        fn dimension(&self) -> usize {
            2
        }

        async fn embed(&self, text: &str) -> CompanionResult<Vec<f32>> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(CompanionError::EmbeddingUnavailable("offline".into()));
            }
            Ok(vec![text.chars().count() as f32, 1.0])
        }
    }

    /// Accepts `limit` appends, then reports the index unreachable.
    struct FlakyIndex {
        inner: MemoryVectorIndex,
        limit: usize,
        appended: AtomicUsize,
    }

    #[async_trait]
    impl VectorIndexPort for FlakyIndex {
        async fn append(&self, document: Document) -> CompanionResult<()> {
            if self.appended.load(Ordering::SeqCst) >= self.limit {
                return Err(CompanionError::store_unavailable("index unreachable"));
            }
            self.inner.append(document).await?;
            self.appended.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn documents(&self) -> CompanionResult<Arc<Vec<Arc<Document>>>> {
            self.inner.documents().await
        }

        async fn last_id(&self) -> CompanionResult<u64> {
            self.inner.last_id().await
        }

        async fn count(&self) -> CompanionResult<usize> {
            self.inner.count().await
        }

        async fn clear(&self) -> CompanionResult<()> {
            self.inner.clear().await
        }
    }

    fn engine_with(embedder: Arc<LengthEmbedder>) -> (LearningEngine, Arc<KnowledgeStore>) {
        let store = Arc::new(KnowledgeStore::new(
            embedder,
            Arc::new(MemoryVectorIndex::new()),
        ));
        (LearningEngine::new(Arc::clone(&store)), store)
    }

    fn exchange(score: f64) -> Exchange {
        Exchange {
            user_message: "考试前很紧张".into(),
            ai_response: "试试积极的自我对话".into(),
            feedback_score: score,
            emotions: vec![Emotion::Anxiety],
        }
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        let (engine, _) = engine_with(Arc::default());
        assert!(engine.consider_exchange(exchange(4.0)));
        assert!(engine.consider_exchange(exchange(5.0)));
        assert!(!engine.consider_exchange(exchange(3.99)));
        assert!(!engine.consider_exchange(exchange(f64::NAN)));
        assert_eq!(engine.buffered_len(), 2);
    }

    #[tokio::test]
    async fn promote_below_minimum_leaves_buffer() -> Result<()> {
        let (engine, store) = engine_with(Arc::default());
        engine.consider_exchange(exchange(4.0));
        engine.consider_exchange(exchange(4.5));

        assert_eq!(engine.promote(3).await?, 0);
        assert_eq!(engine.buffered_len(), 2);
        assert_eq!(store.count().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn partial_promotion_clears_buffer_and_reports_submitted() -> Result<()> {
        let index = Arc::new(FlakyIndex {
            inner: MemoryVectorIndex::new(),
            limit: 1,
            appended: AtomicUsize::new(0),
        });
        let store = Arc::new(KnowledgeStore::new(Arc::new(LengthEmbedder::default()), index));
        let engine = LearningEngine::new(Arc::clone(&store));
        for _ in 0..3 {
            engine.consider_exchange(exchange(5.0));
        }

        assert_eq!(engine.promote(1).await?, 3);
        assert_eq!(engine.buffered_len(), 0);
        assert_eq!(store.count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn promote_submits_and_clears_buffer() -> Result<()> {
        let (engine, store) = engine_with(Arc::default());
        for _ in 0..3 {
            engine.consider_exchange(exchange(5.0));
        }

        assert_eq!(engine.promote(3).await?, 3);
        assert_eq!(engine.buffered_len(), 0);
        assert_eq!(store.count().await?, 3);

        let hits = store.retrieve("考试前很紧张", Some(1)).await?;
        assert_eq!(
            hits[0].content,
            "用户问题：考试前很紧张\n有效回复：试试积极的自我对话"
        );
        assert_eq!(
            hits[0].metadata.source_type.as_deref(),
            Some(SOURCE_ACCEPTED_EXCHANGE)
        );
        assert_eq!(hits[0].metadata.emotions, vec![Emotion::Anxiety]);
        Ok(())
    }

    #[tokio::test]
    async fn fatal_promotion_error_requeues_candidates() -> Result<()> {
        let embedder = Arc::new(LengthEmbedder::default());
        let (engine, store) = engine_with(Arc::clone(&embedder));
        engine.consider_exchange(exchange(4.0));
        engine.consider_exchange(exchange(4.0));

        embedder.offline.store(true, Ordering::SeqCst);
        let err = engine.promote(1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmbeddingUnavailable);
        assert_eq!(engine.buffered_len(), 2);

        embedder.offline.store(false, Ordering::SeqCst);
        assert_eq!(engine.promote(1).await?, 2);
        assert_eq!(store.count().await?, 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_promotions_never_double_submit() -> Result<()> {
        let (engine, store) = engine_with(Arc::default());
        let engine = Arc::new(engine);
        for _ in 0..10 {
            engine.consider_exchange(exchange(5.0));
        }

        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.promote(1).await }
        });
        let second = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.promote(1).await }
        });
        let total = first.await?? + second.await??;

        assert_eq!(total, 10);
        assert_eq!(store.count().await?, 10);
        Ok(())
    }

    #[tokio::test]
    async fn relearn_inserts_each_qualifying_record() -> Result<()> {
        let (engine, store) = engine_with(Arc::default());
        let ledger = MemoryLedger::new();
        let session_id = SessionId::from_string("s1");
        for (message, score) in [("焦虑", Some(5.0)), ("压力", Some(3.0)), ("孤独", Some(4.0)), ("累", None)] {
            let record = ledger
                .append_conversation(NewConversation {
                    session_id: session_id.clone(),
                    user_message: message.into(),
                    ai_response: "回复".into(),
                    detected_emotions: vec![Emotion::Neutral],
                    rag_docs_used: vec![],
                })
                .await?;
            if let Some(score) = score {
                ledger.set_feedback(record.id, score, None).await?;
            }
        }

        assert_eq!(engine.relearn_from_history(&ledger, 4.0).await?, 2);
        assert_eq!(store.count().await?, 2);
        let hits = store.retrieve("用户问题：孤独\n有效回复：回复", Some(5)).await?;
        assert!(hits.iter().all(|hit| {
            hit.metadata.source_type.as_deref() == Some(SOURCE_HISTORICAL_SUCCESS)
        }));
        assert_eq!(engine.buffered_len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn relearn_skips_failed_inserts() -> Result<()> {
        let embedder = Arc::new(LengthEmbedder::default());
        let (engine, store) = engine_with(Arc::clone(&embedder));
        let ledger = MemoryLedger::new();
        let record = ledger
            .append_conversation(NewConversation {
                session_id: SessionId::from_string("s1"),
                user_message: "焦虑".into(),
                ai_response: "深呼吸".into(),
                detected_emotions: vec![Emotion::Anxiety],
                rag_docs_used: vec![],
            })
            .await?;
        ledger.set_feedback(record.id, 5.0, None).await?;

        embedder.offline.store(true, Ordering::SeqCst);
        assert_eq!(engine.relearn_from_history(&ledger, 4.0).await?, 0);
        assert_eq!(store.count().await?, 0);
        Ok(())
    }
}
