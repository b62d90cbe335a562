use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use companion_knowledge::{FileVectorIndex, KnowledgeStore, MemoryVectorIndex, seed};
use companion_learning::LearningEngine;
use companion_protocol::{CompletionPort, EmbeddingPort, LedgerPort, VectorIndexPort};
use companion_providers::{
    DEFAULT_CHAT_MODEL, DEFAULT_DIMENSION, HashingEmbedder, OpenAiCompletion, OpenAiConfig,
    OpenAiEmbedder,
};
use companion_runtime::{ChatOrchestrator, RuntimeConfig};
use companion_sessions::{FileLedger, MemoryLedger, SessionAggregator};
use tracing::{info, instrument};

/// Where knowledge vectors come from.
#[derive(Debug, Clone)]
pub enum EmbeddingBackend {
    Hashing { dimension: usize },
    OpenAi { config: OpenAiConfig, dimension: usize },
}

impl Default for EmbeddingBackend {
    fn default() -> Self {
        Self::Hashing {
            dimension: DEFAULT_DIMENSION,
        }
    }
}

#[derive(Clone)]
pub enum CompletionBackend {
    OpenAi(OpenAiConfig),
    Custom(Arc<dyn CompletionPort>),
}

impl std::fmt::Debug for CompletionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAi(config) => f.debug_tuple("OpenAi").field(config).finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl Default for CompletionBackend {
    fn default() -> Self {
        Self::OpenAi(OpenAiConfig::new(DEFAULT_CHAT_MODEL))
    }
}

#[derive(Debug, Clone)]
pub struct CompanionBuilder {
    root: Option<PathBuf>,
    runtime: RuntimeConfig,
    embedding: EmbeddingBackend,
    completion: CompletionBackend,
    seed_initial: bool,
}

impl CompanionBuilder {
    /// File-backed stores under `root`: `knowledge/documents.jsonl` and
    /// `ledger/ledger.jsonl`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            runtime: RuntimeConfig::default(),
            embedding: EmbeddingBackend::default(),
            completion: CompletionBackend::default(),
            seed_initial: true,
        }
    }

    /// Process-local stores, nothing written to disk.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            ..Self::new(PathBuf::new())
        }
    }

    pub fn runtime_config(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn embedding(mut self, embedding: EmbeddingBackend) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn completion(mut self, completion: CompletionBackend) -> Self {
        self.completion = completion;
        self
    }

    /// Load the initial corpus when the knowledge store is empty. On by
    /// default.
    pub fn seed_initial(mut self, seed_initial: bool) -> Self {
        self.seed_initial = seed_initial;
        self
    }

    #[instrument(skip(self), fields(root = ?self.root))]
    pub async fn build(self) -> Result<CompanionKernel> {
        self.runtime
            .validate()
            .context("invalid runtime configuration")?;

        let (index, ledger): (Arc<dyn VectorIndexPort>, Arc<dyn LedgerPort>) = match &self.root {
            Some(root) => {
                let index = FileVectorIndex::open(root.join("knowledge"))
                    .await
                    .with_context(|| format!("failed opening knowledge index under {root:?}"))?;
                let ledger = FileLedger::open(root.join("ledger"))
                    .await
                    .with_context(|| format!("failed opening ledger under {root:?}"))?;
                (Arc::new(index), Arc::new(ledger))
            }
            None => (
                Arc::new(MemoryVectorIndex::new()),
                Arc::new(MemoryLedger::new()),
            ),
        };

        let embedder: Arc<dyn EmbeddingPort> = match self.embedding {
            EmbeddingBackend::Hashing { dimension } => Arc::new(HashingEmbedder::new(dimension)?),
            EmbeddingBackend::OpenAi { config, dimension } => {
                Arc::new(OpenAiEmbedder::new(config, dimension)?)
            }
        };
        let completion: Arc<dyn CompletionPort> = match self.completion {
            CompletionBackend::OpenAi(config) => Arc::new(OpenAiCompletion::new(config)?),
            CompletionBackend::Custom(completion) => completion,
        };

        let knowledge = Arc::new(
            KnowledgeStore::new(embedder, index).with_default_top_k(self.runtime.top_k),
        );
        if self.seed_initial {
            let seeded = knowledge
                .seed_if_empty(seed::initial_documents())
                .await
                .context("failed seeding initial knowledge")?;
            if seeded > 0 {
                info!(seeded, "initial knowledge loaded");
            }
        }

        let sessions = Arc::new(SessionAggregator::new(ledger));
        let learning = Arc::new(
            LearningEngine::new(Arc::clone(&knowledge))
                .with_quality_threshold(self.runtime.quality_threshold),
        );
        let orchestrator =
            ChatOrchestrator::new(self.runtime, knowledge, sessions, learning, completion)?;

        Ok(CompanionKernel { orchestrator })
    }
}

#[derive(Debug, Clone)]
pub struct CompanionKernel {
    orchestrator: ChatOrchestrator,
}

impl CompanionKernel {
    pub fn orchestrator(&self) -> &ChatOrchestrator {
        &self.orchestrator
    }

    /// Insert the extended corpus. Returns the number of documents added.
    #[instrument(skip(self))]
    pub async fn seed_extended(&self) -> Result<usize> {
        let report = self
            .orchestrator
            .knowledge()
            .insert_batch(seed::extended_documents())
            .await
            .context("failed embedding extended knowledge")?;
        if let Some(failure) = report.failure {
            return Err(failure.error).context(format!(
                "extended knowledge stopped at item {} after {} inserted",
                failure.index,
                report.inserted.len()
            ));
        }
        info!(inserted = report.inserted.len(), "extended knowledge loaded");
        Ok(report.inserted.len())
    }

    /// Destroy every knowledge document. Sessions and records are kept.
    pub async fn reset_knowledge(&self) -> Result<()> {
        self.orchestrator
            .knowledge()
            .reset()
            .await
            .context("failed resetting knowledge store")
    }
}
