//! Vector index backends.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use companion_protocol::{CompanionError, CompanionResult, Document, VectorIndexPort};
use parking_lot::RwLock;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

/// In-process index. Readers clone the current `Arc` snapshot and score it
/// without holding the lock; writers copy-on-write.
#[derive(Debug, Default)]
pub struct MemoryVectorIndex {
    documents: RwLock<Arc<Vec<Arc<Document>>>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_documents(documents: Vec<Document>) -> Self {
        Self {
            documents: RwLock::new(Arc::new(documents.into_iter().map(Arc::new).collect())),
        }
    }

    fn snapshot(&self) -> Arc<Vec<Arc<Document>>> {
        self.documents.read().clone()
    }

    fn last_id_now(&self) -> u64 {
        self.documents
            .read()
            .last()
            .map(|document| document.id.get())
            .unwrap_or(0)
    }

    fn check_monotonic(&self, document: &Document) -> CompanionResult<()> {
        let last = self.last_id_now();
        if document.id.get() <= last {
            return Err(CompanionError::invalid_input(format!(
                "document id {} does not follow last id {last}",
                document.id
            )));
        }
        Ok(())
    }

    fn push(&self, document: Document) {
        let mut guard = self.documents.write();
        Arc::make_mut(&mut guard).push(Arc::new(document));
    }

    fn clear_now(&self) {
        *self.documents.write() = Arc::new(Vec::new());
    }
}

#[async_trait]
impl VectorIndexPort for MemoryVectorIndex {
    async fn append(&self, document: Document) -> CompanionResult<()> {
        self.check_monotonic(&document)?;
        self.push(document);
        Ok(())
    }

    async fn documents(&self) -> CompanionResult<Arc<Vec<Arc<Document>>>> {
        Ok(self.snapshot())
    }

    async fn last_id(&self) -> CompanionResult<u64> {
        Ok(self.last_id_now())
    }

    async fn count(&self) -> CompanionResult<usize> {
        Ok(self.documents.read().len())
    }

    async fn clear(&self) -> CompanionResult<()> {
        self.clear_now();
        Ok(())
    }
}

/// JSONL-backed index: `documents.jsonl` under the root, replayed into a
/// [`MemoryVectorIndex`] on open. Each document is one line written with a
/// single `write_all`.
#[derive(Debug)]
pub struct FileVectorIndex {
    path: PathBuf,
    cache: MemoryVectorIndex,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileVectorIndex {
    #[instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub async fn open(root: impl AsRef<Path>) -> CompanionResult<Self> {
        let path = root.as_ref().join("documents.jsonl");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let documents = Self::replay(&path).await?;
        debug!(count = documents.len(), "vector index replayed");
        Ok(Self {
            path,
            cache: MemoryVectorIndex::from_documents(documents),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays the log. A torn final line is cut off the file so the next
    /// append starts on a clean line.
    async fn replay(path: &Path) -> CompanionResult<Vec<Document>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let raw = fs::read(path).await?;
        let segments: Vec<&[u8]> = raw.split_inclusive(|byte| *byte == b'\n').collect();
        let mut documents: Vec<Document> = Vec::with_capacity(segments.len());
        let mut offset = 0;
        let mut good_len = 0;
        let mut torn = false;

        for (position, segment) in segments.iter().enumerate() {
            offset += segment.len();
            let line = segment.trim_ascii();
            if line.is_empty() {
                good_len = offset;
                continue;
            }
            match serde_json::from_slice::<Document>(line) {
                Ok(document) => {
                    documents.push(document);
                    good_len = offset;
                }
                Err(error) if position + 1 == segments.len() => {
                    warn!(%error, path = %path.display(), "dropping torn trailing document line");
                    torn = true;
                }
                Err(error) => {
                    return Err(CompanionError::Serialization(format!(
                        "corrupt document line {} in {}: {error}",
                        position + 1,
                        path.display()
                    )));
                }
            }
        }

        let unterminated = good_len > 0 && raw[good_len - 1] != b'\n';
        if torn || unterminated {
            repair_tail(path, good_len as u64, unterminated).await?;
        }

        documents.sort_by_key(|document| document.id);
        Ok(documents)
    }
}

/// Truncates the log to `good_len` bytes, then terminates the last line when
/// it lacks a newline.
async fn repair_tail(path: &Path, good_len: u64, terminate: bool) -> CompanionResult<()> {
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(good_len).await?;
    if terminate {
        file.seek(SeekFrom::Start(good_len)).await?;
        file.write_all(b"\n").await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    debug!(good_len, "document log tail repaired");
    Ok(())
}

#[async_trait]
impl VectorIndexPort for FileVectorIndex {
    #[instrument(skip(self, document), fields(document_id = %document.id))]
    async fn append(&self, document: Document) -> CompanionResult<()> {
        let _guard = self.write_lock.lock().await;
        self.cache.check_monotonic(&document)?;

        let mut line = serde_json::to_string(&document)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        self.cache.push(document);
        debug!("document appended to index");
        Ok(())
    }

    async fn documents(&self) -> CompanionResult<Arc<Vec<Arc<Document>>>> {
        Ok(self.cache.snapshot())
    }

    async fn last_id(&self) -> CompanionResult<u64> {
        Ok(self.cache.last_id_now())
    }

    async fn count(&self) -> CompanionResult<usize> {
        self.cache.count().await
    }

    async fn clear(&self) -> CompanionResult<()> {
        let _guard = self.write_lock.lock().await;
        fs::write(&self.path, b"").await?;
        self.cache.clear_now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use chrono::Utc;
    use companion_protocol::{DocumentId, DocumentMetadata};
    use tokio::fs;

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn document(id: u64, content: &str) -> Document {
        Document {
            id: DocumentId::new(id),
            content: content.to_owned(),
            embedding: vec![1.0, 0.0],
            metadata: DocumentMetadata::categorized("压力", "学习方法"),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_index_rejects_non_increasing_ids() -> Result<()> {
        let index = MemoryVectorIndex::new();
        index.append(document(1, "a")).await?;
        let err = index.append(document(1, "b")).await.unwrap_err();
        assert!(err.to_string().contains("does not follow last id 1"));
        assert_eq!(index.count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn memory_snapshot_is_stable_across_writes() -> Result<()> {
        let index = MemoryVectorIndex::new();
        index.append(document(1, "a")).await?;
        let before = index.documents().await?;
        index.append(document(2, "b")).await?;
        assert_eq!(before.len(), 1);
        assert_eq!(index.documents().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn file_index_replays_documents_on_open() -> Result<()> {
        let root = unique_test_root("companion-index-replay");
        {
            let index = FileVectorIndex::open(&root).await?;
            index.append(document(1, "深呼吸")).await?;
            index.append(document(2, "番茄工作法")).await?;
        }

        let reopened = FileVectorIndex::open(&root).await?;
        let documents = reopened.documents().await?;
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[1].content, "番茄工作法");
        assert_eq!(reopened.last_id().await?, 2);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn file_index_skips_torn_trailing_line() -> Result<()> {
        let root = unique_test_root("companion-index-torn");
        {
            let index = FileVectorIndex::open(&root).await?;
            index.append(document(1, "完整")).await?;
        }
        let path = root.join("documents.jsonl");
        let mut raw = fs::read_to_string(&path).await?;
        raw.push_str("{\"id\":2,\"content\":\"半");
        fs::write(&path, raw).await?;

        let reopened = FileVectorIndex::open(&root).await?;
        assert_eq!(reopened.count().await?, 1);
        assert_eq!(reopened.last_id().await?, 1);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn appends_after_torn_tail_survive_reopen() -> Result<()> {
        let root = unique_test_root("companion-index-torn-append");
        {
            let index = FileVectorIndex::open(&root).await?;
            index.append(document(1, "完整")).await?;
        }
        let path = root.join("documents.jsonl");
        let mut raw = fs::read(&path).await?;
        raw.extend_from_slice("{\"id\":2,\"content\":\"半".as_bytes());
        raw.pop();
        fs::write(&path, raw).await?;

        {
            let index = FileVectorIndex::open(&root).await?;
            assert_eq!(index.last_id().await?, 1);
            index.append(document(2, "第二条")).await?;
        }
        {
            let index = FileVectorIndex::open(&root).await?;
            assert_eq!(index.count().await?, 2);
            assert_eq!(index.last_id().await?, 2);
            index.append(document(3, "第三条")).await?;
            index.append(document(4, "第四条")).await?;
        }

        let reopened = FileVectorIndex::open(&root).await?;
        let contents: Vec<String> = reopened
            .documents()
            .await?
            .iter()
            .map(|document| document.content.clone())
            .collect();
        assert_eq!(contents, ["完整", "第二条", "第三条", "第四条"]);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn unterminated_final_line_is_kept_and_terminated() -> Result<()> {
        let root = unique_test_root("companion-index-unterminated");
        fs::create_dir_all(&root).await?;
        let path = root.join("documents.jsonl");
        let line = serde_json::to_string(&document(1, "无换行"))?;
        fs::write(&path, line).await?;

        {
            let index = FileVectorIndex::open(&root).await?;
            assert_eq!(index.count().await?, 1);
            index.append(document(2, "之后")).await?;
        }

        let reopened = FileVectorIndex::open(&root).await?;
        assert_eq!(reopened.count().await?, 2);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn file_index_clear_truncates_log() -> Result<()> {
        let root = unique_test_root("companion-index-clear");
        let index = FileVectorIndex::open(&root).await?;
        index.append(document(1, "a")).await?;
        index.clear().await?;
        assert_eq!(index.count().await?, 0);
        assert_eq!(index.last_id().await?, 0);

        let reopened = FileVectorIndex::open(&root).await?;
        assert_eq!(reopened.count().await?, 0);
        reopened.append(document(1, "after reset")).await?;

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
