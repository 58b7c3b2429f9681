//! File-processing orchestration.
//!
//! One job drives one file through download → extract → analyze → chunk →
//! embed → persist, with the status machine
//! `pending → processing → {completed, failed}`. Steps run sequentially;
//! retries are the queue's concern — this module only classifies failures
//! as retryable or terminal through the error taxonomy.
//!
//! The file record can be deleted while a job is running. Every status
//! write and the chunk replacement check for that and end the job without
//! retry; nothing is written for a vanished file.

use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::analyzer::{AnalysisInput, Analyzer};
use crate::chunk::Chunker;
use crate::embedding::{embed_all, Embedder};
use crate::error::Result;
use crate::extract::{extract_text, is_image_media_type};
use crate::genai::GenerativeModel;
use crate::models::{Analysis, FileRecord, FileStatus, KnowledgeChunk};
use crate::queue::ClaimedJob;
use crate::storage::ObjectStore;
use crate::store::Store;

pub struct Pipeline {
    store: Arc<dyn Store>,
    storage: Arc<dyn ObjectStore>,
    embedder: Arc<dyn Embedder>,
    model: Arc<dyn GenerativeModel>,
    analyzer: Analyzer,
    chunker: Chunker,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        storage: Arc<dyn ObjectStore>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn GenerativeModel>,
        analyzer: Analyzer,
        chunker: Chunker,
    ) -> Self {
        Self {
            store,
            storage,
            embedder,
            model,
            analyzer,
            chunker,
        }
    }

    /// Run one processing attempt for a claimed job.
    ///
    /// Errors bubble to the worker, which consults
    /// [`Error::is_retryable`](crate::error::Error::is_retryable) and the
    /// attempt budget to decide between rescheduling and terminal failure.
    #[instrument(skip(self), fields(job_id = %job.id, file_id = %job.file_id, user_id = %job.user_id, attempt = job.attempt))]
    pub async fn process(&self, job: &ClaimedJob) -> Result<()> {
        // Step 1: the file record must exist; a missing record is a data
        // error, not a transient condition.
        let file = self
            .store
            .get_file(job.user_id, job.file_id)
            .await?
            .ok_or_else(|| {
                crate::error::Error::NotFound(format!("file {} not found", job.file_id))
            })?;

        // Step 2: visible to the user's file list immediately.
        self.store
            .set_file_status(file.id, FileStatus::Processing, None)
            .await?;

        // Step 3: raw bytes from storage.
        let bytes = self.storage.download(&file.storage_path).await?;

        // Steps 4-5: extract (or pass image bytes through) and analyze.
        let (analysis, extracted_text) = self.analyze_file(&file, &bytes).await?;

        // Step 6: persist the analysis before building the knowledge base,
        // so a failure in embedding leaves the analysis queryable on retry.
        self.store.put_analysis(&analysis).await?;

        // Step 7: chunk, embed in chunk order, replace the file's set.
        let source_text = knowledge_source(&analysis, extracted_text.as_deref());
        let chunk_count = self.build_knowledge(&file, &source_text).await?;

        // Step 8: done.
        self.store
            .set_file_status(file.id, FileStatus::Completed, None)
            .await?;

        info!(chunks = chunk_count, "file processed");
        Ok(())
    }

    /// Steps 4-5. Text media is extracted then analyzed as text; image
    /// media skips extraction and the analyzer sees the raw bytes.
    async fn analyze_file(
        &self,
        file: &FileRecord,
        bytes: &[u8],
    ) -> Result<(Analysis, Option<String>)> {
        if is_image_media_type(&file.media_type) {
            let analysis = self
                .analyzer
                .analyze(
                    self.model.as_ref(),
                    file.id,
                    &file.media_type,
                    AnalysisInput::Image {
                        media_type: &file.media_type,
                        bytes,
                    },
                )
                .await?;
            return Ok((analysis, None));
        }

        let text = extract_text(bytes, &file.media_type)?;
        let analysis = self
            .analyzer
            .analyze(
                self.model.as_ref(),
                file.id,
                &file.media_type,
                AnalysisInput::Text(&text),
            )
            .await?;
        Ok((analysis, Some(text)))
    }

    /// Step 7: produce the replace-by-file chunk set. Vectors are
    /// reassembled in the chunker's order before anything is persisted.
    async fn build_knowledge(&self, file: &FileRecord, source_text: &str) -> Result<usize> {
        if source_text.trim().is_empty() {
            warn!("no text to index, clearing knowledge for file");
            self.store.delete_chunks(file.id).await?;
            return Ok(0);
        }

        let pieces = self.chunker.split(source_text);
        let vectors = embed_all(self.embedder.as_ref(), &pieces).await?;

        let chunks: Vec<KnowledgeChunk> = pieces
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(index, (content, embedding))| KnowledgeChunk {
                id: Uuid::new_v4(),
                user_id: file.user_id,
                file_id: file.id,
                chunk_index: index as i64,
                content,
                embedding,
                metadata: serde_json::json!({}),
            })
            .collect();

        self.store.replace_chunks(file.id, &chunks).await
    }
}

/// What the knowledge base is built from: the raw extracted text when the
/// file has any, otherwise the rendered analysis (images).
fn knowledge_source(analysis: &Analysis, extracted_text: Option<&str>) -> String {
    match extracted_text {
        Some(text) if !text.trim().is_empty() => text.to_string(),
        _ => analysis.render_text(),
    }
}
