//! Storage abstraction for files, analyses, and the knowledge base.
//!
//! The [`Store`] trait covers every persistence operation the pipeline and
//! retrieval paths need, enabling pluggable backends: SQLite for
//! production, in-memory for tests. Implementations must be `Send + Sync`.
//!
//! Tenant isolation is part of the contract: every read and every mutation
//! is scoped by the owning user, and `similarity_search` must never return
//! another user's chunks.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Analysis, FileNameMap, FileRecord, FileStatus, KnowledgeChunk, SearchResult};

/// Scope and cutoffs for a similarity search.
#[derive(Debug, Clone)]
pub struct SearchFilter {
    /// Mandatory tenant scope.
    pub user_id: Uuid,
    /// Restrict to these files when present.
    pub file_ids: Option<Vec<Uuid>>,
    /// Minimum similarity in [0, 1].
    pub threshold: f64,
    /// Maximum results returned.
    pub limit: usize,
}

/// Abstract persistence backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_file`](Store::create_file) | Insert a new file record (`pending`) |
/// | [`get_file`](Store::get_file) | Fetch a file scoped to its owner |
/// | [`set_file_status`](Store::set_file_status) | Drive the status machine |
/// | [`delete_file`](Store::delete_file) | Delete a file and cascade to analysis + chunks |
/// | [`file_names`](Store::file_names) | Display names for citation rendering |
/// | [`put_analysis`](Store::put_analysis) | Store the analysis, replacing any prior one |
/// | [`get_analysis`](Store::get_analysis) | Fetch the analysis for a file |
/// | [`replace_chunks`](Store::replace_chunks) | Atomically swap the file's chunk set |
/// | [`delete_chunks`](Store::delete_chunks) | Drop the file's chunks (idempotent) |
/// | [`similarity_search`](Store::similarity_search) | Ranked vector search within a tenant |
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_file(&self, file: &FileRecord) -> Result<()>;

    async fn get_file(&self, user_id: Uuid, file_id: Uuid) -> Result<Option<FileRecord>>;

    /// Transition a file's status, recording `error` for failures.
    /// Returns `NotFound` when the record no longer exists — callers use
    /// this to detect a deletion racing with an active job.
    async fn set_file_status(
        &self,
        file_id: Uuid,
        status: FileStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// Delete a file with its analysis and chunks. Owner-scoped.
    async fn delete_file(&self, user_id: Uuid, file_id: Uuid) -> Result<()>;

    /// Display names for the given files, owner-scoped. Unknown ids are
    /// simply absent from the map.
    async fn file_names(&self, user_id: Uuid, file_ids: &[Uuid]) -> Result<FileNameMap>;

    /// Insert the analysis for a file, replacing any existing one.
    async fn put_analysis(&self, analysis: &Analysis) -> Result<()>;

    async fn get_analysis(&self, user_id: Uuid, file_id: Uuid) -> Result<Option<Analysis>>;

    /// Replace the file's entire chunk set with `chunks`, atomically:
    /// a concurrent reader observes the old set or the new set, never a
    /// mix or an empty window. Fails with `NotFound` if the file record
    /// has disappeared. Returns the persisted count.
    async fn replace_chunks(&self, file_id: Uuid, chunks: &[KnowledgeChunk]) -> Result<usize>;

    /// Delete all chunks for a file. Deleting an empty set succeeds.
    async fn delete_chunks(&self, file_id: Uuid) -> Result<()>;

    /// Ranked similarity search. Results satisfy `similarity >= threshold`,
    /// are ordered by similarity descending with ties broken by ascending
    /// chunk index then file id, and are truncated to `limit`.
    async fn similarity_search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
    ) -> Result<Vec<SearchResult>>;
}

/// Rank, filter, and truncate scored candidates. Shared by both backends
/// so ordering semantics cannot drift between them.
pub(crate) fn rank_candidates(
    mut candidates: Vec<SearchResult>,
    threshold: f64,
    limit: usize,
) -> Vec<SearchResult> {
    candidates.retain(|c| c.similarity >= threshold);
    candidates.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk_index.cmp(&b.chunk_index))
            .then(a.file_id.cmp(&b.file_id))
    });
    candidates.truncate(limit);
    candidates
}

/// Validate that every chunk in a batch carries a vector of the same
/// dimensionality before anything is written. A mixed batch means two
/// embedding models were interleaved, which would corrupt search.
pub(crate) fn check_batch_dims(chunks: &[KnowledgeChunk]) -> Result<()> {
    let Some(first) = chunks.first() else {
        return Ok(());
    };
    let dims = first.embedding.len();
    for chunk in chunks {
        if chunk.embedding.len() != dims {
            return Err(crate::error::Error::Validation(format!(
                "chunk {} embedding has {} dims, expected {}",
                chunk.chunk_index,
                chunk.embedding.len(),
                dims
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(file: Uuid, index: i64, sim: f64) -> SearchResult {
        SearchResult {
            content: format!("chunk {index}"),
            file_id: file,
            similarity: sim,
            chunk_index: index,
            metadata: json!({}),
        }
    }

    #[test]
    fn ranking_is_descending_with_deterministic_ties() {
        let file_a = Uuid::from_u128(1);
        let file_b = Uuid::from_u128(2);
        let candidates = vec![
            result(file_b, 3, 0.8),
            result(file_a, 1, 0.9),
            result(file_b, 0, 0.8),
            result(file_a, 0, 0.8),
        ];

        let ranked = rank_candidates(candidates, 0.0, 10);
        let order: Vec<(Uuid, i64)> = ranked.iter().map(|r| (r.file_id, r.chunk_index)).collect();
        assert_eq!(
            order,
            vec![(file_a, 1), (file_a, 0), (file_b, 0), (file_b, 3)]
        );
    }

    #[test]
    fn threshold_and_limit_are_applied() {
        let file = Uuid::from_u128(7);
        let candidates = vec![
            result(file, 0, 0.95),
            result(file, 1, 0.72),
            result(file, 2, 0.69),
            result(file, 3, 0.88),
        ];

        let ranked = rank_candidates(candidates, 0.7, 2);
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().all(|r| r.similarity >= 0.7));
        assert_eq!(ranked[0].chunk_index, 0);
        assert_eq!(ranked[1].chunk_index, 3);
    }
}
