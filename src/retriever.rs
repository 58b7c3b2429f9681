//! Query-time retrieval: embed the question, search the knowledge store,
//! and render ranked results as a numbered, cited context block.
//!
//! Ranking belongs to the store; the retriever passes results through in
//! the order it received them, and the citation numbering downstream is
//! defined by that order.

use std::sync::Arc;

use uuid::Uuid;

use crate::embedding::Embedder;
use crate::error::Result;
use crate::models::{FileNameMap, SearchResult};
use crate::store::{SearchFilter, Store};

/// Per-call search options; unset fields fall back to configuration.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub user_id: Uuid,
    pub file_ids: Option<Vec<Uuid>>,
    pub limit: usize,
    pub threshold: f64,
}

/// Separator between context blocks, distinct from any blank line inside
/// chunk content.
const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Placeholder for file ids missing from the name map.
const UNKNOWN_FILE_NAME: &str = "Unknown";

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn Store>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn Store>) -> Self {
        Self { embedder, store }
    }

    /// Search the caller's knowledge base.
    ///
    /// An empty or whitespace-only query returns no results without
    /// touching the embedding provider — the no-context path costs
    /// nothing.
    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed(query).await?;
        let filter = SearchFilter {
            user_id: opts.user_id,
            file_ids: opts.file_ids.clone(),
            threshold: opts.threshold,
            limit: opts.limit,
        };
        self.store.similarity_search(&query_vector, &filter).await
    }

    /// Display names for the distinct files behind a result set.
    pub async fn file_names(
        &self,
        user_id: Uuid,
        results: &[SearchResult],
    ) -> Result<FileNameMap> {
        let mut ids: Vec<Uuid> = results.iter().map(|r| r.file_id).collect();
        ids.sort();
        ids.dedup();
        self.store.file_names(user_id, &ids).await
    }
}

/// Render results as numbered context blocks in result order:
///
/// ```text
/// [1] From "report.pdf":
/// <chunk content>
///
/// ---
///
/// [2] From "notes.txt":
/// ...
/// ```
pub fn build_context(results: &[SearchResult], names: &FileNameMap) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, result)| {
            let name = names
                .get(&result.file_id)
                .map(String::as_str)
                .unwrap_or(UNKNOWN_FILE_NAME);
            format!("[{}] From \"{}\":\n{}", i + 1, name, result.content)
        })
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}
