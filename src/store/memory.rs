//! In-memory [`Store`] implementation for tests and embedded use.
//!
//! `HashMap` and `Vec` behind `std::sync::RwLock`; vector search is
//! brute-force cosine over the tenant's stored vectors. Replacement swaps
//! the per-file chunk set under a single write lock, giving the same
//! all-or-nothing visibility as the SQLite transaction.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::models::{
    Analysis, FileNameMap, FileRecord, FileStatus, KnowledgeChunk, SearchResult,
};

use super::{check_batch_dims, rank_candidates, SearchFilter, Store};

#[derive(Default)]
pub struct InMemoryStore {
    files: RwLock<HashMap<Uuid, FileRecord>>,
    analyses: RwLock<HashMap<Uuid, Analysis>>,
    chunks: RwLock<Vec<KnowledgeChunk>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored chunks for a file, for test assertions.
    pub fn chunk_count(&self, file_id: Uuid) -> usize {
        self.chunks
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.file_id == file_id)
            .count()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_file(&self, file: &FileRecord) -> Result<()> {
        self.files.write().unwrap().insert(file.id, file.clone());
        Ok(())
    }

    async fn get_file(&self, user_id: Uuid, file_id: Uuid) -> Result<Option<FileRecord>> {
        Ok(self
            .files
            .read()
            .unwrap()
            .get(&file_id)
            .filter(|f| f.user_id == user_id)
            .cloned())
    }

    async fn set_file_status(
        &self,
        file_id: Uuid,
        status: FileStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut files = self.files.write().unwrap();
        let Some(file) = files.get_mut(&file_id) else {
            return Err(Error::NotFound(format!("file {file_id} no longer exists")));
        };
        file.status = status;
        file.error = error.map(|e| e.to_string());
        Ok(())
    }

    async fn delete_file(&self, user_id: Uuid, file_id: Uuid) -> Result<()> {
        {
            let mut files = self.files.write().unwrap();
            match files.get(&file_id) {
                Some(f) if f.user_id == user_id => {
                    files.remove(&file_id);
                }
                _ => return Err(Error::NotFound(format!("file {file_id} not found"))),
            }
        }
        self.analyses.write().unwrap().remove(&file_id);
        self.chunks
            .write()
            .unwrap()
            .retain(|c| c.file_id != file_id);
        Ok(())
    }

    async fn file_names(&self, user_id: Uuid, file_ids: &[Uuid]) -> Result<FileNameMap> {
        let files = self.files.read().unwrap();
        let mut names = FileNameMap::new();
        for file_id in file_ids {
            if let Some(f) = files.get(file_id).filter(|f| f.user_id == user_id) {
                names.insert(*file_id, f.name.clone());
            }
        }
        Ok(names)
    }

    async fn put_analysis(&self, analysis: &Analysis) -> Result<()> {
        self.analyses
            .write()
            .unwrap()
            .insert(analysis.file_id, analysis.clone());
        Ok(())
    }

    async fn get_analysis(&self, user_id: Uuid, file_id: Uuid) -> Result<Option<Analysis>> {
        let owned = self
            .files
            .read()
            .unwrap()
            .get(&file_id)
            .map(|f| f.user_id == user_id)
            .unwrap_or(false);
        if !owned {
            return Ok(None);
        }
        Ok(self.analyses.read().unwrap().get(&file_id).cloned())
    }

    async fn replace_chunks(&self, file_id: Uuid, chunks: &[KnowledgeChunk]) -> Result<usize> {
        check_batch_dims(chunks)?;

        if !self.files.read().unwrap().contains_key(&file_id) {
            return Err(Error::NotFound(format!("file {file_id} no longer exists")));
        }

        let mut stored = self.chunks.write().unwrap();
        stored.retain(|c| c.file_id != file_id);
        stored.extend(chunks.iter().cloned());
        Ok(chunks.len())
    }

    async fn delete_chunks(&self, file_id: Uuid) -> Result<()> {
        self.chunks
            .write()
            .unwrap()
            .retain(|c| c.file_id != file_id);
        Ok(())
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
    ) -> Result<Vec<SearchResult>> {
        let chunks = self.chunks.read().unwrap();
        let candidates = chunks
            .iter()
            .filter(|c| c.user_id == filter.user_id)
            .filter(|c| match &filter.file_ids {
                None => true,
                Some(ids) => ids.contains(&c.file_id),
            })
            .map(|c| SearchResult {
                content: c.content.clone(),
                file_id: c.file_id,
                similarity: cosine_similarity(query, &c.embedding).max(0.0) as f64,
                chunk_index: c.chunk_index,
                metadata: c.metadata.clone(),
            })
            .collect();

        Ok(rank_candidates(candidates, filter.threshold, filter.limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_file(user_id: Uuid) -> FileRecord {
        FileRecord {
            id: Uuid::new_v4(),
            user_id,
            name: "doc.txt".into(),
            media_type: "text/plain".into(),
            size_bytes: 1,
            storage_path: "doc.txt".into(),
            status: FileStatus::Pending,
            error: None,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    fn make_chunk(file: &FileRecord, index: i64, embedding: Vec<f32>) -> KnowledgeChunk {
        KnowledgeChunk {
            id: Uuid::new_v4(),
            user_id: file.user_id,
            file_id: file.id,
            chunk_index: index,
            content: format!("chunk {index}"),
            embedding,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn cross_tenant_search_returns_nothing() {
        let store = InMemoryStore::new();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        let file = make_file(user_a);
        store.create_file(&file).await.unwrap();
        store
            .replace_chunks(file.id, &[make_chunk(&file, 0, vec![1.0, 0.0])])
            .await
            .unwrap();

        let filter = SearchFilter {
            user_id: user_b,
            file_ids: None,
            threshold: 0.0,
            limit: 10,
        };
        assert!(store
            .similarity_search(&[1.0, 0.0], &filter)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn file_id_filter_restricts_results() {
        let store = InMemoryStore::new();
        let user = Uuid::new_v4();
        let file_a = make_file(user);
        let file_b = make_file(user);
        store.create_file(&file_a).await.unwrap();
        store.create_file(&file_b).await.unwrap();
        store
            .replace_chunks(file_a.id, &[make_chunk(&file_a, 0, vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .replace_chunks(file_b.id, &[make_chunk(&file_b, 0, vec![1.0, 0.0])])
            .await
            .unwrap();

        let filter = SearchFilter {
            user_id: user,
            file_ids: Some(vec![file_b.id]),
            threshold: 0.0,
            limit: 10,
        };
        let results = store.similarity_search(&[1.0, 0.0], &filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file_id, file_b.id);
    }

    #[tokio::test]
    async fn delete_chunks_is_idempotent() {
        let store = InMemoryStore::new();
        let file_id = Uuid::new_v4();
        store.delete_chunks(file_id).await.unwrap();
        store.delete_chunks(file_id).await.unwrap();
    }
}
