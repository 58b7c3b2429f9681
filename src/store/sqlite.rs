//! SQLite-backed [`Store`].
//!
//! Embedding vectors live in BLOB columns as little-endian f32 bytes;
//! similarity is cosine computed in Rust over the tenant's candidate rows.
//! Chunk replacement runs delete-then-insert inside one transaction so a
//! concurrent reader never observes a partial set.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::{
    Analysis, AnalysisMetadata, FileNameMap, FileRecord, FileStatus, KnowledgeChunk, SearchResult,
};

use super::{check_batch_dims, rank_candidates, SearchFilter, Store};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn file_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<FileRecord> {
    let status_str: String = row.get("status");
    let status = FileStatus::parse(&status_str)
        .ok_or_else(|| Error::Persistence(format!("unknown file status: {status_str}")))?;
    let metadata: String = row.get("metadata_json");
    let created_at: i64 = row.get("created_at");

    Ok(FileRecord {
        id: parse_uuid(row.get("id"))?,
        user_id: parse_uuid(row.get("user_id"))?,
        name: row.get("name"),
        media_type: row.get("media_type"),
        size_bytes: row.get("size_bytes"),
        storage_path: row.get("storage_path"),
        status,
        error: row.get("error"),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: Utc
            .timestamp_opt(created_at, 0)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

fn parse_uuid(s: String) -> Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| Error::Persistence(format!("malformed uuid in row: {e}")))
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_file(&self, file: &FileRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (id, user_id, name, media_type, size_bytes, storage_path, status, error, metadata_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(file.id.to_string())
        .bind(file.user_id.to_string())
        .bind(&file.name)
        .bind(&file.media_type)
        .bind(file.size_bytes)
        .bind(&file.storage_path)
        .bind(file.status.as_str())
        .bind(&file.error)
        .bind(file.metadata.to_string())
        .bind(file.created_at.timestamp())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_file(&self, user_id: Uuid, file_id: Uuid) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT * FROM files WHERE id = ? AND user_id = ?")
            .bind(file_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| file_from_row(&r)).transpose()
    }

    async fn set_file_status(
        &self,
        file_id: Uuid,
        status: FileStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE files SET status = ?, error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now().timestamp())
        .bind(file_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("file {file_id} no longer exists")));
        }
        Ok(())
    }

    async fn delete_file(&self, user_id: Uuid, file_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM files WHERE id = ? AND user_id = ?")
            .bind(file_id.to_string())
            .bind(user_id.to_string())
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(Error::NotFound(format!("file {file_id} not found")));
        }

        sqlx::query("DELETE FROM analyses WHERE file_id = ?")
            .bind(file_id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM knowledge_chunks WHERE file_id = ?")
            .bind(file_id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE file_id = ? AND status = 'queued'")
            .bind(file_id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn file_names(&self, user_id: Uuid, file_ids: &[Uuid]) -> Result<FileNameMap> {
        let mut names = FileNameMap::new();
        for file_id in file_ids {
            let row = sqlx::query("SELECT name FROM files WHERE id = ? AND user_id = ?")
                .bind(file_id.to_string())
                .bind(user_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
            if let Some(row) = row {
                names.insert(*file_id, row.get("name"));
            }
        }
        Ok(names)
    }

    async fn put_analysis(&self, analysis: &Analysis) -> Result<()> {
        let key_points = serde_json::to_string(&analysis.key_points)
            .map_err(|e| Error::Persistence(e.to_string()))?;
        let insights = serde_json::to_string(&analysis.insights)
            .map_err(|e| Error::Persistence(e.to_string()))?;
        let metadata = serde_json::to_string(&analysis.metadata)
            .map_err(|e| Error::Persistence(e.to_string()))?;
        let relationships = analysis
            .relationships
            .as_ref()
            .map(|r| r.to_string());

        sqlx::query(
            r#"
            INSERT INTO analyses (id, file_id, summary, key_points_json, insights_json, metadata_json, relationships_json, model, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_id) DO UPDATE SET
                id = excluded.id,
                summary = excluded.summary,
                key_points_json = excluded.key_points_json,
                insights_json = excluded.insights_json,
                metadata_json = excluded.metadata_json,
                relationships_json = excluded.relationships_json,
                model = excluded.model,
                created_at = excluded.created_at
            "#,
        )
        .bind(analysis.id.to_string())
        .bind(analysis.file_id.to_string())
        .bind(&analysis.summary)
        .bind(key_points)
        .bind(insights)
        .bind(metadata)
        .bind(relationships)
        .bind(&analysis.model)
        .bind(analysis.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_analysis(&self, user_id: Uuid, file_id: Uuid) -> Result<Option<Analysis>> {
        let row = sqlx::query(
            r#"
            SELECT a.* FROM analyses a
            JOIN files f ON f.id = a.file_id
            WHERE a.file_id = ? AND f.user_id = ?
            "#,
        )
        .bind(file_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };

        let key_points: String = row.get("key_points_json");
        let insights: String = row.get("insights_json");
        let metadata: String = row.get("metadata_json");
        let relationships: Option<String> = row.get("relationships_json");
        let created_at: i64 = row.get("created_at");

        Ok(Some(Analysis {
            id: parse_uuid(row.get("id"))?,
            file_id,
            summary: row.get("summary"),
            key_points: serde_json::from_str(&key_points).unwrap_or_default(),
            insights: serde_json::from_str(&insights).unwrap_or_default(),
            metadata: serde_json::from_str::<AnalysisMetadata>(&metadata).unwrap_or_default(),
            relationships: relationships.and_then(|r| serde_json::from_str(&r).ok()),
            model: row.get("model"),
            created_at: Utc
                .timestamp_opt(created_at, 0)
                .single()
                .unwrap_or_else(Utc::now),
        }))
    }

    async fn replace_chunks(&self, file_id: Uuid, chunks: &[KnowledgeChunk]) -> Result<usize> {
        check_batch_dims(chunks)?;

        let mut tx = self.pool.begin().await?;

        // The owning file may have been deleted while the job was running;
        // in that case nothing must be written.
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM files WHERE id = ?")
            .bind(file_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(Error::NotFound(format!("file {file_id} no longer exists")));
        }

        sqlx::query("DELETE FROM knowledge_chunks WHERE file_id = ?")
            .bind(file_id.to_string())
            .execute(&mut *tx)
            .await?;

        let now = Utc::now().timestamp();
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO knowledge_chunks (id, user_id, file_id, chunk_index, content, embedding, dims, metadata_json, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(chunk.id.to_string())
            .bind(chunk.user_id.to_string())
            .bind(chunk.file_id.to_string())
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(vec_to_blob(&chunk.embedding))
            .bind(chunk.embedding.len() as i64)
            .bind(chunk.metadata.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(chunks.len())
    }

    async fn delete_chunks(&self, file_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM knowledge_chunks WHERE file_id = ?")
            .bind(file_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        filter: &SearchFilter,
    ) -> Result<Vec<SearchResult>> {
        // Tenant scope is applied in SQL; ranking happens in Rust over the
        // tenant's rows, like the rest of the cosine pipeline.
        let rows = match &filter.file_ids {
            None => {
                sqlx::query(
                    "SELECT file_id, chunk_index, content, embedding, metadata_json FROM knowledge_chunks WHERE user_id = ?",
                )
                .bind(filter.user_id.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            Some(file_ids) => {
                if file_ids.is_empty() {
                    return Ok(Vec::new());
                }
                let placeholders = vec!["?"; file_ids.len()].join(", ");
                let sql = format!(
                    "SELECT file_id, chunk_index, content, embedding, metadata_json FROM knowledge_chunks WHERE user_id = ? AND file_id IN ({placeholders})"
                );
                let mut q = sqlx::query(&sql).bind(filter.user_id.to_string());
                for file_id in file_ids {
                    q = q.bind(file_id.to_string());
                }
                q.fetch_all(&self.pool).await?
            }
        };

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let vector = blob_to_vec(&blob);
            let similarity = cosine_similarity(query, &vector).max(0.0) as f64;
            let metadata: String = row.get("metadata_json");

            candidates.push(SearchResult {
                content: row.get("content"),
                file_id: parse_uuid(row.get("file_id"))?,
                similarity,
                chunk_index: row.get("chunk_index"),
                metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
            });
        }

        Ok(rank_candidates(candidates, filter.threshold, filter.limit))
    }
}
