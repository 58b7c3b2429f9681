//! Durable file-processing queue.
//!
//! Jobs live in the `jobs` table. A partial unique index over active
//! statuses guarantees at most one queued-or-running job per file, which is
//! what makes orchestrator runs single-writer per file. Retryable failures
//! reschedule with exponential backoff (base delay doubling per attempt)
//! until the attempt budget is spent.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A file-processing request: which file, for which tenant.
#[derive(Debug, Clone)]
pub struct ProcessJob {
    pub file_id: Uuid,
    pub user_id: Uuid,
}

/// A job handed to a worker. `attempt` is 1-based.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub file_id: Uuid,
    pub user_id: Uuid,
    pub attempt: u32,
}

/// What became of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Rescheduled with backoff; the file stays `processing`.
    Rescheduled { next_attempt: u32 },
    /// Attempt budget exhausted or the error was not retryable.
    Terminal,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a processing job. If the file already has an active job the
    /// call is a no-op returning that job's id (the enqueue is idempotent
    /// per file, not an error).
    async fn enqueue(&self, job: &ProcessJob) -> Result<Uuid>;

    /// Claim up to `limit` ready jobs, marking them running.
    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedJob>>;

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()>;

    /// Record a failed attempt. Retryable failures within budget are
    /// rescheduled with exponential backoff; everything else is terminal.
    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        retryable: bool,
    ) -> Result<FailureOutcome>;

    /// Re-enqueue `pending` files older than `min_age` that have no active
    /// job — the compensating sweep for a crash between upload acceptance
    /// and enqueue. Returns how many were recovered.
    async fn requeue_orphans(&self, min_age: Duration) -> Result<u64>;
}

/// SQLite-backed queue.
pub struct SqliteQueue {
    pool: SqlitePool,
    max_attempts: u32,
    backoff_base_secs: u64,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, max_attempts: u32, backoff_base_secs: u64) -> Self {
        Self {
            pool,
            max_attempts,
            backoff_base_secs,
        }
    }

    /// Delay before attempt `next_attempt` (2-based: the delay applied
    /// after the first failure is the base).
    fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(10);
        Duration::from_secs(self.backoff_base_secs << exponent)
    }
}

#[async_trait]
impl JobQueue for SqliteQueue {
    async fn enqueue(&self, job: &ProcessJob) -> Result<Uuid> {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE file_id = ? AND status IN ('queued', 'running')",
        )
        .bind(job.file_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = existing {
            return Uuid::parse_str(&id).map_err(|e| Error::Persistence(e.to_string()));
        }

        let id = Uuid::new_v4();
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO jobs (id, file_id, user_id, status, attempts, max_attempts, run_at, created_at, updated_at)
            VALUES (?, ?, ?, 'queued', 0, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(job.file_id.to_string())
        .bind(job.user_id.to_string())
        .bind(self.max_attempts as i64)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedJob>> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT id, file_id, user_id, attempts FROM jobs
            WHERE status = 'queued' AND run_at <= ?
            ORDER BY run_at, created_at
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.get("id");
            let attempts: i64 = row.get("attempts");
            sqlx::query(
                "UPDATE jobs SET status = 'running', attempts = attempts + 1, updated_at = ? WHERE id = ?",
            )
            .bind(now)
            .bind(&id)
            .execute(&mut *tx)
            .await?;

            let file_id: String = row.get("file_id");
            let user_id: String = row.get("user_id");
            claimed.push(ClaimedJob {
                id: Uuid::parse_str(&id).map_err(|e| Error::Persistence(e.to_string()))?,
                file_id: Uuid::parse_str(&file_id)
                    .map_err(|e| Error::Persistence(e.to_string()))?,
                user_id: Uuid::parse_str(&user_id)
                    .map_err(|e| Error::Persistence(e.to_string()))?,
                attempt: attempts as u32 + 1,
            });
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = 'succeeded', updated_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        retryable: bool,
    ) -> Result<FailureOutcome> {
        let row = sqlx::query("SELECT attempts, max_attempts FROM jobs WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Err(Error::NotFound(format!("job {job_id} not found")));
        };
        let attempts: i64 = row.get("attempts");
        let max_attempts: i64 = row.get("max_attempts");
        let now = Utc::now().timestamp();

        if retryable && attempts < max_attempts {
            let delay = self.backoff_delay(attempts as u32);
            sqlx::query(
                "UPDATE jobs SET status = 'queued', run_at = ?, last_error = ?, updated_at = ? WHERE id = ?",
            )
            .bind(now + delay.as_secs() as i64)
            .bind(error)
            .bind(now)
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;

            return Ok(FailureOutcome::Rescheduled {
                next_attempt: attempts as u32 + 1,
            });
        }

        sqlx::query(
            "UPDATE jobs SET status = 'failed', last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(now)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(FailureOutcome::Terminal)
    }

    async fn requeue_orphans(&self, min_age: Duration) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - min_age.as_secs() as i64;
        let rows = sqlx::query(
            r#"
            SELECT f.id, f.user_id FROM files f
            WHERE f.status = 'pending' AND f.created_at <= ?
              AND NOT EXISTS (
                SELECT 1 FROM jobs j
                WHERE j.file_id = f.id AND j.status IN ('queued', 'running')
              )
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut recovered = 0u64;
        for row in &rows {
            let file_id: String = row.get("id");
            let user_id: String = row.get("user_id");
            let job = ProcessJob {
                file_id: Uuid::parse_str(&file_id)
                    .map_err(|e| Error::Persistence(e.to_string()))?,
                user_id: Uuid::parse_str(&user_id)
                    .map_err(|e| Error::Persistence(e.to_string()))?,
            };
            self.enqueue(&job).await?;
            recovered += 1;
        }
        Ok(recovered)
    }
}
