//! Batch/BatchTask persistence.
//!
//! Mirrors `tasks::store`'s shape: a thin struct over `SqlitePool`, a
//! private `row_to_*` mapper, and an atomic-claim transaction for the
//! multi-worker queue.

use crate::error::{BatchError, DbError, Result};
use crate::{AgentConfigId, BatchId, BatchTaskId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Paused => "paused",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "paused" => BatchStatus::Paused,
            "completed" => BatchStatus::Completed,
            "failed" => BatchStatus::Failed,
            "cancelled" => BatchStatus::Cancelled,
            _ => BatchStatus::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Dead,
    Cancelled,
}

impl BatchTaskStatus {
    fn as_str(&self) -> &'static str {
        match self {
            BatchTaskStatus::Pending => "pending",
            BatchTaskStatus::Running => "running",
            BatchTaskStatus::Completed => "completed",
            BatchTaskStatus::Failed => "failed",
            BatchTaskStatus::Dead => "dead",
            BatchTaskStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => BatchTaskStatus::Running,
            "completed" => BatchTaskStatus::Completed,
            "failed" => BatchTaskStatus::Failed,
            "dead" => BatchTaskStatus::Dead,
            "cancelled" => BatchTaskStatus::Cancelled,
            _ => BatchTaskStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub name: String,
    pub agent_config_id: AgentConfigId,
    pub status: BatchStatus,
    pub max_concurrency: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchTask {
    pub id: BatchTaskId,
    pub batch_id: BatchId,
    pub idx: u32,
    pub status: BatchTaskStatus,
    pub prompt: String,
    pub attempt: u32,
    pub worker_id: Option<String>,
    pub task_id: Option<TaskId>,
    pub last_error: Option<String>,
    pub dead_reason: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Counts across every status in a batch, used both for the CAS-to-terminal
/// check and the periodic progress event.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BatchCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    pub cancelled: u64,
}

impl BatchCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed + self.dead + self.cancelled
    }

    pub fn settled(&self) -> u64 {
        self.completed + self.failed + self.dead + self.cancelled
    }
}

pub struct NewBatchInput {
    pub name: String,
    pub agent_config_id: AgentConfigId,
    pub prompts: Vec<String>,
    pub max_concurrency: u32,
    pub max_retries: u32,
}

pub struct BatchStore {
    pool: SqlitePool,
}

impl BatchStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Atomically inserts the batch row and one `BatchTask` per prompt.
    pub async fn create(&self, input: NewBatchInput) -> Result<Batch> {
        let id = uuid::Uuid::new_v4();
        let now = Utc::now();

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        sqlx::query(
            "INSERT INTO batches (id, name, agent_config_id, status, max_concurrency, max_retries, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&input.name)
        .bind(input.agent_config_id.to_string())
        .bind(BatchStatus::Running.as_str())
        .bind(input.max_concurrency)
        .bind(input.max_retries)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        for (idx, prompt) in input.prompts.iter().enumerate() {
            sqlx::query(
                "INSERT INTO batch_tasks (id, batch_id, idx, status, prompt, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(id.to_string())
            .bind(idx as i64)
            .bind(BatchTaskStatus::Pending.as_str())
            .bind(prompt)
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;
        }

        tx.commit().await.map_err(DbError::from)?;
        self.get(id).await
    }

    pub async fn get(&self, id: BatchId) -> Result<Batch> {
        let row = sqlx::query("SELECT * FROM batches WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| BatchError::NotFound(id.to_string()))?;
        row_to_batch(row)
    }

    pub async fn list(&self, limit: u32) -> Result<Vec<Batch>> {
        let rows = sqlx::query("SELECT * FROM batches ORDER BY created_at DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;
        rows.into_iter().map(row_to_batch).collect()
    }

    pub async fn counts(&self, batch_id: BatchId) -> Result<BatchCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) as n FROM batch_tasks WHERE batch_id = ? GROUP BY status")
            .bind(batch_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        let mut counts = BatchCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(DbError::from)?;
            let n: i64 = row.try_get("n").map_err(DbError::from)?;
            match BatchTaskStatus::parse(&status) {
                BatchTaskStatus::Pending => counts.pending = n as u64,
                BatchTaskStatus::Running => counts.running = n as u64,
                BatchTaskStatus::Completed => counts.completed = n as u64,
                BatchTaskStatus::Failed => counts.failed = n as u64,
                BatchTaskStatus::Dead => counts.dead = n as u64,
                BatchTaskStatus::Cancelled => counts.cancelled = n as u64,
            }
        }
        Ok(counts)
    }

    pub async fn list_tasks(&self, batch_id: BatchId) -> Result<Vec<BatchTask>> {
        let rows = sqlx::query("SELECT * FROM batch_tasks WHERE batch_id = ? ORDER BY idx ASC")
            .bind(batch_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;
        rows.into_iter().map(row_to_batch_task).collect()
    }

    /// Claims a single `pending` task for `worker_id`, ordered by index.
    /// The `UPDATE ... WHERE status = 'pending'` inside the transaction is
    /// what makes concurrent workers safe: at most one commits the claim.
    pub async fn claim_one(&self, batch_id: BatchId, worker_id: &str) -> Result<Option<BatchTask>> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let row = sqlx::query(
            "SELECT id FROM batch_tasks WHERE batch_id = ? AND status = 'pending' ORDER BY idx ASC LIMIT 1",
        )
        .bind(batch_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let Some(row) = row else {
            tx.commit().await.map_err(DbError::from)?;
            return Ok(None);
        };
        let task_id: String = row.try_get("id").map_err(DbError::from)?;
        let now = Utc::now();

        let updated = sqlx::query(
            "UPDATE batch_tasks SET status = 'running', worker_id = ?, claimed_at = ?, started_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(worker_id)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(&task_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        if updated.rows_affected() == 0 {
            tx.commit().await.map_err(DbError::from)?;
            return Ok(None);
        }

        let claimed = sqlx::query("SELECT * FROM batch_tasks WHERE id = ?")
            .bind(&task_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(DbError::from)?;
        tx.commit().await.map_err(DbError::from)?;
        Some(row_to_batch_task(claimed)).transpose()
    }

    /// Records the child task id once it's created, so `cancel` can find
    /// and signal running children before they finish on their own.
    pub async fn set_task_id(&self, id: BatchTaskId, task_id: TaskId) -> Result<()> {
        sqlx::query("UPDATE batch_tasks SET task_id = ? WHERE id = ?")
            .bind(task_id.to_string())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    pub async fn mark_completed(&self, id: BatchTaskId, task_id: TaskId) -> Result<()> {
        sqlx::query(
            "UPDATE batch_tasks SET status = 'completed', task_id = ?, completed_at = ? WHERE id = ?",
        )
        .bind(task_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    /// On failure: increments `attempt` and either resets to `pending`
    /// (retry budget remains), dead-letters the task (budget exhausted), or
    /// marks it `failed` outright when `retryable` is false — a retry would
    /// fail identically, so it never enters the retry loop.
    pub async fn mark_failed(
        &self,
        id: BatchTaskId,
        task_id: Option<TaskId>,
        error: &str,
        max_retries: u32,
        retryable: bool,
    ) -> Result<BatchTaskStatus> {
        let row = sqlx::query("SELECT attempt FROM batch_tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| BatchError::TaskNotFound(id.to_string()))?;
        let attempt: i64 = row.try_get("attempt").map_err(DbError::from)?;
        let next_attempt = attempt + 1;

        if !retryable {
            sqlx::query(
                "UPDATE batch_tasks SET status = 'failed', attempt = ?, task_id = ?, last_error = ?, completed_at = ?
                 WHERE id = ?",
            )
            .bind(next_attempt)
            .bind(task_id.map(|t| t.to_string()))
            .bind(error)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
            Ok(BatchTaskStatus::Failed)
        } else if (next_attempt as u32) < max_retries {
            sqlx::query(
                "UPDATE batch_tasks SET status = 'pending', attempt = ?, task_id = ?, last_error = ?,
                    worker_id = NULL, claimed_at = NULL, started_at = NULL
                 WHERE id = ?",
            )
            .bind(next_attempt)
            .bind(task_id.map(|t| t.to_string()))
            .bind(error)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
            Ok(BatchTaskStatus::Pending)
        } else {
            sqlx::query(
                "UPDATE batch_tasks SET status = 'dead', attempt = ?, task_id = ?, last_error = ?,
                    dead_reason = ?, completed_at = ?
                 WHERE id = ?",
            )
            .bind(next_attempt)
            .bind(task_id.map(|t| t.to_string()))
            .bind(error)
            .bind(format!("exhausted {max_retries} retries: {error}"))
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
            Ok(BatchTaskStatus::Dead)
        }
    }

    /// Resets every `dead` task in a batch back to `pending`, clearing the
    /// retry budget so it gets `max_retries` fresh attempts.
    pub async fn retry_dead(&self, batch_id: BatchId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE batch_tasks SET status = 'pending', attempt = 0, last_error = NULL, dead_reason = NULL
             WHERE batch_id = ? AND status = 'dead'",
        )
        .bind(batch_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(result.rows_affected())
    }

    /// Restart recovery: every task left `running` is orphaned (its worker
    /// is gone) and goes back to `pending`. Returns affected batch ids.
    pub async fn reset_running(&self) -> Result<Vec<BatchId>> {
        let rows = sqlx::query("SELECT DISTINCT batch_id FROM batch_tasks WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("batch_id").map_err(DbError::from)?;
            ids.push(id.parse().map_err(|_| BatchError::NotFound(id.clone()))?);
        }

        sqlx::query(
            "UPDATE batch_tasks SET status = 'pending', worker_id = NULL, claimed_at = NULL, started_at = NULL
             WHERE status = 'running'",
        )
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(ids)
    }

    /// Marks every still-`pending` task `cancelled` and returns the
    /// `task_id`s of tasks left `running` so the caller can signal them.
    pub async fn cancel_pending_and_list_running(&self, batch_id: BatchId) -> Result<Vec<TaskId>> {
        sqlx::query("UPDATE batch_tasks SET status = 'cancelled' WHERE batch_id = ? AND status = 'pending'")
            .bind(batch_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        let rows = sqlx::query("SELECT task_id FROM batch_tasks WHERE batch_id = ? AND status = 'running' AND task_id IS NOT NULL")
            .bind(batch_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let task_id: String = row.try_get("task_id").map_err(DbError::from)?;
            ids.push(task_id.parse().map_err(|_| BatchError::TaskNotFound(task_id.clone()))?);
        }
        Ok(ids)
    }

    pub async fn set_status(&self, id: BatchId, status: BatchStatus) -> Result<()> {
        sqlx::query("UPDATE batches SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    /// CAS a running batch to its terminal status once no task is left
    /// `pending`/`running`. No-ops if the batch is already terminal or if
    /// work remains.
    pub async fn try_finish(&self, id: BatchId) -> Result<Option<BatchStatus>> {
        let batch = self.get(id).await?;
        if batch.status.is_terminal() {
            return Ok(None);
        }
        let counts = self.counts(id).await?;
        if counts.pending + counts.running > 0 {
            return Ok(None);
        }

        let terminal = if counts.failed + counts.dead > 0 { BatchStatus::Failed } else { BatchStatus::Completed };
        let result = sqlx::query("UPDATE batches SET status = ?, updated_at = ? WHERE id = ? AND status = 'running'")
            .bind(terminal.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        Ok(if result.rows_affected() > 0 { Some(terminal) } else { None })
    }
}

fn row_to_batch(row: sqlx::sqlite::SqliteRow) -> Result<Batch> {
    let id: String = row.try_get("id").map_err(DbError::from)?;
    let agent_config_id: String = row.try_get("agent_config_id").map_err(DbError::from)?;
    let status: String = row.try_get("status").map_err(DbError::from)?;
    let max_concurrency: i64 = row.try_get("max_concurrency").map_err(DbError::from)?;
    let max_retries: i64 = row.try_get("max_retries").map_err(DbError::from)?;
    let created_at: String = row.try_get("created_at").map_err(DbError::from)?;
    let updated_at: String = row.try_get("updated_at").map_err(DbError::from)?;

    Ok(Batch {
        id: id.parse().map_err(|_| BatchError::NotFound(id.clone()))?,
        name: row.try_get("name").map_err(DbError::from)?,
        agent_config_id: agent_config_id.parse().map_err(|_| BatchError::NotFound(agent_config_id.clone()))?,
        status: BatchStatus::parse(&status),
        max_concurrency: max_concurrency as u32,
        max_retries: max_retries as u32,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn row_to_batch_task(row: sqlx::sqlite::SqliteRow) -> Result<BatchTask> {
    let id: String = row.try_get("id").map_err(DbError::from)?;
    let batch_id: String = row.try_get("batch_id").map_err(DbError::from)?;
    let idx: i64 = row.try_get("idx").map_err(DbError::from)?;
    let status: String = row.try_get("status").map_err(DbError::from)?;
    let attempt: i64 = row.try_get("attempt").map_err(DbError::from)?;
    let task_id: Option<String> = row.try_get("task_id").map_err(DbError::from)?;
    let claimed_at: Option<String> = row.try_get("claimed_at").map_err(DbError::from)?;
    let started_at: Option<String> = row.try_get("started_at").map_err(DbError::from)?;
    let completed_at: Option<String> = row.try_get("completed_at").map_err(DbError::from)?;
    let created_at: String = row.try_get("created_at").map_err(DbError::from)?;

    Ok(BatchTask {
        id: id.parse().map_err(|_| BatchError::TaskNotFound(id.clone()))?,
        batch_id: batch_id.parse().map_err(|_| BatchError::NotFound(batch_id.clone()))?,
        idx: idx as u32,
        status: BatchTaskStatus::parse(&status),
        prompt: row.try_get("prompt").map_err(DbError::from)?,
        attempt: attempt as u32,
        worker_id: row.try_get("worker_id").map_err(DbError::from)?,
        task_id: task_id.map(|t| t.parse()).transpose().map_err(|_| BatchError::TaskNotFound(id.clone()))?,
        last_error: row.try_get("last_error").map_err(DbError::from)?,
        dead_reason: row.try_get("dead_reason").map_err(DbError::from)?,
        claimed_at: parse_opt_ts(claimed_at)?,
        started_at: parse_opt_ts(started_at)?,
        completed_at: parse_opt_ts(completed_at)?,
        created_at: parse_ts(&created_at)?,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| BatchError::NotFound(format!("invalid timestamp: {s}")).into())
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(prompts: &[&str]) -> NewBatchInput {
        NewBatchInput {
            name: "batch".to_string(),
            agent_config_id: uuid::Uuid::new_v4(),
            prompts: prompts.iter().map(|s| s.to_string()).collect(),
            max_concurrency: 2,
            max_retries: 2,
        }
    }

    #[tokio::test]
    async fn create_inserts_one_task_per_prompt() {
        let pool = crate::db::connect_in_memory().await;
        let store = BatchStore::new(pool);
        let batch = store.create(input(&["a", "b", "c"])).await.unwrap();
        let tasks = store.list_tasks(batch.id).await.unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.status == BatchTaskStatus::Pending));
    }

    #[tokio::test]
    async fn claim_one_is_exclusive_and_ordered() {
        let pool = crate::db::connect_in_memory().await;
        let store = BatchStore::new(pool);
        let batch = store.create(input(&["a", "b"])).await.unwrap();

        let first = store.claim_one(batch.id, "worker-0").await.unwrap().unwrap();
        assert_eq!(first.idx, 0);
        assert_eq!(first.status, BatchTaskStatus::Running);

        let second = store.claim_one(batch.id, "worker-1").await.unwrap().unwrap();
        assert_eq!(second.idx, 1);

        assert!(store.claim_one(batch.id, "worker-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_failed_retries_until_budget_exhausted_then_dies() {
        let pool = crate::db::connect_in_memory().await;
        let store = BatchStore::new(pool);
        let batch = store.create(input(&["a"])).await.unwrap();
        let task = store.claim_one(batch.id, "worker-0").await.unwrap().unwrap();

        let status = store.mark_failed(task.id, None, "boom", 2, true).await.unwrap();
        assert_eq!(status, BatchTaskStatus::Pending);

        let reclaimed = store.claim_one(batch.id, "worker-0").await.unwrap().unwrap();
        let status = store.mark_failed(reclaimed.id, None, "boom again", 2, true).await.unwrap();
        assert_eq!(status, BatchTaskStatus::Dead);
    }

    #[tokio::test]
    async fn mark_failed_non_retryable_skips_the_retry_loop() {
        let pool = crate::db::connect_in_memory().await;
        let store = BatchStore::new(pool);
        let batch = store.create(input(&["a"])).await.unwrap();
        let task = store.claim_one(batch.id, "worker-0").await.unwrap().unwrap();

        let status = store.mark_failed(task.id, None, "agent not found", 2, false).await.unwrap();
        assert_eq!(status, BatchTaskStatus::Failed);

        let tasks = store.list_tasks(batch.id).await.unwrap();
        assert_eq!(tasks[0].status, BatchTaskStatus::Failed);
    }

    #[tokio::test]
    async fn try_finish_cas_to_completed_once_all_settled() {
        let pool = crate::db::connect_in_memory().await;
        let store = BatchStore::new(pool);
        let batch = store.create(input(&["a"])).await.unwrap();
        let task = store.claim_one(batch.id, "worker-0").await.unwrap().unwrap();

        assert!(store.try_finish(batch.id).await.unwrap().is_none());

        store.mark_completed(task.id, uuid::Uuid::new_v4()).await.unwrap();
        let finished = store.try_finish(batch.id).await.unwrap();
        assert_eq!(finished, Some(BatchStatus::Completed));
    }
}
