//! Task/Turn persistence.
//!
//! Grounded directly on the teacher's `tasks/store.rs`: a thin struct over
//! `SqlitePool`, a private `row_to_*` mapper per entity, and state written
//! on every transition rather than batched.

use crate::adapters::{AdapterEvent, ParsedOutput, Usage};
use crate::error::{DbError, Result, TaskError};
use crate::{AgentConfigId, SessionId, TaskId, TurnId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "queued" => TaskStatus::Queued,
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => TaskStatus::Pending,
        }
    }

    /// A task in this status still accepts an appended turn (spec.md §3:
    /// "completed/failed/cancelled are terminal for the *current* turn but
    /// the task stays append-eligible until explicitly closed").
    pub fn append_eligible(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TurnStatus {
    fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Pending => "pending",
            TurnStatus::Running => "running",
            TurnStatus::Completed => "completed",
            TurnStatus::Failed => "failed",
            TurnStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => TurnStatus::Running,
            "completed" => TurnStatus::Completed,
            "failed" => TurnStatus::Failed,
            "cancelled" => TurnStatus::Cancelled,
            _ => TurnStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub turn_number: u32,
    pub prompt: String,
    pub status: TurnStatus,
    pub message: Option<String>,
    pub exit_code: Option<i32>,
    pub usage: Usage,
    pub events: Vec<AdapterEvent>,
    pub thread_id: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub agent_config_id: AgentConfigId,
    pub prompt: String,
    pub attachments: Vec<String>,
    pub webhook_url: Option<String>,
    pub wall_timeout: Duration,
    pub status: TaskStatus,
    pub session_id: Option<SessionId>,
    pub thread_id: Option<String>,
    pub turns: Vec<Turn>,
    pub turn_count: u32,
    pub result: Option<Turn>,
    pub error_message: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct NewTaskInput {
    pub agent_config_id: AgentConfigId,
    pub prompt: String,
    pub attachments: Vec<String>,
    pub webhook_url: Option<String>,
    pub wall_timeout: Duration,
    pub metadata: HashMap<String, serde_json::Value>,
}

pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: NewTaskInput) -> Result<Task> {
        let id = uuid::Uuid::new_v4();
        let now = Utc::now();

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        sqlx::query(
            "INSERT INTO tasks
                (id, agent_config_id, prompt, attachments, webhook_url, wall_timeout_secs,
                 status, turn_count, metadata, created_at, queued_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(input.agent_config_id.to_string())
        .bind(&input.prompt)
        .bind(serde_json::to_string(&input.attachments).unwrap_or_default())
        .bind(&input.webhook_url)
        .bind(input.wall_timeout.as_secs() as i64)
        .bind(TaskStatus::Queued.as_str())
        .bind(1i64)
        .bind(serde_json::to_string(&input.metadata).unwrap_or_default())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let turn_id = uuid::Uuid::new_v4();
        sqlx::query(
            "INSERT INTO turns (id, task_id, turn_number, prompt, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(turn_id.to_string())
        .bind(id.to_string())
        .bind(1i64)
        .bind(&input.prompt)
        .bind(TurnStatus::Pending.as_str())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        tx.commit().await.map_err(DbError::from)?;

        self.get(id).await
    }

    /// Appends a new turn to an existing task. Fails with `TaskBusy`
    /// (mapped to `TaskError::TurnInFlight`) if the task is `running`.
    pub async fn append_turn(&self, task_id: TaskId, prompt: String) -> Result<Task> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let row = sqlx::query("SELECT status, turn_count FROM tasks WHERE id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;

        let status = TaskStatus::parse(&row.try_get::<String, _>("status").map_err(DbError::from)?);
        if status == TaskStatus::Running {
            return Err(TaskError::TurnInFlight(task_id.to_string()).into());
        }

        let turn_count: i64 = row.try_get("turn_count").map_err(DbError::from)?;
        let next_number = turn_count + 1;
        let turn_id = uuid::Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO turns (id, task_id, turn_number, prompt, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(turn_id.to_string())
        .bind(task_id.to_string())
        .bind(next_number)
        .bind(&prompt)
        .bind(TurnStatus::Pending.as_str())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        sqlx::query(
            "UPDATE tasks SET status = ?, turn_count = ?, queued_at = ?, completed_at = NULL
             WHERE id = ?",
        )
        .bind(TaskStatus::Queued.as_str())
        .bind(next_number)
        .bind(now.to_rfc3339())
        .bind(task_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        tx.commit().await.map_err(DbError::from)?;
        self.get(task_id).await
    }

    pub async fn get(&self, id: TaskId) -> Result<Task> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;

        let turn_rows = sqlx::query("SELECT * FROM turns WHERE task_id = ? ORDER BY turn_number ASC")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        let turns = turn_rows.into_iter().map(row_to_turn).collect::<Result<Vec<_>>>()?;
        row_to_task(row, turns)
    }

    pub async fn list(&self, status: Option<TaskStatus>, limit: u32) -> Result<Vec<Task>> {
        let rows = if let Some(status) = status {
            sqlx::query("SELECT id FROM tasks WHERE status = ? ORDER BY created_at DESC LIMIT ?")
                .bind(status.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query("SELECT id FROM tasks ORDER BY created_at DESC LIMIT ?")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
        }
        .map_err(DbError::from)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id").map_err(DbError::from)?;
            tasks.push(self.get(id.parse().map_err(|_| TaskError::NotFound(id))?).await?);
        }
        Ok(tasks)
    }

    /// Every task left `running` after an unclean shutdown (spec.md §4.6:
    /// restart recovery resets these to `queued`). Returns the reset ids so
    /// the caller can re-enqueue them.
    pub async fn reset_running_to_queued(&self) -> Result<Vec<TaskId>> {
        let rows = sqlx::query("SELECT id FROM tasks WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("id").map_err(DbError::from)?;
            ids.push(id.parse().map_err(|_| TaskError::NotFound(id.clone()))?);
        }

        sqlx::query("UPDATE tasks SET status = 'queued' WHERE status = 'running'")
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        Ok(ids)
    }

    pub async fn mark_running(&self, id: TaskId) -> Result<()> {
        sqlx::query("UPDATE tasks SET status = ?, started_at = ? WHERE id = ?")
            .bind(TaskStatus::Running.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    pub async fn set_session_id(&self, id: TaskId, session_id: SessionId) -> Result<()> {
        sqlx::query("UPDATE tasks SET session_id = ? WHERE id = ?")
            .bind(session_id.to_string())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    pub async fn set_thread_id(&self, id: TaskId, thread_id: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET thread_id = ? WHERE id = ?")
            .bind(thread_id)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    pub async fn write_turn_result(&self, task_id: TaskId, turn_number: u32, parsed: &ParsedOutput, turn_status: TurnStatus, ended_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE turns SET status = ?, message = ?, exit_code = ?, usage_input = ?,
                usage_cached_input = ?, usage_output = ?, events = ?, thread_id = ?, error = ?,
                ended_at = ?
             WHERE task_id = ? AND turn_number = ?",
        )
        .bind(turn_status.as_str())
        .bind(&parsed.message)
        .bind(parsed.exit_code)
        .bind(parsed.usage.input as i64)
        .bind(parsed.usage.cached_input as i64)
        .bind(parsed.usage.output as i64)
        .bind(serde_json::to_string(&parsed.events).unwrap_or_default())
        .bind(&parsed.thread_id)
        .bind(&parsed.error)
        .bind(ended_at.to_rfc3339())
        .bind(task_id.to_string())
        .bind(turn_number)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    pub async fn mark_turn_started(&self, task_id: TaskId, turn_number: u32) -> Result<()> {
        sqlx::query("UPDATE turns SET status = ?, started_at = ? WHERE task_id = ? AND turn_number = ?")
            .bind(TurnStatus::Running.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(task_id.to_string())
            .bind(turn_number)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    pub async fn finish_task(&self, id: TaskId, status: TaskStatus, error_message: Option<String>) -> Result<()> {
        sqlx::query("UPDATE tasks SET status = ?, error_message = ?, completed_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(&error_message)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    /// Flips to `cancelled` only if still `queued`; returns whether it
    /// applied (a `running` task must instead be cancelled cooperatively via
    /// its `CancellationToken`).
    pub async fn cancel_if_queued(&self, id: TaskId) -> Result<bool> {
        let result = sqlx::query("UPDATE tasks SET status = 'cancelled', completed_at = ? WHERE id = ? AND status = 'queued'")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_turn(row: sqlx::sqlite::SqliteRow) -> Result<Turn> {
    let id: String = row.try_get("id").map_err(DbError::from)?;
    let status: String = row.try_get("status").map_err(DbError::from)?;
    let events: String = row.try_get("events").map_err(DbError::from)?;
    let started_at: Option<String> = row.try_get("started_at").map_err(DbError::from)?;
    let ended_at: Option<String> = row.try_get("ended_at").map_err(DbError::from)?;
    let turn_number: i64 = row.try_get("turn_number").map_err(DbError::from)?;
    let usage_input: i64 = row.try_get("usage_input").map_err(DbError::from)?;
    let usage_cached_input: i64 = row.try_get("usage_cached_input").map_err(DbError::from)?;
    let usage_output: i64 = row.try_get("usage_output").map_err(DbError::from)?;

    Ok(Turn {
        id: id.parse().map_err(|_| TaskError::NotFound(id.clone()))?,
        turn_number: turn_number as u32,
        prompt: row.try_get("prompt").map_err(DbError::from)?,
        status: TurnStatus::parse(&status),
        message: row.try_get("message").map_err(DbError::from)?,
        exit_code: row.try_get("exit_code").map_err(DbError::from)?,
        usage: Usage {
            input: usage_input as u64,
            cached_input: usage_cached_input as u64,
            output: usage_output as u64,
        },
        events: serde_json::from_str(&events).unwrap_or_default(),
        thread_id: row.try_get("thread_id").map_err(DbError::from)?,
        error: row.try_get("error").map_err(DbError::from)?,
        started_at: parse_opt_ts(started_at)?,
        ended_at: parse_opt_ts(ended_at)?,
    })
}

fn row_to_task(row: sqlx::sqlite::SqliteRow, turns: Vec<Turn>) -> Result<Task> {
    let id: String = row.try_get("id").map_err(DbError::from)?;
    let agent_config_id: String = row.try_get("agent_config_id").map_err(DbError::from)?;
    let attachments: String = row.try_get("attachments").map_err(DbError::from)?;
    let status: String = row.try_get("status").map_err(DbError::from)?;
    let session_id: Option<String> = row.try_get("session_id").map_err(DbError::from)?;
    let wall_timeout_secs: i64 = row.try_get("wall_timeout_secs").map_err(DbError::from)?;
    let turn_count: i64 = row.try_get("turn_count").map_err(DbError::from)?;
    let metadata: String = row.try_get("metadata").map_err(DbError::from)?;
    let created_at: String = row.try_get("created_at").map_err(DbError::from)?;
    let queued_at: Option<String> = row.try_get("queued_at").map_err(DbError::from)?;
    let started_at: Option<String> = row.try_get("started_at").map_err(DbError::from)?;
    let completed_at: Option<String> = row.try_get("completed_at").map_err(DbError::from)?;

    let result = turns.iter().rev().find(|t| t.status == TurnStatus::Completed).cloned();

    Ok(Task {
        id: id.parse().map_err(|_| TaskError::NotFound(id.clone()))?,
        agent_config_id: agent_config_id
            .parse()
            .map_err(|_| TaskError::NotFound(agent_config_id.clone()))?,
        prompt: row.try_get("prompt").map_err(DbError::from)?,
        attachments: serde_json::from_str(&attachments).unwrap_or_default(),
        webhook_url: row.try_get("webhook_url").map_err(DbError::from)?,
        wall_timeout: Duration::from_secs(wall_timeout_secs as u64),
        status: TaskStatus::parse(&status),
        session_id: session_id.map(|s| s.parse()).transpose().map_err(|_| TaskError::NotFound(id.clone()))?,
        thread_id: row.try_get("thread_id").map_err(DbError::from)?,
        turns,
        turn_count: turn_count as u32,
        result,
        error_message: row.try_get("error_message").map_err(DbError::from)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: parse_ts(&created_at)?,
        queued_at: parse_opt_ts(queued_at)?,
        started_at: parse_opt_ts(started_at)?,
        completed_at: parse_opt_ts(completed_at)?,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| TaskError::BadRequest(format!("invalid timestamp: {s}")).into())
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(prompt: &str) -> NewTaskInput {
        NewTaskInput {
            agent_config_id: uuid::Uuid::new_v4(),
            prompt: prompt.to_string(),
            attachments: vec![],
            webhook_url: None,
            wall_timeout: Duration::from_secs(300),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn create_persists_first_turn_as_queued() {
        let pool = crate::db::connect_in_memory().await;
        let store = TaskStore::new(pool);
        let task = store.create(input("hello")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.turns.len(), 1);
        assert_eq!(task.turn_count, 1);
    }

    #[tokio::test]
    async fn append_turn_rejected_while_running() {
        let pool = crate::db::connect_in_memory().await;
        let store = TaskStore::new(pool);
        let task = store.create(input("hello")).await.unwrap();

        store.mark_running(task.id).await.unwrap();
        let err = store.append_turn(task.id, "again".to_string()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn append_turn_increments_count() {
        let pool = crate::db::connect_in_memory().await;
        let store = TaskStore::new(pool);
        let task = store.create(input("hello")).await.unwrap();
        let updated = store.append_turn(task.id, "again".to_string()).await.unwrap();
        assert_eq!(updated.turn_count, 2);
        assert_eq!(updated.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn restart_recovery_resets_running_to_queued() {
        let pool = crate::db::connect_in_memory().await;
        let store = TaskStore::new(pool);
        let task = store.create(input("hello")).await.unwrap();
        store.mark_running(task.id).await.unwrap();

        let reset = store.reset_running_to_queued().await.unwrap();
        assert_eq!(reset, vec![task.id]);

        let reloaded = store.get(task.id).await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::Queued);
    }
}
