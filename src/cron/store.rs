//! Cron entry persistence and execution log.

use crate::error::{CronError, DbError, Result};
use crate::{AgentConfigId, CronJobId, TaskId};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronEntry {
    pub id: CronJobId,
    pub name: String,
    pub agent_config_id: AgentConfigId,
    pub expression: String,
    pub prompt: String,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CronEntry {
    pub fn schedule(&self) -> Result<Schedule> {
        Schedule::from_str(&self.expression).map_err(|err| CronError::InvalidExpression(err.to_string()).into())
    }
}

pub struct NewCronEntryInput {
    pub name: String,
    pub agent_config_id: AgentConfigId,
    pub expression: String,
    pub prompt: String,
}

pub struct CronStore {
    pool: SqlitePool,
}

impl CronStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: NewCronEntryInput) -> Result<CronEntry> {
        let schedule = Schedule::from_str(&input.expression).map_err(|err| CronError::InvalidExpression(err.to_string()))?;
        let now = Utc::now();
        let next_run_at = schedule.after(&now).next();
        let id = uuid::Uuid::new_v4();

        sqlx::query(
            "INSERT INTO cron_jobs (id, name, agent_config_id, expression, prompt, enabled, next_run_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&input.name)
        .bind(input.agent_config_id.to_string())
        .bind(&input.expression)
        .bind(&input.prompt)
        .bind(next_run_at.map(|t| t.to_rfc3339()))
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        self.get(id).await
    }

    pub async fn get(&self, id: CronJobId) -> Result<CronEntry> {
        let row = sqlx::query("SELECT * FROM cron_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| CronError::NotFound(id.to_string()))?;
        row_to_entry(row)
    }

    pub async fn list(&self) -> Result<Vec<CronEntry>> {
        let rows = sqlx::query("SELECT * FROM cron_jobs ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;
        rows.into_iter().map(row_to_entry).collect()
    }

    /// Every enabled entry whose `next_run_at` has arrived.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<CronEntry>> {
        let rows = sqlx::query("SELECT * FROM cron_jobs WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?")
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;
        rows.into_iter().map(row_to_entry).collect()
    }

    /// Advances `next_run_at` from `after`, not from the missed tick —
    /// this is what bounds a restart-after-downtime to firing each job at
    /// most once rather than replaying every tick it missed.
    pub async fn advance(&self, id: CronJobId, after: DateTime<Utc>) -> Result<()> {
        let entry = self.get(id).await?;
        let schedule = entry.schedule()?;
        let next_run_at = schedule.after(&after).next();

        sqlx::query("UPDATE cron_jobs SET next_run_at = ?, updated_at = ? WHERE id = ?")
            .bind(next_run_at.map(|t| t.to_rfc3339()))
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    pub async fn set_enabled(&self, id: CronJobId, enabled: bool) -> Result<()> {
        let now = Utc::now();
        let next_run_at = if enabled {
            let entry = self.get(id).await?;
            entry.schedule()?.after(&now).next()
        } else {
            None
        };

        sqlx::query("UPDATE cron_jobs SET enabled = ?, next_run_at = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(next_run_at.map(|t| t.to_rfc3339()))
            .bind(now.to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    pub async fn delete(&self, id: CronJobId) -> Result<()> {
        sqlx::query("DELETE FROM cron_jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    pub async fn log_execution(&self, cron_job_id: CronJobId, task_id: Option<TaskId>, status: &str, error: Option<&str>) -> Result<()> {
        sqlx::query("INSERT INTO cron_executions (id, cron_job_id, task_id, status, error, executed_at) VALUES (?, ?, ?, ?, ?, ?)")
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(cron_job_id.to_string())
            .bind(task_id.map(|t| t.to_string()))
            .bind(status)
            .bind(error)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }
}

fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> Result<CronEntry> {
    let id: String = row.try_get("id").map_err(DbError::from)?;
    let agent_config_id: String = row.try_get("agent_config_id").map_err(DbError::from)?;
    let next_run_at: Option<String> = row.try_get("next_run_at").map_err(DbError::from)?;
    let created_at: String = row.try_get("created_at").map_err(DbError::from)?;
    let updated_at: String = row.try_get("updated_at").map_err(DbError::from)?;

    Ok(CronEntry {
        id: id.parse().map_err(|_| CronError::NotFound(id.clone()))?,
        name: row.try_get("name").map_err(DbError::from)?,
        agent_config_id: agent_config_id.parse().map_err(|_| CronError::NotFound(agent_config_id.clone()))?,
        expression: row.try_get("expression").map_err(DbError::from)?,
        prompt: row.try_get("prompt").map_err(DbError::from)?,
        enabled: row.try_get("enabled").map_err(DbError::from)?,
        next_run_at: parse_opt_ts(next_run_at)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| CronError::NotFound(format!("invalid timestamp: {s}")).into())
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(expression: &str) -> NewCronEntryInput {
        NewCronEntryInput {
            name: "nightly digest".to_string(),
            agent_config_id: uuid::Uuid::new_v4(),
            expression: expression.to_string(),
            prompt: "summarize today".to_string(),
        }
    }

    #[tokio::test]
    async fn create_rejects_invalid_expression() {
        let pool = crate::db::connect_in_memory().await;
        let store = CronStore::new(pool);
        let err = store.create(input("not a cron expression")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn create_computes_next_run_at() {
        let pool = crate::db::connect_in_memory().await;
        let store = CronStore::new(pool);
        let entry = store.create(input("0 * * * * * *")).await.unwrap();
        assert!(entry.next_run_at.is_some());
    }

    #[tokio::test]
    async fn advance_moves_next_run_strictly_forward() {
        let pool = crate::db::connect_in_memory().await;
        let store = CronStore::new(pool);
        let entry = store.create(input("0 * * * * * *")).await.unwrap();
        let first_next = entry.next_run_at.unwrap();

        store.advance(entry.id, first_next).await.unwrap();
        let reloaded = store.get(entry.id).await.unwrap();
        assert!(reloaded.next_run_at.unwrap() > first_next);
    }

    #[tokio::test]
    async fn disabling_clears_next_run_at() {
        let pool = crate::db::connect_in_memory().await;
        let store = CronStore::new(pool);
        let entry = store.create(input("0 * * * * * *")).await.unwrap();
        store.set_enabled(entry.id, false).await.unwrap();
        let reloaded = store.get(entry.id).await.unwrap();
        assert!(!reloaded.enabled);
        assert!(reloaded.next_run_at.is_none());
    }
}
