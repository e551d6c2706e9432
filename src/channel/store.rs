//! Channel session persistence. The durable half of the two-layer store
//! described in [`super`] — the in-memory TTL map is the fast path, this
//! table is what survives a restart.

use crate::error::{ChannelError, DbError, Result};
use crate::{AgentConfigId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSession {
    pub key: String,
    pub channel: String,
    pub conversation_ref: String,
    pub agent_config_id: AgentConfigId,
    pub current_task_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

pub struct ChannelStore {
    pool: SqlitePool,
}

impl ChannelStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(
        &self,
        key: &str,
        channel: &str,
        conversation_ref: &str,
        agent_config_id: AgentConfigId,
        current_task_id: Option<TaskId>,
    ) -> Result<ChannelSession> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO channel_sessions (key, channel, conversation_ref, agent_config_id, current_task_id, created_at, last_active_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET current_task_id = excluded.current_task_id, last_active_at = excluded.last_active_at",
        )
        .bind(key)
        .bind(channel)
        .bind(conversation_ref)
        .bind(agent_config_id.to_string())
        .bind(current_task_id.map(|t| t.to_string()))
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        self.get(key).await
    }

    pub async fn get(&self, key: &str) -> Result<ChannelSession> {
        let row = sqlx::query("SELECT * FROM channel_sessions WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| ChannelError::NotFound(key.to_string()))?;
        row_to_session(row)
    }

    pub async fn find(&self, key: &str) -> Result<Option<ChannelSession>> {
        let row = sqlx::query("SELECT * FROM channel_sessions WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?;
        row.map(row_to_session).transpose()
    }

    pub async fn touch(&self, key: &str, current_task_id: Option<TaskId>) -> Result<()> {
        sqlx::query("UPDATE channel_sessions SET current_task_id = ?, last_active_at = ? WHERE key = ?")
            .bind(current_task_id.map(|t| t.to_string()))
            .bind(Utc::now().to_rfc3339())
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    pub async fn close(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM channel_sessions WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    /// Sessions whose `last_active_at` is older than `ttl` — the
    /// persistent-table half of the TTL sweep; the in-memory map expires
    /// entries on its own but the table needs an explicit pass.
    pub async fn expired(&self, ttl: chrono::Duration) -> Result<Vec<ChannelSession>> {
        let cutoff = Utc::now() - ttl;
        let rows = sqlx::query("SELECT * FROM channel_sessions WHERE last_active_at < ?")
            .bind(cutoff.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;
        rows.into_iter().map(row_to_session).collect()
    }
}

fn row_to_session(row: sqlx::sqlite::SqliteRow) -> Result<ChannelSession> {
    let agent_config_id: String = row.try_get("agent_config_id").map_err(DbError::from)?;
    let current_task_id: Option<String> = row.try_get("current_task_id").map_err(DbError::from)?;
    let created_at: String = row.try_get("created_at").map_err(DbError::from)?;
    let last_active_at: String = row.try_get("last_active_at").map_err(DbError::from)?;

    Ok(ChannelSession {
        key: row.try_get("key").map_err(DbError::from)?,
        channel: row.try_get("channel").map_err(DbError::from)?,
        conversation_ref: row.try_get("conversation_ref").map_err(DbError::from)?,
        agent_config_id: agent_config_id.parse().map_err(|_| ChannelError::NotFound(agent_config_id.clone()))?,
        current_task_id: current_task_id.map(|t| t.parse()).transpose().map_err(|_| ChannelError::NotFound("bad task id".to_string()))?,
        created_at: parse_ts(&created_at)?,
        last_active_at: parse_ts(&last_active_at)?,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ChannelError::NotFound(format!("invalid timestamp: {s}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let pool = crate::db::connect_in_memory().await;
        let store = ChannelStore::new(pool);
        let agent_id = uuid::Uuid::new_v4();
        let task_id = uuid::Uuid::new_v4();

        let session = store.upsert("slack:C1:U1", "slack", "C1", agent_id, Some(task_id)).await.unwrap();
        assert_eq!(session.current_task_id, Some(task_id));

        let fetched = store.get("slack:C1:U1").await.unwrap();
        assert_eq!(fetched.agent_config_id, agent_id);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_key() {
        let pool = crate::db::connect_in_memory().await;
        let store = ChannelStore::new(pool);
        let agent_id = uuid::Uuid::new_v4();
        let first_task = uuid::Uuid::new_v4();
        let second_task = uuid::Uuid::new_v4();

        store.upsert("slack:C1:U1", "slack", "C1", agent_id, Some(first_task)).await.unwrap();
        let session = store.upsert("slack:C1:U1", "slack", "C1", agent_id, Some(second_task)).await.unwrap();

        assert_eq!(session.current_task_id, Some(second_task));
    }

    #[tokio::test]
    async fn close_removes_the_session() {
        let pool = crate::db::connect_in_memory().await;
        let store = ChannelStore::new(pool);
        let agent_id = uuid::Uuid::new_v4();
        store.upsert("slack:C1:U1", "slack", "C1", agent_id, None).await.unwrap();

        store.close("slack:C1:U1").await.unwrap();
        assert!(store.find("slack:C1:U1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_filters_by_last_active_at() {
        let pool = crate::db::connect_in_memory().await;
        let store = ChannelStore::new(pool);
        let agent_id = uuid::Uuid::new_v4();
        store.upsert("slack:C1:U1", "slack", "C1", agent_id, None).await.unwrap();

        assert!(store.expired(chrono::Duration::seconds(0)).await.unwrap().len() == 1);
        assert!(store.expired(chrono::Duration::hours(1)).await.unwrap().is_empty());
    }
}
