//! AgentConfig: the per-agent model/permission/resource profile (spec §3).
//!
//! Operator-owned, versioned data — not process config (see
//! [`crate::config`] for that). Stored the way the teacher stores
//! `Task.subtasks`/`Task.metadata`: structured sub-objects serialized into
//! JSON columns, with a thin store following `tasks/store.rs`'s shape.

use crate::error::{DbError, Result};
use crate::AgentConfigId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub provider: String,
    pub base_url: Option<String>,
    pub bearer_token: Option<String>,
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub tier_models: HashMap<String, String>,
    pub timeout_secs: u64,
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    Full,
    ReadOnly,
    Approve,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionConfig {
    pub mode: PermissionMode,
    pub sandbox_mode: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    #[serde(default)]
    pub additional_dirs: Vec<String>,
    #[serde(default)]
    pub skip_all: bool,
    pub approval_policy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: f64,
    pub memory_mb: u64,
    pub max_turns: u32,
    pub max_budget_usd: Option<f64>,
    pub max_tokens: Option<u64>,
    pub wall_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServer {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: AgentConfigId,
    pub name: String,
    pub adapter: String,
    pub model_config: ModelConfig,
    pub permission_config: PermissionConfig,
    pub resources: Resources,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServer>,
    pub output_schema: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct CreateAgentConfigInput {
    pub name: String,
    pub adapter: String,
    pub model_config: ModelConfig,
    pub permission_config: PermissionConfig,
    pub resources: Resources,
    pub system_prompt: Option<String>,
    pub mcp_servers: Vec<McpServer>,
    pub output_schema: Option<serde_json::Value>,
}

pub struct AgentConfigStore {
    pool: SqlitePool,
}

impl AgentConfigStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: CreateAgentConfigInput) -> Result<AgentConfig> {
        let id = uuid::Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO agent_configs
                (id, name, adapter, model_config, permission_config, resources,
                 system_prompt, mcp_servers, output_schema, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&input.name)
        .bind(&input.adapter)
        .bind(serde_json::to_string(&input.model_config).map_err(|e| DbError::from(sqlx::Error::Decode(Box::new(e))))?)
        .bind(serde_json::to_string(&input.permission_config).map_err(|e| DbError::from(sqlx::Error::Decode(Box::new(e))))?)
        .bind(serde_json::to_string(&input.resources).map_err(|e| DbError::from(sqlx::Error::Decode(Box::new(e))))?)
        .bind(&input.system_prompt)
        .bind(serde_json::to_string(&input.mcp_servers).map_err(|e| DbError::from(sqlx::Error::Decode(Box::new(e))))?)
        .bind(input.output_schema.as_ref().map(|v| v.to_string()))
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(AgentConfig {
            id,
            name: input.name,
            adapter: input.adapter,
            model_config: input.model_config,
            permission_config: input.permission_config,
            resources: input.resources,
            system_prompt: input.system_prompt,
            mcp_servers: input.mcp_servers,
            output_schema: input.output_schema,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get(&self, id: AgentConfigId) -> Result<AgentConfig> {
        let row = sqlx::query("SELECT * FROM agent_configs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or(DbError::NotFound)?;
        row_to_config(row)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<AgentConfig> {
        let row = sqlx::query("SELECT * FROM agent_configs WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or(DbError::NotFound)?;
        row_to_config(row)
    }

    pub async fn list(&self) -> Result<Vec<AgentConfig>> {
        let rows = sqlx::query("SELECT * FROM agent_configs ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;
        rows.into_iter().map(row_to_config).collect()
    }

    pub async fn delete(&self, id: AgentConfigId) -> Result<()> {
        let result = sqlx::query("DELETE FROM agent_configs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound.into());
        }
        Ok(())
    }
}

fn row_to_config(row: sqlx::sqlite::SqliteRow) -> Result<AgentConfig> {
    let id: String = row.try_get("id").map_err(DbError::from)?;
    let model_config: String = row.try_get("model_config").map_err(DbError::from)?;
    let permission_config: String = row.try_get("permission_config").map_err(DbError::from)?;
    let resources: String = row.try_get("resources").map_err(DbError::from)?;
    let mcp_servers: String = row.try_get("mcp_servers").map_err(DbError::from)?;
    let output_schema: Option<String> = row.try_get("output_schema").map_err(DbError::from)?;
    let created_at: String = row.try_get("created_at").map_err(DbError::from)?;
    let updated_at: String = row.try_get("updated_at").map_err(DbError::from)?;

    Ok(AgentConfig {
        id: id.parse().map_err(|_| DbError::NotFound)?,
        name: row.try_get("name").map_err(DbError::from)?,
        adapter: row.try_get("adapter").map_err(DbError::from)?,
        model_config: serde_json::from_str(&model_config).map_err(|e| DbError::from(sqlx::Error::Decode(Box::new(e))))?,
        permission_config: serde_json::from_str(&permission_config).map_err(|e| DbError::from(sqlx::Error::Decode(Box::new(e))))?,
        resources: serde_json::from_str(&resources).map_err(|e| DbError::from(sqlx::Error::Decode(Box::new(e))))?,
        system_prompt: row.try_get("system_prompt").map_err(DbError::from)?,
        mcp_servers: serde_json::from_str(&mcp_servers).map_err(|e| DbError::from(sqlx::Error::Decode(Box::new(e))))?,
        output_schema: output_schema
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| DbError::from(sqlx::Error::Decode(Box::new(e))))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| DbError::NotFound)?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| DbError::NotFound)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input(name: &str) -> CreateAgentConfigInput {
        CreateAgentConfigInput {
            name: name.to_string(),
            adapter: "claude-code".to_string(),
            model_config: ModelConfig {
                name: "claude-sonnet".to_string(),
                provider: "anthropic".to_string(),
                base_url: None,
                bearer_token: None,
                reasoning_effort: None,
                tier_models: HashMap::new(),
                timeout_secs: 300,
                max_output_tokens: None,
            },
            permission_config: PermissionConfig {
                mode: PermissionMode::Approve,
                sandbox_mode: "workspace-write".to_string(),
                allowed_tools: vec![],
                disallowed_tools: vec![],
                additional_dirs: vec![],
                skip_all: false,
                approval_policy: "untrusted".to_string(),
            },
            resources: Resources {
                cpus: 1.0,
                memory_mb: 2048,
                max_turns: 20,
                max_budget_usd: None,
                max_tokens: None,
                wall_timeout_secs: 1800,
            },
            system_prompt: None,
            mcp_servers: vec![],
            output_schema: None,
        }
    }

    #[tokio::test]
    async fn creates_and_fetches_by_id_and_name() {
        let pool = crate::db::connect_in_memory().await;
        let store = AgentConfigStore::new(pool);

        let created = store.create(sample_input("echo")).await.unwrap();
        let fetched = store.get(created.id).await.unwrap();
        assert_eq!(fetched.name, "echo");

        let by_name = store.get_by_name("echo").await.unwrap();
        assert_eq!(by_name.id, created.id);
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let pool = crate::db::connect_in_memory().await;
        let store = AgentConfigStore::new(pool);
        let created = store.create(sample_input("echo")).await.unwrap();

        store.delete(created.id).await.unwrap();
        assert!(store.get(created.id).await.is_err());
    }
}
