//! Session Manager (spec §4.5): owns the `create` sequence that turns an
//! `AgentConfig` into a running, labelled sandbox container, plus the
//! stop/start/reconnect/exec/logs/delete operations over its lifetime.
//!
//! Grounded on `agent_config.rs`'s `AgentConfigStore` shape (thin struct
//! over `SqlitePool`, JSON sub-structs, private `row_to_*` mapper).

use crate::adapters::{AdapterRegistry, SessionInfo};
use crate::agent_config::AgentConfig;
use crate::container::{ContainerCreateSpec, ContainerEngineDyn};
use crate::error::{Result, SessionError};
use crate::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

impl SessionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Creating => "creating",
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => SessionStatus::Running,
            "stopped" => SessionStatus::Stopped,
            "error" => SessionStatus::Error,
            _ => SessionStatus::Creating,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceCaps {
    pub cpus: Option<f64>,
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub agent_config_id: crate::AgentConfigId,
    pub agent_kind: String,
    pub container_id: Option<String>,
    pub status: SessionStatus,
    pub workspace_path: String,
    pub env_snapshot: HashMap<String, String>,
    pub resource_caps: ResourceCaps,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

pub struct CreateSessionRequest {
    pub agent_config: AgentConfig,
    pub workspace_path: Option<String>,
    pub resource_caps: ResourceCaps,
    pub network_mode: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

pub struct SessionManager {
    pool: SqlitePool,
    engine: Arc<dyn ContainerEngineDyn>,
    adapters: Arc<AdapterRegistry>,
    workspace_base: PathBuf,
}

impl SessionManager {
    pub fn new(
        pool: SqlitePool,
        engine: Arc<dyn ContainerEngineDyn>,
        adapters: Arc<AdapterRegistry>,
        workspace_base: PathBuf,
    ) -> Self {
        Self {
            pool,
            engine,
            adapters,
            workspace_base,
        }
    }

    pub async fn create(&self, req: CreateSessionRequest) -> Result<Session> {
        // Step 1: resolve adapter by agent-kind, fail-fast if unknown.
        let adapter = self.adapters.get(&req.agent_config.adapter)?;

        // Step 2: short session id, resolve workspace path, create directory.
        let id = uuid::Uuid::new_v4();
        let workspace_path = match &req.workspace_path {
            Some(p) if Path::new(p).is_absolute() => p.clone(),
            Some(p) => self.workspace_base.join(p).to_string_lossy().to_string(),
            None => self.workspace_base.join(id.to_string()).to_string_lossy().to_string(),
        };
        tokio::fs::create_dir_all(&workspace_path)
            .await
            .map_err(|e| SessionError::InvalidState(format!("failed to create workspace: {e}")))?;

        // Step 3: persist in `creating`.
        let now = Utc::now();
        let mut session = Session {
            id,
            agent_config_id: req.agent_config.id,
            agent_kind: req.agent_config.adapter.clone(),
            container_id: None,
            status: SessionStatus::Creating,
            workspace_path: workspace_path.clone(),
            env_snapshot: HashMap::new(),
            resource_caps: req.resource_caps.clone(),
            error_message: None,
            created_at: now,
            updated_at: now,
            stopped_at: None,
        };
        self.insert(&session).await?;

        // Step 4: build container spec, apply per-request resource caps.
        let session_info = SessionInfo {
            session_id: id,
            agent_name: adapter.name().to_string(),
            workspace_path: workspace_path.clone(),
            network_mode: req.network_mode.clone(),
            cpus: req.resource_caps.cpus.unwrap_or(req.agent_config.resources.cpus),
            memory_mb: req.resource_caps.memory_mb.unwrap_or(req.agent_config.resources.memory_mb),
        };
        let mut container_spec = adapter.prepare_container(&session_info, &req.agent_config);
        if let Some(cpus) = req.resource_caps.cpus {
            container_spec.cpus = cpus;
        }
        if let Some(memory_mb) = req.resource_caps.memory_mb {
            container_spec.memory_mb = memory_mb;
        }
        container_spec
            .labels
            .insert("created.at".to_string(), now.to_rfc3339());
        session.env_snapshot = container_spec.env.clone();
        self.update_env_snapshot(&session).await?;

        let create_spec = ContainerCreateSpec {
            name: format!("agentbox-{id}"),
            image: container_spec.image.clone(),
            env: container_spec.env.clone(),
            mounts: container_spec.mounts.clone(),
            labels: container_spec.labels.clone(),
            network_mode: container_spec.network_mode.clone(),
            cpus: container_spec.cpus,
            memory_mb: container_spec.memory_mb,
        };

        // Step 5: create container; on failure mark session `error`.
        let container_id = match self.engine.create(create_spec).await {
            Ok(id) => id,
            Err(err) => {
                self.mark_error(&mut session, err.to_string()).await?;
                return Err(err);
            }
        };
        session.container_id = Some(container_id.clone());
        self.set_container_id(&session).await?;

        // Step 6: start container; on failure mark session `error`.
        if let Err(err) = self.engine.start(&container_id).await {
            self.mark_error(&mut session, err.to_string()).await?;
            return Err(err);
        }

        // Step 7: provision config files; failures are warnings, not fatal.
        let api_key = req
            .agent_config
            .model_config
            .bearer_token
            .clone()
            .unwrap_or_default();
        for (path, content) in adapter.get_config_files(&req.agent_config, &api_key) {
            let resolved = expand_home(&path, &workspace_path);
            if let Err(err) = self.engine.write_file(&container_id, &resolved, content.as_bytes()).await {
                tracing::warn!(session_id = %id, path = %resolved, error = %err, "session: failed to provision config file");
            }
        }

        // Step 8: flip to running.
        session.status = SessionStatus::Running;
        session.updated_at = Utc::now();
        self.set_status(&session).await?;

        Ok(session)
    }

    pub async fn get(&self, id: SessionId) -> Result<Session> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(crate::error::DbError::from)?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        row_to_session(row)
    }

    pub async fn stop(&self, id: SessionId) -> Result<Session> {
        let mut session = self.get(id).await?;
        if let Some(container_id) = &session.container_id {
            self.engine.stop(container_id, Duration::from_secs(10)).await?;
        }
        session.status = SessionStatus::Stopped;
        session.stopped_at = Some(Utc::now());
        session.updated_at = Utc::now();
        self.set_status(&session).await?;
        Ok(session)
    }

    pub async fn start(&self, id: SessionId) -> Result<Session> {
        let mut session = self.get(id).await?;
        let container_id = session
            .container_id
            .clone()
            .ok_or_else(|| SessionError::InvalidState("session has no container to start".to_string()))?;
        self.engine.start(&container_id).await?;
        session.status = SessionStatus::Running;
        session.stopped_at = None;
        session.updated_at = Utc::now();
        self.set_status(&session).await?;
        Ok(session)
    }

    /// Inspect the container; restart it if it's stopped.
    pub async fn reconnect(&self, id: SessionId) -> Result<Session> {
        let session = self.get(id).await?;
        let container_id = session
            .container_id
            .clone()
            .ok_or_else(|| SessionError::InvalidState("session has no container".to_string()))?;

        let info = self.engine.inspect(&container_id).await?;
        if info.status != crate::container::ContainerStatus::Running {
            return self.start(id).await;
        }
        Ok(session)
    }

    pub async fn exec(&self, id: SessionId, argv: Vec<String>) -> Result<ExecResult> {
        let session = self.get(id).await?;
        let container_id = session
            .container_id
            .clone()
            .ok_or_else(|| SessionError::InvalidState("session has no container".to_string()))?;

        let started = Instant::now();
        let result = self.engine.exec(&container_id, argv.clone()).await?;
        let duration = started.elapsed();

        self.record_execution(id, &argv, result.exit_code, &result.stderr, duration)
            .await?;

        Ok(ExecResult {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            duration,
        })
    }

    /// Raw demultiplexed exec stream for the Task Manager worker loop
    /// (spec §4.6 step 8) — unlike [`Self::exec`], this doesn't collect
    /// output or write an execution record; the caller drains and parses it.
    pub async fn exec_stream(&self, id: SessionId, argv: Vec<String>) -> Result<crate::container::OutputStream> {
        let session = self.get(id).await?;
        let container_id = session
            .container_id
            .ok_or_else(|| SessionError::InvalidState("session has no container".to_string()))?;
        self.engine.exec_stream(&container_id, argv).await
    }

    pub async fn logs(&self, id: SessionId, follow: bool) -> Result<crate::container::OutputStream> {
        let session = self.get(id).await?;
        let container_id = session
            .container_id
            .ok_or_else(|| SessionError::InvalidState("session has no container".to_string()))?;
        self.engine.logs(&container_id, follow).await
    }

    pub async fn delete(&self, id: SessionId) -> Result<()> {
        let session = self.get(id).await?;
        if let Some(container_id) = &session.container_id {
            self.engine.stop(container_id, Duration::from_secs(10)).await.ok();
            self.engine.remove(container_id, true, true).await.ok();
        }
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(crate::error::DbError::from)?;
        Ok(())
    }

    /// Container ids of every persisted session, for the Garbage Collector's
    /// `SessionLookup` callback.
    pub async fn list_container_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT container_id FROM sessions WHERE container_id IS NOT NULL")
            .fetch_all(&self.pool)
            .await
            .map_err(crate::error::DbError::from)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.try_get::<Option<String>, _>("container_id").ok().flatten())
            .collect())
    }

    async fn insert(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions
                (id, agent_config_id, agent_kind, container_id, status, workspace_path,
                 env_snapshot, resource_caps, error_message, created_at, updated_at, stopped_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(session.agent_config_id.to_string())
        .bind(&session.agent_kind)
        .bind(&session.container_id)
        .bind(session.status.as_str())
        .bind(&session.workspace_path)
        .bind(serde_json::to_string(&session.env_snapshot).unwrap_or_default())
        .bind(serde_json::to_string(&session.resource_caps).unwrap_or_default())
        .bind(&session.error_message)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .bind(session.stopped_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::from)?;
        Ok(())
    }

    async fn update_env_snapshot(&self, session: &Session) -> Result<()> {
        sqlx::query("UPDATE sessions SET env_snapshot = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&session.env_snapshot).unwrap_or_default())
            .bind(Utc::now().to_rfc3339())
            .bind(session.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(crate::error::DbError::from)?;
        Ok(())
    }

    async fn set_container_id(&self, session: &Session) -> Result<()> {
        sqlx::query("UPDATE sessions SET container_id = ?, updated_at = ? WHERE id = ?")
            .bind(&session.container_id)
            .bind(Utc::now().to_rfc3339())
            .bind(session.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(crate::error::DbError::from)?;
        Ok(())
    }

    async fn set_status(&self, session: &Session) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ?, updated_at = ?, stopped_at = ? WHERE id = ?")
            .bind(session.status.as_str())
            .bind(session.updated_at.to_rfc3339())
            .bind(session.stopped_at.map(|t| t.to_rfc3339()))
            .bind(session.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(crate::error::DbError::from)?;
        Ok(())
    }

    async fn mark_error(&self, session: &mut Session, message: String) -> Result<()> {
        session.status = SessionStatus::Error;
        session.error_message = Some(message.clone());
        session.updated_at = Utc::now();
        sqlx::query("UPDATE sessions SET status = ?, error_message = ?, updated_at = ? WHERE id = ?")
            .bind(session.status.as_str())
            .bind(&session.error_message)
            .bind(session.updated_at.to_rfc3339())
            .bind(session.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(crate::error::DbError::from)?;
        Ok(())
    }

    async fn record_execution(
        &self,
        session_id: SessionId,
        argv: &[String],
        exit_code: i32,
        stderr: &str,
        duration: Duration,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO executions (id, session_id, argv, exit_code, stderr, duration_ms, executed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(session_id.to_string())
        .bind(serde_json::to_string(argv).unwrap_or_default())
        .bind(exit_code)
        .bind(stderr)
        .bind(duration.as_millis() as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::from)?;
        Ok(())
    }
}

/// Expands a leading `~` to the session's workspace path — the closest
/// in-container "home" AgentBox controls (spec §4.1: "paths using `~` are
/// expanded at the workspace user's home").
fn expand_home(path: &str, workspace_path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        format!("{}/{}", workspace_path.trim_end_matches('/'), rest)
    } else {
        path.to_string()
    }
}

fn row_to_session(row: sqlx::sqlite::SqliteRow) -> Result<Session> {
    let id: String = row.try_get("id").map_err(crate::error::DbError::from)?;
    let agent_config_id: String = row.try_get("agent_config_id").map_err(crate::error::DbError::from)?;
    let status: String = row.try_get("status").map_err(crate::error::DbError::from)?;
    let env_snapshot: String = row.try_get("env_snapshot").map_err(crate::error::DbError::from)?;
    let resource_caps: String = row.try_get("resource_caps").map_err(crate::error::DbError::from)?;
    let created_at: String = row.try_get("created_at").map_err(crate::error::DbError::from)?;
    let updated_at: String = row.try_get("updated_at").map_err(crate::error::DbError::from)?;
    let stopped_at: Option<String> = row.try_get("stopped_at").map_err(crate::error::DbError::from)?;

    Ok(Session {
        id: id.parse().map_err(|_| SessionError::NotFound(id.clone()))?,
        agent_config_id: agent_config_id
            .parse()
            .map_err(|_| SessionError::NotFound(agent_config_id.clone()))?,
        agent_kind: row.try_get("agent_kind").map_err(crate::error::DbError::from)?,
        container_id: row.try_get("container_id").map_err(crate::error::DbError::from)?,
        status: SessionStatus::parse(&status),
        workspace_path: row.try_get("workspace_path").map_err(crate::error::DbError::from)?,
        env_snapshot: serde_json::from_str(&env_snapshot).unwrap_or_default(),
        resource_caps: serde_json::from_str(&resource_caps).unwrap_or_default(),
        error_message: row.try_get("error_message").map_err(crate::error::DbError::from)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| SessionError::NotFound(id.clone()))?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| SessionError::NotFound(id.clone()))?,
        stopped_at: stopped_at
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
            .transpose()
            .map_err(|_| SessionError::NotFound(id.clone()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterRegistry;
    use crate::agent_config::{ModelConfig, PermissionConfig, PermissionMode, Resources};
    use crate::container::noop::NoopEngine;

    fn config() -> AgentConfig {
        AgentConfig {
            id: uuid::Uuid::new_v4(),
            name: "echo".to_string(),
            adapter: "claude-code".to_string(),
            model_config: ModelConfig {
                name: "claude-sonnet".to_string(),
                provider: "anthropic".to_string(),
                base_url: None,
                bearer_token: Some("sk-ant-test".to_string()),
                reasoning_effort: None,
                tier_models: Default::default(),
                timeout_secs: 60,
                max_output_tokens: None,
            },
            permission_config: PermissionConfig {
                mode: PermissionMode::Full,
                sandbox_mode: "workspace-write".to_string(),
                allowed_tools: vec![],
                disallowed_tools: vec![],
                additional_dirs: vec![],
                skip_all: false,
                approval_policy: "never".to_string(),
            },
            resources: Resources {
                cpus: 1.0,
                memory_mb: 512,
                max_turns: 10,
                max_budget_usd: None,
                max_tokens: None,
                wall_timeout_secs: 60,
            },
            system_prompt: None,
            mcp_servers: vec![],
            output_schema: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_fails_fast_on_unknown_adapter() {
        let pool = crate::db::connect_in_memory().await;
        let engine: Arc<dyn ContainerEngineDyn> = Arc::new(NoopEngine::new());
        let adapters = Arc::new(AdapterRegistry::new());
        let manager = SessionManager::new(pool, engine, adapters, std::env::temp_dir());

        let mut cfg = config();
        cfg.adapter = "does-not-exist".to_string();

        let err = manager
            .create(CreateSessionRequest {
                agent_config: cfg,
                workspace_path: None,
                resource_caps: ResourceCaps::default(),
                network_mode: "none".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn create_marks_error_when_engine_refuses() {
        let pool = crate::db::connect_in_memory().await;
        let engine: Arc<dyn ContainerEngineDyn> = Arc::new(NoopEngine::new());
        let adapters = crate::adapters::global_registry();
        let manager = SessionManager::new(pool.clone(), engine, adapters, std::env::temp_dir());

        let err = manager
            .create(CreateSessionRequest {
                agent_config: config(),
                workspace_path: None,
                resource_caps: ResourceCaps::default(),
                network_mode: "none".to_string(),
            })
            .await;
        assert!(err.is_err());

        let row = sqlx::query("SELECT status FROM sessions")
            .fetch_one(&pool)
            .await
            .unwrap();
        let status: String = row.try_get("status").unwrap();
        assert_eq!(status, "error");
    }

    #[test]
    fn expand_home_substitutes_workspace() {
        assert_eq!(expand_home("~/.codex/config.toml", "/work/abc"), "/work/abc/.codex/config.toml");
        assert_eq!(expand_home("/etc/passwd", "/work/abc"), "/etc/passwd");
    }
}
