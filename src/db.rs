//! SQLite pool construction and schema migration.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

pub async fn connect(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

/// In-memory pool for tests — one connection, so the same `:memory:`
/// database is visible across the pool's lifetime.
#[cfg(test)]
pub async fn connect_in_memory() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite pool");
    migrate(&pool).await.expect("migrate in-memory pool");
    pool
}

async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(SCHEMA).execute(pool).await?;
    Ok(())
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    agent_config_id TEXT NOT NULL,
    prompt TEXT NOT NULL,
    attachments TEXT NOT NULL DEFAULT '[]',
    webhook_url TEXT,
    wall_timeout_secs INTEGER NOT NULL,
    status TEXT NOT NULL,
    session_id TEXT,
    thread_id TEXT,
    turn_count INTEGER NOT NULL DEFAULT 0,
    result TEXT,
    error_message TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    queued_at TEXT,
    started_at TEXT,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS turns (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL REFERENCES tasks(id),
    turn_number INTEGER NOT NULL,
    prompt TEXT NOT NULL,
    status TEXT NOT NULL,
    message TEXT,
    exit_code INTEGER,
    usage_input INTEGER NOT NULL DEFAULT 0,
    usage_cached_input INTEGER NOT NULL DEFAULT 0,
    usage_output INTEGER NOT NULL DEFAULT 0,
    events TEXT NOT NULL DEFAULT '[]',
    thread_id TEXT,
    error TEXT,
    started_at TEXT,
    ended_at TEXT,
    UNIQUE(task_id, turn_number)
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    agent_config_id TEXT NOT NULL,
    agent_kind TEXT NOT NULL,
    container_id TEXT,
    status TEXT NOT NULL,
    workspace_path TEXT NOT NULL,
    env_snapshot TEXT NOT NULL DEFAULT '{}',
    resource_caps TEXT NOT NULL DEFAULT '{}',
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    stopped_at TEXT
);

CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    argv TEXT NOT NULL,
    exit_code INTEGER,
    stderr TEXT,
    duration_ms INTEGER,
    executed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_configs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    adapter TEXT NOT NULL,
    model_config TEXT NOT NULL,
    permission_config TEXT NOT NULL,
    resources TEXT NOT NULL,
    system_prompt TEXT,
    mcp_servers TEXT NOT NULL DEFAULT '[]',
    output_schema TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batches (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    agent_config_id TEXT NOT NULL,
    status TEXT NOT NULL,
    max_concurrency INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batch_tasks (
    id TEXT PRIMARY KEY,
    batch_id TEXT NOT NULL REFERENCES batches(id),
    idx INTEGER NOT NULL,
    status TEXT NOT NULL,
    prompt TEXT NOT NULL,
    attempt INTEGER NOT NULL DEFAULT 0,
    worker_id TEXT,
    task_id TEXT,
    last_error TEXT,
    dead_reason TEXT,
    claimed_at TEXT,
    started_at TEXT,
    completed_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS webhooks (
    id TEXT PRIMARY KEY,
    agent_config_id TEXT,
    target_url TEXT NOT NULL,
    events TEXT NOT NULL DEFAULT '[]',
    secret_ciphertext BLOB,
    secret_nonce BLOB,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_attempt_at TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cron_jobs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    agent_config_id TEXT NOT NULL,
    expression TEXT NOT NULL,
    prompt TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    next_run_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cron_executions (
    id TEXT PRIMARY KEY,
    cron_job_id TEXT NOT NULL REFERENCES cron_jobs(id),
    task_id TEXT,
    status TEXT NOT NULL,
    error TEXT,
    executed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS channel_sessions (
    key TEXT PRIMARY KEY,
    channel TEXT NOT NULL,
    conversation_ref TEXT NOT NULL,
    agent_config_id TEXT NOT NULL,
    current_task_id TEXT,
    created_at TEXT NOT NULL,
    last_active_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_turns_task ON turns(task_id);
CREATE INDEX IF NOT EXISTS idx_batch_tasks_batch_status ON batch_tasks(batch_id, status);
CREATE INDEX IF NOT EXISTS idx_cron_jobs_enabled ON cron_jobs(enabled);
CREATE INDEX IF NOT EXISTS idx_sessions_agent_status ON sessions(agent_config_id, status);
"#;
