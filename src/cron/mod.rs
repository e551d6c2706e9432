//! Cron Scheduler (spec §4.9). A single poll loop sweeps every enabled
//! entry whose `next_run_at` has arrived, fires one task per due entry,
//! and recomputes `next_run_at` from "now" — so a restart after downtime
//! fires each job at most once rather than replaying every missed tick.
//!
//! The overlap guard is adapted from the teacher's `ExecutionGuard`
//! (`cron/scheduler.rs`): an RAII handle that clears an in-flight marker
//! on drop, so a job whose invocation outlives one poll tick isn't fired
//! again while still running.

pub mod store;

use crate::tasks::{CreateTaskRequest, TaskManager};
use crate::CronJobId;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub use store::{CronEntry, CronStore, NewCronEntryInput};

/// Clears `job_id` from `inflight` when dropped, whether the firing
/// completed, failed, or was cancelled by shutdown.
struct ExecutionGuard {
    inflight: Arc<Mutex<HashSet<CronJobId>>>,
    job_id: CronJobId,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.inflight.lock().unwrap().remove(&self.job_id);
    }
}

pub struct CronScheduler {
    store: Arc<CronStore>,
    tasks: Arc<TaskManager>,
    poll_interval: Duration,
    inflight: Arc<Mutex<HashSet<CronJobId>>>,
    shutdown: CancellationToken,
    stopped: Notify,
}

impl CronScheduler {
    pub fn new(store: Arc<CronStore>, tasks: Arc<TaskManager>, poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            tasks,
            poll_interval,
            inflight: Arc::new(Mutex::new(HashSet::new())),
            shutdown: CancellationToken::new(),
            stopped: Notify::new(),
        })
    }

    pub async fn create(&self, input: NewCronEntryInput) -> crate::error::Result<CronEntry> {
        self.store.create(input).await
    }

    pub async fn get(&self, id: CronJobId) -> crate::error::Result<CronEntry> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> crate::error::Result<Vec<CronEntry>> {
        self.store.list().await
    }

    pub async fn set_enabled(&self, id: CronJobId, enabled: bool) -> crate::error::Result<()> {
        self.store.set_enabled(id, enabled).await
    }

    pub async fn delete(&self, id: CronJobId) -> crate::error::Result<()> {
        self.store.delete(id).await
    }

    /// Fires an entry immediately, outside its regular schedule, without
    /// disturbing `next_run_at`. Used by the manual "run now" endpoint.
    pub async fn trigger_now(self: &Arc<Self>, id: CronJobId) -> crate::error::Result<()> {
        let entry = self.store.get(id).await?;
        self.clone().fire(entry, Utc::now()).await;
        Ok(())
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let now = Utc::now();
            let due = match self.store.due(now).await {
                Ok(due) => due,
                Err(err) => {
                    tracing::error!(error = %err, "cron: failed to load due entries");
                    continue;
                }
            };

            for entry in due {
                let id = entry.id;
                let already_running = {
                    let mut inflight = self.inflight.lock().unwrap();
                    !inflight.insert(id)
                };
                if already_running {
                    tracing::warn!(cron_job_id = %id, "cron: previous firing still running, skipping this tick");
                    continue;
                }

                let scheduler = self.clone();
                tokio::spawn(async move { scheduler.fire(entry, now).await });
            }
        }

        self.stopped.notify_waiters();
    }

    async fn fire(self: Arc<Self>, entry: CronEntry, now: chrono::DateTime<Utc>) {
        let _guard = ExecutionGuard { inflight: self.inflight.clone(), job_id: entry.id };

        let result = self
            .tasks
            .create_task(CreateTaskRequest {
                agent_config_id: Some(entry.agent_config_id),
                prompt: entry.prompt.clone(),
                ..Default::default()
            })
            .await;

        let log_result = match &result {
            Ok(task) => self.store.log_execution(entry.id, Some(task.id), "dispatched", None).await,
            Err(err) => self.store.log_execution(entry.id, None, "error", Some(&err.to_string())).await,
        };
        if let Err(err) = log_result {
            tracing::error!(cron_job_id = %entry.id, error = %err, "cron: failed to write execution log");
        }
        if let Err(err) = &result {
            tracing::error!(cron_job_id = %entry.id, error = %err, "cron: failed to dispatch task");
        }

        if let Err(err) = self.store.advance(entry.id, now).await {
            tracing::error!(cron_job_id = %entry.id, error = %err, "cron: failed to advance next_run_at");
        }
    }

    /// Requests the poll loop to stop and waits for its current iteration
    /// to finish. In-flight firings are not awaited; they run to completion
    /// independently of the loop.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.stopped.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_config::{AgentConfigStore, CreateAgentConfigInput, ModelConfig, PermissionConfig, PermissionMode, Resources};
    use crate::container::noop::NoopEngine;
    use crate::session::SessionManager;
    use crate::tasks::TaskStore;
    use crate::AgentConfigId;

    async fn scheduler() -> (Arc<CronScheduler>, AgentConfigId) {
        let pool = crate::db::connect_in_memory().await;
        let task_store = Arc::new(TaskStore::new(pool.clone()));
        let agent_configs = Arc::new(AgentConfigStore::new(pool.clone()));
        let engine: Arc<dyn crate::container::ContainerEngineDyn> = Arc::new(NoopEngine::new());
        let adapters = crate::adapters::global_registry();
        let sessions = Arc::new(SessionManager::new(pool.clone(), engine, adapters.clone(), std::env::temp_dir()));
        let tasks = TaskManager::new(task_store, agent_configs.clone(), sessions, adapters, 2);

        let cfg = agent_configs
            .create(CreateAgentConfigInput {
                name: format!("cron-agent-{}", uuid::Uuid::new_v4()),
                adapter: "claude-code".to_string(),
                model_config: ModelConfig {
                    name: "claude-sonnet".to_string(),
                    provider: "anthropic".to_string(),
                    base_url: None,
                    bearer_token: Some("sk-test".to_string()),
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
                    max_turns: 5,
                    max_budget_usd: None,
                    max_tokens: None,
                    wall_timeout_secs: 5,
                },
                system_prompt: None,
                mcp_servers: vec![],
                output_schema: None,
            })
            .await
            .unwrap();

        let cron_store = Arc::new(CronStore::new(pool));
        (CronScheduler::new(cron_store, tasks, Duration::from_secs(30)), cfg.id)
    }

    #[tokio::test]
    async fn trigger_now_dispatches_a_task_without_touching_next_run_at() {
        let (scheduler, agent_id) = scheduler().await;
        let entry = scheduler
            .create(NewCronEntryInput {
                name: "hourly".to_string(),
                agent_config_id: agent_id,
                expression: "0 0 * * * * *".to_string(),
                prompt: "run report".to_string(),
            })
            .await
            .unwrap();
        let before = entry.next_run_at;

        scheduler.trigger_now(entry.id).await.unwrap();

        let reloaded = scheduler.get(entry.id).await.unwrap();
        assert_eq!(reloaded.next_run_at, before);
    }

    #[tokio::test]
    async fn disabled_entries_are_never_due() {
        let (scheduler, agent_id) = scheduler().await;
        let entry = scheduler
            .create(NewCronEntryInput {
                name: "every second".to_string(),
                agent_config_id: agent_id,
                expression: "* * * * * * *".to_string(),
                prompt: "tick".to_string(),
            })
            .await
            .unwrap();
        scheduler.set_enabled(entry.id, false).await.unwrap();

        let due = scheduler.store.due(Utc::now() + chrono::Duration::days(1)).await.unwrap();
        assert!(due.is_empty());
    }
}
