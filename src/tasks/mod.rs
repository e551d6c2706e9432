//! Task Manager (spec §4.6) — the execution core. Accepts, persists,
//! schedules and streams task execution, and maintains multi-turn
//! conversation state.
//!
//! Grounded directly on the teacher's `tasks/store.rs` (retry/claim
//! idioms carried into [`store`]) and `agent/worker.rs`'s
//! transition-guarded worker loop plus `acp/worker.rs`'s
//! cancellation-race-via-`select!` and at-most-once terminal event emission.

pub mod store;

use crate::adapters::{AdapterRegistry, ExecOptions, OutputChunk};
use crate::agent_config::AgentConfigStore;
use crate::error::{AdapterError, Result, TaskError};
use crate::session::{CreateSessionRequest, ResourceCaps, SessionManager};
use crate::{TaskEvent, TaskId};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use store::{NewTaskInput, Task, TaskStatus, TaskStore, Turn, TurnStatus};

const DEFAULT_WALL_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const READY_QUEUE_CAPACITY: usize = 1024;
const EVENT_BUS_CAPACITY: usize = 64;

/// Sink for terminal task/turn events (spec §4.8's Webhook Notifier
/// implements this). Kept as a narrow trait here so the Task Manager
/// never has to know about subscriptions, signing, or HTTP delivery.
pub trait WebhookSink: Send + Sync + 'static {
    fn notify(&self, event: &TaskEvent);
}

#[derive(Debug, Default)]
pub struct CreateTaskRequest {
    /// Set only on an append — loads the existing task instead of creating
    /// a new one. `agent_config_id` must be absent when this is set.
    pub task_id: Option<TaskId>,
    pub agent_config_id: Option<crate::AgentConfigId>,
    pub prompt: String,
    pub attachments: Vec<String>,
    pub webhook_url: Option<String>,
    pub wall_timeout: Option<Duration>,
    pub metadata: HashMap<String, serde_json::Value>,
}

pub struct TaskManager {
    store: Arc<TaskStore>,
    agent_configs: Arc<AgentConfigStore>,
    sessions: Arc<SessionManager>,
    adapters: Arc<AdapterRegistry>,
    ready_tx: mpsc::Sender<TaskId>,
    ready_rx: Arc<Mutex<mpsc::Receiver<TaskId>>>,
    events: Mutex<HashMap<TaskId, broadcast::Sender<TaskEvent>>>,
    cancellations: Mutex<HashMap<TaskId, CancellationToken>>,
    webhook_sink: RwLock<Option<Arc<dyn WebhookSink>>>,
    worker_count: usize,
    shutdown: CancellationToken,
    worker_handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl TaskManager {
    pub fn new(
        store: Arc<TaskStore>,
        agent_configs: Arc<AgentConfigStore>,
        sessions: Arc<SessionManager>,
        adapters: Arc<AdapterRegistry>,
        worker_count: usize,
    ) -> Arc<Self> {
        let (ready_tx, ready_rx) = mpsc::channel(READY_QUEUE_CAPACITY);
        Arc::new(Self {
            store,
            agent_configs,
            sessions,
            adapters,
            ready_tx,
            ready_rx: Arc::new(Mutex::new(ready_rx)),
            events: Mutex::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
            webhook_sink: RwLock::new(None),
            worker_count,
            shutdown: CancellationToken::new(),
            worker_handles: StdMutex::new(Vec::new()),
        })
    }

    pub async fn set_webhook_notifier(&self, sink: Arc<dyn WebhookSink>) {
        *self.webhook_sink.write().await = Some(sink);
    }

    pub async fn create_task(&self, req: CreateTaskRequest) -> Result<Task> {
        if let Some(task_id) = req.task_id {
            if req.agent_config_id.is_some() {
                return Err(TaskError::BadRequest("agent_config_id must be absent on append".to_string()).into());
            }
            let task = self.store.append_turn(task_id, req.prompt).await?;
            self.enqueue(task.id).await;
            return Ok(task);
        }

        let agent_config_id = req
            .agent_config_id
            .ok_or_else(|| TaskError::BadRequest("agent_config_id is required for a new task".to_string()))?;

        let task = self
            .store
            .create(NewTaskInput {
                agent_config_id,
                prompt: req.prompt,
                attachments: req.attachments,
                webhook_url: req.webhook_url,
                wall_timeout: req.wall_timeout.unwrap_or(DEFAULT_WALL_TIMEOUT),
                metadata: req.metadata,
            })
            .await?;

        self.publish(TaskEvent::Created { task_id: task.id }).await;
        self.enqueue(task.id).await;
        Ok(task)
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        self.store.get(id).await
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>, limit: u32) -> Result<Vec<Task>> {
        self.store.list(status, limit).await
    }

    pub async fn cancel_task(&self, id: TaskId) -> Result<()> {
        if self.store.cancel_if_queued(id).await? {
            self.publish(TaskEvent::Cancelled { task_id: id }).await;
            return Ok(());
        }

        if let Some(token) = self.cancellations.lock().await.get(&id) {
            token.cancel();
        }
        Ok(())
    }

    pub async fn subscribe(&self, id: TaskId) -> broadcast::Receiver<TaskEvent> {
        let mut events = self.events.lock().await;
        events
            .entry(id)
            .or_insert_with(|| broadcast::channel(EVENT_BUS_CAPACITY).0)
            .subscribe()
    }

    /// Receivers unsubscribe simply by being dropped; this exists so
    /// callers that model subscribe/unsubscribe as a pair have an explicit
    /// call site.
    pub fn unsubscribe(&self, _id: TaskId, _receiver: broadcast::Receiver<TaskEvent>) {}

    async fn enqueue(&self, id: TaskId) {
        if self.ready_tx.send(id).await.is_err() {
            tracing::error!(task_id = %id, "tasks: ready queue closed, task will not run until restart");
        }
    }

    async fn publish(&self, event: TaskEvent) {
        let task_id = event.task_id();
        {
            let events = self.events.lock().await;
            if let Some(tx) = events.get(&task_id) {
                let _ = tx.send(event.clone());
            }
        }
        if event.is_webhook_worthy() {
            if let Some(sink) = self.webhook_sink.read().await.as_ref() {
                sink.notify(&event);
            }
        }
    }

    /// Restart recovery (spec §4.6): tasks left `running` are reset to
    /// `queued` and re-enqueued.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let ids = self.store.reset_running_to_queued().await?;
        for id in &ids {
            self.enqueue(*id).await;
        }
        Ok(ids.len())
    }

    /// Spawns the fixed-size worker pool. Each worker pops from the shared
    /// ready-queue; dropping the manager (and its `ready_tx`) drains workers
    /// cleanly once the channel empties and closes, and [`stop`] drains them
    /// deliberately on shutdown.
    pub fn spawn_workers(self: &Arc<Self>) {
        let mut handles = self.worker_handles.lock().unwrap();
        for worker_id in 0..self.worker_count {
            let manager = self.clone();
            handles.push(tokio::spawn(async move {
                manager.worker_loop(worker_id).await;
            }));
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            let task_id = {
                let mut rx = self.ready_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => None,
                    id = rx.recv() => id,
                }
            };
            let Some(task_id) = task_id else {
                tracing::info!(worker_id, "tasks: worker exiting");
                return;
            };

            if let Err(err) = self.run_one(task_id).await {
                tracing::error!(worker_id, task_id = %task_id, error = %err, "tasks: worker failed to process task");
            }
        }
    }

    /// Graceful shutdown (spec §5): stop taking new work, cancel every
    /// in-flight turn (the worker still writes its terminal state and
    /// emits the cancellation event, same as an explicit `cancel_task`),
    /// then await the worker pool.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        {
            let cancellations = self.cancellations.lock().await;
            for token in cancellations.values() {
                token.cancel();
            }
        }
        let handles = std::mem::take(&mut *self.worker_handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn run_one(&self, task_id: TaskId) -> Result<()> {
        // Step 2: reload; skip if cancelled.
        let task = self.store.get(task_id).await?;
        if task.status == TaskStatus::Cancelled {
            return Ok(());
        }

        let turn_number = task.turn_count;
        let token = CancellationToken::new();
        self.cancellations.lock().await.insert(task_id, token.clone());

        let outcome = self.execute_turn(&task, turn_number, &token).await;

        self.cancellations.lock().await.remove(&task_id);
        outcome
    }

    async fn execute_turn(&self, task: &Task, turn_number: u32, token: &CancellationToken) -> Result<()> {
        let task_id = task.id;

        // Step 3: transition to running, emit started.
        self.store.mark_running(task_id).await?;
        self.store.mark_turn_started(task_id, turn_number).await?;

        // Step 4: look up AgentConfig; fail fast if missing.
        let agent_config = match self.agent_configs.get(task.agent_config_id).await {
            Ok(cfg) => cfg,
            Err(_) => {
                self.fail_task(task_id, "agent not found".to_string()).await?;
                return Ok(());
            }
        };

        let adapter = match self.adapters.get(&agent_config.adapter) {
            Ok(adapter) => adapter,
            Err(err) => {
                self.fail_task(task_id, err.to_string()).await?;
                return Ok(());
            }
        };

        // Step 5: acquire or create a compatible session.
        let reusable = match task.session_id {
            Some(existing) => matches!(
                self.sessions.get(existing).await,
                Ok(session) if session.status == crate::session::SessionStatus::Running
            ),
            None => false,
        };

        let session_id = if reusable {
            task.session_id.expect("reusable implies session_id is set")
        } else {
            match self.create_session_for(task, &agent_config).await {
                Ok(id) => id,
                Err(err) => {
                    self.fail_task(task_id, format!("session create failed: {err}")).await?;
                    return Ok(());
                }
            }
        };

        self.publish(TaskEvent::Started {
            task_id,
            turn_id: task.turns.last().map(|t| t.id).unwrap_or_default(),
            session_id,
        })
        .await;

        // Step 6: build exec options.
        let exec_options = ExecOptions {
            prompt: task.turns.last().map(|t| t.prompt.clone()).unwrap_or_else(|| task.prompt.clone()),
            thread_id: task.thread_id.clone(),
            max_turns: None,
            allowed_tools: agent_config.permission_config.allowed_tools.clone(),
            disallowed_tools: agent_config.permission_config.disallowed_tools.clone(),
            wall_timeout: task.wall_timeout,
        };

        // Step 7: assemble argv.
        let argv = match adapter.prepare_exec(&exec_options, &agent_config).await {
            Ok(argv) => argv,
            Err(err) => {
                self.fail_task(task_id, err.to_string()).await?;
                return Ok(());
            }
        };

        // Step 8: drain stdout under the wall-timeout, cancel on timeout or
        // cooperative cancellation.
        let raw_output = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.cancel_turn(task_id, turn_number).await?;
                return Ok(());
            }
            result = tokio::time::timeout(task.wall_timeout, self.drain_exec(session_id, argv)) => {
                match result {
                    Ok(Ok(output)) => output,
                    Ok(Err(err)) => {
                        self.fail_task(task_id, err.to_string()).await?;
                        return Ok(());
                    }
                    Err(_) => {
                        self.fail_task(task_id, format!("turn exceeded wall timeout of {:?}", task.wall_timeout)).await?;
                        return Ok(());
                    }
                }
            }
        };

        let parsed = adapter.parse_output(&raw_output, false);

        // Step 9: thread-id is sticky.
        if let Some(thread_id) = &parsed.thread_id {
            self.store.set_thread_id(task_id, thread_id).await?;
        }

        // Step 10: write the turn result, transition terminal.
        let ended_at = chrono::Utc::now();
        let turn_failed = parsed.exit_code != 0 || parsed.error.is_some();
        let turn_status = if turn_failed { TurnStatus::Failed } else { TurnStatus::Completed };
        self.store.write_turn_result(task_id, turn_number, &parsed, turn_status, ended_at).await?;

        let turn_id = task.turns.last().map(|t| t.id).unwrap_or_default();

        // Terminal events fire once per turn (spec.md §4.6): an appended
        // turn (turn_number > 1) gets its own `task.turn.*` event on top of
        // the task-level one; turn 1 just emits the task-level event.
        if turn_failed {
            let message = parsed.error.clone().unwrap_or_else(|| format!("adapter exited with code {}", parsed.exit_code));
            self.store.finish_task(task_id, TaskStatus::Failed, Some(message.clone())).await?;
            if turn_number > 1 {
                self.publish(TaskEvent::TurnFailed { task_id, turn_id, error: message.clone() }).await;
            }
            self.publish(TaskEvent::Failed { task_id, turn_id, error: message }).await;
        } else {
            self.store.finish_task(task_id, TaskStatus::Completed, None).await?;
            if turn_number > 1 {
                self.publish(TaskEvent::TurnCompleted { task_id, turn_id }).await;
            }
            self.publish(TaskEvent::Completed { task_id, turn_id }).await;
        }

        Ok(())
    }

    async fn drain_exec(&self, session_id: crate::SessionId, argv: Vec<String>) -> Result<String> {
        let mut stream = self.sessions.exec_stream(session_id, argv).await?;
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(OutputChunk::Stdout(bytes)) => buf.extend_from_slice(&bytes),
                Ok(OutputChunk::Stderr(_)) => {}
                Err(err) => return Err(AdapterError::Runtime(err.to_string()).into()),
            }
        }
        Ok(String::from_utf8_lossy(&buf).to_string())
    }

    async fn create_session_for(&self, task: &Task, agent_config: &crate::agent_config::AgentConfig) -> Result<crate::SessionId> {
        let session = self
            .sessions
            .create(CreateSessionRequest {
                agent_config: agent_config.clone(),
                workspace_path: None,
                resource_caps: ResourceCaps {
                    cpus: Some(agent_config.resources.cpus),
                    memory_mb: Some(agent_config.resources.memory_mb),
                },
                network_mode: "none".to_string(),
            })
            .await?;
        self.store.set_session_id(task.id, session.id).await?;
        Ok(session.id)
    }

    async fn fail_task(&self, task_id: TaskId, message: String) -> Result<()> {
        self.store.finish_task(task_id, TaskStatus::Failed, Some(message.clone())).await?;
        let turn_id = self.store.get(task_id).await.ok().and_then(|t| t.turns.last().map(|t| t.id)).unwrap_or_default();
        self.publish(TaskEvent::Failed { task_id, turn_id, error: message }).await;
        Ok(())
    }

    async fn cancel_turn(&self, task_id: TaskId, turn_number: u32) -> Result<()> {
        let ended_at = chrono::Utc::now();
        let empty = crate::adapters::ParsedOutput {
            error: Some("cancelled".to_string()),
            ..Default::default()
        };
        self.store.write_turn_result(task_id, turn_number, &empty, TurnStatus::Cancelled, ended_at).await?;
        self.store.finish_task(task_id, TaskStatus::Cancelled, Some("cancelled".to_string())).await?;
        self.publish(TaskEvent::Cancelled { task_id }).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterRegistry;
    use crate::agent_config::{AgentConfigStore, CreateAgentConfigInput, ModelConfig, PermissionConfig, PermissionMode, Resources};
    use crate::container::noop::NoopEngine;
    use crate::session::SessionManager;

    async fn manager() -> Arc<TaskManager> {
        let pool = crate::db::connect_in_memory().await;
        let task_store = Arc::new(TaskStore::new(pool.clone()));
        let agent_configs = Arc::new(AgentConfigStore::new(pool.clone()));
        let engine: Arc<dyn crate::container::ContainerEngineDyn> = Arc::new(NoopEngine::new());
        let adapters = crate::adapters::global_registry();
        let sessions = Arc::new(SessionManager::new(pool, engine, adapters.clone(), std::env::temp_dir()));
        TaskManager::new(task_store, agent_configs, sessions, adapters, 2)
    }

    async fn sample_agent_config(tm: &Arc<TaskManager>) -> crate::AgentConfigId {
        let cfg = tm
            .agent_configs
            .create(CreateAgentConfigInput {
                name: format!("echo-{}", uuid::Uuid::new_v4()),
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
        cfg.id
    }

    #[tokio::test]
    async fn create_task_requires_agent_config_on_new_task() {
        let tm = manager().await;
        let err = tm
            .create_task(CreateTaskRequest {
                prompt: "hi".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn create_task_rejects_agent_config_on_append() {
        let tm = manager().await;
        let agent_config_id = sample_agent_config(&tm).await;
        let created = tm
            .create_task(CreateTaskRequest {
                agent_config_id: Some(agent_config_id),
                prompt: "hi".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let err = tm
            .create_task(CreateTaskRequest {
                task_id: Some(created.id),
                agent_config_id: Some(agent_config_id),
                prompt: "again".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn new_task_is_queued_and_enqueued() {
        let tm = manager().await;
        let agent_config_id = sample_agent_config(&tm).await;
        let task = tm
            .create_task(CreateTaskRequest {
                agent_config_id: Some(agent_config_id),
                prompt: "hi".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn cancel_queued_task_transitions_immediately() {
        let tm = manager().await;
        let agent_config_id = sample_agent_config(&tm).await;
        let task = tm
            .create_task(CreateTaskRequest {
                agent_config_id: Some(agent_config_id),
                prompt: "hi".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        tm.cancel_task(task.id).await.unwrap();
        let reloaded = tm.get_task(task.id).await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::Cancelled);
    }
}
