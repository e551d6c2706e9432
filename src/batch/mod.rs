//! Batch Scheduler (spec §4.7). Fans a template + input list out into N
//! child Tasks, run by a fixed worker pool bound to the batch, with
//! atomic claim, retry/dead-letter bookkeeping and CAS-to-terminal.
//!
//! Grounded on the same worker-pool shape as [`crate::tasks`]; the claim
//! step is the one new idiom (a `SELECT ... WHERE status = 'pending'`
//! guarded `UPDATE` inside a transaction, rather than an mpsc queue,
//! since batch work is discovered by querying rather than pushed).

pub mod store;

use crate::error::Result;
use crate::tasks::{CreateTaskRequest, TaskManager, TaskStatus as ChildTaskStatus};
use crate::{AgentConfigId, BatchEvent, BatchId, TaskId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use store::{Batch, BatchCounts, BatchStatus, BatchStore, BatchTask, BatchTaskStatus, NewBatchInput};

const EVENT_BUS_CAPACITY: usize = 64;
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(200);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct CreateBatchRequest {
    pub name: String,
    pub agent_config_id: AgentConfigId,
    /// Prompt template; `{{input}}` is substituted with each element of
    /// `inputs` to produce one child task per input.
    pub template: String,
    pub inputs: Vec<String>,
    pub concurrency: u32,
    pub max_retries: u32,
}

/// Per-batch pause/cancel flags, checked by every worker between claims.
struct BatchControl {
    paused: AtomicBool,
    cancelled: AtomicBool,
}

impl BatchControl {
    fn new() -> Self {
        Self { paused: AtomicBool::new(false), cancelled: AtomicBool::new(false) }
    }
}

pub struct BatchScheduler {
    store: Arc<BatchStore>,
    tasks: Arc<TaskManager>,
    events: Mutex<HashMap<BatchId, broadcast::Sender<BatchEvent>>>,
    controls: Mutex<HashMap<BatchId, Arc<BatchControl>>>,
    shutdown: CancellationToken,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl BatchScheduler {
    pub fn new(store: Arc<BatchStore>, tasks: Arc<TaskManager>) -> Arc<Self> {
        Arc::new(Self {
            store,
            tasks,
            events: Mutex::new(HashMap::new()),
            controls: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            handles: StdMutex::new(Vec::new()),
        })
    }

    /// Graceful shutdown (spec §5): stop every worker/progress-ticker loop
    /// once it next checks in (in-flight child tasks are cancelled by the
    /// Task Manager's own `stop`, which runs first), then await them.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub async fn create_batch(self: &Arc<Self>, req: CreateBatchRequest) -> Result<Batch> {
        let prompts = req.inputs.iter().map(|input| req.template.replace("{{input}}", input)).collect();

        let batch = self
            .store
            .create(NewBatchInput {
                name: req.name,
                agent_config_id: req.agent_config_id,
                prompts,
                max_concurrency: req.concurrency,
                max_retries: req.max_retries,
            })
            .await?;

        self.publish(BatchEvent::Created { batch_id: batch.id }).await;
        self.spawn_workers(batch.id, req.concurrency).await;
        self.spawn_progress_ticker(batch.id);
        Ok(batch)
    }

    pub async fn get_batch(&self, id: BatchId) -> Result<Batch> {
        self.store.get(id).await
    }

    pub async fn list_batches(&self, limit: u32) -> Result<Vec<Batch>> {
        self.store.list(limit).await
    }

    pub async fn list_batch_tasks(&self, id: BatchId) -> Result<Vec<BatchTask>> {
        self.store.list_tasks(id).await
    }

    pub async fn subscribe(&self, id: BatchId) -> broadcast::Receiver<BatchEvent> {
        let mut events = self.events.lock().await;
        events.entry(id).or_insert_with(|| broadcast::channel(EVENT_BUS_CAPACITY).0).subscribe()
    }

    pub async fn pause(&self, id: BatchId) -> Result<()> {
        if let Some(control) = self.controls.lock().await.get(&id) {
            control.paused.store(true, Ordering::SeqCst);
        }
        self.store.set_status(id, BatchStatus::Paused).await?;
        self.publish(BatchEvent::Paused { batch_id: id }).await;
        Ok(())
    }

    pub async fn resume(self: &Arc<Self>, id: BatchId) -> Result<()> {
        self.store.set_status(id, BatchStatus::Running).await?;
        match self.controls.lock().await.get(&id) {
            Some(control) => control.paused.store(false, Ordering::SeqCst),
            None => {
                // Workers exited (batch had already gone terminal); respawn
                // with the batch's original concurrency.
                let batch = self.store.get(id).await?;
                self.spawn_workers(id, batch.max_concurrency).await;
                self.spawn_progress_ticker(id);
            }
        }
        self.publish(BatchEvent::Resumed { batch_id: id }).await;
        Ok(())
    }

    pub async fn cancel(&self, id: BatchId) -> Result<()> {
        if let Some(control) = self.controls.lock().await.get(&id) {
            control.cancelled.store(true, Ordering::SeqCst);
        }
        let running = self.store.cancel_pending_and_list_running(id).await?;
        for task_id in running {
            let _ = self.tasks.cancel_task(task_id).await;
        }
        self.store.set_status(id, BatchStatus::Cancelled).await?;
        self.publish(BatchEvent::Cancelled { batch_id: id }).await;
        Ok(())
    }

    /// Resets every `dead` task to `pending` with a fresh retry budget and
    /// resumes the batch (respawning workers if it had already finished).
    pub async fn retry_dead(self: &Arc<Self>, id: BatchId) -> Result<u64> {
        let reset = self.store.retry_dead(id).await?;
        if reset > 0 {
            self.resume(id).await?;
        }
        Ok(reset)
    }

    /// Restart recovery: orphaned `running` batch-tasks (their worker died
    /// with the process) go back to `pending`; every non-terminal batch
    /// gets its workers and progress ticker respawned.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let affected = self.store.reset_running().await?;
        let mut recovered = 0;
        for batch_id in affected {
            let batch = self.store.get(batch_id).await?;
            if batch.status.is_terminal() {
                continue;
            }
            self.spawn_workers(batch_id, batch.max_concurrency).await;
            self.spawn_progress_ticker(batch_id);
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn publish(&self, event: BatchEvent) {
        let events = self.events.lock().await;
        if let Some(tx) = events.get(&event.batch_id()) {
            let _ = tx.send(event);
        }
    }

    async fn spawn_workers(self: &Arc<Self>, batch_id: BatchId, concurrency: u32) {
        let control = Arc::new(BatchControl::new());
        self.controls.lock().await.insert(batch_id, control.clone());

        for worker_id in 0..concurrency.max(1) {
            let scheduler = self.clone();
            let control = control.clone();
            let worker_id = format!("w{worker_id}");
            let handle = tokio::spawn(async move {
                scheduler.worker_loop(batch_id, worker_id, control).await;
            });
            self.handles.lock().unwrap().push(handle);
        }
    }

    fn spawn_progress_ticker(self: &Arc<Self>, batch_id: BatchId) {
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            scheduler.progress_loop(batch_id).await;
        });
        self.handles.lock().unwrap().push(handle);
    }

    async fn progress_loop(self: Arc<Self>, batch_id: BatchId) {
        let started = std::time::Instant::now();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(PROGRESS_INTERVAL) => {}
            }
            let Ok(batch) = self.store.get(batch_id).await else { return };
            let Ok(counts) = self.store.counts(batch_id).await else { return };

            let total = counts.total();
            let settled = counts.settled();
            let elapsed = started.elapsed().as_secs_f64().max(1.0);
            let tasks_per_sec = settled as f64 / elapsed;
            let remaining = total.saturating_sub(settled);
            let eta_secs = if tasks_per_sec > 0.0 { Some((remaining as f64 / tasks_per_sec) as u64) } else { None };
            let percent = if total > 0 { settled as f64 / total as f64 * 100.0 } else { 0.0 };

            self.publish(BatchEvent::Progress {
                batch_id,
                completed: counts.completed,
                failed: counts.failed,
                dead: counts.dead,
                total,
                percent,
                eta_secs,
                tasks_per_sec,
            })
            .await;

            if batch.status.is_terminal() {
                return;
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, batch_id: BatchId, worker_id: String, control: Arc<BatchControl>) {
        loop {
            if self.shutdown.is_cancelled() || control.cancelled.load(Ordering::SeqCst) {
                return;
            }
            if control.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(CLAIM_POLL_INTERVAL).await;
                continue;
            }

            let claimed = match self.store.claim_one(batch_id, &worker_id).await {
                Ok(claimed) => claimed,
                Err(err) => {
                    tracing::error!(batch_id = %batch_id, error = %err, "batch: claim failed");
                    tokio::time::sleep(CLAIM_POLL_INTERVAL).await;
                    continue;
                }
            };

            let Some(batch_task) = claimed else {
                match self.store.try_finish(batch_id).await {
                    Ok(Some(_terminal)) => {
                        // `completed` vs `failed` vs `cancelled` is the
                        // batch's persisted status; the event just signals
                        // "no more work", so subscribers check `get_batch`
                        // for the final status and per-status counts.
                        self.publish(BatchEvent::Completed { batch_id }).await;
                        return;
                    }
                    Ok(None) => {
                        if self.store.get(batch_id).await.map(|b| b.status.is_terminal()).unwrap_or(true) {
                            return;
                        }
                        tokio::time::sleep(CLAIM_POLL_INTERVAL).await;
                        continue;
                    }
                    Err(err) => {
                        tracing::error!(batch_id = %batch_id, error = %err, "batch: try_finish failed");
                        tokio::time::sleep(CLAIM_POLL_INTERVAL).await;
                        continue;
                    }
                }
            };

            if let Err(err) = self.run_one(batch_id, batch_task).await {
                tracing::error!(batch_id = %batch_id, worker_id = %worker_id, error = %err, "batch: worker failed to process task");
            }
        }
    }

    async fn run_one(&self, batch_id: BatchId, batch_task: BatchTask) -> Result<()> {
        self.publish(BatchEvent::TaskClaimed { batch_id, batch_task_id: batch_task.id }).await;

        let batch = self.store.get(batch_id).await?;
        let task = self
            .tasks
            .create_task(CreateTaskRequest {
                agent_config_id: Some(batch.agent_config_id),
                prompt: batch_task.prompt.clone(),
                ..Default::default()
            })
            .await?;
        self.store.set_task_id(batch_task.id, task.id).await?;

        let (status, error) = self.await_task_terminal(task.id).await;

        match status {
            ChildTaskStatus::Completed => {
                self.store.mark_completed(batch_task.id, task.id).await?;
                self.publish(BatchEvent::TaskCompleted { batch_id, batch_task_id: batch_task.id }).await;
            }
            _ => {
                let message = error.unwrap_or_else(|| "task did not complete".to_string());
                let outcome = self
                    .store
                    .mark_failed(batch_task.id, Some(task.id), &message, batch.max_retries, is_retryable(&message))
                    .await?;
                let event = if outcome == BatchTaskStatus::Dead {
                    BatchEvent::TaskDeadLettered { batch_id, batch_task_id: batch_task.id }
                } else {
                    BatchEvent::TaskFailed { batch_id, batch_task_id: batch_task.id, error: message }
                };
                self.publish(event).await;
            }
        }
        Ok(())
    }

    /// Waits for a child task to reach a terminal status. Subscribes first,
    /// then checks current status to close the race where the task
    /// finished between creation and subscription.
    async fn await_task_terminal(&self, task_id: TaskId) -> (ChildTaskStatus, Option<String>) {
        let mut rx = self.tasks.subscribe(task_id).await;

        if let Ok(task) = self.tasks.get_task(task_id).await {
            if is_terminal(task.status) {
                return (task.status, task.error_message);
            }
        }

        loop {
            match rx.recv().await {
                Ok(crate::TaskEvent::Completed { .. }) => return (ChildTaskStatus::Completed, None),
                Ok(crate::TaskEvent::Failed { error, .. }) => return (ChildTaskStatus::Failed, Some(error)),
                Ok(crate::TaskEvent::Cancelled { .. }) => return (ChildTaskStatus::Cancelled, Some("cancelled".to_string())),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    if let Ok(task) = self.tasks.get_task(task_id).await {
                        if is_terminal(task.status) {
                            return (task.status, task.error_message);
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

fn is_terminal(status: ChildTaskStatus) -> bool {
    matches!(status, ChildTaskStatus::Completed | ChildTaskStatus::Failed | ChildTaskStatus::Cancelled)
}

/// A missing agent config fails identically on every attempt, so retrying
/// it just burns the batch's retry budget for no chance of success; every
/// other failure (exec, parse, timeout, adapter) is assumed transient and
/// goes through the normal retry-then-dead-letter path.
fn is_retryable(error: &str) -> bool {
    error != "agent not found"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterRegistry;
    use crate::agent_config::{AgentConfigStore, CreateAgentConfigInput, ModelConfig, PermissionConfig, PermissionMode, Resources};
    use crate::container::noop::NoopEngine;
    use crate::session::SessionManager;

    async fn scheduler() -> (Arc<BatchScheduler>, AgentConfigId) {
        let pool = crate::db::connect_in_memory().await;
        let batch_store = Arc::new(BatchStore::new(pool.clone()));
        let task_store = Arc::new(crate::tasks::TaskStore::new(pool.clone()));
        let agent_configs = Arc::new(AgentConfigStore::new(pool.clone()));
        let engine: Arc<dyn crate::container::ContainerEngineDyn> = Arc::new(NoopEngine::new());
        let adapters = crate::adapters::global_registry();
        let sessions = Arc::new(SessionManager::new(pool, engine, adapters.clone(), std::env::temp_dir()));
        let tasks = crate::tasks::TaskManager::new(task_store, agent_configs.clone(), sessions, adapters, 2);

        let cfg = agent_configs
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

        (BatchScheduler::new(batch_store, tasks), cfg.id)
    }

    #[tokio::test]
    async fn create_batch_inserts_one_task_per_input() {
        let (scheduler, agent_config_id) = scheduler().await;
        let batch = scheduler
            .create_batch(CreateBatchRequest {
                name: "greeting".to_string(),
                agent_config_id,
                template: "say hi to {{input}}".to_string(),
                inputs: vec!["alice".to_string(), "bob".to_string()],
                concurrency: 2,
                max_retries: 2,
            })
            .await
            .unwrap();

        let tasks = scheduler.list_batch_tasks(batch.id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().any(|t| t.prompt == "say hi to alice"));
        assert!(tasks.iter().any(|t| t.prompt == "say hi to bob"));
    }

    #[tokio::test]
    async fn cancel_flips_status_and_stops_workers() {
        let (scheduler, agent_config_id) = scheduler().await;
        let batch = scheduler
            .create_batch(CreateBatchRequest {
                name: "greeting".to_string(),
                agent_config_id,
                template: "say hi to {{input}}".to_string(),
                inputs: vec!["alice".to_string()],
                concurrency: 1,
                max_retries: 1,
            })
            .await
            .unwrap();

        scheduler.cancel(batch.id).await.unwrap();
        let reloaded = scheduler.get_batch(batch.id).await.unwrap();
        assert_eq!(reloaded.status, BatchStatus::Cancelled);
    }
}
