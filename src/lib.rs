//! AgentBox execution core: task manager, session/container manager, batch
//! scheduler, engine adapters, container pool, garbage collector, webhook
//! notifier, cron scheduler, and channel session store.

pub mod adapters;
pub mod agent_config;
pub mod api;
pub mod batch;
pub mod channel;
pub mod config;
pub mod container;
pub mod cron;
pub mod db;
pub mod error;
pub mod secrets;
pub mod session;
pub mod shutdown;
pub mod tasks;
pub mod webhook;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task identifier.
pub type TaskId = Uuid;
/// Turn identifier.
pub type TurnId = Uuid;
/// Session (sandboxed container) identifier.
pub type SessionId = Uuid;
/// Batch identifier.
pub type BatchId = Uuid;
/// Batch task (unit of work within a batch) identifier.
pub type BatchTaskId = Uuid;
/// Agent configuration identifier.
pub type AgentConfigId = Uuid;
/// Webhook subscription identifier.
pub type WebhookId = Uuid;
/// Cron job identifier.
pub type CronJobId = Uuid;
/// Channel session identifier (derived, not random — see `channel::session_key`).
pub type ChannelSessionId = String;

/// Events emitted on the in-process task bus, fanned out to SSE subscribers
/// and to the webhook notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Created {
        task_id: TaskId,
    },
    Started {
        task_id: TaskId,
        turn_id: TurnId,
        session_id: SessionId,
    },
    /// Streamed adapter output chunk, forwarded as it's produced.
    Output {
        task_id: TaskId,
        turn_id: TurnId,
        chunk: String,
    },
    TurnCompleted {
        task_id: TaskId,
        turn_id: TurnId,
    },
    TurnFailed {
        task_id: TaskId,
        turn_id: TurnId,
        error: String,
    },
    Completed {
        task_id: TaskId,
        turn_id: TurnId,
    },
    Failed {
        task_id: TaskId,
        turn_id: TurnId,
        error: String,
    },
    Cancelled {
        task_id: TaskId,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::Created { task_id }
            | TaskEvent::Started { task_id, .. }
            | TaskEvent::Output { task_id, .. }
            | TaskEvent::TurnCompleted { task_id, .. }
            | TaskEvent::TurnFailed { task_id, .. }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Failed { task_id, .. }
            | TaskEvent::Cancelled { task_id } => *task_id,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            TaskEvent::Created { .. } => "task.created",
            TaskEvent::Started { .. } => "task.started",
            TaskEvent::Output { .. } => "task.output",
            TaskEvent::TurnCompleted { .. } => "task.turn.completed",
            TaskEvent::TurnFailed { .. } => "task.turn.failed",
            TaskEvent::Completed { .. } => "task.completed",
            TaskEvent::Failed { .. } => "task.failed",
            TaskEvent::Cancelled { .. } => "task.cancelled",
        }
    }

    /// Whether this event should trigger a webhook delivery (spec.md §4.8 —
    /// terminal task/turn transitions only, not streamed output).
    pub fn is_webhook_worthy(&self) -> bool {
        !matches!(self, TaskEvent::Created { .. } | TaskEvent::Output { .. } | TaskEvent::Started { .. })
    }
}

/// Batch-level events, mirroring `TaskEvent` for batch progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    Created { batch_id: BatchId },
    TaskClaimed { batch_id: BatchId, batch_task_id: BatchTaskId },
    TaskCompleted { batch_id: BatchId, batch_task_id: BatchTaskId },
    TaskFailed { batch_id: BatchId, batch_task_id: BatchTaskId, error: String },
    TaskDeadLettered { batch_id: BatchId, batch_task_id: BatchTaskId },
    Paused { batch_id: BatchId },
    Resumed { batch_id: BatchId },
    Cancelled { batch_id: BatchId },
    Completed { batch_id: BatchId },
    Progress {
        batch_id: BatchId,
        completed: u64,
        failed: u64,
        dead: u64,
        total: u64,
        percent: f64,
        eta_secs: Option<u64>,
        tasks_per_sec: f64,
    },
}

impl BatchEvent {
    pub fn batch_id(&self) -> BatchId {
        match self {
            BatchEvent::Created { batch_id }
            | BatchEvent::TaskClaimed { batch_id, .. }
            | BatchEvent::TaskCompleted { batch_id, .. }
            | BatchEvent::TaskFailed { batch_id, .. }
            | BatchEvent::TaskDeadLettered { batch_id, .. }
            | BatchEvent::Paused { batch_id }
            | BatchEvent::Resumed { batch_id }
            | BatchEvent::Cancelled { batch_id }
            | BatchEvent::Completed { batch_id }
            | BatchEvent::Progress { batch_id, .. } => *batch_id,
        }
    }
}
