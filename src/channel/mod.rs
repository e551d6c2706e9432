//! Channel Session Store (spec §4.10). Bridges chat-style webhooks (one
//! message at a time, no task id in hand) onto the Task Manager's
//! create-or-append model.
//!
//! Two-layer store: an in-memory TTL map for the hot lookup on every
//! inbound message, and [`store::ChannelStore`] for durability across a
//! restart. Grounded on the teacher's `messaging/traits.rs` contract
//! split (a narrow trait the concrete chat adapters implement) applied
//! here to a narrower "submit a turn, learn the task id" surface.

pub mod store;

use crate::tasks::{CreateTaskRequest, TaskManager};
use crate::{AgentConfigId, TaskEvent, TaskId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub use store::{ChannelSession, ChannelStore};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A turn submitted from a chat-channel webhook. `user` is present for
/// group chats and absent for 1:1 direct chats — it's what distinguishes
/// the two key-derivation shapes in spec.md §4.10.
pub struct InboundMessage {
    pub channel: String,
    pub chat: String,
    pub user: Option<String>,
    pub agent_config_id: AgentConfigId,
    pub prompt: String,
}

fn derive_key(channel: &str, chat: &str, user: Option<&str>) -> String {
    match user {
        Some(user) => format!("{channel}:{chat}:{user}"),
        None => format!("{channel}:{chat}"),
    }
}

struct CacheEntry {
    current_task_id: Option<TaskId>,
    expires_at: Instant,
}

pub struct ChannelSessionStore {
    store: Arc<ChannelStore>,
    tasks: Arc<TaskManager>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    shutdown: CancellationToken,
}

impl ChannelSessionStore {
    pub fn new(store: Arc<ChannelStore>, tasks: Arc<TaskManager>, ttl: Duration) -> Arc<Self> {
        Arc::new(Self { store, tasks, cache: Mutex::new(HashMap::new()), ttl, shutdown: CancellationToken::new() })
    }

    /// Looks up the session for this key; if the referenced task is still
    /// append-eligible, appends a turn to it, otherwise starts a fresh
    /// task. Either way the (possibly new) task id is stored under the
    /// key with a refreshed TTL, and a background watcher closes the
    /// session if the task ends in failure/cancellation.
    pub async fn submit(self: &Arc<Self>, msg: InboundMessage) -> crate::error::Result<crate::tasks::Task> {
        let key = derive_key(&msg.channel, &msg.chat, msg.user.as_deref());
        let existing_task_id = self.lookup(&key).await?;

        let mut append_to = None;
        if let Some(task_id) = existing_task_id {
            if let Ok(task) = self.tasks.get_task(task_id).await {
                if task.status.append_eligible() {
                    append_to = Some(task_id);
                }
            }
        }

        let task = match append_to {
            Some(task_id) => {
                self.tasks
                    .create_task(CreateTaskRequest { task_id: Some(task_id), prompt: msg.prompt.clone(), ..Default::default() })
                    .await?
            }
            None => {
                self.tasks
                    .create_task(CreateTaskRequest {
                        agent_config_id: Some(msg.agent_config_id),
                        prompt: msg.prompt.clone(),
                        ..Default::default()
                    })
                    .await?
            }
        };

        self.remember(&key, &msg.channel, &msg.chat, msg.agent_config_id, task.id).await?;
        self.spawn_close_watcher(key, task.id);
        Ok(task)
    }

    async fn lookup(&self, key: &str) -> crate::error::Result<Option<TaskId>> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(entry) = cache.get(key) {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.current_task_id);
                }
                cache.remove(key);
            }
        }

        match self.store.find(key).await? {
            Some(session) => {
                let mut cache = self.cache.lock().await;
                cache.insert(
                    key.to_string(),
                    CacheEntry { current_task_id: session.current_task_id, expires_at: Instant::now() + self.ttl },
                );
                Ok(session.current_task_id)
            }
            None => Ok(None),
        }
    }

    async fn remember(
        &self,
        key: &str,
        channel: &str,
        chat: &str,
        agent_config_id: AgentConfigId,
        task_id: TaskId,
    ) -> crate::error::Result<()> {
        self.store.upsert(key, channel, chat, agent_config_id, Some(task_id)).await?;
        self.cache
            .lock()
            .await
            .insert(key.to_string(), CacheEntry { current_task_id: Some(task_id), expires_at: Instant::now() + self.ttl });
        Ok(())
    }

    /// Closes the session once the task reaches a terminal state other
    /// than `Completed` — success keeps the session open so the next
    /// inbound message continues the same multi-turn task.
    fn spawn_close_watcher(self: &Arc<Self>, key: String, task_id: TaskId) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut rx = this.tasks.subscribe(task_id).await;
            loop {
                match rx.recv().await {
                    Ok(TaskEvent::Failed { .. }) | Ok(TaskEvent::Cancelled { .. }) => {
                        let _ = this.close(&key).await;
                        return;
                    }
                    Ok(TaskEvent::Completed { .. }) => return,
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    pub async fn close(&self, key: &str) -> crate::error::Result<()> {
        self.cache.lock().await.remove(key);
        self.store.close(key).await
    }

    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                }
                self.sweep_once().await;
            }
        })
    }

    async fn sweep_once(&self) {
        let now = Instant::now();
        self.cache.lock().await.retain(|_, entry| entry.expires_at > now);

        match self.store.expired(chrono::Duration::from_std(self.ttl).unwrap()).await {
            Ok(expired) => {
                for session in expired {
                    if let Err(err) = self.store.close(&session.key).await {
                        tracing::error!(key = %session.key, error = %err, "channel: failed to close expired session");
                    }
                }
            }
            Err(err) => tracing::error!(error = %err, "channel: failed to load expired sessions"),
        }
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_distinguishes_group_from_direct() {
        assert_eq!(derive_key("slack", "C1", Some("U1")), "slack:C1:U1");
        assert_eq!(derive_key("slack", "C1", None), "slack:C1");
    }
}
