//! Container Pool (spec §4.3): reuses warm containers across sessions that
//! share an identical create spec, keyed by a digest over the parts of the
//! spec that matter for reuse.
//!
//! Grounded on the teacher's `tasks/store.rs` for the "thin struct wrapping
//! shared state behind a mutex, async methods driving it" shape, adapted
//! here to an in-memory LIFO pool rather than a SQL table since pooled
//! containers don't need to survive a restart (spec §4.3: the pool is
//! rebuilt from whatever `managed=true` containers the GC finds on boot).

use super::{ContainerCreateSpec, ContainerEngineDyn};
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DEFAULT_MAX_PER_KEY: usize = 3;
const DEFAULT_MAX_TOTAL: usize = 10;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Digest over the reuse-relevant fields of a [`ContainerCreateSpec`]:
/// image, env *keys* (not secret values), sorted mount targets, network
/// mode, privileged flag (carried as a label), cpu/memory limits.
pub fn pool_key(spec: &ContainerCreateSpec) -> String {
    let mut env_keys: Vec<&str> = spec.env.keys().map(|k| k.as_str()).collect();
    env_keys.sort_unstable();

    let mut mount_targets: Vec<&str> = spec.mounts.iter().map(|(_, dst)| dst.as_str()).collect();
    mount_targets.sort_unstable();

    let privileged = spec.labels.get("privileged").map(String::as_str).unwrap_or("false");

    let mut hasher = Sha256::new();
    hasher.update(spec.image.as_bytes());
    hasher.update(b"|");
    hasher.update(env_keys.join(",").as_bytes());
    hasher.update(b"|");
    hasher.update(mount_targets.join(",").as_bytes());
    hasher.update(b"|");
    hasher.update(spec.network_mode.as_bytes());
    hasher.update(b"|");
    hasher.update(privileged.as_bytes());
    hasher.update(b"|");
    hasher.update(spec.cpus.to_bits().to_le_bytes());
    hasher.update(b"|");
    hasher.update(spec.memory_mb.to_le_bytes());

    hex::encode(hasher.finalize())
}

struct PooledContainer {
    container_id: String,
    last_used: Instant,
    use_count: u64,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_per_key: usize,
    pub max_total: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_key: DEFAULT_MAX_PER_KEY,
            max_total: DEFAULT_MAX_TOTAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

struct Inner {
    // LIFO: push_back, pop_back, so the most-recently-released container
    // (warmest cache, freshest filesystem) is handed out first.
    idle: HashMap<String, Vec<PooledContainer>>,
    total: usize,
}

pub struct ContainerPool {
    engine: Arc<dyn ContainerEngineDyn>,
    config: PoolConfig,
    inner: Mutex<Inner>,
}

impl ContainerPool {
    pub fn new(engine: Arc<dyn ContainerEngineDyn>, config: PoolConfig) -> Self {
        Self {
            engine,
            config,
            inner: Mutex::new(Inner {
                idle: HashMap::new(),
                total: 0,
            }),
        }
    }

    /// Pop a warm container matching `spec`'s key, if one's idle. Runs a
    /// pre-reuse cleanup pass (spec §4.3) before handing it back, since a
    /// prior session's agent process may have left something suspended.
    pub async fn acquire(&self, spec: &ContainerCreateSpec) -> Result<Option<String>> {
        let key = pool_key(spec);

        let candidate = {
            let mut inner = self.inner.lock().await;
            let bucket = inner.idle.get_mut(&key);
            let popped = bucket.and_then(|b| b.pop());
            if popped.is_some() {
                inner.total -= 1;
            }
            popped
        };

        let Some(mut pooled) = candidate else {
            return Ok(None);
        };

        if let Err(err) = self.clean_before_reuse(&pooled.container_id).await {
            tracing::warn!(container_id = %pooled.container_id, error = %err, "pool: pre-reuse cleanup failed, discarding container");
            let _ = self.engine.remove(&pooled.container_id, true, true).await;
            return Ok(None);
        }

        pooled.use_count += 1;
        pooled.last_used = Instant::now();
        Ok(Some(pooled.container_id))
    }

    async fn clean_before_reuse(&self, container_id: &str) -> Result<()> {
        // Best-effort: kill anything still running under the workspace so
        // a stale agent process doesn't interleave output with the next
        // session's turn.
        let _ = self
            .engine
            .exec(container_id, vec!["pkill".to_string(), "-9".to_string(), "-f".to_string(), "/workspace".to_string()])
            .await;
        Ok(())
    }

    /// Return a container to the idle pool, or destroy it if the pool is
    /// already at capacity for its key/total, or if the caller marked it
    /// `no_pool` (spec §4.3's `no_pool` label escape hatch).
    pub async fn release(&self, spec: &ContainerCreateSpec, container_id: String) -> Result<()> {
        if spec.labels.get("no_pool").map(String::as_str) == Some("true") {
            return self.destroy(container_id).await;
        }

        let key = pool_key(spec);
        let mut inner = self.inner.lock().await;

        let bucket = inner.idle.entry(key.clone()).or_default();
        if bucket.len() >= self.config.max_per_key || inner.total >= self.config.max_total {
            drop(inner);
            return self.destroy(container_id).await;
        }

        bucket.push(PooledContainer {
            container_id,
            last_used: Instant::now(),
            use_count: 0,
        });
        inner.total += 1;
        Ok(())
    }

    async fn destroy(&self, container_id: String) -> Result<()> {
        self.engine.stop(&container_id, Duration::from_secs(5)).await.ok();
        self.engine.remove(&container_id, true, true).await
    }

    /// Background sweep: destroy idle containers past the configured idle
    /// timeout. Intended to be driven by a periodic tick from the same
    /// task that owns the [`crate::container::GarbageCollector`] loop.
    pub async fn sweep_idle(&self) -> usize {
        let expired: Vec<String> = {
            let mut inner = self.inner.lock().await;
            let mut expired = Vec::new();
            for bucket in inner.idle.values_mut() {
                let mut i = 0;
                while i < bucket.len() {
                    if bucket[i].last_used.elapsed() > self.config.idle_timeout {
                        expired.push(bucket.remove(i).container_id);
                    } else {
                        i += 1;
                    }
                }
            }
            inner.total = inner.total.saturating_sub(expired.len());
            expired
        };

        let removed = expired.len();
        for container_id in expired {
            if let Err(err) = self.destroy(container_id.clone()).await {
                tracing::warn!(container_id = %container_id, error = %err, "pool: failed to destroy idle container");
            }
        }
        removed
    }

    pub async fn idle_count(&self) -> usize {
        self.inner.lock().await.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerCreateSpec {
        ContainerCreateSpec {
            name: "s".to_string(),
            image: "agentbox/claude-code:latest".to_string(),
            env: HashMap::new(),
            mounts: vec![("/tmp/a".to_string(), "/workspace".to_string())],
            labels: HashMap::new(),
            network_mode: "none".to_string(),
            cpus: 1.0,
            memory_mb: 1024,
        }
    }

    #[test]
    fn key_is_stable_across_env_ordering() {
        let mut spec_a = spec();
        spec_a.env.insert("A".to_string(), "1".to_string());
        spec_a.env.insert("B".to_string(), "2".to_string());

        let mut spec_b = spec();
        spec_b.env.insert("B".to_string(), "different-value".to_string());
        spec_b.env.insert("A".to_string(), "also-different".to_string());

        // Secret values differ, key names don't: same pool key.
        assert_eq!(pool_key(&spec_a), pool_key(&spec_b));
    }

    #[test]
    fn key_differs_on_image() {
        let mut other = spec();
        other.image = "agentbox/codex:latest".to_string();
        assert_ne!(pool_key(&spec()), pool_key(&other));
    }
}
