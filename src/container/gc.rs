//! Garbage Collector (spec §4.4): periodic sweep of `managed=true`
//! containers that removes ones nobody owns anymore.
//!
//! Config is held in an [`arc_swap::ArcSwap`] so an operator can push new
//! TTL/idle-timeout values without restarting the sweep loop, the same
//! hot-swap shape the teacher reserves for runtime-tunable registries.

use super::{ContainerEngineDyn, ContainerInfo, ContainerStatus};
use crate::error::Result;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const MAX_ERROR_LOG: usize = 20;

#[derive(Debug, Clone)]
pub struct GcConfig {
    pub container_ttl: Duration,
    pub exited_idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub startup_timeout: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            container_ttl: Duration::from_secs(12 * 60 * 60),
            exited_idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            startup_timeout: Duration::from_secs(10),
        }
    }
}

/// Why a single container was selected for removal, in priority order:
/// an orphan (no matching session record at all) beats a container that
/// merely outlived its TTL, which beats one that's simply been sitting
/// exited past the idle timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Orphan,
    ExceededTtl,
    ExitedIdle,
}

#[derive(Debug, Clone)]
pub struct RemovalCandidate {
    pub container_id: String,
    pub reason: RemovalReason,
}

#[derive(Debug, Clone)]
pub struct GcErrorEntry {
    pub container_id: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub total_sweeps: u64,
    pub total_removed: u64,
    pub total_errors: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
}

/// A callback into the Session Manager: given a container's `session.id`
/// label, does a live session still claim it? Orphan detection (spec
/// §4.4) needs this rather than any purely container-side signal.
pub trait SessionLookup: Send + Sync + 'static {
    fn owns(&self, session_id: &str) -> bool;
}

struct State {
    stats: GcStats,
    errors: VecDeque<GcErrorEntry>,
}

pub struct GarbageCollector {
    engine: Arc<dyn ContainerEngineDyn>,
    sessions: Arc<dyn SessionLookup>,
    config: ArcSwap<GcConfig>,
    state: Mutex<State>,
}

impl GarbageCollector {
    pub fn new(engine: Arc<dyn ContainerEngineDyn>, sessions: Arc<dyn SessionLookup>, config: GcConfig) -> Self {
        Self {
            engine,
            sessions,
            config: ArcSwap::from_pointee(config),
            state: Mutex::new(State {
                stats: GcStats::default(),
                errors: VecDeque::new(),
            }),
        }
    }

    pub fn set_config(&self, config: GcConfig) {
        self.config.store(Arc::new(config));
    }

    pub fn config(&self) -> GcConfig {
        (**self.config.load()).clone()
    }

    /// Compute what would be removed without touching anything.
    pub async fn preview(&self) -> Result<Vec<RemovalCandidate>> {
        let mut managed = self.engine.list_managed().await?;
        self.fill_exited_at(&mut managed).await;
        Ok(self.select_candidates(managed))
    }

    /// `list_managed` can't report exit timestamps (its underlying API has
    /// no such field), so exited containers are individually inspected to
    /// fill one in before `exited.idle` can be evaluated.
    async fn fill_exited_at(&self, managed: &mut [ContainerInfo]) {
        for info in managed.iter_mut() {
            if info.status != ContainerStatus::Exited || info.exited_at.is_some() {
                continue;
            }
            match self.engine.inspect(&info.id).await {
                Ok(fresh) => info.exited_at = fresh.exited_at,
                Err(err) => tracing::warn!(container_id = %info.id, error = %err, "gc: failed to inspect exited container"),
            }
        }
    }

    /// Run one sweep, actually stopping and removing selected containers.
    /// Errors are logged into the rolling error buffer rather than
    /// propagated, so one bad container never aborts the rest of the sweep.
    pub async fn sweep(&self) -> Result<Vec<RemovalCandidate>> {
        let candidates = self.preview().await?;

        for candidate in &candidates {
            if let Err(err) = self.remove_one(candidate).await {
                self.record_error(candidate.container_id.clone(), err.to_string()).await;
            }
        }

        let mut state = self.state.lock().await;
        state.stats.total_sweeps += 1;
        state.stats.total_removed += candidates.len() as u64;
        state.stats.last_sweep_at = Some(Utc::now());

        Ok(candidates)
    }

    /// Run once at startup under a short timeout; a timeout or error here
    /// is logged but never fatal to process boot (spec §4.4).
    pub async fn run_once_at_startup(self: &Arc<Self>) {
        let timeout = self.config().startup_timeout;
        match tokio::time::timeout(timeout, self.sweep()).await {
            Ok(Ok(removed)) => {
                tracing::info!(count = removed.len(), "gc: startup sweep complete");
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "gc: startup sweep failed, continuing boot");
            }
            Err(_) => {
                tracing::warn!(?timeout, "gc: startup sweep timed out, continuing boot");
            }
        }
    }

    pub async fn stats(&self) -> GcStats {
        self.state.lock().await.stats.clone()
    }

    pub async fn recent_errors(&self) -> Vec<GcErrorEntry> {
        self.state.lock().await.errors.iter().cloned().collect()
    }

    async fn remove_one(&self, candidate: &RemovalCandidate) -> Result<()> {
        self.engine
            .stop(&candidate.container_id, Duration::from_secs(5))
            .await
            .ok();
        self.engine.remove(&candidate.container_id, true, true).await
    }

    async fn record_error(&self, container_id: String, message: String) {
        let mut state = self.state.lock().await;
        state.stats.total_errors += 1;
        if state.errors.len() >= MAX_ERROR_LOG {
            state.errors.pop_front();
        }
        state.errors.push_back(GcErrorEntry {
            container_id,
            message,
            at: Utc::now(),
        });
    }

    fn select_candidates(&self, managed: Vec<ContainerInfo>) -> Vec<RemovalCandidate> {
        let config = self.config();
        let mut out = Vec::new();

        for info in managed {
            let session_id = info.labels.get("session.id").cloned();

            let reason = match &session_id {
                None => Some(RemovalReason::Orphan),
                Some(id) if !self.sessions.owns(id) => Some(RemovalReason::Orphan),
                Some(_) => self.non_orphan_reason(&info, &config),
            };

            if let Some(reason) = reason {
                out.push(RemovalCandidate {
                    container_id: info.id,
                    reason,
                });
            }
        }

        out
    }

    fn non_orphan_reason(&self, info: &ContainerInfo, config: &GcConfig) -> Option<RemovalReason> {
        let created_label = info.labels.get("created.at")?;
        let created: DateTime<Utc> = created_label.parse().ok()?;
        let age = Utc::now().signed_duration_since(created).to_std().ok()?;

        if age > config.container_ttl {
            return Some(RemovalReason::ExceededTtl);
        }

        if info.status == ContainerStatus::Exited {
            if let Some(exited_at) = info.exited_at {
                let idle = Utc::now().signed_duration_since(exited_at).to_std().ok()?;
                if idle > config.exited_idle_timeout {
                    return Some(RemovalReason::ExitedIdle);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct AllowAll;
    impl SessionLookup for AllowAll {
        fn owns(&self, _session_id: &str) -> bool {
            true
        }
    }

    struct OwnsNone;
    impl SessionLookup for OwnsNone {
        fn owns(&self, _session_id: &str) -> bool {
            false
        }
    }

    fn info(labels: HashMap<String, String>, status: ContainerStatus) -> ContainerInfo {
        ContainerInfo {
            id: "c1".to_string(),
            status,
            image: "agentbox/claude-code:latest".to_string(),
            labels,
            exited_at: None,
        }
    }

    #[test]
    fn missing_session_label_is_orphan() {
        let gc_sessions: Arc<dyn SessionLookup> = Arc::new(AllowAll);
        let engine: Arc<dyn ContainerEngineDyn> = Arc::new(crate::container::noop::NoopEngine::new());
        let gc = GarbageCollector::new(engine, gc_sessions, GcConfig::default());

        let candidates = gc.select_candidates(vec![info(HashMap::new(), ContainerStatus::Running)]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].reason, RemovalReason::Orphan);
    }

    #[test]
    fn session_no_longer_owned_is_orphan() {
        let gc_sessions: Arc<dyn SessionLookup> = Arc::new(OwnsNone);
        let engine: Arc<dyn ContainerEngineDyn> = Arc::new(crate::container::noop::NoopEngine::new());
        let gc = GarbageCollector::new(engine, gc_sessions, GcConfig::default());

        let mut labels = HashMap::new();
        labels.insert("session.id".to_string(), "s1".to_string());
        let candidates = gc.select_candidates(vec![info(labels, ContainerStatus::Running)]);
        assert_eq!(candidates[0].reason, RemovalReason::Orphan);
    }

    #[test]
    fn live_owned_container_is_kept() {
        let gc_sessions: Arc<dyn SessionLookup> = Arc::new(AllowAll);
        let engine: Arc<dyn ContainerEngineDyn> = Arc::new(crate::container::noop::NoopEngine::new());
        let gc = GarbageCollector::new(engine, gc_sessions, GcConfig::default());

        let mut labels = HashMap::new();
        labels.insert("session.id".to_string(), "s1".to_string());
        labels.insert("created.at".to_string(), Utc::now().to_rfc3339());
        let candidates = gc.select_candidates(vec![info(labels, ContainerStatus::Running)]);
        assert!(candidates.is_empty());
    }

    #[test]
    fn exited_past_idle_timeout_is_removed() {
        let gc_sessions: Arc<dyn SessionLookup> = Arc::new(AllowAll);
        let engine: Arc<dyn ContainerEngineDyn> = Arc::new(crate::container::noop::NoopEngine::new());
        let config = GcConfig { exited_idle_timeout: Duration::from_secs(60), ..GcConfig::default() };
        let gc = GarbageCollector::new(engine, gc_sessions, config);

        let mut labels = HashMap::new();
        labels.insert("session.id".to_string(), "s1".to_string());
        labels.insert("created.at".to_string(), (Utc::now() - chrono::Duration::hours(1)).to_rfc3339());
        let mut container = info(labels, ContainerStatus::Exited);
        container.exited_at = Some(Utc::now() - chrono::Duration::minutes(5));

        let candidates = gc.select_candidates(vec![container]);
        assert_eq!(candidates[0].reason, RemovalReason::ExitedIdle);
    }

    #[test]
    fn exited_without_a_known_exit_time_is_kept() {
        let gc_sessions: Arc<dyn SessionLookup> = Arc::new(AllowAll);
        let engine: Arc<dyn ContainerEngineDyn> = Arc::new(crate::container::noop::NoopEngine::new());
        let gc = GarbageCollector::new(engine, gc_sessions, GcConfig::default());

        let mut labels = HashMap::new();
        labels.insert("session.id".to_string(), "s1".to_string());
        labels.insert("created.at".to_string(), Utc::now().to_rfc3339());
        let candidates = gc.select_candidates(vec![info(labels, ContainerStatus::Exited)]);
        assert!(candidates.is_empty());
    }
}
