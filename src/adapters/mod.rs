//! Engine Adapter Registry (spec §4.1).
//!
//! Adapters are capability bundles polymorphic over `{claude-code, codex,
//! opencode, …}`. The static `EngineAdapter` trait mirrors the teacher's
//! `Messaging` trait (`messaging/traits.rs`): plain `async fn` methods for
//! implementors, plus a hand-written object-safe `EngineAdapterDyn`
//! companion with a blanket impl so the registry can hold
//! `Arc<dyn EngineAdapterDyn>` trait objects.

pub mod claude_code;
pub mod codex;
pub mod output;

use crate::agent_config::AgentConfig;
use crate::error::{AdapterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

/// Resource limits and identity carried into container creation.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: crate::SessionId,
    pub agent_name: String,
    pub workspace_path: String,
    pub network_mode: String,
    pub cpus: f64,
    pub memory_mb: u64,
}

/// Output of `EngineAdapter::prepare_container` — everything the Container
/// Manager needs to create the sandbox.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub env: HashMap<String, String>,
    pub mounts: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub network_mode: String,
    pub cpus: f64,
    pub memory_mb: u64,
}

/// Per-exec options assembled by the Task Manager worker loop (spec §4.6
/// step 6).
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub prompt: String,
    pub thread_id: Option<String>,
    pub max_turns: Option<u32>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub wall_timeout: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input: u64,
    pub cached_input: u64,
    pub output: u64,
}

/// A structured event surfaced to callers that asked for `include_events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterEvent {
    pub kind: String,
    pub payload: serde_json::Value,
}

/// Result of `parse_output` — spec §4.1.
#[derive(Debug, Clone, Default)]
pub struct ParsedOutput {
    pub message: String,
    pub thread_id: Option<String>,
    pub exit_code: i32,
    pub usage: Usage,
    pub error: Option<String>,
    pub events: Vec<AdapterEvent>,
}

/// Static trait for adapter implementations. Use this for type-safe code.
pub trait EngineAdapter: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn image(&self) -> &'static str;
    fn required_env(&self) -> &'static [&'static str];

    fn prepare_container(
        &self,
        session: &SessionInfo,
        agent_config: &AgentConfig,
    ) -> ContainerSpec;

    /// Config files to provision in-container before first exec. Empty by
    /// default — most adapters take everything via argv/env.
    fn get_config_files(
        &self,
        _agent_config: &AgentConfig,
        _api_key: &str,
    ) -> HashMap<String, String> {
        HashMap::new()
    }

    fn prepare_exec(&self, exec: &ExecOptions, agent_config: &AgentConfig) -> Result<Vec<String>>;

    fn parse_output(&self, raw_stdout: &str, include_events: bool) -> ParsedOutput;

    fn validate_config(&self, agent_config: &AgentConfig) -> Result<()>;
}

/// Dynamic trait for runtime polymorphism: `Arc<dyn EngineAdapterDyn>` lets
/// the registry store heterogeneous adapters behind one map.
pub trait EngineAdapterDyn: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn image(&self) -> &'static str;
    fn required_env(&self) -> &'static [&'static str];
    fn prepare_container(&self, session: &SessionInfo, agent_config: &AgentConfig) -> ContainerSpec;
    fn get_config_files(&self, agent_config: &AgentConfig, api_key: &str) -> HashMap<String, String>;
    fn prepare_exec<'a>(
        &'a self,
        exec: &'a ExecOptions,
        agent_config: &'a AgentConfig,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<String>>> + Send + 'a>>;
    fn parse_output(&self, raw_stdout: &str, include_events: bool) -> ParsedOutput;
    fn validate_config(&self, agent_config: &AgentConfig) -> Result<()>;
}

impl<T: EngineAdapter> EngineAdapterDyn for T {
    fn name(&self) -> &'static str {
        EngineAdapter::name(self)
    }

    fn display_name(&self) -> &'static str {
        EngineAdapter::display_name(self)
    }

    fn image(&self) -> &'static str {
        EngineAdapter::image(self)
    }

    fn required_env(&self) -> &'static [&'static str] {
        EngineAdapter::required_env(self)
    }

    fn prepare_container(&self, session: &SessionInfo, agent_config: &AgentConfig) -> ContainerSpec {
        EngineAdapter::prepare_container(self, session, agent_config)
    }

    fn get_config_files(&self, agent_config: &AgentConfig, api_key: &str) -> HashMap<String, String> {
        EngineAdapter::get_config_files(self, agent_config, api_key)
    }

    fn prepare_exec<'a>(
        &'a self,
        exec: &'a ExecOptions,
        agent_config: &'a AgentConfig,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<String>>> + Send + 'a>> {
        Box::pin(async move { EngineAdapter::prepare_exec(self, exec, agent_config) })
    }

    fn parse_output(&self, raw_stdout: &str, include_events: bool) -> ParsedOutput {
        EngineAdapter::parse_output(self, raw_stdout, include_events)
    }

    fn validate_config(&self, agent_config: &AgentConfig) -> Result<()> {
        EngineAdapter::validate_config(self, agent_config)
    }
}

/// Process-wide adapter registry, keyed by name. Populated once at startup
/// via [`register_builtin_adapters`] — never through macro-based
/// auto-registration, matching the teacher's explicit
/// `MessagingManager::register` idiom (`messaging/manager.rs`).
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn EngineAdapterDyn>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, adapter: impl EngineAdapter) {
        let name = adapter.name().to_string();
        self.adapters
            .write()
            .expect("adapter registry lock poisoned")
            .insert(name, Arc::new(adapter));
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn EngineAdapterDyn>> {
        self.adapters
            .read()
            .expect("adapter registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownAdapter(name.to_string()).into())
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters
            .read()
            .expect("adapter registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_REGISTRY: OnceLock<Arc<AdapterRegistry>> = OnceLock::new();

/// Builds and installs the process-wide registry with the built-in
/// adapters. Idempotent: later calls return the already-installed registry.
pub fn global_registry() -> Arc<AdapterRegistry> {
    GLOBAL_REGISTRY
        .get_or_init(|| {
            let registry = AdapterRegistry::new();
            registry.register(claude_code::ClaudeCodeAdapter::new());
            registry.register(codex::CodexAdapter::new());
            Arc::new(registry)
        })
        .clone()
}
