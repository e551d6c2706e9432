//! Container Manager (spec §4.2): abstraction over a local container
//! engine with variants `{docker, noop}`.
//!
//! Same static+dyn trait split as [`crate::adapters`], grounded on the
//! teacher's `messaging/traits.rs`. `docker` is backed by the teacher's
//! existing `bollard` dependency (previously used for self-update, now
//! repurposed for container lifecycle); `noop` degrades every mutating
//! call to `DependencyUnavailable` so read-only HTTP endpoints keep
//! working when the host has no container runtime (spec §4.2, §7).

pub mod docker;
pub mod gc;
pub mod noop;
pub mod pool;

use crate::error::Result;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ContainerCreateSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub mounts: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub network_mode: String,
    pub cpus: f64,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Creating,
    Running,
    Stopped,
    Exited,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub status: ContainerStatus,
    pub image: String,
    pub labels: HashMap<String, String>,
    /// When the container last exited, from the engine's own record —
    /// `None` if it has never exited or the engine can't report it (e.g.
    /// `list_managed`, whose underlying API has no such field; only
    /// `inspect` can populate this).
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A single demultiplexed chunk from `exec_stream`/`logs` — stdout and
/// stderr are cleanly separated (spec §4.2's demux requirement, satisfied
/// by bollard's `LogOutput` in the `docker` engine).
#[derive(Debug, Clone)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

pub type OutputStream = BoxStream<'static, std::io::Result<OutputChunk>>;

/// Static trait for container engine implementations.
pub trait ContainerEngine: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    fn create(&self, spec: ContainerCreateSpec) -> impl Future<Output = Result<String>> + Send;
    fn start(&self, container_id: &str) -> impl Future<Output = Result<()>> + Send;
    fn stop(&self, container_id: &str, timeout: Duration) -> impl Future<Output = Result<()>> + Send;
    fn remove(&self, container_id: &str, force: bool, with_volumes: bool) -> impl Future<Output = Result<()>> + Send;
    fn exec(&self, container_id: &str, argv: Vec<String>) -> impl Future<Output = Result<ExecResult>> + Send;
    fn exec_stream(&self, container_id: &str, argv: Vec<String>) -> impl Future<Output = Result<OutputStream>> + Send;
    fn logs(&self, container_id: &str, follow: bool) -> impl Future<Output = Result<OutputStream>> + Send;
    fn inspect(&self, container_id: &str) -> impl Future<Output = Result<ContainerInfo>> + Send;
    fn list_managed(&self) -> impl Future<Output = Result<Vec<ContainerInfo>>> + Send;
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;
    fn write_file(&self, container_id: &str, path: &str, content: &[u8]) -> impl Future<Output = Result<()>> + Send;
}

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Dynamic companion: lets the Session/Pool/GC subsystems hold
/// `Arc<dyn ContainerEngineDyn>` regardless of which engine is active.
pub trait ContainerEngineDyn: Send + Sync + 'static {
    fn kind(&self) -> &'static str;
    fn create<'a>(&'a self, spec: ContainerCreateSpec) -> BoxFut<'a, String>;
    fn start<'a>(&'a self, container_id: &'a str) -> BoxFut<'a, ()>;
    fn stop<'a>(&'a self, container_id: &'a str, timeout: Duration) -> BoxFut<'a, ()>;
    fn remove<'a>(&'a self, container_id: &'a str, force: bool, with_volumes: bool) -> BoxFut<'a, ()>;
    fn exec<'a>(&'a self, container_id: &'a str, argv: Vec<String>) -> BoxFut<'a, ExecResult>;
    fn exec_stream<'a>(&'a self, container_id: &'a str, argv: Vec<String>) -> BoxFut<'a, OutputStream>;
    fn logs<'a>(&'a self, container_id: &'a str, follow: bool) -> BoxFut<'a, OutputStream>;
    fn inspect<'a>(&'a self, container_id: &'a str) -> BoxFut<'a, ContainerInfo>;
    fn list_managed<'a>(&'a self) -> BoxFut<'a, Vec<ContainerInfo>>;
    fn ping<'a>(&'a self) -> BoxFut<'a, ()>;
    fn write_file<'a>(&'a self, container_id: &'a str, path: &'a str, content: &'a [u8]) -> BoxFut<'a, ()>;
}

impl<T: ContainerEngine> ContainerEngineDyn for T {
    fn kind(&self) -> &'static str {
        ContainerEngine::kind(self)
    }
    fn create<'a>(&'a self, spec: ContainerCreateSpec) -> BoxFut<'a, String> {
        Box::pin(ContainerEngine::create(self, spec))
    }
    fn start<'a>(&'a self, container_id: &'a str) -> BoxFut<'a, ()> {
        Box::pin(ContainerEngine::start(self, container_id))
    }
    fn stop<'a>(&'a self, container_id: &'a str, timeout: Duration) -> BoxFut<'a, ()> {
        Box::pin(ContainerEngine::stop(self, container_id, timeout))
    }
    fn remove<'a>(&'a self, container_id: &'a str, force: bool, with_volumes: bool) -> BoxFut<'a, ()> {
        Box::pin(ContainerEngine::remove(self, container_id, force, with_volumes))
    }
    fn exec<'a>(&'a self, container_id: &'a str, argv: Vec<String>) -> BoxFut<'a, ExecResult> {
        Box::pin(ContainerEngine::exec(self, container_id, argv))
    }
    fn exec_stream<'a>(&'a self, container_id: &'a str, argv: Vec<String>) -> BoxFut<'a, OutputStream> {
        Box::pin(ContainerEngine::exec_stream(self, container_id, argv))
    }
    fn logs<'a>(&'a self, container_id: &'a str, follow: bool) -> BoxFut<'a, OutputStream> {
        Box::pin(ContainerEngine::logs(self, container_id, follow))
    }
    fn inspect<'a>(&'a self, container_id: &'a str) -> BoxFut<'a, ContainerInfo> {
        Box::pin(ContainerEngine::inspect(self, container_id))
    }
    fn list_managed<'a>(&'a self) -> BoxFut<'a, Vec<ContainerInfo>> {
        Box::pin(ContainerEngine::list_managed(self))
    }
    fn ping<'a>(&'a self) -> BoxFut<'a, ()> {
        Box::pin(ContainerEngine::ping(self))
    }
    fn write_file<'a>(&'a self, container_id: &'a str, path: &'a str, content: &'a [u8]) -> BoxFut<'a, ()> {
        Box::pin(ContainerEngine::write_file(self, container_id, path, content))
    }
}

pub use gc::GarbageCollector;
pub use pool::ContainerPool;
