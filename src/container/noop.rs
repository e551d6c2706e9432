//! `noop` container engine: every mutating call fails with
//! `DependencyUnavailable` (spec §4.2, §7) so a host with no container
//! runtime still serves read-only endpoints — health checks, listing
//! whatever sessions/tasks are already persisted — instead of the whole
//! process refusing to start.

use super::{
    ContainerCreateSpec, ContainerEngine, ContainerInfo, ExecResult, OutputChunk, OutputStream,
};
use crate::error::{ContainerError, Result};
use futures::stream;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct NoopEngine;

impl NoopEngine {
    pub fn new() -> Self {
        Self
    }

    fn unavailable(&self, op: &str) -> crate::error::Error {
        ContainerError::DependencyUnavailable(format!("no container runtime configured: {op}")).into()
    }
}

impl ContainerEngine for NoopEngine {
    fn kind(&self) -> &'static str {
        "noop"
    }

    async fn create(&self, _spec: ContainerCreateSpec) -> Result<String> {
        Err(self.unavailable("create"))
    }

    async fn start(&self, _container_id: &str) -> Result<()> {
        Err(self.unavailable("start"))
    }

    async fn stop(&self, _container_id: &str, _timeout: Duration) -> Result<()> {
        Err(self.unavailable("stop"))
    }

    async fn remove(&self, _container_id: &str, _force: bool, _with_volumes: bool) -> Result<()> {
        Err(self.unavailable("remove"))
    }

    async fn exec(&self, _container_id: &str, _argv: Vec<String>) -> Result<ExecResult> {
        Err(self.unavailable("exec"))
    }

    async fn exec_stream(&self, _container_id: &str, _argv: Vec<String>) -> Result<OutputStream> {
        Err(self.unavailable("exec_stream"))
    }

    async fn logs(&self, _container_id: &str, _follow: bool) -> Result<OutputStream> {
        let empty: OutputStream = Box::pin(stream::empty::<std::io::Result<OutputChunk>>());
        Ok(empty)
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo> {
        Err(ContainerError::NotFound(container_id.to_string()).into())
    }

    async fn list_managed(&self) -> Result<Vec<ContainerInfo>> {
        Ok(Vec::new())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn write_file(&self, _container_id: &str, _path: &str, _content: &[u8]) -> Result<()> {
        Err(self.unavailable("write_file"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_succeeds_but_create_does_not() {
        let engine = NoopEngine::new();
        engine.ping().await.unwrap();

        let spec = ContainerCreateSpec {
            name: "x".to_string(),
            image: "x".to_string(),
            env: Default::default(),
            mounts: vec![],
            labels: Default::default(),
            network_mode: "none".to_string(),
            cpus: 1.0,
            memory_mb: 512,
        };
        let err = engine.create(spec).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DependencyUnavailable);
    }

    #[tokio::test]
    async fn list_managed_is_empty() {
        let engine = NoopEngine::new();
        assert!(engine.list_managed().await.unwrap().is_empty());
    }
}
