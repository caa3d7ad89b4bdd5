//! Disposable container workers for secure invocations.
//!
//! [`Sandbox`] is the single entry point the rest of the process uses. It is
//! constructed once at start-up and shared; tests build their own instance
//! over an in-memory [`ContainerRuntime`].

mod container;
mod job;
mod pool;
mod runtime;

pub use container::{ContainerHandle, HandleState};
pub use job::{Job, JobOutcome, JobPayload};
pub use pool::{PoolManager, PoolStats};
pub use runtime::{ContainerOptions, ContainerRuntime, DockerRuntime};

use crate::errors::SandboxError;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;

#[derive(Debug, Clone)]
pub struct Sandbox {
    pool: PoolManager,
}

impl Sandbox {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, pool_size: usize) -> Result<Self, SandboxError> {
        Ok(Self {
            pool: PoolManager::new(runtime, pool_size)?,
        })
    }

    pub fn initialize(&self) {
        self.pool.initialize();
    }

    pub fn pool(&self) -> &PoolManager {
        &self.pool
    }

    /// Runs `payload` on a worker, writing the result archive to `output`.
    /// Resolves with the worker's exit code, or `None` on timeout.
    pub async fn run(
        &self,
        timeout: Duration,
        payload: JobPayload,
        output: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Result<Option<i32>, SandboxError> {
        let (job, done) = Job::new(payload, timeout, output);
        self.pool.execute_job(job).await;
        done.await.map_err(|_| SandboxError::JobDropped)?
    }

    pub async fn register_ready(&self, address: &str) {
        self.pool.register_ready(address).await;
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
