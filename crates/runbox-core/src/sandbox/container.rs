use super::job::Job;
use super::runtime::ContainerRuntime;
use crate::errors::SandboxError;
use crate::wire;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Lifecycle of one worker container.
///
/// `Booting -> AwaitingReady -> Available -> Busy -> Retiring -> Gone`.
/// Handles are one-shot: after a single job they are always retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Booting,
    AwaitingReady,
    Available,
    Busy,
    Retiring,
    Gone,
}

/// Host-side proxy for a live worker container.
pub struct ContainerHandle {
    seq: u64,
    id: String,
    address: Option<String>,
    state: HandleState,
    runtime: Arc<dyn ContainerRuntime>,
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("seq", &self.seq)
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state)
            .finish()
    }
}

impl ContainerHandle {
    pub(crate) fn new(seq: u64, id: String, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            seq,
            id,
            address: None,
            state: HandleState::Booting,
            runtime,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    /// The runtime reported the container as started.
    pub(crate) fn mark_started(&mut self) {
        if self.state == HandleState::Booting {
            self.state = HandleState::AwaitingReady;
        }
    }

    pub(crate) fn set_address(&mut self, address: String) {
        self.address = Some(address);
    }

    /// `AwaitingReady -> Available`. Returns whether the transition happened;
    /// calling it again on a promoted or retired handle does nothing.
    pub(crate) fn promote(&mut self) -> bool {
        if self.state == HandleState::AwaitingReady && self.address.is_some() {
            self.state = HandleState::Available;
            true
        } else {
            false
        }
    }

    /// Runs `job` on the worker, reports its outcome and retires the handle.
    pub(crate) async fn execute(mut self, client: reqwest::Client, job: Job) {
        self.state = HandleState::Busy;
        let (payload, timeout, mut output, completion) = job.split();

        let outcome = match self.exchange(&client, &payload, timeout, &mut output).await {
            Err(SandboxError::ExchangeTimeout) => {
                log::warn!(
                    "Job on container {} exceeded its {}ms allowance",
                    self.id,
                    timeout.as_millis()
                );
                Ok(None)
            }
            Err(e) => {
                log::error!("Job on container {} failed: {}", self.id, e);
                Err(e)
            }
            Ok(exit_code) => {
                log::debug!("Job on container {} finished with {:?}", self.id, exit_code);
                Ok(exit_code)
            }
        };
        drop(output);
        completion.send(outcome);

        self.retire().await;
    }

    async fn exchange(
        &self,
        client: &reqwest::Client,
        payload: &super::JobPayload,
        timeout: Duration,
        output: &mut Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Result<Option<i32>, SandboxError> {
        let address = self
            .address
            .as_deref()
            .ok_or_else(|| SandboxError::Runtime(format!("container {} has no address", self.id)))?;

        let form = wire::build_form(payload).await?;
        let response = client
            .post(format!("http://{}/", address))
            .multipart(form)
            .timeout(timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SandboxError::WorkerStatus(response.status().as_u16()));
        }

        let exit_code = response
            .headers()
            .get(wire::EXIT_CODE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .and_then(|value| value.parse::<i32>().ok());

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            output.write_all(&chunk?).await?;
        }
        output.flush().await?;
        Ok(exit_code)
    }

    /// Stops and force-removes the container. Failures are logged only.
    pub(crate) async fn retire(&mut self) {
        if matches!(self.state, HandleState::Retiring | HandleState::Gone) {
            return;
        }
        self.state = HandleState::Retiring;
        if let Err(e) = self.runtime.stop(&self.id).await {
            log::debug!("Stopping container {} failed: {}", self.id, e);
        }
        if let Err(e) = self.runtime.remove(&self.id).await {
            log::warn!("Removing container {} failed: {}", self.id, e);
        }
        self.state = HandleState::Gone;
        log::debug!("Retired container {}", self.id);
    }
}
