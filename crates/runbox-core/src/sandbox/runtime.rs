//! Container runtime client
//!
//! The pool only needs five operations from a runtime, all addressed by the
//! container id the runtime handed out on creation.

use crate::errors::SandboxError;
use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    InspectContainerOptions as BollardInspectContainerOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    StopContainerOptions as BollardStopContainerOptionsQuery,
};
use bollard::Docker;
use std::collections::HashMap;
use uuid::Uuid;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates a worker container and returns its id.
    async fn create(&self) -> Result<String, SandboxError>;

    async fn start(&self, id: &str) -> Result<(), SandboxError>;

    /// The `host:port` the worker inside the container listens on.
    async fn address(&self, id: &str) -> Result<String, SandboxError>;

    async fn stop(&self, id: &str) -> Result<(), SandboxError>;

    /// Forced removal. Removing a container that is already gone is not an error.
    async fn remove(&self, id: &str) -> Result<(), SandboxError>;
}

/// How worker containers are created.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerOptions {
    pub image: String,
    pub user: Option<String>,
    pub memory_limit_mb: Option<u64>,
    pub worker_port: u16,
    pub network: Option<String>,
    pub binds: Vec<String>,
    /// Where workers announce themselves, passed as `RUNBOX_REGISTER_URL`.
    pub register_url: Option<String>,
    pub labels: HashMap<String, String>,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            image: "runbox-worker".to_string(),
            user: Some("sandboxuser".to_string()),
            memory_limit_mb: Some(100),
            worker_port: 3000,
            network: None,
            binds: Vec::new(),
            register_url: None,
            labels: HashMap::from([("__runbox_sandbox".to_string(), "1".to_string())]),
        }
    }
}

/// [`ContainerRuntime`] backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
    options: ContainerOptions,
}

impl DockerRuntime {
    pub fn new(options: ContainerOptions) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker, options })
    }

    fn create_body(&self) -> ContainerCreateBody {
        let mut env = vec![format!("RUNBOX_WORKER_PORT={}", self.options.worker_port)];
        if let Some(url) = &self.options.register_url {
            env.push(format!("RUNBOX_REGISTER_URL={}", url));
        }

        ContainerCreateBody {
            image: Some(self.options.image.clone()),
            user: self.options.user.clone(),
            env: Some(env),
            labels: Some(self.options.labels.clone()),
            host_config: Some(HostConfig {
                memory: self
                    .options
                    .memory_limit_mb
                    .map(|mb| (mb * 1024 * 1024) as i64),
                binds: (!self.options.binds.is_empty()).then(|| self.options.binds.clone()),
                network_mode: self.options.network.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self) -> Result<String, SandboxError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(format!("runbox-worker-{}", Uuid::new_v4())),
            ..Default::default()
        });
        let container = self.docker.create_container(options, self.create_body()).await?;
        for warning in &container.warnings {
            log::warn!("Docker warning for {}: {}", container.id, warning);
        }
        Ok(container.id)
    }

    async fn start(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(id, None::<BollardStartContainerOptionsQuery>)
            .await?;
        Ok(())
    }

    async fn address(&self, id: &str) -> Result<String, SandboxError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<BollardInspectContainerOptionsQuery>)
            .await?;

        let networks = inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default();
        let preferred = self
            .options
            .network
            .as_ref()
            .and_then(|name| networks.get(name))
            .and_then(|endpoint| endpoint.ip_address.clone());
        let ip = preferred
            .or_else(|| {
                networks
                    .values()
                    .filter_map(|endpoint| endpoint.ip_address.clone())
                    .find(|ip| !ip.is_empty())
            })
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                SandboxError::Runtime(format!("container {} has no network address", id))
            })?;

        Ok(format!("{}:{}", ip, self.options.worker_port))
    }

    async fn stop(&self, id: &str) -> Result<(), SandboxError> {
        self.docker
            .stop_container(id, None::<BollardStopContainerOptionsQuery>)
            .await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        let options = BollardRemoveContainerOptionsQuery {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
