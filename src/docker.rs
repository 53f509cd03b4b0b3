//! Docker backend driver
//!
//! Units are existing containers: either one container addressed by name, or
//! every container carrying the `idlegate.group.<name>` label.

use crate::backend::{BackendDriver, BackendGroup, BackendUnit, UnitState};
use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{ContainerState, ContainerSummary};
use bollard::Docker;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Label prefix used to select the containers of a group
pub const GROUP_LABEL_PREFIX: &str = "idlegate.group.";

/// Drives containers through the Docker API
pub struct DockerDriver {
    client: Docker,
    stop_timeout: Duration,
}

impl DockerDriver {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(docker_host: Option<&str>, stop_timeout: Duration) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}. \
                     Ensure Docker is running and accessible.",
                    host, e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            stop_timeout,
        })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.is_empty() || path.contains("//") {
                continue; // Skip invalid paths from empty env vars
            }
            if !std::path::Path::new(path).exists() {
                continue;
            }

            debug!(path, name, "Found Docker socket");
            match Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                Ok(client) if client.ping().await.is_ok() => return Ok(client),
                Ok(_) => debug!(path, "Socket exists but daemon is not responding"),
                Err(e) => debug!(path, error = %e, "Socket connection failed"),
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon: {}. \
                 Start Docker, set DOCKER_HOST, or configure backend.docker_host.",
                e
            )
        })
    }

    async fn list(&self, filter_key: &str, filter_value: &str) -> anyhow::Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert(filter_key.to_string(), vec![filter_value.to_string()]);

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        self.client
            .list_containers(Some(options))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list containers: {}", e))
    }

    /// Resolve a single container by name into a one-unit group
    pub async fn resolve_container(self: &Arc<Self>, name: &str) -> anyhow::Result<BackendGroup> {
        let containers = self.list("name", name).await?;
        let units: Vec<BackendUnit> = containers.iter().filter_map(summary_to_unit).collect();

        let unit = pick_by_name(units, name)
            .ok_or_else(|| anyhow::anyhow!("No container found with name '{}'", name))?;

        info!(container = %unit.name, id = %unit.id, "Resolved backend container");
        Ok(BackendGroup::new(name, vec![unit], Arc::clone(self) as Arc<dyn BackendDriver>))
    }

    /// Resolve every container labelled `idlegate.group.<group>`
    pub async fn resolve_group(self: &Arc<Self>, group: &str) -> anyhow::Result<BackendGroup> {
        let label = group_label(group);
        let units: Vec<BackendUnit> = self
            .list("label", &label)
            .await?
            .iter()
            .filter_map(summary_to_unit)
            .collect();

        if units.is_empty() {
            anyhow::bail!("No containers found with label: {}", label);
        }

        info!(
            group,
            containers = ?units.iter().map(|u| u.name.as_str()).collect::<Vec<_>>(),
            "Resolved backend container group"
        );
        Ok(BackendGroup::new(group, units, Arc::clone(self) as Arc<dyn BackendDriver>))
    }
}

#[async_trait]
impl BackendDriver for DockerDriver {
    async fn start_unit(&self, id: &str) -> anyhow::Result<()> {
        match self
            .client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => {
                info!(container_id = id, "Started Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = id, "Container was already running");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to start container {}: {}", id, e)),
        }
    }

    async fn stop_unit(&self, id: &str) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: self.stop_timeout.as_secs() as i64,
        };

        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => {
                info!(container_id = id, "Stopped Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = id, "Container was already stopped");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to stop container {}: {}", id, e)),
        }
    }

    async fn pause_unit(&self, id: &str) -> anyhow::Result<()> {
        match self.client.pause_container(id).await {
            Ok(_) => {
                info!(container_id = id, "Paused Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            }) if message.contains("already paused") => {
                debug!(container_id = id, "Container was already paused");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to pause container {}: {}", id, e)),
        }
    }

    async fn unpause_unit(&self, id: &str) -> anyhow::Result<()> {
        match self.client.unpause_container(id).await {
            Ok(_) => {
                info!(container_id = id, "Unpaused Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            }) if message.contains("not paused") => {
                debug!(container_id = id, "Container was not paused");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to unpause container {}: {}", id, e)),
        }
    }

    async fn inspect_unit(&self, id: &str) -> anyhow::Result<UnitState> {
        let info = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to inspect container {}: {}", id, e))?;

        Ok(info.state.as_ref().map(unit_state).unwrap_or(UnitState::Stopped))
    }
}

/// Label selecting the containers of `group`
pub fn group_label(group: &str) -> String {
    format!("{}{}", GROUP_LABEL_PREFIX, group)
}

fn unit_state(state: &ContainerState) -> UnitState {
    if state.paused.unwrap_or(false) {
        UnitState::Paused
    } else if state.running.unwrap_or(false) {
        UnitState::Running
    } else {
        UnitState::Stopped
    }
}

fn summary_to_unit(summary: &ContainerSummary) -> Option<BackendUnit> {
    let id = summary.id.clone()?;
    let name = summary
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.clone());
    Some(BackendUnit { id, name })
}

/// Docker's name filter matches substrings; prefer the exact name
fn pick_by_name(units: Vec<BackendUnit>, name: &str) -> Option<BackendUnit> {
    if let Some(exact) = units.iter().find(|u| u.name == name) {
        return Some(exact.clone());
    }
    let first = units.into_iter().next()?;
    warn!(requested = name, using = %first.name, "No exact container name match");
    Some(first)
}
