/// Docker and Docker Compose integration
///
/// `ContainerEngine` is the only way the rest of the crate touches the
/// container runtime. `DockerEngine` implements it with the Docker API for
/// volumes, containers and exec, and the `docker compose` CLI for projects.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HealthStatusEnum, HostConfig};
use bollard::network::CreateNetworkOptions;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("volume {0} is in use")]
    InUse(String),

    #[error("docker compose failed in {}: {stderr}", dir.display())]
    Compose { dir: PathBuf, stderr: String },

    #[error("command in {container} exited with status {code}: {stderr}")]
    ExecFailed {
        container: String,
        code: i64,
        stderr: String,
    },

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Health as reported by the engine for a single container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Starting,
    Unhealthy,
    /// Running, no health check configured
    Running,
    NotRunning,
    Missing,
}

impl HealthStatus {
    /// Good enough to start dependents
    pub fn is_ready(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Running)
    }

    pub fn is_running(&self) -> bool {
        !matches!(self, HealthStatus::NotRunning | HealthStatus::Missing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Starting => "starting",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Running => "running",
            HealthStatus::NotRunning => "stopped",
            HealthStatus::Missing => "missing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    Volume(String),
    Host(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn volume(id: &str, target: &str, read_only: bool) -> Self {
        Self {
            source: MountSource::Volume(id.to_string()),
            target: target.to_string(),
            read_only,
        }
    }

    pub fn host(path: &Path, target: &str, read_only: bool) -> Self {
        Self {
            source: MountSource::Host(path.to_path_buf()),
            target: target.to_string(),
            read_only,
        }
    }

    /// `source:target[:ro]` as accepted in HostConfig.binds
    pub fn to_bind(&self) -> String {
        let source = match &self.source {
            MountSource::Volume(id) => id.clone(),
            MountSource::Host(path) => path.to_string_lossy().to_string(),
        };
        if self.read_only {
            format!("{}:{}:ro", source, self.target)
        } else {
            format!("{}:{}", source, self.target)
        }
    }
}

/// A short-lived helper container, removed after it exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralRun {
    pub image: String,
    pub mounts: Vec<Mount>,
    pub command: Vec<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// `docker compose up -d` in `dir`, optionally limited to `services`
    async fn compose_up(&self, dir: &Path, services: &[String]) -> EngineResult<()>;

    /// `docker compose down` in `dir`
    async fn compose_down(&self, dir: &Path) -> EngineResult<()>;

    /// Run a helper container to completion and return its exit status
    async fn run_ephemeral(&self, run: &EphemeralRun) -> EngineResult<i64>;

    async fn volume_exists(&self, id: &str) -> EngineResult<bool>;

    /// Fails with `EngineError::InUse` while a container still references the volume
    async fn volume_remove(&self, id: &str) -> EngineResult<()>;

    async fn volume_create(&self, id: &str) -> EngineResult<()>;

    async fn inspect_health(&self, container: &str) -> EngineResult<HealthStatus>;

    /// Run a command inside a running container, streaming stdout into `dest`.
    /// Returns the number of bytes written.
    async fn exec_to_file(&self, container: &str, command: &[String], dest: &Path) -> EngineResult<u64>;

    /// Create the named bridge network unless it already exists
    async fn ensure_network(&self, name: &str) -> EngineResult<()>;
}

#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect() -> EngineResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Check if Docker daemon is accessible
    pub async fn check_docker(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn compose_command(&self, dir: &Path, args: &[&str]) -> EngineResult<String> {
        debug!(dir = %dir.display(), ?args, "docker compose");
        let output = tokio::process::Command::new("docker")
            .arg("compose")
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(EngineError::Compose {
                dir: dir.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn ensure_image(&self, image: &str) -> EngineResult<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        debug!(image, "pulling helper image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress?;
        }
        Ok(())
    }
}

fn status_code(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn compose_up(&self, dir: &Path, services: &[String]) -> EngineResult<()> {
        let mut args = vec!["up", "-d"];
        args.extend(services.iter().map(|s| s.as_str()));
        self.compose_command(dir, &args).await?;
        Ok(())
    }

    async fn compose_down(&self, dir: &Path) -> EngineResult<()> {
        self.compose_command(dir, &["down"]).await?;
        Ok(())
    }

    async fn run_ephemeral(&self, run: &EphemeralRun) -> EngineResult<i64> {
        self.ensure_image(&run.image).await?;

        let config = Config {
            image: Some(run.image.clone()),
            cmd: Some(run.command.clone()),
            host_config: Some(HostConfig {
                binds: Some(run.mounts.iter().map(Mount::to_bind).collect()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;
        debug!(id = %created.id, command = ?run.command, "helper container created");

        let result: EngineResult<i64> = async {
            self.docker.start_container::<String>(&created.id, None).await?;

            let mut exit_code = 0;
            let mut wait = self
                .docker
                .wait_container(&created.id, None::<WaitContainerOptions<String>>);
            while let Some(step) = wait.next().await {
                match step {
                    Ok(response) => exit_code = response.status_code,
                    // Non-zero exits surface as this error variant
                    Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                        exit_code = code
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(exit_code)
        }
        .await;

        self.docker
            .remove_container(
                &created.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;

        result
    }

    async fn volume_exists(&self, id: &str) -> EngineResult<bool> {
        match self.docker.inspect_volume(id).await {
            Ok(_) => Ok(true),
            Err(e) if status_code(&e) == Some(404) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn volume_remove(&self, id: &str) -> EngineResult<()> {
        match self
            .docker
            .remove_volume(id, Some(RemoveVolumeOptions { force: false }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Err(EngineError::NotFound(id.to_string())),
            Err(e) if status_code(&e) == Some(409) => Err(EngineError::InUse(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn volume_create(&self, id: &str) -> EngineResult<()> {
        self.docker
            .create_volume(CreateVolumeOptions {
                name: id,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn inspect_health(&self, container: &str) -> EngineResult<HealthStatus> {
        let inspect = match self.docker.inspect_container(container, None).await {
            Ok(inspect) => inspect,
            Err(e) if status_code(&e) == Some(404) => return Ok(HealthStatus::Missing),
            Err(e) => return Err(e.into()),
        };

        let Some(state) = inspect.state else {
            return Ok(HealthStatus::NotRunning);
        };
        if !state.running.unwrap_or(false) {
            return Ok(HealthStatus::NotRunning);
        }

        let health = state.health.and_then(|h| h.status);
        Ok(match health {
            Some(HealthStatusEnum::HEALTHY) => HealthStatus::Healthy,
            Some(HealthStatusEnum::STARTING) => HealthStatus::Starting,
            Some(HealthStatusEnum::UNHEALTHY) => HealthStatus::Unhealthy,
            _ => HealthStatus::Running,
        })
    }

    async fn exec_to_file(&self, container: &str, command: &[String], dest: &Path) -> EngineResult<u64> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut file = BufWriter::new(File::create(dest).await?);
        let mut written = 0u64;
        let mut stderr = Vec::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } => {
                        file.write_all(&message).await?;
                        written += message.len() as u64;
                    }
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    _ => {}
                }
            }
        }
        file.flush().await?;

        let code = self
            .docker
            .inspect_exec(&exec.id)
            .await?
            .exit_code
            .unwrap_or(0);
        if code != 0 {
            return Err(EngineError::ExecFailed {
                container: container.to_string(),
                code,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        Ok(written)
    }

    async fn ensure_network(&self, name: &str) -> EngineResult<()> {
        match self.docker.inspect_network::<String>(name, None).await {
            Ok(_) => return Ok(()),
            Err(e) if status_code(&e) == Some(404) => {}
            Err(e) => return Err(e.into()),
        }

        self.docker
            .create_network(CreateNetworkOptions {
                name,
                driver: "bridge",
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}
