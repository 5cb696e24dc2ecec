use anyhow::Context;
use async_trait::async_trait;
use bollard::container::{
    Config, LogOutput, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::sandbox::ExecOutput;

/// Container runtime surface the pool and runner depend on. Production is
/// Docker via bollard; tests substitute an in-process fake.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Makes sure `image` is present locally, pulling it if absent.
    async fn ensure_image(&self, image: &str) -> anyhow::Result<()>;

    /// Creates a stopped container running a keep-alive command and returns
    /// the runtime-assigned id.
    async fn create_container(&self, image: &str) -> anyhow::Result<String>;

    async fn start_container(&self, container_id: &str) -> anyhow::Result<()>;

    /// Runs `cmd` inside the container, demultiplexing stdout and stderr
    /// and reading the exit code back from exec inspect.
    async fn exec_capture(&self, container_id: &str, cmd: Vec<String>)
        -> anyhow::Result<ExecOutput>;

    async fn stop_and_remove(&self, container_id: &str) -> anyhow::Result<()>;
}

pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    pub fn connect() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn ensure_image(&self, image: &str) -> anyhow::Result<()> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .context("failed to list images")?;

        let latest = format!("{image}:latest");
        let present = images.iter().any(|summary| {
            summary
                .repo_tags
                .iter()
                .any(|tag| tag == image || tag == &latest)
        });
        if present {
            debug!(image, "image already present");
            return Ok(());
        }

        info!(image, "pulling image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.with_context(|| format!("failed to pull image {image}"))?;
        }
        info!(image, "image pulled");
        Ok(())
    }

    async fn create_container(&self, image: &str) -> anyhow::Result<String> {
        let config = Config {
            image: Some(image.to_string()),
            // Keep the container alive between executions.
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            tty: Some(false),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container::<String, String>(None, config)
            .await
            .with_context(|| format!("failed to create container from {image}"))?;
        Ok(created.id)
    }

    async fn start_container(&self, container_id: &str) -> anyhow::Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("failed to start container {container_id}"))
    }

    async fn exec_capture(
        &self,
        container_id: &str,
        cmd: Vec<String>,
    ) -> anyhow::Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("failed to create exec in {container_id}"))?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("failed to start exec in {container_id}"))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                match chunk.context("failed to read exec output")? {
                    LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .context("failed to inspect exec")?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code,
        })
    }

    async fn stop_and_remove(&self, container_id: &str) -> anyhow::Result<()> {
        if let Err(err) = self
            .docker
            .stop_container(container_id, None::<StopContainerOptions>)
            .await
        {
            warn!(container_id, error = %err, "error stopping container");
        }
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("failed to remove container {container_id}"))
    }
}
