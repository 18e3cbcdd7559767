//! Docker driver.
//!
//! Runs each task as a container on a Docker host, local or remote (the
//! cloud provisioners point an instance of this driver at a forwarded
//! docker socket). Volumes are named Docker volumes; volume data moves
//! through a stopped helper container using the archive endpoints.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, DownloadFromContainerOptions,
    KillContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    UploadToContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use conveyor_core::{
    ContainerHandle, ContainerStatus, Driver, Error, Result, TarStream, TaskSpec,
    VolumeDataAccessor, VolumeHandle,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, watch};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info, warn};

const HELPER_IMAGE: &str = "busybox:latest";
const VOLUME_MOUNT: &str = "/volume-data";

pub struct DockerDriver {
    docker: Docker,
    namespace: String,
    volumes: Mutex<HashMap<String, Arc<DockerVolume>>>,
    containers: Mutex<HashMap<String, Arc<DockerContainer>>>,
}

impl DockerDriver {
    /// Connect to the local Docker daemon.
    pub fn new(namespace: &str) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Provisioning(format!("connecting to docker: {e}")))?;
        Ok(Self::with_client(docker, namespace))
    }

    /// Connect to a daemon reachable over TCP, e.g. a forwarded socket.
    pub fn connect_http(address: &str, namespace: &str) -> Result<Self> {
        let docker = Docker::connect_with_http(address, 30, bollard::API_DEFAULT_VERSION)
            .map_err(|e| Error::Provisioning(format!("connecting to docker at {address}: {e}")))?;
        Ok(Self::with_client(docker, namespace))
    }

    pub fn with_client(docker: Docker, namespace: &str) -> Self {
        Self {
            docker,
            namespace: namespace.to_string(),
            volumes: Mutex::new(HashMap::new()),
            containers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(drop)
            .map_err(|e| Error::Transient(format!("docker ping: {e}")))
    }

    fn container_name(&self, task_id: &str) -> String {
        format!("conveyor-task-{task_id}")
    }

    fn volume_name(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            format!("conveyor-{name}")
        } else {
            format!("conveyor-{}-{name}", self.namespace)
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image = %image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(status = %status, "pull progress");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "pull warning");
                }
            }
        }
        Ok(())
    }

    /// A stopped container with the volume mounted, used purely as a
    /// vehicle for the archive endpoints.
    async fn helper_container(&self, volume: &str) -> Result<String> {
        self.pull_image(HELPER_IMAGE).await?;
        let name = format!("conveyor-volume-helper-{}", self.volume_name(volume));
        let config = Config {
            image: Some(HELPER_IMAGE.to_string()),
            cmd: Some(vec!["true".to_string()]),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}", self.volume_name(volume), VOLUME_MOUNT)]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        match self.docker.create_container(Some(options), config).await {
            Ok(_) => Ok(name),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(name),
            Err(e) => Err(Error::Transient(format!("creating volume helper: {e}"))),
        }
    }

    async fn remove_helper(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(name, Some(options)).await {
            warn!(helper = %name, error = %e, "removing volume helper failed");
        }
    }
}

#[async_trait]
impl Driver for DockerDriver {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create_volume(&self, name: &str, _size_hint_gb: u32) -> Result<Arc<dyn VolumeHandle>> {
        let mut volumes = self.volumes.lock().await;
        if let Some(existing) = volumes.get(name) {
            return Ok(existing.clone() as Arc<dyn VolumeHandle>);
        }

        let docker_name = self.volume_name(name);
        let mut labels = HashMap::new();
        labels.insert("conveyor.namespace".to_string(), self.namespace.clone());
        self.docker
            .create_volume(CreateVolumeOptions {
                name: docker_name.clone(),
                labels,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Provisioning(format!("creating volume {name}: {e}")))?;

        let volume = Arc::new(DockerVolume {
            name: name.to_string(),
            docker_name,
            docker: self.docker.clone(),
        });
        volumes.insert(name.to_string(), volume.clone());
        Ok(volume as Arc<dyn VolumeHandle>)
    }

    async fn run_container(&self, task: TaskSpec) -> Result<Arc<dyn ContainerHandle>> {
        let mut containers = self.containers.lock().await;
        if let Some(existing) = containers.get(&task.id) {
            return Ok(existing.clone() as Arc<dyn ContainerHandle>);
        }

        self.pull_image(&task.image).await?;

        let container_name = self.container_name(&task.id);
        let env: Vec<String> = task.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut cmd = vec![task.command.path.clone()];
        cmd.extend(task.command.args.iter().cloned());

        let binds: Option<Vec<String>> = if task.mounts.is_empty() {
            None
        } else {
            Some(
                task.mounts
                    .iter()
                    .map(|m| format!("{}:{}", self.volume_name(&m.name), m.path))
                    .collect(),
            )
        };

        let host_config = HostConfig {
            binds,
            memory: task.limits.memory_mb.map(|mb| (mb * 1024 * 1024) as i64),
            nano_cpus: task.limits.cpus.map(|c| c as i64 * 1_000_000_000),
            ..Default::default()
        };

        let wants_stdin = task.stdin.is_some();
        let config = Config {
            image: Some(task.image.clone()),
            cmd: Some(cmd),
            env: Some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            attach_stdin: Some(wants_stdin),
            open_stdin: Some(wants_stdin),
            stdin_once: Some(wants_stdin),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, image = %task.image, "creating container");
        let mut adopted_exit: Option<i64> = None;
        match self.docker.create_container(Some(options), config).await {
            Ok(_) => {
                self.docker
                    .start_container(&container_name, None::<StartContainerOptions<String>>)
                    .await
                    .map_err(|e| Error::Transient(format!("starting container: {e}")))?;

                if let Some(stdin_data) = &task.stdin {
                    let attach = self
                        .docker
                        .attach_container(
                            &container_name,
                            Some(AttachContainerOptions::<String> {
                                stdin: Some(true),
                                stream: Some(true),
                                ..Default::default()
                            }),
                        )
                        .await
                        .map_err(|e| Error::Transient(format!("attaching stdin: {e}")))?;
                    let mut input = attach.input;
                    let data = stdin_data.clone().into_bytes();
                    tokio::spawn(async move {
                        let _ = input.write_all(&data).await;
                        let _ = input.shutdown().await;
                    });
                }
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                // Idempotent relaunch collision: adopt the existing
                // container, including its exit code if it already stopped.
                let inspect = self
                    .docker
                    .inspect_container(&container_name, None)
                    .await
                    .map_err(|e| Error::Transient(format!("inspecting existing container: {e}")))?;
                let state = inspect.state.unwrap_or_default();
                if !state.running.unwrap_or(false) {
                    adopted_exit = Some(state.exit_code.unwrap_or(-1));
                }
                info!(container = %container_name, "adopted existing container");
            }
            Err(e) => {
                return Err(Error::Transient(format!("creating container: {e}")));
            }
        }

        let container = Arc::new(DockerContainer::track(
            self.docker.clone(),
            task.id.clone(),
            container_name,
            adopted_exit,
        ));
        containers.insert(task.id.clone(), container.clone());
        Ok(container as Arc<dyn ContainerHandle>)
    }

    async fn get_container(&self, id: &str) -> Result<Arc<dyn ContainerHandle>> {
        let containers = self.containers.lock().await;
        containers
            .get(id)
            .map(|c| c.clone() as Arc<dyn ContainerHandle>)
            .ok_or_else(|| Error::NotFound(format!("container {id}")))
    }

    fn volume_data(&self) -> Option<&dyn VolumeDataAccessor> {
        Some(self)
    }

    async fn close(&self) -> Result<()> {
        let containers: Vec<_> = self.containers.lock().await.values().cloned().collect();
        for container in containers {
            if let Err(e) = container.cleanup().await {
                warn!(container = %container.id(), error = %e, "cleanup during close failed");
            }
        }
        let volumes: Vec<_> = self.volumes.lock().await.values().cloned().collect();
        for volume in volumes {
            if let Err(e) = volume.cleanup().await {
                warn!(volume = %volume.name(), error = %e, "volume cleanup during close failed");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeDataAccessor for DockerDriver {
    async fn copy_to_volume(&self, name: &str, data: TarStream) -> Result<()> {
        let helper = self.helper_container(name).await?;
        let options = UploadToContainerOptions {
            path: VOLUME_MOUNT.to_string(),
            ..Default::default()
        };
        let body = bollard::body_try_stream(ReaderStream::new(data));
        let result = self
            .docker
            .upload_to_container(&helper, Some(options), body)
            .await
            .map_err(|e| Error::Transient(format!("uploading into volume {name}: {e}")));
        self.remove_helper(&helper).await;
        result
    }

    async fn copy_from_volume(&self, name: &str) -> Result<TarStream> {
        let helper = self.helper_container(name).await?;
        let options = DownloadFromContainerOptions {
            // Trailing `/.` roots the archive at the directory contents.
            path: format!("{VOLUME_MOUNT}/."),
        };
        let stream = self
            .docker
            .download_from_container(&helper, Some(options))
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let reader = StreamReader::new(stream);

        // The helper is removed when the stream has been drained.
        let docker = self.docker.clone();
        let helper_name = helper.clone();
        let (tx, rx) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut reader = reader;
            let mut tx = tx;
            if let Err(e) = tokio::io::copy(&mut reader, &mut tx).await {
                warn!(error = %e, "streaming volume archive failed");
            }
            drop(tx);
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&helper_name, Some(options)).await {
                warn!(helper = %helper_name, error = %e, "removing volume helper failed");
            }
        });

        Ok(Box::new(rx))
    }
}

struct DockerVolume {
    name: String,
    docker_name: String,
    docker: Docker,
}

#[async_trait]
impl VolumeHandle for DockerVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.docker_name
    }

    async fn cleanup(&self) -> Result<()> {
        self.docker
            .remove_volume(&self.docker_name, Some(RemoveVolumeOptions { force: true }))
            .await
            .map_err(|e| Error::Transient(format!("removing volume {}: {e}", self.name)))
    }
}

struct DockerContainer {
    task_id: String,
    container_name: String,
    docker: Docker,
    status_rx: watch::Receiver<ContainerStatus>,
    cleaned: AtomicBool,
}

impl DockerContainer {
    /// Register a waiter that long-polls the daemon and caches the terminal
    /// state so `status()` never blocks.
    fn track(
        docker: Docker,
        task_id: String,
        container_name: String,
        adopted_exit: Option<i64>,
    ) -> Self {
        let initial = match adopted_exit {
            Some(code) => ContainerStatus::exited(code),
            None => ContainerStatus::running(),
        };
        let (status_tx, status_rx) = watch::channel(initial);

        if adopted_exit.is_none() {
            let waiter_docker = docker.clone();
            let waiter_name = container_name.clone();
            tokio::spawn(async move {
                let options = WaitContainerOptions {
                    condition: "not-running",
                };
                let mut stream = waiter_docker.wait_container(&waiter_name, Some(options));
                let exit_code = match stream.next().await {
                    Some(Ok(response)) => response.status_code,
                    Some(Err(e)) => {
                        warn!(container = %waiter_name, error = %e, "wait failed, falling back to inspect");
                        match waiter_docker.inspect_container(&waiter_name, None).await {
                            Ok(inspect) => inspect
                                .state
                                .and_then(|s| s.exit_code)
                                .unwrap_or(-1),
                            Err(_) => -1,
                        }
                    }
                    None => -1,
                };
                debug!(container = %waiter_name, exit_code, "container stopped");
                let _ = status_tx.send(ContainerStatus::exited(exit_code));
            });
        }

        Self {
            task_id,
            container_name,
            docker,
            status_rx,
            cleaned: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ContainerHandle for DockerContainer {
    fn id(&self) -> &str {
        &self.task_id
    }

    async fn status(&self) -> Result<ContainerStatus> {
        Ok(*self.status_rx.borrow())
    }

    async fn logs(
        &self,
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
        follow: bool,
    ) -> Result<()> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(&self.container_name, Some(options));
        while let Some(result) = stream.next().await {
            match result {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    stdout.write_all(&message).await?;
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.write_all(&message).await?;
                }
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) => {
                    warn!(container = %self.container_name, error = %e, "log stream error");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if !self.status_rx.borrow().is_done {
            if let Err(e) = self
                .docker
                .kill_container(&self.container_name, None::<KillContainerOptions<String>>)
                .await
            {
                warn!(container = %self.container_name, error = %e, "kill before cleanup failed");
            }
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&self.container_name, Some(options))
            .await
            .map_err(|e| Error::Transient(format!("removing container: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> DockerDriver {
        // Name derivation does not need a live daemon.
        let docker = Docker::connect_with_local_defaults().unwrap();
        DockerDriver::with_client(docker, "ns")
    }

    #[test]
    fn names_are_namespaced_and_deterministic() {
        let driver = driver();
        assert_eq!(driver.volume_name("deps"), "conveyor-ns-deps");
        assert_eq!(driver.container_name("abc"), "conveyor-task-abc");
        assert_eq!(driver.container_name("abc"), driver.container_name("abc"));
    }

    #[test]
    fn empty_namespace_volume_names() {
        let docker = Docker::connect_with_local_defaults().unwrap();
        let driver = DockerDriver::with_client(docker, "");
        assert_eq!(driver.volume_name("deps"), "conveyor-deps");
    }
}
