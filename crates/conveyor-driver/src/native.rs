//! Local-process driver.
//!
//! Tasks run as plain processes inside a per-task sandbox directory;
//! volumes are directories symlinked into the sandbox at their mount
//! paths. No images, no isolation beyond the filesystem layout; this is
//! the development and test back-end.

use async_trait::async_trait;
use conveyor_core::{
    ContainerHandle, ContainerStatus, Driver, Error, Result, TarStream, TaskSpec,
    VolumeDataAccessor, VolumeHandle,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, oneshot, watch};
use tracing::{debug, warn};

pub struct NativeDriver {
    root: tempfile::TempDir,
    volumes: Mutex<HashMap<String, Arc<NativeVolume>>>,
    containers: Mutex<HashMap<String, Arc<NativeContainer>>>,
}

impl NativeDriver {
    pub fn new() -> Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("conveyor-native-")
            .tempdir()
            .map_err(|e| Error::Provisioning(format!("creating sandbox root: {e}")))?;
        Ok(Self {
            root,
            volumes: Mutex::new(HashMap::new()),
            containers: Mutex::new(HashMap::new()),
        })
    }

    async fn volume_dir(&self, name: &str) -> Result<PathBuf> {
        let volumes = self.volumes.lock().await;
        volumes
            .get(name)
            .map(|v| PathBuf::from(v.path()))
            .ok_or_else(|| Error::NotFound(format!("volume {name}")))
    }
}

#[async_trait]
impl Driver for NativeDriver {
    fn name(&self) -> &str {
        "native"
    }

    async fn create_volume(&self, name: &str, _size_hint_gb: u32) -> Result<Arc<dyn VolumeHandle>> {
        let mut volumes = self.volumes.lock().await;
        if let Some(existing) = volumes.get(name) {
            return Ok(existing.clone() as Arc<dyn VolumeHandle>);
        }

        let dir = self.root.path().join("volumes").join(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Provisioning(format!("creating volume {name}: {e}")))?;

        let volume = Arc::new(NativeVolume {
            name: name.to_string(),
            dir: dir.to_string_lossy().into_owned(),
        });
        volumes.insert(name.to_string(), volume.clone());
        Ok(volume as Arc<dyn VolumeHandle>)
    }

    async fn run_container(&self, task: TaskSpec) -> Result<Arc<dyn ContainerHandle>> {
        let mut containers = self.containers.lock().await;
        if let Some(existing) = containers.get(&task.id) {
            return Ok(existing.clone() as Arc<dyn ContainerHandle>);
        }

        let sandbox = self.root.path().join("tasks").join(&task.id);
        tokio::fs::create_dir_all(&sandbox)
            .await
            .map_err(|e| Error::Provisioning(format!("creating sandbox for {}: {e}", task.id)))?;

        // Materialize mounts as symlinks into the volume directories.
        for mount in &task.mounts {
            let volume_dir = self.volume_dir(&mount.name).await?;
            let target = sandbox.join(mount.path.trim_start_matches('/'));
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::Provisioning(format!("mount {}: {e}", mount.path)))?;
            }
            match tokio::fs::symlink(&volume_dir, &target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(Error::Provisioning(format!("mount {}: {e}", mount.path)));
                }
            }
        }

        let container = NativeContainer::launch(&task, &sandbox).await?;
        let container = Arc::new(container);
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
        // Volume directories live under the temp root and vanish with it.
        Ok(())
    }
}

#[async_trait]
impl VolumeDataAccessor for NativeDriver {
    async fn copy_to_volume(&self, name: &str, data: TarStream) -> Result<()> {
        let dir = self.volume_dir(name).await?;
        crate::tarfs::unpack_into(&dir, data).await
    }

    async fn copy_from_volume(&self, name: &str) -> Result<TarStream> {
        let dir = self.volume_dir(name).await?;
        Ok(crate::tarfs::pack_dir(&dir))
    }
}

struct NativeVolume {
    name: String,
    dir: String,
}

#[async_trait]
impl VolumeHandle for NativeVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.dir
    }

    async fn cleanup(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Transient(format!("removing volume {}: {e}", self.name))),
        }
    }
}

#[derive(Debug, Clone)]
enum LogLine {
    Stdout(String),
    Stderr(String),
}

struct NativeContainer {
    id: String,
    sandbox: PathBuf,
    logs: Arc<std::sync::Mutex<Vec<LogLine>>>,
    status_rx: watch::Receiver<ContainerStatus>,
    kill_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    cleaned: std::sync::atomic::AtomicBool,
}

impl NativeContainer {
    async fn launch(task: &TaskSpec, sandbox: &Path) -> Result<Self> {
        let mut command = tokio::process::Command::new(&task.command.path);
        command
            .args(&task.command.args)
            .envs(&task.env)
            .current_dir(sandbox)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if task.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Provisioning(format!("spawning {}: {e}", task.command.path)))?;

        if let Some(stdin_data) = &task.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let data = stdin_data.clone();
                tokio::spawn(async move {
                    let _ = stdin.write_all(data.as_bytes()).await;
                });
            }
        }

        let logs = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (status_tx, status_rx) = watch::channel(ContainerStatus::running());
        let (kill_tx, kill_rx) = oneshot::channel();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_logs = logs.clone();
        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    stdout_logs.lock().unwrap().push(LogLine::Stdout(line));
                }
            }
        });

        let stderr_logs = logs.clone();
        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    stderr_logs.lock().unwrap().push(LogLine::Stderr(line));
                }
            }
        });

        let task_id = task.id.clone();
        tokio::spawn(async move {
            let mut kill_rx = kill_rx;
            let exit = tokio::select! {
                status = child.wait() => status,
                _ = &mut kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            // Drain the log readers before publishing the terminal state so
            // a non-follow Logs() after completion sees everything.
            let _ = stdout_task.await;
            let _ = stderr_task.await;

            let exit_code = match exit {
                Ok(status) => status.code().unwrap_or(-1) as i64,
                Err(e) => {
                    warn!(task = %task_id, error = %e, "waiting for process failed");
                    -1
                }
            };
            debug!(task = %task_id, exit_code, "process finished");
            let _ = status_tx.send(ContainerStatus::exited(exit_code));
        });

        Ok(Self {
            id: task.id.clone(),
            sandbox: sandbox.to_path_buf(),
            logs,
            status_rx,
            kill_tx: std::sync::Mutex::new(Some(kill_tx)),
            cleaned: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn snapshot(&self) -> ContainerStatus {
        *self.status_rx.borrow()
    }

    async fn write_logs_from(
        &self,
        from: usize,
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<usize> {
        let lines: Vec<LogLine> = {
            let logs = self.logs.lock().unwrap();
            logs[from.min(logs.len())..].to_vec()
        };
        for line in &lines {
            match line {
                LogLine::Stdout(text) => {
                    stdout.write_all(text.as_bytes()).await?;
                    stdout.write_all(b"\n").await?;
                }
                LogLine::Stderr(text) => {
                    stderr.write_all(text.as_bytes()).await?;
                    stderr.write_all(b"\n").await?;
                }
            }
        }
        Ok(from + lines.len())
    }
}

#[async_trait]
impl ContainerHandle for NativeContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn status(&self) -> Result<ContainerStatus> {
        Ok(self.snapshot())
    }

    async fn logs(
        &self,
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
        follow: bool,
    ) -> Result<()> {
        let mut cursor = self.write_logs_from(0, stdout, stderr).await?;
        if !follow {
            return Ok(());
        }

        let mut status_rx = self.status_rx.clone();
        loop {
            if self.snapshot().is_done {
                cursor = self.write_logs_from(cursor, stdout, stderr).await?;
                return Ok(());
            }
            tokio::select! {
                _ = status_rx.changed() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
            }
            cursor = self.write_logs_from(cursor, stdout, stderr).await?;
        }
    }

    async fn cleanup(&self) -> Result<()> {
        if self.cleaned.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }

        if !self.snapshot().is_done {
            if let Some(kill) = self.kill_tx.lock().unwrap().take() {
                let _ = kill.send(());
            }
            let mut status_rx = self.status_rx.clone();
            while !status_rx.borrow().is_done {
                if status_rx.changed().await.is_err() {
                    break;
                }
            }
        }

        match tokio::fs::remove_dir_all(&self.sandbox).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Transient(format!("removing sandbox: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::{Command, Mount};
    use std::collections::HashMap;
    use tokio::io::AsyncReadExt;

    fn task(id: &str, path: &str, args: &[&str]) -> TaskSpec {
        TaskSpec {
            id: id.to_string(),
            image: String::new(),
            command: Command {
                path: path.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
            },
            env: HashMap::new(),
            mounts: Vec::new(),
            limits: Default::default(),
            stdin: None,
        }
    }

    async fn wait_done(container: &Arc<dyn ContainerHandle>) -> ContainerStatus {
        loop {
            let status = container.status().await.unwrap();
            if status.is_done {
                return status;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn runs_a_process_and_reports_exit_code() {
        let driver = NativeDriver::new().unwrap();
        let container = driver
            .run_container(task("t1", "sh", &["-c", "exit 7"]))
            .await
            .unwrap();
        let status = wait_done(&container).await;
        assert_eq!(status.exit_code, 7);
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr_separately() {
        let driver = NativeDriver::new().unwrap();
        let container = driver
            .run_container(task("t1", "sh", &["-c", "echo out; echo err >&2"]))
            .await
            .unwrap();
        wait_done(&container).await;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        container.logs(&mut stdout, &mut stderr, false).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&stderr), "err\n");
    }

    #[tokio::test]
    async fn follow_logs_until_terminal() {
        let driver = NativeDriver::new().unwrap();
        let container = driver
            .run_container(task("t1", "sh", &["-c", "echo one; sleep 0.2; echo two"]))
            .await
            .unwrap();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        container.logs(&mut stdout, &mut stderr, true).await.unwrap();
        let text = String::from_utf8_lossy(&stdout);
        assert!(text.contains("one"));
        assert!(text.contains("two"));
        assert!(container.status().await.unwrap().is_done);
    }

    #[tokio::test]
    async fn stdin_is_piped_to_the_process() {
        let driver = NativeDriver::new().unwrap();
        let mut spec = task("t1", "cat", &[]);
        spec.stdin = Some("from stdin".to_string());
        let container = driver.run_container(spec).await.unwrap();
        wait_done(&container).await;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        container.logs(&mut stdout, &mut stderr, false).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&stdout), "from stdin\n");
    }

    #[tokio::test]
    async fn same_task_id_returns_the_same_container() {
        let driver = NativeDriver::new().unwrap();
        let first = driver
            .run_container(task("t1", "sh", &["-c", "exit 3"]))
            .await
            .unwrap();
        let second = driver
            .run_container(task("t1", "sh", &["-c", "exit 99"]))
            .await
            .unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(wait_done(&first).await.exit_code, wait_done(&second).await.exit_code);
    }

    #[tokio::test]
    async fn volume_handles_are_reused_by_name() {
        let driver = NativeDriver::new().unwrap();
        let first = driver.create_volume("v", 1).await.unwrap();
        let second = driver.create_volume("v", 1).await.unwrap();
        assert_eq!(first.name(), second.name());
        assert_eq!(first.path(), second.path());
    }

    #[tokio::test]
    async fn mounts_expose_volume_contents() {
        let driver = NativeDriver::new().unwrap();
        let volume = driver.create_volume("data", 1).await.unwrap();
        tokio::fs::write(Path::new(volume.path()).join("hello.txt"), "hi")
            .await
            .unwrap();

        let mut spec = task("t1", "cat", &["data/hello.txt"]);
        spec.mounts = vec![Mount {
            name: "data".to_string(),
            path: "data".to_string(),
        }];
        let container = driver.run_container(spec).await.unwrap();
        let status = wait_done(&container).await;
        assert_eq!(status.exit_code, 0);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        container.logs(&mut stdout, &mut stderr, false).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&stdout), "hi\n");
    }

    #[tokio::test]
    async fn cleanup_kills_running_processes_and_is_idempotent() {
        let driver = NativeDriver::new().unwrap();
        let container = driver
            .run_container(task("t1", "sleep", &["30"]))
            .await
            .unwrap();
        container.cleanup().await.unwrap();
        assert!(container.status().await.unwrap().is_done);
        container.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn volume_tar_round_trip() {
        let driver = NativeDriver::new().unwrap();
        driver.create_volume("src", 1).await.unwrap();
        let src = driver.volume_dir("src").await.unwrap();
        tokio::fs::write(src.join("a.txt"), b"alpha").await.unwrap();
        tokio::fs::create_dir_all(src.join("nested")).await.unwrap();
        tokio::fs::write(src.join("nested/b.txt"), b"beta").await.unwrap();

        let accessor = driver.volume_data().unwrap();
        let mut stream = accessor.copy_from_volume("src").await.unwrap();
        let mut archive = Vec::new();
        stream.read_to_end(&mut archive).await.unwrap();

        driver.create_volume("dst", 1).await.unwrap();
        accessor
            .copy_to_volume("dst", Box::new(std::io::Cursor::new(archive)))
            .await
            .unwrap();

        let dst = driver.volume_dir("dst").await.unwrap();
        assert_eq!(tokio::fs::read(dst.join("a.txt")).await.unwrap(), b"alpha");
        assert_eq!(
            tokio::fs::read(dst.join("nested/b.txt")).await.unwrap(),
            b"beta"
        );
    }
}
