//! Hypervisor-guest driver.
//!
//! Boots one QEMU guest per driver instance: a cloud image overlay, a
//! cloud-init seed ISO carrying the compiled guest agent, user-mode NAT,
//! a virtiofs share for volumes, a vsock channel for the agent, and an
//! entropy device. Volumes are host directories under the share root;
//! tasks bind-mount the virtiofs subpath in the guest and run through the
//! agent.

pub mod agent;
pub mod protocol;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use conveyor_core::{
    ContainerHandle, ContainerStatus, Driver, Dsn, Error, Result, TarStream, TaskSpec,
    VolumeDataAccessor, VolumeHandle,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, OnceCell, watch};
use tracing::{debug, info, warn};

use agent::AgentClient;
use protocol::AgentRequest;

/// Where the virtiofs share lands inside the guest.
const GUEST_SHARE: &str = "/mnt/conveyor";
const VIRTIOFS_TAG: &str = "conveyor";

const DEFAULT_IMAGE_URL: &str =
    "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img";

#[derive(Debug, Clone)]
pub struct QemuConfig {
    pub cache_dir: PathBuf,
    pub memory_mb: u64,
    pub cpus: u32,
    pub cid: u32,
    pub image_url: String,
    pub agent_binary: PathBuf,
    pub boot_timeout: Duration,
}

impl QemuConfig {
    pub fn from_dsn(dsn: &Dsn) -> Result<Self> {
        let cache_dir = dsn
            .param("cache_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("conveyor-qemu"));

        let agent_binary = match dsn.param("agent") {
            Some(path) => PathBuf::from(path),
            None => std::env::current_exe()
                .map_err(|e| Error::Provisioning(format!("locating agent binary: {e}")))?
                .with_file_name("conveyor-guest-agent"),
        };

        let parse_number = |key: &str, default: u64| -> Result<u64> {
            match dsn.param(key) {
                None => Ok(default),
                Some(raw) => raw
                    .parse()
                    .map_err(|_| Error::Validation(format!("invalid {key}={raw:?}"))),
            }
        };

        Ok(Self {
            cache_dir,
            memory_mb: parse_number("memory", 2048)?,
            cpus: parse_number("cpus", 2)? as u32,
            cid: parse_number("cid", 3)? as u32,
            image_url: dsn.param_or("image_url", DEFAULT_IMAGE_URL).to_string(),
            agent_binary,
            boot_timeout: Duration::from_secs(parse_number("boot_timeout", 300)?),
        })
    }
}

struct VmState {
    agent: Arc<AgentClient>,
    qemu: Mutex<Option<Child>>,
    virtiofsd: Mutex<Option<Child>>,
}

pub struct QemuDriver {
    config: QemuConfig,
    work_dir: tempfile::TempDir,
    share_root: PathBuf,
    state: OnceCell<std::result::Result<VmState, String>>,
    volumes: Mutex<HashMap<String, Arc<QemuVolume>>>,
    containers: Mutex<HashMap<String, Arc<QemuContainer>>>,
}

impl QemuDriver {
    pub fn new(config: QemuConfig) -> Result<Self> {
        let work_dir = tempfile::Builder::new()
            .prefix("conveyor-qemu-")
            .tempdir()
            .map_err(|e| Error::Provisioning(format!("creating work dir: {e}")))?;
        let share_root = work_dir.path().join("share");
        std::fs::create_dir_all(&share_root)
            .map_err(|e| Error::Provisioning(format!("creating share root: {e}")))?;
        Ok(Self {
            config,
            work_dir,
            share_root,
            state: OnceCell::new(),
            volumes: Mutex::new(HashMap::new()),
            containers: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_dsn(dsn: &Dsn) -> Result<Self> {
        Self::new(QemuConfig::from_dsn(dsn)?)
    }

    /// Single-flight VM boot; later callers observe the memoized outcome.
    async fn ensure_vm(&self) -> Result<&VmState> {
        let state = self
            .state
            .get_or_init(|| async { self.boot().await.map_err(|e| e.to_string()) })
            .await;
        match state {
            Ok(state) => Ok(state),
            Err(message) => Err(Error::Provisioning(message.clone())),
        }
    }

    async fn boot(&self) -> Result<VmState> {
        let base_image = self.download_base_image().await?;
        let overlay = self.create_overlay(&base_image).await?;
        let seed = self.build_seed_iso().await?;

        let virtiofsd_socket = self.work_dir.path().join("virtiofsd.sock");
        let virtiofsd = self.spawn_virtiofsd(&virtiofsd_socket)?;
        let qemu = self.spawn_qemu(&overlay, &seed, &virtiofsd_socket)?;

        let agent = Arc::new(AgentClient::new(self.config.cid));
        info!(cid = self.config.cid, "waiting for guest agent");
        agent.wait_ready(self.config.boot_timeout).await?;

        // Mount the virtiofs share inside the guest before any task runs.
        let mount = AgentRequest::Exec {
            path: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                format!("mkdir -p {GUEST_SHARE} && mount -t virtiofs {VIRTIOFS_TAG} {GUEST_SHARE}"),
            ],
            env: HashMap::new(),
            stdin_data: None,
        };
        let response = agent.request(&mount).await?;
        if let Some(pid) = response.pid {
            wait_for_exit(&agent, pid, Duration::from_secs(30)).await?;
        }

        info!("guest ready");
        Ok(VmState {
            agent,
            qemu: Mutex::new(Some(qemu)),
            virtiofsd: Mutex::new(Some(virtiofsd)),
        })
    }

    async fn download_base_image(&self) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.config.cache_dir)
            .await
            .map_err(|e| Error::Provisioning(format!("creating image cache: {e}")))?;

        let file_name = self
            .config
            .image_url
            .rsplit('/')
            .next()
            .unwrap_or("base.img");
        let target = self.config.cache_dir.join(file_name);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(target);
        }

        info!(url = %self.config.image_url, "downloading base image");
        let response = reqwest::get(&self.config.image_url)
            .await
            .map_err(|e| Error::Provisioning(format!("downloading base image: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Provisioning(format!("downloading base image: {e}")))?;

        let partial = target.with_extension("partial");
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| Error::Provisioning(format!("creating image file: {e}")))?;
        let mut stream = response.bytes_stream();
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Provisioning(format!("image download: {e}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::Provisioning(format!("writing image: {e}")))?;
        }
        file.flush()
            .await
            .map_err(|e| Error::Provisioning(format!("writing image: {e}")))?;
        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| Error::Provisioning(format!("finishing image download: {e}")))?;
        Ok(target)
    }

    async fn create_overlay(&self, base: &Path) -> Result<PathBuf> {
        let overlay = self.work_dir.path().join("disk.qcow2");
        run_checked(
            Command::new("qemu-img")
                .arg("create")
                .arg("-f")
                .arg("qcow2")
                .arg("-F")
                .arg("qcow2")
                .arg("-b")
                .arg(base)
                .arg(&overlay)
                .arg("20G"),
            "qemu-img create",
        )
        .await?;
        Ok(overlay)
    }

    /// Build the cidata ISO: cloud-init user-data that installs the agent
    /// binary (shipped on the ISO itself) as a systemd unit.
    async fn build_seed_iso(&self) -> Result<PathBuf> {
        let seed_dir = self.work_dir.path().join("seed");
        tokio::fs::create_dir_all(&seed_dir)
            .await
            .map_err(|e| Error::Provisioning(format!("creating seed dir: {e}")))?;

        tokio::fs::copy(&self.config.agent_binary, seed_dir.join("conveyor-guest-agent"))
            .await
            .map_err(|e| {
                Error::Provisioning(format!(
                    "copying agent binary {}: {e}",
                    self.config.agent_binary.display()
                ))
            })?;

        let user_data = r#"#cloud-config
write_files:
  - path: /etc/systemd/system/conveyor-agent.service
    content: |
      [Unit]
      Description=Conveyor guest agent
      After=local-fs.target

      [Service]
      ExecStart=/usr/local/bin/conveyor-guest-agent
      Restart=always

      [Install]
      WantedBy=multi-user.target
runcmd:
  - mkdir -p /media/cidata
  - mount -o ro /dev/disk/by-label/cidata /media/cidata || true
  - cp /media/cidata/conveyor-guest-agent /usr/local/bin/conveyor-guest-agent
  - chmod +x /usr/local/bin/conveyor-guest-agent
  - systemctl daemon-reload
  - systemctl enable --now conveyor-agent.service
"#;
        tokio::fs::write(seed_dir.join("user-data"), user_data)
            .await
            .map_err(|e| Error::Provisioning(format!("writing user-data: {e}")))?;
        tokio::fs::write(
            seed_dir.join("meta-data"),
            "instance-id: conveyor-guest\nlocal-hostname: conveyor-guest\n",
        )
        .await
        .map_err(|e| Error::Provisioning(format!("writing meta-data: {e}")))?;

        let iso = self.work_dir.path().join("seed.iso");
        run_checked(
            Command::new("genisoimage")
                .arg("-output")
                .arg(&iso)
                .arg("-volid")
                .arg("cidata")
                .arg("-joliet")
                .arg("-rock")
                .arg(seed_dir.join("user-data"))
                .arg(seed_dir.join("meta-data"))
                .arg(seed_dir.join("conveyor-guest-agent")),
            "genisoimage",
        )
        .await?;
        Ok(iso)
    }

    fn spawn_virtiofsd(&self, socket: &Path) -> Result<Child> {
        let mut command = Command::new("/usr/libexec/virtiofsd");
        command
            .arg("--socket-path")
            .arg(socket)
            .arg("--shared-dir")
            .arg(&self.share_root)
            .arg("--cache")
            .arg("auto")
            .kill_on_drop(true);
        command
            .spawn()
            .map_err(|e| Error::Provisioning(format!("spawning virtiofsd: {e}")))
    }

    fn spawn_qemu(&self, overlay: &Path, seed: &Path, virtiofsd_socket: &Path) -> Result<Child> {
        let memory = format!("{}M", self.config.memory_mb);
        let mut command = Command::new("qemu-system-x86_64");
        command
            .arg("-machine")
            .arg("q35,accel=kvm:tcg")
            .arg("-m")
            .arg(&memory)
            .arg("-smp")
            .arg(self.config.cpus.to_string())
            .arg("-drive")
            .arg(format!("file={},if=virtio,format=qcow2", overlay.display()))
            .arg("-drive")
            .arg(format!(
                "file={},if=virtio,format=raw,readonly=on",
                seed.display()
            ))
            .arg("-netdev")
            .arg("user,id=net0")
            .arg("-device")
            .arg("virtio-net-pci,netdev=net0")
            // Shared memory backing is required for vhost-user-fs.
            .arg("-object")
            .arg(format!("memory-backend-memfd,id=mem,size={memory},share=on"))
            .arg("-numa")
            .arg("node,memdev=mem")
            .arg("-chardev")
            .arg(format!(
                "socket,id=virtiofs0,path={}",
                virtiofsd_socket.display()
            ))
            .arg("-device")
            .arg(format!("vhost-user-fs-pci,chardev=virtiofs0,tag={VIRTIOFS_TAG}"))
            .arg("-device")
            .arg(format!("vhost-vsock-pci,guest-cid={}", self.config.cid))
            .arg("-device")
            .arg("virtio-rng-pci")
            .arg("-display")
            .arg("none")
            .kill_on_drop(true);

        debug!(?command, "starting qemu");
        command
            .spawn()
            .map_err(|e| Error::Provisioning(format!("spawning qemu: {e}")))
    }

    fn host_volume_dir(&self, name: &str) -> PathBuf {
        self.share_root.join(name)
    }

    fn guest_volume_path(name: &str) -> String {
        format!("{GUEST_SHARE}/{name}")
    }
}

#[async_trait]
impl Driver for QemuDriver {
    fn name(&self) -> &str {
        "qemu"
    }

    async fn create_volume(&self, name: &str, _size_hint_gb: u32) -> Result<Arc<dyn VolumeHandle>> {
        self.ensure_vm().await?;

        let mut volumes = self.volumes.lock().await;
        if let Some(existing) = volumes.get(name) {
            return Ok(existing.clone() as Arc<dyn VolumeHandle>);
        }

        let dir = self.host_volume_dir(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Provisioning(format!("creating volume {name}: {e}")))?;

        let volume = Arc::new(QemuVolume {
            name: name.to_string(),
            host_dir: dir.to_string_lossy().into_owned(),
        });
        volumes.insert(name.to_string(), volume.clone());
        Ok(volume as Arc<dyn VolumeHandle>)
    }

    async fn run_container(&self, task: TaskSpec) -> Result<Arc<dyn ContainerHandle>> {
        let state = self.ensure_vm().await?;

        let mut containers = self.containers.lock().await;
        if let Some(existing) = containers.get(&task.id) {
            return Ok(existing.clone() as Arc<dyn ContainerHandle>);
        }

        // Bind-mount each requested volume subpath into place first.
        for mount in &task.mounts {
            let script = format!(
                "mkdir -p {target} && mountpoint -q {target} || mount --bind {source} {target}",
                source = Self::guest_volume_path(&mount.name),
                target = mount.path,
            );
            let request = AgentRequest::Exec {
                path: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), script],
                env: HashMap::new(),
                stdin_data: None,
            };
            let response = state.agent.request(&request).await?;
            if let Some(pid) = response.pid {
                let exit = wait_for_exit(&state.agent, pid, Duration::from_secs(30)).await?;
                if exit != 0 {
                    return Err(Error::Provisioning(format!(
                        "bind-mounting {} failed with exit {exit}",
                        mount.path
                    )));
                }
            }
        }

        let request = AgentRequest::Exec {
            path: task.command.path.clone(),
            args: task.command.args.clone(),
            env: task.env.clone(),
            stdin_data: task
                .stdin
                .as_ref()
                .map(|data| BASE64.encode(data.as_bytes())),
        };
        let response = state.agent.request(&request).await?;
        let pid = response
            .pid
            .ok_or_else(|| Error::Transient("agent exec returned no pid".into()))?;

        let container = Arc::new(QemuContainer::track(
            task.id.clone(),
            pid,
            state.agent.clone(),
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
        if let Some(Ok(state)) = self.state.get() {
            if let Some(mut qemu) = state.qemu.lock().await.take() {
                let _ = qemu.start_kill();
                let _ = qemu.wait().await;
            }
            if let Some(mut virtiofsd) = state.virtiofsd.lock().await.take() {
                let _ = virtiofsd.start_kill();
                let _ = virtiofsd.wait().await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeDataAccessor for QemuDriver {
    async fn copy_to_volume(&self, name: &str, data: TarStream) -> Result<()> {
        let dir = self.host_volume_dir(name);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(Error::NotFound(format!("volume {name}")));
        }
        crate::tarfs::unpack_into(&dir, data).await
    }

    async fn copy_from_volume(&self, name: &str) -> Result<TarStream> {
        let dir = self.host_volume_dir(name);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(Error::NotFound(format!("volume {name}")));
        }
        Ok(crate::tarfs::pack_dir(&dir))
    }
}

struct QemuVolume {
    name: String,
    host_dir: String,
}

#[async_trait]
impl VolumeHandle for QemuVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.host_dir
    }

    async fn cleanup(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.host_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Transient(format!("removing volume {}: {e}", self.name))),
        }
    }
}

#[derive(Debug, Clone)]
enum LogLine {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

struct QemuContainer {
    id: String,
    pid: u32,
    agent: Arc<AgentClient>,
    logs: Arc<std::sync::Mutex<Vec<LogLine>>>,
    status_rx: watch::Receiver<ContainerStatus>,
    cleaned: AtomicBool,
}

impl QemuContainer {
    fn track(id: String, pid: u32, agent: Arc<AgentClient>) -> Self {
        let logs = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (status_tx, status_rx) = watch::channel(ContainerStatus::running());

        let poll_agent = agent.clone();
        let poll_logs = logs.clone();
        tokio::spawn(async move {
            loop {
                match poll_agent.request(&AgentRequest::ExecStatus { pid }).await {
                    Ok(status) => {
                        append_output(&poll_logs, &status.stdout, &status.stderr);
                        if status.exited.unwrap_or(false) {
                            let exit_code = status.exit_code.unwrap_or(-1);
                            debug!(pid, exit_code, "guest process finished");
                            let _ = status_tx.send(ContainerStatus::exited(exit_code));
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(pid, error = %e, "agent status poll failed");
                    }
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });

        Self {
            id,
            pid,
            agent,
            logs,
            status_rx,
            cleaned: AtomicBool::new(false),
        }
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
                LogLine::Stdout(bytes) => stdout.write_all(bytes).await?,
                LogLine::Stderr(bytes) => stderr.write_all(bytes).await?,
            }
        }
        Ok(from + lines.len())
    }
}

#[async_trait]
impl ContainerHandle for QemuContainer {
    fn id(&self) -> &str {
        &self.id
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
        let mut cursor = self.write_logs_from(0, stdout, stderr).await?;
        if !follow {
            return Ok(());
        }

        let mut status_rx = self.status_rx.clone();
        loop {
            if status_rx.borrow().is_done {
                self.write_logs_from(cursor, stdout, stderr).await?;
                return Ok(());
            }
            tokio::select! {
                _ = status_rx.changed() => {}
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
            cursor = self.write_logs_from(cursor, stdout, stderr).await?;
        }
    }

    async fn cleanup(&self) -> Result<()> {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if !self.status_rx.borrow().is_done {
            let kill = AgentRequest::Exec {
                path: "/bin/kill".to_string(),
                args: vec!["-9".to_string(), self.pid.to_string()],
                env: HashMap::new(),
                stdin_data: None,
            };
            if let Err(e) = self.agent.request(&kill).await {
                warn!(pid = self.pid, error = %e, "killing guest process failed");
            }
        }
        Ok(())
    }
}

fn append_output(
    logs: &Arc<std::sync::Mutex<Vec<LogLine>>>,
    stdout: &Option<String>,
    stderr: &Option<String>,
) {
    let mut logs = logs.lock().unwrap();
    if let Some(encoded) = stdout {
        if let Ok(bytes) = BASE64.decode(encoded) {
            if !bytes.is_empty() {
                logs.push(LogLine::Stdout(bytes));
            }
        }
    }
    if let Some(encoded) = stderr {
        if let Ok(bytes) = BASE64.decode(encoded) {
            if !bytes.is_empty() {
                logs.push(LogLine::Stderr(bytes));
            }
        }
    }
}

async fn wait_for_exit(agent: &AgentClient, pid: u32, deadline: Duration) -> Result<i64> {
    let started = tokio::time::Instant::now();
    loop {
        let status = agent.request(&AgentRequest::ExecStatus { pid }).await?;
        if status.exited.unwrap_or(false) {
            return Ok(status.exit_code.unwrap_or(-1));
        }
        if started.elapsed() > deadline {
            return Err(Error::Timeout(format!("guest pid {pid} still running")));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn run_checked(command: &mut Command, label: &str) -> Result<()> {
    let output = command
        .output()
        .await
        .map_err(|e| Error::Provisioning(format!("{label}: {e}")))?;
    if !output.status.success() {
        return Err(Error::Provisioning(format!(
            "{label} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}
