//! Fly.io machine-per-task driver.
//!
//! Every task becomes one micro-VM. Volumes are Fly volumes and attach to
//! at most one machine at a time; attaching a volume elsewhere destroys
//! the machine currently holding it. Volume data moves through a small
//! helper machine running sshd, reached over a userspace WireGuard tunnel,
//! and the helper is suspended between operations so resume stays warm.

pub mod api;
pub mod tunnel;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use boringtun::x25519::{PublicKey, StaticSecret};
use conveyor_core::{
    ContainerHandle, ContainerStatus, Driver, Dsn, Error, Result, TarStream, TaskSpec,
    VolumeDataAccessor, VolumeHandle,
};
use russh::keys::PrivateKey;
use serde_json::json;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{Mutex, OnceCell, watch};
use tracing::{debug, info, warn};

use crate::ssh::{self, SshSession};
use api::FlyClient;
use tunnel::WgTunnel;

const HELPER_IMAGE: &str = "alpine:latest";
const HELPER_SSH_PORT: u16 = 2222;
const WIREGUARD_PORT: u16 = 51820;

struct FlyInner {
    api: FlyClient,
    namespace: String,
    region: String,
    org: String,
    ssh_key: PrivateKey,
    volumes: Mutex<HashMap<String, Arc<FlyVolumeHandle>>>,
    /// volume id -> machine id currently holding the attachment.
    attachments: Mutex<HashMap<String, String>>,
    /// volume name -> suspended helper machine id.
    helpers: Mutex<HashMap<String, String>>,
    containers: Mutex<HashMap<String, Arc<FlyContainer>>>,
    tunnel: OnceCell<std::result::Result<Arc<WgTunnel>, String>>,
}

pub struct FlyDriver {
    inner: Arc<FlyInner>,
}

impl FlyDriver {
    pub fn from_dsn(dsn: &Dsn) -> Result<Self> {
        let token = dsn
            .param("token")
            .ok_or_else(|| Error::Validation("fly driver requires token=".into()))?;
        let app = dsn
            .param("app")
            .ok_or_else(|| Error::Validation("fly driver requires app=".into()))?;

        Ok(Self {
            inner: Arc::new(FlyInner {
                api: FlyClient::new(token, app),
                namespace: dsn.namespace().to_string(),
                region: dsn.param_or("region", "iad").to_string(),
                org: dsn.param_or("org", "personal").to_string(),
                ssh_key: ssh::generate_keypair()?,
                volumes: Mutex::new(HashMap::new()),
                attachments: Mutex::new(HashMap::new()),
                helpers: Mutex::new(HashMap::new()),
                containers: Mutex::new(HashMap::new()),
                tunnel: OnceCell::new(),
            }),
        })
    }
}

impl FlyInner {
    fn volume_fly_name(&self, name: &str) -> String {
        // Fly volume names only allow [a-z0-9_].
        let sanitized: String = format!("conveyor_{}_{name}", self.namespace)
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        sanitized
    }

    fn task_machine_name(task_id: &str) -> String {
        format!("conveyor-task-{task_id}")
    }

    fn helper_machine_name(&self, volume: &str) -> String {
        format!("conveyor-helper-{}-{volume}", self.namespace)
    }

    async fn volume_id(&self, name: &str) -> Result<String> {
        let volumes = self.volumes.lock().await;
        volumes
            .get(name)
            .map(|v| v.volume_id.clone())
            .ok_or_else(|| Error::NotFound(format!("volume {name}")))
    }

    /// Detach a volume by destroying whatever machine currently holds it.
    /// Callers hold the attachments lock.
    async fn evict_attachment(
        &self,
        attachments: &mut HashMap<String, String>,
        volume_id: &str,
    ) -> Result<()> {
        if let Some(machine_id) = attachments.remove(volume_id) {
            info!(machine = %machine_id, volume = %volume_id, "destroying machine holding volume");
            self.api.destroy_machine(&machine_id).await?;
            self.helpers.lock().await.retain(|_, id| *id != machine_id);
        }
        Ok(())
    }

    /// Single-flight WireGuard bring-up for the whole driver instance.
    async fn ensure_tunnel(&self) -> Result<Arc<WgTunnel>> {
        let result = self
            .tunnel
            .get_or_init(|| async {
                self.open_tunnel().await.map_err(|e| e.to_string())
            })
            .await;
        match result {
            Ok(tunnel) => Ok(tunnel.clone()),
            Err(message) => Err(Error::Provisioning(message.clone())),
        }
    }

    async fn open_tunnel(&self) -> Result<Arc<WgTunnel>> {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        let peer = self
            .api
            .add_wireguard_peer(
                &self.org,
                &self.region,
                &format!("conveyor-{}", crate::remote::random_suffix(8)),
                &BASE64.encode(public.as_bytes()),
            )
            .await?;

        let gateway_bytes: [u8; 32] = BASE64
            .decode(&peer.gateway_public_key)
            .map_err(|e| Error::Provisioning(format!("gateway key: {e}")))?
            .try_into()
            .map_err(|_| Error::Provisioning("gateway key has wrong length".into()))?;
        let endpoint_ip: IpAddr = peer
            .endpoint_ip
            .parse()
            .map_err(|e| Error::Provisioning(format!("gateway endpoint: {e}")))?;

        WgTunnel::open(
            secret,
            PublicKey::from(gateway_bytes),
            SocketAddr::new(endpoint_ip, WIREGUARD_PORT),
            peer.local_ip,
        )
        .await
    }

    /// Boot or resume the helper machine for `volume`, returning its id
    /// and private address.
    ///
    /// Lock order is always attachments before helpers; the helpers lock
    /// is never held across an eviction.
    async fn ensure_helper(&self, volume: &str) -> Result<(String, Ipv6Addr)> {
        let volume_id = self.volume_id(volume).await?;

        let existing = {
            let helpers = self.helpers.lock().await;
            helpers.get(&self.helper_machine_name(volume)).cloned()
        };
        if let Some(machine_id) = existing {
            debug!(machine = %machine_id, "resuming suspended helper");
            if let Err(e) = self.api.start_machine(&machine_id).await {
                warn!(machine = %machine_id, error = %e, "helper resume failed, recreating");
                self.helpers.lock().await.retain(|_, id| *id != machine_id);
                let _ = self.api.destroy_machine(&machine_id).await;
            } else {
                self.api.wait_machine(&machine_id, "started").await?;
                let machine = self.api.get_machine(&machine_id).await?;
                return Ok((machine_id, machine.private_ipv6()?));
            }
        }

        // The helper takes the attachment, so anything else holding the
        // volume goes away first.
        {
            let mut attachments = self.attachments.lock().await;
            self.evict_attachment(&mut attachments, &volume_id).await?;
        }

        let authorized_key = ssh::public_openssh(&self.ssh_key)?;
        let init_script = format!(
            "apk add --no-cache openssh-server && ssh-keygen -A && \
             mkdir -p /root/.ssh && echo \"$AUTHORIZED_KEY\" > /root/.ssh/authorized_keys && \
             exec /usr/sbin/sshd -D -e -p {HELPER_SSH_PORT} -o PermitRootLogin=prohibit-password"
        );
        let config = json!({
            "image": HELPER_IMAGE,
            "guest": { "cpus": 1, "memory_mb": 256, "cpu_kind": "shared" },
            "env": { "AUTHORIZED_KEY": authorized_key },
            "init": { "exec": ["/bin/sh", "-c", init_script] },
            "mounts": [{ "volume": volume_id, "path": "/data" }],
            "restart": { "policy": "no" },
        });

        let name = self.helper_machine_name(volume);
        info!(helper = %name, volume = %volume, "creating volume helper machine");
        let machine = self.api.create_machine(&name, config, &self.region).await?;
        self.api.wait_machine(&machine.id, "started").await?;

        self.attachments
            .lock()
            .await
            .insert(volume_id, machine.id.clone());
        self.helpers.lock().await.insert(name, machine.id.clone());

        let machine = self.api.get_machine(&machine.id).await?;
        let address = machine.private_ipv6()?;
        Ok((machine.id.clone(), address))
    }

    /// SSH to a helper through the tunnel, retrying while sshd installs.
    async fn helper_session(&self, address: Ipv6Addr) -> Result<SshSession> {
        let tunnel = self.ensure_tunnel().await?;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
        loop {
            let stream = tunnel.connect_tcp(address, HELPER_SSH_PORT).await?;
            match SshSession::connect_over(stream, "root", &self.ssh_key).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(e);
                    }
                    debug!(error = %e, "helper sshd not ready yet");
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
            }
        }
    }

    fn suspend_helper_later(self: &Arc<Self>, machine_id: String) {
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.api.suspend_machine(&machine_id).await {
                warn!(machine = %machine_id, error = %e, "suspending helper failed");
            }
        });
    }
}

#[async_trait]
impl Driver for FlyDriver {
    fn name(&self) -> &str {
        "fly"
    }

    async fn create_volume(&self, name: &str, size_hint_gb: u32) -> Result<Arc<dyn VolumeHandle>> {
        let inner = &self.inner;
        let mut volumes = inner.volumes.lock().await;
        if let Some(existing) = volumes.get(name) {
            return Ok(existing.clone() as Arc<dyn VolumeHandle>);
        }

        let fly_volume = inner
            .api
            .create_volume(&inner.volume_fly_name(name), size_hint_gb.max(1), &inner.region)
            .await?;

        let handle = Arc::new(FlyVolumeHandle {
            name: name.to_string(),
            volume_id: fly_volume.id,
            inner: inner.clone(),
        });
        volumes.insert(name.to_string(), handle.clone());
        Ok(handle as Arc<dyn VolumeHandle>)
    }

    async fn run_container(&self, task: TaskSpec) -> Result<Arc<dyn ContainerHandle>> {
        let inner = &self.inner;
        if task.stdin.is_some() {
            return Err(Error::Validation(
                "the fly driver does not support task stdin".into(),
            ));
        }

        let mut containers = inner.containers.lock().await;
        if let Some(existing) = containers.get(&task.id) {
            return Ok(existing.clone() as Arc<dyn ContainerHandle>);
        }

        // Take every requested attachment, destroying current holders.
        let mut mounts = Vec::new();
        {
            let mut attachments = inner.attachments.lock().await;
            for mount in &task.mounts {
                let volume_id = inner.volume_id(&mount.name).await?;
                inner.evict_attachment(&mut attachments, &volume_id).await?;
                mounts.push(json!({ "volume": volume_id, "path": mount.path }));
            }
        }

        let mut exec = vec![task.command.path.clone()];
        exec.extend(task.command.args.iter().cloned());
        let config = json!({
            "image": task.image,
            "guest": {
                "cpus": task.limits.cpus.unwrap_or(1),
                "memory_mb": task.limits.memory_mb.unwrap_or(256),
                "cpu_kind": "shared",
            },
            "env": task.env,
            "init": { "exec": exec },
            "mounts": mounts,
            "restart": { "policy": "no" },
        });

        let machine_name = FlyInner::task_machine_name(&task.id);
        let machine = match inner
            .api
            .create_machine(&machine_name, config, &inner.region)
            .await
        {
            Ok(machine) => machine,
            Err(create_err) => {
                // Idempotent relaunch: adopt a machine of the same name,
                // including its exit code if it already finished.
                match inner.api.find_machine_by_name(&machine_name).await? {
                    Some(existing) => {
                        info!(machine = %existing.id, "adopted existing machine");
                        existing
                    }
                    None => return Err(create_err),
                }
            }
        };

        {
            let mut attachments = inner.attachments.lock().await;
            for mount in &task.mounts {
                let volume_id = inner.volume_id(&mount.name).await?;
                attachments.insert(volume_id, machine.id.clone());
            }
        }

        let container = Arc::new(FlyContainer::track(
            task.id.clone(),
            machine,
            inner.clone(),
        ));
        containers.insert(task.id.clone(), container.clone());
        Ok(container as Arc<dyn ContainerHandle>)
    }

    async fn get_container(&self, id: &str) -> Result<Arc<dyn ContainerHandle>> {
        let containers = self.inner.containers.lock().await;
        containers
            .get(id)
            .map(|c| c.clone() as Arc<dyn ContainerHandle>)
            .ok_or_else(|| Error::NotFound(format!("container {id}")))
    }

    fn volume_data(&self) -> Option<&dyn VolumeDataAccessor> {
        Some(self)
    }

    async fn close(&self) -> Result<()> {
        let inner = &self.inner;

        let containers: Vec<_> = inner.containers.lock().await.values().cloned().collect();
        for container in containers {
            if let Err(e) = container.cleanup().await {
                warn!(container = %container.id(), error = %e, "cleanup during close failed");
            }
        }

        let helpers: Vec<String> = inner.helpers.lock().await.values().cloned().collect();
        for machine_id in helpers {
            if let Err(e) = inner.api.destroy_machine(&machine_id).await {
                warn!(machine = %machine_id, error = %e, "destroying helper failed");
            }
        }
        inner.helpers.lock().await.clear();

        if let Some(Ok(tunnel)) = inner.tunnel.get() {
            tunnel.close();
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeDataAccessor for FlyDriver {
    async fn copy_to_volume(&self, name: &str, data: TarStream) -> Result<()> {
        let inner = &self.inner;
        let (machine_id, address) = inner.ensure_helper(name).await?;
        let session = inner.helper_session(address).await?;

        let exit = session
            .exec_with_stdin("tar -xpf - -C /data", data)
            .await?;
        session.close().await;
        inner.suspend_helper_later(machine_id);

        if exit != 0 {
            return Err(Error::Transient(format!(
                "unpacking archive on helper failed with exit {exit}"
            )));
        }
        Ok(())
    }

    async fn copy_from_volume(&self, name: &str) -> Result<TarStream> {
        let inner = &self.inner;
        let (machine_id, address) = inner.ensure_helper(name).await?;
        let session = inner.helper_session(address).await?;

        let stream = session.exec_stream_stdout("tar -cf - -C /data .").await?;
        Ok(Box::new(SuspendOnDrop {
            stream,
            inner: inner.clone(),
            machine_id,
        }))
    }
}

/// Suspends the helper once the caller finishes draining the archive.
struct SuspendOnDrop {
    stream: TarStream,
    inner: Arc<FlyInner>,
    machine_id: String,
}

impl AsyncRead for SuspendOnDrop {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl Drop for SuspendOnDrop {
    fn drop(&mut self) {
        self.inner.suspend_helper_later(self.machine_id.clone());
    }
}

struct FlyVolumeHandle {
    name: String,
    volume_id: String,
    inner: Arc<FlyInner>,
}

#[async_trait]
impl VolumeHandle for FlyVolumeHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.volume_id
    }

    async fn cleanup(&self) -> Result<()> {
        {
            let mut attachments = self.inner.attachments.lock().await;
            self.inner
                .evict_attachment(&mut attachments, &self.volume_id)
                .await?;
        }
        self.inner.api.delete_volume(&self.volume_id).await
    }
}

struct FlyContainer {
    task_id: String,
    machine_id: String,
    inner: Arc<FlyInner>,
    status_rx: watch::Receiver<ContainerStatus>,
    cleaned: AtomicBool,
}

impl FlyContainer {
    fn track(task_id: String, machine: api::Machine, inner: Arc<FlyInner>) -> Self {
        let initial = if machine.state == "stopped" || machine.state == "destroyed" {
            ContainerStatus::exited(machine.exit_code().unwrap_or(-1))
        } else {
            ContainerStatus::running()
        };
        let (status_tx, status_rx) = watch::channel(initial);

        if !initial.is_done {
            let poll_inner = inner.clone();
            let machine_id = machine.id.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    match poll_inner.api.get_machine(&machine_id).await {
                        Ok(machine) => {
                            if machine.state == "stopped" || machine.state == "destroyed" {
                                let code = machine.exit_code().unwrap_or(-1);
                                debug!(machine = %machine_id, code, "machine stopped");
                                let _ = status_tx.send(ContainerStatus::exited(code));
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(machine = %machine_id, error = %e, "machine status poll failed");
                        }
                    }
                }
            });
        }

        Self {
            task_id,
            machine_id: machine.id,
            inner,
            status_rx,
            cleaned: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ContainerHandle for FlyContainer {
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
        let mut emitted = 0usize;
        loop {
            let entries = self.inner.api.machine_logs(&self.machine_id).await?;
            for entry in entries.iter().skip(emitted) {
                let sink: &mut (dyn AsyncWrite + Send + Unpin) = if entry.level == "error" {
                    &mut *stderr
                } else {
                    &mut *stdout
                };
                sink.write_all(entry.message.as_bytes()).await?;
                sink.write_all(b"\n").await?;
            }
            emitted = emitted.max(entries.len());

            if !follow || self.status_rx.borrow().is_done {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    async fn cleanup(&self) -> Result<()> {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.api.destroy_machine(&self.machine_id).await?;
        self.inner
            .attachments
            .lock()
            .await
            .retain(|_, machine| *machine != self.machine_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsn_requires_token_and_app() {
        assert!(FlyDriver::from_dsn(&Dsn::parse("fly://ns?app=ci").unwrap()).is_err());
        assert!(FlyDriver::from_dsn(&Dsn::parse("fly://ns?token=t").unwrap()).is_err());
        assert!(FlyDriver::from_dsn(&Dsn::parse("fly://ns?token=t&app=ci").unwrap()).is_ok());
    }

    #[test]
    fn volume_names_are_sanitized_for_fly() {
        let driver =
            FlyDriver::from_dsn(&Dsn::parse("fly://my-ns?token=t&app=ci").unwrap()).unwrap();
        assert_eq!(driver.inner.volume_fly_name("dep-cache"), "conveyor_my_ns_dep_cache");
    }

    #[test]
    fn machine_names_are_stable_per_task() {
        assert_eq!(FlyInner::task_machine_name("abc"), "conveyor-task-abc");
    }
}
