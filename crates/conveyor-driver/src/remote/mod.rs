//! Remote provisioner drivers.
//!
//! A cloud driver owns a host lifecycle: SSH keypair, instance, and a tag
//! for orphan cleanup. The host is created lazily on the first volume or
//! container operation, then an embedded docker driver bound to the
//! forwarded socket serves the actual API.

pub mod digitalocean;
pub mod hetzner;

use async_trait::async_trait;
use conveyor_core::{
    ContainerHandle, ContainerLimits, Driver, Error, Result, TarStream, TaskSpec,
    VolumeDataAccessor, VolumeHandle,
};
use russh::keys::PrivateKey;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use crate::docker::DockerDriver;
use crate::ssh::{self, SocketForward, SshSession};

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// A provisioned cloud host and the identifiers needed to destroy it.
#[derive(Debug, Clone)]
pub struct CloudHost {
    pub id: String,
    pub key_id: String,
    pub address: IpAddr,
}

/// Cloud-specific half of a remote driver: create and destroy one host.
#[async_trait]
pub trait HostProvisioner: Send + Sync {
    fn name(&self) -> &str;

    /// Create a host with `public_key` installed for root, sized to satisfy
    /// `limits`, and wait until the cloud reports it active.
    async fn create_host(&self, public_key: &str, limits: ContainerLimits) -> Result<CloudHost>;

    async fn destroy_host(&self, host: &CloudHost) -> Result<()>;
}

/// Timeouts for bringing a fresh host to a usable docker daemon.
#[derive(Debug, Clone, Copy)]
pub struct RemoteTimeouts {
    pub ssh: Duration,
    pub docker: Duration,
}

impl Default for RemoteTimeouts {
    fn default() -> Self {
        Self {
            ssh: Duration::from_secs(300),
            docker: Duration::from_secs(300),
        }
    }
}

struct RemoteState {
    session: Arc<SshSession>,
    forward: SocketForward,
    docker: DockerDriver,
}

pub struct RemoteDriver {
    provisioner: Box<dyn HostProvisioner>,
    namespace: String,
    timeouts: RemoteTimeouts,
    key: PrivateKey,
    // Tracked from the moment the cloud accepts the create call, so close()
    // reclaims hosts whose bring-up failed halfway.
    created: Mutex<Option<CloudHost>>,
    state: OnceCell<std::result::Result<RemoteState, String>>,
}

impl RemoteDriver {
    pub fn new(
        provisioner: Box<dyn HostProvisioner>,
        namespace: &str,
        timeouts: RemoteTimeouts,
    ) -> Result<Self> {
        Ok(Self {
            provisioner,
            namespace: namespace.to_string(),
            timeouts,
            key: ssh::generate_keypair()?,
            created: Mutex::new(None),
            state: OnceCell::new(),
        })
    }

    /// Single-flight host bring-up. The first caller does the work; later
    /// callers observe the memoized success or error.
    async fn ensure_host(&self, limits: ContainerLimits) -> Result<&RemoteState> {
        let state = self
            .state
            .get_or_init(|| async {
                self.bring_up(limits).await.map_err(|e| e.to_string())
            })
            .await;
        match state {
            Ok(state) => Ok(state),
            Err(message) => Err(Error::Provisioning(message.clone())),
        }
    }

    async fn bring_up(&self, limits: ContainerLimits) -> Result<RemoteState> {
        let public_key = ssh::public_openssh(&self.key)?;

        info!(provisioner = %self.provisioner.name(), "provisioning host");
        let host = self.provisioner.create_host(&public_key, limits).await?;
        *self.created.lock().await = Some(host.clone());

        let addr = SocketAddr::new(host.address, 22);
        let session = Arc::new(
            SshSession::connect_with_retry(addr, "root", &self.key, self.timeouts.ssh).await?,
        );

        // Docker-ready probe: cloud-init is still installing the daemon
        // when SSH first answers.
        let started = tokio::time::Instant::now();
        loop {
            let output = session.exec("docker info >/dev/null 2>&1 && echo ok").await?;
            if output.exit_code == 0 {
                break;
            }
            if started.elapsed() > self.timeouts.docker {
                return Err(Error::Timeout(format!(
                    "docker on {} not ready after {:?}",
                    host.address, self.timeouts.docker
                )));
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        let forward = session.forward_unix_socket(DOCKER_SOCKET).await?;
        let docker = DockerDriver::connect_http(
            &format!("tcp://{}", forward.local_addr()),
            &self.namespace,
        )?;
        docker.ping().await?;

        info!(provisioner = %self.provisioner.name(), host = %host.id, "host ready");
        Ok(RemoteState {
            session,
            forward,
            docker,
        })
    }
}

#[async_trait]
impl Driver for RemoteDriver {
    fn name(&self) -> &str {
        self.provisioner.name()
    }

    async fn create_volume(&self, name: &str, size_hint_gb: u32) -> Result<Arc<dyn VolumeHandle>> {
        let state = self.ensure_host(ContainerLimits::default()).await?;
        state.docker.create_volume(name, size_hint_gb).await
    }

    async fn run_container(&self, task: TaskSpec) -> Result<Arc<dyn ContainerHandle>> {
        let state = self.ensure_host(task.limits).await?;
        state.docker.run_container(task).await
    }

    async fn get_container(&self, id: &str) -> Result<Arc<dyn ContainerHandle>> {
        let state = self.ensure_host(ContainerLimits::default()).await?;
        state.docker.get_container(id).await
    }

    fn volume_data(&self) -> Option<&dyn VolumeDataAccessor> {
        // Forwarded to the embedded docker driver once the host exists; the
        // capability itself is always present.
        Some(self)
    }

    async fn close(&self) -> Result<()> {
        if let Some(Ok(state)) = self.state.get() {
            if let Err(e) = state.docker.close().await {
                warn!(error = %e, "closing embedded docker driver failed");
            }
            state.forward.close();
            state.session.close().await;
        }

        if let Some(host) = self.created.lock().await.take() {
            info!(provisioner = %self.provisioner.name(), host = %host.id, "destroying host");
            self.provisioner.destroy_host(&host).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeDataAccessor for RemoteDriver {
    async fn copy_to_volume(&self, name: &str, data: TarStream) -> Result<()> {
        let state = self.ensure_host(ContainerLimits::default()).await?;
        let accessor = state
            .docker
            .volume_data()
            .ok_or_else(|| Error::Internal("embedded docker driver lost volume data".into()))?;
        accessor.copy_to_volume(name, data).await
    }

    async fn copy_from_volume(&self, name: &str) -> Result<TarStream> {
        let state = self.ensure_host(ContainerLimits::default()).await?;
        let accessor = state
            .docker
            .volume_data()
            .ok_or_else(|| Error::Internal("embedded docker driver lost volume data".into()))?;
        accessor.copy_from_volume(name).await
    }
}

/// Short random suffix for cloud-side resource names.
pub(crate) fn random_suffix(len: usize) -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Cloud-init payload installing docker on a stock Ubuntu image.
pub(crate) fn docker_user_data() -> &'static str {
    "#cloud-config\nruncmd:\n  - curl -fsSL https://get.docker.com | sh\n"
}

/// Pick the smallest tier satisfying both the CPU and memory limits.
/// `tiers` must be ordered smallest first.
pub(crate) fn pick_tier<'a>(
    tiers: &'a [(&'a str, u32, u64)],
    limits: ContainerLimits,
) -> &'a str {
    let want_cpus = limits.cpus.unwrap_or(1);
    let want_memory = limits.memory_mb.unwrap_or(1024);
    tiers
        .iter()
        .find(|(_, cpus, memory_mb)| *cpus >= want_cpus && *memory_mb >= want_memory)
        .map(|(slug, _, _)| *slug)
        .unwrap_or(tiers[tiers.len() - 1].0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIERS: &[(&str, u32, u64)] = &[
        ("small", 1, 1024),
        ("medium", 2, 4096),
        ("large", 8, 16384),
    ];

    #[test]
    fn tier_defaults_to_smallest() {
        assert_eq!(pick_tier(TIERS, ContainerLimits::default()), "small");
    }

    #[test]
    fn tier_satisfies_both_axes() {
        let limits = ContainerLimits {
            cpus: Some(1),
            memory_mb: Some(3000),
        };
        assert_eq!(pick_tier(TIERS, limits), "medium");

        let limits = ContainerLimits {
            cpus: Some(4),
            memory_mb: Some(1024),
        };
        assert_eq!(pick_tier(TIERS, limits), "large");
    }

    #[test]
    fn oversized_requests_fall_back_to_the_largest_tier() {
        let limits = ContainerLimits {
            cpus: Some(64),
            memory_mb: Some(1 << 20),
        };
        assert_eq!(pick_tier(TIERS, limits), "large");
    }
}
