//! Driver contract and task types.
//!
//! Drivers run pipeline tasks as containers or commands on some compute
//! back-end (local sandbox, Docker host, cloud instance, micro-VM).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::Result;

/// A tar archive streamed out of or into a volume.
pub type TarStream = Box<dyn AsyncRead + Send + Unpin>;

/// The command a task executes inside its container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A named volume mounted into a container at a path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub name: String,
    pub path: String,
}

/// Resource limits for one container.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ContainerLimits {
    /// Whole CPUs. `None` means unlimited.
    pub cpus: Option<u32>,
    /// Memory in megabytes. `None` means unlimited.
    pub memory_mb: Option<u64>,
}

/// Specification for a single unit of pipeline work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Stable task identifier. Launching the same id twice returns the same
    /// container handle.
    pub id: String,
    /// Container image. Drivers without an image concept ignore it.
    pub image: String,
    pub command: Command,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub limits: ContainerLimits,
    /// Data piped to the task's stdin, if any.
    #[serde(default)]
    pub stdin: Option<String>,
}

/// Snapshot of a container's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub is_done: bool,
    pub exit_code: i64,
}

impl ContainerStatus {
    pub fn running() -> Self {
        Self {
            is_done: false,
            exit_code: 0,
        }
    }

    pub fn exited(exit_code: i64) -> Self {
        Self {
            is_done: true,
            exit_code,
        }
    }
}

/// A named, driver-managed storage handle.
#[async_trait]
pub trait VolumeHandle: Send + Sync {
    fn name(&self) -> &str;

    /// Back-end location of the volume (directory, docker volume name,
    /// virtiofs subpath, cloud volume id).
    fn path(&self) -> &str;

    async fn cleanup(&self) -> Result<()>;
}

/// Handle to a launched container.
#[async_trait]
pub trait ContainerHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Non-blocking status snapshot.
    async fn status(&self) -> Result<ContainerStatus>;

    /// Stream the container's output to `stdout`/`stderr`.
    ///
    /// With `follow = false`, writes whatever is buffered and returns. With
    /// `follow = true`, blocks and delivers new lines until the container
    /// reaches a terminal state or the caller drops the future.
    async fn logs(
        &self,
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
        follow: bool,
    ) -> Result<()>;

    /// Remove the container. Kills it first if still running. Calling this
    /// twice is a no-op.
    async fn cleanup(&self) -> Result<()>;
}

/// Optional capability: direct access to a volume's contents as a tar
/// stream. The caching layer only engages for drivers that expose this.
#[async_trait]
pub trait VolumeDataAccessor: Send + Sync {
    async fn copy_to_volume(&self, name: &str, data: TarStream) -> Result<()>;

    async fn copy_from_volume(&self, name: &str) -> Result<TarStream>;
}

/// A compute back-end that can run pipeline tasks.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Create (or return the existing) named volume. Volume names are
    /// unique per driver instance.
    async fn create_volume(&self, name: &str, size_hint_gb: u32) -> Result<Arc<dyn VolumeHandle>>;

    /// Launch a task. Launching the same `task.id` twice returns the same
    /// container handle.
    async fn run_container(&self, task: TaskSpec) -> Result<Arc<dyn ContainerHandle>>;

    async fn get_container(&self, id: &str) -> Result<Arc<dyn ContainerHandle>>;

    /// Capability probe for volume-data access.
    fn volume_data(&self) -> Option<&dyn VolumeDataAccessor> {
        None
    }

    /// Release every resource this driver created. Idempotent.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_constructors() {
        assert!(!ContainerStatus::running().is_done);
        let done = ContainerStatus::exited(42);
        assert!(done.is_done);
        assert_eq!(done.exit_code, 42);
    }

    #[test]
    fn task_spec_deserializes_with_defaults() {
        let spec: TaskSpec = serde_json::from_str(
            r#"{"id": "t1", "image": "alpine", "command": {"path": "echo", "args": ["hi"]}}"#,
        )
        .unwrap();
        assert_eq!(spec.id, "t1");
        assert!(spec.env.is_empty());
        assert!(spec.mounts.is_empty());
        assert!(spec.limits.cpus.is_none());
        assert!(spec.stdin.is_none());
    }
}
