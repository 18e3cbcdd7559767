//! Compute back-ends for Conveyor pipelines.
//!
//! Every driver implements the contract in `conveyor-core`: named-volume
//! lifecycle, idempotent task launch, cached status via a background
//! waiter, log streaming, and cleanup. Back-ends:
//!
//! - `native`: local processes in a sandbox directory
//! - `docker`: a Docker host via bollard
//! - `qemu`: one guest VM with a virtiofs share and a vsock agent
//! - `digitalocean` / `hetzner`: provision a host, then delegate to an
//!   embedded docker driver over an SSH-forwarded socket
//! - `fly`: one micro-VM per task with WireGuard-tunneled volume access

pub mod docker;
pub mod fly;
pub mod native;
pub mod qemu;
pub mod registry;
pub mod remote;
pub mod ssh;
pub mod tarfs;

pub use docker::DockerDriver;
pub use native::NativeDriver;
pub use qemu::QemuDriver;
pub use registry::{AllowedDrivers, DriverRegistry, open_driver, open_driver_with, validate_dsn};
