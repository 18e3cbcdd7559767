//! Core domain types and traits for the Conveyor CI engine.
//!
//! This crate contains:
//! - Error kinds shared across the workspace
//! - Pipeline and run identifiers
//! - The driver contract (container + volume lifecycle, log streaming,
//!   optional volume-data access)
//! - Driver DSN parsing
//! - Webhook request/reply payloads
//! - Resource-plugin protocol shapes

pub mod driver;
pub mod dsn;
pub mod error;
pub mod id;
pub mod resource;
pub mod webhook;

pub use driver::{
    Command, ContainerHandle, ContainerLimits, ContainerStatus, Driver, Mount, TarStream,
    TaskSpec, VolumeDataAccessor, VolumeHandle,
};
pub use dsn::Dsn;
pub use error::{Error, Result};
pub use id::{PipelineId, RunId};
pub use webhook::{WebhookReply, WebhookRequest};
