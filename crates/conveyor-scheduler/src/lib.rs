//! Pipeline execution service.
//!
//! Turns a trigger into an asynchronous pipeline run: admission control
//! against an in-flight limit, run-state transitions, and final-status
//! derivation from job-level records in the task store. The scripting
//! runtime that actually interprets pipeline programs is a collaborator
//! behind the `PipelineRuntime` trait.

pub mod runtime;
pub mod service;

pub use runtime::{PipelineRuntime, ReplySlot, RunContext};
pub use service::{DEFAULT_MAX_IN_FLIGHT, ExecutionService};
