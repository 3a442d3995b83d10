//! Job registry and definitions.
//!
//! This crate provides:
//! - [`Registry`]: per-process catalog of jobs with dual-mode queue resolution
//! - [`JobDefinition`]: schema-validated jobs with trigger, batch, delayed,
//!   recurring and flow APIs
//! - [`FlowNode`]: composition of job trees submitted atomically
//! - [`JobContext`] and [`JobLogger`] for handlers

pub mod context;
pub mod definition;
pub mod error;
pub mod flow;
pub mod logging;
pub mod registry;
pub mod schema;

pub use context::JobContext;
pub use definition::{JobConfig, JobDefinition};
pub use error::{JobsError, JobsResult, ResolutionError, SchemaViolation};
pub use flow::FlowNode;
pub use logging::JobLogger;
pub use registry::{QueueMode, QueueResolver, Registry};
pub use schema::Payload;
