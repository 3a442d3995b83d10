//! Recurring job schedulers.
//!
//! This crate provides:
//! - [`SchedulerRegistry`]: static and per-account schedulers registered with
//!   idempotent upsert
//! - [`DailySlot`]: deterministic daily cron slots that spread tenants over
//!   the day

pub mod config;
pub mod cron;
pub mod error;
pub mod registry;

pub use config::{scheduler_key, DynamicSchedulerRequest, DynamicSchedulerTemplate, StaticSchedulerConfig};
pub use cron::{daily_cron, daily_cron_with_offset, DailySlot};
pub use error::{SchedulerError, SchedulerResult};
pub use registry::{SchedulerRegistration, SchedulerRegistry};
