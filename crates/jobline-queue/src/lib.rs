//! Durable job queues.
//!
//! This crate provides:
//! - Queue bindings and live queue handles
//! - The [`Broker`] abstraction with Redis and in-memory implementations
//! - Flow (job tree) submission
//! - Cron-based schedulers with idempotent upsert
//! - Worker events and the active-job view handed to handlers

pub mod binding;
pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod flow;
pub mod job;
pub mod memory;
pub mod queue;
pub mod redis_broker;
pub mod schedule;

pub use binding::{QueueBinding, DEFAULT_CONCURRENCY};
pub use broker::{Broker, BrokerConnector, FailOutcome, JobFailure, StalledJobs};
pub use config::BrokerConfig;
pub use error::{QueueError, QueueResult};
pub use events::WorkerEvent;
pub use flow::FlowProducer;
pub use job::ActiveJob;
pub use memory::{BrokerCall, MemoryBroker, MemoryConnector};
pub use queue::QueueHandle;
pub use redis_broker::{RedisBroker, RedisConnector};
pub use schedule::{next_fire, parse_cron, plan_iteration};
