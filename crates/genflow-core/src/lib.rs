//! genflow-core
//!
//! Building blocks for a queued, streamed AI-generation pipeline.
//!
//! # Modules
//! - **domain**: ids, stages and statuses, events, routing, guard keys
//! - **ports**: store, bus, clock, provider and ledger abstractions
//! - **impls**: in-memory implementations of every port
//! - **queue**: at-least-once task queue with retry scheduling
//! - **admission**: rate limits, idempotency, back-pressure, enqueue
//! - **worker**: guards, provider execution, lifecycle events
//! - **publisher**: token batching onto the event log and bus
//! - **gateway**: per-connection SSE relay of one log channel
//! - **client**: stream consumer state machine and in-process driver
//! - **app**: builder, pipeline handle, dispatchers
//! - **http**: axum routes
//! - **config**, **error**, **observability**: ambient concerns

pub mod admission;
pub mod app;
pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod http;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod publisher;
pub mod queue;
pub mod worker;

pub use app::{Pipeline, PipelineBuilder};
pub use config::PipelineConfig;
