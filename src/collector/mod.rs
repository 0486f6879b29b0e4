//! Collector: the edge worker process
//!
//! A collector registers with a dispatcher, heartbeats, pulls task
//! assignments and polls the assigned feed sources, streaming matching
//! entries back as results.
//!
//! # Usage
//!
//! ```ignore
//! use kestrel::collector::{CollectorConfig, CollectorRuntime};
//! use std::sync::Arc;
//!
//! let config = CollectorConfig::from_file("collector.toml")?;
//! let runtime = Arc::new(CollectorRuntime::new(config)?);
//! runtime.run(shutdown_future).await?;
//! ```

pub mod client;
pub mod config;
pub mod runtime;
pub mod sources;
pub mod worker;

// Re-export main types
pub use client::{ClientError, DispatcherClient};
pub use config::CollectorConfig;
pub use runtime::{CollectorRuntime, RuntimeError};
pub use sources::{FeedEntry, FeedPoller, PollError};
pub use worker::{TaskWorker, WorkerHandle};
