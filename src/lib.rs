//! kestrel - Distributed feed-collection dispatcher
//!
//! A dispatcher/collector system for windowed feed collection: clients
//! submit keyword tasks with a time window, the dispatcher assigns them to
//! live collectors, and collectors poll external feeds and stream matching
//! entries back through the dispatcher to the requesting client.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`dispatcher`] - Coordination core: registry, task store, assignment
//!   engine, result router and the HTTP API serving both surfaces
//! - [`collector`] - Edge worker: dispatcher client, feed pollers and the
//!   per-task worker runtime
//! - [`catalog`] - The source catalog tasks draw their feeds from
//! - [`models`] - Core data structures and wire types
//! - [`error`] - Unified error handling
//!
//! # Example
//!
//! ```no_run
//! use kestrel::dispatcher::{DispatcherConfig, DispatcherServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DispatcherConfig::default();
//!     let server = DispatcherServer::from_config(config)?;
//!     server.start().await?;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod collector;
pub mod dispatcher;
pub mod error;
pub mod models;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::catalog::SourceCatalog;
    pub use crate::collector::{CollectorConfig, CollectorRuntime};
    pub use crate::dispatcher::{DispatcherConfig, DispatcherServer, TaskStatus};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::models::{
        CollectorId, ResultRecord, SourceKind, SourceSpec, TaskAssignment, TimeWindow,
    };
}

// Direct re-exports for convenience
pub use models::{CollectorId, ResultRecord, SourceSpec, TaskAssignment};
