//! Dispatcher: the coordination core
//!
//! Central server that owns collector liveness, the task lifecycle and
//! result routing.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │         Dispatcher Server           │
//! │                                     │
//! │  ┌──────────────────────────────┐   │
//! │  │     Collector Registry       │   │
//! │  │  - Registration / sessions   │   │
//! │  │  - Heartbeat tracking        │   │
//! │  │  - Liveness sweep + events   │   │
//! │  └──────────────┬───────────────┘   │
//! │                 │ Lost / Capacity   │
//! │  ┌──────────────▼───────────────┐   │
//! │  │     Assignment Engine        │   │
//! │  │  - Least-loaded matching     │   │
//! │  │  - Durable per-collector     │   │
//! │  │    assignment queues         │   │
//! │  │  - Failover                  │   │
//! │  └──────────────────────────────┘   │
//! │                                     │
//! │  ┌──────────────────────────────┐   │
//! │  │       Result Router          │   │
//! │  │  - Ownership + window checks │   │
//! │  │  - Triple dedup (authority)  │   │
//! │  │  - Bounded fan-out to SSE    │   │
//! │  │  - Completion sweep          │   │
//! │  └──────────────────────────────┘   │
//! └─────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use kestrel::dispatcher::{DispatcherConfig, DispatcherServer};
//!
//! let config = DispatcherConfig::default();
//! let server = DispatcherServer::from_config(config)?;
//! server.start().await?;
//! ```

pub mod api;
pub mod assignment;
pub mod config;
pub mod registry;
pub mod router;
pub mod server;
pub mod store;
pub mod users;

// Re-export main types
pub use assignment::AssignmentEngine;
pub use config::DispatcherConfig;
pub use registry::{CollectorRegistry, CollectorSnapshot, CollectorStatus, RegistryEvent};
pub use router::{ResultRouter, SubmitError, SubmitOutcome, SubscriptionHandle};
pub use server::DispatcherServer;
pub use store::{NewTask, Task, TaskStatus, TaskStore};
pub use users::UserStore;
