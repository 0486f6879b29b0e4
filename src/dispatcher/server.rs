//! Dispatcher server implementation
//!
//! Wires the registry, task store, assignment engine and result router
//! together, runs the background sweeps and serves the HTTP API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::catalog::SourceCatalog;

use super::api::create_router;
use super::assignment::AssignmentEngine;
use super::config::DispatcherConfig;
use super::registry::{CollectorRegistry, RegistryEvent};
use super::router::ResultRouter;
use super::store::TaskStore;
use super::users::UserStore;

// ============================================================================
// App State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Collector registry
    pub registry: Arc<CollectorRegistry>,

    /// Task table
    pub store: Arc<TaskStore>,

    /// Assignment engine
    pub engine: Arc<AssignmentEngine>,

    /// Result router
    pub router: Arc<ResultRouter>,

    /// Client accounts
    pub users: Arc<UserStore>,

    /// Source catalog (reloadable)
    pub catalog: Arc<RwLock<SourceCatalog>>,

    /// Server start time
    pub start_time: Instant,

    /// Configuration
    pub config: DispatcherConfig,
}

// ============================================================================
// Dispatcher Server
// ============================================================================

/// Main dispatcher server
pub struct DispatcherServer {
    config: DispatcherConfig,
    state: AppState,

    /// Registry event feed, handed to the engine loop on start
    events: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<RegistryEvent>>>,
}

impl DispatcherServer {
    /// Create a new dispatcher server with the given catalog.
    pub fn new(config: DispatcherConfig, catalog: SourceCatalog) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::ConfigError(e.to_string()))?;

        let (registry, events) = CollectorRegistry::new(config.heartbeat_timeout());
        let registry = Arc::new(registry);
        let store = Arc::new(TaskStore::new());
        let engine = Arc::new(AssignmentEngine::new(registry.clone(), store.clone()));
        let router = Arc::new(ResultRouter::new(
            registry.clone(),
            store.clone(),
            config.subscriber_buffer,
        ));

        let state = AppState {
            registry,
            store,
            engine,
            router,
            users: Arc::new(UserStore::new()),
            catalog: Arc::new(RwLock::new(catalog)),
            start_time: Instant::now(),
            config: config.clone(),
        };

        Ok(Self {
            config,
            state,
            events: Mutex::new(Some(events)),
        })
    }

    /// Create a server loading the catalog from the configured path.
    pub fn from_config(config: DispatcherConfig) -> Result<Self, ServerError> {
        let catalog = SourceCatalog::load(&config.catalog_path)
            .map_err(|e| ServerError::InitError(e.to_string()))?;
        tracing::info!(sources = catalog.len(), path = %config.catalog_path, "Loaded source catalog");
        Self::new(config, catalog)
    }

    /// Get the application state
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let mut router = create_router(self.state.clone());

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        if self.config.enable_request_logging {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Start the server
    pub async fn start(&self) -> Result<(), ServerError> {
        self.serve(std::future::pending()).await
    }

    /// Start with graceful shutdown
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        self.serve(shutdown_signal).await
    }

    async fn serve(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let router = self.build_router();
        let addr = self.config.bind_address;

        tracing::info!("Starting dispatcher server on {}", addr);

        self.start_background_tasks().await?;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(e.to_string()))?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::ServeError(e.to_string()))?;

        tracing::info!("Dispatcher server shutdown complete");
        Ok(())
    }

    /// Start background tasks: liveness sweep, assignment loop, completion
    /// sweep.
    async fn start_background_tasks(&self) -> Result<(), ServerError> {
        let events = self
            .events
            .lock()
            .await
            .take()
            .ok_or_else(|| ServerError::InitError("Server already started".to_string()))?;

        // Liveness sweep at half the heartbeat timeout
        let registry = self.state.registry.clone();
        let sweep_period = self.config.sweep_period();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                registry.sweep(Utc::now()).await;
            }
        });

        // Assignment matching + failover event handling
        self.state
            .engine
            .clone()
            .start(events, self.config.assignment_period());

        // Completion sweep
        let result_router = self.state.router.clone();
        let completion_period = self.config.completion_period();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(completion_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                result_router.complete_expired(Utc::now()).await;
            }
        });

        tracing::info!("Background tasks started");
        Ok(())
    }

    /// Get server info
    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            bind_address: self.config.bind_address,
            heartbeat_timeout_secs: self.config.heartbeat_timeout_secs,
            subscriber_buffer: self.config.subscriber_buffer,
            cors_enabled: self.config.enable_cors,
            request_logging_enabled: self.config.enable_request_logging,
        }
    }
}

/// Server information
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub bind_address: SocketAddr,
    pub heartbeat_timeout_secs: u64,
    pub subscriber_buffer: usize,
    pub cors_enabled: bool,
    pub request_logging_enabled: bool,
}

impl ServerInfo {
    /// Format as display string
    pub fn display(&self) -> String {
        format!(
            "Dispatcher Server\n\
             {:-<40}\n\
             Bind Address: {}\n\
             Heartbeat Timeout: {}s\n\
             Subscriber Buffer: {}\n\
             CORS: {}\n\
             Request Logging: {}",
            "",
            self.bind_address,
            self.heartbeat_timeout_secs,
            self.subscriber_buffer,
            if self.cors_enabled { "enabled" } else { "disabled" },
            if self.request_logging_enabled {
                "enabled"
            } else {
                "disabled"
            }
        )
    }
}

// ============================================================================
// Server Errors
// ============================================================================

/// Server errors
#[derive(Debug, Clone)]
pub enum ServerError {
    /// Configuration error
    ConfigError(String),

    /// Initialization error
    InitError(String),

    /// Failed to bind to address
    BindError(String),

    /// Server runtime error
    ServeError(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigError(msg) => write!(f, "Configuration error: {msg}"),
            Self::InitError(msg) => write!(f, "Initialization error: {msg}"),
            Self::BindError(msg) => write!(f, "Failed to bind: {msg}"),
            Self::ServeError(msg) => write!(f, "Server error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {}

// ============================================================================
// Tests
// ============================================================================
