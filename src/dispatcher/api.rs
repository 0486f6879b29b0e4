//! REST API handlers for the dispatcher server
//!
//! Two surfaces share one router: `/api/client/...` for task-submitting
//! clients and `/api/collector/...` for collectors. Client result streams
//! are served as SSE; collector assignment delivery drains the durable
//! queue on poll.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;

use crate::dispatcher::router::{SubmitError, SubmitOutcome};
use crate::dispatcher::store::{NewTask, Task, TaskStats};
use crate::models::{
    AssignmentPollRequest, AssignmentPollResponse, CollectorLoginRequest,
    CollectorRegisterRequest, HeartbeatRequest, LoginResponse, SubmitAck, SubmitRequest,
    SubmitStatus, TaskStartRequest, TaskStartResponse, UserCredentials,
};

use super::assignment::AssignmentStats;
use super::registry::{CollectorSnapshot, RegistryStats};
use super::router::RouterStats;
use super::server::AppState;

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Simple error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Aggregated stats response
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub collectors: RegistryStats,
    pub tasks: TaskStats,
    pub assignments: AssignmentStats,
    pub routing: RouterStats,
}

/// Collector list response
#[derive(Debug, Serialize)]
pub struct CollectorsResponse {
    pub collectors: Vec<CollectorSnapshot>,
    pub stats: RegistryStats,
}

/// Client task list response
#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<Task>,
}

/// Catalog dimension listing
#[derive(Debug, Serialize)]
pub struct TagsResponse {
    pub tags: Vec<String>,
}

/// Token passed as a query parameter (GET endpoints)
#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and stats
        .route("/api/health", get(health_check))
        .route("/api/stats", get(get_stats))
        // Client surface
        .route("/api/client/register", post(client_register))
        .route("/api/client/login", post(client_login))
        .route("/api/client/tasks", post(start_task).get(list_tasks))
        .route("/api/client/tasks/{task_id}/results", get(stream_results))
        .route("/api/client/categories", get(list_categories))
        .route("/api/client/locations", get(list_locations))
        // Collector surface
        .route("/api/collector/register", post(collector_register))
        .route("/api/collector/login", post(collector_login))
        .route("/api/collector/heartbeat", post(collector_heartbeat))
        .route("/api/collector/assignments", post(poll_assignments))
        .route("/api/collector/results", post(submit_result))
        .route("/api/collectors", get(list_collectors))
        .with_state(state)
}

// ============================================================================
// Health Handlers
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();

    Json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: uptime,
    }))
}

/// Aggregated stats endpoint
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(StatsResponse {
        collectors: state.registry.stats().await,
        tasks: state.store.stats().await,
        assignments: state.engine.stats().await,
        routing: state.router.stats(),
    }))
}

// ============================================================================
// Client Handlers
// ============================================================================

/// Register a client account
async fn client_register(
    State(state): State<AppState>,
    Json(request): Json<UserCredentials>,
) -> axum::response::Response {
    match state.users.register(&request.username, &request.password).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success("registered"))).into_response(),
        Err(e) => (StatusCode::CONFLICT, Json(ErrorResponse::new(e.to_string()))).into_response(),
    }
}

/// Log a client in
async fn client_login(
    State(state): State<AppState>,
    Json(request): Json<UserCredentials>,
) -> axum::response::Response {
    match state.users.login(&request.username, &request.password).await {
        Ok(token) => {
            (StatusCode::OK, Json(ApiResponse::success(LoginResponse { token }))).into_response()
        }
        Err(e) => {
            (StatusCode::UNAUTHORIZED, Json(ErrorResponse::new(e.to_string()))).into_response()
        }
    }
}

/// Start a collection task
async fn start_task(
    State(state): State<AppState>,
    Json(request): Json<TaskStartRequest>,
) -> axum::response::Response {
    let owner = match state.users.authenticate(&request.token).await {
        Ok(username) => username,
        Err(e) => {
            return (StatusCode::UNAUTHORIZED, Json(ErrorResponse::new(e.to_string())))
                .into_response();
        }
    };

    let sources = {
        let catalog = state.catalog.read().await;
        catalog.matching(&request.category, &request.location)
    };
    if sources.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(format!(
                "No sources match category '{}' / location '{}'",
                request.category, request.location
            ))),
        )
            .into_response();
    }

    let now = Utc::now();
    let spec = NewTask {
        owner,
        keywords: request.keywords,
        category: request.category,
        location: request.location,
        start_time: request.start_time,
        end_time: request.end_time,
        sources,
    };

    match state.store.create(spec, now).await {
        Ok(task_id) => {
            // Place it immediately rather than waiting for the next pass
            state.engine.assign_pending(now).await;
            (
                StatusCode::OK,
                Json(ApiResponse::success(TaskStartResponse { task_id })),
            )
                .into_response()
        }
        Err(e) => {
            (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(e.to_string()))).into_response()
        }
    }
}

/// List the calling client's tasks
async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> axum::response::Response {
    match state.users.authenticate(&query.token).await {
        Ok(owner) => {
            let tasks = state.store.list_by_owner(&owner).await;
            (StatusCode::OK, Json(ApiResponse::success(TaskListResponse { tasks })))
                .into_response()
        }
        Err(e) => {
            (StatusCode::UNAUTHORIZED, Json(ErrorResponse::new(e.to_string()))).into_response()
        }
    }
}

/// Stream a task's results as SSE until the task completes
async fn stream_results(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<TokenQuery>,
) -> axum::response::Response {
    let owner = match state.users.authenticate(&query.token).await {
        Ok(username) => username,
        Err(e) => {
            return (StatusCode::UNAUTHORIZED, Json(ErrorResponse::new(e.to_string())))
                .into_response();
        }
    };

    let task = match state.store.get(&task_id).await {
        Ok(task) => task,
        Err(e) => {
            return (StatusCode::NOT_FOUND, Json(ErrorResponse::new(e.to_string())))
                .into_response();
        }
    };
    if task.owner != owner {
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new("Task belongs to another client")),
        )
            .into_response();
    }

    let handle = match state.router.subscribe(&task_id).await {
        Ok(handle) => handle,
        Err(e) => {
            return (StatusCode::NOT_FOUND, Json(ErrorResponse::new(e.to_string())))
                .into_response();
        }
    };

    let stream = result_event_stream(handle);
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn result_event_stream(
    handle: crate::dispatcher::router::SubscriptionHandle,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(handle, |mut handle| async move {
        let record = handle.next().await?;
        let event = Event::default()
            .json_data(&record)
            .unwrap_or_else(|_| Event::default().data("{}"));
        Some((Ok(event), handle))
    })
}

/// Distinct catalog categories
async fn list_categories(State(state): State<AppState>) -> impl IntoResponse {
    let tags = state.catalog.read().await.categories();
    Json(ApiResponse::success(TagsResponse { tags }))
}

/// Distinct catalog locations
async fn list_locations(State(state): State<AppState>) -> impl IntoResponse {
    let tags = state.catalog.read().await.locations();
    Json(ApiResponse::success(TagsResponse { tags }))
}

// ============================================================================
// Collector Handlers
// ============================================================================

/// Register a collector
async fn collector_register(
    State(state): State<AppState>,
    Json(request): Json<CollectorRegisterRequest>,
) -> axum::response::Response {
    let result = state
        .registry
        .register(
            &request.name,
            &request.secret,
            &request.categories,
            &request.locations,
            Utc::now(),
        )
        .await;

    match result {
        Ok(id) => (StatusCode::OK, Json(ApiResponse::success(id))).into_response(),
        Err(e) => (StatusCode::CONFLICT, Json(ErrorResponse::new(e.to_string()))).into_response(),
    }
}

/// Log a collector in
async fn collector_login(
    State(state): State<AppState>,
    Json(request): Json<CollectorLoginRequest>,
) -> axum::response::Response {
    match state.registry.login(&request.name, &request.secret, Utc::now()).await {
        Ok(token) => {
            (StatusCode::OK, Json(ApiResponse::success(LoginResponse { token }))).into_response()
        }
        Err(e) => {
            (StatusCode::UNAUTHORIZED, Json(ErrorResponse::new(e.to_string()))).into_response()
        }
    }
}

/// Record a collector heartbeat
async fn collector_heartbeat(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> axum::response::Response {
    match state.registry.heartbeat(&request.token, request.timestamp).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success("ok"))).into_response(),
        Err(e) => {
            (StatusCode::UNAUTHORIZED, Json(ErrorResponse::new(e.to_string()))).into_response()
        }
    }
}

/// Drain the collector's undelivered assignments
async fn poll_assignments(
    State(state): State<AppState>,
    Json(request): Json<AssignmentPollRequest>,
) -> axum::response::Response {
    let collector = match state.registry.resolve_token(&request.token).await {
        Ok(id) => id,
        Err(e) => {
            return (StatusCode::UNAUTHORIZED, Json(ErrorResponse::new(e.to_string())))
                .into_response();
        }
    };

    state
        .registry
        .update_capabilities(collector, &request.category_filter, &request.location_filter)
        .await;

    let assignments = state.engine.drain_assignments(collector, Utc::now()).await;
    (
        StatusCode::OK,
        Json(ApiResponse::success(AssignmentPollResponse { assignments })),
    )
        .into_response()
}

/// Accept a submitted result
async fn submit_result(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> axum::response::Response {
    let ack = |status: SubmitStatus, message: String| {
        (StatusCode::OK, Json(ApiResponse::success(SubmitAck { status, message })))
            .into_response()
    };

    match state.router.submit(request, Utc::now()).await {
        Ok(SubmitOutcome::Accepted) => ack(SubmitStatus::Accepted, "stored".to_string()),
        Ok(SubmitOutcome::Duplicate) => ack(SubmitStatus::Duplicate, "already seen".to_string()),
        Err(SubmitError::TaskClosed(id)) => {
            ack(SubmitStatus::Closed, format!("task {id} is closed"))
        }
        Err(SubmitError::NotAssigned(id)) => {
            ack(SubmitStatus::NotAssigned, format!("task {id} is not yours"))
        }
        Err(e @ SubmitError::InvalidToken) => {
            (StatusCode::UNAUTHORIZED, Json(ErrorResponse::new(e.to_string()))).into_response()
        }
        Err(e @ SubmitError::UnknownTask(_)) => {
            (StatusCode::NOT_FOUND, Json(ErrorResponse::new(e.to_string()))).into_response()
        }
    }
}

/// List all registered collectors
async fn list_collectors(State(state): State<AppState>) -> impl IntoResponse {
    let collectors = state.registry.list_all().await;
    let stats = state.registry.stats().await;
    Json(ApiResponse::success(CollectorsResponse { collectors, stats }))
}
