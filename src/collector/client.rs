//! Dispatcher client for collector processes
//!
//! Thin reqwest wrapper over the dispatcher's collector surface with
//! bounded retries. The session token is held behind a lock so the
//! heartbeat loop and task workers share one session.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::models::{
    AssignmentPollRequest, AssignmentPollResponse, CollectorLoginRequest,
    CollectorRegisterRequest, HeartbeatRequest, LoginResponse, SubmitAck, SubmitRequest,
    TaskAssignment,
};

use super::config::CollectorConfig;

// ============================================================================
// API Response Wrapper
// ============================================================================

/// Generic API response from the dispatcher
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

// ============================================================================
// Client Errors
// ============================================================================

/// Client errors
#[derive(Debug, Clone)]
pub enum ClientError {
    /// Initialization error
    InitError(String),

    /// Network error
    NetworkError(String),

    /// HTTP error
    HttpError { status: u16, message: String },

    /// Parse error
    ParseError(String),

    /// Invalid response
    InvalidResponse(String),

    /// No session; login first
    NotLoggedIn,
}

impl ClientError {
    /// Authentication failures mean the session token is stale and a fresh
    /// login is needed.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::HttpError { status: 401, .. } | Self::NotLoggedIn)
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InitError(msg) => write!(f, "Initialization error: {msg}"),
            Self::NetworkError(msg) => write!(f, "Network error: {msg}"),
            Self::HttpError { status, message } => {
                write!(f, "HTTP error ({status}): {message}")
            }
            Self::ParseError(msg) => write!(f, "Parse error: {msg}"),
            Self::InvalidResponse(msg) => write!(f, "Invalid response: {msg}"),
            Self::NotLoggedIn => write!(f, "Not logged in"),
        }
    }
}

impl std::error::Error for ClientError {}

// ============================================================================
// Dispatcher Client
// ============================================================================

/// Client for the dispatcher's collector surface
pub struct DispatcherClient {
    base_url: String,
    http_client: Client,
    token: RwLock<Option<String>>,
    retry_count: u32,
    retry_delay: std::time::Duration,
}

impl DispatcherClient {
    /// Create a new dispatcher client
    pub fn new(config: &CollectorConfig) -> Result<Self, ClientError> {
        let http_client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ClientError::InitError(e.to_string()))?;

        Ok(Self {
            base_url: config.dispatcher_url.trim_end_matches('/').to_string(),
            http_client,
            token: RwLock::new(None),
            retry_count: 3,
            retry_delay: std::time::Duration::from_secs(1),
        })
    }

    /// Register this collector. A duplicate-name conflict is fine when the
    /// collector restarted; login still works with the same secret.
    pub async fn register(&self, config: &CollectorConfig) -> Result<(), ClientError> {
        let request = CollectorRegisterRequest {
            name: config.name.clone(),
            secret: config.secret.clone(),
            categories: config.categories.clone(),
            locations: config.locations.clone(),
        };
        let url = format!("{}/api/collector/register", self.base_url);

        match self.post_with_retry::<_, ApiResponse<u64>>(&url, &request).await {
            Ok(_) => Ok(()),
            Err(ClientError::HttpError { status: 409, .. }) => {
                tracing::debug!(name = %config.name, "Already registered");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Log in and store the session token.
    pub async fn login(&self, config: &CollectorConfig) -> Result<(), ClientError> {
        let request = CollectorLoginRequest {
            name: config.name.clone(),
            secret: config.secret.clone(),
        };
        let url = format!("{}/api/collector/login", self.base_url);

        let response: ApiResponse<LoginResponse> = self.post_with_retry(&url, &request).await?;
        let login = response
            .data
            .ok_or_else(|| ClientError::InvalidResponse("Missing login data".to_string()))?;

        *self.token.write().await = Some(login.token);
        tracing::info!(name = %config.name, "Logged in to dispatcher");
        Ok(())
    }

    async fn session_token(&self) -> Result<String, ClientError> {
        self.token
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotLoggedIn)
    }

    /// Send a heartbeat.
    pub async fn heartbeat(&self, now: DateTime<Utc>) -> Result<(), ClientError> {
        let request = HeartbeatRequest {
            token: self.session_token().await?,
            timestamp: now,
        };
        let url = format!("{}/api/collector/heartbeat", self.base_url);

        let _: ApiResponse<String> = self.post_with_retry(&url, &request).await?;
        Ok(())
    }

    /// Drain undelivered assignments, declaring capabilities.
    pub async fn poll_assignments(
        &self,
        config: &CollectorConfig,
    ) -> Result<Vec<TaskAssignment>, ClientError> {
        let request = AssignmentPollRequest {
            token: self.session_token().await?,
            category_filter: config.categories.clone(),
            location_filter: config.locations.clone(),
        };
        let url = format!("{}/api/collector/assignments", self.base_url);

        let response: ApiResponse<AssignmentPollResponse> =
            self.post_with_retry(&url, &request).await?;
        Ok(response.data.unwrap_or_default().assignments)
    }

    /// Submit one collected entry.
    ///
    /// Not retried here: the worker leaves failed entries unmarked and the
    /// next refresh cycle resubmits them.
    pub async fn submit_result(
        &self,
        task_id: &str,
        source_id: &str,
        entry_id: &str,
        payload: serde_json::Value,
        observed_at: DateTime<Utc>,
    ) -> Result<SubmitAck, ClientError> {
        let request = SubmitRequest {
            token: self.session_token().await?,
            task_id: task_id.to_string(),
            source_id: source_id.to_string(),
            entry_id: entry_id.to_string(),
            payload,
            timestamp: observed_at,
        };
        let url = format!("{}/api/collector/results", self.base_url);

        let response: ApiResponse<SubmitAck> = self.post_once(&url, &request).await?;
        response
            .data
            .ok_or_else(|| ClientError::InvalidResponse("Missing submit ack".to_string()))
    }

    // Internal: single POST attempt
    async fn post_once<T: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<R, ClientError> {
        match self.http_client.post(url).json(body).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    response
                        .json::<R>()
                        .await
                        .map_err(|e| ClientError::ParseError(e.to_string()))
                } else {
                    Err(ClientError::HttpError {
                        status: response.status().as_u16(),
                        message: response.text().await.unwrap_or_default(),
                    })
                }
            }
            Err(e) => Err(ClientError::NetworkError(e.to_string())),
        }
    }

    // Internal: POST request with retry
    async fn post_with_retry<T: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<R, ClientError> {
        let mut last_error = None;

        for attempt in 0..=self.retry_count {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }

            match self.post_once(url, body).await {
                Ok(data) => return Ok(data),
                // Client-side errors will not improve on retry
                Err(e @ ClientError::HttpError { status: 400..=499, .. }) => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ClientError::NetworkError("Unknown error".to_string())))
    }
}

// ============================================================================
// Tests
// ============================================================================
