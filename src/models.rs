//! Core data structures shared between the dispatcher and collector sides
//!
//! Everything that crosses the wire lives here: source descriptors, task
//! windows, assignments, result records, and the request/response bodies of
//! both RPC surfaces. All timestamps are UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

/// Identifier of a registered collector.
///
/// Ids are issued sequentially at registration time, so ordering by id is
/// ordering by registration age. The assignment engine relies on this for
/// deterministic tie-breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectorId(pub u64);

impl fmt::Display for CollectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collector-{}", self.0)
    }
}

/// Identifier of a task (UUID v4, hex form).
pub type TaskId = String;

/// Generate a fresh task id.
pub fn new_task_id() -> TaskId {
    uuid::Uuid::new_v4().simple().to_string()
}

// ============================================================================
// Sources
// ============================================================================

/// Kind of external feed a source exposes.
///
/// The set is closed on purpose: each kind maps to one polling routine on the
/// collector side, selected by this tag rather than a string lookup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Plain RSS feed
    #[default]
    Rss,

    /// GDACS geo-tagged disaster feed
    Gdacs,
}

/// A single entry in the source catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Unique source identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Feed endpoint URL
    pub url: String,

    /// Feed kind (selects the polling routine)
    #[serde(default)]
    pub kind: SourceKind,

    /// Categories this source covers
    #[serde(default)]
    pub categories: Vec<String>,

    /// Locations this source covers
    #[serde(default)]
    pub locations: Vec<String>,
}

// ============================================================================
// Capability Filter
// ============================================================================

/// Category/location filter used both for collector eligibility checks and
/// source matching. An empty dimension matches anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityFilter {
    #[serde(default)]
    pub categories: Vec<String>,

    #[serde(default)]
    pub locations: Vec<String>,
}

impl CapabilityFilter {
    /// Build a filter from a task's single category/location pair.
    pub fn from_task(category: &str, location: &str) -> Self {
        let one = |s: &str| {
            let s = s.trim();
            if s.is_empty() {
                Vec::new()
            } else {
                vec![s.to_lowercase()]
            }
        };
        Self {
            categories: one(category),
            locations: one(location),
        }
    }

    /// Check whether the given capability sets satisfy this filter.
    ///
    /// Each non-empty dimension must intersect the corresponding set.
    pub fn matches(&self, categories: &HashSet<String>, locations: &HashSet<String>) -> bool {
        let dim = |wanted: &[String], have: &HashSet<String>| {
            wanted.is_empty() || wanted.iter().any(|w| have.contains(&w.to_lowercase()))
        };
        dim(&self.categories, categories) && dim(&self.locations, locations)
    }

    /// True if both dimensions are unconstrained.
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty() && self.locations.is_empty()
    }
}

/// Normalize a capability tag list into a lowercase set.
///
/// Comma-separated values inside a single tag are split, matching how
/// operators tend to write `"news, weather"` in config files.
pub fn normalize_tags(tags: &[String]) -> HashSet<String> {
    tags.iter()
        .flat_map(|t| t.split(','))
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

// ============================================================================
// Time Window
// ============================================================================

/// The `[start, end)` interval during which a task is actively collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Create a window, requiring `start < end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Window has not opened yet.
    pub fn is_before(&self, now: DateTime<Utc>) -> bool {
        now < self.start
    }

    /// Window has closed.
    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        now >= self.end
    }

    /// Window is currently open.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }
}

// ============================================================================
// Assignments
// ============================================================================

/// A task binding delivered to a collector over its assignment stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub keywords: String,
    pub category: String,
    pub location: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    /// Sources the collector should poll for this task
    pub sources: Vec<SourceSpec>,
}

impl TaskAssignment {
    pub fn window(&self) -> TimeWindow {
        TimeWindow {
            start: self.start_time,
            end: self.end_time,
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// A single collected entry, keyed by `(task_id, source_id, entry_id)`.
///
/// The triple is the system-wide deduplication identity: it must stay unique
/// across every collector that ever works the task, including replacements
/// brought in by failover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: TaskId,
    pub source_id: String,
    pub entry_id: String,

    /// Opaque structured document; not interpreted by the routing layer
    pub payload: serde_json::Value,

    pub observed_at: DateTime<Utc>,
}

// ============================================================================
// Collector-facing wire types
// ============================================================================

/// Request to register a collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorRegisterRequest {
    pub name: String,
    pub secret: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
}

/// Request to log a collector in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorLoginRequest {
    pub name: String,
    pub secret: String,
}

/// Successful login response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

/// Heartbeat from a collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub token: String,
    pub timestamp: DateTime<Utc>,
}

/// Poll for undelivered assignments, optionally (re)declaring capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentPollRequest {
    pub token: String,
    #[serde(default)]
    pub category_filter: Vec<String>,
    #[serde(default)]
    pub location_filter: Vec<String>,
}

/// Batch of assignments drained from the collector's durable queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignmentPollResponse {
    pub assignments: Vec<TaskAssignment>,
}

/// A collected entry submitted by a collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub token: String,
    pub task_id: TaskId,
    pub source_id: String,
    pub entry_id: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a result submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    /// New entry, stored and forwarded
    Accepted,

    /// Already-seen triple; acknowledged but not re-forwarded
    Duplicate,

    /// Task window has closed (or the task already finished)
    Closed,

    /// Submitting collector no longer owns the task
    NotAssigned,
}

impl SubmitStatus {
    /// Whether the entry should be marked as handled on the collector side.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Accepted | Self::Duplicate)
    }

    /// Whether the worker should stop feeding this task entirely.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::NotAssigned)
    }
}

/// Acknowledgement of a result submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAck {
    pub status: SubmitStatus,
    pub message: String,
}

// ============================================================================
// Client-facing wire types
// ============================================================================

/// Client account registration/login body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

/// Request to start a collection task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStartRequest {
    pub token: String,
    pub keywords: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub location: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Response carrying the created task id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStartResponse {
    pub task_id: TaskId,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_time_window_validation() {
        assert!(TimeWindow::new(ts(100), ts(200)).is_some());
        assert!(TimeWindow::new(ts(200), ts(200)).is_none());
        assert!(TimeWindow::new(ts(300), ts(200)).is_none());
    }

    #[test]
    fn test_time_window_phases() {
        let w = TimeWindow::new(ts(100), ts(200)).unwrap();

        assert!(w.is_before(ts(50)));
        assert!(w.contains(ts(100)));
        assert!(w.contains(ts(199)));
        assert!(w.is_closed(ts(200)));
        assert!(!w.contains(ts(200)));
    }

    #[test]
    fn test_capability_filter_empty_matches_any() {
        let filter = CapabilityFilter::default();
        let cats = normalize_tags(&["news".to_string()]);
        let locs = normalize_tags(&["europe".to_string()]);

        assert!(filter.matches(&cats, &locs));
        assert!(filter.matches(&HashSet::new(), &HashSet::new()));
    }

    #[test]
    fn test_capability_filter_intersection() {
        let filter = CapabilityFilter {
            categories: vec!["News".to_string()],
            locations: vec!["europe".to_string()],
        };
        let cats = normalize_tags(&["news".to_string(), "weather".to_string()]);
        let locs = normalize_tags(&["Europe".to_string()]);

        assert!(filter.matches(&cats, &locs));

        let other_locs = normalize_tags(&["asia".to_string()]);
        assert!(!filter.matches(&cats, &other_locs));
    }

    #[test]
    fn test_capability_filter_from_task() {
        let filter = CapabilityFilter::from_task("News", "");
        assert_eq!(filter.categories, vec!["news".to_string()]);
        assert!(filter.locations.is_empty());
    }

    #[test]
    fn test_normalize_tags_splits_and_lowercases() {
        let tags = normalize_tags(&["News, Weather".to_string(), " Sport ".to_string()]);
        assert!(tags.contains("news"));
        assert!(tags.contains("weather"));
        assert!(tags.contains("sport"));
        assert_eq!(tags.len(), 3);
    }

    #[test]
    fn test_submit_status_semantics() {
        assert!(SubmitStatus::Accepted.is_settled());
        assert!(SubmitStatus::Duplicate.is_settled());
        assert!(!SubmitStatus::Closed.is_settled());

        assert!(SubmitStatus::Closed.is_terminal());
        assert!(SubmitStatus::NotAssigned.is_terminal());
        assert!(!SubmitStatus::Accepted.is_terminal());
    }

    #[test]
    fn test_collector_id_ordering() {
        assert!(CollectorId(1) < CollectorId(2));
        assert_eq!(CollectorId(7).to_string(), "collector-7");
    }
}
