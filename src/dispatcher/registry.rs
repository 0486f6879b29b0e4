//! Collector registry
//!
//! Tracks collector identity, sessions and liveness. Collectors register once
//! with a name and secret, log in to obtain a session token, and then
//! heartbeat periodically. A background sweep degrades quiet collectors in
//! two stages (Online → Suspect → Offline) and announces lost collectors on
//! an event channel so the assignment engine can fail their tasks over.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};

use crate::models::{CapabilityFilter, CollectorId, normalize_tags};

use super::users::{generate_salt, generate_token, hash_secret, verify_secret};

// ============================================================================
// Status
// ============================================================================

/// Liveness status of a collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectorStatus {
    /// Heartbeating normally
    Online,

    /// Missed at least half the heartbeat timeout; still eligible for work
    Suspect,

    /// Missed the full heartbeat timeout; tasks have been failed over
    Offline,
}

impl CollectorStatus {
    /// Whether the collector may receive new assignments.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Online | Self::Suspect)
    }
}

// ============================================================================
// Events
// ============================================================================

/// Registry events consumed by the assignment engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    /// Collector crossed the heartbeat timeout and went Offline
    Lost(CollectorId),

    /// Collector came back (heartbeat after Suspect/Offline) or logged in
    CapacityAvailable(CollectorId),
}

// ============================================================================
// Errors
// ============================================================================

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Collector name already registered
    DuplicateName(String),

    /// Unknown name or wrong secret
    InvalidCredentials,

    /// Token does not map to a live session
    UnknownToken,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateName(name) => write!(f, "Collector name already registered: {name}"),
            Self::InvalidCredentials => write!(f, "Invalid collector credentials"),
            Self::UnknownToken => write!(f, "Unknown or expired collector token"),
        }
    }
}

impl std::error::Error for RegistryError {}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone)]
struct CollectorRecord {
    id: CollectorId,
    name: String,
    salt: String,
    secret_hash: String,
    session_token: Option<String>,
    status: CollectorStatus,
    last_heartbeat_at: DateTime<Utc>,
    registered_at: DateTime<Utc>,
    categories: HashSet<String>,
    locations: HashSet<String>,
    heartbeat_count: u64,
    results_submitted: u64,
}

/// Read-only view of a collector, safe to expose over the API.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorSnapshot {
    pub id: CollectorId,
    pub name: String,
    pub status: CollectorStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub categories: Vec<String>,
    pub locations: Vec<String>,
    pub heartbeat_count: u64,
    pub results_submitted: u64,
}

impl CollectorRecord {
    fn snapshot(&self) -> CollectorSnapshot {
        let mut categories: Vec<String> = self.categories.iter().cloned().collect();
        let mut locations: Vec<String> = self.locations.iter().cloned().collect();
        categories.sort();
        locations.sort();

        CollectorSnapshot {
            id: self.id,
            name: self.name.clone(),
            status: self.status,
            last_heartbeat_at: self.last_heartbeat_at,
            registered_at: self.registered_at,
            categories,
            locations,
            heartbeat_count: self.heartbeat_count,
            results_submitted: self.results_submitted,
        }
    }
}

/// Registry counters for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub online: usize,
    pub suspect: usize,
    pub offline: usize,
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
struct RegistryInner {
    records: HashMap<CollectorId, CollectorRecord>,
    by_name: HashMap<String, CollectorId>,
    by_token: HashMap<String, CollectorId>,
    next_id: u64,
}

/// Collector identity, session and liveness tracking.
pub struct CollectorRegistry {
    inner: RwLock<RegistryInner>,
    heartbeat_timeout: Duration,
    events: mpsc::UnboundedSender<RegistryEvent>,
}

impl CollectorRegistry {
    /// Create a registry and the event receiver the assignment engine will
    /// consume.
    pub fn new(
        heartbeat_timeout: std::time::Duration,
    ) -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            inner: RwLock::new(RegistryInner::default()),
            heartbeat_timeout: Duration::from_std(heartbeat_timeout)
                .unwrap_or_else(|_| Duration::seconds(90)),
            events: tx,
        };
        (registry, rx)
    }

    /// Register a collector under a unique name.
    pub async fn register(
        &self,
        name: &str,
        secret: &str,
        categories: &[String],
        locations: &[String],
        now: DateTime<Utc>,
    ) -> Result<CollectorId, RegistryError> {
        let mut inner = self.inner.write().await;

        if inner.by_name.contains_key(name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }

        inner.next_id += 1;
        let id = CollectorId(inner.next_id);

        let salt = generate_salt();
        let secret_hash = hash_secret(secret, &salt);

        let record = CollectorRecord {
            id,
            name: name.to_string(),
            salt,
            secret_hash,
            session_token: None,
            status: CollectorStatus::Offline,
            last_heartbeat_at: now,
            registered_at: now,
            categories: normalize_tags(categories),
            locations: normalize_tags(locations),
            heartbeat_count: 0,
            results_submitted: 0,
        };

        inner.by_name.insert(name.to_string(), id);
        inner.records.insert(id, record);

        tracing::info!(collector = %id, name, "Registered collector");
        Ok(id)
    }

    /// Authenticate and issue a fresh session token.
    ///
    /// The previous token (if any) stops working, the collector becomes
    /// Online and a capacity event is announced.
    pub async fn login(
        &self,
        name: &str,
        secret: &str,
        now: DateTime<Utc>,
    ) -> Result<String, RegistryError> {
        let mut inner = self.inner.write().await;

        let id = *inner
            .by_name
            .get(name)
            .ok_or(RegistryError::InvalidCredentials)?;

        let record = inner
            .records
            .get(&id)
            .ok_or(RegistryError::InvalidCredentials)?;
        if !verify_secret(secret, &record.salt, &record.secret_hash) {
            return Err(RegistryError::InvalidCredentials);
        }

        let token = generate_token();
        let old_token = inner.records.get_mut(&id).and_then(|record| {
            record.status = CollectorStatus::Online;
            record.last_heartbeat_at = now;
            record.session_token.replace(token.clone())
        });
        if let Some(old) = old_token {
            inner.by_token.remove(&old);
        }
        inner.by_token.insert(token.clone(), id);

        tracing::info!(collector = %id, name, "Collector logged in");
        let _ = self.events.send(RegistryEvent::CapacityAvailable(id));
        Ok(token)
    }

    /// Record a heartbeat.
    ///
    /// A heartbeat from a Suspect or Offline collector restores it to Online
    /// and announces returned capacity.
    pub async fn heartbeat(
        &self,
        token: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;

        let id = *inner
            .by_token
            .get(token)
            .ok_or(RegistryError::UnknownToken)?;

        let mut recovered = false;
        if let Some(record) = inner.records.get_mut(&id) {
            record.last_heartbeat_at = timestamp;
            record.heartbeat_count += 1;
            if record.status != CollectorStatus::Online {
                tracing::info!(collector = %id, from = ?record.status, "Collector recovered");
                record.status = CollectorStatus::Online;
                recovered = true;
            }
        }
        drop(inner);

        if recovered {
            let _ = self.events.send(RegistryEvent::CapacityAvailable(id));
        }
        Ok(())
    }

    /// Resolve a session token to a collector id.
    pub async fn resolve_token(&self, token: &str) -> Result<CollectorId, RegistryError> {
        self.inner
            .read()
            .await
            .by_token
            .get(token)
            .copied()
            .ok_or(RegistryError::UnknownToken)
    }

    /// Replace a collector's declared capability sets.
    ///
    /// Empty filters leave the registered capabilities untouched.
    pub async fn update_capabilities(
        &self,
        id: CollectorId,
        categories: &[String],
        locations: &[String],
    ) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.records.get_mut(&id) {
            if !categories.is_empty() {
                record.categories = normalize_tags(categories);
            }
            if !locations.is_empty() {
                record.locations = normalize_tags(locations);
            }
        }
    }

    /// Collectors eligible for new work, sorted by registration order.
    pub async fn list_online(&self, filter: &CapabilityFilter) -> Vec<CollectorId> {
        let inner = self.inner.read().await;
        let mut ids: Vec<CollectorId> = inner
            .records
            .values()
            .filter(|r| r.status.is_available())
            .filter(|r| filter.matches(&r.categories, &r.locations))
            .map(|r| r.id)
            .collect();
        ids.sort();
        ids
    }

    /// Liveness sweep. Idempotent; call at a period of at most timeout / 2.
    ///
    /// Online collectors silent for timeout/2 become Suspect; collectors
    /// silent for the full timeout become Offline and a `Lost` event fires
    /// exactly once per outage.
    pub async fn sweep(&self, now: DateTime<Utc>) {
        let mut lost = Vec::new();
        {
            let mut inner = self.inner.write().await;
            for record in inner.records.values_mut() {
                // Never registered a session; nothing to degrade
                if record.session_token.is_none() {
                    continue;
                }

                let silence = now - record.last_heartbeat_at;
                if silence >= self.heartbeat_timeout {
                    if record.status != CollectorStatus::Offline {
                        tracing::warn!(
                            collector = %record.id,
                            name = %record.name,
                            silence_secs = silence.num_seconds(),
                            "Collector lost"
                        );
                        record.status = CollectorStatus::Offline;
                        lost.push(record.id);
                    }
                } else if silence >= self.heartbeat_timeout / 2
                    && record.status == CollectorStatus::Online
                {
                    tracing::warn!(
                        collector = %record.id,
                        name = %record.name,
                        silence_secs = silence.num_seconds(),
                        "Collector suspect"
                    );
                    record.status = CollectorStatus::Suspect;
                }
            }
        }

        for id in lost {
            let _ = self.events.send(RegistryEvent::Lost(id));
        }
    }

    /// Bump the submitted-results counter.
    pub async fn record_result_submitted(&self, id: CollectorId) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.records.get_mut(&id) {
            record.results_submitted += 1;
        }
    }

    /// Snapshot of one collector.
    pub async fn get(&self, id: CollectorId) -> Option<CollectorSnapshot> {
        self.inner
            .read()
            .await
            .records
            .get(&id)
            .map(|r| r.snapshot())
    }

    /// Snapshot of every collector, sorted by id.
    pub async fn list_all(&self) -> Vec<CollectorSnapshot> {
        let inner = self.inner.read().await;
        let mut all: Vec<CollectorSnapshot> =
            inner.records.values().map(|r| r.snapshot()).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Counts by status.
    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        let mut stats = RegistryStats {
            total: inner.records.len(),
            ..Default::default()
        };
        for record in inner.records.values() {
            match record.status {
                CollectorStatus::Online => stats.online += 1,
                CollectorStatus::Suspect => stats.suspect += 1,
                CollectorStatus::Offline => stats.offline += 1,
            }
        }
        stats
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration as StdDuration;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn registry() -> (CollectorRegistry, mpsc::UnboundedReceiver<RegistryEvent>) {
        CollectorRegistry::new(StdDuration::from_secs(60))
    }

    #[tokio::test]
    async fn test_register_and_login() {
        let (reg, mut events) = registry();

        let id = reg
            .register("c1", "s3cret", &["news".to_string()], &[], ts(0))
            .await
            .unwrap();
        let token = reg.login("c1", "s3cret", ts(1)).await.unwrap();

        assert_eq!(reg.resolve_token(&token).await.unwrap(), id);
        assert_eq!(
            events.recv().await,
            Some(RegistryEvent::CapacityAvailable(id))
        );
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let (reg, _events) = registry();
        reg.register("c1", "a", &[], &[], ts(0)).await.unwrap();

        assert!(matches!(
            reg.register("c1", "b", &[], &[], ts(1)).await,
            Err(RegistryError::DuplicateName(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_secret_rejected() {
        let (reg, _events) = registry();
        reg.register("c1", "right", &[], &[], ts(0)).await.unwrap();

        assert!(matches!(
            reg.login("c1", "wrong", ts(1)).await,
            Err(RegistryError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_fresh_login_invalidates_old_token() {
        let (reg, _events) = registry();
        reg.register("c1", "s", &[], &[], ts(0)).await.unwrap();

        let first = reg.login("c1", "s", ts(1)).await.unwrap();
        let second = reg.login("c1", "s", ts(2)).await.unwrap();

        assert!(reg.resolve_token(&first).await.is_err());
        assert!(reg.resolve_token(&second).await.is_ok());
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_token() {
        let (reg, _events) = registry();
        assert!(matches!(
            reg.heartbeat("bogus", ts(0)).await,
            Err(RegistryError::UnknownToken)
        ));
    }

    #[tokio::test]
    async fn test_two_stage_degradation() {
        let (reg, mut events) = registry();
        let id = reg.register("c1", "s", &[], &[], ts(0)).await.unwrap();
        let _token = reg.login("c1", "s", ts(0)).await.unwrap();
        let _ = events.recv().await;

        // Half the timeout: Suspect, still assignable
        reg.sweep(ts(30)).await;
        assert_eq!(reg.get(id).await.unwrap().status, CollectorStatus::Suspect);
        assert!(!reg.list_online(&CapabilityFilter::default()).await.is_empty());

        // Full timeout: Offline, Lost event fires once
        reg.sweep(ts(60)).await;
        assert_eq!(reg.get(id).await.unwrap().status, CollectorStatus::Offline);
        assert!(reg.list_online(&CapabilityFilter::default()).await.is_empty());
        assert_eq!(events.recv().await, Some(RegistryEvent::Lost(id)));

        // Repeated sweep stays quiet
        reg.sweep(ts(90)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_restores_online_and_signals_capacity() {
        let (reg, mut events) = registry();
        let id = reg.register("c1", "s", &[], &[], ts(0)).await.unwrap();
        let token = reg.login("c1", "s", ts(0)).await.unwrap();
        let _ = events.recv().await;

        reg.sweep(ts(61)).await;
        assert_eq!(events.recv().await, Some(RegistryEvent::Lost(id)));

        reg.heartbeat(&token, ts(70)).await.unwrap();
        assert_eq!(reg.get(id).await.unwrap().status, CollectorStatus::Online);
        assert_eq!(
            events.recv().await,
            Some(RegistryEvent::CapacityAvailable(id))
        );
    }

    #[tokio::test]
    async fn test_list_online_applies_capability_filter() {
        let (reg, _events) = registry();
        reg.register("news-eu", "s", &["news".to_string()], &["europe".to_string()], ts(0))
            .await
            .unwrap();
        reg.register("disaster", "s", &["disaster".to_string()], &[], ts(0))
            .await
            .unwrap();
        reg.login("news-eu", "s", ts(1)).await.unwrap();
        reg.login("disaster", "s", ts(1)).await.unwrap();

        let filter = CapabilityFilter::from_task("news", "europe");
        let online = reg.list_online(&filter).await;
        assert_eq!(online.len(), 1);

        let snap = reg.get(online[0]).await.unwrap();
        assert_eq!(snap.name, "news-eu");
    }

    #[tokio::test]
    async fn test_never_logged_in_collector_not_swept() {
        let (reg, mut events) = registry();
        reg.register("idle", "s", &[], &[], ts(0)).await.unwrap();

        reg.sweep(ts(1000)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stats_counts_by_status() {
        let (reg, _events) = registry();
        reg.register("a", "s", &[], &[], ts(0)).await.unwrap();
        reg.register("b", "s", &[], &[], ts(0)).await.unwrap();
        reg.login("a", "s", ts(0)).await.unwrap();

        let stats = reg.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.online, 1);
        assert_eq!(stats.offline, 1);
    }
}
