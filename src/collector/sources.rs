//! Feed source handlers
//!
//! One poller serves every source kind: `Rss` is a plain item feed, `Gdacs`
//! is RSS with geo tags lifted into the payload. Parsing is tolerant by
//! design; a malformed item is skipped, not fatal. Requests share one rate
//! limiter so a collector stays polite regardless of how many task workers
//! are live.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use regex::Regex;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::num::NonZeroU32;
use std::sync::OnceLock;
use thiserror::Error;

use crate::models::{SourceKind, SourceSpec};

// ============================================================================
// Errors
// ============================================================================

/// Feed polling errors
#[derive(Debug, Error)]
pub enum PollError {
    #[error("Failed to initialize poller: {0}")]
    Init(String),

    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Feed at {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Failed to parse feed from {url}: {message}")]
    Parse { url: String, message: String },
}

// ============================================================================
// Entries
// ============================================================================

/// One parsed feed item.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    /// Stable identity within the source (guid, link, or a content hash)
    pub id: String,
    pub title: String,
    pub link: String,
    pub published: String,
    pub summary: String,

    /// `"lat lon"` for geo-tagged feeds
    pub point: Option<String>,
}

impl FeedEntry {
    /// The opaque result payload submitted to the dispatcher.
    pub fn payload(&self, source: &SourceSpec) -> serde_json::Value {
        let mut doc = serde_json::json!({
            "source": source.id,
            "title": self.title,
            "link": self.link,
            "published": self.published,
            "summary": self.summary,
        });
        if let Some(point) = &self.point {
            doc["point"] = serde_json::Value::String(point.clone());
        }
        doc
    }

    /// Whether the entry text mentions any of the keywords. An empty keyword
    /// list matches everything.
    pub fn matches_keywords(&self, keywords: &str) -> bool {
        let terms: Vec<String> = keywords
            .split([',', ' '])
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if terms.is_empty() {
            return true;
        }

        let haystack = format!("{} {}", self.title, self.summary).to_lowercase();
        terms.iter().any(|t| haystack.contains(t))
    }
}

// ============================================================================
// Parsing
// ============================================================================

fn item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<item[\s>].*?</item>").unwrap())
}

fn field_re(tag: &'static str, cache: &'static OnceLock<Regex>) -> &'static Regex {
    cache.get_or_init(|| {
        Regex::new(&format!(r"(?s)<{tag}[^>]*>(.*?)</{tag}>")).unwrap()
    })
}

fn extract_field(item: &str, tag: &'static str, cache: &'static OnceLock<Regex>) -> String {
    field_re(tag, cache)
        .captures(item)
        .and_then(|c| c.get(1))
        .map(|m| clean_text(m.as_str()))
        .unwrap_or_default()
}

/// Strip CDATA wrappers and markup, decode entities, collapse whitespace.
fn clean_text(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    if let Some(inner) = text
        .strip_prefix("<![CDATA[")
        .and_then(|t| t.strip_suffix("]]>"))
    {
        text = inner.to_string();
    }

    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    let tag_re = TAG_RE.get_or_init(|| Regex::new(r"<[^>]+>").unwrap());
    let text = tag_re.replace_all(&text, " ");

    let decoded = html_escape::decode_html_entities(text.as_ref()).to_string();
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse the `<item>` blocks of an RSS document.
///
/// Entry identity prefers `<guid>`, then `<link>`, then a hash of the title
/// and publication date, so the same story keeps the same id across polls.
pub fn parse_feed(xml: &str, kind: SourceKind) -> Vec<FeedEntry> {
    static GUID: OnceLock<Regex> = OnceLock::new();
    static TITLE: OnceLock<Regex> = OnceLock::new();
    static LINK: OnceLock<Regex> = OnceLock::new();
    static PUBDATE: OnceLock<Regex> = OnceLock::new();
    static DESC: OnceLock<Regex> = OnceLock::new();

    let mut entries = Vec::new();
    for item_match in item_re().find_iter(xml) {
        let item = item_match.as_str();

        let guid = extract_field(item, "guid", &GUID);
        let title = extract_field(item, "title", &TITLE);
        let link = extract_field(item, "link", &LINK);
        let published = extract_field(item, "pubDate", &PUBDATE);
        let summary = extract_field(item, "description", &DESC);

        if title.is_empty() && link.is_empty() {
            continue;
        }

        let id = if !guid.is_empty() {
            guid
        } else if !link.is_empty() {
            link.clone()
        } else {
            let mut hasher = Sha256::new();
            hasher.update(title.as_bytes());
            hasher.update(published.as_bytes());
            format!("{:x}", hasher.finalize())
        };

        let point = match kind {
            SourceKind::Gdacs => {
                let raw = extract_geo_point(item);
                (!raw.is_empty()).then_some(raw)
            }
            SourceKind::Rss => None,
        };

        entries.push(FeedEntry {
            id,
            title,
            link,
            published,
            summary,
            point,
        });
    }
    entries
}

fn extract_geo_point(item: &str) -> String {
    static POINT: OnceLock<Regex> = OnceLock::new();
    static LAT: OnceLock<Regex> = OnceLock::new();
    static LON: OnceLock<Regex> = OnceLock::new();

    let point = extract_field(item, "georss:point", &POINT);
    if !point.is_empty() {
        return point;
    }

    // Some GDACS items carry separate geo:lat / geo:long elements
    let lat = extract_field(item, "geo:lat", &LAT);
    let lon = extract_field(item, "geo:long", &LON);
    if lat.is_empty() || lon.is_empty() {
        String::new()
    } else {
        format!("{lat} {lon}")
    }
}

// ============================================================================
// Poller
// ============================================================================

/// Rate-limited feed fetcher shared by all task workers in a collector.
pub struct FeedPoller {
    client: Client,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl FeedPoller {
    /// Create a poller with the given request budget per minute.
    pub fn new(
        requests_per_minute: u32,
        timeout: std::time::Duration,
    ) -> Result<Self, PollError> {
        let rate = NonZeroU32::new(requests_per_minute.max(1))
            .ok_or_else(|| PollError::Init("Rate must be non-zero".to_string()))?;
        let client = Client::builder()
            .timeout(timeout)
            .gzip(true)
            .user_agent(concat!("kestrel/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PollError::Init(e.to_string()))?;

        Ok(Self {
            client,
            rate_limiter: RateLimiter::direct(Quota::per_minute(rate)),
        })
    }

    /// Fetch and parse one source.
    pub async fn poll(&self, source: &SourceSpec) -> Result<Vec<FeedEntry>, PollError> {
        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .get(&source.url)
            .send()
            .await
            .map_err(|e| PollError::Request {
                url: source.url.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Status {
                url: source.url.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(|e| PollError::Parse {
            url: source.url.clone(),
            message: e.to_string(),
        })?;

        let entries = parse_feed(&body, source.kind);
        tracing::debug!(source = %source.id, entries = entries.len(), "Polled source");
        Ok(entries)
    }
}

// ============================================================================
// Tests
// ============================================================================
