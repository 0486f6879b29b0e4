//! Source catalog
//!
//! The dispatcher loads the catalog of pollable feeds from a JSON file and
//! matches task filters against it at task-creation time. The catalog can be
//! reloaded at runtime so new sources become available without a restart.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

use crate::models::{normalize_tags, SourceSpec};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse catalog file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Duplicate source id in catalog: {0}")]
    DuplicateId(String),
}

// ============================================================================
// Catalog
// ============================================================================

/// On-disk catalog shape: either a bare array of sources or an object with a
/// top-level `sources` key.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    Wrapped { sources: Vec<SourceSpec> },
    Bare(Vec<SourceSpec>),
}

/// The set of feeds tasks can draw from.
#[derive(Debug, Clone, Default)]
pub struct SourceCatalog {
    sources: Vec<SourceSpec>,
}

impl SourceCatalog {
    /// Build a catalog from an explicit source list, rejecting duplicate ids.
    pub fn from_sources(sources: Vec<SourceSpec>) -> Result<Self, CatalogError> {
        let mut seen = BTreeSet::new();
        for source in &sources {
            if !seen.insert(source.id.clone()) {
                return Err(CatalogError::DuplicateId(source.id.clone()));
            }
        }
        Ok(Self { sources })
    }

    /// Load the catalog from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        let file: CatalogFile = serde_json::from_str(&raw)?;
        let sources = match file {
            CatalogFile::Wrapped { sources } => sources,
            CatalogFile::Bare(sources) => sources,
        };
        Self::from_sources(sources)
    }

    /// Number of sources in the catalog.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// All sources.
    pub fn sources(&self) -> &[SourceSpec] {
        &self.sources
    }

    /// Sources matching a category/location pair. Empty strings match any.
    ///
    /// Matching is case-insensitive; a source with no categories (or no
    /// locations) is treated as covering all of that dimension.
    pub fn matching(&self, category: &str, location: &str) -> Vec<SourceSpec> {
        let category = category.trim().to_lowercase();
        let location = location.trim().to_lowercase();

        self.sources
            .iter()
            .filter(|s| {
                let cats = normalize_tags(&s.categories);
                let locs = normalize_tags(&s.locations);
                let cat_ok = category.is_empty() || cats.is_empty() || cats.contains(&category);
                let loc_ok = location.is_empty() || locs.is_empty() || locs.contains(&location);
                cat_ok && loc_ok
            })
            .cloned()
            .collect()
    }

    /// Distinct categories across the catalog, sorted.
    pub fn categories(&self) -> Vec<String> {
        let set: BTreeSet<String> = self
            .sources
            .iter()
            .flat_map(|s| normalize_tags(&s.categories))
            .collect();
        set.into_iter().collect()
    }

    /// Distinct locations across the catalog, sorted.
    pub fn locations(&self) -> Vec<String> {
        let set: BTreeSet<String> = self
            .sources
            .iter()
            .flat_map(|s| normalize_tags(&s.locations))
            .collect();
        set.into_iter().collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceKind;
    use std::io::Write;

    fn source(id: &str, cats: &[&str], locs: &[&str]) -> SourceSpec {
        SourceSpec {
            id: id.to_string(),
            name: id.to_uppercase(),
            url: format!("https://feeds.example.com/{id}.xml"),
            kind: SourceKind::Rss,
            categories: cats.iter().map(|c| c.to_string()).collect(),
            locations: locs.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn catalog() -> SourceCatalog {
        SourceCatalog::from_sources(vec![
            source("bbc-world", &["news"], &["europe", "global"]),
            source("gdacs", &["disaster"], &[]),
            source("nhk", &["news", "weather"], &["asia"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_matching_by_category_and_location() {
        let cat = catalog();

        let hits = cat.matching("news", "asia");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "nhk");

        let hits = cat.matching("News", "Europe");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "bbc-world");
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let cat = catalog();
        assert_eq!(cat.matching("", "").len(), 3);
    }

    #[test]
    fn test_source_without_locations_covers_all() {
        let cat = catalog();
        let hits = cat.matching("disaster", "pacific");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "gdacs");
    }

    #[test]
    fn test_no_match_returns_empty() {
        let cat = catalog();
        assert!(cat.matching("sports", "").is_empty());
    }

    #[test]
    fn test_categories_and_locations_listing() {
        let cat = catalog();
        assert_eq!(cat.categories(), vec!["disaster", "news", "weather"]);
        assert_eq!(cat.locations(), vec!["asia", "europe", "global"]);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let result = SourceCatalog::from_sources(vec![
            source("a", &[], &[]),
            source("a", &[], &[]),
        ]);
        assert!(matches!(result, Err(CatalogError::DuplicateId(_))));
    }

    #[test]
    fn test_load_wrapped_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"sources": [{{"id": "x", "name": "X", "url": "https://x.example/rss"}}]}}"#
        )
        .unwrap();

        let cat = SourceCatalog::load(file.path()).unwrap();
        assert_eq!(cat.len(), 1);
        assert_eq!(cat.sources()[0].kind, SourceKind::Rss);
    }

    #[test]
    fn test_load_bare_array_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id": "y", "name": "Y", "url": "https://y.example/rss", "kind": "gdacs"}}]"#
        )
        .unwrap();

        let cat = SourceCatalog::load(file.path()).unwrap();
        assert_eq!(cat.sources()[0].kind, SourceKind::Gdacs);
    }
}
