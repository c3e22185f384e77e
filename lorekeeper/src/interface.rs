//! Public types shared by the index, search and cache layers.
//!
//! Everything the UI layer sees lives here: record summaries, ranked hits,
//! filters, cache statistics and the `RulesStoreApi` service trait.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// CATEGORIES
// ═══════════════════════════════════════════════════════════════════════════════

/// Content type partition. Doubles as the index namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Spell,
    Monster,
    Class,
    Race,
    Background,
    Feat,
    Item,
    Condition,
    Deity,
    OptionalFeature,
    Vehicle,
    Object,
    Trap,
    Hazard,
    Language,
    Action,
}

impl Category {
    pub const ALL: [Category; 16] = [
        Category::Spell,
        Category::Monster,
        Category::Class,
        Category::Race,
        Category::Background,
        Category::Feat,
        Category::Item,
        Category::Condition,
        Category::Deity,
        Category::OptionalFeature,
        Category::Vehicle,
        Category::Object,
        Category::Trap,
        Category::Hazard,
        Category::Language,
        Category::Action,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Spell => "spell",
            Category::Monster => "monster",
            Category::Class => "class",
            Category::Race => "race",
            Category::Background => "background",
            Category::Feat => "feat",
            Category::Item => "item",
            Category::Condition => "condition",
            Category::Deity => "deity",
            Category::OptionalFeature => "optionalfeature",
            Category::Vehicle => "vehicle",
            Category::Object => "object",
            Category::Trap => "trap",
            Category::Hazard => "hazard",
            Category::Language => "language",
            Category::Action => "action",
        }
    }

    /// Directory on the origin that holds this category's per-source files.
    pub fn data_dir(&self) -> &'static str {
        match self {
            Category::Spell => "spells",
            Category::Monster => "bestiary",
            Category::Class => "class",
            Category::Item => "items",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = LorekeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| LorekeeperError::InvalidInput(format!("unknown category: {s}")))
    }
}

/// Registry key: one index per category plus the merged global index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKey {
    Category(Category),
    Global,
}

impl IndexKey {
    pub fn for_category(category: Option<Category>) -> Self {
        category.map_or(IndexKey::Global, IndexKey::Category)
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Category(c) => f.write_str(c.as_str()),
            IndexKey::Global => f.write_str("global"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECORDS AND HITS
// ═══════════════════════════════════════════════════════════════════════════════

/// Challenge rating as published. Numeric ratings are normalized to the
/// printed form so `0.5` and `"1/2"` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawChallengeRating", into = "String")]
pub struct ChallengeRating(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawChallengeRating {
    Number(f64),
    Text(String),
}

impl From<RawChallengeRating> for ChallengeRating {
    fn from(raw: RawChallengeRating) -> Self {
        match raw {
            RawChallengeRating::Number(n) => ChallengeRating::from_number(n),
            RawChallengeRating::Text(s) => ChallengeRating::new(&s),
        }
    }
}

impl From<ChallengeRating> for String {
    fn from(cr: ChallengeRating) -> Self {
        cr.0
    }
}

impl ChallengeRating {
    pub fn new(text: &str) -> Self {
        let trimmed = text.trim();
        match trimmed.parse::<f64>() {
            Ok(n) if !trimmed.contains('/') => Self::from_number(n),
            _ => Self(trimmed.to_string()),
        }
    }

    pub fn from_number(n: f64) -> Self {
        let text = if (n - 0.125).abs() < f64::EPSILON {
            "1/8".to_string()
        } else if (n - 0.25).abs() < f64::EPSILON {
            "1/4".to_string()
        } else if (n - 0.5).abs() < f64::EPSILON {
            "1/2".to_string()
        } else if n.fract() == 0.0 {
            format!("{}", n as i64)
        } else {
            n.to_string()
        };
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChallengeRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lightweight indexable projection of a full rules record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSummary {
    pub name: String,
    pub source: String,
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rarity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cr: Option<ChallengeRating>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub searchable_text: Option<String>,
}

impl RecordSummary {
    pub fn new(name: impl Into<String>, source: impl Into<String>, category: Category) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            category,
            page: None,
            level: None,
            school: None,
            kind: None,
            rarity: None,
            cr: None,
            searchable_text: None,
        }
    }
}

/// A single search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedHit {
    pub summary: RecordSummary,
    pub score: f32,
    pub matched_fields: Vec<String>,
    /// Every source book the entity was seen in. Filled by deduplication.
    #[serde(default)]
    pub available_sources: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchOptions {
    pub limit: usize,
    pub fuzzy: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { limit: 20, fuzzy: true }
    }
}

/// Exact-match post filters. Unset fields match everything; set fields are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    pub source: Option<String>,
    pub level: Option<u32>,
    pub school: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub cr: Option<ChallengeRating>,
    pub rarity: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.source.is_none()
            && self.level.is_none()
            && self.school.is_none()
            && self.kind.is_none()
            && self.cr.is_none()
            && self.rarity.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CACHE REPORTING
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub index_count: u64,
    pub data_count: u64,
    /// Total payload bytes across the index and data partitions
    pub total_size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub removed_index_count: u64,
    pub removed_data_count: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
pub enum LorekeeperError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Index error: {0}")]
    IndexError(String),
    #[error("Cache error: {0}")]
    CacheError(String),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<crate::database::DatabaseError> for LorekeeperError {
    fn from(e: crate::database::DatabaseError) -> Self {
        LorekeeperError::DatabaseError(e.to_string())
    }
}

impl From<crate::indexer::IndexerError> for LorekeeperError {
    fn from(e: crate::indexer::IndexerError) -> Self {
        LorekeeperError::IndexError(e.to_string())
    }
}

impl From<crate::cache::CacheError> for LorekeeperError {
    fn from(e: crate::cache::CacheError) -> Self {
        LorekeeperError::CacheError(e.to_string())
    }
}

impl From<crate::config::ConfigError> for LorekeeperError {
    fn from(e: crate::config::ConfigError) -> Self {
        LorekeeperError::ConfigError(e.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SERVICE INTERFACE
// ═══════════════════════════════════════════════════════════════════════════════

/// Operations exposed to the UI layer. Every method degrades to an empty or
/// default value instead of failing.
#[async_trait::async_trait]
pub trait RulesStoreApi: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────────
    // Search
    // ─────────────────────────────────────────────────────────────────────────────

    /// Search one category, or the global index when `category` is `None`.
    fn search(&self, query: &str, category: Option<Category>) -> Vec<RankedHit>;

    fn search_with_filters(
        &self,
        query: &str,
        category: Option<Category>,
        filters: &SearchFilters,
    ) -> Vec<RankedHit>;

    /// Record names for type-ahead: prefix matches first, then substring matches.
    fn get_suggestions(&self, query: &str, category: Option<Category>, limit: usize) -> Vec<String>;

    // ─────────────────────────────────────────────────────────────────────────────
    // Index construction
    // ─────────────────────────────────────────────────────────────────────────────

    fn build_category_index(&self, items: Vec<RecordSummary>, category: Category);

    fn build_global_index(&self, items: Vec<RecordSummary>);

    // ─────────────────────────────────────────────────────────────────────────────
    // Cache
    // ─────────────────────────────────────────────────────────────────────────────

    /// Startup hook. Sweeps stale cache entries; never fails.
    async fn initialize(&self);

    async fn clear_cache(&self);

    async fn get_cache_stats(&self) -> CacheStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_round_trips_through_str() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>().unwrap(), category);
        }
        assert!("nonsense".parse::<Category>().is_err());
        assert_eq!(" Spell ".parse::<Category>().unwrap(), Category::Spell);
    }

    #[test]
    fn test_challenge_rating_normalizes_fractions() {
        let from_num: ChallengeRating = serde_json::from_str("0.5").unwrap();
        let from_text: ChallengeRating = serde_json::from_str("\"1/2\"").unwrap();
        assert_eq!(from_num, from_text);
        assert_eq!(ChallengeRating::from_number(0.125).as_str(), "1/8");
        assert_eq!(ChallengeRating::from_number(17.0).as_str(), "17");
        assert_eq!(ChallengeRating::new("5").as_str(), "5");
        assert_eq!(serde_json::to_string(&from_num).unwrap(), "\"1/2\"");
    }

    #[test]
    fn test_summary_serializes_camel_case() {
        let mut summary = RecordSummary::new("Fireball", "PHB", Category::Spell);
        summary.searchable_text = Some("A bright streak".into());
        summary.kind = Some("evocation".into());
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["searchableText"], "A bright streak");
        assert_eq!(json["type"], "evocation");
        assert_eq!(json["category"], "spell");
        assert!(json.get("level").is_none());
    }

    #[test]
    fn test_index_key_display() {
        assert_eq!(IndexKey::for_category(Some(Category::Monster)).to_string(), "monster");
        assert_eq!(IndexKey::for_category(None).to_string(), "global");
    }
}
