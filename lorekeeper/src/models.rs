//! Cache entries, store keys and the projection from raw rules records to
//! indexable summaries.

use crate::interface::{Category, ChallengeRating, RecordSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// Longest searchable text kept per record. Longer entries are cut on a char boundary.
pub const MAX_SEARCHABLE_TEXT_CHARS: usize = 2000;

// ═══════════════════════════════════════════════════════════════════════════════
// CACHE ENTRIES
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable store partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// Summary arrays backing an index generation
    Index,
    /// Full per-source record arrays
    Data,
    /// One `CacheMetadata` document per index or data entry
    Metadata,
}

impl Partition {
    pub fn table(&self) -> &'static str {
        match self {
            Partition::Index => "index_store",
            Partition::Data => "data_store",
            Partition::Metadata => "metadata_store",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Index => "index",
            Partition::Data => "data",
            Partition::Metadata => "metadata",
        }
    }
}

/// Cached payload of the global index: the summaries plus the categories they
/// were merged from, so a request for a different set is a miss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalIndexSnapshot {
    pub categories: Vec<Category>,
    pub summaries: Vec<RecordSummary>,
}

impl GlobalIndexSnapshot {
    pub fn new(categories: &[Category], summaries: Vec<RecordSummary>) -> Self {
        Self {
            categories: normalized_categories(categories),
            summaries,
        }
    }

    pub fn covers(&self, categories: &[Category]) -> bool {
        self.categories == normalized_categories(categories)
    }
}

fn normalized_categories(categories: &[Category]) -> Vec<Category> {
    let mut sorted = categories.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

/// Deterministic cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    CategoryIndex(Category),
    GlobalIndex,
    SourceData(Category, String),
}

impl CacheKey {
    /// `spell` for a category index, `global` for the merged index, `spell-PHB` for source data.
    pub fn storage_key(&self) -> String {
        match self {
            CacheKey::CategoryIndex(c) => c.as_str().to_string(),
            CacheKey::GlobalIndex => "global".to_string(),
            CacheKey::SourceData(c, source) => format!("{}-{}", c.as_str(), source),
        }
    }

    pub fn partition(&self) -> Partition {
        match self {
            CacheKey::CategoryIndex(_) | CacheKey::GlobalIndex => Partition::Index,
            CacheKey::SourceData(..) => Partition::Data,
        }
    }

    pub fn category(&self) -> Option<Category> {
        match self {
            CacheKey::CategoryIndex(c) | CacheKey::SourceData(c, _) => Some(*c),
            CacheKey::GlobalIndex => None,
        }
    }

    pub fn source(&self) -> Option<&str> {
        match self {
            CacheKey::SourceData(_, source) => Some(source),
            _ => None,
        }
    }

    /// Key of the metadata document describing this entry.
    pub fn metadata_key(&self) -> String {
        metadata_key(self.partition(), &self.storage_key())
    }
}

pub(crate) fn metadata_key(partition: Partition, storage_key: &str) -> String {
    format!("{}:{}", partition.as_str(), storage_key)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    /// Write time, milliseconds since the Unix epoch
    pub timestamp: i64,
    pub schema_version: String,
    /// `None` for the merged global index
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl CacheMetadata {
    /// Valid when written under the live schema version and no older than `expiry_ms`.
    pub fn is_valid(&self, schema_version: &str, expiry_ms: i64, now_ms: i64) -> bool {
        self.schema_version == schema_version && now_ms.saturating_sub(self.timestamp) <= expiry_ms
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub metadata: CacheMetadata,
    pub payload: T,
}

// ═══════════════════════════════════════════════════════════════════════════════
// FULL RECORDS
// ═══════════════════════════════════════════════════════════════════════════════

/// A full record as found at the loading boundary: either exactly one source
/// carries it, or several books publish their own variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "records", rename_all = "camelCase")]
pub enum RecordPayload {
    SingleSource(Value),
    MultiSource(BTreeMap<String, Value>),
}

impl RecordPayload {
    /// Collapse `(source, record)` matches. Returns `None` when nothing matched.
    pub fn from_matches(matches: Vec<(String, Value)>) -> Option<Self> {
        match matches.len() {
            0 => None,
            1 => matches.into_iter().next().map(|(_, record)| RecordPayload::SingleSource(record)),
            _ => Some(RecordPayload::MultiSource(matches.into_iter().collect())),
        }
    }

    pub fn sources(&self) -> Vec<String> {
        match self {
            RecordPayload::SingleSource(record) => record
                .get("source")
                .and_then(Value::as_str)
                .map(|s| vec![s.to_string()])
                .unwrap_or_default(),
            RecordPayload::MultiSource(map) => map.keys().cloned().collect(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROJECTION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record has no name")]
    MissingName,
    #[error("record {0:?} has no source")]
    MissingSource(String),
}

impl RecordSummary {
    /// Project a raw rules record onto the indexable fields.
    ///
    /// Only `name` and `source` are required. Unknown shapes for the optional
    /// fields are ignored rather than rejected.
    pub fn from_record(category: Category, record: &Value) -> Result<Self, RecordError> {
        let obj = record.as_object().ok_or(RecordError::NotAnObject)?;

        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or(RecordError::MissingName)?;
        let source = obj
            .get("source")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RecordError::MissingSource(name.to_string()))?;

        let mut summary = RecordSummary::new(name, source, category);
        summary.page = obj.get("page").and_then(Value::as_u64).and_then(|p| u32::try_from(p).ok());
        summary.level = obj.get("level").and_then(Value::as_u64).and_then(|l| u32::try_from(l).ok());
        summary.school = string_field(obj.get("school"));
        summary.kind = obj.get("type").and_then(|t| match t {
            Value::String(s) => Some(s.clone()),
            Value::Object(inner) => string_field(inner.get("type")),
            _ => None,
        });
        summary.rarity = string_field(obj.get("rarity"));
        summary.cr = obj.get("cr").and_then(|cr| match cr {
            Value::Number(n) => n.as_f64().map(ChallengeRating::from_number),
            Value::String(s) => Some(ChallengeRating::new(s)),
            Value::Object(inner) => inner.get("cr").and_then(Value::as_str).map(ChallengeRating::new),
            _ => None,
        });

        let mut text = String::new();
        if let Some(entries) = obj.get("entries") {
            collect_text(entries, &mut text);
        }
        if !text.is_empty() {
            summary.searchable_text = Some(truncate_chars(&text, MAX_SEARCHABLE_TEXT_CHARS));
        }

        Ok(summary)
    }
}

/// Project every record, skipping (and logging) the malformed ones.
pub fn summaries_from_records(category: Category, records: &[Value]) -> Vec<RecordSummary> {
    records
        .iter()
        .enumerate()
        .filter_map(|(position, record)| match RecordSummary::from_record(category, record) {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(%category, position, error = %e, "skipping malformed record");
                None
            }
        })
        .collect()
}

fn string_field(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Append every string leaf of an `entries` tree, whitespace separated.
fn collect_text(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(s.trim());
        }
        Value::Array(items) => items.iter().for_each(|item| collect_text(item, out)),
        Value::Object(map) => {
            for key in ["name", "entries", "items", "entry"] {
                if let Some(inner) = map.get(key) {
                    collect_text(inner, out);
                }
            }
        }
        _ => {}
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_storage_keys() {
        assert_eq!(CacheKey::CategoryIndex(Category::Spell).storage_key(), "spell");
        assert_eq!(CacheKey::GlobalIndex.storage_key(), "global");
        let data = CacheKey::SourceData(Category::Spell, "PHB".into());
        assert_eq!(data.storage_key(), "spell-PHB");
        assert_eq!(data.partition(), Partition::Data);
        assert_eq!(data.metadata_key(), "data:spell-PHB");
        assert_eq!(CacheKey::GlobalIndex.category(), None);
    }

    #[test]
    fn test_metadata_validity() {
        let meta = CacheMetadata {
            timestamp: 1_000,
            schema_version: "2.2.0".into(),
            category: Some(Category::Spell),
            source: None,
        };
        assert!(meta.is_valid("2.2.0", 500, 1_500));
        assert!(!meta.is_valid("2.2.0", 500, 1_501));
        assert!(!meta.is_valid("2.1.0", 500, 1_000));
    }

    #[test]
    fn test_from_record_projects_fields() {
        let record = json!({
            "name": "Fireball",
            "source": "PHB",
            "page": 241,
            "level": 3,
            "school": "V",
            "entries": [
                "A bright streak flashes.",
                {"type": "entries", "name": "At Higher Levels", "entries": ["More damage."]}
            ]
        });
        let summary = RecordSummary::from_record(Category::Spell, &record).unwrap();
        assert_eq!(summary.name, "Fireball");
        assert_eq!(summary.page, Some(241));
        assert_eq!(summary.level, Some(3));
        assert_eq!(summary.school.as_deref(), Some("V"));
        assert_eq!(
            summary.searchable_text.as_deref(),
            Some("A bright streak flashes. At Higher Levels More damage.")
        );
    }

    #[test]
    fn test_from_record_nested_type_and_cr() {
        let record = json!({
            "name": "Goblin",
            "source": "MM",
            "type": {"type": "humanoid", "tags": ["goblinoid"]},
            "cr": "1/4"
        });
        let summary = RecordSummary::from_record(Category::Monster, &record).unwrap();
        assert_eq!(summary.kind.as_deref(), Some("humanoid"));
        assert_eq!(summary.cr.unwrap().as_str(), "1/4");
    }

    #[test]
    fn test_malformed_records_are_skipped() {
        let records = vec![
            json!({"name": "Shield", "source": "PHB"}),
            json!({"name": "   ", "source": "PHB"}),
            json!({"source": "PHB"}),
            json!({"name": "Orphan"}),
            json!("not an object"),
        ];
        assert_eq!(
            RecordSummary::from_record(Category::Spell, &records[3]),
            Err(RecordError::MissingSource("Orphan".into()))
        );
        let summaries = summaries_from_records(Category::Spell, &records);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, "Shield");
    }

    #[test]
    fn test_payload_from_matches() {
        assert_eq!(RecordPayload::from_matches(vec![]), None);
        let single = RecordPayload::from_matches(vec![("PHB".into(), json!({"name": "Light", "source": "PHB"}))]).unwrap();
        assert_eq!(single.sources(), vec!["PHB".to_string()]);
        let multi = RecordPayload::from_matches(vec![
            ("XPHB".into(), json!({"name": "Light"})),
            ("PHB".into(), json!({"name": "Light"})),
        ])
        .unwrap();
        assert!(matches!(multi, RecordPayload::MultiSource(_)));
        assert_eq!(multi.sources(), vec!["PHB".to_string(), "XPHB".to_string()]);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_global_snapshot_covers_same_category_set() {
        let snapshot = GlobalIndexSnapshot::new(&[Category::Spell, Category::Monster], Vec::new());
        assert!(snapshot.covers(&[Category::Monster, Category::Spell, Category::Spell]));
        assert!(!snapshot.covers(&[Category::Spell]));
        assert!(!snapshot.covers(&[Category::Spell, Category::Monster, Category::Item]));
    }
}
