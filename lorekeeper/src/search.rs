//! Query engine: turns raw index hits into deduplicated, annotated results.
//!
//! Retrieval and scoring happen in the index generation (indexer.rs). This
//! module resolves the generation from the registry, annotates each hit with
//! the fields the query touched, applies post-filters and hands the result to
//! the deduplicator. Suggestions are a plain name scan and never touch tantivy.

use crate::config::SearchConfig;
use crate::dedup::{deduplicate, SourcePriority};
use crate::indexer::IndexGeneration;
use crate::interface::{IndexKey, RankedHit, RecordSummary, SearchFilters, SearchOptions};
use crate::registry::IndexRegistry;
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

pub struct QueryEngine {
    registry: Arc<IndexRegistry>,
    config: SearchConfig,
    priorities: SourcePriority,
}

impl QueryEngine {
    pub fn new(registry: Arc<IndexRegistry>, config: SearchConfig, priorities: SourcePriority) -> Self {
        Self {
            registry,
            config,
            priorities,
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn default_options(&self) -> SearchOptions {
        SearchOptions {
            limit: self.config.default_limit,
            fuzzy: true,
        }
    }

    pub fn search(&self, query: &str, key: IndexKey, options: SearchOptions) -> Vec<RankedHit> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }
        let Some(generation) = self.generation(key) else {
            return Vec::new();
        };
        let candidates = options.limit.saturating_mul(self.config.candidate_multiplier.max(1));
        let mut hits = self.ranked(&generation, query, options.fuzzy, candidates, None);
        hits.truncate(options.limit);
        hits
    }

    /// Search, keeping only hits that satisfy every set filter. Filters apply
    /// to the raw hits, so a book that lost deduplication can still be
    /// selected by a `source` filter.
    pub fn search_with_filters(&self, query: &str, key: IndexKey, filters: &SearchFilters) -> Vec<RankedHit> {
        self.search_filtered(query, key, filters, self.default_options())
    }

    /// Filtered search honouring `options` for the result limit and fuzziness.
    pub fn search_filtered(
        &self,
        query: &str,
        key: IndexKey,
        filters: &SearchFilters,
        options: SearchOptions,
    ) -> Vec<RankedHit> {
        if filters.is_empty() {
            return self.search(query, key, options);
        }
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }
        let Some(generation) = self.generation(key) else {
            return Vec::new();
        };
        let pool = self.config.filter_pool.max(options.limit);
        let mut hits = self.ranked(&generation, query, options.fuzzy, pool, Some(filters));
        hits.truncate(options.limit);
        hits
    }

    /// Names starting with the query, then names containing it. Case-insensitive,
    /// one entry per distinct name.
    pub fn get_suggestions(&self, query: &str, key: IndexKey, limit: usize) -> Vec<String> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() || limit == 0 {
            return Vec::new();
        }
        let Some(generation) = self.generation(key) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut prefix_matches = Vec::new();
        let mut substring_matches = Vec::new();
        for record in generation.records() {
            let lower = record.name.to_lowercase();
            if !lower.contains(&needle) || !seen.insert(lower.clone()) {
                continue;
            }
            if lower.starts_with(&needle) {
                prefix_matches.push(record.name.clone());
            } else {
                substring_matches.push(record.name.clone());
            }
        }

        prefix_matches.extend(substring_matches);
        prefix_matches.truncate(limit);
        prefix_matches
    }

    fn generation(&self, key: IndexKey) -> Option<Arc<IndexGeneration>> {
        let generation = self.registry.get(key);
        if generation.is_none() {
            warn!(index = %key, "no index built for requested key");
        }
        generation
    }

    fn ranked(
        &self,
        generation: &IndexGeneration,
        query: &str,
        fuzzy: bool,
        candidates: usize,
        filters: Option<&SearchFilters>,
    ) -> Vec<RankedHit> {
        let raw = match generation.search(query, fuzzy, candidates, &self.config) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(index = %generation.key(), error = %e, "index query failed");
                return Vec::new();
            }
        };

        let hits: Vec<RankedHit> = raw
            .par_iter()
            .filter_map(|(ordinal, score)| {
                let summary = generation.record(*ordinal)?;
                if let Some(filters) = filters {
                    if !matches_filters(summary, filters) {
                        return None;
                    }
                }
                Some(RankedHit {
                    summary: summary.clone(),
                    score: *score,
                    matched_fields: matched_fields(summary, query),
                    available_sources: Vec::new(),
                })
            })
            .collect();

        deduplicate(hits, &self.priorities)
    }
}

/// Fields the query touched: `field:exact` when the whole query appears in the
/// field, `field:word` when any single query word does.
pub fn matched_fields(summary: &RecordSummary, query: &str) -> Vec<String> {
    let whole = query.trim().to_lowercase();
    let words: Vec<&str> = whole.split_whitespace().collect();
    let fields = [
        ("name", Some(summary.name.as_str())),
        ("searchableText", summary.searchable_text.as_deref()),
        ("type", summary.kind.as_deref()),
        ("school", summary.school.as_deref()),
        ("category", Some(summary.category.as_str())),
        ("source", Some(summary.source.as_str())),
        ("rarity", summary.rarity.as_deref()),
    ];

    let mut matched: Vec<String> = Vec::new();
    for (label, value) in fields {
        let Some(value) = value else { continue };
        let value = value.to_lowercase();
        if !whole.is_empty() && value.contains(&whole) {
            push_unique(&mut matched, format!("{label}:exact"));
        }
        if words.iter().any(|word| value.contains(word)) {
            push_unique(&mut matched, format!("{label}:word"));
        }
    }
    matched
}

/// Every set filter must equal the summary's field exactly. A filter on a
/// field the summary lacks excludes it.
pub fn matches_filters(summary: &RecordSummary, filters: &SearchFilters) -> bool {
    fn text_matches(wanted: &Option<String>, actual: Option<&str>) -> bool {
        match wanted {
            None => true,
            Some(wanted) => actual == Some(wanted.as_str()),
        }
    }

    text_matches(&filters.source, Some(&summary.source))
        && text_matches(&filters.school, summary.school.as_deref())
        && text_matches(&filters.kind, summary.kind.as_deref())
        && text_matches(&filters.rarity, summary.rarity.as_deref())
        && filters.level.map_or(true, |level| summary.level == Some(level))
        && filters.cr.as_ref().map_or(true, |cr| summary.cr.as_ref() == Some(cr))
}

fn push_unique(items: &mut Vec<String>, item: String) {
    if !items.contains(&item) {
        items.push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{Category, ChallengeRating};

    fn spell(name: &str, source: &str, level: u32, school: &str) -> RecordSummary {
        let mut s = RecordSummary::new(name, source, Category::Spell);
        s.level = Some(level);
        s.school = Some(school.to_string());
        s
    }

    fn engine_with(items: Vec<RecordSummary>) -> QueryEngine {
        let registry = Arc::new(IndexRegistry::new());
        let key = IndexKey::Category(Category::Spell);
        registry.install(Arc::new(IndexGeneration::build(key, items).unwrap()));
        QueryEngine::new(registry, SearchConfig::default(), SourcePriority::new())
    }

    #[test]
    fn test_matched_fields_exact_and_word() {
        let mut summary = spell("Fire Bolt", "PHB", 0, "V");
        summary.searchable_text = Some("You hurl a mote of fire.".into());
        let fields = matched_fields(&summary, "Fire Bolt");
        assert_eq!(fields, vec!["name:exact", "name:word", "searchableText:word"]);
        assert!(matched_fields(&summary, "zzz").is_empty());
    }

    #[test]
    fn test_filters_and_semantics() {
        let mut summary = spell("Eldritch Blast", "PHB", 0, "V");
        summary.cr = Some(ChallengeRating::new("1/2"));
        let filters = SearchFilters {
            school: Some("V".into()),
            level: Some(0),
            ..Default::default()
        };
        assert!(matches_filters(&summary, &filters));
        let wrong_case = SearchFilters { school: Some("v".into()), ..filters.clone() };
        assert!(!matches_filters(&summary, &wrong_case));
        let wrong_level = SearchFilters { level: Some(1), ..filters.clone() };
        assert!(!matches_filters(&summary, &wrong_level));
        let rarity = SearchFilters { rarity: Some("rare".into()), ..Default::default() };
        assert!(!matches_filters(&summary, &rarity), "missing field never matches a set filter");
        let cr = SearchFilters { cr: Some(ChallengeRating::from_number(0.5)), ..Default::default() };
        assert!(matches_filters(&summary, &cr));
    }

    #[test]
    fn test_missing_index_returns_empty() {
        let engine = QueryEngine::new(Arc::new(IndexRegistry::new()), SearchConfig::default(), SourcePriority::new());
        assert!(engine.search("fire", IndexKey::Global, SearchOptions::default()).is_empty());
        assert!(engine.get_suggestions("fire", IndexKey::Global, 5).is_empty());
    }

    #[test]
    fn test_blank_query_returns_empty() {
        let engine = engine_with(vec![spell("Light", "PHB", 0, "V")]);
        let key = IndexKey::Category(Category::Spell);
        assert!(engine.search("   ", key, SearchOptions::default()).is_empty());
        assert!(engine.get_suggestions(" ", key, 5).is_empty());
    }

    #[test]
    fn test_search_deduplicates_and_limits() {
        let engine = engine_with(vec![
            spell("Shield", "XGE", 1, "A"),
            spell("Shield", "PHB", 1, "A"),
            spell("Shield of Faith", "PHB", 1, "A"),
            spell("Shillelagh", "PHB", 0, "T"),
        ]);
        let key = IndexKey::Category(Category::Spell);
        let hits = engine.search("shield", key, SearchOptions::default());
        let shields: Vec<&RankedHit> = hits.iter().filter(|h| h.summary.name == "Shield").collect();
        assert_eq!(shields.len(), 1);
        assert_eq!(shields[0].summary.source, "PHB");
        assert_eq!(shields[0].available_sources.len(), 2);

        let limited = engine.search("shield", key, SearchOptions { limit: 1, fuzzy: true });
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_source_filter_sees_losing_duplicates() {
        let engine = engine_with(vec![spell("Shield", "PHB", 1, "A"), spell("Shield", "XGE", 1, "A")]);
        let key = IndexKey::Category(Category::Spell);
        let filters = SearchFilters { source: Some("XGE".into()), ..Default::default() };
        let hits = engine.search_with_filters("shield", key, &filters);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].summary.source, "XGE");
    }

    #[test]
    fn test_filtered_search_honours_options() {
        let engine = engine_with(vec![
            spell("Shield", "PHB", 1, "A"),
            spell("Shield of Faith", "PHB", 1, "A"),
            spell("Shielding Ward", "HB", 1, "A"),
        ]);
        let key = IndexKey::Category(Category::Spell);
        let filters = SearchFilters { school: Some("A".into()), ..Default::default() };

        let one = engine.search_filtered("shield", key, &filters, SearchOptions { limit: 1, fuzzy: true });
        assert_eq!(one.len(), 1);

        let exact = engine.search_filtered("shieldd", key, &filters, SearchOptions { limit: 20, fuzzy: false });
        assert!(exact.is_empty());
        let fuzzy = engine.search_filtered("shieldd", key, &filters, SearchOptions { limit: 20, fuzzy: true });
        assert!(!fuzzy.is_empty());
    }

    #[test]
    fn test_suggestions_prefix_before_substring() {
        let engine = engine_with(vec![
            spell("Misfire Trap", "PHB", 1, "V"),
            spell("Fire Bolt", "PHB", 0, "V"),
            spell("fire bolt", "XGE", 0, "V"),
            spell("Firebolt Wand", "PHB", 0, "V"),
        ]);
        let key = IndexKey::Category(Category::Spell);
        assert_eq!(
            engine.get_suggestions("fir", key, 5),
            vec!["Fire Bolt", "Firebolt Wand", "Misfire Trap"]
        );
        assert_eq!(engine.get_suggestions("FIR", key, 2), vec!["Fire Bolt", "Firebolt Wand"]);
    }
}
