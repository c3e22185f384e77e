//! Collapses hits for the same named entity published in several books.
//!
//! Hits are grouped by `category:lowercase(name)`. The representative is the
//! hit from the highest-priority source, then the highest score; an exact tie
//! keeps the first hit seen. Every source in the group is carried on the
//! representative's `available_sources`.

use crate::interface::RankedHit;
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};

/// Priority for any source missing from the table.
pub const UNKNOWN_SOURCE_PRIORITY: u32 = 10;

/// Built-in ranking of source books. Revised core books first, then the
/// original core books, then supplements and setting books.
static DEFAULT_PRIORITIES: Lazy<HashMap<String, u32>> = Lazy::new(|| {
    [
        ("XPHB", 110),
        ("XMM", 110),
        ("XDMG", 110),
        ("PHB", 100),
        ("MM", 100),
        ("DMG", 100),
        ("XGE", 80),
        ("TCE", 80),
        ("MPMM", 75),
        ("FTD", 70),
        ("BGG", 70),
        ("BMT", 70),
        ("VGM", 60),
        ("MTF", 60),
        ("SCAG", 50),
        ("EGW", 50),
        ("GGR", 50),
        ("MOT", 50),
        ("VRGR", 50),
        ("SCC", 50),
        ("AAG", 50),
        ("SATO", 50),
        ("AI", 40),
        ("ERLW", 40),
        ("IDRotF", 30),
    ]
    .into_iter()
    .map(|(source, priority)| (source.to_uppercase(), priority))
    .collect()
});

/// Source priority table: the built-in ranking plus caller overrides.
#[derive(Debug, Clone, Default)]
pub struct SourcePriority {
    overrides: HashMap<String, u32>,
}

impl SourcePriority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overrides(overrides: &BTreeMap<String, u32>) -> Self {
        Self {
            overrides: overrides.iter().map(|(k, v)| (k.to_uppercase(), *v)).collect(),
        }
    }

    pub fn set(&mut self, source: &str, priority: u32) {
        self.overrides.insert(source.to_uppercase(), priority);
    }

    pub fn priority(&self, source: &str) -> u32 {
        let upper = source.to_uppercase();
        self.overrides
            .get(&upper)
            .copied()
            .or_else(|| DEFAULT_PRIORITIES.get(&upper).copied())
            .unwrap_or(UNKNOWN_SOURCE_PRIORITY)
    }
}

pub fn group_key(hit: &RankedHit) -> String {
    format!("{}:{}", hit.summary.category.as_str(), hit.summary.name.to_lowercase())
}

struct Group {
    representative: RankedHit,
    first_seen: usize,
    sources: Vec<String>,
}

pub fn deduplicate(hits: Vec<RankedHit>, priorities: &SourcePriority) -> Vec<RankedHit> {
    let mut index_of: HashMap<String, usize> = HashMap::with_capacity(hits.len());
    let mut groups: Vec<Group> = Vec::new();

    for hit in hits {
        let key = group_key(&hit);
        match index_of.get(&key) {
            Some(&i) => {
                let group = &mut groups[i];
                add_source(&mut group.sources, &hit.summary.source);
                for source in &hit.available_sources {
                    add_source(&mut group.sources, source);
                }
                if replaces(&hit, &group.representative, priorities) {
                    group.representative = hit;
                }
            }
            None => {
                let mut sources = vec![hit.summary.source.clone()];
                for source in &hit.available_sources {
                    add_source(&mut sources, source);
                }
                index_of.insert(key, groups.len());
                groups.push(Group {
                    first_seen: groups.len(),
                    representative: hit,
                    sources,
                });
            }
        }
    }

    groups.sort_by(|a, b| {
        b.representative
            .score
            .total_cmp(&a.representative.score)
            .then(a.first_seen.cmp(&b.first_seen))
    });

    groups
        .into_iter()
        .map(|group| {
            let mut hit = group.representative;
            hit.available_sources = group.sources;
            hit
        })
        .collect()
}

/// True when `challenger` should take over from `incumbent`.
fn replaces(challenger: &RankedHit, incumbent: &RankedHit, priorities: &SourcePriority) -> bool {
    let challenger_priority = priorities.priority(&challenger.summary.source);
    let incumbent_priority = priorities.priority(&incumbent.summary.source);
    if challenger_priority != incumbent_priority {
        return challenger_priority > incumbent_priority;
    }
    challenger.score > incumbent.score
}

fn add_source(sources: &mut Vec<String>, source: &str) {
    if !sources.iter().any(|s| s == source) {
        sources.push(source.to_string());
    }
}
