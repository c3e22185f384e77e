//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use lorekeeper::loader::{LoadError, LoadResult, OriginLoader};
use lorekeeper::{Category, Config, RecordSummary, RulesStore};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

pub fn spell(name: &str, source: &str, level: u32, school: &str, text: &str) -> RecordSummary {
    let mut summary = RecordSummary::new(name, source, Category::Spell);
    summary.level = Some(level);
    summary.school = Some(school.to_string());
    if !text.is_empty() {
        summary.searchable_text = Some(text.to_string());
    }
    summary
}

/// Spells with deliberate cross-book duplicates.
pub fn spell_corpus() -> Vec<RecordSummary> {
    vec![
        spell("Fire Bolt", "PHB", 0, "V", "You hurl a mote of fire at a creature or object."),
        spell("Fire Bolt", "XPHB", 0, "V", "You hurl a mote of fire at a creature or object."),
        spell("Fireball", "PHB", 3, "V", "A bright streak flashes to a point you choose, then blossoms with a low roar."),
        spell("Eldritch Blast", "PHB", 0, "V", "A beam of crackling energy streaks toward a creature."),
        spell("Acid Blast", "HB", 0, "E", "A blast of acid sprays from your fingertips."),
        spell("Thunderous Blast", "XGE", 1, "E", "A blast of thunder rolls out from you."),
        spell("Frost Blast", "HB", 0, "C", "A blast of frost strikes a creature."),
        spell("Shield", "PHB", 1, "A", "An invisible barrier of magical force appears and protects you."),
        spell("Shield", "XGE", 1, "A", "An invisible barrier of magical force appears and protects you."),
        spell("shield", "XPHB", 1, "A", "An invisible barrier of magical force appears and protects you."),
        spell("Shield of Faith", "PHB", 1, "A", "A shimmering field surrounds a creature."),
        spell("Misfire Trap", "HB", 2, "T", "A trap that backfires."),
        spell("Firebolt Wand", "HB", 0, "V", "A wand that throws fire."),
    ]
}

pub fn raw_spell(name: &str, source: &str, level: u32) -> Value {
    json!({
        "name": name,
        "source": source,
        "level": level,
        "school": "V",
        "entries": [format!("{name} as printed in {source}.")]
    })
}

/// In-memory origin that counts calls. With a gate set, every `list_sources`
/// call waits for a permit before answering.
#[derive(Default)]
pub struct CountingLoader {
    pub books: BTreeMap<Category, BTreeMap<String, Vec<Value>>>,
    pub list_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    /// Number of upcoming `list_sources` calls that fail
    pub fail_listings: AtomicUsize,
    pub failing_sources: Vec<String>,
    pub gate: Option<Arc<Semaphore>>,
}

impl CountingLoader {
    pub fn with_spells() -> Self {
        let mut spells = BTreeMap::new();
        spells.insert(
            "PHB".to_string(),
            vec![raw_spell("Fireball", "PHB", 3), raw_spell("Shield", "PHB", 1), raw_spell("Light", "PHB", 0)],
        );
        spells.insert("XGE".to_string(), vec![raw_spell("Shield", "XGE", 1)]);
        spells.insert("XPHB".to_string(), vec![raw_spell("Fireball", "XPHB", 3)]);
        let mut books = BTreeMap::new();
        books.insert(Category::Spell, spells);
        Self {
            books,
            ..Self::default()
        }
    }

    /// `with_spells` plus one monster book.
    pub fn with_spells_and_monsters() -> Self {
        let mut loader = Self::with_spells();
        let mut monsters = BTreeMap::new();
        monsters.insert(
            "MM".to_string(),
            vec![json!({"name": "Goblin", "source": "MM", "type": "humanoid", "cr": 0.25})],
        );
        loader.books.insert(Category::Monster, monsters);
        loader
    }

    pub fn lists(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OriginLoader for CountingLoader {
    async fn list_sources(&self, category: Category) -> LoadResult<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| LoadError::Other(e.to_string()))?;
        }
        let should_fail = self
            .fail_listings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(LoadError::Other("origin offline".into()));
        }
        self.books
            .get(&category)
            .map(|sources| sources.keys().cloned().collect())
            .ok_or_else(|| LoadError::Other(format!("no {category} data")))
    }

    async fn fetch_records(&self, category: Category, source: &str) -> LoadResult<Vec<Value>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_sources.iter().any(|s| s == source) {
            return Err(LoadError::Other(format!("{source} unavailable")));
        }
        self.books
            .get(&category)
            .and_then(|sources| sources.get(source))
            .cloned()
            .ok_or_else(|| LoadError::Other(format!("{source} not found")))
    }
}

pub fn store_with(loader: Arc<CountingLoader>) -> RulesStore {
    RulesStore::open(Config::default(), loader).unwrap()
}
