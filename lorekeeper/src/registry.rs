//! Holds the live index generation for each category and for the global index.
//!
//! Readers clone an `Arc` under a short read lock and query without holding it;
//! installing a rebuilt generation is a single reference swap under the write
//! lock, so a query sees either the old generation or the new one.

use crate::indexer::IndexGeneration;
use crate::interface::{IndexKey, RecordSummary};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct IndexRegistry {
    generations: RwLock<HashMap<IndexKey, Arc<IndexGeneration>>>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace whatever is stored under the generation's key. Returns the previous generation.
    pub fn install(&self, generation: Arc<IndexGeneration>) -> Option<Arc<IndexGeneration>> {
        self.generations.write().insert(generation.key(), generation)
    }

    pub fn get(&self, key: IndexKey) -> Option<Arc<IndexGeneration>> {
        self.generations.read().get(&key).cloned()
    }

    pub fn contains(&self, key: IndexKey) -> bool {
        self.generations.read().contains_key(&key)
    }

    pub fn remove(&self, key: IndexKey) -> Option<Arc<IndexGeneration>> {
        self.generations.write().remove(&key)
    }

    pub fn keys(&self) -> Vec<IndexKey> {
        self.generations.read().keys().copied().collect()
    }

    /// Summaries of every installed per-category generation, in category order.
    pub fn category_summaries(&self) -> Vec<RecordSummary> {
        let mut generations: Vec<(IndexKey, Arc<IndexGeneration>)> = self
            .generations
            .read()
            .iter()
            .filter(|(key, _)| matches!(key, IndexKey::Category(_)))
            .map(|(key, generation)| (*key, Arc::clone(generation)))
            .collect();
        generations.sort_by_key(|(key, _)| match key {
            IndexKey::Category(c) => Some(*c),
            IndexKey::Global => None,
        });
        generations
            .iter()
            .flat_map(|(_, generation)| generation.records().iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::Category;

    fn generation(key: IndexKey, names: &[&str]) -> Arc<IndexGeneration> {
        let category = match key {
            IndexKey::Category(c) => c,
            IndexKey::Global => Category::Spell,
        };
        let items = names.iter().map(|n| RecordSummary::new(*n, "PHB", category)).collect();
        Arc::new(IndexGeneration::build(key, items).unwrap())
    }

    #[test]
    fn test_install_replaces_whole_generation() {
        let registry = IndexRegistry::new();
        let key = IndexKey::Category(Category::Spell);
        assert!(registry.get(key).is_none());

        assert!(registry.install(generation(key, &["Light", "Shield"])).is_none());
        let held = registry.get(key).unwrap();

        let previous = registry.install(generation(key, &["Wish"])).unwrap();
        assert!(Arc::ptr_eq(&previous, &held));
        // an outstanding reader keeps its generation alive and unchanged
        assert_eq!(held.len(), 2);
        assert_eq!(registry.get(key).unwrap().len(), 1);
    }

    #[test]
    fn test_category_summaries_skip_global() {
        let registry = IndexRegistry::new();
        registry.install(generation(IndexKey::Category(Category::Monster), &["Goblin"]));
        registry.install(generation(IndexKey::Category(Category::Spell), &["Light"]));
        registry.install(generation(IndexKey::Global, &["Ignored"]));

        let names: Vec<String> = registry.category_summaries().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["Light", "Goblin"]);
        assert_eq!(registry.keys().len(), 3);
        assert!(registry.remove(IndexKey::Global).is_some());
        assert!(!registry.contains(IndexKey::Global));
    }
}
