//! RulesStore: the entry point the UI layer talks to.
//!
//! Loading a category goes registry -> durable cache -> origin. Concurrent
//! loads of the same category (or of the same source file) are coalesced so
//! the origin sees one request. Cache I/O and index builds run on the blocking
//! pool; searching is synchronous and only reads the registry.
//!
//! No public operation fails. Origin and cache errors are logged and the
//! affected data is treated as absent.

use crate::cache::CacheManager;
use crate::coalesce::Coalescer;
use crate::config::Config;
use crate::database::{Database, KeyValueStore};
use crate::dedup::SourcePriority;
use crate::indexer::IndexGeneration;
use crate::interface::{
    CacheStats, Category, IndexKey, LorekeeperError, RankedHit, RecordSummary, RulesStoreApi, SearchFilters,
    SearchOptions, SweepReport,
};
use crate::loader::OriginLoader;
use crate::models::{summaries_from_records, CacheKey, GlobalIndexSnapshot, RecordPayload};
use crate::registry::IndexRegistry;
use crate::search::QueryEngine;
use futures::future::join_all;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fallback runtime for blocking work when the caller is not inside a Tokio
/// runtime (e.g. driven by `futures::executor::block_on`). Never dropped.
static FALLBACK_RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("Failed to create fallback tokio runtime")
});

type SourceRecords = Option<Arc<Vec<Value>>>;

/// Summaries gathered from the origin for one category. `complete` is false
/// when at least one listed source failed to load.
struct OriginSummaries {
    summaries: Vec<RecordSummary>,
    complete: bool,
}

/// Cheap to clone; every clone shares the same registry, cache and loader.
#[derive(Clone)]
pub struct RulesStore {
    registry: Arc<IndexRegistry>,
    engine: Arc<QueryEngine>,
    cache: Arc<CacheManager>,
    loader: Arc<dyn OriginLoader>,
    index_loads: Arc<Coalescer<Option<Arc<IndexGeneration>>>>,
    data_loads: Arc<Coalescer<SourceRecords>>,
    /// Categories whose live index is missing at least one source.
    incomplete: Arc<Mutex<HashSet<Category>>>,
}

impl RulesStore {
    /// Open the durable cache named in `config` (in memory when unset).
    pub fn open(config: Config, loader: Arc<dyn OriginLoader>) -> Result<Self, LorekeeperError> {
        let db = match &config.cache.database_path {
            Some(path) => Database::open(path)?,
            None => Database::open_in_memory()?,
        };
        Ok(Self::with_store(config, Arc::new(db), loader))
    }

    pub fn with_store(config: Config, store: Arc<dyn KeyValueStore>, loader: Arc<dyn OriginLoader>) -> Self {
        let registry = Arc::new(IndexRegistry::new());
        let priorities = SourcePriority::with_overrides(&config.dedup.source_priorities);
        let engine = QueryEngine::new(Arc::clone(&registry), config.search.clone(), priorities);
        Self {
            registry,
            engine: Arc::new(engine),
            cache: Arc::new(CacheManager::new(store, &config.cache)),
            loader,
            index_loads: Arc::new(Coalescer::new()),
            data_loads: Arc::new(Coalescer::new()),
            incomplete: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn registry(&self) -> &Arc<IndexRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    fn runtime_handle(&self) -> tokio::runtime::Handle {
        tokio::runtime::Handle::try_current().unwrap_or_else(|_| FALLBACK_RUNTIME.handle().clone())
    }

    /// Run `f` on the blocking pool. `None` only if the task panicked.
    async fn blocking<F, R>(&self, task: &'static str, f: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        match self.runtime_handle().spawn_blocking(f).await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(task, error = %e, "blocking task failed");
                None
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────────────────────

    /// Ensure `category` has a live index, loading it from cache or origin if
    /// needed. `None` when nothing could be loaded; a later call retries.
    pub async fn load_category(&self, category: Category) -> Option<Arc<IndexGeneration>> {
        if let Some(generation) = self.registry.get(IndexKey::Category(category)) {
            return Some(generation);
        }
        let store = self.clone();
        self.index_loads
            .run(category.as_str(), move || async move { store.fetch_category_index(category).await })
            .await
    }

    async fn fetch_category_index(self, category: Category) -> Option<Arc<IndexGeneration>> {
        let key = IndexKey::Category(category);
        if let Some(generation) = self.registry.get(key) {
            return Some(generation);
        }

        let cache_key = CacheKey::CategoryIndex(category);
        let cache = Arc::clone(&self.cache);
        let lookup = cache_key.clone();
        let cached: Option<Vec<RecordSummary>> = self
            .blocking("cache read", move || cache.get(&lookup))
            .await
            .flatten();

        match cached {
            Some(summaries) => {
                debug!(%category, records = summaries.len(), "index cache hit");
                self.incomplete.lock().remove(&category);
                self.build_and_install(key, summaries, None).await
            }
            None => {
                let loaded = self.summaries_from_origin(category).await?;
                info!(%category, records = loaded.summaries.len(), complete = loaded.complete, "loaded category from origin");
                // A partial index is served but not cached, so the next cold start retries the missing sources.
                let write_through = if loaded.complete {
                    self.incomplete.lock().remove(&category);
                    Some(cache_key)
                } else {
                    self.incomplete.lock().insert(category);
                    None
                };
                self.build_and_install(key, loaded.summaries, write_through).await
            }
        }
    }

    /// Summaries for every source of `category`. Sources that fail are
    /// skipped; `None` only when no source could be loaded at all.
    async fn summaries_from_origin(&self, category: Category) -> Option<OriginSummaries> {
        let sources = match self.loader.list_sources(category).await {
            Ok(sources) => sources,
            Err(e) => {
                warn!(%category, error = %e, "failed to list sources");
                return None;
            }
        };

        let loads = sources.iter().map(|source| self.load_source_data(category, source));
        let results = join_all(loads).await;

        let mut loaded = 0;
        let mut summaries = Vec::new();
        for records in results.into_iter().flatten() {
            loaded += 1;
            summaries.extend(summaries_from_records(category, &records));
        }
        if loaded == 0 && !sources.is_empty() {
            return None;
        }
        Some(OriginSummaries {
            summaries,
            complete: loaded == sources.len(),
        })
    }

    /// Full records `source` publishes in `category`, from cache or origin.
    pub async fn load_source_data(&self, category: Category, source: &str) -> SourceRecords {
        let cache_key = CacheKey::SourceData(category, source.to_string());
        let in_flight_key = cache_key.storage_key();
        let store = self.clone();
        self.data_loads
            .run(&in_flight_key, move || async move { store.fetch_source_data(cache_key).await })
            .await
    }

    async fn fetch_source_data(self, cache_key: CacheKey) -> SourceRecords {
        let (Some(category), Some(source)) = (cache_key.category(), cache_key.source().map(str::to_string)) else {
            return None;
        };

        let cache = Arc::clone(&self.cache);
        let lookup = cache_key.clone();
        let cached: Option<Vec<Value>> = self.blocking("cache read", move || cache.get(&lookup)).await.flatten();
        if let Some(records) = cached {
            return Some(Arc::new(records));
        }

        match self.loader.fetch_records(category, &source).await {
            Ok(records) => {
                let records = Arc::new(records);
                let cache = Arc::clone(&self.cache);
                let to_write = Arc::clone(&records);
                self.blocking("cache write", move || {
                    if let Err(e) = cache.put(&cache_key, &*to_write) {
                        warn!(key = %cache_key.storage_key(), error = %e, "failed to cache source data");
                    }
                })
                .await;
                Some(records)
            }
            Err(e) => {
                warn!(%category, %source, error = %e, "origin fetch failed");
                None
            }
        }
    }

    /// Ensure the global index is live, built from `categories`. A cached
    /// global index is reused only when it was merged from the same set.
    pub async fn load_global(&self, categories: &[Category]) -> Option<Arc<IndexGeneration>> {
        if let Some(generation) = self.registry.get(IndexKey::Global) {
            return Some(generation);
        }
        let store = self.clone();
        let categories = categories.to_vec();
        self.index_loads
            .run("global", move || async move { store.fetch_global_index(categories).await })
            .await
    }

    async fn fetch_global_index(self, categories: Vec<Category>) -> Option<Arc<IndexGeneration>> {
        let cache = Arc::clone(&self.cache);
        let cached: Option<GlobalIndexSnapshot> = self
            .blocking("cache read", move || cache.get(&CacheKey::GlobalIndex))
            .await
            .flatten();
        match cached {
            Some(snapshot) if snapshot.covers(&categories) => {
                debug!(records = snapshot.summaries.len(), "global index cache hit");
                return self.build_and_install(IndexKey::Global, snapshot.summaries, None).await;
            }
            Some(snapshot) => {
                debug!(cached = ?snapshot.categories, requested = ?categories, "global index cached for other categories");
            }
            None => {}
        }

        let generations = join_all(categories.iter().map(|c| self.load_category(*c))).await;
        let loaded: Vec<Arc<IndexGeneration>> = generations.into_iter().flatten().collect();
        if loaded.is_empty() {
            warn!("no category could be loaded for the global index");
            return None;
        }
        let summaries: Vec<RecordSummary> = loaded
            .iter()
            .flat_map(|generation| generation.records().iter().cloned())
            .collect();

        let complete = loaded.len() == categories.len() && {
            let incomplete = self.incomplete.lock();
            categories.iter().all(|category| !incomplete.contains(category))
        };
        if complete {
            let snapshot = GlobalIndexSnapshot::new(&categories, summaries.clone());
            let cache = Arc::clone(&self.cache);
            self.blocking("cache write", move || {
                if let Err(e) = cache.put(&CacheKey::GlobalIndex, &snapshot) {
                    warn!(error = %e, "failed to cache global index");
                }
            })
            .await;
        } else {
            debug!("global index built from partial data; not cached");
        }
        self.build_and_install(IndexKey::Global, summaries, None).await
    }

    /// Build on the blocking pool, optionally writing the summaries through to
    /// the cache first, then swap the generation into the registry.
    async fn build_and_install(
        &self,
        key: IndexKey,
        summaries: Vec<RecordSummary>,
        write_through: Option<CacheKey>,
    ) -> Option<Arc<IndexGeneration>> {
        let cache = Arc::clone(&self.cache);
        let built = self
            .blocking("index build", move || {
                if let Some(cache_key) = write_through {
                    if let Err(e) = cache.put(&cache_key, &summaries) {
                        warn!(key = %cache_key.storage_key(), error = %e, "failed to cache index summaries");
                    }
                }
                IndexGeneration::build(key, summaries)
            })
            .await?;

        match built {
            Ok(generation) => {
                let generation = Arc::new(generation);
                self.registry.install(Arc::clone(&generation));
                Some(generation)
            }
            Err(e) => {
                warn!(index = %key, error = %e, "index build failed");
                None
            }
        }
    }

    /// Full record(s) named `name` in `category`. Several sources publishing
    /// the same name yield `MultiSource`.
    pub async fn get_full_record(&self, category: Category, name: &str) -> Option<RecordPayload> {
        let wanted = name.trim().to_lowercase();
        if wanted.is_empty() {
            return None;
        }

        let sources = match self.registry.get(IndexKey::Category(category)) {
            Some(generation) => {
                let mut sources: Vec<String> = Vec::new();
                for record in generation.records() {
                    if record.name.to_lowercase() == wanted && !sources.contains(&record.source) {
                        sources.push(record.source.clone());
                    }
                }
                sources
            }
            None => match self.loader.list_sources(category).await {
                Ok(sources) => sources,
                Err(e) => {
                    warn!(%category, error = %e, "failed to list sources");
                    return None;
                }
            },
        };

        let mut matches = Vec::new();
        for source in sources {
            let Some(records) = self.load_source_data(category, &source).await else {
                continue;
            };
            let found = records.iter().find(|record| {
                record
                    .get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|n| n.trim().to_lowercase() == wanted)
            });
            if let Some(record) = found {
                matches.push((source, record.clone()));
            }
        }
        RecordPayload::from_matches(matches)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Index construction and search
    // ─────────────────────────────────────────────────────────────────────────────

    /// Build and install a generation under `key`, replacing any previous one.
    pub fn install_index(&self, key: IndexKey, items: Vec<RecordSummary>) -> Option<Arc<IndexGeneration>> {
        match IndexGeneration::build(key, items) {
            Ok(generation) => {
                let generation = Arc::new(generation);
                self.registry.install(Arc::clone(&generation));
                Some(generation)
            }
            Err(e) => {
                warn!(index = %key, error = %e, "index build failed");
                None
            }
        }
    }

    /// Rebuild the global index from whatever category indexes are live.
    pub fn rebuild_global_index(&self) -> Option<Arc<IndexGeneration>> {
        self.install_index(IndexKey::Global, self.registry.category_summaries())
    }

    pub fn search_with_options(&self, query: &str, category: Option<Category>, options: SearchOptions) -> Vec<RankedHit> {
        self.engine.search(query, IndexKey::for_category(category), options)
    }

    pub fn search_filtered(
        &self,
        query: &str,
        category: Option<Category>,
        filters: &SearchFilters,
        options: SearchOptions,
    ) -> Vec<RankedHit> {
        self.engine
            .search_filtered(query, IndexKey::for_category(category), filters, options)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Cache maintenance
    // ─────────────────────────────────────────────────────────────────────────────

    pub async fn sweep_cache(&self) -> SweepReport {
        let cache = Arc::clone(&self.cache);
        match self.blocking("cache sweep", move || cache.sweep_expired()).await {
            Some(Ok(report)) => report,
            Some(Err(e)) => {
                warn!(error = %e, "cache sweep failed");
                SweepReport::default()
            }
            None => SweepReport::default(),
        }
    }
}

#[async_trait::async_trait]
impl RulesStoreApi for RulesStore {
    fn search(&self, query: &str, category: Option<Category>) -> Vec<RankedHit> {
        self.engine
            .search(query, IndexKey::for_category(category), self.engine.default_options())
    }

    fn search_with_filters(&self, query: &str, category: Option<Category>, filters: &SearchFilters) -> Vec<RankedHit> {
        self.engine
            .search_with_filters(query, IndexKey::for_category(category), filters)
    }

    fn get_suggestions(&self, query: &str, category: Option<Category>, limit: usize) -> Vec<String> {
        self.engine
            .get_suggestions(query, IndexKey::for_category(category), limit)
    }

    fn build_category_index(&self, items: Vec<RecordSummary>, category: Category) {
        self.install_index(IndexKey::Category(category), items);
    }

    fn build_global_index(&self, items: Vec<RecordSummary>) {
        self.install_index(IndexKey::Global, items);
    }

    async fn initialize(&self) {
        let cache = Arc::clone(&self.cache);
        self.blocking("cache initialize", move || cache.initialize()).await;
    }

    /// Empties the durable and memory tiers. Live indexes stay installed.
    async fn clear_cache(&self) {
        let cache = Arc::clone(&self.cache);
        if let Some(Err(e)) = self.blocking("cache clear", move || cache.clear_all()).await {
            warn!(error = %e, "cache clear failed");
        }
    }

    async fn get_cache_stats(&self) -> CacheStats {
        let cache = Arc::clone(&self.cache);
        match self.blocking("cache stats", move || cache.stats()).await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => {
                warn!(error = %e, "cache stats unavailable");
                CacheStats::default()
            }
            None => CacheStats::default(),
        }
    }
}
