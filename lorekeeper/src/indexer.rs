//! Tantivy-backed index generations.
//!
//! A generation is built once from a fixed slice of summaries and never
//! mutated afterwards. Rebuilding means constructing a new generation and
//! swapping it into the registry.
//!
//! Each query word becomes a group of per-field clauses: an exact term (BM25),
//! plus edit-distance and prefix expansions when fuzzy matching is on. Every
//! clause is wrapped in a `BoostQuery` carrying its field weight, so a title
//! hit outranks an incidental mention in the body text.

use crate::config::SearchConfig;
use crate::interface::{IndexKey, RecordSummary};
use chrono::{DateTime, Utc};
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, BoostQuery, FuzzyTermQuery, Occur, Query, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Schema, Value, STORED, STRING, TEXT};
use tantivy::tokenizer::TokenStream;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, Score, TantivyDocument, Term};
use thiserror::Error;
use tracing::{debug, warn};

/// Writer arena size. Tantivy's per-thread minimum.
const WRITER_MEMORY_BYTES: usize = 15_000_000;

/// Error type for indexer operations
#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),
}

pub type IndexerResult<T> = Result<T, IndexerError>;

#[derive(Debug, Clone, Copy)]
struct IndexFields {
    id: Field,
    ordinal: Field,
    name: Field,
    searchable_text: Field,
    kind: Field,
    school: Field,
    category: Field,
    source: Field,
    rarity: Field,
}

impl IndexFields {
    fn build_schema() -> (Schema, Self) {
        let mut schema_builder = Schema::builder();
        let fields = Self {
            id: schema_builder.add_text_field("id", STRING | STORED),
            ordinal: schema_builder.add_u64_field("ordinal", STORED),
            name: schema_builder.add_text_field("name", TEXT),
            searchable_text: schema_builder.add_text_field("searchable_text", TEXT),
            kind: schema_builder.add_text_field("type", TEXT),
            school: schema_builder.add_text_field("school", TEXT),
            category: schema_builder.add_text_field("category", TEXT),
            source: schema_builder.add_text_field("source", TEXT),
            rarity: schema_builder.add_text_field("rarity", TEXT),
        };
        (schema_builder.build(), fields)
    }

    fn weighted(&self, config: &SearchConfig) -> [(Field, Score); 7] {
        let b = &config.boosts;
        [
            (self.name, b.name),
            (self.searchable_text, b.searchable_text),
            (self.kind, b.kind),
            (self.school, b.school),
            (self.category, b.category),
            (self.source, b.source),
            (self.rarity, b.rarity),
        ]
    }
}

/// One immutable built instance of the search index.
pub struct IndexGeneration {
    key: IndexKey,
    records: Vec<RecordSummary>,
    index: Index,
    reader: IndexReader,
    fields: IndexFields,
    built_at: DateTime<Utc>,
}

impl std::fmt::Debug for IndexGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexGeneration")
            .field("key", &self.key)
            .field("records", &self.records.len())
            .field("built_at", &self.built_at)
            .finish()
    }
}

impl IndexGeneration {
    /// Build a generation from `items`. Records with a blank name are skipped
    /// with a warning; everything else becomes exactly one document.
    pub fn build(key: IndexKey, items: Vec<RecordSummary>) -> IndexerResult<Self> {
        let (schema, fields) = IndexFields::build_schema();
        let index = Index::create_in_ram(schema);
        // Single indexing thread keeps one segment, so rebuilds score identically.
        let mut writer: IndexWriter = index.writer_with_num_threads(1, WRITER_MEMORY_BYTES)?;

        let mut records = Vec::with_capacity(items.len());
        for (position, summary) in items.into_iter().enumerate() {
            if summary.name.trim().is_empty() {
                warn!(index = %key, position, source = %summary.source, "skipping record without a name");
                continue;
            }
            let doc = fields.document(&summary, position, records.len());
            match writer.add_document(doc) {
                Ok(_) => records.push(summary),
                Err(e) => warn!(index = %key, position, error = %e, "skipping record that failed to index"),
            }
        }
        writer.commit()?;

        let reader = index.reader_builder().reload_policy(ReloadPolicy::Manual).try_into()?;
        debug!(index = %key, documents = records.len(), "built index generation");

        Ok(Self {
            key,
            records,
            index,
            reader,
            fields,
            built_at: Utc::now(),
        })
    }

    pub fn empty(key: IndexKey) -> IndexerResult<Self> {
        Self::build(key, Vec::new())
    }

    pub fn key(&self) -> IndexKey {
        self.key
    }

    /// Indexed summaries, in document order.
    pub fn records(&self) -> &[RecordSummary] {
        &self.records
    }

    pub fn record(&self, ordinal: usize) -> Option<&RecordSummary> {
        self.records.get(ordinal)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Run `query` and return `(ordinal, score)` pairs, best first. Equal
    /// scores keep document order.
    pub fn search(
        &self,
        query: &str,
        fuzzy: bool,
        limit: usize,
        config: &SearchConfig,
    ) -> IndexerResult<Vec<(usize, Score)>> {
        if limit == 0 || self.records.is_empty() {
            return Ok(Vec::new());
        }
        let terms = self.query_terms(query)?;
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        for term_text in &terms {
            let expand_fuzzy = fuzzy && term_text.chars().count() >= config.fuzzy_min_term_len;
            for (field, boost) in self.fields.weighted(config) {
                let term = Term::from_field_text(field, term_text);
                clauses.push(boosted(TermQuery::new(term.clone(), IndexRecordOption::WithFreqs), boost));
                if fuzzy {
                    if expand_fuzzy {
                        clauses.push(boosted(
                            FuzzyTermQuery::new(term.clone(), config.fuzzy_distance, true),
                            boost,
                        ));
                    }
                    clauses.push(boosted(FuzzyTermQuery::new_prefix(term, 0, true), boost));
                }
            }
        }
        let query = BooleanQuery::new(clauses);

        let searcher = self.reader.searcher();
        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            if let Some(ordinal) = doc.get_first(self.fields.ordinal).and_then(|v| v.as_u64()) {
                hits.push((ordinal as usize, score));
            }
        }
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(hits)
    }

    /// Whitespace-split the query and run each word through the field analyzer,
    /// so query terms are normalized exactly like indexed ones.
    fn query_terms(&self, query: &str) -> IndexerResult<Vec<String>> {
        let mut analyzer = self.index.tokenizer_for_field(self.fields.name)?;
        let mut terms: Vec<String> = Vec::new();
        for word in query.split_whitespace() {
            let mut stream = analyzer.token_stream(word);
            while let Some(token) = stream.next() {
                if !terms.contains(&token.text) {
                    terms.push(token.text.clone());
                }
            }
        }
        Ok(terms)
    }
}

impl IndexFields {
    fn document(&self, summary: &RecordSummary, position: usize, ordinal: usize) -> TantivyDocument {
        let mut doc = TantivyDocument::default();
        doc.add_text(self.id, format!("{}|{}|{}", summary.name, summary.source, position));
        doc.add_u64(self.ordinal, ordinal as u64);
        doc.add_text(self.name, &summary.name);
        doc.add_text(self.category, summary.category.as_str());
        doc.add_text(self.source, &summary.source);
        let optional = [
            (self.searchable_text, &summary.searchable_text),
            (self.kind, &summary.kind),
            (self.school, &summary.school),
            (self.rarity, &summary.rarity),
        ];
        for (field, value) in optional {
            if let Some(text) = value {
                doc.add_text(field, text);
            }
        }
        doc
    }
}

fn boosted(query: impl Query + 'static, boost: Score) -> (Occur, Box<dyn Query>) {
    (Occur::Should, Box::new(BoostQuery::new(Box::new(query), boost)))
}
