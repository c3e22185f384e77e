//! Origin loaders: where rules data comes from on a cache miss.
//!
//! Both loaders read the same layout. `<dir>/index.json` maps each source
//! abbreviation to a file name, and each file holds
//! `{"<category>": [record, ...]}`. `HttpLoader` fetches it over HTTP;
//! `FileLoader` reads a local checkout of the data directory.

use crate::config::OriginConfig;
use crate::interface::Category;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no {category} file for source {book}")]
    UnknownSource { category: Category, book: String },
    #[error("document has no {0} array")]
    MissingRecords(Category),
    #[error("{0}")]
    Other(String),
}

pub type LoadResult<T> = Result<T, LoadError>;

/// Fetches raw rules records for one category.
#[async_trait]
pub trait OriginLoader: Send + Sync {
    /// Source books that publish records in `category`.
    async fn list_sources(&self, category: Category) -> LoadResult<Vec<String>>;

    /// Raw records `source` publishes in `category`.
    async fn fetch_records(&self, category: Category, source: &str) -> LoadResult<Vec<Value>>;
}

/// Pull the record array out of a per-source document. Bare arrays are accepted too.
pub fn records_from_document(category: Category, document: Value) -> LoadResult<Vec<Value>> {
    match document {
        Value::Array(records) => Ok(records),
        Value::Object(mut map) => match map.remove(category.as_str()) {
            Some(Value::Array(records)) => Ok(records),
            _ => Err(LoadError::MissingRecords(category)),
        },
        _ => Err(LoadError::MissingRecords(category)),
    }
}

type FileMap = Arc<BTreeMap<String, String>>;

fn file_for(map: &FileMap, category: Category, source: &str) -> LoadResult<String> {
    map.get(source)
        .cloned()
        .ok_or_else(|| LoadError::UnknownSource {
            category,
            book: source.to_string(),
        })
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP
// ═══════════════════════════════════════════════════════════════════════════════

pub struct HttpLoader {
    client: reqwest::Client,
    base: Url,
    file_maps: Mutex<HashMap<Category, FileMap>>,
}

impl HttpLoader {
    pub fn new(config: &OriginConfig) -> LoadResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("lorekeeper/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base: normalize_base(&config.base_url)?,
            file_maps: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> LoadResult<T> {
        let url = self.base.join(path)?;
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.json::<T>().await?)
    }

    async fn file_map(&self, category: Category) -> LoadResult<FileMap> {
        let cached = self.file_maps.lock().get(&category).cloned();
        if let Some(map) = cached {
            return Ok(map);
        }
        let map: BTreeMap<String, String> = self
            .get_json(&format!("{}/index.json", category.data_dir()))
            .await?;
        let map = Arc::new(map);
        self.file_maps.lock().insert(category, Arc::clone(&map));
        Ok(map)
    }
}

/// Ensure the base URL ends with `/` so relative joins stay inside it.
fn normalize_base(base: &str) -> LoadResult<Url> {
    let mut base = base.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Ok(Url::parse(&base)?)
}

#[async_trait]
impl OriginLoader for HttpLoader {
    async fn list_sources(&self, category: Category) -> LoadResult<Vec<String>> {
        Ok(self.file_map(category).await?.keys().cloned().collect())
    }

    async fn fetch_records(&self, category: Category, source: &str) -> LoadResult<Vec<Value>> {
        let map = self.file_map(category).await?;
        let file = file_for(&map, category, source)?;
        let document: Value = self
            .get_json(&format!("{}/{}", category.data_dir(), file))
            .await?;
        records_from_document(category, document)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOCAL FILES
// ═══════════════════════════════════════════════════════════════════════════════

pub struct FileLoader {
    root: PathBuf,
}

impl FileLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_json<T: DeserializeOwned>(&self, relative: &str) -> LoadResult<T> {
        let bytes = tokio::fs::read(self.root.join(relative)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn file_map(&self, category: Category) -> LoadResult<FileMap> {
        let map: BTreeMap<String, String> = self
            .read_json(&format!("{}/index.json", category.data_dir()))
            .await?;
        Ok(Arc::new(map))
    }
}

#[async_trait]
impl OriginLoader for FileLoader {
    async fn list_sources(&self, category: Category) -> LoadResult<Vec<String>> {
        Ok(self.file_map(category).await?.keys().cloned().collect())
    }

    async fn fetch_records(&self, category: Category, source: &str) -> LoadResult<Vec<Value>> {
        let map = self.file_map(category).await?;
        let file = file_for(&map, category, source)?;
        let document: Value = self
            .read_json(&format!("{}/{}", category.data_dir(), file))
            .await?;
        records_from_document(category, document)
    }
}
