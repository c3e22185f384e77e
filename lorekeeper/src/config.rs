//! Runtime configuration, loadable from a TOML file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub search: SearchConfig,
    pub cache: CacheConfig,
    pub origin: OriginConfig,
    pub dedup: DedupConfig,
}

/// Per-field weights. Name outranks content, which outranks the metadata fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldBoosts {
    pub name: f32,
    pub searchable_text: f32,
    pub kind: f32,
    pub school: f32,
    pub category: f32,
    pub source: f32,
    pub rarity: f32,
}

impl Default for FieldBoosts {
    fn default() -> Self {
        Self {
            name: 10.0,
            searchable_text: 5.0,
            kind: 3.0,
            school: 3.0,
            category: 2.0,
            source: 1.0,
            rarity: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_limit: usize,
    /// Terms shorter than this only get prefix expansion
    pub fuzzy_min_term_len: usize,
    pub fuzzy_distance: u8,
    /// Raw hits collected per requested result, so deduplication still fills the page
    pub candidate_multiplier: usize,
    /// Candidate pool scanned before post-filters are applied
    pub filter_pool: usize,
    pub suggestion_limit: usize,
    pub boosts: FieldBoosts,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            fuzzy_min_term_len: 3,
            fuzzy_distance: 1,
            candidate_multiplier: 5,
            filter_pool: 500,
            suggestion_limit: 5,
            boosts: FieldBoosts::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub schema_version: String,
    pub expiry_hours: i64,
    /// Entries held by the in-memory tier
    pub memory_capacity: usize,
    /// SQLite file for the durable tier. In-memory when unset.
    pub database_path: Option<PathBuf>,
}

impl CacheConfig {
    pub fn expiry_ms(&self) -> i64 {
        self.expiry_hours.saturating_mul(60 * 60 * 1000)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            schema_version: "2.2.0".to_string(),
            expiry_hours: 24,
            memory_capacity: 64,
            database_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/data/".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Overrides and additions to the built-in source priority table
    pub source_priorities: BTreeMap<String, u32>,
}

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Load from `path`, falling back to defaults when the file is missing or invalid.
    pub fn load(path: &Path) -> Self {
        match Self::read(path) {
            Ok(config) => {
                info!(path = %path.display(), "loaded config");
                config
            }
            Err(ConfigError::Io(e)) => {
                debug!(path = %path.display(), error = %e, "no config file, using defaults");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse config, using defaults");
                Self::default()
            }
        }
    }
}
