//! Command-line driver for the lorekeeper core.
//!
//! Usage:
//!     lorekeeper --data-dir ./data search spell "fire bolt"
//!     lorekeeper --config lorekeeper.toml suggest all fir
//!     lorekeeper stats
//!
//! Results are printed as JSON. Set RUST_LOG to adjust log output (stderr).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lorekeeper::{
    Category, ChallengeRating, Config, FileLoader, HttpLoader, OriginLoader, RulesStore, RulesStoreApi,
    SearchFilters, SearchOptions,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file
    #[arg(short, long, default_value = "lorekeeper.toml")]
    config: PathBuf,

    /// Read rules data from a local directory instead of the configured origin URL
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// SQLite cache file (overrides the config file)
    #[arg(long)]
    cache_db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search one category, or `all` for the global index
    Search {
        category: String,
        query: String,
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(long)]
        no_fuzzy: bool,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        level: Option<u32>,
        #[arg(long)]
        school: Option<String>,
        #[arg(long = "type")]
        kind: Option<String>,
        #[arg(long)]
        cr: Option<String>,
        #[arg(long)]
        rarity: Option<String>,
    },
    /// Type-ahead name suggestions
    Suggest {
        category: String,
        query: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Print the full record(s) for a name
    Record { category: String, name: String },
    /// Cache entry counts and payload size
    Stats,
    /// Remove expired and outdated cache entries
    Sweep,
    /// Empty the cache
    Clear,
}

/// `all` selects the global index.
fn parse_scope(raw: &str) -> Result<Option<Category>> {
    if raw.eq_ignore_ascii_case("all") {
        return Ok(None);
    }
    let category = raw.parse::<Category>().with_context(|| format!("invalid category {raw:?}"))?;
    Ok(Some(category))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Make sure the index `scope` needs is live.
async fn ensure_loaded(store: &RulesStore, scope: Option<Category>) {
    match scope {
        Some(category) => {
            store.load_category(category).await;
        }
        None => {
            store.load_global(&Category::ALL).await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lorekeeper=info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config);
    if let Some(path) = args.cache_db {
        config.cache.database_path = Some(path);
    }

    let loader: Arc<dyn OriginLoader> = match &args.data_dir {
        Some(dir) => Arc::new(FileLoader::new(dir)),
        None => Arc::new(HttpLoader::new(&config.origin).context("failed to set up HTTP origin")?),
    };
    let default_limit = config.search.default_limit;
    let suggestion_limit = config.search.suggestion_limit;
    let store = RulesStore::open(config, loader).context("failed to open cache")?;
    store.initialize().await;

    match args.command {
        Command::Search {
            category,
            query,
            limit,
            no_fuzzy,
            source,
            level,
            school,
            kind,
            cr,
            rarity,
        } => {
            let scope = parse_scope(&category)?;
            ensure_loaded(&store, scope).await;
            let filters = SearchFilters {
                source,
                level,
                school,
                kind,
                cr: cr.as_deref().map(ChallengeRating::new),
                rarity,
            };
            let options = SearchOptions {
                limit: limit.unwrap_or(default_limit),
                fuzzy: !no_fuzzy,
            };
            let hits = store.search_filtered(&query, scope, &filters, options);
            print_json(&hits)?;
        }
        Command::Suggest { category, query, limit } => {
            let scope = parse_scope(&category)?;
            ensure_loaded(&store, scope).await;
            print_json(&store.get_suggestions(&query, scope, limit.unwrap_or(suggestion_limit)))?;
        }
        Command::Record { category, name } => {
            let category = parse_scope(&category)?.context("records are looked up in a single category")?;
            match store.get_full_record(category, &name).await {
                Some(payload) => print_json(&payload)?,
                None => anyhow::bail!("no {category} named {name:?}"),
            }
        }
        Command::Stats => print_json(&store.get_cache_stats().await)?,
        Command::Sweep => print_json(&store.sweep_cache().await)?,
        Command::Clear => {
            store.clear_cache().await;
            eprintln!("cache cleared");
        }
    }

    Ok(())
}
