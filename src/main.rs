//! Derived-Data Cache CLI
//!
//! Runs the cache service or talks to a store directly.
//!
//! ```text
//! derived-cache serve --config cache.yaml
//! derived-cache put   --root ./cache --bucket Shaders --meta-json '{"v":1}' out.bin
//! derived-cache get   --root ./cache Shaders/<hash> --out ./restored
//! derived-cache exists --upstream http://cache:8558 Shaders/<hash> ...
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use derived_cache::cache::CacheRecordBuilder;
use derived_cache::config::{HierarchicalConfig, DEFAULT_NAMESPACE};
use derived_cache::store::{FileSystemStoreConfig, HierarchicalStoreConfig, HttpStoreConfig};
use derived_cache::{
    CacheBucket, CacheConfig, CacheKey, CachePolicy, CacheService, CacheStore, CacheStoreExt,
    Priority, RecordMeta, RequestOwner, Status, StoreConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Derived-data cache - content-addressed build artifact store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Store tree file (YAML or JSON)
    #[arg(long, env = "DDC_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Local cache directory, used when no config file is given
    #[arg(long, env = "DDC_ROOT", global = true)]
    root: Option<PathBuf>,

    /// Upstream cache service URL, used when no config file is given
    #[arg(long, env = "DDC_UPSTREAM", global = true)]
    upstream: Option<String>,

    /// Namespace to operate on
    #[arg(long, env = "DDC_NAMESPACE", default_value = DEFAULT_NAMESPACE, global = true)]
    namespace: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve every configured namespace over HTTP
    Serve {
        /// Bind address (overrides the config file)
        #[arg(long, env = "DDC_LISTEN")]
        listen: Option<String>,
    },
    /// Store files as one record; prints the record key
    Put {
        /// Record bucket
        #[arg(long)]
        bucket: String,
        /// Record metadata as a JSON object
        #[arg(long)]
        meta_json: Option<String>,
        /// Files to store, one value each
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Fetch a record and write its values to a directory
    Get {
        /// Record key (`bucket/hash`)
        key: CacheKey,
        /// Output directory
        #[arg(long, default_value = ".")]
        out: PathBuf,
        /// Skip flags (`meta`, `data`, `partial`, `query-local`)
        #[arg(long, default_value = "")]
        skip: String,
    },
    /// Report which keys probably exist
    Exists {
        /// Record keys (`bucket/hash`)
        #[arg(required = true)]
        keys: Vec<CacheKey>,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = load_config(&args).await?;

    match &args.command {
        Command::Serve { listen } => serve(config, listen.clone()).await,
        Command::Put {
            bucket,
            meta_json,
            files,
        } => {
            let store = open_store(&config, &args.namespace).await?;
            put(store, bucket, meta_json.as_deref(), files).await
        }
        Command::Get { key, out, skip } => {
            let store = open_store(&config, &args.namespace).await?;
            get(store, key, out, CachePolicy::from_query(skip)).await
        }
        Command::Exists { keys } => {
            let store = open_store(&config, &args.namespace).await?;
            for (key, found) in keys.iter().zip(store.probably_exists_batch(keys).await) {
                println!("{key}\t{}", if found { "yes" } else { "no" });
            }
            Ok(())
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Store Setup
// =============================================================================

/// Config file if given, otherwise a tree built from `--root` / `--upstream`
async fn load_config(args: &Args) -> anyhow::Result<CacheConfig> {
    if let Some(path) = &args.config {
        return CacheConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()));
    }

    let local = StoreConfig::Filesystem(FileSystemStoreConfig {
        root: args
            .root
            .clone()
            .unwrap_or_else(|| FileSystemStoreConfig::default().root),
        ..Default::default()
    });
    let store = match &args.upstream {
        Some(url) => StoreConfig::Hierarchical(HierarchicalConfig {
            settings: HierarchicalStoreConfig::default(),
            local: Box::new(local),
            upstream: Box::new(StoreConfig::Http(HttpStoreConfig {
                base_url: url.clone(),
                namespace: args.namespace.clone(),
                ..Default::default()
            })),
        }),
        None => local,
    };

    let mut config = CacheConfig::default();
    config.namespaces.clear();
    config.namespaces.insert(args.namespace.clone(), store);
    Ok(config)
}

async fn open_store(config: &CacheConfig, namespace: &str) -> anyhow::Result<Arc<dyn CacheStore>> {
    let store = config.namespace(namespace)?.build().await?;
    Ok(store)
}

// =============================================================================
// Commands
// =============================================================================

async fn serve(config: CacheConfig, listen: Option<String>) -> anyhow::Result<()> {
    let listen = listen.unwrap_or_else(|| config.listen.clone());
    let stores = config.build_all().await?;

    let mut service = CacheService::new()?.with_max_body_bytes(config.max_body_bytes);
    for (namespace, store) in &stores {
        service = service.with_namespace(namespace.clone(), store.clone());
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown requested");
        signal.cancel();
    });

    info!("Starting derived-data cache service");
    Arc::new(service).bind_and_serve(&listen, shutdown).await?;

    // Let queued upstream pushes land before exiting
    for (namespace, store) in &stores {
        if let Err(e) = store.flush().await {
            error!(namespace = namespace.as_str(), "Flush failed: {}", e);
        }
    }
    info!("Cache service shutdown complete");
    Ok(())
}

async fn put(
    store: Arc<dyn CacheStore>,
    bucket: &str,
    meta_json: Option<&str>,
    files: &[PathBuf],
) -> anyhow::Result<()> {
    let mut builder = CacheRecordBuilder::anonymous(CacheBucket::new(bucket)?);
    for file in files {
        let data = tokio::fs::read(file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;
        builder = builder.add_bytes(None, data);
    }
    if let Some(text) = meta_json {
        let fields: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(text).context("parsing --meta-json")?;
        let meta = fields
            .into_iter()
            .fold(RecordMeta::new(), |meta, (name, value)| meta.with(name, value));
        builder = builder.set_meta(meta);
    }
    let record = builder.build()?;
    let key = record.key().clone();

    let owner = RequestOwner::new(Priority::Blocking);
    let responses = store
        .put_all(
            vec![derived_cache::request::PutRequest::new(
                "cli",
                record,
                CachePolicy::DEFAULT,
                0,
            )],
            &owner,
        )
        .await;
    store.flush().await?;

    match responses.first().map(|r| r.status) {
        Some(Status::Ok) => {
            println!("{key}");
            Ok(())
        }
        status => bail!("put {key} failed: {status:?}"),
    }
}

async fn get(
    store: Arc<dyn CacheStore>,
    key: &CacheKey,
    out: &Path,
    policy: CachePolicy,
) -> anyhow::Result<()> {
    let owner = RequestOwner::new(Priority::Blocking);
    let mut responses = store
        .get_all(
            vec![derived_cache::request::GetRequest::new("cli", key.clone(), policy, 0)],
            &owner,
        )
        .await;

    let Some(record) = responses.pop().and_then(|r| r.record) else {
        bail!("{key} not found");
    };

    if let Some(meta) = record.meta() {
        println!("{}", serde_json::to_string_pretty(meta)?);
    }
    tokio::fs::create_dir_all(out).await?;
    for value in record.values() {
        if !value.has_data() {
            println!("{}\t{} bytes\t(not fetched)", value.id(), value.raw_size());
            continue;
        }
        let path = out.join(value.id().to_string());
        tokio::fs::write(&path, value.decompress()?)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        println!("{}\t{} bytes\t{}", value.id(), value.raw_size(), path.display());
    }
    Ok(())
}
