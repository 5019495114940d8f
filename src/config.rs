//! Configuration
//!
//! A store tree described in YAML or JSON:
//!
//! ```yaml
//! listen: 0.0.0.0:8558
//! max_body_bytes: 536870912
//! namespaces:
//!   ddc:
//!     kind: hierarchical
//!     push_workers: 4
//!     local:
//!       kind: filesystem
//!       root: /var/cache/ddc
//!     upstream:
//!       kind: http
//!       base_url: http://cache.internal:8558
//! ```
//!
//! Stores are built explicitly from the tree and handed to their users; there
//! is no process-wide store registry.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::service::DEFAULT_MAX_BODY_BYTES;
use crate::store::{
    CacheStore, FileSystemCacheStore, FileSystemStoreConfig, HierarchicalCacheStore,
    HierarchicalStoreConfig, HttpCacheStore, HttpStoreConfig, MemoryCacheStore, MemoryStoreConfig,
};

/// Namespace used when none is given
pub const DEFAULT_NAMESPACE: &str = "ddc";

/// One store and, for composed stores, its tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory(MemoryStoreConfig),
    Filesystem(FileSystemStoreConfig),
    Http(HttpStoreConfig),
    Hierarchical(HierarchicalConfig),
}

/// Hierarchical store settings plus both tiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchicalConfig {
    #[serde(flatten)]
    pub settings: HierarchicalStoreConfig,
    pub local: Box<StoreConfig>,
    pub upstream: Box<StoreConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Filesystem(FileSystemStoreConfig::default())
    }
}

impl StoreConfig {
    /// Kind name as written in config files
    pub fn kind(&self) -> &'static str {
        match self {
            StoreConfig::Memory(_) => "memory",
            StoreConfig::Filesystem(_) => "filesystem",
            StoreConfig::Http(_) => "http",
            StoreConfig::Hierarchical(_) => "hierarchical",
        }
    }

    /// Construct the described store. Must run inside a Tokio runtime.
    pub fn build(&self) -> BoxFuture<'_, Result<Arc<dyn CacheStore>>> {
        Box::pin(async move {
            let store: Arc<dyn CacheStore> = match self {
                StoreConfig::Memory(config) => Arc::new(MemoryCacheStore::new(config.clone())),
                StoreConfig::Filesystem(config) => {
                    Arc::new(FileSystemCacheStore::open(config.clone()).await?)
                }
                StoreConfig::Http(config) => Arc::new(HttpCacheStore::new(config.clone())?),
                StoreConfig::Hierarchical(config) => {
                    let local = config.local.build().await?;
                    let upstream = config.upstream.build().await?;
                    Arc::new(HierarchicalCacheStore::new(
                        config.settings.clone(),
                        local,
                        upstream,
                    )?)
                }
            };
            Ok(store)
        })
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Service bind address
    pub listen: String,
    /// Largest request body the service reads
    pub max_body_bytes: u64,
    /// Stores by namespace
    pub namespaces: BTreeMap<String, StoreConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let mut namespaces = BTreeMap::new();
        namespaces.insert(DEFAULT_NAMESPACE.to_string(), StoreConfig::default());
        Self {
            listen: "0.0.0.0:8558".to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            namespaces,
        }
    }
}

impl CacheConfig {
    /// Parse YAML
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Parse JSON
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a file; `.json` is parsed as JSON, anything else as YAML
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text)?,
            _ => Self::from_yaml(&text)?,
        };
        info!(path = %path.display(), namespaces = config.namespaces.len(), "Loaded cache config");
        Ok(config)
    }

    /// Store description for `namespace`
    pub fn namespace(&self, namespace: &str) -> Result<&StoreConfig> {
        self.namespaces
            .get(namespace)
            .ok_or_else(|| Error::Config(format!("no namespace '{namespace}' configured")))
    }

    /// Build every configured store
    pub async fn build_all(&self) -> Result<BTreeMap<String, Arc<dyn CacheStore>>> {
        let mut stores = BTreeMap::new();
        for (namespace, config) in &self.namespaces {
            let store = config.build().await?;
            info!(namespace, kind = config.kind(), store = store.name(), "Built cache store");
            stores.insert(namespace.clone(), store);
        }
        Ok(stores)
    }
}
