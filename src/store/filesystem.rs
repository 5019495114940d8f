//! File System Store
//!
//! Local disk tier. Every record and bare value is one package file:
//!
//! ```text
//! <root>/refs/<bucket>/<hash[0..2]>/<hash>.ddcp
//! <root>/values/<bucket>/<hash[0..2]>/<hash>.ddcp
//! ```
//!
//! Files are written to a uniquely named temp file in the target directory and
//! renamed into place, so a package is visible either complete or not at all.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::metrics::{LatencyTracker, MetricsSnapshot, StoreMetrics};
use super::{finish_record, finish_value, validate_put, validate_value, CacheStore};
use crate::cache::package::{decode_record, decode_value, encode_record, encode_value};
use crate::cache::{CacheKey, CachePolicy, CacheRecord, CacheRecordPolicy, Value};
use crate::error::{Error, Result};

const PACKAGE_EXTENSION: &str = "ddcp";

/// File system store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSystemStoreConfig {
    /// Name used in logs and metrics
    pub name: String,
    /// Cache directory path
    pub root: PathBuf,
    /// fsync package files before renaming them into place
    pub sync_writes: bool,
}

impl Default for FileSystemStoreConfig {
    fn default() -> Self {
        Self {
            name: "filesystem".to_string(),
            root: PathBuf::from("./derived-cache"),
            sync_writes: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Area {
    Refs,
    Values,
}

impl Area {
    fn dir(self) -> &'static str {
        match self {
            Area::Refs => "refs",
            Area::Values => "values",
        }
    }
}

/// Disk-backed cache store
pub struct FileSystemCacheStore {
    config: FileSystemStoreConfig,
    metrics: StoreMetrics,
}

impl FileSystemCacheStore {
    /// Create a store rooted at `config.root`, creating the directory
    pub async fn open(config: FileSystemStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.root).await?;
        debug!(root = %config.root.display(), "Opened file system cache store");
        Ok(Self {
            config,
            metrics: StoreMetrics::new(),
        })
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn path(&self, area: Area, key: &CacheKey) -> PathBuf {
        let hex = key.hash.to_hex();
        self.config
            .root
            .join(area.dir())
            .join(key.bucket.as_str().to_ascii_lowercase())
            .join(&hex[..2])
            .join(format!("{hex}.{PACKAGE_EXTENSION}"))
    }

    async fn write_atomic(&self, path: &Path, data: &Bytes) -> Result<()> {
        let Some(parent) = path.parent() else {
            return Err(Error::Internal(format!("no parent for {}", path.display())));
        };
        fs::create_dir_all(parent).await?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let result: std::io::Result<()> = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            if self.config.sync_writes {
                file.sync_all().await?;
            }
            drop(file);
            fs::rename(&temp_path, path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read(&self, area: Area, key: &CacheKey) -> Result<Bytes> {
        match fs::read(self.path(area, key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound(key.clone())),
            Err(e) => Err(e.into()),
        }
    }
}

fn check_key(stored: &CacheKey, requested: &CacheKey) -> Result<()> {
    if stored != requested {
        return Err(Error::MalformedPackage(format!(
            "package for {stored} stored under {requested}"
        )));
    }
    Ok(())
}

#[async_trait]
impl CacheStore for FileSystemCacheStore {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip(self, record, _policy), fields(store = %self.config.name, key = %record.key()))]
    async fn put_record(&self, record: &CacheRecord, _policy: &CacheRecordPolicy) -> Result<()> {
        let tracker = LatencyTracker::start();
        let result = async {
            validate_put(record)?;
            let package = encode_record(record)?;
            self.write_atomic(&self.path(Area::Refs, record.key()), &package)
                .await?;
            Ok::<_, Error>(package.len() as u64)
        }
        .await;

        match result {
            Ok(size) => {
                self.metrics.record_write(size);
                self.metrics.record_write_latency(tracker.elapsed());
                Ok(())
            }
            Err(e) => {
                self.metrics.record_write_failure();
                Err(e)
            }
        }
    }

    #[instrument(skip(self, policy), fields(store = %self.config.name, key = %key))]
    async fn get_record(&self, key: &CacheKey, policy: &CacheRecordPolicy) -> Result<CacheRecord> {
        let tracker = LatencyTracker::start();
        let package = match self.read(Area::Refs, key).await {
            Ok(package) => package,
            Err(e) => {
                if e.is_not_found() {
                    self.metrics.record_miss();
                }
                return Err(e);
            }
        };
        let size = package.len() as u64;

        let record = decode_record(package)?;
        check_key(record.key(), key)?;
        let record = finish_record(record, policy, &self.metrics)?;
        self.metrics.record_hit(size);
        self.metrics.record_read_latency(tracker.elapsed());
        Ok(record)
    }

    #[instrument(skip(self, value, _policy), fields(store = %self.config.name, key = %key))]
    async fn put_value(&self, key: &CacheKey, value: &Value, _policy: CachePolicy) -> Result<()> {
        let tracker = LatencyTracker::start();
        let result = async {
            validate_value(value)?;
            let package = encode_value(key, value)?;
            self.write_atomic(&self.path(Area::Values, key), &package)
                .await?;
            Ok::<_, Error>(package.len() as u64)
        }
        .await;

        match result {
            Ok(size) => {
                self.metrics.record_write(size);
                self.metrics.record_write_latency(tracker.elapsed());
                Ok(())
            }
            Err(e) => {
                self.metrics.record_write_failure();
                Err(e)
            }
        }
    }

    #[instrument(skip(self, policy), fields(store = %self.config.name, key = %key))]
    async fn get_value(&self, key: &CacheKey, policy: CachePolicy) -> Result<Value> {
        let tracker = LatencyTracker::start();
        let package = match self.read(Area::Values, key).await {
            Ok(package) => package,
            Err(e) => {
                if e.is_not_found() {
                    self.metrics.record_miss();
                }
                return Err(e);
            }
        };
        let size = package.len() as u64;

        let (stored_key, value) = decode_value(package)?;
        check_key(&stored_key, key)?;
        let value = finish_value(value, policy, &self.metrics)?;
        self.metrics.record_hit(size);
        self.metrics.record_read_latency(tracker.elapsed());
        Ok(value)
    }

    async fn probably_exists(&self, key: &CacheKey) -> Result<bool> {
        if fs::try_exists(self.path(Area::Refs, key)).await? {
            return Ok(true);
        }
        Ok(fs::try_exists(self.path(Area::Values, key)).await?)
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

// =============================================================================
// Tests
// =============================================================================
