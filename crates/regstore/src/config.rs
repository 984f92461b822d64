//! Configuration for the storage engine.
//!
//! The configuration uses TOML format. A typical file looks like:
//!
//! ```toml
//! root = "/var/lib/regstore"
//!
//! # Upload sessions untouched for this many seconds are reclaimed by GC
//! upload_stale_after = 3600
//!
//! # Page size used by catalog listings when the client does not ask for one
//! default_page_size = 100
//! ```

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::{Result, StoreError};

/// Default staleness threshold for upload sessions: one hour.
pub const DEFAULT_UPLOAD_STALE_AFTER: Duration = Duration::from_secs(60 * 60);

/// Default catalog page size.
pub const DEFAULT_PAGE_SIZE: usize = 100;

fn default_upload_stale_after() -> u64 {
    DEFAULT_UPLOAD_STALE_AFTER.as_secs()
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

/// Storage engine configuration, typically parsed from a TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Storage root directory.
    pub root: PathBuf,

    /// Seconds after its last modification an upload session is considered
    /// abandoned.
    #[serde(default = "default_upload_stale_after")]
    pub upload_stale_after: u64,

    /// Catalog page size when the caller gives none.
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
}

impl StoreConfig {
    /// A configuration with defaults for everything but the root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            upload_stale_after: default_upload_stale_after(),
            default_page_size: default_page_size(),
        }
    }

    /// Parse configuration from TOML content.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML content is invalid.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| StoreError::io(e, "read", path))?;
        Self::from_toml(&content)
    }

    /// The staleness threshold as a [`Duration`].
    pub fn upload_stale_after(&self) -> Duration {
        Duration::from_secs(self.upload_stale_after)
    }

    /// Builder-style override of the staleness threshold.
    pub fn with_upload_stale_after(mut self, threshold: Duration) -> Self {
        self.upload_stale_after = threshold.as_secs();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(StoreError::Config("root must not be empty".into()));
        }
        if self.default_page_size == 0 {
            return Err(StoreError::Config(
                "default_page_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
