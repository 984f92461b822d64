//! Test utilities for regstore.
//!
//! This module provides a temporary storage root and a few helpers for
//! building realistic fixtures.

use std::{
    fs::File,
    path::Path,
    time::{Duration, SystemTime},
};

use tempfile::TempDir;

use crate::{
    config::StoreConfig, digest::Digest, layout::Layout, layout::RepositoryName,
    registry::Registry,
};

/// A storage root in a temporary directory.
///
/// The directory is removed when this struct is dropped.
#[derive(Debug)]
pub struct TestRegistry {
    dir: TempDir,
}

impl TestRegistry {
    /// Allocate an empty storage root.
    pub fn new() -> Self {
        Self {
            dir: TempDir::with_prefix("regstore-test-").unwrap(),
        }
    }

    /// The storage root.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// A path resolver for the root.
    pub fn layout(&self) -> Layout {
        Layout::new(self.root())
    }

    /// Default configuration for the root.
    pub fn config(&self) -> StoreConfig {
        StoreConfig::new(self.root())
    }

    /// Open a [`Registry`] on the root.
    pub fn open(&self) -> Registry {
        Registry::open(self.config()).unwrap()
    }

    /// Set the modification time of `path` to `by` in the past.
    pub fn backdate(&self, path: &Path, by: Duration) {
        let file = File::open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }
}

impl Default for TestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a repository name that is known to be valid.
pub fn repo(name: &str) -> RepositoryName {
    RepositoryName::parse(name).unwrap()
}

/// An OCI image manifest referencing `config` and `layers`.
pub fn image_manifest(config: &Digest, layers: &[&Digest]) -> Vec<u8> {
    let layers: Vec<_> = layers
        .iter()
        .map(|digest| {
            serde_json::json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": digest.to_string(),
                "size": 0,
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config.to_string(),
            "size": 0,
        },
        "layers": layers,
    }))
    .unwrap()
}
