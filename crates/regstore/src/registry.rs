//! The registry facade.
//!
//! [`Registry`] is what a distribution endpoint talks to: one method per
//! protocol operation, taking identifiers as the raw strings found in the
//! request and validating them before any store is touched.
//!
//! # Locking
//!
//! Opening a registry takes an exclusive advisory lock on `<root>/.lock`, so
//! only one process serves a storage root at a time.
//!
//! Inside the process every repository has a read-write lock. Garbage
//! collection holds it exclusively for the whole mark and sweep; every
//! operation that can create or remove a reference (manifest put and delete,
//! blob put and delete, upload finalize) holds it shared. Reads and appends to
//! upload sessions take no repository lock.

use std::{
    collections::HashMap,
    fs::File,
    sync::{Arc, Mutex, PoisonError},
};

use log::{debug, info, warn};
use rustix::{
    fs::{flock, FlockOperation},
    io::Errno,
};
use tokio::{io::AsyncRead, sync::RwLock};

use crate::{
    blob::{BlobInfo, BlobReader, BlobStore},
    catalog::{Catalog, TagList},
    config::StoreConfig,
    digest::Digest,
    error::{Result, StoreError},
    gc::{GarbageCollector, GcOptions, GcReport, GcTarget},
    layout::{Layout, Reference, RepositoryName},
    manifest::{Manifest, ManifestStore},
    upload::UploadManager,
};

/// Version string reported by the API probe.
pub const API_VERSION: &str = "registry/2.0";

/// Acknowledgement of the API version probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersion {
    /// Always [`API_VERSION`].
    pub version: &'static str,
}

/// A freshly started upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStarted {
    /// Session identifier to use in later requests.
    pub id: String,
    /// Bytes received so far; always zero.
    pub offset: u64,
}

/// A storage root opened for serving.
#[derive(Debug)]
pub struct Registry {
    config: StoreConfig,
    layout: Layout,
    blobs: BlobStore,
    manifests: ManifestStore,
    uploads: UploadManager,
    catalog: Catalog,
    repo_locks: Mutex<HashMap<RepositoryName, Arc<RwLock<()>>>>,
    lock_file: File,
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Err(e) = flock(&self.lock_file, FlockOperation::Unlock) {
            warn!("failed to unlock {}: {e}", self.layout.root().display());
        }
    }
}

impl Registry {
    /// Open the storage root named by `config`, creating it if needed.
    ///
    /// Fails with [`StoreError::StorageLocked`] if another registry already
    /// has it open.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let layout = Layout::new(&config.root);
        let repositories = layout.repositories_dir();
        std::fs::create_dir_all(&repositories)
            .map_err(|e| StoreError::io(e, "create directory", &repositories))?;

        let lock_path = layout.root().join(".lock");
        let lock_file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| StoreError::io(e, "open", &lock_path))?;
        match flock(&lock_file, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {}
            Err(Errno::WOULDBLOCK) => return Err(StoreError::StorageLocked(layout.root().into())),
            Err(e) => return Err(StoreError::io(e.into(), "lock", &lock_path)),
        }

        let blobs = BlobStore::new(layout.clone());
        let manifests = ManifestStore::new(layout.clone(), blobs.clone());
        let uploads = UploadManager::new(layout.clone(), blobs.clone());
        let catalog = Catalog::new(layout.clone(), manifests.clone());
        info!("opened registry storage at {}", layout.root().display());

        Ok(Self {
            config,
            layout,
            blobs,
            manifests,
            uploads,
            catalog,
            repo_locks: Mutex::new(HashMap::new()),
            lock_file,
        })
    }

    /// The configuration this registry was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The path resolver for this root.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn repo_lock(&self, repo: &RepositoryName) -> Arc<RwLock<()>> {
        self.repo_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(repo.clone())
            .or_default()
            .clone()
    }

    /// API version probe.
    pub fn api_version(&self) -> ApiVersion {
        ApiVersion {
            version: API_VERSION,
        }
    }

    /// Existence and size of a blob.
    pub async fn check_blob(&self, name: &str, digest: &str) -> Result<BlobInfo> {
        let repo = RepositoryName::parse(name)?;
        let digest = Digest::parse(digest)?;
        self.blobs
            .exists(&repo, &digest)
            .await?
            .ok_or(StoreError::BlobUnknown {
                repository: repo.to_string(),
                digest,
            })
    }

    /// Open a blob for streaming to the client.
    pub async fn fetch_blob(&self, name: &str, digest: &str) -> Result<BlobReader> {
        let repo = RepositoryName::parse(name)?;
        let digest = Digest::parse(digest)?;
        self.blobs.open(&repo, &digest).await
    }

    /// Begin a chunked upload.
    pub async fn start_upload(&self, name: &str) -> Result<UploadStarted> {
        let repo = RepositoryName::parse(name)?;
        let id = self.uploads.start(&repo).await?;
        Ok(UploadStarted { id, offset: 0 })
    }

    /// Append a chunk to an upload session. Returns the new offset.
    pub async fn append_chunk(
        &self,
        name: &str,
        id: &str,
        chunk: &mut (impl AsyncRead + Unpin),
    ) -> Result<u64> {
        let repo = RepositoryName::parse(name)?;
        self.uploads.append(&repo, id, chunk).await
    }

    /// Bytes an upload session has received so far.
    pub async fn upload_status(&self, name: &str, id: &str) -> Result<u64> {
        let repo = RepositoryName::parse(name)?;
        self.uploads.status(&repo, id).await
    }

    /// Verify and publish an upload session under `digest`.
    pub async fn finalize_upload(&self, name: &str, id: &str, digest: &str) -> Result<Digest> {
        let repo = RepositoryName::parse(name)?;
        let digest = Digest::parse(digest)?;
        let lock = self.repo_lock(&repo);
        let _shared = lock.read().await;
        let info = self.uploads.finalize(&repo, id, &digest).await?;
        Ok(info.digest)
    }

    /// Store a whole blob in one request.
    pub async fn monolithic_upload(
        &self,
        name: &str,
        digest: &str,
        body: &mut (impl AsyncRead + Unpin),
    ) -> Result<Digest> {
        let repo = RepositoryName::parse(name)?;
        let digest = Digest::parse(digest)?;
        let lock = self.repo_lock(&repo);
        let _shared = lock.read().await;
        let info = self.blobs.put(&repo, &digest, body).await?;
        Ok(info.digest)
    }

    /// Remove a blob.
    pub async fn delete_blob(&self, name: &str, digest: &str) -> Result<()> {
        let repo = RepositoryName::parse(name)?;
        let digest = Digest::parse(digest)?;
        let lock = self.repo_lock(&repo);
        let _shared = lock.read().await;
        self.blobs.delete(&repo, &digest).await
    }

    /// Fetch a manifest by tag or digest.
    pub async fn fetch_manifest(&self, name: &str, reference: &str) -> Result<Manifest> {
        let repo = RepositoryName::parse(name)?;
        let reference = Reference::parse(reference)?;
        self.manifests.get(&repo, &reference).await
    }

    /// Store a manifest. Returns its canonical digest.
    pub async fn put_manifest(
        &self,
        name: &str,
        reference: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<Digest> {
        let repo = RepositoryName::parse(name)?;
        let reference = Reference::parse(reference)?;
        let lock = self.repo_lock(&repo);
        let _shared = lock.read().await;
        self.manifests
            .put(&repo, &reference, bytes, content_type)
            .await
    }

    /// Delete a manifest by tag or digest.
    pub async fn delete_manifest(&self, name: &str, reference: &str) -> Result<()> {
        let repo = RepositoryName::parse(name)?;
        let reference = Reference::parse(reference)?;
        let lock = self.repo_lock(&repo);
        let _shared = lock.read().await;
        self.manifests.delete(&repo, &reference).await
    }

    /// Repository names in lexical order, one page at a time.
    ///
    /// `n` defaults to the configured page size.
    pub async fn list_repositories(
        &self,
        n: Option<usize>,
        last: Option<&str>,
    ) -> Result<Vec<String>> {
        let n = n.unwrap_or(self.config.default_page_size);
        Ok(self
            .catalog
            .repositories_page(n, last)
            .await?
            .into_iter()
            .map(|name| name.to_string())
            .collect())
    }

    /// Tags of a repository.
    pub async fn list_tags(&self, name: &str) -> Result<TagList> {
        let repo = RepositoryName::parse(name)?;
        let list = self.catalog.tags(&repo).await?;
        if !list.exists {
            return Err(StoreError::NameUnknown(repo.to_string()));
        }
        Ok(list)
    }

    /// Run garbage collection over `target`.
    ///
    /// Never fails as a whole; problems are collected in
    /// [`GcReport::errors`].
    pub async fn run_gc(&self, target: GcTarget, options: GcOptions) -> GcReport {
        let mut report = GcReport {
            dry_run: options.dry_run,
            ..Default::default()
        };
        let repos = match target {
            GcTarget::Repository(repo) => vec![repo],
            GcTarget::All => match self.catalog.repositories().await {
                Ok(repos) => repos,
                Err(e) => {
                    report.errors.push(e);
                    return report;
                }
            },
        };

        let collector = GarbageCollector {
            blobs: &self.blobs,
            manifests: &self.manifests,
            uploads: &self.uploads,
            upload_stale_after: self.config.upload_stale_after(),
        };
        for repo in repos {
            let lock = self.repo_lock(&repo);
            let _exclusive = lock.write().await;
            collector.collect(&repo, options, &mut report).await;
        }
        debug!(
            "gc finished: {} items, {} bytes, {} errors",
            report.reclaimed.len(),
            report.bytes_reclaimed,
            report.errors.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::TestRegistry;

    #[tokio::test]
    async fn test_second_open_is_locked() {
        let test = TestRegistry::new();
        let registry = test.open();
        assert!(matches!(
            Registry::open(test.config()),
            Err(StoreError::StorageLocked(_))
        ));
        drop(registry);
        Registry::open(test.config()).unwrap();
    }

    #[tokio::test]
    async fn test_identifiers_validated() {
        let test = TestRegistry::new();
        let registry = test.open();
        assert!(matches!(
            registry.start_upload("Bad/Name").await,
            Err(StoreError::NameInvalid(_))
        ));
        assert!(matches!(
            registry.check_blob("app", "sha256:nope").await,
            Err(StoreError::DigestInvalid { .. })
        ));
        assert!(matches!(
            registry.put_manifest("app", "bad/tag", b"{}", None).await,
            Err(StoreError::TagInvalid(_))
        ));
        assert_eq!(registry.api_version().version, "registry/2.0");
    }

    #[tokio::test]
    async fn test_list_tags_unknown_repository() {
        let test = TestRegistry::new();
        let registry = test.open();
        assert!(matches!(
            registry.list_tags("ghost").await,
            Err(StoreError::NameUnknown(name)) if name == "ghost"
        ));
        registry.start_upload("ghost").await.unwrap();
        assert!(registry.list_tags("ghost").await.unwrap().tags.is_empty());
    }

    #[tokio::test]
    async fn test_gc_waits_for_writers() {
        let test = TestRegistry::new();
        let registry = Arc::new(test.open());
        let repo = RepositoryName::parse("app").unwrap();

        // hold the shared lock as a manifest put would
        let lock = registry.repo_lock(&repo);
        let shared = lock.read().await;

        let gc = tokio::spawn({
            let registry = registry.clone();
            async move {
                registry
                    .run_gc(GcTarget::Repository(repo), GcOptions::default())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!gc.is_finished());

        drop(shared);
        let report = gc.await.unwrap();
        assert!(report.errors.is_empty());
    }
}
