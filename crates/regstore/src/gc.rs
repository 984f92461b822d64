//! Garbage collection.
//!
//! Collection is a mark and sweep over one repository at a time:
//!
//! 1. Mark: every blob referenced by a stored manifest revision is live.
//! 2. Sweep every blob not marked, regardless of its age.
//! 3. Sweep upload sessions idle for longer than the staleness threshold,
//!    together with staging files of interrupted blob puts.
//!
//! The caller holds the repository's write lock for the whole run so no
//! manifest can start referencing a blob between mark and sweep. Failures on
//! individual files are collected in the [`GcReport`] and the sweep goes on.

use std::{fmt, path::PathBuf, time::Duration};

use log::{debug, info, trace};

use crate::{
    blob::BlobStore,
    digest::Digest,
    error::{NotFoundFilter, StoreError},
    layout::RepositoryName,
    manifest::ManifestStore,
    upload::UploadManager,
};

/// Which repositories a collection covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcTarget {
    /// A single repository.
    Repository(RepositoryName),
    /// Every repository in the catalog.
    All,
}

/// Knobs for a collection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcOptions {
    /// Report what would be reclaimed without deleting anything.
    pub dry_run: bool,
}

/// One reclaimed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reclaimed {
    /// An unreferenced blob.
    Blob {
        /// Repository it was removed from.
        repository: RepositoryName,
        /// Its digest.
        digest: Digest,
        /// Its size in bytes.
        size: u64,
    },
    /// An abandoned upload session.
    Upload {
        /// Repository the session belonged to.
        repository: RepositoryName,
        /// Session identifier.
        id: String,
        /// Bytes the receptacle held.
        size: u64,
    },
    /// A staging file left by an interrupted blob put.
    Incoming {
        /// Repository whose blob area held it.
        repository: RepositoryName,
        /// The file.
        path: PathBuf,
        /// Its size in bytes.
        size: u64,
    },
}

impl Reclaimed {
    /// Bytes freed by this item.
    pub fn size(&self) -> u64 {
        match self {
            Self::Blob { size, .. } | Self::Upload { size, .. } | Self::Incoming { size, .. } => {
                *size
            }
        }
    }
}

impl fmt::Display for Reclaimed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blob {
                repository, digest, ..
            } => write!(f, "blob {repository}@{digest}"),
            Self::Upload { repository, id, .. } => write!(f, "upload {repository}/{id}"),
            Self::Incoming { path, .. } => write!(f, "staging file {}", path.display()),
        }
    }
}

/// Outcome of a collection run.
#[derive(Debug, Default)]
pub struct GcReport {
    /// Whether anything was actually deleted.
    pub dry_run: bool,
    /// What was (or, in a dry run, would be) removed.
    pub reclaimed: Vec<Reclaimed>,
    /// Total bytes of [`Self::reclaimed`].
    pub bytes_reclaimed: u64,
    /// Non-fatal failures met along the way.
    pub errors: Vec<StoreError>,
}

impl GcReport {
    fn record(&mut self, item: Reclaimed) {
        self.bytes_reclaimed += item.size();
        self.reclaimed.push(item);
    }

    /// Number of reclaimed blobs.
    pub fn blobs_removed(&self) -> usize {
        self.count(|item| matches!(item, Reclaimed::Blob { .. }))
    }

    /// Number of reclaimed upload sessions.
    pub fn uploads_removed(&self) -> usize {
        self.count(|item| matches!(item, Reclaimed::Upload { .. }))
    }

    /// Number of reclaimed staging files.
    pub fn incoming_removed(&self) -> usize {
        self.count(|item| matches!(item, Reclaimed::Incoming { .. }))
    }

    fn count(&self, f: impl Fn(&Reclaimed) -> bool) -> usize {
        self.reclaimed.iter().filter(|item| f(item)).count()
    }
}

/// Mark and sweep over the stores of one storage root.
#[derive(Debug)]
pub(crate) struct GarbageCollector<'a> {
    pub(crate) blobs: &'a BlobStore,
    pub(crate) manifests: &'a ManifestStore,
    pub(crate) uploads: &'a UploadManager,
    pub(crate) upload_stale_after: Duration,
}

impl GarbageCollector<'_> {
    /// Collect one repository. The caller holds its write lock.
    pub(crate) async fn collect(
        &self,
        repo: &RepositoryName,
        options: GcOptions,
        report: &mut GcReport,
    ) {
        let dry_run = options.dry_run;
        let (items_before, bytes_before) = (report.reclaimed.len(), report.bytes_reclaimed);
        debug!("collecting {repo} (dry_run: {dry_run})");

        let scan = match self.manifests.referenced_digests(repo).await {
            Ok(scan) => scan,
            Err(e) => {
                // Without a reachability set no blob can be judged dead.
                report.errors.push(e);
                return;
            }
        };
        report.errors.extend(scan.errors);

        match self.blobs.list(repo).await {
            Ok(blobs) => {
                for blob in blobs {
                    if scan.blobs.contains(&blob.digest) {
                        trace!("{repo}: {} lives", blob.digest);
                        continue;
                    }
                    if !dry_run {
                        if let Err(e) = self.blobs.delete(repo, &blob.digest).await {
                            report.errors.push(e);
                            continue;
                        }
                    }
                    report.record(Reclaimed::Blob {
                        repository: repo.clone(),
                        digest: blob.digest,
                        size: blob.size,
                    });
                }
            }
            Err(e) => report.errors.push(e),
        }

        match self
            .uploads
            .abandon_stale(repo, self.upload_stale_after, dry_run, &mut report.errors)
            .await
        {
            Ok(stale) => {
                for upload in stale {
                    report.record(Reclaimed::Upload {
                        repository: repo.clone(),
                        id: upload.id,
                        size: upload.size,
                    });
                }
            }
            Err(e) => report.errors.push(e),
        }

        match self.blobs.stale_incoming(repo, self.upload_stale_after).await {
            Ok(stale) => {
                for file in stale {
                    if !dry_run {
                        if let Err(e) = tokio::fs::remove_file(&file.path).await.filter_not_found() {
                            report.errors.push(StoreError::io(e, "remove", &file.path));
                            continue;
                        }
                        debug!("removed staging file {}", file.path.display());
                    }
                    report.record(Reclaimed::Incoming {
                        repository: repo.clone(),
                        path: file.path,
                        size: file.size,
                    });
                }
            }
            Err(e) => report.errors.push(e),
        }

        info!(
            "{repo}: {} items, {} bytes {}",
            report.reclaimed.len() - items_before,
            report.bytes_reclaimed - bytes_before,
            if dry_run { "reclaimable" } else { "reclaimed" }
        );
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        layout::Reference,
        test::{image_manifest, repo, TestRegistry},
    };

    struct Stores {
        blobs: BlobStore,
        manifests: ManifestStore,
        uploads: UploadManager,
    }

    impl Stores {
        fn new(test: &TestRegistry) -> Self {
            let blobs = BlobStore::new(test.layout());
            Self {
                manifests: ManifestStore::new(test.layout(), blobs.clone()),
                uploads: UploadManager::new(test.layout(), blobs.clone()),
                blobs,
            }
        }

        fn collector(&self) -> GarbageCollector<'_> {
            GarbageCollector {
                blobs: &self.blobs,
                manifests: &self.manifests,
                uploads: &self.uploads,
                upload_stale_after: Duration::from_secs(3600),
            }
        }

        async fn push(&self, name: &str, content: &[u8]) -> Digest {
            let digest = Digest::sha256(content);
            self.blobs
                .put(&repo(name), &digest, &mut &content[..])
                .await
                .unwrap();
            digest
        }
    }

    #[tokio::test]
    async fn test_sweeps_unreferenced_blobs() {
        let test = TestRegistry::new();
        let stores = Stores::new(&test);
        let config = stores.push("app", b"config").await;
        let layer = stores.push("app", b"layer").await;
        let orphan = stores.push("app", b"orphan").await;
        stores
            .manifests
            .put(
                &repo("app"),
                &Reference::Tag("v1".into()),
                &image_manifest(&config, &[&layer]),
                None,
            )
            .await
            .unwrap();

        let mut report = GcReport::default();
        stores
            .collector()
            .collect(&repo("app"), GcOptions::default(), &mut report)
            .await;
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(
            report.reclaimed,
            vec![Reclaimed::Blob {
                repository: repo("app"),
                digest: orphan.clone(),
                size: 6
            }]
        );
        assert_eq!(report.bytes_reclaimed, 6);
        assert!(stores.blobs.exists(&repo("app"), &orphan).await.unwrap().is_none());
        assert!(stores.blobs.exists(&repo("app"), &layer).await.unwrap().is_some());

        // a second run finds nothing
        let mut again = GcReport::default();
        stores
            .collector()
            .collect(&repo("app"), GcOptions::default(), &mut again)
            .await;
        assert!(again.reclaimed.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_deletes_nothing() {
        let test = TestRegistry::new();
        let stores = Stores::new(&test);
        let orphan = stores.push("app", b"orphan").await;

        let mut report = GcReport {
            dry_run: true,
            ..Default::default()
        };
        stores
            .collector()
            .collect(&repo("app"), GcOptions { dry_run: true }, &mut report)
            .await;
        assert_eq!(report.blobs_removed(), 1);
        assert!(stores.blobs.exists(&repo("app"), &orphan).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_incoming_swept() {
        let test = TestRegistry::new();
        let stores = Stores::new(&test);
        let ns = test.layout().ensure(&repo("app")).await.unwrap();
        let old = ns.incoming_dir().join(".tmp-old");
        let young = ns.incoming_dir().join(".tmp-young");
        std::fs::write(&old, b"12345").unwrap();
        std::fs::write(&young, b"1").unwrap();
        test.backdate(&old, Duration::from_secs(7200));

        let mut report = GcReport::default();
        stores
            .collector()
            .collect(&repo("app"), GcOptions::default(), &mut report)
            .await;
        assert_eq!(report.incoming_removed(), 1);
        assert_eq!(report.bytes_reclaimed, 5);
        assert!(!old.exists());
        assert!(young.exists());
    }

    #[test]
    fn test_display() {
        let item = Reclaimed::Upload {
            repository: repo("app"),
            id: "abc".into(),
            size: 0,
        };
        assert_eq!(item.to_string(), "upload app/abc");
    }
}
