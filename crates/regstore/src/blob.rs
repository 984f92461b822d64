//! Content-addressed blob storage.
//!
//! Blobs live under `_blobs/<algorithm>/<xx>/<hex>` in their repository's
//! namespace. Nothing becomes visible under a digest until its content has
//! been hashed and verified: writes go to a staging file in `_blobs/_incoming`
//! and are renamed into place only after verification.

use std::{
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};

use crate::{
    digest::{Algorithm, Digest},
    error::{NotFoundFilter, Result, StoreError},
    layout::{Layout, Namespace, RepositoryName, INCOMING_DIR},
    util::{age, copy_hashing, persist, staging_file},
};

/// Identity and size of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    /// The verified content digest.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
}

/// An open blob.
#[derive(Debug)]
pub struct BlobReader {
    info: BlobInfo,
    file: tokio::fs::File,
}

impl BlobReader {
    /// Digest and size of the blob being read.
    pub fn info(&self) -> &BlobInfo {
        &self.info
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.info.size
    }
}

impl AsyncRead for BlobReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

/// A leftover staging file from an interrupted blob write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleFile {
    /// Location of the file.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

/// Blob storage for all repositories under one root.
#[derive(Debug, Clone)]
pub struct BlobStore {
    layout: Layout,
}

impl BlobStore {
    /// A blob store over `layout`.
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    /// Look up a blob. An unknown repository reads as an absent blob.
    pub async fn exists(&self, repo: &RepositoryName, digest: &Digest) -> Result<Option<BlobInfo>> {
        let path = self.layout.namespace(repo).blob_path(digest);
        let meta = tokio::fs::metadata(&path)
            .await
            .filter_not_found()
            .map_err(|e| StoreError::io(e, "stat", &path))?;
        Ok(meta.filter(|m| m.is_file()).map(|m| BlobInfo {
            digest: digest.clone(),
            size: m.len(),
        }))
    }

    /// Open a blob for reading.
    pub async fn open(&self, repo: &RepositoryName, digest: &Digest) -> Result<BlobReader> {
        let path = self.layout.namespace(repo).blob_path(digest);
        let Some(file) = tokio::fs::File::open(&path)
            .await
            .filter_not_found()
            .map_err(|e| StoreError::io(e, "open", &path))?
        else {
            return Err(blob_unknown(repo, digest));
        };
        let size = file
            .metadata()
            .await
            .map_err(|e| StoreError::io(e, "stat", &path))?
            .len();
        trace!("opened blob {digest} in {repo} ({size} bytes)");
        Ok(BlobReader {
            info: BlobInfo {
                digest: digest.clone(),
                size,
            },
            file,
        })
    }

    /// Store the content of `source` under `digest`.
    ///
    /// The source is hashed with the algorithm of the claimed digest while it
    /// is written. On a mismatch or a failing source nothing is stored and the
    /// staging file is removed.
    pub async fn put(
        &self,
        repo: &RepositoryName,
        digest: &Digest,
        source: &mut (impl AsyncRead + Unpin),
    ) -> Result<BlobInfo> {
        let ns = self.layout.ensure(repo).await?;
        let (mut file, staged) = staging_file(&ns.incoming_dir()).await?;

        let mut hasher = digest.algorithm().hasher();
        let size = copy_hashing(source, &mut file, &staged, Some(&mut hasher)).await?;
        let actual = hasher.finalize();
        if actual != *digest {
            debug!("rejecting blob for {repo}: expected {digest}, got {actual}");
            return Err(StoreError::DigestMismatch {
                expected: digest.clone(),
                actual,
            });
        }

        if let Some(existing) = self.exists(repo, digest).await? {
            trace!("blob {digest} already present in {repo}");
            return Ok(existing);
        }

        file.sync_all()
            .await
            .map_err(|e| StoreError::io(e, "sync", &staged))?;
        file.shutdown()
            .await
            .map_err(|e| StoreError::io(e, "close", &staged))?;
        drop(file);

        let dest = ns.blob_path(digest);
        ensure_parent(&dest).await?;
        persist(staged, &dest).await?;
        debug!("stored blob {digest} in {repo} ({size} bytes)");
        Ok(BlobInfo {
            digest: digest.clone(),
            size,
        })
    }

    /// Move an already verified file into place under `digest`.
    ///
    /// `src` must live on the same filesystem as the storage root.
    pub(crate) async fn publish(&self, ns: &Namespace, digest: &Digest, src: &Path) -> Result<BlobInfo> {
        let dest = ns.blob_path(digest);
        ensure_parent(&dest).await?;
        tokio::fs::rename(src, &dest)
            .await
            .map_err(|e| StoreError::io(e, "rename", &dest))?;
        let size = tokio::fs::metadata(&dest)
            .await
            .map_err(|e| StoreError::io(e, "stat", &dest))?
            .len();
        debug!("published blob {digest} in {} ({size} bytes)", ns.name());
        Ok(BlobInfo {
            digest: digest.clone(),
            size,
        })
    }

    /// Remove a blob.
    pub async fn delete(&self, repo: &RepositoryName, digest: &Digest) -> Result<()> {
        let path = self.layout.namespace(repo).blob_path(digest);
        match tokio::fs::remove_file(&path).await.filter_not_found() {
            Ok(Some(())) => {
                debug!("deleted blob {digest} from {repo}");
                Ok(())
            }
            Ok(None) => Err(blob_unknown(repo, digest)),
            Err(e) => Err(StoreError::io(e, "remove", &path)),
        }
    }

    /// Every blob stored in the repository, in digest order.
    ///
    /// Entries that are not valid blob names are logged and skipped.
    pub async fn list(&self, repo: &RepositoryName) -> Result<Vec<BlobInfo>> {
        let blobs_dir = self.layout.namespace(repo).blobs_dir();
        let mut found = Vec::new();

        for alg_dir in read_dir_names(&blobs_dir).await? {
            if alg_dir == INCOMING_DIR {
                continue;
            }
            let Ok(algorithm) = alg_dir.parse::<Algorithm>() else {
                warn!("ignoring unexpected entry {alg_dir:?} in {}", blobs_dir.display());
                continue;
            };
            let alg_path = blobs_dir.join(&alg_dir);
            for fanout in read_dir_names(&alg_path).await? {
                let fanout_path = alg_path.join(&fanout);
                for name in read_dir_names(&fanout_path).await? {
                    let path = fanout_path.join(&name);
                    let digest = match Digest::from_hex(algorithm, &name) {
                        Ok(digest) if digest.hex().starts_with(&fanout) => digest,
                        _ => {
                            warn!("ignoring unexpected blob file {}", path.display());
                            continue;
                        }
                    };
                    // Tolerate files vanishing under a concurrent delete.
                    let Some(meta) = tokio::fs::metadata(&path)
                        .await
                        .filter_not_found()
                        .map_err(|e| StoreError::io(e, "stat", &path))?
                    else {
                        continue;
                    };
                    found.push(BlobInfo {
                        digest,
                        size: meta.len(),
                    });
                }
            }
        }

        found.sort_by(|a, b| a.digest.cmp(&b.digest));
        Ok(found)
    }

    /// Staging files older than `older_than`, left behind by interrupted puts.
    pub async fn stale_incoming(
        &self,
        repo: &RepositoryName,
        older_than: Duration,
    ) -> Result<Vec<StaleFile>> {
        let incoming = self.layout.namespace(repo).incoming_dir();
        let mut stale = Vec::new();
        for name in read_dir_names(&incoming).await? {
            let path = incoming.join(name);
            let Some(meta) = tokio::fs::metadata(&path)
                .await
                .filter_not_found()
                .map_err(|e| StoreError::io(e, "stat", &path))?
            else {
                continue;
            };
            if meta.is_file() && age(&meta) > older_than {
                stale.push(StaleFile {
                    path,
                    size: meta.len(),
                });
            }
        }
        Ok(stale)
    }
}

fn blob_unknown(repo: &RepositoryName, digest: &Digest) -> StoreError {
    StoreError::BlobUnknown {
        repository: repo.to_string(),
        digest: digest.clone(),
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(e, "create directory", parent))?;
    }
    Ok(())
}

/// Names of the entries in `dir`; a missing directory is empty.
pub(crate) async fn read_dir_names(dir: &Path) -> Result<Vec<String>> {
    let Some(mut entries) = tokio::fs::read_dir(dir)
        .await
        .filter_not_found()
        .map_err(|e| StoreError::io(e, "read directory", dir))?
    else {
        return Ok(Vec::new());
    };
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::io(e, "read directory", dir))?
    {
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(name) => warn!("ignoring non-UTF-8 entry {name:?} in {}", dir.display()),
        }
    }
    names.sort();
    Ok(names)
}
