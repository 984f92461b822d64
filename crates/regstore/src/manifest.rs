//! Manifest storage.
//!
//! Manifests are stored as immutable revisions addressed by the SHA-256 of
//! the exact bytes received, under `_manifests/revisions/<alg>/<hex>/`. The
//! raw document lives in `data` and the resolved media type beside it in
//! `media-type`. Tags are small files in `_manifests/tags/` holding the digest
//! of the revision they point at; retagging replaces that file and never
//! touches the revision.

use std::collections::BTreeSet;

use log::{debug, trace, warn};
use oci_spec::image::MediaType;
use serde::Deserialize;

use crate::{
    blob::{read_dir_names, BlobStore},
    digest::{Algorithm, Digest},
    error::{NotFoundFilter, Result, StoreError},
    layout::{validate_tag, Layout, Namespace, Reference, RepositoryName},
    util::write_atomic,
};

const DATA_FILE: &str = "data";
const MEDIA_TYPE_FILE: &str = "media-type";

/// A stored manifest revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// SHA-256 of [`Self::bytes`].
    pub digest: Digest,
    /// Media type recorded when the manifest was pushed.
    pub media_type: String,
    /// The document exactly as received.
    pub bytes: Vec<u8>,
}

/// The parts of a manifest or index that reference other content.
///
/// Parsing is lenient: unknown fields are ignored so every schema 2, OCI
/// image, OCI index and artifact manifest reads through the same struct.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestRefs {
    media_type: Option<String>,
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    blobs: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: Digest,
    /// Foreign layers are fetched from these URLs and never pushed.
    #[serde(default)]
    urls: Vec<String>,
}

impl ManifestRefs {
    fn blob_descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        self.config.iter().chain(&self.layers).chain(&self.blobs)
    }

    /// Digests of blobs that must be present before the manifest is accepted.
    /// Foreign layers may live elsewhere.
    fn required_blobs(&self) -> impl Iterator<Item = &Digest> {
        self.blob_descriptors()
            .filter(|desc| desc.urls.is_empty())
            .map(|desc| &desc.digest)
    }

    /// Digests of every blob the manifest references, foreign layers included.
    fn referenced_blobs(&self) -> impl Iterator<Item = &Digest> {
        self.blob_descriptors().map(|desc| &desc.digest)
    }
}

/// Result of scanning every revision of a repository for blob references.
#[derive(Debug, Default)]
pub struct ReferenceScan {
    /// The reachability set.
    pub blobs: BTreeSet<Digest>,
    /// Revisions that could not be read or parsed. Their references are
    /// missing from [`Self::blobs`].
    pub errors: Vec<StoreError>,
}

/// Manifest storage for all repositories under one root.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    layout: Layout,
    blobs: BlobStore,
}

impl ManifestStore {
    /// A manifest store validating blob references against `blobs`.
    pub fn new(layout: Layout, blobs: BlobStore) -> Self {
        Self { layout, blobs }
    }

    /// Store a manifest under `reference`.
    ///
    /// Returns the canonical digest. A digest reference must match it. Every
    /// blob the manifest references must already be in the repository, and
    /// every child of an index must already be a stored revision.
    pub async fn put(
        &self,
        repo: &RepositoryName,
        reference: &Reference,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<Digest> {
        let digest = Digest::sha256(bytes);
        if let Reference::Digest(claimed) = reference {
            if *claimed != digest {
                return Err(StoreError::DigestMismatch {
                    expected: claimed.clone(),
                    actual: digest,
                });
            }
        }

        let refs = parse_manifest(bytes).map_err(StoreError::ManifestInvalid)?;
        for blob in refs.required_blobs() {
            if self.blobs.exists(repo, blob).await?.is_none() {
                return Err(StoreError::ManifestBlobUnknown {
                    repository: repo.to_string(),
                    digest: blob.clone(),
                });
            }
        }
        for child in &refs.manifests {
            if !self.exists(repo, &child.digest).await? {
                return Err(manifest_unknown(repo, &child.digest));
            }
        }

        let media_type = refs
            .media_type
            .as_deref()
            .or(content_type)
            .map(str::to_string)
            .unwrap_or_else(|| MediaType::ImageManifest.to_string());

        let ns = self.layout.ensure(repo).await?;
        let rev_dir = ns.revision_dir(&digest);
        if self.exists(repo, &digest).await? {
            trace!("manifest {digest} already stored in {repo}");
        } else {
            tokio::fs::create_dir_all(&rev_dir)
                .await
                .map_err(|e| StoreError::io(e, "create directory", &rev_dir))?;
            // The data file appears last; its presence marks a complete revision.
            write_atomic(&rev_dir, &rev_dir.join(MEDIA_TYPE_FILE), media_type.as_bytes()).await?;
            write_atomic(&rev_dir, &rev_dir.join(DATA_FILE), bytes).await?;
            debug!("stored manifest {digest} ({media_type}) in {repo}");
        }

        if let Reference::Tag(tag) = reference {
            write_atomic(&ns.tags_dir(), &ns.tag_path(tag), digest.to_string().as_bytes()).await?;
            debug!("tagged {repo}:{tag} as {digest}");
        }
        Ok(digest)
    }

    /// Fetch a manifest by tag or digest.
    pub async fn get(&self, repo: &RepositoryName, reference: &Reference) -> Result<Manifest> {
        let ns = self.layout.namespace(repo);
        let digest = match reference {
            Reference::Digest(digest) => digest.clone(),
            Reference::Tag(tag) => resolve_tag(&ns, tag)
                .await?
                .ok_or_else(|| manifest_unknown(repo, tag))?,
        };

        let rev_dir = ns.revision_dir(&digest);
        let data = rev_dir.join(DATA_FILE);
        let Some(bytes) = tokio::fs::read(&data)
            .await
            .filter_not_found()
            .map_err(|e| StoreError::io(e, "read", &data))?
        else {
            return Err(manifest_unknown(repo, reference));
        };

        let media_path = rev_dir.join(MEDIA_TYPE_FILE);
        let media_type = match tokio::fs::read_to_string(&media_path).await.filter_not_found() {
            Ok(Some(media_type)) => media_type.trim().to_string(),
            Ok(None) => {
                warn!("manifest {digest} in {repo} has no recorded media type");
                MediaType::ImageManifest.to_string()
            }
            Err(e) => return Err(StoreError::io(e, "read", &media_path)),
        };

        Ok(Manifest {
            digest,
            media_type,
            bytes,
        })
    }

    /// Delete by tag (only the tag goes) or by digest (the revision and every
    /// tag pointing at it go).
    pub async fn delete(&self, repo: &RepositoryName, reference: &Reference) -> Result<()> {
        let ns = self.layout.namespace(repo);
        match reference {
            Reference::Tag(tag) => {
                let path = ns.tag_path(tag);
                match tokio::fs::remove_file(&path).await.filter_not_found() {
                    Ok(Some(())) => {
                        debug!("untagged {repo}:{tag}");
                        Ok(())
                    }
                    Ok(None) => Err(manifest_unknown(repo, tag)),
                    Err(e) => Err(StoreError::io(e, "remove", &path)),
                }
            }
            Reference::Digest(digest) => {
                if !self.exists(repo, digest).await? {
                    return Err(manifest_unknown(repo, digest));
                }
                for tag in self.tags(repo).await? {
                    if resolve_tag(&ns, &tag).await?.as_ref() == Some(digest) {
                        let path = ns.tag_path(&tag);
                        tokio::fs::remove_file(&path)
                            .await
                            .filter_not_found()
                            .map_err(|e| StoreError::io(e, "remove", &path))?;
                        debug!("untagged {repo}:{tag}");
                    }
                }
                let rev_dir = ns.revision_dir(digest);
                tokio::fs::remove_dir_all(&rev_dir)
                    .await
                    .filter_not_found()
                    .map_err(|e| StoreError::io(e, "remove", &rev_dir))?;
                debug!("deleted manifest {digest} from {repo}");
                Ok(())
            }
        }
    }

    /// Whether a revision with this digest is stored.
    pub async fn exists(&self, repo: &RepositoryName, digest: &Digest) -> Result<bool> {
        let data = self
            .layout
            .namespace(repo)
            .revision_dir(digest)
            .join(DATA_FILE);
        let meta = tokio::fs::metadata(&data)
            .await
            .filter_not_found()
            .map_err(|e| StoreError::io(e, "stat", &data))?;
        Ok(meta.is_some_and(|m| m.is_file()))
    }

    /// Tags of the repository in lexical order.
    pub async fn tags(&self, repo: &RepositoryName) -> Result<Vec<String>> {
        let tags_dir = self.layout.namespace(repo).tags_dir();
        // Staging files start with '.', which no valid tag does.
        Ok(read_dir_names(&tags_dir)
            .await?
            .into_iter()
            .filter(|name| validate_tag(name).is_ok())
            .collect())
    }

    /// Digests of all stored revisions.
    pub async fn revisions(&self, repo: &RepositoryName) -> Result<Vec<Digest>> {
        let revisions_dir = self.layout.namespace(repo).revisions_dir();
        let mut found = Vec::new();
        for alg_dir in read_dir_names(&revisions_dir).await? {
            let Ok(algorithm) = alg_dir.parse::<Algorithm>() else {
                warn!(
                    "ignoring unexpected entry {alg_dir:?} in {}",
                    revisions_dir.display()
                );
                continue;
            };
            for hex in read_dir_names(&revisions_dir.join(&alg_dir)).await? {
                match Digest::from_hex(algorithm, &hex) {
                    Ok(digest) if self.exists(repo, &digest).await? => found.push(digest),
                    Ok(digest) => trace!("skipping incomplete revision {digest} in {repo}"),
                    Err(_) => warn!("ignoring unexpected revision {alg_dir}/{hex} in {repo}"),
                }
            }
        }
        Ok(found)
    }

    /// Collect every blob referenced by any stored revision.
    ///
    /// Revisions that cannot be read or parsed are reported in
    /// [`ReferenceScan::errors`] and skipped.
    pub async fn referenced_digests(&self, repo: &RepositoryName) -> Result<ReferenceScan> {
        let ns = self.layout.namespace(repo);
        let mut scan = ReferenceScan::default();
        for digest in self.revisions(repo).await? {
            let data = ns.revision_dir(&digest).join(DATA_FILE);
            let bytes = match tokio::fs::read(&data).await.filter_not_found() {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    scan.errors.push(StoreError::io(e, "read", &data));
                    continue;
                }
            };
            match parse_manifest(&bytes) {
                Ok(refs) => {
                    for blob in refs.referenced_blobs() {
                        trace!("{repo}: {digest} references {blob}");
                        scan.blobs.insert(blob.clone());
                    }
                }
                Err(reason) => {
                    warn!("malformed manifest {digest} in {repo}: {reason}");
                    scan.errors.push(StoreError::MalformedManifest {
                        repository: repo.to_string(),
                        digest,
                        reason,
                    });
                }
            }
        }
        Ok(scan)
    }
}

fn parse_manifest(bytes: &[u8]) -> std::result::Result<ManifestRefs, String> {
    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    if !value.is_object() {
        return Err("manifest must be a JSON object".to_string());
    }
    ManifestRefs::deserialize(value).map_err(|e| e.to_string())
}

async fn resolve_tag(ns: &Namespace, tag: &str) -> Result<Option<Digest>> {
    let path = ns.tag_path(tag);
    let Some(content) = tokio::fs::read_to_string(&path)
        .await
        .filter_not_found()
        .map_err(|e| StoreError::io(e, "read", &path))?
    else {
        return Ok(None);
    };
    Digest::parse(content.trim()).map(Some)
}

fn manifest_unknown(repo: &RepositoryName, reference: impl ToString) -> StoreError {
    StoreError::ManifestUnknown {
        repository: repo.to_string(),
        reference: reference.to_string(),
    }
}
