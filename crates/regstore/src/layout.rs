//! Repository path resolution.
//!
//! Every repository gets its own namespace directory below the storage root.
//! The blob store, manifest store and upload sessions each own one
//! subdirectory of it:
//!
//! ```text
//! root/
//! ├── .lock
//! └── repositories/
//!     └── library/alpine/                   # namespace for "library/alpine"
//!         ├── _blobs/
//!         │   ├── sha256/b9/b94d27b9...     # finalized blobs
//!         │   └── _incoming/                # monolithic puts in flight
//!         ├── _manifests/
//!         │   ├── revisions/sha256/<hex>/{data,media-type}
//!         │   └── tags/<tag>                # contains "sha256:<hex>"
//!         └── _uploads/<uuid>/{data,state.json}
//! ```
//!
//! Name components may not start with `_`, so the internal directories can
//! never collide with a nested repository name.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use regex_automata::meta::Regex;

use crate::{
    digest::Digest,
    error::{NotFoundFilter, Result, StoreError},
};

/// Maximum length of a repository name, in bytes.
pub const MAX_NAME_LENGTH: usize = 255;

pub(crate) const BLOBS_DIR: &str = "_blobs";
pub(crate) const INCOMING_DIR: &str = "_incoming";
pub(crate) const MANIFESTS_DIR: &str = "_manifests";
pub(crate) const UPLOADS_DIR: &str = "_uploads";

static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*)*$",
    )
    .expect("repository name pattern is valid")
});

static TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]{0,127}$").expect("tag pattern is valid")
});

/// A repository name that satisfies the distribution name grammar.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryName(String);

impl RepositoryName {
    /// Validate `name`.
    pub fn parse(name: &str) -> Result<Self> {
        if name.is_empty() || name.len() > MAX_NAME_LENGTH || !NAME_RE.is_match(name) {
            return Err(StoreError::NameInvalid(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    /// The name as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Check a tag against the distribution tag grammar.
pub fn validate_tag(tag: &str) -> Result<()> {
    if TAG_RE.is_match(tag) {
        Ok(())
    } else {
        Err(StoreError::TagInvalid(tag.to_string()))
    }
}

/// A manifest reference: either a tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A mutable tag such as `latest`.
    Tag(String),
    /// An immutable content digest.
    Digest(Digest),
}

impl Reference {
    /// Classify and validate a reference string.
    ///
    /// Tags cannot contain `:`, so anything with one is parsed as a digest.
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.contains(':') {
            Ok(Self::Digest(Digest::parse(reference)?))
        } else {
            validate_tag(reference)?;
            Ok(Self::Tag(reference.to_string()))
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(tag) => f.write_str(tag),
            Self::Digest(digest) => write!(f, "{digest}"),
        }
    }
}

/// Maps repository names onto namespace directories under a storage root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// A resolver for the given storage root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all repository namespaces.
    pub fn repositories_dir(&self) -> PathBuf {
        self.root.join("repositories")
    }

    /// The namespace for `name`. Pure path computation; nothing is created.
    pub fn namespace(&self, name: &RepositoryName) -> Namespace {
        Namespace {
            name: name.clone(),
            dir: self.repositories_dir().join(name.as_str()),
        }
    }

    /// The namespace for `name`, creating its directories if needed.
    pub async fn ensure(&self, name: &RepositoryName) -> Result<Namespace> {
        let ns = self.namespace(name);
        for dir in [
            ns.incoming_dir(),
            ns.revisions_dir(),
            ns.tags_dir(),
            ns.uploads_dir(),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| StoreError::io(e, "create directory", &dir))?;
        }
        Ok(ns)
    }

    /// The namespace for `name` if it was ever materialized.
    pub async fn existing(&self, name: &RepositoryName) -> Result<Option<Namespace>> {
        let ns = self.namespace(name);
        if ns.is_materialized().await? {
            Ok(Some(ns))
        } else {
            Ok(None)
        }
    }
}

/// The storage namespace of one repository.
#[derive(Debug, Clone)]
pub struct Namespace {
    name: RepositoryName,
    dir: PathBuf,
}

impl Namespace {
    /// The repository name.
    pub fn name(&self) -> &RepositoryName {
        &self.name
    }

    /// The namespace directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Root of the blob area.
    pub fn blobs_dir(&self) -> PathBuf {
        self.dir.join(BLOBS_DIR)
    }

    /// Private directory for blob writes that have not been verified yet.
    pub fn incoming_dir(&self) -> PathBuf {
        self.blobs_dir().join(INCOMING_DIR)
    }

    /// Final location of a blob.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(digest.to_object_pathname())
    }

    /// Root of the manifest area.
    pub fn manifests_dir(&self) -> PathBuf {
        self.dir.join(MANIFESTS_DIR)
    }

    /// Directory of digest-addressed manifest revisions.
    pub fn revisions_dir(&self) -> PathBuf {
        self.manifests_dir().join("revisions")
    }

    /// Directory of one manifest revision.
    pub fn revision_dir(&self, digest: &Digest) -> PathBuf {
        self.revisions_dir()
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    /// Directory of tag links.
    pub fn tags_dir(&self) -> PathBuf {
        self.manifests_dir().join("tags")
    }

    /// Link file for a tag. The caller validates the tag.
    pub fn tag_path(&self, tag: &str) -> PathBuf {
        self.tags_dir().join(tag)
    }

    /// Root of the upload-session area.
    pub fn uploads_dir(&self) -> PathBuf {
        self.dir.join(UPLOADS_DIR)
    }

    /// Directory of one upload session.
    pub fn upload_dir(&self, id: &str) -> PathBuf {
        self.uploads_dir().join(id)
    }

    /// Whether [`Layout::ensure`] has run for this namespace.
    pub async fn is_materialized(&self) -> Result<bool> {
        let blobs = self.blobs_dir();
        let meta = tokio::fs::metadata(&blobs)
            .await
            .filter_not_found()
            .map_err(|e| StoreError::io(e, "stat", &blobs))?;
        Ok(meta.is_some_and(|m| m.is_dir()))
    }
}
