//! Error types for the regstore library.
//!
//! Every store operation returns a [`Result<T>`], an alias for
//! `Result<T, StoreError>`. The variants follow the failure classes a
//! distribution endpoint has to tell apart:
//!
//! - **Not found**: [`BlobUnknown`], [`ManifestUnknown`], [`NameUnknown`],
//!   [`UploadUnknown`]
//! - **Integrity**: [`DigestMismatch`], [`ManifestBlobUnknown`]
//! - **Malformed input**: [`DigestInvalid`], [`NameInvalid`], [`TagInvalid`],
//!   [`ManifestInvalid`], [`MalformedManifest`]
//! - **System**: [`Io`], [`Config`], [`StorageLocked`]
//!
//! The protocol layer maps these onto status codes; [`StoreError::code`] gives
//! the matching distribution error code for the response body.
//!
//! [`BlobUnknown`]: StoreError::BlobUnknown
//! [`ManifestUnknown`]: StoreError::ManifestUnknown
//! [`NameUnknown`]: StoreError::NameUnknown
//! [`UploadUnknown`]: StoreError::UploadUnknown
//! [`DigestMismatch`]: StoreError::DigestMismatch
//! [`ManifestBlobUnknown`]: StoreError::ManifestBlobUnknown
//! [`DigestInvalid`]: StoreError::DigestInvalid
//! [`NameInvalid`]: StoreError::NameInvalid
//! [`TagInvalid`]: StoreError::TagInvalid
//! [`ManifestInvalid`]: StoreError::ManifestInvalid
//! [`MalformedManifest`]: StoreError::MalformedManifest
//! [`Io`]: StoreError::Io
//! [`Config`]: StoreError::Config
//! [`StorageLocked`]: StoreError::StorageLocked

use std::path::{Path, PathBuf};

use crate::digest::Digest;

/// Result type alias for operations that may return a StoreError.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error types for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The blob is not present in the repository.
    #[error("blob unknown to repository {repository}: {digest}")]
    BlobUnknown {
        /// Repository that was searched.
        repository: String,
        /// Digest that was not found.
        digest: Digest,
    },

    /// No manifest is stored under the given tag or digest.
    #[error("manifest unknown to repository {repository}: {reference}")]
    ManifestUnknown {
        /// Repository that was searched.
        repository: String,
        /// Tag or digest string used for the lookup.
        reference: String,
    },

    /// The repository namespace has never been created.
    #[error("repository name not known to registry: {0}")]
    NameUnknown(String),

    /// The upload session does not exist or is no longer accepting data.
    #[error("blob upload unknown to repository {repository}: {id}")]
    UploadUnknown {
        /// Repository the session was looked up in.
        repository: String,
        /// Session identifier.
        id: String,
    },

    /// The content does not hash to the claimed digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest claimed by the client.
        expected: Digest,
        /// Digest computed over the received content.
        actual: Digest,
    },

    /// A string could not be parsed as a digest.
    #[error("invalid digest {digest:?}: {reason}")]
    DigestInvalid {
        /// The offending input.
        digest: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The repository name does not match the distribution name grammar.
    #[error("invalid repository name: {0:?}")]
    NameInvalid(String),

    /// The tag does not match the distribution tag grammar.
    #[error("invalid tag: {0:?}")]
    TagInvalid(String),

    /// A manifest submitted for storage is not an acceptable document.
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    /// A stored manifest could not be parsed while scanning references.
    #[error("malformed manifest {digest} in {repository}: {reason}")]
    MalformedManifest {
        /// Repository holding the manifest.
        repository: String,
        /// Digest of the stored revision.
        digest: Digest,
        /// Parser message.
        reason: String,
    },

    /// A manifest references a blob that is not in the repository.
    #[error("manifest references blob unknown to repository {repository}: {digest}")]
    ManifestBlobUnknown {
        /// Repository the manifest was pushed to.
        repository: String,
        /// Missing blob digest.
        digest: Digest,
    },

    /// I/O error during a storage operation.
    #[error("I/O error during {operation} of {}: {source}", .path.display())]
    Io {
        /// What was being attempted ("write", "rename", ...).
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error on a byte stream supplied by the caller.
    #[error("error reading request body: {0}")]
    Stream(#[source] std::io::Error),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// Another process holds the storage root.
    #[error("storage root {} is in use by another process", .0.display())]
    StorageLocked(PathBuf),

    /// JSON (de)serialization of internal state failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Wrap an I/O error with the operation and path that produced it.
    pub fn io(source: std::io::Error, operation: &'static str, path: impl AsRef<Path>) -> Self {
        Self::Io {
            operation,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// True for the not-found class: blob, manifest, repository or upload.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BlobUnknown { .. }
                | Self::ManifestUnknown { .. }
                | Self::NameUnknown(_)
                | Self::UploadUnknown { .. }
        )
    }

    /// The distribution error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BlobUnknown { .. } => "BLOB_UNKNOWN",
            Self::ManifestUnknown { .. } => "MANIFEST_UNKNOWN",
            Self::NameUnknown(_) => "NAME_UNKNOWN",
            Self::UploadUnknown { .. } => "BLOB_UPLOAD_UNKNOWN",
            Self::DigestMismatch { .. } | Self::DigestInvalid { .. } => "DIGEST_INVALID",
            Self::NameInvalid(_) => "NAME_INVALID",
            Self::TagInvalid(_) => "TAG_INVALID",
            Self::ManifestInvalid(_) | Self::MalformedManifest { .. } => "MANIFEST_INVALID",
            Self::ManifestBlobUnknown { .. } => "MANIFEST_BLOB_UNKNOWN",
            Self::Stream(_) => "BLOB_UPLOAD_INVALID",
            Self::Io { .. }
            | Self::Config(_)
            | Self::StorageLocked(_)
            | Self::Json(_) => "UNKNOWN",
        }
    }
}

/// Extension for turning `NotFound` I/O errors into `None`.
pub(crate) trait NotFoundFilter<T> {
    fn filter_not_found(self) -> std::io::Result<Option<T>>;
}

impl<T> NotFoundFilter<T> for std::io::Result<T> {
    fn filter_not_found(self) -> std::io::Result<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_class() {
        let digest = Digest::sha256(b"");
        assert!(StoreError::BlobUnknown {
            repository: "a".into(),
            digest: digest.clone(),
        }
        .is_not_found());
        assert!(StoreError::NameUnknown("a".into()).is_not_found());
        assert!(!StoreError::DigestMismatch {
            expected: digest.clone(),
            actual: digest,
        }
        .is_not_found());
    }

    #[test]
    fn test_codes() {
        assert_eq!(
            StoreError::UploadUnknown {
                repository: "a".into(),
                id: "x".into()
            }
            .code(),
            "BLOB_UPLOAD_UNKNOWN"
        );
        assert_eq!(
            StoreError::ManifestBlobUnknown {
                repository: "a".into(),
                digest: Digest::sha256(b"x"),
            }
            .code(),
            "MANIFEST_BLOB_UNKNOWN"
        );
    }

    #[test]
    fn test_filter_not_found() {
        let missing: std::io::Result<()> = Err(std::io::ErrorKind::NotFound.into());
        assert!(missing.filter_not_found().unwrap().is_none());
        let denied: std::io::Result<()> = Err(std::io::ErrorKind::PermissionDenied.into());
        assert!(denied.filter_not_found().is_err());
    }
}
