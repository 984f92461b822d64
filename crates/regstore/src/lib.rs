//! Storage engine for an OCI / Docker distribution registry.
//!
//! This library keeps the persistent state a distribution endpoint serves:
//! content-addressed blobs, manifests addressed by tag and digest, resumable
//! chunked uploads, and a garbage collector that reclaims blobs no manifest
//! references anymore. HTTP routing is left to the caller; every protocol
//! operation maps onto one method of [`Registry`].
//!
//! # Example
//!
//! ```no_run
//! use regstore::{Registry, StoreConfig};
//!
//! # async fn example() -> regstore::Result<()> {
//! let registry = Registry::open(StoreConfig::new("/var/lib/regstore"))?;
//!
//! let upload = registry.start_upload("library/hello").await?;
//! registry.append_chunk("library/hello", &upload.id, &mut &b"hello "[..]).await?;
//! registry.append_chunk("library/hello", &upload.id, &mut &b"world"[..]).await?;
//! let digest = registry
//!     .finalize_upload(
//!         "library/hello",
//!         &upload.id,
//!         "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
//!     )
//!     .await?;
//! println!("stored {digest}");
//! # Ok(())
//! # }
//! ```
//!
//! # Storage layout
//!
//! See [`layout`] for the directory structure under the storage root.

pub mod blob;
pub mod catalog;
pub mod config;
pub mod digest;
pub mod error;
pub mod gc;
pub mod layout;
pub mod manifest;
pub mod registry;
pub mod upload;

mod util;

#[cfg(any(test, feature = "test"))]
pub mod test;

pub use blob::{BlobInfo, BlobReader};
pub use catalog::TagList;
pub use config::StoreConfig;
pub use digest::{Algorithm, Digest};
pub use error::{Result, StoreError};
pub use gc::{GcOptions, GcReport, GcTarget, Reclaimed};
pub use layout::{Reference, RepositoryName};
pub use manifest::Manifest;
pub use registry::{ApiVersion, Registry, UploadStarted};
