use std::{
    fs::Metadata,
    path::Path,
    time::{Duration, SystemTime},
};

use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    digest::{DigestHasher, COPY_BUFFER_SIZE},
    error::{Result, StoreError},
};

/// Create an anonymous-looking staging file in `dir`.
///
/// The returned [`TempPath`] removes the file when dropped, so an error or a
/// cancelled future never leaves a half-written file behind. Call
/// [`persist`] to move it to its final name.
pub(crate) async fn staging_file(dir: &Path) -> Result<(tokio::fs::File, TempPath)> {
    let owned = dir.to_path_buf();
    let created = tokio::task::spawn_blocking(move || {
        tempfile::Builder::new().prefix(".tmp-").tempfile_in(owned)
    })
    .await
    .map_err(|e| StoreError::io(std::io::Error::other(e), "create staging file", dir))?;
    let (file, path) = created
        .map_err(|e| StoreError::io(e, "create staging file", dir))?
        .into_parts();
    Ok((tokio::fs::File::from_std(file), path))
}

/// Atomically rename a staged file into place, replacing any existing file.
pub(crate) async fn persist(staged: TempPath, dest: &Path) -> Result<()> {
    let owned = dest.to_path_buf();
    tokio::task::spawn_blocking(move || staged.persist(owned))
        .await
        .map_err(|e| StoreError::io(std::io::Error::other(e), "rename", dest))?
        .map_err(|e| StoreError::io(e.error, "rename", dest))
}

/// Write `data` to `dest` through a staging file in `staging_dir`.
///
/// Readers observe either the old content or the new one, never a mix.
pub(crate) async fn write_atomic(staging_dir: &Path, dest: &Path, data: &[u8]) -> Result<()> {
    let (mut file, staged) = staging_file(staging_dir).await?;
    file.write_all(data)
        .await
        .map_err(|e| StoreError::io(e, "write", &staged))?;
    file.sync_all()
        .await
        .map_err(|e| StoreError::io(e, "sync", &staged))?;
    drop(file);
    persist(staged, dest).await
}

/// Copy `source` to `dest` until EOF, feeding the bytes to `hasher`.
///
/// Read failures are reported as [`StoreError::Stream`] (the client's side),
/// write failures as [`StoreError::Io`] against `dest_path`.
pub(crate) async fn copy_hashing(
    source: &mut (impl AsyncRead + Unpin),
    dest: &mut (impl AsyncWrite + Unpin),
    dest_path: &Path,
    mut hasher: Option<&mut DigestHasher>,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StoreError::Stream(e)),
        };
        dest.write_all(&buf[..n])
            .await
            .map_err(|e| StoreError::io(e, "write", dest_path))?;
        if let Some(hasher) = hasher.as_deref_mut() {
            hasher.update(&buf[..n]);
        }
        total += n as u64;
    }
    dest.flush()
        .await
        .map_err(|e| StoreError::io(e, "flush", dest_path))?;
    Ok(total)
}

/// How long ago the file was last modified. Clock skew reads as zero.
pub(crate) fn age(meta: &Metadata) -> Duration {
    meta.modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or_default()
}
