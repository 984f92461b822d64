//! Resumable chunked uploads.
//!
//! An upload session accumulates bytes in a receptacle file under
//! `_uploads/<id>/data` until the client finalizes it with the digest it
//! claims the content has. The session's state and offset are persisted in
//! `_uploads/<id>/state.json` after every successful append, so sessions
//! outlive the process that started them.
//!
//! ```text
//!   start ──► Started ──append──► Accumulating ──finalize──► Finalized
//!                │                    │  ▲
//!                │                    └──┘ append
//!                └───────────────┬────┘
//!                        stale sweep
//!                                ▼
//!                            Abandoned
//! ```
//!
//! Each session has its own async mutex, so appends to one session are
//! serialized while different sessions proceed in parallel. The session table
//! itself is only locked for lookups.

use std::{
    collections::HashMap,
    io::SeekFrom,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

use crate::{
    blob::{read_dir_names, BlobInfo, BlobStore},
    digest::{digest_reader, Algorithm, Digest, DigestHasher},
    error::{NotFoundFilter, Result, StoreError},
    layout::{Layout, Namespace, RepositoryName},
    util::{age, copy_hashing, write_atomic},
};

const DATA_FILE: &str = "data";
const STATE_FILE: &str = "state.json";

/// Lifecycle state of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    /// Created, nothing appended yet.
    Started,
    /// At least one append has completed.
    Accumulating {
        /// Number of bytes received so far.
        offset: u64,
    },
    /// Published into the blob store. Terminal.
    Finalized,
    /// Removed by the staleness sweep. Terminal.
    Abandoned,
}

impl SessionState {
    /// Bytes received so far, or `None` for a terminal state.
    pub fn offset(&self) -> Option<u64> {
        match self {
            Self::Started => Some(0),
            Self::Accumulating { offset } => Some(*offset),
            Self::Finalized | Self::Abandoned => None,
        }
    }
}

/// On-disk form of a session.
#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    repository: String,
    #[serde(flatten)]
    state: SessionState,
    /// Seconds since the Unix epoch.
    started_at: u64,
}

#[derive(Debug)]
struct Session {
    ns: Namespace,
    id: String,
    state: SessionState,
    started_at: u64,
    /// Running SHA-256 over the receptacle. Only live for sessions started by
    /// this process; reloaded sessions rehash on finalize.
    hasher: Option<DigestHasher>,
}

impl Session {
    fn dir(&self) -> PathBuf {
        self.ns.upload_dir(&self.id)
    }

    fn data_path(&self) -> PathBuf {
        self.dir().join(DATA_FILE)
    }

    fn unknown(&self) -> StoreError {
        upload_unknown(self.ns.name(), &self.id)
    }

    /// The current offset, failing for sessions that no longer accept data.
    fn open_offset(&self) -> Result<u64> {
        self.state.offset().ok_or_else(|| self.unknown())
    }

    async fn save(&self, state: SessionState) -> Result<()> {
        let record = SessionRecord {
            repository: self.ns.name().to_string(),
            state,
            started_at: self.started_at,
        };
        let dir = self.dir();
        write_atomic(&dir, &dir.join(STATE_FILE), &serde_json::to_vec(&record)?).await
    }
}

/// A session reclaimed (or, in a dry run, reclaimable) by the staleness sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleUpload {
    /// Session identifier.
    pub id: String,
    /// Bytes held by the receptacle.
    pub size: u64,
}

type SessionKey = (RepositoryName, String);

/// Tracks the upload sessions of every repository under one root.
#[derive(Debug)]
pub struct UploadManager {
    layout: Layout,
    blobs: BlobStore,
    sessions: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<Session>>>>,
}

impl UploadManager {
    /// An upload manager publishing into `blobs`.
    pub fn new(layout: Layout, blobs: BlobStore) -> Self {
        Self {
            layout,
            blobs,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new session with an empty receptacle.
    pub async fn start(&self, repo: &RepositoryName) -> Result<String> {
        let ns = self.layout.ensure(repo).await?;
        let id = Uuid::new_v4().to_string();
        let session = Session {
            ns,
            id: id.clone(),
            state: SessionState::Started,
            started_at: unix_now(),
            hasher: Some(Algorithm::Sha256.hasher()),
        };

        let dir = session.dir();
        tokio::fs::create_dir(&dir)
            .await
            .map_err(|e| StoreError::io(e, "create directory", &dir))?;
        let data = session.data_path();
        tokio::fs::File::create(&data)
            .await
            .map_err(|e| StoreError::io(e, "create", &data))?;
        session.save(session.state).await?;

        debug!("started upload {id} in {repo}");
        self.table()
            .insert((repo.clone(), id.clone()), Arc::new(tokio::sync::Mutex::new(session)));
        Ok(id)
    }

    /// Append everything `source` yields to the session.
    ///
    /// Either the whole source is appended or nothing is: on any failure the
    /// receptacle is truncated back and the offset stays where it was.
    /// Returns the new offset.
    pub async fn append(
        &self,
        repo: &RepositoryName,
        id: &str,
        source: &mut (impl AsyncRead + Unpin),
    ) -> Result<u64> {
        let handle = self.lookup(repo, id).await?;
        let mut session = handle.lock().await;
        let offset = session.open_offset()?;

        let data = session.data_path();
        let Some(mut file) = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&data)
            .await
            .filter_not_found()
            .map_err(|e| StoreError::io(e, "open", &data))?
        else {
            return Err(session.unknown());
        };
        // A cancelled append may have left bytes past the recorded offset.
        file.set_len(offset)
            .await
            .map_err(|e| StoreError::io(e, "truncate", &data))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| StoreError::io(e, "seek", &data))?;

        let mut hasher = session.hasher.clone();
        let written = match copy_hashing(source, &mut file, &data, hasher.as_mut()).await {
            Ok(written) => written,
            Err(e) => {
                rollback(&file, offset, &data).await;
                return Err(e);
            }
        };

        let new_offset = offset + written;
        let state = SessionState::Accumulating { offset: new_offset };
        if let Err(e) = session.save(state).await {
            rollback(&file, offset, &data).await;
            return Err(e);
        }
        session.state = state;
        session.hasher = hasher;
        trace!("upload {id} in {repo}: {written} bytes appended, offset {new_offset}");
        Ok(new_offset)
    }

    /// Bytes received so far.
    pub async fn status(&self, repo: &RepositoryName, id: &str) -> Result<u64> {
        let handle = self.lookup(repo, id).await?;
        let session = handle.lock().await;
        session.open_offset()
    }

    /// Verify the accumulated content against `claimed` and publish it.
    ///
    /// On a mismatch the session is left as it was so the client can retry.
    /// On success the session is gone.
    pub async fn finalize(
        &self,
        repo: &RepositoryName,
        id: &str,
        claimed: &Digest,
    ) -> Result<BlobInfo> {
        let handle = self.lookup(repo, id).await?;
        let mut session = handle.lock().await;
        let offset = session.open_offset()?;
        // Only the accepted bytes may be published.
        truncate_receptacle(&session.data_path(), offset).await?;

        let actual = match &session.hasher {
            Some(hasher) if hasher.algorithm() == claimed.algorithm() => hasher.clone().finalize(),
            _ => {
                let data = session.data_path();
                let file = tokio::fs::File::open(&data)
                    .await
                    .map_err(|e| StoreError::io(e, "open", &data))?;
                digest_reader(claimed.algorithm(), &mut file.take(offset))
                    .await
                    .map_err(|e| StoreError::io(e, "read", &data))?
                    .0
            }
        };
        if actual != *claimed {
            debug!("upload {id} in {repo}: expected {claimed}, got {actual}");
            return Err(StoreError::DigestMismatch {
                expected: claimed.clone(),
                actual,
            });
        }

        let info = self
            .blobs
            .publish(&session.ns, claimed, &session.data_path())
            .await?;
        session.state = SessionState::Finalized;
        session.hasher = None;
        self.table().remove(&(repo.clone(), id.to_string()));

        let dir = session.dir();
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            // The blob is published. Without its data file the leftover
            // state record no longer loads, and the staleness sweep removes it.
            warn!("failed to remove finished upload {}: {e}", dir.display());
        }
        debug!("finalized upload {id} in {repo} as {claimed}");
        Ok(info)
    }

    /// Remove sessions whose receptacle has not been written for longer
    /// than `threshold`.
    ///
    /// Sessions with an append in progress are skipped. Per-session failures
    /// are pushed onto `errors` and the sweep continues. With `dry_run` the
    /// sessions are only reported.
    pub async fn abandon_stale(
        &self,
        repo: &RepositoryName,
        threshold: Duration,
        dry_run: bool,
        errors: &mut Vec<StoreError>,
    ) -> Result<Vec<StaleUpload>> {
        let uploads = self.layout.namespace(repo).uploads_dir();
        let mut reclaimed = Vec::new();

        for id in read_dir_names(&uploads).await? {
            let dir = uploads.join(&id);
            if Uuid::parse_str(&id).is_err() {
                warn!("ignoring unexpected entry {}", dir.display());
                continue;
            }

            let (idle, size) = match receptacle_age(&dir).await {
                Ok(Some(found)) => found,
                Ok(None) => continue,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            if idle <= threshold {
                trace!("upload {id} in {repo} is still fresh");
                continue;
            }

            let stale = StaleUpload {
                id: id.clone(),
                size,
            };
            if dry_run {
                if !self.is_busy(repo, &id) {
                    reclaimed.push(stale);
                }
                continue;
            }

            let handle = match self.lookup(repo, &id).await {
                Ok(handle) => Some(handle),
                // Without a readable state record nobody can resume it.
                Err(e) if e.is_not_found() || matches!(e, StoreError::Json(_)) => None,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            let guard = match &handle {
                Some(handle) => match handle.try_lock() {
                    Ok(guard) => Some(guard),
                    Err(_) => {
                        debug!("upload {id} in {repo} is busy, keeping it");
                        continue;
                    }
                },
                None => None,
            };

            match tokio::fs::remove_dir_all(&dir).await.filter_not_found() {
                Ok(_) => {
                    if let Some(mut session) = guard {
                        session.state = SessionState::Abandoned;
                        session.hasher = None;
                    }
                    self.table().remove(&(repo.clone(), id.clone()));
                    debug!("abandoned stale upload {id} in {repo}");
                    reclaimed.push(stale);
                }
                Err(e) => errors.push(StoreError::io(e, "remove", &dir)),
            }
        }
        Ok(reclaimed)
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<SessionKey, Arc<tokio::sync::Mutex<Session>>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_busy(&self, repo: &RepositoryName, id: &str) -> bool {
        self.table()
            .get(&(repo.clone(), id.to_string()))
            .is_some_and(|handle| handle.try_lock().is_err())
    }

    /// Find a session, reloading it from disk if this process has not seen it.
    async fn lookup(
        &self,
        repo: &RepositoryName,
        id: &str,
    ) -> Result<Arc<tokio::sync::Mutex<Session>>> {
        // Ids come from clients; only canonical UUIDs can name a session.
        let canonical = Uuid::parse_str(id)
            .map(|uuid| uuid.hyphenated().to_string())
            .map_err(|_| upload_unknown(repo, id))?;
        if canonical != id {
            return Err(upload_unknown(repo, id));
        }

        let key = (repo.clone(), id.to_string());
        let cached = self.table().get(&key).cloned();
        if let Some(handle) = cached {
            return Ok(handle);
        }

        let session = self.load(repo, id).await?;
        let handle = self
            .table()
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(session)))
            .clone();
        Ok(handle)
    }

    async fn load(&self, repo: &RepositoryName, id: &str) -> Result<Session> {
        let ns = self.layout.namespace(repo);
        let dir = ns.upload_dir(id);
        let state_path = dir.join(STATE_FILE);
        let Some(raw) = tokio::fs::read(&state_path)
            .await
            .filter_not_found()
            .map_err(|e| StoreError::io(e, "read", &state_path))?
        else {
            return Err(upload_unknown(repo, id));
        };
        let record: SessionRecord = serde_json::from_slice(&raw)?;
        let Some(offset) = record.state.offset() else {
            return Err(upload_unknown(repo, id));
        };
        if record.repository != repo.as_str() {
            warn!(
                "upload {id} records repository {:?}, found under {repo}",
                record.repository
            );
            return Err(upload_unknown(repo, id));
        }

        let data = dir.join(DATA_FILE);
        let Some(meta) = tokio::fs::metadata(&data)
            .await
            .filter_not_found()
            .map_err(|e| StoreError::io(e, "stat", &data))?
        else {
            return Err(upload_unknown(repo, id));
        };
        let mut state = record.state;
        if meta.len() > offset {
            // A crash between writing data and recording the new offset.
            debug!(
                "upload {id} in {repo}: truncating receptacle from {} to {offset}",
                meta.len()
            );
            truncate_receptacle(&data, offset).await?;
        } else if meta.len() < offset {
            warn!(
                "upload {id} in {repo}: receptacle holds {} bytes, record says {offset}",
                meta.len()
            );
            state = SessionState::Accumulating { offset: meta.len() };
        }

        trace!("reloaded upload {id} in {repo} at offset {}", meta.len().min(offset));
        Ok(Session {
            ns,
            id: id.to_string(),
            state,
            started_at: record.started_at,
            hasher: None,
        })
    }
}

fn upload_unknown(repo: &RepositoryName, id: &str) -> StoreError {
    StoreError::UploadUnknown {
        repository: repo.to_string(),
        id: id.to_string(),
    }
}

async fn truncate_receptacle(data: &std::path::Path, offset: u64) -> Result<()> {
    let Some(file) = tokio::fs::OpenOptions::new()
        .write(true)
        .open(data)
        .await
        .filter_not_found()
        .map_err(|e| StoreError::io(e, "open", data))?
    else {
        return Ok(());
    };
    let len = file
        .metadata()
        .await
        .map_err(|e| StoreError::io(e, "stat", data))?
        .len();
    if len <= offset {
        return Ok(());
    }
    file.set_len(offset)
        .await
        .map_err(|e| StoreError::io(e, "truncate", data))
}

async fn rollback(file: &tokio::fs::File, offset: u64, data: &std::path::Path) {
    if let Err(e) = file.set_len(offset).await {
        warn!(
            "failed to truncate {} back to {offset} bytes: {e}",
            data.display()
        );
    }
}

/// Idle time and size of a session's receptacle. Falls back to the session
/// directory when the data file is gone. `None` if the session vanished.
async fn receptacle_age(dir: &std::path::Path) -> Result<Option<(Duration, u64)>> {
    let data = dir.join(DATA_FILE);
    if let Some(meta) = tokio::fs::metadata(&data)
        .await
        .filter_not_found()
        .map_err(|e| StoreError::io(e, "stat", &data))?
    {
        return Ok(Some((age(&meta), meta.len())));
    }
    Ok(tokio::fs::metadata(dir)
        .await
        .filter_not_found()
        .map_err(|e| StoreError::io(e, "stat", dir))?
        .map(|meta| (age(&meta), 0)))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
