//! Managed file objects: the readable form of a decoded pointer.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use lfs_api::error::TransferError;
use thiserror::Error;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
use tracing::debug;

use crate::pointer::{AnnexKey, Pointer};
use crate::remotes::Endpoint;

/// Errors surfaced by managed reads and opens.
#[derive(Debug, Error)]
pub enum ObjectIoError {
    #[error("no working batch endpoint")]
    NoEndpoint,

    #[error("every candidate endpoint failed: {0}")]
    Exhausted(String),

    #[error("batch exchange was malformed: {0}")]
    Protocol(String),

    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A terminal resolution failure, recorded on the object so every
/// subsequent open fails the same way instead of retrying.
#[derive(Debug, Clone)]
pub enum ObjectFailure {
    NoEndpoint,
    Exhausted(String),
    Protocol(String),
}

impl From<ObjectFailure> for ObjectIoError {
    fn from(failure: ObjectFailure) -> Self {
        match failure {
            ObjectFailure::NoEndpoint => Self::NoEndpoint,
            ObjectFailure::Exhausted(details) => Self::Exhausted(details),
            ObjectFailure::Protocol(details) => Self::Protocol(details),
        }
    }
}

/// A granted download location for one object.
#[derive(Debug, Clone)]
pub struct AccessUrl {
    pub href: String,
    pub headers: HashMap<String, String>,
    /// Absent means the grant never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessUrl {
    /// Whether the grant is still usable at `now`.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expiry| expiry > now)
    }
}

/// What a remote object needs from the fetch machinery: a way to get
/// itself a fresh access URL, and a way to download a byte range.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Enqueue the object for URL resolution and wait until the
    /// resolution round carrying it completes.
    async fn request_resolution(&self, object: Arc<RemoteLargeFile>);

    /// Ranged download against a granted URL.
    async fn read_range(
        &self,
        access: &AccessUrl,
        offset: u64,
        len: u32,
    ) -> Result<Bytes, TransferError>;
}

/// Mutable resolution state of a remote object.
#[derive(Debug, Default)]
struct RemoteState {
    access: Option<AccessUrl>,
    /// `None` until the first resolution round adopts the discovered
    /// endpoint set. Endpoints are removed as they fail this object.
    candidates: Option<Vec<Arc<Endpoint>>>,
    endpoint_errors: Vec<(String, String)>,
    failed: Option<ObjectFailure>,
}

/// A file whose content lives in a local object cache or behind a
/// time-limited download URL.
///
/// One instance exists per distinct oid per repository; duplicate
/// pointer paths share it, its cache entry, and its resolution state.
pub struct RemoteLargeFile {
    pointer: Pointer,
    cache_path: PathBuf,
    source: Arc<dyn RemoteSource>,
    /// Handed to the coordinator when this object enqueues itself.
    self_ref: Weak<Self>,
    state: parking_lot::Mutex<RemoteState>,
    /// Descriptor for cache reads, opened once. The lock also
    /// serializes seek+read pairs between concurrent readers.
    local: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl RemoteLargeFile {
    pub fn new(pointer: Pointer, control_dir: &Path, source: Arc<dyn RemoteSource>) -> Arc<Self> {
        let cache_path = cache_path_for(control_dir, &pointer.oid);
        Arc::new_cyclic(|self_ref| Self {
            pointer,
            cache_path,
            source,
            self_ref: self_ref.clone(),
            state: parking_lot::Mutex::new(RemoteState::default()),
            local: tokio::sync::Mutex::new(None),
        })
    }

    #[must_use]
    pub fn pointer(&self) -> &Pointer {
        &self.pointer
    }

    /// Authoritative content size; overrides whatever the stub's stat says.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.pointer.size
    }

    /// Deterministic local cache location, derived from the digest alone.
    #[must_use]
    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Prepare the object for reading.
    ///
    /// Locally cached objects need nothing. Otherwise this blocks the
    /// caller until a non-expired access URL is granted or resolution
    /// fails terminally; this is the only network-bound wait a reader
    /// can hit.
    pub async fn open(&self) -> Result<(), ObjectIoError> {
        if tokio::fs::try_exists(&self.cache_path).await.unwrap_or(false) {
            return Ok(());
        }
        self.ensure_access().await.map(|_| ())
    }

    /// Read `size` bytes at `offset`.
    ///
    /// Cached objects are read from disk. Everything else is one
    /// authenticated range request; the bytes are not written back to
    /// the cache here.
    pub async fn read(&self, size: u32, offset: u64) -> Result<Bytes, ObjectIoError> {
        {
            let mut local = self.local.lock().await;
            if local.is_none()
                && tokio::fs::try_exists(&self.cache_path).await.unwrap_or(false)
            {
                *local = Some(tokio::fs::File::open(&self.cache_path).await?);
            }
            if let Some(file) = local.as_mut() {
                return Ok(read_at(file, size, offset).await?);
            }
        }

        let access = self.ensure_access().await?;
        Ok(self.source.read_range(&access, offset, size).await?)
    }

    /// Drop the cached descriptor.
    pub async fn close(&self) {
        *self.local.lock().await = None;
    }

    /// The check-expiry, await-resolution, recheck loop.
    ///
    /// Terminates on a fresh grant or a terminal failure: every
    /// resolution round either grants a URL, shrinks the candidate
    /// set, or records a failure.
    async fn ensure_access(&self) -> Result<AccessUrl, ObjectIoError> {
        loop {
            {
                let state = self.state.lock();
                if let Some(failure) = &state.failed {
                    return Err(failure.clone().into());
                }
                if let Some(access) = &state.access {
                    if access.is_fresh(Utc::now()) {
                        return Ok(access.clone());
                    }
                }
            }
            let this = self
                .self_ref
                .upgrade()
                .unwrap_or_else(|| unreachable!("object is alive while resolving"));
            debug!(oid = %self.pointer.oid, "awaiting access url resolution");
            self.source.request_resolution(this).await;
        }
    }

    /// Whether the current grant is usable right now.
    #[must_use]
    pub fn has_fresh_access(&self) -> bool {
        self.state
            .lock()
            .access
            .as_ref()
            .is_some_and(|access| access.is_fresh(Utc::now()))
    }

    /// Candidate endpoints still in play for this object.
    #[must_use]
    pub fn candidates(&self) -> Vec<Arc<Endpoint>> {
        self.state.lock().candidates.clone().unwrap_or_default()
    }

    /// Adopt the discovered endpoint set, if this object has none yet.
    pub fn init_candidates(&self, endpoints: &[Arc<Endpoint>]) {
        let mut state = self.state.lock();
        if state.candidates.is_none() {
            state.candidates = Some(endpoints.to_vec());
        }
    }

    /// Record a grant.
    pub fn set_access(&self, access: AccessUrl) {
        self.state.lock().access = Some(access);
    }

    /// Drop `endpoint_url` as a candidate and record why. Returns the
    /// number of candidates left; at zero the caller marks the object
    /// exhausted.
    pub fn remove_candidate(&self, endpoint_url: &str, error: String) -> usize {
        let mut state = self.state.lock();
        state
            .endpoint_errors
            .push((endpoint_url.to_owned(), error));
        if let Some(candidates) = state.candidates.as_mut() {
            candidates.retain(|endpoint| endpoint.url != endpoint_url);
            candidates.len()
        } else {
            0
        }
    }

    /// Mark the object terminally failed.
    pub fn fail(&self, failure: ObjectFailure) {
        self.state.lock().failed = Some(failure);
    }

    /// Mark the object failed because every candidate was tried.
    pub fn fail_exhausted(&self) {
        let mut state = self.state.lock();
        let details = state
            .endpoint_errors
            .iter()
            .map(|(url, error)| format!("{url}: {error}"))
            .collect::<Vec<_>>()
            .join("; ");
        state.failed = Some(ObjectFailure::Exhausted(details));
    }

    #[must_use]
    pub fn failure(&self) -> Option<ObjectFailure> {
        self.state.lock().failed.clone()
    }
}

/// Cache location for a digest: two levels of two-hex-char sharding
/// under the control directory.
#[must_use]
pub fn cache_path_for(control_dir: &Path, oid: &str) -> PathBuf {
    let objects = control_dir.join("lfs").join("objects");
    if oid.len() >= 4 {
        objects.join(&oid[..2]).join(&oid[2..4]).join(oid)
    } else {
        objects.join(oid)
    }
}

/// A file whose content already sits in the local object store,
/// addressed through a symlink. Never enters the remote fetch path.
pub struct LocalKeyedFile {
    key: AnnexKey,
    object_path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl LocalKeyedFile {
    pub fn new(key: AnnexKey, object_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            key,
            object_path,
            file: tokio::sync::Mutex::new(None),
        })
    }

    #[must_use]
    pub fn key(&self) -> &AnnexKey {
        &self.key
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.key.size
    }

    /// The resolved real object path behind the symlink.
    #[must_use]
    pub fn object_path(&self) -> &Path {
        &self.object_path
    }

    pub async fn open(&self) -> Result<(), ObjectIoError> {
        if tokio::fs::try_exists(&self.object_path).await? {
            Ok(())
        } else {
            Err(ObjectIoError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("object content missing: {}", self.object_path.display()),
            )))
        }
    }

    pub async fn read(&self, size: u32, offset: u64) -> Result<Bytes, ObjectIoError> {
        let mut file = self.file.lock().await;
        if file.is_none() {
            *file = Some(tokio::fs::File::open(&self.object_path).await?);
        }
        let file = file
            .as_mut()
            .unwrap_or_else(|| unreachable!("descriptor was just opened"));
        Ok(read_at(file, size, offset).await?)
    }

    pub async fn close(&self) {
        *self.file.lock().await = None;
    }
}

/// The capability surface the filesystem layer sees, polymorphic over
/// the backend kinds.
pub enum ManagedFile {
    Remote(Arc<RemoteLargeFile>),
    LocalKeyed(Arc<LocalKeyedFile>),
}

impl ManagedFile {
    /// Authoritative content size.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::Remote(file) => file.size(),
            Self::LocalKeyed(file) => file.size(),
        }
    }

    /// Hex content digest.
    #[must_use]
    pub fn oid(&self) -> &str {
        match self {
            Self::Remote(file) => &file.pointer().oid,
            Self::LocalKeyed(file) => &file.key().oid,
        }
    }

    /// Digest algorithm as spelled by the stub.
    #[must_use]
    pub fn hash_algo(&self) -> &str {
        match self {
            Self::Remote(file) => &file.pointer().hash_algo,
            Self::LocalKeyed(file) => &file.key().hash_algo,
        }
    }

    pub async fn open(&self) -> Result<(), ObjectIoError> {
        match self {
            Self::Remote(file) => file.open().await,
            Self::LocalKeyed(file) => file.open().await,
        }
    }

    pub async fn read(&self, size: u32, offset: u64) -> Result<Bytes, ObjectIoError> {
        match self {
            Self::Remote(file) => file.read(size, offset).await,
            Self::LocalKeyed(file) => file.read(size, offset).await,
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Remote(file) => file.close().await,
            Self::LocalKeyed(file) => file.close().await,
        }
    }
}

/// Resolve a symlink target against the link's own location:
/// absolute targets pass through, relative ones are joined onto the
/// link's parent directory and lexically normalized.
#[must_use]
pub fn resolve_link_target(link_path: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        return target.to_path_buf();
    }

    let base = link_path.parent().unwrap_or_else(|| Path::new(""));
    let mut resolved = PathBuf::from(base);
    for component in target.components() {
        match component {
            Component::ParentDir => {
                resolved.pop();
            }
            Component::CurDir => {}
            other => resolved.push(other),
        }
    }
    resolved
}

/// Seek and read under the caller's per-object lock. Short reads past
/// the end of the file return the bytes that exist.
async fn read_at(
    file: &mut tokio::fs::File,
    size: u32,
    offset: u64,
) -> std::io::Result<Bytes> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; size as usize];
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_path_shards_by_digest_prefix() {
        let path = cache_path_for(Path::new("/repo/.git"), "deadbeef");
        assert_eq!(
            path,
            Path::new("/repo/.git/lfs/objects/de/ad/deadbeef")
        );
    }

    #[test]
    fn access_url_without_expiry_never_goes_stale() {
        let access = AccessUrl {
            href: "https://cdn.example.com/x".to_owned(),
            headers: HashMap::new(),
            expires_at: None,
        };
        assert!(access.is_fresh(Utc::now()));
    }

    #[test]
    fn access_url_with_past_expiry_is_stale() {
        let access = AccessUrl {
            href: "https://cdn.example.com/x".to_owned(),
            headers: HashMap::new(),
            expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
        };
        assert!(!access.is_fresh(Utc::now()));
    }

    #[test]
    fn relative_link_targets_resolve_against_the_link_directory() {
        let resolved = resolve_link_target(
            Path::new("/repo/data/big.bin"),
            Path::new("../.git/annex/objects/ab/cd/SHA256-s1--ff"),
        );
        assert_eq!(
            resolved,
            Path::new("/repo/.git/annex/objects/ab/cd/SHA256-s1--ff")
        );
    }

    #[test]
    fn absolute_link_targets_pass_through() {
        let resolved = resolve_link_target(
            Path::new("/repo/big.bin"),
            Path::new("/srv/objects/ff"),
        );
        assert_eq!(resolved, Path::new("/srv/objects/ff"));
    }
}
