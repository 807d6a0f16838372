//! Path-to-managed-object dispatch.
//!
//! Tries each recognizer in a fixed priority order and memoizes the
//! result by content digest, so concurrent resolutions of the same
//! content share one object and one cache entry.

use std::fs::Metadata;
use std::path::Path;
use std::sync::Arc;

use scc::HashMap as ConcurrentHashMap;
use tracing::debug;

use crate::object::{
    LocalKeyedFile, ManagedFile, RemoteLargeFile, RemoteSource, resolve_link_target,
};
use crate::pointer::{AnnexKey, MAX_POINTER_SIZE, Pointer};
use crate::repo::RepoSnapshot;

/// Resolves working-tree paths to managed objects.
pub struct Resolver {
    repo: RepoSnapshot,
    source: Arc<dyn RemoteSource>,
    by_oid: ConcurrentHashMap<String, Arc<ManagedFile>>,
}

impl Resolver {
    pub fn new(repo: RepoSnapshot, source: Arc<dyn RemoteSource>) -> Self {
        Self {
            repo,
            source,
            by_oid: ConcurrentHashMap::new(),
        }
    }

    #[must_use]
    pub fn repo(&self) -> &RepoSnapshot {
        &self.repo
    }

    /// Resolve a path to its managed object, if any.
    ///
    /// Paths under the control directory are never virtualized. The
    /// pointer-file recognizer runs before the symlink recognizer;
    /// the first match wins. Anything unrecognized is `None` and gets
    /// served as a plain file.
    #[must_use]
    pub fn resolve(&self, path: &Path, meta: &Metadata) -> Option<Arc<ManagedFile>> {
        if path.starts_with(self.repo.control_dir()) {
            return None;
        }
        self.resolve_pointer_file(path, meta)
            .or_else(|| self.resolve_keyed_symlink(path, meta))
    }

    fn resolve_pointer_file(&self, path: &Path, meta: &Metadata) -> Option<Arc<ManagedFile>> {
        if !meta.is_file() || meta.len() == 0 || meta.len() > MAX_POINTER_SIZE {
            return None;
        }
        let bytes = std::fs::read(path).ok()?;
        let pointer = Pointer::decode(&bytes)?;
        debug!(path = %path.display(), oid = %pointer.oid, "recognized pointer file");

        let oid = pointer.oid.clone();
        Some(self.memoized(oid, || {
            ManagedFile::Remote(RemoteLargeFile::new(
                pointer,
                self.repo.control_dir(),
                Arc::clone(&self.source),
            ))
        }))
    }

    fn resolve_keyed_symlink(&self, path: &Path, meta: &Metadata) -> Option<Arc<ManagedFile>> {
        if !meta.file_type().is_symlink() {
            return None;
        }
        let target = std::fs::read_link(path).ok()?;
        let key = AnnexKey::decode_link_target(target.to_str()?)?;
        debug!(path = %path.display(), oid = %key.oid, "recognized keyed symlink");

        let object_path = resolve_link_target(path, &target);
        let oid = key.oid.clone();
        Some(self.memoized(oid, || {
            ManagedFile::LocalKeyed(LocalKeyedFile::new(key, object_path))
        }))
    }

    /// Get-or-insert under the map's entry lock, so racing resolvers
    /// of one digest end up with the same `Arc`.
    fn memoized(
        &self,
        oid: String,
        build: impl FnOnce() -> ManagedFile,
    ) -> Arc<ManagedFile> {
        match self.by_oid.entry_sync(oid) {
            scc::hash_map::Entry::Occupied(entry) => Arc::clone(entry.get()),
            scc::hash_map::Entry::Vacant(entry) => {
                let object = Arc::new(build());
                entry.insert_entry(Arc::clone(&object));
                object
            }
        }
    }
}
