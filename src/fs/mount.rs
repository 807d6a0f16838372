//! Pass-through FUSE filesystem that serves pointer stubs as their
//! full content.
//!
//! Every path is backed by the real working tree. Paths the resolver
//! recognizes get their size overridden and their reads routed
//! through the managed object; everything else is plain pass-through
//! against the host filesystem.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FUSE_ROOT_ID, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyXattr, Request,
};
use lfs_api::{LfsClient, ReqwestClient};
use tracing::{debug, instrument, warn};

use pointer_fs::coordinator::FetchCoordinator;
use pointer_fs::credentials::CredentialResolver;
use pointer_fs::handles::{HandleTable, MANAGED_HANDLE_BASE, is_managed};
use pointer_fs::object::{ManagedFile, ObjectIoError, RemoteSource};
use pointer_fs::remotes::RemoteRegistry;
use pointer_fs::repo::RepoSnapshot;
use pointer_fs::resolver::Resolver;

/// Attribute TTL handed to the kernel. Short, because the working
/// tree can change underneath us at any time.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Xattr namespace under which managed metadata is exposed.
const XATTR_PREFIX: &str = "user.";

struct InodeEntry {
    rc: u64,
    path: PathBuf,
}

struct FsInner {
    resolver: Resolver,
    inodes: scc::HashMap<u64, InodeEntry>,
    managed: HandleTable<ManagedFile>,
    native: scc::HashMap<u64, Arc<tokio::sync::Mutex<tokio::fs::File>>>,
    next_native_fh: AtomicU64,
}

impl FsInner {
    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.read_sync(&ino, |_, entry| entry.path.clone())
    }

    /// Remember a looked-up inode, bumping the kernel's reference count.
    fn remember(&self, ino: u64, path: PathBuf) {
        match self.inodes.entry_sync(ino) {
            scc::hash_map::Entry::Occupied(mut entry) => entry.get_mut().rc += 1,
            scc::hash_map::Entry::Vacant(entry) => {
                entry.insert_entry(InodeEntry { rc: 1, path });
            }
        }
    }
}

/// The mountable filesystem.
pub struct PointerFs {
    rt: tokio::runtime::Runtime,
    inner: Arc<FsInner>,
}

impl PointerFs {
    /// Build the filesystem stack for one repository.
    pub fn new(repo: RepoSnapshot, http_timeout: Duration) -> std::io::Result<Self> {
        let rt = tokio::runtime::Runtime::new()?;

        let client = Arc::new(LfsClient::new(http_timeout));
        let credentials = CredentialResolver::from_default_locations();
        let registry = Arc::new(RemoteRegistry::new(
            Arc::clone(&client),
            credentials,
            repo.remotes().to_vec(),
        ));
        let coordinator: Arc<dyn RemoteSource> = FetchCoordinator::new(client, registry);

        let workdir = repo.workdir().to_path_buf();
        let inner = Arc::new(FsInner {
            resolver: Resolver::new(repo, coordinator),
            inodes: scc::HashMap::new(),
            managed: HandleTable::new(),
            native: scc::HashMap::new(),
            next_native_fh: AtomicU64::new(1),
        });
        let _ = inner.inodes.insert_sync(
            FUSE_ROOT_ID,
            InodeEntry {
                rc: 1,
                path: workdir,
            },
        );

        Ok(Self { rt, inner })
    }
}

fn io_errno(error: &std::io::Error) -> i32 {
    error.raw_os_error().unwrap_or(libc::EIO)
}

fn object_errno(error: &ObjectIoError) -> i32 {
    match error {
        ObjectIoError::Io(io) => io_errno(io),
        ObjectIoError::NoEndpoint
        | ObjectIoError::Exhausted(_)
        | ObjectIoError::Protocol(_)
        | ObjectIoError::Transfer(_) => libc::EIO,
    }
}

fn kind_of(file_type: std::fs::FileType) -> fuser::FileType {
    use std::os::unix::fs::FileTypeExt as _;

    if file_type.is_file() {
        fuser::FileType::RegularFile
    } else if file_type.is_dir() {
        fuser::FileType::Directory
    } else if file_type.is_symlink() {
        fuser::FileType::Symlink
    } else if file_type.is_char_device() {
        fuser::FileType::CharDevice
    } else if file_type.is_block_device() {
        fuser::FileType::BlockDevice
    } else if file_type.is_fifo() {
        fuser::FileType::NamedPipe
    } else {
        fuser::FileType::Socket
    }
}

/// Translate metadata into FUSE attributes, reporting `ino` to the
/// kernel and `size_override` in place of the on-disk size.
fn attr_from_metadata(
    ino: u64,
    meta: &std::fs::Metadata,
    size_override: Option<u64>,
) -> fuser::FileAttr {
    use std::os::unix::fs::MetadataExt as _;

    fn to_systime(secs: i64, nsecs: i64) -> SystemTime {
        if secs >= 0 {
            UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
        } else {
            UNIX_EPOCH - Duration::from_secs((-secs) as u64) + Duration::from_nanos(nsecs as u64)
        }
    }

    let size = size_override.unwrap_or(meta.len());
    fuser::FileAttr {
        ino,
        size,
        blocks: meta.blocks(),
        atime: to_systime(meta.atime(), meta.atime_nsec()),
        mtime: to_systime(meta.mtime(), meta.mtime_nsec()),
        ctime: to_systime(meta.ctime(), meta.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind: kind_of(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

/// Rewrite `target` relative to `base`, hopping up with `..` where
/// the paths diverge. Both paths must be absolute.
fn relative_to(target: &Path, base: &Path) -> PathBuf {
    let target_components: Vec<Component> = target.components().collect();
    let base_components: Vec<Component> = base.components().collect();

    let common = target_components
        .iter()
        .zip(base_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base_components.len() {
        relative.push("..");
    }
    for component in &target_components[common..] {
        relative.push(component);
    }
    relative
}

impl Filesystem for PointerFs {
    #[instrument(name = "PointerFs::lookup", skip(self, _req, reply))]
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let inner = Arc::clone(&self.inner);
        let name = name.to_owned();
        self.rt.spawn(async move {
            let Some(parent_path) = inner.path_of(parent) else {
                reply.error(libc::ENOENT);
                return;
            };
            let path = parent_path.join(&name);

            let meta = match tokio::fs::symlink_metadata(&path).await {
                Ok(meta) => meta,
                Err(error) => {
                    reply.error(io_errno(&error));
                    return;
                }
            };

            let size_override = inner
                .resolver
                .resolve(&path, &meta)
                .map(|object| object.size());

            let ino = {
                use std::os::unix::fs::MetadataExt as _;
                meta.ino()
            };
            inner.remember(ino, path);
            reply.entry(&ATTR_TTL, &attr_from_metadata(ino, &meta, size_override), 0);
        });
    }

    #[instrument(name = "PointerFs::getattr", skip(self, _req, reply))]
    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let inner = Arc::clone(&self.inner);
        self.rt.spawn(async move {
            let Some(path) = inner.path_of(ino) else {
                reply.error(libc::ENOENT);
                return;
            };

            let meta = match tokio::fs::symlink_metadata(&path).await {
                Ok(meta) => meta,
                Err(error) => {
                    reply.error(io_errno(&error));
                    return;
                }
            };

            // An open managed handle answers without re-resolving.
            let size_override = match fh.filter(|fh| is_managed(*fh)) {
                Some(fh) => inner.managed.lookup(fh).map(|object| object.size()),
                None => None,
            }
            .or_else(|| {
                inner
                    .resolver
                    .resolve(&path, &meta)
                    .map(|object| object.size())
            });

            reply.attr(&ATTR_TTL, &attr_from_metadata(ino, &meta, size_override));
        });
    }

    #[instrument(name = "PointerFs::readlink", skip(self, _req, reply))]
    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let inner = Arc::clone(&self.inner);
        self.rt.spawn(async move {
            let Some(path) = inner.path_of(ino) else {
                reply.error(libc::ENOENT);
                return;
            };

            match tokio::fs::read_link(&path).await {
                Ok(target) => {
                    // Absolute targets would escape the mount; report
                    // them relative to the virtualized root instead.
                    if target.is_absolute() {
                        let rewritten =
                            relative_to(&target, inner.resolver.repo().workdir());
                        reply.data(rewritten.as_os_str().as_bytes());
                    } else {
                        reply.data(target.as_os_str().as_bytes());
                    }
                }
                Err(error) => reply.error(io_errno(&error)),
            }
        });
    }

    #[instrument(name = "PointerFs::open", skip(self, _req, reply))]
    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let inner = Arc::clone(&self.inner);
        self.rt.spawn(async move {
            if flags & libc::O_ACCMODE != libc::O_RDONLY {
                reply.error(libc::EROFS);
                return;
            }

            let Some(path) = inner.path_of(ino) else {
                reply.error(libc::ENOENT);
                return;
            };

            let meta = match tokio::fs::symlink_metadata(&path).await {
                Ok(meta) => meta,
                Err(error) => {
                    reply.error(io_errno(&error));
                    return;
                }
            };

            if let Some(object) = inner.resolver.resolve(&path, &meta) {
                // May block on URL resolution; that is the contract of
                // opening a managed file.
                if let Err(error) = object.open().await {
                    warn!(path = %path.display(), %error, "managed open failed");
                    reply.error(object_errno(&error));
                    return;
                }
                let fh = inner.managed.allocate(object);
                debug!(fh, "opened managed file");
                reply.opened(fh, 0);
                return;
            }

            match tokio::fs::File::open(&path).await {
                Ok(file) => {
                    let fh = inner.next_native_fh.fetch_add(1, Ordering::Relaxed);
                    debug_assert!(fh < MANAGED_HANDLE_BASE, "native handle space overflow");
                    let _ = inner
                        .native
                        .insert_sync(fh, Arc::new(tokio::sync::Mutex::new(file)));
                    reply.opened(fh, 0);
                }
                Err(error) => reply.error(io_errno(&error)),
            }
        });
    }

    #[instrument(
        name = "PointerFs::read",
        skip(self, _req, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let inner = Arc::clone(&self.inner);
        self.rt.spawn(async move {
            let offset = offset.max(0) as u64;

            if is_managed(fh) {
                let Some(object) = inner.managed.lookup(fh) else {
                    reply.error(libc::EBADF);
                    return;
                };
                match object.read(size, offset).await {
                    Ok(data) => reply.data(&data),
                    Err(error) => {
                        warn!(fh, %error, "managed read failed");
                        reply.error(object_errno(&error));
                    }
                }
                return;
            }

            let Some(file) = inner.native.read_sync(&fh, |_, file| Arc::clone(file)) else {
                reply.error(libc::EBADF);
                return;
            };

            // The lock pairs the seek with its read.
            let mut file = file.lock().await;
            use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
            if let Err(error) = file.seek(std::io::SeekFrom::Start(offset)).await {
                reply.error(io_errno(&error));
                return;
            }
            let mut buf = vec![0u8; size as usize];
            let mut filled = 0usize;
            loop {
                match file.read(&mut buf[filled..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        filled += n;
                        if filled == buf.len() {
                            break;
                        }
                    }
                    Err(error) => {
                        reply.error(io_errno(&error));
                        return;
                    }
                }
            }
            buf.truncate(filled);
            reply.data(&buf);
        });
    }

    #[instrument(name = "PointerFs::release", skip(self, _req, _flags, _lock_owner, _flush, reply))]
    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let inner = Arc::clone(&self.inner);
        self.rt.spawn(async move {
            if is_managed(fh) {
                match inner.managed.release(fh) {
                    Ok(object) => {
                        object.close().await;
                        reply.ok();
                    }
                    Err(error) => {
                        warn!(fh, %error, "release of invalid managed handle");
                        reply.error(libc::EBADF);
                    }
                }
            } else if inner.native.remove_sync(&fh).is_some() {
                reply.ok();
            } else {
                reply.error(libc::EBADF);
            }
        });
    }

    #[instrument(name = "PointerFs::readdir", skip(self, _req, _fh, reply))]
    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let inner = Arc::clone(&self.inner);
        self.rt.spawn(async move {
            use std::os::unix::fs::MetadataExt as _;

            let Some(path) = inner.path_of(ino) else {
                reply.error(libc::ENOENT);
                return;
            };

            let workdir = inner.resolver.repo().workdir();
            let parent_ino = if path == workdir {
                FUSE_ROOT_ID
            } else {
                match path.parent() {
                    Some(parent) if parent == workdir => FUSE_ROOT_ID,
                    Some(parent) => match tokio::fs::symlink_metadata(parent).await {
                        Ok(meta) => meta.ino(),
                        Err(_) => FUSE_ROOT_ID,
                    },
                    None => FUSE_ROOT_ID,
                }
            };

            let mut read_dir = match tokio::fs::read_dir(&path).await {
                Ok(read_dir) => read_dir,
                Err(error) => {
                    reply.error(io_errno(&error));
                    return;
                }
            };

            let mut entries: Vec<(u64, fuser::FileType, std::ffi::OsString)> = vec![
                (ino, fuser::FileType::Directory, ".".into()),
                (parent_ino, fuser::FileType::Directory, "..".into()),
            ];
            loop {
                match read_dir.next_entry().await {
                    Ok(Some(entry)) => {
                        let kind = match entry.file_type().await {
                            Ok(file_type) => kind_of(file_type),
                            Err(_) => continue,
                        };
                        entries.push((entry.ino(), kind, entry.file_name()));
                    }
                    Ok(None) => break,
                    Err(error) => {
                        reply.error(io_errno(&error));
                        return;
                    }
                }
            }

            let offset = offset.max(0) as usize;
            for (index, (entry_ino, kind, name)) in entries.iter().enumerate().skip(offset) {
                if reply.add(*entry_ino, (index + 1) as i64, *kind, name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    #[instrument(name = "PointerFs::forget", skip(self, _req))]
    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        if ino == FUSE_ROOT_ID {
            return;
        }
        let mut drop_entry = false;
        let _ = self.inner.inodes.update_sync(&ino, |_, entry| {
            if entry.rc <= nlookup {
                drop_entry = true;
            } else {
                entry.rc -= nlookup;
            }
        });
        if drop_entry {
            let _ = self.inner.inodes.remove_sync(&ino);
        }
    }

    #[instrument(name = "PointerFs::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match nix::sys::statvfs::statvfs(self.inner.resolver.repo().workdir()) {
            Ok(stat) => reply.statfs(
                stat.blocks() as u64,
                stat.blocks_free() as u64,
                stat.blocks_available() as u64,
                stat.files() as u64,
                stat.files_free() as u64,
                stat.block_size() as u32,
                stat.name_max() as u32,
                stat.fragment_size() as u32,
            ),
            Err(errno) => reply.error(errno as i32),
        }
    }

    #[instrument(name = "PointerFs::listxattr", skip(self, _req, reply))]
    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let inner = Arc::clone(&self.inner);
        self.rt.spawn(async move {
            let Some(path) = inner.path_of(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let Ok(meta) = tokio::fs::symlink_metadata(&path).await else {
                reply.error(libc::ENOENT);
                return;
            };

            if inner.resolver.resolve(&path, &meta).is_none() {
                // Plain files advertise nothing.
                if size == 0 {
                    reply.size(0);
                } else {
                    reply.data(&[]);
                }
                return;
            }

            let mut names = Vec::new();
            for name in ["oid", "size", "hash_algo"] {
                names.extend_from_slice(XATTR_PREFIX.as_bytes());
                names.extend_from_slice(name.as_bytes());
                names.push(0);
            }

            if size == 0 {
                reply.size(names.len() as u32);
            } else if names.len() as u32 <= size {
                reply.data(&names);
            } else {
                reply.error(libc::ERANGE);
            }
        });
    }

    #[instrument(name = "PointerFs::getxattr", skip(self, _req, reply))]
    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let inner = Arc::clone(&self.inner);
        let name = name.to_owned();
        self.rt.spawn(async move {
            let Some(path) = inner.path_of(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            let Ok(meta) = tokio::fs::symlink_metadata(&path).await else {
                reply.error(libc::ENOENT);
                return;
            };

            let Some(object) = inner.resolver.resolve(&path, &meta) else {
                reply.error(libc::ENODATA);
                return;
            };

            let value = match name.to_str().and_then(|n| n.strip_prefix(XATTR_PREFIX)) {
                Some("oid") => object.oid().to_owned(),
                Some("size") => object.size().to_string(),
                Some("hash_algo") => object.hash_algo().to_owned(),
                _ => {
                    reply.error(libc::ENODATA);
                    return;
                }
            };

            let bytes = value.as_bytes();
            if size == 0 {
                reply.size(bytes.len() as u32);
            } else if bytes.len() as u32 <= size {
                reply.data(bytes);
            } else {
                reply.error(libc::ERANGE);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_absolute_targets_relative_to_the_root() {
        let relative = relative_to(
            Path::new("/repo/.git/annex/objects/ab/key"),
            Path::new("/repo"),
        );
        assert_eq!(relative, Path::new(".git/annex/objects/ab/key"));
    }

    #[test]
    fn rewriting_climbs_out_of_diverging_prefixes() {
        let relative = relative_to(Path::new("/srv/objects/key"), Path::new("/repo"));
        assert_eq!(relative, Path::new("../srv/objects/key"));
    }
}
