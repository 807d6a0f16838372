//! Repository facts the filesystem needs, captured once at open time.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("failed to open repository: {0}")]
    Open(#[from] git2::Error),

    #[error("repository has no working tree")]
    Bare,
}

/// A configured remote and its URL.
#[derive(Debug, Clone)]
pub struct RemoteSpec {
    pub name: String,
    pub url: String,
}

/// Read-only snapshot of a repository: working tree root, control
/// directory, and the configured remotes. Captured eagerly so no
/// libgit2 handle has to live beyond `open`.
#[derive(Debug, Clone)]
pub struct RepoSnapshot {
    workdir: PathBuf,
    control_dir: PathBuf,
    remotes: Vec<RemoteSpec>,
}

impl RepoSnapshot {
    /// Discover and snapshot the repository containing `path`.
    pub fn open(path: &Path) -> Result<Self, RepoError> {
        let repo = git2::Repository::discover(path)?;
        let workdir = repo.workdir().ok_or(RepoError::Bare)?.to_path_buf();
        let control_dir = repo.path().to_path_buf();

        let mut remotes = Vec::new();
        for name in repo.remotes()?.iter().flatten() {
            if let Ok(remote) = repo.find_remote(name) {
                if let Some(url) = remote.url() {
                    remotes.push(RemoteSpec {
                        name: name.to_owned(),
                        url: url.to_owned(),
                    });
                }
            }
        }

        Ok(Self {
            workdir: canonical(workdir),
            control_dir: canonical(control_dir),
            remotes,
        })
    }

    /// Build a snapshot from raw parts.
    #[must_use]
    pub fn from_parts(workdir: PathBuf, control_dir: PathBuf, remotes: Vec<RemoteSpec>) -> Self {
        Self {
            workdir,
            control_dir,
            remotes,
        }
    }

    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    #[must_use]
    pub fn control_dir(&self) -> &Path {
        &self.control_dir
    }

    #[must_use]
    pub fn remotes(&self) -> &[RemoteSpec] {
        &self.remotes
    }
}

/// Canonicalize so prefix checks against resolved paths hold.
fn canonical(path: PathBuf) -> PathBuf {
    std::fs::canonicalize(&path).unwrap_or(path)
}
