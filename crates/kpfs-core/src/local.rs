//! Remote store backed by a local directory.
//!
//! Lets the CLI (and integration tests) run the full cache against something
//! that survives process restarts, without a network backend.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::trace;

use crate::path;
use crate::remote::{
    NodeKind, RemoteError, RemoteMetadata, RemoteStore, RemoteStream, UploadBody,
    truncate_to_secs,
};

/// [`RemoteStore`] that stores files under a root directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

fn map_io(path: &str, err: io::Error) -> RemoteError {
    match err.kind() {
        io::ErrorKind::NotFound => RemoteError::not_found(path),
        io::ErrorKind::AlreadyExists => RemoteError::Conflict {
            path: path.to_string(),
        },
        io::ErrorKind::NotADirectory => RemoteError::NotADirectory {
            path: path.to_string(),
        },
        _ => RemoteError::transient(path, err),
    }
}

impl DirStore {
    /// Serves the contents of `root`. The directory must exist.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, RemoteError> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(RemoteError::NotADirectory {
                path: root.display().to_string(),
            });
        }
        Ok(Self { root })
    }

    /// The backing directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, logical: &str) -> Result<PathBuf, RemoteError> {
        let relative = Path::new(logical.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(RemoteError::Protocol {
                reason: format!("path escapes store root: '{logical}'"),
            });
        }
        Ok(self.root.join(relative))
    }

    fn metadata_at(logical: &str, local: &Path) -> Result<RemoteMetadata, RemoteError> {
        let meta = fs::metadata(local).map_err(|e| map_io(logical, e))?;
        let mtime = truncate_to_secs(meta.modified().unwrap_or(UNIX_EPOCH));
        let ctime = meta.created().map_or(mtime, truncate_to_secs);
        Ok(RemoteMetadata {
            path: logical.to_string(),
            kind: if meta.is_dir() {
                NodeKind::Directory
            } else {
                NodeKind::File
            },
            size: if meta.is_dir() { 0 } else { meta.len() },
            ctime,
            mtime,
        })
    }
}

impl RemoteStore for DirStore {
    fn metadata(&self, path: &str) -> Result<RemoteMetadata, RemoteError> {
        let path = path::normalize(path);
        Self::metadata_at(&path, &self.path_for(&path)?)
    }

    fn list(&self, dir: &str) -> Result<Vec<RemoteMetadata>, RemoteError> {
        let dir = path::normalize(dir);
        let local = self.path_for(&dir)?;
        let mut out = Vec::new();
        for entry in fs::read_dir(&local).map_err(|e| map_io(&dir, e))? {
            let entry = entry.map_err(|e| map_io(&dir, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let child = path::join(&dir, &name);
            match Self::metadata_at(&child, &entry.path()) {
                Ok(meta) => out.push(meta),
                // Removed between readdir and stat.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn download(&self, path: &str) -> Result<RemoteStream, RemoteError> {
        let path = path::normalize(path);
        let local = self.path_for(&path)?;
        if local.is_dir() {
            return Err(RemoteError::Protocol {
                reason: format!("cannot download directory '{path}'"),
            });
        }
        let file = fs::File::open(&local).map_err(|e| map_io(&path, e))?;
        trace!(%path, "Opened download stream");
        Ok(Box::new(file))
    }

    fn upload(
        &self,
        path: &str,
        body: UploadBody<'_>,
        overwrite: bool,
    ) -> Result<RemoteMetadata, RemoteError> {
        let path = path::normalize(path);
        let local = self.path_for(&path)?;
        if local.is_dir() || (!overwrite && local.exists()) {
            return Err(RemoteError::Conflict { path });
        }
        let parent = local
            .parent()
            .ok_or_else(|| RemoteError::not_found(path.clone()))?;
        if !parent.is_dir() {
            return Err(RemoteError::not_found(path::split(&path).0));
        }

        let data = body.to_vec().map_err(|e| map_io(&path, e))?;
        let mut staged = tempfile::NamedTempFile::new_in(parent).map_err(|e| map_io(&path, e))?;
        staged.write_all(&data).map_err(|e| map_io(&path, e))?;
        staged.as_file().sync_all().map_err(|e| map_io(&path, e))?;
        staged
            .persist(&local)
            .map_err(|e| map_io(&path, e.error))?;

        // Remote times are whole seconds; store them that way.
        let now = truncate_to_secs(SystemTime::now());
        fs::File::options()
            .write(true)
            .open(&local)
            .and_then(|f| f.set_modified(now))
            .map_err(|e| map_io(&path, e))?;

        trace!(%path, bytes = data.len(), "Stored upload");
        Self::metadata_at(&path, &local)
    }

    fn delete(&self, path: &str, force: bool) -> Result<(), RemoteError> {
        let path = path::normalize(path);
        if path == "/" {
            return Err(RemoteError::Protocol {
                reason: "cannot delete the root".to_string(),
            });
        }
        let local = self.path_for(&path)?;
        let result = if local.is_dir() {
            fs::remove_dir_all(&local)
        } else {
            fs::remove_file(&local)
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if force && e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(&path, e)),
        }
    }

    fn move_path(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        let from = path::normalize(from);
        let to = path::normalize(to);
        let src = self.path_for(&from)?;
        let dst = self.path_for(&to)?;
        if !src.exists() {
            return Err(RemoteError::not_found(from));
        }
        if dst.exists() {
            return Err(RemoteError::Conflict { path: to });
        }
        fs::rename(&src, &dst).map_err(|e| map_io(&to, e))
    }

    fn mkdir(&self, path: &str, force: bool) -> Result<(), RemoteError> {
        let path = path::normalize(path);
        let local = self.path_for(&path)?;
        match fs::create_dir(&local) {
            Ok(()) => Ok(()),
            Err(e) if force && e.kind() == io::ErrorKind::AlreadyExists && local.is_dir() => Ok(()),
            Err(e) => Err(map_io(&path, e)),
        }
    }
}
