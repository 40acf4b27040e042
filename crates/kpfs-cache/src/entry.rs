//! Per-file cache state machine.
//!
//! A [`FileCacheEntry`] owns everything the cache knows about one open remote
//! file: the local cache file (descriptor or path), an in-memory buffer for
//! content still streaming in, the download stream itself, and whether the
//! local content has diverged from the remote.
//!
//! # Backing modes
//!
//! An entry is always in exactly one mode:
//!
//! - `Memory`: bytes live in a [`CacheBuffer`]; a download stream may be open.
//! - `File`: the cache file is open read/write.
//! - `Persisted`: content is on disk but no descriptor is held. The next data
//!   call reopens the file.
//!
//! # Timestamps
//!
//! The cache file's mtime is compared against the remote mtime on open:
//! equal means the cache is current, older means it must be downloaded again,
//! newer means an upload never finished. Every completed download and upload
//! therefore stamps the cache file with `(now, remote mtime)`.
//!
//! # Locking
//!
//! Data operations serialize on one mutex per entry. The reference count is an
//! atomic outside that mutex, so `close` never waits behind a slow read.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use filetime::FileTime;
use kpfs_core::{FileAttr, RemoteError, RemoteStore, RemoteStream, SharedAttr, UploadBody};
use parking_lot::{Mutex, RwLock};
use tracing::{Span, debug, debug_span, info, trace, warn};

use crate::buffer::CacheBuffer;
use crate::error::{CacheError, CacheResult, IoContext};
use crate::paths::is_temporary;

/// Largest single read issued against a download stream.
const STREAM_READ_SIZE: usize = 64 * 1024;

/// Writes and truncates that would grow the memory buffer past this size go
/// to the cache file instead, which stores the gap sparsely.
const MEMORY_EXTEND_LIMIT: u64 = 16 * 1024 * 1024;

/// Whether local content has diverged from the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifiedState {
    /// Matches the remote; nothing to upload.
    Clean,
    /// Local changes are pending upload.
    Dirty,
    /// The cache file is newer than the remote: a previous upload did not
    /// finish. Reconciled by uploading, never by downloading.
    StaleLocal,
}

/// Outcome of one guarded background-worker step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More work remains.
    Continue,
    /// The work is finished.
    Done,
    /// A handle was reopened or a writer took over; the worker should stop.
    Aborted,
}

enum Backing {
    Memory {
        buffer: CacheBuffer,
        stream: Option<RemoteStream>,
    },
    File(File),
    Persisted,
}

impl std::fmt::Debug for Backing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backing::Memory { buffer, stream } => f
                .debug_struct("Memory")
                .field("buffered", &buffer.len())
                .field("streaming", &stream.is_some())
                .finish(),
            Backing::File(_) => f.write_str("File"),
            Backing::Persisted => f.write_str("Persisted"),
        }
    }
}

impl Backing {
    fn empty() -> Self {
        Backing::Memory {
            buffer: CacheBuffer::new(),
            stream: None,
        }
    }

    fn buffered_len(&self) -> u64 {
        match self {
            Backing::Memory { buffer, .. } => buffer.len(),
            Backing::File(_) | Backing::Persisted => 0,
        }
    }
}

#[derive(Debug)]
struct EntryState {
    backing: Backing,
    modified: ModifiedState,
    flags: i32,
}

#[derive(Debug, Clone)]
struct EntryPaths {
    path: String,
    cache_path: PathBuf,
    ignored: bool,
}

/// Cache state for one logical file path.
#[derive(Debug)]
pub struct FileCacheEntry {
    paths: RwLock<EntryPaths>,
    attr: SharedAttr,
    refcount: AtomicUsize,
    state: Mutex<EntryState>,
    span: Span,
}

impl FileCacheEntry {
    /// Creates an unreferenced entry with no local state loaded.
    pub(crate) fn new(path: String, cache_path: PathBuf, attr: SharedAttr, parent: &Span) -> Self {
        let span = debug_span!(parent: parent, "entry", path = %path);
        Self {
            paths: RwLock::new(EntryPaths {
                ignored: is_temporary(&path),
                path,
                cache_path,
            }),
            attr,
            refcount: AtomicUsize::new(0),
            state: Mutex::new(EntryState {
                backing: Backing::empty(),
                modified: ModifiedState::Clean,
                flags: 0,
            }),
            span,
        }
    }

    /// Prepares the entry for an existing remote file.
    ///
    /// A no-op (apart from recording `flags`) if a descriptor or download
    /// stream is already open. Otherwise the cache file's mtime decides
    /// between downloading, reusing the cache file, or flagging it as
    /// stale-local.
    pub fn open(&self, store: &dyn RemoteStore, flags: i32) -> CacheResult<()> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        let paths = self.paths.read();
        state.flags = flags;

        match &state.backing {
            Backing::File(_) | Backing::Memory { stream: Some(_), .. } => {
                trace!("Already open");
                return Ok(());
            }
            _ => {}
        }

        if state.modified != ModifiedState::Clean {
            // Local content is authoritative until uploaded.
            return open_local(&mut state, &paths);
        }

        let FileAttr {
            size: remote_size,
            mtime: remote_mtime,
            ..
        } = *self.attr.read();
        let remote = FileTime::from_system_time(remote_mtime);

        match cache_mtime(&paths.cache_path)? {
            Some(local) if local > remote => {
                let len = fs::metadata(&paths.cache_path)
                    .at(&paths.cache_path)?
                    .len();
                warn!(
                    cache_len = len,
                    remote_size, "Cache file is newer than remote; keeping local copy for upload"
                );
                self.attr.write().size = len;
                state.modified = ModifiedState::StaleLocal;
                state.backing = Backing::File(open_cache_file(&paths.cache_path, false)?);
            }
            Some(local) if local == remote => {
                trace!("Cache file matches remote");
                state.backing = Backing::File(open_cache_file(&paths.cache_path, false)?);
            }
            _ if state.backing.buffered_len() == remote_size => {
                // Nothing to fetch (empty remote file, or a buffer that already
                // holds everything).
                let content = match &state.backing {
                    Backing::Memory { buffer, .. } => buffer.content(),
                    _ => &[],
                };
                persist_bytes(&paths.cache_path, content)?;
                stamp(&paths.cache_path, remote_mtime)?;
                state.backing = Backing::File(open_cache_file(&paths.cache_path, false)?);
            }
            _ => {
                let stream = store.download(&paths.path)?;
                debug!(size = remote_size, "Started download");
                state.backing = Backing::Memory {
                    buffer: CacheBuffer::with_capacity(capacity_hint(remote_size)),
                    stream: Some(stream),
                };
                state.modified = ModifiedState::Clean;
            }
        }
        Ok(())
    }

    /// Prepares the entry for a brand-new file: creates an empty cache file
    /// and marks the entry dirty. No network I/O.
    pub fn create(&self) -> CacheResult<()> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        let paths = self.paths.read();
        state.backing = Backing::File(open_cache_file(&paths.cache_path, true)?);
        state.modified = ModifiedState::Dirty;
        self.attr.write().size = 0;
        debug!("Created cache file");
        Ok(())
    }

    /// Reads up to `size` bytes at `offset`, clamped to available data.
    ///
    /// Pulls from the download stream first if the range has not arrived yet.
    pub fn read(&self, offset: u64, size: usize) -> CacheResult<Vec<u8>> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        let paths = self.paths.read();

        let want = offset.saturating_add(size as u64);
        let short = match &state.backing {
            Backing::Memory {
                buffer,
                stream: Some(_),
            } => buffer.len() < want,
            _ => false,
        };
        if short {
            let missing = want - state.backing.buffered_len();
            let chunk = usize::try_from(missing).unwrap_or(usize::MAX);
            self.download_locked(&mut state, &paths, chunk)?;
        }

        ensure_descriptor(&mut state, &paths.cache_path)?;
        match &state.backing {
            Backing::File(file) => read_file_at(file, offset, size).at(&paths.cache_path),
            Backing::Memory { buffer, .. } => Ok(buffer.read(offset, size).to_vec()),
            Backing::Persisted => Err(CacheError::Invariant("read without descriptor")),
        }
    }

    /// Writes `data` at `offset` and marks the entry dirty.
    ///
    /// A write to an entry that is still downloading cancels the download:
    /// the stream is dropped and the partially downloaded bytes past `offset`
    /// are discarded, so the old remote content never resurfaces.
    pub fn write(&self, offset: u64, data: &[u8]) -> CacheResult<usize> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        let paths = self.paths.read();

        ensure_descriptor(&mut state, &paths.cache_path)?;
        let end = offset.saturating_add(data.len() as u64);
        if let Backing::Memory { buffer, stream } = &mut state.backing
            && stream.take().is_some()
        {
            debug!(buffered = buffer.len(), offset, "Write cancelled download");
            buffer.truncate(buffer.len().min(offset));
        }
        spill_if_large(&mut state, &paths.cache_path, end)?;

        match &mut state.backing {
            Backing::File(file) => {
                file.write_all_at(data, offset).at(&paths.cache_path)?;
                let mut attr = self.attr.write();
                attr.size = attr.size.max(end);
            }
            Backing::Memory { buffer, .. } => {
                buffer.write(offset, data);
                self.attr.write().size = buffer.len();
            }
            Backing::Persisted => return Err(CacheError::Invariant("write without descriptor")),
        }
        state.modified = ModifiedState::Dirty;
        Ok(data.len())
    }

    /// Resizes the content to `length` bytes and marks the entry dirty.
    ///
    /// A no-op if the length is unchanged, so the entry does not become
    /// dirty spuriously. Growing an entry that is still downloading first
    /// pulls the remote bytes up to `length`; only the range past the remote
    /// size is zero-filled.
    pub fn truncate(&self, length: u64) -> CacheResult<()> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        let paths = self.paths.read();

        let current = match &state.backing {
            Backing::File(file) => file.metadata().at(&paths.cache_path)?.len(),
            // The logical size while a download is still arriving.
            Backing::Memory {
                stream: Some(_), ..
            } => self.attr.read().size,
            Backing::Memory { buffer, .. } => buffer.len(),
            Backing::Persisted => fs::metadata(&paths.cache_path)
                .at(&paths.cache_path)?
                .len(),
        };
        if current == length {
            trace!(length, "Truncate to current length ignored");
            return Ok(());
        }

        let owed = match &state.backing {
            Backing::Memory {
                buffer,
                stream: Some(_),
            } if length > buffer.len() => length - buffer.len(),
            _ => 0,
        };
        if owed > 0 {
            let chunk = usize::try_from(owed).unwrap_or(usize::MAX);
            self.download_locked(&mut state, &paths, chunk)?;
        }

        ensure_descriptor(&mut state, &paths.cache_path)?;
        spill_if_large(&mut state, &paths.cache_path, length)?;
        match &mut state.backing {
            Backing::File(file) => file.set_len(length).at(&paths.cache_path)?,
            Backing::Memory { buffer, stream } => {
                if stream.take().is_some() {
                    debug!(buffered = buffer.len(), length, "Truncate cancelled download");
                }
                buffer.truncate(length);
            }
            Backing::Persisted => return Err(CacheError::Invariant("truncate without descriptor")),
        }
        self.attr.write().size = length;
        state.modified = ModifiedState::Dirty;
        debug!(from = current, to = length, "Truncated");
        Ok(())
    }

    /// Forces dirty on-disk content to stable storage. Never contacts the
    /// remote.
    pub fn flush(&self) -> CacheResult<()> {
        let state = self.state.lock();
        if let Backing::File(file) = &state.backing
            && state.modified != ModifiedState::Clean
        {
            file.sync_all().at(&self.paths.read().cache_path)?;
        }
        Ok(())
    }

    /// Pulls up to `chunk` more bytes from the download stream.
    ///
    /// Returns true once the transfer is complete, at which point the content
    /// has been written to the cache file and stamped with the remote mtime.
    /// Calling this on a modified entry is an invariant violation.
    pub fn download(&self, chunk: usize) -> CacheResult<bool> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        let paths = self.paths.read();
        self.download_locked(&mut state, &paths, chunk)
    }

    /// Pushes local content to the remote if the entry is modified.
    ///
    /// Returns true if an upload was issued. Temporary editor files are
    /// marked clean without uploading.
    pub fn upload(&self, store: &dyn RemoteStore) -> CacheResult<bool> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        let paths = self.paths.read();
        self.upload_locked(&mut state, &paths, store)
    }

    /// Finalizes local state once no handles remain: drops the descriptor
    /// and writes any dirty buffer to the cache file.
    ///
    /// Returns true if the entry can be dropped right away (clean and not
    /// downloading). Does nothing while references are held.
    pub fn close(&self) -> CacheResult<bool> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        if self.refcount() > 0 {
            return Ok(false);
        }
        let paths = self.paths.read();

        match &state.backing {
            Backing::File(_) => state.backing = Backing::Persisted,
            Backing::Memory { buffer, .. } if state.modified != ModifiedState::Clean => {
                persist_bytes(&paths.cache_path, buffer.content())?;
                state.backing = Backing::Persisted;
            }
            _ => {}
        }
        if paths.ignored {
            state.modified = ModifiedState::Clean;
        }
        Ok(state.modified == ModifiedState::Clean && self.completed_locked(&state))
    }

    /// Marks the entry clean and drops any stream or descriptor, so no
    /// deferred upload runs. Used when the remote file is deleted.
    pub fn discard(&self) {
        let mut state = self.state.lock();
        state.modified = ModifiedState::Clean;
        state.backing = Backing::empty();
        debug!(parent: &self.span, "Discarded");
    }

    /// True if nothing is required before disposal: on disk, dirty (handled
    /// by upload instead), fully buffered, or no stream outstanding.
    pub fn completed(&self) -> bool {
        let state = self.state.lock();
        self.completed_locked(&state)
    }

    /// True if the entry holds nothing the remote lacks and no download is
    /// outstanding, so dropping it loses no work.
    pub fn is_settled(&self) -> bool {
        let state = self.state.lock();
        state.modified == ModifiedState::Clean && self.completed_locked(&state)
    }

    /// Drops a half-finished download so the entry can be released. Refused
    /// while handles are open or local changes exist.
    pub(crate) fn abandon_download(&self) -> bool {
        let mut state = self.state.lock();
        if self.refcount() > 0 || state.modified != ModifiedState::Clean {
            return false;
        }
        if matches!(state.backing, Backing::Memory { stream: Some(_), .. }) {
            debug!(parent: &self.span, "Abandoned download");
            state.backing = Backing::empty();
        }
        true
    }

    /// One background download step, skipped if the entry was reopened or
    /// modified since it was scheduled.
    pub(crate) fn download_step(&self, chunk: usize) -> CacheResult<Step> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        if self.refcount() > 0 || state.modified != ModifiedState::Clean {
            return Ok(Step::Aborted);
        }
        let paths = self.paths.read();
        if self.download_locked(&mut state, &paths, chunk)? {
            Ok(Step::Done)
        } else {
            Ok(Step::Continue)
        }
    }

    /// One background upload attempt, skipped if the entry was reopened.
    pub(crate) fn upload_step(&self, store: &dyn RemoteStore) -> CacheResult<Step> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        if self.refcount() > 0 {
            return Ok(Step::Aborted);
        }
        let paths = self.paths.read();
        self.upload_locked(&mut state, &paths, store)?;
        Ok(Step::Done)
    }

    /// Points the entry at a new logical path and cache file.
    pub(crate) fn relocate(&self, path: String, cache_path: PathBuf) {
        let _state = self.state.lock();
        let mut paths = self.paths.write();
        self.span.record("path", path.as_str());
        paths.ignored = is_temporary(&path);
        paths.path = path;
        paths.cache_path = cache_path;
    }

    pub(crate) fn add_ref(&self) -> usize {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn release_ref(&self) -> CacheResult<usize> {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|previous| previous - 1)
            .map_err(|_| CacheError::Invariant("reference count underflow"))
    }

    /// Number of open handles.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Current modified state.
    pub fn state(&self) -> ModifiedState {
        self.state.lock().modified
    }

    /// Flags recorded by the most recent `open`.
    pub fn flags(&self) -> i32 {
        self.state.lock().flags
    }

    /// Bytes held in the memory buffer (0 when backed by the cache file).
    pub fn buffered_len(&self) -> u64 {
        self.state.lock().backing.buffered_len()
    }

    /// Size as currently known (remote size, corrected by local changes).
    pub fn size(&self) -> u64 {
        self.attr.read().size
    }

    /// Shared attributes, as held by the metadata tree.
    pub fn attr(&self) -> &SharedAttr {
        &self.attr
    }

    /// True if a cache file descriptor or download stream is open.
    pub fn is_opened(&self) -> bool {
        matches!(
            self.state.lock().backing,
            Backing::File(_) | Backing::Memory { stream: Some(_), .. }
        )
    }

    /// True for temporary editor files, which are never uploaded.
    pub fn is_ignored(&self) -> bool {
        self.paths.read().ignored
    }

    /// Logical path.
    pub fn path(&self) -> String {
        self.paths.read().path.clone()
    }

    /// Local cache file path.
    pub fn cache_path(&self) -> PathBuf {
        self.paths.read().cache_path.clone()
    }

    fn completed_locked(&self, state: &EntryState) -> bool {
        match &state.backing {
            Backing::File(_) | Backing::Persisted => true,
            Backing::Memory { buffer, stream } => {
                state.modified != ModifiedState::Clean
                    || stream.is_none()
                    || buffer.len() == self.attr.read().size
            }
        }
    }

    fn download_locked(
        &self,
        state: &mut EntryState,
        paths: &EntryPaths,
        chunk: usize,
    ) -> CacheResult<bool> {
        if state.modified != ModifiedState::Clean {
            return Err(CacheError::Invariant("download on a modified entry"));
        }
        let Backing::Memory { buffer, stream } = &mut state.backing else {
            return Ok(true);
        };
        let Some(reader) = stream.as_mut() else {
            return Ok(true);
        };

        let expected = self.attr.read().size;
        let mut scratch = vec![0u8; chunk.clamp(1, STREAM_READ_SIZE)];
        let mut remaining = chunk.max(1);
        let mut eof = false;
        while remaining > 0 && buffer.len() != expected {
            let want = remaining.min(scratch.len());
            match reader.read(&mut scratch[..want]) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    buffer.append(&scratch[..n]);
                    remaining -= n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(RemoteError::transient(paths.path.clone(), e).into()),
            }
        }

        let received = buffer.len();
        if received < expected {
            if eof {
                *stream = None;
                return Err(CacheError::ShortDownload {
                    path: paths.path.clone(),
                    expected,
                    received,
                });
            }
            trace!(received, expected, "Download in progress");
            return Ok(false);
        }
        if received > expected && !eof {
            // Remote grew since its metadata was read; keep pulling.
            return Ok(false);
        }
        if received != expected {
            self.attr.write().size = received;
        }

        persist_bytes(&paths.cache_path, buffer.content())?;
        let remote_mtime = self.attr.read().mtime;
        stamp(&paths.cache_path, remote_mtime)?;
        state.backing = Backing::Persisted;
        debug!(bytes = received, "Download complete");
        Ok(true)
    }

    fn upload_locked(
        &self,
        state: &mut EntryState,
        paths: &EntryPaths,
        store: &dyn RemoteStore,
    ) -> CacheResult<bool> {
        if paths.ignored {
            if state.modified != ModifiedState::Clean {
                trace!("Skipping upload of temporary file");
                state.modified = ModifiedState::Clean;
            }
            return Ok(false);
        }
        if state.modified == ModifiedState::Clean {
            return Ok(false);
        }

        let meta = match &state.backing {
            Backing::File(_) | Backing::Persisted => {
                store.upload(&paths.path, UploadBody::File(&paths.cache_path), true)?
            }
            Backing::Memory { buffer, .. } => {
                let meta = store.upload(&paths.path, UploadBody::Bytes(buffer.content()), true)?;
                persist_bytes(&paths.cache_path, buffer.content())?;
                state.backing = Backing::Persisted;
                meta
            }
        };

        // The upload reply is the refreshed remote metadata; no second round-trip.
        *self.attr.write() = FileAttr::from_metadata(&meta);
        stamp(&paths.cache_path, meta.mtime)?;
        state.modified = ModifiedState::Clean;
        info!(bytes = meta.size, "Uploaded");
        Ok(true)
    }
}

/// Makes local content available through a descriptor without touching the
/// remote.
fn open_local(state: &mut EntryState, paths: &EntryPaths) -> CacheResult<()> {
    if let Backing::Memory { buffer, .. } = &state.backing {
        persist_bytes(&paths.cache_path, buffer.content())?;
        state.backing = Backing::Persisted;
    }
    ensure_descriptor(state, &paths.cache_path)
}

/// Moves buffered content to the cache file when growing the buffer to `end`
/// would pass [`MEMORY_EXTEND_LIMIT`]. Any download stream is dropped.
fn spill_if_large(state: &mut EntryState, cache_path: &Path, end: u64) -> CacheResult<()> {
    let Backing::Memory { buffer, .. } = &state.backing else {
        return Ok(());
    };
    if end <= buffer.len() || end <= MEMORY_EXTEND_LIMIT {
        return Ok(());
    }
    debug!(buffered = buffer.len(), end, "Moving buffer to cache file");
    persist_bytes(cache_path, buffer.content())?;
    state.backing = Backing::File(open_cache_file(cache_path, false)?);
    Ok(())
}

/// Reopens the cache file if the entry is `Persisted`.
fn ensure_descriptor(state: &mut EntryState, cache_path: &Path) -> CacheResult<()> {
    if matches!(state.backing, Backing::Persisted) {
        state.backing = Backing::File(open_cache_file(cache_path, false)?);
    }
    Ok(())
}

/// Opens a cache file read/write. With `create`, parents are created and the
/// file is truncated.
fn open_cache_file(path: &Path, create: bool) -> CacheResult<File> {
    if create && let Some(parent) = path.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    File::options()
        .read(true)
        .write(true)
        .create(create)
        .truncate(create)
        .open(path)
        .at(path)
}

/// Replaces the cache file with `content` atomically.
fn persist_bytes(path: &Path, content: &[u8]) -> CacheResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CacheError::InvalidPath(path.display().to_string()))?;
    fs::create_dir_all(parent).at(parent)?;
    let mut staged = tempfile::NamedTempFile::new_in(parent).at(parent)?;
    staged.write_all(content).at(staged.path())?;
    staged.persist(path).map_err(|e| CacheError::io(path, e.error))?;
    Ok(())
}

/// Sets the cache file's times to `(now, remote mtime)`.
fn stamp(path: &Path, remote_mtime: SystemTime) -> CacheResult<()> {
    filetime::set_file_times(
        path,
        FileTime::now(),
        FileTime::from_system_time(remote_mtime),
    )
    .at(path)
}

fn cache_mtime(path: &Path) -> CacheResult<Option<FileTime>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(FileTime::from_last_modification_time(&meta))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

fn read_file_at(file: &File, offset: u64, size: usize) -> io::Result<Vec<u8>> {
    let available = file.metadata()?.len().saturating_sub(offset);
    let size = size.min(usize::try_from(available).unwrap_or(usize::MAX));
    let mut out = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match file.read_at(&mut out[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    out.truncate(filled);
    Ok(out)
}

fn capacity_hint(size: u64) -> usize {
    usize::try_from(size).unwrap_or(0).min(16 * 1024 * 1024)
}
