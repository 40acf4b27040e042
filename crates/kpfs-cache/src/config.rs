//! Cache pool configuration.
//!
//! Defaults match a network-backed mount: a 30 day retention window for cache
//! files, a short upload debounce, and a small fixed worker pool.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Default retention window for cached files (30 days).
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default delay before a deferred upload starts.
pub const DEFAULT_UPLOAD_DELAY: Duration = Duration::from_millis(500);

/// Default number of bytes a download worker pulls per step.
pub const DEFAULT_DOWNLOAD_CHUNK: usize = 1024;

/// Default number of background worker threads.
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Default capacity of the background job queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Environment variable overriding [`CacheConfig::retention`].
pub const ENV_RETENTION: &str = "KPFS_CACHE_RETENTION";

/// Environment variable overriding [`CacheConfig::upload_delay`].
pub const ENV_UPLOAD_DELAY: &str = "KPFS_UPLOAD_DELAY";

/// Configuration for a [`CachePool`](crate::CachePool).
///
/// Deserializes from the `[cache]` table of the CLI's TOML config; durations
/// use humantime syntax (`"30d"`, `"500ms"`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Cache files not accessed for this long are removed at startup.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    /// How long an upload worker waits before starting. A reopen during the
    /// wait cancels the upload.
    #[serde(with = "humantime_serde")]
    pub upload_delay: Duration,

    /// Bytes pulled per download-worker step. The refcount is checked between
    /// steps, so smaller chunks yield to a reopen sooner.
    pub download_chunk: usize,

    /// Number of background worker threads.
    pub worker_threads: usize,

    /// Capacity of the background job queue.
    pub queue_capacity: usize,

    /// Extra attempts a worker makes after a transient failure.
    pub worker_retries: u32,

    /// Backoff before the first retry; doubles on each further attempt.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Upload an empty placeholder as soon as a file is created, so it is
    /// visible remotely before the first close. Temporary files never get one.
    /// With it off, a created file is uploaded on close even if never written.
    pub placeholder_on_create: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            upload_delay: DEFAULT_UPLOAD_DELAY,
            download_chunk: DEFAULT_DOWNLOAD_CHUNK,
            worker_threads: DEFAULT_WORKER_THREADS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            worker_retries: 3,
            retry_backoff: Duration::from_millis(200),
            placeholder_on_create: true,
        }
    }
}

impl CacheConfig {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies `KPFS_CACHE_RETENTION` and `KPFS_UPLOAD_DELAY` if set.
    ///
    /// Unparseable values are logged and ignored.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        for (key, slot) in [
            (ENV_RETENTION, &mut self.retention),
            (ENV_UPLOAD_DELAY, &mut self.upload_delay),
        ] {
            let Some(raw) = lookup(key) else { continue };
            match humantime::parse_duration(raw.trim()) {
                Ok(value) => *slot = value,
                Err(e) => warn!(key, value = %raw, error = %e, "Ignoring invalid duration"),
            }
        }
        self
    }

    /// Sets the retention window.
    #[must_use]
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Sets the upload debounce delay.
    #[must_use]
    pub fn upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay;
        self
    }

    /// Sets the per-step download chunk size.
    #[must_use]
    pub fn download_chunk(mut self, bytes: usize) -> Self {
        self.download_chunk = bytes.max(1);
        self
    }

    /// Sets the number of worker threads.
    #[must_use]
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    /// Sets the job queue capacity.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Sets the retry count and initial backoff for worker failures.
    #[must_use]
    pub fn retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.worker_retries = retries;
        self.retry_backoff = backoff;
        self
    }

    /// Enables or disables the empty placeholder upload on create.
    #[must_use]
    pub fn placeholder_on_create(mut self, enabled: bool) -> Self {
        self.placeholder_on_create = enabled;
        self
    }

    /// Backoff before retry number `attempt` (1-based).
    pub(crate) fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}
