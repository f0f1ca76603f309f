//! Cross-process advisory locking for the cache file
//!
//! The cache file is shared by independent OS processes, so all access goes
//! through an advisory lock: shared for reads, exclusive for writes.
//! Acquisition is bounded; it polls the non-blocking OS lock and gives up
//! once the timeout elapses rather than blocking indefinitely.

use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use fs4::tokio::AsyncFileExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tracing::{debug, warn};

/// How long lock acquisition keeps retrying before failing.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Delay between lock acquisition attempts.
pub const LOCK_RETRY_DELAY: Duration = Duration::from_millis(250);

/// A named, process-external advisory lock bound to a file path.
///
/// Callers must release the lock on every exit path once acquired; a failed
/// acquisition means no lock is held.
#[async_trait]
pub trait FileLock: Send {
    /// Acquire a shared (read) lock, retrying every `retry_delay` up to `timeout`.
    async fn try_shared(&mut self, timeout: Duration, retry_delay: Duration) -> CacheResult<()>;

    /// Acquire an exclusive (write) lock, retrying every `retry_delay` up to `timeout`.
    async fn try_exclusive(&mut self, timeout: Duration, retry_delay: Duration) -> CacheResult<()>;

    /// Release the lock.
    async fn unlock(&mut self) -> CacheResult<()>;
}

/// Creates locks bound to paths. Injected so tests can substitute stub locks.
pub trait LockFactory: Send + Sync {
    fn lock_for(&self, path: &Path) -> Box<dyn FileLock>;
}

/// OS advisory file lock backed by [`fs4`].
///
/// Opens the lock target read/write (created 0600 on Unix if missing) and
/// holds the handle for the lifetime of the lock. The OS releases the lock
/// when the handle is dropped, but callers should still `unlock` explicitly.
pub struct Flock {
    path: PathBuf,
    file: Option<File>,
}

impl Flock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    async fn open(&self) -> CacheResult<File> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);
        #[cfg(unix)]
        opts.mode(0o600);
        opts.open(&self.path)
            .await
            .map_err(|e| CacheError::lock(&self.path, e))
    }

    async fn acquire(
        &mut self,
        exclusive: bool,
        timeout: Duration,
        retry_delay: Duration,
    ) -> CacheResult<()> {
        let file = self.open().await?;
        let start = tokio::time::Instant::now();

        loop {
            let locked = if exclusive {
                file.try_lock_exclusive()
            } else {
                file.try_lock_shared()
            }
            .map_err(|e| CacheError::lock(&self.path, e))?;

            if locked {
                self.file = Some(file);
                return Ok(());
            }

            if start.elapsed() >= timeout {
                warn!("lock on {} still held after {:?}", self.path.display(), timeout);
                return Err(CacheError::LockTimeout {
                    path: self.path.clone(),
                    timeout,
                });
            }

            debug!("lock on {} held elsewhere, retrying", self.path.display());
            tokio::time::sleep(retry_delay).await;
        }
    }
}

#[async_trait]
impl FileLock for Flock {
    async fn try_shared(&mut self, timeout: Duration, retry_delay: Duration) -> CacheResult<()> {
        self.acquire(false, timeout, retry_delay).await
    }

    async fn try_exclusive(&mut self, timeout: Duration, retry_delay: Duration) -> CacheResult<()> {
        self.acquire(true, timeout, retry_delay).await
    }

    async fn unlock(&mut self) -> CacheResult<()> {
        if let Some(file) = self.file.take() {
            file.unlock().map_err(|e| CacheError::lock(&self.path, e))?;
        }
        Ok(())
    }
}

/// Factory producing [`Flock`] instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlockFactory;

impl LockFactory for FlockFactory {
    fn lock_for(&self, path: &Path) -> Box<dyn FileLock> {
        Box::new(Flock::new(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FAST: Duration = Duration::from_millis(100);
    const POLL: Duration = Duration::from_millis(10);

    fn lock_path(dir: &TempDir) -> PathBuf {
        dir.path().join("credentials.yaml")
    }

    #[tokio::test]
    async fn exclusive_blocks_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);

        let mut first = Flock::new(&path);
        first.try_exclusive(FAST, POLL).await.unwrap();

        let mut second = Flock::new(&path);
        let err = second.try_exclusive(FAST, POLL).await.unwrap_err();
        assert!(matches!(err, CacheError::LockTimeout { .. }));

        first.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn shared_allows_concurrent_readers() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);

        let mut first = Flock::new(&path);
        first.try_shared(FAST, POLL).await.unwrap();

        let mut second = Flock::new(&path);
        second.try_shared(FAST, POLL).await.unwrap();

        first.unlock().await.unwrap();
        second.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn shared_blocks_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);

        let mut reader = Flock::new(&path);
        reader.try_shared(FAST, POLL).await.unwrap();

        let mut writer = Flock::new(&path);
        let err = writer.try_exclusive(FAST, POLL).await.unwrap_err();
        assert!(matches!(err, CacheError::LockTimeout { .. }));

        reader.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn unlock_releases_for_next_writer() {
        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);

        let mut first = Flock::new(&path);
        first.try_exclusive(FAST, POLL).await.unwrap();
        first.unlock().await.unwrap();

        let mut second = Flock::new(&path);
        second.try_exclusive(FAST, POLL).await.unwrap();
        second.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn unlock_without_lock_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut lock = Flock::new(lock_path(&dir));
        lock.unlock().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lock_file_created_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = lock_path(&dir);

        let mut lock = Flock::new(&path);
        lock.try_exclusive(FAST, POLL).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        lock.unlock().await.unwrap();
    }
}
