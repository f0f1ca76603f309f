//! On-disk credential cache store
//!
//! Owns the YAML document shared between processes. Entries are keyed by the
//! `(cluster, profile, role ARN)` triple; a missing path at any level is a
//! cache miss, never an error. The file holds plaintext secrets, so loads
//! refuse any file readable by other users, and writes enforce owner-only
//! permissions.

use crate::error::{CacheError, CacheResult};
use crate::lock::{FlockFactory, LockFactory, LOCK_RETRY_DELAY, LOCK_TIMEOUT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

/// An AWS-style credential triple plus the name of the provider that issued
/// it, kept for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "accesskeyid")]
    pub access_key_id: String,

    #[serde(rename = "secretaccesskey")]
    pub secret_access_key: String,

    #[serde(rename = "sessiontoken")]
    pub session_token: String,

    #[serde(rename = "providername")]
    pub provider_name: String,
}

/// A persisted credential snapshot plus its expiration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub credential: Credentials,

    /// Serialized as RFC 3339 with subsecond precision preserved.
    pub expiration: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether this entry's expiration is at or before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }
}

/// Identifies exactly one cache slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub cluster_id: String,
    pub profile: String,
    /// Assumed-role ARN; empty string means no role.
    pub role_arn: String,
}

impl CacheKey {
    pub fn new(
        cluster_id: impl Into<String>,
        profile: impl Into<String>,
        role_arn: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            profile: profile.into(),
            role_arn: role_arn.into(),
        }
    }
}

/// Role ARN -> entry. A YAML `null` node deserializes as empty, matching
/// documents written by tools that serialize nil maps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RoleMap(pub BTreeMap<String, CacheEntry>);

impl<'de> Deserialize<'de> for RoleMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let inner = Option::<BTreeMap<String, CacheEntry>>::deserialize(deserializer)?;
        Ok(Self(inner.unwrap_or_default()))
    }
}

/// Profile name -> roles, with the same `null` tolerance as [`RoleMap`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ProfileMap(pub BTreeMap<String, RoleMap>);

impl<'de> Deserialize<'de> for ProfileMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let inner = Option::<BTreeMap<String, RoleMap>>::deserialize(deserializer)?;
        Ok(Self(inner.unwrap_or_default()))
    }
}

/// Root persisted structure: cluster identifier -> profiles.
///
/// BTreeMap keeps serialized output deterministic (sorted keys).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDocument {
    #[serde(default, deserialize_with = "null_as_default")]
    pub clusters: BTreeMap<String, ProfileMap>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl CacheDocument {
    /// Return the entry for `key`, if the full path exists.
    pub fn lookup(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.clusters
            .get(&key.cluster_id)?
            .0
            .get(&key.profile)?
            .0
            .get(&key.role_arn)
    }

    /// Insert or replace the entry for `key`, creating intermediate maps.
    /// All other entries are left untouched.
    pub fn insert(&mut self, key: &CacheKey, entry: CacheEntry) {
        self.clusters
            .entry(key.cluster_id.clone())
            .or_default()
            .0
            .entry(key.profile.clone())
            .or_default()
            .0
            .insert(key.role_arn.clone(), entry);
    }
}

/// File-backed store for the shared cache document.
///
/// All reads take a shared lock and all writes an exclusive lock on the cache
/// file, giving readers-writer semantics across processes.
pub struct CacheStore {
    path: PathBuf,
    locks: Arc<dyn LockFactory>,
    lock_timeout: Duration,
    retry_delay: Duration,
}

impl CacheStore {
    /// Create a store over `path` using real OS file locks.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_locks(path, Arc::new(FlockFactory))
    }

    /// Create a store with an injected lock factory.
    pub fn with_locks(path: impl Into<PathBuf>, locks: Arc<dyn LockFactory>) -> Self {
        Self {
            path: path.into(),
            locks,
            lock_timeout: LOCK_TIMEOUT,
            retry_delay: LOCK_RETRY_DELAY,
        }
    }

    /// Override the lock acquisition window.
    pub fn with_lock_timing(mut self, timeout: Duration, retry_delay: Duration) -> Self {
        self.lock_timeout = timeout;
        self.retry_delay = retry_delay;
        self
    }

    /// Path of the cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the entry for `key` from disk.
    ///
    /// A missing cache file is a normal cold start and yields `Ok(None)`.
    /// A file with permission bits beyond owner read/write is rejected before
    /// any lock or read; a file that fails to parse is a hard error rather
    /// than an empty cache, so corruption surfaces to the operator.
    pub async fn load(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        match fs::metadata(&self.path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("cache file {} does not exist", self.path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(CacheError::io(
                    format!("checking cache file {}", self.path.display()),
                    e,
                ));
            }
            Ok(meta) => self.check_private(&meta)?,
        }

        let mut lock = self.locks.lock_for(&self.path);
        lock.try_shared(self.lock_timeout, self.retry_delay).await?;
        let result = self.read_document().await;
        if let Err(e) = lock.unlock().await {
            warn!("unable to unlock {}: {}", self.path.display(), e);
        }

        Ok(result?.lookup(key).cloned())
    }

    /// Persist `entry` under `key`, preserving all unrelated entries.
    ///
    /// The exclusive lock is held across the whole read-merge-write sequence
    /// so a concurrent writer's entries are never silently discarded. The
    /// current on-disk document is re-read best-effort: a cache that cannot
    /// be read back starts over empty rather than failing the save.
    pub async fn save(&self, key: &CacheKey, entry: &CacheEntry) -> CacheResult<()> {
        self.ensure_cache_dir().await?;

        let mut lock = self.locks.lock_for(&self.path);
        lock.try_exclusive(self.lock_timeout, self.retry_delay)
            .await?;
        let result = self.merge_and_write(key, entry).await;
        if let Err(e) = lock.unlock().await {
            warn!("unable to unlock {}: {}", self.path.display(), e);
        }
        result
    }

    async fn merge_and_write(&self, key: &CacheKey, entry: &CacheEntry) -> CacheResult<()> {
        let mut doc = self.read_document().await.unwrap_or_else(|e| {
            debug!("starting from empty cache document: {}", e);
            CacheDocument::default()
        });
        doc.insert(key, entry.clone());

        let data = serde_yaml::to_string(&doc)?;
        fs::write(&self.path, data)
            .await
            .map_err(|e| CacheError::io(format!("writing cache file {}", self.path.display()), e))?;

        // The file must stay private even if it pre-existed with other bits.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.path, perms)
                .map_err(|e| CacheError::io("setting cache file permissions", e))?;
        }

        debug!("updated cache entry for cluster {}", key.cluster_id);
        Ok(())
    }

    async fn read_document(&self) -> CacheResult<CacheDocument> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            // vanished between stat and read
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CacheDocument::default()),
            Err(e) => {
                return Err(CacheError::io(
                    format!("reading cache file {}", self.path.display()),
                    e,
                ));
            }
        };

        if contents.trim().is_empty() {
            return Ok(CacheDocument::default());
        }

        serde_yaml::from_str(&contents).map_err(|e| CacheError::CorruptCache {
            path: self.path.clone(),
            source: e,
        })
    }

    async fn ensure_cache_dir(&self) -> CacheResult<()> {
        let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(());
        };
        if fs::metadata(parent).await.is_ok() {
            // pre-existing directories keep their permissions
            return Ok(());
        }
        fs::create_dir_all(parent)
            .await
            .map_err(|e| CacheError::io(format!("creating cache directory {}", parent.display()), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(parent, perms)
                .map_err(|e| CacheError::io("setting cache directory permissions", e))?;
        }

        Ok(())
    }

    #[cfg(unix)]
    fn check_private(&self, meta: &std::fs::Metadata) -> CacheResult<()> {
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(CacheError::InsecurePermissions {
                path: self.path.clone(),
                mode: mode & 0o777,
            });
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn check_private(&self, _meta: &std::fs::Metadata) -> CacheResult<()> {
        Ok(())
    }
}
