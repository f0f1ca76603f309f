//! File-cache credential provider
//!
//! Wraps an inner credential provider and serves its last-retrieved
//! credential from the shared on-disk cache until it expires. Cache failures
//! after construction only disable the optimization; they never turn a
//! successful credential fetch into an error.

use crate::env::{cache_filename, OsEnv};
use crate::error::CacheResult;
use crate::store::{CacheEntry, CacheKey, CacheStore, Credentials};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Time source, injected so tests can freeze it.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A component that yields AWS-style short-lived credentials on demand.
///
/// `expires_at` is the optional Expirer capability: providers that know when
/// their last-issued credential expires override it, and only those trigger
/// persistence in the cache layer.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Fetch a credential, possibly via an expensive network call.
    async fn retrieve(&mut self) -> CacheResult<Credentials>;

    /// Whether the last-issued credential has expired.
    fn is_expired(&self) -> bool;

    /// Expiration of the last-issued credential, if the provider tracks one.
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Credential provider that adds transparent file-backed caching around an
/// inner provider. Implements the same capability surface, so it is a
/// drop-in substitute.
pub struct FileCacheProvider {
    inner: Box<dyn CredentialProvider>,
    key: CacheKey,
    store: CacheStore,
    clock: Box<dyn Clock>,
    cached: Option<CacheEntry>,
}

impl FileCacheProvider {
    /// Create a provider, eagerly loading the store once.
    ///
    /// Construction fails loudly when the cache itself might be unsafe or
    /// corrupt: insecure file permissions, an unacquirable read lock, or an
    /// unparseable document. A missing cache file is a normal cold start and
    /// yields an already-expired initial state.
    pub async fn new(
        key: CacheKey,
        inner: Box<dyn CredentialProvider>,
        store: CacheStore,
        clock: Box<dyn Clock>,
    ) -> CacheResult<Self> {
        let cached = store.load(&key).await?;
        if cached.is_none() {
            debug!("no cached credential for cluster {}", key.cluster_id);
        }
        Ok(Self {
            inner,
            key,
            store,
            clock,
            cached,
        })
    }

    /// Create a provider with the defaults: cache path resolved from the
    /// process environment, OS file locks, and the system clock.
    pub async fn from_env(key: CacheKey, inner: Box<dyn CredentialProvider>) -> CacheResult<Self> {
        let store = CacheStore::new(cache_filename(&OsEnv));
        Self::new(key, inner, store, Box::new(SystemClock)).await
    }

    fn cached_fresh(&self) -> bool {
        self.cached
            .as_ref()
            .is_some_and(|entry| !entry.is_expired(self.clock.now()))
    }
}

#[async_trait]
impl CredentialProvider for FileCacheProvider {
    /// Return the cached credential while it is fresh; otherwise delegate to
    /// the inner provider and opportunistically persist the refreshed entry.
    ///
    /// Inner provider errors propagate verbatim. Persistence errors are
    /// logged and swallowed: the freshly retrieved credential is still
    /// returned, and the entry stays unpersisted until the next call.
    async fn retrieve(&mut self) -> CacheResult<Credentials> {
        if let Some(entry) = &self.cached {
            if !entry.is_expired(self.clock.now()) {
                // inner provider is never invoked on a cache hit
                return Ok(entry.credential.clone());
            }
        }

        info!("no valid cached credential, refreshing");
        let credential = self.inner.retrieve().await?;

        let Some(expiration) = self.inner.expires_at() else {
            // no sound expiration to record, so nothing is persisted
            debug!("provider does not expose an expiration; skipping cache write");
            return Ok(credential);
        };

        let entry = CacheEntry {
            credential: credential.clone(),
            expiration,
        };
        match self.store.save(&self.key, &entry).await {
            Ok(()) => {
                info!("updated cached credential");
                self.cached = Some(entry);
            }
            Err(e) => warn!(
                "unable to update credential cache {}: {}",
                self.store.path().display(),
                e
            ),
        }

        Ok(credential)
    }

    /// Defers to the cached entry first, falling back to the inner provider
    /// once the cached entry has expired.
    fn is_expired(&self) -> bool {
        !self.cached_fresh() && self.inner.is_expired()
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.cached.as_ref().map(|entry| entry.expiration)
    }
}
