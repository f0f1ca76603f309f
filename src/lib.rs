//! Credcache - File-backed credential cache
//!
//! Caches AWS-style short-lived credentials on disk, keyed by cluster,
//! profile, and assumed-role ARN, so short-lived CLI invocations can skip
//! the expensive retrieval call until the credential expires. The cache file
//! is shared across processes and guarded by advisory file locks; it is
//! refused outright unless it is owner-private.

pub mod env;
pub mod error;
pub mod lock;
pub mod provider;
pub mod store;

pub use env::{cache_enabled, cache_filename, EnvSource, OsEnv};
pub use error::{CacheError, CacheResult};
pub use provider::{Clock, CredentialProvider, FileCacheProvider, SystemClock};
pub use store::{CacheEntry, CacheKey, CacheStore, Credentials};
