//! Environment lookup and cache file path resolution

use std::path::PathBuf;

/// Environment variable that replaces the entire cache file path when set.
pub const CACHE_FILE_ENV: &str = "EKSCTL_CACHE_FILE";

/// Environment variable that enables credential caching globally.
pub const ENABLE_CACHE_ENV: &str = "EKSCTL_ENABLE_CREDENTIAL_CACHE";

/// Source of environment variables.
///
/// Injected so path resolution stays testable without mutating the real
/// process environment.
pub trait EnvSource: Send + Sync {
    /// Return the value of `key`, or `None` if unset.
    fn var(&self, key: &str) -> Option<String>;
}

/// Environment source backed by the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Resolve the credential cache file path.
///
/// An `EKSCTL_CACHE_FILE` override is returned verbatim. Otherwise the path
/// is `<home>/.eksctl/cache/credentials.yaml`, with the home directory taken
/// from `HOME` or, on Windows, `USERPROFILE`. If neither resolves the path
/// degenerates to a relative one; downstream file operations fail normally.
pub fn cache_filename(env: &dyn EnvSource) -> PathBuf {
    if let Some(path) = env.var(CACHE_FILE_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(path);
    }

    let home = env
        .var("HOME")
        .or_else(|| env.var("USERPROFILE"))
        .unwrap_or_default();

    PathBuf::from(home)
        .join(".eksctl")
        .join("cache")
        .join("credentials.yaml")
}

/// Whether credential caching is enabled for this process.
///
/// Any non-empty value of `EKSCTL_ENABLE_CREDENTIAL_CACHE` enables it.
pub fn cache_enabled(env: &dyn EnvSource) -> bool {
    env.var(ENABLE_CACHE_ENV).is_some_and(|v| !v.is_empty())
}
