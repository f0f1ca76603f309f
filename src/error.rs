//! Error types for credcache
//!
//! All modules use `CacheResult<T>` as their return type.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// All errors that can occur while caching credentials
#[derive(Error, Debug)]
pub enum CacheError {
    // Configuration errors
    #[error("cache file {path} is not private (mode {mode:o}); expected owner-only permissions")]
    InsecurePermissions { path: PathBuf, mode: u32 },

    // Lock errors
    #[error("unable to lock cache file {path} within {timeout:?}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("lock operation failed on {path}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Cache content errors
    #[error("unable to parse cache file {path}")]
    CorruptCache {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // Wrapped-provider errors, always propagated verbatim
    #[error("credential provider error: {0}")]
    Provider(String),
}

impl CacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a lock error for a path
    pub fn lock(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Lock {
            path: path.into(),
            source,
        }
    }

    /// True for errors that make the cache itself unusable: insecure
    /// permissions or an unparseable document. These surface at construction
    /// time and require operator intervention.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InsecurePermissions { .. } | Self::CorruptCache { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CacheError::InsecurePermissions {
            path: PathBuf::from("/tmp/credentials.yaml"),
            mode: 0o777,
        };
        assert!(err.to_string().contains("not private"));
        assert!(err.to_string().contains("777"));
    }

    #[test]
    fn error_fatal() {
        let insecure = CacheError::InsecurePermissions {
            path: PathBuf::from("c.yaml"),
            mode: 0o644,
        };
        assert!(insecure.is_fatal());

        let lock = CacheError::LockTimeout {
            path: PathBuf::from("c.yaml"),
            timeout: Duration::from_secs(1),
        };
        assert!(!lock.is_fatal());
    }
}
