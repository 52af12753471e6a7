//! Persistence of known-good values.
//!
//! Backends are stateless with respect to the multiplexers using them: a multiplexer only ever
//! saves values on [`flush`](crate::MultiplexerMap::flush), and only loads them as a fallback
//! when a fetch fails with a cache-acceptable error and no value is left in memory.

use crate::error::PersistError;

mod json;

pub use json::JsonDiskCache;

/// Storage for values of type `T`, identified by a key and a cache domain.
pub trait CacheBackend<T>: Send + Sync {
    /// Returns the previously saved value.
    ///
    /// Missing, corrupt or unreadable entries are all treated as absent, so this never fails.
    fn load(&self, key: &str, domain: &str) -> Option<T>;

    /// Persists `value`, replacing whatever was saved under `key` before.
    fn save(&self, value: &T, key: &str, domain: &str) -> Result<(), PersistError>;

    /// Removes the entry saved under `key`. Succeeds if there is none.
    fn clear(&self, key: &str, domain: &str) -> Result<(), PersistError>;

    /// Removes all entries saved under `domain`. Succeeds if there are none.
    fn clear_domain(&self, domain: &str) -> Result<(), PersistError>;

    /// A short name of this backend, used in logs and metrics.
    fn name(&self) -> &'static str;
}

/// A backend that persists nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCache;

impl<T> CacheBackend<T> for NoCache {
    fn load(&self, _: &str, _: &str) -> Option<T> {
        None
    }

    fn save(&self, _: &T, _: &str, _: &str) -> Result<(), PersistError> {
        Ok(())
    }

    fn clear(&self, _: &str, _: &str) -> Result<(), PersistError> {
        Ok(())
    }

    fn clear_domain(&self, _: &str) -> Result<(), PersistError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}
