use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

use crate::map::MultiplexerMap;
use crate::single::Multiplexer;

/// The maintenance surface shared by all multiplexers, independent of their value types.
pub trait Repository: Send + Sync {
    /// The cache domain this repository persists to.
    fn cache_domain(&self) -> &str;

    /// Forgets all in-memory values.
    fn clear_memory(&self);

    /// Forgets all in-memory and persisted values.
    fn clear(&self);

    /// Persists all in-memory values, returning how many were persisted.
    fn flush(&self) -> usize;
}

impl<T, E> Repository for MultiplexerMap<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn cache_domain(&self) -> &str {
        MultiplexerMap::cache_domain(self)
    }

    fn clear_memory(&self) {
        self.clear_memory_all()
    }

    fn clear(&self) {
        self.clear_all()
    }

    fn flush(&self) -> usize {
        MultiplexerMap::flush(self)
    }
}

impl<T, E> Repository for Multiplexer<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn cache_domain(&self) -> &str {
        Multiplexer::cache_domain(self)
    }

    fn clear_memory(&self) {
        Multiplexer::clear_memory(self)
    }

    fn clear(&self) {
        Multiplexer::clear(self)
    }

    fn flush(&self) -> usize {
        Multiplexer::flush(self) as usize
    }
}

/// A registry of multiplexers, for maintenance across all of them at once.
///
/// Typical uses are flushing everything before the process is suspended, or clearing
/// everything when the user logs out. Multiplexers are keyed by their cache domain.
#[derive(Default)]
pub struct MuxRepository {
    repositories: Mutex<HashMap<String, Box<dyn Repository>>>,
}

impl MuxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a multiplexer, replacing any other registered for the same cache domain.
    pub fn register<R>(&self, repository: R)
    where
        R: Repository + 'static,
    {
        let domain = repository.cache_domain().to_owned();
        let previous = self
            .repositories
            .lock()
            .insert(domain.clone(), Box::new(repository));

        if previous.is_some() {
            tracing::warn!(domain = %domain, "Replacing multiplexer registered for the same domain");
        }
    }

    /// Removes the multiplexer registered for `domain`. Returns whether there was one.
    pub fn unregister(&self, domain: &str) -> bool {
        self.repositories.lock().remove(domain).is_some()
    }

    pub fn len(&self) -> usize {
        self.repositories.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets the in-memory values of all registered multiplexers.
    pub fn clear_memory_all(&self) {
        for repository in self.repositories.lock().values() {
            repository.clear_memory();
        }
    }

    /// Forgets the in-memory and persisted values of all registered multiplexers.
    pub fn clear_all(&self) {
        for repository in self.repositories.lock().values() {
            repository.clear();
        }
    }

    /// Persists the in-memory values of all registered multiplexers.
    ///
    /// Returns the total number of values persisted.
    pub fn flush_all(&self) -> usize {
        let flushed: usize = self
            .repositories
            .lock()
            .values()
            .map(|repository| repository.flush())
            .sum();

        tracing::info!("Flushed {flushed} values");
        flushed
    }
}

impl fmt::Debug for MuxRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let repositories = self.repositories.lock();
        let mut domains: Vec<_> = repositories.keys().collect();
        domains.sort();
        f.debug_struct("MuxRepository")
            .field("domains", &domains)
            .finish()
    }
}
