use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::backend::CacheBackend;
use crate::config::MuxOptions;
use crate::error::FetchError;
use crate::map::{MultiplexerMap, Resolver};

/// Coalesces requests for a single value, like the current user's profile.
///
/// This behaves exactly like a [`MultiplexerMap`] with one key, which is the cache domain.
pub struct Multiplexer<T, E = FetchError> {
    map: MultiplexerMap<T, E>,
}

impl<T, E> Clone for Multiplexer<T, E> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Multiplexer<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Multiplexer").field(&self.map).finish()
    }
}

impl<T, E> Multiplexer<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a multiplexer that delegates fetches to `on_fetch`.
    pub fn new<F>(options: MuxOptions<E>, backend: Arc<dyn CacheBackend<T>>, on_fetch: F) -> Self
    where
        F: Fn(Resolver<T, E>) + Send + Sync + 'static,
    {
        let map = MultiplexerMap::new(
            options,
            backend,
            move |_key: String, resolver: Resolver<T, E>| on_fetch(resolver),
        );
        Self { map }
    }

    /// Creates a multiplexer from an async fetch function.
    ///
    /// See [`MultiplexerMap::with_async_fetch`].
    pub fn with_async_fetch<F, Fut>(
        options: MuxOptions<E>,
        backend: Arc<dyn CacheBackend<T>>,
        fetch: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let map = MultiplexerMap::with_async_fetch(options, backend, move |_key| fetch());
        Self { map }
    }

    fn key(&self) -> &str {
        self.map.cache_domain()
    }

    pub fn cache_domain(&self) -> &str {
        self.map.cache_domain()
    }

    /// See [`MultiplexerMap::request_with`].
    pub fn request_with<F>(&self, refresh: bool, completion: F)
    where
        F: FnOnce(Result<T, E>) + Send + 'static,
    {
        self.map.request_with(self.key(), refresh, completion)
    }

    /// See [`MultiplexerMap::request`].
    pub async fn request(&self, refresh: bool) -> Result<T, E> {
        self.map.request(self.key(), refresh).await
    }

    pub fn clear_memory(&self) {
        self.map.clear_memory(self.key())
    }

    pub fn clear(&self) {
        self.map.clear(self.key())
    }

    /// Persists the in-memory value, if any. Returns whether a value was persisted.
    pub fn flush(&self) -> bool {
        self.map.flush() > 0
    }
}
