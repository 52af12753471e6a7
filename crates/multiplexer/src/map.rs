use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use parking_lot::Mutex;

use crate::backend::CacheBackend;
use crate::config::MuxOptions;
use crate::error::FetchError;
use crate::fetcher::{Completion, Fetcher};

type SharedFetcher<T, E> = Arc<Mutex<Fetcher<T, E>>>;

/// The fetch collaborator of a [`MultiplexerMap`].
///
/// This is called at most once per key for each wave of coalesced requests, and must eventually
/// hand its outcome to the [`Resolver`]. The work may happen asynchronously on any thread.
///
/// This is implemented for all closures of the form `Fn(String, Resolver<T, E>)`.
pub trait KeyFetch<T, E>: Send + Sync + 'static {
    /// Starts fetching the value for `key`.
    fn fetch(&self, key: String, resolver: Resolver<T, E>);
}

impl<T, E, F> KeyFetch<T, E> for F
where
    F: Fn(String, Resolver<T, E>) + Send + Sync + 'static,
{
    fn fetch(&self, key: String, resolver: Resolver<T, E>) {
        self(key, resolver)
    }
}

struct Inner<T, E> {
    options: MuxOptions<E>,
    backend: Arc<dyn CacheBackend<T>>,
    on_key_fetch: Box<dyn KeyFetch<T, E>>,
    fetchers: Mutex<HashMap<String, SharedFetcher<T, E>>>,
}

impl<T, E> Inner<T, E> {
    fn domain(&self) -> &str {
        &self.options.cache_domain
    }

    fn fetcher_for_key(&self, key: &str) -> SharedFetcher<T, E> {
        let mut fetchers = self.fetchers.lock();
        let fetcher = fetchers
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(Fetcher::new())));
        Arc::clone(fetcher)
    }
}

/// Coalesces requests per key and keeps the last known-good value of each key.
///
/// See the [crate documentation](crate) for the resolution policy.
///
/// This is a cheap handle around shared state, so clones operate on the same keys. All methods
/// may be called concurrently from any thread. Evicted keys are recreated lazily on the next
/// request.
pub struct MultiplexerMap<T, E = FetchError> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for MultiplexerMap<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> fmt::Debug for MultiplexerMap<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self
            .inner
            .fetchers
            .try_lock()
            .map(|fetchers| fetchers.len())
            .unwrap_or_default();
        f.debug_struct("MultiplexerMap")
            .field("options", &self.inner.options)
            .field("backend", &self.inner.backend.name())
            .field("keys", &keys)
            .finish()
    }
}

impl<T, E> MultiplexerMap<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a multiplexer that delegates fetches to `on_key_fetch`.
    pub fn new(
        options: MuxOptions<E>,
        backend: Arc<dyn CacheBackend<T>>,
        on_key_fetch: impl KeyFetch<T, E>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                backend,
                on_key_fetch: Box::new(on_key_fetch),
                fetchers: Default::default(),
            }),
        }
    }

    /// Creates a multiplexer from an async fetch function.
    ///
    /// Every fetch is spawned as a task on the current tokio runtime, so requests must be made
    /// from within a runtime.
    pub fn with_async_fetch<F, Fut>(
        options: MuxOptions<E>,
        backend: Arc<dyn CacheBackend<T>>,
        fetch: F,
    ) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::new(options, backend, move |key: String, resolver: Resolver<T, E>| {
            let fetch = fetch(key);
            tokio::spawn(async move { resolver.resolve(fetch.await) });
        })
    }

    /// The namespace of the values persisted by this multiplexer.
    pub fn cache_domain(&self) -> &str {
        self.inner.domain()
    }

    /// The maximum age of in-memory values that are served without fetching.
    pub fn time_to_live(&self) -> Duration {
        self.inner.options.time_to_live
    }

    /// Requests the value for `key`, calling `completion` exactly once with the outcome.
    ///
    /// Unless `refresh` is set, an in-memory value younger than the time-to-live is passed to
    /// `completion` right away. Otherwise the request joins the fetch in flight for `key`, or
    /// starts a new one. `completion` is then called from whichever thread resolves the fetch.
    pub fn request_with<F>(&self, key: &str, refresh: bool, completion: F)
    where
        F: FnOnce(Result<T, E>) + Send + 'static,
    {
        let inner = &self.inner;
        let domain = inner.domain();
        metric!(counter("mux.access") += 1, "domain" => domain);

        let fetcher = inner.fetcher_for_key(key);
        let mut state = fetcher.lock();

        let fresh_value = if refresh {
            None
        } else {
            state.fresh_value(inner.options.time_to_live).cloned()
        };
        if let Some(value) = fresh_value {
            drop(state);
            metric!(counter("mux.memory.hit") += 1, "domain" => domain);
            tracing::trace!("Serving {domain} value for `{key}` from memory");
            completion(Ok(value));
            return;
        }

        if state.append(Box::new(completion)) {
            drop(state);
            metric!(counter("mux.coalesced") += 1, "domain" => domain);
            tracing::trace!("Joining in-flight fetch of {domain} value for `{key}`");
            return;
        }
        drop(state);

        metric!(counter("mux.fetch") += 1, "domain" => domain);
        tracing::debug!("Fetching {domain} value for `{key}`");

        let resolver = Resolver {
            inner: Arc::clone(inner),
            key: key.to_owned(),
            fetcher,
            resolved: false,
        };
        inner.on_key_fetch.fetch(key.to_owned(), resolver);
    }

    /// Requests the value for `key`.
    ///
    /// See [`request_with`](Self::request_with) for how the value is obtained.
    ///
    /// # Panics
    ///
    /// Panics if the fetch collaborator drops its [`Resolver`] without resolving it, for example
    /// because the task running the fetch panicked. This affects every caller waiting on that
    /// fetch: a single panicking fetch makes all requests of its wave panic. The original panic
    /// payload is not available to them, the fetch task reports it separately.
    pub async fn request(&self, key: &str, refresh: bool) -> Result<T, E> {
        let (sender, receiver) = oneshot::channel();
        self.request_with(key, refresh, move |result| {
            sender.send(result).ok();
        });

        match receiver.await {
            Ok(result) => result,
            Err(oneshot::Canceled) => {
                panic!("fetch of `{key}` was dropped without being resolved")
            }
        }
    }

    /// Forgets the in-memory state of `key`.
    ///
    /// This does not touch persisted values. A fetch already in flight still resolves its
    /// waiters, but the next request starts from scratch.
    pub fn clear_memory(&self, key: &str) {
        self.inner.fetchers.lock().remove(key);
    }

    /// Forgets the in-memory state of all keys.
    pub fn clear_memory_all(&self) {
        self.inner.fetchers.lock().clear();
    }

    /// Forgets both the in-memory and the persisted value of `key`.
    pub fn clear(&self, key: &str) {
        self.clear_memory(key);

        let domain = self.inner.domain();
        if let Err(e) = self.inner.backend.clear(key, domain) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                domain,
                key,
                "Failed to clear persisted value",
            );
        }
    }

    /// Forgets all in-memory and persisted values of this multiplexer's domain.
    pub fn clear_all(&self) {
        self.clear_memory_all();

        let domain = self.inner.domain();
        if let Err(e) = self.inner.backend.clear_domain(domain) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                domain,
                "Failed to clear persisted domain",
            );
        }
    }

    /// Persists every in-memory value through the cache backend.
    ///
    /// Failures are logged and skipped. Returns the number of values persisted.
    pub fn flush(&self) -> usize {
        let fetchers: Vec<_> = self
            .inner
            .fetchers
            .lock()
            .iter()
            .map(|(key, fetcher)| (key.clone(), Arc::clone(fetcher)))
            .collect();

        let domain = self.inner.domain();
        metric!(gauge("mux.keys") = fetchers.len() as u64, "domain" => domain);

        let mut saved = 0;
        for (key, fetcher) in fetchers {
            let Some(value) = fetcher.lock().previous_value.clone() else {
                continue;
            };

            match self.inner.backend.save(&value, &key, domain) {
                Ok(()) => saved += 1,
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        domain,
                        key = %key,
                        "Failed to persist value",
                    );
                }
            }
        }

        metric!(counter("mux.flush") += saved as i64, "domain" => domain);
        tracing::debug!("Flushed {saved} {domain} values");
        saved
    }
}

/// Hands the outcome of a fetch back to its [`MultiplexerMap`].
///
/// Resolving consumes the resolver, so every fetch is resolved at most once. A resolver that is
/// dropped without being resolved releases the waiting callers without calling them, and logs
/// an error.
pub struct Resolver<T, E> {
    inner: Arc<Inner<T, E>>,
    key: String,
    fetcher: SharedFetcher<T, E>,
    resolved: bool,
}

impl<T, E> Resolver<T, E>
where
    T: Clone,
    E: Clone,
{
    /// The key that is being fetched.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Resolves the fetch, notifying every waiting caller in registration order.
    pub fn resolve(mut self, result: Result<T, E>) {
        self.resolved = true;

        let (waiters, outcome) = match result {
            Ok(value) => {
                let mut fetcher = self.fetcher.lock();
                fetcher.complete(value.clone());
                (fetcher.take_waiters(), Ok(value))
            }
            Err(err) => self.resolve_failure(err),
        };

        tracing::trace!(
            "Resolved {} value for `{}` with {} waiters",
            self.inner.domain(),
            self.key,
            waiters.len()
        );
        for completion in waiters {
            completion(outcome.clone());
        }
    }

    fn resolve_failure(&self, err: E) -> (Vec<Completion<T, E>>, Result<T, E>) {
        let inner = &self.inner;
        let domain = inner.domain();

        if (inner.options.use_cached_result_on)(&err) {
            let previous_value = self.fetcher.lock().previous_value.clone();
            let (fallback, source) = match previous_value {
                Some(value) => (Some(value), "memory"),
                None => (inner.backend.load(&self.key, domain), "backend"),
            };

            if let Some(fallback) = fallback {
                metric!(counter("mux.fallback") += 1, "domain" => domain, "source" => source);
                tracing::debug!(
                    "Fetch of {domain} value for `{}` failed, using {source} fallback",
                    self.key
                );

                let mut fetcher = self.fetcher.lock();
                fetcher.previous_value = Some(fallback.clone());
                return (fetcher.take_waiters(), Ok(fallback));
            }
        }

        metric!(counter("mux.failure") += 1, "domain" => domain);
        tracing::debug!("Fetch of {domain} value for `{}` failed", self.key);

        let mut fetcher = self.fetcher.lock();
        fetcher.clear_memory();
        (fetcher.take_waiters(), Err(err))
    }
}

impl<T, E> Drop for Resolver<T, E> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }

        let waiters = self.fetcher.lock().take_waiters();
        tracing::error!(
            domain = self.inner.domain(),
            key = %self.key,
            waiters = waiters.len(),
            "Fetch was dropped without being resolved",
        );
    }
}

impl<T, E> fmt::Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("domain", &self.inner.domain())
            .field("key", &self.key)
            .finish()
    }
}
