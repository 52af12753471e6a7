//! Request coalescing with a time-bounded fallback cache.
//!
//! A [`MultiplexerMap`] sits in front of some slow or unreliable way of fetching "the current
//! value for key K", typically a remote API resource. It provides two things:
//!
//! - Request coalescing: concurrent requests for the same key are combined into a single call
//!   to the fetch collaborator, and every caller that joined the wave receives the very same
//!   outcome once that call resolves.
//! - A fallback cache: the last known-good value for each key is kept in memory and served
//!   directly while it is younger than the configured time-to-live. When a fetch fails with an
//!   error the configured predicate accepts (usually a connectivity problem), the last value is
//!   served instead, or, if there is none in memory, a value previously persisted through a
//!   [`CacheBackend`].
//!
//! ## Resolution policy
//!
//! A request is resolved in one of these ways:
//!
//! - From memory, when `refresh` is not set and the in-memory value has not expired.
//!   No fetch is triggered.
//! - By joining an in-flight fetch for the same key.
//! - By starting a new fetch, which resolves all waiters with:
//!   - the fetched value on success, which also becomes the new in-memory value;
//!   - a fallback value when the error is cache-acceptable and a fallback exists;
//!   - otherwise the fetch error itself, which also forgets the in-memory value.
//!
//! The engine never retries a failed fetch by itself and never invents errors of its own:
//! callers see either a value or exactly the error the fetch collaborator reported.
//!
//! ## Persistence
//!
//! Values only reach the [`CacheBackend`] through [`MultiplexerMap::flush`], typically before
//! the process is suspended or terminated, and are only read back as fallbacks. The bundled
//! [`JsonDiskCache`] writes one JSON file per key, grouped in a directory per cache domain.
//! [`NoCache`] disables persistence.
//!
//! ### Metrics
//!
//! Counters tagged with the cache `domain`:
//!
//! - `mux.access`: All requests.
//! - `mux.memory.hit`: Requests served from memory without fetching.
//! - `mux.coalesced`: Requests that joined an in-flight fetch.
//! - `mux.fetch`: Actual calls to the fetch collaborator.
//! - `mux.fallback`: Failed fetches masked by a fallback value, tagged with the `source` of the
//!   value (`memory` or `backend`).
//! - `mux.failure`: Failed fetches reported to the callers.
//! - `mux.flush`: Values persisted by a flush.
//!
//! Gauges tagged with the cache `domain`:
//!
//! - `mux.keys`: Keys held in memory at the time of a flush.

#[macro_use]
pub mod metrics;

mod backend;
pub mod config;
mod error;
mod fetcher;
pub mod logging;
mod map;
mod repository;
mod single;

#[cfg(test)]
mod tests;

pub use backend::{CacheBackend, JsonDiskCache, NoCache};
pub use config::{Config, MuxOptions, STANDARD_TTL, default_domain};
pub use error::{CacheAcceptable, FetchError, PersistError};
pub use map::{KeyFetch, MultiplexerMap, Resolver};
pub use repository::{MuxRepository, Repository};
pub use single::Multiplexer;

#[cfg(any(test, feature = "test"))]
pub(crate) use tokio::time;

#[cfg(not(any(test, feature = "test")))]
pub(crate) use std::time;
