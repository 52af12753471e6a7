use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time;

use crate::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    name: String,
}

fn user(name: &str) -> User {
    User {
        name: name.to_owned(),
    }
}

/// A remote source that answers fetches with a script of prepared responses.
#[derive(Clone, Default)]
struct ScriptedFetch {
    responses: Arc<Mutex<VecDeque<Result<User, FetchError>>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedFetch {
    fn respond(&self, response: Result<User, FetchError>) {
        self.responses.lock().push_back(response);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn multiplexer(&self, backend: Arc<dyn CacheBackend<User>>) -> MultiplexerMap<User> {
        let fetch = self.clone();
        MultiplexerMap::with_async_fetch(MuxOptions::for_type::<User>(), backend, move |key| {
            fetch.calls.fetch_add(1, Ordering::Relaxed);
            let responses = Arc::clone(&fetch.responses);
            async move {
                time::sleep(Duration::from_millis(100)).await;
                responses
                    .lock()
                    .pop_front()
                    .unwrap_or_else(|| Err(FetchError::Other(format!("unexpected fetch of {key}"))))
            }
        })
    }
}

fn json_backend(dir: &multiplexer_test::TempDir) -> Arc<dyn CacheBackend<User>> {
    Arc::new(JsonDiskCache::<User>::new(dir.path()))
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_coalesce() {
    multiplexer_test::setup();
    let fetch = ScriptedFetch::default();
    fetch.respond(Ok(user("Alice")));
    let users = fetch.multiplexer(Arc::new(NoCache));

    let (a, b, c, d) = futures::join!(
        users.request("user:1", false),
        users.request("user:1", false),
        users.request("user:1", true),
        users.request("user:1", false),
    );

    assert_eq!(fetch.calls(), 1);
    for result in [a, b, c, d] {
        assert_eq!(result, Ok(user("Alice")));
    }
}

#[test]
fn test_concurrent_requests_from_threads() {
    multiplexer_test::setup();
    let pending = Arc::new(Mutex::new(Vec::new()));
    let users: MultiplexerMap<User> = {
        let pending = Arc::clone(&pending);
        MultiplexerMap::new(
            MuxOptions::for_type::<User>(),
            Arc::new(NoCache),
            move |_key: String, resolver: Resolver<User, FetchError>| pending.lock().push(resolver),
        )
    };

    let results = Arc::new(Mutex::new(Vec::new()));
    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let results = Arc::clone(&results);
                users.request_with("user:1", false, move |result| results.lock().push(result));
            });
        }
    });

    let resolver = {
        let mut pending = pending.lock();
        assert_eq!(pending.len(), 1);
        pending.remove(0)
    };
    assert_eq!(resolver.key(), "user:1");
    resolver.resolve(Ok(user("Alice")));

    let results = results.lock();
    assert_eq!(results.len(), 8);
    assert!(results.iter().all(|result| result == &Ok(user("Alice"))));
}

#[tokio::test(start_paused = true)]
async fn test_time_to_live() {
    multiplexer_test::setup();
    let fetch = ScriptedFetch::default();
    fetch.respond(Ok(user("Alice")));
    fetch.respond(Ok(user("Bob")));
    fetch.respond(Ok(user("Carol")));
    let users = fetch.multiplexer(Arc::new(NoCache));
    assert_eq!(users.time_to_live(), STANDARD_TTL);

    assert_eq!(users.request("user:1", false).await, Ok(user("Alice")));

    time::advance(STANDARD_TTL / 2).await;
    assert_eq!(users.request("user:1", false).await, Ok(user("Alice")));
    assert_eq!(fetch.calls(), 1);

    // refreshing always fetches
    assert_eq!(users.request("user:1", true).await, Ok(user("Bob")));
    assert_eq!(fetch.calls(), 2);

    time::advance(STANDARD_TTL).await;
    assert_eq!(users.request("user:1", false).await, Ok(user("Carol")));
    assert_eq!(fetch.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_from_memory() {
    multiplexer_test::setup();
    let fetch = ScriptedFetch::default();
    fetch.respond(Ok(user("Alice")));
    fetch.respond(Err(FetchError::Connectivity("offline".into())));
    fetch.respond(Err(FetchError::Timeout(Duration::from_secs(30))));
    let users = fetch.multiplexer(Arc::new(NoCache));

    assert_eq!(users.request("user:1", false).await, Ok(user("Alice")));

    // all waiters of the failing fetch receive the fallback
    let (a, b, c) = futures::join!(
        users.request("user:1", true),
        users.request("user:1", true),
        users.request("user:1", true),
    );
    assert_eq!(fetch.calls(), 2);
    for result in [a, b, c] {
        assert_eq!(result, Ok(user("Alice")));
    }

    // expired values still serve as fallback
    time::advance(STANDARD_TTL * 2).await;
    assert_eq!(users.request("user:1", false).await, Ok(user("Alice")));
    assert_eq!(fetch.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failure_forgets_value() {
    multiplexer_test::setup();
    let fetch = ScriptedFetch::default();
    fetch.respond(Ok(user("Alice")));
    fetch.respond(Err(FetchError::NotFound));
    fetch.respond(Ok(user("Bob")));
    let users = fetch.multiplexer(Arc::new(NoCache));

    assert_eq!(users.request("user:1", false).await, Ok(user("Alice")));
    assert_eq!(
        users.request("user:1", true).await,
        Err(FetchError::NotFound)
    );

    // the failure is not masked by the old value
    assert_eq!(users.request("user:1", false).await, Ok(user("Bob")));
    assert_eq!(fetch.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_from_backend() {
    multiplexer_test::setup();
    let dir = multiplexer_test::tempdir();
    let backend = json_backend(&dir);
    let domain = default_domain::<User>();
    backend.save(&user("Alice"), "user:1", &domain).unwrap();

    let fetch = ScriptedFetch::default();
    fetch.respond(Err(FetchError::Connectivity("offline".into())));
    fetch.respond(Err(FetchError::Malformed("bad json".into())));
    let users = fetch.multiplexer(Arc::clone(&backend));
    assert_eq!(users.cache_domain(), domain);

    assert_eq!(users.request("user:1", false).await, Ok(user("Alice")));

    // errors that are not cache-acceptable are not masked by persisted values
    assert_eq!(
        users.request("user:1", true).await,
        Err(FetchError::Malformed("bad json".into()))
    );
    assert_eq!(fetch.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_custom_error_type() {
    #[derive(Debug, Clone, PartialEq)]
    enum ApiError {
        Offline,
        Unauthorized,
    }

    multiplexer_test::setup();
    let online = Arc::new(AtomicUsize::new(1));
    let options = MuxOptions::<ApiError>::new("tokens")
        .with_time_to_live(Duration::from_secs(60))
        .use_cached_result_on(|e: &ApiError| *e == ApiError::Offline);
    let tokens = {
        let online = Arc::clone(&online);
        MultiplexerMap::<String, ApiError>::with_async_fetch(
            options,
            Arc::new(NoCache),
            move |key| {
                let state = online.load(Ordering::Relaxed);
                async move {
                    match state {
                        1 => Ok(format!("token for {key}")),
                        2 => Err(ApiError::Offline),
                        _ => Err(ApiError::Unauthorized),
                    }
                }
            },
        )
    };

    assert_eq!(tokens.request("a", false).await, Ok("token for a".to_owned()));

    online.store(2, Ordering::Relaxed);
    assert_eq!(tokens.request("a", true).await, Ok("token for a".to_owned()));
    assert_eq!(tokens.request("b", false).await, Err(ApiError::Offline));

    online.store(3, Ordering::Relaxed);
    assert_eq!(tokens.request("a", true).await, Err(ApiError::Unauthorized));
}

#[tokio::test(start_paused = true)]
async fn test_clear_forces_fetch() {
    multiplexer_test::setup();
    let dir = multiplexer_test::tempdir();
    let backend = json_backend(&dir);
    let domain = default_domain::<User>();

    let fetch = ScriptedFetch::default();
    fetch.respond(Ok(user("Alice")));
    fetch.respond(Ok(user("Bob")));
    fetch.respond(Ok(user("Carol")));
    let users = fetch.multiplexer(Arc::clone(&backend));

    assert_eq!(users.request("user:1", false).await, Ok(user("Alice")));
    assert_eq!(users.flush(), 1);

    // `clear_memory` keeps the persisted value
    users.clear_memory("user:1");
    assert_eq!(backend.load("user:1", &domain), Some(user("Alice")));
    assert_eq!(users.request("user:1", false).await, Ok(user("Bob")));

    users.clear("user:1");
    assert_eq!(backend.load("user:1", &domain), None);
    assert_eq!(users.request("user:1", false).await, Ok(user("Carol")));
    assert_eq!(fetch.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_clear_all() {
    multiplexer_test::setup();
    let dir = multiplexer_test::tempdir();
    let backend = json_backend(&dir);
    let domain = default_domain::<User>();

    let fetch = ScriptedFetch::default();
    fetch.respond(Ok(user("Alice")));
    fetch.respond(Ok(user("Bob")));
    let users = fetch.multiplexer(Arc::clone(&backend));

    users.request("user:1", false).await.unwrap();
    users.request("user:2", false).await.unwrap();
    assert_eq!(users.flush(), 2);

    users.clear_all();
    assert_eq!(users.flush(), 0);
    assert_eq!(backend.load("user:1", &domain), None);
    assert_eq!(backend.load("user:2", &domain), None);
}

#[tokio::test(start_paused = true)]
async fn test_flush_survives_restart() {
    multiplexer_test::setup();
    let dir = multiplexer_test::tempdir();

    let fetch = ScriptedFetch::default();
    fetch.respond(Ok(user("Alice")));
    let users = fetch.multiplexer(json_backend(&dir));
    assert_eq!(users.request("user:1", false).await, Ok(user("Alice")));
    assert_eq!(users.flush(), 1);
    drop(users);

    // a new process, starting offline
    let backend = json_backend(&dir);
    assert_eq!(
        backend.load("user:1", &default_domain::<User>()),
        Some(user("Alice"))
    );

    let fetch = ScriptedFetch::default();
    fetch.respond(Err(FetchError::Connectivity("offline".into())));
    let users = fetch.multiplexer(backend);
    assert_eq!(users.request("user:1", false).await, Ok(user("Alice")));
}

#[tokio::test(start_paused = true)]
async fn test_user_timeout_then_success() {
    multiplexer_test::setup();
    let dir = multiplexer_test::tempdir();

    let fetch = ScriptedFetch::default();
    fetch.respond(Err(FetchError::Timeout(Duration::from_secs(30))));
    fetch.respond(Ok(user("Alice")));
    let users = fetch.multiplexer(json_backend(&dir));

    // nothing to fall back to
    assert_eq!(
        users.request("user:42", false).await,
        Err(FetchError::Timeout(Duration::from_secs(30)))
    );

    assert_eq!(users.request("user:42", false).await, Ok(user("Alice")));
    assert_eq!(fetch.calls(), 2);

    time::advance(Duration::from_secs(60)).await;
    assert_eq!(users.request("user:42", false).await, Ok(user("Alice")));
    assert_eq!(fetch.calls(), 2);

    time::advance(STANDARD_TTL).await;
    fetch.respond(Ok(user("Alice Cooper")));
    assert_eq!(users.request("user:42", false).await, Ok(user("Alice Cooper")));
    assert_eq!(fetch.calls(), 3);
}
