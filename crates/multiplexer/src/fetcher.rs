use std::time::Duration;

use crate::time::Instant;

/// A callback waiting for the outcome of a fetch.
pub(crate) type Completion<T, E> = Box<dyn FnOnce(Result<T, E>) + Send>;

/// The state the multiplexer keeps per key.
pub(crate) struct Fetcher<T, E> {
    /// The last value considered valid.
    pub previous_value: Option<T>,
    /// When `previous_value` was last set by a successful fetch.
    pub completion_time: Option<Instant>,
    /// Callers waiting for the fetch currently in flight.
    ///
    /// This is non-empty if and only if a fetch is in flight.
    waiters: Vec<Completion<T, E>>,
}

impl<T, E> Fetcher<T, E> {
    pub fn new() -> Self {
        Self {
            previous_value: None,
            completion_time: None,
            waiters: Vec::new(),
        }
    }

    /// Whether the value is older than `ttl`, or was never completed at all.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        match self.completion_time {
            Some(completion_time) => completion_time.elapsed() >= ttl,
            None => true,
        }
    }

    /// Returns the previous value, unless it has expired.
    pub fn fresh_value(&self, ttl: Duration) -> Option<&T> {
        self.previous_value
            .as_ref()
            .filter(|_| !self.is_expired(ttl))
    }

    /// Registers a completion for the next resolution.
    ///
    /// Returns `true` if a fetch is already in flight, meaning the caller must not start another one.
    pub fn append(&mut self, completion: Completion<T, E>) -> bool {
        let in_flight = self.is_in_flight();
        self.waiters.push(completion);
        in_flight
    }

    pub fn is_in_flight(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Takes all registered completions, in registration order.
    pub fn take_waiters(&mut self) -> Vec<Completion<T, E>> {
        std::mem::take(&mut self.waiters)
    }

    /// Records a freshly fetched value.
    pub fn complete(&mut self, value: T) {
        self.completion_time = Some(Instant::now());
        self.previous_value = Some(value);
    }

    /// Forgets the previous value.
    pub fn clear_memory(&mut self) {
        self.previous_value = None;
        self.completion_time = None;
    }
}
