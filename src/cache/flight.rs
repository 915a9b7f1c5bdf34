//! In-flight computation table (singleflight).

use super::key::CacheKey;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// A computation every concurrent requester of one key awaits.
pub type Flight<V> = Shared<BoxFuture<'static, V>>;

/// At most one in-flight computation per key.
///
/// The computation itself must run independently of its waiters (e.g. in a
/// spawned task) so any waiter can drop its [`Flight`] without cancelling it
/// for the rest.
pub struct SingleFlight<V: Clone> {
    inflight: Mutex<HashMap<CacheKey, Flight<V>>>,
}

impl<V: Clone + Send + Sync + 'static> SingleFlight<V> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Join the flight for `key`, or start one with `start`.
    ///
    /// Returns the flight and whether this caller started it. `start` runs
    /// under the table lock, so it must only spawn, never await.
    pub fn join_or_start<F>(&self, key: CacheKey, start: F) -> (Flight<V>, bool)
    where
        F: FnOnce() -> BoxFuture<'static, V>,
    {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(flight) = inflight.get(&key) {
            return (flight.clone(), false);
        }
        let flight = start().shared();
        inflight.insert(key, flight.clone());
        (flight, true)
    }

    /// Forget the flight for `key` so the next request starts a fresh one.
    pub fn finish(&self, key: &CacheKey) {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn in_flight(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<V: Clone + Send + Sync + 'static> Default for SingleFlight<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a key from its [`SingleFlight`] table when dropped, including on panic.
pub struct FlightGuard<V: Clone + Send + Sync + 'static> {
    table: Arc<SingleFlight<V>>,
    key: CacheKey,
}

impl<V: Clone + Send + Sync + 'static> FlightGuard<V> {
    pub fn new(table: Arc<SingleFlight<V>>, key: CacheKey) -> Self {
        Self { table, key }
    }
}

impl<V: Clone + Send + Sync + 'static> Drop for FlightGuard<V> {
    fn drop(&mut self) {
        self.table.finish(&self.key);
    }
}
