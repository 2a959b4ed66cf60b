// Per-key in-flight deduplication.
//
// Concurrent callers asking for the same id share one computation: the first
// caller's future initialises a shared cell, everyone else awaits it. The
// entry is removed once the computation finishes, so a later caller starts a
// fresh flight (and is expected to find the result in the cache by then).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

pub struct SingleFlight<V> {
    calls: Mutex<HashMap<String, Arc<OnceCell<V>>>>,
}

/// Result of joining a flight.
#[derive(Debug)]
pub struct Joined<V> {
    pub value: V,
    /// This caller ran the computation rather than waiting on another one.
    pub leader: bool,
}

impl<V: Clone> SingleFlight<V> {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Run `compute` for `id` unless a flight for `id` is already running, in
    /// which case wait for and clone its outcome.
    ///
    /// If the leading caller is cancelled mid-flight, one of the waiters
    /// takes over and runs its own `compute`.
    pub async fn run<F, Fut>(&self, id: &str, compute: F) -> Joined<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = {
            let mut calls = self.calls.lock();
            calls
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let mut leader = false;
        let value = cell
            .get_or_init(|| {
                leader = true;
                compute()
            })
            .await
            .clone();

        {
            let mut calls = self.calls.lock();
            if calls.get(id).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
                calls.remove(id);
            }
        }

        Joined { value, leader }
    }

    /// Number of ids with a flight registered.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

impl<V: Clone> Default for SingleFlight<V> {
    fn default() -> Self {
        Self::new()
    }
}
