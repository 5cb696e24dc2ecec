use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

/// Keyed call coalescing: while a call for `key` is in flight, concurrent
/// callers wait on it and receive a clone of its result instead of running
/// the closure again. The key is freed once the call completes, so a later
/// caller always starts a fresh flight (errors are never cached).
pub struct Group<V> {
    inflight: Mutex<HashMap<String, Arc<OnceCell<V>>>>,
}

impl<V: Clone> Group<V> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run<F, Fut>(&self, key: &str, f: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = {
            let mut inflight = self.inflight.lock().expect("singleflight lock poisoned");
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let value = cell.get_or_init(f).await.clone();

        // Only the flight that owns the current cell clears the key; a
        // newer flight under the same key must not be evicted.
        let mut inflight = self.inflight.lock().expect("singleflight lock poisoned");
        if let Some(current) = inflight.get(key) {
            if Arc::ptr_eq(current, &cell) {
                inflight.remove(key);
            }
        }
        value
    }
}

impl<V: Clone> Default for Group<V> {
    fn default() -> Self {
        Self::new()
    }
}
