//! In-flight request coalescing.
//!
//! The first caller for a key starts the work and parks a shared handle in the
//! map; later callers for the same key await that handle instead of starting
//! their own. The entry is dropped once the work resolves, whatever the
//! outcome, so the next call after completion starts fresh.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;

pub struct Coalescer<T: Clone> {
    in_flight: Mutex<HashMap<String, Shared<BoxFuture<'static, T>>>>,
}

impl<T: Clone> Default for Coalescer<T> {
    fn default() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Await the pending work for `key`, starting it with `start` if none is running.
    pub async fn run<F, Fut>(&self, key: &str, start: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let pending = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(key) {
                Some(existing) => existing.clone(),
                None => {
                    let shared = start().boxed().shared();
                    in_flight.insert(key.to_string(), shared.clone());
                    shared
                }
            }
        };

        let output = pending.clone().await;

        let mut in_flight = self.in_flight.lock();
        if in_flight.get(key).is_some_and(|current| current.ptr_eq(&pending)) {
            in_flight.remove(key);
        }
        output
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.lock().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_concurrent_callers_share_one_run() {
        let rt = runtime();
        let coalescer = Coalescer::<usize>::new();
        let starts = Arc::new(AtomicUsize::new(0));

        let make = || {
            let starts = Arc::clone(&starts);
            move || async move {
                let n = starts.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
                n
            }
        };

        let (a, b) = rt.block_on(async {
            futures::join!(coalescer.run("spell", make()), coalescer.run("spell", make()))
        });
        assert_eq!((a, b), (1, 1));
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[test]
    fn test_completed_entry_allows_retry() {
        let rt = runtime();
        let coalescer = Coalescer::<Result<u32, String>>::new();

        let first = rt.block_on(coalescer.run("monster", || async { Err("offline".to_string()) }));
        assert!(first.is_err());
        assert!(!coalescer.is_in_flight("monster"));

        let second = rt.block_on(coalescer.run("monster", || async { Ok(7) }));
        assert_eq!(second, Ok(7));
    }

    #[test]
    fn test_distinct_keys_run_independently() {
        let rt = runtime();
        let coalescer = Coalescer::<&'static str>::new();
        let (a, b) = rt.block_on(async {
            futures::join!(
                coalescer.run("spell", || async { "spells" }),
                coalescer.run("item", || async { "items" })
            )
        });
        assert_eq!((a, b), ("spells", "items"));
    }
}
