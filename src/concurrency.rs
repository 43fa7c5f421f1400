//! Concurrency primitives for the processing pipeline: per-address
//! serialization, a global in-flight cap, and an RAII typing-indicator
//! bracket, all in the "acquire returns a guard, `Drop` releases" idiom.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard, Semaphore};

/// Serializes processing per address: at most one pipeline in flight for a
/// given sender at a time.
#[derive(Default, Clone)]
pub struct AddressLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

pub struct AddressGuard {
    _guard: OwnedMutexGuard<()>,
}

impl AddressLocks {
    pub fn new() -> Self {
        AddressLocks::default()
    }

    /// Acquires the per-address lock, blocking until any in-flight
    /// processing for the same address completes.
    pub async fn acquire(&self, address: &str) -> AddressGuard {
        let lock = {
            let mut locks: MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> = self.locks.lock().await;
            locks.entry(address.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let guard = lock.lock_owned().await;
        AddressGuard { _guard: guard }
    }

    /// Drops lock entries for addresses with no waiters, bounding map
    /// growth across the process lifetime.
    pub async fn sweep(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// Global in-flight cap. Wraps a semaphore; callers `acquire` before
/// admitting a new message and hold the permit for the processing
/// duration.
pub struct ConcurrencyCap {
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyCap {
    pub fn new(max_in_flight: usize) -> Self {
        ConcurrencyCap { semaphore: Arc::new(Semaphore::new(max_in_flight)) }
    }

    pub async fn acquire(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed")
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Bracket around the dispatch step: typing is turned off on every exit
/// path, including panics, by firing in `Drop`.
pub struct TypingGuard<F>
where
    F: Fn() + Send + 'static,
{
    off: Option<F>,
}

impl<F> TypingGuard<F>
where
    F: Fn() + Send + 'static,
{
    /// `on()` has already been called by the caller before constructing the
    /// guard; `off` is the fire-and-forget callback to run at release time.
    pub fn new(off: F) -> Self {
        TypingGuard { off: Some(off) }
    }

    pub fn release_now(mut self) {
        if let Some(off) = self.off.take() {
            off();
        }
    }
}

impl<F> Drop for TypingGuard<F>
where
    F: Fn() + Send + 'static,
{
    fn drop(&mut self) {
        if let Some(off) = self.off.take() {
            off();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn address_lock_serializes_same_address() {
        let locks = AddressLocks::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let locks = locks.clone();
            let counter = counter.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("same-address").await;
                let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn typing_guard_fires_on_drop() {
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            let _guard = TypingGuard::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn typing_guard_fires_exactly_once_on_manual_release() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f2 = fired.clone();
        let guard = TypingGuard::new(move || {
            f2.fetch_add(1, Ordering::SeqCst);
        });
        guard.release_now();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrency_cap_bounds_in_flight() {
        let cap = ConcurrencyCap::new(2);
        assert_eq!(cap.available_permits(), 2);
        let _p1 = cap.acquire().await;
        let _p2 = cap.acquire().await;
        assert_eq!(cap.available_permits(), 0);
    }
}
