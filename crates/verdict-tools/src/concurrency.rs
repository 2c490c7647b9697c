// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const DEFAULT_MAX_SUBPROCESSES: usize = 32;

/// Process-wide named permit pools.
///
/// Used for anything that needs a global concurrency ceiling that is not a
/// model endpoint: sandbox subprocess fan-out, tool-specific caps.  The
/// pool for a name is sized on first use; later callers share it.
fn pools() -> &'static Mutex<HashMap<String, Arc<Semaphore>>> {
    static POOLS: OnceLock<Mutex<HashMap<String, Arc<Semaphore>>>> = OnceLock::new();
    POOLS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Acquire a permit from the named pool, creating it with `n` permits on
/// first use.  The permit releases on drop.
pub async fn concurrency(name: &str, n: usize) -> OwnedSemaphorePermit {
    let semaphore = {
        let mut map = pools().lock().expect("concurrency pool registry poisoned");
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(n.max(1))))
            .clone()
    };
    semaphore
        .acquire_owned()
        .await
        .expect("concurrency pool semaphore closed")
}

fn subprocess_limit() -> &'static AtomicUsize {
    static LIMIT: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_SUBPROCESSES);
    &LIMIT
}

/// Set the ceiling on concurrent sandbox subprocess executions.
///
/// Effective only before the first exec sizes the "subprocesses" pool
/// (the scheduler applies it at startup).
pub fn set_max_subprocesses(n: usize) {
    subprocess_limit().store(n.max(1), Ordering::SeqCst);
}

pub fn max_subprocesses() -> usize {
    subprocess_limit().load(Ordering::SeqCst)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pool_bounds_concurrent_holders() {
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let peak = peak.clone();
            let current = current.clone();
            handles.push(tokio::spawn(async move {
                let _permit = concurrency("test-subprocess-pool", 2).await;
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn distinct_names_are_independent() {
        let _a = concurrency("test-pool-a", 1).await;
        // pool-a is exhausted, but pool-b still grants immediately
        let b =
            tokio::time::timeout(Duration::from_millis(100), concurrency("test-pool-b", 1)).await;
        assert!(b.is_ok());
    }

    #[test]
    fn subprocess_limit_defaults_and_floors_at_one() {
        assert!(max_subprocesses() >= 1);
        set_max_subprocesses(0);
        assert_eq!(max_subprocesses(), 1);
        set_max_subprocesses(DEFAULT_MAX_SUBPROCESSES);
    }
}
