// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::Semaphore;
use tracing::debug;

/// Process-wide registry of per-endpoint connection semaphores.
///
/// Multiple `Model` instances pointing at the same endpoint/account (same
/// `connection_key()`) share one semaphore, so three models against one
/// account still respect that account's `max_connections` in aggregate.
/// The semaphore is sized on first use for a given key; later callers with
/// a different limit share the existing semaphore (the first configuration
/// wins, matching a single eval's consistent settings).
fn semaphores() -> &'static Mutex<HashMap<String, Arc<Semaphore>>> {
    static SEMAPHORES: OnceLock<Mutex<HashMap<String, Arc<Semaphore>>>> = OnceLock::new();
    SEMAPHORES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The shared semaphore for `connection_key`, created with `max_connections`
/// permits on first use.
pub fn connection_semaphore(connection_key: &str, max_connections: usize) -> Arc<Semaphore> {
    let mut map = semaphores().lock().expect("connection semaphore registry poisoned");
    map.entry(connection_key.to_string())
        .or_insert_with(|| {
            debug!(key = connection_key, max_connections, "creating connection semaphore");
            Arc::new(Semaphore::new(max_connections.max(1)))
        })
        .clone()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_shares_one_semaphore() {
        let a = connection_semaphore("test-shared-key", 2);
        let b = connection_semaphore("test-shared-key", 99);
        assert!(Arc::ptr_eq(&a, &b));
        // first configuration wins
        assert_eq!(a.available_permits(), 2);
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_budgets() {
        let a = connection_semaphore("test-key-a", 1);
        let b = connection_semaphore("test-key-b", 1);
        assert!(!Arc::ptr_eq(&a, &b));
        let _pa = a.acquire().await.unwrap();
        // exhausting a does not affect b
        assert_eq!(b.available_permits(), 1);
    }

    #[tokio::test]
    async fn permits_bound_concurrency() {
        let sem = connection_semaphore("test-bounded", 1);
        let p1 = sem.clone().try_acquire_owned().unwrap();
        assert!(sem.clone().try_acquire_owned().is_err());
        drop(p1);
        assert!(sem.try_acquire_owned().is_ok());
    }
}
