//! Per-key async mutual exclusion
//!
//! Submissions for the same aggregation key run one at a time; different
//! keys never contend beyond a short critical section on the lock table.
//! Entries are removed once no task holds or waits on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct KeyedLocks {
    table: Mutex<HashMap<[u8; 32], Arc<AsyncMutex<()>>>>,
}

/// Held while a key's merge-and-certify sequence runs
pub struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: [u8; 32],
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: [u8; 32]) -> KeyGuard<'_> {
        let mutex = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.entry(key).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or awaited
    pub fn active_keys(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Release the key before inspecting the table so the count below
        // only sees the table's own reference and any waiters.
        self.guard.take();
        let mut table = self.locks.table.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mutex) = table.get(&self.key) {
            if Arc::strong_count(mutex) == 1 {
                table.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_table_is_cleaned_up() {
        let locks = KeyedLocks::new();
        {
            let _a = locks.lock([1; 32]).await;
            let _b = locks.lock([2; 32]).await;
            assert_eq!(locks.active_keys(), 2);
        }
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock([7; 32]).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock([1; 32]).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock([2; 32])).await;
        assert!(b.is_ok());
    }
}
