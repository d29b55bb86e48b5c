// src/locks.rs
// Per-path advisory locks shared by the write-back and the mirror engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::paths;

#[derive(Clone, Default)]
pub struct PathLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        PathLocks::default()
    }

    /// Waits for exclusive access to `path` (normalized). Waiters are served in order.
    pub async fn lock(&self, path: &str) -> OwnedMutexGuard<()> {
        let key = paths::normalize(path);
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop entries nobody holds or waits on.
            map.retain(|_, m| Arc::strong_count(m) > 1);
            map.entry(key).or_default().clone()
        };
        mutex.lock_owned().await
    }

    pub fn tracked(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_path_is_exclusive_across_spellings() {
        let locks = PathLocks::new();
        let guard = locks.lock("/docs/a.md").await;
        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("/docs//a.md/").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn distinct_paths_do_not_block_and_entries_are_pruned() {
        let locks = PathLocks::new();
        let a = locks.lock("/docs/a.md").await;
        let b = locks.lock("/docs/b.md").await;
        drop(a);
        drop(b);
        let _c = locks.lock("/docs/c.md").await;
        assert_eq!(locks.tracked(), 1);
    }
}
