// src/writeback.rs
// Debounced write-back of editor content: the last edit in a quiet window is
// written to the sandbox, then to the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, warn};

use crate::db::{StoreHandle, UpsertStrategy};
use crate::error::WriteBackError;
use crate::locks::PathLocks;
use crate::paths;
use crate::sandbox::Sandbox;

struct Pending {
    generation: u64,
    content: String,
    timer: AbortHandle,
}

#[derive(Clone)]
struct Target {
    sandbox: Arc<dyn Sandbox>,
    store: StoreHandle,
    strategy: UpsertStrategy,
    locks: PathLocks,
}

impl Target {
    // Sandbox first, then the store, under the path lock.
    async fn commit(&self, path: &str, content: &str) -> Result<(), WriteBackError> {
        let _guard = self.locks.lock(path).await;
        self.sandbox.write_file(path, content).await?;
        self.store.upsert_with(self.strategy, path, content).await?;
        debug!(path, bytes = content.len(), "write-back committed");
        Ok(())
    }

    async fn commit_logged(&self, path: &str, content: &str) {
        if let Err(e) = self.commit(path, content).await {
            warn!(path, error = %e, "debounced write failed");
        }
    }
}

pub struct DebouncedWriter {
    target: Target,
    quiet: Duration,
    pending: Arc<Mutex<HashMap<String, Pending>>>,
    generation: AtomicU64,
    tasks: Mutex<JoinSet<()>>,
}

impl DebouncedWriter {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        store: StoreHandle,
        strategy: UpsertStrategy,
        quiet: Duration,
        locks: PathLocks,
    ) -> Self {
        DebouncedWriter {
            target: Target { sandbox, store, strategy, locks },
            quiet,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn quiet_interval(&self) -> Duration {
        self.quiet
    }

    /// Replaces any pending write for `path`. The write lands at `path` even if
    /// the caller has moved on to another file by the time it fires.
    pub fn schedule(&self, path: &str, content: &str) {
        let path = paths::normalize(path);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.remove(&path) {
            previous.timer.abort();
            debug!(path = %path, "rescheduled pending write");
        }

        let quiet = self.quiet;
        let target = self.target.clone();
        let shared = self.pending.clone();
        let task_path = path.clone();
        let timer = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            while tasks.try_join_next().is_some() {}
            tasks.spawn(async move {
                tokio::time::sleep(quiet).await;
                let content = {
                    let mut pending = shared.lock().unwrap_or_else(PoisonError::into_inner);
                    match pending.get(&task_path) {
                        Some(entry) if entry.generation == generation => {
                            pending.remove(&task_path).map(|entry| entry.content)
                        }
                        _ => None,
                    }
                };
                if let Some(content) = content {
                    target.commit_logged(&task_path, &content).await;
                }
            })
        };
        pending.insert(path, Pending { generation, content: content.to_string(), timer });
    }

    /// Paths with a write still waiting for its quiet interval.
    pub fn pending(&self) -> Vec<String> {
        let mut paths: Vec<String> =
            self.pending.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Commits every waiting write now and waits for writes already in flight.
    pub async fn flush(&self) {
        let waiting: Vec<(String, Pending)> =
            self.pending.lock().unwrap_or_else(PoisonError::into_inner).drain().collect();
        for (path, entry) in waiting {
            entry.timer.abort();
            self.target.commit_logged(&path, &entry.content).await;
        }

        let mut tasks =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    warn!(error = %e, "write-back task failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FileStore;
    use crate::sandbox::MemorySandbox;
    use tokio::time::{sleep, Instant};

    const A: &str = "/my-docs2/docs/a.md";
    const B: &str = "/my-docs2/docs/b.md";

    async fn writer(strategy: UpsertStrategy) -> (DebouncedWriter, Arc<MemorySandbox>, StoreHandle) {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.mkdir("/my-docs2/docs", true).await.unwrap();
        let store = FileStore::in_memory().open().unwrap();
        let writer = DebouncedWriter::new(
            sandbox.clone(),
            store.clone(),
            strategy,
            Duration::from_millis(500),
            PathLocks::new(),
        );
        (writer, sandbox, store)
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_edits_coalesce_into_one_write() {
        let (writer, sandbox, store) = writer(UpsertStrategy::Incremental).await;
        let start = Instant::now();

        writer.schedule(A, "E1");
        sleep(Duration::from_millis(100)).await;
        writer.schedule(A, "E2");
        sleep(Duration::from_millis(100)).await;
        writer.schedule(A, "E3");
        sleep(Duration::from_millis(1000)).await;
        writer.flush().await;

        let writes = sandbox.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].content, "E3");
        assert!(writes[0].at.duration_since(start) >= Duration::from_millis(700));
        assert_eq!(store.get(A).await.unwrap().unwrap().content, "E3");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_written_before_the_quiet_interval() {
        let (writer, sandbox, _) = writer(UpsertStrategy::Replace).await;
        writer.schedule(A, "draft");
        sleep(Duration::from_millis(499)).await;
        assert!(sandbox.writes().is_empty());
        assert_eq!(writer.pending(), vec![A.to_string()]);
        sleep(Duration::from_millis(10)).await;
        writer.flush().await;
        assert_eq!(sandbox.file(A).as_deref(), Some("draft"));
        assert!(writer.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn files_debounce_independently() {
        let (writer, sandbox, store) = writer(UpsertStrategy::Replace).await;
        writer.schedule(A, "alpha");
        sleep(Duration::from_millis(200)).await;
        writer.schedule(B, "beta");
        sleep(Duration::from_millis(600)).await;
        writer.flush().await;

        assert_eq!(sandbox.file(A).as_deref(), Some("alpha"));
        assert_eq!(sandbox.file(B).as_deref(), Some("beta"));
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_commits_waiting_writes_immediately() {
        let (writer, sandbox, store) = writer(UpsertStrategy::Replace).await;
        writer.schedule(A, "unsaved");
        writer.flush().await;
        assert_eq!(sandbox.file(A).as_deref(), Some("unsaved"));
        assert_eq!(store.get(A).await.unwrap().unwrap().content, "unsaved");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sandbox_write_skips_the_store() {
        let (writer, sandbox, store) = writer(UpsertStrategy::Replace).await;
        sandbox.fail_writes_of(A);
        writer.schedule(A, "lost");
        sleep(Duration::from_millis(600)).await;
        writer.flush().await;
        assert!(store.get(A).await.unwrap().is_none());
    }
}
