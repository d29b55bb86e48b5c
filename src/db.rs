// src/db.rs
// Persistent store gateway: one SQLite table of FileRecords keyed by path.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::types::FileRecord;

pub const MEMORY_LOCATION: &str = ":memory:";
pub const DEFAULT_MAX_PATH_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    File(PathBuf),
}

impl StoreLocation {
    pub fn parse(raw: &str) -> Self {
        if raw == MEMORY_LOCATION {
            StoreLocation::Memory
        } else {
            StoreLocation::File(PathBuf::from(raw))
        }
    }
}

/// How a write reaches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpsertStrategy {
    /// One statement per call.
    #[default]
    Replace,
    /// Concurrent writes to the same path coalesce into one statement
    /// carrying the newest content.
    Incremental,
}

// Opens (or creates) the database at `location`.
fn init_connection(location: &StoreLocation) -> Result<Connection, StoreError> {
    match location {
        StoreLocation::Memory => Connection::open_in_memory()
            .map_err(|e| StoreError::Init(format!("failed to open in-memory database: {}", e))),
        StoreLocation::File(db_path) => {
            if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
                if !dir.exists() {
                    fs::create_dir_all(dir).map_err(|e| {
                        StoreError::Init(format!(
                            "failed to create directory for database '{}': {}",
                            dir.display(),
                            e
                        ))
                    })?;
                }
            }
            info!(path = %db_path.display(), "opening file store");
            Connection::open(db_path).map_err(|e| {
                StoreError::Init(format!("failed to open database at '{}': {}", db_path.display(), e))
            })
        }
    }
}

// Creates the files table if it doesn't exist. The CHECK mirrors the
// bounded-length rule enforced in `StoreHandle::check_path`.
fn init_db_tables(conn: &Connection, max_path_len: usize) -> Result<(), StoreError> {
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS workbench_files (
            path TEXT PRIMARY KEY NOT NULL CHECK (length(path) > 0 AND length(path) <= {max_path_len}),
            content TEXT NOT NULL,
            last_modified TEXT
        );
        "#
    ))
    .map_err(|e| StoreError::Init(format!("failed to initialize files table: {}", e)))?;
    debug!("files table initialized");
    Ok(())
}

fn map_row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        path: row.get(0)?,
        content: row.get(1)?,
        last_modified: row.get(2)?,
    })
}

/// Owns the lifecycle of the store. `open` is idempotent while the cached
/// handle is live; after `close` the next `open` builds a fresh handle.
pub struct FileStore {
    location: StoreLocation,
    max_path_len: usize,
    handle: Mutex<Option<StoreHandle>>,
}

impl FileStore {
    pub fn new(location: StoreLocation, max_path_len: usize) -> Self {
        FileStore { location, max_path_len, handle: Mutex::new(None) }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        FileStore::new(StoreLocation::parse(&config.path), config.max_path_len)
    }

    pub fn in_memory() -> Self {
        FileStore::new(StoreLocation::Memory, DEFAULT_MAX_PATH_LEN)
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    pub fn open(&self) -> Result<StoreHandle, StoreError> {
        let mut cached = self.handle.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(handle) = cached.as_ref() {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }
        let conn = init_connection(&self.location)?;
        init_db_tables(&conn, self.max_path_len)?;
        let handle = StoreHandle::new(conn, self.max_path_len);
        *cached = Some(handle.clone());
        Ok(handle)
    }

    /// Closes the cached handle, if any. Clones of it fail with `Closed` afterwards.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut cached = self.handle.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(handle) = cached.take() {
            handle.close()?;
            info!("file store closed");
        }
        Ok(())
    }
}

struct StoreInner {
    conn: Mutex<Option<Connection>>,
    max_path_len: usize,
    // Paths with an incremental write in flight; `Some` holds newer content
    // waiting for the in-flight writer to pick up.
    pending: Mutex<HashMap<String, Option<String>>>,
}

// Releases a path's in-flight marker when the writer future is dropped
// mid-write. Content already handed over by coalesced callers is still
// written, from a detached task.
struct PendingSlot<'a> {
    handle: &'a StoreHandle,
    path: &'a str,
    armed: bool,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let newer = self
            .handle
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.path)
            .flatten();
        let Some(newer) = newer else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = self.handle.clone();
                let path = self.path.to_string();
                runtime.spawn(async move {
                    if let Err(e) = handle.upsert(&path, &newer).await {
                        warn!(path = %path, error = %e, "deferred incremental upsert failed");
                    }
                });
            }
            Err(_) => warn!(path = self.path, "dropping coalesced content, no runtime to write it"),
        }
    }
}

/// Cheap, cloneable handle to an open store. Statements run on the blocking pool.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<StoreInner>,
}

impl StoreHandle {
    fn new(conn: Connection, max_path_len: usize) -> Self {
        StoreHandle {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(Some(conn)),
                max_path_len,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.conn.lock().map(|conn| conn.is_none()).unwrap_or(true)
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut conn = self.inner.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.take();
        Ok(())
    }

    fn check_path(&self, path: &str) -> Result<(), StoreError> {
        let max = self.inner.max_path_len;
        if path.is_empty() || path.chars().count() > max {
            return Err(StoreError::PathTooLong { path: path.to_string(), max });
        }
        Ok(())
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.inner.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let conn = guard.as_ref().ok_or(StoreError::Closed)?;
        f(conn)
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.with_conn(f))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Inserts or fully replaces the record at `path`.
    pub async fn upsert(&self, path: &str, content: &str) -> Result<FileRecord, StoreError> {
        self.check_path(path)?;
        let record = FileRecord {
            path: path.to_string(),
            content: content.to_string(),
            last_modified: Some(Utc::now().to_rfc3339()),
        };
        let row = record.clone();
        self.run(move |conn| {
            conn.execute(
                r#"
                INSERT INTO workbench_files (path, content, last_modified)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(path) DO UPDATE SET
                    content = excluded.content,
                    last_modified = excluded.last_modified
                "#,
                params![row.path, row.content, row.last_modified],
            )?;
            Ok(())
        })
        .await?;
        Ok(record)
    }

    /// Same observable result as `upsert`. A call arriving while another
    /// write to the same path is in flight hands its content to that writer
    /// and returns; the writer loops until no newer content is waiting.
    pub async fn incremental_upsert(&self, path: &str, content: &str) -> Result<(), StoreError> {
        self.check_path(path)?;
        {
            let mut pending = self.inner.pending.lock().map_err(|_| StoreError::Poisoned)?;
            if let Some(slot) = pending.get_mut(path) {
                *slot = Some(content.to_string());
                debug!(path, "coalesced incremental upsert");
                return Ok(());
            }
            pending.insert(path.to_string(), None);
        }
        let mut slot = PendingSlot { handle: self, path, armed: true };

        let mut next = content.to_string();
        loop {
            let result = self.upsert(path, &next).await;
            let mut pending = self.inner.pending.lock().map_err(|_| StoreError::Poisoned)?;
            match (result, pending.get_mut(path).and_then(Option::take)) {
                // Newer content was accepted from a coalesced caller; it still has to land.
                (Err(e), Some(newer)) => {
                    warn!(path, error = %e, "incremental upsert failed, retrying with newer content");
                    next = newer;
                }
                (Ok(_), Some(newer)) => next = newer,
                (result, None) => {
                    pending.remove(path);
                    slot.armed = false;
                    return result.map(|_| ());
                }
            }
        }
    }

    pub async fn upsert_with(
        &self,
        strategy: UpsertStrategy,
        path: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        match strategy {
            UpsertStrategy::Replace => self.upsert(path, content).await.map(|_| ()),
            UpsertStrategy::Incremental => self.incremental_upsert(path, content).await,
        }
    }

    /// Snapshot of every record, in no particular order.
    pub async fn find_all(&self) -> Result<Vec<FileRecord>, StoreError> {
        self.run(|conn| {
            let mut stmt =
                conn.prepare("SELECT path, content, last_modified FROM workbench_files")?;
            let rows = stmt.query_map([], map_row_to_record)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await
    }

    pub async fn get(&self, path: &str) -> Result<Option<FileRecord>, StoreError> {
        let path = path.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT path, content, last_modified FROM workbench_files WHERE path = ?1",
                    params![path],
                    map_row_to_record,
                )
                .optional()?)
        })
        .await
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        self.run(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM workbench_files", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.count().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn upsert_replaces_instead_of_duplicating() {
        let store = FileStore::in_memory();
        let handle = store.open().unwrap();
        handle.upsert("/docs/a.md", "one").await.unwrap();
        handle.upsert("/docs/a.md", "two").await.unwrap();
        handle.upsert("/docs/b.md", "three").await.unwrap();

        let records = handle.find_all().await.unwrap();
        assert_eq!(records.len(), 2);
        let paths: HashSet<_> = records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths.len(), records.len());
        let a = handle.get("/docs/a.md").await.unwrap().unwrap();
        assert_eq!(a.content, "two");
        assert!(a.last_modified.is_some());
    }

    #[tokio::test]
    async fn open_is_idempotent_until_closed() {
        let store = FileStore::in_memory();
        let first = store.open().unwrap();
        first.upsert("/docs/a.md", "kept").await.unwrap();
        let second = store.open().unwrap();
        assert_eq!(second.count().await.unwrap(), 1);

        store.close().unwrap();
        assert!(first.is_closed());
        assert!(matches!(first.find_all().await, Err(StoreError::Closed)));
        assert!(matches!(second.upsert("/docs/b.md", "x").await, Err(StoreError::Closed)));

        // A fresh in-memory handle starts empty.
        let third = store.open().unwrap();
        assert!(third.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("workbench.db");
        let store = FileStore::new(StoreLocation::File(db_path.clone()), DEFAULT_MAX_PATH_LEN);
        store.open().unwrap().upsert("/docs/intro.md", "# Hi").await.unwrap();
        store.close().unwrap();

        let reopened = FileStore::new(StoreLocation::File(db_path), DEFAULT_MAX_PATH_LEN);
        let records = reopened.open().unwrap().find_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "# Hi");
    }

    #[tokio::test]
    async fn rejects_paths_over_the_bound() {
        let store = FileStore::new(StoreLocation::Memory, 10);
        let handle = store.open().unwrap();
        let err = handle.upsert("/docs/very-long-name.md", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::PathTooLong { max: 10, .. }));
        assert!(handle.upsert("", "x").await.is_err());
        assert!(handle.is_empty().await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn incremental_upserts_coalesce_to_last_write() {
        let store = FileStore::in_memory();
        let handle = store.open().unwrap();
        let mut tasks = Vec::new();
        for i in 0..20 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle
                    .upsert_with(UpsertStrategy::Incremental, "/docs/hot.md", &format!("v{i}"))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        handle.incremental_upsert("/docs/hot.md", "final").await.unwrap();

        let records = handle.find_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "final");
    }

    // Holds an exclusive lock from a second connection so writes through
    // `handle` stay in flight until `COMMIT`.
    fn locked_file_store(dir: &tempfile::TempDir) -> (StoreHandle, Connection) {
        let db_path = dir.path().join("workbench.db");
        let store = FileStore::new(StoreLocation::File(db_path.clone()), DEFAULT_MAX_PATH_LEN);
        let handle = store.open().unwrap();
        let blocker = Connection::open(&db_path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();
        (handle, blocker)
    }

    async fn wait_in_flight(handle: &StoreHandle, path: &str) {
        for _ in 0..200 {
            if handle.inner.pending.lock().unwrap().contains_key(path) {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("incremental write for {path} never started");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_incremental_write_does_not_block_later_ones() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, blocker) = locked_file_store(&dir);

        let writer = handle.clone();
        let task = tokio::spawn(async move { writer.incremental_upsert("/docs/a.md", "first").await });
        wait_in_flight(&handle, "/docs/a.md").await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(handle.inner.pending.lock().unwrap().is_empty());

        blocker.execute_batch("COMMIT").unwrap();
        handle.incremental_upsert("/docs/a.md", "second").await.unwrap();
        let stored = handle.get("/docs/a.md").await.unwrap().map(|r| r.content);
        assert_eq!(stored.as_deref(), Some("second"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn coalesced_content_lands_after_the_writer_is_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, blocker) = locked_file_store(&dir);

        let writer = handle.clone();
        let task = tokio::spawn(async move { writer.incremental_upsert("/docs/a.md", "first").await });
        wait_in_flight(&handle, "/docs/a.md").await;
        handle.incremental_upsert("/docs/a.md", "newer").await.unwrap();
        task.abort();
        let _ = task.await;

        blocker.execute_batch("COMMIT").unwrap();
        let mut stored = None;
        for _ in 0..200 {
            stored = handle.get("/docs/a.md").await.unwrap().map(|r| r.content);
            if stored.as_deref() == Some("newer") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(stored.as_deref(), Some("newer"));
    }

    #[tokio::test]
    async fn concurrent_distinct_paths_all_land() {
        let store = FileStore::in_memory();
        let handle = store.open().unwrap();
        let mut set = tokio::task::JoinSet::new();
        for i in 0..10 {
            let handle = handle.clone();
            set.spawn(async move { handle.upsert(&format!("/docs/{i}.md"), "x").await });
        }
        while let Some(result) = set.join_next().await {
            result.unwrap().unwrap();
        }
        assert_eq!(handle.count().await.unwrap(), 10);
    }
}
