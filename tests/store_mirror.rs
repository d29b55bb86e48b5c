// tests/store_mirror.rs
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use docs_workbench_lib::db::{StoreLocation, UpsertStrategy};
use docs_workbench_lib::ignore_handler::EntryFilter;
use docs_workbench_lib::locks::PathLocks;
use docs_workbench_lib::mirror::MirrorEngine;
use docs_workbench_lib::sandbox::{MemoryBooter, MemorySandbox};
use docs_workbench_lib::terminal::BufferTerminal;
use docs_workbench_lib::writeback::DebouncedWriter;
use docs_workbench_lib::{FileStore, Session, StartOutcome, Workbench, WorkbenchConfig};

const ROOT: &str = "/my-docs2/docs";

#[tokio::test]
async fn mirror_then_restore_reproduces_visible_tree() {
    let source = Arc::new(MemorySandbox::new());
    source.seed_file("/my-docs2/docs/intro.md", "# Intro\n\nWelcome.");
    source.seed_file("/my-docs2/docs/tutorial/basics/page.mdx", "<Page />");
    source.seed_file("/my-docs2/docs/tutorial/_category_.json", "{\"label\":\"Tutorial\"}");
    source.seed_file("/my-docs2/docs/.DS_Store", "junk");
    source.seed_file("/my-docs2/docs/tutorial/.drafts/wip.md", "wip");

    let store = FileStore::in_memory().open().unwrap();
    let filter = Arc::new(EntryFilter::hidden_only());
    let mirror = MirrorEngine::new(source.clone(), store.clone(), PathLocks::new(), filter.clone());
    let report = mirror.mirror_to_store(ROOT).await;
    assert_eq!(report.files, 3);

    let target = Arc::new(MemorySandbox::new());
    let restore = MirrorEngine::new(target.clone(), store.clone(), PathLocks::new(), filter);
    let restored = restore.restore_from_store(ROOT).await.unwrap();
    assert_eq!(restored.restored, 3);

    let mut expected = source.files_under(ROOT);
    expected.retain(|path, _| !path.split('/').any(|segment| segment.starts_with('.')));
    assert_eq!(target.files_under(ROOT), expected);

    let again = restore.restore_from_store(ROOT).await.unwrap();
    assert_eq!(again, restored);
    assert_eq!(target.files_under(ROOT), expected);
}

#[tokio::test]
async fn records_stay_unique_per_path() {
    let store = FileStore::in_memory().open().unwrap();
    for round in 0..3 {
        store.upsert("/my-docs2/docs/a.md", &format!("a{round}")).await.unwrap();
        store.incremental_upsert("/my-docs2/docs/b.md", &format!("b{round}")).await.unwrap();
    }
    let records = store.find_all().await.unwrap();
    let distinct: HashSet<&str> = records.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(records.len(), distinct.len());
    assert_eq!(records.len(), 2);
    assert_eq!(store.get("/my-docs2/docs/b.md").await.unwrap().unwrap().content, "b2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_back_and_mirror_wait_for_the_path_lock() {
    let sandbox = Arc::new(MemorySandbox::new());
    sandbox.seed_file("/my-docs2/docs/intro.md", "seeded");
    let store = FileStore::in_memory().open().unwrap();
    let locks = PathLocks::new();
    let filter = Arc::new(EntryFilter::hidden_only());
    let writer = DebouncedWriter::new(
        sandbox.clone(),
        store.clone(),
        UpsertStrategy::Incremental,
        Duration::from_millis(20),
        locks.clone(),
    );
    let mirror = MirrorEngine::new(sandbox.clone(), store.clone(), locks.clone(), filter);

    let guard = locks.lock("/my-docs2/docs/intro.md").await;
    let mirror_pass = tokio::spawn(async move { mirror.mirror_to_store(ROOT).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    writer.schedule("/my-docs2/docs/intro.md", "edited");
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(!mirror_pass.is_finished());
    assert!(sandbox.writes().is_empty());
    assert!(store.is_empty().await.unwrap());
    assert_eq!(sandbox.file("/my-docs2/docs/intro.md").as_deref(), Some("seeded"));

    drop(guard);
    let report = mirror_pass.await.unwrap();
    writer.flush().await;

    // Waiters are served in arrival order: the mirror copies the seeded text,
    // then the edit replaces it in both places.
    assert_eq!(report.files, 1);
    assert_eq!(sandbox.file("/my-docs2/docs/intro.md").as_deref(), Some("edited"));
    assert_eq!(store.get("/my-docs2/docs/intro.md").await.unwrap().unwrap().content, "edited");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restore_waits_for_the_path_lock() {
    let store = FileStore::in_memory().open().unwrap();
    store.upsert("/my-docs2/docs/intro.md", "stored").await.unwrap();
    let sandbox = Arc::new(MemorySandbox::new());
    let locks = PathLocks::new();
    let restore = MirrorEngine::new(
        sandbox.clone(),
        store,
        locks.clone(),
        Arc::new(EntryFilter::hidden_only()),
    );

    let guard = locks.lock("/my-docs2/docs/intro.md").await;
    let pass = tokio::spawn(async move { restore.restore_from_store(ROOT).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pass.is_finished());
    assert_eq!(sandbox.file("/my-docs2/docs/intro.md"), None);

    drop(guard);
    assert_eq!(pass.await.unwrap().unwrap().restored, 1);
    assert_eq!(sandbox.file("/my-docs2/docs/intro.md").as_deref(), Some("stored"));
}

fn session_on(db: &std::path::Path, sandbox: Arc<MemorySandbox>) -> Arc<Session> {
    let store = FileStore::new(StoreLocation::File(db.to_path_buf()), 100);
    Arc::new(Session::new(
        WorkbenchConfig::default(),
        Arc::new(MemoryBooter::new(sandbox)),
        store,
        Arc::new(BufferTerminal::new()),
    ))
}

#[tokio::test(start_paused = true)]
async fn edits_survive_a_reload() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("workbench.db");
    {
        let seed = FileStore::new(StoreLocation::File(db.clone()), 100);
        seed.open().unwrap().upsert("/my-docs2/docs/intro.md", "v1").await.unwrap();
        seed.close().unwrap();
    }

    let first = session_on(&db, Arc::new(MemorySandbox::new()));
    assert!(matches!(first.start().await.unwrap(), StartOutcome::Restored(_)));
    let workbench = Workbench::new(first.clone());
    workbench.select_file("/my-docs2/docs/intro.md").await.unwrap();
    workbench.edit_current("v2").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    // Teardown flushes the edit that is still inside its quiet interval.
    first.teardown().await;

    let sandbox = Arc::new(MemorySandbox::new());
    let second = session_on(&db, sandbox.clone());
    assert!(matches!(second.start().await.unwrap(), StartOutcome::Restored(_)));
    assert_eq!(sandbox.file("/my-docs2/docs/intro.md").as_deref(), Some("v2"));
    assert!(sandbox.spawned().is_empty());
    second.teardown().await;
}
