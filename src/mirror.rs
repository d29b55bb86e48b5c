// src/mirror.rs
// Copies file state between the live sandbox subtree and the store.
// sandbox → store on bootstrap, store → sandbox on restore; a session runs one or the other.

use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{EntryError, StoreError};
use crate::ignore_handler::EntryFilter;
use crate::locks::PathLocks;
use crate::paths;
use crate::sandbox::Sandbox;
use crate::db::StoreHandle;

const MAX_DEPTH: usize = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MirrorReport {
    pub files: usize,
    pub directories: usize,
    /// Hidden or ignored entries, not descended into.
    pub skipped: usize,
    pub failed: usize,
}

impl MirrorReport {
    /// Entries mirrored or walked.
    pub fn processed(&self) -> usize {
        self.files + self.directories
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: usize,
    /// Records outside the restored root.
    pub skipped: usize,
    pub failed: usize,
}

pub struct MirrorEngine {
    sandbox: Arc<dyn Sandbox>,
    store: StoreHandle,
    locks: PathLocks,
    filter: Arc<EntryFilter>,
}

impl MirrorEngine {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        store: StoreHandle,
        locks: PathLocks,
        filter: Arc<EntryFilter>,
    ) -> Self {
        MirrorEngine { sandbox, store, locks, filter }
    }

    /// Walks `root` depth-first and upserts every visible file by full path.
    /// Returns once every upsert has settled.
    pub async fn mirror_to_store(&self, root: &str) -> MirrorReport {
        let root = paths::normalize(root);
        let mut report = MirrorReport::default();
        let mut uploads: JoinSet<(String, Result<(), EntryError>)> = JoinSet::new();
        let mut stack = vec![(root.clone(), 0usize)];

        while let Some((dir, depth)) = stack.pop() {
            if depth > MAX_DEPTH {
                warn!(path = %dir, "directory nesting too deep, not descending");
                report.skipped += 1;
                continue;
            }
            let entries = match self.sandbox.read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %dir, error = %e, "failed to enumerate directory, skipping");
                    report.failed += 1;
                    continue;
                }
            };
            report.directories += 1;

            for entry in entries {
                let path = paths::join(&dir, &entry.name);
                if self.filter.excludes(&path, &entry.name, entry.is_dir()) {
                    debug!(path = %path, "skipping excluded entry");
                    report.skipped += 1;
                    continue;
                }
                if entry.is_dir() {
                    stack.push((path, depth + 1));
                    continue;
                }

                let sandbox = self.sandbox.clone();
                let store = self.store.clone();
                let locks = self.locks.clone();
                uploads.spawn(async move {
                    let result = async {
                        let _guard = locks.lock(&path).await;
                        let content = sandbox.read_file(&path).await?;
                        store.upsert(&path, &content).await?;
                        Ok::<(), EntryError>(())
                    }
                    .await;
                    (path, result)
                });
            }
        }

        while let Some(joined) = uploads.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.files += 1,
                Ok((path, Err(e))) => {
                    warn!(path = %path, error = %e, "failed to mirror file, skipping");
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "mirror task aborted");
                    report.failed += 1;
                }
            }
        }

        info!(
            root = %root,
            files = report.files,
            directories = report.directories,
            skipped = report.skipped,
            failed = report.failed,
            "mirrored sandbox to store"
        );
        report
    }

    /// Writes every stored record under `root` back into the sandbox,
    /// creating parent directories first. Fails only when the store cannot be read.
    pub async fn restore_from_store(&self, root: &str) -> Result<RestoreReport, StoreError> {
        let root = paths::normalize(root);
        let records = self.store.find_all().await?;
        let mut report = RestoreReport::default();

        for record in records {
            let path = paths::normalize(&record.path);
            if !paths::is_within(&path, &root) || path == root {
                debug!(path = %path, root = %root, "record outside restore root, skipping");
                report.skipped += 1;
                continue;
            }

            let _guard = self.locks.lock(&path).await;
            let result = async {
                if let Some(parent) = paths::parent(&path) {
                    self.sandbox.mkdir(&parent, true).await?;
                }
                self.sandbox.write_file(&path, &record.content).await
            }
            .await;

            match result {
                Ok(()) => report.restored += 1,
                Err(e) => {
                    warn!(path = %path, error = %e, "failed to restore record, skipping");
                    report.failed += 1;
                }
            }
        }

        info!(
            root = %root,
            restored = report.restored,
            skipped = report.skipped,
            failed = report.failed,
            "restored store into sandbox"
        );
        Ok(report)
    }
}
