// src/session.rs
// Owns the sandbox and store for one session and makes the single
// bootstrap-or-restore decision.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkbenchConfig;
use crate::db::{FileStore, StoreHandle, UpsertStrategy};
use crate::error::SessionError;
use crate::ignore_handler::EntryFilter;
use crate::locks::PathLocks;
use crate::mirror::{MirrorEngine, MirrorReport, RestoreReport};
use crate::paths;
use crate::sandbox::{Sandbox, SandboxBooter};
use crate::scan_tree::TreeProjector;
use crate::setup::{RunningServer, SetupOrchestrator, StatusReporter};
use crate::terminal::Terminal;
use crate::types::{MountTree, SetupStatus};
use crate::writeback::DebouncedWriter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootState {
    Uninitialized,
    Initializing,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Empty store: the project was set up and mirrored.
    Bootstrapped(MirrorReport),
    /// Stored files were written back; setup was skipped.
    Restored(RestoreReport),
    /// Another call already started (or is starting) this session.
    AlreadyStarted,
}

/// Handles shared with every component of a live session.
pub struct SessionServices {
    pub sandbox: Arc<dyn Sandbox>,
    pub store: StoreHandle,
    pub locks: PathLocks,
    pub projector: Arc<TreeProjector>,
    pub writer: Arc<DebouncedWriter>,
    pub mirror: MirrorEngine,
    pub filter: Arc<EntryFilter>,
    pub content_root: String,
}

impl SessionServices {
    /// True when `path` is a file the explorer shows and a restore brings back.
    pub fn is_editable(&self, path: &str) -> bool {
        !self.filter.excludes_under(&self.content_root, path, false)
            && paths::normalize(path) != paths::normalize(&self.content_root)
    }
}

struct Runtime {
    sandbox: Arc<dyn Sandbox>,
    services: Option<Arc<SessionServices>>,
    server: Option<RunningServer>,
    watch_task: Option<JoinHandle<()>>,
}

pub struct Session {
    config: WorkbenchConfig,
    booter: Arc<dyn SandboxBooter>,
    store: FileStore,
    terminal: Arc<dyn Terminal>,
    reporter: StatusReporter,
    initial_tree: MountTree,
    state: Mutex<BootState>,
    runtime: AsyncMutex<Option<Runtime>>,
    services: RwLock<Option<Arc<SessionServices>>>,
}

impl Session {
    pub fn new(
        config: WorkbenchConfig,
        booter: Arc<dyn SandboxBooter>,
        store: FileStore,
        terminal: Arc<dyn Terminal>,
    ) -> Self {
        Session {
            config,
            booter,
            store,
            terminal,
            reporter: StatusReporter::new(),
            initial_tree: MountTree::new(),
            state: Mutex::new(BootState::Uninitialized),
            runtime: AsyncMutex::new(None),
            services: RwLock::new(None),
        }
    }

    /// Tree mounted into the sandbox right after boot.
    pub fn with_initial_tree(mut self, tree: MountTree) -> Self {
        self.initial_tree = tree;
        self
    }

    pub fn config(&self) -> &WorkbenchConfig {
        &self.config
    }

    pub fn terminal(&self) -> Arc<dyn Terminal> {
        self.terminal.clone()
    }

    pub fn boot_state(&self) -> BootState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn status(&self) -> SetupStatus {
        self.reporter.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SetupStatus> {
        self.reporter.subscribe()
    }

    pub fn reporter(&self) -> &StatusReporter {
        &self.reporter
    }

    /// Live services; available as soon as the store is open, before setup finishes.
    pub fn services(&self) -> Result<Arc<SessionServices>, SessionError> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SessionError::NotReady)
    }

    fn set_state(&self, next: BootState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(from = ?*state, to = ?next, "boot state");
        *state = next;
    }

    /// Boots the session once. Concurrent or repeated calls return
    /// `AlreadyStarted`; a failed session must be `reset` first.
    pub async fn start(&self) -> Result<StartOutcome, SessionError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match &*state {
                BootState::Uninitialized => *state = BootState::Initializing,
                BootState::Initializing | BootState::Ready => {
                    debug!("session already started");
                    return Ok(StartOutcome::AlreadyStarted);
                }
                BootState::Failed(reason) => return Err(SessionError::Failed(reason.clone())),
            }
        }

        let mut runtime = self.runtime.lock().await;
        let result = self.boot(&mut runtime).await;
        match &result {
            Ok(outcome) => {
                info!(?outcome, "session ready");
                self.set_state(BootState::Ready);
            }
            Err(e) => {
                error!(error = %e, "session failed to start");
                self.set_state(BootState::Failed(e.to_string()));
            }
        }
        result
    }

    async fn boot(&self, slot: &mut Option<Runtime>) -> Result<StartOutcome, SessionError> {
        self.reporter.stage("Initializing sandbox...");
        self.reporter.progress(5);
        let sandbox = match self.booter.boot().await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                self.terminal.writeln_error(&format!("\r\nError: {}", e));
                self.reporter.stage(format!("Error: {}", e));
                return Err(e.into());
            }
        };
        *slot = Some(Runtime {
            sandbox: sandbox.clone(),
            services: None,
            server: None,
            watch_task: None,
        });
        self.reporter.progress(10);

        if !self.initial_tree.is_empty() {
            sandbox.mount(&self.initial_tree).await?;
        }

        let store = self.store.open()?;
        let content_root = self.config.project.content_root();
        let locks = PathLocks::new();
        let filter = Arc::new(EntryFilter::new(&content_root, &self.config.mirror.ignore));
        let strategy = if self.config.editor.incremental {
            UpsertStrategy::Incremental
        } else {
            UpsertStrategy::Replace
        };
        let services = Arc::new(SessionServices {
            sandbox: sandbox.clone(),
            store: store.clone(),
            locks: locks.clone(),
            projector: Arc::new(TreeProjector::new(
                sandbox.clone(),
                store.clone(),
                filter.clone(),
                locks.clone(),
                &content_root,
            )),
            writer: Arc::new(DebouncedWriter::new(
                sandbox.clone(),
                store.clone(),
                strategy,
                self.config.editor.quiet_interval(),
                locks.clone(),
            )),
            mirror: MirrorEngine::new(sandbox.clone(), store.clone(), locks, filter.clone()),
            filter,
            content_root: content_root.clone(),
        });
        *self.services.write().unwrap_or_else(PoisonError::into_inner) = Some(services.clone());
        let runtime = slot.as_mut().ok_or(SessionError::NotReady)?;
        runtime.services = Some(services.clone());

        let outcome = if store.is_empty().await? {
            info!("store is empty, running project setup");
            let orchestrator = SetupOrchestrator::new(
                sandbox.clone(),
                self.terminal.clone(),
                self.reporter.clone(),
                self.config.project.clone(),
                self.config.setup.clone(),
            )?;
            let projector = services.projector.clone();
            let server = orchestrator
                .run(|| async move {
                    projector.refresh().await;
                })
                .await?;
            runtime.server = Some(server);
            StartOutcome::Bootstrapped(services.mirror.mirror_to_store(&content_root).await)
        } else {
            info!("store has files, restoring without setup");
            let report = services.mirror.restore_from_store(&content_root).await?;
            self.terminal
                .writeln(&format!("\r\nRestored {} files from storage.", report.restored));
            self.reporter.stage(format!("Restored {} files from storage.", report.restored));
            self.reporter.set_loading(false);
            StartOutcome::Restored(report)
        };

        services.projector.refresh().await;
        match services.projector.watch() {
            Ok(task) => runtime.watch_task = Some(task),
            Err(e) => warn!(error = %e, "cannot watch content directory; tree refreshes on demand only"),
        }
        Ok(outcome)
    }

    /// URL of the running dev server, when this session started one.
    pub async fn preview_url(&self) -> Option<String> {
        let runtime = self.runtime.lock().await;
        runtime.as_ref()?.server.as_ref().map(|server| server.url().to_string())
    }

    /// Flushes pending edits, stops the sandbox and closes the store.
    pub async fn teardown(&self) {
        let taken = self.runtime.lock().await.take();
        if let Some(runtime) = taken {
            if let Some(services) = &runtime.services {
                services.writer.flush().await;
            }
            if let Some(task) = runtime.watch_task {
                task.abort();
            }
            drop(runtime.server);
            runtime.sandbox.teardown().await;
        }
        *self.services.write().unwrap_or_else(PoisonError::into_inner) = None;
        if let Err(e) = self.store.close() {
            warn!(error = %e, "failed to close store");
        }
        self.reporter.reset();
        self.set_state(BootState::Uninitialized);
        info!("session torn down");
    }

    /// Clears a failed boot so `start` can be retried. No-op in any other state.
    pub async fn reset(&self) -> bool {
        if !matches!(self.boot_state(), BootState::Failed(_)) {
            return false;
        }
        self.teardown().await;
        true
    }
}
