// src/sandbox/mod.rs
// The sandbox collaborator: a virtual file system plus process spawning.
// `local` backs it with a host directory, `memory` keeps everything in-process
// and is only built for tests (`test-util` feature for integration tests).

pub mod local;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::SandboxError;
use crate::types::{DirEntry, FsChange, MountTree, ServerReady, SpawnOptions, TerminalSize};

pub use local::{LocalBooter, LocalSandbox};
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryBooter, MemorySandbox, ProcessScript};

/// Exit code reported when a process vanished without reporting one.
pub const UNKNOWN_EXIT: i32 = -1;

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Writes an initial tree under the sandbox root.
    async fn mount(&self, tree: &MountTree) -> Result<(), SandboxError>;

    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<SandboxProcess, SandboxError>;

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError>;

    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    /// Fails when the parent directory does not exist.
    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SandboxError>;

    /// Subscribes to mutations under `path`. Dropping the handle unsubscribes.
    fn watch(&self, path: &str, recursive: bool) -> Result<WatchHandle, SandboxError>;

    /// Port-forwarding notifications ("server-ready").
    fn on_server_ready(&self) -> broadcast::Receiver<ServerReady>;

    /// Stops every process the sandbox started and rejects further calls.
    async fn teardown(&self);
}

#[async_trait]
pub trait SandboxBooter: Send + Sync {
    async fn boot(&self) -> Result<Arc<dyn Sandbox>, SandboxError>;
}

/// A spawned sandbox process. Output arrives as text chunks; the channels
/// close when the process stops writing.
pub struct SandboxProcess {
    pub output: mpsc::UnboundedReceiver<String>,
    pub stderr: mpsc::UnboundedReceiver<String>,
    pub exit: oneshot::Receiver<i32>,
    pub input: Option<mpsc::UnboundedSender<String>>,
    pub resize: Option<mpsc::UnboundedSender<TerminalSize>>,
    /// Stops the process; its exit code still arrives on `exit`. Dropping
    /// the sender leaves the process running.
    pub kill: Option<oneshot::Sender<()>>,
}

impl SandboxProcess {
    /// Asks the sandbox to stop the process. False if it was already asked
    /// or the process is gone.
    pub fn kill(&mut self) -> bool {
        self.kill.take().map_or(false, |kill| kill.send(()).is_ok())
    }
}

/// Awaits the exit code; a dropped sender counts as `UNKNOWN_EXIT`.
pub async fn exit_code(exit: oneshot::Receiver<i32>) -> i32 {
    exit.await.unwrap_or(UNKNOWN_EXIT)
}

/// Live change subscription on a sandbox path.
pub struct WatchHandle {
    events: mpsc::UnboundedReceiver<FsChange>,
    _guard: Box<dyn Any + Send>,
}

impl WatchHandle {
    pub fn new(events: mpsc::UnboundedReceiver<FsChange>, guard: Box<dyn Any + Send>) -> Self {
        WatchHandle { events, _guard: guard }
    }

    /// Next change; `None` once the sandbox stops reporting.
    pub async fn changed(&mut self) -> Option<FsChange> {
        self.events.recv().await
    }

    /// Discards changes already queued, returning how many were dropped.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.events.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}
