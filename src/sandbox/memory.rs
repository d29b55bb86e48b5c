// src/sandbox/memory.rs
// In-process sandbox: a path-keyed map for the file system and scripted
// processes. Used for dry runs and as the test double for every component.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

use super::{Sandbox, SandboxBooter, SandboxProcess, WatchHandle};
use crate::error::SandboxError;
use crate::paths;
use crate::types::{
    DirEntry, FsChange, MountEntry, MountTree, ServerReady, SpawnOptions, TerminalSize,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    File(String),
    Directory,
}

/// What a scripted command does when spawned.
#[derive(Debug, Clone, Default)]
pub struct ProcessScript {
    /// Files (full virtual path, content) created before any output; parents are created.
    pub creates: Vec<(String, String)>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// Delay before each stdout chunk.
    pub chunk_delay: Option<Duration>,
    /// Announced on the server-ready channel after output.
    pub server_ready: Option<ServerReady>,
    /// `None` keeps the process running until teardown.
    pub exit_code: Option<i32>,
    /// Echo everything written to stdin back on stdout.
    pub echo_input: bool,
}

impl ProcessScript {
    pub fn exits(code: i32) -> Self {
        ProcessScript { exit_code: Some(code), ..ProcessScript::default() }
    }

    pub fn long_running() -> Self {
        ProcessScript::default()
    }

    pub fn with_stdout(mut self, chunk: impl Into<String>) -> Self {
        self.stdout.push(chunk.into());
        self
    }

    pub fn with_stderr(mut self, chunk: impl Into<String>) -> Self {
        self.stderr.push(chunk.into());
        self
    }

    pub fn creating(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.creates.push((path.into(), content.into()));
        self
    }

    pub fn announcing(mut self, ready: ServerReady) -> Self {
        self.server_ready = Some(ready);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn echoing_input(mut self) -> Self {
        self.echo_input = true;
        self
    }
}

/// A write observed by the memory sandbox, stamped with tokio time.
#[derive(Debug, Clone)]
pub struct WriteLog {
    pub path: String,
    pub content: String,
    pub at: Instant,
}

struct Watcher {
    id: u64,
    root: String,
    recursive: bool,
    tx: mpsc::UnboundedSender<FsChange>,
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    scripts: HashMap<String, ProcessScript>,
    spawned: Vec<(String, Option<String>)>,
    writes: Vec<WriteLog>,
    fail_reads: HashSet<String>,
    fail_writes: HashSet<String>,
    watchers: Vec<Watcher>,
    // Exit senders of long-running processes, released on kill or teardown.
    running: Vec<(u64, oneshot::Sender<i32>)>,
    next_process: u64,
    // Kills that arrived before the process settled into `running`.
    kill_requested: HashSet<u64>,
    killed: Vec<String>,
    resizes: Vec<TerminalSize>,
}

pub struct MemorySandbox {
    state: Arc<Mutex<State>>,
    server_ready: broadcast::Sender<ServerReady>,
    next_watch: AtomicU64,
    torn_down: AtomicBool,
}

impl Default for MemorySandbox {
    fn default() -> Self {
        MemorySandbox::new()
    }
}

fn command_line(command: &str, args: &[String]) -> String {
    let mut line = command.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

impl MemorySandbox {
    pub fn new() -> Self {
        let mut state = State::default();
        state.nodes.insert(paths::ROOT.to_string(), Node::Directory);
        let (server_ready, _) = broadcast::channel(8);
        MemorySandbox {
            state: Arc::new(Mutex::new(state)),
            server_ready,
            next_watch: AtomicU64::new(1),
            torn_down: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_live(&self) -> Result<(), SandboxError> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(SandboxError::TornDown);
        }
        Ok(())
    }

    /// Registers the behaviour of `command_line` ("npm install", ...).
    pub fn script(&self, command_line: &str, script: ProcessScript) {
        self.lock().scripts.insert(command_line.to_string(), script);
    }

    /// Makes reads of `path` fail with an I/O error.
    pub fn fail_reads_of(&self, path: &str) {
        self.lock().fail_reads.insert(paths::normalize(path));
    }

    /// Makes writes of `path` fail with an I/O error.
    pub fn fail_writes_of(&self, path: &str) {
        self.lock().fail_writes.insert(paths::normalize(path));
    }

    /// Creates `path` and its parents directly, notifying watchers.
    pub fn seed_file(&self, path: &str, content: &str) {
        let mut state = self.lock();
        let path = paths::normalize(path);
        create_parents(&mut state, &path);
        state.nodes.insert(path.clone(), Node::File(content.to_string()));
        notify(&mut state, &path);
    }

    pub fn file(&self, path: &str) -> Option<String> {
        match self.lock().nodes.get(&paths::normalize(path)) {
            Some(Node::File(content)) => Some(content.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.lock().nodes.get(&paths::normalize(path)), Some(Node::Directory))
    }

    /// Every file under `root`, path → content.
    pub fn files_under(&self, root: &str) -> BTreeMap<String, String> {
        self.lock()
            .nodes
            .iter()
            .filter(|(path, _)| paths::is_within(path, root))
            .filter_map(|(path, node)| match node {
                Node::File(content) => Some((path.clone(), content.clone())),
                Node::Directory => None,
            })
            .collect()
    }

    /// Command lines spawned so far, in order.
    pub fn spawned(&self) -> Vec<String> {
        self.lock().spawned.iter().map(|(line, _)| line.clone()).collect()
    }

    pub fn spawned_with_cwd(&self) -> Vec<(String, Option<String>)> {
        self.lock().spawned.clone()
    }

    pub fn writes(&self) -> Vec<WriteLog> {
        self.lock().writes.clone()
    }

    /// Command lines of processes that were asked to stop.
    pub fn killed(&self) -> Vec<String> {
        self.lock().killed.clone()
    }

    pub fn resizes(&self) -> Vec<TerminalSize> {
        self.lock().resizes.clone()
    }

    pub fn watcher_count(&self) -> usize {
        self.lock().watchers.len()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Emits a port-forwarding notification as the real sandbox would.
    pub fn announce(&self, ready: ServerReady) {
        let _ = self.server_ready.send(ready);
    }
}

fn create_parents(state: &mut State, path: &str) {
    let mut missing = Vec::new();
    let mut cursor = paths::parent(path);
    while let Some(dir) = cursor {
        if state.nodes.contains_key(&dir) {
            break;
        }
        cursor = paths::parent(&dir);
        missing.push(dir);
    }
    for dir in missing.into_iter().rev() {
        state.nodes.insert(dir.clone(), Node::Directory);
        notify(state, &dir);
    }
}

fn notify(state: &mut State, path: &str) {
    state.watchers.retain(|watcher| {
        let hit = if watcher.recursive {
            paths::is_within(path, &watcher.root)
        } else {
            paths::parent(path).as_deref() == Some(watcher.root.as_str()) || path == watcher.root
        };
        !hit || watcher.tx.send(FsChange { path: path.to_string() }).is_ok()
    });
}

fn injected(path: &str) -> SandboxError {
    SandboxError::Io {
        path: path.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::Other, "injected failure"),
    }
}

struct WatchGuard {
    id: u64,
    state: Arc<Mutex<State>>,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.watchers.retain(|watcher| watcher.id != self.id);
    }
}

#[async_trait]
impl Sandbox for MemorySandbox {
    async fn mount(&self, tree: &MountTree) -> Result<(), SandboxError> {
        self.ensure_live()?;
        let mut state = self.lock();
        let mut stack: Vec<(String, &MountTree)> = vec![(paths::ROOT.to_string(), tree)];
        while let Some((dir, entries)) = stack.pop() {
            for (name, entry) in entries {
                let path = paths::join(&dir, name);
                match entry {
                    MountEntry::File { contents } => {
                        create_parents(&mut state, &path);
                        state.nodes.insert(path.clone(), Node::File(contents.clone()));
                        notify(&mut state, &path);
                    }
                    MountEntry::Directory { entries } => {
                        create_parents(&mut state, &path);
                        state.nodes.insert(path.clone(), Node::Directory);
                        notify(&mut state, &path);
                        stack.push((path, entries));
                    }
                }
            }
        }
        Ok(())
    }

    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<SandboxProcess, SandboxError> {
        self.ensure_live()?;
        let line = command_line(command, args);
        let (id, script) = {
            let mut state = self.lock();
            let script = state.scripts.get(&line).cloned().ok_or_else(|| SandboxError::Spawn {
                command: line.clone(),
                reason: "command not found".to_string(),
            })?;
            state.spawned.push((line.clone(), options.cwd.clone()));
            state.next_process += 1;
            for (path, content) in &script.creates {
                let path = paths::normalize(path);
                create_parents(&mut state, &path);
                state.nodes.insert(path.clone(), Node::File(content.clone()));
                notify(&mut state, &path);
            }
            (state.next_process, script)
        };
        debug!(command = %line, "memory sandbox spawn");

        let (out_tx, output) = mpsc::unbounded_channel();
        let (err_tx, stderr) = mpsc::unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();
        let (in_tx, mut in_rx) = mpsc::unbounded_channel::<String>();
        let (resize_tx, mut resize_rx) = mpsc::unbounded_channel::<TerminalSize>();

        let resize_state = self.state.clone();
        tokio::spawn(async move {
            while let Some(size) = resize_rx.recv().await {
                resize_state.lock().unwrap_or_else(PoisonError::into_inner).resizes.push(size);
            }
        });

        let (kill, kill_rx) = oneshot::channel::<()>();
        let kill_state = self.state.clone();
        let kill_line = line.clone();
        tokio::spawn(async move {
            if kill_rx.await.is_err() {
                return;
            }
            let mut state = kill_state.lock().unwrap_or_else(PoisonError::into_inner);
            state.killed.push(kill_line);
            match state.running.iter().position(|(pid, _)| *pid == id) {
                Some(index) => {
                    let (_, exit) = state.running.remove(index);
                    let _ = exit.send(crate::sandbox::UNKNOWN_EXIT);
                }
                None => {
                    state.kill_requested.insert(id);
                }
            }
        });

        let state = self.state.clone();
        let server_ready = self.server_ready.clone();
        tokio::spawn(async move {
            for chunk in &script.stderr {
                let _ = err_tx.send(chunk.clone());
            }
            drop(err_tx);
            for chunk in &script.stdout {
                if let Some(delay) = script.chunk_delay {
                    tokio::time::sleep(delay).await;
                }
                let _ = out_tx.send(chunk.clone());
            }
            if let Some(ready) = script.server_ready.clone() {
                let _ = server_ready.send(ready);
            }
            match script.exit_code {
                Some(code) => {
                    drop(out_tx);
                    let _ = exit_tx.send(code);
                }
                None => {
                    {
                        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                        if state.kill_requested.remove(&id) {
                            let _ = exit_tx.send(crate::sandbox::UNKNOWN_EXIT);
                            return;
                        }
                        state.running.push((id, exit_tx));
                    }
                    if script.echo_input {
                        while let Some(data) = in_rx.recv().await {
                            if out_tx.send(data).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(SandboxProcess {
            output,
            stderr,
            exit,
            input: Some(in_tx),
            resize: Some(resize_tx),
            kill: Some(kill),
        })
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError> {
        self.ensure_live()?;
        let dir = paths::normalize(path);
        let state = self.lock();
        if state.fail_reads.contains(&dir) {
            return Err(injected(&dir));
        }
        match state.nodes.get(&dir) {
            Some(Node::Directory) => {}
            Some(Node::File(_)) => return Err(SandboxError::NotADirectory(dir)),
            None => return Err(SandboxError::NotFound(dir)),
        }
        let entries = state
            .nodes
            .iter()
            .filter(|(candidate, _)| paths::parent(candidate).as_deref() == Some(dir.as_str()))
            .map(|(candidate, node)| {
                let name = paths::file_name(candidate).to_string();
                match node {
                    Node::Directory => DirEntry::directory(name),
                    Node::File(_) => DirEntry::file(name),
                }
            })
            .collect();
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.ensure_live()?;
        let path = paths::normalize(path);
        let state = self.lock();
        if state.fail_reads.contains(&path) {
            return Err(injected(&path));
        }
        match state.nodes.get(&path) {
            Some(Node::File(content)) => Ok(content.clone()),
            Some(Node::Directory) => Err(SandboxError::IsDirectory(path)),
            None => Err(SandboxError::NotFound(path)),
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.ensure_live()?;
        let path = paths::normalize(path);
        let mut state = self.lock();
        if state.fail_writes.contains(&path) {
            return Err(injected(&path));
        }
        match paths::parent(&path).and_then(|parent| state.nodes.get(&parent).cloned()) {
            Some(Node::Directory) => {}
            Some(Node::File(_)) => return Err(SandboxError::NotADirectory(path)),
            None => return Err(SandboxError::NotFound(path)),
        }
        if matches!(state.nodes.get(&path), Some(Node::Directory)) {
            return Err(SandboxError::IsDirectory(path));
        }
        state.nodes.insert(path.clone(), Node::File(content.to_string()));
        state.writes.push(WriteLog { path: path.clone(), content: content.to_string(), at: Instant::now() });
        notify(&mut state, &path);
        Ok(())
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SandboxError> {
        self.ensure_live()?;
        let path = paths::normalize(path);
        let mut state = self.lock();
        if state.fail_writes.contains(&path) {
            return Err(injected(&path));
        }
        match state.nodes.get(&path) {
            Some(Node::Directory) if recursive => return Ok(()),
            Some(Node::Directory) => return Err(SandboxError::AlreadyExists(path)),
            Some(Node::File(_)) => return Err(SandboxError::AlreadyExists(path)),
            None => {}
        }
        // A file somewhere on the way down blocks directory creation.
        let mut cursor = paths::parent(&path);
        while let Some(dir) = cursor {
            if matches!(state.nodes.get(&dir), Some(Node::File(_))) {
                return Err(SandboxError::NotADirectory(dir));
            }
            cursor = paths::parent(&dir);
        }
        if recursive {
            create_parents(&mut state, &path);
        } else if paths::parent(&path).map_or(true, |parent| !state.nodes.contains_key(&parent)) {
            return Err(SandboxError::NotFound(path));
        }
        state.nodes.insert(path.clone(), Node::Directory);
        notify(&mut state, &path);
        Ok(())
    }

    fn watch(&self, path: &str, recursive: bool) -> Result<WatchHandle, SandboxError> {
        self.ensure_live()?;
        let root = paths::normalize(path);
        let mut state = self.lock();
        if !matches!(state.nodes.get(&root), Some(Node::Directory)) {
            return Err(SandboxError::Watch { path: root, reason: "not a directory".to_string() });
        }
        let id = self.next_watch.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.push(Watcher { id, root, recursive, tx });
        Ok(WatchHandle::new(rx, Box::new(WatchGuard { id, state: self.state.clone() })))
    }

    fn on_server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.server_ready.subscribe()
    }

    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.lock();
        state.watchers.clear();
        for (_, exit) in state.running.drain(..) {
            let _ = exit.send(crate::sandbox::UNKNOWN_EXIT);
        }
    }
}

/// Boots (hands out) a shared `MemorySandbox`; can be told to fail.
pub struct MemoryBooter {
    sandbox: Arc<MemorySandbox>,
    fail_next: AtomicUsize,
    boots: AtomicUsize,
}

impl MemoryBooter {
    pub fn new(sandbox: Arc<MemorySandbox>) -> Self {
        MemoryBooter { sandbox, fail_next: AtomicUsize::new(0), boots: AtomicUsize::new(0) }
    }

    /// The next `count` boots fail with `SandboxError::Boot`.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn boots(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxBooter for MemoryBooter {
    async fn boot(&self) -> Result<Arc<dyn Sandbox>, SandboxError> {
        self.boots.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SandboxError::Boot("memory sandbox refused to boot".to_string()));
        }
        Ok(self.sandbox.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::exit_code;

    #[tokio::test]
    async fn write_requires_parent_and_mkdir_creates_it() {
        let sandbox = MemorySandbox::new();
        assert!(matches!(
            sandbox.write_file("/docs/a.md", "x").await,
            Err(SandboxError::NotFound(_))
        ));
        sandbox.mkdir("/docs/deep/er", true).await.unwrap();
        sandbox.write_file("/docs/deep/er/a.md", "x").await.unwrap();
        assert_eq!(sandbox.file("/docs/deep/er/a.md").as_deref(), Some("x"));
        assert!(sandbox.is_dir("/docs/deep"));
        assert!(sandbox.mkdir("/docs", false).await.is_err());
    }

    #[tokio::test]
    async fn read_dir_lists_direct_children_only() {
        let sandbox = MemorySandbox::new();
        sandbox.seed_file("/docs/a.md", "A");
        sandbox.seed_file("/docs/sub/b.md", "B");
        let mut entries = sandbox.read_dir("/docs/").await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries, vec![DirEntry::file("a.md"), DirEntry::directory("sub")]);
        assert!(matches!(sandbox.read_dir("/missing").await, Err(SandboxError::NotFound(_))));
    }

    #[tokio::test]
    async fn scripted_process_streams_and_exits() {
        let sandbox = MemorySandbox::new();
        sandbox.script(
            "npm install",
            ProcessScript::exits(0).with_stdout("added 12 packages").with_stderr("warn deprecated"),
        );
        let mut process = sandbox
            .spawn("npm", &["install".to_string()], SpawnOptions::in_dir("/my-docs2"))
            .await
            .unwrap();
        assert_eq!(process.output.recv().await.as_deref(), Some("added 12 packages"));
        assert_eq!(process.stderr.recv().await.as_deref(), Some("warn deprecated"));
        assert_eq!(exit_code(process.exit).await, 0);
        assert_eq!(
            sandbox.spawned_with_cwd(),
            vec![("npm install".to_string(), Some("/my-docs2".to_string()))]
        );
    }

    #[tokio::test]
    async fn unscripted_command_fails_to_spawn() {
        let sandbox = MemorySandbox::new();
        let result = sandbox.spawn("npm", &["start".to_string()], SpawnOptions::default()).await;
        assert!(matches!(result, Err(SandboxError::Spawn { .. })));
    }

    #[tokio::test]
    async fn watchers_see_nested_changes_until_dropped() {
        let sandbox = MemorySandbox::new();
        sandbox.mkdir("/docs", true).await.unwrap();
        let mut handle = sandbox.watch("/docs", true).unwrap();
        sandbox.seed_file("/docs/a/b.md", "x");
        assert_eq!(handle.changed().await.unwrap().path, "/docs/a");
        assert_eq!(handle.drain(), 1);
        drop(handle);
        assert_eq!(sandbox.watcher_count(), 0);
    }

    #[tokio::test]
    async fn kill_stops_a_long_running_process() {
        let sandbox = MemorySandbox::new();
        sandbox.script("npm start", ProcessScript::long_running());
        let mut process = sandbox.spawn("npm", &["start".to_string()], SpawnOptions::default()).await.unwrap();
        assert!(process.kill());
        assert!(!process.kill());
        assert_eq!(exit_code(process.exit).await, crate::sandbox::UNKNOWN_EXIT);
        assert_eq!(sandbox.killed(), vec!["npm start".to_string()]);
    }

    #[tokio::test]
    async fn teardown_releases_long_running_processes() {
        let sandbox = MemorySandbox::new();
        sandbox.script("npm start", ProcessScript::long_running().with_stdout("starting"));
        let process = sandbox.spawn("npm", &["start".to_string()], SpawnOptions::default()).await.unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        sandbox.teardown().await;
        assert_eq!(exit_code(process.exit).await, crate::sandbox::UNKNOWN_EXIT);
        assert!(matches!(sandbox.read_file("/x").await, Err(SandboxError::TornDown)));
    }

    #[tokio::test]
    async fn booter_can_fail_once() {
        let booter = MemoryBooter::new(Arc::new(MemorySandbox::new()));
        booter.fail_next(1);
        assert!(booter.boot().await.is_err());
        assert!(booter.boot().await.is_ok());
        assert_eq!(booter.boots(), 2);
    }
}
