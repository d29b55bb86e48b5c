// src/sandbox/local.rs
// Host-directory sandbox: virtual "/" maps to a directory on disk and
// commands run as real child processes with that directory as their root.

use async_trait::async_trait;
use notify::{Event, RecursiveMode, Watcher};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::{Sandbox, SandboxBooter, SandboxProcess, WatchHandle, UNKNOWN_EXIT};
use crate::error::SandboxError;
use crate::paths;
use crate::types::{DirEntry, FsChange, MountEntry, MountTree, ServerReady, SpawnOptions};

const READ_CHUNK: usize = 8 * 1024;

pub struct LocalSandbox {
    root: PathBuf,
    server_ready: broadcast::Sender<ServerReady>,
    shutdown: watch::Sender<bool>,
    torn_down: AtomicBool,
}

impl LocalSandbox {
    /// `root` should already exist; it is used verbatim as the virtual root.
    pub fn new(root: PathBuf) -> Self {
        let (server_ready, _) = broadcast::channel(8);
        let (shutdown, _) = watch::channel(false);
        LocalSandbox { root, server_ready, shutdown, torn_down: AtomicBool::new(false) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path for a virtual path. Normalization keeps it under the root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let normalized = paths::normalize(path);
        self.root.join(normalized.trim_start_matches('/'))
    }

    fn to_virtual(root: &Path, host: &Path) -> Option<String> {
        let relative = host.strip_prefix(root).ok()?;
        let mut virtual_path = String::new();
        for component in relative.components() {
            if let Component::Normal(name) = component {
                virtual_path.push('/');
                virtual_path.push_str(&name.to_string_lossy());
            }
        }
        Some(paths::normalize(&virtual_path))
    }

    fn ensure_live(&self) -> Result<(), SandboxError> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(SandboxError::TornDown);
        }
        Ok(())
    }
}

// Forwards a byte stream as text chunks, holding back a trailing partial
// UTF-8 sequence until the next read completes it.
async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut carry: Vec<u8> = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "process stream closed with error");
                break;
            }
        };
        carry.extend_from_slice(&buf[..n]);
        let valid = match std::str::from_utf8(&carry) {
            Ok(text) => text.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => carry.len(),
        };
        let text = String::from_utf8_lossy(&carry[..valid]).into_owned();
        carry.drain(..valid);
        if !text.is_empty() && tx.send(text).is_err() {
            return;
        }
    }
    if !carry.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&carry).into_owned());
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn mount(&self, tree: &MountTree) -> Result<(), SandboxError> {
        self.ensure_live()?;
        let mut stack: Vec<(String, &MountTree)> = vec![(paths::ROOT.to_string(), tree)];
        while let Some((dir, entries)) = stack.pop() {
            for (name, entry) in entries {
                let path = paths::join(&dir, name);
                match entry {
                    MountEntry::File { contents } => {
                        tokio::fs::write(self.resolve(&path), contents)
                            .await
                            .map_err(|e| SandboxError::io(&path, e))?;
                    }
                    MountEntry::Directory { entries } => {
                        tokio::fs::create_dir_all(self.resolve(&path))
                            .await
                            .map_err(|e| SandboxError::io(&path, e))?;
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
        let cwd = self.resolve(options.cwd.as_deref().unwrap_or(paths::ROOT));
        debug!(command, ?args, cwd = %cwd.display(), "spawning process");

        let mut child = Command::new(command)
            .args(args)
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Spawn { command: command.to_string(), reason: e.to_string() })?;

        let (out_tx, output) = mpsc::unbounded_channel();
        let (err_tx, stderr) = mpsc::unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, out_tx));
        }
        if let Some(child_stderr) = child.stderr.take() {
            tokio::spawn(pump(child_stderr, err_tx));
        }

        let input = child.stdin.take().map(|mut stdin| {
            let (in_tx, mut in_rx) = mpsc::unbounded_channel::<String>();
            tokio::spawn(async move {
                while let Some(data) = in_rx.recv().await {
                    if stdin.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdin.flush().await;
                }
            });
            in_tx
        });

        let mut shutdown = self.shutdown.subscribe();
        let (kill, mut kill_rx) = oneshot::channel::<()>();
        let command_name = command.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => Some(status),
                _ = shutdown.changed() => None,
                Ok(()) = &mut kill_rx => None,
            };
            let code = match status {
                Some(status) => status.ok().and_then(|s| s.code()).unwrap_or(UNKNOWN_EXIT),
                None => {
                    let _ = child.kill().await;
                    UNKNOWN_EXIT
                }
            };
            debug!(command = %command_name, code, "process exited");
            let _ = exit_tx.send(code);
        });

        // Host processes have no pty to resize.
        Ok(SandboxProcess { output, stderr, exit, input, resize: None, kill: Some(kill) })
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError> {
        self.ensure_live()?;
        let host = self.resolve(path);
        let mut reader = tokio::fs::read_dir(&host).await.map_err(|e| SandboxError::io(path, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| SandboxError::io(path, e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Follows symlinks so linked directories list as directories.
            let is_dir = match tokio::fs::metadata(entry.path()).await {
                Ok(meta) => meta.is_dir(),
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "unreadable entry metadata");
                    false
                }
            };
            entries.push(if is_dir { DirEntry::directory(name) } else { DirEntry::file(name) });
        }
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.ensure_live()?;
        let host = self.resolve(path);
        if tokio::fs::metadata(&host).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(SandboxError::IsDirectory(path.to_string()));
        }
        tokio::fs::read_to_string(&host).await.map_err(|e| SandboxError::io(path, e))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.ensure_live()?;
        tokio::fs::write(self.resolve(path), content)
            .await
            .map_err(|e| SandboxError::io(path, e))
    }

    async fn mkdir(&self, path: &str, recursive: bool) -> Result<(), SandboxError> {
        self.ensure_live()?;
        let host = self.resolve(path);
        let result = if recursive {
            tokio::fs::create_dir_all(&host).await
        } else {
            tokio::fs::create_dir(&host).await
        };
        result.map_err(|e| SandboxError::io(path, e))
    }

    fn watch(&self, path: &str, recursive: bool) -> Result<WatchHandle, SandboxError> {
        self.ensure_live()?;
        let host = self.resolve(path);
        let root = self.root.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    for changed in &event.paths {
                        if let Some(virtual_path) = LocalSandbox::to_virtual(&root, changed) {
                            let _ = tx.send(FsChange { path: virtual_path });
                        }
                    }
                }
                Err(e) => warn!(error = %e, "watch event error"),
            }
        })
        .map_err(|e| SandboxError::Watch { path: path.to_string(), reason: e.to_string() })?;

        let mode = if recursive { RecursiveMode::Recursive } else { RecursiveMode::NonRecursive };
        watcher
            .watch(&host, mode)
            .map_err(|e| SandboxError::Watch { path: path.to_string(), reason: e.to_string() })?;
        debug!(path, recursive, "watching");
        Ok(WatchHandle::new(rx, Box::new(watcher)))
    }

    fn on_server_ready(&self) -> broadcast::Receiver<ServerReady> {
        // Host processes bind real ports, so nothing is ever forwarded here;
        // readiness comes from server output instead.
        self.server_ready.subscribe()
    }

    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        info!(root = %self.root.display(), "local sandbox torn down");
    }
}

/// Boots a `LocalSandbox` rooted at a host directory, creating it if needed.
pub struct LocalBooter {
    root: PathBuf,
}

impl LocalBooter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalBooter { root: root.into() }
    }
}

#[async_trait]
impl SandboxBooter for LocalBooter {
    async fn boot(&self) -> Result<Arc<dyn Sandbox>, SandboxError> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            SandboxError::Boot(format!("cannot create workspace '{}': {}", self.root.display(), e))
        })?;
        let root = tokio::fs::canonicalize(&self.root).await.map_err(|e| {
            SandboxError::Boot(format!("cannot resolve workspace '{}': {}", self.root.display(), e))
        })?;
        info!(root = %root.display(), "local sandbox booted");
        Ok(Arc::new(LocalSandbox::new(root)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::exit_code;
    use std::collections::BTreeMap;

    async fn booted() -> (tempfile::TempDir, Arc<dyn Sandbox>) {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = LocalBooter::new(dir.path().join("ws")).boot().await.unwrap();
        (dir, sandbox)
    }

    #[tokio::test]
    async fn file_operations_map_onto_the_host_directory() {
        let (dir, sandbox) = booted().await;
        sandbox.mkdir("/my-docs2/docs/tutorial", true).await.unwrap();
        sandbox.write_file("/my-docs2/docs/intro.md", "# Intro").await.unwrap();

        let on_disk = std::fs::read_to_string(dir.path().join("ws/my-docs2/docs/intro.md")).unwrap();
        assert_eq!(on_disk, "# Intro");

        let mut entries = sandbox.read_dir("/my-docs2/docs").await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries, vec![DirEntry::file("intro.md"), DirEntry::directory("tutorial")]);
        assert_eq!(sandbox.read_file("/my-docs2/docs/intro.md").await.unwrap(), "# Intro");
        assert!(matches!(
            sandbox.read_file("/my-docs2/docs/missing.md").await,
            Err(SandboxError::NotFound(_))
        ));
        assert!(matches!(
            sandbox.read_file("/my-docs2/docs/tutorial").await,
            Err(SandboxError::IsDirectory(_))
        ));
    }

    #[tokio::test]
    async fn write_without_parent_fails() {
        let (_dir, sandbox) = booted().await;
        assert!(sandbox.write_file("/nope/a.md", "x").await.is_err());
    }

    #[tokio::test]
    async fn mount_writes_nested_tree() {
        let (_dir, sandbox) = booted().await;
        let mut docs = BTreeMap::new();
        docs.insert("a.md".to_string(), MountEntry::File { contents: "A".into() });
        let mut tree = BTreeMap::new();
        tree.insert("docs".to_string(), MountEntry::Directory { entries: docs });
        sandbox.mount(&tree).await.unwrap();
        assert_eq!(sandbox.read_file("/docs/a.md").await.unwrap(), "A");
    }

    #[test]
    fn resolve_cannot_escape_root() {
        let sandbox = LocalSandbox::new(PathBuf::from("/srv/ws"));
        assert_eq!(sandbox.resolve("/../../etc/passwd"), PathBuf::from("/srv/ws/etc/passwd"));
        assert_eq!(
            LocalSandbox::to_virtual(Path::new("/srv/ws"), Path::new("/srv/ws/docs/a.md")).as_deref(),
            Some("/docs/a.md")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_streams_output_and_exit_code() {
        let (_dir, sandbox) = booted().await;
        let args = vec!["-c".to_string(), "echo hello; echo oops 1>&2; exit 3".to_string()];
        let mut process = sandbox.spawn("sh", &args, SpawnOptions::default()).await.unwrap();

        let mut out = String::new();
        while let Some(chunk) = process.output.recv().await {
            out.push_str(&chunk);
        }
        let mut err = String::new();
        while let Some(chunk) = process.stderr.recv().await {
            err.push_str(&chunk);
        }
        assert_eq!(out.trim(), "hello");
        assert_eq!(err.trim(), "oops");
        assert_eq!(exit_code(process.exit).await, 3);
    }

    #[tokio::test]
    async fn spawn_of_missing_program_fails() {
        let (_dir, sandbox) = booted().await;
        let result = sandbox
            .spawn("definitely-not-a-real-program-4821", &[], SpawnOptions::default())
            .await;
        assert!(matches!(result, Err(SandboxError::Spawn { .. })));
    }

    #[tokio::test]
    async fn teardown_rejects_further_calls() {
        let (_dir, sandbox) = booted().await;
        sandbox.teardown().await;
        assert!(matches!(sandbox.read_dir("/").await, Err(SandboxError::TornDown)));
    }
}
