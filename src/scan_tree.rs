// src/scan_tree.rs
// File-tree projector: an arena snapshot (path → node) of one sandbox subtree,
// rebuilt wholesale on every refresh.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::StoreHandle;
use crate::error::SandboxError;
use crate::ignore_handler::EntryFilter;
use crate::locks::PathLocks;
use crate::paths;
use crate::sandbox::Sandbox;

const MAX_DEPTH: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    File { contents: String },
    Directory { children: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub path: String,
    pub name: String,
    pub kind: NodeKind,
}

impl TreeNode {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }
}

/// Nested view handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VirtualNode {
    File { path: String, contents: String },
    Directory { path: String, children: BTreeMap<String, VirtualNode> },
}

/// Snapshot of a subtree. Children lists hold full paths, files first, then
/// directories, each group ordered case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTree {
    root: String,
    nodes: HashMap<String, TreeNode>,
}

impl FileTree {
    /// A tree that has not been scanned yet: just the root directory.
    pub fn empty(root: &str) -> Self {
        let root = paths::normalize(root);
        let mut nodes = HashMap::new();
        nodes.insert(
            root.clone(),
            TreeNode {
                path: root.clone(),
                name: paths::file_name(&root).to_string(),
                kind: NodeKind::Directory { children: Vec::new() },
            },
        );
        FileTree { root, nodes }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn get(&self, path: &str) -> Option<&TreeNode> {
        self.nodes.get(&paths::normalize(path))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Number of nodes below the root.
    pub fn len(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn children(&self, path: &str) -> Vec<&TreeNode> {
        match self.get(path).map(|node| &node.kind) {
            Some(NodeKind::Directory { children }) => {
                children.iter().filter_map(|child| self.nodes.get(child)).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn file_contents(&self, path: &str) -> Option<&str> {
        match self.get(path).map(|node| &node.kind) {
            Some(NodeKind::File { contents }) => Some(contents.as_str()),
            _ => None,
        }
    }

    /// Every file path in the tree, sorted.
    pub fn file_paths(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .nodes
            .values()
            .filter(|node| !node.is_dir())
            .map(|node| node.path.clone())
            .collect();
        files.sort();
        files
    }

    /// Rebuilds the nested form bottom-up without recursion.
    pub fn to_virtual_node(&self) -> VirtualNode {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root.as_str()];
        while let Some(path) = stack.pop() {
            order.push(path);
            if let Some(NodeKind::Directory { children }) = self.nodes.get(path).map(|n| &n.kind) {
                stack.extend(children.iter().map(String::as_str));
            }
        }

        let mut built: HashMap<&str, VirtualNode> = HashMap::with_capacity(order.len());
        for path in order.into_iter().rev() {
            let Some(node) = self.nodes.get(path) else { continue };
            let virtual_node = match &node.kind {
                NodeKind::File { contents } => {
                    VirtualNode::File { path: node.path.clone(), contents: contents.clone() }
                }
                NodeKind::Directory { children } => {
                    let mut map = BTreeMap::new();
                    for child in children {
                        if let Some(done) = built.remove(child.as_str()) {
                            map.insert(paths::file_name(child).to_string(), done);
                        }
                    }
                    VirtualNode::Directory { path: node.path.clone(), children: map }
                }
            };
            built.insert(path, virtual_node);
        }

        built.remove(self.root.as_str()).unwrap_or_else(|| VirtualNode::Directory {
            path: self.root.clone(),
            children: BTreeMap::new(),
        })
    }

    /// Indented listing, directories suffixed with '/'.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut stack: Vec<(&str, usize)> = vec![(self.root.as_str(), 0)];
        while let Some((path, indent)) = stack.pop() {
            let Some(node) = self.nodes.get(path) else { continue };
            out.push_str(&"  ".repeat(indent));
            out.push_str(if indent == 0 { &node.path } else { &node.name });
            if node.is_dir() {
                out.push('/');
            }
            out.push('\n');
            if let NodeKind::Directory { children } = &node.kind {
                for child in children.iter().rev() {
                    stack.push((child.as_str(), indent + 1));
                }
            }
        }
        out
    }
}

fn sort_children(children: &mut [String], nodes: &HashMap<String, TreeNode>) {
    children.sort_by(|a, b| {
        let a_dir = nodes.get(a).map_or(false, TreeNode::is_dir);
        let b_dir = nodes.get(b).map_or(false, TreeNode::is_dir);
        match (a_dir, b_dir) {
            (false, true) => std::cmp::Ordering::Less,
            (true, false) => std::cmp::Ordering::Greater,
            _ => paths::file_name(a).to_lowercase().cmp(&paths::file_name(b).to_lowercase()),
        }
    });
}

/// Scans `root` into a new tree. `Err` only when the root itself cannot be listed.
pub async fn scan_tree(
    sandbox: &dyn Sandbox,
    filter: &EntryFilter,
    root: &str,
) -> Result<FileTree, SandboxError> {
    let root = paths::normalize(root);
    let root_entries = sandbox.read_dir(&root).await?;

    let mut tree = FileTree::empty(&root);
    let mut dir_children: HashMap<String, Vec<String>> = HashMap::new();
    let mut pending = vec![(root.clone(), 0usize, Some(root_entries))];

    while let Some((dir, depth, listed)) = pending.pop() {
        let entries = match listed {
            Some(entries) => entries,
            None => match sandbox.read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %dir, error = %e, "failed to list directory, showing it empty");
                    Vec::new()
                }
            },
        };
        let children = dir_children.entry(dir.clone()).or_default();

        for entry in entries {
            let path = paths::join(&dir, &entry.name);
            if filter.excludes(&path, &entry.name, entry.is_dir()) {
                continue;
            }
            children.push(path.clone());
            if entry.is_dir() {
                tree.nodes.insert(
                    path.clone(),
                    TreeNode {
                        path: path.clone(),
                        name: entry.name,
                        kind: NodeKind::Directory { children: Vec::new() },
                    },
                );
                if depth < MAX_DEPTH {
                    pending.push((path, depth + 1, None));
                } else {
                    debug!(path = %path, "max depth reached, not descending");
                }
            } else {
                let contents = match sandbox.read_file(&path).await {
                    Ok(contents) => contents,
                    Err(e) => {
                        warn!(path = %path, error = %e, "failed to read file, showing it empty");
                        String::new()
                    }
                };
                tree.nodes.insert(
                    path.clone(),
                    TreeNode { path, name: entry.name, kind: NodeKind::File { contents } },
                );
            }
        }
    }

    for (dir, mut children) in dir_children {
        sort_children(&mut children, &tree.nodes);
        if let Some(TreeNode { kind: NodeKind::Directory { children: slot }, .. }) =
            tree.nodes.get_mut(&dir)
        {
            *slot = children;
        }
    }
    Ok(tree)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed { nodes: usize },
    /// The root could not be listed; the previous snapshot is kept.
    NotYetAvailable,
}

pub struct TreeProjector {
    sandbox: Arc<dyn Sandbox>,
    store: StoreHandle,
    filter: Arc<EntryFilter>,
    locks: PathLocks,
    root: String,
    snapshot: RwLock<Arc<FileTree>>,
    available: AtomicBool,
    open_folders: Mutex<BTreeSet<String>>,
    refresh_gate: AsyncMutex<()>,
}

impl TreeProjector {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        store: StoreHandle,
        filter: Arc<EntryFilter>,
        locks: PathLocks,
        root: &str,
    ) -> Self {
        let root = paths::normalize(root);
        TreeProjector {
            sandbox,
            store,
            filter,
            locks,
            snapshot: RwLock::new(Arc::new(FileTree::empty(&root))),
            root,
            available: AtomicBool::new(false),
            open_folders: Mutex::new(BTreeSet::new()),
            refresh_gate: AsyncMutex::new(()),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn snapshot(&self) -> Arc<FileTree> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// False until a refresh has found the root.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub async fn refresh(&self) -> RefreshOutcome {
        let _gate = self.refresh_gate.lock().await;
        match scan_tree(self.sandbox.as_ref(), &self.filter, &self.root).await {
            Ok(tree) => {
                let nodes = tree.len();
                *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(tree);
                self.available.store(true, Ordering::SeqCst);
                debug!(root = %self.root, nodes, "file tree refreshed");
                RefreshOutcome::Refreshed { nodes }
            }
            Err(SandboxError::NotFound(_)) => {
                debug!(root = %self.root, "tree root does not exist yet");
                RefreshOutcome::NotYetAvailable
            }
            Err(e) => {
                warn!(root = %self.root, error = %e, "tree refresh failed, keeping previous snapshot");
                RefreshOutcome::NotYetAvailable
            }
        }
    }

    /// Flips `path` in the open-folder set; returns whether it is now open.
    pub fn toggle(&self, path: &str) -> bool {
        let path = paths::normalize(path);
        let mut open = self.open_folders.lock().unwrap_or_else(PoisonError::into_inner);
        if open.remove(&path) {
            false
        } else {
            open.insert(path);
            true
        }
    }

    pub fn is_open(&self, path: &str) -> bool {
        self.open_folders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&paths::normalize(path))
    }

    pub fn open_folders(&self) -> Vec<String> {
        self.open_folders.lock().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect()
    }

    // Validates a user-supplied name against `parent` and checks it is free.
    async fn child_path(&self, parent: &str, name: Option<&str>, is_dir: bool) -> Option<String> {
        let name = name.map(str::trim).filter(|name| !name.is_empty())?;
        let parent = paths::normalize(parent);
        let path = paths::join(&parent, name);
        if path == parent || !paths::is_within(&path, &self.root) || path == self.root {
            warn!(parent = %parent, name, "refusing to create entry outside the tree root");
            return None;
        }
        if self.filter.excludes_under(&self.root, &path, is_dir) {
            warn!(path = %path, "refusing to create an entry the tree would never show");
            return None;
        }
        match self.sandbox.read_file(&path).await {
            Err(SandboxError::NotFound(_)) => Some(path),
            Ok(_) | Err(SandboxError::IsDirectory(_)) => {
                warn!(path = %path, "entry already exists");
                None
            }
            Err(e) => {
                warn!(path = %path, error = %e, "cannot check entry before creating it");
                None
            }
        }
    }

    /// Creates an empty file under `parent`, records it in the store and refreshes.
    pub async fn create_file(&self, parent: &str, name: Option<&str>) -> Option<String> {
        let path = self.child_path(parent, name, false).await?;
        {
            let _guard = self.locks.lock(&path).await;
            if let Err(e) = self.sandbox.write_file(&path, "").await {
                warn!(path = %path, error = %e, "failed to create file");
                return None;
            }
            if let Err(e) = self.store.upsert(&path, "").await {
                warn!(path = %path, error = %e, "created file but could not record it in the store");
            }
        }
        info!(path = %path, "file created");
        self.refresh().await;
        Some(path)
    }

    /// Creates a folder under `parent`, opens it and refreshes. Folders are not
    /// stored; they come back on restore through the files inside them.
    pub async fn create_folder(&self, parent: &str, name: Option<&str>) -> Option<String> {
        let path = self.child_path(parent, name, true).await?;
        if let Err(e) = self.sandbox.mkdir(&path, true).await {
            warn!(path = %path, error = %e, "failed to create folder");
            return None;
        }
        self.open_folders.lock().unwrap_or_else(PoisonError::into_inner).insert(path.clone());
        info!(path = %path, "folder created");
        self.refresh().await;
        Some(path)
    }

    /// Refreshes on every change under the root. Changes that pile up while a
    /// refresh runs collapse into the next one.
    pub fn watch(self: &Arc<Self>) -> Result<JoinHandle<()>, SandboxError> {
        let mut handle = self.sandbox.watch(&self.root, true)?;
        let projector = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(change) = handle.changed().await {
                let coalesced = handle.drain();
                debug!(path = %change.path, coalesced, "change detected, refreshing tree");
                projector.refresh().await;
            }
            debug!(root = %projector.root, "change subscription closed");
        }))
    }
}
