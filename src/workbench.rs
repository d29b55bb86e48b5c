// src/workbench.rs
// Operations the presentation layer calls: explorer, editor and status.

use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::paths;
use crate::scan_tree::{FileTree, VirtualNode};
use crate::session::{Session, SessionServices};
use crate::types::SetupStatus;

const MARKDOWN_EXTENSIONS: [&str; 3] = ["md", "mdx", "markdown"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EditorKind {
    Markdown,
    Plain,
}

impl EditorKind {
    pub fn for_path(path: &str) -> Self {
        let is_markdown = Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| MARKDOWN_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if is_markdown {
            EditorKind::Markdown
        } else {
            EditorKind::Plain
        }
    }
}

/// The file shown in the editor, with the content the user currently sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenedFile {
    pub path: String,
    pub content: String,
    pub editor: EditorKind,
}

pub struct Workbench {
    session: Arc<Session>,
    current: Mutex<Option<OpenedFile>>,
}

impl Workbench {
    pub fn new(session: Arc<Session>) -> Self {
        Workbench { session, current: Mutex::new(None) }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn services(&self) -> Result<Arc<SessionServices>, SessionError> {
        self.session.services()
    }

    pub fn status(&self) -> SetupStatus {
        self.session.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SetupStatus> {
        self.session.subscribe_status()
    }

    /// Nested view of the content directory as of the last refresh.
    pub fn list_tree(&self) -> Result<VirtualNode, SessionError> {
        Ok(self.tree()?.to_virtual_node())
    }

    pub fn tree(&self) -> Result<Arc<FileTree>, SessionError> {
        Ok(self.services()?.projector.snapshot())
    }

    pub fn toggle_folder(&self, path: &str) -> Result<bool, SessionError> {
        Ok(self.services()?.projector.toggle(path))
    }

    pub fn open_folders(&self) -> Result<Vec<String>, SessionError> {
        Ok(self.services()?.projector.open_folders())
    }

    /// Reads `path` from the sandbox and makes it the current file.
    pub async fn select_file(&self, path: &str) -> Result<OpenedFile, SessionError> {
        let services = self.services()?;
        let path = paths::normalize(path);
        let content = services.sandbox.read_file(&path).await.map_err(|e| {
            warn!(path = %path, error = %e, "failed to load file");
            e
        })?;
        let opened = OpenedFile { editor: EditorKind::for_path(&path), path, content };
        debug!(path = %opened.path, editor = ?opened.editor, "file selected");
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(opened.clone());
        Ok(opened)
    }

    pub fn current_file(&self) -> Option<OpenedFile> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Schedules a debounced write of `content` to `path`. Paths a restore
    /// would skip (hidden, ignored or outside the content directory) are refused.
    pub fn edit_content(&self, path: &str, content: &str) -> Result<(), SessionError> {
        let services = self.services()?;
        if !services.is_editable(path) {
            warn!(path, "refusing edit outside the content directory");
            return Err(SessionError::NotEditable(path.to_string()));
        }
        services.writer.schedule(path, content);
        Ok(())
    }

    /// Applies an edit to the current file. The target path is fixed now, so a
    /// later `select_file` does not redirect the pending write.
    pub fn edit_current(&self, content: &str) -> Result<Option<String>, SessionError> {
        let services = self.services()?;
        let path = {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            match current.as_mut() {
                Some(opened) => {
                    opened.content = content.to_string();
                    opened.path.clone()
                }
                None => return Ok(None),
            }
        };
        if !services.is_editable(&path) {
            warn!(path = %path, "current file is outside the content directory, not saving");
            return Err(SessionError::NotEditable(path));
        }
        services.writer.schedule(&path, content);
        Ok(Some(path))
    }

    /// Creates an empty file; `parent` defaults to the content directory.
    pub async fn create_file(
        &self,
        parent: Option<&str>,
        name: Option<&str>,
    ) -> Result<Option<String>, SessionError> {
        let services = self.services()?;
        let parent = parent.map(str::to_string).unwrap_or_else(|| services.content_root.clone());
        Ok(services.projector.create_file(&parent, name).await)
    }

    /// Creates a folder and opens it; `parent` defaults to the content directory.
    pub async fn create_folder(
        &self,
        parent: Option<&str>,
        name: Option<&str>,
    ) -> Result<Option<String>, SessionError> {
        let services = self.services()?;
        let parent = parent.map(str::to_string).unwrap_or_else(|| services.content_root.clone());
        Ok(services.projector.create_folder(&parent, name).await)
    }

    /// Re-reads the content directory now instead of waiting for a change event.
    pub async fn refresh(&self) -> Result<(), SessionError> {
        self.services()?.projector.refresh().await;
        Ok(())
    }
}
