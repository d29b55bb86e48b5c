// src/types.rs
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A persisted file. `path` is the primary key.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub last_modified: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One entry of a sandbox directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

impl DirEntry {
    pub fn file(name: impl Into<String>) -> Self {
        DirEntry { name: name.into(), kind: EntryKind::File }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        DirEntry { name: name.into(), kind: EntryKind::Directory }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Initial tree handed to `Sandbox::mount`, keyed by entry name.
pub type MountTree = BTreeMap<String, MountEntry>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountEntry {
    File { contents: String },
    Directory { entries: MountTree },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Virtual working directory; the sandbox root when unset.
    pub cwd: Option<String>,
}

impl SpawnOptions {
    pub fn in_dir(cwd: impl Into<String>) -> Self {
        SpawnOptions { cwd: Some(cwd.into()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        TerminalSize { cols: 80, rows: 24 }
    }
}

/// A forwarded network port announced by the sandbox or parsed from server output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}

/// A mutation observed under a watched sandbox path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsChange {
    pub path: String,
}

/// Setup pipeline progression. Forward transitions go one step at a time;
/// any non-terminal state may drop into `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SetupState {
    #[default]
    Idle,
    Scaffolding,
    ChangingDirectory,
    InstallingDependencies,
    StartingServer,
    ServerReady { url: String },
    Failed { reason: String },
}

impl SetupState {
    fn ordinal(&self) -> Option<u8> {
        match self {
            SetupState::Idle => Some(0),
            SetupState::Scaffolding => Some(1),
            SetupState::ChangingDirectory => Some(2),
            SetupState::InstallingDependencies => Some(3),
            SetupState::StartingServer => Some(4),
            SetupState::ServerReady { .. } => Some(5),
            SetupState::Failed { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SetupState::ServerReady { .. } | SetupState::Failed { .. })
    }

    pub fn can_advance_to(&self, next: &SetupState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.ordinal(), next.ordinal()) {
            (_, None) => true,
            (Some(current), Some(target)) => target == current + 1,
            _ => false,
        }
    }
}

/// Observable setup status consumed by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupStatus {
    pub stage: String,
    pub progress: u8,
    pub preview_url: Option<String>,
    pub is_loading: bool,
    pub state: SetupState,
}

impl Default for SetupStatus {
    fn default() -> Self {
        SetupStatus {
            stage: "Initializing sandbox...".to_string(),
            progress: 0,
            preview_url: None,
            is_loading: true,
            state: SetupState::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_state_advances_one_step_at_a_time() {
        assert!(SetupState::Idle.can_advance_to(&SetupState::Scaffolding));
        assert!(!SetupState::Idle.can_advance_to(&SetupState::InstallingDependencies));
        assert!(SetupState::StartingServer
            .can_advance_to(&SetupState::ServerReady { url: "http://localhost:3000".into() }));
        assert!(SetupState::InstallingDependencies
            .can_advance_to(&SetupState::Failed { reason: "exit 1".into() }));
    }

    #[test]
    fn terminal_states_do_not_advance() {
        let failed = SetupState::Failed { reason: "boom".into() };
        assert!(!failed.can_advance_to(&SetupState::Scaffolding));
        let ready = SetupState::ServerReady { url: "u".into() };
        assert!(!ready.can_advance_to(&SetupState::Failed { reason: "late".into() }));
    }

    #[test]
    fn file_record_serializes_camel_case() {
        let record = FileRecord {
            path: "/my-docs2/docs/intro.md".into(),
            content: "# Intro".into(),
            last_modified: Some("2024-01-01T00:00:00Z".into()),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["lastModified"], "2024-01-01T00:00:00Z");
    }
}
