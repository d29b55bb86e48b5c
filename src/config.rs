// src/config.rs
// Workbench configuration. Every field has a default, so an absent or
// partial TOML file is valid.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::paths;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkbenchConfig {
    pub workspace: WorkspaceConfig,
    pub project: ProjectConfig,
    pub store: StoreConfig,
    pub editor: EditorConfig,
    pub setup: SetupConfig,
    pub mirror: MirrorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
    /// Host directory backing the local sandbox.
    pub root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        WorkspaceConfig { root: PathBuf::from("workspace") }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    pub name: String,
    /// Subtree mirrored into the store and projected into the explorer.
    pub content_dir: String,
    pub scaffold: Vec<String>,
    pub install: Vec<String>,
    pub start: Vec<String>,
    /// Shell started by `run --shell`.
    pub shell: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        ProjectConfig {
            name: "my-docs2".to_string(),
            content_dir: "/my-docs2/docs".to_string(),
            scaffold: [
                "npx",
                "--yes",
                "create-docusaurus@latest",
                "my-docs2",
                "classic",
                "--skip-install",
                "-j",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            install: vec!["npm".to_string(), "install".to_string()],
            start: vec!["npm".to_string(), "start".to_string()],
            shell: "sh".to_string(),
        }
    }
}

impl ProjectConfig {
    pub fn project_dir(&self) -> String {
        paths::join(paths::ROOT, &self.name)
    }

    pub fn content_root(&self) -> String {
        paths::normalize(&self.content_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Database file, or ":memory:".
    pub path: String,
    pub max_path_len: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            path: "workbench.db".to_string(),
            max_path_len: crate::db::DEFAULT_MAX_PATH_LEN,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EditorConfig {
    pub quiet_interval_ms: u64,
    /// Use coalescing upserts for editor write-back.
    pub incremental: bool,
}

impl Default for EditorConfig {
    fn default() -> Self {
        EditorConfig { quiet_interval_ms: 500, incremental: true }
    }
}

impl EditorConfig {
    pub fn quiet_interval(&self) -> Duration {
        Duration::from_millis(self.quiet_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SetupConfig {
    pub settle_delay_ms: u64,
    /// Text that must appear in server output before the URL pattern is tried.
    pub ready_marker: String,
    /// Regex whose whole match is the preview URL and whose first group is the port.
    pub ready_pattern: String,
    pub ready_timeout_secs: Option<u64>,
}

impl Default for SetupConfig {
    fn default() -> Self {
        SetupConfig {
            settle_delay_ms: 2000,
            ready_marker: "website is running at".to_string(),
            ready_pattern: r"http://localhost:(\d+)".to_string(),
            ready_timeout_secs: None,
        }
    }
}

impl SetupConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MirrorConfig {
    /// Extra gitignore-style patterns excluded on top of hidden entries.
    pub ignore: Vec<String>,
}

impl WorkbenchConfig {
    /// Loads `path` when given, otherwise returns the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text)?
            }
            None => WorkbenchConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: WorkbenchConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project.name.trim().is_empty() {
            return Err(ConfigError::Invalid("project.name must not be empty".into()));
        }
        for (key, command) in [
            ("project.scaffold", &self.project.scaffold),
            ("project.install", &self.project.install),
            ("project.start", &self.project.start),
        ] {
            if command.first().map_or(true, |program| program.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!("{key} must name a program")));
            }
        }
        if !paths::is_within(&self.project.content_dir, &self.project.project_dir()) {
            return Err(ConfigError::Invalid(format!(
                "project.content_dir '{}' is outside the project directory '{}'",
                self.project.content_dir,
                self.project.project_dir()
            )));
        }
        if self.editor.quiet_interval_ms == 0 {
            return Err(ConfigError::Invalid("editor.quiet_interval_ms must be positive".into()));
        }
        if self.store.max_path_len == 0 {
            return Err(ConfigError::Invalid("store.max_path_len must be positive".into()));
        }
        regex::Regex::new(&self.setup.ready_pattern)
            .map_err(|e| ConfigError::Invalid(format!("setup.ready_pattern: {e}")))?;
        Ok(())
    }
}

/// Splits a configured command line into program and arguments.
pub fn split_command(command: &[String]) -> Option<(&str, &[String])> {
    command.split_first().map(|(program, args)| (program.as_str(), args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_docusaurus_layout() {
        let config = WorkbenchConfig::default();
        config.validate().unwrap();
        assert_eq!(config.project.project_dir(), "/my-docs2");
        assert_eq!(config.project.content_root(), "/my-docs2/docs");
        assert_eq!(config.editor.quiet_interval(), Duration::from_millis(500));
        assert_eq!(config.setup.settle_delay(), Duration::from_secs(2));
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = WorkbenchConfig::from_toml(
            r#"
            [editor]
            quiet_interval_ms = 750

            [mirror]
            ignore = ["*.tmp"]
            "#,
        )
        .unwrap();
        assert_eq!(config.editor.quiet_interval_ms, 750);
        assert!(config.editor.incremental);
        assert_eq!(config.mirror.ignore, vec!["*.tmp".to_string()]);
        assert_eq!(config.project.name, "my-docs2");
    }

    #[test]
    fn rejects_content_dir_outside_project() {
        let err = WorkbenchConfig::from_toml(
            r#"
            [project]
            content_dir = "/elsewhere/docs"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_bad_ready_pattern_and_zero_interval() {
        assert!(WorkbenchConfig::from_toml("[setup]\nready_pattern = \"(\"").is_err());
        assert!(WorkbenchConfig::from_toml("[editor]\nquiet_interval_ms = 0").is_err());
    }

    #[test]
    fn split_command_separates_program() {
        let command = vec!["npm".to_string(), "install".to_string()];
        let (program, args) = split_command(&command).unwrap();
        assert_eq!(program, "npm");
        assert_eq!(args, ["install".to_string()]);
        assert!(split_command(&[]).is_none());
    }
}
