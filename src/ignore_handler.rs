// src/ignore_handler.rs
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::Match;
use std::path::Path;
use tracing::warn;

use crate::paths;

/// Decides which sandbox entries the mirror and the tree projector skip:
/// hidden entries always, plus any configured gitignore-style patterns.
#[derive(Debug, Default)]
pub struct EntryFilter {
    gitignore: Option<Gitignore>,
}

impl EntryFilter {
    pub fn hidden_only() -> Self {
        EntryFilter { gitignore: None }
    }

    /// `root` is the virtual subtree root the patterns are relative to.
    pub fn new(root: &str, patterns: &[String]) -> Self {
        let mut builder = GitignoreBuilder::new(Path::new(&paths::normalize(root)));
        let mut added = 0usize;

        for pattern_line in patterns {
            let trimmed_line = pattern_line.trim();
            if trimmed_line.is_empty() || trimmed_line.starts_with('#') {
                continue;
            }
            match builder.add_line(None, trimmed_line) {
                Ok(_) => added += 1,
                Err(e) => warn!(pattern = %pattern_line, error = %e, "skipping invalid ignore pattern"),
            }
        }
        if added == 0 {
            return EntryFilter::hidden_only();
        }

        match builder.build() {
            Ok(gitignore) => EntryFilter { gitignore: Some(gitignore) },
            Err(e) => {
                warn!(error = %e, "failed to build ignore set; only hidden entries are skipped");
                EntryFilter::hidden_only()
            }
        }
    }

    /// `path` is the entry's full virtual path, `name` its last segment.
    pub fn excludes(&self, path: &str, name: &str, is_dir: bool) -> bool {
        if paths::is_hidden(name) {
            return true;
        }
        match &self.gitignore {
            Some(gitignore) => matches!(gitignore.matched(Path::new(path), is_dir), Match::Ignore(_)),
            None => false,
        }
    }

    /// True when `path` or any directory between `root` and it is excluded.
    /// Paths outside `root` are excluded too.
    pub fn excludes_under(&self, root: &str, path: &str, is_dir: bool) -> bool {
        let root = paths::normalize(root);
        let path = paths::normalize(path);
        if !paths::is_within(&path, &root) {
            return true;
        }
        let rest = path[root.len()..].trim_start_matches('/');
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        let mut current = root;
        for (index, segment) in segments.iter().enumerate() {
            current = paths::join(&current, segment);
            let last = index + 1 == segments.len();
            if self.excludes(&current, segment, !last || is_dir) {
                return true;
            }
        }
        false
    }
}
