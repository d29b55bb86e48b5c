// src/paths.rs
// Virtual (sandbox-side) path helpers. Virtual paths are always absolute,
// '/'-separated and carry no trailing slash except for the root itself.

pub const ROOT: &str = "/";

/// Normalizes a virtual path: leading '/', no empty or '.' segments,
/// '..' pops a segment but never climbs above the root.
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return ROOT.to_string();
    }
    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in segments {
        normalized.push('/');
        normalized.push_str(segment);
    }
    normalized
}

pub fn join(parent: &str, name: &str) -> String {
    normalize(&format!("{}/{}", parent, name))
}

/// Parent directory of `path`; `None` for the root.
pub fn parent(path: &str) -> Option<String> {
    let normalized = normalize(path);
    if normalized == ROOT {
        return None;
    }
    match normalized.rfind('/') {
        Some(0) => Some(ROOT.to_string()),
        Some(index) => Some(normalized[..index].to_string()),
        None => None,
    }
}

pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(index) => &trimmed[index + 1..],
        None => trimmed,
    }
}

/// Entries whose name begins with '.' are never mirrored or projected.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// True when `path` equals `root` or lies underneath it.
pub fn is_within(path: &str, root: &str) -> bool {
    let path = normalize(path);
    let root = normalize(root);
    if root == ROOT || path == root {
        return true;
    }
    path.strip_prefix(&root)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

/// Number of segments below the root ("/a/b" has depth 2).
pub fn depth(path: &str) -> usize {
    normalize(path).split('/').filter(|s| !s.is_empty()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_separators_and_dots() {
        assert_eq!(normalize("/my-docs2/docs/"), "/my-docs2/docs");
        assert_eq!(normalize("my-docs2//docs/./intro.md"), "/my-docs2/docs/intro.md");
        assert_eq!(normalize("/a/b/../c"), "/a/c");
        assert_eq!(normalize("/../../etc"), "/etc");
        assert_eq!(normalize(""), "/");
    }

    #[test]
    fn join_and_parent_are_consistent() {
        let child = join("/my-docs2/docs/", "intro.md");
        assert_eq!(child, "/my-docs2/docs/intro.md");
        assert_eq!(parent(&child).as_deref(), Some("/my-docs2/docs"));
        assert_eq!(parent("/top").as_deref(), Some("/"));
        assert_eq!(parent("/"), None);
    }

    #[test]
    fn file_name_ignores_trailing_slash() {
        assert_eq!(file_name("/my-docs2/docs/"), "docs");
        assert_eq!(file_name("/a/b.md"), "b.md");
    }

    #[test]
    fn within_requires_segment_boundary() {
        assert!(is_within("/my-docs2/docs/a.md", "/my-docs2/docs/"));
        assert!(is_within("/my-docs2/docs", "/my-docs2/docs"));
        assert!(!is_within("/my-docs2/docs-old/a.md", "/my-docs2/docs"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn hidden_and_depth() {
        assert!(is_hidden(".docusaurus"));
        assert!(!is_hidden("intro.md"));
        assert_eq!(depth("/a/b"), 2);
        assert_eq!(depth("/"), 0);
    }
}
