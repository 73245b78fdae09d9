//! Logical path helpers.
//!
//! Every key in the cache and the metadata store is a *logical* path: absolute,
//! `/`-separated and relative to the mount root (`/docs/report.txt`). Logical
//! paths are independent of where the data directory lives on disk, so a data
//! directory can be moved without rewriting its metadata.

use std::path::{Path, PathBuf};

/// The logical root path.
pub const ROOT: &str = "/";

/// Join a child name onto a logical parent path.
///
/// ```
/// use freya_core::path;
///
/// assert_eq!(path::join("/", "a"), "/a");
/// assert_eq!(path::join("/a", "b"), "/a/b");
/// ```
pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT || parent.is_empty() {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}

/// Map a logical path onto the backing data directory.
pub fn physical(root: &Path, logical: &str) -> PathBuf {
    let relative = logical.trim_start_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

/// Parent of a logical path (`/` for top-level entries and the root itself).
pub fn parent(logical: &str) -> &str {
    match logical.trim_end_matches('/').rfind('/') {
        Some(0) | None => ROOT,
        Some(idx) => &logical[..idx],
    }
}

/// Last component of a logical path (empty for the root).
pub fn file_name(logical: &str) -> &str {
    let trimmed = logical.trim_end_matches('/');
    trimmed.rfind('/').map_or(trimmed, |idx| &trimmed[idx + 1..])
}

/// Whether `path` is `prefix` itself or lies below it.
///
/// The test is component-aware: `/a` covers `/a/x` but not `/ab`.
pub fn is_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return path.starts_with('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Substitute `old_prefix` with `new_prefix` once, at the start of `path`.
///
/// Returns `None` when `path` is not under `old_prefix`.
///
/// ```
/// use freya_core::path;
///
/// assert_eq!(path::rebase("/a/y/z", "/a", "/b").as_deref(), Some("/b/y/z"));
/// assert_eq!(path::rebase("/c/a", "/a", "/b"), None);
/// ```
pub fn rebase(path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    if !is_under(path, old_prefix) {
        return None;
    }
    let old_prefix = old_prefix.trim_end_matches('/');
    let new_prefix = new_prefix.trim_end_matches('/');
    let rest = &path[old_prefix.len()..];
    Some(format!("{new_prefix}{rest}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert_eq!(join("/", "file.txt"), "/file.txt");
        assert_eq!(join("/docs", "file.txt"), "/docs/file.txt");
        assert_eq!(join("/docs/", "file.txt"), "/docs/file.txt");
    }

    #[test]
    fn test_physical() {
        let root = Path::new("/data");
        assert_eq!(physical(root, "/"), PathBuf::from("/data"));
        assert_eq!(physical(root, "/a/b"), PathBuf::from("/data/a/b"));
    }

    #[test]
    fn test_parent_and_file_name() {
        assert_eq!(parent("/a/b/c"), "/a/b");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/"), "/");
        assert_eq!(file_name("/a/b/c"), "c");
        assert_eq!(file_name("/a"), "a");
        assert_eq!(file_name("/"), "");
    }

    #[test]
    fn test_is_under_is_component_aware() {
        assert!(is_under("/a", "/a"));
        assert!(is_under("/a/x", "/a"));
        assert!(is_under("/a/y/z", "/a/"));
        assert!(!is_under("/ab", "/a"));
        assert!(!is_under("/c/a", "/a"));
        assert!(is_under("/anything", "/"));
    }

    #[test]
    fn test_rebase() {
        assert_eq!(rebase("/a/x", "/a", "/b").as_deref(), Some("/b/x"));
        assert_eq!(rebase("/a", "/a", "/b").as_deref(), Some("/b"));
        assert_eq!(rebase("/a/a/a", "/a", "/b").as_deref(), Some("/b/a/a"));
        assert_eq!(rebase("/ab/x", "/a", "/b"), None);
    }
}
