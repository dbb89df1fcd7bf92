// Resource path canonicalization: NFKC normalization, traversal rejection, 1024 char max.
//
// Every relative path that crosses the wire (file lists, resource activities,
// transferred content) is normalized before it touches local resources.

use std::ffi::OsStr;

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Maximum allowed path length in characters.
const MAX_PATH_CHARS: usize = 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,

    #[error("path exceeds maximum length of {MAX_PATH_CHARS} characters")]
    TooLong,

    #[error("path contains directory traversal component: {0}")]
    Traversal(String),

    #[error("path contains null byte")]
    NullByte,

    #[error("path contains invalid component: {0}")]
    InvalidComponent(String),

    #[error("name is not valid UTF-8: {0}")]
    NotUtf8(String),

    #[error("name is not in normalized form: {0}")]
    NotNormalized(String),
}

/// Normalize a path relative to a resource-group root.
///
/// Rules:
/// - Apply Unicode NFKC normalization
/// - Convert all separators to `/`
/// - Collapse consecutive `/`, strip leading and trailing `/`
/// - Reject `.` and `..` components, null bytes, empty paths
/// - Enforce the 1024 character limit (after normalization)
pub fn normalize_path(input: &str) -> Result<String, PathError> {
    if input.contains('\0') {
        return Err(PathError::NullByte);
    }

    let normalized: String = input.nfkc().collect();
    let unified = normalized.replace('\\', "/");
    let components: Vec<&str> = unified.split('/').filter(|s| !s.is_empty()).collect();

    if components.is_empty() {
        return Err(PathError::Empty);
    }

    for component in &components {
        match *component {
            "." | ".." => return Err(PathError::Traversal((*component).to_string())),
            other if other.trim().is_empty() => {
                return Err(PathError::InvalidComponent(
                    "(whitespace-only component)".to_string(),
                ));
            }
            _ => {}
        }
    }

    let result = components.join("/");
    if result.chars().count() > MAX_PATH_CHARS {
        return Err(PathError::TooLong);
    }

    Ok(result)
}

/// Normalize a file-list entry, keeping the trailing `/` that marks a directory.
pub fn normalize_entry(input: &str, is_directory: bool) -> Result<String, PathError> {
    let path = normalize_path(input)?;
    if is_directory {
        Ok(format!("{path}/"))
    } else {
        Ok(path)
    }
}

/// Check a single on-disk name before it becomes part of a shared path.
///
/// The name must be UTF-8 and already in the form `normalize_path` yields,
/// otherwise the normalized key would name an entry that does not exist.
pub fn canonical_component(name: &OsStr) -> Result<&str, PathError> {
    let Some(name) = name.to_str() else {
        return Err(PathError::NotUtf8(name.to_string_lossy().into_owned()));
    };
    if normalize_path(name)? != name {
        return Err(PathError::NotNormalized(name.to_string()));
    }
    Ok(name)
}

/// Parent directory entry (with trailing `/`) of a normalized path, if any.
pub fn parent_entry(path: &str) -> Option<String> {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    trimmed.rfind('/').map(|index| format!("{}/", &trimmed[..index]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_path_is_unchanged() {
        assert_eq!(normalize_path("src/lib.rs").unwrap(), "src/lib.rs");
    }

    #[test]
    fn separators_are_unified_and_collapsed() {
        assert_eq!(normalize_path("/src\\\\nested//lib.rs/").unwrap(), "src/nested/lib.rs");
    }

    #[test]
    fn unicode_is_nfkc_normalized() {
        assert_eq!(normalize_path("docs/\u{FB01}le.md").unwrap(), "docs/file.md");
    }

    #[test]
    fn traversal_components_are_rejected() {
        assert_eq!(normalize_path("a/../../etc"), Err(PathError::Traversal("..".to_string())));
        assert_eq!(normalize_path("a/./b"), Err(PathError::Traversal(".".to_string())));
        assert_eq!(normalize_path("a\\..\\b"), Err(PathError::Traversal("..".to_string())));
    }

    #[test]
    fn empty_and_null_paths_are_rejected() {
        assert_eq!(normalize_path(""), Err(PathError::Empty));
        assert_eq!(normalize_path("///"), Err(PathError::Empty));
        assert_eq!(normalize_path("a\0b"), Err(PathError::NullByte));
        assert!(matches!(normalize_path("a/ /b"), Err(PathError::InvalidComponent(_))));
    }

    #[test]
    fn length_limit_applies_after_normalization() {
        assert!(normalize_path(&"a".repeat(1024)).is_ok());
        assert_eq!(normalize_path(&"a".repeat(1025)), Err(PathError::TooLong));
    }

    #[test]
    fn dotfiles_are_allowed() {
        assert_eq!(normalize_path(".gitignore").unwrap(), ".gitignore");
        assert_eq!(normalize_path("docs/...").unwrap(), "docs/...");
    }

    #[test]
    fn directory_entries_keep_marker() {
        assert_eq!(normalize_entry("dir", true).unwrap(), "dir/");
        assert_eq!(normalize_entry("dir/", true).unwrap(), "dir/");
        assert_eq!(normalize_entry("dir/b.txt", false).unwrap(), "dir/b.txt");
    }

    #[test]
    fn parent_entry_walks_one_level() {
        assert_eq!(parent_entry("dir/b.txt").as_deref(), Some("dir/"));
        assert_eq!(parent_entry("dir/sub/").as_deref(), Some("dir/"));
        assert_eq!(parent_entry("a.txt"), None);
        assert_eq!(parent_entry("dir/"), None);
    }

    #[test]
    fn canonical_component_accepts_normalized_names() {
        assert_eq!(canonical_component(OsStr::new("notes.md")).unwrap(), "notes.md");
        assert_eq!(canonical_component(OsStr::new("caf\u{e9}")).unwrap(), "caf\u{e9}");
    }

    #[test]
    fn canonical_component_rejects_names_that_normalize_differently() {
        let decomposed = OsStr::new("cafe\u{301}");
        assert!(matches!(canonical_component(decomposed), Err(PathError::NotNormalized(_))));
        let fullwidth = OsStr::new("\u{ff46}ile");
        assert!(matches!(canonical_component(fullwidth), Err(PathError::NotNormalized(_))));
        let backslash = OsStr::new("a\\b");
        assert!(matches!(canonical_component(backslash), Err(PathError::NotNormalized(_))));
        assert!(matches!(canonical_component(OsStr::new("..")), Err(PathError::Traversal(_))));
    }

    #[cfg(unix)]
    #[test]
    fn canonical_component_rejects_non_utf8() {
        use std::os::unix::ffi::OsStrExt;

        let name = OsStr::from_bytes(b"bad\xff");
        assert!(matches!(canonical_component(name), Err(PathError::NotUtf8(_))));
    }
}
