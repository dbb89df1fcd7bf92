// File-list manifests and the path-based diff that drives resource transfer.
//
// A manifest maps a relative path to its content checksum. Directories are
// entries without a checksum and are keyed with a trailing `/`, so in the
// ordered map a directory always sorts before everything inside it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::path::{normalize_entry, parent_entry, PathError};

/// Hex-encoded content checksum.
pub type Checksum = String;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FileListError {
    #[error("invalid path '{path}': {source}")]
    InvalidPath { path: String, source: PathError },

    #[error("directory entry '{0}' must not carry a checksum")]
    DirectoryWithChecksum(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileList {
    entries: BTreeMap<String, Option<Checksum>>,
}

impl FileList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a manifest from raw `(path, checksum)` pairs, normalizing every path.
    pub fn from_entries<I, P>(entries: I) -> Result<Self, FileListError>
    where
        I: IntoIterator<Item = (P, Option<Checksum>)>,
        P: AsRef<str>,
    {
        let mut list = Self::new();
        for (path, checksum) in entries {
            let path = path.as_ref();
            match checksum {
                Some(checksum) => {
                    if path.ends_with('/') {
                        return Err(FileListError::DirectoryWithChecksum(path.to_string()));
                    }
                    list.insert_file(path, checksum)?;
                }
                None => list.insert_directory(path)?,
            }
        }
        Ok(list)
    }

    /// Insert a file and any missing ancestor directories.
    pub fn insert_file(
        &mut self,
        path: &str,
        checksum: impl Into<Checksum>,
    ) -> Result<(), FileListError> {
        let key = entry_key(path, false)?;
        self.insert_ancestors(&key);
        self.entries.insert(key, Some(checksum.into()));
        Ok(())
    }

    pub fn insert_directory(&mut self, path: &str) -> Result<(), FileListError> {
        let key = entry_key(path, true)?;
        self.insert_ancestors(&key);
        self.entries.insert(key, None);
        Ok(())
    }

    /// Re-check a manifest received from a peer.
    pub fn validated(self) -> Result<Self, FileListError> {
        Self::from_entries(self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// `Some(None)` for a directory, `Some(Some(checksum))` for a file.
    pub fn get(&self, path: &str) -> Option<Option<&str>> {
        self.entries.get(path).map(|checksum| checksum.as_deref())
    }

    pub fn checksum(&self, path: &str) -> Option<&str> {
        self.entries.get(path).and_then(|checksum| checksum.as_deref())
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|(path, checksum)| (path.as_str(), checksum.as_deref()))
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .filter_map(|(path, checksum)| checksum.as_deref().map(|sum| (path.as_str(), sum)))
    }

    pub fn directories(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, checksum)| checksum.is_none())
            .map(|(path, _)| path.as_str())
    }

    /// Keep only the given paths and the directories leading to them.
    pub fn restricted_to(&self, paths: &BTreeSet<String>) -> Self {
        let mut keep = BTreeSet::new();
        for path in paths {
            if !self.entries.contains_key(path) {
                continue;
            }
            keep.insert(path.clone());
            let mut current = parent_entry(path);
            while let Some(parent) = current {
                current = parent_entry(&parent);
                keep.insert(parent);
            }
        }

        let entries = self
            .entries
            .iter()
            .filter(|(path, _)| keep.contains(*path))
            .map(|(path, checksum)| (path.clone(), checksum.clone()))
            .collect();
        Self { entries }
    }

    /// Compare this (requester) manifest against the provider's manifest.
    pub fn diff(&self, provider: &FileList) -> FileListDiff {
        let mut diff = FileListDiff::default();

        for (path, local) in &self.entries {
            match provider.entries.get(path) {
                None => {
                    diff.removed.insert(path.clone());
                }
                Some(remote) => {
                    let is_directory = local.is_none() || remote.is_none();
                    if is_directory || local == remote {
                        diff.unaltered.insert(path.clone());
                    } else {
                        diff.altered.insert(path.clone());
                    }
                }
            }
        }

        for path in provider.entries.keys() {
            if !self.entries.contains_key(path) {
                diff.added.insert(path.clone());
            }
        }

        diff
    }

    fn insert_ancestors(&mut self, key: &str) {
        let mut current = parent_entry(key);
        while let Some(parent) = current {
            current = parent_entry(&parent);
            self.entries.entry(parent).or_insert(None);
        }
    }
}

fn entry_key(path: &str, is_directory: bool) -> Result<String, FileListError> {
    normalize_entry(path, is_directory)
        .map_err(|source| FileListError::InvalidPath { path: path.to_string(), source })
}

/// Four disjoint partitions of `keys(requester) ∪ keys(provider)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileListDiff {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub altered: BTreeSet<String>,
    pub unaltered: BTreeSet<String>,
}

impl FileListDiff {
    /// Directories to create, parents before children.
    pub fn added_directories(&self) -> impl Iterator<Item = &str> {
        self.added.iter().map(String::as_str).filter(|path| path.ends_with('/'))
    }

    /// Files whose content must be fetched from the provider.
    pub fn files_to_fetch(&self) -> BTreeSet<String> {
        self.added
            .iter()
            .chain(self.altered.iter())
            .filter(|path| !path.ends_with('/'))
            .cloned()
            .collect()
    }

    /// Resources to delete, children before parents.
    pub fn removal_order(&self) -> impl Iterator<Item = &str> {
        self.removed.iter().rev().map(String::as_str)
    }

    /// Removed entries that occupy a path the provider needs with the other
    /// type: a local file where a directory (or something inside one) is
    /// added, or a local directory (or its contents) where a file is added.
    /// They have to go before the added entries can be materialized.
    /// Children before parents, like `removal_order`.
    pub fn conflicting_removals(&self) -> Vec<&str> {
        self.removal_order()
            .filter(|removed| {
                let removed_path = removed.trim_end_matches('/');
                let removed_is_file = !removed.ends_with('/');
                self.added.iter().any(|added| {
                    let added_path = added.trim_end_matches('/');
                    let added_is_file = !added.ends_with('/');
                    added_path == removed_path
                        || (removed_is_file && is_below(added_path, removed_path))
                        || (added_is_file && is_below(removed_path, added_path))
                })
            })
            .collect()
    }

    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.altered.is_empty())
    }
}

fn is_below(path: &str, ancestor: &str) -> bool {
    path.strip_prefix(ancestor).is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[(&str, Option<&str>)]) -> FileList {
        FileList::from_entries(entries.iter().map(|(path, sum)| (*path, sum.map(str::to_string))))
            .unwrap()
    }

    fn set(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|path| path.to_string()).collect()
    }

    #[test]
    fn files_imply_parent_directories() {
        let mut files = FileList::new();
        files.insert_file("dir/sub/b.txt", "ck").unwrap();
        let paths: Vec<_> = files.paths().collect();
        assert_eq!(paths, vec!["dir/", "dir/sub/", "dir/sub/b.txt"]);
        assert_eq!(files.get("dir/"), Some(None));
        assert_eq!(files.checksum("dir/sub/b.txt"), Some("ck"));
    }

    #[test]
    fn directory_with_checksum_is_rejected() {
        let result = FileList::from_entries([("dir/", Some("ck".to_string()))]);
        assert_eq!(result, Err(FileListError::DirectoryWithChecksum("dir/".into())));
    }

    #[test]
    fn traversal_paths_are_rejected() {
        let result = FileList::from_entries([("../secret", Some("ck".to_string()))]);
        assert!(matches!(result, Err(FileListError::InvalidPath { .. })));
    }

    #[test]
    fn diff_partitions_paths() {
        let requester = list(&[
            ("a.txt", Some("1")),
            ("stale.txt", Some("9")),
            ("dir/", None),
            ("dir/b.txt", Some("old")),
        ]);
        let provider = list(&[
            ("a.txt", Some("1")),
            ("dir/", None),
            ("dir/b.txt", Some("new")),
            ("fresh/", None),
            ("fresh/c.txt", Some("3")),
        ]);

        let diff = requester.diff(&provider);
        assert_eq!(diff.added, set(&["fresh/", "fresh/c.txt"]));
        assert_eq!(diff.removed, set(&["stale.txt"]));
        assert_eq!(diff.altered, set(&["dir/b.txt"]));
        assert_eq!(diff.unaltered, set(&["a.txt", "dir/"]));
        assert!(diff.has_changes());
    }

    #[test]
    fn diff_orders_directory_creation_and_removal() {
        let requester = list(&[("gone/", None), ("gone/deep/", None), ("gone/deep/x", Some("1"))]);
        let provider = list(&[("new/", None), ("new/inner/", None), ("new/inner/y", Some("2"))]);

        let diff = requester.diff(&provider);
        let created: Vec<_> = diff.added_directories().collect();
        assert_eq!(created, vec!["new/", "new/inner/"]);
        let removed: Vec<_> = diff.removal_order().collect();
        assert_eq!(removed, vec!["gone/deep/x", "gone/deep/", "gone/"]);
        assert_eq!(diff.files_to_fetch(), set(&["new/inner/y"]));
    }

    #[test]
    fn file_replaced_by_directory_conflicts() {
        let requester = list(&[("x", Some("1")), ("keep.txt", Some("2")), ("old.txt", Some("3"))]);
        let provider = list(&[("x/y.txt", Some("4")), ("keep.txt", Some("2"))]);

        let diff = requester.diff(&provider);
        assert_eq!(diff.conflicting_removals(), vec!["x"]);
        let removed: Vec<_> = diff.removal_order().collect();
        assert_eq!(removed, vec!["x", "old.txt"]);
    }

    #[test]
    fn directory_replaced_by_file_conflicts_with_its_contents() {
        let requester = list(&[("x/", None), ("x/deep/", None), ("x/deep/z", Some("1"))]);
        let provider = list(&[("x", Some("2")), ("xy/", None)]);

        let diff = requester.diff(&provider);
        assert_eq!(diff.conflicting_removals(), vec!["x/deep/z", "x/deep/", "x/"]);
    }

    #[test]
    fn sibling_prefixes_do_not_conflict() {
        let requester = list(&[("doc", Some("1"))]);
        let provider = list(&[("docs/a.md", Some("2"))]);
        assert!(requester.diff(&provider).conflicting_removals().is_empty());
    }

    #[test]
    fn identical_lists_have_no_changes() {
        let a = list(&[("a.txt", Some("1")), ("dir/", None)]);
        assert!(!a.diff(&a.clone()).has_changes());
    }

    #[test]
    fn restriction_keeps_ancestors_only() {
        let full =
            list(&[("a.txt", Some("1")), ("dir/b.txt", Some("2")), ("dir/c.txt", Some("3"))]);
        let partial = full.restricted_to(&["dir/b.txt".to_string()].into());
        let paths: Vec<_> = partial.paths().collect();
        assert_eq!(paths, vec!["dir/", "dir/b.txt"]);
    }
}
