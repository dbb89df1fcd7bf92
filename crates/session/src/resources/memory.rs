// In-memory resource trees, one per reference point.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, bail, Result};
use tandem_common::filelist::FileList;
use tandem_common::path::{normalize_path, parent_entry};

use super::{sha256_hex, ReferencePoint, ResourceAccess, ResourceMember};

#[derive(Debug, Default, Clone)]
struct Tree {
    /// Keyed like manifests: directories end with `/`. `None` marks a directory.
    members: BTreeMap<String, Option<Vec<u8>>>,
    manifest: Option<FileList>,
    incomplete: bool,
}

impl Tree {
    fn require_parent(&self, key: &str) -> Result<()> {
        match parent_entry(key) {
            Some(parent) if !matches!(self.members.get(&parent), Some(None)) => {
                bail!("parent directory `{parent}` of `{key}` does not exist")
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryResources {
    trees: Mutex<HashMap<ReferencePoint, Tree>>,
}

impl MemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file, creating missing ancestor directories.
    pub fn insert_file(
        &self,
        reference_point: &ReferencePoint,
        path: &str,
        content: &[u8],
    ) -> Result<()> {
        let key = normalize_path(path)?;
        let mut trees = self.trees.lock().unwrap_or_else(PoisonError::into_inner);
        let tree = trees.entry(reference_point.clone()).or_default();
        let mut current = parent_entry(&key);
        while let Some(parent) = current {
            current = parent_entry(&parent);
            tree.members.entry(parent).or_insert(None);
        }
        tree.members.insert(key, Some(content.to_vec()));
        Ok(())
    }

    pub fn file_content(&self, reference_point: &ReferencePoint, path: &str) -> Option<Vec<u8>> {
        let trees = self.trees.lock().unwrap_or_else(PoisonError::into_inner);
        trees.get(reference_point)?.members.get(path)?.clone()
    }

    pub fn contains(&self, reference_point: &ReferencePoint, key: &str) -> bool {
        let trees = self.trees.lock().unwrap_or_else(PoisonError::into_inner);
        trees.get(reference_point).is_some_and(|tree| tree.members.contains_key(key))
    }
}

impl ResourceAccess for MemoryResources {
    fn list_members(&self, reference_point: &ReferencePoint) -> Result<Vec<ResourceMember>> {
        let trees = self.trees.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tree) = trees.get(reference_point) else {
            return Ok(Vec::new());
        };
        Ok(tree
            .members
            .iter()
            .map(|(key, content)| match content {
                None => ResourceMember::directory(key.trim_end_matches('/')),
                Some(content) => ResourceMember::file(key.clone(), sha256_hex(content)),
            })
            .collect())
    }

    fn create_directory(&self, reference_point: &ReferencePoint, path: &str) -> Result<()> {
        let key = format!("{}/", normalize_path(path)?);
        let mut trees = self.trees.lock().unwrap_or_else(PoisonError::into_inner);
        let tree = trees.entry(reference_point.clone()).or_default();
        tree.require_parent(&key)?;
        if tree.members.contains_key(key.trim_end_matches('/')) {
            bail!("`{key}` already exists as a file");
        }
        tree.members.insert(key, None);
        Ok(())
    }

    fn delete_resource(&self, reference_point: &ReferencePoint, path: &str) -> Result<()> {
        let key = normalize_path(path)?;
        let directory = format!("{key}/");
        let mut trees = self.trees.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tree) = trees.get_mut(reference_point) {
            tree.members.retain(|member, _| member != &key && !member.starts_with(&directory));
        }
        Ok(())
    }

    fn write_file_content(
        &self,
        reference_point: &ReferencePoint,
        path: &str,
        content: &[u8],
    ) -> Result<()> {
        let key = normalize_path(path)?;
        let mut trees = self.trees.lock().unwrap_or_else(PoisonError::into_inner);
        let tree = trees.entry(reference_point.clone()).or_default();
        tree.require_parent(&key)?;
        if matches!(tree.members.get(&format!("{key}/")), Some(None)) {
            bail!("`{key}` is a directory");
        }
        tree.members.insert(key, Some(content.to_vec()));
        Ok(())
    }

    fn read_file_content(&self, reference_point: &ReferencePoint, path: &str) -> Result<Vec<u8>> {
        self.file_content(reference_point, path)
            .ok_or_else(|| anyhow!("no file `{path}` in `{reference_point}`"))
    }

    fn write_manifest(&self, reference_point: &ReferencePoint, manifest: &FileList) -> Result<()> {
        let mut trees = self.trees.lock().unwrap_or_else(PoisonError::into_inner);
        trees.entry(reference_point.clone()).or_default().manifest = Some(manifest.clone());
        Ok(())
    }

    fn read_manifest(&self, reference_point: &ReferencePoint) -> Result<Option<FileList>> {
        let trees = self.trees.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(trees.get(reference_point).and_then(|tree| tree.manifest.clone()))
    }

    fn set_incomplete(&self, reference_point: &ReferencePoint, incomplete: bool) -> Result<()> {
        let mut trees = self.trees.lock().unwrap_or_else(PoisonError::into_inner);
        trees.entry(reference_point.clone()).or_default().incomplete = incomplete;
        Ok(())
    }

    fn is_incomplete(&self, reference_point: &ReferencePoint) -> Result<bool> {
        let trees = self.trees.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(trees.get(reference_point).is_some_and(|tree| tree.incomplete))
    }
}
