// File-system backed reference points: one directory per reference point
// under a base directory. Transfer bookkeeping lives in `.tandem/` inside
// the reference point and is never listed as a member.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tandem_common::filelist::FileList;
use tandem_common::path::{canonical_component, normalize_path};

use super::hash::hash_file;
use super::{ReferencePoint, ResourceAccess, ResourceMember};

const META_DIR: &str = ".tandem";
const MANIFEST_FILE: &str = "manifest.json";
const INCOMPLETE_MARKER: &str = "incomplete";

#[derive(Debug, Clone)]
pub struct FsResources {
    base_dir: PathBuf,
}

impl FsResources {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn root(&self, reference_point: &ReferencePoint) -> PathBuf {
        self.base_dir.join(reference_point.name())
    }

    fn member_path(&self, reference_point: &ReferencePoint, path: &str) -> Result<PathBuf> {
        let normalized = normalize_path(path)?;
        let mut full = self.root(reference_point);
        full.extend(normalized.split('/'));
        Ok(full)
    }

    fn meta_dir(&self, reference_point: &ReferencePoint) -> Result<PathBuf> {
        let dir = self.root(reference_point).join(META_DIR);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create `{}`", dir.display()))?;
        Ok(dir)
    }

    fn ensure_root(&self, reference_point: &ReferencePoint) -> Result<()> {
        let root = self.root(reference_point);
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create reference point `{}`", root.display()))
    }

    fn walk(&self, dir: &Path, prefix: &str, members: &mut Vec<ResourceMember>) -> Result<()> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read directory `{}`", dir.display()))?;
        let mut entries = entries
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("failed to read directory `{}`", dir.display()))?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let file_name = entry.file_name();
            let name = canonical_component(&file_name)
                .with_context(|| format!("cannot share `{}`", entry.path().display()))?
                .to_string();
            if prefix.is_empty() && name == META_DIR {
                continue;
            }
            let relative = if prefix.is_empty() { name } else { format!("{prefix}/{name}") };
            let file_type = entry
                .file_type()
                .with_context(|| format!("failed to stat `{}`", entry.path().display()))?;
            if file_type.is_dir() {
                members.push(ResourceMember::directory(relative.clone()));
                self.walk(&entry.path(), &relative, members)?;
            } else if file_type.is_file() {
                members.push(ResourceMember::file(relative, hash_file(&entry.path())?));
            }
        }
        Ok(())
    }
}

impl ResourceAccess for FsResources {
    fn list_members(&self, reference_point: &ReferencePoint) -> Result<Vec<ResourceMember>> {
        let root = self.root(reference_point);
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let mut members = Vec::new();
        self.walk(&root, "", &mut members)?;
        Ok(members)
    }

    fn create_directory(&self, reference_point: &ReferencePoint, path: &str) -> Result<()> {
        self.ensure_root(reference_point)?;
        let full = self.member_path(reference_point, path)?;
        match std::fs::create_dir(&full) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::AlreadyExists && full.is_dir() => Ok(()),
            Err(error) => Err(error)
                .with_context(|| format!("failed to create directory `{}`", full.display())),
        }
    }

    fn delete_resource(&self, reference_point: &ReferencePoint, path: &str) -> Result<()> {
        let full = self.member_path(reference_point, path)?;
        let result = if full.is_dir() {
            std::fs::remove_dir_all(&full)
        } else {
            std::fs::remove_file(&full)
        };
        match result {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => {
                Err(error).with_context(|| format!("failed to delete `{}`", full.display()))
            }
        }
    }

    fn write_file_content(
        &self,
        reference_point: &ReferencePoint,
        path: &str,
        content: &[u8],
    ) -> Result<()> {
        self.ensure_root(reference_point)?;
        let full = self.member_path(reference_point, path)?;
        if full.is_dir() {
            bail!("`{}` is a directory", full.display());
        }
        std::fs::write(&full, content)
            .with_context(|| format!("failed to write `{}`", full.display()))
    }

    fn read_file_content(&self, reference_point: &ReferencePoint, path: &str) -> Result<Vec<u8>> {
        let full = self.member_path(reference_point, path)?;
        std::fs::read(&full).with_context(|| format!("failed to read `{}`", full.display()))
    }

    fn write_manifest(&self, reference_point: &ReferencePoint, manifest: &FileList) -> Result<()> {
        let path = self.meta_dir(reference_point)?.join(MANIFEST_FILE);
        let encoded = serde_json::to_vec_pretty(manifest).context("failed to encode manifest")?;
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, encoded)
            .with_context(|| format!("failed to write `{}`", staging.display()))?;
        std::fs::rename(&staging, &path)
            .with_context(|| format!("failed to replace `{}`", path.display()))
    }

    fn read_manifest(&self, reference_point: &ReferencePoint) -> Result<Option<FileList>> {
        let path = self.root(reference_point).join(META_DIR).join(MANIFEST_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error).with_context(|| format!("failed to read `{}`", path.display()))
            }
        };
        let manifest: FileList = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse `{}`", path.display()))?;
        Ok(Some(manifest.validated()?))
    }

    fn set_incomplete(&self, reference_point: &ReferencePoint, incomplete: bool) -> Result<()> {
        let marker = self.meta_dir(reference_point)?.join(INCOMPLETE_MARKER);
        if incomplete {
            std::fs::write(&marker, b"")
                .with_context(|| format!("failed to write `{}`", marker.display()))
        } else {
            match std::fs::remove_file(&marker) {
                Ok(()) => Ok(()),
                Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
                Err(error) => Err(error)
                    .with_context(|| format!("failed to remove `{}`", marker.display())),
            }
        }
    }

    fn is_incomplete(&self, reference_point: &ReferencePoint) -> Result<bool> {
        Ok(self.root(reference_point).join(META_DIR).join(INCOMPLETE_MARKER).is_file())
    }
}
