// Access to the local resources backing shared reference points.
//
// A reference point is the local handle of a shared resource group (a
// project directory). Resource negotiations read and write members through
// `ResourceAccess`; paths are relative to the reference point root and use
// `/` separators.

pub mod fs;
pub mod hash;
pub mod memory;

use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tandem_common::filelist::{Checksum, FileList};
use tandem_common::path::{normalize_path, PathError};

pub use fs::FsResources;
pub use hash::sha256_hex;
pub use memory::MemoryResources;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferencePoint(String);

impl ReferencePoint {
    /// A reference point name is a single normalized path component.
    pub fn new(name: &str) -> Result<Self, PathError> {
        let normalized = normalize_path(name)?;
        if normalized.contains('/') {
            return Err(PathError::InvalidComponent(normalized));
        }
        Ok(Self(normalized))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReferencePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMember {
    pub path: String,
    pub is_directory: bool,
    /// Content checksum; computed on demand when a backend leaves it out.
    pub checksum: Option<Checksum>,
}

impl ResourceMember {
    pub fn file(path: impl Into<String>, checksum: impl Into<Checksum>) -> Self {
        Self { path: path.into(), is_directory: false, checksum: Some(checksum.into()) }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self { path: path.into(), is_directory: true, checksum: None }
    }
}

pub trait ResourceAccess: Send + Sync {
    /// Every member below the reference point root, recursively.
    /// An unknown reference point has no members.
    fn list_members(&self, reference_point: &ReferencePoint) -> Result<Vec<ResourceMember>>;

    /// Create one directory; its parent must already exist.
    fn create_directory(&self, reference_point: &ReferencePoint, path: &str) -> Result<()>;

    /// Delete a file or a directory with everything below it.
    fn delete_resource(&self, reference_point: &ReferencePoint, path: &str) -> Result<()>;

    fn write_file_content(
        &self,
        reference_point: &ReferencePoint,
        path: &str,
        content: &[u8],
    ) -> Result<()>;

    fn read_file_content(&self, reference_point: &ReferencePoint, path: &str) -> Result<Vec<u8>>;

    /// Durably record the manifest the reference point is expected to match.
    fn write_manifest(&self, reference_point: &ReferencePoint, manifest: &FileList) -> Result<()>;

    fn read_manifest(&self, reference_point: &ReferencePoint) -> Result<Option<FileList>>;

    /// Mark the reference point as (not) partially transferred.
    fn set_incomplete(&self, reference_point: &ReferencePoint, incomplete: bool) -> Result<()>;

    fn is_incomplete(&self, reference_point: &ReferencePoint) -> Result<bool>;
}

/// Build the manifest of a reference point from its current members.
pub fn collect_file_list(
    access: &dyn ResourceAccess,
    reference_point: &ReferencePoint,
) -> Result<FileList> {
    let members = access
        .list_members(reference_point)
        .with_context(|| format!("failed to list members of `{reference_point}`"))?;

    let mut entries = Vec::with_capacity(members.len());
    for member in members {
        let checksum = match (member.is_directory, member.checksum) {
            (true, _) => None,
            (false, Some(checksum)) => Some(checksum),
            (false, None) => {
                let content = access.read_file_content(reference_point, &member.path)?;
                Some(sha256_hex(&content))
            }
        };
        let path = if member.is_directory { format!("{}/", member.path) } else { member.path };
        entries.push((path, checksum));
    }

    FileList::from_entries(entries)
        .with_context(|| format!("invalid member path in `{reference_point}`"))
}
