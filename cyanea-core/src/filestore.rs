//! Staging helpers shared by filestore implementations.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CyaneaError, CyaneaResult};
use crate::plugin::Filestore;

/// Normalizes a store-relative path, refusing anything that could escape
/// the store root.
///
/// Leading `/` and `.` components are dropped; `..` components and NUL
/// characters are rejected.
pub fn normalize_path(relative: &str) -> CyaneaResult<PathBuf> {
    if relative.contains('\0') {
        return Err(CyaneaError::InvalidPath(relative.to_string()));
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(CyaneaError::InvalidPath(relative.to_string()));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(CyaneaError::InvalidPath(relative.to_string()));
    }

    Ok(normalized)
}

/// A file staged for commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    /// Normalized path relative to the store root, `/`-separated
    pub path: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

/// Thread-safe staging area; one path may only be staged once.
#[derive(Debug, Default)]
pub struct StagedFiles {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl StagedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self, path: &str, content: Vec<u8>) -> CyaneaResult<()> {
        let normalized = normalize_path(path)?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        if files.contains_key(&normalized) {
            return Err(CyaneaError::FileAlreadyStaged(normalized));
        }
        files.insert(normalized, content);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.files.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns everything staged so far, in path order.
    pub fn take(&self) -> Vec<StagedFile> {
        let files = std::mem::take(&mut *self.files.lock().unwrap_or_else(|e| e.into_inner()));
        files
            .into_iter()
            .map(|(path, content)| StagedFile { path, content })
            .collect()
    }
}

/// A filestore that only stages; committing is up to whoever drains it.
///
/// Used where a sink runs apart from the real filestore (e.g. inside an
/// external plugin process) and its output is shipped back to the host.
#[derive(Debug, Default)]
pub struct StagingFilestore {
    pub staged: StagedFiles,
}

#[async_trait]
impl Filestore for StagingFilestore {
    async fn write_file(&self, path: &str, content: Vec<u8>) -> anyhow::Result<()> {
        Ok(self.staged.stage(path, content)?)
    }

    async fn commit(&self) -> anyhow::Result<()> {
        anyhow::bail!("sinks cannot commit the filestore")
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
