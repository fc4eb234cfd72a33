use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::DocumentError;
use crate::model::Slice;

/// Slice documents stored as `<dir>/<name>.json`.
#[derive(Debug, Clone)]
pub struct SliceDocuments {
    dir: PathBuf,
}

fn checked_name(name: &str) -> Result<&str, DocumentError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(name)
    } else {
        Err(DocumentError::InvalidName(name.to_string()))
    }
}

impl SliceDocuments {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> Result<PathBuf, DocumentError> {
        Ok(self.dir.join(format!("{}.json", checked_name(name)?)))
    }

    /// Writes the document through a temporary file so a crash never leaves
    /// a truncated slice behind.
    pub async fn save(&self, slice: &Slice) -> Result<PathBuf, DocumentError> {
        let path = self.path(&slice.name)?;
        fs::create_dir_all(&self.dir).await?;

        let staging = path.with_extension("json.tmp");
        fs::write(&staging, serde_json::to_vec_pretty(slice)?).await?;
        fs::rename(&staging, &path).await?;

        debug!(slice = %slice.name, path = %path.display(), "Slice document saved");
        Ok(path)
    }

    pub async fn load(&self, name: &str) -> Result<Slice, DocumentError> {
        let raw = fs::read(self.path(name)?).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Returns whether a document existed.
    pub async fn remove(&self, name: &str) -> Result<bool, DocumentError> {
        match fs::remove_file(self.path(name)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
