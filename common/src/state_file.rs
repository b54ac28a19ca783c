//! Small JSON documents persisted on a shared filesystem.
//!
//! Writes go to a temporary sibling first and are renamed into place, so a
//! reader never observes a half-written document. Callers are expected to
//! serialize writers with a [`crate::lock::FileLock`].

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{CommonError, ErrorContext, Result};

/// Read and decode the document at `path`. A missing file yields `Ok(None)`.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CommonError::io_error_with_source(
                format!("reading {}", path.display()),
                e,
            ));
        }
    };
    let value = serde_json::from_slice(&bytes)
        .with_decode_context(|| format!("decoding {}", path.display()))?;
    Ok(Some(value))
}

/// Encode `value` and atomically replace the document at `path`.
pub fn save<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content =
        serde_json::to_vec(value).with_encode_context(|| format!("encoding {}", path.display()))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_io_context(|| format!("creating directory {}", parent.display()))?;
    }

    let temp_path = temp_path_for(path);
    std::fs::write(&temp_path, &content)
        .with_io_context(|| format!("writing {}", temp_path.display()))?;
    std::fs::rename(&temp_path, path)
        .with_io_context(|| format!("renaming into {}", path.display()))?;

    debug!("Persisted {} ({} bytes)", path.display(), content.len());
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}.tmp.{}", name, std::process::id()))
}
