//! Versioned JSON state files.
//!
//! Every file-backed store in pipebot keeps a single JSON document carrying a
//! `schema_version`. Files are replaced through a temp file in the same
//! directory so readers never observe a partial write.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateFileError {
    #[error("unsupported state schema in {path}: expected {expected}, found {found}")]
    UnsupportedSchema {
        path: PathBuf,
        expected: u32,
        found: u32,
    },
    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode {path}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode state for {path}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A document persisted with [`load_state`] and [`save_state`]. `Default`
/// must produce an empty document stamped with `SCHEMA_VERSION`.
pub trait VersionedState: Serialize + DeserializeOwned + Default {
    const SCHEMA_VERSION: u32;

    fn schema_version(&self) -> u32;
}

/// Reads the document at `path`. A missing file yields `T::default()`.
pub fn load_state<T: VersionedState>(path: &Path) -> Result<T, StateFileError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(StateFileError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let state = serde_json::from_str::<T>(&raw).map_err(|source| StateFileError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    if state.schema_version() != T::SCHEMA_VERSION {
        return Err(StateFileError::UnsupportedSchema {
            path: path.to_path_buf(),
            expected: T::SCHEMA_VERSION,
            found: state.schema_version(),
        });
    }
    Ok(state)
}

pub fn save_state<T: VersionedState>(path: &Path, state: &T) -> Result<(), StateFileError> {
    let mut payload =
        serde_json::to_vec_pretty(state).map_err(|source| StateFileError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
    payload.push(b'\n');
    replace_file(path, &payload).map_err(|source| StateFileError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn replace_file(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(payload)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|error| error.error)?;
    Ok(())
}
