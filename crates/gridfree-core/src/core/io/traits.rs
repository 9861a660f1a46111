use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse snapshot '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize snapshot '{path}': {source}")]
    Serialize {
        path: String,
        #[source]
        source: toml::ser::Error,
    },
    #[error("Snapshot '{path}' has format version {found}, expected {expected}")]
    Version {
        path: String,
        found: u32,
        expected: u32,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.to_string_lossy().to_string(),
        source,
    }
}

/// Writes `contents` next to `path` under a temporary name, then renames it
/// over `path`. Readers never observe a partially written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), SnapshotError> {
    let mut tmp = PathBuf::from(path);
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".tmp{}", std::process::id()));
    tmp.set_file_name(name);

    let file = File::create(&tmp).map_err(io_error(&tmp))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(contents).map_err(io_error(&tmp))?;
    let file = writer
        .into_inner()
        .map_err(|e| io_error(&tmp)(e.into_error()))?;
    file.sync_all().map_err(io_error(&tmp))?;
    fs::rename(&tmp, path).map_err(io_error(path))
}

/// A typed, versioned document persisted as TOML.
///
/// Implementors carry their own format version; reading a document written
/// with a different version fails instead of guessing at the layout.
pub trait SnapshotFile: Serialize + DeserializeOwned {
    /// Version written by this build.
    const FORMAT_VERSION: u32;

    /// Version stored in the document itself.
    fn format_version(&self) -> u32;

    /// Reads and validates a snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or was
    /// written with another format version.
    fn read_from_path(path: &Path) -> Result<Self, SnapshotError> {
        let text = fs::read_to_string(path).map_err(io_error(path))?;
        let snapshot: Self = toml::from_str(&text).map_err(|e| SnapshotError::Parse {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        if snapshot.format_version() != Self::FORMAT_VERSION {
            return Err(SnapshotError::Version {
                path: path.to_string_lossy().to_string(),
                found: snapshot.format_version(),
                expected: Self::FORMAT_VERSION,
            });
        }
        Ok(snapshot)
    }

    /// Serializes and atomically replaces the file at `path`.
    fn write_to_path(&self, path: &Path) -> Result<(), SnapshotError> {
        let text = toml::to_string(self).map_err(|e| SnapshotError::Serialize {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        write_atomic(path, text.as_bytes())
    }
}
