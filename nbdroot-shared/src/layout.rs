//! Transient state file shared between boot stages.
//!
//! The command-line stage writes the raw `<host>:<port>` it matched; a later
//! mount-hook stage (a different process) re-derives the same `RemoteTarget`
//! from it instead of parsing the command line again.
//!
//! ```text
//! /run/nbdroot/
//! └── target        # single line: "<host>:<port>\n"
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::errors::{NbdrootError, NbdrootResult};

/// Handle to the transient state file.
///
/// # Example
///
/// ```
/// use nbdroot_shared::layout::StateFile;
///
/// let state = StateFile::new("/run/nbdroot/target");
/// assert_eq!(state.dir().unwrap().to_str(), Some("/run/nbdroot"));
/// ```
#[derive(Clone, Debug)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the file: {path}/..
    pub fn dir(&self) -> Option<&Path> {
        self.path.parent()
    }

    /// Persist the raw parameter value, replacing any previous content.
    pub fn write(&self, raw: &str) -> NbdrootResult<()> {
        if let Some(dir) = self.dir() {
            std::fs::create_dir_all(dir).map_err(|e| {
                NbdrootError::Storage(format!(
                    "Failed to create state directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        std::fs::write(&self.path, format!("{}\n", raw.trim())).map_err(|e| {
            NbdrootError::Storage(format!(
                "Failed to write state file {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Read the raw parameter value back.
    ///
    /// Returns `None` when the file does not exist or is empty, which callers
    /// treat the same as an absent boot parameter.
    pub fn read(&self) -> NbdrootResult<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let raw = content.trim();
                Ok((!raw.is_empty()).then(|| raw.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(NbdrootError::Storage(format!(
                "Failed to read state file {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let state = StateFile::new(dir.path().join("run/nbdroot/target"));

        state.write("10.0.0.5:10809").unwrap();
        assert_eq!(
            std::fs::read_to_string(state.path()).unwrap(),
            "10.0.0.5:10809\n"
        );
        assert_eq!(state.read().unwrap().as_deref(), Some("10.0.0.5:10809"));
    }

    #[test]
    fn test_write_replaces_previous_value() {
        let dir = TempDir::new().unwrap();
        let state = StateFile::new(dir.path().join("target"));

        state.write("10.0.0.5:10809").unwrap();
        state.write("10.0.0.6:10810").unwrap();
        assert_eq!(state.read().unwrap().as_deref(), Some("10.0.0.6:10810"));
    }

    #[test]
    fn test_missing_or_empty_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let state = StateFile::new(dir.path().join("target"));
        assert_eq!(state.read().unwrap(), None);

        std::fs::write(state.path(), "\n").unwrap();
        assert_eq!(state.read().unwrap(), None);
    }
}
