// ABOUTME: Resume positions and the file-backed checkpoint store
// ABOUTME: Saves are atomic (temp file + rename); the live position is shared via a watch channel

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::RelayError;

/// A point in the MySQL binary log.
///
/// `resume_stream = false` means "no resume semantics": the source starts
/// from the server's current position and `log_file`/`log_pos` are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePosition {
    pub log_file: String,
    pub log_pos: u64,
    #[serde(default)]
    pub resume_stream: bool,
}

impl ResumePosition {
    /// Start from the server's current position.
    pub fn fresh() -> Self {
        Self {
            log_file: String::new(),
            log_pos: 0,
            resume_stream: false,
        }
    }

    /// Resume exactly at `log_file:log_pos`.
    pub fn at(log_file: impl Into<String>, log_pos: u64) -> Self {
        Self {
            log_file: log_file.into(),
            log_pos,
            resume_stream: true,
        }
    }

    pub fn is_fresh(&self) -> bool {
        !self.resume_stream
    }
}

impl Default for ResumePosition {
    fn default() -> Self {
        Self::fresh()
    }
}

impl fmt::Display for ResumePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.resume_stream {
            write!(f, "{}:{}", self.log_file, self.log_pos)
        } else {
            f.write_str("<current>")
        }
    }
}

/// Durable storage for the last processed position.
pub trait CheckpointStore: Send + Sync {
    /// Load the stored position.
    ///
    /// Returns [`RelayError::CheckpointNotFound`] when nothing has been
    /// stored yet and [`RelayError::CheckpointCorrupt`] when the stored
    /// record cannot be used.
    fn load(&self) -> Result<ResumePosition, RelayError>;

    /// Replace the stored position. Never leaves a partially written record.
    fn save(&self, position: &ResumePosition) -> Result<(), RelayError>;
}

/// Checkpoint kept as a small JSON file.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default checkpoint location, relative to the working directory.
    pub fn default_path() -> PathBuf {
        PathBuf::from("mysql-replica-pos.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the checkpoint so the next run starts fresh. Returns whether a
    /// file was removed.
    pub fn clear(&self) -> io::Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn corrupt(&self, reason: impl fmt::Display) -> RelayError {
        RelayError::CheckpointCorrupt {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    fn save_failed(&self, reason: impl fmt::Display) -> RelayError {
        RelayError::CheckpointSave {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<ResumePosition, RelayError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(RelayError::CheckpointNotFound {
                    path: self.path.clone(),
                })
            }
            Err(err) => return Err(self.corrupt(format!("unreadable: {}", err))),
        };

        let position: ResumePosition =
            serde_json::from_str(&contents).map_err(|err| self.corrupt(err))?;

        if position.resume_stream && position.log_file.trim().is_empty() {
            return Err(self.corrupt("resumable checkpoint has an empty log_file"));
        }

        Ok(position)
    }

    fn save(&self, position: &ResumePosition) -> Result<(), RelayError> {
        // A stored checkpoint is always resumable.
        let record = ResumePosition {
            resume_stream: true,
            ..position.clone()
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .map_err(|err| self.save_failed(format!("cannot create {:?}: {}", dir, err)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|err| self.save_failed(format!("cannot create temp file: {}", err)))?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), &record)
            .map_err(|err| self.save_failed(err))?;
        tmp.as_file_mut()
            .flush()
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|err| self.save_failed(err))?;
        tmp.persist(&self.path)
            .map_err(|err| self.save_failed(err.error))?;

        tracing::debug!(path = %self.path.display(), position = %record, "checkpoint saved");
        Ok(())
    }
}

/// Writer half of the live position, owned by the relay.
#[derive(Debug)]
pub struct PositionTracker(watch::Sender<ResumePosition>);

impl PositionTracker {
    pub fn advance(&self, position: ResumePosition) {
        self.0.send_replace(position);
    }

    pub fn current(&self) -> ResumePosition {
        self.0.borrow().clone()
    }
}

/// Reader half of the live position, used by the shutdown path.
#[derive(Debug, Clone)]
pub struct PositionHandle(watch::Receiver<ResumePosition>);

impl PositionHandle {
    pub fn current(&self) -> ResumePosition {
        self.0.borrow().clone()
    }
}

/// Create the shared position starting at `initial`.
pub fn position_channel(initial: ResumePosition) -> (PositionTracker, PositionHandle) {
    let (tx, rx) = watch::channel(initial);
    (PositionTracker(tx), PositionHandle(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_position_is_not_resumable() {
        let position = ResumePosition::fresh();
        assert!(position.is_fresh());
        assert_eq!(position.to_string(), "<current>");
    }

    #[test]
    fn position_display_shows_file_and_offset() {
        let position = ResumePosition::at("mysql-bin.000012", 4711);
        assert_eq!(position.to_string(), "mysql-bin.000012:4711");
    }

    #[test]
    fn missing_resume_flag_defaults_to_false() {
        let position: ResumePosition =
            serde_json::from_str(r#"{"log_file": "mysql-bin.000001", "log_pos": 4}"#).unwrap();
        assert!(!position.resume_stream);
    }

    #[test]
    fn position_channel_shares_latest_value() {
        let (tracker, handle) = position_channel(ResumePosition::fresh());
        tracker.advance(ResumePosition::at("mysql-bin.000001", 120));
        tracker.advance(ResumePosition::at("mysql-bin.000001", 480));
        assert_eq!(handle.current(), ResumePosition::at("mysql-bin.000001", 480));
        assert_eq!(tracker.current(), handle.current());
    }

    #[test]
    fn save_into_working_directory_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("pos.json"));
        store.save(&ResumePosition::at("mysql-bin.000002", 9)).unwrap();
        assert!(store.path().exists());
        assert!(store.clear().unwrap());
        assert!(!store.clear().unwrap());
    }
}
