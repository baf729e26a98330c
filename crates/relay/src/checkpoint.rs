//! Resumption checkpoint
//!
//! The checkpoint is the `(timestamp, id)` pair of the last event that was
//! successfully shown to the user. It is persisted as two plain files in the
//! cache directory, `lastOnline` and `lastId`, each holding the raw value with
//! no trailing newline or structure.

use std::cmp::Ordering;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::CheckpointError;
use crate::event::Event;

/// File holding the last-seen timestamp
pub const LAST_ONLINE_KEY: &str = "lastOnline";
/// File holding the last-seen event id
pub const LAST_ID_KEY: &str = "lastId";

/// In-memory resumption watermark
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub last_seen_timestamp: String,
    pub last_seen_id: String,
}

impl Checkpoint {
    pub fn new(timestamp: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            last_seen_timestamp: timestamp.into(),
            last_seen_id: id.into(),
        }
    }

    /// True when no event has ever been delivered
    pub fn is_empty(&self) -> bool {
        self.last_seen_timestamp.is_empty() && self.last_seen_id.is_empty()
    }

    /// Whether `event` is the boundary event already delivered before the checkpoint was taken
    pub fn is_boundary(&self, event: &Event) -> bool {
        !self.last_seen_id.is_empty() && event.id == self.last_seen_id
    }

    /// Move the watermark to `event`.
    ///
    /// Both fields change together. An event strictly older than the current
    /// watermark leaves it untouched so interleaved producers cannot move it
    /// backwards. Returns whether the watermark moved.
    pub fn advance(&mut self, event: &Event) -> bool {
        if compare_timestamps(&event.time, &self.last_seen_timestamp) == Some(Ordering::Less) {
            return false;
        }
        self.last_seen_timestamp = event.time.clone();
        self.last_seen_id = event.id.clone();
        true
    }
}

/// Numeric comparison of two raw timestamps; `None` if either is not a number
fn compare_timestamps(a: &str, b: &str) -> Option<Ordering> {
    let a: f64 = a.trim().parse().ok()?;
    let b: f64 = b.trim().parse().ok()?;
    a.partial_cmp(&b)
}

/// Durable per-key file store for the checkpoint
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Load the checkpoint; a missing file yields an empty field
    pub fn load(&self) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Checkpoint {
            last_seen_timestamp: self.read_key(LAST_ONLINE_KEY)?,
            last_seen_id: self.read_key(LAST_ID_KEY)?,
        };
        debug!(
            cache_dir = %self.dir.display(),
            last_online = %checkpoint.last_seen_timestamp,
            last_id = %checkpoint.last_seen_id,
            "loaded checkpoint"
        );
        Ok(checkpoint)
    }

    /// Write both keys
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.write_key(LAST_ONLINE_KEY, &checkpoint.last_seen_timestamp)?;
        self.write_key(LAST_ID_KEY, &checkpoint.last_seen_id)?;
        debug!(
            cache_dir = %self.dir.display(),
            last_online = %checkpoint.last_seen_timestamp,
            last_id = %checkpoint.last_seen_id,
            "saved checkpoint"
        );
        Ok(())
    }

    fn read_key(&self, key: &str) -> Result<String, CheckpointError> {
        let path = self.path(key);
        match fs::read_to_string(&path) {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(source) => Err(CheckpointError::Read { path, source }),
        }
    }

    fn write_key(&self, key: &str, value: &str) -> Result<(), CheckpointError> {
        let path = self.path(key);
        fs::write(&path, value).map_err(|source| CheckpointError::Write { path, source })
    }
}
