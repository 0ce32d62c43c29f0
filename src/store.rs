use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::model::Snapshot;

/// Persistence medium for the full snapshot.
///
/// The engine keeps the live snapshot in memory and hands the complete
/// document to `save` after every mutation; `load` is only used on open.
pub trait Store: Send {
    /// `Ok(None)` when the medium holds no data yet.
    fn load(&mut self) -> Result<Option<Snapshot>, StoreError>;
    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StoreError>;
}

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    Decode(serde_json::Error),
    Encode(serde_json::Error),
    /// Parsed, but a record breaks a snapshot invariant.
    Invalid(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "storage I/O error: {e}"),
            StoreError::Decode(e) => write!(f, "stored snapshot unreadable: {e}"),
            StoreError::Encode(e) => write!(f, "snapshot could not be encoded: {e}"),
            StoreError::Invalid(msg) => write!(f, "stored snapshot invalid: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            StoreError::Decode(e) | StoreError::Encode(e) => Some(e),
            StoreError::Invalid(_) => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

// ── In-memory ────────────────────────────────────────────────────

/// Keeps the last saved snapshot in memory. Clones share the same slot,
/// which lets a test reopen an engine over "the same" medium.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    saved: Arc<Mutex<Option<Snapshot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// What a fresh `load` would return.
    pub fn saved(&self) -> Option<Snapshot> {
        self.saved.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Store for MemoryStore {
    fn load(&mut self) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.saved())
    }

    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StoreError> {
        *self.saved.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        Ok(())
    }
}

// ── JSON document on disk ────────────────────────────────────────

/// One JSON document holding the whole snapshot.
///
/// Saves go to `<path>.tmp`, are fsynced, then renamed over `path`, so a
/// reader (or a crash) only ever sees a complete document.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Create the parent directory if needed. The file itself is created on
    /// first save.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }
}

impl Store for FileStore {
    fn load(&mut self) -> Result<Option<Snapshot>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(StoreError::Decode)
    }

    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let tmp_path = self.tmp_path();
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, snapshot).map_err(StoreError::Encode)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        tracing::debug!(
            "snapshot saved to {} ({} reservations, {} blocks)",
            self.path.display(),
            snapshot.reservations.len(),
            snapshot.blocks.len()
        );
        Ok(())
    }
}
