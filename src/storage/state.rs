//! Persistent resume positions.
//!
//! The state file is a JSON object mapping each collected path to the identity
//! of the file last read there and the offset up to which its events were
//! acknowledged. It is rewritten whole on every accepted checkpoint, through a
//! temp file renamed over the original so a crash never leaves it half written.

use crate::config::StartPosition;
use crate::source::event::FileIdentity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Acknowledged position within one specific file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub dev: u64,
    pub ino: u64,
    pub pos: u64,
}

impl Checkpoint {
    pub fn new(identity: FileIdentity, pos: u64) -> Self {
        Self {
            dev: identity.dev,
            ino: identity.ino,
            pos,
        }
    }

    pub fn identity(&self) -> FileIdentity {
        FileIdentity::new(self.dev, self.ino)
    }
}

#[derive(Debug)]
struct StateInner {
    file: PathBuf,
    entries: BTreeMap<PathBuf, Checkpoint>,
    active: HashMap<PathBuf, FileIdentity>,
}

/// Shared handle to the state file. Cloning is cheap; all clones see the same map.
#[derive(Debug, Clone)]
pub struct StateStore {
    inner: Arc<Mutex<StateInner>>,
}

impl StateStore {
    /// Load the state file. A missing or unreadable file gives an empty state.
    pub fn load(file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let entries = match fs::read(&file) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(file = %file.display(), error = %e, "state file is corrupt, starting cold");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(file = %file.display(), "no state file, starting cold");
                BTreeMap::new()
            }
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "cannot read state file, starting cold");
                BTreeMap::new()
            }
        };

        Self {
            inner: Arc::new(Mutex::new(StateInner {
                file,
                entries,
                active: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        // Entries are only replaced whole, so a poisoned map is still consistent
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, path: &Path) -> Option<Checkpoint> {
        self.lock().entries.get(path).copied()
    }

    pub fn entries(&self) -> BTreeMap<PathBuf, Checkpoint> {
        self.lock().entries.clone()
    }

    /// Decide where a collector opening `path` at startup should begin reading.
    pub fn resolve_start(&self, path: &Path, configured: StartPosition) -> StartPosition {
        let mut inner = self.lock();
        let Some(saved) = inner.entries.get(path).copied() else {
            return configured;
        };

        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(_) => {
                tracing::info!(path = %path.display(), "file gone since last run, forgetting its position");
                inner.entries.remove(path);
                if let Err(e) = inner.persist() {
                    tracing::warn!(error = %e, "failed to write state file");
                }
                return StartPosition::Offset(0);
            }
        };

        let identity = FileIdentity::from_metadata(&metadata);
        if identity != saved.identity() {
            tracing::info!(
                path = %path.display(),
                saved = %saved.identity(),
                current = %identity,
                "file replaced since last run, reading from start"
            );
            return StartPosition::Offset(0);
        }

        if metadata.len() < saved.pos {
            tracing::info!(
                path = %path.display(),
                size = metadata.len(),
                saved = saved.pos,
                "file truncated since last run, reading from start"
            );
            return StartPosition::Offset(0);
        }

        tracing::debug!(path = %path.display(), pos = saved.pos, "resuming from saved position");
        StartPosition::Offset(saved.pos)
    }

    /// Mark `identity` as the file currently being collected at `path`.
    pub fn record_active_file(&self, path: &Path, identity: FileIdentity) {
        tracing::debug!(path = %path.display(), %identity, "active file");
        self.lock().active.insert(path.to_path_buf(), identity);
    }

    pub fn active_file(&self, path: &Path) -> Option<FileIdentity> {
        self.lock().active.get(path).copied()
    }

    /// Apply acknowledged positions and persist the result.
    ///
    /// An update is dropped when the path already holds a checkpoint for a
    /// different file and the update's file is no longer the active one there.
    /// Returns how many updates were applied.
    pub fn checkpoint(&self, updates: &BTreeMap<PathBuf, Checkpoint>) -> Result<usize> {
        let mut inner = self.lock();
        let mut applied = 0;

        for (path, update) in updates {
            let accept = match inner.entries.get(path) {
                None => true,
                Some(existing) if existing.identity() == update.identity() => true,
                Some(_) => inner.active.get(path) == Some(&update.identity()),
            };

            if accept {
                inner.entries.insert(path.clone(), *update);
                applied += 1;
            } else {
                tracing::debug!(
                    path = %path.display(),
                    identity = %update.identity(),
                    pos = update.pos,
                    "ignoring checkpoint for superseded file"
                );
            }
        }

        if applied > 0 {
            inner.persist()?;
        }
        Ok(applied)
    }
}

impl StateInner {
    fn persist(&self) -> Result<()> {
        let mut temp = OsString::from(self.file.as_os_str());
        temp.push(".new");
        let temp = PathBuf::from(temp);

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StateError::Io { path, source }
        };

        if let Some(parent) = self.file.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
        }

        let file = File::create(&temp).map_err(io_err(&temp))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &self.entries)?;
        writer.flush().map_err(io_err(&temp))?;
        writer.get_ref().sync_all().map_err(io_err(&temp))?;
        drop(writer);

        fs::rename(&temp, &self.file).map_err(io_err(&self.file))?;
        Ok(())
    }
}
