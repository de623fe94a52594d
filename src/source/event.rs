use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Device + inode pair; two paths with the same identity are the same file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

impl FileIdentity {
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        // No inode on this platform: creation time stands in for the file index
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        if let Ok(created) = metadata.created() {
            created.hash(&mut hasher);
        }
        Self {
            dev: 0,
            ino: hasher.finish(),
        }
    }

    /// Identity of whatever the path currently refers to.
    pub fn of_path(path: &Path) -> std::io::Result<Self> {
        std::fs::metadata(path).map(|m| Self::from_metadata(&m))
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

/// One logical log record on its way to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub path: Arc<PathBuf>,
    pub line: Vec<u8>,
    pub identity: FileIdentity,
    /// Byte position right after this record's last line and delimiter.
    pub offset: u64,
    pub tags: Arc<BTreeMap<String, String>>,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    pub fn new(
        path: Arc<PathBuf>,
        line: Vec<u8>,
        identity: FileIdentity,
        offset: u64,
        tags: Arc<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            path,
            line,
            identity,
            offset,
            tags,
            timestamp: Utc::now(),
        }
    }

    /// Merge a continuation line into this event.
    ///
    /// The merged event resumes after the continuation, so it takes over its
    /// identity and offset.
    pub fn append(&mut self, continuation: LogEvent) {
        self.line.push(b'\n');
        self.line.extend_from_slice(&continuation.line);
        self.identity = continuation.identity;
        self.offset = continuation.offset;
    }

    pub fn message(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.line)
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LogEvent[{}({}): pos={} log={}]",
            self.path.display(),
            self.identity,
            self.offset,
            self.message()
        )
    }
}
