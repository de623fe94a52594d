//! Typed settings handed to the pipeline components.
//!
//! These are built once from [`Config`](super::types::Config) by
//! [`load_config`](super::parse::load_config); defaults are applied and every
//! pattern is compiled up front, so the components never see raw config values.

use regex::bytes::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::types::{DEFAULT_CHUNKSIZE, DEFAULT_DEADTIME, DEFAULT_DELIMITER, DEFAULT_MULTILINE_WAIT};

#[derive(Debug, Clone)]
pub struct Settings {
    pub hostname: String,
    pub state_file: PathBuf,
    pub network: NetworkSettings,
    pub spool: SpoolSettings,
    pub files: Vec<FileSettings>,
}

#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub servers: Vec<String>,
    pub client_id: Option<String>,
    pub send_error_delay: Duration,
    pub recv_tries: usize,
    pub recv_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SpoolSettings {
    pub queue_high: usize,
    pub queue_low: usize,
    pub flush_interval: Duration,
    pub flush_size: usize,
}

/// Where a collector starts reading when it first opens its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    End,
    Offset(u64),
}

impl StartPosition {
    /// Map the config convention (`-1` = end of file) to a position.
    pub fn from_config(startpos: i64) -> Option<Self> {
        match startpos {
            -1 => Some(StartPosition::End),
            n if n >= 0 => Some(StartPosition::Offset(n as u64)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultilineSettings {
    pub pattern: Regex,
    pub invert: bool,
    pub wait: Duration,
}

#[derive(Debug, Clone)]
pub struct FileSettings {
    pub path: PathBuf,
    pub delimiter: Vec<u8>,
    pub deadtime: Duration,
    pub chunk_size: usize,
    pub start: StartPosition,
    pub select: Option<Regex>,
    pub exclude: Option<Regex>,
    pub multiline: Option<MultilineSettings>,
    pub tags: Arc<BTreeMap<String, String>>,
}

impl FileSettings {
    /// Settings with every default applied, mostly useful in tests.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: DEFAULT_DELIMITER.as_bytes().to_vec(),
            deadtime: DEFAULT_DEADTIME,
            chunk_size: DEFAULT_CHUNKSIZE,
            start: StartPosition::End,
            select: None,
            exclude: None,
            multiline: None,
            tags: Arc::new(BTreeMap::new()),
        }
    }

    /// Whether a line passes the select/exclude filters.
    pub fn accepts(&self, line: &[u8]) -> bool {
        if let Some(select) = &self.select {
            if !select.is_match(line) {
                return false;
            }
        }
        match &self.exclude {
            Some(exclude) => !exclude.is_match(line),
            None => true,
        }
    }
}

impl MultilineSettings {
    pub fn new(pattern: Regex) -> Self {
        Self {
            pattern,
            invert: false,
            wait: DEFAULT_MULTILINE_WAIT,
        }
    }

    /// Continuation lines match the pattern, or fail to match it when inverted.
    pub fn is_continuation(&self, line: &[u8]) -> bool {
        self.pattern.is_match(line) != self.invert
    }
}
