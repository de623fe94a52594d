use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host name reported in every request. Defaults to the system host name.
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    pub network: NetworkConfig,
    #[serde(default)]
    pub spool: SpoolConfig,
    pub files: BTreeMap<PathBuf, FileConfig>,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("logship.state")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub servers: Vec<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_send_error_delay", with = "humantime_serde")]
    pub send_error_delay: Duration,
    #[serde(default = "default_recv_tries")]
    pub recv_tries: usize,
    #[serde(default = "default_recv_timeout", with = "humantime_serde")]
    pub recv_timeout: Duration,
}

fn default_send_error_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_recv_tries() -> usize {
    3
}

fn default_recv_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolConfig {
    /// Producers pause once this many events are queued.
    #[serde(default = "default_queue_high")]
    pub queue_high: usize,
    /// Paused producers resume when the queue drains down to this many.
    #[serde(default = "default_queue_low")]
    pub queue_low: usize,
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
    #[serde(default = "default_flush_size")]
    pub flush_size: usize,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            queue_high: default_queue_high(),
            queue_low: default_queue_low(),
            flush_interval: default_flush_interval(),
            flush_size: default_flush_size(),
        }
    }
}

fn default_queue_high() -> usize {
    2000
}

fn default_queue_low() -> usize {
    1500
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_flush_size() -> usize {
    1000
}

/// Per-file section of the config file, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default, with = "humantime_serde")]
    pub deadtime: Option<Duration>,
    #[serde(default)]
    pub chunksize: Option<usize>,
    #[serde(default)]
    pub startpos: Option<i64>,
    #[serde(default)]
    pub select_re: Option<String>,
    #[serde(default)]
    pub exclude_re: Option<String>,
    #[serde(default)]
    pub multiline_re: Option<String>,
    #[serde(default)]
    pub multiline_invert: bool,
    #[serde(default, with = "humantime_serde")]
    pub multiline_wait: Option<Duration>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

pub const DEFAULT_DELIMITER: &str = "\n";
pub const DEFAULT_DEADTIME: Duration = Duration::from_secs(60);
pub const DEFAULT_CHUNKSIZE: usize = 128 * 1024;
pub const DEFAULT_MULTILINE_WAIT: Duration = Duration::from_secs(5);
