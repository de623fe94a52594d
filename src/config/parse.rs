use super::settings::{
    FileSettings, MultilineSettings, NetworkSettings, Settings, SpoolSettings, StartPosition,
};
use super::types::*;
use crate::config::{env_var_pattern, expand_env_vars, expand_tilde};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Settings, ConfigError> {
    build_settings(load_raw_config(path)?)
}

/// Read a config file, expand `$env{..}` references and `~` paths, and parse it
/// without validating.
pub fn load_raw_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml = fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    let yaml = expand_env_vars(&yaml);
    check_unexpanded_vars(&yaml)?;

    let mut config = parse_config_str(&yaml).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        ))
    })?;

    expand_paths(&mut config);
    Ok(config)
}

pub fn parse_config_str(yaml: &str) -> Result<Config, ConfigError> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let mut unexpanded_vars: Vec<String> = env_var_pattern()
        .captures_iter(yaml_string)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    Err(ConfigError::Validation(format!(
        "environment variables are not set: {}",
        unexpanded_vars.join(", ")
    )))
}

/// Expands tilde (~) in the state file and every collected path.
fn expand_paths(config: &mut Config) {
    config.state_file = expand_tilde(&config.state_file);
    config.files = std::mem::take(&mut config.files)
        .into_iter()
        .map(|(path, file_config)| (expand_tilde(&path), file_config))
        .collect();
}

/// Validate the raw config and turn it into typed settings.
///
/// Every problem is collected so the operator sees all of them at once.
pub fn build_settings(config: Config) -> Result<Settings, ConfigError> {
    let mut errors = Vec::new();

    if config.network.servers.is_empty() {
        errors.push("network.servers must contain at least one address".to_string());
    }
    if config.network.recv_tries == 0 {
        errors.push("network.recv_tries must be at least 1".to_string());
    }
    if config.spool.queue_high == 0 {
        errors.push("spool.queue_high must be at least 1".to_string());
    } else if config.spool.queue_low >= config.spool.queue_high {
        errors.push(format!(
            "spool.queue_low ({}) must be below spool.queue_high ({})",
            config.spool.queue_low, config.spool.queue_high
        ));
    }
    if config.spool.flush_size == 0 {
        errors.push("spool.flush_size must be at least 1".to_string());
    }
    if config.files.is_empty() {
        errors.push("files must contain at least one log file".to_string());
    }

    let mut files = Vec::with_capacity(config.files.len());
    for (path, file_config) in &config.files {
        if let Some(settings) = build_file_settings(path, file_config, &mut errors) {
            files.push(settings);
        }
    }

    if !errors.is_empty() {
        return Err(ConfigError::ValidationList(errors));
    }

    let hostname = config.hostname.clone().unwrap_or_else(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.to_str().map(|s| s.to_string()))
            .unwrap_or_else(|| "localhost".to_string())
    });

    Ok(Settings {
        hostname,
        state_file: config.state_file,
        network: NetworkSettings {
            servers: config.network.servers,
            client_id: config.network.client_id,
            send_error_delay: config.network.send_error_delay,
            recv_tries: config.network.recv_tries,
            recv_timeout: config.network.recv_timeout,
        },
        spool: SpoolSettings {
            queue_high: config.spool.queue_high,
            queue_low: config.spool.queue_low,
            flush_interval: config.spool.flush_interval,
            flush_size: config.spool.flush_size,
        },
        files,
    })
}

/// Event fields on the wire; tags are flattened next to them.
const RESERVED_TAGS: &[&str] = &["ts", "file", "msg"];

fn build_file_settings(
    path: &PathBuf,
    config: &FileConfig,
    errors: &mut Vec<String>,
) -> Option<FileSettings> {
    let prefix = format!("file '{}'", path.display());
    let errors_before = errors.len();

    if !path.is_absolute() {
        errors.push(format!("{}: path must be absolute", prefix));
    }

    let delimiter = config
        .delimiter
        .clone()
        .unwrap_or_else(|| DEFAULT_DELIMITER.to_string());
    if delimiter.is_empty() {
        errors.push(format!("{}: delimiter cannot be empty", prefix));
    }

    let chunk_size = config.chunksize.unwrap_or(DEFAULT_CHUNKSIZE);
    if chunk_size == 0 {
        errors.push(format!("{}: chunksize must be at least 1", prefix));
    }

    let start = match StartPosition::from_config(config.startpos.unwrap_or(-1)) {
        Some(start) => start,
        None => {
            errors.push(format!(
                "{}: startpos must be -1 (end of file) or a byte offset",
                prefix
            ));
            StartPosition::End
        }
    };

    for key in config.tags.keys() {
        if RESERVED_TAGS.contains(&key.as_str()) {
            errors.push(format!("{}: tag '{}' clashes with an event field", prefix, key));
        }
    }

    let select = compile_pattern(&prefix, "select_re", config.select_re.as_deref(), errors);
    let exclude = compile_pattern(&prefix, "exclude_re", config.exclude_re.as_deref(), errors);
    let multiline = compile_pattern(
        &prefix,
        "multiline_re",
        config.multiline_re.as_deref(),
        errors,
    )
    .map(|pattern| MultilineSettings {
        pattern,
        invert: config.multiline_invert,
        wait: config.multiline_wait.unwrap_or(DEFAULT_MULTILINE_WAIT),
    });

    if errors.len() > errors_before {
        return None;
    }

    Some(FileSettings {
        path: path.clone(),
        delimiter: delimiter.into_bytes(),
        deadtime: config.deadtime.unwrap_or(DEFAULT_DEADTIME),
        chunk_size,
        start,
        select,
        exclude,
        multiline,
        tags: Arc::new(config.tags.clone()),
    })
}

fn compile_pattern(
    prefix: &str,
    field: &str,
    pattern: Option<&str>,
    errors: &mut Vec<String>,
) -> Option<regex::bytes::Regex> {
    let pattern = pattern?;
    match regex::bytes::Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            errors.push(format!(
                "{}: invalid {} '{}': {}",
                prefix, field, pattern, e
            ));
            None
        }
    }
}
