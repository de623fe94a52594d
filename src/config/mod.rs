pub mod parse;
pub mod settings;
pub mod types;

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub use parse::{load_config, ConfigError};
pub use settings::{FileSettings, MultilineSettings, Settings, StartPosition};
pub use types::Config;

/// Environment variable naming a config file, checked before the default locations.
pub const CONFIG_ENV: &str = "LOGSHIP_CONFIG";

/// Matches `$env{NAME}` references in config text.
pub(crate) fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex"))
}

/// Substitute `$env{NAME}` references. Unset variables stay as written so the
/// loader can report them.
pub fn expand_env_vars(text: &str) -> String {
    env_var_pattern()
        .replace_all(text, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Replace a leading `~` with the home directory, when there is one.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) if rest.as_os_str().is_empty() => home,
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

fn default_config_locations() -> Vec<PathBuf> {
    let mut locations = Vec::new();
    if let Some(config_dir) = dirs::home_dir().map(|home| home.join(".config/logship")) {
        locations.push(config_dir.join("config.yml"));
    }
    locations.push(PathBuf::from("/etc/logship/config.yml"));
    locations
}

/// Pick the config file to load.
///
/// An explicit path always wins, then `$LOGSHIP_CONFIG`. Otherwise the first
/// existing file among `~/.config/logship/config.yml` and
/// `/etc/logship/config.yml`.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }

    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Some(expand_tilde(Path::new(&path)));
    }

    default_config_locations().into_iter().find(|p| p.exists())
}
