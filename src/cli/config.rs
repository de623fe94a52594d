use crate::config::load_config;
use std::fs;
use std::path::{Path, PathBuf};

const SAMPLE_CONFIG: &str = include_str!("../../samples/sample-config.yml");

/// Write the sample config to `output`, the per-user config location, or stdout.
pub fn init(output: Option<PathBuf>, stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    if stdout {
        print!("{}", SAMPLE_CONFIG);
        return Ok(());
    }

    let config_path = match output {
        Some(path) => path,
        None => default_init_path(),
    };

    if config_path.exists() {
        eprintln!("Error: {} already exists", config_path.display());
        eprintln!("Remove it first or use --stdout to print the sample");
        std::process::exit(1);
    }

    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(&config_path, SAMPLE_CONFIG)?;

    println!("Config file written to {}", config_path.display());
    println!("Edit the files and network.servers sections, then run 'logship config check'");
    Ok(())
}

// ~/.config/logship when it can be created, otherwise /etc/logship
fn default_init_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".config/logship"))
        .filter(|dir| match fs::create_dir_all(dir) {
            Ok(()) => true,
            Err(e) => {
                eprintln!("Warning: cannot create {}: {}", dir.display(), e);
                false
            }
        })
        .unwrap_or_else(|| PathBuf::from("/etc/logship"))
        .join("config.yml")
}

/// Load and validate a config file, printing what it would collect.
pub fn check(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_config(config_path)?;

    println!("Config OK: {}", config_path.display());
    println!("  host:       {}", settings.hostname);
    println!("  state file: {}", settings.state_file.display());
    println!("  servers:    {}", settings.network.servers.join(", "));
    println!("  files:");
    for file in &settings.files {
        let mut notes = Vec::new();
        if file.multiline.is_some() {
            notes.push("multiline");
        }
        if file.select.is_some() || file.exclude.is_some() {
            notes.push("filtered");
        }
        if !file.tags.is_empty() {
            notes.push("tagged");
        }
        if notes.is_empty() {
            println!("    {}", file.path.display());
        } else {
            println!("    {} ({})", file.path.display(), notes.join(", "));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse::parse_config_str;

    #[test]
    fn test_embedded_sample_parses() {
        let config = parse_config_str(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.files.len(), 2);
    }

    #[test]
    fn test_init_writes_to_output_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("nested").join("config.yml");
        init(Some(target.clone()), false).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), SAMPLE_CONFIG);
    }
}
