//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, SwoodConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order).
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values.
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local). Only returns files
/// that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/swood/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("swood/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("swood.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<SwoodConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Merge `overlay` on top of `base`. Every field in `overlay` wins
/// unconditionally since each loaded file already starts from
/// `SwoodConfig::default()` via serde's `#[serde(default)]`.
pub fn merge_configs(_base: SwoodConfig, overlay: SwoodConfig) -> SwoodConfig {
    overlay
}

/// Apply `SWOOD_*` environment variable overrides in place.
pub fn apply_env_overrides(config: &mut SwoodConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("SWOOD_BINSIZE") {
        if let Ok(n) = v.parse() {
            config.render.binsize = n;
            sources.env_overrides.push("SWOOD_BINSIZE".to_string());
        }
    }
    if let Ok(v) = env::var("SWOOD_CACHESIZE") {
        if let Ok(n) = v.parse() {
            config.render.cachesize = n;
            sources.env_overrides.push("SWOOD_CACHESIZE".to_string());
        }
    }
    if let Ok(v) = env::var("SWOOD_THRESHOLD") {
        if let Ok(n) = v.parse() {
            config.render.threshold = n;
            sources.env_overrides.push("SWOOD_THRESHOLD".to_string());
        }
    }
    if let Ok(v) = env::var("SWOOD_TRANSPOSE") {
        if let Ok(n) = v.parse() {
            config.render.transpose = n;
            sources.env_overrides.push("SWOOD_TRANSPOSE".to_string());
        }
    }
    if let Ok(v) = env::var("SWOOD_SPEED") {
        if let Ok(n) = v.parse() {
            config.render.speed = n;
            sources.env_overrides.push("SWOOD_SPEED".to_string());
        }
    }
    if let Ok(v) = env::var("SWOOD_LOG_LEVEL") {
        config.log.level = v;
        sources.env_overrides.push("SWOOD_LOG_LEVEL".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn load_from_file_parses_render_section() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "[render]\nbinsize = 4096\nspeed = 2.0\n").unwrap();
        let config = load_from_file(f.path()).unwrap();
        assert_eq!(config.render.binsize, 4096);
        assert_eq!(config.render.speed, 2.0);
        // fields not present in the file keep RenderDefaults::default()
        assert_eq!(config.render.transpose, 0);
    }

    #[test]
    fn load_from_file_rejects_malformed_toml() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "this is not valid toml [[[").unwrap();
        let err = load_from_file(f.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn env_override_wins_over_file_default() {
        let mut config = SwoodConfig::default();
        let mut sources = ConfigSources::default();
        env::set_var("SWOOD_BINSIZE", "2048");
        apply_env_overrides(&mut config, &mut sources);
        env::remove_var("SWOOD_BINSIZE");
        assert_eq!(config.render.binsize, 2048);
        assert!(sources.env_overrides.contains(&"SWOOD_BINSIZE".to_string()));
    }
}
