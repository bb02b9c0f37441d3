//! Minimal configuration loading for the swood renderer.
//!
//! This crate is deliberately tiny — it is imported by both the core engine
//! and the CLI collaborator, so it carries no dependency on the rendering
//! stack itself.
//!
//! # Configuration philosophy
//!
//! Everything here seeds the renderer's numeric knobs (binsize, cachesize,
//! threshold, transpose, speed) and output defaults (sample width, chunk
//! size). A soundfont bundle's own `[arguments]` section, if present, wins
//! over all of this at render time — that merge happens in `swood-core`, not
//! here.
//!
//! # Config file locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/swood/config.toml` (system)
//! 2. `~/.config/swood/config.toml` (user)
//! 3. `./swood.toml` (local override)
//! 4. Environment variables (`SWOOD_*`)
//!
//! # Example config
//!
//! ```toml
//! [render]
//! binsize = 8192
//! cachesize = 7.5
//! threshold = 0.075
//! transpose = 0
//! speed = 1.0
//!
//! [output]
//! sample_width = 4
//! chunk_frames = 32768
//!
//! [log]
//! level = "info"
//! ```

pub mod loader;

pub use loader::{ConfigSources, discover_config_files_with_override};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Numeric knobs the renderer seeds from at startup.
///
/// A soundfont bundle's `[arguments]` section may override any of these
/// per-render; this struct only supplies the defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderDefaults {
    pub binsize: u32,
    pub cachesize: f64,
    pub threshold: f64,
    pub transpose: i32,
    pub speed: f64,
}

impl Default for RenderDefaults {
    fn default() -> Self {
        RenderDefaults {
            binsize: 8192,
            cachesize: 7.5,
            threshold: 0.075,
            transpose: 0,
            speed: 1.0,
        }
    }
}

/// Output sink defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputDefaults {
    pub sample_width: u8,
    pub chunk_frames: usize,
}

impl Default for OutputDefaults {
    fn default() -> Self {
        OutputDefaults {
            sample_width: 4,
            chunk_frames: 32768,
        }
    }
}

/// Logging defaults, consumed by the CLI collaborator when it installs a
/// `tracing` subscriber.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogDefaults {
    pub level: String,
}

impl Default for LogDefaults {
    fn default() -> Self {
        LogDefaults {
            level: "info".to_string(),
        }
    }
}

/// Complete swood configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SwoodConfig {
    pub render: RenderDefaults,
    pub output: OutputDefaults,
    pub log: LogDefaults,
}

impl SwoodConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, preferring `config_path` over the local
    /// `./swood.toml` override when given.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report which files/env vars contributed.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = SwoodConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = SwoodConfig::default();
        assert_eq!(config.render.binsize, 8192);
        assert_eq!(config.render.cachesize, 7.5);
        assert_eq!(config.render.threshold, 0.075);
        assert_eq!(config.render.transpose, 0);
        assert_eq!(config.render.speed, 1.0);
        assert_eq!(config.output.sample_width, 4);
    }

    #[test]
    fn load_with_no_files_present_yields_defaults() {
        let config = SwoodConfig::load().unwrap();
        assert_eq!(config, SwoodConfig::default());
    }
}
