//! Layered configuration (spec §6).
//!
//! Recognized keys are loaded from up to four files, later overriding
//! earlier: `*.prefs` → `*.yaml` → `*.prefs.dev` → `*.yaml.dev`. `.yaml`
//! layers are ordinary YAML parsed with `serde_yaml`; `.prefs` layers use
//! the simple `key = value` grammar Concourse has historically shipped
//! (one assignment per line, `#` comments, blank lines ignored).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

fn default_buffer_directory() -> String {
    "~/concourse/buffer".to_string()
}

fn default_database_directory() -> String {
    "~/concourse/db".to_string()
}

fn default_buffer_page_size() -> usize {
    8192
}

fn default_max_search_substring_length() -> usize {
    40
}

fn default_num_transporter_threads() -> usize {
    1
}

fn default_environment() -> String {
    "default".to_string()
}

/// Engine configuration, merged from the layered config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for Buffer page files.
    pub buffer_directory: String,
    /// Root directory for Database block files. Must differ from
    /// `buffer_directory`.
    pub database_directory: String,
    /// Bytes per Buffer page.
    pub buffer_page_size: usize,
    /// Longest indexed search substring.
    pub max_search_substring_length: usize,
    /// Select batch vs. streaming transporter.
    pub enable_batch_transports: bool,
    /// Parallelism of the transport pipeline.
    pub num_transporter_threads: usize,
    /// Experimental: cache materialized search records per block.
    pub enable_search_cache: bool,
    /// Experimental: allow `verify` to reconstruct only the matching
    /// field by scanning in reverse version order.
    pub enable_verify_by_lookup: bool,
    /// Experimental: permit async data reads.
    pub enable_async_data_reads: bool,
    /// Experimental; treated as a documented no-op (spec §9 Open
    /// Question (b)).
    pub enable_compaction: bool,
    /// Experimental: a more compact on-disk metadata encoding.
    pub enable_efficient_metadata: bool,
    /// Environment selected when a client omits one.
    pub default_environment: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            buffer_directory: default_buffer_directory(),
            database_directory: default_database_directory(),
            buffer_page_size: default_buffer_page_size(),
            max_search_substring_length: default_max_search_substring_length(),
            enable_batch_transports: false,
            num_transporter_threads: default_num_transporter_threads(),
            enable_search_cache: false,
            enable_verify_by_lookup: false,
            enable_async_data_reads: false,
            enable_compaction: false,
            enable_efficient_metadata: false,
            default_environment: default_environment(),
        }
    }
}

/// Error produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a config file from disk.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A `.yaml`/`.yaml.dev` layer failed to parse.
    #[error("failed to parse YAML config {path}: {source}")]
    Yaml {
        /// Path that failed to parse.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_yaml::Error,
    },
    /// A `.prefs`/`.prefs.dev` layer had a malformed assignment line.
    #[error("malformed prefs line in {path}:{line}: {content:?}")]
    MalformedPrefs {
        /// Path containing the bad line.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// The offending line content.
        content: String,
    },
    /// `buffer_directory` and `database_directory` resolved to the same
    /// path.
    #[error("buffer_directory and database_directory must differ, both resolved to {0}")]
    DirectoriesCollide(PathBuf),
}

impl Config {
    /// Load configuration for `base` (e.g. `/etc/concourse/concourse`),
    /// layering `base.prefs` → `base.yaml` → `base.prefs.dev` →
    /// `base.yaml.dev`, each overriding fields set by the previous layer.
    /// Missing files are skipped; at least zero files need exist (defaults
    /// apply).
    pub fn load_layered(base: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        for suffix in [".prefs", ".yaml", ".prefs.dev", ".yaml.dev"] {
            let mut path = base.as_os_str().to_os_string();
            path.push(suffix);
            let path = PathBuf::from(path);
            if !path.exists() {
                continue;
            }
            if suffix.ends_with(".yaml") || suffix.ends_with(".yaml.dev") {
                config.merge_yaml_layer(&path)?;
            } else {
                config.merge_prefs_layer(&path)?;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants (spec §6: buffer/database
    /// directories must differ).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let buffer = expand_home(&self.buffer_directory);
        let database = expand_home(&self.database_directory);
        if buffer == database {
            return Err(ConfigError::DirectoriesCollide(buffer));
        }
        Ok(())
    }

    fn merge_yaml_layer(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let overrides: HashMap<String, serde_yaml::Value> =
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Yaml {
                path: path.to_path_buf(),
                source: e,
            })?;
        self.apply_overrides(overrides);
        Ok(())
    }

    fn merge_prefs_layer(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut overrides = HashMap::new();
        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::MalformedPrefs {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    content: raw_line.to_string(),
                });
            };
            overrides.insert(
                key.trim().to_string(),
                serde_yaml::Value::String(value.trim().to_string()),
            );
        }
        self.apply_overrides(overrides);
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: HashMap<String, serde_yaml::Value>) {
        macro_rules! apply {
            ($field:ident) => {
                if let Some(v) = overrides.get(stringify!($field)) {
                    if let Some(parsed) = Coerce::coerce(v) {
                        self.$field = parsed;
                    }
                }
            };
        }
        apply!(buffer_directory);
        apply!(database_directory);
        apply!(buffer_page_size);
        apply!(max_search_substring_length);
        apply!(enable_batch_transports);
        apply!(num_transporter_threads);
        apply!(enable_search_cache);
        apply!(enable_verify_by_lookup);
        apply!(enable_async_data_reads);
        apply!(enable_compaction);
        apply!(enable_efficient_metadata);
        apply!(default_environment);
    }
}

// Small coercion trait: prefs layers hand everything over as a YAML
// string, while yaml layers keep native scalar types. Each config field
// type knows how to accept either.
trait Coerce: Sized {
    fn coerce(v: &serde_yaml::Value) -> Option<Self>;
}

impl Coerce for String {
    fn coerce(v: &serde_yaml::Value) -> Option<Self> {
        match v {
            serde_yaml::Value::String(s) => Some(s.clone()),
            other => serde_yaml::to_string(other).ok(),
        }
    }
}

impl Coerce for usize {
    fn coerce(v: &serde_yaml::Value) -> Option<Self> {
        match v {
            serde_yaml::Value::Number(n) => n.as_u64().map(|n| n as usize),
            serde_yaml::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl Coerce for bool {
    fn coerce(v: &serde_yaml::Value) -> Option<Self> {
        match v {
            serde_yaml::Value::Bool(b) => Some(*b),
            serde_yaml::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Expand a leading `~` to the current user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_spec_table() {
        let config = Config::default();
        assert_eq!(config.buffer_page_size, 8192);
        assert_eq!(config.max_search_substring_length, 40);
        assert_eq!(config.num_transporter_threads, 1);
        assert_eq!(config.default_environment, "default");
        assert!(!config.enable_batch_transports);
    }

    #[test]
    fn prefs_layer_overrides_defaults() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("concourse");
        std::fs::write(
            format!("{}.prefs", base.display()),
            "buffer_page_size = 4096\nenable_batch_transports = true\n",
        )
        .unwrap();
        let config = Config::load_layered(&base).unwrap();
        assert_eq!(config.buffer_page_size, 4096);
        assert!(config.enable_batch_transports);
    }

    #[test]
    fn yaml_overrides_prefs() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("concourse");
        std::fs::write(
            format!("{}.prefs", base.display()),
            "buffer_page_size = 4096\n",
        )
        .unwrap();
        std::fs::write(
            format!("{}.yaml", base.display()),
            "buffer_page_size: 2048\n",
        )
        .unwrap();
        let config = Config::load_layered(&base).unwrap();
        assert_eq!(config.buffer_page_size, 2048);
    }

    #[test]
    fn dev_layer_overrides_yaml() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("concourse");
        std::fs::write(
            format!("{}.yaml", base.display()),
            "buffer_page_size: 2048\n",
        )
        .unwrap();
        std::fs::write(
            format!("{}.prefs.dev", base.display()),
            "buffer_page_size = 1024\n",
        )
        .unwrap();
        let config = Config::load_layered(&base).unwrap();
        assert_eq!(config.buffer_page_size, 1024);
    }

    #[test]
    fn colliding_directories_rejected() {
        let mut config = Config::default();
        config.buffer_directory = "/data/x".to_string();
        config.database_directory = "/data/x".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_files_keep_defaults() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("concourse");
        let config = Config::load_layered(&base).unwrap();
        assert_eq!(config.buffer_page_size, 8192);
    }
}
