//! Engine configuration via `folio.toml`.
//!
//! The file lives next to the archive directory and is created with
//! defaults on first start. Every field is optional in the file; missing
//! fields fall back to their defaults.

use folio_bundle::DEFAULT_CEILING_BYTES;
use folio_core::{ArchiveError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name.
pub const CONFIG_FILE_NAME: &str = "folio.toml";

/// Default retention window in days.
pub const DEFAULT_RETENTION_DAYS: u64 = 7;

/// Default zstd compression level.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

const MIN_COMPRESSION_LEVEL: i32 = 1;
const MAX_COMPRESSION_LEVEL: i32 = 22;

fn default_instance_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("archives")
}

fn default_quota_bytes() -> u64 {
    DEFAULT_CEILING_BYTES
}

fn default_retention_days() -> u64 {
    DEFAULT_RETENTION_DAYS
}

fn default_compression_level() -> i32 {
    DEFAULT_COMPRESSION_LEVEL
}

fn default_parallel_fetch() -> bool {
    true
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of this instance, used for absolute links to content left out of an archive.
    #[serde(default = "default_instance_url")]
    pub instance_url: String,
    /// Directory where export jobs write their archives.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    /// Per-job ceiling on archive bytes.
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,
    /// Archives older than this many days are removed by the retention sweep.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    /// zstd level, 1-22.
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    /// Fetch attachment binaries and filestore files in parallel.
    #[serde(default = "default_parallel_fetch")]
    pub parallel_fetch: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_url: default_instance_url(),
            archive_dir: default_archive_dir(),
            quota_bytes: default_quota_bytes(),
            retention_days: default_retention_days(),
            compression_level: default_compression_level(),
            parallel_fetch: default_parallel_fetch(),
        }
    }
}

impl EngineConfig {
    /// Config rooted at an archive directory, everything else default.
    pub fn with_archive_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: dir.into(),
            ..Self::default()
        }
    }

    /// Override the instance URL.
    pub fn instance_url(mut self, url: impl Into<String>) -> Self {
        self.instance_url = url.into();
        self
    }

    /// Override the per-job quota.
    pub fn quota_bytes(mut self, bytes: u64) -> Self {
        self.quota_bytes = bytes;
        self
    }

    /// Override the retention window.
    pub fn retention_days(mut self, days: u64) -> Self {
        self.retention_days = days;
        self
    }

    /// Enable or disable parallel fetching.
    pub fn parallel_fetch(mut self, parallel: bool) -> Self {
        self.parallel_fetch = parallel;
        self
    }

    /// Retention window as a duration.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 60 * 60))
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.instance_url.trim().is_empty() {
            return Err(ArchiveError::invalid_config("instance_url must not be empty"));
        }
        if self.quota_bytes == 0 {
            return Err(ArchiveError::invalid_config("quota_bytes must be positive"));
        }
        if !(MIN_COMPRESSION_LEVEL..=MAX_COMPRESSION_LEVEL).contains(&self.compression_level) {
            return Err(ArchiveError::invalid_config(format!(
                "compression_level must be between {} and {}, got {}",
                MIN_COMPRESSION_LEVEL, MAX_COMPRESSION_LEVEL, self.compression_level
            )));
        }
        Ok(())
    }

    /// Absolute URL of a global id on this instance.
    pub fn global_url(&self, global_id: &str) -> String {
        format!(
            "{}/globalId/{}",
            self.instance_url.trim_end_matches('/'),
            global_id
        )
    }

    /// Default config file content.
    pub fn default_toml() -> &'static str {
        r#"# Folio archive engine configuration

# Base URL of this instance. Links to content left out of an archive
# point here.
instance_url = "http://localhost:8080"

# Where export jobs write their archives.
archive_dir = "archives"

# Per-job ceiling on archive bytes (2 GiB).
quota_bytes = 2147483648

# Archives older than this are removed by the retention sweep.
retention_days = 7

# zstd compression level, 1-22.
compression_level = 3

# Fetch attachment binaries and filestore files in parallel.
parallel_fetch = true
"#
    }

    /// Read and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ArchiveError::invalid_config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: EngineConfig = toml::from_str(&content).map_err(|e| {
            ArchiveError::invalid_config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config if no file exists yet.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                ArchiveError::invalid_config(format!(
                    "Failed to write default config '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to a file.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            ArchiveError::invalid_config(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(path, content).map_err(|e| {
            ArchiveError::invalid_config(format!(
                "Failed to write config '{}': {}",
                path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.quota_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.retention(), Duration::from_secs(7 * 86400));
    }

    #[test]
    fn huge_retention_saturates() {
        let config: EngineConfig =
            toml::from_str(&format!("retention_days = {}", i64::MAX)).unwrap();
        assert_eq!(config.retention(), Duration::from_secs(u64::MAX));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_toml_parses_to_default() {
        let config: EngineConfig = toml::from_str(EngineConfig::default_toml()).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn empty_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "").unwrap();
        assert_eq!(
            EngineConfig::from_file(&path).unwrap(),
            EngineConfig::default()
        );
    }

    #[test]
    fn write_default_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "retention_days = 30\n").unwrap();

        EngineConfig::write_default_if_missing(&path).unwrap();
        assert_eq!(EngineConfig::from_file(&path).unwrap().retention_days, 30);
    }

    #[test]
    fn write_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        EngineConfig::write_default_if_missing(&path).unwrap();
        assert!(path.exists());
        assert_eq!(EngineConfig::from_file(&path).unwrap().compression_level, 3);
    }

    #[test]
    fn round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = EngineConfig::with_archive_dir("/srv/folio")
            .instance_url("https://eln.example.org")
            .quota_bytes(1024)
            .parallel_fetch(false);
        config.write_to_file(&path).unwrap();
        assert_eq!(EngineConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "compression_level = 40\n").unwrap();
        assert!(matches!(
            EngineConfig::from_file(&path),
            Err(ArchiveError::InvalidConfig(_))
        ));

        std::fs::write(&path, "quota_bytes = \"lots\"\n").unwrap();
        assert!(EngineConfig::from_file(&path).is_err());
    }

    #[test]
    fn global_url_trims_trailing_slash() {
        let config = EngineConfig::default().instance_url("https://eln.test/");
        assert_eq!(config.global_url("SD12"), "https://eln.test/globalId/SD12");
    }
}
