//! Configuration management for mirrorcryptfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default filesystem name shown in the mount table
pub const DEFAULT_FS_NAME: &str = "mirrorcryptfs";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Encryption configuration
    pub encryption: EncryptionConfig,

    /// Mount configuration
    pub mount: MountConfig,
}

/// Encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Argon2 memory cost in KiB
    pub argon2_memory_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_iterations: u32,

    /// Argon2 parallelism
    pub argon2_parallelism: u32,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Filesystem name reported to the kernel
    pub fs_name: String,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Allow root to access the mount
    pub allow_root: bool,

    /// Unmount automatically when the process exits
    pub auto_unmount: bool,

    /// Attribute/entry cache TTL handed to the kernel
    pub attr_ttl_secs: u64,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            argon2_memory_kib: 65536, // 64 MiB
            argon2_iterations: 3,
            argon2_parallelism: 4,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            fs_name: DEFAULT_FS_NAME.to_string(),
            allow_other: false,
            allow_root: false,
            auto_unmount: true,
            attr_ttl_secs: 1,
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, else the default location if present, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => {
                let mut config = Config::default();
                config.apply_env_overrides();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// `~/.config/mirrorcryptfs/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(DEFAULT_FS_NAME).join("config.json"))
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(memory) = std::env::var("MIRRORCRYPTFS_ARGON2_MEMORY_KIB") {
            if let Ok(kib) = memory.trim().parse::<u32>() {
                self.encryption.argon2_memory_kib = kib;
            }
        }

        if let Ok(iterations) = std::env::var("MIRRORCRYPTFS_ARGON2_ITERATIONS") {
            if let Ok(n) = iterations.trim().parse::<u32>() {
                self.encryption.argon2_iterations = n;
            }
        }

        if let Ok(allow_other) = std::env::var("MIRRORCRYPTFS_ALLOW_OTHER") {
            match allow_other.trim() {
                "1" | "true" | "yes" => self.mount.allow_other = true,
                "0" | "false" | "no" => self.mount.allow_other = false,
                _ => {}
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let enc = &self.encryption;

        if enc.argon2_iterations == 0 {
            return Err(Error::InvalidConfig(
                "Argon2 iterations must be greater than 0".to_string(),
            ));
        }

        if enc.argon2_parallelism == 0 {
            return Err(Error::InvalidConfig(
                "Argon2 parallelism must be greater than 0".to_string(),
            ));
        }

        // argon2 requires at least 8 KiB per lane
        if enc.argon2_memory_kib < 8 * enc.argon2_parallelism {
            return Err(Error::InvalidConfig(format!(
                "Argon2 memory must be at least {} KiB for {} lanes",
                8 * enc.argon2_parallelism,
                enc.argon2_parallelism
            )));
        }

        if self.mount.fs_name.is_empty() {
            return Err(Error::InvalidConfig(
                "Filesystem name must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.encryption.argon2_memory_kib = 1024;
        config.encryption.argon2_iterations = 1;
        config.encryption.argon2_parallelism = 1;
        config.mount.fs_name = "testfs".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.encryption.argon2_memory_kib, 1024);
        assert_eq!(loaded.mount.fs_name, "testfs");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"mount": {"allow_root": true}}"#).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.mount.allow_root);
        assert!(loaded.mount.auto_unmount);
        assert_eq!(loaded.encryption.argon2_iterations, 3);
    }

    #[test]
    fn test_validate_rejects_zero_iterations() {
        let mut config = Config::default();
        config.encryption.argon2_iterations = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_too_little_memory() {
        let mut config = Config::default();
        config.encryption.argon2_parallelism = 4;
        config.encryption.argon2_memory_kib = 16;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_garbage_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }
}
