//! Configuration loading: a TOML file deserialized with `serde`, grounded
//! on `aerogramme`'s own `config.rs` `read_config` (read the whole file,
//! then `toml::from_str`).

use std::fs;
use std::path::Path;

use serde::Deserialize;

use msync_cache::compression::CompactionPolicy as CacheCompactionPolicy;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub maildir_sync_secs: Option<u64>,
    #[serde(default)]
    pub stale_lock_timeout_secs: Option<u64>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Config {
    pub fn stale_lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.stale_lock_timeout_secs
                .unwrap_or(msync_maildir::uidlist::LOCK_STALE_TIMEOUT.as_secs()),
        )
    }
}

/// Flag-merge conflict policy for the importer (C8), taken from the
/// original source's `dsync-mailbox-import.c` conflict table and exposed
/// here as configurable booleans rather than a compile-time constant.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ImportConfig {
    /// On a flag conflict, keep the remote side's flags instead of the
    /// local side's.
    #[serde(default)]
    pub prefer_remote: bool,
    /// Same, but for the private (per-replica) flag bits only.
    #[serde(default)]
    pub prefer_pvt_remote: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            prefer_remote: false,
            prefer_pvt_remote: false,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct CacheConfig {
    pub deleted_space_ratio: Option<f64>,
    pub continued_record_ratio: Option<f64>,
    pub min_compress_size: Option<u32>,
}

impl CacheConfig {
    pub fn resolve(&self) -> CacheCompactionPolicy {
        let defaults = CacheCompactionPolicy::default();
        CacheCompactionPolicy {
            deleted_space_ratio: self.deleted_space_ratio.unwrap_or(defaults.deleted_space_ratio),
            continued_record_ratio: self
                .continued_record_ratio
                .unwrap_or(defaults.continued_record_ratio),
            min_compress_size: self.min_compress_size.unwrap_or(defaults.min_compress_size),
        }
    }
}

pub fn read_config(path: &Path) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    Ok(config)
}

impl Default for Config {
    fn default() -> Self {
        Config {
            maildir_sync_secs: None,
            stale_lock_timeout_secs: None,
            cache: CacheConfig::default(),
            import: ImportConfig::default(),
            log_level: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsync.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "maildir_sync_secs = 30").unwrap();

        let config = read_config(&path).unwrap();
        assert_eq!(config.maildir_sync_secs, Some(30));
        assert!(!config.import.prefer_remote);
        assert_eq!(
            config.stale_lock_timeout(),
            std::time::Duration::from_secs(msync_maildir::uidlist::LOCK_STALE_TIMEOUT.as_secs())
        );
    }

    #[test]
    fn explicit_import_policy_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsync.toml");
        std::fs::write(
            &path,
            "[import]\nprefer_remote = true\nprefer_pvt_remote = true\n",
        )
        .unwrap();

        let config = read_config(&path).unwrap();
        assert!(config.import.prefer_remote);
        assert!(config.import.prefer_pvt_remote);
    }

    #[test]
    fn cache_resolve_falls_back_per_field() {
        let cfg = CacheConfig {
            deleted_space_ratio: Some(0.5),
            continued_record_ratio: None,
            min_compress_size: None,
        };
        let resolved = cfg.resolve();
        let defaults = CacheCompactionPolicy::default();
        assert_eq!(resolved.deleted_space_ratio, 0.5);
        assert_eq!(resolved.continued_record_ratio, defaults.continued_record_ratio);
        assert_eq!(resolved.min_compress_size, defaults.min_compress_size);
    }
}
