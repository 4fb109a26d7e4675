//! Settings and file locations.
//!
//! `CacheSettings` is the JSON-persisted tuning of the frame cache. Files
//! live in the playa config/data directories unless overridden by
//! `--config-dir` or `PLAYA_CONFIG_DIR`.

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::cache::FrameCache;
use crate::core::store::{system_budget, MemoryStore};
use crate::core::utility::{CachingMode, FreeMode};

/// Settings file name
pub const SETTINGS_FILE: &str = "playa-cache.json";
/// Default log file name
pub const LOG_FILE: &str = "playa-cache.log";

/// Env override for `active_tail_caching`
pub const ENV_ACTIVE_TAIL: &str = "PLAYA_ACTIVE_TAIL_CACHING";

/// Configuration for overriding default application paths
#[derive(Debug, Clone)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args → ENV var (PLAYA_CONFIG_DIR) → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var("PLAYA_CONFIG_DIR").ok().map(PathBuf::from));
        Self { config_dir }
    }
}

/// Path to a configuration file.
///
/// Priority:
/// 1. CLI --config-dir argument
/// 2. PLAYA_CONFIG_DIR environment variable
/// 3. Local folder IF playa-cache files exist there
/// 4. Platform config directory from dirs-next, e.g. `~/.config/playa/{name}`
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    config_dir(config).join(name)
}

/// Path to a data file (logs). Same priority as `config_file`, ending in
/// the platform data directory, e.g. `~/.local/share/playa/{name}`.
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    data_dir(config).join(name)
}

/// Create the config and data directories if missing.
pub fn ensure_dirs(config: &PathConfig) -> Result<()> {
    let config_dir = config_dir(config);
    let data_dir = data_dir(config);

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;
    }
    if data_dir != config_dir && !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    }
    Ok(())
}

fn has_local_files(dir: &Path) -> bool {
    [SETTINGS_FILE, LOG_FILE].iter().any(|f| dir.join(f).exists())
}

fn resolve_dir(config: &PathConfig, platform: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    if let Ok(current_dir) = std::env::current_dir() {
        if has_local_files(&current_dir) {
            return current_dir;
        }
    }
    match platform {
        Some(dir) => dir.join("playa"),
        None => PathBuf::from("."),
    }
}

fn config_dir(config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::config_dir())
}

fn data_dir(config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::data_dir())
}

/// Frame cache tuning, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Fixed budget; None = derive from system memory
    pub capacity_mb: Option<usize>,
    /// Fraction of available memory (0.0-1.0)
    pub mem_fraction: f64,
    /// Memory left to the system (GB)
    pub reserve_gb: f64,
    /// Caching threads; None = 3/4 of the cores
    pub workers: Option<usize>,
    /// Max contiguous frames a worker books per cycle
    pub group_size: usize,
    pub caching_mode: CachingMode,
    pub free_mode: FreeMode,
    pub look_behind_fraction: f32,
    pub active_tail_caching: bool,
    pub cache_outside_region: bool,
    pub in_flight_timeout_ms: u64,
    pub stats_disabled: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity_mb: None,
            mem_fraction: 0.75,
            reserve_gb: 2.0,
            workers: None,
            group_size: 4,
            caching_mode: CachingMode::Lookahead,
            free_mode: FreeMode::Active,
            look_behind_fraction: 0.25,
            active_tail_caching: false,
            cache_outside_region: false,
            in_flight_timeout_ms: 10_000,
            stats_disabled: false,
        }
    }
}

impl CacheSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings: {}", path.display()))?;
        let settings = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse settings: {}", path.display()))?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write settings: {}", path.display()))?;
        Ok(())
    }

    /// Settings from `path`, or defaults if the file is missing or broken.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            info!("No settings at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("{:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Apply environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_active_tail_env(std::env::var(ENV_ACTIVE_TAIL).ok().as_deref());
    }

    fn apply_active_tail_env(&mut self, value: Option<&str>) {
        let Some(value) = value else {
            return;
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => self.active_tail_caching = true,
            "0" | "false" | "no" | "off" | "" => self.active_tail_caching = false,
            other => warn!("{}: unrecognized value {:?}, ignored", ENV_ACTIVE_TAIL, other),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        match self.capacity_mb {
            Some(mb) => mb.saturating_mul(1024 * 1024),
            None => system_budget(self.mem_fraction, self.reserve_gb),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| num_cpus::get() * 3 / 4).max(1)
    }

    pub fn in_flight_timeout(&self) -> Duration {
        Duration::from_millis(self.in_flight_timeout_ms)
    }

    /// Cache over a `MemoryStore` sized and tuned from these settings.
    pub fn build_cache(&self) -> FrameCache<MemoryStore> {
        let cache = FrameCache::with_policy(MemoryStore::new(self.capacity_bytes()), self.caching_mode.policy());
        cache.set_free_mode(self.free_mode);
        cache.set_look_behind_fraction(self.look_behind_fraction);
        cache.enable_active_tail_caching(self.active_tail_caching);
        cache.set_cache_outside_region(self.cache_outside_region);
        cache.set_in_flight_timeout(self.in_flight_timeout());
        cache.set_stats_disabled(self.stats_disabled);
        info!(
            "Cache settings: mode {:?}, free {:?}, look-behind {:.2}, active tail {}, {} workers",
            self.caching_mode,
            self.free_mode,
            self.look_behind_fraction,
            self.active_tail_caching,
            self.worker_count()
        );
        cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::ContentStore;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("playa_cache_{}_{}", tag, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_config_file_with_custom_dir() {
        let config = PathConfig {
            config_dir: Some(PathBuf::from("/custom")),
        };
        assert_eq!(config_file("test.json", &config), PathBuf::from("/custom/test.json"));
        assert_eq!(data_file(LOG_FILE, &config), PathBuf::from("/custom/playa-cache.log"));
    }

    #[test]
    fn test_ensure_dirs_creates_custom_dir() {
        let dir = temp_dir("dirs").join("nested");
        let config = PathConfig {
            config_dir: Some(dir.clone()),
        };
        ensure_dirs(&config).unwrap();
        assert!(dir.is_dir());
        let _ = std::fs::remove_dir_all(dir.parent().unwrap());
    }

    #[test]
    fn test_settings_save_load() {
        let dir = temp_dir("settings");
        let path = dir.join(SETTINGS_FILE);

        let settings = CacheSettings {
            capacity_mb: Some(512),
            free_mode: FreeMode::Greedy,
            caching_mode: CachingMode::Region,
            ..Default::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(CacheSettings::load(&path).unwrap(), settings);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: CacheSettings = serde_json::from_str(r#"{"group_size": 8}"#).unwrap();
        assert_eq!(settings.group_size, 8);
        assert_eq!(settings.look_behind_fraction, 0.25);
        assert_eq!(settings.in_flight_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_broken_file_falls_back() {
        let dir = temp_dir("broken");
        let path = dir.join(SETTINGS_FILE);
        std::fs::write(&path, "{ not json").unwrap();

        assert!(CacheSettings::load(&path).is_err());
        assert_eq!(CacheSettings::load_or_default(&path), CacheSettings::default());
        assert_eq!(
            CacheSettings::load_or_default(&dir.join("missing.json")),
            CacheSettings::default()
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_active_tail_env_values() {
        let mut settings = CacheSettings::default();
        settings.apply_active_tail_env(Some("1"));
        assert!(settings.active_tail_caching);
        settings.apply_active_tail_env(Some("bogus"));
        assert!(settings.active_tail_caching);
        settings.apply_active_tail_env(Some("off"));
        assert!(!settings.active_tail_caching);
        settings.apply_active_tail_env(None);
        assert!(!settings.active_tail_caching);
    }

    #[test]
    fn test_capacity_and_workers() {
        let settings = CacheSettings {
            capacity_mb: Some(2),
            workers: Some(0),
            ..Default::default()
        };
        assert_eq!(settings.capacity_bytes(), 2 * 1024 * 1024);
        assert_eq!(settings.worker_count(), 1);
        assert!(CacheSettings::default().worker_count() >= 1);
    }

    #[test]
    fn test_build_cache_applies_settings() {
        let settings = CacheSettings {
            capacity_mb: Some(1),
            free_mode: FreeMode::Greedy,
            look_behind_fraction: 0.4,
            active_tail_caching: true,
            caching_mode: CachingMode::Region,
            ..Default::default()
        };
        let cache = settings.build_cache();
        let state = cache.lock();
        assert_eq!(state.store().capacity(), 1024 * 1024);
        assert_eq!(state.playback().free_mode, FreeMode::Greedy);
        assert_eq!(state.playback().look_behind_fraction, 0.4);
        assert!(state.playback().active_tail_caching);
        assert_eq!(state.policy_name(), CachingMode::Region.policy().name());
    }
}
