use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result, ensure};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use serde_with::{DurationSecondsWithFrac, serde_as};

/// Cooker knobs, loadable from a JSON file where every field is optional
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CookSettings {
    /// Non-map packages saved before a collection is requested, 0 disables
    pub packages_per_gc: u32,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub idle_time_to_gc: Duration,
    /// 0 disables the memory check
    pub max_memory_allowance_mb: u64,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub time_slice: Duration,
    pub max_packages_per_tick: u32,
    /// Saving one of these classes forces a collection before anything else is cooked
    pub full_gc_asset_classes: Vec<String>,
    /// `file:section:key` entries folded into the environment fingerprint
    pub versioned_settings: Vec<String>,
    /// Times a request waiting on platform data is re-queued before it is failed
    pub max_cache_retries: u32,
    /// Smallest slice worth handing to a worker process
    pub min_worker_slice: usize,
    /// Versions of the cooked formats, any change invalidates iterative output
    pub package_format_version: u32,
    pub asset_codec_versions: Vec<(String, u32)>,
}
impl Default for CookSettings {
    fn default() -> Self {
        Self {
            packages_per_gc: 50,
            idle_time_to_gc: Duration::from_secs(20),
            max_memory_allowance_mb: 8192,
            time_slice: Duration::from_millis(100),
            max_packages_per_tick: 30,
            full_gc_asset_classes: vec!["World".into()],
            versioned_settings: vec![],
            max_cache_retries: 300,
            min_worker_slice: 16,
            package_format_version: 1,
            asset_codec_versions: vec![],
        }
    }
}
impl CookSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let settings: Self = serde_json::from_slice(&fs::read(path)?).with_context(|| format!("parsing cook settings {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_packages_per_tick > 0, "max_packages_per_tick must be at least 1");
        ensure!(!self.time_slice.is_zero(), "time_slice must be positive");
        for entry in &self.versioned_settings {
            ensure!(entry.split(':').count() == 3, "versioned setting {entry:?} is not file:section:key");
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplaySettings {
    /// Frames recorded per second, 0 records every tick
    pub record_hz: f32,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub checkpoint_interval: Duration,
    /// Time budget per tick for writing checkpoint actors, 0 writes the whole checkpoint at once
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub max_checkpoint_upload_time: Duration,
    pub checksums: bool,
    pub compress_checkpoints: bool,
    /// How far past the clock playback reads ahead
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub lookahead: Duration,
}
impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            record_hz: 0.0,
            checkpoint_interval: Duration::from_secs(30),
            max_checkpoint_upload_time: Duration::ZERO,
            checksums: true,
            compress_checkpoints: true,
            lookahead: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_settings_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cook.json");
        fs::write(&path, r#"{ "packages_per_gc": 10, "time_slice": 0.25, "versioned_settings": ["Engine:Core.System:Paths"] }"#)?;
        let settings = CookSettings::load(&path)?;
        assert_eq!(settings.packages_per_gc, 10);
        assert_eq!(settings.time_slice, Duration::from_millis(250));
        assert_eq!(settings.full_gc_asset_classes, vec!["World".to_string()]);
        assert_eq!(settings.max_packages_per_tick, 30);
        Ok(())
    }

    #[test]
    fn test_bad_versioned_setting() {
        let settings = CookSettings {
            versioned_settings: vec!["Engine:Paths".into()],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_replay_defaults() {
        let settings: ReplaySettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.checkpoint_interval, Duration::from_secs(30));
        assert_eq!(settings.lookahead, Duration::from_secs(5));
    }
}
