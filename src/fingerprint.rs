use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::repository::AssetRepository;
use crate::settings::CookSettings;
use crate::TargetPlatform;

/// Ordered (key, value) pairs describing everything outside the assets that affects cooked output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentFingerprint {
    pub entries: Vec<(String, String)>,
}
impl EnvironmentFingerprint {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn push(&mut self, key: impl Into<String>, value: impl ToString) {
        self.entries.push((key.into(), value.to_string()));
    }

    /// Gathers format versions, codec versions and the configured `file:section:key` settings
    pub fn gather(settings: &CookSettings, repo: &dyn AssetRepository, platform: &TargetPlatform) -> Self {
        let mut fp = Self::new();
        fp.push("PackageFormatVersion", settings.package_format_version);
        fp.push("PlatformCaps", platform.caps.bits());
        for (codec, version) in &settings.asset_codec_versions {
            fp.push(format!("Codec:{codec}"), version);
        }
        for entry in &settings.versioned_settings {
            let mut parts = entry.splitn(3, ':');
            let (Some(file), Some(section), Some(key)) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            fp.push(entry.clone(), repo.config_value(file, section, key).unwrap_or_default());
        }
        fp
    }

    /// True when every entry of `self` appears verbatim in `previous`. Entries only present in
    /// `previous` do not matter, so new settings alone never invalidate old output.
    pub fn is_satisfied_by(&self, previous: &EnvironmentFingerprint) -> bool {
        self.entries.iter().all(|entry| previous.entries.contains(entry))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("parsing cooked fingerprint")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fp(entries: &[(&str, &str)]) -> EnvironmentFingerprint {
        EnvironmentFingerprint {
            entries: entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn test_containment_is_one_directional() {
        let previous = fp(&[("PackageFormatVersion", "1"), ("Engine:Core:Paths", "a")]);
        assert!(fp(&[("PackageFormatVersion", "1")]).is_satisfied_by(&previous));
        assert!(!fp(&[("PackageFormatVersion", "1"), ("Game:Audio:Rate", "44100")]).is_satisfied_by(&previous));
        assert!(!fp(&[("Engine:Core:Paths", "b")]).is_satisfied_by(&previous));
        assert!(previous.is_satisfied_by(&previous));
    }

    #[test]
    fn test_json() -> Result<()> {
        let original = fp(&[("Codec:Texture", "4")]);
        assert_eq!(EnvironmentFingerprint::from_json(&original.to_json()?)?, original);
        Ok(())
    }
}
