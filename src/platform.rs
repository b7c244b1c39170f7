use anyhow::{Result, bail};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{PlatformId, PlatformSet};

bitflags! {
    /// What a target platform can do with cooked data
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PlatformCaps: u8 {
        const LITTLE_ENDIAN = 1 << 0;
        const EDITOR_ONLY_DATA = 1 << 1;
        const COMPRESSED_PACKAGES = 1 << 2;
        const REQUIRES_COOKED_DATA = 1 << 3;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPlatform {
    pub name: String,
    pub caps: PlatformCaps,
}
impl TargetPlatform {
    pub fn new(name: impl Into<String>, caps: PlatformCaps) -> Self {
        Self { name: name.into(), caps }
    }
    /// Known platform names map to their usual capabilities, anything else is treated as a little endian cooked client
    pub fn from_name(name: &str) -> Self {
        use PlatformCaps as C;
        let caps = match name {
            "WindowsEditor" | "LinuxEditor" | "MacEditor" => C::LITTLE_ENDIAN | C::EDITOR_ONLY_DATA,
            "WindowsServer" | "LinuxServer" => C::LITTLE_ENDIAN | C::REQUIRES_COOKED_DATA,
            "PS3" | "Xbox360" | "WiiU" => C::REQUIRES_COOKED_DATA | C::COMPRESSED_PACKAGES,
            _ => C::LITTLE_ENDIAN | C::REQUIRES_COOKED_DATA | C::COMPRESSED_PACKAGES,
        };
        Self::new(name, caps)
    }
    pub fn is_little_endian(&self) -> bool {
        self.caps.contains(PlatformCaps::LITTLE_ENDIAN)
    }
    pub fn has_editor_only_data(&self) -> bool {
        self.caps.contains(PlatformCaps::EDITOR_ONLY_DATA)
    }
    pub fn supports_compressed_packages(&self) -> bool {
        self.caps.contains(PlatformCaps::COMPRESSED_PACKAGES)
    }
}

/// The ordered, fixed platform list of one run
#[derive(Debug, Clone, Default)]
pub struct Platforms {
    platforms: Vec<TargetPlatform>,
}
impl Platforms {
    pub fn new(platforms: Vec<TargetPlatform>) -> Result<Self> {
        if platforms.len() > 64 {
            bail!("at most 64 target platforms per run, got {}", platforms.len());
        }
        for (i, p) in platforms.iter().enumerate() {
            if platforms[..i].iter().any(|o| o.name.eq_ignore_ascii_case(&p.name)) {
                bail!("target platform {:?} listed twice", p.name);
            }
        }
        Ok(Self { platforms })
    }
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        Self::new(names.iter().map(|n| TargetPlatform::from_name(n.as_ref())).collect())
    }
    pub fn get(&self, id: PlatformId) -> &TargetPlatform {
        &self.platforms[id.0 as usize]
    }
    pub fn find(&self, name: &str) -> Option<PlatformId> {
        self.platforms.iter().position(|p| p.name.eq_ignore_ascii_case(name)).map(|i| PlatformId(i as u8))
    }
    pub fn all(&self) -> PlatformSet {
        PlatformSet::all(self.platforms.len())
    }
    pub fn ids(&self) -> impl Iterator<Item = PlatformId> + '_ {
        (0..self.platforms.len()).map(|i| PlatformId(i as u8))
    }
    pub fn iter(&self) -> impl Iterator<Item = (PlatformId, &TargetPlatform)> {
        self.platforms.iter().enumerate().map(|(i, p)| (PlatformId(i as u8), p))
    }
    pub fn len(&self) -> usize {
        self.platforms.len()
    }
    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_platform_list() -> Result<()> {
        let platforms = Platforms::from_names(&["WindowsNoEditor", "PS3"])?;
        assert_eq!(platforms.find("ps3"), Some(PlatformId(1)));
        assert!(platforms.get(PlatformId(0)).is_little_endian());
        assert!(!platforms.get(PlatformId(1)).is_little_endian());
        assert_eq!(platforms.all().len(), 2);
        assert!(Platforms::from_names(&["Win", "win"]).is_err());
        Ok(())
    }

    #[test]
    fn test_platform_json() -> Result<()> {
        let ps3 = TargetPlatform::from_name("PS3");
        let json = serde_json::to_string(&ps3)?;
        let back: TargetPlatform = serde_json::from_str(&json)?;
        assert_eq!(back, ps3);
        assert!(!back.is_little_endian());
        Ok(())
    }
}
