pub mod asset_registry;
pub mod chunk_manifest;
pub mod compression;
pub mod context;
pub mod dependency_graph;
pub mod distributed;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod manifest;
pub mod platform;
pub mod project;
pub mod replay_format;
pub mod replay_playback;
pub mod replay_recorder;
pub mod replay_streamer;
pub mod repository;
pub mod request_queue;
pub mod sandbox;
pub mod scheduler;
pub mod ser;
pub mod settings;
pub mod staleness;

use anyhow::Result;
use fs_err as fs;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::path::{Path, PathBuf};

pub use context::CookContext;
pub use error::{CookError, ReplayError};
pub use platform::{PlatformCaps, TargetPlatform};

pub trait FileWriterTrait: Send + Sync {
    fn write_file(&self, path: &UEPath, data: &[u8]) -> Result<()>;
}
pub struct FSFileWriter {
    dir: PathBuf,
}
impl FSFileWriter {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }
}
impl FileWriterTrait for FSFileWriter {
    fn write_file(&self, path: &UEPath, data: &[u8]) -> Result<()> {
        let path = self.dir.join(path.as_str());
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        Ok(fs::write(path, data)?)
    }
}
pub struct NullFileWriter;
impl FileWriterTrait for NullFileWriter {
    fn write_file(&self, _path: &UEPath, _data: &[u8]) -> Result<()> {
        Ok(())
    }
}

// UTF-8 path with '/' as separator
pub type UEPath = typed_path::Utf8UnixPath;
pub type UEPathBuf = typed_path::Utf8UnixPathBuf;

pub fn to_ue_path(path: &Path) -> Option<UEPathBuf> {
    let native_path = typed_path::Utf8NativePath::from_bytes_path(typed_path::NativePath::new(path.as_os_str().as_encoded_bytes())).ok()?;
    Some(native_path.with_encoding())
}

/// Interned handle of a package name. Only meaningful together with the `AssetNames` that produced it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetId(pub u32);
impl Debug for AssetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AssetId({})", self.0)
    }
}

/// Package name interner. Lookups ignore ASCII case like engine names do, the first spelling seen is kept.
#[derive(Debug, Default, Clone)]
pub struct AssetNames {
    names: IndexSet<String>,
    lower: IndexSet<String>,
}
impl AssetNames {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn intern(&mut self, name: &str) -> AssetId {
        let lower = name.to_ascii_lowercase();
        if let Some(index) = self.lower.get_index_of(&lower) {
            return AssetId(index as u32);
        }
        self.lower.insert(lower);
        self.names.insert(name.to_string());
        AssetId(self.names.len() as u32 - 1)
    }
    pub fn find(&self, name: &str) -> Option<AssetId> {
        self.lower.get_index_of(&name.to_ascii_lowercase()).map(|i| AssetId(i as u32))
    }
    pub fn name(&self, asset: AssetId) -> &str {
        self.names.get_index(asset.0 as usize).map(String::as_str).unwrap_or("<unknown>")
    }
    pub fn len(&self) -> usize {
        self.names.len()
    }
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = (AssetId, &str)> {
        self.names.iter().enumerate().map(|(i, n)| (AssetId(i as u32), n.as_str()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub u32);
impl ChunkId {
    /// Content that ships with every install, also the home of anything never assigned
    pub const ALWAYS_PRESENT: ChunkId = ChunkId(0);
}
impl Display for ChunkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index into the ordered platform list of a cook run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlatformId(pub u8);

/// Set of platforms of one run, at most 64
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PlatformSet(u64);
impl PlatformSet {
    pub const fn empty() -> Self {
        Self(0)
    }
    pub fn single(platform: PlatformId) -> Self {
        Self(1 << platform.0)
    }
    pub fn all(count: usize) -> Self {
        if count >= 64 { Self(u64::MAX) } else { Self((1u64 << count) - 1) }
    }
    pub fn insert(&mut self, platform: PlatformId) {
        self.0 |= 1 << platform.0;
    }
    pub fn remove(&mut self, platform: PlatformId) {
        self.0 &= !(1 << platform.0);
    }
    pub fn contains(&self, platform: PlatformId) -> bool {
        self.0 & (1 << platform.0) != 0
    }
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
    pub fn is_superset(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }
    pub fn iter(&self) -> impl Iterator<Item = PlatformId> + '_ {
        let bits = self.0;
        (0..64u8).filter(move |i| bits & (1 << i) != 0).map(PlatformId)
    }
}
impl FromIterator<PlatformId> for PlatformSet {
    fn from_iter<T: IntoIterator<Item = PlatformId>>(iter: T) -> Self {
        let mut set = Self::empty();
        for p in iter {
            set.insert(p);
        }
        set
    }
}
impl Debug for PlatformSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter().map(|p| p.0)).finish()
    }
}

/// Stable 64 bit id of a package name, same hashing the engine uses for package ids
pub fn package_id_from_name(name: &str) -> u64 {
    lower_utf16_cityhash(name)
}

fn lower_utf16_cityhash(s: &str) -> u64 {
    let bytes = s.to_ascii_lowercase().encode_utf16().flat_map(u16::to_le_bytes).collect::<Vec<u8>>();
    cityhasher::hash(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_intern_ignores_case() {
        let mut names = AssetNames::new();
        let a = names.intern("/Game/Maps/Arena");
        let b = names.intern("/game/maps/ARENA");
        assert_eq!(a, b);
        assert_eq!(names.name(a), "/Game/Maps/Arena");
        assert_eq!(names.find("/GAME/MAPS/arena"), Some(a));
        assert_eq!(names.find("/Game/Missing"), None);
    }

    #[test]
    fn test_platform_set_union() {
        let win = PlatformId(0);
        let ps = PlatformId(3);
        let set = PlatformSet::single(win).union(PlatformSet::single(ps));
        assert!(set.contains(win) && set.contains(ps));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![win, ps]);
        assert_eq!(set.difference(PlatformSet::single(win)), PlatformSet::single(ps));
        assert_eq!(PlatformSet::all(64).len(), 64);
    }

    #[test]
    fn test_package_id_ignores_case() {
        assert_eq!(package_id_from_name("/Game/Hero"), package_id_from_name("/game/hero"));
        assert_ne!(package_id_from_name("/Game/Hero"), package_id_from_name("/Game/Villain"));
    }
}
