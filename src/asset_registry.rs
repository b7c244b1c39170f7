use std::collections::HashSet;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use anyhow::{Context as _, Result, bail};
use bitflags::bitflags;
use fs_err as fs;
use indexmap::IndexSet;
use strum::FromRepr;

use crate::ChunkId;
use crate::fingerprint::EnvironmentFingerprint;
use crate::ser::*;

const REGISTRY_MAGIC: u32 = 0x52434152;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromRepr)]
#[repr(u32)]
pub enum AssetRegistryVersion {
    #[default]
    Initial = 0,
    /// Chunk ids per asset
    AddedChunkIds,
    /// Hash of the cooked bytes per asset
    AddedCookedHash,
}
impl AssetRegistryVersion {
    pub const LATEST: Self = Self::AddedCookedHash;
}
impl Readable for AssetRegistryVersion {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        let value: u32 = stream.de()?;
        Self::from_repr(value).with_context(|| format!("invalid AssetRegistryVersion: {value}"))
    }
}
impl Writeable for AssetRegistryVersion {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        stream.ser(&(*self as u32))
    }
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct AssetFlags: u32 {
        const MAP = 1 << 0;
        /// Cook was attempted on this platform and did not produce output
        const FAILED = 1 << 1;
        const STARTUP = 1 << 2;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetRecord {
    pub package_name: String,
    pub class_name: Option<String>,
    pub chunk_ids: Vec<ChunkId>,
    pub flags: AssetFlags,
    pub cooked_hash: Option<[u8; 16]>,
}
impl AssetRecord {
    pub fn failed(&self) -> bool {
        self.flags.contains(AssetFlags::FAILED)
    }
}

/// `Metadata/AssetRegistry.bin`: per asset metadata of one platform, names stored once in a table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetRegistry {
    pub fingerprint: EnvironmentFingerprint,
    pub filter_editor_only_data: bool,
    pub assets: Vec<AssetRecord>,
}

impl AssetRegistry {
    pub fn package_names(&self) -> HashSet<String> {
        self.assets.iter().filter(|a| !a.failed()).map(|a| a.package_name.to_ascii_lowercase()).collect()
    }
    pub fn get(&self, package: &str) -> Option<&AssetRecord> {
        self.assets.iter().find(|a| a.package_name.eq_ignore_ascii_case(package))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        Self::read(&mut Cursor::new(data)).with_context(|| format!("reading asset registry {}", path.display()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![];
        self.write(&mut out)?;
        Ok(out)
    }

    pub fn read<S: Read>(stream: &mut S) -> Result<Self> {
        let magic: u32 = stream.de()?;
        if magic != REGISTRY_MAGIC {
            bail!("not an asset registry (magic {magic:#x})");
        }
        let version: AssetRegistryVersion = stream.de()?;
        let filter_editor_only_data = stream.de()?;
        let entries: u32 = stream.de()?;
        let mut fingerprint = EnvironmentFingerprint::new();
        for _ in 0..entries {
            let key: String = stream.de()?;
            let value: String = stream.de()?;
            fingerprint.push(key, value);
        }
        let names: Vec<String> = stream.de()?;
        let name = |index: u32| -> Result<String> { names.get(index as usize).cloned().with_context(|| format!("invalid name index: {index} (total names: {})", names.len())) };

        let count: u32 = stream.de()?;
        let assets = read_array(count as usize, stream, |s| {
            let package_name = name(s.de()?)?;
            let class_index: i32 = s.de()?;
            let class_name = if class_index < 0 { None } else { Some(name(class_index as u32)?) };
            let flags: u32 = s.de()?;
            let chunk_ids = if version >= AssetRegistryVersion::AddedChunkIds {
                s.de::<Vec<u32>>()?.into_iter().map(ChunkId).collect()
            } else {
                vec![]
            };
            let cooked_hash = if version >= AssetRegistryVersion::AddedCookedHash && s.de::<bool>()? {
                Some(s.de()?)
            } else {
                None
            };
            Ok(AssetRecord {
                package_name,
                class_name,
                chunk_ids,
                flags: AssetFlags::from_bits_truncate(flags),
                cooked_hash,
            })
        })?;
        Ok(Self {
            fingerprint,
            filter_editor_only_data,
            assets,
        })
    }

    pub fn write<S: Write>(&self, stream: &mut S) -> Result<()> {
        stream.ser(&REGISTRY_MAGIC)?;
        stream.ser(&AssetRegistryVersion::LATEST)?;
        stream.ser(&self.filter_editor_only_data)?;
        stream.ser(&(self.fingerprint.entries.len() as u32))?;
        for (key, value) in &self.fingerprint.entries {
            stream.ser(key)?;
            stream.ser(value)?;
        }

        let mut names: IndexSet<&str> = IndexSet::new();
        for asset in &self.assets {
            names.insert(&asset.package_name);
            if let Some(class) = &asset.class_name {
                names.insert(class);
            }
        }
        stream.ser(&(names.len() as u32))?;
        for name in &names {
            stream.ser(name)?;
        }
        let index = |name: &str| names.get_index_of(name).map(|i| i as u32).context("name missing from table");

        stream.ser(&(self.assets.len() as u32))?;
        for asset in &self.assets {
            stream.ser(&index(&asset.package_name)?)?;
            let class_index = match &asset.class_name {
                Some(class) => index(class)? as i32,
                None => -1,
            };
            stream.ser(&class_index)?;
            stream.ser(&asset.flags.bits())?;
            stream.ser(&asset.chunk_ids.iter().map(|c| c.0).collect::<Vec<u32>>())?;
            stream.ser(&asset.cooked_hash.is_some())?;
            if let Some(hash) = &asset.cooked_hash {
                stream.ser(hash)?;
            }
        }
        Ok(())
    }
}

/// First 16 bytes of the blake3 hash of cooked output
pub fn cooked_hash(data: &[u8]) -> [u8; 16] {
    let mut hash = [0; 16];
    hash.copy_from_slice(&blake3::hash(data).as_bytes()[..16]);
    hash
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> AssetRegistry {
        let mut fingerprint = EnvironmentFingerprint::new();
        fingerprint.push("PackageFormatVersion", 1);
        AssetRegistry {
            fingerprint,
            filter_editor_only_data: true,
            assets: vec![
                AssetRecord {
                    package_name: "/Game/Maps/Arena".into(),
                    class_name: Some("World".into()),
                    chunk_ids: vec![ChunkId(2)],
                    flags: AssetFlags::MAP,
                    cooked_hash: Some(cooked_hash(b"arena")),
                },
                AssetRecord {
                    package_name: "/Game/Broken".into(),
                    class_name: Some("World".into()),
                    chunk_ids: vec![],
                    flags: AssetFlags::FAILED,
                    cooked_hash: None,
                },
            ],
        }
    }

    #[test]
    fn test_registry_binary() -> Result<()> {
        let registry = registry();
        let bytes = registry.to_bytes()?;
        let read = AssetRegistry::read(&mut Cursor::new(&bytes))?;
        assert_eq!(read, registry);
        assert!(read.get("/game/broken").unwrap().failed());
        assert_eq!(read.package_names(), HashSet::from(["/game/maps/arena".to_string()]));
        Ok(())
    }

    #[test]
    fn test_reads_initial_version() -> Result<()> {
        let mut bytes = vec![];
        WriteExt::ser(&mut bytes, &REGISTRY_MAGIC)?;
        WriteExt::ser(&mut bytes, &AssetRegistryVersion::Initial)?;
        WriteExt::ser(&mut bytes, &false)?;
        WriteExt::ser(&mut bytes, &0u32)?;
        WriteExt::ser(&mut bytes, &vec!["/Game/Old".to_string()])?;
        WriteExt::ser(&mut bytes, &1u32)?;
        WriteExt::ser(&mut bytes, &0u32)?;
        WriteExt::ser(&mut bytes, &-1i32)?;
        WriteExt::ser(&mut bytes, &0u32)?;
        let read = AssetRegistry::read(&mut Cursor::new(&bytes))?;
        assert_eq!(read.assets[0].package_name, "/Game/Old");
        assert!(read.assets[0].chunk_ids.is_empty());
        assert_eq!(read.assets[0].cooked_hash, None);
        Ok(())
    }

    #[test]
    fn test_rejects_future_version() -> Result<()> {
        let mut bytes = vec![];
        WriteExt::ser(&mut bytes, &REGISTRY_MAGIC)?;
        WriteExt::ser(&mut bytes, &99u32)?;
        assert!(AssetRegistry::read(&mut Cursor::new(&bytes)).is_err());
        Ok(())
    }
}
