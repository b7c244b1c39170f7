use std::io::{Cursor, Read as _};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context as _, Result, bail, ensure};
use bitflags::bitflags;
use byteorder::{BE, ByteOrder, LE, ReadBytesExt, WriteBytesExt};
use fs_err as fs;
use strum::AsRefStr;
use tracing::instrument;

use crate::compression::{CompressionMethod, compress, decompress};
use crate::error::CookError;
use crate::{FSFileWriter, FileWriterTrait, PlatformCaps, TargetPlatform, UEPath, UEPathBuf, to_ue_path};

pub const COOKED_MAGIC: u32 = 0x9E2A83C1;
pub const COOKED_VERSION: u32 = 1;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CookedFlags: u32 {
        const COMPRESSED = 1 << 0;
        const EDITOR_DATA_STRIPPED = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookedHeader {
    pub version: u32,
    pub caps: PlatformCaps,
    pub flags: CookedFlags,
    pub uncompressed_size: u64,
}

fn write_header<B: ByteOrder>(out: &mut Vec<u8>, header: &CookedHeader) -> Result<()> {
    out.write_u32::<B>(COOKED_MAGIC)?;
    out.write_u32::<B>(header.version)?;
    out.write_u8(header.caps.bits())?;
    out.write_u32::<B>(header.flags.bits())?;
    out.write_u64::<B>(header.uncompressed_size)?;
    Ok(())
}
fn read_header<B: ByteOrder>(cur: &mut Cursor<&[u8]>) -> Result<CookedHeader> {
    let version = cur.read_u32::<B>()?;
    let caps = cur.read_u8()?;
    let flags = cur.read_u32::<B>()?;
    Ok(CookedHeader {
        version,
        caps: PlatformCaps::from_bits(caps).with_context(|| format!("unknown platform caps {caps:#x}"))?,
        flags: CookedFlags::from_bits(flags).with_context(|| format!("unknown cooked flags {flags:#x}"))?,
        uncompressed_size: cur.read_u64::<B>()?,
    })
}

/// Wraps a serialized package in the cooked header, in the byte order of `platform`
pub fn encode_cooked(platform: &TargetPlatform, compressed: bool, payload: &[u8]) -> Result<Vec<u8>> {
    let mut flags = CookedFlags::empty();
    if !platform.has_editor_only_data() {
        flags |= CookedFlags::EDITOR_DATA_STRIPPED;
    }
    let compressed = compressed && platform.supports_compressed_packages();
    if compressed {
        flags |= CookedFlags::COMPRESSED;
    }
    let header = CookedHeader {
        version: COOKED_VERSION,
        caps: platform.caps,
        flags,
        uncompressed_size: payload.len() as u64,
    };
    let mut out = vec![];
    if platform.is_little_endian() {
        write_header::<LE>(&mut out, &header)?;
    } else {
        write_header::<BE>(&mut out, &header)?;
    }
    if compressed {
        compress(CompressionMethod::Zlib, payload, &mut out)?;
    } else {
        out.extend_from_slice(payload);
    }
    Ok(out)
}

pub fn decode_cooked(data: &[u8]) -> Result<(CookedHeader, Vec<u8>)> {
    let mut cur = Cursor::new(data);
    let magic = cur.read_u32::<LE>().context("cooked package truncated")?;
    let header = if magic == COOKED_MAGIC {
        read_header::<LE>(&mut cur)?
    } else if magic == COOKED_MAGIC.swap_bytes() {
        read_header::<BE>(&mut cur)?
    } else {
        bail!("bad cooked package magic {magic:#010x}");
    };
    ensure!(header.version <= COOKED_VERSION, "cooked package version {} is newer than {}", header.version, COOKED_VERSION);
    let mut rest = vec![];
    cur.read_to_end(&mut rest)?;
    let payload = if header.flags.contains(CookedFlags::COMPRESSED) {
        let mut out = vec![0; header.uncompressed_size as usize];
        decompress(CompressionMethod::Zlib, &rest, &mut out)?;
        out
    } else {
        ensure!(rest.len() as u64 == header.uncompressed_size, "cooked payload is {} bytes, header says {}", rest.len(), header.uncompressed_size);
        rest
    };
    Ok((header, payload))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum MetadataFile {
    ChunkManifest,
    AssetRegistry,
    CookedFingerprint,
}
impl MetadataFile {
    pub fn file_name(self) -> &'static str {
        match self {
            MetadataFile::ChunkManifest => "ChunkManifest.json",
            MetadataFile::AssetRegistry => "AssetRegistry.bin",
            MetadataFile::CookedFingerprint => "CookedFingerprint.json",
        }
    }
}

const METADATA_DIR: &str = "Metadata";

/// Output tree of a cook, one directory per platform:
/// `<root>/<Platform>/Content/...` for artifacts and `<root>/<Platform>/Metadata/...` for manifests
pub struct Sandbox {
    root: PathBuf,
    writer: Box<dyn FileWriterTrait>,
}
impl Sandbox {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let writer = Box::new(FSFileWriter::new(&root));
        Self::with_writer(root, writer)
    }
    pub fn with_writer(root: impl Into<PathBuf>, writer: Box<dyn FileWriterTrait>) -> Result<Self> {
        let root = root.into();
        if fs::create_dir_all(&root).is_err() || !root.is_dir() {
            return Err(CookError::MissingSandboxRoot(root).into());
        }
        Ok(Self { root, writer })
    }
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Platform relative output path of a package, e.g. `/Game/Maps/Arena` -> `Content/Maps/Arena.umap`
    pub fn cooked_path(package: &str, is_map: bool) -> UEPathBuf {
        let ext = if is_map { "umap" } else { "uasset" };
        let trimmed = package.trim_start_matches('/');
        let (mount, rest) = trimmed.split_once('/').unwrap_or(("Game", trimmed));
        let dir = match mount {
            "Game" => "Content".to_string(),
            "Engine" => "Engine/Content".to_string(),
            plugin => format!("Plugins/{plugin}/Content"),
        };
        UEPathBuf::from(format!("{dir}/{rest}.{ext}"))
    }

    fn platform_relative(platform: &TargetPlatform, rel: &UEPath) -> UEPathBuf {
        UEPath::new(&platform.name).join(rel)
    }
    pub fn platform_dir(&self, platform: &TargetPlatform) -> PathBuf {
        self.root.join(&platform.name)
    }
    pub fn full_path(&self, platform: &TargetPlatform, rel: &UEPath) -> PathBuf {
        self.root.join(Self::platform_relative(platform, rel).as_str())
    }

    pub fn artifact_timestamp(&self, platform: &TargetPlatform, rel: &UEPath) -> Option<SystemTime> {
        fs::metadata(self.full_path(platform, rel)).and_then(|m| m.modified()).ok()
    }
    pub fn write_artifact(&self, platform: &TargetPlatform, rel: &UEPath, data: &[u8]) -> Result<()> {
        self.writer.write_file(&Self::platform_relative(platform, rel), data)
    }
    /// Returns false if there was nothing to delete
    pub fn delete_artifact(&self, platform: &TargetPlatform, rel: &UEPath) -> Result<bool> {
        let path = self.full_path(platform, rel);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }
    pub fn wipe_platform(&self, platform: &TargetPlatform) -> Result<()> {
        let dir = self.platform_dir(platform);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Every cooked artifact of `platform`, metadata excluded, sorted
    #[instrument(skip_all, fields(platform = %platform.name))]
    pub fn artifacts(&self, platform: &TargetPlatform) -> Result<Vec<UEPathBuf>> {
        let base = self.platform_dir(platform);
        let mut found = vec![];
        let mut dirs = vec![base.clone()];
        while let Some(dir) = dirs.pop() {
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    if path != base.join(METADATA_DIR) {
                        dirs.push(path);
                    }
                } else if let Ok(rel) = path.strip_prefix(&base)
                    && let Some(rel) = to_ue_path(rel)
                {
                    found.push(rel);
                }
            }
        }
        found.sort();
        Ok(found)
    }

    fn metadata_relative(file: MetadataFile) -> UEPathBuf {
        UEPath::new(METADATA_DIR).join(file.file_name())
    }
    pub fn write_metadata(&self, platform: &TargetPlatform, file: MetadataFile, data: &[u8]) -> Result<()> {
        self.write_artifact(platform, &Self::metadata_relative(file), data)
    }
    pub fn read_metadata(&self, platform: &TargetPlatform, file: MetadataFile) -> Result<Option<Vec<u8>>> {
        let path = self.full_path(platform, &Self::metadata_relative(file));
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::NullFileWriter;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cooked_paths() {
        assert_eq!(Sandbox::cooked_path("/Game/Maps/Arena", true).as_str(), "Content/Maps/Arena.umap");
        assert_eq!(Sandbox::cooked_path("/Engine/Fonts/Roboto", false).as_str(), "Engine/Content/Fonts/Roboto.uasset");
        assert_eq!(Sandbox::cooked_path("/Paper2D/Sprite", false).as_str(), "Plugins/Paper2D/Content/Sprite.uasset");
    }

    #[test]
    fn test_big_endian_header() -> Result<()> {
        let console = TargetPlatform::from_name("PS3");
        let payload = b"abcabcabcabcabcabcabc".to_vec();
        let cooked = encode_cooked(&console, true, &payload)?;
        assert_eq!(&cooked[..4], &COOKED_MAGIC.to_be_bytes());
        let (header, decoded) = decode_cooked(&cooked)?;
        assert!(header.flags.contains(CookedFlags::COMPRESSED | CookedFlags::EDITOR_DATA_STRIPPED));
        assert_eq!(decoded, payload);

        let editor = TargetPlatform::from_name("WindowsEditor");
        let cooked = encode_cooked(&editor, true, &payload)?;
        assert_eq!(&cooked[..4], &COOKED_MAGIC.to_le_bytes());
        let (header, decoded) = decode_cooked(&cooked)?;
        assert_eq!(header.flags, CookedFlags::empty());
        assert_eq!(decoded, payload);
        Ok(())
    }

    #[test]
    fn test_artifacts_skip_metadata() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sandbox = Sandbox::open(dir.path().join("Saved/Cooked"))?;
        let win = TargetPlatform::from_name("Windows");
        sandbox.write_artifact(&win, UEPath::new("Content/Hero.uasset"), b"x")?;
        sandbox.write_artifact(&win, UEPath::new("Content/Maps/Arena.umap"), b"y")?;
        sandbox.write_metadata(&win, MetadataFile::ChunkManifest, b"{}")?;
        let found = sandbox.artifacts(&win)?;
        assert_eq!(found.iter().map(|p| p.as_str()).collect::<Vec<_>>(), vec!["Content/Hero.uasset", "Content/Maps/Arena.umap"]);
        assert!(sandbox.artifact_timestamp(&win, UEPath::new("Content/Hero.uasset")).is_some());
        assert!(sandbox.delete_artifact(&win, UEPath::new("Content/Hero.uasset"))?);
        assert!(!sandbox.delete_artifact(&win, UEPath::new("Content/Hero.uasset"))?);
        assert_eq!(sandbox.read_metadata(&win, MetadataFile::ChunkManifest)?, Some(b"{}".to_vec()));
        Ok(())
    }

    #[test]
    fn test_missing_root() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("occupied");
        fs::write(&file, b"")?;
        let err = Sandbox::with_writer(&file, Box::new(NullFileWriter)).err().unwrap();
        assert!(matches!(err.downcast_ref::<CookError>(), Some(CookError::MissingSandboxRoot(_))));
        Ok(())
    }
}
