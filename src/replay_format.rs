use std::io::{Cursor, Read, Write};

use anyhow::Result;
use bitflags::bitflags;
use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use indexmap::IndexMap;

use crate::error::ReplayError;
use crate::ser::*;

pub const REPLAY_MAGIC: u32 = 0x2CF5A13D;
/// Packets above this are a broken stream rather than a big update
pub const MAX_PACKET_SIZE: usize = 2048;
pub const TRANSFORM_SIZE: usize = 40;

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ReplayFlags: u32 {
        const HAS_CHECKSUMS = 1;
        const COMPRESSED_CHECKPOINTS = 1 << 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayHeader {
    pub network_version: u32,
    pub changelist: u32,
    pub flags: ReplayFlags,
    pub map_name: String,
}
impl Readable for ReplayHeader {
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        let magic: u32 = s.de()?;
        if magic != REPLAY_MAGIC {
            return Err(ReplayError::corrupt(format!("bad replay magic {magic:#x}")).into());
        }
        Ok(Self {
            network_version: s.de()?,
            changelist: s.de()?,
            flags: ReplayFlags::from_bits_retain(s.de()?),
            map_name: s.de()?,
        })
    }
}
impl Writeable for ReplayHeader {
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&REPLAY_MAGIC)?;
        s.ser(&self.network_version)?;
        s.ser(&self.changelist)?;
        s.ser(&self.flags.bits())?;
        s.ser(&self.map_name)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamingLevel {
    pub package_name: String,
    pub package_to_load: String,
    pub transform: [u8; TRANSFORM_SIZE],
}
impl Readable for StreamingLevel {
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        Ok(Self {
            package_name: s.de()?,
            package_to_load: s.de()?,
            transform: s.de()?,
        })
    }
}
impl Writeable for StreamingLevel {
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.package_name)?;
        s.ser(&self.package_to_load)?;
        s.ser(&self.transform)?;
        Ok(())
    }
}

/// Out of band payload for one object, `num_bits` is the exact bit length of `payload`
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalData {
    pub num_bits: u32,
    pub guid: Guid,
    pub payload: Vec<u8>,
}
impl ExternalData {
    pub fn from_bytes(guid: Guid, payload: Vec<u8>) -> Self {
        Self {
            num_bits: payload.len() as u32 * 8,
            guid,
            payload,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayFrame {
    pub time: f32,
    pub streaming_levels: Vec<StreamingLevel>,
    pub external_data: Vec<ExternalData>,
    pub packets: Vec<Vec<u8>>,
}
impl ReplayFrame {
    pub fn new(time: f32) -> Self {
        Self { time, ..Default::default() }
    }
}

fn write_frame_body<S: Write>(s: &mut S, frame: &ReplayFrame) -> Result<()> {
    s.ser(&frame.time)?;
    write_packed(s, frame.streaming_levels.len() as u32)?;
    s.ser_no_length(&frame.streaming_levels)?;
    for data in &frame.external_data {
        if data.num_bits == 0 {
            continue;
        }
        if data.payload.len() != data.num_bits.div_ceil(8) as usize {
            return Err(ReplayError::corrupt(format!("external data for {} has {} bytes for {} bits", data.guid, data.payload.len(), data.num_bits)).into());
        }
        write_packed(s, data.num_bits)?;
        s.ser(&data.guid)?;
        s.write_all(&data.payload)?;
    }
    write_packed(s, 0)?;
    for packet in &frame.packets {
        if packet.is_empty() {
            continue;
        }
        if packet.len() > MAX_PACKET_SIZE {
            return Err(ReplayError::corrupt(format!("packet of {} bytes exceeds {MAX_PACKET_SIZE}", packet.len())).into());
        }
        s.write_i32::<LE>(packet.len() as i32)?;
        s.write_all(packet)?;
    }
    s.write_i32::<LE>(0)?;
    Ok(())
}

fn read_frame_body<S: Read>(s: &mut S) -> Result<ReplayFrame> {
    let time: f32 = s.de()?;
    if !time.is_finite() || time < 0.0 {
        return Err(ReplayError::corrupt(format!("frame time {time}")).into());
    }
    let levels = read_packed(s)?;
    let streaming_levels = read_array(levels as usize, s, StreamingLevel::de)?;
    let mut external_data = vec![];
    loop {
        let num_bits = read_packed(s)?;
        if num_bits == 0 {
            break;
        }
        let guid = s.de()?;
        let mut payload = vec![0; num_bits.div_ceil(8) as usize];
        s.read_exact(&mut payload)?;
        external_data.push(ExternalData { num_bits, guid, payload });
    }
    let mut packets = vec![];
    loop {
        let len = s.read_i32::<LE>()?;
        if len == 0 {
            break;
        }
        if len < 0 || len as usize > MAX_PACKET_SIZE {
            return Err(ReplayError::corrupt(format!("packet length {len}")).into());
        }
        let mut packet = vec![0; len as usize];
        s.read_exact(&mut packet)?;
        packets.push(packet);
    }
    Ok(ReplayFrame {
        time,
        streaming_levels,
        external_data,
        packets,
    })
}

fn frame_checksum(bytes: &[u8]) -> u32 {
    let hash = blake3::hash(bytes);
    let b = hash.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Appends one frame, followed by its checksum when `checksums` is set
pub fn write_frame<S: Write>(s: &mut S, frame: &ReplayFrame, checksums: bool) -> Result<()> {
    let mut buf = vec![];
    write_frame_body(&mut buf, frame)?;
    s.write_all(&buf)?;
    if checksums {
        s.write_u32::<LE>(frame_checksum(&buf))?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameRead {
    Frame(ReplayFrame),
    EndOfStream,
}

fn is_truncation(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|e| e.downcast_ref::<std::io::Error>().is_some_and(|e| e.kind() == std::io::ErrorKind::UnexpectedEof))
}

/// Classifies a failed read: running out of bytes on a live stream means "later", everything else
/// is corruption
fn read_failure(err: anyhow::Error, live: bool) -> ReplayError {
    let err = match err.downcast::<ReplayError>() {
        Ok(replay) => return replay,
        Err(err) => err,
    };
    if is_truncation(&err) {
        if live {
            return ReplayError::NotYetAvailable;
        }
        return ReplayError::corrupt("stream ends in the middle of a frame");
    }
    ReplayError::corrupt(format!("{err:#}"))
}

/// Reads the frame at `*offset` of `data` and advances past it. `offset` is only moved on success,
/// so a `NotYetAvailable` read can be retried at the same place once more data arrived.
pub fn read_frame(data: &[u8], offset: &mut usize, checksums: bool, live: bool) -> Result<FrameRead, ReplayError> {
    let Some(rest) = data.get(*offset..) else {
        return Err(ReplayError::corrupt(format!("offset {offset} past end of {} bytes", data.len())));
    };
    if rest.is_empty() {
        return if live { Err(ReplayError::NotYetAvailable) } else { Ok(FrameRead::EndOfStream) };
    }
    let mut cur = Cursor::new(rest);
    let frame = read_frame_body(&mut cur).map_err(|e| read_failure(e, live))?;
    let body_len = cur.position() as usize;
    if checksums {
        let stored = cur.read_u32::<LE>().map_err(|e| read_failure(e.into(), live))?;
        let actual = frame_checksum(&rest[..body_len]);
        if stored != actual {
            return Err(ReplayError::corrupt(format!("checksum mismatch for frame at {}s: {stored:#010x} != {actual:#010x}", frame.time)));
        }
    }
    *offset += cur.position() as usize;
    Ok(FrameRead::Frame(frame))
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct CacheEntryFlags: u8 {
        /// Referenced but never loaded from its path
        const NO_LOAD = 1;
        const IGNORE_WHEN_MISSING = 1 << 1;
        /// Spawned at runtime, only reachable through its session handle
        const DYNAMIC = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheEntry {
    pub guid: Guid,
    pub outer_guid: Guid,
    pub path_name: String,
    pub checksum: u32,
    pub flags: CacheEntryFlags,
}
impl CacheEntry {
    /// Can be found again by path in another session
    pub fn is_name_stable(&self) -> bool {
        !self.flags.contains(CacheEntryFlags::DYNAMIC) && !self.path_name.is_empty()
    }
}
impl Readable for CacheEntry {
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        Ok(Self {
            guid: s.de()?,
            outer_guid: s.de()?,
            path_name: s.de()?,
            checksum: s.de()?,
            flags: CacheEntryFlags::from_bits_retain(s.de()?),
        })
    }
}
impl Writeable for CacheEntry {
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.guid)?;
        s.ser(&self.outer_guid)?;
        s.ser(&self.path_name)?;
        s.ser(&self.checksum)?;
        s.ser(&self.flags.bits())?;
        Ok(())
    }
}

/// Maps network guids to the objects they stand for, in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectReferenceCache {
    entries: IndexMap<Guid, CacheEntry>,
}
impl ObjectReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn insert(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.guid, entry);
    }
    pub fn get(&self, guid: Guid) -> Option<&CacheEntry> {
        self.entries.get(&guid)
    }
    pub fn remove(&mut self, guid: Guid) -> Option<CacheEntry> {
        self.entries.shift_remove(&guid)
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }
    /// The part of the cache a checkpoint can carry
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.entries.values().filter(|e| e.is_name_stable()).cloned().collect()
    }
}
impl FromIterator<CacheEntry> for ObjectReferenceCache {
    fn from_iter<T: IntoIterator<Item = CacheEntry>>(iter: T) -> Self {
        let mut cache = Self::new();
        for entry in iter {
            cache.insert(entry);
        }
        cache
    }
}

/// Opaque property export layout, only its version is interpreted
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldExportBlob {
    pub version: u32,
    pub data: Vec<u8>,
}
impl Readable for FieldExportBlob {
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        Ok(Self {
            version: s.de()?,
            data: s.de()?,
        })
    }
}
impl Writeable for FieldExportBlob {
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.version)?;
        s.ser(&self.data)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkpoint {
    pub cache: Vec<CacheEntry>,
    pub field_exports: FieldExportBlob,
    pub frame: ReplayFrame,
}
impl Checkpoint {
    pub fn object_cache(&self) -> ObjectReferenceCache {
        self.cache.iter().cloned().collect()
    }
}

/// Serializes a checkpoint. Entries that are not name stable are left out.
pub fn write_checkpoint<S: Write>(s: &mut S, checkpoint: &Checkpoint, checksums: bool) -> Result<()> {
    let stable: Vec<&CacheEntry> = checkpoint.cache.iter().filter(|e| e.is_name_stable()).collect();
    s.write_i32::<LE>(stable.len() as i32)?;
    for entry in stable {
        s.ser(entry)?;
    }
    s.ser(&checkpoint.field_exports)?;
    write_frame(s, &checkpoint.frame, checksums)
}

/// Checkpoints are stored whole, so running out of bytes here is always corruption
pub fn read_checkpoint(data: &[u8], checksums: bool) -> Result<Checkpoint, ReplayError> {
    let mut cur = Cursor::new(data);
    let read_prefix = |cur: &mut Cursor<&[u8]>| -> Result<(Vec<CacheEntry>, FieldExportBlob)> {
        let count = cur.read_i32::<LE>()?;
        if count < 0 {
            return Err(ReplayError::corrupt(format!("checkpoint cache count {count}")).into());
        }
        let cache = read_array(count as usize, cur, CacheEntry::de)?;
        Ok((cache, cur.de()?))
    };
    let (cache, field_exports) = read_prefix(&mut cur).map_err(|e| read_failure(e, false))?;
    let mut offset = cur.position() as usize;
    let frame = match read_frame(data, &mut offset, checksums, false)? {
        FrameRead::Frame(frame) => frame,
        FrameRead::EndOfStream => return Err(ReplayError::corrupt("checkpoint without a frame")),
    };
    Ok(Checkpoint { cache, field_exports, frame })
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(id: u128, path: &str, flags: CacheEntryFlags) -> CacheEntry {
        CacheEntry {
            guid: Guid::from_u128(id),
            outer_guid: Guid::default(),
            path_name: path.to_string(),
            checksum: id as u32 * 7,
            flags,
        }
    }

    fn frame(time: f32) -> ReplayFrame {
        ReplayFrame {
            time,
            streaming_levels: vec![StreamingLevel {
                package_name: "/Game/Maps/Arena_Audio".into(),
                package_to_load: "/Game/Maps/Arena_Audio".into(),
                transform: [3; TRANSFORM_SIZE],
            }],
            external_data: vec![ExternalData {
                num_bits: 13,
                guid: Guid::from_u128(9),
                payload: vec![0xff, 0x1f],
            }],
            packets: vec![vec![1, 2, 3], vec![0xaa; MAX_PACKET_SIZE]],
        }
    }

    #[test]
    fn test_frames_read_back_in_order() -> Result<()> {
        let mut data = vec![];
        let frames = [frame(0.0), ReplayFrame::new(0.5), frame(1.25)];
        for f in &frames {
            write_frame(&mut data, f, true)?;
        }
        let mut offset = 0;
        for f in &frames {
            assert_eq!(read_frame(&data, &mut offset, true, false)?, FrameRead::Frame(f.clone()));
        }
        assert_eq!(read_frame(&data, &mut offset, true, false)?, FrameRead::EndOfStream);
        Ok(())
    }

    #[test]
    fn test_truncated_live_stream_is_not_yet_available() -> Result<()> {
        let mut data = vec![];
        write_frame(&mut data, &frame(2.0), false)?;
        let partial = &data[..data.len() - 5];
        let mut offset = 0;
        assert!(matches!(read_frame(partial, &mut offset, false, true), Err(ReplayError::NotYetAvailable)));
        assert_eq!(offset, 0);
        assert!(matches!(read_frame(partial, &mut offset, false, false), Err(ReplayError::Corrupt(_))));
        assert!(matches!(read_frame(&data[..0], &mut offset, false, true), Err(ReplayError::NotYetAvailable)));
        Ok(())
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() -> Result<()> {
        let mut data = vec![];
        write_frame(&mut data, &frame(2.0), true)?;
        data[20] ^= 0x40;
        let err = read_frame(&data, &mut 0, true, true).unwrap_err();
        assert!(matches!(err, ReplayError::Corrupt(_)), "{err}");
        Ok(())
    }

    #[test]
    fn test_oversized_packet() {
        let mut big = ReplayFrame::new(1.0);
        big.packets.push(vec![0; MAX_PACKET_SIZE + 1]);
        assert!(write_frame(&mut vec![], &big, false).is_err());

        let mut data = vec![];
        data.extend(1.0f32.to_le_bytes());
        data.extend([0, 0]);
        data.extend((MAX_PACKET_SIZE as i32 + 1).to_le_bytes());
        assert!(matches!(read_frame(&data, &mut 0, false, true), Err(ReplayError::Corrupt(_))));
    }

    #[test]
    fn test_checkpoint_keeps_stable_entries() -> Result<()> {
        let checkpoint = Checkpoint {
            cache: vec![
                entry(1, "/Game/Maps/Arena.Arena:PersistentLevel", CacheEntryFlags::empty()),
                entry(2, "", CacheEntryFlags::empty()),
                entry(3, "/Game/Hero.Hero_C", CacheEntryFlags::NO_LOAD | CacheEntryFlags::IGNORE_WHEN_MISSING),
                entry(4, "Hero_C_12", CacheEntryFlags::DYNAMIC),
            ],
            field_exports: FieldExportBlob { version: 2, data: vec![7; 9] },
            frame: frame(30.0),
        };
        let mut data = vec![];
        write_checkpoint(&mut data, &checkpoint, true)?;
        let read = read_checkpoint(&data, true)?;
        let expected: ObjectReferenceCache = checkpoint.cache.iter().filter(|e| e.is_name_stable()).cloned().collect();
        assert_eq!(read.object_cache(), expected);
        assert_eq!(read.cache.len(), 2);
        assert_eq!(read.field_exports, checkpoint.field_exports);
        assert_eq!(read.frame, checkpoint.frame);

        assert!(matches!(read_checkpoint(&data[..data.len() - 1], true), Err(ReplayError::Corrupt(_))));
        Ok(())
    }

    #[test]
    fn test_header() -> Result<()> {
        let header = ReplayHeader {
            network_version: 14,
            changelist: 4_096_123,
            flags: ReplayFlags::HAS_CHECKSUMS,
            map_name: "/Game/Maps/Arena".into(),
        };
        let mut data = vec![];
        WriteExt::ser(&mut data, &header)?;
        assert_eq!(Cursor::new(&data).de::<ReplayHeader>()?, header);
        data[0] = 0;
        assert!(Cursor::new(&data).de::<ReplayHeader>().is_err());
        Ok(())
    }
}
