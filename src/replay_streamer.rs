use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result, bail};
use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use fs_err as fs;
use strum::FromRepr;
use tracing::instrument;

use crate::compression::{CompressionMethod, compress, decompress};
use crate::error::ReplayError;
use crate::replay_format::{FrameRead, ReplayFlags, ReplayHeader, read_checkpoint, read_frame};
use crate::ser::*;

const LOCAL_FILE_MAGIC: u32 = 0x1CA2E27F;
const LOCAL_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
enum ChunkType {
    Header = 0,
    ReplayData = 1,
    Checkpoint = 2,
}

/// Where a checkpoint sits in the stream. `data_offset` is the length of the replay data when it
/// was taken, frames after it continue from there.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckpointInfo {
    pub time_ms: u32,
    pub data_offset: u64,
}

#[derive(Debug, Clone, PartialEq)]
struct StoredCheckpoint {
    info: CheckpointInfo,
    method: CompressionMethod,
    uncompressed_size: u32,
    data: Vec<u8>,
}

/// Storage of one replay. Writers append, readers may follow along while `is_live`.
pub trait ReplayStreamer {
    fn header(&self) -> Option<ReplayHeader>;
    fn write_header(&mut self, header: &ReplayHeader) -> Result<()>;
    /// Runs `f` over every replay data byte written so far
    fn with_data<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T;
    fn append_data(&mut self, bytes: &[u8]) -> Result<()>;
    fn checkpoints(&self) -> Vec<CheckpointInfo>;
    /// Returns the checkpoint bytes as they were appended
    fn load_checkpoint(&self, index: usize) -> Result<Vec<u8>, ReplayError>;
    fn append_checkpoint(&mut self, time_ms: u32, bytes: &[u8]) -> Result<()>;
    fn total_time_ms(&self) -> u32;
    fn set_total_time_ms(&mut self, time_ms: u32);
    fn is_live(&self) -> bool;
    /// Marks the recording as complete
    fn finalize(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryStreamer {
    header: Option<ReplayHeader>,
    data: Vec<u8>,
    checkpoints: Vec<StoredCheckpoint>,
    total_time_ms: u32,
    live: bool,
}
impl Default for MemoryStreamer {
    fn default() -> Self {
        Self::new()
    }
}
impl MemoryStreamer {
    pub fn new() -> Self {
        Self {
            header: None,
            data: vec![],
            checkpoints: vec![],
            total_time_ms: 0,
            live: true,
        }
    }
    fn checkpoint_method(&self) -> CompressionMethod {
        match &self.header {
            Some(h) if h.flags.contains(ReplayFlags::COMPRESSED_CHECKPOINTS) => CompressionMethod::Lz4,
            _ => CompressionMethod::None,
        }
    }

    fn write<S: Write>(&self, s: &mut S) -> Result<()> {
        s.write_u32::<LE>(LOCAL_FILE_MAGIC)?;
        s.write_u32::<LE>(LOCAL_FILE_VERSION)?;
        s.write_u32::<LE>(self.total_time_ms)?;
        s.ser(&self.live)?;

        let mut write_chunk = |kind: ChunkType, bytes: &[u8]| -> Result<()> {
            s.write_u32::<LE>(kind as u32)?;
            s.write_u32::<LE>(bytes.len() as u32)?;
            s.write_all(bytes)?;
            Ok(())
        };
        if let Some(header) = &self.header {
            let mut buf = vec![];
            WriteExt::ser(&mut buf, header)?;
            write_chunk(ChunkType::Header, &buf)?;
        }
        write_chunk(ChunkType::ReplayData, &self.data)?;
        for checkpoint in &self.checkpoints {
            let mut buf = vec![];
            buf.write_u32::<LE>(checkpoint.info.time_ms)?;
            buf.write_u64::<LE>(checkpoint.info.data_offset)?;
            buf.write_u8(checkpoint.method as u8)?;
            buf.write_u32::<LE>(checkpoint.uncompressed_size)?;
            buf.write_all(&checkpoint.data)?;
            write_chunk(ChunkType::Checkpoint, &buf)?;
        }
        Ok(())
    }

    fn read<S: Read>(s: &mut S) -> Result<Self> {
        let magic = s.read_u32::<LE>()?;
        if magic != LOCAL_FILE_MAGIC {
            bail!(ReplayError::corrupt(format!("not a replay file (magic {magic:#x})")));
        }
        let version = s.read_u32::<LE>()?;
        if version > LOCAL_FILE_VERSION {
            bail!("replay file version {version} is newer than supported {LOCAL_FILE_VERSION}");
        }
        let mut streamer = Self {
            total_time_ms: s.read_u32::<LE>()?,
            live: s.de()?,
            ..Self::new()
        };
        let mut kind = [0; 4];
        loop {
            // a clean end between chunks is the end of the file
            match s.read_exact(&mut kind) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let kind = u32::from_le_bytes(kind);
            let size = s.read_u32::<LE>()?;
            let mut bytes = vec![0; size as usize];
            s.read_exact(&mut bytes).context("truncated chunk")?;
            match ChunkType::from_repr(kind) {
                Some(ChunkType::Header) => streamer.header = Some(Cursor::new(&bytes).de()?),
                Some(ChunkType::ReplayData) => streamer.data.extend(bytes),
                Some(ChunkType::Checkpoint) => {
                    let mut cur = Cursor::new(&bytes);
                    let info = CheckpointInfo {
                        time_ms: cur.read_u32::<LE>()?,
                        data_offset: cur.read_u64::<LE>()?,
                    };
                    let method = cur.read_u8()?;
                    let method = CompressionMethod::from_repr(method).with_context(|| format!("unknown checkpoint compression {method}"))?;
                    let uncompressed_size = cur.read_u32::<LE>()?;
                    let start = cur.position() as usize;
                    streamer.checkpoints.push(StoredCheckpoint {
                        info,
                        method,
                        uncompressed_size,
                        data: bytes[start..].to_vec(),
                    });
                }
                // unknown chunks are skipped so newer writers stay readable
                None => {}
            }
        }
        Ok(streamer)
    }
}
impl ReplayStreamer for MemoryStreamer {
    fn header(&self) -> Option<ReplayHeader> {
        self.header.clone()
    }
    fn write_header(&mut self, header: &ReplayHeader) -> Result<()> {
        if self.header.is_some() {
            bail!("replay header already written");
        }
        self.header = Some(header.clone());
        Ok(())
    }
    fn with_data<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        f(&self.data)
    }
    fn append_data(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.live {
            bail!("replay already finalized");
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }
    fn checkpoints(&self) -> Vec<CheckpointInfo> {
        self.checkpoints.iter().map(|c| c.info).collect()
    }
    fn load_checkpoint(&self, index: usize) -> Result<Vec<u8>, ReplayError> {
        let Some(checkpoint) = self.checkpoints.get(index) else {
            return Err(ReplayError::corrupt(format!("checkpoint {index} does not exist")));
        };
        let mut out = vec![0; checkpoint.uncompressed_size as usize];
        decompress(checkpoint.method, &checkpoint.data, &mut out).map_err(|e| ReplayError::corrupt(format!("checkpoint {index}: {e:#}")))?;
        Ok(out)
    }
    fn append_checkpoint(&mut self, time_ms: u32, bytes: &[u8]) -> Result<()> {
        if !self.live {
            bail!("replay already finalized");
        }
        if let Some(last) = self.checkpoints.last()
            && last.info.time_ms > time_ms
        {
            bail!("checkpoint at {time_ms}ms after one at {}ms", last.info.time_ms);
        }
        let method = self.checkpoint_method();
        let mut data = vec![];
        compress(method, bytes, &mut data)?;
        self.checkpoints.push(StoredCheckpoint {
            info: CheckpointInfo {
                time_ms,
                data_offset: self.data.len() as u64,
            },
            method,
            uncompressed_size: bytes.len() as u32,
            data,
        });
        self.total_time_ms = self.total_time_ms.max(time_ms);
        Ok(())
    }
    fn total_time_ms(&self) -> u32 {
        self.total_time_ms
    }
    fn set_total_time_ms(&mut self, time_ms: u32) {
        self.total_time_ms = self.total_time_ms.max(time_ms);
    }
    fn is_live(&self) -> bool {
        self.live
    }
    fn finalize(&mut self) -> Result<()> {
        self.live = false;
        Ok(())
    }
}

/// Replay kept in a local file, rewritten on `flush` and `finalize`
#[derive(Debug)]
pub struct FileStreamer {
    path: PathBuf,
    inner: MemoryStreamer,
}
impl FileStreamer {
    pub fn create(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: MemoryStreamer::new(),
        }
    }
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let inner = MemoryStreamer::read(&mut Cursor::new(&bytes)).with_context(|| format!("reading replay {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            inner,
        })
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
    pub fn flush(&self) -> Result<()> {
        let mut buf = vec![];
        self.inner.write(&mut buf)?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, buf)?;
        Ok(())
    }
}
impl ReplayStreamer for FileStreamer {
    fn header(&self) -> Option<ReplayHeader> {
        self.inner.header()
    }
    fn write_header(&mut self, header: &ReplayHeader) -> Result<()> {
        self.inner.write_header(header)
    }
    fn with_data<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        self.inner.with_data(f)
    }
    fn append_data(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.append_data(bytes)
    }
    fn checkpoints(&self) -> Vec<CheckpointInfo> {
        self.inner.checkpoints()
    }
    fn load_checkpoint(&self, index: usize) -> Result<Vec<u8>, ReplayError> {
        self.inner.load_checkpoint(index)
    }
    fn append_checkpoint(&mut self, time_ms: u32, bytes: &[u8]) -> Result<()> {
        self.inner.append_checkpoint(time_ms, bytes)?;
        self.flush()
    }
    fn total_time_ms(&self) -> u32 {
        self.inner.total_time_ms()
    }
    fn set_total_time_ms(&mut self, time_ms: u32) {
        self.inner.set_total_time_ms(time_ms)
    }
    fn is_live(&self) -> bool {
        self.inner.is_live()
    }
    fn finalize(&mut self) -> Result<()> {
        self.inner.finalize()?;
        self.flush()
    }
}

/// One stream shared by a recorder and any number of live viewers
#[derive(Debug, Clone, Default)]
pub struct SharedStreamer(Arc<Mutex<MemoryStreamer>>);
impl SharedStreamer {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn snapshot(&self) -> MemoryStreamer {
        self.0.lock().unwrap().clone()
    }
}
impl ReplayStreamer for SharedStreamer {
    fn header(&self) -> Option<ReplayHeader> {
        self.0.lock().unwrap().header()
    }
    fn write_header(&mut self, header: &ReplayHeader) -> Result<()> {
        self.0.lock().unwrap().write_header(header)
    }
    fn with_data<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        self.0.lock().unwrap().with_data(f)
    }
    fn append_data(&mut self, bytes: &[u8]) -> Result<()> {
        self.0.lock().unwrap().append_data(bytes)
    }
    fn checkpoints(&self) -> Vec<CheckpointInfo> {
        self.0.lock().unwrap().checkpoints()
    }
    fn load_checkpoint(&self, index: usize) -> Result<Vec<u8>, ReplayError> {
        self.0.lock().unwrap().load_checkpoint(index)
    }
    fn append_checkpoint(&mut self, time_ms: u32, bytes: &[u8]) -> Result<()> {
        self.0.lock().unwrap().append_checkpoint(time_ms, bytes)
    }
    fn total_time_ms(&self) -> u32 {
        self.0.lock().unwrap().total_time_ms()
    }
    fn set_total_time_ms(&mut self, time_ms: u32) {
        self.0.lock().unwrap().set_total_time_ms(time_ms)
    }
    fn is_live(&self) -> bool {
        self.0.lock().unwrap().is_live()
    }
    fn finalize(&mut self) -> Result<()> {
        self.0.lock().unwrap().finalize()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSummary {
    pub frames: usize,
    pub packets: usize,
    pub external_data: usize,
    pub checkpoints: usize,
    pub last_frame_time: f32,
    /// The producer is still writing, the tail may be incomplete
    pub live: bool,
}

/// Reads every frame and checkpoint of a stream, failing on the first corruption
#[instrument(skip_all)]
pub fn verify_stream<S: ReplayStreamer>(streamer: &S) -> Result<StreamSummary> {
    let Some(header) = streamer.header() else {
        bail!(ReplayError::corrupt("stream has no header"));
    };
    let checksums = header.flags.contains(ReplayFlags::HAS_CHECKSUMS);
    let live = streamer.is_live();
    let mut summary = StreamSummary { live, ..Default::default() };
    streamer.with_data(|data| -> Result<()> {
        let mut offset = 0;
        loop {
            let frame = match read_frame(data, &mut offset, checksums, live) {
                Ok(FrameRead::Frame(frame)) => frame,
                Ok(FrameRead::EndOfStream) | Err(ReplayError::NotYetAvailable) => return Ok(()),
                Err(err) => return Err(err).with_context(|| format!("frame {} at offset {offset}", summary.frames)),
            };
            if frame.time < summary.last_frame_time {
                bail!(ReplayError::corrupt(format!("frame {} at {}s goes back from {}s", summary.frames, frame.time, summary.last_frame_time)));
            }
            summary.frames += 1;
            summary.packets += frame.packets.len();
            summary.external_data += frame.external_data.len();
            summary.last_frame_time = frame.time;
        }
    })?;
    let data_len = streamer.with_data(|d| d.len() as u64);
    for (index, info) in streamer.checkpoints().into_iter().enumerate() {
        if info.data_offset > data_len {
            bail!(ReplayError::corrupt(format!("checkpoint {index} points past the replay data")));
        }
        read_checkpoint(&streamer.load_checkpoint(index)?, checksums).with_context(|| format!("checkpoint {index} at {}ms", info.time_ms))?;
        summary.checkpoints += 1;
    }
    Ok(summary)
}
