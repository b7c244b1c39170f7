use std::collections::VecDeque;
use std::time::Instant;

use anyhow::{Result, bail};
use tracing::{debug, instrument};

use crate::error::ReplayError;
use crate::replay_format::*;
use crate::replay_streamer::ReplayStreamer;
use crate::ser::Guid;
use crate::settings::ReplaySettings;

/// Game state a recorder snapshots into checkpoints
pub trait ReplicationSource {
    /// Actors whose full state goes into the next checkpoint
    fn checkpoint_actors(&mut self) -> Vec<Guid>;
    /// Full state of one actor as a packet. `None` if it went away since the checkpoint started.
    fn serialize_actor(&mut self, actor: Guid) -> Option<Vec<u8>>;
    fn object_cache(&self) -> &ObjectReferenceCache;
    fn field_exports(&self) -> FieldExportBlob;
}

struct PendingCheckpoint {
    time: f32,
    actors: VecDeque<Guid>,
    packets: Vec<Vec<u8>>,
}

/// Writes frames and periodic checkpoints into a streamer
pub struct ReplayRecorder<S: ReplayStreamer> {
    streamer: S,
    settings: ReplaySettings,
    checksums: bool,
    last_frame_time: Option<f32>,
    last_record_time: Option<f32>,
    last_checkpoint_time: Option<f32>,
    pending: Option<PendingCheckpoint>,
}

impl<S: ReplayStreamer> ReplayRecorder<S> {
    pub fn new(mut streamer: S, mut header: ReplayHeader, settings: ReplaySettings) -> Result<Self> {
        header.flags.set(ReplayFlags::HAS_CHECKSUMS, settings.checksums);
        header.flags.set(ReplayFlags::COMPRESSED_CHECKPOINTS, settings.compress_checkpoints);
        streamer.write_header(&header)?;
        Ok(Self {
            streamer,
            checksums: settings.checksums,
            settings,
            last_frame_time: None,
            last_record_time: None,
            last_checkpoint_time: None,
            pending: None,
        })
    }

    pub fn streamer(&self) -> &S {
        &self.streamer
    }

    /// Rate limit on frames, always true when no record rate is configured
    pub fn should_record(&mut self, time: f32) -> bool {
        if self.settings.record_hz <= 0.0 {
            return true;
        }
        match self.last_record_time {
            Some(last) if time - last < 1.0 / self.settings.record_hz => false,
            _ => {
                self.last_record_time = Some(time);
                true
            }
        }
    }

    /// Appends a frame. Timestamps may repeat but never go backwards.
    pub fn write_frame(&mut self, frame: &ReplayFrame) -> Result<()> {
        if let Some(last) = self.last_frame_time
            && frame.time < last
        {
            bail!(ReplayError::OutOfOrderTimestamp { time: frame.time, last });
        }
        let mut buf = vec![];
        write_frame(&mut buf, frame, self.checksums)?;
        self.streamer.append_data(&buf)?;
        self.last_frame_time = Some(frame.time);
        self.streamer.set_total_time_ms(to_ms(frame.time));
        Ok(())
    }

    pub fn is_checkpoint_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Starts a checkpoint when one is due and keeps writing a pending one.
    /// Returns true when a checkpoint was completed this tick.
    pub fn tick(&mut self, time: f32, source: &mut dyn ReplicationSource) -> Result<bool> {
        if self.pending.is_none() {
            let due = match self.last_checkpoint_time {
                None => true,
                Some(last) => time - last >= self.settings.checkpoint_interval.as_secs_f32(),
            };
            if !due {
                return Ok(false);
            }
            self.begin_checkpoint(time, source);
        }
        self.continue_checkpoint(source)
    }

    /// Starts a checkpoint right away, any pending one is finished first
    pub fn write_checkpoint(&mut self, time: f32, source: &mut dyn ReplicationSource) -> Result<bool> {
        while self.pending.is_some() {
            self.continue_checkpoint(source)?;
        }
        self.begin_checkpoint(time, source);
        self.continue_checkpoint(source)
    }

    fn begin_checkpoint(&mut self, time: f32, source: &mut dyn ReplicationSource) {
        let actors: VecDeque<Guid> = source.checkpoint_actors().into();
        debug!(time, actors = actors.len(), "starting checkpoint");
        self.pending = Some(PendingCheckpoint {
            time,
            actors,
            packets: vec![],
        });
    }

    /// Serializes pending actors until the upload budget runs out, at least one per call
    #[instrument(skip_all)]
    fn continue_checkpoint(&mut self, source: &mut dyn ReplicationSource) -> Result<bool> {
        let Some(pending) = &mut self.pending else {
            return Ok(false);
        };
        let budget = self.settings.max_checkpoint_upload_time;
        let start = Instant::now();
        let mut written = 0;
        while let Some(actor) = pending.actors.front().copied() {
            if !budget.is_zero() && written > 0 && start.elapsed() >= budget {
                debug!(remaining = pending.actors.len(), "checkpoint continues next tick");
                return Ok(false);
            }
            pending.actors.pop_front();
            if let Some(packet) = source.serialize_actor(actor) {
                // oversized actor state is split, packet boundaries carry no meaning here
                pending.packets.extend(packet.chunks(MAX_PACKET_SIZE).map(<[u8]>::to_vec));
            }
            written += 1;
        }
        let Some(pending) = self.pending.take() else {
            return Ok(false);
        };
        let checkpoint = Checkpoint {
            cache: source.object_cache().snapshot(),
            field_exports: source.field_exports(),
            frame: ReplayFrame {
                time: pending.time,
                packets: pending.packets,
                ..Default::default()
            },
        };
        let mut buf = vec![];
        write_checkpoint(&mut buf, &checkpoint, self.checksums)?;
        self.streamer.append_checkpoint(to_ms(pending.time), &buf)?;
        self.last_checkpoint_time = Some(pending.time);
        debug!(time = pending.time, bytes = buf.len(), "checkpoint written");
        Ok(true)
    }

    /// Flushes a pending checkpoint and closes the stream
    pub fn finalize(mut self, source: &mut dyn ReplicationSource) -> Result<S> {
        while self.pending.is_some() {
            self.continue_checkpoint(source)?;
        }
        self.streamer.finalize()?;
        Ok(self.streamer)
    }
}

pub(crate) fn to_ms(time: f32) -> u32 {
    (time.max(0.0) * 1000.0).round() as u32
}
