use std::collections::VecDeque;

use anyhow::Result;
use indexmap::IndexSet;
use strum::AsRefStr;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ReplayError;
use crate::replay_format::*;
use crate::replay_recorder::to_ms;
use crate::replay_streamer::ReplayStreamer;
use crate::ser::Guid;
use crate::settings::ReplaySettings;

/// How close to the end a seek may land, the last frame has to stay readable
const END_EPSILON: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum PlaybackState {
    Stopped,
    Connecting,
    Playing,
    Scrubbing,
    FastForwarding,
}

#[derive(Debug, Clone, Copy, PartialEq, AsRefStr)]
pub enum ScrubTask {
    GotoTime(f32),
    SkipTime(f32),
    JumpToLiveEdge,
}
impl ScrubTask {
    fn same_kind(&self, other: &ScrubTask) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
    fn is_blocking(&self) -> bool {
        !matches!(self, ScrubTask::SkipTime(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepNotify {
    pub actor: Guid,
    pub property: String,
}

/// What applying one frame did to the world
#[derive(Debug, Default)]
pub struct FrameEffects {
    pub notifies: Vec<RepNotify>,
    pub destroyed: Vec<Guid>,
    /// Objects the frame introduced, added to the reference cache
    pub exported: Vec<CacheEntry>,
}

/// The game side of playback. Property updates go through `apply_frame`, visible side effects
/// through the other callbacks so they can be held back while scrubbing.
pub trait ReplayWorld {
    fn load_checkpoint(&mut self, cache: &ObjectReferenceCache, field_exports: &FieldExportBlob);
    fn apply_frame(&mut self, frame: &ReplayFrame) -> FrameEffects;
    fn call_rep_notifies(&mut self, notifies: &[RepNotify]);
    fn destroy_actors(&mut self, actors: &[Guid]);
    fn goto_time_finished(&mut self, success: bool);
    fn pause_channels(&mut self, _paused: bool) {}
}

/// Side effects held back until a scrub settles
#[derive(Debug, Default)]
struct Settle {
    notifies: IndexSet<RepNotify>,
    destroyed: IndexSet<Guid>,
}

/// Plays a replay stream into a `ReplayWorld` on an externally driven clock
pub struct PlaybackController<S: ReplayStreamer> {
    streamer: S,
    settings: ReplaySettings,
    state: PlaybackState,
    header: Option<ReplayHeader>,
    checksums: bool,
    time: f32,
    speed: f32,
    read_offset: usize,
    buffered: VecDeque<ReplayFrame>,
    end_of_stream: bool,
    channels_paused: bool,
    cache: ObjectReferenceCache,
    tasks: VecDeque<ScrubTask>,
    active: Option<ScrubTask>,
    settle: Option<Settle>,
}

impl<S: ReplayStreamer> PlaybackController<S> {
    pub fn new(streamer: S, settings: ReplaySettings) -> Self {
        Self {
            streamer,
            settings,
            state: PlaybackState::Stopped,
            header: None,
            checksums: false,
            time: 0.0,
            speed: 1.0,
            read_offset: 0,
            buffered: VecDeque::new(),
            end_of_stream: false,
            channels_paused: false,
            cache: ObjectReferenceCache::new(),
            tasks: VecDeque::new(),
            active: None,
            settle: None,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }
    pub fn time(&self) -> f32 {
        self.time
    }
    pub fn header(&self) -> Option<&ReplayHeader> {
        self.header.as_ref()
    }
    pub fn object_cache(&self) -> &ObjectReferenceCache {
        &self.cache
    }
    pub fn total_time(&self) -> f32 {
        self.streamer.total_time_ms() as f32 / 1000.0
    }
    pub fn is_paused_at_end(&self) -> bool {
        self.channels_paused
    }
    pub fn speed(&self) -> f32 {
        self.speed
    }
    pub fn set_speed(&mut self, speed: f32) {
        self.speed = speed.clamp(0.1, 10.0);
    }
    pub fn buffered_frames(&self) -> usize {
        self.buffered.len()
    }

    pub fn start(&mut self) {
        if self.state == PlaybackState::Stopped {
            self.state = PlaybackState::Connecting;
        }
    }

    pub fn stop(&mut self) {
        self.state = PlaybackState::Stopped;
        self.tasks.clear();
        self.active = None;
        self.settle = None;
        self.buffered.clear();
        self.read_offset = 0;
        self.end_of_stream = false;
        self.channels_paused = false;
        self.time = 0.0;
    }

    /// Queues a scrub. A task of a kind already queued or running is refused, and so is a
    /// blocking scrub while a skip is still in flight. Refusals report failure right away.
    pub fn request(&mut self, task: ScrubTask, world: &mut dyn ReplayWorld) -> bool {
        let in_flight: Vec<ScrubTask> = self.active.iter().chain(&self.tasks).copied().collect();
        let duplicate = in_flight.iter().any(|t| t.same_kind(&task));
        let blocked = task.is_blocking() && in_flight.iter().any(|t| !t.is_blocking());
        if duplicate || blocked {
            debug!(task = task.as_ref(), "scrub request refused");
            world.goto_time_finished(false);
            return false;
        }
        self.tasks.push_back(task);
        true
    }

    pub fn goto_time(&mut self, time: f32, world: &mut dyn ReplayWorld) -> bool {
        self.request(ScrubTask::GotoTime(time), world)
    }
    pub fn skip_time(&mut self, seconds: f32, world: &mut dyn ReplayWorld) -> bool {
        self.request(ScrubTask::SkipTime(seconds), world)
    }
    pub fn jump_to_live_edge(&mut self, world: &mut dyn ReplayWorld) -> bool {
        self.request(ScrubTask::JumpToLiveEdge, world)
    }

    /// Advances playback by `delta` seconds of wall time. Corruption stops playback and is
    /// returned, running out of data is not an error.
    #[instrument(skip_all, fields(state = self.state.as_ref()))]
    pub fn tick(&mut self, delta: f32, world: &mut dyn ReplayWorld) -> Result<()> {
        let result = self.tick_inner(delta, world);
        if let Err(err) = &result {
            error!("replay playback stopped: {err:#}");
            self.state = PlaybackState::Stopped;
            self.tasks.clear();
            self.active = None;
            self.settle = None;
        }
        result
    }

    fn tick_inner(&mut self, delta: f32, world: &mut dyn ReplayWorld) -> Result<()> {
        match self.state {
            PlaybackState::Stopped => return Ok(()),
            PlaybackState::Connecting => {
                let Some(header) = self.streamer.header() else {
                    // nothing written yet
                    return Ok(());
                };
                info!(map = %header.map_name, changelist = header.changelist, "replay connected");
                self.checksums = header.flags.contains(ReplayFlags::HAS_CHECKSUMS);
                self.header = Some(header);
                self.state = PlaybackState::Playing;
                self.time = 0.0;
            }
            _ => {}
        }

        let mut seeked = false;
        if self.active.is_none()
            && let Some(task) = self.tasks.pop_front()
        {
            self.active = Some(task);
            self.run_task(task, world)?;
            seeked = matches!(task, ScrubTask::GotoTime(_) | ScrubTask::JumpToLiveEdge);
        }

        // a seek lands exactly on its target
        if !seeked && self.state == PlaybackState::Playing && self.settle.is_none() && !self.channels_paused {
            self.time += delta * self.speed;
        }
        self.fill_buffer()?;
        self.apply_due_frames(world);

        if self.state == PlaybackState::FastForwarding {
            self.finish_settle(world);
            self.state = PlaybackState::Playing;
            self.active = None;
        }
        self.check_end_of_stream(world);
        Ok(())
    }

    fn run_task(&mut self, task: ScrubTask, world: &mut dyn ReplayWorld) -> Result<()> {
        match task {
            ScrubTask::GotoTime(time) => {
                self.goto_time_now(time, world)?;
                self.active = None;
            }
            ScrubTask::JumpToLiveEdge => {
                let edge = self.total_time();
                self.goto_time_now(edge, world)?;
                self.active = None;
            }
            ScrubTask::SkipTime(seconds) => {
                // frames up to the new time are applied by this tick, settling afterwards
                self.state = PlaybackState::FastForwarding;
                self.settle = Some(Settle::default());
                self.time = (self.time + seconds).clamp(0.0, self.latest_time());
            }
        }
        Ok(())
    }

    fn latest_time(&self) -> f32 {
        (self.total_time() - END_EPSILON).max(0.0)
    }

    /// Loads the closest checkpoint at or before `target` and replays the frames after it with
    /// notifies and destruction held back until the last one. On failure the clock stays where it was.
    fn goto_time_now(&mut self, target: f32, world: &mut dyn ReplayWorld) -> Result<()> {
        let previous = self.time;
        let target = target.clamp(0.0, self.latest_time());
        self.state = PlaybackState::Scrubbing;
        match self.scrub_to(target, world) {
            Ok(()) => {
                self.time = target;
                self.finish_settle(world);
                self.state = PlaybackState::Playing;
                world.goto_time_finished(true);
                Ok(())
            }
            Err(ReplayError::Corrupt(msg)) => {
                self.time = previous;
                self.settle = None;
                world.goto_time_finished(false);
                Err(ReplayError::Corrupt(msg).into())
            }
            Err(err) => {
                warn!(target, "goto time failed: {err}");
                self.time = previous;
                self.settle = None;
                self.state = PlaybackState::Playing;
                world.goto_time_finished(false);
                Ok(())
            }
        }
    }

    fn scrub_to(&mut self, target: f32, world: &mut dyn ReplayWorld) -> Result<(), ReplayError> {
        let target_ms = to_ms(target);
        let checkpoint = self.streamer.checkpoints().into_iter().enumerate().filter(|(_, c)| c.time_ms <= target_ms).max_by_key(|(_, c)| c.time_ms);

        self.settle = Some(Settle::default());
        let checkpoint_time = match checkpoint {
            Some((index, info)) => {
                let data = self.streamer.load_checkpoint(index)?;
                let checkpoint = read_checkpoint(&data, self.checksums)?;
                debug!(index, time_ms = info.time_ms, entries = checkpoint.cache.len(), "loading checkpoint");
                self.cache = checkpoint.object_cache();
                world.load_checkpoint(&self.cache, &checkpoint.field_exports);
                self.apply_frame(&checkpoint.frame, world);
                self.read_offset = info.data_offset as usize;
                Some(checkpoint.frame.time)
            }
            None => {
                self.cache = ObjectReferenceCache::new();
                world.load_checkpoint(&self.cache, &FieldExportBlob::default());
                self.read_offset = 0;
                None
            }
        };
        self.buffered.clear();
        self.end_of_stream = false;
        if self.channels_paused {
            self.channels_paused = false;
            world.pause_channels(false);
        }

        loop {
            let frame = match self.read_next()? {
                Some(frame) => frame,
                None => break,
            };
            if checkpoint_time.is_some_and(|t| frame.time <= t) {
                continue;
            }
            if frame.time > target {
                self.buffered.push_back(frame);
                break;
            }
            self.apply_frame(&frame, world);
        }
        Ok(())
    }

    /// Reads one frame at the read offset. `None` when no more data is there for now.
    fn read_next(&mut self) -> Result<Option<ReplayFrame>, ReplayError> {
        let live = self.streamer.is_live();
        let checksums = self.checksums;
        let mut offset = self.read_offset;
        let read = self.streamer.with_data(|data| read_frame(data, &mut offset, checksums, live));
        match read {
            Ok(FrameRead::Frame(frame)) => {
                self.read_offset = offset;
                self.end_of_stream = false;
                Ok(Some(frame))
            }
            Ok(FrameRead::EndOfStream) => {
                self.end_of_stream = true;
                Ok(None)
            }
            Err(ReplayError::NotYetAvailable) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Reads ahead until the lookahead window past the clock is covered
    fn fill_buffer(&mut self) -> Result<()> {
        let horizon = self.time + self.settings.lookahead.as_secs_f32();
        while self.buffered.back().is_none_or(|f| f.time <= horizon) {
            match self.read_next()? {
                Some(frame) => self.buffered.push_back(frame),
                None => break,
            }
        }
        Ok(())
    }

    fn apply_due_frames(&mut self, world: &mut dyn ReplayWorld) {
        while self.buffered.front().is_some_and(|f| f.time <= self.time) {
            if let Some(frame) = self.buffered.pop_front() {
                self.apply_frame(&frame, world);
            }
        }
    }

    fn apply_frame(&mut self, frame: &ReplayFrame, world: &mut dyn ReplayWorld) {
        let effects = world.apply_frame(frame);
        for entry in effects.exported {
            self.cache.insert(entry);
        }
        match &mut self.settle {
            Some(settle) => {
                settle.notifies.extend(effects.notifies);
                settle.destroyed.extend(effects.destroyed);
            }
            None => {
                if !effects.notifies.is_empty() {
                    world.call_rep_notifies(&effects.notifies);
                }
                if !effects.destroyed.is_empty() {
                    world.destroy_actors(&effects.destroyed);
                }
            }
        }
    }

    fn finish_settle(&mut self, world: &mut dyn ReplayWorld) {
        let Some(settle) = self.settle.take() else {
            return;
        };
        if !settle.destroyed.is_empty() {
            let destroyed: Vec<Guid> = settle.destroyed.into_iter().collect();
            world.destroy_actors(&destroyed);
        }
        if !settle.notifies.is_empty() {
            let notifies: Vec<RepNotify> = settle.notifies.into_iter().collect();
            world.call_rep_notifies(&notifies);
        }
    }

    /// A finished stream pauses once everything was played, a live one keeps polling
    fn check_end_of_stream(&mut self, world: &mut dyn ReplayWorld) {
        let drained = self.buffered.is_empty() && self.end_of_stream && !self.streamer.is_live();
        if drained && !self.channels_paused {
            info!(time = self.time, "end of replay reached");
            self.channels_paused = true;
            self.time = self.time.min(self.total_time());
            world.pause_channels(true);
        } else if !drained && self.channels_paused {
            self.channels_paused = false;
            world.pause_channels(false);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::replay_recorder::{ReplayRecorder, ReplicationSource};
    use crate::replay_streamer::{CheckpointInfo, MemoryStreamer, SharedStreamer};
    use pretty_assertions::assert_eq;

    /// Packets are `[actor, value]`, value 0 destroys the actor
    #[derive(Default)]
    struct World {
        applied: Vec<f32>,
        notified: Vec<Vec<RepNotify>>,
        destroyed: Vec<Vec<Guid>>,
        checkpoints_loaded: usize,
        finished: Vec<bool>,
        paused: bool,
    }
    impl ReplayWorld for World {
        fn load_checkpoint(&mut self, _cache: &ObjectReferenceCache, _field_exports: &FieldExportBlob) {
            self.checkpoints_loaded += 1;
            self.applied.clear();
        }
        fn apply_frame(&mut self, frame: &ReplayFrame) -> FrameEffects {
            self.applied.push(frame.time);
            let mut effects = FrameEffects::default();
            for packet in &frame.packets {
                let actor = Guid::from_u128(packet[0] as u128);
                if packet[1] == 0 {
                    effects.destroyed.push(actor);
                } else {
                    effects.notifies.push(RepNotify { actor, property: "Health".into() });
                }
            }
            effects
        }
        fn call_rep_notifies(&mut self, notifies: &[RepNotify]) {
            self.notified.push(notifies.to_vec());
        }
        fn destroy_actors(&mut self, actors: &[Guid]) {
            self.destroyed.push(actors.to_vec());
        }
        fn goto_time_finished(&mut self, success: bool) {
            self.finished.push(success);
        }
        fn pause_channels(&mut self, paused: bool) {
            self.paused = paused;
        }
    }

    struct NoActors(ObjectReferenceCache);
    impl ReplicationSource for NoActors {
        fn checkpoint_actors(&mut self) -> Vec<Guid> {
            vec![]
        }
        fn serialize_actor(&mut self, _actor: Guid) -> Option<Vec<u8>> {
            None
        }
        fn object_cache(&self) -> &ObjectReferenceCache {
            &self.0
        }
        fn field_exports(&self) -> FieldExportBlob {
            FieldExportBlob::default()
        }
    }

    /// 100 seconds, one frame per second, checkpoints at 0, 30, 60 and 90
    fn recording() -> Result<MemoryStreamer> {
        let mut recorder = ReplayRecorder::new(MemoryStreamer::new(), ReplayHeader::default(), ReplaySettings::default())?;
        let mut source = NoActors(ObjectReferenceCache::new());
        for second in 0..=100u32 {
            let time = second as f32;
            recorder.tick(time, &mut source)?;
            let mut frame = ReplayFrame::new(time);
            frame.packets.push(vec![(second % 3) as u8 + 1, if second == 64 { 0 } else { 1 }]);
            recorder.write_frame(&frame)?;
        }
        recorder.finalize(&mut source)
    }

    fn connected(streamer: MemoryStreamer, world: &mut World) -> Result<PlaybackController<MemoryStreamer>> {
        let mut playback = PlaybackController::new(streamer, ReplaySettings::default());
        playback.start();
        playback.tick(0.0, world)?;
        assert_eq!(playback.state(), PlaybackState::Playing);
        Ok(playback)
    }

    #[test]
    fn test_goto_time_uses_nearest_checkpoint() -> Result<()> {
        let mut world = World::default();
        let mut playback = connected(recording()?, &mut world)?;
        assert_eq!(playback.total_time(), 100.0);

        assert!(playback.goto_time(65.0, &mut world));
        playback.tick(0.0, &mut world)?;
        assert_eq!(world.finished, vec![true]);
        assert_eq!(playback.time(), 65.0);
        // the checkpoint frame at 60 is empty, then (60, 65] is replayed
        assert_eq!(world.applied, vec![60.0, 61.0, 62.0, 63.0, 64.0, 65.0]);
        // held back effects arrive once, destruction first
        assert_eq!(world.destroyed.last(), Some(&vec![Guid::from_u128(2)]));
        let notified = world.notified.last().unwrap();
        assert_eq!(notified.len(), 3);

        assert!(playback.goto_time(150.0, &mut world));
        playback.tick(0.0, &mut world)?;
        assert!(playback.time() > 99.9 && playback.time() < 100.0);
        assert_eq!(world.applied.first(), Some(&90.0));
        Ok(())
    }

    #[test]
    fn test_seek_tick_does_not_advance_the_clock() -> Result<()> {
        let mut world = World::default();
        let mut playback = connected(recording()?, &mut world)?;
        assert!(playback.goto_time(65.0, &mut world));
        playback.tick(1.0, &mut world)?;
        assert_eq!(playback.time(), 65.0);
        assert_eq!(world.applied.last(), Some(&65.0));
        playback.tick(1.0, &mut world)?;
        assert_eq!(playback.time(), 66.0);
        Ok(())
    }

    #[test]
    fn test_failed_goto_rolls_back_the_clock() -> Result<()> {
        struct Missing(MemoryStreamer);
        impl ReplayStreamer for Missing {
            fn header(&self) -> Option<ReplayHeader> {
                self.0.header()
            }
            fn write_header(&mut self, header: &ReplayHeader) -> Result<()> {
                self.0.write_header(header)
            }
            fn with_data<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
                self.0.with_data(f)
            }
            fn append_data(&mut self, bytes: &[u8]) -> Result<()> {
                self.0.append_data(bytes)
            }
            fn checkpoints(&self) -> Vec<CheckpointInfo> {
                self.0.checkpoints()
            }
            fn load_checkpoint(&self, _index: usize) -> Result<Vec<u8>, ReplayError> {
                Err(ReplayError::NotYetAvailable)
            }
            fn append_checkpoint(&mut self, time_ms: u32, bytes: &[u8]) -> Result<()> {
                self.0.append_checkpoint(time_ms, bytes)
            }
            fn total_time_ms(&self) -> u32 {
                self.0.total_time_ms()
            }
            fn set_total_time_ms(&mut self, time_ms: u32) {
                self.0.set_total_time_ms(time_ms)
            }
            fn is_live(&self) -> bool {
                self.0.is_live()
            }
            fn finalize(&mut self) -> Result<()> {
                self.0.finalize()
            }
        }

        let mut world = World::default();
        let mut playback = PlaybackController::new(Missing(recording()?), ReplaySettings::default());
        playback.start();
        playback.tick(0.0, &mut world)?;
        playback.tick(12.5, &mut world)?;
        assert_eq!(playback.time(), 12.5);

        assert!(playback.goto_time(65.0, &mut world));
        playback.tick(0.0, &mut world)?;
        assert_eq!(world.finished, vec![false]);
        assert_eq!(playback.time(), 12.5);
        assert_eq!(playback.state(), PlaybackState::Playing);
        Ok(())
    }

    #[test]
    fn test_duplicate_requests_are_refused() -> Result<()> {
        let mut world = World::default();
        let mut playback = connected(recording()?, &mut world)?;
        assert!(playback.skip_time(5.0, &mut world));
        assert!(!playback.skip_time(5.0, &mut world));
        // a blocking scrub has to wait for the skip
        assert!(!playback.goto_time(10.0, &mut world));
        assert_eq!(world.finished, vec![false, false]);

        playback.tick(0.0, &mut world)?;
        assert_eq!(playback.time(), 5.0);
        assert_eq!(playback.state(), PlaybackState::Playing);
        assert_eq!(world.checkpoints_loaded, 0);
        assert!(playback.goto_time(10.0, &mut world));
        assert!(!playback.goto_time(20.0, &mut world));
        Ok(())
    }

    #[test]
    fn test_skip_settles_notifies_once() -> Result<()> {
        let mut world = World::default();
        let mut playback = connected(recording()?, &mut world)?;
        let before = world.notified.len();
        playback.skip_time(6.0, &mut world);
        playback.tick(0.0, &mut world)?;
        assert_eq!(world.notified.len(), before + 1);
        assert_eq!(world.applied.last(), Some(&6.0));
        Ok(())
    }

    #[test]
    fn test_playback_pauses_at_end_of_finished_stream() -> Result<()> {
        let mut world = World::default();
        let mut playback = connected(recording()?, &mut world)?;
        for _ in 0..30 {
            playback.tick(4.0, &mut world)?;
            assert!(playback.buffered_frames() <= 7);
        }
        assert!(playback.is_paused_at_end());
        assert!(world.paused);
        assert_eq!(playback.time(), 100.0);
        assert_eq!(world.applied.len(), 101);
        Ok(())
    }

    #[test]
    fn test_live_stream_keeps_polling() -> Result<()> {
        let shared = SharedStreamer::new();
        let mut recorder = ReplayRecorder::new(shared.clone(), ReplayHeader::default(), ReplaySettings::default())?;
        recorder.write_frame(&ReplayFrame::new(0.0))?;
        recorder.write_frame(&ReplayFrame::new(1.0))?;

        let mut world = World::default();
        let mut playback = PlaybackController::new(shared, ReplaySettings::default());
        playback.start();
        playback.tick(0.0, &mut world)?;
        playback.tick(5.0, &mut world)?;
        assert!(!playback.is_paused_at_end());
        assert_eq!(world.applied.len(), 2);

        recorder.write_frame(&ReplayFrame::new(2.0))?;
        playback.tick(0.5, &mut world)?;
        assert_eq!(world.applied.len(), 3);
        Ok(())
    }

    #[test]
    fn test_corruption_stops_playback() -> Result<()> {
        let mut streamer = MemoryStreamer::new();
        let mut header = ReplayHeader::default();
        header.flags |= ReplayFlags::HAS_CHECKSUMS;
        streamer.write_header(&header)?;
        let mut data = vec![];
        write_frame(&mut data, &ReplayFrame::new(0.0), true)?;
        let last = data.len() - 1;
        data[last] ^= 0xff;
        streamer.append_data(&data)?;
        streamer.finalize()?;

        let mut world = World::default();
        let mut playback = PlaybackController::new(streamer, ReplaySettings::default());
        playback.start();
        assert!(playback.tick(0.0, &mut world).is_err());
        assert_eq!(playback.state(), PlaybackState::Stopped);
        Ok(())
    }
}
