use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context as _, Result, bail, ensure};
use bitflags::bitflags;
use indexmap::IndexMap;
use strum::{AsRefStr, EnumString};
use tracing::{error, info, instrument, warn};

use crate::asset_registry::{AssetFlags, AssetRecord, AssetRegistry, cooked_hash};
use crate::chunk_manifest::{ChunkDependencyTree, ChunkManifestBuilder};
use crate::context::CookContext;
use crate::dependency_graph::direct_dependencies;
use crate::error::CookError;
use crate::logging::{Log, debug, log, verbose};
use crate::platform::Platforms;
use crate::repository::{AssetChangeNotifier, AssetChangeReceiver, AssetRepository, DependencyKind, asset_change_channel};
use crate::request_queue::{CookRequest, CookedPackages, RequestQueue};
use crate::sandbox::{MetadataFile, Sandbox, encode_cooked};
use crate::settings::CookSettings;
use crate::staleness::{StalenessOracle, cooked_path};
use crate::{AssetId, PlatformId, PlatformSet, UEPathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
pub enum CookState {
    Idle,
    Initializing,
    Cooking,
    GcPending,
    Finishing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum CookMode {
    #[default]
    ByTheBook,
    OnTheFly,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TickResult: u32 {
        const COOKED_SOMETHING = 1 << 0;
        const QUEUE_EMPTY = 1 << 1;
        const TIME_EXCEEDED = 1 << 2;
        const WAITING_ON_CACHE = 1 << 3;
        const REQUIRES_GC = 1 << 4;
        const COLLECTED_GARBAGE = 1 << 5;
        const FINISHED = 1 << 6;
    }
}

/// Per tick budget: wall clock slice or a package count, whichever runs out first
pub struct CookerTimer {
    start: Instant,
    time_slice: Duration,
    max_packages: u32,
    processed: u32,
}
impl CookerTimer {
    pub fn new(time_slice: Duration, max_packages: u32) -> Self {
        Self {
            start: Instant::now(),
            time_slice,
            max_packages,
            processed: 0,
        }
    }
    pub fn is_time_up(&self) -> bool {
        self.start.elapsed() >= self.time_slice || self.processed >= self.max_packages
    }
    pub fn package_processed(&mut self) {
        self.processed += 1;
    }
}

#[derive(Debug, Clone)]
pub struct CookOptions {
    pub mode: CookMode,
    pub iterative: bool,
    pub compressed: bool,
    /// Missing assets abort the run, used when producing a release registry
    pub strict: bool,
    pub dlc_name: Option<String>,
    /// Lowercase package names shipped by the release a DLC is based on
    pub based_on_release: Option<HashSet<String>>,
    pub chunk_tree: ChunkDependencyTree,
    /// Workers leave manifests and registries to the coordinator
    pub write_metadata: bool,
    /// Dependencies outside the initial requests are reported instead of cooked
    pub restrict_to_requested: bool,
    /// Workers share the coordinator's sandbox and must leave it alone
    pub clean_sandbox: bool,
}
impl Default for CookOptions {
    fn default() -> Self {
        Self {
            mode: CookMode::ByTheBook,
            iterative: false,
            compressed: false,
            strict: false,
            dlc_name: None,
            based_on_release: None,
            chunk_tree: ChunkDependencyTree::new(),
            write_metadata: true,
            restrict_to_requested: false,
            clean_sandbox: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookStats {
    pub requested: usize,
    pub cooked: usize,
    pub up_to_date: usize,
    pub failed: usize,
    pub skipped_release: usize,
    pub gc_count: usize,
    pub ticks: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct GcTracker {
    packages_since_gc: u32,
    last_activity: Option<Instant>,
    full_gc_requested: bool,
    deferred: bool,
}

enum Processed {
    Done { cooked: bool },
    Requeued,
    RequiresGc,
}

/// Answer to a cook on the fly request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnTheFlyResult {
    pub succeeded: PlatformSet,
    pub failed: PlatformSet,
    /// Nothing to cook, a native script package or content the base release already ships
    pub skipped: bool,
    /// Packages cooked as a side effect since the previous request
    pub unsolicited: Vec<String>,
}

/// Drives cooking through an explicit state machine. Each `tick` does a bounded amount of work
/// and returns, any async platform data that is not ready yet is retried on a later tick.
pub struct Cooker<R: AssetRepository> {
    repo: R,
    platforms: Platforms,
    sandbox: Sandbox,
    settings: CookSettings,
    options: CookOptions,
    log: Log,
    ctx: CookContext,
    oracle: StalenessOracle,
    state: CookState,
    queue: RequestQueue,
    cooked: CookedPackages,
    outputs: Vec<IndexMap<AssetId, UEPathBuf>>,
    hashes: HashMap<(AssetId, PlatformId), [u8; 16]>,
    retries: HashMap<AssetId, u32>,
    requested: HashSet<AssetId>,
    discovered: Vec<AssetId>,
    unsolicited: Vec<AssetId>,
    elsewhere: HashSet<AssetId>,
    gc: GcTracker,
    external_pending: usize,
    changes: AssetChangeReceiver,
    notifier: AssetChangeNotifier,
    stats: CookStats,
    started: Option<Instant>,
}

impl<R: AssetRepository> Cooker<R> {
    pub fn new(repo: R, platforms: Platforms, sandbox: Sandbox, settings: CookSettings, options: CookOptions, log: Log) -> Self {
        let (notifier, changes) = asset_change_channel();
        Self {
            outputs: vec![IndexMap::new(); platforms.len()],
            oracle: StalenessOracle::new(options.iterative),
            repo,
            platforms,
            sandbox,
            settings,
            options,
            log,
            ctx: CookContext::new(),
            state: CookState::Idle,
            queue: RequestQueue::new(),
            cooked: CookedPackages::new(),
            hashes: HashMap::new(),
            retries: HashMap::new(),
            requested: HashSet::new(),
            discovered: vec![],
            unsolicited: vec![],
            elsewhere: HashSet::new(),
            gc: GcTracker::default(),
            external_pending: 0,
            changes,
            notifier,
            stats: CookStats::default(),
            started: None,
        }
    }

    pub fn state(&self) -> CookState {
        self.state
    }
    pub fn stats(&self) -> &CookStats {
        &self.stats
    }
    pub fn repo(&self) -> &R {
        &self.repo
    }
    pub fn platforms(&self) -> &Platforms {
        &self.platforms
    }
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }
    pub fn cooked(&self) -> &CookedPackages {
        &self.cooked
    }
    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }
    pub fn change_notifier(&self) -> AssetChangeNotifier {
        self.notifier.clone()
    }
    /// Dependencies a restricted cook needed but left alone
    pub fn discovered(&self) -> &[AssetId] {
        &self.discovered
    }
    /// Assets another process cooks, dependencies found locally leave them alone until
    /// `record_external` reports them
    pub fn assign_external(&mut self, assets: &[AssetId]) {
        self.elsewhere.extend(assets.iter().copied());
    }
    /// Work done elsewhere that must land before manifests are written
    pub fn set_external_pending(&mut self, pending: usize) {
        self.external_pending = pending;
    }

    /// Idle -> Initializing -> Cooking. Cleans the sandbox, then queues `packages` (or every
    /// asset when empty) together with the startup packages for all platforms.
    #[instrument(skip_all)]
    pub fn start(&mut self, packages: &[AssetId]) -> Result<()> {
        ensure!(self.state == CookState::Idle, "cook already running ({})", self.state.as_ref());
        self.state = CookState::Initializing;
        self.started = Some(Instant::now());
        if let Err(err) = self.initialize(packages) {
            self.state = CookState::Idle;
            return Err(err);
        }
        self.state = CookState::Cooking;
        Ok(())
    }

    fn initialize(&mut self, packages: &[AssetId]) -> Result<()> {
        if !self.options.clean_sandbox {
            self.oracle.check_fingerprints(&mut self.ctx, &self.settings, &self.repo, &self.sandbox, &self.platforms)?;
            self.enqueue_initial(packages);
            return Ok(());
        }
        let report = self.oracle.clean_sandbox(&mut self.ctx, &self.settings, &self.repo, &self.sandbox, &self.platforms)?;
        for wiped in report.wiped.iter() {
            verbose!(self.log, "Cleaned sandbox for {}", self.platforms.get(wiped).name);
        }
        for kept in report.kept {
            self.cooked.record_success(kept.asset, kept.platform, kept.timestamp);
            let rel = cooked_path(&mut self.ctx, &self.repo, kept.asset);
            self.outputs[kept.platform.0 as usize].insert(kept.asset, rel);
        }
        if report.deleted > 0 {
            log!(self.log, "Deleted {} out of date cooked packages", report.deleted);
        }

        self.enqueue_initial(packages);
        Ok(())
    }

    fn enqueue_initial(&mut self, packages: &[AssetId]) {
        let all = self.platforms.all();
        if self.options.mode == CookMode::ByTheBook {
            let initial = if packages.is_empty() { self.repo.assets() } else { packages.to_vec() };
            // a worker only cooks its slice, startup packages belong to the coordinator
            let startup = if self.options.restrict_to_requested { vec![] } else { self.repo.startup_packages() };
            for asset in startup.into_iter().chain(initial) {
                self.requested.insert(asset);
                self.enqueue(asset, all, false);
            }
        }
    }

    fn enqueue(&mut self, asset: AssetId, platforms: PlatformSet, urgent: bool) {
        let request = CookRequest { asset, platforms, urgent };
        if self.queue.enqueue_unique(request, urgent) {
            self.stats.requested += 1;
        }
    }

    /// Requeues changed assets and drops everything memoized about the graph
    fn drain_changes(&mut self) {
        let changed = self.changes.drain();
        if changed.is_empty() {
            return;
        }
        self.ctx.invalidate_memos();
        for asset in changed {
            info!(asset = self.repo.names().name(asset), "asset changed, invalidating");
            let had_record = self.cooked.invalidate(asset);
            for output in &mut self.outputs {
                output.shift_remove(&asset);
            }
            if had_record && matches!(self.state, CookState::Cooking | CookState::GcPending) {
                self.enqueue(asset, self.platforms.all(), false);
            }
        }
    }

    /// Does at most one time slice of work
    #[instrument(skip_all, fields(state = self.state.as_ref()))]
    pub fn tick(&mut self) -> Result<TickResult> {
        self.stats.ticks += 1;
        self.drain_changes();
        match self.tick_inner() {
            Ok(result) => Ok(result),
            Err(err) => {
                error!("cook aborted: {err:#}");
                self.queue.clear();
                self.state = CookState::Idle;
                Err(err)
            }
        }
    }

    fn tick_inner(&mut self) -> Result<TickResult> {
        let mut result = TickResult::empty();
        match self.state {
            CookState::Idle | CookState::Initializing => return Ok(TickResult::QUEUE_EMPTY),
            CookState::Finishing => {
                self.finish()?;
                return Ok(TickResult::FINISHED);
            }
            CookState::GcPending => {
                // objects a pending cache is about to use survive one more tick
                if self.repo.is_waiting_on_cache() && !self.gc.deferred {
                    self.gc.deferred = true;
                    return Ok(TickResult::REQUIRES_GC | TickResult::WAITING_ON_CACHE);
                }
                self.collect_garbage();
                result |= TickResult::COLLECTED_GARBAGE;
                self.state = CookState::Cooking;
            }
            CookState::Cooking => {}
        }

        let mut timer = CookerTimer::new(self.settings.time_slice, self.settings.max_packages_per_tick);
        let mut requeued = HashSet::new();
        loop {
            if timer.is_time_up() {
                result |= TickResult::TIME_EXCEEDED;
                break;
            }
            let Some(request) = self.queue.dequeue() else {
                result |= TickResult::QUEUE_EMPTY;
                break;
            };
            if requeued.contains(&request.asset) {
                // everything left is waiting on the cache, give it time
                self.queue.enqueue_unique(request, request.urgent);
                result |= TickResult::WAITING_ON_CACHE;
                break;
            }
            timer.package_processed();
            match self.process_request(request)? {
                Processed::Done { cooked } => {
                    if cooked {
                        result |= TickResult::COOKED_SOMETHING;
                        self.gc.last_activity = Some(Instant::now());
                    }
                }
                Processed::Requeued => {
                    requeued.insert(request.asset);
                }
                Processed::RequiresGc => {
                    result |= TickResult::COOKED_SOMETHING | TickResult::REQUIRES_GC;
                    break;
                }
            }
        }
        self.update_progress();

        if self.needs_gc() {
            self.state = CookState::GcPending;
            self.gc.deferred = false;
            result |= TickResult::REQUIRES_GC;
        } else if self.queue.is_empty() && self.external_pending == 0 && self.options.mode == CookMode::ByTheBook {
            self.state = CookState::Finishing;
        }
        Ok(result)
    }

    fn needs_gc(&mut self) -> bool {
        if self.gc.full_gc_requested {
            return true;
        }
        if self.settings.packages_per_gc > 0 && self.gc.packages_since_gc >= self.settings.packages_per_gc {
            verbose!(self.log, "Collecting after {} packages", self.gc.packages_since_gc);
            return true;
        }
        let memory = self.repo.memory_usage();
        if self.settings.max_memory_allowance_mb > 0 && memory > self.memory_allowance() {
            verbose!(self.log, "Collecting at {} MB used", memory / 1024 / 1024);
            return true;
        }
        if memory > 0
            && let Some(last) = self.gc.last_activity
            && last.elapsed() >= self.settings.idle_time_to_gc
        {
            return true;
        }
        false
    }

    fn memory_allowance(&self) -> u64 {
        self.settings.max_memory_allowance_mb.saturating_mul(1024 * 1024)
    }

    fn collect_garbage(&mut self) {
        self.repo.collect_garbage();
        self.stats.gc_count += 1;
        self.gc = GcTracker::default();
        let memory = self.repo.memory_usage();
        debug!(self.log, "Collected garbage ({} so far), {} MiB in use", self.stats.gc_count, memory / (1024 * 1024));
        if self.settings.max_memory_allowance_mb > 0 && memory > self.memory_allowance() {
            warn!(memory, "memory still above the allowance after collecting");
        }
    }

    fn process_request(&mut self, request: CookRequest) -> Result<Processed> {
        let asset = request.asset;
        let name = self.repo.names().name(asset).to_string();
        let remaining = self.cooked.remaining(asset, request.platforms);
        if remaining.is_empty() {
            return Ok(Processed::Done { cooked: false });
        }
        if self.in_base_release(asset) {
            verbose!(self.log, "{name} ships with the base release, skipping");
            self.stats.skipped_release += 1;
            return Ok(Processed::Done { cooked: false });
        }
        if self.repo.is_script_package(asset) {
            return Ok(Processed::Done { cooked: false });
        }
        if !self.repo.contains(asset) {
            if self.options.strict {
                return Err(CookError::NotFound(name).into());
            }
            warn!(asset = %name, "requested asset not found");
            self.cooked.record_failure(asset, remaining);
            self.stats.failed += 1;
            return Ok(Processed::Done { cooked: false });
        }

        let mut stale = PlatformSet::empty();
        for platform in remaining.iter() {
            if self.oracle.is_stale(&mut self.ctx, &self.repo, &self.sandbox, &self.platforms, asset, platform) {
                stale.insert(platform);
            } else {
                let rel = cooked_path(&mut self.ctx, &self.repo, asset);
                let ts = self.sandbox.artifact_timestamp(self.platforms.get(platform), &rel).unwrap_or_else(SystemTime::now);
                self.cooked.record_success(asset, platform, ts);
                self.outputs[platform.0 as usize].insert(asset, rel);
                self.stats.up_to_date += 1;
            }
        }
        if stale.is_empty() {
            self.enqueue_dependencies(asset, request.platforms)?;
            return Ok(Processed::Done { cooked: false });
        }

        if let Err(err) = self.repo.load(asset) {
            error!(asset = %name, "load failed: {err:#}");
            self.cooked.record_failure(asset, stale);
            self.stats.failed += 1;
            return Ok(Processed::Done { cooked: false });
        }

        let mut ready = true;
        for platform in stale.iter() {
            let target = self.platforms.get(platform);
            self.repo.begin_cache_platform_data(asset, target);
            ready &= self.repo.poll_platform_data(asset, target);
        }
        if !ready {
            let retries = self.retries.entry(asset).or_default();
            *retries += 1;
            if *retries > self.settings.max_cache_retries {
                let err = CookError::StaleInputTimeout { asset: name, retries: *retries - 1 };
                error!("{err}");
                self.retries.remove(&asset);
                self.cooked.record_failure(asset, stale);
                self.stats.failed += 1;
                return Ok(Processed::Done { cooked: false });
            }
            self.queue.enqueue_unique(request, request.urgent);
            return Ok(Processed::Requeued);
        }
        self.retries.remove(&asset);

        let rel = cooked_path(&mut self.ctx, &self.repo, asset);
        let mut saved_any = false;
        for platform in stale.iter() {
            match self.save(asset, platform, &rel) {
                Ok(()) => saved_any = true,
                Err(err) => {
                    error!("{err:#}");
                    self.cooked.record_failure(asset, PlatformSet::single(platform));
                }
            }
        }
        if saved_any {
            self.stats.cooked += 1;
            if !self.requested.contains(&asset) {
                self.unsolicited.push(asset);
            }
            verbose!(self.log, "Cooked {name}");
            if !self.repo.is_map(asset) {
                self.gc.packages_since_gc += 1;
            }
        } else {
            self.stats.failed += 1;
        }
        self.enqueue_dependencies(asset, request.platforms)?;

        let full_gc = self.repo.class_name(asset).is_some_and(|class| self.settings.full_gc_asset_classes.iter().any(|c| c == class));
        if full_gc {
            self.gc.full_gc_requested = true;
            return Ok(Processed::RequiresGc);
        }
        Ok(Processed::Done { cooked: saved_any })
    }

    fn save(&mut self, asset: AssetId, platform: PlatformId, rel: &UEPathBuf) -> Result<()> {
        let target = self.platforms.get(platform);
        let name = self.repo.names().name(asset).to_string();
        let save_failure = |reason: String| CookError::SaveFailure {
            asset: name.clone(),
            platform: target.name.clone(),
            reason,
        };
        let payload = match self.repo.serialize_for_platform(asset, target) {
            Ok(payload) => payload,
            Err(err) => return Err(save_failure(format!("{err:#}")).into()),
        };
        let cooked = encode_cooked(target, self.options.compressed, &payload)?;
        if let Err(err) = self.sandbox.write_artifact(target, rel, &cooked) {
            return Err(save_failure(format!("{err:#}")).into());
        }
        let ts = self.sandbox.artifact_timestamp(target, rel).unwrap_or_else(SystemTime::now);
        self.cooked.record_success(asset, platform, ts);
        let hash = cooked_hash(&cooked);
        tracing::debug!(asset = %name, platform = %target.name, hash = %hex::encode(hash), "saved");
        self.hashes.insert((asset, platform), hash);
        self.outputs[platform.0 as usize].insert(asset, rel.clone());
        Ok(())
    }

    fn in_base_release(&self, asset: AssetId) -> bool {
        self.options
            .based_on_release
            .as_ref()
            .is_some_and(|release| release.contains(&self.repo.names().name(asset).to_ascii_lowercase()))
    }

    /// Cook the closure: every direct dependency is requested for the same platforms
    fn enqueue_dependencies(&mut self, asset: AssetId, platforms: PlatformSet) -> Result<()> {
        for dep in direct_dependencies(&self.repo, asset, DependencyKind::All, self.options.strict)? {
            if self.repo.is_script_package(dep) || self.in_base_release(dep) || self.elsewhere.contains(&dep) {
                continue;
            }
            if self.options.restrict_to_requested && !self.requested.contains(&dep) {
                if !self.discovered.contains(&dep) {
                    self.discovered.push(dep);
                }
                continue;
            }
            if !self.cooked.remaining(dep, platforms).is_empty() {
                self.enqueue(dep, platforms, false);
            }
        }
        Ok(())
    }

    fn update_progress(&self) {
        if let Some(progress) = self.log.progress() {
            let done = (self.stats.cooked + self.stats.up_to_date + self.stats.failed) as u64;
            progress.set_length(done + self.queue.len() as u64);
            progress.set_position(done);
        }
    }

    /// Drains the queue, the next tick writes whatever was cooked so far
    pub fn cancel(&mut self) {
        let dropped = self.queue.clear();
        if !dropped.is_empty() {
            info!(dropped = dropped.len(), "cook cancelled");
        }
        if self.state != CookState::Idle {
            self.state = CookState::Finishing;
        }
    }

    /// Ticks until the run is back to idle
    pub fn run_to_completion(&mut self) -> Result<&CookStats> {
        ensure!(self.options.mode == CookMode::ByTheBook, "only a cook by the book runs to completion");
        while self.state != CookState::Idle {
            self.tick()?;
        }
        Ok(&self.stats)
    }

    /// Serves one cook on the fly request: queued in front and ticked until every requested
    /// platform has a record. Script packages and base release content answer at once as skipped.
    /// No progress for `idle_timeout` gives up with [`CookError::OnTheFlyTimeout`], the run
    /// itself stays usable.
    pub fn cook_on_the_fly(&mut self, name: &str, platforms: PlatformSet, idle_timeout: Duration) -> Result<OnTheFlyResult> {
        ensure!(self.options.mode == CookMode::OnTheFly, "cook on the fly requests need a cook on the fly run");
        if self.state == CookState::Idle {
            self.start(&[])?;
        }
        let Some(asset) = self.repo.resolve(name) else {
            return Err(CookError::NotFound(name.to_string()).into());
        };
        let script = self.repo.is_script_package(asset);
        if script || self.in_base_release(asset) {
            if !script {
                self.stats.skipped_release += 1;
            }
            verbose!(self.log, "{name} has nothing to cook, skipping");
            return Ok(OnTheFlyResult {
                succeeded: PlatformSet::empty(),
                failed: PlatformSet::empty(),
                skipped: true,
                unsolicited: self.take_unsolicited(),
            });
        }
        self.requested.insert(asset);
        self.enqueue(asset, platforms, true);

        let mut last_progress = Instant::now();
        loop {
            let remaining = self.cooked.remaining(asset, platforms);
            if remaining.is_empty() {
                break;
            }
            let result = self.tick()?;
            if result.intersects(TickResult::COOKED_SOMETHING | TickResult::COLLECTED_GARBAGE) {
                last_progress = Instant::now();
            }
            if last_progress.elapsed() >= idle_timeout {
                return Err(CookError::OnTheFlyTimeout {
                    asset: name.to_string(),
                    waited: idle_timeout,
                }
                .into());
            }
            std::thread::yield_now();
        }

        let record = self.cooked.get(asset).context("cooked record vanished")?;
        let succeeded = PlatformSet::from_iter(platforms.iter().filter(|p| record.succeeded.contains(*p)));
        Ok(OnTheFlyResult {
            succeeded,
            failed: platforms.difference(succeeded),
            skipped: false,
            unsolicited: self.take_unsolicited(),
        })
    }

    fn take_unsolicited(&mut self) -> Vec<String> {
        std::mem::take(&mut self.unsolicited).into_iter().map(|a| self.repo.names().name(a).to_string()).collect()
    }

    /// Folds in an asset cooked by someone else. Platforms in `succeeded` whose artifact made it
    /// into the sandbox count as cooked, every other platform of the run as failed.
    pub fn record_external(&mut self, asset: AssetId, succeeded: PlatformSet) {
        self.elsewhere.remove(&asset);
        let rel = cooked_path(&mut self.ctx, &self.repo, asset);
        let mut cooked_any = false;
        for (id, platform) in self.platforms.iter() {
            let ts = if succeeded.contains(id) { self.sandbox.artifact_timestamp(platform, &rel) } else { None };
            match ts {
                Some(ts) => {
                    self.cooked.record_success(asset, id, ts);
                    self.outputs[id.0 as usize].insert(asset, rel.clone());
                    cooked_any = true;
                }
                None => self.cooked.record_failure(asset, PlatformSet::single(id)),
            }
        }
        if cooked_any {
            self.stats.cooked += 1;
        } else {
            self.stats.failed += 1;
        }
    }
    /// Queues work for this process, e.g. dependencies a worker reported back. Assets another
    /// process still owns are left to it, `record_external` settles them.
    pub fn request(&mut self, asset: AssetId) {
        if self.elsewhere.contains(&asset) {
            tracing::debug!(asset = self.repo.names().name(asset), "owned by a worker, not requesting locally");
            return;
        }
        self.requested.insert(asset);
        self.enqueue(asset, self.platforms.all(), false);
        if self.state == CookState::Finishing {
            self.state = CookState::Cooking;
        }
    }
    /// Removes every queued request, handing them to the caller
    pub fn take_queue(&mut self) -> Vec<CookRequest> {
        self.queue.clear()
    }

    #[instrument(skip_all)]
    fn finish(&mut self) -> Result<()> {
        if self.options.write_metadata {
            let platforms: Vec<(PlatformId, String)> = self.platforms.iter().map(|(id, p)| (id, p.name.clone())).collect();
            for (id, name) in platforms {
                self.write_metadata(id).with_context(|| format!("writing metadata for {name}"))?;
            }
        }
        self.stats.elapsed = self.started.map(|s| s.elapsed()).unwrap_or_default();
        let s = &self.stats;
        let what = match &self.options.dlc_name {
            Some(dlc) => format!("Cook of DLC {dlc}"),
            None => "Cook".to_string(),
        };
        log!(
            self.log,
            "{what} finished in {:.2}s: {} requested, {} cooked, {} up to date, {} failed, {} from base release, {} collections",
            s.elapsed.as_secs_f32(),
            s.requested,
            s.cooked,
            s.up_to_date,
            s.failed,
            s.skipped_release,
            s.gc_count
        );
        self.state = CookState::Idle;
        Ok(())
    }

    fn write_metadata(&mut self, platform: PlatformId) -> Result<()> {
        let target = self.platforms.get(platform);
        let mut builder = ChunkManifestBuilder::new();
        let outputs = self.outputs[platform.0 as usize].clone();
        builder.assign_cooked(&mut self.ctx, &self.repo, &outputs);
        builder.assign_unassigned();
        builder.resolve_chunk_dependency_graph(&self.options.chunk_tree);
        for chunk in builder.chunk_ids() {
            if let Err(err) = builder.check_chunk_assets_are_not_in_child(&self.options.chunk_tree, chunk) {
                warn!("{err:#}");
            }
        }
        let fingerprint = self.ctx.fingerprints.get(&platform).cloned().unwrap_or_default();
        let manifest = builder.build_manifest(self.repo.names(), &target.name, &fingerprint)?;
        self.sandbox.write_metadata(target, MetadataFile::ChunkManifest, &serde_json::to_vec_pretty(&manifest)?)?;

        let startup: HashSet<AssetId> = self.repo.startup_packages().into_iter().collect();
        let mut assets = vec![];
        for asset in self.repo.assets() {
            let Some(record) = self.cooked.get(asset) else {
                continue;
            };
            if !record.attempted.contains(platform) {
                continue;
            }
            let mut flags = AssetFlags::empty();
            flags.set(AssetFlags::MAP, self.repo.is_map(asset));
            flags.set(AssetFlags::STARTUP, startup.contains(&asset));
            flags.set(AssetFlags::FAILED, !record.succeeded.contains(platform));
            assets.push(AssetRecord {
                package_name: self.repo.names().name(asset).to_string(),
                class_name: self.repo.class_name(asset).map(str::to_string),
                chunk_ids: builder.chunks_of(asset),
                flags,
                cooked_hash: self.hashes.get(&(asset, platform)).copied(),
            });
        }
        let registry = AssetRegistry {
            fingerprint,
            filter_editor_only_data: !target.has_editor_only_data(),
            assets,
        };
        self.sandbox.write_metadata(target, MetadataFile::AssetRegistry, &registry.to_bytes()?)?;
        Ok(())
    }
}

/// Packages a cook by the book starts from: named maps plus everything under the given
/// directories, or the whole project when both are empty
pub fn requested_packages(repo: &dyn AssetRepository, maps: &[String], dirs: &[String]) -> Result<Vec<AssetId>> {
    let mut packages = vec![];
    for map in maps {
        let Some(asset) = repo.resolve(map) else {
            bail!(CookError::NotFound(map.clone()));
        };
        packages.push(asset);
    }
    for dir in dirs {
        let prefix = format!("{}/", dir.trim_end_matches('/').to_ascii_lowercase());
        packages.extend(repo.assets().into_iter().filter(|a| repo.names().name(*a).to_ascii_lowercase().starts_with(&prefix)));
    }
    Ok(packages)
}
