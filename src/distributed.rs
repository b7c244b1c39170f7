use std::collections::HashSet;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use anyhow::{Context as _, Result};
use fs_err as fs;
use tracing::{error, info, instrument, warn};

use crate::dependency_graph::direct_dependencies;
use crate::error::CookError;
use crate::manifest::{WorkerReport, WorkerResponseFile};
use crate::repository::{AssetRepository, DependencyKind};
use crate::scheduler::Cooker;
use crate::{AssetId, PlatformSet};

/// Queue order with dependencies pulled forward: each asset is followed by its not yet included
/// direct dependencies, repeated until the list stops growing
#[instrument(skip_all)]
pub fn expand_dependencies(repo: &dyn AssetRepository, order: &[AssetId]) -> Result<Vec<AssetId>> {
    let mut included = HashSet::new();
    let mut list: Vec<AssetId> = order.iter().copied().filter(|a| included.insert(*a)).collect();
    loop {
        let mut next = Vec::with_capacity(list.len());
        for asset in &list {
            next.push(*asset);
            for dep in direct_dependencies(repo, *asset, DependencyKind::All, false)? {
                if repo.contains(dep) && !repo.is_script_package(dep) && included.insert(dep) {
                    next.push(dep);
                }
            }
        }
        if next.len() == list.len() {
            return Ok(next);
        }
        list = next;
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Partition {
    pub local: Vec<AssetId>,
    /// (worker index, slice)
    pub workers: Vec<(usize, Vec<AssetId>)>,
}

/// Splits `order` into `num_workers + 1` contiguous slices, the first kept local. A slice smaller
/// than `min_slice` is not worth a process and folds into the local one.
pub fn partition(order: &[AssetId], num_workers: usize, min_slice: usize) -> Partition {
    let mut result = Partition::default();
    if order.is_empty() {
        return result;
    }
    let size = order.len().div_ceil(num_workers + 1);
    let mut chunks = order.chunks(size);
    result.local = chunks.next().map(<[AssetId]>::to_vec).unwrap_or_default();
    for (index, slice) in chunks.enumerate() {
        if slice.len() < min_slice {
            result.local.extend_from_slice(slice);
        } else {
            result.workers.push((index, slice.to_vec()));
        }
    }
    result
}

/// Transport to one worker. Implementations decide how the slice travels (files, pipes, sockets).
pub trait WorkerHandle {
    fn id(&self) -> usize;
    fn try_send_slice(&mut self, slice: &WorkerResponseFile) -> Result<()>;
    /// `None` while the worker is still busy
    fn poll_result(&mut self) -> Option<Result<WorkerReport>>;
    /// Stop caring about this worker, whatever it already wrote stays
    fn abandon(&mut self);
}

/// Worker running as a child `recook cook` process talking through a response and a report file
pub struct ProcessWorker {
    id: usize,
    exe: PathBuf,
    args: Vec<String>,
    dir: PathBuf,
    child: Option<Child>,
}
impl ProcessWorker {
    /// `args` is the shared part of the command line, the response and report files are appended
    pub fn new(id: usize, exe: PathBuf, args: Vec<String>, dir: PathBuf) -> Self {
        Self { id, exe, args, dir, child: None }
    }
    fn response_path(&self) -> PathBuf {
        self.dir.join(format!("worker_{}_response.json", self.id))
    }
    fn report_path(&self) -> PathBuf {
        self.dir.join(format!("worker_{}_report.json", self.id))
    }
}
impl WorkerHandle for ProcessWorker {
    fn id(&self) -> usize {
        self.id
    }
    fn try_send_slice(&mut self, slice: &WorkerResponseFile) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.response_path(), serde_json::to_vec_pretty(slice)?)?;
        let report = self.report_path();
        if report.exists() {
            fs::remove_file(&report)?;
        }
        let child = Command::new(&self.exe)
            .args(&self.args)
            .arg("--response-file")
            .arg(self.response_path())
            .arg("--report-file")
            .arg(&report)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning worker {} ({})", self.id, self.exe.display()))?;
        self.child = Some(child);
        Ok(())
    }
    fn poll_result(&mut self) -> Option<Result<WorkerReport>> {
        let child = self.child.as_mut()?;
        let status = match child.try_wait() {
            Ok(None) => return None,
            Ok(Some(status)) => status,
            Err(err) => return Some(Err(err.into())),
        };
        self.child = None;
        if !status.success() {
            return Some(Err(CookError::WorkerProcessFailure {
                worker: self.id,
                reason: format!("exited with {status}"),
            }
            .into()));
        }
        let read = || -> Result<WorkerReport> { Ok(serde_json::from_slice(&fs::read(self.report_path())?)?) };
        Some(read().with_context(|| format!("reading report of worker {}", self.id)))
    }
    fn abandon(&mut self) {
        self.child = None;
    }
}

type WorkFn = Box<dyn FnMut(&WorkerResponseFile) -> Result<WorkerReport> + Send>;

/// Worker that runs its slice inline on the first poll, for tools that cook in one process
pub struct InProcessWorker {
    id: usize,
    work: WorkFn,
    slice: Option<WorkerResponseFile>,
}
impl InProcessWorker {
    pub fn new(id: usize, work: WorkFn) -> Self {
        Self { id, work, slice: None }
    }
}
impl WorkerHandle for InProcessWorker {
    fn id(&self) -> usize {
        self.id
    }
    fn try_send_slice(&mut self, slice: &WorkerResponseFile) -> Result<()> {
        self.slice = Some(slice.clone());
        Ok(())
    }
    fn poll_result(&mut self) -> Option<Result<WorkerReport>> {
        let slice = self.slice.take()?;
        Some((self.work)(&slice))
    }
    fn abandon(&mut self) {
        self.slice = None;
    }
}

/// Worker side of a distributed cook: cooks the packages of `response` and nothing else, then
/// reports what happened. `cooker` is expected to run with `restrict_to_requested`.
#[instrument(skip_all, fields(worker = response.worker))]
pub fn cook_slice<R: AssetRepository>(cooker: &mut Cooker<R>, response: &WorkerResponseFile) -> Result<WorkerReport> {
    let mut slice = vec![];
    let mut report = WorkerReport::default();
    for name in &response.packages {
        match cooker.repo().resolve(name) {
            Some(asset) => slice.push(asset),
            None => report.failed.push(name.clone()),
        }
    }
    if slice.is_empty() {
        return Ok(report);
    }
    cooker.start(&slice)?;
    cooker.run_to_completion()?;

    let platforms = cooker.platforms();
    for (asset, record) in cooker.cooked().iter() {
        let name = cooker.repo().names().name(asset).to_string();
        if record.succeeded.is_empty() {
            report.failed.push(name);
        } else {
            report.cooked.insert(name, record.succeeded.iter().map(|p| platforms.get(p).name.clone()).collect());
        }
    }
    report.discovered = cooker.discovered().iter().map(|a| cooker.repo().names().name(*a).to_string()).collect();
    Ok(report)
}

struct PendingWorker {
    handle: Box<dyn WorkerHandle>,
    slice: Vec<AssetId>,
}

/// Fans the queue of a cook out to workers and folds their results back in
#[derive(Default)]
pub struct DistributedCoordinator {
    pending: Vec<PendingWorker>,
    failed_workers: Vec<usize>,
}
impl DistributedCoordinator {
    /// Takes the queued requests of `cooker`, keeps the local slice (and any slice a worker could
    /// not be started for) on the cooker and sends the rest out
    #[instrument(skip_all)]
    pub fn distribute<R, F>(cooker: &mut Cooker<R>, num_workers: usize, min_slice: usize, mut spawn: F) -> Result<Self>
    where
        R: AssetRepository,
        F: FnMut(usize) -> Box<dyn WorkerHandle>,
    {
        let order: Vec<AssetId> = cooker.take_queue().into_iter().map(|r| r.asset).collect();
        let expanded = expand_dependencies(cooker.repo(), &order)?;
        let partition = partition(&expanded, num_workers, min_slice);
        info!(total = expanded.len(), local = partition.local.len(), workers = partition.workers.len(), "distributing cook");

        let mut coordinator = Self::default();
        let platforms: Vec<String> = cooker.platforms().iter().map(|(_, p)| p.name.clone()).collect();
        for asset in &partition.local {
            cooker.request(*asset);
        }
        for (index, slice) in partition.workers {
            let mut handle = spawn(index);
            let response = WorkerResponseFile {
                worker: handle.id(),
                platforms: platforms.clone(),
                packages: slice.iter().map(|a| cooker.repo().names().name(*a).to_string()).collect(),
            };
            match handle.try_send_slice(&response) {
                Ok(()) => {
                    cooker.assign_external(&slice);
                    coordinator.pending.push(PendingWorker { handle, slice });
                }
                Err(err) => {
                    warn!(worker = handle.id(), "could not start worker, cooking its slice locally: {err:#}");
                    for asset in slice {
                        cooker.request(asset);
                    }
                }
            }
        }
        cooker.set_external_pending(coordinator.pending.len());
        Ok(coordinator)
    }

    /// Merges finished workers, returns how many are still running
    pub fn poll<R: AssetRepository>(&mut self, cooker: &mut Cooker<R>) -> usize {
        let mut still_running = vec![];
        for mut worker in self.pending.drain(..) {
            match worker.handle.poll_result() {
                None => still_running.push(worker),
                Some(Ok(report)) => {
                    info!(worker = worker.handle.id(), cooked = report.cooked.len(), failed = report.failed.len(), "worker finished");
                    let resolve = |names: &[String]| names.iter().filter_map(|n| cooker.repo().resolve(n)).collect::<Vec<_>>();
                    let (failed, discovered) = (resolve(&report.failed), resolve(&report.discovered));
                    for (name, platforms) in &report.cooked {
                        let Some(asset) = cooker.repo().resolve(name) else {
                            warn!(worker = worker.handle.id(), "worker cooked unknown package {name}");
                            continue;
                        };
                        let succeeded = PlatformSet::from_iter(platforms.iter().filter_map(|p| cooker.platforms().find(p)));
                        cooker.record_external(asset, succeeded);
                    }
                    for asset in failed {
                        cooker.record_external(asset, PlatformSet::empty());
                    }
                    for asset in discovered {
                        cooker.request(asset);
                    }
                }
                Some(Err(err)) => {
                    error!("{err:#}");
                    self.failed_workers.push(worker.handle.id());
                    for asset in worker.slice {
                        cooker.record_external(asset, PlatformSet::empty());
                    }
                }
            }
        }
        self.pending = still_running;
        cooker.set_external_pending(self.pending.len());
        self.pending.len()
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
    pub fn failed_workers(&self) -> &[usize] {
        &self.failed_workers
    }

    /// Stops consuming every worker, their sandbox output is left as is
    pub fn abandon<R: AssetRepository>(&mut self, cooker: &mut Cooker<R>) {
        for mut worker in self.pending.drain(..) {
            worker.handle.abandon();
        }
        cooker.set_external_pending(0);
    }
}
