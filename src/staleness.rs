use std::collections::{HashMap, HashSet, VecDeque};
use std::time::SystemTime;

use anyhow::Result;
use rayon::prelude::*;
use tracing::{info, instrument, warn};

use crate::context::CookContext;
use crate::fingerprint::EnvironmentFingerprint;
use crate::platform::Platforms;
use crate::repository::{AssetRepository, DependencyKind};
use crate::sandbox::{MetadataFile, Sandbox};
use crate::settings::CookSettings;
use crate::{AssetId, PlatformId, PlatformSet, UEPathBuf};

/// Latest source time of `asset` and everything it hard-depends on, memoized in the context
pub fn dependency_timestamp(ctx: &mut CookContext, repo: &dyn AssetRepository, asset: AssetId) -> SystemTime {
    if let Some(ts) = ctx.dependency_timestamps.get(&asset) {
        return *ts;
    }
    let mut latest = SystemTime::UNIX_EPOCH;
    let mut visited = HashSet::from([asset]);
    let mut queue = VecDeque::from([asset]);
    while let Some(next) = queue.pop_front() {
        // an already resolved asset covers its whole hard closure
        if next != asset
            && let Some(ts) = ctx.dependency_timestamps.get(&next)
        {
            latest = latest.max(*ts);
            continue;
        }
        if let Some(ts) = repo.source_timestamp(next) {
            latest = latest.max(ts);
        }
        for dep in repo.dependencies(next, DependencyKind::Hard).unwrap_or_default() {
            if visited.insert(dep) {
                queue.push_back(dep);
            }
        }
    }
    ctx.dependency_timestamps.insert(asset, latest);
    latest
}

/// An artifact that survived the cleaning pass and counts as already cooked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeptArtifact {
    pub asset: AssetId,
    pub platform: PlatformId,
    pub timestamp: SystemTime,
}

#[derive(Debug, Default)]
pub struct CleanReport {
    pub wiped: PlatformSet,
    pub deleted: usize,
    pub kept: Vec<KeptArtifact>,
}

/// Decides whether a previous artifact can be reused
pub struct StalenessOracle {
    iterative: bool,
    outdated_fingerprints: PlatformSet,
}
impl StalenessOracle {
    pub fn new(iterative: bool) -> Self {
        Self {
            iterative,
            outdated_fingerprints: PlatformSet::empty(),
        }
    }
    pub fn is_iterative(&self) -> bool {
        self.iterative
    }

    /// Compares the current environment with what each platform was last cooked with
    pub fn check_fingerprints(&mut self, ctx: &mut CookContext, settings: &CookSettings, repo: &dyn AssetRepository, sandbox: &Sandbox, platforms: &Platforms) -> Result<()> {
        for (id, platform) in platforms.iter() {
            let current = ctx.fingerprints.entry(id).or_insert_with(|| EnvironmentFingerprint::gather(settings, repo, platform));
            let up_to_date = match sandbox.read_metadata(platform, MetadataFile::CookedFingerprint)? {
                Some(data) => match EnvironmentFingerprint::from_json(&data) {
                    Ok(previous) => current.is_satisfied_by(&previous),
                    Err(err) => {
                        warn!(platform = %platform.name, "unreadable cooked fingerprint: {err:#}");
                        false
                    }
                },
                None => false,
            };
            if up_to_date {
                self.outdated_fingerprints.remove(id);
            } else {
                self.outdated_fingerprints.insert(id);
            }
        }
        Ok(())
    }
    pub fn fingerprint_outdated(&self, platform: PlatformId) -> bool {
        self.outdated_fingerprints.contains(platform)
    }

    pub fn is_stale(&self, ctx: &mut CookContext, repo: &dyn AssetRepository, sandbox: &Sandbox, platforms: &Platforms, asset: AssetId, platform: PlatformId) -> bool {
        if !self.iterative || self.fingerprint_outdated(platform) {
            return true;
        }
        let target = platforms.get(platform);
        let rel = cooked_path(ctx, repo, asset);
        let Some(artifact) = sandbox.artifact_timestamp(target, &rel) else {
            return true;
        };
        artifact < dependency_timestamp(ctx, repo, asset)
    }

    /// Sandbox cleaning before a cook. A full cook wipes every platform. An iterative cook wipes
    /// platforms with an outdated fingerprint and deletes artifacts older than their dependency
    /// timestamp or not belonging to any asset. Everything kept is reported so it can be
    /// treated as cooked.
    #[instrument(skip_all)]
    pub fn clean_sandbox(&mut self, ctx: &mut CookContext, settings: &CookSettings, repo: &dyn AssetRepository, sandbox: &Sandbox, platforms: &Platforms) -> Result<CleanReport> {
        self.check_fingerprints(ctx, settings, repo, sandbox, platforms)?;
        let mut report = CleanReport::default();

        let mut by_path: HashMap<UEPathBuf, (AssetId, SystemTime)> = HashMap::new();
        if self.iterative {
            for asset in repo.assets() {
                let rel = cooked_path(ctx, repo, asset);
                let ts = dependency_timestamp(ctx, repo, asset);
                by_path.insert(rel, (asset, ts));
            }
        }

        for (id, platform) in platforms.iter() {
            if !self.iterative || self.fingerprint_outdated(id) {
                info!(platform = %platform.name, iterative = self.iterative, "wiping sandbox");
                sandbox.wipe_platform(platform)?;
                report.wiped.insert(id);
            } else {
                let artifacts = sandbox.artifacts(platform)?;
                let results = artifacts
                    .par_iter()
                    .map(|rel| -> Result<Option<KeptArtifact>> {
                        let keep = match (by_path.get(rel), sandbox.artifact_timestamp(platform, rel)) {
                            (Some((asset, dep_ts)), Some(ts)) if ts >= *dep_ts => Some(KeptArtifact {
                                asset: *asset,
                                platform: id,
                                timestamp: ts,
                            }),
                            _ => None,
                        };
                        if keep.is_none() {
                            sandbox.delete_artifact(platform, rel)?;
                        }
                        Ok(keep)
                    })
                    .collect::<Result<Vec<_>>>()?;
                for result in results {
                    match result {
                        Some(kept) => report.kept.push(kept),
                        None => report.deleted += 1,
                    }
                }
            }
            let fingerprint = ctx.fingerprints.get(&id).cloned().unwrap_or_default();
            sandbox.write_metadata(platform, MetadataFile::CookedFingerprint, &fingerprint.to_json()?)?;
            self.outdated_fingerprints.remove(id);
        }
        info!(deleted = report.deleted, kept = report.kept.len(), "sandbox cleaned");
        Ok(report)
    }
}

/// Platform relative artifact path of `asset`, cached per run
pub fn cooked_path(ctx: &mut CookContext, repo: &dyn AssetRepository, asset: AssetId) -> UEPathBuf {
    ctx.filenames.entry(asset).or_insert_with(|| Sandbox::cooked_path(repo.names().name(asset), repo.is_map(asset))).clone()
}
