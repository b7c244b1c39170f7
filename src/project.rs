use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context as _, Result, bail};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::repository::{AssetRepository, DependencyKind};
use crate::{AssetId, AssetNames, ChunkId, TargetPlatform};

/// On disk description of a project, what `recook cook --project` reads
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectDescription {
    pub name: String,
    /// Source files are relative to this directory, itself relative to the project file
    pub content_dir: Option<PathBuf>,
    pub assets: Vec<AssetDescription>,
    pub startup_packages: Vec<String>,
    /// file -> section -> key -> value
    pub config: BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetDescription {
    pub name: String,
    pub class: Option<String>,
    pub source: Option<PathBuf>,
    /// Seconds since the unix epoch, overrides the source file time
    pub modified: Option<u64>,
    pub hard: Vec<String>,
    pub soft: Vec<String>,
    pub chunks: Vec<u32>,
    /// Number of polls before platform data is ready
    pub cache_polls: u32,
    /// Bytes held while loaded
    pub size: u64,
    pub fail_load: bool,
    /// Platform names on which serialization fails
    pub fail_save: Vec<String>,
}
impl AssetDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            modified: Some(1),
            size: 1024,
            ..Default::default()
        }
    }
    pub fn class(mut self, class: &str) -> Self {
        self.class = Some(class.into());
        self
    }
    pub fn hard<S: ToString>(mut self, deps: &[S]) -> Self {
        self.hard = deps.iter().map(ToString::to_string).collect();
        self
    }
    pub fn soft<S: ToString>(mut self, deps: &[S]) -> Self {
        self.soft = deps.iter().map(ToString::to_string).collect();
        self
    }
    pub fn chunks(mut self, chunks: &[u32]) -> Self {
        self.chunks = chunks.to_vec();
        self
    }
    pub fn modified(mut self, secs: u64) -> Self {
        self.modified = Some(secs);
        self
    }
    pub fn cache_polls(mut self, polls: u32) -> Self {
        self.cache_polls = polls;
        self
    }
    pub fn fail_load(mut self) -> Self {
        self.fail_load = true;
        self
    }
    pub fn fail_save(mut self, platform: &str) -> Self {
        self.fail_save.push(platform.into());
        self
    }
}

struct ProjectAsset {
    class: Option<String>,
    source: Option<PathBuf>,
    modified: Option<SystemTime>,
    hard: Vec<AssetId>,
    soft: Vec<AssetId>,
    chunks: Vec<ChunkId>,
    cache_polls: u32,
    size: u64,
    fail_load: bool,
    fail_save: Vec<String>,
}

/// `AssetRepository` backed by a project description. Platform data caching is simulated by
/// requiring a number of polls per (asset, platform) before it reports ready.
pub struct ProjectRepository {
    names: AssetNames,
    assets: HashMap<AssetId, ProjectAsset>,
    order: Vec<AssetId>,
    referencers: HashMap<AssetId, Vec<AssetId>>,
    startup: Vec<AssetId>,
    config: BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>,
    loaded: HashSet<AssetId>,
    caching: HashMap<(AssetId, String), u32>,
    gc_count: usize,
}

impl ProjectRepository {
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self> {
        let desc: ProjectDescription = serde_json::from_slice(&fs::read(path)?).with_context(|| format!("parsing project {}", path.display()))?;
        let base = path.parent().unwrap_or(Path::new("."));
        let content = desc.content_dir.as_ref().map(|d| base.join(d)).unwrap_or_else(|| base.to_path_buf());
        Self::new(desc, &content)
    }

    pub fn new(desc: ProjectDescription, content_dir: &Path) -> Result<Self> {
        let mut names = AssetNames::new();
        // intern declared assets first so their ids follow declaration order
        for asset in &desc.assets {
            if names.find(&asset.name).is_some() {
                bail!("asset {:?} declared twice", asset.name);
            }
            names.intern(&asset.name);
        }
        let mut assets = HashMap::new();
        let mut order = vec![];
        let mut referencers: HashMap<AssetId, Vec<AssetId>> = HashMap::new();
        for asset in desc.assets {
            let id = names.intern(&asset.name);
            let hard: Vec<AssetId> = asset.hard.iter().map(|d| names.intern(d)).collect();
            let soft: Vec<AssetId> = asset.soft.iter().map(|d| names.intern(d)).collect();
            for dep in hard.iter().chain(&soft) {
                let refs = referencers.entry(*dep).or_default();
                if !refs.contains(&id) {
                    refs.push(id);
                }
            }
            let source = asset.source.map(|s| content_dir.join(s));
            let modified = match (asset.modified, &source) {
                (Some(secs), _) => Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs)),
                (None, Some(source)) => fs::metadata(source).and_then(|m| m.modified()).ok(),
                (None, None) => None,
            };
            order.push(id);
            assets.insert(
                id,
                ProjectAsset {
                    class: asset.class,
                    source,
                    modified,
                    hard,
                    soft,
                    chunks: asset.chunks.into_iter().map(ChunkId).collect(),
                    cache_polls: asset.cache_polls,
                    size: asset.size,
                    fail_load: asset.fail_load,
                    fail_save: asset.fail_save,
                },
            );
        }
        let startup = desc.startup_packages.iter().map(|s| names.intern(s)).collect();
        Ok(Self {
            names,
            assets,
            order,
            referencers,
            startup,
            config: desc.config,
            loaded: Default::default(),
            caching: Default::default(),
            gc_count: 0,
        })
    }

    pub fn gc_count(&self) -> usize {
        self.gc_count
    }
    pub fn is_loaded(&self, asset: AssetId) -> bool {
        self.loaded.contains(&asset)
    }
    /// Moves the source time of `asset` forward, as an editor save would
    pub fn touch(&mut self, asset: AssetId, secs: u64) {
        if let Some(a) = self.assets.get_mut(&asset) {
            a.modified = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs));
        }
    }
    pub fn set_config(&mut self, file: &str, section: &str, key: &str, value: &str) {
        self.config.entry(file.into()).or_default().entry(section.into()).or_default().insert(key.into(), value.into());
    }
}

impl AssetRepository for ProjectRepository {
    fn names(&self) -> &AssetNames {
        &self.names
    }
    fn contains(&self, asset: AssetId) -> bool {
        self.assets.contains_key(&asset)
    }
    fn assets(&self) -> Vec<AssetId> {
        self.order.clone()
    }
    fn dependencies(&self, asset: AssetId, kind: DependencyKind) -> Option<Vec<AssetId>> {
        let a = self.assets.get(&asset)?;
        Some(match kind {
            DependencyKind::Hard => a.hard.clone(),
            DependencyKind::Soft => a.soft.clone(),
            DependencyKind::All => a.hard.iter().chain(&a.soft).copied().collect(),
        })
    }
    fn referencers(&self, asset: AssetId) -> Vec<AssetId> {
        self.referencers.get(&asset).cloned().unwrap_or_default()
    }
    fn is_map(&self, asset: AssetId) -> bool {
        self.class_name(asset) == Some("World")
    }
    fn class_name(&self, asset: AssetId) -> Option<&str> {
        self.assets.get(&asset)?.class.as_deref()
    }
    fn source_timestamp(&self, asset: AssetId) -> Option<SystemTime> {
        self.assets.get(&asset)?.modified
    }
    fn requested_chunks(&self, asset: AssetId) -> Vec<ChunkId> {
        self.assets.get(&asset).map(|a| a.chunks.clone()).unwrap_or_default()
    }
    fn startup_packages(&self) -> Vec<AssetId> {
        self.startup.clone()
    }
    fn config_value(&self, file: &str, section: &str, key: &str) -> Option<String> {
        self.config.get(file)?.get(section)?.get(key).cloned()
    }

    fn load(&mut self, asset: AssetId) -> Result<()> {
        let Some(a) = self.assets.get(&asset) else {
            bail!("{} is not part of project", self.names.name(asset));
        };
        if a.fail_load {
            bail!("{} failed to load", self.names.name(asset));
        }
        if self.loaded.insert(asset) {
            debug!(asset = self.names.name(asset), "loaded");
        }
        Ok(())
    }
    fn begin_cache_platform_data(&mut self, asset: AssetId, platform: &TargetPlatform) {
        let polls = self.assets.get(&asset).map(|a| a.cache_polls).unwrap_or(0);
        self.caching.entry((asset, platform.name.clone())).or_insert(polls);
    }
    fn poll_platform_data(&mut self, asset: AssetId, platform: &TargetPlatform) -> bool {
        match self.caching.get_mut(&(asset, platform.name.clone())) {
            Some(0) | None => true,
            Some(remaining) => {
                *remaining -= 1;
                *remaining == 0
            }
        }
    }
    fn serialize_for_platform(&mut self, asset: AssetId, platform: &TargetPlatform) -> Result<Vec<u8>> {
        let name = self.names.name(asset).to_string();
        let Some(a) = self.assets.get(&asset) else {
            bail!("{name} is not part of project");
        };
        if !self.loaded.contains(&asset) {
            bail!("{name} must be loaded before it is saved");
        }
        if a.fail_save.iter().any(|p| p.eq_ignore_ascii_case(&platform.name)) {
            bail!("{name} failed to serialize for {}", platform.name);
        }
        let mut data = match &a.source {
            Some(source) => fs::read(source)?,
            None => name.as_bytes().to_vec(),
        };
        if !platform.has_editor_only_data() {
            // editor only payload lives after a NUL in the simulated format
            if let Some(end) = data.iter().position(|b| *b == 0) {
                data.truncate(end);
            }
        }
        self.caching.remove(&(asset, platform.name.clone()));
        Ok(data)
    }
    fn is_waiting_on_cache(&self) -> bool {
        self.caching.values().any(|polls| *polls > 0)
    }
    fn collect_garbage(&mut self) {
        self.gc_count += 1;
        self.loaded.clear();
    }
    fn memory_usage(&self) -> u64 {
        self.loaded.iter().filter_map(|a| self.assets.get(a)).map(|a| a.size).sum()
    }
}
