use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;

use anyhow::{Context as _, Result, bail, ensure};
use fs_err as fs;
use indexmap::IndexMap;
use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::context::CookContext;
use crate::fingerprint::EnvironmentFingerprint;
use crate::manifest::{ChunkEntry, ChunkManifestFile};
use crate::repository::AssetRepository;
use crate::{AssetId, AssetNames, ChunkId, UEPathBuf, package_id_from_name};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ChunkNode {
    id: ChunkId,
    parent: Option<ChunkId>,
}
#[derive(Debug, Default, Serialize, Deserialize)]
struct ChunkTreeFile {
    chunks: Vec<ChunkNode>,
}

/// Forest over chunks: an asset in an ancestor chunk is guaranteed present wherever a
/// descendant chunk is installed. Chunks not listed hang directly off chunk 0.
#[derive(Debug, Clone, Default)]
pub struct ChunkDependencyTree {
    parents: BTreeMap<ChunkId, Option<ChunkId>>,
}
impl ChunkDependencyTree {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn load(path: &Path) -> Result<Self> {
        let file: ChunkTreeFile = serde_json::from_slice(&fs::read(path)?).with_context(|| format!("parsing chunk tree {}", path.display()))?;
        let mut tree = Self::new();
        for node in file.chunks {
            tree.set_parent(node.id, node.parent)?;
        }
        Ok(tree)
    }
    /// `None` makes `chunk` a root. Fails if the link would close a loop.
    pub fn set_parent(&mut self, chunk: ChunkId, parent: Option<ChunkId>) -> Result<()> {
        if let Some(parent) = parent {
            ensure!(parent != chunk, "chunk {chunk} cannot be its own parent");
            ensure!(!self.ancestors(parent).contains(&chunk), "chunk {chunk} -> {parent} creates a cycle");
        }
        self.parents.insert(chunk, parent);
        Ok(())
    }
    pub fn parent(&self, chunk: ChunkId) -> Option<ChunkId> {
        match self.parents.get(&chunk) {
            Some(parent) => *parent,
            None if chunk == ChunkId::ALWAYS_PRESENT => None,
            None => Some(ChunkId::ALWAYS_PRESENT),
        }
    }
    /// Nearest first
    pub fn ancestors(&self, chunk: ChunkId) -> Vec<ChunkId> {
        let mut result = vec![];
        let mut next = self.parent(chunk);
        while let Some(parent) = next {
            if result.contains(&parent) {
                break;
            }
            result.push(parent);
            next = self.parent(parent);
        }
        result
    }
    fn depth(&self, chunk: ChunkId) -> usize {
        self.ancestors(chunk).len()
    }
}

/// Record of an asset dropped from a chunk because an ancestor already carries it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMove {
    pub asset: AssetId,
    pub from: ChunkId,
    pub to: ChunkId,
}

/// Chunk assignment of cooked assets for one platform
#[derive(Debug, Default)]
pub struct ChunkManifestBuilder {
    chunks: BTreeMap<ChunkId, IndexMap<AssetId, UEPathBuf>>,
    unassigned: IndexMap<AssetId, UEPathBuf>,
    moves: Vec<ChunkMove>,
    resolved: bool,
}
impl ChunkManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cooked but not yet assigned, ends up in chunk 0 unless assigned later
    pub fn add_unassigned(&mut self, asset: AssetId, path: UEPathBuf) {
        if !self.chunks.values().any(|c| c.contains_key(&asset)) {
            self.unassigned.insert(asset, path);
        }
    }
    pub fn add_to_chunk(&mut self, asset: AssetId, chunk: ChunkId, path: UEPathBuf) {
        self.unassigned.shift_remove(&asset);
        let entries = self.chunks.entry(chunk).or_default();
        if !entries.contains_key(&asset) {
            entries.insert(asset, path);
            self.resolved = false;
        }
    }
    pub fn remove_from_chunk(&mut self, asset: AssetId, chunk: ChunkId) {
        if let Some(entries) = self.chunks.get_mut(&chunk) {
            entries.shift_remove(&asset);
        }
    }
    /// Drops `asset` from every chunk, e.g. content that belongs to a base release
    pub fn remove_everywhere(&mut self, asset: AssetId) {
        self.unassigned.shift_remove(&asset);
        for entries in self.chunks.values_mut() {
            entries.shift_remove(&asset);
        }
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.chunks.keys().copied().collect()
    }
    pub fn chunk_contains(&self, chunk: ChunkId, asset: AssetId) -> bool {
        self.chunks.get(&chunk).is_some_and(|c| c.contains_key(&asset))
    }
    pub fn chunk_assets(&self, chunk: ChunkId) -> Vec<AssetId> {
        self.chunks.get(&chunk).map(|c| c.keys().copied().collect()).unwrap_or_default()
    }
    /// Chunks `asset` currently sits in, ascending
    pub fn chunks_of(&self, asset: AssetId) -> Vec<ChunkId> {
        self.chunks.iter().filter(|(_, c)| c.contains_key(&asset)).map(|(id, _)| *id).collect()
    }
    pub fn moves(&self) -> &[ChunkMove] {
        &self.moves
    }

    /// Puts everything never explicitly assigned into chunk 0
    pub fn assign_unassigned(&mut self) {
        for (asset, path) in std::mem::take(&mut self.unassigned) {
            self.add_to_chunk(asset, ChunkId::ALWAYS_PRESENT, path);
        }
    }

    /// Removes from every chunk the assets already carried by one of its ancestors.
    /// Chunks are visited parents first so an ancestor's set is final before its children look at it.
    #[instrument(skip_all)]
    pub fn resolve_chunk_dependency_graph(&mut self, tree: &ChunkDependencyTree) {
        let order = self.chunks.keys().copied().sorted_by_key(|c| (tree.depth(*c), *c)).collect::<Vec<_>>();
        for chunk in order {
            let ancestors = tree.ancestors(chunk);
            let dupes = self.chunks[&chunk]
                .keys()
                .filter_map(|asset| ancestors.iter().find(|a| self.chunk_contains(**a, *asset)).map(|to| (*asset, *to)))
                .collect::<Vec<_>>();
            for (asset, to) in dupes {
                debug!(?asset, from = chunk.0, to = to.0, "asset already in ancestor chunk");
                self.remove_from_chunk(asset, chunk);
                self.moves.push(ChunkMove { asset, from: chunk, to });
            }
        }
        self.resolved = true;
    }

    /// Verifies no asset of `chunk` also sits in one of its descendants
    pub fn check_chunk_assets_are_not_in_child(&self, tree: &ChunkDependencyTree, chunk: ChunkId) -> Result<()> {
        let Some(entries) = self.chunks.get(&chunk) else {
            return Ok(());
        };
        for descendant in self.chunks.keys().filter(|c| tree.ancestors(**c).contains(&chunk)) {
            for asset in entries.keys() {
                ensure!(!self.chunk_contains(*descendant, *asset), "{asset:?} is in chunk {chunk} and in its descendant chunk {descendant}");
            }
        }
        Ok(())
    }

    /// Explains why `chunk` pulls in one of `candidates`: breadth first from the candidates
    /// (in order) through their referencers until a member of `chunk` is reached. The chain
    /// reads from that member down to the candidate, e.g. `/Game/Map -> /Game/Hero -> /Game/Sword`.
    pub fn find_shortest_reference_chain(&self, repo: &dyn AssetRepository, candidates: &[AssetId], chunk: ChunkId) -> Option<String> {
        let members = self.chunks.get(&chunk)?;
        let mut parent: HashMap<AssetId, Option<AssetId>> = HashMap::new();
        let mut queue = VecDeque::new();
        for candidate in candidates {
            if parent.insert(*candidate, None).is_none() {
                queue.push_back(*candidate);
            }
        }
        while let Some(next) = queue.pop_front() {
            if members.contains_key(&next) {
                let mut chain = vec![next];
                let mut cursor = next;
                while let Some(Some(prev)) = parent.get(&cursor) {
                    chain.push(*prev);
                    cursor = *prev;
                }
                return Some(chain.iter().map(|a| repo.names().name(*a)).join(" -> "));
            }
            for referencer in repo.referencers(next) {
                if let std::collections::hash_map::Entry::Vacant(e) = parent.entry(referencer) {
                    e.insert(Some(next));
                    queue.push_back(referencer);
                }
            }
        }
        None
    }

    /// Explicit chunk requests of every cooked asset, plus the dependencies each one drags
    /// along unless they carry their own request. Startup packages are requested in chunk 0,
    /// anything left over lands there too.
    #[instrument(skip_all)]
    pub fn assign_cooked(&mut self, ctx: &mut CookContext, repo: &dyn AssetRepository, cooked: &IndexMap<AssetId, UEPathBuf>) {
        let startup: HashSet<AssetId> = repo.startup_packages().into_iter().collect();
        for (asset, path) in cooked {
            let mut chunks = repo.requested_chunks(*asset);
            if startup.contains(asset) && !chunks.contains(&ChunkId::ALWAYS_PRESENT) {
                chunks.insert(0, ChunkId::ALWAYS_PRESENT);
            }
            if chunks.is_empty() {
                self.add_unassigned(*asset, path.clone());
                continue;
            }
            for chunk in &chunks {
                self.add_to_chunk(*asset, *chunk, path.clone());
            }
            let deps = ctx.dependencies.transitive(repo, *asset);
            for dep in deps.iter().skip(1) {
                if let Some(dep_path) = cooked.get(dep)
                    && repo.requested_chunks(*dep).is_empty()
                {
                    for chunk in &chunks {
                        self.add_to_chunk(*dep, *chunk, dep_path.clone());
                    }
                }
            }
        }
    }

    /// Finalized manifest. The dependency tree must have been resolved after the last assignment.
    pub fn build_manifest(&self, names: &AssetNames, platform: &str, fingerprint: &EnvironmentFingerprint) -> Result<ChunkManifestFile> {
        if !self.resolved && self.chunks.values().any(|c| !c.is_empty()) {
            bail!("chunk dependency tree must be resolved before manifests for {platform} are saved");
        }
        if !self.unassigned.is_empty() {
            warn!(platform, count = self.unassigned.len(), "unassigned assets left out of manifest");
        }
        let chunks = self
            .chunks
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(id, entries)| {
                let entries = entries
                    .iter()
                    .map(|(asset, path)| {
                        let package = names.name(*asset);
                        ChunkEntry {
                            package: package.to_string(),
                            package_id: package_id_from_name(package).to_le_bytes(),
                            path: path.to_string(),
                        }
                    })
                    .collect();
                (*id, entries)
            })
            .collect();
        Ok(ChunkManifestFile {
            platform: platform.to_string(),
            fingerprint: fingerprint.clone(),
            chunks,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::project::{AssetDescription, ProjectDescription, ProjectRepository};
    use pretty_assertions::assert_eq;

    fn path(name: &str) -> UEPathBuf {
        UEPathBuf::from(format!("Content/{name}.uasset"))
    }

    fn tree() -> ChunkDependencyTree {
        let mut tree = ChunkDependencyTree::new();
        tree.set_parent(ChunkId(1), Some(ChunkId(0))).unwrap();
        tree.set_parent(ChunkId(2), Some(ChunkId(1))).unwrap();
        tree.set_parent(ChunkId(7), None).unwrap();
        tree
    }

    #[test]
    fn test_tree_defaults_and_cycles() {
        let mut tree = tree();
        assert_eq!(tree.ancestors(ChunkId(2)), vec![ChunkId(1), ChunkId(0)]);
        assert_eq!(tree.parent(ChunkId(5)), Some(ChunkId(0)));
        assert_eq!(tree.parent(ChunkId(7)), None);
        assert!(tree.set_parent(ChunkId(0), Some(ChunkId(2))).is_err());
        assert!(tree.set_parent(ChunkId(3), Some(ChunkId(3))).is_err());
    }

    #[test]
    fn test_resolve_removes_ancestor_duplicates() -> Result<()> {
        let (x, y, z) = (AssetId(0), AssetId(1), AssetId(2));
        let tree = tree();
        let mut builder = ChunkManifestBuilder::new();
        // assignment order must not matter
        for (asset, chunk) in [(y, 2), (x, 2), (x, 0), (y, 1), (x, 1), (z, 7), (z, 2)] {
            builder.add_to_chunk(asset, ChunkId(chunk), path("a"));
        }
        builder.resolve_chunk_dependency_graph(&tree);
        assert_eq!(builder.chunks_of(x), vec![ChunkId(0)]);
        assert_eq!(builder.chunks_of(y), vec![ChunkId(1)]);
        // chunk 7 is a separate root so z stays in both
        assert_eq!(builder.chunks_of(z), vec![ChunkId(2), ChunkId(7)]);
        for chunk in builder.chunk_ids() {
            builder.check_chunk_assets_are_not_in_child(&tree, chunk)?;
        }
        assert!(builder.moves().contains(&ChunkMove { asset: x, from: ChunkId(2), to: ChunkId(1) }) || builder.moves().contains(&ChunkMove { asset: x, from: ChunkId(2), to: ChunkId(0) }));
        assert_eq!(builder.moves().len(), 3);
        Ok(())
    }

    #[test]
    fn test_check_detects_duplicate() {
        let tree = tree();
        let mut builder = ChunkManifestBuilder::new();
        builder.add_to_chunk(AssetId(4), ChunkId(0), path("a"));
        builder.add_to_chunk(AssetId(4), ChunkId(2), path("a"));
        assert!(builder.check_chunk_assets_are_not_in_child(&tree, ChunkId(0)).is_err());
        assert!(builder.check_chunk_assets_are_not_in_child(&tree, ChunkId(2)).is_ok());
    }

    #[test]
    fn test_manifest_requires_resolve() -> Result<()> {
        let mut names = AssetNames::new();
        let hero = names.intern("/Game/Hero");
        let mut builder = ChunkManifestBuilder::new();
        let fp = EnvironmentFingerprint::new();
        assert!(builder.build_manifest(&names, "Windows", &fp)?.chunks.is_empty());
        builder.add_unassigned(hero, path("Hero"));
        builder.assign_unassigned();
        assert!(builder.build_manifest(&names, "Windows", &fp).is_err());
        builder.resolve_chunk_dependency_graph(&ChunkDependencyTree::new());
        let manifest = builder.build_manifest(&names, "Windows", &fp)?;
        assert_eq!(manifest.chunks[&ChunkId(0)][0].package, "/Game/Hero");
        Ok(())
    }

    fn project() -> ProjectRepository {
        ProjectRepository::new(
            ProjectDescription {
                assets: vec![
                    AssetDescription::new("/Game/Maps/Arena").class("World").hard(&["/Game/Hero"]).chunks(&[2]),
                    AssetDescription::new("/Game/Hero").hard(&["/Game/Sword", "/Game/Shared"]),
                    AssetDescription::new("/Game/Sword"),
                    AssetDescription::new("/Game/Shared").chunks(&[1]),
                    AssetDescription::new("/Game/Menu").hard(&["/Game/Hero"]).chunks(&[5]),
                    AssetDescription::new("/Game/Loose"),
                ],
                startup_packages: vec!["/Game/Menu".into()],
                ..Default::default()
            },
            Path::new("."),
        )
        .unwrap()
    }

    #[test]
    fn test_assign_cooked_propagates_chunks() {
        let repo = project();
        let id = |n: &str| repo.resolve(n).unwrap();
        let cooked: IndexMap<AssetId, UEPathBuf> = repo.assets().into_iter().map(|a| (a, path(repo.names().name(a)))).collect();
        let mut ctx = CookContext::new();
        let mut builder = ChunkManifestBuilder::new();
        builder.assign_cooked(&mut ctx, &repo, &cooked);
        builder.assign_unassigned();
        builder.resolve_chunk_dependency_graph(&ChunkDependencyTree::new());

        // explicit assignment keeps its own chunk and is not dragged along
        assert_eq!(builder.chunks_of(id("/Game/Shared")), vec![ChunkId(1)]);
        // startup package wins through chunk 0, its dependencies follow it there
        assert_eq!(builder.chunks_of(id("/Game/Menu")), vec![ChunkId(0)]);
        assert_eq!(builder.chunks_of(id("/Game/Hero")), vec![ChunkId(0)]);
        assert_eq!(builder.chunks_of(id("/Game/Maps/Arena")), vec![ChunkId(2)]);
        assert_eq!(builder.chunks_of(id("/Game/Loose")), vec![ChunkId(0)]);
    }

    #[test]
    fn test_shortest_reference_chain() {
        let repo = project();
        let id = |n: &str| repo.resolve(n).unwrap();
        let mut builder = ChunkManifestBuilder::new();
        builder.add_to_chunk(id("/Game/Maps/Arena"), ChunkId(2), path("Arena"));
        assert_eq!(
            builder.find_shortest_reference_chain(&repo, &[id("/Game/Loose"), id("/Game/Sword")], ChunkId(2)).as_deref(),
            Some("/Game/Maps/Arena -> /Game/Hero -> /Game/Sword")
        );
        assert_eq!(builder.find_shortest_reference_chain(&repo, &[id("/Game/Loose")], ChunkId(2)), None);
        assert_eq!(builder.find_shortest_reference_chain(&repo, &[id("/Game/Sword")], ChunkId(9)), None);
    }
}
