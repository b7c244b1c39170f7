use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use indexmap::IndexSet;
use tracing::{instrument, warn};

use crate::error::CookError;
use crate::repository::{AssetRepository, DependencyKind};
use crate::AssetId;

/// Direct dependencies of `asset`. An absent asset is a warning and yields nothing, unless
/// `strict` is set, in which case it is a `CookError::NotFound`.
pub fn direct_dependencies(repo: &dyn AssetRepository, asset: AssetId, kind: DependencyKind, strict: bool) -> Result<IndexSet<AssetId>> {
    match repo.dependencies(asset, kind) {
        Some(deps) => Ok(deps.into_iter().collect()),
        None if strict => Err(CookError::NotFound(repo.names().name(asset).to_string()).into()),
        None => {
            warn!(asset = repo.names().name(asset), "asset not found while gathering dependencies");
            Ok(IndexSet::new())
        }
    }
}

/// Memoized transitive closure over hard and soft edges.
///
/// Returned sets are shared, a caller may hold one across a `clear`.
#[derive(Debug, Default)]
pub struct DependencyMemo {
    memo: HashMap<AssetId, Arc<IndexSet<AssetId>>>,
    traversals: usize,
}
impl DependencyMemo {
    pub fn new() -> Self {
        Self::default()
    }

    /// `asset` followed by everything it transitively depends on in breadth first order.
    /// Script packages are left out and never expanded.
    #[instrument(skip_all)]
    pub fn transitive(&mut self, repo: &dyn AssetRepository, asset: AssetId) -> Arc<IndexSet<AssetId>> {
        if let Some(deps) = self.memo.get(&asset) {
            return deps.clone();
        }
        self.traversals += 1;

        let mut result = IndexSet::new();
        let mut queue = VecDeque::from([asset]);
        result.insert(asset);
        while let Some(next) = queue.pop_front() {
            let Some(deps) = repo.dependencies(next, DependencyKind::All) else {
                if next == asset {
                    warn!(asset = repo.names().name(asset), "asset not found while gathering dependencies");
                }
                continue;
            };
            for dep in deps {
                if repo.is_script_package(dep) {
                    continue;
                }
                if result.insert(dep) {
                    queue.push_back(dep);
                }
            }
        }

        let result = Arc::new(result);
        self.memo.insert(asset, result.clone());
        result
    }

    pub fn clear(&mut self) {
        self.memo.clear();
    }

    /// Number of closures actually computed, memo hits excluded
    pub fn traversals(&self) -> usize {
        self.traversals
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::project::{AssetDescription, ProjectDescription, ProjectRepository};
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn repo(assets: Vec<AssetDescription>) -> ProjectRepository {
        ProjectRepository::new(ProjectDescription { assets, ..Default::default() }, Path::new(".")).unwrap()
    }

    #[test]
    fn test_cycle_terminates_and_memoizes() {
        let repo = repo(vec![AssetDescription::new("/Game/A").hard(&["/Game/B"]), AssetDescription::new("/Game/B").soft(&["/Game/A"])]);
        let a = repo.resolve("/Game/A").unwrap();
        let b = repo.resolve("/Game/B").unwrap();
        let mut memo = DependencyMemo::new();
        let first = memo.transitive(&repo, a);
        assert_eq!(first.iter().copied().collect::<Vec<_>>(), vec![a, b]);
        let second = memo.transitive(&repo, a);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(memo.traversals(), 1);
        memo.clear();
        memo.transitive(&repo, a);
        assert_eq!(memo.traversals(), 2);
    }

    #[test]
    fn test_script_packages_skipped() {
        let repo = repo(vec![
            AssetDescription::new("/Game/A").hard(&["/Script/Engine", "/Game/B"]),
            AssetDescription::new("/Game/B").hard(&["/Game/C"]),
            AssetDescription::new("/Game/C"),
        ]);
        let names = |ids: &IndexSet<AssetId>| ids.iter().map(|id| repo.names().name(*id).to_string()).collect::<Vec<_>>();
        let mut memo = DependencyMemo::new();
        let a = repo.resolve("/Game/A").unwrap();
        assert_eq!(names(&memo.transitive(&repo, a)), vec!["/Game/A", "/Game/B", "/Game/C"]);
    }

    #[test]
    fn test_strict_missing_asset() {
        let repo = repo(vec![AssetDescription::new("/Game/A").hard(&["/Game/Missing"])]);
        let missing = repo.resolve("/Game/Missing").unwrap();
        assert!(direct_dependencies(&repo, missing, DependencyKind::All, false).unwrap().is_empty());
        let err = direct_dependencies(&repo, missing, DependencyKind::All, true).unwrap_err();
        assert!(matches!(err.downcast_ref::<CookError>(), Some(CookError::NotFound(_))));
    }
}
