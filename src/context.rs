use std::collections::HashMap;
use std::time::SystemTime;

use crate::dependency_graph::DependencyMemo;
use crate::fingerprint::EnvironmentFingerprint;
use crate::{AssetId, PlatformId, UEPathBuf};

/// Caches that live for exactly one cook run. Nothing here is global so two runs in one
/// process (tests, cook on the fly restarts) never observe each other's state.
#[derive(Debug, Default)]
pub struct CookContext {
    pub dependencies: DependencyMemo,
    pub dependency_timestamps: HashMap<AssetId, SystemTime>,
    pub fingerprints: HashMap<PlatformId, EnvironmentFingerprint>,
    pub filenames: HashMap<AssetId, UEPathBuf>,
}
impl CookContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// An edited asset can change the closure and timestamps of anything referencing it,
    /// so both memos are dropped whole
    pub fn invalidate_memos(&mut self) {
        self.dependencies.clear();
        self.dependency_timestamps.clear();
    }

    pub fn clear(&mut self) {
        self.dependencies.clear();
        self.dependency_timestamps.clear();
        self.fingerprints.clear();
        self.filenames.clear();
    }
}
