use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::ChunkId;
use crate::fingerprint::EnvironmentFingerprint;

/// `Metadata/ChunkManifest.json` of one platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkManifestFile {
    pub platform: String,
    pub fingerprint: EnvironmentFingerprint,
    pub chunks: BTreeMap<ChunkId, Vec<ChunkEntry>>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub package: String,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub package_id: [u8; 8],
    pub path: String,
}

/// Work handed to a worker process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponseFile {
    pub worker: usize,
    pub platforms: Vec<String>,
    pub packages: Vec<String>,
}

/// What a worker process writes back when it is done
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Package to the platforms it was cooked for, platforms missing from the list failed
    pub cooked: BTreeMap<String, Vec<String>>,
    /// Packages not cooked for any platform
    pub failed: Vec<String>,
    /// Dependencies the worker needed that were not part of its slice
    pub discovered: Vec<String>,
}
