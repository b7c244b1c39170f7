use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Cook failures that callers may want to tell apart after they went through `anyhow`
#[derive(Debug, Error)]
pub enum CookError {
    #[error("asset {0:?} not found in repository")]
    NotFound(String),
    #[error("platform data for {asset:?} not ready after {retries} retries")]
    StaleInputTimeout { asset: String, retries: u32 },
    #[error("failed to save {asset:?} for {platform}: {reason}")]
    SaveFailure { asset: String, platform: String, reason: String },
    #[error("gave up on {asset:?} after {waited:?} without progress")]
    OnTheFlyTimeout { asset: String, waited: Duration },
    #[error("worker {worker} failed: {reason}")]
    WorkerProcessFailure { worker: usize, reason: String },
    #[error("sandbox root {0:?} is missing and could not be created")]
    MissingSandboxRoot(PathBuf),
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("replay stream corrupt: {0}")]
    Corrupt(String),
    /// More data may arrive later, the producer is still live
    #[error("replay data not yet available")]
    NotYetAvailable,
    #[error("frame at {time}s written after frame at {last}s")]
    OutOfOrderTimestamp { time: f32, last: f32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReplayError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }
}

/// True when `err` (or anything it wraps) is a recoverable "come back later" from a live stream
pub fn is_not_yet_available(err: &anyhow::Error) -> bool {
    err.chain().any(|e| matches!(e.downcast_ref::<ReplayError>(), Some(ReplayError::NotYetAvailable)))
}
