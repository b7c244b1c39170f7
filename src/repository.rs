use std::sync::mpsc;
use std::time::SystemTime;

use anyhow::Result;
use strum::{AsRefStr, EnumString};

use crate::{AssetId, AssetNames, ChunkId, TargetPlatform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr)]
pub enum DependencyKind {
    Soft,
    Hard,
    All,
}

/// Everything the cooker needs from the asset model. Loading, platform data caching and
/// serialization are owned by the implementor; the cooker only drives and polls them.
pub trait AssetRepository {
    fn names(&self) -> &AssetNames;
    fn resolve(&self, name: &str) -> Option<AssetId> {
        self.names().find(name)
    }
    fn contains(&self, asset: AssetId) -> bool;
    /// Every asset the repository knows about, in a stable order
    fn assets(&self) -> Vec<AssetId>;
    /// `None` when the asset is absent
    fn dependencies(&self, asset: AssetId, kind: DependencyKind) -> Option<Vec<AssetId>>;
    fn referencers(&self, asset: AssetId) -> Vec<AssetId>;
    fn is_script_package(&self, asset: AssetId) -> bool {
        self.names().name(asset).starts_with("/Script/")
    }
    fn is_map(&self, asset: AssetId) -> bool;
    fn class_name(&self, asset: AssetId) -> Option<&str>;
    fn source_timestamp(&self, asset: AssetId) -> Option<SystemTime>;
    fn requested_chunks(&self, asset: AssetId) -> Vec<ChunkId>;
    /// Packages loaded at engine startup, they always ship in the always present chunk
    fn startup_packages(&self) -> Vec<AssetId>;
    /// Value of a `file:section:key` config entry, used for the environment fingerprint
    fn config_value(&self, file: &str, section: &str, key: &str) -> Option<String>;

    fn load(&mut self, asset: AssetId) -> Result<()>;
    fn begin_cache_platform_data(&mut self, asset: AssetId, platform: &TargetPlatform);
    /// True once all platform data of `asset` for `platform` is ready to serialize
    fn poll_platform_data(&mut self, asset: AssetId, platform: &TargetPlatform) -> bool;
    fn serialize_for_platform(&mut self, asset: AssetId, platform: &TargetPlatform) -> Result<Vec<u8>>;
    fn is_waiting_on_cache(&self) -> bool;
    fn collect_garbage(&mut self);
    /// Bytes currently held by loaded assets
    fn memory_usage(&self) -> u64;
}

/// Handed out to editors and tools, any asset sent through it is re-cooked
#[derive(Debug, Clone)]
pub struct AssetChangeNotifier {
    tx: mpsc::Sender<AssetId>,
}
impl AssetChangeNotifier {
    /// Returns false once the cook run holding the receiving side is gone
    pub fn asset_changed(&self, asset: AssetId) -> bool {
        self.tx.send(asset).is_ok()
    }
}

#[derive(Debug)]
pub struct AssetChangeReceiver {
    rx: mpsc::Receiver<AssetId>,
}
impl AssetChangeReceiver {
    pub fn drain(&self) -> Vec<AssetId> {
        self.rx.try_iter().collect()
    }
}

pub fn asset_change_channel() -> (AssetChangeNotifier, AssetChangeReceiver) {
    let (tx, rx) = mpsc::channel();
    (AssetChangeNotifier { tx }, AssetChangeReceiver { rx })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_change_channel() {
        let (notifier, receiver) = asset_change_channel();
        let other = notifier.clone();
        assert!(notifier.asset_changed(AssetId(3)));
        assert!(other.asset_changed(AssetId(1)));
        assert_eq!(receiver.drain(), vec![AssetId(3), AssetId(1)]);
        assert!(receiver.drain().is_empty());
        drop(receiver);
        assert!(!notifier.asset_changed(AssetId(3)));
    }
}
