use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;

use crate::{AssetId, PlatformId, PlatformSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookRequest {
    pub asset: AssetId,
    pub platforms: PlatformSet,
    /// Someone is waiting on this one (cook on the fly)
    pub urgent: bool,
}

/// FIFO of cook requests, unique per asset. A duplicate request widens the queued platform set.
#[derive(Debug, Default)]
pub struct RequestQueue {
    order: VecDeque<AssetId>,
    entries: HashMap<AssetId, CookRequest>,
}
impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a new entry was created
    pub fn enqueue_unique(&mut self, request: CookRequest, force_front: bool) -> bool {
        let created = match self.entries.get_mut(&request.asset) {
            Some(existing) => {
                existing.platforms = existing.platforms.union(request.platforms);
                existing.urgent |= request.urgent;
                false
            }
            None => {
                self.entries.insert(request.asset, request);
                true
            }
        };
        if created {
            if force_front {
                self.order.push_front(request.asset);
            } else {
                self.order.push_back(request.asset);
            }
        } else if force_front && let Some(pos) = self.order.iter().position(|a| *a == request.asset) {
            self.order.remove(pos);
            self.order.push_front(request.asset);
        }
        created
    }

    pub fn dequeue(&mut self) -> Option<CookRequest> {
        let asset = self.order.pop_front()?;
        self.entries.remove(&asset)
    }
    pub fn peek(&self) -> Option<&CookRequest> {
        self.order.front().and_then(|a| self.entries.get(a))
    }
    pub fn contains(&self, asset: AssetId) -> bool {
        self.entries.contains_key(&asset)
    }
    pub fn get(&self, asset: AssetId) -> Option<&CookRequest> {
        self.entries.get(&asset)
    }
    pub fn len(&self) -> usize {
        self.order.len()
    }
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
    pub fn clear(&mut self) -> Vec<CookRequest> {
        let drained = self.order.drain(..).filter_map(|a| self.entries.remove(&a)).collect();
        self.entries.clear();
        drained
    }
    pub fn iter(&self) -> impl Iterator<Item = &CookRequest> {
        self.order.iter().filter_map(|a| self.entries.get(a))
    }
}

/// Outcome of every cook attempt of one asset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookedRecord {
    pub attempted: PlatformSet,
    pub succeeded: PlatformSet,
    pub timestamps: Vec<(PlatformId, SystemTime)>,
}
impl CookedRecord {
    pub fn failed(&self) -> PlatformSet {
        self.attempted.difference(self.succeeded)
    }
    pub fn timestamp(&self, platform: PlatformId) -> Option<SystemTime> {
        self.timestamps.iter().find(|(p, _)| *p == platform).map(|(_, ts)| *ts)
    }
}

/// Records of the current run. A success is never taken back except by `invalidate`, and a
/// failure stays recorded so the same request is not retried forever.
#[derive(Debug, Default)]
pub struct CookedPackages {
    records: HashMap<AssetId, CookedRecord>,
}
impl CookedPackages {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn record_success(&mut self, asset: AssetId, platform: PlatformId, timestamp: SystemTime) {
        let record = self.records.entry(asset).or_default();
        record.attempted.insert(platform);
        record.succeeded.insert(platform);
        match record.timestamps.iter_mut().find(|(p, _)| *p == platform) {
            Some((_, ts)) => *ts = timestamp,
            None => record.timestamps.push((platform, timestamp)),
        }
    }
    pub fn record_failure(&mut self, asset: AssetId, platforms: PlatformSet) {
        let record = self.records.entry(asset).or_default();
        record.attempted = record.attempted.union(platforms);
    }
    pub fn get(&self, asset: AssetId) -> Option<&CookedRecord> {
        self.records.get(&asset)
    }
    /// Platforms of `requested` that still need an attempt
    pub fn remaining(&self, asset: AssetId, requested: PlatformSet) -> PlatformSet {
        match self.records.get(&asset) {
            Some(record) => requested.difference(record.attempted),
            None => requested,
        }
    }
    pub fn succeeded(&self, asset: AssetId, platform: PlatformId) -> bool {
        self.records.get(&asset).is_some_and(|r| r.succeeded.contains(platform))
    }
    pub fn invalidate(&mut self, asset: AssetId) -> bool {
        self.records.remove(&asset).is_some()
    }
    pub fn iter(&self) -> impl Iterator<Item = (AssetId, &CookedRecord)> {
        self.records.iter().map(|(a, r)| (*a, r))
    }
    pub fn len(&self) -> usize {
        self.records.len()
    }
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    const WIN: PlatformId = PlatformId(0);
    const PS: PlatformId = PlatformId(1);

    fn request(asset: u32, platform: PlatformId) -> CookRequest {
        CookRequest {
            asset: AssetId(asset),
            platforms: PlatformSet::single(platform),
            urgent: false,
        }
    }

    #[test]
    fn test_duplicate_unions_platforms() {
        let mut queue = RequestQueue::new();
        assert!(queue.enqueue_unique(request(7, WIN), false));
        assert!(!queue.enqueue_unique(request(7, PS), false));
        assert_eq!(queue.len(), 1);
        let entry = queue.dequeue().unwrap();
        assert_eq!(entry.platforms, [WIN, PS].into_iter().collect());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_force_front_moves_existing() {
        let mut queue = RequestQueue::new();
        for asset in 1..=3 {
            queue.enqueue_unique(request(asset, WIN), false);
        }
        queue.enqueue_unique(request(3, PS), true);
        queue.enqueue_unique(request(9, WIN), true);
        let order: Vec<u32> = queue.iter().map(|r| r.asset.0).collect();
        assert_eq!(order, vec![9, 3, 1, 2]);
        assert_eq!(queue.get(AssetId(3)).unwrap().platforms.len(), 2);
        assert_eq!(queue.clear().len(), 4);
        assert!(queue.peek().is_none());
    }

    #[test]
    fn test_records_are_monotonic() {
        let mut cooked = CookedPackages::new();
        let both: PlatformSet = [WIN, PS].into_iter().collect();
        cooked.record_success(AssetId(1), WIN, SystemTime::UNIX_EPOCH);
        cooked.record_failure(AssetId(1), both);
        assert!(cooked.succeeded(AssetId(1), WIN));
        assert_eq!(cooked.get(AssetId(1)).unwrap().failed(), PlatformSet::single(PS));
        assert!(cooked.remaining(AssetId(1), both).is_empty());
        assert_eq!(cooked.remaining(AssetId(2), both), both);
        assert!(cooked.invalidate(AssetId(1)));
        assert_eq!(cooked.remaining(AssetId(1), both), both);
    }
}
