//! Deoptimization statistics.
//!
//! Counts deoptimizations per site so the compiler can stop speculating at
//! sites that keep failing.

use super::DeoptReason;
use ember_core::MethodId;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A deoptimization site: a method and the dex pc of the innermost frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeoptSiteKey {
    pub method: MethodId,
    pub dex_pc: u32,
}

impl DeoptSiteKey {
    #[inline]
    pub const fn new(method: MethodId, dex_pc: u32) -> Self {
        Self { method, dex_pc }
    }
}

#[derive(Debug)]
struct DeoptSite {
    count: AtomicU32,
    by_reason: [AtomicU32; DeoptReason::COUNT],
}

impl DeoptSite {
    fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            by_reason: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    fn record(&self, reason: DeoptReason) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.by_reason[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    fn dominant_reason(&self) -> Option<DeoptReason> {
        let (index, count) = self
            .by_reason
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .enumerate()
            .max_by_key(|&(_, c)| c)?;
        if count == 0 {
            return None;
        }
        DeoptReason::from_u8(index as u8)
    }
}

/// Copy of one site's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteSnapshot {
    pub total_count: u32,
    pub dominant_reason: Option<DeoptReason>,
}

/// Process-wide deoptimization counters.
#[derive(Debug)]
pub struct DeoptStats {
    sites: RwLock<FxHashMap<DeoptSiteKey, DeoptSite>>,
    total: AtomicU64,
    by_reason: [AtomicU64; DeoptReason::COUNT],
}

impl Default for DeoptStats {
    fn default() -> Self {
        Self::new()
    }
}

impl DeoptStats {
    pub fn new() -> Self {
        Self {
            sites: RwLock::new(FxHashMap::default()),
            total: AtomicU64::new(0),
            by_reason: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record(&self, method: MethodId, dex_pc: u32, reason: DeoptReason) {
        let key = DeoptSiteKey::new(method, dex_pc);
        self.total.fetch_add(1, Ordering::Relaxed);
        self.by_reason[reason as usize].fetch_add(1, Ordering::Relaxed);

        if let Some(site) = self.sites.read().get(&key) {
            site.record(reason);
            return;
        }
        self.sites.write().entry(key).or_insert_with(DeoptSite::new).record(reason);
    }

    pub fn site(&self, method: MethodId, dex_pc: u32) -> Option<SiteSnapshot> {
        self.sites
            .read()
            .get(&DeoptSiteKey::new(method, dex_pc))
            .map(|site| SiteSnapshot {
                total_count: site.count.load(Ordering::Relaxed),
                dominant_reason: site.dominant_reason(),
            })
    }

    pub fn total_count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn count_for_reason(&self, reason: DeoptReason) -> u64 {
        self.by_reason[reason as usize].load(Ordering::Relaxed)
    }

    pub fn site_count(&self) -> usize {
        self.sites.read().len()
    }

    /// Sites that deoptimized at least `threshold` times.
    pub fn hot_sites(&self, threshold: u32) -> Vec<DeoptSiteKey> {
        self.sites
            .read()
            .iter()
            .filter(|(_, site)| site.count.load(Ordering::Relaxed) >= threshold)
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn reset(&self) {
        self.sites.write().clear();
        self.total.store(0, Ordering::Relaxed);
        for counter in &self.by_reason {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_per_site() {
        let stats = DeoptStats::new();
        stats.record(MethodId(1), 10, DeoptReason::TypeGuard);
        stats.record(MethodId(1), 10, DeoptReason::TypeGuard);
        stats.record(MethodId(1), 12, DeoptReason::BoundsCheck);

        assert_eq!(stats.total_count(), 3);
        assert_eq!(stats.site_count(), 2);
        assert_eq!(stats.count_for_reason(DeoptReason::TypeGuard), 2);
        let site = stats.site(MethodId(1), 10).unwrap();
        assert_eq!(site.total_count, 2);
        assert_eq!(site.dominant_reason, Some(DeoptReason::TypeGuard));
        assert!(stats.site(MethodId(2), 10).is_none());
    }

    #[test]
    fn test_hot_sites_and_reset() {
        let stats = DeoptStats::new();
        for _ in 0..5 {
            stats.record(MethodId(3), 0, DeoptReason::UncommonTrap);
        }
        stats.record(MethodId(3), 4, DeoptReason::Explicit);
        assert_eq!(stats.hot_sites(5), vec![DeoptSiteKey::new(MethodId(3), 0)]);
        stats.reset();
        assert_eq!(stats.total_count(), 0);
        assert_eq!(stats.site_count(), 0);
    }
}
