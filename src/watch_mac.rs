//! Concurrent, time-bounded cache of resolved hardware addresses.
//!
//! An entry with no MAC means an ARP/NDP request is in flight for that IP;
//! concurrent resolvers check `is_pending` before sending so only one
//! request is outstanding per IP at a time. A background sweeper evicts
//! idle entries, keeping the cache bounded when sweeping huge address
//! spaces.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::net::MacAddress;

struct MacCacheEntry {
    last_activity: Instant,
    mac: Option<MacAddress>,
}

#[derive(Clone)]
pub struct MacCache {
    entries: Arc<RwLock<HashMap<String, MacCacheEntry>>>,
    done: Arc<AtomicBool>,
}

impl MacCache {
    const SWEEP_INTERVAL: Duration = Duration::from_secs(2);
    const TTL: Duration = Duration::from_secs(10);

    pub fn new() -> Self {
        let cache = Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            done: Arc::new(AtomicBool::new(false)),
        };
        let sweeper = cache.clone();
        std::thread::Builder::new()
            .name("mac-cache-sweeper".into())
            .spawn(move || sweeper.sweep_loop())
            .ok();
        cache
    }

    /// True while a resolution request for `ip` is outstanding.
    pub fn is_pending(&self, ip: &str) -> bool {
        let entries = self.entries.read().unwrap();
        entries.get(ip).map_or(false, |e| e.mac.is_none())
    }

    /// Create or refresh the entry for `ip` with no address yet. Must be
    /// called before the first request frame for that IP goes out.
    pub fn mark_pending(&self, ip: &str) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();
        entries
            .entry(ip.to_string())
            .and_modify(|e| e.last_activity = now)
            .or_insert(MacCacheEntry {
                last_activity: now,
                mac: None,
            });
    }

    pub fn set_resolved(&self, ip: &str, mac: MacAddress) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();
        let entry = entries.entry(ip.to_string()).or_insert(MacCacheEntry {
            last_activity: now,
            mac: None,
        });
        entry.last_activity = now;
        entry.mac = Some(mac);
    }

    pub fn get(&self, ip: &str) -> Option<MacAddress> {
        let entries = self.entries.read().unwrap();
        entries.get(ip).and_then(|e| e.mac)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    pub fn close(&self) {
        self.done.store(true, Ordering::Relaxed);
        self.entries.write().unwrap().clear();
    }

    fn sweep_loop(&self) {
        while !self.done.load(Ordering::Relaxed) {
            std::thread::sleep(Self::SWEEP_INTERVAL);
            if self.done.load(Ordering::Relaxed) {
                break;
            }
            self.sweep_once(Self::TTL);
        }
    }

    fn sweep_once(&self, ttl: Duration) {
        let mut entries = self.entries.write().unwrap();
        entries.retain(|_, e| e.last_activity.elapsed() <= ttl);
    }

    #[cfg(test)]
    fn backdate(&self, ip: &str, by: Duration) {
        let mut entries = self.entries.write().unwrap();
        if let Some(e) = entries.get_mut(ip) {
            if let Some(t) = e.last_activity.checked_sub(by) {
                e.last_activity = t;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> MacAddress {
        MacAddress::new([1, 2, 3, 4, 5, 6])
    }

    #[test]
    fn pending_transitions() {
        let cache = MacCache::new();
        assert!(!cache.is_pending("10.0.0.1"));

        cache.mark_pending("10.0.0.1");
        assert!(cache.is_pending("10.0.0.1"));
        assert_eq!(cache.get("10.0.0.1"), None);

        cache.set_resolved("10.0.0.1", mac());
        assert!(!cache.is_pending("10.0.0.1"));
        assert_eq!(cache.get("10.0.0.1"), Some(mac()));
        cache.close();
    }

    #[test]
    fn only_one_request_per_ip() {
        // A second resolver observing is_pending backs off instead of
        // sending its own request.
        let cache = MacCache::new();
        cache.mark_pending("10.0.0.9");
        assert!(cache.is_pending("10.0.0.9"));
        assert!(cache.is_pending("10.0.0.9"));
        cache.close();
    }

    #[test]
    fn sweeper_evicts_idle_entries() {
        let cache = MacCache::new();
        cache.set_resolved("10.0.0.2", mac());
        cache.backdate("10.0.0.2", Duration::from_secs(11));
        cache.sweep_once(MacCache::TTL);
        assert_eq!(cache.get("10.0.0.2"), None);
        assert!(cache.is_empty());
        cache.close();
    }

    #[test]
    fn close_clears_entries() {
        let cache = MacCache::new();
        cache.set_resolved("10.0.0.3", mac());
        cache.close();
        assert!(cache.is_empty());
        assert_eq!(cache.get("10.0.0.3"), None);
    }
}
