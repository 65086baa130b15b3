//! Concurrent table correlating in-flight probes with asynchronous
//! replies.
//!
//! Every `scan` call refreshes the entry for its destination IP; the
//! receive loop consults the table to decide whether a reply belongs to a
//! probe this scanner actually sent and to deduplicate retransmitted
//! SYN-ACKs. Entries idle longer than the configured response timeout are
//! swept out, after which late replies are silently dropped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::IpOption;

struct IpWatchEntry {
    last_activity: Instant,
    received_ports: HashSet<u16>,
    opts: IpOption,
}

#[derive(Clone)]
pub struct IpWatchTable {
    entries: Arc<RwLock<HashMap<String, IpWatchEntry>>>,
    done: Arc<AtomicBool>,
}

impl IpWatchTable {
    const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

    /// `ttl` is the scanner's configured response timeout.
    pub fn new(ttl: Duration) -> Self {
        let table = Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            done: Arc::new(AtomicBool::new(false)),
        };
        let sweeper = table.clone();
        std::thread::Builder::new()
            .name("ip-watch-sweeper".into())
            .spawn(move || sweeper.sweep_loop(ttl))
            .ok();
        table
    }

    /// Create the entry for `ip` or refresh its activity timestamp. The
    /// scan options are captured at first sight and kept thereafter.
    pub fn touch(&self, ip: &str, opts: IpOption) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();
        entries
            .entry(ip.to_string())
            .and_modify(|e| e.last_activity = now)
            .or_insert(IpWatchEntry {
                last_activity: now,
                received_ports: HashSet::new(),
                opts,
            });
    }

    /// Record a reply port. No-op when the IP is absent: the entry was
    /// swept, or the reply is not for a probe of ours.
    pub fn record_port(&self, ip: &str, port: u16) {
        let mut entries = self.entries.write().unwrap();
        if let Some(e) = entries.get_mut(ip) {
            e.received_ports.insert(port);
        }
    }

    pub fn has_port(&self, ip: &str, port: u16) -> bool {
        let entries = self.entries.read().unwrap();
        entries
            .get(ip)
            .map_or(false, |e| e.received_ports.contains(&port))
    }

    /// Scan options for a watched IP; `None` means the reply is not ours.
    pub fn lookup(&self, ip: &str) -> Option<IpOption> {
        let entries = self.entries.read().unwrap();
        entries.get(ip).map(|e| e.opts)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    pub fn close(&self) {
        self.done.store(true, Ordering::Relaxed);
        self.entries.write().unwrap().clear();
    }

    fn sweep_loop(&self, ttl: Duration) {
        while !self.done.load(Ordering::Relaxed) {
            std::thread::sleep(Self::SWEEP_INTERVAL);
            if self.done.load(Ordering::Relaxed) {
                break;
            }
            self.sweep_once(ttl);
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

    #[test]
    fn unwatched_ip_is_invisible() {
        let table = IpWatchTable::new(Duration::from_millis(800));
        assert!(table.lookup("1.2.3.4").is_none());
        table.record_port("1.2.3.4", 80);
        assert!(!table.has_port("1.2.3.4", 80));
        table.close();
    }

    #[test]
    fn port_recorded_at_most_once() {
        let table = IpWatchTable::new(Duration::from_millis(800));
        table.touch("10.0.0.1", IpOption::default());
        assert!(!table.has_port("10.0.0.1", 443));
        table.record_port("10.0.0.1", 443);
        assert!(table.has_port("10.0.0.1", 443));
        // A duplicate reply changes nothing.
        table.record_port("10.0.0.1", 443);
        assert!(table.has_port("10.0.0.1", 443));
        table.close();
    }

    #[test]
    fn touch_keeps_first_seen_options() {
        let table = IpWatchTable::new(Duration::from_millis(800));
        let opts = IpOption {
            fingerprint: true,
            httpx: false,
        };
        table.touch("10.0.0.1", opts);
        table.touch("10.0.0.1", IpOption::default());
        assert!(table.lookup("10.0.0.1").unwrap().fingerprint);
        table.close();
    }

    #[test]
    fn swept_entry_drops_late_replies() {
        let table = IpWatchTable::new(Duration::from_millis(800));
        table.touch("10.0.0.1", IpOption::default());
        table.backdate("10.0.0.1", Duration::from_secs(2));
        table.sweep_once(Duration::from_millis(800));
        assert!(table.is_empty());
        // Late reply for the evicted IP is a silent no-op.
        table.record_port("10.0.0.1", 22);
        assert!(!table.has_port("10.0.0.1", 22));
        assert!(table.lookup("10.0.0.1").is_none());
        table.close();
    }

    #[test]
    fn touch_refreshes_against_sweep() {
        let table = IpWatchTable::new(Duration::from_millis(800));
        table.touch("10.0.0.1", IpOption::default());
        table.sweep_once(Duration::from_millis(800));
        assert!(!table.is_empty());
        table.close();
    }
}
