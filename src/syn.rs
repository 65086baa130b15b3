//! Stateless SYN scanner engine.
//!
//! One instance owns three background threads: a receive loop draining the
//! wire, a dispatcher forwarding discovered ports (spawning enrichment
//! workers when fingerprinting is enabled), and the table sweepers.
//! `scan` itself never blocks on pacing; callers gate each probe with
//! [`Scanner::wait_limiter`] so the adaptive rate controller can observe
//! real drain speed through the token balance.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::debug;

use crate::config::{ScannerOption, MIN_ACCEPTED_RATE};
use crate::error::ScanError;
use crate::limiter::TokenBucket;
use crate::net::capture::{bpf_filter, EthFrameSink, FrameSink, FrameSource, PcapSource};
use crate::net::{self, MacAddress};
use crate::packet::{self, arp, ndp};
use crate::probe::PortProber;
use crate::route::{resolve_route, ResolvedRoute};
use crate::watch_ip::IpWatchTable;
use crate::watch_mac::MacCache;
use crate::{IpOption, OpenIpPort, Scanner};

/// Counterpart of a `sync.WaitGroup` for the enrichment workers.
struct WaitGroup {
    count: Mutex<usize>,
    cond: Condvar,
}

impl WaitGroup {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn add(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.cond.wait(count).unwrap();
        }
    }
}

struct RateCtl {
    last_eval: Instant,
}

/// Rate decision for one controller evaluation. `None` leaves the rate
/// alone. Queue pressure throttles hard: near-full collapses to the
/// floor, high occupancy halves. Otherwise the token balance steers:
/// surplus means the caller probes slower than the current rate, so the
/// rate follows it down; debt beyond 50 means the caller is saturating a
/// previously lowered rate, so the rate climbs back. Always clamped to
/// `[min, max]`.
fn next_rate(qlen: usize, qcap: usize, tokens: f64, last: u32, min: u32, max: u32) -> Option<u32> {
    let target = if qlen * 10 >= qcap * 9 {
        MIN_ACCEPTED_RATE
    } else if qlen * 10 >= qcap * 8 {
        last / 2
    } else if tokens > 0.0 || tokens < -50.0 {
        (f64::from(last) - tokens - 10.0).max(1.0) as u32
    } else {
        return None;
    };
    Some(target.clamp(min, max))
}

struct Inner {
    opt: ScannerOption,
    route: ResolvedRoute,
    gw_mac: OnceLock<MacAddress>,
    sink: Arc<dyn FrameSink>,
    mac_cache: MacCache,
    watch_ip: IpWatchTable,
    limiter: TokenBucket,
    done: AtomicBool,
    /// Feeds the dispatcher. Taken (disconnected) at close.
    open_tx: Mutex<Option<Sender<OpenIpPort>>>,
    probe_wg: WaitGroup,
    prober: Mutex<Option<Arc<dyn PortProber>>>,
    rate_ctl: Mutex<RateCtl>,
}

impl Inner {
    const RATE_EVAL_INTERVAL: Duration = Duration::from_secs(2);
    const ARP_POLL: Duration = Duration::from_millis(10);
    const ARP_TIMEOUT: Duration = Duration::from_millis(600);
    /// Resend the request every this many polls while still unresolved.
    const ARP_RESEND_POLLS: u32 = 25;

    fn scan(&self, ip: IpAddr, port: u16, opt: IpOption) -> Result<(), ScanError> {
        if self.done.load(Ordering::SeqCst) {
            return Err(ScanError::ScannerClosed);
        }
        self.change_limiter();
        self.watch_ip.touch(&ip.to_string(), opt);

        let dst_mac = match self.route.gw_ip {
            Some(_) => *self
                .gw_mac
                .get()
                .ok_or_else(|| ScanError::NoRoute("gateway MAC unresolved".into()))?,
            // Directly connected target: resolve its own MAC.
            None => self.get_hw_addr(ip)?,
        };
        let src_ip = match ip {
            IpAddr::V4(_) => IpAddr::V4(self.route.src_ip),
            IpAddr::V6(_) => IpAddr::V6(
                self.route
                    .src_ip6
                    .ok_or_else(|| ScanError::NoRoute("no IPv6 source address".into()))?,
            ),
        };
        let frame = packet::build_syn(
            &self.route.src_mac,
            &dst_mac,
            src_ip,
            ip,
            packet::random_probe_source_port(),
            port,
            packet::random_sequence(),
        )?;
        self.sink.transmit(&frame)
    }

    /// Hardware address of a directly connected `ip`, from the cache or by
    /// sending an ARP/NDP request and polling for the receive loop to fill
    /// the cache. Link-local and 6to4 IPv6 addresses that embed an EUI-64
    /// are derived without touching the wire.
    fn get_hw_addr(&self, ip: IpAddr) -> Result<MacAddress, ScanError> {
        let key = ip.to_string();
        if let Some(mac) = self.mac_cache.get(&key) {
            return Ok(mac);
        }
        if let IpAddr::V6(v6) = ip {
            if let Some(mac) = MacAddress::from_slaac(v6) {
                self.mac_cache.set_resolved(&key, mac);
                return Ok(mac);
            }
        }
        if self.mac_cache.is_pending(&key) {
            return Err(ScanError::ArpPending(ip));
        }
        self.mac_cache.mark_pending(&key);

        let request = match ip {
            IpAddr::V4(v4) => arp::build_request(&self.route.src_mac, self.route.src_ip, v4),
            IpAddr::V6(v6) => {
                let src6 = self
                    .route
                    .src_ip6
                    .ok_or_else(|| ScanError::NoRoute("no IPv6 source address".into()))?;
                ndp::build_neighbor_solicit(&self.route.src_mac, src6, v6)
            }
        };
        self.sink.transmit(&request)?;

        let deadline = Instant::now() + Self::ARP_TIMEOUT;
        let mut polls: u32 = 0;
        loop {
            std::thread::sleep(Self::ARP_POLL);
            if self.done.load(Ordering::SeqCst) {
                return Err(ScanError::ScannerClosed);
            }
            if let Some(mac) = self.mac_cache.get(&key) {
                return Ok(mac);
            }
            if Instant::now() >= deadline {
                return Err(ScanError::ArpTimeout(ip));
            }
            polls += 1;
            if polls % Self::ARP_RESEND_POLLS == 0 {
                self.sink.transmit(&request)?;
            }
        }
    }

    /// Adaptive rate control, evaluated at most every two seconds from
    /// the send path. The decision itself lives in [`next_rate`].
    fn change_limiter(&self) {
        {
            let mut ctl = self.rate_ctl.lock().unwrap();
            if ctl.last_eval.elapsed() < Self::RATE_EVAL_INTERVAL {
                return;
            }
            ctl.last_eval = Instant::now();
        }
        let (qlen, qcap) = {
            let guard = self.open_tx.lock().unwrap();
            match guard.as_ref() {
                Some(tx) => (tx.len(), tx.capacity().unwrap_or(self.opt.queue_cap)),
                None => return,
            }
        };
        let tokens = self.limiter.tokens();
        let last = self.limiter.rate();
        let Some(target) = next_rate(qlen, qcap, tokens, last, self.opt.min_rate, self.opt.rate)
        else {
            return;
        };
        if target != last {
            if self.opt.debug {
                debug!(
                    "rate {last} -> {target} pps (queue {qlen}/{qcap}, tokens {tokens:.0})"
                );
            }
            self.limiter.set_rate(target);
        }
    }

    fn handle_frame(&self, frame: &[u8]) {
        if let Some(sender) = arp::parse_sender(frame) {
            let key = sender.ip.to_string();
            if self.mac_cache.is_pending(&key) {
                self.mac_cache.set_resolved(&key, sender.mac);
            }
            return;
        }
        if let Some((target, mac)) = ndp::parse_neighbor_advert(frame) {
            let key = target.to_string();
            if self.mac_cache.is_pending(&key) {
                self.mac_cache.set_resolved(&key, mac);
            }
            // An NA frame is not TCP; nothing further to do.
            return;
        }

        let Some(tcp) = packet::parse_tcp_frame(frame) else {
            return;
        };
        // Return traffic for our probes lands in the reserved port band.
        if !packet::in_probe_port_range(tcp.dst_port) {
            return;
        }
        let ip_key = tcp.src_ip.to_string();
        let Some(opts) = self.watch_ip.lookup(&ip_key) else {
            // Not a probe of ours, or the entry aged out.
            return;
        };
        if self.watch_ip.has_port(&ip_key, tcp.src_port) {
            // Already answered for this (ip, port): a retransmitted
            // SYN-ACK, or a stale SYN-ACK after a refusal.
            return;
        }
        // Every classified reply is recorded, so a closed port's RST also
        // suppresses later replies for the same pair.
        self.watch_ip.record_port(&ip_key, tcp.src_port);
        if !tcp.syn || !tcp.ack || tcp.rst {
            return;
        }

        // Tear down the half-open connection; the handshake is never
        // completed.
        match packet::build_rst(
            &self.route.src_mac,
            &tcp.src_mac,
            tcp.dst_ip,
            tcp.src_ip,
            tcp.dst_port,
            tcp.src_port,
            tcp.ack_no,
            tcp.seq.wrapping_add(1),
        ) {
            Ok(rst) => {
                if let Err(e) = self.sink.transmit(&rst) {
                    debug!("failed to send reset to {}: {e}", tcp.src_ip);
                }
            }
            Err(e) => debug!("failed to build reset for {}: {e}", tcp.src_ip),
        }

        let open = OpenIpPort {
            ip: tcp.src_ip,
            port: tcp.src_port,
            opt: opts,
            service: None,
            banner: None,
            http_info: None,
        };
        if let Some(tx) = self.open_tx.lock().unwrap().as_ref() {
            let _ = tx.send(open);
        }
    }

    fn run_recv(self: Arc<Self>, mut source: Box<dyn FrameSource>) {
        loop {
            if self.done.load(Ordering::SeqCst) {
                break;
            }
            match source.next_frame() {
                Ok(frame) => self.handle_frame(&frame),
                Err(ScanError::ScannerClosed) => break,
                Err(e) => {
                    debug!("capture read error: {e}");
                }
            }
        }
    }

    fn run_dispatch(self: Arc<Self>, open_rx: Receiver<OpenIpPort>, ret_tx: Sender<OpenIpPort>) {
        for open in open_rx {
            let wants_probe = open.opt.fingerprint || open.opt.httpx;
            let prober = if wants_probe {
                self.prober.lock().unwrap().clone()
            } else {
                None
            };
            let Some(prober) = prober else {
                let _ = ret_tx.send(open);
                continue;
            };
            self.probe_wg.add();
            let inner = Arc::clone(&self);
            let ret_tx = ret_tx.clone();
            let spawned = std::thread::Builder::new()
                .name("syn-probe".into())
                .spawn(move || {
                    inner.probe_one(&*prober, open, &ret_tx);
                    inner.probe_wg.done();
                });
            if spawned.is_err() {
                self.probe_wg.done();
            }
        }
    }

    /// Connect-based enrichment of one discovered port. Shares the send
    /// budget with SYN probes through the limiter.
    fn probe_one(&self, prober: &dyn PortProber, mut open: OpenIpPort, ret_tx: &Sender<OpenIpPort>) {
        let timeout = Duration::from_millis(self.opt.timeout_ms);
        if open.opt.fingerprint && self.limiter.wait(&self.done).is_ok() {
            let ident = prober.identify_service(open.ip, open.port, timeout);
            if !ident.name.is_empty() {
                open.service = Some(ident.name);
            }
            open.banner = ident.banner;
        }
        // Ports already identified as something other than HTTP are not
        // worth an HTTP round trip.
        let http_candidate = open
            .service
            .as_deref()
            .map_or(true, |s| s == "http" || s == "https");
        if open.opt.httpx && http_candidate && self.limiter.wait(&self.done).is_ok() {
            if let Some(info) = prober.probe_http(open.ip, open.port, timeout) {
                let service = if info.url.starts_with("https") {
                    "https"
                } else {
                    "http"
                };
                open.service = Some(service.into());
                open.http_info = Some(info);
            }
        }
        let _ = ret_tx.send(open);
    }
}

/// Handle to a running SYN scanner. Cheap to clone; all clones drive the
/// same engine.
#[derive(Clone)]
pub struct SynScanner {
    inner: Arc<Inner>,
}

impl SynScanner {
    /// Open the real wire: route discovery for `first_ip`, an AF_PACKET
    /// send socket and a filtered pcap capture on the chosen device.
    /// Discovered ports are delivered on `ret_tx`.
    pub fn new(
        first_ip: IpAddr,
        ret_tx: Sender<OpenIpPort>,
        opt: ScannerOption,
    ) -> Result<Self, ScanError> {
        opt.validate()?;
        let route = resolve_route(first_ip, opt.next_hop)?;
        let ifindex = net::get_interface_index(&route.dev_name)?;
        let sink = Arc::new(EthFrameSink::new(ifindex)?);
        let source = PcapSource::open(&route.dev_name, &bpf_filter(&route.src_mac))?;
        Self::with_wire(route, sink, Box::new(source), ret_tx, opt)
    }

    /// Build the engine over an arbitrary wire. The receive loop starts
    /// before gateway resolution so the resolution reply can be observed.
    pub fn with_wire(
        route: ResolvedRoute,
        sink: Arc<dyn FrameSink>,
        source: Box<dyn FrameSource>,
        ret_tx: Sender<OpenIpPort>,
        opt: ScannerOption,
    ) -> Result<Self, ScanError> {
        opt.validate()?;
        let (open_tx, open_rx) = bounded(opt.queue_cap);
        let inner = Arc::new(Inner {
            limiter: TokenBucket::new(opt.rate),
            watch_ip: IpWatchTable::new(Duration::from_millis(opt.timeout_ms)),
            mac_cache: MacCache::new(),
            done: AtomicBool::new(false),
            gw_mac: OnceLock::new(),
            open_tx: Mutex::new(Some(open_tx)),
            probe_wg: WaitGroup::new(),
            prober: Mutex::new(None),
            rate_ctl: Mutex::new(RateCtl {
                last_eval: Instant::now(),
            }),
            sink,
            route,
            opt,
        });

        let recv = Arc::clone(&inner);
        std::thread::Builder::new()
            .name("syn-recv".into())
            .spawn(move || recv.run_recv(source))?;
        let dispatch = Arc::clone(&inner);
        std::thread::Builder::new()
            .name("syn-dispatch".into())
            .spawn(move || dispatch.run_dispatch(open_rx, ret_tx))?;

        let scanner = Self { inner };
        if let Some(gw) = scanner.inner.route.gw_ip {
            match scanner.inner.get_hw_addr(gw) {
                Ok(mac) => {
                    let _ = scanner.inner.gw_mac.set(mac);
                }
                Err(e) => {
                    scanner.close();
                    return Err(e);
                }
            }
        }
        Ok(scanner)
    }

    /// Install the connect-based prober used when a target is scanned with
    /// `fingerprint` or `httpx` set.
    pub fn set_prober(&self, prober: Arc<dyn PortProber>) {
        *self.inner.prober.lock().unwrap() = Some(prober);
    }

    /// Name of the capture device the scanner is bound to.
    pub fn dev_name(&self) -> &str {
        &self.inner.route.dev_name
    }
}

impl Scanner for SynScanner {
    fn scan(&self, ip: IpAddr, port: u16, opt: IpOption) -> Result<(), ScanError> {
        self.inner.scan(ip, port, opt)
    }

    fn wait_limiter(&self) -> Result<(), ScanError> {
        self.inner.limiter.wait(&self.inner.done)
    }

    fn wait(&self) {
        // Give stragglers up to two seconds to answer; the watch table
        // empties as entries age past the response timeout.
        for _ in 0..20 {
            if self.inner.watch_ip.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        // Let queued results reach the dispatcher.
        loop {
            let queued = self
                .inner
                .open_tx
                .lock()
                .unwrap()
                .as_ref()
                .map_or(0, |tx| tx.len());
            if queued == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        self.inner.probe_wg.wait();
    }

    fn close(&self) {
        if self.inner.done.swap(true, Ordering::SeqCst) {
            return;
        }
        // A blocking capture read cannot be interrupted on Linux; send one
        // throwaway self-addressed ARP frame that passes the filter and
        // wakes the receive loop so it can observe the done flag.
        let unblock = arp::build_self_addressed(&self.inner.route.src_mac, self.inner.route.src_ip);
        if let Err(e) = self.inner.sink.transmit(&unblock) {
            debug!("shutdown unblock frame not sent: {e}");
        }
        self.inner.open_tx.lock().unwrap().take();
        self.inner.watch_ip.close();
        self.inner.mac_cache.close();
    }
}
