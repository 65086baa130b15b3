//! End-to-end engine tests over an in-memory wire.
//!
//! The fake sink plays the role of the network: it answers the scanner's
//! ARP request with a gateway mapping, answers SYNs for configured open
//! ports with SYN-ACKs, and records the resets the engine sends back.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use etherparse::PacketBuilder;

use synscan::error::ScanError;
use synscan::net::capture::{FrameSink, FrameSource};
use synscan::net::MacAddress;
use synscan::packet::{self, arp, TcpFrame};
use synscan::route::ResolvedRoute;
use synscan::{IpOption, OpenIpPort, Scanner, ScannerOption, SynScanner};

const SCANNER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);
const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 254);
const PEER_SEQ: u32 = 11_000;

fn scanner_mac() -> MacAddress {
    MacAddress::new([0x02, 0x00, 0x00, 0xaa, 0xbb, 0xcc])
}

fn gateway_mac() -> MacAddress {
    MacAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01])
}

/// Reset frames observed on the wire: (target ip, target port, seq, ack).
type RstLog = Mutex<Vec<(IpAddr, u16, u32, u32)>>;

struct FakeSink {
    net_tx: Sender<Vec<u8>>,
    open_ports: HashSet<(IpAddr, u16)>,
    /// Deliver every SYN-ACK twice, as a retransmitting peer would.
    duplicate_replies: bool,
    rsts: Arc<RstLog>,
}

impl FakeSink {
    fn syn_ack_for(probe: &TcpFrame) -> Vec<u8> {
        let (IpAddr::V4(probe_src), IpAddr::V4(probe_dst)) = (probe.src_ip, probe.dst_ip) else {
            panic!("v4 probes only in this harness");
        };
        let mut frame = Vec::new();
        PacketBuilder::ethernet2(gateway_mac().octets(), probe.src_mac.octets())
            .ipv4(probe_dst.octets(), probe_src.octets(), 64)
            .tcp(probe.dst_port, probe.src_port, PEER_SEQ, 65535)
            .syn()
            .ack(probe.seq.wrapping_add(1))
            .write(&mut frame, &[])
            .unwrap();
        frame
    }
}

impl FrameSink for FakeSink {
    fn transmit(&self, frame: &[u8]) -> Result<(), ScanError> {
        if arp::parse_sender(frame).is_some() {
            // Whatever the question (gateway resolution or the shutdown
            // wake-up frame), answering with the gateway's identity both
            // fills the cache and unblocks the receive loop.
            let reply = arp::build_request(&gateway_mac(), GATEWAY_IP, SCANNER_IP);
            let _ = self.net_tx.send(reply);
            return Ok(());
        }
        if let Some(tcp) = packet::parse_tcp_frame(frame) {
            if tcp.rst {
                self.rsts
                    .lock()
                    .unwrap()
                    .push((tcp.dst_ip, tcp.dst_port, tcp.seq, tcp.ack_no));
            } else if tcp.syn && !tcp.ack && self.open_ports.contains(&(tcp.dst_ip, tcp.dst_port)) {
                let reply = Self::syn_ack_for(&tcp);
                let _ = self.net_tx.send(reply.clone());
                if self.duplicate_replies {
                    let _ = self.net_tx.send(reply);
                }
            }
        }
        Ok(())
    }
}

struct FakeSource {
    net_rx: Receiver<Vec<u8>>,
}

impl FrameSource for FakeSource {
    fn next_frame(&mut self) -> Result<Vec<u8>, ScanError> {
        self.net_rx.recv().map_err(|_| ScanError::ScannerClosed)
    }
}

struct Harness {
    scanner: SynScanner,
    results: Receiver<OpenIpPort>,
    rsts: Arc<RstLog>,
    /// Inject raw frames as if they arrived off the wire.
    inject: Sender<Vec<u8>>,
}

fn harness(open: &[(&str, u16)], duplicate_replies: bool) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let open_ports: HashSet<(IpAddr, u16)> = open
        .iter()
        .map(|&(ip, port)| (ip.parse().unwrap(), port))
        .collect();
    let rsts = Arc::new(Mutex::new(Vec::new()));
    let (net_tx, net_rx) = unbounded();
    let (ret_tx, results) = unbounded();

    let sink = Arc::new(FakeSink {
        net_tx: net_tx.clone(),
        open_ports,
        duplicate_replies,
        rsts: Arc::clone(&rsts),
    });
    let route = ResolvedRoute {
        dev_name: "fake0".into(),
        src_ip: SCANNER_IP,
        src_ip6: None,
        src_mac: scanner_mac(),
        gw_ip: Some(IpAddr::V4(GATEWAY_IP)),
    };
    let opt = ScannerOption {
        rate: 5000,
        timeout_ms: 200,
        queue_cap: 1024,
        ..Default::default()
    };
    let scanner = SynScanner::with_wire(route, sink, Box::new(FakeSource { net_rx }), ret_tx, opt)
        .expect("fake wire scanner");
    Harness {
        scanner,
        results,
        rsts,
        inject: net_tx,
    }
}

fn sweep(scanner: &SynScanner, targets: &[&str], ports: &[u16]) {
    for ip in targets {
        let ip: IpAddr = ip.parse().unwrap();
        for &port in ports {
            scanner.wait_limiter().unwrap();
            scanner.scan(ip, port, IpOption::default()).unwrap();
        }
    }
}

#[test]
fn discovers_open_ports_and_resets_them() {
    let h = harness(&[("192.168.1.1", 80), ("192.168.1.2", 22)], false);
    sweep(
        &h.scanner,
        &["192.168.1.1", "192.168.1.2", "192.168.1.3"],
        &[22, 80, 443],
    );

    let mut found = Vec::new();
    for _ in 0..2 {
        let open = h.results.recv_timeout(Duration::from_secs(2)).unwrap();
        found.push((open.ip.to_string(), open.port));
    }
    found.sort();
    assert_eq!(
        found,
        vec![
            ("192.168.1.1".to_string(), 80),
            ("192.168.1.2".to_string(), 22)
        ]
    );
    assert!(h
        .results
        .recv_timeout(Duration::from_millis(300))
        .is_err());

    // Every SYN-ACK was answered with a reset carrying the peer's ack as
    // the sequence and the peer's sequence plus one as the ack.
    let rsts = h.rsts.lock().unwrap();
    assert_eq!(rsts.len(), 2);
    for &(_, _, _, ack) in rsts.iter() {
        assert_eq!(ack, PEER_SEQ + 1);
    }
    let rst_targets: HashSet<(IpAddr, u16)> =
        rsts.iter().map(|&(ip, port, _, _)| (ip, port)).collect();
    assert!(rst_targets.contains(&("192.168.1.1".parse().unwrap(), 80)));
    assert!(rst_targets.contains(&("192.168.1.2".parse().unwrap(), 22)));
    drop(rsts);

    h.scanner.close();
}

#[test]
fn retransmitted_syn_ack_reported_once() {
    let h = harness(&[("192.168.1.5", 443)], true);
    sweep(&h.scanner, &["192.168.1.5"], &[443]);

    let open = h.results.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(open.port, 443);
    assert!(h
        .results
        .recv_timeout(Duration::from_millis(300))
        .is_err());
    h.scanner.close();
}

#[test]
fn reply_from_unprobed_ip_is_dropped() {
    let h = harness(&[], false);

    // A spoofed SYN-ACK into the probe port band from an IP that was
    // never scanned must not surface.
    let mut frame = Vec::new();
    PacketBuilder::ethernet2(gateway_mac().octets(), scanner_mac().octets())
        .ipv4([10, 9, 9, 9], SCANNER_IP.octets(), 64)
        .tcp(443, packet::SOURCE_PORT_FIRST + 5, 1, 65535)
        .syn()
        .ack(1)
        .write(&mut frame, &[])
        .unwrap();
    h.inject.send(frame).unwrap();

    assert!(h
        .results
        .recv_timeout(Duration::from_millis(300))
        .is_err());
    h.scanner.close();
}

#[test]
fn rst_reply_means_closed_port() {
    let h = harness(&[], false);
    sweep(&h.scanner, &["192.168.1.9"], &[8080]);

    // The target refuses: RST+ACK back at the probe's source port.
    let mut frame = Vec::new();
    PacketBuilder::ethernet2(gateway_mac().octets(), scanner_mac().octets())
        .ipv4([192, 168, 1, 9], SCANNER_IP.octets(), 64)
        .tcp(8080, packet::SOURCE_PORT_FIRST + 1, 0, 0)
        .rst()
        .ack(1)
        .write(&mut frame, &[])
        .unwrap();
    h.inject.send(frame).unwrap();

    assert!(h
        .results
        .recv_timeout(Duration::from_millis(300))
        .is_err());
    h.scanner.close();
}

#[test]
fn syn_ack_after_rst_for_same_port_is_dropped() {
    let h = harness(&[], false);
    sweep(&h.scanner, &["192.168.1.9"], &[8080]);

    // The port first refuses, then a stale or spoofed SYN-ACK shows up
    // for the same (ip, port). The refusal was recorded, so the SYN-ACK
    // must not surface as an open port.
    let probe_port = packet::SOURCE_PORT_FIRST + 1;
    let mut rst = Vec::new();
    PacketBuilder::ethernet2(gateway_mac().octets(), scanner_mac().octets())
        .ipv4([192, 168, 1, 9], SCANNER_IP.octets(), 64)
        .tcp(8080, probe_port, 0, 0)
        .rst()
        .ack(1)
        .write(&mut rst, &[])
        .unwrap();
    h.inject.send(rst).unwrap();

    let mut syn_ack = Vec::new();
    PacketBuilder::ethernet2(gateway_mac().octets(), scanner_mac().octets())
        .ipv4([192, 168, 1, 9], SCANNER_IP.octets(), 64)
        .tcp(8080, probe_port, PEER_SEQ, 65535)
        .syn()
        .ack(1)
        .write(&mut syn_ack, &[])
        .unwrap();
    h.inject.send(syn_ack).unwrap();

    assert!(h
        .results
        .recv_timeout(Duration::from_millis(300))
        .is_err());
    h.scanner.close();
}

#[test]
fn reports_selected_device_name() {
    let h = harness(&[], false);
    assert_eq!(h.scanner.dev_name(), "fake0");
    h.scanner.close();
}

#[test]
fn scan_after_close_fails_and_close_is_idempotent() {
    let h = harness(&[], false);
    h.scanner.close();
    h.scanner.close();

    let err = h
        .scanner
        .scan("192.168.1.1".parse().unwrap(), 80, IpOption::default())
        .unwrap_err();
    assert!(matches!(err, ScanError::ScannerClosed));
}

struct FakeProber;

impl synscan::PortProber for FakeProber {
    fn identify_service(
        &self,
        _ip: IpAddr,
        port: u16,
        _timeout: Duration,
    ) -> synscan::ServiceIdent {
        synscan::ServiceIdent {
            name: if port == 22 { "ssh".into() } else { String::new() },
            banner: Some(b"SSH-2.0-OpenSSH_9.6".to_vec()),
        }
    }

    fn probe_http(
        &self,
        ip: IpAddr,
        port: u16,
        _timeout: Duration,
    ) -> Option<synscan::HttpInfo> {
        Some(synscan::HttpInfo {
            status_code: 200,
            content_len: 42,
            url: format!("https://{ip}:{port}"),
            ..Default::default()
        })
    }
}

#[test]
fn fingerprint_option_runs_the_prober() {
    let h = harness(&[("192.168.1.7", 22)], false);
    h.scanner.set_prober(Arc::new(FakeProber));

    let opt = IpOption {
        fingerprint: true,
        httpx: false,
    };
    h.scanner.wait_limiter().unwrap();
    h.scanner
        .scan("192.168.1.7".parse().unwrap(), 22, opt)
        .unwrap();

    let open = h.results.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(open.service.as_deref(), Some("ssh"));
    assert_eq!(open.banner.as_deref(), Some(&b"SSH-2.0-OpenSSH_9.6"[..]));
    assert_eq!(open.to_string(), "192.168.1.7:22 ssh");
    h.scanner.close();
}

#[test]
fn httpx_option_sets_service_from_scheme() {
    let h = harness(&[("192.168.1.8", 443)], false);
    h.scanner.set_prober(Arc::new(FakeProber));

    let opt = IpOption {
        fingerprint: false,
        httpx: true,
    };
    h.scanner.wait_limiter().unwrap();
    h.scanner
        .scan("192.168.1.8".parse().unwrap(), 443, opt)
        .unwrap();

    let open = h.results.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(open.service.as_deref(), Some("https"));
    let info = open.http_info.expect("http info");
    assert_eq!(info.status_code, 200);
    h.scanner.close();
}

#[test]
fn identified_non_http_service_is_not_http_probed() {
    let h = harness(&[("192.168.1.7", 22)], false);
    h.scanner.set_prober(Arc::new(FakeProber));

    let opt = IpOption {
        fingerprint: true,
        httpx: true,
    };
    h.scanner.wait_limiter().unwrap();
    h.scanner
        .scan("192.168.1.7".parse().unwrap(), 22, opt)
        .unwrap();

    // The prober would happily answer an HTTP probe, but a port already
    // identified as ssh must not get one.
    let open = h.results.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(open.service.as_deref(), Some("ssh"));
    assert!(open.http_info.is_none());
    h.scanner.close();
}

#[test]
fn wait_returns_after_watch_table_drains() {
    let h = harness(&[("192.168.1.1", 80)], false);
    sweep(&h.scanner, &["192.168.1.1"], &[80]);

    let open = h.results.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(open.port, 80);

    // With a 200ms response timeout the watch table drains within wait()'s
    // two-second budget and all queued results are already delivered.
    let start = std::time::Instant::now();
    h.scanner.wait();
    assert!(start.elapsed() < Duration::from_secs(5));
    h.scanner.close();
}
