//! SYN probe and RST reply framing.
//!
//! Frames are built with etherparse so checksums are computed over the
//! real network-layer header. The TCP options (MSS, window scale,
//! SACK-permitted) mirror what a stock OS stack sends, so probes do not
//! stand out on the wire.

pub mod arp;
pub mod ndp;

use std::net::IpAddr;

use etherparse::{
    IpHeaders, IpNumber, Ipv4Header, LinkSlice, NetSlice, PacketBuilder, SlicedPacket,
    TcpOptionElement, TransportSlice,
};
use rand::Rng;

use crate::error::ScanError;
use crate::net::MacAddress;

/// Reserved ephemeral band for probe source ports. The receive loop
/// recognizes return traffic by its destination port falling in this
/// range; nothing else on the host should be using it.
pub const SOURCE_PORT_FIRST: u16 = 49000;
pub const SOURCE_PORT_LAST: u16 = 58999;

const TCP_WINDOW: u16 = 65280;

const SYN_OPTIONS: [TcpOptionElement; 6] = [
    TcpOptionElement::MaximumSegmentSize(1360),
    TcpOptionElement::Noop,
    TcpOptionElement::WindowScale(8),
    TcpOptionElement::Noop,
    TcpOptionElement::Noop,
    TcpOptionElement::SelectiveAcknowledgementPermitted,
];

pub fn in_probe_port_range(port: u16) -> bool {
    (SOURCE_PORT_FIRST..=SOURCE_PORT_LAST).contains(&port)
}

pub fn random_probe_source_port() -> u16 {
    rand::thread_rng().gen_range(SOURCE_PORT_FIRST..=SOURCE_PORT_LAST)
}

pub fn random_sequence() -> u32 {
    rand::thread_rng().gen_range(500_000..510_000)
}

/// Build one SYN probe frame. Source and destination must be the same
/// address family.
pub fn build_syn(
    src_mac: &MacAddress,
    dst_mac: &MacAddress,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
) -> Result<Vec<u8>, ScanError> {
    let eth = PacketBuilder::ethernet2(src_mac.octets(), dst_mac.octets());
    match (src_ip, dst_ip) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let mut ip = Ipv4Header::new(0, 128, IpNumber::TCP, src.octets(), dst.octets())
                .map_err(|e| ScanError::Packet(e.to_string()))?;
            ip.identification = rand::thread_rng().gen_range(40_000..50_000);
            ip.dont_fragment = true;
            let builder = eth
                .ip(IpHeaders::Ipv4(ip, Default::default()))
                .tcp(src_port, dst_port, seq, TCP_WINDOW)
                .syn()
                .options(&SYN_OPTIONS)
                .map_err(|e| ScanError::Packet(e.to_string()))?;
            let mut frame = Vec::with_capacity(builder.size(0));
            builder
                .write(&mut frame, &[])
                .map_err(|e| ScanError::Packet(e.to_string()))?;
            Ok(frame)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let builder = eth
                .ipv6(src.octets(), dst.octets(), 64)
                .tcp(src_port, dst_port, seq, TCP_WINDOW)
                .syn()
                .options(&SYN_OPTIONS)
                .map_err(|e| ScanError::Packet(e.to_string()))?;
            let mut frame = Vec::with_capacity(builder.size(0));
            builder
                .write(&mut frame, &[])
                .map_err(|e| ScanError::Packet(e.to_string()))?;
            Ok(frame)
        }
        _ => Err(ScanError::Packet(
            "source and destination address families differ".into(),
        )),
    }
}

/// Build the RST+ACK sent back after a SYN-ACK so the remote stack does
/// not retain a half-open connection (this scanner never completes a
/// handshake). `seq` must be the peer's acknowledgment number and `ack`
/// the peer's sequence number plus one.
pub fn build_rst(
    src_mac: &MacAddress,
    dst_mac: &MacAddress,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
) -> Result<Vec<u8>, ScanError> {
    let eth = PacketBuilder::ethernet2(src_mac.octets(), dst_mac.octets());
    let mut frame = Vec::new();
    match (src_ip, dst_ip) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => eth
            .ipv4(src.octets(), dst.octets(), 64)
            .tcp(src_port, dst_port, seq, 0)
            .rst()
            .ack(ack)
            .write(&mut frame, &[])
            .map_err(|e| ScanError::Packet(e.to_string()))?,
        (IpAddr::V6(src), IpAddr::V6(dst)) => eth
            .ipv6(src.octets(), dst.octets(), 64)
            .tcp(src_port, dst_port, seq, 0)
            .rst()
            .ack(ack)
            .write(&mut frame, &[])
            .map_err(|e| ScanError::Packet(e.to_string()))?,
        _ => {
            return Err(ScanError::Packet(
                "source and destination address families differ".into(),
            ))
        }
    }
    Ok(frame)
}

/// Decoded view of a TCP frame, used by the receive loop for reply
/// correlation and by tests for round-trip checks.
#[derive(Debug, Clone)]
pub struct TcpFrame {
    pub src_mac: MacAddress,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack_no: u32,
    pub syn: bool,
    pub ack: bool,
    pub rst: bool,
}

/// Opportunistic decode. Returns `None` for anything that is not a plain
/// Ethernet + IPv4/IPv6 + TCP frame; unknown traffic is cheap to discard.
pub fn parse_tcp_frame(frame: &[u8]) -> Option<TcpFrame> {
    let sliced = SlicedPacket::from_ethernet(frame).ok()?;
    let src_mac = match &sliced.link {
        Some(LinkSlice::Ethernet2(eth)) => MacAddress::new(eth.source()),
        _ => return None,
    };
    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(v4)) => (
            IpAddr::V4(v4.header().source_addr()),
            IpAddr::V4(v4.header().destination_addr()),
        ),
        Some(NetSlice::Ipv6(v6)) => (
            IpAddr::V6(v6.header().source_addr()),
            IpAddr::V6(v6.header().destination_addr()),
        ),
        _ => return None,
    };
    let tcp = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => tcp,
        _ => return None,
    };
    Some(TcpFrame {
        src_mac,
        src_ip,
        dst_ip,
        src_port: tcp.source_port(),
        dst_port: tcp.destination_port(),
        seq: tcp.sequence_number(),
        ack_no: tcp.acknowledgment_number(),
        syn: tcp.syn(),
        ack: tcp.ack(),
        rst: tcp.rst(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn macs() -> (MacAddress, MacAddress) {
        (
            MacAddress::new([0xaa, 0x41, 0x72, 0x51, 0x54, 0x42]),
            MacAddress::new([0xe2, 0xf9, 0xf6, 0xdb, 0x38, 0x4a]),
        )
    }

    #[test]
    fn syn_probe_roundtrip() {
        let (src_mac, dst_mac) = macs();
        let frame = build_syn(
            &src_mac,
            &dst_mac,
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 2)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            49123,
            443,
            500_123,
        )
        .unwrap();

        let decoded = parse_tcp_frame(&frame).unwrap();
        assert_eq!(decoded.dst_ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(decoded.dst_port, 443);
        assert_eq!(decoded.src_port, 49123);
        assert_eq!(decoded.seq, 500_123);
        assert!(decoded.syn);
        assert!(!decoded.ack);
        assert_eq!(decoded.src_mac, src_mac);
    }

    #[test]
    fn rst_carries_peer_ack_and_seq_plus_one() {
        let (src_mac, dst_mac) = macs();
        let frame = build_rst(
            &src_mac,
            &dst_mac,
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 2)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            49123,
            443,
            777,
            1001,
        )
        .unwrap();
        let decoded = parse_tcp_frame(&frame).unwrap();
        assert!(decoded.rst);
        assert!(decoded.ack);
        assert_eq!(decoded.seq, 777);
        assert_eq!(decoded.ack_no, 1001);
    }

    #[test]
    fn mixed_families_rejected() {
        let (src_mac, dst_mac) = macs();
        let err = build_syn(
            &src_mac,
            &dst_mac,
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 2)),
            "fe80::1".parse().unwrap(),
            49123,
            443,
            1,
        );
        assert!(err.is_err());
    }

    #[test]
    fn probe_port_range_bounds() {
        assert!(!in_probe_port_range(SOURCE_PORT_FIRST - 1));
        assert!(in_probe_port_range(SOURCE_PORT_FIRST));
        assert!(in_probe_port_range(SOURCE_PORT_LAST));
        assert!(!in_probe_port_range(SOURCE_PORT_LAST + 1));
        for _ in 0..64 {
            assert!(in_probe_port_range(random_probe_source_port()));
        }
    }
}
