//! IPv6 neighbor discovery framing.
//!
//! Covers only what the scanner needs: building a neighbor solicitation
//! for an unresolved next hop and reading the target link-layer address
//! option out of a neighbor advertisement. Extension headers are not
//! handled; a solicited advertisement never carries them.

use std::net::Ipv6Addr;

use crate::net::MacAddress;

const ETHERTYPE_IPV6: [u8; 2] = [0x86, 0xdd];
const ICMPV6: u8 = 58;
const TYPE_NEIGHBOR_SOLICIT: u8 = 135;
const TYPE_NEIGHBOR_ADVERT: u8 = 136;
const OPT_SOURCE_LINK_ADDR: u8 = 1;
const OPT_TARGET_LINK_ADDR: u8 = 2;

const ETH_LEN: usize = 14;
const IPV6_LEN: usize = 40;
/// NS/NA body: type, code, checksum, 4 reserved/flag bytes, 16-byte
/// target, one 8-byte link-layer option.
const ICMP_LEN: usize = 32;

/// Solicited-node multicast address for a target (ff02::1:ffXX:XXXX).
fn solicited_node(target: Ipv6Addr) -> Ipv6Addr {
    let o = target.octets();
    Ipv6Addr::from([
        0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0xff, o[13], o[14], o[15],
    ])
}

/// ICMPv6 checksum over the IPv6 pseudo-header and the message body.
fn checksum(src: Ipv6Addr, dst: Ipv6Addr, body: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in src.octets().chunks(2).chain(dst.octets().chunks(2)) {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    let len = body.len() as u32;
    sum += len >> 16;
    sum += len & 0xffff;
    sum += u32::from(ICMPV6);
    for chunk in body.chunks(2) {
        sum += u32::from(u16::from_be_bytes([chunk[0], *chunk.get(1).unwrap_or(&0)]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build a neighbor solicitation for `target`, multicast to its
/// solicited-node group with our MAC as the source link-layer option.
pub fn build_neighbor_solicit(
    src_mac: &MacAddress,
    src_ip: Ipv6Addr,
    target: Ipv6Addr,
) -> Vec<u8> {
    let t = target.octets();
    let dst_ip = solicited_node(target);

    let mut body = Vec::with_capacity(ICMP_LEN);
    body.extend_from_slice(&[TYPE_NEIGHBOR_SOLICIT, 0, 0, 0, 0, 0, 0, 0]);
    body.extend_from_slice(&t);
    body.extend_from_slice(&[OPT_SOURCE_LINK_ADDR, 1]);
    body.extend_from_slice(&src_mac.octets());
    let ck = checksum(src_ip, dst_ip, &body);
    body[2..4].copy_from_slice(&ck.to_be_bytes());

    let mut frame = Vec::with_capacity(ETH_LEN + IPV6_LEN + ICMP_LEN);
    frame.extend_from_slice(&[0x33, 0x33, 0xff, t[13], t[14], t[15]]);
    frame.extend_from_slice(&src_mac.octets());
    frame.extend_from_slice(&ETHERTYPE_IPV6);
    frame.extend_from_slice(&[0x60, 0, 0, 0]); // version 6, no traffic class/flow
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.push(ICMPV6);
    frame.push(255); // hop limit, required by RFC 4861 for ND
    frame.extend_from_slice(&src_ip.octets());
    frame.extend_from_slice(&dst_ip.octets());
    frame.extend_from_slice(&body);
    frame
}

/// Target address and link-layer address from a neighbor advertisement.
pub fn parse_neighbor_advert(frame: &[u8]) -> Option<(Ipv6Addr, MacAddress)> {
    if frame.len() < ETH_LEN + IPV6_LEN + ICMP_LEN || frame[12..14] != ETHERTYPE_IPV6 {
        return None;
    }
    let ip6 = &frame[ETH_LEN..ETH_LEN + IPV6_LEN];
    if ip6[6] != ICMPV6 {
        return None;
    }
    let icmp = &frame[ETH_LEN + IPV6_LEN..];
    if icmp[0] != TYPE_NEIGHBOR_ADVERT {
        return None;
    }
    let target_bytes: [u8; 16] = icmp[8..24].try_into().ok()?;
    let target = Ipv6Addr::from(target_bytes);

    // Walk the options for the target link-layer address.
    let mut rest = &icmp[24..];
    while rest.len() >= 8 {
        let opt_len = usize::from(rest[1]) * 8;
        if opt_len == 0 || opt_len > rest.len() {
            return None;
        }
        if rest[0] == OPT_TARGET_LINK_ADDR && opt_len >= 8 {
            return MacAddress::from_slice(&rest[2..8]).map(|mac| (target, mac));
        }
        rest = &rest[opt_len..];
    }
    None
}
