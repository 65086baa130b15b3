//! ARP framing for IPv4 next-hop resolution.
//!
//! etherparse does not model ARP, and the body is a fixed 28-byte layout,
//! so requests and replies are assembled by hand.

use std::net::Ipv4Addr;

use crate::net::MacAddress;

pub const OP_REQUEST: u16 = 1;
pub const OP_REPLY: u16 = 2;

const ETHERTYPE_ARP: [u8; 2] = [0x08, 0x06];
/// Ethernet header (14) + ARP body (28).
pub const FRAME_LEN: usize = 42;

fn write_frame(
    eth_dst: &MacAddress,
    op: u16,
    sender_mac: &MacAddress,
    sender_ip: Ipv4Addr,
    target_mac: &MacAddress,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_LEN);
    frame.extend_from_slice(&eth_dst.octets());
    frame.extend_from_slice(&sender_mac.octets());
    frame.extend_from_slice(&ETHERTYPE_ARP);
    frame.extend_from_slice(&1u16.to_be_bytes()); // hardware type: Ethernet
    frame.extend_from_slice(&[0x08, 0x00]); // protocol type: IPv4
    frame.push(6); // hardware address length
    frame.push(4); // protocol address length
    frame.extend_from_slice(&op.to_be_bytes());
    frame.extend_from_slice(&sender_mac.octets());
    frame.extend_from_slice(&sender_ip.octets());
    frame.extend_from_slice(&target_mac.octets());
    frame.extend_from_slice(&target_ip.octets());
    frame
}

/// Broadcast who-has request for `target_ip`.
pub fn build_request(src_mac: &MacAddress, src_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    write_frame(
        &MacAddress::broadcast(),
        OP_REQUEST,
        src_mac,
        src_ip,
        &MacAddress::new([0; 6]),
        target_ip,
    )
}

/// Self-addressed reply used purely to wake the blocking capture read
/// during shutdown; it never leaves the host's link in any meaningful way
/// and no peer reacts to it.
pub fn build_self_addressed(src_mac: &MacAddress, src_ip: Ipv4Addr) -> Vec<u8> {
    write_frame(src_mac, OP_REPLY, src_mac, src_ip, src_mac, src_ip)
}

#[derive(Debug, Clone, Copy)]
pub struct ArpSender {
    pub mac: MacAddress,
    pub ip: Ipv4Addr,
}

/// Extract the sender hardware/protocol addresses from an ARP frame.
///
/// Both requests and replies carry a usable sender mapping, so the
/// opcode is not checked.
pub fn parse_sender(frame: &[u8]) -> Option<ArpSender> {
    if frame.len() < FRAME_LEN || frame[12..14] != ETHERTYPE_ARP {
        return None;
    }
    let body = &frame[14..];
    // Ethernet/IPv4 ARP only.
    if body[0..2] != [0, 1] || body[2..4] != [0x08, 0x00] || body[4] != 6 || body[5] != 4 {
        return None;
    }
    let mac = MacAddress::from_slice(&body[8..14])?;
    let ip = Ipv4Addr::new(body[14], body[15], body[16], body[17]);
    Some(ArpSender { mac, ip })
}
