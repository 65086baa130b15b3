//! Wire abstraction for the send and receive paths.
//!
//! Production scanners transmit through an AF_PACKET socket and read from a
//! pcap handle with a BPF filter installed. Tests drive the same engine
//! over an in-memory wire, so both halves are traits.

use log::debug;
use pcap::{Active, Capture, Device};

use super::socket::RawEthSocket;
use super::MacAddress;
use crate::error::ScanError;

/// Transmit half of the wire. Shared by the send path, the RST reply in
/// the receive loop and the shutdown unblock frame.
pub trait FrameSink: Send + Sync {
    fn transmit(&self, frame: &[u8]) -> Result<(), ScanError>;
}

/// Receive half of the wire, owned by the receive loop's thread.
///
/// `next_frame` blocks until a frame arrives. `Err(ScanError::ScannerClosed)`
/// means the wire is gone and the loop must exit; any other error is
/// transient and the loop continues.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Vec<u8>, ScanError>;
}

/// BPF filter keeping only frames the receive loop cares about: ARP,
/// IPv4 SYN-ACK replies, and IPv6 SYN-ACK or neighbor advertisements,
/// all addressed to our MAC.
pub fn bpf_filter(src_mac: &MacAddress) -> String {
    format!(
        "ether dst {} and (arp or tcp[13] == 18 or (ip6 and (ip6[53] == 18 or ip6[40] == 136)))",
        src_mac
    )
}

/// Sink writing frames through an AF_PACKET socket. The link-layer
/// destination is taken from the frame's own Ethernet header.
pub struct EthFrameSink {
    socket: RawEthSocket,
}

impl EthFrameSink {
    pub fn new(interface_index: i32) -> Result<Self, ScanError> {
        Ok(Self {
            socket: RawEthSocket::new(interface_index)?,
        })
    }
}

impl FrameSink for EthFrameSink {
    fn transmit(&self, frame: &[u8]) -> Result<(), ScanError> {
        let dst = MacAddress::from_slice(frame.get(..6).ok_or_else(|| {
            ScanError::Packet("frame shorter than an Ethernet header".into())
        })?)
        .ok_or_else(|| ScanError::Packet("bad destination MAC".into()))?;
        self.socket.sendto(frame, &dst)
    }
}

/// Blocking pcap reader.
///
/// Opened with no read timeout, so `next_packet` blocks until traffic
/// arrives. On Linux such a read cannot be cleanly interrupted; shutdown
/// transmits one throwaway self-addressed ARP frame, which passes the BPF
/// filter and wakes the reader so it can observe the done flag.
pub struct PcapSource {
    cap: Capture<Active>,
}

impl PcapSource {
    const SNAPLEN: i32 = 1024;

    pub fn open(dev_name: &str, filter: &str) -> Result<Self, ScanError> {
        let device = find_device_by_name(dev_name)?;
        let mut cap = Capture::from_device(device)?
            .promisc(false)
            .snaplen(Self::SNAPLEN)
            .timeout(0)
            .open()?;
        cap.filter(filter, true)?;
        debug!("opened capture on {} with filter {:?}", dev_name, filter);
        Ok(Self { cap })
    }
}

impl FrameSource for PcapSource {
    fn next_frame(&mut self) -> Result<Vec<u8>, ScanError> {
        match self.cap.next_packet() {
            Ok(packet) => Ok(packet.data.to_vec()),
            Err(pcap::Error::NoMorePackets) => Err(ScanError::ScannerClosed),
            Err(e) => Err(ScanError::Capture(e.to_string())),
        }
    }
}

/// Find a pcap capture device by name.
pub fn find_device_by_name(name: &str) -> Result<Device, ScanError> {
    Device::list()?
        .into_iter()
        .find(|d| d.name == name)
        .ok_or_else(|| ScanError::NoRoute(format!("no capture device named {}", name)))
}
