use libc::{c_void, sendto, sockaddr, sockaddr_ll, AF_PACKET, ETH_P_ALL, SOCK_RAW};
use socket2::Socket;
use std::os::unix::io::AsRawFd;

use super::MacAddress;
use crate::error::ScanError;

/// AF_PACKET socket used to transmit pre-built Ethernet frames.
///
/// Requires CAP_NET_RAW (or root). Reception goes through the capture
/// handle instead so that a BPF filter can discard irrelevant traffic
/// before it reaches userspace.
pub struct RawEthSocket {
    inner: Socket,
    interface_index: i32,
}

impl RawEthSocket {
    /// ETH_P_ALL in network byte order, as both socket(2) and
    /// sockaddr_ll expect it.
    const PROTO: u16 = (ETH_P_ALL as u16).to_be();

    pub fn new(interface_index: i32) -> Result<Self, ScanError> {
        let inner = Socket::new(
            AF_PACKET.into(),
            SOCK_RAW.into(),
            Some(i32::from(Self::PROTO).into()),
        )?;
        Ok(Self {
            inner,
            interface_index,
        })
    }

    /// Write one raw frame to the wire, addressed to `dst` on the bound
    /// interface.
    pub fn sendto(&self, frame: &[u8], dst: &MacAddress) -> Result<(), ScanError> {
        let mut addr = sockaddr_ll {
            sll_family: AF_PACKET as u16,
            sll_protocol: Self::PROTO,
            sll_ifindex: self.interface_index,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 6,
            sll_addr: [0; 8],
        };
        addr.sll_addr[..6].copy_from_slice(dst.as_bytes());

        let result = unsafe {
            sendto(
                self.inner.as_raw_fd(),
                frame.as_ptr() as *const c_void,
                frame.len(),
                0,
                &addr as *const sockaddr_ll as *const sockaddr,
                std::mem::size_of::<sockaddr_ll>() as u32,
            )
        };

        if result < 0 {
            Err(std::io::Error::last_os_error().into())
        } else {
            Ok(())
        }
    }
}
