use std::net::IpAddr;

/// Errors surfaced by the SYN-scan engine.
///
/// Configuration and routing variants are fatal at construction time.
/// Resolution variants (`ArpPending`, `ArpTimeout`) are local to a single
/// `scan` call: the probe is dropped and scanning continues for other
/// targets.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("rate can not be set below {min} packets/s (got {got})")]
    InvalidRate { got: u32, min: u32 },

    #[error("response timeout can not be zero")]
    InvalidTimeout,

    #[error("no usable route: {0}")]
    NoRoute(String),

    #[error("neighbor resolution for {0} is already in flight")]
    ArpPending(IpAddr),

    #[error("timeout waiting for ARP/NDP reply from {0}")]
    ArpTimeout(IpAddr),

    #[error("scanner is closed")]
    ScannerClosed,

    #[error("capture error: {0}")]
    Capture(String),

    #[error("packet build error: {0}")]
    Packet(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<pcap::Error> for ScanError {
    fn from(e: pcap::Error) -> Self {
        ScanError::Capture(e.to_string())
    }
}
