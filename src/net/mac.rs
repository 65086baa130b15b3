use std::net::Ipv6Addr;

use eui48::ParseError;

/// Ethernet hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(eui48::MacAddress);

impl MacAddress {
    pub fn broadcast() -> Self {
        Self::new([0xff; 6])
    }

    pub fn new(bytes: [u8; 6]) -> Self {
        MacAddress(eui48::MacAddress::new(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 6] = bytes.try_into().ok()?;
        Some(Self::new(arr))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0.to_array()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn parse_str(s: &str) -> Result<Self, ParseError> {
        eui48::MacAddress::parse_str(s).map(Self)
    }

    /// Reconstruct the MAC embedded in a SLAAC-style IPv6 address.
    ///
    /// Only link-local (fe80::/10), 6to4 (2002::/16) and multicast
    /// (ff00::/8) prefixes are considered, and the interface identifier
    /// must carry the EUI-64 universal/local bit. Returns `None` when the
    /// address does not embed a MAC, in which case the caller falls back to
    /// a neighbor solicitation on the wire.
    pub fn from_slaac(ip: Ipv6Addr) -> Option<Self> {
        let o = ip.octets();
        let slaac_prefix = (o[0] == 0xfe && (o[1] & 0xc0) == 0x80)
            || (o[0] == 0x20 && o[1] == 0x02)
            || o[0] == 0xff;
        if !slaac_prefix {
            return None;
        }

        // Interface identifier = last 8 bytes, with ff:fe in the middle and
        // the U/L bit flipped in the first octet.
        let iid = &o[8..16];
        if iid[0] & 0x02 != 0x02 {
            return None;
        }
        Some(Self::new([
            iid[0] ^ 0x02,
            iid[1],
            iid[2],
            iid[5],
            iid[6],
            iid[7],
        ]))
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_hex_string())
    }
}

// eui48's derived Debug is verbose; reuse the hex form.
impl std::fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slaac_link_local_roundtrip() {
        // fe80::0211:22ff:fe33:4455 embeds 00:11:22:33:44:55
        let ip: Ipv6Addr = "fe80::211:22ff:fe33:4455".parse().unwrap();
        let mac = MacAddress::from_slaac(ip).unwrap();
        assert_eq!(mac, MacAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]));
    }

    #[test]
    fn non_slaac_prefix_rejected() {
        let ip: Ipv6Addr = "2001:db8::211:22ff:fe33:4455".parse().unwrap();
        assert!(MacAddress::from_slaac(ip).is_none());
    }

    #[test]
    fn missing_universal_bit_rejected() {
        // First IID octet 0x00: U/L bit clear, not an EUI-64 expansion.
        let ip: Ipv6Addr = "fe80::11:22ff:fe33:4455".parse().unwrap();
        assert!(MacAddress::from_slaac(ip).is_none());
    }
}
