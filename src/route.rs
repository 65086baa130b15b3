//! Outbound route discovery.
//!
//! Given the first target IP (or an explicit next hop), picks the capture
//! device, its source addresses and MAC, and the gateway IP the probes
//! must be framed toward. Targets inside a directly connected subnet get
//! no gateway and are ARP-resolved individually.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use log::debug;
use pcap::Device;

use crate::error::ScanError;
use crate::net::{self, MacAddress};

/// `RTF_UP | RTF_GATEWAY` in /proc/net/route flags.
const RTF_UP_GATEWAY: u32 = 0x3;

/// Everything the scanner needs to know about its egress path.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub dev_name: String,
    pub src_ip: Ipv4Addr,
    pub src_ip6: Option<Ipv6Addr>,
    pub src_mac: MacAddress,
    /// `None` when targets are on a directly connected subnet; each
    /// target is then resolved by ARP/NDP itself.
    pub gw_ip: Option<IpAddr>,
}

struct DeviceAddrs {
    name: String,
    v4: Vec<(Ipv4Addr, Ipv4Addr)>, // (address, netmask)
    v6: Vec<Ipv6Addr>,
}

fn usable_devices() -> Result<Vec<DeviceAddrs>, ScanError> {
    let mut out = Vec::new();
    for dev in Device::list()? {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for addr in &dev.addresses {
            match (addr.addr, addr.netmask) {
                (IpAddr::V4(ip), Some(IpAddr::V4(mask))) if !ip.is_loopback() => {
                    v4.push((ip, mask));
                }
                (IpAddr::V6(ip), _) if !ip.is_loopback() => v6.push(ip),
                _ => {}
            }
        }
        if !v4.is_empty() || !v6.is_empty() {
            out.push(DeviceAddrs {
                name: dev.name,
                v4,
                v6,
            });
        }
    }
    Ok(out)
}

pub fn ipv4_in_subnet(ip: Ipv4Addr, addr: Ipv4Addr, mask: Ipv4Addr) -> bool {
    let ip = u32::from(ip);
    let addr = u32::from(addr);
    let mask = u32::from(mask);
    ip & mask == addr & mask
}

/// Default IPv4 gateway from the kernel route table text
/// (/proc/net/route). Fields are little-endian hex; a default route has
/// destination 0 and the gateway flag set.
pub fn parse_default_gateway(contents: &str) -> Option<Ipv4Addr> {
    for line in contents.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let dest = u32::from_str_radix(fields[1], 16).ok()?;
        let gw = u32::from_str_radix(fields[2], 16).ok()?;
        let flags = u32::from_str_radix(fields[3], 16).ok()?;
        if dest == 0 && flags & RTF_UP_GATEWAY == RTF_UP_GATEWAY && gw != 0 {
            // Little-endian in procfs.
            return Some(Ipv4Addr::from(gw.swap_bytes()));
        }
    }
    None
}

fn default_gateway() -> Result<Ipv4Addr, ScanError> {
    let contents = std::fs::read_to_string("/proc/net/route")?;
    parse_default_gateway(&contents)
        .ok_or_else(|| ScanError::NoRoute("no default gateway in /proc/net/route".into()))
}

fn build(dev: &DeviceAddrs, gw_ip: Option<IpAddr>) -> Result<ResolvedRoute, ScanError> {
    let (src_ip, _) = *dev
        .v4
        .first()
        .ok_or_else(|| ScanError::NoRoute(format!("{} has no IPv4 address", dev.name)))?;
    let src_mac = net::get_interface_mac(&dev.name)?;
    let route = ResolvedRoute {
        dev_name: dev.name.clone(),
        src_ip,
        src_ip6: dev.v6.first().copied(),
        src_mac,
        gw_ip,
    };
    debug!(
        "route: dev={} src={} gw={:?}",
        route.dev_name, route.src_ip, route.gw_ip
    );
    Ok(route)
}

/// Resolve the egress route for a scan whose first target is `first_ip`.
///
/// With an explicit `next_hop` the kernel route table is not consulted:
/// the device owning the hop's subnet is used and every probe is framed
/// to that hop's MAC.
pub fn resolve_route(first_ip: IpAddr, next_hop: Option<IpAddr>) -> Result<ResolvedRoute, ScanError> {
    let devices = usable_devices()?;

    if let Some(hop) = next_hop {
        let dev = match hop {
            IpAddr::V4(hop4) => devices
                .iter()
                .find(|d| d.v4.iter().any(|&(a, m)| ipv4_in_subnet(hop4, a, m))),
            // An IPv6 hop must be link-reachable; any device with a v6
            // address will do since NDP resolves it on that link.
            IpAddr::V6(_) => devices.iter().find(|d| !d.v6.is_empty()),
        };
        return dev
            .ok_or_else(|| ScanError::NoRoute(format!("no interface can reach next hop {hop}")))
            .and_then(|d| build(d, Some(hop)));
    }

    match first_ip {
        IpAddr::V4(ip4) => {
            // Directly connected subnet: no gateway, per-target ARP.
            if let Some(dev) = devices
                .iter()
                .find(|d| d.v4.iter().any(|&(a, m)| ipv4_in_subnet(ip4, a, m)))
            {
                return build(dev, None);
            }
            let gw = default_gateway()?;
            devices
                .iter()
                .find(|d| d.v4.iter().any(|&(a, m)| ipv4_in_subnet(gw, a, m)))
                .ok_or_else(|| {
                    ScanError::NoRoute(format!("no interface owns gateway {gw}'s subnet"))
                })
                .and_then(|d| build(d, Some(IpAddr::V4(gw))))
        }
        IpAddr::V6(_) => {
            // Link-local scanning only; off-link IPv6 needs an explicit
            // next hop.
            devices
                .iter()
                .find(|d| !d.v6.is_empty())
                .ok_or_else(|| ScanError::NoRoute("no IPv6-capable interface".into()))
                .and_then(|d| build(d, None))
        }
    }
}
