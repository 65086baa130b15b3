pub mod capture;
pub mod mac;
pub mod socket;

use std::fs;

pub use mac::MacAddress;

use crate::error::ScanError;

/// Kernel interface index for a device name, read from sysfs.
pub fn get_interface_index(name: &str) -> Result<i32, ScanError> {
    let path = format!("/sys/class/net/{}/ifindex", name);
    fs::read_to_string(&path)?
        .trim()
        .parse()
        .map_err(|e| ScanError::NoRoute(format!("bad ifindex in {}: {}", path, e)))
}

/// Hardware address of a device, read from sysfs.
pub fn get_interface_mac(name: &str) -> Result<MacAddress, ScanError> {
    let path = format!("/sys/class/net/{}/address", name);
    let raw = fs::read_to_string(&path)?;
    MacAddress::parse_str(raw.trim())
        .map_err(|e| ScanError::NoRoute(format!("bad mac in {}: {}", path, e)))
}
