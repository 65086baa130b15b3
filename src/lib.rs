//! Stateless SYN-scan engine.
//!
//! Probes are raw Ethernet frames: a SYN goes out per target port, the
//! receive loop classifies SYN-ACKs as open and answers them with a reset
//! so no handshake ever completes. Discovered ports stream out over a
//! channel; optional connect-based fingerprinting runs downstream of
//! discovery and shares the same rate budget.
//!
//! ```no_run
//! use std::net::IpAddr;
//! use synscan::{IpOption, Scanner, ScannerOption, SynScanner};
//!
//! # fn main() -> Result<(), synscan::ScanError> {
//! let target: IpAddr = "192.168.1.0".parse().unwrap();
//! let (tx, rx) = crossbeam_channel::bounded(1024);
//! let scanner = SynScanner::new(target, tx, ScannerOption::default())?;
//!
//! let printer = std::thread::spawn(move || {
//!     for open in rx {
//!         println!("{open}");
//!     }
//! });
//! for host in 1..=254u8 {
//!     let ip: IpAddr = format!("192.168.1.{host}").parse().unwrap();
//!     for port in [22, 80, 443] {
//!         scanner.wait_limiter()?;
//!         if let Err(e) = scanner.scan(ip, port, IpOption::default()) {
//!             log::warn!("probe {ip}:{port} skipped: {e}");
//!         }
//!     }
//! }
//! scanner.wait();
//! scanner.close();
//! printer.join().unwrap();
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::net::IpAddr;

pub mod config;
pub mod error;
pub mod net;
pub mod packet;
pub mod probe;
pub mod route;
pub mod syn;

mod limiter;
mod watch_ip;
mod watch_mac;

pub use config::{ScannerOption, MIN_ACCEPTED_RATE};
pub use error::ScanError;
pub use probe::{HttpInfo, PortProber, ServiceIdent};
pub use syn::SynScanner;

/// Per-target scan options, captured when the target is first probed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpOption {
    /// Identify the service on each discovered port.
    pub fingerprint: bool,
    /// Run the HTTP probe on each discovered port.
    pub httpx: bool,
}

/// A discovered open port, with whatever enrichment was requested for it.
#[derive(Debug, Clone)]
pub struct OpenIpPort {
    pub ip: IpAddr,
    pub port: u16,
    pub opt: IpOption,
    pub service: Option<String>,
    pub banner: Option<Vec<u8>>,
    pub http_info: Option<HttpInfo>,
}

impl fmt::Display for OpenIpPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)?;
        if let Some(service) = &self.service {
            write!(f, " {service}")?;
        }
        if let Some(info) = &self.http_info {
            write!(f, " {info}")?;
        }
        Ok(())
    }
}

/// The scanning surface. One method per probe; pacing is explicit so the
/// engine never blocks inside `scan`.
pub trait Scanner {
    /// Send one SYN probe to `ip:port`. Non-blocking apart from first-time
    /// neighbor resolution of a directly connected target.
    fn scan(&self, ip: IpAddr, port: u16, opt: IpOption) -> Result<(), ScanError>;

    /// Block until the rate limiter grants one probe. Call before each
    /// `scan`.
    fn wait_limiter(&self) -> Result<(), ScanError>;

    /// Block until in-flight replies have been collected and enrichment
    /// workers have finished.
    fn wait(&self);

    /// Stop the engine and release the wire. Idempotent.
    fn close(&self);
}
