use std::net::IpAddr;

use crate::error::ScanError;

/// Lowest accepted target rate, packets per second.
pub const MIN_ACCEPTED_RATE: u32 = 10;

/// Scanner configuration. Read-only for the engine once construction
/// succeeds; lifetime is one scanner instance.
#[derive(Clone, Debug)]
pub struct ScannerOption {
    /// Target send rate in packets per second.
    pub rate: u32,
    /// Floor the adaptive controller will never go below.
    pub min_rate: u32,
    /// Response timeout in milliseconds. Also drives the watch-table TTL.
    pub timeout_ms: u64,
    /// Explicit next-hop gateway. When set, route discovery is skipped and
    /// the interface owning the hop's subnet is used.
    pub next_hop: Option<IpAddr>,
    /// Emit rate-controller decisions at debug level.
    pub debug: bool,
    /// Run service identification on discovered ports.
    pub fingerprint: bool,
    /// Run the HTTP probe on discovered ports.
    pub httpx: bool,
    /// Capacity of the internal result queue feeding the fingerprint and
    /// output stages. Queue occupancy drives the adaptive rate controller.
    pub queue_cap: usize,
}

impl Default for ScannerOption {
    fn default() -> Self {
        Self {
            rate: 1500,
            min_rate: MIN_ACCEPTED_RATE,
            timeout_ms: 800,
            next_hop: None,
            debug: false,
            fingerprint: false,
            httpx: false,
            queue_cap: 65535,
        }
    }
}

impl ScannerOption {
    /// Fail-fast validation, run once at scanner construction.
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.rate < MIN_ACCEPTED_RATE {
            return Err(ScanError::InvalidRate {
                got: self.rate,
                min: MIN_ACCEPTED_RATE,
            });
        }
        if self.min_rate > self.rate {
            return Err(ScanError::InvalidRate {
                got: self.min_rate,
                min: MIN_ACCEPTED_RATE,
            });
        }
        if self.timeout_ms == 0 {
            return Err(ScanError::InvalidTimeout);
        }
        Ok(())
    }
}
