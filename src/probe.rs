//! Post-discovery enrichment hooks.
//!
//! The SYN engine itself never completes a handshake; service
//! identification and HTTP probing are full-connect operations supplied
//! by the caller through [`PortProber`]. Probe traffic shares the
//! scanner's rate limiter so the combined packet rate stays within the
//! configured budget.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Result of banner-based service identification.
#[derive(Debug, Clone, Default)]
pub struct ServiceIdent {
    /// Service name, e.g. "ssh" or "http". Empty when unidentified.
    pub name: String,
    /// Raw banner bytes, when the service volunteered any.
    pub banner: Option<Vec<u8>>,
}

/// Facts collected by an HTTP(S) probe of an open port.
#[derive(Debug, Clone, Default)]
pub struct HttpInfo {
    pub status_code: u16,
    pub content_len: usize,
    pub url: String,
    pub location: String,
    pub title: String,
    pub server: String,
    pub tls_common_name: Vec<String>,
    pub tls_dns_names: Vec<String>,
    pub fingers: Vec<String>,
}

impl fmt::Display for HttpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {} {}]",
            self.url, self.status_code, self.content_len
        )?;
        if !self.title.is_empty() {
            write!(f, " [title: {}]", self.title)?;
        }
        if !self.location.is_empty() {
            write!(f, " [location: {}]", self.location)?;
        }
        if !self.server.is_empty() {
            write!(f, " [server: {}]", self.server)?;
        }
        if !self.tls_common_name.is_empty() {
            write!(f, " [cert: {}]", self.tls_common_name.join(","))?;
        }
        if !self.tls_dns_names.is_empty() {
            write!(f, " [dns: {}]", self.tls_dns_names.join(","))?;
        }
        if !self.fingers.is_empty() {
            write!(f, " [finger: {}]", self.fingers.join(","))?;
        }
        Ok(())
    }
}

/// Caller-supplied prober run by the dispatch stage when `fingerprint`
/// or `httpx` is enabled for a target. Implementations must be safe to
/// call from multiple worker threads.
pub trait PortProber: Send + Sync {
    /// Identify the service listening on `ip:port`.
    fn identify_service(&self, ip: IpAddr, port: u16, timeout: Duration) -> ServiceIdent;

    /// HTTP(S) probe of `ip:port`. `None` when the port does not speak
    /// HTTP within the timeout.
    fn probe_http(&self, ip: IpAddr, port: u16, timeout: Duration) -> Option<HttpInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_info_display_skips_empty_fields() {
        let info = HttpInfo {
            status_code: 200,
            content_len: 512,
            url: "http://10.0.0.1:80".into(),
            title: "It works".into(),
            ..Default::default()
        };
        let s = info.to_string();
        assert_eq!(s, "[http://10.0.0.1:80 200 512] [title: It works]");
    }

    #[test]
    fn http_info_display_includes_tls_fields() {
        let info = HttpInfo {
            status_code: 302,
            content_len: 0,
            url: "https://10.0.0.1:443".into(),
            location: "https://10.0.0.1/login".into(),
            tls_common_name: vec!["internal.example".into()],
            ..Default::default()
        };
        let s = info.to_string();
        assert!(s.contains("[location: https://10.0.0.1/login]"));
        assert!(s.contains("[cert: internal.example]"));
    }
}
