//! Host port selection for NAT-mode SSH forwarding.

use std::net::{Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;

use crate::error::VmError;

const SCAN_RANGE: RangeInclusive<u16> = 2222..=9999;

/// Commonly used development ports never handed out by the scan.
const SKIPPED: [u16; 8] = [3000, 3306, 5000, 5432, 8000, 8080, 8443, 9000];

/// True when a listener can bind `127.0.0.1:port` right now.
pub fn is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// `preferred` if it is free, otherwise the first free port in the scan
/// range. The port is released again before returning, so a racing process
/// can still take it; QEMU then fails to start and reports the conflict.
pub fn allocate(preferred: u16) -> Result<u16, VmError> {
    if preferred > 0 && is_free(preferred) {
        return Ok(preferred);
    }
    SCAN_RANGE
        .filter(|p| !SKIPPED.contains(p))
        .find(|p| is_free(*p))
        .inspect(|port| tracing::debug!(preferred, port, "preferred port busy, using another"))
        .ok_or_else(|| VmError::DependencyMissing {
            what: format!("free TCP port in {}-{}", SCAN_RANGE.start(), SCAN_RANGE.end()),
            hint: "stop a VM or other service to release a port".into(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_preferred_port_is_returned() {
        // Ask the OS for a port that is free right now.
        let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        assert_eq!(allocate(port).unwrap(), port);
    }

    #[test]
    fn busy_preferred_port_is_skipped() {
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy = held.local_addr().unwrap().port();
        let port = allocate(busy).unwrap();
        assert_ne!(port, busy);
        assert!(SCAN_RANGE.contains(&port));
        assert!(!SKIPPED.contains(&port));
    }

    #[test]
    fn zero_means_scan() {
        let port = allocate(0).unwrap();
        assert!(SCAN_RANGE.contains(&port));
    }
}
