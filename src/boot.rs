//! Boot-readiness detection from the guest's serial console log.
//!
//! The log is append-only and small, so every pass re-reads it from the
//! start. Ready is reported only when the sentinel line is present.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    /// No console output observed yet.
    Unknown,
    Booting,
    Ready,
    /// Deadline passed without the sentinel; the VM keeps running.
    TimedOut,
    /// Wait aborted by the caller; the VM keeps running.
    Interrupted,
}

/// The provisioning payload's output contract, kept apart from the polling
/// loop so the two can change independently.
pub trait ReadinessMatcher {
    /// True when `line` marks the end of first-boot provisioning.
    fn is_sentinel(&self, line: &str) -> bool;

    /// True when `line` reports on the primary interface, with or without
    /// an address.
    fn is_interface_info(&self, line: &str) -> bool;

    /// Candidate guest address carried by `line`, if any.
    fn address(&self, line: &str) -> Option<Ipv4Addr>;
}

/// Matches cloud-init's console output: the `final_message` sentinel and
/// the `ci-info` interface table.
#[derive(Debug, Clone)]
pub struct CloudInitMatcher {
    pub sentinel: String,
    pub interface: String,
}

impl CloudInitMatcher {
    pub fn new(sentinel: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
            interface: interface.into(),
        }
    }
}

impl ReadinessMatcher for CloudInitMatcher {
    fn is_sentinel(&self, line: &str) -> bool {
        line.contains(&self.sentinel)
    }

    fn is_interface_info(&self, line: &str) -> bool {
        line.contains("ci-info") && line.contains(&self.interface)
    }

    fn address(&self, line: &str) -> Option<Ipv4Addr> {
        if !self.is_interface_info(line) {
            return None;
        }
        line.split(|c: char| !(c.is_ascii_digit() || c == '.'))
            .filter_map(|token| token.parse::<Ipv4Addr>().ok())
            .find(|ip| is_private_candidate(*ip))
    }
}

/// `192.168.0.0/16` or `10.0.0.0/8`.
fn is_private_candidate(ip: Ipv4Addr) -> bool {
    matches!(ip.octets(), [192, 168, _, _] | [10, _, _, _])
}

/// Result of one pass over the console log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleScan {
    pub log_present: bool,
    pub ready: bool,
    /// An interface-info line for the primary interface was seen.
    pub network_seen: bool,
    /// First private address found in this pass.
    pub address: Option<Ipv4Addr>,
}

/// Single non-blocking pass. A missing or unreadable log is "nothing yet".
pub fn scan_console(path: &Path, matcher: &impl ReadinessMatcher) -> ConsoleScan {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(_) => return ConsoleScan::default(),
    };
    // Serial output may contain partial escape sequences.
    let text = String::from_utf8_lossy(&bytes);
    let mut scan = ConsoleScan {
        log_present: true,
        ..ConsoleScan::default()
    };
    for line in text.lines() {
        if matcher.is_sentinel(line) {
            scan.ready = true;
        }
        if matcher.is_interface_info(line) {
            scan.network_seen = true;
            if scan.address.is_none() {
                scan.address = matcher.address(line);
            }
        }
    }
    scan
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootReport {
    pub state: BootState,
    pub address: Option<Ipv4Addr>,
    pub elapsed: Duration,
}

pub struct BootWatcher<M> {
    matcher: M,
    interval: Duration,
}

impl<M: ReadinessMatcher> BootWatcher<M> {
    pub fn new(matcher: M, interval: Duration) -> Self {
        Self { matcher, interval }
    }

    pub fn scan(&self, log: &Path) -> ConsoleScan {
        scan_console(log, &self.matcher)
    }

    /// Poll `log` until the sentinel appears, `timeout` elapses, or `cancel`
    /// fires. Never touches the VM process.
    pub async fn wait_ready(
        &self,
        log: &Path,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> BootReport {
        let started = Instant::now();
        let mut state = BootState::Unknown;
        let mut address = None;

        loop {
            let scan = self.scan(log);
            if scan.log_present && state == BootState::Unknown {
                tracing::debug!(log = %log.display(), "console output appeared");
                state = BootState::Booting;
            }
            if address.is_none() {
                if let Some(ip) = scan.address {
                    tracing::info!(%ip, "guest address discovered");
                    address = Some(ip);
                }
            }
            if scan.ready {
                tracing::info!(elapsed_s = started.elapsed().as_secs(), "provisioning finished");
                return BootReport {
                    state: BootState::Ready,
                    address,
                    elapsed: started.elapsed(),
                };
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                tracing::warn!(timeout_s = timeout.as_secs(), "timed out waiting for provisioning");
                return BootReport {
                    state: BootState::TimedOut,
                    address,
                    elapsed,
                };
            }

            let nap = self.interval.min(timeout - elapsed);
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("wait interrupted");
                    return BootReport {
                        state: BootState::Interrupted,
                        address,
                        elapsed: started.elapsed(),
                    };
                }
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}
