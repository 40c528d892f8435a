//! VM status as seen from the outside.
//!
//! Nothing here is persisted. Every invocation reconstructs status from the
//! VM directory: the descriptor, the pid file and the console log.

use std::fmt;
use std::net::Ipv4Addr;

use crate::boot::{ConsoleScan, ReadinessMatcher, scan_console};
use crate::descriptor::VmDescriptor;
use crate::error::VmError;
use crate::paths::VmPaths;
use crate::supervisor::ProcessHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmStatus {
    Running { pid: i32 },
    Stopped,
    /// Descriptor present but unusable.
    Broken { reason: String },
}

impl VmStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, VmStatus::Running { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            VmStatus::Running { .. } => "RUNNING",
            VmStatus::Stopped => "STOPPED",
            VmStatus::Broken { .. } => "BROKEN",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One row of `list`.
#[derive(Debug, Clone)]
pub struct VmSummary {
    pub name: String,
    pub status: VmStatus,
    pub descriptor: Option<VmDescriptor>,
}

impl VmSummary {
    pub fn from_load(name: String, loaded: Result<VmDescriptor, VmError>, paths: &VmPaths) -> Self {
        match loaded {
            Ok(descriptor) => Self {
                name,
                status: process_status(paths),
                descriptor: Some(descriptor),
            },
            Err(e) => {
                tracing::warn!(%name, error = %e, "skipping unreadable VM");
                Self {
                    name,
                    status: VmStatus::Broken {
                        reason: e.to_string(),
                    },
                    descriptor: None,
                }
            }
        }
    }
}

pub fn process_status(paths: &VmPaths) -> VmStatus {
    match ProcessHandle::rehydrate(paths) {
        Some(h) => VmStatus::Running { pid: h.pid },
        None => VmStatus::Stopped,
    }
}

/// Provisioning progress derived from one console pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioning {
    /// No console log yet.
    NotStarted,
    Initializing,
    Ready,
}

/// Everything `status` reports for one VM.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub descriptor: VmDescriptor,
    pub status: VmStatus,
    pub provisioning: Provisioning,
    /// Address seen on the console, falling back to the recorded one.
    pub address: Option<Ipv4Addr>,
    pub network_configured: bool,
}

impl StatusReport {
    pub fn inspect(descriptor: VmDescriptor, paths: &VmPaths, matcher: &impl ReadinessMatcher) -> Self {
        let scan: ConsoleScan = scan_console(&paths.console_log(), matcher);
        let provisioning = if !scan.log_present {
            Provisioning::NotStarted
        } else if scan.ready {
            Provisioning::Ready
        } else {
            Provisioning::Initializing
        };
        let address = scan.address.or_else(|| descriptor.static_ip());
        Self {
            status: process_status(paths),
            provisioning,
            address,
            network_configured: scan.network_seen,
            descriptor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::CloudInitMatcher;
    use crate::descriptor::NetworkMode;
    use crate::descriptor::tests::sample;
    use std::path::Path;

    fn matcher() -> CloudInitMatcher {
        CloudInitMatcher::new("CLOUD-INIT-READY", "enp0s1")
    }

    fn vm_dir(root: &Path) -> VmPaths {
        let p = VmPaths::new(root, "web");
        std::fs::create_dir_all(p.dir()).unwrap();
        p
    }

    #[test]
    fn no_console_means_not_started() {
        let dir = tempfile::tempdir().unwrap();
        let p = vm_dir(dir.path());
        let report = StatusReport::inspect(sample("web", NetworkMode::Bridge), &p, &matcher());
        assert_eq!(report.provisioning, Provisioning::NotStarted);
        assert_eq!(report.status, VmStatus::Stopped);
        assert!(!report.network_configured);
        // Recorded address still shown.
        assert!(report.address.is_some());
    }

    #[test]
    fn console_progress_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let p = vm_dir(dir.path());
        std::fs::write(p.console_log(), "ci-info: | enp0s1 | True | 192.168.105.150 |\n").unwrap();
        let report = StatusReport::inspect(sample("web", NetworkMode::Bridge), &p, &matcher());
        assert_eq!(report.provisioning, Provisioning::Initializing);
        assert!(report.network_configured);
        assert_eq!(report.address, Some(Ipv4Addr::new(192, 168, 105, 150)));

        std::fs::write(p.console_log(), "CLOUD-INIT-READY\n").unwrap();
        let report = StatusReport::inspect(sample("web", NetworkMode::Portfwd), &p, &matcher());
        assert_eq!(report.provisioning, Provisioning::Ready);
        assert_eq!(report.address, None);
    }

    #[test]
    fn own_pid_reads_as_running() {
        let dir = tempfile::tempdir().unwrap();
        let p = vm_dir(dir.path());
        std::fs::write(p.pid_file(), std::process::id().to_string()).unwrap();
        assert_eq!(
            process_status(&p),
            VmStatus::Running {
                pid: std::process::id() as i32
            }
        );
    }

    #[test]
    fn corrupt_descriptor_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let p = vm_dir(dir.path());
        let summary = VmSummary::from_load(
            "web".into(),
            Err(VmError::CorruptState {
                name: "web".into(),
                path: "info.json".into(),
                message: "bad".into(),
            }),
            &p,
        );
        assert_eq!(summary.status.label(), "BROKEN");
        assert!(summary.descriptor.is_none());
    }
}
