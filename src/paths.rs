use std::path::{Path, PathBuf};

/// Default work root: `~/.vm/`
pub fn default_work_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".vm")
}

/// Advisory lock file for a VM, a dotfile next to its directory.
pub fn lock_path(vms_dir: &Path, name: &str) -> PathBuf {
    vms_dir.join(format!(".{name}.lock"))
}

/// Every artifact of one VM lives in `<vms_dir>/<name>/`.
///
/// The process handle (pid, monitor socket, console log) is not stored
/// anywhere else; it is rehydrated from these paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPaths {
    dir: PathBuf,
}

impl VmPaths {
    pub fn new(vms_dir: &Path, name: &str) -> Self {
        Self {
            dir: vms_dir.join(name),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Descriptor record.
    pub fn descriptor(&self) -> PathBuf {
        self.dir.join("info.json")
    }

    /// qcow2 disk image.
    pub fn disk(&self) -> PathBuf {
        self.dir.join("disk.qcow2")
    }

    /// Serial console output, appended to by the guest.
    pub fn console_log(&self) -> PathBuf {
        self.dir.join("console.log")
    }

    /// QEMU human monitor socket.
    pub fn monitor_socket(&self) -> PathBuf {
        self.dir.join("monitor.sock")
    }

    /// Written by QEMU itself via `-pidfile`.
    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("qemu.pid")
    }

    /// cloud-init NoCloud seed.
    pub fn seed_iso(&self) -> PathBuf {
        self.dir.join("seed.iso")
    }

    /// Staging directory holding `user-data` and `meta-data` for packaging.
    pub fn cloud_init_dir(&self) -> PathBuf {
        self.dir.join("cloud-init")
    }
}

/// Per-VM orchestrator log, kept outside the VM directory so that logging can
/// start before the directory exists and survives deletion.
pub fn vm_log_file(work_root: &Path, name: &str) -> PathBuf {
    work_root.join("logs").join(format!("{name}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifacts_live_in_vm_dir() {
        let p = VmPaths::new(Path::new("/root/.vm/vms"), "web");
        assert_eq!(p.dir(), Path::new("/root/.vm/vms/web"));
        for artifact in [
            p.descriptor(),
            p.disk(),
            p.console_log(),
            p.monitor_socket(),
            p.pid_file(),
            p.seed_iso(),
        ] {
            assert_eq!(artifact.parent(), Some(p.dir()));
        }
    }

    #[test]
    fn lock_is_outside_vm_dir() {
        let lock = lock_path(Path::new("/v"), "web");
        assert_eq!(lock, Path::new("/v/.web.lock"));
        assert!(!lock.starts_with(VmPaths::new(Path::new("/v"), "web").dir()));
    }
}
