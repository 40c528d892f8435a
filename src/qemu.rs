use std::path::{Path, PathBuf};

use crate::config::{HostConfig, QemuConfig};
use crate::descriptor::{Accel, Arch, NetworkMode, VmDescriptor};
use crate::error::VmError;
use crate::paths::VmPaths;
use crate::util::find_executable;

/// Guest-side SSH port targeted by NAT forwarding.
const GUEST_SSH_PORT: u16 = 22;

/// Inherited descriptor slot the bridging helper hands the connected socket on.
const BRIDGE_FD: u32 = 3;

/// Everything needed to produce one hypervisor command line.
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub descriptor: &'a VmDescriptor,
    /// Hypervisor executable, as resolved by [`hypervisor_binary`].
    pub binary: &'a str,
    pub memory: &'a str,
    pub cpus: u32,
    pub disk: &'a Path,
    /// Required for arm64 guests.
    pub firmware: Option<&'a Path>,
    pub seed_iso: Option<&'a Path>,
    pub paths: &'a VmPaths,
    /// Architecture of the host; hardware acceleration is only requested
    /// when it equals the guest's.
    pub host_arch: Option<Arch>,
}

impl<'a> LaunchSpec<'a> {
    /// Spec using the resources recorded in the descriptor and the VM's own
    /// disk and seed.
    pub fn for_descriptor(
        descriptor: &'a VmDescriptor,
        binary: &'a str,
        paths: &'a VmPaths,
        disk: &'a Path,
        seed_iso: Option<&'a Path>,
        firmware: Option<&'a Path>,
    ) -> Self {
        Self {
            descriptor,
            binary,
            memory: &descriptor.resources.memory,
            cpus: descriptor.resources.cpus,
            disk,
            firmware,
            seed_iso,
            paths,
            host_arch: Arch::host(),
        }
    }
}

/// Build the ordered hypervisor argv. Pure: identical input always yields an
/// identical sequence and nothing on disk is touched.
pub fn build(spec: &LaunchSpec<'_>) -> Result<Vec<String>, VmError> {
    let d = spec.descriptor;
    let mut args: Vec<String> = Vec::with_capacity(40);
    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    match d.arch {
        Arch::Amd64 => {
            push(&[spec.binary, "-machine", "q35", "-cpu", "qemu64"]);
            push(&["-m", spec.memory, "-smp", &spec.cpus.to_string()]);
            push(&[
                "-object",
                &format!("memory-backend-ram,id=mem,size={}", spec.memory),
                "-numa",
                "node,memdev=mem",
            ]);
        }
        Arch::Arm64 => {
            let firmware = spec.firmware.ok_or_else(|| VmError::DependencyMissing {
                what: "aarch64 UEFI firmware".into(),
                hint: "install QEMU's edk2 firmware or add its path to qemu.firmware_paths".into(),
            })?;
            push(&[spec.binary, "-machine", "virt", "-cpu", "max"]);
            push(&["-bios", &firmware.display().to_string()]);
            push(&["-m", spec.memory, "-smp", &spec.cpus.to_string()]);
        }
    }

    push(&["-name", &d.name]);
    push(&["-device", &format!("virtio-net-pci,netdev=n0,mac={}", d.mac)]);
    match d.network {
        NetworkMode::Bridge => push(&["-netdev", &format!("socket,id=n0,fd={BRIDGE_FD}")]),
        NetworkMode::Portfwd => push(&[
            "-netdev",
            &format!(
                "user,id=n0,hostfwd=tcp:127.0.0.1:{}-:{GUEST_SSH_PORT}",
                d.ssh.port
            ),
        ]),
    }

    push(&["-device", "virtio-rng-pci"]);
    push(&[
        "-drive",
        &format!(
            "file={},if=virtio,cache=writeback,format=qcow2",
            spec.disk.display()
        ),
    ]);
    if let Some(seed) = spec.seed_iso {
        push(&["-cdrom", &seed.display().to_string()]);
    }

    push(&["-daemonize", "-display", "none"]);
    push(&[
        "-serial",
        &format!("file:{}", spec.paths.console_log().display()),
    ]);
    push(&[
        "-monitor",
        &format!("unix:{},server,nowait", spec.paths.monitor_socket().display()),
    ]);
    push(&["-pidfile", &spec.paths.pid_file().display().to_string()]);

    if spec.host_arch == Some(d.arch) && d.accel != Accel::Tcg {
        push(&["-accel", d.accel.as_str()]);
    }

    Ok(args)
}

/// Hypervisor executable for a guest architecture, honouring config overrides.
pub fn hypervisor_binary(arch: Arch, qemu: &QemuConfig) -> String {
    let (configured, default) = match arch {
        Arch::Amd64 => (&qemu.x86_64_binary, "qemu-system-x86_64"),
        Arch::Arm64 => (&qemu.aarch64_binary, "qemu-system-aarch64"),
    };
    if configured.is_empty() {
        default.to_string()
    } else {
        configured.clone()
    }
}

pub fn img_binary(qemu: &QemuConfig) -> String {
    if qemu.img_binary.is_empty() {
        "qemu-img".to_string()
    } else {
        qemu.img_binary.clone()
    }
}

/// First existing firmware file among the candidates.
pub fn resolve_firmware(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|p| p.is_file()).cloned()
}

/// Host tooling located for one launch.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub hypervisor: String,
    pub qemu_img: String,
    pub firmware: Option<PathBuf>,
}

fn require_program(program: &str, hint: &str) -> Result<(), VmError> {
    let found = if program.contains('/') {
        Path::new(program).is_file()
    } else {
        find_executable(program).is_some()
    };
    if found {
        Ok(())
    } else {
        Err(VmError::DependencyMissing {
            what: program.to_string(),
            hint: hint.to_string(),
        })
    }
}

/// Verify every external dependency a launch of `arch` in `network` mode
/// needs. Runs before any state is mutated.
pub fn check_dependencies(
    host: &HostConfig,
    arch: Arch,
    network: NetworkMode,
) -> Result<Toolchain, VmError> {
    let qemu = &host.config.qemu;
    let hypervisor = hypervisor_binary(arch, qemu);
    require_program(&hypervisor, "install QEMU (e.g. `brew install qemu` or `apt install qemu-system`)")?;
    let qemu_img = img_binary(qemu);
    require_program(&qemu_img, "install QEMU's qemu-img utility")?;

    let firmware = match arch {
        Arch::Arm64 => Some(resolve_firmware(&host.firmware_candidates()).ok_or_else(|| {
            VmError::DependencyMissing {
                what: "aarch64 UEFI firmware".into(),
                hint: "install QEMU's edk2 firmware or add its path to qemu.firmware_paths".into(),
            }
        })?),
        Arch::Amd64 => None,
    };

    if network == NetworkMode::Bridge {
        let client = host.bridge_client();
        if !client.is_file() {
            return Err(VmError::DependencyMissing {
                what: format!("bridging helper at {}", client.display()),
                hint: "install socket_vmnet (`brew install socket_vmnet`) or use --net-type portfwd".into(),
            });
        }
        let socket = host.bridge_socket();
        if !socket.exists() {
            return Err(VmError::DependencyMissing {
                what: format!("bridging socket at {}", socket.display()),
                hint: "start the socket_vmnet service (`sudo brew services start socket_vmnet`)".into(),
            });
        }
        if host.config.bridge.use_sudo {
            require_program("sudo", "bridged networking runs the helper through sudo")?;
        }
    }

    tracing::debug!(%hypervisor, %qemu_img, ?firmware, "dependencies satisfied");
    Ok(Toolchain {
        hypervisor,
        qemu_img,
        firmware,
    })
}
