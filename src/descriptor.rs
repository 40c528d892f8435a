//! The persisted description of one VM.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use facet::Facet;

use crate::error::VmError;
use crate::identity;

/// Guest CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[facet(rename_all = "lowercase")]
#[repr(u8)]
pub enum Arch {
    Arm64,
    Amd64,
}

impl Arch {
    /// Architecture of the machine we are running on, if supported.
    pub fn host() -> Option<Arch> {
        match std::env::consts::ARCH {
            "aarch64" => Some(Arch::Arm64),
            "x86_64" => Some(Arch::Amd64),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::Amd64 => "amd64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            "amd64" | "x86_64" => Ok(Arch::Amd64),
            other => Err(VmError::Validation {
                message: format!("unsupported architecture '{other}' (use arm64 or amd64)"),
            }),
        }
    }
}

/// How the guest NIC reaches the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[facet(rename_all = "lowercase")]
#[repr(u8)]
pub enum NetworkMode {
    /// Joined to the host network through the bridging helper.
    Bridge,
    /// User-mode NAT with one host port forwarded to guest SSH.
    Portfwd,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetworkMode::Bridge => "bridge",
            NetworkMode::Portfwd => "portfwd",
        })
    }
}

/// Preferred virtualization backend. Only honoured when guest and host
/// architectures match; otherwise the guest is emulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[facet(rename_all = "lowercase")]
#[repr(u8)]
pub enum Accel {
    Tcg,
    Kvm,
    Hvf,
}

impl Accel {
    /// The accelerator native to the host OS.
    pub fn host_default() -> Accel {
        if cfg!(target_os = "macos") {
            Accel::Hvf
        } else if cfg!(target_os = "linux") {
            Accel::Kvm
        } else {
            Accel::Tcg
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Accel::Tcg => "tcg",
            Accel::Kvm => "kvm",
            Accel::Hvf => "hvf",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct Resources {
    /// QEMU size string, e.g. `2G`.
    pub memory: String,
    pub cpus: u32,
    /// qemu-img size string, e.g. `10G`.
    pub disk: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct VmDescriptor {
    /// Sanitized name; also the directory key. Never changes once written.
    pub name: String,
    pub arch: Arch,
    pub image: String,
    pub credentials: Credentials,
    pub network: NetworkMode,
    /// Bridged mode only.
    pub static_ip: Option<String>,
    pub mac: String,
    pub ssh: SshEndpoint,
    pub accel: Accel,
    pub resources: Resources,
    pub created_at: String,
}

impl VmDescriptor {
    pub fn static_ip(&self) -> Option<Ipv4Addr> {
        self.static_ip.as_deref().and_then(|s| s.parse().ok())
    }

    /// Record an address observed on the guest console. Returns true if the
    /// descriptor changed and should be saved.
    ///
    /// Only bridged guests have a host-reachable address; NAT guests are
    /// always reached through the forwarded port.
    pub fn record_discovered_address(&mut self, ip: Ipv4Addr) -> bool {
        if self.network != NetworkMode::Bridge {
            return false;
        }
        let ip = ip.to_string();
        if self.ssh.host == ip && self.static_ip.as_deref() == Some(ip.as_str()) {
            return false;
        }
        self.static_ip = Some(ip.clone());
        self.ssh.host = ip;
        true
    }

    /// Address and port a user would SSH to, for display.
    pub fn ssh_target(&self) -> String {
        match self.network {
            NetworkMode::Bridge if !self.ssh.host.is_empty() => self.ssh.host.clone(),
            NetworkMode::Bridge => format!("{}.local", self.name),
            NetworkMode::Portfwd => format!("{}:{}", self.ssh.host, self.ssh.port),
        }
    }

    /// True if the stored MAC still matches the one derived from the name.
    pub fn identity_is_consistent(&self) -> bool {
        identity::derive_mac(&self.name).to_string() == self.mac
    }
}
