use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::descriptor::{Accel, Arch, NetworkMode};
use crate::error::VmError;
use crate::paths;
use crate::util::parse_size;

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct Config {
    /// Root of all lazyvm state. Empty means `~/.vm`.
    #[facet(default)]
    pub work_root: String,
    /// Base image cache. Empty means `<work_root>/images`.
    #[facet(default)]
    pub images_dir: String,
    /// Per-VM directories. Empty means `<work_root>/vms`.
    #[facet(default)]
    pub vms_dir: String,
    #[facet(default)]
    pub defaults: DefaultsConfig,
    #[facet(default)]
    pub bridge: BridgeConfig,
    #[facet(default)]
    pub qemu: QemuConfig,
    #[facet(default)]
    pub boot: BootConfig,
    #[facet(default)]
    pub stop: StopConfig,
    #[facet(default)]
    pub ports: PortsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_root: String::new(),
            images_dir: String::new(),
            vms_dir: String::new(),
            defaults: DefaultsConfig::default(),
            bridge: BridgeConfig::default(),
            qemu: QemuConfig::default(),
            boot: BootConfig::default(),
            stop: StopConfig::default(),
            ports: PortsConfig::default(),
        }
    }
}

/// Values used by `create` when the command line leaves them out.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct DefaultsConfig {
    #[facet(default = "user01")]
    pub username: String,
    #[facet(default = "2G")]
    pub memory: String,
    #[facet(default = 2)]
    pub cpus: u32,
    #[facet(default = "10G")]
    pub disk: String,
    #[facet(default = "debian13")]
    pub image: String,
    /// None means the host architecture.
    pub arch: Option<Arch>,
    /// None means the accelerator native to the host OS.
    pub accel: Option<Accel>,
    pub network: NetworkMode,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            username: "user01".into(),
            memory: "2G".into(),
            cpus: 2,
            disk: "10G".into(),
            image: "debian13".into(),
            arch: None,
            accel: None,
            network: NetworkMode::Bridge,
        }
    }
}

/// The external bridging helper (socket_vmnet_client) that hands QEMU a
/// connected socket on fd 3.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct BridgeConfig {
    /// Empty means the Homebrew install location.
    #[facet(default)]
    pub client: String,
    /// Empty means the Homebrew socket location.
    #[facet(default)]
    pub socket: String,
    #[facet(default = "192.168.105.1")]
    pub gateway: String,
    #[facet(default = true)]
    pub use_sudo: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            client: String::new(),
            socket: String::new(),
            gateway: "192.168.105.1".into(),
            use_sudo: true,
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct QemuConfig {
    /// Override for `qemu-system-x86_64`.
    #[facet(default)]
    pub x86_64_binary: String,
    /// Override for `qemu-system-aarch64`.
    #[facet(default)]
    pub aarch64_binary: String,
    /// Override for `qemu-img`.
    #[facet(default)]
    pub img_binary: String,
    /// Seed ISO tool taking mkisofs flags (or hdiutil). Probed on PATH
    /// when empty.
    #[facet(default)]
    pub iso_tool: String,
    /// Searched before the standard edk2/AAVMF locations.
    #[facet(default)]
    pub firmware_paths: Vec<String>,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct BootConfig {
    #[facet(default = 2)]
    pub poll_interval_s: u64,
    #[facet(default = 300)]
    pub timeout_s: u64,
    /// cloud-init `final_message`; emitted once on the serial console.
    #[facet(default = "CLOUD-INIT-READY")]
    pub sentinel: String,
    /// Primary guest interface as named in `ci-info` lines.
    #[facet(default = "enp0s1")]
    pub interface: String,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            poll_interval_s: 2,
            timeout_s: 300,
            sentinel: "CLOUD-INIT-READY".into(),
            interface: "enp0s1".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct StopConfig {
    #[facet(default = 30)]
    pub grace_s: u64,
    #[facet(default = 1000)]
    pub poll_interval_ms: u64,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            grace_s: 30,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct PortsConfig {
    /// First port tried for NAT-mode SSH forwarding.
    #[facet(default = 2222)]
    pub preferred_ssh_port: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            preferred_ssh_port: 2222,
        }
    }
}

// ── HostConfig ────────────────────────────────────────────

/// Resolved host configuration, passed explicitly to every component.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// File the config was read from, if any.
    pub config_path: Option<PathBuf>,
    pub work_root: PathBuf,
    pub images_dir: PathBuf,
    pub vms_dir: PathBuf,
    pub config: Config,
}

impl HostConfig {
    /// Resolve directories from a parsed config. Relative paths are taken
    /// relative to the work root.
    pub fn resolve(config: Config, config_path: Option<PathBuf>) -> Self {
        let work_root = if config.work_root.is_empty() {
            paths::default_work_root()
        } else {
            expand_home(&config.work_root)
        };
        let sub = |value: &str, default: &str| {
            if value.is_empty() {
                work_root.join(default)
            } else {
                let p = expand_home(value);
                if p.is_absolute() { p } else { work_root.join(p) }
            }
        };
        let images_dir = sub(&config.images_dir, "images");
        let vms_dir = sub(&config.vms_dir, "vms");
        Self {
            config_path,
            work_root,
            images_dir,
            vms_dir,
            config,
        }
    }

    /// Default config rooted at an explicit directory. Used by tests to get
    /// isolated stores.
    pub fn with_work_root(root: &Path) -> Self {
        let config = Config {
            work_root: root.display().to_string(),
            ..Config::default()
        };
        Self::resolve(config, None)
    }

    pub fn default_arch(&self) -> Arch {
        self.config
            .defaults
            .arch
            .or_else(Arch::host)
            .unwrap_or(Arch::Arm64)
    }

    pub fn default_accel(&self) -> Accel {
        self.config.defaults.accel.unwrap_or_else(Accel::host_default)
    }

    pub fn boot_poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.boot.poll_interval_s)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.config.boot.timeout_s)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.config.stop.grace_s)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.stop.poll_interval_ms)
    }

    /// Homebrew prefix used to locate the bridging helper.
    fn brew_prefix() -> &'static str {
        if Path::new("/opt/homebrew").exists() {
            "/opt/homebrew"
        } else {
            "/usr/local"
        }
    }

    pub fn bridge_client(&self) -> PathBuf {
        if self.config.bridge.client.is_empty() {
            Path::new(Self::brew_prefix()).join("opt/socket_vmnet/bin/socket_vmnet_client")
        } else {
            expand_home(&self.config.bridge.client)
        }
    }

    pub fn bridge_socket(&self) -> PathBuf {
        if self.config.bridge.socket.is_empty() {
            Path::new(Self::brew_prefix()).join("var/run/socket_vmnet")
        } else {
            expand_home(&self.config.bridge.socket)
        }
    }

    /// Firmware search order for aarch64 guests.
    pub fn firmware_candidates(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self
            .config
            .qemu
            .firmware_paths
            .iter()
            .map(|p| expand_home(p))
            .collect();
        out.push(Path::new(Self::brew_prefix()).join("share/qemu/edk2-aarch64-code.fd"));
        out.extend(
            [
                "/usr/local/share/qemu/edk2-aarch64-code.fd",
                "/usr/share/qemu/edk2-aarch64-code.fd",
                "/usr/share/edk2/aarch64/QEMU_EFI.fd",
                "/usr/share/AAVMF/AAVMF_CODE.fd",
            ]
            .map(PathBuf::from),
        );
        out
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(rest),
        None => PathBuf::from(path),
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), VmError> {
    let d = &config.defaults;
    if d.cpus < 1 {
        return Err(VmError::Validation {
            message: "defaults.cpus must be at least 1".into(),
        });
    }
    if d.username.is_empty() {
        return Err(VmError::Validation {
            message: "defaults.username must not be empty".into(),
        });
    }
    parse_size(&d.memory)?;
    parse_size(&d.disk)?;
    if config.boot.poll_interval_s == 0 {
        return Err(VmError::Validation {
            message: "boot.poll_interval_s must be at least 1".into(),
        });
    }
    if config.stop.poll_interval_ms == 0 {
        return Err(VmError::Validation {
            message: "stop.poll_interval_ms must be at least 1".into(),
        });
    }
    if config.boot.sentinel.trim().is_empty() {
        return Err(VmError::Validation {
            message: "boot.sentinel must not be empty".into(),
        });
    }
    if config.bridge.gateway.parse::<std::net::Ipv4Addr>().is_err() {
        return Err(VmError::Validation {
            message: format!("bridge.gateway is not an IPv4 address (got '{}')", config.bridge.gateway),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

/// Path used when `--config` is not given.
pub fn default_config_path() -> PathBuf {
    paths::default_work_root().join("config.toml")
}

/// Load the host config. A missing file at the default location yields the
/// built-in defaults; an explicitly requested file must exist.
pub fn load_config(path: Option<&Path>) -> Result<HostConfig, VmError> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (default_config_path(), false),
    };

    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(HostConfig::resolve(Config::default(), None));
        }
        Err(source) => {
            return Err(VmError::ConfigLoad {
                path: path.display().to_string(),
                source,
            });
        }
    };

    let config = parse_config(&contents).map_err(|message| VmError::ConfigParse {
        path: path.display().to_string(),
        message,
    })?;

    validate_config(&config)?;

    Ok(HostConfig::resolve(config, Some(path)))
}

fn parse_config(contents: &str) -> Result<Config, String> {
    facet_toml::from_str(contents).map_err(|e| e.to_string())
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        validate_config(&Config::default()).unwrap();
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.defaults.username, "user01");
        assert_eq!(config.defaults.memory, "2G");
        assert_eq!(config.boot.timeout_s, 300);
        assert_eq!(config.boot.sentinel, "CLOUD-INIT-READY");
        assert_eq!(config.stop.grace_s, 30);
        assert_eq!(config.ports.preferred_ssh_port, 2222);
        assert!(config.bridge.use_sudo);
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
work_root = "/srv/vm"

[defaults]
username = "ops"
cpus = 4
network = "portfwd"
arch = "amd64"

[boot]
timeout_s = 60
interface = "ens3"

[qemu]
firmware_paths = ["/opt/fw/QEMU_EFI.fd"]
"#;
        let config = parse_config(toml).unwrap();
        assert_eq!(config.defaults.username, "ops");
        assert_eq!(config.defaults.cpus, 4);
        assert_eq!(config.defaults.memory, "2G");
        assert_eq!(config.defaults.network, NetworkMode::Portfwd);
        assert_eq!(config.defaults.arch, Some(Arch::Amd64));
        assert_eq!(config.boot.timeout_s, 60);
        assert_eq!(config.boot.poll_interval_s, 2);
        assert_eq!(config.boot.interface, "ens3");

        let host = HostConfig::resolve(config, None);
        assert_eq!(host.work_root, PathBuf::from("/srv/vm"));
        assert_eq!(host.vms_dir, PathBuf::from("/srv/vm/vms"));
        assert_eq!(host.images_dir, PathBuf::from("/srv/vm/images"));
        assert_eq!(host.default_arch(), Arch::Amd64);
        assert_eq!(
            host.firmware_candidates()[0],
            PathBuf::from("/opt/fw/QEMU_EFI.fd")
        );
    }

    #[test]
    fn relative_dirs_resolve_under_work_root() {
        let config = Config {
            work_root: "/w".into(),
            vms_dir: "machines".into(),
            images_dir: "/cache/images".into(),
            ..Config::default()
        };
        let host = HostConfig::resolve(config, None);
        assert_eq!(host.vms_dir, PathBuf::from("/w/machines"));
        assert_eq!(host.images_dir, PathBuf::from("/cache/images"));
    }

    #[test]
    fn zero_cpus_rejected() {
        let mut config = Config::default();
        config.defaults.cpus = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn bad_memory_rejected() {
        let mut config = Config::default();
        config.defaults.memory = "lots".into();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn bad_gateway_rejected() {
        let mut config = Config::default();
        config.bridge.gateway = "gateway".into();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn missing_explicit_file_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, VmError::ConfigLoad { .. }));
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[defaults\ncpus = ").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert!(matches!(err, VmError::ConfigParse { .. }));
    }

    #[test]
    fn with_work_root_is_isolated() {
        let host = HostConfig::with_work_root(Path::new("/tmp/x"));
        assert_eq!(host.vms_dir, PathBuf::from("/tmp/x/vms"));
        assert!(host.config_path.is_none());
    }
}
