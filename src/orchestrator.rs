//! Lifecycle operations composed from the store, the command builder, the
//! supervisor and the boot watcher.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::boot::{BootReport, BootState, BootWatcher, CloudInitMatcher};
use crate::cloudinit::{self, PackagingTool, RenderOptions};
use crate::config::HostConfig;
use crate::descriptor::{Accel, Arch, Credentials, NetworkMode, Resources, SshEndpoint, VmDescriptor};
use crate::error::VmError;
use crate::identity::{self, NetworkIdentity};
use crate::image::ImageResolver;
use crate::paths::VmPaths;
use crate::ports;
use crate::qemu::{self, LaunchSpec, Toolchain};
use crate::runner::CommandRunner;
use crate::store::VmStore;
use crate::supervisor::{ProcessHandle, ProcessSupervisor, StopOutcome};
use crate::util::{parse_size, utc_timestamp};
use crate::vm_state::{StatusReport, VmSummary};

const PASSWORD_LEN: usize = 16;
const BRIDGE_SSH_PORT: u16 = 22;
const MAX_NAME_LEN: usize = 63;

/// Parameters of `create`. Unset fields fall back to the host defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub name: Option<String>,
    pub arch: Option<Arch>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub memory: Option<String>,
    pub cpus: Option<u32>,
    pub disk: Option<String>,
    pub network: Option<NetworkMode>,
    pub accel: Option<Accel>,
    /// Bridged mode only; derived from the name when absent.
    pub ip: Option<Ipv4Addr>,
    pub image: Option<String>,
    pub wait: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub descriptor: VmDescriptor,
    pub pid: i32,
    /// None when the caller did not wait.
    pub boot: Option<BootReport>,
}

/// Hostname-safe name check, applied after sanitizing.
pub fn validate_name(name: &str) -> Result<(), VmError> {
    let first_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    if !first_ok || name.len() > MAX_NAME_LEN || name.ends_with('.') {
        return Err(VmError::Validation {
            message: format!(
                "invalid VM name '{name}': use letters, digits, '-' and '.', starting with a letter or digit, at most {MAX_NAME_LEN} characters"
            ),
        });
    }
    Ok(())
}

/// Reject names that could not have been created, before they are used as a
/// path component.
pub fn check_existing_name(name: &str) -> Result<(), VmError> {
    if identity::sanitize_name(name) != name {
        return Err(VmError::Validation {
            message: format!("invalid VM name '{name}'"),
        });
    }
    validate_name(name)
}

pub struct Orchestrator<R> {
    host: HostConfig,
    store: VmStore,
    runner: R,
}

impl<R: CommandRunner> Orchestrator<R> {
    pub fn new(host: HostConfig, runner: R) -> Self {
        let store = VmStore::new(&host.vms_dir);
        Self { host, store, runner }
    }

    pub fn host(&self) -> &HostConfig {
        &self.host
    }

    pub fn store(&self) -> &VmStore {
        &self.store
    }

    fn supervisor(&self) -> ProcessSupervisor<&R> {
        ProcessSupervisor::new(&self.runner, &self.host)
    }

    fn watcher(&self) -> BootWatcher<CloudInitMatcher> {
        let boot = &self.host.config.boot;
        BootWatcher::new(
            CloudInitMatcher::new(&boot.sentinel, &boot.interface),
            self.host.boot_poll_interval(),
        )
    }

    /// Descriptor for a new VM with every default filled in. Pure apart from
    /// the random name/password and the port probe.
    pub fn plan(&self, req: &CreateRequest) -> Result<VmDescriptor, VmError> {
        let defaults = &self.host.config.defaults;
        let raw_name = req.name.clone().unwrap_or_else(identity::random_name);
        let name = identity::sanitize_name(&raw_name);
        if name != raw_name {
            tracing::info!(requested = %raw_name, %name, "sanitized VM name");
        }
        validate_name(&name)?;

        let network = req.network.unwrap_or(defaults.network);
        if req.ip.is_some() && network != NetworkMode::Bridge {
            return Err(VmError::Validation {
                message: "--ip is only valid with bridged networking".into(),
            });
        }
        let memory = req.memory.clone().unwrap_or_else(|| defaults.memory.clone());
        let disk = req.disk.clone().unwrap_or_else(|| defaults.disk.clone());
        parse_size(&memory)?;
        parse_size(&disk)?;
        let cpus = req.cpus.unwrap_or(defaults.cpus);
        if cpus == 0 {
            return Err(VmError::Validation {
                message: "cpus must be at least 1".into(),
            });
        }
        let username = req.username.clone().unwrap_or_else(|| defaults.username.clone());
        if username.is_empty() {
            return Err(VmError::Validation {
                message: "username must not be empty".into(),
            });
        }
        let image = req.image.clone().unwrap_or_else(|| defaults.image.clone());
        crate::image::find_image(&image)?;

        let id = NetworkIdentity::derive(&name, network);
        let static_ip = match network {
            NetworkMode::Bridge => {
                let ip = req.ip.or(id.ip);
                if let Some(ip) = ip.filter(|ip| !identity::in_bridge_subnet(*ip)) {
                    tracing::warn!(%ip, "address is outside the bridged subnet");
                }
                ip
            }
            NetworkMode::Portfwd => None,
        };
        let ssh = match static_ip {
            Some(ip) => SshEndpoint {
                host: ip.to_string(),
                port: BRIDGE_SSH_PORT,
            },
            None => SshEndpoint {
                host: Ipv4Addr::LOCALHOST.to_string(),
                port: ports::allocate(self.host.config.ports.preferred_ssh_port)?,
            },
        };

        Ok(VmDescriptor {
            name,
            arch: req.arch.unwrap_or_else(|| self.host.default_arch()),
            image,
            credentials: Credentials {
                username,
                password: req
                    .password
                    .clone()
                    .unwrap_or_else(|| identity::random_password(PASSWORD_LEN)),
            },
            network,
            static_ip: static_ip.map(|ip| ip.to_string()),
            mac: id.mac.to_string(),
            ssh,
            accel: req.accel.unwrap_or_else(|| self.host.default_accel()),
            resources: Resources { memory, cpus, disk },
            created_at: utc_timestamp(),
        })
    }

    /// Provision and boot a new VM. The directory is removed again if any
    /// step before a successful launch fails.
    pub async fn create(&self, req: CreateRequest, cancel: &CancellationToken) -> Result<CreateOutcome, VmError> {
        let mut descriptor = self.plan(&req)?;
        let name = descriptor.name.clone();

        let tools = qemu::check_dependencies(&self.host, descriptor.arch, descriptor.network)?;
        let packager = PackagingTool::detect(&self.host.config.qemu.iso_tool)?;

        let _lock = self.store.lock(&name, cancel).await?;
        let paths = self.store.create(&descriptor)?;
        tracing::info!(
            %name,
            arch = %descriptor.arch,
            network = %descriptor.network,
            mac = %descriptor.mac,
            ip = ?descriptor.static_ip,
            "creating VM"
        );

        let handle = match self.provision(&descriptor, &paths, &tools, packager, cancel).await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(%name, error = %e, "provisioning failed, rolling back");
                // Rollback runs to completion even after an interrupt.
                if let Err(stop_err) = self.supervisor().stop(&name, &paths, &CancellationToken::new()).await {
                    tracing::warn!(%name, error = %stop_err, "could not stop VM during rollback");
                }
                if let Err(rm_err) = self.store.remove_dir(&name) {
                    tracing::warn!(%name, error = %rm_err, "could not remove VM directory during rollback");
                }
                return Err(e);
            }
        };

        let boot = if req.wait {
            let timeout = req.timeout.unwrap_or_else(|| self.host.boot_timeout());
            let report = self.watcher().wait_ready(&handle.console_log, timeout, cancel).await;
            self.record_address(&mut descriptor, &report)?;
            Some(report)
        } else {
            None
        };

        Ok(CreateOutcome {
            descriptor,
            pid: handle.pid,
            boot,
        })
    }

    async fn provision(
        &self,
        descriptor: &VmDescriptor,
        paths: &VmPaths,
        tools: &Toolchain,
        packager: PackagingTool,
        cancel: &CancellationToken,
    ) -> Result<ProcessHandle, VmError> {
        let resolver = ImageResolver::new(&self.host.images_dir, tools.qemu_img.clone(), &self.runner);
        let base = tokio::select! {
            _ = cancel.cancelled() => return Err(VmError::Cancelled),
            r = resolver.resolve(&descriptor.image, descriptor.arch) => r?,
        };
        resolver
            .create_disk(&base, &paths.disk(), &descriptor.resources.disk)
            .await?;

        let boot = &self.host.config.boot;
        let seed = cloudinit::render(
            descriptor,
            &RenderOptions {
                sentinel: &boot.sentinel,
                interface: &boot.interface,
                gateway: &self.host.config.bridge.gateway,
            },
        )?;
        let seed_iso = cloudinit::package_seed(&self.runner, &packager, paths, &seed).await?;

        if cancel.is_cancelled() {
            return Err(VmError::Cancelled);
        }
        self.launch(descriptor, paths, tools, Some(&seed_iso)).await
    }

    async fn launch(
        &self,
        descriptor: &VmDescriptor,
        paths: &VmPaths,
        tools: &Toolchain,
        seed_iso: Option<&std::path::Path>,
    ) -> Result<ProcessHandle, VmError> {
        let disk = paths.disk();
        let spec = LaunchSpec::for_descriptor(
            descriptor,
            &tools.hypervisor,
            paths,
            &disk,
            seed_iso,
            tools.firmware.as_deref(),
        );
        let argv = qemu::build(&spec)?;
        tracing::debug!(argv = %argv.join(" "), "hypervisor command line");
        self.supervisor()
            .start(&descriptor.name, paths, &argv, descriptor.network)
            .await
    }

    fn record_address(&self, descriptor: &mut VmDescriptor, report: &BootReport) -> Result<(), VmError> {
        if report.state != BootState::Ready {
            return Ok(());
        }
        if let Some(ip) = report.address {
            if descriptor.record_discovered_address(ip) {
                tracing::info!(name = %descriptor.name, %ip, "recorded discovered address");
                self.store.save(descriptor)?;
            }
        }
        Ok(())
    }

    /// Paths of a VM that exists on disk. Checked before taking the lock so
    /// a mistyped name leaves no lock file behind.
    fn existing(&self, name: &str) -> Result<VmPaths, VmError> {
        check_existing_name(name)?;
        let paths = self.store.paths(name);
        if !paths.dir().is_dir() {
            return Err(VmError::NotFound { name: name.to_string() });
        }
        Ok(paths)
    }

    /// Relaunch a stopped VM from its persisted descriptor.
    pub async fn start(&self, name: &str, cancel: &CancellationToken) -> Result<ProcessHandle, VmError> {
        let paths = self.existing(name)?;
        let _lock = self.store.lock(name, cancel).await?;
        let mut descriptor = self.store.load(name)?;
        if !descriptor.identity_is_consistent() {
            tracing::warn!(name, mac = %descriptor.mac, "stored MAC no longer matches the one derived from the name");
        }
        if let Some(pid) = self.supervisor().probe(&paths) {
            return Err(VmError::AlreadyRunning {
                name: name.to_string(),
                pid,
            });
        }
        if !paths.disk().is_file() {
            return Err(VmError::CorruptState {
                name: name.to_string(),
                path: paths.disk().display().to_string(),
                message: "disk image is missing".into(),
            });
        }
        let tools = qemu::check_dependencies(&self.host, descriptor.arch, descriptor.network)?;

        if descriptor.network == NetworkMode::Portfwd && !ports::is_free(descriptor.ssh.port) {
            let port = ports::allocate(self.host.config.ports.preferred_ssh_port)?;
            tracing::info!(name, old = descriptor.ssh.port, new = port, "forwarded port taken, moving");
            descriptor.ssh.port = port;
            self.store.save(&descriptor)?;
        }

        let seed = paths.seed_iso();
        let seed = seed.is_file().then_some(seed.as_path());
        self.launch(&descriptor, &paths, &tools, seed).await
    }

    pub async fn stop(&self, name: &str, cancel: &CancellationToken) -> Result<StopOutcome, VmError> {
        let paths = self.existing(name)?;
        let _lock = self.store.lock(name, cancel).await?;
        if !paths.dir().is_dir() {
            return Err(VmError::NotFound { name: name.to_string() });
        }
        self.supervisor().stop(name, &paths, cancel).await
    }

    /// Stop (if needed) and remove a VM.
    pub async fn delete(&self, name: &str, cancel: &CancellationToken) -> Result<(), VmError> {
        self.existing(name)?;
        let _lock = self.store.lock(name, cancel).await?;
        self.store.delete(name, &self.supervisor(), cancel).await
    }

    /// One non-blocking look at a VM.
    pub fn status(&self, name: &str) -> Result<StatusReport, VmError> {
        check_existing_name(name)?;
        let descriptor = self.store.load(name)?;
        let paths = self.store.paths(name);
        let boot = &self.host.config.boot;
        Ok(StatusReport::inspect(
            descriptor,
            &paths,
            &CloudInitMatcher::new(&boot.sentinel, &boot.interface),
        ))
    }

    /// Block until the VM finishes provisioning, the timeout passes or
    /// `cancel` fires. The VM is left running in every case.
    pub async fn wait(
        &self,
        name: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<BootReport, VmError> {
        check_existing_name(name)?;
        let mut descriptor = self.store.load(name)?;
        let paths = self.store.paths(name);
        if !self.supervisor().is_running(&paths) {
            tracing::warn!(name, "VM is not running; waiting on its console log anyway");
        }
        let timeout = timeout.unwrap_or_else(|| self.host.boot_timeout());
        let report = self.watcher().wait_ready(&paths.console_log(), timeout, cancel).await;
        self.record_address(&mut descriptor, &report)?;
        Ok(report)
    }

    pub fn list(&self) -> Result<Vec<VmSummary>, VmError> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .map(|(name, loaded)| {
                let paths = self.store.paths(&name);
                VmSummary::from_load(name, loaded, &paths)
            })
            .collect())
    }
}
