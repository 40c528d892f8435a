use std::path::{Path, PathBuf};

use facet_value::{VArray, Value, value};

use crate::descriptor::{NetworkMode, VmDescriptor};
use crate::error::VmError;
use crate::paths::VmPaths;
use crate::runner::CommandRunner;
use crate::util::find_executable;

/// Inputs to the cloud-init renderer that do not live in the descriptor.
#[derive(Debug, Clone)]
pub struct RenderOptions<'a> {
    /// Emitted by cloud-init as `final_message` once provisioning completes.
    pub sentinel: &'a str,
    /// Primary guest interface for the netplan file.
    pub interface: &'a str,
    /// Default route for bridged guests with a static address.
    pub gateway: &'a str,
}

/// The NoCloud pair handed to the packaging tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedFiles {
    pub user_data: String,
    pub meta_data: String,
}

const NAMESERVERS: [&str; 2] = ["8.8.8.8", "1.1.1.1"];

const SSHD_DROPIN: &str = "\
PasswordAuthentication yes
PubkeyAuthentication yes
PermitRootLogin prohibit-password
UseDNS no
GSSAPIAuthentication no
";

const WAIT_ONLINE_DROPIN: &str = "\
[Service]
ExecStart=
ExecStart=/lib/systemd/systemd-networkd-wait-online --timeout=3
";

pub fn render(descriptor: &VmDescriptor, opts: &RenderOptions<'_>) -> Result<SeedFiles, VmError> {
    let hostname = descriptor.name.as_str();
    let meta_data = format!("instance-id: {hostname}\nlocal-hostname: {hostname}\n");
    Ok(SeedFiles {
        user_data: build_user_data(descriptor, opts)?,
        meta_data,
    })
}

/// Netplan document for the bridged interface: static `/24` when an address
/// is known, DHCP otherwise.
fn build_netplan(descriptor: &VmDescriptor, opts: &RenderOptions<'_>) -> Result<String, VmError> {
    let nameservers = value!({
        "addresses": (Value::from(VArray::from_iter(NAMESERVERS.map(Value::from)))),
    });
    let ethernet = match descriptor.static_ip() {
        Some(ip) => {
            let cidr = format!("{ip}/24");
            value!({
                "addresses": [(cidr.as_str())],
                "routes": [{ "to": "default", "via": (opts.gateway) }],
                "nameservers": (nameservers),
                "dhcp4": false,
                "dhcp6": false,
            })
        }
        None => value!({
            "dhcp4": true,
            "dhcp6": false,
            "nameservers": (nameservers),
        }),
    };
    let mut ethernets = value!({});
    if let Some(obj) = ethernets.as_object_mut() {
        obj.insert(opts.interface, ethernet);
    }
    let doc = value!({
        "network": {
            "version": 2,
            "renderer": "networkd",
            "ethernets": (ethernets),
        },
    });
    to_yaml(&doc)
}

fn build_user_data(descriptor: &VmDescriptor, opts: &RenderOptions<'_>) -> Result<String, VmError> {
    let hostname = descriptor.name.as_str();
    let fqdn = format!("{hostname}.local");
    let username = descriptor.credentials.username.as_str();
    let password = descriptor.credentials.password.as_str();
    let bridged = descriptor.network == NetworkMode::Bridge;

    let user = value!({
        "name": (username),
        "gecos": (username),
        "sudo": "ALL=(ALL) NOPASSWD:ALL",
        "groups": ["sudo"],
        "shell": "/bin/bash",
        "lock_passwd": false,
        "plain_text_passwd": (password),
    });

    let mut packages = VArray::from_iter(["openssh-server", "avahi-daemon"].map(Value::from));
    if bridged {
        packages.push(Value::from("locales-all"));
    }

    let mut write_files = VArray::new();
    write_files.push(value!({
        "path": "/etc/ssh/sshd_config.d/50-cloud-init.conf",
        "owner": "root:root",
        "permissions": "0644",
        "content": (SSHD_DROPIN),
    }));
    if bridged {
        let netplan = build_netplan(descriptor, opts)?;
        write_files.push(value!({
            "path": "/etc/systemd/system/systemd-networkd-wait-online.service.d/override.conf",
            "content": (WAIT_ONLINE_DROPIN),
        }));
        write_files.push(value!({
            "path": "/etc/cloud/cloud.cfg.d/99-disable-network-config.cfg",
            "content": "network: {config: disabled}\n",
        }));
        write_files.push(value!({
            "path": "/etc/netplan/01-netcfg.yaml",
            "permissions": "0600",
            "content": (netplan.as_str()),
        }));
    }

    let set_hostname = format!(
        "hostnamectl set-hostname {hostname} || echo \"{hostname}\" > /etc/hostname\nhostname {hostname}\n"
    );
    let mut runcmd = VArray::new();
    runcmd.push(Value::from(set_hostname.as_str()));
    runcmd.push(value!(["passwd", "-u", (username)]));
    runcmd.push(value!(["systemctl", "enable", "ssh"]));
    runcmd.push(value!(["systemctl", "enable", "avahi-daemon"]));
    if bridged {
        runcmd.push(value!(["systemctl", "daemon-reload"]));
        runcmd.push(value!(["netplan", "apply"]));
    }
    runcmd.push(value!(["systemctl", "start", "ssh"]));
    runcmd.push(value!(["systemctl", "start", "avahi-daemon"]));

    let config = value!({
        "datasource_list": ["NoCloud", "None"],
        "final_message": (opts.sentinel),
        "hostname": (hostname),
        "fqdn": (fqdn.as_str()),
        "manage_etc_hosts": true,
        "package_update": false,
        "packages": (Value::from(packages)),
        "users": [user],
        "ssh_pwauth": true,
        "write_files": (Value::from(write_files)),
        "runcmd": (Value::from(runcmd)),
    });

    Ok(format!("#cloud-config\n{}", to_yaml(&config)?))
}

fn to_yaml(value: &Value) -> Result<String, VmError> {
    let yaml = facet_yaml::to_string(value).map_err(|e| VmError::Validation {
        message: format!("rendering cloud-init YAML: {e}"),
    })?;
    // cloud-init expects #cloud-config as the first line, not a document separator.
    Ok(yaml.strip_prefix("---\n").unwrap_or(&yaml).to_string())
}

// ── packaging ─────────────────────────────────────────────

/// External tools able to build a `cidata` ISO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackagingTool {
    Hdiutil,
    /// mkisofs, genisoimage or anything else taking mkisofs flags.
    Mkisofs(String),
}

impl PackagingTool {
    /// Probed in this order when nothing is configured.
    const SEARCH: [&'static str; 3] = ["hdiutil", "mkisofs", "genisoimage"];

    pub fn program(&self) -> &str {
        match self {
            PackagingTool::Hdiutil => "hdiutil",
            PackagingTool::Mkisofs(program) => program,
        }
    }

    fn from_program(program: &str) -> Self {
        if Path::new(program).file_name().is_some_and(|f| f == "hdiutil") {
            PackagingTool::Hdiutil
        } else {
            PackagingTool::Mkisofs(program.to_string())
        }
    }

    /// The configured tool (`qemu.iso_tool`), else the first known tool on
    /// PATH.
    pub fn detect(configured: &str) -> Result<PackagingTool, VmError> {
        if !configured.is_empty() {
            if find_executable(configured).is_none() {
                return Err(VmError::DependencyMissing {
                    what: configured.to_string(),
                    hint: "qemu.iso_tool must name an installed mkisofs-compatible tool or hdiutil".into(),
                });
            }
            return Ok(Self::from_program(configured));
        }
        Self::SEARCH
            .into_iter()
            .find(|program| find_executable(program).is_some())
            .map(Self::from_program)
            .ok_or_else(|| VmError::DependencyMissing {
                what: "ISO packaging tool (hdiutil, mkisofs or genisoimage)".into(),
                hint: "install cdrtools or genisoimage (`brew install cdrtools` / `apt install genisoimage`)".into(),
            })
    }

    pub fn argv(&self, staging: &Path, output: &Path) -> Vec<String> {
        let staging = staging.display().to_string();
        let output = output.display().to_string();
        let parts: Vec<&str> = match self {
            PackagingTool::Hdiutil => vec![
                "hdiutil",
                "makehybrid",
                "-o",
                output.as_str(),
                "-hfs",
                "-joliet",
                "-iso",
                "-default-volume-name",
                "cidata",
                staging.as_str(),
            ],
            PackagingTool::Mkisofs(program) => vec![
                program.as_str(),
                "-V",
                "cidata",
                "-o",
                output.as_str(),
                "-J",
                "-r",
                staging.as_str(),
            ],
        };
        parts.into_iter().map(String::from).collect()
    }
}

/// Write `user-data`/`meta-data` into the staging directory and bundle them
/// into the VM's seed ISO.
pub async fn package_seed<R: CommandRunner>(
    runner: &R,
    tool: &PackagingTool,
    paths: &VmPaths,
    seed: &SeedFiles,
) -> Result<PathBuf, VmError> {
    let staging = paths.cloud_init_dir();
    tokio::fs::create_dir_all(&staging)
        .await
        .map_err(|e| VmError::io(format!("creating directory {}", staging.display()), e))?;
    for (name, contents) in [("user-data", &seed.user_data), ("meta-data", &seed.meta_data)] {
        let path = staging.join(name);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| VmError::io(format!("writing {}", path.display()), e))?;
    }

    let iso = paths.seed_iso();
    // hdiutil refuses to overwrite.
    let _ = tokio::fs::remove_file(&iso).await;

    runner
        .run(&tool.argv(&staging, &iso))
        .await?
        .check(tool.program())?;

    tracing::info!(path = %iso.display(), tool = tool.program(), "generated cloud-init seed ISO");
    Ok(iso)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::sample;
    use crate::runner::ToolOutput;
    use std::sync::Mutex;

    fn opts() -> RenderOptions<'static> {
        RenderOptions {
            sentinel: "CLOUD-INIT-READY",
            interface: "enp0s1",
            gateway: "192.168.105.1",
        }
    }

    #[test]
    fn user_data_is_valid_cloud_config() {
        let seed = render(&sample("web", NetworkMode::Portfwd), &opts()).unwrap();
        assert!(seed.user_data.starts_with("#cloud-config\n"));
        assert!(!seed.user_data.contains("---"));
        assert!(seed.user_data.contains("CLOUD-INIT-READY"));
        assert!(seed.user_data.contains("web.local"));
    }

    #[test]
    fn user_data_contains_user() {
        let seed = render(&sample("web", NetworkMode::Portfwd), &opts()).unwrap();
        assert!(seed.user_data.contains("user01"));
        assert!(seed.user_data.contains("plain_text_passwd"));
        assert!(seed.user_data.contains("secret"));
        assert!(seed.user_data.contains("NOPASSWD:ALL"));
        assert!(seed.user_data.contains("50-cloud-init.conf"));
    }

    #[test]
    fn portfwd_has_no_netplan() {
        let seed = render(&sample("web", NetworkMode::Portfwd), &opts()).unwrap();
        assert!(!seed.user_data.contains("01-netcfg.yaml"));
        assert!(!seed.user_data.contains("netplan"));
    }

    #[test]
    fn bridged_netplan_uses_static_address() {
        let d = sample("web", NetworkMode::Bridge);
        let ip = d.static_ip.clone().unwrap();
        let seed = render(&d, &opts()).unwrap();
        assert!(seed.user_data.contains("01-netcfg.yaml"));
        assert!(seed.user_data.contains(&format!("{ip}/24")));
        assert!(seed.user_data.contains("192.168.105.1"));
        assert!(seed.user_data.contains("enp0s1"));
        assert!(seed.user_data.contains("8.8.8.8"));
    }

    #[test]
    fn bridged_without_address_uses_dhcp() {
        let mut d = sample("web", NetworkMode::Bridge);
        d.static_ip = None;
        let netplan = build_netplan(&d, &opts()).unwrap();
        assert!(netplan.contains("dhcp4: true"));
        assert!(!netplan.contains("/24"));
    }

    #[test]
    fn meta_data_names_instance() {
        let seed = render(&sample("web", NetworkMode::Bridge), &opts()).unwrap();
        assert_eq!(seed.meta_data, "instance-id: web\nlocal-hostname: web\n");
    }

    #[test]
    fn packaging_argv() {
        let staging = Path::new("/vm/cloud-init");
        let iso = Path::new("/vm/seed.iso");
        assert_eq!(
            PackagingTool::Mkisofs("mkisofs".into()).argv(staging, iso),
            ["mkisofs", "-V", "cidata", "-o", "/vm/seed.iso", "-J", "-r", "/vm/cloud-init"]
        );
        let hd = PackagingTool::Hdiutil.argv(staging, iso);
        assert_eq!(&hd[..4], ["hdiutil", "makehybrid", "-o", "/vm/seed.iso"]);
        assert_eq!(hd.last().map(String::as_str), Some("/vm/cloud-init"));
    }

    #[test]
    fn configured_packaging_tool_wins() {
        assert_eq!(
            PackagingTool::detect("sh").unwrap(),
            PackagingTool::Mkisofs("sh".into())
        );
        assert!(matches!(
            PackagingTool::detect("lazyvm-no-such-iso-tool"),
            Err(VmError::DependencyMissing { .. })
        ));
        assert_eq!(PackagingTool::from_program("/usr/bin/hdiutil"), PackagingTool::Hdiutil);
    }

    struct FailingRunner(Mutex<Vec<Vec<String>>>);

    impl CommandRunner for FailingRunner {
        async fn run(&self, argv: &[String]) -> Result<ToolOutput, VmError> {
            self.0.lock().unwrap().push(argv.to_vec());
            Ok(ToolOutput {
                exit_code: Some(2),
                stdout: String::new(),
                stderr: "genisoimage: cannot write".into(),
            })
        }
    }

    #[tokio::test]
    async fn package_writes_pair_and_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let paths = VmPaths::new(dir.path(), "web");
        let seed = render(&sample("web", NetworkMode::Bridge), &opts()).unwrap();
        let runner = FailingRunner(Mutex::new(Vec::new()));
        let err = package_seed(&runner, &PackagingTool::Mkisofs("genisoimage".into()), &paths, &seed)
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::ExternalToolFailure { .. }));
        let staged = std::fs::read_to_string(paths.cloud_init_dir().join("user-data")).unwrap();
        assert_eq!(staged, seed.user_data);
        assert!(paths.cloud_init_dir().join("meta-data").is_file());
        assert_eq!(runner.0.lock().unwrap()[0][0], "genisoimage");
    }
}
