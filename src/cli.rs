use clap::{Parser, Subcommand, ValueEnum};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::descriptor::{Accel, Arch, NetworkMode};

#[derive(Parser, Debug)]
#[command(name = "lazyvm", version, about = "Provision, supervise and tear down local QEMU VMs")]
pub struct Cli {
    /// Path to config file [default: ~/.vm/config.toml]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, provision and boot a new VM
    Create(CreateArgs),

    /// Boot an existing, stopped VM
    Start {
        name: String,
    },

    /// Shut a VM down (graceful, then forced)
    Stop {
        name: String,
    },

    /// Stop a VM and remove all of its files
    Delete {
        name: String,

        /// Do not ask for confirmation
        #[arg(short, long)]
        force: bool,
    },

    /// List all VMs
    List {
        #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
        output: OutputFormat,
    },

    /// Show provisioning, network and process state of a VM
    Status {
        name: String,

        #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
        output: OutputFormat,
    },

    /// Wait until a VM has finished provisioning
    Wait {
        name: String,

        /// Seconds to wait [default: boot.timeout_s from config]
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// List the base images lazyvm can install
    Images,
}

#[derive(clap::Args, Debug, Default)]
pub struct CreateArgs {
    /// VM name; a random one is generated when omitted
    #[arg(short, long)]
    pub name: Option<String>,

    /// Guest architecture [default: host architecture]
    #[arg(long, value_parser = parse_arch)]
    pub arch: Option<Arch>,

    /// Login user [default: defaults.username]
    #[arg(long)]
    pub user: Option<String>,

    /// Login password; a random one is generated when omitted
    #[arg(long)]
    pub pass: Option<String>,

    /// Memory, e.g. 2G or 4096M
    #[arg(long)]
    pub memory: Option<String>,

    #[arg(long)]
    pub cpus: Option<u32>,

    /// Disk size, e.g. 20G
    #[arg(long)]
    pub disk: Option<String>,

    /// Networking mode
    #[arg(long, value_enum)]
    pub net_type: Option<NetArg>,

    /// Virtualization backend hint
    #[arg(long, value_enum)]
    pub virt: Option<VirtArg>,

    /// Static address for bridged networking [default: derived from the name]
    #[arg(long)]
    pub ip: Option<Ipv4Addr>,

    /// Base image (see `lazyvm images`)
    #[arg(long)]
    pub image: Option<String>,

    /// Seconds to wait for provisioning [default: boot.timeout_s from config]
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Return once the VM is launched instead of waiting for provisioning
    #[arg(long)]
    pub no_wait: bool,
}

fn parse_arch(s: &str) -> Result<Arch, String> {
    s.parse::<Arch>().map_err(|e| e.to_string())
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum NetArg {
    Bridge,
    Portfwd,
}

impl From<NetArg> for NetworkMode {
    fn from(n: NetArg) -> Self {
        match n {
            NetArg::Bridge => NetworkMode::Bridge,
            NetArg::Portfwd => NetworkMode::Portfwd,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum VirtArg {
    /// Pure emulation
    Qemu,
    Kvm,
    Hvf,
}

impl From<VirtArg> for Accel {
    fn from(v: VirtArg) -> Self {
        match v {
            VirtArg::Qemu => Accel::Tcg,
            VirtArg::Kvm => Accel::Kvm,
            VirtArg::Hvf => Accel::Hvf,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Plain,
    Json,
}
