use std::io::IsTerminal;
use std::time::Duration;

use clap::Parser;
use console::style;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use lazyvm::boot::{BootReport, BootState};
use lazyvm::cli::{Cli, Command, CreateArgs, OutputFormat};
use lazyvm::config::{self, HostConfig};
use lazyvm::descriptor::{NetworkMode, VmDescriptor};
use lazyvm::error::VmError;
use lazyvm::identity;
use lazyvm::image;
use lazyvm::logging;
use lazyvm::orchestrator::{CreateRequest, Orchestrator, check_existing_name};
use lazyvm::paths;
use lazyvm::runner::SystemRunner;
use lazyvm::supervisor::StopOutcome;
use lazyvm::vm_state::{Provisioning, StatusReport, VmStatus, VmSummary};

/// Exit code when `wait` gives up.
const EXIT_TIMEOUT: i32 = 2;
/// Exit code after Ctrl-C, as a shell would report SIGINT.
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let terminal_filter = if cli.verbose {
        EnvFilter::new("debug")
    } else if cli.quiet {
        EnvFilter::new("lazyvm=error")
    } else {
        EnvFilter::from_default_env().add_directive("lazyvm=info".parse().expect("valid log directive"))
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always captures lazyvm=debug, discards until a VM is known
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("lazyvm=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let host = config::load_config(cli.config.as_deref())?;

    let mut command = cli.command;
    // Pick the name up front so a generated one gets a log file too
    if let Command::Create(args) = &mut command {
        args.name.get_or_insert_with(identity::random_name);
    }
    if let Some(name) = vm_name(&command) {
        let log = paths::vm_log_file(&host.work_root, &identity::sanitize_name(name));
        file_handle.set_file(&log).ok();
    }

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let orchestrator = Orchestrator::new(host, SystemRunner);

    match command {
        Command::Images => print_images(orchestrator.host()),
        Command::Create(args) => {
            let quiet = cli.quiet;
            let request = create_request(args);
            let outcome = orchestrator.create(request, &cancel).await?;
            let d = &outcome.descriptor;
            if !quiet {
                println!("VM '{}' launched (pid {})", style(&d.name).bold(), outcome.pid);
                print_access(d);
            }
            if let Some(report) = outcome.boot {
                finish_wait(&d.name, &report, quiet);
            }
        }
        Command::Start { name } => {
            let handle = orchestrator.start(&name, &cancel).await?;
            println!("VM '{name}' started (pid {})", handle.pid);
            let descriptor = orchestrator.store().load(&name)?;
            print_access(&descriptor);
        }
        Command::Stop { name } => match orchestrator.stop(&name, &cancel).await? {
            StopOutcome::AlreadyStopped => println!("VM '{name}' is not running"),
            StopOutcome::Graceful => println!("VM '{name}' stopped"),
            StopOutcome::Forced => println!("VM '{name}' stopped (forced)"),
        },
        Command::Delete { name, force } => {
            check_existing_name(&name)?;
            if !orchestrator.store().paths(&name).dir().is_dir() {
                return Err(VmError::NotFound { name }.into());
            }
            if !force {
                confirm_delete(&name)?;
            }
            orchestrator.delete(&name, &cancel).await?;
            println!("VM '{name}' deleted");
        }
        Command::List { output } => {
            let vms = orchestrator.list()?;
            match output {
                OutputFormat::Json => println!("{}", list_json(&vms)?),
                OutputFormat::Plain => print_list(&vms),
            }
        }
        Command::Status { name, output } => {
            let report = orchestrator.status(&name)?;
            match output {
                OutputFormat::Json => println!("{}", status_json(&report)?),
                OutputFormat::Plain => print_status(&report),
            }
        }
        Command::Wait { name, timeout } => {
            let report = orchestrator
                .wait(&name, timeout.map(Duration::from_secs), &cancel)
                .await?;
            finish_wait(&name, &report, cli.quiet);
        }
    }

    Ok(())
}

fn vm_name(command: &Command) -> Option<&str> {
    match command {
        Command::Create(args) => args.name.as_deref(),
        Command::Start { name }
        | Command::Stop { name }
        | Command::Delete { name, .. }
        | Command::Status { name, .. }
        | Command::Wait { name, .. } => Some(name),
        Command::List { .. } | Command::Images => None,
    }
}

fn create_request(args: CreateArgs) -> CreateRequest {
    CreateRequest {
        name: args.name,
        arch: args.arch,
        username: args.user,
        password: args.pass,
        memory: args.memory,
        cpus: args.cpus,
        disk: args.disk,
        network: args.net_type.map(Into::into),
        accel: args.virt.map(Into::into),
        ip: args.ip,
        image: args.image,
        wait: !args.no_wait,
        timeout: args.timeout.map(Duration::from_secs),
    }
}

/// Report the end of a wait and exit with the matching code.
fn finish_wait(name: &str, report: &BootReport, quiet: bool) {
    match report.state {
        BootState::Ready => {
            if !quiet {
                let addr = report
                    .address
                    .map(|ip| format!(" at {ip}"))
                    .unwrap_or_default();
                println!(
                    "{} VM '{name}' is ready{addr} ({}s)",
                    style("✓").green(),
                    report.elapsed.as_secs()
                );
            }
        }
        BootState::TimedOut => {
            let err = VmError::Timeout {
                name: name.to_string(),
                seconds: report.elapsed.as_secs(),
            };
            eprintln!("{:?}", miette::Report::new(err));
            std::process::exit(EXIT_TIMEOUT);
        }
        BootState::Interrupted => {
            eprintln!("Interrupted; VM '{name}' keeps running");
            std::process::exit(EXIT_INTERRUPTED);
        }
        BootState::Unknown | BootState::Booting => {}
    }
}

fn confirm_delete(name: &str) -> Result<(), VmError> {
    if !std::io::stdin().is_terminal() {
        return Err(VmError::Validation {
            message: format!("'{name}' not deleted: pass --force to skip confirmation"),
        });
    }
    let yes = inquire::Confirm::new(&format!("Delete VM '{name}' and all of its files?"))
        .with_default(false)
        .prompt()
        .map_err(map_inquire_err)?;
    if yes { Ok(()) } else { Err(VmError::Cancelled) }
}

fn map_inquire_err(e: inquire::InquireError) -> VmError {
    match e {
        inquire::InquireError::OperationCanceled | inquire::InquireError::OperationInterrupted => {
            VmError::Cancelled
        }
        other => VmError::Validation {
            message: format!("prompt error: {other}"),
        },
    }
}

fn print_access(d: &VmDescriptor) {
    let c = &d.credentials;
    match d.network {
        NetworkMode::Bridge => {
            println!("  ssh {}@{}", c.username, d.ssh_target());
        }
        NetworkMode::Portfwd => {
            println!("  ssh -p {} {}@{}", d.ssh.port, c.username, d.ssh.host);
        }
    }
    println!("  password: {}", c.password);
}

fn print_list(vms: &[VmSummary]) {
    if vms.is_empty() {
        println!("No VMs. Create one with `lazyvm create`.");
        return;
    }
    println!(
        "{:<20} {:<8} {:<6} {:<10} {:<22} {}",
        "NAME", "STATUS", "ARCH", "IMAGE", "ADDRESS", "CREDENTIALS"
    );
    for vm in vms {
        let status = match &vm.status {
            VmStatus::Running { .. } => style(format!("{:<8}", vm.status.label())).green(),
            VmStatus::Stopped => style(format!("{:<8}", vm.status.label())).dim(),
            VmStatus::Broken { .. } => style(format!("{:<8}", vm.status.label())).red(),
        };
        match &vm.descriptor {
            Some(d) => {
                let (address, creds) = if vm.status.is_running() {
                    (
                        d.ssh_target(),
                        format!("{}/{}", d.credentials.username, d.credentials.password),
                    )
                } else {
                    ("-".to_string(), "-".to_string())
                };
                println!(
                    "{:<20} {status} {:<6} {:<10} {:<22} {creds}",
                    vm.name, d.arch.as_str(), d.image, address
                );
            }
            None => println!("{:<20} {status} {:<6} {:<10} {:<22} -", vm.name, "-", "-", "-"),
        }
    }
}

fn print_status(r: &StatusReport) {
    let d = &r.descriptor;
    println!("VM '{}'", style(&d.name).bold());
    match &r.status {
        VmStatus::Running { pid } => println!("  Process:      {} (pid {pid})", style("running").green()),
        VmStatus::Stopped => println!("  Process:      {}", style("stopped").dim()),
        VmStatus::Broken { reason } => println!("  Process:      {} ({reason})", style("broken").red()),
    }
    match r.provisioning {
        Provisioning::NotStarted => println!("  Provisioning: VM has not started yet"),
        Provisioning::Initializing => println!("  Provisioning: {}", style("initializing").yellow()),
        Provisioning::Ready => println!("  Provisioning: {}", style("ready").green()),
    }
    println!(
        "  Network:      {} ({})",
        d.network,
        if r.network_configured { "configured" } else { "not configured yet" }
    );
    match r.address {
        Some(ip) => println!("  Address:      {ip}"),
        None => println!("  Address:      {}", d.ssh_target()),
    }
    println!("  SSH:          {}", d.ssh_target());
    println!("  Arch:         {} ({})", d.arch, d.accel.as_str());
    println!(
        "  Resources:    {} RAM, {} CPUs, {} disk",
        d.resources.memory, d.resources.cpus, d.resources.disk
    );
    println!("  Image:        {}", d.image);
    println!("  Created:      {}", d.created_at);
}

fn print_images(host: &HostConfig) {
    println!("{:<10} {:<6} {:<10} {}", "IMAGE", "ARCH", "CACHED", "DESCRIPTION");
    for listing in image::list_images(&host.images_dir) {
        let cached = listing
            .cached_bytes
            .map(image::format_size)
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<10} {:<6} {:<10} {}",
            listing.image.name,
            listing.arch.as_str(),
            cached,
            listing.image.description
        );
    }
}

// ── JSON output structs ─────────────────────────────────────────────

#[derive(facet::Facet)]
struct VmJson {
    name: String,
    status: String,
    arch: Option<String>,
    image: Option<String>,
    address: Option<String>,
    username: Option<String>,
}

#[derive(facet::Facet)]
struct StatusJson {
    name: String,
    status: String,
    pid: Option<i32>,
    provisioning: String,
    network: String,
    network_configured: bool,
    address: Option<String>,
    ssh: String,
}

fn to_json<'f, T: facet::Facet<'f>>(value: &T) -> Result<String, VmError> {
    facet_json::to_string(value).map_err(|e| VmError::Validation {
        message: format!("JSON serialization failed: {e}"),
    })
}

fn list_json(vms: &[VmSummary]) -> Result<String, VmError> {
    let rows: Vec<VmJson> = vms
        .iter()
        .map(|vm| VmJson {
            name: vm.name.clone(),
            status: vm.status.label().to_lowercase(),
            arch: vm.descriptor.as_ref().map(|d| d.arch.to_string()),
            image: vm.descriptor.as_ref().map(|d| d.image.clone()),
            address: vm.descriptor.as_ref().map(VmDescriptor::ssh_target),
            username: vm.descriptor.as_ref().map(|d| d.credentials.username.clone()),
        })
        .collect();
    to_json(&rows)
}

fn status_json(r: &StatusReport) -> Result<String, VmError> {
    let pid = match r.status {
        VmStatus::Running { pid } => Some(pid),
        _ => None,
    };
    to_json(&StatusJson {
        name: r.descriptor.name.clone(),
        status: r.status.label().to_lowercase(),
        pid,
        provisioning: match r.provisioning {
            Provisioning::NotStarted => "not-started",
            Provisioning::Initializing => "initializing",
            Provisioning::Ready => "ready",
        }
        .to_string(),
        network: r.descriptor.network.to_string(),
        network_configured: r.network_configured,
        address: r.address.map(|ip| ip.to_string()),
        ssh: r.descriptor.ssh_target(),
    })
}
