//! Start, probe and stop the hypervisor process.
//!
//! QEMU daemonizes, so no child handle survives `start`. Every later
//! operation rehydrates the process handle from the VM directory: the pid
//! file QEMU writes itself, the monitor socket and the console log.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::descriptor::NetworkMode;
use crate::error::VmError;
use crate::paths::VmPaths;
use crate::runner::CommandRunner;

/// Directives written to the monitor socket, in order.
const SHUTDOWN_DIRECTIVES: &[u8] = b"system_powerdown\nquit\n";
const MONITOR_TIMEOUT: Duration = Duration::from_secs(2);
/// How long `start` waits for the daemonized hypervisor's pid file.
const PID_FILE_WAIT: Duration = Duration::from_secs(5);
/// Time given to the kernel to tear down a killed process.
const KILL_SETTLE: Duration = Duration::from_secs(2);

/// Live process identity of one VM, reconstructed from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: i32,
    pub monitor_socket: PathBuf,
    pub console_log: PathBuf,
}

impl ProcessHandle {
    /// Rebuild the handle from the VM directory. None when no live process
    /// backs it, which is the normal stopped state. A pid file left behind
    /// by a crash may name a recycled pid, so the process must also be the
    /// hypervisor that was told to write this pid file.
    pub fn rehydrate(paths: &VmPaths) -> Option<Self> {
        let pid_file = paths.pid_file();
        let pid = read_pid(&pid_file)?;
        if !pid_alive(pid) {
            return None;
        }
        if !owns_pid_file(pid, &pid_file) {
            tracing::debug!(pid, path = %pid_file.display(), "pid file names an unrelated process");
            return None;
        }
        Some(Self {
            pid,
            monitor_socket: paths.monitor_socket(),
            console_log: paths.console_log(),
        })
    }
}

/// Parse a pid file. Missing, unparsable or non-positive is None.
pub fn read_pid(pid_file: &Path) -> Option<i32> {
    let raw = std::fs::read_to_string(pid_file).ok()?;
    match raw.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Some(pid),
        _ => None,
    }
}

/// Zero-effect signal probe. A process we may not signal (EPERM) still
/// exists; anything else is treated as gone.
pub fn pid_alive(pid: i32) -> bool {
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// True when `pid`'s command line carries `-pidfile <pid_file>`, as every
/// hypervisor launched by lazyvm does.
pub fn owns_pid_file(pid: i32, pid_file: &Path) -> bool {
    let want = pid_file.display().to_string();
    process_args(pid).is_some_and(|args| args.windows(2).any(|w| w[0] == "-pidfile" && w[1] == want))
}

#[cfg(target_os = "linux")]
fn process_args(pid: i32) -> Option<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    Some(
        raw.split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect(),
    )
}

/// No procfs: ask ps. Arguments come back space-joined, so a work root
/// containing spaces never matches.
#[cfg(not(target_os = "linux"))]
fn process_args(pid: i32) -> Option<Vec<String>> {
    let out = std::process::Command::new("ps")
        .args(["-ww", "-o", "command=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    out.status.success().then(|| {
        String::from_utf8_lossy(&out.stdout)
            .split_whitespace()
            .map(String::from)
            .collect()
    })
}

/// The bridging helper (socket_vmnet_client) wraps QEMU so that it inherits
/// a connected socket on fd 3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeHelper {
    pub client: PathBuf,
    pub socket: PathBuf,
    pub use_sudo: bool,
}

impl BridgeHelper {
    pub fn from_config(host: &HostConfig) -> Self {
        Self {
            client: host.bridge_client(),
            socket: host.bridge_socket(),
            use_sudo: host.config.bridge.use_sudo,
        }
    }

    pub fn wrap(&self, argv: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(argv.len() + 3);
        if self.use_sudo {
            out.push("sudo".to_string());
        }
        out.push(self.client.display().to_string());
        out.push(self.socket.display().to_string());
        out.extend(argv.iter().cloned());
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited on its own within the grace period.
    Graceful,
    /// Still alive at the deadline and killed.
    Forced,
    /// Nothing was running.
    AlreadyStopped,
}

pub struct ProcessSupervisor<R> {
    runner: R,
    bridge: BridgeHelper,
    grace: Duration,
    poll: Duration,
}

impl<R: CommandRunner> ProcessSupervisor<R> {
    pub fn new(runner: R, host: &HostConfig) -> Self {
        Self {
            runner,
            bridge: BridgeHelper::from_config(host),
            grace: host.stop_grace(),
            poll: host.stop_poll_interval(),
        }
    }

    /// Launch a built hypervisor argv and return the handle recovered from
    /// its pid file.
    pub async fn start(
        &self,
        name: &str,
        paths: &VmPaths,
        argv: &[String],
        network: NetworkMode,
    ) -> Result<ProcessHandle, VmError> {
        if let Some(pid) = self.probe(paths) {
            return Err(VmError::AlreadyRunning {
                name: name.to_string(),
                pid,
            });
        }
        // A leftover pid file from a crashed run would otherwise be mistaken
        // for the new process's.
        remove_pid_file(paths);

        let argv = match network {
            NetworkMode::Bridge => self.bridge.wrap(argv),
            NetworkMode::Portfwd => argv.to_vec(),
        };
        let tool = argv.first().cloned().unwrap_or_default();

        tracing::info!(name, network = %network, "starting hypervisor");
        let out = self.runner.run(&argv).await?;
        if !out.success() {
            if network == NetworkMode::Bridge && self.bridge.use_sudo && looks_like_privilege_failure(&out.stderr) {
                return Err(VmError::PrivilegeError {
                    tool: self.bridge.client.display().to_string(),
                    message: out.stderr.trim().to_string(),
                });
            }
            return Err(VmError::ExternalToolFailure {
                tool,
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }

        let deadline = Instant::now() + PID_FILE_WAIT;
        loop {
            if let Some(handle) = ProcessHandle::rehydrate(paths) {
                tracing::info!(name, pid = handle.pid, "hypervisor running");
                return Ok(handle);
            }
            if Instant::now() >= deadline {
                return Err(VmError::ExternalToolFailure {
                    tool,
                    exit_code: out.exit_code,
                    stderr: format!(
                        "exited without leaving a live process behind {}",
                        paths.pid_file().display()
                    ),
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Pid of the live hypervisor, if any.
    pub fn probe(&self, paths: &VmPaths) -> Option<i32> {
        ProcessHandle::rehydrate(paths).map(|h| h.pid)
    }

    pub fn is_running(&self, paths: &VmPaths) -> bool {
        self.probe(paths).is_some()
    }

    /// Graceful-then-forceful stop. Idempotent: stopping a stopped VM
    /// succeeds. The pid file is gone afterwards unless `cancel` fires
    /// during the grace period, which leaves the VM shutting down.
    pub async fn stop(
        &self,
        name: &str,
        paths: &VmPaths,
        cancel: &CancellationToken,
    ) -> Result<StopOutcome, VmError> {
        let Some(handle) = ProcessHandle::rehydrate(paths) else {
            remove_pid_file(paths);
            tracing::debug!(name, "not running");
            return Ok(StopOutcome::AlreadyStopped);
        };
        let pid = handle.pid;

        if handle.monitor_socket.exists() {
            match send_shutdown(&handle.monitor_socket).await {
                Ok(()) => tracing::info!(name, pid, "sent shutdown to monitor"),
                Err(e) => tracing::debug!(name, pid, error = %e, "monitor unreachable"),
            }
        }

        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if !pid_alive(pid) {
                remove_pid_file(paths);
                tracing::info!(name, pid, "stopped");
                return Ok(StopOutcome::Graceful);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(name, pid, "stop interrupted during grace period");
                    return Err(VmError::Cancelled);
                }
                _ = tokio::time::sleep(self.poll.min(remaining)) => {}
            }
        }

        if pid_alive(pid) {
            tracing::warn!(name, pid, grace_s = self.grace.as_secs(), "graceful shutdown timed out, killing");
            self.kill(pid).await?;
            let settle = Instant::now() + KILL_SETTLE;
            while pid_alive(pid) && Instant::now() < settle {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        remove_pid_file(paths);
        Ok(StopOutcome::Forced)
    }

    async fn kill(&self, pid: i32) -> Result<(), VmError> {
        match signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(Errno::EPERM) if self.bridge.use_sudo => {
                // Bridged guests run as root under sudo.
                let argv = ["sudo", "kill", "-KILL"]
                    .into_iter()
                    .map(String::from)
                    .chain(std::iter::once(pid.to_string()))
                    .collect::<Vec<_>>();
                self.runner.run(&argv).await?.check("sudo kill")?;
                Ok(())
            }
            Err(e) => Err(VmError::PrivilegeError {
                tool: "kill".into(),
                message: format!("cannot signal pid {pid}: {e}"),
            }),
        }
    }
}

async fn send_shutdown(socket: &Path) -> std::io::Result<()> {
    let write = async {
        let mut stream = tokio::net::UnixStream::connect(socket).await?;
        stream.write_all(SHUTDOWN_DIRECTIVES).await?;
        stream.flush().await
    };
    tokio::time::timeout(MONITOR_TIMEOUT, write)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "monitor write timed out"))?
}

fn remove_pid_file(paths: &VmPaths) {
    match std::fs::remove_file(paths.pid_file()) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %paths.pid_file().display(), error = %e, "could not remove pid file"),
    }
}

fn looks_like_privilege_failure(stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    ["password is required", "sudoers", "a terminal is required", "permission denied", "operation not permitted"]
        .iter()
        .any(|needle| s.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ToolOutput;
    use std::process::{Child, Command};
    use std::sync::Mutex;

    /// Records argv and answers with a canned result.
    struct FakeRunner {
        calls: Mutex<Vec<Vec<String>>>,
        reply: ToolOutput,
    }

    impl FakeRunner {
        fn new(reply: ToolOutput) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                reply,
            }
        }
    }

    impl CommandRunner for FakeRunner {
        async fn run(&self, argv: &[String]) -> Result<ToolOutput, VmError> {
            self.calls.lock().unwrap().push(argv.to_vec());
            Ok(self.reply.clone())
        }
    }

    fn host(root: &Path) -> HostConfig {
        let mut host = HostConfig::with_work_root(root);
        host.config.bridge.client = "/opt/vmnet/bin/socket_vmnet_client".into();
        host.config.bridge.socket = "/var/run/socket_vmnet".into();
        host.config.stop.grace_s = 1;
        host.config.stop.poll_interval_ms = 100;
        host
    }

    fn vm_paths(root: &Path) -> VmPaths {
        let p = VmPaths::new(root, "test-node");
        std::fs::create_dir_all(p.dir()).unwrap();
        p
    }

    /// A shell standing in for QEMU: its command line names the pid file the
    /// way a real launch does. Reaped on exit so the probe sees it vanish.
    fn spawn_hypervisor(script: &str, pid_file: &Path) -> (i32, std::thread::JoinHandle<()>) {
        let child: Child = Command::new("sh")
            .args(["-c", script, "qemu-system-x86_64", "-pidfile"])
            .arg(pid_file)
            .spawn()
            .unwrap();
        reap(child)
    }

    fn reap(mut child: Child) -> (i32, std::thread::JoinHandle<()>) {
        let pid = child.id() as i32;
        let reaper = std::thread::spawn(move || {
            let _ = child.wait();
        });
        (pid, reaper)
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bridge_wraps_with_sudo_and_helper() {
        let helper = BridgeHelper {
            client: "/c".into(),
            socket: "/s".into(),
            use_sudo: true,
        };
        assert_eq!(
            helper.wrap(&argv(&["qemu", "-m", "2G"])),
            argv(&["sudo", "/c", "/s", "qemu", "-m", "2G"])
        );
        let helper = BridgeHelper { use_sudo: false, ..helper };
        assert_eq!(helper.wrap(&argv(&["qemu"])), argv(&["/c", "/s", "qemu"]));
    }

    #[test]
    fn pid_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("qemu.pid");
        assert_eq!(read_pid(&f), None);
        std::fs::write(&f, "1234\n").unwrap();
        assert_eq!(read_pid(&f), Some(1234));
        std::fs::write(&f, "garbage").unwrap();
        assert_eq!(read_pid(&f), None);
        std::fs::write(&f, "-5").unwrap();
        assert_eq!(read_pid(&f), None);
    }

    #[test]
    fn own_process_is_alive() {
        assert!(pid_alive(std::process::id() as i32));
    }

    #[test]
    fn stale_pid_reads_as_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let p = vm_paths(dir.path());
        let (pid, reaper) = spawn_hypervisor("exit 0", &p.pid_file());
        reaper.join().unwrap();
        std::fs::write(p.pid_file(), pid.to_string()).unwrap();
        assert!(ProcessHandle::rehydrate(&p).is_none());
    }

    #[test]
    fn pid_file_ownership_follows_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let p = vm_paths(dir.path());
        let (pid, reaper) = spawn_hypervisor("while :; do sleep 1; done", &p.pid_file());
        assert!(owns_pid_file(pid, &p.pid_file()));
        assert!(!owns_pid_file(pid, &dir.path().join("other").join("qemu.pid")));
        assert!(!owns_pid_file(std::process::id() as i32, &p.pid_file()));
        signal::kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();
        reaper.join().unwrap();
    }

    #[tokio::test]
    async fn recycled_pid_is_not_signalled() {
        let dir = tempfile::tempdir().unwrap();
        let p = vm_paths(dir.path());
        let bystander = Command::new("sleep").arg("30").spawn().unwrap();
        let (pid, reaper) = reap(bystander);
        std::fs::write(p.pid_file(), pid.to_string()).unwrap();

        let runner = FakeRunner::new(ToolOutput::ok());
        let sup = ProcessSupervisor::new(&runner, &host(dir.path()));
        assert!(!sup.is_running(&p));
        let outcome = sup.stop("test-node", &p, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, StopOutcome::AlreadyStopped);
        assert!(pid_alive(pid));
        assert!(!p.pid_file().exists());
        assert!(runner.calls.lock().unwrap().is_empty());

        signal::kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();
        reaper.join().unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent_when_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let p = vm_paths(dir.path());
        std::fs::write(p.pid_file(), "not-a-pid").unwrap();
        let runner = FakeRunner::new(ToolOutput::ok());
        let sup = ProcessSupervisor::new(&runner, &host(dir.path()));

        let cancel = CancellationToken::new();
        assert_eq!(sup.stop("test-node", &p, &cancel).await.unwrap(), StopOutcome::AlreadyStopped);
        assert_eq!(sup.stop("test-node", &p, &cancel).await.unwrap(), StopOutcome::AlreadyStopped);
        assert!(!p.pid_file().exists());
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_kills_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let p = vm_paths(dir.path());
        // Ignores SIGTERM-style politeness; only SIGKILL ends it.
        let (pid, reaper) = spawn_hypervisor("trap '' TERM; while :; do sleep 1; done", &p.pid_file());
        std::fs::write(p.pid_file(), pid.to_string()).unwrap();

        let runner = FakeRunner::new(ToolOutput::ok());
        let sup = ProcessSupervisor::new(&runner, &host(dir.path()));
        assert!(sup.is_running(&p));

        let cancel = CancellationToken::new();
        let started = Instant::now();
        let outcome = sup.stop("test-node", &p, &cancel).await.unwrap();
        assert_eq!(outcome, StopOutcome::Forced);
        assert!(started.elapsed() >= Duration::from_secs(1));
        reaper.join().unwrap();
        assert!(!pid_alive(pid));
        assert!(!p.pid_file().exists());

        assert_eq!(sup.stop("test-node", &p, &cancel).await.unwrap(), StopOutcome::AlreadyStopped);
    }

    #[tokio::test]
    async fn cancel_interrupts_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let p = vm_paths(dir.path());
        let (pid, reaper) = spawn_hypervisor("while :; do sleep 1; done", &p.pid_file());
        std::fs::write(p.pid_file(), pid.to_string()).unwrap();

        let runner = FakeRunner::new(ToolOutput::ok());
        let mut config = host(dir.path());
        config.config.stop.grace_s = 30;
        let sup = ProcessSupervisor::new(&runner, &config);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = sup.stop("test-node", &p, &cancel).await.unwrap_err();
        assert!(matches!(err, VmError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        // Not killed, and still recorded as running.
        assert!(sup.is_running(&p));

        signal::kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();
        reaper.join().unwrap();
    }

    #[tokio::test]
    async fn stop_uses_monitor_socket() {
        let dir = tempfile::tempdir().unwrap();
        let p = vm_paths(dir.path());
        let (pid, reaper) = spawn_hypervisor("while :; do sleep 1; done", &p.pid_file());
        std::fs::write(p.pid_file(), pid.to_string()).unwrap();

        // Stand-in monitor: powers the "guest" off when it hears the directive.
        let listener = tokio::net::UnixListener::bind(p.monitor_socket()).unwrap();
        let monitor = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            signal::kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();
            String::from_utf8(buf).unwrap()
        });

        let runner = FakeRunner::new(ToolOutput::ok());
        let mut config = host(dir.path());
        config.config.stop.grace_s = 10;
        let sup = ProcessSupervisor::new(&runner, &config);
        let outcome = sup.stop("test-node", &p, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        assert_eq!(monitor.await.unwrap(), "system_powerdown\nquit\n");
        reaper.join().unwrap();
        assert!(!p.pid_file().exists());
    }

    #[tokio::test]
    async fn start_refuses_when_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let p = vm_paths(dir.path());
        let (pid, _reaper) = spawn_hypervisor("while :; do sleep 1; done", &p.pid_file());
        // The fake "hypervisor" daemonized and wrote its pid file.
        std::fs::write(p.pid_file(), pid.to_string()).unwrap();

        let runner = FakeRunner::new(ToolOutput::ok());
        let sup = ProcessSupervisor::new(&runner, &host(dir.path()));
        let err = sup
            .start("test-node", &p, &argv(&["qemu-system-aarch64"]), NetworkMode::Bridge)
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::AlreadyRunning { pid: found, .. } if found == pid));
        let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
    }

    #[tokio::test]
    async fn start_reports_privilege_failure() {
        let dir = tempfile::tempdir().unwrap();
        let p = vm_paths(dir.path());
        let runner = FakeRunner::new(ToolOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "sudo: a password is required\n".into(),
        });
        let sup = ProcessSupervisor::new(&runner, &host(dir.path()));
        let err = sup
            .start("test-node", &p, &argv(&["qemu-system-aarch64", "-m", "2G"]), NetworkMode::Bridge)
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::PrivilegeError { .. }));
        let calls = runner.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            argv(&[
                "sudo",
                "/opt/vmnet/bin/socket_vmnet_client",
                "/var/run/socket_vmnet",
                "qemu-system-aarch64",
                "-m",
                "2G"
            ])
        );
    }

    #[tokio::test]
    async fn start_reports_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let p = vm_paths(dir.path());
        let runner = FakeRunner::new(ToolOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "qemu: could not open disk image\n".into(),
        });
        let sup = ProcessSupervisor::new(&runner, &host(dir.path()));
        let err = sup
            .start("test-node", &p, &argv(&["qemu-system-x86_64"]), NetworkMode::Portfwd)
            .await
            .unwrap_err();
        match err {
            VmError::ExternalToolFailure { tool, stderr, .. } => {
                assert_eq!(tool, "qemu-system-x86_64");
                assert!(stderr.contains("could not open disk image"));
            }
            other => panic!("unexpected {other:?}"),
        }
        // Unwrapped in NAT mode.
        assert_eq!(runner.calls.lock().unwrap()[0], argv(&["qemu-system-x86_64"]));
    }
}
