use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum VmError {
    #[error("VM '{name}' does not exist")]
    #[diagnostic(help("run `lazyvm list` to see the VMs that exist"))]
    NotFound { name: String },

    #[error("VM '{name}' already exists")]
    #[diagnostic(help("pick another name or delete the existing VM first"))]
    AlreadyExists { name: String },

    #[error("descriptor for VM '{name}' at {path} is unreadable: {message}")]
    #[diagnostic(help("fix or delete the descriptor file by hand"))]
    CorruptState {
        name: String,
        path: String,
        message: String,
    },

    #[error("required dependency missing: {what}")]
    DependencyMissing {
        what: String,
        #[help]
        hint: String,
    },

    #[error("{tool} failed{}: {stderr}", exit_suffix(.exit_code))]
    ExternalToolFailure {
        tool: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("VM '{name}' did not finish provisioning within {seconds}s")]
    #[diagnostic(help("the VM keeps running; check again later with `lazyvm status`"))]
    Timeout { name: String, seconds: u64 },

    #[error("{tool} requires elevated privileges: {message}")]
    #[diagnostic(help("bridged networking runs the bridging helper through sudo; make sure sudo can run it"))]
    PrivilegeError { tool: String, message: String },

    #[error("VM '{name}' is already running (pid {pid})")]
    AlreadyRunning { name: String, pid: i32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error while {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("image download failed: {message}")]
    ImageDownload {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl VmError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        VmError::Io {
            context: context.into(),
            source,
        }
    }
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!(" with exit code {c}"),
        None => " (terminated by signal)".into(),
    }
}
