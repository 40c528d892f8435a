//! Single seam for invoking external programs (QEMU, qemu-img, the ISO
//! packager, the bridging helper). Tests substitute a fake.

use std::process::Stdio;

use crate::error::VmError;

/// Captured result of one external program run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// None when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn ok() -> Self {
        Self {
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero exit into `ExternalToolFailure`, keeping stderr.
    pub fn check(self, tool: &str) -> Result<Self, VmError> {
        if self.success() {
            Ok(self)
        } else {
            Err(VmError::ExternalToolFailure {
                tool: tool.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait CommandRunner {
    /// Run `argv[0]` with the remaining arguments and wait for it to exit.
    ///
    /// A program that cannot be spawned because it does not exist is
    /// `DependencyMissing`; a program that runs and fails is reported through
    /// the returned exit code, not as an error.
    async fn run(&self, argv: &[String]) -> Result<ToolOutput, VmError>;
}

impl<R: CommandRunner> CommandRunner for &R {
    async fn run(&self, argv: &[String]) -> Result<ToolOutput, VmError> {
        (**self).run(argv).await
    }
}

/// Runs real processes via `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn run(&self, argv: &[String]) -> Result<ToolOutput, VmError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(VmError::Validation {
                message: "empty command line".into(),
            });
        };

        tracing::debug!(program, ?args, "running external command");

        // stdin is inherited so that sudo can prompt on the terminal.
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => VmError::DependencyMissing {
                    what: program.clone(),
                    hint: format!("install {program} or put it on PATH"),
                },
                _ => VmError::io(format!("running {program}"), e),
            })?;

        let out = ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        tracing::debug!(program, exit_code = ?out.exit_code, "external command finished");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = SystemRunner
            .run(&argv(&["sh", "-c", "echo hello; echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn missing_program_is_dependency_missing() {
        let err = SystemRunner
            .run(&argv(&["lazyvm-no-such-program-xyz"]))
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::DependencyMissing { .. }));
    }

    #[tokio::test]
    async fn empty_argv_rejected() {
        assert!(SystemRunner.run(&[]).await.is_err());
    }

    #[test]
    fn check_maps_failure() {
        let out = ToolOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "no space left\n".into(),
        };
        match out.check("qemu-img").unwrap_err() {
            VmError::ExternalToolFailure {
                tool,
                exit_code,
                stderr,
            } => {
                assert_eq!(tool, "qemu-img");
                assert_eq!(exit_code, Some(1));
                assert_eq!(stderr, "no space left");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(ToolOutput::ok().check("x").is_ok());
    }
}
