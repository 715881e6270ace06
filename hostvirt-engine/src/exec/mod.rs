//! Local/remote execution shim.
//!
//! Every filesystem and process operation the engine performs on the
//! hypervisor host goes through [`Executor`]. Implementations:
//!
//! - [`LocalExecutor`] - direct subprocesses and `tokio::fs`
//! - [`SshExecutor`] - the same operations as shell commands over `ssh`
//! - [`MockExecutor`] - in-memory, for tests and `--dev` mode
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ StorageManager / DomainManager / media       │
//! └──────────────────────┬───────────────────────┘
//!                        │ Executor
//!          ┌─────────────┴─────────────┐
//!          ▼                           ▼
//! ┌─────────────────┐        ┌──────────────────┐
//! │  LocalExecutor  │        │   SshExecutor    │
//! │ (tokio process) │        │ (ssh user@host)  │
//! └─────────────────┘        └──────────────────┘
//! ```

mod local;
mod mock;
mod ssh;

pub use local::LocalExecutor;
pub use mock::MockExecutor;
pub use ssh::SshExecutor;

use async_trait::async_trait;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::EngineConfig;
use crate::error::{HypervisorError, Result};
use crate::types::Outcome;
use crate::uri::ConnectionTarget;

/// Captured result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).to_string();
        let stderr = String::from_utf8_lossy(&self.stderr);
        if !stderr.trim().is_empty() {
            if !text.trim().is_empty() {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        text.trim().to_string()
    }

    fn from_output(output: Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }

    /// Turn a non-zero exit into `ExternalToolFailure`.
    pub fn check(self, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(HypervisorError::ExternalToolFailure {
                command: command.to_string(),
                exit_code: self.exit_code,
                output: self.combined(),
            })
        }
    }
}

/// Uniform capability set for the host the hypervisor runs on.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Human readable target, `local` or `user@host`.
    fn describe(&self) -> String;

    fn is_remote(&self) -> bool;

    /// Run a program to completion. Non-zero exit is an error.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Read a whole file. Missing files are `NotFound`.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Create or replace a file.
    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()>;

    /// Names of regular files in `dir` matching a glob pattern, sorted.
    async fn list_files(&self, dir: &str, pattern: &str) -> Result<Vec<String>>;

    /// `mkdir -p` with `mode`, then a best-effort `chown` to `owner`.
    ///
    /// Ownership failures become warnings; only the directory creation
    /// itself can fail the call.
    async fn ensure_directory(&self, path: &str, mode: u32, owner: Option<&str>) -> Result<Outcome<()>>;

    /// Remove a file. Removing a missing file succeeds.
    async fn remove_file(&self, path: &str) -> Result<()>;
}

/// Pick the executor matching a connection endpoint.
pub fn executor_for(target: &ConnectionTarget, config: &EngineConfig) -> Arc<dyn Executor> {
    match target.ssh_target() {
        Some(ssh) => Arc::new(SshExecutor::new(ssh.clone(), &config.ssh, config.command_timeout())),
        None => Arc::new(LocalExecutor::new(config.command_timeout())),
    }
}

/// Quote a word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Join a program and its arguments into one shell command line.
pub fn shell_join(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Spawn `cmd`, feed it `input`, and wait up to `deadline`.
///
/// Returns `Ok(None)` when the deadline passed; the child is killed when the
/// wait future is dropped.
pub(crate) async fn spawn_and_wait(
    mut cmd: Command,
    input: Option<&[u8]>,
    deadline: Duration,
) -> std::io::Result<Option<Output>> {
    cmd.stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;

    if let Some(input) = input {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }
    }

    match tokio::time::timeout(deadline, child.wait_with_output()).await {
        Ok(output) => output.map(Some),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/var/lib/libvirt/images/a.qcow2"), "/var/lib/libvirt/images/a.qcow2");
        assert_eq!(shell_quote("20G"), "20G");
        assert_eq!(shell_quote("two words"), "'two words'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("*.iso"), "'*.iso'");
    }

    #[test]
    fn test_shell_join() {
        assert_eq!(
            shell_join("qemu-img", &["resize", "/images/my disk.qcow2", "20G"]),
            "qemu-img resize '/images/my disk.qcow2' 20G"
        );
    }

    #[test]
    fn test_combined_output_and_check() {
        let output = CommandOutput {
            exit_code: Some(1),
            stdout: b"partial\n".to_vec(),
            stderr: b"qemu-img: Could not open\n".to_vec(),
        };
        assert_eq!(output.combined(), "partial\nqemu-img: Could not open");

        let err = output.check("qemu-img info x").unwrap_err();
        match err {
            HypervisorError::ExternalToolFailure { command, exit_code, output } => {
                assert_eq!(command, "qemu-img info x");
                assert_eq!(exit_code, Some(1));
                assert!(output.contains("Could not open"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_executor_for_target() {
        let config = EngineConfig::default();

        let local = ConnectionTarget::parse("qemu:///system").unwrap();
        assert!(!executor_for(&local, &config).is_remote());

        let remote = ConnectionTarget::parse("qemu+ssh://ops@kvm01/system").unwrap();
        let executor = executor_for(&remote, &config);
        assert!(executor.is_remote());
        assert_eq!(executor.describe(), "ops@kvm01");
    }
}
