//! Executor for a hypervisor reached over a secure shell.
//!
//! Every operation becomes a single non-interactive `ssh` invocation with
//! host-key checking disabled. File contents travel over stdin/stdout.

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::{shell_join, shell_quote, spawn_and_wait, CommandOutput, Executor};
use crate::config::SshConfig;
use crate::error::{HypervisorError, Result};
use crate::types::{Outcome, Warning, WarningKind};
use crate::uri::SshTarget;

/// Exit status `ssh` reserves for its own failures.
const SSH_FAILURE_EXIT: i32 = 255;

/// Runs commands on a remote host through the `ssh` client.
pub struct SshExecutor {
    target: SshTarget,
    binary: String,
    connect_timeout_secs: u64,
    identity_file: Option<String>,
    timeout: Duration,
}

impl SshExecutor {
    pub fn new(target: SshTarget, config: &SshConfig, timeout: Duration) -> Self {
        Self {
            binary: config.binary.clone(),
            connect_timeout_secs: config.connect_timeout_secs,
            // A `keyfile` named by the connection URI wins over the configured key.
            identity_file: target.keyfile.clone().or_else(|| config.identity_file.clone()),
            target,
            timeout,
        }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Arguments passed to `ssh` ahead of the remote command line.
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ];
        if let Some(port) = self.target.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        args.push(self.target.destination());
        args.push("--".to_string());
        args
    }

    /// Run a shell command line remotely and return its raw output.
    async fn exec_raw(&self, command_line: &str, input: Option<&[u8]>) -> Result<CommandOutput> {
        debug!(target_host = %self.target, command = %command_line, "Running remote command");

        let mut cmd = Command::new(&self.binary);
        cmd.args(self.ssh_args()).arg(command_line);

        match spawn_and_wait(cmd, input, self.timeout).await {
            Ok(Some(output)) => {
                let output = CommandOutput::from_output(output);
                if output.exit_code == Some(SSH_FAILURE_EXIT) {
                    return Err(HypervisorError::RemoteUnreachable(format!(
                        "{}: {}",
                        self.target,
                        output.combined()
                    )));
                }
                Ok(output)
            }
            Ok(None) => {
                warn!(target_host = %self.target, command = %command_line, "Remote command timed out");
                Err(HypervisorError::Timeout(format!(
                    "`{}` on {} exceeded {}s",
                    command_line,
                    self.target,
                    self.timeout.as_secs()
                )))
            }
            Err(e) => Err(HypervisorError::RemoteUnreachable(format!(
                "{}: failed to spawn {}: {}",
                self.target, self.binary, e
            ))),
        }
    }

    async fn exec_checked(&self, command_line: &str, input: Option<&[u8]>) -> Result<CommandOutput> {
        self.exec_raw(command_line, input).await?.check(command_line)
    }
}

#[async_trait]
impl Executor for SshExecutor {
    fn describe(&self) -> String {
        self.target.destination()
    }

    fn is_remote(&self) -> bool {
        true
    }

    #[instrument(skip(self, args), fields(host = %self.target.host, program = %program))]
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.exec_checked(&shell_join(program, args), None).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let command_line = shell_join("cat", &[path]);
        let output = self.exec_raw(&command_line, None).await?;
        if output.success() {
            return Ok(output.stdout);
        }
        if String::from_utf8_lossy(&output.stderr).contains("No such file") {
            return Err(HypervisorError::NotFound(format!("file {} on {}", path, self.target)));
        }
        output.check(&command_line).map(|o| o.stdout)
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let command_line = format!("cat > {}", shell_quote(path));
        self.exec_checked(&command_line, Some(contents)).await?;
        Ok(())
    }

    async fn list_files(&self, dir: &str, pattern: &str) -> Result<Vec<String>> {
        let command_line = format!(
            "find {} -maxdepth 1 -type f -name {} -printf '%f\\n'",
            shell_quote(dir),
            shell_quote(pattern)
        );
        let output = self.exec_checked(&command_line, None).await?;

        let mut names: Vec<String> = output
            .stdout_str()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self), fields(host = %self.target.host, path = %path))]
    async fn ensure_directory(&self, path: &str, mode: u32, owner: Option<&str>) -> Result<Outcome<()>> {
        let mode = format!("{:o}", mode);
        self.run("mkdir", &["-p", "-m", &mode, path]).await?;

        let mut warnings = Vec::new();
        if let Some(owner) = owner {
            if let Err(e) = self.run("chown", &[owner, path]).await {
                // Ownership is cosmetic for the hypervisor; never fail on it.
                warn!(owner = %owner, error = %e, "Failed to change remote directory ownership");
                warnings.push(Warning::new(
                    WarningKind::PermissionDenied,
                    format!("chown {} {} on {}: {}", owner, path, self.target, e),
                ));
            }
        }

        Ok(Outcome::with_warnings((), warnings))
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.run("rm", &["-f", path]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(port: Option<u16>, identity: Option<&str>) -> SshExecutor {
        let target = SshTarget {
            user: "root".to_string(),
            host: "kvm01".to_string(),
            port,
            keyfile: None,
        };
        let config = SshConfig {
            identity_file: identity.map(String::from),
            ..SshConfig::default()
        };
        SshExecutor::new(target, &config, Duration::from_secs(5))
    }

    #[test]
    fn test_ssh_args_are_non_interactive() {
        let args = executor(None, None).ssh_args();
        assert_eq!(
            args,
            vec![
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=10",
                "root@kvm01",
                "--",
            ]
        );
    }

    #[test]
    fn test_ssh_args_with_port_and_identity() {
        let args = executor(Some(2222), Some("/etc/hostvirt/id_ed25519")).ssh_args();
        let joined = args.join(" ");
        assert!(joined.contains("-p 2222"));
        assert!(joined.contains("-i /etc/hostvirt/id_ed25519"));
        assert!(joined.ends_with("root@kvm01 --"));
    }

    #[test]
    fn test_uri_keyfile_overrides_configured_identity() {
        let target = SshTarget {
            user: "root".to_string(),
            host: "kvm01".to_string(),
            port: None,
            keyfile: Some("/root/.ssh/kvm01".to_string()),
        };
        let config = SshConfig {
            identity_file: Some("/etc/hostvirt/id_ed25519".to_string()),
            ..SshConfig::default()
        };
        let args = SshExecutor::new(target, &config, Duration::from_secs(5)).ssh_args().join(" ");
        assert!(args.contains("-i /root/.ssh/kvm01"));
        assert!(!args.contains("id_ed25519"));
    }

    #[tokio::test]
    async fn test_missing_ssh_binary_is_unreachable() {
        let target = SshTarget {
            user: "root".to_string(),
            host: "kvm01".to_string(),
            port: None,
            keyfile: None,
        };
        let config = SshConfig {
            binary: "hostvirt-no-such-ssh".to_string(),
            ..SshConfig::default()
        };
        let executor = SshExecutor::new(target, &config, Duration::from_secs(5));

        let err = executor.run("true", &[]).await.unwrap_err();
        assert!(matches!(err, HypervisorError::RemoteUnreachable(_)));
    }
}
