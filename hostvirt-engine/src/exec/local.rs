//! Executor for a hypervisor running on this host.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::{shell_join, spawn_and_wait, CommandOutput, Executor};
use crate::error::{HypervisorError, Result};
use crate::types::{Outcome, Warning, WarningKind};

/// Runs commands as local subprocesses.
pub struct LocalExecutor {
    timeout: Duration,
}

impl LocalExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn describe(&self) -> String {
        "local".to_string()
    }

    fn is_remote(&self) -> bool {
        false
    }

    #[instrument(skip(self, args), fields(program = %program))]
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let cmdline = shell_join(program, args);
        debug!(command = %cmdline, "Running local command");

        let mut cmd = Command::new(program);
        cmd.args(args);

        let output = match spawn_and_wait(cmd, None, self.timeout).await {
            Ok(Some(output)) => CommandOutput::from_output(output),
            Ok(None) => {
                warn!(command = %cmdline, timeout_secs = self.timeout.as_secs(), "Command timed out");
                return Err(HypervisorError::Timeout(format!(
                    "`{}` exceeded {}s",
                    cmdline,
                    self.timeout.as_secs()
                )));
            }
            // Report a missing binary the way a shell would.
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(HypervisorError::ExternalToolFailure {
                    command: cmdline,
                    exit_code: Some(127),
                    output: format!("{}: command not found", program),
                });
            }
            Err(e) => return Err(HypervisorError::Io(e)),
        };

        output.check(&cmdline)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => HypervisorError::NotFound(format!("file {}", path)),
            _ => HypervisorError::Io(e),
        })
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn list_files(&self, dir: &str, pattern: &str) -> Result<Vec<String>> {
        let full = format!("{}/{}", glob::Pattern::escape(dir.trim_end_matches('/')), pattern);
        let paths = glob::glob(&full)
            .map_err(|e| HypervisorError::InvalidConfig(format!("bad pattern '{}': {}", pattern, e)))?;

        let mut names: Vec<String> = paths
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file())
            .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn ensure_directory(&self, path: &str, mode: u32, owner: Option<&str>) -> Result<Outcome<()>> {
        tokio::fs::create_dir_all(path).await?;

        let mut warnings = Vec::new();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await {
                warn!(error = %e, "Failed to set directory mode");
                warnings.push(Warning::new(
                    WarningKind::PermissionDenied,
                    format!("chmod {:o} {}: {}", mode, path, e),
                ));
            }
        }

        if let Some(owner) = owner {
            if let Err(e) = self.run("chown", &[owner, path]).await {
                warn!(owner = %owner, error = %e, "Failed to change directory ownership");
                warnings.push(Warning::new(
                    WarningKind::PermissionDenied,
                    format!("chown {} {}: {}", owner, path, e),
                ));
            }
        }

        Ok(Outcome::with_warnings((), warnings))
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HypervisorError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_str(path: &std::path::Path) -> String {
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let executor = LocalExecutor::default();
        let output = executor.run("sh", &["-c", "echo hello"]).await.unwrap();
        assert_eq!(output.stdout_str().trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_nonzero_is_external_tool_failure() {
        let executor = LocalExecutor::default();
        let err = executor.run("sh", &["-c", "echo broken >&2; exit 3"]).await.unwrap_err();
        match err {
            HypervisorError::ExternalToolFailure { exit_code, output, .. } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(output, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_reports_127() {
        let executor = LocalExecutor::default();
        let err = executor.run("hostvirt-no-such-tool", &[]).await.unwrap_err();
        assert!(err.is_command_not_found());
    }

    #[tokio::test]
    async fn test_deadline_kills_process() {
        let executor = LocalExecutor::new(Duration::from_millis(100));
        let err = executor.run("sleep", &["5"]).await.unwrap_err();
        assert!(matches!(err, HypervisorError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_file_round_trip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::default();
        let base = path_str(dir.path());

        executor.write_file(&format!("{}/a.iso", base), b"one").await.unwrap();
        executor.write_file(&format!("{}/b.iso", base), b"two").await.unwrap();
        executor.write_file(&format!("{}/c.qcow2", base), b"three").await.unwrap();

        assert_eq!(executor.read_file(&format!("{}/b.iso", base)).await.unwrap(), b"two");
        assert_eq!(executor.list_files(&base, "*.iso").await.unwrap(), vec!["a.iso", "b.iso"]);

        executor.remove_file(&format!("{}/a.iso", base)).await.unwrap();
        executor.remove_file(&format!("{}/a.iso", base)).await.unwrap();
        assert_eq!(executor.list_files(&base, "*.iso").await.unwrap(), vec!["b.iso"]);
    }

    #[tokio::test]
    async fn test_read_missing_file_is_not_found() {
        let executor = LocalExecutor::default();
        let err = executor.read_file("/nonexistent/hostvirt/file").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_ensure_directory_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::default();
        let target = path_str(&dir.path().join("vnc/sockets"));

        let first = executor.ensure_directory(&target, 0o750, None).await.unwrap();
        let second = executor.ensure_directory(&target, 0o750, None).await.unwrap();

        assert!(first.is_clean());
        assert!(second.is_clean());
        assert!(dir.path().join("vnc/sockets").is_dir());
    }

    #[tokio::test]
    async fn test_ensure_directory_owner_failure_is_warning() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::default();
        let target = path_str(&dir.path().join("vnc"));

        let outcome = executor
            .ensure_directory(&target, 0o755, Some("hostvirt-no-such-user:nogroup"))
            .await
            .unwrap();

        assert!(outcome.has_warning(WarningKind::PermissionDenied));
        assert!(dir.path().join("vnc").is_dir());
    }
}
