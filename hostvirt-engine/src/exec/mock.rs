//! In-memory executor for testing and development.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{RwLock, RwLockWriteGuard};
use tracing::debug;

use super::{shell_join, CommandOutput, Executor};
use crate::error::{HypervisorError, Result};
use crate::types::{Outcome, Warning, WarningKind};

#[derive(Default)]
struct ExecState {
    files: BTreeMap<String, Vec<u8>>,
    directories: BTreeSet<String>,
    commands: Vec<String>,
    writes: Vec<String>,
    /// Command-line prefix → (exit code, output)
    failures: Vec<(String, i32, String)>,
    /// Command-line prefix → stdout
    outputs: Vec<(String, String)>,
    missing: HashSet<String>,
    /// Paths `write_file` refuses
    unwritable: HashSet<String>,
    deny_chown: bool,
}

/// Executor with an in-memory filesystem.
///
/// Commands are recorded and succeed unless told otherwise. A few programs
/// have visible effects:
/// - any command with `-output <file>` creates that file
/// - `rmdir <dir>` removes the directory
/// - `find <file> -maxdepth 0 -empty -delete` removes an empty file
/// - `chown` fails when ownership changes are denied
pub struct MockExecutor {
    state: RwLock<ExecState>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ExecState::default()),
        }
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ExecState>> {
        self.state
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    /// Fail every command whose line starts with `prefix`.
    pub fn fail_command(&self, prefix: &str, exit_code: i32, output: &str) {
        if let Ok(mut state) = self.state.write() {
            state.failures.push((prefix.to_string(), exit_code, output.to_string()));
        }
    }

    /// Answer commands whose line starts with `prefix` with `stdout`.
    pub fn stub_output(&self, prefix: &str, stdout: &str) {
        if let Ok(mut state) = self.state.write() {
            state.outputs.push((prefix.to_string(), stdout.to_string()));
        }
    }

    /// Make `program` behave as if it were not installed (exit 127).
    pub fn missing_program(&self, program: &str) {
        if let Ok(mut state) = self.state.write() {
            state.missing.insert(program.to_string());
        }
    }

    /// Make `write_file` fail for `path`, as a full disk would.
    pub fn fail_write(&self, path: &str) {
        if let Ok(mut state) = self.state.write() {
            state.unwritable.insert(path.to_string());
        }
    }

    /// Refuse every ownership change.
    pub fn deny_chown(&self) {
        if let Ok(mut state) = self.state.write() {
            state.deny_chown = true;
        }
    }

    pub fn add_file(&self, path: &str, contents: &[u8]) {
        if let Ok(mut state) = self.state.write() {
            state.files.insert(path.to_string(), contents.to_vec());
        }
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.read().ok()?.files.get(path).cloned()
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.state.read().map(|s| s.files.contains_key(path)).unwrap_or(false)
    }

    pub fn has_directory(&self, path: &str) -> bool {
        self.state.read().map(|s| s.directories.contains(path)).unwrap_or(false)
    }

    /// Every command line run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.read().map(|s| s.commands.clone()).unwrap_or_default()
    }

    pub fn commands_starting_with(&self, prefix: &str) -> Vec<String> {
        self.commands().into_iter().filter(|c| c.starts_with(prefix)).collect()
    }

    /// Paths passed to `write_file`, in order.
    pub fn written_files(&self) -> Vec<String> {
        self.state.read().map(|s| s.writes.clone()).unwrap_or_default()
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecState {
    fn simulate(&mut self, program: &str, args: &[&str]) -> Result<()> {
        if let Some(pos) = args.iter().position(|a| *a == "-output") {
            if let Some(out) = args.get(pos + 1) {
                self.files.insert(out.to_string(), Vec::new());
            }
        }

        match (program, args) {
            ("rmdir", [dir]) => {
                self.directories.remove(*dir);
            }
            ("find", [path, "-maxdepth", "0", "-empty", "-delete"]) => {
                if self.files.get(*path).map(Vec::is_empty).unwrap_or(false) {
                    self.files.remove(*path);
                }
            }
            ("chown", _) if self.deny_chown => {
                return Err(HypervisorError::ExternalToolFailure {
                    command: shell_join(program, args),
                    exit_code: Some(1),
                    output: "chown: Operation not permitted".to_string(),
                });
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for MockExecutor {
    fn describe(&self) -> String {
        "mock".to_string()
    }

    fn is_remote(&self) -> bool {
        false
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let line = shell_join(program, args);
        let mut state = self.write()?;
        debug!(command = %line, "Mock executor run");
        state.commands.push(line.clone());

        if state.missing.contains(program) {
            return Err(HypervisorError::ExternalToolFailure {
                command: line,
                exit_code: Some(127),
                output: format!("{}: command not found", program),
            });
        }

        if let Some((_, code, output)) = state.failures.iter().find(|(prefix, _, _)| line.starts_with(prefix.as_str())) {
            return Err(HypervisorError::ExternalToolFailure {
                command: line.clone(),
                exit_code: Some(*code),
                output: output.clone(),
            });
        }

        state.simulate(program, args)?;
        let stdout = state
            .outputs
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, out)| out.as_bytes().to_vec())
            .unwrap_or_default();
        Ok(CommandOutput {
            exit_code: Some(0),
            stdout,
            stderr: Vec::new(),
        })
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.file(path)
            .ok_or_else(|| HypervisorError::NotFound(format!("file '{}'", path)))
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let mut state = self.write()?;
        state.writes.push(path.to_string());
        if state.unwritable.contains(path) {
            return Err(HypervisorError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("{}: No space left on device", path),
            )));
        }
        state.files.insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn list_files(&self, dir: &str, pattern: &str) -> Result<Vec<String>> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| HypervisorError::InvalidConfig(format!("bad pattern '{}': {}", pattern, e)))?;
        let prefix = format!("{}/", dir.trim_end_matches('/'));

        let state = self
            .state
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        let mut names: Vec<String> = state
            .files
            .keys()
            .filter_map(|p| p.strip_prefix(&prefix))
            .filter(|name| !name.contains('/') && pattern.matches(name))
            .map(String::from)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn ensure_directory(&self, path: &str, mode: u32, owner: Option<&str>) -> Result<Outcome<()>> {
        let mut state = self.write()?;
        state.commands.push(format!("mkdir -p -m {:o} {}", mode, path));
        state.directories.insert(path.trim_end_matches('/').to_string());

        let mut outcome = Outcome::new(());
        if let Some(owner) = owner {
            state.commands.push(format!("chown {} {}", owner, path));
            if state.deny_chown {
                outcome.warnings.push(Warning::new(
                    WarningKind::PermissionDenied,
                    format!("chown {} {}: Operation not permitted", owner, path),
                ));
            }
        }
        Ok(outcome)
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.write()?.files.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failure_injection_by_prefix() {
        let executor = MockExecutor::new();
        executor.fail_command("qemu-img resize", 1, "Image is in use");

        executor.run("qemu-img", &["info", "/a.qcow2"]).await.unwrap();
        let err = executor.run("qemu-img", &["resize", "/a.qcow2", "20G"]).await.unwrap_err();

        assert!(matches!(err, HypervisorError::ExternalToolFailure { exit_code: Some(1), .. }));
        assert_eq!(executor.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_find_empty_delete_only_removes_empty_files() {
        let executor = MockExecutor::new();
        executor.add_file("/pool/empty.qcow2", b"");
        executor.add_file("/pool/full.qcow2", b"QFI\xfb");

        for path in ["/pool/empty.qcow2", "/pool/full.qcow2"] {
            executor.run("find", &[path, "-maxdepth", "0", "-empty", "-delete"]).await.unwrap();
        }

        assert!(!executor.has_file("/pool/empty.qcow2"));
        assert!(executor.has_file("/pool/full.qcow2"));
    }

    #[tokio::test]
    async fn test_list_files_is_flat_and_sorted() {
        let executor = MockExecutor::new();
        executor.add_file("/isos/b.iso", b"");
        executor.add_file("/isos/a.iso", b"");
        executor.add_file("/isos/notes.txt", b"");
        executor.add_file("/isos/old/c.iso", b"");

        let names = executor.list_files("/isos/", "*.iso").await.unwrap();
        assert_eq!(names, vec!["a.iso", "b.iso"]);
    }

    #[tokio::test]
    async fn test_denied_chown_is_a_warning() {
        let executor = MockExecutor::new();
        executor.deny_chown();

        let outcome = executor.ensure_directory("/run/vnc", 0o750, Some("qemu:qemu")).await.unwrap();

        assert!(outcome.has_warning(WarningKind::PermissionDenied));
        assert!(executor.has_directory("/run/vnc"));
    }
}
