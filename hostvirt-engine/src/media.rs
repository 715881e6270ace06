//! Auxiliary media: NoCloud configuration ISOs and offline password reset.
//!
//! The configuration ISO carries already-rendered cloud-init documents. The
//! NoCloud datasource expects a volume labelled `cidata` holding:
//! - `user-data` - cloud-config or shell script
//! - `meta-data` - instance metadata
//! - `network-config` (optional) - Netplan v2 network configuration
//!
//! Everything runs through the [`Executor`], so an ISO for a remote host is
//! authored on that host.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::connection::Connection;
use crate::descriptor::{from_xml, DomainDescriptor};
use crate::error::{HypervisorError, Result, ResultExt};
use crate::exec::Executor;
use crate::types::DiskFormat;

/// Rendered cloud-init documents for one domain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudInitPayload {
    pub user_data: String,
    pub meta_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_config: Option<String>,
}

impl CloudInitPayload {
    pub fn new(user_data: impl Into<String>, meta_data: impl Into<String>) -> Self {
        Self {
            user_data: user_data.into(),
            meta_data: meta_data.into(),
            network_config: None,
        }
    }

    pub fn with_network_config(mut self, config: impl Into<String>) -> Self {
        self.network_config = Some(config.into());
        self
    }

    fn files(&self) -> Vec<(&'static str, &str)> {
        let mut files = vec![("user-data", self.user_data.as_str()), ("meta-data", self.meta_data.as_str())];
        if let Some(network) = self.network_config.as_deref() {
            files.push(("network-config", network));
        }
        files
    }
}

/// Builds configuration ISOs on the hypervisor host.
#[async_trait]
pub trait IsoBuilder: Send + Sync {
    /// Author an ISO for `domain` and return its path on the host.
    async fn build(&self, domain: &str, payload: &CloudInitPayload) -> Result<String>;

    /// Remove a previously built ISO.
    async fn discard(&self, iso_path: &str) -> Result<()>;
}

/// NoCloud ISO authoring with `genisoimage`, falling back to `mkisofs`.
pub struct NoCloudIsoBuilder {
    executor: Arc<dyn Executor>,
    iso_dir: String,
    tools: Vec<String>,
}

impl NoCloudIsoBuilder {
    pub fn new(executor: Arc<dyn Executor>, iso_dir: impl Into<String>, tools: Vec<String>) -> Self {
        Self {
            executor,
            iso_dir: iso_dir.into(),
            tools,
        }
    }

    /// Where the ISO for `domain` is written.
    pub fn iso_path(&self, domain: &str) -> String {
        format!("{}/{}-cidata.iso", self.iso_dir.trim_end_matches('/'), domain)
    }

    fn staging_dir(&self, domain: &str) -> String {
        format!("{}/{}-cidata", self.iso_dir.trim_end_matches('/'), domain)
    }

    /// Run the first available authoring tool.
    async fn author(&self, iso_path: &str, staging: &str) -> Result<()> {
        let args = ["-output", iso_path, "-volid", "cidata", "-joliet", "-rock", staging];

        let mut last_error = None;
        for tool in &self.tools {
            match self.executor.run(tool, &args).await {
                Ok(_) => {
                    debug!(tool = %tool, "ISO authored");
                    return Ok(());
                }
                Err(e) if e.is_command_not_found() => {
                    debug!(tool = %tool, "ISO tool not installed, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            HypervisorError::InvalidConfig("no ISO authoring tool configured".to_string())
        }))
    }

    async fn remove_staging(&self, staging: &str, payload: &CloudInitPayload) {
        for (name, _) in payload.files() {
            let path = format!("{}/{}", staging, name);
            if let Err(e) = self.executor.remove_file(&path).await {
                debug!(path = %path, error = %e, "Failed to remove staging file");
            }
        }
        if let Err(e) = self.executor.run("rmdir", &[staging]).await {
            debug!(path = %staging, error = %e, "Failed to remove staging directory");
        }
    }
}

#[async_trait]
impl IsoBuilder for NoCloudIsoBuilder {
    #[instrument(skip(self, payload), fields(target = %self.executor.describe()))]
    async fn build(&self, domain: &str, payload: &CloudInitPayload) -> Result<String> {
        info!("Building configuration ISO");

        let staging = self.staging_dir(domain);
        let iso_path = self.iso_path(domain);

        for warning in self.executor.ensure_directory(&staging, 0o755, None).await?.warnings {
            warn!(%warning, "Staging directory");
        }

        let result = async {
            for (name, contents) in payload.files() {
                let path = format!("{}/{}", staging, name);
                self.executor.write_file(&path, contents.as_bytes()).await?;
                debug!(path = %path, "Wrote {}", name);
            }
            self.author(&iso_path, &staging).await
        }
        .await;
        self.remove_staging(&staging, payload).await;
        result.context("build_iso", domain)?;

        info!(path = %iso_path, "Configuration ISO built");
        Ok(iso_path)
    }

    async fn discard(&self, iso_path: &str) -> Result<()> {
        debug!(path = %iso_path, "Discarding configuration ISO");
        self.executor.remove_file(iso_path).await
    }
}

// =============================================================================
// PASSWORD RESET
// =============================================================================

/// Offline password reset with `virt-customize`.
///
/// The disk must be qcow2 and must not belong to a running domain.
pub struct PasswordReset {
    connection: Arc<dyn Connection>,
    executor: Arc<dyn Executor>,
    tool: String,
}

impl PasswordReset {
    pub fn new(connection: Arc<dyn Connection>, executor: Arc<dyn Executor>, tool: impl Into<String>) -> Self {
        Self {
            connection,
            executor,
            tool: tool.into(),
        }
    }

    /// Set passwords for `(user, password)` pairs on the guest disk.
    #[instrument(skip(self, credentials), fields(users = credentials.len()))]
    pub async fn reset(&self, disk_path: &str, credentials: &[(String, String)]) -> Result<()> {
        self.check_disk(disk_path).await.context("reset_password", disk_path)?;

        if credentials.is_empty() {
            return Err(HypervisorError::InvalidConfig("no credentials given".to_string())
                .context("reset_password", disk_path));
        }

        let passwords: Vec<String> = credentials
            .iter()
            .map(|(user, password)| format!("{}:password:{}", user, password))
            .collect();

        let mut args: Vec<&str> = vec!["-a", disk_path];
        for password in &passwords {
            args.push("--password");
            args.push(password);
        }

        self.executor
            .run(&self.tool, &args)
            .await
            .map_err(|e| match e {
                // The command line carries the passwords; keep them out of the error.
                HypervisorError::ExternalToolFailure { exit_code, output, .. } => {
                    HypervisorError::ExternalToolFailure {
                        command: format!("{} -a {}", self.tool, disk_path),
                        exit_code,
                        output,
                    }
                }
                other => other,
            })
            .context("reset_password", disk_path)?;

        info!(disk = %disk_path, "Passwords reset");
        Ok(())
    }

    async fn check_disk(&self, disk_path: &str) -> Result<()> {
        if DiskFormat::from_path(disk_path) != Some(DiskFormat::Qcow2) {
            return Err(HypervisorError::Unsupported(format!(
                "password reset needs a qcow2 disk, got '{}'",
                disk_path
            )));
        }

        for summary in self.connection.list_domains().await? {
            if !summary.state.is_active() {
                continue;
            }
            let xml = self.connection.domain_xml(&summary.name, false).await?;
            let descriptor: DomainDescriptor = from_xml(&xml)?;
            if descriptor.disk_paths().any(|p| p == disk_path) {
                return Err(HypervisorError::InvalidState(format!(
                    "disk is attached to running domain '{}'",
                    summary.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockExecutor;

    fn builder(executor: Arc<MockExecutor>) -> NoCloudIsoBuilder {
        NoCloudIsoBuilder::new(
            executor,
            "/var/lib/libvirt/images/cloudinit/",
            vec!["genisoimage".to_string(), "mkisofs".to_string()],
        )
    }

    #[tokio::test]
    async fn test_build_writes_documents_and_authors_iso() {
        let executor = Arc::new(MockExecutor::new());
        let payload = CloudInitPayload::new("#cloud-config\n", "instance-id: web-1\n")
            .with_network_config("version: 2\n");

        let iso = builder(executor.clone()).build("web-1", &payload).await.unwrap();

        assert_eq!(iso, "/var/lib/libvirt/images/cloudinit/web-1-cidata.iso");
        assert!(executor.has_file(&iso));
        assert_eq!(
            executor.commands()[0],
            "mkdir -p -m 755 /var/lib/libvirt/images/cloudinit/web-1-cidata"
        );

        let authored = executor.commands_starting_with("genisoimage");
        assert_eq!(authored.len(), 1);
        assert!(authored[0].contains("-volid cidata -joliet -rock"));

        let writes = executor.written_files();
        assert!(writes.iter().any(|p| p.ends_with("web-1-cidata/network-config")));
        // Staging files are gone once the ISO exists.
        assert!(!executor.has_file("/var/lib/libvirt/images/cloudinit/web-1-cidata/user-data"));
        assert!(!executor.has_directory("/var/lib/libvirt/images/cloudinit/web-1-cidata"));
    }

    #[tokio::test]
    async fn test_build_falls_back_to_mkisofs() {
        let executor = Arc::new(MockExecutor::new());
        executor.missing_program("genisoimage");

        let payload = CloudInitPayload::new("#cloud-config\n", "instance-id: db-1\n");
        let iso = builder(executor.clone()).build("db-1", &payload).await.unwrap();

        assert_eq!(executor.commands_starting_with("mkisofs").len(), 1);
        assert!(executor.has_file(&iso));
    }

    #[tokio::test]
    async fn test_build_fails_when_no_tool_is_installed() {
        let executor = Arc::new(MockExecutor::new());
        executor.missing_program("genisoimage");
        executor.missing_program("mkisofs");

        let payload = CloudInitPayload::new("#cloud-config\n", "instance-id: db-1\n");
        let err = builder(executor).build("db-1", &payload).await.unwrap_err();

        assert!(err.is_command_not_found());
    }

    #[tokio::test]
    async fn test_failed_write_removes_staging() {
        let executor = Arc::new(MockExecutor::new());
        executor.fail_write("/var/lib/libvirt/images/cloudinit/web-1-cidata/meta-data");
        let payload = CloudInitPayload::new("#cloud-config\n", "instance-id: web-1\n");

        let err = builder(executor.clone()).build("web-1", &payload).await.unwrap_err();

        assert!(err.to_string().starts_with("build_iso web-1:"));
        assert!(executor.commands_starting_with("genisoimage").is_empty());
        assert!(!executor.has_file("/var/lib/libvirt/images/cloudinit/web-1-cidata/user-data"));
        assert!(!executor.has_directory("/var/lib/libvirt/images/cloudinit/web-1-cidata"));
    }

    #[tokio::test]
    async fn test_discard_removes_iso() {
        let executor = Arc::new(MockExecutor::new());
        let payload = CloudInitPayload::new("#cloud-config\n", "instance-id: web-1\n");
        let builder = builder(executor.clone());

        let iso = builder.build("web-1", &payload).await.unwrap();
        builder.discard(&iso).await.unwrap();

        assert!(!executor.has_file(&iso));
    }
}
