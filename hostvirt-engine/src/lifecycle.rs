//! Domain lifecycle.
//!
//! ```text
//! Undefined ──define──▶ Defined ──start──▶ Running ⇄ Paused
//!     ▲                    │  ▲               │
//!     └──────undefine──────┘  └──stop/destroy─┘
//! ```
//!
//! The persistent definition is the commit point of every change. Live
//! effects (hot memory/vCPU change, device hot-plug) run afterwards, only on
//! a running domain, and their failure is reported as a warning. The one
//! composite that rolls back is define with `auto_start`.
//!
//! `modify_*`, `attach_disk` and `detach_disk` read the persistent document,
//! patch it in place and redefine it. Two of them racing on the same domain
//! can lose an update; callers serialize them per domain.

use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::DomainDefaults;
use crate::connection::Connection;
use crate::descriptor::{from_xml, patch, to_xml, Disk, DomainDescriptor, DomainSpec};
use crate::error::{HypervisorError, Result, ResultExt};
use crate::exec::Executor;
use crate::media::IsoBuilder;
use crate::types::*;

/// Drives domains through their lifecycle on one hypervisor.
pub struct DomainManager {
    connection: Arc<dyn Connection>,
    executor: Arc<dyn Executor>,
    iso_builder: Arc<dyn IsoBuilder>,
    defaults: DomainDefaults,
}

impl DomainManager {
    pub fn new(
        connection: Arc<dyn Connection>,
        executor: Arc<dyn Executor>,
        iso_builder: Arc<dyn IsoBuilder>,
        defaults: DomainDefaults,
    ) -> Self {
        Self {
            connection,
            executor,
            iso_builder,
            defaults,
        }
    }

    // =========================================================================
    // Definition
    // =========================================================================

    /// Define a persistent domain, starting it when `spec.auto_start` is set.
    ///
    /// A staged configuration ISO is removed again if anything after staging
    /// fails. If the start fails, the new definition is removed too.
    #[instrument(skip(self, spec), fields(domain = %spec.name))]
    pub async fn define(&self, spec: &DomainSpec) -> Result<Outcome<DomainSummary>> {
        let resolved = spec.resolve(&self.defaults).context("define", spec.name.as_str())?;
        let name = resolved.name.clone();
        info!(memory_mib = resolved.memory_mib, vcpus = resolved.vcpus, "Defining domain");

        let warnings = self.ensure_vnc_directory(resolved.vnc_socket_dir()).await;

        let config_iso = match &spec.cloud_init {
            Some(payload) => Some(self.iso_builder.build(&name, payload).await.context("define", &name)?),
            None => None,
        };

        let defined = async {
            let xml = to_xml(&resolved.build(config_iso.as_deref()))?;
            debug!(xml = %xml, "Domain document");
            self.connection.define_domain(&xml).await
        }
        .await;

        if let Err(e) = defined {
            self.discard_iso(config_iso.as_deref()).await;
            return Err(e.context("define", name));
        }
        info!("Domain defined");

        if resolved.auto_start {
            if let Err(e) = self.connection.start_domain(&name).await {
                warn!(error = %e, "Start after define failed, rolling back");
                if let Err(undo) = self.connection.undefine_domain(&name, UndefineFlags::all()).await {
                    warn!(error = %undo, "Failed to undefine after start failure");
                }
                self.discard_iso(config_iso.as_deref()).await;
                return Err(e.context("define", name));
            }
            info!("Domain started");
        }

        let summary = self.summary(&name).await.context("define", &name)?;
        Ok(Outcome::with_warnings(summary, warnings))
    }

    /// Remove a domain's definition, powering it off first if needed.
    #[instrument(skip(self))]
    pub async fn undefine(&self, name: &str, flags: UndefineFlags) -> Result<()> {
        let state = self.connection.domain_state(name).await.context("undefine", name)?;
        if state.is_active() {
            info!(state = ?state, "Destroying active domain before undefine");
            self.connection.destroy_domain(name).await.context("undefine", name)?;
        }
        self.connection.undefine_domain(name, flags).await.context("undefine", name)?;
        info!("Domain undefined");
        Ok(())
    }

    // =========================================================================
    // Power
    // =========================================================================

    /// Start a defined domain.
    #[instrument(skip(self))]
    pub async fn start(&self, name: &str) -> Result<Outcome<()>> {
        let descriptor = self.fetch_descriptor(name, true).await.context("start", name)?;

        // The socket directory may have been wiped (tmpfs, reboot).
        let mut warnings = Vec::new();
        if let Some(socket) = descriptor.vnc_socket() {
            if let Some((dir, _)) = socket.rsplit_once('/') {
                warnings = self.ensure_vnc_directory(if dir.is_empty() { "/" } else { dir }).await;
            }
        }

        self.connection.start_domain(name).await.context("start", name)?;
        info!("Domain started");
        Ok(Outcome::with_warnings((), warnings))
    }

    /// Ask the guest to shut down. Completion shows up in a later [`state`](Self::state).
    #[instrument(skip(self))]
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.connection.shutdown_domain(name).await.context("stop", name)?;
        info!("Shutdown requested");
        Ok(())
    }

    /// Power off immediately.
    #[instrument(skip(self))]
    pub async fn destroy(&self, name: &str) -> Result<()> {
        self.connection.destroy_domain(name).await.context("destroy", name)?;
        info!("Domain destroyed");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn reboot(&self, name: &str) -> Result<()> {
        self.connection.reboot_domain(name).await.context("reboot", name)
    }

    #[instrument(skip(self))]
    pub async fn pause(&self, name: &str) -> Result<()> {
        self.connection.suspend_domain(name).await.context("pause", name)
    }

    #[instrument(skip(self))]
    pub async fn resume(&self, name: &str) -> Result<()> {
        self.connection.resume_domain(name).await.context("resume", name)
    }

    pub async fn set_autostart(&self, name: &str, autostart: bool) -> Result<()> {
        self.connection
            .set_autostart(name, autostart)
            .await
            .context("set_autostart", name)
    }

    // =========================================================================
    // Configuration changes
    // =========================================================================

    /// Change memory (KiB) in the persistent definition, and in the running
    /// guest when `live` is set and the domain runs.
    #[instrument(skip(self))]
    pub async fn modify_memory(&self, name: &str, kib: u64, live: bool) -> Result<Outcome<()>> {
        if kib == 0 {
            return Err(HypervisorError::InvalidConfig("memory must be > 0".to_string()).context("modify_memory", name));
        }

        let (xml, _) = self.persistent_document(name).await.context("modify_memory", name)?;
        let patched = patch::set_memory_kib(&xml, kib).context("modify_memory", name)?;
        self.connection.define_domain(&patched).await.context("modify_memory", name)?;
        info!(kib, "Persistent memory updated");

        let mut warnings = Vec::new();
        if live && self.is_running(name).await.context("modify_memory", name)? {
            if let Err(e) = self.connection.set_memory(name, kib, ModifyFlags::LIVE).await {
                warn!(error = %e, "Live memory change not applied");
                warnings.push(Warning::new(WarningKind::Unsupported, format!("live memory change: {}", e)));
            }
        }
        Ok(Outcome::with_warnings((), warnings))
    }

    /// Change the vCPU count; same flow as [`modify_memory`](Self::modify_memory).
    #[instrument(skip(self))]
    pub async fn modify_vcpus(&self, name: &str, count: u32, live: bool) -> Result<Outcome<()>> {
        if count == 0 {
            return Err(HypervisorError::InvalidConfig("vcpus must be > 0".to_string()).context("modify_vcpus", name));
        }

        let (xml, _) = self.persistent_document(name).await.context("modify_vcpus", name)?;
        let patched = patch::set_vcpus(&xml, count).context("modify_vcpus", name)?;
        self.connection.define_domain(&patched).await.context("modify_vcpus", name)?;
        info!(count, "Persistent vCPU count updated");

        let mut warnings = Vec::new();
        if live && self.is_running(name).await.context("modify_vcpus", name)? {
            if let Err(e) = self.connection.set_vcpus(name, count, ModifyFlags::LIVE).await {
                warn!(error = %e, "Live vCPU change not applied");
                warnings.push(Warning::new(WarningKind::Unsupported, format!("live vCPU change: {}", e)));
            }
        }
        Ok(Outcome::with_warnings((), warnings))
    }

    /// Add a file-backed disk at `target`.
    ///
    /// The persistent definition is updated first; a running domain then gets
    /// the disk hot-plugged with the live flag only. The config copy already
    /// holds the disk, and asking for config again would be rejected as a
    /// duplicate target.
    #[instrument(skip(self))]
    pub async fn attach_disk(&self, name: &str, volume_path: &str, target: &str) -> Result<Outcome<()>> {
        let format = DiskFormat::from_path(volume_path).unwrap_or(DiskFormat::Qcow2);
        let disk_xml = to_xml(&Disk::file(volume_path, target, format)).context("attach_disk", name)?;

        let (xml, descriptor) = self.persistent_document(name).await.context("attach_disk", name)?;
        descriptor.ensure_target_free(target).context("attach_disk", name)?;
        let patched = patch::append_device(&xml, &disk_xml).context("attach_disk", name)?;
        self.connection.define_domain(&patched).await.context("attach_disk", name)?;
        info!("Disk added to persistent definition");

        let mut warnings = Vec::new();
        if self.is_running(name).await.context("attach_disk", name)? {
            if let Err(e) = self.connection.attach_device(name, &disk_xml, ModifyFlags::LIVE).await {
                warn!(error = %e, "Hot-plug failed; disk appears after next boot");
                warnings.push(Warning::new(WarningKind::Unsupported, format!("live attach of {}: {}", target, e)));
            }
        }
        Ok(Outcome::with_warnings((), warnings))
    }

    /// Remove the disk at `target`, persistent definition first, then
    /// hot-unplug it from a running domain with the live flag only.
    #[instrument(skip(self))]
    pub async fn detach_disk(&self, name: &str, target: &str) -> Result<Outcome<()>> {
        let (xml, descriptor) = self.persistent_document(name).await.context("detach_disk", name)?;
        let disk_xml = to_xml(descriptor.require_disk(target).context("detach_disk", name)?)
            .context("detach_disk", name)?;
        let patched = patch::remove_disk(&xml, target).context("detach_disk", name)?;
        self.connection.define_domain(&patched).await.context("detach_disk", name)?;
        info!("Disk removed from persistent definition");

        let mut warnings = Vec::new();
        if self.is_running(name).await.context("detach_disk", name)? {
            if let Err(e) = self.connection.detach_device(name, &disk_xml, ModifyFlags::LIVE).await {
                warn!(error = %e, "Hot-unplug failed; disk goes away after next shutdown");
                warnings.push(Warning::new(WarningKind::Unsupported, format!("live detach of {}: {}", target, e)));
            }
        }
        Ok(Outcome::with_warnings((), warnings))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn state(&self, name: &str) -> Result<DomainState> {
        self.connection.domain_state(name).await.context("state", name)
    }

    pub async fn list(&self) -> Result<Vec<DomainSummary>> {
        self.connection.list_domains().await.context("list", "domains")
    }

    /// Decoded domain document; `inactive` selects the persistent definition.
    pub async fn descriptor(&self, name: &str, inactive: bool) -> Result<DomainDescriptor> {
        self.fetch_descriptor(name, inactive).await.context("descriptor", name)
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        match self.connection.domain_state(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.context("exists", name)),
        }
    }

    /// VNC socket and, while running, the serial PTY.
    pub async fn console_info(&self, name: &str) -> Result<ConsoleInfo> {
        let running = self.is_running(name).await.context("console_info", name)?;
        let descriptor = self.fetch_descriptor(name, !running).await.context("console_info", name)?;

        Ok(ConsoleInfo {
            vnc_socket: descriptor.vnc_socket().map(String::from),
            serial_pty: if running { descriptor.serial_pty().map(String::from) } else { None },
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn fetch_descriptor(&self, name: &str, inactive: bool) -> Result<DomainDescriptor> {
        let xml = self.connection.domain_xml(name, inactive).await?;
        from_xml(&xml)
    }

    /// The persistent document as fetched, plus its decoded form for checks.
    /// Edits patch the raw text so unmodelled elements survive the redefine.
    async fn persistent_document(&self, name: &str) -> Result<(String, DomainDescriptor)> {
        let xml = self.connection.domain_xml(name, true).await?;
        let descriptor = from_xml(&xml)?;
        Ok((xml, descriptor))
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self.connection.domain_state(name).await?.is_active())
    }

    async fn summary(&self, name: &str) -> Result<DomainSummary> {
        let descriptor = self.fetch_descriptor(name, true).await?;
        let state = self.connection.domain_state(name).await?;
        Ok(DomainSummary {
            name: descriptor.name,
            uuid: descriptor.uuid,
            state,
            persistent: true,
        })
    }

    async fn ensure_vnc_directory(&self, dir: &str) -> Vec<Warning> {
        let owner = self.defaults.vnc_socket_owner.as_deref();
        match self.executor.ensure_directory(dir, self.defaults.vnc_socket_mode, owner).await {
            Ok(outcome) => {
                for warning in &outcome.warnings {
                    warn!(%warning, "VNC socket directory");
                }
                outcome.warnings
            }
            Err(e) => {
                warn!(dir = %dir, error = %e, "Could not create VNC socket directory");
                vec![Warning::new(WarningKind::PermissionDenied, format!("{}: {}", dir, e))]
            }
        }
    }

    /// Compensating cleanup; the caller is already returning an error.
    async fn discard_iso(&self, iso: Option<&str>) {
        let Some(iso) = iso else {
            return;
        };
        match self.iso_builder.discard(iso).await {
            Ok(()) => debug!(iso = %iso, "Configuration ISO removed"),
            Err(e) => warn!(iso = %iso, error = %e, "Failed to remove configuration ISO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockConnection;
    use crate::exec::MockExecutor;
    use crate::media::NoCloudIsoBuilder;

    fn manager(connection: Arc<MockConnection>) -> DomainManager {
        let executor = Arc::new(MockExecutor::new());
        let isos = Arc::new(NoCloudIsoBuilder::new(executor.clone(), "/isos", vec!["genisoimage".into()]));
        DomainManager::new(connection, executor, isos, DomainDefaults::default())
    }

    fn spec(name: &str) -> DomainSpec {
        DomainSpec {
            name: name.to_string(),
            memory_mib: 1024,
            vcpus: 1,
            disk_path: format!("/var/lib/libvirt/images/{}.qcow2", name),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_console_info_follows_state() {
        let connection = Arc::new(MockConnection::new());
        let domains = manager(connection.clone());
        domains.define(&spec("web-1")).await.unwrap();

        let stopped = domains.console_info("web-1").await.unwrap();
        assert_eq!(stopped.vnc_socket.as_deref(), Some("/var/lib/libvirt/qemu/vnc/web-1.vnc"));
        assert_eq!(stopped.serial_pty, None);

        domains.start("web-1").await.unwrap();
        let running = domains.console_info("web-1").await.unwrap();
        assert!(running.serial_pty.unwrap().starts_with("/dev/pts/"));
    }

    #[tokio::test]
    async fn test_exists() {
        let connection = Arc::new(MockConnection::new());
        let domains = manager(connection);

        assert!(!domains.exists("web-1").await.unwrap());
        domains.define(&spec("web-1")).await.unwrap();
        assert!(domains.exists("web-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_undefine_destroys_running_domain_first() {
        let connection = Arc::new(MockConnection::new());
        let domains = manager(connection.clone());
        domains.define(&spec("web-1")).await.unwrap();
        domains.start("web-1").await.unwrap();
        connection.clear_calls();

        domains.undefine("web-1", UndefineFlags::default()).await.unwrap();

        assert_eq!(connection.calls(), vec!["destroy_domain web-1", "undefine_domain web-1"]);
        assert!(!domains.exists("web-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_spec_makes_no_calls() {
        let connection = Arc::new(MockConnection::new());
        let domains = manager(connection.clone());

        let err = domains.define(&DomainSpec::default()).await.unwrap_err();

        assert!(matches!(err.root(), HypervisorError::InvalidConfig(_)));
        assert!(connection.calls().is_empty());
    }
}
