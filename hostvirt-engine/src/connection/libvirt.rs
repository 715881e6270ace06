//! Libvirt connection.
//!
//! Domain, pool, volume and host calls go through the `virt` bindings.
//! Snapshot and node-device calls that the bindings do not expose fall back
//! to `virsh -c <uri>`.

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, instrument};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::sys;

use super::Connection;
use crate::descriptor::{from_xml, SnapshotDescriptor};
use crate::error::{HypervisorError, Result};
use crate::exec::{shell_join, spawn_and_wait};
use crate::types::*;

/// Deadline for `virsh` fallbacks.
const VIRSH_TIMEOUT: Duration = Duration::from_secs(600);

/// Connection to a libvirt daemon, local or remote.
pub struct LibvirtConnection {
    uri: String,
    connection: Connect,
}

impl LibvirtConnection {
    /// Open a connection.
    ///
    /// Common URIs:
    /// - `qemu:///system` - system-wide QEMU/KVM
    /// - `qemu+ssh://user@host/system` - remote via SSH
    pub fn open(uri: &str) -> Result<Self> {
        info!(uri = %uri, "Connecting to libvirt");

        let connection = Connect::open(Some(uri))
            .map_err(|e| HypervisorError::ConnectionFailed(format!("{}: {}", uri, e)))?;

        info!("Connected to libvirt");
        Ok(Self { uri: uri.to_string(), connection })
    }

    fn domain(&self, name: &str) -> Result<Domain> {
        Domain::lookup_by_name(&self.connection, name)
            .map_err(|e| HypervisorError::NotFound(format!("domain '{}': {}", name, e)))
    }

    fn pool(&self, name: &str) -> Result<StoragePool> {
        StoragePool::lookup_by_name(&self.connection, name)
            .map_err(|e| HypervisorError::NotFound(format!("storage pool '{}': {}", name, e)))
    }

    fn volume(&self, pool: &str, name: &str) -> Result<StorageVol> {
        let pool_handle = self.pool(pool)?;
        StorageVol::lookup_by_name(&pool_handle, name)
            .map_err(|e| HypervisorError::NotFound(format!("volume '{}' in pool '{}': {}", name, pool, e)))
    }

    fn state_from_libvirt(state: sys::virDomainState) -> DomainState {
        match state {
            sys::VIR_DOMAIN_RUNNING => DomainState::Running,
            sys::VIR_DOMAIN_BLOCKED => DomainState::Blocked,
            sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
            sys::VIR_DOMAIN_SHUTDOWN => DomainState::ShuttingDown,
            sys::VIR_DOMAIN_SHUTOFF => DomainState::ShutOff,
            sys::VIR_DOMAIN_CRASHED => DomainState::Crashed,
            sys::VIR_DOMAIN_PMSUSPENDED => DomainState::PmSuspended,
            _ => DomainState::NoState,
        }
    }

    fn pool_state_from_libvirt(state: u32) -> PoolState {
        match state {
            sys::VIR_STORAGE_POOL_BUILDING => PoolState::Building,
            sys::VIR_STORAGE_POOL_RUNNING => PoolState::Active,
            sys::VIR_STORAGE_POOL_DEGRADED => PoolState::Degraded,
            sys::VIR_STORAGE_POOL_INACCESSIBLE => PoolState::Inaccessible,
            _ => PoolState::Inactive,
        }
    }

    fn modify_flags(flags: ModifyFlags) -> u32 {
        let mut raw = 0;
        if flags.live {
            raw |= sys::VIR_DOMAIN_AFFECT_LIVE;
        }
        if flags.config {
            raw |= sys::VIR_DOMAIN_AFFECT_CONFIG;
        }
        raw
    }

    /// Run `virsh -c <uri> <args>`, optionally feeding stdin.
    async fn virsh(&self, args: &[&str], input: Option<&[u8]>) -> Result<String> {
        let mut full: Vec<&str> = vec!["-c", self.uri.as_str()];
        full.extend_from_slice(args);
        let cmdline = shell_join("virsh", &full);
        debug!(command = %cmdline, "Running virsh fallback");

        let mut cmd = Command::new("virsh");
        cmd.args(&full);

        let output = spawn_and_wait(cmd, input, VIRSH_TIMEOUT)
            .await
            .map_err(|e| HypervisorError::ExternalToolFailure {
                command: cmdline.clone(),
                exit_code: None,
                output: e.to_string(),
            })?
            .ok_or_else(|| HypervisorError::Timeout(format!("`{}`", cmdline)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("not found") || stderr.contains("no domain snapshot") {
                return Err(HypervisorError::NotFound(stderr));
            }
            return Err(HypervisorError::ExternalToolFailure {
                command: cmdline,
                exit_code: output.status.code(),
                output: stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn rpc(e: virt::error::Error) -> HypervisorError {
        HypervisorError::Rpc(e.to_string())
    }
}

#[async_trait]
impl Connection for LibvirtConnection {
    fn uri(&self) -> String {
        self.uri.clone()
    }

    async fn is_alive(&self) -> Result<bool> {
        self.connection.is_alive().map_err(Self::rpc)
    }

    #[instrument(skip(self, xml))]
    async fn define_domain(&self, xml: &str) -> Result<()> {
        Domain::define_xml(&self.connection, xml).map_err(Self::rpc)?;
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn undefine_domain(&self, name: &str, flags: UndefineFlags) -> Result<()> {
        let mut raw = 0;
        if flags.managed_save {
            raw |= sys::VIR_DOMAIN_UNDEFINE_MANAGED_SAVE;
        }
        if flags.snapshots_metadata {
            raw |= sys::VIR_DOMAIN_UNDEFINE_SNAPSHOTS_METADATA;
        }
        if flags.nvram {
            raw |= sys::VIR_DOMAIN_UNDEFINE_NVRAM;
        }
        self.domain(name)?.undefine_flags(raw).map_err(Self::rpc)
    }

    async fn domain_xml(&self, name: &str, inactive: bool) -> Result<String> {
        let flags = if inactive { sys::VIR_DOMAIN_XML_INACTIVE } else { 0 };
        self.domain(name)?.get_xml_desc(flags).map_err(Self::rpc)
    }

    async fn domain_state(&self, name: &str) -> Result<DomainState> {
        let (state, _) = self.domain(name)?.get_state().map_err(Self::rpc)?;
        Ok(Self::state_from_libvirt(state))
    }

    async fn list_domains(&self) -> Result<Vec<DomainSummary>> {
        let flags = sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
        let domains = self.connection.list_all_domains(flags).map_err(Self::rpc)?;

        let mut summaries = Vec::with_capacity(domains.len());
        for domain in domains {
            let (state, _) = domain.get_state().map_err(Self::rpc)?;
            summaries.push(DomainSummary {
                name: domain.get_name().map_err(Self::rpc)?,
                uuid: domain.get_uuid_string().ok(),
                state: Self::state_from_libvirt(state),
                persistent: domain.is_persistent().unwrap_or(true),
            });
        }
        debug!(count = summaries.len(), "Listed domains");
        Ok(summaries)
    }

    async fn start_domain(&self, name: &str) -> Result<()> {
        self.domain(name)?.create().map_err(Self::rpc)?;
        Ok(())
    }

    async fn shutdown_domain(&self, name: &str) -> Result<()> {
        self.domain(name)?.shutdown().map_err(Self::rpc)?;
        Ok(())
    }

    async fn destroy_domain(&self, name: &str) -> Result<()> {
        self.domain(name)?.destroy().map_err(Self::rpc)
    }

    async fn reboot_domain(&self, name: &str) -> Result<()> {
        self.domain(name)?
            .reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT)
            .map_err(Self::rpc)
    }

    async fn suspend_domain(&self, name: &str) -> Result<()> {
        self.domain(name)?.suspend().map_err(Self::rpc)?;
        Ok(())
    }

    async fn resume_domain(&self, name: &str) -> Result<()> {
        self.domain(name)?.resume().map_err(Self::rpc)?;
        Ok(())
    }

    async fn set_memory(&self, name: &str, kib: u64, flags: ModifyFlags) -> Result<()> {
        self.domain(name)?
            .set_memory_flags(kib, Self::modify_flags(flags))
            .map_err(|e| HypervisorError::Unsupported(e.to_string()))?;
        Ok(())
    }

    async fn set_vcpus(&self, name: &str, count: u32, flags: ModifyFlags) -> Result<()> {
        self.domain(name)?
            .set_vcpus_flags(count, Self::modify_flags(flags))
            .map_err(|e| HypervisorError::Unsupported(e.to_string()))?;
        Ok(())
    }

    async fn set_autostart(&self, name: &str, autostart: bool) -> Result<()> {
        self.domain(name)?.set_autostart(autostart).map_err(Self::rpc)?;
        Ok(())
    }

    async fn attach_device(&self, name: &str, xml: &str, flags: ModifyFlags) -> Result<()> {
        self.domain(name)?
            .attach_device_flags(xml, Self::modify_flags(flags))
            .map_err(Self::rpc)?;
        Ok(())
    }

    async fn detach_device(&self, name: &str, xml: &str, flags: ModifyFlags) -> Result<()> {
        self.domain(name)?
            .detach_device_flags(xml, Self::modify_flags(flags))
            .map_err(Self::rpc)?;
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<String>> {
        let flags = sys::VIR_CONNECT_LIST_STORAGE_POOLS_ACTIVE | sys::VIR_CONNECT_LIST_STORAGE_POOLS_INACTIVE;
        let pools = self.connection.list_all_storage_pools(flags).map_err(Self::rpc)?;
        pools
            .iter()
            .map(|p| p.get_name().map_err(Self::rpc))
            .collect()
    }

    async fn pool_xml(&self, name: &str) -> Result<String> {
        self.pool(name)?.get_xml_desc(0).map_err(Self::rpc)
    }

    async fn pool_runtime(&self, name: &str) -> Result<PoolRuntime> {
        let info = self.pool(name)?.get_info().map_err(Self::rpc)?;
        Ok(PoolRuntime {
            state: Self::pool_state_from_libvirt(info.state),
            capacity: info.capacity,
            allocation: info.allocation,
            available: info.available,
        })
    }

    async fn pool_autostart(&self, name: &str) -> Result<bool> {
        self.pool(name)?.get_autostart().map_err(Self::rpc)
    }

    #[instrument(skip(self, xml))]
    async fn define_pool(&self, xml: &str) -> Result<()> {
        StoragePool::define_xml(&self.connection, xml, 0).map_err(Self::rpc)?;
        Ok(())
    }

    async fn build_pool(&self, name: &str) -> Result<()> {
        self.pool(name)?
            .build(sys::VIR_STORAGE_POOL_BUILD_NEW)
            .map_err(Self::rpc)?;
        Ok(())
    }

    async fn start_pool(&self, name: &str) -> Result<()> {
        self.pool(name)?.create(0).map_err(Self::rpc)?;
        Ok(())
    }

    async fn set_pool_autostart(&self, name: &str, autostart: bool) -> Result<()> {
        self.pool(name)?.set_autostart(autostart).map_err(Self::rpc)?;
        Ok(())
    }

    async fn refresh_pool(&self, name: &str) -> Result<()> {
        self.pool(name)?.refresh(0).map_err(Self::rpc)?;
        Ok(())
    }

    async fn destroy_pool(&self, name: &str) -> Result<()> {
        self.pool(name)?.destroy().map_err(Self::rpc)
    }

    async fn delete_pool(&self, name: &str) -> Result<()> {
        self.pool(name)?.delete(0).map_err(Self::rpc)
    }

    async fn undefine_pool(&self, name: &str) -> Result<()> {
        self.pool(name)?.undefine().map_err(Self::rpc)
    }

    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>> {
        self.pool(pool)?.list_volumes().map_err(Self::rpc)
    }

    async fn volume_xml(&self, pool: &str, name: &str) -> Result<String> {
        self.volume(pool, name)?.get_xml_desc(0).map_err(Self::rpc)
    }

    #[instrument(skip(self, xml), fields(pool = %pool))]
    async fn create_volume(&self, pool: &str, xml: &str) -> Result<()> {
        let pool_handle = self.pool(pool)?;
        StorageVol::create_xml(&pool_handle, xml, 0).map_err(Self::rpc)?;
        Ok(())
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        self.volume(pool, name)?.delete(0).map_err(Self::rpc)
    }

    async fn resize_volume(&self, pool: &str, name: &str, capacity_bytes: u64) -> Result<()> {
        self.volume(pool, name)?
            .resize(capacity_bytes, 0)
            .map_err(Self::rpc)?;
        Ok(())
    }

    // The bindings do not expose snapshots; use virsh as the daemon's own CLI.

    #[instrument(skip(self, xml), fields(domain = %domain))]
    async fn create_snapshot(&self, domain: &str, xml: &str, flags: SnapshotCreateFlags) -> Result<String> {
        let requested = requested_snapshot_name(xml)?;
        let mut args = vec!["snapshot-create", domain, "--xmldesc", "/dev/stdin"];
        if flags.disk_only {
            args.push("--disk-only");
        }
        if flags.atomic {
            args.push("--atomic");
        }
        if flags.quiesce {
            args.push("--quiesce");
        }
        if flags.halt {
            args.push("--halt");
        }
        if flags.no_metadata {
            args.push("--no-metadata");
        }

        self.virsh(&args, Some(xml.as_bytes())).await?;
        if let Some(name) = requested {
            return Ok(name);
        }
        // Unnamed: libvirt picked the name, and the new snapshot is current.
        self.current_snapshot(domain).await?.ok_or_else(|| {
            HypervisorError::Rpc(format!("unnamed snapshot of '{}' was created without metadata", domain))
        })
    }

    async fn list_snapshot_xmls(&self, domain: &str) -> Result<Vec<String>> {
        let names = self.virsh(&["snapshot-list", domain, "--name"], None).await?;
        let mut documents = Vec::new();
        for name in names.lines().map(str::trim).filter(|n| !n.is_empty()) {
            documents.push(self.snapshot_xml(domain, name).await?);
        }
        Ok(documents)
    }

    async fn snapshot_xml(&self, domain: &str, name: &str) -> Result<String> {
        self.virsh(&["snapshot-dumpxml", domain, name], None).await
    }

    async fn current_snapshot(&self, domain: &str) -> Result<Option<String>> {
        match self.virsh(&["snapshot-current", domain, "--name"], None).await {
            Ok(name) => Ok(Some(name.trim().to_string()).filter(|n| !n.is_empty())),
            Err(HypervisorError::NotFound(_)) => Ok(None),
            Err(HypervisorError::ExternalToolFailure { output, .. }) if output.contains("no current snapshot") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(domain = %domain, snapshot = %name))]
    async fn revert_snapshot(&self, domain: &str, name: &str, flags: SnapshotRevertFlags) -> Result<()> {
        let mut args = vec!["snapshot-revert", domain, name];
        if flags.running {
            args.push("--running");
        }
        if flags.paused {
            args.push("--paused");
        }
        if flags.force {
            args.push("--force");
        }
        self.virsh(&args, None).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %domain, snapshot = %name))]
    async fn delete_snapshot(&self, domain: &str, name: &str, flags: SnapshotDeleteFlags) -> Result<()> {
        let mut args = vec!["snapshot-delete", domain, name];
        if flags.children {
            args.push("--children");
        }
        if flags.children_only {
            args.push("--children-only");
        }
        if flags.metadata_only {
            args.push("--metadata");
        }
        self.virsh(&args, None).await?;
        Ok(())
    }

    async fn capabilities_xml(&self) -> Result<String> {
        self.connection.get_capabilities().map_err(Self::rpc)
    }

    async fn sysinfo_xml(&self) -> Result<String> {
        self.virsh(&["sysinfo"], None).await
    }

    async fn node_device_xmls(&self, capability: Option<&str>) -> Result<Vec<String>> {
        let mut args = vec!["nodedev-list"];
        if let Some(cap) = capability {
            args.push("--cap");
            args.push(cap);
        }
        let names = self.virsh(&args, None).await?;

        let mut documents = Vec::new();
        for name in names.lines().map(str::trim).filter(|n| !n.is_empty()) {
            documents.push(self.virsh(&["nodedev-dumpxml", name], None).await?);
        }
        Ok(documents)
    }
}

/// Name carried by a snapshot creation document, if the caller chose one.
fn requested_snapshot_name(xml: &str) -> Result<Option<String>> {
    let requested: SnapshotDescriptor = from_xml(xml)?;
    let name = requested.name.trim();
    Ok((!name.is_empty()).then(|| name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_name_keeps_spaces() {
        let xml = "<domainsnapshot><name>before kernel upgrade</name></domainsnapshot>";
        assert_eq!(
            requested_snapshot_name(xml).unwrap().as_deref(),
            Some("before kernel upgrade")
        );
    }

    #[test]
    fn test_unnamed_request_defers_to_libvirt() {
        let xml = "<domainsnapshot><description>nightly</description></domainsnapshot>";
        assert_eq!(requested_snapshot_name(xml).unwrap(), None);
    }

    #[test]
    fn test_malformed_request_is_rejected() {
        assert!(requested_snapshot_name("<domainsnapshot>").is_err());
    }
}
