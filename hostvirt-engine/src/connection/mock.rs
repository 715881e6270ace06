//! In-memory connection for testing and development.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument};

use super::Connection;
use crate::descriptor::{
    from_xml, patch, to_xml, CharSource, DomainDescriptor, Disk, PoolDescriptor, Permissions, SnapshotDescriptor,
    SnapshotParent, VolumeDescriptor,
};
use crate::error::{HypervisorError, Result};
use crate::types::*;

/// Calls that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    DefineDomain,
    UndefineDomain,
    StartDomain,
    /// Domain state queries
    DomainState,
    /// Live memory/vCPU changes
    LiveUpdate,
    AttachDevice,
    DetachDevice,
    DefinePool,
    SetPoolAutostart,
    DestroyPool,
    DeletePool,
    UndefinePool,
    CreateVolume,
    /// Volume document reads
    VolumeQuery,
    DeleteVolume,
    CreateSnapshot,
}

struct MockDomain {
    /// The persistent document exactly as last defined.
    document: String,
    definition: DomainDescriptor,
    state: DomainState,
    autostart: bool,
    /// Raw snapshot documents, in creation order.
    snapshots: Vec<String>,
    current_snapshot: Option<String>,
}

impl MockDomain {
    /// Replace the persistent document after a config-flag change.
    fn replace_document(&mut self, document: String) -> Result<()> {
        self.definition = from_xml(&document)?;
        self.document = document;
        Ok(())
    }
}

struct MockPool {
    definition: PoolDescriptor,
    state: PoolState,
    autostart: bool,
    volumes: BTreeMap<String, VolumeDescriptor>,
}

struct MockState {
    domains: BTreeMap<String, MockDomain>,
    pools: BTreeMap<String, MockPool>,
    failures: HashSet<FailurePoint>,
    calls: Vec<String>,
    next_pty: u32,
    clock: i64,
    capabilities_xml: String,
    sysinfo_xml: String,
    node_devices: Vec<(String, String)>,
}

/// Capacity reported for every mock pool.
const MOCK_POOL_CAPACITY: u64 = 500 * GIB;

/// In-memory hypervisor.
///
/// Holds domain, pool, volume and snapshot definitions, records every call
/// in order, and fails chosen calls on request.
pub struct MockConnection {
    state: RwLock<MockState>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MockState {
                domains: BTreeMap::new(),
                pools: BTreeMap::new(),
                failures: HashSet::new(),
                calls: Vec::new(),
                next_pty: 0,
                clock: 1_700_000_000,
                capabilities_xml: DEFAULT_CAPABILITIES.to_string(),
                sysinfo_xml: DEFAULT_SYSINFO.to_string(),
                node_devices: default_node_devices(),
            }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MockState>> {
        self.state
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MockState>> {
        self.state
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    /// Make every later call at `point` fail.
    pub fn fail_on(&self, point: FailurePoint) {
        if let Ok(mut state) = self.state.write() {
            state.failures.insert(point);
        }
    }

    pub fn clear_failure(&self, point: FailurePoint) {
        if let Ok(mut state) = self.state.write() {
            state.failures.remove(&point);
        }
    }

    /// Every call so far, as `operation target [detail]`.
    pub fn calls(&self) -> Vec<String> {
        self.state.read().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls().into_iter().filter(|c| c.starts_with(prefix)).collect()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut state) = self.state.write() {
            state.calls.clear();
        }
    }

    /// Put a domain into a state without going through the lifecycle.
    pub fn set_domain_state(&self, name: &str, new_state: DomainState) -> Result<()> {
        let mut state = self.write()?;
        state.domain_mut(name)?.state = new_state;
        Ok(())
    }

    /// Store a snapshot document verbatim, bypassing validation.
    pub fn insert_raw_snapshot(&self, domain: &str, xml: &str) -> Result<()> {
        let mut state = self.write()?;
        state.domain_mut(domain)?.snapshots.push(xml.to_string());
        Ok(())
    }

    /// Find a volume by its file path.
    pub fn volume_by_path(&self, path: &str) -> Option<(String, VolumeDescriptor)> {
        let state = self.state.read().ok()?;
        state.pools.iter().find_map(|(pool_name, pool)| {
            pool.volumes
                .values()
                .find(|v| v.path() == Some(path))
                .map(|v| (pool_name.clone(), v.clone()))
        })
    }

    /// Edit the volume stored at `path`, as an image tool would.
    pub fn update_volume_by_path<F>(&self, path: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut VolumeDescriptor),
    {
        let mut state = self.write()?;
        let volume = state
            .pools
            .values_mut()
            .flat_map(|p| p.volumes.values_mut())
            .find(|v| v.path() == Some(path))
            .ok_or_else(|| HypervisorError::NotFound(format!("volume at {}", path)))?;
        f(volume);
        Ok(())
    }

    pub fn set_capabilities_xml(&self, xml: &str) {
        if let Ok(mut state) = self.state.write() {
            state.capabilities_xml = xml.to_string();
        }
    }

    pub fn set_sysinfo_xml(&self, xml: &str) {
        if let Ok(mut state) = self.state.write() {
            state.sysinfo_xml = xml.to_string();
        }
    }

    /// Register a node device document under a capability type.
    pub fn add_node_device(&self, capability: &str, xml: &str) {
        if let Ok(mut state) = self.state.write() {
            state.node_devices.push((capability.to_string(), xml.to_string()));
        }
    }
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MockState {
    fn record(&mut self, call: String) {
        debug!(call = %call, "Mock connection call");
        self.calls.push(call);
    }

    fn check(&self, point: FailurePoint, target: &str) -> Result<()> {
        if self.failures.contains(&point) {
            return Err(HypervisorError::Rpc(format!("injected {:?} failure for '{}'", point, target)));
        }
        Ok(())
    }

    fn domain(&self, name: &str) -> Result<&MockDomain> {
        self.domains
            .get(name)
            .ok_or_else(|| HypervisorError::NotFound(format!("domain '{}'", name)))
    }

    fn domain_mut(&mut self, name: &str) -> Result<&mut MockDomain> {
        self.domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::NotFound(format!("domain '{}'", name)))
    }

    fn active_domain_mut(&mut self, name: &str) -> Result<&mut MockDomain> {
        let domain = self.domain_mut(name)?;
        if !domain.state.is_active() {
            return Err(HypervisorError::InvalidState(format!("domain '{}' is not running", name)));
        }
        Ok(domain)
    }

    fn pool(&self, name: &str) -> Result<&MockPool> {
        self.pools
            .get(name)
            .ok_or_else(|| HypervisorError::NotFound(format!("storage pool '{}'", name)))
    }

    fn pool_mut(&mut self, name: &str) -> Result<&mut MockPool> {
        self.pools
            .get_mut(name)
            .ok_or_else(|| HypervisorError::NotFound(format!("storage pool '{}'", name)))
    }

    fn active_pool_mut(&mut self, name: &str) -> Result<&mut MockPool> {
        let pool = self.pool_mut(name)?;
        if pool.state != PoolState::Active {
            return Err(HypervisorError::InvalidState(format!("storage pool '{}' is not active", name)));
        }
        Ok(pool)
    }

    fn snapshot_index(&self, domain: &str, name: &str) -> Result<usize> {
        self.domain(domain)?
            .snapshots
            .iter()
            .position(|xml| snapshot_name(xml).as_deref() == Some(name))
            .ok_or_else(|| HypervisorError::NotFound(format!("snapshot '{}' of domain '{}'", name, domain)))
    }
}

fn snapshot_name(xml: &str) -> Option<String> {
    from_xml::<SnapshotDescriptor>(xml).ok().map(|s| s.name)
}

fn decode_disk(xml: &str) -> Result<Disk> {
    from_xml(xml)
}

#[async_trait]
impl Connection for MockConnection {
    fn uri(&self) -> String {
        "test:///default".to_string()
    }

    async fn is_alive(&self) -> Result<bool> {
        Ok(true)
    }

    /// Same identity rules as libvirt: a redefine must carry the existing
    /// uuid, and a uuid cannot move to another name.
    #[instrument(skip(self, xml))]
    async fn define_domain(&self, xml: &str) -> Result<()> {
        let mut definition: DomainDescriptor = from_xml(xml)?;
        let mut state = self.write()?;
        state.record(format!("define_domain {}", definition.name));
        state.check(FailurePoint::DefineDomain, &definition.name)?;

        if let Some(uuid) = definition.uuid.as_deref() {
            if let Some(other) = state
                .domains
                .values()
                .find(|d| d.definition.name != definition.name && d.definition.uuid.as_deref() == Some(uuid))
            {
                return Err(HypervisorError::AlreadyExists(format!(
                    "domain '{}' is already defined with uuid {}",
                    other.definition.name, uuid
                )));
            }
        }

        match state.domains.get_mut(&definition.name) {
            Some(existing) => {
                if definition.uuid != existing.definition.uuid {
                    return Err(HypervisorError::AlreadyExists(format!(
                        "domain '{}' already exists with uuid {}",
                        definition.name,
                        existing.definition.uuid.as_deref().unwrap_or_default()
                    )));
                }
                existing.document = xml.to_string();
                existing.definition = definition;
            }
            None => {
                let document = match definition.uuid {
                    Some(_) => xml.to_string(),
                    None => {
                        let uuid = uuid::Uuid::new_v4().to_string();
                        let document = patch::insert_uuid(xml, &uuid)?;
                        definition.uuid = Some(uuid);
                        document
                    }
                };
                info!(domain = %definition.name, "Mock domain defined");
                state.domains.insert(
                    definition.name.clone(),
                    MockDomain {
                        document,
                        definition,
                        state: DomainState::ShutOff,
                        autostart: false,
                        snapshots: Vec::new(),
                        current_snapshot: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn undefine_domain(&self, name: &str, flags: UndefineFlags) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("undefine_domain {}", name));
        state.check(FailurePoint::UndefineDomain, name)?;

        let domain = state.domain(name)?;
        if !domain.snapshots.is_empty() && !flags.snapshots_metadata {
            return Err(HypervisorError::InvalidState(format!(
                "domain '{}' has snapshots; snapshot metadata must be removed too",
                name
            )));
        }
        if domain.state.is_active() {
            // A running domain becomes transient; the mock drops it outright.
            debug!(domain = %name, "Undefining active mock domain");
        }
        state.domains.remove(name);
        Ok(())
    }

    async fn domain_xml(&self, name: &str, inactive: bool) -> Result<String> {
        let state = self.read()?;
        let domain = state.domain(name)?;
        if inactive || !domain.state.is_active() {
            return Ok(domain.document.clone());
        }

        // Live documents carry the PTY the hypervisor allocated.
        let mut document = domain.definition.clone();
        let pty = format!("/dev/pts/{}", state.next_pty);
        for serial in document.devices.serials.iter_mut().filter(|s| s.char_type == "pty") {
            serial.source = Some(CharSource { mode: None, path: Some(pty.clone()) });
        }
        for console in document.devices.consoles.iter_mut().filter(|c| c.char_type == "pty") {
            console.tty = Some(pty.clone());
        }
        to_xml(&document)
    }

    async fn domain_state(&self, name: &str) -> Result<DomainState> {
        let state = self.read()?;
        state.check(FailurePoint::DomainState, name)?;
        Ok(state.domain(name)?.state)
    }

    async fn list_domains(&self) -> Result<Vec<DomainSummary>> {
        let state = self.read()?;
        Ok(state
            .domains
            .values()
            .map(|d| DomainSummary {
                name: d.definition.name.clone(),
                uuid: d.definition.uuid.clone(),
                state: d.state,
                persistent: true,
            })
            .collect())
    }

    async fn start_domain(&self, name: &str) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("start_domain {}", name));
        state.check(FailurePoint::StartDomain, name)?;
        state.next_pty += 1;

        let domain = state.domain_mut(name)?;
        if domain.state.is_active() {
            return Err(HypervisorError::InvalidState(format!("domain '{}' is already running", name)));
        }
        domain.state = DomainState::Running;
        Ok(())
    }

    async fn shutdown_domain(&self, name: &str) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("shutdown_domain {}", name));
        let domain = state.active_domain_mut(name)?;
        // The guest cooperates instantly.
        domain.state = DomainState::ShutOff;
        Ok(())
    }

    async fn destroy_domain(&self, name: &str) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("destroy_domain {}", name));
        state.active_domain_mut(name)?.state = DomainState::ShutOff;
        Ok(())
    }

    async fn reboot_domain(&self, name: &str) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("reboot_domain {}", name));
        state.active_domain_mut(name)?;
        Ok(())
    }

    async fn suspend_domain(&self, name: &str) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("suspend_domain {}", name));
        let domain = state.active_domain_mut(name)?;
        domain.state = DomainState::Paused;
        Ok(())
    }

    async fn resume_domain(&self, name: &str) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("resume_domain {}", name));
        let domain = state.domain_mut(name)?;
        if domain.state != DomainState::Paused {
            return Err(HypervisorError::InvalidState(format!("domain '{}' is not paused", name)));
        }
        domain.state = DomainState::Running;
        Ok(())
    }

    async fn set_memory(&self, name: &str, kib: u64, flags: ModifyFlags) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("set_memory {} {} live={} config={}", name, kib, flags.live, flags.config));
        if flags.live {
            state.check(FailurePoint::LiveUpdate, name)?;
            state.active_domain_mut(name)?;
        }
        if flags.config {
            let domain = state.domain_mut(name)?;
            let patched = patch::set_memory_kib(&domain.document, kib)?;
            domain.replace_document(patched)?;
        }
        Ok(())
    }

    async fn set_vcpus(&self, name: &str, count: u32, flags: ModifyFlags) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("set_vcpus {} {} live={} config={}", name, count, flags.live, flags.config));
        if flags.live {
            state.check(FailurePoint::LiveUpdate, name)?;
            state.active_domain_mut(name)?;
        }
        if flags.config {
            let domain = state.domain_mut(name)?;
            let patched = patch::set_vcpus(&domain.document, count)?;
            domain.replace_document(patched)?;
        }
        Ok(())
    }

    async fn set_autostart(&self, name: &str, autostart: bool) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("set_autostart {} {}", name, autostart));
        state.domain_mut(name)?.autostart = autostart;
        Ok(())
    }

    async fn attach_device(&self, name: &str, xml: &str, flags: ModifyFlags) -> Result<()> {
        let disk = decode_disk(xml)?;
        let mut state = self.write()?;
        state.record(format!(
            "attach_device {} {} live={} config={}",
            name, disk.target.dev, flags.live, flags.config
        ));
        state.check(FailurePoint::AttachDevice, name)?;
        if flags.live {
            state.active_domain_mut(name)?;
        }
        if flags.config {
            let domain = state.domain_mut(name)?;
            domain.definition.ensure_target_free(&disk.target.dev)?;
            let patched = patch::append_device(&domain.document, xml)?;
            domain.replace_document(patched)?;
        }
        Ok(())
    }

    async fn detach_device(&self, name: &str, xml: &str, flags: ModifyFlags) -> Result<()> {
        let disk = decode_disk(xml)?;
        let mut state = self.write()?;
        state.record(format!(
            "detach_device {} {} live={} config={}",
            name, disk.target.dev, flags.live, flags.config
        ));
        state.check(FailurePoint::DetachDevice, name)?;
        if flags.live {
            state.active_domain_mut(name)?;
        }
        if flags.config {
            let domain = state.domain_mut(name)?;
            let patched = patch::remove_disk(&domain.document, &disk.target.dev)?;
            domain.replace_document(patched)?;
        }
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<String>> {
        Ok(self.read()?.pools.keys().cloned().collect())
    }

    async fn pool_xml(&self, name: &str) -> Result<String> {
        to_xml(&self.read()?.pool(name)?.definition)
    }

    async fn pool_runtime(&self, name: &str) -> Result<PoolRuntime> {
        let state = self.read()?;
        let pool = state.pool(name)?;
        let allocation: u64 = pool
            .volumes
            .values()
            .filter_map(|v| v.allocation.as_ref())
            .map(|a| a.to_bytes())
            .sum::<Result<u64>>()?;
        Ok(PoolRuntime {
            state: pool.state,
            capacity: MOCK_POOL_CAPACITY,
            allocation,
            available: MOCK_POOL_CAPACITY.saturating_sub(allocation),
        })
    }

    async fn pool_autostart(&self, name: &str) -> Result<bool> {
        Ok(self.read()?.pool(name)?.autostart)
    }

    async fn define_pool(&self, xml: &str) -> Result<()> {
        let definition: PoolDescriptor = from_xml(xml)?;
        let mut state = self.write()?;
        state.record(format!("define_pool {}", definition.name));
        state.check(FailurePoint::DefinePool, &definition.name)?;
        if state.pools.contains_key(&definition.name) {
            return Err(HypervisorError::AlreadyExists(format!("storage pool '{}'", definition.name)));
        }
        state.pools.insert(
            definition.name.clone(),
            MockPool {
                definition,
                state: PoolState::Inactive,
                autostart: false,
                volumes: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn build_pool(&self, name: &str) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("build_pool {}", name));
        state.pool(name)?;
        Ok(())
    }

    async fn start_pool(&self, name: &str) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("start_pool {}", name));
        let pool = state.pool_mut(name)?;
        if pool.state == PoolState::Active {
            return Err(HypervisorError::InvalidState(format!("storage pool '{}' is already active", name)));
        }
        pool.state = PoolState::Active;
        Ok(())
    }

    async fn set_pool_autostart(&self, name: &str, autostart: bool) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("set_pool_autostart {} {}", name, autostart));
        state.check(FailurePoint::SetPoolAutostart, name)?;
        state.pool_mut(name)?.autostart = autostart;
        Ok(())
    }

    async fn refresh_pool(&self, name: &str) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("refresh_pool {}", name));
        state.active_pool_mut(name)?;
        Ok(())
    }

    async fn destroy_pool(&self, name: &str) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("destroy_pool {}", name));
        state.check(FailurePoint::DestroyPool, name)?;
        state.active_pool_mut(name)?.state = PoolState::Inactive;
        Ok(())
    }

    async fn delete_pool(&self, name: &str) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("delete_pool {}", name));
        state.check(FailurePoint::DeletePool, name)?;
        let pool = state.pool_mut(name)?;
        if pool.state == PoolState::Active {
            return Err(HypervisorError::InvalidState(format!("storage pool '{}' is still active", name)));
        }
        if !pool.volumes.is_empty() {
            return Err(HypervisorError::Rpc(format!(
                "cannot delete directory of pool '{}': Directory not empty",
                name
            )));
        }
        Ok(())
    }

    async fn undefine_pool(&self, name: &str) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("undefine_pool {}", name));
        state.check(FailurePoint::UndefinePool, name)?;
        state
            .pools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HypervisorError::NotFound(format!("storage pool '{}'", name)))
    }

    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>> {
        let state = self.read()?;
        let pool = state.pool(pool)?;
        if pool.state != PoolState::Active {
            return Err(HypervisorError::InvalidState(format!(
                "storage pool '{}' is not active",
                pool.definition.name
            )));
        }
        Ok(pool.volumes.keys().cloned().collect())
    }

    async fn volume_xml(&self, pool: &str, name: &str) -> Result<String> {
        let state = self.read()?;
        state.check(FailurePoint::VolumeQuery, name)?;
        let volume = state
            .pool(pool)?
            .volumes
            .get(name)
            .ok_or_else(|| HypervisorError::NotFound(format!("volume '{}' in pool '{}'", name, pool)))?;
        to_xml(volume)
    }

    async fn create_volume(&self, pool: &str, xml: &str) -> Result<()> {
        let mut volume: VolumeDescriptor = from_xml(xml)?;
        let mut state = self.write()?;
        state.record(format!("create_volume {} {}", pool, volume.name));
        state.check(FailurePoint::CreateVolume, &volume.name)?;

        let pool_entry = state.active_pool_mut(pool)?;
        if pool_entry.volumes.contains_key(&volume.name) {
            return Err(HypervisorError::AlreadyExists(format!("volume '{}' in pool '{}'", volume.name, pool)));
        }

        let path = format!("{}/{}", pool_entry.definition.target.path.trim_end_matches('/'), volume.name);
        let target = volume.target.get_or_insert_with(Default::default);
        target.path = Some(path.clone());
        // Volumes created by a root daemon start out root-owned.
        target.permissions = Some(Permissions {
            mode: Some("0600".to_string()),
            owner: Some("0".to_string()),
            group: Some("0".to_string()),
        });
        volume.key = Some(path);
        pool_entry.volumes.insert(volume.name.clone(), volume);
        Ok(())
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("delete_volume {} {}", pool, name));
        state.check(FailurePoint::DeleteVolume, name)?;
        state
            .pool_mut(pool)?
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HypervisorError::NotFound(format!("volume '{}' in pool '{}'", name, pool)))
    }

    async fn resize_volume(&self, pool: &str, name: &str, capacity_bytes: u64) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("resize_volume {} {} {}", pool, name, capacity_bytes));
        let volume = state
            .pool_mut(pool)?
            .volumes
            .get_mut(name)
            .ok_or_else(|| HypervisorError::NotFound(format!("volume '{}' in pool '{}'", name, pool)))?;
        if capacity_bytes < volume.capacity.to_bytes()? {
            return Err(HypervisorError::Rpc(format!("cannot shrink volume '{}'", name)));
        }
        volume.capacity = crate::descriptor::ScaledValue::bytes(capacity_bytes);
        Ok(())
    }

    async fn create_snapshot(&self, domain: &str, xml: &str, _flags: SnapshotCreateFlags) -> Result<String> {
        let mut snapshot: SnapshotDescriptor = from_xml(xml)?;
        let mut state = self.write()?;
        state.record(format!("create_snapshot {} {}", domain, snapshot.name));
        state.check(FailurePoint::CreateSnapshot, domain)?;

        state.clock += 1;
        let clock = state.clock;
        if snapshot.name.is_empty() {
            snapshot.name = clock.to_string();
        }
        if state.snapshot_index(domain, &snapshot.name).is_ok() {
            return Err(HypervisorError::AlreadyExists(format!(
                "snapshot '{}' of domain '{}'",
                snapshot.name, domain
            )));
        }

        let entry = state.domain_mut(domain)?;
        snapshot.parent = entry.current_snapshot.clone().map(|name| SnapshotParent { name });
        let captured = if entry.state.is_active() { "running" } else { "shutoff" };
        snapshot.state = Some(captured.to_string());
        snapshot.creation_time = Some(clock);

        let name = snapshot.name.clone();
        entry.snapshots.push(to_xml(&snapshot)?);
        entry.current_snapshot = Some(name.clone());
        Ok(name)
    }

    async fn list_snapshot_xmls(&self, domain: &str) -> Result<Vec<String>> {
        Ok(self.read()?.domain(domain)?.snapshots.clone())
    }

    async fn snapshot_xml(&self, domain: &str, name: &str) -> Result<String> {
        let state = self.read()?;
        let index = state.snapshot_index(domain, name)?;
        Ok(state.domain(domain)?.snapshots[index].clone())
    }

    async fn current_snapshot(&self, domain: &str) -> Result<Option<String>> {
        Ok(self.read()?.domain(domain)?.current_snapshot.clone())
    }

    async fn revert_snapshot(&self, domain: &str, name: &str, flags: SnapshotRevertFlags) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("revert_snapshot {} {}", domain, name));
        let index = state.snapshot_index(domain, name)?;
        let entry = state.domain_mut(domain)?;
        let snapshot: SnapshotDescriptor = from_xml(&entry.snapshots[index])?;

        entry.state = if flags.paused {
            DomainState::Paused
        } else if flags.running || snapshot.state.as_deref() == Some("running") {
            DomainState::Running
        } else {
            DomainState::ShutOff
        };
        entry.current_snapshot = Some(name.to_string());
        Ok(())
    }

    async fn delete_snapshot(&self, domain: &str, name: &str, flags: SnapshotDeleteFlags) -> Result<()> {
        let mut state = self.write()?;
        state.record(format!("delete_snapshot {} {}", domain, name));
        let index = state.snapshot_index(domain, name)?;
        let entry = state.domain_mut(domain)?;

        let parsed: Vec<Option<SnapshotDescriptor>> =
            entry.snapshots.iter().map(|xml| from_xml(xml).ok()).collect();
        let parent = parsed[index].as_ref().and_then(|s| s.parent.clone());

        // Collect descendants of the deleted snapshot.
        let mut doomed: HashSet<String> = HashSet::new();
        if flags.children || flags.children_only {
            let mut frontier = vec![name.to_string()];
            while let Some(current) = frontier.pop() {
                for child in parsed.iter().flatten() {
                    if child.parent_name() == Some(current.as_str()) && doomed.insert(child.name.clone()) {
                        frontier.push(child.name.clone());
                    }
                }
            }
        }
        if !flags.children_only {
            doomed.insert(name.to_string());
        }

        let mut kept = Vec::new();
        for (xml, snapshot) in entry.snapshots.iter().zip(parsed.iter()) {
            match snapshot {
                Some(s) if doomed.contains(&s.name) => continue,
                Some(s) if s.parent_name() == Some(name) && !flags.children_only => {
                    // Children of a removed snapshot move up to its parent.
                    let mut s = s.clone();
                    s.parent = parent.clone();
                    kept.push(to_xml(&s)?);
                }
                _ => kept.push(xml.clone()),
            }
        }
        entry.snapshots = kept;

        if let Some(current) = entry.current_snapshot.clone() {
            if doomed.contains(&current) {
                entry.current_snapshot = parent.map(|p| p.name);
            }
        }
        Ok(())
    }

    async fn capabilities_xml(&self) -> Result<String> {
        Ok(self.read()?.capabilities_xml.clone())
    }

    async fn sysinfo_xml(&self) -> Result<String> {
        Ok(self.read()?.sysinfo_xml.clone())
    }

    async fn node_device_xmls(&self, capability: Option<&str>) -> Result<Vec<String>> {
        let state = self.read()?;
        Ok(state
            .node_devices
            .iter()
            .filter(|(cap, _)| capability.map_or(true, |c| c == cap))
            .map(|(_, xml)| xml.clone())
            .collect())
    }
}

const DEFAULT_CAPABILITIES: &str = r#"<capabilities>
  <host>
    <uuid>6c1b2a3e-11e2-4f4c-9c1d-0242ac120002</uuid>
    <cpu>
      <arch>x86_64</arch>
      <model>Skylake-Client-IBRS</model>
      <vendor>Intel</vendor>
      <topology sockets='1' dies='1' cores='4' threads='2'/>
      <feature name='vmx'/>
      <feature name='aes'/>
    </cpu>
    <iommu support='yes'/>
    <topology>
      <cells num='1'>
        <cell id='0'>
          <memory unit='KiB'>32780412</memory>
          <cpus num='8'/>
        </cell>
      </cells>
    </topology>
  </host>
  <guest>
    <os_type>hvm</os_type>
    <arch name='x86_64'>
      <wordsize>64</wordsize>
      <emulator>/usr/bin/qemu-system-x86_64</emulator>
      <machine maxCpus='255'>pc-i440fx-8.2</machine>
      <machine canonical='pc-i440fx-8.2' maxCpus='255'>pc</machine>
      <machine maxCpus='4096'>pc-q35-8.2</machine>
      <machine canonical='pc-q35-8.2' maxCpus='4096'>q35</machine>
      <domain type='qemu'/>
      <domain type='kvm'/>
    </arch>
  </guest>
</capabilities>"#;

const DEFAULT_SYSINFO: &str = r#"<sysinfo type='smbios'>
  <bios>
    <entry name='vendor'>SeaBIOS</entry>
    <entry name='version'>1.16.3</entry>
    <entry name='date'>04/01/2014</entry>
  </bios>
  <system>
    <entry name='manufacturer'>QEMU</entry>
    <entry name='product'>Standard PC (i440FX + PIIX, 1996)</entry>
    <entry name='serial'>HV-0001</entry>
    <entry name='uuid'>6c1b2a3e-11e2-4f4c-9c1d-0242ac120002</entry>
  </system>
  <processor>
    <entry name='version'>Intel(R) Core(TM) i7-8650U</entry>
  </processor>
  <memory_device>
    <entry name='size'>32 GB</entry>
  </memory_device>
</sysinfo>"#;

fn default_node_devices() -> Vec<(String, String)> {
    vec![
        (
            "pci".to_string(),
            r#"<device>
  <name>pci_0000_01_00_0</name>
  <path>/sys/devices/pci0000:00/0000:00:01.0/0000:01:00.0</path>
  <parent>pci_0000_00_01_0</parent>
  <driver><name>vfio-pci</name></driver>
  <capability type='pci'>
    <class>0x030000</class>
    <domain>0</domain>
    <bus>1</bus>
    <slot>0</slot>
    <function>0</function>
    <product id='0x1eb8'>TU104GL [Tesla T4]</product>
    <vendor id='0x10de'>NVIDIA Corporation</vendor>
    <iommuGroup number='12'/>
  </capability>
</device>"#
                .to_string(),
        ),
        (
            "net".to_string(),
            r#"<device>
  <name>net_enp3s0_3c_ec_ef_10_20_30</name>
  <parent>pci_0000_03_00_0</parent>
  <capability type='net'>
    <interface>enp3s0</interface>
    <address>3c:ec:ef:10:20:30</address>
    <link speed='10000' state='up'/>
  </capability>
</device>"#
                .to_string(),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainDefaults;
    use crate::descriptor::DomainSpec;

    fn domain_xml(name: &str) -> String {
        let spec = DomainSpec {
            name: name.to_string(),
            memory_mib: 1024,
            vcpus: 1,
            disk_path: format!("/images/{}.qcow2", name),
            ..Default::default()
        };
        to_xml(&spec.resolve(&DomainDefaults::default()).unwrap().build(None)).unwrap()
    }

    #[tokio::test]
    async fn test_domain_lifecycle() {
        let conn = MockConnection::new();
        conn.define_domain(&domain_xml("web-1")).await.unwrap();
        assert_eq!(conn.domain_state("web-1").await.unwrap(), DomainState::ShutOff);

        conn.start_domain("web-1").await.unwrap();
        assert!(conn.start_domain("web-1").await.is_err());
        conn.suspend_domain("web-1").await.unwrap();
        conn.resume_domain("web-1").await.unwrap();
        conn.destroy_domain("web-1").await.unwrap();

        conn.undefine_domain("web-1", UndefineFlags::default()).await.unwrap();
        assert!(conn.domain_state("web-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_live_document_has_pty() {
        let conn = MockConnection::new();
        conn.define_domain(&domain_xml("web-1")).await.unwrap();
        conn.start_domain("web-1").await.unwrap();

        let live: DomainDescriptor = from_xml(&conn.domain_xml("web-1", false).await.unwrap()).unwrap();
        let inactive: DomainDescriptor = from_xml(&conn.domain_xml("web-1", true).await.unwrap()).unwrap();
        assert_eq!(live.serial_pty(), Some("/dev/pts/1"));
        assert_eq!(inactive.serial_pty(), None);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let conn = MockConnection::new();
        conn.fail_on(FailurePoint::DefineDomain);
        assert!(conn.define_domain(&domain_xml("web-1")).await.is_err());

        conn.clear_failure(FailurePoint::DefineDomain);
        conn.define_domain(&domain_xml("web-1")).await.unwrap();
        assert_eq!(conn.calls_starting_with("define_domain").len(), 2);
    }

    #[tokio::test]
    async fn test_redefine_must_keep_uuid() {
        let conn = MockConnection::new();
        conn.define_domain(&domain_xml("web-1")).await.unwrap();
        let stored = conn.domain_xml("web-1", true).await.unwrap();
        let uuid = from_xml::<DomainDescriptor>(&stored).unwrap().uuid.unwrap();

        // No uuid: libvirt would generate one, which clashes with the existing domain.
        let err = conn.define_domain(&domain_xml("web-1")).await.unwrap_err();
        assert!(err.is_already_exists());
        assert!(err.to_string().contains(&uuid));

        // Same uuid under another name.
        let renamed = stored.replace("<name>web-1</name>", "<name>web-2</name>");
        assert!(conn.define_domain(&renamed).await.unwrap_err().is_already_exists());

        // Carrying the uuid replaces the definition.
        conn.define_domain(&stored.replace("1048576", "2097152")).await.unwrap();
        let again: DomainDescriptor = from_xml(&conn.domain_xml("web-1", true).await.unwrap()).unwrap();
        assert_eq!(again.uuid.as_deref(), Some(uuid.as_str()));
        assert_eq!(again.memory_kib().unwrap(), 2_097_152);
    }

    #[tokio::test]
    async fn test_config_changes_keep_unknown_elements() {
        let conn = MockConnection::new();
        let xml = domain_xml("web-1").replace(
            "<devices>",
            "<seclabel type=\"dynamic\" model=\"selinux\"/>\n  <devices>",
        );
        conn.define_domain(&xml).await.unwrap();

        conn.set_memory("web-1", 2_097_152, ModifyFlags::CONFIG).await.unwrap();
        let disk = to_xml(&Disk::file("/images/data.qcow2", "vdb", DiskFormat::Qcow2)).unwrap();
        conn.attach_device("web-1", &disk, ModifyFlags::CONFIG).await.unwrap();

        let stored = conn.domain_xml("web-1", true).await.unwrap();
        assert!(stored.contains(r#"<seclabel type="dynamic" model="selinux"/>"#));
        let domain: DomainDescriptor = from_xml(&stored).unwrap();
        assert_eq!(domain.memory_kib().unwrap(), 2_097_152);
        assert!(domain.find_disk("vdb").is_some());

        let err = conn
            .attach_device("web-1", &disk, ModifyFlags::CONFIG)
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_volume_path_follows_pool() {
        let conn = MockConnection::new();
        let pool = PoolDescriptor::new("default", PoolType::Dir, "/var/lib/libvirt/images");
        conn.define_pool(&to_xml(&pool).unwrap()).await.unwrap();
        conn.start_pool("default").await.unwrap();

        let volume = VolumeDescriptor::new("a.qcow2", GIB, crate::types::DiskFormat::Qcow2);
        conn.create_volume("default", &to_xml(&volume).unwrap()).await.unwrap();

        let (pool_name, stored) = conn.volume_by_path("/var/lib/libvirt/images/a.qcow2").unwrap();
        assert_eq!(pool_name, "default");
        assert_eq!(stored.capacity.to_bytes().unwrap(), GIB);
        assert!(conn.resize_volume("default", "a.qcow2", GIB / 2).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_tree() {
        let conn = MockConnection::new();
        conn.define_domain(&domain_xml("web-1")).await.unwrap();

        for name in ["a", "b", "c"] {
            let xml = to_xml(&SnapshotDescriptor::new(name)).unwrap();
            conn.create_snapshot("web-1", &xml, SnapshotCreateFlags::default()).await.unwrap();
        }
        assert_eq!(conn.current_snapshot("web-1").await.unwrap().as_deref(), Some("c"));

        conn.delete_snapshot("web-1", "b", SnapshotDeleteFlags::default()).await.unwrap();
        let c: SnapshotDescriptor = from_xml(&conn.snapshot_xml("web-1", "c").await.unwrap()).unwrap();
        assert_eq!(c.parent_name(), Some("a"));

        let flags = SnapshotDeleteFlags { children: true, ..Default::default() };
        conn.delete_snapshot("web-1", "a", flags).await.unwrap();
        assert!(conn.list_snapshot_xmls("web-1").await.unwrap().is_empty());
        assert_eq!(conn.current_snapshot("web-1").await.unwrap(), None);
    }
}
