//! Type definitions shared by the managers: states, flags, reports.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// BEST-EFFORT RESULTS
// =============================================================================

/// Category of a swallowed, best-effort failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Live update not supported by the hypervisor/guest combination
    Unsupported,
    /// Ownership or permission fix was refused
    PermissionDenied,
    /// A cleanup step (volume/ISO/pool removal) failed
    Cleanup,
    /// Autostart could not be toggled
    Autostart,
    /// An entry in a listing could not be parsed and was skipped
    Skipped,
}

/// A best-effort failure that did not fail the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Result of an operation that succeeded, plus any best-effort failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome<T> {
    pub value: T,
    pub warnings: Vec<Warning>,
}

impl<T> Outcome<T> {
    pub fn new(value: T) -> Self {
        Self { value, warnings: Vec::new() }
    }

    pub fn with_warnings(value: T, warnings: Vec<Warning>) -> Self {
        Self { value, warnings }
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn has_warning(&self, kind: WarningKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome { value: f(self.value), warnings: self.warnings }
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

// =============================================================================
// DOMAIN STATE
// =============================================================================

/// Domain power state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    ShutOff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    /// Whether a live instance exists (live RPCs are meaningful).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DomainState::Running
                | DomainState::Blocked
                | DomainState::Paused
                | DomainState::ShuttingDown
                | DomainState::PmSuspended
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, DomainState::Running | DomainState::Blocked)
    }
}

impl Default for DomainState {
    fn default() -> Self {
        Self::NoState
    }
}

/// Basic domain information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSummary {
    pub name: String,
    pub uuid: Option<String>,
    pub state: DomainState,
    pub persistent: bool,
}

/// Console endpoints for a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleInfo {
    /// VNC unix socket path, fixed at define time
    pub vnc_socket: Option<String>,
    /// Serial PTY device, assigned by the hypervisor while running
    pub serial_pty: Option<String>,
}

// =============================================================================
// REQUEST FLAGS
// =============================================================================

/// Which side of a domain a modification affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModifyFlags {
    /// The running instance
    pub live: bool,
    /// The persistent definition
    pub config: bool,
}

impl ModifyFlags {
    pub const LIVE: ModifyFlags = ModifyFlags { live: true, config: false };
    pub const CONFIG: ModifyFlags = ModifyFlags { live: false, config: true };
}

/// What else to remove when undefining a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UndefineFlags {
    pub managed_save: bool,
    pub snapshots_metadata: bool,
    pub nvram: bool,
}

impl UndefineFlags {
    /// Remove everything the hypervisor keeps for the domain.
    pub fn all() -> Self {
        Self { managed_save: true, snapshots_metadata: true, nvram: true }
    }
}

/// Snapshot creation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotCreateFlags {
    pub disk_only: bool,
    pub atomic: bool,
    pub quiesce: bool,
    pub halt: bool,
    pub no_metadata: bool,
}

/// Snapshot revert flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotRevertFlags {
    pub running: bool,
    pub paused: bool,
    pub force: bool,
}

/// Snapshot deletion flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotDeleteFlags {
    pub children: bool,
    pub children_only: bool,
    pub metadata_only: bool,
}

// =============================================================================
// DISKS & NETWORK
// =============================================================================

/// Disk bus type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    Virtio,
    Scsi,
    Sata,
    Ide,
    Usb,
}

impl DiskBus {
    /// Get the libvirt bus name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "virtio",
            DiskBus::Scsi => "scsi",
            DiskBus::Sata => "sata",
            DiskBus::Ide => "ide",
            DiskBus::Usb => "usb",
        }
    }

    /// Get the device prefix.
    pub fn device_prefix(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "vd",
            DiskBus::Scsi | DiskBus::Sata | DiskBus::Usb => "sd",
            DiskBus::Ide => "hd",
        }
    }

    /// Guess the bus from a target device name such as `vdb` or `sdc`.
    pub fn for_target(target: &str) -> DiskBus {
        if target.starts_with("vd") {
            DiskBus::Virtio
        } else if target.starts_with("hd") {
            DiskBus::Ide
        } else if target.starts_with("sd") {
            DiskBus::Scsi
        } else {
            DiskBus::Virtio
        }
    }
}

impl std::str::FromStr for DiskBus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "virtio" => Ok(DiskBus::Virtio),
            "scsi" => Ok(DiskBus::Scsi),
            "sata" => Ok(DiskBus::Sata),
            "ide" => Ok(DiskBus::Ide),
            "usb" => Ok(DiskBus::Usb),
            other => Err(format!("unknown disk bus '{}'", other)),
        }
    }
}

/// Disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vmdk,
    Vdi,
}

impl DiskFormat {
    /// Get the format string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vdi => "vdi",
        }
    }

    /// Guess the format from a file name. `.img` is treated as raw.
    pub fn from_path(path: &str) -> Option<DiskFormat> {
        let ext = std::path::Path::new(path).extension()?.to_str()?;
        match ext.to_ascii_lowercase().as_str() {
            "qcow2" => Some(DiskFormat::Qcow2),
            "raw" | "img" => Some(DiskFormat::Raw),
            "vmdk" => Some(DiskFormat::Vmdk),
            "vdi" => Some(DiskFormat::Vdi),
            _ => None,
        }
    }
}

impl std::str::FromStr for DiskFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "qcow2" => Ok(DiskFormat::Qcow2),
            "raw" => Ok(DiskFormat::Raw),
            "vmdk" => Ok(DiskFormat::Vmdk),
            "vdi" => Ok(DiskFormat::Vdi),
            other => Err(format!("unknown disk format '{}'", other)),
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a NIC reaches the host network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Host bridge (e.g. `br0`)
    Bridge,
    /// Libvirt virtual network (e.g. `default`)
    Network,
    /// macvtap on a host interface
    Direct,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Bridge => "bridge",
            NetworkMode::Network => "network",
            NetworkMode::Direct => "direct",
        }
    }
}

impl std::str::FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bridge" => Ok(NetworkMode::Bridge),
            "network" => Ok(NetworkMode::Network),
            "direct" => Ok(NetworkMode::Direct),
            other => Err(format!("unknown network mode '{}'", other)),
        }
    }
}

// =============================================================================
// STORAGE
// =============================================================================

/// Type of storage pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolType {
    /// Local directory (file-based)
    Dir,
    /// Pre-formatted block device mounted as a filesystem
    Fs,
    /// Network filesystem (NFS)
    Netfs,
    /// LVM volume group
    Logical,
}

impl PoolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolType::Dir => "dir",
            PoolType::Fs => "fs",
            PoolType::Netfs => "netfs",
            PoolType::Logical => "logical",
        }
    }
}

impl std::str::FromStr for PoolType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "dir" => Ok(PoolType::Dir),
            "fs" => Ok(PoolType::Fs),
            "netfs" => Ok(PoolType::Netfs),
            "logical" => Ok(PoolType::Logical),
            other => Err(format!("unknown pool type '{}'", other)),
        }
    }
}

/// Pool runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Inactive,
    Building,
    Active,
    Degraded,
    Inaccessible,
}

/// Runtime figures for a pool, as returned by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRuntime {
    pub state: PoolState,
    pub capacity: u64,
    pub allocation: u64,
    pub available: u64,
}

/// Information about a storage pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePoolInfo {
    pub name: String,
    pub pool_type: String,
    pub path: String,
    pub state: PoolState,
    pub capacity_bytes: u64,
    pub allocation_bytes: u64,
    pub available_bytes: u64,
    pub autostart: bool,
}

/// Reference to the read-only image an overlay is layered on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackingStoreRef {
    pub path: String,
    pub format: Option<String>,
}

/// Information about a storage volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub pool: String,
    pub path: String,
    /// Virtual size in bytes
    pub capacity_bytes: u64,
    /// Bytes actually allocated on the host
    pub allocation_bytes: u64,
    pub format: Option<String>,
    pub backing_store: Option<BackingStoreRef>,
}

impl VolumeInfo {
    /// Whether this volume is a copy-on-write overlay.
    pub fn is_overlay(&self) -> bool {
        self.backing_store.is_some()
    }
}

pub const GIB: u64 = 1024 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_tracks_warnings() {
        let mut outcome = Outcome::new(3u32);
        assert!(outcome.is_clean());

        outcome.warnings.push(Warning::new(WarningKind::Unsupported, "no hot memory"));
        let outcome = outcome.map(|v| v * 2);

        assert_eq!(outcome.value, 6);
        assert!(outcome.has_warning(WarningKind::Unsupported));
        assert!(!outcome.has_warning(WarningKind::Cleanup));
    }

    #[test]
    fn test_domain_state_activity() {
        assert!(DomainState::Running.is_active());
        assert!(DomainState::Paused.is_active());
        assert!(!DomainState::Paused.is_running());
        assert!(!DomainState::ShutOff.is_active());
        assert!(!DomainState::Crashed.is_active());
    }

    #[test]
    fn test_disk_bus_for_target() {
        assert_eq!(DiskBus::for_target("vdb"), DiskBus::Virtio);
        assert_eq!(DiskBus::for_target("hdc"), DiskBus::Ide);
        assert_eq!(DiskBus::for_target("sda"), DiskBus::Scsi);
    }

    #[test]
    fn test_disk_format_from_path() {
        assert_eq!(DiskFormat::from_path("/var/lib/images/base.qcow2"), Some(DiskFormat::Qcow2));
        assert_eq!(DiskFormat::from_path("/x/disk.IMG"), Some(DiskFormat::Raw));
        assert_eq!(DiskFormat::from_path("/x/disk"), None);
    }
}
