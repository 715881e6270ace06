//! Domain document (`<domain>`).

use serde::{Deserialize, Serialize};

use super::{Flag, ScaledValue};
use crate::error::{HypervisorError, Result};
use crate::types::{DiskBus, DiskFormat};

/// A complete domain definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "domain")]
pub struct DomainDescriptor {
    #[serde(rename = "@type")]
    pub domain_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub memory: ScaledValue,
    #[serde(rename = "currentMemory", skip_serializing_if = "Option::is_none")]
    pub current_memory: Option<ScaledValue>,
    pub vcpu: Vcpu,
    pub os: Os,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Cpu>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock: Option<Clock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_poweroff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_reboot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_crash: Option<String>,
    #[serde(default)]
    pub devices: Devices,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vcpu {
    #[serde(rename = "@placement", skip_serializing_if = "Option::is_none")]
    pub placement: Option<String>,
    #[serde(rename = "$text")]
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Os {
    #[serde(rename = "type")]
    pub os_type: OsType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loader: Option<Loader>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nvram: Option<Nvram>,
    #[serde(rename = "boot", default)]
    pub boot: Vec<BootDevice>,
}

/// Firmware image, e.g. OVMF for UEFI guests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loader {
    #[serde(rename = "@readonly", skip_serializing_if = "Option::is_none")]
    pub readonly: Option<String>,
    #[serde(rename = "@secure", skip_serializing_if = "Option::is_none")]
    pub secure: Option<String>,
    #[serde(rename = "@type", skip_serializing_if = "Option::is_none")]
    pub loader_type: Option<String>,
    #[serde(rename = "$text", default)]
    pub path: String,
}

/// Per-domain UEFI variable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nvram {
    #[serde(rename = "@template", skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(rename = "$text", default)]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsType {
    #[serde(rename = "@arch", skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(rename = "@machine", skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    #[serde(rename = "$text")]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootDevice {
    #[serde(rename = "@dev")]
    pub dev: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acpi: Option<Flag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apic: Option<Flag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pae: Option<Flag>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cpu {
    #[serde(rename = "@mode", skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(rename = "@check", skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<CpuTopology>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuTopology {
    #[serde(rename = "@sockets")]
    pub sockets: u32,
    #[serde(rename = "@cores")]
    pub cores: u32,
    #[serde(rename = "@threads")]
    pub threads: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clock {
    #[serde(rename = "@offset")]
    pub offset: String,
    #[serde(rename = "timer", default)]
    pub timers: Vec<Timer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@tickpolicy", skip_serializing_if = "Option::is_none")]
    pub tickpolicy: Option<String>,
    #[serde(rename = "@present", skip_serializing_if = "Option::is_none")]
    pub present: Option<String>,
}

// =============================================================================
// DEVICES
// =============================================================================

/// The `<devices>` aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Devices {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emulator: Option<String>,
    #[serde(rename = "disk", default)]
    pub disks: Vec<Disk>,
    #[serde(rename = "controller", default)]
    pub controllers: Vec<Controller>,
    #[serde(rename = "interface", default)]
    pub interfaces: Vec<Interface>,
    #[serde(rename = "serial", default)]
    pub serials: Vec<CharDevice>,
    #[serde(rename = "console", default)]
    pub consoles: Vec<CharDevice>,
    #[serde(rename = "channel", default)]
    pub channels: Vec<CharDevice>,
    #[serde(rename = "input", default)]
    pub inputs: Vec<Input>,
    #[serde(rename = "graphics", default)]
    pub graphics: Vec<Graphics>,
    #[serde(rename = "video", default)]
    pub videos: Vec<Video>,
    #[serde(rename = "watchdog", default)]
    pub watchdogs: Vec<Watchdog>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memballoon: Option<MemBalloon>,
    #[serde(rename = "rng", default)]
    pub rngs: Vec<Rng>,
    #[serde(rename = "tpm", default)]
    pub tpms: Vec<Tpm>,
    #[serde(rename = "hostdev", default)]
    pub hostdevs: Vec<HostDev>,
}

/// Guest-visible bus address of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAddress {
    #[serde(rename = "@type", skip_serializing_if = "Option::is_none")]
    pub address_type: Option<String>,
    #[serde(rename = "@domain", skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(rename = "@bus", skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
    #[serde(rename = "@slot", skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
    #[serde(rename = "@function", skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(rename = "@controller", skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
    #[serde(rename = "@target", skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(rename = "@unit", skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(rename = "@port", skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

/// `<model type='...'/>` as used by NICs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceModel {
    #[serde(rename = "@type")]
    pub model_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "disk")]
pub struct Disk {
    #[serde(rename = "@type")]
    pub disk_type: String,
    #[serde(rename = "@device")]
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<DiskDriver>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<DiskSource>,
    pub target: DiskTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly: Option<Flag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot: Option<BootOrder>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<DeviceAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskDriver {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@type", skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(rename = "@cache", skip_serializing_if = "Option::is_none")]
    pub cache: Option<String>,
    #[serde(rename = "@discard", skip_serializing_if = "Option::is_none")]
    pub discard: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskSource {
    #[serde(rename = "@file", skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(rename = "@dev", skip_serializing_if = "Option::is_none")]
    pub dev: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskTarget {
    #[serde(rename = "@dev")]
    pub dev: String,
    #[serde(rename = "@bus", skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootOrder {
    #[serde(rename = "@order")]
    pub order: u32,
}

impl Disk {
    /// A file-backed disk at `target`; the bus follows the target prefix.
    pub fn file(path: &str, target: &str, format: DiskFormat) -> Self {
        Self {
            disk_type: "file".to_string(),
            device: "disk".to_string(),
            driver: Some(DiskDriver {
                name: "qemu".to_string(),
                format: Some(format.as_str().to_string()),
                cache: None,
                discard: None,
            }),
            source: Some(DiskSource { file: Some(path.to_string()), dev: None }),
            target: DiskTarget {
                dev: target.to_string(),
                bus: Some(DiskBus::for_target(target).as_str().to_string()),
            },
            readonly: None,
            serial: None,
            boot: None,
            address: None,
        }
    }

    /// A read-only IDE CD-ROM holding an ISO image.
    pub fn cdrom(path: &str, target: &str) -> Self {
        Self {
            disk_type: "file".to_string(),
            device: "cdrom".to_string(),
            driver: Some(DiskDriver {
                name: "qemu".to_string(),
                format: Some("raw".to_string()),
                cache: None,
                discard: None,
            }),
            source: Some(DiskSource { file: Some(path.to_string()), dev: None }),
            target: DiskTarget {
                dev: target.to_string(),
                bus: Some(DiskBus::Ide.as_str().to_string()),
            },
            readonly: Some(Flag {}),
            serial: None,
            boot: None,
            address: None,
        }
    }

    pub fn source_path(&self) -> Option<&str> {
        self.source
            .as_ref()
            .and_then(|s| s.file.as_deref().or(s.dev.as_deref()))
    }

    pub fn is_cdrom(&self) -> bool {
        self.device == "cdrom"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    #[serde(rename = "@type")]
    pub controller_type: String,
    #[serde(rename = "@index", skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(rename = "@model", skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<DeviceAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    #[serde(rename = "@type")]
    pub interface_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<InterfaceSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<InterfaceTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<DeviceModel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<DeviceAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacAddress {
    #[serde(rename = "@address")]
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSource {
    #[serde(rename = "@bridge", skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    #[serde(rename = "@network", skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(rename = "@dev", skip_serializing_if = "Option::is_none")]
    pub dev: Option<String>,
    #[serde(rename = "@mode", skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceTarget {
    #[serde(rename = "@dev")]
    pub dev: String,
}

/// Serial port, console or channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharDevice {
    #[serde(rename = "@type")]
    pub char_type: String,
    #[serde(rename = "@tty", skip_serializing_if = "Option::is_none")]
    pub tty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CharSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<CharTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<DeviceAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharSource {
    #[serde(rename = "@mode", skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(rename = "@path", skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharTarget {
    #[serde(rename = "@type", skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    #[serde(rename = "@port", skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
    #[serde(rename = "@name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "@state", skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    #[serde(rename = "@type")]
    pub input_type: String,
    #[serde(rename = "@bus", skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<DeviceAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graphics {
    #[serde(rename = "@type")]
    pub graphics_type: String,
    #[serde(rename = "@socket", skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
    #[serde(rename = "@port", skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(rename = "@autoport", skip_serializing_if = "Option::is_none")]
    pub autoport: Option<String>,
    #[serde(rename = "listen", default)]
    pub listens: Vec<GraphicsListen>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphicsListen {
    #[serde(rename = "@type")]
    pub listen_type: String,
    #[serde(rename = "@socket", skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
    #[serde(rename = "@address", skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Graphics {
    /// The unix socket this display listens on, if any.
    pub fn socket_path(&self) -> Option<&str> {
        self.socket.as_deref().or_else(|| {
            self.listens
                .iter()
                .find(|l| l.listen_type == "socket")
                .and_then(|l| l.socket.as_deref())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub model: VideoModel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<DeviceAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoModel {
    #[serde(rename = "@type")]
    pub model_type: String,
    #[serde(rename = "@heads", skip_serializing_if = "Option::is_none")]
    pub heads: Option<u32>,
    #[serde(rename = "@primary", skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watchdog {
    #[serde(rename = "@model")]
    pub model: String,
    #[serde(rename = "@action", skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemBalloon {
    #[serde(rename = "@model")]
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<DeviceAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rng {
    #[serde(rename = "@model")]
    pub model: String,
    pub backend: RngBackend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<DeviceAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RngBackend {
    #[serde(rename = "@model")]
    pub model: String,
    #[serde(rename = "$text")]
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tpm {
    #[serde(rename = "@model", skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub backend: TpmBackend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpmBackend {
    #[serde(rename = "@type")]
    pub backend_type: String,
    #[serde(rename = "@version", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostDev {
    #[serde(rename = "@mode")]
    pub mode: String,
    #[serde(rename = "@type")]
    pub hostdev_type: String,
    #[serde(rename = "@managed", skip_serializing_if = "Option::is_none")]
    pub managed: Option<String>,
    pub source: HostDevSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<DeviceAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostDevSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<DeviceAddress>,
}

// =============================================================================
// QUERIES
// =============================================================================
//
// Edits go through `descriptor::patch` on the fetched document, so that
// elements this model does not cover survive a redefine.

impl DomainDescriptor {
    pub fn find_disk(&self, target: &str) -> Option<&Disk> {
        self.devices.disks.iter().find(|d| d.target.dev == target)
    }

    /// Fails with `AlreadyExists` when a disk already uses `target`.
    pub fn ensure_target_free(&self, target: &str) -> Result<()> {
        match self.find_disk(target) {
            Some(_) => Err(HypervisorError::AlreadyExists(format!(
                "disk target '{}' on domain '{}'",
                target, self.name
            ))),
            None => Ok(()),
        }
    }

    /// The disk at `target`, or `NotFound`.
    pub fn require_disk(&self, target: &str) -> Result<&Disk> {
        self.find_disk(target)
            .ok_or_else(|| HypervisorError::NotFound(format!("disk target '{}' on domain '{}'", target, self.name)))
    }

    pub fn memory_kib(&self) -> Result<u64> {
        self.memory.to_kib()
    }

    /// Unix socket of the first VNC display.
    pub fn vnc_socket(&self) -> Option<&str> {
        self.devices
            .graphics
            .iter()
            .filter(|g| g.graphics_type == "vnc")
            .find_map(Graphics::socket_path)
    }

    /// PTY device of the first serial port; only present while running.
    pub fn serial_pty(&self) -> Option<&str> {
        let serial = self
            .devices
            .serials
            .iter()
            .find(|s| s.char_type == "pty")
            .and_then(|s| s.source.as_ref().and_then(|src| src.path.as_deref()).or(s.tty.as_deref()));

        serial.or_else(|| {
            self.devices
                .consoles
                .iter()
                .filter(|c| c.char_type == "pty")
                .find_map(|c| c.tty.as_deref().or_else(|| c.source.as_ref().and_then(|s| s.path.as_deref())))
        })
    }

    /// Backing files of every non-CD-ROM disk.
    pub fn disk_paths(&self) -> impl Iterator<Item = &str> {
        self.devices
            .disks
            .iter()
            .filter(|d| !d.is_cdrom())
            .filter_map(Disk::source_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{from_xml, to_xml};

    /// Trimmed `virsh dumpxml` of a running guest.
    const LIVE_XML: &str = r#"
<domain type='kvm' id='7'>
  <name>web-1</name>
  <uuid>4dea22b3-1d52-d8f3-2516-782e98ab3fa0</uuid>
  <memory unit='KiB'>2097152</memory>
  <currentMemory unit='KiB'>2097152</currentMemory>
  <vcpu placement='static'>2</vcpu>
  <resource><partition>/machine</partition></resource>
  <os>
    <type arch='x86_64' machine='pc-i440fx-6.2'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features><acpi/><apic/></features>
  <cpu mode='host-passthrough' check='none'/>
  <clock offset='utc'><timer name='rtc' tickpolicy='catchup'/></clock>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/web-1.qcow2' index='1'/>
      <backingStore/>
      <target dev='vda' bus='virtio'/>
      <alias name='virtio-disk0'/>
      <address type='pci' domain='0x0000' bus='0x00' slot='0x04' function='0x0'/>
    </disk>
    <controller type='usb' index='0' model='qemu-xhci'/>
    <interface type='bridge'>
      <mac address='52:54:00:6b:3c:58'/>
      <source bridge='br0'/>
      <target dev='vnet3'/>
      <model type='virtio'/>
    </interface>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='/var/lib/libvirt/images/cloudinit/web-1.iso'/>
      <target dev='hdd' bus='ide'/>
      <readonly/>
    </disk>
    <serial type='pty'>
      <source path='/dev/pts/4'/>
      <target type='isa-serial' port='0'><model name='isa-serial'/></target>
    </serial>
    <console type='pty' tty='/dev/pts/4'>
      <source path='/dev/pts/4'/>
      <target type='serial' port='0'/>
    </console>
    <input type='tablet' bus='usb'/>
    <graphics type='vnc' socket='/var/lib/libvirt/qemu/vnc/web-1.vnc'>
      <listen type='socket' socket='/var/lib/libvirt/qemu/vnc/web-1.vnc'/>
    </graphics>
    <video><model type='virtio' heads='1' primary='yes'/></video>
    <memballoon model='virtio'/>
    <rng model='virtio'><backend model='random'>/dev/urandom</backend></rng>
  </devices>
</domain>"#;

    #[test]
    fn test_decode_live_document() {
        let domain: DomainDescriptor = from_xml(LIVE_XML).unwrap();

        assert_eq!(domain.name, "web-1");
        assert_eq!(domain.memory_kib().unwrap(), 2 * 1024 * 1024);
        assert_eq!(domain.vcpu.count, 2);
        // Interleaved disk elements land in the same list.
        assert_eq!(domain.devices.disks.len(), 2);
        assert_eq!(domain.find_disk("vda").unwrap().source_path(), Some("/var/lib/libvirt/images/web-1.qcow2"));
        assert!(domain.find_disk("hdd").unwrap().is_cdrom());
        assert_eq!(domain.vnc_socket(), Some("/var/lib/libvirt/qemu/vnc/web-1.vnc"));
        assert_eq!(domain.serial_pty(), Some("/dev/pts/4"));
        assert_eq!(domain.disk_paths().collect::<Vec<_>>(), vec!["/var/lib/libvirt/images/web-1.qcow2"]);
    }

    #[test]
    fn test_reencode_keeps_only_modelled_elements() {
        let domain: DomainDescriptor = from_xml(LIVE_XML).unwrap();
        let encoded = to_xml(&domain).unwrap();
        let again: DomainDescriptor = from_xml(&encoded).unwrap();
        assert_eq!(domain, again);

        // Unmodelled elements are lost, which is why redefines patch the
        // fetched document instead of encoding this model.
        assert!(LIVE_XML.contains("<resource>"));
        assert!(!encoded.contains("<resource>"));
        assert!(!encoded.contains("<alias"));
    }

    #[test]
    fn test_decode_uefi_firmware() {
        let xml = LIVE_XML.replace(
            "<boot dev='hd'/>",
            "<loader readonly='yes' type='pflash'>/usr/share/OVMF/OVMF_CODE.fd</loader>\n    \
             <nvram template='/usr/share/OVMF/OVMF_VARS.fd'>/var/lib/libvirt/qemu/nvram/web-1_VARS.fd</nvram>\n    \
             <boot dev='hd'/>",
        );
        let domain: DomainDescriptor = from_xml(&xml).unwrap();

        let loader = domain.os.loader.as_ref().unwrap();
        assert_eq!(loader.path, "/usr/share/OVMF/OVMF_CODE.fd");
        assert_eq!(loader.loader_type.as_deref(), Some("pflash"));
        let nvram = domain.os.nvram.as_ref().unwrap();
        assert_eq!(nvram.template.as_deref(), Some("/usr/share/OVMF/OVMF_VARS.fd"));
        assert_eq!(domain.os.boot.len(), 1);
    }

    #[test]
    fn test_disk_target_checks() {
        let domain: DomainDescriptor = from_xml(LIVE_XML).unwrap();

        assert!(domain.ensure_target_free("vda").unwrap_err().is_already_exists());
        domain.ensure_target_free("vdb").unwrap();

        assert_eq!(
            domain.require_disk("hdd").unwrap().source_path(),
            Some("/var/lib/libvirt/images/cloudinit/web-1.iso")
        );
        let err = domain.require_disk("vdb").unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("disk target 'vdb' on domain 'web-1'"));
    }

    #[test]
    fn test_disk_fragment_encodes_as_disk_element() {
        let xml = to_xml(&Disk::file("/images/data.qcow2", "vdb", DiskFormat::Qcow2)).unwrap();
        assert!(xml.starts_with("<disk"));
        assert!(xml.contains(r#"<target dev="vdb" bus="virtio"/>"#));
        assert!(xml.contains(r#"file="/images/data.qcow2""#));
    }
}
