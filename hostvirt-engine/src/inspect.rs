//! Host inventory: capabilities, SMBIOS data and node devices.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::connection::Connection;
use crate::descriptor::{from_xml, CapabilitiesDocument, NodeDeviceDocument, SysinfoDocument, SysinfoSection};
use crate::error::{HypervisorError, Result, ResultExt};
use crate::types::{Outcome, Warning, WarningKind};

/// What the hypervisor host offers to guests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostCapabilities {
    pub host_uuid: Option<String>,
    /// Host CPU architecture, e.g. `x86_64`
    pub arch: String,
    pub cpu_model: Option<String>,
    pub cpu_vendor: Option<String>,
    pub sockets: u32,
    pub cores_per_socket: u32,
    pub threads_per_core: u32,
    /// CPU flags beyond the base model
    pub cpu_features: Vec<String>,
    /// IOMMU available for device passthrough
    pub iommu: bool,
    pub numa_nodes: Vec<NumaNode>,
    pub guests: Vec<GuestSupport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumaNode {
    pub id: u32,
    pub memory_bytes: Option<u64>,
    pub cpus: Option<u32>,
}

/// One guest architecture and the machine types the emulator provides for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestSupport {
    pub os_type: String,
    pub arch: String,
    pub emulator: Option<String>,
    /// Machine type names, aliases included (`q35`, `pc-q35-8.2`, ...)
    pub machines: Vec<String>,
    /// Accelerators, e.g. `kvm`, `qemu`
    pub domain_types: Vec<String>,
}

impl HostCapabilities {
    pub fn logical_cpus(&self) -> u32 {
        self.sockets * self.cores_per_socket * self.threads_per_core
    }

    pub fn supports_kvm(&self) -> bool {
        self.guests.iter().any(|g| g.domain_types.iter().any(|t| t == "kvm"))
    }
}

impl TryFrom<CapabilitiesDocument> for HostCapabilities {
    type Error = HypervisorError;

    fn try_from(doc: CapabilitiesDocument) -> Result<Self> {
        let cpu = doc.host.cpu;
        let (sockets, cores, threads) = cpu
            .topology
            .as_ref()
            .map(|t| (t.sockets, t.cores, t.threads))
            .unwrap_or((1, 1, 1));

        let numa_nodes = doc
            .host
            .topology
            .map(|t| t.cells.cells)
            .unwrap_or_default()
            .into_iter()
            .map(|cell| {
                Ok(NumaNode {
                    id: cell.id,
                    memory_bytes: cell.memory.as_ref().map(|m| m.to_bytes()).transpose()?,
                    cpus: cell.cpus.map(|c| c.num),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let guests = doc
            .guests
            .into_iter()
            .map(|guest| GuestSupport {
                os_type: guest.os_type,
                arch: guest.arch.name,
                emulator: guest.arch.emulator,
                machines: guest.arch.machines.into_iter().map(|m| m.name).collect(),
                domain_types: guest.arch.domains.into_iter().map(|d| d.domain_type).collect(),
            })
            .collect();

        Ok(Self {
            host_uuid: doc.host.uuid,
            arch: cpu.arch,
            cpu_model: cpu.model,
            cpu_vendor: cpu.vendor,
            sockets,
            cores_per_socket: cores,
            threads_per_core: threads,
            cpu_features: cpu.features.into_iter().map(|f| f.name).collect(),
            iommu: doc.host.iommu.map(|i| i.support == "yes").unwrap_or(false),
            numa_nodes,
            guests,
        })
    }
}

/// SMBIOS identity of the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostSysinfo {
    pub bios_vendor: Option<String>,
    pub bios_version: Option<String>,
    pub bios_date: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub system_uuid: Option<String>,
    pub board_product: Option<String>,
    /// One entry per socket
    pub processors: Vec<String>,
    /// Size of each populated memory slot, as reported (`16 GB`)
    pub memory_modules: Vec<String>,
}

fn entry(section: Option<&SysinfoSection>, name: &str) -> Option<String> {
    section.and_then(|s| s.get(name)).map(String::from)
}

impl From<SysinfoDocument> for HostSysinfo {
    fn from(doc: SysinfoDocument) -> Self {
        Self {
            bios_vendor: entry(doc.bios.as_ref(), "vendor"),
            bios_version: entry(doc.bios.as_ref(), "version"),
            bios_date: entry(doc.bios.as_ref(), "date"),
            manufacturer: entry(doc.system.as_ref(), "manufacturer"),
            product: entry(doc.system.as_ref(), "product"),
            serial: entry(doc.system.as_ref(), "serial"),
            system_uuid: entry(doc.system.as_ref(), "uuid"),
            board_product: entry(doc.base_boards.first(), "product"),
            processors: doc.processors.iter().filter_map(|p| entry(Some(p), "version")).collect(),
            memory_modules: doc.memory_devices.iter().filter_map(|m| entry(Some(m), "size")).collect(),
        }
    }
}

/// A host device as seen by the hypervisor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostDevice {
    /// Node device name, e.g. `pci_0000_01_00_0`
    pub name: String,
    pub parent: Option<String>,
    /// Bound kernel driver
    pub driver: Option<String>,
    /// First capability type: `pci`, `net`, `usb_device`, `storage`, ...
    pub kind: String,
    /// `DDDD:BB:SS.F` for PCI devices
    pub pci_address: Option<String>,
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub iommu_group: Option<u32>,
    /// Network interface name
    pub interface: Option<String>,
    pub mac_address: Option<String>,
    pub link_state: Option<String>,
    /// Mbit/s
    pub link_speed: Option<u32>,
    /// Block device node for storage devices
    pub block_device: Option<String>,
}

impl HostDevice {
    /// Bound to `vfio-pci` and so ready to hand to a guest.
    pub fn is_passthrough_ready(&self) -> bool {
        self.driver.as_deref() == Some("vfio-pci")
    }
}

fn pci_part(value: &Option<String>) -> Option<u32> {
    let value = value.as_deref()?.trim();
    match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

impl From<NodeDeviceDocument> for HostDevice {
    fn from(doc: NodeDeviceDocument) -> Self {
        let mut device = HostDevice {
            name: doc.name,
            parent: doc.parent,
            driver: doc.driver.map(|d| d.name),
            ..Default::default()
        };
        let Some(cap) = doc.capabilities.into_iter().next() else {
            return device;
        };

        device.pci_address = match (pci_part(&cap.domain), pci_part(&cap.bus), pci_part(&cap.slot), pci_part(&cap.function)) {
            (Some(domain), Some(bus), Some(slot), Some(function)) if cap.cap_type == "pci" => {
                Some(format!("{:04x}:{:02x}:{:02x}.{:x}", domain, bus, slot, function))
            }
            _ => None,
        };
        device.kind = cap.cap_type;
        device.vendor = cap.vendor.map(|v| if v.name.is_empty() { v.id } else { v.name });
        device.product = cap.product.map(|p| if p.name.is_empty() { p.id } else { p.name });
        device.iommu_group = cap.iommu_group.map(|g| g.number);
        device.interface = cap.interface;
        device.mac_address = cap.address;
        if let Some(link) = cap.link {
            device.link_state = link.state;
            device.link_speed = link.speed;
        }
        device.block_device = cap.block;
        device
    }
}

/// Reads the host's inventory documents through the connection.
pub struct HostInspector {
    connection: Arc<dyn Connection>,
}

impl HostInspector {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self { connection }
    }

    #[instrument(skip(self))]
    pub async fn capabilities(&self) -> Result<HostCapabilities> {
        let xml = self.connection.capabilities_xml().await.context("capabilities", "host")?;
        let doc: CapabilitiesDocument = from_xml(&xml).context("capabilities", "host")?;
        HostCapabilities::try_from(doc).context("capabilities", "host")
    }

    #[instrument(skip(self))]
    pub async fn sysinfo(&self) -> Result<HostSysinfo> {
        let xml = self.connection.sysinfo_xml().await.context("sysinfo", "host")?;
        let doc: SysinfoDocument = from_xml(&xml).context("sysinfo", "host")?;
        Ok(doc.into())
    }

    /// Devices with capability `cap` (all devices when `None`). Documents
    /// that fail to decode are skipped with a warning.
    #[instrument(skip(self))]
    pub async fn node_devices(&self, cap: Option<&str>) -> Result<Outcome<Vec<HostDevice>>> {
        let documents = self
            .connection
            .node_device_xmls(cap)
            .await
            .context("node_devices", cap.unwrap_or("all"))?;

        let mut outcome = Outcome::new(Vec::with_capacity(documents.len()));
        for xml in &documents {
            match from_xml::<NodeDeviceDocument>(xml) {
                Ok(doc) => outcome.value.push(doc.into()),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable node device document");
                    outcome.warnings.push(Warning::new(WarningKind::Skipped, format!("node device: {}", e)));
                }
            }
        }
        debug!(count = outcome.value.len(), "Node devices read");
        Ok(outcome)
    }
}
