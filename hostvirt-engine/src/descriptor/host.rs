//! Host inventory documents: capabilities, SMBIOS sysinfo and node devices.

use serde::{Deserialize, Serialize};

use super::ScaledValue;

// =============================================================================
// CAPABILITIES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "capabilities")]
pub struct CapabilitiesDocument {
    pub host: CapsHost,
    #[serde(rename = "guest", default)]
    pub guests: Vec<CapsGuest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsHost {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub cpu: CapsCpu,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iommu: Option<CapsIommu>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<CapsNumaTopology>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsCpu {
    pub arch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<CapsCpuTopology>,
    #[serde(rename = "feature", default)]
    pub features: Vec<CapsFeature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsCpuTopology {
    #[serde(rename = "@sockets")]
    pub sockets: u32,
    #[serde(rename = "@dies", skip_serializing_if = "Option::is_none")]
    pub dies: Option<u32>,
    #[serde(rename = "@cores")]
    pub cores: u32,
    #[serde(rename = "@threads")]
    pub threads: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsFeature {
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsIommu {
    #[serde(rename = "@support")]
    pub support: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsNumaTopology {
    pub cells: CapsCells,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsCells {
    #[serde(rename = "@num", skip_serializing_if = "Option::is_none")]
    pub num: Option<u32>,
    #[serde(rename = "cell", default)]
    pub cells: Vec<CapsCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsCell {
    #[serde(rename = "@id")]
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<ScaledValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<CapsCellCpus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsCellCpus {
    #[serde(rename = "@num")]
    pub num: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsGuest {
    pub os_type: String,
    pub arch: CapsGuestArch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsGuestArch {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wordsize: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emulator: Option<String>,
    #[serde(rename = "machine", default)]
    pub machines: Vec<CapsMachine>,
    #[serde(rename = "domain", default)]
    pub domains: Vec<CapsGuestDomain>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsMachine {
    #[serde(rename = "@canonical", skip_serializing_if = "Option::is_none")]
    pub canonical: Option<String>,
    #[serde(rename = "@maxCpus", skip_serializing_if = "Option::is_none")]
    pub max_cpus: Option<u32>,
    #[serde(rename = "$text")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsGuestDomain {
    #[serde(rename = "@type")]
    pub domain_type: String,
}

// =============================================================================
// SYSINFO
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "sysinfo")]
pub struct SysinfoDocument {
    #[serde(rename = "@type")]
    pub sysinfo_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bios: Option<SysinfoSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SysinfoSection>,
    #[serde(rename = "baseBoard", default)]
    pub base_boards: Vec<SysinfoSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chassis: Option<SysinfoSection>,
    #[serde(rename = "processor", default)]
    pub processors: Vec<SysinfoSection>,
    #[serde(rename = "memory_device", default)]
    pub memory_devices: Vec<SysinfoSection>,
}

/// A group of `<entry name='...'>value</entry>` elements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SysinfoSection {
    #[serde(rename = "entry", default)]
    pub entries: Vec<SysinfoEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysinfoEntry {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "$text", default)]
    pub value: String,
}

impl SysinfoSection {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.trim())
            .filter(|v| !v.is_empty())
    }
}

// =============================================================================
// NODE DEVICES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "device")]
pub struct NodeDeviceDocument {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<NodeDeviceDriver>,
    #[serde(rename = "capability", default)]
    pub capabilities: Vec<NodeDeviceCapability>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDeviceDriver {
    pub name: String,
}

/// One `<capability type='...'>` block; only the fields of the common
/// types (`pci`, `net`, `usb_device`, `storage`) are decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDeviceCapability {
    #[serde(rename = "@type")]
    pub cap_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<IdName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<IdName>,
    #[serde(rename = "iommuGroup", skip_serializing_if = "Option::is_none")]
    pub iommu_group: Option<IommuGroup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<NetLink>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdName {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "$text", default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IommuGroup {
    #[serde(rename = "@number")]
    pub number: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetLink {
    #[serde(rename = "@speed", skip_serializing_if = "Option::is_none")]
    pub speed: Option<u32>,
    #[serde(rename = "@state", skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::from_xml;

    #[test]
    fn test_decode_sysinfo_with_empty_entries() {
        let xml = r#"
<sysinfo type='smbios'>
  <bios>
    <entry name='vendor'>LENOVO</entry>
    <entry name='version'>M1AKT52A</entry>
  </bios>
  <system>
    <entry name='manufacturer'>LENOVO</entry>
    <entry name='serial'/>
  </system>
  <memory_device><entry name='size'>16 GB</entry></memory_device>
  <memory_device><entry name='size'>16 GB</entry></memory_device>
</sysinfo>"#;

        let sysinfo: SysinfoDocument = from_xml(xml).unwrap();
        assert_eq!(sysinfo.bios.as_ref().unwrap().get("version"), Some("M1AKT52A"));
        assert_eq!(sysinfo.system.as_ref().unwrap().get("serial"), None);
        assert_eq!(sysinfo.memory_devices.len(), 2);
    }

    #[test]
    fn test_decode_net_device_ignores_nested_capability() {
        let xml = r#"
<device>
  <name>net_enp1s0_52_54_00_aa_bb_cc</name>
  <path>/sys/devices/pci0000:00/0000:00:02.0/net/enp1s0</path>
  <parent>pci_0000_00_02_0</parent>
  <capability type='net'>
    <interface>enp1s0</interface>
    <address>52:54:00:aa:bb:cc</address>
    <link speed='1000' state='up'/>
    <capability type='80203'/>
  </capability>
</device>"#;

        let device: NodeDeviceDocument = from_xml(xml).unwrap();
        let cap = &device.capabilities[0];
        assert_eq!(cap.cap_type, "net");
        assert_eq!(cap.interface.as_deref(), Some("enp1s0"));
        assert_eq!(cap.link.as_ref().unwrap().speed, Some(1000));
    }
}
