//! Domain configuration request and its ordered defaulting pass.
//!
//! A [`DomainSpec`] is what a caller asks for. [`DomainSpec::resolve`]
//! validates it and fills every optional field exactly once, in a fixed
//! order, producing a [`ResolvedSpec`] from which the descriptor is built.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::domain::*;
use super::{Flag, ScaledValue};
use crate::config::DomainDefaults;
use crate::error::{HypervisorError, Result};
use crate::media::CloudInitPayload;
use crate::types::{DiskBus, DiskFormat, NetworkMode};

/// IDE target of the installer CD-ROM.
pub const INSTALLER_ISO_TARGET: &str = "hdc";
/// IDE target of the configuration CD-ROM.
pub const CONFIG_ISO_TARGET: &str = "hdd";

const GUEST_AGENT_CHANNEL: &str = "org.qemu.guest_agent.0";

/// A virtual machine configuration request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainSpec {
    /// Domain name, unique on the host (required)
    pub name: String,
    /// Memory in MiB (required, > 0)
    pub memory_mib: u64,
    /// Number of virtual CPUs (required, > 0)
    pub vcpus: u32,
    /// Primary disk image (required)
    pub disk_path: String,
    pub disk_bus: Option<DiskBus>,
    pub disk_format: Option<DiskFormat>,
    pub network_mode: Option<NetworkMode>,
    /// Bridge, network or host interface name, depending on the mode
    pub network_source: Option<String>,
    pub mac_address: Option<String>,
    pub os_type: Option<String>,
    pub arch: Option<String>,
    pub machine: Option<String>,
    pub installer_iso: Option<String>,
    pub vnc_socket: Option<String>,
    /// Start right after definition, undefining again if start fails
    pub auto_start: bool,
    /// Rendered cloud-init documents to stage as a configuration ISO
    pub cloud_init: Option<CloudInitPayload>,
    /// Attach an emulated TPM 2.0
    pub tpm: bool,
    /// PCI devices to pass through, as `DDDD:BB:SS.F`
    pub host_devices: Vec<String>,
    /// Watchdog action (`reset`, `poweroff`, ...)
    pub watchdog: Option<String>,
    /// Add the QEMU guest agent channel
    pub guest_agent: bool,
}

/// A [`DomainSpec`] with every default applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSpec {
    pub name: String,
    pub memory_mib: u64,
    pub memory_kib: u64,
    pub vcpus: u32,
    pub disk_path: String,
    pub disk_bus: DiskBus,
    pub disk_format: DiskFormat,
    pub network_mode: NetworkMode,
    pub network_source: String,
    pub mac_address: Option<String>,
    pub os_type: String,
    pub arch: String,
    pub machine: Option<String>,
    pub installer_iso: Option<String>,
    pub vnc_socket: String,
    pub auto_start: bool,
    pub tpm: bool,
    pub host_devices: Vec<PciAddress>,
    pub watchdog: Option<String>,
    pub guest_agent: bool,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().map(|v| v.trim()).filter(|v| !v.is_empty()).map(String::from)
}

impl DomainSpec {
    /// Check the required fields.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.memory_mib == 0 {
            missing.push("memory_mib");
        }
        if self.vcpus == 0 {
            missing.push("vcpus");
        }
        if self.disk_path.trim().is_empty() {
            missing.push("disk_path");
        }
        if !missing.is_empty() {
            return Err(HypervisorError::InvalidConfig(format!(
                "domain spec is missing required fields: {}",
                missing.join(", ")
            )));
        }

        if self.name.contains('/') {
            return Err(HypervisorError::InvalidConfig(format!(
                "domain name '{}' must not contain '/'",
                self.name
            )));
        }
        Ok(())
    }

    /// Validate, then apply defaults in order: disk bus, network type,
    /// network source, OS type, architecture, VNC socket, disk format.
    pub fn resolve(&self, defaults: &DomainDefaults) -> Result<ResolvedSpec> {
        self.validate()?;

        let disk_bus = self.disk_bus.unwrap_or(DiskBus::Virtio);
        let network_mode = self.network_mode.unwrap_or(NetworkMode::Bridge);
        let network_source = match (non_empty(&self.network_source), network_mode) {
            (Some(source), _) => source,
            (None, NetworkMode::Bridge) => defaults.fallback_bridge.clone(),
            (None, NetworkMode::Network) => "default".to_string(),
            (None, NetworkMode::Direct) => {
                return Err(HypervisorError::InvalidConfig(
                    "direct networking needs a host interface as network_source".to_string(),
                ))
            }
        };
        let os_type = non_empty(&self.os_type).unwrap_or_else(|| "hvm".to_string());
        let arch = non_empty(&self.arch).unwrap_or_else(|| "x86_64".to_string());
        let vnc_socket = non_empty(&self.vnc_socket).unwrap_or_else(|| {
            format!("{}/{}.vnc", defaults.vnc_socket_dir.trim_end_matches('/'), self.name)
        });
        let disk_format = self.disk_format.unwrap_or(DiskFormat::Qcow2);
        let memory_kib = self.memory_mib.checked_mul(1024).ok_or_else(|| {
            HypervisorError::InvalidConfig(format!("memory_mib {} is too large", self.memory_mib))
        })?;

        let host_devices = self
            .host_devices
            .iter()
            .map(|a| a.parse())
            .collect::<Result<Vec<PciAddress>>>()?;

        Ok(ResolvedSpec {
            name: self.name.trim().to_string(),
            memory_mib: self.memory_mib,
            memory_kib,
            vcpus: self.vcpus,
            disk_path: self.disk_path.trim().to_string(),
            disk_bus,
            disk_format,
            network_mode,
            network_source,
            mac_address: non_empty(&self.mac_address),
            os_type,
            arch,
            machine: non_empty(&self.machine),
            installer_iso: non_empty(&self.installer_iso),
            vnc_socket,
            auto_start: self.auto_start,
            tpm: self.tpm,
            host_devices,
            watchdog: non_empty(&self.watchdog),
            guest_agent: self.guest_agent,
        })
    }
}

impl ResolvedSpec {
    /// Parent directory of the VNC socket.
    pub fn vnc_socket_dir(&self) -> &str {
        match self.vnc_socket.rsplit_once('/') {
            Some(("", _)) => "/",
            Some((dir, _)) => dir,
            None => ".",
        }
    }

    /// Build the domain document. `config_iso` is attached after the
    /// installer ISO when present and non-empty.
    pub fn build(&self, config_iso: Option<&str>) -> DomainDescriptor {
        let installer_iso = self.installer_iso.as_deref().filter(|p| !p.is_empty());
        let config_iso = config_iso.filter(|p| !p.is_empty());

        let mut boot = vec![BootDevice { dev: "hd".to_string() }];
        if installer_iso.is_some() {
            boot.push(BootDevice { dev: "cdrom".to_string() });
        }

        let mut devices = Devices {
            disks: vec![self.primary_disk()],
            controllers: vec![
                Controller {
                    controller_type: "usb".to_string(),
                    index: Some(0),
                    model: Some("qemu-xhci".to_string()),
                    address: None,
                },
                Controller {
                    controller_type: "pci".to_string(),
                    index: Some(0),
                    model: Some("pci-root".to_string()),
                    address: None,
                },
            ],
            interfaces: vec![self.interface()],
            serials: vec![CharDevice {
                char_type: "pty".to_string(),
                tty: None,
                source: None,
                target: Some(CharTarget { port: Some(0), ..Default::default() }),
                address: None,
            }],
            consoles: vec![CharDevice {
                char_type: "pty".to_string(),
                tty: None,
                source: None,
                target: Some(CharTarget {
                    target_type: Some("serial".to_string()),
                    port: Some(0),
                    ..Default::default()
                }),
                address: None,
            }],
            inputs: ["tablet:usb", "mouse:ps2", "keyboard:ps2"]
                .iter()
                .filter_map(|s| s.split_once(':'))
                .map(|(kind, bus)| Input {
                    input_type: kind.to_string(),
                    bus: Some(bus.to_string()),
                    address: None,
                })
                .collect(),
            graphics: vec![Graphics {
                graphics_type: "vnc".to_string(),
                socket: Some(self.vnc_socket.clone()),
                port: None,
                autoport: None,
                listens: vec![GraphicsListen {
                    listen_type: "socket".to_string(),
                    socket: Some(self.vnc_socket.clone()),
                    address: None,
                }],
            }],
            videos: vec![Video {
                model: VideoModel {
                    model_type: "virtio".to_string(),
                    heads: Some(1),
                    primary: Some("yes".to_string()),
                },
                address: None,
            }],
            memballoon: Some(MemBalloon { model: "virtio".to_string(), address: None }),
            rngs: vec![Rng {
                model: "virtio".to_string(),
                backend: RngBackend {
                    model: "random".to_string(),
                    source: "/dev/urandom".to_string(),
                },
                address: None,
            }],
            ..Default::default()
        };

        if let Some(iso) = installer_iso {
            devices.disks.push(Disk::cdrom(iso, INSTALLER_ISO_TARGET));
        }
        if let Some(iso) = config_iso {
            devices.disks.push(Disk::cdrom(iso, CONFIG_ISO_TARGET));
        }

        if self.guest_agent {
            devices.channels.push(CharDevice {
                char_type: "unix".to_string(),
                tty: None,
                source: None,
                target: Some(CharTarget {
                    target_type: Some("virtio".to_string()),
                    name: Some(GUEST_AGENT_CHANNEL.to_string()),
                    ..Default::default()
                }),
                address: None,
            });
        }
        if let Some(action) = &self.watchdog {
            devices.watchdogs.push(Watchdog {
                model: "i6300esb".to_string(),
                action: Some(action.clone()),
            });
        }
        if self.tpm {
            devices.tpms.push(Tpm {
                model: Some("tpm-crb".to_string()),
                backend: TpmBackend {
                    backend_type: "emulator".to_string(),
                    version: Some("2.0".to_string()),
                },
            });
        }
        for address in &self.host_devices {
            devices.hostdevs.push(HostDev {
                mode: "subsystem".to_string(),
                hostdev_type: "pci".to_string(),
                managed: Some("yes".to_string()),
                source: HostDevSource { address: Some(address.to_device_address()) },
                address: None,
            });
        }

        DomainDescriptor {
            domain_type: "kvm".to_string(),
            name: self.name.clone(),
            uuid: None,
            description: None,
            memory: ScaledValue::kib(self.memory_kib),
            current_memory: Some(ScaledValue::kib(self.memory_kib)),
            vcpu: Vcpu { placement: Some("static".to_string()), count: self.vcpus },
            os: Os {
                loader: None,
                nvram: None,
                os_type: OsType {
                    arch: Some(self.arch.clone()),
                    machine: self.machine.clone(),
                    value: self.os_type.clone(),
                },
                boot,
            },
            features: Some(Features {
                acpi: Some(Flag {}),
                apic: Some(Flag {}),
                pae: None,
            }),
            cpu: Some(Cpu {
                mode: Some("host-passthrough".to_string()),
                check: Some("none".to_string()),
                topology: None,
            }),
            clock: Some(Clock {
                offset: "utc".to_string(),
                timers: vec![Timer {
                    name: "rtc".to_string(),
                    tickpolicy: Some("catchup".to_string()),
                    present: None,
                }],
            }),
            on_poweroff: Some("destroy".to_string()),
            on_reboot: Some("restart".to_string()),
            on_crash: Some("destroy".to_string()),
            devices,
        }
    }

    fn primary_disk(&self) -> Disk {
        let target = format!("{}a", self.disk_bus.device_prefix());
        let mut disk = Disk::file(&self.disk_path, &target, self.disk_format);
        disk.target.bus = Some(self.disk_bus.as_str().to_string());
        disk
    }

    fn interface(&self) -> Interface {
        let source = match self.network_mode {
            NetworkMode::Bridge => InterfaceSource {
                bridge: Some(self.network_source.clone()),
                ..Default::default()
            },
            NetworkMode::Network => InterfaceSource {
                network: Some(self.network_source.clone()),
                ..Default::default()
            },
            NetworkMode::Direct => InterfaceSource {
                dev: Some(self.network_source.clone()),
                mode: Some("bridge".to_string()),
                ..Default::default()
            },
        };

        Interface {
            interface_type: self.network_mode.as_str().to_string(),
            mac: self.mac_address.clone().map(|address| MacAddress { address }),
            source: Some(source),
            target: None,
            model: Some(DeviceModel { model_type: "virtio".to_string() }),
            address: None,
        }
    }
}

/// Host PCI address `DDDD:BB:SS.F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl PciAddress {
    pub fn to_device_address(&self) -> DeviceAddress {
        DeviceAddress {
            domain: Some(format!("0x{:04x}", self.domain)),
            bus: Some(format!("0x{:02x}", self.bus)),
            slot: Some(format!("0x{:02x}", self.slot)),
            function: Some(format!("0x{:x}", self.function)),
            ..Default::default()
        }
    }
}

impl FromStr for PciAddress {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || HypervisorError::InvalidConfig(format!("invalid PCI address '{}'", s));

        // Domain is optional: `01:00.0` means `0000:01:00.0`.
        let (domain, rest) = match s.matches(':').count() {
            2 => s.split_once(':').ok_or_else(invalid)?,
            1 => ("0", s),
            _ => return Err(invalid()),
        };
        let (bus, rest) = rest.split_once(':').ok_or_else(invalid)?;
        let (slot, function) = rest.split_once('.').ok_or_else(invalid)?;

        let function = u8::from_str_radix(function, 16).map_err(|_| invalid())?;
        if function > 7 {
            return Err(invalid());
        }

        Ok(Self {
            domain: u16::from_str_radix(domain, 16).map_err(|_| invalid())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| invalid())?,
            slot: u8::from_str_radix(slot, 16).map_err(|_| invalid())?,
            function,
        })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:02x}:{:02x}.{:x}", self.domain, self.bus, self.slot, self.function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{from_xml, to_xml};

    fn spec(name: &str) -> DomainSpec {
        DomainSpec {
            name: name.to_string(),
            memory_mib: 2048,
            vcpus: 2,
            disk_path: format!("/var/lib/libvirt/images/{}.qcow2", name),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_required_fields() {
        let err = DomainSpec::default().resolve(&DomainDefaults::default()).unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, HypervisorError::InvalidConfig(_)));
        for field in ["name", "memory_mib", "vcpus", "disk_path"] {
            assert!(message.contains(field), "{message}");
        }
    }

    #[test]
    fn test_defaults_applied() {
        let resolved = spec("web-1").resolve(&DomainDefaults::default()).unwrap();

        assert_eq!(resolved.disk_bus, DiskBus::Virtio);
        assert_eq!(resolved.network_mode, NetworkMode::Bridge);
        assert_eq!(resolved.network_source, "virbr0");
        assert_eq!(resolved.os_type, "hvm");
        assert_eq!(resolved.arch, "x86_64");
        assert_eq!(resolved.vnc_socket, "/var/lib/libvirt/qemu/vnc/web-1.vnc");
        assert_eq!(resolved.vnc_socket_dir(), "/var/lib/libvirt/qemu/vnc");
        assert_eq!(resolved.disk_format, DiskFormat::Qcow2);
    }

    #[test]
    fn test_explicit_values_win() {
        let mut request = spec("db-1");
        request.disk_bus = Some(DiskBus::Sata);
        request.network_mode = Some(NetworkMode::Network);
        request.network_source = Some("internal".to_string());
        request.vnc_socket = Some("/run/vnc/db.sock".to_string());

        let resolved = request.resolve(&DomainDefaults::default()).unwrap();
        let domain = resolved.build(None);

        assert_eq!(domain.devices.disks[0].target.dev, "sda");
        assert_eq!(domain.devices.disks[0].target.bus.as_deref(), Some("sata"));
        assert_eq!(domain.devices.interfaces[0].interface_type, "network");
        assert_eq!(
            domain.devices.interfaces[0].source.as_ref().unwrap().network.as_deref(),
            Some("internal")
        );
        assert_eq!(domain.vnc_socket(), Some("/run/vnc/db.sock"));
    }

    #[test]
    fn test_oversized_memory_is_rejected() {
        let mut request = spec("huge-1");
        request.memory_mib = u64::MAX / 512;

        let err = request.resolve(&DomainDefaults::default()).unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidConfig(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_direct_mode_needs_source() {
        let mut request = spec("edge-1");
        request.network_mode = Some(NetworkMode::Direct);
        assert!(request.resolve(&DomainDefaults::default()).is_err());
    }

    #[test]
    fn test_mandatory_devices() {
        let domain = spec("web-1").resolve(&DomainDefaults::default()).unwrap().build(None);
        let devices = &domain.devices;

        assert_eq!(domain.memory, ScaledValue::kib(2048 * 1024));
        assert_eq!(devices.disks.len(), 1);
        assert_eq!(devices.disks[0].target.dev, "vda");
        assert_eq!(devices.interfaces.len(), 1);
        assert_eq!(devices.graphics[0].graphics_type, "vnc");
        assert!(devices.graphics[0].port.is_none());
        assert_eq!(devices.serials.len(), 1);
        assert_eq!(
            devices.consoles[0].target.as_ref().unwrap().target_type.as_deref(),
            Some("serial")
        );
        let controllers: Vec<_> = devices
            .controllers
            .iter()
            .map(|c| (c.controller_type.as_str(), c.model.as_deref()))
            .collect();
        assert_eq!(controllers, vec![("usb", Some("qemu-xhci")), ("pci", Some("pci-root"))]);
        assert_eq!(devices.videos[0].model.model_type, "virtio");
        let inputs: Vec<_> = devices.inputs.iter().map(|i| i.input_type.as_str()).collect();
        assert_eq!(inputs, vec!["tablet", "mouse", "keyboard"]);
        assert_eq!(devices.memballoon.as_ref().unwrap().model, "virtio");
        assert_eq!(devices.rngs[0].backend.source, "/dev/urandom");
        assert!(devices.tpms.is_empty());
        assert!(devices.hostdevs.is_empty());
        assert!(devices.channels.is_empty());
    }

    #[test]
    fn test_iso_cdroms_in_order() {
        let mut request = spec("web-1");
        request.installer_iso = Some("/isos/ubuntu.iso".to_string());
        let domain = request
            .resolve(&DomainDefaults::default())
            .unwrap()
            .build(Some("/var/lib/libvirt/images/cloudinit/web-1.iso"));

        let cdroms: Vec<_> = domain
            .devices
            .disks
            .iter()
            .filter(|d| d.is_cdrom())
            .map(|d| (d.target.dev.as_str(), d.source_path()))
            .collect();
        assert_eq!(
            cdroms,
            vec![
                (INSTALLER_ISO_TARGET, Some("/isos/ubuntu.iso")),
                (CONFIG_ISO_TARGET, Some("/var/lib/libvirt/images/cloudinit/web-1.iso")),
            ]
        );
    }

    #[test]
    fn test_empty_iso_paths_are_skipped() {
        let mut request = spec("web-1");
        request.installer_iso = Some(String::new());
        let domain = request.resolve(&DomainDefaults::default()).unwrap().build(Some(""));
        assert!(domain.devices.disks.iter().all(|d| !d.is_cdrom()));
    }

    #[test]
    fn test_optional_devices() {
        let mut request = spec("gpu-1");
        request.tpm = true;
        request.guest_agent = true;
        request.watchdog = Some("reset".to_string());
        request.host_devices = vec!["0000:41:00.0".to_string()];

        let domain = request.resolve(&DomainDefaults::default()).unwrap().build(None);
        let devices = &domain.devices;

        assert_eq!(devices.tpms[0].backend.version.as_deref(), Some("2.0"));
        assert_eq!(
            devices.channels[0].target.as_ref().unwrap().name.as_deref(),
            Some("org.qemu.guest_agent.0")
        );
        assert_eq!(devices.watchdogs[0].action.as_deref(), Some("reset"));
        let source = devices.hostdevs[0].source.address.as_ref().unwrap();
        assert_eq!(source.bus.as_deref(), Some("0x41"));
        assert_eq!(source.function.as_deref(), Some("0x0"));
    }

    #[test]
    fn test_defaulting_is_deterministic() {
        let defaults = DomainDefaults::default();
        let first = to_xml(&spec("web-1").resolve(&defaults).unwrap().build(None)).unwrap();
        let second = to_xml(&spec("web-1").resolve(&defaults).unwrap().build(None)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_built_document_round_trips() {
        let mut request = spec("web-1");
        request.installer_iso = Some("/isos/debian.iso".to_string());
        request.tpm = true;
        let domain = request.resolve(&DomainDefaults::default()).unwrap().build(Some("/iso/ci.iso"));

        let decoded: DomainDescriptor = from_xml(&to_xml(&domain).unwrap()).unwrap();
        assert_eq!(decoded, domain);
    }

    #[test]
    fn test_pci_address_parsing() {
        let address: PciAddress = "0000:3b:00.1".parse().unwrap();
        assert_eq!(address, PciAddress { domain: 0, bus: 0x3b, slot: 0, function: 1 });
        assert_eq!(address.to_string(), "0000:3b:00.1");

        let short: PciAddress = "01:00.0".parse().unwrap();
        assert_eq!(short.bus, 1);

        assert!("0000:3b:00".parse::<PciAddress>().is_err());
        assert!("0000:3b:00.9".parse::<PciAddress>().is_err());
        assert!("zz:00.0".parse::<PciAddress>().is_err());
    }
}
