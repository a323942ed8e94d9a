//! Domain descriptor generation.
//!
//! The builder lays out a q35 machine: a PCIe root with three root ports,
//! one port each for the system disk, the network interface and the USB
//! controller. Chipset devices (video, sound, SATA, balloon) sit directly
//! on the root bus at fixed slots.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use uuid::Uuid;

use super::{generate_mac_address, Element};
use crate::error::{HypervisorError, Result};
use crate::types::{BootDevice, DomainCreateParams};

const EMULATOR: &str = "/usr/bin/qemu-system-x86_64";
const MACHINE_TYPE: &str = "pc-q35-6.2";

const DISK_PORT_BUS: u8 = 0x01;
const NIC_PORT_BUS: u8 = 0x02;
const USB_PORT_BUS: u8 = 0x03;

/// PCI address tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl PciAddress {
    const fn new(bus: u8, slot: u8, function: u8) -> Self {
        Self { domain: 0, bus, slot, function }
    }

    fn element(&self) -> Element {
        Element::new("address")
            .attr("type", "pci")
            .attr("domain", format!("0x{:04x}", self.domain))
            .attr("bus", format!("0x{:02x}", self.bus))
            .attr("slot", format!("0x{:02x}", self.slot))
            .attr("function", format!("0x{:x}", self.function))
    }
}

/// Where a device attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Address {
    Pci(PciAddress),
    /// Slot on a SATA controller
    Drive { controller: u32, unit: u32 },
    /// Port on a USB controller
    Usb { bus: u32, port: u32 },
    /// Implicit platform bus (PS/2, ISA serial)
    None,
}

impl Address {
    fn element(&self) -> Option<Element> {
        match self {
            Self::Pci(pci) => Some(pci.element()),
            Self::Drive { controller, unit } => Some(
                Element::new("address")
                    .attr("type", "drive")
                    .attr("controller", controller)
                    .attr("bus", 0)
                    .attr("target", 0)
                    .attr("unit", unit),
            ),
            Self::Usb { bus, port } => Some(
                Element::new("address")
                    .attr("type", "usb")
                    .attr("bus", bus)
                    .attr("port", port),
            ),
            Self::None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerKind {
    PcieRoot,
    PcieRootPort { chassis: u32, port: u32 },
    Usb,
    Sata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Controller {
    kind: ControllerKind,
    index: u32,
    address: Option<PciAddress>,
}

impl Controller {
    fn element(&self) -> Element {
        let base = Element::new("controller");
        let el = match self.kind {
            ControllerKind::PcieRoot => base
                .attr("type", "pci")
                .attr("index", self.index)
                .attr("model", "pcie-root"),
            ControllerKind::PcieRootPort { chassis, port } => base
                .attr("type", "pci")
                .attr("index", self.index)
                .attr("model", "pcie-root-port")
                .child(Element::new("model").attr("name", "pcie-root-port"))
                .child(
                    Element::new("target")
                        .attr("chassis", chassis)
                        .attr("port", format!("0x{:x}", port)),
                ),
            ControllerKind::Usb => base
                .attr("type", "usb")
                .attr("index", self.index)
                .attr("model", "qemu-xhci")
                .attr("ports", 15),
            ControllerKind::Sata => base.attr("type", "sata").attr("index", self.index),
        };
        match self.address {
            Some(addr) => el.child(addr.element()),
            None => el,
        }
    }

    fn is_pci_bus(&self) -> bool {
        matches!(self.kind, ControllerKind::PcieRoot | ControllerKind::PcieRootPort { .. })
    }
}

/// A device with its attachment point, rendered last.
#[derive(Debug, Clone)]
struct Device {
    body: Element,
    address: Address,
}

impl Device {
    fn new(body: Element, address: Address) -> Self {
        Self { body, address }
    }

    fn element(&self) -> Element {
        match self.address.element() {
            Some(addr) => self.body.clone().child(addr),
            None => self.body.clone(),
        }
    }
}

/// Builder for libvirt domain XML.
pub struct DomainXmlBuilder<'a> {
    params: &'a DomainCreateParams,
    images_dir: &'a Path,
    uuid: String,
    mac_address: String,
}

impl<'a> DomainXmlBuilder<'a> {
    /// Create a builder. UUID and MAC are drawn fresh for each builder.
    pub fn new(params: &'a DomainCreateParams, images_dir: &'a Path) -> Self {
        Self {
            params,
            images_dir,
            uuid: Uuid::new_v4().to_string(),
            mac_address: generate_mac_address(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Validate parameters and topology, then render the descriptor.
    pub fn build(&self) -> Result<String> {
        self.params.validate()?;

        let controllers = self.build_controllers();
        let devices = self.build_devices();
        validate_topology(&controllers, &devices)?;

        let p = self.params;
        Element::new("domain")
            .attr("type", "kvm")
            .child(Element::new("name").text(&p.name))
            .child(Element::new("uuid").text(&self.uuid))
            .child(Element::new("memory").attr("unit", "KiB").text(p.memory))
            .child(Element::new("currentMemory").attr("unit", "KiB").text(p.memory))
            .child(Element::new("vcpu").attr("placement", "static").text(p.vcpus))
            .child(self.build_os())
            .child(
                Element::new("features")
                    .child(Element::new("acpi"))
                    .child(Element::new("apic"))
                    .child(Element::new("vmport").attr("state", "off")),
            )
            .child(
                Element::new("cpu")
                    .attr("mode", "host-passthrough")
                    .attr("check", "none")
                    .attr("migratable", "on"),
            )
            .child(
                Element::new("clock")
                    .attr("offset", "utc")
                    .child(Element::new("timer").attr("name", "rtc").attr("tickpolicy", "catchup"))
                    .child(Element::new("timer").attr("name", "pit").attr("tickpolicy", "delay"))
                    .child(Element::new("timer").attr("name", "hpet").attr("present", "no")),
            )
            .child(Element::new("on_poweroff").text("destroy"))
            .child(Element::new("on_reboot").text("restart"))
            .child(Element::new("on_crash").text("destroy"))
            .child(
                Element::new("pm")
                    .child(Element::new("suspend-to-mem").attr("enabled", "no"))
                    .child(Element::new("suspend-to-disk").attr("enabled", "no")),
            )
            .child(
                Element::new("devices")
                    .child(Element::new("emulator").text(EMULATOR))
                    .children(controllers.iter().map(Controller::element))
                    .children(devices.iter().map(Device::element)),
            )
            .render()
    }

    /// Boot order: cdrom first only when an ISO is attached and the
    /// requested device is the default disk.
    pub fn boot_order(&self) -> Vec<BootDevice> {
        let p = self.params;
        if p.cdrom_path.is_some() && p.boot_device == BootDevice::Hd {
            vec![BootDevice::Cdrom, BootDevice::Hd]
        } else {
            vec![p.boot_device]
        }
    }

    /// Source of the system disk.
    pub fn disk_path(&self) -> String {
        match &self.params.disk_path {
            Some(path) => path.clone(),
            None => self
                .images_dir
                .join(format!("{}.qcow2", self.params.name))
                .to_string_lossy()
                .into_owned(),
        }
    }

    fn build_os(&self) -> Element {
        let p = self.params;
        Element::new("os")
            .child(
                Element::new("type")
                    .attr("arch", &p.arch)
                    .attr("machine", MACHINE_TYPE)
                    .text(&p.os_type),
            )
            .children(
                self.boot_order()
                    .into_iter()
                    .map(|dev| Element::new("boot").attr("dev", dev.as_str())),
            )
    }

    fn build_controllers(&self) -> Vec<Controller> {
        let mut controllers = vec![Controller {
            kind: ControllerKind::PcieRoot,
            index: 0,
            address: None,
        }];

        for (index, slot) in [(1u32, 0x02u8), (2, 0x03), (3, 0x04)] {
            controllers.push(Controller {
                kind: ControllerKind::PcieRootPort {
                    chassis: index,
                    port: 0x10 + index - 1,
                },
                index,
                address: Some(PciAddress::new(0x00, slot, 0x0)),
            });
        }

        controllers.push(Controller {
            kind: ControllerKind::Usb,
            index: 0,
            address: Some(PciAddress::new(USB_PORT_BUS, 0x00, 0x0)),
        });

        if self.params.cdrom_path.is_some() {
            controllers.push(Controller {
                kind: ControllerKind::Sata,
                index: 0,
                address: Some(PciAddress::new(0x00, 0x1f, 0x2)),
            });
        }

        controllers
    }

    fn build_devices(&self) -> Vec<Device> {
        let p = self.params;
        let mut devices = vec![Device::new(
            Element::new("disk")
                .attr("type", "file")
                .attr("device", "disk")
                .child(Element::new("driver").attr("name", "qemu").attr("type", "qcow2"))
                .child(Element::new("source").attr("file", self.disk_path()))
                .child(Element::new("target").attr("dev", "vda").attr("bus", "virtio")),
            Address::Pci(PciAddress::new(DISK_PORT_BUS, 0x00, 0x0)),
        )];

        if let Some(iso) = &p.cdrom_path {
            devices.push(Device::new(
                Element::new("disk")
                    .attr("type", "file")
                    .attr("device", "cdrom")
                    .child(Element::new("driver").attr("name", "qemu").attr("type", "raw"))
                    .child(Element::new("source").attr("file", iso))
                    .child(Element::new("target").attr("dev", "sda").attr("bus", "sata"))
                    .child(Element::new("readonly")),
                Address::Drive { controller: 0, unit: 0 },
            ));
        }

        devices.push(Device::new(
            Element::new("interface")
                .attr("type", "network")
                .child(Element::new("mac").attr("address", &self.mac_address))
                .child(Element::new("source").attr("network", &p.network))
                .child(Element::new("model").attr("type", "virtio")),
            Address::Pci(PciAddress::new(NIC_PORT_BUS, 0x00, 0x0)),
        ));

        devices.push(Device::new(
            Element::new("serial").attr("type", "pty").child(
                Element::new("target")
                    .attr("type", "isa-serial")
                    .attr("port", 0)
                    .child(Element::new("model").attr("name", "isa-serial")),
            ),
            Address::None,
        ));
        devices.push(Device::new(
            Element::new("console")
                .attr("type", "pty")
                .child(Element::new("target").attr("type", "serial").attr("port", 0)),
            Address::None,
        ));

        devices.push(Device::new(
            Element::new("input").attr("type", "tablet").attr("bus", "usb"),
            Address::Usb { bus: 0, port: 1 },
        ));
        devices.push(Device::new(
            Element::new("input").attr("type", "mouse").attr("bus", "ps2"),
            Address::None,
        ));
        devices.push(Device::new(
            Element::new("input").attr("type", "keyboard").attr("bus", "ps2"),
            Address::None,
        ));

        devices.push(Device::new(
            Element::new("graphics")
                .attr("type", "vnc")
                .attr("port", -1)
                .attr("autoport", "yes")
                .child(Element::new("listen").attr("type", "address")),
            Address::None,
        ));

        devices.push(Device::new(
            Element::new("sound").attr("model", "ich9"),
            Address::Pci(PciAddress::new(0x00, 0x1b, 0x0)),
        ));

        devices.push(Device::new(
            Element::new("video").child(
                Element::new("model")
                    .attr("type", "qxl")
                    .attr("ram", 65536)
                    .attr("vram", 65536)
                    .attr("vgamem", 16384)
                    .attr("heads", 1)
                    .attr("primary", "yes"),
            ),
            Address::Pci(PciAddress::new(0x00, 0x01, 0x0)),
        ));

        devices.push(Device::new(
            Element::new("memballoon").attr("model", "virtio"),
            Address::Pci(PciAddress::new(0x00, 0x05, 0x0)),
        ));

        devices
    }
}

/// Every PCI tuple is unique and every referenced bus or controller exists.
fn validate_topology(controllers: &[Controller], devices: &[Device]) -> Result<()> {
    let pci_buses: BTreeSet<u32> = controllers
        .iter()
        .filter(|c| c.is_pci_bus())
        .map(|c| c.index)
        .collect();
    let has = |kind: fn(&ControllerKind) -> bool, index: u32| {
        controllers.iter().any(|c| kind(&c.kind) && c.index == index)
    };

    let mut used: HashSet<PciAddress> = HashSet::new();
    let mut claim = |addr: PciAddress| -> Result<()> {
        if !pci_buses.contains(&u32::from(addr.bus)) {
            return Err(topology_error(format!("no PCI controller for bus 0x{:02x}", addr.bus)));
        }
        if !used.insert(addr) {
            return Err(topology_error(format!(
                "PCI address {:02x}:{:02x}.{:x} assigned twice",
                addr.bus, addr.slot, addr.function
            )));
        }
        Ok(())
    };

    for addr in controllers.iter().filter_map(|c| c.address) {
        claim(addr)?;
    }

    for device in devices {
        match device.address {
            Address::Pci(addr) => claim(addr)?,
            Address::Drive { controller, .. } => {
                if !has(|k| matches!(k, ControllerKind::Sata), controller) {
                    return Err(topology_error(format!("no SATA controller {}", controller)));
                }
            }
            Address::Usb { bus, .. } => {
                if !has(|k| matches!(k, ControllerKind::Usb), bus) {
                    return Err(topology_error(format!("no USB controller {}", bus)));
                }
            }
            Address::None => {}
        }
    }

    Ok(())
}

fn topology_error(reason: String) -> HypervisorError {
    HypervisorError::Operation(format!("Invalid device topology: {}", reason))
}
