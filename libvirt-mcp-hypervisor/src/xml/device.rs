//! Standalone device descriptors for hot-plug.
//!
//! Each descriptor is self-contained: no PCI address is assigned, the
//! hypervisor places the device when it is attached.

use serde::{Deserialize, Serialize};

use super::{generate_mac_address, Element};
use crate::error::{HypervisorError, Result};

/// A device to generate, tagged by `device_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "device_type", rename_all = "lowercase")]
pub enum DeviceSpec {
    Disk(DiskDevice),
    Network(NetworkDevice),
    Usb(UsbDevice),
    Cdrom(CdromDevice),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskDevice {
    pub disk_path: String,
    pub target_dev: String,
    pub bus: String,
    /// Image format passed to the qemu driver
    pub format: String,
}

impl Default for DiskDevice {
    fn default() -> Self {
        Self {
            disk_path: "/var/lib/libvirt/images/new-disk.qcow2".to_string(),
            target_dev: "vdb".to_string(),
            bus: "virtio".to_string(),
            format: "qcow2".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkDevice {
    pub network_name: String,
    pub model: String,
    /// Generated when absent
    pub mac_address: Option<String>,
}

impl Default for NetworkDevice {
    fn default() -> Self {
        Self {
            network_name: "default".to_string(),
            model: "virtio".to_string(),
            mac_address: None,
        }
    }
}

/// Host USB device passthrough, matched by vendor and product id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbDevice {
    pub vendor_id: String,
    pub product_id: String,
}

impl Default for UsbDevice {
    fn default() -> Self {
        Self {
            vendor_id: "0x1234".to_string(),
            product_id: "0x5678".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdromDevice {
    pub iso_path: String,
    pub target_dev: String,
}

impl Default for CdromDevice {
    fn default() -> Self {
        Self {
            iso_path: "/var/lib/libvirt/images/cdrom.iso".to_string(),
            target_dev: "sdb".to_string(),
        }
    }
}

impl DeviceSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Disk(_) => "disk",
            Self::Network(_) => "network",
            Self::Usb(_) => "usb",
            Self::Cdrom(_) => "cdrom",
        }
    }

    /// Render the device descriptor.
    pub fn to_xml(&self) -> Result<String> {
        self.element()?.render()
    }

    fn element(&self) -> Result<Element> {
        let element = match self {
            Self::Disk(disk) => {
                require("disk_path", &disk.disk_path)?;
                require("target_dev", &disk.target_dev)?;
                Element::new("disk")
                    .attr("type", "file")
                    .attr("device", "disk")
                    .child(
                        Element::new("driver")
                            .attr("name", "qemu")
                            .attr("type", &disk.format),
                    )
                    .child(Element::new("source").attr("file", &disk.disk_path))
                    .child(
                        Element::new("target")
                            .attr("dev", &disk.target_dev)
                            .attr("bus", &disk.bus),
                    )
            }
            Self::Network(nic) => {
                require("network_name", &nic.network_name)?;
                let mac = nic.mac_address.clone().unwrap_or_else(generate_mac_address);
                Element::new("interface")
                    .attr("type", "network")
                    .child(Element::new("mac").attr("address", mac))
                    .child(Element::new("source").attr("network", &nic.network_name))
                    .child(Element::new("model").attr("type", &nic.model))
            }
            Self::Usb(usb) => {
                hex_id("vendor_id", &usb.vendor_id)?;
                hex_id("product_id", &usb.product_id)?;
                Element::new("hostdev")
                    .attr("mode", "subsystem")
                    .attr("type", "usb")
                    .attr("managed", "yes")
                    .child(
                        Element::new("source")
                            .child(Element::new("vendor").attr("id", &usb.vendor_id))
                            .child(Element::new("product").attr("id", &usb.product_id)),
                    )
            }
            Self::Cdrom(cdrom) => {
                require("iso_path", &cdrom.iso_path)?;
                require("target_dev", &cdrom.target_dev)?;
                Element::new("disk")
                    .attr("type", "file")
                    .attr("device", "cdrom")
                    .child(
                        Element::new("driver")
                            .attr("name", "qemu")
                            .attr("type", "raw"),
                    )
                    .child(Element::new("source").attr("file", &cdrom.iso_path))
                    .child(
                        Element::new("target")
                            .attr("dev", &cdrom.target_dev)
                            .attr("bus", "sata"),
                    )
                    .child(Element::new("readonly"))
            }
        };
        Ok(element)
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(HypervisorError::Operation(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn hex_id(field: &str, value: &str) -> Result<()> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    if digits.is_empty() || digits.len() > 4 || u16::from_str_radix(digits, 16).is_err() {
        return Err(HypervisorError::Operation(format!(
            "{} must be a 16-bit hexadecimal id, got '{}'",
            field, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::inspect;

    #[test]
    fn test_disk_defaults() {
        let xml = DeviceSpec::Disk(DiskDevice::default()).to_xml().unwrap();
        assert!(inspect::check_well_formed(&xml).is_ok());
        assert_eq!(
            inspect::disk_sources(&xml).unwrap(),
            vec!["/var/lib/libvirt/images/new-disk.qcow2"]
        );
        assert!(xml.contains("dev=\"vdb\""));
        assert!(xml.contains("bus=\"virtio\""));
    }

    #[test]
    fn test_network_generates_mac() {
        let xml = DeviceSpec::Network(NetworkDevice::default()).to_xml().unwrap();
        assert!(xml.contains("<mac address=\"52:54:00:"));
        assert!(xml.contains("network=\"default\""));
    }

    #[test]
    fn test_cdrom_is_readonly() {
        let xml = DeviceSpec::Cdrom(CdromDevice::default()).to_xml().unwrap();
        assert!(xml.contains("device=\"cdrom\""));
        assert!(xml.contains("<readonly/>"));
    }

    #[test]
    fn test_usb_ids_validated() {
        let xml = DeviceSpec::Usb(UsbDevice::default()).to_xml().unwrap();
        assert!(xml.contains("<vendor id=\"0x1234\"/>"));

        let bad = DeviceSpec::Usb(UsbDevice {
            vendor_id: "0xZZZZ".to_string(),
            ..Default::default()
        });
        assert!(bad.to_xml().is_err());
    }

    #[test]
    fn test_tagged_deserialization() {
        let spec: DeviceSpec = serde_json::from_value(serde_json::json!({
            "device_type": "disk",
            "disk_path": "/data/extra.qcow2",
        }))
        .unwrap();

        match spec {
            DeviceSpec::Disk(disk) => {
                assert_eq!(disk.disk_path, "/data/extra.qcow2");
                assert_eq!(disk.target_dev, "vdb");
            }
            other => panic!("unexpected device {:?}", other),
        }

        let unknown = serde_json::from_value::<DeviceSpec>(serde_json::json!({"device_type": "gpu"}));
        assert!(unknown.is_err());
    }
}
