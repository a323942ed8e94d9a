//! Descriptor generation and inspection.
//!
//! Generators build a small typed [`Element`] tree and serialize it with
//! quick-xml, which escapes every text and attribute value.

pub mod device;
pub mod domain;
pub mod inspect;

pub use device::{CdromDevice, DeviceSpec, DiskDevice, NetworkDevice, UsbDevice};
pub use domain::DomainXmlBuilder;
pub use inspect::check_well_formed;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::error::{HypervisorError, Result};

/// Locally administered MAC with the QEMU/KVM vendor prefix.
pub fn generate_mac_address() -> String {
    let bytes: [u8; 3] = rand::random();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

/// One node of a descriptor tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Element {
    name: &'static str,
    attrs: Vec<(&'static str, String)>,
    text: Option<String>,
    children: Vec<Element>,
}

impl Element {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            attrs: Vec::new(),
            text: None,
            children: Vec::new(),
        }
    }

    pub(crate) fn attr(mut self, key: &'static str, value: impl ToString) -> Self {
        self.attrs.push((key, value.to_string()));
        self
    }

    pub(crate) fn text(mut self, text: impl ToString) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub(crate) fn child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub(crate) fn children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.children.extend(children);
        self
    }

    /// Serialize with two-space indentation.
    pub(crate) fn render(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        self.write(&mut writer)
            .map_err(|e| HypervisorError::Operation(format!("Failed to write descriptor: {}", e)))?;
        String::from_utf8(writer.into_inner())
            .map_err(|e| HypervisorError::Operation(format!("Descriptor is not UTF-8: {}", e)))
    }

    fn write(&self, writer: &mut Writer<Vec<u8>>) -> quick_xml::Result<()> {
        let mut start = BytesStart::new(self.name);
        for (key, value) in &self.attrs {
            start.push_attribute((*key, value.as_str()));
        }

        if self.text.is_none() && self.children.is_empty() {
            return writer.write_event(Event::Empty(start));
        }

        writer.write_event(Event::Start(start))?;
        if let Some(text) = &self.text {
            writer.write_event(Event::Text(BytesText::new(text)))?;
        }
        for child in &self.children {
            child.write(writer)?;
        }
        writer.write_event(Event::End(BytesEnd::new(self.name)))
    }
}
