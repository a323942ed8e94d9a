//! Read-side helpers for descriptor text.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Check that `text` is one well-formed element tree.
///
/// Rejects empty input, stray text outside the root, more than one root
/// and unbalanced tags. Not a schema check.
pub fn check_well_formed(text: &str) -> Result<(), String> {
    let mut reader = Reader::from_str(text);
    reader.check_end_names(true);

    let mut depth: usize = 0;
    let mut seen_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => {
                if depth == 0 {
                    if seen_root {
                        return Err("multiple root elements".to_string());
                    }
                    seen_root = true;
                }
                depth += 1;
            }
            Ok(Event::End(_)) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| "unexpected closing tag".to_string())?;
            }
            Ok(Event::Empty(_)) => {
                if depth == 0 {
                    if seen_root {
                        return Err("multiple root elements".to_string());
                    }
                    seen_root = true;
                }
            }
            Ok(Event::Text(t)) => {
                if depth == 0 && !t.iter().all(|b| b.is_ascii_whitespace()) {
                    return Err("text outside of the root element".to_string());
                }
            }
            Ok(Event::CData(_)) => {
                if depth == 0 {
                    return Err("character data outside of the root element".to_string());
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(format!("at byte {}: {}", reader.buffer_position(), e)),
        }
    }

    if !seen_root {
        return Err("no root element".to_string());
    }
    if depth != 0 {
        return Err("unexpected end of document".to_string());
    }
    Ok(())
}

/// Text of the first `<name>` element directly under the root.
pub fn root_child_text(text: &str, name: &str) -> Result<Option<String>, String> {
    let mut reader = Reader::from_str(text);
    let mut depth: usize = 0;
    let mut capture = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                capture = depth == 2 && e.local_name().as_ref() == name.as_bytes();
            }
            Ok(Event::Text(t)) if capture => {
                let value = t.unescape().map_err(|e| e.to_string())?;
                return Ok(Some(value.trim().to_string()));
            }
            Ok(Event::End(_)) => {
                if capture {
                    return Ok(Some(String::new()));
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// Text of the first element reached by the exact element `path` from the root.
pub fn text_at_path(text: &str, path: &[&str]) -> Result<Option<String>, String> {
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<Vec<u8>> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(e.local_name().as_ref().to_vec()),
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                let on_path = stack.len() == path.len()
                    && stack.iter().zip(path).all(|(seg, want)| seg.as_slice() == want.as_bytes());
                if on_path {
                    let value = t.unescape().map_err(|e| e.to_string())?;
                    return Ok(Some(value.trim().to_string()));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// Value of `attr` on each `<child>` directly inside a matching `<parent>`.
///
/// `filter` restricts parents to those carrying the given attribute value,
/// e.g. `("device", "disk")`. Grandchildren are ignored so a disk's
/// backing chain does not leak into its sources.
pub fn child_attributes(
    text: &str,
    parent: &str,
    filter: Option<(&str, &str)>,
    child: &str,
    attr: &str,
) -> Result<Vec<String>, String> {
    let mut reader = Reader::from_str(text);
    let mut depth: usize = 0;
    let mut parent_depth: Option<usize> = None;
    let mut values = Vec::new();

    loop {
        let event = reader.read_event().map_err(|e| e.to_string())?;
        match event {
            Event::Start(e) => {
                depth += 1;
                visit(&e, depth, parent, filter, child, attr, &mut parent_depth, &mut values)?;
            }
            Event::Empty(e) => {
                visit(&e, depth + 1, parent, filter, child, attr, &mut parent_depth, &mut values)?;
                if parent_depth == Some(depth + 1) {
                    parent_depth = None;
                }
            }
            Event::End(_) => {
                if parent_depth == Some(depth) {
                    parent_depth = None;
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(values)
}

#[allow(clippy::too_many_arguments)]
fn visit(
    e: &BytesStart<'_>,
    depth: usize,
    parent: &str,
    filter: Option<(&str, &str)>,
    child: &str,
    attr: &str,
    parent_depth: &mut Option<usize>,
    values: &mut Vec<String>,
) -> Result<(), String> {
    let name = e.local_name();
    match *parent_depth {
        None if name.as_ref() == parent.as_bytes() => {
            let matches = match filter {
                Some((key, expected)) => attribute(e, key)?.as_deref() == Some(expected),
                None => true,
            };
            if matches {
                *parent_depth = Some(depth);
            }
        }
        Some(p) if depth == p + 1 && name.as_ref() == child.as_bytes() => {
            if let Some(value) = attribute(e, attr)? {
                values.push(value);
            }
        }
        _ => {}
    }
    Ok(())
}

fn attribute(e: &BytesStart<'_>, key: &str) -> Result<Option<String>, String> {
    match e.try_get_attribute(key).map_err(|err| err.to_string())? {
        Some(a) => {
            let value = a.unescape_value().map_err(|err| err.to_string())?;
            Ok(Some(value.into_owned()))
        }
        None => Ok(None),
    }
}

/// Source files of every `<disk device='disk'>`.
pub fn disk_sources(text: &str) -> Result<Vec<String>, String> {
    child_attributes(text, "disk", Some(("device", "disk")), "source", "file")
}

/// Target device names of every `<disk device='disk'>`.
pub fn disk_targets(text: &str) -> Result<Vec<String>, String> {
    child_attributes(text, "disk", Some(("device", "disk")), "target", "dev")
}

/// Target device names of every `<interface>`.
pub fn interface_targets(text: &str) -> Result<Vec<String>, String> {
    child_attributes(text, "interface", None, "target", "dev")
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE_XML: &str = r#"<domain type='kvm'>
  <name>web-01</name>
  <devices>
    <disk type='file' device='disk'>
      <source file='/var/lib/libvirt/images/web-01.qcow2'/>
      <backingStore type='file'>
        <source file='/var/lib/libvirt/images/base.qcow2'/>
      </backingStore>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <source file='/iso/install.iso'/>
      <target dev='sda' bus='sata'/>
    </disk>
    <disk type='file' device='disk'>
      <source file='/data/web-01-data.qcow2'/>
      <target dev='vdb' bus='virtio'/>
    </disk>
    <interface type='network'>
      <source network='default'/>
      <target dev='vnet0'/>
    </interface>
  </devices>
</domain>"#;

    #[test]
    fn test_well_formed() {
        assert!(check_well_formed("<disk type='file'><source file='/a'/></disk>").is_ok());
        assert!(check_well_formed("<?xml version='1.0'?>\n<domain/>\n").is_ok());
        assert!(check_well_formed("not xml").is_err());
        assert!(check_well_formed("").is_err());
        assert!(check_well_formed("<a><b></a>").is_err());
        assert!(check_well_formed("<a/><b/>").is_err());
        assert!(check_well_formed("<a>").is_err());
    }

    #[test]
    fn test_disk_sources_skip_cdrom_and_backing_chain() {
        let sources = disk_sources(LIVE_XML).unwrap();
        assert_eq!(
            sources,
            vec![
                "/var/lib/libvirt/images/web-01.qcow2".to_string(),
                "/data/web-01-data.qcow2".to_string(),
            ]
        );
    }

    #[test]
    fn test_targets() {
        assert_eq!(disk_targets(LIVE_XML).unwrap(), vec!["vda", "vdb"]);
        assert_eq!(interface_targets(LIVE_XML).unwrap(), vec!["vnet0"]);
    }

    #[test]
    fn test_root_child_text() {
        assert_eq!(root_child_text(LIVE_XML, "name").unwrap().as_deref(), Some("web-01"));
        assert_eq!(root_child_text(LIVE_XML, "uuid").unwrap(), None);
    }

    #[test]
    fn test_text_at_path() {
        let caps = "<capabilities><host><uuid>abc</uuid><cpu><arch>x86_64</arch><model>Icelake</model></cpu></host>\
            <guest><arch name='i686'/></guest></capabilities>";
        assert_eq!(
            text_at_path(caps, &["capabilities", "host", "cpu", "arch"]).unwrap().as_deref(),
            Some("x86_64")
        );
        assert_eq!(text_at_path(caps, &["capabilities", "host", "cpu", "vendor"]).unwrap(), None);
    }
}
