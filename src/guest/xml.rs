//! Domain-XML views.
//!
//! The definition is opaque to the agent except for a handful of
//! sub-trees: disk sources and drivers, interface targets, and the
//! vcpu/memory ability values. Everything here is stream-based; the
//! patched document keeps all elements the agent does not understand.

use std::io::Cursor;

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::errors::{AgentError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskXml {
    pub target_dev: Option<String>,
    pub driver_type: Option<String>,
    pub source_file: Option<String>,
    /// Network disks: `<volume>/<path>` for gluster, pool/image for rbd.
    pub source_name: Option<String>,
    pub source_protocol: Option<String>,
    pub source_host: Option<String>,
}

impl DiskXml {
    /// Whichever of file/name the source carries.
    pub fn source_path(&self) -> Option<&str> {
        self.source_file.as_deref().or(self.source_name.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceXml {
    pub target_dev: Option<String>,
    pub alias_name: Option<String>,
    pub mac: Option<String>,
}

fn attr(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn xml_err(e: quick_xml::Error) -> AgentError {
    AgentError::InvalidMessage(format!("domain xml: {e}"))
}

/// All `devices/disk` entries.
pub fn disks(xml: &str) -> Result<Vec<DiskXml>> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();
    let mut disks = Vec::new();
    let mut current: Option<DiskXml> = None;
    let mut in_source = false;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == "disk" && stack.last().map(String::as_str) == Some("devices") {
                    current = Some(DiskXml::default());
                } else if let Some(disk) = current.as_mut() {
                    fill_disk_field(disk, &name, &e, in_source);
                    if name == "source" {
                        in_source = true;
                    }
                }
                stack.push(name);
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if let Some(disk) = current.as_mut() {
                    fill_disk_field(disk, &name, &e, in_source);
                }
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == "source" {
                    in_source = false;
                }
                if name == "disk" {
                    if let Some(disk) = current.take() {
                        disks.push(disk);
                    }
                }
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(disks)
}

fn fill_disk_field(disk: &mut DiskXml, name: &str, e: &BytesStart<'_>, in_source: bool) {
    match name {
        "driver" => disk.driver_type = attr(e, "type"),
        "source" => {
            disk.source_file = attr(e, "file");
            disk.source_name = attr(e, "name");
            disk.source_protocol = attr(e, "protocol");
        }
        "target" => disk.target_dev = attr(e, "dev"),
        "host" if in_source => disk.source_host = attr(e, "name"),
        _ => {}
    }
}

/// The `vda` entry is the system image by convention.
pub fn system_disk(xml: &str) -> Result<DiskXml> {
    disks(xml)?
        .into_iter()
        .find(|d| d.target_dev.as_deref() == Some("vda"))
        .ok_or_else(|| AgentError::InvalidMessage("definition has no vda disk".into()))
}

/// All `devices/interface` entries.
pub fn interfaces(xml: &str) -> Result<Vec<InterfaceXml>> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<String> = Vec::new();
    let mut out = Vec::new();
    let mut current: Option<InterfaceXml> = None;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == "interface" && stack.last().map(String::as_str) == Some("devices") {
                    current = Some(InterfaceXml::default());
                } else if let Some(iface) = current.as_mut() {
                    fill_iface_field(iface, &name, &e);
                }
                stack.push(name);
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if let Some(iface) = current.as_mut() {
                    fill_iface_field(iface, &name, &e);
                }
            }
            Event::End(e) => {
                if e.name().as_ref() == b"interface" {
                    if let Some(iface) = current.take() {
                        out.push(iface);
                    }
                }
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

fn fill_iface_field(iface: &mut InterfaceXml, name: &str, e: &BytesStart<'_>) {
    match name {
        "target" => iface.target_dev = attr(e, "dev"),
        "alias" => iface.alias_name = attr(e, "name"),
        "mac" => iface.mac = attr(e, "address"),
        _ => {}
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ability {
    pub vcpu: String,
    pub memory: String,
    pub memory_unit: Option<String>,
}

/// Current vcpu/memory values, for change logging.
pub fn ability(xml: &str) -> Result<Ability> {
    let mut reader = Reader::from_str(xml);
    let mut depth = 0usize;
    let mut capture: Option<&'static str> = None;
    let mut vcpu = None;
    let mut memory = None;
    let mut memory_unit = None;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                depth += 1;
                // Only the domain's direct children, not a nested numa cell.
                if depth == 2 {
                    match e.name().as_ref() {
                        b"vcpu" => capture = Some("vcpu"),
                        b"memory" => {
                            capture = Some("memory");
                            memory_unit = attr(&e, "unit");
                        }
                        _ => capture = None,
                    }
                } else {
                    capture = None;
                }
            }
            Event::Text(t) => {
                if let Some(which) = capture {
                    let text = t.unescape().map_err(xml_err)?.into_owned();
                    match which {
                        "vcpu" => vcpu = Some(text),
                        "memory" => memory = Some(text),
                        _ => {}
                    }
                }
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                capture = None;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(Ability {
        vcpu: vcpu.ok_or_else(|| AgentError::InvalidMessage("definition has no vcpu".into()))?,
        memory: memory
            .ok_or_else(|| AgentError::InvalidMessage("definition has no memory".into()))?,
        memory_unit,
    })
}

/// Rewrite vcpu/memory/currentMemory in place; memory elements get
/// `unit="GiB"`. Everything else passes through untouched.
pub fn patch_ability(xml: &str, cpu: u32, memory_gib: u64) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut depth = 0usize;
    let mut replace_text: Option<String> = None;

    loop {
        let event = reader.read_event().map_err(xml_err)?;
        match event {
            Event::Start(e) => {
                depth += 1;
                let name = e.name().as_ref().to_vec();
                if depth == 2 && (name == b"memory" || name == b"currentMemory") {
                    let mut elem =
                        BytesStart::new(String::from_utf8_lossy(&name).into_owned());
                    for a in e.attributes() {
                        let a = a.map_err(|e| {
                            AgentError::InvalidMessage(format!("domain xml: {e}"))
                        })?;
                        if a.key.as_ref() != b"unit" {
                            elem.push_attribute(a);
                        }
                    }
                    elem.push_attribute(("unit", "GiB"));
                    writer.write_event(Event::Start(elem)).map_err(xml_err)?;
                    replace_text = Some(memory_gib.to_string());
                } else if depth == 2 && name == b"vcpu" {
                    writer
                        .write_event(Event::Start(e.to_owned()))
                        .map_err(xml_err)?;
                    replace_text = Some(cpu.to_string());
                } else {
                    writer
                        .write_event(Event::Start(e.to_owned()))
                        .map_err(xml_err)?;
                }
            }
            Event::Text(t) => {
                if let Some(text) = replace_text.take() {
                    writer
                        .write_event(Event::Text(BytesText::new(&text)))
                        .map_err(xml_err)?;
                } else {
                    writer.write_event(Event::Text(t)).map_err(xml_err)?;
                }
            }
            Event::End(e) => {
                depth = depth.saturating_sub(1);
                replace_text = None;
                writer.write_event(Event::End(e)).map_err(xml_err)?;
            }
            Event::Eof => break,
            other => {
                writer.write_event(other).map_err(xml_err)?;
            }
        }
    }

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes)
        .map_err(|e| AgentError::InvalidMessage(format!("patched xml not utf-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = r#"<domain type='kvm'>
  <name>web-1</name>
  <vcpu placement='static'>2</vcpu>
  <memory unit='KiB'>4194304</memory>
  <currentMemory unit='KiB'>4194304</currentMemory>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/images/u1.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='network' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source protocol='gluster' name='gv0/images/u1-data.qcow2'>
        <host name='127.0.0.1' port='24007'/>
      </source>
      <target dev='vdb' bus='virtio'/>
    </disk>
    <interface type='bridge'>
      <mac address='52:54:00:aa:bb:cc'/>
      <target dev='vnet0'/>
      <alias name='net0'/>
    </interface>
  </devices>
</domain>"#;

    #[test]
    fn disks_parsed_for_both_source_kinds() {
        let disks = disks(DOMAIN).unwrap();
        assert_eq!(disks.len(), 2);

        assert_eq!(disks[0].target_dev.as_deref(), Some("vda"));
        assert_eq!(disks[0].source_file.as_deref(), Some("/images/u1.qcow2"));
        assert_eq!(disks[0].driver_type.as_deref(), Some("qcow2"));
        assert!(disks[0].source_protocol.is_none());

        assert_eq!(disks[1].target_dev.as_deref(), Some("vdb"));
        assert_eq!(
            disks[1].source_name.as_deref(),
            Some("gv0/images/u1-data.qcow2")
        );
        assert_eq!(disks[1].source_protocol.as_deref(), Some("gluster"));
        assert_eq!(disks[1].source_host.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn system_disk_is_vda() {
        let disk = system_disk(DOMAIN).unwrap();
        assert_eq!(disk.source_file.as_deref(), Some("/images/u1.qcow2"));
    }

    #[test]
    fn interfaces_parsed() {
        let ifaces = interfaces(DOMAIN).unwrap();
        assert_eq!(ifaces.len(), 1);
        assert_eq!(ifaces[0].target_dev.as_deref(), Some("vnet0"));
        assert_eq!(ifaces[0].alias_name.as_deref(), Some("net0"));
        assert_eq!(ifaces[0].mac.as_deref(), Some("52:54:00:aa:bb:cc"));
    }

    #[test]
    fn ability_reads_current_values() {
        let a = ability(DOMAIN).unwrap();
        assert_eq!(a.vcpu, "2");
        assert_eq!(a.memory, "4194304");
        assert_eq!(a.memory_unit.as_deref(), Some("KiB"));
    }

    #[test]
    fn patch_rewrites_ability_and_keeps_the_rest() {
        let patched = patch_ability(DOMAIN, 4, 8).unwrap();
        let a = ability(&patched).unwrap();
        assert_eq!(a.vcpu, "4");
        assert_eq!(a.memory, "8");
        assert_eq!(a.memory_unit.as_deref(), Some("GiB"));
        assert!(patched.contains(r#"<currentMemory unit="GiB">8</currentMemory>"#));
        // untouched sub-trees survive
        assert_eq!(disks(&patched).unwrap().len(), 2);
        assert!(patched.contains("52:54:00:aa:bb:cc"));
    }
}
