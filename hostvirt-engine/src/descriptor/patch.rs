//! In-place edits of a fetched domain document.
//!
//! Redefining from the decoded [`DomainDescriptor`](super::DomainDescriptor)
//! would drop every element the model does not cover (firmware loader,
//! NVRAM, metadata, seclabels, ...). These functions rewrite the document
//! event by event instead: only the edited elements change, everything else
//! is copied through byte for byte.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{HypervisorError, Result};

const MEMORY: &[&str] = &["domain", "memory"];
const CURRENT_MEMORY: &[&str] = &["domain", "currentMemory"];
const VCPU: &[&str] = &["domain", "vcpu"];
const TOPOLOGY: &[&str] = &["domain", "cpu", "topology"];
const NAME: &[&str] = &["domain", "name"];
const DEVICES: &[&str] = &["domain", "devices"];

/// Set `<memory>` and `<currentMemory>` to `kib` KiB.
pub fn set_memory_kib(xml: &str, kib: u64) -> Result<String> {
    let value = kib.to_string();
    let mut found = false;
    let patched = rewrite_elements(xml, |path, element| {
        if at(path, MEMORY) || at(path, CURRENT_MEMORY) {
            found |= at(path, MEMORY);
            let start = with_attributes(element, &[("unit", "KiB")], &[])?;
            return Ok(Some(Rewrite::Text(start, value.clone())));
        }
        Ok(None)
    })?;
    if !found {
        return Err(HypervisorError::XmlError("domain document has no <memory>".to_string()));
    }
    Ok(patched)
}

/// Set the vCPU count. A `current` count is dropped and a CPU topology is
/// flattened to one socket, since both must agree with the new maximum.
pub fn set_vcpus(xml: &str, count: u32) -> Result<String> {
    let value = count.to_string();
    let mut found = false;
    let patched = rewrite_elements(xml, |path, element| {
        if at(path, VCPU) {
            found = true;
            let start = with_attributes(element, &[], &["current"])?;
            return Ok(Some(Rewrite::Text(start, value.clone())));
        }
        if at(path, TOPOLOGY) {
            let mut set = vec![("sockets", "1"), ("cores", value.as_str()), ("threads", "1")];
            for level in ["dies", "clusters"] {
                if element.try_get_attribute(level)?.is_some() {
                    set.push((level, "1"));
                }
            }
            return Ok(Some(Rewrite::Attributes(with_attributes(element, &set, &[])?)));
        }
        Ok(None)
    })?;
    if !found {
        return Err(HypervisorError::XmlError("domain document has no <vcpu>".to_string()));
    }
    Ok(patched)
}

/// Insert `<uuid>` right after `<name>`.
pub fn insert_uuid(xml: &str, uuid: &str) -> Result<String> {
    let fragment = format!("\n  <uuid>{}</uuid>", uuid);
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut inserted = false;

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) => {
                path.push(e.name().as_ref().to_vec());
                writer.write_event(Event::Start(e))?;
            }
            Event::End(e) => {
                let closes_name = !inserted && at(&path, NAME);
                path.pop();
                writer.write_event(Event::End(e))?;
                if closes_name {
                    writer.get_mut().extend_from_slice(fragment.as_bytes());
                    inserted = true;
                }
            }
            other => writer.write_event(other)?,
        }
    }

    if !inserted {
        return Err(HypervisorError::XmlError("domain document has no <name>".to_string()));
    }
    finish(writer)
}

/// Append a device element (e.g. an encoded `<disk>`) at the end of `<devices>`.
pub fn append_device(xml: &str, device: &str) -> Result<String> {
    let fragment = format!("  {}\n  ", device.trim().replace('\n', "\n    "));
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut appended = false;

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) => {
                path.push(e.name().as_ref().to_vec());
                writer.write_event(Event::Start(e))?;
            }
            Event::End(e) => {
                if at(&path, DEVICES) {
                    writer.get_mut().extend_from_slice(fragment.as_bytes());
                    appended = true;
                }
                path.pop();
                writer.write_event(Event::End(e))?;
            }
            Event::Empty(e) if path.len() == 1 && e.name().as_ref() == b"devices" => {
                writer.write_event(Event::Start(e.borrow()))?;
                writer.get_mut().extend_from_slice(b"\n");
                writer.get_mut().extend_from_slice(fragment.as_bytes());
                writer.write_event(Event::End(BytesEnd::new("devices")))?;
                appended = true;
            }
            other => writer.write_event(other)?,
        }
    }

    if !appended {
        return Err(HypervisorError::XmlError("domain document has no <devices>".to_string()));
    }
    finish(writer)
}

/// Remove the `<disk>` whose `<target dev>` is `target`.
pub fn remove_disk(xml: &str, target: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut path: Vec<Vec<u8>> = Vec::new();

    // Indentation before the element currently being looked at.
    let mut pending_space: Option<Event> = None;
    // Events of a `<disk>` held back until its target is known.
    let mut held: Vec<Event> = Vec::new();
    let mut depth = 0usize;
    let mut matches = false;
    let mut removed = false;

    loop {
        let event = reader.read_event()?;

        if !held.is_empty() {
            match &event {
                Event::Start(e) => {
                    matches |= depth == 1 && is_target(e, target)?;
                    depth += 1;
                }
                Event::Empty(e) => matches |= depth == 1 && is_target(e, target)?,
                Event::End(_) => depth -= 1,
                Event::Eof => return Err(HypervisorError::XmlError("unterminated <disk>".to_string())),
                _ => {}
            }
            held.push(event);

            if depth == 0 {
                if matches {
                    pending_space = None;
                    removed = true;
                } else {
                    if let Some(space) = pending_space.take() {
                        writer.write_event(space)?;
                    }
                    for held_event in held.drain(..) {
                        writer.write_event(held_event)?;
                    }
                }
                held.clear();
                matches = false;
            }
            continue;
        }

        match event {
            Event::Eof => break,
            Event::Start(e) if !removed && at(&path, DEVICES) && e.name().as_ref() == b"disk" => {
                held.push(Event::Start(e));
                depth = 1;
            }
            Event::Text(t) if at(&path, DEVICES) && t.iter().all(u8::is_ascii_whitespace) => {
                if let Some(space) = pending_space.replace(Event::Text(t)) {
                    writer.write_event(space)?;
                }
            }
            other => {
                if let Some(space) = pending_space.take() {
                    writer.write_event(space)?;
                }
                match &other {
                    Event::Start(e) => path.push(e.name().as_ref().to_vec()),
                    Event::End(_) => {
                        path.pop();
                    }
                    _ => {}
                }
                writer.write_event(other)?;
            }
        }
    }

    if !removed {
        return Err(HypervisorError::NotFound(format!("disk target '{}'", target)));
    }
    finish(writer)
}

// =============================================================================
// Helpers
// =============================================================================

enum Rewrite {
    /// Replace the start tag, keep the content.
    Attributes(BytesStart<'static>),
    /// Replace the start tag and the text content.
    Text(BytesStart<'static>, String),
}

/// Copy `xml`, letting `edit` replace elements by their path from the root.
fn rewrite_elements<F>(xml: &str, mut edit: F) -> Result<String>
where
    F: FnMut(&[Vec<u8>], &BytesStart) -> Result<Option<Rewrite>>,
{
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut path: Vec<Vec<u8>> = Vec::new();
    // Depth of an element whose old content is being skipped.
    let mut skip_until: Option<usize> = None;

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) => {
                path.push(e.name().as_ref().to_vec());
                if skip_until.is_some() {
                    continue;
                }
                match edit(&path, &e)? {
                    Some(Rewrite::Attributes(start)) => writer.write_event(Event::Start(start))?,
                    Some(Rewrite::Text(start, text)) => {
                        writer.write_event(Event::Start(start))?;
                        writer.write_event(Event::Text(BytesText::new(&text)))?;
                        skip_until = Some(path.len());
                    }
                    None => writer.write_event(Event::Start(e))?,
                }
            }
            Event::Empty(e) => {
                if skip_until.is_some() {
                    continue;
                }
                path.push(e.name().as_ref().to_vec());
                let rewrite = edit(&path, &e)?;
                path.pop();
                match rewrite {
                    Some(Rewrite::Attributes(start)) => writer.write_event(Event::Empty(start))?,
                    Some(Rewrite::Text(start, text)) => {
                        let end = BytesEnd::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
                        writer.write_event(Event::Start(start))?;
                        writer.write_event(Event::Text(BytesText::new(&text)))?;
                        writer.write_event(Event::End(end))?;
                    }
                    None => writer.write_event(Event::Empty(e))?,
                }
            }
            Event::End(e) => {
                match skip_until {
                    Some(depth) if depth == path.len() => {
                        skip_until = None;
                        writer.write_event(Event::End(e))?;
                    }
                    Some(_) => {}
                    None => writer.write_event(Event::End(e))?,
                }
                path.pop();
            }
            other => {
                if skip_until.is_none() {
                    writer.write_event(other)?;
                }
            }
        }
    }
    finish(writer)
}

fn at(path: &[Vec<u8>], expected: &[&str]) -> bool {
    path.len() == expected.len() && path.iter().zip(expected).all(|(a, b)| a.as_slice() == b.as_bytes())
}

/// A copy of `element` with attributes in `set` replaced and those in `drop` removed.
fn with_attributes(element: &BytesStart, set: &[(&str, &str)], drop: &[&str]) -> Result<BytesStart<'static>> {
    let mut start = BytesStart::new(String::from_utf8_lossy(element.name().as_ref()).into_owned());
    for attribute in element.attributes() {
        let attribute = attribute?;
        let key = attribute.key.as_ref();
        let replaced = set.iter().any(|(k, _)| k.as_bytes() == key);
        let dropped = drop.iter().any(|k| k.as_bytes() == key);
        if !replaced && !dropped {
            start.push_attribute(attribute);
        }
    }
    for &(key, value) in set {
        start.push_attribute((key, value));
    }
    Ok(start)
}

fn is_target(element: &BytesStart, target: &str) -> Result<bool> {
    if element.name().as_ref() != b"target" {
        return Ok(false);
    }
    Ok(match element.try_get_attribute("dev")? {
        Some(dev) => dev.unescape_value()? == target,
        None => false,
    })
}

fn finish(writer: Writer<Vec<u8>>) -> Result<String> {
    String::from_utf8(writer.into_inner()).map_err(|e| HypervisorError::XmlError(e.to_string()))
}
