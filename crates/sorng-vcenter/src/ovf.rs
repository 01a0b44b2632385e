//! OVF descriptor rewriting and import-spec patching.

use crate::error::{VcenterError, VcenterResult};

use quick_xml::events::Event;
use quick_xml::{Reader, Writer};
use serde_json::Value;
use std::io::Cursor;

/// CIM resource type of an Ethernet adapter.
const RESOURCE_TYPE_ETHERNET: &str = "10";

/// Drop the descriptor's network adapters, and its `ProductSection`
/// when `strip_product` is set (ESX hosts reject OVF properties).
pub fn strip_descriptor(xml: &str, strip_product: bool) -> VcenterResult<String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    // Depth inside a ProductSection being skipped.
    let mut skip_depth = 0usize;
    // Events of the hardware item being read, written once its type is known.
    let mut item: Option<Vec<Event>> = None;
    let mut item_depth = 0usize;
    let mut in_resource_type = false;
    let mut is_nic = false;

    loop {
        let event = reader.read_event()?;
        if let Event::Eof = event {
            break;
        }

        if skip_depth > 0 {
            match event {
                Event::Start(_) => skip_depth += 1,
                Event::End(_) => skip_depth -= 1,
                _ => {}
            }
            continue;
        }

        if let Some(buf) = item.as_mut() {
            match &event {
                Event::Start(e) => {
                    item_depth += 1;
                    in_resource_type = e.local_name().as_ref() == b"ResourceType";
                }
                Event::End(_) => {
                    item_depth -= 1;
                    in_resource_type = false;
                }
                Event::Text(t) if in_resource_type => {
                    is_nic = t.unescape()?.trim() == RESOURCE_TYPE_ETHERNET;
                }
                _ => {}
            }
            buf.push(event);
            if item_depth == 0 {
                let events = item.take().unwrap_or_default();
                if !is_nic {
                    for ev in events {
                        writer.write_event(ev)?;
                    }
                }
                is_nic = false;
            }
            continue;
        }

        if let Event::Start(e) = &event {
            let name = e.local_name();
            if strip_product && name.as_ref() == b"ProductSection" {
                skip_depth = 1;
                continue;
            }
            if matches!(name.as_ref(), b"Item" | b"EthernetPortItem") {
                item_depth = 1;
                item = Some(vec![event]);
                continue;
            }
        }
        if let Event::Empty(e) = &event {
            if strip_product && e.local_name().as_ref() == b"ProductSection" {
                continue;
            }
        }
        writer.write_event(event)?;
    }

    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| VcenterError::parse(format!("Rewritten descriptor is not UTF-8: {e}")))
}

/// `href`s of the `File` entries in the `References` section.
pub fn referenced_files(xml: &str) -> VcenterResult<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    let mut files = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"File" => {
                for attr in e.attributes() {
                    let attr = attr.map_err(quick_xml::Error::from)?;
                    if attr.key.local_name().as_ref() == b"href" {
                        files.push(attr.unescape_value()?.into_owned());
                    }
                }
            }
            _ => {}
        }
    }
    Ok(files)
}

/// Append a device change to `configSpec.deviceChange` of an import spec.
pub fn inject_nic(import_spec: &mut Value, device_change: Value) -> VcenterResult<()> {
    let config = import_spec
        .get_mut("configSpec")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| VcenterError::config("Import spec is missing import-spec config (configSpec)"))?;
    match config.get_mut("deviceChange").and_then(Value::as_array_mut) {
        Some(changes) => changes.push(device_change),
        None => {
            config.insert("deviceChange".into(), Value::Array(vec![device_change]));
        }
    }
    Ok(())
}
