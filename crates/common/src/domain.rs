//! libvirt domain XML helpers
//!
//! Only the handful of device fields Flint needs are extracted, using a
//! streaming quick-xml reader rather than a full document model.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Where a domain's VNC server is listening
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VncEndpoint {
    pub host: String,
    pub port: u16,
}

impl VncEndpoint {
    /// Address to dial from the Flint host. Wildcard listens map to loopback.
    pub fn dial_address(&self) -> String {
        let host = match self.host.as_str() {
            "" | "0.0.0.0" => "127.0.0.1",
            "::" => "::1",
            other => other,
        };
        if host.contains(':') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

/// Minimum supported libvirt library version (6.10.0)
pub const MIN_LIBVIRT_VERSION: u64 = 6_010_000;

#[derive(Default)]
struct CharDevice {
    is_pty: bool,
    path: Option<String>,
}

impl CharDevice {
    fn pty_path(self) -> Option<String> {
        if !self.is_pty {
            return None;
        }
        self.path.filter(|p| !p.is_empty())
    }
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for a in e.attributes() {
        let a = a?;
        if a.key.as_ref() == name {
            return Ok(Some(a.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// True when the element stack is `domain > devices`
fn in_devices(stack: &[Vec<u8>]) -> bool {
    stack.len() == 2 && stack[1] == b"devices"
}

/// Find the PTY path of a domain's serial console.
///
/// A `<console type="pty">` with a source path wins over a
/// `<serial type="pty">`. Returns `Ok(None)` when neither is present.
pub fn extract_pty_path(xml: &str) -> Result<Option<String>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut current: Option<(bool, CharDevice)> = None;
    let mut console: Option<String> = None;
    let mut serial: Option<String> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = e.name().as_ref().to_vec();
                if in_devices(&stack) && (name == b"console" || name == b"serial") {
                    let is_console = name == b"console";
                    let dev = CharDevice {
                        is_pty: attr(&e, b"type")?.as_deref() == Some("pty"),
                        path: None,
                    };
                    current = Some((is_console, dev));
                } else if name == b"source" && stack.len() == 3 {
                    if let Some((_, dev)) = current.as_mut() {
                        dev.path = attr(&e, b"path")?;
                    }
                }
                stack.push(name);
            }
            Event::Empty(e) => {
                let name = e.name();
                let name = name.as_ref();
                if name == b"source" && stack.len() == 3 {
                    if let Some((_, dev)) = current.as_mut() {
                        dev.path = attr(&e, b"path")?;
                    }
                }
                // Self-closing <console type="pty"/> has no source, so nothing to record
            }
            Event::End(_) => {
                stack.pop();
                if stack.len() == 2 {
                    if let Some((is_console, dev)) = current.take() {
                        let slot = if is_console { &mut console } else { &mut serial };
                        if slot.is_none() {
                            *slot = dev.pty_path();
                        }
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(console.or(serial))
}

/// Find the first running VNC graphics device of a domain.
pub fn extract_vnc_endpoint(xml: &str) -> Result<Option<VncEndpoint>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Vec<u8>> = Vec::new();
    // (port, listen attribute, child <listen address=...>)
    let mut current: Option<(Option<u16>, Option<String>, Option<String>)> = None;

    loop {
        let (e, is_empty) = match reader.read_event()? {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::End(_) => {
                stack.pop();
                if stack.len() == 2 {
                    if let Some(found) = current.take().and_then(vnc_from_parts) {
                        return Ok(Some(found));
                    }
                }
                continue;
            }
            Event::Eof => break,
            _ => continue,
        };

        let name = e.name().as_ref().to_vec();
        if in_devices(&stack) && name == b"graphics" {
            if attr(&e, b"type")?.as_deref() == Some("vnc") {
                let port = attr(&e, b"port")?
                    .and_then(|p| p.parse::<i32>().ok())
                    .filter(|p| *p > 0)
                    .and_then(|p| u16::try_from(p).ok());
                let parts = (port, attr(&e, b"listen")?, None);
                if is_empty {
                    if let Some(found) = vnc_from_parts(parts) {
                        return Ok(Some(found));
                    }
                } else {
                    current = Some(parts);
                }
            }
        } else if name == b"listen" && stack.len() == 3 {
            if let Some(parts) = current.as_mut() {
                if parts.2.is_none() {
                    parts.2 = attr(&e, b"address")?;
                }
            }
        }

        if !is_empty {
            stack.push(name);
        }
    }

    Ok(None)
}

fn vnc_from_parts(
    (port, listen, child): (Option<u16>, Option<String>, Option<String>),
) -> Option<VncEndpoint> {
    let port = port?;
    let host = listen
        .filter(|h| !h.is_empty())
        .or(child.filter(|h| !h.is_empty()))
        .unwrap_or_else(|| "127.0.0.1".to_string());
    Some(VncEndpoint { host, port })
}

/// Parse `virsh version` output into libvirt's numeric version encoding
/// (`major * 1_000_000 + minor * 1_000 + release`).
pub fn parse_libvirt_version(output: &str) -> Option<u64> {
    let line = output
        .lines()
        .find(|l| l.trim_start().starts_with("Using library:"))?;
    let version = line.split_whitespace().last()?;

    let mut parts = version.split('.').map(|p| p.parse::<u64>().ok());
    let major = parts.next()??;
    let minor = parts.next().unwrap_or(Some(0))?;
    let release = parts.next().unwrap_or(Some(0))?;
    Some(major * 1_000_000 + minor * 1_000 + release)
}
