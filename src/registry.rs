//! Registry of devices discovered by the client role.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::soap::{self, Envelope};

/// A device announced on the network, described by its metadata exchange
#[derive(Debug, Clone, Default)]
pub struct DiscoveredDevice {
    pub last_seen: Option<DateTime<Utc>>,
    /// Known transport addresses, per interface name
    pub addresses: HashMap<String, BTreeSet<String>>,
    /// Properties from the ThisDevice/ThisModel/Relationship sections
    pub props: HashMap<String, String>,
    pub display_name: String,
}

impl DiscoveredDevice {
    /// Merges a metadata exchange response into the device record.
    ///
    /// Sections with unknown dialects are ignored. The transport address is
    /// taken from the XAddr the metadata was fetched from.
    pub fn update(&mut self, xml: &str, xaddr: &str, interface: &str) {
        let envelope = match Envelope::parse(xml) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("malformed metadata: {}", e);
                return;
            }
        };

        let sections = envelope
            .body()
            .and_then(|body| soap::element_child(body, soap::WSX_URI, "Metadata"))
            .map(|metadata| {
                metadata
                    .children()
                    .filter(|n| {
                        n.is_element()
                            && n.tag_name().name() == "MetadataSection"
                            && n.tag_name().namespace() == Some(soap::WSX_URI)
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        for section in sections {
            match section.attribute("Dialect") {
                Some(d) if d == format!("{}/ThisDevice", soap::WSDP_URI) => {
                    self.extract_props(section, "ThisDevice");
                }
                Some(d) if d == format!("{}/ThisModel", soap::WSDP_URI) => {
                    self.extract_props(section, "ThisModel");
                }
                Some(d) if d == format!("{}/Relationship", soap::WSDP_URI) => {
                    self.extract_host_props(section);
                }
                Some(d) => debug!("unknown metadata dialect ({})", d),
                None => {}
            }
        }

        let addr = host_from_url(xaddr).unwrap_or_default();
        self.addresses
            .entry(interface.to_string())
            .or_default()
            .insert(addr.to_string());

        self.last_seen = Some(Utc::now());
        if self.props.contains_key("DisplayName") && self.props.contains_key("BelongsTo") {
            self.display_name = self.props["DisplayName"].clone();
            info!(
                "discovered {} in {} on {}%{}",
                self.display_name, self.props["BelongsTo"], addr, interface
            );
        } else if let Some(friendly) = self.props.get("FriendlyName") {
            self.display_name = friendly.clone();
            info!("discovered {} on {}%{}", self.display_name, addr, interface);
        }

        debug!("{:?}", self.props);
    }

    /// Collects the child elements of `wsdp:<root>` as properties
    fn extract_props(&mut self, section: roxmltree::Node, root: &str) {
        let Some(node) = soap::element_child(section, soap::WSDP_URI, root) else {
            return;
        };
        for child in node.children() {
            if child.is_element() && child.tag_name().namespace() == Some(soap::WSDP_URI) {
                self.props.insert(
                    child.tag_name().name().to_string(),
                    child.text().unwrap_or("").trim().to_string(),
                );
            }
        }
    }

    fn extract_host_props(&mut self, section: roxmltree::Node) {
        let host_type = format!("{}/host", soap::WSDP_URI);
        let Some(host) = section
            .children()
            .filter(|n| {
                n.is_element()
                    && n.tag_name().name() == "Relationship"
                    && n.tag_name().namespace() == Some(soap::WSDP_URI)
                    && n.attribute("Type") == Some(host_type.as_str())
            })
            .find_map(|rel| soap::element_child(rel, soap::WSDP_URI, "Host"))
        else {
            return;
        };

        let types = soap::child_text(host, soap::WSDP_URI, "Types").unwrap_or("");
        self.props.insert("types".to_string(), types.to_string());
        if types != soap::PUB_COMPUTER {
            return;
        }

        let computer = soap::child_text(host, soap::PUB_URI, "Computer").unwrap_or("");
        let (display_name, belongs_to) = match computer.split_once('/') {
            Some((name, rest)) => (name, rest),
            None => (computer, ""),
        };
        self.props
            .insert("DisplayName".to_string(), display_name.to_string());
        self.props
            .insert("BelongsTo".to_string(), belongs_to.to_string());
    }
}

/// Process-wide device registry keyed by the canonical device UUID
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DiscoveredDevice>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry::default()
    }

    /// Canonical registry key for an endpoint URN; accepts case and prefix
    /// variations of the UUID
    pub fn canonical_uuid(endpoint: &str) -> Option<String> {
        Uuid::parse_str(endpoint.trim()).ok().map(|u| u.to_string())
    }

    /// Inserts or refreshes a device from a metadata exchange response
    pub fn update(&self, device_uuid: &str, xml: &str, xaddr: &str, interface: &str) {
        let mut devices = self.devices.lock().expect("registry lock poisoned");
        devices
            .entry(device_uuid.to_string())
            .or_default()
            .update(xml, xaddr, interface);
    }

    pub fn remove(&self, device_uuid: &str) -> bool {
        self.devices
            .lock()
            .expect("registry lock poisoned")
            .remove(device_uuid)
            .is_some()
    }

    pub fn clear(&self) {
        self.devices.lock().expect("registry lock poisoned").clear();
    }

    pub fn contains(&self, device_uuid: &str) -> bool {
        self.devices
            .lock()
            .expect("registry lock poisoned")
            .contains_key(device_uuid)
    }

    pub fn get(&self, device_uuid: &str) -> Option<DiscoveredDevice> {
        self.devices
            .lock()
            .expect("registry lock poisoned")
            .get(device_uuid)
            .cloned()
    }

    /// One line per device, tab separated, terminated by a lone dot line
    pub fn list_reply(&self) -> String {
        let devices = self.devices.lock().expect("registry lock poisoned");
        let mut reply = String::new();
        for (device_uuid, device) in devices.iter() {
            let addrs = device
                .addresses
                .iter()
                .map(|(interface, addrs)| {
                    addrs
                        .iter()
                        .map(|a| format!("{}%{}", a, interface))
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .collect::<Vec<_>>()
                .join(",");

            reply.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\n",
                device_uuid,
                device.display_name,
                device.props.get("BelongsTo").map(String::as_str).unwrap_or(""),
                device
                    .last_seen
                    .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
                    .unwrap_or_default(),
                addrs
            ));
        }

        reply.push_str(".\n");
        reply
    }
}

/// Host part of an XAddr URL, without the port
pub(crate) fn host_from_url(url: &str) -> Option<&str> {
    let rest = url.split("://").nth(1)?;
    let authority = rest.split('/').next()?;
    if let Some(stripped) = authority.strip_prefix('[') {
        // bracketed v6 literal
        stripped.split(']').next().map(|host| {
            &authority[..host.len() + 2]
        })
    } else {
        authority.split(':').next()
    }
}
