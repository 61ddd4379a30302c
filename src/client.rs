//! The client (resolver) role: discover other WSD hosts.
//!
//! The client probes for devices, follows `Hello`/`ProbeMatches`/
//! `ResolveMatches` announcements to their transport address and fetches
//! device metadata over HTTP into the registry. `Bye` removes the device
//! again. Replies are only believed when they correlate to one of our own
//! probes.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::WsdContext;
use crate::http;
use crate::message::{ActionHandler, HandlerReply, MessageEngine, MessageSource};
use crate::multicast::{AddressFamily, DatagramHandler, MulticastEndpoint, SocketRole};
use crate::registry::DeviceRegistry;
use crate::scheduler::SoapUdpChannel;
use crate::soap::{self, SoapEnvelope};

/// Servers must respond within this window after a probe arrives
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(4);

pub struct ClientRole {
    weak: Weak<ClientRole>,
    mep: Arc<MulticastEndpoint>,
    ctx: Arc<WsdContext>,
    engine: MessageEngine,
    channel: SoapUdpChannel,
    registry: Arc<DeviceRegistry>,
    /// In-flight probes by MessageID and send time
    probes: Mutex<HashMap<String, Instant>>,
    startup_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientRole {
    /// Attaches a client role to the endpoint. The initial probe is delayed
    /// by a random amount to avoid packet storms when many hosts come up at
    /// the same time.
    pub fn new(
        mep: Arc<MulticastEndpoint>,
        ctx: Arc<WsdContext>,
        registry: Arc<DeviceRegistry>,
    ) -> Arc<Self> {
        let role = Arc::new_cyclic(|weak| ClientRole {
            weak: weak.clone(),
            engine: MessageEngine::new(Arc::clone(&ctx)),
            channel: SoapUdpChannel::new(Arc::clone(&mep), Arc::clone(&ctx)),
            mep: Arc::clone(&mep),
            ctx: Arc::clone(&ctx),
            registry,
            probes: Mutex::new(HashMap::new()),
            startup_task: Mutex::new(None),
        });

        mep.add_handler(SocketRole::Receive, Arc::clone(&role) as _);
        mep.add_handler(SocketRole::MulticastSend, Arc::clone(&role) as _);

        let startup = Arc::clone(&role);
        let max_delay = ctx.timing.max_startup_probe_delay;
        let task = tokio::spawn(async move {
            let delay = rand::thread_rng().gen_range(0..=max_delay);
            tokio::time::sleep(Duration::from_secs(delay)).await;
            startup.send_probe();
        });
        *role.startup_task.lock().expect("startup task lock poisoned") = Some(task);

        role
    }

    /// Probes for `wsdp:Device` targets on this endpoint
    pub fn send_probe(&self) {
        self.remove_outdated_probes();

        let envelope = SoapEnvelope::new(soap::WSA_DISCOVERY, soap::WSD_PROBE).body(&format!(
            "<wsd:Probe>{}</wsd:Probe>",
            soap::types_element(soap::WSD_TYPE_DEVICE)
        ));
        let message_id = envelope.message_id().to_string();
        self.channel.enqueue(envelope.build(), None, Some("Probe"));
        self.probes
            .lock()
            .expect("probe map lock poisoned")
            .insert(message_id, Instant::now());
    }

    pub fn interface_name(&self) -> &str {
        &self.mep.interface.name
    }

    pub fn teardown(&self) {
        if let Some(task) = self
            .startup_task
            .lock()
            .expect("startup task lock poisoned")
            .take()
        {
            task.abort();
        }
        self.remove_outdated_probes();
    }

    fn remove_outdated_probes(&self) {
        let cut = Instant::now();
        self.probes
            .lock()
            .expect("probe map lock poisoned")
            .retain(|_, sent| cut.duration_since(*sent) < 2 * PROBE_TIMEOUT);
    }

    fn is_known_probe(&self, relates_to: Option<&str>) -> bool {
        relates_to_known_probe(
            &self.probes.lock().expect("probe map lock poisoned"),
            relates_to,
        )
    }

    fn handle_hello(&self, body: roxmltree::Node) {
        let (endpoint, xaddrs) = extract_endpoint_metadata(body, &["Hello"]);
        let Some(endpoint) = endpoint else {
            debug!("Hello without endpoint reference");
            return;
        };

        let Some(xaddrs) = xaddrs.filter(|x| !x.trim().is_empty()) else {
            info!("Hello without XAddrs, sending resolve");
            self.send_resolve(&endpoint);
            return;
        };

        let Some(xaddr) = select_xaddr(self.mep.family, &xaddrs) else {
            return;
        };

        info!("Hello from {} on {}", endpoint, xaddr);
        self.start_metadata_exchange(endpoint, xaddr.to_string());
    }

    fn handle_bye(&self, body: roxmltree::Node) {
        let (endpoint, _) = extract_endpoint_metadata(body, &["Bye"]);
        let Some(device_uuid) = endpoint.as_deref().and_then(DeviceRegistry::canonical_uuid)
        else {
            return;
        };
        self.registry.remove(&device_uuid);
    }

    fn handle_probe_match(&self, header: roxmltree::Node, body: roxmltree::Node) {
        // do not handle probe matches issued for probes not sent by ourself
        let relates_to = soap::child_text(header, soap::WSA_URI, "RelatesTo");
        if !self.is_known_probe(relates_to) {
            debug!("unknown probe {}", relates_to.unwrap_or("(none)"));
            return;
        }

        let (endpoint, xaddrs) =
            extract_endpoint_metadata(body, &["ProbeMatches", "ProbeMatch"]);
        let Some(endpoint) = endpoint else {
            return;
        };

        let Some(xaddrs) = xaddrs.filter(|x| !x.trim().is_empty()) else {
            debug!("probe match without XAddrs, sending resolve");
            self.send_resolve(&endpoint);
            return;
        };

        let Some(xaddr) = xaddrs.split_whitespace().next() else {
            return;
        };
        debug!("probe match for {} on {}", endpoint, xaddr);
        self.start_metadata_exchange(endpoint, xaddr.to_string());
    }

    fn handle_resolve_match(&self, body: roxmltree::Node) {
        let (endpoint, xaddrs) =
            extract_endpoint_metadata(body, &["ResolveMatches", "ResolveMatch"]);
        let (Some(endpoint), Some(xaddrs)) = (endpoint, xaddrs.filter(|x| !x.trim().is_empty()))
        else {
            debug!("resolve match without endpoint/xaddr");
            return;
        };

        let Some(xaddr) = xaddrs.split_whitespace().next() else {
            return;
        };
        debug!("resolve match for {} on {}", endpoint, xaddr);
        self.start_metadata_exchange(endpoint, xaddr.to_string());
    }

    fn send_resolve(&self, endpoint: &str) {
        let body = format!(
            "<wsd:Resolve>{}</wsd:Resolve>",
            soap::endpoint_reference(endpoint)
        );
        let msg = SoapEnvelope::new(soap::WSA_DISCOVERY, soap::WSD_RESOLVE)
            .body(&body)
            .build();
        self.channel.enqueue(msg, None, None);
    }

    fn start_metadata_exchange(&self, endpoint: String, xaddr: String) {
        if let Some(role) = self.weak.upgrade() {
            tokio::spawn(async move {
                role.perform_metadata_exchange(endpoint, xaddr).await;
            });
        }
    }

    async fn perform_metadata_exchange(self: Arc<Self>, endpoint: String, xaddr: String) {
        if !xaddr.starts_with("http://") {
            debug!("invalid XAddr: {}", xaddr);
            return;
        }

        let Some(parts) = parse_xaddr(&xaddr) else {
            debug!("invalid XAddr: {}", xaddr);
            return;
        };

        // Resolve the destination ourselves so that link-local v6 targets
        // carry the interface scope; the Host header stays zone-free for
        // server-side compatibility.
        let (target, host_header, url) = if parts.v6 {
            let Ok(ip) = parts.host.parse::<std::net::Ipv6Addr>() else {
                debug!("invalid v6 XAddr host: {}", parts.host);
                return;
            };
            (
                SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    parts.port,
                    0,
                    self.mep.interface.index,
                )),
                format!("[{}]", parts.host),
                zone_qualified(&xaddr, &self.mep.interface.name),
            )
        } else {
            let Ok(ip) = parts.host.parse::<std::net::Ipv4Addr>() else {
                debug!("invalid v4 XAddr host: {}", parts.host);
                return;
            };
            (
                SocketAddr::V4(SocketAddrV4::new(ip, parts.port)),
                format!("{}:{}", parts.host, parts.port),
                xaddr.clone(),
            )
        };

        let body = self.build_getmetadata_message(&endpoint);
        match http::soap_post(
            target,
            &host_header,
            &parts.path,
            &body,
            self.ctx.timing.metadata_timeout,
        )
        .await
        {
            Ok(meta) => self.handle_metadata(&meta, &endpoint, &xaddr),
            Err(e) => warn!("could not fetch metadata from: {} {}", url, e),
        }
    }

    fn build_getmetadata_message(&self, endpoint: &str) -> Vec<u8> {
        SoapEnvelope::new(endpoint, soap::WSD_GET)
            .header_extra(&self.header_extension(soap::WSD_GET))
            .build()
    }

    fn handle_metadata(&self, meta: &[u8], endpoint: &str, xaddr: &str) {
        let Ok(text) = std::str::from_utf8(meta) else {
            debug!("metadata response is not valid utf-8");
            return;
        };
        let Some(device_uuid) = DeviceRegistry::canonical_uuid(endpoint) else {
            debug!("invalid endpoint urn: {}", endpoint);
            return;
        };

        self.registry
            .update(&device_uuid, text, xaddr, &self.mep.interface.name);
    }
}

impl DatagramHandler for ClientRole {
    fn handle_datagram(&self, msg: &[u8], src: SocketAddr) {
        let source = MessageSource::Udp {
            src,
            interface: &self.mep.interface.name,
        };
        self.engine.process(self, msg, source);
    }
}

impl ActionHandler for ClientRole {
    fn handle_action(
        &self,
        action: &str,
        header: roxmltree::Node,
        body: roxmltree::Node,
    ) -> Option<HandlerReply> {
        match action {
            soap::WSD_HELLO => self.handle_hello(body),
            soap::WSD_BYE => self.handle_bye(body),
            soap::WSD_PROBE_MATCH => self.handle_probe_match(header, body),
            soap::WSD_RESOLVE_MATCH => self.handle_resolve_match(body),
            _ => {}
        }
        None
    }

    fn header_extension(&self, action: &str) -> String {
        if action != soap::WSD_GET {
            return String::new();
        }
        format!(
            "<wsa:ReplyTo><wsa:Address>{}</wsa:Address></wsa:ReplyTo><wsa:From><wsa:Address>{}</wsa:Address></wsa:From>",
            soap::WSA_ANON,
            soap::escape_xml(&self.ctx.urn)
        )
    }
}

/// A match is only ours when it cites one of the probes we actually sent
pub(crate) fn relates_to_known_probe(
    probes: &HashMap<String, Instant>,
    relates_to: Option<&str>,
) -> bool {
    relates_to.map(|id| probes.contains_key(id)).unwrap_or(false)
}

/// Endpoint address and XAddrs below a body element path (all WSD-namespaced)
pub fn extract_endpoint_metadata(
    body: roxmltree::Node,
    path: &[&str],
) -> (Option<String>, Option<String>) {
    let mut node = body;
    for name in path {
        node = match soap::element_child(node, soap::WSD_URI, name) {
            Some(node) => node,
            None => return (None, None),
        };
    }

    let endpoint = soap::element_path(
        node,
        &[(soap::WSA_URI, "EndpointReference"), (soap::WSA_URI, "Address")],
    )
    .and_then(|n| n.text())
    .map(|s| s.trim().to_string());
    let xaddrs = soap::child_text(node, soap::WSD_URI, "XAddrs").map(String::from);

    (endpoint, xaddrs)
}

/// Picks the transport address to contact: the first entry for IPv4, the
/// first link-local entry for IPv6
pub fn select_xaddr(family: AddressFamily, xaddrs: &str) -> Option<&str> {
    for addr in xaddrs.split_whitespace() {
        match family {
            AddressFamily::V6 if addr.contains("//[fe80:") => return Some(addr),
            AddressFamily::V4 => return Some(addr),
            _ => {}
        }
    }
    None
}

/// Inserts the interface zone into a bracketed v6 URL host
pub fn zone_qualified(url: &str, interface: &str) -> String {
    url.replacen(']', &format!("%{}]", interface), 1)
}

pub(crate) struct XAddrParts {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub v6: bool,
}

pub(crate) fn parse_xaddr(url: &str) -> Option<XAddrParts> {
    let rest = url.strip_prefix("http://")?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };

    if let Some(stripped) = authority.strip_prefix('[') {
        let end = stripped.find(']')?;
        let host = &stripped[..end];
        let port = match stripped[end + 1..].strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None => 80,
        };
        Some(XAddrParts {
            host: host.to_string(),
            port,
            path: path.to_string(),
            v6: true,
        })
    } else {
        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (authority, 80),
        };
        (!host.is_empty()).then(|| XAddrParts {
            host: host.to_string(),
            port,
            path: path.to_string(),
            v6: false,
        })
    }
}
