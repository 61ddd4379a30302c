//! The host (target) role: make this machine discoverable.
//!
//! On creation the role announces itself with `Hello` and answers `Probe`
//! and `Resolve` requests; on teardown it says goodbye with `Bye`. Every
//! outgoing message carries the `AppSequence` header.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::context::WsdContext;
use crate::message::{ActionHandler, HandlerReply, MessageEngine, MessageSource};
use crate::multicast::{DatagramHandler, MulticastEndpoint, SocketRole};
use crate::scheduler::SoapUdpChannel;
use crate::soap::{self, SoapEnvelope};
use tokio::task::JoinHandle;

pub struct HostRole {
    mep: Arc<MulticastEndpoint>,
    ctx: Arc<WsdContext>,
    engine: MessageEngine,
    channel: SoapUdpChannel,
    /// Retransmit tasks that must complete before the endpoint closes
    pending_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HostRole {
    /// Attaches a host role to the endpoint and announces it immediately.
    /// The `Hello` is enqueued before the endpoint starts reading, so it
    /// precedes any reply this role produces.
    pub fn new(mep: Arc<MulticastEndpoint>, ctx: Arc<WsdContext>) -> Arc<Self> {
        let role = Arc::new(HostRole {
            engine: MessageEngine::new(Arc::clone(&ctx)),
            channel: SoapUdpChannel::new(Arc::clone(&mep), Arc::clone(&ctx)),
            mep: Arc::clone(&mep),
            ctx,
            pending_tasks: Mutex::new(Vec::new()),
        });

        mep.add_handler(SocketRole::Receive, Arc::clone(&role) as _);
        role.send_hello();
        role
    }

    fn send_hello(&self) {
        let body = format!(
            "<wsd:Hello>{}{}{}</wsd:Hello>",
            soap::endpoint_reference(&self.ctx.urn),
            soap::xaddrs_element(&self.mep.transport_address, &self.ctx.device_uuid),
            soap::metadata_version()
        );
        let msg = SoapEnvelope::new(soap::WSA_DISCOVERY, soap::WSD_HELLO)
            .header_extra(&app_sequence(&self.ctx))
            .body(&body)
            .build();
        self.channel.enqueue(msg, None, Some("Hello"));
    }

    fn send_bye(&self) {
        let body = format!("<wsd:Bye>{}</wsd:Bye>", soap::endpoint_reference(&self.ctx.urn));
        let msg = SoapEnvelope::new(soap::WSA_DISCOVERY, soap::WSD_BYE)
            .header_extra(&app_sequence(&self.ctx))
            .body(&body)
            .build();
        let task = self.channel.enqueue(msg, None, Some("Bye"));
        self.pending_tasks
            .lock()
            .expect("pending task lock poisoned")
            .push(task);
    }

    /// Announces departure; the returned handles complete once the `Bye`
    /// retransmits are on the wire.
    pub fn teardown(&self) -> Vec<JoinHandle<()>> {
        self.send_bye();
        self.pending_tasks
            .lock()
            .expect("pending task lock poisoned")
            .drain(..)
            .collect()
    }
}

impl DatagramHandler for HostRole {
    fn handle_datagram(&self, msg: &[u8], src: SocketAddr) {
        let source = MessageSource::Udp {
            src,
            interface: &self.mep.interface.name,
        };
        if let Some(reply) = self.engine.process(self, msg, source) {
            self.channel.enqueue(reply, Some(src), None);
        }
    }
}

impl ActionHandler for HostRole {
    fn handle_action(
        &self,
        action: &str,
        _header: roxmltree::Node,
        body: roxmltree::Node,
    ) -> Option<HandlerReply> {
        match action {
            soap::WSD_PROBE => handle_probe(&self.ctx, body),
            soap::WSD_RESOLVE => handle_resolve(&self.ctx, &self.mep.transport_address, body),
            _ => None,
        }
    }

    fn header_extension(&self, _action: &str) -> String {
        app_sequence(&self.ctx)
    }
}

/// `AppSequence` header element; advances the process-wide message number
pub fn app_sequence(ctx: &WsdContext) -> String {
    format!(
        r#"<wsd:AppSequence InstanceId="{}" SequenceId="{}" MessageNumber="{}"/>"#,
        ctx.sequence.instance_id(),
        soap::new_message_urn(),
        ctx.sequence.next_message_number()
    )
}

/// Answers a `Probe` for `wsdp:Device`. Scoped probes are unsupported and
/// dropped, as are probes for foreign types.
pub fn handle_probe(ctx: &WsdContext, body: roxmltree::Node) -> Option<HandlerReply> {
    let probe = soap::element_child(body, soap::WSD_URI, "Probe")?;

    if let Some(scopes) = soap::element_child(probe, soap::WSD_URI, "Scopes") {
        debug!(
            "scopes ({}) unsupported but probed",
            scopes.text().unwrap_or("").trim()
        );
        return None;
    }

    let types = match soap::child_text(probe, soap::WSD_URI, "Types") {
        Some(types) => types,
        None => {
            debug!("Probe message lacks wsd:Types element. Ignored.");
            return None;
        }
    };

    if types != soap::WSD_TYPE_DEVICE {
        debug!("unknown discovery type ({}) for probe", types);
        return None;
    }

    let body = format!(
        "<wsd:ProbeMatches><wsd:ProbeMatch>{}{}{}</wsd:ProbeMatch></wsd:ProbeMatches>",
        soap::endpoint_reference(&ctx.urn),
        soap::types_element(soap::WSD_TYPE_DEVICE_COMPUTER),
        soap::metadata_version()
    );
    Some(HandlerReply {
        body,
        action: soap::WSD_PROBE_MATCH,
    })
}

/// Answers a `Resolve` that targets this device's URN
pub fn handle_resolve(
    ctx: &WsdContext,
    transport_address: &str,
    body: roxmltree::Node,
) -> Option<HandlerReply> {
    let resolve = soap::element_child(body, soap::WSD_URI, "Resolve")?;

    let address = match soap::element_path(
        resolve,
        &[(soap::WSA_URI, "EndpointReference"), (soap::WSA_URI, "Address")],
    )
    .and_then(|n| n.text())
    {
        Some(address) => address.trim(),
        None => {
            debug!("invalid resolve request: missing endpoint address");
            return None;
        }
    };

    if address != ctx.urn {
        debug!(
            "invalid resolve request: address ({}) does not match own one ({})",
            address, ctx.urn
        );
        return None;
    }

    let body = format!(
        "<wsd:ResolveMatches><wsd:ResolveMatch>{}{}{}{}</wsd:ResolveMatch></wsd:ResolveMatches>",
        soap::endpoint_reference(&ctx.urn),
        soap::types_element(soap::WSD_TYPE_DEVICE_COMPUTER),
        soap::xaddrs_element(transport_address, &ctx.device_uuid),
        soap::metadata_version()
    );
    Some(HandlerReply {
        body,
        action: soap::WSD_RESOLVE_MATCH,
    })
}
