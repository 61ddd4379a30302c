//! The WSD message engine.
//!
//! Validates inbound SOAP envelopes, drops duplicates received over UDP,
//! dispatches on the action URI and builds correlated response envelopes.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::context::WsdContext;
use crate::soap::{self, Envelope, SoapEnvelope};

/// Where a message entered the daemon. UDP messages pass duplicate
/// suppression, HTTP bodies do not.
#[derive(Debug, Clone, Copy)]
pub enum MessageSource<'a> {
    Udp {
        src: SocketAddr,
        interface: &'a str,
    },
    Http,
}

/// A reply produced by an action handler: the body fragment and the
/// response action URI
pub struct HandlerReply {
    pub body: String,
    pub action: &'static str,
}

/// Dispatch target of the message engine.
///
/// Handlers return `None` when no reply is due; header extensions are
/// appended to the SOAP header of every message built for the handler.
pub trait ActionHandler: Send + Sync {
    fn handle_action(
        &self,
        action: &str,
        header: roxmltree::Node,
        body: roxmltree::Node,
    ) -> Option<HandlerReply>;

    fn header_extension(&self, _action: &str) -> String {
        String::new()
    }
}

pub struct MessageEngine {
    ctx: Arc<WsdContext>,
}

impl MessageEngine {
    pub fn new(ctx: Arc<WsdContext>) -> Self {
        MessageEngine { ctx }
    }

    /// Handles one inbound message and returns the serialized reply, if any.
    ///
    /// Messages without `Header`, `MessageID`, `Action` or `Body` are
    /// dropped, as are UDP duplicates within the recent-message window.
    pub fn process(
        &self,
        handler: &dyn ActionHandler,
        raw: &[u8],
        source: MessageSource<'_>,
    ) -> Option<Vec<u8>> {
        let text = match std::str::from_utf8(raw) {
            Ok(text) => text,
            Err(e) => {
                debug!("invalid utf-8 in message: {}", e);
                return None;
            }
        };

        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("malformed message: {}", e);
                return None;
            }
        };

        let header = envelope.header()?;
        let message_id = envelope.message_id()?;

        if let MessageSource::Udp { .. } = source {
            if self.ctx.dedup.is_duplicate(message_id) {
                debug!("known message ({}): dropping it", message_id);
                return None;
            }
        }

        let action = envelope.action()?;
        let action_method = action.rsplit('/').next().unwrap_or(action);

        match source {
            MessageSource::Udp { src, interface } => {
                info!(
                    "{}:{}({}) - - \"{} {} UDP\" - -",
                    src.ip(),
                    src.port(),
                    interface,
                    action_method,
                    message_id
                );
            }
            MessageSource::Http => {
                // request logging is done by the HTTP server
                debug!("processing WSD {} message ({})", action_method, message_id);
            }
        }

        let body = envelope.body()?;
        let reply = match handler.handle_action(action, header, body) {
            Some(reply) => reply,
            None => {
                debug!("unhandled action {}/{}", action, message_id);
                return None;
            }
        };

        let response = SoapEnvelope::new(soap::WSA_ANON, reply.action)
            .relates_to(message_id)
            .header_extra(&handler.header_extension(reply.action))
            .body(&reply.body)
            .build();
        Some(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use clap::Parser;

    struct EchoHandler;

    impl ActionHandler for EchoHandler {
        fn handle_action(
            &self,
            action: &str,
            _header: roxmltree::Node,
            _body: roxmltree::Node,
        ) -> Option<HandlerReply> {
            (action == soap::WSD_PROBE).then(|| HandlerReply {
                body: "<wsd:ProbeMatches/>".to_string(),
                action: soap::WSD_PROBE_MATCH,
            })
        }
    }

    fn test_ctx() -> Arc<WsdContext> {
        let config = Config::try_parse_from(["wsdd"]).expect("config");
        Arc::new(WsdContext::new(Arc::new(config)))
    }

    fn udp_source() -> MessageSource<'static> {
        MessageSource::Udp {
            src: "10.0.0.7:3702".parse().expect("address"),
            interface: "eth0",
        }
    }

    fn probe(message_id: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?><soap:Envelope xmlns:soap="{}" xmlns:wsa="{}" xmlns:wsd="{}"><soap:Header><wsa:To>{}</wsa:To><wsa:Action>{}</wsa:Action><wsa:MessageID>{}</wsa:MessageID></soap:Header><soap:Body><wsd:Probe><wsd:Types>wsdp:Device</wsd:Types></wsd:Probe></soap:Body></soap:Envelope>"#,
            soap::SOAP_URI,
            soap::WSA_URI,
            soap::WSD_URI,
            soap::WSA_DISCOVERY,
            soap::WSD_PROBE,
            message_id
        )
        .into_bytes()
    }

    #[test]
    fn test_reply_is_correlated() {
        let engine = MessageEngine::new(test_ctx());
        let reply = engine
            .process(&EchoHandler, &probe("urn:uuid:req-1"), udp_source())
            .expect("probe should be answered");

        let text = String::from_utf8(reply).expect("utf-8");
        let parsed = Envelope::parse(&text).expect("reply should parse");
        assert_eq!(parsed.relates_to(), Some("urn:uuid:req-1"));
        assert_eq!(parsed.to(), Some(soap::WSA_ANON));
        assert_eq!(parsed.action(), Some(soap::WSD_PROBE_MATCH));
    }

    #[test]
    fn test_udp_duplicate_dropped() {
        let engine = MessageEngine::new(test_ctx());
        let msg = probe("urn:uuid:dup");
        assert!(engine.process(&EchoHandler, &msg, udp_source()).is_some());
        assert!(engine.process(&EchoHandler, &msg, udp_source()).is_none());
    }

    #[test]
    fn test_http_bypasses_dedup() {
        let engine = MessageEngine::new(test_ctx());
        let msg = probe("urn:uuid:http");
        assert!(engine
            .process(&EchoHandler, &msg, MessageSource::Http)
            .is_some());
        assert!(engine
            .process(&EchoHandler, &msg, MessageSource::Http)
            .is_some());
    }

    #[test]
    fn test_incomplete_messages_dropped() {
        let engine = MessageEngine::new(test_ctx());

        let no_header = format!(
            r#"<soap:Envelope xmlns:soap="{}"><soap:Body/></soap:Envelope>"#,
            soap::SOAP_URI
        );
        assert!(engine
            .process(&EchoHandler, no_header.as_bytes(), udp_source())
            .is_none());

        let no_message_id = format!(
            r#"<soap:Envelope xmlns:soap="{}" xmlns:wsa="{}"><soap:Header><wsa:Action>{}</wsa:Action></soap:Header><soap:Body/></soap:Envelope>"#,
            soap::SOAP_URI,
            soap::WSA_URI,
            soap::WSD_PROBE
        );
        assert!(engine
            .process(&EchoHandler, no_message_id.as_bytes(), udp_source())
            .is_none());

        assert!(engine
            .process(&EchoHandler, b"not xml at all", udp_source())
            .is_none());
    }
}
