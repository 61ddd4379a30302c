//! SOAP envelope construction and parsing for WS-Discovery.
//!
//! Messages are built from formatted templates with all known namespace
//! prefixes declared on the envelope root. Parsing goes through
//! `roxmltree`, which refuses DTDs and external entities, so incoming
//! XML cannot smuggle entity expansions past the daemon.

use std::sync::OnceLock;

use rand::RngCore;
use uuid::Uuid;

/// WS-Addressing namespace URI
pub const WSA_URI: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
/// WS-Discovery namespace URI
pub const WSD_URI: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery";
/// Devices Profile for Web Services namespace URI
pub const WSDP_URI: &str = "http://schemas.xmlsoap.org/ws/2006/02/devprof";
/// WS-MetadataExchange namespace URI
pub const WSX_URI: &str = "http://schemas.xmlsoap.org/ws/2004/09/mex";
/// SOAP 1.2 envelope namespace URI
pub const SOAP_URI: &str = "http://www.w3.org/2003/05/soap-envelope";
/// Windows PnP-X namespace URI
pub const PNPX_URI: &str = "http://schemas.microsoft.com/windows/pnpx/2005/10";
/// Windows publishing namespace URI
pub const PUB_URI: &str = "http://schemas.microsoft.com/windows/pub/2005/07";

/// Prefix table declared on every envelope root
pub const NAMESPACES: [(&str, &str); 7] = [
    ("soap", SOAP_URI),
    ("wsa", WSA_URI),
    ("wsd", WSD_URI),
    ("wsx", WSX_URI),
    ("wsdp", WSDP_URI),
    ("pnpx", PNPX_URI),
    ("pub", PUB_URI),
];

// WS-Discovery action URIs
pub const WSD_PROBE: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe";
pub const WSD_PROBE_MATCH: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery/ProbeMatches";
pub const WSD_RESOLVE: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery/Resolve";
pub const WSD_RESOLVE_MATCH: &str =
    "http://schemas.xmlsoap.org/ws/2005/04/discovery/ResolveMatches";
pub const WSD_HELLO: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery/Hello";
pub const WSD_BYE: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery/Bye";
pub const WSD_GET: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Get";
pub const WSD_GET_RESPONSE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/GetResponse";

/// Anonymous reply endpoint
pub const WSA_ANON: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";
/// Well-known discovery To address
pub const WSA_DISCOVERY: &str = "urn:schemas-xmlsoap-org:ws:2005:04:discovery";

pub const WSD_TYPE_DEVICE: &str = "wsdp:Device";
pub const PUB_COMPUTER: &str = "pub:Computer";
pub const WSD_TYPE_DEVICE_COMPUTER: &str = "wsdp:Device pub:Computer";

pub const MIME_TYPE_SOAP_XML: &str = "application/soap+xml";

/// Generates a fresh time-based message URN (`urn:uuid:...`)
pub fn new_message_urn() -> String {
    static NODE_ID: OnceLock<[u8; 6]> = OnceLock::new();
    let node = NODE_ID.get_or_init(|| {
        let mut node = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut node);
        // multicast bit marks a locally generated node id
        node[0] |= 0x01;
        node
    });

    static CONTEXT: uuid::ContextV1 = uuid::ContextV1::new(0);
    let ts = uuid::Timestamp::now(&CONTEXT);
    format!("{}", Uuid::new_v1(ts, node).urn())
}

/// Escapes a string for use in XML text or attribute content
pub fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Builder for WSD SOAP envelopes
///
/// A message is addressed (`To`, `Action`, fresh `MessageID`), optionally
/// correlated to a request via `RelatesTo`, extended with role-specific
/// header elements and completed with a body fragment.
pub struct SoapEnvelope {
    to: String,
    action: String,
    message_id: String,
    relates_to: Option<String>,
    header_extra: String,
    body: String,
}

impl SoapEnvelope {
    pub fn new(to: &str, action: &str) -> Self {
        SoapEnvelope {
            to: to.to_string(),
            action: action.to_string(),
            message_id: new_message_urn(),
            relates_to: None,
            header_extra: String::new(),
            body: String::new(),
        }
    }

    pub fn relates_to(mut self, message_id: &str) -> Self {
        self.relates_to = Some(message_id.to_string());
        self
    }

    pub fn header_extra(mut self, xml: &str) -> Self {
        self.header_extra = xml.to_string();
        self
    }

    pub fn body(mut self, xml: &str) -> Self {
        self.body = xml.to_string();
        self
    }

    /// The generated `MessageID` URN of this envelope
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Serializes the envelope, prefixed with the XML declaration
    pub fn build(&self) -> Vec<u8> {
        let mut ns_decls = String::new();
        for (prefix, uri) in NAMESPACES {
            ns_decls.push_str(&format!(" xmlns:{}=\"{}\"", prefix, uri));
        }

        let relates_to = match &self.relates_to {
            Some(id) => format!("<wsa:RelatesTo>{}</wsa:RelatesTo>", escape_xml(id)),
            None => String::new(),
        };

        format!(
            r#"<?xml version="1.0" encoding="utf-8"?><soap:Envelope{}><soap:Header><wsa:To>{}</wsa:To><wsa:Action>{}</wsa:Action><wsa:MessageID>{}</wsa:MessageID>{}{}</soap:Header><soap:Body>{}</soap:Body></soap:Envelope>"#,
            ns_decls,
            escape_xml(&self.to),
            escape_xml(&self.action),
            escape_xml(&self.message_id),
            relates_to,
            self.header_extra,
            self.body
        )
        .into_bytes()
    }
}

// shortcuts for the fragments shared by several WSD message bodies

pub fn endpoint_reference(endpoint: &str) -> String {
    format!(
        "<wsa:EndpointReference><wsa:Address>{}</wsa:Address></wsa:EndpointReference>",
        escape_xml(endpoint)
    )
}

pub fn metadata_version() -> &'static str {
    "<wsd:MetadataVersion>1</wsd:MetadataVersion>"
}

pub fn types_element(types: &str) -> String {
    format!("<wsd:Types>{}</wsd:Types>", escape_xml(types))
}

pub fn xaddrs_element(transport_address: &str, device_uuid: &Uuid) -> String {
    format!(
        "<wsd:XAddrs>http://{}:{}/{}</wsd:XAddrs>",
        transport_address,
        crate::multicast::WSD_HTTP_PORT,
        device_uuid
    )
}

/// A parsed inbound SOAP envelope
pub struct Envelope<'a> {
    doc: roxmltree::Document<'a>,
}

impl<'a> Envelope<'a> {
    /// Parses an envelope; DTDs and external entities are rejected by the
    /// underlying parser.
    pub fn parse(input: &'a str) -> Result<Self, roxmltree::Error> {
        let doc = roxmltree::Document::parse(input)?;
        Ok(Envelope { doc })
    }

    pub fn header(&self) -> Option<roxmltree::Node<'_, 'a>> {
        element_child(self.doc.root_element(), SOAP_URI, "Header")
    }

    pub fn body(&self) -> Option<roxmltree::Node<'_, 'a>> {
        element_child(self.doc.root_element(), SOAP_URI, "Body")
    }

    pub fn action(&self) -> Option<&str> {
        self.header_text(WSA_URI, "Action")
    }

    pub fn message_id(&self) -> Option<&str> {
        self.header_text(WSA_URI, "MessageID")
    }

    pub fn relates_to(&self) -> Option<&str> {
        self.header_text(WSA_URI, "RelatesTo")
    }

    pub fn to(&self) -> Option<&str> {
        self.header_text(WSA_URI, "To")
    }

    fn header_text(&self, ns: &str, name: &str) -> Option<&str> {
        child_text(self.header()?, ns, name)
    }
}

/// First element child with the given namespace and local name
pub fn element_child<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    ns: &str,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.children().find(|n| {
        n.is_element() && n.tag_name().name() == name && n.tag_name().namespace() == Some(ns)
    })
}

/// Trimmed text content of a named element child
pub fn child_text<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    ns: &str,
    name: &str,
) -> Option<&'a str> {
    element_child(node, ns, name)?.text().map(str::trim)
}

/// Descends along a path of (namespace, name) pairs
pub fn element_path<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    path: &[(&str, &str)],
) -> Option<roxmltree::Node<'a, 'input>> {
    let mut current = node;
    for (ns, name) in path {
        current = element_child(current, ns, name)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_then_parse_round_trip() {
        let envelope = SoapEnvelope::new(WSA_DISCOVERY, WSD_PROBE)
            .relates_to("urn:uuid:aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee")
            .body("<wsd:Probe><wsd:Types>wsdp:Device</wsd:Types></wsd:Probe>");
        let message_id = envelope.message_id().to_string();

        let raw = envelope.build();
        let text = std::str::from_utf8(&raw).expect("message should be utf-8");
        let parsed = Envelope::parse(text).expect("built message should parse");

        assert_eq!(parsed.to(), Some(WSA_DISCOVERY));
        assert_eq!(parsed.action(), Some(WSD_PROBE));
        assert_eq!(parsed.message_id(), Some(message_id.as_str()));
        assert_eq!(
            parsed.relates_to(),
            Some("urn:uuid:aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee")
        );

        let body = parsed.body().expect("body present");
        let probe = element_child(body, WSD_URI, "Probe").expect("probe present");
        assert_eq!(child_text(probe, WSD_URI, "Types"), Some("wsdp:Device"));
    }

    #[test]
    fn test_message_ids_are_unique_urns() {
        let first = new_message_urn();
        let second = new_message_urn();
        assert!(first.starts_with("urn:uuid:"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&apos;");
        assert_eq!(escape_xml("plain"), "plain");
    }

    #[test]
    fn test_dtd_rejected() {
        let evil = r#"<?xml version="1.0"?><!DOCTYPE r [<!ENTITY x SYSTEM "file:///etc/passwd">]><r>&x;</r>"#;
        assert!(Envelope::parse(evil).is_err());
    }

    #[test]
    fn test_namespace_declarations_on_root() {
        let raw = SoapEnvelope::new(WSA_DISCOVERY, WSD_HELLO).build();
        let text = String::from_utf8(raw).expect("utf-8");
        for (prefix, uri) in NAMESPACES {
            assert!(text.contains(&format!("xmlns:{}=\"{}\"", prefix, uri)));
        }
        assert!(text.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
    }

    #[test]
    fn test_element_path() {
        let xml = format!(
            r#"<root xmlns:wsd="{}" xmlns:wsa="{}"><wsd:ProbeMatches><wsd:ProbeMatch><wsa:EndpointReference><wsa:Address>urn:uuid:x</wsa:Address></wsa:EndpointReference></wsd:ProbeMatch></wsd:ProbeMatches></root>"#,
            WSD_URI, WSA_URI
        );
        let doc = roxmltree::Document::parse(&xml).expect("parse");
        let address = element_path(
            doc.root_element(),
            &[
                (WSD_URI, "ProbeMatches"),
                (WSD_URI, "ProbeMatch"),
                (WSA_URI, "EndpointReference"),
                (WSA_URI, "Address"),
            ],
        )
        .expect("path resolves");
        assert_eq!(address.text(), Some("urn:uuid:x"));
    }
}
