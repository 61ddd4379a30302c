//! HTTP side of WSD: the per-endpoint metadata server and the SOAP POST
//! client used for metadata exchange.
//!
//! The server accepts `POST /<device-uuid>` with a SOAP body and hands it
//! to the message engine; everything else is refused. The client issues a
//! single `POST` per exchange, resolving the target address itself so that
//! scoped IPv6 link-local destinations work (`Host` carries the bracketed
//! address without the zone).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::WsdContext;
use crate::message::{ActionHandler, HandlerReply, MessageEngine, MessageSource};
use crate::multicast::MulticastEndpoint;
use crate::soap::{self, escape_xml};

/// Handles `Get` requests arriving over HTTP with the device metadata
pub struct MetadataHandler {
    ctx: Arc<WsdContext>,
}

impl MetadataHandler {
    pub fn new(ctx: Arc<WsdContext>) -> Self {
        MetadataHandler { ctx }
    }
}

impl ActionHandler for MetadataHandler {
    fn handle_action(
        &self,
        action: &str,
        _header: roxmltree::Node,
        _body: roxmltree::Node,
    ) -> Option<HandlerReply> {
        (action == soap::WSD_GET).then(|| HandlerReply {
            body: build_metadata_body(&self.ctx),
            action: soap::WSD_GET_RESPONSE,
        })
    }
}

/// Builds the `wsx:Metadata` document with the ThisDevice, ThisModel and
/// Relationship sections.
pub fn build_metadata_body(ctx: &WsdContext) -> String {
    let config = &ctx.config;
    let hostname = config.hostname();

    let this_device = format!(
        "<wsx:MetadataSection Dialect=\"{wsdp}/ThisDevice\"><wsdp:ThisDevice>\
         <wsdp:FriendlyName>WSD Device {host}</wsdp:FriendlyName>\
         <wsdp:FirmwareVersion>1.0</wsdp:FirmwareVersion>\
         <wsdp:SerialNumber>1</wsdp:SerialNumber>\
         </wsdp:ThisDevice></wsx:MetadataSection>",
        wsdp = soap::WSDP_URI,
        host = escape_xml(hostname)
    );

    let this_model = format!(
        "<wsx:MetadataSection Dialect=\"{wsdp}/ThisModel\"><wsdp:ThisModel>\
         <wsdp:Manufacturer>wsdd</wsdp:Manufacturer>\
         <wsdp:ModelName>wsdd</wsdp:ModelName>\
         <pnpx:DeviceCategory>Computers</pnpx:DeviceCategory>\
         </wsdp:ThisModel></wsx:MetadataSection>",
        wsdp = soap::WSDP_URI
    );

    let relationship = format!(
        "<wsx:MetadataSection Dialect=\"{wsdp}/Relationship\">\
         <wsdp:Relationship Type=\"{wsdp}/host\"><wsdp:Host>\
         {epr}\
         <wsdp:Types>pub:Computer</wsdp:Types>\
         <wsdp:ServiceId>{urn}</wsdp:ServiceId>\
         <pub:Computer>{computer}</pub:Computer>\
         </wsdp:Host></wsdp:Relationship></wsx:MetadataSection>",
        wsdp = soap::WSDP_URI,
        epr = soap::endpoint_reference(&ctx.urn),
        urn = escape_xml(&ctx.urn),
        computer = escape_xml(&computer_entry(
            hostname,
            config.domain.as_deref(),
            &config.workgroup,
            config.preserve_case
        ))
    );

    format!(
        "<wsx:Metadata>{}{}{}</wsx:Metadata>",
        this_device, this_model, relationship
    )
}

/// The `pub:Computer` text: `host/Domain:domain` in domain mode, else
/// `HOST/Workgroup:WORKGROUP`. Case folding is skipped with preserve-case.
pub(crate) fn computer_entry(
    hostname: &str,
    domain: Option<&str>,
    workgroup: &str,
    preserve_case: bool,
) -> String {
    match domain {
        Some(domain) => {
            let host = if preserve_case {
                hostname.to_string()
            } else {
                hostname.to_lowercase()
            };
            format!("{}/Domain:{}", host, domain)
        }
        None => {
            let host = if preserve_case {
                hostname.to_string()
            } else {
                hostname.to_uppercase()
            };
            format!("{}/Workgroup:{}", host, workgroup.to_uppercase())
        }
    }
}

/// Result of routing one HTTP request
enum Route {
    NotFound,
    BadRequest,
    Soap,
}

/// Parsed request line and the headers the server cares about
pub(crate) struct RequestHead {
    pub method: String,
    pub path: String,
    pub content_type: Option<String>,
    pub content_length: Option<usize>,
}

pub(crate) fn parse_request_head(head: &str) -> Option<RequestHead> {
    let mut lines = head.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut content_type = None;
    let mut content_length = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "content-type" => content_type = Some(value.trim().to_string()),
            "content-length" => content_length = value.trim().parse().ok(),
            _ => {}
        }
    }

    Some(RequestHead {
        method,
        path,
        content_type,
        content_length,
    })
}

fn route_request(head: &RequestHead, device_uuid: &str) -> Route {
    if head.method != "POST" || head.path != format!("/{}", device_uuid) {
        return Route::NotFound;
    }

    match &head.content_type {
        Some(ct) if ct.starts_with(soap::MIME_TYPE_SOAP_XML) => Route::Soap,
        _ => Route::BadRequest,
    }
}

/// The WSD metadata HTTP server of one multicast endpoint
pub struct WsdHttpServer {
    accept_task: JoinHandle<()>,
}

impl WsdHttpServer {
    /// Binds the endpoint's listen address (v6-only for IPv6) and starts
    /// accepting requests.
    pub fn bind(mep: &MulticastEndpoint, ctx: Arc<WsdContext>) -> io::Result<Self> {
        let addr = mep.listen_address;
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(16)?;
        socket.set_nonblocking(true)?;
        let listener = TcpListener::from_std(socket.into())?;

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, ctx).await {
                                debug!("error handling HTTP request from {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("error accepting HTTP connection: {}", e);
                    }
                }
            }
        });

        Ok(WsdHttpServer { accept_task })
    }

    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<WsdContext>,
) -> io::Result<()> {
    let (head, mut body) = read_request(&mut stream).await?;

    let Some(head) = parse_request_head(&head) else {
        send_response(&mut stream, "400 Bad Request", "text/plain", b"").await?;
        return Ok(());
    };

    let status = match route_request(&head, &ctx.device_uuid.to_string()) {
        Route::NotFound => {
            send_response(&mut stream, "404 Not Found", "text/plain", b"").await?;
            "404"
        }
        Route::BadRequest => {
            send_response(&mut stream, "400 Bad Request", "text/plain", b"").await?;
            "400"
        }
        Route::Soap => {
            // bound the body by the WSD datagram limit; nothing larger is
            // a valid Get request
            let content_length = head
                .content_length
                .unwrap_or(0)
                .min(crate::multicast::WSD_MAX_LEN);
            if let Some(remaining) = content_length.checked_sub(body.len()) {
                let mut rest = vec![0u8; remaining];
                stream.read_exact(&mut rest).await?;
                body.extend_from_slice(&rest);
            }
            body.truncate(content_length);

            let engine = MessageEngine::new(Arc::clone(&ctx));
            let handler = MetadataHandler::new(Arc::clone(&ctx));
            match engine.process(&handler, &body, MessageSource::Http) {
                Some(response) => {
                    send_response(&mut stream, "200 OK", soap::MIME_TYPE_SOAP_XML, &response)
                        .await?;
                    "200"
                }
                None => {
                    send_response(&mut stream, "400 Bad Request", "text/plain", b"").await?;
                    "400"
                }
            }
        }
    };

    info!("{} - - \"{} {}\" {}", peer.ip(), head.method, head.path, status);
    Ok(())
}

/// Reads until the header/body separator; returns the head as text and any
/// body bytes that were already buffered.
async fn read_request(stream: &mut TcpStream) -> io::Result<(String, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            let head = String::from_utf8_lossy(&buf[..pos]).into_owned();
            let body = buf[pos + 4..].to_vec();
            return Ok((head, body));
        }
        if buf.len() > 64 * 1024 {
            break;
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "incomplete HTTP request",
    ))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn send_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &[u8],
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        content_type,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

/// POSTs a SOAP body and returns the response body.
///
/// The caller resolves the destination socket address (including the v6
/// scope) and provides the `Host` header value separately.
pub async fn soap_post(
    target: SocketAddr,
    host_header: &str,
    path: &str,
    body: &[u8],
    timeout: Duration,
) -> io::Result<Vec<u8>> {
    tokio::time::timeout(timeout, async move {
        let mut stream = TcpStream::connect(target).await?;

        let head = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: wsdd\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            path,
            host_header,
            soap::MIME_TYPE_SOAP_XML,
            body.len()
        );
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(body).await?;
        stream.flush().await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;

        parse_http_response(&response)
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "metadata request timed out"))?
}

fn parse_http_response(response: &[u8]) -> io::Result<Vec<u8>> {
    let header_end = find_header_end(response)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "truncated HTTP response"))?;
    let head = String::from_utf8_lossy(&response[..header_end]);
    let status_line = head.lines().next().unwrap_or("");
    let status = status_line.split_whitespace().nth(1).unwrap_or("");
    if status != "200" {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("HTTP status {}", status_line),
        ));
    }

    let body = &response[header_end + 4..];
    let length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(body.len());

    Ok(body[..length.min(body.len())].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use clap::Parser;

    fn ctx(args: &[&str]) -> WsdContext {
        let mut full = vec!["wsdd", "-U", "11111111-2222-3333-4444-555555555555"];
        full.extend_from_slice(args);
        let config = Config::try_parse_from(full).expect("config should parse");
        WsdContext::new(Arc::new(config))
    }

    #[test]
    fn test_computer_entry_workgroup() {
        assert_eq!(
            computer_entry("Alpha", None, "wg", false),
            "ALPHA/Workgroup:WG"
        );
        assert_eq!(
            computer_entry("Alpha", None, "wg", true),
            "Alpha/Workgroup:WG"
        );
    }

    #[test]
    fn test_computer_entry_domain() {
        assert_eq!(
            computer_entry("Alpha", Some("example.com"), "WORKGROUP", false),
            "alpha/Domain:example.com"
        );
        assert_eq!(
            computer_entry("Alpha", Some("example.com"), "WORKGROUP", true),
            "Alpha/Domain:example.com"
        );
    }

    #[test]
    fn test_metadata_body_sections() {
        let ctx = ctx(&["-n", "alpha", "-w", "WG"]);
        let body = build_metadata_body(&ctx);

        assert!(body.contains("WSD Device alpha"));
        assert!(body.contains("<wsdp:FirmwareVersion>1.0</wsdp:FirmwareVersion>"));
        assert!(body.contains("<wsdp:SerialNumber>1</wsdp:SerialNumber>"));
        assert!(body.contains("<wsdp:Manufacturer>wsdd</wsdp:Manufacturer>"));
        assert!(body.contains("<pnpx:DeviceCategory>Computers</pnpx:DeviceCategory>"));
        assert!(body.contains("urn:uuid:11111111-2222-3333-4444-555555555555"));
        assert!(body.contains("ALPHA/Workgroup:WG"));
    }

    #[test]
    fn test_request_routing() {
        let device_uuid = "11111111-2222-3333-4444-555555555555";

        let soap_head = RequestHead {
            method: "POST".to_string(),
            path: format!("/{}", device_uuid),
            content_type: Some("application/soap+xml; charset=utf-8".to_string()),
            content_length: Some(10),
        };
        assert!(matches!(route_request(&soap_head, device_uuid), Route::Soap));

        let wrong_path = RequestHead {
            path: "/other".to_string(),
            ..soap_head_clone(&soap_head)
        };
        assert!(matches!(
            route_request(&wrong_path, device_uuid),
            Route::NotFound
        ));

        let wrong_type = RequestHead {
            content_type: Some("text/plain".to_string()),
            ..soap_head_clone(&soap_head)
        };
        assert!(matches!(
            route_request(&wrong_type, device_uuid),
            Route::BadRequest
        ));

        let missing_type = RequestHead {
            content_type: None,
            ..soap_head_clone(&soap_head)
        };
        assert!(matches!(
            route_request(&missing_type, device_uuid),
            Route::BadRequest
        ));

        let get = RequestHead {
            method: "GET".to_string(),
            ..soap_head_clone(&soap_head)
        };
        assert!(matches!(route_request(&get, device_uuid), Route::NotFound));
    }

    fn soap_head_clone(head: &RequestHead) -> RequestHead {
        RequestHead {
            method: head.method.clone(),
            path: head.path.clone(),
            content_type: head.content_type.clone(),
            content_length: head.content_length,
        }
    }

    #[test]
    fn test_parse_request_head() {
        let head = parse_request_head(
            "POST /abc HTTP/1.1\r\nHost: x\r\nContent-Type: application/soap+xml\r\nContent-Length: 42\r\n",
        )
        .expect("head should parse");
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/abc");
        assert_eq!(head.content_type.as_deref(), Some("application/soap+xml"));
        assert_eq!(head.content_length, Some(42));

        assert!(parse_request_head("").is_none());
    }

    #[test]
    fn test_parse_http_response() {
        let ok = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(parse_http_response(ok).expect("ok"), b"hello");

        let not_found = b"HTTP/1.1 404 Not Found\r\n\r\n";
        assert!(parse_http_response(not_found).is_err());

        let truncated = b"HTTP/1.1 200 OK";
        assert!(parse_http_response(truncated).is_err());
    }
}
