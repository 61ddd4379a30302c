//! The address monitor: watches kernel address-change events and drives
//! the lifecycle of multicast endpoints and their attached roles.
//!
//! The OS-specific event sources (rtnetlink on Linux, the routing socket
//! on the BSDs) feed a shared core that filters addresses, creates an
//! endpoint per handled `(family, address, interface)` triple and tears
//! everything down again when addresses disappear or the daemon stops.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::ClientRole;
use crate::config::Config;
use crate::context::WsdContext;
use crate::host::HostRole;
use crate::http::WsdHttpServer;
use crate::multicast::{AddressFamily, Interface, MulticastEndpoint};
use crate::registry::DeviceRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressEventKind {
    New,
    Deleted,
}

/// An address change as reported by an OS event source. The interface may
/// arrive without a name (typical for v6-only events); the monitor resolves
/// it from the index.
#[derive(Debug, Clone)]
pub struct RawAddressEvent {
    pub kind: AddressEventKind,
    pub family: AddressFamily,
    pub address: IpAddr,
    pub if_index: u32,
    pub if_scope: u32,
    pub if_label: Option<String>,
}

/// The platform event source feeding the monitor
pub enum AddressSource {
    #[cfg(target_os = "linux")]
    Netlink(crate::netlink::NetlinkSource),
    #[cfg(any(
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly",
        target_os = "macos"
    ))]
    Route(crate::route_bsd::RouteSocketSource),
}

impl AddressSource {
    /// Opens the source matching the build platform
    pub fn open(config: &Config) -> io::Result<Self> {
        #[cfg(target_os = "linux")]
        {
            Ok(AddressSource::Netlink(crate::netlink::NetlinkSource::new(
                config.ipv4only,
                config.ipv6only,
            )?))
        }
        #[cfg(any(
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly",
            target_os = "macos"
        ))]
        {
            let _ = config;
            Ok(AddressSource::Route(
                crate::route_bsd::RouteSocketSource::new()?,
            ))
        }
        #[cfg(not(any(
            target_os = "linux",
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly",
            target_os = "macos"
        )))]
        {
            let _ = config;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "no address monitor for this platform",
            ))
        }
    }

    /// Asks the kernel for the current address list. Events either come
    /// back through the socket (netlink) or are returned directly (sysctl).
    pub fn request_enumeration(&self) -> io::Result<Vec<RawAddressEvent>> {
        match self {
            #[cfg(target_os = "linux")]
            AddressSource::Netlink(source) => {
                source.request_dump()?;
                Ok(Vec::new())
            }
            #[cfg(any(
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd",
                target_os = "dragonfly",
                target_os = "macos"
            ))]
            AddressSource::Route(source) => source.enumerate(),
        }
    }

    pub async fn recv_events(&self) -> io::Result<Vec<RawAddressEvent>> {
        match self {
            #[cfg(target_os = "linux")]
            AddressSource::Netlink(source) => source.recv_events().await,
            #[cfg(any(
                target_os = "freebsd",
                target_os = "openbsd",
                target_os = "netbsd",
                target_os = "dragonfly",
                target_os = "macos"
            ))]
            AddressSource::Route(source) => source.recv_events().await,
        }
    }
}

/// A multicast endpoint with the role instances attached to it
struct EndpointSet {
    mep: Arc<MulticastEndpoint>,
    host: Option<Arc<HostRole>>,
    client: Option<Arc<ClientRole>>,
    http: Option<WsdHttpServer>,
}

struct MonitorState {
    interfaces: HashMap<u32, Interface>,
    endpoints: Vec<EndpointSet>,
}

pub struct AddressMonitor {
    ctx: Arc<WsdContext>,
    registry: Arc<DeviceRegistry>,
    source: AddressSource,
    active: AtomicBool,
    state: Mutex<MonitorState>,
}

impl AddressMonitor {
    pub fn new(ctx: Arc<WsdContext>, registry: Arc<DeviceRegistry>) -> io::Result<Arc<Self>> {
        let source = AddressSource::open(&ctx.config)?;
        Ok(Arc::new(AddressMonitor {
            ctx,
            registry,
            source,
            active: AtomicBool::new(false),
            state: Mutex::new(MonitorState {
                interfaces: HashMap::new(),
                endpoints: Vec::new(),
            }),
        }))
    }

    /// Starts watching for address changes
    pub fn spawn_event_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match monitor.source.recv_events().await {
                    Ok(events) => {
                        for event in events {
                            monitor.handle_event(event);
                        }
                    }
                    Err(e) => {
                        warn!("address monitor receive error: {}", e);
                        break;
                    }
                }
            }
        })
    }

    /// Performs the initial enumeration and enables address handling
    pub fn enumerate(&self) -> io::Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for event in self.source.request_enumeration()? {
            self.handle_event(event);
        }
        Ok(())
    }

    pub fn handle_event(&self, event: RawAddressEvent) {
        let Some(interface) = self.resolve_interface(&event) else {
            debug!("unknown interface index: {}", event.if_index);
            return;
        };

        match event.kind {
            AddressEventKind::New => {
                self.handle_new_address(event.family, event.address, &interface)
            }
            AddressEventKind::Deleted => {
                self.handle_deleted_address(event.family, event.address, &interface)
            }
        }
    }

    /// Registers or refreshes the interface named by the event; falls back
    /// to an index lookup when the event carried no name.
    fn resolve_interface(&self, event: &RawAddressEvent) -> Option<Interface> {
        let mut state = self.state.lock().expect("monitor state lock poisoned");

        if let Some(label) = &event.if_label {
            let interface = state
                .interfaces
                .entry(event.if_index)
                .or_insert_with(|| {
                    Interface::new(event.if_index, label.clone(), event.if_scope)
                });
            interface.name = label.clone();
            return Some(interface.clone());
        }

        if let Some(interface) = state.interfaces.get(&event.if_index) {
            return Some(interface.clone());
        }

        // typical for v6-only setups: no label attribute, ask the OS
        debug!(
            "unknown interface name for idx {}. resolving manually",
            event.if_index
        );
        let name = interface_name_for_index(event.if_index)?;
        let interface = Interface::new(event.if_index, name, event.if_scope);
        state.interfaces.insert(event.if_index, interface.clone());
        Some(interface)
    }

    fn handle_new_address(&self, family: AddressFamily, address: IpAddr, interface: &Interface) {
        debug!("new address {} on {}", address, interface.name);

        if !self.active.load(Ordering::SeqCst)
            || !is_handled_address(&self.ctx.config, family, address, interface)
        {
            debug!("ignoring that address on {}", interface.name);
            return;
        }

        let config = &self.ctx.config;
        let mut state = self.state.lock().expect("monitor state lock poisoned");

        // one endpoint per address family and network interface
        if state
            .endpoints
            .iter()
            .any(|set| set.mep.handles(family, address, interface))
        {
            return;
        }

        debug!("handling traffic for {} on {}", address, interface.name);
        let mep = match MulticastEndpoint::new(address, interface, config.hoplimit) {
            Ok(mep) => mep,
            Err(e) => {
                warn!(
                    "cannot create endpoint for {} on {}: {}",
                    address, interface.name, e
                );
                return;
            }
        };

        let mut set = EndpointSet {
            mep: Arc::clone(&mep),
            host: None,
            client: None,
            http: None,
        };

        if !config.no_host {
            set.host = Some(HostRole::new(Arc::clone(&mep), Arc::clone(&self.ctx)));
            if !config.no_http {
                match WsdHttpServer::bind(&mep, Arc::clone(&self.ctx)) {
                    Ok(server) => set.http = Some(server),
                    Err(e) => warn!(
                        "cannot start HTTP server on {}: {}",
                        mep.listen_address, e
                    ),
                }
            }
        }

        if config.discovery {
            set.client = Some(ClientRole::new(
                Arc::clone(&mep),
                Arc::clone(&self.ctx),
                Arc::clone(&self.registry),
            ));
        }

        mep.start();
        state.endpoints.push(set);
    }

    /// Detaches and closes everything bound to the vanished address. No
    /// `Bye` is sent; the address is already gone.
    fn handle_deleted_address(
        &self,
        family: AddressFamily,
        address: IpAddr,
        interface: &Interface,
    ) {
        info!("deleted address {} on {}", address, interface.name);

        if !self.active.load(Ordering::SeqCst)
            || !is_handled_address(&self.ctx.config, family, address, interface)
        {
            return;
        }

        let mut state = self.state.lock().expect("monitor state lock poisoned");
        let Some(pos) = state
            .endpoints
            .iter()
            .position(|set| set.mep.handles(family, address, interface))
        else {
            return;
        };

        let set = state.endpoints.remove(pos);
        if let Some(client) = &set.client {
            client.teardown();
        }
        if let Some(http) = &set.http {
            http.shutdown();
        }
        set.mep.shutdown();
    }

    /// Stops address handling: hosts say `Bye`, their retransmits are
    /// awaited, then all endpoints close.
    pub async fn teardown(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        let endpoints: Vec<EndpointSet> = {
            let mut state = self.state.lock().expect("monitor state lock poisoned");
            state.endpoints.drain(..).collect()
        };

        let mut pending = Vec::new();
        for set in &endpoints {
            if let Some(host) = &set.host {
                pending.extend(host.teardown());
            }
            if let Some(client) = &set.client {
                client.teardown();
            }
            if let Some(http) = &set.http {
                http.shutdown();
            }
        }

        // wait for the Bye messages before the sockets go away
        for task in pending {
            let _ = task.await;
        }

        for set in endpoints {
            set.mep.shutdown();
        }
    }

    /// Client roles, optionally restricted to one interface name
    pub fn clients(&self, interface: Option<&str>) -> Vec<Arc<ClientRole>> {
        let state = self.state.lock().expect("monitor state lock poisoned");
        state
            .endpoints
            .iter()
            .filter_map(|set| set.client.clone())
            .filter(|client| {
                interface
                    .map(|name| client.interface_name() == name)
                    .unwrap_or(true)
            })
            .collect()
    }
}

/// Address filter: family restrictions, no v4 loopback, v6 link-local
/// only, and the optional interface/address allowlist.
pub(crate) fn is_handled_address(
    config: &Config,
    family: AddressFamily,
    address: IpAddr,
    interface: &Interface,
) -> bool {
    if !config.handles_family(family) {
        return false;
    }

    match address {
        IpAddr::V4(v4) => {
            if v4.octets()[0] == 127 {
                return false;
            }
        }
        IpAddr::V6(v6) => {
            if v6.segments()[0] != 0xfe80 {
                return false;
            }
        }
    }

    if !config.interface.is_empty() {
        let addr_str = address.to_string();
        if !config
            .interface
            .iter()
            .any(|entry| entry == &interface.name || entry == &addr_str)
        {
            return false;
        }
    }

    true
}

fn interface_name_for_index(index: u32) -> Option<String> {
    let mut buf = [0u8; libc::IF_NAMESIZE];
    // SAFETY: buf provides the IF_NAMESIZE bytes if_indextoname may write,
    // including the NUL terminator.
    let ret = unsafe { libc::if_indextoname(index, buf.as_mut_ptr() as *mut libc::c_char) };
    if ret.is_null() {
        return None;
    }

    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Some(String::from_utf8_lossy(&buf[..end]).into_owned())
}
