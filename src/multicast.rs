//! Per-interface multicast endpoints.
//!
//! A `MulticastEndpoint` owns the three sockets WSD needs on one
//! `(family, address, interface)` triple: a receive socket joined to the
//! discovery group, a multicast send socket with interface affinity, and a
//! unicast send socket bound to the WSD port so replies originate from the
//! well-known port. Inbound datagrams are demultiplexed to the handlers
//! registered for the socket they arrived on.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::{Arc, Mutex};

use socket2::{Domain, InterfaceIndexOrAddress, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// WSD protocol port assignments
pub const WSD_UDP_PORT: u16 = 3702;
pub const WSD_HTTP_PORT: u16 = 5357;

/// Maximum size of a WSD datagram
pub const WSD_MAX_LEN: usize = 32767;

pub const WSD_MCAST_GRP_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
/// Link-local discovery group
pub const WSD_MCAST_GRP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xc);

/// Flow info used for the v6 discovery destination
const WSD_MCAST_FLOWINFO: u32 = 0x575C;

/// An OS network interface as observed by the address monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub index: u32,
    pub name: String,
    pub scope: u32,
}

impl Interface {
    pub fn new(index: u32, name: String, scope: u32) -> Self {
        Interface { index, name, scope }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

/// The socket a datagram arrived on, used as demux key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketRole {
    Receive,
    MulticastSend,
    UnicastSend,
}

/// Receiver of demultiplexed datagrams.
///
/// Implementations must not block; longer work is enqueued onto tasks.
pub trait DatagramHandler: Send + Sync {
    fn handle_datagram(&self, msg: &[u8], src: SocketAddr);
}

pub struct MulticastEndpoint {
    pub family: AddressFamily,
    pub address: IpAddr,
    pub interface: Interface,
    /// Discovery group destination for this endpoint
    pub multicast_address: SocketAddr,
    /// Address the HTTP metadata server binds to
    pub listen_address: SocketAddr,
    /// Address form usable inside a URL (`addr` or `[addr]`)
    pub transport_address: String,
    recv_socket: Arc<UdpSocket>,
    mc_send_socket: Arc<UdpSocket>,
    uc_send_socket: Arc<UdpSocket>,
    handlers: Mutex<HashMap<SocketRole, Vec<Arc<dyn DatagramHandler>>>>,
    reader_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MulticastEndpoint {
    /// Creates the three sockets for the given address and interface.
    ///
    /// Must run inside the tokio runtime, as the configured sockets are
    /// registered with the reactor.
    pub fn new(address: IpAddr, interface: &Interface, hoplimit: u32) -> io::Result<Arc<Self>> {
        let endpoint = match address {
            IpAddr::V4(v4) => Self::init_v4(v4, interface, hoplimit)?,
            IpAddr::V6(v6) => Self::init_v6(v6, interface, hoplimit)?,
        };

        info!(
            "joined multicast group {} on {}%{}",
            endpoint.multicast_address, endpoint.address, endpoint.interface.name
        );
        debug!(
            "transport address on {} is {}",
            endpoint.interface.name, endpoint.transport_address
        );
        debug!(
            "will listen for HTTP traffic on address {}",
            endpoint.listen_address
        );

        Ok(endpoint)
    }

    fn init_v4(address: Ipv4Addr, interface: &Interface, hoplimit: u32) -> io::Result<Arc<Self>> {
        let multicast_address =
            SocketAddr::V4(SocketAddrV4::new(WSD_MCAST_GRP_V4, WSD_UDP_PORT));

        let recv = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        recv.set_reuse_address(true)?;
        recv.join_multicast_v4_n(
            &WSD_MCAST_GRP_V4,
            &InterfaceIndexOrAddress::Index(interface.index),
        )?;
        disable_multicast_all(&recv, AddressFamily::V4);
        // bind to the group; some systems refuse that, fall back to wildcard
        let group_bind = SocketAddr::V4(SocketAddrV4::new(WSD_MCAST_GRP_V4, WSD_UDP_PORT));
        if recv.bind(&group_bind.into()).is_err() {
            let wildcard = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, WSD_UDP_PORT));
            recv.bind(&wildcard.into())?;
        }

        let uc_send = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        uc_send.set_reuse_address(true)?;
        uc_send.bind(&SocketAddr::V4(SocketAddrV4::new(address, WSD_UDP_PORT)).into())?;

        let mc_send = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        mc_send.set_multicast_if_v4(&address)?;
        mc_send.set_multicast_loop_v4(false)?;
        mc_send.set_multicast_ttl_v4(hoplimit)?;
        mc_send.bind(&SocketAddr::V4(SocketAddrV4::new(address, 0)).into())?;

        Ok(Arc::new(MulticastEndpoint {
            family: AddressFamily::V4,
            address: IpAddr::V4(address),
            interface: interface.clone(),
            multicast_address,
            listen_address: SocketAddr::V4(SocketAddrV4::new(address, WSD_HTTP_PORT)),
            transport_address: address.to_string(),
            recv_socket: Arc::new(into_tokio(recv)?),
            mc_send_socket: Arc::new(into_tokio(mc_send)?),
            uc_send_socket: Arc::new(into_tokio(uc_send)?),
            handlers: Mutex::new(HashMap::new()),
            reader_tasks: Mutex::new(Vec::new()),
        }))
    }

    fn init_v6(address: Ipv6Addr, interface: &Interface, hoplimit: u32) -> io::Result<Arc<Self>> {
        let idx = interface.index;
        let multicast_address = SocketAddr::V6(SocketAddrV6::new(
            WSD_MCAST_GRP_V6,
            WSD_UDP_PORT,
            WSD_MCAST_FLOWINFO,
            idx,
        ));

        let recv = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        recv.set_only_v6(true)?;
        recv.set_reuse_address(true)?;
        recv.join_multicast_v6(&WSD_MCAST_GRP_V6, idx)?;
        disable_multicast_all(&recv, AddressFamily::V6);
        // bind to the group with the interface scope, see Stevens: UNP 21.6
        let group_bind =
            SocketAddr::V6(SocketAddrV6::new(WSD_MCAST_GRP_V6, WSD_UDP_PORT, 0, idx));
        if recv.bind(&group_bind.into()).is_err() {
            let wildcard =
                SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, WSD_UDP_PORT, 0, idx));
            recv.bind(&wildcard.into())?;
        }

        let uc_send = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        uc_send.set_reuse_address(true)?;
        uc_send.bind(&SocketAddr::V6(SocketAddrV6::new(address, WSD_UDP_PORT, 0, idx)).into())?;

        let mc_send = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        mc_send.set_multicast_if_v6(idx)?;
        mc_send.set_multicast_loop_v6(false)?;
        mc_send.set_multicast_hops_v6(hoplimit)?;
        mc_send.bind(&SocketAddr::V6(SocketAddrV6::new(address, 0, 0, idx)).into())?;

        Ok(Arc::new(MulticastEndpoint {
            family: AddressFamily::V6,
            address: IpAddr::V6(address),
            interface: interface.clone(),
            multicast_address,
            listen_address: SocketAddr::V6(SocketAddrV6::new(address, WSD_HTTP_PORT, 0, idx)),
            transport_address: format!("[{}]", address),
            recv_socket: Arc::new(into_tokio(recv)?),
            mc_send_socket: Arc::new(into_tokio(mc_send)?),
            uc_send_socket: Arc::new(into_tokio(uc_send)?),
            handlers: Mutex::new(HashMap::new()),
            reader_tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Whether this endpoint serves the given triple
    pub fn handles(&self, family: AddressFamily, address: IpAddr, interface: &Interface) -> bool {
        self.family == family && self.address == address && self.interface.name == interface.name
    }

    /// Registers a handler for datagrams arriving on one of the sockets.
    /// Handlers on the same socket run in registration order.
    pub fn add_handler(&self, role: SocketRole, handler: Arc<dyn DatagramHandler>) {
        self.handlers
            .lock()
            .expect("handler table lock poisoned")
            .entry(role)
            .or_default()
            .push(handler);
    }

    pub fn clear_handlers(&self) {
        self.handlers
            .lock()
            .expect("handler table lock poisoned")
            .clear();
    }

    /// Spawns the reader task for each socket. Handlers registered before
    /// this call are guaranteed to see every datagram.
    pub fn start(self: &Arc<Self>) {
        let sockets = [
            (SocketRole::Receive, Arc::clone(&self.recv_socket)),
            (SocketRole::MulticastSend, Arc::clone(&self.mc_send_socket)),
            (SocketRole::UnicastSend, Arc::clone(&self.uc_send_socket)),
        ];

        let mut tasks = self.reader_tasks.lock().expect("reader task lock poisoned");
        for (role, socket) in sockets {
            let endpoint = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; WSD_MAX_LEN];
                loop {
                    match socket.recv_from(&mut buf).await {
                        Ok((len, src)) => endpoint.dispatch(role, &buf[..len], src),
                        Err(e) => {
                            warn!(
                                "receive error on {} ({:?}): {}",
                                endpoint.interface.name, role, e
                            );
                        }
                    }
                }
            }));
        }
    }

    fn dispatch(&self, role: SocketRole, msg: &[u8], src: SocketAddr) {
        let handlers = {
            let table = self.handlers.lock().expect("handler table lock poisoned");
            table.get(&role).cloned().unwrap_or_default()
        };
        for handler in handlers {
            handler.handle_datagram(msg, src);
        }
    }

    /// Sends a datagram, choosing the socket by destination: the discovery
    /// group goes out via the multicast send socket, everything else is
    /// answered from the WSD port.
    pub async fn send(&self, msg: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if addr == self.multicast_address {
            self.mc_send_socket.send_to(msg, addr).await
        } else {
            self.uc_send_socket.send_to(msg, addr).await
        }
    }

    /// Stops the reader tasks and drops all registered handlers
    pub fn shutdown(&self) {
        for task in self
            .reader_tasks
            .lock()
            .expect("reader task lock poisoned")
            .drain(..)
        {
            task.abort();
        }
        self.clear_handlers();
    }
}

fn into_tokio(socket: Socket) -> io::Result<UdpSocket> {
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Prevents the receive socket from seeing traffic of groups joined on
/// other sockets of the process. Linux-only behavior; elsewhere the
/// per-interface joins are sufficient.
#[cfg(target_os = "linux")]
fn disable_multicast_all(socket: &Socket, family: AddressFamily) {
    use std::os::fd::AsRawFd;

    // not exposed by socket2; values from in.h/in6.h
    const IP_MULTICAST_ALL: libc::c_int = 49;
    const IPV6_MULTICAST_ALL: libc::c_int = 29;

    let (level, option) = match family {
        AddressFamily::V4 => (libc::IPPROTO_IP, IP_MULTICAST_ALL),
        AddressFamily::V6 => (libc::IPPROTO_IPV6, IPV6_MULTICAST_ALL),
    };

    let off: libc::c_int = 0;
    // SAFETY: the fd is a valid open socket and the option value is a plain
    // int living on the stack for the duration of the call.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            option,
            &off as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        // supported starting from Linux 4.20 for IPv6
        warn!(
            "cannot unset all_multicast: {}",
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn disable_multicast_all(_socket: &Socket, _family: AddressFamily) {}
