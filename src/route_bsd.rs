//! BSD route socket address event source.
//!
//! Live events arrive on an `AF_ROUTE` raw socket; the initial enumeration
//! uses the `NET_RT_IFLIST` sysctl. Both produce the same stream of
//! `rt_msghdr`-framed records, so a single stateful parser handles them.
//! Interfaces that are loopback or multicast-incapable are blacklisted via
//! their `RTM_IFINFO` flags.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::debug;

use crate::monitor::{AddressEventKind, RawAddressEvent};
use crate::multicast::{AddressFamily, Interface};

// from sys/net/route.h
const RTM_NEWADDR: u8 = 0xC;
const RTM_DELADDR: u8 = 0xD;
const RTM_IFINFO: u8 = 0xE;
const RTA_IFA: u32 = 0x20;

// from sys/net/if.h
const IFF_LOOPBACK: u32 = 0x8;
const IFF_MULTICAST: u32 = 0x800;

// from sys/socket.h
#[allow(dead_code)]
const CTL_NET: libc::c_int = 4;
#[allow(dead_code)]
const NET_RT_IFLIST: libc::c_int = 3;

#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    target_os = "macos"
))]
const AF_LINK: u8 = libc::AF_LINK as u8;
#[cfg(not(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    target_os = "macos"
)))]
const AF_LINK: u8 = 18;

/// sockaddr records are aligned to the native long size
fn sa_align() -> usize {
    std::mem::size_of::<libc::c_long>()
}

fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_ne_bytes(
        buf.get(offset..offset + 2)?.try_into().ok()?,
    ))
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_ne_bytes(
        buf.get(offset..offset + 4)?.try_into().ok()?,
    ))
}

/// Stateful parser for route socket and sysctl record streams
pub struct RouteParser {
    interfaces: HashMap<u32, Interface>,
    blacklist: HashSet<String>,
}

impl Default for RouteParser {
    fn default() -> Self {
        RouteParser::new()
    }
}

impl RouteParser {
    pub fn new() -> Self {
        RouteParser {
            interfaces: HashMap::new(),
            blacklist: HashSet::new(),
        }
    }

    fn add_interface(&mut self, name: String, index: u32) -> Interface {
        let interface = self
            .interfaces
            .entry(index)
            .or_insert_with(|| Interface::new(index, name.clone(), index));
        interface.name = name;
        interface.clone()
    }

    /// Parses a stream of `rt_msghdr`/`ifa_msghdr`/`if_msghdr` records.
    ///
    /// For sysctl data the link sockaddr and the address sockaddrs of one
    /// interface group co-exist across records, so the interface context is
    /// preserved; for live route socket reads it is per-message.
    pub fn parse(&mut self, buf: &[u8], keep_interface_context: bool) -> Vec<RawAddressEvent> {
        let mut events = Vec::new();
        let mut offset = 0;
        let mut interface: Option<Interface> = None;
        let mut interface_flags: u32 = 0;

        while offset + 12 <= buf.len() {
            let Some(rtm_len) = read_u16(buf, offset).map(|l| l as usize) else {
                break;
            };
            if rtm_len == 0 {
                break;
            }
            let rtm_type = buf[offset + 3];
            // addr_mask sits at the same offset in if_msghdr and ifa_msghdr
            let Some(addr_mask) = read_u32(buf, offset + 4) else {
                break;
            };
            let Some(flags) = read_u32(buf, offset + 8) else {
                break;
            };

            if ![RTM_NEWADDR, RTM_DELADDR, RTM_IFINFO].contains(&rtm_type) {
                offset += rtm_len;
                continue;
            }

            if rtm_type == RTM_IFINFO {
                interface_flags = flags;
            }

            // the sockaddr vector offsets differ between if_msghdr and
            // ifa_msghdr
            let sa_offset = offset + if rtm_type == RTM_IFINFO { 16 + 152 } else { 20 };

            if !keep_interface_context {
                interface = None;
            }

            let limit = (offset + rtm_len).min(buf.len());
            interface = self.parse_addrs(
                buf,
                sa_offset,
                limit,
                interface,
                addr_mask,
                rtm_type,
                interface_flags,
                &mut events,
            );

            offset += rtm_len;
        }

        events
    }

    /// Walks the aligned sockaddr vector of one record
    #[allow(clippy::too_many_arguments)]
    fn parse_addrs(
        &mut self,
        buf: &[u8],
        mut offset: usize,
        limit: usize,
        mut interface: Option<Interface>,
        addr_mask: u32,
        rtm_type: u8,
        flags: u32,
        events: &mut Vec<RawAddressEvent>,
    ) -> Option<Interface> {
        let mut address: Option<IpAddr> = None;
        let mut addr_type_idx: u32 = 1;

        while offset + 2 <= limit && offset + 2 <= buf.len() {
            while addr_type_idx & addr_mask == 0 && addr_type_idx <= addr_mask {
                addr_type_idx <<= 1;
            }

            let sa_len = buf[offset] as usize;
            let sa_family = buf[offset + 1];

            if addr_type_idx == RTA_IFA {
                if sa_family == libc::AF_INET as u8 {
                    if let Some(data) = buf.get(offset + 4..offset + 8) {
                        let octets: [u8; 4] = data.try_into().unwrap_or_default();
                        address = Some(IpAddr::V4(Ipv4Addr::from(octets)));
                    }
                } else if sa_family == libc::AF_INET6 as u8 {
                    if let Some(data) = buf.get(offset + 8..offset + 24) {
                        let octets: [u8; 16] = data.try_into().unwrap_or_default();
                        address = Some(IpAddr::V6(Ipv6Addr::from(octets)));
                    }
                }
            }

            if sa_family == AF_LINK {
                // sockaddr_dl: index at +2, name length at +5, name at +8
                let index = read_u16(buf, offset + 2).unwrap_or(0) as u32;
                let name_len = buf.get(offset + 5).copied().unwrap_or(0) as usize;
                if index > 0 {
                    if let Some(name) = buf.get(offset + 8..offset + 8 + name_len) {
                        let name = String::from_utf8_lossy(name).into_owned();
                        interface = Some(self.add_interface(name, index));
                    }
                }
            }

            offset += if sa_len > 0 {
                align_to(sa_len, sa_align())
            } else {
                sa_align()
            };
            addr_type_idx <<= 1;
        }

        if rtm_type == RTM_IFINFO {
            if let Some(interface) = &interface {
                if flags & IFF_LOOPBACK != 0 || flags & IFF_MULTICAST == 0 {
                    debug!("blacklisting interface {}", interface.name);
                    self.blacklist.insert(interface.name.clone());
                } else {
                    self.blacklist.remove(&interface.name);
                }
            }
        }

        let usable = match &interface {
            Some(interface) => !self.blacklist.contains(&interface.name),
            None => false,
        };
        let (Some(current), Some(address), true) = (&interface, address, usable) else {
            return interface;
        };

        let kind = if rtm_type == RTM_DELADDR {
            AddressEventKind::Deleted
        } else {
            // The address may still be tentative here, but the route socket
            // sends no further notification once it becomes usable.
            AddressEventKind::New
        };

        events.push(RawAddressEvent {
            kind,
            family: AddressFamily::of(&address),
            address,
            if_index: current.index,
            if_scope: current.scope,
            if_label: Some(current.name.clone()),
        });

        interface
    }
}

#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    target_os = "macos"
))]
pub use source::RouteSocketSource;

#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    target_os = "macos"
))]
mod source {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::sync::Mutex;

    use tokio::io::unix::AsyncFd;

    use super::*;

    struct RouteFd(OwnedFd);

    impl AsRawFd for RouteFd {
        fn as_raw_fd(&self) -> RawFd {
            self.0.as_raw_fd()
        }
    }

    /// The routing socket, registered with the reactor
    pub struct RouteSocketSource {
        fd: AsyncFd<RouteFd>,
        parser: Mutex<RouteParser>,
    }

    impl RouteSocketSource {
        /// Opens the routing socket before the first enumeration so no
        /// change between sysctl and socket setup is missed.
        pub fn new() -> io::Result<Self> {
            // SAFETY: plain socket(2) call, fd checked before use.
            let fd = unsafe { libc::socket(libc::AF_ROUTE, libc::SOCK_RAW, libc::AF_UNSPEC) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: fd is fresh and exclusively owned.
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };

            // SAFETY: fcntl on a valid fd with standard flags.
            let ret = unsafe {
                libc::fcntl(
                    owned.as_raw_fd(),
                    libc::F_SETFL,
                    libc::fcntl(owned.as_raw_fd(), libc::F_GETFL) | libc::O_NONBLOCK,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(RouteSocketSource {
                fd: AsyncFd::new(RouteFd(owned))?,
                parser: Mutex::new(RouteParser::new()),
            })
        }

        /// Fetches the interface list via sysctl and parses it
        pub fn enumerate(&self) -> io::Result<Vec<RawAddressEvent>> {
            let mut mib: [libc::c_int; 6] = [CTL_NET, libc::AF_ROUTE, 0, 0, NET_RT_IFLIST, 0];

            // first call only yields the required buffer size
            let mut size: libc::size_t = 0;
            // SAFETY: mib and size are valid for the duration of the call;
            // a null output buffer requests the size.
            let ret = unsafe {
                libc::sysctl(
                    mib.as_mut_ptr(),
                    mib.len() as libc::c_uint,
                    std::ptr::null_mut(),
                    &mut size,
                    std::ptr::null_mut(),
                    0,
                )
            };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }

            let mut buf = vec![0u8; size];
            // SAFETY: buf provides exactly the number of bytes the kernel
            // reported; size is updated to the amount actually written.
            let ret = unsafe {
                libc::sysctl(
                    mib.as_mut_ptr(),
                    mib.len() as libc::c_uint,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    &mut size,
                    std::ptr::null_mut(),
                    0,
                )
            };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }

            let mut parser = self.parser.lock().expect("route parser lock poisoned");
            Ok(parser.parse(&buf[..size], true))
        }

        /// Awaits the next routing message and parses it into events
        pub async fn recv_events(&self) -> io::Result<Vec<RawAddressEvent>> {
            let mut buf = [0u8; 4096];
            loop {
                let mut guard = self.fd.readable().await?;
                let result = guard.try_io(|inner| {
                    // SAFETY: the fd is valid and buf bounds the write.
                    let n = unsafe {
                        libc::recv(
                            inner.get_ref().as_raw_fd(),
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                            0,
                        )
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                });

                match result {
                    Ok(Ok(n)) => {
                        let mut parser =
                            self.parser.lock().expect("route parser lock poisoned");
                        return Ok(parser.parse(&buf[..n], false));
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds one route message with its sockaddr vector
    struct RecordBuilder {
        buf: Vec<u8>,
        addr_mask: u32,
    }

    impl RecordBuilder {
        fn new(rtm_type: u8, flags: u32) -> Self {
            let mut buf = Vec::new();
            buf.extend_from_slice(&0u16.to_ne_bytes()); // length, patched later
            buf.push(5); // version
            buf.push(rtm_type);
            buf.extend_from_slice(&0u32.to_ne_bytes()); // addr mask, patched later
            buf.extend_from_slice(&flags.to_ne_bytes());
            // pad the header to the sockaddr vector offset
            let header_len = if rtm_type == RTM_IFINFO { 16 + 152 } else { 20 };
            buf.resize(header_len, 0);
            RecordBuilder { buf, addr_mask: 0 }
        }

        fn link_sockaddr(mut self, index: u16, name: &str) -> Self {
            let sa_len = 8 + name.len();
            let mut sa = vec![0u8; 8];
            sa[0] = sa_len as u8;
            sa[1] = AF_LINK;
            sa[2..4].copy_from_slice(&index.to_ne_bytes());
            sa[5] = name.len() as u8;
            sa.extend_from_slice(name.as_bytes());
            sa.resize(align_to(sa_len, sa_align()), 0);
            self.buf.extend_from_slice(&sa);
            self.addr_mask |= 0x10; // RTA_IFP slot
            self
        }

        fn v4_ifa_sockaddr(mut self, addr: [u8; 4]) -> Self {
            let mut sa = vec![0u8; 16];
            sa[0] = 16;
            sa[1] = libc::AF_INET as u8;
            sa[4..8].copy_from_slice(&addr);
            sa.resize(align_to(16, sa_align()), 0);
            self.buf.extend_from_slice(&sa);
            self.addr_mask |= RTA_IFA;
            self
        }

        fn build(mut self) -> Vec<u8> {
            let len = self.buf.len() as u16;
            self.buf[..2].copy_from_slice(&len.to_ne_bytes());
            self.buf[4..8].copy_from_slice(&self.addr_mask.to_ne_bytes());
            self.buf
        }
    }

    #[test]
    fn test_sysctl_stream_with_interface_context() {
        // interface info record followed by an address record, as produced
        // by the NET_RT_IFLIST sysctl
        let mut buf = RecordBuilder::new(RTM_IFINFO, IFF_MULTICAST)
            .link_sockaddr(2, "em0")
            .build();
        buf.extend(RecordBuilder::new(RTM_NEWADDR, 0).v4_ifa_sockaddr([10, 0, 0, 1]).build());

        let mut parser = RouteParser::new();
        let events = parser.parse(&buf, true);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AddressEventKind::New);
        assert_eq!(events[0].address, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(events[0].if_label.as_deref(), Some("em0"));
        assert_eq!(events[0].if_index, 2);
    }

    #[test]
    fn test_live_record_context_not_kept() {
        let mut parser = RouteParser::new();
        let info = RecordBuilder::new(RTM_IFINFO, IFF_MULTICAST)
            .link_sockaddr(2, "em0")
            .build();
        parser.parse(&info, false);

        // an address record without its own link sockaddr has no interface
        let addr = RecordBuilder::new(RTM_NEWADDR, 0)
            .v4_ifa_sockaddr([10, 0, 0, 1])
            .build();
        assert!(parser.parse(&addr, false).is_empty());
    }

    #[test]
    fn test_loopback_interface_blacklisted() {
        let mut buf = RecordBuilder::new(RTM_IFINFO, IFF_LOOPBACK | IFF_MULTICAST)
            .link_sockaddr(1, "lo0")
            .build();
        buf.extend(
            RecordBuilder::new(RTM_NEWADDR, 0)
                .v4_ifa_sockaddr([127, 0, 0, 1])
                .build(),
        );

        let mut parser = RouteParser::new();
        assert!(parser.parse(&buf, true).is_empty());
    }

    #[test]
    fn test_non_multicast_interface_blacklisted() {
        let mut buf = RecordBuilder::new(RTM_IFINFO, 0)
            .link_sockaddr(4, "tun0")
            .build();
        buf.extend(
            RecordBuilder::new(RTM_NEWADDR, 0)
                .v4_ifa_sockaddr([192, 168, 7, 1])
                .build(),
        );

        let mut parser = RouteParser::new();
        assert!(parser.parse(&buf, true).is_empty());
    }

    #[test]
    fn test_deladdr_record() {
        let mut buf = RecordBuilder::new(RTM_IFINFO, IFF_MULTICAST)
            .link_sockaddr(2, "em0")
            .build();
        buf.extend(
            RecordBuilder::new(RTM_DELADDR, 0)
                .v4_ifa_sockaddr([10, 0, 0, 1])
                .build(),
        );

        let mut parser = RouteParser::new();
        let events = parser.parse(&buf, true);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AddressEventKind::Deleted);
    }

    #[test]
    fn test_truncated_stream_is_safe() {
        let mut buf = RecordBuilder::new(RTM_IFINFO, IFF_MULTICAST)
            .link_sockaddr(2, "em0")
            .build();
        buf.extend(
            RecordBuilder::new(RTM_NEWADDR, 0)
                .v4_ifa_sockaddr([10, 0, 0, 1])
                .build(),
        );

        for len in 0..buf.len() {
            let mut parser = RouteParser::new();
            let _ = parser.parse(&buf[..len], true);
        }
    }
}
