//! Linux rtnetlink address event source.
//!
//! A raw `AF_NETLINK`/`NETLINK_ROUTE` socket is bound to the address
//! multicast groups; an `RTM_GETADDR` dump request produces the initial
//! enumeration through the same socket. Datagram parsing is kept free of
//! OS calls so it can be exercised with crafted buffers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::debug;

use crate::monitor::{AddressEventKind, RawAddressEvent};
use crate::multicast::AddressFamily;

// from rtnetlink.h
pub(crate) const RTM_NEWADDR: u16 = 20;
pub(crate) const RTM_DELADDR: u16 = 21;
pub(crate) const RTM_GETADDR: u16 = 22;

pub(crate) const RTMGRP_LINK: u32 = 1;
pub(crate) const RTMGRP_IPV4_IFADDR: u32 = 0x10;
pub(crate) const RTMGRP_IPV6_IFADDR: u32 = 0x100;

// from netlink.h
pub(crate) const NLM_F_REQUEST: u16 = 0x01;
pub(crate) const NLM_F_DUMP: u16 = 0x100 | 0x200;

pub(crate) const NLM_HDR_LEN: usize = 16;
const NLM_HDR_ALIGNTO: usize = 4;

// ifa flags
const IFA_F_DADFAILED: u32 = 0x08;
const IFA_F_HOMEADDRESS: u32 = 0x10;
const IFA_F_DEPRECATED: u32 = 0x20;
const IFA_F_TENTATIVE: u32 = 0x40;
const IFA_F_UNUSABLE: u32 =
    IFA_F_DADFAILED | IFA_F_HOMEADDRESS | IFA_F_DEPRECATED | IFA_F_TENTATIVE;

// from if_addr.h
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;
const IFA_LABEL: u16 = 3;
const IFA_FLAGS: u16 = 8;
const IFA_MSG_LEN: usize = 8;

const RTA_ALIGNTO: usize = 4;
const RTA_LEN: usize = 4;

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

/// Parses one netlink datagram: a sequence of aligned netlink messages of
/// which `RTM_NEWADDR`/`RTM_DELADDR` become address events.
pub fn parse_datagram(buf: &[u8]) -> Vec<RawAddressEvent> {
    let mut events = Vec::new();
    let mut offset = 0;

    while offset + NLM_HDR_LEN <= buf.len() {
        let Some(nlmsg_len) = read_u32(buf, offset).map(|l| l as usize) else {
            break;
        };
        let Some(nlmsg_type) = read_u16(buf, offset + 4) else {
            break;
        };

        if nlmsg_len < NLM_HDR_LEN {
            break;
        }
        let msg_end = offset + nlmsg_len;
        if msg_end > buf.len() {
            break;
        }

        match nlmsg_type {
            RTM_NEWADDR | RTM_DELADDR => {
                let kind = if nlmsg_type == RTM_NEWADDR {
                    AddressEventKind::New
                } else {
                    AddressEventKind::Deleted
                };
                if let Some(event) = parse_addr_message(&buf[offset + NLM_HDR_LEN..msg_end], kind)
                {
                    events.push(event);
                }
            }
            _ => debug!("invalid rtm_message type {}", nlmsg_type),
        }

        offset = align_to(msg_end, NLM_HDR_ALIGNTO);
    }

    events
}

/// Decodes an `ifaddrmsg` with its attributes. Addresses in transient or
/// unusable states are skipped.
fn parse_addr_message(payload: &[u8], kind: AddressEventKind) -> Option<RawAddressEvent> {
    if payload.len() < IFA_MSG_LEN {
        return None;
    }

    // ifaddrmsg as in rtnetlink.h
    let ifa_family = payload[0];
    let mut ifa_flags = payload[2] as u32;
    let ifa_scope = payload[3];
    let ifa_index = read_u32(payload, 4)?;

    let mut address = None;
    let mut label = None;

    let mut offset = IFA_MSG_LEN;
    while offset + RTA_LEN <= payload.len() {
        let attr_len = read_u16(payload, offset)? as usize;
        let attr_type = read_u16(payload, offset + 2)?;

        if attr_len < RTA_LEN {
            debug!("invalid rtm_attr_len. skipping remainder");
            break;
        }
        let data_end = offset + attr_len;
        if data_end > payload.len() {
            break;
        }
        let data = &payload[offset + RTA_LEN..data_end];

        match attr_type {
            IFA_LABEL => {
                let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                label = Some(String::from_utf8_lossy(&data[..end]).into_owned());
            }
            IFA_LOCAL if ifa_family == libc::AF_INET as u8 && data.len() >= 4 => {
                let octets: [u8; 4] = data[..4].try_into().ok()?;
                address = Some(IpAddr::V4(Ipv4Addr::from(octets)));
            }
            IFA_ADDRESS if ifa_family == libc::AF_INET6 as u8 && data.len() >= 16 => {
                let octets: [u8; 16] = data[..16].try_into().ok()?;
                address = Some(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            IFA_FLAGS if data.len() >= 4 => {
                // 32-bit flags replacing the 8-bit ifaddrmsg field
                ifa_flags = read_u32(payload, offset + RTA_LEN)?;
            }
            _ => {}
        }

        offset = align_to(data_end, RTA_ALIGNTO);
    }

    if ifa_flags & IFA_F_UNUSABLE != 0 {
        debug!("ignore address with invalid state {:#x}", ifa_flags);
        return None;
    }

    let family = if ifa_family == libc::AF_INET as u8 {
        AddressFamily::V4
    } else if ifa_family == libc::AF_INET6 as u8 {
        AddressFamily::V6
    } else {
        return None;
    };

    let address = match address {
        Some(address) => address,
        None => {
            debug!("no address in RTM message");
            return None;
        }
    };

    Some(RawAddressEvent {
        kind,
        family,
        address,
        if_index: ifa_index,
        if_scope: ifa_scope as u32,
        if_label: label,
    })
}

#[cfg(target_os = "linux")]
pub use source::NetlinkSource;

#[cfg(target_os = "linux")]
mod source {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    use tokio::io::unix::AsyncFd;
    use tracing::debug;

    use super::*;

    struct NetlinkFd(OwnedFd);

    impl AsRawFd for NetlinkFd {
        fn as_raw_fd(&self) -> RawFd {
            self.0.as_raw_fd()
        }
    }

    /// The rtnetlink socket, registered with the reactor
    pub struct NetlinkSource {
        fd: AsyncFd<NetlinkFd>,
    }

    impl NetlinkSource {
        /// Opens the socket bound to the link group plus the address groups
        /// that match the configured family restrictions.
        pub fn new(ipv4only: bool, ipv6only: bool) -> io::Result<Self> {
            // SAFETY: plain socket(2) call; the fd is checked before use and
            // ownership moves into OwnedFd right below.
            let fd = unsafe {
                libc::socket(
                    libc::AF_NETLINK,
                    libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    libc::NETLINK_ROUTE,
                )
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: fd is a fresh, valid descriptor owned by no one else.
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };

            let mut groups = RTMGRP_LINK;
            if !ipv6only {
                groups |= RTMGRP_IPV4_IFADDR;
            }
            if !ipv4only {
                groups |= RTMGRP_IPV6_IFADDR;
            }

            // SAFETY: sockaddr_nl is fully initialized and lives on the
            // stack for the duration of the bind call.
            let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
            addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
            addr.nl_groups = groups;
            let ret = unsafe {
                libc::bind(
                    owned.as_raw_fd(),
                    &addr as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(NetlinkSource {
                fd: AsyncFd::new(NetlinkFd(owned))?,
            })
        }

        /// Sends the `RTM_GETADDR` dump request for the initial enumeration
        pub fn request_dump(&self) -> io::Result<()> {
            let mut req = Vec::with_capacity(NLM_HDR_LEN + 1);
            req.extend_from_slice(&((NLM_HDR_LEN as u32) + 1).to_ne_bytes());
            req.extend_from_slice(&RTM_GETADDR.to_ne_bytes());
            req.extend_from_slice(&(NLM_F_REQUEST | NLM_F_DUMP).to_ne_bytes());
            req.extend_from_slice(&1u32.to_ne_bytes()); // sequence number
            req.extend_from_slice(&0u32.to_ne_bytes()); // pid: kernel fills in
            req.push(libc::AF_PACKET as u8);

            // SAFETY: destination is a zeroed kernel sockaddr_nl; the request
            // buffer is valid for its full length.
            let mut kernel: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
            kernel.nl_family = libc::AF_NETLINK as libc::sa_family_t;
            let ret = unsafe {
                libc::sendto(
                    self.fd.get_ref().as_raw_fd(),
                    req.as_ptr() as *const libc::c_void,
                    req.len(),
                    0,
                    &kernel as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Awaits the next netlink datagram and parses it into events
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
                        debug!("netlink message with {} bytes", n);
                        return Ok(parse_datagram(&buf[..n]));
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

    struct MessageBuilder {
        buf: Vec<u8>,
    }

    impl MessageBuilder {
        fn new(msg_type: u16, family: u8, flags: u8, scope: u8, index: u32) -> Self {
            let mut buf = Vec::new();
            buf.extend_from_slice(&0u32.to_ne_bytes()); // length, patched later
            buf.extend_from_slice(&msg_type.to_ne_bytes());
            buf.extend_from_slice(&0u16.to_ne_bytes()); // flags
            buf.extend_from_slice(&0u32.to_ne_bytes()); // seq
            buf.extend_from_slice(&0u32.to_ne_bytes()); // pid
            buf.push(family);
            buf.push(24); // prefix length
            buf.push(flags);
            buf.push(scope);
            buf.extend_from_slice(&index.to_ne_bytes());
            MessageBuilder { buf }
        }

        fn attr(mut self, attr_type: u16, data: &[u8]) -> Self {
            let attr_len = (RTA_LEN + data.len()) as u16;
            self.buf.extend_from_slice(&attr_len.to_ne_bytes());
            self.buf.extend_from_slice(&attr_type.to_ne_bytes());
            self.buf.extend_from_slice(data);
            while self.buf.len() % RTA_ALIGNTO != 0 {
                self.buf.push(0);
            }
            self
        }

        fn build(mut self) -> Vec<u8> {
            let len = self.buf.len() as u32;
            self.buf[..4].copy_from_slice(&len.to_ne_bytes());
            self.buf
        }
    }

    #[test]
    fn test_new_v4_address() {
        let buf = MessageBuilder::new(RTM_NEWADDR, libc::AF_INET as u8, 0, 0, 2)
            .attr(3, b"eth0\0") // IFA_LABEL
            .attr(2, &[10, 0, 0, 1]) // IFA_LOCAL
            .build();

        let events = parse_datagram(&buf);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.kind, AddressEventKind::New);
        assert_eq!(event.family, AddressFamily::V4);
        assert_eq!(event.address, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(event.if_index, 2);
        assert_eq!(event.if_label.as_deref(), Some("eth0"));
    }

    #[test]
    fn test_deleted_v6_address_without_label() {
        let addr: Ipv6Addr = "fe80::1".parse().unwrap();
        let buf = MessageBuilder::new(RTM_DELADDR, libc::AF_INET6 as u8, 0, 253, 3)
            .attr(1, &addr.octets()) // IFA_ADDRESS
            .build();

        let events = parse_datagram(&buf);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.kind, AddressEventKind::Deleted);
        assert_eq!(event.family, AddressFamily::V6);
        assert_eq!(event.address, IpAddr::V6(addr));
        assert!(event.if_label.is_none());
    }

    #[test]
    fn test_tentative_address_skipped() {
        let buf = MessageBuilder::new(RTM_NEWADDR, libc::AF_INET as u8, 0x40, 0, 2)
            .attr(2, &[10, 0, 0, 1])
            .build();
        assert!(parse_datagram(&buf).is_empty());
    }

    #[test]
    fn test_ifa_flags_attribute_overrides() {
        // deprecated flag only present in the 32-bit attribute
        let buf = MessageBuilder::new(RTM_NEWADDR, libc::AF_INET as u8, 0, 0, 2)
            .attr(2, &[10, 0, 0, 1])
            .attr(8, &0x20u32.to_ne_bytes()) // IFA_FLAGS: deprecated
            .build();
        assert!(parse_datagram(&buf).is_empty());
    }

    #[test]
    fn test_message_without_address_skipped() {
        let buf = MessageBuilder::new(RTM_NEWADDR, libc::AF_INET as u8, 0, 0, 2)
            .attr(3, b"eth0\0")
            .build();
        assert!(parse_datagram(&buf).is_empty());
    }

    #[test]
    fn test_multiple_messages_in_one_datagram() {
        let mut buf = MessageBuilder::new(RTM_NEWADDR, libc::AF_INET as u8, 0, 0, 2)
            .attr(2, &[10, 0, 0, 1])
            .build();
        buf.extend(
            MessageBuilder::new(RTM_DELADDR, libc::AF_INET as u8, 0, 0, 2)
                .attr(2, &[10, 0, 0, 2])
                .build(),
        );

        let events = parse_datagram(&buf);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, AddressEventKind::New);
        assert_eq!(events[1].kind, AddressEventKind::Deleted);
    }

    #[test]
    fn test_truncated_datagram_is_safe() {
        let buf = MessageBuilder::new(RTM_NEWADDR, libc::AF_INET as u8, 0, 0, 2)
            .attr(2, &[10, 0, 0, 1])
            .build();
        // no panic on any truncation
        for len in 0..buf.len() {
            let _ = parse_datagram(&buf[..len]);
        }
    }
}
