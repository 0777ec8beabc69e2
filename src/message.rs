//! Kernel routing message codec (C1).
//!
//! Ground truth for the wire shape is the teacher's `unix_bsd::mod`
//! `message_to_route`/`route_to_m_rtmsg` pair: a fixed header followed by a
//! packed, bitmask-addressed list of `sockaddr`s. This module generalizes
//! that single-purpose (`Route`-only) codec into the general decode/encode
//! primitives §4.1 of the spec describes, usable for route, address-change
//! and link-change messages alike.

use std::io;
use std::mem;
use std::net::IpAddr;

use crate::platform;

/// Bit position of a sockaddr role within `rtm_addrs`/`ifam_addrs`, in the
/// kernel's `RTAX_*` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Dst = libc::RTAX_DST as u8,
    Gateway = libc::RTAX_GATEWAY as u8,
    Netmask = libc::RTAX_NETMASK as u8,
    Genmask = libc::RTAX_GENMASK as u8,
    Ifp = libc::RTAX_IFP as u8,
    Ifa = libc::RTAX_IFA as u8,
    Author = libc::RTAX_AUTHOR as u8,
    Brd = libc::RTAX_BRD as u8,
}

impl Role {
    const ALL: [Role; 8] = [
        Role::Dst,
        Role::Gateway,
        Role::Netmask,
        Role::Genmask,
        Role::Ifp,
        Role::Ifa,
        Role::Author,
        Role::Brd,
    ];

    fn from_bit(bit: u8) -> Option<Role> {
        Self::ALL.get(bit as usize).copied()
    }
}

/// The message type, decoded from `rtm_type`. Only the variants this
/// component acts on are named; everything else is `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Add,
    Delete,
    Get,
    Change,
    NewAddr,
    DelAddr,
    IfInfo,
    Other(u8),
}

impl Kind {
    fn from_raw(t: u8) -> Kind {
        match t as i32 {
            libc::RTM_ADD => Kind::Add,
            libc::RTM_DELETE => Kind::Delete,
            libc::RTM_GET => Kind::Get,
            libc::RTM_CHANGE => Kind::Change,
            libc::RTM_NEWADDR => Kind::NewAddr,
            libc::RTM_DELADDR => Kind::DelAddr,
            libc::RTM_IFINFO => Kind::IfInfo,
            other => Kind::Other(other as u8),
        }
    }
}

/// The common fields present (at the same byte offsets) across every
/// concrete message header: total length, version, type, and — for the
/// `rt_msghdr`-shaped request/reply kinds only — the originator pid and
/// sequence number used for request/reply correlation (§4.4).
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub msg_len: u16,
    pub version: u8,
    pub kind: Kind,
    pub addrs_mask: i32,
    pub flags: i32,
    pub if_index: u32,
    /// Present only for `Add`/`Delete`/`Get`/`Change`; `None` for address-
    /// and link-change messages, which carry no pid/seq fields on the wire.
    pub pid_seq: Option<(i32, i32)>,
}

/// A decoded routing message: its header plus the raw tail of packed
/// sockaddrs, which can be walked more than once via `iter`.
pub struct RoutingMessage<'a> {
    pub header: Header,
    tail: &'a [u8],
}

/// Errors the decoder can report. Malformed tails are *not* reported here —
/// per spec.md §4.1 they truncate silently and the iterator simply ends.
#[derive(Debug)]
pub enum DecodeError {
    TooShort,
    VersionMismatch(u8),
}

/// Decodes the header and variable-length tail of one message out of
/// `buf`, which must contain exactly one message (the receiver reads one
/// message per `recv`).
pub fn decode(buf: &[u8]) -> Result<RoutingMessage<'_>, DecodeError> {
    const COMMON_LEN: usize = 4; // msglen(u16) + version(u8) + type(u8)
    if buf.len() < COMMON_LEN {
        return Err(DecodeError::TooShort);
    }
    let msg_len = u16::from_ne_bytes([buf[0], buf[1]]);
    let version = buf[2];
    let raw_type = buf[3];
    if (msg_len as usize) < COMMON_LEN || buf.len() < msg_len as usize {
        return Err(DecodeError::TooShort);
    }
    if version != platform::RTM_VERSION {
        return Err(DecodeError::VersionMismatch(version));
    }
    let kind = Kind::from_raw(raw_type);

    let (fixed_len, addrs_mask, flags, if_index, pid_seq) = match kind {
        Kind::Add | Kind::Delete | Kind::Get | Kind::Change => {
            let fixed_len = mem::size_of::<libc::rt_msghdr>();
            if buf.len() < fixed_len {
                return Err(DecodeError::TooShort);
            }
            let hdr = unsafe { &*(buf.as_ptr() as *const libc::rt_msghdr) };
            (
                fixed_len,
                hdr.rtm_addrs,
                hdr.rtm_flags,
                hdr.rtm_index as u32,
                Some((hdr.rtm_pid, hdr.rtm_seq)),
            )
        }
        Kind::IfInfo => {
            let fixed_len = mem::size_of::<libc::if_msghdr>();
            if buf.len() < fixed_len {
                return Err(DecodeError::TooShort);
            }
            let hdr = unsafe { &*(buf.as_ptr() as *const libc::if_msghdr) };
            (fixed_len, hdr.ifm_addrs, hdr.ifm_flags, hdr.ifm_index as u32, None)
        }
        Kind::NewAddr | Kind::DelAddr => {
            let fixed_len = mem::size_of::<libc::ifa_msghdr>();
            if buf.len() < fixed_len {
                return Err(DecodeError::TooShort);
            }
            let hdr = unsafe { &*(buf.as_ptr() as *const libc::ifa_msghdr) };
            (fixed_len, hdr.ifam_addrs, hdr.ifam_flags, hdr.ifam_index as u32, None)
        }
        Kind::Other(_) => (COMMON_LEN, 0, 0, 0, None),
    };

    let msg_len = msg_len as usize;
    let tail = if fixed_len >= msg_len {
        &buf[msg_len..msg_len]
    } else {
        &buf[fixed_len..msg_len]
    };

    Ok(RoutingMessage {
        header: Header {
            msg_len: msg_len as u16,
            version,
            kind,
            addrs_mask,
            flags,
            if_index,
            pid_seq,
        },
        tail,
    })
}

impl<'a> RoutingMessage<'a> {
    /// Produces a restartable iterator over `(Role, &sockaddr)` pairs
    /// present in the tail, in role-bit order. Each call starts fresh from
    /// the beginning of the tail; the individual iterator returned is
    /// single-pass.
    pub fn iter(&self) -> SockaddrIter<'a> {
        SockaddrIter {
            tail: self.tail,
            mask: self.header.addrs_mask,
            bit: 0,
        }
    }

    pub fn find(&self, role: Role) -> Option<&'a libc::sockaddr> {
        self.iter().find(|(r, _)| *r == role).map(|(_, sa)| sa)
    }
}

pub struct SockaddrIter<'a> {
    tail: &'a [u8],
    mask: i32,
    bit: u8,
}

impl<'a> Iterator for SockaddrIter<'a> {
    type Item = (Role, &'a libc::sockaddr);

    fn next(&mut self) -> Option<Self::Item> {
        while (self.bit as usize) < 8 {
            let bit = self.bit;
            self.bit += 1;
            if self.mask & (1 << bit) == 0 {
                continue;
            }
            let role = Role::from_bit(bit)?;
            if self.tail.len() < mem::size_of::<libc::sockaddr>() {
                // remaining bytes smaller than the next sockaddr: silent truncation
                self.mask = 0;
                return None;
            }
            let sa = unsafe { &*(self.tail.as_ptr() as *const libc::sockaddr) };
            let declared = if sa.sa_len == 0 {
                mem::size_of::<libc::sockaddr>()
            } else {
                sa.sa_len as usize
            };
            if self.tail.len() < declared {
                self.mask = 0;
                return None;
            }
            let advance = platform::sa_rounded_len(declared).min(self.tail.len());
            self.tail = &self.tail[advance..];
            return Some((role, sa));
        }
        None
    }
}

/// A message under construction: header fields plus an append-only buffer
/// of sockaddrs, mirroring the teacher's `m_rtmsg` but generalized to any
/// `Role` instead of being hardwired to `Route`'s fixed field order.
pub struct MessageBuilder {
    pub kind: Kind,
    pub flags: i32,
    pub pid: i32,
    pub seq: i32,
    addrs_mask: i32,
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(kind: Kind, pid: i32, seq: i32) -> Self {
        Self {
            kind,
            flags: 0,
            pid,
            seq,
            addrs_mask: 0,
            buf: Vec::with_capacity(128),
        }
    }

    fn append<T: Copy>(&mut self, role: Role, value: &T, declared_len: u8) {
        let len = mem::size_of::<T>();
        let ptr = value as *const T as *const u8;
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
        self.buf.extend_from_slice(bytes);
        let pad = platform::sa_rounded_len(declared_len as usize).saturating_sub(len);
        self.buf.extend(std::iter::repeat(0u8).take(pad));
        self.addrs_mask |= 1 << (role as u8);
    }

    /// Appends an IPv4/IPv6 sockaddr under the given role.
    pub fn push_ip(&mut self, role: Role, ip: IpAddr) {
        match ip {
            IpAddr::V4(v4) => {
                let sa = platform::sockaddr_in_from(v4);
                self.append(role, &sa, sa.sin_len);
            }
            IpAddr::V6(v6) => {
                let sa = platform::sockaddr_in6_from(v6);
                self.append(role, &sa, sa.sin6_len);
            }
        }
    }

    /// Appends a netmask sockaddr derived from `(family, prefix_len)`.
    pub fn push_netmask(&mut self, family_is_v4: bool, prefix_len: u8) {
        if family_is_v4 {
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX.checked_shl(32 - prefix_len as u32).unwrap_or(0)
            };
            let ip = std::net::Ipv4Addr::from(mask.to_be_bytes());
            let sa = platform::sockaddr_in_from(ip);
            self.append(Role::Netmask, &sa, sa.sin_len);
        } else {
            let mask: u128 = if prefix_len == 0 {
                0
            } else {
                u128::MAX.checked_shl(128 - prefix_len as u32).unwrap_or(0)
            };
            let ip = std::net::Ipv6Addr::from(mask.to_be_bytes());
            let sa = platform::sockaddr_in6_from(ip);
            self.append(Role::Netmask, &sa, sa.sin6_len);
        }
    }

    /// Appends a link-layer sockaddr naming an interface by index (used to
    /// force the kernel to report the outgoing interface for GET queries,
    /// and to target ADD/DELETE at a specific interface).
    pub fn push_link_index(&mut self, role: Role, if_index: u32) {
        let sa = platform::sockaddr_dl_for_index(if_index);
        self.append(role, &sa, sa.sdl_len);
    }

    /// Appends a link-layer sockaddr naming an interface by string (bounded
    /// by `sockaddr_dl`'s name field).
    pub fn push_link_name(&mut self, role: Role, name: &str) -> io::Result<()> {
        let sa = platform::sockaddr_dl_for_name(name)?;
        self.append(role, &sa, sa.sdl_len);
        Ok(())
    }

    /// Serializes the full `rt_msghdr` + tail ready to `write_all` on the
    /// routing socket.
    pub fn finish(mut self) -> Vec<u8> {
        let rtm_type = match self.kind {
            Kind::Add => libc::RTM_ADD,
            Kind::Delete => libc::RTM_DELETE,
            Kind::Get => libc::RTM_GET,
            Kind::Change => libc::RTM_CHANGE,
            _ => unreachable!("MessageBuilder only constructs request/reply kinds"),
        } as u8;
        let mut hdr: libc::rt_msghdr = unsafe { mem::zeroed() };
        let total = mem::size_of::<libc::rt_msghdr>() + self.buf.len();
        hdr.rtm_msglen = total as u16;
        hdr.rtm_version = platform::RTM_VERSION;
        hdr.rtm_type = rtm_type;
        hdr.rtm_addrs = self.addrs_mask;
        hdr.rtm_flags = self.flags;
        hdr.rtm_pid = self.pid;
        hdr.rtm_seq = self.seq;

        let hdr_bytes = unsafe {
            std::slice::from_raw_parts(&hdr as *const _ as *const u8, mem::size_of::<libc::rt_msghdr>())
        };
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(hdr_bytes);
        out.append(&mut self.buf);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn encode_then_decode_get_request_round_trips() {
        let mut b = MessageBuilder::new(Kind::Get, 4242, 7);
        b.push_ip(Role::Dst, IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
        b.push_link_name(Role::Ifa, "").unwrap();
        let bytes = b.finish();

        let msg = decode(&bytes).expect("decode");
        assert_eq!(msg.header.kind, Kind::Get);
        let (pid, seq) = msg.header.pid_seq.expect("pid/seq present on Get");
        assert_eq!(pid, 4242);
        assert_eq!(seq, 7);

        let dst = msg.find(Role::Dst).and_then(platform::sa_to_ip);
        assert_eq!(dst, Some(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
        assert!(msg.find(Role::Ifa).is_some());
        assert!(msg.find(Role::Gateway).is_none());
    }

    #[test]
    fn encode_then_decode_ipv6_destination() {
        let mut b = MessageBuilder::new(Kind::Get, 1, 1);
        let addr: Ipv6Addr = "2001:db8::1".parse().unwrap();
        b.push_ip(Role::Dst, IpAddr::V6(addr));
        let bytes = b.finish();
        let msg = decode(&bytes).unwrap();
        let dst = msg.find(Role::Dst).and_then(platform::sa_to_ip);
        assert_eq!(dst, Some(IpAddr::V6(addr)));
    }

    #[test]
    fn truncated_tail_ends_iteration_without_error() {
        let mut b = MessageBuilder::new(Kind::Get, 1, 1);
        b.push_ip(Role::Dst, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
        b.push_ip(Role::Gateway, IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)));
        let mut bytes = b.finish();
        // Chop off the gateway sockaddr's tail bytes but leave rtm_addrs
        // claiming it is still present; the iterator must stop cleanly.
        bytes.truncate(bytes.len() - 4);
        let msg = decode(&bytes).unwrap();
        let found: Vec<_> = msg.iter().collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, Role::Dst);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut b = MessageBuilder::new(Kind::Get, 1, 1);
        b.push_ip(Role::Dst, IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
        let mut bytes = b.finish();
        bytes[2] = platform::RTM_VERSION.wrapping_add(1);
        match decode(&bytes) {
            Err(DecodeError::VersionMismatch(_)) => {}
            other => panic!("expected VersionMismatch, got {other:?}"),
        }
    }

    impl std::fmt::Debug for RoutingMessage<'_> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RoutingMessage").finish()
        }
    }
}
