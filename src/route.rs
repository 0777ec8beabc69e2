//! Route programmer (C6).
//!
//! Builds and sends `ADD`/`DELETE` requests the way the teacher's
//! `add_or_del_route_req` does — `UP | STATIC`, destination first, netmask
//! next (omitted for host routes), interface and gateway roles after — but
//! generalized from the teacher's single `Route` value type to the
//! optional-role contract §4.6 describes: gateway, source, and interface
//! are each appended only when given, host routes drop the netmask and set
//! `HOST|GATEWAY`, and a true default route (prefix length 0) is always
//! split into the two covering `/1` halves the kernel is more consistent
//! about accepting, recursing at most one level deep.

use std::net::IpAddr;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::RouteStatus;
use crate::message::{Kind, MessageBuilder, Role};
use crate::platform;

/// A route add/delete request: destination and prefix are required, every
/// other role is appended only when given (§4.6).
pub struct RouteRequest<'a> {
    pub dest: IpAddr,
    pub prefix_len: u8,
    pub gateway: Option<IpAddr>,
    pub source: Option<IpAddr>,
    pub ifname: Option<&'a str>,
}

pub struct RouteProgrammer {
    sock: std::sync::Mutex<UnixStream>,
    pid: i32,
    next_seq: AtomicI32,
}

impl RouteProgrammer {
    pub fn new(sock: UnixStream, pid: i32) -> Self {
        Self {
            sock: std::sync::Mutex::new(sock),
            pid,
            next_seq: AtomicI32::new(1),
        }
    }

    pub fn add_route(&self, req: RouteRequest<'_>) -> RouteStatus {
        self.program(Kind::Add, req, 0)
    }

    pub fn del_route(&self, req: RouteRequest<'_>) -> RouteStatus {
        self.program(Kind::Delete, req, 0)
    }

    /// `depth` guards against the default-route split recursing more than
    /// one level (§4.6: a default route is covered by exactly two halves,
    /// neither of which is itself a default route).
    fn program(&self, kind: Kind, req: RouteRequest<'_>, depth: u8) -> RouteStatus {
        let full_len = match req.dest {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        if req.prefix_len == 0 && depth == 0 {
            let (first, second) = split_default(req.dest);
            let first_status = self.program(
                kind,
                RouteRequest {
                    dest: first,
                    prefix_len: 1,
                    gateway: req.gateway,
                    source: req.source,
                    ifname: req.ifname,
                },
                depth + 1,
            );
            if !first_status.is_ok() {
                return first_status;
            }
            return self.program(
                kind,
                RouteRequest {
                    dest: second,
                    prefix_len: 1,
                    gateway: req.gateway,
                    source: req.source,
                    ifname: req.ifname,
                },
                depth + 1,
            );
        }

        let is_host = req.prefix_len == full_len;
        let if_index = match req.ifname {
            Some(name) => match platform::if_name_to_index(name) {
                Ok(idx) => Some(idx),
                Err(e) => {
                    log::warn!(target: "pfroute::route", "unknown interface {name}: {e}");
                    return RouteStatus::Failed;
                }
            },
            None => None,
        };

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut msg = MessageBuilder::new(kind, self.pid, seq);
        msg.flags = libc::RTF_UP | libc::RTF_STATIC;
        if is_host {
            msg.flags |= libc::RTF_HOST | libc::RTF_GATEWAY;
        } else if req.gateway.is_some() {
            msg.flags |= libc::RTF_GATEWAY;
        }
        msg.push_ip(Role::Dst, req.dest);
        if !is_host {
            let is_v4 = matches!(req.dest, IpAddr::V4(_));
            msg.push_netmask(is_v4, req.prefix_len);
        }
        if let Some(if_index) = if_index {
            msg.push_link_index(Role::Ifp, if_index);
        }
        if let Some(gateway) = req.gateway {
            msg.push_ip(Role::Gateway, gateway);
        }
        if let Some(source) = req.source {
            msg.push_ip(Role::Ifa, source);
        }

        let bytes = msg.finish();
        let expected_len = bytes.len();
        let mut sock = self.sock.lock().unwrap();
        let sent = {
            use std::io::Write;
            sock.write(&bytes)
        };
        drop(sock);

        match sent {
            Ok(n) if n == expected_len => RouteStatus::Ok,
            _ => RouteStatus::Failed,
        }
    }
}

/// Splits the default route (`0.0.0.0/0` or `::/0`) into its two covering
/// `/1` halves: the network itself, and the same network with its top bit
/// set.
fn split_default(dest: IpAddr) -> (IpAddr, IpAddr) {
    match dest {
        IpAddr::V4(_) => {
            let low = IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0));
            let high = IpAddr::V4(std::net::Ipv4Addr::new(128, 0, 0, 0));
            (low, high)
        }
        IpAddr::V6(_) => {
            let low = IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED);
            let mut high_octets = [0u8; 16];
            high_octets[0] = 0x80;
            let high = IpAddr::V6(std::net::Ipv6Addr::from(high_octets));
            (low, high)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_route_splits_into_two_top_bit_halves_v4() {
        let (low, high) = split_default(IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)));
        assert_eq!(low, IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)));
        assert_eq!(high, IpAddr::V4(std::net::Ipv4Addr::new(128, 0, 0, 0)));
    }

    #[test]
    fn default_route_splits_into_two_top_bit_halves_v6() {
        let (low, high) = split_default(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED));
        assert_eq!(low, IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED));
        let octets = match high {
            IpAddr::V6(v6) => v6.octets(),
            _ => unreachable!(),
        };
        assert_eq!(octets[0], 0x80);
        assert!(octets[1..].iter().all(|&b| b == 0));
    }
}
