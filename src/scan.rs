//! One-shot OS queries used to (re)populate the cache: the initial full
//! interface/address scan at startup (§4.1) and the per-interface address
//! refresh triggered by a link-state transition (§4.3.2).
//!
//! Walks `getifaddrs()`'s linked list directly against `libc`'s struct
//! definitions, the same no-bindgen idiom the routing-message codec uses
//! for `rt_msghdr`/`sockaddr_dl` (grounded on the same `al8n/getifs` and
//! `mozilla/mtu` examples as `platform.rs`), rather than the sysctl
//! `NET_RT_IFLIST` dump the teacher's `unix_bsd::try_get_msg_buf` performs
//! for its one-shot route list — `getifaddrs` is the idiomatic BSD
//! interface for exactly this query and needs no routing-socket framing.

use std::ffi::CStr;
use std::io;
use std::net::IpAddr;
use std::ptr;

use crate::platform;

pub struct ScannedInterface {
    pub name: String,
    pub index: u32,
    pub flags: u32,
    pub addrs: Vec<IpAddr>,
}

/// Full interface + address snapshot, grouped by interface name.
pub fn scan_all() -> io::Result<Vec<ScannedInterface>> {
    let mut head: *mut libc::ifaddrs = ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let mut out: Vec<ScannedInterface> = Vec::new();
    let mut cur = head;
    while !cur.is_null() {
        let ifa = unsafe { &*cur };
        cur = ifa.ifa_next;

        let Ok(name) = (unsafe { CStr::from_ptr(ifa.ifa_name) }.to_str()) else {
            continue;
        };
        let entry = match out.iter().position(|e| e.name == name) {
            Some(pos) => pos,
            None => {
                let index = platform::if_name_to_index(name).unwrap_or(0);
                out.push(ScannedInterface {
                    name: name.to_string(),
                    index,
                    flags: ifa.ifa_flags,
                    addrs: Vec::new(),
                });
                out.len() - 1
            }
        };
        out[entry].flags = ifa.ifa_flags;
        if !ifa.ifa_addr.is_null() {
            let sa = unsafe { &*ifa.ifa_addr };
            if let Some(ip) = platform::sa_to_ip(sa) {
                out[entry].addrs.push(ip);
            }
        }
    }
    unsafe { libc::freeifaddrs(head) };
    out.retain(|e| e.index != 0);
    Ok(out)
}

/// Addresses currently assigned to a single interface, by kernel index.
pub fn addresses_for_index(index: u32) -> io::Result<Vec<IpAddr>> {
    let name = platform::if_index_to_name(index)?;
    let all = scan_all()?;
    Ok(all
        .into_iter()
        .find(|e| e.name == name)
        .map(|e| e.addrs)
        .unwrap_or_default())
}
