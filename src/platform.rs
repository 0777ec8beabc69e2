//! Raw OS bindings: the routing socket, name/index resolution, sockaddr
//! construction, and the self-pipe used to make the receiver cancellable.
//!
//! Adapted from the teacher crate's `unix_bsd::bind`/`unix::mod`/
//! `unix::shutdown` modules, but built directly on `libc`'s own struct
//! definitions (the way `al8n/getifs` and `mozilla/mtu` do it) instead of a
//! bindgen build step — this crate targets exactly three platforms, which
//! `libc` already covers without a wrapper header.

use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

pub const RTM_VERSION: u8 = libc::RTM_VERSION as u8;

/// Opens the raw routing socket (`PF_ROUTE`, `SOCK_RAW`, `AF_UNSPEC`).
pub fn open_route_socket() -> io::Result<UnixStream> {
    let fd = unsafe { libc::socket(libc::PF_ROUTE, libc::SOCK_RAW, libc::AF_UNSPEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { UnixStream::from_raw_fd(fd) })
}

pub fn if_name_to_index(name: &str) -> io::Result<u32> {
    let cname = CString::new(name).map_err(|_| io::Error::other("interface name has a NUL"))?;
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(idx)
    }
}

pub fn if_index_to_name(index: u32) -> io::Result<String> {
    let mut buf: [libc::c_char; libc::IFNAMSIZ] = [0; libc::IFNAMSIZ];
    unsafe {
        if libc::if_indextoname(index, buf.as_mut_ptr()).is_null() {
            return Err(io::Error::last_os_error());
        }
        let cstr = CStr::from_ptr(buf.as_ptr());
        cstr.to_str()
            .map(str::to_owned)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "interface name not UTF-8"))
    }
}

/// Rounds a sockaddr's on-wire length up to the platform's alignment for
/// the *next* sockaddr in a routing message's variable-length tail.
#[cfg(target_os = "macos")]
pub fn sa_rounded_len(sa_len: usize) -> usize {
    if sa_len == 0 {
        mem::size_of::<libc::c_long>()
    } else {
        (sa_len + mem::size_of::<u32>() - 1) & !(mem::size_of::<u32>() - 1)
    }
}

#[cfg(any(target_os = "freebsd", target_os = "openbsd"))]
pub fn sa_rounded_len(sa_len: usize) -> usize {
    if sa_len == 0 {
        mem::size_of::<libc::c_long>()
    } else {
        1 + ((sa_len - 1) | (mem::size_of::<libc::c_long>() - 1))
    }
}

pub fn sockaddr_in_from(ip: Ipv4Addr) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_len: mem::size_of::<libc::sockaddr_in>() as u8,
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(ip.octets()),
        },
        sin_zero: [0; 8],
    }
}

pub fn sockaddr_in6_from(ip: Ipv6Addr) -> libc::sockaddr_in6 {
    let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    sin6.sin6_len = mem::size_of::<libc::sockaddr_in6>() as u8;
    sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sin6.sin6_addr.s6_addr = ip.octets();
    sin6
}

/// Builds a `sockaddr_dl` naming an interface by index only (no link-layer
/// address bytes), used to append an `RTAX_IFP`/`RTAX_IFA` role that forces
/// the kernel to report back the outgoing interface.
pub fn sockaddr_dl_for_index(if_index: u32) -> libc::sockaddr_dl {
    let mut sdl: libc::sockaddr_dl = unsafe { mem::zeroed() };
    sdl.sdl_len = mem::size_of::<libc::sockaddr_dl>() as u8;
    sdl.sdl_family = libc::AF_LINK as u8;
    sdl.sdl_index = if_index as u16;
    sdl
}

/// Builds a `sockaddr_dl` carrying an interface name (no index), used when
/// the caller names an interface by string instead of by index.
pub fn sockaddr_dl_for_name(name: &str) -> io::Result<libc::sockaddr_dl> {
    if name.len() > 12 {
        return Err(io::Error::other("interface name too long for sockaddr_dl"));
    }
    let mut sdl: libc::sockaddr_dl = unsafe { mem::zeroed() };
    sdl.sdl_family = libc::AF_LINK as u8;
    sdl.sdl_nlen = name.len() as u8;
    for (i, b) in name.bytes().enumerate() {
        sdl.sdl_data[i] = b as libc::c_char;
    }
    sdl.sdl_len = (mem::size_of::<libc::sockaddr_dl>()) as u8;
    Ok(sdl)
}

pub fn sa_to_ip(sa: &libc::sockaddr) -> Option<IpAddr> {
    match sa.sa_family as i32 {
        libc::AF_INET => {
            let sin: &libc::sockaddr_in = unsafe { &*(sa as *const _ as *const libc::sockaddr_in) };
            Some(IpAddr::V4(Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes())))
        }
        libc::AF_INET6 => {
            let sin6: &libc::sockaddr_in6 =
                unsafe { &*(sa as *const _ as *const libc::sockaddr_in6) };
            Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}

/// A self-pipe used to interrupt a blocking `select()` on the route
/// socket. Adapted from the teacher's `unix::shutdown::EventFd`, which the
/// teacher only builds under its optional `shutdown` feature; here it is
/// load-bearing for every receiver since cancellability is mandatory.
pub struct EventFd {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [0; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub fn wake(&self) -> io::Result<()> {
        let buf = 1u64.to_ne_bytes();
        let n = unsafe { libc::write(self.write_fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.read_fd
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.read_fd);
            let _ = libc::close(self.write_fd);
        }
    }
}

/// Blocks until `sock` is readable or `shutdown` is signalled.
///
/// Returns `Ok(true)` if `sock` is readable, `Ok(false)` if `shutdown` fired
/// first.
pub fn select_readable<F: AsRawFd>(sock: &F, shutdown: &EventFd) -> io::Result<bool> {
    let sock_fd = sock.as_raw_fd();
    let wake_fd = shutdown.as_raw_fd();
    let mut read_fds: libc::fd_set = unsafe { mem::zeroed() };
    unsafe {
        libc::FD_SET(sock_fd, &mut read_fds);
        libc::FD_SET(wake_fd, &mut read_fds);
    }
    let nfds = sock_fd.max(wake_fd) + 1;
    let rc = unsafe {
        libc::select(
            nfds,
            &mut read_fds,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(true); // let the caller's read() observe EINTR and retry
        }
        return Err(err);
    }
    if unsafe { libc::FD_ISSET(wake_fd, &read_fds) } {
        return Ok(false);
    }
    Ok(true)
}
