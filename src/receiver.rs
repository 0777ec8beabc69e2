//! Event receiver (C3): the dedicated background thread that reads the raw
//! routing socket and drives the cache and the broker/vip wake-ups (§4.3).
//!
//! The thread shape — loop around a cancellable blocking read, `EINTR`/
//! `EAGAIN` reschedules immediately, other errors log-and-back-off — is
//! adapted from the teacher's `RouteListener::listen` plus its
//! `unix::shutdown` self-pipe `wait()`. The teacher's loop exists to hand
//! one decoded `RouteChange` back to a caller; this one has no caller to
//! hand anything back to — it drives the cache and the event bus directly
//! and never returns.

use std::io::Read;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::broker::EventBus;
use crate::cache::Cache;
use crate::message::{self, Kind, Role};
use crate::platform::{self, EventFd};
use crate::roam::Debouncer;
use crate::scan;

/// Maximum single routing message: fixed header plus `RTAX_MAX` worst-case
/// `sockaddr_in6`s, rounded up generously (spec.md §4.3 calls for "a stack
/// buffer sized for the header plus RTAX_MAX maximum sockaddrs").
const MAX_MSG: usize = 2048;

pub struct Receiver {
    shutdown: Arc<EventFd>,
    joined: AtomicBool,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Receiver {
    /// Spawns the background thread. `is_usable` decides usability for
    /// newly observed interfaces (§4.3.2).
    pub fn spawn(
        sock: UnixStream,
        cache: Arc<Cache>,
        bus: Arc<EventBus>,
        debouncer: Arc<Debouncer>,
        is_usable: Arc<dyn Fn(&str) -> bool + Send + Sync>,
        pid: i32,
    ) -> std::io::Result<Self> {
        sock.set_nonblocking(true)?;
        let shutdown = Arc::new(EventFd::new()?);
        let shutdown_for_thread = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("pfroute-receiver".into())
            .spawn(move || run(sock, cache, bus, debouncer, is_usable, pid, shutdown_for_thread))?;
        Ok(Self {
            shutdown,
            joined: AtomicBool::new(false),
            handle: std::sync::Mutex::new(Some(handle)),
        })
    }

    /// Signals the self-pipe and joins the thread. Idempotent.
    pub fn shutdown(&self) {
        if self.joined.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.wake();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    mut sock: UnixStream,
    cache: Arc<Cache>,
    bus: Arc<EventBus>,
    debouncer: Arc<Debouncer>,
    is_usable: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    pid: i32,
    shutdown: Arc<EventFd>,
) {
    let mut buf = [0u8; MAX_MSG];
    loop {
        match platform::select_readable(&sock, &shutdown) {
            Ok(true) => {}
            Ok(false) => return, // shutdown requested
            Err(e) => {
                log::warn!(target: "pfroute::receiver", "select failed: {e}");
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }
        }

        let n = match sock.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(e) => {
                log::warn!(target: "pfroute::receiver", "recv failed: {e}");
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }
        };

        let raw = &buf[..n];
        let decoded = match message::decode(raw) {
            Ok(m) => m,
            Err(message::DecodeError::TooShort) => {
                log::debug!(target: "pfroute::receiver", "dropping truncated/malformed message");
                continue;
            }
            Err(message::DecodeError::VersionMismatch(v)) => {
                log::warn!(target: "pfroute::receiver", "dropping message with unexpected version {v}");
                continue;
            }
        };

        match decoded.header.kind {
            Kind::NewAddr | Kind::DelAddr => {
                handle_addr_change(&decoded, &cache, &debouncer);
            }
            Kind::IfInfo => {
                handle_link_change(&decoded, &cache, &debouncer, &is_usable);
            }
            Kind::Add | Kind::Delete | Kind::Get | Kind::Change => {
                // route events are observed-and-ignored, per spec.md §9
                log::debug!(target: "pfroute::receiver", "observed route message, ignoring");
            }
            Kind::Other(t) => {
                log::debug!(target: "pfroute::receiver", "skipping unknown message type {t}");
            }
        }

        bus.on_message(pid, decoded.header.pid_seq, raw);
    }
}

fn handle_addr_change(
    decoded: &message::RoutingMessage<'_>,
    cache: &Cache,
    debouncer: &Debouncer,
) {
    let Some(ip) = decoded.find(Role::Ifa).and_then(platform::sa_to_ip) else {
        return;
    };
    let index = decoded.header.if_index;
    let Some(iface) = cache.interface_by_index(index) else {
        return;
    };
    let has_it = iface.addrs().iter().any(|a| a.host == ip);
    let mut changed = false;
    match decoded.header.kind {
        Kind::DelAddr if has_it => {
            changed = cache.remove_addr(index, &ip);
        }
        Kind::NewAddr if !has_it => {
            changed = cache.add_addr(index, ip);
        }
        _ => {}
    }
    if changed {
        if let Some(iface) = cache.interface_by_index(index) {
            if iface.is_up() && iface.usable {
                debouncer.fire_roam(std::time::Instant::now(), true);
            }
        }
    }
}

fn handle_link_change(
    decoded: &message::RoutingMessage<'_>,
    cache: &Cache,
    debouncer: &Debouncer,
    is_usable: &Arc<dyn Fn(&str) -> bool + Send + Sync>,
) {
    let index = decoded.header.if_index;
    let new_flags = decoded.header.flags as u32;

    match cache.interface_by_index(index) {
        Some(existing) => {
            if existing.usable {
                let was_up = existing.is_up();
                let will_be_up = new_flags & (libc::IFF_UP as u32) != 0;
                if was_up != will_be_up {
                    debouncer.fire_roam(std::time::Instant::now(), false);
                }
            }
            // overwrite flags unconditionally, then repopulate addresses
            // from a fresh OS query: some transitions drop/add addresses
            // without per-address events.
            cache.set_flags(index, new_flags);
            if let Ok(fresh) = scan::addresses_for_index(index) {
                cache.repopulate(index, fresh);
            }
        }
        None => {
            let Ok(name) = platform::if_index_to_name(index) else {
                return;
            };
            let usable = is_usable(&name);
            cache.add_or_find(&name, index, new_flags, usable);
            if let Ok(fresh) = scan::addresses_for_index(index) {
                cache.repopulate(index, fresh);
            }
        }
    }
}
