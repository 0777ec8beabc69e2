/*!
Host network state tracker and route manager over a BSD routing socket
(`PF_ROUTE`), for use by an IPsec/IKE daemon that needs to watch interface
and address changes, answer source-address/next-hop queries, manage
virtual tunnel IP addresses, and program static routes — all without
polling.

```rust,no_run
use kernel_pfroute::{Config, PfRouteBackend};
use std::sync::Arc;

# struct NoopFactory;
# impl kernel_pfroute::TunnelFactory for NoopFactory {
#     fn create(&self) -> std::io::Result<Box<dyn kernel_pfroute::TunnelDevice>> {
#         unimplemented!()
#     }
# }
# struct NoopNotifier;
# impl kernel_pfroute::TunnelNotifier for NoopNotifier {
#     fn tunnel_added(&self, _name: &str, _addr: std::net::IpAddr) {}
#     fn tunnel_removed(&self, _name: &str, _addr: std::net::IpAddr) {}
# }
let config = Config {
    is_usable: Arc::new(|name: &str| !name.starts_with("lo")),
    roam_listener: Arc::new(|_address_changed: bool| {}),
    tunnel_factory: Arc::new(NoopFactory),
    tunnel_notifier: Arc::new(NoopNotifier),
    scheduler: Arc::new(kernel_pfroute::ThreadScheduler),
    threaded: true,
};
let backend = PfRouteBackend::new(config).unwrap();
println!("{:?}", backend.enumerate(kernel_pfroute::EnumMask::REGULAR).collect::<Vec<_>>());
```
*/

mod broker;
mod cache;
mod config;
mod error;
mod message;
mod platform;
mod receiver;
mod roam;
mod route;
mod scan;
mod vip;

pub use cache::{AddrEnumerator, EnumMask, Interface, NamePredicate};
pub use config::{Config, TunnelDevice, TunnelFactory, TunnelNotifier};
pub use error::{RouteStatus, VipStatus};
pub use roam::{Scheduler, ThreadScheduler};
pub use route::RouteRequest;

use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use broker::{EventBus, QueryKind};
use cache::Cache;
use receiver::Receiver;
use roam::Debouncer;
use route::RouteProgrammer;
use vip::VipManager;

/// Static capability flags; BSD-family kernels always support the full
/// feature set this backend implements, so this carries no per-instance
/// state today but keeps the door open for a platform that can't, e.g.,
/// offer virtual-IP support.
#[derive(Debug, Clone, Copy)]
pub struct Features {
    pub supports_vip: bool,
    pub supports_roam_events: bool,
}

/// The crate's public façade: one instance owns the routing socket(s), the
/// interface/address cache, the background receiver thread (if `threaded`),
/// and the virtual-IP/route state built on top of them.
pub struct PfRouteBackend {
    cache: Arc<Cache>,
    bus: Arc<EventBus>,
    vip: VipManager,
    route: RouteProgrammer,
    receiver: Option<Receiver>,
    query_sock: std::sync::Mutex<std::os::unix::net::UnixStream>,
    pid: i32,
    next_query_seq: std::sync::atomic::AtomicI32,
}

impl PfRouteBackend {
    pub fn new(config: Config) -> io::Result<Self> {
        let pid = unsafe { libc::getpid() };
        let cache = Arc::new(Cache::new());
        let bus = Arc::new(EventBus::new());

        for iface in scan::scan_all()? {
            let usable = (config.is_usable)(&iface.name);
            cache.add_or_find(&iface.name, iface.index, iface.flags, usable);
            cache.repopulate(iface.index, iface.addrs);
        }

        let debouncer = Arc::new(Debouncer::new(config.scheduler, config.roam_listener));

        let receiver = if config.threaded {
            let sock = platform::open_route_socket()?;
            Some(Receiver::spawn(
                sock,
                Arc::clone(&cache),
                Arc::clone(&bus),
                debouncer,
                config.is_usable,
                pid,
            )?)
        } else {
            None
        };

        let vip = VipManager::new(
            Arc::clone(&cache),
            Arc::clone(&bus),
            config.tunnel_factory,
            config.tunnel_notifier,
        );
        let route_sock = platform::open_route_socket()?;
        let route = RouteProgrammer::new(route_sock, pid);
        let query_sock = platform::open_route_socket()?;

        Ok(Self {
            cache,
            bus,
            vip,
            route,
            receiver,
            query_sock: std::sync::Mutex::new(query_sock),
            pid,
            next_query_seq: std::sync::atomic::AtomicI32::new(1),
        })
    }

    pub fn features(&self) -> Features {
        Features {
            supports_vip: true,
            supports_roam_events: true,
        }
    }

    pub fn interface_name(&self, ip: IpAddr) -> Option<String> {
        self.cache.lookup_name(&ip, NamePredicate::UpAndUsable)
    }

    pub fn enumerate(&self, mask: EnumMask) -> AddrEnumerator<'_> {
        self.cache.enumerate(mask)
    }

    pub fn source_addr(&self, dest: IpAddr, hint: Option<IpAddr>) -> Option<IpAddr> {
        self.query(dest, hint, QueryKind::SourceAddr)
    }

    pub fn nexthop(&self, dest: IpAddr, hint: Option<IpAddr>) -> Option<IpAddr> {
        self.query(dest, hint, QueryKind::NextHop)
    }

    fn query(&self, dest: IpAddr, hint: Option<IpAddr>, kind: QueryKind) -> Option<IpAddr> {
        let seq = self
            .next_query_seq
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut sock = self.query_sock.lock().unwrap();
        broker::query(&self.bus, &mut sock, self.pid, seq, dest, hint, kind)
    }

    /// `prefix < 0` defaults to the address's full bit length (a host
    /// route), per spec.md §4.5.
    pub fn add_ip(&self, vip: IpAddr, prefix: i16, _ifname: Option<&str>) -> VipStatus {
        let prefix_len = if prefix < 0 { None } else { Some(prefix as u8) };
        self.vip.add_ip(vip, prefix_len)
    }

    pub fn del_ip(&self, vip: IpAddr, _prefix: i16, wait: bool) -> VipStatus {
        self.vip.del_ip(vip, wait)
    }

    pub fn add_route(&self, req: RouteRequest<'_>) -> RouteStatus {
        self.route.add_route(req)
    }

    pub fn del_route(&self, req: RouteRequest<'_>) -> RouteStatus {
        self.route.del_route(req)
    }
}

impl Drop for PfRouteBackend {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.shutdown();
        }
    }
}
