//! Dependency-injection surface (§9's "no global singletons" design note).
//!
//! Every external collaborator the backend needs — usability policy, roam
//! notification, tunnel device lifecycle, delayed-job scheduling — is an
//! injected trait object rather than ambient/global state, matching the
//! teacher's preference for constructor-supplied collaborators over
//! statics (`RouteManager::new` takes no globals either). Logging is the
//! one exception: like the teacher, this crate reaches for the ambient
//! `log` crate macros rather than threading a logger handle through every
//! constructor.

use std::net::IpAddr;
use std::sync::Arc;

use crate::roam::Scheduler;

/// A single virtual network interface (TUN/TAP or equivalent) as seen by
/// the virtual-IP manager. Implementations own the OS handle; dropping one
/// tears the interface down.
pub trait TunnelDevice: Send + Sync {
    fn name(&self) -> &str;
    fn set_address(&self, addr: IpAddr, prefix_len: u8) -> std::io::Result<()>;
    fn bring_up(&self) -> std::io::Result<()>;
}

/// Creates new tunnel devices on demand (§4.5's "acquire a tunnel").
pub trait TunnelFactory: Send + Sync {
    fn create(&self) -> std::io::Result<Box<dyn TunnelDevice>>;
}

/// Notified when a virtual IP attaches to or detaches from a tunnel, so the
/// embedding daemon can keep its own tunnel bookkeeping in sync.
pub trait TunnelNotifier: Send + Sync {
    fn tunnel_added(&self, name: &str, addr: IpAddr);
    fn tunnel_removed(&self, name: &str, addr: IpAddr);
}

/// Bundles every injected collaborator the backend needs at construction
/// time.
pub struct Config {
    /// Decides whether a newly observed interface is eligible for roam
    /// notifications and GET-query source-address answers (§4.3.2).
    pub is_usable: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    /// Invoked (at most once per 100 ms window) when topology changes in a
    /// way that should make the daemon reconsider its existing IKE_SAs.
    pub roam_listener: Arc<dyn Fn(bool) + Send + Sync>,
    pub tunnel_factory: Arc<dyn TunnelFactory>,
    pub tunnel_notifier: Arc<dyn TunnelNotifier>,
    pub scheduler: Arc<dyn Scheduler>,
    /// When `false`, `PfRouteBackend::new` skips spawning the receiver
    /// thread entirely and the cache stays a static, once-populated
    /// snapshot — for hosts without a thread pool to spare on a background
    /// listener (§5's "starter-like hosts" mode). In this mode
    /// `enumerate`/`interface_name` still answer from the static cache, but
    /// `source_addr`/`nexthop` always time out to `None`: nothing is left
    /// running to read the `GET` reply off the query socket.
    pub threaded: bool,
}
