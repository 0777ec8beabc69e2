//! Interface/address cache (C2).
//!
//! A single `RwLock` guards the interface list and its reverse index, per
//! spec.md §4.2/§5. Interface identity is the kernel index (`u32`); the
//! list itself is a `Vec` the way the teacher keeps its route list a
//! flat `Vec<Route>` (`unix_bsd::mod::list_routes`) rather than reaching
//! for a secondary index structure — interface counts are small (tens, not
//! thousands), so a linear scan by index is the idiomatic choice here too.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{RwLock, RwLockReadGuard};

/// One observed (or newly created) network interface.
#[derive(Debug, Clone)]
pub struct Interface {
    pub index: u32,
    pub name: String,
    pub flags: u32,
    pub usable: bool,
    addrs: Vec<AddrRecord>,
}

impl Interface {
    pub fn addrs(&self) -> &[AddrRecord] {
        &self.addrs
    }

    /// Mirrors IFF_UP on BSD kernels.
    pub fn is_up(&self) -> bool {
        self.flags & (libc::IFF_UP as u32) != 0
    }

    pub fn is_loopback(&self) -> bool {
        self.flags & (libc::IFF_LOOPBACK as u32) != 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AddrRecord {
    pub host: IpAddr,
    pub is_virtual: bool,
}

fn is_ipv6_link_local(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6) if (v6.segments()[0] & 0xffc0) == 0xfe80)
}

/// Bitmask selecting which addresses `Cache::enumerate` yields (§4.2/§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnumMask(u8);

impl EnumMask {
    pub const REGULAR: EnumMask = EnumMask(1 << 0);
    pub const VIRTUAL: EnumMask = EnumMask(1 << 1);
    pub const IGNORED: EnumMask = EnumMask(1 << 2);
    pub const LOOPBACK: EnumMask = EnumMask(1 << 3);
    pub const DOWN: EnumMask = EnumMask(1 << 4);

    pub fn contains(self, other: EnumMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for EnumMask {
    type Output = EnumMask;
    fn bitor(self, rhs: EnumMask) -> EnumMask {
        EnumMask(self.0 | rhs.0)
    }
}

/// Which interfaces `Cache::lookup_name` is allowed to resolve through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamePredicate {
    UpAndUsable,
    UpAny,
}

struct CacheInner {
    interfaces: Vec<Interface>,
    /// host -> interface indices carrying it (non-virtual only).
    reverse: HashMap<IpAddr, Vec<u32>>,
}

impl CacheInner {
    fn find_mut(&mut self, index: u32) -> Option<&mut Interface> {
        self.interfaces.iter_mut().find(|i| i.index == index)
    }
    fn find(&self, index: u32) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.index == index)
    }

    fn reverse_insert(&mut self, host: IpAddr, index: u32) {
        let slot = self.reverse.entry(host).or_default();
        if !slot.contains(&index) {
            slot.push(index);
        }
    }

    fn reverse_remove(&mut self, host: &IpAddr, index: u32) {
        if let Some(slot) = self.reverse.get_mut(host) {
            slot.retain(|i| *i != index);
            if slot.is_empty() {
                self.reverse.remove(host);
            }
        }
    }
}

pub struct Cache {
    inner: RwLock<CacheInner>,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                interfaces: Vec::new(),
                reverse: HashMap::new(),
            }),
        }
    }

    /// Creates the interface if unknown, otherwise returns its current
    /// state. Used both by the initial scan and by `IFINFO` handling for
    /// an unknown index (§4.3.2).
    pub fn add_or_find(&self, name: &str, index: u32, flags: u32, usable: bool) -> Interface {
        let mut g = self.inner.write().unwrap();
        if let Some(existing) = g.find(index) {
            return existing.clone();
        }
        let iface = Interface {
            index,
            name: name.to_string(),
            flags,
            usable,
            addrs: Vec::new(),
        };
        g.interfaces.push(iface.clone());
        iface
    }

    /// Overwrites an interface's flag word in place (§4.3.2's link-state
    /// transitions never change anything else about identity).
    pub fn set_flags(&self, index: u32, flags: u32) {
        let mut g = self.inner.write().unwrap();
        if let Some(iface) = g.find_mut(index) {
            iface.flags = flags;
        }
    }

    pub fn remove_iface(&self, index: u32) {
        let mut g = self.inner.write().unwrap();
        if let Some(pos) = g.interfaces.iter().position(|i| i.index == index) {
            let iface = g.interfaces.remove(pos);
            for a in iface.addrs() {
                if !a.is_virtual {
                    g.reverse_remove(&a.host, index);
                }
            }
        }
    }

    /// Adds a non-virtual address; no-op if the interface is unknown or
    /// the address is already present.
    pub fn add_addr(&self, index: u32, host: IpAddr) -> bool {
        let mut g = self.inner.write().unwrap();
        let Some(iface) = g.find_mut(index) else {
            return false;
        };
        if iface.addrs.iter().any(|a| a.host == host) {
            return false;
        }
        iface.addrs.push(AddrRecord {
            host,
            is_virtual: false,
        });
        g.reverse_insert(host, index);
        true
    }

    pub fn remove_addr(&self, index: u32, host: &IpAddr) -> bool {
        let mut g = self.inner.write().unwrap();
        let Some(iface) = g.find_mut(index) else {
            return false;
        };
        let before = iface.addrs.len();
        let mut removed_virtual = false;
        iface.addrs.retain(|a| {
            let drop = a.host == *host;
            if drop {
                removed_virtual = a.is_virtual;
            }
            !drop
        });
        let changed = iface.addrs.len() != before;
        if changed && !removed_virtual {
            g.reverse_remove(host, index);
        }
        changed
    }

    /// Replaces an interface's entire address list with `fresh`, rebuilding
    /// the reverse-index entries it owned. Used on link-state transitions
    /// (§4.3.2), which can implicitly add/drop addresses the kernel never
    /// announces individually.
    pub fn repopulate(&self, index: u32, fresh: Vec<IpAddr>) {
        let mut g = self.inner.write().unwrap();
        let Some(pos) = g.interfaces.iter().position(|i| i.index == index) else {
            return;
        };
        let old_hosts: Vec<IpAddr> = g.interfaces[pos]
            .addrs
            .iter()
            .filter(|a| !a.is_virtual)
            .map(|a| a.host)
            .collect();
        let virtual_addrs: Vec<AddrRecord> = g.interfaces[pos]
            .addrs
            .iter()
            .filter(|a| a.is_virtual)
            .copied()
            .collect();
        for host in &old_hosts {
            g.reverse_remove(host, index);
        }

        let mut new_addrs = virtual_addrs;
        for host in fresh {
            if new_addrs.iter().any(|a| a.host == host) {
                continue;
            }
            new_addrs.push(AddrRecord {
                host,
                is_virtual: false,
            });
        }
        for a in new_addrs.iter().filter(|a| !a.is_virtual) {
            g.reverse.entry(a.host).or_default().push(index);
        }
        g.interfaces[pos].addrs = new_addrs;
    }

    /// Marks an interface's address record for `host` virtual, and — per
    /// the resolved open question in SPEC_FULL.md §4.5 — removes its now-
    /// stale reverse-index entry in the same critical section.
    pub fn mark_virtual(&self, index: u32, host: &IpAddr) -> bool {
        let mut g = self.inner.write().unwrap();
        let Some(iface) = g.find_mut(index) else {
            return false;
        };
        let Some(rec) = iface.addrs.iter_mut().find(|a| a.host == *host) else {
            return false;
        };
        rec.is_virtual = true;
        g.reverse_remove(host, index);
        true
    }

    /// Resolves `ip` to the name of an interface satisfying `predicate`.
    pub fn lookup_name(&self, ip: &IpAddr, predicate: NamePredicate) -> Option<String> {
        let g = self.inner.read().unwrap();
        let candidates = g.reverse.get(ip)?;
        for idx in candidates {
            if let Some(iface) = g.find(*idx) {
                let ok = match predicate {
                    NamePredicate::UpAndUsable => iface.is_up() && iface.usable,
                    NamePredicate::UpAny => iface.is_up(),
                };
                if ok {
                    return Some(iface.name.clone());
                }
            }
        }
        None
    }

    pub fn interface_by_index(&self, index: u32) -> Option<Interface> {
        self.inner.read().unwrap().find(index).cloned()
    }

    pub fn interface_by_name(&self, name: &str) -> Option<Interface> {
        self.inner
            .read()
            .unwrap()
            .interfaces
            .iter()
            .find(|i| i.name == name)
            .cloned()
    }

    /// Per spec.md §4.2: the read lock is held for the entire enumeration,
    /// released only when the returned `AddrEnumerator` is dropped.
    pub fn enumerate(&self, mask: EnumMask) -> AddrEnumerator<'_> {
        let guard = self.inner.read().unwrap();
        let mut items = Vec::new();
        for iface in &guard.interfaces {
            let excluded = !(mask.contains(EnumMask::IGNORED) || iface.usable)
                || !(mask.contains(EnumMask::LOOPBACK) || !iface.is_loopback())
                || !(mask.contains(EnumMask::DOWN) || iface.is_up());
            if excluded {
                continue;
            }
            for a in &iface.addrs {
                if is_ipv6_link_local(&a.host) {
                    continue;
                }
                let class_ok = if a.is_virtual {
                    mask.contains(EnumMask::VIRTUAL)
                } else {
                    mask.contains(EnumMask::REGULAR)
                };
                if class_ok {
                    items.push(a.host);
                }
            }
        }
        AddrEnumerator {
            _guard: guard,
            items,
            pos: 0,
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl Cache {
    /// Checks, under a single read-lock acquisition, that every non-virtual
    /// address in every interface has a matching reverse-index entry. Used
    /// to observe §8 invariant (1)/(4) without the check itself racing the
    /// concurrent writer.
    fn is_consistent(&self) -> bool {
        let g = self.inner.read().unwrap();
        for iface in &g.interfaces {
            for a in &iface.addrs {
                if a.is_virtual {
                    if g.reverse.get(&a.host).is_some_and(|v| v.contains(&iface.index)) {
                        return false;
                    }
                } else if !g
                    .reverse
                    .get(&a.host)
                    .is_some_and(|v| v.contains(&iface.index))
                {
                    return false;
                }
            }
        }
        true
    }
}

/// Borrows the cache's read lock for its whole lifetime; dropping it
/// releases the lock. This is the concrete type behind spec.md §4.2's "the
/// caller releases by destroying the enumerator."
pub struct AddrEnumerator<'a> {
    _guard: RwLockReadGuard<'a, CacheInner>,
    items: Vec<IpAddr>,
    pos: usize,
}

impl Iterator for AddrEnumerator<'_> {
    type Item = IpAddr;
    fn next(&mut self) -> Option<IpAddr> {
        let item = self.items.get(self.pos).copied();
        self.pos += 1;
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn up_flags() -> u32 {
        libc::IFF_UP as u32
    }

    #[test]
    fn reverse_index_round_trips_with_interface_membership() {
        let cache = Cache::new();
        cache.add_or_find("eth0", 3, up_flags(), true);
        let ip: IpAddr = Ipv4Addr::new(10, 1, 0, 5).into();
        assert!(cache.add_addr(3, ip));
        assert_eq!(
            cache.lookup_name(&ip, NamePredicate::UpAndUsable),
            Some("eth0".to_string())
        );
        assert!(cache.remove_addr(3, &ip));
        assert_eq!(cache.lookup_name(&ip, NamePredicate::UpAndUsable), None);
    }

    #[test]
    fn virtual_addresses_are_never_in_reverse_index() {
        let cache = Cache::new();
        cache.add_or_find("utun5", 9, up_flags(), true);
        let vip: IpAddr = Ipv4Addr::new(10, 99, 0, 1).into();
        cache.add_addr(9, vip);
        assert!(cache.mark_virtual(9, &vip));
        assert_eq!(cache.lookup_name(&vip, NamePredicate::UpAny), None);
        let iface = cache.interface_by_index(9).unwrap();
        assert!(iface.addrs().iter().any(|a| a.host == vip && a.is_virtual));
    }

    #[test]
    fn enumerate_splits_regular_and_virtual() {
        let cache = Cache::new();
        cache.add_or_find("utun5", 9, up_flags(), true);
        let reg: IpAddr = Ipv4Addr::new(192, 168, 1, 5).into();
        let vip: IpAddr = Ipv4Addr::new(10, 99, 0, 1).into();
        cache.add_addr(9, reg);
        cache.add_addr(9, vip);
        cache.mark_virtual(9, &vip);

        let regular: Vec<_> = cache.enumerate(EnumMask::REGULAR).collect();
        assert_eq!(regular, vec![reg]);
        let virt: Vec<_> = cache.enumerate(EnumMask::VIRTUAL).collect();
        assert_eq!(virt, vec![vip]);
    }

    #[test]
    fn ipv6_link_local_is_never_enumerated() {
        let cache = Cache::new();
        cache.add_or_find("en0", 4, up_flags(), true);
        let ll: IpAddr = "fe80::1".parse().unwrap();
        cache.add_addr(4, ll);
        let all = cache.enumerate(EnumMask::REGULAR | EnumMask::VIRTUAL);
        assert_eq!(all.count(), 0);
    }

    #[test]
    fn repopulate_replaces_regular_addresses_but_keeps_virtual() {
        let cache = Cache::new();
        cache.add_or_find("utun5", 9, up_flags(), true);
        let old: IpAddr = Ipv4Addr::new(192, 168, 1, 5).into();
        let vip: IpAddr = Ipv4Addr::new(10, 99, 0, 1).into();
        cache.add_addr(9, old);
        cache.add_addr(9, vip);
        cache.mark_virtual(9, &vip);

        let fresh: IpAddr = Ipv4Addr::new(192, 168, 1, 6).into();
        cache.repopulate(9, vec![fresh]);

        assert_eq!(cache.lookup_name(&old, NamePredicate::UpAny), None);
        assert_eq!(
            cache.lookup_name(&fresh, NamePredicate::UpAny),
            Some("utun5".to_string())
        );
        let iface = cache.interface_by_index(9).unwrap();
        assert!(iface.addrs().iter().any(|a| a.host == vip && a.is_virtual));
    }

    #[test]
    fn concurrent_readers_never_see_a_torn_interface() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(Cache::new());
        cache.add_or_find("eth0", 1, up_flags(), true);

        let writer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..500u32 {
                    let ip: IpAddr = Ipv4Addr::new(10, 0, 0, (i % 250) as u8).into();
                    if i % 2 == 0 {
                        cache.add_addr(1, ip);
                    } else {
                        cache.remove_addr(1, &ip);
                    }
                }
            })
        };

        for _ in 0..200 {
            assert!(cache.is_consistent());
        }
        writer.join().unwrap();
    }
}
