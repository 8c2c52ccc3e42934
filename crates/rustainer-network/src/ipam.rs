//! Container address allocation.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use rustainer_common::{RustainerError, RustainerResult};

/// Hands out host addresses of one subnet, lowest free first.
///
/// The network, gateway and broadcast addresses are never allocated. A
/// single instance is shared by every concurrent Attach and Detach; all
/// bookkeeping happens under an internal lock.
#[derive(Debug)]
pub struct AddressAllocator {
    subnet: Ipv4Net,
    gateway: Ipv4Addr,
    allocated: Mutex<BTreeSet<Ipv4Addr>>,
}

impl AddressAllocator {
    /// Create an allocator for a subnet with its gateway reserved.
    #[must_use]
    pub fn new(subnet: Ipv4Net, gateway: Ipv4Addr) -> Self {
        Self {
            subnet: subnet.trunc(),
            gateway,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    /// The managed subnet.
    #[must_use]
    pub const fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    /// The reserved gateway address.
    #[must_use]
    pub const fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// Allocate the lowest free address.
    ///
    /// # Errors
    ///
    /// Returns [`RustainerError::PoolExhausted`] when every host address is
    /// in use.
    pub fn allocate(&self) -> RustainerResult<Ipv4Addr> {
        let mut allocated = self.allocated.lock();
        let ip = self
            .hosts()
            .find(|ip| !allocated.contains(ip))
            .ok_or_else(|| RustainerError::PoolExhausted {
                subnet: self.subnet.to_string(),
            })?;
        allocated.insert(ip);
        tracing::debug!(ip = %ip, "Allocated address");
        Ok(ip)
    }

    /// Return an address to the pool. Returns `false` if it was already free.
    pub fn release(&self, ip: Ipv4Addr) -> bool {
        let released = self.allocated.lock().remove(&ip);
        if released {
            tracing::debug!(ip = %ip, "Released address");
        }
        released
    }

    /// Whether an address is currently allocated.
    #[must_use]
    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.allocated.lock().contains(&ip)
    }

    /// Number of allocated addresses.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.allocated.lock().len()
    }

    fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        let gateway = self.gateway;
        self.subnet.hosts().filter(move |ip| *ip != gateway)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn allocator(cidr: &str) -> AddressAllocator {
        let subnet: Ipv4Net = cidr.parse().unwrap();
        let gateway = subnet.hosts().next().unwrap();
        AddressAllocator::new(subnet, gateway)
    }

    #[test]
    fn lowest_free_first() {
        let alloc = allocator("172.18.0.0/16");
        assert_eq!(alloc.allocate().unwrap(), Ipv4Addr::new(172, 18, 0, 2));
        assert_eq!(alloc.allocate().unwrap(), Ipv4Addr::new(172, 18, 0, 3));
        assert!(alloc.release(Ipv4Addr::new(172, 18, 0, 2)));
        assert_eq!(alloc.allocate().unwrap(), Ipv4Addr::new(172, 18, 0, 2));
    }

    #[test]
    fn release_is_idempotent() {
        let alloc = allocator("10.0.0.0/24");
        let ip = alloc.allocate().unwrap();
        assert!(alloc.release(ip));
        assert!(!alloc.release(ip));
        assert!(!alloc.release(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(alloc.allocated_count(), 0);
    }

    #[test]
    fn exhaustion() {
        // /29: .1 gateway, .2-.6 usable, .7 broadcast
        let alloc = allocator("10.0.0.0/29");
        let ips: Vec<_> = (0..5).map(|_| alloc.allocate().unwrap()).collect();
        assert_eq!(ips.first(), Some(&Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(ips.last(), Some(&Ipv4Addr::new(10, 0, 0, 6)));
        assert!(matches!(
            alloc.allocate(),
            Err(RustainerError::PoolExhausted { .. })
        ));
        assert!(!alloc.is_allocated(Ipv4Addr::new(10, 0, 0, 7)));
    }

    proptest! {
        #[test]
        fn live_addresses_are_unique(ops in proptest::collection::vec(any::<Option<u8>>(), 1..200)) {
            let alloc = allocator("10.0.0.0/26");
            let mut live: Vec<Ipv4Addr> = Vec::new();
            for op in ops {
                match op {
                    None => {
                        if let Ok(ip) = alloc.allocate() {
                            prop_assert!(!live.contains(&ip));
                            prop_assert!(ip != alloc.gateway());
                            live.push(ip);
                        }
                    }
                    Some(i) if !live.is_empty() => {
                        let ip = live.remove(usize::from(i) % live.len());
                        prop_assert!(alloc.release(ip));
                    }
                    Some(_) => {}
                }
            }
            prop_assert_eq!(alloc.allocated_count(), live.len());
        }

        #[test]
        fn allocation_returns_lowest_free(taken in proptest::collection::btree_set(2u8..60, 0..40)) {
            let alloc = allocator("10.0.0.0/26");
            for last in 2u8..60 {
                prop_assert_eq!(alloc.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, last));
            }
            for last in (2u8..60).filter(|n| !taken.contains(n)) {
                prop_assert!(alloc.release(Ipv4Addr::new(10, 0, 0, last)));
            }
            let expected = (2u8..63).find(|n| !taken.contains(n)).unwrap();
            prop_assert_eq!(alloc.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, expected));
        }
    }
}
