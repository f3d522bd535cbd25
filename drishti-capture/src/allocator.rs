//! Per-worker multicast group allocation.
//!
//! Every concurrent capture worker gets its own multicast group so sessions
//! never see each other's traffic. Groups are handed out lazily: the first
//! request from a worker takes the next number from a shared counter and the
//! result is memoized, so later requests from the same worker (retries, the
//! next media item) reuse the same group.
//!
//! ```text
//! group_base 224.83.83.0, port 10006
//!   worker A → 224.83.83.1:10006
//!   worker B → 224.83.83.2:10006
//!   worker A → 224.83.83.1:10006   (memoized)
//! ```

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, ThreadId};

/// First allocation number handed out
const FIRST_GROUP: u32 = 1;

/// Highest value the last octet can take
const LAST_GROUP: u32 = u8::MAX as u32;

/// Multicast group plus port used by one capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MulticastAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl MulticastAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for MulticastAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Hands out one multicast group per worker identity.
///
/// Shared between workers behind an `Arc`. The counter bump and the
/// memoization happen under one lock, so two workers can never observe the
/// same group.
pub struct AddressAllocator<K = ThreadId> {
    prefix: [u8; 3],
    port: u16,
    counter: AtomicU32,
    assigned: Mutex<HashMap<K, MulticastAddress>>,
}

impl<K: Eq + Hash> AddressAllocator<K> {
    /// Create an allocator for groups `a.b.c.N` derived from `group_base`.
    pub fn new(group_base: Ipv4Addr, port: u16) -> Result<Self> {
        if !group_base.is_multicast() {
            return Err(Error::InvalidParameter(format!(
                "group base {} is not a multicast address",
                group_base
            )));
        }

        let [a, b, c, _] = group_base.octets();
        Ok(Self {
            prefix: [a, b, c],
            port,
            counter: AtomicU32::new(FIRST_GROUP),
            assigned: Mutex::new(HashMap::new()),
        })
    }

    /// Address for `worker`, allocating one on first use.
    pub fn address_for(&self, worker: K) -> Result<MulticastAddress> {
        let mut assigned = self.assigned.lock();
        if let Some(address) = assigned.get(&worker) {
            return Ok(*address);
        }

        let n = self.counter.load(Ordering::Relaxed);
        if n > LAST_GROUP {
            return Err(Error::AddressSpaceExhausted { requested: n });
        }
        self.counter.store(n + 1, Ordering::Relaxed);

        let [a, b, c] = self.prefix;
        let address = MulticastAddress::new(Ipv4Addr::new(a, b, c, n as u8), self.port);
        assigned.insert(worker, address);

        log::debug!("Allocated multicast group {} (#{})", address, n);
        Ok(address)
    }
}

impl AddressAllocator<ThreadId> {
    /// Address for the calling thread
    pub fn address_for_current_thread(&self) -> Result<MulticastAddress> {
        self.address_for(thread::current().id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn allocator() -> AddressAllocator<u32> {
        AddressAllocator::new(Ipv4Addr::new(224, 83, 83, 0), 10006).unwrap()
    }

    #[test]
    fn test_first_address_uses_one() {
        let alloc = allocator();
        let address = alloc.address_for(42).unwrap();
        assert_eq!(address.ip, Ipv4Addr::new(224, 83, 83, 1));
        assert_eq!(address.port, 10006);
        assert_eq!(address.to_string(), "224.83.83.1:10006");
    }

    #[test]
    fn test_same_worker_is_memoized() {
        let alloc = allocator();
        let first = alloc.address_for(1).unwrap();
        let other = alloc.address_for(2).unwrap();
        let again = alloc.address_for(1).unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        // Repeat lookups do not consume a group
        assert_eq!(alloc.address_for(3).unwrap().ip, Ipv4Addr::new(224, 83, 83, 3));
    }

    #[test]
    fn test_concurrent_threads_get_distinct_addresses() {
        let alloc = Arc::new(
            AddressAllocator::<ThreadId>::new(Ipv4Addr::new(239, 0, 0, 0), 10006).unwrap(),
        );

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                thread::spawn(move || {
                    let first = alloc.address_for_current_thread().unwrap();
                    let second = alloc.address_for_current_thread().unwrap();
                    assert_eq!(first, second);
                    first
                })
            })
            .collect();

        let addresses: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(addresses.len(), 32);
    }

    #[test]
    fn test_exhaustion_is_fatal() {
        let alloc = allocator();
        for worker in 0..255 {
            alloc.address_for(worker).unwrap();
        }
        assert_eq!(
            alloc.address_for(0).unwrap().ip,
            Ipv4Addr::new(224, 83, 83, 1)
        );
        assert!(matches!(
            alloc.address_for(1000),
            Err(Error::AddressSpaceExhausted { requested: 256 })
        ));
    }

    #[test]
    fn test_rejects_unicast_base() {
        let result = AddressAllocator::<u32>::new(Ipv4Addr::new(192, 168, 1, 0), 10006);
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }
}
