use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::Mutex;

use util::{Error, Result};

use crate::allocator::{MemoryBlock, MemoryKind};

/// NIC device interface resolved from a local address. The transport
/// binds sockets to it; the substrate registers memory against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIface {
    pub address: Ipv4Addr,
}

impl DeviceIface {
    pub fn from_local_ip(address: Ipv4Addr) -> Self {
        DeviceIface { address }
    }
}

impl fmt::Display for DeviceIface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Opaque handle produced by registering a region with a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemKey(u64);

impl MemKey {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

struct RegistryState {
    next_key: u64,
    active: HashMap<u64, DeviceIface>,
    registered: u64,
    deregistered: u64,
}

lazy_static! {
    static ref REGISTRY: Mutex<RegistryState> = Mutex::new(RegistryState {
        next_key: 1,
        active: HashMap::new(),
        registered: 0,
        deregistered: 0,
    });
}

/// `registered - deregistered` across the process; zero at clean
/// shutdown.
pub fn registration_balance() -> i64 {
    let registry = REGISTRY.lock();
    registry.registered as i64 - registry.deregistered as i64
}

/// Releases a memory key. A key may be deregistered exactly once;
/// anything else is an argument error.
pub fn deregister(key: MemKey) -> Result<()> {
    let mut registry = REGISTRY.lock();
    if registry.active.remove(&key.0).is_none() {
        return Err(Error::invalid_argument(format!(
            "memory key {} is not registered",
            key.0
        )));
    }
    registry.deregistered += 1;
    Ok(())
}

/// A handle-and-range view into an owned allocation. Regions own bytes;
/// streams hold views. The backing block outlives every view, so streams
/// are always destroyed before the memory they point into.
#[derive(Clone)]
pub struct Region {
    block: Arc<MemoryBlock>,
    offset: usize,
    len: usize,
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("kind", &self.kind())
            .finish()
    }
}

impl Region {
    pub fn whole(block: MemoryBlock) -> Self {
        let len = block.len();
        Region {
            block: Arc::new(block),
            offset: 0,
            len,
        }
    }

    /// Carves a sub-view; used to distribute one registered allocation
    /// across many streams.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Region> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(Error::invalid_argument(format!(
                "slice {offset}+{len} exceeds region of {} bytes",
                self.len
            )));
        }
        Ok(Region {
            block: self.block.clone(),
            offset: self.offset + offset,
            len,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        // the block pointer is non-null and offset is bounds-checked at
        // construction
        unsafe { self.block.as_ptr().add(self.offset) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn kind(&self) -> MemoryKind {
        self.block.kind()
    }

    /// Registers this region with a NIC device interface, yielding a
    /// memory key. One region may be registered with several devices
    /// (one key per device), and every key must be deregistered before
    /// shutdown.
    pub fn register(&self, device: &DeviceIface) -> Result<MemKey> {
        if self.len == 0 {
            return Err(Error::invalid_argument("cannot register an empty region"));
        }
        let mut registry = REGISTRY.lock();
        let key = MemKey(registry.next_key);
        registry.next_key += 1;
        registry.active.insert(key.0, *device);
        registry.registered += 1;
        log::debug!(
            "registered {} bytes on {} as key {}",
            self.len,
            device,
            key.0
        );
        Ok(key)
    }
}

#[cfg(test)]
mod region_test {
    use super::*;
    use crate::allocator::{new_allocator, MemoryKind};

    fn region_of(len: usize) -> Region {
        let allocator = new_allocator(MemoryKind::Malloc).unwrap();
        Region::whole(allocator.allocate(len, 64).unwrap())
    }

    #[test]
    fn test_slice_bounds() {
        let region = region_of(4096);
        let sub = region.slice(1024, 512).unwrap();
        assert_eq!(sub.len(), 512);
        assert_eq!(sub.as_ptr() as usize, region.as_ptr() as usize + 1024);
        assert!(region.slice(4096, 1).is_err());
        assert!(region.slice(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_register_deregister_balance() {
        let region = region_of(4096);
        let device = DeviceIface::from_local_ip(Ipv4Addr::new(192, 168, 1, 10));

        let before = registration_balance();
        let key_a = region.register(&device).unwrap();
        let key_b = region.register(&device).unwrap();
        assert_eq!(registration_balance(), before + 2);

        deregister(key_a).unwrap();
        deregister(key_b).unwrap();
        assert_eq!(registration_balance(), before);

        // exactly-once: a second deregistration is an error
        assert!(deregister(key_a).is_err());
    }

    #[test]
    fn test_empty_region_not_registrable() {
        let region = region_of(64);
        let empty = region.slice(0, 0).unwrap();
        let device = DeviceIface::from_local_ip(Ipv4Addr::new(10, 0, 0, 1));
        assert!(empty.register(&device).is_err());
    }
}
