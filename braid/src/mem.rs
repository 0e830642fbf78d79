//! Registered memory regions and key management.
//!
//! An [`Mr`] is a locally registered region a peer can address by [`Key`].
//! Remote registrations learned from key-import messages live in a per
//! connection [`KeyCache`], swapped lock-free on install/revoke so the hot
//! path never takes a lock.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use crate::error::{FabricError, status};

// MR access rights.
pub const MR_GET: u8 = 0x01;
pub const MR_PUT: u8 = 0x02;
pub const MR_REMOTE_GET: u8 = 0x04;
pub const MR_REMOTE_PUT: u8 = 0x08;
pub const MR_ALL: u8 = MR_GET | MR_PUT | MR_REMOTE_GET | MR_REMOTE_PUT;

/// Opaque identifier a peer uses to address a registered region.
///
/// `internal` marks provider-created registrations (eager buffers and the
/// like) that live in a separate namespace from user keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    pub id: u64,
    pub internal: bool,
}

/// A chunk of registerable memory.
///
/// Reads and writes go through raw pointer copies because transfers complete
/// asynchronously while other regions are being filled.
pub struct MemRegion {
    buf: UnsafeCell<Box<[u8]>>,
    len: usize,
}

// SAFETY: access is coordinated by the messaging protocol; concurrent
// accesses target disjoint byte ranges (each in-flight transfer owns its
// destination range until its completion is reported).
unsafe impl Send for MemRegion {}
unsafe impl Sync for MemRegion {}

impl MemRegion {
    pub fn new(len: usize) -> Arc<MemRegion> {
        Arc::new(MemRegion {
            buf: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
            len,
        })
    }

    pub fn from_vec(data: Vec<u8>) -> Arc<MemRegion> {
        let len = data.len();
        Arc::new(MemRegion {
            buf: UnsafeCell::new(data.into_boxed_slice()),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn base_ptr(&self) -> *mut u8 {
        // SAFETY: the box is never reallocated after construction.
        unsafe { (*self.buf.get()).as_mut_ptr() }
    }

    fn check(&self, off: u64, len: usize) -> Result<usize, FabricError> {
        let off = usize::try_from(off).map_err(|_| FabricError::Io)?;
        if off.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(FabricError::Io);
        }
        Ok(off)
    }

    pub fn read(&self, off: u64, dst: &mut [u8]) -> Result<(), FabricError> {
        let off = self.check(off, dst.len())?;
        // SAFETY: bounds checked above; see the Send/Sync note.
        unsafe { ptr::copy_nonoverlapping(self.base_ptr().add(off), dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    pub fn write(&self, off: u64, src: &[u8]) -> Result<(), FabricError> {
        let off = self.check(off, src.len())?;
        // SAFETY: bounds checked above; see the Send/Sync note.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.base_ptr().add(off), src.len()) };
        Ok(())
    }

    /// Raw pointer for native atomic execution. Caller has validated bounds
    /// and alignment via [`Mr::check_access`].
    pub(crate) fn raw_at(&self, off: u64) -> *mut u8 {
        debug_assert!((off as usize) < self.len || self.len == 0);
        // SAFETY: bounds validated by the caller.
        unsafe { self.base_ptr().add(off as usize) }
    }
}

/// A locally registered memory region.
#[derive(Clone)]
pub struct Mr {
    pub key: Key,
    /// Virtual base address the peer uses in wire messages.
    pub base: u64,
    pub len: u64,
    pub access: u8,
    pub region: Arc<MemRegion>,
}

impl Mr {
    /// Validate a `[vaddr, vaddr+len)` access and translate to a region
    /// offset. Returns a wire status on violation.
    pub fn check_access(&self, vaddr: u64, len: u64, access: u8) -> Result<u64, i32> {
        if self.access & access != access {
            return Err(status::NO_KEY);
        }
        let end = vaddr.checked_add(len).ok_or(status::NO_KEY)?;
        if vaddr < self.base || end > self.base + self.len {
            return Err(status::NO_KEY);
        }
        Ok(vaddr - self.base)
    }
}

/// Table of local registrations, shared by an endpoint's contexts.
pub struct MrTable {
    inner: Mutex<HashMap<Key, Arc<Mr>>>,
    next_user: AtomicU64,
    next_internal: AtomicU64,
}

impl MrTable {
    pub fn new() -> Arc<MrTable> {
        Arc::new(MrTable {
            inner: Mutex::new(HashMap::new()),
            next_user: AtomicU64::new(1),
            next_internal: AtomicU64::new(1),
        })
    }

    /// Register a region at a caller-chosen virtual base.
    pub fn register(
        &self,
        region: Arc<MemRegion>,
        base: u64,
        access: u8,
        internal: bool,
    ) -> Arc<Mr> {
        let ctr = if internal {
            &self.next_internal
        } else {
            &self.next_user
        };
        let key = Key {
            id: ctr.fetch_add(1, Ordering::Relaxed),
            internal,
        };
        let mr = Arc::new(Mr {
            key,
            base,
            len: region.len() as u64,
            access,
            region,
        });
        self.inner.lock().unwrap().insert(key, mr.clone());
        mr
    }

    pub fn find(&self, key: Key) -> Option<Arc<Mr>> {
        self.inner.lock().unwrap().get(&key).cloned()
    }

    pub fn unregister(&self, key: Key) -> bool {
        self.inner.lock().unwrap().remove(&key).is_some()
    }
}

/// A peer registration installed from a key-import message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteKey {
    pub key: Key,
    pub base: u64,
    pub len: u64,
    pub access: u8,
}

impl RemoteKey {
    /// Validate a remote access against the imported registration.
    pub fn check_access(&self, vaddr: u64, len: u64, access: u8) -> Result<(), i32> {
        if self.access & access != access {
            return Err(status::NO_KEY);
        }
        let end = vaddr.checked_add(len).ok_or(status::NO_KEY)?;
        if vaddr < self.base || end > self.base + self.len {
            return Err(status::NO_KEY);
        }
        Ok(())
    }
}

/// Per-connection cache of the peer's exported keys.
///
/// Read on every transfer setup; mutated only by key import/revoke, so the
/// map is cloned and swapped rather than locked.
pub struct KeyCache {
    map: ArcSwap<HashMap<Key, RemoteKey>>,
}

impl KeyCache {
    pub fn new() -> KeyCache {
        KeyCache {
            map: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    pub fn get(&self, key: Key) -> Option<RemoteKey> {
        self.map.load().get(&key).copied()
    }

    pub fn insert(&self, rkey: RemoteKey) {
        let mut map = (**self.map.load()).clone();
        map.insert(rkey.key, rkey);
        self.map.store(Arc::new(map));
    }

    pub fn revoke(&self, key: Key) -> bool {
        let mut map = (**self.map.load()).clone();
        let removed = map.remove(&key).is_some();
        self.map.store(Arc::new(map));
        removed
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new()
    }
}
