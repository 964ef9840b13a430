//! Per-device bookkeeping for intercepted memory objects.
//!
//! Every allocation that required interception gets a [`MemoryRecord`]
//! keyed by the raw value of the driver-returned `VkDeviceMemory`. The
//! registry owns the records exclusively; callers look records up by
//! identifier on every memory-object operation and never take raw
//! ownership out of it.

use crate::driver::HandleKind;
use crate::hwbuf::HardwareBuffer;
use rustix::fd::OwnedFd;
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

/// The shareable handle backing an intercepted allocation.
///
/// Exactly one of the two variants is held; dropping it closes the
/// descriptor or releases the hardware-buffer reference.
pub enum Backing {
    /// A kernel dma-buf (or dma-heap) file descriptor.
    DmaBuf(OwnedFd),
    /// A platform hardware-buffer reference.
    HardwareBuffer(HardwareBuffer),
}

impl Backing {
    /// Which kind of shareable handle this is.
    #[must_use]
    pub fn kind(&self) -> HandleKind {
        match self {
            Self::DmaBuf(_) => HandleKind::DmaBuf,
            Self::HardwareBuffer(_) => HandleKind::HardwareBuffer,
        }
    }
}

/// An active placed mapping of a memory object.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Mapping {
    /// Base address of the mapping.
    pub addr: NonNull<c_void>,
    /// Mapped length in bytes; always non-zero while the mapping exists.
    pub len: usize,
}

// SAFETY: the address is only a bookkeeping value here; the caller
// observes the hosting API's external synchronization rules for access
// to the mapped range itself.
unsafe impl Send for Mapping {}
// SAFETY: see above.
unsafe impl Sync for Mapping {}

/// Extended state for one intercepted memory object.
pub struct MemoryRecord {
    pub(crate) allocation_size: u64,
    /// Set at most once, during allocation. `None` only for explicit
    /// export requests whose handle kind the layer cannot query.
    pub(crate) backing: Option<Backing>,
    /// Present exactly while a placed mapping is live.
    pub(crate) mapping: Option<Mapping>,
}

impl MemoryRecord {
    /// Create a record for a completed allocation.
    #[must_use]
    pub fn new(allocation_size: u64, backing: Option<Backing>) -> Self {
        Self {
            allocation_size,
            backing,
            mapping: None,
        }
    }

    /// Requested size of the allocation in bytes.
    #[must_use]
    pub fn allocation_size(&self) -> u64 {
        self.allocation_size
    }

    /// Kind of the backing handle, if one is held.
    #[must_use]
    pub fn backing_kind(&self) -> Option<HandleKind> {
        self.backing.as_ref().map(Backing::kind)
    }

    /// The active placed mapping, if any.
    #[must_use]
    pub fn mapping(&self) -> Option<Mapping> {
        self.mapping
    }
}

/// Process-visible mapping from memory-object identifier to record.
///
/// The outer lock covers structural changes only (insert, lookup,
/// remove), so operations on distinct memory objects proceed
/// concurrently. Mutation of one record happens under that record's own
/// lock; calls touching the same object are additionally subject to the
/// hosting API's external synchronization rules.
#[derive(Default)]
pub struct HandleRegistry {
    entries: Mutex<HashMap<u64, Arc<Mutex<MemoryRecord>>>>,
}

impl HandleRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a completed record under `key`.
    pub fn insert(&self, key: u64, record: MemoryRecord) {
        self.entries
            .lock()
            .unwrap()
            .insert(key, Arc::new(Mutex::new(record)));
    }

    /// Look up the record for `key`.
    #[must_use]
    pub fn get(&self, key: u64) -> Option<Arc<Mutex<MemoryRecord>>> {
        self.entries.lock().unwrap().get(&key).cloned()
    }

    /// Remove and return the record for `key`.
    #[must_use]
    pub fn remove(&self, key: u64) -> Option<Arc<Mutex<MemoryRecord>>> {
        self.entries.lock().unwrap().remove(&key)
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether no records are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
