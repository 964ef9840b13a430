//! Device-memory interception: allocation negotiation and placed mapping.
//!
//! A [`DeviceMemoryLayer`] sits between the application's memory calls
//! and the native driver. Host-visible allocations on devices with the
//! placed-mapping capability are intercepted so that every such
//! allocation ends up with a shareable backing handle — negotiated
//! through up to three strategies — which later lets `map` honor a
//! caller-supplied fixed address with a direct kernel mapping even when
//! the native driver cannot.
//!
//! # Fallback order
//!
//! 1. Native allocation with a dma-buf export request.
//! 2. Allocate from the kernel heap, query which memory types accept an
//!    import of that fd, retry the native allocation importing it.
//! 3. Native allocation with a platform hardware-buffer export request
//!    (only when the platform interface is available).
//!
//! Each attempt is tried and discarded locally; only the final failure
//! surfaces, and every transiently acquired resource is released on the
//! way out.

use crate::driver::{AllocateInfo, ExternalAllocate, HandleKind, NativeDriver};
use crate::error::{Error, Result};
use crate::heap::HeapAllocator;
use crate::hwbuf;
use crate::registry::{Backing, HandleRegistry, Mapping, MemoryRecord};
use ash::vk::{self, Handle};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::SeekFrom;
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

/// Capabilities and memory topology of the wrapped device.
pub struct DeviceConfig {
    /// Property flags of each memory type, indexed as the driver reports
    /// them.
    pub memory_types: Vec<vk::MemoryPropertyFlags>,
    /// Whether the placed-mapping extension and feature are enabled.
    /// When false, every call delegates straight to the native driver.
    pub map_placed: bool,
    /// Whether the platform hardware-buffer interface is available as an
    /// export fallback.
    pub platform_buffers: bool,
}

/// A memory-map request, in its extended (placed) form.
pub struct MapInfo {
    /// The memory object to map.
    pub memory: vk::DeviceMemory,
    /// Byte offset into the allocation for the returned pointer.
    pub offset: u64,
    /// Bytes to map; `None` maps the whole object.
    pub size: Option<u64>,
    /// Exact virtual address to map at, if the caller requested
    /// placement.
    pub placed_address: Option<NonNull<c_void>>,
}

/// A memory-unmap request, in its extended form.
pub struct UnmapInfo {
    /// The memory object to unmap.
    pub memory: vk::DeviceMemory,
    /// Keep the virtual address range reserved with an inaccessible
    /// placeholder mapping instead of fully unmapping.
    pub reserve: bool,
}

/// Per-device memory interception state.
///
/// Constructed at device creation, dropped at device destruction; holds
/// no global state. All operations are synchronous; same-object calls
/// follow the hosting API's external synchronization rules.
pub struct DeviceMemoryLayer {
    driver: Arc<dyn NativeDriver>,
    /// Kernel heap for the import-retry fallback. Absent when no heap
    /// device exists; the fallback then reports an invalid external
    /// handle.
    heap: Option<Box<dyn HeapAllocator>>,
    memory_types: Vec<vk::MemoryPropertyFlags>,
    map_placed: bool,
    platform_buffers: bool,
    registry: HandleRegistry,
}

impl DeviceMemoryLayer {
    /// Create the layer for one device.
    #[must_use]
    pub fn new(
        driver: Arc<dyn NativeDriver>,
        heap: Option<Box<dyn HeapAllocator>>,
        config: DeviceConfig,
    ) -> Self {
        Self {
            driver,
            heap,
            memory_types: config.memory_types,
            map_placed: config.map_placed,
            platform_buffers: config.platform_buffers,
            registry: HandleRegistry::new(),
        }
    }

    /// Allocate device memory on behalf of the application.
    ///
    /// Non-host-visible requests, and all requests while placed mapping
    /// is disabled, delegate unmodified to the native driver. Everything
    /// else is intercepted so the resulting allocation carries a
    /// shareable backing handle; see the module docs for the fallback
    /// order.
    pub fn allocate_memory(&self, info: AllocateInfo) -> Result<vk::DeviceMemory> {
        let required = self
            .memory_types
            .get(info.memory_type_index as usize)
            .copied()
            .unwrap_or_default();

        if !self.map_placed || !required.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return self.driver.allocate_memory(info);
        }
        self.allocate_intercepted(info, required)
    }

    fn allocate_intercepted(
        &self,
        info: AllocateInfo,
        required: vk::MemoryPropertyFlags,
    ) -> Result<vk::DeviceMemory> {
        let AllocateInfo {
            allocation_size,
            memory_type_index,
            external,
        } = info;

        // Transient resources live in `backing` until the record is
        // registered; every early return drops (and thus releases) them.
        let mut backing: Option<Backing> = None;
        let mut export_kind: Option<HandleKind> = None;

        let forward = |external| AllocateInfo {
            allocation_size,
            memory_type_index,
            external,
        };

        let allocated = match external {
            Some(ExternalAllocate::ImportHardwareBuffer(buffer)) => {
                backing = Some(Backing::HardwareBuffer(buffer.clone()));
                self.driver
                    .allocate_memory(forward(Some(ExternalAllocate::ImportHardwareBuffer(buffer))))
            }
            Some(ExternalAllocate::ImportFd(fd)) => {
                backing = Some(Backing::DmaBuf(dup_cloexec(fd.as_fd())?));
                self.driver
                    .allocate_memory(forward(Some(ExternalAllocate::ImportFd(fd))))
            }
            Some(ExternalAllocate::Export(kind)) => {
                export_kind = Some(kind);
                self.driver
                    .allocate_memory(forward(Some(ExternalAllocate::Export(kind))))
            }
            None => {
                // Step 1: ask the driver to export a dma-buf itself.
                match self
                    .driver
                    .allocate_memory(forward(Some(ExternalAllocate::Export(HandleKind::DmaBuf))))
                {
                    Ok(memory) => {
                        export_kind = Some(HandleKind::DmaBuf);
                        Ok(memory)
                    }
                    // Step 2: import a kernel-heap fd instead.
                    Err(_) => match self.import_heap_retry(allocation_size, required) {
                        Ok((memory, record_fd)) => {
                            backing = Some(Backing::DmaBuf(record_fd));
                            Ok(memory)
                        }
                        // Step 3: hardware-buffer export, when available.
                        Err(_) if self.platform_buffers => {
                            export_kind = Some(HandleKind::HardwareBuffer);
                            self.driver.allocate_memory(forward(Some(
                                ExternalAllocate::Export(HandleKind::HardwareBuffer),
                            )))
                        }
                        Err(err) => Err(err),
                    },
                }
            }
        };
        let memory = allocated?;

        if let Some(kind) = export_kind {
            backing = match self.query_exported_handle(memory, kind) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    self.driver.free_memory(memory);
                    return Err(err);
                }
            };
        }

        self.registry
            .insert(memory.as_raw(), MemoryRecord::new(allocation_size, backing));
        Ok(memory)
    }

    /// Allocate a heap fd, find a memory type index that accepts it as
    /// an import, and retry the native allocation importing it. Returns
    /// the new memory object plus a duplicate of the fd for the record.
    fn import_heap_retry(
        &self,
        allocation_size: u64,
        required: vk::MemoryPropertyFlags,
    ) -> Result<(vk::DeviceMemory, OwnedFd)> {
        let heap = self.heap.as_ref().ok_or(Error::InvalidExternalHandle)?;
        let fd = heap
            .allocate(allocation_size as usize)
            .map_err(|_| Error::InvalidExternalHandle)?;

        let mask = self
            .driver
            .fd_memory_type_bits(fd.as_fd())
            .map_err(|_| Error::InvalidExternalHandle)?;
        let memory_type_index = select_memory_type(&self.memory_types, required, mask)
            .ok_or(Error::InvalidExternalHandle)?;

        let record_fd = dup_cloexec(fd.as_fd())?;
        let memory = self.driver.allocate_memory(AllocateInfo {
            allocation_size,
            memory_type_index,
            external: Some(ExternalAllocate::ImportFd(fd)),
        })?;
        Ok((memory, record_fd))
    }

    fn query_exported_handle(&self, memory: vk::DeviceMemory, kind: HandleKind) -> Result<Backing> {
        match kind {
            HandleKind::DmaBuf => self.driver.export_fd(memory).map(Backing::DmaBuf),
            HandleKind::HardwareBuffer => self
                .driver
                .export_hardware_buffer(memory)
                .map(Backing::HardwareBuffer),
        }
    }

    /// Free device memory.
    ///
    /// Best-effort by contract: unmaps any active placed mapping,
    /// releases the backing handle, removes the record, and always
    /// forwards to the native free — even for null or unknown handles,
    /// matching native idempotency.
    pub fn free_memory(&self, memory: vk::DeviceMemory) {
        if let Some(record) = self.registry.remove(memory.as_raw()) {
            let mut record = record.lock().unwrap();
            if let Some(mapping) = record.mapping.take() {
                // SAFETY: the range was mapped by `map_memory2` with
                // exactly this base and length.
                unsafe {
                    let _ = rustix::mm::munmap(mapping.addr.as_ptr(), mapping.len);
                }
            }
            // Dropping the record closes the fd or releases the
            // hardware-buffer reference.
        }
        self.driver.free_memory(memory);
    }

    /// Map device memory, honoring a placed-address request when one is
    /// present.
    ///
    /// Without a placed address, or for objects this layer does not
    /// track, the call delegates to the native driver. For tracked
    /// objects the mapping is performed directly on the backing handle
    /// at the caller's address; mapping an already-mapped object
    /// succeeds only at the same address and returns the existing
    /// mapping without touching the kernel again.
    pub fn map_memory2(&self, info: MapInfo) -> Result<NonNull<c_void>> {
        let Some(addr) = info.placed_address else {
            return self.driver.map_memory(info.memory, info.offset, info.size);
        };
        let Some(record) = self.registry.get(info.memory.as_raw()) else {
            return self.driver.map_memory(info.memory, info.offset, info.size);
        };
        let mut record = record.lock().unwrap();

        if let Some(existing) = record.mapping {
            if existing.addr != addr {
                // Re-placement at a different address while mapped is
                // disallowed; the original mapping stays untouched.
                return Err(Error::MapFailed);
            }
            return Ok(offset_ptr(existing.addr, info.offset));
        }

        let mapping = place_mapping(&record, addr, info.size)?;
        record.mapping = Some(mapping);
        Ok(offset_ptr(mapping.addr, info.offset))
    }

    /// Legacy map entry point: no placement, delegates through
    /// [`Self::map_memory2`].
    pub fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: Option<u64>,
    ) -> Result<NonNull<c_void>> {
        self.map_memory2(MapInfo {
            memory,
            offset,
            size,
            placed_address: None,
        })
    }

    /// Unmap device memory.
    ///
    /// For tracked objects with a live placed mapping, either releases
    /// the mapping or — when `reserve` is set — replaces it with an
    /// inaccessible anonymous placeholder so the address range stays
    /// reserved. The record's map state is cleared either way, and the
    /// unmap is always forwarded to the native entry point.
    pub fn unmap_memory2(&self, info: UnmapInfo) -> Result<()> {
        let mut reserve_failed = false;

        if let Some(record) = self.registry.get(info.memory.as_raw()) {
            let mut record = record.lock().unwrap();
            if let Some(mapping) = record.mapping.take() {
                if info.reserve {
                    // SAFETY: replacing our own fixed mapping in place;
                    // the placeholder carries no access permissions.
                    let replaced = unsafe {
                        rustix::mm::mmap_anonymous(
                            mapping.addr.as_ptr(),
                            mapping.len,
                            ProtFlags::empty(),
                            MapFlags::PRIVATE | MapFlags::FIXED,
                        )
                    };
                    if let Err(errno) = replaced {
                        tracing::error!(%errno, "failed to replace mapping with a reservation");
                        reserve_failed = true;
                    }
                } else {
                    // SAFETY: the range was mapped by `map_memory2` with
                    // exactly this base and length.
                    unsafe {
                        let _ = rustix::mm::munmap(mapping.addr.as_ptr(), mapping.len);
                    }
                }
            }
        }

        self.driver.unmap_memory(info.memory);
        if reserve_failed {
            Err(Error::MapFailed)
        } else {
            Ok(())
        }
    }

    /// Legacy unmap entry point: full release, delegates through
    /// [`Self::unmap_memory2`].
    pub fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let _ = self.unmap_memory2(UnmapInfo {
            memory,
            reserve: false,
        });
    }

    /// Number of allocations currently tracked by the layer.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.registry.len()
    }

    /// Kind of shareable handle backing a tracked allocation, if any.
    #[must_use]
    pub fn backing_kind(&self, memory: vk::DeviceMemory) -> Option<HandleKind> {
        self.registry
            .get(memory.as_raw())
            .and_then(|record| record.lock().unwrap().backing_kind())
    }

    /// Base address and length of a tracked allocation's live placed
    /// mapping, if any.
    #[must_use]
    pub fn mapped_region(&self, memory: vk::DeviceMemory) -> Option<(NonNull<c_void>, usize)> {
        self.registry
            .get(memory.as_raw())
            .and_then(|record| record.lock().unwrap().mapping())
            .map(|mapping| (mapping.addr, mapping.len))
    }
}

/// Lowest memory type index whose property flags contain `required` and
/// whose bit is set in the driver-reported compatibility `mask`.
fn select_memory_type(
    types: &[vk::MemoryPropertyFlags],
    required: vk::MemoryPropertyFlags,
    mask: u32,
) -> Option<u32> {
    types
        .iter()
        .take(32)
        .enumerate()
        .find(|&(index, flags)| mask & (1u32 << index) != 0 && flags.contains(required))
        .map(|(index, _)| index as u32)
}

/// Establish the fixed mapping for an unmapped record.
fn place_mapping(record: &MemoryRecord, addr: NonNull<c_void>, size: Option<u64>) -> Result<Mapping> {
    let fd: BorrowedFd<'_> = match record.backing.as_ref() {
        Some(Backing::DmaBuf(fd)) => fd.as_fd(),
        Some(Backing::HardwareBuffer(buffer)) => {
            hwbuf::resolve_backing_fd(buffer.as_ref(), record.allocation_size)
                .ok_or(Error::MapFailed)?
        }
        None => return Err(Error::MapFailed),
    };

    let len = match size {
        Some(len) => len as usize,
        None if record.allocation_size > 0 => record.allocation_size as usize,
        // Whole-object mapping with an unknown allocation size: take the
        // backing descriptor's length.
        None => rustix::fs::seek(fd, SeekFrom::End(0)).map_err(|_| Error::MapFailed)? as usize,
    };

    // SAFETY: the caller requested fixed placement and guarantees the
    // target range is reserved for this mapping.
    let ptr = unsafe {
        rustix::mm::mmap(
            addr.as_ptr(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED | MapFlags::FIXED,
            fd,
            0,
        )
    }
    .map_err(|errno| {
        tracing::error!(%errno, len, "placed mmap failed");
        Error::MapFailed
    })?;

    Ok(Mapping {
        addr: NonNull::new(ptr).ok_or(Error::MapFailed)?,
        len,
    })
}

fn dup_cloexec(fd: BorrowedFd<'_>) -> Result<OwnedFd> {
    rustix::io::fcntl_dupfd_cloexec(fd, 0).map_err(Error::from)
}

fn offset_ptr(base: NonNull<c_void>, offset: u64) -> NonNull<c_void> {
    // SAFETY: the offset stays within the mapped allocation per the
    // hosting API's contract, so the result is non-null.
    unsafe { NonNull::new_unchecked(base.as_ptr().cast::<u8>().add(offset as usize).cast()) }
}
