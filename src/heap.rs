//! Kernel heap allocation for shareable memory regions.
//!
//! Obtains anonymous, cross-process-shareable buffers as file descriptors
//! from one of two kernel subsystems: the modern dma-heap interface
//! (`/dev/dma_heap/system`) or the legacy ION interface (`/dev/ion`).
//! The returned fds back physical pages and can be imported by GPU
//! drivers as external memory.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use rustix::fs::{Mode, OFlags};
use rustix::io::Errno;

/// Source of kernel-heap-backed file descriptors.
///
/// This is the seam between the import/export negotiator and the kernel:
/// production code uses [`DmaHeap`], tests substitute a memfd-backed
/// allocator.
pub trait HeapAllocator: Send + Sync {
    /// Allocate `size` bytes of shareable memory, returning the backing fd.
    fn allocate(&self, size: usize) -> Result<OwnedFd>;
}

// dma-heap allocation ioctl. The kernel header is linux/dma-heap.h; the
// number is stable UAPI, so we declare it directly rather than binding
// the header.

/// `DMA_HEAP_IOCTL_ALLOC`: `_IOWR('H', 0x0, struct dma_heap_allocation_data)`
const DMA_HEAP_IOCTL_ALLOC: libc::c_ulong = 0xc018_4800;

/// `struct dma_heap_allocation_data` from linux/dma-heap.h.
#[repr(C)]
struct DmaHeapAllocationData {
    /// Requested length in bytes.
    len: u64,
    /// OUTPUT: allocated dma-buf fd.
    fd: u32,
    /// Flags applied to the new fd (`O_RDWR`, `O_CLOEXEC`).
    fd_flags: u32,
    /// Heap-specific flags; none defined for the system heap.
    heap_flags: u64,
}

/// Legacy `ION_IOC_ALLOC`: `_IOWR('I', 0, struct ion_allocation_data)`
const ION_IOC_ALLOC: libc::c_ulong = 0xc018_4900;

/// `struct ion_allocation_data` from the (staging) ION UAPI.
#[repr(C)]
struct IonAllocationData {
    /// Requested length in bytes.
    len: u64,
    /// Bitmask of acceptable heap ids.
    heap_id_mask: u32,
    /// Allocation flags; 0 means uncached.
    flags: u32,
    /// OUTPUT: allocated dma-buf fd.
    fd: u32,
    unused: u32,
}

/// ION system heap ids accepted by the legacy fallback:
/// `ION_HEAP_SYSTEM | ION_SYSTEM_HEAP_ID`.
const ION_SYSTEM_HEAP_MASK: u32 = (1 << 0) | (1 << 25);

/// Issue an ioctl, retrying while the call is interrupted by a signal or
/// transiently unavailable. Callers never observe `EINTR`/`EAGAIN`.
fn safe_ioctl<T>(fd: BorrowedFd<'_>, request: libc::c_ulong, arg: &mut T) -> Result<()> {
    loop {
        // SAFETY: `request` matches the layout of `T` for both heap ioctls
        // declared above, and `fd` is a valid open descriptor.
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request, arg as *mut T) };
        if ret >= 0 {
            return Ok(());
        }
        let errno =
            Errno::from_raw_os_error(std::io::Error::last_os_error().raw_os_error().unwrap_or(0));
        if errno != Errno::INTR && errno != Errno::AGAIN {
            return Err(Error::System(errno));
        }
    }
}

/// Kernel heap device shared by both allocation paths.
///
/// The device node is opened once per Vulkan device and reused for every
/// fallback allocation. Which ioctl succeeds depends on which subsystem
/// the node belongs to; [`DmaHeap::allocate`] tries the modern interface
/// first and falls back to the legacy one.
pub struct DmaHeap {
    heap: OwnedFd,
}

impl DmaHeap {
    /// Open the system heap device, preferring dma-heap over legacy ION.
    pub fn open() -> Result<Self> {
        let flags = OFlags::RDONLY | OFlags::CLOEXEC;
        let heap = rustix::fs::open("/dev/dma_heap/system", flags, Mode::empty())
            .or_else(|_| rustix::fs::open("/dev/ion", flags, Mode::empty()))?;
        Ok(Self { heap })
    }

    fn dma_heap_alloc(&self, size: usize) -> Result<OwnedFd> {
        let mut data = DmaHeapAllocationData {
            len: size as u64,
            fd: 0,
            fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            heap_flags: 0,
        };
        safe_ioctl(self.heap.as_fd(), DMA_HEAP_IOCTL_ALLOC, &mut data)?;
        // SAFETY: on success the kernel stored a freshly created fd we now own.
        Ok(unsafe { OwnedFd::from_raw_fd(data.fd as RawFd) })
    }

    fn ion_alloc(&self, size: usize) -> Result<OwnedFd> {
        let mut data = IonAllocationData {
            len: size as u64,
            heap_id_mask: ION_SYSTEM_HEAP_MASK,
            flags: 0, // uncached
            fd: 0,
            unused: 0,
        };
        safe_ioctl(self.heap.as_fd(), ION_IOC_ALLOC, &mut data)?;
        // SAFETY: on success the kernel stored a freshly created fd we now own.
        Ok(unsafe { OwnedFd::from_raw_fd(data.fd as RawFd) })
    }
}

impl HeapAllocator for DmaHeap {
    fn allocate(&self, size: usize) -> Result<OwnedFd> {
        self.dma_heap_alloc(size)
            .or_else(|_| self.ion_alloc(size))
            .map_err(|err| {
                tracing::warn!(%err, size, "kernel heap allocation failed on both paths");
                err
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Recompute `_IOWR(type, nr, size)` per asm-generic/ioctl.h.
    fn iowr(ty: u8, nr: u8, size: usize) -> libc::c_ulong {
        const IOC_READ: u64 = 2;
        const IOC_WRITE: u64 = 1;
        (((IOC_READ | IOC_WRITE) << 30) | ((size as u64) << 16) | ((ty as u64) << 8) | nr as u64)
            as libc::c_ulong
    }

    #[test]
    fn test_dma_heap_ioctl_number() {
        assert_eq!(std::mem::size_of::<DmaHeapAllocationData>(), 24);
        assert_eq!(
            DMA_HEAP_IOCTL_ALLOC,
            iowr(b'H', 0x0, std::mem::size_of::<DmaHeapAllocationData>())
        );
    }

    #[test]
    fn test_ion_ioctl_number() {
        assert_eq!(std::mem::size_of::<IonAllocationData>(), 24);
        assert_eq!(
            ION_IOC_ALLOC,
            iowr(b'I', 0x0, std::mem::size_of::<IonAllocationData>())
        );
    }

    #[test]
    fn test_ion_system_heap_mask() {
        assert_eq!(ION_SYSTEM_HEAP_MASK, 0x0200_0001);
    }
}
