//! Outbound surface to the wrapped native driver.
//!
//! The negotiator talks to the underlying Vulkan implementation through
//! [`NativeDriver`], a trait covering exactly the calls the memory layer
//! forwards: allocate/free, descriptor-import compatibility queries,
//! shareable-handle retrieval, and map/unmap. Production code uses
//! [`AshDriver`] over the real dispatch table; tests inject fakes with
//! per-call failure injection.

use crate::error::{Error, Result};
use crate::hwbuf::HardwareBuffer;
use ash::vk;
use rustix::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ffi::c_void;
use std::ptr::NonNull;

/// Kinds of shareable handle the layer can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Kernel dma-buf file descriptor.
    DmaBuf,
    /// Platform hardware-buffer object.
    HardwareBuffer,
}

/// External-memory aspect of an allocation request.
pub enum ExternalAllocate {
    /// Import an existing shareable descriptor. The driver takes
    /// ownership of the fd when the allocation succeeds.
    ImportFd(OwnedFd),
    /// Import an existing platform hardware-buffer.
    ImportHardwareBuffer(HardwareBuffer),
    /// Request that the allocation be exportable as the given handle kind.
    Export(HandleKind),
}

/// An allocation request, inbound and driver-facing alike.
///
/// The negotiator forwards caller requests after rewriting the external
/// aspect and, on the import-retry path, the memory type index.
pub struct AllocateInfo {
    /// Requested size in bytes.
    pub allocation_size: u64,
    /// Index into the device's memory type table.
    pub memory_type_index: u32,
    /// Import or export request, if any.
    pub external: Option<ExternalAllocate>,
}

/// The subset of the native driver the memory layer calls out to.
pub trait NativeDriver: Send + Sync {
    /// Allocate device memory, possibly importing or exporting an
    /// external handle.
    fn allocate_memory(&self, info: AllocateInfo) -> Result<vk::DeviceMemory>;

    /// Free device memory. Must tolerate null and unknown handles.
    fn free_memory(&self, memory: vk::DeviceMemory);

    /// Bitmask of memory type indices compatible with importing the
    /// given dma-buf descriptor.
    fn fd_memory_type_bits(&self, fd: BorrowedFd<'_>) -> Result<u32>;

    /// Retrieve the dma-buf descriptor backing an exportable allocation.
    fn export_fd(&self, memory: vk::DeviceMemory) -> Result<OwnedFd>;

    /// Retrieve the hardware-buffer backing an exportable allocation.
    fn export_hardware_buffer(&self, memory: vk::DeviceMemory) -> Result<HardwareBuffer>;

    /// Map memory at a driver-chosen address. `size` of `None` maps the
    /// whole object.
    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: Option<u64>,
    ) -> Result<NonNull<c_void>>;

    /// Unmap a driver-established mapping.
    fn unmap_memory(&self, memory: vk::DeviceMemory);
}

/// [`NativeDriver`] over a real Vulkan device via `ash`.
///
/// Covers dma-buf import/export through `VK_KHR_external_memory_fd`.
/// Hardware-buffer entry points report [`Error::InvalidExternalHandle`]:
/// that handle kind only exists where the platform provides the buffer
/// object, and embedders on such platforms supply their own
/// [`NativeDriver`] wired to it. The negotiator never attempts
/// hardware-buffer export unless told the platform interface is
/// available.
pub struct AshDriver {
    device: ash::Device,
    external_memory_fd: ash::khr::external_memory_fd::Device,
}

impl AshDriver {
    /// Wrap an `ash` device. The device must have been created with
    /// `VK_KHR_external_memory_fd` and `VK_EXT_external_memory_dma_buf`
    /// enabled.
    #[must_use]
    pub fn new(instance: &ash::Instance, device: ash::Device) -> Self {
        let external_memory_fd = ash::khr::external_memory_fd::Device::new(instance, &device);
        Self {
            device,
            external_memory_fd,
        }
    }
}

impl NativeDriver for AshDriver {
    fn allocate_memory(&self, info: AllocateInfo) -> Result<vk::DeviceMemory> {
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(info.allocation_size)
            .memory_type_index(info.memory_type_index);

        match info.external {
            None => {
                let memory = unsafe { self.device.allocate_memory(&alloc_info, None) }?;
                Ok(memory)
            }
            Some(ExternalAllocate::ImportFd(fd)) => {
                let mut import_info = vk::ImportMemoryFdInfoKHR::default()
                    .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
                    .fd(fd.as_raw_fd());
                let alloc_info = alloc_info.push_next(&mut import_info);

                let memory = unsafe { self.device.allocate_memory(&alloc_info, None) }?;
                // The driver owns the fd once the import succeeds; on
                // failure `fd` drops and closes normally.
                std::mem::forget(fd);
                Ok(memory)
            }
            Some(ExternalAllocate::Export(HandleKind::DmaBuf)) => {
                let mut export_info = vk::ExportMemoryAllocateInfo::default()
                    .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
                let alloc_info = alloc_info.push_next(&mut export_info);

                let memory = unsafe { self.device.allocate_memory(&alloc_info, None) }?;
                Ok(memory)
            }
            Some(ExternalAllocate::Export(HandleKind::HardwareBuffer))
            | Some(ExternalAllocate::ImportHardwareBuffer(_)) => {
                Err(Error::InvalidExternalHandle)
            }
        }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }

    fn fd_memory_type_bits(&self, fd: BorrowedFd<'_>) -> Result<u32> {
        let mut props = vk::MemoryFdPropertiesKHR::default();
        unsafe {
            self.external_memory_fd.get_memory_fd_properties(
                vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
                fd.as_raw_fd(),
                &mut props,
            )
        }?;
        Ok(props.memory_type_bits)
    }

    fn export_fd(&self, memory: vk::DeviceMemory) -> Result<OwnedFd> {
        let get_fd_info = vk::MemoryGetFdInfoKHR::default()
            .memory(memory)
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

        let fd = unsafe { self.external_memory_fd.get_memory_fd(&get_fd_info) }?;
        // SAFETY: the driver returns a freshly created descriptor the
        // caller owns.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn export_hardware_buffer(&self, _memory: vk::DeviceMemory) -> Result<HardwareBuffer> {
        Err(Error::InvalidExternalHandle)
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        size: Option<u64>,
    ) -> Result<NonNull<c_void>> {
        let size = size.unwrap_or(vk::WHOLE_SIZE);
        let ptr = unsafe {
            self.device
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
        }?;
        NonNull::new(ptr).ok_or(Error::MapFailed)
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) };
    }
}
