//! Error types for the memory interception layer.

use ash::vk;
use thiserror::Error;

/// Result type alias using the layer's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Failure conditions surfaced by the memory interception layer.
///
/// The taxonomy mirrors what a Vulkan caller can observe: resource
/// exhaustion, an external handle the implementation cannot honor, and
/// mapping failures. Transient syscall interruptions (`EINTR`/`EAGAIN`)
/// are retried internally and never reach this type.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Host allocation failed.
    #[error("out of host memory")]
    OutOfHostMemory,

    /// Device allocation failed.
    #[error("out of device memory")]
    OutOfDeviceMemory,

    /// No kernel heap, no compatible memory type for an import, or a
    /// handle-property query failed.
    #[error("invalid external handle")]
    InvalidExternalHandle,

    /// A placed mapping could not be established or replaced.
    ///
    /// Diagnostic detail goes to the `tracing` error channel, not into
    /// the value.
    #[error("memory map failed")]
    MapFailed,

    /// Raw system call failure.
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),

    /// Any other result reported by the native driver, passed through
    /// unchanged.
    #[error("vulkan error: {0:?}")]
    Vulkan(vk::Result),
}

impl From<vk::Result> for Error {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_INVALID_EXTERNAL_HANDLE => Self::InvalidExternalHandle,
            vk::Result::ERROR_MEMORY_MAP_FAILED => Self::MapFailed,
            other => Self::Vulkan(other),
        }
    }
}

impl Error {
    /// Map back to a `VkResult` for the shim's C boundary.
    #[must_use]
    pub fn as_vk_result(&self) -> vk::Result {
        match self {
            Self::OutOfHostMemory => vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            Self::OutOfDeviceMemory => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            Self::InvalidExternalHandle => vk::Result::ERROR_INVALID_EXTERNAL_HANDLE,
            Self::MapFailed => vk::Result::ERROR_MEMORY_MAP_FAILED,
            Self::System(_) => vk::Result::ERROR_UNKNOWN,
            Self::Vulkan(result) => *result,
        }
    }
}
