//! Platform hardware-buffer abstraction.
//!
//! On platforms with an OS-level shareable buffer object (Android's
//! `AHardwareBuffer` being the canonical example), the driver can export
//! device memory as such a buffer when dma-buf export is unavailable.
//! This module models that interface without binding any one platform:
//! a buffer is a reference-counted object exposing the file descriptors
//! of its native handle.
//!
//! Reference semantics map onto `Arc`: cloning the handle acquires a
//! reference, dropping it releases one. Platform integrations implement
//! [`PlatformBuffer`] over the real object and release it in `Drop`.

use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::SeekFrom;
use std::sync::Arc;

/// A GPU-shareable buffer object owned by the platform.
pub trait PlatformBuffer: Send + Sync {
    /// File descriptors composing the buffer's native handle, in the
    /// order the platform declares them.
    fn native_fds(&self) -> &[OwnedFd];
}

/// Shared, reference-counted handle to a [`PlatformBuffer`].
pub type HardwareBuffer = Arc<dyn PlatformBuffer>;

/// Resolve the descriptor within a buffer's native handle that actually
/// backs an allocation of `min_size` bytes: the first fd, scanning in
/// declaration order, whose end-of-file offset is at least `min_size`.
pub(crate) fn resolve_backing_fd(buffer: &dyn PlatformBuffer, min_size: u64) -> Option<BorrowedFd<'_>> {
    buffer
        .native_fds()
        .iter()
        .find(|fd| matches!(rustix::fs::seek(fd, SeekFrom::End(0)), Ok(end) if end >= min_size))
        .map(AsFd::as_fd)
}
