//! # vkwrap
//!
//! Device-memory interception layer for a Vulkan passthrough shim.
//!
//! When an application asks for host-visible memory on a device with the
//! placed-mapping capability enabled, this layer transparently arranges
//! for the allocation to be backed by a shareable kernel handle — a
//! dma-buf file descriptor or a platform hardware-buffer — even when the
//! wrapped driver cannot directly provide the requested handle type.
//! Mapping at a caller-supplied fixed address is then served with a
//! direct kernel mapping of the backing handle instead of the driver's
//! own map entry point.
//!
//! ## Architecture
//!
//! - [`DeviceMemoryLayer`]: per-device entry points (allocate, free,
//!   map, unmap) and the import/export fallback negotiation
//! - [`NativeDriver`]: the outbound surface to the wrapped driver, with
//!   an [`AshDriver`] implementation over a real dispatch table
//! - [`HeapAllocator`] / [`DmaHeap`]: shareable-memory allocation from
//!   the kernel's dma-heap (or legacy ION) interface
//! - [`HandleRegistry`]: the only persistent state — one record per
//!   intercepted allocation, keyed by the opaque memory-object handle
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vkwrap::{AshDriver, DeviceConfig, DeviceMemoryLayer, DmaHeap};
//!
//! let driver = Arc::new(AshDriver::new(&instance, device));
//! let layer = DeviceMemoryLayer::new(
//!     driver,
//!     DmaHeap::open().ok().map(|heap| Box::new(heap) as _),
//!     DeviceConfig {
//!         memory_types,
//!         map_placed: true,
//!         platform_buffers: false,
//!     },
//! );
//!
//! let memory = layer.allocate_memory(request)?;
//! let ptr = layer.map_memory2(map_request)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod driver;
pub mod error;
pub mod heap;
pub mod hwbuf;
pub mod memory;
pub mod registry;

pub use driver::{AllocateInfo, AshDriver, ExternalAllocate, HandleKind, NativeDriver};
pub use error::{Error, Result};
pub use heap::{DmaHeap, HeapAllocator};
pub use hwbuf::{HardwareBuffer, PlatformBuffer};
pub use memory::{DeviceConfig, DeviceMemoryLayer, MapInfo, UnmapInfo};
pub use registry::{Backing, HandleRegistry, Mapping, MemoryRecord};
