//! # Pumicite Memory
//!
//! Shared GPU memory pools and thread-affine resource lifetime tracking for Vulkan.
//!
//! The crate sits between an application that creates Vulkan buffers and images and
//! the device memory model underneath. It covers three concerns:
//!
//! - **Placement.** The [`Allocator`] owns two long-lived memory pools exported with
//!   OS handle types, so the memory can be imported by another API or process. Each
//!   request is placed either in the block pool, sub-allocated from fixed-size blocks,
//!   or in the dedicated pool when the resource is too large or the driver asks for a
//!   dedicated allocation.
//! - **Capability negotiation.** Image configurations are probed against the device
//!   before creation. Unsupported ones are relaxed by dropping storage usage, then by
//!   falling back to linear tiling. See [`format`].
//! - **Lifetime.** Every allocation is registered with the creating thread's
//!   [`ObjectHeap`](registry::ObjectHeap). Any thread can request its destruction; the
//!   native free happens on the owning thread during an explicit collection pass.
//!   See [`registry`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use pumicite_memory::prelude::*;
//!
//! # fn run(device: Device) -> pumicite_memory::Result<()> {
//! let allocator = Allocator::new(device, AllocatorConfig::default())?;
//! let registry = Registry::new();
//! let heap = registry.attach_current_thread();
//!
//! let mut info = vk::ImageCreateInfo {
//!     image_type: vk::ImageType::TYPE_2D,
//!     format: vk::Format::R16G16B16A16_SFLOAT,
//!     extent: vk::Extent3D { width: 1920, height: 1080, depth: 1 },
//!     mip_levels: 1,
//!     array_layers: 1,
//!     samples: vk::SampleCountFlags::TYPE_1,
//!     tiling: vk::ImageTiling::OPTIMAL,
//!     usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
//!     ..Default::default()
//! };
//! // `info` is updated if the device needed the request relaxed.
//! let image = allocator.alloc_shared_image(&heap, &mut info, &Default::default())?;
//!
//! image.request_free();
//! heap.collect()?;
//! registry.detach_current_thread()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! Diagnostics are emitted through [`tracing`]. Relaxed image configurations and
//! leaked resources are reported at the `warn` level; the library never installs a
//! subscriber.

pub mod alloc;
pub mod backend;
pub mod buffer;
pub mod device;
mod error;
pub mod format;
pub mod image;
pub mod registry;
pub mod utils;
pub mod vma;

#[cfg(test)]
mod testing;

pub use alloc::{Allocator, AllocatorConfig, HandleOwnership, MemoryPool};
pub use device::{Device, HasDevice};
pub use error::{Error, Result, VkResultExt};

pub use ash;
pub use vk_mem;

pub mod prelude {
    pub use crate::{
        Allocator, AllocatorConfig, Device, HasDevice, ash,
        ash::vk,
        buffer::BufferAllocation,
        image::ImageAllocation,
        registry::{Managed, ObjectHeap, Registry, Resource},
        utils::AsVkHandle,
        vk_mem,
    };
}
