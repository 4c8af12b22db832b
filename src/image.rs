//! Images bound to pooled memory.
//!
//! An [`ImageAllocation`] is produced by [`Allocator::alloc_shared_image`] or
//! [`Allocator::alloc_image`]. The create info passed to those functions may have
//! been relaxed by the capability probe; the accessors here report the parameters
//! the image was actually created with.

use std::fmt::Debug;

use ash::vk;
use glam::UVec3;

use crate::{
    Device, HasDevice,
    alloc::{Allocator, HandleOwnership, MemoryPool},
    backend::{MemoryBackend, MemoryInfo},
    registry::Resource,
    utils::AsVkHandle,
    vma::VmaBackend,
};

/// A regular image fully backed by memory.
pub struct ImageAllocation<B: MemoryBackend = VmaBackend> {
    allocator: Allocator<B>,
    _pool: Option<MemoryPool<B>>,
    image: vk::Image,
    memory: B::Memory,
    extent: UVec3,
    array_layer_count: u32,
    mip_level_count: u32,
    format: vk::Format,
    ty: vk::ImageType,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
    size: vk::DeviceSize,
    ownership: HandleOwnership,
    dedicated: bool,
}

impl<B: MemoryBackend> Debug for ImageAllocation<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageAllocation")
            .field("image", &self.image)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("usage", &self.usage)
            .field("tiling", &self.tiling)
            .field("ownership", &self.ownership)
            .field("dedicated", &self.dedicated)
            .finish_non_exhaustive()
    }
}

impl<B: MemoryBackend> AsVkHandle for ImageAllocation<B> {
    type Handle = vk::Image;

    fn vk_handle(&self) -> Self::Handle {
        self.image
    }
}

impl HasDevice for ImageAllocation<VmaBackend> {
    fn device(&self) -> &Device {
        self.allocator.device()
    }
}

impl<B: MemoryBackend> ImageAllocation<B> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        allocator: Allocator<B>,
        pool: Option<MemoryPool<B>>,
        image: vk::Image,
        memory: B::Memory,
        info: &vk::ImageCreateInfo,
        size: vk::DeviceSize,
        ownership: HandleOwnership,
        dedicated: bool,
    ) -> Self {
        Self {
            allocator,
            _pool: pool,
            image,
            memory,
            extent: UVec3::new(info.extent.width, info.extent.height, info.extent.depth),
            array_layer_count: info.array_layers,
            mip_level_count: info.mip_levels,
            format: info.format,
            ty: info.image_type,
            tiling: info.tiling,
            usage: info.usage,
            size,
            ownership,
            dedicated,
        }
    }

    pub fn allocator(&self) -> &Allocator<B> {
        &self.allocator
    }

    /// Returns the image extent as a 3D vector (width, height, depth).
    pub fn extent(&self) -> UVec3 {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Returns the image type (1D, 2D, or 3D).
    pub fn ty(&self) -> vk::ImageType {
        self.ty
    }

    pub fn tiling(&self) -> vk::ImageTiling {
        self.tiling
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    pub fn array_layer_count(&self) -> u32 {
        self.array_layer_count
    }

    pub fn mip_level_count(&self) -> u32 {
        self.mip_level_count
    }

    /// Size of the memory backing the image, in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory_info(&self) -> MemoryInfo {
        self.allocator.backend().memory_info(&self.memory)
    }

    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    pub fn ownership(&self) -> HandleOwnership {
        self.ownership
    }
}

impl<B: MemoryBackend> Resource for ImageAllocation<B> {
    fn kind(&self) -> &'static str {
        match self.ownership {
            HandleOwnership::Pooled => "ImageAllocation",
            HandleOwnership::Standalone => "SharedImageAllocation",
        }
    }

    fn free(&mut self) {
        let backend = self.allocator.backend();
        unsafe {
            match self.ownership {
                HandleOwnership::Pooled => {
                    backend.destroy_pooled_image(self.image, &mut self.memory)
                }
                HandleOwnership::Standalone => {
                    backend.destroy_image(self.image);
                    backend.free_memory(&mut self.memory);
                }
            }
        }
    }
}
