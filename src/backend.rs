//! The native contract consumed by the allocator.
//!
//! [`MemoryBackend`] is the boundary between the allocation policy in this crate and
//! the Vulkan device plus the pooled memory allocator underneath it. The production
//! implementation is [`VmaBackend`](crate::vma::VmaBackend). Every method maps to one
//! native call (or a fixed sequence of them) and reports failures through
//! [`VkResult`] so the caller can attach an operation label.
//!
//! Allocation strategies are expressed as [`vk_mem::AllocationCreateInfo`]: the
//! allocator fills in `memory_type_bits` and the dedicated-memory flag before
//! handing them to the backend.

use ash::{prelude::VkResult, vk};

use crate::format::ImageFormatQuery;

/// Memory requirements of a native object, including the driver's dedicated
/// allocation hints.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: vk::DeviceSize,
    pub alignment: vk::DeviceSize,
    pub memory_type_bits: u32,
    pub prefers_dedicated: bool,
    pub requires_dedicated: bool,
}

/// Where an allocation lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub memory_type: u32,
    pub device_memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    /// Whether the allocation is persistently mapped.
    pub mapped: bool,
}

/// Parameters of a memory pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolDesc {
    pub memory_type_index: u32,
    /// Size of each block. 0 lets the allocator library pick.
    pub block_size: vk::DeviceSize,
    /// Handle types every block of the pool is exported with. Empty for
    /// non-exportable pools.
    pub export_handle_types: vk::ExternalMemoryHandleTypeFlags,
}

/// Memory usage counters of a heap, a memory type, a pool or the whole allocator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Native memory blocks allocated.
    pub blocks: u32,
    pub allocations: u32,
    /// Bytes allocated in native blocks.
    pub block_bytes: vk::DeviceSize,
    /// Bytes occupied by allocations.
    pub allocation_bytes: vk::DeviceSize,
}

impl MemoryUsage {
    /// Bytes allocated from the device but not used by any allocation.
    pub fn unused_bytes(&self) -> vk::DeviceSize {
        self.block_bytes.saturating_sub(self.allocation_bytes)
    }
}

impl std::fmt::Display for MemoryUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{\"blocks\": {}, \"allocations\": {}, \"block_bytes\": {}, \"used_bytes\": {}, \"unused_bytes\": {}}}",
            self.blocks,
            self.allocations,
            self.block_bytes,
            self.allocation_bytes,
            self.unused_bytes()
        )
    }
}

/// Usage of all memory managed by a backend.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryStatistics {
    pub total: MemoryUsage,
    /// Indexed by memory heap.
    pub heaps: Vec<MemoryUsage>,
    /// Indexed by memory type.
    pub types: Vec<MemoryUsage>,
}

/// Native graphics API and pooled allocator primitives.
///
/// # Safety
///
/// The `unsafe` methods take raw handles. Callers must only pass handles created by
/// the same backend that have not been destroyed yet, and must not destroy a handle
/// while another thread is using it.
pub trait MemoryBackend: Send + Sync + 'static {
    /// A memory pool created by [`create_pool`](Self::create_pool). Dropping it
    /// destroys the pool.
    type Pool: Send + Sync + 'static;
    /// A single allocation.
    type Memory: Send + Sync + 'static;

    /// Whether buffer device addresses can be resolved.
    fn buffer_device_address_enabled(&self) -> bool;

    /// Queries support for an image configuration.
    ///
    /// Returns `Ok(false)` for `VK_ERROR_FORMAT_NOT_SUPPORTED`.
    fn image_format_supported(&self, query: &ImageFormatQuery) -> VkResult<bool>;

    unsafe fn find_buffer_memory_type(
        &self,
        info: &vk::BufferCreateInfo,
        create_info: &vk_mem::AllocationCreateInfo,
    ) -> VkResult<u32>;

    unsafe fn find_image_memory_type(
        &self,
        info: &vk::ImageCreateInfo,
        create_info: &vk_mem::AllocationCreateInfo,
    ) -> VkResult<u32>;

    unsafe fn create_pool(&self, desc: &PoolDesc) -> VkResult<Self::Pool>;

    /// Creates a buffer with no memory bound.
    unsafe fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer>;
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);
    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> MemoryRequirements;
    unsafe fn allocate_buffer_memory(
        &self,
        pool: &Self::Pool,
        buffer: vk::Buffer,
        create_info: &vk_mem::AllocationCreateInfo,
    ) -> VkResult<Self::Memory>;
    unsafe fn bind_buffer_memory(
        &self,
        memory: &mut Self::Memory,
        buffer: vk::Buffer,
    ) -> VkResult<()>;
    /// Creates a buffer, allocates memory for it and binds it in one step.
    /// `pool` of `None` uses the allocator's default pools.
    unsafe fn create_pooled_buffer(
        &self,
        pool: Option<&Self::Pool>,
        info: &vk::BufferCreateInfo,
        create_info: &vk_mem::AllocationCreateInfo,
        alignment: vk::DeviceSize,
    ) -> VkResult<(vk::Buffer, Self::Memory)>;
    /// Destroys a buffer created by [`create_pooled_buffer`](Self::create_pooled_buffer)
    /// together with its memory.
    unsafe fn destroy_pooled_buffer(&self, buffer: vk::Buffer, memory: &mut Self::Memory);
    unsafe fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress;

    /// Creates an image with no memory bound.
    unsafe fn create_image(&self, info: &vk::ImageCreateInfo) -> VkResult<vk::Image>;
    unsafe fn destroy_image(&self, image: vk::Image);
    unsafe fn image_memory_requirements(&self, image: vk::Image) -> MemoryRequirements;
    unsafe fn allocate_image_memory(
        &self,
        pool: &Self::Pool,
        image: vk::Image,
        create_info: &vk_mem::AllocationCreateInfo,
    ) -> VkResult<Self::Memory>;
    unsafe fn bind_image_memory(&self, memory: &mut Self::Memory, image: vk::Image)
    -> VkResult<()>;
    unsafe fn create_pooled_image(
        &self,
        pool: Option<&Self::Pool>,
        info: &vk::ImageCreateInfo,
        create_info: &vk_mem::AllocationCreateInfo,
    ) -> VkResult<(vk::Image, Self::Memory)>;
    unsafe fn destroy_pooled_image(&self, image: vk::Image, memory: &mut Self::Memory);

    unsafe fn free_memory(&self, memory: &mut Self::Memory);
    fn memory_info(&self, memory: &Self::Memory) -> MemoryInfo;
    unsafe fn map_memory(&self, memory: &mut Self::Memory) -> VkResult<*mut u8>;
    unsafe fn unmap_memory(&self, memory: &mut Self::Memory);
    fn flush_memory(
        &self,
        memory: &Self::Memory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()>;
    fn invalidate_memory(
        &self,
        memory: &Self::Memory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()>;

    /// Current usage of all memory allocated through the backend.
    fn statistics(&self) -> MemoryStatistics;
    fn pool_statistics(&self, pool: &Self::Pool) -> MemoryUsage;
}
