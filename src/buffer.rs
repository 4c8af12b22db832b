//! Buffers bound to pooled memory.
//!
//! A [`BufferAllocation`] is produced by [`Allocator::alloc_shared_buffer`] or
//! [`Allocator::alloc_buffer`] and is always wrapped in a [`Managed`](crate::registry::Managed)
//! handle. The native buffer and its memory are released by the owning thread's
//! [`ObjectHeap::collect`](crate::registry::ObjectHeap::collect) after
//! [`request_free`](crate::registry::Managed::request_free).
//!
//! # Host access
//!
//! Host-visible allocations can be mapped with [`BufferAllocation::map`]. For
//! non-coherent memory, call [`flush`](BufferAllocation::flush) after writes and
//! [`invalidate`](BufferAllocation::invalidate) before reads to ensure visibility.

use std::{fmt::Debug, ops::RangeBounds, ptr::NonNull};

use ash::vk;

use crate::{
    Device, HasDevice,
    alloc::{Allocator, HandleOwnership, MemoryPool},
    backend::{MemoryBackend, MemoryInfo},
    error::{Error, Result, VkResultExt},
    registry::Resource,
    utils::{AsVkHandle, resolve_range},
    vma::VmaBackend,
};

/// A buffer fully bound to a memory allocation.
pub struct BufferAllocation<B: MemoryBackend = VmaBackend> {
    allocator: Allocator<B>,
    /// The caller pool the memory came from, kept alive until the buffer is freed.
    _pool: Option<MemoryPool<B>>,
    buffer: vk::Buffer,
    memory: B::Memory,
    usage: vk::BufferUsageFlags,
    size: vk::DeviceSize,
    device_address: Option<vk::DeviceAddress>,
    ownership: HandleOwnership,
    dedicated: bool,
    map_count: u32,
}

impl<B: MemoryBackend> Debug for BufferAllocation<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAllocation")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("device_address", &self.device_address)
            .field("ownership", &self.ownership)
            .field("dedicated", &self.dedicated)
            .finish_non_exhaustive()
    }
}

impl<B: MemoryBackend> AsVkHandle for BufferAllocation<B> {
    type Handle = vk::Buffer;

    fn vk_handle(&self) -> Self::Handle {
        self.buffer
    }
}

impl HasDevice for BufferAllocation<VmaBackend> {
    fn device(&self) -> &Device {
        self.allocator.device()
    }
}

impl<B: MemoryBackend> BufferAllocation<B> {
    /// Wraps a buffer with bound memory. Resolves the device address if the buffer
    /// was created with `SHADER_DEVICE_ADDRESS` usage and the allocator has device
    /// addresses enabled.
    pub(crate) fn new(
        allocator: Allocator<B>,
        pool: Option<MemoryPool<B>>,
        buffer: vk::Buffer,
        memory: B::Memory,
        info: &vk::BufferCreateInfo,
        ownership: HandleOwnership,
        dedicated: bool,
    ) -> Self {
        let device_address = (info
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            && allocator.device_address_enabled())
        .then(|| unsafe { allocator.backend().buffer_device_address(buffer) });
        Self {
            allocator,
            _pool: pool,
            buffer,
            memory,
            usage: info.usage,
            size: info.size,
            device_address,
            ownership,
            dedicated,
            map_count: 0,
        }
    }

    pub fn allocator(&self) -> &Allocator<B> {
        &self.allocator
    }

    /// Returns the requested size of the buffer in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Returns the buffer device address for use in shaders.
    ///
    /// `None` if the buffer was not created with `SHADER_DEVICE_ADDRESS` usage or
    /// the allocator was created without device address support.
    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.device_address
    }

    pub fn memory_info(&self) -> MemoryInfo {
        self.allocator.backend().memory_info(&self.memory)
    }

    /// Whether the buffer owns its entire memory block.
    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    pub fn ownership(&self) -> HandleOwnership {
        self.ownership
    }

    /// Maps the memory of the buffer and returns a pointer to its first byte.
    ///
    /// Maps are reference counted. Every call must be balanced by
    /// [`unmap`](Self::unmap); outstanding maps are undone when the buffer is freed.
    pub fn map(&mut self) -> Result<NonNull<u8>> {
        let backend = self.allocator.backend();
        let ptr = unsafe { backend.map_memory(&mut self.memory) }.context("vmaMapMemory")?;
        let Some(ptr) = NonNull::new(ptr) else {
            unsafe { backend.unmap_memory(&mut self.memory) };
            return Err(Error::Vk {
                op: "vmaMapMemory",
                result: vk::Result::ERROR_MEMORY_MAP_FAILED,
            });
        };
        self.map_count += 1;
        Ok(ptr)
    }

    pub fn unmap(&mut self) {
        if self.map_count == 0 {
            tracing::warn!(buffer = ?self.buffer, "Unmapping a buffer that is not mapped");
            return;
        }
        unsafe { self.allocator.backend().unmap_memory(&mut self.memory) };
        self.map_count -= 1;
    }

    /// Flushes the specified range to make host writes visible to the device.
    ///
    /// This is a no-op for `HOST_COHERENT` memory.
    pub fn flush(&mut self, range: impl RangeBounds<vk::DeviceSize>) -> Result<()> {
        let (offset, size) = resolve_range(range, self.size);
        self.allocator
            .backend()
            .flush_memory(&self.memory, offset, size)
            .context("vmaFlushAllocation")
    }

    /// Invalidates the specified range to make device writes visible to the host.
    ///
    /// This is a no-op for `HOST_COHERENT` memory.
    pub fn invalidate(&mut self, range: impl RangeBounds<vk::DeviceSize>) -> Result<()> {
        let (offset, size) = resolve_range(range, self.size);
        self.allocator
            .backend()
            .invalidate_memory(&self.memory, offset, size)
            .context("vmaInvalidateAllocation")
    }
}

impl<B: MemoryBackend> Resource for BufferAllocation<B> {
    fn kind(&self) -> &'static str {
        match self.ownership {
            HandleOwnership::Pooled => "BufferAllocation",
            HandleOwnership::Standalone => "SharedBufferAllocation",
        }
    }

    fn buffer_usage(&self) -> Option<vk::BufferUsageFlags> {
        Some(self.usage)
    }

    fn free(&mut self) {
        let backend = self.allocator.backend();
        unsafe {
            while self.map_count > 0 {
                backend.unmap_memory(&mut self.memory);
                self.map_count -= 1;
            }
            match self.ownership {
                HandleOwnership::Pooled => {
                    backend.destroy_pooled_buffer(self.buffer, &mut self.memory)
                }
                HandleOwnership::Standalone => {
                    backend.destroy_buffer(self.buffer);
                    backend.free_memory(&mut self.memory);
                }
            }
        }
    }
}
