//! [`MemoryBackend`] implementation on top of the Vulkan Memory Allocator (VMA).

use std::{ffi::c_void, sync::Arc};

use ash::{prelude::VkResult, vk};
use vk_mem::Alloc;

use crate::{
    Device, HasDevice,
    backend::{
        MemoryBackend, MemoryInfo, MemoryRequirements, MemoryStatistics, MemoryUsage, PoolDesc,
    },
    format::ImageFormatQuery,
};

/// A VMA allocator bound to a [`Device`].
pub struct VmaBackend {
    // Pools hold their own reference to the allocator.
    inner: Arc<vk_mem::Allocator>,
    device: Device,
    buffer_device_address: bool,
}

impl HasDevice for VmaBackend {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl VmaBackend {
    /// Creates a new VMA allocator for the given device.
    ///
    /// `buffer_device_address` must only be set if the device was created with the
    /// `bufferDeviceAddress` feature enabled. `memory_budget` requires
    /// `VK_EXT_memory_budget`.
    pub fn new(device: Device, buffer_device_address: bool, memory_budget: bool) -> VkResult<Self> {
        let mut info = vk_mem::AllocatorCreateInfo::new(
            device.instance(),
            &device,
            device.physical_device(),
        );
        if buffer_device_address {
            info.flags |= vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;
        }
        if memory_budget {
            info.flags |= vk_mem::AllocatorCreateFlags::EXT_MEMORY_BUDGET;
        }
        let inner = unsafe { vk_mem::Allocator::new(info)? };
        Ok(Self {
            inner: Arc::new(inner),
            device,
            buffer_device_address,
        })
    }

    fn requirements(
        requirements: vk::MemoryRequirements,
        dedicated: &vk::MemoryDedicatedRequirements,
    ) -> MemoryRequirements {
        MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
            prefers_dedicated: dedicated.prefers_dedicated_allocation == vk::TRUE,
            requires_dedicated: dedicated.requires_dedicated_allocation == vk::TRUE,
        }
    }
}

/// A VMA pool together with the export chain its blocks are allocated with.
pub struct VmaPool {
    pool: vk_mem::AllocatorPool,
    // VMA keeps the pointer and chains it into every block allocation of the pool.
    _export: Option<Box<vk::ExportMemoryAllocateInfo<'static>>>,
}
unsafe impl Send for VmaPool {}
unsafe impl Sync for VmaPool {}

/// A VMA allocation.
pub struct VmaMemory(vk_mem::Allocation);

// The statistics structs live in a private module of `vk_mem` and cannot be named.
macro_rules! memory_usage {
    ($stats:expr) => {{
        let stats = &$stats;
        MemoryUsage {
            blocks: stats.blockCount,
            allocations: stats.allocationCount,
            block_bytes: stats.blockBytes,
            allocation_bytes: stats.allocationBytes,
        }
    }};
}

impl MemoryBackend for VmaBackend {
    type Pool = VmaPool;
    type Memory = VmaMemory;

    fn buffer_device_address_enabled(&self) -> bool {
        self.buffer_device_address
    }

    fn image_format_supported(&self, query: &ImageFormatQuery) -> VkResult<bool> {
        self.device
            .image_format_properties(query)
            .map(|properties| properties.is_some())
    }

    unsafe fn find_buffer_memory_type(
        &self,
        info: &vk::BufferCreateInfo,
        create_info: &vk_mem::AllocationCreateInfo,
    ) -> VkResult<u32> {
        unsafe {
            self.inner
                .find_memory_type_index_for_buffer_info(info, create_info)
        }
    }

    unsafe fn find_image_memory_type(
        &self,
        info: &vk::ImageCreateInfo,
        create_info: &vk_mem::AllocationCreateInfo,
    ) -> VkResult<u32> {
        unsafe {
            self.inner
                .find_memory_type_index_for_image_info(*info, create_info)
        }
    }

    unsafe fn create_pool(&self, desc: &PoolDesc) -> VkResult<VmaPool> {
        let mut export = (!desc.export_handle_types.is_empty()).then(|| {
            Box::new(vk::ExportMemoryAllocateInfo {
                handle_types: desc.export_handle_types,
                ..Default::default()
            })
        });
        let mut info = vk_mem::PoolCreateInfo::default();
        info.memory_type_index = desc.memory_type_index;
        info.block_size = desc.block_size;
        if let Some(export) = export.as_mut() {
            let next: *mut vk::ExportMemoryAllocateInfo = &mut **export;
            info.memory_allocate_next = next.cast::<c_void>();
        }
        let pool = self.inner.create_pool(&info)?;
        Ok(VmaPool {
            pool,
            _export: export,
        })
    }

    unsafe fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer> {
        unsafe { self.device.create_buffer(info, None) }
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> MemoryRequirements {
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements = vk::MemoryRequirements2::default().push_next(&mut dedicated);
        unsafe {
            self.device.get_buffer_memory_requirements2(
                &vk::BufferMemoryRequirementsInfo2 {
                    buffer,
                    ..Default::default()
                },
                &mut requirements,
            );
        }
        let requirements = requirements.memory_requirements;
        Self::requirements(requirements, &dedicated)
    }

    unsafe fn allocate_buffer_memory(
        &self,
        pool: &VmaPool,
        buffer: vk::Buffer,
        create_info: &vk_mem::AllocationCreateInfo,
    ) -> VkResult<VmaMemory> {
        unsafe {
            pool.pool
                .allocate_memory_for_buffer(buffer, create_info)
                .map(VmaMemory)
        }
    }

    unsafe fn bind_buffer_memory(
        &self,
        memory: &mut VmaMemory,
        buffer: vk::Buffer,
    ) -> VkResult<()> {
        unsafe { self.inner.bind_buffer_memory(&memory.0, buffer) }
    }

    unsafe fn create_pooled_buffer(
        &self,
        pool: Option<&VmaPool>,
        info: &vk::BufferCreateInfo,
        create_info: &vk_mem::AllocationCreateInfo,
        alignment: vk::DeviceSize,
    ) -> VkResult<(vk::Buffer, VmaMemory)> {
        let (buffer, allocation) = unsafe {
            match pool {
                Some(pool) => pool
                    .pool
                    .create_buffer_with_alignment(info, create_info, alignment)?,
                None => self
                    .inner
                    .create_buffer_with_alignment(info, create_info, alignment)?,
            }
        };
        Ok((buffer, VmaMemory(allocation)))
    }

    unsafe fn destroy_pooled_buffer(&self, buffer: vk::Buffer, memory: &mut VmaMemory) {
        unsafe { self.inner.destroy_buffer(buffer, &mut memory.0) }
    }

    unsafe fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        unsafe {
            self.device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo {
                    buffer,
                    ..Default::default()
                })
        }
    }

    unsafe fn create_image(&self, info: &vk::ImageCreateInfo) -> VkResult<vk::Image> {
        unsafe { self.device.create_image(info, None) }
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) }
    }

    unsafe fn image_memory_requirements(&self, image: vk::Image) -> MemoryRequirements {
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements = vk::MemoryRequirements2::default().push_next(&mut dedicated);
        unsafe {
            self.device.get_image_memory_requirements2(
                &vk::ImageMemoryRequirementsInfo2 {
                    image,
                    ..Default::default()
                },
                &mut requirements,
            );
        }
        let requirements = requirements.memory_requirements;
        Self::requirements(requirements, &dedicated)
    }

    unsafe fn allocate_image_memory(
        &self,
        pool: &VmaPool,
        image: vk::Image,
        create_info: &vk_mem::AllocationCreateInfo,
    ) -> VkResult<VmaMemory> {
        unsafe {
            pool.pool
                .allocate_memory_for_image(image, create_info)
                .map(VmaMemory)
        }
    }

    unsafe fn bind_image_memory(&self, memory: &mut VmaMemory, image: vk::Image) -> VkResult<()> {
        unsafe { self.inner.bind_image_memory(&memory.0, image) }
    }

    unsafe fn create_pooled_image(
        &self,
        pool: Option<&VmaPool>,
        info: &vk::ImageCreateInfo,
        create_info: &vk_mem::AllocationCreateInfo,
    ) -> VkResult<(vk::Image, VmaMemory)> {
        let (image, allocation) = unsafe {
            match pool {
                Some(pool) => pool.pool.create_image(info, create_info)?,
                None => self.inner.create_image(info, create_info)?,
            }
        };
        Ok((image, VmaMemory(allocation)))
    }

    unsafe fn destroy_pooled_image(&self, image: vk::Image, memory: &mut VmaMemory) {
        unsafe { self.inner.destroy_image(image, &mut memory.0) }
    }

    unsafe fn free_memory(&self, memory: &mut VmaMemory) {
        unsafe { self.inner.free_memory(&mut memory.0) }
    }

    fn memory_info(&self, memory: &VmaMemory) -> MemoryInfo {
        let info = self.inner.get_allocation_info(&memory.0);
        MemoryInfo {
            memory_type: info.memory_type,
            device_memory: info.device_memory,
            offset: info.offset,
            size: info.size,
            mapped: !info.mapped_data.is_null(),
        }
    }

    unsafe fn map_memory(&self, memory: &mut VmaMemory) -> VkResult<*mut u8> {
        unsafe { self.inner.map_memory(&mut memory.0) }
    }

    unsafe fn unmap_memory(&self, memory: &mut VmaMemory) {
        unsafe { self.inner.unmap_memory(&mut memory.0) }
    }

    fn flush_memory(
        &self,
        memory: &VmaMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        self.inner.flush_allocation(&memory.0, offset, size)
    }

    fn invalidate_memory(
        &self,
        memory: &VmaMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        self.inner.invalidate_allocation(&memory.0, offset, size)
    }

    fn statistics(&self) -> MemoryStatistics {
        let Ok(stats) = self.inner.calculate_statistics() else {
            return MemoryStatistics::default();
        };
        let properties = unsafe { self.inner.get_memory_properties() };
        MemoryStatistics {
            total: memory_usage!(stats.total.statistics),
            heaps: stats
                .memoryHeap
                .iter()
                .take(properties.memory_heap_count as usize)
                .map(|heap| memory_usage!(heap.statistics))
                .collect(),
            types: stats
                .memoryType
                .iter()
                .take(properties.memory_type_count as usize)
                .map(|ty| memory_usage!(ty.statistics))
                .collect(),
        }
    }

    fn pool_statistics(&self, pool: &VmaPool) -> MemoryUsage {
        pool.pool
            .get_statistics()
            .map(|stats| memory_usage!(stats))
            .unwrap_or_default()
    }
}
