//! A recording [`MemoryBackend`] for tests that run without a GPU.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use ash::{
    prelude::VkResult,
    vk::{self, Handle},
};

use crate::{
    backend::{
        MemoryBackend, MemoryInfo, MemoryRequirements, MemoryStatistics, MemoryUsage, PoolDesc,
    },
    format::ImageFormatQuery,
};

/// Pool indices in the order `Allocator::with_backend` creates them.
pub const DEDICATED_POOL: usize = 0;
pub const BLOCK_POOL: usize = 1;

/// Memory types reported by the representative lookups.
pub const IMAGE_MEMORY_TYPE: u32 = 2;
pub const BUFFER_MEMORY_TYPE: u32 = 3;

/// Native calls that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailPoint {
    CreateBuffer,
    CreateImage,
    AllocateMemory,
    BindMemory,
    CreatePooled,
    CreatePool,
}

#[derive(Clone, Copy)]
pub struct AllocationRecord {
    pub id: u64,
    /// `None` for the allocator's default pools.
    pub pool: Option<usize>,
    pub memory_type: u32,
    pub size: vk::DeviceSize,
    pub flags: vk_mem::AllocationCreateFlags,
    pub memory_type_bits: u32,
    pub alignment: vk::DeviceSize,
}

#[derive(Default)]
pub struct MockLog {
    pub pools: Vec<PoolDesc>,
    pub buffers_created: Vec<vk::Buffer>,
    pub buffers_destroyed: Vec<vk::Buffer>,
    pub images_created: Vec<vk::Image>,
    pub images_destroyed: Vec<vk::Image>,
    pub allocations: Vec<AllocationRecord>,
    pub bound: Vec<u64>,
    pub freed: Vec<u64>,
    pub format_queries: Vec<ImageFormatQuery>,
    pub flushes: Vec<(u64, vk::DeviceSize, vk::DeviceSize)>,
    pub invalidations: Vec<(u64, vk::DeviceSize, vk::DeviceSize)>,
    pub unmaps: usize,
    sizes: HashMap<u64, vk::DeviceSize>,
}

pub struct MockPool {
    pub index: usize,
}

pub struct MockMemory {
    pub id: u64,
    memory_type: u32,
    size: vk::DeviceSize,
    /// Host copy of the memory, created on first map.
    data: Vec<u8>,
}

type FormatPredicate = Box<dyn Fn(&ImageFormatQuery) -> bool + Send + Sync>;

/// Backend whose native objects are counters. Knobs are public fields and
/// are read on every call.
pub struct MockBackend {
    pub prefers_dedicated: bool,
    pub requires_dedicated: bool,
    /// Reported requirement size. Defaults to the requested size.
    pub required_size: Option<vk::DeviceSize>,
    pub device_address: bool,
    pub fail: Option<(FailPoint, vk::Result)>,
    pub supported: FormatPredicate,
    pub next_handle: AtomicU64,
    pub log: Mutex<MockLog>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            prefers_dedicated: false,
            requires_dedicated: false,
            required_size: None,
            device_address: false,
            fail: None,
            supported: Box::new(|_| true),
            next_handle: AtomicU64::new(1),
            log: Mutex::new(MockLog::default()),
        }
    }
}

impl MockBackend {
    pub fn with_device_address(mut self) -> Self {
        self.device_address = true;
        self
    }

    pub fn with_supported_formats(
        mut self,
        supported: impl Fn(&ImageFormatQuery) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.supported = Box::new(supported);
        self
    }

    pub fn failing(mut self, point: FailPoint, result: vk::Result) -> Self {
        self.fail = Some((point, result));
        self
    }

    fn check(&self, point: FailPoint) -> VkResult<()> {
        match self.fail {
            Some((p, result)) if p == point => Err(result),
            _ => Ok(()),
        }
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn requirements(&self, raw: u64) -> MemoryRequirements {
        let size = self.log.lock().unwrap().sizes.get(&raw).copied().unwrap_or(0);
        MemoryRequirements {
            size: self.required_size.unwrap_or(size),
            alignment: 256,
            memory_type_bits: 0b1111,
            prefers_dedicated: self.prefers_dedicated,
            requires_dedicated: self.requires_dedicated,
        }
    }

    fn allocate(
        &self,
        pool: Option<usize>,
        create_info: &vk_mem::AllocationCreateInfo,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> MockMemory {
        let id = self.handle();
        let mut log = self.log.lock().unwrap();
        let memory_type = match pool {
            Some(index) => log.pools[index].memory_type_index,
            None => 0,
        };
        log.allocations.push(AllocationRecord {
            id,
            pool,
            memory_type,
            size,
            flags: create_info.flags,
            memory_type_bits: create_info.memory_type_bits,
            alignment,
        });
        MockMemory {
            id,
            memory_type,
            size,
            data: Vec::new(),
        }
    }

    pub fn allocation(&self, id: u64) -> Option<AllocationRecord> {
        self.log
            .lock()
            .unwrap()
            .allocations
            .iter()
            .find(|record| record.id == id)
            .copied()
    }

    /// Usage of the live allocations matching `filter`. Every allocation counts
    /// as its own block.
    fn usage(&self, filter: impl Fn(&AllocationRecord) -> bool) -> MemoryUsage {
        let log = self.log.lock().unwrap();
        let mut usage = MemoryUsage::default();
        for record in &log.allocations {
            if log.freed.contains(&record.id) || !filter(record) {
                continue;
            }
            usage.blocks += 1;
            usage.allocations += 1;
            usage.block_bytes += record.size;
            usage.allocation_bytes += record.size;
        }
        usage
    }

    fn image_size(info: &vk::ImageCreateInfo) -> vk::DeviceSize {
        info.extent.width as vk::DeviceSize
            * info.extent.height as vk::DeviceSize
            * info.extent.depth as vk::DeviceSize
            * info.array_layers as vk::DeviceSize
            * 4
    }
}

impl MemoryBackend for MockBackend {
    type Pool = MockPool;
    type Memory = MockMemory;

    fn buffer_device_address_enabled(&self) -> bool {
        self.device_address
    }

    fn image_format_supported(&self, query: &ImageFormatQuery) -> VkResult<bool> {
        self.log.lock().unwrap().format_queries.push(*query);
        Ok((self.supported)(query))
    }

    unsafe fn find_buffer_memory_type(
        &self,
        _info: &vk::BufferCreateInfo,
        _create_info: &vk_mem::AllocationCreateInfo,
    ) -> VkResult<u32> {
        Ok(BUFFER_MEMORY_TYPE)
    }

    unsafe fn find_image_memory_type(
        &self,
        _info: &vk::ImageCreateInfo,
        _create_info: &vk_mem::AllocationCreateInfo,
    ) -> VkResult<u32> {
        Ok(IMAGE_MEMORY_TYPE)
    }

    unsafe fn create_pool(&self, desc: &PoolDesc) -> VkResult<MockPool> {
        self.check(FailPoint::CreatePool)?;
        let mut log = self.log.lock().unwrap();
        log.pools.push(*desc);
        Ok(MockPool {
            index: log.pools.len() - 1,
        })
    }

    unsafe fn create_buffer(&self, info: &vk::BufferCreateInfo) -> VkResult<vk::Buffer> {
        self.check(FailPoint::CreateBuffer)?;
        let raw = self.handle();
        let mut log = self.log.lock().unwrap();
        log.sizes.insert(raw, info.size);
        let buffer = vk::Buffer::from_raw(raw);
        log.buffers_created.push(buffer);
        Ok(buffer)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.log.lock().unwrap().buffers_destroyed.push(buffer);
    }

    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> MemoryRequirements {
        self.requirements(buffer.as_raw())
    }

    unsafe fn allocate_buffer_memory(
        &self,
        pool: &MockPool,
        buffer: vk::Buffer,
        create_info: &vk_mem::AllocationCreateInfo,
    ) -> VkResult<MockMemory> {
        self.check(FailPoint::AllocateMemory)?;
        let size = self.requirements(buffer.as_raw()).size;
        Ok(self.allocate(Some(pool.index), create_info, size, 0))
    }

    unsafe fn bind_buffer_memory(
        &self,
        memory: &mut MockMemory,
        _buffer: vk::Buffer,
    ) -> VkResult<()> {
        self.check(FailPoint::BindMemory)?;
        self.log.lock().unwrap().bound.push(memory.id);
        Ok(())
    }

    unsafe fn create_pooled_buffer(
        &self,
        pool: Option<&MockPool>,
        info: &vk::BufferCreateInfo,
        create_info: &vk_mem::AllocationCreateInfo,
        alignment: vk::DeviceSize,
    ) -> VkResult<(vk::Buffer, MockMemory)> {
        self.check(FailPoint::CreatePooled)?;
        let buffer = unsafe { self.create_buffer(info)? };
        let memory = self.allocate(pool.map(|p| p.index), create_info, info.size, alignment);
        Ok((buffer, memory))
    }

    unsafe fn destroy_pooled_buffer(&self, buffer: vk::Buffer, memory: &mut MockMemory) {
        let mut log = self.log.lock().unwrap();
        log.buffers_destroyed.push(buffer);
        log.freed.push(memory.id);
    }

    unsafe fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        0x1_0000_0000 + buffer.as_raw() * 0x1000
    }

    unsafe fn create_image(&self, info: &vk::ImageCreateInfo) -> VkResult<vk::Image> {
        self.check(FailPoint::CreateImage)?;
        let raw = self.handle();
        let mut log = self.log.lock().unwrap();
        log.sizes.insert(raw, Self::image_size(info));
        let image = vk::Image::from_raw(raw);
        log.images_created.push(image);
        Ok(image)
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        self.log.lock().unwrap().images_destroyed.push(image);
    }

    unsafe fn image_memory_requirements(&self, image: vk::Image) -> MemoryRequirements {
        self.requirements(image.as_raw())
    }

    unsafe fn allocate_image_memory(
        &self,
        pool: &MockPool,
        image: vk::Image,
        create_info: &vk_mem::AllocationCreateInfo,
    ) -> VkResult<MockMemory> {
        self.check(FailPoint::AllocateMemory)?;
        let size = self.requirements(image.as_raw()).size;
        Ok(self.allocate(Some(pool.index), create_info, size, 0))
    }

    unsafe fn bind_image_memory(&self, memory: &mut MockMemory, _image: vk::Image) -> VkResult<()> {
        self.check(FailPoint::BindMemory)?;
        self.log.lock().unwrap().bound.push(memory.id);
        Ok(())
    }

    unsafe fn create_pooled_image(
        &self,
        pool: Option<&MockPool>,
        info: &vk::ImageCreateInfo,
        create_info: &vk_mem::AllocationCreateInfo,
    ) -> VkResult<(vk::Image, MockMemory)> {
        self.check(FailPoint::CreatePooled)?;
        let image = unsafe { self.create_image(info)? };
        let memory = self.allocate(pool.map(|p| p.index), create_info, Self::image_size(info), 0);
        Ok((image, memory))
    }

    unsafe fn destroy_pooled_image(&self, image: vk::Image, memory: &mut MockMemory) {
        let mut log = self.log.lock().unwrap();
        log.images_destroyed.push(image);
        log.freed.push(memory.id);
    }

    unsafe fn free_memory(&self, memory: &mut MockMemory) {
        self.log.lock().unwrap().freed.push(memory.id);
    }

    fn memory_info(&self, memory: &MockMemory) -> MemoryInfo {
        MemoryInfo {
            memory_type: memory.memory_type,
            device_memory: vk::DeviceMemory::from_raw(memory.id),
            offset: 0,
            size: memory.size,
            mapped: false,
        }
    }

    unsafe fn map_memory(&self, memory: &mut MockMemory) -> VkResult<*mut u8> {
        if memory.data.is_empty() {
            memory.data = vec![0; memory.size as usize];
        }
        Ok(memory.data.as_mut_ptr())
    }

    unsafe fn unmap_memory(&self, _memory: &mut MockMemory) {
        self.log.lock().unwrap().unmaps += 1;
    }

    fn flush_memory(
        &self,
        memory: &MockMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        self.log.lock().unwrap().flushes.push((memory.id, offset, size));
        Ok(())
    }

    fn invalidate_memory(
        &self,
        memory: &MockMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        self.log
            .lock()
            .unwrap()
            .invalidations
            .push((memory.id, offset, size));
        Ok(())
    }

    fn statistics(&self) -> MemoryStatistics {
        let total = self.usage(|_| true);
        MemoryStatistics {
            total,
            heaps: vec![total],
            types: (0..4)
                .map(|ty| self.usage(|record| record.memory_type == ty))
                .collect(),
        }
    }

    fn pool_statistics(&self, pool: &MockPool) -> MemoryUsage {
        self.usage(|record| record.pool == Some(pool.index))
    }
}
