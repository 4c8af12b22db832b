//! GPU memory allocation with shared export pools.
//!
//! This module provides the [`Allocator`] type, which composes the pooled allocator
//! primitives of a [`MemoryBackend`] (the Vulkan Memory Allocator in production) with
//! a placement policy for memory that is shared with another API or process.
//!
//! # Shared pools
//!
//! Two long-lived pools are created with the allocator, both exported with the
//! configured OS handle types:
//!
//! - The **block pool** sub-allocates resources from fixed-size blocks of
//!   [`AllocatorConfig::shared_block_size`] bytes.
//! - The **dedicated pool** holds resources that own an entire memory block, either
//!   because they are larger than a block or because the driver prefers or requires
//!   a dedicated allocation.
//!
//! The memory type of each pool is chosen once, at construction, from a
//! representative buffer or image description.
//!
//! # Usage
//!
//! Create an allocator once per device and pass it to the allocation functions
//! together with the calling thread's [`ObjectHeap`]:
//!
//! ```no_run
//! # use pumicite_memory::{Device, Allocator, AllocatorConfig, registry::Registry, ash::vk};
//! # fn run(device: Device) -> pumicite_memory::Result<()> {
//! let allocator = Allocator::new(device, AllocatorConfig::default())?;
//! let heap = Registry::new().attach_current_thread();
//! let buffer = allocator.alloc_shared_buffer(
//!     &heap,
//!     &vk::BufferCreateInfo {
//!         size: 1024,
//!         usage: vk::BufferUsageFlags::STORAGE_BUFFER,
//!         ..Default::default()
//!     },
//!     &vk_mem::AllocationCreateInfo::default(),
//! )?;
//! # Ok(())
//! # }
//! ```

use std::{fmt::Debug, sync::Arc};

use ash::vk;

use crate::{
    Device, HasDevice,
    backend::{MemoryBackend, MemoryRequirements, MemoryStatistics, MemoryUsage, PoolDesc},
    buffer::BufferAllocation,
    error::{Error, Result, VkResultExt},
    format::{FormatSupportCache, ImageFormatQuery},
    image::ImageAllocation,
    registry::{Managed, ObjectHeap},
    vma::VmaBackend,
};

/// Construction parameters of an [`Allocator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Resolve device addresses of buffers created with `SHADER_DEVICE_ADDRESS`
    /// usage. Requires the `bufferDeviceAddress` device feature.
    pub buffer_device_address: bool,
    /// Enable `VK_EXT_memory_budget` integration.
    pub memory_budget: bool,
    /// Block size of the shared block pool. Resources that need more than this
    /// are placed in the dedicated pool.
    pub shared_block_size: vk::DeviceSize,
    /// OS handle types the shared pools are exported with.
    pub export_handle_types: vk::ExternalMemoryHandleTypeFlags,
    /// Whether the consumer of the shared memory can import dedicated allocations.
    ///
    /// Disable this when the memory is imported by a translation layer such as an
    /// OpenGL implementation running on Vulkan. Images then always go to the block
    /// pool, and an image the driver requires to be dedicated cannot be allocated.
    pub dedicated_image_import: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            buffer_device_address: false,
            memory_budget: false,
            shared_block_size: 64 * 1024 * 1024,
            export_handle_types: if cfg!(windows) {
                vk::ExternalMemoryHandleTypeFlags::OPAQUE_WIN32
            } else {
                vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD
            },
            dedicated_image_import: true,
        }
    }
}

/// Who destroys the native object of an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleOwnership {
    /// The object was created together with its memory by the pooled allocator,
    /// which destroys both.
    Pooled,
    /// The object was created outside the pooled allocator and only its memory
    /// was allocated from a pool. The object is destroyed before the memory is
    /// released.
    Standalone,
}

/// The shared pool a resource is placed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    Block,
    Dedicated,
}

impl Placement {
    /// Decides where a resource with the given requirements goes.
    ///
    /// Resources larger than a block, or that the driver prefers or requires to be
    /// dedicated, are placed in the dedicated pool. With `allow_dedicated` unset
    /// everything goes to the block pool, and a driver requirement for dedicated
    /// memory is an error.
    pub fn choose(
        requirements: &MemoryRequirements,
        block_size: vk::DeviceSize,
        allow_dedicated: bool,
    ) -> Result<Self> {
        if !allow_dedicated {
            if requirements.requires_dedicated {
                return Err(Error::DedicatedImportUnsupported);
            }
            return Ok(Self::Block);
        }
        if requirements.size > block_size
            || requirements.prefers_dedicated
            || requirements.requires_dedicated
        {
            Ok(Self::Dedicated)
        } else {
            Ok(Self::Block)
        }
    }
}

/// A GPU memory allocator with two shared export pools.
///
/// This is a reference-counted wrapper that is thread-safe and can be cloned
/// cheaply. Allocations keep the allocator alive until they are freed.
pub struct Allocator<B: MemoryBackend = VmaBackend>(Arc<AllocatorInner<B>>);

struct AllocatorInner<B: MemoryBackend> {
    // The pools are dropped before the backend they were created from.
    dedicated_pool: B::Pool,
    block_pool: B::Pool,
    formats: FormatSupportCache,
    config: AllocatorConfig,
    backend: Arc<B>,
}

impl<B: MemoryBackend> Clone for Allocator<B> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<B: MemoryBackend> Debug for Allocator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("config", &self.0.config)
            .finish_non_exhaustive()
    }
}

impl HasDevice for Allocator<VmaBackend> {
    fn device(&self) -> &Device {
        self.0.backend.device()
    }
}

impl Allocator<VmaBackend> {
    /// Creates a VMA-backed allocator for the given device, along with the shared
    /// export pools.
    pub fn new(device: Device, config: AllocatorConfig) -> Result<Self> {
        let backend = VmaBackend::new(device, config.buffer_device_address, config.memory_budget)
            .context("vmaCreateAllocator")?;
        Self::with_backend(backend, config)
    }
}

impl<B: MemoryBackend> Allocator<B> {
    /// Creates an allocator on top of an existing backend.
    pub fn with_backend(backend: B, config: AllocatorConfig) -> Result<Self> {
        let backend = Arc::new(backend);

        let dedicated_memory_type = unsafe {
            backend.find_image_memory_type(
                &Self::representative_image(),
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::AutoPreferDevice,
                    required_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    ..Default::default()
                },
            )
        }
        .context("vmaFindMemoryTypeIndexForImageInfo")?;
        let dedicated_pool = unsafe {
            backend.create_pool(&PoolDesc {
                memory_type_index: dedicated_memory_type,
                block_size: 0,
                export_handle_types: config.export_handle_types,
            })
        }
        .context("vmaCreatePool")?;

        let mut usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        if config.buffer_device_address && backend.buffer_device_address_enabled() {
            usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }
        let block_memory_type = unsafe {
            backend.find_buffer_memory_type(
                &vk::BufferCreateInfo {
                    size: config.shared_block_size,
                    usage,
                    sharing_mode: vk::SharingMode::EXCLUSIVE,
                    ..Default::default()
                },
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::Unknown,
                    required_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    ..Default::default()
                },
            )
        }
        .context("vmaFindMemoryTypeIndexForBufferInfo")?;
        let block_pool = unsafe {
            backend.create_pool(&PoolDesc {
                memory_type_index: block_memory_type,
                block_size: config.shared_block_size,
                export_handle_types: config.export_handle_types,
            })
        }
        .context("vmaCreatePool")?;

        tracing::info!(
            block_size = config.shared_block_size,
            block_memory_type,
            dedicated_memory_type,
            handle_types = ?config.export_handle_types,
            "Created shared memory pools"
        );

        Ok(Self(Arc::new(AllocatorInner {
            dedicated_pool,
            block_pool,
            formats: FormatSupportCache::new(),
            config,
            backend,
        })))
    }

    /// The image the dedicated pool's memory type is chosen for.
    fn representative_image() -> vk::ImageCreateInfo<'static> {
        vk::ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent3D {
                width: 512,
                height: 512,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::STORAGE,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        }
    }

    pub fn backend(&self) -> &B {
        &self.0.backend
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.0.config
    }

    /// Block size of the shared block pool.
    pub fn block_size(&self) -> vk::DeviceSize {
        self.0.config.shared_block_size
    }

    /// Whether device addresses are resolved for buffers created with
    /// `SHADER_DEVICE_ADDRESS` usage. Requires both the configuration and the
    /// backend to enable it.
    pub fn device_address_enabled(&self) -> bool {
        self.0.config.buffer_device_address && self.0.backend.buffer_device_address_enabled()
    }

    /// Usage of all memory allocated through this allocator's backend.
    pub fn statistics(&self) -> MemoryStatistics {
        self.0.backend.statistics()
    }

    /// Returns memory usage statistics as JSON.
    ///
    /// Totals and the heaps in use are always included. `detailed` adds the memory
    /// types in use and the usage of the two shared pools.
    pub fn statistics_string(&self, detailed: bool) -> String {
        fn in_use(usages: &[MemoryUsage]) -> String {
            let entries: Vec<String> = usages
                .iter()
                .enumerate()
                .filter(|(_, usage)| usage.blocks > 0)
                .map(|(index, usage)| format!("\"{index}\": {usage}"))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }

        let stats = self.statistics();
        let mut json = format!(
            "{{\"total\": {}, \"heaps\": {}",
            stats.total,
            in_use(&stats.heaps)
        );
        if detailed {
            let backend = &self.0.backend;
            json += &format!(
                ", \"types\": {}, \"pools\": {{\"block\": {}, \"dedicated\": {}}}",
                in_use(&stats.types),
                backend.pool_statistics(&self.0.block_pool),
                backend.pool_statistics(&self.0.dedicated_pool),
            );
        }
        json.push('}');
        json
    }

    /// Checks whether the device supports an image configuration, relaxing it if
    /// necessary. See [`FormatSupportCache::probe`].
    ///
    /// Results are cached for the lifetime of the allocator.
    pub fn is_image_supported(&self, query: &mut ImageFormatQuery) -> Result<bool> {
        self.0
            .formats
            .probe(query, |query| self.0.backend.image_format_supported(query))
    }

    pub fn find_buffer_memory_type(
        &self,
        info: &vk::BufferCreateInfo,
        strategy: &vk_mem::AllocationCreateInfo,
    ) -> Result<u32> {
        let memory_type = unsafe { self.0.backend.find_buffer_memory_type(info, strategy) };
        memory_type.context("vmaFindMemoryTypeIndexForBufferInfo")
    }

    pub fn find_image_memory_type(
        &self,
        info: &vk::ImageCreateInfo,
        strategy: &vk_mem::AllocationCreateInfo,
    ) -> Result<u32> {
        let memory_type = unsafe { self.0.backend.find_image_memory_type(info, strategy) };
        memory_type.context("vmaFindMemoryTypeIndexForImageInfo")
    }

    /// Creates a custom pool for use with [`alloc_buffer`](Self::alloc_buffer) and
    /// [`alloc_image`](Self::alloc_image).
    pub fn create_pool(&self, desc: &PoolDesc) -> Result<MemoryPool<B>> {
        let pool = unsafe { self.0.backend.create_pool(desc) }.context("vmaCreatePool")?;
        tracing::debug!(
            memory_type = desc.memory_type_index,
            block_size = desc.block_size,
            "Created memory pool"
        );
        Ok(MemoryPool(Arc::new(PoolInner {
            pool,
            desc: *desc,
            backend: self.0.backend.clone(),
        })))
    }

    fn shared_pool(&self, placement: Placement) -> &B::Pool {
        match placement {
            Placement::Block => &self.0.block_pool,
            Placement::Dedicated => &self.0.dedicated_pool,
        }
    }

    fn shared_strategy(
        strategy: &vk_mem::AllocationCreateInfo,
        requirements: &MemoryRequirements,
        placement: Placement,
    ) -> vk_mem::AllocationCreateInfo {
        let mut strategy = strategy.clone();
        strategy.memory_type_bits = requirements.memory_type_bits;
        if placement == Placement::Dedicated {
            strategy.flags |= vk_mem::AllocationCreateFlags::DEDICATED_MEMORY;
        }
        strategy
    }

    /// Allocates a buffer from the shared export pools.
    ///
    /// The buffer is created outside the pooled allocator, and memory for it is
    /// allocated from the block pool or the dedicated pool depending on its
    /// requirements. The result is registered with `heap`, which must belong to
    /// the calling thread.
    pub fn alloc_shared_buffer(
        &self,
        heap: &ObjectHeap,
        info: &vk::BufferCreateInfo,
        strategy: &vk_mem::AllocationCreateInfo,
    ) -> Result<Managed<BufferAllocation<B>>> {
        if info.size == 0 {
            return Err(Error::ZeroSizedBuffer);
        }
        heap.ensure_owner()?;
        let backend = &*self.0.backend;

        let buffer = unsafe { backend.create_buffer(info) }.context("vkCreateBuffer")?;
        let requirements = unsafe { backend.buffer_memory_requirements(buffer) };
        let placement = match Placement::choose(&requirements, self.block_size(), true) {
            Ok(placement) => placement,
            Err(err) => {
                unsafe { backend.destroy_buffer(buffer) };
                return Err(err);
            }
        };
        let strategy = Self::shared_strategy(strategy, &requirements, placement);

        let mut memory = match unsafe {
            backend.allocate_buffer_memory(self.shared_pool(placement), buffer, &strategy)
        } {
            Ok(memory) => memory,
            Err(result) => {
                unsafe { backend.destroy_buffer(buffer) };
                return Err(Error::Vk {
                    op: "vmaAllocateMemoryForBuffer",
                    result,
                });
            }
        };
        if let Err(result) = unsafe { backend.bind_buffer_memory(&mut memory, buffer) } {
            unsafe {
                backend.destroy_buffer(buffer);
                backend.free_memory(&mut memory);
            }
            return Err(Error::Vk {
                op: "vmaBindBufferMemory",
                result,
            });
        }
        tracing::debug!(size = info.size, ?placement, "Allocated shared buffer");

        let allocation = BufferAllocation::new(
            self.clone(),
            None,
            buffer,
            memory,
            info,
            HandleOwnership::Standalone,
            placement == Placement::Dedicated,
        );
        heap.register(allocation)
    }

    /// Allocates a buffer from `pool`, or from the allocator's default pools if
    /// `pool` is `None`.
    ///
    /// No placement decision is made; a dedicated allocation can be requested
    /// through `strategy.flags`. The result is registered with `heap`, which must
    /// belong to the calling thread.
    pub fn alloc_buffer(
        &self,
        heap: &ObjectHeap,
        pool: Option<&MemoryPool<B>>,
        info: &vk::BufferCreateInfo,
        strategy: &vk_mem::AllocationCreateInfo,
        alignment: vk::DeviceSize,
    ) -> Result<Managed<BufferAllocation<B>>> {
        if info.size == 0 {
            return Err(Error::ZeroSizedBuffer);
        }
        heap.ensure_owner()?;
        let (buffer, memory) = unsafe {
            self.0.backend.create_pooled_buffer(
                pool.map(|pool| &pool.0.pool),
                info,
                strategy,
                alignment,
            )
        }
        .context("vmaCreateBufferWithAlignment")?;

        let allocation = BufferAllocation::new(
            self.clone(),
            pool.cloned(),
            buffer,
            memory,
            info,
            HandleOwnership::Pooled,
            strategy
                .flags
                .contains(vk_mem::AllocationCreateFlags::DEDICATED_MEMORY),
        );
        heap.register(allocation)
    }

    /// Runs the capability probe on an image description, applying any relaxation
    /// to `info`.
    fn negotiate_image_format(&self, info: &mut vk::ImageCreateInfo) -> Result<()> {
        let requested = ImageFormatQuery::from_create_info(info);
        let mut query = requested;
        if !self.is_image_supported(&mut query)? {
            return Err(Error::UnsupportedImageFormat(requested));
        }
        query.apply_to(info);
        Ok(())
    }

    /// Allocates an image from the shared export pools.
    ///
    /// The configuration is checked with [`is_image_supported`](Self::is_image_supported)
    /// first, and `info` is updated in place if storage usage or optimal tiling had
    /// to be given up. Placement follows the same rules as
    /// [`alloc_shared_buffer`](Self::alloc_shared_buffer), except that dedicated
    /// placement is never used when [`AllocatorConfig::dedicated_image_import`] is
    /// disabled.
    pub fn alloc_shared_image(
        &self,
        heap: &ObjectHeap,
        info: &mut vk::ImageCreateInfo,
        strategy: &vk_mem::AllocationCreateInfo,
    ) -> Result<Managed<ImageAllocation<B>>> {
        heap.ensure_owner()?;
        self.negotiate_image_format(info)?;
        let backend = &*self.0.backend;

        let image = unsafe { backend.create_image(info) }.context("vkCreateImage")?;
        let requirements = unsafe { backend.image_memory_requirements(image) };
        let placement = match Placement::choose(
            &requirements,
            self.block_size(),
            self.0.config.dedicated_image_import,
        ) {
            Ok(placement) => placement,
            Err(err) => {
                unsafe { backend.destroy_image(image) };
                return Err(err);
            }
        };
        let strategy = Self::shared_strategy(strategy, &requirements, placement);

        let mut memory = match unsafe {
            backend.allocate_image_memory(self.shared_pool(placement), image, &strategy)
        } {
            Ok(memory) => memory,
            Err(result) => {
                unsafe { backend.destroy_image(image) };
                return Err(Error::Vk {
                    op: "vmaAllocateMemoryForImage",
                    result,
                });
            }
        };
        if let Err(result) = unsafe { backend.bind_image_memory(&mut memory, image) } {
            unsafe {
                backend.destroy_image(image);
                backend.free_memory(&mut memory);
            }
            return Err(Error::Vk {
                op: "vmaBindImageMemory",
                result,
            });
        }
        tracing::debug!(
            format = ?info.format,
            size = requirements.size,
            ?placement,
            "Allocated shared image"
        );

        let allocation = ImageAllocation::new(
            self.clone(),
            None,
            image,
            memory,
            info,
            requirements.size,
            HandleOwnership::Standalone,
            placement == Placement::Dedicated,
        );
        heap.register(allocation)
    }

    /// Allocates an image from `pool`, or from the allocator's default pools if
    /// `pool` is `None`.
    ///
    /// Like [`alloc_shared_image`](Self::alloc_shared_image), the configuration is
    /// probed first and `info` may be relaxed in place.
    pub fn alloc_image(
        &self,
        heap: &ObjectHeap,
        pool: Option<&MemoryPool<B>>,
        info: &mut vk::ImageCreateInfo,
        strategy: &vk_mem::AllocationCreateInfo,
    ) -> Result<Managed<ImageAllocation<B>>> {
        heap.ensure_owner()?;
        self.negotiate_image_format(info)?;
        let (image, memory) = unsafe {
            self.0
                .backend
                .create_pooled_image(pool.map(|pool| &pool.0.pool), info, strategy)
        }
        .context("vmaCreateImage")?;
        let size = self.0.backend.memory_info(&memory).size;

        let allocation = ImageAllocation::new(
            self.clone(),
            pool.cloned(),
            image,
            memory,
            info,
            size,
            HandleOwnership::Pooled,
            strategy
                .flags
                .contains(vk_mem::AllocationCreateFlags::DEDICATED_MEMORY),
        );
        heap.register(allocation)
    }
}

/// A custom memory pool created with [`Allocator::create_pool`].
///
/// Allocations made from the pool keep it alive.
pub struct MemoryPool<B: MemoryBackend = VmaBackend>(Arc<PoolInner<B>>);

struct PoolInner<B: MemoryBackend> {
    pool: B::Pool,
    desc: PoolDesc,
    backend: Arc<B>,
}

impl<B: MemoryBackend> Clone for MemoryPool<B> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<B: MemoryBackend> Debug for MemoryPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MemoryPool").field(&self.0.desc).finish()
    }
}

impl<B: MemoryBackend> MemoryPool<B> {
    pub fn desc(&self) -> &PoolDesc {
        &self.0.desc
    }

    pub fn backend(&self) -> &B {
        &self.0.backend
    }
}
