// Resource pool: reusable buffers, images, descriptor sets, and
// per-thread command buffers, recycled by age so steady-state rendering
// does not pay allocation cost every frame (§4.2).
//
// Austin Shafer - 2020, adapted 2024
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use ash::vk;
use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::command::{CommandBuffer, TrackedResource};
use crate::descriptor::DescriptorSet;
use crate::error::Result;
use crate::image::Image;
use crate::memory::DeviceAllocator;

/// Descriptor pool growth (§4.2): one set of growable `VkDescriptorPool`s
/// shared across every layout, sized generously enough to cover a handful
/// of descriptor types per set rather than just one binding kind.
const SETS_PER_POOL: u32 = 64;

fn pool_sizes() -> Vec<vk::DescriptorPoolSize> {
    let counts_per_type = SETS_PER_POOL * 4;
    [
        vk::DescriptorType::SAMPLER,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        vk::DescriptorType::SAMPLED_IMAGE,
        vk::DescriptorType::STORAGE_IMAGE,
        vk::DescriptorType::UNIFORM_BUFFER,
        vk::DescriptorType::STORAGE_BUFFER,
        vk::DescriptorType::INPUT_ATTACHMENT,
    ]
    .iter()
    .map(|&ty| {
        vk::DescriptorPoolSize::builder()
            .ty(ty)
            .descriptor_count(counts_per_type)
            .build()
    })
    .collect()
}

struct DescriptorPoolAllocator {
    pools: Vec<vk::DescriptorPool>,
    capacities: Vec<u32>,
}

impl DescriptorPoolAllocator {
    fn new() -> Self {
        Self {
            pools: Vec::new(),
            capacities: Vec::new(),
        }
    }

    fn add_pool(&mut self, dev: &ash::Device) -> Result<usize> {
        let sizes = pool_sizes();
        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(SETS_PER_POOL);
        let pool = unsafe { dev.create_descriptor_pool(&info, None)? };
        self.pools.push(pool);
        self.capacities.push(0);
        Ok(self.pools.len() - 1)
    }

    fn allocate(&mut self, dev: &ash::Device, layout: vk::DescriptorSetLayout) -> Result<(usize, vk::DescriptorSet)> {
        let mut idx = self
            .capacities
            .iter()
            .position(|&cap| cap < SETS_PER_POOL);
        if idx.is_none() {
            idx = Some(self.add_pool(dev)?);
        }
        let idx = idx.unwrap();

        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pools[idx])
            .set_layouts(&layouts);
        let set = unsafe { dev.allocate_descriptor_sets(&info)?[0] };
        self.capacities[idx] += 1;
        Ok((idx, set))
    }

    unsafe fn destroy(&self, dev: &ash::Device) {
        for p in &self.pools {
            dev.destroy_descriptor_pool(*p, None);
        }
    }
}

struct PoolEntry<T> {
    resource: T,
    last_used_frame: u64,
}

struct ThreadCommandPool {
    pool: vk::CommandPool,
    /// Buffers not currently checked out. `Done` ones are reused by
    /// `reset`; buffers still `Pending` here are waiting on `poll` to
    /// observe their fence.
    buffers: Vec<CommandBuffer>,
}

/// Recycled GPU resources and per-thread command buffers, purged by frame
/// age. One [`ResourcePool`] per [`crate::device::Device`] (not
/// process-global), matching the ownership rule in the data model.
pub struct ResourcePool {
    dev: ash::Device,
    allocator: Arc<DeviceAllocator>,
    queue_family_index: u32,
    buffers: Mutex<Vec<PoolEntry<Buffer>>>,
    images: Mutex<Vec<PoolEntry<Image>>>,
    descriptor_sets: Mutex<Vec<PoolEntry<DescriptorSet>>>,
    descriptor_pool_alloc: Mutex<DescriptorPoolAllocator>,
    command_pools: Mutex<HashMap<ThreadId, ThreadCommandPool>>,
    current_frame: AtomicU64,
}

impl ResourcePool {
    pub fn new(dev: ash::Device, allocator: Arc<DeviceAllocator>, queue_family_index: u32) -> Self {
        Self {
            dev,
            allocator,
            queue_family_index,
            buffers: Mutex::new(Vec::new()),
            images: Mutex::new(Vec::new()),
            descriptor_sets: Mutex::new(Vec::new()),
            descriptor_pool_alloc: Mutex::new(DescriptorPoolAllocator::new()),
            command_pools: Mutex::new(HashMap::new()),
            current_frame: AtomicU64::new(0),
        }
    }

    pub fn current_frame(&self) -> u64 {
        self.current_frame.load(Ordering::Relaxed)
    }

    pub fn advance_frame(&self) {
        self.current_frame.fetch_add(1, Ordering::Relaxed);
    }

    /// Checkout a buffer satisfying `size`/`usage`/`properties`, picking
    /// the smallest sufficient candidate (§4.2: `candidate.size <
    /// best.size`, with an early exit on an exact-size match). Allocates
    /// a fresh buffer when nothing in the pool qualifies.
    pub fn get_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        tag: &str,
    ) -> Result<Buffer> {
        {
            let mut buffers = self.buffers.lock();
            let mut best_idx: Option<usize> = None;
            for (i, entry) in buffers.iter().enumerate() {
                if !entry.resource.satisfies(size, usage, properties) {
                    continue;
                }
                if entry.resource.size == size {
                    best_idx = Some(i);
                    break;
                }
                match best_idx {
                    Some(b) if entry.resource.size < buffers[b].resource.size => best_idx = Some(i),
                    None => best_idx = Some(i),
                    _ => {}
                }
            }
            if let Some(i) = best_idx {
                return Ok(buffers.remove(i).resource);
            }
        }

        self.create_buffer(size, usage, properties, tag)
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        tag: &str,
    ) -> Result<Buffer> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe { self.dev.create_buffer(&info, None)? };
        let requirements = unsafe { self.dev.get_buffer_memory_requirements(handle) };
        let sub_allocation = self.allocator.allocate(requirements, properties, tag)?;
        unsafe {
            self.dev
                .bind_buffer_memory(handle, sub_allocation.memory, sub_allocation.offset)?;
        }
        Ok(Buffer::new(handle, size, usage, properties, sub_allocation))
    }

    /// Returns `buffer` to the pool, tagged with the current frame index.
    pub fn release_buffer(&self, buffer: Buffer) {
        let frame = self.current_frame();
        self.buffers.lock().push(PoolEntry {
            resource: buffer,
            last_used_frame: frame,
        });
    }

    /// Checkout an image matching `(extent, format, mips, samples)` and
    /// satisfying `usage`/`properties`; first match wins (§4.2 -- unlike
    /// buffers, images are not size-fit, only bucket-matched).
    pub fn get_image(
        &self,
        extent: vk::Extent3D,
        format: vk::Format,
        mip_levels: u32,
        sample_count: vk::SampleCountFlags,
        usage: vk::ImageUsageFlags,
        properties: vk::MemoryPropertyFlags,
        array_layers: u32,
        tag: &str,
    ) -> Result<Image> {
        let bucket = (extent.width, extent.height, extent.depth, format, mip_levels, sample_count.as_raw());
        {
            let mut images = self.images.lock();
            if let Some(i) = images
                .iter()
                .position(|e| e.resource.bucket_key() == bucket && e.resource.satisfies(usage, properties))
            {
                return Ok(images.remove(i).resource);
            }
        }

        self.create_image(extent, format, mip_levels, array_layers, sample_count, usage, properties, tag)
    }

    fn create_image(
        &self,
        extent: vk::Extent3D,
        format: vk::Format,
        mip_levels: u32,
        array_layers: u32,
        sample_count: vk::SampleCountFlags,
        usage: vk::ImageUsageFlags,
        properties: vk::MemoryPropertyFlags,
        tag: &str,
    ) -> Result<Image> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent)
            .mip_levels(mip_levels)
            .array_layers(array_layers)
            .samples(sample_count)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let handle = unsafe { self.dev.create_image(&info, None)? };
        let requirements = unsafe { self.dev.get_image_memory_requirements(handle) };
        let sub_allocation = self.allocator.allocate(requirements, properties, tag)?;
        unsafe {
            self.dev
                .bind_image_memory(handle, sub_allocation.memory, sub_allocation.offset)?;
        }

        let aspect_mask = if usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(handle)
            .view_type(if array_layers > 1 {
                vk::ImageViewType::TYPE_2D_ARRAY
            } else {
                vk::ImageViewType::TYPE_2D
            })
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: array_layers,
            });
        let view = unsafe { self.dev.create_image_view(&view_info, None)? };

        Ok(Image::new(
            handle,
            view,
            extent,
            format,
            mip_levels,
            array_layers,
            sample_count,
            usage,
            properties,
            sub_allocation,
        ))
    }

    pub fn release_image(&self, image: Image) {
        let frame = self.current_frame();
        self.images.lock().push(PoolEntry {
            resource: image,
            last_used_frame: frame,
        });
    }

    /// Checkout a descriptor set bound to `layout`, reusing a matching
    /// idle one if available.
    pub fn get_descriptor_set(&self, layout: vk::DescriptorSetLayout) -> Result<DescriptorSet> {
        {
            let mut sets = self.descriptor_sets.lock();
            if let Some(i) = sets.iter().position(|e| e.resource.layout == layout) {
                return Ok(sets.remove(i).resource);
            }
        }

        let (_, handle) = self.descriptor_pool_alloc.lock().allocate(&self.dev, layout)?;
        Ok(DescriptorSet::new(layout, handle))
    }

    pub fn release_descriptor_set(&self, set: DescriptorSet) {
        let frame = self.current_frame();
        self.descriptor_sets.lock().push(PoolEntry {
            resource: set,
            last_used_frame: frame,
        });
    }

    /// Checkout a ready-to-record command buffer for the calling thread.
    /// Reuses a `Done` buffer from this thread's pool (calling `reset`)
    /// or allocates a fresh one; buffers still `Pending` are left alone.
    pub fn get_command_buffer(&self, level: vk::CommandBufferLevel) -> Result<CommandBuffer> {
        let thread_id = std::thread::current().id();
        let mut pools = self.command_pools.lock();
        let thread_pool = match pools.get_mut(&thread_id) {
            Some(p) => p,
            None => {
                let info = vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(self.queue_family_index)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
                let pool = unsafe { self.dev.create_command_pool(&info, None)? };
                pools.insert(thread_id, ThreadCommandPool { pool, buffers: Vec::new() });
                pools.get_mut(&thread_id).unwrap()
            }
        };

        if let Some(i) = thread_pool
            .buffers
            .iter()
            .position(|cb| cb.state == crate::command::CommandBufferState::Done)
        {
            let mut cb = thread_pool.buffers.remove(i);
            cb.reset(&self.dev)?;
            return Ok(cb);
        }

        CommandBuffer::allocate(&self.dev, thread_pool.pool, level)
    }

    /// Returns `cb` (already submitted, now `Pending`) to its thread's
    /// pool so a later `poll_command_buffers` call can reclaim its
    /// tracked resources once its fence signals.
    pub fn release_command_buffer(&self, cb: CommandBuffer) {
        let thread_id = std::thread::current().id();
        let mut pools = self.command_pools.lock();
        if let Some(thread_pool) = pools.get_mut(&thread_id) {
            thread_pool.buffers.push(cb);
        } else {
            log::warn!("release_command_buffer called from a thread with no command pool");
            unsafe { cb.destroy(&self.dev) };
        }
    }

    /// Poll every thread's `Pending` command buffers; any that have
    /// signaled transition to `Done` and release their tracked resources
    /// back to this pool, tagged with the current frame index.
    pub fn poll_command_buffers(&self) -> Result<()> {
        let mut freed: Vec<TrackedResource> = Vec::new();
        {
            let mut pools = self.command_pools.lock();
            for thread_pool in pools.values_mut() {
                for cb in thread_pool.buffers.iter_mut() {
                    if let Some(resources) = cb.poll(&self.dev)? {
                        freed.extend(resources);
                    }
                }
            }
        }

        for resource in freed {
            match resource {
                TrackedResource::Buffer(b) => self.release_buffer(b),
                TrackedResource::Image(i) => self.release_image(i),
                TrackedResource::DescriptorSet(s) => self.release_descriptor_set(s),
            }
        }
        Ok(())
    }

    /// Evict idle resources whose `last_used_frame` is more than
    /// `max_age_frames` behind the current frame, freeing their
    /// underlying Vulkan objects and sub-allocations.
    pub fn purge(&self, max_age_frames: u64) {
        let current = self.current_frame();
        let is_stale = |last_used: u64| current.saturating_sub(last_used) > max_age_frames;

        {
            let mut buffers = self.buffers.lock();
            let mut i = 0;
            while i < buffers.len() {
                if is_stale(buffers[i].last_used_frame) {
                    let entry = buffers.remove(i);
                    unsafe { self.dev.destroy_buffer(entry.resource.handle, None) };
                    self.allocator.free(&entry.resource.sub_allocation);
                } else {
                    i += 1;
                }
            }
        }

        {
            let mut images = self.images.lock();
            let mut i = 0;
            while i < images.len() {
                if is_stale(images[i].last_used_frame) {
                    let entry = images.remove(i);
                    unsafe {
                        self.dev.destroy_image_view(entry.resource.view, None);
                        self.dev.destroy_image(entry.resource.handle, None);
                    }
                    self.allocator.free(&entry.resource.sub_allocation);
                } else {
                    i += 1;
                }
            }
        }

        {
            let mut sets = self.descriptor_sets.lock();
            sets.retain(|e| !is_stale(e.last_used_frame));
        }
    }

    /// Wait for every still-`Pending` command buffer, then destroy all
    /// pooled resources and command pools. Called from `Device::drop`.
    pub unsafe fn destroy(&self) {
        {
            let mut pools = self.command_pools.lock();
            for thread_pool in pools.values_mut() {
                for cb in &thread_pool.buffers {
                    if cb.state == crate::command::CommandBufferState::Pending {
                        let _ = cb.wait(&self.dev);
                    }
                    cb.destroy(&self.dev);
                }
                self.dev.destroy_command_pool(thread_pool.pool, None);
            }
        }

        for entry in self.buffers.lock().drain(..) {
            self.dev.destroy_buffer(entry.resource.handle, None);
            self.allocator.free(&entry.resource.sub_allocation);
        }
        for entry in self.images.lock().drain(..) {
            self.dev.destroy_image_view(entry.resource.view, None);
            self.dev.destroy_image(entry.resource.handle, None);
            self.allocator.free(&entry.resource.sub_allocation);
        }

        self.descriptor_pool_alloc.lock().destroy(&self.dev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_buffer(size: u64) -> Buffer {
        Buffer::new(
            vk::Buffer::null(),
            size,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            crate::memory::SubAllocation {
                memory: vk::DeviceMemory::null(),
                offset: 0,
                size,
                memory_type: 0,
                mapped_ptr: None,
            },
        )
    }

    #[test]
    fn picks_smallest_sufficient_buffer_with_exact_fit_shortcut() {
        let candidates = vec![fake_buffer(256), fake_buffer(64), fake_buffer(128)];
        let requested = 64u64;

        let mut best_idx = None;
        for (i, b) in candidates.iter().enumerate() {
            if !b.satisfies(requested, vk::BufferUsageFlags::VERTEX_BUFFER, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
                continue;
            }
            if b.size == requested {
                best_idx = Some(i);
                break;
            }
            match best_idx {
                Some(b2) if b.size < candidates[b2].size => best_idx = Some(i),
                None => best_idx = Some(i),
                _ => {}
            }
        }
        assert_eq!(best_idx, Some(1), "the exact-size 64 buffer should win immediately");
    }

    #[test]
    fn staleness_uses_saturating_age_difference() {
        let is_stale = |current: u64, last_used: u64, max_age: u64| current.saturating_sub(last_used) > max_age;
        assert!(!is_stale(5, 3, 8));
        assert!(is_stale(12, 3, 8));
        assert!(!is_stale(0, 3, 8), "a resource used in a later frame than 'current' is never stale");
    }
}
