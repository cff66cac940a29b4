// Device memory sub-allocator.
//
// Partitions a small number of large `VkDeviceMemory` heap allocations into
// many small sub-allocations with best-fit placement and a coalescing free
// list, so that individual buffers/images don't each pay for their own
// `vkAllocateMemory` call (a scarce resource on most drivers).
//
// Austin Shafer - 2020, adapted 2024
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::{RenderError, Result};

/// Granularity every sub-allocation offset/size is rounded up to.
pub const MEM_BLOCK_SIZE: u64 = 4 * 1024;
/// Minimum size of a freshly allocated `MemoryBlock`.
pub const MEM_MIN_ALLOC: u64 = 4 * 1024 * 1024;

pub fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// A contiguous range carved out of a [`MemoryBlock`] and exclusively owned
/// by one `Buffer` or `Image`.
#[derive(Debug, Clone, Copy)]
pub struct SubAllocation {
    /// Identifies the owning block; used by `free` to find it again.
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
    pub memory_type: u32,
    /// Non-null if the owning block is host-visible and mapped.
    pub mapped_ptr: Option<*mut u8>,
}

unsafe impl Send for SubAllocation {}

struct LiveAllocation {
    offset: u64,
    size: u64,
    tag: String,
}

/// One `vkAllocateMemory` heap allocation, sub-divided among live
/// allocations with a sorted, coalescing free-interval list.
struct MemoryBlock {
    memory: vk::DeviceMemory,
    memory_type_index: u32,
    size: u64,
    mapped_ptr: Option<*mut u8>,
    /// Sorted by offset, pairwise disjoint. Invariant: the union of these
    /// with `live` covers exactly `[0, size)`.
    free_intervals: Vec<(u64, u64)>,
    live: Vec<LiveAllocation>,
}

impl MemoryBlock {
    fn new(memory: vk::DeviceMemory, memory_type_index: u32, size: u64, mapped_ptr: Option<*mut u8>) -> Self {
        Self {
            memory,
            memory_type_index,
            size,
            mapped_ptr,
            free_intervals: vec![(0, size)],
            live: Vec::new(),
        }
    }

    /// Best-fit scan: find the smallest free interval that can host
    /// `size` bytes once `offset` is aligned up to `alignment`. Returns the
    /// interval's index and the aligned offset the allocation would start at.
    fn find_best_fit(&self, size: u64, alignment: u64) -> Option<(usize, u64)> {
        let mut best: Option<(usize, u64, u64)> = None; // (index, aligned_offset, interval_size)

        for (i, &(off, len)) in self.free_intervals.iter().enumerate() {
            let aligned_off = align_up(off, alignment);
            let needed = (aligned_off - off) + size;
            if needed > len {
                continue;
            }
            match &best {
                // Corrected best-fit comparison: a candidate replaces the
                // current best only when it is strictly smaller. Comparing
                // a candidate's size against itself here would always be
                // false and silently degenerate this into first-fit.
                Some((_, _, best_len)) if len < *best_len => {
                    best = Some((i, aligned_off, len));
                }
                None => best = Some((i, aligned_off, len)),
                _ => {}
            }
        }

        best.map(|(i, off, _)| (i, off))
    }

    fn sub_allocate(&mut self, size: u64, alignment: u64, tag: &str) -> Option<SubAllocation> {
        let (idx, aligned_off) = self.find_best_fit(size, alignment)?;
        let (interval_off, interval_len) = self.free_intervals.remove(idx);
        let interval_end = interval_off + interval_len;

        if aligned_off > interval_off {
            self.free_intervals
                .insert(idx, (interval_off, aligned_off - interval_off));
        }
        let alloc_end = aligned_off + size;
        if alloc_end < interval_end {
            let insert_at = self
                .free_intervals
                .iter()
                .position(|&(o, _)| o > alloc_end)
                .unwrap_or(self.free_intervals.len());
            self.free_intervals
                .insert(insert_at, (alloc_end, interval_end - alloc_end));
        }

        self.live.push(LiveAllocation {
            offset: aligned_off,
            size,
            tag: tag.to_string(),
        });

        Some(SubAllocation {
            memory: self.memory,
            offset: aligned_off,
            size,
            memory_type: self.memory_type_index,
            mapped_ptr: self
                .mapped_ptr
                .map(|p| unsafe { p.add(aligned_off as usize) }),
        })
    }

    fn free(&mut self, offset: u64, size: u64) {
        if let Some(pos) = self.live.iter().position(|a| a.offset == offset) {
            self.live.remove(pos);
        } else {
            log::warn!(
                "freed a sub-allocation at offset {} not present in the live list",
                offset
            );
        }

        let mut lo = offset;
        let mut hi = offset + size;

        // merge with predecessor/successor, folding the freed range into
        // the sorted interval list
        let mut i = 0;
        while i < self.free_intervals.len() {
            let (o, l) = self.free_intervals[i];
            if o + l == lo {
                lo = o;
                self.free_intervals.remove(i);
                continue;
            }
            if hi == o {
                hi = o + l;
                self.free_intervals.remove(i);
                continue;
            }
            i += 1;
        }

        let insert_at = self
            .free_intervals
            .iter()
            .position(|&(o, _)| o > lo)
            .unwrap_or(self.free_intervals.len());
        self.free_intervals.insert(insert_at, (lo, hi - lo));
    }

    fn is_entirely_free(&self) -> bool {
        self.free_intervals.len() == 1 && self.free_intervals[0] == (0, self.size)
    }
}

struct AllocatorState {
    blocks: HashMap<u32, Vec<MemoryBlock>>,
}

/// Device-owned sub-allocator for `VkDeviceMemory`. Matches the ownership
/// rule in the data model: one allocator per `Device`, never process-global.
pub struct DeviceAllocator {
    dev: ash::Device,
    mem_props: vk::PhysicalDeviceMemoryProperties,
    min_block_size: u64,
    block_align: u64,
    state: Mutex<AllocatorState>,
}

impl DeviceAllocator {
    pub fn new(
        dev: ash::Device,
        mem_props: vk::PhysicalDeviceMemoryProperties,
        min_block_size: u64,
        block_align: u64,
    ) -> Self {
        Self {
            dev,
            mem_props,
            min_block_size,
            block_align,
            state: Mutex::new(AllocatorState {
                blocks: HashMap::new(),
            }),
        }
    }

    fn find_memory_type_index(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        for i in 0..self.mem_props.memory_type_count {
            if (type_bits & (1 << i)) != 0
                && self.mem_props.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
            {
                return Some(i);
            }
        }
        None
    }

    fn create_block(
        &self,
        type_index: u32,
        size: u64,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<MemoryBlock> {
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(type_index);

        let memory = unsafe {
            self.dev
                .allocate_memory(&alloc_info, None)
                .map_err(|_| RenderError::OutOfMemory {
                    memory_type: type_index,
                    requested: size,
                })?
        };

        let mapped_ptr = if properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            let ptr = unsafe {
                self.dev
                    .map_memory(memory, 0, size, vk::MemoryMapFlags::empty())
                    .map_err(|_| RenderError::OutOfMemory {
                        memory_type: type_index,
                        requested: size,
                    })?
            };
            Some(ptr as *mut u8)
        } else {
            None
        };

        Ok(MemoryBlock::new(memory, type_index, size, mapped_ptr))
    }

    /// Sub-allocate `requirements.size` bytes satisfying `properties`,
    /// tagged `tag` for debugging/eviction bookkeeping.
    pub fn allocate(
        &self,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
        tag: &str,
    ) -> Result<SubAllocation> {
        let type_index = self
            .find_memory_type_index(requirements.memory_type_bits, properties)
            .ok_or(RenderError::OutOfMemory {
                memory_type: u32::MAX,
                requested: requirements.size,
            })?;

        let mut state = self.state.lock();
        let blocks = state.blocks.entry(type_index).or_insert_with(Vec::new);

        for block in blocks.iter_mut() {
            if let Some(sub) = block.sub_allocate(requirements.size, requirements.alignment, tag) {
                return Ok(sub);
            }
        }

        let block_size = std::cmp::max(
            self.min_block_size,
            align_up(requirements.size, self.block_align),
        );
        let mut new_block = self.create_block(type_index, block_size, properties)?;
        let sub = new_block
            .sub_allocate(requirements.size, requirements.alignment, tag)
            .ok_or(RenderError::OutOfMemory {
                memory_type: type_index,
                requested: requirements.size,
            })?;
        blocks.push(new_block);
        Ok(sub)
    }

    /// Release a sub-allocation back to its owning block. A block that
    /// becomes entirely free is released back to the device.
    pub fn free(&self, sub: &SubAllocation) {
        let mut state = self.state.lock();
        let blocks = match state.blocks.get_mut(&sub.memory_type) {
            Some(b) => b,
            None => return,
        };

        let idx = match blocks.iter().position(|b| b.memory == sub.memory) {
            Some(i) => i,
            // Defensive: silently ignore frees whose block can't be found.
            None => return,
        };

        blocks[idx].free(sub.offset, sub.size);

        if blocks[idx].is_entirely_free() {
            let block = blocks.remove(idx);
            unsafe {
                if block.mapped_ptr.is_some() {
                    self.dev.unmap_memory(block.memory);
                }
                self.dev.free_memory(block.memory, None);
            }
        }
    }
}

    /// Unmap and free every still-live `MemoryBlock`. Called explicitly by
    /// `Device::drop` *before* `vkDestroyDevice` (§9: "destroy pools, then
    /// memory blocks"), since a sub-allocation can outlive the `Device`'s
    /// `pool`/`allocator` fields (e.g. a `Framebuffer`'s attachment image the
    /// host never released) and dropping the `Arc<DeviceAllocator>` alone
    /// doesn't guarantee this runs before the logical device is gone.
    /// Idempotent: `Drop` calls this again as a safety net, but by then
    /// `state.blocks` is already empty so it is a no-op.
    pub unsafe fn destroy_all(&self) {
        let mut state = self.state.lock();
        for (_, blocks) in state.blocks.drain() {
            for block in blocks {
                if block.mapped_ptr.is_some() {
                    self.dev.unmap_memory(block.memory);
                }
                self.dev.free_memory(block.memory, None);
            }
        }
    }
}

impl Drop for DeviceAllocator {
    fn drop(&mut self) {
        unsafe { self.destroy_all() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests exercise `MemoryBlock`'s allocation bookkeeping directly,
    // sidestepping the real device calls `DeviceAllocator` makes.
    fn fake_block(size: u64) -> MemoryBlock {
        MemoryBlock::new(vk::DeviceMemory::null(), 0, size, None)
    }

    #[test]
    fn allocator_fit_scenario() {
        let mut block = fake_block(4 * 1024 * 1024);

        let a = block.sub_allocate(1024 * 1024, 256, "A").unwrap();
        assert_eq!(a.offset, 0);

        let b = block.sub_allocate(2 * 1024 * 1024, 256, "B").unwrap();
        assert_eq!(b.offset, 1024 * 1024);

        block.free(a.offset, a.size);

        let c = block.sub_allocate(512 * 1024, 256, "C").unwrap();
        assert_eq!(c.offset, 0);

        // invariant: free + live covers the whole block, disjointly
        let mut covered: Vec<(u64, u64)> = block
            .free_intervals
            .iter()
            .cloned()
            .chain(block.live.iter().map(|l| (l.offset, l.size)))
            .collect();
        covered.sort_by_key(|&(o, _)| o);
        let mut cursor = 0;
        for (o, s) in covered {
            assert_eq!(o, cursor, "free/live ranges must be contiguous and disjoint");
            cursor += s;
        }
        assert_eq!(cursor, block.size);
    }

    #[test]
    fn coalesces_adjacent_frees() {
        let mut block = fake_block(1024 * 1024);
        let a = block.sub_allocate(4096, 256, "A").unwrap();
        let b = block.sub_allocate(4096, 256, "B").unwrap();
        assert_eq!(a.offset + a.size, b.offset);

        block.free(a.offset, a.size);
        block.free(b.offset, b.size);

        assert_eq!(block.free_intervals.len(), 1);
        assert_eq!(block.free_intervals[0], (0, block.size));
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_interval() {
        let mut block = fake_block(1024 * 1024);
        let a = block.sub_allocate(64 * 1024, 256, "A").unwrap();
        let b = block.sub_allocate(64 * 1024, 256, "B").unwrap();
        let c = block.sub_allocate(64 * 1024, 256, "C").unwrap();
        // free A (64K hole) and C (64K hole at the tail, merges with the
        // block's remaining free space into one big interval) -- keep B live
        // so the small hole at A's old spot is a distinct, smaller interval
        // than the rest of the block.
        block.free(a.offset, a.size);
        block.free(c.offset, c.size);

        let d = block.sub_allocate(32 * 1024, 256, "D").unwrap();
        assert_eq!(d.offset, a.offset, "smallest sufficient interval should win");
        let _ = b;
    }
}
