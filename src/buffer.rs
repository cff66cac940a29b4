// Buffer resource: a `VkBuffer` bound to a sub-allocation.
//
// Austin Shafer - 2020, adapted 2024
use ash::vk;

use crate::memory::SubAllocation;

/// A GPU buffer backed by a single [`SubAllocation`].
pub struct Buffer {
    pub handle: vk::Buffer,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory_properties: vk::MemoryPropertyFlags,
    pub sub_allocation: SubAllocation,
}

impl Buffer {
    pub fn new(
        handle: vk::Buffer,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
        sub_allocation: SubAllocation,
    ) -> Self {
        Self {
            handle,
            size,
            usage,
            memory_properties,
            sub_allocation,
        }
    }

    /// Whether this buffer could serve a request for `usage`/`properties`
    /// at `requested_size`, per the resource pool's selection rule
    /// (§4.2): `usage ⊇ requested_usage ∧ properties ⊇ requested_properties
    /// ∧ size ≥ requested_size`.
    pub fn satisfies(
        &self,
        requested_size: u64,
        requested_usage: vk::BufferUsageFlags,
        requested_properties: vk::MemoryPropertyFlags,
    ) -> bool {
        self.usage.contains(requested_usage)
            && self.memory_properties.contains(requested_properties)
            && self.size >= requested_size
    }

    /// A typed, range-limited view into this buffer.
    pub fn view(&self, offset: u64, element_size: u64, element_count: u64) -> BufferView {
        BufferView {
            offset,
            element_size,
            element_count,
        }
    }
}

/// A typed, range-limited view into a [`Buffer`]. Kept separate from
/// `Buffer` itself (rather than baked into its handle) since the same
/// buffer is often viewed several different ways (e.g. a staging buffer
/// that backs several independent uploads).
#[derive(Clone, Copy, Debug)]
pub struct BufferView {
    pub offset: u64,
    pub element_size: u64,
    pub element_count: u64,
}

impl BufferView {
    pub fn byte_range(&self) -> (u64, u64) {
        (self.offset, self.element_size * self.element_count)
    }
}
