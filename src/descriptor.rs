// Descriptor set tracking: binding -> {buffer, image, sampler,
// inline-uniform-block} with lazily flushed writes.
//
// Austin Shafer - 2020, adapted 2024
use ash::vk;
use rustc_hash::FxHashMap;

use crate::error::{RenderError, Result};
use crate::shader::BindingReflection;

/// A tagged union over everything `vkUpdateDescriptorSets` can write.
/// Equality is structural so that re-assigning the same value is a no-op,
/// which is what lets `set_binding` skip redundant writes.
#[derive(Clone, Debug, PartialEq)]
pub enum DescriptorSetEntry {
    Sampler(vk::Sampler),
    SampledImage {
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
    StorageImage {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    InputAttachment {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    UniformBuffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    StorageBuffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    InlineUniformBlock {
        offset: u32,
        data: Vec<u8>,
    },
}

impl DescriptorSetEntry {
    fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            DescriptorSetEntry::Sampler(_) => vk::DescriptorType::SAMPLER,
            DescriptorSetEntry::SampledImage { .. } => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorSetEntry::StorageImage { .. } => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorSetEntry::InputAttachment { .. } => vk::DescriptorType::INPUT_ATTACHMENT,
            DescriptorSetEntry::UniformBuffer { .. } => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorSetEntry::StorageBuffer { .. } => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorSetEntry::InlineUniformBlock { .. } => {
                vk::DescriptorType::INLINE_UNIFORM_BLOCK_EXT
            }
        }
    }

    fn is_valid(&self) -> bool {
        match self {
            DescriptorSetEntry::Sampler(s) => *s != vk::Sampler::null(),
            DescriptorSetEntry::SampledImage { view, sampler, .. } => {
                *view != vk::ImageView::null() && *sampler != vk::Sampler::null()
            }
            DescriptorSetEntry::StorageImage { view, .. }
            | DescriptorSetEntry::InputAttachment { view, .. } => *view != vk::ImageView::null(),
            DescriptorSetEntry::UniformBuffer { buffer, .. }
            | DescriptorSetEntry::StorageBuffer { buffer, .. } => *buffer != vk::Buffer::null(),
            DescriptorSetEntry::InlineUniformBlock { data, .. } => !data.is_empty(),
        }
    }
}

type BindingKey = (u32, u32);

/// A `VkDescriptorSet` plus the pending/bound write bookkeeping described
/// in the data model: `bound` reflects the GPU's view, `pending` holds
/// writes not yet flushed. `bound` is only ever updated by [`flush`],
/// never by [`set_binding`] — a reader that looks at `bound` between a
/// `set_binding` and the next `flush` still sees the old value.
pub struct DescriptorSet {
    pub layout: vk::DescriptorSetLayout,
    pub handle: vk::DescriptorSet,
    bound: FxHashMap<BindingKey, DescriptorSetEntry>,
    pending: FxHashMap<BindingKey, DescriptorSetEntry>,
}

impl DescriptorSet {
    pub fn new(layout: vk::DescriptorSetLayout, handle: vk::DescriptorSet) -> Self {
        Self {
            layout,
            handle,
            bound: FxHashMap::default(),
            pending: FxHashMap::default(),
        }
    }

    /// Record a pending write if `entry` differs structurally from what's
    /// currently bound at `(binding, array_index)`. Returns `Err` if
    /// `entry` is a null/empty resource (§7 `InvalidHandle`), leaving no
    /// state changed.
    pub fn set_binding(
        &mut self,
        binding: u32,
        array_index: u32,
        entry: DescriptorSetEntry,
    ) -> Result<()> {
        if !entry.is_valid() {
            return Err(RenderError::InvalidHandle {
                binding,
                array_index,
            });
        }

        let key = (binding, array_index);
        if self.bound.get(&key) == Some(&entry) {
            return Ok(());
        }
        self.pending.insert(key, entry);
        Ok(())
    }

    /// Resolve `name` to a binding via shader reflection and call
    /// [`set_binding`] with it.
    pub fn set_binding_by_name(
        &mut self,
        name: &str,
        array_index: u32,
        entry: DescriptorSetEntry,
        reflection: &[BindingReflection],
    ) -> Result<()> {
        let binding = reflection
            .iter()
            .find(|b| b.name == name)
            .map(|b| b.binding)
            .ok_or(RenderError::InvalidHandle {
                binding: u32::MAX,
                array_index,
            })?;
        self.set_binding(binding, array_index, entry)
    }

    pub fn bound_entry(&self, binding: u32, array_index: u32) -> Option<&DescriptorSetEntry> {
        self.bound.get(&(binding, array_index))
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Upload all pending writes in one batched `vkUpdateDescriptorSets`
    /// call, move them into `bound`, and clear `pending`. A pure
    /// optimization per the data model — callers may flush eagerly after
    /// every `set_binding` and correctness is unaffected, only batching.
    pub fn flush(&mut self, dev: &ash::Device) {
        if self.pending.is_empty() {
            return;
        }

        // Keep the per-entry info structs alive until the update call runs.
        let mut image_infos: Vec<vk::DescriptorImageInfo> = Vec::new();
        let mut buffer_infos: Vec<vk::DescriptorBufferInfo> = Vec::new();
        let mut inline_infos: Vec<vk::WriteDescriptorSetInlineUniformBlockEXT> = Vec::new();
        let mut writes: Vec<vk::WriteDescriptorSet> = Vec::new();

        // reserve so the Vecs never reallocate while we hold raw pointers
        // into them via the builder calls below
        image_infos.reserve(self.pending.len());
        buffer_infos.reserve(self.pending.len());
        inline_infos.reserve(self.pending.len());

        for (&(binding, array_index), entry) in self.pending.iter() {
            let mut builder = vk::WriteDescriptorSet::builder()
                .dst_set(self.handle)
                .dst_binding(binding)
                .dst_array_element(array_index)
                .descriptor_type(entry.descriptor_type());

            builder = match entry {
                DescriptorSetEntry::Sampler(sampler) => {
                    image_infos.push(
                        vk::DescriptorImageInfo::builder().sampler(*sampler).build(),
                    );
                    builder.image_info(std::slice::from_ref(image_infos.last().unwrap()))
                }
                DescriptorSetEntry::SampledImage {
                    view,
                    sampler,
                    layout,
                } => {
                    image_infos.push(
                        vk::DescriptorImageInfo::builder()
                            .image_view(*view)
                            .sampler(*sampler)
                            .image_layout(*layout)
                            .build(),
                    );
                    builder.image_info(std::slice::from_ref(image_infos.last().unwrap()))
                }
                DescriptorSetEntry::StorageImage { view, layout }
                | DescriptorSetEntry::InputAttachment { view, layout } => {
                    image_infos.push(
                        vk::DescriptorImageInfo::builder()
                            .image_view(*view)
                            .image_layout(*layout)
                            .build(),
                    );
                    builder.image_info(std::slice::from_ref(image_infos.last().unwrap()))
                }
                DescriptorSetEntry::UniformBuffer {
                    buffer,
                    offset,
                    range,
                }
                | DescriptorSetEntry::StorageBuffer {
                    buffer,
                    offset,
                    range,
                } => {
                    buffer_infos.push(
                        vk::DescriptorBufferInfo::builder()
                            .buffer(*buffer)
                            .offset(*offset)
                            .range(*range)
                            .build(),
                    );
                    builder.buffer_info(std::slice::from_ref(buffer_infos.last().unwrap()))
                }
                DescriptorSetEntry::InlineUniformBlock { data, .. } => {
                    inline_infos.push(
                        vk::WriteDescriptorSetInlineUniformBlockEXT::builder()
                            .data(data)
                            .build(),
                    );
                    builder.descriptor_count(data.len() as u32)
                }
            };

            writes.push(builder.build());
        }

        // patch p_next for inline uniform block writes now that
        // inline_infos won't reallocate again
        let mut inline_idx = 0;
        for (write, (_, entry)) in writes.iter_mut().zip(self.pending.iter()) {
            if let DescriptorSetEntry::InlineUniformBlock { .. } = entry {
                write.p_next = &inline_infos[inline_idx] as *const _ as *const std::ffi::c_void;
                inline_idx += 1;
            }
        }

        unsafe {
            dev.update_descriptor_sets(&writes, &[]);
        }

        for (key, entry) in self.pending.drain() {
            self.bound.insert(key, entry);
        }
    }
}
