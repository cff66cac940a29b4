// Image resource: a `VkImage` bound to a sub-allocation, with the
// last-known layout/stage/access bookkeeping the command buffer's
// automatic barrier insertion relies on.
//
// Austin Shafer - 2020, adapted 2024
use ash::vk;

use crate::memory::SubAllocation;

/// Conservative assumption about an image's current place in the pipeline.
/// Mutated only by command recording (`CommandBuffer::transition`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageLayoutState {
    pub layout: vk::ImageLayout,
    pub stage: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
}

impl ImageLayoutState {
    pub fn undefined() -> Self {
        Self {
            layout: vk::ImageLayout::UNDEFINED,
            stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            access: vk::AccessFlags::empty(),
        }
    }
}

/// Lookup table backing `GuessStage`/`GuessAccessMask`: a conservative
/// (stage, access) pair for a barrier that only specifies the destination
/// layout. Table values are fixed by this crate's external interface (not
/// user configurable), so unrecognized layouts fall back to ALL_COMMANDS /
/// MEMORY_READ|WRITE rather than panicking.
pub fn guess_stage_and_access(layout: vk::ImageLayout) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
        vk::ImageLayout::GENERAL => (
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE)
        }
        vk::ImageLayout::PRESENT_SRC_KHR => {
            (vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty())
        }
        _ => (
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
        ),
    }
}

/// A GPU image backed by a single [`SubAllocation`], plus its default
/// full-resource view.
pub struct Image {
    pub handle: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub sample_count: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    pub memory_properties: vk::MemoryPropertyFlags,
    pub sub_allocation: SubAllocation,
    pub last_known: ImageLayoutState,
}

impl Image {
    pub fn new(
        handle: vk::Image,
        view: vk::ImageView,
        extent: vk::Extent3D,
        format: vk::Format,
        mip_levels: u32,
        array_layers: u32,
        sample_count: vk::SampleCountFlags,
        usage: vk::ImageUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
        sub_allocation: SubAllocation,
    ) -> Self {
        Self {
            handle,
            view,
            extent,
            format,
            mip_levels,
            array_layers,
            sample_count,
            usage,
            memory_properties,
            sub_allocation,
            last_known: ImageLayoutState::undefined(),
        }
    }

    /// The `(extent, format, mips, samples)` bucket key the resource pool
    /// hashes images by (§4.2).
    pub fn bucket_key(&self) -> (u32, u32, u32, vk::Format, u32, u32) {
        (
            self.extent.width,
            self.extent.height,
            self.extent.depth,
            self.format,
            self.mip_levels,
            self.sample_count.as_raw(),
        )
    }

    pub fn satisfies(&self, usage: vk::ImageUsageFlags, properties: vk::MemoryPropertyFlags) -> bool {
        self.usage.contains(usage) && self.memory_properties.contains(properties)
    }
}
