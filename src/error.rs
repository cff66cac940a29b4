// Error types for the rendering core.
//
// Austin Shafer - 2020, adapted 2024

use ash::vk;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RenderError>;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("device memory allocation failed for memory type {memory_type} (requested {requested} bytes)")]
    OutOfMemory { memory_type: u32, requested: u64 },

    #[error("descriptor set received an invalid handle for binding {binding} (array index {array_index})")]
    InvalidHandle { binding: u32, array_index: u32 },

    #[error("framebuffer is missing attachment '{0}' required by its render pass")]
    MissingAttachment(String),

    #[error("shader package load failed: {0}")]
    ShaderLoadError(String),

    #[error("pipeline creation failed: {0:?}")]
    PipelineCreateError(vk::Result),

    #[error("swapchain is out of date and must be recreated")]
    SwapchainOutOfDate,

    #[error("vulkan call failed: {0:?}")]
    VulkanError(vk::Result),

    #[error("timed out waiting on a fence")]
    FenceTimeout,
}

impl From<ash::InstanceError> for RenderError {
    fn from(err: ash::InstanceError) -> Self {
        match err {
            ash::InstanceError::VkError(res) => RenderError::from(res),
            ash::InstanceError::LoadError(errs) => {
                log::error!("failed to load Vulkan entry points: {:?}", errs);
                RenderError::VulkanError(vk::Result::ERROR_INITIALIZATION_FAILED)
            }
        }
    }
}

impl From<vk::Result> for RenderError {
    fn from(res: vk::Result) -> Self {
        match res {
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR => {
                RenderError::SwapchainOutOfDate
            }
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                RenderError::OutOfMemory {
                    memory_type: u32::MAX,
                    requested: 0,
                }
            }
            vk::Result::TIMEOUT => RenderError::FenceTimeout,
            other => RenderError::VulkanError(other),
        }
    }
}
