//! GPU resource management and frame-graph execution core for a real-time
//! Vulkan renderer.
//!
//! This crate owns the hot path of every rendered frame: sub-allocating
//! device memory, pooling transient buffers/images/descriptor-sets/command
//! buffers, reflecting and caching shader pipelines, and recording +
//! submitting command buffers with fence-driven pool recycling. It does not
//! know anything about scenes, assets, or windowing — those are the caller's
//! job; this crate exposes primitives.
#![allow(clippy::too_many_arguments)]

extern crate ash;

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod frame;
pub mod image;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod platform;
pub mod pool;
pub mod renderpass;
pub mod shader;

pub use buffer::{Buffer, BufferView};
pub use command::{CommandBuffer, CommandBufferState};
pub use descriptor::{DescriptorSet, DescriptorSetEntry};
pub use device::Device;
pub use error::{RenderError, Result};
pub use frame::{FrameLoop, Swapchain};
pub use image::{Image, ImageLayoutState};
pub use instance::Instance;
pub use memory::{DeviceAllocator, SubAllocation};
pub use pipeline::{BlendMode, GraphicsPipelineRequest, Pipeline, PipelineCache, VertexInputDesc};
pub use pool::ResourcePool;
pub use renderpass::{Framebuffer, RenderPass};
pub use shader::{ComputeVariant, Shader, ShaderModule, ShaderVariant};

use std::ffi::CString;

/// Tunables for the device memory allocator (component A).
///
/// `Serialize`/`Deserialize` are derived so a host embedding this crate can
/// fold allocator tuning into its own config file; this crate itself has no
/// config-file format (see [`CreateInfo`]'s docs).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct AllocatorConfig {
    /// Alignment granularity sub-allocations are rounded up to.
    pub block_align: u64,
    /// Minimum size of a freshly created `MemoryBlock`.
    pub min_block_size: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            block_align: memory::MEM_BLOCK_SIZE,
            min_block_size: memory::MEM_MIN_ALLOC,
        }
    }
}

/// Construction-time configuration for a [`Device`].
///
/// This is the crate's only configuration surface: there is no config file
/// format, since this is a library meant to be embedded by a host
/// application that already has its own configuration story. Build one with
/// [`CreateInfo::builder`].
#[derive(Clone)]
pub struct CreateInfo {
    pub enable_validation: bool,
    pub instance_extensions: Vec<CString>,
    pub device_extensions: Vec<CString>,
    pub allocator: AllocatorConfig,
    /// Default `max_age_frames` passed to `ResourcePool::purge` by the frame loop.
    pub purge_age_frames: u32,
    /// Path the pipeline cache blob is read from/written to.
    pub pipeline_cache_path: String,
}

impl Default for CreateInfo {
    fn default() -> Self {
        Self {
            enable_validation: cfg!(debug_assertions),
            instance_extensions: Vec::new(),
            device_extensions: Vec::new(),
            allocator: AllocatorConfig::default(),
            purge_age_frames: 8,
            pipeline_cache_path: "./pcache".to_string(),
        }
    }
}

impl CreateInfo {
    pub fn builder() -> CreateInfoBuilder {
        CreateInfoBuilder {
            info: CreateInfo::default(),
        }
    }
}

/// Builder for [`CreateInfo`], matching the builder idiom used throughout
/// this crate's own types (`vk::*CreateInfo::builder()`).
pub struct CreateInfoBuilder {
    info: CreateInfo,
}

impl CreateInfoBuilder {
    pub fn enable_validation(mut self, enable: bool) -> Self {
        self.info.enable_validation = enable;
        self
    }

    pub fn instance_extension(mut self, name: CString) -> Self {
        self.info.instance_extensions.push(name);
        self
    }

    pub fn device_extension(mut self, name: CString) -> Self {
        self.info.device_extensions.push(name);
        self
    }

    pub fn allocator_config(mut self, config: AllocatorConfig) -> Self {
        self.info.allocator = config;
        self
    }

    pub fn purge_age_frames(mut self, frames: u32) -> Self {
        self.info.purge_age_frames = frames;
        self
    }

    pub fn pipeline_cache_path<S: Into<String>>(mut self, path: S) -> Self {
        self.info.pipeline_cache_path = path.into();
        self
    }

    pub fn build(self) -> CreateInfo {
        self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_config_round_trips_through_bincode() {
        let config = AllocatorConfig {
            block_align: 8192,
            min_block_size: 16 * 1024 * 1024,
        };

        let bytes = bincode::serialize(&config).unwrap();
        let decoded: AllocatorConfig = bincode::deserialize(&bytes).unwrap();

        assert_eq!(decoded.block_align, config.block_align);
        assert_eq!(decoded.min_block_size, config.min_block_size);
    }
}
