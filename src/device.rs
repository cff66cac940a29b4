// The Device: the substrate every other component in this crate runs on
// top of. Owns the logical `ash::Device`, the memory allocator, the global
// pipeline cache, loaded shaders, and the resource pool (§9 "Global state").
//
// Austin Shafer - 2020, adapted 2024
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use ash::vk;

use crate::error::{RenderError, Result};
use crate::instance::Instance;
use crate::memory::DeviceAllocator;
use crate::pipeline::PipelineCache;
use crate::platform::VulkanFeatures;
use crate::pool::ResourcePool;
use crate::shader::Shader;
use crate::CreateInfo;

/// Chooses a physical device.
///
/// For now this takes the first device Vulkan reports; a multi-GPU host
/// wanting a specific one should filter the extensions/limits it cares
/// about itself and is free to fork this once there's more than one
/// plausible policy.
fn select_pdev(inst: &ash::Instance) -> Result<vk::PhysicalDevice> {
    let pdevices = unsafe {
        inst.enumerate_physical_devices()
            .map_err(RenderError::from)?
    };

    pdevices
        .into_iter()
        .next()
        .ok_or_else(|| RenderError::VulkanError(vk::Result::ERROR_INITIALIZATION_FAILED))
}

/// Picks a queue family that supports both graphics and compute. This
/// crate's frame loop and shader system only ever submit to one queue;
/// a host that needs a dedicated transfer/present queue owns that
/// decision itself.
fn select_queue_family(inst: &ash::Instance, pdev: vk::PhysicalDevice) -> Result<u32> {
    unsafe { inst.get_physical_device_queue_family_properties(pdev) }
        .iter()
        .enumerate()
        .find(|(_, props)| {
            props
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|(index, _)| index as u32)
        .ok_or(RenderError::VulkanError(
            vk::Result::ERROR_INITIALIZATION_FAILED,
        ))
}

fn create_logical_device(
    inst: &ash::Instance,
    pdev: vk::PhysicalDevice,
    queue_family: u32,
    dev_features: &VulkanFeatures,
    info: &CreateInfo,
) -> Result<ash::Device> {
    let extension_names = dev_features.device_extensions(&info.device_extensions);

    let features = vk::PhysicalDeviceFeatures::builder()
        .shader_clip_distance(true)
        .vertex_pipeline_stores_and_atomics(true)
        .fragment_stores_and_atomics(true)
        .build();

    let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::builder()
        .timeline_semaphore(dev_features.supports_timeline_semaphore)
        .descriptor_indexing(dev_features.supports_desc_indexing)
        .shader_sampled_image_array_non_uniform_indexing(dev_features.supports_desc_indexing)
        .runtime_descriptor_array(dev_features.supports_desc_indexing)
        .descriptor_binding_variable_descriptor_count(dev_features.supports_desc_indexing)
        .descriptor_binding_partially_bound(dev_features.supports_desc_indexing)
        .build();

    let priorities = [1.0];
    let queue_info = vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(queue_family)
        .queue_priorities(&priorities)
        .build();

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(std::slice::from_ref(&queue_info))
        .enabled_extension_names(&extension_names)
        .enabled_features(&features)
        .push_next(&mut vulkan12_features);

    unsafe { inst.create_device(pdev, &create_info, None) }.map_err(RenderError::from)
}

/// The top-level handle this crate hands its host: owns every GPU-memory
/// block, the global pipeline cache, and every loaded shader (§3 "Ownership
/// summary"). Constructed once at startup, torn down once at shutdown.
pub struct Device {
    instance: Arc<Instance>,
    pub(crate) pdev: vk::PhysicalDevice,
    pub(crate) dev: ash::Device,
    pub(crate) dev_features: VulkanFeatures,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    pub(crate) queue_family_index: u32,
    pub(crate) queue: vk::Queue,

    pub allocator: Arc<DeviceAllocator>,
    pub pool: ResourcePool,
    pub pipeline_cache: PipelineCache,
    shaders: HashMap<String, Shader>,

    pipeline_cache_path: String,
}

impl Device {
    /// Builds a `Device` against the first suitable physical device behind
    /// `instance`. Reads the pipeline cache blob at `info.pipeline_cache_path`
    /// if present (a missing file is not an error, per §4.5).
    pub fn new(instance: Arc<Instance>, info: &CreateInfo) -> Result<Self> {
        let inst = &instance.inst;
        let pdev = select_pdev(inst)?;
        let queue_family_index = select_queue_family(inst, pdev)?;
        let mem_props = unsafe { inst.get_physical_device_memory_properties(pdev) };
        let dev_features = VulkanFeatures::probe(info, inst, pdev);

        if !dev_features.supports_swapchain {
            return Err(RenderError::VulkanError(
                vk::Result::ERROR_EXTENSION_NOT_PRESENT,
            ));
        }

        let dev = create_logical_device(inst, pdev, queue_family_index, &dev_features, info)?;
        let queue = unsafe { dev.get_device_queue(queue_family_index, 0) };

        let allocator = Arc::new(DeviceAllocator::new(
            dev.clone(),
            mem_props,
            info.allocator.min_block_size,
            info.allocator.block_align,
        ));

        let pool = ResourcePool::new(dev.clone(), allocator.clone(), queue_family_index);

        let pipeline_cache =
            PipelineCache::new(&dev, Path::new(&info.pipeline_cache_path))?;

        Ok(Self {
            instance,
            pdev,
            dev,
            dev_features,
            mem_props,
            queue_family_index,
            queue,
            allocator,
            pool,
            pipeline_cache,
            shaders: HashMap::new(),
            pipeline_cache_path: info.pipeline_cache_path.clone(),
        })
    }

    /// The raw logical device handle. Other components in this crate
    /// (`CommandBuffer`, `RenderPass`, `Swapchain`, ...) are constructed
    /// against this rather than against `Device` itself, so they remain
    /// usable in tests that only have an `ash::Device` handy.
    pub fn raw(&self) -> &ash::Device {
        &self.dev
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.pdev
    }

    pub fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.mem_props
    }

    pub fn features(&self) -> &VulkanFeatures {
        &self.dev_features
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Loads a compiled shader package (§4.4) and registers it under `name`,
    /// replacing any shader previously registered under the same name.
    pub fn load_shader_package(&mut self, name: &str, path: &Path) -> Result<()> {
        let shader = Shader::load_shader_package(&self.dev, path)?;
        if let Some(old) = self.shaders.insert(name.to_string(), shader) {
            unsafe { old.destroy(&self.dev) };
        }
        Ok(())
    }

    pub fn shader(&self, name: &str) -> Option<&Shader> {
        self.shaders.get(name)
    }

    /// Waits until every submitted command buffer on this device's queue
    /// has completed. Used before recreating a swapchain and during
    /// shutdown.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.dev.device_wait_idle() }.map_err(RenderError::from)
    }
}

impl Drop for Device {
    /// Per §9: wait for queue idle, then destroy pools, then memory blocks.
    /// The pipeline cache blob is persisted before any of that, so a crash
    /// mid-teardown still leaves behind a usable cache from the prior run.
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            log::error!("device_wait_idle failed during Device teardown: {:?}", e);
        }

        self.pipeline_cache
            .save(&self.dev, Path::new(&self.pipeline_cache_path));

        for (_, shader) in self.shaders.drain() {
            unsafe { shader.destroy(&self.dev) };
        }

        unsafe {
            self.pool.destroy();
            self.pipeline_cache.destroy(&self.dev);
        }

        // Free every MemoryBlock explicitly before destroying the logical
        // device: a sub-allocation can outlive `pool`/`allocator`'s own Arc
        // references (e.g. a `Framebuffer` attachment image the host never
        // released), so waiting for `DeviceAllocator`'s own `Drop` to run
        // after this function returns would free against an already-
        // destroyed `VkDevice`. `DeviceAllocator::drop` still runs afterward
        // when the last `Arc` goes away, but finds nothing left to do.
        unsafe {
            self.allocator.destroy_all();
            self.dev.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_info_defaults_feed_device_construction() {
        // Device::new requires a live Vulkan instance and is exercised by
        // the headless integration smoke test instead; this just locks in
        // that the config surface Device::new consumes has sane defaults.
        let info = CreateInfo::default();
        assert_eq!(info.pipeline_cache_path, "./pcache");
        assert_eq!(info.purge_age_frames, 8);
    }
}
