// This module handles probing the physical device for the extensions and
// features this crate's components rely on: descriptor indexing (bindless
// sampler arrays), timeline semaphores (submission tracking), and inline
// uniform blocks (component C's inline-uniform-block descriptor kind).
//
// Austin Shafer - 2021, adapted 2024
use ash::extensions::khr;
use ash::{vk, Instance};

use crate::CreateInfo;
use std::ffi::CStr;

/// The available Vulkan capabilities this crate cares about.
///
/// Composed of flags for available features plus the extension name lists
/// that back them, so the device-creation call site can build its enabled
/// extension list straight from the flags without keeping extra state
/// around.
pub struct VulkanFeatures {
    /// Required: all devices this crate targets must support swapchains.
    pub supports_swapchain: bool,
    /// Descriptor indexing — required for the unsized sampler arrays used
    /// by bindless-style descriptor sets.
    pub supports_desc_indexing: bool,
    /// Timeline semaphores — used by the device's submission/deletion-queue
    /// tracking instead of a forest of binary semaphores.
    pub supports_timeline_semaphore: bool,
    /// Inline uniform blocks — backs `DescriptorSetEntry::InlineUniformBlock`.
    pub supports_inline_uniform_block: bool,

    desc_indexing_exts: [*const i8; 2],
    timeline_sema_exts: [*const i8; 1],
    inline_uniform_block_exts: [*const i8; 1],
}

fn contains_extensions(exts: &[vk::ExtensionProperties], req: &[*const i8]) -> bool {
    let mut count = 0;

    for r in req.iter() {
        let rstr = unsafe { CStr::from_ptr(*r as *const std::os::raw::c_char) };

        for e in exts {
            let estr = unsafe { CStr::from_ptr(e.extension_name.as_ptr()) };
            if rstr == estr {
                count += 1;
                if count == req.len() {
                    return true;
                }
                break;
            }
        }
    }

    false
}

impl VulkanFeatures {
    pub fn probe(_info: &CreateInfo, inst: &Instance, pdev: vk::PhysicalDevice) -> Self {
        let mut ret = Self {
            supports_swapchain: false,
            supports_desc_indexing: false,
            supports_timeline_semaphore: false,
            supports_inline_uniform_block: false,
            desc_indexing_exts: [
                vk::KhrMaintenance3Fn::name().as_ptr(),
                vk::ExtDescriptorIndexingFn::name().as_ptr(),
            ],
            timeline_sema_exts: [vk::KhrTimelineSemaphoreFn::name().as_ptr()],
            inline_uniform_block_exts: [vk::ExtInlineUniformBlockFn::name().as_ptr()],
        };

        let exts = unsafe {
            inst.enumerate_device_extension_properties(pdev)
                .unwrap_or_default()
        };

        ret.supports_swapchain = contains_extensions(&exts, &[khr::Swapchain::name().as_ptr()]);
        if !ret.supports_swapchain {
            log::error!("this physical device does not support VK_KHR_swapchain");
        }

        ret.supports_desc_indexing = contains_extensions(&exts, &ret.desc_indexing_exts);
        if !ret.supports_desc_indexing {
            log::warn!("this physical device does not support descriptor indexing");
        }

        ret.supports_timeline_semaphore = contains_extensions(&exts, &ret.timeline_sema_exts);
        if !ret.supports_timeline_semaphore {
            log::warn!("this physical device does not support timeline semaphores");
        }

        ret.supports_inline_uniform_block =
            contains_extensions(&exts, &ret.inline_uniform_block_exts);
        if !ret.supports_inline_uniform_block {
            log::warn!("this physical device does not support inline uniform blocks");
        }

        ret
    }

    /// Build the list of device extensions to enable, derived from the
    /// probed flags plus whatever the caller additionally requested.
    pub fn device_extensions(&self, extra: &[std::ffi::CString]) -> Vec<*const i8> {
        let mut ret = vec![khr::Swapchain::name().as_ptr()];

        if self.supports_desc_indexing {
            ret.extend_from_slice(&self.desc_indexing_exts);
        }
        if self.supports_timeline_semaphore {
            ret.extend_from_slice(&self.timeline_sema_exts);
        }
        if self.supports_inline_uniform_block {
            ret.extend_from_slice(&self.inline_uniform_block_exts);
        }
        ret.extend(extra.iter().map(|e| e.as_ptr()));

        ret
    }
}
