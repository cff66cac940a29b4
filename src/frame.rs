// Swapchain wrapper (§4.8a) and the per-frame acquire/render/submit/present
// sequence (§4.8) that drives it.
//
// Austin Shafer - 2020, adapted 2024
use ash::extensions::khr;
use ash::vk;

use crate::command::CommandBuffer;
use crate::error::{RenderError, Result};
use crate::image::Image;
use crate::pool::ResourcePool;

/// A minimal swapchain: just enough for `acquire_next_image` / `present` /
/// `recreate` (§4.8a). Surface creation is the host's job -- this crate is
/// handed a `vk::SurfaceKHR` it doesn't own the lifetime of.
pub struct Swapchain {
    loader: khr::Swapchain,
    surface_loader: khr::Surface,
    surface: vk::SurfaceKHR,
    pdev: vk::PhysicalDevice,
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    /// Frames since each image was last presented; used to bound
    /// incremental-present damage accumulation.
    pub image_ages: Vec<u32>,
}

impl Swapchain {
    pub fn new(
        instance: &ash::Instance,
        dev: &ash::Device,
        pdev: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        format: vk::Format,
    ) -> Result<Self> {
        let loader = khr::Swapchain::new(instance, dev);
        let surface_loader = khr::Surface::new(&ash::Entry::linked(), instance);

        let mut sc = Self {
            loader,
            surface_loader,
            surface,
            pdev,
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            format,
            extent: vk::Extent2D { width: 0, height: 0 },
            image_ages: Vec::new(),
        };
        sc.build(dev, vk::SwapchainKHR::null())?;
        Ok(sc)
    }

    fn build(&mut self, dev: &ash::Device, old: vk::SwapchainKHR) -> Result<()> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.pdev, self.surface)?
        };
        // `current_extent.width == u32::MAX` means the surface defers sizing
        // to us (e.g. Wayland): fall back to this swapchain's previous size
        // if it has one, or the largest the surface allows otherwise, and
        // clamp either into the surface's accepted range.
        let extent = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            let chosen = if self.extent.width != 0 && self.extent.height != 0 {
                self.extent
            } else {
                caps.max_image_extent
            };
            vk::Extent2D {
                width: chosen
                    .width
                    .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: chosen
                    .height
                    .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        };

        let image_count = if caps.max_image_count > 0 {
            (caps.min_image_count + 1).min(caps.max_image_count)
        } else {
            caps.min_image_count + 1
        };

        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(self.format)
            .image_color_space(vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true)
            .old_swapchain(old);

        let handle = unsafe { self.loader.create_swapchain(&info, None)? };
        let images = unsafe { self.loader.get_swapchain_images(handle)? };

        let views = images
            .iter()
            .map(|&image| {
                let view_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(self.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                unsafe { dev.create_image_view(&view_info, None) }.map_err(RenderError::from)
            })
            .collect::<Result<Vec<_>>>()?;

        self.handle = handle;
        self.extent = extent;
        self.image_ages = vec![0; images.len()];
        self.images = images;
        self.views = views;
        Ok(())
    }

    /// Waits for device idle, tears down the old swapchain's image views,
    /// and rebuilds against the surface's current extent. Called on
    /// `OutOfDate`/`Suboptimal` (§4.8a).
    pub fn recreate(&mut self, dev: &ash::Device) -> Result<()> {
        unsafe { dev.device_wait_idle()? };

        let old = self.handle;
        for view in self.views.drain(..) {
            unsafe { dev.destroy_image_view(view, None) };
        }

        self.build(dev, old)?;

        unsafe { self.loader.destroy_swapchain(old, None) };
        Ok(())
    }

    /// Acquire the next presentable image. `OutOfDate`/`Suboptimal` surface
    /// as `RenderError::SwapchainOutOfDate` via `From<vk::Result>`.
    pub fn acquire_next_image(&mut self, semaphore: vk::Semaphore) -> Result<u32> {
        let (index, suboptimal) = unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, semaphore, vk::Fence::null())?
        };
        if suboptimal {
            return Err(RenderError::SwapchainOutOfDate);
        }
        Ok(index)
    }

    pub fn present(&mut self, queue: vk::Queue, wait_semaphores: &[vk::Semaphore], image_index: u32) -> Result<()> {
        let swapchains = [self.handle];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let suboptimal = unsafe { self.loader.queue_present(queue, &info)? };
        for age in self.image_ages.iter_mut() {
            *age += 1;
        }
        self.image_ages[image_index as usize] = 0;

        if suboptimal {
            return Err(RenderError::SwapchainOutOfDate);
        }
        Ok(())
    }

    pub unsafe fn destroy(&self, dev: &ash::Device) {
        for view in &self.views {
            dev.destroy_image_view(*view, None);
        }
        self.loader.destroy_swapchain(self.handle, None);
    }
}

/// One renderable view the frame loop drives each frame (a camera, in the
/// scene-graph client's terms -- this crate only sees the interface).
/// Implemented by the host; the core doesn't know what a camera is, only
/// how to sequence rendering into one.
pub trait RenderView {
    /// Higher values render first (§4.8 step 3).
    fn priority(&self) -> i32;
    /// Any CPU-side prep (culling, uniform upload) before recording.
    fn prepare(&mut self);
    /// Record this view's draws into `cmd`.
    fn record(&mut self, dev: &ash::Device, cmd: &mut CommandBuffer) -> Result<()>;
    /// The resolved color attachment to composite into the swapchain image
    /// when this view is the primary one (§4.8 step 4).
    fn resolved_color(&mut self) -> &mut Image;
    fn is_primary(&self) -> bool;
}

/// Per-frame synchronization primitives and the `frame_count`/recreate-flag
/// bookkeeping the acquire/submit/present sequence needs.
pub struct FrameLoop {
    pub frame_count: u64,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    needs_recreate: bool,
}

impl FrameLoop {
    pub fn new(dev: &ash::Device) -> Result<Self> {
        let sem_info = vk::SemaphoreCreateInfo::builder();
        let image_available = unsafe { dev.create_semaphore(&sem_info, None)? };
        let render_finished = unsafe { dev.create_semaphore(&sem_info, None)? };

        Ok(Self {
            frame_count: 0,
            image_available,
            render_finished,
            needs_recreate: false,
        })
    }

    pub fn needs_recreate(&self) -> bool {
        self.needs_recreate
    }

    /// Run one full iteration of §4.8's eight steps, given the views to
    /// render this frame in whatever order the caller collected them
    /// (sorted here by descending priority).
    pub fn run_frame(
        &mut self,
        dev: &ash::Device,
        queue: vk::Queue,
        swapchain: &mut Swapchain,
        pool: &ResourcePool,
        purge_age_frames: u64,
        views: &mut [Box<dyn RenderView>],
    ) -> Result<()> {
        if self.needs_recreate {
            swapchain.recreate(dev)?;
            self.needs_recreate = false;
        }

        let image_index = match swapchain.acquire_next_image(self.image_available) {
            Ok(i) => i,
            Err(RenderError::SwapchainOutOfDate) => {
                self.needs_recreate = true;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        views.sort_by_key(|v| std::cmp::Reverse(v.priority()));

        let mut cmd = pool.get_command_buffer(vk::CommandBufferLevel::PRIMARY)?;

        for view in views.iter_mut() {
            view.prepare();
            view.record(dev, &mut cmd)?;
        }

        if let Some(primary) = views.iter_mut().find(|v| v.is_primary()) {
            let color = primary.resolved_color();
            cmd.transition(dev, color, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);

            // The swapchain image itself isn't tracked as an `Image`, so
            // its transition is recorded directly rather than through
            // `CommandBuffer::transition`.
            let to_dst = vk::ImageMemoryBarrier::builder()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(swapchain.images[image_index as usize])
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .build();
            unsafe {
                dev.cmd_pipeline_barrier(
                    cmd.handle,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_dst],
                );
            }

            let region = vk::ImageCopy {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                src_offset: vk::Offset3D::default(),
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                dst_offset: vk::Offset3D::default(),
                extent: vk::Extent3D {
                    width: swapchain.extent.width,
                    height: swapchain.extent.height,
                    depth: 1,
                },
            };
            unsafe {
                dev.cmd_copy_image(
                    cmd.handle,
                    color.handle,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    swapchain.images[image_index as usize],
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }

            let to_present = vk::ImageMemoryBarrier::builder()
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(swapchain.images[image_index as usize])
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .build();
            unsafe {
                dev.cmd_pipeline_barrier(
                    cmd.handle,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_present],
                );
            }
        }

        cmd.add_wait_semaphore(self.image_available, vk::PipelineStageFlags::TRANSFER);
        cmd.add_signal_semaphore(self.render_finished);
        cmd.submit(dev, queue)?;
        pool.release_command_buffer(cmd);

        match swapchain.present(queue, &[self.render_finished], image_index) {
            Ok(()) => {}
            Err(RenderError::SwapchainOutOfDate) => self.needs_recreate = true,
            Err(e) => return Err(e),
        }

        pool.poll_command_buffers()?;
        pool.purge(purge_age_frames);
        pool.advance_frame();
        self.frame_count += 1;

        Ok(())
    }

    pub unsafe fn destroy(&self, dev: &ash::Device) {
        dev.destroy_semaphore(self.image_available, None);
        dev.destroy_semaphore(self.render_finished, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeView {
        priority: i32,
    }
    impl RenderView for FakeView {
        fn priority(&self) -> i32 {
            self.priority
        }
        fn prepare(&mut self) {}
        fn record(&mut self, _dev: &ash::Device, _cmd: &mut CommandBuffer) -> Result<()> {
            Ok(())
        }
        fn resolved_color(&mut self) -> &mut Image {
            unreachable!("not exercised by this test")
        }
        fn is_primary(&self) -> bool {
            false
        }
    }

    #[test]
    fn views_sort_by_descending_priority() {
        let mut views: Vec<Box<dyn RenderView>> = vec![
            Box::new(FakeView { priority: 1 }),
            Box::new(FakeView { priority: 5 }),
            Box::new(FakeView { priority: 3 }),
        ];
        views.sort_by_key(|v| std::cmp::Reverse(v.priority()));
        let priorities: Vec<i32> = views.iter().map(|v| v.priority()).collect();
        assert_eq!(priorities, vec![5, 3, 1]);
    }
}
