// Command recording & submission: per-thread command buffers that track
// bound pipeline state, pending resources, and image layouts, and submit
// with fence-based completion tracking (§4.7).
//
// Austin Shafer - 2020, adapted 2024
use ash::vk;
use smallvec::SmallVec;

use crate::buffer::Buffer;
use crate::descriptor::DescriptorSet;
use crate::error::Result;
use crate::image::{guess_stage_and_access, Image, ImageLayoutState};

/// `CommandBuffer.state`'s three positions (§4.7). `Recording` is where
/// draws/binds/transitions are appended; `Pending` is armed on a queue and
/// owns every resource it referenced until its fence signals; `Done` is
/// inferred by polling that fence and releases everything back to the
/// resource pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandBufferState {
    Recording,
    Pending,
    Done,
}

/// A resource a [`CommandBuffer`] references while recording, kept alive
/// (not returned to the resource pool) until the buffer transitions to
/// `Done`. Holds the resource by value -- these are the same POD-ish
/// handles `ResourcePool::get_buffer`/`get_image`/`get_descriptor_set`
/// hand out, so tracking one is a cheap move, not a deep copy.
pub enum TrackedResource {
    Buffer(Buffer),
    Image(Image),
    DescriptorSet(DescriptorSet),
}

/// Everything a bound pipeline's reflection data gives `push_constant` and
/// `dispatch_aligned` to work with, captured at `bind_pipeline` time so the
/// command buffer doesn't need to reach back into the `Shader`/`Pipeline`
/// cache mid-recording.
#[derive(Clone)]
pub struct BoundPipelineInfo {
    pub handle: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
    pub push_constants: Vec<crate::shader::PushConstantRange>,
    /// `(0, 0, 0)` for graphics pipelines.
    pub workgroup_size: [u32; 3],
}

impl PartialEq for BoundPipelineInfo {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

const MAX_BOUND_SETS: usize = 4;

#[derive(Default)]
struct BindPointState {
    pipeline: Option<BoundPipelineInfo>,
    descriptor_sets: SmallVec<[Option<vk::DescriptorSet>; MAX_BOUND_SETS]>,
}

impl BindPointState {
    fn descriptor_at(&self, index: u32) -> Option<vk::DescriptorSet> {
        self.descriptor_sets.get(index as usize).copied().flatten()
    }

    fn set_descriptor_at(&mut self, index: u32, set: vk::DescriptorSet) {
        let idx = index as usize;
        if self.descriptor_sets.len() <= idx {
            self.descriptor_sets.resize(idx + 1, None);
        }
        self.descriptor_sets[idx] = Some(set);
    }

    fn clear(&mut self) {
        self.pipeline = None;
        self.descriptor_sets.clear();
    }
}

/// One `VkCommandBuffer` plus the recording-time bookkeeping described in
/// the data model: bound pipeline/descriptor-set/vertex-buffer state,
/// in-flight resource ownership, and the fence that drives its own
/// `Pending -> Done` transition.
pub struct CommandBuffer {
    pub handle: vk::CommandBuffer,
    pub pool: vk::CommandPool,
    pub signal_fence: vk::Fence,
    pub state: CommandBufferState,
    pending_resources: Vec<TrackedResource>,
    wait_semaphores: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
    signal_semaphores: Vec<vk::Semaphore>,
    graphics: BindPointState,
    compute: BindPointState,
    bound_vertex_buffers: SmallVec<[(vk::Buffer, u64); 4]>,
    bound_index_buffer: Option<(vk::Buffer, u64, vk::IndexType)>,
    current_render_pass: Option<vk::RenderPass>,
    current_subpass_index: u32,
    current_framebuffer: Option<vk::Framebuffer>,
}

impl CommandBuffer {
    /// Allocate a brand-new command buffer from `pool` and begin recording
    /// immediately -- the state machine has no separate "allocated but not
    /// recording" state (§4.7).
    pub fn allocate(dev: &ash::Device, pool: vk::CommandPool, level: vk::CommandBufferLevel) -> Result<Self> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);
        let handle = unsafe { dev.allocate_command_buffers(&alloc_info)?[0] };

        let fence_info = vk::FenceCreateInfo::builder();
        let signal_fence = unsafe { dev.create_fence(&fence_info, None)? };

        let mut cb = Self {
            handle,
            pool,
            signal_fence,
            state: CommandBufferState::Done, // about to be begun by begin_recording()
            pending_resources: Vec::new(),
            wait_semaphores: Vec::new(),
            signal_semaphores: Vec::new(),
            graphics: BindPointState::default(),
            compute: BindPointState::default(),
            bound_vertex_buffers: SmallVec::new(),
            bound_index_buffer: None,
            current_render_pass: None,
            current_subpass_index: 0,
            current_framebuffer: None,
        };
        cb.begin_recording(dev)?;
        Ok(cb)
    }

    fn begin_recording(&mut self, dev: &ash::Device) -> Result<()> {
        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { dev.begin_command_buffer(self.handle, &begin_info)? };
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    /// Clears every piece of tracked/bound state (semaphores, pending
    /// resources, bind-point caches, vertex/index bindings, render pass)
    /// without touching the underlying `VkCommandBuffer` or its fence.
    /// Shared by `reset()` (re-begin for new recording) and `poll()`
    /// (`Pending -> Done`), since §4.7 has "all command-buffer tracked
    /// state is cleared" happen on both transitions.
    fn clear_tracked_state(&mut self) {
        self.pending_resources.clear();
        self.wait_semaphores.clear();
        self.signal_semaphores.clear();
        self.graphics.clear();
        self.compute.clear();
        self.bound_vertex_buffers.clear();
        self.bound_index_buffer = None;
        self.current_render_pass = None;
        self.current_subpass_index = 0;
        self.current_framebuffer = None;
    }

    /// `Done -> Recording`: re-begin this buffer with `ONE_TIME_SUBMIT`,
    /// clearing all previously tracked/bound state.
    pub fn reset(&mut self, dev: &ash::Device) -> Result<()> {
        unsafe { dev.reset_command_buffer(self.handle, vk::CommandBufferResetFlags::empty())? };
        self.clear_tracked_state();
        unsafe { dev.reset_fences(&[self.signal_fence])? };
        self.begin_recording(dev)
    }

    pub fn begin_render_pass(
        &mut self,
        dev: &ash::Device,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
        contents: vk::SubpassContents,
    ) {
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(clear_values);
        unsafe { dev.cmd_begin_render_pass(self.handle, &info, contents) };
        self.current_render_pass = Some(render_pass);
        self.current_framebuffer = Some(framebuffer);
        self.current_subpass_index = 0;
    }

    pub fn next_subpass(&mut self, dev: &ash::Device, contents: vk::SubpassContents) {
        unsafe { dev.cmd_next_subpass(self.handle, contents) };
        self.current_subpass_index += 1;
    }

    pub fn end_render_pass(&mut self, dev: &ash::Device) {
        unsafe { dev.cmd_end_render_pass(self.handle) };
        self.current_render_pass = None;
        self.current_framebuffer = None;
        self.current_subpass_index = 0;
    }

    fn bind_point_state_mut(&mut self, bind_point: vk::PipelineBindPoint) -> &mut BindPointState {
        match bind_point {
            vk::PipelineBindPoint::COMPUTE => &mut self.compute,
            _ => &mut self.graphics,
        }
    }

    /// Idempotent on equal handles. Binding a graphics pipeline while a
    /// compute one is bound (or vice versa) clears the *other* bind
    /// point's cached descriptor-set state, so subsequent
    /// `bind_descriptor_set` calls target the newly active bind point
    /// rather than stale bookkeeping from the previous one.
    pub fn bind_pipeline(&mut self, dev: &ash::Device, info: BoundPipelineInfo) {
        let already_bound = match info.bind_point {
            vk::PipelineBindPoint::COMPUTE => self.compute.pipeline.as_ref() == Some(&info),
            _ => self.graphics.pipeline.as_ref() == Some(&info),
        };

        match info.bind_point {
            vk::PipelineBindPoint::COMPUTE => self.graphics.clear(),
            _ => self.compute.clear(),
        }

        if already_bound {
            return;
        }

        unsafe { dev.cmd_bind_pipeline(self.handle, info.bind_point, info.handle) };
        let state = self.bind_point_state_mut(info.bind_point);
        state.pipeline = Some(info);
    }

    /// Flushes `set` then binds it; a no-op if `set.handle` is already the
    /// one tracked at `index` for the active bind point (§4.7's fix over
    /// the allocator this design evolves from, which always re-flushed
    /// and re-bound regardless of redundancy).
    pub fn bind_descriptor_set(&mut self, dev: &ash::Device, index: u32, set: &mut DescriptorSet) {
        let bind_point = self
            .compute
            .pipeline
            .as_ref()
            .map(|_| vk::PipelineBindPoint::COMPUTE)
            .unwrap_or(vk::PipelineBindPoint::GRAPHICS);

        let layout = match bind_point {
            vk::PipelineBindPoint::COMPUTE => self.compute.pipeline.as_ref().map(|p| p.layout),
            _ => self.graphics.pipeline.as_ref().map(|p| p.layout),
        };
        let layout = match layout {
            Some(l) => l,
            None => {
                log::warn!("bind_descriptor_set called with no pipeline bound");
                return;
            }
        };

        if self.bind_point_state_mut(bind_point).descriptor_at(index) == Some(set.handle) {
            return;
        }

        set.flush(dev);

        let sets = [set.handle];
        unsafe {
            dev.cmd_bind_descriptor_sets(self.handle, bind_point, layout, index, &sets, &[]);
        }
        self.bind_point_state_mut(bind_point)
            .set_descriptor_at(index, set.handle);
    }

    pub fn bind_vertex_buffer(&mut self, dev: &ash::Device, index: u32, buffer: vk::Buffer, offset: u64) {
        let idx = index as usize;
        if self.bound_vertex_buffers.len() <= idx {
            self.bound_vertex_buffers
                .resize(idx + 1, (vk::Buffer::null(), 0));
        }
        if self.bound_vertex_buffers[idx] == (buffer, offset) {
            return;
        }
        unsafe { dev.cmd_bind_vertex_buffers(self.handle, index, &[buffer], &[offset]) };
        self.bound_vertex_buffers[idx] = (buffer, offset);
    }

    pub fn bind_index_buffer(
        &mut self,
        dev: &ash::Device,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    ) {
        if self.bound_index_buffer == Some((buffer, offset, index_type)) {
            return;
        }
        unsafe { dev.cmd_bind_index_buffer(self.handle, buffer, offset, index_type) };
        self.bound_index_buffer = Some((buffer, offset, index_type));
    }

    /// Resolve `name` against the bound pipeline's reflected push-constant
    /// ranges and push `data`, clamped to the declared range's size.
    /// Returns `false` (and logs) on an unknown name or no bound
    /// pipeline -- a recording-time error, not a fatal one (§7).
    pub fn push_constant(&mut self, dev: &ash::Device, name: &str, data: &[u8]) -> bool {
        let active = self
            .compute
            .pipeline
            .as_ref()
            .or(self.graphics.pipeline.as_ref());
        let info = match active {
            Some(i) => i,
            None => {
                log::warn!("push_constant({}) called with no pipeline bound", name);
                return false;
            }
        };

        let range = match info.push_constants.iter().find(|r| r.name == name) {
            Some(r) => r,
            None => {
                log::warn!("push_constant: unknown range '{}'", name);
                return false;
            }
        };

        let size = data.len().min(range.size as usize);
        unsafe {
            dev.cmd_push_constants(
                self.handle,
                info.layout,
                range.stage_mask,
                range.offset,
                &data[..size],
            );
        }
        true
    }

    pub fn draw(&self, dev: &ash::Device, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            dev.cmd_draw(self.handle, vertex_count, instance_count, first_vertex, first_instance);
        }
    }

    pub fn draw_indexed(
        &self,
        dev: &ash::Device,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            dev.cmd_draw_indexed(
                self.handle,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    pub fn dispatch(&self, dev: &ash::Device, x: u32, y: u32, z: u32) {
        unsafe { dev.cmd_dispatch(self.handle, x, y, z) };
    }

    /// Divides `(x, y, z)` by the bound compute variant's workgroup size
    /// (ceiling division) before dispatching.
    pub fn dispatch_aligned(&self, dev: &ash::Device, x: u32, y: u32, z: u32) {
        let wg = self
            .compute
            .pipeline
            .as_ref()
            .map(|p| p.workgroup_size)
            .unwrap_or([1, 1, 1]);
        let groups = |v: u32, w: u32| if w == 0 { v } else { (v + w - 1) / w };
        self.dispatch(dev, groups(x, wg[0].max(1)), groups(y, wg[1].max(1)), groups(z, wg[2].max(1)));
    }

    /// Transition `image` to `new_layout`, deriving both src and dst
    /// stage/access from the layout->(stage, access) table (§6).
    pub fn transition(&mut self, dev: &ash::Device, image: &mut Image, new_layout: vk::ImageLayout) {
        let (src_stage, _) = guess_stage_and_access(image.last_known.layout);
        let (dst_stage, _) = guess_stage_and_access(new_layout);
        self.transition_with_stages(dev, image, src_stage, dst_stage, image.last_known.layout, new_layout);
    }

    /// As [`transition`], but with explicit src/dst pipeline stages
    /// (access masks are still derived from `old`/`new` via the table).
    /// Emits a barrier only when `old != new`; a transition to
    /// `Undefined` resets the image's last-known-* fields without
    /// emitting one.
    pub fn transition_with_stages(
        &mut self,
        dev: &ash::Device,
        image: &mut Image,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) {
        if new == vk::ImageLayout::UNDEFINED {
            image.last_known = ImageLayoutState::undefined();
            return;
        }
        if old == new {
            return;
        }

        let (_, src_access) = guess_stage_and_access(old);
        let (_, dst_access) = guess_stage_and_access(new);

        let aspect_mask = if new == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            || new == vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old)
            .new_layout(new)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.handle)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: image.mip_levels,
                base_array_layer: 0,
                layer_count: image.array_layers,
            })
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .build();

        unsafe {
            dev.cmd_pipeline_barrier(
                self.handle,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }

        image.last_known = ImageLayoutState {
            layout: new,
            stage: dst_stage,
            access: dst_access,
        };
    }

    /// Add `resource` to this buffer's pending list; it is kept alive
    /// (not returned to the resource pool) until this buffer reaches
    /// `Done`.
    pub fn track(&mut self, resource: TrackedResource) {
        self.pending_resources.push(resource);
    }

    pub fn add_wait_semaphore(&mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) {
        self.wait_semaphores.push((semaphore, stage));
    }

    pub fn add_signal_semaphore(&mut self, semaphore: vk::Semaphore) {
        self.signal_semaphores.push(semaphore);
    }

    /// `Recording -> Pending`: ends recording, resets and arms the fence,
    /// and submits to `queue`. Pending resources are not released here --
    /// they stay tracked until this buffer is observed `Done`.
    pub fn submit(&mut self, dev: &ash::Device, queue: vk::Queue) -> Result<()> {
        unsafe { dev.end_command_buffer(self.handle)? };

        let wait_semaphores: Vec<vk::Semaphore> = self.wait_semaphores.iter().map(|(s, _)| *s).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = self.wait_semaphores.iter().map(|(_, s)| *s).collect();
        let cbufs = [self.handle];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&cbufs)
            .signal_semaphores(&self.signal_semaphores)
            .build();

        unsafe {
            dev.reset_fences(&[self.signal_fence])?;
            dev.queue_submit(queue, &[submit_info], self.signal_fence)?;
        }
        self.state = CommandBufferState::Pending;
        Ok(())
    }

    /// Poll the fence without blocking. On observing a fresh
    /// `Pending -> Done` transition, drains and returns the tracked
    /// resources so the caller (the resource pool) can release them,
    /// tagged with the current frame index.
    pub fn poll(&mut self, dev: &ash::Device) -> Result<Option<Vec<TrackedResource>>> {
        if self.state != CommandBufferState::Pending {
            return Ok(None);
        }
        let signaled = unsafe { dev.get_fence_status(self.signal_fence)? };
        if !signaled {
            return Ok(None);
        }
        self.state = CommandBufferState::Done;
        let resources = std::mem::take(&mut self.pending_resources);
        self.clear_tracked_state();
        Ok(Some(resources))
    }

    /// Block until this buffer's fence signals (bounded suspension point,
    /// §5). Fence-wait timeouts are fatal per §7.
    pub fn wait(&self, dev: &ash::Device) -> Result<()> {
        unsafe {
            dev.wait_for_fences(&[self.signal_fence], true, u64::MAX)?;
        }
        Ok(())
    }

    /// Destroy this command buffer's fence and free its handle back to
    /// its pool. Destroying a buffer in `Pending` is caller error; we log
    /// a warning and still wait for the fence before tearing down, so we
    /// never free a buffer the GPU might still be executing.
    pub unsafe fn destroy(&self, dev: &ash::Device) {
        if self.state == CommandBufferState::Pending {
            log::warn!("destroying a command buffer while its fence is still pending");
            let _ = dev.wait_for_fences(&[self.signal_fence], true, u64::MAX);
        }
        dev.destroy_fence(self.signal_fence, None);
        dev.free_command_buffers(self.pool, &[self.handle]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pc_range(name: &str, size: u32) -> crate::shader::PushConstantRange {
        crate::shader::PushConstantRange {
            name: name.to_string(),
            stage_mask: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size,
        }
    }

    #[test]
    fn bind_point_state_tracks_descriptor_sets_by_index() {
        let mut state = BindPointState::default();
        assert_eq!(state.descriptor_at(0), None);
        let set = vk::DescriptorSet::from_raw(7);
        state.set_descriptor_at(2, set);
        assert_eq!(state.descriptor_at(2), Some(set));
        assert_eq!(state.descriptor_at(0), None);
    }

    #[test]
    fn bound_pipeline_info_equality_is_by_handle() {
        let a = BoundPipelineInfo {
            handle: vk::Pipeline::from_raw(1),
            layout: vk::PipelineLayout::null(),
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            push_constants: vec![pc_range("pc", 16)],
            workgroup_size: [0, 0, 0],
        };
        let b = BoundPipelineInfo {
            handle: vk::Pipeline::from_raw(1),
            layout: vk::PipelineLayout::null(),
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            push_constants: vec![],
            workgroup_size: [0, 0, 0],
        };
        assert_eq!(a, b, "equality is handle-only so rebind checks stay cheap");
    }

    #[test]
    fn dispatch_aligned_ceil_divides_by_workgroup_size() {
        let groups = |v: u32, w: u32| if w == 0 { v } else { (v + w - 1) / w };
        assert_eq!(groups(64, 8), 8);
        assert_eq!(groups(65, 8), 9);
        assert_eq!(groups(1, 8), 1);
    }

    // Callers push constants the way the geometry this crate evolved from
    // did: a `repr(C)` struct carrying a `cgmath` matrix, reinterpreted as
    // bytes. `push_constant` itself only sees `&[u8]` and clamps to the
    // declared range's size, so an over-sized struct is truncated rather
    // than rejected.
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct ModelConstants {
        model: cgmath::Matrix4<f32>,
        width: f32,
        height: f32,
    }

    #[test]
    fn push_constant_clamps_to_declared_range_size() {
        let constants = ModelConstants {
            model: cgmath::Matrix4::from_scale(1.0),
            width: 1920.0,
            height: 1080.0,
        };
        let bytes: &[u8] = unsafe {
            std::slice::from_raw_parts(
                &constants as *const ModelConstants as *const u8,
                std::mem::size_of::<ModelConstants>(),
            )
        };

        let range = pc_range("model", 64); // only the Matrix4, not width/height
        let size = bytes.len().min(range.size as usize);
        assert_eq!(size, 64);
        assert!(bytes.len() > size, "the full struct is larger than the declared range");
    }
}
