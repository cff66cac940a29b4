// Pipeline cache: lazily constructs and caches `VkPipeline` objects keyed
// by (shader variant identity, render-pass/subpass/vertex-input/dynamic
// state), persisting the driver's opaque pipeline-cache blob across runs.
//
// Austin Shafer - 2021, adapted 2024
use std::path::Path;

use ash::vk;
use ash::vk::Handle;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::shader::{ComputeVariant, FixedPipelineState, ShaderVariant};

/// Blend-mode semantics baked at shader-package time (§4.5), overridable
/// per draw via [`GraphicsPipelineRequest::blend_mode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Opaque,
    Alpha,
    Additive,
    Multiply,
}

impl BlendMode {
    pub fn attachment_state(&self) -> vk::PipelineColorBlendAttachmentState {
        let base = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA);

        match self {
            BlendMode::Opaque => base
                .blend_enable(false)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ZERO)
                .build(),
            BlendMode::Alpha => base
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
                .build(),
            BlendMode::Additive => base
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ONE)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
                .build(),
            BlendMode::Multiply => base
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ONE)
                .color_blend_op(vk::BlendOp::MULTIPLY_EXT)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
                .build(),
        }
    }
}

/// Vertex input layout for a draw, hashed into `vertex_input_signature`.
#[derive(Clone, Debug)]
pub struct VertexInputDesc {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
    /// Caller-computed signature (e.g. a hash of bindings+attributes);
    /// kept separate from the descriptions themselves since the key only
    /// needs to be `Hash`/`Eq`, not the full `vk` structs.
    pub signature: u64,
}

/// Identity a `VkPipeline` is cached under. Graphics pipelines additionally
/// carry every piece of per-instance dynamic state the variant's fixed
/// state doesn't already bake in; compute pipelines have none beyond the
/// variant itself (§3 data model).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum PipelineInstanceKey {
    Graphics {
        /// Pointer identity of the owning `ShaderVariant`. Variants are
        /// stored by value in a `Shader`'s variant vec that is never
        /// resized after `load_shader_package` returns, so this address
        /// is stable for the variant's lifetime.
        variant_id: usize,
        render_pass: u64,
        subpass_index: u32,
        vertex_input_signature: u64,
        primitive_topology: i32,
        cull_mode: u32,
        blend_mode: BlendMode,
        polygon_mode: i32,
    },
    Compute {
        variant_id: usize,
    },
}

/// Concrete GPU pipeline plus the layout it was built against.
pub struct Pipeline {
    pub handle: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
}

/// Everything `get_pipeline` needs to build a graphics pipeline on a cache
/// miss: the variant's fixed state merged with per-instance dynamic state.
pub struct GraphicsPipelineRequest<'a> {
    pub variant: &'a ShaderVariant,
    pub fixed_state: &'a FixedPipelineState,
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub subpass_index: u32,
    pub vertex_input: &'a VertexInputDesc,
    pub primitive_topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub blend_mode: BlendMode,
    pub polygon_mode: vk::PolygonMode,
}

struct CacheState {
    pipelines: FxHashMap<PipelineInstanceKey, Pipeline>,
}

/// Device-global cache of constructed `VkPipeline` objects (§3: owned
/// exclusively by the `Device`, never per-shader or process-global),
/// backed by the driver's own opaque `VkPipelineCache` blob so repeated
/// runs skip redundant shader recompilation in the driver.
pub struct PipelineCache {
    vk_cache: vk::PipelineCache,
    state: RwLock<CacheState>,
}

impl PipelineCache {
    /// Load `path`'s blob if present (a missing/unreadable file is not an
    /// error -- the driver just compiles from scratch) and create the
    /// backing `VkPipelineCache`.
    pub fn new(dev: &ash::Device, path: &Path) -> Result<Self> {
        let initial_data = std::fs::read(path).unwrap_or_default();

        let create_info = vk::PipelineCacheCreateInfo::builder().initial_data(&initial_data);
        let vk_cache = unsafe { dev.create_pipeline_cache(&create_info, None)? };

        Ok(Self {
            vk_cache,
            state: RwLock::new(CacheState {
                pipelines: FxHashMap::default(),
            }),
        })
    }

    /// Persist the driver's opaque cache blob to `path`. Called at `Device`
    /// shutdown; a failure to write is logged, not fatal.
    pub fn save(&self, dev: &ash::Device, path: &Path) {
        let data = match unsafe { dev.get_pipeline_cache_data(self.vk_cache) } {
            Ok(d) => d,
            Err(e) => {
                log::warn!("failed to read back pipeline cache data: {:?}", e);
                return;
            }
        };
        if let Err(e) = std::fs::write(path, data) {
            log::warn!("failed to write pipeline cache to {}: {}", path.display(), e);
        }
    }

    fn build_graphics(dev: &ash::Device, vk_cache: vk::PipelineCache, req: &GraphicsPipelineRequest) -> Result<Pipeline> {
        let stage_entry = std::ffi::CString::new("main").unwrap();
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = req
            .variant
            .modules
            .iter()
            .map(|m| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(m.stage)
                    .module(m.module)
                    .name(&stage_entry)
                    .build()
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&req.vertex_input.bindings)
            .vertex_attribute_descriptions(&req.vertex_input.attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(req.primitive_topology);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(req.polygon_mode)
            .cull_mode(req.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(req.fixed_state.depth_test_enable)
            .depth_write_enable(req.fixed_state.depth_write_enable)
            .depth_compare_op(req.fixed_state.depth_compare_op);

        let blend_attachment = req.blend_mode.attachment_state();
        let blend_attachments = [blend_attachment];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .attachments(&blend_attachments);

        // Dynamic states always enabled per §4.5.
        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::LINE_WIDTH,
        ];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(req.layout)
            .render_pass(req.render_pass)
            .subpass(req.subpass_index)
            .build();

        let handle = unsafe {
            dev.create_graphics_pipelines(vk_cache, &[create_info], None)
                .map_err(|(_, res)| crate::error::RenderError::PipelineCreateError(res))?[0]
        };

        Ok(Pipeline {
            handle,
            layout: req.layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        })
    }

    fn build_compute(
        dev: &ash::Device,
        vk_cache: vk::PipelineCache,
        variant: &ComputeVariant,
        layout: vk::PipelineLayout,
    ) -> Result<Pipeline> {
        let entry = std::ffi::CString::new(variant.entry_point.as_str())
            .unwrap_or_else(|_| std::ffi::CString::new("main").unwrap());
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(variant.module.module)
            .name(&entry)
            .build();

        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout)
            .build();

        let handle = unsafe {
            dev.create_compute_pipelines(vk_cache, &[create_info], None)
                .map_err(|(_, res)| crate::error::RenderError::PipelineCreateError(res))?[0]
        };

        Ok(Pipeline {
            handle,
            layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
        })
    }

    /// Get (or lazily construct) the graphics pipeline for `req`. A hit is
    /// a single hash-map lookup; a miss builds the full create-info from
    /// the variant's fixed state merged with `req`'s per-instance dynamic
    /// state, inserts, and returns.
    pub fn get_graphics_pipeline(
        &self,
        dev: &ash::Device,
        req: &GraphicsPipelineRequest,
    ) -> Result<vk::Pipeline> {
        let key = PipelineInstanceKey::Graphics {
            variant_id: req.variant as *const ShaderVariant as usize,
            render_pass: req.render_pass.as_raw(),
            subpass_index: req.subpass_index,
            vertex_input_signature: req.vertex_input.signature,
            primitive_topology: req.primitive_topology.as_raw(),
            cull_mode: req.cull_mode.as_raw(),
            blend_mode: req.blend_mode,
            polygon_mode: req.polygon_mode.as_raw(),
        };

        if let Some(p) = self.state.read().pipelines.get(&key) {
            return Ok(p.handle);
        }

        let pipeline = Self::build_graphics(dev, self.vk_cache, req)?;
        let handle = pipeline.handle;
        self.state.write().pipelines.insert(key, pipeline);
        Ok(handle)
    }

    /// Get (or lazily construct) the compute pipeline for `variant`, keyed
    /// solely by the variant's identity (§3: compute instance keys carry
    /// no additional per-instance dynamic state).
    pub fn get_compute_pipeline(
        &self,
        dev: &ash::Device,
        variant: &ComputeVariant,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let key = PipelineInstanceKey::Compute {
            variant_id: variant as *const ComputeVariant as usize,
        };

        if let Some(p) = self.state.read().pipelines.get(&key) {
            return Ok(p.handle);
        }

        let pipeline = Self::build_compute(dev, self.vk_cache, variant, layout)?;
        let handle = pipeline.handle;
        self.state.write().pipelines.insert(key, pipeline);
        Ok(handle)
    }

    pub unsafe fn destroy(&self, dev: &ash::Device) {
        let state = self.state.read();
        for p in state.pipelines.values() {
            dev.destroy_pipeline(p.handle, None);
        }
        dev.destroy_pipeline_cache(self.vk_cache, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blend_mode_opaque_matches_spec() {
        let state = BlendMode::Opaque.attachment_state();
        assert_eq!(state.blend_enable, vk::FALSE);
        assert_eq!(state.src_color_blend_factor, vk::BlendFactor::ONE);
        assert_eq!(state.dst_color_blend_factor, vk::BlendFactor::ZERO);
    }

    #[test]
    fn blend_mode_alpha_matches_spec() {
        let state = BlendMode::Alpha.attachment_state();
        assert_eq!(state.blend_enable, vk::TRUE);
        assert_eq!(state.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(state.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
    }

    #[test]
    fn blend_mode_multiply_matches_spec() {
        let state = BlendMode::Multiply.attachment_state();
        assert_eq!(state.blend_enable, vk::TRUE);
        assert_eq!(state.color_blend_op, vk::BlendOp::MULTIPLY_EXT);
    }

    // Two instance keys built from the same fields must hash/compare
    // equal so that `get_pipeline` hits return the same handle (§8).
    #[test]
    fn instance_key_equality_is_structural() {
        let a = PipelineInstanceKey::Compute { variant_id: 42 };
        let b = PipelineInstanceKey::Compute { variant_id: 42 };
        assert_eq!(a, b);
        let c = PipelineInstanceKey::Compute { variant_id: 43 };
        assert_ne!(a, c);
    }

    // A concrete vertex type a caller would bind, laid out the way the
    // geometry this crate evolved from does (a `Vector2` position/texcoord
    // pair): `memoffset::offset_of!` gives the attribute offsets a
    // `VertexInputDesc` needs without hand-counting struct layout.
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct Vertex {
        pos: cgmath::Vector2<f32>,
        tex: cgmath::Vector2<f32>,
    }

    #[test]
    fn vertex_input_desc_from_concrete_vertex_layout() {
        let bindings = vec![vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()];
        let attributes = vec![
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(memoffset::offset_of!(Vertex, pos) as u32)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(memoffset::offset_of!(Vertex, tex) as u32)
                .build(),
        ];

        let desc = VertexInputDesc {
            bindings,
            attributes,
            signature: 1,
        };

        assert_eq!(desc.attributes[0].offset, 0);
        assert_eq!(desc.attributes[1].offset, memoffset::offset_of!(Vertex, tex) as u32);
    }
}
