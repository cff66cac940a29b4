// Shader packages: compiled module blobs plus the variant table that maps
// (render pass, keyword set) or (entry point, keyword set) to a concrete
// set of shader stages and reflected bindings.
//
// Austin Shafer - 2021, adapted 2024
pub mod package;
pub mod reflection;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use ash::vk;
use rayon::prelude::*;

pub use reflection::{BindingReflection, PushConstantRange};

use crate::error::{RenderError, Result};
use crate::pipeline::BlendMode;
use package::{DepthStencilState, ShaderPackage, VariantRecord};

/// A single compiled `VkShaderModule`, owned by the [`Shader`] that created
/// it and destroyed alongside it.
pub struct ShaderModule {
    pub module: vk::ShaderModule,
    pub stage: vk::ShaderStageFlags,
}

fn stage_from_raw(stage: u32) -> vk::ShaderStageFlags {
    vk::ShaderStageFlags::from_raw(stage)
}

fn descriptor_type_from_raw(ty: u32) -> vk::DescriptorType {
    vk::DescriptorType::from_raw(ty as i32)
}

fn bindings_from_records(records: &[package::BindingRecord]) -> Vec<BindingReflection> {
    records
        .iter()
        .map(|b| BindingReflection {
            name: b.name.clone(),
            set: b.set,
            binding: b.binding,
            descriptor_type: descriptor_type_from_raw(b.descriptor_type),
            array_size: b.count,
            stage_mask: stage_from_raw(b.stage_mask),
        })
        .collect()
}

fn push_ranges_from_records(records: &[package::PushRangeRecord]) -> Vec<PushConstantRange> {
    records
        .iter()
        .map(|p| PushConstantRange {
            name: p.name.clone(),
            stage_mask: stage_from_raw(p.stage_mask),
            offset: p.offset,
            size: p.size,
        })
        .collect()
}

fn blend_mode_from_raw(raw: u32) -> BlendMode {
    match raw {
        1 => BlendMode::Alpha,
        2 => BlendMode::Additive,
        3 => BlendMode::Multiply,
        _ => BlendMode::Opaque,
    }
}

/// Fixed pipeline state shared by every variant in a package (§4.5): the
/// package format stores one of these per file, not per variant.
#[derive(Clone, Copy, Debug)]
pub struct FixedPipelineState {
    pub render_queue: u32,
    pub color_mask: vk::ColorComponentFlags,
    pub cull_mode: vk::CullModeFlags,
    pub fill_mode: vk::PolygonMode,
    pub blend_mode: BlendMode,
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: vk::CompareOp,
}

impl FixedPipelineState {
    fn from_package(render_queue: u32, color_mask: u32, cull_mode: u32, fill_mode: u32, blend_mode: u32, ds: &DepthStencilState) -> Self {
        Self {
            render_queue,
            color_mask: vk::ColorComponentFlags::from_raw(color_mask),
            cull_mode: vk::CullModeFlags::from_raw(cull_mode),
            fill_mode: vk::PolygonMode::from_raw(fill_mode as i32),
            blend_mode: blend_mode_from_raw(blend_mode),
            depth_test_enable: ds.depth_test_enable != 0,
            depth_write_enable: ds.depth_write_enable != 0,
            depth_compare_op: vk::CompareOp::from_raw(ds.depth_compare_op as i32),
        }
    }
}

/// One `(shader_pass, keyword_set)` specialization of a graphics shader.
pub struct ShaderVariant {
    pub pass: u8,
    /// Canonicalized (intersected, sorted, joined) keyword key this variant
    /// was registered under.
    pub key: String,
    pub entry_points: Vec<String>,
    pub modules: Vec<Arc<ShaderModule>>,
    pub bindings: Vec<BindingReflection>,
    pub push_constants: Vec<PushConstantRange>,
    pub static_samplers: Vec<vk::Sampler>,
}

/// One `(entry_point, keyword_set)` specialization of a compute shader.
pub struct ComputeVariant {
    pub key: String,
    pub entry_point: String,
    pub module: Arc<ShaderModule>,
    pub bindings: Vec<BindingReflection>,
    pub push_constants: Vec<PushConstantRange>,
    pub workgroup_size: [u32; 3],
}

fn canonical_key(requested: &[String], declared: &BTreeSet<String>) -> String {
    let mut intersected: Vec<&str> = requested
        .iter()
        .map(|s| s.as_str())
        .filter(|k| declared.contains(*k))
        .collect();
    intersected.sort_unstable();
    intersected.dedup();
    intersected.join("+")
}

/// A named collection of graphics and compute variants loaded from a single
/// `.stmb` package. Owns every `VkShaderModule` the variants reference.
pub struct Shader {
    modules: Vec<Arc<ShaderModule>>,
    declared_keywords: BTreeSet<String>,
    graphics_variants: Vec<ShaderVariant>,
    compute_variants: Vec<ComputeVariant>,
    pub fixed_state: FixedPipelineState,
}

impl Shader {
    /// Read a compiled shader package from `path`, compile its modules in
    /// parallel across `hardware_threads - 1` workers, and build the
    /// variant table (§4.4).
    pub fn load_shader_package(dev: &ash::Device, path: &Path) -> Result<Self> {
        let package = ShaderPackage::read_from_path(path)?;
        Self::from_package(dev, &package)
    }

    pub fn from_package(dev: &ash::Device, package: &ShaderPackage) -> Result<Self> {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(1);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_count)
            .build()
            .map_err(|e| RenderError::ShaderLoadError(format!("failed to build compile pool: {}", e)))?;

        // SAFETY: `vkCreateShaderModule` is safe to call concurrently from
        // multiple threads against the same VkDevice per the Vulkan spec's
        // external synchronization rules (it only externally synchronizes
        // the VkShaderModule it creates, not the device).
        let modules: Result<Vec<vk::ShaderModule>> = pool.install(|| {
            package
                .modules
                .par_iter()
                .map(|blob| {
                    let code = bytes_to_u32(&blob.bytecode);
                    let info = vk::ShaderModuleCreateInfo::builder().code(&code);
                    unsafe { dev.create_shader_module(&info, None) }
                        .map_err(RenderError::from)
                })
                .collect()
        });
        let raw_modules = modules?;

        let modules: Vec<Arc<ShaderModule>> = raw_modules
            .into_iter()
            .zip(package.modules.iter())
            .map(|(module, blob)| {
                Arc::new(ShaderModule {
                    module,
                    stage: stage_from_raw(blob.stage),
                })
            })
            .collect();

        let mut declared_keywords = BTreeSet::new();
        for v in &package.variants {
            for k in &v.keywords {
                declared_keywords.insert(k.clone());
            }
        }

        let mut graphics_variants = Vec::new();
        let mut compute_variants = Vec::new();

        for v in &package.variants {
            let key = canonical_key(&v.keywords, &declared_keywords);
            let variant_modules: Vec<Arc<ShaderModule>> = v
                .module_indices
                .iter()
                .map(|&idx| modules[idx as usize].clone())
                .collect();
            let bindings = bindings_from_records(&v.bindings);
            let push_constants = push_ranges_from_records(&v.push_ranges);

            if v.pass == 0 {
                let module = variant_modules.into_iter().next().ok_or_else(|| {
                    RenderError::ShaderLoadError("compute variant has no module".to_string())
                })?;
                compute_variants.push(ComputeVariant {
                    key,
                    entry_point: v
                        .entry_points
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "main".to_string()),
                    module,
                    bindings,
                    push_constants,
                    workgroup_size: v.workgroup_size,
                });
            } else {
                graphics_variants.push(build_graphics_variant(v, key, variant_modules, bindings, push_constants));
            }
        }

        let fixed_state = FixedPipelineState::from_package(
            package.render_queue,
            package.color_mask,
            package.cull_mode,
            package.fill_mode,
            package.blend_mode,
            &package.depth_stencil,
        );

        Ok(Self {
            modules,
            declared_keywords,
            graphics_variants,
            compute_variants,
            fixed_state,
        })
    }

    /// Look up a graphics variant for `pass` under the canonicalized
    /// `keywords`. Unknown keywords are filtered out before lookup, so a
    /// request containing only unknown keywords falls back to the base
    /// (empty-key) variant for that pass.
    pub fn get_graphics(&self, pass: u8, keywords: &[String]) -> Option<&ShaderVariant> {
        let key = canonical_key(keywords, &self.declared_keywords);
        self.graphics_variants
            .iter()
            .find(|v| v.pass == pass && v.key == key)
            .or_else(|| {
                self.graphics_variants
                    .iter()
                    .find(|v| v.pass == pass && v.key.is_empty())
            })
    }

    /// Look up a compute variant for `entry_point` under the canonicalized
    /// `keywords`, with the same unknown-keyword fallback as
    /// [`get_graphics`].
    pub fn get_compute(&self, entry_point: &str, keywords: &[String]) -> Option<&ComputeVariant> {
        let key = canonical_key(keywords, &self.declared_keywords);
        self.compute_variants
            .iter()
            .find(|v| v.entry_point == entry_point && v.key == key)
            .or_else(|| {
                self.compute_variants
                    .iter()
                    .find(|v| v.entry_point == entry_point && v.key.is_empty())
            })
    }

    pub unsafe fn destroy(&self, dev: &ash::Device) {
        for m in &self.modules {
            dev.destroy_shader_module(m.module, None);
        }
    }
}

fn build_graphics_variant(
    v: &VariantRecord,
    key: String,
    modules: Vec<Arc<ShaderModule>>,
    bindings: Vec<BindingReflection>,
    push_constants: Vec<PushConstantRange>,
) -> ShaderVariant {
    ShaderVariant {
        pass: v.pass,
        key,
        entry_points: v.entry_points.clone(),
        modules,
        bindings,
        push_constants,
        static_samplers: Vec::new(),
    }
}

/// Vulkan shader bytecode must be loaded as `u32` words; the package stores
/// it as a raw byte vec (`package.rs` already rejects lengths not a
/// multiple of 4).
fn bytes_to_u32(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keywords(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn canonicalizes_by_intersecting_sorting_and_joining() {
        let declared = keywords(&["SKIN", "SHADOWS"]);
        let requested = vec!["SHADOWS".to_string(), "FOO".to_string(), "SKIN".to_string()];
        assert_eq!(canonical_key(&requested, &declared), "SHADOWS+SKIN");
    }

    #[test]
    fn unknown_only_keywords_canonicalize_to_empty_key() {
        let declared = keywords(&["SKIN"]);
        let requested = vec!["FOO".to_string()];
        assert_eq!(canonical_key(&requested, &declared), "");
    }

    #[test]
    fn bytes_to_u32_round_trips_native_words() {
        let words: Vec<u32> = vec![1, 2, 3];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
        assert_eq!(bytes_to_u32(&bytes), words);
    }
}
