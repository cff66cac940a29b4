// Render pass / framebuffer: attachment sequences and the subpasses that
// read/write them, with subpass dependencies synthesized from attachment
// use rather than hand-authored by the caller.
//
// Austin Shafer - 2021, adapted 2024
use std::collections::HashMap;

use ash::vk;
use rustc_hash::FxHashMap;

use crate::error::{RenderError, Result};
use crate::image::Image;

/// One entry of a render pass's attachment list, named by a stable
/// [`RenderTargetIdentifier`]-style string rather than an index so
/// subpasses and framebuffers can refer to it without caring about
/// positional layout.
#[derive(Clone, Debug)]
pub struct AttachmentDesc {
    pub name: String,
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

/// One subpass's attachment references, by name.
#[derive(Clone, Debug, Default)]
pub struct SubpassDesc {
    pub color: Vec<String>,
    pub depth: Option<String>,
    pub input: Vec<String>,
    pub resolve: Vec<String>,
    /// Tag correlated against `ShaderVariant::pass` at draw time; purely
    /// a label this crate doesn't interpret itself.
    pub shader_pass_tag: u8,
}

#[derive(Clone, Copy)]
struct RoleUse {
    stage: vk::PipelineStageFlags,
    access: vk::AccessFlags,
}

fn color_use() -> RoleUse {
    RoleUse {
        stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
    }
}

fn depth_use() -> RoleUse {
    RoleUse {
        stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
    }
}

fn input_use() -> RoleUse {
    RoleUse {
        stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        access: vk::AccessFlags::INPUT_ATTACHMENT_READ,
    }
}

/// Which uses of `name` does `subpass` make, in the order they'd affect
/// synchronization (a subpass can both write an attachment as color and
/// later read a *different* one as input; the same name occurring in two
/// roles on one subpass is a caller bug we don't attempt to detect here).
fn uses_of<'a>(subpass: &'a SubpassDesc, name: &str) -> Vec<RoleUse> {
    let mut uses = Vec::new();
    if subpass.color.iter().any(|c| c == name) || subpass.resolve.iter().any(|c| c == name) {
        uses.push(color_use());
    }
    if subpass.depth.as_deref() == Some(name) {
        uses.push(depth_use());
    }
    if subpass.input.iter().any(|c| c == name) {
        uses.push(input_use());
    }
    uses
}

/// An ordered sequence of subpasses over a fixed attachment set, with
/// subpass dependencies synthesized from attachment reuse (§4.6): an
/// attachment first touched in subpass `i` and touched again in subpass
/// `j > i` produces a dependency `(i -> j)`.
pub struct RenderPass {
    pub handle: vk::RenderPass,
    pub attachments: Vec<AttachmentDesc>,
    pub subpasses: Vec<SubpassDesc>,
}

impl RenderPass {
    fn synthesize_dependencies(
        attachments: &[AttachmentDesc],
        subpasses: &[SubpassDesc],
    ) -> Vec<vk::SubpassDependency> {
        let mut deps = Vec::new();

        for attachment in attachments {
            // subpasses touching this attachment, in index order
            let touches: Vec<(usize, RoleUse)> = subpasses
                .iter()
                .enumerate()
                .flat_map(|(i, sp)| {
                    uses_of(sp, &attachment.name)
                        .into_iter()
                        .map(move |u| (i, u))
                })
                .collect();

            for w in touches.windows(2) {
                let (i, src) = w[0];
                let (j, dst) = w[1];
                if j <= i {
                    continue;
                }
                deps.push(
                    vk::SubpassDependency::builder()
                        .src_subpass(i as u32)
                        .dst_subpass(j as u32)
                        .src_stage_mask(src.stage)
                        .src_access_mask(src.access)
                        .dst_stage_mask(dst.stage)
                        .dst_access_mask(dst.access)
                        .dependency_flags(vk::DependencyFlags::BY_REGION)
                        .build(),
                );
            }
        }

        deps
    }

    pub fn new(
        dev: &ash::Device,
        attachments: Vec<AttachmentDesc>,
        subpasses: Vec<SubpassDesc>,
    ) -> Result<Self> {
        let index_of: FxHashMap<&str, u32> = attachments
            .iter()
            .enumerate()
            .map(|(i, a)| (a.name.as_str(), i as u32))
            .collect();

        let vk_attachments: Vec<vk::AttachmentDescription> = attachments
            .iter()
            .map(|a| {
                vk::AttachmentDescription::builder()
                    .format(a.format)
                    .samples(a.samples)
                    .load_op(a.load_op)
                    .store_op(a.store_op)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(a.initial_layout)
                    .final_layout(a.final_layout)
                    .build()
            })
            .collect();

        // Per-subpass attachment reference storage must outlive the
        // `vk::SubpassDescription` builders below.
        let mut color_refs: Vec<Vec<vk::AttachmentReference>> = Vec::new();
        let mut depth_refs: Vec<vk::AttachmentReference> = Vec::new();
        let mut input_refs: Vec<Vec<vk::AttachmentReference>> = Vec::new();
        let mut resolve_refs: Vec<Vec<vk::AttachmentReference>> = Vec::new();

        for sp in &subpasses {
            color_refs.push(
                sp.color
                    .iter()
                    .map(|n| {
                        vk::AttachmentReference::builder()
                            .attachment(index_of[n.as_str()])
                            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                            .build()
                    })
                    .collect(),
            );
            depth_refs.push(
                sp.depth
                    .as_ref()
                    .map(|n| {
                        vk::AttachmentReference::builder()
                            .attachment(index_of[n.as_str()])
                            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                            .build()
                    })
                    .unwrap_or(
                        vk::AttachmentReference::builder()
                            .attachment(vk::ATTACHMENT_UNUSED)
                            .layout(vk::ImageLayout::UNDEFINED)
                            .build(),
                    ),
            );
            input_refs.push(
                sp.input
                    .iter()
                    .map(|n| {
                        vk::AttachmentReference::builder()
                            .attachment(index_of[n.as_str()])
                            .layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                            .build()
                    })
                    .collect(),
            );
            resolve_refs.push(
                sp.resolve
                    .iter()
                    .map(|n| {
                        vk::AttachmentReference::builder()
                            .attachment(index_of[n.as_str()])
                            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                            .build()
                    })
                    .collect(),
            );
        }

        let vk_subpasses: Vec<vk::SubpassDescription> = (0..subpasses.len())
            .map(|i| {
                let mut builder = vk::SubpassDescription::builder()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&color_refs[i])
                    .input_attachments(&input_refs[i]);
                if !resolve_refs[i].is_empty() {
                    builder = builder.resolve_attachments(&resolve_refs[i]);
                }
                if subpasses[i].depth.is_some() {
                    builder = builder.depth_stencil_attachment(&depth_refs[i]);
                }
                builder.build()
            })
            .collect();

        let dependencies = Self::synthesize_dependencies(&attachments, &subpasses);

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&vk_attachments)
            .subpasses(&vk_subpasses)
            .dependencies(&dependencies);

        let handle = unsafe { dev.create_render_pass(&create_info, None)? };

        Ok(Self {
            handle,
            attachments,
            subpasses,
        })
    }

    pub unsafe fn destroy(&self, dev: &ash::Device) {
        dev.destroy_render_pass(self.handle, None);
    }
}

/// Binds a [`RenderPass`] to concrete attachment images. Shares ownership
/// of its attachment images for its lifetime (refcounted by the caller,
/// since this crate doesn't prescribe a specific `Arc` shape for `Image`).
pub struct Framebuffer {
    pub handle: vk::Framebuffer,
    pub extent: vk::Extent2D,
}

impl Framebuffer {
    /// Build a framebuffer binding `images` (keyed by [`RenderTargetIdentifier`]
    /// name) to `pass`'s attachment slots. Fails with `MissingAttachment` if
    /// `images` doesn't cover every attachment name the pass declares.
    pub fn new(
        dev: &ash::Device,
        pass: &RenderPass,
        images: &HashMap<String, &Image>,
    ) -> Result<Self> {
        let mut views = Vec::with_capacity(pass.attachments.len());
        let mut extent: Option<vk::Extent2D> = None;

        for attachment in &pass.attachments {
            let image = images
                .get(&attachment.name)
                .ok_or_else(|| RenderError::MissingAttachment(attachment.name.clone()))?;
            views.push(image.view);

            let this_extent = vk::Extent2D {
                width: image.extent.width,
                height: image.extent.height,
            };
            extent = Some(match extent {
                None => this_extent,
                Some(e) => vk::Extent2D {
                    width: e.width.min(this_extent.width),
                    height: e.height.min(this_extent.height),
                },
            });
        }

        let extent = extent.unwrap_or(vk::Extent2D {
            width: 0,
            height: 0,
        });

        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(pass.handle)
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let handle = unsafe { dev.create_framebuffer(&create_info, None)? };

        Ok(Self { handle, extent })
    }

    pub unsafe fn destroy(&self, dev: &ash::Device) {
        dev.destroy_framebuffer(self.handle, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(name: &str) -> AttachmentDesc {
        AttachmentDesc {
            name: name.to_string(),
            format: vk::Format::R8G8B8A8_UNORM,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    #[test]
    fn synthesizes_dependency_for_reused_attachment() {
        let attachments = vec![attachment("gbuffer")];
        let subpasses = vec![
            SubpassDesc {
                color: vec!["gbuffer".to_string()],
                shader_pass_tag: 0,
                ..Default::default()
            },
            SubpassDesc {
                input: vec!["gbuffer".to_string()],
                shader_pass_tag: 1,
                ..Default::default()
            },
        ];

        let deps = RenderPass::synthesize_dependencies(&attachments, &subpasses);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].src_subpass, 0);
        assert_eq!(deps[0].dst_subpass, 1);
        assert_eq!(deps[0].dst_access_mask, vk::AccessFlags::INPUT_ATTACHMENT_READ);
    }

    #[test]
    fn no_dependency_when_attachment_used_once() {
        let attachments = vec![attachment("color")];
        let subpasses = vec![SubpassDesc {
            color: vec!["color".to_string()],
            ..Default::default()
        }];

        assert!(RenderPass::synthesize_dependencies(&attachments, &subpasses).is_empty());
    }
}
