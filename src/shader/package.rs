// Compiled shader package (.stmb) reader/writer.
//
// Bit-exact little-endian layout documented in the external-interfaces
// section: module blobs, then per-variant reflection + pipeline state,
// then global pipeline state. Hand-rolled rather than `bincode` because
// the wire format uses explicit u64-length-prefixed strings and a fixed
// 28-byte depth/stencil struct rather than bincode's own framing.
//
// Austin Shafer - 2021, adapted 2024
use std::convert::TryInto;
use std::io;

use crate::error::{RenderError, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct ModuleBlob {
    pub stage: u32,
    pub bytecode: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BindingRecord {
    pub name: String,
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: u32,
    pub count: u32,
    pub stage_mask: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PushRangeRecord {
    pub name: String,
    pub stage_mask: u32,
    pub offset: u32,
    pub size: u32,
}

/// A trimmed mirror of `VkSamplerCreateInfo`'s scalar fields, stored as
/// plain values rather than the ash struct (which carries a `p_next` and
/// isn't `serde`-friendly).
#[derive(Clone, Debug, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: u32,
    pub min_filter: u32,
    pub mipmap_mode: u32,
    pub address_mode_u: u32,
    pub address_mode_v: u32,
    pub address_mode_w: u32,
    pub max_anisotropy: f32,
    pub compare_enable: u32,
    pub compare_op: u32,
    pub min_lod: f32,
    pub max_lod: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StaticSamplerRecord {
    pub name: String,
    pub desc: SamplerDesc,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VariantRecord {
    /// 0 = compute.
    pub pass: u8,
    pub keywords: Vec<String>,
    pub entry_points: Vec<String>,
    pub module_indices: Vec<u32>,
    pub bindings: Vec<BindingRecord>,
    pub push_ranges: Vec<PushRangeRecord>,
    pub static_samplers: Vec<StaticSamplerRecord>,
    /// `(0, 0, 0)` for graphics variants.
    pub workgroup_size: [u32; 3],
}

/// Fixed 28-byte layout: 6 x u32 + 2 x f32.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthStencilState {
    pub depth_test_enable: u32,
    pub depth_write_enable: u32,
    pub depth_compare_op: u32,
    pub depth_bounds_test_enable: u32,
    pub min_depth_bounds: f32,
    pub max_depth_bounds: f32,
    pub stencil_test_enable: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ShaderPackage {
    pub modules: Vec<ModuleBlob>,
    pub variants: Vec<VariantRecord>,
    pub render_queue: u32,
    pub color_mask: u32,
    pub cull_mode: u32,
    pub fill_mode: u32,
    /// 0=Opaque, 1=Alpha, 2=Additive, 3=Multiply.
    pub blend_mode: u32,
    pub depth_stencil: DepthStencilState,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(RenderError::ShaderLoadError(
                "package truncated".to_string(),
            ));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u64()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u64()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| RenderError::ShaderLoadError(format!("invalid utf8 string: {}", e)))
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.u64(v.len() as u64);
        self.buf.extend_from_slice(v);
    }

    fn string(&mut self, v: &str) {
        self.bytes(v.as_bytes());
    }
}

fn write_binding(w: &mut Writer, b: &BindingRecord) {
    w.string(&b.name);
    w.u32(b.set);
    w.u32(b.binding);
    w.u32(b.descriptor_type);
    w.u32(b.count);
    w.u32(b.stage_mask);
}

fn read_binding(r: &mut Reader) -> Result<BindingRecord> {
    Ok(BindingRecord {
        name: r.string()?,
        set: r.u32()?,
        binding: r.u32()?,
        descriptor_type: r.u32()?,
        count: r.u32()?,
        stage_mask: r.u32()?,
    })
}

fn write_push_range(w: &mut Writer, p: &PushRangeRecord) {
    w.string(&p.name);
    w.u32(p.stage_mask);
    w.u32(p.offset);
    w.u32(p.size);
}

fn read_push_range(r: &mut Reader) -> Result<PushRangeRecord> {
    Ok(PushRangeRecord {
        name: r.string()?,
        stage_mask: r.u32()?,
        offset: r.u32()?,
        size: r.u32()?,
    })
}

fn write_sampler(w: &mut Writer, s: &StaticSamplerRecord) {
    w.string(&s.name);
    w.u32(s.desc.mag_filter);
    w.u32(s.desc.min_filter);
    w.u32(s.desc.mipmap_mode);
    w.u32(s.desc.address_mode_u);
    w.u32(s.desc.address_mode_v);
    w.u32(s.desc.address_mode_w);
    w.f32(s.desc.max_anisotropy);
    w.u32(s.desc.compare_enable);
    w.u32(s.desc.compare_op);
    w.f32(s.desc.min_lod);
    w.f32(s.desc.max_lod);
}

fn read_sampler(r: &mut Reader) -> Result<StaticSamplerRecord> {
    let name = r.string()?;
    let desc = SamplerDesc {
        mag_filter: r.u32()?,
        min_filter: r.u32()?,
        mipmap_mode: r.u32()?,
        address_mode_u: r.u32()?,
        address_mode_v: r.u32()?,
        address_mode_w: r.u32()?,
        max_anisotropy: r.f32()?,
        compare_enable: r.u32()?,
        compare_op: r.u32()?,
        min_lod: r.f32()?,
        max_lod: r.f32()?,
    };
    Ok(StaticSamplerRecord { name, desc })
}

impl ShaderPackage {
    pub fn read_from_path(path: &std::path::Path) -> Result<Self> {
        let data = std::fs::read(path)
            .map_err(|e| RenderError::ShaderLoadError(format!("{}: {}", path.display(), e)))?;
        Self::deserialize(&data)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);

        let module_count = r.u64()?;
        let mut modules = Vec::with_capacity(module_count as usize);
        for _ in 0..module_count {
            let stage = r.u32()?;
            let bytecode = r.bytes()?;
            if bytecode.len() % 4 != 0 {
                return Err(RenderError::ShaderLoadError(
                    "module bytecode length is not a multiple of 4".to_string(),
                ));
            }
            modules.push(ModuleBlob { stage, bytecode });
        }

        let variant_count = r.u64()?;
        let mut variants = Vec::with_capacity(variant_count as usize);
        for _ in 0..variant_count {
            let pass = r.u8()?;

            let keyword_count = r.u64()?;
            let mut keywords = Vec::with_capacity(keyword_count as usize);
            for _ in 0..keyword_count {
                keywords.push(r.string()?);
            }

            let entry_count = r.u64()?;
            let mut entry_points = Vec::with_capacity(entry_count as usize);
            for _ in 0..entry_count {
                entry_points.push(r.string()?);
            }

            let module_count_v = r.u64()?;
            let mut module_indices = Vec::with_capacity(module_count_v as usize);
            for _ in 0..module_count_v {
                module_indices.push(r.u32()?);
            }

            let binding_count = r.u64()?;
            let mut bindings = Vec::with_capacity(binding_count as usize);
            for _ in 0..binding_count {
                bindings.push(read_binding(&mut r)?);
            }

            let push_count = r.u64()?;
            let mut push_ranges = Vec::with_capacity(push_count as usize);
            for _ in 0..push_count {
                push_ranges.push(read_push_range(&mut r)?);
            }

            let sampler_count = r.u64()?;
            let mut static_samplers = Vec::with_capacity(sampler_count as usize);
            for _ in 0..sampler_count {
                static_samplers.push(read_sampler(&mut r)?);
            }

            let workgroup_size = [r.u32()?, r.u32()?, r.u32()?];

            variants.push(VariantRecord {
                pass,
                keywords,
                entry_points,
                module_indices,
                bindings,
                push_ranges,
                static_samplers,
                workgroup_size,
            });
        }

        let render_queue = r.u32()?;
        let color_mask = r.u32()?;
        let cull_mode = r.u32()?;
        let fill_mode = r.u32()?;
        let blend_mode = r.u32()?;

        let depth_stencil = DepthStencilState {
            depth_test_enable: r.u32()?,
            depth_write_enable: r.u32()?,
            depth_compare_op: r.u32()?,
            depth_bounds_test_enable: r.u32()?,
            min_depth_bounds: r.f32()?,
            max_depth_bounds: r.f32()?,
            stencil_test_enable: r.u32()?,
        };

        Ok(ShaderPackage {
            modules,
            variants,
            render_queue,
            color_mask,
            cull_mode,
            fill_mode,
            blend_mode,
            depth_stencil,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Writer::new();

        w.u64(self.modules.len() as u64);
        for m in &self.modules {
            w.u32(m.stage);
            w.bytes(&m.bytecode);
        }

        w.u64(self.variants.len() as u64);
        for v in &self.variants {
            w.u8(v.pass);

            w.u64(v.keywords.len() as u64);
            for k in &v.keywords {
                w.string(k);
            }

            w.u64(v.entry_points.len() as u64);
            for e in &v.entry_points {
                w.string(e);
            }

            w.u64(v.module_indices.len() as u64);
            for idx in &v.module_indices {
                w.u32(*idx);
            }

            w.u64(v.bindings.len() as u64);
            for b in &v.bindings {
                write_binding(&mut w, b);
            }

            w.u64(v.push_ranges.len() as u64);
            for p in &v.push_ranges {
                write_push_range(&mut w, p);
            }

            w.u64(v.static_samplers.len() as u64);
            for s in &v.static_samplers {
                write_sampler(&mut w, s);
            }

            for dim in v.workgroup_size {
                w.u32(dim);
            }
        }

        w.u32(self.render_queue);
        w.u32(self.color_mask);
        w.u32(self.cull_mode);
        w.u32(self.fill_mode);
        w.u32(self.blend_mode);

        w.u32(self.depth_stencil.depth_test_enable);
        w.u32(self.depth_stencil.depth_write_enable);
        w.u32(self.depth_stencil.depth_compare_op);
        w.u32(self.depth_stencil.depth_bounds_test_enable);
        w.f32(self.depth_stencil.min_depth_bounds);
        w.f32(self.depth_stencil.max_depth_bounds);
        w.u32(self.depth_stencil.stencil_test_enable);

        w.buf
    }

    pub fn write_to_path(&self, path: &std::path::Path) -> io::Result<()> {
        std::fs::write(path, self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_package() -> ShaderPackage {
        ShaderPackage {
            modules: vec![ModuleBlob {
                stage: 1,
                bytecode: vec![0u8; 16],
            }],
            variants: vec![VariantRecord {
                pass: 1,
                keywords: vec!["SKIN".to_string(), "SHADOWS".to_string()],
                entry_points: vec!["main".to_string()],
                module_indices: vec![0],
                bindings: vec![BindingRecord {
                    name: "u_camera".to_string(),
                    set: 0,
                    binding: 0,
                    descriptor_type: 6,
                    count: 1,
                    stage_mask: 1,
                }],
                push_ranges: vec![PushRangeRecord {
                    name: "pc".to_string(),
                    stage_mask: 1,
                    offset: 0,
                    size: 16,
                }],
                static_samplers: vec![],
                workgroup_size: [0, 0, 0],
            }],
            render_queue: 0,
            color_mask: 0xf,
            cull_mode: 1,
            fill_mode: 0,
            blend_mode: 1,
            depth_stencil: DepthStencilState {
                depth_test_enable: 1,
                depth_write_enable: 1,
                depth_compare_op: 1,
                depth_bounds_test_enable: 0,
                min_depth_bounds: 0.0,
                max_depth_bounds: 1.0,
                stencil_test_enable: 0,
            },
        }
    }

    #[test]
    fn round_trips_through_the_wire_format() {
        let pkg = sample_package();
        let bytes = pkg.serialize();
        let decoded = ShaderPackage::deserialize(&bytes).unwrap();
        assert_eq!(pkg, decoded);
    }

    #[test]
    fn rejects_truncated_packages() {
        let pkg = sample_package();
        let mut bytes = pkg.serialize();
        bytes.truncate(bytes.len() - 4);
        assert!(ShaderPackage::deserialize(&bytes).is_err());
    }
}
