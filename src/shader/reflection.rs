// Shader reflection: per-binding descriptor info merged across stages,
// and push-constant ranges computed from member byte offsets.
//
// Austin Shafer - 2021, adapted 2024
use ash::vk;

/// One descriptor binding as enumerated from shader bytecode, merged
/// across every stage it appears in.
#[derive(Clone, Debug, PartialEq)]
pub struct BindingReflection {
    pub name: String,
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub array_size: u32,
    pub stage_mask: vk::ShaderStageFlags,
}

/// A push-constant range grouped by stage mask, with `(offset, size)`
/// derived from its member fields' byte offsets.
#[derive(Clone, Debug, PartialEq)]
pub struct PushConstantRange {
    pub name: String,
    pub stage_mask: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

/// One `(set, binding, descriptor_type, array_size)` touch recorded for a
/// single shader stage, before merging across stages.
pub struct RawBindingUse {
    pub name: String,
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub array_size: u32,
    pub stage: vk::ShaderStageFlags,
}

/// Merge bindings that appear across multiple stages into a single record
/// whose stage mask is the union (§4.4).
pub fn merge_bindings(uses: Vec<RawBindingUse>) -> Vec<BindingReflection> {
    let mut merged: Vec<BindingReflection> = Vec::new();

    for u in uses {
        if let Some(existing) = merged
            .iter_mut()
            .find(|b| b.set == u.set && b.binding == u.binding)
        {
            existing.stage_mask |= u.stage;
        } else {
            merged.push(BindingReflection {
                name: u.name,
                set: u.set,
                binding: u.binding,
                descriptor_type: u.descriptor_type,
                array_size: u.array_size,
                stage_mask: u.stage,
            });
        }
    }

    merged
}

/// One push-constant member: its declaring stage and byte range within the
/// shared push-constant block.
pub struct RawPushConstantMember {
    pub range_name: String,
    pub stage: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

/// Enumerate push-constant ranges grouped by stage mask, computing each
/// range's `(offset, size)` from the min/max byte offsets of its members
/// (§4.4).
pub fn compute_push_constant_ranges(members: Vec<RawPushConstantMember>) -> Vec<PushConstantRange> {
    use std::collections::BTreeMap;

    let mut by_stage: BTreeMap<(String, vk::ShaderStageFlags), (u32, u32)> = BTreeMap::new();

    for m in members {
        let key = (m.range_name.clone(), m.stage);
        let entry = by_stage.entry(key).or_insert((m.offset, m.offset + m.size));
        entry.0 = entry.0.min(m.offset);
        entry.1 = entry.1.max(m.offset + m.size);
    }

    by_stage
        .into_iter()
        .map(|((name, stage_mask), (min_off, max_end))| PushConstantRange {
            name,
            stage_mask,
            offset: min_off,
            size: max_end - min_off,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_stage_masks_for_shared_bindings() {
        let uses = vec![
            RawBindingUse {
                name: "u_camera".to_string(),
                set: 0,
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                array_size: 1,
                stage: vk::ShaderStageFlags::VERTEX,
            },
            RawBindingUse {
                name: "u_camera".to_string(),
                set: 0,
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                array_size: 1,
                stage: vk::ShaderStageFlags::FRAGMENT,
            },
        ];

        let merged = merge_bindings(uses);
        assert_eq!(merged.len(), 1);
        assert_eq!(
            merged[0].stage_mask,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn computes_push_constant_range_from_members() {
        let members = vec![
            RawPushConstantMember {
                range_name: "pc".to_string(),
                stage: vk::ShaderStageFlags::VERTEX,
                offset: 0,
                size: 16,
            },
            RawPushConstantMember {
                range_name: "pc".to_string(),
                stage: vk::ShaderStageFlags::VERTEX,
                offset: 16,
                size: 4,
            },
        ];

        let ranges = compute_push_constant_ranges(members);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].offset, 0);
        assert_eq!(ranges[0].size, 20);
    }
}
