//! SPIR-V reflection into plain descriptions.
//!
//! Shader binaries are parsed once into [`StageReflection`]s. Everything after
//! that (vertex packing, cross-stage merging, pool sizing) works on plain data
//! and never touches the binary again.

use crate::error::{GpuError, Result};
use ash::vk;
use spirq::ty::{DescriptorType, ScalarType, Type, VectorType};
use spirq::var::Variable;
use spirq::ReflectConfig;
use std::collections::BTreeMap;

/// A vertex shader input attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexInput {
    pub location: u32,
    pub format: vk::Format,
    /// Size in bytes.
    pub size: u32,
}

/// A descriptor binding declared by one or more stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflectedBinding {
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Everything pipeline construction needs from one stage.
#[derive(Debug, Clone, Default)]
pub struct StageReflection {
    pub stage: vk::ShaderStageFlags,
    /// Only populated for vertex shaders.
    pub inputs: Vec<VertexInput>,
    pub bindings: Vec<ReflectedBinding>,
}

/// Bindings per descriptor set; index `i` holds set number `i`.
pub type SetBindings = Vec<BTreeMap<u32, ReflectedBinding>>;

/// Parse a SPIR-V binary.
pub fn reflect_stage(code: &[u32], stage: vk::ShaderStageFlags) -> Result<StageReflection> {
    let entry_points = ReflectConfig::new()
        .spv(code)
        .ref_all_rscs(true)
        .reflect()
        .map_err(|e| GpuError::ShaderReflection(e.to_string()))?;
    let entry = entry_points
        .into_iter()
        .find(|entry| entry.name == "main")
        .ok_or_else(|| GpuError::ShaderReflection("no `main` entry point".to_string()))?;

    let mut reflection = StageReflection {
        stage,
        ..Default::default()
    };
    for var in entry.vars {
        match var {
            Variable::Input { location, ty, .. } if stage == vk::ShaderStageFlags::VERTEX => {
                let (format, size) = vertex_format(&ty)?;
                reflection.inputs.push(VertexInput {
                    location: location.loc(),
                    format,
                    size,
                });
            }
            Variable::Descriptor {
                name,
                desc_bind,
                desc_ty,
                nbind,
                ..
            } => {
                let descriptor_type = descriptor_type(&desc_ty).ok_or_else(|| {
                    GpuError::ShaderReflection(format!(
                        "unsupported descriptor {:?} at set {}, binding {}",
                        name.unwrap_or_default(),
                        desc_bind.set(),
                        desc_bind.bind()
                    ))
                })?;
                reflection.bindings.push(ReflectedBinding {
                    set: desc_bind.set(),
                    binding: desc_bind.bind(),
                    descriptor_type,
                    count: nbind.max(1),
                    stages: stage,
                });
            }
            _ => {}
        }
    }
    Ok(reflection)
}

fn descriptor_type(ty: &DescriptorType) -> Option<vk::DescriptorType> {
    Some(match ty {
        DescriptorType::Sampler(..) => vk::DescriptorType::SAMPLER,
        DescriptorType::CombinedImageSampler(..) => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        DescriptorType::SampledImage(..) => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorType::StorageImage(..) => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorType::UniformTexelBuffer(..) => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        DescriptorType::StorageTexelBuffer(..) => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        DescriptorType::UniformBuffer(..) => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorType::StorageBuffer(..) => vk::DescriptorType::STORAGE_BUFFER,
        _ => return None,
    })
}

fn vertex_format(ty: &Type) -> Result<(vk::Format, u32)> {
    let (scalar, count) = match ty {
        Type::Scalar(scalar) => (scalar, 1),
        Type::Vector(VectorType { scalar_ty, nscalar }) => (scalar_ty, *nscalar),
        other => {
            return Err(GpuError::ShaderReflection(format!(
                "unsupported vertex input type {other:?}"
            )))
        }
    };
    let format = match (scalar, count) {
        (ScalarType::Float { bits: 32 }, 1) => vk::Format::R32_SFLOAT,
        (ScalarType::Float { bits: 32 }, 2) => vk::Format::R32G32_SFLOAT,
        (ScalarType::Float { bits: 32 }, 3) => vk::Format::R32G32B32_SFLOAT,
        (ScalarType::Float { bits: 32 }, 4) => vk::Format::R32G32B32A32_SFLOAT,
        (ScalarType::Integer { bits: 32, is_signed: true }, 1) => vk::Format::R32_SINT,
        (ScalarType::Integer { bits: 32, is_signed: true }, 2) => vk::Format::R32G32_SINT,
        (ScalarType::Integer { bits: 32, is_signed: true }, 3) => vk::Format::R32G32B32_SINT,
        (ScalarType::Integer { bits: 32, is_signed: true }, 4) => vk::Format::R32G32B32A32_SINT,
        (ScalarType::Integer { bits: 32, is_signed: false }, 1) => vk::Format::R32_UINT,
        (ScalarType::Integer { bits: 32, is_signed: false }, 2) => vk::Format::R32G32_UINT,
        (ScalarType::Integer { bits: 32, is_signed: false }, 3) => vk::Format::R32G32B32_UINT,
        (ScalarType::Integer { bits: 32, is_signed: false }, 4) => vk::Format::R32G32B32A32_UINT,
        (other, n) => {
            return Err(GpuError::ShaderReflection(format!(
                "unsupported vertex input {other:?} x{n}"
            )))
        }
    };
    Ok((format, 4 * count))
}

/// Vertex binding and attributes for tightly packed, interleaved vertices.
#[derive(Debug, Clone, Default)]
pub struct VertexLayout {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl VertexLayout {
    /// Bytes per vertex; 0 without inputs.
    pub fn stride(&self) -> u32 {
        self.bindings.first().map_or(0, |binding| binding.stride)
    }
}

/// Sort inputs by location and pack them contiguously into binding 0.
pub fn vertex_layout(inputs: &[VertexInput]) -> VertexLayout {
    if inputs.is_empty() {
        return VertexLayout::default();
    }
    let mut sorted = inputs.to_vec();
    sorted.sort_by_key(|input| input.location);

    let mut offset = 0;
    let attributes = sorted
        .iter()
        .map(|input| {
            let attribute = vk::VertexInputAttributeDescription {
                location: input.location,
                binding: 0,
                format: input.format,
                offset,
            };
            offset += input.size;
            attribute
        })
        .collect();

    VertexLayout {
        bindings: vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: offset,
            input_rate: vk::VertexInputRate::VERTEX,
        }],
        attributes,
    }
}

/// Unify bindings of all stages by `(set, binding)`.
///
/// Stage masks of matching entries are combined. Sets no stage declares are
/// present but empty, so the result can be indexed by set number.
pub fn merge_bindings(stages: &[StageReflection]) -> Result<SetBindings> {
    let mut sets: SetBindings = Vec::new();
    for binding in stages.iter().flat_map(|stage| &stage.bindings) {
        let set = binding.set as usize;
        if sets.len() <= set {
            sets.resize_with(set + 1, BTreeMap::new);
        }
        match sets[set].get_mut(&binding.binding) {
            Some(existing) => {
                if existing.descriptor_type != binding.descriptor_type || existing.count != binding.count {
                    let detail = format!(
                        "{:?} x{} vs {:?} x{}",
                        existing.descriptor_type, existing.count, binding.descriptor_type, binding.count
                    );
                    tracing::error!(
                        "Descriptor (set {}, binding {}) mismatch: {detail}",
                        binding.set,
                        binding.binding
                    );
                    return Err(GpuError::ReflectionMismatch {
                        set: binding.set,
                        binding: binding.binding,
                        detail,
                    });
                }
                existing.stages |= binding.stages;
            }
            None => {
                sets[set].insert(binding.binding, *binding);
            }
        }
    }
    Ok(sets)
}

/// Total descriptors needed per type, ordered by type.
pub fn pool_sizes(sets: &[BTreeMap<u32, ReflectedBinding>]) -> Vec<vk::DescriptorPoolSize> {
    let mut totals: BTreeMap<i32, u32> = BTreeMap::new();
    for binding in sets.iter().flat_map(BTreeMap::values) {
        *totals.entry(binding.descriptor_type.as_raw()).or_default() += binding.count;
    }
    totals
        .into_iter()
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
            ty: vk::DescriptorType::from_raw(ty),
            descriptor_count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(
        set: u32,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
    ) -> ReflectedBinding {
        ReflectedBinding {
            set,
            binding,
            descriptor_type,
            count: 1,
            stages,
        }
    }

    fn stage(stage: vk::ShaderStageFlags, bindings: Vec<ReflectedBinding>) -> StageReflection {
        StageReflection {
            stage,
            inputs: vec![],
            bindings,
        }
    }

    #[test]
    fn matching_bindings_merge_stage_masks() {
        let vert = stage(
            vk::ShaderStageFlags::VERTEX,
            vec![binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)],
        );
        let frag = stage(
            vk::ShaderStageFlags::FRAGMENT,
            vec![binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::FRAGMENT)],
        );
        let sets = merge_bindings(&[vert, frag]).unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].len(), 1);
        assert_eq!(
            sets[0][&0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let vert = stage(
            vk::ShaderStageFlags::VERTEX,
            vec![binding(0, 1, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)],
        );
        let frag = stage(
            vk::ShaderStageFlags::FRAGMENT,
            vec![binding(0, 1, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::FRAGMENT)],
        );
        match merge_bindings(&[vert, frag]) {
            Err(GpuError::ReflectionMismatch { set, binding, .. }) => {
                assert_eq!((set, binding), (0, 1));
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn count_mismatch_is_an_error() {
        let mut arrayed = binding(0, 0, vk::DescriptorType::SAMPLED_IMAGE, vk::ShaderStageFlags::FRAGMENT);
        arrayed.count = 4;
        let single = binding(0, 0, vk::DescriptorType::SAMPLED_IMAGE, vk::ShaderStageFlags::VERTEX);
        let stages = [
            stage(vk::ShaderStageFlags::VERTEX, vec![single]),
            stage(vk::ShaderStageFlags::FRAGMENT, vec![arrayed]),
        ];
        assert!(merge_bindings(&stages).is_err());
    }

    #[test]
    fn sets_are_indexed_by_number() {
        let compute = stage(
            vk::ShaderStageFlags::COMPUTE,
            vec![
                binding(2, 0, vk::DescriptorType::STORAGE_IMAGE, vk::ShaderStageFlags::COMPUTE),
                binding(0, 3, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::COMPUTE),
                binding(0, 1, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::COMPUTE),
            ],
        );
        let sets = merge_bindings(&[compute]).unwrap();
        assert_eq!(sets.len(), 3);
        assert_eq!(sets[0].keys().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert!(sets[1].is_empty());
        assert_eq!(sets[2][&0].descriptor_type, vk::DescriptorType::STORAGE_IMAGE);
    }

    #[test]
    fn vertex_inputs_pack_by_location() {
        let inputs = [
            VertexInput {
                location: 2,
                format: vk::Format::R32G32B32A32_SFLOAT,
                size: 16,
            },
            VertexInput {
                location: 0,
                format: vk::Format::R32G32_SFLOAT,
                size: 8,
            },
            VertexInput {
                location: 1,
                format: vk::Format::R32G32B32_SFLOAT,
                size: 12,
            },
        ];
        let layout = vertex_layout(&inputs);
        let locations: Vec<u32> = layout.attributes.iter().map(|a| a.location).collect();
        let offsets: Vec<u32> = layout.attributes.iter().map(|a| a.offset).collect();
        assert_eq!(locations, vec![0, 1, 2]);
        assert_eq!(offsets, vec![0, 8, 20]);
        assert_eq!(layout.stride(), 36);
        assert_eq!(layout.bindings[0].binding, 0);
        assert_eq!(layout.bindings[0].input_rate, vk::VertexInputRate::VERTEX);
    }

    #[test]
    fn no_inputs_no_bindings() {
        let layout = vertex_layout(&[]);
        assert!(layout.bindings.is_empty());
        assert_eq!(layout.stride(), 0);
    }

    #[test]
    fn pool_sizes_tally_per_type() {
        let mut array = binding(1, 0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT);
        array.count = 3;
        let stages = [stage(
            vk::ShaderStageFlags::FRAGMENT,
            vec![
                binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::FRAGMENT),
                binding(0, 1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT),
                array,
            ],
        )];
        let sets = merge_bindings(&stages).unwrap();
        let sizes = pool_sizes(&sets);
        assert_eq!(sizes.len(), 2);
        let combined = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .unwrap();
        assert_eq!(combined.descriptor_count, 4);
        let uniform = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER)
            .unwrap();
        assert_eq!(uniform.descriptor_count, 1);
    }

    #[test]
    fn empty_reflection_creates_nothing() {
        let sets = merge_bindings(&[stage(vk::ShaderStageFlags::VERTEX, vec![])]).unwrap();
        assert!(sets.is_empty());
        assert!(pool_sizes(&sets).is_empty());
    }
}
