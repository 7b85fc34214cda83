//! Shaders for Cadence.
//!
//! GLSL sources live in `shaders/` and are compiled to SPIR-V at build time
//! using shaderc. They are looked up by their source file name.

use std::sync::OnceLock;

/// Embedded SPIR-V shader bytecode (raw bytes, may not be aligned).
mod spirv_bytes {
    macro_rules! spirv {
        ($name:literal) => {
            ($name, include_bytes!(concat!(env!("OUT_DIR"), "/", $name, ".spv")) as &[u8])
        };
    }

    pub static ALL: [(&str, &[u8]); 5] = [
        spirv!("gradient.comp"),
        spirv!("fullscreen.vert"),
        spirv!("composite.frag"),
        spirv!("quad.vert"),
        spirv!("quad.frag"),
    ];
}

/// SPIR-V magic number, the first word of every module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Convert byte slice to aligned u32 words (SPIR-V requires 4-byte alignment).
fn bytes_to_spirv(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

static SPIRV: OnceLock<Vec<(&'static str, Vec<u32>)>> = OnceLock::new();

/// Names of every embedded shader.
pub fn names() -> impl Iterator<Item = &'static str> {
    spirv_bytes::ALL.iter().map(|(name, _)| *name)
}

/// SPIR-V words for the shader compiled from `shaders/<name>`.
pub fn load(name: &str) -> Option<&'static [u32]> {
    SPIRV
        .get_or_init(|| {
            spirv_bytes::ALL
                .iter()
                .map(|(name, bytes)| (*name, bytes_to_spirv(bytes)))
                .collect()
        })
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, words)| words.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;
    use cadence_gpu::reflect::{merge_bindings, reflect_stage, vertex_layout};

    #[test]
    fn every_shader_loads() {
        for name in names() {
            let shader = load(name).unwrap();
            assert_eq!(shader[0], SPIRV_MAGIC, "Invalid SPIR-V magic number in {name}");
            assert!(shader.len() > 20, "Shader {name} too small");
        }
        assert!(load("missing.frag").is_none());
    }

    #[test]
    fn gradient_reflects_storage_image_and_uniform() {
        let reflection =
            reflect_stage(load("gradient.comp").unwrap(), vk::ShaderStageFlags::COMPUTE).unwrap();
        let sets = merge_bindings(&[reflection]).unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0][&0].descriptor_type, vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(sets[0][&1].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
    }

    #[test]
    fn composite_shares_uniform_between_stages() {
        let vertex =
            reflect_stage(load("fullscreen.vert").unwrap(), vk::ShaderStageFlags::VERTEX).unwrap();
        let fragment =
            reflect_stage(load("composite.frag").unwrap(), vk::ShaderStageFlags::FRAGMENT).unwrap();
        assert!(vertex.inputs.is_empty());

        let sets = merge_bindings(&[vertex, fragment]).unwrap();
        let canvas = sets[0][&0];
        assert_eq!(canvas.descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(canvas.stages, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(
            sets[0][&1].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn quad_vertex_inputs_pack() {
        let vertex = reflect_stage(load("quad.vert").unwrap(), vk::ShaderStageFlags::VERTEX).unwrap();
        let layout = vertex_layout(&vertex.inputs);
        assert_eq!(layout.stride(), 16);
        assert_eq!(layout.attributes.len(), 2);
        assert_eq!(layout.attributes[0].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(layout.attributes[1].offset, 8);
    }
}
