//! Descriptor set management driven by reflected bindings.

use crate::buffer::Buffer;
use crate::error::{GpuError, Result};
use crate::image::Image;
use crate::reflect::{pool_sizes, SetBindings};
use ash::vk;
use std::collections::HashMap;

/// Sampler parameters for specific `(set, binding)` slots.
///
/// Combined image samplers without an entry get [`default_sampler_info`].
pub type SamplerOverrides = HashMap<(u32, u32), vk::SamplerCreateInfo<'static>>;

/// Linear, edge-clamped sampling over every mip level.
pub fn default_sampler_info() -> vk::SamplerCreateInfo<'static> {
    vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .mip_lod_bias(0.0)
        .anisotropy_enable(false)
        .max_anisotropy(1.0)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .min_lod(0.0)
        .max_lod(vk::LOD_CLAMP_NONE)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
}

fn sampler_info_for(overrides: &SamplerOverrides, set: u32, binding: u32) -> vk::SamplerCreateInfo<'static> {
    overrides
        .get(&(set, binding))
        .copied()
        .unwrap_or_else(default_sampler_info)
}

/// Image layout a descriptor of `descriptor_type` expects.
pub fn descriptor_image_layout(descriptor_type: vk::DescriptorType) -> vk::ImageLayout {
    if descriptor_type == vk::DescriptorType::STORAGE_IMAGE {
        vk::ImageLayout::GENERAL
    } else {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    }
}

/// Layouts, pool, sets and immutable samplers for one pipeline.
#[derive(Default)]
pub struct DescriptorBundle {
    layouts: Vec<vk::DescriptorSetLayout>,
    pool: vk::DescriptorPool,
    sets: Vec<vk::DescriptorSet>,
    samplers: Vec<vk::Sampler>,
}

impl DescriptorBundle {
    /// Create one layout and one set per entry of `bindings`, in set order.
    ///
    /// Creates nothing when no stage declares a binding.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        bindings: &SetBindings,
        overrides: &SamplerOverrides,
    ) -> Result<Self> {
        let mut bundle = Self::default();
        if bindings.iter().all(|set| set.is_empty()) {
            return Ok(bundle);
        }
        if let Err(e) = bundle.build(device, bindings, overrides) {
            bundle.destroy(device);
            return Err(e);
        }
        Ok(bundle)
    }

    unsafe fn build(
        &mut self,
        device: &ash::Device,
        bindings: &SetBindings,
        overrides: &SamplerOverrides,
    ) -> Result<()> {
        for (set, set_bindings) in (0u32..).zip(bindings) {
            // Immutable samplers are referenced by pointer until the layout exists.
            let mut immutable: Vec<(u32, Vec<vk::Sampler>)> = Vec::new();
            for binding in set_bindings.values() {
                if binding.descriptor_type != vk::DescriptorType::COMBINED_IMAGE_SAMPLER {
                    continue;
                }
                let info = sampler_info_for(overrides, set, binding.binding);
                let mut samplers = Vec::with_capacity(binding.count as usize);
                for _ in 0..binding.count {
                    let sampler = device.create_sampler(&info, None)?;
                    self.samplers.push(sampler);
                    samplers.push(sampler);
                }
                immutable.push((binding.binding, samplers));
            }

            let layout_bindings: Vec<_> = set_bindings
                .values()
                .map(|binding| {
                    let layout_binding = vk::DescriptorSetLayoutBinding::default()
                        .binding(binding.binding)
                        .descriptor_type(binding.descriptor_type)
                        .descriptor_count(binding.count)
                        .stage_flags(binding.stages);
                    match immutable.iter().find(|(index, _)| *index == binding.binding) {
                        Some((_, samplers)) => layout_binding.immutable_samplers(samplers),
                        None => layout_binding,
                    }
                })
                .collect();

            let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&layout_bindings);
            self.layouts.push(device.create_descriptor_set_layout(&layout_info, None)?);
        }

        let sizes = pool_sizes(bindings);
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(self.layouts.len() as u32)
            .pool_sizes(&sizes);
        self.pool = device.create_descriptor_pool(&pool_info, None)?;

        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&self.layouts);
        self.sets = device.allocate_descriptor_sets(&alloc_info)?;

        tracing::debug!(
            "Created {} descriptor sets with {} immutable samplers",
            self.sets.len(),
            self.samplers.len()
        );
        Ok(())
    }

    /// Set layouts, indexed by set number.
    pub fn layouts(&self) -> &[vk::DescriptorSetLayout] {
        &self.layouts
    }

    /// Allocated sets, indexed by set number.
    pub fn sets(&self) -> &[vk::DescriptorSet] {
        &self.sets
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// The allocated set for `set`.
    pub fn set(&self, set: u32) -> Result<vk::DescriptorSet> {
        self.sets.get(set as usize).copied().ok_or_else(|| {
            GpuError::InvalidState(format!(
                "Descriptor set {set} does not exist ({} sets)",
                self.sets.len()
            ))
        })
    }

    /// Point `(set, binding)` at `image`'s view.
    ///
    /// Combined image samplers keep their immutable sampler.
    ///
    /// # Safety
    /// The device must be valid and the set must not be in use.
    pub unsafe fn write_image(
        &self,
        device: &ash::Device,
        set: u32,
        binding: u32,
        image: &Image,
        descriptor_type: vk::DescriptorType,
    ) -> Result<()> {
        let dst_set = self.set(set)?;
        let image_info = vk::DescriptorImageInfo::default()
            .image_view(image.view())
            .image_layout(descriptor_image_layout(descriptor_type));

        let write = vk::WriteDescriptorSet::default()
            .dst_set(dst_set)
            .dst_binding(binding)
            .descriptor_type(descriptor_type)
            .image_info(std::slice::from_ref(&image_info));

        device.update_descriptor_sets(&[write], &[]);
        Ok(())
    }

    /// Point `(set, binding)` at `buffer` from `offset` for the buffer's size.
    ///
    /// # Safety
    /// The device must be valid and the set must not be in use.
    pub unsafe fn write_buffer(
        &self,
        device: &ash::Device,
        set: u32,
        binding: u32,
        buffer: &Buffer,
        descriptor_type: vk::DescriptorType,
        offset: vk::DeviceSize,
    ) -> Result<()> {
        let dst_set = self.set(set)?;
        let buffer_info = vk::DescriptorBufferInfo::default()
            .buffer(buffer.handle())
            .offset(offset)
            .range(buffer.size());

        let write = vk::WriteDescriptorSet::default()
            .dst_set(dst_set)
            .dst_binding(binding)
            .descriptor_type(descriptor_type)
            .buffer_info(std::slice::from_ref(&buffer_info));

        device.update_descriptor_sets(&[write], &[]);
        Ok(())
    }

    /// Destroy the pool, layouts and samplers. The sets go with the pool.
    ///
    /// # Safety
    /// The device must be valid and no set may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if self.pool != vk::DescriptorPool::null() {
            device.destroy_descriptor_pool(self.pool, None);
            self.pool = vk::DescriptorPool::null();
        }
        self.sets.clear();
        for layout in self.layouts.drain(..) {
            device.destroy_descriptor_set_layout(layout, None);
        }
        for sampler in self.samplers.drain(..) {
            device.destroy_sampler(sampler, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sampler_is_linear_and_clamped() {
        let info = default_sampler_info();
        assert_eq!(info.mag_filter, vk::Filter::LINEAR);
        assert_eq!(info.min_filter, vk::Filter::LINEAR);
        assert_eq!(info.mipmap_mode, vk::SamplerMipmapMode::LINEAR);
        assert_eq!(info.address_mode_u, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.address_mode_w, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(info.anisotropy_enable, vk::FALSE);
        assert_eq!(info.max_anisotropy, 1.0);
        assert_eq!(info.compare_op, vk::CompareOp::ALWAYS);
        assert_eq!(info.max_lod, vk::LOD_CLAMP_NONE);
        assert_eq!(info.border_color, vk::BorderColor::INT_OPAQUE_BLACK);
    }

    #[test]
    fn overrides_apply_per_slot() {
        let mut overrides = SamplerOverrides::new();
        overrides.insert(
            (1, 2),
            default_sampler_info()
                .mag_filter(vk::Filter::NEAREST)
                .min_filter(vk::Filter::NEAREST),
        );
        assert_eq!(sampler_info_for(&overrides, 1, 2).mag_filter, vk::Filter::NEAREST);
        assert_eq!(sampler_info_for(&overrides, 2, 1).mag_filter, vk::Filter::LINEAR);
        assert_eq!(sampler_info_for(&overrides, 0, 0).min_filter, vk::Filter::LINEAR);
    }

    #[test]
    fn storage_images_use_general_layout() {
        assert_eq!(
            descriptor_image_layout(vk::DescriptorType::STORAGE_IMAGE),
            vk::ImageLayout::GENERAL
        );
        assert_eq!(
            descriptor_image_layout(vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            descriptor_image_layout(vk::DescriptorType::SAMPLED_IMAGE),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn empty_bundle_has_no_sets() {
        let bundle = DescriptorBundle::default();
        assert!(bundle.is_empty());
        assert!(bundle.layouts().is_empty());
    }

    #[test]
    fn unknown_set_is_an_error() {
        use ash::vk::Handle;

        let bundle = DescriptorBundle {
            sets: vec![vk::DescriptorSet::from_raw(11)],
            ..Default::default()
        };
        assert_eq!(bundle.set(0).unwrap(), vk::DescriptorSet::from_raw(11));
        assert!(matches!(bundle.set(1), Err(GpuError::InvalidState(_))));
        assert!(DescriptorBundle::default().set(0).is_err());
    }
}
