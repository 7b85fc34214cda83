//! Shader stage preparation.

use crate::error::{GpuError, Result};
use ash::vk;

/// How shader code reaches pipeline creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderModuleStrategy {
    /// Code is chained into the stage create info (`VK_KHR_maintenance5`).
    Inline,
    /// A `VkShaderModule` is created before and destroyed after pipeline creation.
    ModuleObject,
}

impl ShaderModuleStrategy {
    /// Pick the strategy for a device.
    pub fn detect(maintenance5_enabled: bool) -> Self {
        if maintenance5_enabled {
            Self::Inline
        } else {
            Self::ModuleObject
        }
    }
}

/// Specialization constants for one stage.
#[derive(Debug, Clone, Copy)]
pub struct Specialization<'a> {
    pub entries: &'a [vk::SpecializationMapEntry],
    pub data: &'a [u8],
}

/// A shader stage as handed to pipeline construction.
#[derive(Debug, Clone, Copy)]
pub struct ShaderStage<'a> {
    pub stage: vk::ShaderStageFlags,
    /// SPIR-V words; the entry point is always `main`.
    pub code: &'a [u32],
    pub specialization: Option<Specialization<'a>>,
}

impl<'a> ShaderStage<'a> {
    /// A stage without specialization constants.
    pub fn new(stage: vk::ShaderStageFlags, code: &'a [u32]) -> Self {
        Self {
            stage,
            code,
            specialization: None,
        }
    }

    /// Attach specialization constants.
    pub fn specialize(mut self, entries: &'a [vk::SpecializationMapEntry], data: &'a [u8]) -> Self {
        self.specialization = Some(Specialization { entries, data });
        self
    }
}

/// A stage ready to be referenced from a pipeline create info.
pub(crate) struct PreparedStage<'a> {
    stage: vk::ShaderStageFlags,
    module: vk::ShaderModule,
    module_info: vk::ShaderModuleCreateInfo<'a>,
    specialization: Option<vk::SpecializationInfo<'a>>,
}

impl<'a> PreparedStage<'a> {
    /// Prepare `stage` according to `strategy`.
    ///
    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn new(
        device: &ash::Device,
        strategy: ShaderModuleStrategy,
        stage: &ShaderStage<'a>,
    ) -> Result<Self> {
        let module_info = vk::ShaderModuleCreateInfo::default().code(stage.code);
        let module = match strategy {
            ShaderModuleStrategy::Inline => vk::ShaderModule::null(),
            ShaderModuleStrategy::ModuleObject => device
                .create_shader_module(&module_info, None)
                .map_err(|e| GpuError::PipelineCreation(format!("Shader module: {e}")))?,
        };
        let specialization = stage.specialization.map(|spec| {
            vk::SpecializationInfo::default()
                .map_entries(spec.entries)
                .data(spec.data)
        });
        Ok(Self {
            stage: stage.stage,
            module,
            module_info,
            specialization,
        })
    }

    /// Stage create info borrowing this preparation.
    pub(crate) fn create_info(&mut self) -> vk::PipelineShaderStageCreateInfo<'_> {
        let mut info = vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage)
            .name(c"main");
        if let Some(spec) = &self.specialization {
            info = info.specialization_info(spec);
        }
        if self.module == vk::ShaderModule::null() {
            info.push_next(&mut self.module_info)
        } else {
            info.module(self.module)
        }
    }

    /// Destroy the module object, if one was created.
    ///
    /// # Safety
    /// Pipeline creation using this stage must have completed.
    pub(crate) unsafe fn release(self, device: &ash::Device) {
        if self.module != vk::ShaderModule::null() {
            device.destroy_shader_module(self.module, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_follows_maintenance5() {
        assert_eq!(ShaderModuleStrategy::detect(true), ShaderModuleStrategy::Inline);
        assert_eq!(
            ShaderModuleStrategy::detect(false),
            ShaderModuleStrategy::ModuleObject
        );
    }

    #[test]
    fn specialization_is_attached() {
        let entries = [vk::SpecializationMapEntry {
            constant_id: 0,
            offset: 0,
            size: 4,
        }];
        let data = 16u32.to_ne_bytes();
        let stage = ShaderStage::new(vk::ShaderStageFlags::COMPUTE, &[]).specialize(&entries, &data);
        let spec = stage.specialization.unwrap();
        assert_eq!(spec.entries.len(), 1);
        assert_eq!(spec.data, &data);
    }
}
