//! Compute pipelines and specialization constants.
//!
//! A [`Task`] is a compiled compute pipeline bundled with its pipeline
//! layout, its per-set descriptor-set layouts, and the access metadata
//! reflected from the shader. Tasks are immutable after creation and may be
//! dispatched by any number of jobs.

use std::sync::Arc;

use ash::vk;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::reflect::ShaderInfo;
use crate::resource::DescriptorKind;
use crate::tracking::AccessFlags;

/// Builds a compute-stage descriptor set layout with one binding per kind,
/// binding slots equal to array index, `descriptorCount` 1.
pub(crate) fn create_descriptor_set_layout(
    device: &Device,
    kinds: &[DescriptorKind],
) -> Result<vk::DescriptorSetLayout> {
    let bindings: Vec<vk::DescriptorSetLayoutBinding> = kinds
        .iter()
        .enumerate()
        .map(|(i, kind)| vk::DescriptorSetLayoutBinding {
            binding: i as u32,
            descriptor_type: kind.descriptor_type(),
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            ..Default::default()
        })
        .collect();
    let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    unsafe { device.create_descriptor_set_layout(&info, None) }.map_err(Error::Allocation)
}

/// A compiled compute pipeline plus its reflected shader interface.
pub struct Task {
    device: Device,
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    info: Arc<ShaderInfo>,
}

impl Task {
    pub(crate) fn new(
        device: Device,
        module: vk::ShaderModule,
        info: Arc<ShaderInfo>,
        specialization: Option<&SpecializationInfo>,
    ) -> Result<Self> {
        let mut set_layouts = Vec::with_capacity(info.set_layouts.len());
        for kinds in &info.set_layouts {
            match create_descriptor_set_layout(&device, kinds) {
                Ok(layout) => set_layouts.push(layout),
                Err(e) => {
                    destroy_set_layouts(&device, &set_layouts);
                    return Err(e);
                }
            }
        }

        let push_constant_range = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            offset: 0,
            size: info.push_constant_size,
        };
        let mut layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let ranges = [push_constant_range];
        if info.push_constant_size > 0 {
            layout_info = layout_info.push_constant_ranges(&ranges);
        }
        let pipeline_layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                destroy_set_layouts(&device, &set_layouts);
                return Err(Error::Allocation(e));
            }
        };

        let raw_specialization = specialization.map(|s| s.raw_specialization_info());
        let mut stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main");
        if let Some(raw) = &raw_specialization {
            stage = stage.specialization_info(raw);
        }
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(pipeline_layout);

        let pipeline = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
        };
        let pipeline = match pipeline {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { device.destroy_pipeline_layout(pipeline_layout, None) };
                destroy_set_layouts(&device, &set_layouts);
                return Err(Error::Allocation(e));
            }
        };

        Ok(Self {
            device,
            pipeline,
            pipeline_layout,
            set_layouts,
            info,
        })
    }

    pub(crate) fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub(crate) fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub(crate) fn set_layout(&self, set: u32) -> Option<vk::DescriptorSetLayout> {
        self.set_layouts.get(set as usize).copied()
    }

    /// Reflected access flags, outer index = set, inner index = binding.
    pub(crate) fn access_flags(&self) -> &[Vec<AccessFlags>] {
        &self.info.access_flags
    }

    /// Number of descriptor sets the shader declares.
    pub fn set_count(&self) -> usize {
        self.info.set_layouts.len()
    }

    /// Size in bytes of the shader's push-constant block, 0 if absent.
    pub fn push_constant_size(&self) -> u32 {
        self.info.push_constant_size
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device
                .destroy_pipeline_layout(self.pipeline_layout, None);
        }
        destroy_set_layouts(&self.device, &self.set_layouts);
    }
}

fn destroy_set_layouts(device: &Device, layouts: &[vk::DescriptorSetLayout]) {
    for &layout in layouts {
        unsafe {
            device.destroy_descriptor_set_layout(layout, None);
        }
    }
}

/// Compile-time constants bound at pipeline creation.
///
/// Values are laid out contiguously with one map entry per pushed value.
/// [`SpecializationInfo::of`] assigns constant ids by declaration order;
/// [`push`](SpecializationInfo::push) takes explicit ids. `bool` values are
/// widened to `VkBool32` to match the SPIR-V representation.
#[derive(Debug, Clone, Default)]
pub struct SpecializationInfo {
    data: Vec<u8>,
    entries: Vec<vk::SpecializationMapEntry>,
}

impl SpecializationInfo {
    pub const fn new() -> Self {
        Self {
            data: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Builds specialization info from values in declaration order: value
    /// `i` gets constant id `i`.
    pub fn of<T: Copy + 'static>(values: &[T]) -> Self {
        let mut info = Self::new();
        for (i, value) in values.iter().enumerate() {
            info.push(i as u32, *value);
        }
        info
    }

    /// Appends a constant for `constant_id`.
    pub fn push<T: Copy + 'static>(&mut self, constant_id: u32, value: T) {
        if std::any::TypeId::of::<T>() == std::any::TypeId::of::<bool>() {
            // Size differs on the wire: SPIR-V spec constants for booleans
            // are 32 bits wide.
            let raw: vk::Bool32 = unsafe {
                let value: bool = std::mem::transmute_copy(&value);
                if value {
                    vk::TRUE
                } else {
                    vk::FALSE
                }
            };
            self.push_bytes(constant_id, &raw.to_ne_bytes());
            return;
        }
        let bytes = unsafe {
            std::slice::from_raw_parts(&value as *const T as *const u8, std::mem::size_of::<T>())
        };
        self.push_bytes(constant_id, bytes);
    }

    fn push_bytes(&mut self, constant_id: u32, bytes: &[u8]) {
        self.entries.push(vk::SpecializationMapEntry {
            constant_id,
            offset: self.data.len() as u32,
            size: bytes.len(),
        });
        self.data.extend_from_slice(bytes);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn entries(&self) -> &[vk::SpecializationMapEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn raw_specialization_info(&self) -> vk::SpecializationInfo<'_> {
        vk::SpecializationInfo::default()
            .map_entries(&self.entries)
            .data(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_laid_out_contiguously() {
        let info = SpecializationInfo::of(&[7u32, 9u32]);
        assert_eq!(info.data().len(), 8);
        assert_eq!(info.entries().len(), 2);
        assert_eq!(info.entries()[0].constant_id, 0);
        assert_eq!(info.entries()[0].offset, 0);
        assert_eq!(info.entries()[0].size, 4);
        assert_eq!(info.entries()[1].constant_id, 1);
        assert_eq!(info.entries()[1].offset, 4);
        assert_eq!(&info.data()[..4], &7u32.to_ne_bytes());
        assert_eq!(&info.data()[4..], &9u32.to_ne_bytes());
    }

    #[test]
    fn mixed_sizes_pack_back_to_back() {
        let mut info = SpecializationInfo::new();
        info.push(0, 1u16);
        info.push(3, 2.5f64);
        assert_eq!(info.entries()[0].size, 2);
        assert_eq!(info.entries()[1].offset, 2);
        assert_eq!(info.entries()[1].size, 8);
        assert_eq!(info.entries()[1].constant_id, 3);
    }

    #[test]
    fn bools_are_widened_to_bool32() {
        let mut info = SpecializationInfo::new();
        info.push(0, true);
        info.push(1, false);
        assert_eq!(info.data().len(), 8);
        assert_eq!(info.entries()[0].size, 4);
        assert_eq!(&info.data()[..4], &vk::TRUE.to_ne_bytes());
        assert_eq!(&info.data()[4..], &vk::FALSE.to_ne_bytes());
    }
}
