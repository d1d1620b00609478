use ash::vk;
use std::ffi::CString;

use super::spirv::{DescriptorKind, KernelReflection};
use crate::gpu::{ComputeError, Result};

/// A compiled compute pipeline plus the layout reflected from its module.
#[derive(Debug)]
pub struct VulkanKernel {
    pub(super) module: vk::ShaderModule,
    pub(super) set_layout: vk::DescriptorSetLayout,
    pub(super) layout: vk::PipelineLayout,
    pub(super) pipeline: vk::Pipeline,
    pub(super) entry_point: String,
    pub(super) reflection: KernelReflection,
}

pub(super) fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::Uniform => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::Storage => vk::DescriptorType::STORAGE_BUFFER,
    }
}

pub(super) fn create(
    device: &ash::Device,
    spirv: &[u32],
    entry_point: &str,
    reflection: KernelReflection,
) -> Result<VulkanKernel> {
    let name = CString::new(entry_point)
        .map_err(|_| ComputeError::invalid("entry point name contains a nul byte"))?;

    let module = unsafe {
        device
            .create_shader_module(&vk::ShaderModuleCreateInfo::builder().code(spirv).build(), None)
            .map_err(|res| match ComputeError::from(res) {
                ComputeError::OutOfMemory => ComputeError::OutOfMemory,
                _ => ComputeError::compile(format!("driver rejected the module: {}", res)),
            })?
    };

    let layout_bindings: Vec<vk::DescriptorSetLayoutBinding> = reflection
        .bindings
        .iter()
        .map(|b| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(b.binding)
                .descriptor_type(descriptor_type(b.kind))
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
                .build()
        })
        .collect();

    let set_layout = match unsafe {
        device.create_descriptor_set_layout(
            &vk::DescriptorSetLayoutCreateInfo::builder()
                .bindings(&layout_bindings)
                .build(),
            None,
        )
    } {
        Ok(layout) => layout,
        Err(err) => {
            unsafe { device.destroy_shader_module(module, None) };
            return Err(err.into());
        }
    };

    let set_layouts = [set_layout];
    let layout = match unsafe {
        device.create_pipeline_layout(
            &vk::PipelineLayoutCreateInfo::builder()
                .set_layouts(&set_layouts)
                .build(),
            None,
        )
    } {
        Ok(layout) => layout,
        Err(err) => {
            unsafe {
                device.destroy_descriptor_set_layout(set_layout, None);
                device.destroy_shader_module(module, None);
            }
            return Err(err.into());
        }
    };

    let stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(&name)
        .build();
    let pipeline_info = vk::ComputePipelineCreateInfo::builder()
        .layout(layout)
        .stage(stage)
        .build();

    let pipeline = match unsafe {
        device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    } {
        Ok(pipelines) => pipelines[0],
        Err((pipelines, err)) => {
            unsafe {
                for p in pipelines {
                    if p != vk::Pipeline::null() {
                        device.destroy_pipeline(p, None);
                    }
                }
                device.destroy_pipeline_layout(layout, None);
                device.destroy_descriptor_set_layout(set_layout, None);
                device.destroy_shader_module(module, None);
            }
            return Err(err.into());
        }
    };

    Ok(VulkanKernel {
        module,
        set_layout,
        layout,
        pipeline,
        entry_point: entry_point.to_string(),
        reflection,
    })
}

pub(super) fn destroy(device: &ash::Device, kernel: VulkanKernel) {
    unsafe {
        device.destroy_pipeline(kernel.pipeline, None);
        device.destroy_pipeline_layout(kernel.layout, None);
        device.destroy_descriptor_set_layout(kernel.set_layout, None);
        device.destroy_shader_module(kernel.module, None);
    }
}
