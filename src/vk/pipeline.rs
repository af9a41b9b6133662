use std::ffi::CString;
use std::io::Cursor;

use ash::vk;

use super::device::VulkanDevice;
use crate::error::DeviceError;
use crate::gpu::PipelineDesc;

// Shader group order inside the pipeline
const RAYGEN_GROUP: usize = 0;
const MISS_GROUP: usize = 1;
const HIT_GROUP: usize = 2;
const GROUP_COUNT: usize = 3;

pub struct RtPipeline {
    pub pipeline: vk::Pipeline,
    /// Export name of each group, indexed by group
    exports: [String; GROUP_COUNT],
    handles: Vec<u8>,
    handle_size: usize,
}

impl RtPipeline {
    /// Builds a pipeline from one SPIR-V module exporting the raygen, closest
    /// hit and miss entry points named in `desc`.
    pub fn new(
        vk_dev: &VulkanDevice,
        desc: &PipelineDesc<'_>,
        layout: vk::PipelineLayout,
    ) -> Result<Self, DeviceError> {
        let device = &vk_dev.device;
        let module = create_shader_module(device, desc.library, desc.name)?;

        let entry = |name: &str| {
            CString::new(name).map_err(|_| {
                DeviceError::InvalidPipeline(format!("{}: bad entry point {name:?}", desc.name))
            })
        };
        let (raygen, closest_hit, miss) =
            match (entry(desc.raygen), entry(desc.closest_hit), entry(desc.miss)) {
                (Ok(r), Ok(c), Ok(m)) => (r, c, m),
                (Err(err), _, _) | (_, Err(err), _) | (_, _, Err(err)) => {
                    unsafe { device.destroy_shader_module(module, None) };
                    return Err(err);
                }
            };

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::RAYGEN_KHR)
                .module(module)
                .name(&raygen),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::MISS_KHR)
                .module(module)
                .name(&miss),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR)
                .module(module)
                .name(&closest_hit),
        ];

        let general = |stage: u32| {
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(stage)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
        };
        let groups = [
            general(0),
            general(1),
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(2)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
        ];

        let depth = desc.max_recursion_depth.min(vk_dev.max_ray_recursion_depth);
        if depth < desc.max_recursion_depth {
            log::warn!(
                "{}: recursion depth {} clamped to device limit {depth}",
                desc.name,
                desc.max_recursion_depth
            );
        }

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(depth)
            .layout(layout);

        let created = unsafe {
            vk_dev.rt_pipeline.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            )
        };
        unsafe { device.destroy_shader_module(module, None) };
        let pipeline = created.map_err(|(_, err)| err)?[0];

        let handle_size = vk_dev.shader_group_handle_size as usize;
        let handles = match unsafe {
            vk_dev.rt_pipeline.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                GROUP_COUNT as u32,
                GROUP_COUNT * handle_size,
            )
        } {
            Ok(handles) => handles,
            Err(err) => {
                unsafe { device.destroy_pipeline(pipeline, None) };
                return Err(err.into());
            }
        };

        let mut exports: [String; GROUP_COUNT] = Default::default();
        exports[RAYGEN_GROUP] = desc.raygen.to_string();
        exports[MISS_GROUP] = desc.miss.to_string();
        exports[HIT_GROUP] = desc.hit_group.to_string();

        log::info!(
            "{}: ray tracing pipeline created ({GROUP_COUNT} groups, max recursion depth {depth})",
            desc.name
        );

        Ok(RtPipeline {
            pipeline,
            exports,
            handles,
            handle_size,
        })
    }

    /// Group handle of `export`, which names a raygen or miss entry point or
    /// the hit group.
    pub fn identifier(&self, export: &str) -> Result<Vec<u8>, DeviceError> {
        let group = self
            .exports
            .iter()
            .position(|name| name == export)
            .ok_or_else(|| DeviceError::UnknownExport(export.to_string()))?;
        let start = group * self.handle_size;
        Ok(self.handles[start..start + self.handle_size].to_vec())
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_pipeline(self.pipeline, None) };
    }
}

fn create_shader_module(
    device: &ash::Device,
    library: &[u8],
    name: &str,
) -> Result<vk::ShaderModule, DeviceError> {
    let code = ash::util::read_spv(&mut Cursor::new(library))
        .map_err(|err| DeviceError::InvalidPipeline(format!("{name}: {err}")))?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
    Ok(unsafe { device.create_shader_module(&create_info, None)? })
}
