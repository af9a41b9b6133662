use ash::vk;
use std::ffi::CStr;

/// Logical device plus the ray tracing limits the backend needs.
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    pub max_sampler_anisotropy: f32,
    pub accel_structure: ash::khr::acceleration_structure::Device,
    pub rt_pipeline: ash::khr::ray_tracing_pipeline::Device,
    pub swapchain_loader: ash::khr::swapchain::Device,
}

const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 5] = [
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::acceleration_structure::NAME,
    ash::khr::deferred_host_operations::NAME,
    ash::khr::buffer_device_address::NAME,
    ash::khr::swapchain::NAME,
];

impl VulkanDevice {
    pub fn new(vk_instance: &super::VulkanInstance) -> Result<Self, Box<dyn std::error::Error>> {
        let instance = &vk_instance.instance;

        // First GPU with every extension and a graphics queue that can present
        let (physical_device, queue_family_index) = unsafe {
            let mut found = None;
            for pd in instance.enumerate_physical_devices()? {
                let exts = instance.enumerate_device_extension_properties(pd)?;
                let supported = REQUIRED_DEVICE_EXTENSIONS.iter().all(|req| {
                    exts.iter()
                        .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == *req)
                });
                let props = instance.get_physical_device_properties(pd);
                let name = CStr::from_ptr(props.device_name.as_ptr());
                if !supported {
                    log::debug!("Skipping {name:?}: missing ray tracing extensions");
                    continue;
                }

                let queue_family = instance
                    .get_physical_device_queue_family_properties(pd)
                    .iter()
                    .enumerate()
                    .position(|(idx, qf)| {
                        qf.queue_count > 0
                            && qf.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                            && vk_instance
                                .surface_loader
                                .get_physical_device_surface_support(
                                    pd,
                                    idx as u32,
                                    vk_instance.surface,
                                )
                                .unwrap_or(false)
                    });
                if let Some(idx) = queue_family {
                    log::info!("Selected GPU: {name:?}");
                    found = Some((pd, idx as u32));
                    break;
                }
            }
            found.ok_or("No GPU with ray tracing and presentation support found")?
        };

        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities);

        let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(true);
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .vulkan_memory_model(true);
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
            .ray_tracing_pipeline(true);

        let ext_name_ptrs: Vec<*const std::ffi::c_char> =
            REQUIRED_DEVICE_EXTENSIONS.iter().map(|e| e.as_ptr()).collect();

        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&ext_name_ptrs)
            .enabled_features(&features)
            .push_next(&mut features12)
            .push_next(&mut as_features)
            .push_next(&mut rt_features);

        let device = unsafe { instance.create_device(physical_device, &device_info, None)? };
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut rt_props);
        unsafe { instance.get_physical_device_properties2(physical_device, &mut props2) };
        let max_sampler_anisotropy = props2.properties.limits.max_sampler_anisotropy;

        log::info!(
            "RT properties: handle_size={}, handle_alignment={}, base_alignment={}, max_recursion={}",
            rt_props.shader_group_handle_size,
            rt_props.shader_group_handle_alignment,
            rt_props.shader_group_base_alignment,
            rt_props.max_ray_recursion_depth
        );

        let accel_structure = ash::khr::acceleration_structure::Device::new(instance, &device);
        let rt_pipeline = ash::khr::ray_tracing_pipeline::Device::new(instance, &device);
        let swapchain_loader = ash::khr::swapchain::Device::new(instance, &device);

        Ok(VulkanDevice {
            device,
            physical_device,
            queue,
            queue_family_index,
            memory_properties,
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
            max_sampler_anisotropy,
            accel_structure,
            rt_pipeline,
            swapchain_loader,
        })
    }

    pub fn create_command_pool(&self) -> Result<vk::CommandPool, vk::Result> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        unsafe { self.device.create_command_pool(&info, None) }
    }

    /// Allocates a primary command buffer and begins it for a single submission.
    pub fn begin_one_time(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer, vk::Result> {
        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = self.device.allocate_command_buffers(&alloc_info)?[0];
            self.device.begin_command_buffer(
                cmd,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
            Ok(cmd)
        }
    }

    /// Ends `cmd`, submits it when `submit` is set and waits for the queue
    /// to drain, then frees it.
    pub fn finish_one_time(
        &self,
        pool: vk::CommandPool,
        cmd: vk::CommandBuffer,
        submit: bool,
    ) -> Result<(), vk::Result> {
        let device = &self.device;
        let result = unsafe {
            device.end_command_buffer(cmd).and_then(|()| {
                if !submit {
                    return Ok(());
                }
                let submit = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
                device.queue_submit(self.queue, &[submit], vk::Fence::null())?;
                device.queue_wait_idle(self.queue)
            })
        };
        unsafe { device.free_command_buffers(pool, &[cmd]) };
        result
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
        }
    }
}
