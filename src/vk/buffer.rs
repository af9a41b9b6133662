use ash::vk;

use crate::error::DeviceError;

/// A buffer with its own dedicated allocation.
///
/// `base_alignment` shifts the usable range so its device address is a
/// multiple of it; shader binding tables need this.
pub struct BufferResource {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub host_visible: bool,
    offset: vk::DeviceSize,
    address: Option<u64>,
}

impl BufferResource {
    pub fn new(
        device: &ash::Device,
        mem_props: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
        base_alignment: vk::DeviceSize,
    ) -> Result<Self, DeviceError> {
        let padded = size.max(1) + base_alignment.saturating_sub(1);
        unsafe {
            let buffer_info = vk::BufferCreateInfo::default()
                .size(padded)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);

            let buffer = device.create_buffer(&buffer_info, None)?;
            let mem_reqs = device.get_buffer_memory_requirements(buffer);

            let Some(memory_index) =
                find_memory_type(mem_props, mem_reqs.memory_type_bits, memory_flags)
            else {
                device.destroy_buffer(buffer, None);
                return Err(DeviceError::Unsupported(format!(
                    "no memory type with {memory_flags:?}"
                )));
            };

            let mut alloc_flags = vk::MemoryAllocateFlagsInfo::default()
                .flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);

            let mut alloc_info = vk::MemoryAllocateInfo::default()
                .allocation_size(mem_reqs.size)
                .memory_type_index(memory_index);

            let device_address = usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
            if device_address {
                alloc_info = alloc_info.push_next(&mut alloc_flags);
            }

            let memory = match device.allocate_memory(&alloc_info, None) {
                Ok(memory) => memory,
                Err(err) => {
                    device.destroy_buffer(buffer, None);
                    return Err(err.into());
                }
            };
            device.bind_buffer_memory(buffer, memory, 0)?;

            let (offset, address) = if device_address {
                let base = get_buffer_device_address(device, buffer);
                let aligned = align(base, base_alignment.max(1));
                (aligned - base, Some(aligned))
            } else {
                (0, None)
            };

            Ok(BufferResource {
                buffer,
                memory,
                size,
                host_visible: memory_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
                offset,
                address,
            })
        }
    }

    /// Copies `data` to `offset` through a temporary mapping.
    pub fn store_at(
        &self,
        device: &ash::Device,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let len = data.len() as u64;
        if offset + len > self.size {
            return Err(DeviceError::WriteOutOfBounds {
                offset,
                len: data.len(),
                size: self.size,
            });
        }
        if len == 0 {
            return Ok(());
        }
        unsafe {
            let ptr = device.map_memory(
                self.memory,
                self.offset + offset,
                len,
                vk::MemoryMapFlags::empty(),
            )?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len());
            device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Device address of the first usable byte.
    pub fn address(&self) -> Result<u64, DeviceError> {
        self.address.ok_or_else(|| {
            DeviceError::InvalidCommand("buffer was created without a device address".to_string())
        })
    }

    /// Offset of the usable range within the `vk::Buffer`.
    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

pub fn get_buffer_device_address(device: &ash::Device, buffer: vk::Buffer) -> u64 {
    let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
    unsafe { device.get_buffer_device_address(&info) }
}

pub fn find_memory_type(
    mem_props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..mem_props.memory_type_count).find(|&i| {
        (type_bits >> i) & 1 == 1
            && mem_props.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

fn align(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}
