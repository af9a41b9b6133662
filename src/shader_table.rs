use crate::error::{RayTracerError, Result};
use crate::gpu::{align_up, BufferDesc, BufferHandle, BufferUsage, RtDevice, TableRegion};

/// Shader identifier followed by the record's inline arguments.
#[derive(Debug, Clone, Copy)]
pub struct ShaderRecord<'a> {
    pub identifier: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> ShaderRecord<'a> {
    pub fn new(identifier: &'a [u8], payload: &'a [u8]) -> Self {
        Self {
            identifier,
            payload,
        }
    }

    /// Record without inline arguments.
    pub fn identifier_only(identifier: &'a [u8]) -> Self {
        Self::new(identifier, &[])
    }

    pub fn size(&self) -> usize {
        self.identifier.len() + self.payload.len()
    }
}

/// Fixed-capacity, fixed-stride array of shader records in a host-visible buffer.
#[derive(Debug)]
pub struct ShaderTable {
    name: String,
    buffer: BufferHandle,
    stride: u64,
    capacity: u32,
    len: u32,
}

impl ShaderTable {
    /// `record_size` is the identifier size plus the largest payload the table
    /// will hold; the stride rounds it up to the device record alignment.
    pub fn create<D: RtDevice>(
        device: &mut D,
        capacity: u32,
        record_size: u32,
        name: &str,
    ) -> Result<Self> {
        let stride = align_up(record_size as u64, device.shader_record_alignment() as u64);
        let buffer = device.create_buffer(&BufferDesc {
            size: stride * capacity as u64,
            usage: BufferUsage::ShaderTable,
            name,
        })?;
        log::debug!("{name}: {capacity} records, stride {stride}");
        Ok(Self {
            name: name.to_string(),
            buffer,
            stride,
            capacity,
            len: 0,
        })
    }

    /// Appends one record after the last. Unused stride bytes are zeroed.
    pub fn add_shader_record<D: RtDevice>(
        &mut self,
        device: &mut D,
        record: &ShaderRecord<'_>,
    ) -> Result<()> {
        if self.len == self.capacity {
            return Err(RayTracerError::ShaderTableFull {
                name: self.name.clone(),
                capacity: self.capacity,
            });
        }
        if record.size() as u64 > self.stride {
            return Err(RayTracerError::ShaderRecordTooLarge {
                name: self.name.clone(),
                size: record.size(),
                stride: self.stride,
            });
        }

        let mut bytes = Vec::with_capacity(self.stride as usize);
        bytes.extend_from_slice(record.identifier);
        bytes.extend_from_slice(record.payload);
        bytes.resize(self.stride as usize, 0);
        device.write_buffer(self.buffer, self.len as u64 * self.stride, &bytes)?;
        self.len += 1;
        Ok(())
    }

    /// Rewinds the append cursor. The backing buffer is kept.
    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Region covering the written records, as handed to a dispatch.
    pub fn region(&self) -> TableRegion {
        TableRegion {
            buffer: self.buffer,
            offset: 0,
            stride: self.stride,
            size: self.len as u64 * self.stride,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::null::NullDevice;

    #[test]
    fn test_stride_is_aligned() {
        let mut device = NullDevice::new();
        let table = ShaderTable::create(&mut device, 1, 32 + 76, "RayGenShaderTable").unwrap();
        assert_eq!(table.stride(), 128);
        assert!(table.is_empty());
        assert_eq!(device.buffer(table.buffer()).unwrap().contents.len(), 128);
    }

    #[test]
    fn test_add_beyond_capacity_rejected() {
        let mut device = NullDevice::new();
        let mut table = ShaderTable::create(&mut device, 2, 32, "MissShaderTable").unwrap();
        let id = [7u8; 32];
        table
            .add_shader_record(&mut device, &ShaderRecord::identifier_only(&id))
            .unwrap();
        table
            .add_shader_record(&mut device, &ShaderRecord::identifier_only(&id))
            .unwrap();
        let err = table
            .add_shader_record(&mut device, &ShaderRecord::identifier_only(&id))
            .unwrap_err();
        assert!(matches!(
            err,
            RayTracerError::ShaderTableFull { capacity: 2, .. }
        ));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_reset_reuses_storage() {
        let mut device = NullDevice::new();
        let mut table = ShaderTable::create(&mut device, 1, 48, "HitGroupShaderTable").unwrap();
        let created = device.stats().buffers_created;
        let id = [1u8; 32];

        for value in 0..4u8 {
            table.reset();
            let payload = [value; 16];
            table
                .add_shader_record(&mut device, &ShaderRecord::new(&id, &payload))
                .unwrap();
            let contents = device.buffer_contents(table.buffer()).unwrap();
            assert_eq!(&contents[32..48], &payload);
        }
        assert_eq!(device.stats().buffers_created, created);
        assert_eq!(table.region().size, table.stride());
    }

    #[test]
    fn test_oversized_record_rejected() {
        let mut device = NullDevice::new();
        let mut table = ShaderTable::create(&mut device, 1, 32, "MissShaderTable").unwrap();
        let id = [0u8; 32];
        let payload = [0u8; 4];
        assert!(matches!(
            table.add_shader_record(&mut device, &ShaderRecord::new(&id, &payload)),
            Err(RayTracerError::ShaderRecordTooLarge { size: 36, .. })
        ));
    }
}
