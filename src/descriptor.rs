use crate::error::{RayTracerError, Result};
use crate::gpu::{Descriptor, DescriptorPoolKind, DescriptorTable, RtDevice};

/// Linear allocator over the CBV/SRV/UAV and sampler descriptor pools.
///
/// Tables are reserved first and written later, so that a structure can be
/// told its descriptor slot before the resource behind it exists.
#[derive(Debug)]
pub struct DescriptorHeap {
    capacity: [u32; 2],
    next: [u32; 2],
}

fn pool_index(pool: DescriptorPoolKind) -> usize {
    match pool {
        DescriptorPoolKind::CbvSrvUav => 0,
        DescriptorPoolKind::Sampler => 1,
    }
}

impl DescriptorHeap {
    pub fn new(cbv_srv_uav_capacity: u32, sampler_capacity: u32) -> Self {
        Self {
            capacity: [cbv_srv_uav_capacity, sampler_capacity],
            next: [0, 0],
        }
    }

    pub fn reserve(&mut self, pool: DescriptorPoolKind, count: u32) -> Result<DescriptorTable> {
        let i = pool_index(pool);
        let available = self.capacity[i] - self.next[i];
        if count > available {
            return Err(RayTracerError::DescriptorPoolExhausted {
                pool,
                requested: count,
                available,
            });
        }
        let table = DescriptorTable {
            pool,
            first: self.next[i],
            count,
        };
        self.next[i] += count;
        Ok(table)
    }

    pub fn write<D: RtDevice>(
        &self,
        device: &mut D,
        table: &DescriptorTable,
        descriptors: &[Descriptor],
    ) -> Result<()> {
        debug_assert_eq!(descriptors.len() as u32, table.count);
        device.write_descriptors(table.pool, table.first, descriptors)?;
        Ok(())
    }

    /// Reserve and write in one step.
    pub fn allocate_table<D: RtDevice>(
        &mut self,
        device: &mut D,
        pool: DescriptorPoolKind,
        descriptors: &[Descriptor],
    ) -> Result<DescriptorTable> {
        let table = self.reserve(pool, descriptors.len() as u32)?;
        self.write(device, &table, descriptors)?;
        Ok(table)
    }

    pub fn used(&self, pool: DescriptorPoolKind) -> u32 {
        self.next[pool_index(pool)]
    }
}
