// Vertex buffer backed by gpu-allocator
//
// Host-visible memory, written once through the persistent mapping.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;
use super::VulkanDevice;

pub struct Buffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl Buffer {
    /// Create a CPU-visible buffer and fill it with `data`
    pub fn with_data<T: Pod>(
        device: Arc<VulkanDevice>,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as vk::DeviceSize;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer {}", name))?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
        let allocation = match device.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let mut created = Self {
            buffer,
            allocation: Some(allocation),
            device,
        };

        let allocation = created.allocation.as_mut().context("Buffer allocation missing")?;
        unsafe {
            created
                .device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }
        .with_context(|| format!("Failed to bind memory for {}", name))?;

        let mapped = allocation
            .mapped_slice_mut()
            .with_context(|| format!("Memory for {} is not host visible", name))?;
        mapped[..bytes.len()].copy_from_slice(bytes);

        log::debug!("Uploaded {} bytes to {}", size, name);

        Ok(created)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.free(allocation) {
                log::error!("{:#}", e);
            }
        }
    }
}
