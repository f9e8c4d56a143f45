// GPU buffers for vertex, index, uniform and staging data
//
// One buffer type configured by a BufferDesc. Memory comes from
// gpu-allocator; host-visible buffers stay persistently mapped.

use anyhow::{ensure, Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::commands::immediate_submit;
use super::VulkanDevice;

/// How a buffer is created
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub name: &'static str,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

impl BufferDesc {
    pub fn uniform(name: &'static str, size: vk::DeviceSize) -> Self {
        Self {
            name,
            size,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            location: MemoryLocation::CpuToGpu,
        }
    }

    pub fn staging(size: vk::DeviceSize) -> Self {
        Self {
            name: "staging",
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
        }
    }

    /// Device-local buffer filled through a transfer
    pub fn device_local(name: &'static str, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            name,
            size,
            usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::GpuOnly,
        }
    }
}

pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Allocation,
}

impl GpuBuffer {
    pub fn new(device: &VulkanDevice, desc: &BufferDesc) -> Result<Self> {
        ensure!(desc.size > 0, "Buffer '{}' has zero size", desc.name);

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", desc.name))?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: desc.name,
                requirements,
                location: desc.location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for buffer '{}'", desc.name));
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let gpu_buffer = Self {
            buffer,
            size: desc.size,
            allocation,
        };

        let bound = unsafe {
            device.device.bind_buffer_memory(
                buffer,
                gpu_buffer.allocation.memory(),
                gpu_buffer.allocation.offset(),
            )
        };
        if let Err(e) = bound {
            gpu_buffer.destroy(device);
            return Err(e).context("Failed to bind buffer memory");
        }

        Ok(gpu_buffer)
    }

    /// Copy `data` to the start of a host-visible buffer
    pub fn write<T: bytemuck::Pod>(&mut self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        ensure!(
            bytes.len() as vk::DeviceSize <= self.size,
            "Write of {} bytes overflows buffer of {} bytes",
            bytes.len(),
            self.size
        );

        let mapped = self
            .allocation
            .mapped_slice_mut()
            .context("Buffer is not host visible")?;
        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Device-local buffer filled through a staging copy
    pub fn with_data<T: bytemuck::Pod>(
        device: &VulkanDevice,
        command_pool: vk::CommandPool,
        name: &'static str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;

        let mut staging = GpuBuffer::new(device, &BufferDesc::staging(size))?;
        let buffer = match staging
            .write(data)
            .and_then(|()| GpuBuffer::new(device, &BufferDesc::device_local(name, size, usage)))
        {
            Ok(buffer) => buffer,
            Err(e) => {
                staging.destroy(device);
                return Err(e);
            }
        };

        let copied = immediate_submit(device, command_pool, |cmd| unsafe {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            };
            device
                .device
                .cmd_copy_buffer(cmd, staging.buffer, buffer.buffer, &[region]);
        });

        // Staging memory is released whether or not the copy went through
        staging.destroy(device);
        if let Err(e) = copied {
            buffer.destroy(device);
            return Err(e);
        }

        log::debug!("Uploaded buffer '{}' ({} bytes)", name, size);
        Ok(buffer)
    }

    /// Release the buffer and its memory. Consumes self, so it can only happen once.
    pub fn destroy(self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_buffer(self.buffer, None);
        }
        if let Err(e) = device.allocator.lock().free(self.allocation) {
            log::error!("Failed to free buffer memory: {}", e);
        }
    }
}
