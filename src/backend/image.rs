// GPU images: depth attachments and sampled textures
//
// A single image type; the variants differ only in their ImageDesc.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::buffer::{BufferDesc, GpuBuffer};
use super::commands::immediate_submit;
use super::VulkanDevice;

#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub name: &'static str,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

impl ImageDesc {
    pub fn depth(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self {
            name: "depth",
            extent,
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect: vk::ImageAspectFlags::DEPTH,
        }
    }

    pub fn texture_2d(name: &'static str, width: u32, height: u32) -> Self {
        Self {
            name,
            extent: vk::Extent2D { width, height },
            format: vk::Format::R8G8B8A8_SRGB,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }
}

pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub desc: ImageDesc,
    allocation: Allocation,
}

impl GpuImage {
    pub fn new(device: &VulkanDevice, desc: ImageDesc) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image '{}'", desc.name))?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = device
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: desc.name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for image '{}'", desc.name));
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        // Destroying a null view is a no-op, so destroy() also covers a
        // partially built image
        let mut gpu_image = Self {
            image,
            view: vk::ImageView::null(),
            desc,
            allocation,
        };

        let bound = unsafe {
            device.device.bind_image_memory(
                image,
                gpu_image.allocation.memory(),
                gpu_image.allocation.offset(),
            )
        };
        if let Err(e) = bound {
            gpu_image.destroy(device);
            return Err(e).context("Failed to bind image memory");
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(desc.subresource_range());

        match unsafe { device.device.create_image_view(&view_info, None) } {
            Ok(view) => gpu_image.view = view,
            Err(e) => {
                gpu_image.destroy(device);
                return Err(e)
                    .with_context(|| format!("Failed to create view for image '{}'", desc.name));
            }
        }

        Ok(gpu_image)
    }

    /// Sampled RGBA8 texture uploaded through a staging buffer
    pub fn texture_with_data(
        device: &VulkanDevice,
        command_pool: vk::CommandPool,
        name: &'static str,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<Self> {
        let mut staging =
            GpuBuffer::new(device, &BufferDesc::staging(rgba.len() as vk::DeviceSize))?;
        let texture = match staging
            .write(rgba)
            .and_then(|()| GpuImage::new(device, ImageDesc::texture_2d(name, width, height)))
        {
            Ok(texture) => texture,
            Err(e) => {
                staging.destroy(device);
                return Err(e);
            }
        };
        let range = texture.desc.subresource_range();

        let uploaded = immediate_submit(device, command_pool, |cmd| unsafe {
            let to_transfer = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(texture.image)
                .subresource_range(range)
                .build();

            device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                })
                .build();

            device.device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            let to_shader = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(texture.image)
                .subresource_range(range)
                .build();

            device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_shader],
            );
        });

        staging.destroy(device);
        if let Err(e) = uploaded {
            texture.destroy(device);
            return Err(e);
        }

        log::debug!("Uploaded texture '{}' ({}x{})", name, width, height);
        Ok(texture)
    }

    /// Release view, image and memory
    pub fn destroy(self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_image_view(self.view, None);
            device.device.destroy_image(self.image, None);
        }
        if let Err(e) = device.allocator.lock().free(self.allocation) {
            log::error!("Failed to free image memory: {}", e);
        }
    }
}

/// Linear, repeating, anisotropic sampler
pub fn create_sampler(device: &VulkanDevice) -> Result<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(true)
        .max_anisotropy(device.properties.limits.max_sampler_anisotropy)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .min_lod(0.0)
        .max_lod(0.0);

    unsafe { device.device.create_sampler(&sampler_info, None) }.context("Failed to create sampler")
}
