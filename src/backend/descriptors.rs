// Descriptor set layout, pool and per-image sets
//
// binding 0: uniform buffer (vertex stage)
// binding 1: combined image sampler (fragment stage)

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;

pub fn create_descriptor_set_layout(device: &VulkanDevice) -> Result<vk::DescriptorSetLayout> {
    let bindings = [
        vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(1)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ];

    let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

    unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
        .context("Failed to create descriptor set layout")
}

/// Pool sized for one set per swapchain image
pub fn create_descriptor_pool(device: &VulkanDevice, set_count: u32) -> Result<vk::DescriptorPool> {
    let pool_sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: set_count,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: set_count,
        },
    ];

    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .pool_sizes(&pool_sizes)
        .max_sets(set_count);

    unsafe { device.device.create_descriptor_pool(&pool_info, None) }
        .context("Failed to create descriptor pool")
}

/// Allocate one set per uniform buffer and point it at that buffer and the texture.
/// Sets are freed with their pool.
pub fn create_descriptor_sets(
    device: &VulkanDevice,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    uniform_buffers: &[(vk::Buffer, vk::DeviceSize)],
    texture_view: vk::ImageView,
    sampler: vk::Sampler,
) -> Result<Vec<vk::DescriptorSet>> {
    let layouts = vec![layout; uniform_buffers.len()];
    let alloc_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(&layouts);

    let sets = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
        .context("Failed to allocate descriptor sets")?;

    for (&set, &(buffer, range)) in sets.iter().zip(uniform_buffers) {
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range,
        }];
        let image_info = [vk::DescriptorImageInfo {
            sampler,
            image_view: texture_view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];

        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&image_info)
                .build(),
        ];

        unsafe { device.device.update_descriptor_sets(&writes, &[]) };
    }

    Ok(sets)
}
