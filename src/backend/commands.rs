// Command recording
//
// Per-image draw command buffers, re-recorded each frame for the image
// that was acquired, plus one-shot submissions for uploads.

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;

/// Everything one draw needs, all plain handles
#[derive(Debug, Clone, Copy)]
pub struct DrawCommands {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
    pub clear_color: [f32; 4],
}

pub fn create_command_pool(device: &VulkanDevice) -> Result<vk::CommandPool> {
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .queue_family_index(device.queue_families.graphics)
        // RESET: every image's buffer is re-recorded on its own
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

    unsafe { device.device.create_command_pool(&pool_info, None) }
        .context("Failed to create command pool")
}

/// One primary command buffer per swapchain image
pub fn allocate_command_buffers(
    device: &VulkanDevice,
    command_pool: vk::CommandPool,
    count: u32,
) -> Result<Vec<vk::CommandBuffer>> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(count);

    unsafe { device.device.allocate_command_buffers(&alloc_info) }
        .context("Failed to allocate command buffers")
}

/// Reset `cmd` and record one render pass drawing the mesh.
pub fn record_draw(device: &ash::Device, cmd: vk::CommandBuffer, draw: &DrawCommands) -> Result<()> {
    let clear_values = [
        vk::ClearValue {
            color: vk::ClearColorValue {
                float32: draw.clear_color,
            },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ];

    let render_pass_info = vk::RenderPassBeginInfo::builder()
        .render_pass(draw.render_pass)
        .framebuffer(draw.framebuffer)
        .render_area(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: draw.extent,
        })
        .clear_values(&clear_values);

    unsafe {
        device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .context("Failed to reset command buffer")?;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device.begin_command_buffer(cmd, &begin_info)?;

        device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, draw.pipeline);
        device.cmd_bind_vertex_buffers(cmd, 0, &[draw.vertex_buffer], &[0]);
        device.cmd_bind_index_buffer(cmd, draw.index_buffer, 0, vk::IndexType::UINT32);
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            draw.pipeline_layout,
            0,
            &[draw.descriptor_set],
            &[],
        );
        device.cmd_draw_indexed(cmd, draw.index_count, 1, 0, 0, 0);
        device.cmd_end_render_pass(cmd);

        device
            .end_command_buffer(cmd)
            .context("Failed to end command buffer")?;
    }

    Ok(())
}

/// Record with `record`, submit on the graphics queue and block until done.
pub fn immediate_submit<F>(device: &VulkanDevice, command_pool: vk::CommandPool, record: F) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    let cmd = allocate_command_buffers(device, command_pool, 1)?[0];
    let fence = unsafe { device.device.create_fence(&vk::FenceCreateInfo::default(), None) }
        .context("Failed to create upload fence")?;

    let result = (|| -> Result<()> {
        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.device.begin_command_buffer(cmd, &begin_info)?;

            record(cmd);

            device.device.end_command_buffer(cmd)?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            device
                .device
                .queue_submit(device.graphics_queue, &[submit_info.build()], fence)
                .context("Failed to submit upload commands")?;
            device.device.wait_for_fences(&[fence], true, u64::MAX)?;
        }
        Ok(())
    })();

    unsafe {
        device.device.destroy_fence(fence, None);
        device.device.free_command_buffers(command_pool, &[cmd]);
    }

    result
}
