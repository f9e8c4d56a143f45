// =============================================================================
// RENDERER - Ties the device, swapchain and frame scheduler together
// =============================================================================
//
// OWNERSHIP:
//   main deletion queue       frame syncs, command pool, descriptor set
//                             layout, shaders, sampler, texture, mesh
//   swapchain deletion queue  swapchain, depth image, render pass,
//                             framebuffers, pipeline, uniform buffers,
//                             descriptor pool, command buffers
//
// Both queues are only flushed behind a device-idle barrier. The swapchain
// queue is flushed and refilled on every recreation; the main queue once,
// at shutdown.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Instant;

use crate::assets::{Mesh, TextureData};
use crate::backend::buffer::{BufferDesc, GpuBuffer};
use crate::backend::commands::{allocate_command_buffers, create_command_pool, record_draw, DrawCommands};
use crate::backend::deletion_queue::create_all;
use crate::backend::descriptors::{
    create_descriptor_pool, create_descriptor_set_layout, create_descriptor_sets,
};
use crate::backend::image::{create_sampler, GpuImage, ImageDesc};
use crate::backend::pipeline::{create_framebuffers, create_graphics_pipeline, create_render_pass};
use crate::backend::shader::load_shader_module;
use crate::backend::{
    AcquireOutcome, DeletionQueue, FrameBackend, FrameOutcome, FrameScheduler, FrameSync,
    PresentOutcome, Swapchain, VulkanDevice,
};
use crate::config::{Config, GraphicsConfig};
use crate::uniforms::UniformBufferObject;
use crate::window::WindowContext;

/// Frame-in-flight renderer drawing one textured mesh.
pub struct Renderer {
    frames: FrameScheduler,
    ctx: RenderContext,
}

impl Renderer {
    /// Bring up the device and every GPU object needed to draw.
    pub fn new(window: &WindowContext, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let (display_handle, window_handle) = window.raw_handles();

        // Validation only in debug builds, and only if the config asks for it
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = VulkanDevice::new(
            &config.window.title,
            enable_validation,
            display_handle,
            window_handle,
        )?;

        let mut main_deletion = DeletionQueue::new("main");

        let frame_syncs = (0..config.graphics.frames_in_flight())
            .map(|_| FrameSync::new(&device))
            .collect::<Result<Vec<_>>>()
            .context("Failed to create frame synchronization objects")?;
        {
            let device = device.clone();
            let syncs = frame_syncs.clone();
            main_deletion.push_deleter(move || {
                for sync in &syncs {
                    sync.destroy(&device.device);
                }
            });
        }

        let command_pool = create_command_pool(&device)?;
        {
            let device = device.clone();
            main_deletion.push_deleter(move || unsafe {
                device.device.destroy_command_pool(command_pool, None);
            });
        }

        let descriptor_set_layout = create_descriptor_set_layout(&device)?;
        {
            let device = device.clone();
            main_deletion.push_deleter(move || unsafe {
                device
                    .device
                    .destroy_descriptor_set_layout(descriptor_set_layout, None);
            });
        }

        let vert_shader = load_shader_module(&device, &config.assets.vertex_shader)?;
        let frag_shader = load_shader_module(&device, &config.assets.fragment_shader)?;
        {
            let device = device.clone();
            main_deletion.push_deleter(move || unsafe {
                device.device.destroy_shader_module(frag_shader, None);
                device.device.destroy_shader_module(vert_shader, None);
            });
        }

        let sampler = create_sampler(&device)?;
        {
            let device = device.clone();
            main_deletion.push_deleter(move || unsafe {
                device.device.destroy_sampler(sampler, None);
            });
        }

        let texture_data = TextureData::load_or_checkerboard(&config.assets.texture)?;
        texture_data.validate()?;
        let texture = GpuImage::texture_with_data(
            &device,
            command_pool,
            "texture",
            texture_data.width,
            texture_data.height,
            &texture_data.pixels,
        )?;
        let texture_view = texture.view;
        {
            let device = device.clone();
            main_deletion.push_deleter(move || texture.destroy(&device));
        }

        let mesh = Mesh::load_or_cube(&config.assets.model)?;
        let vertex_buffer = GpuBuffer::with_data(
            &device,
            command_pool,
            "vertices",
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &mesh.vertices,
        )?;
        let index_buffer = GpuBuffer::with_data(
            &device,
            command_pool,
            "indices",
            vk::BufferUsageFlags::INDEX_BUFFER,
            &mesh.indices,
        )?;
        let mesh_buffers = MeshBuffers {
            vertex_buffer: vertex_buffer.buffer,
            index_buffer: index_buffer.buffer,
            index_count: mesh.index_count(),
        };
        {
            let device = device.clone();
            main_deletion.push_deleter(move || {
                index_buffer.destroy(&device);
                vertex_buffer.destroy(&device);
            });
        }

        let mut ctx = RenderContext {
            device,
            graphics: config.graphics.clone(),
            window_extent: window.extent(),
            started: Instant::now(),
            command_pool,
            descriptor_set_layout,
            vert_shader,
            frag_shader,
            sampler,
            texture_view,
            mesh: mesh_buffers,
            targets: None,
            main_deletion,
            swapchain_deletion: DeletionQueue::new("swapchain"),
        };

        let image_count = ctx.recreate_swapchain()?;
        let frames = FrameScheduler::new(frame_syncs, image_count)?;

        log::info!("Vulkan initialized successfully!");
        Ok(Self { frames, ctx })
    }

    /// Draw one frame, or skip it while the window has no drawable area.
    pub fn draw_frame(&mut self) -> Result<FrameOutcome> {
        if self.ctx.is_minimized() {
            return Ok(FrameOutcome::Skipped);
        }

        // Restored from a minimized state: nothing to draw into yet
        if self.ctx.targets.is_none() {
            self.frames.recreate(&mut self.ctx)?;
            if self.ctx.targets.is_none() {
                return Ok(FrameOutcome::Skipped);
            }
        }

        self.frames.draw_frame(&mut self.ctx)
    }

    /// New window size. The swapchain follows after the next present.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.ctx.window_extent = (width, height);

        if self.ctx.is_minimized() {
            log::debug!("Window minimized, rendering paused");
        } else if self.ctx.targets.is_some() {
            self.frames.request_recreate();
        }
    }

    /// Apply reloaded graphics settings. The clear color takes effect on the
    /// next recorded frame; present mode and format go through recreation.
    pub fn apply_graphics_config(&mut self, graphics: &GraphicsConfig) {
        if graphics.frames_in_flight() != self.frames.frames_in_flight() {
            log::warn!(
                "max_frames_in_flight changed to {}; restart to apply",
                graphics.frames_in_flight()
            );
        }

        let rebuild = self.ctx.graphics.needs_new_swapchain(graphics);
        self.ctx.graphics = graphics.clone();

        if rebuild {
            log::info!(
                "Presentation settings changed (present mode {}, format {}), recreating swapchain",
                graphics.present_mode,
                graphics.surface_format
            );
            self.frames.request_recreate();
        }
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.ctx.device.wait_idle()
    }
}

#[derive(Debug, Clone, Copy)]
struct MeshBuffers {
    vertex_buffer: vk::Buffer,
    index_buffer: vk::Buffer,
    index_count: u32,
}

/// Everything sized to the current swapchain. Handles here are owned by the
/// swapchain deletion queue, except the uniform buffers which are written
/// every frame and handed to the queue at teardown.
struct SwapchainTargets {
    swapchain: Swapchain,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    descriptor_sets: Vec<vk::DescriptorSet>,
    command_buffers: Vec<vk::CommandBuffer>,
    uniform_buffers: Vec<GpuBuffer>,
}

struct RenderContext {
    device: Arc<VulkanDevice>,
    graphics: GraphicsConfig,
    window_extent: (u32, u32),
    started: Instant,

    command_pool: vk::CommandPool,
    descriptor_set_layout: vk::DescriptorSetLayout,
    vert_shader: vk::ShaderModule,
    frag_shader: vk::ShaderModule,
    sampler: vk::Sampler,
    texture_view: vk::ImageView,
    mesh: MeshBuffers,

    targets: Option<SwapchainTargets>,

    main_deletion: DeletionQueue,
    swapchain_deletion: DeletionQueue,
}

impl RenderContext {
    fn is_minimized(&self) -> bool {
        self.window_extent.0 == 0 || self.window_extent.1 == 0
    }

    fn targets(&mut self) -> Result<&mut SwapchainTargets> {
        self.targets.as_mut().context("Swapchain not initialized")
    }

    /// Destroy everything sized to the swapchain. Device must be idle.
    fn release_swapchain_targets(&mut self) {
        if let Some(targets) = self.targets.take() {
            self.defer_uniform_buffers(targets.uniform_buffers);
        }
        self.swapchain_deletion.flush();
    }

    fn defer_uniform_buffers(&mut self, uniform_buffers: Vec<GpuBuffer>) {
        let device = self.device.clone();
        self.swapchain_deletion.push_deleter(move || {
            for buffer in uniform_buffers {
                buffer.destroy(&device);
            }
        });
    }

    /// Swapchain -> depth -> render pass -> framebuffers -> pipeline ->
    /// uniforms -> descriptors -> command buffers, each registered for
    /// deletion as soon as it exists.
    fn create_swapchain_targets(&mut self) -> Result<SwapchainTargets> {
        let device = self.device.clone();
        let (width, height) = self.window_extent;

        let swapchain = Swapchain::new(
            device.clone(),
            width,
            height,
            &self.graphics.swapchain_preferences(),
        )?;
        {
            let swapchain = swapchain.clone();
            self.swapchain_deletion
                .push_deleter(move || swapchain.destroy());
        }
        let extent = swapchain.extent;
        let image_count = swapchain.image_count();

        let depth = GpuImage::new(&device, ImageDesc::depth(extent, device.depth_format))?;
        let depth_view = depth.view;
        {
            let device = device.clone();
            self.swapchain_deletion
                .push_deleter(move || depth.destroy(&device));
        }

        let render_pass = create_render_pass(&device, swapchain.format, device.depth_format)?;
        {
            let device = device.clone();
            self.swapchain_deletion.push_deleter(move || unsafe {
                device.device.destroy_render_pass(render_pass, None);
            });
        }

        let framebuffers = create_framebuffers(
            &device,
            &swapchain.image_views,
            depth_view,
            render_pass,
            extent,
        )?;
        {
            let device = device.clone();
            let framebuffers = framebuffers.clone();
            self.swapchain_deletion.push_deleter(move || unsafe {
                for framebuffer in framebuffers {
                    device.device.destroy_framebuffer(framebuffer, None);
                }
            });
        }

        let (pipeline, pipeline_layout) = create_graphics_pipeline(
            &device,
            render_pass,
            extent,
            self.descriptor_set_layout,
            self.vert_shader,
            self.frag_shader,
        )?;
        {
            let device = device.clone();
            self.swapchain_deletion.push_deleter(move || unsafe {
                device.device.destroy_pipeline(pipeline, None);
                device.device.destroy_pipeline_layout(pipeline_layout, None);
            });
        }

        let uniform_buffers = create_all(
            image_count as usize,
            |_| GpuBuffer::new(&device, &BufferDesc::uniform("uniforms", UniformBufferObject::SIZE)),
            |buffer| buffer.destroy(&device),
        )?;

        // On failure the uniform buffers go to the swapchain queue with
        // everything else created above
        let (descriptor_sets, command_buffers) =
            match self.create_frame_bindings(&device, &uniform_buffers) {
                Ok(bindings) => bindings,
                Err(e) => {
                    self.defer_uniform_buffers(uniform_buffers);
                    return Err(e);
                }
            };

        log::info!(
            "Created {} command buffers for a {}x{} swapchain",
            command_buffers.len(),
            extent.width,
            extent.height
        );

        Ok(SwapchainTargets {
            swapchain,
            render_pass,
            framebuffers,
            pipeline,
            pipeline_layout,
            descriptor_sets,
            command_buffers,
            uniform_buffers,
        })
    }

    /// Descriptor pool and sets over the uniform buffers, plus one command
    /// buffer per swapchain image
    fn create_frame_bindings(
        &mut self,
        device: &Arc<VulkanDevice>,
        uniform_buffers: &[GpuBuffer],
    ) -> Result<(Vec<vk::DescriptorSet>, Vec<vk::CommandBuffer>)> {
        let image_count = uniform_buffers.len() as u32;

        let descriptor_pool = create_descriptor_pool(device, image_count)?;
        {
            let device = device.clone();
            self.swapchain_deletion.push_deleter(move || unsafe {
                device.device.destroy_descriptor_pool(descriptor_pool, None);
            });
        }

        let uniform_ranges: Vec<_> = uniform_buffers
            .iter()
            .map(|buffer| (buffer.buffer, UniformBufferObject::SIZE))
            .collect();
        let descriptor_sets = create_descriptor_sets(
            device,
            descriptor_pool,
            self.descriptor_set_layout,
            &uniform_ranges,
            self.texture_view,
            self.sampler,
        )?;

        let command_buffers = allocate_command_buffers(device, self.command_pool, image_count)?;
        {
            let device = device.clone();
            let command_pool = self.command_pool;
            let command_buffers = command_buffers.clone();
            self.swapchain_deletion.push_deleter(move || unsafe {
                device
                    .device
                    .free_command_buffers(command_pool, &command_buffers);
            });
        }

        Ok((descriptor_sets, command_buffers))
    }
}

impl FrameBackend for RenderContext {
    fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.device.wait_for_fences(&[fence], true, u64::MAX) }
            .context("Failed to wait for in-flight fence")
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[fence]) }
            .context("Failed to reset in-flight fence")
    }

    fn acquire_next_image(&mut self, image_available: vk::Semaphore) -> Result<AcquireOutcome> {
        self.targets()?
            .swapchain
            .acquire_next_image(u64::MAX, image_available)
    }

    fn record(&mut self, image_index: u32) -> Result<()> {
        let elapsed = self.started.elapsed().as_secs_f32();
        let targets = self.targets.as_mut().context("Swapchain not initialized")?;
        let image = image_index as usize;
        let extent = targets.swapchain.extent;

        let ubo = UniformBufferObject::spinning(elapsed, extent.width, extent.height);
        targets.uniform_buffers[image].write(&[ubo])?;

        record_draw(
            &self.device.device,
            targets.command_buffers[image],
            &DrawCommands {
                render_pass: targets.render_pass,
                framebuffer: targets.framebuffers[image],
                extent,
                pipeline: targets.pipeline,
                pipeline_layout: targets.pipeline_layout,
                descriptor_set: targets.descriptor_sets[image],
                vertex_buffer: self.mesh.vertex_buffer,
                index_buffer: self.mesh.index_buffer,
                index_count: self.mesh.index_count,
                clear_color: self.graphics.clear_color,
            },
        )
    }

    fn submit(&mut self, image_index: u32, sync: &FrameSync) -> Result<()> {
        let cmd = self.targets()?.command_buffers[image_index as usize];

        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [sync.render_finished];
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores) // Wait for image to be available
            .wait_dst_stage_mask(&wait_stages) // Only color output has to wait
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores); // Signal when done

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                sync.in_flight_fence, // Signaled when the GPU is done
            )
        }
        .context("Failed to submit draw commands")
    }

    fn present(&mut self, image_index: u32, render_finished: vk::Semaphore) -> Result<PresentOutcome> {
        let present_queue = self.device.present_queue;
        self.targets()?
            .swapchain
            .present(present_queue, image_index, &[render_finished])
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.device.wait_idle()
    }

    fn recreate_swapchain(&mut self) -> Result<u32> {
        self.release_swapchain_targets();

        if self.is_minimized() {
            log::debug!("Window has no drawable area, swapchain left empty");
            return Ok(0);
        }

        let targets = self.create_swapchain_targets()?;
        let image_count = targets.swapchain.image_count();
        self.targets = Some(targets);
        Ok(image_count)
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Wait for GPU to finish before destroying anything
        if let Err(e) = self.device.wait_idle() {
            log::error!("{:#}", e);
        }

        self.release_swapchain_targets();
        self.main_deletion.flush();

        log::info!("Cleanup complete");
    }
}
