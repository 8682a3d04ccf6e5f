// Explicit-backend core: owns the device, swapchain, pipeline slot and
// the per-frame command/sync state, and drives one frame per swap call.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::core::{DrawUniforms, Vertex2D};
use crate::vulkan::buffer::MeshBuffer;
use crate::vulkan::device::VulkanDevice;
use crate::vulkan::pipeline::{GraphicsPipeline, PipelineSlot};
use crate::vulkan::shader::{Shader, ShaderStage};
use crate::vulkan::support::SurfaceSupport;
use crate::vulkan::swapchain::{PresentOutcome, Swapchain, SwapchainState};
use crate::vulkan::sync::FrameSync;

const ACQUIRE_TIMEOUT_NS: u64 = u64::MAX;

pub struct VulkanCore {
    swapchain: Swapchain,
    state: SwapchainState,
    pipeline: PipelineSlot<GraphicsPipeline>,
    shader_paths: Option<(PathBuf, PathBuf)>,
    mesh: Option<MeshBuffer>,
    uniforms: DrawUniforms,
    clear_color: [f32; 4],
    preferred_present_mode: vk::PresentModeKHR,

    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    frame_sync: Vec<FrameSync>,
    current_frame: usize,
    max_frames_in_flight: usize,

    extent_hint: (u32, u32),
    minimized: bool,

    // Declared last: the device must outlive every field above, since all
    // of them registered teardown hooks in its child registry.
    device: Arc<VulkanDevice>,
}

impl VulkanCore {
    pub fn new(
        display: RawDisplayHandle,
        window: RawWindowHandle,
        width: u32,
        height: u32,
        config: &Config,
    ) -> Result<Self> {
        let device = VulkanDevice::new(
            display,
            window,
            &config.window.title,
            config.debug.validation_layers,
        )?;

        let support = SurfaceSupport::query(
            &device.surface_loader,
            device.physical_device,
            device.surface,
        )?;
        let preferred_present_mode = config.graphics.get_present_mode();
        let swapchain = Swapchain::new(
            &device,
            &support,
            preferred_present_mode,
            width,
            height,
            None,
        )?;

        let mut state = SwapchainState::Uninitialized;
        state.initialize()?;

        let max_frames_in_flight = config.graphics.max_frames_in_flight.max(1) as usize;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(
                device
                    .queue_indices
                    .graphics_family
                    .context("Missing graphics family")?,
            );
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let command_buffers =
            Self::allocate_command_buffers(&device, command_pool, max_frames_in_flight)?;

        let frame_sync = (0..max_frames_in_flight)
            .map(|_| FrameSync::new(&device))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            device,
            swapchain,
            state,
            pipeline: PipelineSlot::new(),
            shader_paths: None,
            mesh: None,
            uniforms: DrawUniforms::default(),
            clear_color: config.graphics.clear_color,
            preferred_present_mode,
            command_pool,
            command_buffers,
            frame_sync,
            current_frame: 0,
            max_frames_in_flight,
            extent_hint: (width, height),
            minimized: width == 0 || height == 0,
        })
    }

    fn allocate_command_buffers(
        device: &VulkanDevice,
        pool: vk::CommandPool,
        count: usize,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);

        unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")
    }

    /// Loads the SPIR-V pair and installs a fresh pipeline. The paths are
    /// remembered so recreation can rebuild the pipeline unprompted.
    pub fn create_pipeline(
        &mut self,
        vertex_path: impl Into<PathBuf>,
        fragment_path: impl Into<PathBuf>,
    ) -> Result<()> {
        let vertex_path = vertex_path.into();
        let fragment_path = fragment_path.into();
        self.install_pipeline(&vertex_path, &fragment_path)?;
        self.shader_paths = Some((vertex_path, fragment_path));
        Ok(())
    }

    fn install_pipeline(&mut self, vertex_path: &PathBuf, fragment_path: &PathBuf) -> Result<()> {
        let vertex = Shader::from_file(&self.device, vertex_path, ShaderStage::Vertex)?;
        let fragment = Shader::from_file(&self.device, fragment_path, ShaderStage::Fragment)?;

        let pipeline =
            GraphicsPipeline::new(&self.swapchain, &self.device.device, &vertex, &fragment)?;
        self.swapchain.create_framebuffers(pipeline.render_pass())?;
        self.pipeline.store(Arc::new(pipeline));
        Ok(())
    }

    pub fn upload_mesh(&mut self, vertices: &[Vertex2D], indices: &[u32]) -> Result<()> {
        // The previous mesh may still be referenced by an in-flight frame.
        if self.mesh.is_some() {
            self.device.wait_idle()?;
        }
        self.mesh = Some(MeshBuffer::new(&self.device, vertices, indices)?);
        Ok(())
    }

    pub fn set_uniforms(&mut self, uniforms: DrawUniforms) {
        self.uniforms = uniforms;
    }

    /// Resize notification from the windowing layer. A zero extent means
    /// the window is minimized and presentation pauses.
    pub fn framebuffer_resized(&mut self, width: u32, height: u32) {
        self.extent_hint = (width, height);
        self.minimized = width == 0 || height == 0;
        if !self.minimized {
            if let Err(e) = self.state.invalidate() {
                log::warn!("Ignoring resize notification: {e}");
            }
        }
    }

    /// Renders and presents one frame. Out-of-date swapchains are rebuilt
    /// and the acquire retried once; a second consecutive failure is a
    /// hard error since the surface is evidently unusable.
    pub fn swap_buffers(&mut self) -> Result<()> {
        if self.minimized {
            return Ok(());
        }

        if self.state.needs_recreation() {
            self.recreate()?;
            if self.minimized {
                return Ok(());
            }
        }

        let Some(pipeline) = self.pipeline.load() else {
            anyhow::bail!("No graphics pipeline installed")
        };

        let sync = &self.frame_sync[self.current_frame];
        let fence = sync.in_flight_fence;
        let image_available = sync.image_available;
        let render_finished = sync.render_finished;
        let command_buffer = self.command_buffers[self.current_frame];

        unsafe {
            self.device
                .device
                .wait_for_fences(&[fence], true, ACQUIRE_TIMEOUT_NS)
                .context("Failed to wait for frame fence")?;
        }

        let (image_index, outcome) = self
            .swapchain
            .acquire_next_image(ACQUIRE_TIMEOUT_NS, image_available)?;

        let (image_index, pipeline) = match outcome {
            PresentOutcome::Presented | PresentOutcome::Suboptimal => (image_index, pipeline),
            PresentOutcome::OutOfDate => {
                // One in-place recreation, then retry the acquire.
                self.state.invalidate()?;
                self.recreate()?;
                if self.minimized {
                    return Ok(());
                }
                let pipeline = self
                    .pipeline
                    .load()
                    .context("Pipeline missing after swapchain recreation")?;
                let (index, retry_outcome) = self
                    .swapchain
                    .acquire_next_image(ACQUIRE_TIMEOUT_NS, image_available)?;
                match retry_outcome {
                    PresentOutcome::Presented | PresentOutcome::Suboptimal => (index, pipeline),
                    outcome => {
                        anyhow::bail!(
                            "Swapchain unusable after recreation: {:?}",
                            outcome
                        )
                    }
                }
            }
            PresentOutcome::SurfaceLost => anyhow::bail!("Surface lost during acquire"),
        };

        unsafe {
            self.device
                .device
                .reset_fences(&[fence])
                .context("Failed to reset frame fence")?;
        }

        self.record_commands(command_buffer, &pipeline, image_index as usize)?;

        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [render_finished];
        let command_buffers = [command_buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info.build()], fence)
                .context("Failed to submit frame")?;
        }

        let present_outcome = self.swapchain.present(image_index, &signal_semaphores)?;
        self.state.note_outcome(present_outcome)?;

        self.current_frame = (self.current_frame + 1) % self.max_frames_in_flight;
        Ok(())
    }

    fn record_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline: &GraphicsPipeline,
        image_index: usize,
    ) -> Result<()> {
        let device = &self.device.device;

        unsafe {
            device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;

            let begin_info = vk::CommandBufferBeginInfo::builder();
            device
                .begin_command_buffer(command_buffer, &begin_info)
                .context("Failed to begin command buffer")?;

            let clear_values = [vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            }];
            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(pipeline.render_pass())
                .framebuffer(self.swapchain.framebuffer(image_index)?)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: pipeline.extent(),
                })
                .clear_values(&clear_values);

            device.cmd_begin_render_pass(
                command_buffer,
                &render_pass_info,
                vk::SubpassContents::INLINE,
            );
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.handle(),
            );
            device.cmd_push_constants(
                command_buffer,
                pipeline.layout(),
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                bytemuck::bytes_of(&self.uniforms),
            );

            if let Some(mesh) = &self.mesh {
                device.cmd_bind_vertex_buffers(
                    command_buffer,
                    0,
                    &[mesh.vertex_buffer()],
                    &[0],
                );
                device.cmd_bind_index_buffer(
                    command_buffer,
                    mesh.index_buffer(),
                    0,
                    vk::IndexType::UINT32,
                );
                device.cmd_draw_indexed(command_buffer, mesh.index_count(), 1, 0, 0, 0);
            }

            device.cmd_end_render_pass(command_buffer);
            device
                .end_command_buffer(command_buffer)
                .context("Failed to end command buffer")?;
        }

        Ok(())
    }

    /// Tears the stale generation down and brings up the next one against
    /// the surface's current extent.
    fn recreate(&mut self) -> Result<()> {
        let (width, height) = self.extent_hint;
        if width == 0 || height == 0 {
            // Minimized; stay invalidated until a real extent arrives.
            self.minimized = true;
            return Ok(());
        }

        let generation = self.state.begin_recreation()?;
        log::info!(
            "Recreating swapchain (generation {} -> {}): {}x{}",
            generation,
            generation + 1,
            width,
            height
        );

        self.device.wait_idle()?;
        self.pipeline.clear();

        let support = SurfaceSupport::query(
            &self.device.surface_loader,
            self.device.physical_device,
            self.device.surface,
        )?;

        let old_handle = self.swapchain.handle()?;
        let next = Swapchain::new(
            &self.device,
            &support,
            self.preferred_present_mode,
            width,
            height,
            Some(old_handle),
        )?;
        // Dropping the old swapchain cascades its pipelines away.
        self.swapchain = next;

        if let Some((vertex_path, fragment_path)) = self.shader_paths.clone() {
            self.install_pipeline(&vertex_path, &fragment_path)?;
        }

        self.state.finish_recreation()?;
        Ok(())
    }
}

impl Drop for VulkanCore {
    fn drop(&mut self) {
        // Let in-flight frames finish before anything is torn down.
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to drain device before teardown: {e}");
        }
        self.state.destroy();
        self.pipeline.clear();
        unsafe {
            self.device.device.destroy_command_pool(self.command_pool, None);
        }
    }
}
