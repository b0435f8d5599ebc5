// =============================================================================
// CUBE RENDERER
// =============================================================================
//
// Owns every Vulkan object needed to put the cube on screen and drives the
// per-frame acquire -> submit -> present loop.
//
// CREATION ORDER (teardown runs backwards):
// ┌─────────────────────────────────────────────────────────────────┐
// │  VulkanDevice (instance, messenger, surface, device, allocator) │
// │    └── Swapchain + image views                                  │
// │          └── Depth image                                        │
// │                └── Render pass + framebuffers                   │
// │                      └── Pipeline + vertex buffer               │
// │                            └── Command pool + buffers           │
// │                                  └── Semaphores + fences        │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::buffer::Buffer;
use crate::backend::commands::{self, CubeDraw};
use crate::backend::image::{self, DepthImage};
use crate::backend::pipeline::{self, GraphicsPipeline};
use crate::backend::swapchain::{BufferingMode, SwapchainDesc};
use crate::backend::sync::{FrameSlot, FrameSync, ImageSync};
use crate::backend::{Swapchain, VulkanDevice};
use crate::config::Config;
use crate::cube::{self, Camera, PushConstants};

/// Outcome of a `draw_frame` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    Skipped,
}

/// Settings the renderer keeps from the config after startup
#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub app_name: String,
    pub enable_validation: bool,
    pub present_mode: vk::PresentModeKHR,
    pub buffering: BufferingMode,
    pub max_frames_in_flight: usize,
    pub clear_color: [f32; 4],
    pub camera: Camera,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
}

impl RendererSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            app_name: config.window.title.clone(),
            // Validation only in debug builds
            enable_validation: cfg!(debug_assertions) && config.debug.validation_layers,
            present_mode: config.present_mode(),
            buffering: config.buffering_mode(),
            max_frames_in_flight: config.max_frames_in_flight(),
            clear_color: config.graphics.clear_color,
            camera: Camera::new(config.camera.eye, config.camera.fov_degrees),
            vertex_shader: config.shaders.vertex_path(),
            fragment_shader: config.shaders.fragment_path(),
        }
    }
}

/// What `draw_frame` does before touching the swapchain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePrep {
    Skip,
    Rebuild,
    Draw,
}

/// Window size and whether the swapchain still matches it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceState {
    size: (u32, u32),
    needs_rebuild: bool,
}

impl SurfaceState {
    pub fn new(width: u32, height: u32) -> Self {
        let size = (width, height);
        Self {
            size,
            // Nothing is built while minimized, so the first real size must build it
            needs_rebuild: width == 0 || height == 0,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn is_minimized(&self) -> bool {
        self.size.0 == 0 || self.size.1 == 0
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.size = (width, height);
        if !self.is_minimized() {
            self.needs_rebuild = true;
        }
    }

    /// Acquire or present reported out of date or suboptimal
    pub fn mark_out_of_date(&mut self) {
        self.needs_rebuild = true;
    }

    pub fn rebuilt(&mut self) {
        self.needs_rebuild = false;
    }

    pub fn next_frame(&self) -> FramePrep {
        if self.is_minimized() {
            FramePrep::Skip
        } else if self.needs_rebuild() {
            FramePrep::Rebuild
        } else {
            FramePrep::Draw
        }
    }
}

/// Format-dependent objects a swapchain rebuild has to (re)create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RebuildPlan {
    render_pass: bool,
    pipeline: bool,
}

impl RebuildPlan {
    /// `render_pass_format` is the format the live render pass was built for,
    /// `None` when there is none (first build, or a rebuild that failed midway).
    fn new(render_pass_format: Option<vk::Format>, swapchain_format: vk::Format, has_pipeline: bool) -> Self {
        let render_pass = render_pass_format != Some(swapchain_format);
        Self {
            render_pass,
            pipeline: render_pass || !has_pipeline,
        }
    }
}

pub struct Renderer {
    settings: RendererSettings,

    // ─────────────────────────────────────────────────────────────────────────
    // SYNCHRONIZATION
    // ─────────────────────────────────────────────────────────────────────────
    frame_sync: Vec<FrameSync>,
    frame_slot: FrameSlot,
    image_sync: ImageSync,
    wait_stages: [vk::PipelineStageFlags; 1],

    // ─────────────────────────────────────────────────────────────────────────
    // COMMANDS
    // ─────────────────────────────────────────────────────────────────────────
    command_pool: vk::CommandPool,
    /// One per framebuffer, re-recorded after every rebuild
    command_buffers: Vec<vk::CommandBuffer>,

    // ─────────────────────────────────────────────────────────────────────────
    // PIPELINE & GEOMETRY (Option so Drop can release them in order)
    // ─────────────────────────────────────────────────────────────────────────
    vertex_buffer: Option<Buffer>,
    pipeline: Option<GraphicsPipeline>,

    // ─────────────────────────────────────────────────────────────────────────
    // RENDER TARGETS
    // ─────────────────────────────────────────────────────────────────────────
    framebuffers: Vec<vk::Framebuffer>,
    render_pass: vk::RenderPass,
    render_pass_format: Option<vk::Format>,
    depth_format: vk::Format,
    depth_image: Option<DepthImage>,
    swapchain: Option<Swapchain>,

    // Dropped last
    device: Arc<VulkanDevice>,

    surface: SurfaceState,
}

impl Renderer {
    /// Build every resource in creation order.
    ///
    /// Anything created before a failing step is released by the partially
    /// built renderer's `Drop`.
    pub fn new<W>(settings: RendererSettings, window: &W, width: u32, height: u32) -> Result<Self>
    where
        W: HasRawDisplayHandle + HasRawWindowHandle,
    {
        log::info!("Initializing Vulkan...");

        let device =
            VulkanDevice::new(&settings.app_name, settings.enable_validation, window)?;
        let depth_format = image::find_depth_format(&device)?;
        log::info!("Depth format: {:?}", depth_format);

        let max_frames = settings.max_frames_in_flight;
        let mut renderer = Self {
            settings,
            frame_sync: Vec::with_capacity(max_frames),
            frame_slot: FrameSlot::new(max_frames),
            image_sync: ImageSync::default(),
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            command_pool: vk::CommandPool::null(),
            command_buffers: Vec::new(),
            vertex_buffer: None,
            pipeline: None,
            framebuffers: Vec::new(),
            render_pass: vk::RenderPass::null(),
            render_pass_format: None,
            depth_format,
            depth_image: None,
            swapchain: None,
            device,
            surface: SurfaceState::new(width, height),
        };

        renderer.init()?;

        log::info!("Vulkan initialized successfully!");
        Ok(renderer)
    }

    fn init(&mut self) -> Result<()> {
        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Swapchain, depth, render pass, framebuffers, pipeline
        // ─────────────────────────────────────────────────────────────────────
        let minimized = self.surface.is_minimized();
        if minimized {
            log::info!("Window starts minimized, deferring swapchain creation");
        } else {
            self.build_swapchain_resources()?;
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Vertex data
        // ─────────────────────────────────────────────────────────────────────
        self.vertex_buffer = Some(Buffer::with_data(
            self.device.clone(),
            "cube vertices",
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &cube::cube_vertices(),
        )?);

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Commands
        // ─────────────────────────────────────────────────────────────────────
        self.command_pool = commands::create_command_pool(&self.device)?;
        if !minimized {
            self.build_frame_resources()?;
            self.surface.rebuilt();
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Per-slot sync objects (not recreated on resize)
        // ─────────────────────────────────────────────────────────────────────
        for _ in 0..self.settings.max_frames_in_flight {
            let sync = FrameSync::new(&self.device)?;
            self.frame_sync.push(sync);
        }

        Ok(())
    }

    fn log_swapchain(&self) {
        if let Some(ref swapchain) = self.swapchain {
            log::info!(
                "Swapchain ready: {}x{}, {} images, {:?}",
                swapchain.extent.width,
                swapchain.extent.height,
                swapchain.images.len(),
                swapchain.present_mode
            );
        }
    }

    fn swapchain_desc(&self, width: u32, height: u32) -> SwapchainDesc {
        SwapchainDesc {
            width,
            height,
            present_mode: self.settings.present_mode,
            buffering: self.settings.buffering,
        }
    }

    fn create_pipeline(&self) -> Result<GraphicsPipeline> {
        GraphicsPipeline::new(
            self.device.clone(),
            self.render_pass,
            &self.settings.vertex_shader,
            &self.settings.fragment_shader,
        )
    }

    fn create_framebuffers(&mut self) -> Result<()> {
        let swapchain = self.swapchain.as_ref().context("Swapchain not initialized")?;
        let depth_image = self.depth_image.as_ref().context("Depth image not initialized")?;

        self.framebuffers = pipeline::create_framebuffers(
            &self.device,
            &swapchain.image_views,
            depth_image.view,
            self.render_pass,
            swapchain.extent,
        )?;
        Ok(())
    }

    fn allocate_command_buffers(&mut self) -> Result<()> {
        if !self.command_buffers.is_empty() {
            unsafe {
                self.device
                    .device
                    .free_command_buffers(self.command_pool, &self.command_buffers);
            }
            self.command_buffers.clear();
        }

        self.command_buffers = commands::allocate_command_buffers(
            &self.device,
            self.command_pool,
            self.framebuffers.len() as u32,
        )?;
        Ok(())
    }

    fn record_commands(&self) -> Result<()> {
        let swapchain = self.swapchain.as_ref().context("Swapchain not initialized")?;
        let pipeline = self.pipeline.as_ref().context("Pipeline not initialized")?;
        let vertex_buffer = self.vertex_buffer.as_ref().context("Vertex buffer not initialized")?;

        let push_constants = PushConstants::new(
            self.settings.camera.model_view_projection(swapchain.extent),
        );

        commands::record_cube_commands(
            &self.device.device,
            &self.command_buffers,
            &self.framebuffers,
            &CubeDraw {
                render_pass: self.render_pass,
                pipeline: pipeline.pipeline,
                pipeline_layout: pipeline.layout,
                vertex_buffer: vertex_buffer.buffer,
                extent: swapchain.extent,
                clear_color: self.settings.clear_color,
                push_constants: &push_constants,
            },
        )?;

        log::info!("Recorded {} command buffers", self.command_buffers.len());
        Ok(())
    }

    // =========================================================================
    // SWAPCHAIN RECREATION
    // =========================================================================

    /// Create the swapchain (retiring the current one) and everything sized
    /// or formatted by it, up to the pipeline.
    ///
    /// The new swapchain is stored as soon as it exists: the old one is retired
    /// by then. A later failure leaves the missing pieces unset and the next
    /// call creates them.
    fn build_swapchain_resources(&mut self) -> Result<()> {
        let (width, height) = self.surface.size();
        let desc = self.swapchain_desc(width, height);
        let swapchain = Swapchain::new(self.device.clone(), &desc, self.swapchain.as_ref())?;

        pipeline::destroy_framebuffers(&self.device, &self.framebuffers);
        self.framebuffers.clear();
        self.depth_image = None;

        let (format, extent) = (swapchain.format, swapchain.extent);
        self.swapchain = Some(swapchain);

        self.depth_image = Some(DepthImage::new(self.device.clone(), self.depth_format, extent)?);

        let plan = RebuildPlan::new(self.render_pass_format, format, self.pipeline.is_some());
        if plan.render_pass {
            self.pipeline = None;
            if self.render_pass != vk::RenderPass::null() {
                log::warn!("Surface format changed to {:?}, rebuilding render pass", format);
                unsafe { self.device.device.destroy_render_pass(self.render_pass, None) };
                self.render_pass = vk::RenderPass::null();
                self.render_pass_format = None;
            }
            self.render_pass = pipeline::create_render_pass(&self.device, format, self.depth_format)?;
            self.render_pass_format = Some(format);
        }

        self.create_framebuffers()?;

        if plan.pipeline {
            self.pipeline = Some(self.create_pipeline()?);
        }
        Ok(())
    }

    /// Command buffers and per-image sync for the current framebuffers
    fn build_frame_resources(&mut self) -> Result<()> {
        self.allocate_command_buffers()?;
        self.record_commands()?;

        self.image_sync.destroy(&self.device.device);
        self.image_sync = ImageSync::new(&self.device, self.framebuffers.len())?;

        self.log_swapchain();
        Ok(())
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        if self.surface.is_minimized() {
            return Ok(());
        }

        self.device.wait_idle()?;

        let (width, height) = self.surface.size();
        log::info!("Recreating swapchain: {}x{}", width, height);

        self.build_swapchain_resources()?;
        self.build_frame_resources()?;

        self.surface.rebuilt();
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Render a single frame.
    ///
    /// FRAME TIMELINE:
    /// ┌──────────────────────────────────────────────────────────────────────┐
    /// │  wait_fence ─> acquire ─> wait image fence ─> submit ─> present      │
    /// └──────────────────────────────────────────────────────────────────────┘
    pub fn draw_frame(&mut self) -> Result<FrameStatus> {
        match self.surface.next_frame() {
            FramePrep::Skip => return Ok(FrameStatus::Skipped),
            FramePrep::Rebuild => self.recreate_swapchain()?,
            FramePrep::Draw => {}
        }

        let slot = self.frame_slot.current();
        let sync = self.frame_sync.get(slot).context("Frame sync not initialized")?;
        let (image_available, in_flight_fence) = (sync.image_available, sync.in_flight_fence);

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Wait until this slot's previous frame is done
        // ─────────────────────────────────────────────────────────────────────
        unsafe {
            self.device
                .device
                .wait_for_fences(&[in_flight_fence], true, u64::MAX)
                .context("Failed to wait for frame fence")?;
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Acquire next swapchain image
        // ─────────────────────────────────────────────────────────────────────
        let swapchain = self.swapchain.as_ref().context("Swapchain not initialized")?;
        let image_index = match swapchain.acquire_next_image(image_available)? {
            Some((index, suboptimal)) => {
                // Still usable this frame; rebuild before the next one
                if suboptimal {
                    self.surface.mark_out_of_date();
                }
                index
            }
            None => {
                log::debug!("Swapchain out of date, recreating");
                self.surface.mark_out_of_date();
                return Ok(FrameStatus::Skipped);
            }
        };

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Make sure no other slot is still rendering to this image
        // ─────────────────────────────────────────────────────────────────────
        let (previous, render_finished) =
            self.image_sync.claim(image_index as usize, in_flight_fence)?;
        if let Some(previous) = previous {
            unsafe {
                self.device
                    .device
                    .wait_for_fences(&[previous], true, u64::MAX)
                    .context("Failed to wait for image fence")?;
            }
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Submit the pre-recorded commands
        // ─────────────────────────────────────────────────────────────────────
        let cmd = *self
            .command_buffers
            .get(image_index as usize)
            .context("No command buffer for swapchain image")?;

        let wait_semaphores = [image_available];
        let signal_semaphores = [render_finished];
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device
                .reset_fences(&[in_flight_fence])
                .context("Failed to reset frame fence")?;
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info.build()], in_flight_fence)
                .context("Failed to submit draw command buffer")?;
        }

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5: Present
        // ─────────────────────────────────────────────────────────────────────
        if swapchain.present(self.device.present_queue, image_index, &signal_semaphores)? {
            self.surface.mark_out_of_date();
        }

        self.frame_slot.advance();

        Ok(FrameStatus::Presented)
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    /// Note the new window size; the swapchain is rebuilt on the next frame
    pub fn resize(&mut self, width: u32, height: u32) {
        self.surface.resize(width, height);
    }

    /// Rebuild the pipeline from the shader files on disk.
    ///
    /// On failure the current pipeline stays in use.
    pub fn reload_shaders(&mut self) -> Result<()> {
        if self.render_pass == vk::RenderPass::null() {
            // The first swapchain build loads them
            log::info!("No render pass yet, shaders load with the swapchain");
            return Ok(());
        }

        self.device.wait_idle()?;

        let pipeline = self
            .create_pipeline()
            .context("Shader reload failed, keeping the previous pipeline")?;
        self.pipeline = Some(pipeline);
        self.record_commands()?;

        log::info!("Reloaded shaders");
        Ok(())
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Wait for GPU to finish before destroying anything
        if let Err(e) = self.device.wait_idle() {
            log::error!("{:#}", e);
        }

        let device = &self.device.device;

        for sync in &self.frame_sync {
            sync.destroy(device);
        }
        self.image_sync.destroy(device);

        unsafe {
            // Also frees the command buffers
            if self.command_pool != vk::CommandPool::null() {
                device.destroy_command_pool(self.command_pool, None);
            }
        }

        self.vertex_buffer = None;
        self.pipeline = None;

        pipeline::destroy_framebuffers(&self.device, &self.framebuffers);

        unsafe {
            if self.render_pass != vk::RenderPass::null() {
                self.device.device.destroy_render_pass(self.render_pass, None);
            }
        }

        self.depth_image = None;
        self.swapchain = None;

        // The device itself goes with the last Arc
        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_config() {
        let config = Config::from_toml(
            r#"
            [graphics]
            buffering = "triple"
            max_frames_in_flight = 0
            clear_color = [0.1, 0.1, 0.1, 1.0]

            [debug]
            validation_layers = false

            [shaders]
            directory = "assets"
            "#,
        )
        .unwrap();

        let settings = RendererSettings::from_config(&config);
        assert_eq!(settings.buffering, BufferingMode::Triple);
        assert_eq!(settings.max_frames_in_flight, 1);
        assert_eq!(settings.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(settings.clear_color, [0.1, 0.1, 0.1, 1.0]);
        assert!(!settings.enable_validation);
        assert_eq!(settings.vertex_shader, PathBuf::from("assets").join("cube.vert.spv"));
        assert_eq!(settings.fragment_shader, PathBuf::from("assets").join("cube.frag.spv"));
    }

    #[test]
    fn minimize_and_restore() {
        let mut surface = SurfaceState::new(800, 600);
        surface.rebuilt();
        assert_eq!(surface.next_frame(), FramePrep::Draw);

        surface.resize(0, 0);
        assert_eq!(surface.next_frame(), FramePrep::Skip);
        surface.resize(800, 0);
        assert_eq!(surface.next_frame(), FramePrep::Skip);

        surface.resize(1024, 768);
        assert_eq!(surface.next_frame(), FramePrep::Rebuild);
        assert_eq!(surface.size(), (1024, 768));

        surface.rebuilt();
        assert_eq!(surface.next_frame(), FramePrep::Draw);
    }

    #[test]
    fn starting_minimized_builds_on_first_real_size() {
        let mut surface = SurfaceState::new(0, 0);
        assert!(surface.needs_rebuild());
        assert_eq!(surface.next_frame(), FramePrep::Skip);

        surface.resize(640, 480);
        assert_eq!(surface.next_frame(), FramePrep::Rebuild);
    }

    #[test]
    fn out_of_date_survives_a_minimize() {
        let mut surface = SurfaceState::new(800, 600);
        surface.rebuilt();
        surface.mark_out_of_date();
        surface.resize(0, 0);
        assert!(surface.needs_rebuild());

        // Restoring to the same size still rebuilds
        surface.resize(800, 600);
        assert_eq!(surface.next_frame(), FramePrep::Rebuild);
    }

    #[test]
    fn failed_rebuild_stays_pending() {
        let mut surface = SurfaceState::new(800, 600);
        surface.rebuilt();
        surface.resize(900, 700);
        // No rebuilt() because recreation errored
        assert_eq!(surface.next_frame(), FramePrep::Rebuild);
        assert_eq!(surface.next_frame(), FramePrep::Rebuild);
    }

    #[test]
    fn rebuild_plan_for_first_build() {
        let plan = RebuildPlan::new(None, vk::Format::B8G8R8A8_SRGB, false);
        assert_eq!(plan, RebuildPlan { render_pass: true, pipeline: true });
    }

    #[test]
    fn rebuild_plan_keeps_pipeline_for_same_format() {
        let format = vk::Format::B8G8R8A8_SRGB;
        let plan = RebuildPlan::new(Some(format), format, true);
        assert_eq!(plan, RebuildPlan { render_pass: false, pipeline: false });
    }

    #[test]
    fn rebuild_plan_format_change_rebuilds_both() {
        let plan = RebuildPlan::new(Some(vk::Format::B8G8R8A8_SRGB), vk::Format::R8G8B8A8_SRGB, true);
        assert_eq!(plan, RebuildPlan { render_pass: true, pipeline: true });
    }

    #[test]
    fn rebuild_plan_retries_what_a_failed_rebuild_left_out() {
        let format = vk::Format::B8G8R8A8_SRGB;
        // Pipeline creation failed after the render pass was rebuilt
        let plan = RebuildPlan::new(Some(format), format, false);
        assert_eq!(plan, RebuildPlan { render_pass: false, pipeline: true });
        // Render pass creation failed, so its format was cleared
        let plan = RebuildPlan::new(None, format, false);
        assert_eq!(plan, RebuildPlan { render_pass: true, pipeline: true });
    }
}
