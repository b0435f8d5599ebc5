// Command pool and pre-recorded draw commands
//
// The cube never changes, so each framebuffer gets one command buffer that is
// recorded once and resubmitted every frame. Recording happens again only
// when the swapchain or the pipeline is rebuilt.

use anyhow::{Context, Result};
use ash::vk;
use super::VulkanDevice;
use crate::cube::{PushConstants, CUBE_VERTEX_COUNT};

/// Everything a cube command buffer refers to
pub struct CubeDraw<'a> {
    pub render_pass: vk::RenderPass,
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    pub vertex_buffer: vk::Buffer,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub push_constants: &'a PushConstants,
}

pub fn create_command_pool(device: &VulkanDevice) -> Result<vk::CommandPool> {
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .queue_family_index(device.queue_families.graphics)
        // RESET: buffers are re-recorded in place after a rebuild
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

    unsafe {
        device.device.create_command_pool(&pool_info, None)
            .context("Failed to create command pool")
    }
}

pub fn allocate_command_buffers(
    device: &VulkanDevice,
    command_pool: vk::CommandPool,
    count: u32,
) -> Result<Vec<vk::CommandBuffer>> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(count);

    unsafe {
        device.device.allocate_command_buffers(&alloc_info)
            .context("Failed to allocate command buffers")
    }
}

pub fn clear_values(clear_color: [f32; 4]) -> [vk::ClearValue; 2] {
    [
        vk::ClearValue {
            color: vk::ClearColorValue { float32: clear_color },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ]
}

/// Viewport covering the whole extent with the full depth range
pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Record the cube draw into `command_buffers[i]` targeting `framebuffers[i]`
pub fn record_cube_commands(
    device: &ash::Device,
    command_buffers: &[vk::CommandBuffer],
    framebuffers: &[vk::Framebuffer],
    draw: &CubeDraw,
) -> Result<()> {
    anyhow::ensure!(
        command_buffers.len() == framebuffers.len(),
        "{} command buffers for {} framebuffers",
        command_buffers.len(),
        framebuffers.len()
    );

    let clear_values = clear_values(draw.clear_color);
    let render_area = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: draw.extent,
    };
    let viewports = [full_viewport(draw.extent)];
    let scissors = [render_area];

    for (&cmd, &framebuffer) in command_buffers.iter().zip(framebuffers) {
        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;

            let begin_info = vk::CommandBufferBeginInfo::builder();
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin command buffer")?;

            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(draw.render_pass)
                .framebuffer(framebuffer)
                .render_area(render_area)
                .clear_values(&clear_values);

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, draw.pipeline);
            device.cmd_set_viewport(cmd, 0, &viewports);
            device.cmd_set_scissor(cmd, 0, &scissors);
            device.cmd_bind_vertex_buffers(cmd, 0, &[draw.vertex_buffer], &[0]);
            device.cmd_push_constants(
                cmd,
                draw.pipeline_layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(draw.push_constants),
            );
            device.cmd_draw(cmd, CUBE_VERTEX_COUNT, 1, 0, 0);
            device.cmd_end_render_pass(cmd);

            device
                .end_command_buffer(cmd)
                .context("Failed to end command buffer")?;
        }
    }

    log::debug!("Recorded {} cube command buffers", command_buffers.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clears_to_config_color_and_far_depth() {
        let values = clear_values([0.1, 0.2, 0.3, 1.0]);
        unsafe {
            assert_eq!(values[0].color.float32, [0.1, 0.2, 0.3, 1.0]);
            assert_eq!(values[1].depth_stencil.depth, 1.0);
            assert_eq!(values[1].depth_stencil.stencil, 0);
        }
    }

    #[test]
    fn viewport_spans_extent() {
        let viewport = full_viewport(vk::Extent2D { width: 800, height: 600 });
        assert_eq!((viewport.x, viewport.y), (0.0, 0.0));
        assert_eq!((viewport.width, viewport.height), (800.0, 600.0));
        assert_eq!((viewport.min_depth, viewport.max_depth), (0.0, 1.0));
    }
}
