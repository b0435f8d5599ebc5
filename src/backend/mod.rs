// Backend module - Vulkan abstraction layer
//
// Thin helpers over ash; the renderer owns the handles they return.

pub mod buffer;
pub mod commands;
pub mod device;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use swapchain::Swapchain;
