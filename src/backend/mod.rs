// Backend module - Vulkan implementations of the frame loop seams
//
// Design: Thin wrapper around ash with safety and ergonomics
// Performance: Zero-cost abstractions, explicit control

pub mod buffer;
pub mod device;
pub mod pipeline;
pub mod recorder;
pub mod swapchain;

pub use device::VulkanDevice;
pub use recorder::{ClearPassRecorder, FrameUniform};
pub use swapchain::VulkanSwapchain;
