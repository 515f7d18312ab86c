// framepace - frame pacing and surface lifecycle for a Vulkan render loop
//
// The frame loop (frame, present, barrier) is generic over the GpuDevice,
// SwapchainBackend and WindowEvents seams. backend holds the ash
// implementations; tests drive the same code through recording mocks.

pub mod backend;
pub mod barrier;
pub mod config;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod present;
pub mod window;

#[cfg(test)]
pub(crate) mod mock;

pub use error::{FrameError, FrameResult};
