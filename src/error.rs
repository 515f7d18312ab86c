// Error types for the frame loop
//
// Transient surface staleness is NOT an error: it travels as
// AcquireOutcome / PresentOutcome values. Everything here aborts startup
// or the operation that raised it.

use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    /// Raw Vulkan failure not covered by a more specific variant
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// GPU memory allocation failed (no compatible memory type, out of memory)
    #[error("Allocator error: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Acquire or present failed with something other than out-of-date/suboptimal
    #[error("Presentation failed: {0}")]
    Presentation(vk::Result),

    #[error("Timed out after {0} ns waiting for a swapchain image")]
    AcquireTimeout(u64),

    /// Caller broke the frame or transfer protocol
    #[error("Protocol misuse: {0}")]
    ProtocolMisuse(String),

    #[error("Unsupported layout transition {old:?} -> {new:?}")]
    UnsupportedTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl FrameError {
    pub fn misuse(message: impl Into<String>) -> Self {
        Self::ProtocolMisuse(message.into())
    }

    /// True for failures caused by running out of a GPU resource
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::Allocation(_)
                | Self::NoSuitableGpu
                | Self::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
                | Self::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        )
    }
}

pub type FrameResult<T> = std::result::Result<T, FrameError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_results_convert_with_question_mark() {
        fn fails() -> FrameResult<()> {
            Err(vk::Result::ERROR_DEVICE_LOST)?;
            Ok(())
        }
        assert!(matches!(
            fails(),
            Err(FrameError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
        ));
    }

    #[test]
    fn out_of_memory_counts_as_exhaustion() {
        assert!(FrameError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).is_resource_exhaustion());
        assert!(FrameError::NoSuitableGpu.is_resource_exhaustion());
        assert!(!FrameError::misuse("x").is_resource_exhaustion());
    }

    #[test]
    fn transition_error_names_both_layouts() {
        let err = FrameError::UnsupportedTransition {
            old: vk::ImageLayout::GENERAL,
            new: vk::ImageLayout::PRESENT_SRC_KHR,
        };
        let text = err.to_string();
        assert!(text.contains("GENERAL"));
        assert!(text.contains("PRESENT_SRC_KHR"));
    }
}
