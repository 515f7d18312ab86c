// Device/queue provider seam
//
// The frame loop only talks to the GPU through this trait. The ash-backed
// implementation lives in backend::device; tests use a recording mock.
// Handles are plain vk types so barrier and submit descriptions stay the
// same on both sides.

use ash::vk;

use crate::error::FrameResult;

/// Which logical queue a piece of work targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Compute,
}

/// Queue family index, kept distinct from other u32s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueFamily(pub u32);

impl QueueFamily {
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// One queue submission. Wait semaphores are paired with the stage that waits.
#[derive(Debug, Default, Clone, Copy)]
pub struct Submission<'a> {
    pub wait: &'a [(vk::Semaphore, vk::PipelineStageFlags)],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signal: &'a [vk::Semaphore],
    pub fence: Option<vk::Fence>,
}

/// Host-visible buffer owned by a frame slot
pub trait GpuBuffer {
    fn handle(&self) -> vk::Buffer;
    fn size(&self) -> vk::DeviceSize;
}

pub trait GpuDevice {
    type Buffer: GpuBuffer;

    fn queue_family(&self, role: QueueRole) -> QueueFamily;

    fn create_semaphore(&self) -> FrameResult<vk::Semaphore>;
    fn create_fence(&self, signaled: bool) -> FrameResult<vk::Fence>;
    fn allocate_command_buffer(&self, role: QueueRole) -> FrameResult<vk::CommandBuffer>;
    fn create_uniform_buffer(&self, size: vk::DeviceSize) -> FrameResult<Self::Buffer>;

    /// Copy bytes into a host-visible buffer at offset 0
    fn write_buffer(&self, buffer: &mut Self::Buffer, bytes: &[u8]) -> FrameResult<()>;

    /// Returns false if the timeout expired before the fence signaled
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> FrameResult<bool>;
    fn fence_signaled(&self, fence: vk::Fence) -> FrameResult<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> FrameResult<()>;

    /// Reset and begin a one-time-submit recording
    fn begin_commands(&self, cmd: vk::CommandBuffer) -> FrameResult<()>;
    fn end_commands(&self, cmd: vk::CommandBuffer) -> FrameResult<()>;

    fn pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    );

    fn submit(&self, role: QueueRole, submission: &Submission<'_>) -> FrameResult<()>;

    /// Drain every queue. Used before rebuilds and teardown.
    fn wait_idle(&self) -> FrameResult<()>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn destroy_fence(&self, fence: vk::Fence);
    fn free_command_buffer(&self, role: QueueRole, cmd: vk::CommandBuffer);
    fn destroy_buffer(&self, buffer: Self::Buffer);
}
