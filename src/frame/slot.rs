// Frame slot - one per frame in flight
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync plus the command buffer
// and uniform memory that must not be touched until the fence signals.

use ash::vk;

use crate::error::{FrameError, FrameResult};
use crate::gpu::{GpuDevice, QueueRole};

/// Compute-side work owned by a slot when the compute lane is enabled
#[derive(Debug)]
pub struct ComputeLane {
    pub command_buffer: vk::CommandBuffer,
    /// Signaled by the compute submission, waited on by graphics
    pub compute_done: vk::Semaphore,
}

pub struct FrameSlot<D: GpuDevice> {
    pub image_ready: vk::Semaphore,
    pub render_done: vk::Semaphore,
    pub in_flight: vk::Fence,
    pub command_buffer: vk::CommandBuffer,
    pub uniform: D::Buffer,
    pub compute: Option<ComputeLane>,
}

impl<D: GpuDevice> FrameSlot<D> {
    pub fn new(device: &D, uniform_size: vk::DeviceSize, compute_lane: bool) -> FrameResult<Self> {
        let mut parts = PartialSlot::default();
        let result = Self::build(device, uniform_size, compute_lane, &mut parts);
        if result.is_err() {
            parts.destroy(device);
        }
        result
    }

    fn build(
        device: &D,
        uniform_size: vk::DeviceSize,
        compute_lane: bool,
        parts: &mut PartialSlot,
    ) -> FrameResult<Self> {
        let image_ready = parts.semaphore(device.create_semaphore()?);
        let render_done = parts.semaphore(device.create_semaphore()?);
        // Start signaled so the first wait doesn't block forever
        let in_flight = parts.fence(device.create_fence(true)?);
        let command_buffer = parts.command_buffer(
            QueueRole::Graphics,
            device.allocate_command_buffer(QueueRole::Graphics)?,
        );

        let compute = if compute_lane {
            Some(ComputeLane {
                command_buffer: parts.command_buffer(
                    QueueRole::Compute,
                    device.allocate_command_buffer(QueueRole::Compute)?,
                ),
                compute_done: parts.semaphore(device.create_semaphore()?),
            })
        } else {
            None
        };

        // Last, so a failure here leaves only handles in `parts`
        let uniform = device.create_uniform_buffer(uniform_size)?;

        Ok(Self {
            image_ready,
            render_done,
            in_flight,
            command_buffer,
            uniform,
            compute,
        })
    }

    /// Block until the GPU is done with this slot.
    ///
    /// A finite timeout only changes how often we log; the call does not
    /// return before the fence has signaled.
    pub fn wait_until_free(&self, device: &D, timeout_ns: u64) -> FrameResult<()> {
        if self.in_flight == vk::Fence::null() {
            return Err(FrameError::misuse("waiting on a frame slot with no fence"));
        }
        while !device.wait_for_fence(self.in_flight, timeout_ns)? {
            log::warn!("Frame slot fence still busy after {} ns, waiting again", timeout_ns);
        }
        Ok(())
    }

    pub fn destroy(self, device: &D) {
        device.destroy_semaphore(self.image_ready);
        device.destroy_semaphore(self.render_done);
        device.destroy_fence(self.in_flight);
        device.free_command_buffer(QueueRole::Graphics, self.command_buffer);
        device.destroy_buffer(self.uniform);
        if let Some(lane) = self.compute {
            device.destroy_semaphore(lane.compute_done);
            device.free_command_buffer(QueueRole::Compute, lane.command_buffer);
        }
    }
}

/// Handles created so far by a slot that may still fail to build
#[derive(Default)]
struct PartialSlot {
    semaphores: Vec<vk::Semaphore>,
    fence: Option<vk::Fence>,
    command_buffers: Vec<(QueueRole, vk::CommandBuffer)>,
}

impl PartialSlot {
    fn semaphore(&mut self, semaphore: vk::Semaphore) -> vk::Semaphore {
        self.semaphores.push(semaphore);
        semaphore
    }

    fn fence(&mut self, fence: vk::Fence) -> vk::Fence {
        self.fence = Some(fence);
        fence
    }

    fn command_buffer(&mut self, role: QueueRole, cmd: vk::CommandBuffer) -> vk::CommandBuffer {
        self.command_buffers.push((role, cmd));
        cmd
    }

    fn destroy<D: GpuDevice>(self, device: &D) {
        for (role, cmd) in self.command_buffers.into_iter().rev() {
            device.free_command_buffer(role, cmd);
        }
        if let Some(fence) = self.fence {
            device.destroy_fence(fence);
        }
        for semaphore in self.semaphores.into_iter().rev() {
            device.destroy_semaphore(semaphore);
        }
    }
}
