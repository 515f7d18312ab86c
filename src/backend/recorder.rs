// Clear-pass recorder
//
// Per frame: write the uniform block, optionally produce the tint on the
// compute queue and hand it to graphics, then run the render pass that
// clears color and depth.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use gpu_allocator::MemoryLocation;
use std::mem::{offset_of, size_of};
use std::sync::Arc;
use std::time::Instant;

use super::buffer::{self, AllocatedBuffer};
use super::VulkanDevice;
use crate::barrier::{AccessScope, BufferRange, OwnershipTransfer};
use crate::error::FrameResult;
use crate::frame::{FrameRecorder, RecordContext};
use crate::gpu::{GpuBuffer, GpuDevice, QueueRole};

/// Uniform block written once per frame
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FrameUniform {
    pub transform: Mat4,
    pub tint: Vec4,
    pub time: f32,
    pub frame: u32,
    pub _pad: [u32; 2],
}

impl FrameUniform {
    pub const SIZE: vk::DeviceSize = size_of::<Self>() as vk::DeviceSize;
    pub const TINT_OFFSET: vk::DeviceSize = offset_of!(FrameUniform, tint) as vk::DeviceSize;
    const TINT_SIZE: vk::DeviceSize = size_of::<Vec4>() as vk::DeviceSize;
}

pub struct ClearPassRecorder {
    device: Arc<VulkanDevice>,
    render_pass: vk::RenderPass,
    clear_color: Vec4,
    /// One handoff buffer per frame slot; empty without a compute lane
    tint_buffers: Vec<AllocatedBuffer>,
    aspect: f32,
    started: Instant,
}

impl ClearPassRecorder {
    pub fn new(
        device: Arc<VulkanDevice>,
        render_pass: vk::RenderPass,
        clear_color: [f32; 4],
        frames_in_flight: usize,
        compute_lane: bool,
    ) -> FrameResult<Self> {
        let mut tint_buffers = Vec::new();
        if compute_lane {
            for _ in 0..frames_in_flight {
                let created = buffer::create_buffer(
                    &device,
                    FrameUniform::TINT_SIZE,
                    vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                    MemoryLocation::GpuOnly,
                    "tint handoff",
                );
                match created {
                    Ok(buffer) => tint_buffers.push(buffer),
                    Err(e) => {
                        for buffer in tint_buffers {
                            device.destroy_buffer(buffer);
                        }
                        return Err(e);
                    }
                }
            }
        }

        Ok(Self {
            device,
            render_pass,
            clear_color: Vec4::from_array(clear_color),
            tint_buffers,
            aspect: 1.0,
            started: Instant::now(),
        })
    }

    fn uniform(&self, time: f32, frame: u64) -> FrameUniform {
        let projection = Mat4::perspective_rh(45f32.to_radians(), self.aspect, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 3.0), Vec3::ZERO, Vec3::Y);
        FrameUniform {
            transform: projection * view * Mat4::from_rotation_y(time),
            tint: self.clear_color,
            time,
            frame: frame as u32,
            _pad: [0; 2],
        }
    }

    /// Produce the tint on the compute queue, move it to graphics and copy
    /// it into the slot's uniform
    fn record_tint_handoff(
        &self,
        ctx: &mut RecordContext<'_, VulkanDevice>,
        tint: Vec4,
    ) -> FrameResult<()> {
        let shared = &self.tint_buffers[ctx.slot];
        let range = BufferRange::whole(shared.handle(), shared.size());
        let compute = ctx.family(QueueRole::Compute);
        let graphics = ctx.family(QueueRole::Graphics);
        let raw = &self.device.device;

        let compute_cmd = ctx.begin_compute(vk::PipelineStageFlags::TRANSFER)?;
        // Last frame's contents are dead once this slot's fence signaled
        ctx.ledger.claim_discarding(range, compute)?;
        unsafe {
            raw.cmd_update_buffer(compute_cmd, range.buffer, 0, bytemuck::bytes_of(&tint));
        }

        let pending = OwnershipTransfer::new(
            range,
            compute,
            AccessScope::TRANSFER_WRITE,
            graphics,
            AccessScope::TRANSFER_READ,
        )
        .release(ctx.device, compute_cmd, ctx.ledger)?;
        pending.acquire(ctx.device, ctx.command_buffer, ctx.ledger)?;

        let uniform = ctx.uniform.handle();
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: FrameUniform::TINT_OFFSET,
            size: FrameUniform::TINT_SIZE,
        };
        unsafe { raw.cmd_copy_buffer(ctx.command_buffer, range.buffer, uniform, &[region]) };

        let visible = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::UNIFORM_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(uniform)
            .offset(FrameUniform::TINT_OFFSET)
            .size(FrameUniform::TINT_SIZE);
        ctx.device.pipeline_barrier(
            ctx.command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
            &[visible],
            &[],
        );
        Ok(())
    }
}

impl FrameRecorder<VulkanDevice> for ClearPassRecorder {
    fn record(&mut self, ctx: &mut RecordContext<'_, VulkanDevice>) -> FrameResult<()> {
        let time = self.started.elapsed().as_secs_f32();
        let uniform = self.uniform(time, ctx.frame_number);
        ctx.write_uniform(bytemuck::bytes_of(&uniform))?;

        let pulse = 0.75 + 0.25 * (time * 2.0).sin();
        let tint = Vec4::new(
            self.clear_color.x * pulse,
            self.clear_color.y * pulse,
            self.clear_color.z * pulse,
            self.clear_color.w,
        );
        if ctx.has_compute_lane() && !self.tint_buffers.is_empty() {
            self.record_tint_handoff(ctx, tint)?;
        }

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: tint.to_array(),
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(ctx.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: ctx.extent,
            })
            .clear_values(&clear_values);

        let raw = &self.device.device;
        unsafe {
            raw.cmd_begin_render_pass(ctx.command_buffer, &begin_info, vk::SubpassContents::INLINE);
            raw.cmd_end_render_pass(ctx.command_buffer);
        }
        Ok(())
    }

    fn surface_rebuilt(&mut self, extent: vk::Extent2D) {
        self.aspect = extent.width as f32 / extent.height.max(1) as f32;
    }
}

impl Drop for ClearPassRecorder {
    fn drop(&mut self) {
        if self.tint_buffers.is_empty() {
            return;
        }
        // The handoff buffers may still be read by in-flight frames
        if let Err(e) = self.device.wait_idle() {
            log::error!("wait_idle before freeing tint buffers failed: {}", e);
        }
        for buffer in self.tint_buffers.drain(..) {
            self.device.destroy_buffer(buffer);
        }
    }
}
