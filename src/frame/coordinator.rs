// Submission coordinator - one frame at a time through the slot ring
//
// WaitFence -> Acquire -> (Recreate | Reset -> Record -> Submit -> Present)
// -> Advance. The fence is reset only once an image has been acquired, so
// a frame that bails out to recreate the surface leaves its slot exactly
// as it found it and the retry reuses the same slot and frame number.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;

use super::ring::FrameSlotRing;
use super::slot::{ComputeLane, FrameSlot};
use crate::barrier::TransferLedger;
use crate::config::GraphicsConfig;
use crate::error::{FrameError, FrameResult};
use crate::gpu::{GpuDevice, QueueFamily, QueueRole, Submission};
use crate::present::{
    AcquireOutcome, PresentOutcome, PresentationSurface, RebuildOutcome, SwapchainBackend,
};
use crate::window::WindowEvents;

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub frames_in_flight: usize,
    pub uniform_size: vk::DeviceSize,
    pub compute_lane: bool,
    pub fence_timeout_ns: u64,
    pub acquire_timeout_ns: u64,
}

impl CoordinatorSettings {
    pub fn from_config(graphics: &GraphicsConfig, uniform_size: vk::DeviceSize) -> Self {
        Self {
            frames_in_flight: graphics.max_frames_in_flight as usize,
            uniform_size,
            compute_lane: graphics.compute_lane,
            fence_timeout_ns: millis_to_ns(graphics.fence_timeout_ms),
            acquire_timeout_ns: millis_to_ns(graphics.acquire_timeout_ms),
        }
    }
}

fn millis_to_ns(ms: u64) -> u64 {
    ms.saturating_mul(1_000_000)
}

/// Per-frame numbers handed to the observer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    pub frame_number: u64,
    pub slot: usize,
    pub image_index: u32,
    /// Time spent blocked on the slot fence
    pub fence_wait: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameOutcome {
    Presented(FrameReport),
    /// The surface was rebuilt. Carries the report when the frame was
    /// submitted before the rebuild; `None` means the acquire failed and the
    /// next call retries the same slot.
    Recreated(Option<FrameReport>),
    /// Close was requested while the window was minimized
    Interrupted,
}

/// Everything a recorder may touch while the frame's slot is owned by the CPU
pub struct RecordContext<'a, D: GpuDevice> {
    pub device: &'a D,
    pub slot: usize,
    pub frame_number: u64,
    pub image_index: u32,
    pub image: vk::Image,
    pub extent: vk::Extent2D,
    pub framebuffer: vk::Framebuffer,
    pub command_buffer: vk::CommandBuffer,
    pub uniform: &'a mut D::Buffer,
    pub ledger: &'a mut TransferLedger,
    compute: Option<&'a ComputeLane>,
    compute_wait: Option<vk::PipelineStageFlags>,
}

impl<'a, D: GpuDevice> RecordContext<'a, D> {
    pub fn family(&self, role: QueueRole) -> QueueFamily {
        self.device.queue_family(role)
    }

    #[inline]
    pub fn has_compute_lane(&self) -> bool {
        self.compute.is_some()
    }

    /// Start this frame's compute command buffer. The graphics submission
    /// will wait for the compute work at `graphics_wait_stage`.
    pub fn begin_compute(
        &mut self,
        graphics_wait_stage: vk::PipelineStageFlags,
    ) -> FrameResult<vk::CommandBuffer> {
        let lane = self
            .compute
            .ok_or_else(|| FrameError::misuse("compute work recorded without a compute lane"))?;
        if self.compute_wait.is_some() {
            return Err(FrameError::misuse("compute lane begun twice in one frame"));
        }
        self.device.begin_commands(lane.command_buffer)?;
        self.compute_wait = Some(graphics_wait_stage);
        Ok(lane.command_buffer)
    }

    pub fn write_uniform(&mut self, bytes: &[u8]) -> FrameResult<()> {
        self.device.write_buffer(self.uniform, bytes)
    }
}

/// Pipeline and resource provider: fills the frame's command buffers
pub trait FrameRecorder<D: GpuDevice> {
    fn record(&mut self, ctx: &mut RecordContext<'_, D>) -> FrameResult<()>;

    /// Called after every successful surface rebuild
    fn surface_rebuilt(&mut self, _extent: vk::Extent2D) {}
}

pub struct SubmissionCoordinator<D: GpuDevice, S: SwapchainBackend> {
    device: Arc<D>,
    ring: Option<FrameSlotRing<D>>,
    surface: Option<PresentationSurface<S>>,
    ledger: TransferLedger,
    frame_number: u64,
    settings: CoordinatorSettings,
}

impl<D: GpuDevice, S: SwapchainBackend> SubmissionCoordinator<D, S> {
    pub fn new(
        device: Arc<D>,
        backend: S,
        window: &mut dyn WindowEvents,
        settings: CoordinatorSettings,
    ) -> FrameResult<Self> {
        let ring = FrameSlotRing::new(
            &*device,
            settings.frames_in_flight,
            settings.uniform_size,
            settings.compute_lane,
        )?;
        let surface = match PresentationSurface::new(backend, window) {
            Ok(surface) => surface,
            Err(e) => {
                // Fresh fences are signaled, so the ring can go right away
                if let Err((_, destroy_err)) = ring.destroy(&*device) {
                    log::error!("Failed to destroy frame ring: {}", destroy_err);
                }
                return Err(e);
            }
        };

        Ok(Self {
            device,
            ring: Some(ring),
            surface: Some(surface),
            ledger: TransferLedger::new(),
            frame_number: 0,
            settings,
        })
    }

    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn ring(&self) -> Option<&FrameSlotRing<D>> {
        self.ring.as_ref()
    }

    pub fn surface(&self) -> Option<&PresentationSurface<S>> {
        self.surface.as_ref()
    }

    pub fn draw_frame<R>(
        &mut self,
        window: &mut dyn WindowEvents,
        recorder: &mut R,
    ) -> FrameResult<FrameOutcome>
    where
        R: FrameRecorder<D> + ?Sized,
    {
        let device = &*self.device;
        let (Some(ring), Some(surface)) = (self.ring.as_mut(), self.surface.as_mut()) else {
            return Err(FrameError::misuse("draw_frame after shutdown"));
        };

        // Left stale by an interrupted rebuild
        if surface.is_stale() {
            return recreate(device, surface, window, recorder);
        }

        let slot_index = ring.index();
        let frame_number = self.frame_number;

        // 1. The slot's previous submission must be finished
        let started = Instant::now();
        ring.current()
            .wait_until_free(device, self.settings.fence_timeout_ns)?;
        let fence_wait = started.elapsed();

        // 2. Acquire
        let image_index = match surface.acquire(
            ring.current().image_ready,
            self.settings.acquire_timeout_ns,
        )? {
            AcquireOutcome::Ready { index, .. } => index,
            AcquireOutcome::MustRecreate => {
                log::debug!("Frame {} acquire needs recreate, retrying after rebuild", frame_number);
                return recreate(device, surface, window, recorder);
            }
        };

        // 3. Only now is the slot committed to a submission
        let slot = ring.current_mut();
        device.reset_fence(slot.in_flight)?;

        // 4. Record
        let frame = FrameTarget {
            slot: slot_index,
            frame_number,
            image_index,
        };
        let compute_wait = match record(device, slot, surface, &mut self.ledger, recorder, frame) {
            Ok(compute_wait) => compute_wait,
            Err(e) => {
                self.ledger.abandon_pending();
                retire_unsubmitted(device, slot, &[slot.image_ready]);
                return Err(e);
            }
        };

        // 5. Submit
        submit(device, slot, compute_wait)?;

        // 6. Present
        let presented = surface.present(image_index, &[slot.render_done])?;

        // 7. Advance
        ring.advance();
        self.frame_number += 1;

        let report = FrameReport {
            frame_number,
            slot: slot_index,
            image_index,
            fence_wait,
        };
        match presented {
            PresentOutcome::Presented => Ok(FrameOutcome::Presented(report)),
            PresentOutcome::MustRecreate => match recreate(device, surface, window, recorder)? {
                FrameOutcome::Recreated(_) => Ok(FrameOutcome::Recreated(Some(report))),
                other => Ok(other),
            },
        }
    }

    /// Draw until the window asks to close, then drain the GPU.
    /// Returns the number of frames submitted.
    pub fn run<R, F>(
        &mut self,
        window: &mut dyn WindowEvents,
        recorder: &mut R,
        mut observer: F,
    ) -> FrameResult<u64>
    where
        R: FrameRecorder<D> + ?Sized,
        F: FnMut(&FrameReport),
    {
        log::info!("Entering frame loop");

        let result = loop {
            window.poll_events();
            if window.close_requested() {
                break Ok(());
            }
            match self.draw_frame(window, recorder) {
                Ok(FrameOutcome::Presented(report)) => observer(&report),
                Ok(FrameOutcome::Recreated(Some(report))) => observer(&report),
                Ok(FrameOutcome::Recreated(None)) => {}
                Ok(FrameOutcome::Interrupted) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        // Leave the GPU idle even when bailing out with an error
        let idle = self.device.wait_idle();
        result?;
        idle?;

        log::info!("Frame loop finished after {} frames", self.frame_number);
        Ok(self.frame_number)
    }

    /// Wait for the GPU, then destroy the surface and every frame slot
    pub fn shutdown(&mut self) -> FrameResult<()> {
        if self.ring.is_none() && self.surface.is_none() {
            return Ok(());
        }
        self.device.wait_idle()?;

        drop(self.surface.take());
        if let Some(ring) = self.ring.take() {
            if let Err((ring, e)) = ring.destroy(&*self.device) {
                self.ring = Some(ring);
                return Err(e);
            }
        }
        log::info!("Frame coordinator shut down");
        Ok(())
    }
}

impl<D: GpuDevice, S: SwapchainBackend> Drop for SubmissionCoordinator<D, S> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Frame coordinator shutdown failed: {}", e);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameTarget {
    slot: usize,
    frame_number: u64,
    image_index: u32,
}

fn recreate<D, S, R>(
    device: &D,
    surface: &mut PresentationSurface<S>,
    window: &mut dyn WindowEvents,
    recorder: &mut R,
) -> FrameResult<FrameOutcome>
where
    D: GpuDevice,
    S: SwapchainBackend,
    R: FrameRecorder<D> + ?Sized,
{
    device.wait_idle()?;
    match surface.rebuild(window)? {
        RebuildOutcome::Rebuilt => {
            recorder.surface_rebuilt(surface.extent());
            Ok(FrameOutcome::Recreated(None))
        }
        RebuildOutcome::Interrupted => {
            log::info!("Close requested while minimized");
            Ok(FrameOutcome::Interrupted)
        }
    }
}

/// Returns the stage graphics must wait at if the compute lane was used
fn record<D, S, R>(
    device: &D,
    slot: &mut FrameSlot<D>,
    surface: &PresentationSurface<S>,
    ledger: &mut TransferLedger,
    recorder: &mut R,
    frame: FrameTarget,
) -> FrameResult<Option<vk::PipelineStageFlags>>
where
    D: GpuDevice,
    S: SwapchainBackend,
    R: FrameRecorder<D> + ?Sized,
{
    let (Some(image), Some(framebuffer)) = (
        surface.image(frame.image_index),
        surface.framebuffer(frame.image_index),
    ) else {
        return Err(FrameError::misuse(format!(
            "acquired image {} has no render target",
            frame.image_index
        )));
    };

    device.begin_commands(slot.command_buffer)?;

    let mut ctx = RecordContext {
        device,
        slot: frame.slot,
        frame_number: frame.frame_number,
        image_index: frame.image_index,
        image,
        extent: surface.extent(),
        framebuffer,
        command_buffer: slot.command_buffer,
        uniform: &mut slot.uniform,
        ledger,
        compute: slot.compute.as_ref(),
        compute_wait: None,
    };
    recorder.record(&mut ctx)?;
    let compute_wait = ctx.compute_wait;
    ctx.ledger.ensure_settled()?;

    if let (Some(_), Some(lane)) = (compute_wait, slot.compute.as_ref()) {
        device.end_commands(lane.command_buffer)?;
    }
    device.end_commands(slot.command_buffer)?;
    Ok(compute_wait)
}

fn submit<D: GpuDevice>(
    device: &D,
    slot: &FrameSlot<D>,
    compute_wait: Option<vk::PipelineStageFlags>,
) -> FrameResult<()> {
    let mut waits = [
        (slot.image_ready, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT),
        (vk::Semaphore::null(), vk::PipelineStageFlags::empty()),
    ];
    let mut wait_count = 1;

    if let (Some(stage), Some(lane)) = (compute_wait, slot.compute.as_ref()) {
        let compute = device.submit(
            QueueRole::Compute,
            &Submission {
                command_buffers: &[lane.command_buffer],
                signal: &[lane.compute_done],
                ..Default::default()
            },
        );
        if let Err(e) = compute {
            retire_unsubmitted(device, slot, &[slot.image_ready]);
            return Err(e);
        }
        waits[1] = (lane.compute_done, stage);
        wait_count = 2;
    }

    let graphics = device.submit(
        QueueRole::Graphics,
        &Submission {
            wait: &waits[..wait_count],
            command_buffers: &[slot.command_buffer],
            signal: &[slot.render_done],
            fence: Some(slot.in_flight),
        },
    );
    if let Err(e) = graphics {
        // An accepted compute batch still signals compute_done; consume it too
        let pending: Vec<_> = waits[..wait_count]
            .iter()
            .map(|&(semaphore, _)| semaphore)
            .collect();
        retire_unsubmitted(device, slot, &pending);
        return Err(e);
    }
    Ok(())
}

/// The frame failed after the fence was reset. Hand the fence back to the
/// GPU with an empty batch that consumes the semaphores already signaled
/// for this frame, so the next wait on this slot returns.
fn retire_unsubmitted<D: GpuDevice>(device: &D, slot: &FrameSlot<D>, signaled: &[vk::Semaphore]) {
    let wait: Vec<_> = signaled
        .iter()
        .map(|&semaphore| (semaphore, vk::PipelineStageFlags::ALL_COMMANDS))
        .collect();
    let result = device.submit(
        QueueRole::Graphics,
        &Submission {
            wait: &wait,
            fence: Some(slot.in_flight),
            ..Default::default()
        },
    );
    if let Err(e) = result {
        log::error!("Failed to retire frame slot {:?}: {}", slot.in_flight, e);
    }
}
