// Recording stand-ins for the GPU, swapchain and window
//
// The mock GPU never finishes work on its own. A submission completes only
// when something waits on its fence (everything queued before it completes
// too) or the device is drained. Every observable step goes into a shared
// Journal so tests can check ordering across the three mocks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;

use crate::error::{FrameError, FrameResult};
use crate::gpu::{GpuBuffer, GpuDevice, QueueFamily, QueueRole, Submission};
use crate::present::{SurfaceResource, SwapchainBackend, SwapchainImages};
use crate::window::{ResizeSignal, WindowEvents};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SurfaceCreated(SurfaceResource),
    SurfaceDestroyed(SurfaceResource),
    WindowWait,
    Acquire {
        image_index: u32,
    },
    Present {
        image_index: u32,
    },
    BeginCommands(vk::CommandBuffer),
    Submit {
        role: QueueRole,
        waits: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
        command_buffers: Vec<vk::CommandBuffer>,
        signals: Vec<vk::Semaphore>,
        fence: Option<vk::Fence>,
    },
    FenceReset(vk::Fence),
    FenceSignaled(vk::Fence),
    WaitIdle,
}

#[derive(Default)]
struct JournalState {
    events: Vec<Event>,
    next_handle: u64,
    live_surface: Vec<SurfaceResource>,
}

/// Event log shared by all mocks in one test
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<JournalState>>);

impl Journal {
    pub fn events(&self) -> Vec<Event> {
        self.0.lock().events.clone()
    }

    pub fn clear(&self) {
        self.0.lock().events.clear();
    }

    pub fn live_surface_objects(&self) -> usize {
        self.0.lock().live_surface.len()
    }

    fn push(&self, event: Event) {
        self.0.lock().events.push(event);
    }

    fn next_handle(&self) -> u64 {
        let mut state = self.0.lock();
        state.next_handle += 1;
        0x1000 + state.next_handle
    }

    fn created(&self, resource: SurfaceResource) {
        let mut state = self.0.lock();
        state.live_surface.push(resource);
        state.events.push(Event::SurfaceCreated(resource));
    }

    fn destroyed(&self, resource: SurfaceResource) {
        let mut state = self.0.lock();
        let position = state
            .live_surface
            .iter()
            .position(|r| *r == resource)
            .unwrap_or_else(|| panic!("destroying unknown surface object {:?}", resource));
        state.live_surface.remove(position);
        state.events.push(Event::SurfaceDestroyed(resource));
    }
}

// =============================================================================
// DEVICE
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedBarrier {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_family: u32,
    pub dst_family: u32,
    pub buffer: Option<vk::Buffer>,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub image: Option<vk::Image>,
    pub new_layout: Option<vk::ImageLayout>,
}

#[derive(Debug)]
pub struct MockBuffer {
    handle: vk::Buffer,
    size: vk::DeviceSize,
    pub contents: Vec<u8>,
}

impl GpuBuffer for MockBuffer {
    fn handle(&self) -> vk::Buffer {
        self.handle
    }

    fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

struct PendingSubmit {
    fence: Option<vk::Fence>,
    command_buffers: Vec<vk::CommandBuffer>,
}

#[derive(Default)]
struct DeviceState {
    live: HashSet<u64>,
    roles: HashMap<vk::CommandBuffer, QueueRole>,
    fences: HashMap<vk::Fence, bool>,
    pending: VecDeque<PendingSubmit>,
    barriers: HashMap<vk::CommandBuffer, Vec<RecordedBarrier>>,
    fence_stalls: u32,
    max_in_flight: usize,
    failing_submit: Option<QueueRole>,
    creations_left: Option<u32>,
}

impl DeviceState {
    fn in_flight(&self) -> usize {
        self.pending.iter().filter(|p| p.fence.is_some()).count()
    }

    fn executing(&self, cmd: vk::CommandBuffer) -> bool {
        self.pending
            .iter()
            .any(|p| p.command_buffers.contains(&cmd))
    }

    /// Retire submissions in order; `until` is inclusive
    fn complete(&mut self, journal: &Journal, until: Option<vk::Fence>) {
        while let Some(done) = self.pending.pop_front() {
            if let Some(fence) = done.fence {
                self.fences.insert(fence, true);
                journal.push(Event::FenceSignaled(fence));
            }
            if until.is_some() && done.fence == until {
                break;
            }
        }
    }
}

pub struct MockDevice {
    journal: Journal,
    state: Mutex<DeviceState>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_journal(Journal::default())
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            state: Mutex::new(DeviceState::default()),
        }
    }

    pub fn live_objects(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn command_buffer_role(&self, cmd: vk::CommandBuffer) -> Option<QueueRole> {
        self.state.lock().roles.get(&cmd).copied()
    }

    /// Barriers recorded since the command buffer was last begun
    pub fn barriers_on(&self, cmd: vk::CommandBuffer) -> Vec<RecordedBarrier> {
        self.state
            .lock()
            .barriers
            .get(&cmd)
            .cloned()
            .unwrap_or_default()
    }

    /// Fenced submissions not yet retired
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight()
    }

    /// Highest in_flight() seen right after a submit
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    /// Make the next `count` waits on an unsignaled fence time out
    pub fn stall_fence_waits(&self, count: u32) {
        self.state.lock().fence_stalls = count;
    }

    /// Fail the next submit on `role` that carries command buffers.
    /// Empty batches still go through.
    pub fn fail_next_work_submit(&self, role: QueueRole) {
        self.state.lock().failing_submit = Some(role);
    }

    /// Let `count` more objects be created, then fail with out-of-memory
    pub fn fail_creations_after(&self, count: u32) {
        self.state.lock().creations_left = Some(count);
    }

    fn handle(&self) -> FrameResult<u64> {
        {
            let mut state = self.state.lock();
            if let Some(left) = state.creations_left.as_mut() {
                if *left == 0 {
                    return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into());
                }
                *left -= 1;
            }
        }
        let raw = self.journal.next_handle();
        self.state.lock().live.insert(raw);
        Ok(raw)
    }

    fn release(&self, raw: u64) {
        assert!(
            self.state.lock().live.remove(&raw),
            "destroying unknown object {:#x}",
            raw
        );
    }
}

impl GpuDevice for MockDevice {
    type Buffer = MockBuffer;

    fn queue_family(&self, role: QueueRole) -> QueueFamily {
        match role {
            QueueRole::Graphics => QueueFamily(0),
            QueueRole::Compute => QueueFamily(1),
        }
    }

    fn create_semaphore(&self) -> FrameResult<vk::Semaphore> {
        Ok(vk::Semaphore::from_raw(self.handle()?))
    }

    fn create_fence(&self, signaled: bool) -> FrameResult<vk::Fence> {
        let fence = vk::Fence::from_raw(self.handle()?);
        self.state.lock().fences.insert(fence, signaled);
        Ok(fence)
    }

    fn allocate_command_buffer(&self, role: QueueRole) -> FrameResult<vk::CommandBuffer> {
        let cmd = vk::CommandBuffer::from_raw(self.handle()?);
        self.state.lock().roles.insert(cmd, role);
        Ok(cmd)
    }

    fn create_uniform_buffer(&self, size: vk::DeviceSize) -> FrameResult<MockBuffer> {
        Ok(MockBuffer {
            handle: vk::Buffer::from_raw(self.handle()?),
            size,
            contents: vec![0; size as usize],
        })
    }

    fn write_buffer(&self, buffer: &mut MockBuffer, bytes: &[u8]) -> FrameResult<()> {
        if bytes.len() as vk::DeviceSize > buffer.size {
            return Err(FrameError::misuse("write past the end of a buffer"));
        }
        buffer.contents[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> FrameResult<bool> {
        let mut state = self.state.lock();
        match state.fences.get(&fence) {
            None => return Err(FrameError::misuse("waiting on an unknown fence")),
            Some(true) => return Ok(true),
            Some(false) => {}
        }
        if state.fence_stalls > 0 {
            state.fence_stalls -= 1;
            return Ok(false);
        }
        if !state.pending.iter().any(|p| p.fence == Some(fence)) {
            return Err(FrameError::misuse(
                "waiting on a reset fence that was never submitted",
            ));
        }
        state.complete(&self.journal, Some(fence));
        Ok(true)
    }

    fn fence_signaled(&self, fence: vk::Fence) -> FrameResult<bool> {
        self.state
            .lock()
            .fences
            .get(&fence)
            .copied()
            .ok_or_else(|| FrameError::misuse("status of an unknown fence"))
    }

    fn reset_fence(&self, fence: vk::Fence) -> FrameResult<()> {
        let mut state = self.state.lock();
        if state.pending.iter().any(|p| p.fence == Some(fence)) {
            return Err(FrameError::misuse("resetting a fence the GPU still owns"));
        }
        state.fences.insert(fence, false);
        drop(state);
        self.journal.push(Event::FenceReset(fence));
        Ok(())
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> FrameResult<()> {
        let mut state = self.state.lock();
        if state.executing(cmd) {
            return Err(FrameError::misuse(
                "command buffer re-recorded while the GPU may still execute it",
            ));
        }
        state.barriers.remove(&cmd);
        drop(state);
        self.journal.push(Event::BeginCommands(cmd));
        Ok(())
    }

    fn end_commands(&self, _cmd: vk::CommandBuffer) -> FrameResult<()> {
        Ok(())
    }

    fn pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        let mut state = self.state.lock();
        let recorded = state.barriers.entry(cmd).or_default();
        for b in buffer_barriers {
            recorded.push(RecordedBarrier {
                src_stage,
                dst_stage,
                src_access: b.src_access_mask,
                dst_access: b.dst_access_mask,
                src_family: b.src_queue_family_index,
                dst_family: b.dst_queue_family_index,
                buffer: Some(b.buffer),
                offset: b.offset,
                size: b.size,
                image: None,
                new_layout: None,
            });
        }
        for b in image_barriers {
            recorded.push(RecordedBarrier {
                src_stage,
                dst_stage,
                src_access: b.src_access_mask,
                dst_access: b.dst_access_mask,
                src_family: b.src_queue_family_index,
                dst_family: b.dst_queue_family_index,
                buffer: None,
                offset: 0,
                size: 0,
                image: Some(b.image),
                new_layout: Some(b.new_layout),
            });
        }
    }

    fn submit(&self, role: QueueRole, submission: &Submission<'_>) -> FrameResult<()> {
        let mut state = self.state.lock();
        if state.failing_submit == Some(role) && !submission.command_buffers.is_empty() {
            state.failing_submit = None;
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY.into());
        }
        if let Some(fence) = submission.fence {
            if state.fences.get(&fence) != Some(&false) {
                return Err(FrameError::misuse("submitting with a fence that is not reset"));
            }
        }
        for cmd in submission.command_buffers {
            if state.executing(*cmd) {
                return Err(FrameError::misuse("command buffer submitted twice"));
            }
        }

        state.pending.push_back(PendingSubmit {
            fence: submission.fence,
            command_buffers: submission.command_buffers.to_vec(),
        });
        let in_flight = state.in_flight();
        state.max_in_flight = state.max_in_flight.max(in_flight);
        drop(state);

        self.journal.push(Event::Submit {
            role,
            waits: submission.wait.to_vec(),
            command_buffers: submission.command_buffers.to_vec(),
            signals: submission.signal.to_vec(),
            fence: submission.fence,
        });
        Ok(())
    }

    fn wait_idle(&self) -> FrameResult<()> {
        self.state.lock().complete(&self.journal, None);
        self.journal.push(Event::WaitIdle);
        Ok(())
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.release(semaphore.as_raw());
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence);
        self.release(fence.as_raw());
    }

    fn free_command_buffer(&self, _role: QueueRole, cmd: vk::CommandBuffer) {
        self.state.lock().roles.remove(&cmd);
        self.release(cmd.as_raw());
    }

    fn destroy_buffer(&self, buffer: MockBuffer) {
        self.release(buffer.handle.as_raw());
    }
}

// =============================================================================
// SWAPCHAIN
// =============================================================================

#[derive(Default)]
struct SwapchainScript {
    acquire: VecDeque<VkResult<(u32, bool)>>,
    present: VecDeque<VkResult<bool>>,
    next_image: u32,
}

/// Clones share the same script, so a test can keep one after handing the
/// backend to a surface
#[derive(Clone)]
pub struct MockSwapchain {
    journal: Journal,
    image_count: u32,
    script: Arc<Mutex<SwapchainScript>>,
}

impl MockSwapchain {
    pub const FORMAT: vk::Format = vk::Format::B8G8R8A8_SRGB;

    pub fn new(journal: Journal, image_count: u32) -> Self {
        Self {
            journal,
            image_count,
            script: Arc::default(),
        }
    }

    /// Result of the next acquire; unscripted acquires cycle through images
    pub fn script_acquire(&self, result: VkResult<(u32, bool)>) {
        self.script.lock().acquire.push_back(result);
    }

    pub fn script_present(&self, result: VkResult<bool>) {
        self.script.lock().present.push_back(result);
    }
}

impl SwapchainBackend for MockSwapchain {
    fn create_swapchain(&mut self, extent: vk::Extent2D) -> FrameResult<SwapchainImages> {
        let swapchain = vk::SwapchainKHR::from_raw(self.journal.next_handle());
        self.journal.created(SurfaceResource::Swapchain(swapchain));
        let images = (0..self.image_count)
            .map(|_| vk::Image::from_raw(self.journal.next_handle()))
            .collect();
        self.script.lock().next_image = 0;
        Ok(SwapchainImages {
            swapchain,
            images,
            format: Self::FORMAT,
            extent,
        })
    }

    fn create_image_view(
        &mut self,
        _image: vk::Image,
        _format: vk::Format,
    ) -> FrameResult<vk::ImageView> {
        let view = vk::ImageView::from_raw(self.journal.next_handle());
        self.journal.created(SurfaceResource::ImageView(view));
        Ok(view)
    }

    fn create_render_targets(
        &mut self,
        views: &[vk::ImageView],
        _extent: vk::Extent2D,
        keep: &mut dyn FnMut(SurfaceResource),
    ) -> FrameResult<()> {
        let depth = SurfaceResource::Image(vk::Image::from_raw(self.journal.next_handle()));
        self.journal.created(depth);
        keep(depth);

        for image_index in 0..views.len() as u32 {
            let framebuffer = SurfaceResource::Framebuffer {
                image_index,
                framebuffer: vk::Framebuffer::from_raw(self.journal.next_handle()),
            };
            self.journal.created(framebuffer);
            keep(framebuffer);
        }
        Ok(())
    }

    fn destroy(&mut self, resource: SurfaceResource) {
        self.journal.destroyed(resource);
    }

    fn acquire_next_image(
        &mut self,
        _swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        _signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut script = self.script.lock();
        let result = match script.acquire.pop_front() {
            Some(result) => result,
            None => {
                let index = script.next_image % self.image_count;
                script.next_image += 1;
                Ok((index, false))
            }
        };
        drop(script);
        if let Ok((image_index, _)) = result {
            self.journal.push(Event::Acquire { image_index });
        }
        result
    }

    fn queue_present(
        &mut self,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        _wait: &[vk::Semaphore],
    ) -> VkResult<bool> {
        assert!(image_index < self.image_count, "present of unknown image");
        self.journal.push(Event::Present { image_index });
        self.script.lock().present.pop_front().unwrap_or(Ok(false))
    }
}

// =============================================================================
// WINDOW
// =============================================================================

pub struct MockWindow {
    journal: Journal,
    extent: vk::Extent2D,
    close: bool,
    resize: ResizeSignal,
    on_wait: VecDeque<(u32, u32)>,
    waits: usize,
    polls: usize,
    close_after_polls: Option<usize>,
}

impl MockWindow {
    pub fn new(journal: Journal, width: u32, height: u32) -> Self {
        Self {
            journal,
            extent: vk::Extent2D { width, height },
            close: false,
            resize: ResizeSignal::new(),
            on_wait: VecDeque::new(),
            waits: 0,
            polls: 0,
            close_after_polls: None,
        }
    }

    /// Change the size without telling anyone (e.g. minimize)
    pub fn set_extent(&mut self, width: u32, height: u32) {
        self.extent = vk::Extent2D { width, height };
    }

    /// Change the size and raise the resize signal like a real resize event
    pub fn resize_to(&mut self, width: u32, height: u32) {
        self.set_extent(width, height);
        self.resize.raise();
    }

    /// Extents the window reports after each successive wait_events()
    pub fn script_extents_on_wait(&mut self, extents: &[(u32, u32)]) {
        self.on_wait.extend(extents.iter().copied());
    }

    pub fn request_close(&mut self) {
        self.close = true;
    }

    pub fn close_after_polls(&mut self, polls: usize) {
        self.close_after_polls = Some(polls);
    }

    pub fn wait_count(&self) -> usize {
        self.waits
    }
}

impl WindowEvents for MockWindow {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn poll_events(&mut self) {
        self.polls += 1;
        if let Some(limit) = self.close_after_polls {
            if self.polls > limit {
                self.close = true;
            }
        }
    }

    fn wait_events(&mut self) {
        self.waits += 1;
        self.journal.push(Event::WindowWait);
        match self.on_wait.pop_front() {
            Some((width, height)) => self.set_extent(width, height),
            // Nothing left to deliver; a real user would eventually close
            None => self.close = true,
        }
    }

    fn close_requested(&self) -> bool {
        self.close
    }

    fn resize_signal(&self) -> ResizeSignal {
        self.resize.clone()
    }
}
