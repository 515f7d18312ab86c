// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Window surface creation
// - Physical device selection (prefer discrete GPU, dedicated compute family)
// - Logical device, graphics + compute queues, one command pool per queue
// - Memory allocator setup
//
// Implements GpuDevice so the frame loop can drive it.

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{CStr, CString};
use std::sync::Arc;

use super::buffer::{self, AllocatedBuffer};
use crate::error::{FrameError, FrameResult};
use crate::gpu::{GpuDevice, QueueFamily, QueueRole, Submission};

/// Most wait semaphores a single submission may carry
const MAX_WAITS: usize = 4;

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Taken in Drop so it is freed before the device
    allocator: Mutex<Option<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::khr::surface::Instance,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub compute_queue: vk::Queue,
    pub compute_queue_family: u32,
    // Queues and pools need external synchronization
    queue_lock: Mutex<()>,
    graphics_pool: Mutex<vk::CommandPool>,
    compute_pool: Mutex<vk::CommandPool>,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,

    pub properties: vk::PhysicalDeviceProperties,
}

struct QueueSelection {
    physical_device: vk::PhysicalDevice,
    graphics: u32,
    compute: u32,
}

impl VulkanDevice {
    /// Create instance, surface and device for the given window
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, app_name, enable_validation, display_handle)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Surface
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .context("Failed to create window surface")?;

        // Step 5: Pick physical device (GPU)
        let selection = Self::pick_physical_device(&instance, &surface_loader, surface)?;

        // Step 6: Create logical device
        let device = Self::create_logical_device(&instance, &selection)?;
        let graphics_queue = unsafe { device.get_device_queue(selection.graphics, 0) };
        let compute_queue = unsafe { device.get_device_queue(selection.compute, 0) };

        let properties =
            unsafe { instance.get_physical_device_properties(selection.physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics {}, compute {}",
            selection.graphics,
            selection.compute
        );

        // Step 7: Command pools and memory allocator
        let graphics_pool = Self::create_command_pool(&device, selection.graphics)?;
        let compute_pool = Self::create_command_pool(&device, selection.compute)?;
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device: selection.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        Ok(Arc::new(Self {
            allocator: Mutex::new(Some(allocator)),
            device,
            physical_device: selection.physical_device,
            instance,
            _entry: entry,
            surface,
            surface_loader,
            graphics_queue,
            graphics_queue_family: selection.graphics,
            compute_queue,
            compute_queue_family: selection.compute,
            queue_lock: Mutex::new(()),
            graphics_pool: Mutex::new(graphics_pool),
            compute_pool: Mutex::new(compute_pool),
            debug_utils,
            properties,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display_handle: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = c"framepace";

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        // Platform surface extensions come from ash-window
        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("Unsupported windowing system")?
            .to_vec();
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        // Validation layers
        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Result<QueueSelection> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        // Score each device
        let mut best = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            // Graphics family must also be able to present
            let mut graphics = None;
            for (i, family) in queue_families.iter().enumerate() {
                let i = i as u32;
                let presents = unsafe {
                    surface_loader.get_physical_device_surface_support(device, i, surface)
                }
                .unwrap_or(false);
                if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && presents {
                    graphics = Some(i);
                    break;
                }
            }
            let Some(graphics) = graphics else {
                continue;
            };

            // Prefer a compute family without graphics so the lane runs async
            let compute = queue_families
                .iter()
                .enumerate()
                .find(|(_, f)| {
                    f.queue_flags.contains(vk::QueueFlags::COMPUTE)
                        && !f.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                })
                .map(|(i, _)| i as u32)
                .unwrap_or(graphics);

            // Score device (prefer discrete GPU)
            let mut score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };
            if compute != graphics {
                score += 10;
            }

            if score > best_score {
                best_score = score;
                best = Some(QueueSelection {
                    physical_device: device,
                    graphics,
                    compute,
                });
            }
        }

        best.ok_or_else(|| FrameError::NoSuitableGpu.into())
    }

    fn create_logical_device(
        instance: &ash::Instance,
        selection: &QueueSelection,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let mut queue_create_infos = vec![vk::DeviceQueueCreateInfo::default()
            .queue_family_index(selection.graphics)
            .queue_priorities(&queue_priorities)];
        if selection.compute != selection.graphics {
            queue_create_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(selection.compute)
                    .queue_priorities(&queue_priorities),
            );
        }

        let extensions = [ash::khr::swapchain::NAME.as_ptr()];

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions);

        let device = unsafe { instance.create_device(selection.physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    fn create_command_pool(device: &ash::Device, family: u32) -> Result<vk::CommandPool> {
        // RESET: command buffers are re-recorded individually every frame
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;
        Ok(pool)
    }

    fn pool(&self, role: QueueRole) -> &Mutex<vk::CommandPool> {
        match role {
            QueueRole::Graphics => &self.graphics_pool,
            QueueRole::Compute => &self.compute_pool,
        }
    }

    /// Run `f` with exclusive access to the queue for `role`
    pub fn with_queue<R>(&self, role: QueueRole, f: impl FnOnce(vk::Queue) -> R) -> R {
        let _guard = self.queue_lock.lock();
        match role {
            QueueRole::Graphics => f(self.graphics_queue),
            QueueRole::Compute => f(self.compute_queue),
        }
    }

    /// Run `f` with the memory allocator
    pub fn with_allocator<R>(
        &self,
        f: impl FnOnce(&mut Allocator) -> FrameResult<R>,
    ) -> FrameResult<R> {
        let mut allocator = self.allocator.lock();
        let allocator = allocator
            .as_mut()
            .ok_or_else(|| FrameError::misuse("allocator used after device teardown"))?;
        f(allocator)
    }

    /// Record and submit a command buffer, then block until the queue is idle.
    /// For setup work outside the frame loop (layout transitions).
    pub fn one_time_commands(
        &self,
        role: QueueRole,
        f: impl FnOnce(vk::CommandBuffer) -> FrameResult<()>,
    ) -> FrameResult<()> {
        let cmd = self.allocate_command_buffer(role)?;
        let result = self.begin_commands(cmd).and_then(|()| f(cmd)).and_then(|()| {
            self.end_commands(cmd)?;
            self.submit(
                role,
                &Submission {
                    command_buffers: &[cmd],
                    ..Default::default()
                },
            )?;
            self.with_queue(role, |queue| unsafe { self.device.queue_wait_idle(queue) })?;
            Ok(())
        });
        self.free_command_buffer(role, cmd);
        result
    }
}

impl GpuDevice for VulkanDevice {
    type Buffer = AllocatedBuffer;

    fn queue_family(&self, role: QueueRole) -> QueueFamily {
        match role {
            QueueRole::Graphics => QueueFamily(self.graphics_queue_family),
            QueueRole::Compute => QueueFamily(self.compute_queue_family),
        }
    }

    fn create_semaphore(&self) -> FrameResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.create_semaphore(&info, None) }?)
    }

    fn create_fence(&self, signaled: bool) -> FrameResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&info, None) }?)
    }

    fn allocate_command_buffer(&self, role: QueueRole) -> FrameResult<vk::CommandBuffer> {
        let pool = self.pool(role).lock();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }?;
        buffers
            .into_iter()
            .next()
            .ok_or(FrameError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
    }

    fn create_uniform_buffer(&self, size: vk::DeviceSize) -> FrameResult<AllocatedBuffer> {
        // TRANSFER_DST: the compute lane copies its result into the uniform
        buffer::create_buffer(
            self,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::CpuToGpu,
            "frame uniform",
        )
    }

    fn write_buffer(&self, buffer: &mut AllocatedBuffer, bytes: &[u8]) -> FrameResult<()> {
        buffer.write(bytes)
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> FrameResult<bool> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> FrameResult<bool> {
        Ok(unsafe { self.device.get_fence_status(fence) }?)
    }

    fn reset_fence(&self, fence: vk::Fence) -> FrameResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }?;
        Ok(())
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> FrameResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(cmd, &begin_info)?;
        }
        Ok(())
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> FrameResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }?;
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
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                buffer_barriers,
                image_barriers,
            );
        }
    }

    fn submit(&self, role: QueueRole, submission: &Submission<'_>) -> FrameResult<()> {
        if submission.wait.len() > MAX_WAITS {
            return Err(FrameError::misuse(format!(
                "{} wait semaphores in one submission (max {})",
                submission.wait.len(),
                MAX_WAITS
            )));
        }
        let mut semaphores = [vk::Semaphore::null(); MAX_WAITS];
        let mut stages = [vk::PipelineStageFlags::empty(); MAX_WAITS];
        for (i, (semaphore, stage)) in submission.wait.iter().enumerate() {
            semaphores[i] = *semaphore;
            stages[i] = *stage;
        }
        let waits = submission.wait.len();

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&semaphores[..waits])
            .wait_dst_stage_mask(&stages[..waits])
            .command_buffers(submission.command_buffers)
            .signal_semaphores(submission.signal);
        let fence = submission.fence.unwrap_or(vk::Fence::null());

        self.with_queue(role, |queue| unsafe {
            self.device.queue_submit(queue, &[submit_info], fence)
        })?;
        Ok(())
    }

    fn wait_idle(&self) -> FrameResult<()> {
        let _guard = self.queue_lock.lock();
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn free_command_buffer(&self, role: QueueRole, cmd: vk::CommandBuffer) {
        let pool = self.pool(role).lock();
        unsafe { self.device.free_command_buffers(*pool, &[cmd]) };
    }

    fn destroy_buffer(&self, buffer: AllocatedBuffer) {
        if let Err(e) = buffer::destroy_buffer(self, buffer) {
            log::error!("Failed to free buffer memory: {}", e);
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        if let Err(e) = GpuDevice::wait_idle(self) {
            log::error!("wait_idle during teardown failed: {}", e);
        }

        // Allocator first: it frees its memory blocks through the device
        drop(self.allocator.lock().take());

        // Cleanup in reverse order
        unsafe {
            self.device
                .destroy_command_pool(*self.compute_pool.get_mut(), None);
            self.device
                .destroy_command_pool(*self.graphics_pool.get_mut(), None);
            self.device.destroy_device(None);

            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
