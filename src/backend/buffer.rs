// Buffers and images backed by gpu-allocator
//
// Frame uniforms live in host-visible memory and are written through the
// persistent mapping. The compute handoff buffer and the depth attachment
// are device-local.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::VulkanDevice;
use crate::error::{FrameError, FrameResult};
use crate::gpu::GpuBuffer;

/// Depth format used by the render pass and the depth attachment
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Buffer plus the memory it is bound to
pub struct AllocatedBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: vk::DeviceSize,
}

impl AllocatedBuffer {
    /// Copy bytes to the start of a host-visible buffer
    pub fn write(&mut self, bytes: &[u8]) -> FrameResult<()> {
        if bytes.len() as vk::DeviceSize > self.size {
            return Err(FrameError::misuse(format!(
                "writing {} bytes into a {}-byte buffer",
                bytes.len(),
                self.size
            )));
        }
        let mapped = self
            .allocation
            .mapped_slice_mut()
            .ok_or_else(|| FrameError::misuse("writing to a buffer that is not host visible"))?;
        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

impl GpuBuffer for AllocatedBuffer {
    fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

/// Helper to create a GPU buffer with specified usage and memory location
pub fn create_buffer(
    device: &VulkanDevice,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
    name: &str,
) -> FrameResult<AllocatedBuffer> {
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }?;
    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    let allocation = device.with_allocator(|allocator| {
        Ok(allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?)
    });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e);
        }
    };

    let bound = unsafe {
        device
            .device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
    };
    let created = AllocatedBuffer {
        buffer,
        allocation,
        size,
    };
    if let Err(e) = bound {
        destroy_buffer(device, created)?;
        return Err(e.into());
    }

    log::debug!("Created buffer '{}' ({} bytes, {:?})", name, size, location);
    Ok(created)
}

pub fn destroy_buffer(device: &VulkanDevice, buffer: AllocatedBuffer) -> FrameResult<()> {
    unsafe { device.device.destroy_buffer(buffer.buffer, None) };
    device.with_allocator(|allocator| Ok(allocator.free(buffer.allocation)?))
}

/// Depth attachment sized to one surface generation
pub struct DepthTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    allocation: Allocation,
}

/// Create a depth buffer image, memory, and view
pub fn create_depth_target(
    device: &VulkanDevice,
    extent: vk::Extent2D,
) -> FrameResult<DepthTarget> {
    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(DEPTH_FORMAT)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let image = unsafe { device.device.create_image(&image_info, None) }?;
    let requirements = unsafe { device.device.get_image_memory_requirements(image) };

    let allocation = device.with_allocator(|allocator| {
        Ok(allocator.allocate(&AllocationCreateDesc {
            name: "depth",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?)
    });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.device.destroy_image(image, None) };
            return Err(e);
        }
    };

    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(DEPTH_FORMAT)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::DEPTH,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    let view = unsafe {
        device
            .device
            .bind_image_memory(image, allocation.memory(), allocation.offset())
    }
    .and_then(|()| unsafe { device.device.create_image_view(&view_info, None) });

    match view {
        Ok(view) => Ok(DepthTarget {
            image,
            view,
            allocation,
        }),
        Err(e) => {
            unsafe { device.device.destroy_image(image, None) };
            device.with_allocator(|allocator| Ok(allocator.free(allocation)?))?;
            Err(e.into())
        }
    }
}

pub fn destroy_depth_target(device: &VulkanDevice, target: DepthTarget) -> FrameResult<()> {
    unsafe {
        device.device.destroy_image_view(target.view, None);
        device.device.destroy_image(target.image, None);
    }
    device.with_allocator(|allocator| Ok(allocator.free(target.allocation)?))
}
