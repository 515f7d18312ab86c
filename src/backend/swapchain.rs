// Swapchain - Window presentation
//
// VulkanSwapchain creates and destroys the objects of one surface
// generation on request. It never decides when to rebuild; that is the
// PresentationSurface's job. Surface format and render pass are chosen once
// and survive every rebuild.

use ash::prelude::VkResult;
use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

use super::buffer::{self, DepthTarget};
use super::{pipeline, VulkanDevice};
use crate::barrier::transition_image;
use crate::error::{FrameError, FrameResult};
use crate::gpu::QueueRole;
use crate::present::{SurfaceResource, SwapchainBackend, SwapchainImages};

pub struct VulkanSwapchain {
    device: Arc<VulkanDevice>,
    loader: ash::khr::swapchain::Device,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    render_pass: vk::RenderPass,
    depth: HashMap<vk::Image, DepthTarget>,
}

impl VulkanSwapchain {
    pub fn new(device: Arc<VulkanDevice>, preferred_mode: vk::PresentModeKHR) -> FrameResult<Self> {
        // Query supported formats
        let formats = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_formats(device.physical_device, device.surface)
        }?;

        // Query supported present modes
        let present_modes = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_present_modes(device.physical_device, device.surface)
        }?;

        // Choose surface format (prefer SRGB)
        let surface_format = formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .copied()
            .ok_or_else(|| FrameError::Presentation(vk::Result::ERROR_FORMAT_NOT_SUPPORTED))?;

        // FIFO is always supported
        let present_mode = if present_modes.contains(&preferred_mode) {
            preferred_mode
        } else {
            log::warn!("Present mode {:?} not supported, using FIFO", preferred_mode);
            vk::PresentModeKHR::FIFO
        };
        log::info!(
            "Surface format {:?}, present mode {:?}",
            surface_format.format,
            present_mode
        );

        let loader = ash::khr::swapchain::Device::new(&device.instance, &device.device);
        let render_pass = pipeline::create_render_pass(&device, surface_format.format)?;

        Ok(Self {
            device,
            loader,
            surface_format,
            present_mode,
            render_pass,
            depth: HashMap::new(),
        })
    }

    /// Handle stays valid for the lifetime of this object
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }
}

impl SwapchainBackend for VulkanSwapchain {
    fn create_swapchain(&mut self, requested: vk::Extent2D) -> FrameResult<SwapchainImages> {
        let caps = unsafe {
            self.device
                .surface_loader
                .get_physical_device_surface_capabilities(
                    self.device.physical_device,
                    self.device.surface,
                )
        }?;

        // Choose extent
        let extent = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            vk::Extent2D {
                width: requested
                    .width
                    .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: requested
                    .height
                    .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        };

        // One more than the minimum so acquire rarely blocks
        let mut image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 && image_count > caps.max_image_count {
            image_count = caps.max_image_count;
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.device.surface)
            .min_image_count(image_count)
            .image_format(self.surface_format.format)
            .image_color_space(self.surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true);

        let swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }?;
        let images = match unsafe { self.loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { self.loader.destroy_swapchain(swapchain, None) };
                return Err(e.into());
            }
        };

        log::info!("Created swapchain with {} images", images.len());

        Ok(SwapchainImages {
            swapchain,
            images,
            format: self.surface_format.format,
            extent,
        })
    }

    fn create_image_view(
        &mut self,
        image: vk::Image,
        format: vk::Format,
    ) -> FrameResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        Ok(unsafe { self.device.device.create_image_view(&create_info, None) }?)
    }

    fn create_render_targets(
        &mut self,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
        keep: &mut dyn FnMut(SurfaceResource),
    ) -> FrameResult<()> {
        let depth = buffer::create_depth_target(&self.device, extent)?;
        let (depth_image, depth_view) = (depth.image, depth.view);
        self.depth.insert(depth_image, depth);
        keep(SurfaceResource::Image(depth_image));

        let device = &*self.device;
        device.one_time_commands(QueueRole::Graphics, |cmd| {
            transition_image(
                device,
                cmd,
                depth_image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            )
        })?;

        for (image_index, &view) in views.iter().enumerate() {
            let framebuffer =
                pipeline::create_framebuffer(device, self.render_pass, view, depth_view, extent)?;
            keep(SurfaceResource::Framebuffer {
                image_index: image_index as u32,
                framebuffer,
            });
        }
        Ok(())
    }

    fn destroy(&mut self, resource: SurfaceResource) {
        let device = &self.device.device;
        match resource {
            SurfaceResource::Swapchain(swapchain) => unsafe {
                self.loader.destroy_swapchain(swapchain, None)
            },
            SurfaceResource::ImageView(view) => unsafe { device.destroy_image_view(view, None) },
            SurfaceResource::Framebuffer { framebuffer, .. } => unsafe {
                device.destroy_framebuffer(framebuffer, None)
            },
            SurfaceResource::Image(image) => match self.depth.remove(&image) {
                Some(target) => {
                    if let Err(e) = buffer::destroy_depth_target(&self.device, target) {
                        log::error!("Failed to free depth target: {}", e);
                    }
                }
                None => log::warn!("Asked to destroy unknown image {:?}", image),
            },
        }
    }

    fn acquire_next_image(
        &mut self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.loader
                .acquire_next_image(swapchain, timeout_ns, signal, vk::Fence::null())
        }
    }

    fn queue_present(
        &mut self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let swapchains = [swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // The graphics family was picked for present support
        self.device.with_queue(QueueRole::Graphics, |queue| unsafe {
            self.loader.queue_present(queue, &present_info)
        })
    }
}

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        for (_, target) in self.depth.drain() {
            if let Err(e) = buffer::destroy_depth_target(&self.device, target) {
                log::error!("Failed to free depth target: {}", e);
            }
        }
        unsafe { self.device.device.destroy_render_pass(self.render_pass, None) };
    }
}
