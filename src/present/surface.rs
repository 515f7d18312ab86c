// Presentation surface - swapchain images plus everything sized to them
//
// acquire/present translate swapchain results into AcquireOutcome /
// PresentOutcome. Once either reports MustRecreate the surface is stale and
// refuses further use until rebuild() has replaced the whole generation.

use ash::prelude::VkResult;
use ash::vk;

use super::arena::{ArenaHandle, GenArena};
use crate::error::{FrameError, FrameResult};
use crate::window::{ResizeSignal, WindowEvents};

/// One GPU object owned by the current surface generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceResource {
    Swapchain(vk::SwapchainKHR),
    ImageView(vk::ImageView),
    /// Size-dependent attachment image (depth)
    Image(vk::Image),
    Framebuffer {
        image_index: u32,
        framebuffer: vk::Framebuffer,
    },
}

/// Result of creating a swapchain
#[derive(Debug, Clone)]
pub struct SwapchainImages {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    /// May differ from the requested extent after clamping to surface limits
    pub extent: vk::Extent2D,
}

/// Swapchain and render-target provider
pub trait SwapchainBackend {
    fn create_swapchain(&mut self, extent: vk::Extent2D) -> FrameResult<SwapchainImages>;

    fn create_image_view(&mut self, image: vk::Image, format: vk::Format)
        -> FrameResult<vk::ImageView>;

    /// Create size-dependent attachments and one framebuffer per view.
    /// Every object is handed to `keep` as soon as it exists so a failure
    /// halfway still gets cleaned up.
    fn create_render_targets(
        &mut self,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
        keep: &mut dyn FnMut(SurfaceResource),
    ) -> FrameResult<()>;

    fn destroy(&mut self, resource: SurfaceResource);

    fn acquire_next_image(
        &mut self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;

    /// Ok(true) means suboptimal
    fn queue_present(
        &mut self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: &[vk::Semaphore],
    ) -> VkResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready { index: u32, suboptimal: bool },
    MustRecreate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    MustRecreate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    Rebuilt,
    /// Close was requested while waiting for the window to get an area
    Interrupted,
}

pub struct PresentationSurface<S: SwapchainBackend> {
    backend: S,
    arena: GenArena<SurfaceResource>,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<ArenaHandle>,
    framebuffers: Vec<Option<ArenaHandle>>,
    format: vk::Format,
    extent: vk::Extent2D,
    resize: ResizeSignal,
    stale: bool,
}

impl<S: SwapchainBackend> PresentationSurface<S> {
    /// Build the first generation. If the window is closed while still
    /// minimized the surface comes back stale and empty.
    pub fn new(backend: S, window: &mut dyn WindowEvents) -> FrameResult<Self> {
        let mut surface = Self {
            backend,
            arena: GenArena::new(),
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            framebuffers: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            resize: window.resize_signal(),
            stale: true,
        };
        surface.rebuild(window)?;
        Ok(surface)
    }

    pub fn acquire(&mut self, signal: vk::Semaphore, timeout_ns: u64) -> FrameResult<AcquireOutcome> {
        self.ensure_fresh("acquire")?;

        match self
            .backend
            .acquire_next_image(self.swapchain, timeout_ns, signal)
        {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Acquired image {} from a suboptimal swapchain", index);
                }
                Ok(AcquireOutcome::Ready { index, suboptimal })
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain out of date during acquire");
                self.stale = true;
                Ok(AcquireOutcome::MustRecreate)
            }
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => {
                Err(FrameError::AcquireTimeout(timeout_ns))
            }
            Err(e) => Err(FrameError::Presentation(e)),
        }
    }

    pub fn present(&mut self, image_index: u32, wait: &[vk::Semaphore]) -> FrameResult<PresentOutcome> {
        self.ensure_fresh("present")?;
        if image_index as usize >= self.images.len() {
            return Err(FrameError::misuse(format!(
                "presenting image {} of a {}-image swapchain",
                image_index,
                self.images.len()
            )));
        }

        let result = self.backend.queue_present(self.swapchain, image_index, wait);
        // A pending window resize wins even if the present went through
        let resized = self.resize.take();

        match result {
            Ok(false) if !resized => Ok(PresentOutcome::Presented),
            Ok(suboptimal) => {
                log::debug!(
                    "Swapchain needs recreation after present (suboptimal: {}, resized: {})",
                    suboptimal,
                    resized
                );
                self.stale = true;
                Ok(PresentOutcome::MustRecreate)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("Swapchain out of date during present");
                self.stale = true;
                Ok(PresentOutcome::MustRecreate)
            }
            Err(e) => Err(FrameError::Presentation(e)),
        }
    }

    /// Replace every surface-dependent resource. The device must be idle.
    pub fn rebuild(&mut self, window: &mut dyn WindowEvents) -> FrameResult<RebuildOutcome> {
        let mut extent = window.extent();
        if extent.width == 0 || extent.height == 0 {
            log::info!("Window minimized, waiting for it to be restored");
        }
        while extent.width == 0 || extent.height == 0 {
            if window.close_requested() {
                return Ok(RebuildOutcome::Interrupted);
            }
            window.wait_events();
            extent = window.extent();
        }

        self.teardown();
        self.stale = true;
        self.build(extent)?;
        self.resize.take();
        self.stale = false;
        Ok(RebuildOutcome::Rebuilt)
    }

    fn build(&mut self, requested: vk::Extent2D) -> FrameResult<()> {
        log::info!("Building surface: {}x{}", requested.width, requested.height);

        let created = self.backend.create_swapchain(requested)?;
        self.arena.insert(SurfaceResource::Swapchain(created.swapchain));
        self.swapchain = created.swapchain;
        self.format = created.format;
        self.extent = created.extent;

        let mut views = Vec::with_capacity(created.images.len());
        for &image in &created.images {
            let view = self.backend.create_image_view(image, created.format)?;
            self.views.push(self.arena.insert(SurfaceResource::ImageView(view)));
            views.push(view);
        }
        self.images = created.images;
        self.framebuffers = vec![None; views.len()];

        let Self {
            backend,
            arena,
            framebuffers,
            ..
        } = self;
        backend.create_render_targets(&views, created.extent, &mut |resource| {
            let handle = arena.insert(resource);
            if let SurfaceResource::Framebuffer { image_index, .. } = resource {
                if let Some(slot) = framebuffers.get_mut(image_index as usize) {
                    *slot = Some(handle);
                }
            }
        })?;

        log::info!(
            "Surface generation {} ready: {} images, {:?}, {}x{}",
            self.arena.generation(),
            self.images.len(),
            self.format,
            self.extent.width,
            self.extent.height
        );
        Ok(())
    }

    /// Destroy the current generation newest-first
    fn teardown(&mut self) {
        if self.arena.is_empty() {
            return;
        }
        log::debug!(
            "Tearing down surface generation {} ({} objects)",
            self.arena.generation(),
            self.arena.len()
        );
        let backend = &mut self.backend;
        for resource in self.arena.drain_reverse() {
            backend.destroy(resource);
        }
        self.swapchain = vk::SwapchainKHR::null();
        self.images.clear();
        self.views.clear();
        self.framebuffers.clear();
    }

    fn ensure_fresh(&self, operation: &str) -> FrameResult<()> {
        if self.stale {
            return Err(FrameError::misuse(format!(
                "{} on a surface that must be rebuilt first",
                operation
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.arena.generation()
    }

    #[inline]
    pub fn swapchain(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn image(&self, index: u32) -> Option<vk::Image> {
        self.images.get(index as usize).copied()
    }

    pub fn view(&self, index: u32) -> Option<vk::ImageView> {
        let handle = *self.views.get(index as usize)?;
        match self.arena.get(handle)? {
            SurfaceResource::ImageView(view) => Some(*view),
            _ => None,
        }
    }

    pub fn framebuffer(&self, index: u32) -> Option<vk::Framebuffer> {
        let handle = (*self.framebuffers.get(index as usize)?)?;
        match self.arena.get(handle)? {
            SurfaceResource::Framebuffer { framebuffer, .. } => Some(*framebuffer),
            _ => None,
        }
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }
}

impl<S: SwapchainBackend> Drop for PresentationSurface<S> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Event, Journal, MockSwapchain, MockWindow};
    use ash::vk::Handle;

    fn surface_800x600() -> (PresentationSurface<MockSwapchain>, MockWindow, Journal) {
        let journal = Journal::default();
        let mut window = MockWindow::new(journal.clone(), 800, 600);
        let surface =
            PresentationSurface::new(MockSwapchain::new(journal.clone(), 3), &mut window).unwrap();
        (surface, window, journal)
    }

    #[test]
    fn initial_build_creates_views_and_framebuffers() {
        let (surface, _window, _journal) = surface_800x600();
        assert!(!surface.is_stale());
        assert_eq!(surface.image_count(), 3);
        assert_eq!(surface.extent(), vk::Extent2D { width: 800, height: 600 });
        for i in 0..3 {
            assert!(surface.view(i).is_some());
            assert!(surface.framebuffer(i).is_some());
        }
        assert!(surface.framebuffer(3).is_none());
    }

    #[test]
    fn out_of_date_acquire_makes_surface_stale() {
        let (mut surface, _window, _journal) = surface_800x600();
        surface
            .backend
            .script_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));

        let outcome = surface.acquire(vk::Semaphore::from_raw(1), u64::MAX).unwrap();
        assert_eq!(outcome, AcquireOutcome::MustRecreate);
        assert!(surface.is_stale());

        // Nothing may use the stale surface before rebuild
        assert!(matches!(
            surface.present(0, &[]),
            Err(FrameError::ProtocolMisuse(_))
        ));
        assert!(matches!(
            surface.acquire(vk::Semaphore::from_raw(1), u64::MAX),
            Err(FrameError::ProtocolMisuse(_))
        ));
    }

    #[test]
    fn suboptimal_acquire_is_still_ready() {
        let (mut surface, _window, _journal) = surface_800x600();
        surface.backend.script_acquire(Ok((2, true)));
        let outcome = surface.acquire(vk::Semaphore::from_raw(1), u64::MAX).unwrap();
        assert_eq!(outcome, AcquireOutcome::Ready { index: 2, suboptimal: true });
        assert!(!surface.is_stale());
    }

    #[test]
    fn other_acquire_errors_are_fatal() {
        let (mut surface, _window, _journal) = surface_800x600();
        surface
            .backend
            .script_acquire(Err(vk::Result::ERROR_SURFACE_LOST_KHR));
        assert!(matches!(
            surface.acquire(vk::Semaphore::from_raw(1), u64::MAX),
            Err(FrameError::Presentation(vk::Result::ERROR_SURFACE_LOST_KHR))
        ));

        surface.backend.script_acquire(Err(vk::Result::TIMEOUT));
        assert!(matches!(
            surface.acquire(vk::Semaphore::from_raw(1), 1_000),
            Err(FrameError::AcquireTimeout(1_000))
        ));
    }

    #[test]
    fn pending_resize_forces_recreate_after_successful_present() {
        let (mut surface, mut window, _journal) = surface_800x600();
        window.resize_to(1024, 768);

        let outcome = surface.present(0, &[vk::Semaphore::from_raw(9)]).unwrap();
        assert_eq!(outcome, PresentOutcome::MustRecreate);
        assert!(surface.is_stale());
        assert!(!window.resize_signal().is_raised());
    }

    #[test]
    fn suboptimal_present_requests_recreate() {
        let (mut surface, _window, _journal) = surface_800x600();
        surface.backend.script_present(Ok(true));
        assert_eq!(surface.present(1, &[]).unwrap(), PresentOutcome::MustRecreate);
    }

    #[test]
    fn rebuild_tears_down_in_reverse_then_recreates() {
        let (mut surface, mut window, journal) = surface_800x600();
        let created: Vec<SurfaceResource> = journal
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::SurfaceCreated(r) => Some(r),
                _ => None,
            })
            .collect();
        journal.clear();

        window.set_extent(1280, 720);
        assert_eq!(surface.rebuild(&mut window).unwrap(), RebuildOutcome::Rebuilt);

        let events = journal.events();
        let destroyed: Vec<SurfaceResource> = events
            .iter()
            .filter_map(|e| match e {
                Event::SurfaceDestroyed(r) => Some(*r),
                _ => None,
            })
            .collect();
        let mut expected = created.clone();
        expected.reverse();
        assert_eq!(destroyed, expected);

        // Every destroy happens before the first create of the new generation
        let last_destroy = events
            .iter()
            .rposition(|e| matches!(e, Event::SurfaceDestroyed(_)))
            .unwrap();
        let first_create = events
            .iter()
            .position(|e| matches!(e, Event::SurfaceCreated(_)))
            .unwrap();
        assert!(last_destroy < first_create);
        assert_eq!(surface.extent(), vk::Extent2D { width: 1280, height: 720 });
    }

    #[test]
    fn rebuild_with_same_extent_is_equivalent() {
        let (mut surface, mut window, _journal) = surface_800x600();
        let before = (surface.image_count(), surface.format(), surface.extent());

        surface.rebuild(&mut window).unwrap();
        let first = (surface.image_count(), surface.format(), surface.extent());
        surface.rebuild(&mut window).unwrap();
        let second = (surface.image_count(), surface.format(), surface.extent());

        assert_eq!(before, first);
        assert_eq!(first, second);
        assert_eq!(surface.generation(), 2);
    }

    #[test]
    fn old_generation_framebuffers_do_not_leak_through() {
        let (mut surface, mut window, _journal) = surface_800x600();
        let old = surface.framebuffer(0).unwrap();
        surface.rebuild(&mut window).unwrap();
        let new = surface.framebuffer(0).unwrap();
        assert_ne!(old, new);
    }

    #[test]
    fn minimized_window_polls_until_it_has_an_area() {
        let (mut surface, mut window, journal) = surface_800x600();
        journal.clear();
        window.set_extent(0, 0);
        window.script_extents_on_wait(&[(0, 0), (800, 600)]);

        assert_eq!(surface.rebuild(&mut window).unwrap(), RebuildOutcome::Rebuilt);
        assert_eq!(window.wait_count(), 2);

        // No swapchain was created while the window had no area
        let events = journal.events();
        let waits_done = events
            .iter()
            .rposition(|e| matches!(e, Event::WindowWait))
            .unwrap();
        let first_create = events
            .iter()
            .position(|e| matches!(e, Event::SurfaceCreated(SurfaceResource::Swapchain(_))))
            .unwrap();
        assert!(waits_done < first_create);
        assert_eq!(surface.extent(), vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn close_while_minimized_interrupts_rebuild() {
        let (mut surface, mut window, _journal) = surface_800x600();
        let generation = surface.generation();
        window.set_extent(0, 0);
        window.request_close();

        assert_eq!(surface.rebuild(&mut window).unwrap(), RebuildOutcome::Interrupted);
        assert_eq!(surface.generation(), generation);
        assert_eq!(window.wait_count(), 0);
    }

    #[test]
    fn drop_destroys_everything() {
        let (surface, _window, journal) = surface_800x600();
        drop(surface);
        assert_eq!(journal.live_surface_objects(), 0);
    }
}
