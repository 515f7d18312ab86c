// Window - event source for the frame loop
//
// The frame loop needs four things from the window: its pixel size, a way
// to pump events without blocking, a way to block while minimized, and a
// close flag. Resizes are reported through a shared ResizeSignal that the
// presentation surface checks after each present.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window, WindowAttributes, WindowId},
};

use crate::config::WindowConfig;

/// "Surface size changed" flag shared between the window and the surface
#[derive(Debug, Clone, Default)]
pub struct ResizeSignal(Arc<AtomicBool>);

impl ResizeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Read and clear
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

pub trait WindowEvents {
    /// Current drawable size in pixels; zero when minimized
    fn extent(&self) -> vk::Extent2D;

    /// Handle whatever is queued and return immediately
    fn poll_events(&mut self);

    /// Block until at least one event arrives
    fn wait_events(&mut self);

    fn close_requested(&self) -> bool;

    fn resize_signal(&self) -> ResizeSignal;
}

// =============================================================================
// WINIT IMPLEMENTATION
// =============================================================================

struct WindowHost {
    attributes: WindowAttributes,
    window: Option<Arc<Window>>,
    close_requested: bool,
    resize: ResizeSignal,
    creation_error: Option<String>,
}

impl ApplicationHandler for WindowHost {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => self.window = Some(Arc::new(window)),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                self.creation_error = Some(e.to_string());
                self.close_requested = true;
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.close_requested = true;
            }
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.resize.raise();
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    self.close_requested = true;
                }
            }
            _ => {}
        }
    }
}

/// Desktop window driven by pumping the winit event loop from our own loop
pub struct DesktopWindow {
    event_loop: EventLoop<()>,
    host: WindowHost,
}

impl DesktopWindow {
    pub fn open(config: &WindowConfig) -> Result<Self> {
        let event_loop = EventLoop::new().context("Failed to create event loop")?;
        let attributes = WindowAttributes::default()
            .with_title(&config.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(config.width, config.height));

        let mut window = Self {
            event_loop,
            host: WindowHost {
                attributes,
                window: None,
                close_requested: false,
                resize: ResizeSignal::new(),
                creation_error: None,
            },
        };

        // The window only exists after the loop has delivered `resumed`
        while window.host.window.is_none() && !window.host.close_requested {
            window.pump(Some(Duration::from_millis(16)));
        }
        if let Some(e) = window.host.creation_error.take() {
            anyhow::bail!("Failed to create window: {}", e);
        }
        if window.host.window.is_none() {
            anyhow::bail!("Window closed before it was created");
        }

        log::info!("Window: {}x{}", config.width, config.height);
        Ok(window)
    }

    fn pump(&mut self, timeout: Option<Duration>) {
        if let PumpStatus::Exit(code) = self.event_loop.pump_app_events(timeout, &mut self.host) {
            log::debug!("Event loop exited with code {}", code);
            self.host.close_requested = true;
        }
    }

    pub fn raw_handles(&self) -> Result<(RawDisplayHandle, RawWindowHandle)> {
        let window = self.host.window.as_ref().context("Window not created")?;
        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();
        Ok((display, handle))
    }

    /// Shared handle for callers that outlive a borrow of self (title updates)
    pub fn winit_window(&self) -> Option<Arc<Window>> {
        self.host.window.clone()
    }
}

impl WindowEvents for DesktopWindow {
    fn extent(&self) -> vk::Extent2D {
        match &self.host.window {
            Some(window) => {
                let size = window.inner_size();
                vk::Extent2D {
                    width: size.width,
                    height: size.height,
                }
            }
            None => vk::Extent2D::default(),
        }
    }

    fn poll_events(&mut self) {
        self.pump(Some(Duration::ZERO));
    }

    fn wait_events(&mut self) {
        self.pump(None);
    }

    fn close_requested(&self) -> bool {
        self.host.close_requested
    }

    fn resize_signal(&self) -> ResizeSignal {
        self.host.resize.clone()
    }
}
