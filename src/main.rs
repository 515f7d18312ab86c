// =============================================================================
// FRAMEPACE - Vulkan frame loop harness
// =============================================================================
//
// Opens a window, builds a device and a clear-only render pass, and drives
// the frame loop until the window closes or Escape is pressed.
//
// FRAME FLOW:
// 1. Wait for the frame slot's fence
// 2. Acquire swapchain image (rebuild the surface if it went stale)
// 3. Record: uniform write, compute -> graphics tint handoff, clear pass
// 4. Submit compute, then graphics
// 5. Present, advance the slot ring
//
// =============================================================================

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use framepace::backend::{ClearPassRecorder, FrameUniform, VulkanDevice, VulkanSwapchain};
use framepace::config::Config;
use framepace::frame::{CoordinatorSettings, FrameReport, SubmissionCoordinator};
use framepace::window::DesktopWindow;
use framepace::FrameResult;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging
    init_logging(&config)?;
    log::info!("Starting framepace");
    log::info!("Present mode: {}", config.graphics.present_mode);
    log::info!(
        "Frames in flight: {}{}",
        config.graphics.max_frames_in_flight,
        if config.graphics.compute_lane { ", compute lane" } else { "" }
    );

    if let Err(e) = run(&config) {
        log::error!("Fatal: {:#}", e);
        return Err(e);
    }
    Ok(())
}

/// Initialize logging with optional file output
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);

    if config.debug.log_to_file {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {}", config.debug.log_file))?;
        writeln!(file, "=== framepace log ===")?;
        writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

fn run(config: &Config) -> Result<()> {
    let mut window = DesktopWindow::open(&config.window)?;
    let (display_handle, window_handle) = window.raw_handles()?;

    let device = VulkanDevice::new(
        &config.window.title,
        config.debug.validation_layers,
        display_handle,
        window_handle,
    )?;

    let swapchain = VulkanSwapchain::new(device.clone(), config.get_present_mode())
        .context("Failed to set up swapchain")?;
    let render_pass = swapchain.render_pass();

    let settings = CoordinatorSettings::from_config(&config.graphics, FrameUniform::SIZE);
    let mut recorder = ClearPassRecorder::new(
        device.clone(),
        render_pass,
        config.graphics.clear_color,
        settings.frames_in_flight,
        settings.compute_lane,
    )
    .context("Failed to create frame recorder")?;

    let mut coordinator = SubmissionCoordinator::new(device.clone(), swapchain, &mut window, settings)
        .context("Failed to create frame coordinator")?;

    let mut fps = FpsCounter::new(config, window.winit_window());
    let result = coordinator.run(&mut window, &mut recorder, |report| fps.frame(report));

    // Surface and slots go before the recorder; the device goes last
    let shutdown = coordinator.shutdown();
    drop(recorder);
    drop(coordinator);

    let frames = loop_outcome(result, shutdown)?;
    log::info!("Rendered {} frames", frames);
    Ok(())
}

/// The loop error wins over a shutdown error that follows from it
fn loop_outcome(result: FrameResult<u64>, shutdown: FrameResult<()>) -> Result<u64> {
    match (result, shutdown) {
        (Ok(frames), Ok(())) => Ok(frames),
        (Ok(_), Err(e)) => Err(e).context("Failed to shut down frame coordinator"),
        (Err(e), shutdown) => {
            if let Err(shutdown_error) = shutdown {
                log::error!("Shutdown after frame loop failure also failed: {}", shutdown_error);
            }
            Err(e).context("Frame loop failed")
        }
    }
}

// =============================================================================
// FPS TRACKING
// =============================================================================

struct FpsCounter {
    title: String,
    window: Option<Arc<winit::window::Window>>,
    enabled: bool,
    frame_count: u32,
    fence_wait: Duration,
    last_frame_time: Instant,
    last_fps_update: Instant,
}

impl FpsCounter {
    fn new(config: &Config, window: Option<Arc<winit::window::Window>>) -> Self {
        let now = Instant::now();
        Self {
            title: config.window.title.clone(),
            window,
            enabled: config.debug.show_fps,
            frame_count: 0,
            fence_wait: Duration::ZERO,
            last_frame_time: now,
            last_fps_update: now,
        }
    }

    fn frame(&mut self, report: &FrameReport) {
        if !self.enabled {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;
        self.fence_wait += report.fence_wait;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            let avg_wait = self.fence_wait.as_secs_f32() * 1000.0 / self.frame_count as f32;

            if let Some(window) = &self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms, fence wait {:.2}ms) #{}",
                    self.title,
                    fps,
                    frame_time * 1000.0,
                    avg_wait,
                    report.frame_number
                ));
            }

            self.frame_count = 0;
            self.fence_wait = Duration::ZERO;
            self.last_fps_update = now;
        }
    }
}
