//! rt-refit: hardware ray tracer with per-frame TLAS refit
//!
//! Renders an imported mesh spinning above a ground cube. Every frame the
//! top-level acceleration structure is refit in place and the per-frame
//! shader tables are rewritten before the trace is dispatched.

use std::error::Error;
use std::path::PathBuf;
use std::time::Instant;

use ash::vk as avk;
use clap::{Parser, Subcommand, ValueEnum};
use glam::{Mat4, Vec3};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::application::ApplicationHandler;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

use rt_refit::geometry::StagingBuffers;
use rt_refit::gpu::ResourceState;
use rt_refit::vk::{present, Swapchain, VulkanBackend, VulkanDevice, VulkanInstance};
use rt_refit::{AppConfig, CommandList, NullDevice, RayTracer};

const REPORT_EVERY_FRAMES: u32 = 30;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Parser)]
#[command(name = "rt-refit")]
#[command(version = "0.1.0")]
#[command(about = "Hardware ray tracer with per-frame TLAS refit")]
#[command(long_about = "
rt-refit renders an imported OBJ model above a ground cube with hardware ray
tracing. The model spins about +Y; every frame refits the top-level
acceleration structure and rewrites that frame's shader tables.

Example usage:
  rt-refit run --config config.yaml
  rt-refit --mesh assets/bunny.obj dry-run --frames 300
  rt-refit check-config --config config.yaml
")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Model to load; overrides scene.mesh_path, or stands in for a config file
    #[arg(short, long, global = true)]
    mesh: Option<PathBuf>,

    /// Set logging level (trace, debug, info, warn, error)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a window and render with Vulkan ray tracing
    Run,

    /// Drive the frame loop against the headless device and report counts
    DryRun {
        /// Number of frames to record
        #[arg(short, long, default_value_t = 120)]
        frames: u32,
    },

    /// Validate configuration file
    CheckConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = cli.log_level {
        logger.parse_filters(&level.to_string());
    }
    logger.init();

    let config = resolve_config(cli.config, cli.mesh)?;

    match cli.command {
        Commands::Run => run_windowed(config)?,
        Commands::DryRun { frames } => dry_run(&config, frames)?,
        Commands::CheckConfig => check_config(&config),
    }

    Ok(())
}

fn resolve_config(
    config_path: Option<PathBuf>,
    mesh: Option<PathBuf>,
) -> Result<AppConfig, Box<dyn Error>> {
    let mut config = match (config_path, &mesh) {
        (Some(path), _) => {
            log::info!("Loading configuration from {path:?}");
            AppConfig::from_file(path)?
        }
        (None, Some(mesh)) => AppConfig::for_mesh(mesh),
        (None, None) => return Err("either --config or --mesh is required".into()),
    };
    if let Some(mesh) = mesh {
        config.scene.mesh_path = mesh;
    }
    config.validate()?;
    Ok(config)
}

fn check_config(config: &AppConfig) {
    println!("Configuration is valid");
    println!(
        "  Viewport:         {}x{}",
        config.viewport.width, config.viewport.height
    );
    println!("  Frames in flight: {}", config.frames.frames_in_flight);
    println!("  Mesh:             {}", config.scene.mesh_path.display());
    println!(
        "  Placement:        position {:?}, scale {}",
        config.scene.position, config.scene.scale
    );
    println!(
        "  Rotation step:    {} deg/frame",
        config.scene.rotation_step_degrees
    );
    println!(
        "  Shader library:   {}",
        config.shaders.library_path.display()
    );
    for path in [&config.scene.mesh_path, &config.shaders.library_path] {
        if !path.exists() {
            println!("  warning: {} does not exist", path.display());
        }
    }
}

fn camera(config: &AppConfig) -> (Vec3, Mat4) {
    let aspect = config.viewport.width as f32 / config.viewport.height as f32;
    (config.camera.eye(), config.camera.view_proj(aspect))
}

/// Runs the frame loop against the null device.
fn dry_run(config: &AppConfig, frames: u32) -> Result<(), Box<dyn Error>> {
    let mut device = NullDevice::new();
    let mut cmd = CommandList::new();
    let mut staging = StagingBuffers::new();

    let mut tracer = RayTracer::initialize(&mut device, &mut cmd, &mut staging, config)?;
    device.execute(&cmd)?;
    staging.release(&mut device);

    let (eye, view_proj) = camera(config);
    let frames_in_flight = tracer.frames_in_flight();
    let start = Instant::now();
    for n in 0..frames {
        let frame = n % frames_in_flight;
        cmd.clear();
        tracer.advance_frame(&mut device, frame, eye, view_proj)?;
        tracer.render_frame(&mut device, frame, &mut cmd)?;
        tracer.output_image(frame, Some(ResourceState::CopySource), &mut cmd)?;
        device.execute(&cmd)?;
    }

    let stats = device.stats();
    log::info!(
        "Dry run finished: {frames} frames in {:.2} ms",
        start.elapsed().as_secs_f64() * 1000.0
    );
    println!("Frames rendered:  {}", tracer.frames_rendered());
    println!("Full builds:      {}", stats.full_builds);
    println!("Refits:           {}", stats.refits);
    println!("Dispatches:       {}", stats.dispatches);
    println!("Final angle:      {:.4} rad", tracer.angle());
    Ok(())
}

struct Renderer {
    swapchain: Swapchain,
    tracer: RayTracer,
    frame_list: CommandList,
    command_pool: avk::CommandPool,
    command_buffers: Vec<avk::CommandBuffer>,
    // Per frame in flight
    image_available: Vec<avk::Semaphore>,
    in_flight_fences: Vec<avk::Fence>,
    // Per swapchain image
    render_finished: Vec<avk::Semaphore>,
    frame: u32,
    eye: Vec3,
    view_proj: Mat4,
    last_time: Instant,
    frame_count: u32,
    frame_time_sum: f32,
    // Dropped after everything above; the backend owns the device
    backend: VulkanBackend,
    _vk_instance: VulkanInstance,
}

impl Renderer {
    fn new(window: &Window, config: &AppConfig) -> Result<Self, Box<dyn Error>> {
        let display_handle = window.display_handle()?.as_raw();
        let window_handle = window.window_handle()?.as_raw();

        let vk_instance =
            VulkanInstance::new(display_handle, window_handle, cfg!(debug_assertions))?;
        let vk_dev = VulkanDevice::new(&vk_instance)?;
        let size = window.inner_size();
        let swapchain = Swapchain::new(&vk_instance, &vk_dev, size.width, size.height)?;
        let mut backend = VulkanBackend::new(vk_dev)?;

        let mut init = CommandList::new();
        let mut staging = StagingBuffers::new();
        let tracer = RayTracer::initialize(&mut backend, &mut init, &mut staging, config)?;
        backend.submit_one_time(&init)?;
        staging.release(&mut backend);
        log::info!(
            "Acceleration structures built ({} init commands)",
            init.len()
        );

        let vk_dev = backend.vk_device();
        let device = &vk_dev.device;
        let command_pool = vk_dev.create_command_pool()?;
        let frames = tracer.frames_in_flight();
        let alloc_info = avk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(avk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames);

        let sem_info = avk::SemaphoreCreateInfo::default();
        let fence_info = avk::FenceCreateInfo::default().flags(avk::FenceCreateFlags::SIGNALED);
        let (command_buffers, image_available, in_flight_fences, render_finished) = unsafe {
            let command_buffers = device.allocate_command_buffers(&alloc_info)?;
            let image_available = (0..frames)
                .map(|_| device.create_semaphore(&sem_info, None))
                .collect::<Result<Vec<_>, _>>()?;
            let in_flight_fences = (0..frames)
                .map(|_| device.create_fence(&fence_info, None))
                .collect::<Result<Vec<_>, _>>()?;
            let render_finished = (0..swapchain.images.len())
                .map(|_| device.create_semaphore(&sem_info, None))
                .collect::<Result<Vec<_>, _>>()?;
            (command_buffers, image_available, in_flight_fences, render_finished)
        };

        let (eye, view_proj) = camera(config);

        Ok(Renderer {
            swapchain,
            tracer,
            frame_list: CommandList::new(),
            command_pool,
            command_buffers,
            image_available,
            in_flight_fences,
            render_finished,
            frame: 0,
            eye,
            view_proj,
            last_time: Instant::now(),
            frame_count: 0,
            frame_time_sum: 0.0,
            backend,
            _vk_instance: vk_instance,
        })
    }

    fn report_frame_time(&mut self) {
        let now = Instant::now();
        let frame_time_ms = now.duration_since(self.last_time).as_secs_f32() * 1000.0;
        self.last_time = now;

        self.frame_count += 1;
        self.frame_time_sum += frame_time_ms;
        if self.frame_count >= REPORT_EVERY_FRAMES {
            let avg_frame_time = self.frame_time_sum / self.frame_count as f32;
            log::info!(
                "[Frame {:<6}] {:.2} ms/frame ({:.1} FPS), angle {:.3}",
                self.tracer.frames_rendered(),
                avg_frame_time,
                1000.0 / avg_frame_time,
                self.tracer.angle()
            );
            self.frame_count = 0;
            self.frame_time_sum = 0.0;
        }
    }

    fn render_frame(&mut self) -> Result<(), Box<dyn Error>> {
        let fi = self.frame as usize;
        let fence = self.in_flight_fences[fi];
        let device = self.backend.vk_device().device.clone();

        // The frame's tables and instance block are rewritten below, so its
        // previous submission must be complete
        unsafe { device.wait_for_fences(&[fence], true, u64::MAX)? };

        let acquired = unsafe {
            self.backend.vk_device().swapchain_loader.acquire_next_image(
                self.swapchain.swapchain,
                u64::MAX,
                self.image_available[fi],
                avk::Fence::null(),
            )
        };
        let image_index = match acquired {
            Ok((index, _suboptimal)) => index,
            // TODO: recreate the swapchain on resize instead of skipping frames
            Err(avk::Result::ERROR_OUT_OF_DATE_KHR) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        unsafe { device.reset_fences(&[fence])? };

        self.report_frame_time();

        self.frame_list.clear();
        self.tracer
            .advance_frame(&mut self.backend, self.frame, self.eye, self.view_proj)?;
        self.tracer
            .render_frame(&mut self.backend, self.frame, &mut self.frame_list)?;
        let output = self
            .tracer
            .output_image(
                self.frame,
                Some(ResourceState::CopySource),
                &mut self.frame_list,
            )?
            .image();

        let cmd = self.command_buffers[fi];
        unsafe {
            device.reset_command_buffer(cmd, avk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(
                cmd,
                &avk::CommandBufferBeginInfo::default()
                    .flags(avk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
        }
        self.backend.record(cmd, &self.frame_list)?;
        let output = self
            .backend
            .image(output)
            .ok_or("output image missing from backend")?;
        present::record_present_blit(
            &device,
            cmd,
            output,
            self.swapchain.images[image_index as usize],
            self.swapchain.extent,
        );
        unsafe { device.end_command_buffer(cmd)? };

        let wait_semaphores = [self.image_available[fi]];
        let wait_stages = [avk::PipelineStageFlags::TRANSFER];
        let signal_semaphores = [self.render_finished[image_index as usize]];
        let submit_info = avk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(std::slice::from_ref(&cmd))
            .signal_semaphores(&signal_semaphores);
        let queue = self.backend.vk_device().queue;
        unsafe { device.queue_submit(queue, &[submit_info], fence)? };

        let swapchains = [self.swapchain.swapchain];
        let image_indices = [image_index];
        let present_info = avk::PresentInfoKHR::default()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let presented = unsafe {
            self.backend
                .vk_device()
                .swapchain_loader
                .queue_present(queue, &present_info)
        };
        match presented {
            Ok(_) | Err(avk::Result::ERROR_OUT_OF_DATE_KHR) => {}
            Err(err) => return Err(err.into()),
        }

        self.frame = (self.frame + 1) % self.tracer.frames_in_flight();
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let vk_dev = self.backend.vk_device();
        let device = &vk_dev.device;
        unsafe {
            device.device_wait_idle().ok();
            for sem in self.image_available.iter().chain(&self.render_finished) {
                device.destroy_semaphore(*sem, None);
            }
            for fence in &self.in_flight_fences {
                device.destroy_fence(*fence, None);
            }
            device.destroy_command_pool(self.command_pool, None);
        }
        self.swapchain.destroy(vk_dev);
    }
}

struct App {
    config: AppConfig,
    window: Option<Window>,
    renderer: Option<Renderer>,
    error: Option<Box<dyn Error>>,
}

impl App {
    fn new(config: AppConfig) -> Self {
        App {
            config,
            window: None,
            renderer: None,
            error: None,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: Box<dyn Error>) {
        log::error!("{err}");
        self.error = Some(err);
        self.renderer = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attrs = Window::default_attributes()
            .with_title("rt-refit")
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.viewport.width,
                self.config.viewport.height,
            ));

        let window = match event_loop.create_window(attrs) {
            Ok(window) => window,
            Err(err) => return self.fail(event_loop, err.into()),
        };
        match Renderer::new(&window, &self.config) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(err) => return self.fail(event_loop, err),
        }
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested
            | WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(KeyCode::Escape),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => {
                self.renderer = None;
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Some(renderer) = self.renderer.as_mut() {
                    if let Err(err) = renderer.render_frame() {
                        return self.fail(event_loop, err);
                    }
                }
                if let Some(window) = self.window.as_ref() {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }
}

fn run_windowed(config: AppConfig) -> Result<(), Box<dyn Error>> {
    log::info!(
        "Rendering {} at {}x{} with {} frames in flight (Escape quits)",
        config.scene.mesh_path.display(),
        config.viewport.width,
        config.viewport.height,
        config.frames.frames_in_flight
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
