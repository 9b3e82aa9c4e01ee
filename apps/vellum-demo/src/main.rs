//! Vellum Demo
//!
//! Runs a small frame loop against the GPU core: per-frame constants from the
//! upload buffer, transient constant buffers whose descriptors are recycled
//! once their frame retires, and a long-lived structured buffer bounced
//! between compute and copy states.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p vellum-demo -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `-n, --frames <N>`: Number of frames to run (default: 120)
//! - `--vulkan`: Run on a Vulkan 1.3 device instead of the headless one
//! - `--validation`: Enable the Khronos validation layer (Vulkan only)
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::sync::Arc;
use std::time::Instant;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
#[cfg(feature = "profiling-tracy")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vellum_gpu::headless::HeadlessDevice;
use vellum_gpu::vulkan::VulkanDeviceBuilder;
use vellum_gpu::{
    Buffer, BufferKind, CommandListType, CommandQueue, DescriptorHeapType, GpuConfig, GpuDevice,
    GpuSession, ResourceState, ALL_SUBRESOURCES,
};

const DEFAULT_FRAMES: u64 = 120;
const PARTICLE_COUNT: u32 = 4096;
const STATS_INTERVAL: u64 = 30;

/// Constants uploaded once per frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FrameConstants {
    frame: u32,
    particle_count: u32,
    elapsed_seconds: f32,
    _pad: u32,
}

/// Command line options.
struct DemoArgs {
    frames: u64,
    vulkan: bool,
    validation: bool,
}

impl Default for DemoArgs {
    fn default() -> Self {
        Self {
            frames: DEFAULT_FRAMES,
            vulkan: false,
            validation: false,
        }
    }
}

impl DemoArgs {
    /// Parse options from command line arguments.
    fn from_args() -> Self {
        let mut options = Self::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-n" | "--frames" => {
                    if i + 1 < args.len() {
                        if let Ok(v) = args[i + 1].parse() {
                            options.frames = v;
                            i += 1;
                        }
                    }
                }
                "--vulkan" => options.vulkan = true,
                "--validation" => options.validation = true,
                other => tracing::warn!("Ignoring unknown argument '{other}'"),
            }
            i += 1;
        }

        options
    }
}

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    init_logging();

    let args = DemoArgs::from_args();
    let config = GpuConfig::default();

    if args.vulkan {
        let device = VulkanDeviceBuilder::new()
            .app_name("Vellum Demo")
            .validation(args.validation)
            .build()?;
        info!("Running on {}", device.context().capabilities().summary());
        run_frames(Arc::new(GpuSession::new(Arc::new(device), config)), args.frames)
    } else {
        info!("Running on the headless device");
        run_frames(
            Arc::new(GpuSession::new(Arc::new(HeadlessDevice::auto_retire()), config)),
            args.frames,
        )
    }
}

fn init_logging() {
    #[cfg(feature = "profiling-tracy")]
    {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,vellum_gpu=trace,vellum_demo=trace"));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }
}

fn run_frames<D: GpuDevice>(session: Arc<GpuSession<D>>, frames: u64) -> anyhow::Result<()> {
    let queue = CommandQueue::new(Arc::clone(&session), CommandListType::Direct)?;
    let frames_in_flight = u64::from(session.config().frames_in_flight.max(1));
    let mut frame_fences = vec![0; frames_in_flight as usize];

    let particles = Buffer::new(
        &session,
        BufferKind::Structured,
        PARTICLE_COUNT,
        16,
        "particles",
    )?;

    let start = Instant::now();
    for frame in 0..frames {
        let slot = (frame % frames_in_flight) as usize;

        // The slot's previous frame must retire before its descriptors return.
        queue.wait_for_fence_value(frame_fences[slot], None)?;
        if let Some(retired) = frame.checked_sub(frames_in_flight) {
            session.release_stale_descriptors(retired);
        }

        let mut list = queue.get_command_list()?;

        let constants = FrameConstants {
            frame: frame as u32,
            particle_count: PARTICLE_COUNT,
            elapsed_seconds: start.elapsed().as_secs_f32(),
            _pad: 0,
        };
        let upload = list.allocate_constants(&constants)?;

        // Lives for one frame; its view goes stale when it drops below.
        let transient = Buffer::new(&session, BufferKind::Constant, 1, 256, "transient constants")?;
        let mut bytes = vec![0; transient.size_in_bytes() as usize];
        bytes[..std::mem::size_of::<FrameConstants>()].copy_from_slice(bytemuck::bytes_of(&constants));
        list.copy_buffer(transient.resource(), &bytes)?;
        list.transition_barrier(
            transient.resource(),
            ResourceState::VERTEX_AND_CONSTANT_BUFFER,
            ALL_SUBRESOURCES,
            false,
        );
        list.track_resource(transient.resource());

        list.transition_barrier(
            particles.resource(),
            ResourceState::UNORDERED_ACCESS,
            ALL_SUBRESOURCES,
            false,
        );
        list.uav_barrier(Some(particles.resource()), false);
        list.transition_barrier(
            particles.resource(),
            ResourceState::NON_PIXEL_SHADER_RESOURCE,
            ALL_SUBRESOURCES,
            true,
        );

        frame_fences[slot] = queue.execute_command_list(list)?;
        debug!(
            "Frame {frame}: constants at {:#x}, fence {}",
            upload.gpu_address(),
            frame_fences[slot]
        );
        drop(transient);

        session.advance_frame();

        if frame % STATS_INTERVAL == 0 {
            let descriptors = session.descriptor_allocator(DescriptorHeapType::CbvSrvUav);
            info!(
                "Frame {frame}: {} descriptor pages, {} lists queued, {} tracked resources",
                descriptors.num_pages(),
                queue.num_queued_command_lists(),
                session.num_tracked_resources()
            );
        }
    }

    queue.flush()?;
    info!(
        "Ran {frames} frames in {:.2?} (fence value {})",
        start.elapsed(),
        queue.last_signaled_value()
    );

    Ok(())
}

fn print_help() {
    eprintln!(
        "Vellum Demo

USAGE:
    cargo run -p vellum-demo -- [OPTIONS]

OPTIONS:
    -n, --frames <N>        Number of frames to run (default: 120)
    --vulkan                Run on a Vulkan 1.3 device instead of the headless one
    --validation            Enable the Khronos validation layer (Vulkan only)
    -h, --help              Print this help message

EXAMPLES:
    # Headless frame loop
    cargo run -p vellum-demo

    # A longer run on real hardware with validation
    cargo run -p vellum-demo -- --vulkan --validation -n 1000

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
