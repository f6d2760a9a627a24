//! Prism Viewer - renders the stock two-box scene or an OBJ model to a PNG.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p prism-viewer -- [OPTIONS]
//! ```
//!
//! # Options
//!
//! - `-W, --width <PIXELS>` - Frame width (default: 1200)
//! - `-H, --height <PIXELS>` - Frame height (default: 1024)
//! - `-o, --output <PATH>` - PNG to write (default: prism.png)
//! - `-b, --blob <PATH>` - Compiled program blob
//! - `-m, --model <PATH>` - OBJ scene (default: the stock two boxes)
//! - `--backend <host|vulkan>` - Device to render on (default: host)
//! - `--hits <PATH>` - Also write per-pixel hit positions as text
//! - `-h, --help` - Show help message
//!
//! # Examples
//!
//! ```bash
//! # Reference render on the CPU
//! cargo run -p prism-viewer -- -o boxes.png
//!
//! # Reference render of a model file
//! cargo run -p prism-viewer -- -m sponza.obj -o sponza.png
//!
//! # Hardware render from compiled SPIR-V
//! cargo run -p prism-viewer --features vulkan -- --backend vulkan -b radiance.spv
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Log filter (default: info)

mod config;
mod output;

use anyhow::Context;
use glam::Vec3;
use prism_gpu::RayTracingDevice;
use prism_host::HostDevice;
use prism_rtx::{Renderer, RendererConfig};
use prism_shaders::ProgramBlob;
use tracing_subscriber::EnvFilter;

use crate::config::{Backend, ViewerConfig};

fn print_help() {
    eprintln!("Prism Viewer - renders the stock two-box scene or an OBJ model to a PNG");
    eprintln!();
    eprintln!("Usage: prism-viewer [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -W, --width <PIXELS>      Frame width (default: 1200)");
    eprintln!("  -H, --height <PIXELS>     Frame height (default: 1024)");
    eprintln!("  -o, --output <PATH>       PNG to write (default: prism.png)");
    eprintln!("  -b, --blob <PATH>         Compiled program blob");
    eprintln!("  -m, --model <PATH>        OBJ scene (default: the stock two boxes)");
    eprintln!("      --backend <BACKEND>   host or vulkan (default: host)");
    eprintln!("      --hits <PATH>         Write per-pixel hit positions as text");
    eprintln!("  -h, --help                Show this help message");
    eprintln!();
    eprintln!("Environment Variables:");
    eprintln!("  RUST_LOG                  Log filter (default: info)");
}

fn main() -> anyhow::Result<()> {
    let config = ViewerConfig::from_args()?;
    if config.help {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match config.backend {
        Backend::Host => {
            let blob = match &config.blob {
                Some(path) => ProgramBlob::load(path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => ProgramBlob::host_reference(),
            };
            run(HostDevice::new(), &blob, &config)
        }
        Backend::Vulkan => run_vulkan(&config),
    }
}

#[cfg(feature = "vulkan")]
fn run_vulkan(config: &ViewerConfig) -> anyhow::Result<()> {
    let path = config
        .blob
        .as_ref()
        .context("the vulkan backend needs a SPIR-V blob, pass --blob")?;
    let blob =
        ProgramBlob::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    let device = prism_gpu::VulkanDeviceBuilder::new()
        .app_name("Prism Viewer")
        .validation(cfg!(debug_assertions))
        .build()
        .context("failed to create the Vulkan device")?;
    run(device, &blob, config)
}

#[cfg(not(feature = "vulkan"))]
fn run_vulkan(_config: &ViewerConfig) -> anyhow::Result<()> {
    anyhow::bail!("prism-viewer was built without the `vulkan` feature")
}

/// Render one frame of the configured scene on `device` and write the outputs.
fn run<D: RayTracingDevice>(device: D, blob: &ProgramBlob, config: &ViewerConfig) -> anyhow::Result<()> {
    tracing::info!("Rendering on {}", device.name());

    let (scene, camera) = config.scene()?;
    let mut renderer = Renderer::new(device, &scene, blob, RendererConfig::default())
        .context("failed to set up the renderer")?;
    renderer.resize(config.width, config.height)?;
    renderer.set_camera(camera)?;
    renderer.render()?;

    let count = config.width as usize * config.height as usize;
    let mut pixels = vec![0u32; count];
    renderer.download_pixels(&mut pixels)?;
    output::save_png(&config.output, config.width, config.height, &pixels)?;

    if let Some(path) = &config.hits {
        let mut positions = vec![Vec3::ZERO; count];
        renderer.download_hit_positions(&mut positions)?;
        output::save_hits(path, config.width, &positions)?;
    }
    Ok(())
}
