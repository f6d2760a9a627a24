//! Ray tracing pipeline driver for the Prism ray tracer.
//!
//! This crate turns a triangle scene and a precompiled program blob into
//! rendered frames on any [`RayTracingDevice`](prism_gpu::RayTracingDevice):
//! - Acceleration structure build and compaction
//! - Program module, program group and pipeline assembly
//! - Shader binding table packing
//! - Per-frame launch orchestration and readback
//!
//! # Example
//!
//! ```ignore
//! use prism_rtx::{Renderer, RendererConfig};
//!
//! let mut renderer = Renderer::new(device, &scene, &blob, RendererConfig::default())?;
//! renderer.resize(1200, 1024)?;
//! renderer.set_camera(camera)?;
//! renderer.render()?;
//! renderer.download_pixels(&mut pixels)?;
//! ```

pub mod acceleration;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod renderer;
pub mod sbt;

pub use acceleration::AccelerationStructure;
pub use config::{EntryPoints, RendererConfig};
pub use error::{RenderError, Result};
pub use pipeline::{ProgramGroups, RayTracingPipeline};
pub use renderer::{Renderer, RendererState};
pub use sbt::DispatchTable;
