//! Ray tracing device layer for Prism.
//!
//! This crate provides:
//! - The [`RayTracingDevice`] trait every backend implements
//! - Device pointers and opaque program handles
//! - Typed device buffers on top of raw allocations
//! - A hardware backend on Vulkan ray tracing pipelines (`vulkan` feature)

pub mod buffer;
pub mod capabilities;
pub mod device;
pub mod error;
pub mod handle;
pub mod spirv;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use buffer::DeviceBuffer;
pub use capabilities::{
    GpuCapabilities, GpuVendor, RayTracingCapabilities, REQUIRED_RAY_TRACING_EXTENSIONS,
};
pub use device::{
    AccelBufferSizes, AccelBuildOptions, DebugLevel, GeometryFlags, LaunchDims,
    ModuleCompileOptions, OptimizationLevel, PipelineCompileOptions, PipelineLinkOptions,
    ProgramGroupDesc, ProgramGroupKind, RayTracingDevice, SbtRecordLayout, ShaderBindingTable,
    StackSizes, TraversableGraph, TriangleArrayInput, INDEX_TRIPLE_STRIDE, VERTEX_STRIDE,
};
pub use error::{GpuError, Result};
pub use handle::{
    BufferId, DevicePtr, ModuleHandle, PipelineHandle, ProgramGroupHandle, RawBuffer,
    TraversableHandle,
};
#[cfg(feature = "vulkan")]
pub use vulkan::{VulkanDevice, VulkanDeviceBuilder};
