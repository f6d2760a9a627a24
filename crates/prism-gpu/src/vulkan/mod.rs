//! Hardware backend on `VK_KHR_ray_tracing_pipeline`.

mod accel;
pub mod command;
pub mod context;
mod device;
pub mod instance;
pub mod memory;

pub use context::{VulkanContext, VulkanDeviceBuilder};
pub use device::VulkanDevice;
pub use memory::{GpuAllocator, GpuBuffer};
